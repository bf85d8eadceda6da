//! Engine event bus.
//!
//! The core emits explicit events after a settlement commits; anything
//! presentation-side (cache invalidation, notifications, websockets)
//! subscribes here. The engine knows nothing about caches or routes.

use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    RoundResolved {
        round_id: i64,
        season_id: i64,
        users_scored: usize,
        points_awarded: i64,
    },
    BetLocked {
        bet_id: i64,
    },
    BetSettled {
        bet_id: i64,
        correct_option: String,
        winners: usize,
        total_paid: i64,
    },
    EmergencyStop {
        bets_ended: usize,
        stakes_refunded: i64,
    },
}

pub type EventSender = broadcast::Sender<EngineEvent>;
pub type EventReceiver = broadcast::Receiver<EngineEvent>;

pub fn channel(capacity: usize) -> (EventSender, EventReceiver) {
    broadcast::channel(capacity)
}
