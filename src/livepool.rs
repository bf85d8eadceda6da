//! Live pool engine.
//!
//! Short-horizon markets that accept stakes while open, lock on a
//! countdown, and settle one outcome per bet. Placements against one bet
//! are serialized through the shared connection plus a SQL transaction,
//! so concurrent stakes cannot lose pool updates.
//!
//! Settlement uses the static per-option American odds stored on the bet
//! at creation time; the pool share per option is display-only. An
//! emergency stop ends every open or locked bet and refunds outstanding
//! stakes into the payout ledger.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::events::{EngineEvent, EventSender};
use crate::models::{Caller, LiveBet, LiveBetStatus};
use crate::scoring::american_odds_multiplier;
use crate::store::{self, GameDb};

#[derive(Debug, Clone, Serialize)]
pub struct PlacementReceipt {
    pub placement_id: i64,
    pub bet_id: i64,
    pub option: String,
    pub stake: i64,
    pub total_pool: i64,
}

/// Display share of the pool for one option.
#[derive(Debug, Clone, Serialize)]
pub struct PoolShare {
    pub option: String,
    pub staked: i64,
    pub share: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SettlementSummary {
    pub bet_id: i64,
    pub correct_option: String,
    pub already_resolved: bool,
    pub winners: usize,
    pub total_paid: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopSummary {
    pub bets_ended: usize,
    pub stakes_refunded: i64,
}

#[derive(Clone)]
pub struct LivePoolEngine {
    db: GameDb,
    events: EventSender,
}

impl LivePoolEngine {
    pub fn new(db: GameDb, events: EventSender) -> Self {
        Self { db, events }
    }

    /// Accept a stake on an open bet. One placement per user per bet;
    /// a second attempt is rejected, not merged.
    pub async fn place(
        &self,
        user_id: &str,
        bet_id: i64,
        option: &str,
        stake: i64,
        now: DateTime<Utc>,
    ) -> Result<PlacementReceipt, EngineError> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(EngineError::invalid("user_id required"));
        }
        if stake <= 0 {
            return Err(EngineError::invalid("stake must be positive"));
        }

        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;

        let bet = store::fetch_live_bet(&tx, bet_id)?
            .ok_or_else(|| EngineError::not_found(format!("live bet {bet_id}")))?;
        if bet.status != LiveBetStatus::Open {
            return Err(EngineError::invalid(format!(
                "live bet {bet_id} is {}",
                bet.status.as_str()
            )));
        }
        // Countdown check backs up the status flag.
        if now >= bet.locks_at {
            return Err(EngineError::invalid("live bet lock time has passed"));
        }
        if bet.option_odds(option).is_none() {
            return Err(EngineError::invalid(format!(
                "option {option:?} is not one of the bet's options"
            )));
        }
        let existing = store::fetch_placements(&tx, bet_id)?;
        if existing.iter().any(|p| p.user_id == user_id) {
            return Err(EngineError::invalid("user already placed on this bet"));
        }

        let placement_id = store::insert_placement(&tx, bet_id, user_id, option, stake, now)?;
        store::bump_live_pool(&tx, bet_id, stake)?;
        tx.commit()?;

        Ok(PlacementReceipt {
            placement_id,
            bet_id,
            option: option.to_string(),
            stake,
            total_pool: bet.total_pool + stake,
        })
    }

    /// Per-option pool breakdown for display ("community percentage").
    pub async fn pool_shares(&self, bet_id: i64) -> Result<Vec<PoolShare>, EngineError> {
        let bet = self
            .db
            .get_live_bet(bet_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("live bet {bet_id}")))?;
        let placements = self.db.live_bet_placements(bet_id).await?;

        let total: i64 = placements.iter().map(|p| p.stake).sum();
        Ok(bet
            .options
            .iter()
            .map(|opt| {
                let staked: i64 = placements
                    .iter()
                    .filter(|p| p.option == opt.label)
                    .map(|p| p.stake)
                    .sum();
                PoolShare {
                    option: opt.label.clone(),
                    staked,
                    share: if total > 0 {
                        staked as f64 / total as f64
                    } else {
                        0.0
                    },
                }
            })
            .collect())
    }

    /// Stop accepting placements. No-op if already locked.
    pub async fn lock(&self, caller: &Caller, bet_id: i64) -> Result<LiveBet, EngineError> {
        if !caller.is_admin() {
            return Err(EngineError::Unauthorized);
        }
        let conn = self.db.lock().await;
        let bet = store::fetch_live_bet(&conn, bet_id)?
            .ok_or_else(|| EngineError::not_found(format!("live bet {bet_id}")))?;
        match bet.status {
            LiveBetStatus::Open => {
                store::set_live_bet_status(&conn, bet_id, LiveBetStatus::Locked)?;
            }
            LiveBetStatus::Locked => return Ok(bet),
            LiveBetStatus::Resolved | LiveBetStatus::Ended => {
                return Err(EngineError::invalid(format!(
                    "live bet {bet_id} is {}",
                    bet.status.as_str()
                )))
            }
        }
        drop(conn);
        let _ = self.events.send(EngineEvent::BetLocked { bet_id });
        self.db
            .get_live_bet(bet_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("live bet {bet_id}")))
    }

    /// Settle one outcome. Winning placements pay
    /// `round(stake * m(option_odds) * multiplier)`. Idempotent: settling
    /// an already-resolved bet is a no-op success.
    pub async fn settle(
        &self,
        caller: &Caller,
        bet_id: i64,
        correct_option: &str,
    ) -> Result<SettlementSummary, EngineError> {
        if !caller.can_resolve() {
            return Err(EngineError::Unauthorized);
        }

        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;

        let bet = store::fetch_live_bet(&tx, bet_id)?
            .ok_or_else(|| EngineError::not_found(format!("live bet {bet_id}")))?;
        if bet.status == LiveBetStatus::Resolved {
            return Ok(SettlementSummary {
                bet_id,
                correct_option: bet.correct_option.unwrap_or_default(),
                already_resolved: true,
                winners: 0,
                total_paid: 0,
            });
        }
        if bet.status == LiveBetStatus::Ended {
            return Err(EngineError::invalid(format!(
                "live bet {bet_id} was ended by emergency stop"
            )));
        }
        let odds = bet.option_odds(correct_option).ok_or_else(|| {
            EngineError::invalid(format!(
                "option {correct_option:?} is not one of the bet's options"
            ))
        })?;

        let now = Utc::now();
        let multiplier = american_odds_multiplier(odds) * bet.multiplier;
        let mut winners = 0;
        let mut total_paid = 0;
        for placement in store::fetch_placements(&tx, bet_id)? {
            if placement.option != correct_option {
                continue;
            }
            let amount = (placement.stake as f64 * multiplier).round() as i64;
            store::insert_live_payout(
                &tx,
                &Uuid::new_v4().to_string(),
                bet_id,
                &placement.user_id,
                "payout",
                amount,
                now,
            )?;
            winners += 1;
            total_paid += amount;
        }
        store::set_live_bet_resolved(&tx, bet_id, correct_option)?;
        tx.commit()?;
        drop(conn);

        info!(bet_id, correct_option, winners, total_paid, "live bet settled");
        let _ = self.events.send(EngineEvent::BetSettled {
            bet_id,
            correct_option: correct_option.to_string(),
            winners,
            total_paid,
        });

        Ok(SettlementSummary {
            bet_id,
            correct_option: correct_option.to_string(),
            already_resolved: false,
            winners,
            total_paid,
        })
    }

    /// End every open or locked bet and refund outstanding stakes. No
    /// placement is accepted once the transition is recorded.
    pub async fn emergency_stop(&self, caller: &Caller) -> Result<StopSummary, EngineError> {
        if !caller.is_admin() {
            return Err(EngineError::Unauthorized);
        }

        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;

        let now = Utc::now();
        let mut bets_ended = 0;
        let mut stakes_refunded = 0;
        for bet in store::fetch_open_live_bets(&tx)? {
            for placement in store::fetch_placements(&tx, bet.id)? {
                store::insert_live_payout(
                    &tx,
                    &Uuid::new_v4().to_string(),
                    bet.id,
                    &placement.user_id,
                    "refund",
                    placement.stake,
                    now,
                )?;
                stakes_refunded += placement.stake;
            }
            store::set_live_bet_status(&tx, bet.id, LiveBetStatus::Ended)?;
            bets_ended += 1;
        }
        tx.commit()?;
        drop(conn);

        warn!(bets_ended, stakes_refunded, "emergency stop executed");
        let _ = self.events.send(EngineEvent::EmergencyStop {
            bets_ended,
            stakes_refunded,
        });

        Ok(StopSummary {
            bets_ended,
            stakes_refunded,
        })
    }
}
