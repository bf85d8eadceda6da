//! Settlement and scoring engine for a reality-TV prediction game.
//!
//! The library exposes every engine module so the binary and the
//! integration tests share one crate. `scoring` is pure math; `store`
//! owns SQLite; `resolution`, `badges`, `verify` and `livepool` are the
//! engines layered on top; `api` is the axum glue.

pub mod api;
pub mod badges;
pub mod error;
pub mod events;
pub mod livepool;
pub mod models;
pub mod resolution;
pub mod scoring;
pub mod store;
pub mod verify;
