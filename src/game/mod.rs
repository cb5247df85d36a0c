//! Game simulation modules

pub mod combat;
pub mod r#match;
pub mod player;
pub mod progression;
pub mod scheduler;
pub mod snapshot;
pub mod unit;

pub use player::{PlayerRecord, SharedPlayer};
pub use r#match::{EndReason, Match, MatchHandle, MatchKey, MatchPhase, TickOutcome};
pub use unit::UnitTemplates;
