//! Matchmaking and the session registry

pub mod queue;
pub mod registry;

pub use registry::{AuthError, JoinOutcome, SessionRegistry};
