//! Line protocol message definitions
//!
//! Every message is one UTF-8 line terminated by `\n`. The handshake and notices
//! are plain text; match state is one JSON object per line.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const AUTH_OK: &str = "Authentication successful";
pub const AUTH_FAILED: &str = "Authentication failed";

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMsg {
    AuthOk,
    AuthFailed,
    /// Matched with nobody yet
    Waiting,
    /// Both slots filled
    MatchStarted { opponent: String },
    /// Per-tick match state
    Snapshot(StateSnapshot),
    /// Match ended, `winner` is `None` for a draw
    GameOver { winner: Option<String> },
    /// Idle timeout cancelled a waiting match
    MatchCancelled,
    /// Free-form notice for this connection only
    Notice(String),
}

impl ServerMsg {
    /// Render as a single line without the trailing newline
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        Ok(match self {
            Self::Snapshot(snapshot) => serde_json::to_string(snapshot)?,
            other => other.to_string(),
        })
    }
}

impl fmt::Display for ServerMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthOk => f.write_str(AUTH_OK),
            Self::AuthFailed => f.write_str(AUTH_FAILED),
            Self::Waiting => f.write_str("Waiting for another player..."),
            Self::MatchStarted { opponent } => write!(f, "Game started with {opponent}"),
            Self::Snapshot(snapshot) => write!(
                f,
                "snapshot {} vs {}",
                snapshot.player1.username, snapshot.player2.username
            ),
            Self::GameOver { winner: Some(name) } => write!(f, "Game Over! Winner: {name}"),
            Self::GameOver { winner: None } => f.write_str("Game Over! Draw"),
            Self::MatchCancelled => f.write_str("No opponent found, match cancelled"),
            Self::Notice(text) => f.write_str(text),
        }
    }
}

/// Client-facing match state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub player1: PlayerSnapshot,
    pub player2: PlayerSnapshot,
    pub game_over: bool,
    /// Seconds left, negative once overtime
    pub time_remaining: i64,
}

/// Redacted view of one player
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    pub username: String,
    pub level: u32,
    pub mana: u32,
    pub towers: Vec<TowerSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TowerSnapshot {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "HP")]
    pub hp: i32,
}

/// Commands sent from client to server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Deploy { troop: String },
}

/// Unparseable client lines; the line is skipped
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty command")]
    Empty,

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("missing argument: {0}")]
    MissingArgument(&'static str),
}

impl ClientCommand {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let mut parts = line.split_whitespace();
        let verb = parts.next().ok_or(ProtocolError::Empty)?;

        match verb {
            "deploy" => {
                let troop = parts.next().ok_or(ProtocolError::MissingArgument("troop name"))?;
                Ok(Self::Deploy {
                    troop: troop.to_string(),
                })
            }
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}
