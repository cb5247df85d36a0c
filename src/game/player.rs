//! Player records - identity, progression, live loadout and mana

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::net::protocol::ServerMsg;

use super::unit::{Tower, Troop, UnitTemplates};

pub const MAX_MANA: u32 = 10;
pub const STARTING_MANA: u32 = 5;
pub const STARTING_LEVEL: u32 = 1;

/// The one live record of a player, shared between its connection and its match
pub type SharedPlayer = Arc<Mutex<PlayerRecord>>;

/// Outbound line queue of a single connection
#[derive(Debug, Clone)]
pub struct Outbound {
    /// Identifies the connection that owns the queue
    pub conn_id: Uuid,
    tx: mpsc::Sender<ServerMsg>,
}

impl Outbound {
    pub fn new(conn_id: Uuid, tx: mpsc::Sender<ServerMsg>) -> Self {
        Self { conn_id, tx }
    }

    /// Queue without waiting. A full or closed queue drops the message.
    pub fn push(&self, msg: ServerMsg) -> bool {
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(conn_id = %self.conn_id, "Outbound queue full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Deployment rejections. Display text is sent verbatim to the client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeployError {
    #[error("Troop {0} not found")]
    UnknownTroop(String),

    #[error("Not enough mana to deploy {name}")]
    NotEnoughMana {
        name: String,
        cost: u32,
        available: u32,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub username: String,
    pub password: String,
    #[serde(rename = "EXP")]
    pub exp: u32,
    pub level: u32,
    pub towers: Vec<Tower>,
    pub troops: Vec<Troop>,
    #[serde(default = "starting_mana")]
    pub mana: u32,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub outbound: Option<Outbound>,
}

fn starting_mana() -> u32 {
    STARTING_MANA
}

impl PlayerRecord {
    /// A brand new account with the default loadout
    pub fn new(username: &str, password: &str, templates: &UnitTemplates) -> Self {
        let (towers, troops) = templates.fresh_loadout();
        let now = Utc::now();
        Self {
            username: username.to_string(),
            password: password.to_string(),
            exp: 0,
            level: STARTING_LEVEL,
            towers,
            troops,
            mana: STARTING_MANA,
            created_at: now,
            updated_at: now,
            outbound: None,
        }
    }

    pub fn into_shared(self) -> SharedPlayer {
        Arc::new(Mutex::new(self))
    }

    pub fn king(&self) -> Option<&Tower> {
        self.towers.first()
    }

    pub fn king_destroyed(&self) -> bool {
        self.king().map_or(true, Tower::is_destroyed)
    }

    pub fn towers_destroyed(&self) -> usize {
        self.towers.iter().filter(|t| t.is_destroyed()).count()
    }

    /// +1 mana, never above the cap
    pub fn regenerate_mana(&mut self) {
        self.mana = (self.mana + 1).min(MAX_MANA);
    }

    /// Restore towers to full HP and reset mana before a match
    pub fn prepare_for_match(&mut self) {
        for tower in &mut self.towers {
            tower.hp = tower.max_hp.max(tower.hp);
        }
        self.mana = STARTING_MANA;
    }

    /// Fill in full HP missing from a stored tower: its current HP, or the
    /// template tower at the same position when that is higher.
    pub fn restore_max_hp(&mut self, templates: &UnitTemplates) {
        for (i, tower) in self.towers.iter_mut().enumerate() {
            if tower.max_hp > 0 {
                continue;
            }
            let template_hp = templates.towers().get(i).map_or(0, |t| t.max_hp);
            tower.max_hp = tower.hp.max(template_hp);
        }
    }

    /// Spend mana on a named troop. Mana is untouched on failure.
    pub fn deploy(&mut self, troop_name: &str) -> Result<u32, DeployError> {
        let cost = self
            .troops
            .iter()
            .find(|t| t.name == troop_name)
            .map(|t| t.mana)
            .ok_or_else(|| DeployError::UnknownTroop(troop_name.to_string()))?;

        if self.mana < cost {
            return Err(DeployError::NotEnoughMana {
                name: troop_name.to_string(),
                cost,
                available: self.mana,
            });
        }

        self.mana -= cost;
        Ok(self.mana)
    }

    /// Send a message to whichever connection currently owns this record
    pub fn notify(&self, msg: ServerMsg) {
        if let Some(outbound) = &self.outbound {
            outbound.push(msg);
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
