//! Troop and tower definitions
//!
//! Templates are loaded once at startup and never mutated. Every player gets a
//! deep copy of them as a live loadout; live HP changes stay in that copy.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::combat::Combatant;

/// A defensive structure. Index 0 of a loadout is the king tower.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tower {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "HP")]
    pub hp: i32,
    /// Full HP restored before each match (absent in template files)
    #[serde(rename = "MaxHP", default)]
    pub max_hp: i32,
    #[serde(rename = "ATK")]
    pub atk: i32,
    #[serde(rename = "DEF")]
    pub def: i32,
    /// Critical hit chance in percent, rolled for this side's troop attacks
    #[serde(rename = "CRIT", default)]
    pub crit: u32,
    /// EXP awarded to whoever destroys this tower
    #[serde(rename = "EXP", default)]
    pub exp: u32,
}

impl Tower {
    pub fn combatant(&self) -> Combatant {
        Combatant::new(self.atk, self.def)
    }

    pub fn is_destroyed(&self) -> bool {
        self.hp <= 0
    }

    /// Subtract damage, clamping at zero. Returns true when this hit destroyed it.
    pub fn take_damage(&mut self, damage: i32) -> bool {
        let was_standing = !self.is_destroyed();
        self.hp = (self.hp - damage).max(0);
        was_standing && self.is_destroyed()
    }

    fn normalize(&mut self) {
        if self.max_hp <= 0 {
            self.max_hp = self.hp;
        }
    }
}

/// A deployable unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Troop {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "HP")]
    pub hp: i32,
    #[serde(rename = "ATK")]
    pub atk: i32,
    #[serde(rename = "DEF")]
    pub def: i32,
    /// Mana cost to deploy
    #[serde(rename = "MANA")]
    pub mana: u32,
    #[serde(rename = "EXP", default)]
    pub exp: u32,
    #[serde(rename = "Special", default)]
    pub special: String,
}

impl Troop {
    pub fn combatant(&self) -> Combatant {
        Combatant::new(self.atk, self.def)
    }
}

/// Errors loading template files
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("tower template list is empty; a king tower is required")]
    NoKingTower,
}

/// Immutable troop/tower definitions shared by the whole server
#[derive(Debug, Clone)]
pub struct UnitTemplates {
    troops: Vec<Troop>,
    towers: Vec<Tower>,
}

impl UnitTemplates {
    pub fn new(troops: Vec<Troop>, mut towers: Vec<Tower>) -> Result<Self, TemplateError> {
        if towers.is_empty() {
            return Err(TemplateError::NoKingTower);
        }
        towers.iter_mut().for_each(Tower::normalize);
        Ok(Self { troops, towers })
    }

    /// Load both template files
    pub fn load(troops_path: &Path, towers_path: &Path) -> Result<Self, TemplateError> {
        let troops: Vec<Troop> = read_json(troops_path)?;
        let towers: Vec<Tower> = read_json(towers_path)?;
        Self::new(troops, towers)
    }

    /// A fresh, independently owned loadout for one player
    pub fn fresh_loadout(&self) -> (Vec<Tower>, Vec<Troop>) {
        (self.towers.clone(), self.troops.clone())
    }

    pub fn troops(&self) -> &[Troop] {
        &self.troops
    }

    pub fn towers(&self) -> &[Tower] {
        &self.towers
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, TemplateError> {
    let display = path.display().to_string();
    let raw = std::fs::read_to_string(path).map_err(|source| TemplateError::Io {
        path: display.clone(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| TemplateError::Parse {
        path: display,
        source,
    })
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn tower(kind: &str, hp: i32, atk: i32, def: i32) -> Tower {
        Tower {
            kind: kind.to_string(),
            hp,
            max_hp: hp,
            atk,
            def,
            crit: 0,
            exp: 50,
        }
    }

    pub fn troop(name: &str, atk: i32, def: i32, mana: u32) -> Troop {
        Troop {
            name: name.to_string(),
            hp: 100,
            atk,
            def,
            mana,
            exp: 5,
            special: String::new(),
        }
    }

    pub fn templates() -> UnitTemplates {
        UnitTemplates::new(
            vec![troop("Pawn", 30, 5, 3), troop("Queen", 60, 20, 8)],
            vec![
                tower("King Tower", 100, 20, 10),
                tower("Guard Tower", 60, 15, 5),
                tower("Guard Tower", 60, 15, 5),
            ],
        )
        .expect("fixture templates are valid")
    }
}
