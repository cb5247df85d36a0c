//! Experience and levelling

use tracing::info;

use super::player::PlayerRecord;

/// Bonus for winning a match
pub const WIN_EXP: u32 = 30;
/// Bonus each player receives for a drawn match
pub const DRAW_EXP: u32 = 10;
/// Stat growth per level
pub const LEVEL_SCALE: f64 = 1.1;

/// EXP needed to leave `level`
pub fn threshold(level: u32) -> u32 {
    100 + level * 10
}

pub fn award_exp(player: &mut PlayerRecord, amount: u32) {
    player.exp = player.exp.saturating_add(amount);
}

/// Apply at most one level per call. EXP is cumulative and never consumed, so
/// repeated calls catch up one level at a time. Returns true when a level was gained.
pub fn level_up(player: &mut PlayerRecord) -> bool {
    if player.exp < threshold(player.level) {
        return false;
    }

    player.level += 1;
    for tower in &mut player.towers {
        tower.hp = scale(tower.hp);
        tower.max_hp = scale(tower.max_hp);
        tower.atk = scale(tower.atk);
        tower.def = scale(tower.def);
    }
    for troop in &mut player.troops {
        troop.hp = scale(troop.hp);
        troop.atk = scale(troop.atk);
        troop.def = scale(troop.def);
    }

    info!(username = %player.username, level = player.level, "Player levelled up");
    true
}

/// Award EXP and run one level check
pub fn grant(player: &mut PlayerRecord, amount: u32) -> bool {
    award_exp(player, amount);
    level_up(player)
}

fn scale(stat: i32) -> i32 {
    (f64::from(stat) * LEVEL_SCALE) as i32
}
