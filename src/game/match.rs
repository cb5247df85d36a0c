//! Match state and the per-tick simulation

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::net::protocol::ServerMsg;

use super::combat::CombatSystem;
use super::player::{PlayerRecord, SharedPlayer};
use super::progression::{self, DRAW_EXP, WIN_EXP};
use super::snapshot::SnapshotBuilder;

/// Match phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPhase {
    /// Second slot empty
    Waiting,
    /// Both slots filled, ticking
    Active,
    /// Terminal
    Over,
}

/// Why an active match ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    TimeOut,
    /// Slot A's king tower fell
    PlayerALoses,
    /// Slot B's king tower fell
    PlayerBLoses,
    /// Server shutdown
    Aborted,
}

/// Registry key derived from the participants' usernames
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MatchKey(String);

impl MatchKey {
    /// Key of a match still waiting for its second player
    pub fn waiting(host: &str) -> Self {
        Self(format!("{host}-"))
    }

    pub fn pair(host: &str, guest: &str) -> Self {
        Self(format!("{host}-{guest}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final result handed to teardown
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchSummary {
    pub key: MatchKey,
    pub reason: EndReason,
    /// `None` for a draw
    pub winner: Option<String>,
}

/// What a tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Not active, nothing simulated
    Idle,
    Running,
    Over(MatchSummary),
}

#[derive(Debug, thiserror::Error)]
pub enum MatchError {
    #[error("match {0} is not waiting for a player")]
    NotWaiting(MatchKey),
}

/// A two-player match
pub struct Match {
    key: MatchKey,
    slot_a: SharedPlayer,
    slot_b: Option<SharedPlayer>,
    start_time: Option<Instant>,
    phase: MatchPhase,
    end_reason: Option<EndReason>,
    duration: Duration,
    rng: ChaCha8Rng,
}

impl Match {
    /// Open a waiting match hosted by `host`
    pub fn new(host: SharedPlayer, duration: Duration, seed: u64) -> Self {
        let key = MatchKey::waiting(&host.lock().username);
        Self {
            key,
            slot_a: host,
            slot_b: None,
            start_time: None,
            phase: MatchPhase::Waiting,
            end_reason: None,
            duration,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn key(&self) -> &MatchKey {
        &self.key
    }

    pub fn phase(&self) -> MatchPhase {
        self.phase
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        self.end_reason
    }

    #[cfg(test)]
    pub fn start_time(&self) -> Option<Instant> {
        self.start_time
    }

    /// Participants, slot A first
    pub fn players(&self) -> Vec<SharedPlayer> {
        let mut players = vec![self.slot_a.clone()];
        players.extend(self.slot_b.clone());
        players
    }

    /// Seat the second player and start the clock. Returns the re-derived key.
    pub fn fill(&mut self, guest: SharedPlayer, now: Instant) -> Result<MatchKey, MatchError> {
        if self.phase != MatchPhase::Waiting || self.slot_b.is_some() {
            return Err(MatchError::NotWaiting(self.key.clone()));
        }

        {
            let mut host = self.slot_a.lock();
            let mut guest = guest.lock();
            host.prepare_for_match();
            guest.prepare_for_match();
            self.key = MatchKey::pair(&host.username, &guest.username);
        }

        self.slot_b = Some(guest);
        self.start_time = Some(now);
        self.phase = MatchPhase::Active;
        info!(match_key = %self.key, "Match active");
        Ok(self.key.clone())
    }

    /// Force the match over without awarding anything
    pub fn abort(&mut self) {
        if self.phase != MatchPhase::Over {
            self.phase = MatchPhase::Over;
            self.end_reason = Some(EndReason::Aborted);
        }
    }

    /// Advance one tick: time check, mana, combat, king check, broadcast.
    pub fn tick(&mut self, now: Instant) -> TickOutcome {
        if self.phase != MatchPhase::Active {
            return TickOutcome::Idle;
        }
        let (Some(slot_b), Some(start)) = (self.slot_b.clone(), self.start_time) else {
            return TickOutcome::Idle;
        };

        let slot_a = Arc::clone(&self.slot_a);
        let mut a = slot_a.lock();
        let mut b = slot_b.lock();
        let elapsed = now.saturating_duration_since(start);

        if elapsed >= self.duration {
            let winner = settle_time_out(&mut a, &mut b);
            let summary = self.finish(EndReason::TimeOut, winner, &a, &b, elapsed);
            return TickOutcome::Over(summary);
        }

        a.regenerate_mana();
        b.regenerate_mana();

        // Only the first troop of each side attacks the opposing king.
        let a_king_fell = strike_king(&b, &mut a, &mut self.rng);
        let b_king_fell = strike_king(&a, &mut b, &mut self.rng);
        if let Some(exp) = a_king_fell {
            progression::award_exp(&mut b, exp);
        }
        if let Some(exp) = b_king_fell {
            progression::award_exp(&mut a, exp);
        }

        // Slot A is checked first when both kings fall on the same tick.
        if a.king_destroyed() {
            progression::grant(&mut b, WIN_EXP);
            progression::level_up(&mut a);
            let winner = Some(b.username.clone());
            let summary = self.finish(EndReason::PlayerALoses, winner, &a, &b, elapsed);
            return TickOutcome::Over(summary);
        }
        if b.king_destroyed() {
            progression::grant(&mut a, WIN_EXP);
            progression::level_up(&mut b);
            let winner = Some(a.username.clone());
            let summary = self.finish(EndReason::PlayerBLoses, winner, &a, &b, elapsed);
            return TickOutcome::Over(summary);
        }

        let snapshot = SnapshotBuilder::build(&a, &b, false, self.duration, elapsed);
        a.notify(ServerMsg::Snapshot(snapshot.clone()));
        b.notify(ServerMsg::Snapshot(snapshot));
        debug!(match_key = %self.key, a_mana = a.mana, b_mana = b.mana, "Tick");

        TickOutcome::Running
    }

    fn finish(
        &mut self,
        reason: EndReason,
        winner: Option<String>,
        a: &PlayerRecord,
        b: &PlayerRecord,
        elapsed: Duration,
    ) -> MatchSummary {
        self.phase = MatchPhase::Over;
        self.end_reason = Some(reason);

        let snapshot = SnapshotBuilder::build(a, b, true, self.duration, elapsed);
        for player in [a, b] {
            player.notify(ServerMsg::Snapshot(snapshot.clone()));
            player.notify(ServerMsg::GameOver {
                winner: winner.clone(),
            });
        }

        info!(
            match_key = %self.key,
            reason = ?reason,
            winner = winner.as_deref().unwrap_or("draw"),
            "Match over"
        );

        MatchSummary {
            key: self.key.clone(),
            reason,
            winner,
        }
    }
}

/// `attacker`'s first troop hits `defender`'s king, critting with the
/// attacker's own king tower CRIT. Returns the king's EXP reward when this hit
/// destroyed it.
fn strike_king(
    attacker: &PlayerRecord,
    defender: &mut PlayerRecord,
    rng: &mut ChaCha8Rng,
) -> Option<u32> {
    let troop = attacker.troops.first()?;
    let crit_chance = attacker.king().map_or(0, |t| t.crit);
    let king = defender.towers.first_mut()?;

    let strike = CombatSystem::resolve(troop.combatant(), king.combatant(), crit_chance, rng);
    if strike.crit {
        debug!(attacker = %attacker.username, damage = strike.damage, "Critical hit");
    }
    king.take_damage(strike.damage).then_some(king.exp)
}

/// Fewer own towers lost wins; equal losses draw. Awards the EXP.
fn settle_time_out(a: &mut PlayerRecord, b: &mut PlayerRecord) -> Option<String> {
    let lost_a = a.towers_destroyed();
    let lost_b = b.towers_destroyed();

    if lost_a == lost_b {
        progression::grant(a, DRAW_EXP);
        progression::grant(b, DRAW_EXP);
        return None;
    }

    let winner = if lost_a < lost_b { a } else { b };
    progression::grant(winner, WIN_EXP);
    Some(winner.username.clone())
}

/// Shared handle to a match, its stop signal and its tick driver
#[derive(Clone)]
pub struct MatchHandle {
    pub id: Uuid,
    state: Arc<Mutex<Match>>,
    stop: Arc<Notify>,
    driver: Arc<Mutex<Option<JoinHandle<()>>>>,
    torn_down: Arc<AtomicBool>,
}

impl MatchHandle {
    pub fn new(game: Match) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: Arc::new(Mutex::new(game)),
            stop: Arc::new(Notify::new()),
            driver: Arc::new(Mutex::new(None)),
            torn_down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Match> {
        self.state.lock()
    }

    /// Ask the driver to stop after its current tick
    pub fn stop(&self) {
        self.stop.notify_one();
    }

    pub async fn stopped(&self) {
        self.stop.notified().await
    }

    pub fn attach_driver(&self, handle: JoinHandle<()>) {
        *self.driver.lock() = Some(handle);
    }

    pub fn take_driver(&self) -> Option<JoinHandle<()>> {
        self.driver.lock().take()
    }

    /// True for the first caller only
    pub fn begin_teardown(&self) -> bool {
        !self.torn_down.swap(true, Ordering::AcqRel)
    }
}
