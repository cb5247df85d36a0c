//! Session registry - authenticated players and in-progress matches
//!
//! All mutation of the player table, the match table, the waiting queue and
//! match slots happens under one registry lock. Lock order is
//! registry, then match, then player; nothing takes them in reverse.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MatchSettings;
use crate::game::player::{Outbound, PlayerRecord, SharedPlayer};
use crate::game::unit::UnitTemplates;
use crate::game::{scheduler, Match, MatchHandle, MatchKey, MatchPhase};
use crate::net::protocol::ServerMsg;
use crate::store::{RecordStore, StoreError};

use super::queue::WaitingQueue;

const MAX_USERNAME_LEN: usize = 32;

/// Terminal authentication failures
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("incorrect password")]
    InvalidCredentials,

    #[error("invalid username")]
    InvalidUsername,

    #[error("player record unavailable: {0}")]
    Store(#[from] StoreError),
}

/// Result of a join request
#[derive(Clone)]
pub enum JoinOutcome {
    /// New match, hosted by the caller, waiting for an opponent
    Waiting(MatchHandle),
    /// Caller filled a waiting match which is now active
    Started(MatchHandle),
    /// Caller was already seated; its current match
    Rejoined(MatchHandle),
}

impl JoinOutcome {
    pub fn handle(&self) -> &MatchHandle {
        match self {
            Self::Waiting(h) | Self::Started(h) | Self::Rejoined(h) => h,
        }
    }
}

#[derive(Default)]
struct RegistryState {
    /// Connected (or still seated) players by username
    players: HashMap<String, SharedPlayer>,
    matches: HashMap<MatchKey, MatchHandle>,
    waiting: WaitingQueue,
    /// Username to the match it sits in
    seats: HashMap<String, MatchKey>,
}

impl RegistryState {
    /// Drop a match and its seats. Returns the handle if it was present.
    /// Participants stay in the player table; see `release_idle`.
    fn remove_match(&mut self, key: &MatchKey) -> Option<MatchHandle> {
        let handle = self.matches.remove(key)?;
        self.waiting.remove(key);
        self.seats.retain(|_, seat| seat != key);
        Some(handle)
    }

    /// Forget disconnected, unseated players. An entry is only removed while it
    /// still holds this exact record, so a newer login is never evicted.
    fn release_idle(&mut self, players: &[SharedPlayer]) {
        for player in players {
            let (username, connected) = {
                let record = player.lock();
                (record.username.clone(), record.outbound.is_some())
            };
            if connected || self.seats.contains_key(&username) {
                continue;
            }
            let same = self
                .players
                .get(&username)
                .is_some_and(|live| Arc::ptr_eq(live, player));
            if same {
                self.players.remove(&username);
            }
        }
    }
}

pub struct SessionRegistry {
    state: Mutex<RegistryState>,
    templates: Arc<UnitTemplates>,
    store: Arc<dyn RecordStore>,
    settings: MatchSettings,
}

impl SessionRegistry {
    pub fn new(
        templates: Arc<UnitTemplates>,
        store: Arc<dyn RecordStore>,
        settings: MatchSettings,
    ) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            templates,
            store,
            settings,
        }
    }

    /// Validate credentials and bind `outbound` as the player's transport.
    ///
    /// Unknown usernames get a fresh default record which is persisted at once.
    /// `AuthOk` is queued on `outbound` before any match traffic can reach it.
    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
        outbound: Outbound,
    ) -> Result<SharedPlayer, AuthError> {
        validate_username(username)?;

        let known = self.state.lock().players.get(username).cloned();
        let (player, created) = match known {
            Some(player) => (player, false),
            None => self.load_or_create(username, password).await?,
        };

        {
            let mut record = player.lock();
            if record.password != password {
                return Err(AuthError::InvalidCredentials);
            }
            outbound.push(ServerMsg::AuthOk);
            if record.outbound.replace(outbound).is_some() {
                info!(username, "Rebound player to newer connection");
            }
        }

        if created {
            let record = player.lock().clone();
            self.persist(record).await;
        }

        info!(username, created, "Player authenticated");
        Ok(player)
    }

    async fn load_or_create(
        &self,
        username: &str,
        password: &str,
    ) -> Result<(SharedPlayer, bool), AuthError> {
        let store = Arc::clone(&self.store);
        let name = username.to_string();
        let loaded = tokio::task::spawn_blocking(move || store.load(&name))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))??;

        let (record, fresh) = match loaded {
            Some(mut record) => {
                // Check before the record enters the shared table
                if record.password != password {
                    return Err(AuthError::InvalidCredentials);
                }
                if record.towers.is_empty() {
                    warn!(username, "Stored record has no towers, restoring loadout");
                    let (towers, troops) = self.templates.fresh_loadout();
                    record.towers = towers;
                    record.troops = troops;
                }
                record.restore_max_hp(&self.templates);
                (record, false)
            }
            None => (PlayerRecord::new(username, password, &self.templates), true),
        };

        let mut state = self.state.lock();
        Ok(match state.players.entry(username.to_string()) {
            // A concurrent login got there first; use its record
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => (entry.insert(record.into_shared()).clone(), fresh),
        })
    }

    /// Pair `player` with the oldest waiting match or open a new one.
    ///
    /// The scan and the fill happen under the registry lock, so two concurrent
    /// joiners can never claim the same slot. The tick driver is spawned only by
    /// the caller that activated the match, and is attached before the lock is
    /// released so `shutdown` always sees it.
    pub fn join_or_create(self: &Arc<Self>, player: &SharedPlayer) -> JoinOutcome {
        let outcome = self.seat(player, Instant::now());

        if let JoinOutcome::Rejoined(_) = &outcome {
            debug!(match_id = %outcome.handle().id, "Player rejoined its match");
        }

        outcome
    }

    /// The atomic scan-and-fill step
    fn seat(self: &Arc<Self>, player: &SharedPlayer, now: Instant) -> JoinOutcome {
        let username = player.lock().username.clone();
        let mut state = self.state.lock();

        // A finished match still saving its records does not count as a seat
        if let Some(handle) = state
            .seats
            .get(&username)
            .and_then(|key| state.matches.get(key))
            .filter(|handle| handle.lock().phase() != MatchPhase::Over)
        {
            return JoinOutcome::Rejoined(handle.clone());
        }

        while let Some(queued) = state.waiting.pop_front() {
            let Some(handle) = state.matches.remove(&queued.key) else {
                continue;
            };

            let filled = handle.lock().fill(player.clone(), now);
            let key = match filled {
                Ok(key) => key,
                Err(e) => {
                    warn!(error = %e, "Skipping stale waiting entry");
                    state.matches.insert(queued.key, handle);
                    continue;
                }
            };

            state.seats.retain(|_, seat| seat != &queued.key);
            let participants = handle.lock().players();
            let names: Vec<String> = participants
                .iter()
                .map(|p| p.lock().username.clone())
                .collect();
            for (participant, name) in participants.iter().zip(&names) {
                state.seats.insert(name.clone(), key.clone());
                if let Some(opponent) = names.iter().find(|n| *n != name) {
                    participant.lock().notify(ServerMsg::MatchStarted {
                        opponent: opponent.clone(),
                    });
                }
            }
            state.matches.insert(key.clone(), handle.clone());

            let driver =
                scheduler::spawn(handle.clone(), Arc::clone(self), self.settings.tick_interval);
            handle.attach_driver(driver);

            info!(match_key = %key, "Paired players");
            return JoinOutcome::Started(handle);
        }

        let game = Match::new(player.clone(), self.settings.match_duration, rand::random());
        let key = game.key().clone();
        let handle = MatchHandle::new(game);
        state.matches.insert(key.clone(), handle.clone());
        state.waiting.enqueue(key.clone(), now);
        state.seats.insert(username, key.clone());
        player.lock().notify(ServerMsg::Waiting);

        info!(match_key = %key, "Opened waiting match");
        JoinOutcome::Waiting(handle)
    }

    /// Remove `handle` and its seats, then forget participants that are
    /// disconnected. Returns false if it was not registered. A newer match that
    /// reuses the key is left alone.
    pub fn remove_match(&self, handle: &MatchHandle) -> bool {
        let (key, players) = {
            let game = handle.lock();
            (game.key().clone(), game.players())
        };

        let mut state = self.state.lock();
        let registered = state
            .matches
            .get(&key)
            .is_some_and(|current| current.id == handle.id);
        if !registered {
            return false;
        }
        state.remove_match(&key);
        state.release_idle(&players);
        true
    }

    /// Persist both records of a finished match, then deregister it. Runs at
    /// most once per match even if called again.
    ///
    /// The match and its seats stay registered until every save completes, so a
    /// re-login or a disconnect during teardown keeps the live record.
    pub async fn teardown(&self, handle: &MatchHandle) -> bool {
        let (key, reason, players) = {
            let game = handle.lock();
            (game.key().clone(), game.end_reason(), game.players())
        };
        if !handle.begin_teardown() {
            debug!(match_key = %key, "Match already torn down");
            return false;
        }

        for player in &players {
            let record = {
                let mut record = player.lock();
                record.touch();
                record.clone()
            };
            self.persist(record).await;
        }

        self.remove_match(handle);

        info!(match_key = %key, reason = ?reason, "Match torn down");
        true
    }

    /// Connection closed. Only acts if `conn_id` still owns the player's transport.
    pub fn disconnect(&self, username: &str, conn_id: Uuid) {
        let mut state = self.state.lock();
        let Some(player) = state.players.get(username).cloned() else {
            return;
        };

        {
            let mut record = player.lock();
            let owned = record.outbound.as_ref().map(|o| o.conn_id) == Some(conn_id);
            if !owned {
                debug!(username, "Stale connection closed, newer session kept");
                return;
            }
            record.outbound = None;
        }

        match state.seats.get(username).cloned() {
            Some(key) => {
                let waiting = state
                    .matches
                    .get(&key)
                    .map(|h| h.lock().phase() == MatchPhase::Waiting)
                    .unwrap_or(false);
                if waiting {
                    if let Some(handle) = state.remove_match(&key) {
                        let players = handle.lock().players();
                        state.release_idle(&players);
                    }
                    info!(username, match_key = %key, "Host left, waiting match cancelled");
                } else {
                    // Active matches keep running for the remaining player
                    info!(username, match_key = %key, "Player left an active match");
                }
            }
            None => {
                state.players.remove(username);
            }
        }
    }

    /// Cancel waiting matches whose host has waited longer than the idle timeout
    pub fn reap_stale_waiting(&self, now: Instant) -> usize {
        let Some(max_wait) = self.settings.waiting_timeout else {
            return 0;
        };

        let mut state = self.state.lock();
        if state.waiting.is_empty() {
            return 0;
        }
        let stale = state.waiting.drain_stale(now, max_wait);
        let mut reaped = 0;
        for queued in stale {
            if let Some(handle) = state.remove_match(&queued.key) {
                let players = handle.lock().players();
                for player in &players {
                    player.lock().notify(ServerMsg::MatchCancelled);
                }
                state.release_idle(&players);
                info!(match_key = %queued.key, "Waiting match timed out");
                reaped += 1;
            }
        }
        reaped
    }

    /// Periodic housekeeping, runs for the life of the server
    pub async fn run_janitor(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            self.reap_stale_waiting(Instant::now());
        }
    }

    /// Stop every tick driver and wait for their teardown
    pub async fn shutdown(&self) {
        let drivers: Vec<_> = {
            let state = self.state.lock();
            let drivers = state
                .matches
                .values()
                .filter_map(|handle| {
                    handle.stop();
                    handle.take_driver()
                })
                .collect();
            drivers
        };

        info!(count = drivers.len(), "Stopping match drivers");
        for result in futures::future::join_all(drivers).await {
            if let Err(e) = result {
                warn!(error = %e, "Match driver ended abnormally");
            }
        }
    }

    async fn persist(&self, record: PlayerRecord) {
        let store = Arc::clone(&self.store);
        let username = record.username.clone();
        let result = tokio::task::spawn_blocking(move || store.save(&record))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))
            .and_then(|r| r);

        match result {
            Ok(()) => debug!(username = %username, "Player record saved"),
            Err(e) => warn!(username = %username, error = %e, "Failed to save player record"),
        }
    }

    pub fn active_matches(&self) -> usize {
        let state = self.state.lock();
        state.matches.len().saturating_sub(state.waiting.len())
    }

    pub fn waiting_matches(&self) -> usize {
        self.state.lock().waiting.len()
    }

    pub fn connected_players(&self) -> usize {
        self.state.lock().players.len()
    }
}

/// 1-32 characters of `[A-Za-z0-9_]`. Usernames double as file names, and `-`
/// is reserved as the match key separator.
fn validate_username(username: &str) -> Result<(), AuthError> {
    let valid = !username.is_empty()
        && username.len() <= MAX_USERNAME_LEN
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(AuthError::InvalidUsername)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::unit::fixtures::templates;
    use crate::store::MemoryStore;
    use tokio::sync::mpsc;
    use tokio_test::{assert_err, assert_ok};

    fn settings(tick_ms: u64, duration_ms: u64) -> MatchSettings {
        MatchSettings {
            tick_interval: Duration::from_millis(tick_ms),
            match_duration: Duration::from_millis(duration_ms),
            waiting_timeout: Some(Duration::from_secs(30)),
        }
    }

    fn registry_with(store: Arc<MemoryStore>, settings: MatchSettings) -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(Arc::new(templates()), store, settings))
    }

    fn idle_registry() -> (Arc<SessionRegistry>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        // ticks never fire during these tests
        let registry = registry_with(store.clone(), settings(3_600_000, 3_600_000));
        (registry, store)
    }

    fn connection() -> (Outbound, mpsc::Receiver<ServerMsg>) {
        let (tx, rx) = mpsc::channel(1024);
        (Outbound::new(Uuid::new_v4(), tx), rx)
    }

    async fn login(registry: &SessionRegistry, name: &str) -> (SharedPlayer, Outbound) {
        // a dropped receiver just discards notices
        let (outbound, _rx) = connection();
        let player = registry
            .authenticate(name, "pw", outbound.clone())
            .await
            .unwrap();
        (player, outbound)
    }

    #[tokio::test]
    async fn new_players_are_created_and_saved() {
        let (registry, store) = idle_registry();
        let (outbound, mut rx) = connection();

        let player = assert_ok!(registry.authenticate("alice", "pw", outbound).await);
        assert_eq!(player.lock().level, 1);
        assert_eq!(store.save_count("alice"), 1);
        assert_eq!(rx.try_recv().unwrap(), ServerMsg::AuthOk);
        assert_eq!(registry.connected_players(), 1);
    }

    #[tokio::test]
    async fn reauthentication_reuses_the_live_record() {
        let (registry, _store) = idle_registry();
        let (first, _) = login(&registry, "alice").await;
        let (outbound, _rx) = connection();
        let conn_id = outbound.conn_id;

        let second = assert_ok!(registry.authenticate("alice", "pw", outbound).await);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.lock().outbound.as_ref().map(|o| o.conn_id), Some(conn_id));
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let (registry, store) = idle_registry();
        login(&registry, "alice").await;
        let (outbound, _rx) = connection();
        let err = assert_err!(registry.authenticate("alice", "nope", outbound).await);
        assert!(matches!(err, AuthError::InvalidCredentials));

        // stored but not connected
        store.insert(PlayerRecord::new("bob", "right", &templates()));
        let (outbound, _rx) = connection();
        let err = assert_err!(registry.authenticate("bob", "wrong", outbound).await);
        assert!(matches!(err, AuthError::InvalidCredentials));
        assert_eq!(registry.connected_players(), 1);
    }

    #[tokio::test]
    async fn stored_record_is_loaded() {
        let (registry, store) = idle_registry();
        let mut record = PlayerRecord::new("carol", "pw", &templates());
        record.level = 4;
        store.insert(record);

        let (player, _) = login(&registry, "carol").await;
        assert_eq!(player.lock().level, 4);
        assert_eq!(store.save_count("carol"), 0);
    }

    #[tokio::test]
    async fn usernames_are_validated() {
        let (registry, _store) = idle_registry();
        for bad in ["", "../etc", "a-b", "with space", "x".repeat(33).as_str()] {
            let (outbound, _rx) = connection();
            let err = assert_err!(registry.authenticate(bad, "pw", outbound).await);
            assert!(matches!(err, AuthError::InvalidUsername), "{bad:?}");
        }
    }

    #[tokio::test]
    async fn second_joiner_fills_the_waiting_match() {
        let (registry, _store) = idle_registry();
        let (alice, _) = login(&registry, "alice").await;
        let (bob, _) = login(&registry, "bob").await;

        let first = registry.join_or_create(&alice);
        assert!(matches!(first, JoinOutcome::Waiting(_)));
        assert_eq!(registry.waiting_matches(), 1);

        let second = registry.join_or_create(&bob);
        assert!(matches!(second, JoinOutcome::Started(_)));
        assert_eq!(first.handle().id, second.handle().id);
        assert_eq!(second.handle().lock().key().as_str(), "alice-bob");
        assert_eq!(registry.active_matches(), 1);
        assert_eq!(registry.waiting_matches(), 0);

        // already seated
        let again = registry.join_or_create(&alice);
        assert!(matches!(again, JoinOutcome::Rejoined(_)));
        assert_eq!(again.handle().id, first.handle().id);

        registry.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_joins_make_exactly_one_match() {
        for round in 0..50 {
            let (registry, _store) = idle_registry();
            let (alice, _) = login(&registry, &format!("alice{round}")).await;
            let (bob, _) = login(&registry, &format!("bob{round}")).await;

            let joins = [alice, bob].map(|player| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.join_or_create(&player) })
            });
            let outcomes: Vec<JoinOutcome> = futures::future::join_all(joins)
                .await
                .into_iter()
                .map(Result::unwrap)
                .collect();

            let waiting = outcomes
                .iter()
                .filter(|o| matches!(o, JoinOutcome::Waiting(_)))
                .count();
            let started = outcomes
                .iter()
                .filter(|o| matches!(o, JoinOutcome::Started(_)))
                .count();
            assert_eq!((waiting, started), (1, 1));
            assert_eq!(outcomes[0].handle().id, outcomes[1].handle().id);
            assert_eq!(outcomes[0].handle().lock().players().len(), 2);
            assert_eq!(registry.active_matches(), 1);
            assert_eq!(registry.waiting_matches(), 0);

            registry.shutdown().await;
        }
    }

    #[tokio::test]
    async fn remove_match_is_idempotent() {
        let (registry, _store) = idle_registry();
        let (alice, _) = login(&registry, "alice").await;
        let outcome = registry.join_or_create(&alice);

        assert!(registry.remove_match(outcome.handle()));
        assert!(!registry.remove_match(outcome.handle()));
        assert_eq!(registry.waiting_matches(), 0);
        // still connected, so still known
        assert_eq!(registry.connected_players(), 1);

        // unseated again, so a new join opens a new match
        assert!(matches!(registry.join_or_create(&alice), JoinOutcome::Waiting(_)));
    }

    #[tokio::test]
    async fn host_disconnect_cancels_waiting_match() {
        let (registry, _store) = idle_registry();
        let (alice, outbound) = login(&registry, "alice").await;
        registry.join_or_create(&alice);

        // a stale connection id does nothing
        registry.disconnect("alice", Uuid::new_v4());
        assert_eq!(registry.waiting_matches(), 1);

        registry.disconnect("alice", outbound.conn_id);
        assert_eq!(registry.waiting_matches(), 0);
        assert_eq!(registry.connected_players(), 0);
    }

    #[tokio::test]
    async fn stale_waiting_matches_are_reaped() {
        let (registry, _store) = idle_registry();
        let (outbound, mut rx) = connection();
        let alice = registry.authenticate("alice", "pw", outbound).await.unwrap();
        registry.join_or_create(&alice);

        assert_eq!(registry.reap_stale_waiting(Instant::now()), 0);
        let later = Instant::now() + Duration::from_secs(31);
        assert_eq!(registry.reap_stale_waiting(later), 1);
        assert_eq!(registry.waiting_matches(), 0);

        let mut seen = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            seen.push(msg);
        }
        assert_eq!(
            seen,
            vec![ServerMsg::AuthOk, ServerMsg::Waiting, ServerMsg::MatchCancelled]
        );
    }

    #[tokio::test]
    async fn king_kill_ends_match_and_persists_once() {
        let store = Arc::new(MemoryStore::new());
        let mut alice = PlayerRecord::new("alice", "pw", &templates());
        // alice's troops cannot dent bob's king
        alice.troops[0].atk = 0;
        store.insert(alice);
        store.insert(PlayerRecord::new("bob", "pw", &templates()));

        let registry = registry_with(store.clone(), settings(10, 60_000));
        let (alice, _) = login(&registry, "alice").await;
        let (bob, _) = login(&registry, "bob").await;
        registry.join_or_create(&alice);
        let outcome = registry.join_or_create(&bob);

        let driver = outcome.handle().take_driver().expect("driver attached");
        tokio::time::timeout(Duration::from_secs(5), driver)
            .await
            .expect("match ends")
            .unwrap();

        let handle = outcome.handle();
        assert_eq!(handle.lock().end_reason(), Some(crate::game::EndReason::PlayerALoses));
        assert_eq!(alice.lock().towers[0].hp, 0);
        assert_eq!(bob.lock().exp, 50 + 30);
        assert_eq!(store.save_count("alice"), 1);
        assert_eq!(store.save_count("bob"), 1);
        assert_eq!(store.get("bob").unwrap().exp, 80);
        assert_eq!(registry.active_matches(), 0);

        // a late duplicate teardown changes nothing
        assert!(!registry.teardown(handle).await);
        assert_eq!(store.save_count("bob"), 1);
    }

    #[tokio::test]
    async fn time_out_draw_awards_both_players() {
        let store = Arc::new(MemoryStore::new());
        for name in ["alice", "bob"] {
            let mut record = PlayerRecord::new(name, "pw", &templates());
            record.towers[0].def = 1_000;
            store.insert(record);
        }

        let registry = registry_with(store.clone(), settings(10, 50));
        let (alice, _) = login(&registry, "alice").await;
        let (bob, _) = login(&registry, "bob").await;
        registry.join_or_create(&alice);
        let outcome = registry.join_or_create(&bob);

        let driver = outcome.handle().take_driver().expect("driver attached");
        tokio::time::timeout(Duration::from_secs(5), driver)
            .await
            .expect("match ends")
            .unwrap();

        assert_eq!(
            outcome.handle().lock().end_reason(),
            Some(crate::game::EndReason::TimeOut)
        );
        assert_eq!(alice.lock().exp, 10);
        assert_eq!(bob.lock().exp, 10);
        assert_eq!(store.save_count("alice"), 1);
        assert_eq!(store.save_count("bob"), 1);
    }

    /// Holds the first save of one username until released
    struct HeldStore {
        inner: MemoryStore,
        held: String,
        gate: Mutex<Option<std::sync::mpsc::Receiver<()>>>,
    }

    impl HeldStore {
        fn new(held: &str) -> (Arc<Self>, std::sync::mpsc::Sender<()>) {
            let (tx, rx) = std::sync::mpsc::channel();
            let store = Arc::new(Self {
                inner: MemoryStore::new(),
                held: held.to_string(),
                gate: Mutex::new(Some(rx)),
            });
            (store, tx)
        }
    }

    impl RecordStore for HeldStore {
        fn load(&self, username: &str) -> Result<Option<PlayerRecord>, StoreError> {
            self.inner.load(username)
        }

        fn save(&self, record: &PlayerRecord) -> Result<(), StoreError> {
            if record.username == self.held {
                let gate = self.gate.lock().take();
                if let Some(gate) = gate {
                    let _ = gate.recv();
                }
            }
            self.inner.save(record)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn relogin_during_teardown_reuses_the_live_record() {
        let (store, release) = HeldStore::new("bob");
        let mut alice = PlayerRecord::new("alice", "pw", &templates());
        alice.troops[0].atk = 0;
        store.inner.insert(alice);
        store.inner.insert(PlayerRecord::new("bob", "pw", &templates()));

        let registry = Arc::new(SessionRegistry::new(
            Arc::new(templates()),
            store.clone(),
            settings(10, 60_000),
        ));
        let (alice, _) = login(&registry, "alice").await;
        let (bob, bob_conn) = login(&registry, "bob").await;
        registry.join_or_create(&alice);
        let outcome = registry.join_or_create(&bob);
        let driver = outcome.handle().take_driver().expect("driver attached");

        // alice is saved first, bob's save is held
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.inner.save_count("alice") == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("match ends");
        assert_eq!(outcome.handle().lock().phase(), MatchPhase::Over);
        assert_eq!(store.inner.save_count("bob"), 0);

        registry.disconnect("bob", bob_conn.conn_id);
        assert_eq!(registry.connected_players(), 2);

        let (outbound, _rx) = connection();
        let relogged = assert_ok!(registry.authenticate("bob", "pw", outbound).await);
        assert!(Arc::ptr_eq(&relogged, &bob));
        assert_eq!(relogged.lock().exp, 80);

        // the finished match is not rejoined
        let next = registry.join_or_create(&bob);
        assert!(matches!(next, JoinOutcome::Waiting(_)));
        assert_ne!(next.handle().id, outcome.handle().id);

        release.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), driver)
            .await
            .expect("teardown finishes")
            .unwrap();

        assert_eq!(store.inner.get("bob").unwrap().exp, 80);
        assert_eq!(registry.active_matches(), 0);
        assert_eq!(registry.waiting_matches(), 1);
        // bob's new waiting match survived the old teardown
        let again = registry.join_or_create(&bob);
        assert!(matches!(again, JoinOutcome::Rejoined(_)));
        assert_eq!(again.handle().id, next.handle().id);
    }

    #[tokio::test]
    async fn disconnect_mid_match_keeps_the_match_running() {
        let store = Arc::new(MemoryStore::new());
        for name in ["alice", "bob"] {
            let mut record = PlayerRecord::new(name, "pw", &templates());
            record.towers[0].def = 1_000;
            store.insert(record);
        }
        let registry = registry_with(store.clone(), settings(10, 300));
        let (outbound, mut alice_rx) = connection();
        let alice = registry.authenticate("alice", "pw", outbound).await.unwrap();
        let (bob, bob_conn) = login(&registry, "bob").await;
        registry.join_or_create(&alice);
        let outcome = registry.join_or_create(&bob);
        let driver = outcome.handle().take_driver().expect("driver attached");

        registry.disconnect("bob", bob_conn.conn_id);
        assert!(bob.lock().outbound.is_none());
        assert_eq!(outcome.handle().lock().phase(), MatchPhase::Active);
        assert_eq!(registry.active_matches(), 1);
        assert_eq!(registry.connected_players(), 2);

        tokio::time::timeout(Duration::from_secs(5), driver)
            .await
            .expect("match ends")
            .unwrap();

        assert_eq!(
            outcome.handle().lock().end_reason(),
            Some(crate::game::EndReason::TimeOut)
        );
        // the absent player still earns the draw
        assert_eq!(bob.lock().exp, 10);
        assert_eq!(store.save_count("bob"), 1);
        let snapshots = std::iter::from_fn(|| alice_rx.try_recv().ok())
            .filter(|m| matches!(m, ServerMsg::Snapshot(_)))
            .count();
        assert!(snapshots >= 2, "alice saw {snapshots} snapshots");

        assert_eq!(registry.active_matches(), 0);
        // bob is released, alice is still connected
        assert_eq!(registry.connected_players(), 1);
    }

    #[tokio::test]
    async fn loaded_towers_missing_max_hp_are_restored() {
        let store = Arc::new(MemoryStore::new());
        let mut record = PlayerRecord::new("erin", "pw", &templates());
        record.towers[0].hp = 0;
        record.towers[0].max_hp = 0;
        store.insert(record);
        let registry = registry_with(store, settings(3_600_000, 3_600_000));

        let (erin, _) = login(&registry, "erin").await;
        assert_eq!(erin.lock().towers[0].max_hp, 100);
    }

    #[tokio::test]
    async fn shutdown_stops_and_persists_active_matches() {
        let (registry, store) = idle_registry();
        let (alice, _) = login(&registry, "alice").await;
        let (bob, _) = login(&registry, "bob").await;
        registry.join_or_create(&alice);
        let outcome = registry.join_or_create(&bob);

        registry.shutdown().await;

        assert_eq!(
            outcome.handle().lock().end_reason(),
            Some(crate::game::EndReason::Aborted)
        );
        assert_eq!(registry.active_matches(), 0);
        // creation save + teardown save
        assert_eq!(store.save_count("alice"), 2);
        assert_eq!(store.save_count("bob"), 2);
    }
}
