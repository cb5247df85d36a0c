//! Snapshot building for network transmission

use std::time::Duration;

use crate::net::protocol::{PlayerSnapshot, StateSnapshot, TowerSnapshot};

use super::player::PlayerRecord;

/// Builds the redacted client view of a match
pub struct SnapshotBuilder;

impl SnapshotBuilder {
    pub fn build(
        player1: &PlayerRecord,
        player2: &PlayerRecord,
        game_over: bool,
        duration: Duration,
        elapsed: Duration,
    ) -> StateSnapshot {
        StateSnapshot {
            player1: Self::player(player1),
            player2: Self::player(player2),
            game_over,
            time_remaining: Self::time_remaining(duration, elapsed),
        }
    }

    /// Whole seconds left, negative in overtime
    pub fn time_remaining(duration: Duration, elapsed: Duration) -> i64 {
        let millis = duration.as_millis() as i64 - elapsed.as_millis() as i64;
        millis / 1000
    }

    fn player(record: &PlayerRecord) -> PlayerSnapshot {
        PlayerSnapshot {
            username: record.username.clone(),
            level: record.level,
            mana: record.mana,
            towers: record
                .towers
                .iter()
                .map(|t| TowerSnapshot {
                    kind: t.kind.clone(),
                    hp: t.hp,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::unit::fixtures::templates;

    #[test]
    fn snapshot_hides_credentials_and_stats() {
        let alice = PlayerRecord::new("alice", "hunter2", &templates());
        let bob = PlayerRecord::new("bob", "pw", &templates());
        let snapshot = SnapshotBuilder::build(
            &alice,
            &bob,
            false,
            Duration::from_secs(180),
            Duration::from_millis(2_500),
        );

        assert_eq!(snapshot.time_remaining, 177);
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(!json.contains("ATK"));
        assert_eq!(snapshot.player1.towers.len(), 3);
    }

    #[test]
    fn overtime_goes_negative() {
        assert_eq!(
            SnapshotBuilder::time_remaining(Duration::from_secs(10), Duration::from_secs(12)),
            -2
        );
    }
}
