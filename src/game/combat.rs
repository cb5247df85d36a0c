//! Combat system - damage resolution with critical hits

use rand::Rng;

/// Critical hits scale attack by this factor before defense is applied
pub const CRIT_MULTIPLIER: f64 = 1.2;

/// Attack/defense pair extracted from a tower or troop at the call site
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Combatant {
    pub atk: i32,
    pub def: i32,
}

impl Combatant {
    pub fn new(atk: i32, def: i32) -> Self {
        Self { atk, def }
    }
}

/// Outcome of a single resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Strike {
    pub damage: i32,
    pub crit: bool,
}

/// Stateless damage resolver
pub struct CombatSystem;

impl CombatSystem {
    /// Resolve one hit of `attacker` against `defender`.
    ///
    /// Base damage is `ATK - DEF`, floored at zero. A roll in `[0, 100)` below
    /// `crit_chance` recomputes damage from `floor(ATK * 1.2)`. A defender that
    /// outclasses the attacker takes nothing and no roll is made.
    pub fn resolve<R: Rng + ?Sized>(
        attacker: Combatant,
        defender: Combatant,
        crit_chance: u32,
        rng: &mut R,
    ) -> Strike {
        let base = attacker.atk - defender.def;
        if base < 0 {
            return Strike { damage: 0, crit: false };
        }

        if crit_chance > 0 && rng.gen_range(0..100) < crit_chance {
            return Strike {
                damage: Self::crit_damage(attacker, defender),
                crit: true,
            };
        }

        Strike { damage: base, crit: false }
    }

    /// Damage of a forced critical hit
    pub fn crit_damage(attacker: Combatant, defender: Combatant) -> i32 {
        let boosted = (f64::from(attacker.atk) * CRIT_MULTIPLIER).floor() as i32;
        (boosted - defender.def).max(0)
    }
}
