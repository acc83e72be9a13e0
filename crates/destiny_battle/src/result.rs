use bitfield_struct::bitfield;

use crate::attributes::EntityId;
use crate::skill::{AffectType, DamageType};

/// Outcome flags packed the way the legacy result word lays them out.
#[bitfield(u16)]
#[derive(PartialEq, Eq)]
pub struct BattleFlags {
    pub hit: bool,
    pub critical: bool,
    pub missed: bool,
    pub blocked: bool,
    pub resisted: bool,
    pub reflected: bool,
    pub absorbed: bool,
    pub immune: bool,
    #[bits(8)]
    _padding: u8,
}

/// An affect attached to the target by this attack, with its resolved
/// duration.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AppliedEffect {
    pub affect: AffectType,
    pub value: u8,
    pub duration_ms: u32,
}

/// Everything one resolved attack, skill hit, or heal produced.
///
/// Negative `damage` is healing. Logic failures (invalid target, missed,
/// immune) come back as flags; the struct is never an error.
#[derive(Clone, Debug)]
pub struct BattleResult {
    pub attacker: EntityId,
    pub target: EntityId,
    pub damage: i32,
    pub damage_type: DamageType,
    /// 0 for a basic attack.
    pub skill_id: u16,
    pub skill_level: u8,
    pub flags: BattleFlags,
    /// Damage the target converted to HP.
    pub absorbed_hp: i32,
    /// Damage to bounce back at the attacker. The caller re-enters
    /// `process_attack` in the reverse direction with this.
    pub reflected: i32,
    pub effects: Vec<AppliedEffect>,
    /// Milliseconds on the engine clock.
    pub timestamp_ms: u64,
}

impl BattleResult {
    pub(crate) fn between(attacker: EntityId, target: EntityId, timestamp_ms: u64) -> Self {
        Self {
            attacker,
            target,
            damage: 0,
            damage_type: DamageType::Physical,
            skill_id: 0,
            skill_level: 0,
            flags: BattleFlags::new(),
            absorbed_hp: 0,
            reflected: 0,
            effects: Vec::new(),
            timestamp_ms,
        }
    }

    pub fn is_heal(&self) -> bool {
        self.damage < 0
    }
}
