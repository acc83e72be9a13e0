//! Skill definitions and the built-in catalogue.

use rustc_hash::FxHashMap;

use crate::attributes::ResistChannel;

/// What a damage amount means and which defense applies to it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DamageType {
    Physical,
    Ranged,
    Magic,
    Fire,
    Ice,
    Lightning,
    Earth,
    Wind,
    Holy,
    Dark,
    Poison,
    /// Percent of the target's max HP.
    Percentage,
    /// Ignores defense and resistance entirely.
    True,
    Heal,
}

impl DamageType {
    /// The resistance channel this type checks, if any.
    pub const fn resist_channel(self) -> Option<ResistChannel> {
        match self {
            Self::Fire => Some(ResistChannel::Fire),
            Self::Ice => Some(ResistChannel::Ice),
            Self::Lightning => Some(ResistChannel::Lightning),
            Self::Holy => Some(ResistChannel::Holy),
            Self::Dark => Some(ResistChannel::Dark),
            _ => None,
        }
    }

    pub const fn is_magical(self) -> bool {
        matches!(
            self,
            Self::Magic
                | Self::Fire
                | Self::Ice
                | Self::Lightning
                | Self::Earth
                | Self::Wind
                | Self::Holy
                | Self::Dark
                | Self::Poison
        )
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SkillType {
    Attack,
    Heal,
    Buff,
    Debuff,
}

/// Who a skill may land on, matched against the caster/target relation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TargetType {
    Itself,
    Ally,
    Enemy,
    AreaAlly,
    AreaEnemy,
    All,
}

/// Crowd-control category a skill can inflict.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ControlType {
    None,
    Stun,
    Slow,
}

/// Persistent state attached to an entity by combat.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum AffectType {
    Stun,
    Poison,
    Slow,
    DivineProtection,
}

/// Duration in milliseconds for an applied affect, on the legacy schedule.
pub fn effect_duration_ms(affect: AffectType, value: u8) -> u32 {
    let value = u32::from(value);
    match affect {
        AffectType::Stun => 2000 + value * 500,
        AffectType::Poison => 10_000 + value * 1000,
        AffectType::Slow => 5000 + value * 1000,
        AffectType::DivineProtection => 10_000 + value * 2000,
    }
}

/// One skill definition. Static data; levels scale the per-level fields.
#[derive(Clone, Debug)]
pub struct SkillData {
    pub index: u16,
    pub name: &'static str,
    pub skill_type: SkillType,
    pub target_type: TargetType,
    pub damage_type: DamageType,
    pub level_req: u8,
    pub max_level: u8,
    pub mp_cost: u16,
    pub hp_cost: u16,
    pub range: u16,
    pub area: u16,
    pub cast_time_ms: u16,
    pub cooldown_ms: u16,
    pub duration_ms: u16,
    pub damage_base: u16,
    pub damage_per_level: u16,
    pub value_base: u16,
    pub value_per_level: u16,
    pub success_rate: u8,
    pub success_per_level: u8,
    pub control_type: ControlType,
    pub control_value: u8,
    /// Buff/debuff skills map onto an affect.
    pub affect: Option<AffectType>,
}

impl SkillData {
    pub fn damage_at(&self, level: u8) -> i32 {
        i32::from(self.damage_base) + i32::from(self.damage_per_level) * i32::from(level)
    }

    pub fn value_at(&self, level: u8) -> i32 {
        i32::from(self.value_base) + i32::from(self.value_per_level) * i32::from(level)
    }

    pub fn success_at(&self, level: u8) -> i32 {
        i32::from(self.success_rate) + i32::from(self.success_per_level) * i32::from(level)
    }
}

/// The loaded skill table. Seeded with the legacy built-ins; servers with
/// a full skill file extend it at startup.
pub struct SkillCatalog {
    skills: FxHashMap<u16, SkillData>,
}

impl SkillCatalog {
    /// The legacy base catalogue.
    pub fn builtin() -> Self {
        let mut skills = FxHashMap::default();
        for skill in BUILTIN_SKILLS {
            skills.insert(skill.index, skill.clone());
        }
        Self { skills }
    }

    pub fn empty() -> Self {
        Self {
            skills: FxHashMap::default(),
        }
    }

    pub fn register(&mut self, skill: SkillData) {
        self.skills.insert(skill.index, skill);
    }

    pub fn get(&self, index: u16) -> Option<&SkillData> {
        self.skills.get(&index)
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }
}

impl Default for SkillCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

const BUILTIN_SKILLS: &[SkillData] = &[
    SkillData {
        index: 1,
        name: "Power Attack",
        skill_type: SkillType::Attack,
        target_type: TargetType::Enemy,
        damage_type: DamageType::Physical,
        level_req: 1,
        max_level: 10,
        mp_cost: 15,
        hp_cost: 0,
        range: 1,
        area: 0,
        cast_time_ms: 200,
        cooldown_ms: 3000,
        duration_ms: 0,
        damage_base: 150,
        damage_per_level: 20,
        value_base: 0,
        value_per_level: 0,
        success_rate: 100,
        success_per_level: 0,
        control_type: ControlType::None,
        control_value: 0,
        affect: None,
    },
    SkillData {
        index: 2,
        name: "Fireball",
        skill_type: SkillType::Attack,
        target_type: TargetType::Enemy,
        damage_type: DamageType::Fire,
        level_req: 1,
        max_level: 10,
        mp_cost: 20,
        hp_cost: 0,
        range: 7,
        area: 0,
        cast_time_ms: 600,
        cooldown_ms: 2000,
        duration_ms: 0,
        damage_base: 180,
        damage_per_level: 25,
        value_base: 0,
        value_per_level: 0,
        success_rate: 100,
        success_per_level: 0,
        control_type: ControlType::None,
        control_value: 0,
        affect: None,
    },
    SkillData {
        index: 3,
        name: "Firestorm",
        skill_type: SkillType::Attack,
        target_type: TargetType::AreaEnemy,
        damage_type: DamageType::Fire,
        level_req: 30,
        max_level: 10,
        mp_cost: 50,
        hp_cost: 0,
        range: 7,
        area: 3,
        cast_time_ms: 1200,
        cooldown_ms: 8000,
        duration_ms: 0,
        damage_base: 300,
        damage_per_level: 40,
        value_base: 0,
        value_per_level: 0,
        success_rate: 100,
        success_per_level: 0,
        control_type: ControlType::None,
        control_value: 0,
        affect: None,
    },
    SkillData {
        index: 4,
        name: "Brutal Strike",
        skill_type: SkillType::Attack,
        target_type: TargetType::Enemy,
        damage_type: DamageType::Physical,
        level_req: 1,
        max_level: 10,
        mp_cost: 15,
        hp_cost: 0,
        range: 1,
        area: 0,
        cast_time_ms: 200,
        cooldown_ms: 5000,
        duration_ms: 2000,
        damage_base: 160,
        damage_per_level: 20,
        value_base: 0,
        value_per_level: 0,
        success_rate: 70,
        success_per_level: 3,
        control_type: ControlType::Stun,
        control_value: 1,
        affect: Some(AffectType::Stun),
    },
    SkillData {
        index: 5,
        name: "Piercing Arrow",
        skill_type: SkillType::Attack,
        target_type: TargetType::Enemy,
        damage_type: DamageType::Ranged,
        level_req: 1,
        max_level: 10,
        mp_cost: 15,
        hp_cost: 0,
        range: 9,
        area: 0,
        cast_time_ms: 400,
        cooldown_ms: 3000,
        duration_ms: 0,
        damage_base: 170,
        damage_per_level: 20,
        value_base: 0,
        value_per_level: 0,
        success_rate: 100,
        success_per_level: 0,
        control_type: ControlType::None,
        control_value: 0,
        affect: None,
    },
    SkillData {
        index: 6,
        name: "Heal",
        skill_type: SkillType::Heal,
        target_type: TargetType::Ally,
        damage_type: DamageType::Heal,
        level_req: 1,
        max_level: 10,
        mp_cost: 30,
        hp_cost: 0,
        range: 5,
        area: 0,
        cast_time_ms: 800,
        cooldown_ms: 3000,
        duration_ms: 0,
        damage_base: 200,
        damage_per_level: 30,
        value_base: 0,
        value_per_level: 0,
        success_rate: 100,
        success_per_level: 0,
        control_type: ControlType::None,
        control_value: 0,
        affect: None,
    },
    SkillData {
        index: 7,
        name: "Divine Protection",
        skill_type: SkillType::Buff,
        target_type: TargetType::Itself,
        damage_type: DamageType::Physical,
        level_req: 50,
        max_level: 5,
        mp_cost: 50,
        hp_cost: 0,
        range: 0,
        area: 0,
        cast_time_ms: 500,
        cooldown_ms: 30_000,
        duration_ms: 10_000,
        damage_base: 0,
        damage_per_level: 0,
        value_base: 20,
        value_per_level: 5,
        success_rate: 100,
        success_per_level: 0,
        control_type: ControlType::None,
        control_value: 0,
        affect: Some(AffectType::DivineProtection),
    },
];
