#![doc = include_str!("../README.md")]

pub mod attributes;
pub mod ledger;
pub mod skill;

mod result;

use std::sync::Arc;
use std::time::Instant;

pub use attributes::{AttributeProvider, Attributes, EntityId, Relation, ResistChannel};
use destiny_event::{EventBus, EventPayload};
pub use ledger::{DamageEntry, MAX_DAMAGE_RECORDS};
use ledger::DamageLedger;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
pub use result::{AppliedEffect, BattleFlags, BattleResult};
use rustc_hash::FxHashMap;
pub use skill::{
    effect_duration_ms, AffectType, ControlType, DamageType, SkillCatalog, SkillData, SkillType,
    TargetType,
};
use tracing::debug;

/// Critical chance is capped regardless of gear.
pub const MAX_CRITICAL_CHANCE: i32 = 80;

/// Damage absorption cap, percent.
pub const MAX_ABSORB: i32 = 50;

/// Elemental resistance cap, percent.
pub const MAX_MAGIC_RESIST: i32 = 75;

/// Percentage damage-reduction cap.
pub const MAX_DAMAGE_REDUCTION: i32 = 80;

/// Attack speed stat clamp.
pub const MAX_ATTACK_SPEED: i32 = 200;

/// Delay between basic attacks at attack speed 100, milliseconds.
pub const BATTLE_DELAY_NORMAL: u32 = 1200;
pub const BATTLE_DELAY_FAST: u32 = 400;
pub const BATTLE_DELAY_SLOW: u32 = 2400;

/// Published on the bus after every resolved attack or skill hit.
impl EventPayload for BattleResult {
    const TYPE_TAG: &'static str = "battle.result";
}

/// Published when an entity dies; `awardee` receives the experience.
#[derive(Clone, Copy, Debug)]
pub struct EntityDied {
    pub target: EntityId,
    pub awardee: Option<EntityId>,
}

impl EventPayload for EntityDied {
    const TYPE_TAG: &'static str = "battle.entity_died";
}

/// The event types the engine publishes.
pub const EVENT_BATTLE_RESULT: &str = "battle.result";
pub const EVENT_ENTITY_DIED: &str = "battle.entity_died";

struct ActiveEffect {
    affect: AffectType,
    value: u8,
    expires_at_ms: u64,
}

/// The combat engine. Stateless with respect to the world; owns only the
/// damage ledger, the active-effect table, skill cooldowns, and its RNG.
pub struct BattleEngine {
    skills: SkillCatalog,
    ledger: Mutex<DamageLedger>,
    effects: Mutex<FxHashMap<EntityId, Vec<ActiveEffect>>>,
    cooldowns: Mutex<FxHashMap<(EntityId, u16), u64>>,
    rng: Mutex<StdRng>,
    bus: Arc<EventBus>,
    epoch: Instant,
}

impl BattleEngine {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self::with_rng(bus, StdRng::from_entropy())
    }

    /// Engine with a fixed RNG seed, for deterministic tests.
    pub fn with_rng_seed(bus: Arc<EventBus>, seed: u64) -> Self {
        Self::with_rng(bus, StdRng::seed_from_u64(seed))
    }

    fn with_rng(bus: Arc<EventBus>, rng: StdRng) -> Self {
        Self {
            skills: SkillCatalog::builtin(),
            ledger: Mutex::new(DamageLedger::default()),
            effects: Mutex::new(FxHashMap::default()),
            cooldowns: Mutex::new(FxHashMap::default()),
            rng: Mutex::new(rng),
            bus,
            epoch: Instant::now(),
        }
    }

    pub fn skills(&self) -> &SkillCatalog {
        &self.skills
    }

    pub fn skills_mut(&mut self) -> &mut SkillCatalog {
        &mut self.skills
    }

    /// Milliseconds since the engine started; the clock the ledger and
    /// effect expiries run on.
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    // ---- attacks and skills ------------------------------------------

    /// Resolves one basic attack or single-target skill strike.
    pub fn process_attack(
        &self,
        world: &dyn AttributeProvider,
        attacker: EntityId,
        target: EntityId,
        skill_id: u16,
    ) -> BattleResult {
        let now = self.now_ms();

        if !self.can_attack(world, attacker, target) {
            let mut result = BattleResult::between(attacker, target, now);
            result.flags.set_immune(true);
            return result;
        }

        if !self.check_hit(world, attacker, target, skill_id) {
            let mut result = BattleResult::between(attacker, target, now);
            result.flags.set_missed(true);
            result.skill_id = skill_id;
            return result;
        }

        let damage_type = match self.skills.get(skill_id) {
            Some(skill) => skill.damage_type,
            None => DamageType::Physical,
        };

        let mut result = self.calculate_damage(world, attacker, target, damage_type, skill_id, 0);

        self.roll_control_effect(&mut result, skill_id, 0);

        if result.damage > 0 {
            self.record_damage(target, attacker, result.damage, now);
        }

        self.bus.publish(EVENT_BATTLE_RESULT, result.clone());
        result
    }

    /// Executes a skill against each target. Targets the skill cannot
    /// legally land on produce an `Immune`-flagged result.
    pub fn process_skill(
        &self,
        world: &dyn AttributeProvider,
        caster: EntityId,
        targets: &[EntityId],
        skill_id: u16,
        skill_level: u8,
    ) -> Vec<BattleResult> {
        let now = self.now_ms();

        if !self.can_use_skill(world, caster, skill_id, skill_level) {
            debug!(caster, skill_id, "skill use rejected");
            return Vec::new();
        }
        let Some(skill) = self.skills.get(skill_id) else {
            return Vec::new();
        };

        let mut results = Vec::with_capacity(targets.len());

        for &target in targets {
            if !self.can_target_with_skill(world, caster, target, skill_id) {
                let mut result = BattleResult::between(caster, target, now);
                result.flags.set_immune(true);
                result.skill_id = skill_id;
                result.skill_level = skill_level;
                results.push(result);
                continue;
            }

            let mut result = match skill.skill_type {
                SkillType::Attack => {
                    let mut result = self.calculate_damage(
                        world,
                        caster,
                        target,
                        skill.damage_type,
                        skill_id,
                        skill_level,
                    );
                    self.roll_control_effect(&mut result, skill_id, skill_level);
                    result
                }
                SkillType::Heal => {
                    let mut result = BattleResult::between(caster, target, now);
                    result.skill_id = skill_id;
                    if let (Some(att), Some(_)) =
                        (world.attributes(caster), world.attributes(target))
                    {
                        self.calculate_healing(&mut result, &att, skill, skill_level);
                    }
                    result
                }
                SkillType::Buff | SkillType::Debuff => {
                    let mut result = BattleResult::between(caster, target, now);
                    result.skill_id = skill_id;
                    result.flags.set_hit(true);
                    if let Some(affect) = skill.affect {
                        let value = skill.value_at(skill_level).clamp(0, 255) as u8;
                        result.effects.push(AppliedEffect {
                            affect,
                            value,
                            duration_ms: effect_duration_ms(affect, value),
                        });
                    }
                    result
                }
            };

            result.skill_level = skill_level;

            if result.damage > 0 {
                self.record_damage(target, caster, result.damage, now);
            }

            self.bus.publish(EVENT_BATTLE_RESULT, result.clone());
            results.push(result);
        }

        let expires = u64::from(self.skill_cooldown_ms(skill_id));
        self.cooldowns
            .lock()
            .insert((caster, skill_id), now + expires);

        results
    }

    /// Runs the damage pipeline for one attacker/target pair without any
    /// eligibility or hit checks.
    pub fn calculate_damage(
        &self,
        world: &dyn AttributeProvider,
        attacker: EntityId,
        target: EntityId,
        damage_type: DamageType,
        skill_id: u16,
        skill_level: u8,
    ) -> BattleResult {
        let now = self.now_ms();
        let mut result = BattleResult::between(attacker, target, now);
        result.skill_id = skill_id;
        result.skill_level = skill_level;
        result.damage_type = damage_type;

        let (Some(att), Some(def)) = (world.attributes(attacker), world.attributes(target)) else {
            result.flags.set_immune(true);
            return result;
        };

        let skill = self.skills.get(skill_id);

        match damage_type {
            DamageType::Physical | DamageType::Ranged => {
                self.calculate_physical(&mut result, &att, &def, skill, skill_level);
            }
            t if t.is_magical() => {
                self.calculate_magic(&mut result, &att, &def, skill, skill_level, t);
            }
            DamageType::Percentage => {
                let percent = skill.map_or(0, |s| s.damage_at(skill_level));
                result.damage = (def.max_hp * percent / 100).max(1);
                result.flags.set_hit(true);
            }
            DamageType::True => {
                result.damage = skill
                    .map_or(att.phys_max, |s| s.damage_at(skill_level))
                    .max(1);
                result.flags.set_hit(true);
            }
            DamageType::Heal => {
                if let Some(skill) = skill {
                    self.calculate_healing(&mut result, &att, skill, skill_level);
                }
            }
            _ => unreachable!("damage type dispatch is exhaustive"),
        }

        result
    }

    fn calculate_physical(
        &self,
        result: &mut BattleResult,
        att: &Attributes,
        def: &Attributes,
        skill: Option<&SkillData>,
        skill_level: u8,
    ) {
        let base = match skill {
            Some(skill) => skill.damage_at(skill_level),
            None => {
                let high = att.phys_max.max(att.phys_min);
                self.rng.lock().gen_range(att.phys_min..=high)
            }
        };

        let mut damage = (base as f32 * (1.0 + att.strength as f32 * 0.01)) as i32;
        damage = (damage as f32 * (50.0 / (50.0 + def.phys_def as f32))) as i32;

        if self.roll_critical(att) {
            damage = (damage as f32 * (att.crit_damage as f32 / 100.0)) as i32;
            result.flags.set_critical(true);
        }

        damage = self.apply_mitigation(result, def, damage);

        result.damage = damage.max(1);
        result.flags.set_hit(true);

        if def.reflect > 0 {
            result.reflected = (result.damage as f32 * (def.reflect as f32 / 100.0)) as i32;
            if result.reflected > 0 {
                result.flags.set_reflected(true);
            }
        }
    }

    fn calculate_magic(
        &self,
        result: &mut BattleResult,
        att: &Attributes,
        def: &Attributes,
        skill: Option<&SkillData>,
        skill_level: u8,
        damage_type: DamageType,
    ) {
        let base = match skill {
            Some(skill) => skill.damage_at(skill_level),
            None => att.phys_max.max(att.phys_min),
        };

        let mut damage = (base as f32 * (1.0 + att.intelligence as f32 * 0.01)) as i32;
        damage = (damage as f32 * (50.0 / (50.0 + def.mag_def as f32))) as i32;

        if let Some(channel) = damage_type.resist_channel() {
            let resist = def.resist[channel as usize].min(MAX_MAGIC_RESIST);
            if resist > 0 {
                damage = (damage as f32 * (1.0 - resist as f32 / 100.0)) as i32;
                result.flags.set_resisted(true);
            }
        }

        if self.roll_critical(att) {
            damage = (damage as f32 * (att.crit_damage as f32 / 100.0)) as i32;
            result.flags.set_critical(true);
        }

        damage = self.apply_mitigation(result, def, damage);

        result.damage = damage.max(1);
        result.flags.set_hit(true);

        if def.reflect > 0 {
            result.reflected = (result.damage as f32 * (def.reflect as f32 / 100.0)) as i32;
            if result.reflected > 0 {
                result.flags.set_reflected(true);
            }
        }
    }

    /// Percentage reduction then absorption, shared by both pipelines.
    fn apply_mitigation(&self, result: &mut BattleResult, def: &Attributes, damage: i32) -> i32 {
        let mut damage = damage;

        if def.damage_reduction > 0 {
            let reduction = def.damage_reduction.min(MAX_DAMAGE_REDUCTION);
            damage = (damage as f32 * (1.0 - reduction as f32 / 100.0)) as i32;
        }

        if def.absorb > 0 {
            let rate = def.absorb.min(MAX_ABSORB);
            let absorbed = (damage as f32 * (rate as f32 / 100.0)) as i32;
            damage -= absorbed;
            result.absorbed_hp = absorbed;
            if absorbed > 0 {
                result.flags.set_absorbed(true);
            }
        }

        damage
    }

    fn calculate_healing(
        &self,
        result: &mut BattleResult,
        caster: &Attributes,
        skill: &SkillData,
        skill_level: u8,
    ) {
        let base = skill.damage_at(skill_level);
        let healed = (base as f32 * (1.0 + caster.intelligence as f32 * 0.01)) as i32;

        // Healing reports as negative damage; nothing mitigates it.
        result.damage = -healed;
        result.damage_type = DamageType::Heal;
        result.flags.set_hit(true);
    }

    fn roll_critical(&self, att: &Attributes) -> bool {
        let chance = att.crit_chance.min(MAX_CRITICAL_CHANCE);
        chance > 0 && self.rng.lock().gen_range(1..=100) <= chance
    }

    /// Attack rating against evasion, or the skill's own success rate.
    /// Always clamped to a 5..=95 percent chance.
    fn check_hit(
        &self,
        world: &dyn AttributeProvider,
        attacker: EntityId,
        target: EntityId,
        skill_id: u16,
    ) -> bool {
        let (Some(att), Some(def)) = (world.attributes(attacker), world.attributes(target)) else {
            return false;
        };

        let mut chance = att.attack_rating - def.evasion;
        if let Some(skill) = self.skills.get(skill_id) {
            chance = i32::from(skill.success_rate);
        }
        let chance = chance.clamp(5, 95);

        self.rng.lock().gen_range(1..=100) <= chance
    }

    fn roll_control_effect(&self, result: &mut BattleResult, skill_id: u16, skill_level: u8) {
        let Some(skill) = self.skills.get(skill_id) else {
            return;
        };
        if skill.control_type == ControlType::None || !result.flags.hit() {
            return;
        }
        let Some(affect) = skill.affect else {
            return;
        };

        let chance = skill.success_at(skill_level).clamp(0, 100);
        if self.rng.lock().gen_range(1..=100) <= chance {
            result.effects.push(AppliedEffect {
                affect,
                value: skill.control_value,
                duration_ms: effect_duration_ms(affect, skill.control_value),
            });
        }
    }

    // ---- eligibility -------------------------------------------------

    /// Whether `attacker` may swing at `target` at all.
    pub fn can_attack(
        &self,
        world: &dyn AttributeProvider,
        attacker: EntityId,
        target: EntityId,
    ) -> bool {
        let (Some(att), Some(def)) = (world.attributes(attacker), world.attributes(target)) else {
            return false;
        };

        if !def.alive || att.stunned {
            return false;
        }

        let relation_ok = match world.relation(attacker, target) {
            Relation::Itself => false,
            Relation::Ally => att.pvp_enabled && def.pvp_enabled,
            Relation::Enemy => true,
        };

        relation_ok && att.distance_to(&def) <= att.attack_range
    }

    /// Whether `caster` can fire the skill right now: known level, costs
    /// covered, off cooldown, not stunned.
    pub fn can_use_skill(
        &self,
        world: &dyn AttributeProvider,
        caster: EntityId,
        skill_id: u16,
        skill_level: u8,
    ) -> bool {
        let Some(att) = world.attributes(caster) else {
            return false;
        };
        let Some(skill) = self.skills.get(skill_id) else {
            return false;
        };

        if att.stunned
            || skill_level > skill.max_level
            || att.level < u16::from(skill.level_req)
            || att.mp < i32::from(skill.mp_cost)
            || att.hp <= i32::from(skill.hp_cost)
        {
            return false;
        }

        let now = self.now_ms();
        !self
            .cooldowns
            .lock()
            .get(&(caster, skill_id))
            .is_some_and(|&expires| now < expires)
    }

    /// Whether the skill's target type matches how `caster` and `target`
    /// relate, and the target is in range.
    pub fn can_target_with_skill(
        &self,
        world: &dyn AttributeProvider,
        caster: EntityId,
        target: EntityId,
        skill_id: u16,
    ) -> bool {
        let Some(skill) = self.skills.get(skill_id) else {
            return false;
        };
        let (Some(att), Some(def)) = (world.attributes(caster), world.attributes(target)) else {
            return false;
        };

        let relation = world.relation(caster, target);
        let relation_ok = match skill.target_type {
            TargetType::Itself => relation == Relation::Itself,
            TargetType::Ally | TargetType::AreaAlly => {
                matches!(relation, Relation::Itself | Relation::Ally)
            }
            TargetType::Enemy | TargetType::AreaEnemy => relation == Relation::Enemy,
            TargetType::All => true,
        };

        relation_ok
            && (relation == Relation::Itself || att.distance_to(&def) <= i32::from(skill.range))
    }

    // ---- affects -----------------------------------------------------

    /// Attaches an affect to `target` until `duration_ms` elapses.
    pub fn apply_effect(&self, target: EntityId, affect: AffectType, value: u8, duration_ms: u32) {
        let expires_at_ms = self.now_ms() + u64::from(duration_ms);
        let mut effects = self.effects.lock();
        let entry = effects.entry(target).or_default();
        entry.retain(|e| e.affect != affect);
        entry.push(ActiveEffect {
            affect,
            value,
            expires_at_ms,
        });
    }

    pub fn remove_effect(&self, target: EntityId, affect: AffectType) -> bool {
        let mut effects = self.effects.lock();
        let Some(entry) = effects.get_mut(&target) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|e| e.affect != affect);
        before != entry.len()
    }

    /// The affects still live on `target`, pruning expired ones.
    pub fn active_effects(&self, target: EntityId) -> Vec<(AffectType, u8)> {
        let now = self.now_ms();
        let mut effects = self.effects.lock();
        let Some(entry) = effects.get_mut(&target) else {
            return Vec::new();
        };
        entry.retain(|e| e.expires_at_ms > now);
        entry.iter().map(|e| (e.affect, e.value)).collect()
    }

    // ---- attribution -------------------------------------------------

    /// Notes `damage` dealt to `target` at `now_ms` on the engine clock.
    pub fn record_damage(&self, target: EntityId, attacker: EntityId, damage: i32, now_ms: u64) {
        self.ledger.lock().record(target, attacker, damage, now_ms);
    }

    /// Evicts ledger entries older than `max_age_ms`. Called from the
    /// maintenance task.
    pub fn cleanup_damage_records(&self, now_ms: u64, max_age_ms: u64) {
        self.ledger.lock().cleanup(now_ms, max_age_ms);
    }

    pub fn damage_records(&self, target: EntityId) -> Vec<DamageEntry> {
        self.ledger.lock().entries(target)
    }

    /// Each attacker's share of the recorded damage on `target`.
    pub fn damage_contributions(&self, target: EntityId) -> FxHashMap<EntityId, f32> {
        self.ledger.lock().contributions(target)
    }

    /// Who gets the experience if `target` dies now.
    pub fn experience_receiver(&self, target: EntityId) -> Option<EntityId> {
        self.ledger.lock().receiver(target)
    }

    /// Settles a death: picks the awardee (explicit killer wins over the
    /// attribution ledger), announces it, and clears the ledger entry.
    pub fn process_death(&self, target: EntityId, killer: Option<EntityId>) {
        let awardee = killer.or_else(|| self.experience_receiver(target));

        debug!(target, ?awardee, "entity died");
        self.bus
            .publish(EVENT_ENTITY_DIED, EntityDied { target, awardee });

        self.ledger.lock().evict(target);
    }

    // ---- derived timings ---------------------------------------------

    /// Milliseconds between basic attacks for a given attack speed.
    pub fn attack_delay_ms(&self, attack_speed: i32) -> u32 {
        let speed = attack_speed.clamp(1, MAX_ATTACK_SPEED);
        let delay = (f64::from(BATTLE_DELAY_NORMAL) * (100.0 / f64::from(speed))) as u32;
        delay.clamp(BATTLE_DELAY_FAST, BATTLE_DELAY_SLOW)
    }

    pub fn skill_cooldown_ms(&self, skill_id: u16) -> u32 {
        self.skills.get(skill_id).map_or(0, |s| u32::from(s.cooldown_ms))
    }

    pub fn skill_range(&self, skill_id: u16) -> u16 {
        self.skills.get(skill_id).map_or(0, |s| s.range)
    }

    pub fn skill_area(&self, skill_id: u16) -> u16 {
        self.skills.get(skill_id).map_or(0, |s| s.area)
    }

    pub fn skill_mp_cost(&self, skill_id: u16) -> u16 {
        self.skills.get(skill_id).map_or(0, |s| s.mp_cost)
    }

    pub fn skill_hp_cost(&self, skill_id: u16) -> u16 {
        self.skills.get(skill_id).map_or(0, |s| s.hp_cost)
    }
}
