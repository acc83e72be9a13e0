//! The damage-attribution ledger: who hurt whom, recently, by how much.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;

use crate::attributes::EntityId;

/// Most entries retained per target; the oldest fall off first.
pub const MAX_DAMAGE_RECORDS: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DamageEntry {
    pub attacker: EntityId,
    pub damage: i32,
    pub timestamp_ms: u64,
}

/// Per-target bounded history of inflicted damage.
#[derive(Default)]
pub(crate) struct DamageLedger {
    records: FxHashMap<EntityId, VecDeque<DamageEntry>>,
}

impl DamageLedger {
    pub(crate) fn record(
        &mut self,
        target: EntityId,
        attacker: EntityId,
        damage: i32,
        now_ms: u64,
    ) {
        let entries = self.records.entry(target).or_default();
        entries.push_back(DamageEntry {
            attacker,
            damage,
            timestamp_ms: now_ms,
        });
        if entries.len() > MAX_DAMAGE_RECORDS {
            entries.pop_front();
        }
    }

    /// Drops entries older than `max_age_ms` everywhere.
    pub(crate) fn cleanup(&mut self, now_ms: u64, max_age_ms: u64) {
        for entries in self.records.values_mut() {
            while entries
                .front()
                .is_some_and(|e| now_ms.saturating_sub(e.timestamp_ms) > max_age_ms)
            {
                entries.pop_front();
            }
        }
        self.records.retain(|_, entries| !entries.is_empty());
    }

    pub(crate) fn entries(&self, target: EntityId) -> Vec<DamageEntry> {
        self.records
            .get(&target)
            .map(|e| e.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Fraction of the recorded total each attacker dealt.
    pub(crate) fn contributions(&self, target: EntityId) -> FxHashMap<EntityId, f32> {
        let Some(entries) = self.records.get(&target) else {
            return FxHashMap::default();
        };

        let total: i64 = entries.iter().map(|e| i64::from(e.damage)).sum();
        if total <= 0 {
            return FxHashMap::default();
        }

        let mut by_attacker: FxHashMap<EntityId, i64> = FxHashMap::default();
        for entry in entries {
            *by_attacker.entry(entry.attacker).or_default() += i64::from(entry.damage);
        }

        by_attacker
            .into_iter()
            .map(|(id, dmg)| (id, dmg as f32 / total as f32))
            .collect()
    }

    /// The attacker with the greatest summed damage. Ties go to whoever
    /// landed the most recent hit.
    pub(crate) fn receiver(&self, target: EntityId) -> Option<EntityId> {
        let entries = self.records.get(&target)?;

        let mut totals: FxHashMap<EntityId, (i64, usize)> = FxHashMap::default();
        for (position, entry) in entries.iter().enumerate() {
            let slot = totals.entry(entry.attacker).or_insert((0, 0));
            slot.0 += i64::from(entry.damage);
            slot.1 = position;
        }

        totals
            .into_iter()
            .max_by_key(|&(_, (total, last_hit))| (total, last_hit))
            .map(|(id, _)| id)
    }

    pub(crate) fn evict(&mut self, target: EntityId) {
        self.records.remove(&target);
    }

    pub(crate) fn tracked_targets(&self) -> usize {
        self.records.len()
    }
}
