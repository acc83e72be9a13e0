//! The static item catalogue: a flat file of fixed-size records, loaded
//! once at startup and read-only afterwards.

use std::fmt::Write as _;
use std::path::Path;
use std::{fs, io};

use byteorder::{ByteOrder, LittleEndian};
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{info, warn};

use crate::item::{Item, ItemKind, MAX_STACK};

/// Size of one packed catalogue record on disk.
pub const RECORD_SIZE: usize = 64;

const NAME_LEN: usize = 24;

/// Required-class sentinel meaning any class may equip the item.
pub const CLASS_ANY: u8 = 0xFF;

/// Durability assigned to gear whose record does not specify one.
const DEFAULT_DURABILITY: u8 = 60;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read item catalogue: {0}")]
    Io(#[from] io::Error),
    #[error("item catalogue is empty")]
    Empty,
}

/// One catalogue record. Fixed layout, little-endian:
///
/// | offset | size | field      |
/// |--------|------|------------|
/// | 0      | 24   | name (null-padded) |
/// | 24     | 1    | kind       |
/// | 25     | 1    | req_class  |
/// | 26     | 2    | req_level  |
/// | 28     | 2    | req_str    |
/// | 30     | 2    | req_int    |
/// | 32     | 2    | req_dex    |
/// | 34     | 2    | req_con    |
/// | 36     | 4    | price      |
/// | 40     | 4    | sell_price |
/// | 44     | 1    | durability |
/// | 46     | 2    | damage     |
/// | 48     | 2    | defense    |
/// | 50     | 14   | reserved   |
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CatalogEntry {
    pub name: String,
    pub kind: ItemKind,
    /// Bitmask of classes allowed to equip, or [`CLASS_ANY`].
    pub req_class: u8,
    pub req_level: u16,
    pub req_str: u16,
    pub req_int: u16,
    pub req_dex: u16,
    pub req_con: u16,
    pub price: u32,
    pub sell_price: u32,
    pub durability: u8,
    pub damage: u16,
    pub defense: u16,
}

impl CatalogEntry {
    /// Parses one packed record. Returns `None` for the all-zero filler
    /// records the legacy file pads unused indices with.
    fn parse(record: &[u8]) -> Option<Self> {
        if record.iter().all(|&b| b == 0) {
            return None;
        }

        let name_end = record[..NAME_LEN]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(NAME_LEN);
        let name = String::from_utf8_lossy(&record[..name_end]).into_owned();

        Some(Self {
            name,
            kind: ItemKind::from_raw(record[24]),
            req_class: record[25],
            req_level: LittleEndian::read_u16(&record[26..28]),
            req_str: LittleEndian::read_u16(&record[28..30]),
            req_int: LittleEndian::read_u16(&record[30..32]),
            req_dex: LittleEndian::read_u16(&record[32..34]),
            req_con: LittleEndian::read_u16(&record[34..36]),
            price: LittleEndian::read_u32(&record[36..40]),
            sell_price: LittleEndian::read_u32(&record[40..44]),
            durability: record[44],
            damage: LittleEndian::read_u16(&record[46..48]),
            defense: LittleEndian::read_u16(&record[48..50]),
        })
    }

    /// Packs the record back into its on-disk form. Used by tooling and
    /// tests that author catalogue files.
    pub fn pack(&self) -> [u8; RECORD_SIZE] {
        let mut record = [0_u8; RECORD_SIZE];
        let name_len = self.name.len().min(NAME_LEN);
        record[..name_len].copy_from_slice(&self.name.as_bytes()[..name_len]);
        record[24] = self.kind as u8;
        record[25] = self.req_class;
        LittleEndian::write_u16(&mut record[26..28], self.req_level);
        LittleEndian::write_u16(&mut record[28..30], self.req_str);
        LittleEndian::write_u16(&mut record[30..32], self.req_int);
        LittleEndian::write_u16(&mut record[32..34], self.req_dex);
        LittleEndian::write_u16(&mut record[34..36], self.req_con);
        LittleEndian::write_u32(&mut record[36..40], self.price);
        LittleEndian::write_u32(&mut record[40..44], self.sell_price);
        record[44] = self.durability;
        LittleEndian::write_u16(&mut record[46..48], self.damage);
        LittleEndian::write_u16(&mut record[48..50], self.defense);
        record
    }
}

/// The loaded catalogue. Frozen after construction; shared without a lock.
#[derive(Default)]
pub struct ItemCatalog {
    entries: FxHashMap<u16, CatalogEntry>,
}

impl ItemCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the packed catalogue file. The record's position in the file
    /// is its catalogue index; index 0 is the empty sentinel and skipped.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let bytes = fs::read(path.as_ref())?;

        let record_count = bytes.len() / RECORD_SIZE;
        if record_count == 0 {
            return Err(CatalogError::Empty);
        }
        if bytes.len() % RECORD_SIZE != 0 {
            warn!(
                trailing = bytes.len() % RECORD_SIZE,
                "item catalogue has trailing bytes, ignoring"
            );
        }

        let mut entries = FxHashMap::default();
        for (index, record) in bytes.chunks_exact(RECORD_SIZE).enumerate().skip(1) {
            if let Some(entry) = CatalogEntry::parse(record) {
                entries.insert(index as u16, entry);
            }
        }

        if entries.is_empty() {
            return Err(CatalogError::Empty);
        }

        info!(count = entries.len(), "loaded item catalogue");
        Ok(Self { entries })
    }

    /// Registers or replaces an entry directly. For tests and tooling.
    pub fn register_entry(&mut self, index: u16, entry: CatalogEntry) {
        if index == 0 {
            warn!("ignoring attempt to register catalogue index 0");
            return;
        }
        self.entries.insert(index, entry);
    }

    pub fn entry(&self, index: u16) -> Option<&CatalogEntry> {
        self.entries.get(&index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn item_name(&self, index: u16) -> Option<&str> {
        self.entry(index).map(|e| e.name.as_str())
    }

    pub fn is_stackable(&self, index: u16) -> bool {
        self.entry(index).is_some_and(|e| e.kind.is_stackable())
    }

    pub fn is_refinable(&self, index: u16) -> bool {
        self.entry(index).is_some_and(|e| e.kind.is_equipment())
    }

    /// Creates an item of `index`, clamping every field into its legal
    /// range. Unknown indices produce the empty item.
    pub fn new_item(&self, index: u16, amount: u16, refine: u8, luck: bool, option: u8) -> Item {
        if index == 0 {
            return Item::empty();
        }

        let Some(entry) = self.entry(index) else {
            warn!(index, "attempted to create item with unknown catalogue index");
            return Item::empty();
        };

        let mut item = Item {
            index,
            amount,
            ..Item::empty()
        };

        if entry.kind.is_stackable() {
            item.amount = amount.clamp(1, MAX_STACK);
        } else {
            item.amount = 1;
        }

        if entry.kind.is_equipment() {
            item.refine = refine.min(15);
            item.luck = luck;
            item.option = option.min(9);
        }

        item.max_durability = self.max_durability(index);
        item.durability = item.max_durability;

        item
    }

    /// The durability cap for `index`: the catalogue's own value when
    /// present, otherwise the legacy default of 60 for gear and mounts.
    pub fn max_durability(&self, index: u16) -> u8 {
        let Some(entry) = self.entry(index) else {
            return 0;
        };
        if entry.durability > 0 {
            entry.durability
        } else if entry.kind.has_durability() {
            DEFAULT_DURABILITY
        } else {
            0
        }
    }

    /// Buy or sell price of `item`, with the legacy integer adjustments:
    /// durability ratio on damaged sells, +20% per refine level, +30% for
    /// luck, +25% per option point, times the stack amount.
    pub fn price(&self, item: &Item, selling: bool) -> u32 {
        if item.is_empty() {
            return 0;
        }
        let Some(entry) = self.entry(item.index) else {
            return 0;
        };

        let mut price = u64::from(if selling { entry.sell_price } else { entry.price });

        if selling && item.is_damaged() {
            price = price * u64::from(item.durability) / u64::from(item.max_durability);
        }

        if entry.kind.is_equipment() && item.refine > 0 {
            price += price * u64::from(item.refine) * 20 / 100;
        }

        if item.luck {
            price += price * 30 / 100;
        }

        if item.option > 0 {
            price += price * u64::from(item.option) * 25 / 100;
        }

        if entry.kind.is_stackable() && item.amount > 1 {
            price *= u64::from(item.amount);
        }

        price.min(u64::from(u32::MAX)) as u32
    }

    /// Whether `class` can wear the item at all.
    pub fn can_equip(&self, index: u16, class: u8) -> bool {
        let Some(entry) = self.entry(index) else {
            return false;
        };
        entry.req_class == CLASS_ANY || entry.req_class & (1 << class) != 0
    }

    /// Whether the given stats clear every requirement threshold.
    pub fn meets_requirements(
        &self,
        index: u16,
        level: u16,
        str_: u16,
        int: u16,
        dex: u16,
        con: u16,
    ) -> bool {
        let Some(entry) = self.entry(index) else {
            return false;
        };
        level >= entry.req_level
            && str_ >= entry.req_str
            && int >= entry.req_int
            && dex >= entry.req_dex
            && con >= entry.req_con
    }

    /// Human-readable item summary for logs and admin tooling.
    pub fn describe(&self, item: &Item) -> String {
        if item.is_empty() {
            return "empty".to_owned();
        }

        let mut out = match self.item_name(item.index) {
            Some(name) => name.to_owned(),
            None => format!("#{}", item.index),
        };

        if item.refine > 0 {
            let _ = write!(out, " +{}", item.refine);
        }
        if item.luck {
            out.push_str(" (luck)");
        }
        if item.option > 0 {
            let _ = write!(out, " (opt {})", item.option);
        }
        if item.amount > 1 {
            let _ = write!(out, " x{}", item.amount);
        }
        if item.max_durability > 0 {
            let _ = write!(out, " [{}/{}]", item.durability, item.max_durability);
        }
        for effect in item.effects.iter().filter(|e| e.is_active()) {
            let _ = write!(out, " {{{}:{}}}", effect.kind, effect.value);
        }

        out
    }
}

/// Multiplies `base` by the refine growth curve: +7% per level, saturating
/// at `u16::MAX`. Monotone in the refine level.
pub fn refined_value(base: u16, refine: u8) -> u16 {
    if refine == 0 || base == 0 {
        return base;
    }
    let scaled = u32::from(base) * (100 + u32::from(refine) * 7) / 100;
    scaled.min(u32::from(u16::MAX)) as u16
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn weapon(name: &str, price: u32, sell_price: u32) -> CatalogEntry {
        CatalogEntry {
            name: name.to_owned(),
            kind: ItemKind::Weapon,
            req_class: CLASS_ANY,
            req_level: 0,
            req_str: 0,
            req_int: 0,
            req_dex: 0,
            req_con: 0,
            price,
            sell_price,
            durability: 0,
            damage: 10,
            defense: 0,
        }
    }

    fn potion(price: u32, sell_price: u32) -> CatalogEntry {
        CatalogEntry {
            kind: ItemKind::Consumable,
            damage: 0,
            ..weapon("Small Potion", price, sell_price)
        }
    }

    fn catalog() -> ItemCatalog {
        let mut catalog = ItemCatalog::new();
        catalog.register_entry(17, weapon("Ancient Sword", 1000, 600));
        catalog.register_entry(401, potion(30, 10));
        catalog
    }

    #[test]
    fn refined_lucky_optioned_weapon_price() {
        let catalog = catalog();
        let item = catalog.new_item(17, 1, 3, true, 2);

        // 1000 * 1.6 * 1.3 * 1.5 with the legacy integer steps.
        assert_eq!(catalog.price(&item, false), 3120);
    }

    #[test]
    fn sell_price_never_exceeds_buy_price() {
        let catalog = catalog();
        for (index, refine, luck, option, amount) in [
            (17, 0, false, 0, 1),
            (17, 15, true, 9, 1),
            (401, 0, false, 0, 999),
        ] {
            let item = catalog.new_item(index, amount, refine, luck, option);
            assert!(
                catalog.price(&item, true) <= catalog.price(&item, false),
                "sell > buy for index {index}"
            );
        }
    }

    #[test]
    fn damaged_gear_sells_at_durability_ratio() {
        let catalog = catalog();
        let mut item = catalog.new_item(17, 1, 0, false, 0);
        assert_eq!(item.max_durability, 60);

        let intact = catalog.price(&item, true);
        item.durability = 30;
        assert_eq!(catalog.price(&item, true), intact / 2);
    }

    #[test]
    fn clamps_on_creation() {
        let catalog = catalog();

        let sword = catalog.new_item(17, 5, 99, true, 42);
        assert_eq!(sword.amount, 1, "gear never stacks");
        assert_eq!(sword.refine, 15);
        assert_eq!(sword.option, 9);

        let potions = catalog.new_item(401, 5000, 3, true, 2);
        assert_eq!(potions.amount, MAX_STACK);
        assert_eq!(potions.refine, 0, "consumables take no refinement");
        assert!(!potions.luck);

        assert!(catalog.new_item(0, 1, 0, false, 0).is_empty());
        assert!(catalog.new_item(9999, 1, 0, false, 0).is_empty());
    }

    #[test]
    fn stack_price_scales_with_amount() {
        let catalog = catalog();
        let one = catalog.new_item(401, 1, 0, false, 0);
        let many = catalog.new_item(401, 25, 0, false, 0);
        assert_eq!(catalog.price(&many, false), catalog.price(&one, false) * 25);
    }

    #[test]
    fn requirements_and_class_gate() {
        let mut catalog = ItemCatalog::new();
        catalog.register_entry(
            20,
            CatalogEntry {
                req_class: 0b0000_0010,
                req_level: 40,
                req_str: 80,
                ..weapon("Knight Blade", 500, 250)
            },
        );

        assert!(catalog.can_equip(20, 1));
        assert!(!catalog.can_equip(20, 0));
        assert!(!catalog.can_equip(17, 3), "unknown index");

        assert!(catalog.meets_requirements(20, 40, 80, 0, 0, 0));
        assert!(!catalog.meets_requirements(20, 39, 80, 0, 0, 0));
        assert!(!catalog.meets_requirements(20, 40, 79, 0, 0, 0));
    }

    #[test]
    fn refined_value_grows_monotonically_and_saturates() {
        for refine in 0..15_u8 {
            assert!(refined_value(100, refine + 1) >= refined_value(100, refine));
        }
        assert_eq!(refined_value(100, 1), 107);
        assert_eq!(refined_value(100, 15), 205);
        assert_eq!(refined_value(u16::MAX, 15), u16::MAX);
        assert_eq!(refined_value(0, 7), 0);
    }

    #[test]
    fn load_skips_sentinel_and_round_trips_records() {
        let mut file = tempfile::NamedTempFile::new().unwrap();

        // Index 0 sentinel, then two real records.
        file.write_all(&[0_u8; RECORD_SIZE]).unwrap();
        file.write_all(&weapon("Ancient Sword", 1000, 600).pack())
            .unwrap();
        file.write_all(&potion(30, 10).pack()).unwrap();
        file.flush().unwrap();

        let catalog = ItemCatalog::load(file.path()).unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.item_name(1), Some("Ancient Sword"));
        assert_eq!(catalog.entry(2).unwrap().kind, ItemKind::Consumable);
        assert!(catalog.entry(0).is_none());
    }

    #[test]
    fn serde_round_trip_is_identity() {
        let catalog = catalog();
        let item = catalog.new_item(17, 1, 7, true, 3);

        let json = serde_json::to_string(&item).unwrap();
        let back: Item = serde_json::from_str(&json).unwrap();
        assert_eq!(back, item);
    }
}
