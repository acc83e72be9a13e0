use serde::{Deserialize, Serialize};

/// Largest amount a stackable item slot can hold.
pub const MAX_STACK: u16 = 999;

/// Socket slots per item.
pub const MAX_SOCKETS: usize = 4;

/// Effect slots per item.
pub const MAX_EFFECTS: usize = 3;

/// Broad item categories from the catalogue. Determines stacking,
/// refinement, and default durability.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum ItemKind {
    #[default]
    None = 0,
    Weapon = 1,
    Armor = 2,
    Helm = 3,
    Boots = 4,
    Shield = 5,
    Glove = 6,
    Amulet = 7,
    Ring = 8,
    Belt = 9,
    Mantle = 10,
    Mount = 11,
    Consumable = 12,
    Material = 13,
    Quest = 14,
}

impl ItemKind {
    pub const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Weapon,
            2 => Self::Armor,
            3 => Self::Helm,
            4 => Self::Boots,
            5 => Self::Shield,
            6 => Self::Glove,
            7 => Self::Amulet,
            8 => Self::Ring,
            9 => Self::Belt,
            10 => Self::Mantle,
            11 => Self::Mount,
            12 => Self::Consumable,
            13 => Self::Material,
            14 => Self::Quest,
            _ => Self::None,
        }
    }

    /// Worn gear: refinable, carries durability.
    pub const fn is_equipment(self) -> bool {
        matches!(
            self,
            Self::Weapon
                | Self::Armor
                | Self::Helm
                | Self::Boots
                | Self::Shield
                | Self::Glove
                | Self::Amulet
                | Self::Ring
                | Self::Belt
                | Self::Mantle
        )
    }

    pub const fn is_stackable(self) -> bool {
        matches!(self, Self::Consumable | Self::Material | Self::Quest)
    }

    /// Kinds that get the legacy default durability of 60 when the
    /// catalogue does not specify one.
    pub const fn has_durability(self) -> bool {
        self.is_equipment() || matches!(self, Self::Mount)
    }
}

/// One bonus effect rolled onto an item.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct ItemEffect {
    pub kind: u8,
    pub value: u8,
}

impl ItemEffect {
    pub const fn is_active(self) -> bool {
        self.kind != 0
    }
}

/// An item as it lives in an inventory slot. Pure value semantics; an
/// all-zero item is the empty slot.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct Item {
    /// Index into the item catalogue. Zero means empty.
    pub index: u16,
    pub amount: u16,
    /// Upgrade tier, 0 to 15.
    pub refine: u8,
    pub luck: bool,
    /// Additional option tier, 0 to 9.
    pub option: u8,
    pub durability: u8,
    pub max_durability: u8,
    pub sockets: [u16; MAX_SOCKETS],
    pub effects: [ItemEffect; MAX_EFFECTS],
}

/// Size of one item in its packed wire and save-file form.
pub const ITEM_WIRE_SIZE: usize = 24;

impl Item {
    pub const fn empty() -> Self {
        Self {
            index: 0,
            amount: 0,
            refine: 0,
            luck: false,
            option: 0,
            durability: 0,
            max_durability: 0,
            sockets: [0; MAX_SOCKETS],
            effects: [ItemEffect { kind: 0, value: 0 }; MAX_EFFECTS],
        }
    }

    pub const fn is_empty(&self) -> bool {
        self.index == 0
    }

    /// Worn below its maximum durability.
    pub const fn is_damaged(&self) -> bool {
        self.max_durability > 0 && self.durability < self.max_durability
    }

    /// Packs the item into its fixed wire layout, little-endian:
    /// index, amount, refine, luck, option, durability, max durability,
    /// one pad byte, four sockets, three effect pairs.
    pub fn pack(&self) -> [u8; ITEM_WIRE_SIZE] {
        use byteorder::{ByteOrder, LittleEndian};

        let mut out = [0_u8; ITEM_WIRE_SIZE];
        LittleEndian::write_u16(&mut out[0..2], self.index);
        LittleEndian::write_u16(&mut out[2..4], self.amount);
        out[4] = self.refine;
        out[5] = u8::from(self.luck);
        out[6] = self.option;
        out[7] = self.durability;
        out[8] = self.max_durability;
        for (slot, socket) in self.sockets.iter().enumerate() {
            LittleEndian::write_u16(&mut out[10 + slot * 2..12 + slot * 2], *socket);
        }
        for (slot, effect) in self.effects.iter().enumerate() {
            out[18 + slot * 2] = effect.kind;
            out[19 + slot * 2] = effect.value;
        }
        out
    }

    /// Inverse of [`pack`](Self::pack).
    pub fn unpack(raw: &[u8; ITEM_WIRE_SIZE]) -> Self {
        use byteorder::{ByteOrder, LittleEndian};

        let mut item = Self {
            index: LittleEndian::read_u16(&raw[0..2]),
            amount: LittleEndian::read_u16(&raw[2..4]),
            refine: raw[4],
            luck: raw[5] != 0,
            option: raw[6],
            durability: raw[7],
            max_durability: raw[8],
            ..Self::empty()
        };
        for slot in 0..MAX_SOCKETS {
            item.sockets[slot] = LittleEndian::read_u16(&raw[10 + slot * 2..12 + slot * 2]);
        }
        for slot in 0..MAX_EFFECTS {
            item.effects[slot] = ItemEffect {
                kind: raw[18 + slot * 2],
                value: raw[19 + slot * 2],
            };
        }
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_item_is_all_zero() {
        assert!(Item::empty().is_empty());
        assert_eq!(Item::empty(), Item::default());
    }

    #[test]
    fn damage_requires_a_durability_cap() {
        let mut item = Item::empty();
        item.durability = 0;
        assert!(!item.is_damaged(), "no cap means nothing to damage");

        item.max_durability = 60;
        item.durability = 59;
        assert!(item.is_damaged());

        item.durability = 60;
        assert!(!item.is_damaged());
    }

    #[test]
    fn pack_round_trip_is_identity() {
        let item = Item {
            index: 17,
            amount: 1,
            refine: 9,
            luck: true,
            option: 3,
            durability: 40,
            max_durability: 60,
            sockets: [101, 0, 7, 0],
            effects: [
                ItemEffect { kind: 2, value: 12 },
                ItemEffect { kind: 0, value: 0 },
                ItemEffect { kind: 5, value: 1 },
            ],
        };

        assert_eq!(Item::unpack(&item.pack()), item);
        assert_eq!(Item::unpack(&Item::empty().pack()), Item::empty());
    }

    #[test]
    fn kind_round_trip_and_classes() {
        for raw in 0..=20_u8 {
            let kind = ItemKind::from_raw(raw);
            if (1..=14).contains(&raw) {
                assert_ne!(kind, ItemKind::None);
            } else {
                assert_eq!(kind, ItemKind::None);
            }
        }
        assert!(ItemKind::Weapon.is_equipment());
        assert!(!ItemKind::Mount.is_equipment());
        assert!(ItemKind::Mount.has_durability());
        assert!(ItemKind::Consumable.is_stackable());
        assert!(!ItemKind::Weapon.is_stackable());
    }
}
