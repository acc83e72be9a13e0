#![doc = include_str!("../README.md")]

pub mod catalog;

mod item;

pub use catalog::{CatalogEntry, CatalogError, ItemCatalog, CLASS_ANY, RECORD_SIZE};
pub use item::{Item, ItemEffect, ItemKind, ITEM_WIRE_SIZE, MAX_EFFECTS, MAX_SOCKETS, MAX_STACK};
