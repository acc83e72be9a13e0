#![doc = include_str!("../README.md")]

pub use destiny_battle as battle;
pub use destiny_event as event;
pub use destiny_item as item;
pub use destiny_network as network;
pub use destiny_protocol as protocol;
pub use destiny_server as server;

pub mod prelude {
    pub use destiny_battle::{
        AttributeProvider, Attributes, BattleEngine, BattleResult, EntityId, Relation,
    };
    pub use destiny_event::{DeliveryMode, EventBus, EventPriority, HandlerConfig};
    pub use destiny_item::{Item, ItemCatalog};
    pub use destiny_network::{
        ConnectionPool, ConnectionRegistry, NetworkError, Session, SessionId,
    };
    pub use destiny_protocol::{Command, Frame, FrameDecoder, FrameEncoder};
    pub use destiny_server::{PacketDispatcher, Server, ServerConfig, ServerKind};
}

#[cfg(test)]
mod tests;
