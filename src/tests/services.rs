//! Service-level checks driven through the facade re-exports.

use std::sync::Arc;
use std::time::Duration;

use crate::event::{EventBus, HandlerConfig};
use crate::item::{CatalogEntry, ItemCatalog, ItemKind, CLASS_ANY};
use crate::network::{ConnectionPool, NetworkError, PoolSettings};

#[tokio::test]
async fn pool_acquire_with_zero_wait_returns_immediately() {
    let pool = ConnectionPool::new(PoolSettings::default(), Arc::new(EventBus::default()));

    let started = std::time::Instant::now();
    let err = pool.acquire(None, Duration::ZERO).await.unwrap_err();

    assert!(matches!(err, NetworkError::NoHealthyServer));
    assert!(started.elapsed() < Duration::from_secs(1), "no wait happened");
}

#[test]
fn bus_subscription_count_round_trips() {
    struct Tick;
    impl crate::event::EventPayload for Tick {
        const TYPE_TAG: &'static str = "test.tick";
    }

    let bus = EventBus::default();
    let before = bus.handler_count("tick");

    let id = bus.subscribe::<Tick, _>("tick", HandlerConfig::default(), |_| true);
    assert_eq!(bus.handler_count("tick"), before + 1);
    assert!(bus.unsubscribe("tick", id));
    assert_eq!(bus.handler_count("tick"), before);
}

#[test]
fn selling_never_beats_buying_across_the_modifier_grid() {
    let mut catalog = ItemCatalog::new();
    catalog.register_entry(
        1,
        CatalogEntry {
            name: "Grid Sword".to_owned(),
            kind: ItemKind::Weapon,
            req_class: CLASS_ANY,
            req_level: 0,
            req_str: 0,
            req_int: 0,
            req_dex: 0,
            req_con: 0,
            price: 1000,
            sell_price: 600,
            durability: 0,
            damage: 10,
            defense: 0,
        },
    );

    for refine in [0_u8, 1, 7, 15] {
        for luck in [false, true] {
            for option in [0_u8, 3, 9] {
                let mut item = catalog.new_item(1, 1, refine, luck, option);
                for durability in [60_u8, 30, 1] {
                    item.durability = durability;
                    assert!(
                        catalog.price(&item, true) <= catalog.price(&item, false),
                        "sell > buy at +{refine} luck={luck} opt={option} dur={durability}"
                    );
                }
            }
        }
    }
}

#[test]
fn prelude_exposes_the_working_surface() {
    use crate::prelude::*;

    let config = ServerConfig::default();
    assert_eq!(config.port, 8281);

    let dispatcher = PacketDispatcher::new();
    let mut session = Session::detached(1);
    let frame = Frame {
        command: Command::Keepalive,
        client_tick: 0,
        body: bytes::BytesMut::new(),
    };
    // No handler registered: silently dropped, exactly one drop counted.
    dispatcher.process(&mut session, &frame);
    assert_eq!(dispatcher.global_stats().dropped_packets, 1);
}
