//! The built-in handler set for session-level commands.
//!
//! These are the commands every server kind speaks regardless of the game
//! world behind it: connection init, keepalive, login and character
//! selection, logout, and chat relay. World-dependent commands (movement,
//! combat, inventory) are registered by the embedding world layer, which
//! owns the entity state they mutate.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use destiny_event::{EventBus, EventPayload};
use destiny_network::{CloseReason, ConnectionRegistry};
use destiny_protocol::Command;
use tracing::debug;

use crate::dispatcher::PacketDispatcher;

/// Published when a session finishes the login handshake.
#[derive(Clone, Copy, Debug)]
pub struct SessionAuthenticated {
    pub session_id: u32,
    pub account_id: u32,
}

impl EventPayload for SessionAuthenticated {
    const TYPE_TAG: &'static str = "session.authenticated";
}

pub const EVENT_SESSION_AUTHENTICATED: &str = "session.authenticated";

/// Default per-command rate limits, packets per minute with burst.
const CHAT_RATE: (u32, u32) = (60, 10);
const LOGIN_RATE: (u32, u32) = (10, 2);

/// Registers the session-level command set.
///
/// The login handler here trusts the account id in the payload; a real
/// deployment swaps it for one that checks credentials against the auth
/// backend through the connection pool.
pub fn register_session_handlers(
    dispatcher: &PacketDispatcher,
    registry: Arc<ConnectionRegistry>,
    bus: Arc<EventBus>,
) {
    // Connection init: echo the client tick so the client can measure
    // round-trip time before the rings are exercised.
    dispatcher.register(Command::Init, false, false, |session, frame| {
        session
            .enqueue_frame(Command::Init, frame.client_tick, &[])
            .is_ok()
    });

    // Keepalive: receiving it already refreshed the activity clock.
    dispatcher.register(Command::Keepalive, false, false, |_, _| true);

    // Account login: 4-byte account id, then an opaque credential blob.
    {
        let bus = Arc::clone(&bus);
        dispatcher.register(Command::AccountLogin, false, false, move |session, frame| {
            if frame.body.len() < 4 {
                return false;
            }
            let account_id = LittleEndian::read_u32(&frame.body[0..4]);
            session.mark_authenticated(account_id);
            debug!(session = session.id(), account_id, "session authenticated");
            bus.publish(
                EVENT_SESSION_AUTHENTICATED,
                SessionAuthenticated {
                    session_id: session.id(),
                    account_id,
                },
            );
            true
        });
    }
    dispatcher.set_size_bounds(Command::AccountLogin, 4, 128);
    dispatcher.set_rate_limit(Command::AccountLogin, LOGIN_RATE.0, LOGIN_RATE.1);

    // Character selection moves the session in-game.
    dispatcher.register(Command::CharacterLogin, true, false, |session, frame| {
        if frame.body.len() < 4 {
            return false;
        }
        session.set_character(LittleEndian::read_u32(&frame.body[0..4]));
        true
    });
    dispatcher.set_size_bounds(Command::CharacterLogin, 4, 16);

    // Logout: flag the session; the maintenance loop finalizes it.
    dispatcher.register(Command::Logout, true, false, |session, _| {
        session.mark_closing(CloseReason::Normal);
        true
    });

    // Public chat fans out to every active session.
    {
        let registry = Arc::clone(&registry);
        dispatcher.register(Command::Chat, true, false, move |session, frame| {
            let mut relayed = Vec::with_capacity(4 + frame.body.len());
            relayed.extend_from_slice(&session.id().to_le_bytes());
            relayed.extend_from_slice(&frame.body);
            registry.broadcast(Command::Chat, &relayed) > 0
        });
    }
    dispatcher.set_rate_limit(Command::Chat, CHAT_RATE.0, CHAT_RATE.1);
    dispatcher.set_size_bounds(Command::Chat, 1, 512);

    // Whisper: 4-byte target session id, then the message.
    {
        let registry = Arc::clone(&registry);
        dispatcher.register(Command::Whisper, true, false, move |session, frame| {
            if frame.body.len() < 5 {
                return false;
            }
            let target = LittleEndian::read_u32(&frame.body[0..4]);
            let Some(peer) = registry.get(target) else {
                return false;
            };

            let mut relayed = Vec::with_capacity(frame.body.len());
            relayed.extend_from_slice(&session.id().to_le_bytes());
            relayed.extend_from_slice(&frame.body[4..]);

            let mut peer = peer.lock();
            peer.is_active() && peer.enqueue_frame(Command::Whisper, 0, &relayed).is_ok()
        });
    }
    dispatcher.set_rate_limit(Command::Whisper, CHAT_RATE.0, CHAT_RATE.1);
    dispatcher.set_size_bounds(Command::Whisper, 5, 512);

    // Admin broadcast of a system message.
    {
        let registry = Arc::clone(&registry);
        dispatcher.register(Command::SystemMessage, true, true, move |_, frame| {
            registry.broadcast(Command::SystemMessage, &frame.body) > 0
        });
    }
    dispatcher.set_size_bounds(Command::SystemMessage, 1, 512);
}
