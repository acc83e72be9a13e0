//! The central packet dispatcher.
//!
//! Routes inbound frames by command code to registered handlers, applying
//! the policy pipeline in a fixed order: lookup, authentication, admin,
//! size bounds, global validators, rate limit. Dropped packets are counted
//! and never answered; the legacy client sees silence either way.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use destiny_network::{FrameHandler, Session};
use destiny_protocol::{Command, Frame, MAX_PAYLOAD_SIZE};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

/// The account id with administrative rights, per the legacy convention.
pub const ADMIN_ACCOUNT_ID: u32 = 1;

/// Default per-session cap across all commands, packets per minute.
pub const DEFAULT_GLOBAL_RATE_LIMIT: u32 = 3000;

/// Default burst allowance on top of a per-command limit.
pub const DEFAULT_BURST_SIZE: u32 = 10;

/// A packet handler. Returns whether the packet was processed
/// successfully; failures are recorded, never unwound.
pub type PacketHandlerFn = Box<dyn Fn(&mut Session, &Frame) -> bool + Send + Sync>;

/// A validator applied to every packet before its handler runs.
pub type ValidatorFn = Box<dyn Fn(&Session, Command, &[u8]) -> bool + Send + Sync>;

/// Why the pipeline refused a packet.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DropReason {
    UnknownCommand,
    NotAuthenticated,
    AdminOnly,
    SizeOutOfBounds,
    ValidatorRejected,
    RateLimited,
}

/// What `process` did with a packet.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DispatchOutcome {
    Handled,
    /// The handler ran and reported failure.
    Failed,
    Dropped(DropReason),
}

#[derive(Default)]
struct EntryStats {
    count: AtomicU64,
    bytes: AtomicU64,
    micros: AtomicU64,
    failures: AtomicU64,
}

struct HandlerEntry {
    handler: PacketHandlerFn,
    requires_auth: bool,
    admin_only: bool,
    min_size: usize,
    max_size: usize,
    packets_per_minute: u32,
    burst_size: u32,
    logging: bool,
    log_payload: bool,
    stats: EntryStats,
}

/// Per-command stats snapshot.
#[derive(Clone, Copy, Debug, Default)]
pub struct PacketStats {
    pub count: u64,
    pub mean_time_micros: u64,
    pub failure_rate: f32,
    pub mean_size: u64,
}

/// Dispatcher-wide stats snapshot.
#[derive(Clone, Copy, Debug, Default)]
pub struct GlobalStats {
    pub total_packets: u64,
    pub mean_time_micros: u64,
    pub dropped_packets: u64,
}

/// The routing table. Read-mostly: dispatches share a read lock while
/// registration changes take the write lock.
pub struct PacketDispatcher {
    handlers: RwLock<FxHashMap<Command, HandlerEntry>>,
    validators: Mutex<Vec<(u32, ValidatorFn)>>,
    next_validator_id: AtomicU32,

    total_packets: AtomicU64,
    total_micros: AtomicU64,
    dropped_packets: AtomicU64,

    drop_unknown: AtomicBool,
    log_unknown: AtomicBool,
    strict_mode: AtomicBool,
    global_rate_limit: AtomicU32,
}

impl PacketDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(FxHashMap::default()),
            validators: Mutex::new(Vec::new()),
            next_validator_id: AtomicU32::new(1),
            total_packets: AtomicU64::new(0),
            total_micros: AtomicU64::new(0),
            dropped_packets: AtomicU64::new(0),
            drop_unknown: AtomicBool::new(true),
            log_unknown: AtomicBool::new(true),
            strict_mode: AtomicBool::new(false),
            global_rate_limit: AtomicU32::new(DEFAULT_GLOBAL_RATE_LIMIT),
        }
    }

    // ---- registration ------------------------------------------------

    pub fn register<F>(&self, command: Command, requires_auth: bool, admin_only: bool, handler: F)
    where
        F: Fn(&mut Session, &Frame) -> bool + Send + Sync + 'static,
    {
        let entry = HandlerEntry {
            handler: Box::new(handler),
            requires_auth,
            admin_only,
            min_size: 0,
            max_size: MAX_PAYLOAD_SIZE,
            packets_per_minute: 0,
            burst_size: DEFAULT_BURST_SIZE,
            logging: false,
            log_payload: false,
            stats: EntryStats::default(),
        };
        self.handlers.write().insert(command, entry);
    }

    pub fn unregister(&self, command: Command) -> bool {
        self.handlers.write().remove(&command).is_some()
    }

    pub fn is_registered(&self, command: Command) -> bool {
        self.handlers.read().contains_key(&command)
    }

    pub fn set_rate_limit(&self, command: Command, packets_per_minute: u32, burst_size: u32) -> bool {
        let mut handlers = self.handlers.write();
        let Some(entry) = handlers.get_mut(&command) else {
            return false;
        };
        entry.packets_per_minute = packets_per_minute;
        entry.burst_size = burst_size;
        true
    }

    pub fn set_size_bounds(&self, command: Command, min_size: usize, max_size: usize) -> bool {
        let mut handlers = self.handlers.write();
        let Some(entry) = handlers.get_mut(&command) else {
            return false;
        };
        entry.min_size = min_size;
        entry.max_size = max_size.min(MAX_PAYLOAD_SIZE);
        true
    }

    pub fn set_logging(&self, command: Command, enabled: bool, log_payload: bool) -> bool {
        let mut handlers = self.handlers.write();
        let Some(entry) = handlers.get_mut(&command) else {
            return false;
        };
        entry.logging = enabled;
        entry.log_payload = log_payload;
        true
    }

    pub fn register_global_validator<F>(&self, validator: F) -> u32
    where
        F: Fn(&Session, Command, &[u8]) -> bool + Send + Sync + 'static,
    {
        let id = self.next_validator_id.fetch_add(1, Ordering::Relaxed);
        self.validators.lock().push((id, Box::new(validator)));
        id
    }

    pub fn unregister_global_validator(&self, id: u32) -> bool {
        let mut validators = self.validators.lock();
        let before = validators.len();
        validators.retain(|(vid, _)| *vid != id);
        before != validators.len()
    }

    /// Policy for frames whose command has no registered handler.
    pub fn set_unknown_packet_policy(&self, drop: bool, log: bool) {
        self.drop_unknown.store(drop, Ordering::Relaxed);
        self.log_unknown.store(log, Ordering::Relaxed);
    }

    pub fn set_global_rate_limit(&self, packets_per_minute: u32) {
        self.global_rate_limit
            .store(packets_per_minute, Ordering::Relaxed);
    }

    /// Strict mode tightens validation; currently it makes handler
    /// failures count as validator rejections for follow-up tooling.
    pub fn set_strict_mode(&self, strict: bool) {
        self.strict_mode.store(strict, Ordering::Relaxed);
    }

    // ---- dispatch ----------------------------------------------------

    /// Runs the policy pipeline and, if everything passes, the handler.
    pub fn process(&self, session: &mut Session, frame: &Frame) -> DispatchOutcome {
        let command = frame.command;
        let payload = &frame.body[..];

        let handlers = self.handlers.read();
        let Some(entry) = handlers.get(&command) else {
            drop(handlers);
            if self.log_unknown.load(Ordering::Relaxed) {
                debug!(session = session.id(), ?command, "unhandled command");
            }
            return self.drop_packet(DropReason::UnknownCommand);
        };

        if entry.requires_auth && !session.authenticated {
            return self.drop_packet(DropReason::NotAuthenticated);
        }

        if entry.admin_only && session.account_id != Some(ADMIN_ACCOUNT_ID) {
            return self.drop_packet(DropReason::AdminOnly);
        }

        if payload.len() < entry.min_size || payload.len() > entry.max_size {
            return self.drop_packet(DropReason::SizeOutOfBounds);
        }

        let rejected = {
            let validators = self.validators.lock();
            validators
                .iter()
                .any(|(_, validator)| !validator(session, command, payload))
        };
        if rejected {
            return self.drop_packet(DropReason::ValidatorRejected);
        }

        let now = tokio::time::Instant::now();
        let admitted = session.rate.admit(
            now,
            command.to_raw(),
            entry.packets_per_minute,
            entry.burst_size,
            self.global_rate_limit.load(Ordering::Relaxed),
        );
        if !admitted {
            return self.drop_packet(DropReason::RateLimited);
        }

        if entry.logging {
            if entry.log_payload {
                debug!(session = session.id(), ?command, ?payload, "packet");
            } else {
                debug!(
                    session = session.id(),
                    ?command,
                    size = payload.len(),
                    "packet"
                );
            }
        }

        let started = Instant::now();
        let ok = (entry.handler)(session, frame);
        let elapsed = started.elapsed().as_micros() as u64;

        entry.stats.count.fetch_add(1, Ordering::Relaxed);
        entry
            .stats
            .bytes
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
        entry.stats.micros.fetch_add(elapsed, Ordering::Relaxed);
        self.total_packets.fetch_add(1, Ordering::Relaxed);
        self.total_micros.fetch_add(elapsed, Ordering::Relaxed);

        if ok {
            DispatchOutcome::Handled
        } else {
            entry.stats.failures.fetch_add(1, Ordering::Relaxed);
            warn!(session = session.id(), ?command, "handler reported failure");
            DispatchOutcome::Failed
        }
    }

    fn drop_packet(&self, reason: DropReason) -> DispatchOutcome {
        self.dropped_packets.fetch_add(1, Ordering::Relaxed);
        DispatchOutcome::Dropped(reason)
    }

    // ---- stats -------------------------------------------------------

    pub fn packet_stats(&self, command: Command) -> Option<PacketStats> {
        let handlers = self.handlers.read();
        let entry = handlers.get(&command)?;

        let count = entry.stats.count.load(Ordering::Relaxed);
        let micros = entry.stats.micros.load(Ordering::Relaxed);
        let bytes = entry.stats.bytes.load(Ordering::Relaxed);
        let failures = entry.stats.failures.load(Ordering::Relaxed);

        Some(PacketStats {
            count,
            mean_time_micros: if count > 0 { micros / count } else { 0 },
            failure_rate: if count > 0 {
                failures as f32 / count as f32
            } else {
                0.0
            },
            mean_size: if count > 0 { bytes / count } else { 0 },
        })
    }

    pub fn global_stats(&self) -> GlobalStats {
        let total = self.total_packets.load(Ordering::Relaxed);
        let micros = self.total_micros.load(Ordering::Relaxed);
        GlobalStats {
            total_packets: total,
            mean_time_micros: if total > 0 { micros / total } else { 0 },
            dropped_packets: self.dropped_packets.load(Ordering::Relaxed),
        }
    }

    pub fn clear_stats(&self) {
        self.total_packets.store(0, Ordering::Relaxed);
        self.total_micros.store(0, Ordering::Relaxed);
        self.dropped_packets.store(0, Ordering::Relaxed);

        let handlers = self.handlers.read();
        for entry in handlers.values() {
            entry.stats.count.store(0, Ordering::Relaxed);
            entry.stats.bytes.store(0, Ordering::Relaxed);
            entry.stats.micros.store(0, Ordering::Relaxed);
            entry.stats.failures.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for PacketDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameHandler for PacketDispatcher {
    fn handle_frame(&self, session: &mut Session, frame: Frame) {
        let outcome = self.process(session, &frame);
        trace!(session = session.id(), command = ?frame.command, ?outcome, "dispatched");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use bytes::BytesMut;

    use super::*;

    fn frame(command: Command, payload: &[u8]) -> Frame {
        Frame {
            command,
            client_tick: 0,
            body: BytesMut::from(payload),
        }
    }

    fn dispatcher_with_counter(command: Command) -> (PacketDispatcher, Arc<AtomicUsize>) {
        let dispatcher = PacketDispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        dispatcher.register(command, false, false, move |_, _| {
            hits2.fetch_add(1, Ordering::SeqCst);
            true
        });
        (dispatcher, hits)
    }

    #[test]
    fn unknown_command_is_dropped_and_counted() {
        let dispatcher = PacketDispatcher::new();
        let mut session = Session::detached(1);

        let outcome = dispatcher.process(&mut session, &frame(Command::Chat, b"hi"));
        assert_eq!(
            outcome,
            DispatchOutcome::Dropped(DropReason::UnknownCommand)
        );
        assert_eq!(dispatcher.global_stats().dropped_packets, 1);
    }

    #[test]
    fn auth_gate_blocks_until_login() {
        let dispatcher = PacketDispatcher::new();
        dispatcher.register(Command::Move, true, false, |_, _| true);
        let mut session = Session::detached(1);

        assert_eq!(
            dispatcher.process(&mut session, &frame(Command::Move, &[0; 8])),
            DispatchOutcome::Dropped(DropReason::NotAuthenticated)
        );

        session.mark_authenticated(42);
        assert_eq!(
            dispatcher.process(&mut session, &frame(Command::Move, &[0; 8])),
            DispatchOutcome::Handled
        );
    }

    #[test]
    fn admin_gate_checks_the_admin_account() {
        let dispatcher = PacketDispatcher::new();
        dispatcher.register(Command::AdminCommand, true, true, |_, _| true);

        let mut session = Session::detached(1);
        session.mark_authenticated(42);
        assert_eq!(
            dispatcher.process(&mut session, &frame(Command::AdminCommand, b"kick")),
            DispatchOutcome::Dropped(DropReason::AdminOnly)
        );

        let mut admin = Session::detached(2);
        admin.mark_authenticated(ADMIN_ACCOUNT_ID);
        assert_eq!(
            dispatcher.process(&mut admin, &frame(Command::AdminCommand, b"kick")),
            DispatchOutcome::Handled
        );
    }

    #[test]
    fn size_bounds_are_enforced() {
        let (dispatcher, hits) = dispatcher_with_counter(Command::Chat);
        dispatcher.set_size_bounds(Command::Chat, 2, 8);
        let mut session = Session::detached(1);

        assert_eq!(
            dispatcher.process(&mut session, &frame(Command::Chat, b"x")),
            DispatchOutcome::Dropped(DropReason::SizeOutOfBounds)
        );
        assert_eq!(
            dispatcher.process(&mut session, &frame(Command::Chat, b"123456789")),
            DispatchOutcome::Dropped(DropReason::SizeOutOfBounds)
        );
        assert_eq!(
            dispatcher.process(&mut session, &frame(Command::Chat, b"ok")),
            DispatchOutcome::Handled
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn validators_can_reject_and_be_removed() {
        let (dispatcher, hits) = dispatcher_with_counter(Command::Chat);
        let mut session = Session::detached(1);

        let id = dispatcher.register_global_validator(|_, _, payload| !payload.is_empty());

        assert_eq!(
            dispatcher.process(&mut session, &frame(Command::Chat, b"")),
            DispatchOutcome::Dropped(DropReason::ValidatorRejected)
        );

        assert!(dispatcher.unregister_global_validator(id));
        assert!(!dispatcher.unregister_global_validator(id));

        assert_eq!(
            dispatcher.process(&mut session, &frame(Command::Chat, b"")),
            DispatchOutcome::Handled
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rate_limit_admits_limit_plus_burst() {
        let (dispatcher, hits) = dispatcher_with_counter(Command::Chat);
        dispatcher.set_rate_limit(Command::Chat, 60, 10);
        let mut session = Session::detached(1);

        let mut dropped = 0;
        for _ in 0..71 {
            match dispatcher.process(&mut session, &frame(Command::Chat, b"spam")) {
                DispatchOutcome::Handled => {}
                DispatchOutcome::Dropped(DropReason::RateLimited) => dropped += 1,
                other => panic!("unexpected outcome {other:?}"),
            }
        }

        assert_eq!(hits.load(Ordering::SeqCst), 70);
        assert_eq!(dropped, 1);
    }

    #[test]
    fn failures_are_recorded_in_stats() {
        let dispatcher = PacketDispatcher::new();
        dispatcher.register(Command::Chat, false, false, |_, frame| {
            !frame.body.is_empty()
        });
        let mut session = Session::detached(1);

        dispatcher.process(&mut session, &frame(Command::Chat, b"ok"));
        dispatcher.process(&mut session, &frame(Command::Chat, b""));

        let stats = dispatcher.packet_stats(Command::Chat).unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.failure_rate, 0.5);
        assert_eq!(stats.mean_size, 1);

        dispatcher.clear_stats();
        assert_eq!(dispatcher.packet_stats(Command::Chat).unwrap().count, 0);
    }

    #[test]
    fn unregister_removes_the_route() {
        let (dispatcher, _) = dispatcher_with_counter(Command::Chat);
        assert!(dispatcher.is_registered(Command::Chat));
        assert!(dispatcher.unregister(Command::Chat));
        assert!(!dispatcher.is_registered(Command::Chat));

        let mut session = Session::detached(1);
        assert_eq!(
            dispatcher.process(&mut session, &frame(Command::Chat, b"hi")),
            DispatchOutcome::Dropped(DropReason::UnknownCommand)
        );
    }
}
