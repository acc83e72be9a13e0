//! The inbound connection registry.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::session::{CloseReason, Session, SessionId};
use crate::NetworkError;

#[derive(Clone, Debug)]
pub struct RegistrySettings {
    pub max_connections: usize,
    pub max_connections_per_ip: usize,
    /// How long a closed session stays resolvable so in-flight work sees
    /// a consistent reference.
    pub grace: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            max_connections_per_ip: 5,
            grace: Duration::from_secs(10),
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    sessions: FxHashMap<SessionId, Arc<Mutex<Session>>>,
    per_ip: FxHashMap<IpAddr, usize>,
}

/// Tracks every live inbound session by id. Ids are monotonic and never
/// reused within a run. The map sits behind one coarse lock; iteration
/// snapshots ids under the lock and releases it before per-session work.
pub struct ConnectionRegistry {
    inner: Mutex<RegistryInner>,
    next_id: AtomicU32,
    settings: RegistrySettings,
}

impl ConnectionRegistry {
    pub fn new(settings: RegistrySettings) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            next_id: AtomicU32::new(1),
            settings,
        }
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    /// Admits an accepted stream, enforcing the total and per-IP caps.
    pub fn register(
        &self,
        stream: TcpStream,
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
    ) -> Result<Arc<Mutex<Session>>, NetworkError> {
        let mut inner = self.inner.lock();

        if inner.sessions.len() >= self.settings.max_connections {
            return Err(NetworkError::ConnectionRefused("server full"));
        }

        let ip = remote_addr.ip();
        let count = inner.per_ip.entry(ip).or_insert(0);
        if *count >= self.settings.max_connections_per_ip {
            return Err(NetworkError::ConnectionRefused("per-ip cap reached"));
        }
        *count += 1;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Mutex::new(Session::attached(
            id,
            stream,
            remote_addr,
            local_addr,
        )));
        inner.sessions.insert(id, Arc::clone(&session));

        debug!(id, %remote_addr, "registered session");
        Ok(session)
    }

    /// Inserts a pre-built session. Used by tests and by tooling that
    /// drives sessions without sockets.
    pub fn register_session(&self, session: Session) -> Arc<Mutex<Session>> {
        let id = session.id();
        let ip = session.remote_addr().ip();
        let session = Arc::new(Mutex::new(session));

        let mut inner = self.inner.lock();
        *inner.per_ip.entry(ip).or_insert(0) += 1;
        inner.sessions.insert(id, Arc::clone(&session));
        session
    }

    /// Allocates the next session id without registering anything.
    pub fn allocate_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Mutex<Session>>> {
        self.inner.lock().sessions.get(&id).map(Arc::clone)
    }

    /// Ids of sessions currently in the `Connected` state.
    pub fn active_ids(&self) -> Vec<SessionId> {
        let inner = self.inner.lock();
        inner
            .sessions
            .iter()
            .filter(|(_, s)| s.lock().is_active())
            .map(|(&id, _)| id)
            .collect()
    }

    /// Every registered id, whatever the state.
    pub fn all_ids(&self) -> Vec<SessionId> {
        self.inner.lock().sessions.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().sessions.is_empty()
    }

    /// Marks a session for shutdown. It stays resolvable until the grace
    /// period expires.
    pub fn close(&self, id: SessionId, reason: CloseReason) {
        if let Some(session) = self.get(id) {
            session.lock().mark_closing(reason);
        }
    }

    /// Enqueues one frame on every active session. Returns how many
    /// sessions took it.
    pub fn broadcast(&self, command: destiny_protocol::Command, payload: &[u8]) -> usize {
        let mut delivered = 0;
        for id in self.active_ids() {
            let Some(session) = self.get(id) else { continue };
            let mut session = session.lock();
            match session.enqueue_frame(command, 0, payload) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(id, "broadcast enqueue failed: {e}"),
            }
        }
        delivered
    }

    /// Drops sessions that have been closed for longer than the grace
    /// period. Called from the maintenance loop.
    pub fn prune_closed(&self, now: Instant) {
        let mut inner = self.inner.lock();
        let grace = self.settings.grace;

        let expired: Vec<(SessionId, IpAddr)> = inner
            .sessions
            .iter()
            .filter_map(|(&id, session)| {
                let session = session.lock();
                session
                    .closed_at()
                    .is_some_and(|at| now.saturating_duration_since(at) >= grace)
                    .then(|| (id, session.remote_addr().ip()))
            })
            .collect();

        for (id, ip) in expired {
            inner.sessions.remove(&id);
            if let Some(count) = inner.per_ip.get_mut(&ip) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    inner.per_ip.remove(&ip);
                }
            }
            debug!(id, "pruned closed session");
        }
    }

    /// Moves every session to `Closing`. Part of server shutdown.
    pub fn close_all(&self, reason: CloseReason) {
        for id in self.all_ids() {
            self.close(id, reason);
        }
    }

    /// Aggregated traffic counters across every registered session.
    pub fn aggregate_stats(&self) -> AggregateStats {
        let inner = self.inner.lock();
        let mut stats = AggregateStats::default();
        for session in inner.sessions.values() {
            let session = session.lock();
            stats.sessions += 1;
            if session.is_active() {
                stats.active_sessions += 1;
            }
            let traffic = session.stats();
            stats.bytes_sent += traffic.bytes_sent;
            stats.bytes_received += traffic.bytes_received;
            stats.frames_sent += u64::from(traffic.frames_sent);
            stats.frames_received += u64::from(traffic.frames_received);
            stats.frames_dropped += u64::from(traffic.frames_dropped);
            stats.errors += u64::from(traffic.errors);
        }
        stats
    }
}

/// Registry-wide traffic snapshot.
#[derive(Clone, Copy, Debug, Default)]
pub struct AggregateStats {
    pub sessions: usize,
    pub active_sessions: usize,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub errors: u64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(RegistrySettings::default())
    }
}

#[cfg(test)]
mod tests {
    use destiny_protocol::Command;

    use super::*;
    use crate::session::SessionState;

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(RegistrySettings {
            max_connections: 8,
            max_connections_per_ip: 2,
            grace: Duration::from_secs(10),
        })
    }

    #[test]
    fn ids_are_monotonic() {
        let registry = registry();
        let a = registry.allocate_id();
        let b = registry.allocate_id();
        assert!(b > a);
    }

    #[test]
    fn broadcast_reaches_only_active_sessions() {
        let registry = registry();
        let a = registry.register_session(Session::detached(registry.allocate_id()));
        let b = registry.register_session(Session::detached(registry.allocate_id()));
        b.lock().mark_closing(CloseReason::Normal);

        let delivered = registry.broadcast(Command::SystemMessage, b"maintenance soon");
        assert_eq!(delivered, 1);
        assert_eq!(a.lock().pending_frames(), 1);
        assert_eq!(b.lock().pending_frames(), 0);
    }

    #[test]
    fn close_retains_until_grace_expires() {
        let registry = registry();
        let session = registry.register_session(Session::detached(registry.allocate_id()));
        let id = session.lock().id();

        registry.close(id, CloseReason::Kicked);
        assert_eq!(session.lock().state(), SessionState::Closing);
        assert!(registry.get(id).is_some(), "still resolvable while closing");

        session.lock().mark_closed();
        registry.prune_closed(Instant::now());
        assert!(registry.get(id).is_some(), "grace period holds it");

        registry.prune_closed(Instant::now() + Duration::from_secs(11));
        assert!(registry.get(id).is_none());
    }
}
