//! The outbound connection pool.
//!
//! Multiplexes connections to peer servers (database, billing, world
//! shards) with weighted random selection, bounded waiting, and a health
//! probe task that disables flapping peers and reactivates them later.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use destiny_event::{EventBus, EventPayload};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::connect::{connect, CONNECT_TIMEOUT};
use crate::NetworkError;

/// How often every peer is probed.
pub const HEALTH_PROBE_INTERVAL: Duration = Duration::from_secs(10);

/// Probe connect timeout.
pub const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Consecutive failures before a non-required peer is disabled.
pub const MAX_HEALTH_FAILURES: u32 = 3;

/// How long a disabled peer stays down before re-probing.
pub const REACTIVATION_DELAY: Duration = Duration::from_secs(30);

/// Pooled connections idle longer than this are closed.
pub const POOLED_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Published when a required peer keeps failing its health probe.
#[derive(Clone, Debug)]
pub struct ServerHealthAlert {
    pub server_id: u32,
    pub host: String,
    pub port: u16,
    pub consecutive_failures: u32,
}

impl EventPayload for ServerHealthAlert {
    const TYPE_TAG: &'static str = "network.server_health";
}

pub const EVENT_SERVER_HEALTH: &str = "network.server_health";

/// One peer server the pool can open connections to.
#[derive(Clone, Debug)]
pub struct PeerServer {
    pub id: u32,
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub required: bool,
    pub active: bool,
    pub consecutive_failures: u32,
    pub reactivate_at: Option<Instant>,
}

struct PooledConnection {
    server_id: u32,
    stream: TcpStream,
    in_use: bool,
    last_activity: Instant,
}

#[derive(Clone, Debug)]
pub struct PoolSettings {
    pub max_connections: usize,
    pub connect_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 32,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

/// Point-in-time pool gauges.
#[derive(Clone, Copy, Debug, Default)]
pub struct PoolStats {
    pub servers: usize,
    pub active_servers: usize,
    pub connections: usize,
    pub in_use: usize,
    pub idle: usize,
    pub waiting: usize,
}

#[derive(Default)]
struct PoolInner {
    servers: FxHashMap<u32, PeerServer>,
    connections: FxHashMap<u32, PooledConnection>,
    idle: Vec<u32>,
    waiting: usize,
}

pub struct ConnectionPool {
    inner: Mutex<PoolInner>,
    released: Notify,
    settings: PoolSettings,
    next_server_id: AtomicU32,
    next_connection_id: AtomicU32,
    rng: Mutex<StdRng>,
    bus: Arc<EventBus>,
}

impl ConnectionPool {
    pub fn new(settings: PoolSettings, bus: Arc<EventBus>) -> Self {
        Self::with_rng(settings, bus, StdRng::from_entropy())
    }

    /// Pool with a fixed selection RNG, for deterministic tests.
    pub fn with_rng_seed(settings: PoolSettings, bus: Arc<EventBus>, seed: u64) -> Self {
        Self::with_rng(settings, bus, StdRng::seed_from_u64(seed))
    }

    fn with_rng(settings: PoolSettings, bus: Arc<EventBus>, rng: StdRng) -> Self {
        Self {
            inner: Mutex::new(PoolInner::default()),
            released: Notify::new(),
            settings,
            next_server_id: AtomicU32::new(1),
            next_connection_id: AtomicU32::new(1),
            rng: Mutex::new(rng),
            bus,
        }
    }

    // ---- server management -------------------------------------------

    pub fn add_server(&self, host: &str, port: u16, weight: u32, required: bool) -> u32 {
        let id = self.next_server_id.fetch_add(1, Ordering::Relaxed);
        let server = PeerServer {
            id,
            host: host.to_owned(),
            port,
            weight: weight.max(1),
            required,
            active: true,
            consecutive_failures: 0,
            reactivate_at: None,
        };
        info!(id, host, port, weight, required, "added peer server");
        self.inner.lock().servers.insert(id, server);
        id
    }

    /// Removes a peer. Required peers are never removed.
    pub fn remove_server(&self, server_id: u32) -> Result<(), NetworkError> {
        let mut inner = self.inner.lock();
        match inner.servers.get(&server_id) {
            None => Ok(()),
            Some(server) if server.required => Err(NetworkError::RequiredServer(server_id)),
            Some(_) => {
                inner.servers.remove(&server_id);
                let dead: Vec<u32> = inner
                    .connections
                    .iter()
                    .filter(|(_, c)| c.server_id == server_id)
                    .map(|(&id, _)| id)
                    .collect();
                for id in dead {
                    inner.connections.remove(&id);
                    inner.idle.retain(|&i| i != id);
                }
                Ok(())
            }
        }
    }

    pub fn server(&self, server_id: u32) -> Option<PeerServer> {
        self.inner.lock().servers.get(&server_id).cloned()
    }

    pub fn active_server_ids(&self) -> Vec<u32> {
        let inner = self.inner.lock();
        inner
            .servers
            .values()
            .filter(|s| s.active)
            .map(|s| s.id)
            .collect()
    }

    /// Picks a server for a new connection. A live preferred server wins;
    /// otherwise a weighted random pick over active servers: draw a
    /// uniform integer in `[1, total_weight]` and scan by accumulation.
    pub fn select_server(&self, preferred: Option<u32>) -> Option<u32> {
        let inner = self.inner.lock();

        if let Some(id) = preferred {
            if inner.servers.get(&id).is_some_and(|s| s.active) {
                return Some(id);
            }
        }

        let mut candidates: Vec<(u32, u32)> = inner
            .servers
            .values()
            .filter(|s| s.active)
            .map(|s| (s.id, s.weight))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        // Stable order so a seeded RNG selects reproducibly.
        candidates.sort_by_key(|&(id, _)| id);

        let total: u32 = candidates.iter().map(|&(_, w)| w).sum();
        let pick = self.rng.lock().gen_range(1..=total);

        let mut accumulated = 0;
        for (id, weight) in candidates {
            accumulated += weight;
            if pick <= accumulated {
                return Some(id);
            }
        }
        unreachable!("accumulated weights cover the pick range")
    }

    // ---- acquire / release -------------------------------------------

    /// Borrows a connection: reuse an idle one, create one below the cap,
    /// or wait up to `wait_timeout` for a release. A zero timeout never
    /// waits.
    pub async fn acquire(
        &self,
        preferred: Option<u32>,
        wait_timeout: Duration,
    ) -> Result<u32, NetworkError> {
        let deadline = Instant::now() + wait_timeout;

        loop {
            if let Some(id) = self.try_reuse_idle(preferred) {
                return Ok(id);
            }

            match self.try_create(preferred).await {
                Ok(Some(id)) => return Ok(id),
                Ok(None) => {} // At capacity; fall through to waiting.
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(NetworkError::Unavailable);
            }

            self.inner.lock().waiting += 1;
            let outcome = tokio::time::timeout_at(deadline, self.released.notified()).await;
            self.inner.lock().waiting -= 1;

            if outcome.is_err() {
                return Err(NetworkError::Unavailable);
            }
        }
    }

    fn try_reuse_idle(&self, preferred: Option<u32>) -> Option<u32> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;

        let position = inner.idle.iter().position(|id| {
            inner.connections.get(id).is_some_and(|c| {
                preferred.is_none() || preferred == Some(c.server_id)
            })
        })?;

        let id = inner.idle.remove(position);
        let connection = inner.connections.get_mut(&id)?;
        connection.in_use = true;
        connection.last_activity = Instant::now();
        Some(id)
    }

    /// Opens a new connection if the pool is below its cap. `Ok(None)`
    /// means at capacity.
    async fn try_create(&self, preferred: Option<u32>) -> Result<Option<u32>, NetworkError> {
        let (server_id, host, port) = {
            let inner = self.inner.lock();
            if inner.connections.len() >= self.settings.max_connections {
                return Ok(None);
            }
            drop(inner);

            let Some(server_id) = self.select_server(preferred) else {
                return Err(NetworkError::NoHealthyServer);
            };
            let inner = self.inner.lock();
            let server = inner.servers.get(&server_id).ok_or(NetworkError::NoHealthyServer)?;
            (server_id, server.host.clone(), server.port)
        };

        let stream = connect(&host, port, self.settings.connect_timeout).await?;

        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        inner.connections.insert(
            id,
            PooledConnection {
                server_id,
                stream,
                in_use: true,
                last_activity: Instant::now(),
            },
        );
        debug!(id, server_id, "opened pooled connection");
        Ok(Some(id))
    }

    /// Returns a connection to the idle queue and wakes one waiter.
    pub fn release(&self, connection_id: u32) {
        let mut inner = self.inner.lock();
        let Some(connection) = inner.connections.get_mut(&connection_id) else {
            return;
        };
        if !connection.in_use {
            return;
        }
        connection.in_use = false;
        connection.last_activity = Instant::now();
        inner.idle.push(connection_id);
        drop(inner);

        self.released.notify_one();
    }

    /// The server a pooled connection belongs to.
    pub fn connection_server(&self, connection_id: u32) -> Option<u32> {
        self.inner
            .lock()
            .connections
            .get(&connection_id)
            .map(|c| c.server_id)
    }

    /// Runs `op` with an acquired connection, retrying a false return up
    /// to `retries` times. Transient acquire failures count as attempts.
    pub async fn execute_with<F, Fut>(
        &self,
        op: F,
        preferred: Option<u32>,
        wait_timeout: Duration,
        retries: u32,
    ) -> bool
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..retries.max(1) {
            let connection = match self.acquire(preferred, wait_timeout).await {
                Ok(id) => id,
                Err(_) => continue,
            };

            let ok = op(connection).await;
            self.release(connection);

            if ok {
                return true;
            }
        }
        false
    }

    /// Fans `op` out over connections to up to `target_count` distinct
    /// active servers in parallel. Returns the number of successes.
    pub async fn execute_on_multiple<F, Fut>(self: &Arc<Self>, op: F, target_count: usize) -> usize
    where
        F: Fn(u32) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send,
    {
        let mut servers = self.active_server_ids();
        servers.sort_unstable();
        servers.truncate(target_count);

        let mut tasks = Vec::with_capacity(servers.len());
        for server_id in servers {
            let pool = Arc::clone(self);
            let op = op.clone();
            tasks.push(tokio::spawn(async move {
                let Ok(connection) = pool.acquire(Some(server_id), Duration::ZERO).await else {
                    return false;
                };
                let ok = op(connection).await;
                pool.release(connection);
                ok
            }));
        }

        let mut successes = 0;
        for task in tasks {
            if matches!(task.await, Ok(true)) {
                successes += 1;
            }
        }
        successes
    }

    // ---- health and upkeep -------------------------------------------

    /// One probe round over every peer. Exposed for tests; the probe task
    /// calls this every [`HEALTH_PROBE_INTERVAL`].
    pub async fn probe_servers(&self) {
        let servers: Vec<PeerServer> = {
            let inner = self.inner.lock();
            inner.servers.values().cloned().collect()
        };
        let now = Instant::now();

        for server in servers {
            // Disabled peers wait out their reactivation delay.
            if !server.active {
                if let Some(at) = server.reactivate_at {
                    if now < at {
                        continue;
                    }
                }
            }

            let healthy = connect(&server.host, server.port, HEALTH_PROBE_TIMEOUT)
                .await
                .is_ok();

            let mut inner = self.inner.lock();
            let Some(entry) = inner.servers.get_mut(&server.id) else {
                continue;
            };

            if healthy {
                if !entry.active {
                    info!(server_id = entry.id, "peer server reactivated");
                }
                entry.consecutive_failures = 0;
                entry.active = true;
                entry.reactivate_at = None;
                continue;
            }

            entry.consecutive_failures += 1;
            warn!(
                server_id = entry.id,
                failures = entry.consecutive_failures,
                "peer server failed health probe"
            );

            if entry.consecutive_failures >= MAX_HEALTH_FAILURES {
                if entry.required {
                    // Required peers stay in rotation; operators get told.
                    let alert = ServerHealthAlert {
                        server_id: entry.id,
                        host: entry.host.clone(),
                        port: entry.port,
                        consecutive_failures: entry.consecutive_failures,
                    };
                    drop(inner);
                    self.bus.publish(EVENT_SERVER_HEALTH, alert);
                } else if entry.active {
                    entry.active = false;
                    entry.reactivate_at = Some(Instant::now() + REACTIVATION_DELAY);
                }
            }
        }
    }

    /// Closes idle connections that outlived [`POOLED_IDLE_TIMEOUT`].
    pub fn reap_idle(&self, now: Instant) {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;

        inner.idle.retain(|&id| {
            let Some(connection) = inner.connections.get(&id) else {
                return false;
            };
            if now.saturating_duration_since(connection.last_activity) > POOLED_IDLE_TIMEOUT {
                debug!(id, "closing idle pooled connection");
                inner.connections.remove(&id);
                false
            } else {
                true
            }
        });
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            servers: inner.servers.len(),
            active_servers: inner.servers.values().filter(|s| s.active).count(),
            connections: inner.connections.len(),
            in_use: inner.connections.values().filter(|c| c.in_use).count(),
            idle: inner.idle.len(),
            waiting: inner.waiting,
        }
    }

    /// Drives periodic health probes and idle reaping until shutdown.
    pub async fn run_upkeep(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut probe = tokio::time::interval(HEALTH_PROBE_INTERVAL);
        loop {
            tokio::select! {
                _ = probe.tick() => {
                    self.probe_servers().await;
                    self.reap_idle(Instant::now());
                }
                _ = shutdown.changed() => {
                    debug!("pool upkeep stopping");
                    return;
                }
            }
        }
    }
}
