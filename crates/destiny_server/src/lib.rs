#![doc = include_str!("../README.md")]

pub mod config;
pub mod dispatcher;
pub mod handlers;

use std::sync::Arc;

pub use config::{ConfigError, ServerConfig};
use destiny_battle::BattleEngine;
use destiny_event::EventBus;
use destiny_item::ItemCatalog;
use destiny_network::{
    connect, io, ConnectionPool, ConnectionRegistry, IpScreen, NetworkError, PoolSettings,
    RegistrySettings,
};
pub use dispatcher::{
    DispatchOutcome, DropReason, GlobalStats, PacketDispatcher, PacketStats, ADMIN_ACCOUNT_ID,
};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("initialization failed: {0}")]
    Init(#[from] anyhow::Error),
}

/// Which role this process plays in the cluster.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ServerKind {
    /// Game world: combat, items, the full dispatch surface.
    World,
    /// Persistence front: accepts world connections, no combat.
    Database,
    /// Billing and account operations.
    Billing,
}

/// The services a running server owns. Handlers and strategies see the
/// world through this.
pub struct ServerContext {
    pub config: ServerConfig,
    pub registry: Arc<ConnectionRegistry>,
    pub dispatcher: Arc<PacketDispatcher>,
    pub pool: Arc<ConnectionPool>,
    pub bus: Arc<EventBus>,
    pub battle: Arc<BattleEngine>,
    pub items: Arc<ItemCatalog>,
}

type StrategyFn = Box<dyn FnMut(&mut ServerContext) -> anyhow::Result<()> + Send>;

/// Kind-specific behavior: what to set up, what to do each tick, and how
/// to wind down. Replaces the legacy server base-class hierarchy.
pub struct ServerStrategy {
    pub init: StrategyFn,
    pub tick: StrategyFn,
    pub stop: StrategyFn,
}

impl ServerStrategy {
    pub fn noop() -> Self {
        Self {
            init: Box::new(|_| Ok(())),
            tick: Box::new(|_| Ok(())),
            stop: Box::new(|_| Ok(())),
        }
    }

    /// The default strategy for a kind. Every kind speaks the
    /// session-level command set; the world layer layers its own
    /// handlers on top through a custom strategy.
    pub fn for_kind(_kind: ServerKind) -> Self {
        Self {
            init: Box::new(|context| {
                handlers::register_session_handlers(
                    &context.dispatcher,
                    Arc::clone(&context.registry),
                    Arc::clone(&context.bus),
                );
                Ok(())
            }),
            tick: Box::new(|_| Ok(())),
            stop: Box::new(|_| Ok(())),
        }
    }
}

impl Default for ServerStrategy {
    fn default() -> Self {
        Self::noop()
    }
}

/// Maximum age of damage-attribution entries before the maintenance tick
/// evicts them.
const DAMAGE_RECORD_MAX_AGE_MS: u64 = 60_000;

/// A single server process: owned services, a strategy, and the task set
/// that drives them.
pub struct Server {
    kind: ServerKind,
    context: ServerContext,
    strategy: ServerStrategy,
    shutdown_tx: watch::Sender<bool>,
}

/// Clonable handle that can stop a running server.
#[derive(Clone)]
pub struct ShutdownHandle(watch::Sender<bool>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.0.send(true);
    }
}

impl Server {
    pub fn new(kind: ServerKind, config: ServerConfig) -> Self {
        Self::with_parts(kind, config, ItemCatalog::new(), ServerStrategy::for_kind(kind))
    }

    /// Full constructor: a pre-loaded item catalogue and a strategy.
    pub fn with_parts(
        kind: ServerKind,
        config: ServerConfig,
        items: ItemCatalog,
        strategy: ServerStrategy,
    ) -> Self {
        let bus = Arc::new(EventBus::new(config.max_event_history.max(64)));
        let registry = Arc::new(ConnectionRegistry::new(RegistrySettings {
            max_connections: config.max_connections,
            max_connections_per_ip: config.max_connections_per_ip,
            ..RegistrySettings::default()
        }));
        let pool = Arc::new(ConnectionPool::new(
            PoolSettings::default(),
            Arc::clone(&bus),
        ));
        let battle = Arc::new(BattleEngine::new(Arc::clone(&bus)));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            kind,
            context: ServerContext {
                config,
                registry,
                dispatcher: Arc::new(PacketDispatcher::new()),
                pool,
                bus,
                battle,
                items: Arc::new(items),
            },
            strategy,
            shutdown_tx,
        }
    }

    pub fn kind(&self) -> ServerKind {
        self.kind
    }

    pub fn context(&self) -> &ServerContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut ServerContext {
        &mut self.context
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown_tx.clone())
    }

    /// Binds, spawns the task set, and ticks until the shutdown signal.
    pub async fn run(&mut self) -> Result<(), ServerError> {
        info!(kind = ?self.kind, name = %self.context.config.name, "server starting");

        (self.strategy.init)(&mut self.context)?;

        let listener = connect::listen(&self.context.config.ip, self.context.config.port).await?;

        let screen = IpScreen {
            allowed: self.context.config.allowed_ips.clone(),
            banned: self.context.config.banned_ips.clone(),
        };

        let shutdown = self.shutdown_tx.subscribe();
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        tasks.push(tokio::spawn(connect::run_accept_loop(
            listener,
            Arc::clone(&self.context.registry),
            screen,
            shutdown.clone(),
        )));
        tasks.push(tokio::spawn(io::run_receive_loop(
            Arc::clone(&self.context.registry),
            self.context.dispatcher.clone() as Arc<dyn io::FrameHandler>,
            shutdown.clone(),
        )));
        tasks.push(tokio::spawn(io::run_send_loop(
            Arc::clone(&self.context.registry),
            shutdown.clone(),
        )));
        tasks.push(tokio::spawn(io::run_maintenance_loop(
            Arc::clone(&self.context.registry),
            self.context.config.idle_timeout(),
            io::PING_INTERVAL,
            shutdown.clone(),
        )));
        tasks.push(tokio::spawn(
            Arc::clone(&self.context.bus).run_dispatch(shutdown.clone()),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(&self.context.pool).run_upkeep(shutdown.clone()),
        ));

        let mut shutdown_rx = shutdown;
        let mut tick = tokio::time::interval(self.context.config.tick_rate());

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = (self.strategy.tick)(&mut self.context) {
                        error!("tick failed: {e:#}");
                    }
                    self.context
                        .battle
                        .cleanup_damage_records(self.context.battle.now_ms(), DAMAGE_RECORD_MAX_AGE_MS);
                }
                _ = shutdown_rx.changed() => break,
            }
        }

        info!("server draining");
        self.context
            .registry
            .close_all(destiny_network::CloseReason::Normal);

        if let Err(e) = (self.strategy.stop)(&mut self.context) {
            error!("stop hook failed: {e:#}");
        }

        for task in tasks {
            let _ = task.await;
        }

        info!("server stopped");
        Ok(())
    }
}
