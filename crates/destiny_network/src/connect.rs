//! Listening, outbound connects, and the accept loop.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::registry::ConnectionRegistry;
use crate::NetworkError;

/// Default timeout for outbound connects.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Binds a listener. Bind and listen failures map onto their own error
/// kinds so the binary can exit with the right code.
pub async fn listen(host: &str, port: u16) -> Result<TcpListener, NetworkError> {
    TcpListener::bind((host, port))
        .await
        .map_err(NetworkError::Bind)
}

/// Connects to `host:port`, resolving the name, within `limit`.
pub async fn connect(host: &str, port: u16, limit: Duration) -> Result<TcpStream, NetworkError> {
    match timeout(limit, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(NetworkError::Connect(e)),
        Err(_) => Err(NetworkError::Timeout),
    }
}

/// Allow/ban screening applied before a connection is registered.
#[derive(Clone, Debug, Default)]
pub struct IpScreen {
    /// When non-empty, only these addresses may connect.
    pub allowed: Vec<IpAddr>,
    pub banned: Vec<IpAddr>,
}

impl IpScreen {
    pub fn permits(&self, ip: IpAddr) -> bool {
        if self.banned.contains(&ip) {
            return false;
        }
        self.allowed.is_empty() || self.allowed.contains(&ip)
    }
}

/// Accepts connections until shutdown, screening and registering each.
///
/// Refused connections (bans, caps) are dropped on the floor; the legacy
/// client sees a silent close either way.
pub async fn run_accept_loop(
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    screen: IpScreen,
    mut shutdown: watch::Receiver<bool>,
) {
    let local_addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            error!("listener has no local address: {e}");
            return;
        }
    };
    info!(%local_addr, "accepting connections");

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.changed() => {
                debug!("accept loop stopping");
                return;
            }
        };

        match accepted {
            Ok((stream, remote_addr)) => {
                if !screen.permits(remote_addr.ip()) {
                    debug!(%remote_addr, "screened out connection");
                    continue;
                }

                if let Err(e) = stream.set_nodelay(true) {
                    warn!("failed to set TCP_NODELAY: {e}");
                }

                match registry.register(stream, remote_addr, local_addr) {
                    Ok(_) => {}
                    Err(e) => debug!(%remote_addr, "connection refused: {e}"),
                }
            }
            Err(e) => {
                error!("failed to accept incoming connection: {e}");
            }
        }
    }
}
