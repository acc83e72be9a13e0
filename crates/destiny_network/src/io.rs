//! The receive, send, and maintenance loops.
//!
//! One task per concern, not per connection: each loop sweeps every live
//! session on a short cadence and does non-blocking work. The sweeps are
//! exposed as plain functions so tests can drive them directly.

use std::sync::Arc;
use std::time::Duration;

use destiny_protocol::{Command, Frame};
use tokio::sync::watch;
use tokio::time::{interval, Instant};
use tracing::{debug, trace, warn};

use crate::registry::ConnectionRegistry;
use crate::session::{CloseReason, ReadOutcome, Session, SessionState};

/// Default idle timeout before a silent session is closed.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default interval before an idle session is pinged.
pub const PING_INTERVAL: Duration = Duration::from_secs(60);

/// Cadence of the receive and send sweeps.
pub const IO_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// Cadence of the maintenance sweep.
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

/// Consumer of inbound frames; the dispatcher implements this. The
/// session stays borrowed for the duration of the call.
pub trait FrameHandler: Send + Sync {
    fn handle_frame(&self, session: &mut Session, frame: Frame);
}

/// Sweeps every active session once: drain the socket, hand complete
/// frames to the handler, flag dead peers for closing.
pub fn receive_pass(registry: &ConnectionRegistry, handler: &dyn FrameHandler) {
    for id in registry.active_ids() {
        let Some(session) = registry.get(id) else {
            continue;
        };
        let mut session = session.lock();

        match session.receive() {
            Ok(ReadOutcome::WouldBlock) => {}
            Ok(ReadOutcome::Progress(_)) => {}
            Ok(ReadOutcome::Closed) => {
                debug!(id, "peer closed connection");
                session.mark_closing(CloseReason::PeerClosed);
                continue;
            }
            Err(e) => {
                debug!(id, "receive error: {e}");
                session.mark_closing(CloseReason::TransportError);
                continue;
            }
        }

        // Frames are dispatched in arrival order within the session.
        loop {
            match session.next_frame() {
                Ok(Some(frame)) => {
                    trace!(id, command = ?frame.command, "frame received");
                    handler.handle_frame(&mut session, frame);
                }
                Ok(None) => break,
                Err(e) => {
                    // Protocol errors drop the frame, not the session.
                    warn!(id, "dropping frame: {e}");
                }
            }
        }
    }
}

/// Sweeps sessions with queued output, flushing what the sockets accept.
/// Closing sessions get their queues drained too so goodbyes go out.
pub fn send_pass(registry: &ConnectionRegistry) {
    for id in registry.all_ids() {
        let Some(session) = registry.get(id) else {
            continue;
        };
        let mut session = session.lock();

        if session.state() == SessionState::Closed || session.pending_frames() == 0 {
            continue;
        }

        if let Err(e) = session.flush() {
            debug!(id, "send error: {e}");
            session.mark_closing(CloseReason::TransportError);
        }
    }
}

/// One maintenance sweep: time out idle sessions, ping quiet ones,
/// finalize closing sessions, and prune expired ones.
pub fn maintenance_pass(
    registry: &ConnectionRegistry,
    idle_timeout: Duration,
    ping_interval: Duration,
) {
    let now = Instant::now();

    for id in registry.all_ids() {
        let Some(session) = registry.get(id) else {
            continue;
        };
        let mut session = session.lock();

        match session.state() {
            SessionState::Closing => {
                // Give the send loop one sweep to drain farewells, then
                // drop the socket.
                if session.pending_frames() == 0 || session.flush().is_err() {
                    session.mark_closed();
                }
            }
            SessionState::Connected => {
                if session.idle(now) > idle_timeout {
                    debug!(id, "closing idle session");
                    session.mark_closing(CloseReason::Timeout);
                } else if session.ping_due(now, ping_interval) {
                    trace!(id, "enqueueing keepalive");
                    if let Err(e) = session.enqueue_frame(Command::Keepalive, 0, &[]) {
                        warn!(id, "keepalive enqueue failed: {e}");
                    }
                }
            }
            _ => {}
        }
    }

    registry.prune_closed(now);
}

pub async fn run_receive_loop(
    registry: Arc<ConnectionRegistry>,
    handler: Arc<dyn FrameHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sweep = interval(IO_SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = sweep.tick() => receive_pass(&registry, handler.as_ref()),
            _ = shutdown.changed() => {
                debug!("receive loop stopping");
                return;
            }
        }
    }
}

pub async fn run_send_loop(registry: Arc<ConnectionRegistry>, mut shutdown: watch::Receiver<bool>) {
    let mut sweep = interval(IO_SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = sweep.tick() => send_pass(&registry),
            _ = shutdown.changed() => {
                debug!("send loop stopping");
                return;
            }
        }
    }
}

pub async fn run_maintenance_loop(
    registry: Arc<ConnectionRegistry>,
    idle_timeout: Duration,
    ping_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sweep = interval(MAINTENANCE_INTERVAL);
    loop {
        tokio::select! {
            _ = sweep.tick() => maintenance_pass(&registry, idle_timeout, ping_interval),
            _ = shutdown.changed() => {
                debug!("maintenance loop stopping");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maintenance_pings_then_times_out() {
        let registry = ConnectionRegistry::default();
        let session = registry.register_session(Session::detached(registry.allocate_id()));

        // Simulate the clock without waiting: tiny idle windows.
        let ping_after = Duration::from_millis(0);
        let timeout_after = Duration::from_secs(3600);

        maintenance_pass(&registry, timeout_after, ping_after);
        assert_eq!(session.lock().pending_frames(), 1, "keepalive queued");

        maintenance_pass(&registry, Duration::from_millis(0), ping_after);
        assert_eq!(session.lock().state(), SessionState::Closing);
    }

    #[test]
    fn closing_session_without_backlog_is_finalized() {
        let registry = ConnectionRegistry::default();
        let session = registry.register_session(Session::detached(registry.allocate_id()));
        session.lock().mark_closing(CloseReason::Normal);

        maintenance_pass(&registry, IDLE_TIMEOUT, PING_INTERVAL);
        assert_eq!(session.lock().state(), SessionState::Closed);
    }
}
