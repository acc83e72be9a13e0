//! Maintenance timing tests on the paused tokio clock.

use std::time::Duration;

use destiny_network::{io, CloseReason, ConnectionRegistry, Session, SessionState};
use destiny_protocol::{Command, FrameHeader};
use tokio::time::{advance, Instant};

const IDLE_TIMEOUT: Duration = Duration::from_secs(300);
const PING_INTERVAL: Duration = Duration::from_secs(60);

fn sweep(registry: &ConnectionRegistry) {
    io::maintenance_pass(registry, IDLE_TIMEOUT, PING_INTERVAL);
}

#[tokio::test(start_paused = true)]
async fn quiet_session_gets_a_keepalive_before_the_timeout() {
    let registry = ConnectionRegistry::default();
    let session = registry.register_session(Session::detached(registry.allocate_id()));

    // Just shy of the ping interval: nothing happens.
    advance(PING_INTERVAL - Duration::from_secs(1)).await;
    sweep(&registry);
    assert_eq!(session.lock().pending_frames(), 0);

    // Just past it: one keepalive, not one per sweep.
    advance(Duration::from_secs(2)).await;
    sweep(&registry);
    sweep(&registry);

    let session = session.lock();
    assert_eq!(session.pending_frames(), 1);
    assert_eq!(session.state(), SessionState::Connected);

    // The keepalive is a bare header carrying command 0x0002.
    let header = FrameHeader::parse(session.front_frame().unwrap());
    assert_eq!(header.command, Command::Keepalive.to_raw());
    assert_eq!(header.total_size as usize, destiny_protocol::HEADER_SIZE);
    assert_eq!(header.checksum, 0);
}

#[tokio::test(start_paused = true)]
async fn idle_session_is_closed_with_timeout_reason() {
    let registry = ConnectionRegistry::default();
    let session = registry.register_session(Session::detached(registry.allocate_id()));
    let id = session.lock().id();

    advance(IDLE_TIMEOUT + Duration::from_secs(1)).await;
    sweep(&registry);

    assert_eq!(session.lock().state(), SessionState::Closing);
    assert_eq!(session.lock().close_reason(), Some(CloseReason::Timeout));

    // The next sweeps finalize and, after the grace period, prune.
    sweep(&registry);
    assert_eq!(session.lock().state(), SessionState::Closed);

    advance(registry.settings().grace + Duration::from_secs(1)).await;
    sweep(&registry);
    assert!(registry.get(id).is_none(), "pruned after grace");
}

#[tokio::test(start_paused = true)]
async fn activity_resets_the_idle_clock() {
    let registry = ConnectionRegistry::default();
    let session = registry.register_session(Session::detached(registry.allocate_id()));

    advance(Duration::from_secs(200)).await;
    session.lock().touch();

    advance(Duration::from_secs(200)).await;
    sweep(&registry);
    assert_eq!(
        session.lock().state(),
        SessionState::Connected,
        "only 200s since last activity"
    );

    advance(Duration::from_secs(101)).await;
    sweep(&registry);
    assert_eq!(session.lock().state(), SessionState::Closing);
}

#[tokio::test(start_paused = true)]
async fn last_activity_never_runs_ahead_of_now() {
    let session = Session::detached(1);
    assert!(session.last_activity() <= Instant::now());

    advance(Duration::from_secs(5)).await;
    assert!(session.last_activity() <= Instant::now());
}

#[test]
fn keepalive_is_a_bare_header() {
    let mut session = Session::detached(1);
    session.enqueue_frame(Command::Keepalive, 0, &[]).unwrap();
    assert_eq!(session.queued_bytes(), destiny_protocol::HEADER_SIZE);
}
