//! Per-connection session state: socket, codec pair, send queue, counters.

use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use bytes::BytesMut;
use destiny_protocol::{Command, Frame, FrameDecoder, FrameEncoder, ProtocolError};
use rustc_hash::FxHashMap;
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::NetworkError;

pub type SessionId = u32;

/// Default capacity of the per-session outbound byte queue.
pub const SEND_BUFFER_SIZE: usize = 131_072;

/// Lifecycle of a session's endpoint. Transitions are monotone except the
/// `Connected -> Closing -> Closed` tail.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SessionState {
    Closed,
    Created,
    Connecting,
    Connected,
    Listening,
    Closing,
    Error,
}

/// Why a session was shut down.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CloseReason {
    Normal,
    Timeout,
    PeerClosed,
    TransportError,
    Kicked,
}

/// Byte and frame counters for one session.
#[derive(Clone, Copy, Debug, Default)]
pub struct TrafficStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub frames_sent: u32,
    pub frames_received: u32,
    pub frames_dropped: u32,
    pub errors: u32,
}

/// Result of draining the kernel receive buffer once.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes moved into the decoder.
    Progress(usize),
    /// Nothing to read right now.
    WouldBlock,
    /// Peer closed its end.
    Closed,
}

/// Per-session sliding rate window, reset every 60 seconds.
#[derive(Debug)]
pub struct RateWindow {
    window_start: Instant,
    per_command: FxHashMap<u16, u32>,
    total: u32,
}

const WINDOW: Duration = Duration::from_secs(60);

impl RateWindow {
    fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            per_command: FxHashMap::default(),
            total: 0,
        }
    }

    /// Admits or drops one packet of `command`. `per_minute` of zero means
    /// the command is unlimited; `global_cap` of zero disables the
    /// per-session total.
    pub fn admit(
        &mut self,
        now: Instant,
        command: u16,
        per_minute: u32,
        burst: u32,
        global_cap: u32,
    ) -> bool {
        if now.duration_since(self.window_start) >= WINDOW {
            self.window_start = now;
            self.per_command.clear();
            self.total = 0;
        }

        if global_cap > 0 && self.total >= global_cap {
            return false;
        }

        let count = self.per_command.entry(command).or_insert(0);

        if per_minute > 0 && *count >= per_minute {
            // Burst allowance past the steady-state limit.
            if burst == 0 || *count >= per_minute + burst {
                return false;
            }
        }

        *count += 1;
        self.total += 1;
        true
    }
}

/// One accepted (or outbound) connection and everything the server tracks
/// about it. Owned by the [`ConnectionRegistry`](crate::ConnectionRegistry)
/// and borrowed under its per-session lock.
pub struct Session {
    id: SessionId,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,

    state: SessionState,
    close_reason: Option<CloseReason>,
    closed_at: Option<Instant>,

    pub authenticated: bool,
    pub account_id: Option<u32>,
    pub character_id: Option<u32>,

    connected_at: Instant,
    /// Last traffic seen *from* the peer. The server's own keepalives do
    /// not refresh this, otherwise idle sessions would never time out.
    last_activity: Instant,
    last_ping: Option<Instant>,

    stats: TrafficStats,

    decoder: FrameDecoder,
    encoder: FrameEncoder,

    send_queue: VecDeque<BytesMut>,
    queued_bytes: usize,
    send_buffer_size: usize,
    head_written: usize,

    pub rate: RateWindow,

    stream: Option<TcpStream>,
}

impl Session {
    pub fn attached(
        id: SessionId,
        stream: TcpStream,
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
    ) -> Self {
        let mut session = Self::detached(id);
        session.remote_addr = remote_addr;
        session.local_addr = local_addr;
        session.stream = Some(stream);
        session
    }

    /// A session with no socket behind it. Frames pile up in the send
    /// queue and reads always would-block. Used by tests and tools.
    pub fn detached(id: SessionId) -> Self {
        let now = Instant::now();
        let loopback = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        Self {
            id,
            remote_addr: loopback,
            local_addr: loopback,
            state: SessionState::Connected,
            close_reason: None,
            closed_at: None,
            authenticated: false,
            account_id: None,
            character_id: None,
            connected_at: now,
            last_activity: now,
            last_ping: None,
            stats: TrafficStats::default(),
            decoder: FrameDecoder::new(),
            encoder: FrameEncoder::new(),
            send_queue: VecDeque::new(),
            queued_bytes: 0,
            send_buffer_size: SEND_BUFFER_SIZE,
            head_written: 0,
            rate: RateWindow::new(now),
            stream: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    pub fn stats(&self) -> TrafficStats {
        self.stats
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Marks the login handshake complete.
    pub fn mark_authenticated(&mut self, account_id: u32) {
        self.authenticated = true;
        self.account_id = Some(account_id);
    }

    /// Records the character pick that moves the session in-game.
    pub fn set_character(&mut self, character_id: u32) {
        self.character_id = Some(character_id);
    }

    // ---- receive path ------------------------------------------------

    /// Drains the kernel buffer into the frame decoder without blocking.
    pub fn receive(&mut self) -> Result<ReadOutcome, NetworkError> {
        let Some(stream) = &self.stream else {
            return Ok(ReadOutcome::WouldBlock);
        };

        let mut chunk = [0_u8; 4096];
        let mut total = 0_usize;

        loop {
            match stream.try_read(&mut chunk) {
                Ok(0) => return Ok(ReadOutcome::Closed),
                Ok(n) => {
                    self.decoder.queue_slice(&chunk[..n]);
                    self.stats.bytes_received += n as u64;
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.stats.errors += 1;
                    return Err(NetworkError::Receive(e));
                }
            }
        }

        if total > 0 {
            self.touch();
            Ok(ReadOutcome::Progress(total))
        } else {
            Ok(ReadOutcome::WouldBlock)
        }
    }

    /// Extracts the next buffered frame, if a complete one has arrived.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        match self.decoder.try_next_frame() {
            Ok(Some(frame)) => {
                self.stats.frames_received += 1;
                Ok(Some(frame))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.stats.frames_dropped += 1;
                self.stats.errors += 1;
                Err(e)
            }
        }
    }

    // ---- send path ---------------------------------------------------

    /// Encodes one frame onto the ordered send queue.
    pub fn enqueue_frame(
        &mut self,
        command: Command,
        client_tick: u32,
        payload: &[u8],
    ) -> Result<(), NetworkError> {
        self.check_capacity(payload.len())?;
        self.encoder.append_frame(command, client_tick, payload)?;
        self.push_encoded();
        Ok(())
    }

    /// Fixed-keyword variant for frames sent before the rings sync.
    pub fn enqueue_frame_with_keyword(
        &mut self,
        command: Command,
        client_tick: u32,
        payload: &[u8],
        keyword: u8,
    ) -> Result<(), NetworkError> {
        self.check_capacity(payload.len())?;
        self.encoder
            .append_frame_with_keyword(command, client_tick, payload, keyword)?;
        self.push_encoded();
        Ok(())
    }

    fn check_capacity(&self, payload_len: usize) -> Result<(), NetworkError> {
        if self.queued_bytes + destiny_protocol::HEADER_SIZE + payload_len > self.send_buffer_size {
            return Err(NetworkError::BufferFull);
        }
        Ok(())
    }

    fn push_encoded(&mut self) {
        let frame = self.encoder.take();
        self.queued_bytes += frame.len();
        self.send_queue.push_back(frame);
    }

    /// Writes as much of the queue as the socket accepts. A partial write
    /// leaves the frame at the head. Returns whether the queue drained.
    pub fn flush(&mut self) -> Result<bool, NetworkError> {
        let Some(stream) = &self.stream else {
            return Ok(self.send_queue.is_empty());
        };

        while let Some(head) = self.send_queue.front() {
            let head_len = head.len();
            let written = stream.try_write(&head[self.head_written..]);
            match written {
                Ok(n) => {
                    self.head_written += n;
                    self.stats.bytes_sent += n as u64;
                    if self.head_written == head_len {
                        self.send_queue.pop_front();
                        self.queued_bytes -= head_len;
                        self.head_written = 0;
                        self.stats.frames_sent += 1;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.stats.errors += 1;
                    return Err(NetworkError::Send(e));
                }
            }
        }

        Ok(self.send_queue.is_empty())
    }

    pub fn pending_frames(&self) -> usize {
        self.send_queue.len()
    }

    /// The encoded frame at the head of the send queue.
    pub fn front_frame(&self) -> Option<&[u8]> {
        self.send_queue.front().map(|f| &f[..])
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    // ---- lifecycle and timers ----------------------------------------

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Whether a keepalive is due, and stamps the ping clock if so.
    pub(crate) fn ping_due(&mut self, now: Instant, ping_interval: Duration) -> bool {
        if self.idle(now) <= ping_interval {
            return false;
        }
        let due = match self.last_ping {
            Some(last) => now.duration_since(last) > ping_interval,
            None => true,
        };
        if due {
            self.last_ping = Some(now);
        }
        due
    }

    pub fn mark_closing(&mut self, reason: CloseReason) {
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            return;
        }
        self.state = SessionState::Closing;
        self.close_reason = Some(reason);
    }

    /// Drops the socket and finalizes the state. The registry prunes the
    /// entry after the grace period.
    pub fn mark_closed(&mut self) {
        self.state = SessionState::Closed;
        self.stream = None;
        self.closed_at = Some(Instant::now());
    }

    pub(crate) fn closed_at(&self) -> Option<Instant> {
        self.closed_at
    }

    /// Receive-direction decoder ring position.
    pub fn recv_ring_position(&self) -> usize {
        self.decoder.ring_position()
    }

    /// Send-direction encoder ring position.
    pub fn send_ring_position(&self) -> usize {
        self.encoder.ring_position()
    }
}
