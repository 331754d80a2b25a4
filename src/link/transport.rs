//! TCP transport session.
//!
//! One long-lived connection to the receiver, written synchronously in
//! fixed-size chunks. The chunk size is a contract with the receiver's
//! read loop; both ends must agree, so it is configuration-fixed and never
//! adapted. Connect attempts are gated by the exponential backoff, and the
//! socket is tuned for low-latency streaming on every fresh connection.

use std::io::{self, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};

use crate::backoff::ExponentialBackoff;
use crate::config::{ServerConfig, TcpConfig};
use crate::stats::Stats;
use crate::time::{IntervalTimer, SharedClock};

/// Deadline for a blocking connect attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Sanity cap on a single write call.
const MAX_WRITE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Errored,
    Closing,
}

impl LinkState {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkState::Disconnected => "DISCONNECTED",
            LinkState::Connecting => "CONNECTING",
            LinkState::Connected => "CONNECTED",
            LinkState::Errored => "ERRORED",
            LinkState::Closing => "CLOSING",
        }
    }
}

pub struct TransportSession {
    server: ServerConfig,
    tcp: TcpConfig,
    clock: SharedClock,
    stats: Stats,
    socket: Option<TcpStream>,
    state: LinkState,
    state_entered_ms: u64,
    established_ms: u64,
    last_successful_write_ms: u64,
    retry_timer: IntervalTimer,
    backoff: ExponentialBackoff,
    first_write: bool,
}

impl TransportSession {
    pub fn new(
        server: ServerConfig,
        tcp: TcpConfig,
        clock: SharedClock,
        stats: Stats,
        jitter_seed: u32,
    ) -> Self {
        let backoff = ExponentialBackoff::new(
            server.reconnect_min_ms,
            server.reconnect_max_ms,
            server.backoff_jitter_pct,
            jitter_seed,
        );
        let mut retry_timer = IntervalTimer::new(clock.clone(), server.reconnect_min_ms, false);
        // First attempt should not sit out a full reconnect delay.
        retry_timer.start_expired();

        let now = clock.now_ms();
        Self {
            server,
            tcp,
            clock,
            stats,
            socket: None,
            state: LinkState::Disconnected,
            state_entered_ms: now,
            established_ms: 0,
            last_successful_write_ms: 0,
            retry_timer,
            backoff,
            first_write: true,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Attempt one connection if the backoff-armed retry timer allows it.
    pub fn connect(&mut self) -> bool {
        if self.state == LinkState::Connected {
            return true;
        }
        if !self.retry_timer.is_expired() {
            return false;
        }

        self.set_state(LinkState::Connecting);
        tracing::info!(
            host = %self.server.host,
            port = self.server.port,
            attempt = self.backoff.failures() + 1,
            "connecting to receiver"
        );

        match self.try_connect() {
            Ok(sock) => {
                self.apply_socket_options(&sock);
                self.socket = Some(sock);
                self.set_state(LinkState::Connected);
                self.last_successful_write_ms = self.clock.now_ms();
                self.backoff.reset();
                self.first_write = true;
                self.stats.incr_transport_reconnects();
                tracing::info!(
                    chunk_bytes = self.tcp.chunk_bytes,
                    "receiver connection established"
                );
                true
            }
            Err(e) => {
                tracing::error!("receiver connection failed: {e}");
                self.handle_link_error("connect");

                let next_delay = self.backoff.next_delay();
                self.retry_timer.set_interval(next_delay);
                self.retry_timer.start();
                tracing::info!(next_delay_ms = next_delay, "next connection attempt scheduled");
                false
            }
        }
    }

    fn try_connect(&self) -> io::Result<TcpStream> {
        let addr = (self.server.host.as_str(), self.server.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "receiver address did not resolve")
            })?;
        TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
    }

    /// Tune the fresh socket for audio streaming. Option failures degrade,
    /// never abort: the connection is still usable without them.
    fn apply_socket_options(&self, sock: &TcpStream) {
        // Receiver reads bare chunks; writes must not sit in Nagle buffers.
        if let Err(e) = sock.set_nodelay(true) {
            tracing::warn!("failed to set TCP_NODELAY: {e}");
        }

        let sref = SockRef::from(sock);
        if let Err(e) = sref.set_keepalive(true) {
            tracing::warn!("failed to enable SO_KEEPALIVE: {e}");
        }
        let keepalive = TcpKeepalive::new()
            .with_time(Duration::from_secs(self.tcp.keepalive_idle_s as u64))
            .with_interval(Duration::from_secs(self.tcp.keepalive_interval_s as u64))
            .with_retries(self.tcp.keepalive_count);
        if let Err(e) = sref.set_tcp_keepalive(&keepalive) {
            tracing::warn!("failed to set keepalive probe timing: {e}");
        }

        if let Err(e) =
            sock.set_write_timeout(Some(Duration::from_millis(self.tcp.write_timeout_ms)))
        {
            tracing::warn!("failed to set send timeout: {e}");
        }

        tracing::debug!(
            keepalive_idle_s = self.tcp.keepalive_idle_s,
            keepalive_interval_s = self.tcp.keepalive_interval_s,
            keepalive_count = self.tcp.keepalive_count,
            write_timeout_ms = self.tcp.write_timeout_ms,
            "socket options applied"
        );
    }

    /// Write a whole buffer in receiver-sized chunks.
    ///
    /// Returns false on any failure; bytes already sent stay sent (the
    /// receiver tolerates a truncated tail, not reordering). The
    /// last-successful-write stamp moves only when the full buffer lands,
    /// so stale detection spans multi-chunk payloads.
    pub fn write(&mut self, data: &[u8]) -> bool {
        if data.is_empty() {
            tracing::warn!("write of zero bytes - nothing to send");
            return true;
        }
        if data.len() > MAX_WRITE_BYTES {
            tracing::error!(len = data.len(), "write exceeds safety limit");
            return false;
        }
        if self.state != LinkState::Connected || self.socket.is_none() {
            return false;
        }

        if self.first_write {
            tracing::info!(
                first_chunk_bytes = data.len().min(self.tcp.chunk_bytes),
                "starting audio transmission"
            );
            self.first_write = false;
        }

        let mut total_sent = 0;
        while total_sent < data.len() {
            let end = (total_sent + self.tcp.chunk_bytes).min(data.len());
            let chunk = &data[total_sent..end];

            let sent = match self.socket.as_mut() {
                Some(sock) => match sock.write(chunk) {
                    Ok(n) => n,
                    Err(e)
                        if e.kind() == io::ErrorKind::WouldBlock
                            || e.kind() == io::ErrorKind::TimedOut =>
                    {
                        0 // send timeout expired
                    }
                    Err(e) => {
                        tracing::error!("socket write failed: {e}");
                        0
                    }
                },
                None => return false,
            };

            if sent == 0 {
                tracing::error!(
                    sent = total_sent,
                    total = data.len(),
                    "TCP write returned no progress"
                );
                self.handle_link_error("write");

                let now = self.clock.now_ms();
                if now.wrapping_sub(self.last_successful_write_ms) > self.tcp.write_timeout_ms {
                    tracing::warn!("write timeout exceeded - ejecting stale session");
                    self.disconnect();
                }
                return false;
            }
            total_sent += sent;
        }

        self.last_successful_write_ms = self.clock.now_ms();
        self.stats.add_bytes_sent(total_sent as u64);
        true
    }

    /// Reconcile the stored state with the real socket, then report.
    pub fn is_connected(&mut self) -> bool {
        self.validate();
        self.state == LinkState::Connected
    }

    /// Stored state vs. socket truth.
    ///
    /// A dead socket under a `Connected` session downgrades to
    /// `Disconnected` and re-arms an immediate retry. The only upgrade is
    /// completing a `Connecting` session; a live socket held by an errored
    /// session is not proof the session works (the last write failed).
    fn validate(&mut self) {
        let alive = self.socket.as_ref().map(socket_alive).unwrap_or(false);

        match (self.state, alive) {
            (LinkState::Connected, false) => {
                tracing::warn!("receiver connection lost unexpectedly");
                self.socket = None;
                self.set_state(LinkState::Disconnected);
                self.retry_timer.set_interval(self.server.reconnect_min_ms);
                self.retry_timer.start();
            }
            (LinkState::Connecting, true) => {
                self.set_state(LinkState::Connected);
            }
            _ => {}
        }
    }

    /// Close the session if one is open. Idempotent on `Disconnected`.
    pub fn disconnect(&mut self) {
        if self.state == LinkState::Disconnected && self.socket.is_none() {
            return;
        }

        if self.socket.is_some() {
            self.set_state(LinkState::Closing);
            tracing::info!("disconnecting from receiver");
            self.socket = None;
        }
        self.set_state(LinkState::Disconnected);
    }

    pub fn connection_uptime_ms(&self) -> u64 {
        if self.state == LinkState::Connected {
            self.clock.now_ms().wrapping_sub(self.established_ms)
        } else {
            0
        }
    }

    fn handle_link_error(&mut self, context: &str) {
        tracing::error!(context, "transport error");
        self.stats.incr_link_errors();
        // The failed session's socket is useless; drop it with the state.
        self.socket = None;
        self.set_state(LinkState::Errored);
    }

    fn set_state(&mut self, next: LinkState) {
        if self.state == next {
            return;
        }
        tracing::debug!(from = self.state.as_str(), to = next.as_str(), "transport state");
        self.state = next;
        self.state_entered_ms = self.clock.now_ms();
        self.stats.incr_link_state_changes();
        if next == LinkState::Connected {
            self.established_ms = self.state_entered_ms;
        }
    }
}

/// Probe a socket without consuming data: a zero-byte peek means the peer
/// closed; `WouldBlock` means the connection is idle but live.
fn socket_alive(sock: &TcpStream) -> bool {
    if sock.set_nonblocking(true).is_err() {
        return false;
    }
    let mut probe = [0u8; 1];
    let alive = match sock.peek(&mut probe) {
        Ok(0) => false,
        Ok(_) => true,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
        Err(_) => false,
    };
    let _ = sock.set_nonblocking(false);
    alive
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::SystemClock;
    use std::io::Read;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;

    /// Localhost receiver that accumulates everything it reads.
    struct Receiver {
        port: u16,
        received: Arc<Mutex<Vec<u8>>>,
        drop_connection: Arc<AtomicBool>,
    }

    impl Receiver {
        fn spawn() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let port = listener.local_addr().unwrap().port();
            let received = Arc::new(Mutex::new(Vec::new()));
            let drop_connection = Arc::new(AtomicBool::new(false));

            let recv_clone = received.clone();
            let drop_clone = drop_connection.clone();
            thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(mut stream) = stream else { break };
                    stream
                        .set_read_timeout(Some(Duration::from_millis(20)))
                        .unwrap();
                    let mut buf = [0u8; 4096];
                    loop {
                        if drop_clone.load(Ordering::Relaxed) {
                            drop_clone.store(false, Ordering::Relaxed);
                            break; // close this connection, keep listening
                        }
                        match stream.read(&mut buf) {
                            Ok(0) => break,
                            Ok(n) => recv_clone.lock().unwrap().extend_from_slice(&buf[..n]),
                            Err(ref e)
                                if e.kind() == io::ErrorKind::WouldBlock
                                    || e.kind() == io::ErrorKind::TimedOut =>
                            {
                                continue
                            }
                            Err(_) => break,
                        }
                    }
                }
            });

            Self {
                port,
                received,
                drop_connection,
            }
        }

        fn bytes(&self) -> Vec<u8> {
            self.received.lock().unwrap().clone()
        }
    }

    fn session(port: u16) -> TransportSession {
        let server = ServerConfig {
            host: "127.0.0.1".to_string(),
            port,
            reconnect_min_ms: 10,
            reconnect_max_ms: 100,
            backoff_jitter_pct: 0,
        };
        let tcp = TcpConfig {
            write_timeout_ms: 200,
            chunk_bytes: 64,
            ..TcpConfig::default()
        };
        let clock: SharedClock = Arc::new(SystemClock::new());
        TransportSession::new(server, tcp, clock, Stats::new(), 7)
    }

    fn wait_for<F: FnMut() -> bool>(mut cond: F, note: &str) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("timed out waiting for {note}");
    }

    #[test]
    fn test_connect_and_state_progression() {
        let receiver = Receiver::spawn();
        let mut session = session(receiver.port);

        assert_eq!(session.state(), LinkState::Disconnected);
        assert!(session.connect());
        assert_eq!(session.state(), LinkState::Connected);
        assert!(session.is_connected());
    }

    #[test]
    fn test_connect_failure_schedules_backoff() {
        // Nobody is listening on this freshly bound-then-dropped port.
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let mut session = session(port);

        assert!(!session.connect());
        assert_eq!(session.state(), LinkState::Errored);
        assert_eq!(session.stats.link_errors(), 1);
        assert!(session.retry_timer.is_running());

        // Gated until the retry timer expires.
        assert!(!session.connect());
    }

    #[test]
    fn test_written_bytes_arrive_in_order() {
        let receiver = Receiver::spawn();
        let mut session = session(receiver.port);
        assert!(session.connect());

        // Several buffers larger than the chunk size, distinct contents.
        let mut expected = Vec::new();
        for round in 0u8..5 {
            let buf: Vec<u8> = (0..300).map(|i| round.wrapping_mul(31).wrapping_add(i as u8)).collect();
            assert!(session.write(&buf));
            expected.extend_from_slice(&buf);
        }

        wait_for(|| receiver.bytes().len() >= expected.len(), "receiver bytes");
        assert_eq!(receiver.bytes(), expected);
        assert_eq!(session.stats.bytes_sent(), expected.len() as u64);
    }

    #[test]
    fn test_write_empty_buffer_is_a_noop_success() {
        let receiver = Receiver::spawn();
        let mut session = session(receiver.port);
        assert!(session.connect());

        assert!(session.write(&[]));
        thread::sleep(Duration::from_millis(50));
        assert!(receiver.bytes().is_empty());
    }

    #[test]
    fn test_write_over_sanity_cap_rejected() {
        let receiver = Receiver::spawn();
        let mut session = session(receiver.port);
        assert!(session.connect());

        let oversized = vec![0u8; MAX_WRITE_BYTES + 1];
        assert!(!session.write(&oversized));
        // No state change: the session stays usable.
        assert_eq!(session.state(), LinkState::Connected);
    }

    #[test]
    fn test_write_when_disconnected_fails() {
        let receiver = Receiver::spawn();
        let mut session = session(receiver.port);

        assert!(!session.write(&[1, 2, 3, 4]));
        assert_eq!(session.state(), LinkState::Disconnected);
        drop(receiver);
    }

    #[test]
    fn test_peer_close_detected_by_validation() {
        let receiver = Receiver::spawn();
        let mut session = session(receiver.port);
        assert!(session.connect());

        receiver.drop_connection.store(true, Ordering::Relaxed);
        wait_for(
            || !session.is_connected(),
            "validation to notice the closed peer",
        );
        assert_eq!(session.state(), LinkState::Disconnected);
    }

    #[test]
    fn test_write_failure_after_peer_close_marks_error() {
        let receiver = Receiver::spawn();
        let mut session = session(receiver.port);
        assert!(session.connect());

        receiver.drop_connection.store(true, Ordering::Relaxed);
        thread::sleep(Duration::from_millis(100));

        // Keep writing until the failure surfaces (the first write after a
        // close can still land in kernel buffers).
        let payload = vec![7u8; 256];
        let mut failed = false;
        for _ in 0..50 {
            if !session.write(&payload) {
                failed = true;
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(failed, "write never failed after peer close");
        assert!(session.stats.link_errors() >= 1);
        assert_ne!(session.state(), LinkState::Connected);
    }

    #[test]
    fn test_reconnect_after_peer_close() {
        let receiver = Receiver::spawn();
        let mut session = session(receiver.port);
        assert!(session.connect());
        assert_eq!(session.stats.transport_reconnects(), 1);

        receiver.drop_connection.store(true, Ordering::Relaxed);
        wait_for(|| !session.is_connected(), "disconnect detection");

        wait_for(|| session.connect(), "reconnect");
        assert_eq!(session.stats.transport_reconnects(), 2);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let receiver = Receiver::spawn();
        let mut session = session(receiver.port);
        assert!(session.connect());

        session.disconnect();
        assert_eq!(session.state(), LinkState::Disconnected);
        let changes = session.stats.snapshot().link_state_changes;

        session.disconnect();
        session.disconnect();
        assert_eq!(session.state(), LinkState::Disconnected);
        assert_eq!(session.stats.snapshot().link_state_changes, changes);
    }

    #[test]
    fn test_uptime_counts_only_while_connected() {
        let receiver = Receiver::spawn();
        let mut session = session(receiver.port);
        assert_eq!(session.connection_uptime_ms(), 0);

        assert!(session.connect());
        thread::sleep(Duration::from_millis(30));
        assert!(session.connection_uptime_ms() >= 20);

        session.disconnect();
        assert_eq!(session.connection_uptime_ms(), 0);
    }
}
