//! Server listener, readiness loop, and frame-dispatch handler (C4, C6, C7,
//! C8 combined around one `Server` value).
//!
//! Replaces the source's closures over enclosing locals (the signal
//! handler reaching into the loop's `files`/`addresses`/`file_names`
//! dictionaries) with an explicit `Server` value that owns all of that
//! state and that shutdown is a method on (spec §9).

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use crate::audit::{AuditLog, Outcome};
use crate::codec::{check_payload_len, MessageType, Response};
use crate::connection::{Connection, Phase, Sink};
use crate::error::DispatchError;
use crate::lifecycle;
use crate::readiness::Epoll;

#[derive(Debug, Clone, Copy)]
enum CloseReason {
    Completed(Outcome),
    /// START lost a name collision; no sink was ever opened, so no audit
    /// row is written (spec invariant 5).
    Rejected,
    Protocol,
}

#[derive(Debug)]
enum Step {
    Continue,
    Close(CloseReason),
}

/// Owns the listener, the readiness set, and every live connection's
/// state. One `Server` per bound address (spec §5: the working directory
/// and audit log are exclusive to one server instance).
pub struct Server {
    listener: TcpListener,
    epoll: Epoll,
    connections: HashMap<RawFd, Connection>,
    in_flight_names: HashSet<String>,
    audit: AuditLog,
    base_dir: PathBuf,
}

impl Server {
    pub fn bind(addr: SocketAddr, base_dir: PathBuf, audit: AuditLog) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        listener.set_ttl(64).ok();

        let epoll = Epoll::new()?;
        epoll.register_read(listener.as_raw_fd())?;

        tracing::info!(%addr, "Listening");

        Ok(Self {
            listener,
            epoll,
            connections: HashMap::new(),
            in_flight_names: HashSet::new(),
            audit,
            base_dir,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the readiness loop until a shutdown signal is delivered.
    pub fn run(&mut self) -> io::Result<()> {
        while self.step()? {}
        Ok(())
    }

    /// Processes exactly one `epoll_wait` call's worth of readiness
    /// events. Returns `Ok(true)` to keep looping, `Ok(false)` once
    /// shutdown has been handled. Split out from `run` so it can be
    /// driven deterministically from tests.
    pub fn step(&mut self) -> io::Result<bool> {
        if lifecycle::shutdown_requested() {
            self.shutdown();
            return Ok(false);
        }

        let mut events = Vec::new();
        match self.epoll.wait(&mut events) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                if lifecycle::shutdown_requested() {
                    self.shutdown();
                    return Ok(false);
                }
                return Ok(true);
            }
            Err(e) => return Err(e),
        }

        let listener_fd = self.listener.as_raw_fd();
        for ev in events {
            if ev.fd == listener_fd {
                self.accept_one();
            } else {
                self.on_readable(ev.fd);
            }
        }
        Ok(true)
    }

    /// Accepts one connection, tolerating the same transient errors the
    /// source's `connect_client` retry loop does
    /// (`ConnectionResetError`/`ConnectionAbortedError`/`socket.timeout`).
    fn accept_one(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        tracing::error!(%peer, error = %e, "failed to set accepted socket non-blocking");
                        return;
                    }
                    let fd = stream.as_raw_fd();
                    if let Err(e) = self.epoll.register_read(fd) {
                        tracing::error!(%peer, error = %e, "failed to register connection");
                        return;
                    }
                    tracing::info!(%peer, "Accepted connection");
                    self.connections.insert(fd, Connection::new(stream, peer));
                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if is_transient_accept_error(&e) => {
                    tracing::trace!(error = %e, "transient accept error, retrying");
                    continue;
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn on_readable(&mut self, fd: RawFd) {
        let Some(mut conn) = self.connections.remove(&fd) else {
            return;
        };

        match self.advance(&mut conn) {
            Ok(Step::Continue) => {
                self.connections.insert(fd, conn);
            }
            Ok(Step::Close(reason)) => self.finish(fd, conn, reason),
            Err(err) => {
                tracing::warn!(peer = %conn.peer, error = %err, "protocol error");
                // Spec §7: PeerClosed is handled without a send attempt — the
                // peer is already gone, so writing would just fail again.
                if !matches!(err, DispatchError::PeerClosed) {
                    let _ = respond(&mut conn, Response::Error);
                }
                self.finish(fd, conn, CloseReason::Protocol);
            }
        }
    }

    fn advance(&mut self, conn: &mut Connection) -> Result<Step, DispatchError> {
        match conn.phase {
            Phase::AwaitingType => self.advance_type(conn),
            Phase::AwaitingLength => self.advance_length(conn),
            Phase::AwaitingPayload => self.advance_payload(conn),
        }
    }

    fn advance_type(&mut self, conn: &mut Connection) -> Result<Step, DispatchError> {
        let needed = 6 - conn.type_buf_mut().len();
        let mut chunk = vec![0u8; needed];
        match conn.stream.read(&mut chunk) {
            Ok(0) => Err(DispatchError::PeerClosed),
            Ok(n) => {
                conn.type_buf_mut().extend_from_slice(&chunk[..n]);
                if conn.type_buf_mut().len() == 6 {
                    let mut literal = [0u8; 6];
                    literal.copy_from_slice(conn.type_buf_mut());
                    let message_type = MessageType::from_literal(literal)
                        .ok_or(DispatchError::Codec(crate::codec::CodecError::MalformedType(literal)))?;
                    conn.pending_type = Some(message_type);
                    conn.phase = Phase::AwaitingLength;
                }
                Ok(Step::Continue)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Step::Continue),
            Err(e) => Err(e.into()),
        }
    }

    fn advance_length(&mut self, conn: &mut Connection) -> Result<Step, DispatchError> {
        let needed = 8 - conn.len_buf_mut().len();
        let mut chunk = vec![0u8; needed];
        match conn.stream.read(&mut chunk) {
            Ok(0) => Err(DispatchError::PeerClosed),
            Ok(n) => {
                conn.len_buf_mut().extend_from_slice(&chunk[..n]);
                if conn.len_buf_mut().len() == 8 {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(conn.len_buf_mut());
                    let len = u64::from_be_bytes(raw);
                    check_payload_len(len)?;
                    conn.pending_len = Some(len);
                    conn.phase = Phase::AwaitingPayload;
                }
                Ok(Step::Continue)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Step::Continue),
            Err(e) => Err(e.into()),
        }
    }

    /// Per spec §4.6: a single read must produce the entire payload; a
    /// short read is connection loss, not something to accumulate across
    /// readiness events.
    fn advance_payload(&mut self, conn: &mut Connection) -> Result<Step, DispatchError> {
        let len = conn.pending_len.expect("length decoded before entering AwaitingPayload") as usize;
        if len == 0 {
            return self.apply_transition(conn, Vec::new());
        }
        let mut buf = vec![0u8; len];
        match conn.stream.read(&mut buf) {
            Ok(n) if n == len => self.apply_transition(conn, buf),
            Ok(_) => Err(DispatchError::PeerClosed),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Step::Continue),
            Err(e) => Err(e.into()),
        }
    }

    fn apply_transition(&mut self, conn: &mut Connection, payload: Vec<u8>) -> Result<Step, DispatchError> {
        match conn.pending_type.expect("pending_type set before AwaitingPayload") {
            MessageType::Start => self.apply_start(conn, &payload),
            MessageType::Data => self.apply_data(conn, &payload),
            MessageType::End => self.apply_end(conn),
            MessageType::Cancel => self.apply_cancel(conn),
        }
    }

    fn apply_start(&mut self, conn: &mut Connection, payload: &[u8]) -> Result<Step, DispatchError> {
        if conn.sink.is_some() {
            return Err(DispatchError::MalformedStart("duplicate START on an open connection".into()));
        }

        let text = std::str::from_utf8(payload)
            .map_err(|_| DispatchError::MalformedStart("payload is not valid UTF-8".into()))?;
        if text.matches('\t').count() != 1 {
            return Err(DispatchError::MalformedStart("expected exactly one tab separator".into()));
        }
        let (raw_name, size_str) = text.split_once('\t').expect("checked above");
        size_str
            .parse::<u64>()
            .map_err(|_| DispatchError::MalformedStart(format!("invalid file size {size_str:?}")))?;

        let name = basename(raw_name)
            .ok_or_else(|| DispatchError::MalformedStart("empty basename after stripping path".into()))?;

        if self.in_flight_names.contains(&name) {
            tracing::info!(file = %name, "rejected: already being transferred");
            respond(conn, Response::FileAlreadyInFlight)?;
            return Ok(Step::Close(CloseReason::Rejected));
        }

        let path = self.base_dir.join(&name);
        let file = fs::OpenOptions::new().create(true).write(true).truncate(true).open(&path)?;

        respond(conn, Response::Success)?;
        self.in_flight_names.insert(name.clone());
        tracing::info!(file = %name, %size_str, "receiving file");
        conn.sink = Some(Sink { file, name });
        conn.reset_for_next_frame();
        Ok(Step::Continue)
    }

    fn apply_data(&mut self, conn: &mut Connection, payload: &[u8]) -> Result<Step, DispatchError> {
        if conn.sink.is_none() {
            return Err(DispatchError::FrameBeforeStart(MessageType::Data));
        }
        respond(conn, Response::Success)?;
        conn.sink.as_mut().expect("checked above").file.write_all(payload)?;
        conn.reset_for_next_frame();
        Ok(Step::Continue)
    }

    fn apply_end(&mut self, conn: &mut Connection) -> Result<Step, DispatchError> {
        if conn.sink.is_none() {
            return Err(DispatchError::FrameBeforeStart(MessageType::End));
        }
        respond(conn, Response::Success)?;
        Ok(Step::Close(CloseReason::Completed(Outcome::Success)))
    }

    fn apply_cancel(&mut self, conn: &mut Connection) -> Result<Step, DispatchError> {
        if conn.sink.is_none() {
            return Err(DispatchError::FrameBeforeStart(MessageType::Cancel));
        }
        respond(conn, Response::Success)?;
        Ok(Step::Close(CloseReason::Completed(Outcome::Cancel)))
    }

    fn finish(&mut self, fd: RawFd, mut conn: Connection, reason: CloseReason) {
        if let Err(e) = self.epoll.deregister(fd) {
            tracing::debug!(error = %e, "deregister failed (connection may already be gone)");
        }

        if let Some(sink) = conn.sink.take() {
            self.in_flight_names.remove(&sink.name);
            let path = self.base_dir.join(&sink.name);
            drop(sink.file);

            let outcome = match reason {
                CloseReason::Completed(outcome @ Outcome::Success) => Some(outcome),
                CloseReason::Completed(outcome @ Outcome::Cancel) => {
                    if let Err(e) = fs::remove_file(&path) {
                        tracing::warn!(error = %e, path = %path.display(), "failed to delete cancelled file");
                    }
                    Some(outcome)
                }
                CloseReason::Completed(Outcome::Error) | CloseReason::Protocol => {
                    if let Err(e) = fs::remove_file(&path) {
                        tracing::warn!(error = %e, path = %path.display(), "failed to delete partial file");
                    }
                    Some(Outcome::Error)
                }
                CloseReason::Rejected => None,
            };

            if let Some(outcome) = outcome {
                if let Err(e) = self.audit.append(&sink.name, outcome) {
                    tracing::error!(error = %e, "failed to write audit log row");
                }
            }
        }

        tracing::info!(peer = %conn.peer, reason = ?reason, "connection closed");
    }

    /// Idempotent graceful shutdown (spec §4.7, §8 property 4): closes
    /// every live sink, deletes its partial file, deregisters every
    /// descriptor, and deregisters the listener. Safe to call more than
    /// once; only the first call does anything.
    pub fn shutdown(&mut self) {
        if !lifecycle::take_shutdown_once() {
            return;
        }
        tracing::info!("Closing server socket...");

        let fds: Vec<RawFd> = self.connections.keys().copied().collect();
        for fd in fds {
            if let Some(mut conn) = self.connections.remove(&fd) {
                if let Some(sink) = conn.sink.take() {
                    self.in_flight_names.remove(&sink.name);
                    let path = self.base_dir.join(&sink.name);
                    drop(sink.file);
                    let _ = fs::remove_file(&path);
                }
            }
            let _ = self.epoll.deregister(fd);
        }
        let _ = self.epoll.deregister(self.listener.as_raw_fd());
    }
}

fn respond(conn: &mut Connection, response: Response) -> io::Result<()> {
    conn.stream.write_all(&[response.byte()])
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::Interrupted
    )
}

/// Strips all path components, leaving only the final segment, to prevent
/// path traversal via a START payload like `../../etc/passwd` (spec §4.6,
/// §8 scenario S5).
fn basename(raw: &str) -> Option<String> {
    Path::new(raw)
        .file_name()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_frame;
    use std::io::Read as _;
    use std::net::TcpStream;
    use std::time::Duration;
    use tempfile::tempdir;

    fn start_test_server() -> (Server, tempfile::TempDir, std::path::PathBuf) {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("log_file.csv");
        let audit = AuditLog::open(&log_path).unwrap();
        let server = Server::bind("127.0.0.1:0".parse().unwrap(), dir.path().to_path_buf(), audit).unwrap();
        (server, dir, log_path)
    }

    fn connect(server: &Server) -> TcpStream {
        let stream = TcpStream::connect(server.local_addr().unwrap()).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        stream
    }

    fn read_one_byte(stream: &mut TcpStream) -> u8 {
        let mut b = [0u8; 1];
        stream.read_exact(&mut b).unwrap();
        b[0]
    }

    fn send_frame_and_drive(server: &mut Server, stream: &mut TcpStream, mt: MessageType, payload: &[u8]) -> u8 {
        stream.write_all(&encode_frame(mt, payload)).unwrap();
        // Type, length, and payload phases each consume one readiness step.
        for _ in 0..3 {
            server.step().unwrap();
        }
        read_one_byte(stream)
    }

    #[test]
    fn s1_happy_path_round_trips_file_contents_and_logs_success() {
        let (mut server, dir, log_path) = start_test_server();
        let mut client = connect(&server);
        server.step().unwrap(); // accept

        assert_eq!(
            send_frame_and_drive(&mut server, &mut client, MessageType::Start, b"hello.txt\t3"),
            Response::Success.byte()
        );
        assert_eq!(
            send_frame_and_drive(&mut server, &mut client, MessageType::Data, b"Hi!"),
            Response::Success.byte()
        );
        assert_eq!(
            send_frame_and_drive(&mut server, &mut client, MessageType::End, &[0x00]),
            Response::Success.byte()
        );

        let contents = fs::read(dir.path().join("hello.txt")).unwrap();
        assert_eq!(contents, b"Hi!");

        let log = fs::read_to_string(&log_path).unwrap();
        let row = log.lines().nth(1).unwrap();
        assert!(row.starts_with("hello.txt\t"));
        assert!(row.ends_with("\tSUCCESS"));
    }

    #[test]
    fn s2_collision_rejects_the_second_start_for_the_same_name() {
        let (mut server, _dir, _log) = start_test_server();
        let mut winner = connect(&server);
        let mut loser = connect(&server);
        server.step().unwrap();
        server.step().unwrap();

        assert_eq!(
            send_frame_and_drive(&mut server, &mut winner, MessageType::Start, b"shared.bin\t1"),
            Response::Success.byte()
        );
        assert_eq!(
            send_frame_and_drive(&mut server, &mut loser, MessageType::Start, b"shared.bin\t1"),
            Response::FileAlreadyInFlight.byte()
        );
    }

    #[test]
    fn s3_cancel_deletes_partial_file_and_logs_cancel() {
        let (mut server, dir, log_path) = start_test_server();
        let mut client = connect(&server);
        server.step().unwrap();

        send_frame_and_drive(&mut server, &mut client, MessageType::Start, b"big.bin\t10");
        send_frame_and_drive(&mut server, &mut client, MessageType::Data, b"abcd");
        assert_eq!(
            send_frame_and_drive(&mut server, &mut client, MessageType::Cancel, &[0x00]),
            Response::Success.byte()
        );

        assert!(!dir.path().join("big.bin").exists());
        let log = fs::read_to_string(&log_path).unwrap();
        let row = log.lines().nth(1).unwrap();
        assert!(row.starts_with("big.bin\t"));
        assert!(row.ends_with("\tCANCEL"));
    }

    #[test]
    fn s4_data_before_start_is_rejected_with_no_audit_row() {
        let (mut server, _dir, log_path) = start_test_server();
        let mut client = connect(&server);
        server.step().unwrap();

        assert_eq!(
            send_frame_and_drive(&mut server, &mut client, MessageType::Data, b"xxxx"),
            Response::Error.byte()
        );

        let log = fs::read_to_string(&log_path).unwrap();
        assert_eq!(log.lines().count(), 1); // header only
    }

    #[test]
    fn s5_path_traversal_is_confined_to_the_base_directory() {
        let (mut server, dir, _log) = start_test_server();
        let mut client = connect(&server);
        server.step().unwrap();

        send_frame_and_drive(&mut server, &mut client, MessageType::Start, b"../../etc/x\t1");
        send_frame_and_drive(&mut server, &mut client, MessageType::End, &[0x00]);

        assert!(dir.path().join("x").exists());
    }

    #[test]
    fn s6_oversized_length_is_rejected_before_allocating_a_buffer() {
        let (mut server, _dir, log_path) = start_test_server();
        let mut client = connect(&server);
        server.step().unwrap();

        send_frame_and_drive(&mut server, &mut client, MessageType::Start, b"ok.bin\t1");

        client.write_all(&MessageType::Data.literal()).unwrap();
        client.write_all(&u64::MAX.to_be_bytes()).unwrap();
        server.step().unwrap(); // type
        server.step().unwrap(); // length -> rejected here, before any payload read
        assert_eq!(read_one_byte(&mut client), Response::Error.byte());

        let log = fs::read_to_string(&log_path).unwrap();
        let row = log.lines().nth(1).unwrap();
        assert!(row.starts_with("ok.bin\t"));
        assert!(row.ends_with("\tERROR"));
    }

    #[test]
    fn shutdown_is_idempotent() {
        let (mut server, _dir, _log) = start_test_server();
        server.shutdown();
        server.shutdown();
        server.shutdown();
    }

    #[test]
    fn basename_strips_path_traversal_components() {
        assert_eq!(basename("../../etc/x"), Some("x".to_string()));
        assert_eq!(basename("plain.txt"), Some("plain.txt".to_string()));
        assert_eq!(basename(".."), None);
        assert_eq!(basename(""), None);
    }
}
