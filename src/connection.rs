//! Per-connection transfer descriptor (C5, spec §3).
//!
//! The source keys several dictionaries by the socket object itself
//! (`lens_of_data[client_socket]`, `message_types[client_socket]`, ...).
//! Here the decoder's phase is an explicit tagged enum owned by one
//! `Connection` record, forbidding the illegal field combinations the
//! source's "is this dict key present" encoding allowed by construction
//! (spec §9, re-architecting note on sentinel tri-state).

use std::fs::File;
use std::net::{SocketAddr, TcpStream};

use crate::codec::MessageType;

/// The decoder's current expectation. Advances strictly
/// `AwaitingType -> AwaitingLength -> AwaitingPayload -> AwaitingType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingType,
    AwaitingLength,
    AwaitingPayload,
}

/// The sink a successful START opens: the file being written to, and the
/// basename that owns an entry in the server's `in_flight_names` set.
pub struct Sink {
    pub file: File,
    pub name: String,
}

/// All state the dispatcher needs for one client socket between readiness
/// events. Accumulation buffers hold partially-read type/length bytes
/// across non-blocking reads (spec §4.6: preferred over treating every
/// partial read as a protocol error, which the source does for payload
/// reads only).
pub struct Connection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub phase: Phase,
    pub pending_type: Option<MessageType>,
    pub pending_len: Option<u64>,
    pub sink: Option<Sink>,
    type_buf: Vec<u8>,
    len_buf: Vec<u8>,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            phase: Phase::AwaitingType,
            pending_type: None,
            pending_len: None,
            sink: None,
            type_buf: Vec::with_capacity(6),
            len_buf: Vec::with_capacity(8),
        }
    }

    pub fn type_buf_mut(&mut self) -> &mut Vec<u8> {
        &mut self.type_buf
    }

    pub fn len_buf_mut(&mut self) -> &mut Vec<u8> {
        &mut self.len_buf
    }

    /// Resets the decoder back to `AwaitingType`, clearing the per-frame
    /// scratch state. Called after every completed `AwaitingPayload`
    /// transition (spec invariant 3).
    pub fn reset_for_next_frame(&mut self) {
        self.phase = Phase::AwaitingType;
        self.pending_type = None;
        self.pending_len = None;
        self.type_buf.clear();
        self.len_buf.clear();
    }
}
