//! Error taxonomy (spec §7), grounded in the `thiserror` style used by
//! `oferchen-rsync`'s `crates/batch/src/error.rs` and
//! `crates/checksums/src/rolling/error.rs`.

use std::io;
use thiserror::Error;

use crate::codec::{CodecError, MessageType};

/// Errors surfaced to the client binary.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("connection failed")]
    ConnectionFailed,
    #[error("file is already being transferred")]
    FileAlreadyTransferring,
    #[error("transfer failed")]
    TransferFailed,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors that can abort a single connection on the server side. Never
/// escapes the dispatcher: every variant maps to a terminal transition
/// (spec §4.6, §7) and is logged, not propagated to the readiness loop.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("{0:?} frame received before a successful START")]
    FrameBeforeStart(MessageType),
    #[error("malformed START payload: {0}")]
    MalformedStart(String),
    #[error("peer closed the connection")]
    PeerClosed,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Fatal startup errors (bind, mkdir, log file) that terminate the process.
#[derive(Debug, Error)]
pub enum ServerStartupError {
    #[error("failed to prepare working directory: {0}")]
    Directory(#[source] io::Error),
    #[error("failed to open audit log: {0}")]
    AuditLog(#[source] io::Error),
    #[error("failed to bind listener: {0}")]
    Bind(#[source] io::Error),
}
