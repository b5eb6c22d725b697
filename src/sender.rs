//! Chunked file upload sequencing (C3, spec §4.3, §6.2).
//!
//! Grounded in `original_source/src/Client.py`'s `send_file`: a START
//! carrying the basename and on-disk size, then DATA frames chunked at
//! the caller's buffer size, then END. `--buffer_size` only governs how
//! the client slices its reads; it has no bearing on the server's own
//! per-frame payload ceiling (`codec::MAX_PAYLOAD_LEN`).

use std::fs::File;
use std::io::Read;
use std::net::TcpStream;
use std::path::Path;

use crate::codec::MessageType;
use crate::error::ClientError;
use crate::lifecycle;
use crate::transport::send_message;

/// Smallest and largest accepted `--buffer_size` values (spec §6.2).
pub const MIN_BUFFER_SIZE: usize = 1;
pub const MAX_BUFFER_SIZE: usize = 32_768;

/// Reports progress after each DATA frame is acknowledged, so a caller
/// (the CLI, a GUI) can show a transfer percentage without this module
/// knowing anything about presentation.
pub struct Progress {
    pub bytes_sent: u64,
    pub total_bytes: u64,
}

/// Sends `path`'s contents as one START, N DATA frames of at most
/// `buffer_size` bytes each, and one END, invoking `on_progress` after
/// every acknowledged DATA frame.
pub fn send_file(
    stream: &mut TcpStream,
    path: &Path,
    buffer_size: usize,
    mut on_progress: impl FnMut(Progress),
) -> Result<(), ClientError> {
    let buffer_size = buffer_size.clamp(MIN_BUFFER_SIZE, MAX_BUFFER_SIZE);

    let mut file = File::open(path).map_err(ClientError::Io)?;
    let total_bytes = file.metadata().map_err(ClientError::Io)?.len();
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ClientError::Validation(format!("{} has no usable file name", path.display())))?;

    send_message(stream, MessageType::Start, format!("{name}\t{total_bytes}").as_bytes())?;

    let mut buf = vec![0u8; buffer_size];
    let mut bytes_sent = 0u64;
    loop {
        let n = file.read(&mut buf).map_err(ClientError::Io)?;
        if n == 0 {
            break;
        }
        if lifecycle::shutdown_requested() {
            tracing::warn!("Process interrupted. Cancelling...");
            let _ = send_cancel(stream);
            return Err(ClientError::TransferFailed);
        }
        send_message(stream, MessageType::Data, &buf[..n])?;
        bytes_sent += n as u64;
        on_progress(Progress { bytes_sent, total_bytes });
    }

    send_message(stream, MessageType::End, &[0x00])
}

/// Sends a CANCEL frame, for a caller unwinding after a signal mid-upload.
/// Valid only once a START has already succeeded on `stream`.
pub fn send_cancel(stream: &mut TcpStream) -> Result<(), ClientError> {
    send_message(stream, MessageType::Cancel, &[0x00])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Response;
    use std::io::Write;
    use std::net::TcpListener;

    /// A server stub that acknowledges every frame with `response` and
    /// records the raw bytes it decoded, just enough to exercise
    /// `send_file`'s framing without pulling in the full dispatcher.
    fn echo_server(listener: TcpListener, response: Response) -> std::thread::JoinHandle<Vec<Vec<u8>>> {
        std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut frames = Vec::new();
            loop {
                let mut type_buf = [0u8; 6];
                if sock.read_exact(&mut type_buf).is_err() {
                    break;
                }
                let mut len_buf = [0u8; 8];
                sock.read_exact(&mut len_buf).unwrap();
                let len = u64::from_be_bytes(len_buf) as usize;
                let mut payload = vec![0u8; len];
                sock.read_exact(&mut payload).unwrap();
                sock.write_all(&[response.byte()]).unwrap();
                let is_end = type_buf == MessageType::End.literal();
                frames.push(payload);
                if is_end {
                    break;
                }
            }
            frames
        })
    }

    #[test]
    fn send_file_frames_start_data_end_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = echo_server(listener, Response::Success);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        std::fs::write(&path, b"abcdefghij").unwrap();

        let mut stream = TcpStream::connect(addr).unwrap();
        let mut progress_calls = 0;
        send_file(&mut stream, &path, 4, |_| progress_calls += 1).unwrap();

        let frames = handle.join().unwrap();
        assert_eq!(frames.len(), 5); // START, DATA(4), DATA(4), DATA(2), END
        assert!(std::str::from_utf8(&frames[0]).unwrap().starts_with("payload.bin\t10"));
        assert_eq!(progress_calls, 3);
    }

    #[test]
    fn send_file_surfaces_file_already_in_flight() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _handle = echo_server(listener, Response::FileAlreadyInFlight);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.bin");
        std::fs::write(&path, b"x").unwrap();

        let mut stream = TcpStream::connect(addr).unwrap();
        let result = send_file(&mut stream, &path, 1024, |_| {});
        assert!(matches!(result, Err(ClientError::FileAlreadyTransferring)));
    }
}
