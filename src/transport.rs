//! Client-side connection setup and single-frame request/response exchange
//! (C2, spec §4.2, §6.2).
//!
//! Grounded in `original_source/src/Client.py`'s `validate_ip_port`,
//! `connect_to_server`, and `send_message`: three retries, a short pause
//! between attempts, and a per-attempt connect timeout, then one
//! blocking frame round trip per call.

use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::time::Duration;

use crate::codec::{encode_frame, MessageType, Response, MAX_PAYLOAD_LEN};
use crate::error::ClientError;

const CONNECT_ATTEMPTS: u32 = 3;
const RETRY_PAUSE: Duration = Duration::from_millis(100);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Validates a dotted-quad IP and a 1..=65535 port, matching the source's
/// `validate_ip_port` (a bare `int(port)` plus `ipaddress.ip_address`, no
/// hostname resolution).
pub fn validate_ip_port(ip: &str, port: u16) -> Result<SocketAddr, ClientError> {
    let addr: IpAddr = ip
        .parse()
        .map_err(|_| ClientError::Validation(format!("{ip:?} is not a valid IP address")))?;
    if port == 0 {
        return Err(ClientError::Validation("port must be between 1 and 65535".into()));
    }
    Ok(SocketAddr::new(addr, port))
}

/// Connects with up to three attempts, pausing briefly between failures,
/// each attempt bounded by a connect timeout (spec §4.2).
pub fn connect_with_retry(addr: SocketAddr) -> Result<TcpStream, ClientError> {
    let mut last_err = None;
    for attempt in 1..=CONNECT_ATTEMPTS {
        match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(stream) => {
                stream.set_nodelay(true).map_err(ClientError::Io)?;
                return Ok(stream);
            }
            Err(e) => {
                tracing::warn!(%addr, attempt, error = %e, "connection attempt failed");
                last_err = Some(e);
                if attempt < CONNECT_ATTEMPTS {
                    std::thread::sleep(RETRY_PAUSE);
                }
            }
        }
    }
    tracing::error!(%addr, attempts = CONNECT_ATTEMPTS, "could not connect to server");
    let _ = last_err;
    Err(ClientError::ConnectionFailed)
}

/// Sends one complete frame and reads back the single response byte,
/// mapping it to the corresponding `ClientError` (spec §4.2, §7).
pub fn send_message(stream: &mut TcpStream, msg_type: MessageType, payload: &[u8]) -> Result<(), ClientError> {
    if payload.len() as u64 > MAX_PAYLOAD_LEN {
        return Err(ClientError::Validation(format!(
            "payload of {} bytes exceeds the {MAX_PAYLOAD_LEN}-byte ceiling",
            payload.len()
        )));
    }
    stream
        .write_all(&encode_frame(msg_type, payload))
        .map_err(|_| ClientError::ConnectionFailed)?;

    let mut response_byte = [0u8; 1];
    stream
        .read_exact(&mut response_byte)
        .map_err(|_| ClientError::ConnectionFailed)?;

    match Response::from_byte(response_byte[0]) {
        Some(Response::Success) => Ok(()),
        Some(Response::FileAlreadyInFlight) => Err(ClientError::FileAlreadyTransferring),
        Some(Response::Error) => Err(ClientError::TransferFailed),
        None => Err(ClientError::ConnectionFailed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_ip_port_accepts_dotted_quad_and_valid_port() {
        let addr = validate_ip_port("127.0.0.1", 12345).unwrap();
        assert_eq!(addr.to_string(), "127.0.0.1:12345");
    }

    #[test]
    fn validate_ip_port_rejects_a_hostname() {
        assert!(validate_ip_port("localhost", 12345).is_err());
    }

    #[test]
    fn validate_ip_port_rejects_port_zero() {
        assert!(validate_ip_port("127.0.0.1", 0).is_err());
    }

    #[test]
    fn send_message_rejects_oversized_payload_before_writing_anything() {
        // Connect to a throwaway local listener; the oversized check must
        // short-circuit before any bytes reach the wire.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut stream = TcpStream::connect(addr).unwrap();
        let oversized = vec![0u8; (MAX_PAYLOAD_LEN + 1) as usize];
        let result = send_message(&mut stream, MessageType::Data, &oversized);
        assert!(matches!(result, Err(ClientError::Validation(_))));
    }
}
