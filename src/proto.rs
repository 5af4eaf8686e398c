//! Wire protocol between the daemon and its client processes.
//!
//! Every message in either direction is a 16-bit big-endian length header
//! followed by exactly that many payload bytes. This module owns framing
//! (read/write over anything that implements `Read`/`Write`) and the
//! command-octet constants; APDU interpretation lives in [`crate::select`].

use std::io::{self, Read, Write};

use crate::error::ProtocolError;

/// Maximum payload length a 16-bit length header can express.
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

// client -> server
pub const GET_API_VERSION: u8 = 0x01;
pub const REGISTER_AID: u8 = 0x02;
pub const DISCONNECT: u8 = 0x03;

// server -> client
pub const POWER_UP: u8 = 0x04;
pub const POWER_DOWN: u8 = 0x05;

// server response status bytes
pub const EDNA_OK: u8 = 0x00;
pub const AID_EXISTS: u8 = 0x01;
pub const UNKNOWN_COMMAND: u8 = 0xFF;

/// The single byte the daemon and every client must agree on.
pub const API_VERSION: u8 = 0x00;

/// Write one framed message: `len_be16(payload) || payload`.
///
/// Retries on short writes and `Interrupted` errors so the full frame is
/// always moved or an error is returned — the source this is modelled on
/// explicitly lacked this and documented it as a bug (see spec.md §9).
pub fn write_frame<W: Write>(mut w: W, payload: &[u8]) -> Result<(), ProtocolError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }
    let len = payload.len() as u16;
    let header = len.to_be_bytes();
    write_all_retrying(&mut w, &header)?;
    write_all_retrying(&mut w, payload)?;
    Ok(())
}

/// Read one framed message, returning its payload.
///
/// Retries short and interrupted reads; returns [`ProtocolError::PeerClosed`]
/// if the peer closes before a complete frame (including the 2-byte header)
/// arrives.
pub fn read_frame<R: Read>(mut r: R) -> Result<Vec<u8>, ProtocolError> {
    let mut header = [0u8; 2];
    read_exact_retrying(&mut r, &mut header)?;
    let len = u16::from_be_bytes(header) as usize;
    let mut payload = vec![0u8; len];
    read_exact_retrying(&mut r, &mut payload)?;
    Ok(payload)
}

fn write_all_retrying<W: Write>(w: &mut W, mut buf: &[u8]) -> Result<(), ProtocolError> {
    while !buf.is_empty() {
        match w.write(buf) {
            Ok(0) => return Err(ProtocolError::PeerClosed),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ProtocolError::Io(e)),
        }
    }
    Ok(())
}

fn read_exact_retrying<R: Read>(r: &mut R, mut buf: &mut [u8]) -> Result<(), ProtocolError> {
    while !buf.is_empty() {
        match r.read(buf) {
            Ok(0) => return Err(ProtocolError::PeerClosed),
            Ok(n) => buf = &mut buf[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ProtocolError::Io(e)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trips_arbitrary_payloads() {
        for len in [0usize, 1, 2, 255, 256, 65535] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let mut buf = Vec::new();
            write_frame(&mut buf, &payload).unwrap();
            assert_eq!(buf.len(), payload.len() + 2);
            let decoded = read_frame(Cursor::new(buf)).unwrap();
            assert_eq!(decoded, payload);
        }
    }

    #[test]
    fn rejects_oversized_payload_at_encode_time() {
        let payload = vec![0u8; MAX_FRAME_LEN + 1];
        let mut buf = Vec::new();
        assert!(write_frame(&mut buf, &payload).is_err());
    }

    #[test]
    fn read_fails_on_truncated_header() {
        let buf = [0x00u8];
        assert!(read_frame(Cursor::new(buf)).is_err());
    }

    #[test]
    fn read_fails_on_truncated_payload() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&10u16.to_be_bytes());
        buf.extend_from_slice(&[1, 2, 3]); // short of the declared 10 bytes
        assert!(read_frame(Cursor::new(buf)).is_err());
    }
}
