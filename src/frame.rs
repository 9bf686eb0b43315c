//! Length-prefixed private-data frame: a 3-byte header (`u16` length, `u8`
//! status) in host byte order followed by `length` payload bytes.
//!
//! Host byte order matches the original protocol's same-architecture
//! contract (§9 Open Question in the spec this crate implements); this is
//! not a general-purpose wire format and makes no cross-endian claim.

use crate::{
    error::{Result, SockCmError},
    status::WireStatus,
};

/// Size of the `{length, status}` header in bytes.
pub const HDR_SIZE: usize = 3;

/// Writes `{length, status}` followed by `payload` into `buf`.
///
/// `buf` must be at least `HDR_SIZE + payload.len()` bytes. Fails with
/// [`SockCmError::BufferTooSmall`] if `payload.len()` exceeds `priv_data_cap`
/// without touching `buf`.
///
/// Returns the total number of bytes written (header + payload).
pub fn pack_outgoing(
    buf: &mut [u8],
    payload: &[u8],
    priv_data_cap: usize,
    status: WireStatus,
) -> Result<usize> {
    if payload.len() > priv_data_cap {
        return Err(SockCmError::BufferTooSmall);
    }

    let total = HDR_SIZE + payload.len();
    buf[0..2].copy_from_slice(&(payload.len() as u16).to_ne_bytes());
    buf[2] = status as u8;
    buf[HDR_SIZE..total].copy_from_slice(payload);
    Ok(total)
}

/// Decoded header: payload length and raw wire status byte.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub length: u16,
    pub status: u8,
}

/// Decodes the 3-byte header at the start of `buf`. Panics if `buf` is
/// shorter than [`HDR_SIZE`] — callers must only call this once
/// `offset >= HDR_SIZE` bytes have been read into the buffer.
pub fn decode_header(buf: &[u8]) -> Header {
    let length = u16::from_ne_bytes([buf[0], buf[1]]);
    Header { length, status: buf[2] }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_then_decode_roundtrip() {
        let mut buf = [0u8; HDR_SIZE + 5];
        let n = pack_outgoing(&mut buf, b"hello", 64, WireStatus::Ok).unwrap();
        assert_eq!(n, HDR_SIZE + 5);
        let hdr = decode_header(&buf);
        assert_eq!(hdr.length, 5);
        assert_eq!(hdr.status, WireStatus::Ok as u8);
        assert_eq!(&buf[HDR_SIZE..n], b"hello");
    }

    #[test]
    fn pack_zero_length_notify_frame() {
        let mut buf = [0u8; HDR_SIZE];
        let n = pack_outgoing(&mut buf, b"", 64, WireStatus::Ok).unwrap();
        assert_eq!(n, HDR_SIZE);
        let hdr = decode_header(&buf);
        assert_eq!(hdr.length, 0);
    }

    #[test]
    fn pack_rejects_oversized_payload() {
        let mut buf = [0u8; HDR_SIZE + 2];
        let err = pack_outgoing(&mut buf, &[1, 2, 3], 2, WireStatus::Ok).unwrap_err();
        assert!(matches!(err, SockCmError::BufferTooSmall));
    }

    #[test]
    fn reject_frame_has_zero_length_payload() {
        let mut buf = [0u8; HDR_SIZE];
        pack_outgoing(&mut buf, b"", 64, WireStatus::Rejected).unwrap();
        let hdr = decode_header(&buf);
        assert_eq!(hdr.status, WireStatus::Rejected as u8);
        assert_eq!(hdr.length, 0);
    }
}
