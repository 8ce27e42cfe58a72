//! Length-prefixed binary RPC framing, carried inside WebSocket binary
//! frames (see DESIGN.md's "RPC framing transport choice").
//!
//! Each frame: `flags: u8` then `length: u32` (big-endian) then `length`
//! bytes of JSON payload. `flags` is reserved for future compression/
//! encoding negotiation; today only `0x00` is emitted and accepted.

use anyhow::{bail, Result};
use serde::{de::DeserializeOwned, Serialize};

pub const HEADER_LEN: usize = 5;
/// Whole-request cap (spec.md §4.1 "the whole RPC request is capped at 64 MiB").
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(value)?;
    if payload.len() as u64 > MAX_FRAME_LEN as u64 {
        bail!("encoded frame of {} bytes exceeds the {} byte cap", payload.len(), MAX_FRAME_LEN);
    }
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(0u8); // flags
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T> {
    if frame.len() < HEADER_LEN {
        bail!("frame shorter than the {}-byte header", HEADER_LEN);
    }
    let len = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
    if len > MAX_FRAME_LEN {
        bail!("declared frame length {} exceeds the {} byte cap", len, MAX_FRAME_LEN);
    }
    let body = &frame[HEADER_LEN..];
    if body.len() != len as usize {
        bail!("frame header declared {} bytes but payload was {}", len, body.len());
    }
    Ok(serde_json::from_slice(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_a_value() {
        let value = json!({"hello": "world", "n": 3});
        let frame = encode(&value).unwrap();
        assert_eq!(frame.len(), HEADER_LEN + serde_json::to_vec(&value).unwrap().len());
        let decoded: serde_json::Value = decode(&frame).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn rejects_short_frame() {
        assert!(decode::<serde_json::Value>(&[0u8; 3]).is_err());
    }

    #[test]
    fn rejects_length_mismatch() {
        let mut frame = encode(&json!({"a": 1})).unwrap();
        frame.push(0xFF); // trailing garbage byte the header doesn't account for
        assert!(decode::<serde_json::Value>(&frame).is_err());
    }
}
