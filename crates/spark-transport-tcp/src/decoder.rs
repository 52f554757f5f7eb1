use bytes::{Buf, Bytes, BytesMut};

use crate::response_task::RawResponse;

/// Per-connection framing state. The decoder produces framed response
/// envelopes `{bytes, request_id}` from the raw byte stream; wire-format
/// design beyond this message boundary is out of scope for this crate —
/// [`FrameDecoder`] is the pluggable seam, one fresh instance per stream
/// (decoders hold per-stream framing state, unlike the watchdog/handler,
/// which are sharable singletons).
pub trait FrameDecoder: Send {
    /// Attempt to pull one complete frame out of `buf`, consuming the bytes
    /// it used. Returns `None` when `buf` doesn't yet hold a full frame;
    /// the caller is expected to read more bytes and try again.
    fn decode(&mut self, buf: &mut BytesMut) -> Option<RawResponse>;
}

/// `[len: u32 BE][request_id: u64 BE][payload; len bytes]`.
///
/// A minimal concrete framing so this crate's end-to-end tests (and the
/// read loop) have something real to decode against; production use is
/// expected to supply its own [`FrameDecoder`] matching the wire protocol
/// the remote service actually speaks.
#[derive(Default)]
pub struct LengthPrefixedDecoder;

const HEADER_LEN: usize = 4 + 8;

impl FrameDecoder for LengthPrefixedDecoder {
    fn decode(&mut self, buf: &mut BytesMut) -> Option<RawResponse> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        let payload_len = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
        if buf.len() < HEADER_LEN + payload_len {
            return None;
        }
        buf.advance(4);
        let request_id = u64::from_be_bytes(buf[0..8].try_into().unwrap());
        buf.advance(8);
        let payload = buf.split_to(payload_len).freeze();
        Some(RawResponse {
            request_id,
            bytes: payload,
        })
    }
}

/// Encodes a frame on the wire the same way [`LengthPrefixedDecoder`]
/// expects to read it back; used by tests driving a fake remote endpoint.
pub fn encode_frame(request_id: u64, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&request_id.to_be_bytes());
    out.extend_from_slice(payload);
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_one_frame_at_a_time() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_frame(1, b"hello"));
        buf.extend_from_slice(&encode_frame(2, b"world"));

        let mut decoder = LengthPrefixedDecoder;
        let first = decoder.decode(&mut buf).unwrap();
        assert_eq!(first.request_id, 1);
        assert_eq!(&first.bytes[..], b"hello");

        let second = decoder.decode(&mut buf).unwrap();
        assert_eq!(second.request_id, 2);
        assert_eq!(&second.bytes[..], b"world");

        assert!(decoder.decode(&mut buf).is_none());
    }

    #[test]
    fn returns_none_on_partial_frame() {
        let full = encode_frame(7, b"partial-payload");
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&full[..full.len() - 3]);

        let mut decoder = LengthPrefixedDecoder;
        assert!(decoder.decode(&mut buf).is_none());
        assert_eq!(buf.len(), full.len() - 3);
    }
}
