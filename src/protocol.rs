//! Hello protocol wire format.
//!
//! A datagram payload is plain UTF-8 text with no header or framing:
//!
//! ```text
//! Request:  <prefix><lane>_<seq>
//! Response: Hello, <request>
//!
//! Example:
//! Request:  p0_2
//! Response: Hello, p0_2
//! ```
//!
//! A reply is accepted for a request iff the reply text contains the exact
//! request text. Both engines (blocking and reactor) share these helpers so
//! the text sent and the text expected back are always built identically.

use bytes::Bytes;
use std::borrow::Cow;

/// Largest payload a single UDP datagram can carry over IPv4.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Fixed prefix the servers put in front of every request they answer.
const REPLY_PREFIX: &str = "Hello, ";

/// Build the request text for `(lane, seq)`.
///
/// Deterministic: the client calls this once to build the outgoing payload
/// and again to build the substring it expects in the reply.
pub fn request(prefix: &str, lane: usize, seq: usize) -> String {
    format!("{prefix}{lane}_{seq}")
}

/// Server-side transform of a received request.
pub fn reply(request: &str) -> String {
    let mut out = String::with_capacity(REPLY_PREFIX.len() + request.len());
    out.push_str(REPLY_PREFIX);
    out.push_str(request);
    out
}

/// Whether `reply` acknowledges `request`.
pub fn is_reply_to(reply: &str, request: &str) -> bool {
    reply.contains(request)
}

/// Encode text into an owned datagram payload.
pub fn encode(text: &str) -> Bytes {
    Bytes::copy_from_slice(text.as_bytes())
}

/// Decode a received datagram payload.
///
/// Invalid UTF-8 sequences are replaced rather than rejected, so a corrupt
/// reply simply fails to match.
pub fn decode(payload: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(payload)
}

/// Size of the receive buffer to allocate for a socket whose kernel buffer
/// is `socket_buffer` bytes.
pub fn datagram_capacity(socket_buffer: usize) -> usize {
    socket_buffer.clamp(1, MAX_DATAGRAM_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_request_format() {
        assert_eq!(request("p", 0, 0), "p0_0");
        assert_eq!(request("hello ", 12, 345), "hello 12_345");
        assert_eq!(request("", 3, 7), "3_7");
    }

    #[test]
    fn test_request_is_deterministic() {
        for lane in 0..4 {
            for seq in 0..4 {
                assert_eq!(request("x", lane, seq), request("x", lane, seq));
            }
        }
    }

    #[test]
    fn test_request_is_injective_for_fixed_prefix() {
        let mut seen = HashSet::new();
        for lane in 0..50 {
            for seq in 0..50 {
                assert!(
                    seen.insert(request("pre", lane, seq)),
                    "duplicate request text for lane {lane} seq {seq}"
                );
            }
        }
    }

    #[test]
    fn test_reply_wraps_request() {
        assert_eq!(reply("p0_1"), "Hello, p0_1");
        assert!(is_reply_to(&reply("p0_1"), "p0_1"));
    }

    #[test]
    fn test_matching_requires_full_request_text() {
        // partial request text
        assert!(!is_reply_to("Hello, p0_", "p0_1"));
        // another lane
        assert!(!is_reply_to("Hello, p1_1", "p0_1"));
        // another sequence number
        assert!(!is_reply_to("Hello, p0_0", "p0_1"));
        // extra wrapping is fine
        assert!(is_reply_to("<<Hello, p0_1!>>", "p0_1"));
    }

    #[test]
    fn test_stale_reply_never_matches_later_sequence() {
        let stale = reply(&request("p", 2, 9));
        for seq in 10..20 {
            assert!(!is_reply_to(&stale, &request("p", 2, seq)));
        }
    }

    #[test]
    fn test_codec_utf8() {
        let text = "привет_0_0 ✓";
        let encoded = encode(text);
        assert_eq!(encoded.len(), text.len());
        assert_eq!(decode(&encoded), text);
    }

    #[test]
    fn test_decode_lossy() {
        let decoded = decode(&[b'p', 0xff, b'0']);
        assert_eq!(decoded, "p\u{fffd}0");
    }

    #[test]
    fn test_datagram_capacity() {
        assert_eq!(datagram_capacity(0), 1);
        assert_eq!(datagram_capacity(1500), 1500);
        assert_eq!(datagram_capacity(212_992), MAX_DATAGRAM_SIZE);
    }
}
