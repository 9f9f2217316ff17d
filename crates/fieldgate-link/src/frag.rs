//! Fragmentation and reassembly.
//!
//! Outbound messages are newline-terminated UTF-8 JSON split into chunks
//! the client can swallow; a short delay separates fragments. Payloads of
//! 5 KB and more switch to smaller chunks and a longer delay, which keeps
//! constrained clients from dropping notifications mid-transfer. The
//! negotiated MTU only ever caps the chunk size, it never raises it.
//!
//! Inbound bytes accumulate per session until the `\n` terminator.

use crate::error::{LinkError, Result};

/// Default outbound chunk size.
pub const CHUNK_SIZE: usize = 244;

/// Delay between fragments.
pub const FRAGMENT_DELAY_MS: u64 = 10;

/// Payloads at or above this size use the adaptive plan.
pub const ADAPTIVE_THRESHOLD: usize = 5 * 1024;

/// Adaptive chunk size and delay.
pub const ADAPTIVE_CHUNK_SIZE: usize = 100;
pub const ADAPTIVE_DELAY_MS: u64 = 20;

/// Hard cap on one outbound response.
pub const MAX_RESPONSE_SIZE_BYTES: usize = 200_000;

/// Cap on one inbound (reassembled) message.
pub const MAX_INBOUND_BYTES: usize = 64 * 1024;

/// Per-fragment protocol overhead inside the MTU.
pub const MTU_HEADER_OVERHEAD: usize = 3;

/// Chunk size and pacing for one outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentPlan {
    pub chunk_size: usize,
    pub delay_ms: u64,
}

/// Choose the fragmentation plan for a payload.
///
/// `negotiated_mtu` caps the chunk at `mtu - header overhead`.
pub fn plan_fragments(payload_len: usize, negotiated_mtu: Option<u16>) -> FragmentPlan {
    let (mut chunk_size, delay_ms) = if payload_len >= ADAPTIVE_THRESHOLD {
        (ADAPTIVE_CHUNK_SIZE, ADAPTIVE_DELAY_MS)
    } else {
        (CHUNK_SIZE, FRAGMENT_DELAY_MS)
    };
    if let Some(mtu) = negotiated_mtu {
        let cap = (mtu as usize).saturating_sub(MTU_HEADER_OVERHEAD).max(1);
        chunk_size = chunk_size.min(cap);
    }
    FragmentPlan {
        chunk_size,
        delay_ms,
    }
}

/// Enforce the outbound cap.
pub fn check_response_size(payload_len: usize) -> Result<()> {
    if payload_len > MAX_RESPONSE_SIZE_BYTES {
        return Err(LinkError::FragOversize(payload_len, MAX_RESPONSE_SIZE_BYTES));
    }
    Ok(())
}

/// Split a payload into fragments according to a plan.
pub fn fragment<'a>(payload: &'a [u8], plan: &FragmentPlan) -> Vec<&'a [u8]> {
    payload.chunks(plan.chunk_size.max(1)).collect()
}

/// Per-session inbound reassembly buffer.
///
/// Feeding raw chunks yields zero or more complete messages, each a line
/// without its terminator.
#[derive(Debug, Default)]
pub struct Reassembler {
    buffer: Vec<u8>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulate a chunk; return every message completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.buffer.extend_from_slice(chunk);
        let mut messages = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut message: Vec<u8> = self.buffer.drain(..=pos).collect();
            message.pop(); // terminator
            if !message.is_empty() {
                messages.push(message);
            }
        }
        if self.buffer.len() > MAX_INBOUND_BYTES {
            self.buffer.clear();
            return Err(LinkError::InboundOverflow(MAX_INBOUND_BYTES));
        }
        Ok(messages)
    }

    /// Drop any partial message (session reset).
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragments_cover_payload_exactly() {
        for len in [0usize, 1, 243, 244, 245, 1000, 4999, 5000, 200_000] {
            let payload = vec![0xABu8; len];
            let plan = plan_fragments(len, None);
            let fragments = fragment(&payload, &plan);
            let total: usize = fragments.iter().map(|f| f.len()).sum();
            assert_eq!(total, len, "len={}", len);
            for f in &fragments {
                assert!(f.len() <= plan.chunk_size);
            }
        }
    }

    #[test]
    fn test_default_plan() {
        let plan = plan_fragments(1000, None);
        assert_eq!(plan.chunk_size, CHUNK_SIZE);
        assert_eq!(plan.delay_ms, FRAGMENT_DELAY_MS);
    }

    #[test]
    fn test_adaptive_plan_for_large_payloads() {
        let plan = plan_fragments(ADAPTIVE_THRESHOLD, None);
        assert_eq!(plan.chunk_size, ADAPTIVE_CHUNK_SIZE);
        assert_eq!(plan.delay_ms, ADAPTIVE_DELAY_MS);
    }

    #[test]
    fn test_mtu_caps_chunk_size() {
        let plan = plan_fragments(1000, Some(100));
        assert_eq!(plan.chunk_size, 100 - MTU_HEADER_OVERHEAD);
        // A generous MTU never raises the chunk size.
        let plan = plan_fragments(1000, Some(512));
        assert_eq!(plan.chunk_size, CHUNK_SIZE);
    }

    #[test]
    fn test_response_cap_boundary() {
        assert!(check_response_size(MAX_RESPONSE_SIZE_BYTES).is_ok());
        assert!(matches!(
            check_response_size(MAX_RESPONSE_SIZE_BYTES + 1),
            Err(LinkError::FragOversize(_, _))
        ));
    }

    #[test]
    fn test_reassembly_across_chunks() {
        let mut reassembler = Reassembler::new();
        assert!(reassembler.feed(b"{\"op\":").unwrap().is_empty());
        let messages = reassembler.feed(b"\"read\"}\n{\"op\":\"x\"}\npartial").unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], b"{\"op\":\"read\"}");
        assert_eq!(messages[1], b"{\"op\":\"x\"}");
        assert_eq!(reassembler.pending_bytes(), 7);
    }

    #[test]
    fn test_empty_lines_skipped() {
        let mut reassembler = Reassembler::new();
        let messages = reassembler.feed(b"\n\na\n").unwrap();
        assert_eq!(messages, vec![b"a".to_vec()]);
    }

    #[test]
    fn test_inbound_overflow() {
        let mut reassembler = Reassembler::new();
        let big = vec![b'x'; MAX_INBOUND_BYTES + 1];
        assert!(reassembler.feed(&big).is_err());
        // Buffer was reset; the session can continue.
        assert_eq!(reassembler.pending_bytes(), 0);
    }
}
