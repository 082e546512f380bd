use std::time::Instant;

use bytes::Bytes;

/// An owned, fully encoded datagram held for possible retransmission.
///
/// A buffer is created when a reliable message is sent, lives in the
///  circuit's unacked map, moves to the retry queue when it times out, and is
///  destroyed on acknowledgment or when the retry budget is exhausted.
#[derive(Debug)]
pub struct PacketBuffer {
    data: Bytes,
    sequence: u32,
    sent_at: Instant,
    retry_count: u32,
}

impl PacketBuffer {
    pub fn new(sequence: u32, data: Bytes, now: Instant) -> PacketBuffer {
        PacketBuffer {
            data,
            sequence,
            sent_at: now,
            retry_count: 0,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn sent_at(&self) -> Instant {
        self.sent_at
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Re-stamps the send time; called when the buffer goes back on the wire
    ///  with its original sequence number.
    pub fn mark_sent(&mut self, now: Instant) {
        self.sent_at = now;
    }

    pub fn increment_retry(&mut self) {
        self.retry_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_retry_bookkeeping() {
        let t0 = Instant::now();
        let mut buffer = PacketBuffer::new(42, Bytes::from_static(b"datagram"), t0);

        assert_eq!(buffer.sequence(), 42);
        assert_eq!(buffer.retry_count(), 0);
        assert_eq!(buffer.sent_at(), t0);

        buffer.increment_retry();
        buffer.mark_sent(t0 + Duration::from_secs(5));

        assert_eq!(buffer.retry_count(), 1);
        assert_eq!(buffer.sent_at(), t0 + Duration::from_secs(5));
        assert_eq!(buffer.data(), b"datagram");
    }
}
