use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::host::Host;
use crate::packet_buffer::PacketBuffer;
use crate::throttle::ThrottleGroup;

/// Where an inbound sequence number falls relative to what the circuit
///  expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Exactly the expected sequence.
    InOrder,
    /// Ahead of the expected sequence; the gap is counted as lost.
    InOrderAfterGap { missed: u32 },
    /// Behind the expected sequence; already seen or delivered late.
    DuplicateOrReordered,
}

impl Classification {
    /// True for packets seen for the first time, i.e. those that should reach
    ///  handlers.
    pub fn is_first_delivery(&self) -> bool {
        !matches!(self, Classification::DuplicateOrReordered)
    }
}

/// Point-in-time view of one circuit, safe to hand out without holding the
///  table lock.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitSnapshot {
    pub host: Host,
    pub alive: bool,
    pub blocked: bool,
    pub packets_out: u32,
    pub packets_in: u32,
    pub packets_lost: u32,
    pub loss_percentage: u32,
    pub rtt_last: Option<Duration>,
    pub rtt_averaged: Option<Duration>,
    pub unacked_count: usize,
    pub retry_queue_len: usize,
}

const RTT_SMOOTHING_NEW: f32 = 0.05;
const RTT_SMOOTHING_OLD: f32 = 0.95;

/// Per-peer reliability state: sequence numbering in both directions, the
///  unacked table, the retry queue, RTT tracking and liveness.
pub struct Circuit {
    host: Host,
    alive: bool,
    blocked: bool,

    next_outbound: u32,
    expected_inbound: u32,

    packets_out: u32,
    packets_in: u32,
    packets_lost: u32,

    rtt_last: Option<Duration>,
    rtt_averaged: Option<Duration>,

    unacked: BTreeMap<u32, PacketBuffer>,
    oldest_unacked: Option<u32>,
    retry_queue: VecDeque<PacketBuffer>,

    /// Sequences of inbound reliable packets awaiting a piggyback ride on the
    ///  next outbound datagram.
    pending_acks: Vec<u32>,

    last_received: Instant,
    last_sent: Instant,

    throttles: ThrottleGroup,
}

impl Circuit {
    pub fn new(host: Host, now: Instant) -> Circuit {
        Circuit {
            host,
            alive: true,
            blocked: false,
            next_outbound: 0,
            expected_inbound: 0,
            packets_out: 0,
            packets_in: 0,
            packets_lost: 0,
            rtt_last: None,
            rtt_averaged: None,
            unacked: BTreeMap::new(),
            oldest_unacked: None,
            retry_queue: VecDeque::new(),
            pending_acks: Vec::new(),
            last_received: now,
            last_sent: now,
            throttles: ThrottleGroup::with_default_rates(now),
        }
    }

    pub fn host(&self) -> Host {
        self.host
    }

    /// Assigns the next outbound sequence number, starting at 0.
    pub fn next_outbound_sequence(&mut self, now: Instant) -> u32 {
        self.last_sent = now;
        self.packets_out += 1;
        let sequence = self.next_outbound;
        self.next_outbound = self.next_outbound.wrapping_add(1);
        sequence
    }

    /// Classifies an inbound sequence number and updates the loss estimate.
    ///  `is_resent` marks packets the peer flagged as retransmissions, where a
    ///  duplicate is expected rather than noteworthy.
    pub fn record_inbound(&mut self, sequence: u32, is_resent: bool, now: Instant) -> Classification {
        self.last_received = now;
        self.packets_in += 1;

        if sequence == self.expected_inbound {
            self.expected_inbound = self.expected_inbound.wrapping_add(1);
            Classification::InOrder
        } else if sequence > self.expected_inbound {
            let missed = sequence - self.expected_inbound;
            self.packets_lost += missed;
            self.expected_inbound = sequence.wrapping_add(1);
            debug!(host = ?self.host, missed, "inbound sequence gap");
            Classification::InOrderAfterGap { missed }
        } else {
            if !is_resent {
                trace!(host = ?self.host, sequence, "duplicate or reordered packet");
            }
            Classification::DuplicateOrReordered
        }
    }

    /// Lost packets as a percentage of everything that should have arrived.
    pub fn loss_percentage(&self) -> u32 {
        let denominator = self.packets_in + self.packets_lost;
        if denominator == 0 {
            0
        } else {
            self.packets_lost * 100 / denominator
        }
    }

    /// Takes ownership of a sent reliable packet until it is acknowledged.
    pub fn install_unacked(&mut self, buffer: PacketBuffer) {
        let sequence = buffer.sequence();
        self.unacked.insert(sequence, buffer);
        self.refresh_oldest_unacked();
    }

    /// Removes the acked packet and feeds its round trip into the RTT
    ///  estimate. Unknown sequences (already acked, or given up on) are
    ///  ignored.
    pub fn acknowledge(&mut self, sequence: u32, now: Instant) -> bool {
        let Some(buffer) = self.unacked.remove(&sequence) else {
            return false;
        };

        let rtt = now.saturating_duration_since(buffer.sent_at());
        self.rtt_last = Some(rtt);
        self.rtt_averaged = Some(match self.rtt_averaged {
            None => rtt,
            Some(average) => Duration::from_secs_f32(
                average.as_secs_f32() * RTT_SMOOTHING_OLD + rtt.as_secs_f32() * RTT_SMOOTHING_NEW,
            ),
        });

        self.refresh_oldest_unacked();
        trace!(host = ?self.host, sequence, ?rtt, "acknowledged");
        true
    }

    /// Promotes timed-out packets to the retry queue, gives up on those past
    ///  the retry budget, and declares the circuit dead when the peer has been
    ///  silent too long. Returns the number of packets given up on.
    pub fn sweep_timeouts(
        &mut self,
        now: Instant,
        resend_timeout: Duration,
        retry_limit: u32,
        idle_timeout: Duration,
    ) -> u32 {
        let timed_out: Vec<u32> = self
            .unacked
            .iter()
            .filter(|(_, buffer)| now.saturating_duration_since(buffer.sent_at()) > resend_timeout)
            .map(|(&sequence, _)| sequence)
            .collect();

        let mut gave_up = 0;
        for sequence in timed_out {
            let mut buffer = self
                .unacked
                .remove(&sequence)
                .expect("sequence was collected from the map above");
            buffer.increment_retry();

            if buffer.retry_count() < retry_limit {
                trace!(host = ?self.host, sequence, retry = buffer.retry_count(), "queueing resend");
                self.retry_queue.push_back(buffer);
            } else {
                warn!(host = ?self.host, sequence, "giving up on packet");
                self.packets_lost += 1;
                gave_up += 1;
            }
        }
        self.refresh_oldest_unacked();

        if now.saturating_duration_since(self.last_received) > idle_timeout {
            warn!(host = ?self.host, "circuit timed out");
            self.alive = false;
        }

        gave_up
    }

    /// Next packet awaiting retransmission, in FIFO order.
    pub fn next_retry(&mut self) -> Option<PacketBuffer> {
        self.retry_queue.pop_front()
    }

    /// Returns a packet to the head of the retry queue, keeping its turn when
    ///  a retransmission could not go out this tick.
    pub fn push_retry_front(&mut self, buffer: PacketBuffer) {
        self.retry_queue.push_front(buffer);
    }

    pub fn has_retries(&self) -> bool {
        !self.retry_queue.is_empty()
    }

    /// Queues an inbound reliable sequence for piggybacking on the next
    ///  outbound datagram.
    pub fn enqueue_ack(&mut self, sequence: u32) {
        if !self.pending_acks.contains(&sequence) {
            self.pending_acks.push(sequence);
        }
    }

    /// Hands out up to `max` pending acks for the trailer of an outbound
    ///  datagram.
    pub fn take_pending_acks(&mut self, max: usize) -> Vec<u32> {
        let take = self.pending_acks.len().min(max);
        self.pending_acks.drain(..take).collect()
    }

    pub fn pending_ack_count(&self) -> usize {
        self.pending_acks.len()
    }

    fn refresh_oldest_unacked(&mut self) {
        self.oldest_unacked = self.unacked.keys().next().copied();
    }

    pub fn oldest_unacked(&self) -> Option<u32> {
        self.oldest_unacked
    }

    pub fn unacked_count(&self) -> usize {
        self.unacked.len()
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    pub fn set_blocked(&mut self, blocked: bool) {
        self.blocked = blocked;
    }

    pub fn packets_out(&self) -> u32 {
        self.packets_out
    }

    pub fn packets_in(&self) -> u32 {
        self.packets_in
    }

    pub fn packets_lost(&self) -> u32 {
        self.packets_lost
    }

    pub fn rtt_last(&self) -> Option<Duration> {
        self.rtt_last
    }

    pub fn rtt_averaged(&self) -> Option<Duration> {
        self.rtt_averaged
    }

    pub fn last_received(&self) -> Instant {
        self.last_received
    }

    pub fn last_sent(&self) -> Instant {
        self.last_sent
    }

    pub fn throttles(&mut self) -> &mut ThrottleGroup {
        &mut self.throttles
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            host: self.host,
            alive: self.alive,
            blocked: self.blocked,
            packets_out: self.packets_out,
            packets_in: self.packets_in,
            packets_lost: self.packets_lost,
            loss_percentage: self.loss_percentage(),
            rtt_last: self.rtt_last,
            rtt_averaged: self.rtt_averaged,
            unacked_count: self.unacked.len(),
            retry_queue_len: self.retry_queue.len(),
        }
    }
}
