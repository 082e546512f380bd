use std::io;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tracing::{debug, error, info};

use crate::circuit::{Circuit, CircuitSnapshot};
use crate::config::MessageConfig;
use crate::error::ProtocolError;
use crate::host::Host;
use crate::throttle::ThrottleCategory;

/// Result of a full timeout sweep over the table.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Reliable packets given up on across all circuits.
    pub gave_up: u32,
    /// Circuits removed because their peer went silent.
    pub reaped: usize,
}

/// All circuits, keyed by peer host. Circuits appear on first traffic in
///  either direction and disappear when the sweep declares them dead. The
///  owning system serializes access with a single mutex, so the table itself
///  needs no interior locking.
pub struct CircuitTable {
    circuits: FxHashMap<Host, Circuit>,
    max_circuits: usize,
}

impl CircuitTable {
    pub fn new(max_circuits: usize) -> CircuitTable {
        CircuitTable {
            circuits: FxHashMap::default(),
            max_circuits,
        }
    }

    pub fn find(&self, host: Host) -> Option<&Circuit> {
        self.circuits.get(&host)
    }

    pub fn find_mut(&mut self, host: Host) -> Option<&mut Circuit> {
        self.circuits.get_mut(&host)
    }

    pub fn get_or_create(&mut self, host: Host, now: Instant) -> Result<&mut Circuit, ProtocolError> {
        if !self.circuits.contains_key(&host) {
            if self.circuits.len() >= self.max_circuits {
                return Err(ProtocolError::CapacityExceeded {
                    max: self.max_circuits,
                });
            }
            debug!(?host, "opening circuit");
            self.circuits.insert(host, Circuit::new(host, now));
        }

        Ok(self
            .circuits
            .get_mut(&host)
            .expect("circuit was just checked or inserted"))
    }

    pub fn remove(&mut self, host: Host) -> Option<Circuit> {
        let removed = self.circuits.remove(&host);
        if removed.is_some() {
            info!(?host, "removed circuit");
        }
        removed
    }

    /// Sweeps every circuit for packet timeouts, refills its throttles, and
    ///  reaps circuits that died.
    pub fn sweep_timeouts(&mut self, now: Instant, config: &MessageConfig) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();

        for circuit in self.circuits.values_mut() {
            outcome.gave_up += circuit.sweep_timeouts(
                now,
                config.resend_timeout,
                config.retry_limit,
                config.circuit_idle_timeout,
            );
            circuit.throttles().update_average(now);
            circuit.throttles().dynamic_adjust();
        }

        let dead: Vec<Host> = self
            .circuits
            .values()
            .filter(|circuit| !circuit.is_alive())
            .map(|circuit| circuit.host())
            .collect();
        for host in dead {
            info!(?host, "reaping dead circuit");
            self.circuits.remove(&host);
            outcome.reaped += 1;
        }

        outcome
    }

    /// Drains every circuit's retry queue through `send`, spending from the
    ///  resend throttle. A successfully retransmitted packet goes back into
    ///  the unacked map with a fresh send stamp and its original sequence
    ///  number; on a send failure it keeps the stale stamp, so the next sweep
    ///  promotes it again until the retry budget runs out.
    pub fn process_retries(
        &mut self,
        now: Instant,
        mut send: impl FnMut(Host, &[u8]) -> io::Result<usize>,
    ) {
        for circuit in self.circuits.values_mut() {
            let host = circuit.host();
            while let Some(mut buffer) = circuit.next_retry() {
                let len = buffer.data().len();
                if circuit.throttles().check_overflow(ThrottleCategory::Resend, len) {
                    // out of resend bandwidth; retry again next tick
                    circuit.push_retry_front(buffer);
                    break;
                }

                match send(host, buffer.data()) {
                    Ok(_) => {
                        debug!(
                            ?host,
                            sequence = buffer.sequence(),
                            retry = buffer.retry_count(),
                            "retransmitting"
                        );
                        buffer.mark_sent(now);
                        circuit.install_unacked(buffer);
                    }
                    Err(e) => {
                        error!(?host, sequence = buffer.sequence(), "retransmit failed: {}", e);
                        circuit.install_unacked(buffer);
                    }
                }
            }
        }
    }

    pub fn circuits_mut(&mut self) -> impl Iterator<Item = &mut Circuit> {
        self.circuits.values_mut()
    }

    pub fn len(&self) -> usize {
        self.circuits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.circuits.is_empty()
    }

    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        self.circuits.values().map(Circuit::snapshot).collect()
    }

    /// Alive-circuit count and their mean averaged RTT.
    pub fn aggregate_rtt(&self) -> (usize, Option<Duration>) {
        let alive = self.circuits.values().filter(|c| c.is_alive()).count();

        let rtts: Vec<Duration> = self
            .circuits
            .values()
            .filter(|c| c.is_alive())
            .filter_map(Circuit::rtt_averaged)
            .collect();
        let mean = if rtts.is_empty() {
            None
        } else {
            Some(rtts.iter().sum::<Duration>() / rtts.len() as u32)
        };

        (alive, mean)
    }
}
