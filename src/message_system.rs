use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::builder::MessageBuilder;
use crate::circuit::{Circuit, CircuitSnapshot};
use crate::circuit_table::CircuitTable;
use crate::config::MessageConfig;
use crate::decoder::{decode_payload, DecodedMessage};
use crate::error::ProtocolError;
use crate::host::Host;
use crate::packet_buffer::PacketBuffer;
use crate::packet_header::{append_ack_trailer, split_ack_trailer, PacketFlags, PacketHeader};
use crate::template::TemplateRegistry;
use crate::throttle::ThrottleCategory;
use crate::transport::Transport;
use crate::value::Value;
use crate::zero_coding::{zero_decode, zero_encode};

/// Sequence numbers fit the ack trailer's 1-byte count.
const MAX_ACKS_PER_DATAGRAM: usize = 255;

/// A decoded inbound message as handed to handlers.
pub struct ReceivedMessage {
    pub sender: Host,
    pub sequence: u32,
    pub message: DecodedMessage,
}

/// Token returned by `register_handler`, for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

type HandlerFn = Box<dyn FnMut(&ReceivedMessage) -> anyhow::Result<()> + Send>;

#[derive(Default)]
struct HandlerRegistry {
    handlers: FxHashMap<String, Vec<(HandlerId, HandlerFn)>>,
    next_id: u64,
}

/// Monotonic global counters, updated with relaxed atomics so they can be
///  read without the table lock.
#[derive(Default)]
struct Counters {
    packets_in: AtomicU64,
    packets_out: AtomicU64,
    packets_lost: AtomicU64,
    packets_dropped: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

/// Snapshot of the system-wide statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageStats {
    pub packets_in: u64,
    pub packets_out: u64,
    /// Estimated from inbound sequence gaps plus reliable packets given up on.
    pub packets_lost: u64,
    /// Inbound datagrams discarded as malformed, unknown or unplaceable.
    pub packets_dropped: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub circuits: usize,
    pub alive_circuits: usize,
    pub mean_rtt: Option<Duration>,
}

struct SystemInner {
    circuits: CircuitTable,
    build: Option<MessageBuilder>,
}

/// The messaging layer: templates, circuits, the outgoing builder and the
///  inbound dispatcher, bundled into one owned handle. Multiple systems can
///  coexist in a process.
///
/// The owning application drives the system by calling [`poll`](Self::poll)
///  repeatedly; a tick drains whatever the transport offers without blocking,
///  sweeps timeouts and sends due retransmissions.
///
/// The circuit table and build state share a single mutex; handlers run on
///  the driver's thread with that mutex released, but must not register or
///  unregister handlers from within a callback.
pub struct MessageSystem {
    config: MessageConfig,
    templates: Arc<TemplateRegistry>,
    transport: Arc<dyn Transport>,
    inner: Mutex<SystemInner>,
    handlers: Mutex<HandlerRegistry>,
    counters: Counters,
}

impl MessageSystem {
    pub fn new(
        transport: Arc<dyn Transport>,
        templates: Arc<TemplateRegistry>,
        config: MessageConfig,
    ) -> Result<MessageSystem, ProtocolError> {
        config.validate()?;

        Ok(MessageSystem {
            inner: Mutex::new(SystemInner {
                circuits: CircuitTable::new(config.max_circuits),
                build: None,
            }),
            config,
            templates,
            transport,
            handlers: Mutex::new(HandlerRegistry::default()),
            counters: Counters::default(),
        })
    }

    pub fn templates(&self) -> &Arc<TemplateRegistry> {
        &self.templates
    }

    fn inner(&self) -> MutexGuard<'_, SystemInner> {
        self.inner.lock().expect("message system mutex poisoned")
    }

    // ---- outgoing builder ------------------------------------------------

    /// Starts building a message. Only one build may be in progress at a
    ///  time; the previous one must be finished with `send` first.
    pub fn new_message(&self, name: &str) -> Result<(), ProtocolError> {
        let template = self
            .templates
            .by_name(name)
            .ok_or_else(|| ProtocolError::UnknownTemplate(name.to_owned()))?
            .clone();

        let mut inner = self.inner();
        if inner.build.is_some() {
            return Err(ProtocolError::BuildState(
                "a message is already being built".to_owned(),
            ));
        }
        inner.build = Some(MessageBuilder::new(template));
        Ok(())
    }

    pub fn next_block(&self, name: &str) -> Result<(), ProtocolError> {
        self.with_build(|build| build.next_block(name))
    }

    pub fn add_u8(&self, name: &str, value: u8) -> Result<(), ProtocolError> {
        self.add_value(name, Value::U8(value))
    }

    pub fn add_u16(&self, name: &str, value: u16) -> Result<(), ProtocolError> {
        self.add_value(name, Value::U16(value))
    }

    pub fn add_u32(&self, name: &str, value: u32) -> Result<(), ProtocolError> {
        self.add_value(name, Value::U32(value))
    }

    pub fn add_u64(&self, name: &str, value: u64) -> Result<(), ProtocolError> {
        self.add_value(name, Value::U64(value))
    }

    pub fn add_f32(&self, name: &str, value: f32) -> Result<(), ProtocolError> {
        self.add_value(name, Value::F32(value))
    }

    pub fn add_f64(&self, name: &str, value: f64) -> Result<(), ProtocolError> {
        self.add_value(name, Value::F64(value))
    }

    pub fn add_vector3(&self, name: &str, value: [f32; 3]) -> Result<(), ProtocolError> {
        self.add_value(name, Value::Vector3(value))
    }

    pub fn add_vector4(&self, name: &str, value: [f32; 4]) -> Result<(), ProtocolError> {
        self.add_value(name, Value::Vector4(value))
    }

    pub fn add_quaternion(&self, name: &str, value: [f32; 4]) -> Result<(), ProtocolError> {
        self.add_value(name, Value::Quaternion(value))
    }

    pub fn add_uuid(&self, name: &str, value: Uuid) -> Result<(), ProtocolError> {
        self.add_value(name, Value::Uuid(value))
    }

    pub fn add_ip_addr(&self, name: &str, value: Ipv4Addr) -> Result<(), ProtocolError> {
        self.add_value(name, Value::IpAddr(value))
    }

    pub fn add_port(&self, name: &str, value: u16) -> Result<(), ProtocolError> {
        self.add_value(name, Value::Port(value))
    }

    pub fn add_fixed(&self, name: &str, value: impl Into<Bytes>) -> Result<(), ProtocolError> {
        self.add_value(name, Value::Fixed(value.into()))
    }

    pub fn add_bytes(&self, name: &str, value: impl Into<Bytes>) -> Result<(), ProtocolError> {
        self.add_value(name, Value::Variable(value.into()))
    }

    pub fn add_string(&self, name: &str, value: &str) -> Result<(), ProtocolError> {
        self.add_value(name, Value::Variable(Bytes::copy_from_slice(value.as_bytes())))
    }

    fn add_value(&self, name: &str, value: Value) -> Result<(), ProtocolError> {
        self.with_build(|build| build.add(name, value))
    }

    fn with_build<R>(
        &self,
        f: impl FnOnce(&mut MessageBuilder) -> Result<R, ProtocolError>,
    ) -> Result<R, ProtocolError> {
        let mut inner = self.inner();
        let build = inner.build.as_mut().ok_or_else(|| {
            ProtocolError::BuildState("no message under construction".to_owned())
        })?;
        f(build)
    }

    /// Finishes the build in progress and transmits it. Returns the number of
    ///  bytes sent, or 0 when the throttle rejected the datagram (the message
    ///  is dropped, not queued).
    pub fn send(&self, to: Host) -> Result<usize, ProtocolError> {
        self.send_at(to, Instant::now())
    }

    /// Like [`send`](Self::send) with an explicit clock, for simulations and
    ///  tests.
    pub fn send_at(&self, to: Host, now: Instant) -> Result<usize, ProtocolError> {
        let mut inner = self.inner();
        let build = inner.build.take().ok_or_else(|| {
            ProtocolError::BuildState("send without a message under construction".to_owned())
        })?;
        let (template, mut buf, payload_start) = build.finish()?;

        let circuit = inner.circuits.get_or_create(to, now)?;
        let sequence = circuit.next_outbound_sequence(now);
        buf[PacketHeader::SEQUENCE_RANGE].copy_from_slice(&sequence.to_le_bytes());

        let mut datagram = if template.zero_coded {
            let encoded = zero_encode(&buf[payload_start..]);
            let mut out = BytesMut::with_capacity(payload_start + encoded.len() + 1);
            out.put_slice(&buf[..payload_start]);
            out.put_slice(&encoded);
            out
        } else {
            buf
        };

        let projected_len = datagram.len()
            + 4 * circuit.pending_ack_count().min(MAX_ACKS_PER_DATAGRAM)
            + 1;
        if projected_len > self.config.max_datagram_size {
            return Err(ProtocolError::BuildState(format!(
                "datagram of {} bytes exceeds the {} byte limit",
                projected_len, self.config.max_datagram_size
            )));
        }

        if let Err(ProtocolError::Throttled) =
            admit(circuit, template.throttle_category, projected_len)
        {
            debug!(?to, template = template.name, "throttled, dropping message");
            return Ok(0);
        }

        append_ack_trailer(&mut datagram, &circuit.take_pending_acks(MAX_ACKS_PER_DATAGRAM));
        let datagram = datagram.freeze();

        match self.transport.send(to, &datagram) {
            Ok(bytes_sent) => {
                self.counters.packets_out.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .bytes_out
                    .fetch_add(datagram.len() as u64, Ordering::Relaxed);
                if template.reliable {
                    circuit.install_unacked(PacketBuffer::new(sequence, datagram, now));
                }
                trace!(?to, template = template.name, sequence, "sent");
                Ok(bytes_sent)
            }
            Err(e) => {
                error!(?to, template = template.name, "send failed: {}", e);
                self.counters.packets_dropped.fetch_add(1, Ordering::Relaxed);
                Err(ProtocolError::Transport(e))
            }
        }
    }

    // ---- handlers --------------------------------------------------------

    /// Registers a callback for a template name. Multiple handlers per name
    ///  run in registration order; a failing handler is logged and does not
    ///  stop the others.
    pub fn register_handler(
        &self,
        name: impl Into<String>,
        handler: impl FnMut(&ReceivedMessage) -> anyhow::Result<()> + Send + 'static,
    ) -> HandlerId {
        let mut registry = self.handlers.lock().expect("handler registry mutex poisoned");
        registry.next_id += 1;
        let id = HandlerId(registry.next_id);
        registry
            .handlers
            .entry(name.into())
            .or_default()
            .push((id, Box::new(handler)));
        id
    }

    pub fn unregister_handler(&self, name: &str, id: HandlerId) -> bool {
        let mut registry = self.handlers.lock().expect("handler registry mutex poisoned");
        let Some(list) = registry.handlers.get_mut(name) else {
            return false;
        };
        let before = list.len();
        list.retain(|(handler_id, _)| *handler_id != id);
        list.len() < before
    }

    // ---- driver ----------------------------------------------------------

    /// One driver tick: drains inbound datagrams, dispatches them, sweeps
    ///  timeouts, refills throttles and retransmits what is due.
    pub fn poll(&self) {
        self.poll_at(Instant::now())
    }

    /// Like [`poll`](Self::poll) with an explicit clock, for simulations and
    ///  tests.
    pub fn poll_at(&self, now: Instant) {
        loop {
            match self.transport.recv() {
                Ok(Some((sender, datagram))) => self.handle_datagram(sender, datagram, now),
                Ok(None) => break,
                Err(e) => {
                    error!("transport receive error: {}", e);
                    break;
                }
            }
        }

        {
            let mut inner = self.inner();
            if self.config.allow_timeout {
                let outcome = inner.circuits.sweep_timeouts(now, &self.config);
                self.counters
                    .packets_lost
                    .fetch_add(outcome.gave_up as u64, Ordering::Relaxed);
            } else {
                for circuit in inner.circuits.circuits_mut() {
                    circuit.throttles().update_average(now);
                }
            }

            let transport = &self.transport;
            inner
                .circuits
                .process_retries(now, |host, datagram| transport.send(host, datagram));
        }
    }

    fn handle_datagram(&self, sender: Host, datagram: BytesMut, now: Instant) {
        self.counters.packets_in.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_in
            .fetch_add(datagram.len() as u64, Ordering::Relaxed);

        let (body, acks) = match split_ack_trailer(&datagram) {
            Ok(split) => split,
            Err(e) => {
                warn!(?sender, "dropping datagram: {}", e);
                self.counters.packets_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let mut read = body;
        let header = match PacketHeader::deser(&mut read, self.config.strict_flags) {
            Ok(header) => header,
            Err(e) => {
                warn!(?sender, "dropping datagram: {}", e);
                self.counters.packets_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let Some(template) = self.templates.by_opcode(header.opcode).cloned() else {
            warn!(?sender, opcode = header.opcode, "unknown opcode, dropping datagram");
            self.counters.packets_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let classification = {
            let mut inner = self.inner();
            let circuit = match inner.circuits.get_or_create(sender, now) {
                Ok(circuit) => circuit,
                Err(e) => {
                    warn!(?sender, "dropping datagram: {}", e);
                    self.counters.packets_dropped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            };

            let classification = circuit.record_inbound(header.sequence, false, now);
            if let crate::circuit::Classification::InOrderAfterGap { missed } = classification {
                self.counters
                    .packets_lost
                    .fetch_add(missed as u64, Ordering::Relaxed);
            }

            // acks piggyback on every datagram, duplicates included
            for &sequence in &acks {
                circuit.acknowledge(sequence, now);
            }
            if header.flags.contains(PacketFlags::RELIABLE) {
                circuit.enqueue_ack(header.sequence);
            }

            classification
        };

        if !classification.is_first_delivery() {
            return;
        }

        let decoded_payload;
        let mut payload: &[u8] = if header.flags.contains(PacketFlags::ZERO_CODED) {
            decoded_payload = match zero_decode(read) {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!(?sender, template = template.name, "dropping datagram: {}", e);
                    self.counters.packets_dropped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            };
            &decoded_payload
        } else {
            read
        };

        let message = match decode_payload(&template, &mut payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(?sender, template = template.name, "dropping datagram: {}", e);
                self.counters.packets_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let received = ReceivedMessage {
            sender,
            sequence: header.sequence,
            message,
        };
        self.dispatch(&received);

        if self.config.auto_respond_pings && template.name == "StartPingCheck" {
            self.respond_to_ping(&received, now);
        }
    }

    fn dispatch(&self, message: &ReceivedMessage) {
        let mut registry = self.handlers.lock().expect("handler registry mutex poisoned");
        let Some(list) = registry.handlers.get_mut(message.message.name()) else {
            trace!(template = message.message.name(), "no handlers registered");
            return;
        };

        for (id, handler) in list {
            if let Err(e) = handler(message) {
                warn!(
                    template = message.message.name(),
                    handler = id.0,
                    "handler failed: {:#}",
                    e
                );
            }
        }
    }

    fn respond_to_ping(&self, ping: &ReceivedMessage, now: Instant) {
        let ping_block = ping.message.block("PingID");
        let ping_id = ping_block
            .and_then(|block| block.get("PingID"))
            .and_then(Value::as_u8);
        let Some(ping_id) = ping_id else {
            return;
        };

        // the oldest sequence the peer still holds unacked, for diagnostics
        let peer_oldest_unacked = ping_block
            .and_then(|block| block.get("OldestUnacked"))
            .and_then(Value::as_u32);
        trace!(to = ?ping.sender, ping_id, ?peer_oldest_unacked, "answering ping");

        let result = self
            .new_message("CompletePingCheck")
            .and_then(|()| self.next_block("PingID"))
            .and_then(|()| self.add_u8("PingID", ping_id))
            .and_then(|()| self.send_at(ping.sender, now));
        if let Err(e) = result {
            debug!(to = ?ping.sender, "could not answer ping: {}", e);
        }
    }

    // ---- inspection ------------------------------------------------------

    pub fn stats(&self) -> MessageStats {
        let inner = self.inner();
        let (alive_circuits, mean_rtt) = inner.circuits.aggregate_rtt();

        MessageStats {
            packets_in: self.counters.packets_in.load(Ordering::Relaxed),
            packets_out: self.counters.packets_out.load(Ordering::Relaxed),
            packets_lost: self.counters.packets_lost.load(Ordering::Relaxed),
            packets_dropped: self.counters.packets_dropped.load(Ordering::Relaxed),
            bytes_in: self.counters.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.counters.bytes_out.load(Ordering::Relaxed),
            circuits: inner.circuits.len(),
            alive_circuits,
            mean_rtt,
        }
    }

    pub fn circuit_snapshot(&self, host: Host) -> Option<CircuitSnapshot> {
        self.inner().circuits.find(host).map(Circuit::snapshot)
    }

    pub fn circuit_snapshots(&self) -> Vec<CircuitSnapshot> {
        self.inner().circuits.snapshots()
    }

    pub fn remove_circuit(&self, host: Host) -> bool {
        self.inner().circuits.remove(host).is_some()
    }

    /// Undoes dynamic throttle adjustment on every circuit, restoring the
    ///  nominal per-category rates.
    pub fn reset_throttles(&self) {
        let mut inner = self.inner();
        for circuit in inner.circuits.circuits_mut() {
            circuit.throttles().reset_dynamic_adjust();
        }
    }
}

fn admit(
    circuit: &mut Circuit,
    category: ThrottleCategory,
    size_bytes: usize,
) -> Result<(), ProtocolError> {
    if circuit.throttles().check_overflow(category, size_bytes) {
        Err(ProtocolError::Throttled)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use mockall::predicate::{always, eq};

    fn system(transport: MockTransport) -> MessageSystem {
        MessageSystem::new(
            Arc::new(transport),
            Arc::new(TemplateRegistry::standard()),
            MessageConfig::default(),
        )
        .unwrap()
    }

    fn build_ping(system: &MessageSystem) {
        system.new_message("StartPingCheck").unwrap();
        system.next_block("PingID").unwrap();
        system.add_u8("PingID", 0).unwrap();
        system.add_u32("OldestUnacked", 0).unwrap();
    }

    #[test]
    fn test_send_transmits_and_installs_unacked() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .with(eq(Host::localhost(9000)), always())
            .times(1)
            .returning(|_, datagram| Ok(datagram.len()));

        let system = system(transport);
        build_ping(&system);
        let sent = system.send(Host::localhost(9000)).unwrap();

        // header 6 + payload 5 + empty ack trailer 1
        assert_eq!(sent, 12);

        let snapshot = system.circuit_snapshot(Host::localhost(9000)).unwrap();
        assert_eq!(snapshot.packets_out, 1);
        assert_eq!(snapshot.unacked_count, 1);
        assert_eq!(system.stats().packets_out, 1);
    }

    #[test]
    fn test_unreliable_send_installs_nothing() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .returning(|_, datagram| Ok(datagram.len()));

        let system = system(transport);
        system.new_message("ChatFromSimulator").unwrap();
        system.next_block("ChatData").unwrap();
        system.add_string("FromName", "object").unwrap();
        system.add_uuid("SourceId", Uuid::nil()).unwrap();
        system.add_u8("ChatType", 1).unwrap();
        system.add_u8("Audible", 1).unwrap();
        system.add_vector3("Position", [0.0; 3]).unwrap();
        system.add_string("Message", "hello").unwrap();
        system.send(Host::localhost(9000)).unwrap();

        let snapshot = system.circuit_snapshot(Host::localhost(9000)).unwrap();
        assert_eq!(snapshot.unacked_count, 0);
    }

    #[test]
    fn test_nested_new_message_is_rejected() {
        let system = system(MockTransport::new());
        system.new_message("StartPingCheck").unwrap();
        assert!(matches!(
            system.new_message("StartPingCheck"),
            Err(ProtocolError::BuildState(_))
        ));
    }

    #[test]
    fn test_send_without_build_is_rejected() {
        let system = system(MockTransport::new());
        assert!(matches!(
            system.send(Host::localhost(9000)),
            Err(ProtocolError::BuildState(_))
        ));
    }

    #[test]
    fn test_unknown_template_is_rejected() {
        let system = system(MockTransport::new());
        assert!(matches!(
            system.new_message("NoSuchMessage"),
            Err(ProtocolError::UnknownTemplate(_))
        ));
    }

    #[test]
    fn test_transport_error_does_not_install_unacked() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .returning(|_, _| Err(std::io::Error::other("wire cut")));

        let system = system(transport);
        build_ping(&system);
        assert!(matches!(
            system.send(Host::localhost(9000)),
            Err(ProtocolError::Transport(_))
        ));

        let snapshot = system.circuit_snapshot(Host::localhost(9000)).unwrap();
        assert_eq!(snapshot.unacked_count, 0);
        assert_eq!(system.stats().packets_dropped, 1);
    }

    #[test]
    fn test_poll_drops_malformed_datagram() {
        let mut transport = MockTransport::new();
        let mut datagrams = vec![Some((
            Host::localhost(9000),
            BytesMut::from(&[0x01, 0x00][..]),
        ))];
        transport
            .expect_recv()
            .returning(move || Ok(datagrams.pop().flatten()));

        let system = system(transport);
        system.poll();

        let stats = system.stats();
        assert_eq!(stats.packets_in, 1);
        assert_eq!(stats.packets_dropped, 1);
    }

    #[test]
    fn test_poll_drops_unknown_opcode() {
        let mut transport = MockTransport::new();
        // opcode 99 is not in the catalogue; lone 0x00 is the empty ack trailer
        let mut datagrams = vec![Some((
            Host::localhost(9000),
            BytesMut::from(&[0x00, 0, 0, 0, 0, 99, 0x00][..]),
        ))];
        transport
            .expect_recv()
            .returning(move || Ok(datagrams.pop().flatten()));

        let system = system(transport);
        system.poll();

        assert_eq!(system.stats().packets_dropped, 1);
        // dropped before circuit bookkeeping
        assert!(system.circuit_snapshot(Host::localhost(9000)).is_none());
    }

    #[test]
    fn test_handlers_run_in_registration_order_and_survive_failure() {
        let mut transport = MockTransport::new();
        // a well-formed CompletePingCheck: header, PingID=7, empty ack trailer
        let mut datagrams = vec![Some((
            Host::localhost(9000),
            BytesMut::from(&[0x01, 0, 0, 0, 0, 2, 7, 0x00][..]),
        ))];
        transport
            .expect_recv()
            .returning(move || Ok(datagrams.pop().flatten()));

        let system = system(transport);

        let order = Arc::new(Mutex::new(Vec::new()));
        let first = order.clone();
        system.register_handler("CompletePingCheck", move |message| {
            first.lock().unwrap().push(1);
            assert_eq!(
                message.message.block("PingID").unwrap().get("PingID"),
                Some(&Value::U8(7))
            );
            anyhow::bail!("deliberate failure")
        });
        let second = order.clone();
        system.register_handler("CompletePingCheck", move |_| {
            second.lock().unwrap().push(2);
            Ok(())
        });

        system.poll();
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_unregister_handler() {
        let system = system(MockTransport::new());
        let id = system.register_handler("ChatFromSimulator", |_| Ok(()));
        assert!(system.unregister_handler("ChatFromSimulator", id));
        assert!(!system.unregister_handler("ChatFromSimulator", id));
    }

    #[test]
    fn test_duplicate_is_not_dispatched_but_still_acked() {
        let mut transport = MockTransport::new();
        let datagram = &[0x01u8, 0, 0, 0, 0, 2, 7, 0x00][..];
        let mut datagrams = vec![
            Some((Host::localhost(9000), BytesMut::from(datagram))),
            None,
            Some((Host::localhost(9000), BytesMut::from(datagram))),
        ];
        transport
            .expect_recv()
            .returning(move || Ok(datagrams.pop().flatten()));

        let system = system(transport);
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        system.register_handler("CompletePingCheck", move |_| {
            *counter.lock().unwrap() += 1;
            Ok(())
        });

        system.poll(); // first copy: dispatched
        system.poll(); // duplicate: suppressed
        assert_eq!(*calls.lock().unwrap(), 1);

        let snapshot = system.circuit_snapshot(Host::localhost(9000)).unwrap();
        assert_eq!(snapshot.packets_in, 2);
    }

    #[test]
    fn test_gap_updates_global_loss() {
        let mut transport = MockTransport::new();
        // sequence 5 on a fresh circuit: 5 packets missed
        let mut datagrams = vec![Some((
            Host::localhost(9000),
            BytesMut::from(&[0x00u8, 5, 0, 0, 0, 2, 7, 0x00][..]),
        ))];
        transport
            .expect_recv()
            .returning(move || Ok(datagrams.pop().flatten()));

        let system = system(transport);
        system.poll();

        assert_eq!(system.stats().packets_lost, 5);
    }
}
