use std::sync::Arc;

use bytes::{BufMut, BytesMut};

use crate::error::ProtocolError;
use crate::packet_header::{PacketFlags, PacketHeader};
use crate::template::{BlockCardinality, MessageTemplate};
use crate::value::Value;

/// Assembles one outgoing message: header first (with a placeholder sequence,
///  patched at send time), then block data in strict template order.
///
/// The builder enforces the template positionally: `next_block` must name the
///  template's next block (or a further instance of the currently open
///  repeating block), and every `add` must name and match the next variable of
///  the open block. Blocks with variable cardinality may be skipped entirely;
///  everything else is required.
pub struct MessageBuilder {
    template: Arc<MessageTemplate>,
    buf: BytesMut,
    payload_start: usize,
    /// Currently open block index into `template.blocks`.
    block_idx: Option<usize>,
    var_idx: usize,
    instance_count: u8,
    /// Position of the instance-count byte of an open variable-cardinality
    ///  block, patched on close.
    count_pos: Option<usize>,
}

impl MessageBuilder {
    pub fn new(template: Arc<MessageTemplate>) -> MessageBuilder {
        let mut flags = PacketFlags::empty();
        if template.reliable {
            flags |= PacketFlags::RELIABLE;
        }
        if template.zero_coded {
            flags |= PacketFlags::ZERO_CODED;
        }

        let mut buf = BytesMut::with_capacity(256);
        PacketHeader {
            flags,
            sequence: 0,
            opcode: template.opcode,
        }
        .ser(&mut buf);
        let payload_start = buf.len();

        MessageBuilder {
            template,
            buf,
            payload_start,
            block_idx: None,
            var_idx: 0,
            instance_count: 0,
            count_pos: None,
        }
    }

    pub fn template(&self) -> &Arc<MessageTemplate> {
        &self.template
    }

    /// Opens the next block of the template, or a further instance of the
    ///  currently open repeating block.
    pub fn next_block(&mut self, name: &str) -> Result<(), ProtocolError> {
        if let Some(block_idx) = self.block_idx {
            let spec = &self.template.blocks[block_idx];
            if spec.name == name {
                // a further instance of the open block
                self.require_instance_complete()?;
                match spec.cardinality {
                    BlockCardinality::Single => {
                        return Err(build_error(format!(
                            "block {:?} allows a single instance",
                            name
                        )));
                    }
                    BlockCardinality::Multiple(count) if self.instance_count >= count => {
                        return Err(build_error(format!(
                            "block {:?} allows {} instances",
                            name, count
                        )));
                    }
                    BlockCardinality::Variable if self.instance_count == u8::MAX => {
                        return Err(build_error(format!(
                            "block {:?} exceeds 255 instances",
                            name
                        )));
                    }
                    _ => {}
                }
                self.instance_count += 1;
                self.var_idx = 0;
                return Ok(());
            }
            self.close_open_block()?;
        }

        let next_expected = self.block_idx.map(|i| i + 1).unwrap_or(0);
        let target = self
            .template
            .blocks
            .iter()
            .enumerate()
            .skip(next_expected)
            .find(|(_, spec)| spec.name == name)
            .map(|(i, _)| i)
            .ok_or_else(|| {
                build_error(format!(
                    "template {:?} has no block {:?} at or after position {}",
                    self.template.name, name, next_expected
                ))
            })?;

        self.skip_blocks(next_expected, target)?;

        let spec = &self.template.blocks[target];
        if spec.cardinality == BlockCardinality::Variable {
            self.count_pos = Some(self.buf.len());
            self.buf.put_u8(0);
        }
        self.block_idx = Some(target);
        self.var_idx = 0;
        self.instance_count = 1;
        Ok(())
    }

    /// Appends the next variable of the open block.
    pub fn add(&mut self, name: &str, value: Value) -> Result<(), ProtocolError> {
        let block_idx = self
            .block_idx
            .ok_or_else(|| build_error("no block open; call next_block first".to_owned()))?;
        let spec = &self.template.blocks[block_idx];

        let var_spec = spec.variables.get(self.var_idx).ok_or_else(|| {
            build_error(format!("all variables of block {:?} are already set", spec.name))
        })?;
        if var_spec.name != name {
            return Err(build_error(format!(
                "expected variable {:?} next in block {:?}, got {:?}",
                var_spec.name, spec.name, name
            )));
        }
        if !value.matches(&var_spec.var_type) {
            return Err(build_error(format!(
                "variable {:?} expects {:?}",
                name, var_spec.var_type
            )));
        }

        encode_value(&mut self.buf, &value, &var_spec.var_type)?;
        self.var_idx += 1;
        Ok(())
    }

    /// Closes the message and hands back the assembled buffer together with
    ///  the offset where the payload begins.
    pub fn finish(mut self) -> Result<(Arc<MessageTemplate>, BytesMut, usize), ProtocolError> {
        let next_expected = if self.block_idx.is_some() {
            self.close_open_block()?;
            self.block_idx.expect("a block was open") + 1
        } else {
            0
        };
        self.skip_blocks(next_expected, self.template.blocks.len())?;

        Ok((self.template, self.buf, self.payload_start))
    }

    /// Emits empty instance counts for skippable blocks in `[from, to)`;
    ///  required blocks in the range are an error.
    fn skip_blocks(&mut self, from: usize, to: usize) -> Result<(), ProtocolError> {
        for spec in &self.template.blocks[from..to] {
            match spec.cardinality {
                BlockCardinality::Variable => self.buf.put_u8(0),
                _ => {
                    return Err(build_error(format!(
                        "block {:?} requires data",
                        spec.name
                    )));
                }
            }
        }
        Ok(())
    }

    fn close_open_block(&mut self) -> Result<(), ProtocolError> {
        self.require_instance_complete()?;

        let block_idx = self.block_idx.expect("caller checked that a block is open");
        let spec = &self.template.blocks[block_idx];
        match spec.cardinality {
            BlockCardinality::Single => {}
            BlockCardinality::Multiple(count) => {
                if self.instance_count != count {
                    return Err(build_error(format!(
                        "block {:?} expects {} instances, got {}",
                        spec.name, count, self.instance_count
                    )));
                }
            }
            BlockCardinality::Variable => {
                let pos = self.count_pos.take().expect("variable block recorded its count byte");
                self.buf[pos] = self.instance_count;
            }
        }
        Ok(())
    }

    fn require_instance_complete(&self) -> Result<(), ProtocolError> {
        let block_idx = self.block_idx.expect("caller checked that a block is open");
        let spec = &self.template.blocks[block_idx];
        if self.var_idx != spec.variables.len() {
            return Err(build_error(format!(
                "block {:?} is missing variable {:?}",
                spec.name, spec.variables[self.var_idx].name
            )));
        }
        Ok(())
    }
}

fn build_error(message: String) -> ProtocolError {
    ProtocolError::BuildState(message)
}

fn encode_value(
    buf: &mut BytesMut,
    value: &Value,
    var_type: &crate::template::VariableType,
) -> Result<(), ProtocolError> {
    use crate::template::VariableType;

    match value {
        Value::U8(v) => buf.put_u8(*v),
        Value::U16(v) => buf.put_u16_le(*v),
        Value::U32(v) => buf.put_u32_le(*v),
        Value::U64(v) => buf.put_u64_le(*v),
        Value::F32(v) => buf.put_u32_le(v.to_bits()),
        Value::F64(v) => buf.put_u64_le(v.to_bits()),
        Value::Vector3(v) => {
            for component in v {
                buf.put_u32_le(component.to_bits());
            }
        }
        Value::Vector4(v) | Value::Quaternion(v) => {
            for component in v {
                buf.put_u32_le(component.to_bits());
            }
        }
        Value::Uuid(v) => buf.put_slice(v.as_bytes()),
        // network byte order
        Value::IpAddr(v) => buf.put_slice(&v.octets()),
        Value::Port(v) => buf.put_u16(*v),
        Value::Fixed(data) => buf.put_slice(data),
        Value::Variable(data) => match var_type {
            VariableType::Variable1 => {
                if data.len() > u8::MAX as usize {
                    return Err(build_error(format!(
                        "variable data of {} bytes exceeds the 1-byte length prefix",
                        data.len()
                    )));
                }
                buf.put_u8(data.len() as u8);
                buf.put_slice(data);
            }
            VariableType::Variable2 => {
                if data.len() > u16::MAX as usize {
                    return Err(build_error(format!(
                        "variable data of {} bytes exceeds the 2-byte length prefix",
                        data.len()
                    )));
                }
                buf.put_u16_le(data.len() as u16);
                buf.put_slice(data);
            }
            _ => unreachable!("Value::matches was checked by the caller"),
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rstest::rstest;
    use std::net::Ipv4Addr;
    use uuid::Uuid;

    use crate::decoder::decode_payload;
    use crate::template::{
        BlockCardinality, BlockSpec, TemplateRegistry, VariableSpec, VariableType,
    };
    use crate::throttle::ThrottleCategory;

    fn ping_builder() -> MessageBuilder {
        let registry = TemplateRegistry::standard();
        MessageBuilder::new(registry.by_name("StartPingCheck").unwrap().clone())
    }

    /// A template exercising every cardinality: one single block, one fixed
    ///  pair, one variable-count block.
    fn kitchen_sink_template() -> Arc<MessageTemplate> {
        Arc::new(MessageTemplate {
            name: "KitchenSink",
            opcode: 4242,
            reliable: false,
            zero_coded: false,
            throttle_category: ThrottleCategory::Task,
            blocks: vec![
                BlockSpec {
                    name: "Header",
                    cardinality: BlockCardinality::Single,
                    variables: vec![
                        VariableSpec { name: "Id", var_type: VariableType::Uuid },
                        VariableSpec { name: "Position", var_type: VariableType::Vector3 },
                        VariableSpec { name: "Rotation", var_type: VariableType::Quaternion },
                        VariableSpec { name: "Scale", var_type: VariableType::F64 },
                    ],
                },
                BlockSpec {
                    name: "Endpoints",
                    cardinality: BlockCardinality::Multiple(2),
                    variables: vec![
                        VariableSpec { name: "IP", var_type: VariableType::IpAddr },
                        VariableSpec { name: "Port", var_type: VariableType::Port },
                    ],
                },
                BlockSpec {
                    name: "Attachments",
                    cardinality: BlockCardinality::Variable,
                    variables: vec![
                        VariableSpec { name: "Kind", var_type: VariableType::U16 },
                        VariableSpec { name: "Data", var_type: VariableType::Variable2 },
                    ],
                },
            ],
        })
    }

    #[test]
    fn test_header_has_placeholder_sequence() {
        let mut builder = ping_builder();
        builder.next_block("PingID").unwrap();
        builder.add("PingID", Value::U8(0)).unwrap();
        builder.add("OldestUnacked", Value::U32(0)).unwrap();

        let (_, buf, payload_start) = builder.finish().unwrap();
        // flags: reliable; sequence placeholder; opcode 1
        assert_eq!(&buf[..6], &[0x01, 0, 0, 0, 0, 1]);
        assert_eq!(payload_start, 6);
    }

    #[test]
    fn test_round_trip_every_cardinality() {
        let template = kitchen_sink_template();
        let id = Uuid::new_v4();

        let mut builder = MessageBuilder::new(template.clone());
        builder.next_block("Header").unwrap();
        builder.add("Id", Value::Uuid(id)).unwrap();
        builder.add("Position", Value::Vector3([1.0, -2.5, 1e-9])).unwrap();
        builder.add("Rotation", Value::Quaternion([0.0, 0.0, 0.0, 1.0])).unwrap();
        builder.add("Scale", Value::F64(0.125)).unwrap();

        for port in [80u16, 443] {
            builder.next_block("Endpoints").unwrap();
            builder.add("IP", Value::IpAddr(Ipv4Addr::new(10, 0, 0, 1))).unwrap();
            builder.add("Port", Value::Port(port)).unwrap();
        }

        for kind in [1u16, 2, 3] {
            builder.next_block("Attachments").unwrap();
            builder.add("Kind", Value::U16(kind)).unwrap();
            builder.add("Data", Value::Variable(Bytes::from_static(b"blob"))).unwrap();
        }

        let (_, buf, payload_start) = builder.finish().unwrap();
        let decoded = decode_payload(&template, &mut &buf[payload_start..]).unwrap();

        let header = decoded.block("Header").unwrap();
        assert_eq!(header.get("Id"), Some(&Value::Uuid(id)));
        assert_eq!(header.get("Position"), Some(&Value::Vector3([1.0, -2.5, 1e-9])));
        assert_eq!(header.get("Scale"), Some(&Value::F64(0.125)));

        let endpoints: Vec<_> = decoded.block_instances("Endpoints").collect();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[1].get("Port"), Some(&Value::Port(443)));

        let attachments: Vec<_> = decoded.block_instances("Attachments").collect();
        assert_eq!(attachments.len(), 3);
        assert_eq!(attachments[2].get("Kind"), Some(&Value::U16(3)));
        assert_eq!(
            attachments[0].get("Data"),
            Some(&Value::Variable(Bytes::from_static(b"blob")))
        );
    }

    #[test]
    fn test_variable_block_may_be_empty() {
        let template = kitchen_sink_template();

        let mut builder = MessageBuilder::new(template.clone());
        builder.next_block("Header").unwrap();
        builder.add("Id", Value::Uuid(Uuid::nil())).unwrap();
        builder.add("Position", Value::Vector3([0.0; 3])).unwrap();
        builder.add("Rotation", Value::Quaternion([0.0; 4])).unwrap();
        builder.add("Scale", Value::F64(0.0)).unwrap();
        builder.next_block("Endpoints").unwrap();
        builder.add("IP", Value::IpAddr(Ipv4Addr::LOCALHOST)).unwrap();
        builder.add("Port", Value::Port(1)).unwrap();
        builder.next_block("Endpoints").unwrap();
        builder.add("IP", Value::IpAddr(Ipv4Addr::LOCALHOST)).unwrap();
        builder.add("Port", Value::Port(2)).unwrap();

        // Attachments never opened: finish emits a zero instance count
        let (_, buf, payload_start) = builder.finish().unwrap();
        let decoded = decode_payload(&template, &mut &buf[payload_start..]).unwrap();
        assert_eq!(decoded.block_instances("Attachments").count(), 0);
    }

    #[rstest]
    #[case::wrong_variable_name("OldestUnacked")]
    #[case::unknown_variable("NoSuchVar")]
    fn test_rejects_out_of_order_variable(#[case] name: &str) {
        let mut builder = ping_builder();
        builder.next_block("PingID").unwrap();
        assert!(builder.add(name, Value::U8(1)).is_err());
    }

    #[test]
    fn test_rejects_type_mismatch() {
        let mut builder = ping_builder();
        builder.next_block("PingID").unwrap();
        assert!(builder.add("PingID", Value::U32(1)).is_err());
    }

    #[test]
    fn test_rejects_add_without_block() {
        let mut builder = ping_builder();
        assert!(builder.add("PingID", Value::U8(1)).is_err());
    }

    #[test]
    fn test_rejects_incomplete_instance() {
        let mut builder = ping_builder();
        builder.next_block("PingID").unwrap();
        builder.add("PingID", Value::U8(1)).unwrap();
        assert!(builder.finish().is_err());
    }

    #[test]
    fn test_rejects_second_instance_of_single_block() {
        let mut builder = ping_builder();
        builder.next_block("PingID").unwrap();
        builder.add("PingID", Value::U8(1)).unwrap();
        builder.add("OldestUnacked", Value::U32(0)).unwrap();
        assert!(builder.next_block("PingID").is_err());
    }

    #[test]
    fn test_rejects_skipping_required_block() {
        let template = kitchen_sink_template();
        let mut builder = MessageBuilder::new(template);
        builder.next_block("Header").unwrap();
        builder.add("Id", Value::Uuid(Uuid::nil())).unwrap();
        builder.add("Position", Value::Vector3([0.0; 3])).unwrap();
        builder.add("Rotation", Value::Quaternion([0.0; 4])).unwrap();
        builder.add("Scale", Value::F64(0.0)).unwrap();

        // Endpoints is Multiple(2) and cannot be skipped
        assert!(builder.next_block("Attachments").is_err());
    }

    #[test]
    fn test_rejects_underfilled_multiple_block() {
        let template = kitchen_sink_template();
        let mut builder = MessageBuilder::new(template);
        builder.next_block("Header").unwrap();
        builder.add("Id", Value::Uuid(Uuid::nil())).unwrap();
        builder.add("Position", Value::Vector3([0.0; 3])).unwrap();
        builder.add("Rotation", Value::Quaternion([0.0; 4])).unwrap();
        builder.add("Scale", Value::F64(0.0)).unwrap();
        builder.next_block("Endpoints").unwrap();
        builder.add("IP", Value::IpAddr(Ipv4Addr::LOCALHOST)).unwrap();
        builder.add("Port", Value::Port(1)).unwrap();

        assert!(builder.finish().is_err());
    }

    #[test]
    fn test_rejects_oversized_variable1() {
        let registry = TemplateRegistry::standard();
        let mut builder =
            MessageBuilder::new(registry.by_name("LoginRequest").unwrap().clone());
        builder.next_block("CircuitInfo").unwrap();
        builder.add("IP", Value::IpAddr(Ipv4Addr::LOCALHOST)).unwrap();
        builder.add("Port", Value::Port(9000)).unwrap();
        builder.next_block("LoginInfo").unwrap();

        let oversized = Bytes::from(vec![b'x'; 300]);
        assert!(builder.add("UserName", Value::Variable(oversized)).is_err());
    }
}
