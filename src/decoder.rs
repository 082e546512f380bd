use std::sync::Arc;

use bytes::Buf;
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::template::{BlockCardinality, MessageTemplate, VariableType};
use crate::value::Value;

/// A fully decoded inbound message: block instances in wire order, each with
///  its variables in template order.
#[derive(Debug, Clone)]
pub struct DecodedMessage {
    pub template: Arc<MessageTemplate>,
    pub blocks: Vec<DecodedBlock>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBlock {
    pub name: &'static str,
    pub variables: Vec<(&'static str, Value)>,
}

impl DecodedMessage {
    pub fn name(&self) -> &'static str {
        self.template.name
    }

    /// First instance of the named block.
    pub fn block(&self, name: &str) -> Option<&DecodedBlock> {
        self.blocks.iter().find(|block| block.name == name)
    }

    /// All instances of the named block, for repeating blocks.
    pub fn block_instances<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a DecodedBlock> {
        self.blocks.iter().filter(move |block| block.name == name)
    }
}

impl DecodedBlock {
    pub fn get(&self, variable: &str) -> Option<&Value> {
        self.variables
            .iter()
            .find(|(name, _)| *name == variable)
            .map(|(_, value)| value)
    }
}

/// Decodes a (zero-decoded) payload region against its template. The payload
///  must be consumed exactly; trailing bytes mean the datagram does not match
///  the template and are rejected.
pub fn decode_payload(
    template: &Arc<MessageTemplate>,
    buf: &mut impl Buf,
) -> Result<DecodedMessage, ProtocolError> {
    let mut blocks = Vec::new();

    for block_spec in &template.blocks {
        let instances = match block_spec.cardinality {
            BlockCardinality::Single => 1,
            BlockCardinality::Multiple(count) => count,
            BlockCardinality::Variable => buf.try_get_u8().map_err(|_| {
                ProtocolError::MalformedPayload(format!(
                    "missing instance count for block {:?}",
                    block_spec.name
                ))
            })?,
        };

        for _ in 0..instances {
            let mut variables = Vec::with_capacity(block_spec.variables.len());
            for var_spec in &block_spec.variables {
                let value = decode_value(buf, &var_spec.var_type).map_err(|e| {
                    ProtocolError::MalformedPayload(format!(
                        "variable {:?} in block {:?}: {}",
                        var_spec.name, block_spec.name, e
                    ))
                })?;
                variables.push((var_spec.name, value));
            }
            blocks.push(DecodedBlock {
                name: block_spec.name,
                variables,
            });
        }
    }

    if buf.has_remaining() {
        return Err(ProtocolError::MalformedPayload(format!(
            "{} trailing bytes after payload",
            buf.remaining()
        )));
    }

    Ok(DecodedMessage {
        template: template.clone(),
        blocks,
    })
}

fn decode_value(buf: &mut impl Buf, var_type: &VariableType) -> Result<Value, String> {
    let truncated = |_| "truncated".to_owned();

    let value = match var_type {
        VariableType::U8 => Value::U8(buf.try_get_u8().map_err(truncated)?),
        VariableType::U16 => Value::U16(buf.try_get_u16_le().map_err(truncated)?),
        VariableType::U32 => Value::U32(buf.try_get_u32_le().map_err(truncated)?),
        VariableType::U64 => Value::U64(buf.try_get_u64_le().map_err(truncated)?),
        VariableType::F32 => Value::F32(f32::from_bits(buf.try_get_u32_le().map_err(truncated)?)),
        VariableType::F64 => Value::F64(f64::from_bits(buf.try_get_u64_le().map_err(truncated)?)),
        VariableType::Vector3 => Value::Vector3(decode_f32_array::<3>(buf)?),
        VariableType::Vector4 => Value::Vector4(decode_f32_array::<4>(buf)?),
        VariableType::Quaternion => Value::Quaternion(decode_f32_array::<4>(buf)?),
        VariableType::Uuid => {
            if buf.remaining() < 16 {
                return Err("truncated".to_owned());
            }
            let mut raw = [0u8; 16];
            buf.copy_to_slice(&mut raw);
            Value::Uuid(Uuid::from_bytes(raw))
        }
        VariableType::IpAddr => {
            // network byte order
            let bits = buf.try_get_u32().map_err(truncated)?;
            Value::IpAddr(std::net::Ipv4Addr::from(bits))
        }
        VariableType::Port => Value::Port(buf.try_get_u16().map_err(truncated)?),
        VariableType::Fixed(len) => {
            if buf.remaining() < *len {
                return Err("truncated".to_owned());
            }
            Value::Fixed(buf.copy_to_bytes(*len))
        }
        VariableType::Variable1 => {
            let len = buf.try_get_u8().map_err(truncated)? as usize;
            if buf.remaining() < len {
                return Err("truncated".to_owned());
            }
            Value::Variable(buf.copy_to_bytes(len))
        }
        VariableType::Variable2 => {
            let len = buf.try_get_u16_le().map_err(truncated)? as usize;
            if buf.remaining() < len {
                return Err("truncated".to_owned());
            }
            Value::Variable(buf.copy_to_bytes(len))
        }
    };
    Ok(value)
}

fn decode_f32_array<const N: usize>(buf: &mut impl Buf) -> Result<[f32; N], String> {
    let mut out = [0.0f32; N];
    for slot in &mut out {
        *slot = f32::from_bits(
            buf.try_get_u32_le()
                .map_err(|_| "truncated".to_owned())?,
        );
    }
    Ok(out)
}
