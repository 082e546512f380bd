use std::net::Ipv4Addr;

use bytes::Bytes;
use uuid::Uuid;

use crate::template::VariableType;

/// A decoded variable, or one queued for encoding. Variants correspond one to
///  one with [VariableType]; fixed-width integers and floats are little-endian
///  on the wire, IP addresses and ports network byte order.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Vector3([f32; 3]),
    Vector4([f32; 4]),
    Quaternion([f32; 4]),
    Uuid(Uuid),
    IpAddr(Ipv4Addr),
    Port(u16),
    Fixed(Bytes),
    Variable(Bytes),
}

impl Value {
    pub fn matches(&self, var_type: &VariableType) -> bool {
        match (self, var_type) {
            (Value::U8(_), VariableType::U8) => true,
            (Value::U16(_), VariableType::U16) => true,
            (Value::U32(_), VariableType::U32) => true,
            (Value::U64(_), VariableType::U64) => true,
            (Value::F32(_), VariableType::F32) => true,
            (Value::F64(_), VariableType::F64) => true,
            (Value::Vector3(_), VariableType::Vector3) => true,
            (Value::Vector4(_), VariableType::Vector4) => true,
            (Value::Quaternion(_), VariableType::Quaternion) => true,
            (Value::Uuid(_), VariableType::Uuid) => true,
            (Value::IpAddr(_), VariableType::IpAddr) => true,
            (Value::Port(_), VariableType::Port) => true,
            (Value::Fixed(data), VariableType::Fixed(len)) => data.len() == *len,
            (Value::Variable(_), VariableType::Variable1) => true,
            (Value::Variable(_), VariableType::Variable2) => true,
            _ => false,
        }
    }

    pub fn as_u8(&self) -> Option<u8> {
        match self {
            Value::U8(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::U32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Value::F32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Value::Uuid(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Fixed(data) | Value::Variable(data) => Some(data),
            _ => None,
        }
    }

    /// Variable-length data interpreted as UTF-8, for chat-style payloads.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|data| std::str::from_utf8(data).ok())
    }
}
