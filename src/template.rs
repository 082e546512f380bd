use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::error::ProtocolError;
use crate::throttle::ThrottleCategory;

/// Wire types a variable can carry. Scalars are little-endian; `IpAddr` and
///  `Port` are network byte order; `Variable1`/`Variable2` carry a 1- or
///  2-byte length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableType {
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Vector3,
    Vector4,
    Quaternion,
    Uuid,
    IpAddr,
    Port,
    Fixed(usize),
    Variable1,
    Variable2,
}

#[derive(Debug, Clone)]
pub struct VariableSpec {
    pub name: &'static str,
    pub var_type: VariableType,
}

/// How often a block's variable group appears in a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockCardinality {
    Single,
    /// Fixed repetition; the count is template data and not transmitted.
    Multiple(u8),
    /// Sender-chosen repetition; a 1-byte instance count precedes the
    ///  instances on the wire.
    Variable,
}

#[derive(Debug, Clone)]
pub struct BlockSpec {
    pub name: &'static str,
    pub cardinality: BlockCardinality,
    pub variables: Vec<VariableSpec>,
}

/// Immutable descriptor driving both encode and decode of one message kind.
#[derive(Debug, Clone)]
pub struct MessageTemplate {
    pub name: &'static str,
    pub opcode: u32,
    pub reliable: bool,
    pub zero_coded: bool,
    pub throttle_category: ThrottleCategory,
    pub blocks: Vec<BlockSpec>,
}

/// Name and opcode indices over the template catalogue. Populated once at
///  startup; lookups afterwards are read-only and need no locking.
pub struct TemplateRegistry {
    by_name: FxHashMap<&'static str, Arc<MessageTemplate>>,
    by_opcode: FxHashMap<u32, Arc<MessageTemplate>>,
}

impl TemplateRegistry {
    pub fn new(templates: Vec<MessageTemplate>) -> Result<TemplateRegistry, ProtocolError> {
        let mut by_name = FxHashMap::default();
        let mut by_opcode = FxHashMap::default();

        for template in templates {
            let template = Arc::new(template);
            if by_name.insert(template.name, template.clone()).is_some() {
                return Err(ProtocolError::InvalidCatalogue(format!(
                    "duplicate template name {:?}",
                    template.name
                )));
            }
            if by_opcode.insert(template.opcode, template.clone()).is_some() {
                return Err(ProtocolError::InvalidCatalogue(format!(
                    "duplicate opcode {} ({:?})",
                    template.opcode, template.name
                )));
            }
        }

        Ok(TemplateRegistry { by_name, by_opcode })
    }

    /// The standard simulator catalogue.
    pub fn standard() -> TemplateRegistry {
        TemplateRegistry::new(standard_catalogue())
            .expect("the standard catalogue has unique names and opcodes")
    }

    pub fn by_name(&self, name: &str) -> Option<&Arc<MessageTemplate>> {
        self.by_name.get(name)
    }

    pub fn by_opcode(&self, opcode: u32) -> Option<&Arc<MessageTemplate>> {
        self.by_opcode.get(&opcode)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

fn var(name: &'static str, var_type: VariableType) -> VariableSpec {
    VariableSpec { name, var_type }
}

fn single(name: &'static str, variables: Vec<VariableSpec>) -> BlockSpec {
    BlockSpec {
        name,
        cardinality: BlockCardinality::Single,
        variables,
    }
}

fn multiple(name: &'static str, count: u8, variables: Vec<VariableSpec>) -> BlockSpec {
    BlockSpec {
        name,
        cardinality: BlockCardinality::Multiple(count),
        variables,
    }
}

fn standard_catalogue() -> Vec<MessageTemplate> {
    use VariableType::*;

    vec![
        MessageTemplate {
            name: "StartPingCheck",
            opcode: 1,
            reliable: true,
            zero_coded: false,
            throttle_category: ThrottleCategory::Task,
            blocks: vec![single(
                "PingID",
                vec![var("PingID", U8), var("OldestUnacked", U32)],
            )],
        },
        MessageTemplate {
            name: "CompletePingCheck",
            opcode: 2,
            reliable: true,
            zero_coded: false,
            throttle_category: ThrottleCategory::Task,
            blocks: vec![single("PingID", vec![var("PingID", U8)])],
        },
        MessageTemplate {
            name: "LoginRequest",
            opcode: 3,
            reliable: true,
            zero_coded: false,
            throttle_category: ThrottleCategory::Task,
            blocks: vec![
                single("CircuitInfo", vec![var("IP", IpAddr), var("Port", Port)]),
                single(
                    "LoginInfo",
                    vec![
                        var("UserName", Variable1),
                        var("Password", Variable1),
                        var("Start", Variable1),
                    ],
                ),
            ],
        },
        MessageTemplate {
            name: "LoginReply",
            opcode: 4,
            reliable: true,
            zero_coded: false,
            throttle_category: ThrottleCategory::Task,
            blocks: vec![
                single(
                    "AgentData",
                    vec![var("AgentId", Uuid), var("SessionId", Uuid)],
                ),
                single(
                    "LoginInfo",
                    vec![var("Success", U8), var("Message", Variable1)],
                ),
            ],
        },
        MessageTemplate {
            name: "ChatFromViewer",
            opcode: 80,
            reliable: true,
            zero_coded: false,
            throttle_category: ThrottleCategory::Task,
            blocks: vec![
                single(
                    "AgentData",
                    vec![var("AgentId", Uuid), var("SessionId", Uuid)],
                ),
                single(
                    "ChatData",
                    vec![
                        var("Message", Variable2),
                        var("Type", U8),
                        var("Channel", U32),
                    ],
                ),
            ],
        },
        MessageTemplate {
            name: "ChatFromSimulator",
            opcode: 81,
            reliable: false,
            zero_coded: false,
            throttle_category: ThrottleCategory::Task,
            blocks: vec![single(
                "ChatData",
                vec![
                    var("FromName", Variable1),
                    var("SourceId", Uuid),
                    var("ChatType", U8),
                    var("Audible", U8),
                    var("Position", Vector3),
                    var("Message", Variable2),
                ],
            )],
        },
        MessageTemplate {
            name: "RegionHandshake",
            opcode: 148,
            reliable: false,
            zero_coded: true,
            throttle_category: ThrottleCategory::Land,
            blocks: vec![
                single(
                    "RegionInfo",
                    vec![
                        var("RegionFlags", U32),
                        var("SimAccess", U8),
                        var("SimName", Variable1),
                        var("RegionId", Uuid),
                        var("WaterHeight", F32),
                        var("CacheId", Uuid),
                    ],
                ),
                multiple(
                    "NeighborList",
                    4,
                    vec![var("NeighborIP", IpAddr), var("NeighborPort", Port)],
                ),
            ],
        },
        MessageTemplate {
            name: "RegionHandshakeReply",
            opcode: 149,
            reliable: true,
            zero_coded: true,
            throttle_category: ThrottleCategory::Land,
            blocks: vec![
                single(
                    "AgentData",
                    vec![var("AgentId", Uuid), var("SessionId", Uuid)],
                ),
                single("RegionInfo", vec![var("Flags", U32)]),
            ],
        },
        MessageTemplate {
            name: "UpdateUserInfo",
            opcode: 180,
            reliable: true,
            zero_coded: false,
            throttle_category: ThrottleCategory::Task,
            blocks: vec![
                single(
                    "AgentData",
                    vec![var("AgentId", Uuid), var("SessionId", Uuid)],
                ),
                single(
                    "UserData",
                    vec![
                        var("IMViaEMail", U8),
                        var("DirectoryVisibility", Variable1),
                    ],
                ),
            ],
        },
    ]
}
