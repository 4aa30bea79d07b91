//! Exported message schemas.
//!
//! Every record begins with a 32-bit header `(export_id << 6) | type_id`
//! followed by a fixed, schema-specific payload. Schemas never change width
//! at runtime, so the host decoder can walk a ring without a length prefix.

use smallvec::SmallVec;

/// Host-allocated 26-bit identifier naming a message schema instance.
pub type ExportId = u32;

pub const TYPE_ID_BITS: u32 = 6;
pub const TYPE_ID_MASK: u32 = (1 << TYPE_ID_BITS) - 1;
pub const EXPORT_ID_LIMIT: u32 = 1 << (32 - TYPE_ID_BITS);

/// Schema discriminator carried in the low header bits.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u32)]
pub enum MessageType {
    DescriptorMismatch = 0,
    ResourceIndexOutOfBounds = 1,
    ResourceRaceCondition = 2,
    TexelInitialization = 3,
    ExportUnstable = 4,
    DivergentResourceIndexing = 5,
    WaterfallingCondition = 6,
}

impl MessageType {
    pub fn from_u32(value: u32) -> Option<MessageType> {
        Some(match value {
            0 => MessageType::DescriptorMismatch,
            1 => MessageType::ResourceIndexOutOfBounds,
            2 => MessageType::ResourceRaceCondition,
            3 => MessageType::TexelInitialization,
            4 => MessageType::ExportUnstable,
            5 => MessageType::DivergentResourceIndexing,
            6 => MessageType::WaterfallingCondition,
            _ => return None,
        })
    }

    /// Payload width in words, excluding the header.
    pub fn payload_words(self) -> usize {
        match self {
            MessageType::DescriptorMismatch => 6,
            MessageType::ResourceIndexOutOfBounds => 7,
            MessageType::ResourceRaceCondition => 6,
            MessageType::TexelInitialization => 6,
            MessageType::ExportUnstable => 2,
            MessageType::DivergentResourceIndexing => 2,
            MessageType::WaterfallingCondition => 2,
        }
    }

    /// Total record width in words, including the header.
    pub fn record_words(self) -> usize {
        self.payload_words() + 1
    }
}

pub fn pack_header(export_id: ExportId, message_type: MessageType) -> u32 {
    debug_assert!(export_id < EXPORT_ID_LIMIT);
    (export_id << TYPE_ID_BITS) | message_type as u32
}

pub fn unpack_header(header: u32) -> (ExportId, u32) {
    (header >> TYPE_ID_BITS, header & TYPE_ID_MASK)
}

// ---------------------------------------------------------------------------
// Message payloads

/// Compile-time descriptor type against the runtime token disagrees, or the
/// token carries a reserved PUID.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct DescriptorMismatchMessage {
    pub sguid: u32,
    pub compile_type: u32,
    pub runtime_type: u32,
    pub is_undefined: u32,
    pub is_out_of_bounds: u32,
    pub token: u32,
}

/// A resource access indexed past the bound descriptor's extent.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct ResourceIndexOutOfBoundsMessage {
    pub sguid: u32,
    pub is_texture: u32,
    pub is_write: u32,
    pub token: u32,
    pub coordinate: [u32; 3],
}

/// Two invocations touched the same texel without intervening
/// synchronization.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct ResourceRaceConditionMessage {
    pub sguid: u32,
    pub token: u32,
    pub coordinate: [u32; 3],
    pub mip: u32,
}

/// A texel was read before any initialization event touched it.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct TexelInitializationMessage {
    pub sguid: u32,
    pub token: u32,
    pub coordinate: [u32; 3],
    pub mip: u32,
}

/// A stage export produced a NaN or infinity.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct ExportUnstableMessage {
    pub sguid: u32,
    /// 1 = NaN, 2 = Inf.
    pub kind: u32,
}

/// A descriptor-indexed resource access diverged within a wave at runtime.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct DivergentResourceIndexingMessage {
    pub sguid: u32,
    pub pad: u32,
}

/// Compile-time waterfalling hazard on function-space indexing.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct WaterfallingConditionMessage {
    pub sguid: u32,
    pub varying_operand_index: u32,
}

/// A decoded record.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum DecodedMessage {
    DescriptorMismatch(DescriptorMismatchMessage),
    ResourceIndexOutOfBounds(ResourceIndexOutOfBoundsMessage),
    ResourceRaceCondition(ResourceRaceConditionMessage),
    TexelInitialization(TexelInitializationMessage),
    ExportUnstable(ExportUnstableMessage),
    DivergentResourceIndexing(DivergentResourceIndexingMessage),
    WaterfallingCondition(WaterfallingConditionMessage),
}

impl DecodedMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            DecodedMessage::DescriptorMismatch(_) => MessageType::DescriptorMismatch,
            DecodedMessage::ResourceIndexOutOfBounds(_) => MessageType::ResourceIndexOutOfBounds,
            DecodedMessage::ResourceRaceCondition(_) => MessageType::ResourceRaceCondition,
            DecodedMessage::TexelInitialization(_) => MessageType::TexelInitialization,
            DecodedMessage::ExportUnstable(_) => MessageType::ExportUnstable,
            DecodedMessage::DivergentResourceIndexing(_) => {
                MessageType::DivergentResourceIndexing
            }
            DecodedMessage::WaterfallingCondition(_) => MessageType::WaterfallingCondition,
        }
    }

    pub fn sguid(&self) -> u32 {
        match self {
            DecodedMessage::DescriptorMismatch(m) => m.sguid,
            DecodedMessage::ResourceIndexOutOfBounds(m) => m.sguid,
            DecodedMessage::ResourceRaceCondition(m) => m.sguid,
            DecodedMessage::TexelInitialization(m) => m.sguid,
            DecodedMessage::ExportUnstable(m) => m.sguid,
            DecodedMessage::DivergentResourceIndexing(m) => m.sguid,
            DecodedMessage::WaterfallingCondition(m) => m.sguid,
        }
    }

    /// Resource token, for schemas that carry one.
    pub fn token(&self) -> Option<u32> {
        match self {
            DecodedMessage::DescriptorMismatch(m) => Some(m.token),
            DecodedMessage::ResourceIndexOutOfBounds(m) => Some(m.token),
            DecodedMessage::ResourceRaceCondition(m) => Some(m.token),
            DecodedMessage::TexelInitialization(m) => Some(m.token),
            _ => None,
        }
    }

    pub fn coordinate(&self) -> [u32; 3] {
        match self {
            DecodedMessage::ResourceIndexOutOfBounds(m) => m.coordinate,
            DecodedMessage::ResourceRaceCondition(m) => m.coordinate,
            DecodedMessage::TexelInitialization(m) => m.coordinate,
            _ => [0; 3],
        }
    }

    pub fn encode(&self) -> SmallVec<[u32; 8]> {
        let mut out = SmallVec::new();
        match self {
            DecodedMessage::DescriptorMismatch(m) => out.extend_from_slice(&[
                m.sguid,
                m.compile_type,
                m.runtime_type,
                m.is_undefined,
                m.is_out_of_bounds,
                m.token,
            ]),
            DecodedMessage::ResourceIndexOutOfBounds(m) => out.extend_from_slice(&[
                m.sguid,
                m.is_texture,
                m.is_write,
                m.token,
                m.coordinate[0],
                m.coordinate[1],
                m.coordinate[2],
            ]),
            DecodedMessage::ResourceRaceCondition(m) => out.extend_from_slice(&[
                m.sguid,
                m.token,
                m.coordinate[0],
                m.coordinate[1],
                m.coordinate[2],
                m.mip,
            ]),
            DecodedMessage::TexelInitialization(m) => out.extend_from_slice(&[
                m.sguid,
                m.token,
                m.coordinate[0],
                m.coordinate[1],
                m.coordinate[2],
                m.mip,
            ]),
            DecodedMessage::ExportUnstable(m) => out.extend_from_slice(&[m.sguid, m.kind]),
            DecodedMessage::DivergentResourceIndexing(m) => {
                out.extend_from_slice(&[m.sguid, m.pad])
            }
            DecodedMessage::WaterfallingCondition(m) => {
                out.extend_from_slice(&[m.sguid, m.varying_operand_index])
            }
        }
        debug_assert_eq!(out.len(), self.message_type().payload_words());
        out
    }

    pub fn decode(message_type: MessageType, payload: &[u32]) -> Option<DecodedMessage> {
        if payload.len() < message_type.payload_words() {
            return None;
        }
        Some(match message_type {
            MessageType::DescriptorMismatch => {
                DecodedMessage::DescriptorMismatch(DescriptorMismatchMessage {
                    sguid: payload[0],
                    compile_type: payload[1],
                    runtime_type: payload[2],
                    is_undefined: payload[3],
                    is_out_of_bounds: payload[4],
                    token: payload[5],
                })
            }
            MessageType::ResourceIndexOutOfBounds => {
                DecodedMessage::ResourceIndexOutOfBounds(ResourceIndexOutOfBoundsMessage {
                    sguid: payload[0],
                    is_texture: payload[1],
                    is_write: payload[2],
                    token: payload[3],
                    coordinate: [payload[4], payload[5], payload[6]],
                })
            }
            MessageType::ResourceRaceCondition => {
                DecodedMessage::ResourceRaceCondition(ResourceRaceConditionMessage {
                    sguid: payload[0],
                    token: payload[1],
                    coordinate: [payload[2], payload[3], payload[4]],
                    mip: payload[5],
                })
            }
            MessageType::TexelInitialization => {
                DecodedMessage::TexelInitialization(TexelInitializationMessage {
                    sguid: payload[0],
                    token: payload[1],
                    coordinate: [payload[2], payload[3], payload[4]],
                    mip: payload[5],
                })
            }
            MessageType::ExportUnstable => DecodedMessage::ExportUnstable(ExportUnstableMessage {
                sguid: payload[0],
                kind: payload[1],
            }),
            MessageType::DivergentResourceIndexing => DecodedMessage::DivergentResourceIndexing(
                DivergentResourceIndexingMessage { sguid: payload[0], pad: payload[1] },
            ),
            MessageType::WaterfallingCondition => DecodedMessage::WaterfallingCondition(
                WaterfallingConditionMessage {
                    sguid: payload[0],
                    varying_operand_index: payload[1],
                },
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_packs_both_fields() {
        let header = pack_header(0x123, MessageType::ResourceRaceCondition);
        let (export_id, type_id) = unpack_header(header);
        assert_eq!(export_id, 0x123);
        assert_eq!(MessageType::from_u32(type_id), Some(MessageType::ResourceRaceCondition));
    }

    #[test]
    fn all_schemas_encode_to_declared_width() {
        let messages = [
            DecodedMessage::DescriptorMismatch(Default::default()),
            DecodedMessage::ResourceIndexOutOfBounds(Default::default()),
            DecodedMessage::ResourceRaceCondition(Default::default()),
            DecodedMessage::TexelInitialization(Default::default()),
            DecodedMessage::ExportUnstable(Default::default()),
            DecodedMessage::DivergentResourceIndexing(Default::default()),
            DecodedMessage::WaterfallingCondition(Default::default()),
        ];
        for message in &messages {
            let payload = message.encode();
            assert_eq!(payload.len(), message.message_type().payload_words());
            let decoded = DecodedMessage::decode(message.message_type(), &payload).unwrap();
            assert_eq!(&decoded, message);
        }
    }
}
