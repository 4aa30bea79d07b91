//! Packed resource tokens and the physical resource mapping table.
//!
//! A token packs the resource type and the 24-bit PUID into one word:
//! `token = (type << 24) | puid`. The top of the PUID space is reserved for
//! the invalid sentinels; `TableNotBound` takes precedence over
//! `OutOfBounds` when both would apply.

use aegis_ir::emitter::Emitter;
use aegis_ir::inst::ResourceProperty;
use aegis_ir::Id;

pub const PUID_BIT_COUNT: u32 = 24;
pub const PUID_MASK: u32 = (1 << PUID_BIT_COUNT) - 1;
pub const TYPE_SHIFT: u32 = PUID_BIT_COUNT;

/// Reserved PUIDs, descending precedence from the top of the space.
pub const PUID_INVALID_TABLE_NOT_BOUND: u32 = PUID_MASK;
pub const PUID_INVALID_OUT_OF_BOUNDS: u32 = PUID_MASK - 1;
pub const PUID_INVALID_UNDEFINED: u32 = PUID_MASK - 2;
/// First reserved value; any PUID at or above this is invalid.
pub const PUID_INVALID_START: u32 = PUID_INVALID_UNDEFINED;

/// Resource type carried in the token's top bits.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u32)]
pub enum ResourceTokenType {
    Buffer = 0,
    Texture = 1,
    Sampler = 2,
    Cbv = 3,
}

impl ResourceTokenType {
    pub fn from_u32(value: u32) -> ResourceTokenType {
        match value & 0x3 {
            0 => ResourceTokenType::Buffer,
            1 => ResourceTokenType::Texture,
            2 => ResourceTokenType::Sampler,
            _ => ResourceTokenType::Cbv,
        }
    }
}

pub fn pack_token(ty: ResourceTokenType, puid: u32) -> u32 {
    debug_assert!(puid <= PUID_MASK);
    ((ty as u32) << TYPE_SHIFT) | (puid & PUID_MASK)
}

pub fn token_type(token: u32) -> ResourceTokenType {
    ResourceTokenType::from_u32(token >> TYPE_SHIFT)
}

pub fn token_puid(token: u32) -> u32 {
    token & PUID_MASK
}

/// Token of an unbound descriptor table entry.
pub fn table_not_bound_token() -> u32 {
    PUID_INVALID_TABLE_NOT_BOUND
}

// ---------------------------------------------------------------------------
// PRMT

/// Sentinel for the descriptor-data offset dword of an unbound table.
pub const NULL_OFFSET: u32 = !0;

/// Per-set descriptor data constants: dword 0 is the offset into the PRMT,
/// dword 1 the length in the PRMT.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DescriptorSetData {
    pub prmt_offset: u32,
    pub length: u32,
}

impl DescriptorSetData {
    pub fn unbound() -> DescriptorSetData {
        DescriptorSetData { prmt_offset: NULL_OFFSET, length: 0 }
    }

    pub fn is_bound(&self) -> bool {
        self.prmt_offset != NULL_OFFSET
    }
}

/// Physical resource mapping table: tokens indexed by
/// `descriptor_set_offset + descriptor_offset`, maintained synchronously
/// with descriptor writes.
#[derive(Clone, Debug, Default)]
pub struct Prmt {
    tokens: Vec<u32>,
}

impl Prmt {
    pub fn new() -> Prmt {
        Default::default()
    }

    pub fn with_capacity(entries: usize) -> Prmt {
        Prmt { tokens: vec![table_not_bound_token(); entries] }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Mirror a descriptor write.
    pub fn write(&mut self, index: u32, token: u32) {
        let index = index as usize;
        if index >= self.tokens.len() {
            self.tokens.resize(index + 1, table_not_bound_token());
        }
        self.tokens[index] = token;
    }

    /// Token at a descriptor slot; out-of-table reads surface the
    /// out-of-bounds sentinel, unbound slots the table-not-bound sentinel.
    pub fn read(&self, set: DescriptorSetData, offset: u32) -> u32 {
        if !set.is_bound() {
            return PUID_INVALID_TABLE_NOT_BOUND;
        }
        if offset >= set.length {
            return PUID_INVALID_OUT_OF_BOUNDS;
        }
        self.tokens
            .get((set.prmt_offset + offset) as usize)
            .copied()
            .unwrap_or(PUID_INVALID_OUT_OF_BOUNDS)
    }
}

// ---------------------------------------------------------------------------
// Token field emission

/// Token fields surfaced as IR values. Emitted once per instrumented
/// instruction and shared by the address and guard arithmetic.
#[derive(Copy, Clone, Debug)]
pub struct TokenFields {
    pub packed: Id,
    pub token_type: Id,
    pub puid: Id,
    pub width: Id,
    pub height: Id,
    pub depth_or_slices: Id,
    pub mip_count: Id,
    pub format_size: Id,
    pub view_format_size: Id,
    pub view_width: Id,
    pub view_base_width: Id,
    pub view_base_mip: Id,
    pub view_base_slice: Id,
    pub byte_count: Id,
}

/// Emits the token and descriptor fields of a resource as IR values.
pub struct ResourceTokenEmitter;

impl ResourceTokenEmitter {
    /// Emit the packed token only.
    pub fn packed_token(emitter: &mut Emitter, resource: Id) -> Id {
        emitter.resource_token(resource)
    }

    /// Emit the packed token plus its unpacked type and PUID.
    pub fn token(emitter: &mut Emitter, resource: Id) -> (Id, Id, Id) {
        let packed = emitter.resource_token(resource);
        let shift = emitter.u32(TYPE_SHIFT);
        let token_type = emitter.bit_shift_right(packed, shift);
        let mask = emitter.u32(PUID_MASK);
        let puid = emitter.bit_and(packed, mask);
        (packed, token_type, puid)
    }

    /// Emit every field the texel addressing math consumes.
    pub fn fields(emitter: &mut Emitter, resource: Id) -> TokenFields {
        let (packed, token_type, puid) = Self::token(emitter, resource);
        TokenFields {
            packed,
            token_type,
            puid,
            width: emitter.resource_property(resource, ResourceProperty::Width),
            height: emitter.resource_property(resource, ResourceProperty::Height),
            depth_or_slices: emitter
                .resource_property(resource, ResourceProperty::DepthOrSliceCount),
            mip_count: emitter.resource_property(resource, ResourceProperty::MipCount),
            format_size: emitter.resource_property(resource, ResourceProperty::FormatSize),
            view_format_size: emitter
                .resource_property(resource, ResourceProperty::ViewFormatSize),
            view_width: emitter.resource_property(resource, ResourceProperty::ViewWidth),
            view_base_width: emitter
                .resource_property(resource, ResourceProperty::ViewBaseWidth),
            view_base_mip: emitter.resource_property(resource, ResourceProperty::ViewBaseMip),
            view_base_slice: emitter
                .resource_property(resource, ResourceProperty::ViewBaseSlice),
            byte_count: emitter.resource_property(resource, ResourceProperty::ByteCount),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trips() {
        let token = pack_token(ResourceTokenType::Texture, 0x1234);
        assert_eq!(token_type(token), ResourceTokenType::Texture);
        assert_eq!(token_puid(token), 0x1234);
    }

    #[test]
    fn sentinels_sit_at_the_top_of_the_puid_space() {
        assert!(PUID_INVALID_UNDEFINED < PUID_INVALID_OUT_OF_BOUNDS);
        assert!(PUID_INVALID_OUT_OF_BOUNDS < PUID_INVALID_TABLE_NOT_BOUND);
        assert_eq!(PUID_INVALID_START, PUID_INVALID_UNDEFINED);
    }

    #[test]
    fn prmt_precedence_table_not_bound_over_out_of_bounds() {
        let mut prmt = Prmt::with_capacity(4);
        prmt.write(0, pack_token(ResourceTokenType::Buffer, 7));

        // Unbound table wins even when the offset is also out of range.
        let unbound = DescriptorSetData::unbound();
        assert_eq!(token_puid(prmt.read(unbound, 99)), PUID_INVALID_TABLE_NOT_BOUND);

        let bound = DescriptorSetData { prmt_offset: 0, length: 1 };
        assert_eq!(token_puid(prmt.read(bound, 0)), 7);
        assert_eq!(token_puid(prmt.read(bound, 1)), PUID_INVALID_OUT_OF_BOUNDS);
    }
}
