//! Mask-bit addressing over the shared texel memory buffer.
//!
//! Every texel owns one bit inside a run of 32-bit atomic words. All
//! helpers take the resource's 32-aligned base word and the intra-resource
//! texel offset, and report only the addressed bit of the previous value.

use aegis_ir::emitter::Emitter;
use aegis_ir::Id;

/// The bit used for block-wise addressing: `1 << (texel_offset % 32)`.
pub fn texel_address_bit(emitter: &mut Emitter, texel_offset: Id) -> Id {
    let thirty_two = emitter.u32(32);
    let one = emitter.u32(1);
    let bit_index = emitter.rem(texel_offset, thirty_two);
    emitter.bit_shift_left(one, bit_index)
}

fn global_element(emitter: &mut Emitter, base_element_align_32: Id, texel_offset: Id) -> Id {
    let thirty_two = emitter.u32(32);
    let element = emitter.div(texel_offset, thirty_two);
    emitter.add(base_element_align_32, element)
}

/// Atomic or of an explicit bit value; returns the previous value masked to
/// that bit.
pub fn atomic_or_texel_address_value(
    emitter: &mut Emitter,
    buffer: Id,
    base_element_align_32: Id,
    texel_offset: Id,
    value: Id,
) -> Id {
    let element = global_element(emitter, base_element_align_32, texel_offset);
    let address = emitter.address_of(buffer, element);
    let previous = emitter.atomic_or(address, value);
    emitter.bit_and(previous, value)
}

/// Atomic or of the texel's bit.
pub fn atomic_or_texel_address(
    emitter: &mut Emitter,
    buffer: Id,
    base_element_align_32: Id,
    texel_offset: Id,
) -> Id {
    let bit = texel_address_bit(emitter, texel_offset);
    atomic_or_texel_address_value(emitter, buffer, base_element_align_32, texel_offset, bit)
}

/// Atomic clear of an explicit bit value.
pub fn atomic_clear_texel_address_value(
    emitter: &mut Emitter,
    buffer: Id,
    base_element_align_32: Id,
    texel_offset: Id,
    value: Id,
) -> Id {
    let element = global_element(emitter, base_element_align_32, texel_offset);
    let inverted = emitter.bit_not(value);
    let address = emitter.address_of(buffer, element);
    let previous = emitter.atomic_and(address, inverted);
    emitter.bit_and(previous, inverted)
}

/// Atomic clear of the texel's bit.
pub fn atomic_clear_texel_address(
    emitter: &mut Emitter,
    buffer: Id,
    base_element_align_32: Id,
    texel_offset: Id,
) -> Id {
    let bit = texel_address_bit(emitter, texel_offset);
    atomic_clear_texel_address_value(emitter, buffer, base_element_align_32, texel_offset, bit)
}

/// Non-atomic read of an explicit bit set.
pub fn read_texel_address_value(
    emitter: &mut Emitter,
    buffer: Id,
    base_element_align_32: Id,
    texel_offset: Id,
    value: Id,
) -> Id {
    let element = global_element(emitter, base_element_align_32, texel_offset);
    let handle = emitter.load(buffer);
    let loaded = emitter.load_buffer(handle, element);
    let zero = emitter.u32(0);
    let word = emitter.extract(loaded, zero);
    emitter.bit_and(word, value)
}

/// Non-atomic read of the texel's bit.
pub fn read_texel_address(
    emitter: &mut Emitter,
    buffer: Id,
    base_element_align_32: Id,
    texel_offset: Id,
) -> Id {
    let bit = texel_address_bit(emitter, texel_offset);
    read_texel_address_value(emitter, buffer, base_element_align_32, texel_offset, bit)
}

/// Whole-word write at a block offset; the copy kernels stream mask words
/// with this.
pub fn write_texel_address_block(
    emitter: &mut Emitter,
    buffer: Id,
    base_element_align_32: Id,
    block_offset: Id,
    value: Id,
) {
    let element = emitter.add(base_element_align_32, block_offset);
    let handle = emitter.load(buffer);
    emitter.store_buffer(handle, element, value);
}

/// Number of mask words an operation spanning `texel_count` texels may
/// touch. Anything past one texel can straddle a word boundary.
pub fn atomic_block_count(texel_count: u32) -> u32 {
    if texel_count == 1 {
        return 1;
    }
    1 + (texel_count + 31) / 32
}

/// How region results fold across blocks.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegionCombiner {
    /// Side effects only.
    Ignore,
    /// Bit-or all previous values.
    BitOr,
    /// True when any fetched value differs from its expected mask.
    AnyNotEqual,
}

/// Apply `op` across the mask words covering `[texel_offset,
/// texel_offset + texel_count)`. The compile-time count unrolls the blocks;
/// the runtime count trims the per-block masks, so out-of-bounds regions
/// degenerate to no-ops.
pub fn op_texel_address_region(
    emitter: &mut Emitter,
    op: &mut dyn FnMut(&mut Emitter, Id, Id, Id, Id) -> Id,
    buffer: Id,
    base_element_align_32: Id,
    texel_offset: Id,
    texel_count_literal: u32,
    texel_count_runtime: Id,
    combiner: RegionCombiner,
) -> Id {
    let default = match combiner {
        RegionCombiner::Ignore => Id::INVALID,
        RegionCombiner::BitOr => emitter.u32(0),
        RegionCombiner::AnyNotEqual => emitter.bool(false),
    };

    if texel_count_literal == 0 {
        return default;
    }

    let combine = |emitter: &mut Emitter, last: Id, value: Id, mask: Id| -> Id {
        match combiner {
            RegionCombiner::Ignore => Id::INVALID,
            RegionCombiner::BitOr => emitter.bit_or(last, value),
            RegionCombiner::AnyNotEqual => {
                let differs = emitter.not_equal(value, mask);
                emitter.or(last, differs)
            }
        }
    };

    let zero = emitter.u32(0);
    let thirty_two = emitter.u32(32);
    let full_mask = emitter.u32(!0u32);

    // Fast path: one texel, one bit.
    if texel_count_literal == 1 {
        let bit = texel_address_bit(emitter, texel_offset);

        // The runtime count still collapses to zero when out of bounds.
        let count_is_zero = emitter.equal(texel_count_runtime, zero);
        let bit = emitter.select(count_is_zero, zero, bit);

        let previous = op(emitter, buffer, base_element_align_32, texel_offset, bit);
        return combine(emitter, default, previous, bit);
    }

    let block_count = atomic_block_count(texel_count_literal);

    let mut result = default;
    let mut texel_offset = texel_offset;
    let mut texels_written = zero;

    for _ in 0..block_count {
        let bit_index = emitter.rem(texel_offset, thirty_two);

        // remaining = runtime_count - written
        let remaining = emitter.sub(texel_count_runtime, texels_written);

        // remaining < 32 ? ~0 >> (32 - remaining) : ~0
        let shift = emitter.sub(thirty_two, remaining);
        let partial = emitter.bit_shift_right(full_mask, shift);
        let is_partial = emitter.less_than(remaining, thirty_two);
        let mask = emitter.select(is_partial, partial, full_mask);

        let mask = emitter.bit_shift_left(mask, bit_index);

        // Past the runtime end the mask collapses.
        let exhausted = emitter.greater_than_equal(texels_written, texel_count_runtime);
        let mask = emitter.select(exhausted, zero, mask);

        let previous = op(emitter, buffer, base_element_align_32, texel_offset, mask);
        result = combine(emitter, result, previous, mask);

        // Step to the next word boundary.
        let region_width = emitter.sub(thirty_two, bit_index);
        texel_offset = emitter.add(texel_offset, region_width);
        texels_written = emitter.add(texels_written, region_width);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_counts() {
        assert_eq!(atomic_block_count(1), 1);
        assert_eq!(atomic_block_count(2), 2);
        assert_eq!(atomic_block_count(32), 2);
        assert_eq!(atomic_block_count(33), 3);
        assert_eq!(atomic_block_count(64), 3);
    }
}
