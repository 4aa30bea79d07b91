//! Texel address arithmetic: maps logical resource coordinates onto the
//! per-resource bit-mask region.
//!
//! The allocator reserves power-of-two rounded dimensions, so mip and slice
//! offsets reduce to the closed form `(w*h - mw*mh) * 2^d / (2^d - 1)`.
//! Every coordinate is clamped before use; the out-of-bounds flag is the
//! disjunction of the unclamped comparisons, so wild accesses hash into a
//! valid texel bit but stay flagged.

use crate::token::TokenFields;
use aegis_ir::emitter::Emitter;
use aegis_ir::Id;

/// The computed address: clamped coordinates, the word-linear texel offset,
/// the runtime texel count of the view, and the guard flag.
#[derive(Copy, Clone, Debug)]
pub struct TexelAddress {
    pub x: Id,
    pub y: Id,
    pub z: Id,
    pub mip: Id,
    pub texel_offset: Id,
    pub texel_count: Id,
    pub is_out_of_bounds: Id,
}

/// Pure arithmetic generator over an emitter and a resource's token fields.
pub struct TexelAddressEmitter<'t> {
    token: &'t TokenFields,
    /// Power-of-two aligned dimensions, cached across calls.
    width_p2: Id,
    height_p2: Id,
    depth_p2: Id,
}

struct MipData {
    offset: Id,
    mip_width: Id,
    mip_height: Id,
}

impl<'t> TexelAddressEmitter<'t> {
    pub fn new(emitter: &mut Emitter, token: &'t TokenFields) -> TexelAddressEmitter<'t> {
        let width_p2 = align_pow2_upper(emitter, token.width);
        let height_p2 = align_pow2_upper(emitter, token.height);
        let depth_p2 = align_pow2_upper(emitter, token.depth_or_slices);
        TexelAddressEmitter { token, width_p2, height_p2, depth_p2 }
    }

    /// Buffer addressing with format expansion and contraction. `x` is the
    /// element index as typed by the view, `byte_offset` the view's byte
    /// offset into the resource.
    pub fn local_buffer_texel_address(
        &self,
        emitter: &mut Emitter,
        x: Id,
        byte_offset: Id,
    ) -> TexelAddress {
        let zero = emitter.u32(0);
        let one = emitter.u32(1);

        let format_size = self.token.format_size;
        let view_format_size = self.token.view_format_size;

        // Unclamped guard first; the clamped index hashes into a live bit.
        let is_out_of_bounds = emitter.greater_than_equal(x, self.token.view_width);
        let view_limit = emitter.sub(self.token.view_width, one);
        let view_limit = emitter.umax(view_limit, zero);
        let x = emitter.umin(x, view_limit);

        // expansion = F == 0 ? V : V / F
        let format_nonzero = emitter.umax(format_size, one);
        let format_is_zero = emitter.equal(format_size, zero);
        let expansion_ratio = emitter.div(view_format_size, format_nonzero);
        let expansion = emitter.select(format_is_zero, view_format_size, expansion_ratio);

        // contraction = V == 0 ? F : F / V
        let view_nonzero = emitter.umax(view_format_size, one);
        let view_is_zero = emitter.equal(view_format_size, zero);
        let contraction_ratio = emitter.div(format_size, view_nonzero);
        let contraction = emitter.select(view_is_zero, format_size, contraction_ratio);

        // source = V > F ? x * expansion : x / contraction
        let expanded = emitter.mul(x, expansion);
        let contraction_nonzero = emitter.umax(contraction, one);
        let contracted = emitter.div(x, contraction_nonzero);
        let view_wider = emitter.greater_than(view_format_size, format_size);
        let source = emitter.select(view_wider, expanded, contracted);

        // Byte offset and total count in resource elements.
        let byte_element = emitter.div(byte_offset, format_nonzero);
        let source = emitter.add(source, byte_element);
        let source = emitter.add(source, self.token.view_base_width);
        let texel_count = emitter.div(self.token.byte_count, format_nonzero);

        TexelAddress {
            x: source,
            y: zero,
            z: zero,
            mip: zero,
            texel_offset: source,
            texel_count,
            is_out_of_bounds,
        }
    }

    /// Texture addressing. Sliced resources scale the subresource base by a
    /// single mip chain's size; volumetric resources mip their depth axis.
    pub fn local_texture_texel_address(
        &self,
        emitter: &mut Emitter,
        x: Id,
        y: Id,
        z: Id,
        mip: Id,
        volumetric: bool,
    ) -> TexelAddress {
        let one = emitter.u32(1);

        // Guard against the mip-scaled logical bounds.
        let (x, oob_x) = self.clamp_axis(emitter, x, self.token.width, mip);
        let (y, oob_y) = self.clamp_axis(emitter, y, self.token.height, mip);
        let (z, oob_z) = if volumetric {
            self.clamp_axis(emitter, z, self.token.depth_or_slices, mip)
        } else {
            // Slices do not scale with the mip level.
            let limit = emitter.sub(self.token.depth_or_slices, one);
            let oob = emitter.greater_than(z, limit);
            let clamped = emitter.umin(z, limit);
            (clamped, oob)
        };
        let oob = emitter.or(oob_x, oob_y);
        let is_out_of_bounds = emitter.or(oob, oob_z);

        let mip = emitter.add(mip, self.token.view_base_mip);

        let texel_offset;
        if volumetric {
            let mip_data = self.mip_offset_3d(emitter, mip);

            // z * mw * mh + y * mw + x
            let plane = emitter.mul(mip_data.mip_width, mip_data.mip_height);
            let intra = emitter.mul(z, plane);
            let row = emitter.mul(y, mip_data.mip_width);
            let intra = emitter.add(intra, row);
            let intra = emitter.add(intra, x);

            texel_offset = emitter.add(mip_data.offset, intra);
        } else {
            let z = emitter.add(z, self.token.view_base_slice);

            // Slices sit a whole mip chain apart.
            let base = self.slice_offset(emitter, z);
            let mip_data = self.mip_offset_2d(emitter, mip);
            let base = emitter.add(base, mip_data.offset);

            // y * mw + x
            let row = emitter.mul(y, mip_data.mip_width);
            let intra = emitter.add(row, x);

            texel_offset = emitter.add(base, intra);
        }

        let texel_count = self.texture_texel_count(emitter, volumetric);

        TexelAddress { x, y, z, mip, texel_offset, texel_count, is_out_of_bounds }
    }

    /// clamp(v, 0, max(1, extent >> mip) - 1); the unclamped comparison is
    /// the guard bit.
    fn clamp_axis(&self, emitter: &mut Emitter, v: Id, extent: Id, mip: Id) -> (Id, Id) {
        let one = emitter.u32(1);
        let scaled = emitter.bit_shift_right(extent, mip);
        let scaled = emitter.umax(scaled, one);
        let out_of_bounds = emitter.greater_than_equal(v, scaled);
        let limit = emitter.sub(scaled, one);
        let clamped = emitter.umin(v, limit);
        (clamped, out_of_bounds)
    }

    /// Offset of a slice: one aligned 2d mip chain per slice.
    fn slice_offset(&self, emitter: &mut Emitter, slice: Id) -> Id {
        let full = emitter.mul(self.width_p2, self.height_p2);
        let tail_w = emitter.bit_shift_right(self.width_p2, self.token.mip_count);
        let tail_h = emitter.bit_shift_right(self.height_p2, self.token.mip_count);
        let tail = emitter.mul(tail_w, tail_h);
        let difference = emitter.sub(full, tail);
        let chain = mip_offset_from_difference(emitter, difference, 2);
        emitter.mul(chain, slice)
    }

    fn mip_offset_2d(&self, emitter: &mut Emitter, mip: Id) -> MipData {
        let mip_width = emitter.bit_shift_right(self.width_p2, mip);
        let mip_height = emitter.bit_shift_right(self.height_p2, mip);

        let full = emitter.mul(self.width_p2, self.height_p2);
        let tail = emitter.mul(mip_width, mip_height);
        let difference = emitter.sub(full, tail);
        let offset = mip_offset_from_difference(emitter, difference, 2);

        MipData { offset, mip_width, mip_height }
    }

    fn mip_offset_3d(&self, emitter: &mut Emitter, mip: Id) -> MipData {
        let mip_width = emitter.bit_shift_right(self.width_p2, mip);
        let mip_height = emitter.bit_shift_right(self.height_p2, mip);
        let mip_depth = emitter.bit_shift_right(self.depth_p2, mip);

        let full_plane = emitter.mul(self.width_p2, self.height_p2);
        let full = emitter.mul(full_plane, self.depth_p2);
        let tail_plane = emitter.mul(mip_width, mip_height);
        let tail = emitter.mul(tail_plane, mip_depth);
        let difference = emitter.sub(full, tail);
        let offset = mip_offset_from_difference(emitter, difference, 3);

        MipData { offset, mip_width, mip_height }
    }

    /// Runtime texel count of the whole resource region, matching the
    /// allocator's reservation.
    fn texture_texel_count(&self, emitter: &mut Emitter, volumetric: bool) -> Id {
        if volumetric {
            let full_plane = emitter.mul(self.width_p2, self.height_p2);
            let full = emitter.mul(full_plane, self.depth_p2);
            let tw = emitter.bit_shift_right(self.width_p2, self.token.mip_count);
            let th = emitter.bit_shift_right(self.height_p2, self.token.mip_count);
            let td = emitter.bit_shift_right(self.depth_p2, self.token.mip_count);
            let tail_plane = emitter.mul(tw, th);
            let tail = emitter.mul(tail_plane, td);
            let difference = emitter.sub(full, tail);
            mip_offset_from_difference(emitter, difference, 3)
        } else {
            let full = emitter.mul(self.width_p2, self.height_p2);
            let tw = emitter.bit_shift_right(self.width_p2, self.token.mip_count);
            let th = emitter.bit_shift_right(self.height_p2, self.token.mip_count);
            let tail = emitter.mul(tw, th);
            let difference = emitter.sub(full, tail);
            let chain = mip_offset_from_difference(emitter, difference, 2);
            emitter.mul(chain, self.token.depth_or_slices)
        }
    }
}

/// `(difference * 2^d) / (2^d - 1)`, the closed-form chain size of
/// power-of-two aligned dimensions.
fn mip_offset_from_difference(emitter: &mut Emitter, difference: Id, dimensionality: u32) -> Id {
    let scale = emitter.u32(1 << dimensionality);
    let scale_sub_1 = emitter.u32((1 << dimensionality) - 1);
    let scaled = emitter.mul(difference, scale);
    emitter.div(scaled, scale_sub_1)
}

/// `2 << first_bit_high(x - 1)`, with the x == 1 edge kept at 1.
fn align_pow2_upper(emitter: &mut Emitter, x: Id) -> Id {
    let one = emitter.u32(1);
    let two = emitter.u32(2);
    let x_minus_1 = emitter.sub(x, one);
    let high_bit = emitter.first_bit_high(x_minus_1);
    let aligned = emitter.bit_shift_left(two, high_bit);
    let is_one = emitter.equal(x, one);
    emitter.select(is_one, one, aligned)
}

/// Host-side mirror of the aligned texel layout; the allocator sizes
/// regions with this so shader arithmetic and reservations agree.
pub mod layout {
    /// Round up to the next power of two, keeping 1 at 1.
    pub fn align_pow2_upper(x: u32) -> u32 {
        x.max(1).next_power_of_two()
    }

    fn chain_size(difference: u32, dimensionality: u32) -> u32 {
        (difference * (1 << dimensionality)) / ((1 << dimensionality) - 1)
    }

    /// Total texel count of a resource's mask region.
    pub fn texel_count(
        width: u32,
        height: u32,
        depth_or_slices: u32,
        mip_count: u32,
        volumetric: bool,
    ) -> u32 {
        let w = align_pow2_upper(width);
        let h = align_pow2_upper(height);
        let d = align_pow2_upper(depth_or_slices);
        if volumetric {
            let full = w * h * d;
            let tail = (w >> mip_count) * (h >> mip_count) * (d >> mip_count);
            chain_size(full - tail, 3)
        } else {
            let full = w * h;
            let tail = (w >> mip_count) * (h >> mip_count);
            chain_size(full - tail, 2) * depth_or_slices.max(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::layout;

    #[test]
    fn pow2_alignment() {
        assert_eq!(layout::align_pow2_upper(1), 1);
        assert_eq!(layout::align_pow2_upper(2), 2);
        assert_eq!(layout::align_pow2_upper(3), 4);
        assert_eq!(layout::align_pow2_upper(640), 1024);
    }

    #[test]
    fn full_chain_of_single_mip_texture_is_plane_sized() {
        // One mip: chain = (w*h - w/2*h/2) * 4/3 = w*h for pow2 dims.
        assert_eq!(layout::texel_count(8, 8, 1, 1, false), 64 - 16 + 16);
        // 8x8, 1 mip: (64 - 16) * 4 / 3 = 64.
        assert_eq!(layout::texel_count(8, 8, 1, 1, false), 64);
    }

    #[test]
    fn sliced_textures_scale_by_slice_count() {
        let single = layout::texel_count(16, 16, 1, 2, false);
        let sliced = layout::texel_count(16, 16, 6, 2, false);
        assert_eq!(sliced, single * 6);
    }

    #[test]
    fn volumetric_chain() {
        // 8x8x8, 1 mip: (512 - 64) * 8 / 7 = 512.
        assert_eq!(layout::texel_count(8, 8, 8, 1, true), 512);
    }
}
