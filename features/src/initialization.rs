//! Initialization validation: per-texel init state in the shared bit mask.
//!
//! Reads check that the texel's bit is set; writes set it. Host-side
//! initialization events (maps, clears, copies, resolves, render-pass
//! stores, discards) mark whole regions through transfer-queue work:
//! region fills for full-resource events, and copy kernels that propagate
//! mask state between resources for copies.

use crate::inject::{
    bind_sguid, export_message, source_of, split_for_guard, visit_user_instructions,
    InstructionRef, TexelPropertiesEmitter,
};
use crate::{
    Feature, FeatureBits, FeatureHooks, FeatureInfo, InstallContext, PassContext, ResourceInfo,
    SubmissionContext,
};
use aegis_addressing::allocator::{TexelMemoryAllocation, TexelMemoryAllocator};
use aegis_addressing::bit_indexing;
use aegis_addressing::texel_address::layout;
use aegis_export::commands::{CommandBuffer, CommandBuilder, ShaderProgramId};
use aegis_export::scheduler::{Queue, Scheduler, SchedulerPrimitiveEvent, SchedulerPrimitiveId};
use aegis_export::schema::{DecodedMessage, ExportId, MessageType};
use aegis_export::shader_data::{ShaderDataBufferInfo, ShaderDataId};
use aegis_export::MessageStore;
use aegis_ir::emitter::Emitter;
use aegis_ir::function::Function;
use aegis_ir::inst::{BranchControlFlow, Op};
use aegis_ir::program::Program;
use aegis_ir::types::{AddressSpace, Format, SamplerMode, TextureDimension, Type};
use fxhash::FxHashMap;
use std::sync::{Arc, Mutex};

/// Copy-kernel parameter block layout, in words.
const PARAM_TEXEL_COUNT: u32 = 0;
const PARAM_SRC_BASE: u32 = 1;
const PARAM_DST_BASE: u32 = 2;
const PARAM_WIDTH: u32 = 3;
const PARAM_HEIGHT: u32 = 4;
const PARAM_WIDTH_P2: u32 = 5;
const PARAM_SLICE_CHAIN: u32 = 6;
const PARAM_WORDS: u32 = 7;

/// Copy-kernel bindings.
const BINDING_MASK: u32 = 0;
const BINDING_PARAMS: u32 = 1;

struct InitAllocation {
    memory: TexelMemoryAllocation,
    info: ResourceInfo,
    /// Incremental mapping: unmapped until something proves the resource is
    /// in use.
    mapped: bool,
}

struct MappingTag {
    puid: u32,
    memory_base_align_32: u32,
}

struct CopyTag {
    source: u32,
    dest: u32,
    /// Symmetric copies stream whole mask words; asymmetric ones walk the
    /// placement dimensions texel by texel.
    symmetric: bool,
}

#[derive(Default)]
struct HookState {
    allocations: FxHashMap<u32, InitAllocation>,
    pending_mapping_queue: Vec<MappingTag>,
    /// PUIDs whose whole mask should be marked initialized.
    pending_blit_queue: Vec<u32>,
    pending_copy_queue: Vec<CopyTag>,
    transfer_counter: u64,
}

pub struct InitializationFeature {
    export_id: ExportId,
    puid_base_buffer: ShaderDataId,
    params_buffer: ShaderDataId,
    copy_symmetric_program: ShaderProgramId,
    copy_asymmetric_program: ShaderProgramId,
    texel_allocator: Option<Arc<TexelMemoryAllocator>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    transfer_primitive: SchedulerPrimitiveId,
    incremental_mapping: bool,
    state: Mutex<HookState>,
    stream: Mutex<Vec<(ExportId, DecodedMessage)>>,
}

impl InitializationFeature {
    pub fn new() -> InitializationFeature {
        InitializationFeature {
            export_id: 0,
            puid_base_buffer: 0,
            params_buffer: 0,
            copy_symmetric_program: 0,
            copy_asymmetric_program: 0,
            texel_allocator: None,
            scheduler: None,
            transfer_primitive: 0,
            incremental_mapping: true,
            state: Mutex::new(HookState::default()),
            stream: Mutex::new(Vec::new()),
        }
    }

    pub fn texel_allocator(&self) -> Option<Arc<TexelMemoryAllocator>> {
        self.texel_allocator.clone()
    }

    /// Build one of the mask copy kernels.
    ///
    /// Symmetric copies move whole mask words. Asymmetric copies walk
    /// `z*W*H + y*W + x` over the placement dimensions of the source and
    /// pair it with the destination's aligned texel address.
    fn build_copy_program(asymmetric: bool) -> Program {
        let mut program = Program::new();
        let void = program.type_void();
        let uint = program.type_u32();
        let mask_type = program.add_type(Type::Buffer {
            elem: uint,
            sampler_mode: SamplerMode::Writable,
            texel_format: Format::R32UInt,
        });
        let params_type = program.add_type(Type::Buffer {
            elem: uint,
            sampler_mode: SamplerMode::Compatible,
            texel_format: Format::R32UInt,
        });
        let mask_var = program.add_variable(mask_type, AddressSpace::Resource, Some(BINDING_MASK));
        let params_var =
            program.add_variable(params_type, AddressSpace::Resource, Some(BINDING_PARAMS));

        let fn_id = program.identifiers.alloc();
        let mut function = Function::new(fn_id, void);
        let entry = function.alloc_block(&mut program.identifiers);
        let body = function.alloc_block(&mut program.identifiers);
        let merge = function.alloc_block(&mut program.identifiers);
        program.add_function(function);
        program.set_entry_point(fn_id);

        let param = |e: &mut Emitter, params: aegis_ir::Id, index: u32| {
            let index = e.u32(index);
            let loaded = e.load_buffer(params, index);
            let zero = e.u32(0);
            e.extract(loaded, zero)
        };

        // entry: bounds test on the linear texel index.
        let (x, params_handle, mask_handle) = {
            let mut e = Emitter::new(&mut program, fn_id, entry);
            let tid = e.dispatch_thread_id();
            let zero = e.u32(0);
            let x = e.extract(tid, zero);
            let params_handle = e.load(params_var);
            let mask_handle = e.load(mask_var);
            let count = param(&mut e, params_handle, PARAM_TEXEL_COUNT);
            let in_range = e.less_than(x, count);
            e.branch_conditional(in_range, body, merge, BranchControlFlow::selection(merge));
            (x, params_handle, mask_handle)
        };

        // body: move one texel bit (or one word for symmetric copies).
        {
            let mut e = Emitter::new(&mut program, fn_id, body);
            let src_base = param(&mut e, params_handle, PARAM_SRC_BASE);
            let dst_base = param(&mut e, params_handle, PARAM_DST_BASE);

            if !asymmetric {
                // One whole mask word per thread.
                let src_element = e.add(src_base, x);
                let loaded = e.load_buffer(mask_handle, src_element);
                let zero = e.u32(0);
                let word = e.extract(loaded, zero);
                let dst_element = e.add(dst_base, x);
                let address = e.address_of(mask_handle, dst_element);
                e.atomic_or(address, word);
            } else {
                let width = param(&mut e, params_handle, PARAM_WIDTH);
                let height = param(&mut e, params_handle, PARAM_HEIGHT);
                let width_p2 = param(&mut e, params_handle, PARAM_WIDTH_P2);
                let slice_chain = param(&mut e, params_handle, PARAM_SLICE_CHAIN);

                // x -> (xx, y, z) over the placement dimensions.
                let plane = e.mul(width, height);
                let z = e.div(x, plane);
                let in_plane = e.rem(x, plane);
                let y = e.div(in_plane, width);
                let xx = e.rem(in_plane, width);

                // Destination texel in the aligned layout.
                let slice = e.mul(z, slice_chain);
                let row = e.mul(y, width_p2);
                let dst_texel = e.add(slice, row);
                let dst_texel = e.add(dst_texel, xx);

                // Source bit at the linear placement offset.
                let thirty_two = e.u32(32);
                let one = e.u32(1);
                let src_word_index = e.div(x, thirty_two);
                let src_element = e.add(src_base, src_word_index);
                let loaded = e.load_buffer(mask_handle, src_element);
                let zero = e.u32(0);
                let src_word = e.extract(loaded, zero);
                let src_bit_index = e.rem(x, thirty_two);
                let src_bit = e.bit_shift_left(one, src_bit_index);
                let src_set = e.bit_and(src_word, src_bit);

                // Destination bit, zero when the source texel is clear.
                let dst_word_index = e.div(dst_texel, thirty_two);
                let dst_element = e.add(dst_base, dst_word_index);
                let dst_bit_index = e.rem(dst_texel, thirty_two);
                let dst_bit = e.bit_shift_left(one, dst_bit_index);
                let src_is_set = e.not_equal(src_set, zero);
                let value = e.select(src_is_set, dst_bit, zero);

                let address = e.address_of(mask_handle, dst_element);
                e.atomic_or(address, value);
            }
            e.branch(merge);
        }

        {
            let mut e = Emitter::new(&mut program, fn_id, merge);
            e.ret_void();
        }

        program
    }

    /// Queue a full-region initialization mark, mapping the allocation on
    /// first use.
    fn mark_initialized(&self, resource: &ResourceInfo) {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        let puid = resource.puid();
        if let Some(allocation) = state.allocations.get_mut(&puid) {
            allocation.mapped = true;
            state.pending_blit_queue.push(puid);
        }
    }

    /// Record the transfer-queue work for pending mappings, blits and
    /// copies.
    fn flush_pending(&self, state: &mut HookState, builder: &mut CommandBuilder) {
        let allocator = self.texel_allocator.as_ref().expect("installed");

        let pending = std::mem::replace(&mut state.pending_mapping_queue, Vec::new());
        for tag in pending {
            if !state.allocations.contains_key(&tag.puid) {
                continue;
            }
            builder.stage_buffer(self.puid_base_buffer, tag.puid * 4, &[tag.memory_base_align_32]);
            if let Some(allocation) = state.allocations.get(&tag.puid) {
                allocator.initialize(builder, &allocation.memory);
            }
        }

        let blits = std::mem::replace(&mut state.pending_blit_queue, Vec::new());
        for puid in blits {
            if let Some(allocation) = state.allocations.get(&puid) {
                // Whole-resource blit: every texel bit set.
                builder.clear_buffer(
                    allocator.texel_blocks_buffer(),
                    allocation.memory.texel_base_block,
                    allocation.memory.word_count,
                    !0,
                );
            }
        }
        builder.uav_barrier();

        let copies = std::mem::replace(&mut state.pending_copy_queue, Vec::new());
        for copy in copies {
            let (source, dest) = match (
                state.allocations.get(&copy.source),
                state.allocations.get(&copy.dest),
            ) {
                (Some(source), Some(dest)) => (source, dest),
                _ => continue,
            };

            let texel = source.info.texel;
            let params = if copy.symmetric {
                let words = source.memory.word_count.min(dest.memory.word_count);
                [
                    words,
                    source.memory.texel_base_block,
                    dest.memory.texel_base_block,
                    0,
                    0,
                    0,
                    0,
                ]
            } else {
                let dest_texel = dest.info.texel;
                let width_p2 = layout::align_pow2_upper(dest_texel.width);
                let height_p2 = layout::align_pow2_upper(dest_texel.height);
                let tail = (width_p2 >> dest_texel.mip_count) * (height_p2 >> dest_texel.mip_count);
                let slice_chain = (width_p2 * height_p2 - tail) * 4 / 3;
                [
                    texel.width * texel.height.max(1) * texel.depth_or_slices.max(1),
                    source.memory.texel_base_block,
                    dest.memory.texel_base_block,
                    texel.width,
                    texel.height.max(1),
                    width_p2,
                    slice_chain,
                ]
            };
            let thread_count = params[0];

            builder.set_shader_program(if copy.symmetric {
                self.copy_symmetric_program
            } else {
                self.copy_asymmetric_program
            });
            builder.set_descriptor_data(BINDING_MASK, allocator.texel_blocks_buffer());
            builder.set_descriptor_data(BINDING_PARAMS, self.params_buffer);
            builder.stage_buffer(self.params_buffer, 0, &params);
            builder.dispatch(thread_count);
            builder.uav_barrier();
        }
    }
}

impl Feature for InitializationFeature {
    fn info(&self) -> FeatureInfo {
        FeatureInfo {
            name: "Initialization",
            description: "Instrumentation and validation of resource initialization",
            bit: FeatureBits::RESOURCE_INITIALIZATION,
            dependencies: vec![FeatureBits::DESCRIPTOR_ARRAY_BOUNDS],
        }
    }

    fn install(&mut self, ctx: &mut InstallContext) -> bool {
        self.export_id = ctx.exports.allocate(MessageType::TexelInitialization);

        self.puid_base_buffer = ctx.shader_data.create_buffer(ShaderDataBufferInfo {
            element_count: 1 << 16,
        });
        self.params_buffer = ctx.shader_data.create_buffer(ShaderDataBufferInfo {
            element_count: PARAM_WORDS,
        });

        self.texel_allocator = Some(Arc::new(TexelMemoryAllocator::install(ctx.shader_data)));
        self.scheduler = Some(ctx.scheduler.clone());
        self.transfer_primitive = ctx.scheduler.create_primitive();

        self.copy_symmetric_program = ctx.programs.register(Self::build_copy_program(false));
        self.copy_asymmetric_program = ctx.programs.register(Self::build_copy_program(true));
        true
    }

    fn hooks(&self) -> FeatureHooks {
        FeatureHooks::CREATE_RESOURCE
            | FeatureHooks::DESTROY_RESOURCE
            | FeatureHooks::MAP_RESOURCE
            | FeatureHooks::COPY_RESOURCE
            | FeatureHooks::CLEAR_RESOURCE
            | FeatureHooks::WRITE_RESOURCE
            | FeatureHooks::DISCARD_RESOURCE
            | FeatureHooks::RENDER_PASS
            | FeatureHooks::PRE_SUBMIT
    }

    fn shader_data(&self) -> Vec<ShaderDataId> {
        let mut out = vec![self.puid_base_buffer];
        if let Some(allocator) = &self.texel_allocator {
            out.push(allocator.texel_blocks_buffer());
        }
        out
    }

    fn export_ids(&self) -> Vec<ExportId> {
        vec![self.export_id]
    }

    fn inject(&self, program: &mut Program, ctx: &PassContext) {
        let allocator = match &self.texel_allocator {
            Some(allocator) => allocator.clone(),
            None => return,
        };
        let mask_buffer = allocator.texel_blocks_buffer();
        let puid_base_buffer = self.puid_base_buffer;

        visit_user_instructions(program, |program, at| {
            let op = program
                .function(at.function)
                .and_then(|f| f.block(at.block))
                .map(|b| b.instructions[at.index].op.clone());

            let (resource, coordinate, is_texture, is_write) = match op {
                Some(Op::LoadBuffer { buffer, index }) => (buffer, index, false, false),
                Some(Op::StoreBuffer { buffer, index, .. }) => (buffer, index, false, true),
                Some(Op::LoadTexture { texture, index }) => {
                    if let Some(Type::Texture { dim: TextureDimension::SubPass, .. }) =
                        program.types.type_of_value(texture)
                    {
                        return at;
                    }
                    (texture, index, true, false)
                }
                Some(Op::StoreTexture { texture, index, .. }) => (texture, index, true, true),
                Some(Op::SampleTexture { texture, coordinate, .. }) => {
                    (texture, coordinate, true, false)
                }
                _ => return at,
            };

            let volumetric = matches!(
                program.types.type_of_value(resource),
                Some(Type::Texture { dim: TextureDimension::Texture3D, .. })
            );

            let span = source_of(program, at);

            if is_write {
                // Writes initialize: set the texel bit in place, no branch.
                let mut pre = Emitter::before(program, at.function, at.block, at.index)
                    .with_instrumented_source(span);
                let properties = TexelPropertiesEmitter::emit(
                    &mut pre,
                    puid_base_buffer,
                    resource,
                    coordinate,
                    is_texture,
                    volumetric,
                );
                let bit = crate::inject::guarded_texel_bit(&mut pre, &properties.address);
                let mask_var = pre
                    .program()
                    .shader_data
                    .get(mask_buffer)
                    .expect("mask buffer not attached");
                bit_indexing::atomic_or_texel_address_value(
                    &mut pre,
                    mask_var,
                    properties.texel_base_offset_align_32,
                    properties.address.texel_offset,
                    bit,
                );
                let cursor = pre.cursor();
                return InstructionRef { function: at.function, block: at.block, index: cursor };
            }

            // Reads verify.
            let sguid = bind_sguid(program, ctx, at);
            let split = split_for_guard(program, at);

            let properties = {
                let mut pre = Emitter::new(program, at.function, split.pre_block)
                    .with_instrumented_source(span);
                let properties = TexelPropertiesEmitter::emit(
                    &mut pre,
                    puid_base_buffer,
                    resource,
                    coordinate,
                    is_texture,
                    volumetric,
                );
                let bit = crate::inject::guarded_texel_bit(&mut pre, &properties.address);
                let mask_var = pre
                    .program()
                    .shader_data
                    .get(mask_buffer)
                    .expect("mask buffer not attached");
                let previous = bit_indexing::read_texel_address_value(
                    &mut pre,
                    mask_var,
                    properties.texel_base_offset_align_32,
                    properties.address.texel_offset,
                    bit,
                );

                let zero = pre.u32(0);
                let uninitialized = pre.equal(previous, zero);
                let in_bounds = pre.not(properties.address.is_out_of_bounds);
                let condition = pre.and(uninitialized, in_bounds);

                pre.branch_conditional(
                    condition,
                    split.violation_block,
                    split.resume_block,
                    BranchControlFlow::selection(split.resume_block),
                );
                properties
            };

            {
                let mut emitter = Emitter::new(program, at.function, split.violation_block)
                    .with_instrumented_source(span);
                let sguid_value = emitter.u32(sguid);
                export_message(
                    &mut emitter,
                    ctx,
                    self.export_id,
                    MessageType::TexelInitialization,
                    &[
                        sguid_value,
                        properties.token.packed,
                        properties.address.x,
                        properties.address.y,
                        properties.address.z,
                        properties.address.mip,
                    ],
                );
                emitter.branch(split.resume_block);
            }

            split.instruction
        });
    }

    fn collect_exports(&self, export_id: ExportId, message: &DecodedMessage) {
        self.stream.lock().unwrap().push((export_id, *message));
    }

    fn collect_messages(&self, storage: &mut MessageStore) {
        for (export_id, message) in self.stream.lock().unwrap().drain(..) {
            storage.add(export_id, message);
        }
    }

    fn on_create_resource(&self, resource: &ResourceInfo) {
        let allocator = match &self.texel_allocator {
            Some(allocator) => allocator,
            None => return,
        };
        let mut state = self.state.lock().unwrap();
        let memory = allocator.allocate(resource.texel);
        state.pending_mapping_queue.push(MappingTag {
            puid: resource.puid(),
            memory_base_align_32: memory.texel_base_block,
        });
        state.allocations.insert(
            resource.puid(),
            InitAllocation { memory, info: *resource, mapped: !self.incremental_mapping },
        );
    }

    fn on_destroy_resource(&self, resource: &ResourceInfo) {
        let allocator = match &self.texel_allocator {
            Some(allocator) => allocator,
            None => return,
        };
        let mut state = self.state.lock().unwrap();
        if let Some(allocation) = state.allocations.remove(&resource.puid()) {
            allocator.free(allocation.memory);
        }
    }

    fn on_map_resource(&self, resource: &ResourceInfo) {
        // Host writes through a mapping initialize everything they could
        // touch.
        self.mark_initialized(resource);
    }

    fn on_copy_resource(&self, source: &ResourceInfo, dest: &ResourceInfo) {
        let symmetric = source.texel.is_buffer == dest.texel.is_buffer;
        let mut state = self.state.lock().unwrap();
        if let Some(allocation) = state.allocations.get_mut(&dest.puid()) {
            allocation.mapped = true;
        }
        state.pending_copy_queue.push(CopyTag {
            source: source.puid(),
            dest: dest.puid(),
            symmetric,
        });
    }

    fn on_clear_resource(&self, resource: &ResourceInfo) {
        self.mark_initialized(resource);
    }

    fn on_write_resource(&self, resource: &ResourceInfo) {
        self.mark_initialized(resource);
    }

    fn on_discard_resource(&self, resource: &ResourceInfo) {
        // An explicit discard is an initialization event: contents become
        // defined-but-arbitrary.
        self.mark_initialized(resource);
    }

    fn on_begin_render_pass(&self, attachments: &[ResourceInfo]) {
        for attachment in attachments {
            self.mark_initialized(attachment);
        }
    }

    fn on_pre_submit(&self, submission: &mut SubmissionContext) {
        let scheduler = match &self.scheduler {
            Some(scheduler) => scheduler.clone(),
            None => return,
        };
        let mut state = self.state.lock().unwrap();

        let has_work = !state.pending_mapping_queue.is_empty()
            || !state.pending_blit_queue.is_empty()
            || !state.pending_copy_queue.is_empty();

        if has_work {
            state.transfer_counter += 1;
            let mut buffer = CommandBuffer::new();
            {
                let mut builder = CommandBuilder::new(&mut buffer);
                self.flush_pending(&mut state, &mut builder);
            }

            if let Some(allocator) = &self.texel_allocator {
                allocator.update_residency(scheduler.as_ref(), Queue::ExclusiveTransfer);
            }

            let event = SchedulerPrimitiveEvent {
                id: self.transfer_primitive,
                value: state.transfer_counter,
            };
            scheduler.schedule(Queue::ExclusiveTransfer, buffer, Some(event));
        }

        submission.wait_primitives.push(SchedulerPrimitiveEvent {
            id: self.transfer_primitive,
            value: state.transfer_counter,
        });
    }
}
