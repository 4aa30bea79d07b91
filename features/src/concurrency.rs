//! Data race validation: the shared texel mask doubles as a lock-per-texel.
//!
//! Writes take the texel bit with an atomic or and release it after the
//! access; a previously set bit is a racing producer. Reads only observe the
//! bit. Out-of-bounds addresses collapse the bit to zero, disabling the
//! atomic traffic without extra branching; the bounds feature owns that
//! report.

use crate::inject::{
    bind_sguid, export_message, guarded_texel_bit, source_of, split_for_guard,
    visit_user_instructions, InstructionRef, TexelPropertiesEmitter,
};
use crate::{
    Feature, FeatureBits, FeatureHooks, FeatureInfo, InstallContext, PassContext, ResourceInfo,
    SubmissionContext,
};
use aegis_addressing::allocator::{TexelMemoryAllocation, TexelMemoryAllocator};
use aegis_addressing::bit_indexing;
use aegis_export::commands::{CommandBuffer, CommandBuilder};
use aegis_export::scheduler::{
    Queue, Scheduler, SchedulerPrimitiveEvent, SchedulerPrimitiveId,
};
use aegis_export::schema::{DecodedMessage, ExportId, MessageType};
use aegis_export::shader_data::{ShaderDataBufferInfo, ShaderDataId};
use aegis_export::MessageStore;
use aegis_ir::emitter::Emitter;
use aegis_ir::inst::{BranchControlFlow, Op};
use aegis_ir::program::Program;
use aegis_ir::types::{TextureDimension, Type};
use fxhash::FxHashMap;
use std::sync::{Arc, Mutex};

struct Allocation {
    memory: TexelMemoryAllocation,
}

struct MappingTag {
    puid: u32,
    memory_base_align_32: u32,
}

#[derive(Default)]
struct HookState {
    allocations: FxHashMap<u32, Allocation>,
    pending_mapping_queue: Vec<MappingTag>,
    transfer_counter: u64,
}

pub struct ConcurrencyFeature {
    export_id: ExportId,
    puid_base_buffer: ShaderDataId,
    texel_allocator: Option<Arc<TexelMemoryAllocator>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    transfer_primitive: SchedulerPrimitiveId,
    state: Mutex<HookState>,
    stream: Mutex<Vec<(ExportId, DecodedMessage)>>,
}

impl ConcurrencyFeature {
    pub fn new() -> ConcurrencyFeature {
        ConcurrencyFeature {
            export_id: 0,
            puid_base_buffer: 0,
            texel_allocator: None,
            scheduler: None,
            transfer_primitive: 0,
            state: Mutex::new(HookState::default()),
            stream: Mutex::new(Vec::new()),
        }
    }

    pub fn texel_allocator(&self) -> Option<Arc<TexelMemoryAllocator>> {
        self.texel_allocator.clone()
    }
}

impl Feature for ConcurrencyFeature {
    fn info(&self) -> FeatureInfo {
        FeatureInfo {
            name: "Concurrency",
            description: "Instrumentation and validation of race conditions across events or queues",
            bit: FeatureBits::RESOURCE_DATA_RACE,
            // The descriptor pass validates (and may safe-guard) the
            // descriptor data this pass addresses with.
            dependencies: vec![FeatureBits::DESCRIPTOR_ARRAY_BOUNDS],
        }
    }

    fn install(&mut self, ctx: &mut InstallContext) -> bool {
        self.export_id = ctx.exports.allocate(MessageType::ResourceRaceCondition);

        // PUID to mask-base mapping, one word per possible PUID page.
        self.puid_base_buffer = ctx.shader_data.create_buffer(ShaderDataBufferInfo {
            element_count: 1 << 16,
        });

        self.texel_allocator = Some(Arc::new(TexelMemoryAllocator::install(ctx.shader_data)));
        self.scheduler = Some(ctx.scheduler.clone());
        self.transfer_primitive = ctx.scheduler.create_primitive();
        true
    }

    fn hooks(&self) -> FeatureHooks {
        FeatureHooks::CREATE_RESOURCE | FeatureHooks::DESTROY_RESOURCE | FeatureHooks::PRE_SUBMIT
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
            let sguid = bind_sguid(program, ctx, at);

            let split = split_for_guard(program, at);

            // PRE: texel address, lock acquisition, race condition.
            let properties = {
                let mut pre =
                    Emitter::new(program, at.function, split.pre_block).with_instrumented_source(span);

                let properties = TexelPropertiesEmitter::emit(
                    &mut pre,
                    puid_base_buffer,
                    resource,
                    coordinate,
                    is_texture,
                    volumetric,
                );

                // Out-of-bounds collapses the lock bit; the bounds feature
                // reports those.
                let bit = guarded_texel_bit(&mut pre, &properties.address);

                let mask_var = pre
                    .program()
                    .shader_data
                    .get(mask_buffer)
                    .expect("mask buffer not attached");

                let previous_lock = if is_write {
                    // Single producer: take the bit, observe the previous
                    // owner.
                    bit_indexing::atomic_or_texel_address_value(
                        &mut pre,
                        mask_var,
                        properties.texel_base_offset_align_32,
                        properties.address.texel_offset,
                        bit,
                    )
                } else {
                    // Multiple consumers: observe only.
                    bit_indexing::read_texel_address_value(
                        &mut pre,
                        mask_var,
                        properties.texel_base_offset_align_32,
                        properties.address.texel_offset,
                        bit,
                    )
                };

                let zero = pre.u32(0);
                let locked = pre.not_equal(previous_lock, zero);
                let in_bounds = pre.not(properties.address.is_out_of_bounds);
                let unsafe_condition = pre.and(locked, in_bounds);

                pre.branch_conditional(
                    unsafe_condition,
                    split.violation_block,
                    split.resume_block,
                    BranchControlFlow::selection(split.resume_block),
                );
                properties
            };

            // Violation: report the race.
            {
                let mut emitter = Emitter::new(program, at.function, split.violation_block)
                    .with_instrumented_source(span);
                let sguid_value = emitter.u32(sguid);
                export_message(
                    &mut emitter,
                    ctx,
                    self.export_id,
                    MessageType::ResourceRaceCondition,
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

            // Reads hold no lock.
            if !is_write {
                return split.instruction;
            }

            // Writes release the lock right after the access.
            let release_cursor = {
                let mut resume = Emitter::before(
                    program,
                    at.function,
                    split.resume_block,
                    split.instruction.index + 1,
                )
                .with_instrumented_source(span);
                let mask_var = resume
                    .program()
                    .shader_data
                    .get(mask_buffer)
                    .expect("mask buffer not attached");
                bit_indexing::atomic_clear_texel_address(
                    &mut resume,
                    mask_var,
                    properties.texel_base_offset_align_32,
                    properties.address.texel_offset,
                );
                resume.cursor()
            };

            // Resume after the unlock.
            InstructionRef {
                function: at.function,
                block: split.resume_block,
                index: release_cursor.saturating_sub(1),
            }
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
        state.allocations.insert(resource.puid(), Allocation { memory });
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

    fn on_pre_submit(&self, submission: &mut SubmissionContext) {
        let (allocator, scheduler) = match (&self.texel_allocator, &self.scheduler) {
            (Some(allocator), Some(scheduler)) => (allocator, scheduler),
            _ => return,
        };
        let mut state = self.state.lock().unwrap();

        if !state.pending_mapping_queue.is_empty() {
            state.transfer_counter += 1;

            let mut buffer = CommandBuffer::new();
            {
                let mut builder = CommandBuilder::new(&mut buffer);
                let pending = std::mem::replace(&mut state.pending_mapping_queue, Vec::new());
                for tag in pending {
                    // Resource may already be gone.
                    let allocation = match state.allocations.get(&tag.puid) {
                        Some(allocation) => allocation,
                        None => continue,
                    };

                    // PUID -> mask base.
                    builder.stage_buffer(
                        self.puid_base_buffer,
                        tag.puid * 4,
                        &[tag.memory_base_align_32],
                    );
                    allocator.initialize(&mut builder, &allocation.memory);
                }
            }

            allocator.update_residency(scheduler.as_ref(), Queue::ExclusiveTransfer);

            let event = SchedulerPrimitiveEvent {
                id: self.transfer_primitive,
                value: state.transfer_counter,
            };
            scheduler.schedule(Queue::ExclusiveTransfer, buffer, Some(event));
        }

        // Submissions always wait for the last mappings.
        submission.wait_primitives.push(SchedulerPrimitiveEvent {
            id: self.transfer_primitive,
            value: state.transfer_counter,
        });
    }
}
