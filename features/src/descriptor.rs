//! Descriptor mismatch validation: the compile-time expected resource type
//! against the runtime token, including the reserved PUID sentinels.

use crate::inject::{
    bind_sguid, emit_phi_with_result, export_message, redirect_result, source_of,
    visit_user_instructions, InstructionRef,
};
use crate::{Feature, FeatureBits, FeatureInfo, InstallContext, PassContext};
use aegis_addressing::token::{
    ResourceTokenEmitter, ResourceTokenType, PUID_INVALID_OUT_OF_BOUNDS, PUID_INVALID_START,
    PUID_INVALID_UNDEFINED,
};
use aegis_export::schema::{DecodedMessage, ExportId, MessageType};
use aegis_export::MessageStore;
use aegis_ir::block::{BlockFlags, SplitFlags};
use aegis_ir::emitter::Emitter;
use aegis_ir::inst::{BranchControlFlow, Op, PhiValue};
use aegis_ir::program::Program;
use aegis_ir::Id;
use std::sync::Mutex;

pub struct DescriptorMismatchFeature {
    export_id: ExportId,
    stream: Mutex<Vec<(ExportId, DecodedMessage)>>,
}

impl DescriptorMismatchFeature {
    pub fn new() -> DescriptorMismatchFeature {
        DescriptorMismatchFeature {
            export_id: 0,
            stream: Mutex::new(Vec::new()),
        }
    }

    /// Guard one resource operand of an instruction.
    ///
    /// Without safe-guarding the instruction moves to the resume block
    /// behind the check. With safe-guarding the instruction gets its own
    /// match block between check and resume, its result is redirected, and
    /// a phi at the resume head selects between the real result and the
    /// null constant of its type.
    fn inject_for_resource(
        &self,
        program: &mut Program,
        ctx: &PassContext,
        at: InstructionRef,
        resource: Id,
        compile_type: ResourceTokenType,
    ) -> InstructionRef {
        let (result, result_type) = {
            let instruction = &program
                .function(at.function)
                .and_then(|f| f.block(at.block))
                .expect("instrumented block")
                .instructions[at.index];
            let result = instruction.result;
            (result, program.types.value_type(result).unwrap_or(Id::INVALID))
        };
        let needs_merge = ctx.config.safe_guard && result.is_valid();

        let span = source_of(program, at);
        let sguid = bind_sguid(program, ctx, at);

        // Move everything behind the check into the resume block. With
        // safe-guarding the offending instruction stays behind for its own
        // block.
        let split_index = if ctx.config.safe_guard { at.index + 1 } else { at.index };
        let (resume, resume_point) = {
            let (function, identifiers) = program
                .function_and_identifiers_mut(at.function)
                .expect("instrumented function");
            let resume = function.alloc_block(identifiers);
            let point = function.split_block(
                identifiers,
                at.block,
                resume,
                split_index,
                SplitFlags::standard(),
            );
            (resume, point)
        };

        // Safe-guard: isolate the offending instruction in a match block.
        let mut match_block = Id::INVALID;
        let mut redirect = Id::INVALID;
        if ctx.config.safe_guard {
            match_block = {
                let (function, identifiers) = program
                    .function_and_identifiers_mut(at.function)
                    .expect("instrumented function");
                let match_block = function.alloc_block(identifiers);
                function.split_block(
                    identifiers,
                    at.block,
                    match_block,
                    at.index,
                    SplitFlags::standard(),
                );
                match_block
            };

            if needs_merge {
                redirect = program.identifiers.alloc();
                redirect_result(
                    program,
                    InstructionRef { function: at.function, block: match_block, index: 0 },
                    redirect,
                );
            }

            let mut match_emitter =
                Emitter::new(program, at.function, match_block).with_instrumented_source(span);
            match_emitter.branch(resume);
        }

        // Failure block never re-instruments.
        let mismatch = {
            let (function, identifiers) = program
                .function_and_identifiers_mut(at.function)
                .expect("instrumented function");
            let mismatch = function.alloc_block(identifiers);
            function.block_mut(mismatch).unwrap().flags |= BlockFlags::NO_INSTRUMENTATION;
            mismatch
        };

        // Check in the PRE block: the type must match and the PUID must be
        // below the reserved range.
        let (packed, runtime_type, runtime_puid, compile_id) = {
            let mut pre =
                Emitter::new(program, at.function, at.block).with_instrumented_source(span);
            let (packed, runtime_type, runtime_puid) =
                ResourceTokenEmitter::token(&mut pre, resource);
            let compile_id = pre.u32(compile_type as u32);
            let type_mismatch = pre.not_equal(compile_id, runtime_type);
            let reserved_start = pre.u32(PUID_INVALID_START);
            let reserved = pre.greater_than_equal(runtime_puid, reserved_start);
            let condition = pre.or(type_mismatch, reserved);

            let pass_target = if ctx.config.safe_guard { match_block } else { resume };
            pre.branch_conditional(
                condition,
                mismatch,
                pass_target,
                BranchControlFlow::selection(resume),
            );
            (packed, runtime_type, runtime_puid, compile_id)
        };

        // Report in the MISMATCH block.
        {
            let mut emitter =
                Emitter::new(program, at.function, mismatch).with_instrumented_source(span);
            let undefined_sentinel = emitter.u32(PUID_INVALID_UNDEFINED);
            let is_undefined = emitter.equal(runtime_puid, undefined_sentinel);
            let oob_sentinel = emitter.u32(PUID_INVALID_OUT_OF_BOUNDS);
            let is_out_of_bounds = emitter.equal(runtime_puid, oob_sentinel);

            let one = emitter.u32(1);
            let zero = emitter.u32(0);
            let undefined_flag = emitter.select(is_undefined, one, zero);
            let oob_flag = emitter.select(is_out_of_bounds, one, zero);
            let sguid_value = emitter.u32(sguid);

            export_message(
                &mut emitter,
                ctx,
                self.export_id,
                MessageType::DescriptorMismatch,
                &[sguid_value, compile_id, runtime_type, undefined_flag, oob_flag, packed],
            );
            emitter.branch(resume);
        }

        // Merge the safe-guarded result with the null fallback.
        if needs_merge {
            let null = program.const_null(result_type);
            emit_phi_with_result(
                program,
                at.function,
                resume,
                result,
                result_type,
                &[
                    PhiValue { value: redirect, block: match_block },
                    PhiValue { value: null, block: mismatch },
                ],
            );
        }

        if ctx.config.safe_guard {
            InstructionRef { function: at.function, block: match_block, index: 0 }
        } else {
            InstructionRef { function: at.function, block: resume_point.block, index: resume_point.index }
        }
    }
}

impl Feature for DescriptorMismatchFeature {
    fn info(&self) -> FeatureInfo {
        FeatureInfo {
            name: "Descriptor",
            description: "Instrumentation and validation of descriptor usage",
            bit: FeatureBits::DESCRIPTOR_ARRAY_BOUNDS,
            dependencies: Vec::new(),
        }
    }

    fn install(&mut self, ctx: &mut InstallContext) -> bool {
        self.export_id = ctx.exports.allocate(MessageType::DescriptorMismatch);
        true
    }

    fn export_ids(&self) -> Vec<ExportId> {
        vec![self.export_id]
    }

    fn inject(&self, program: &mut Program, ctx: &PassContext) {
        visit_user_instructions(program, |program, at| {
            let op = program
                .function(at.function)
                .and_then(|f| f.block(at.block))
                .map(|b| b.instructions[at.index].op.clone());

            match op {
                Some(Op::LoadBuffer { buffer, .. }) | Some(Op::StoreBuffer { buffer, .. }) => {
                    self.inject_for_resource(program, ctx, at, buffer, ResourceTokenType::Buffer)
                }
                Some(Op::LoadTexture { texture, .. }) | Some(Op::StoreTexture { texture, .. }) => {
                    self.inject_for_resource(program, ctx, at, texture, ResourceTokenType::Texture)
                }
                Some(Op::SampleTexture { texture, sampler, .. }) => {
                    let next = self.inject_for_resource(
                        program,
                        ctx,
                        at,
                        texture,
                        ResourceTokenType::Texture,
                    );
                    // Samplers are not guaranteed; combined samplers skip.
                    if !sampler.is_valid() {
                        return next;
                    }
                    self.inject_for_resource(program, ctx, next, sampler, ResourceTokenType::Sampler)
                }
                _ => at,
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
}
