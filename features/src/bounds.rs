//! Resource bounds validation: every index dimension of a buffer or texture
//! access checked against the bound descriptor's extent.

use crate::inject::{
    bind_sguid, emit_phi_with_result, export_message, redirect_result, source_of,
    visit_user_instructions, InstructionRef,
};
use crate::{Feature, FeatureBits, FeatureInfo, InstallContext, PassContext};
use aegis_addressing::token::ResourceTokenEmitter;
use aegis_export::schema::{DecodedMessage, ExportId, MessageType};
use aegis_export::MessageStore;
use aegis_ir::block::{BlockFlags, SplitFlags};
use aegis_ir::emitter::Emitter;
use aegis_ir::inst::{BranchControlFlow, Op, PhiValue};
use aegis_ir::program::Program;
use aegis_ir::types::{TextureDimension, Type};
use aegis_ir::Id;
use std::sync::Mutex;

struct Target {
    resource: Id,
    index: Id,
    is_texture: bool,
    is_write: bool,
}

pub struct ResourceBoundsFeature {
    export_id: ExportId,
    stream: Mutex<Vec<(ExportId, DecodedMessage)>>,
}

impl ResourceBoundsFeature {
    pub fn new() -> ResourceBoundsFeature {
        ResourceBoundsFeature {
            export_id: 0,
            stream: Mutex::new(Vec::new()),
        }
    }

    fn target_of(program: &Program, op: &Op) -> Option<Target> {
        Some(match op {
            Op::StoreBuffer { buffer, index, .. } => {
                Target { resource: *buffer, index: *index, is_texture: false, is_write: true }
            }
            Op::LoadBuffer { buffer, index } => {
                Target { resource: *buffer, index: *index, is_texture: false, is_write: false }
            }
            Op::StoreTexture { texture, index, .. } => {
                Target { resource: *texture, index: *index, is_texture: true, is_write: true }
            }
            Op::LoadTexture { texture, index } => {
                // Sub-pass inputs are not validated.
                if let Some(Type::Texture { dim: TextureDimension::SubPass, .. }) =
                    program.types.type_of_value(*texture)
                {
                    return None;
                }
                Target { resource: *texture, index: *index, is_texture: true, is_write: false }
            }
            _ => return None,
        })
    }

    /// Coordinate words for the detail chunk: up to three dimensions, zero
    /// padded.
    fn coordinate_words(emitter: &mut Emitter, target: &Target) -> [Id; 3] {
        let zero = emitter.u32(0);
        let index_type = emitter.program().types.value_type(target.index);
        let dim = index_type
            .and_then(|ty| emitter.program().types.get(ty).cloned())
            .and_then(|ty| match ty {
                Type::Vector { dim, .. } => Some(dim),
                _ => None,
            });
        match dim {
            Some(dim) => {
                let mut out = [zero; 3];
                for axis in 0..dim.min(3) {
                    let literal = emitter.u32(axis as u32);
                    out[axis as usize] = emitter.extract(target.index, literal);
                }
                out
            }
            None => [target.index, zero, zero],
        }
    }
}

impl Feature for ResourceBoundsFeature {
    fn info(&self) -> FeatureInfo {
        FeatureInfo {
            name: "Resource Bounds",
            description: "Instrumentation and validation of resource indexing operations",
            bit: FeatureBits::RESOURCE_ADDRESS_BOUNDS,
            // Bounds checks read descriptor data; running after the
            // descriptor pass means that data is already validated and
            // potentially safe-guarded.
            dependencies: vec![FeatureBits::DESCRIPTOR_ARRAY_BOUNDS],
        }
    }

    fn install(&mut self, ctx: &mut InstallContext) -> bool {
        self.export_id = ctx.exports.allocate(MessageType::ResourceIndexOutOfBounds);
        true
    }

    fn export_ids(&self) -> Vec<ExportId> {
        vec![self.export_id]
    }

    fn inject(&self, program: &mut Program, ctx: &PassContext) {
        visit_user_instructions(program, |program, at| {
            let (op, result) = {
                let instruction = &program
                    .function(at.function)
                    .and_then(|f| f.block(at.block))
                    .expect("instrumented block")
                    .instructions[at.index];
                (instruction.op.clone(), instruction.result)
            };
            let target = match Self::target_of(program, &op) {
                Some(target) => target,
                None => return at,
            };

            let result_type = program.types.value_type(result).unwrap_or(Id::INVALID);
            let needs_merge = ctx.config.safe_guard && result.is_valid();
            let span = source_of(program, at);
            let sguid = bind_sguid(program, ctx, at);

            // Split the resume path off; under safe-guarding the offending
            // access gets an isolated match block whose result is merged
            // back through a phi.
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

            let oob_block = {
                let (function, identifiers) = program
                    .function_and_identifiers_mut(at.function)
                    .expect("instrumented function");
                let oob_block = function.alloc_block(identifiers);
                function.block_mut(oob_block).unwrap().flags |= BlockFlags::NO_INSTRUMENTATION;
                oob_block
            };

            // PRE: any index dimension >= the resource size.
            let coordinate = {
                let mut pre =
                    Emitter::new(program, at.function, at.block).with_instrumented_source(span);

                let mut size = pre.resource_size(target.resource);

                // Cube array stores only report width/height from the size
                // query; assume the six faces.
                if target.is_texture && target.is_write {
                    let is_cube = matches!(
                        pre.program().types.type_of_value(target.resource),
                        Some(Type::Texture { dim: TextureDimension::Texture2DCube, .. })
                            | Some(Type::Texture {
                                dim: TextureDimension::Texture2DCubeArray,
                                ..
                            })
                    );
                    if is_cube {
                        let zero = pre.u32(0);
                        let one = pre.u32(1);
                        let width = pre.extract(size, zero);
                        let height = pre.extract(size, one);
                        let six = pre.u32(6);
                        let uint = pre.program().type_u32();
                        let uint3 = pre.program().type_vector(uint, 3);
                        size = pre.construct(uint3, &[width, height, six]);
                    }
                }

                let exceeded = pre.greater_than_equal(target.index, size);
                let condition = pre.any(exceeded);
                let coordinate = Self::coordinate_words(&mut pre, &target);

                let pass_target = if ctx.config.safe_guard { match_block } else { resume };
                pre.branch_conditional(
                    condition,
                    oob_block,
                    pass_target,
                    BranchControlFlow::selection(resume),
                );
                coordinate
            };

            // OOB: report and fall through to resume.
            {
                let mut emitter =
                    Emitter::new(program, at.function, oob_block).with_instrumented_source(span);
                let token = ResourceTokenEmitter::packed_token(&mut emitter, target.resource);
                let sguid_value = emitter.u32(sguid);
                let is_texture = emitter.u32(target.is_texture as u32);
                let is_write = emitter.u32(target.is_write as u32);

                export_message(
                    &mut emitter,
                    ctx,
                    self.export_id,
                    MessageType::ResourceIndexOutOfBounds,
                    &[
                        sguid_value,
                        is_texture,
                        is_write,
                        token,
                        coordinate[0],
                        coordinate[1],
                        coordinate[2],
                    ],
                );
                emitter.branch(resume);
            }

            // Safe-guarded loads resolve to the null constant on the oob
            // path.
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
                        PhiValue { value: null, block: oob_block },
                    ],
                );
            }

            if ctx.config.safe_guard {
                InstructionRef { function: at.function, block: match_block, index: 0 }
            } else {
                InstructionRef {
                    function: at.function,
                    block: resume_point.block,
                    index: resume_point.index,
                }
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
