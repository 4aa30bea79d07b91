//! Export stability validation: NaN and infinity detection on values
//! leaving the shader through stores and stage outputs.

use crate::inject::{
    bind_sguid, export_message, source_of, split_for_guard, visit_user_instructions,
};
use crate::{Feature, FeatureBits, FeatureInfo, InstallContext, PassContext};
use aegis_export::schema::{DecodedMessage, ExportId, MessageType};
use aegis_export::MessageStore;
use aegis_ir::emitter::Emitter;
use aegis_ir::inst::{BranchControlFlow, Op};
use aegis_ir::program::Program;
use aegis_ir::types::{AddressSpace, Type};
use aegis_ir::Id;
use std::sync::Mutex;

pub struct ExportStabilityFeature {
    export_id: ExportId,
    stream: Mutex<Vec<(ExportId, DecodedMessage)>>,
}

impl ExportStabilityFeature {
    pub fn new() -> ExportStabilityFeature {
        ExportStabilityFeature {
            export_id: 0,
            stream: Mutex::new(Vec::new()),
        }
    }

    /// Floating-point exported value of an instruction, if it has one.
    fn exported_value(program: &Program, op: &Op) -> Option<Id> {
        let value = match op {
            Op::StoreBuffer { value, .. } => *value,
            Op::StoreTexture { value, .. } => *value,
            Op::Store { address, value } => {
                // Only stage outputs count as exports for plain stores.
                let is_output = matches!(
                    program
                        .variable(*address)
                        .map(|variable| variable.space),
                    Some(AddressSpace::Output)
                );
                if !is_output {
                    return None;
                }
                *value
            }
            _ => return None,
        };

        let is_fp = match program.types.type_of_value(value) {
            Some(Type::Fp { .. }) => true,
            Some(Type::Vector { elem, .. }) => {
                matches!(program.types.get(*elem), Some(Type::Fp { .. }))
            }
            _ => false,
        };
        if is_fp {
            Some(value)
        } else {
            None
        }
    }
}

impl Feature for ExportStabilityFeature {
    fn info(&self) -> FeatureInfo {
        FeatureInfo {
            name: "Export Stability",
            description: "Instrumentation and validation of numerically unstable exports",
            bit: FeatureBits::EXPORT_STABILITY,
            dependencies: Vec::new(),
        }
    }

    fn install(&mut self, ctx: &mut InstallContext) -> bool {
        self.export_id = ctx.exports.allocate(MessageType::ExportUnstable);
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
            let value = match op.as_ref().and_then(|op| Self::exported_value(program, op)) {
                Some(value) => value,
                None => return at,
            };

            let span = source_of(program, at);
            let sguid = bind_sguid(program, ctx, at);
            let split = split_for_guard(program, at);

            // PRE: any component NaN or infinite.
            let (any_nan,) = {
                let mut pre =
                    Emitter::new(program, at.function, split.pre_block).with_instrumented_source(span);
                let nan = pre.is_nan(value);
                let any_nan = pre.any(nan);
                let inf = pre.is_inf(value);
                let any_inf = pre.any(inf);
                let unstable = pre.or(any_nan, any_inf);
                pre.branch_conditional(
                    unstable,
                    split.violation_block,
                    split.resume_block,
                    BranchControlFlow::selection(split.resume_block),
                );
                (any_nan,)
            };

            {
                let mut emitter = Emitter::new(program, at.function, split.violation_block)
                    .with_instrumented_source(span);
                let sguid_value = emitter.u32(sguid);
                let one = emitter.u32(1);
                let two = emitter.u32(2);
                let kind = emitter.select(any_nan, one, two);
                export_message(
                    &mut emitter,
                    ctx,
                    self.export_id,
                    MessageType::ExportUnstable,
                    &[sguid_value, kind],
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
}
