//! Test-support pass: rewrites every buffer store's value with `value + 1`.
//! Exercises operand replacement through the instrumentation pipeline
//! without exporting anything; not registered on real devices.

use crate::inject::{source_of, visit_user_instructions, InstructionRef};
use crate::{Feature, FeatureBits, FeatureInfo, InstallContext, PassContext};
use aegis_export::schema::ExportId;
use aegis_ir::emitter::Emitter;
use aegis_ir::inst::Op;
use aegis_ir::program::Program;

pub struct OffsetStoresFeature;

impl OffsetStoresFeature {
    pub fn new() -> OffsetStoresFeature {
        OffsetStoresFeature
    }
}

impl Feature for OffsetStoresFeature {
    fn info(&self) -> FeatureInfo {
        FeatureInfo {
            name: "Offset Stores",
            description: "Test feature offsetting every stored value by one",
            // Piggybacks the export-stability bit; never co-registered.
            bit: FeatureBits::EXPORT_STABILITY,
            dependencies: Vec::new(),
        }
    }

    fn install(&mut self, _ctx: &mut InstallContext) -> bool {
        true
    }

    fn export_ids(&self) -> Vec<ExportId> {
        Vec::new()
    }

    fn inject(&self, program: &mut Program, _ctx: &PassContext) {
        visit_user_instructions(program, |program, at| {
            let op = program
                .function(at.function)
                .and_then(|f| f.block(at.block))
                .map(|b| b.instructions[at.index].op.clone());

            let value = match op {
                Some(Op::StoreBuffer { value, .. }) => value,
                _ => return at,
            };

            let span = source_of(program, at);

            // value + 1 ahead of the store, then retarget the operand.
            let offset = {
                let mut pre = Emitter::before(program, at.function, at.block, at.index)
                    .with_instrumented_source(span);
                let one = pre.u32(1);
                pre.add(value, one)
            };

            let index = at.index + 1;
            let function = program.function_mut(at.function).expect("function");
            let block = function.block_mut(at.block).expect("block");
            if let Op::StoreBuffer { value, .. } = &mut block.instructions[index].op {
                *value = offset;
            }
            block.instructions[index].source = block.instructions[index].source.modify();
            block.mark_dirty();

            InstructionRef { function: at.function, block: at.block, index }
        });
    }
}
