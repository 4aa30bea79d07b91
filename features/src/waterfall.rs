//! Waterfall validation: divergent descriptor-indexed resource addressing.
//!
//! The divergence lattice from the pre-injection simulation decides what can
//! be proven uniform at compile time. Resource address chains with a
//! possibly-divergent index get a runtime `!WaveAllEqual` check and report
//! actual divergence; function-space indexing that is both varying and
//! divergent is a compile-time waterfalling hazard.

use crate::inject::{
    bind_sguid, export_message, source_of, split_for_guard, visit_user_instructions,
    InstructionRef,
};
use crate::{Feature, FeatureBits, FeatureInfo, InstallContext, PassContext};
use aegis_export::schema::{
    DecodedMessage, ExportId, MessageType, WaterfallingConditionMessage,
};
use aegis_export::MessageStore;
use aegis_ir::analysis::SimulationAnalysis;
use aegis_ir::emitter::Emitter;
use aegis_ir::inst::{AddressChainLink, BranchControlFlow, Op};
use aegis_ir::program::{MetadataType, Program};
use aegis_ir::types::{AddressSpace, Type};
use aegis_ir::Id;
use fxhash::FxHashMap;
use smallvec::SmallVec;
use std::sync::Mutex;

/// Pre-injection analysis shared across the inject pass. Stored on the
/// program-level analysis map; splits do not invalidate it because every
/// entry is keyed by result id.
struct WaterfallAnalysis {
    per_function: FxHashMap<Id, SimulationAnalysis>,
    /// Result id of each chain/extract to the block that originally
    /// produced it.
    instruction_source_blocks: FxHashMap<Id, Id>,
}

pub struct WaterfallFeature {
    divergent_export_id: ExportId,
    waterfall_export_id: ExportId,
    stream: Mutex<Vec<(ExportId, DecodedMessage)>>,
}

impl WaterfallFeature {
    pub fn new() -> WaterfallFeature {
        WaterfallFeature {
            divergent_export_id: 0,
            waterfall_export_id: 0,
            stream: Mutex::new(Vec::new()),
        }
    }

    fn inject_address_chain(
        &self,
        program: &mut Program,
        ctx: &PassContext,
        at: InstructionRef,
        composite: Id,
        chains: &SmallVec<[AddressChainLink; 2]>,
        result: Id,
    ) -> InstructionRef {
        let analysis = match program.analysis.get::<WaterfallAnalysis>() {
            Some(analysis) => analysis,
            None => return at,
        };
        let simulation = match analysis.per_function.get(&at.function) {
            Some(simulation) => simulation,
            None => return at,
        };

        // Composite classification: function address-space indirection, or
        // addressing into a resource.
        let composite_type = program.types.type_of_value(composite).cloned();
        let is_fas = matches!(
            composite_type,
            Some(Type::Pointer { space: AddressSpace::Function, .. })
        );
        let terminal = program
            .types
            .value_type(composite)
            .and_then(|ty| program.types.terminal_value_type(ty))
            .cloned();
        let is_resource = terminal.map(|ty| ty.is_resource()).unwrap_or(false);
        if !is_fas && !is_resource {
            return at;
        }

        // Unreachable blocks are either dead or about to be eliminated.
        if let Some(&source_block) = analysis.instruction_source_blocks.get(&result) {
            if !simulation.is_block_executable(source_block) {
                return at;
            }
        }

        let constants = simulation.constant_propagator();
        let divergence = simulation.divergence_propagator();

        if is_fas {
            // Constant composites never waterfall; the data is inlined or
            // moved to memory.
            if constants.is_constant(program, composite) {
                return at;
            }

            let mut any_varying = false;
            let mut any_divergent = false;
            let mut varying_operand_index = 0u32;
            for (index, chain) in chains.iter().enumerate() {
                if constants.is_varying(program, chain.index) {
                    any_varying = true;
                    varying_operand_index = index as u32;
                }
                if divergence.is_divergent(chain.index) {
                    any_divergent = true;
                }
            }

            // Varying alone compiles to dynamic register addressing; both
            // varying and divergent forces a waterfall loop.
            if !any_varying || !any_divergent {
                return at;
            }

            let sguid = bind_sguid(program, ctx, at);
            self.stream.lock().unwrap().push((
                self.waterfall_export_id,
                DecodedMessage::WaterfallingCondition(WaterfallingConditionMessage {
                    sguid,
                    varying_operand_index,
                }),
            ));
            return at;
        }

        // Already visited through another user path.
        if program.metadata.has(result, MetadataType::DivergentResourceIndex) {
            return at;
        }

        // Static uniformity proof suppresses the runtime check entirely.
        let checked: Vec<Id> = chains
            .iter()
            .map(|chain| chain.index)
            .filter(|&index| divergence.is_divergent(index))
            .collect();
        if checked.is_empty() {
            return at;
        }

        let span = source_of(program, at);
        let sguid = bind_sguid(program, ctx, at);
        let split = split_for_guard(program, at);

        // PRE: any lane disagreeing on any unproven chain index.
        {
            let mut pre =
                Emitter::new(program, at.function, split.pre_block).with_instrumented_source(span);
            let mut any_runtime_divergent = Id::INVALID;
            for index in checked {
                let equal = pre.wave_all_equal(index);
                let divergent = pre.not(equal);
                any_runtime_divergent = if any_runtime_divergent.is_valid() {
                    pre.or(any_runtime_divergent, divergent)
                } else {
                    divergent
                };
            }
            pre.branch_conditional(
                any_runtime_divergent,
                split.violation_block,
                split.resume_block,
                BranchControlFlow::selection(split.resume_block),
            );
        }

        {
            let mut emitter = Emitter::new(program, at.function, split.violation_block)
                .with_instrumented_source(span);
            let sguid_value = emitter.u32(sguid);
            let pad = emitter.u32(0);
            export_message(
                &mut emitter,
                ctx,
                self.divergent_export_id,
                MessageType::DivergentResourceIndexing,
                &[sguid_value, pad],
            );
            emitter.branch(split.resume_block);
        }

        // Later visits of the relocated chain skip it.
        program.metadata.add(result, MetadataType::DivergentResourceIndex);

        split.instruction
    }

    fn inject_extract(
        &self,
        program: &mut Program,
        ctx: &PassContext,
        at: InstructionRef,
        composite: Id,
        chains: &SmallVec<[AddressChainLink; 2]>,
    ) -> InstructionRef {
        let analysis = match program.analysis.get::<WaterfallAnalysis>() {
            Some(analysis) => analysis,
            None => return at,
        };
        let simulation = match analysis.per_function.get(&at.function) {
            Some(simulation) => simulation,
            None => return at,
        };
        let constants = simulation.constant_propagator();
        let divergence = simulation.divergence_propagator();

        if constants.is_constant(program, composite) {
            return at;
        }

        let mut any_varying = false;
        let mut any_divergent = false;
        let mut varying_operand_index = 0u32;
        for (index, chain) in chains.iter().enumerate() {
            if constants.is_varying(program, chain.index) {
                any_varying = true;
                varying_operand_index = index as u32;
            }
            if divergence.is_divergent(chain.index) {
                any_divergent = true;
            }
        }

        // Non-divergent varying extraction compiles to a mask cascade.
        if !any_varying || !any_divergent {
            return at;
        }

        let sguid = bind_sguid(program, ctx, at);
        self.stream.lock().unwrap().push((
            self.waterfall_export_id,
            DecodedMessage::WaterfallingCondition(WaterfallingConditionMessage {
                sguid,
                varying_operand_index,
            }),
        ));
        at
    }
}

impl Feature for WaterfallFeature {
    fn info(&self) -> FeatureInfo {
        FeatureInfo {
            name: "Waterfall",
            description: "Instrumentation and validation of address scalarization / waterfalling",
            bit: FeatureBits::DIVERGENT_INDEXING,
            dependencies: Vec::new(),
        }
    }

    fn install(&mut self, ctx: &mut InstallContext) -> bool {
        self.divergent_export_id = ctx.exports.allocate(MessageType::DivergentResourceIndexing);
        self.waterfall_export_id = ctx.exports.allocate(MessageType::WaterfallingCondition);
        true
    }

    fn export_ids(&self) -> Vec<ExportId> {
        vec![self.divergent_export_id, self.waterfall_export_id]
    }

    fn pre_inject(&self, program: &mut Program, _ctx: &PassContext) {
        let mut per_function = FxHashMap::default();
        let mut instruction_source_blocks = FxHashMap::default();

        for function in program.functions() {
            per_function.insert(function.id(), SimulationAnalysis::compute(program, function));

            for block in function.blocks().iter() {
                for instruction in &block.instructions {
                    match instruction.op {
                        Op::AddressChain { .. } | Op::Extract { .. } => {
                            instruction_source_blocks.insert(instruction.result, block.id());
                        }
                        _ => {}
                    }
                }
            }
        }

        program.analysis.insert(WaterfallAnalysis {
            per_function,
            instruction_source_blocks,
        });
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
            match op {
                Op::AddressChain { composite, chains } => {
                    self.inject_address_chain(program, ctx, at, composite, &chains, result)
                }
                Op::Extract { composite, chains } => {
                    self.inject_extract(program, ctx, at, composite, &chains)
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
