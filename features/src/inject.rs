//! Shared injection machinery: the user-instruction visitor, the
//! split-on-violation pattern, message emission into the export ring, and
//! texel property emission.

use crate::PassContext;
use aegis_addressing::bit_indexing;
use aegis_addressing::texel_address::{TexelAddress, TexelAddressEmitter};
use aegis_addressing::token::{ResourceTokenEmitter, TokenFields};
use aegis_export::schema::{pack_header, ExportId, MessageType};
use aegis_export::sguid::{Sguid, SourceMapping};
use aegis_ir::block::{BlockFlags, SplitFlags};
use aegis_ir::emitter::Emitter;
use aegis_ir::inst::{Instruction, Op, PhiValue};
use aegis_ir::program::Program;
use aegis_ir::Id;
use fxhash::FxHashSet;
use smallvec::SmallVec;

/// Location of one instruction.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct InstructionRef {
    pub function: Id,
    pub block: Id,
    pub index: usize,
}

/// Visit every user instruction of the program. Blocks flagged
/// `NO_INSTRUMENTATION` and instructions authored by passes (modified
/// source) are skipped. The visitor returns the final location of the
/// instruction it processed; iteration resumes after it, following blocks
/// the instruction moved into.
pub fn visit_user_instructions<F>(program: &mut Program, mut visitor: F)
where
    F: FnMut(&mut Program, InstructionRef) -> InstructionRef,
{
    let function_ids: Vec<Id> = program.functions().iter().map(|f| f.id()).collect();

    for function_id in function_ids {
        let mut scanned: FxHashSet<Id> = FxHashSet::default();

        // The order list grows as passes split blocks; iterate it by index
        // so blocks created mid-visit are reached too.
        let mut order_index = 0usize;
        loop {
            let start = match program
                .function(function_id)
                .and_then(|f| f.blocks().order().get(order_index).copied())
            {
                Some(start) => start,
                None => break,
            };
            order_index += 1;

            if scanned.contains(&start) {
                continue;
            }
            scanned.insert(start);

            let mut block = start;
            let mut index = 0usize;
            loop {
                let function = match program.function(function_id) {
                    Some(function) => function,
                    None => break,
                };
                let current = match function.block(block) {
                    Some(current) => current,
                    None => break,
                };
                if current.flags.contains(BlockFlags::NO_INSTRUMENTATION) {
                    break;
                }
                if index >= current.len() {
                    break;
                }
                if current.instructions[index].source.modified {
                    index += 1;
                    continue;
                }

                let location = visitor(program, InstructionRef { function: function_id, block, index });

                if location.block != block {
                    // The instruction moved; follow it.
                    scanned.insert(location.block);
                    block = location.block;
                }
                index = location.index + 1;
            }
        }
    }
}

/// Bind the SGUID of an instruction's source location.
pub fn bind_sguid(program: &Program, ctx: &PassContext, at: InstructionRef) -> Sguid {
    let span = program
        .function(at.function)
        .and_then(|f| f.block(at.block))
        .and_then(|b| b.instructions.get(at.index))
        .map(|i| i.source)
        .unwrap_or(aegis_ir::SourceSpan::INVALID);

    ctx.sguid.bind(SourceMapping {
        shader_guid: ctx.shader_guid,
        file_uid: span.file_uid,
        line: span.line,
        column: span.column,
        basic_block: at.block.0,
        instruction_index: at.index as u32,
    })
}

/// Source span of an instruction, for instrumented emission attribution.
pub fn source_of(program: &Program, at: InstructionRef) -> aegis_ir::SourceSpan {
    program
        .function(at.function)
        .and_then(|f| f.block(at.block))
        .and_then(|b| b.instructions.get(at.index))
        .map(|i| i.source)
        .unwrap_or(aegis_ir::SourceSpan::INVALID)
}

/// The blocks produced by a guard split.
#[derive(Copy, Clone, Debug)]
pub struct GuardSplit {
    /// The truncated block; guard arithmetic lands here.
    pub pre_block: Id,
    /// Violation block, flagged `NO_INSTRUMENTATION`.
    pub violation_block: Id,
    /// Resume block holding the original instruction at `instruction`.
    pub resume_block: Id,
    /// New location of the instrumented instruction.
    pub instruction: InstructionRef,
}

/// Split for the standard guard pattern:
///
/// ```text
///   pre ──ok──────────────► instruction [RESUME]
///    │                           ▲
///    └──violation──► [REPORT] ───┘
/// ```
///
/// The caller emits the guard condition into `pre_block`, terminated by
/// `BranchConditional(cond, violation_block, resume_block,
/// Selection(resume_block))`, and the report into `violation_block`.
pub fn split_for_guard(program: &mut Program, at: InstructionRef) -> GuardSplit {
    let resume_block;
    let violation_block;
    let point;
    {
        let (function, identifiers) = program
            .function_and_identifiers_mut(at.function)
            .expect("split target function");
        resume_block = function.alloc_block(identifiers);
        violation_block = function.alloc_block(identifiers);
        point = function.split_block(
            identifiers,
            at.block,
            resume_block,
            at.index,
            SplitFlags::standard(),
        );
        if let Some(block) = function.block_mut(violation_block) {
            block.flags |= BlockFlags::NO_INSTRUMENTATION;
        }
    }

    GuardSplit {
        pre_block: at.block,
        violation_block,
        resume_block,
        instruction: InstructionRef {
            function: at.function,
            block: point.block,
            index: point.index,
        },
    }
}

/// Reassign an instruction's result id, keeping the type map coherent.
/// Used by safe-guarding to re-route the original result through a phi.
pub fn redirect_result(program: &mut Program, at: InstructionRef, new_result: Id) {
    let old = {
        let function = program.function_mut(at.function).expect("function");
        let block = function.block_mut(at.block).expect("block");
        let instruction = &mut block.instructions[at.index];
        let old = instruction.result;
        instruction.result = new_result;
        old
    };
    if let Some(ty) = program.types.value_type(old) {
        program.types.set_value_type(new_result, ty);
    }
}

/// Insert a phi with a caller-chosen result id at the head of a block.
pub fn emit_phi_with_result(
    program: &mut Program,
    function: Id,
    block: Id,
    result: Id,
    type_id: Id,
    values: &[PhiValue],
) {
    program.types.set_value_type(result, type_id);
    let function = program.function_mut(function).expect("phi function");
    let block = function.block_mut(block).expect("phi block");
    block.insert(
        0,
        Instruction::new(result, Op::Phi { values: SmallVec::from_slice(values) }),
    );
}

/// Emit one exported message into the ring.
///
/// Protocol: atomically advance the ring counter by the record width, clamp
/// the index against the ring limit with `UMin` (overflow writes land in the
/// scratch tail and are discarded by the pump), then store the header and
/// payload words.
pub fn export_message(
    emitter: &mut Emitter,
    ctx: &PassContext,
    export_id: ExportId,
    message_type: MessageType,
    values: &[Id],
) {
    debug_assert_eq!(values.len(), message_type.payload_words());

    let ring = emitter
        .program()
        .shader_data
        .get(ctx.ring_data)
        .expect("export ring not attached to program");

    let record_words = emitter.u32(values.len() as u32 + 1);
    let zero = emitter.u32(0);

    // idx = UMin(AtomicIAdd(counter, n), limit)
    let counter = emitter.address_of(ring, zero);
    let index = emitter.atomic_add(counter, record_words);
    let limit = emitter.u32(ctx.ring_limit_words);
    let index = emitter.umin(index, limit);

    // Header, then payload. Message words start at ring word 1.
    let header = emitter.u32(pack_header(export_id, message_type));
    let one = emitter.u32(1);
    let base = emitter.add(index, one);
    let slot = emitter.address_of(ring, base);
    emitter.store(slot, header);

    for (offset, &value) in values.iter().enumerate() {
        let offset = emitter.u32(offset as u32 + 2);
        let element = emitter.add(index, offset);
        let slot = emitter.address_of(ring, element);
        emitter.store(slot, value);
    }
}

/// Texel properties of a resource access: token fields, the texel address of
/// the accessed coordinate, and the resource's mask base word.
pub struct TexelProperties {
    pub token: TokenFields,
    pub address: TexelAddress,
    /// 32-aligned base word of the resource's mask region.
    pub texel_base_offset_align_32: Id,
}

/// Emits texel properties for buffer and texture accesses, resolving the
/// PUID to its mask base through the feature's PUID-base shader data
/// buffer.
pub struct TexelPropertiesEmitter;

impl TexelPropertiesEmitter {
    pub fn emit(
        emitter: &mut Emitter,
        puid_base_data: aegis_export::shader_data::ShaderDataId,
        resource: Id,
        coordinate: Id,
        is_texture: bool,
        volumetric: bool,
    ) -> TexelProperties {
        let token = ResourceTokenEmitter::fields(emitter, resource);

        // puid -> mask base lookup.
        let puid_base_var = emitter
            .program()
            .shader_data
            .get(puid_base_data)
            .expect("puid base buffer not attached to program");
        let handle = emitter.load(puid_base_var);
        let loaded = emitter.load_buffer(handle, token.puid);
        let zero = emitter.u32(0);
        let base = emitter.extract(loaded, zero);

        let address_emitter = TexelAddressEmitter::new(emitter, &token);
        let address = if is_texture {
            let x = emitter.extract(coordinate, zero);
            let one = emitter.u32(1);
            let y = emitter.extract(coordinate, one);
            let two = emitter.u32(2);
            let z = emitter.extract(coordinate, two);
            let mip = emitter.u32(0);
            address_emitter.local_texture_texel_address(emitter, x, y, z, mip, volumetric)
        } else {
            let byte_offset = emitter.u32(0);
            address_emitter.local_buffer_texel_address(emitter, coordinate, byte_offset)
        };

        TexelProperties { token, address, texel_base_offset_align_32: base }
    }
}

/// The mask bit of an address, collapsed to zero when out of bounds so
/// atomic traffic is disabled without extra branching.
pub fn guarded_texel_bit(emitter: &mut Emitter, address: &TexelAddress) -> Id {
    let zero = emitter.u32(0);
    let bit = bit_indexing::texel_address_bit(emitter, address.texel_offset);
    emitter.select(address.is_out_of_bounds, zero, bit)
}
