//! Reference word-stream codec for the IR container format.
//!
//! The container mirrors the usual shader-binary shape: a five word header
//! (magic, version, generator, id bound, entry point) followed by a flat
//! instruction stream of `(word_count << 16) | opcode` records. Parsing
//! records the word range of every basic block; stitching reuses those bytes
//! verbatim for blocks that were never dirtied, and re-serializes the rest.

use crate::block::BasicBlock;
use crate::constant::Constant;
use crate::function::{Function, FunctionFlags};
use crate::inst::{
    AddressChainLink, AtomicOp, BinaryOp, BranchControlFlow, Instruction, Op, PhiValue,
    ResourceProperty, SwitchCase, UnaryOp,
};
use crate::program::{Program, Variable};
use crate::types::{AddressSpace, Format, SamplerMode, TextureDimension, Type};
use crate::{Error, Id, Result, SourceSpan};
use byteorder::{ByteOrder, LittleEndian};
use num_traits::FromPrimitive;
use smallvec::SmallVec;

pub const MAGIC: u32 = 0x5249_5641; // "AVIR"
pub const VERSION: u32 = (1 << 16) | 0;

/// Container op-codes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum OpCode {
    Nop = 0,
    TypeVoid = 1,
    TypeBool = 2,
    TypeInt = 3,
    TypeFp = 4,
    TypeVector = 5,
    TypeMatrix = 6,
    TypeArray = 7,
    TypeStruct = 8,
    TypePointer = 9,
    TypeBuffer = 10,
    TypeTexture = 11,
    TypeSampler = 12,
    TypeFunction = 13,
    TypeUnexposed = 14,
    ConstantBool = 15,
    ConstantInt = 16,
    ConstantFp = 17,
    ConstantVector = 18,
    ConstantStruct = 19,
    ConstantArray = 20,
    ConstantNull = 21,
    ConstantUndef = 22,
    ConstantUnexposed = 23,
    Variable = 24,
    Function = 25,
    FunctionParam = 26,
    FunctionEnd = 27,
    Label = 28,
    Branch = 29,
    BranchConditional = 30,
    Switch = 31,
    Phi = 32,
    Return = 33,
    Binary = 34,
    Unary = 35,
    Select = 36,
    Any = 37,
    All = 38,
    BitCast = 39,
    Construct = 40,
    Extract = 41,
    Load = 42,
    Store = 43,
    AddressOf = 44,
    AddressChain = 45,
    Atomic = 46,
    LoadBuffer = 47,
    StoreBuffer = 48,
    LoadTexture = 49,
    StoreTexture = 50,
    SampleTexture = 51,
    ResourceSize = 52,
    ResourceToken = 53,
    ResourceProperty = 54,
    DispatchThreadId = 55,
    LocalInvocationId = 56,
    WaveAllEqual = 57,
    Call = 58,
    SourceLoc = 59,
}

impl FromPrimitive for OpCode {
    fn from_i64(n: i64) -> Option<OpCode> {
        OpCode::from_u64(n as u64)
    }

    fn from_u64(n: u64) -> Option<OpCode> {
        if n <= OpCode::SourceLoc as u64 {
            // Discriminants are dense from 0.
            Some(unsafe { std::mem::transmute(n as u16) })
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Enum payload encodings

fn address_space_to_u32(space: AddressSpace) -> u32 {
    match space {
        AddressSpace::Function => 0,
        AddressSpace::GroupShared => 1,
        AddressSpace::Resource => 2,
        AddressSpace::Texel => 3,
        AddressSpace::Constant => 4,
        AddressSpace::Output => 5,
    }
}

fn address_space_from_u32(value: u32) -> Result<AddressSpace> {
    Ok(match value {
        0 => AddressSpace::Function,
        1 => AddressSpace::GroupShared,
        2 => AddressSpace::Resource,
        3 => AddressSpace::Texel,
        4 => AddressSpace::Constant,
        5 => AddressSpace::Output,
        _ => return Err(Error::Malformed("address space")),
    })
}

fn sampler_mode_to_u32(mode: SamplerMode) -> u32 {
    match mode {
        SamplerMode::RuntimeOnly => 0,
        SamplerMode::Compatible => 1,
        SamplerMode::Writable => 2,
    }
}

fn sampler_mode_from_u32(value: u32) -> Result<SamplerMode> {
    Ok(match value {
        0 => SamplerMode::RuntimeOnly,
        1 => SamplerMode::Compatible,
        2 => SamplerMode::Writable,
        _ => return Err(Error::Malformed("sampler mode")),
    })
}

fn format_to_u32(format: Format) -> u32 {
    match format {
        Format::None => 0,
        Format::R32UInt => 1,
        Format::R32SInt => 2,
        Format::R32Float => 3,
        Format::RG32UInt => 4,
        Format::RGBA32UInt => 5,
        Format::RGBA32Float => 6,
        Format::RGBA8 => 7,
        Format::Unexposed(raw) => 0x8000_0000 | raw,
    }
}

fn format_from_u32(value: u32) -> Result<Format> {
    Ok(match value {
        0 => Format::None,
        1 => Format::R32UInt,
        2 => Format::R32SInt,
        3 => Format::R32Float,
        4 => Format::RG32UInt,
        5 => Format::RGBA32UInt,
        6 => Format::RGBA32Float,
        7 => Format::RGBA8,
        raw if raw & 0x8000_0000 != 0 => Format::Unexposed(raw & 0x7fff_ffff),
        _ => return Err(Error::Malformed("texel format")),
    })
}

fn texture_dim_to_u32(dim: TextureDimension) -> u32 {
    match dim {
        TextureDimension::Texture1D => 0,
        TextureDimension::Texture2D => 1,
        TextureDimension::Texture3D => 2,
        TextureDimension::Texture1DArray => 3,
        TextureDimension::Texture2DArray => 4,
        TextureDimension::Texture2DCube => 5,
        TextureDimension::Texture2DCubeArray => 6,
        TextureDimension::SubPass => 7,
    }
}

fn texture_dim_from_u32(value: u32) -> Result<TextureDimension> {
    Ok(match value {
        0 => TextureDimension::Texture1D,
        1 => TextureDimension::Texture2D,
        2 => TextureDimension::Texture3D,
        3 => TextureDimension::Texture1DArray,
        4 => TextureDimension::Texture2DArray,
        5 => TextureDimension::Texture2DCube,
        6 => TextureDimension::Texture2DCubeArray,
        7 => TextureDimension::SubPass,
        _ => return Err(Error::Malformed("texture dimension")),
    })
}

fn binary_op_to_u32(op: BinaryOp) -> u32 {
    match op {
        BinaryOp::Add => 0,
        BinaryOp::Sub => 1,
        BinaryOp::Mul => 2,
        BinaryOp::Div => 3,
        BinaryOp::Rem => 4,
        BinaryOp::BitAnd => 5,
        BinaryOp::BitOr => 6,
        BinaryOp::BitXor => 7,
        BinaryOp::BitShiftLeft => 8,
        BinaryOp::BitShiftRight => 9,
        BinaryOp::And => 10,
        BinaryOp::Or => 11,
        BinaryOp::Equal => 12,
        BinaryOp::NotEqual => 13,
        BinaryOp::LessThan => 14,
        BinaryOp::LessThanEqual => 15,
        BinaryOp::GreaterThan => 16,
        BinaryOp::GreaterThanEqual => 17,
        BinaryOp::UMin => 18,
        BinaryOp::UMax => 19,
    }
}

fn binary_op_from_u32(value: u32) -> Result<BinaryOp> {
    Ok(match value {
        0 => BinaryOp::Add,
        1 => BinaryOp::Sub,
        2 => BinaryOp::Mul,
        3 => BinaryOp::Div,
        4 => BinaryOp::Rem,
        5 => BinaryOp::BitAnd,
        6 => BinaryOp::BitOr,
        7 => BinaryOp::BitXor,
        8 => BinaryOp::BitShiftLeft,
        9 => BinaryOp::BitShiftRight,
        10 => BinaryOp::And,
        11 => BinaryOp::Or,
        12 => BinaryOp::Equal,
        13 => BinaryOp::NotEqual,
        14 => BinaryOp::LessThan,
        15 => BinaryOp::LessThanEqual,
        16 => BinaryOp::GreaterThan,
        17 => BinaryOp::GreaterThanEqual,
        18 => BinaryOp::UMin,
        19 => BinaryOp::UMax,
        _ => return Err(Error::Malformed("binary op")),
    })
}

fn unary_op_to_u32(op: UnaryOp) -> u32 {
    match op {
        UnaryOp::Not => 0,
        UnaryOp::BitNot => 1,
        UnaryOp::Negate => 2,
        UnaryOp::IsNan => 3,
        UnaryOp::IsInf => 4,
        UnaryOp::FirstBitHigh => 5,
    }
}

fn unary_op_from_u32(value: u32) -> Result<UnaryOp> {
    Ok(match value {
        0 => UnaryOp::Not,
        1 => UnaryOp::BitNot,
        2 => UnaryOp::Negate,
        3 => UnaryOp::IsNan,
        4 => UnaryOp::IsInf,
        5 => UnaryOp::FirstBitHigh,
        _ => return Err(Error::Malformed("unary op")),
    })
}

fn atomic_op_to_u32(op: AtomicOp) -> u32 {
    match op {
        AtomicOp::Add => 0,
        AtomicOp::Or => 1,
        AtomicOp::And => 2,
        AtomicOp::Exchange => 3,
    }
}

fn atomic_op_from_u32(value: u32) -> Result<AtomicOp> {
    Ok(match value {
        0 => AtomicOp::Add,
        1 => AtomicOp::Or,
        2 => AtomicOp::And,
        3 => AtomicOp::Exchange,
        _ => return Err(Error::Malformed("atomic op")),
    })
}

fn resource_property_to_u32(property: ResourceProperty) -> u32 {
    match property {
        ResourceProperty::Width => 0,
        ResourceProperty::Height => 1,
        ResourceProperty::DepthOrSliceCount => 2,
        ResourceProperty::MipCount => 3,
        ResourceProperty::FormatSize => 4,
        ResourceProperty::ViewFormatSize => 5,
        ResourceProperty::ViewWidth => 6,
        ResourceProperty::ViewBaseWidth => 7,
        ResourceProperty::ViewBaseMip => 8,
        ResourceProperty::ViewBaseSlice => 9,
        ResourceProperty::ByteCount => 10,
        ResourceProperty::TexelCount => 11,
    }
}

fn resource_property_from_u32(value: u32) -> Result<ResourceProperty> {
    Ok(match value {
        0 => ResourceProperty::Width,
        1 => ResourceProperty::Height,
        2 => ResourceProperty::DepthOrSliceCount,
        3 => ResourceProperty::MipCount,
        4 => ResourceProperty::FormatSize,
        5 => ResourceProperty::ViewFormatSize,
        6 => ResourceProperty::ViewWidth,
        7 => ResourceProperty::ViewBaseWidth,
        8 => ResourceProperty::ViewBaseMip,
        9 => ResourceProperty::ViewBaseSlice,
        10 => ResourceProperty::ByteCount,
        11 => ResourceProperty::TexelCount,
        _ => return Err(Error::Malformed("resource property")),
    })
}

// ---------------------------------------------------------------------------
// Writer

struct Writer {
    words: Vec<u32>,
}

impl Writer {
    fn op(&mut self, code: OpCode, operands: &[u32]) {
        self.words
            .push(((operands.len() as u32 + 1) << 16) | code as u32);
        self.words.extend_from_slice(operands);
    }

    /// Raw record for unexposed round-trips.
    fn raw(&mut self, foreign_op: u32, operands: &[u32]) {
        self.words
            .push(((operands.len() as u32 + 1) << 16) | (foreign_op & 0xffff));
        self.words.extend_from_slice(operands);
    }
}

fn encode_value_type(program: &Program, result: Id) -> u32 {
    program.types.value_type(result).unwrap_or(Id::INVALID).0
}

/// Serialize one instruction. `span` is the running source location state of
/// the enclosing block.
fn encode_instruction(
    writer: &mut Writer,
    program: &Program,
    instruction: &Instruction,
    span: &mut SourceSpan,
) {
    // Source directives are block-scoped; emit on change only.
    let current = instruction.source;
    if (current.file_uid, current.line, current.column)
        != (span.file_uid, span.line, span.column)
    {
        writer.op(OpCode::SourceLoc, &[current.file_uid, current.line, current.column]);
        *span = current;
    }

    let result = instruction.result.0;
    let ty = encode_value_type(program, instruction.result);

    match &instruction.op {
        Op::Nop => writer.op(OpCode::Nop, &[]),
        Op::Binary { op, lhs, rhs } => writer.op(
            OpCode::Binary,
            &[result, ty, binary_op_to_u32(*op), lhs.0, rhs.0],
        ),
        Op::Unary { op, value } => {
            writer.op(OpCode::Unary, &[result, ty, unary_op_to_u32(*op), value.0])
        }
        Op::Select { condition, pass, fail } => {
            writer.op(OpCode::Select, &[result, ty, condition.0, pass.0, fail.0])
        }
        Op::Any { value } => writer.op(OpCode::Any, &[result, ty, value.0]),
        Op::All { value } => writer.op(OpCode::All, &[result, ty, value.0]),
        Op::BitCast { value } => writer.op(OpCode::BitCast, &[result, ty, value.0]),
        Op::Construct { values } => {
            let mut operands = vec![result, ty];
            operands.extend(values.iter().map(|v| v.0));
            writer.op(OpCode::Construct, &operands);
        }
        Op::Extract { composite, chains } => {
            let mut operands = vec![result, ty, composite.0];
            operands.extend(chains.iter().map(|c| c.index.0));
            writer.op(OpCode::Extract, &operands);
        }
        Op::Load { address } => writer.op(OpCode::Load, &[result, ty, address.0]),
        Op::Store { address, value } => writer.op(OpCode::Store, &[address.0, value.0]),
        Op::AddressOf { composite, index } => {
            writer.op(OpCode::AddressOf, &[result, ty, composite.0, index.0])
        }
        Op::AddressChain { composite, chains } => {
            let mut operands = vec![result, ty, composite.0];
            operands.extend(chains.iter().map(|c| c.index.0));
            writer.op(OpCode::AddressChain, &operands);
        }
        Op::Atomic { op, address, value } => writer.op(
            OpCode::Atomic,
            &[result, ty, atomic_op_to_u32(*op), address.0, value.0],
        ),
        Op::LoadBuffer { buffer, index } => {
            writer.op(OpCode::LoadBuffer, &[result, ty, buffer.0, index.0])
        }
        Op::StoreBuffer { buffer, index, value } => {
            writer.op(OpCode::StoreBuffer, &[buffer.0, index.0, value.0])
        }
        Op::LoadTexture { texture, index } => {
            writer.op(OpCode::LoadTexture, &[result, ty, texture.0, index.0])
        }
        Op::StoreTexture { texture, index, value } => {
            writer.op(OpCode::StoreTexture, &[texture.0, index.0, value.0])
        }
        Op::SampleTexture { texture, sampler, coordinate } => writer.op(
            OpCode::SampleTexture,
            &[result, ty, texture.0, sampler.0, coordinate.0],
        ),
        Op::ResourceSize { resource } => {
            writer.op(OpCode::ResourceSize, &[result, ty, resource.0])
        }
        Op::ResourceToken { resource } => {
            writer.op(OpCode::ResourceToken, &[result, ty, resource.0])
        }
        Op::ResourceProperty { resource, property } => writer.op(
            OpCode::ResourceProperty,
            &[result, ty, resource.0, resource_property_to_u32(*property)],
        ),
        Op::DispatchThreadId => writer.op(OpCode::DispatchThreadId, &[result, ty]),
        Op::LocalInvocationId => writer.op(OpCode::LocalInvocationId, &[result, ty]),
        Op::WaveAllEqual { value } => writer.op(OpCode::WaveAllEqual, &[result, ty, value.0]),
        Op::Call { function, arguments } => {
            let mut operands = vec![result, ty, function.0];
            operands.extend(arguments.iter().map(|a| a.0));
            writer.op(OpCode::Call, &operands);
        }
        Op::Branch { target } => writer.op(OpCode::Branch, &[target.0]),
        Op::BranchConditional { condition, pass, fail, control_flow } => writer.op(
            OpCode::BranchConditional,
            &[
                condition.0,
                pass.0,
                fail.0,
                control_flow.merge.0,
                control_flow.continue_block.0,
            ],
        ),
        Op::Switch { value, default, cases } => {
            let mut operands = vec![value.0, default.0];
            for case in cases {
                operands.push(case.literal);
                operands.push(case.block.0);
            }
            writer.op(OpCode::Switch, &operands);
        }
        Op::Phi { values } => {
            let mut operands = vec![result, ty];
            for value in values {
                operands.push(value.value.0);
                operands.push(value.block.0);
            }
            writer.op(OpCode::Phi, &operands);
        }
        Op::Return { value } => writer.op(OpCode::Return, &[value.0]),
        Op::Unexposed { foreign_op, operands } => writer.raw(*foreign_op, operands),
    }
}

fn encode_block(writer: &mut Writer, program: &Program, block: &BasicBlock) {
    writer.op(OpCode::Label, &[block.id().0, block.flags.bits()]);
    let mut span = SourceSpan::INVALID;
    for instruction in &block.instructions {
        encode_instruction(writer, program, instruction, &mut span);
    }
}

fn encode_preamble(writer: &mut Writer, program: &Program) {
    for (id, ty) in program.types.iter_ordered() {
        match ty {
            Type::Void => writer.op(OpCode::TypeVoid, &[id.0]),
            Type::Bool => writer.op(OpCode::TypeBool, &[id.0]),
            Type::Int { bit_width, signed } => writer.op(
                OpCode::TypeInt,
                &[id.0, *bit_width as u32, *signed as u32],
            ),
            Type::Fp { bit_width } => writer.op(OpCode::TypeFp, &[id.0, *bit_width as u32]),
            Type::Vector { elem, dim } => {
                writer.op(OpCode::TypeVector, &[id.0, elem.0, *dim as u32])
            }
            Type::Matrix { rows, cols, elem } => writer.op(
                OpCode::TypeMatrix,
                &[id.0, elem.0, *rows as u32, *cols as u32],
            ),
            Type::Array { elem, count } => {
                writer.op(OpCode::TypeArray, &[id.0, elem.0, *count])
            }
            Type::Struct { members } => {
                let mut operands = vec![id.0];
                operands.extend(members.iter().map(|m| m.0));
                writer.op(OpCode::TypeStruct, &operands);
            }
            Type::Pointer { pointee, space } => writer.op(
                OpCode::TypePointer,
                &[id.0, pointee.0, address_space_to_u32(*space)],
            ),
            Type::Buffer { elem, sampler_mode, texel_format } => writer.op(
                OpCode::TypeBuffer,
                &[
                    id.0,
                    elem.0,
                    sampler_mode_to_u32(*sampler_mode),
                    format_to_u32(*texel_format),
                ],
            ),
            Type::Texture { dim, elem, sampler_mode, texel_format } => writer.op(
                OpCode::TypeTexture,
                &[
                    id.0,
                    elem.0,
                    texture_dim_to_u32(*dim),
                    sampler_mode_to_u32(*sampler_mode),
                    format_to_u32(*texel_format),
                ],
            ),
            Type::Sampler => writer.op(OpCode::TypeSampler, &[id.0]),
            Type::Function { ret, params } => {
                let mut operands = vec![id.0, ret.0];
                operands.extend(params.iter().map(|p| p.0));
                writer.op(OpCode::TypeFunction, &operands);
            }
            Type::Unexposed { foreign_op } => {
                writer.op(OpCode::TypeUnexposed, &[id.0, *foreign_op])
            }
        }
    }

    for (id, ty, constant) in program.constants.iter_ordered() {
        match constant {
            Constant::Bool(value) => {
                writer.op(OpCode::ConstantBool, &[id.0, ty.0, *value as u32])
            }
            Constant::Int(value) => {
                let raw = *value as u64;
                writer.op(
                    OpCode::ConstantInt,
                    &[id.0, ty.0, raw as u32, (raw >> 32) as u32],
                );
            }
            Constant::Fp(value) => {
                let raw = value.into_inner().to_bits();
                writer.op(
                    OpCode::ConstantFp,
                    &[id.0, ty.0, raw as u32, (raw >> 32) as u32],
                );
            }
            Constant::Vector(members) | Constant::Struct(members) | Constant::Array(members) => {
                let code = match constant {
                    Constant::Vector(_) => OpCode::ConstantVector,
                    Constant::Struct(_) => OpCode::ConstantStruct,
                    _ => OpCode::ConstantArray,
                };
                let mut operands = vec![id.0, ty.0];
                operands.extend(members.iter().map(|m| m.0));
                writer.op(code, &operands);
            }
            Constant::Null => writer.op(OpCode::ConstantNull, &[id.0, ty.0]),
            Constant::Undef => writer.op(OpCode::ConstantUndef, &[id.0, ty.0]),
            Constant::Unexposed => writer.op(OpCode::ConstantUnexposed, &[id.0, ty.0]),
        }
    }

    for variable in &program.variables {
        writer.op(
            OpCode::Variable,
            &[
                variable.id.0,
                variable.type_id.0,
                address_space_to_u32(variable.space),
                variable.binding.map(|b| b + 1).unwrap_or(0),
            ],
        );
    }

    for (foreign_op, operands) in &program.preamble_unexposed {
        writer.raw(*foreign_op, operands);
    }
}

/// Serialize a program. Blocks that are not dirty reuse their source words.
pub fn stitch(program: &Program) -> Vec<u32> {
    let any_dirty = program
        .functions()
        .iter()
        .flat_map(|f| f.blocks().iter())
        .any(|b| b.is_dirty());
    let counts_match = program.parsed_counts
        == Some((
            program.types.len(),
            program.constants.len(),
            program.variables.len(),
        ));
    let bound_matches = program
        .source_words
        .get(3)
        .map(|&bound| bound == program.identifiers.bound())
        .unwrap_or(false);

    // Untouched module: hand back the original bytes.
    if !program.source_words.is_empty() && !any_dirty && counts_match && bound_matches {
        return program.source_words.clone();
    }

    let mut writer = Writer { words: Vec::new() };
    writer.words.extend_from_slice(&[
        MAGIC,
        VERSION,
        0,
        program.identifiers.bound(),
        program.entry_point().0,
    ]);

    encode_preamble(&mut writer, program);

    for function in program.functions() {
        writer.op(
            OpCode::Function,
            &[function.id().0, function.type_id.0, function.flags.bits()],
        );
        for &param in &function.parameters {
            let ty = encode_value_type(program, param);
            writer.op(OpCode::FunctionParam, &[param.0, ty]);
        }
        for block in function.blocks().iter() {
            match (block.is_dirty(), block.source_range) {
                (false, Some((start, end))) if end <= program.source_words.len() => {
                    writer.words.extend_from_slice(&program.source_words[start..end]);
                }
                _ => encode_block(&mut writer, program, block),
            }
        }
        writer.op(OpCode::FunctionEnd, &[]);
    }

    writer.words
}

pub fn stitch_bytes(program: &Program) -> Vec<u8> {
    let words = stitch(program);
    let mut bytes = vec![0u8; words.len() * 4];
    LittleEndian::write_u32_into(&words, &mut bytes);
    bytes
}

// ---------------------------------------------------------------------------
// Reader

struct RawInstruction<'m> {
    opcode: u16,
    operands: &'m [u32],
}

fn decode_raw_instruction(words: &[u32]) -> Result<(RawInstruction, usize)> {
    let word_count = (words[0] >> 16) as usize;
    if word_count < 1 {
        return Err(Error::Malformed("zero length instruction"));
    }
    if words.len() < word_count {
        return Err(Error::IncompleteInstruction);
    }
    Ok((
        RawInstruction {
            opcode: (words[0] & 0xffff) as u16,
            operands: &words[1..word_count],
        },
        word_count,
    ))
}

fn operand(operands: &[u32], index: usize) -> Result<u32> {
    operands
        .get(index)
        .copied()
        .ok_or(Error::Malformed("missing operand"))
}

fn id_operand(operands: &[u32], index: usize) -> Result<Id> {
    Ok(Id(operand(operands, index)?))
}

/// Parse a module from little-endian bytes, sniffing the byte order from the
/// magic number.
pub fn parse_bytes(bytes: &[u8]) -> Result<Program> {
    if bytes.len() < 20 || bytes.len() % 4 != 0 {
        return Err(Error::MissingHeader);
    }

    let magic = MAGIC.to_le_bytes();
    let words: Vec<u32> = if bytes[0] == magic[0] && bytes[1] == magic[1] {
        let mut words = vec![0u32; bytes.len() / 4];
        LittleEndian::read_u32_into(bytes, &mut words);
        words
    } else if bytes[3] == magic[0] && bytes[2] == magic[1] {
        bytes
            .chunks(4)
            .map(|c| ((c[0] as u32) << 24) | ((c[1] as u32) << 16) | ((c[2] as u32) << 8) | c[3] as u32)
            .collect()
    } else {
        return Err(Error::MissingHeader);
    };

    parse(&words)
}

/// Parse a module from its word stream.
pub fn parse(words: &[u32]) -> Result<Program> {
    if words.len() < 5 {
        return Err(Error::MissingHeader);
    }
    if words[0] != MAGIC {
        return Err(Error::WrongHeader);
    }

    let mut program = Program::new();
    program.identifiers = crate::program::IdentifierMap::with_bound(words[3]);
    program.set_entry_point(Id(words[4]));
    program.source_words = words.to_vec();

    let mut current_function: Option<Function> = None;
    let mut current_block: Option<(Id, usize)> = None;
    let mut block_instructions: Vec<Instruction> = Vec::new();
    let mut block_flags = 0u32;
    let mut span = SourceSpan::INVALID;
    let mut exposed_any = false;

    let mut ptr = 5usize;
    while ptr < words.len() {
        let (raw, word_count) = decode_raw_instruction(&words[ptr..])?;
        let next_ptr = ptr + word_count;
        let operands = raw.operands;

        let code = OpCode::from_u64(raw.opcode as u64);

        // Block boundaries close at the next label, function end, or stream
        // end; handled before dispatch below.
        let closes_block = match code {
            Some(OpCode::Label) | Some(OpCode::FunctionEnd) => true,
            _ => false,
        };
        if closes_block {
            if let (Some(function), Some((block_id, start))) =
                (current_function.as_mut(), current_block.take())
            {
                let mut block = BasicBlock::new(block_id);
                block.flags = crate::block::BlockFlags::from_bits_truncate(block_flags);
                block.instructions = std::mem::replace(&mut block_instructions, Vec::new());
                block.source_range = Some((start, ptr));
                block.mark_clean();
                function.blocks_mut().add_with_id(block);
            }
            span = SourceSpan::INVALID;
        }

        match code {
            None => {
                // Foreign instruction; keep it for the round trip.
                if current_block.is_some() {
                    block_instructions.push(Instruction::with_source(
                        Id::INVALID,
                        Op::Unexposed {
                            foreign_op: raw.opcode as u32,
                            operands: SmallVec::from_slice(operands),
                        },
                        span,
                    ));
                } else {
                    program
                        .preamble_unexposed
                        .push((raw.opcode as u32, operands.to_vec()));
                }
            }
            Some(OpCode::Nop) => {
                if current_block.is_some() {
                    block_instructions.push(Instruction::with_source(Id::INVALID, Op::Nop, span));
                }
            }
            Some(OpCode::SourceLoc) => {
                span = SourceSpan {
                    file_uid: operand(operands, 0)?,
                    line: operand(operands, 1)?,
                    column: operand(operands, 2)?,
                    modified: false,
                };
            }
            Some(OpCode::Label) => {
                if current_function.is_none() {
                    return Err(Error::Malformed("label outside function"));
                }
                let id = id_operand(operands, 0)?;
                block_flags = operand(operands, 1)?;
                current_block = Some((id, ptr));
            }
            Some(OpCode::Function) => {
                if current_function.is_some() {
                    return Err(Error::Malformed("nested function"));
                }
                let id = id_operand(operands, 0)?;
                let type_id = id_operand(operands, 1)?;
                let mut function = Function::new(id, type_id);
                function.flags = FunctionFlags::from_bits_truncate(operand(operands, 2)?);
                current_function = Some(function);
            }
            Some(OpCode::FunctionParam) => {
                let function = current_function
                    .as_mut()
                    .ok_or(Error::Malformed("parameter outside function"))?;
                let id = id_operand(operands, 0)?;
                let ty = id_operand(operands, 1)?;
                function.parameters.push(id);
                program.types.set_value_type(id, ty);
            }
            Some(OpCode::FunctionEnd) => {
                let function = current_function
                    .take()
                    .ok_or(Error::Malformed("function end outside function"))?;
                program.add_function(function);
            }
            Some(code) => {
                if current_function.is_some() {
                    if current_block.is_none() {
                        return Err(Error::Malformed("instruction outside block"));
                    }
                    exposed_any = true;
                    block_instructions.push(decode_body_instruction(
                        &mut program,
                        code,
                        operands,
                        span,
                    )?);
                } else {
                    exposed_any = true;
                    decode_preamble_instruction(&mut program, code, operands)?;
                }
            }
        }

        ptr = next_ptr;
    }

    // Stream ended mid-function: the final block never sealed.
    if current_function.is_some() || current_block.is_some() {
        return Err(Error::Malformed("unterminated function"));
    }

    if !exposed_any {
        return Err(Error::UnexposedOnly);
    }

    program.parsed_counts = Some((
        program.types.len(),
        program.constants.len(),
        program.variables.len(),
    ));

    debug!(
        "parsed module: {} functions, {} types, {} constants",
        program.functions().len(),
        program.types.len(),
        program.constants.len()
    );

    Ok(program)
}

fn decode_preamble_instruction(
    program: &mut Program,
    code: OpCode,
    operands: &[u32],
) -> Result<()> {
    match code {
        OpCode::TypeVoid => {
            let id = id_operand(operands, 0)?;
            program.types.add_with_id(id, Type::Void);
        }
        OpCode::TypeBool => {
            let id = id_operand(operands, 0)?;
            program.types.add_with_id(id, Type::Bool);
        }
        OpCode::TypeInt => {
            let id = id_operand(operands, 0)?;
            program.types.add_with_id(
                id,
                Type::Int {
                    bit_width: operand(operands, 1)? as u8,
                    signed: operand(operands, 2)? != 0,
                },
            );
        }
        OpCode::TypeFp => {
            let id = id_operand(operands, 0)?;
            program
                .types
                .add_with_id(id, Type::Fp { bit_width: operand(operands, 1)? as u8 });
        }
        OpCode::TypeVector => {
            let id = id_operand(operands, 0)?;
            program.types.add_with_id(
                id,
                Type::Vector {
                    elem: id_operand(operands, 1)?,
                    dim: operand(operands, 2)? as u8,
                },
            );
        }
        OpCode::TypeMatrix => {
            let id = id_operand(operands, 0)?;
            program.types.add_with_id(
                id,
                Type::Matrix {
                    elem: id_operand(operands, 1)?,
                    rows: operand(operands, 2)? as u8,
                    cols: operand(operands, 3)? as u8,
                },
            );
        }
        OpCode::TypeArray => {
            let id = id_operand(operands, 0)?;
            program.types.add_with_id(
                id,
                Type::Array {
                    elem: id_operand(operands, 1)?,
                    count: operand(operands, 2)?,
                },
            );
        }
        OpCode::TypeStruct => {
            let id = id_operand(operands, 0)?;
            let members = operands[1..].iter().map(|&m| Id(m)).collect();
            program.types.add_with_id(id, Type::Struct { members });
        }
        OpCode::TypePointer => {
            let id = id_operand(operands, 0)?;
            program.types.add_with_id(
                id,
                Type::Pointer {
                    pointee: id_operand(operands, 1)?,
                    space: address_space_from_u32(operand(operands, 2)?)?,
                },
            );
        }
        OpCode::TypeBuffer => {
            let id = id_operand(operands, 0)?;
            program.types.add_with_id(
                id,
                Type::Buffer {
                    elem: id_operand(operands, 1)?,
                    sampler_mode: sampler_mode_from_u32(operand(operands, 2)?)?,
                    texel_format: format_from_u32(operand(operands, 3)?)?,
                },
            );
        }
        OpCode::TypeTexture => {
            let id = id_operand(operands, 0)?;
            program.types.add_with_id(
                id,
                Type::Texture {
                    elem: id_operand(operands, 1)?,
                    dim: texture_dim_from_u32(operand(operands, 2)?)?,
                    sampler_mode: sampler_mode_from_u32(operand(operands, 3)?)?,
                    texel_format: format_from_u32(operand(operands, 4)?)?,
                },
            );
        }
        OpCode::TypeSampler => {
            let id = id_operand(operands, 0)?;
            program.types.add_with_id(id, Type::Sampler);
        }
        OpCode::TypeFunction => {
            let id = id_operand(operands, 0)?;
            program.types.add_with_id(
                id,
                Type::Function {
                    ret: id_operand(operands, 1)?,
                    params: operands[2..].iter().map(|&p| Id(p)).collect(),
                },
            );
        }
        OpCode::TypeUnexposed => {
            let id = id_operand(operands, 0)?;
            program
                .types
                .add_with_id(id, Type::Unexposed { foreign_op: operand(operands, 1)? });
        }
        OpCode::ConstantBool => {
            let id = id_operand(operands, 0)?;
            let ty = id_operand(operands, 1)?;
            program
                .constants
                .add_with_id(id, ty, Constant::Bool(operand(operands, 2)? != 0));
        }
        OpCode::ConstantInt => {
            let id = id_operand(operands, 0)?;
            let ty = id_operand(operands, 1)?;
            let raw = operand(operands, 2)? as u64 | ((operand(operands, 3)? as u64) << 32);
            program.constants.add_with_id(id, ty, Constant::Int(raw as i64));
        }
        OpCode::ConstantFp => {
            let id = id_operand(operands, 0)?;
            let ty = id_operand(operands, 1)?;
            let raw = operand(operands, 2)? as u64 | ((operand(operands, 3)? as u64) << 32);
            program.constants.add_with_id(
                id,
                ty,
                Constant::Fp(ordered_float::OrderedFloat(f64::from_bits(raw))),
            );
        }
        OpCode::ConstantVector | OpCode::ConstantStruct | OpCode::ConstantArray => {
            let id = id_operand(operands, 0)?;
            let ty = id_operand(operands, 1)?;
            let members: Vec<Id> = operands[2..].iter().map(|&m| Id(m)).collect();
            let constant = match code {
                OpCode::ConstantVector => Constant::Vector(members),
                OpCode::ConstantStruct => Constant::Struct(members),
                _ => Constant::Array(members),
            };
            program.constants.add_with_id(id, ty, constant);
        }
        OpCode::ConstantNull => {
            let id = id_operand(operands, 0)?;
            let ty = id_operand(operands, 1)?;
            program.constants.add_with_id(id, ty, Constant::Null);
        }
        OpCode::ConstantUndef => {
            let id = id_operand(operands, 0)?;
            let ty = id_operand(operands, 1)?;
            program.constants.add_with_id(id, ty, Constant::Undef);
        }
        OpCode::ConstantUnexposed => {
            let id = id_operand(operands, 0)?;
            let ty = id_operand(operands, 1)?;
            program.constants.add_with_id(id, ty, Constant::Unexposed);
        }
        OpCode::Variable => {
            let id = id_operand(operands, 0)?;
            let type_id = id_operand(operands, 1)?;
            let space = address_space_from_u32(operand(operands, 2)?)?;
            let binding_raw = operand(operands, 3)?;
            let binding = if binding_raw == 0 { None } else { Some(binding_raw - 1) };
            program.variables.push(Variable { id, type_id, space, binding });
            program.types.set_value_type(id, type_id);
        }
        _ => return Err(Error::Malformed("body instruction in preamble")),
    }
    Ok(())
}

fn decode_body_instruction(
    program: &mut Program,
    code: OpCode,
    operands: &[u32],
    span: SourceSpan,
) -> Result<Instruction> {
    // Value ops share the [result, type, ...] prefix.
    let typed = |program: &mut Program, operands: &[u32]| -> Result<Id> {
        let result = id_operand(operands, 0)?;
        let ty = id_operand(operands, 1)?;
        program.types.set_value_type(result, ty);
        Ok(result)
    };

    let instruction = match code {
        OpCode::Binary => {
            let result = typed(program, operands)?;
            Instruction::with_source(
                result,
                Op::Binary {
                    op: binary_op_from_u32(operand(operands, 2)?)?,
                    lhs: id_operand(operands, 3)?,
                    rhs: id_operand(operands, 4)?,
                },
                span,
            )
        }
        OpCode::Unary => {
            let result = typed(program, operands)?;
            Instruction::with_source(
                result,
                Op::Unary {
                    op: unary_op_from_u32(operand(operands, 2)?)?,
                    value: id_operand(operands, 3)?,
                },
                span,
            )
        }
        OpCode::Select => {
            let result = typed(program, operands)?;
            Instruction::with_source(
                result,
                Op::Select {
                    condition: id_operand(operands, 2)?,
                    pass: id_operand(operands, 3)?,
                    fail: id_operand(operands, 4)?,
                },
                span,
            )
        }
        OpCode::Any => {
            let result = typed(program, operands)?;
            Instruction::with_source(result, Op::Any { value: id_operand(operands, 2)? }, span)
        }
        OpCode::All => {
            let result = typed(program, operands)?;
            Instruction::with_source(result, Op::All { value: id_operand(operands, 2)? }, span)
        }
        OpCode::BitCast => {
            let result = typed(program, operands)?;
            Instruction::with_source(result, Op::BitCast { value: id_operand(operands, 2)? }, span)
        }
        OpCode::Construct => {
            let result = typed(program, operands)?;
            Instruction::with_source(
                result,
                Op::Construct { values: operands[2..].iter().map(|&v| Id(v)).collect() },
                span,
            )
        }
        OpCode::Extract => {
            let result = typed(program, operands)?;
            Instruction::with_source(
                result,
                Op::Extract {
                    composite: id_operand(operands, 2)?,
                    chains: operands[3..]
                        .iter()
                        .map(|&i| AddressChainLink { index: Id(i) })
                        .collect(),
                },
                span,
            )
        }
        OpCode::Load => {
            let result = typed(program, operands)?;
            Instruction::with_source(result, Op::Load { address: id_operand(operands, 2)? }, span)
        }
        OpCode::Store => Instruction::with_source(
            Id::INVALID,
            Op::Store {
                address: id_operand(operands, 0)?,
                value: id_operand(operands, 1)?,
            },
            span,
        ),
        OpCode::AddressOf => {
            let result = typed(program, operands)?;
            Instruction::with_source(
                result,
                Op::AddressOf {
                    composite: id_operand(operands, 2)?,
                    index: id_operand(operands, 3)?,
                },
                span,
            )
        }
        OpCode::AddressChain => {
            let result = typed(program, operands)?;
            Instruction::with_source(
                result,
                Op::AddressChain {
                    composite: id_operand(operands, 2)?,
                    chains: operands[3..]
                        .iter()
                        .map(|&i| AddressChainLink { index: Id(i) })
                        .collect(),
                },
                span,
            )
        }
        OpCode::Atomic => {
            let result = typed(program, operands)?;
            Instruction::with_source(
                result,
                Op::Atomic {
                    op: atomic_op_from_u32(operand(operands, 2)?)?,
                    address: id_operand(operands, 3)?,
                    value: id_operand(operands, 4)?,
                },
                span,
            )
        }
        OpCode::LoadBuffer => {
            let result = typed(program, operands)?;
            Instruction::with_source(
                result,
                Op::LoadBuffer {
                    buffer: id_operand(operands, 2)?,
                    index: id_operand(operands, 3)?,
                },
                span,
            )
        }
        OpCode::StoreBuffer => Instruction::with_source(
            Id::INVALID,
            Op::StoreBuffer {
                buffer: id_operand(operands, 0)?,
                index: id_operand(operands, 1)?,
                value: id_operand(operands, 2)?,
            },
            span,
        ),
        OpCode::LoadTexture => {
            let result = typed(program, operands)?;
            Instruction::with_source(
                result,
                Op::LoadTexture {
                    texture: id_operand(operands, 2)?,
                    index: id_operand(operands, 3)?,
                },
                span,
            )
        }
        OpCode::StoreTexture => Instruction::with_source(
            Id::INVALID,
            Op::StoreTexture {
                texture: id_operand(operands, 0)?,
                index: id_operand(operands, 1)?,
                value: id_operand(operands, 2)?,
            },
            span,
        ),
        OpCode::SampleTexture => {
            let result = typed(program, operands)?;
            Instruction::with_source(
                result,
                Op::SampleTexture {
                    texture: id_operand(operands, 2)?,
                    sampler: id_operand(operands, 3)?,
                    coordinate: id_operand(operands, 4)?,
                },
                span,
            )
        }
        OpCode::ResourceSize => {
            let result = typed(program, operands)?;
            Instruction::with_source(
                result,
                Op::ResourceSize { resource: id_operand(operands, 2)? },
                span,
            )
        }
        OpCode::ResourceToken => {
            let result = typed(program, operands)?;
            Instruction::with_source(
                result,
                Op::ResourceToken { resource: id_operand(operands, 2)? },
                span,
            )
        }
        OpCode::ResourceProperty => {
            let result = typed(program, operands)?;
            Instruction::with_source(
                result,
                Op::ResourceProperty {
                    resource: id_operand(operands, 2)?,
                    property: resource_property_from_u32(operand(operands, 3)?)?,
                },
                span,
            )
        }
        OpCode::DispatchThreadId => {
            let result = typed(program, operands)?;
            Instruction::with_source(result, Op::DispatchThreadId, span)
        }
        OpCode::LocalInvocationId => {
            let result = typed(program, operands)?;
            Instruction::with_source(result, Op::LocalInvocationId, span)
        }
        OpCode::WaveAllEqual => {
            let result = typed(program, operands)?;
            Instruction::with_source(
                result,
                Op::WaveAllEqual { value: id_operand(operands, 2)? },
                span,
            )
        }
        OpCode::Call => {
            let result = typed(program, operands)?;
            Instruction::with_source(
                result,
                Op::Call {
                    function: id_operand(operands, 2)?,
                    arguments: operands[3..].iter().map(|&a| Id(a)).collect(),
                },
                span,
            )
        }
        OpCode::Branch => Instruction::with_source(
            Id::INVALID,
            Op::Branch { target: id_operand(operands, 0)? },
            span,
        ),
        OpCode::BranchConditional => Instruction::with_source(
            Id::INVALID,
            Op::BranchConditional {
                condition: id_operand(operands, 0)?,
                pass: id_operand(operands, 1)?,
                fail: id_operand(operands, 2)?,
                control_flow: BranchControlFlow {
                    merge: id_operand(operands, 3)?,
                    continue_block: id_operand(operands, 4)?,
                },
            },
            span,
        ),
        OpCode::Switch => {
            let value = id_operand(operands, 0)?;
            let default = id_operand(operands, 1)?;
            let mut cases = SmallVec::new();
            let mut index = 2;
            while index + 1 < operands.len() {
                cases.push(SwitchCase {
                    literal: operands[index],
                    block: Id(operands[index + 1]),
                });
                index += 2;
            }
            Instruction::with_source(Id::INVALID, Op::Switch { value, default, cases }, span)
        }
        OpCode::Phi => {
            let result = typed(program, operands)?;
            let mut values = SmallVec::new();
            let mut index = 2;
            while index + 1 < operands.len() {
                values.push(PhiValue {
                    value: Id(operands[index]),
                    block: Id(operands[index + 1]),
                });
                index += 2;
            }
            Instruction::with_source(result, Op::Phi { values }, span)
        }
        OpCode::Return => Instruction::with_source(
            Id::INVALID,
            Op::Return { value: id_operand(operands, 0)? },
            span,
        ),
        _ => return Err(Error::Malformed("preamble instruction in body")),
    };

    Ok(instruction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::Emitter;
    use crate::function::Function;
    use crate::program::Program;
    use crate::types::{SamplerMode, Type};

    fn sample_program() -> Program {
        let mut program = Program::new();
        let void = program.type_void();
        let uint = program.type_u32();
        let buffer = program.add_type(Type::Buffer {
            elem: uint,
            sampler_mode: SamplerMode::Writable,
            texel_format: crate::types::Format::R32UInt,
        });
        let var = program.add_variable(buffer, crate::types::AddressSpace::Resource, Some(0));

        let fn_id = program.identifiers.alloc();
        let mut function = Function::new(fn_id, void);
        let entry = function.alloc_block(&mut program.identifiers);
        program.add_function(function);
        program.set_entry_point(fn_id);

        let mut e = Emitter::new(&mut program, fn_id, entry);
        let tid = e.dispatch_thread_id();
        let zero = e.u32(0);
        let x = e.extract(tid, zero);
        e.store_buffer(var, x, zero);
        e.ret_void();

        program
    }

    #[test]
    fn stitch_parse_round_trips() {
        let program = sample_program();
        let words = stitch(&program);

        let parsed = parse(&words).expect("parse");
        let restitched = stitch(&parsed);
        assert_eq!(words, restitched);
    }

    #[test]
    fn byte_round_trip_little_endian() {
        let program = sample_program();
        let bytes = stitch_bytes(&program);
        let parsed = parse_bytes(&bytes).expect("parse");
        assert_eq!(stitch_bytes(&parsed), bytes);
    }

    #[test]
    fn clean_module_reuses_source_bytes() {
        let program = sample_program();
        let words = stitch(&program);
        let parsed = parse(&words).expect("parse");

        // No mutation: stitching must return the original words verbatim.
        assert_eq!(stitch(&parsed), words);
    }

    #[test]
    fn dirty_block_reserializes() {
        let program = sample_program();
        let words = stitch(&program);
        let mut parsed = parse(&words).expect("parse");

        let fn_id = parsed.entry_point();
        let entry = parsed.function(fn_id).unwrap().entry_block().unwrap();
        parsed
            .function_mut(fn_id)
            .unwrap()
            .block_mut(entry)
            .unwrap()
            .mark_dirty();

        // Still parses to an equivalent module.
        let rewords = stitch(&parsed);
        let reparsed = parse(&rewords).expect("reparse");
        assert_eq!(reparsed.functions().len(), 1);
    }

    #[test]
    fn unknown_magic_is_rejected() {
        assert!(matches!(parse(&[0xdead_beef, 0, 0, 0, 0]), Err(Error::WrongHeader)));
        assert!(matches!(parse(&[MAGIC]), Err(Error::MissingHeader)));
    }

    #[test]
    fn foreign_opcodes_round_trip() {
        let program = sample_program();
        let mut words = stitch(&program);

        // Append a foreign record in the preamble region: find the first
        // Function op and splice before it.
        let mut insert_at = 5;
        let mut ptr = 5;
        while ptr < words.len() {
            let wc = (words[ptr] >> 16) as usize;
            if (words[ptr] & 0xffff) as u16 == OpCode::Function as u16 {
                insert_at = ptr;
                break;
            }
            ptr += wc;
        }
        let foreign = [(3u32 << 16) | 0x1234, 7, 9];
        words.splice(insert_at..insert_at, foreign.iter().copied());

        let parsed = parse(&words).expect("parse");
        assert_eq!(stitch(&parsed), words);
    }
}
