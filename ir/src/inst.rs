//! Instructions and op-codes.

use crate::{Id, SourceSpan};
use smallvec::SmallVec;

/// One incoming phi edge: the value produced when control arrived through
/// `block`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PhiValue {
    pub value: Id,
    pub block: Id,
}

/// One switch case.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SwitchCase {
    pub literal: u32,
    pub block: Id,
}

/// One step of an address chain.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AddressChainLink {
    pub index: Id,
}

/// Structured control flow attached to conditional terminators. `merge` is
/// the reconvergence block; a valid `continue_block` marks a loop header.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct BranchControlFlow {
    pub merge: Id,
    pub continue_block: Id,
}

impl BranchControlFlow {
    pub fn none() -> BranchControlFlow {
        Default::default()
    }

    pub fn selection(merge: Id) -> BranchControlFlow {
        BranchControlFlow { merge, continue_block: Id::INVALID }
    }

    pub fn looped(merge: Id, continue_block: Id) -> BranchControlFlow {
        BranchControlFlow { merge, continue_block }
    }
}

/// Resource descriptor field surfaced to shader code by the token emitter.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ResourceProperty {
    Width,
    Height,
    DepthOrSliceCount,
    MipCount,
    FormatSize,
    ViewFormatSize,
    ViewWidth,
    ViewBaseWidth,
    ViewBaseMip,
    ViewBaseSlice,
    ByteCount,
    TexelCount,
}

/// Binary arithmetic/bit/logic/comparison selector, kept out of `Op` so the
/// folding and execution tables stay dense.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    BitAnd,
    BitOr,
    BitXor,
    BitShiftLeft,
    BitShiftRight,
    And,
    Or,
    Equal,
    NotEqual,
    LessThan,
    LessThanEqual,
    GreaterThan,
    GreaterThanEqual,
    UMin,
    UMax,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        match self {
            BinaryOp::Equal
            | BinaryOp::NotEqual
            | BinaryOp::LessThan
            | BinaryOp::LessThanEqual
            | BinaryOp::GreaterThan
            | BinaryOp::GreaterThanEqual => true,
            _ => false,
        }
    }
}

/// Unary selector.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum UnaryOp {
    Not,
    BitNot,
    Negate,
    IsNan,
    IsInf,
    FirstBitHigh,
}

/// Atomic read-modify-write selector.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum AtomicOp {
    Add,
    Or,
    And,
    Exchange,
}

/// Op-code and operands.
#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    Nop,

    // Value ops
    Binary { op: BinaryOp, lhs: Id, rhs: Id },
    Unary { op: UnaryOp, value: Id },
    Select { condition: Id, pass: Id, fail: Id },
    /// Horizontal any() over a bool vector (identity on scalar bool).
    Any { value: Id },
    /// Horizontal all() over a bool vector (identity on scalar bool).
    All { value: Id },
    BitCast { value: Id },
    Construct { values: SmallVec<[Id; 4]> },
    Extract { composite: Id, chains: SmallVec<[AddressChainLink; 2]> },

    // Memory
    Load { address: Id },
    Store { address: Id, value: Id },
    AddressOf { composite: Id, index: Id },
    AddressChain { composite: Id, chains: SmallVec<[AddressChainLink; 2]> },
    Atomic { op: AtomicOp, address: Id, value: Id },

    // Resource
    LoadBuffer { buffer: Id, index: Id },
    StoreBuffer { buffer: Id, index: Id, value: Id },
    LoadTexture { texture: Id, index: Id },
    StoreTexture { texture: Id, index: Id, value: Id },
    SampleTexture { texture: Id, sampler: Id, coordinate: Id },
    ResourceSize { resource: Id },
    /// Packed 32-bit resource token, resolved through the PRMT.
    ResourceToken { resource: Id },
    /// Descriptor field of a resource, resolved through the PRMT.
    ResourceProperty { resource: Id, property: ResourceProperty },

    // Kernel / wave
    DispatchThreadId,
    LocalInvocationId,
    WaveAllEqual { value: Id },

    // Calls
    Call { function: Id, arguments: SmallVec<[Id; 4]> },

    // Control flow (terminators)
    Branch { target: Id },
    BranchConditional {
        condition: Id,
        pass: Id,
        fail: Id,
        control_flow: BranchControlFlow,
    },
    Switch {
        value: Id,
        default: Id,
        cases: SmallVec<[SwitchCase; 4]>,
    },
    Phi { values: SmallVec<[PhiValue; 2]> },
    Return { value: Id },

    /// Foreign op-code with its raw operand tail; round-trips through the
    /// codec untouched.
    Unexposed { foreign_op: u32, operands: SmallVec<[u32; 4]> },
}

impl Op {
    pub fn is_terminator(&self) -> bool {
        match self {
            Op::Branch { .. }
            | Op::BranchConditional { .. }
            | Op::Switch { .. }
            | Op::Return { .. } => true,
            _ => false,
        }
    }

    /// Successor block ids of a terminator. Empty for non-terminators and
    /// returns.
    pub fn successors(&self) -> SmallVec<[Id; 4]> {
        let mut out = SmallVec::new();
        match self {
            Op::Branch { target } => out.push(*target),
            Op::BranchConditional { pass, fail, .. } => {
                out.push(*pass);
                out.push(*fail);
            }
            Op::Switch { default, cases, .. } => {
                out.push(*default);
                for case in cases {
                    out.push(case.block);
                }
            }
            _ => {}
        }
        out
    }

    /// Structured control flow of a terminator, if any.
    pub fn control_flow(&self) -> Option<BranchControlFlow> {
        match self {
            Op::BranchConditional { control_flow, .. } => Some(*control_flow),
            _ => None,
        }
    }

    /// All value identifiers the op reads.
    pub fn operands(&self) -> SmallVec<[Id; 4]> {
        let mut out = SmallVec::new();
        match self {
            Op::Nop
            | Op::DispatchThreadId
            | Op::LocalInvocationId
            | Op::Branch { .. }
            | Op::Unexposed { .. } => {}
            Op::Binary { lhs, rhs, .. } => {
                out.push(*lhs);
                out.push(*rhs);
            }
            Op::Unary { value, .. }
            | Op::Any { value }
            | Op::All { value }
            | Op::BitCast { value }
            | Op::WaveAllEqual { value } => out.push(*value),
            Op::Select { condition, pass, fail } => {
                out.push(*condition);
                out.push(*pass);
                out.push(*fail);
            }
            Op::Construct { values } => out.extend(values.iter().copied()),
            Op::Extract { composite, chains } | Op::AddressChain { composite, chains } => {
                out.push(*composite);
                out.extend(chains.iter().map(|c| c.index));
            }
            Op::Load { address } => out.push(*address),
            Op::Store { address, value } => {
                out.push(*address);
                out.push(*value);
            }
            Op::AddressOf { composite, index } => {
                out.push(*composite);
                out.push(*index);
            }
            Op::Atomic { address, value, .. } => {
                out.push(*address);
                out.push(*value);
            }
            Op::LoadBuffer { buffer, index } => {
                out.push(*buffer);
                out.push(*index);
            }
            Op::StoreBuffer { buffer, index, value } => {
                out.push(*buffer);
                out.push(*index);
                out.push(*value);
            }
            Op::LoadTexture { texture, index } => {
                out.push(*texture);
                out.push(*index);
            }
            Op::StoreTexture { texture, index, value } => {
                out.push(*texture);
                out.push(*index);
                out.push(*value);
            }
            Op::SampleTexture { texture, sampler, coordinate } => {
                out.push(*texture);
                if sampler.is_valid() {
                    out.push(*sampler);
                }
                out.push(*coordinate);
            }
            Op::ResourceSize { resource }
            | Op::ResourceToken { resource }
            | Op::ResourceProperty { resource, .. } => out.push(*resource),
            Op::Call { function, arguments } => {
                out.push(*function);
                out.extend(arguments.iter().copied());
            }
            Op::BranchConditional { condition, .. } => out.push(*condition),
            Op::Switch { value, .. } => out.push(*value),
            Op::Phi { values } => out.extend(values.iter().map(|v| v.value)),
            Op::Return { value } => {
                if value.is_valid() {
                    out.push(*value);
                }
            }
        }
        out
    }

    /// All block identifiers the op references, including phi edges and
    /// structured merge/continue blocks.
    pub fn referenced_blocks(&self) -> SmallVec<[Id; 4]> {
        let mut out = self.successors();
        match self {
            Op::BranchConditional { control_flow, .. } => {
                if control_flow.merge.is_valid() {
                    out.push(control_flow.merge);
                }
                if control_flow.continue_block.is_valid() {
                    out.push(control_flow.continue_block);
                }
            }
            Op::Phi { values } => out.extend(values.iter().map(|v| v.block)),
            _ => {}
        }
        out
    }
}

/// An instruction: op-code plus result and source attribution. `result` is
/// `Id::INVALID` for value-less ops.
#[derive(Clone, Debug, PartialEq)]
pub struct Instruction {
    pub result: Id,
    pub source: SourceSpan,
    pub op: Op,
}

impl Instruction {
    pub fn new(result: Id, op: Op) -> Instruction {
        Instruction {
            result,
            source: SourceSpan::INVALID,
            op,
        }
    }

    pub fn with_source(result: Id, op: Op, source: SourceSpan) -> Instruction {
        Instruction { result, source, op }
    }

    pub fn is_phi(&self) -> bool {
        match self.op {
            Op::Phi { .. } => true,
            _ => false,
        }
    }
}
