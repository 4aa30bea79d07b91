//! Instruction emitter: appends or inserts typed instructions into a block,
//! interning types and constants on demand.

use crate::block::BlockFlags;
use crate::inst::{
    AddressChainLink, AtomicOp, BinaryOp, BranchControlFlow, Instruction, Op, PhiValue,
    ResourceProperty, UnaryOp,
};
use crate::program::Program;
use crate::types::{AddressSpace, Type};
use crate::{Id, SourceSpan};
use smallvec::SmallVec;

/// Builder over one block of one function. Instructions are appended at the
/// cursor (or the block end) and typed as they are emitted.
pub struct Emitter<'p> {
    program: &'p mut Program,
    function: Id,
    block: Id,
    cursor: Option<usize>,
    source: SourceSpan,
}

impl<'p> Emitter<'p> {
    pub fn new(program: &'p mut Program, function: Id, block: Id) -> Emitter<'p> {
        Emitter {
            program,
            function,
            block,
            cursor: None,
            source: SourceSpan::INVALID,
        }
    }

    /// Emitter inserting before `index` instead of appending.
    pub fn before(
        program: &'p mut Program,
        function: Id,
        block: Id,
        index: usize,
    ) -> Emitter<'p> {
        Emitter {
            program,
            function,
            block,
            cursor: Some(index),
            source: SourceSpan::INVALID,
        }
    }

    /// Attribute emitted instructions to an original span, flagged as
    /// instrumentation-originated.
    pub fn with_instrumented_source(mut self, source: SourceSpan) -> Emitter<'p> {
        self.source = source.modify();
        self
    }

    pub fn program(&mut self) -> &mut Program {
        self.program
    }

    pub fn block(&self) -> Id {
        self.block
    }

    pub fn function(&self) -> Id {
        self.function
    }

    /// Index the next emission lands at.
    pub fn cursor(&self) -> usize {
        match self.cursor {
            Some(index) => index,
            None => self
                .program
                .function(self.function)
                .and_then(|f| f.block(self.block))
                .map(|b| b.len())
                .unwrap_or(0),
        }
    }

    pub fn add_block_flag(&mut self, flags: BlockFlags) {
        let (function, block_id) = (self.function, self.block);
        if let Some(block) = self
            .program
            .function_mut(function)
            .and_then(|f| f.block_mut(block_id))
        {
            block.flags |= flags;
        }
    }

    fn push(&mut self, instruction: Instruction) {
        let (function, block_id) = (self.function, self.block);
        let block = self
            .program
            .function_mut(function)
            .and_then(|f| f.block_mut(block_id))
            .expect("emitter block must exist");
        match &mut self.cursor {
            Some(index) => {
                block.insert(*index, instruction);
                *index += 1;
            }
            None => block.push(instruction),
        }
    }

    /// Emit a value-producing op with an explicit result type.
    pub fn emit_typed(&mut self, op: Op, type_id: Id) -> Id {
        let result = self.program.identifiers.alloc();
        self.program.types.set_value_type(result, type_id);
        let source = self.source;
        self.push(Instruction::with_source(result, op, source));
        result
    }

    /// Emit a value-less op.
    pub fn emit(&mut self, op: Op) {
        let source = self.source;
        self.push(Instruction::with_source(Id::INVALID, op, source));
    }

    // ---------------------------------------------------------------------
    // Constants

    pub fn u32(&mut self, value: u32) -> Id {
        self.program.const_u32(value)
    }

    pub fn i32(&mut self, value: i32) -> Id {
        self.program.const_i32(value)
    }

    pub fn f32(&mut self, value: f32) -> Id {
        self.program.const_f32(value)
    }

    pub fn bool(&mut self, value: bool) -> Id {
        self.program.const_bool(value)
    }

    // ---------------------------------------------------------------------
    // Type inference

    fn value_type(&self, value: Id) -> Id {
        self.program
            .types
            .value_type(value)
            .or_else(|| self.program.constants.type_of(value))
            .unwrap_or(Id::INVALID)
    }

    /// Bool, or a bool vector matching the operand's dimension.
    fn comparison_type(&mut self, operand: Id) -> Id {
        let operand_type = self.value_type(operand);
        let dim = match self.program.types.get(operand_type) {
            Some(Type::Vector { dim, .. }) => Some(*dim),
            _ => None,
        };
        let bool_ty = self.program.type_bool();
        match dim {
            Some(dim) => self.program.type_vector(bool_ty, dim),
            None => bool_ty,
        }
    }

    fn binary_result_type(&mut self, op: BinaryOp, lhs: Id) -> Id {
        match op {
            op if op.is_comparison() => self.comparison_type(lhs),
            BinaryOp::And | BinaryOp::Or => self.program.type_bool(),
            _ => self.value_type(lhs),
        }
    }

    fn binary(&mut self, op: BinaryOp, lhs: Id, rhs: Id) -> Id {
        let ty = self.binary_result_type(op, lhs);
        self.emit_typed(Op::Binary { op, lhs, rhs }, ty)
    }

    // ---------------------------------------------------------------------
    // Arithmetic / logic

    pub fn add(&mut self, lhs: Id, rhs: Id) -> Id {
        self.binary(BinaryOp::Add, lhs, rhs)
    }

    pub fn sub(&mut self, lhs: Id, rhs: Id) -> Id {
        self.binary(BinaryOp::Sub, lhs, rhs)
    }

    pub fn mul(&mut self, lhs: Id, rhs: Id) -> Id {
        self.binary(BinaryOp::Mul, lhs, rhs)
    }

    pub fn div(&mut self, lhs: Id, rhs: Id) -> Id {
        self.binary(BinaryOp::Div, lhs, rhs)
    }

    pub fn rem(&mut self, lhs: Id, rhs: Id) -> Id {
        self.binary(BinaryOp::Rem, lhs, rhs)
    }

    pub fn bit_and(&mut self, lhs: Id, rhs: Id) -> Id {
        self.binary(BinaryOp::BitAnd, lhs, rhs)
    }

    pub fn bit_or(&mut self, lhs: Id, rhs: Id) -> Id {
        self.binary(BinaryOp::BitOr, lhs, rhs)
    }

    pub fn bit_xor(&mut self, lhs: Id, rhs: Id) -> Id {
        self.binary(BinaryOp::BitXor, lhs, rhs)
    }

    pub fn bit_shift_left(&mut self, value: Id, shift: Id) -> Id {
        self.binary(BinaryOp::BitShiftLeft, value, shift)
    }

    pub fn bit_shift_right(&mut self, value: Id, shift: Id) -> Id {
        self.binary(BinaryOp::BitShiftRight, value, shift)
    }

    pub fn and(&mut self, lhs: Id, rhs: Id) -> Id {
        self.binary(BinaryOp::And, lhs, rhs)
    }

    pub fn or(&mut self, lhs: Id, rhs: Id) -> Id {
        self.binary(BinaryOp::Or, lhs, rhs)
    }

    pub fn equal(&mut self, lhs: Id, rhs: Id) -> Id {
        self.binary(BinaryOp::Equal, lhs, rhs)
    }

    pub fn not_equal(&mut self, lhs: Id, rhs: Id) -> Id {
        self.binary(BinaryOp::NotEqual, lhs, rhs)
    }

    pub fn less_than(&mut self, lhs: Id, rhs: Id) -> Id {
        self.binary(BinaryOp::LessThan, lhs, rhs)
    }

    pub fn less_than_equal(&mut self, lhs: Id, rhs: Id) -> Id {
        self.binary(BinaryOp::LessThanEqual, lhs, rhs)
    }

    pub fn greater_than(&mut self, lhs: Id, rhs: Id) -> Id {
        self.binary(BinaryOp::GreaterThan, lhs, rhs)
    }

    pub fn greater_than_equal(&mut self, lhs: Id, rhs: Id) -> Id {
        self.binary(BinaryOp::GreaterThanEqual, lhs, rhs)
    }

    pub fn umin(&mut self, lhs: Id, rhs: Id) -> Id {
        self.binary(BinaryOp::UMin, lhs, rhs)
    }

    pub fn umax(&mut self, lhs: Id, rhs: Id) -> Id {
        self.binary(BinaryOp::UMax, lhs, rhs)
    }

    pub fn not(&mut self, value: Id) -> Id {
        let ty = self.comparison_type(value);
        self.emit_typed(Op::Unary { op: UnaryOp::Not, value }, ty)
    }

    pub fn bit_not(&mut self, value: Id) -> Id {
        let ty = self.value_type(value);
        self.emit_typed(Op::Unary { op: UnaryOp::BitNot, value }, ty)
    }

    pub fn negate(&mut self, value: Id) -> Id {
        let ty = self.value_type(value);
        self.emit_typed(Op::Unary { op: UnaryOp::Negate, value }, ty)
    }

    pub fn is_nan(&mut self, value: Id) -> Id {
        let ty = self.comparison_type(value);
        self.emit_typed(Op::Unary { op: UnaryOp::IsNan, value }, ty)
    }

    pub fn is_inf(&mut self, value: Id) -> Id {
        let ty = self.comparison_type(value);
        self.emit_typed(Op::Unary { op: UnaryOp::IsInf, value }, ty)
    }

    pub fn first_bit_high(&mut self, value: Id) -> Id {
        let ty = self.program.type_u32();
        self.emit_typed(Op::Unary { op: UnaryOp::FirstBitHigh, value }, ty)
    }

    pub fn select(&mut self, condition: Id, pass: Id, fail: Id) -> Id {
        let ty = self.value_type(pass);
        self.emit_typed(Op::Select { condition, pass, fail }, ty)
    }

    pub fn any(&mut self, value: Id) -> Id {
        let ty = self.program.type_bool();
        self.emit_typed(Op::Any { value }, ty)
    }

    pub fn all(&mut self, value: Id) -> Id {
        let ty = self.program.type_bool();
        self.emit_typed(Op::All { value }, ty)
    }

    pub fn bit_cast(&mut self, value: Id, type_id: Id) -> Id {
        self.emit_typed(Op::BitCast { value }, type_id)
    }

    pub fn construct(&mut self, type_id: Id, values: &[Id]) -> Id {
        self.emit_typed(
            Op::Construct { values: SmallVec::from_slice(values) },
            type_id,
        )
    }

    /// Extract one element by literal index.
    pub fn extract(&mut self, composite: Id, index: Id) -> Id {
        let composite_type = self.value_type(composite);
        let elem = match self.program.types.get(composite_type) {
            Some(Type::Vector { elem, .. }) => *elem,
            Some(Type::Array { elem, .. }) => *elem,
            Some(Type::Struct { members }) => {
                let literal = self.program.constants.u32_value(index).unwrap_or(0);
                members.get(literal as usize).copied().unwrap_or(Id::INVALID)
            }
            _ => composite_type,
        };
        self.emit_typed(
            Op::Extract {
                composite,
                chains: SmallVec::from_slice(&[AddressChainLink { index }]),
            },
            elem,
        )
    }

    // ---------------------------------------------------------------------
    // Memory

    pub fn load(&mut self, address: Id) -> Id {
        let address_type = self.value_type(address);
        let ty = match self.program.types.get(address_type) {
            Some(Type::Pointer { pointee, .. }) => *pointee,
            _ => address_type,
        };
        self.emit_typed(Op::Load { address }, ty)
    }

    pub fn store(&mut self, address: Id, value: Id) {
        self.emit(Op::Store { address, value });
    }

    pub fn address_of(&mut self, composite: Id, index: Id) -> Id {
        let composite_type = self.value_type(composite);
        let pointee = match self.program.types.get(composite_type) {
            Some(Type::Buffer { elem, .. }) => *elem,
            Some(Type::Array { elem, .. }) => *elem,
            _ => composite_type,
        };
        let ty = self.program.add_type(Type::Pointer { pointee, space: AddressSpace::Texel });
        self.emit_typed(Op::AddressOf { composite, index }, ty)
    }

    pub fn address_chain(&mut self, composite: Id, indices: &[Id]) -> Id {
        let mut ty = self.value_type(composite);
        for _ in indices {
            ty = match self.program.types.get(ty) {
                Some(Type::Pointer { pointee, .. }) => *pointee,
                Some(Type::Array { elem, .. }) => *elem,
                Some(Type::Vector { elem, .. }) => *elem,
                _ => ty,
            };
        }
        let chains = indices
            .iter()
            .map(|&index| AddressChainLink { index })
            .collect();
        self.emit_typed(Op::AddressChain { composite, chains }, ty)
    }

    pub fn atomic(&mut self, op: AtomicOp, address: Id, value: Id) -> Id {
        let ty = self.program.type_u32();
        self.emit_typed(Op::Atomic { op, address, value }, ty)
    }

    pub fn atomic_add(&mut self, address: Id, value: Id) -> Id {
        self.atomic(AtomicOp::Add, address, value)
    }

    pub fn atomic_or(&mut self, address: Id, value: Id) -> Id {
        self.atomic(AtomicOp::Or, address, value)
    }

    pub fn atomic_and(&mut self, address: Id, value: Id) -> Id {
        self.atomic(AtomicOp::And, address, value)
    }

    // ---------------------------------------------------------------------
    // Resources

    /// Element vector type a buffer or texture read produces.
    fn texel_vector_type(&mut self, resource: Id) -> Id {
        let resource_type = self.value_type(resource);
        let elem = match self.program.types.get(resource_type) {
            Some(Type::Buffer { elem, .. }) => Some(*elem),
            Some(Type::Texture { elem, .. }) => Some(*elem),
            _ => None,
        };
        let elem = match elem {
            Some(elem) => elem,
            None => self.program.type_u32(),
        };
        self.program.type_vector(elem, 4)
    }

    pub fn load_buffer(&mut self, buffer: Id, index: Id) -> Id {
        let ty = self.texel_vector_type(buffer);
        self.emit_typed(Op::LoadBuffer { buffer, index }, ty)
    }

    pub fn store_buffer(&mut self, buffer: Id, index: Id, value: Id) {
        self.emit(Op::StoreBuffer { buffer, index, value });
    }

    pub fn load_texture(&mut self, texture: Id, index: Id) -> Id {
        let ty = self.texel_vector_type(texture);
        self.emit_typed(Op::LoadTexture { texture, index }, ty)
    }

    pub fn store_texture(&mut self, texture: Id, index: Id, value: Id) {
        self.emit(Op::StoreTexture { texture, index, value });
    }

    pub fn sample_texture(&mut self, texture: Id, sampler: Id, coordinate: Id) -> Id {
        let ty = self.texel_vector_type(texture);
        self.emit_typed(Op::SampleTexture { texture, sampler, coordinate }, ty)
    }

    /// Logical size of a resource: scalar for buffers, a vector per axis for
    /// textures.
    pub fn resource_size(&mut self, resource: Id) -> Id {
        let resource_type = self.value_type(resource);
        let uint = self.program.type_u32();
        let axis_count = match self.program.types.get(resource_type) {
            Some(Type::Texture { dim, .. }) => Some(dim.axis_count() as u8),
            _ => None,
        };
        let ty = match axis_count {
            Some(dim) => self.program.type_vector(uint, dim),
            None => uint,
        };
        self.emit_typed(Op::ResourceSize { resource }, ty)
    }

    pub fn resource_token(&mut self, resource: Id) -> Id {
        let ty = self.program.type_u32();
        self.emit_typed(Op::ResourceToken { resource }, ty)
    }

    pub fn resource_property(&mut self, resource: Id, property: ResourceProperty) -> Id {
        let ty = self.program.type_u32();
        self.emit_typed(Op::ResourceProperty { resource, property }, ty)
    }

    // ---------------------------------------------------------------------
    // Kernel / wave

    pub fn dispatch_thread_id(&mut self) -> Id {
        let uint = self.program.type_u32();
        let ty = self.program.type_vector(uint, 3);
        self.emit_typed(Op::DispatchThreadId, ty)
    }

    pub fn local_invocation_id(&mut self) -> Id {
        let uint = self.program.type_u32();
        let ty = self.program.type_vector(uint, 3);
        self.emit_typed(Op::LocalInvocationId, ty)
    }

    pub fn wave_all_equal(&mut self, value: Id) -> Id {
        let ty = self.program.type_bool();
        self.emit_typed(Op::WaveAllEqual { value }, ty)
    }

    // ---------------------------------------------------------------------
    // Control flow

    pub fn phi(&mut self, type_id: Id, values: &[PhiValue]) -> Id {
        self.emit_typed(Op::Phi { values: SmallVec::from_slice(values) }, type_id)
    }

    pub fn branch(&mut self, target: Id) {
        self.emit(Op::Branch { target });
    }

    pub fn branch_conditional(
        &mut self,
        condition: Id,
        pass: Id,
        fail: Id,
        control_flow: BranchControlFlow,
    ) {
        self.emit(Op::BranchConditional { condition, pass, fail, control_flow });
    }

    pub fn ret(&mut self, value: Id) {
        self.emit(Op::Return { value });
    }

    pub fn ret_void(&mut self) {
        self.emit(Op::Return { value: Id::INVALID });
    }
}
