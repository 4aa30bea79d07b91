//! CPU execution device for the IR.
//!
//! Dispatches compute programs against CPU-backed resources, executing one
//! wave at a time in lockstep with an active-lane mask. Structured selection
//! control flow may diverge per lane; unstructured divergence is rejected.
//! Wave intrinsics see exactly the active lanes, so divergence-dependent
//! instrumentation behaves as it would on hardware.

use crate::constant::Constant;
use crate::inst::{AtomicOp, BinaryOp, Op, ResourceProperty, UnaryOp};
use crate::program::Program;
use crate::types::Type;
use crate::{Error, Id, Result};
use fxhash::FxHashMap;
use smallvec::SmallVec;

/// Handle into the resource pool. `INVALID_HANDLE` models an unbound
/// descriptor table entry.
pub type ResourceHandle = u32;

pub const INVALID_HANDLE: ResourceHandle = !0;

/// Descriptor fields the token and property ops resolve against.
#[derive(Copy, Clone, Debug, Default)]
pub struct ResourceDesc {
    /// Packed resource token (type + PUID).
    pub token: u32,
    pub width: u32,
    pub height: u32,
    pub depth_or_slices: u32,
    pub mip_count: u32,
    pub format_size: u32,
    pub view_format_size: u32,
    pub view_width: u32,
    pub view_base_width: u32,
    pub view_base_mip: u32,
    pub view_base_slice: u32,
    /// Logical element count visible to the shader.
    pub element_count: u32,
    pub byte_count: u32,
}

/// One CPU-backed resource: descriptor plus word storage.
#[derive(Clone, Debug)]
pub struct Resource {
    pub desc: ResourceDesc,
    pub words: Vec<u32>,
}

impl Resource {
    pub fn buffer(desc: ResourceDesc) -> Resource {
        let words = vec![0u32; desc.element_count.max(1) as usize];
        Resource { desc, words }
    }

    fn texel_count(&self) -> u32 {
        let mut total = 0u32;
        for mip in 0..self.desc.mip_count.max(1) {
            let w = (self.desc.width >> mip).max(1);
            let h = (self.desc.height >> mip).max(1);
            let d = (self.desc.depth_or_slices >> mip).max(1);
            total += w * h * d;
        }
        total
    }

    pub fn texture(desc: ResourceDesc) -> Resource {
        let mut resource = Resource { desc, words: Vec::new() };
        let count = resource.texel_count().max(1);
        resource.words = vec![0u32; count as usize];
        resource
    }

    /// Row-major linear offset of a texel within the device copy. This is the
    /// device's own layout, unrelated to the validation mask addressing.
    fn texel_offset(&self, x: u32, y: u32, z: u32, mip: u32) -> Option<usize> {
        let (mut w, mut h, mut d) = (
            self.desc.width.max(1),
            self.desc.height.max(1),
            self.desc.depth_or_slices.max(1),
        );
        let mut base = 0u32;
        for _ in 0..mip.min(self.desc.mip_count.saturating_sub(1)) {
            base += w * h * d;
            w = (w / 2).max(1);
            h = (h / 2).max(1);
            d = (d / 2).max(1);
        }
        if x >= w || y >= h || z >= d {
            return None;
        }
        Some((base + (z * h + y) * w + x) as usize)
    }
}

/// Resource pool; handles are dense indices.
#[derive(Clone, Debug, Default)]
pub struct ResourcePool {
    resources: Vec<Resource>,
}

impl ResourcePool {
    pub fn new() -> ResourcePool {
        Default::default()
    }

    pub fn add(&mut self, resource: Resource) -> ResourceHandle {
        self.resources.push(resource);
        (self.resources.len() - 1) as ResourceHandle
    }

    pub fn get(&self, handle: ResourceHandle) -> Option<&Resource> {
        self.resources.get(handle as usize)
    }

    pub fn get_mut(&mut self, handle: ResourceHandle) -> Option<&mut Resource> {
        self.resources.get_mut(handle as usize)
    }
}

/// Scalar runtime value.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Scalar {
    U32(u32),
    I32(i32),
    F32(f32),
    Bool(bool),
}

impl Scalar {
    pub fn as_u32(self) -> u32 {
        match self {
            Scalar::U32(v) => v,
            Scalar::I32(v) => v as u32,
            Scalar::F32(v) => v.to_bits(),
            Scalar::Bool(v) => v as u32,
        }
    }

    fn as_bool(self) -> bool {
        match self {
            Scalar::Bool(v) => v,
            other => other.as_u32() != 0,
        }
    }
}

/// Runtime value: scalars, short vectors, resource handles and texel
/// pointers.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Scalar(Scalar),
    Vector(SmallVec<[Scalar; 4]>),
    Handle(ResourceHandle),
    /// Run of handles behind a descriptor-indexed resource array.
    HandleArray { base_binding: u32, count: u32 },
    /// Word pointer into a buffer resource.
    Ptr { resource: ResourceHandle, element: u32 },
}

impl Value {
    fn scalar(&self) -> Option<Scalar> {
        match self {
            Value::Scalar(s) => Some(*s),
            Value::Vector(v) if v.len() == 1 => Some(v[0]),
            _ => None,
        }
    }

    fn component(&self, index: usize) -> Option<Scalar> {
        match self {
            Value::Scalar(s) if index == 0 => Some(*s),
            Value::Vector(v) => v.get(index).copied(),
            _ => None,
        }
    }

    fn as_u32(&self) -> Option<u32> {
        self.scalar().map(|s| s.as_u32())
    }
}

struct Lane {
    registers: FxHashMap<Id, Value>,
    prev_block: Id,
    thread_id: [u32; 3],
    local_id: [u32; 3],
    done: bool,
}

/// One dispatch over a linear thread grid, executed wave by wave.
pub struct Dispatcher<'a> {
    program: &'a Program,
    pool: &'a mut ResourcePool,
    bindings: &'a FxHashMap<u32, ResourceHandle>,
    wave_size: u32,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        program: &'a Program,
        pool: &'a mut ResourcePool,
        bindings: &'a FxHashMap<u32, ResourceHandle>,
        wave_size: u32,
    ) -> Dispatcher<'a> {
        Dispatcher { program, pool, bindings, wave_size: wave_size.max(1) }
    }

    /// Execute `thread_count` invocations of the entry point.
    pub fn dispatch(&mut self, thread_count: u32) -> Result<()> {
        let entry_fn = self
            .program
            .entry_function()
            .ok_or(Error::Malformed("no entry point"))?
            .id();

        let mut base = 0;
        while base < thread_count {
            let lanes = (thread_count - base).min(self.wave_size);
            let mut wave: Vec<Lane> = (0..lanes)
                .map(|lane| Lane {
                    registers: FxHashMap::default(),
                    prev_block: Id::INVALID,
                    thread_id: [base + lane, 0, 0],
                    local_id: [(base + lane) % self.wave_size, 0, 0],
                    done: false,
                })
                .collect();

            let mask: Vec<bool> = vec![true; wave.len()];
            self.run_function(entry_fn, &mut wave, &mask)?;
            base += lanes;
        }

        Ok(())
    }

    fn run_function(&mut self, function: Id, wave: &mut Vec<Lane>, mask: &[bool]) -> Result<()> {
        let entry = self
            .program
            .function(function)
            .and_then(|f| f.entry_block())
            .ok_or(Error::Malformed("function without entry block"))?;
        self.run_segment(function, entry, wave, mask, Id::INVALID)
    }

    /// Execute from `block` until `stop` is reached (not executed) or every
    /// active lane returned.
    fn run_segment(
        &mut self,
        function: Id,
        block: Id,
        wave: &mut Vec<Lane>,
        mask: &[bool],
        stop: Id,
    ) -> Result<()> {
        let mut block = block;

        loop {
            if block == stop {
                return Ok(());
            }
            let active: Vec<bool> = mask
                .iter()
                .zip(wave.iter())
                .map(|(&m, lane)| m && !lane.done)
                .collect();
            if !active.iter().any(|&m| m) {
                return Ok(());
            }

            let instruction_count = self
                .program
                .function(function)
                .and_then(|f| f.block(block))
                .map(|b| b.len())
                .ok_or(Error::Malformed("branch to unknown block"))?;

            for index in 0..instruction_count {
                let instruction = self
                    .program
                    .function(function)
                    .and_then(|f| f.block(block))
                    .map(|b| b.instructions[index].clone())
                    .ok_or(Error::Malformed("instruction vanished"))?;

                if instruction.op.is_terminator() {
                    match instruction.op {
                        Op::Branch { target } => {
                            self.take_edge(wave, &active, block);
                            block = target;
                        }
                        Op::Return { .. } => {
                            for (lane, &is_active) in wave.iter_mut().zip(active.iter()) {
                                if is_active {
                                    lane.done = true;
                                }
                            }
                            return Ok(());
                        }
                        Op::BranchConditional { condition, pass, fail, control_flow } => {
                            let mut conditions = Vec::with_capacity(wave.len());
                            for (lane_index, &is_active) in active.iter().enumerate() {
                                let taken = if is_active {
                                    self.read(&wave[lane_index], condition)?
                                        .scalar()
                                        .map(|s| s.as_bool())
                                        .ok_or(Error::Malformed("non-scalar condition"))?
                                } else {
                                    false
                                };
                                conditions.push(taken);
                            }

                            let any_true = active
                                .iter()
                                .zip(&conditions)
                                .any(|(&m, &c)| m && c);
                            let any_false = active
                                .iter()
                                .zip(&conditions)
                                .any(|(&m, &c)| m && !c);

                            if !(any_true && any_false) {
                                // Wave-uniform branch.
                                self.take_edge(wave, &active, block);
                                block = if any_true { pass } else { fail };
                            } else if control_flow.merge.is_valid() {
                                let pass_mask: Vec<bool> = active
                                    .iter()
                                    .zip(&conditions)
                                    .map(|(&m, &c)| m && c)
                                    .collect();
                                let fail_mask: Vec<bool> = active
                                    .iter()
                                    .zip(&conditions)
                                    .map(|(&m, &c)| m && !c)
                                    .collect();

                                self.take_edge(wave, &pass_mask, block);
                                self.run_segment(function, pass, wave, &pass_mask, control_flow.merge)?;
                                self.take_edge(wave, &fail_mask, block);
                                self.run_segment(function, fail, wave, &fail_mask, control_flow.merge)?;

                                block = control_flow.merge;
                            } else {
                                return Err(Error::Unsupported(
                                    "divergent unstructured branch",
                                ));
                            }
                        }
                        Op::Switch { value, default, ref cases } => {
                            // Uniform switch only.
                            let mut selected: Option<Id> = None;
                            for (lane_index, &is_active) in active.iter().enumerate() {
                                if !is_active {
                                    continue;
                                }
                                let literal = self.read(&wave[lane_index], value)?
                                    .as_u32()
                                    .ok_or(Error::Malformed("non-scalar switch value"))?;
                                let target = cases
                                    .iter()
                                    .find(|c| c.literal == literal)
                                    .map(|c| c.block)
                                    .unwrap_or(default);
                                match selected {
                                    None => selected = Some(target),
                                    Some(previous) if previous == target => {}
                                    Some(_) => {
                                        return Err(Error::Unsupported("divergent switch"))
                                    }
                                }
                            }
                            self.take_edge(wave, &active, block);
                            block = selected.unwrap_or(default);
                        }
                        _ => unreachable!(),
                    }
                    break;
                }

                self.execute(&instruction.result, &instruction.op, wave, &active)?;
            }
        }
    }

    fn take_edge(&self, wave: &mut Vec<Lane>, mask: &[bool], from: Id) {
        for (lane, &is_active) in wave.iter_mut().zip(mask.iter()) {
            if is_active && !lane.done {
                lane.prev_block = from;
            }
        }
    }

    fn read(&self, lane: &Lane, id: Id) -> Result<Value> {
        if let Some(value) = lane.registers.get(&id) {
            return Ok(value.clone());
        }
        if let Some(constant) = self.program.constants.get(id) {
            return self.constant_value(id, constant);
        }
        if let Some(variable) = self.program.variable(id) {
            // Resource variables resolve through the binding table.
            let base = variable.binding.unwrap_or(0);
            let is_array = match self.program.types.get(variable.type_id) {
                Some(Type::Array { count, .. }) => Some(*count),
                _ => None,
            };
            return Ok(match is_array {
                Some(count) => Value::HandleArray { base_binding: base, count },
                None => Value::Handle(
                    self.bindings.get(&base).copied().unwrap_or(INVALID_HANDLE),
                ),
            });
        }
        Err(Error::Malformed("read of undefined identifier"))
    }

    fn constant_value(&self, id: Id, constant: &Constant) -> Result<Value> {
        let ty = self.program.constants.type_of(id).unwrap_or(Id::INVALID);
        Ok(match constant {
            Constant::Bool(v) => Value::Scalar(Scalar::Bool(*v)),
            Constant::Int(v) => match self.program.types.get(ty) {
                Some(Type::Int { signed: true, .. }) => Value::Scalar(Scalar::I32(*v as i32)),
                _ => Value::Scalar(Scalar::U32(*v as u32)),
            },
            Constant::Fp(v) => Value::Scalar(Scalar::F32(v.into_inner() as f32)),
            Constant::Vector(members) | Constant::Array(members) | Constant::Struct(members) => {
                let mut out = SmallVec::new();
                for &member in members {
                    let constant = self
                        .program
                        .constants
                        .get(member)
                        .ok_or(Error::Malformed("composite constant member"))?;
                    match self.constant_value(member, constant)? {
                        Value::Scalar(s) => out.push(s),
                        _ => return Err(Error::Unsupported("nested composite constant")),
                    }
                }
                Value::Vector(out)
            }
            Constant::Null | Constant::Undef => self.zero_of(ty),
            Constant::Unexposed => return Err(Error::Unsupported("unexposed constant")),
        })
    }

    /// Zero value of a type; `Null` constants and skipped safe-guard results
    /// materialize through this.
    fn zero_of(&self, ty: Id) -> Value {
        match self.program.types.get(ty) {
            Some(Type::Bool) => Value::Scalar(Scalar::Bool(false)),
            Some(Type::Fp { .. }) => Value::Scalar(Scalar::F32(0.0)),
            Some(Type::Int { signed: true, .. }) => Value::Scalar(Scalar::I32(0)),
            Some(Type::Vector { elem, dim }) => {
                let zero = match self.program.types.get(*elem) {
                    Some(Type::Fp { .. }) => Scalar::F32(0.0),
                    Some(Type::Int { signed: true, .. }) => Scalar::I32(0),
                    Some(Type::Bool) => Scalar::Bool(false),
                    _ => Scalar::U32(0),
                };
                Value::Vector((0..*dim).map(|_| zero).collect())
            }
            _ => Value::Scalar(Scalar::U32(0)),
        }
    }

    fn resolve_handle(&self, value: &Value) -> ResourceHandle {
        match value {
            Value::Handle(handle) => *handle,
            Value::HandleArray { base_binding, .. } => self
                .bindings
                .get(base_binding)
                .copied()
                .unwrap_or(INVALID_HANDLE),
            _ => INVALID_HANDLE,
        }
    }

    fn execute(
        &mut self,
        result: &Id,
        op: &Op,
        wave: &mut Vec<Lane>,
        active: &[bool],
    ) -> Result<()> {
        // Wave intrinsics need cross-lane evaluation first.
        if let Op::WaveAllEqual { value } = op {
            let mut values: Vec<Value> = Vec::new();
            for (lane_index, &is_active) in active.iter().enumerate() {
                if is_active {
                    values.push(self.read(&wave[lane_index], *value)?);
                }
            }
            let all_equal = values.windows(2).all(|pair| pair[0] == pair[1]);
            for (lane, &is_active) in wave.iter_mut().zip(active.iter()) {
                if is_active {
                    lane.registers
                        .insert(*result, Value::Scalar(Scalar::Bool(all_equal)));
                }
            }
            return Ok(());
        }

        // Everything else evaluates lane by lane, lowest lane first; atomics
        // therefore apply in deterministic lane order.
        for lane_index in 0..wave.len() {
            if !active[lane_index] {
                continue;
            }
            let value = self.execute_lane(lane_index, wave, op, *result)?;
            if result.is_valid() {
                if let Some(value) = value {
                    wave[lane_index].registers.insert(*result, value);
                }
            }
        }
        Ok(())
    }

    fn execute_lane(
        &mut self,
        lane_index: usize,
        wave: &mut Vec<Lane>,
        op: &Op,
        result: Id,
    ) -> Result<Option<Value>> {
        let value = match op {
            Op::Nop | Op::Unexposed { .. } => None,
            Op::DispatchThreadId => {
                let id = wave[lane_index].thread_id;
                Some(Value::Vector(
                    id.iter().map(|&v| Scalar::U32(v)).collect(),
                ))
            }
            Op::LocalInvocationId => {
                let id = wave[lane_index].local_id;
                Some(Value::Vector(
                    id.iter().map(|&v| Scalar::U32(v)).collect(),
                ))
            }
            Op::Binary { op, lhs, rhs } => {
                let lhs = self.read(&wave[lane_index], *lhs)?;
                let rhs = self.read(&wave[lane_index], *rhs)?;
                Some(eval_binary(*op, &lhs, &rhs)?)
            }
            Op::Unary { op, value } => {
                let value = self.read(&wave[lane_index], *value)?;
                Some(eval_unary(*op, &value)?)
            }
            Op::Select { condition, pass, fail } => {
                let condition = self
                    .read(&wave[lane_index], *condition)?
                    .scalar()
                    .map(|s| s.as_bool())
                    .ok_or(Error::Malformed("non-scalar select condition"))?;
                Some(if condition {
                    self.read(&wave[lane_index], *pass)?
                } else {
                    self.read(&wave[lane_index], *fail)?
                })
            }
            Op::Any { value } => {
                let value = self.read(&wave[lane_index], *value)?;
                let any = match value {
                    Value::Scalar(s) => s.as_bool(),
                    Value::Vector(v) => v.iter().any(|s| s.as_bool()),
                    _ => return Err(Error::Malformed("any() on handle")),
                };
                Some(Value::Scalar(Scalar::Bool(any)))
            }
            Op::All { value } => {
                let value = self.read(&wave[lane_index], *value)?;
                let all = match value {
                    Value::Scalar(s) => s.as_bool(),
                    Value::Vector(v) => v.iter().all(|s| s.as_bool()),
                    _ => return Err(Error::Malformed("all() on handle")),
                };
                Some(Value::Scalar(Scalar::Bool(all)))
            }
            Op::BitCast { value } => {
                let value = self.read(&wave[lane_index], *value)?;
                Some(self.bitcast(value, result))
            }
            Op::Construct { values } => {
                let mut out = SmallVec::new();
                for &id in values.iter() {
                    match self.read(&wave[lane_index], id)? {
                        Value::Scalar(s) => out.push(s),
                        Value::Vector(v) => out.extend(v),
                        _ => return Err(Error::Malformed("construct of handle")),
                    }
                }
                Some(Value::Vector(out))
            }
            Op::Extract { composite, chains } => {
                let mut value = self.read(&wave[lane_index], *composite)?;
                for chain in chains.iter() {
                    let index = self
                        .read(&wave[lane_index], chain.index)?
                        .as_u32()
                        .ok_or(Error::Malformed("non-scalar extract index"))? as usize;
                    value = match value {
                        Value::Vector(v) => Value::Scalar(
                            v.get(index)
                                .copied()
                                .ok_or(Error::Malformed("extract out of range"))?,
                        ),
                        other => other,
                    };
                }
                Some(value)
            }
            Op::Load { address } => {
                let address = self.read(&wave[lane_index], *address)?;
                match address {
                    Value::Ptr { resource, element } => {
                        let word = self
                            .pool
                            .get(resource)
                            .and_then(|r| r.words.get(element as usize))
                            .copied()
                            .unwrap_or(0);
                        Some(Value::Scalar(Scalar::U32(word)))
                    }
                    // Loading a resource variable yields its handle.
                    other => Some(other),
                }
            }
            Op::Store { address, value } => {
                let address = self.read(&wave[lane_index], *address)?;
                let value = self
                    .read(&wave[lane_index], *value)?
                    .as_u32()
                    .ok_or(Error::Malformed("non-scalar store"))?;
                if let Value::Ptr { resource, element } = address {
                    if let Some(word) = self
                        .pool
                        .get_mut(resource)
                        .and_then(|r| r.words.get_mut(element as usize))
                    {
                        *word = value;
                    }
                }
                None
            }
            Op::AddressOf { composite, index } => {
                let handle = {
                    let value = self.read(&wave[lane_index], *composite)?;
                    self.resolve_handle(&value)
                };
                let element = self
                    .read(&wave[lane_index], *index)?
                    .as_u32()
                    .ok_or(Error::Malformed("non-scalar address index"))?;
                Some(Value::Ptr { resource: handle, element })
            }
            Op::AddressChain { composite, chains } => {
                let value = self.read(&wave[lane_index], *composite)?;
                match value {
                    Value::HandleArray { base_binding, count } => {
                        let index = chains
                            .first()
                            .map(|c| self.read(&wave[lane_index], c.index))
                            .transpose()?
                            .and_then(|v| v.as_u32())
                            .unwrap_or(0);
                        let handle = if index < count {
                            self.bindings
                                .get(&(base_binding + index))
                                .copied()
                                .unwrap_or(INVALID_HANDLE)
                        } else {
                            INVALID_HANDLE
                        };
                        Some(Value::Handle(handle))
                    }
                    Value::Handle(handle) => {
                        let element = chains
                            .first()
                            .map(|c| self.read(&wave[lane_index], c.index))
                            .transpose()?
                            .and_then(|v| v.as_u32())
                            .unwrap_or(0);
                        Some(Value::Ptr { resource: handle, element })
                    }
                    _ => return Err(Error::Unsupported("address chain on value")),
                }
            }
            Op::Atomic { op, address, value } => {
                let address = self.read(&wave[lane_index], *address)?;
                let operand = self
                    .read(&wave[lane_index], *value)?
                    .as_u32()
                    .ok_or(Error::Malformed("non-scalar atomic operand"))?;
                if let Value::Ptr { resource, element } = address {
                    let word = self
                        .pool
                        .get_mut(resource)
                        .and_then(|r| r.words.get_mut(element as usize));
                    let previous = match word {
                        Some(word) => {
                            let previous = *word;
                            *word = match op {
                                AtomicOp::Add => word.wrapping_add(operand),
                                AtomicOp::Or => previous | operand,
                                AtomicOp::And => previous & operand,
                                AtomicOp::Exchange => operand,
                            };
                            previous
                        }
                        None => 0,
                    };
                    Some(Value::Scalar(Scalar::U32(previous)))
                } else {
                    return Err(Error::Malformed("atomic on non-pointer"));
                }
            }
            Op::LoadBuffer { buffer, index } => {
                let handle = {
                    let value = self.read(&wave[lane_index], *buffer)?;
                    self.resolve_handle(&value)
                };
                let index = self
                    .read(&wave[lane_index], *index)?
                    .as_u32()
                    .ok_or(Error::Malformed("non-scalar buffer index"))?;
                // Out-of-range device reads return zero; validation reports
                // them separately.
                let word = self
                    .pool
                    .get(handle)
                    .filter(|r| index < r.desc.element_count)
                    .and_then(|r| r.words.get(index as usize))
                    .copied()
                    .unwrap_or(0);
                Some(Value::Vector(
                    (0..4).map(|i| Scalar::U32(if i == 0 { word } else { 0 })).collect(),
                ))
            }
            Op::StoreBuffer { buffer, index, value } => {
                let handle = {
                    let value = self.read(&wave[lane_index], *buffer)?;
                    self.resolve_handle(&value)
                };
                let index = self
                    .read(&wave[lane_index], *index)?
                    .as_u32()
                    .ok_or(Error::Malformed("non-scalar buffer index"))?;
                let word = match self.read(&wave[lane_index], *value)? {
                    Value::Scalar(s) => s.as_u32(),
                    Value::Vector(v) => v.first().map(|s| s.as_u32()).unwrap_or(0),
                    _ => return Err(Error::Malformed("store of handle")),
                };
                // Out-of-range device writes are dropped.
                if let Some(resource) = self.pool.get_mut(handle) {
                    if index < resource.desc.element_count {
                        if let Some(slot) = resource.words.get_mut(index as usize) {
                            *slot = word;
                        }
                    }
                }
                None
            }
            Op::LoadTexture { texture, index } | Op::SampleTexture { texture, coordinate: index, .. } => {
                let handle = {
                    let value = self.read(&wave[lane_index], *texture)?;
                    self.resolve_handle(&value)
                };
                let coordinate = self.read(&wave[lane_index], *index)?;
                let x = coordinate.component(0).map(|s| s.as_u32()).unwrap_or(0);
                let y = coordinate.component(1).map(|s| s.as_u32()).unwrap_or(0);
                let z = coordinate.component(2).map(|s| s.as_u32()).unwrap_or(0);
                let word = self
                    .pool
                    .get(handle)
                    .and_then(|r| r.texel_offset(x, y, z, 0).map(|o| r.words.get(o).copied()))
                    .flatten()
                    .unwrap_or(0);
                Some(Value::Vector(
                    (0..4).map(|i| Scalar::U32(if i == 0 { word } else { 0 })).collect(),
                ))
            }
            Op::StoreTexture { texture, index, value } => {
                let handle = {
                    let value = self.read(&wave[lane_index], *texture)?;
                    self.resolve_handle(&value)
                };
                let coordinate = self.read(&wave[lane_index], *index)?;
                let x = coordinate.component(0).map(|s| s.as_u32()).unwrap_or(0);
                let y = coordinate.component(1).map(|s| s.as_u32()).unwrap_or(0);
                let z = coordinate.component(2).map(|s| s.as_u32()).unwrap_or(0);
                let word = match self.read(&wave[lane_index], *value)? {
                    Value::Scalar(s) => s.as_u32(),
                    Value::Vector(v) => v.first().map(|s| s.as_u32()).unwrap_or(0),
                    _ => return Err(Error::Malformed("store of handle")),
                };
                if let Some(resource) = self.pool.get_mut(handle) {
                    if let Some(offset) = resource.texel_offset(x, y, z, 0) {
                        if let Some(slot) = resource.words.get_mut(offset) {
                            *slot = word;
                        }
                    }
                }
                None
            }
            Op::ResourceSize { resource } => {
                let handle = {
                    let value = self.read(&wave[lane_index], *resource)?;
                    self.resolve_handle(&value)
                };
                let desc = self
                    .pool
                    .get(handle)
                    .map(|r| r.desc)
                    .unwrap_or_default();
                let ty = self.program.types.value_type(result);
                let dim = ty
                    .and_then(|ty| self.program.types.get(ty))
                    .and_then(|ty| match ty {
                        Type::Vector { dim, .. } => Some(*dim),
                        _ => None,
                    });
                Some(match dim {
                    Some(2) => Value::Vector(
                        [desc.width, desc.height].iter().map(|&v| Scalar::U32(v)).collect(),
                    ),
                    Some(_) => Value::Vector(
                        [desc.width, desc.height, desc.depth_or_slices]
                            .iter()
                            .map(|&v| Scalar::U32(v))
                            .collect(),
                    ),
                    None => Value::Scalar(Scalar::U32(desc.element_count)),
                })
            }
            Op::ResourceToken { resource } => {
                let handle = {
                    let value = self.read(&wave[lane_index], *resource)?;
                    self.resolve_handle(&value)
                };
                let token = match self.pool.get(handle) {
                    Some(resource) => resource.desc.token,
                    // Unbound table entries carry the reserved sentinel.
                    None => crate::exec::TABLE_NOT_BOUND_TOKEN,
                };
                Some(Value::Scalar(Scalar::U32(token)))
            }
            Op::ResourceProperty { resource, property } => {
                let handle = {
                    let value = self.read(&wave[lane_index], *resource)?;
                    self.resolve_handle(&value)
                };
                let desc = self.pool.get(handle).map(|r| r.desc).unwrap_or_default();
                let value = match property {
                    ResourceProperty::Width => desc.width,
                    ResourceProperty::Height => desc.height,
                    ResourceProperty::DepthOrSliceCount => desc.depth_or_slices,
                    ResourceProperty::MipCount => desc.mip_count,
                    ResourceProperty::FormatSize => desc.format_size,
                    ResourceProperty::ViewFormatSize => desc.view_format_size,
                    ResourceProperty::ViewWidth => desc.view_width,
                    ResourceProperty::ViewBaseWidth => desc.view_base_width,
                    ResourceProperty::ViewBaseMip => desc.view_base_mip,
                    ResourceProperty::ViewBaseSlice => desc.view_base_slice,
                    ResourceProperty::ByteCount => desc.byte_count,
                    ResourceProperty::TexelCount => desc.element_count,
                };
                Some(Value::Scalar(Scalar::U32(value)))
            }
            Op::Phi { values } => {
                let prev = wave[lane_index].prev_block;
                let incoming = values
                    .iter()
                    .find(|v| v.block == prev)
                    .ok_or(Error::Malformed("phi without matching edge"))?;
                Some(self.read(&wave[lane_index], incoming.value)?)
            }
            Op::Call { .. } => return Err(Error::Unsupported("call execution")),
            Op::WaveAllEqual { .. } => unreachable!("handled in execute()"),
            Op::Branch { .. }
            | Op::BranchConditional { .. }
            | Op::Switch { .. }
            | Op::Return { .. } => unreachable!("terminators handled in run_segment"),
        };
        Ok(value)
    }

    fn bitcast(&self, value: Value, result: Id) -> Value {
        let target = self
            .program
            .types
            .value_type(result)
            .and_then(|ty| self.program.types.get(ty).cloned());
        let cast = |s: Scalar, ty: Option<&Type>| -> Scalar {
            let bits = s.as_u32();
            match ty {
                Some(Type::Fp { .. }) => Scalar::F32(f32::from_bits(bits)),
                Some(Type::Int { signed: true, .. }) => Scalar::I32(bits as i32),
                Some(Type::Bool) => Scalar::Bool(bits != 0),
                _ => Scalar::U32(bits),
            }
        };
        match (&value, &target) {
            (Value::Scalar(s), ty) => Value::Scalar(cast(*s, ty.as_ref())),
            (Value::Vector(v), Some(Type::Vector { elem, .. })) => {
                let elem_ty = self.program.types.get(*elem).cloned();
                Value::Vector(v.iter().map(|&s| cast(s, elem_ty.as_ref())).collect())
            }
            _ => value,
        }
    }
}

/// Packed token of an unbound descriptor table entry. Mirrors the reserved
/// PUID scheme used by the addressing crate.
pub const TABLE_NOT_BOUND_TOKEN: u32 = (1 << 24) - 1;

fn eval_binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value> {
    match (lhs, rhs) {
        (Value::Vector(a), Value::Vector(b)) => {
            let mut out = SmallVec::new();
            for (x, y) in a.iter().zip(b.iter()) {
                out.push(eval_binary_scalar(op, *x, *y));
            }
            Ok(Value::Vector(out))
        }
        (Value::Vector(a), Value::Scalar(b)) => {
            Ok(Value::Vector(a.iter().map(|&x| eval_binary_scalar(op, x, *b)).collect()))
        }
        (Value::Scalar(a), Value::Vector(b)) => {
            Ok(Value::Vector(b.iter().map(|&y| eval_binary_scalar(op, *a, y)).collect()))
        }
        (Value::Scalar(a), Value::Scalar(b)) => {
            Ok(Value::Scalar(eval_binary_scalar(op, *a, *b)))
        }
        _ => Err(Error::Malformed("binary op on handle")),
    }
}

fn eval_binary_scalar(op: BinaryOp, lhs: Scalar, rhs: Scalar) -> Scalar {
    use Scalar::*;
    match (lhs, rhs) {
        (F32(a), F32(b)) => match op {
            BinaryOp::Add => F32(a + b),
            BinaryOp::Sub => F32(a - b),
            BinaryOp::Mul => F32(a * b),
            BinaryOp::Div => F32(a / b),
            BinaryOp::Rem => F32(a % b),
            BinaryOp::Equal => Bool(a == b),
            BinaryOp::NotEqual => Bool(a != b),
            BinaryOp::LessThan => Bool(a < b),
            BinaryOp::LessThanEqual => Bool(a <= b),
            BinaryOp::GreaterThan => Bool(a > b),
            BinaryOp::GreaterThanEqual => Bool(a >= b),
            _ => U32(0),
        },
        (I32(a), I32(b)) => match op {
            BinaryOp::Add => I32(a.wrapping_add(b)),
            BinaryOp::Sub => I32(a.wrapping_sub(b)),
            BinaryOp::Mul => I32(a.wrapping_mul(b)),
            BinaryOp::Div => I32(if b != 0 { a.wrapping_div(b) } else { 0 }),
            BinaryOp::Rem => I32(if b != 0 { a.wrapping_rem(b) } else { 0 }),
            BinaryOp::Equal => Bool(a == b),
            BinaryOp::NotEqual => Bool(a != b),
            BinaryOp::LessThan => Bool(a < b),
            BinaryOp::LessThanEqual => Bool(a <= b),
            BinaryOp::GreaterThan => Bool(a > b),
            BinaryOp::GreaterThanEqual => Bool(a >= b),
            BinaryOp::BitAnd => I32(a & b),
            BinaryOp::BitOr => I32(a | b),
            BinaryOp::BitXor => I32(a ^ b),
            _ => eval_binary_scalar(op, U32(a as u32), U32(b as u32)),
        },
        (Bool(a), Bool(b)) => match op {
            BinaryOp::And => Bool(a && b),
            BinaryOp::Or => Bool(a || b),
            BinaryOp::Equal => Bool(a == b),
            BinaryOp::NotEqual => Bool(a != b),
            _ => U32(0),
        },
        // Mixed integer kinds defer to unsigned semantics.
        (a, b) => {
            let (a, b) = (a.as_u32(), b.as_u32());
            match op {
                BinaryOp::Add => U32(a.wrapping_add(b)),
                BinaryOp::Sub => U32(a.wrapping_sub(b)),
                BinaryOp::Mul => U32(a.wrapping_mul(b)),
                BinaryOp::Div => U32(if b != 0 { a / b } else { 0 }),
                BinaryOp::Rem => U32(if b != 0 { a % b } else { 0 }),
                BinaryOp::BitAnd => U32(a & b),
                BinaryOp::BitOr => U32(a | b),
                BinaryOp::BitXor => U32(a ^ b),
                BinaryOp::BitShiftLeft => U32(a.wrapping_shl(b)),
                BinaryOp::BitShiftRight => U32(a.wrapping_shr(b)),
                BinaryOp::And => Bool(a != 0 && b != 0),
                BinaryOp::Or => Bool(a != 0 || b != 0),
                BinaryOp::Equal => Bool(a == b),
                BinaryOp::NotEqual => Bool(a != b),
                BinaryOp::LessThan => Bool(a < b),
                BinaryOp::LessThanEqual => Bool(a <= b),
                BinaryOp::GreaterThan => Bool(a > b),
                BinaryOp::GreaterThanEqual => Bool(a >= b),
                BinaryOp::UMin => U32(a.min(b)),
                BinaryOp::UMax => U32(a.max(b)),
            }
        }
    }
}

fn eval_unary(op: UnaryOp, value: &Value) -> Result<Value> {
    let eval = |s: Scalar| -> Scalar {
        match op {
            UnaryOp::Not => Scalar::Bool(!s.as_bool()),
            UnaryOp::BitNot => Scalar::U32(!s.as_u32()),
            UnaryOp::Negate => match s {
                Scalar::F32(v) => Scalar::F32(-v),
                Scalar::I32(v) => Scalar::I32(v.wrapping_neg()),
                other => Scalar::I32((other.as_u32() as i32).wrapping_neg()),
            },
            UnaryOp::IsNan => match s {
                Scalar::F32(v) => Scalar::Bool(v.is_nan()),
                _ => Scalar::Bool(false),
            },
            UnaryOp::IsInf => match s {
                Scalar::F32(v) => Scalar::Bool(v.is_infinite()),
                _ => Scalar::Bool(false),
            },
            UnaryOp::FirstBitHigh => {
                let v = s.as_u32();
                Scalar::U32(if v == 0 { !0 } else { 31 - v.leading_zeros() })
            }
        }
    };
    Ok(match value {
        Value::Scalar(s) => Value::Scalar(eval(*s)),
        Value::Vector(v) => Value::Vector(v.iter().map(|&s| eval(s)).collect()),
        _ => return Err(Error::Malformed("unary op on handle")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::Emitter;
    use crate::function::Function;
    use crate::inst::BranchControlFlow;
    use crate::program::Program;
    use crate::types::{AddressSpace, Format, SamplerMode, Type};

    fn uint_buffer(desc_token: u32, element_count: u32) -> Resource {
        Resource::buffer(ResourceDesc {
            token: desc_token,
            element_count,
            view_width: element_count,
            width: element_count,
            format_size: 4,
            view_format_size: 4,
            mip_count: 1,
            byte_count: element_count * 4,
            ..Default::default()
        })
    }

    /// rwbuf[tid.x] = tid.x * 2
    #[test]
    fn linear_store_dispatch() {
        let mut program = Program::new();
        let void = program.type_void();
        let uint = program.type_u32();
        let buffer_ty = program.add_type(Type::Buffer {
            elem: uint,
            sampler_mode: SamplerMode::Writable,
            texel_format: Format::R32UInt,
        });
        let var = program.add_variable(buffer_ty, AddressSpace::Resource, Some(0));

        let fn_id = program.identifiers.alloc();
        let mut function = Function::new(fn_id, void);
        let entry = function.alloc_block(&mut program.identifiers);
        program.add_function(function);
        program.set_entry_point(fn_id);

        let mut e = Emitter::new(&mut program, fn_id, entry);
        let tid = e.dispatch_thread_id();
        let zero = e.u32(0);
        let x = e.extract(tid, zero);
        let two = e.u32(2);
        let doubled = e.mul(x, two);
        e.store_buffer(var, x, doubled);
        e.ret_void();

        let mut pool = ResourcePool::new();
        let handle = pool.add(uint_buffer(1, 8));
        let mut bindings = FxHashMap::default();
        bindings.insert(0u32, handle);

        Dispatcher::new(&program, &mut pool, &bindings, 4)
            .dispatch(8)
            .expect("dispatch");

        let words = &pool.get(handle).unwrap().words;
        assert_eq!(words, &vec![0, 2, 4, 6, 8, 10, 12, 14]);
    }

    /// Divergent selection with a merge: odd lanes write, even lanes skip.
    #[test]
    fn divergent_selection_masks_lanes() {
        let mut program = Program::new();
        let void = program.type_void();
        let uint = program.type_u32();
        let buffer_ty = program.add_type(Type::Buffer {
            elem: uint,
            sampler_mode: SamplerMode::Writable,
            texel_format: Format::R32UInt,
        });
        let var = program.add_variable(buffer_ty, AddressSpace::Resource, Some(0));

        let fn_id = program.identifiers.alloc();
        let mut function = Function::new(fn_id, void);
        let entry = function.alloc_block(&mut program.identifiers);
        let write_block = function.alloc_block(&mut program.identifiers);
        let merge = function.alloc_block(&mut program.identifiers);
        program.add_function(function);
        program.set_entry_point(fn_id);

        let mut e = Emitter::new(&mut program, fn_id, entry);
        let tid = e.dispatch_thread_id();
        let zero = e.u32(0);
        let x = e.extract(tid, zero);
        let two = e.u32(2);
        let odd = e.rem(x, two);
        let one = e.u32(1);
        let is_odd = e.equal(odd, one);
        e.branch_conditional(is_odd, write_block, merge, BranchControlFlow::selection(merge));

        let mut e = Emitter::new(&mut program, fn_id, write_block);
        let seven = e.u32(7);
        e.store_buffer(var, x, seven);
        e.branch(merge);

        let mut e = Emitter::new(&mut program, fn_id, merge);
        e.ret_void();

        let mut pool = ResourcePool::new();
        let handle = pool.add(uint_buffer(1, 4));
        let mut bindings = FxHashMap::default();
        bindings.insert(0u32, handle);

        Dispatcher::new(&program, &mut pool, &bindings, 4)
            .dispatch(4)
            .expect("dispatch");

        assert_eq!(pool.get(handle).unwrap().words, vec![0, 7, 0, 7]);
    }

    /// WaveAllEqual sees the active lanes only.
    #[test]
    fn wave_all_equal_follows_mask() {
        let mut program = Program::new();
        let void = program.type_void();
        let uint = program.type_u32();
        let buffer_ty = program.add_type(Type::Buffer {
            elem: uint,
            sampler_mode: SamplerMode::Writable,
            texel_format: Format::R32UInt,
        });
        let var = program.add_variable(buffer_ty, AddressSpace::Resource, Some(0));

        let fn_id = program.identifiers.alloc();
        let mut function = Function::new(fn_id, void);
        let entry = function.alloc_block(&mut program.identifiers);
        program.add_function(function);
        program.set_entry_point(fn_id);

        let mut e = Emitter::new(&mut program, fn_id, entry);
        let tid = e.dispatch_thread_id();
        let zero = e.u32(0);
        let x = e.extract(tid, zero);
        let equal = e.wave_all_equal(x);
        let one = e.u32(1);
        let zero_c = e.u32(0);
        let report = e.select(equal, one, zero_c);
        e.store_buffer(var, x, report);
        e.ret_void();

        let mut pool = ResourcePool::new();
        let handle = pool.add(uint_buffer(1, 4));
        let mut bindings = FxHashMap::default();
        bindings.insert(0u32, handle);

        // Four divergent lanes in one wave: not all equal.
        Dispatcher::new(&program, &mut pool, &bindings, 4)
            .dispatch(4)
            .expect("dispatch");
        assert_eq!(pool.get(handle).unwrap().words, vec![0, 0, 0, 0]);

        // Wave size 1: every lane trivially uniform.
        let mut pool = ResourcePool::new();
        let handle = pool.add(uint_buffer(1, 4));
        let mut bindings = FxHashMap::default();
        bindings.insert(0u32, handle);
        Dispatcher::new(&program, &mut pool, &bindings, 1)
            .dispatch(4)
            .expect("dispatch");
        assert_eq!(pool.get(handle).unwrap().words, vec![1, 1, 1, 1]);
    }
}
