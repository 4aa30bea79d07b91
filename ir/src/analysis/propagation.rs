//! Sparse conditional propagation over SSA values.
//!
//! The engine keeps a reachability set over blocks and a lattice value per
//! identifier. Propagators plug in per-lattice transfer functions; the
//! engine iterates to a fixed point, only following branch edges that the
//! constant lattice proves reachable.

use crate::constant::Constant;
use crate::function::Function;
use crate::inst::{BinaryOp, Op, UnaryOp};
use crate::program::Program;
use crate::Id;
use fxhash::{FxHashMap, FxHashSet};

/// Constant lattice: Unknown < Constant(v) < Varying.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ConstantLattice {
    Unknown,
    Int(i64),
    Bool(bool),
    Fp(f64),
    Varying,
}

impl ConstantLattice {
    fn is_constant(self) -> bool {
        match self {
            ConstantLattice::Int(_) | ConstantLattice::Bool(_) | ConstantLattice::Fp(_) => true,
            _ => false,
        }
    }

    fn meet(self, other: ConstantLattice) -> ConstantLattice {
        match (self, other) {
            (ConstantLattice::Unknown, v) => v,
            (v, ConstantLattice::Unknown) => v,
            (a, b) if a == b => a,
            _ => ConstantLattice::Varying,
        }
    }
}

/// Wave divergence lattice: Uniform < Divergent.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WorkGroupDivergence {
    Uniform,
    Divergent,
}

impl WorkGroupDivergence {
    fn join(self, other: WorkGroupDivergence) -> WorkGroupDivergence {
        if self == WorkGroupDivergence::Divergent || other == WorkGroupDivergence::Divergent {
            WorkGroupDivergence::Divergent
        } else {
            WorkGroupDivergence::Uniform
        }
    }
}

/// Constant folding over the value lattice.
#[derive(Clone, Debug, Default)]
pub struct ConstantPropagator {
    values: FxHashMap<Id, ConstantLattice>,
}

impl ConstantPropagator {
    fn get(&self, program: &Program, id: Id) -> ConstantLattice {
        if let Some(&value) = self.values.get(&id) {
            return value;
        }
        match program.constants.get(id) {
            Some(Constant::Int(v)) => ConstantLattice::Int(*v),
            Some(Constant::Bool(v)) => ConstantLattice::Bool(*v),
            Some(Constant::Fp(v)) => ConstantLattice::Fp(v.into_inner()),
            Some(_) => ConstantLattice::Varying,
            None => ConstantLattice::Unknown,
        }
    }

    pub fn is_constant(&self, program: &Program, id: Id) -> bool {
        self.get(program, id).is_constant()
    }

    pub fn is_varying(&self, program: &Program, id: Id) -> bool {
        self.get(program, id) == ConstantLattice::Varying
    }

    fn fold_binary(op: BinaryOp, lhs: ConstantLattice, rhs: ConstantLattice) -> ConstantLattice {
        use ConstantLattice::*;
        match (lhs, rhs) {
            (Int(a), Int(b)) => {
                let (ua, ub) = (a as u64, b as u64);
                match op {
                    BinaryOp::Add => Int(a.wrapping_add(b)),
                    BinaryOp::Sub => Int(a.wrapping_sub(b)),
                    BinaryOp::Mul => Int(a.wrapping_mul(b)),
                    BinaryOp::Div if b != 0 => Int(a.wrapping_div(b)),
                    BinaryOp::Rem if b != 0 => Int(a.wrapping_rem(b)),
                    BinaryOp::BitAnd => Int(a & b),
                    BinaryOp::BitOr => Int(a | b),
                    BinaryOp::BitXor => Int(a ^ b),
                    BinaryOp::BitShiftLeft => Int(((ua as u32) << (ub as u32 & 31)) as i64),
                    BinaryOp::BitShiftRight => Int(((ua as u32) >> (ub as u32 & 31)) as i64),
                    BinaryOp::Equal => Bool(a == b),
                    BinaryOp::NotEqual => Bool(a != b),
                    BinaryOp::LessThan => Bool(a < b),
                    BinaryOp::LessThanEqual => Bool(a <= b),
                    BinaryOp::GreaterThan => Bool(a > b),
                    BinaryOp::GreaterThanEqual => Bool(a >= b),
                    BinaryOp::UMin => Int((ua as u32).min(ub as u32) as i64),
                    BinaryOp::UMax => Int((ua as u32).max(ub as u32) as i64),
                    _ => Varying,
                }
            }
            (Bool(a), Bool(b)) => match op {
                BinaryOp::And => Bool(a && b),
                BinaryOp::Or => Bool(a || b),
                BinaryOp::Equal => Bool(a == b),
                BinaryOp::NotEqual => Bool(a != b),
                _ => Varying,
            },
            (Unknown, _) | (_, Unknown) => Unknown,
            _ => Varying,
        }
    }

    fn fold_unary(op: UnaryOp, value: ConstantLattice) -> ConstantLattice {
        use ConstantLattice::*;
        match (op, value) {
            (UnaryOp::Not, Bool(v)) => Bool(!v),
            (UnaryOp::BitNot, Int(v)) => Int(!(v as u32) as i64),
            (UnaryOp::Negate, Int(v)) => Int(v.wrapping_neg()),
            (UnaryOp::FirstBitHigh, Int(v)) if v != 0 => {
                Int((31 - (v as u32).leading_zeros()) as i64)
            }
            (_, Unknown) => Unknown,
            _ => Varying,
        }
    }
}

/// Divergence propagation: wave-intrinsic and kernel-id sources seed the
/// `Divergent` state; any divergent operand taints the result.
#[derive(Clone, Debug, Default)]
pub struct DivergencePropagator {
    values: FxHashMap<Id, WorkGroupDivergence>,
}

impl DivergencePropagator {
    pub fn divergence(&self, id: Id) -> WorkGroupDivergence {
        self.values
            .get(&id)
            .copied()
            .unwrap_or(WorkGroupDivergence::Uniform)
    }

    pub fn is_divergent(&self, id: Id) -> bool {
        self.divergence(id) == WorkGroupDivergence::Divergent
    }
}

/// Per-function simulation state: block reachability plus the constant and
/// divergence lattices.
#[derive(Clone, Debug)]
pub struct SimulationAnalysis {
    reachable: FxHashSet<Id>,
    constants: ConstantPropagator,
    divergence: DivergencePropagator,
}

impl SimulationAnalysis {
    pub fn compute(program: &Program, function: &Function) -> SimulationAnalysis {
        let mut analysis = SimulationAnalysis {
            reachable: FxHashSet::default(),
            constants: ConstantPropagator::default(),
            divergence: DivergencePropagator::default(),
        };

        let entry = match function.entry_block() {
            Some(entry) => entry,
            None => return analysis,
        };
        analysis.reachable.insert(entry);

        // Iterate to fixed point. Block count bounds the lattice height, so
        // the loop terminates.
        loop {
            let mut mutated = false;

            for &block_id in function.blocks().order() {
                if !analysis.reachable.contains(&block_id) {
                    continue;
                }
                let block = match function.block(block_id) {
                    Some(block) => block,
                    None => continue,
                };

                for instruction in &block.instructions {
                    mutated |= analysis.transfer(program, instruction.result, &instruction.op);
                }

                // Mark branch targets reachable, following only the edges the
                // constant lattice allows.
                if let Some(terminator) = block.terminator() {
                    let targets: Vec<Id> = match &terminator.op {
                        Op::BranchConditional { condition, pass, fail, .. } => {
                            match analysis.constants.get(program, *condition) {
                                ConstantLattice::Bool(true) => vec![*pass],
                                ConstantLattice::Bool(false) => vec![*fail],
                                ConstantLattice::Unknown => vec![],
                                _ => vec![*pass, *fail],
                            }
                        }
                        other => other.successors().into_vec(),
                    };
                    for target in targets {
                        mutated |= analysis.reachable.insert(target);
                    }
                }
            }

            if !mutated {
                break;
            }
        }

        analysis
    }

    fn transfer(&mut self, program: &Program, result: Id, op: &Op) -> bool {
        if !result.is_valid() {
            return false;
        }

        let constant = self.constant_transfer(program, op);
        let divergence = self.divergence_transfer(program, op);

        let mut mutated = false;
        if self.constants.values.get(&result) != Some(&constant) {
            self.constants.values.insert(result, constant);
            mutated = true;
        }
        if self.divergence.values.get(&result) != Some(&divergence) {
            self.divergence.values.insert(result, divergence);
            mutated = true;
        }
        mutated
    }

    fn constant_transfer(&self, program: &Program, op: &Op) -> ConstantLattice {
        match op {
            Op::Binary { op, lhs, rhs } => ConstantPropagator::fold_binary(
                *op,
                self.constants.get(program, *lhs),
                self.constants.get(program, *rhs),
            ),
            Op::Unary { op, value } => {
                ConstantPropagator::fold_unary(*op, self.constants.get(program, *value))
            }
            Op::Select { condition, pass, fail } => {
                match self.constants.get(program, *condition) {
                    ConstantLattice::Bool(true) => self.constants.get(program, *pass),
                    ConstantLattice::Bool(false) => self.constants.get(program, *fail),
                    ConstantLattice::Unknown => ConstantLattice::Unknown,
                    _ => self
                        .constants
                        .get(program, *pass)
                        .meet(self.constants.get(program, *fail)),
                }
            }
            Op::BitCast { value } => self.constants.get(program, *value),
            Op::Phi { values } => {
                let mut lattice = ConstantLattice::Unknown;
                for value in values {
                    if self.reachable.contains(&value.block) {
                        lattice = lattice.meet(self.constants.get(program, value.value));
                    }
                }
                lattice
            }
            _ => ConstantLattice::Varying,
        }
    }

    fn divergence_transfer(&self, program: &Program, op: &Op) -> WorkGroupDivergence {
        match op {
            // Kernel-id sources differ per lane by construction.
            Op::DispatchThreadId | Op::LocalInvocationId => WorkGroupDivergence::Divergent,
            // Atomics race across lanes.
            Op::Atomic { .. } => WorkGroupDivergence::Divergent,
            // Wave reductions produce wave-uniform values.
            Op::WaveAllEqual { .. } => WorkGroupDivergence::Uniform,
            // Resource reads diverge with their addressing.
            Op::LoadBuffer { index, .. } | Op::LoadTexture { index, .. } => {
                self.divergence.divergence(*index)
            }
            Op::SampleTexture { coordinate, .. } => self.divergence.divergence(*coordinate),
            _ => {
                // Constants fold uniform regardless of the operand walk.
                let mut divergence = WorkGroupDivergence::Uniform;
                for operand in op.operands() {
                    if program.constants.is_constant(operand) {
                        continue;
                    }
                    divergence = divergence.join(self.divergence.divergence(operand));
                }
                divergence
            }
        }
    }

    pub fn is_block_executable(&self, block: Id) -> bool {
        self.reachable.contains(&block)
    }

    pub fn constant_propagator(&self) -> &ConstantPropagator {
        &self.constants
    }

    pub fn divergence_propagator(&self) -> &DivergencePropagator {
        &self.divergence
    }
}

/// Program-level composition: per-function simulation states plus call-edge
/// divergence. A call result is divergent when any argument or the callee's
/// returned value is.
#[derive(Clone, Debug, Default)]
pub struct InterproceduralSimulation {
    functions: FxHashMap<Id, SimulationAnalysis>,
    call_results: FxHashMap<Id, WorkGroupDivergence>,
}

impl InterproceduralSimulation {
    pub fn compute(program: &Program) -> InterproceduralSimulation {
        let mut out = InterproceduralSimulation::default();

        for function in program.functions() {
            let analysis = SimulationAnalysis::compute(program, function);
            out.functions.insert(function.id(), analysis);
        }

        // Resolve call result divergence against the callee's return values.
        for function in program.functions() {
            let local = &out.functions[&function.id()];
            for block in function.blocks().iter() {
                for instruction in &block.instructions {
                    if let Op::Call { function: callee, arguments } = &instruction.op {
                        let mut divergence = WorkGroupDivergence::Uniform;
                        for &argument in arguments.iter() {
                            divergence =
                                divergence.join(local.divergence_propagator().divergence(argument));
                        }
                        if let Some(callee_analysis) = out.functions.get(callee) {
                            divergence = divergence.join(Self::return_divergence(
                                program,
                                *callee,
                                callee_analysis,
                            ));
                        }
                        out.call_results.insert(instruction.result, divergence);
                    }
                }
            }
        }

        out
    }

    fn return_divergence(
        program: &Program,
        callee: Id,
        analysis: &SimulationAnalysis,
    ) -> WorkGroupDivergence {
        let function = match program.function(callee) {
            Some(function) => function,
            None => return WorkGroupDivergence::Divergent,
        };
        let mut divergence = WorkGroupDivergence::Uniform;
        for block in function.blocks().iter() {
            if let Some(instruction) = block.terminator() {
                if let Op::Return { value } = instruction.op {
                    if value.is_valid() {
                        divergence = divergence
                            .join(analysis.divergence_propagator().divergence(value));
                    }
                }
            }
        }
        divergence
    }

    pub fn function(&self, id: Id) -> Option<&SimulationAnalysis> {
        self.functions.get(&id)
    }

    pub fn call_result_divergence(&self, result: Id) -> WorkGroupDivergence {
        self.call_results
            .get(&result)
            .copied()
            .unwrap_or(WorkGroupDivergence::Uniform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::Emitter;
    use crate::function::Function;
    use crate::inst::BranchControlFlow;
    use crate::program::Program;

    #[test]
    fn constants_fold_and_prune_branches() {
        let mut program = Program::new();
        let void = program.type_void();
        let fn_id = program.identifiers.alloc();
        let mut function = Function::new(fn_id, void);
        let entry = function.alloc_block(&mut program.identifiers);
        let dead = function.alloc_block(&mut program.identifiers);
        let live = function.alloc_block(&mut program.identifiers);
        program.add_function(function);
        program.set_entry_point(fn_id);

        let (two, three) = (program.const_u32(2), program.const_u32(3));
        let mut e = Emitter::new(&mut program, fn_id, entry);
        let sum = e.add(two, three);
        let five = e.u32(5);
        let cond = e.equal(sum, five);
        e.branch_conditional(cond, live, dead, BranchControlFlow::selection(live));
        let mut e = Emitter::new(&mut program, fn_id, dead);
        e.ret_void();
        let mut e = Emitter::new(&mut program, fn_id, live);
        e.ret_void();

        let function = program.function(fn_id).unwrap();
        let analysis = SimulationAnalysis::compute(&program, function);

        assert!(analysis.constant_propagator().is_constant(&program, sum));
        assert!(analysis.is_block_executable(live));
        assert!(!analysis.is_block_executable(dead));
    }

    #[test]
    fn kernel_ids_taint_divergence() {
        let mut program = Program::new();
        let void = program.type_void();
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
        let scaled = e.mul(x, two);
        let uniform = e.add(two, two);
        e.ret_void();

        let function = program.function(fn_id).unwrap();
        let analysis = SimulationAnalysis::compute(&program, function);

        assert!(analysis.divergence_propagator().is_divergent(x));
        assert!(analysis.divergence_propagator().is_divergent(scaled));
        assert!(!analysis.divergence_propagator().is_divergent(uniform));
    }
}
