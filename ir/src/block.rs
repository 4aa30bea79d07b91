//! Basic blocks, the per-function user map, and block splitting.

use crate::inst::{Instruction, Op, PhiValue};
use crate::program::IdentifierMap;
use crate::{Id, SourceSpan};
use fxhash::FxHashMap;
use smallvec::SmallVec;

bitflags! {
    /// Block-level flags.
    pub struct BlockFlags: u32 {
        /// Block was authored by a pass; later passes must not instrument it.
        const NO_INSTRUMENTATION = 0x1;
    }
}

bitflags! {
    /// Behavior of `Function::split_block`.
    pub struct SplitFlags: u32 {
        /// Rewrite phi operands and loop continue references naming the split
        /// block so they follow the terminator into the successor.
        const REDIRECT_BRANCH_USERS = 0x1;
        /// Preserve phi semantics when the split point lands inside a phi
        /// prelude, decomposing phis that resolve a back-edge.
        const SPLIT_PHI_EDGES = 0x2;
        /// If the split block is a loop header, retarget the continue block's
        /// back-edge onto the successor.
        const REDIRECT_LOOP_BACKEDGE = 0x4;
    }
}

impl SplitFlags {
    /// The combination every instrumentation split uses.
    pub fn standard() -> SplitFlags {
        SplitFlags::all()
    }
}

/// An ordered instruction sequence ending in exactly one terminator.
#[derive(Clone, Debug)]
pub struct BasicBlock {
    id: Id,
    pub instructions: Vec<Instruction>,
    pub flags: BlockFlags,
    dirty: bool,
    /// Word range in the source module, for byte reuse during stitching.
    pub source_range: Option<(usize, usize)>,
}

impl BasicBlock {
    pub fn new(id: Id) -> BasicBlock {
        BasicBlock {
            id,
            instructions: Vec::new(),
            flags: BlockFlags::empty(),
            dirty: true,
            source_range: None,
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn push(&mut self, instruction: Instruction) {
        self.dirty = true;
        self.instructions.push(instruction);
    }

    pub fn insert(&mut self, index: usize, instruction: Instruction) {
        self.dirty = true;
        self.instructions.insert(index, instruction);
    }

    /// The single terminator, if the block is sealed.
    pub fn terminator(&self) -> Option<&Instruction> {
        self.instructions.last().filter(|i| i.op.is_terminator())
    }

    pub fn terminator_mut(&mut self) -> Option<&mut Instruction> {
        self.dirty = true;
        self.instructions.last_mut().filter(|i| i.op.is_terminator())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Parsed blocks start clean so the stitcher can reuse their bytes.
    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Index of the first non-phi instruction at or after `from`.
    pub fn first_non_phi(&self, from: usize) -> usize {
        let mut index = from;
        while index < self.instructions.len() && self.instructions[index].is_phi() {
            index += 1;
        }
        index
    }
}

/// Block arena owned by a function. Links between blocks are by id, never by
/// reference; the list is the single owner.
#[derive(Clone, Debug, Default)]
pub struct BasicBlockList {
    order: Vec<Id>,
    blocks: FxHashMap<Id, BasicBlock>,
}

impl BasicBlockList {
    pub fn new() -> BasicBlockList {
        Default::default()
    }

    pub fn alloc_block(&mut self, identifiers: &mut IdentifierMap) -> Id {
        let id = identifiers.alloc();
        self.order.push(id);
        self.blocks.insert(id, BasicBlock::new(id));
        id
    }

    /// Insert a parsed block under its source id.
    pub fn add_with_id(&mut self, block: BasicBlock) {
        self.order.push(block.id());
        self.blocks.insert(block.id(), block);
    }

    pub fn get(&self, id: Id) -> Option<&BasicBlock> {
        self.blocks.get(&id)
    }

    pub fn get_mut(&mut self, id: Id) -> Option<&mut BasicBlock> {
        self.blocks.get_mut(&id)
    }

    /// Entry block: the first in program order.
    pub fn entry(&self) -> Option<Id> {
        self.order.first().copied()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Block ids in program order. The slice is stable across instruction
    /// mutation, only growing when blocks are allocated.
    pub fn order(&self) -> &[Id] {
        &self.order
    }

    pub fn iter(&self) -> impl Iterator<Item = &BasicBlock> {
        self.order.iter().filter_map(move |id| self.blocks.get(id))
    }

    /// Fetch two distinct blocks mutably.
    fn get_pair_mut(&mut self, a: Id, b: Id) -> Option<(&mut BasicBlock, &mut BasicBlock)> {
        debug_assert_ne!(a, b);
        let a_ptr = self.blocks.get_mut(&a)? as *mut BasicBlock;
        let b_ref = self.blocks.get_mut(&b)?;
        // Distinct keys map to distinct entries.
        unsafe { Some((&mut *a_ptr, b_ref)) }
    }
}

/// Location of a referencing instruction.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct UserRef {
    pub block: Id,
    pub index: usize,
}

/// Back-reference map: for every identifier a block references and every
/// block a terminator or phi names, the referencing instructions.
#[derive(Clone, Debug, Default)]
pub struct UserMap {
    value_users: FxHashMap<Id, Vec<UserRef>>,
    block_users: FxHashMap<Id, Vec<UserRef>>,
}

impl UserMap {
    pub fn clear(&mut self) {
        self.value_users.clear();
        self.block_users.clear();
    }

    /// Rebuild from all blocks.
    pub fn index(&mut self, blocks: &BasicBlockList) {
        self.clear();
        for block in blocks.iter() {
            for (index, instruction) in block.instructions.iter().enumerate() {
                let user = UserRef { block: block.id(), index };
                for operand in instruction.op.operands() {
                    self.value_users.entry(operand).or_default().push(user);
                }
                for referenced in instruction.op.referenced_blocks() {
                    self.block_users.entry(referenced).or_default().push(user);
                }
            }
        }
    }

    pub fn value_users(&self, value: Id) -> &[UserRef] {
        self.value_users.get(&value).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn block_users(&self, block: Id) -> &[UserRef] {
        self.block_users.get(&block).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

/// Outcome of a block split: the successor block and the index of the first
/// moved instruction within it.
#[derive(Copy, Clone, Debug)]
pub struct SplitPoint {
    pub block: Id,
    pub index: usize,
}

fn phi_references_back_edge(values: &[PhiValue], continue_block: Id) -> bool {
    continue_block.is_valid() && values.iter().any(|v| v.block == continue_block)
}

/// Split `src` at `split_index`, moving `[split_index, end)` into the empty
/// block `dest`. See `SplitFlags` for edge handling. The user map is left
/// reindexed.
///
/// Invariant preserved: after the split, phi operations reference the block
/// containing the value producer, not the syntactic predecessor list.
pub fn split_block(
    blocks: &mut BasicBlockList,
    users: &mut UserMap,
    identifiers: &mut IdentifierMap,
    src: Id,
    dest: Id,
    split_index: usize,
    flags: SplitFlags,
) -> SplitPoint {
    debug_assert!(
        blocks.get(dest).map(|b| b.is_empty()).unwrap_or(false),
        "cannot split into a filled basic block"
    );

    // Control flow of the source terminator, before it moves.
    let src_control_flow = blocks
        .get(src)
        .and_then(|b| b.terminator())
        .and_then(|t| t.op.control_flow());

    // Retarget a loop back-edge onto the new header.
    if flags.contains(SplitFlags::REDIRECT_LOOP_BACKEDGE) {
        if let Some(cf) = src_control_flow {
            if cf.continue_block.is_valid() {
                if let Some(continue_block) = blocks.get_mut(cf.continue_block) {
                    if let Some(terminator) = continue_block.terminator_mut() {
                        if let Op::Branch { target } = &mut terminator.op {
                            if *target == src {
                                *target = dest;
                                terminator.source = terminator.source.modify();
                            }
                        }
                    }
                }
            }
        }
    }

    // Phi prelude handling: when the split point sits inside phis that do not
    // resolve a back-edge, the phis stay in the source block.
    let mut split_index_phi = split_index;
    let mut has_back_edge_phis = false;
    {
        let block = blocks.get(src).expect("split source must exist");
        if split_index < block.len() && block.instructions[split_index].is_phi() {
            if flags.contains(SplitFlags::SPLIT_PHI_EDGES) {
                let continue_block = src_control_flow
                    .map(|cf| cf.continue_block)
                    .unwrap_or(Id::INVALID);
                if let Op::Phi { values } = &block.instructions[split_index].op {
                    has_back_edge_phis = phi_references_back_edge(values, continue_block);
                }
                if cfg!(debug_assertions) {
                    for inst in &block.instructions[split_index..] {
                        if let Op::Phi { values } = &inst.op {
                            debug_assert_eq!(
                                phi_references_back_edge(values, continue_block),
                                has_back_edge_phis,
                                "mismatch in back-edge status"
                            );
                        }
                    }
                }
                if !has_back_edge_phis {
                    split_index_phi = block.first_non_phi(split_index);
                }
            }
        }
    }

    // Redirect users: successor phis naming `src` as predecessor, and loop
    // headers whose continue block is `src`, now see the terminator arrive
    // from `dest`.
    if flags.contains(SplitFlags::REDIRECT_BRANCH_USERS) {
        let refs: Vec<UserRef> = users.block_users(src).to_vec();
        for user in refs {
            if user.block == src {
                // Self-references relocate with the move below.
                continue;
            }
            let block = match blocks.get_mut(user.block) {
                Some(block) => block,
                None => continue,
            };
            let instruction = &mut block.instructions[user.index];
            let mut touched = false;
            match &mut instruction.op {
                Op::Phi { values } => {
                    for value in values.iter_mut() {
                        if value.block == src {
                            value.block = dest;
                            touched = true;
                        }
                    }
                }
                Op::BranchConditional { control_flow, .. } => {
                    if control_flow.continue_block == src {
                        control_flow.continue_block = dest;
                        touched = true;
                    }
                }
                _ => {}
            }
            if touched {
                instruction.source = instruction.source.modify();
                block.mark_dirty();
            }
        }
    }

    // Move the tail.
    {
        let (src_block, dest_block) = blocks
            .get_pair_mut(src, dest)
            .expect("split blocks must exist");
        for instruction in src_block.instructions.drain(split_index_phi..) {
            dest_block.push(instruction);
        }
        src_block.mark_dirty();
        dest_block.mark_dirty();
    }

    // Decompose phis that were carried over a back-edge.
    if has_back_edge_phis {
        let continue_block = blocks
            .get(dest)
            .and_then(|b| b.terminator())
            .and_then(|t| t.op.control_flow())
            .map(|cf| cf.continue_block)
            .unwrap_or(Id::INVALID);

        let phi_count = blocks.get(dest).map(|b| b.first_non_phi(0)).unwrap_or(0);
        for phi_index in 0..phi_count {
            let values: SmallVec<[PhiValue; 2]> = match &blocks.get(dest).unwrap().instructions[phi_index].op {
                Op::Phi { values } => values.clone(),
                _ => continue,
            };

            if values.len() == 2 {
                // Two dependencies resolve the immediate predecessor and the
                // back-edge; no decomposition needed.
                if let Op::Phi { values } =
                    &mut blocks.get_mut(dest).unwrap().instructions[phi_index].op
                {
                    for value in values.iter_mut() {
                        if value.block != continue_block {
                            value.block = src;
                        }
                    }
                }
                continue;
            }

            // phi_a in the predecessor resolves the forward edges.
            let mut forward: SmallVec<[PhiValue; 2]> = SmallVec::new();
            let mut back_edge = None;
            for value in values.iter() {
                if value.block == continue_block {
                    back_edge = Some(*value);
                } else {
                    forward.push(*value);
                }
            }
            let back_edge = back_edge.expect("invalid backedge migration");

            let phi_a = identifiers.alloc();
            blocks.get_mut(src).unwrap().push(Instruction::with_source(
                phi_a,
                Op::Phi { values: forward },
                SourceSpan::INVALID,
            ));

            // phi_b in the successor resolves {phi_a, back-edge}.
            let original = &mut blocks.get_mut(dest).unwrap().instructions[phi_index];
            let result = original.result;
            *original = Instruction::with_source(
                result,
                Op::Phi {
                    values: SmallVec::from_vec(vec![
                        PhiValue { value: phi_a, block: src },
                        back_edge,
                    ]),
                },
                SourceSpan::INVALID,
            );
        }
    }

    users.index(blocks);

    SplitPoint { block: dest, index: 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::Emitter;
    use crate::function::Function;
    use crate::inst::BranchControlFlow;
    use crate::program::Program;

    /// Build a loop whose header phi resolves two forward predecessors and
    /// the continue back-edge:
    /// entry -> (p1 | p2) -> header (3-edge phi) -> body -> continue ->
    /// header, with an exit edge out of the header.
    fn loop_program() -> (Program, Id, [Id; 6], Id) {
        let mut program = Program::new();
        let void = program.type_void();
        let fn_id = program.identifiers.alloc();
        let mut function = Function::new(fn_id, void);
        let entry = function.alloc_block(&mut program.identifiers);
        let p1 = function.alloc_block(&mut program.identifiers);
        let p2 = function.alloc_block(&mut program.identifiers);
        let header = function.alloc_block(&mut program.identifiers);
        let body = function.alloc_block(&mut program.identifiers);
        let continue_block = function.alloc_block(&mut program.identifiers);
        let exit = function.alloc_block(&mut program.identifiers);
        program.add_function(function);
        program.set_entry_point(fn_id);

        let zero = program.const_u32(0);
        let one_seed = program.const_u32(1);
        let truth = program.const_bool(true);
        let mut e = Emitter::new(&mut program, fn_id, entry);
        e.branch_conditional(truth, p1, p2, BranchControlFlow::selection(header));
        let mut e = Emitter::new(&mut program, fn_id, p1);
        e.branch(header);
        let mut e = Emitter::new(&mut program, fn_id, p2);
        e.branch(header);

        // Header: i = phi(p1: 0, p2: 1, continue: next); loop while i < 4.
        let uint = program.type_u32();
        let mut e = Emitter::new(&mut program, fn_id, header);
        let phi = e.phi(
            uint,
            &[
                PhiValue { value: zero, block: p1 },
                PhiValue { value: one_seed, block: p2 },
                // Patched below once `next` exists.
                PhiValue { value: zero, block: continue_block },
            ],
        );
        let four = e.u32(4);
        let cond = e.less_than(phi, four);
        e.branch_conditional(cond, body, exit, BranchControlFlow::looped(exit, continue_block));

        let mut e = Emitter::new(&mut program, fn_id, body);
        let one = e.u32(1);
        let next = e.add(phi, one);
        e.branch(continue_block);

        let mut e = Emitter::new(&mut program, fn_id, continue_block);
        e.branch(header);

        let mut e = Emitter::new(&mut program, fn_id, exit);
        e.ret_void();

        // Fix the back-edge phi operand.
        if let Some(block) = program.function_mut(fn_id).and_then(|f| f.block_mut(header)) {
            if let Op::Phi { values } = &mut block.instructions[0].op {
                values[2].value = next;
            }
            block.mark_dirty();
        }

        (program, fn_id, [entry, p1, p2, header, body, continue_block], phi)
    }

    #[test]
    fn split_redirects_successor_phis() {
        let mut program = Program::new();
        let void = program.type_void();
        let fn_id = program.identifiers.alloc();
        let mut function = Function::new(fn_id, void);
        let a = function.alloc_block(&mut program.identifiers);
        let b = function.alloc_block(&mut program.identifiers);
        program.add_function(function);
        program.set_entry_point(fn_id);

        let uint = program.type_u32();
        let seven = program.const_u32(7);
        let mut e = Emitter::new(&mut program, fn_id, a);
        let value = e.add(seven, seven);
        e.branch(b);
        let mut e = Emitter::new(&mut program, fn_id, b);
        e.phi(uint, &[PhiValue { value, block: a }]);
        e.ret_void();

        // Split before the terminator: the edge into b now comes from the
        // successor block.
        let (dest, point) = {
            let (function, identifiers) = program.function_and_identifiers_mut(fn_id).unwrap();
            let split_index = function.block(a).unwrap().len() - 1;
            let dest = function.alloc_block(identifiers);
            let point = function.split_block(
                identifiers,
                a,
                dest,
                split_index,
                SplitFlags::standard(),
            );
            (dest, point)
        };
        assert_eq!(point.block, dest);

        let function = program.function(fn_id).unwrap();
        match &function.block(b).unwrap().instructions[0].op {
            Op::Phi { values } => assert_eq!(values[0].block, dest),
            other => panic!("expected phi, found {:?}", other),
        }
    }

    #[test]
    fn back_edge_phi_decomposes_into_two_phis() {
        let (mut program, fn_id, [_, _, _, header, _, continue_block], phi) = loop_program();

        // Split the header at its phi prelude.
        let (dest, _) = {
            let (function, identifiers) = program.function_and_identifiers_mut(fn_id).unwrap();
            let dest = function.alloc_block(identifiers);
            let point = function.split_block(identifiers, header, dest, 0, SplitFlags::standard());
            (dest, point)
        };

        let function = program.function(fn_id).unwrap();

        // phi_a in the predecessor resolves the forward edges.
        let header_block = function.block(header).unwrap();
        let phi_a = header_block
            .instructions
            .iter()
            .find_map(|inst| match &inst.op {
                Op::Phi { values } => Some((inst.result, values.clone())),
                _ => None,
            })
            .expect("phi_a in predecessor");
        assert!(phi_a.1.iter().all(|v| v.block != continue_block));

        // phi_b in the successor is a two-operand phi over the predecessor
        // and the continue block, keeping the original result id.
        let dest_block = function.block(dest).unwrap();
        match &dest_block.instructions[0].op {
            Op::Phi { values } => {
                assert_eq!(values.len(), 2);
                assert_eq!(dest_block.instructions[0].result, phi);
                let blocks: Vec<Id> = values.iter().map(|v| v.block).collect();
                assert!(blocks.contains(&header));
                assert!(blocks.contains(&continue_block));
                assert!(values.iter().any(|v| v.value == phi_a.0));
            }
            other => panic!("expected decomposed phi, found {:?}", other),
        }

        // The loop back-edge was retargeted onto the new header.
        let continue_terminator = function.block(continue_block).unwrap().terminator().unwrap();
        match &continue_terminator.op {
            Op::Branch { target } => assert_eq!(*target, dest),
            other => panic!("expected branch, found {:?}", other),
        }
    }
}
