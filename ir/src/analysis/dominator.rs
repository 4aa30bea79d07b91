//! Dominator tree over a function's control flow graph.
//!
//! Immediate dominators are computed with the iterative predecessor
//! intersection of Cooper, Harvey and Kennedy, walking fingers over
//! post-order numbers until a fixed point.

use crate::function::Function;
use crate::Id;
use fxhash::FxHashMap;

#[derive(Clone, Debug, Default)]
struct BlockInfo {
    immediate_dominator: Option<Id>,
    predecessors: Vec<Id>,
    successors: Vec<Id>,
    /// Post-order index + 1; 0 means unreachable.
    order_index: u32,
}

/// Dominators, predecessor/successor lists and the post-order traversal of
/// one function.
#[derive(Clone, Debug)]
pub struct DominatorAnalysis {
    blocks: FxHashMap<Id, BlockInfo>,
    post_order: Vec<Id>,
    entry: Id,
}

impl DominatorAnalysis {
    pub fn compute(function: &Function) -> DominatorAnalysis {
        let entry = function.entry_block().unwrap_or(Id::INVALID);

        let mut analysis = DominatorAnalysis {
            blocks: FxHashMap::default(),
            post_order: Vec::new(),
            entry,
        };

        if !entry.is_valid() {
            return analysis;
        }

        for block in function.blocks().iter() {
            analysis.blocks.insert(block.id(), BlockInfo::default());
        }

        analysis.map_blocks(function);
        analysis.blocks.get_mut(&entry).unwrap().immediate_dominator = Some(entry);

        // Intersect predecessors until nothing moves.
        loop {
            let mut mutated = false;

            for index in (0..analysis.post_order.len()).rev() {
                let id = analysis.post_order[index];
                if id == entry {
                    continue;
                }

                let predecessors = analysis.blocks[&id].predecessors.clone();
                let mut idom: Option<Id> = None;
                for pred in predecessors {
                    if analysis.blocks[&pred].immediate_dominator.is_none() {
                        continue;
                    }
                    idom = Some(match idom {
                        None => pred,
                        Some(current) => analysis.intersect(current, pred),
                    });
                }

                let info = analysis.blocks.get_mut(&id).unwrap();
                if info.immediate_dominator != idom {
                    info.immediate_dominator = idom;
                    mutated = true;
                }
            }

            if !mutated {
                break;
            }
        }

        analysis
    }

    fn intersect(&self, first: Id, second: Id) -> Id {
        let mut first = first;
        let mut second = second;
        while first != second {
            while self.blocks[&first].order_index < self.blocks[&second].order_index {
                first = self.blocks[&first].immediate_dominator.unwrap_or(self.entry);
            }
            while self.blocks[&second].order_index < self.blocks[&first].order_index {
                second = self.blocks[&second].immediate_dominator.unwrap_or(self.entry);
            }
        }
        first
    }

    /// Post-order traversal; also records edges and order indices.
    fn map_blocks(&mut self, function: &Function) {
        let mut visited: FxHashMap<Id, bool> = FxHashMap::default();
        let mut stack = vec![(self.entry, 0usize)];
        visited.insert(self.entry, true);

        // Iterative DFS keeping the successor cursor per frame.
        while let Some((block, cursor)) = stack.pop() {
            let successors = function
                .block(block)
                .and_then(|b| b.terminator())
                .map(|t| t.op.successors())
                .unwrap_or_default();

            if cursor == 0 {
                for &succ in successors.iter() {
                    self.blocks.get_mut(&succ).map(|info| info.predecessors.push(block));
                    self.blocks.get_mut(&block).map(|info| info.successors.push(succ));
                }
            }

            if cursor < successors.len() {
                stack.push((block, cursor + 1));
                let next = successors[cursor];
                if !visited.get(&next).copied().unwrap_or(false) {
                    visited.insert(next, true);
                    stack.push((next, 0));
                }
            } else {
                self.post_order.push(block);
            }
        }

        for (index, &id) in self.post_order.iter().enumerate() {
            self.blocks.get_mut(&id).unwrap().order_index = index as u32 + 1;
        }
    }

    /// True when `first` dominates `second`.
    pub fn dominates(&self, first: Id, second: Id) -> bool {
        if first == self.entry || first == second {
            return true;
        }
        let mut walk = match self.immediate_dominator(second) {
            Some(idom) => idom,
            None => return false,
        };
        while walk != first && walk != self.entry {
            walk = match self.immediate_dominator(walk) {
                Some(idom) => idom,
                None => return false,
            };
        }
        walk == first
    }

    pub fn immediate_dominator(&self, block: Id) -> Option<Id> {
        self.blocks.get(&block).and_then(|info| info.immediate_dominator)
    }

    pub fn predecessors(&self, block: Id) -> &[Id] {
        self.blocks
            .get(&block)
            .map(|info| info.predecessors.as_slice())
            .unwrap_or(&[])
    }

    pub fn successors(&self, block: Id) -> &[Id] {
        self.blocks
            .get(&block)
            .map(|info| info.successors.as_slice())
            .unwrap_or(&[])
    }

    /// Post-order over reachable blocks.
    pub fn post_order(&self) -> &[Id] {
        &self.post_order
    }

    pub fn is_reachable(&self, block: Id) -> bool {
        self.blocks
            .get(&block)
            .map(|info| info.order_index != 0)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::Emitter;
    use crate::function::Function;
    use crate::inst::BranchControlFlow;
    use crate::program::Program;

    /// entry -> (then | other) -> merge, diamond shape.
    fn diamond() -> (Program, Id) {
        let mut program = Program::new();
        let void = program.type_void();
        let fn_id = program.identifiers.alloc();
        let mut function = Function::new(fn_id, void);

        let entry = function.alloc_block(&mut program.identifiers);
        let then_block = function.alloc_block(&mut program.identifiers);
        let other_block = function.alloc_block(&mut program.identifiers);
        let merge = function.alloc_block(&mut program.identifiers);
        program.add_function(function);
        program.set_entry_point(fn_id);

        let condition = program.const_bool(true);
        let mut e = Emitter::new(&mut program, fn_id, entry);
        e.branch_conditional(condition, then_block, other_block, BranchControlFlow::selection(merge));
        let mut e = Emitter::new(&mut program, fn_id, then_block);
        e.branch(merge);
        let mut e = Emitter::new(&mut program, fn_id, other_block);
        e.branch(merge);
        let mut e = Emitter::new(&mut program, fn_id, merge);
        e.ret_void();

        (program, fn_id)
    }

    #[test]
    fn entry_dominates_all_reachable_blocks() {
        let (program, fn_id) = diamond();
        let function = program.function(fn_id).unwrap();
        let analysis = DominatorAnalysis::compute(function);
        let entry = function.entry_block().unwrap();

        for block in function.blocks().iter() {
            assert!(analysis.dominates(entry, block.id()));
            assert!(analysis.dominates(block.id(), block.id()));
        }
    }

    #[test]
    fn merge_is_dominated_by_entry_not_branches() {
        let (program, fn_id) = diamond();
        let function = program.function(fn_id).unwrap();
        let analysis = DominatorAnalysis::compute(function);

        let order = function.blocks().order().to_vec();
        let (entry, then_block, other_block, merge) = (order[0], order[1], order[2], order[3]);

        assert_eq!(analysis.immediate_dominator(merge), Some(entry));
        assert!(!analysis.dominates(then_block, merge));
        assert!(!analysis.dominates(other_block, merge));
        assert_eq!(analysis.predecessors(merge).len(), 2);
    }
}
