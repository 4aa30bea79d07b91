//! Functions: block list, signature, user map and cached analyses.

use crate::block::{
    split_block, BasicBlock, BasicBlockList, SplitFlags, SplitPoint, UserMap,
};
use crate::program::IdentifierMap;
use crate::Id;
use fxhash::FxHashMap;
use std::any::{Any, TypeId};
use std::sync::Arc;

bitflags! {
    pub struct FunctionFlags: u32 {
        /// Entry point of the program.
        const ENTRY_POINT = 0x1;
    }
}

/// Analyses cached on a function, keyed by analysis type. Mutating the block
/// list invalidates the map.
#[derive(Clone, Default)]
pub struct AnalysisMap {
    entries: FxHashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    revision: u64,
}

impl std::fmt::Debug for AnalysisMap {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("AnalysisMap")
            .field("entries", &self.entries.len())
            .field("revision", &self.revision)
            .finish()
    }
}

impl AnalysisMap {
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.entries
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|any| any.downcast::<T>().ok())
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, analysis: T) -> Arc<T> {
        let arc = Arc::new(analysis);
        self.entries.insert(TypeId::of::<T>(), arc.clone());
        arc
    }

    pub fn invalidate(&mut self) {
        self.entries.clear();
        self.revision += 1;
    }

    /// Bumped on every invalidation; analyses snapshot it to detect staleness.
    pub fn revision(&self) -> u64 {
        self.revision
    }
}

/// A function: ordered basic blocks (first is the entry), a typed signature
/// and the per-function user map.
#[derive(Clone, Debug)]
pub struct Function {
    id: Id,
    pub type_id: Id,
    pub parameters: Vec<Id>,
    pub flags: FunctionFlags,
    blocks: BasicBlockList,
    users: UserMap,
    users_dirty: bool,
    analysis: AnalysisMap,
}

impl Function {
    pub fn new(id: Id, type_id: Id) -> Function {
        Function {
            id,
            type_id,
            parameters: Vec::new(),
            flags: FunctionFlags::empty(),
            blocks: BasicBlockList::new(),
            users: UserMap::default(),
            users_dirty: true,
            analysis: AnalysisMap::default(),
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn blocks(&self) -> &BasicBlockList {
        &self.blocks
    }

    /// Mutable block access invalidates cached analyses.
    pub fn blocks_mut(&mut self) -> &mut BasicBlockList {
        self.users_dirty = true;
        self.analysis.invalidate();
        &mut self.blocks
    }

    pub fn entry_block(&self) -> Option<Id> {
        self.blocks.entry()
    }

    pub fn block(&self, id: Id) -> Option<&BasicBlock> {
        self.blocks.get(id)
    }

    pub fn block_mut(&mut self, id: Id) -> Option<&mut BasicBlock> {
        self.users_dirty = true;
        self.blocks.get_mut(id)
    }

    pub fn alloc_block(&mut self, identifiers: &mut IdentifierMap) -> Id {
        self.users_dirty = true;
        self.analysis.invalidate();
        self.blocks.alloc_block(identifiers)
    }

    /// Rebuild the user map.
    pub fn index_users(&mut self) {
        self.users.index(&self.blocks);
        self.users_dirty = false;
    }

    pub fn users(&mut self) -> &UserMap {
        if self.users_dirty {
            self.index_users();
        }
        &self.users
    }

    /// Split `src` at `split_index` into the pre-allocated empty `dest`.
    pub fn split_block(
        &mut self,
        identifiers: &mut IdentifierMap,
        src: Id,
        dest: Id,
        split_index: usize,
        flags: SplitFlags,
    ) -> SplitPoint {
        if self.users_dirty {
            self.users.index(&self.blocks);
        }
        self.analysis.invalidate();
        let point = split_block(
            &mut self.blocks,
            &mut self.users,
            identifiers,
            src,
            dest,
            split_index,
            flags,
        );
        self.users_dirty = false;
        point
    }

    pub fn analysis(&self) -> &AnalysisMap {
        &self.analysis
    }

    pub fn analysis_mut(&mut self) -> &mut AnalysisMap {
        &mut self.analysis
    }
}
