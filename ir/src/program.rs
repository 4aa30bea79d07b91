//! Programs: functions, globals, interning maps and metadata.

use crate::constant::{Constant, ConstantMap};
use crate::function::{AnalysisMap, Function};
use crate::types::{AddressSpace, Type, TypeMap};
use crate::Id;
use fxhash::{FxHashMap, FxHashSet};
use ordered_float::OrderedFloat;

/// Allocator for program-unique identifiers. 0 stays reserved invalid.
#[derive(Clone, Debug)]
pub struct IdentifierMap {
    bound: u32,
}

impl IdentifierMap {
    pub fn new() -> IdentifierMap {
        IdentifierMap { bound: 1 }
    }

    pub fn with_bound(bound: u32) -> IdentifierMap {
        IdentifierMap { bound: bound.max(1) }
    }

    pub fn alloc(&mut self) -> Id {
        let id = Id(self.bound);
        self.bound += 1;
        id
    }

    /// Exclusive upper bound of all allocated ids.
    pub fn bound(&self) -> u32 {
        self.bound
    }

    /// Grow the bound to cover an externally assigned id.
    pub fn reserve(&mut self, id: Id) {
        self.bound = self.bound.max(id.0 + 1);
    }
}

impl Default for IdentifierMap {
    fn default() -> IdentifierMap {
        IdentifierMap::new()
    }
}

/// A module-scope variable.
#[derive(Copy, Clone, Debug)]
pub struct Variable {
    pub id: Id,
    pub type_id: Id,
    pub space: AddressSpace,
    /// Binding slot for resource variables; `None` for plain storage.
    pub binding: Option<u32>,
}

/// Host-side shader data resource identifier.
pub type ShaderDataId = u32;

pub const INVALID_SHADER_DATA_ID: ShaderDataId = !0;

/// Resource-id to IR-variable mapping for shader data attached by the
/// compiler before passes run.
#[derive(Clone, Debug, Default)]
pub struct ShaderDataMap {
    entries: FxHashMap<ShaderDataId, Id>,
}

impl ShaderDataMap {
    pub fn insert(&mut self, data: ShaderDataId, variable: Id) {
        self.entries.insert(data, variable);
    }

    /// IR variable exposing a host-side shader data resource.
    pub fn get(&self, data: ShaderDataId) -> Option<Id> {
        self.entries.get(&data).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ShaderDataId, Id)> + '_ {
        self.entries.iter().map(|(&k, &v)| (k, v))
    }
}

/// Instruction-level annotations passes leave for later visits.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum MetadataType {
    /// Address chain already checked for divergent resource indexing.
    DivergentResourceIndex,
}

#[derive(Clone, Debug, Default)]
pub struct MetadataMap {
    entries: FxHashSet<(Id, MetadataType)>,
}

impl MetadataMap {
    pub fn add(&mut self, id: Id, metadata: MetadataType) {
        self.entries.insert((id, metadata));
    }

    pub fn has(&self, id: Id, metadata: MetadataType) -> bool {
        self.entries.contains(&(id, metadata))
    }
}

/// A whole program. Deep copy (`Clone`) preserves every identifier, so
/// analyses keyed on ids survive the per-job copy.
#[derive(Clone, Debug)]
pub struct Program {
    pub identifiers: IdentifierMap,
    pub types: TypeMap,
    pub constants: ConstantMap,
    functions: Vec<Function>,
    function_index: FxHashMap<Id, usize>,
    pub variables: Vec<Variable>,
    pub shader_data: ShaderDataMap,
    pub metadata: MetadataMap,
    entry_point: Id,
    /// Program-level analyses (interprocedural simulation, pass-shared
    /// maps). Unlike the per-function maps this is not invalidated by block
    /// mutation; entries keyed on result ids survive splits.
    pub analysis: AnalysisMap,
    /// Original module words, kept for block-level byte reuse when stitching.
    pub source_words: Vec<u32>,
    /// Foreign preamble records carried for the round trip.
    pub preamble_unexposed: Vec<(u32, Vec<u32>)>,
    /// (types, constants, variables) counts at parse time; a mismatch forces
    /// re-serialization.
    pub parsed_counts: Option<(usize, usize, usize)>,
}

impl Program {
    pub fn new() -> Program {
        Program {
            identifiers: IdentifierMap::new(),
            types: TypeMap::new(),
            constants: ConstantMap::new(),
            functions: Vec::new(),
            function_index: FxHashMap::default(),
            variables: Vec::new(),
            shader_data: ShaderDataMap::default(),
            metadata: MetadataMap::default(),
            entry_point: Id::INVALID,
            analysis: AnalysisMap::default(),
            source_words: Vec::new(),
            preamble_unexposed: Vec::new(),
            parsed_counts: None,
        }
    }

    pub fn entry_point(&self) -> Id {
        self.entry_point
    }

    pub fn set_entry_point(&mut self, function: Id) {
        self.entry_point = function;
    }

    pub fn add_function(&mut self, function: Function) {
        self.function_index.insert(function.id(), self.functions.len());
        self.functions.push(function);
    }

    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    pub fn functions_mut(&mut self) -> &mut [Function] {
        &mut self.functions
    }

    pub fn function(&self, id: Id) -> Option<&Function> {
        self.function_index.get(&id).map(|&i| &self.functions[i])
    }

    pub fn function_mut(&mut self, id: Id) -> Option<&mut Function> {
        let index = *self.function_index.get(&id)?;
        Some(&mut self.functions[index])
    }

    /// Split borrow for block surgery: the function plus the identifier
    /// allocator.
    pub fn function_and_identifiers_mut(
        &mut self,
        id: Id,
    ) -> Option<(&mut Function, &mut IdentifierMap)> {
        let index = *self.function_index.get(&id)?;
        Some((&mut self.functions[index], &mut self.identifiers))
    }

    pub fn entry_function(&self) -> Option<&Function> {
        self.function(self.entry_point)
    }

    pub fn add_variable(&mut self, type_id: Id, space: AddressSpace, binding: Option<u32>) -> Id {
        let id = self.identifiers.alloc();
        self.variables.push(Variable { id, type_id, space, binding });
        self.types.set_value_type(id, type_id);
        id
    }

    pub fn variable(&self, id: Id) -> Option<&Variable> {
        self.variables.iter().find(|v| v.id == id)
    }

    // ---------------------------------------------------------------------
    // Interning sugar

    pub fn type_void(&mut self) -> Id {
        self.types.find_type_or_add(&mut self.identifiers, Type::Void)
    }

    pub fn type_bool(&mut self) -> Id {
        self.types.find_type_or_add(&mut self.identifiers, Type::Bool)
    }

    pub fn type_u32(&mut self) -> Id {
        self.types
            .find_type_or_add(&mut self.identifiers, Type::Int { bit_width: 32, signed: false })
    }

    pub fn type_i32(&mut self) -> Id {
        self.types
            .find_type_or_add(&mut self.identifiers, Type::Int { bit_width: 32, signed: true })
    }

    pub fn type_f32(&mut self) -> Id {
        self.types.find_type_or_add(&mut self.identifiers, Type::Fp { bit_width: 32 })
    }

    pub fn type_vector(&mut self, elem: Id, dim: u8) -> Id {
        self.types
            .find_type_or_add(&mut self.identifiers, Type::Vector { elem, dim })
    }

    pub fn add_type(&mut self, ty: Type) -> Id {
        self.types.find_type_or_add(&mut self.identifiers, ty)
    }

    pub fn const_u32(&mut self, value: u32) -> Id {
        let ty = self.type_u32();
        self.constants
            .find_constant_or_add(&mut self.identifiers, ty, Constant::Int(value as i64))
    }

    pub fn const_i32(&mut self, value: i32) -> Id {
        let ty = self.type_i32();
        self.constants
            .find_constant_or_add(&mut self.identifiers, ty, Constant::Int(value as i64))
    }

    pub fn const_f32(&mut self, value: f32) -> Id {
        let ty = self.type_f32();
        self.constants
            .find_constant_or_add(&mut self.identifiers, ty, Constant::Fp(OrderedFloat(value as f64)))
    }

    pub fn const_bool(&mut self, value: bool) -> Id {
        let ty = self.type_bool();
        self.constants
            .find_constant_or_add(&mut self.identifiers, ty, Constant::Bool(value))
    }

    /// Null constant of an arbitrary type.
    pub fn const_null(&mut self, ty: Id) -> Id {
        let Program { identifiers, types, constants, .. } = self;
        constants.null_of(identifiers, types, ty)
    }
}

impl Default for Program {
    fn default() -> Program {
        Program::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_preserves_identifiers() {
        let mut program = Program::new();
        let c = program.const_u32(7);
        let copy = program.clone();
        assert_eq!(copy.constants.u32_value(c), Some(7));
        assert_eq!(copy.identifiers.bound(), program.identifiers.bound());
    }
}
