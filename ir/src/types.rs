//! Type model and the structural interning map.

use crate::program::IdentifierMap;
use crate::Id;
use fxhash::FxHashMap;

/// Texture dimensionality.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TextureDimension {
    Texture1D,
    Texture2D,
    Texture3D,
    Texture1DArray,
    Texture2DArray,
    Texture2DCube,
    Texture2DCubeArray,
    /// Render-pass local input, never validated.
    SubPass,
}

impl TextureDimension {
    /// Spatial dimensionality used for addressing math.
    pub fn axis_count(self) -> u32 {
        match self {
            TextureDimension::Texture1D => 1,
            TextureDimension::Texture2D
            | TextureDimension::Texture1DArray
            | TextureDimension::SubPass => 2,
            TextureDimension::Texture3D
            | TextureDimension::Texture2DArray
            | TextureDimension::Texture2DCube
            | TextureDimension::Texture2DCubeArray => 3,
        }
    }

    /// Volumetric resources mip their outer axis; sliced ones do not.
    pub fn is_volumetric(self) -> bool {
        match self {
            TextureDimension::Texture3D => true,
            _ => false,
        }
    }
}

/// Memory address space of a pointer.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum AddressSpace {
    /// Function-local storage.
    Function,
    /// Group shared storage.
    GroupShared,
    /// Resource descriptors.
    Resource,
    /// Texel data behind a resource.
    Texel,
    /// Constant data.
    Constant,
    /// Stage outputs.
    Output,
}

/// Resource sampler compatibility.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SamplerMode {
    RuntimeOnly,
    Compatible,
    Writable,
}

/// Texel storage format. Only the formats the layer itself reasons about are
/// enumerated; everything else round-trips as `Unexposed`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Format {
    None,
    R32UInt,
    R32SInt,
    R32Float,
    RG32UInt,
    RGBA32UInt,
    RGBA32Float,
    RGBA8,
    Unexposed(u32),
}

impl Format {
    /// Byte width of one texel, 0 for untyped data.
    pub fn byte_size(self) -> u32 {
        match self {
            Format::None => 0,
            Format::R32UInt | Format::R32SInt | Format::R32Float | Format::RGBA8 => 4,
            Format::RG32UInt => 8,
            Format::RGBA32UInt | Format::RGBA32Float => 16,
            Format::Unexposed(_) => 0,
        }
    }
}

/// Discriminated type variant. Aggregates reference member types by id, so
/// structural equality over `Type` values is id-wise and cheap.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum Type {
    Void,
    Bool,
    Int { bit_width: u8, signed: bool },
    Fp { bit_width: u8 },
    Vector { elem: Id, dim: u8 },
    Matrix { rows: u8, cols: u8, elem: Id },
    Array { elem: Id, count: u32 },
    Struct { members: Vec<Id> },
    Pointer { pointee: Id, space: AddressSpace },
    Buffer { elem: Id, sampler_mode: SamplerMode, texel_format: Format },
    Texture {
        dim: TextureDimension,
        elem: Id,
        sampler_mode: SamplerMode,
        texel_format: Format,
    },
    Sampler,
    Function { ret: Id, params: Vec<Id> },
    Unexposed { foreign_op: u32 },
}

impl Type {
    pub fn is_resource(&self) -> bool {
        match self {
            Type::Buffer { .. } | Type::Texture { .. } | Type::Sampler => true,
            _ => false,
        }
    }
}

/// Interning map over types. Structural equality and id equality coincide:
/// a given `Type` value maps to exactly one id for the lifetime of the
/// program. Also records the type of every SSA value.
#[derive(Clone, Debug, Default)]
pub struct TypeMap {
    lookup: FxHashMap<Type, Id>,
    types: FxHashMap<Id, Type>,
    value_types: FxHashMap<Id, Id>,
    /// Insertion order; interning is bottom-up, so dependencies precede
    /// dependents and serialization stays deterministic.
    order: Vec<Id>,
}

impl TypeMap {
    pub fn new() -> TypeMap {
        Default::default()
    }

    /// Intern a type, allocating an id on first sight.
    pub fn find_type_or_add(&mut self, identifiers: &mut IdentifierMap, ty: Type) -> Id {
        if let Some(&id) = self.lookup.get(&ty) {
            return id;
        }
        let id = identifiers.alloc();
        self.lookup.insert(ty.clone(), id);
        self.types.insert(id, ty);
        self.order.push(id);
        id
    }

    /// Intern a type under a caller-chosen id. Used by the codec, which must
    /// preserve source ids.
    pub fn add_with_id(&mut self, id: Id, ty: Type) {
        self.lookup.insert(ty.clone(), id);
        self.types.insert(id, ty);
        self.order.push(id);
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Types in insertion order.
    pub fn iter_ordered(&self) -> impl Iterator<Item = (Id, &Type)> {
        self.order
            .iter()
            .filter_map(move |id| self.types.get(id).map(|ty| (*id, ty)))
    }

    pub fn get(&self, id: Id) -> Option<&Type> {
        self.types.get(&id)
    }

    /// Record the type of an SSA value.
    pub fn set_value_type(&mut self, value: Id, ty: Id) {
        self.value_types.insert(value, ty);
    }

    /// Type id of an SSA value.
    pub fn value_type(&self, value: Id) -> Option<Id> {
        self.value_types.get(&value).copied()
    }

    /// Type of an SSA value.
    pub fn type_of_value(&self, value: Id) -> Option<&Type> {
        self.value_type(value).and_then(|id| self.get(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Id, &Type)> {
        self.types.iter().map(|(&id, ty)| (id, ty))
    }

    /// Walk through pointers and aggregates to the terminal value type.
    pub fn terminal_value_type(&self, mut id: Id) -> Option<&Type> {
        loop {
            match self.get(id)? {
                Type::Pointer { pointee, .. } => id = *pointee,
                Type::Array { elem, .. } => id = *elem,
                other => return Some(other),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::IdentifierMap;

    #[test]
    fn interning_dedupes_structurally() {
        let mut ids = IdentifierMap::new();
        let mut map = TypeMap::new();

        let a = map.find_type_or_add(&mut ids, Type::Int { bit_width: 32, signed: false });
        let b = map.find_type_or_add(&mut ids, Type::Int { bit_width: 32, signed: false });
        let c = map.find_type_or_add(&mut ids, Type::Int { bit_width: 32, signed: true });

        assert_eq!(a, b);
        assert_ne!(a, c);

        let va = map.find_type_or_add(&mut ids, Type::Vector { elem: a, dim: 4 });
        let vb = map.find_type_or_add(&mut ids, Type::Vector { elem: b, dim: 4 });
        assert_eq!(va, vb);
    }

    #[test]
    fn terminal_type_walks_pointers_and_arrays() {
        let mut ids = IdentifierMap::new();
        let mut map = TypeMap::new();

        let uint = map.find_type_or_add(&mut ids, Type::Int { bit_width: 32, signed: false });
        let buf = map.find_type_or_add(
            &mut ids,
            Type::Buffer { elem: uint, sampler_mode: SamplerMode::Writable, texel_format: Format::R32UInt },
        );
        let arr = map.find_type_or_add(&mut ids, Type::Array { elem: buf, count: 8 });
        let ptr = map.find_type_or_add(
            &mut ids,
            Type::Pointer { pointee: arr, space: AddressSpace::Resource },
        );

        match map.terminal_value_type(ptr) {
            Some(Type::Buffer { .. }) => {}
            other => panic!("unexpected terminal type {:?}", other),
        }
    }
}
