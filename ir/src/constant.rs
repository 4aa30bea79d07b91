//! Constant model and the (type, payload) interning map.

use crate::program::IdentifierMap;
use crate::types::{Type, TypeMap};
use crate::Id;
use fxhash::FxHashMap;
use ordered_float::OrderedFloat;

/// Constant payload. Floating point payloads are keyed through
/// `OrderedFloat` so that NaN patterns intern consistently.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum Constant {
    Bool(bool),
    Int(i64),
    Fp(OrderedFloat<f64>),
    Vector(Vec<Id>),
    Struct(Vec<Id>),
    Array(Vec<Id>),
    Null,
    Undef,
    Unexposed,
}

/// Interning map over constants, keyed by (type id, payload).
#[derive(Clone, Debug, Default)]
pub struct ConstantMap {
    lookup: FxHashMap<(Id, Constant), Id>,
    constants: FxHashMap<Id, (Id, Constant)>,
    /// Insertion order, for deterministic serialization.
    order: Vec<Id>,
}

impl ConstantMap {
    pub fn new() -> ConstantMap {
        Default::default()
    }

    /// Intern a constant, allocating an id on first sight.
    pub fn find_constant_or_add(
        &mut self,
        identifiers: &mut IdentifierMap,
        ty: Id,
        value: Constant,
    ) -> Id {
        let key = (ty, value);
        if let Some(&id) = self.lookup.get(&key) {
            return id;
        }
        let id = identifiers.alloc();
        self.lookup.insert(key.clone(), id);
        self.constants.insert(id, key);
        self.order.push(id);
        id
    }

    /// Intern a constant under a caller-chosen id. Used by the codec.
    pub fn add_with_id(&mut self, id: Id, ty: Id, value: Constant) {
        self.lookup.insert((ty, value.clone()), id);
        self.constants.insert(id, (ty, value));
        self.order.push(id);
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Constants in insertion order.
    pub fn iter_ordered(&self) -> impl Iterator<Item = (Id, Id, &Constant)> {
        self.order
            .iter()
            .filter_map(move |id| self.constants.get(id).map(|(ty, c)| (*id, *ty, c)))
    }

    pub fn get(&self, id: Id) -> Option<&Constant> {
        self.constants.get(&id).map(|(_, c)| c)
    }

    pub fn type_of(&self, id: Id) -> Option<Id> {
        self.constants.get(&id).map(|(ty, _)| *ty)
    }

    pub fn is_constant(&self, id: Id) -> bool {
        self.constants.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Id, Id, &Constant)> {
        self.constants.iter().map(|(&id, (ty, c))| (id, *ty, c))
    }

    /// Unsigned value of an integer constant, if it is one.
    pub fn u32_value(&self, id: Id) -> Option<u32> {
        match self.get(id)? {
            Constant::Int(v) => Some(*v as u32),
            _ => None,
        }
    }

    /// The zero-filled constant of a type. Scalars fold to their literal
    /// zero; aggregates intern as `Null`.
    pub fn null_of(
        &mut self,
        identifiers: &mut IdentifierMap,
        types: &TypeMap,
        ty: Id,
    ) -> Id {
        let value = match types.get(ty) {
            Some(Type::Bool) => Constant::Bool(false),
            Some(Type::Int { .. }) => Constant::Int(0),
            Some(Type::Fp { .. }) => Constant::Fp(OrderedFloat(0.0)),
            _ => Constant::Null,
        };
        self.find_constant_or_add(identifiers, ty, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::IdentifierMap;
    use crate::types::TypeMap;

    #[test]
    fn interning_keys_on_type_and_payload() {
        let mut ids = IdentifierMap::new();
        let mut types = TypeMap::new();
        let mut constants = ConstantMap::new();

        let uint = types.find_type_or_add(&mut ids, Type::Int { bit_width: 32, signed: false });
        let sint = types.find_type_or_add(&mut ids, Type::Int { bit_width: 32, signed: true });

        let a = constants.find_constant_or_add(&mut ids, uint, Constant::Int(4));
        let b = constants.find_constant_or_add(&mut ids, uint, Constant::Int(4));
        let c = constants.find_constant_or_add(&mut ids, sint, Constant::Int(4));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(constants.u32_value(a), Some(4));
    }

    #[test]
    fn nan_payloads_intern() {
        let mut ids = IdentifierMap::new();
        let mut types = TypeMap::new();
        let mut constants = ConstantMap::new();

        let fp = types.find_type_or_add(&mut ids, Type::Fp { bit_width: 32 });
        let a = constants.find_constant_or_add(&mut ids, fp, Constant::Fp(OrderedFloat(std::f64::NAN)));
        let b = constants.find_constant_or_add(&mut ids, fp, Constant::Fp(OrderedFloat(std::f64::NAN)));
        assert_eq!(a, b);
    }
}
