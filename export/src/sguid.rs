//! Shader source GUIDs: stable identifiers for source-level locations,
//! bound during injection and resolved back during report filtering.

use fxhash::FxHashMap;
use std::sync::Mutex;

pub type Sguid = u32;

pub const INVALID_SGUID: Sguid = !0;

/// A fully resolved source location.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default)]
pub struct SourceMapping {
    pub shader_guid: u64,
    pub file_uid: u32,
    pub line: u32,
    pub column: u32,
    pub basic_block: u32,
    pub instruction_index: u32,
}

/// Allocates SGUIDs for source mappings and answers the reverse lookup.
#[derive(Debug, Default)]
pub struct SguidHost {
    inner: Mutex<SguidHostInner>,
}

#[derive(Debug, Default)]
struct SguidHostInner {
    lookup: FxHashMap<SourceMapping, Sguid>,
    reverse: Vec<SourceMapping>,
}

impl SguidHost {
    pub fn new() -> SguidHost {
        Default::default()
    }

    /// Bind a mapping, allocating an SGUID on first sight.
    pub fn bind(&self, mapping: SourceMapping) -> Sguid {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&sguid) = inner.lookup.get(&mapping) {
            return sguid;
        }
        let sguid = inner.reverse.len() as Sguid;
        inner.lookup.insert(mapping, sguid);
        inner.reverse.push(mapping);
        sguid
    }

    pub fn mapping_of(&self, sguid: Sguid) -> Option<SourceMapping> {
        self.inner.lock().unwrap().reverse.get(sguid as usize).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_is_stable() {
        let host = SguidHost::new();
        let mapping = SourceMapping { line: 12, column: 4, ..Default::default() };
        let a = host.bind(mapping);
        let b = host.bind(mapping);
        assert_eq!(a, b);
        assert_eq!(host.mapping_of(a), Some(mapping));
        assert_eq!(host.mapping_of(999), None);
    }
}
