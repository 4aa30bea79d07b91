//! Shader and pipeline state tracking.

use aegis_features::{FeatureBits, InstrumentationConfig};
use aegis_ir::program::Program;
use fxhash::FxHashMap;
use std::sync::{Arc, Mutex};

/// Specialization component of the instrumentation key. Mirrors
/// `InstrumentationConfig`, hashable.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default)]
pub struct Specialization {
    pub detail: bool,
    pub safe_guard: bool,
}

impl Specialization {
    pub fn config(&self) -> InstrumentationConfig {
        InstrumentationConfig { detail: self.detail, safe_guard: self.safe_guard }
    }
}

/// Identity of one compiled variant of a source shader.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct InstrumentationKey {
    pub features: FeatureBits,
    /// Pipeline-layout compatibility hash.
    pub layout_hash: u64,
    /// Descriptor binding info of the export and shader-data slots.
    pub binding_info: u32,
    pub specialization: Specialization,
}

/// One instrumented shader binary plus its native module.
pub struct CompiledShader {
    pub words: Vec<u32>,
    pub native: u64,
}

struct ShaderStateInner {
    /// Parsed IR, populated on first instrumentation.
    module: Option<Arc<Program>>,
    /// The module failed to decode; original bytes pass through.
    unexposed_only: bool,
    instruments: FxHashMap<InstrumentationKey, Arc<CompiledShader>>,
}

/// Per-shader state: original bytecode, lazily parsed module, and the
/// instrumented variants.
pub struct ShaderState {
    pub uid: u64,
    pub guid: u64,
    pub debug_name: String,
    pub byte_code: Vec<u32>,
    /// Gates lazy parsing and instrument registration.
    state: Mutex<ShaderStateInner>,
}

impl ShaderState {
    pub fn new(uid: u64, guid: u64, debug_name: impl Into<String>, byte_code: Vec<u32>) -> ShaderState {
        ShaderState {
            uid,
            guid,
            debug_name: debug_name.into(),
            byte_code,
            state: Mutex::new(ShaderStateInner {
                module: None,
                unexposed_only: false,
                instruments: FxHashMap::default(),
            }),
        }
    }

    /// Parse once under the state mutex; later callers share the module.
    /// Returns `None` when the module cannot be decoded.
    pub fn parse_or_get(&self) -> Option<Arc<Program>> {
        let mut state = self.state.lock().unwrap();
        if state.unexposed_only {
            return None;
        }
        if let Some(module) = &state.module {
            return Some(module.clone());
        }
        match aegis_ir::codec::parse(&self.byte_code) {
            Ok(program) => {
                let program = Arc::new(program);
                state.module = Some(program.clone());
                Some(program)
            }
            Err(error) => {
                error!("shader '{}' failed to parse: {}", self.debug_name, error);
                state.unexposed_only = true;
                None
            }
        }
    }

    pub fn add_instrument(&self, key: InstrumentationKey, compiled: Arc<CompiledShader>) {
        self.state.lock().unwrap().instruments.insert(key, compiled);
    }

    pub fn instrument(&self, key: &InstrumentationKey) -> Option<Arc<CompiledShader>> {
        self.state.lock().unwrap().instruments.get(key).cloned()
    }

    pub fn instrument_count(&self) -> usize {
        self.state.lock().unwrap().instruments.len()
    }
}

/// Per-pipeline state: the layout, owned shaders, shaders referenced
/// through the library graph, and the instrumented pipeline objects.
pub struct PipelineState {
    pub uid: u64,
    pub layout_hash: u64,
    /// Shaders created with the pipeline.
    pub owned_shaders: Vec<Arc<ShaderState>>,
    /// Strong references through the library graph; keeps cascading
    /// invalidation sound.
    pub referenced_shaders: Vec<Arc<ShaderState>>,
    /// Parent libraries, by pipeline uid.
    pub library_parents: Vec<u64>,
    instrumented: Mutex<FxHashMap<InstrumentationKey, u64>>,
}

impl PipelineState {
    pub fn new(uid: u64, layout_hash: u64) -> PipelineState {
        PipelineState {
            uid,
            layout_hash,
            owned_shaders: Vec::new(),
            referenced_shaders: Vec::new(),
            library_parents: Vec::new(),
            instrumented: Mutex::new(FxHashMap::default()),
        }
    }

    /// All shaders reachable from this pipeline.
    pub fn shaders(&self) -> impl Iterator<Item = &Arc<ShaderState>> {
        self.owned_shaders.iter().chain(self.referenced_shaders.iter())
    }

    pub fn add_instrumented_object(&self, key: InstrumentationKey, native: u64) {
        self.instrumented.lock().unwrap().insert(key, native);
    }

    pub fn instrumented_object(&self, key: &InstrumentationKey) -> Option<u64> {
        self.instrumented.lock().unwrap().get(key).copied()
    }
}

/// Stable 64-bit FNV-1a over the source words, used in cache keys.
pub fn hash_words(words: &[u32]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &word in words {
        for byte in &word.to_le_bytes() {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(0x1000_0000_01b3);
        }
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_failure_is_sticky() {
        let shader = ShaderState::new(1, 1, "broken", vec![0xdead_beef, 0, 0, 0, 0]);
        assert!(shader.parse_or_get().is_none());
        assert!(shader.parse_or_get().is_none());
    }

    #[test]
    fn word_hash_is_stable_and_sensitive() {
        let a = hash_words(&[1, 2, 3]);
        let b = hash_words(&[1, 2, 3]);
        let c = hash_words(&[1, 2, 4]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
