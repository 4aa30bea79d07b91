//! The shader compiler: a fixed worker pool consuming parse-then-instrument
//! jobs from a condition-variable queue, with commit/complete counters for
//! bulk completion observation.

use crate::device::{shader_data_binding, DeviceBackend};
use crate::shader::{hash_words, CompiledShader, InstrumentationKey, ShaderState};
use aegis_export::sguid::SguidHost;
use aegis_export::shader_data::ShaderDataId;
use aegis_features::{dependency_order, Feature, PassContext};
use aegis_ir::program::Program;
use aegis_ir::types::{AddressSpace, Format, SamplerMode, Type};
use fxhash::FxHashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

/// Logic-version component of the cache key; bump when pass output changes.
const FEATURE_LOGIC_VERSION: u64 = 3;

/// Per-batch diagnostics.
#[derive(Default)]
pub struct CompilerDiagnostic {
    pub passed_jobs: AtomicU64,
    pub failed_jobs: AtomicU64,
}

/// One queued instrumentation job.
pub struct ShaderJob {
    pub shader: Arc<ShaderState>,
    pub key: InstrumentationKey,
    pub diagnostic: Arc<CompilerDiagnostic>,
}

struct QueueState {
    jobs: VecDeque<ShaderJob>,
    thread_exit: bool,
}

struct CompilerShared {
    queue: Mutex<QueueState>,
    thread_var: Condvar,
    commit_index: AtomicU64,
    complete_counter: AtomicU64,
    /// Publication barrier: grabbed-and-released before the completion head
    /// advances, so per-job writes are visible to completion waiters.
    job_completion_step_lock: Mutex<()>,
    completion_lock: Mutex<()>,
    completion_var: Condvar,
    features: Vec<Arc<dyn Feature>>,
    sguid: Arc<SguidHost>,
    backend: Arc<dyn DeviceBackend>,
    ring_data: ShaderDataId,
    ring_limit_words: u32,
    /// Keyed by (feature version uid, source hash).
    cache: Mutex<FxHashMap<(u64, u64), Arc<Vec<u32>>>>,
}

pub struct ShaderCompiler {
    shared: Arc<CompilerShared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ShaderCompiler {
    pub fn new(
        worker_count: usize,
        features: Vec<Arc<dyn Feature>>,
        sguid: Arc<SguidHost>,
        backend: Arc<dyn DeviceBackend>,
        ring_data: ShaderDataId,
        ring_limit_words: u32,
    ) -> ShaderCompiler {
        let shared = Arc::new(CompilerShared {
            queue: Mutex::new(QueueState { jobs: VecDeque::new(), thread_exit: false }),
            thread_var: Condvar::new(),
            commit_index: AtomicU64::new(0),
            complete_counter: AtomicU64::new(0),
            job_completion_step_lock: Mutex::new(()),
            completion_lock: Mutex::new(()),
            completion_var: Condvar::new(),
            features,
            sguid,
            backend,
            ring_data,
            ring_limit_words,
            cache: Mutex::new(FxHashMap::default()),
        });

        let worker_count = worker_count.max(1);
        info!("starting {} shader compiler workers", worker_count);

        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let shared = shared.clone();
            workers.push(thread::spawn(move || worker_entry(shared)));
        }

        ShaderCompiler { shared, workers: Mutex::new(workers) }
    }

    /// Queue jobs; advances and returns the commit index.
    pub fn push(&self, jobs: Vec<ShaderJob>) -> u64 {
        let commit = self
            .shared
            .commit_index
            .fetch_add(jobs.len() as u64, Ordering::SeqCst)
            + jobs.len() as u64;

        let mut queue = self.shared.queue.lock().unwrap();
        for job in jobs {
            queue.jobs.push_back(job);
            self.shared.thread_var.notify_all();
        }
        commit
    }

    /// Whether a commit was handed to the queue.
    pub fn is_commit_pushed(&self, commit: u64) -> bool {
        commit <= self.shared.commit_index.load(Ordering::SeqCst)
    }

    pub fn commit_index(&self) -> u64 {
        self.shared.commit_index.load(Ordering::SeqCst)
    }

    /// Monotonic, non-decreasing completion head.
    pub fn complete_counter(&self) -> u64 {
        self.shared.complete_counter.load(Ordering::SeqCst)
    }

    pub fn is_complete(&self, commit: u64) -> bool {
        self.complete_counter() >= commit
    }

    /// Block until the completion head reaches `commit`.
    pub fn wait_for_completion(&self, commit: u64) {
        let mut guard = self.shared.completion_lock.lock().unwrap();
        while self.shared.complete_counter.load(Ordering::SeqCst) < commit {
            guard = self.shared.completion_var.wait(guard).unwrap();
        }
    }

    /// Poison the queue and join the workers. Workers finish their current
    /// job.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.thread_exit = true;
            self.shared.thread_var.notify_all();
        }
        let mut workers = self.workers.lock().unwrap();
        for worker in workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_entry(shared: Arc<CompilerShared>) {
    loop {
        let job = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break Some(job);
                }
                if queue.thread_exit {
                    break None;
                }
                queue = shared.thread_var.wait(queue).unwrap();
            }
        };

        let job = match job {
            Some(job) => job,
            None => return,
        };

        compile(&shared, &job);

        // Publication barrier, then advance the head as a separate step.
        {
            let _step = shared.job_completion_step_lock.lock().unwrap();
        }
        {
            let _guard = shared.completion_lock.lock().unwrap();
            shared.complete_counter.fetch_add(1, Ordering::SeqCst);
        }
        shared.completion_var.notify_all();
    }
}

/// Version uid of the active feature logic, part of the cache key.
fn feature_version_uid(key: &InstrumentationKey) -> u64 {
    let mut uid = FEATURE_LOGIC_VERSION;
    uid = uid.wrapping_mul(0x9e37_79b9_7f4a_7c15) ^ key.features.bits() as u64;
    uid = uid.wrapping_mul(0x9e37_79b9_7f4a_7c15)
        ^ ((key.specialization.detail as u64) << 1 | key.specialization.safe_guard as u64);
    uid
}

/// Attach one shader-data variable per data resource the active features
/// need, plus the export ring.
fn attach_shader_data(program: &mut Program, ring_data: ShaderDataId, data_ids: &[ShaderDataId]) {
    let uint = program.type_u32();
    let buffer_type = program.add_type(Type::Buffer {
        elem: uint,
        sampler_mode: SamplerMode::Writable,
        texel_format: Format::R32UInt,
    });

    let mut attach = |program: &mut Program, data: ShaderDataId| {
        if program.shader_data.get(data).is_some() {
            return;
        }
        let variable = program.add_variable(
            buffer_type,
            AddressSpace::Resource,
            Some(shader_data_binding(data)),
        );
        program.shader_data.insert(data, variable);
    };

    attach(program, ring_data);
    for &data in data_ids {
        attach(program, data);
    }
}

fn compile(shared: &CompilerShared, job: &ShaderJob) {
    let source_hash = hash_words(&job.shader.byte_code);
    let cache_key = (feature_version_uid(&job.key), source_hash);

    // Cache first: skip the whole IR pipeline on a hit.
    let cached = shared.cache.lock().unwrap().get(&cache_key).cloned();
    let words = match cached {
        Some(words) => {
            debug!("cache hit for shader '{}'", job.shader.debug_name);
            words
        }
        None => {
            let words = instrument(shared, job);
            shared.cache.lock().unwrap().insert(cache_key, words.clone());
            words
        }
    };

    // Native module creation and registration under the instrument map.
    let native = shared.backend.create_shader_module(&words).unwrap_or(0);
    job.shader.add_instrument(
        job.key,
        Arc::new(CompiledShader { words: words.as_ref().clone(), native }),
    );
    job.diagnostic.passed_jobs.fetch_add(1, Ordering::Relaxed);
}

/// The per-job IR pipeline: parse once, copy, attach shader data, run the
/// passes in dependency order, stitch. Failures preserve the original
/// binary.
fn instrument(shared: &CompilerShared, job: &ShaderJob) -> Arc<Vec<u32>> {
    let module = match job.shader.parse_or_get() {
        Some(module) => module,
        None => {
            // Undecodable: the original binary passes through unmodified.
            job.diagnostic.failed_jobs.fetch_add(1, Ordering::Relaxed);
            return Arc::new(job.shader.byte_code.clone());
        }
    };

    // Passes mutate freely on the job's own copy.
    let mut program = (*module).clone();

    let ordered = dependency_order(&shared.features, job.key.features);

    // No active passes: leave the module untouched so stitching reuses the
    // source bytes verbatim.
    if ordered.is_empty() {
        return Arc::new(aegis_ir::codec::stitch(&program));
    }

    let mut data_ids = Vec::new();
    for feature in &ordered {
        data_ids.extend(feature.shader_data());
    }
    attach_shader_data(&mut program, shared.ring_data, &data_ids);

    let ctx = PassContext {
        config: job.key.specialization.config(),
        shader_guid: job.shader.guid,
        sguid: &shared.sguid,
        ring_data: shared.ring_data,
        ring_limit_words: shared.ring_limit_words,
    };

    for feature in &ordered {
        feature.pre_inject(&mut program, &ctx);
    }
    for feature in &ordered {
        feature.inject(&mut program, &ctx);
    }

    debug!(
        "instrumented shader '{}' with {:?}",
        job.shader.debug_name, job.key.features
    );

    Arc::new(aegis_ir::codec::stitch(&program))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::CpuDevice;
    use crate::shader::Specialization;
    use aegis_features::FeatureBits;

    fn empty_shader_words() -> Vec<u32> {
        use aegis_ir::emitter::Emitter;
        use aegis_ir::function::Function;

        let mut program = Program::new();
        let void = program.type_void();
        let fn_id = program.identifiers.alloc();
        let mut function = Function::new(fn_id, void);
        let entry = function.alloc_block(&mut program.identifiers);
        program.add_function(function);
        program.set_entry_point(fn_id);
        let mut e = Emitter::new(&mut program, fn_id, entry);
        e.ret_void();
        aegis_ir::codec::stitch(&program)
    }

    fn test_compiler(worker_count: usize) -> ShaderCompiler {
        let backend = Arc::new(CpuDevice::new(4));
        ShaderCompiler::new(
            worker_count,
            Vec::new(),
            Arc::new(SguidHost::new()),
            backend,
            0,
            256,
        )
    }

    #[test]
    fn completion_head_is_monotonic() {
        let compiler = test_compiler(2);
        let shader = Arc::new(ShaderState::new(1, 1, "noop", empty_shader_words()));

        let key = InstrumentationKey {
            features: FeatureBits::empty(),
            layout_hash: 0,
            binding_info: 0,
            specialization: Specialization::default(),
        };

        let mut commits = Vec::new();
        for _ in 0..8 {
            let commit = compiler.push(vec![ShaderJob {
                shader: shader.clone(),
                key,
                diagnostic: Arc::new(CompilerDiagnostic::default()),
            }]);
            commits.push(commit);
        }

        assert!(commits.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(compiler.is_commit_pushed(8));
        compiler.wait_for_completion(8);
        assert_eq!(compiler.complete_counter(), 8);

        compiler.shutdown();
    }

    #[test]
    fn no_features_is_byte_identical() {
        let compiler = test_compiler(1);
        let words = empty_shader_words();
        let shader = Arc::new(ShaderState::new(1, 1, "noop", words.clone()));

        let key = InstrumentationKey {
            features: FeatureBits::empty(),
            layout_hash: 0,
            binding_info: 0,
            specialization: Specialization::default(),
        };
        let commit = compiler.push(vec![ShaderJob {
            shader: shader.clone(),
            key,
            diagnostic: Arc::new(CompilerDiagnostic::default()),
        }]);
        compiler.wait_for_completion(commit);

        let compiled = shader.instrument(&key).expect("compiled variant");
        assert_eq!(compiled.words, words);

        compiler.shutdown();
    }

    #[test]
    fn parse_failure_passes_original_through() {
        let compiler = test_compiler(1);
        let words = vec![0x0bad_0bad, 1, 2, 3, 4];
        let shader = Arc::new(ShaderState::new(2, 2, "garbage", words.clone()));

        let key = InstrumentationKey {
            features: FeatureBits::empty(),
            layout_hash: 0,
            binding_info: 0,
            specialization: Specialization::default(),
        };
        let diagnostic = Arc::new(CompilerDiagnostic::default());
        let commit = compiler.push(vec![ShaderJob {
            shader: shader.clone(),
            key,
            diagnostic: diagnostic.clone(),
        }]);
        compiler.wait_for_completion(commit);

        let compiled = shader.instrument(&key).expect("passthrough variant");
        assert_eq!(compiled.words, words);
        assert_eq!(diagnostic.failed_jobs.load(Ordering::Relaxed), 1);

        compiler.shutdown();
    }
}
