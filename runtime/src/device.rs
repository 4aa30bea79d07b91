//! The per-device service registry and the CPU device backend.
//!
//! Service lifetime is strictly ordered: backend, then export/SGUID hosts
//! and the scheduler, then feature install, then compiler workers. Teardown
//! reverses it: compiler shutdown (poison + join), feature deactivation,
//! registry drop.

use crate::compiler::{CompilerDiagnostic, ShaderCompiler, ShaderJob};
use crate::report::ReportRegistry;
use crate::scheduler::SchedulerService;
use crate::settings::LayerSettings;
use crate::shader::{hash_words, InstrumentationKey, ShaderState};
use aegis_addressing::allocator::ResourceTexelInfo;
use aegis_addressing::token::{pack_token, Prmt, ResourceTokenType};
use aegis_export::commands::{Command, CommandBuffer, ShaderProgramHost, ShaderProgramId};
use aegis_export::scheduler::Queue;
use aegis_export::shader_data::{ShaderDataBufferInfo, ShaderDataHost, ShaderDataId};
use aegis_export::stream::{drain_ring, DrainStats, ExportHost, MAX_RECORD_WORDS};
use aegis_export::sguid::SguidHost;
use aegis_features::{
    Feature, FeatureBits, FeatureHooks, InstallContext, ResourceInfo, SubmissionContext,
};
use aegis_ir::exec::{Dispatcher, Resource, ResourceDesc, ResourcePool};
use aegis_ir::program::Program;
use fxhash::FxHashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Binding namespace of shader-data variables attached by the compiler; the
/// low bits carry the shader data id.
pub const SHADER_DATA_BINDING_FLAG: u32 = 0x8000_0000;

pub fn shader_data_binding(data: ShaderDataId) -> u32 {
    SHADER_DATA_BINDING_FLAG | data
}

// ---------------------------------------------------------------------------
// CPU device backend

/// Native submission interface the scheduler and compiler sit on.
pub trait DeviceBackend: Send + Sync {
    /// Create a native shader module from stitched words. Returns a module
    /// handle.
    fn create_shader_module(&self, words: &[u32]) -> Option<u64>;

    /// Record and execute a command buffer; returns its fence.
    fn commit(&self, queue: Queue, buffer: &CommandBuffer) -> u64;

    fn fence_complete(&self, fence: u64) -> bool;

    fn wait_fence(&self, fence: u64);
}

#[derive(Default)]
struct CpuDeviceInner {
    shader_data: FxHashMap<ShaderDataId, Vec<u32>>,
    next_shader_data: ShaderDataId,
    programs: FxHashMap<ShaderProgramId, Arc<Program>>,
    next_program: ShaderProgramId,
    modules: FxHashMap<u64, Arc<Program>>,
    next_module: u64,
    app_resources: Vec<Resource>,
    fence_counter: u64,
    /// Bound program/descriptors while committing.
    bound_program: Option<Arc<Program>>,
    bound_descriptors: FxHashMap<u32, ShaderDataId>,
    event_data: u32,
}

/// CPU device: shader data buffers, layer programs and application
/// resources all live in host memory; dispatches run on the IR executor.
/// Work completes synchronously, so fences signal at submission.
pub struct CpuDevice {
    inner: Mutex<CpuDeviceInner>,
    wave_size: u32,
}

impl CpuDevice {
    pub fn new(wave_size: u32) -> CpuDevice {
        CpuDevice { inner: Mutex::new(CpuDeviceInner::default()), wave_size: wave_size.max(1) }
    }

    pub fn wave_size(&self) -> u32 {
        self.wave_size
    }

    /// Register an application resource; returns its handle.
    pub fn add_app_resource(&self, resource: Resource) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        inner.app_resources.push(resource);
        (inner.app_resources.len() - 1) as u32
    }

    pub fn read_app_resource(&self, handle: u32) -> Vec<u32> {
        self.inner.lock().unwrap().app_resources[handle as usize].words.clone()
    }

    pub fn write_app_resource(&self, handle: u32, words: &[u32]) {
        let mut inner = self.inner.lock().unwrap();
        let target = &mut inner.app_resources[handle as usize].words;
        let len = target.len().min(words.len());
        target[..len].copy_from_slice(&words[..len]);
    }

    pub fn module_program(&self, module: u64) -> Option<Arc<Program>> {
        self.inner.lock().unwrap().modules.get(&module).cloned()
    }

    /// Execute one application dispatch of a created module against bound
    /// descriptors. Shader-data variables resolve through their flagged
    /// binding namespace automatically.
    pub fn dispatch_app(
        &self,
        module: u64,
        descriptor_bindings: &FxHashMap<u32, u32>,
        thread_count: u32,
    ) -> aegis_ir::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;

        let program = inner
            .modules
            .get(&module)
            .cloned()
            .ok_or(aegis_ir::Error::Malformed("unknown shader module"))?;

        // Assemble the pool: application resources first (handles are
        // stable indices), then the shader data buffers the program uses.
        let mut pool = ResourcePool::new();
        let app_count = inner.app_resources.len();
        for resource in inner.app_resources.drain(..) {
            pool.add(resource);
        }

        let mut bindings: FxHashMap<u32, u32> = descriptor_bindings.clone();
        let mut staged: Vec<(ShaderDataId, u32)> = Vec::new();
        for (data, _) in program.shader_data.iter() {
            if let Some(words) = inner.shader_data.get(&data) {
                let handle = pool.add(Resource {
                    desc: ResourceDesc {
                        element_count: words.len() as u32,
                        ..Default::default()
                    },
                    words: words.clone(),
                });
                bindings.insert(shader_data_binding(data), handle);
                staged.push((data, handle));
            }
        }

        let result = Dispatcher::new(&program, &mut pool, &bindings, self.wave_size)
            .dispatch(thread_count);

        // Write everything back, pass or fail.
        for index in 0..app_count {
            if let Some(resource) = pool.get(index as u32) {
                inner.app_resources.push(resource.clone());
            }
        }
        for (data, handle) in staged {
            if let Some(resource) = pool.get(handle) {
                inner.shader_data.insert(data, resource.words.clone());
            }
        }

        result
    }

    /// Host access to a shader data buffer under the device lock.
    pub fn with_shader_data<R>(
        &self,
        data: ShaderDataId,
        f: impl FnOnce(&mut Vec<u32>) -> R,
    ) -> Option<R> {
        let mut inner = self.inner.lock().unwrap();
        inner.shader_data.get_mut(&data).map(f)
    }
}

impl ShaderDataHost for CpuDevice {
    fn create_buffer(&self, info: ShaderDataBufferInfo) -> ShaderDataId {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_shader_data;
        inner.next_shader_data += 1;
        inner.shader_data.insert(id, vec![0u32; info.element_count as usize]);
        id
    }

    fn destroy_buffer(&self, id: ShaderDataId) {
        self.inner.lock().unwrap().shader_data.remove(&id);
    }

    fn read_buffer(&self, id: ShaderDataId) -> Vec<u32> {
        self.inner
            .lock()
            .unwrap()
            .shader_data
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }
}

impl ShaderProgramHost for CpuDevice {
    fn register(&self, program: Program) -> ShaderProgramId {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_program;
        inner.next_program += 1;
        inner.programs.insert(id, Arc::new(program));
        id
    }

    fn deregister(&self, id: ShaderProgramId) {
        self.inner.lock().unwrap().programs.remove(&id);
    }
}

impl DeviceBackend for CpuDevice {
    fn create_shader_module(&self, words: &[u32]) -> Option<u64> {
        let program = match aegis_ir::codec::parse(words) {
            Ok(program) => program,
            Err(error) => {
                error!("native module creation failed: {}", error);
                return None;
            }
        };
        let mut inner = self.inner.lock().unwrap();
        inner.next_module += 1;
        let handle = inner.next_module;
        inner.modules.insert(handle, Arc::new(program));
        Some(handle)
    }

    fn commit(&self, _queue: Queue, buffer: &CommandBuffer) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        inner.bound_program = None;
        inner.bound_descriptors.clear();

        for command in buffer.iter() {
            match command {
                Command::SetShaderProgram { program } => {
                    inner.bound_program = inner.programs.get(program).cloned();
                }
                Command::SetEventData { value } => {
                    inner.event_data = *value;
                }
                Command::SetDescriptorData { binding, data } => {
                    inner.bound_descriptors.insert(*binding, *data);
                }
                Command::StageBuffer { data, offset_bytes, words } => {
                    if let Some(buffer) = inner.shader_data.get_mut(data) {
                        let offset = (*offset_bytes / 4) as usize;
                        for (index, &word) in words.iter().enumerate() {
                            if let Some(slot) = buffer.get_mut(offset + index) {
                                *slot = word;
                            }
                        }
                    }
                }
                Command::ClearBuffer { data, offset_words, word_count, value } => {
                    if let Some(buffer) = inner.shader_data.get_mut(data) {
                        let start = *offset_words as usize;
                        let end = (start + *word_count as usize).min(buffer.len());
                        for slot in &mut buffer[start.min(end)..end] {
                            *slot = *value;
                        }
                    }
                }
                Command::Dispatch { thread_count } => {
                    let program = match &inner.bound_program {
                        Some(program) => program.clone(),
                        None => {
                            warn!("dispatch without a bound program, skipping");
                            continue;
                        }
                    };

                    // Bind the descriptor table's shader data buffers.
                    let mut pool = ResourcePool::new();
                    let mut bindings = FxHashMap::default();
                    let mut staged = Vec::new();
                    for (&binding, &data) in &inner.bound_descriptors {
                        if let Some(words) = inner.shader_data.get(&data) {
                            let handle = pool.add(Resource {
                                desc: ResourceDesc {
                                    element_count: words.len() as u32,
                                    ..Default::default()
                                },
                                words: words.clone(),
                            });
                            bindings.insert(binding, handle);
                            staged.push((data, handle));
                        }
                    }

                    if let Err(error) =
                        Dispatcher::new(&program, &mut pool, &bindings, self.wave_size)
                            .dispatch(*thread_count)
                    {
                        warn!("layer dispatch failed: {}", error);
                    }

                    for (data, handle) in staged {
                        if let Some(resource) = pool.get(handle) {
                            inner.shader_data.insert(data, resource.words.clone());
                        }
                    }
                }
                Command::UavBarrier => {}
            }
        }

        inner.fence_counter += 1;
        inner.fence_counter
    }

    fn fence_complete(&self, fence: u64) -> bool {
        // Synchronous execution: a fence signals at submission.
        self.inner.lock().unwrap().fence_counter >= fence
    }

    fn wait_fence(&self, _fence: u64) {}
}

// ---------------------------------------------------------------------------
// Device registry

/// An application resource as created through the layer.
#[derive(Copy, Clone, Debug)]
pub struct DeviceResource {
    pub handle: u32,
    pub token: u32,
    pub info: ResourceInfo,
}

pub struct Device {
    pub backend: Arc<CpuDevice>,
    pub exports: Arc<ExportHost>,
    pub sguid: Arc<SguidHost>,
    pub scheduler: Arc<SchedulerService>,
    pub compiler: ShaderCompiler,
    pub reports: ReportRegistry,
    pub settings: LayerSettings,
    features: Vec<Arc<dyn Feature>>,
    export_routing: FxHashMap<u32, usize>,
    prmt: Mutex<Prmt>,
    puid_counter: AtomicU32,
    shader_uid_counter: AtomicU64,
    active_features: AtomicU32,
    ring_data: ShaderDataId,
    ring_limit_words: u32,
}

impl Device {
    /// Build the device: backend, hosts, scheduler, features, export ring,
    /// compiler workers, in that order.
    pub fn new(settings: LayerSettings, wave_size: u32) -> Device {
        let backend = Arc::new(CpuDevice::new(wave_size));
        let exports = Arc::new(ExportHost::new());
        let sguid = Arc::new(SguidHost::new());
        let scheduler = Arc::new(SchedulerService::new(backend.clone()));

        // Install features.
        let scheduler_dyn: Arc<dyn aegis_export::scheduler::Scheduler> = scheduler.clone();
        let mut ctx = InstallContext {
            exports: &exports,
            shader_data: backend.as_ref(),
            programs: backend.as_ref(),
            scheduler: &scheduler_dyn,
        };

        let mut installed: Vec<Arc<dyn Feature>> = Vec::new();
        let mut export_routing = FxHashMap::default();

        let mut boxed: Vec<Box<dyn Feature>> = vec![
            Box::new(aegis_features::descriptor::DescriptorMismatchFeature::new()),
            Box::new(aegis_features::bounds::ResourceBoundsFeature::new()),
            Box::new(aegis_features::initialization::InitializationFeature::new()),
            Box::new(aegis_features::concurrency::ConcurrencyFeature::new()),
            Box::new(aegis_features::waterfall::WaterfallFeature::new()),
            Box::new(aegis_features::export_stability::ExportStabilityFeature::new()),
        ];
        for mut feature in boxed.drain(..) {
            if !feature.install(&mut ctx) {
                warn!("feature '{}' failed to install", feature.info().name);
                continue;
            }
            let feature: Arc<dyn Feature> = Arc::from(feature);
            for export_id in feature.export_ids() {
                export_routing.insert(export_id, installed.len());
            }
            installed.push(feature);
        }

        // The export ring: one counter word, the message area, and scratch
        // for one clamped maximal record.
        let ring_limit_words = settings.ring_limit_words();
        let ring_data = backend.create_buffer(ShaderDataBufferInfo {
            element_count: 1 + ring_limit_words + *MAX_RECORD_WORDS as u32,
        });

        let compiler = ShaderCompiler::new(
            settings.shader_compiler_worker_count as usize,
            installed.clone(),
            sguid.clone(),
            backend.clone(),
            ring_data,
            ring_limit_words,
        );

        info!(
            "device installed: {} features, ring of {} words",
            installed.len(),
            ring_limit_words
        );

        Device {
            backend,
            exports,
            sguid,
            scheduler,
            compiler,
            reports: ReportRegistry::new(),
            settings,
            features: installed,
            export_routing,
            prmt: Mutex::new(Prmt::new()),
            puid_counter: AtomicU32::new(1),
            shader_uid_counter: AtomicU64::new(1),
            active_features: AtomicU32::new(0),
            ring_data,
            ring_limit_words,
        }
    }

    pub fn features(&self) -> &[Arc<dyn Feature>] {
        &self.features
    }

    pub fn ring_data(&self) -> ShaderDataId {
        self.ring_data
    }

    pub fn ring_limit_words(&self) -> u32 {
        self.ring_limit_words
    }

    pub fn active_features(&self) -> FeatureBits {
        FeatureBits::from_bits_truncate(self.active_features.load(Ordering::Acquire))
    }

    /// Activate a feature set: runs `activate` on newly active features and
    /// `deactivate` on dropped ones.
    pub fn set_active_features(&self, bits: FeatureBits) {
        let previous = self.active_features();
        for feature in &self.features {
            let bit = feature.info().bit;
            if bits.contains(bit) && !previous.contains(bit) {
                feature.activate();
            }
            if !bits.contains(bit) && previous.contains(bit) {
                feature.deactivate();
            }
        }
        self.active_features.store(bits.bits(), Ordering::Release);
    }

    // -----------------------------------------------------------------------
    // Shaders

    pub fn create_shader(&self, words: Vec<u32>, debug_name: &str) -> Arc<ShaderState> {
        let uid = self.shader_uid_counter.fetch_add(1, Ordering::Relaxed);
        let guid = hash_words(&words) ^ uid;
        Arc::new(ShaderState::new(uid, guid, debug_name, words))
    }

    /// Queue instrumentation; returns the compiler commit index.
    pub fn instrument_shader(&self, shader: &Arc<ShaderState>, key: InstrumentationKey) -> u64 {
        let diagnostic = Arc::new(CompilerDiagnostic::default());
        self.compiler.push(vec![ShaderJob {
            shader: shader.clone(),
            key,
            diagnostic,
        }])
    }

    // -----------------------------------------------------------------------
    // Resources

    fn alloc_puid(&self) -> u32 {
        self.puid_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Create an application buffer resource and mirror it in the PRMT at
    /// `descriptor_index`.
    pub fn create_buffer_resource(
        &self,
        element_count: u32,
        descriptor_index: u32,
    ) -> DeviceResource {
        let puid = self.alloc_puid();
        let token = pack_token(ResourceTokenType::Buffer, puid);

        let texel = ResourceTexelInfo {
            width: element_count,
            height: 1,
            depth_or_slices: 1,
            mip_count: 1,
            volumetric: false,
            is_buffer: true,
        };

        let handle = self.backend.add_app_resource(Resource::buffer(ResourceDesc {
            token,
            width: element_count,
            height: 1,
            depth_or_slices: 1,
            mip_count: 1,
            format_size: 4,
            view_format_size: 4,
            view_width: element_count,
            element_count,
            byte_count: element_count * 4,
            ..Default::default()
        }));

        self.prmt.lock().unwrap().write(descriptor_index, token);

        let info = ResourceInfo { token, texel };
        self.dispatch_hook(FeatureHooks::CREATE_RESOURCE, |f| f.on_create_resource(&info));

        DeviceResource { handle, token, info }
    }

    /// Create an application texture resource and mirror it in the PRMT.
    pub fn create_texture_resource(
        &self,
        width: u32,
        height: u32,
        depth_or_slices: u32,
        mip_count: u32,
        volumetric: bool,
        descriptor_index: u32,
    ) -> DeviceResource {
        let puid = self.alloc_puid();
        let token = pack_token(ResourceTokenType::Texture, puid);

        let texel = ResourceTexelInfo {
            width,
            height,
            depth_or_slices,
            mip_count,
            volumetric,
            is_buffer: false,
        };

        let handle = self.backend.add_app_resource(Resource::texture(ResourceDesc {
            token,
            width,
            height,
            depth_or_slices,
            mip_count,
            format_size: 4,
            view_format_size: 4,
            view_width: width,
            element_count: width * height.max(1) * depth_or_slices.max(1),
            byte_count: width * height.max(1) * depth_or_slices.max(1) * 4,
            ..Default::default()
        }));

        self.prmt.lock().unwrap().write(descriptor_index, token);

        let info = ResourceInfo { token, texel };
        self.dispatch_hook(FeatureHooks::CREATE_RESOURCE, |f| f.on_create_resource(&info));

        DeviceResource { handle, token, info }
    }

    pub fn destroy_resource(&self, resource: &DeviceResource) {
        let info = resource.info;
        self.dispatch_hook(FeatureHooks::DESTROY_RESOURCE, |f| f.on_destroy_resource(&info));
    }

    /// Application clear: fills the resource and fires the clear hooks.
    pub fn clear_resource(&self, resource: &DeviceResource, value: u32) {
        let words = vec![value; self.backend.read_app_resource(resource.handle).len()];
        self.backend.write_app_resource(resource.handle, &words);
        let info = resource.info;
        self.dispatch_hook(FeatureHooks::CLEAR_RESOURCE, |f| f.on_clear_resource(&info));
    }

    /// Application whole-resource copy.
    pub fn copy_resource(&self, source: &DeviceResource, dest: &DeviceResource) {
        let words = self.backend.read_app_resource(source.handle);
        self.backend.write_app_resource(dest.handle, &words);
        let (source_info, dest_info) = (source.info, dest.info);
        self.dispatch_hook(FeatureHooks::COPY_RESOURCE, |f| {
            f.on_copy_resource(&source_info, &dest_info)
        });
    }

    /// Application map event.
    pub fn map_resource(&self, resource: &DeviceResource) {
        let info = resource.info;
        self.dispatch_hook(FeatureHooks::MAP_RESOURCE, |f| f.on_map_resource(&info));
    }

    /// Application discard event.
    pub fn discard_resource(&self, resource: &DeviceResource) {
        let info = resource.info;
        self.dispatch_hook(FeatureHooks::DISCARD_RESOURCE, |f| f.on_discard_resource(&info));
    }

    /// Token at a descriptor slot, as the PRMT mirrors it.
    pub fn prmt_token(&self, set: aegis_addressing::token::DescriptorSetData, offset: u32) -> u32 {
        self.prmt.lock().unwrap().read(set, offset)
    }

    /// Dispatch a hook across active features that subscribed to it.
    pub fn dispatch_hook(&self, hook: FeatureHooks, mut f: impl FnMut(&dyn Feature)) {
        let active = self.active_features();
        for feature in &self.features {
            if !active.contains(feature.info().bit) {
                continue;
            }
            if feature.hooks().contains(hook) {
                f(feature.as_ref());
            }
        }
    }

    // -----------------------------------------------------------------------
    // Submission

    /// Run pre-submit hooks (features flush transfer work and name their
    /// wait primitives), then execute an application dispatch.
    pub fn submit_dispatch(
        &self,
        module: u64,
        descriptor_bindings: &FxHashMap<u32, u32>,
        thread_count: u32,
    ) -> aegis_ir::Result<()> {
        let mut submission = SubmissionContext::default();
        self.dispatch_hook(FeatureHooks::PRE_SUBMIT, |f| f.on_pre_submit(&mut submission));

        // Honor the cross-queue ordering: wait out the named primitives
        // before the application work runs.
        for event in &submission.wait_primitives {
            self.scheduler.wait_primitive(event.id, event.value);
        }

        self.backend.dispatch_app(module, descriptor_bindings, thread_count)
    }

    // -----------------------------------------------------------------------
    // Export pump

    /// Drain the export ring once, routing records to their owning
    /// features.
    pub fn pump(&self) -> DrainStats {
        let features = &self.features;
        let routing = &self.export_routing;
        let exports = self.exports.clone();
        let limit = self.ring_limit_words;

        self.backend
            .with_shader_data(self.ring_data, |ring| {
                drain_ring(ring, limit, &exports, &mut |export_id, message| {
                    if let Some(&index) = routing.get(&export_id) {
                        features[index].collect_exports(export_id, &message);
                    }
                })
            })
            .unwrap_or_default()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        // Compiler first: workers hold feature references through their
        // jobs.
        self.compiler.shutdown();
        self.set_active_features(FeatureBits::empty());
    }
}
