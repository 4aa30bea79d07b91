//! Store-value rewriting through the full compile-execute path, using the
//! test-support pass that offsets every stored value by one.

use aegis_export::sguid::SguidHost;
use aegis_features::offset_stores::OffsetStoresFeature;
use aegis_features::{Feature, FeatureBits};
use aegis_ir::emitter::Emitter;
use aegis_ir::function::Function;
use aegis_ir::program::Program;
use aegis_ir::types::{AddressSpace, Format, SamplerMode, Type};
use aegis_runtime::compiler::{CompilerDiagnostic, ShaderCompiler, ShaderJob};
use aegis_runtime::device::{CpuDevice, DeviceBackend};
use aegis_runtime::shader::{InstrumentationKey, ShaderState, Specialization};
use fxhash::FxHashMap;
use std::sync::Arc;

/// `rwbuf[tid.x] = -int(tid.x)`
fn negative_store_shader() -> Program {
    let mut program = Program::new();
    let void = program.type_void();
    let sint = program.type_i32();
    let buffer_ty = program.add_type(Type::Buffer {
        elem: sint,
        sampler_mode: SamplerMode::Writable,
        texel_format: Format::R32SInt,
    });
    let var = program.add_variable(buffer_ty, AddressSpace::Resource, Some(0));

    let fn_id = program.identifiers.alloc();
    let mut function = Function::new(fn_id, void);
    let entry = function.alloc_block(&mut program.identifiers);
    program.add_function(function);
    program.set_entry_point(fn_id);

    let mut e = Emitter::new(&mut program, fn_id, entry);
    let tid = e.dispatch_thread_id();
    let zero = e.u32(0);
    let x = e.extract(tid, zero);
    let sint = e.program().type_i32();
    let signed = e.bit_cast(x, sint);
    let negated = e.negate(signed);
    e.store_buffer(var, x, negated);
    e.ret_void();

    program
}

fn run(words: &[u32], backend: &CpuDevice) -> Vec<u32> {
    let native = backend.create_shader_module(words).expect("module");
    let buffer = backend.add_app_resource(aegis_ir::exec::Resource::buffer(
        aegis_ir::exec::ResourceDesc {
            element_count: 4,
            view_width: 4,
            width: 4,
            format_size: 4,
            view_format_size: 4,
            mip_count: 1,
            byte_count: 16,
            ..Default::default()
        },
    ));
    let mut bindings = FxHashMap::default();
    bindings.insert(0u32, buffer);
    backend.dispatch_app(native, &bindings, 4).expect("dispatch");
    backend.read_app_resource(buffer)
}

#[test]
fn baseline_writes_negative_values() {
    let backend = CpuDevice::new(4);
    let words = aegis_ir::codec::stitch(&negative_store_shader());
    let values = run(&words, &backend);
    assert_eq!(values, vec![0u32, (-1i32) as u32, (-2i32) as u32, (-3i32) as u32]);
}

#[test]
fn offset_feature_rewrites_every_store() {
    let backend = Arc::new(CpuDevice::new(4));

    // One toy feature in the pipeline.
    let exports = aegis_export::ExportHost::new();
    let scheduler: Arc<dyn aegis_export::scheduler::Scheduler> = Arc::new(NullScheduler);
    let mut feature = OffsetStoresFeature::new();
    let features: Vec<Arc<dyn Feature>> = {
        let mut ctx = aegis_features::InstallContext {
            exports: &exports,
            shader_data: backend.as_ref(),
            programs: backend.as_ref(),
            scheduler: &scheduler,
        };
        assert!(feature.install(&mut ctx));
        vec![Arc::new(feature)]
    };

    let compiler = ShaderCompiler::new(
        1,
        features,
        Arc::new(SguidHost::new()),
        backend.clone(),
        0,
        256,
    );

    let words = aegis_ir::codec::stitch(&negative_store_shader());
    let shader = Arc::new(ShaderState::new(1, 1, "negative-stores", words));
    let key = InstrumentationKey {
        features: FeatureBits::EXPORT_STABILITY,
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

    let compiled = shader.instrument(&key).expect("instrumented");
    let values = run(&compiled.words, &backend);

    // Every store rewritten with `value + 1`.
    assert_eq!(values, vec![1u32, 0, (-1i32) as u32, (-2i32) as u32]);

    compiler.shutdown();
}

/// Scheduler stub for the toy pipeline.
struct NullScheduler;

impl aegis_export::scheduler::Scheduler for NullScheduler {
    fn schedule(
        &self,
        _queue: aegis_export::scheduler::Queue,
        _buffer: aegis_export::commands::CommandBuffer,
        _event: Option<aegis_export::scheduler::SchedulerPrimitiveEvent>,
    ) {
    }

    fn sync_point(&self) {}

    fn wait_for_pending(&self) {}

    fn create_primitive(&self) -> aegis_export::scheduler::SchedulerPrimitiveId {
        0
    }

    fn destroy_primitive(&self, _id: aegis_export::scheduler::SchedulerPrimitiveId) {}

    fn primitive_value(&self, _id: aegis_export::scheduler::SchedulerPrimitiveId) -> u64 {
        0
    }

    fn map_tiles(
        &self,
        _queue: aegis_export::scheduler::Queue,
        _data: aegis_export::shader_data::ShaderDataId,
        _mappings: &[aegis_export::scheduler::TileMapping],
    ) {
    }
}
