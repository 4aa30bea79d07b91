//! End-to-end validation scenarios on the CPU device: shaders are built as
//! IR, instrumented through the real compiler, executed on the device, and
//! their exports drained into reports.

use aegis_export::schema::DecodedMessage;
use aegis_features::FeatureBits;
use aegis_ir::emitter::Emitter;
use aegis_ir::function::Function;
use aegis_ir::program::Program;
use aegis_ir::types::{AddressSpace, Format, SamplerMode, TextureDimension, Type};
use aegis_ir::Id;
use aegis_runtime::report::{ReportBeginInfo, ReportStatus};
use aegis_runtime::shader::{InstrumentationKey, Specialization};
use aegis_runtime::{Device, LayerSettings};
use fxhash::FxHashMap;

const WAVE_SIZE: u32 = 4;

fn device() -> Device {
    let _ = pretty_env_logger::try_init();
    Device::new(LayerSettings::default(), WAVE_SIZE)
}

fn key(features: FeatureBits, safe_guard: bool) -> InstrumentationKey {
    InstrumentationKey {
        features,
        layout_hash: 0,
        binding_info: 0,
        specialization: Specialization { detail: true, safe_guard },
    }
}

/// Compile a shader and return its native module handle.
fn compile(device: &Device, program: &Program, name: &str, key: InstrumentationKey) -> u64 {
    let words = aegis_ir::codec::stitch(program);
    let shader = device.create_shader(words, name);
    let commit = device.instrument_shader(&shader, key);
    device.compiler.wait_for_completion(commit);
    shader.instrument(&key).expect("compiled variant").native
}

struct ProgramBuilder {
    program: Program,
    function: Id,
    entry: Id,
}

impl ProgramBuilder {
    fn new() -> ProgramBuilder {
        let mut program = Program::new();
        let void = program.type_void();
        let fn_id = program.identifiers.alloc();
        let mut function = Function::new(fn_id, void);
        let entry = function.alloc_block(&mut program.identifiers);
        program.add_function(function);
        program.set_entry_point(fn_id);
        ProgramBuilder { program, function: fn_id, entry }
    }

    fn uint_buffer_var(&mut self, binding: u32) -> Id {
        let uint = self.program.type_u32();
        let buffer = self.program.add_type(Type::Buffer {
            elem: uint,
            sampler_mode: SamplerMode::Writable,
            texel_format: Format::R32UInt,
        });
        self.program.add_variable(buffer, AddressSpace::Resource, Some(binding))
    }

    fn texture_var(&mut self, binding: u32) -> Id {
        let uint = self.program.type_u32();
        let texture = self.program.add_type(Type::Texture {
            dim: TextureDimension::Texture2D,
            elem: uint,
            sampler_mode: SamplerMode::Writable,
            texel_format: Format::R32UInt,
        });
        self.program.add_variable(texture, AddressSpace::Resource, Some(binding))
    }

    fn texture_array_var(&mut self, binding: u32, count: u32) -> Id {
        let uint = self.program.type_u32();
        let texture = self.program.add_type(Type::Texture {
            dim: TextureDimension::Texture2D,
            elem: uint,
            sampler_mode: SamplerMode::Writable,
            texel_format: Format::R32UInt,
        });
        let array = self.program.add_type(Type::Array { elem: texture, count });
        self.program.add_variable(array, AddressSpace::Resource, Some(binding))
    }

    fn emitter(&mut self) -> Emitter {
        Emitter::new(&mut self.program, self.function, self.entry)
    }
}

/// `rwbuf[tid.x] = value`
fn store_shader(binding: u32, value: u32) -> Program {
    let mut builder = ProgramBuilder::new();
    let var = builder.uint_buffer_var(binding);
    let mut e = builder.emitter();
    let tid = e.dispatch_thread_id();
    let zero = e.u32(0);
    let x = e.extract(tid, zero);
    let value = e.u32(value);
    e.store_buffer(var, x, value);
    e.ret_void();
    builder.program
}

/// `out[tid.x] = src[tid.x].x`
fn read_copy_shader(src_binding: u32, out_binding: u32) -> Program {
    let mut builder = ProgramBuilder::new();
    let src = builder.uint_buffer_var(src_binding);
    let out = builder.uint_buffer_var(out_binding);
    let mut e = builder.emitter();
    let tid = e.dispatch_thread_id();
    let zero = e.u32(0);
    let x = e.extract(tid, zero);
    let loaded = e.load_buffer(src, x);
    let value = e.extract(loaded, zero);
    e.store_buffer(out, x, value);
    e.ret_void();
    builder.program
}

fn messages_of(device: &Device, handle: aegis_runtime::report::ReportHandle) -> Vec<(DecodedMessage, u64)> {
    aegis_runtime::get_report_info(device, handle, |report| {
        report
            .filtered_messages
            .iter()
            .map(|stored| (stored.message, stored.merged_count))
            .collect()
    })
    .unwrap_or_default()
}

// ---------------------------------------------------------------------------

/// Out-of-bounds buffer store: size 2, four threads; exactly the two
/// overflowing coordinates report.
#[test]
fn out_of_bounds_buffer_store_reports_each_overflow() {
    let device = device();
    let features = FeatureBits::RESOURCE_ADDRESS_BOUNDS;
    let native = compile(&device, &store_shader(0, 0), "oob-store", key(features, false));

    let buffer = device.create_buffer_resource(2, 0);
    let mut bindings = FxHashMap::default();
    bindings.insert(0u32, buffer.handle);

    let report = aegis_runtime::create_report(&device);
    aegis_runtime::begin_report(
        &device,
        report,
        ReportBeginInfo { features, wait_for_compilation: true },
    );

    device.submit_dispatch(native, &bindings, 4).expect("dispatch");
    aegis_runtime::end_report(&device, report);

    let messages = messages_of(&device, report);
    let mut coordinates: Vec<[u32; 3]> = messages
        .iter()
        .filter_map(|(message, _)| match message {
            DecodedMessage::ResourceIndexOutOfBounds(m) => Some(m.coordinate),
            _ => None,
        })
        .collect();
    coordinates.sort();

    assert_eq!(coordinates, vec![[2, 0, 0], [3, 0, 0]]);
    assert!(!coordinates.contains(&[0, 0, 0]));
    assert!(!coordinates.contains(&[1, 0, 0]));

    // The in-bounds stores still landed.
    let words = device.backend.read_app_resource(buffer.handle);
    assert_eq!(words.len(), 2);
}

/// Statically in-bounds accesses produce zero messages.
#[test]
fn in_bounds_program_is_silent() {
    let device = device();
    let features = FeatureBits::RESOURCE_ADDRESS_BOUNDS;
    let native = compile(&device, &store_shader(0, 9), "in-bounds", key(features, false));

    let buffer = device.create_buffer_resource(8, 0);
    let mut bindings = FxHashMap::default();
    bindings.insert(0u32, buffer.handle);

    let report = aegis_runtime::create_report(&device);
    aegis_runtime::begin_report(
        &device,
        report,
        ReportBeginInfo { features, wait_for_compilation: true },
    );
    device.submit_dispatch(native, &bindings, 8).expect("dispatch");
    aegis_runtime::end_report(&device, report);

    assert!(messages_of(&device, report).is_empty());
    assert_eq!(device.backend.read_app_resource(buffer.handle), vec![9; 8]);
}

/// Descriptor mismatch: binding a buffer where the shader declares a
/// texture yields exactly one mismatch message.
#[test]
fn descriptor_mismatch_buffer_for_texture() {
    let device = device();
    let features = FeatureBits::DESCRIPTOR_ARRAY_BOUNDS;

    // Texture2D declared, texel (tid.x, 0, 0) loaded.
    let mut builder = ProgramBuilder::new();
    let texture = builder.texture_var(0);
    let mut e = builder.emitter();
    let tid = e.dispatch_thread_id();
    let zero = e.u32(0);
    let x = e.extract(tid, zero);
    let uint = e.program().type_u32();
    let uint3 = e.program().type_vector(uint, 3);
    let coordinate = e.construct(uint3, &[x, zero, zero]);
    e.load_texture(texture, coordinate);
    e.ret_void();

    let native = compile(&device, &builder.program, "mismatch", key(features, false));

    let buffer = device.create_buffer_resource(4, 0);
    let mut bindings = FxHashMap::default();
    bindings.insert(0u32, buffer.handle);

    let report = aegis_runtime::create_report(&device);
    aegis_runtime::begin_report(
        &device,
        report,
        ReportBeginInfo { features, wait_for_compilation: true },
    );
    device.submit_dispatch(native, &bindings, 1).expect("dispatch");
    aegis_runtime::end_report(&device, report);

    let messages = messages_of(&device, report);
    assert_eq!(messages.len(), 1);
    match &messages[0].0 {
        DecodedMessage::DescriptorMismatch(m) => {
            assert_eq!(m.compile_type, 1, "expected texture compile type");
            assert_eq!(m.runtime_type, 0, "expected buffer runtime type");
            assert_eq!(m.is_undefined, 0);
            assert_eq!(m.is_out_of_bounds, 0);
        }
        other => panic!("unexpected message {:?}", other),
    }
}

/// Safe-guarded bounds: the out-of-bounds load's result is the null
/// constant in the application's control flow.
#[test]
fn safe_guarded_load_yields_null_constant() {
    let device = device();
    let features = FeatureBits::RESOURCE_ADDRESS_BOUNDS;
    let native = compile(
        &device,
        &read_copy_shader(0, 1),
        "safe-guard",
        key(features, true),
    );

    let src = device.create_buffer_resource(2, 0);
    let out = device.create_buffer_resource(4, 1);
    device.backend.write_app_resource(src.handle, &[5, 5]);

    let mut bindings = FxHashMap::default();
    bindings.insert(0u32, src.handle);
    bindings.insert(1u32, out.handle);

    let report = aegis_runtime::create_report(&device);
    aegis_runtime::begin_report(
        &device,
        report,
        ReportBeginInfo { features, wait_for_compilation: true },
    );
    device.submit_dispatch(native, &bindings, 4).expect("dispatch");
    aegis_runtime::end_report(&device, report);

    // Lanes 0/1 pass the value through, lanes 2/3 resolve to zero.
    assert_eq!(device.backend.read_app_resource(out.handle), vec![5, 5, 0, 0]);

    let oob_count = messages_of(&device, report)
        .iter()
        .filter(|(message, _)| matches!(message, DecodedMessage::ResourceIndexOutOfBounds(_)))
        .count();
    assert_eq!(oob_count, 2);
}

/// Dependency ordering: with an unbound descriptor table only the
/// descriptor feature reports; the bounds check sits behind the safe
/// descriptor result.
#[test]
fn unbound_table_reports_descriptor_only() {
    let device = device();
    let features = FeatureBits::DESCRIPTOR_ARRAY_BOUNDS | FeatureBits::RESOURCE_ADDRESS_BOUNDS;
    let native = compile(
        &device,
        &read_copy_shader(7, 1),
        "unbound",
        key(features, true),
    );

    let out = device.create_buffer_resource(4, 1);
    let mut bindings = FxHashMap::default();
    // Binding 7 deliberately left unbound.
    bindings.insert(1u32, out.handle);

    let report = aegis_runtime::create_report(&device);
    aegis_runtime::begin_report(
        &device,
        report,
        ReportBeginInfo { features, wait_for_compilation: true },
    );
    device.submit_dispatch(native, &bindings, 1).expect("dispatch");
    aegis_runtime::end_report(&device, report);

    let messages = messages_of(&device, report);
    let mismatches = messages
        .iter()
        .filter(|(m, _)| matches!(m, DecodedMessage::DescriptorMismatch(_)))
        .count();
    let bounds = messages
        .iter()
        .filter(|(m, _)| matches!(m, DecodedMessage::ResourceIndexOutOfBounds(_)))
        .count();

    assert!(mismatches >= 1);
    assert_eq!(bounds, 0);
}

/// Uninitialized read: one texel read without any prior initialization
/// event yields exactly one initialization message for that texel.
#[test]
fn uninitialized_read_reports_once() {
    let device = device();
    let features = FeatureBits::RESOURCE_INITIALIZATION;
    let native = compile(&device, &read_copy_shader(0, 1), "uninit", key(features, false));

    let report = aegis_runtime::create_report(&device);
    aegis_runtime::begin_report(
        &device,
        report,
        ReportBeginInfo { features, wait_for_compilation: true },
    );

    // Created while the feature is live, so the mask allocations exist.
    let src = device.create_buffer_resource(4, 0);
    let out = device.create_buffer_resource(4, 1);
    let mut bindings = FxHashMap::default();
    bindings.insert(0u32, src.handle);
    bindings.insert(1u32, out.handle);

    device.submit_dispatch(native, &bindings, 1).expect("dispatch");
    aegis_runtime::end_report(&device, report);

    let messages = messages_of(&device, report);
    let init: Vec<_> = messages
        .iter()
        .filter_map(|(m, count)| match m {
            DecodedMessage::TexelInitialization(m) => Some((m.coordinate, *count)),
            _ => None,
        })
        .collect();
    assert_eq!(init.len(), 1);
    assert_eq!(init[0].0, [0, 0, 0]);
    assert_eq!(init[0].1, 1);
}

/// Copy-range propagation: a fully initialized source copied into the
/// destination makes destination reads silent.
#[test]
fn copy_propagates_initialization() {
    let device = device();
    let features = FeatureBits::RESOURCE_INITIALIZATION;
    let native = compile(&device, &read_copy_shader(0, 1), "copy-init", key(features, false));

    let report = aegis_runtime::create_report(&device);
    aegis_runtime::begin_report(
        &device,
        report,
        ReportBeginInfo { features, wait_for_compilation: true },
    );

    let src = device.create_buffer_resource(4, 0);
    let dst = device.create_buffer_resource(4, 2);
    let out = device.create_buffer_resource(4, 1);

    // Source fully initialized by a clear, then copied over the
    // destination.
    device.clear_resource(&src, 7);
    device.copy_resource(&src, &dst);

    let mut bindings = FxHashMap::default();
    bindings.insert(0u32, dst.handle);
    bindings.insert(1u32, out.handle);

    device.submit_dispatch(native, &bindings, 4).expect("dispatch");
    aegis_runtime::end_report(&device, report);

    let init_messages = messages_of(&device, report)
        .iter()
        .filter(|(m, _)| matches!(m, DecodedMessage::TexelInitialization(_)))
        .count();
    assert_eq!(init_messages, 0);

    // The copied data itself arrived too.
    assert_eq!(device.backend.read_app_resource(out.handle), vec![7; 4]);
}

/// Concurrent writes to one texel: the lock bit reports each conflicting
/// writer, merged into one message.
#[test]
fn racing_writes_report_one_merged_race() {
    let device = device();
    let features = FeatureBits::RESOURCE_DATA_RACE;

    // Every thread writes texel 0.
    let mut builder = ProgramBuilder::new();
    let var = builder.uint_buffer_var(0);
    let mut e = builder.emitter();
    let zero = e.u32(0);
    let one = e.u32(1);
    e.store_buffer(var, zero, one);
    e.ret_void();

    let native = compile(&device, &builder.program, "race", key(features, false));

    let report = aegis_runtime::create_report(&device);
    aegis_runtime::begin_report(
        &device,
        report,
        ReportBeginInfo { features, wait_for_compilation: true },
    );

    let buffer = device.create_buffer_resource(4, 0);
    let mut bindings = FxHashMap::default();
    bindings.insert(0u32, buffer.handle);

    device.submit_dispatch(native, &bindings, 4).expect("dispatch");
    aegis_runtime::end_report(&device, report);

    let messages = messages_of(&device, report);
    let races: Vec<_> = messages
        .iter()
        .filter_map(|(m, count)| match m {
            DecodedMessage::ResourceRaceCondition(m) => Some((m.coordinate, *count)),
            _ => None,
        })
        .collect();

    // One fingerprint, three conflicting writers merged into it.
    assert_eq!(races.len(), 1);
    assert_eq!(races[0].0, [0, 0, 0]);
    assert_eq!(races[0].1, 3);
}

/// Disjoint writes race nothing.
#[test]
fn disjoint_writes_are_silent() {
    let device = device();
    let features = FeatureBits::RESOURCE_DATA_RACE;
    let native = compile(&device, &store_shader(0, 1), "no-race", key(features, false));

    let report = aegis_runtime::create_report(&device);
    aegis_runtime::begin_report(
        &device,
        report,
        ReportBeginInfo { features, wait_for_compilation: true },
    );

    let buffer = device.create_buffer_resource(8, 0);
    let mut bindings = FxHashMap::default();
    bindings.insert(0u32, buffer.handle);

    device.submit_dispatch(native, &bindings, 8).expect("dispatch");
    aegis_runtime::end_report(&device, report);

    assert!(messages_of(&device, report).is_empty());
}

/// Waterfall: divergent indexing into a texture array reports at runtime.
#[test]
fn divergent_texture_indexing_reports() {
    let device = device();
    let features = FeatureBits::DIVERGENT_INDEXING;

    let mut builder = ProgramBuilder::new();
    let array = builder.texture_array_var(10, 4);
    let mut e = builder.emitter();
    let tid = e.dispatch_thread_id();
    let zero = e.u32(0);
    let x = e.extract(tid, zero);
    let handles = e.load(array);
    let chained = e.address_chain(handles, &[x]);
    let uint = e.program().type_u32();
    let uint3 = e.program().type_vector(uint, 3);
    let coordinate = e.construct(uint3, &[zero, zero, zero]);
    e.load_texture(chained, coordinate);
    e.ret_void();

    let native = compile(&device, &builder.program, "waterfall", key(features, false));

    let mut bindings = FxHashMap::default();
    for index in 0..4 {
        let texture = device.create_texture_resource(4, 4, 1, 1, false, 10 + index);
        bindings.insert(10 + index, texture.handle);
    }

    let report = aegis_runtime::create_report(&device);
    aegis_runtime::begin_report(
        &device,
        report,
        ReportBeginInfo { features, wait_for_compilation: true },
    );
    device.submit_dispatch(native, &bindings, 4).expect("dispatch");
    aegis_runtime::end_report(&device, report);

    let messages = messages_of(&device, report);
    let divergent = messages
        .iter()
        .filter(|(m, _)| matches!(m, DecodedMessage::DivergentResourceIndexing(_)))
        .count();
    assert_eq!(divergent, 1);
}

/// Uniform indexing into a texture array stays silent: the runtime wave
/// check passes.
#[test]
fn uniform_texture_indexing_is_silent() {
    let device = device();
    let features = FeatureBits::DIVERGENT_INDEXING;

    let mut builder = ProgramBuilder::new();
    let array = builder.texture_array_var(10, 4);
    let mut e = builder.emitter();
    let tid = e.dispatch_thread_id();
    let zero = e.u32(0);
    let x = e.extract(tid, zero);
    // index = x / 8: uniform within an 4-wide wave of threads 0..3.
    let eight = e.u32(8);
    let index = e.div(x, eight);
    let handles = e.load(array);
    let chained = e.address_chain(handles, &[index]);
    let uint = e.program().type_u32();
    let uint3 = e.program().type_vector(uint, 3);
    let coordinate = e.construct(uint3, &[zero, zero, zero]);
    e.load_texture(chained, coordinate);
    e.ret_void();

    let native = compile(&device, &builder.program, "uniform-indexing", key(features, false));

    let mut bindings = FxHashMap::default();
    for index in 0..4 {
        let texture = device.create_texture_resource(4, 4, 1, 1, false, 10 + index);
        bindings.insert(10 + index, texture.handle);
    }

    let report = aegis_runtime::create_report(&device);
    aegis_runtime::begin_report(
        &device,
        report,
        ReportBeginInfo { features, wait_for_compilation: true },
    );
    device.submit_dispatch(native, &bindings, 4).expect("dispatch");
    aegis_runtime::end_report(&device, report);

    assert!(messages_of(&device, report).is_empty());
}

/// Export stability: storing a NaN reports; storing finite values does
/// not.
#[test]
fn nan_store_reports_unstable_export() {
    let device = device();
    let features = FeatureBits::EXPORT_STABILITY;

    // rwbuf[tid.x] = 0.0 / 0.0
    let mut builder = ProgramBuilder::new();
    let f32_ty = builder.program.type_f32();
    let buffer_ty = builder.program.add_type(Type::Buffer {
        elem: f32_ty,
        sampler_mode: SamplerMode::Writable,
        texel_format: Format::R32Float,
    });
    let var = builder
        .program
        .add_variable(buffer_ty, AddressSpace::Resource, Some(0));
    let mut e = builder.emitter();
    let tid = e.dispatch_thread_id();
    let zero = e.u32(0);
    let x = e.extract(tid, zero);
    let zero_f = e.f32(0.0);
    let nan = e.div(zero_f, zero_f);
    e.store_buffer(var, x, nan);
    e.ret_void();

    let native = compile(&device, &builder.program, "nan-store", key(features, false));

    let buffer = device.create_buffer_resource(4, 0);
    let mut bindings = FxHashMap::default();
    bindings.insert(0u32, buffer.handle);

    let report = aegis_runtime::create_report(&device);
    aegis_runtime::begin_report(
        &device,
        report,
        ReportBeginInfo { features, wait_for_compilation: true },
    );
    device.submit_dispatch(native, &bindings, 2).expect("dispatch");
    aegis_runtime::end_report(&device, report);

    let messages = messages_of(&device, report);
    let unstable: Vec<_> = messages
        .iter()
        .filter_map(|(m, count)| match m {
            DecodedMessage::ExportUnstable(m) => Some((m.kind, *count)),
            _ => None,
        })
        .collect();
    assert_eq!(unstable.len(), 1);
    assert_eq!(unstable[0].0, 1, "NaN kind");
    assert_eq!(unstable[0].1, 2, "both lanes merged");
}

/// Report lifecycle: pending compilations surface through the status, and
/// the report transitions to recording once the completion head catches
/// up.
#[test]
fn report_pending_transitions_to_recording() {
    let device = device();
    let features = FeatureBits::RESOURCE_ADDRESS_BOUNDS;

    // A batch of distinct shaders keeps the workers busy for a while.
    let mut commit = 0;
    for index in 0..24 {
        let program = store_shader(0, index);
        let words = aegis_ir::codec::stitch(&program);
        let shader = device.create_shader(words, "batch");
        commit = device.instrument_shader(&shader, key(features, false));
    }

    let report = aegis_runtime::create_report(&device);
    aegis_runtime::begin_report(
        &device,
        report,
        ReportBeginInfo { features, wait_for_compilation: false },
    );

    match aegis_runtime::get_report_status(&device, report) {
        ReportStatus::PendingShaderCompilation { remaining } => assert!(remaining >= 1),
        ReportStatus::Recording { .. } => {}
        other => panic!("unexpected status {:?}", other),
    }

    device.compiler.wait_for_completion(commit);
    match aegis_runtime::get_report_status(&device, report) {
        ReportStatus::Recording { .. } => {}
        other => panic!("expected recording, found {:?}", other),
    }

    aegis_runtime::end_report(&device, report);
    assert_eq!(
        aegis_runtime::get_report_status(&device, report),
        ReportStatus::Idle
    );
}

/// Reports render and export without messages too.
#[test]
fn report_rendering_is_total() {
    let device = device();
    let report = aegis_runtime::create_report(&device);
    aegis_runtime::begin_report(
        &device,
        report,
        ReportBeginInfo {
            features: FeatureBits::RESOURCE_ADDRESS_BOUNDS,
            wait_for_compilation: true,
        },
    );
    aegis_runtime::end_report(&device, report);

    let summary = aegis_runtime::print_summary_text(&device, report);
    assert!(summary.contains("0 unique messages"));

    let csv = aegis_runtime::export_report_text(
        &device,
        report,
        aegis_runtime::report::ExportFormat::Csv,
    );
    assert!(csv.starts_with("type,count"));

    let overlay = aegis_runtime::draw_debug(&device, report, (0, 0), (320, 200));
    assert!(overlay.contains("320x200"));
}
