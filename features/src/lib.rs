//! Validation feature passes: composable IR transforms that export
//! violations through the shader export stream, plus the runtime hooks each
//! feature registers against the resource and submission surface.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;
#[macro_use]
extern crate downcast_rs;

pub mod bounds;
pub mod concurrency;
pub mod descriptor;
pub mod export_stability;
pub mod initialization;
pub mod inject;
pub mod offset_stores;
pub mod waterfall;

use aegis_addressing::allocator::ResourceTexelInfo;
use aegis_export::commands::ShaderProgramHost;
use aegis_export::scheduler::{Scheduler, SchedulerPrimitiveEvent};
use aegis_export::schema::{DecodedMessage, ExportId};
use aegis_export::sguid::SguidHost;
use aegis_export::shader_data::{ShaderDataHost, ShaderDataId};
use aegis_export::MessageStore;
use aegis_ir::program::Program;
use downcast_rs::DowncastSync;
use std::sync::Arc;

bitflags! {
    /// Public feature bits; instrumentation sets are OR-masks of these.
    pub struct FeatureBits: u32 {
        const RESOURCE_ADDRESS_BOUNDS   = 1 << 0;
        const EXPORT_STABILITY          = 1 << 1;
        const DESCRIPTOR_ARRAY_BOUNDS   = 1 << 2;
        const RESOURCE_DATA_RACE        = 1 << 3;
        const RESOURCE_INITIALIZATION   = 1 << 4;
        const DIVERGENT_INDEXING        = 1 << 5;
    }
}

bitflags! {
    /// Runtime hooks a feature subscribes to; dispatch iterates set bits
    /// only.
    pub struct FeatureHooks: u32 {
        const CREATE_RESOURCE  = 1 << 0;
        const DESTROY_RESOURCE = 1 << 1;
        const MAP_RESOURCE     = 1 << 2;
        const COPY_RESOURCE    = 1 << 3;
        const CLEAR_RESOURCE   = 1 << 4;
        const WRITE_RESOURCE   = 1 << 5;
        const DISCARD_RESOURCE = 1 << 6;
        const RENDER_PASS      = 1 << 7;
        const PRE_SUBMIT       = 1 << 8;
        const JOIN             = 1 << 9;
    }
}

/// Feature identity and pass-ordering dependencies.
#[derive(Clone, Debug)]
pub struct FeatureInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub bit: FeatureBits,
    /// Features whose passes must run before this one.
    pub dependencies: Vec<FeatureBits>,
}

/// Per-pass configuration from the instrumentation specialization.
#[derive(Copy, Clone, Debug, Default)]
pub struct InstrumentationConfig {
    /// Emit detailed (token + coordinate) message chunks.
    pub detail: bool,
    /// Mask the offending operation's side effect in addition to reporting.
    pub safe_guard: bool,
}

/// Services available while a feature installs.
pub struct InstallContext<'a> {
    pub exports: &'a aegis_export::ExportHost,
    pub shader_data: &'a dyn ShaderDataHost,
    pub programs: &'a dyn ShaderProgramHost,
    pub scheduler: &'a Arc<dyn Scheduler>,
}

/// Context threaded through pre-inject and inject.
pub struct PassContext<'a> {
    pub config: InstrumentationConfig,
    /// GUID of the shader being instrumented, for SGUID binding.
    pub shader_guid: u64,
    pub sguid: &'a SguidHost,
    /// Shader data id of the export ring attached to the program.
    pub ring_data: ShaderDataId,
    /// Message-area size of the ring, in words.
    pub ring_limit_words: u32,
}

/// A resource as the hook surface sees it.
#[derive(Copy, Clone, Debug)]
pub struct ResourceInfo {
    /// Packed token; carries the PUID.
    pub token: u32,
    pub texel: ResourceTexelInfo,
}

impl ResourceInfo {
    pub fn puid(&self) -> u32 {
        aegis_addressing::token::token_puid(self.token)
    }
}

/// Mutable submission state passed to pre-submit hooks; features append the
/// primitives the submission must wait on.
#[derive(Default)]
pub struct SubmissionContext {
    pub wait_primitives: Vec<SchedulerPrimitiveEvent>,
}

/// The feature interface. Implementations are shared across compiler
/// workers, so injection state is interior and synchronized.
pub trait Feature: DowncastSync {
    fn info(&self) -> FeatureInfo;

    /// Allocate exports and shader data. Runs once at device install,
    /// before the feature is shared.
    fn install(&mut self, ctx: &mut InstallContext) -> bool;

    fn hooks(&self) -> FeatureHooks {
        FeatureHooks::empty()
    }

    fn activate(&self) {}

    fn deactivate(&self) {}

    /// Shader data this feature needs attached to instrumented programs.
    fn shader_data(&self) -> Vec<ShaderDataId> {
        Vec::new()
    }

    /// Export ids owned by this feature, for pump routing.
    fn export_ids(&self) -> Vec<ExportId>;

    /// Analysis stage; runs for every active feature before any `inject`.
    fn pre_inject(&self, _program: &mut Program, _ctx: &PassContext) {}

    /// Transform stage.
    fn inject(&self, program: &mut Program, ctx: &PassContext);

    /// Receive one decoded record from the pump.
    fn collect_exports(&self, _export_id: ExportId, _message: &DecodedMessage) {}

    /// Move buffered messages into the report's filtered store.
    fn collect_messages(&self, _storage: &mut MessageStore) {}

    // Runtime hooks; only called when the matching `hooks()` bit is set.
    fn on_create_resource(&self, _resource: &ResourceInfo) {}
    fn on_destroy_resource(&self, _resource: &ResourceInfo) {}
    fn on_map_resource(&self, _resource: &ResourceInfo) {}
    fn on_copy_resource(&self, _source: &ResourceInfo, _dest: &ResourceInfo) {}
    fn on_clear_resource(&self, _resource: &ResourceInfo) {}
    fn on_write_resource(&self, _resource: &ResourceInfo) {}
    fn on_discard_resource(&self, _resource: &ResourceInfo) {}
    fn on_begin_render_pass(&self, _attachments: &[ResourceInfo]) {}
    fn on_pre_submit(&self, _submission: &mut SubmissionContext) {}
    fn on_join(&self) {}
}

impl_downcast!(sync Feature);

/// Order active features so every feature runs after its dependencies.
/// Registration order is kept among independent features.
pub fn dependency_order(features: &[Arc<dyn Feature>], active: FeatureBits) -> Vec<Arc<dyn Feature>> {
    let mut placed_bits = FeatureBits::empty();
    let mut remaining: Vec<Arc<dyn Feature>> = features
        .iter()
        .filter(|f| active.contains(f.info().bit))
        .cloned()
        .collect();
    let mut ordered = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let mut progressed = false;
        let mut index = 0;
        while index < remaining.len() {
            let info = remaining[index].info();
            // A dependency that is not active does not gate the pass.
            let satisfied = info.dependencies.iter().all(|&dep| {
                !active.contains(dep) || placed_bits.contains(dep)
            });
            if satisfied {
                placed_bits |= info.bit;
                ordered.push(remaining.remove(index));
                progressed = true;
            } else {
                index += 1;
            }
        }
        if !progressed {
            // Dependency cycle; keep the remainder in registration order
            // rather than dropping passes.
            warn!("feature dependency cycle, falling back to registration order");
            ordered.extend(remaining.drain(..));
        }
    }

    ordered
}
