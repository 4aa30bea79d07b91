//! Scheduler interface: host-originated submissions on the layer's own
//! queues, ordered across queues by timeline primitives.

use crate::commands::CommandBuffer;
use crate::shader_data::ShaderDataId;

/// Layer-owned queues. Submissions on different queues are unordered unless
/// tied together by a primitive.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u32)]
pub enum Queue {
    Graphics = 0,
    Compute = 1,
    ExclusiveTransfer = 2,
}

pub const QUEUE_COUNT: usize = 3;

/// Identifier of a timeline primitive.
pub type SchedulerPrimitiveId = u32;

pub const INVALID_SCHEDULER_PRIMITIVE_ID: SchedulerPrimitiveId = !0;

/// A (primitive, value) pair: signalled by a submission, waited on by later
/// ones.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SchedulerPrimitiveEvent {
    pub id: SchedulerPrimitiveId,
    pub value: u64,
}

/// One sparse tile binding for tiled shader-data resources.
#[derive(Copy, Clone, Debug)]
pub struct TileMapping {
    pub tile_offset: u32,
    pub tile_count: u32,
    pub mapping: u32,
}

/// The scheduler service. Implemented by the runtime, consumed by features
/// that need initialization blits and mapping-table staging.
pub trait Scheduler: Send + Sync {
    /// Record and submit a command buffer; signals `event` on completion if
    /// present.
    fn schedule(
        &self,
        queue: Queue,
        buffer: CommandBuffer,
        event: Option<SchedulerPrimitiveEvent>,
    );

    /// Reclaim completed submissions into the free lists.
    fn sync_point(&self);

    /// Block until every pending submission's fence signalled.
    fn wait_for_pending(&self);

    fn create_primitive(&self) -> SchedulerPrimitiveId;

    fn destroy_primitive(&self, id: SchedulerPrimitiveId);

    /// Last signalled value of a primitive.
    fn primitive_value(&self, id: SchedulerPrimitiveId) -> u64;

    /// Batch sparse tile mappings of a shader-data resource.
    fn map_tiles(&self, queue: Queue, data: ShaderDataId, mappings: &[TileMapping]);
}
