//! The validation layer runtime: per-device service registry, the shader
//! compiler worker pool, the scheduler and its command stream, and the
//! report/diagnostic registry with the host API.

#[macro_use]
extern crate log;

pub mod api;
pub mod compiler;
pub mod device;
pub mod report;
pub mod scheduler;
pub mod settings;
pub mod shader;

pub use self::api::*;
pub use self::device::Device;
pub use self::settings::LayerSettings;
