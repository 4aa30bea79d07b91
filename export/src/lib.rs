//! GPU to host diagnostic transport and the backend plumbing shared by the
//! feature passes and the runtime: message schemas, the exported-message
//! ring, the abstract command set, scheduler and shader-data interfaces, and
//! source-location identifiers.

#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;

pub mod commands;
pub mod fingerprint;
pub mod scheduler;
pub mod schema;
pub mod sguid;
pub mod shader_data;
pub mod stream;

pub use self::fingerprint::{Fingerprint, MessageStore, StoredMessage};
pub use self::schema::{DecodedMessage, ExportId, MessageType};
pub use self::stream::{drain_ring, DrainStats, ExportHost};
