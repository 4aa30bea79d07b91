//! The exported-message ring and its host-side pump.
//!
//! GPU layout: word 0 is the atomic write counter, words `[1, 1 + limit)`
//! are the message area, and a trailing scratch region of one maximal record
//! absorbs clamped overflow writes. Instrumented code appends with
//! `AtomicIAdd` on the counter followed by a `UMin` clamp, so overflow is
//! discarded without branching.

use crate::schema::{unpack_header, DecodedMessage, ExportId, MessageType, EXPORT_ID_LIMIT};
use fxhash::FxHashMap;
use std::sync::Mutex;

lazy_static! {
    /// Widest record of any schema, in words; sizes the overflow scratch.
    pub static ref MAX_RECORD_WORDS: usize = (0..64)
        .filter_map(MessageType::from_u32)
        .map(|t| t.record_words())
        .max()
        .unwrap_or(1);
}

/// Allocates export ids and remembers which schema each one carries.
#[derive(Debug, Default)]
pub struct ExportHost {
    inner: Mutex<ExportHostInner>,
}

#[derive(Debug, Default)]
struct ExportHostInner {
    next: ExportId,
    schemas: FxHashMap<ExportId, MessageType>,
}

impl ExportHost {
    pub fn new() -> ExportHost {
        Default::default()
    }

    /// Allocate an export id for a schema. Ids are 26-bit.
    pub fn allocate(&self, message_type: MessageType) -> ExportId {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next;
        assert!(id < EXPORT_ID_LIMIT, "export id space exhausted");
        inner.next += 1;
        inner.schemas.insert(id, message_type);
        debug!("allocated export {} for {:?}", id, message_type);
        id
    }

    pub fn schema_of(&self, export_id: ExportId) -> Option<MessageType> {
        self.inner.lock().unwrap().schemas.get(&export_id).copied()
    }
}

/// Accounting of one drain pass.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct DrainStats {
    /// Records decoded and dispatched.
    pub exported_messages: u64,
    /// Words the shaders attempted beyond the ring limit.
    pub latent_overshoots: u64,
    /// Records dropped by the discard policy (clamped writes).
    pub latent_undershoots: u64,
    pub exported_bytes: u64,
}

impl DrainStats {
    pub fn accumulate(&mut self, other: DrainStats) {
        self.exported_messages += other.exported_messages;
        self.latent_overshoots += other.latent_overshoots;
        self.latent_undershoots += other.latent_undershoots;
        self.exported_bytes += other.exported_bytes;
    }
}

/// Drain one ring: snapshot the counter, clamp against the limit, reset to
/// zero, then decode `[0, count)` and hand each record to `sink`.
pub fn drain_ring(
    ring: &mut [u32],
    limit_words: u32,
    host: &ExportHost,
    sink: &mut dyn FnMut(ExportId, DecodedMessage),
) -> DrainStats {
    let mut stats = DrainStats::default();
    if ring.is_empty() {
        return stats;
    }

    let raw_count = ring[0] as u64;
    ring[0] = 0;

    let count = raw_count.min(limit_words as u64) as usize;
    if raw_count > limit_words as u64 {
        stats.latent_overshoots = raw_count - limit_words as u64;
    }

    let messages = &ring[1..];
    let mut cursor = 0usize;
    while cursor < count {
        let header = messages[cursor];
        let (export_id, type_raw) = unpack_header(header);

        let message_type = match MessageType::from_u32(type_raw) {
            Some(message_type) => message_type,
            None => {
                warn!("undecodable export header {:#x}, dropping tail", header);
                stats.latent_undershoots += 1;
                break;
            }
        };

        // A record that does not match the host allocation table is garbage
        // from a clamped write; drop the tail.
        if host.schema_of(export_id) != Some(message_type) {
            stats.latent_undershoots += 1;
            break;
        }

        let record_words = message_type.record_words();
        if cursor + record_words > count {
            // Truncated by the clamp.
            stats.latent_undershoots += 1;
            break;
        }

        if let Some(message) =
            DecodedMessage::decode(message_type, &messages[cursor + 1..cursor + record_words])
        {
            sink(export_id, message);
            stats.exported_messages += 1;
            stats.exported_bytes += record_words as u64 * 4;
        }

        cursor += record_words;
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{pack_header, ResourceIndexOutOfBoundsMessage};

    fn push_record(ring: &mut Vec<u32>, export_id: ExportId, message: &DecodedMessage) {
        let index = ring[0] as usize;
        let words = message.encode();
        ring[1 + index] = pack_header(export_id, message.message_type());
        for (offset, &word) in words.iter().enumerate() {
            ring[2 + index + offset] = word;
        }
        ring[0] += words.len() as u32 + 1;
    }

    #[test]
    fn drains_and_resets_counter() {
        let host = ExportHost::new();
        let export_id = host.allocate(MessageType::ResourceIndexOutOfBounds);

        let limit = 64u32;
        let mut ring = vec![0u32; 1 + limit as usize + *MAX_RECORD_WORDS];

        let message = DecodedMessage::ResourceIndexOutOfBounds(ResourceIndexOutOfBoundsMessage {
            sguid: 3,
            is_texture: 0,
            is_write: 1,
            token: 42,
            coordinate: [2, 0, 0],
        });
        push_record(&mut ring, export_id, &message);
        push_record(&mut ring, export_id, &message);

        let mut seen = Vec::new();
        let stats = drain_ring(&mut ring, limit, &host, &mut |id, m| seen.push((id, m)));

        assert_eq!(stats.exported_messages, 2);
        assert_eq!(stats.latent_overshoots, 0);
        assert_eq!(ring[0], 0);
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, export_id);
        assert_eq!(seen[0].1, message);
    }

    #[test]
    fn overshoot_is_counted_not_decoded() {
        let host = ExportHost::new();
        let export_id = host.allocate(MessageType::ExportUnstable);

        let limit = 4u32;
        let mut ring = vec![0u32; 1 + limit as usize + *MAX_RECORD_WORDS];
        // Pretend shaders pushed 12 words into a 4 word ring.
        ring[0] = 12;
        ring[1] = pack_header(export_id, MessageType::ExportUnstable);
        ring[2] = 9;
        ring[3] = 1;

        let mut seen = 0;
        let stats = drain_ring(&mut ring, limit, &host, &mut |_, _| seen += 1);

        assert_eq!(stats.latent_overshoots, 8);
        assert_eq!(seen, 1);
    }
}
