//! Message fingerprinting and the merged message store.

use crate::schema::{DecodedMessage, ExportId};
use fxhash::FxHashMap;

/// Deduplication key: a message is "the same" when it names the same schema,
/// source location, resource and coordinate.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Fingerprint {
    pub type_id: u32,
    pub sguid: u32,
    pub token: u32,
    pub coordinate: [u32; 3],
}

impl Fingerprint {
    pub fn of(message: &DecodedMessage) -> Fingerprint {
        Fingerprint {
            type_id: message.message_type() as u32,
            sguid: message.sguid(),
            token: message.token().unwrap_or(0),
            coordinate: message.coordinate(),
        }
    }
}

/// A stored message and the number of duplicates merged into it.
#[derive(Clone, Debug)]
pub struct StoredMessage {
    pub export_id: ExportId,
    pub message: DecodedMessage,
    pub merged_count: u64,
}

/// Fingerprint-keyed message storage. Duplicate inserts bump the merge
/// count instead of growing the store.
#[derive(Clone, Debug, Default)]
pub struct MessageStore {
    messages: FxHashMap<Fingerprint, StoredMessage>,
}

impl MessageStore {
    pub fn new() -> MessageStore {
        Default::default()
    }

    pub fn add(&mut self, export_id: ExportId, message: DecodedMessage) {
        let fingerprint = Fingerprint::of(&message);
        self.messages
            .entry(fingerprint)
            .and_modify(|stored| stored.merged_count += 1)
            .or_insert(StoredMessage { export_id, message, merged_count: 1 });
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StoredMessage> {
        self.messages.values()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Total message count including merged duplicates.
    pub fn total_count(&self) -> u64 {
        self.messages.values().map(|m| m.merged_count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ResourceRaceConditionMessage;

    #[test]
    fn duplicates_merge() {
        let mut store = MessageStore::new();
        let message = DecodedMessage::ResourceRaceCondition(ResourceRaceConditionMessage {
            sguid: 1,
            token: 77,
            coordinate: [3, 0, 0],
            mip: 0,
        });

        store.add(0, message);
        store.add(0, message);
        store.add(
            0,
            DecodedMessage::ResourceRaceCondition(ResourceRaceConditionMessage {
                sguid: 1,
                token: 77,
                coordinate: [4, 0, 0],
                mip: 0,
            }),
        );

        assert_eq!(store.len(), 2);
        assert_eq!(store.total_count(), 3);
        let merged = store
            .iter()
            .find(|m| m.message.coordinate() == [3, 0, 0])
            .unwrap();
        assert_eq!(merged.merged_count, 2);
    }
}
