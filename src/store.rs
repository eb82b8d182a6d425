//! Durable storage for messages and obituaries.
//!
//! Besides the records themselves, the store keeps, for each record, the
//! lists of responses it has received (complaints, recovery messages, audits)
//! and a few flags. Nothing here is interpreted; that's the handlers' job.
//!
//! Applying a message may write several of these things. A store keeps a
//! journal while a message is applied, so that all of it can be undone if
//! applying fails halfway.
use std::collections::{hash_map::Entry, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::{
    crypto::MessageHash,
    messages::{Content, RelayMessage, Signed},
    state::Obituary,
};

/// Something kept in a [MessageStore].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    Message(RelayMessage),
    Obituary(Obituary),
}

impl Record {
    pub fn hash(&self) -> MessageHash {
        match self {
            Record::Message(m) => m.hash(),
            Record::Obituary(o) => o.hash(),
        }
    }
}

/// The kinds of response a record can collect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseKind {
    KeyDistributionComplaints,
    GoodbyeComplaints,
    SecretRecoveries,
    SecretRecoveryComplaints,
    SecretRecoveryFailures,
    RecoveryFailureAudits,
    SuccessionCompleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageFlag {
    /// A key quarter holder was found at fault in this failure, by an audit
    /// or by not auditing at all.
    BadQuarterHolderFound,
    /// The audits of this failure bore the successor out: the key sharer sent
    /// a bad secret.
    KeySharerAtFault,
    /// This failure has been resolved, one way or another.
    Resolved,
}

pub trait MessageStore {
    fn insert(&mut self, record: Record) -> MessageHash;

    fn get(&self, hash: &MessageHash) -> Option<&Record>;

    fn contains(&self, hash: &MessageHash) -> bool {
        self.get(hash).is_some()
    }

    /// Remember that a message was rejected, so that it isn't looked at again.
    fn reject(&mut self, hash: MessageHash);

    fn is_rejected(&self, hash: &MessageHash) -> bool;

    fn responses(&self, hash: &MessageHash, kind: ResponseKind) -> Vec<MessageHash>;

    /// Record a response, once.
    fn add_response(&mut self, hash: MessageHash, kind: ResponseKind, response: MessageHash);

    fn remove_response(&mut self, hash: &MessageHash, kind: ResponseKind, response: &MessageHash);

    fn set_flag(&mut self, hash: MessageHash, flag: MessageFlag);

    fn has_flag(&self, hash: &MessageHash, flag: MessageFlag) -> bool;

    /// Start journaling changes.
    fn begin(&mut self);

    /// Keep every change since [begin](Self::begin).
    fn commit(&mut self);

    /// Undo every change since [begin](Self::begin).
    ///
    /// Rejections are not undone.
    fn rollback(&mut self);
}

/// Typed access to stored records.
pub trait MessageStoreExt: MessageStore {
    fn fetch<T: Content>(&self, hash: &MessageHash) -> Option<&Signed<T>> {
        match self.get(hash)? {
            Record::Message(m) => T::from_message(m),
            Record::Obituary(_) => None,
        }
    }

    fn obituary(&self, hash: &MessageHash) -> Option<&Obituary> {
        match self.get(hash)? {
            Record::Obituary(o) => Some(o),
            Record::Message(_) => None,
        }
    }
}

impl<S: MessageStore + ?Sized> MessageStoreExt for S {}

/// A change to a [MemoryMessageStore], as it is journaled.
#[derive(Debug, Clone)]
enum Change {
    Inserted(MessageHash),
    /// A list of responses, with what it held before.
    Responses((MessageHash, ResponseKind), Vec<MessageHash>),
    Flagged(MessageHash, MessageFlag),
}

/// A message store in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryMessageStore {
    records: HashMap<MessageHash, Record>,
    rejected: HashSet<MessageHash>,
    responses: HashMap<(MessageHash, ResponseKind), Vec<MessageHash>>,
    flags: HashSet<(MessageHash, MessageFlag)>,
    journal: Option<Vec<Change>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn record_change(&mut self, change: Change) {
        if let Some(journal) = &mut self.journal {
            journal.push(change);
        }
    }
}

impl MessageStore for MemoryMessageStore {
    fn insert(&mut self, record: Record) -> MessageHash {
        let hash = record.hash();
        if let Entry::Vacant(entry) = self.records.entry(hash) {
            entry.insert(record);
            self.record_change(Change::Inserted(hash));
        }
        hash
    }

    fn get(&self, hash: &MessageHash) -> Option<&Record> {
        self.records.get(hash)
    }

    fn reject(&mut self, hash: MessageHash) {
        self.rejected.insert(hash);
    }

    fn is_rejected(&self, hash: &MessageHash) -> bool {
        self.rejected.contains(hash)
    }

    fn responses(&self, hash: &MessageHash, kind: ResponseKind) -> Vec<MessageHash> {
        self.responses
            .get(&(*hash, kind))
            .cloned()
            .unwrap_or_default()
    }

    fn add_response(&mut self, hash: MessageHash, kind: ResponseKind, response: MessageHash) {
        let key = (hash, kind);
        let list = self.responses.entry(key).or_default();
        if list.contains(&response) {
            return;
        }
        let before = list.clone();
        list.push(response);
        self.record_change(Change::Responses(key, before));
    }

    fn remove_response(&mut self, hash: &MessageHash, kind: ResponseKind, response: &MessageHash) {
        let key = (*hash, kind);
        let Some(list) = self.responses.get_mut(&key) else {
            return;
        };
        if !list.contains(response) {
            return;
        }
        let before = list.clone();
        list.retain(|r| r != response);
        self.record_change(Change::Responses(key, before));
    }

    fn set_flag(&mut self, hash: MessageHash, flag: MessageFlag) {
        if self.flags.insert((hash, flag)) {
            self.record_change(Change::Flagged(hash, flag));
        }
    }

    fn has_flag(&self, hash: &MessageHash, flag: MessageFlag) -> bool {
        self.flags.contains(&(*hash, flag))
    }

    fn begin(&mut self) {
        self.journal = Some(Vec::new());
    }

    fn commit(&mut self) {
        self.journal = None;
    }

    fn rollback(&mut self) {
        let changes = self.journal.take().unwrap_or_default();
        for change in changes.into_iter().rev() {
            match change {
                Change::Inserted(hash) => {
                    self.records.remove(&hash);
                }
                Change::Responses(key, before) => {
                    self.responses.insert(key, before);
                }
                Change::Flagged(hash, flag) => {
                    self.flags.remove(&(hash, flag));
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::crypto::hash_value;

    #[test]
    fn test_responses_are_recorded_once() {
        let mut store = MemoryMessageStore::new();
        let parent = hash_value(b"test", &1u8);
        let child = hash_value(b"test", &2u8);

        store.add_response(parent, ResponseKind::SecretRecoveries, child);
        store.add_response(parent, ResponseKind::SecretRecoveries, child);
        assert_eq!(store.responses(&parent, ResponseKind::SecretRecoveries), vec![child]);
        assert!(store
            .responses(&parent, ResponseKind::RecoveryFailureAudits)
            .is_empty());

        store.remove_response(&parent, ResponseKind::SecretRecoveries, &child);
        assert!(store.responses(&parent, ResponseKind::SecretRecoveries).is_empty());
    }

    #[test]
    fn test_flags_and_rejections() {
        let mut store = MemoryMessageStore::new();
        let hash = hash_value(b"test", &1u8);
        assert!(!store.has_flag(&hash, MessageFlag::Resolved));
        store.set_flag(hash, MessageFlag::Resolved);
        assert!(store.has_flag(&hash, MessageFlag::Resolved));
        assert!(!store.has_flag(&hash, MessageFlag::BadQuarterHolderFound));

        store.reject(hash);
        assert!(store.is_rejected(&hash));
        assert!(!store.contains(&hash));
    }

    #[test]
    fn test_rollback_undoes_journaled_changes() {
        let mut store = MemoryMessageStore::new();
        let parent = hash_value(b"test", &1u8);
        let kept = hash_value(b"test", &2u8);
        let added = hash_value(b"test", &3u8);
        store.add_response(parent, ResponseKind::SecretRecoveries, kept);

        store.begin();
        store.add_response(parent, ResponseKind::SecretRecoveries, added);
        store.remove_response(&parent, ResponseKind::SecretRecoveries, &kept);
        store.set_flag(parent, MessageFlag::Resolved);
        store.rollback();
        assert_eq!(store.responses(&parent, ResponseKind::SecretRecoveries), vec![kept]);
        assert!(!store.has_flag(&parent, MessageFlag::Resolved));

        store.begin();
        store.set_flag(parent, MessageFlag::Resolved);
        store.commit();
        store.rollback();
        assert!(store.has_flag(&parent, MessageFlag::Resolved));
    }
}
