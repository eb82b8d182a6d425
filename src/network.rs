//! The world outside a node: the ledger, the other relays, and the clock.
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, RwLock,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use k256::AffinePoint;
use tracing::warn;

use crate::{
    crypto::{hash_value, MessageHash},
    messages::RelayMessage,
};

/// The ledger events relays are admitted with.
///
/// Each anchor is an entry in the ledger's main chain, belonging to an epoch,
/// and carrying the key of the identity entitled to admit one relay with it.
pub trait AdmissionAnchors {
    fn is_in_main_chain(&self, anchor: &MessageHash) -> bool;

    fn epoch(&self, anchor: &MessageHash) -> Option<u64>;

    fn latest_epoch(&self) -> u64;

    /// The key that must sign a join using this anchor.
    fn admission_key(&self, anchor: &MessageHash) -> Option<AffinePoint>;
}

impl<T: AdmissionAnchors + ?Sized> AdmissionAnchors for Arc<T> {
    fn is_in_main_chain(&self, anchor: &MessageHash) -> bool {
        (**self).is_in_main_chain(anchor)
    }

    fn epoch(&self, anchor: &MessageHash) -> Option<u64> {
        (**self).epoch(anchor)
    }

    fn latest_epoch(&self) -> u64 {
        (**self).latest_epoch()
    }

    fn admission_key(&self, anchor: &MessageHash) -> Option<AffinePoint> {
        (**self).admission_key(anchor)
    }
}

#[derive(Clone, Copy)]
struct Anchor {
    epoch: u64,
    key: AffinePoint,
    in_main_chain: bool,
}

#[derive(Default)]
struct AnchorChainInner {
    anchors: HashMap<MessageHash, Anchor>,
    latest_epoch: u64,
}

/// An in memory ledger, shareable between nodes.
#[derive(Clone, Default)]
pub struct MemoryAnchorChain {
    inner: Arc<RwLock<AnchorChainInner>>,
}

impl MemoryAnchorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an anchor to the main chain, in the latest epoch.
    pub fn push(&self, key: AffinePoint) -> MessageHash {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let epoch = inner.latest_epoch;
        let hash = hash_value(b"anchor", &(epoch, inner.anchors.len() as u64, key));
        inner.anchors.insert(
            hash,
            Anchor {
                epoch,
                key,
                in_main_chain: true,
            },
        );
        hash
    }

    pub fn advance_epoch(&self) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.latest_epoch += 1;
    }

    /// Move an anchor off the main chain, as a reorganisation would.
    pub fn orphan(&self, anchor: &MessageHash) {
        self.set_in_main_chain(anchor, false);
    }

    /// Put an orphaned anchor back on the main chain.
    pub fn restore(&self, anchor: &MessageHash) {
        self.set_in_main_chain(anchor, true);
    }

    fn set_in_main_chain(&self, anchor: &MessageHash, in_main_chain: bool) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(a) = inner.anchors.get_mut(anchor) {
            a.in_main_chain = in_main_chain;
        }
    }

    fn with<R>(&self, f: impl FnOnce(&AnchorChainInner) -> R) -> R {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        f(&inner)
    }
}

impl AdmissionAnchors for MemoryAnchorChain {
    fn is_in_main_chain(&self, anchor: &MessageHash) -> bool {
        self.with(|c| c.anchors.get(anchor).map_or(false, |a| a.in_main_chain))
    }

    fn epoch(&self, anchor: &MessageHash) -> Option<u64> {
        self.with(|c| c.anchors.get(anchor).map(|a| a.epoch))
    }

    fn latest_epoch(&self) -> u64 {
        self.with(|c| c.latest_epoch)
    }

    fn admission_key(&self, anchor: &MessageHash) -> Option<AffinePoint> {
        self.with(|c| c.anchors.get(anchor).map(|a| a.key))
    }
}

/// Sends messages to every relay.
///
/// Delivery is expected to be in one order for everybody, the sender included:
/// a node learns about its own messages the same way everyone else does.
pub trait Broadcast {
    fn broadcast(&mut self, message: &RelayMessage);
}

/// Collects broadcast messages in the order they were sent.
///
/// Clones share the same queue, so one outbox given to several nodes puts
/// everything they send in a single order.
#[derive(Debug, Default, Clone)]
pub struct Outbox {
    messages: Arc<Mutex<VecDeque<RelayMessage>>>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<RelayMessage>> {
        self.messages.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn pop(&self) -> Option<RelayMessage> {
        self.lock().pop_front()
    }

    pub fn drain(&self) -> Vec<RelayMessage> {
        self.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Broadcast for Outbox {
    fn broadcast(&mut self, message: &RelayMessage) {
        self.lock().push_back(message.clone());
    }
}

impl Broadcast for smol::channel::Sender<RelayMessage> {
    fn broadcast(&mut self, message: &RelayMessage) {
        if let Err(e) = self.try_send(message.clone()) {
            warn!(hash = %message.hash(), error = %e, "could not broadcast message");
        }
    }
}

/// A source of the current time, in microseconds.
pub trait Clock {
    fn now_micros(&self) -> u64;
}

/// Wall clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_micros(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to, shared between clones.
#[derive(Debug, Default, Clone)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start)),
        }
    }

    pub fn advance(&self, micros: u64) {
        self.now.fetch_add(micros, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::messages::DurationWithoutResponse;

    fn message(n: u64) -> RelayMessage {
        RelayMessage::DurationWithoutResponse(DurationWithoutResponse {
            message: hash_value(b"test", &n),
        })
    }

    #[test]
    fn test_channel_broadcast_survives_full_and_closed_channels() {
        let (mut sender, receiver) = smol::channel::bounded(1);
        sender.broadcast(&message(1));
        sender.broadcast(&message(2));
        assert_eq!(receiver.try_recv().ok(), Some(message(1)));
        assert!(receiver.try_recv().is_err());

        drop(receiver);
        sender.broadcast(&message(3));
        assert!(sender.is_closed());
    }

    #[test]
    fn test_restored_anchor_is_back_in_main_chain() {
        let chain = MemoryAnchorChain::new();
        let anchor = chain.push(AffinePoint::GENERATOR);
        chain.orphan(&anchor);
        assert!(!chain.is_in_main_chain(&anchor));
        chain.restore(&anchor);
        assert!(chain.is_in_main_chain(&anchor));
    }
}
