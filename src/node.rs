//! A node speaking for some relays, and keeping the common relay state.
//!
//! Every message goes through [RelayNode::handle], which drops replays,
//! holds back messages whose dependencies haven't arrived, validates, stores,
//! and finally applies the message. Applying either succeeds as a whole or
//! leaves nothing behind. Applying may also produce new messages for the
//! relays this node controls; these are broadcast, and come back to the node
//! through the network like everybody else's.
//!
//! The handlers themselves live in [crate::admission], [crate::succession]
//! and [crate::timeout].
use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use k256::Scalar;
use rand_core::OsRng;
use tracing::{debug, info, warn};

use crate::{
    config::RelayConfig,
    crypto::MessageHash,
    error::{Error, ValidationError},
    constants::MAX_HELD_MESSAGES,
    keysplit::row_secrets,
    keystore::{KeyStore, MemoryKeyStore},
    messages::{Content, RelayMessage, Signed, Validate, ValidationContext},
    network::{AdmissionAnchors, Broadcast, Clock},
    relay::RelayNumber,
    scheduler::{Task, TaskQueue},
    state::{DeathReason, RelayState},
    store::{MemoryMessageStore, MessageStore, Record},
};

/// What became of a handled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Validated, stored and applied.
    Accepted,
    /// Seen before, whether it was accepted or rejected.
    Duplicate,
    Rejected(ValidationError),
    /// Waiting for a message it depends on.
    Orphaned,
    /// Not valid yet, but it may become valid once this node has seen more.
    /// It is tried again whenever a message is accepted.
    Deferred(ValidationError),
    /// Dropped, since this node already holds back as many messages as it will.
    Dropped,
}

pub struct RelayNode {
    pub(crate) config: RelayConfig,
    pub(crate) state: RelayState,
    pub(crate) messages: Box<dyn MessageStore + Send>,
    pub(crate) keys: Box<dyn KeyStore + Send>,
    anchors: Box<dyn AdmissionAnchors + Send>,
    network: Box<dyn Broadcast + Send>,
    clock: Box<dyn Clock + Send>,
    tasks: TaskQueue,
    /// Messages waiting for a record, by the hash of that record.
    orphans: HashMap<MessageHash, Vec<RelayMessage>>,
    /// Messages that failed validation for now.
    deferred: Vec<RelayMessage>,
    /// The joins this node made; it speaks for the relays they created.
    own_joins: HashSet<MessageHash>,
}

impl RelayNode {
    pub fn new(
        config: RelayConfig,
        anchors: impl AdmissionAnchors + Send + 'static,
        network: impl Broadcast + Send + 'static,
        clock: impl Clock + Send + 'static,
    ) -> Self {
        Self::with_stores(
            config,
            MemoryMessageStore::new(),
            MemoryKeyStore::new(),
            anchors,
            network,
            clock,
        )
    }

    pub fn with_stores(
        config: RelayConfig,
        messages: impl MessageStore + Send + 'static,
        keys: impl KeyStore + Send + 'static,
        anchors: impl AdmissionAnchors + Send + 'static,
        network: impl Broadcast + Send + 'static,
        clock: impl Clock + Send + 'static,
    ) -> Self {
        Self {
            config,
            state: RelayState::new(),
            messages: Box::new(messages),
            keys: Box::new(keys),
            anchors: Box::new(anchors),
            network: Box::new(network),
            clock: Box::new(clock),
            tasks: TaskQueue::new(),
            orphans: HashMap::new(),
            deferred: Vec::new(),
            own_joins: HashSet::new(),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn state(&self) -> &RelayState {
        &self.state
    }

    pub fn messages(&self) -> &dyn MessageStore {
        &*self.messages
    }

    pub fn keys(&self) -> &dyn KeyStore {
        &*self.keys
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.values().map(Vec::len).sum()
    }

    pub fn deferred_count(&self) -> usize {
        self.deferred.len()
    }

    /// Whether this node speaks for `relay`.
    pub fn controls(&self, relay: RelayNumber) -> bool {
        self.state
            .relay(relay)
            .map_or(false, |r| self.own_joins.contains(&r.hashes.join))
    }

    /// The relays this node speaks for.
    pub fn controlled_relays(&self) -> Vec<RelayNumber> {
        self.state
            .relays()
            .iter()
            .filter(|r| self.own_joins.contains(&r.hashes.join))
            .map(|r| r.number)
            .collect()
    }

    /// Handle a message from the network.
    pub fn handle(&mut self, message: RelayMessage) -> Result<Disposition, Error> {
        let disposition = self.handle_one(message)?;
        if disposition == Disposition::Accepted {
            self.release_held();
        }
        Ok(disposition)
    }

    /// Handle a message given in its wire encoding.
    pub fn handle_bytes(&mut self, bytes: &[u8]) -> Result<Disposition, Error> {
        let message = RelayMessage::from_bytes(bytes)?;
        self.handle(message)
    }

    pub(crate) fn context(&self) -> ValidationContext<'_> {
        ValidationContext {
            state: &self.state,
            messages: &*self.messages,
            anchors: &*self.anchors,
            config: &self.config,
        }
    }

    fn handle_one(&mut self, message: RelayMessage) -> Result<Disposition, Error> {
        let hash = message.hash();
        let kind = message.kind();
        if self.messages.contains(&hash) || self.messages.is_rejected(&hash) {
            debug!(hash = %hash, ?kind, "ignoring replayed message");
            return Ok(Disposition::Duplicate);
        }

        if let Some(missing) = message
            .dependencies()
            .into_iter()
            .find(|d| !self.messages.contains(d))
        {
            if self.is_full() {
                warn!(hash = %hash, ?kind, "too many messages held back, dropping");
                return Ok(Disposition::Dropped);
            }
            debug!(hash = %hash, ?kind, missing = %missing, "holding message back");
            let waiting = self.orphans.entry(missing).or_default();
            if !waiting.contains(&message) {
                waiting.push(message);
            }
            return Ok(Disposition::Orphaned);
        }

        if let Err(e) = message.validate(&self.context()) {
            if !e.is_transient() {
                warn!(hash = %hash, ?kind, reason = %e, "rejected message");
                self.messages.reject(hash);
                return Ok(Disposition::Rejected(e));
            }
            if self.is_full() {
                warn!(hash = %hash, ?kind, reason = %e, "too many messages held back, dropping");
                return Ok(Disposition::Dropped);
            }
            debug!(hash = %hash, ?kind, reason = %e, "deferring message");
            if !self.deferred.contains(&message) {
                self.deferred.push(message);
            }
            return Ok(Disposition::Deferred(e));
        }

        let snapshot = self.state.clone();
        self.messages.begin();
        self.messages.insert(Record::Message(message.clone()));
        match self.apply(hash, message) {
            Ok(()) => {
                self.messages.commit();
                Ok(Disposition::Accepted)
            }
            Err(e) => {
                self.messages.rollback();
                self.state = snapshot;
                warn!(hash = %hash, ?kind, error = %e, "applying message failed, rolled back");
                let reason = match e {
                    Error::Rejected(reason) => reason,
                    Error::State(e) => ValidationError::State(e),
                    e => return Err(e),
                };
                self.messages.reject(hash);
                Ok(Disposition::Rejected(reason))
            }
        }
    }

    fn is_full(&self) -> bool {
        self.orphan_count() + self.deferred.len() >= MAX_HELD_MESSAGES
    }

    /// Re-handle held back messages, until none of them gets in any more.
    fn release_held(&mut self) {
        loop {
            let ready: Vec<MessageHash> = self
                .orphans
                .keys()
                .filter(|h| self.messages.contains(h))
                .copied()
                .collect();
            let mut retry: Vec<RelayMessage> = ready
                .iter()
                .flat_map(|h| self.orphans.remove(h).unwrap_or_default())
                .collect();
            retry.append(&mut self.deferred);

            let mut accepted = false;
            for message in retry {
                let hash = message.hash();
                match self.handle_one(message) {
                    Ok(Disposition::Accepted) => accepted = true,
                    Ok(_) => {}
                    Err(e) => warn!(hash = %hash, error = %e, "could not handle held back message"),
                }
            }
            if !accepted {
                return;
            }
        }
    }

    fn apply(&mut self, hash: MessageHash, message: RelayMessage) -> Result<(), Error> {
        match message {
            RelayMessage::RelayJoin(m) => self.on_relay_join(hash, m),
            RelayMessage::KeyDistribution(m) => self.on_key_distribution(hash, m),
            RelayMessage::KeyDistributionComplaint(m) => {
                self.on_key_distribution_complaint(hash, m)
            }
            RelayMessage::Goodbye(m) => self.on_goodbye(hash, m),
            RelayMessage::GoodbyeComplaint(m) => self.on_goodbye_complaint(hash, m),
            RelayMessage::SecretRecovery(m) => self.on_secret_recovery(hash, m),
            RelayMessage::SecretRecoveryComplaint(m) => {
                self.on_secret_recovery_complaint(hash, m)
            }
            RelayMessage::SecretRecoveryFailure(m) => self.on_secret_recovery_failure(hash, m),
            RelayMessage::RecoveryFailureAudit(m) => self.on_recovery_failure_audit(hash, m),
            RelayMessage::SuccessionCompleted(m) => self.on_succession_completed(hash, m),
            RelayMessage::DurationWithoutResponse(m) => self.on_duration_without_response(hash, m),
            RelayMessage::DurationWithoutResponseFromRelay(m) => {
                self.on_duration_without_response_from_relay(hash, m)
            }
        }
    }

    /// Make one of this node's own answers to the message `hash`.
    ///
    /// The message stays applied whether or not the answer could be made,
    /// as it is on every other node.
    pub(crate) fn respond(
        &mut self,
        hash: MessageHash,
        answer: impl FnOnce(&mut Self) -> Result<(), Error>,
    ) {
        if let Err(e) = answer(self) {
            warn!(hash = %hash, error = %e, "could not respond");
        }
    }

    /// Run every task that has come due.
    pub fn poll(&mut self) {
        let now = self.clock.now_micros();
        for task in self.tasks.pop_due(now) {
            debug!(?task, "running task");
            self.on_task(task);
        }
    }

    /// How long until the next task comes due, if any is pending.
    pub fn time_until_next_task(&self) -> Option<Duration> {
        let deadline = self.tasks.next_deadline()?;
        let now = self.clock.now_micros();
        Some(Duration::from_micros(deadline.saturating_sub(now)))
    }

    pub fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Check on something once the response wait time has passed.
    pub(crate) fn schedule(&mut self, task: Task) {
        if !self.config.is_live() {
            return;
        }
        let fire_at = self.clock.now_micros() + self.config.response_wait_time;
        self.tasks.schedule(task, fire_at);
    }

    /// Sign content on behalf of a relay this node controls.
    pub fn sign_as<T: Content>(&self, author: RelayNumber, content: T) -> Result<RelayMessage, Error> {
        if !self.controls(author) {
            return Err(Error::MissingKeyMaterial(author));
        }
        let relay = self
            .state
            .relay(author)
            .ok_or(Error::MissingKeyMaterial(author))?;
        let key = relay
            .public_key_set
            .private_signing_key(&*self.keys)
            .ok_or(Error::MissingKeyMaterial(author))?;
        let signed = Signed::sign(content, &key).ok_or(Error::MissingKeyMaterial(author))?;
        Ok(signed.into_message())
    }

    /// Send a message to the network.
    pub fn publish(&mut self, message: &RelayMessage) {
        if !self.config.is_live() {
            return;
        }
        debug!(hash = %message.hash(), kind = ?message.kind(), "publishing");
        self.network.broadcast(message);
    }

    pub(crate) fn publish_as<T: Content>(
        &mut self,
        author: RelayNumber,
        content: T,
    ) -> Result<RelayMessage, Error> {
        let message = self.sign_as(author, content)?;
        self.publish(&message);
        Ok(message)
    }

    /// Remember a key sixteenth along with the rest of its row.
    pub(crate) fn store_row(&mut self, key_sixteenth: &Scalar) {
        for secret in row_secrets(key_sixteenth) {
            self.keys.insert_secret(secret);
        }
    }

    /// Declare a relay dead, unless it already is.
    pub(crate) fn kill(&mut self, relay: RelayNumber, reason: DeathReason) -> Result<(), Error> {
        match self.state.relay(relay) {
            Some(r) if !r.is_dead() => {}
            _ => return Ok(()),
        }
        let obituary = self.state.record_relay_death(
            relay,
            reason,
            self.config.good_standing_age,
            &mut *self.messages,
        )?;
        self.on_relay_death(obituary);
        Ok(())
    }

    /// Create a new relay, admitted with a ledger anchor.
    ///
    /// `admission_key` is the private key of the identity the anchor admits.
    pub fn join(
        &mut self,
        admission_anchor: MessageHash,
        admission_key: &Scalar,
    ) -> Result<RelayMessage, Error> {
        let content =
            crate::messages::RelayJoin::generate(admission_anchor, &mut OsRng, &mut *self.keys);
        let signed = Signed::sign(content, admission_key)
            .ok_or(Error::Rejected(ValidationError::BadSignature))?;
        let message = signed.into_message();
        self.own_joins.insert(message.hash());
        info!(hash = %message.hash(), "joining");
        self.publish(&message);
        Ok(message)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use elliptic_curve::Field;
    use k256::ProjectivePoint;

    use crate::{
        crypto::hash_value,
        messages::{KeyDistributionComplaint, RelayJoin},
        network::{ManualClock, MemoryAnchorChain, Outbox},
        relay::HolderGroup,
    };

    fn node(config: RelayConfig) -> (RelayNode, MemoryAnchorChain, Outbox) {
        let anchors = MemoryAnchorChain::new();
        let outbox = Outbox::new();
        let node = RelayNode::new(config, anchors.clone(), outbox.clone(), ManualClock::new(0));
        (node, anchors, outbox)
    }

    fn admission(anchors: &MemoryAnchorChain) -> (MessageHash, Scalar) {
        let key = Scalar::random(&mut OsRng);
        let anchor = anchors.push((ProjectivePoint::GENERATOR * key).to_affine());
        (anchor, key)
    }

    #[test]
    fn test_join_round_trip() {
        let (mut node, anchors, outbox) = node(RelayConfig::default());
        let (anchor, key) = admission(&anchors);
        let join = node.join(anchor, &key).unwrap();
        assert_eq!(outbox.len(), 1);
        assert!(node.state().is_empty());

        let delivered = outbox.pop().unwrap();
        assert_eq!(node.handle_bytes(&delivered.to_bytes()).unwrap(), Disposition::Accepted);
        assert_eq!(node.handle(join).unwrap(), Disposition::Duplicate);
        assert_eq!(node.controlled_relays(), vec![RelayNumber::from(1)]);
    }

    #[test]
    fn test_join_rejections() {
        let (mut node, anchors, outbox) = node(RelayConfig::default());
        let (anchor, key) = admission(&anchors);
        node.join(anchor, &key).unwrap();
        node.handle(outbox.pop().unwrap()).unwrap();

        // The same anchor can't admit twice.
        node.join(anchor, &key).unwrap();
        assert_eq!(
            node.handle(outbox.pop().unwrap()).unwrap(),
            Disposition::Rejected(ValidationError::AnchorAlreadyUsed(anchor))
        );

        // Signed by the wrong identity.
        let (anchor, _) = admission(&anchors);
        node.join(anchor, &Scalar::random(&mut OsRng)).unwrap();
        assert_eq!(
            node.handle(outbox.pop().unwrap()).unwrap(),
            Disposition::Rejected(ValidationError::BadSignature)
        );

        // Too old.
        let (anchor, key) = admission(&anchors);
        for _ in 0..4 {
            anchors.advance_epoch();
        }
        node.join(anchor, &key).unwrap();
        assert_eq!(
            node.handle(outbox.pop().unwrap()).unwrap(),
            Disposition::Rejected(ValidationError::AnchorOutOfWindow(anchor))
        );

        // Not in the main chain, as far as this node knows.
        let (anchor, key) = admission(&anchors);
        anchors.orphan(&anchor);
        node.join(anchor, &key).unwrap();
        assert_eq!(
            node.handle(outbox.pop().unwrap()).unwrap(),
            Disposition::Deferred(ValidationError::AnchorNotInMainChain(anchor))
        );
        assert_eq!(node.deferred_count(), 1);

        assert_eq!(node.state().len(), 1);
    }

    #[test]
    fn test_deferred_join_gets_in_once_its_anchor_does() {
        let (mut node, anchors, outbox) = node(RelayConfig::default());
        let (early, early_key) = admission(&anchors);
        let (late, late_key) = admission(&anchors);
        anchors.orphan(&late);

        node.join(late, &late_key).unwrap();
        assert!(matches!(
            node.handle(outbox.pop().unwrap()).unwrap(),
            Disposition::Deferred(_)
        ));
        anchors.restore(&late);

        node.join(early, &early_key).unwrap();
        assert_eq!(node.handle(outbox.pop().unwrap()).unwrap(), Disposition::Accepted);
        assert_eq!(node.deferred_count(), 0);
        assert_eq!(node.state().len(), 2);
    }

    #[test]
    fn test_held_back_messages_are_capped() {
        let (mut node, anchors, outbox) = node(RelayConfig::default());
        let content = KeyDistributionComplaint {
            key_distribution: hash_value(b"test", &0u64),
            group: HolderGroup::KeyQuarterHolders,
            position: 0,
            private_receiving_key: Scalar::ONE,
        };
        let (anchor, key) = admission(&anchors);
        node.join(anchor, &key).unwrap();
        let join = outbox.pop().unwrap();

        let key = Scalar::random(&mut OsRng);
        for n in 0..MAX_HELD_MESSAGES as u64 {
            let orphan = Signed::sign(
                KeyDistributionComplaint {
                    key_distribution: hash_value(b"test", &n),
                    ..content.clone()
                },
                &key,
            )
            .unwrap()
            .into_message();
            assert_eq!(node.handle(orphan.clone()).unwrap(), Disposition::Orphaned);
            assert_eq!(node.handle(orphan).unwrap(), Disposition::Orphaned);
        }
        assert_eq!(node.orphan_count(), MAX_HELD_MESSAGES);

        let one_too_many = Signed::sign(content, &key).unwrap().into_message();
        assert_eq!(node.handle(one_too_many).unwrap(), Disposition::Dropped);
        // Messages that need nothing held back still get in.
        assert_eq!(node.handle(join).unwrap(), Disposition::Accepted);
    }

    #[test]
    fn test_replay_mode_is_silent() {
        let (mut live, anchors, outbox) = node(RelayConfig::default());
        let (anchor, key) = admission(&anchors);
        live.join(anchor, &key).unwrap();
        let join = outbox.pop().unwrap();

        let replay_outbox = Outbox::new();
        let mut replay = RelayNode::new(
            RelayConfig::replay(),
            anchors.clone(),
            replay_outbox.clone(),
            ManualClock::new(0),
        );
        assert_eq!(replay.handle(join.clone()).unwrap(), Disposition::Accepted);
        assert_eq!(replay.handle(join).unwrap(), Disposition::Duplicate);
        assert_eq!(replay.state().len(), 1);

        let (anchor, key) = admission(&anchors);
        replay.join(anchor, &key).unwrap();
        assert!(replay_outbox.is_empty());
        assert_eq!(replay.pending_tasks(), 0);
    }

    #[test]
    fn test_signing_requires_control() {
        let (mut node, anchors, outbox) = node(RelayConfig::default());
        let (anchor, key) = admission(&anchors);
        node.join(anchor, &key).unwrap();
        node.handle(outbox.pop().unwrap()).unwrap();

        let content = RelayJoin {
            admission_anchor: anchor,
            public_key_set: node.state().relay(1.into()).unwrap().public_key_set.clone(),
        };
        assert!(node.sign_as(1.into(), content.clone()).is_ok());
        assert!(matches!(
            node.sign_as(2.into(), content),
            Err(Error::MissingKeyMaterial(_))
        ));
    }
}
