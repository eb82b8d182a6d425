//! The relay state every node agrees on.
//!
//! Every node applies the same validated messages in the same order, so every
//! node holds the same [RelayState]. All choices made here (who holds whose
//! key, who succeeds whom) are deterministic functions of that state, so any
//! node can check another's choice by making it again.
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    crypto::{hash_value, MessageHash},
    error::RelayStateError,
    messages::{KeyDistribution, RelayJoin},
    relay::{Relay, RelayNumber},
};

mod death;
mod selection;

pub use death::{DeathReason, Obituary};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayState {
    /// Live and dying relays, in order of their numbers.
    relays: Vec<Relay>,
    latest_relay_number: RelayNumber,
    used_anchors: BTreeSet<MessageHash>,
}

impl RelayState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn relays(&self) -> &[Relay] {
        &self.relays
    }

    pub fn len(&self) -> usize {
        self.relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    pub fn latest_relay_number(&self) -> RelayNumber {
        self.latest_relay_number
    }

    fn index_of(&self, number: RelayNumber) -> Option<usize> {
        self.relays.binary_search_by_key(&number, |r| r.number).ok()
    }

    pub fn relay(&self, number: RelayNumber) -> Option<&Relay> {
        self.index_of(number).map(|i| &self.relays[i])
    }

    pub fn relay_mut(&mut self, number: RelayNumber) -> Option<&mut Relay> {
        self.index_of(number).map(move |i| &mut self.relays[i])
    }

    fn relay_mut_or_err(&mut self, number: RelayNumber) -> Result<&mut Relay, RelayStateError> {
        self.relay_mut(number)
            .ok_or(RelayStateError::NoSuchRelay(number))
    }

    pub fn relay_by_join(&self, join: &MessageHash) -> Option<&Relay> {
        self.relays.iter().find(|r| r.hashes.join == *join)
    }

    pub fn is_anchor_used(&self, anchor: &MessageHash) -> bool {
        self.used_anchors.contains(anchor)
    }

    /// The successor named in a relay's goodbye or obituary.
    pub fn successor_of(&self, number: RelayNumber) -> Option<RelayNumber> {
        self.relay(number)?.successor
    }

    /// The relays that made `number` one of their key quarter holders, with
    /// the quarter it holds for each.
    pub fn key_quarter_sharers(&self, number: RelayNumber) -> Vec<(RelayNumber, usize)> {
        self.relays
            .iter()
            .filter(|r| r.has_distributed_keys())
            .filter_map(|r| {
                r.holders
                    .quarter_holder_position(number)
                    .map(|q| (r.number, q))
            })
            .collect()
    }

    /// A commitment to the whole state, recorded in every obituary.
    pub fn hash(&self) -> MessageHash {
        hash_value(b"relay state", self)
    }

    pub fn process_relay_join(
        &mut self,
        join_hash: MessageHash,
        join: &RelayJoin,
    ) -> Result<RelayNumber, RelayStateError> {
        if self.is_anchor_used(&join.admission_anchor) {
            return Err(RelayStateError::AnchorAlreadyUsed(join.admission_anchor));
        }
        let number = self.latest_relay_number.next();
        self.latest_relay_number = number;
        self.used_anchors.insert(join.admission_anchor);
        self.relays.push(Relay::new(
            number,
            join_hash,
            join.admission_anchor,
            join.public_key_set.clone(),
        ));
        debug!(relay = %number, "relay joined");
        Ok(number)
    }

    /// Record the holders a key distribution was sent to.
    pub fn process_key_distribution(
        &mut self,
        hash: MessageHash,
        distribution: &KeyDistribution,
    ) -> Result<(), RelayStateError> {
        let relay = self.relay_mut_or_err(distribution.relay_number)?;
        if relay.has_distributed_keys() {
            return Err(RelayStateError::HoldersAlreadyAssigned(relay.number));
        }
        relay.holders = distribution.holders.clone();
        relay.hashes.key_distribution = Some(hash);
        Ok(())
    }

    /// Accept a relay's key distribution once nobody complained in time.
    ///
    /// Returns whether the distribution is now accepted.
    pub fn accept_key_distribution(&mut self, number: RelayNumber) -> bool {
        match self.relay_mut(number) {
            Some(relay)
                if !relay.is_dead()
                    && relay.has_distributed_keys()
                    && relay.hashes.key_distribution_complaints.is_empty() =>
            {
                relay.key_distribution_accepted = true;
                true
            }
            _ => false,
        }
    }
}
