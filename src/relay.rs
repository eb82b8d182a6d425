//! The record a node keeps about each relay.
use std::fmt;

use k256::AffinePoint;
use serde::{Deserialize, Serialize};

use crate::{
    constants::{KEY_QUARTER_HOLDERS, KEY_SIXTEENTH_HOLDERS, SIXTEENTHS_PER_QUARTER},
    crypto::{hash_value, MessageHash},
    keysplit::PublicKeySet,
};

/// Identifies a relay.
///
/// Relays are numbered from 1 in the order they join, and numbers are never reused.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct RelayNumber(u64);

impl RelayNumber {
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl From<u64> for RelayNumber {
    fn from(x: u64) -> Self {
        RelayNumber(x)
    }
}

impl From<RelayNumber> for u64 {
    fn from(n: RelayNumber) -> Self {
        n.0
    }
}

impl fmt::Display for RelayNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One of the three groups of relays holding parts of a relay's key.
///
/// Each group receives all sixteen key sixteenths, encrypted separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HolderGroup {
    /// Four relays, each receiving four consecutive sixteenths.
    KeyQuarterHolders,
    /// Sixteen relays, each receiving one sixteenth.
    FirstKeySixteenthHolders,
    SecondKeySixteenthHolders,
}

impl HolderGroup {
    pub const ALL: [HolderGroup; 3] = [
        HolderGroup::KeyQuarterHolders,
        HolderGroup::FirstKeySixteenthHolders,
        HolderGroup::SecondKeySixteenthHolders,
    ];
}

/// The relays holding parts of some relay's key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPartHolders {
    pub key_quarter_holders: Vec<RelayNumber>,
    pub first_set_of_key_sixteenth_holders: Vec<RelayNumber>,
    pub second_set_of_key_sixteenth_holders: Vec<RelayNumber>,
}

impl KeyPartHolders {
    pub fn is_assigned(&self) -> bool {
        self.key_quarter_holders.len() == KEY_QUARTER_HOLDERS
            && self.first_set_of_key_sixteenth_holders.len() == KEY_SIXTEENTH_HOLDERS
            && self.second_set_of_key_sixteenth_holders.len() == KEY_SIXTEENTH_HOLDERS
    }

    pub fn group(&self, group: HolderGroup) -> &[RelayNumber] {
        match group {
            HolderGroup::KeyQuarterHolders => &self.key_quarter_holders,
            HolderGroup::FirstKeySixteenthHolders => &self.first_set_of_key_sixteenth_holders,
            HolderGroup::SecondKeySixteenthHolders => &self.second_set_of_key_sixteenth_holders,
        }
    }

    pub(crate) fn group_mut(&mut self, group: HolderGroup) -> &mut Vec<RelayNumber> {
        match group {
            HolderGroup::KeyQuarterHolders => &mut self.key_quarter_holders,
            HolderGroup::FirstKeySixteenthHolders => &mut self.first_set_of_key_sixteenth_holders,
            HolderGroup::SecondKeySixteenthHolders => &mut self.second_set_of_key_sixteenth_holders,
        }
    }

    /// The relay that receives the key sixteenth at `position` within `group`.
    pub fn recipient(&self, group: HolderGroup, position: usize) -> Option<RelayNumber> {
        let index = match group {
            HolderGroup::KeyQuarterHolders => position / SIXTEENTHS_PER_QUARTER,
            _ => position,
        };
        self.group(group).get(index).copied()
    }

    pub fn contains(&self, relay: RelayNumber) -> bool {
        HolderGroup::ALL
            .iter()
            .any(|g| self.group(*g).contains(&relay))
    }

    pub fn quarter_holder_position(&self, relay: RelayNumber) -> Option<usize> {
        self.key_quarter_holders.iter().position(|n| *n == relay)
    }

    /// Put `new` in the place of `old` among the key quarter holders.
    ///
    /// Key sixteenth holders stay as they are: a successor takes over the
    /// key quarters its predecessor held, nothing else.
    pub fn replace_quarter_holder(&mut self, old: RelayNumber, new: RelayNumber) {
        for n in self.key_quarter_holders.iter_mut() {
            if *n == old {
                *n = new;
            }
        }
    }
}

/// Hashes of the messages that concern a relay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMessageHashes {
    pub join: MessageHash,
    /// The ledger anchor the relay was admitted with.
    pub admission_anchor: MessageHash,
    pub key_distribution: Option<MessageHash>,
    pub goodbye: Option<MessageHash>,
    pub obituary: Option<MessageHash>,
    pub key_distribution_complaints: Vec<MessageHash>,
    pub goodbye_complaints: Vec<MessageHash>,
    pub secret_recoveries: Vec<MessageHash>,
    pub secret_recovery_complaints: Vec<MessageHash>,
    pub secret_recovery_failures: Vec<MessageHash>,
    pub recovery_failure_audits: Vec<MessageHash>,
    pub succession_completed: Vec<MessageHash>,
}

/// A participant in the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relay {
    pub number: RelayNumber,
    pub public_signing_key: AffinePoint,
    pub public_key_set: PublicKeySet,
    pub holders: KeyPartHolders,
    pub hashes: RelayMessageHashes,
    pub key_distribution_accepted: bool,
    /// Who takes over this relay's key parts, once it has left or died.
    pub successor: Option<RelayNumber>,
    /// Obituaries and recoveries this relay still has to act on.
    pub tasks: Vec<MessageHash>,
}

impl Relay {
    pub fn new(
        number: RelayNumber,
        join: MessageHash,
        admission_anchor: MessageHash,
        public_key_set: PublicKeySet,
    ) -> Self {
        Self {
            number,
            public_signing_key: public_key_set.public_signing_key(),
            public_key_set,
            holders: KeyPartHolders::default(),
            hashes: RelayMessageHashes {
                join,
                admission_anchor,
                ..Default::default()
            },
            key_distribution_accepted: false,
            successor: None,
            tasks: Vec::new(),
        }
    }

    pub fn is_dead(&self) -> bool {
        self.hashes.obituary.is_some()
    }

    pub fn has_distributed_keys(&self) -> bool {
        self.hashes.key_distribution.is_some()
    }

    /// The seed from which this relay's successor is chosen.
    ///
    /// Only fields fixed once the keys are distributed go in, so the same
    /// successor comes out whether the relay says goodbye or is declared dead.
    pub fn successor_seed(&self) -> MessageHash {
        hash_value(
            b"successor seed",
            &(
                self.number,
                self.hashes.join,
                self.hashes.admission_anchor,
                self.hashes.key_distribution,
            ),
        )
    }

    pub fn remove_task(&mut self, task: &MessageHash) {
        self.tasks.retain(|t| t != task);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_recipient_of_each_group() {
        let holders = KeyPartHolders {
            key_quarter_holders: (1..=4).map(RelayNumber::from).collect(),
            first_set_of_key_sixteenth_holders: (10..26).map(RelayNumber::from).collect(),
            second_set_of_key_sixteenth_holders: (30..46).map(RelayNumber::from).collect(),
        };
        assert!(holders.is_assigned());
        assert_eq!(
            holders.recipient(HolderGroup::KeyQuarterHolders, 7),
            Some(RelayNumber::from(2))
        );
        assert_eq!(
            holders.recipient(HolderGroup::FirstKeySixteenthHolders, 7),
            Some(RelayNumber::from(17))
        );
        assert_eq!(holders.recipient(HolderGroup::SecondKeySixteenthHolders, 16), None);
    }

    #[test]
    fn test_replacing_a_quarter_holder_leaves_sixteenth_holders() {
        let mut holders = KeyPartHolders {
            key_quarter_holders: vec![1.into(), 2.into()],
            first_set_of_key_sixteenth_holders: vec![3.into()],
            second_set_of_key_sixteenth_holders: vec![2.into()],
        };
        holders.replace_quarter_holder(2.into(), 9.into());
        assert_eq!(holders.quarter_holder_position(9.into()), Some(1));
        assert_eq!(holders.quarter_holder_position(2.into()), None);
        assert_eq!(holders.second_set_of_key_sixteenth_holders, vec![RelayNumber::from(2)]);
    }
}
