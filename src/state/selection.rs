//! Deterministic choice of key part holders and successors.
use tracing::debug;

use super::RelayState;
use crate::{
    constants::{
        KEY_QUARTER_HOLDERS, KEY_SIXTEENTH_HOLDERS, MAX_SELECTION_ATTEMPTS,
        MINIMUM_LATER_JOINERS_FOR_ASSIGNMENT, MINIMUM_OTHER_RELAYS_FOR_ASSIGNMENT,
    },
    crypto::{sha256_parts, HashChain, MessageHash},
    error::RelayStateError,
    relay::{HolderGroup, KeyPartHolders, Relay, RelayNumber},
};

/// Draws candidates from a hash chain until one passes a test.
struct Picker {
    chain: HashChain,
}

impl Picker {
    fn pick(
        &mut self,
        candidates: &[RelayNumber],
        mut acceptable: impl FnMut(RelayNumber) -> bool,
    ) -> Option<RelayNumber> {
        if candidates.is_empty() {
            return None;
        }
        for _ in 0..MAX_SELECTION_ATTEMPTS {
            let index = self.chain.advance().modulo(candidates.len());
            let candidate = candidates[index];
            if acceptable(candidate) {
                return Some(candidate);
            }
        }
        None
    }
}

impl RelayState {
    /// Relays up to `newest` that can take on new responsibilities.
    fn available(&self, newest: RelayNumber) -> impl Iterator<Item = &Relay> {
        self.relays
            .iter()
            .take_while(move |r| r.number <= newest)
            .filter(|r| !r.is_dead() && r.hashes.goodbye.is_none())
    }

    pub fn enough_relays_for_assignment(&self, number: RelayNumber, newest: RelayNumber) -> bool {
        let others = self.available(newest).filter(|r| r.number != number).count();
        let later = self.available(newest).filter(|r| r.number > number).count();
        others >= MINIMUM_OTHER_RELAYS_FOR_ASSIGNMENT
            && later >= MINIMUM_LATER_JOINERS_FOR_ASSIGNMENT
    }

    /// Choose the holders of a relay's key parts.
    ///
    /// Only relays up to `newest` are considered, so that relays joining while
    /// the distribution is in flight don't change the outcome.
    ///
    /// The choice is seeded by the encoding anchor and the relay's number. One
    /// holder in each group is drawn from relays that joined after this one, so
    /// that a relay's key can't end up entirely with relays that were there
    /// before it. Nobody holds two parts of the same key, and nobody becomes a
    /// key quarter holder of one of its own key quarter holders.
    pub fn assign_key_part_holders(
        &self,
        number: RelayNumber,
        encoding_anchor: &MessageHash,
        newest: RelayNumber,
    ) -> Result<KeyPartHolders, RelayStateError> {
        if self.relay(number).is_none() {
            return Err(RelayStateError::NoSuchRelay(number));
        }
        if !self.enough_relays_for_assignment(number, newest) {
            return Err(RelayStateError::NotEnoughRelays(number));
        }

        let others: Vec<RelayNumber> = self
            .available(newest)
            .map(|r| r.number)
            .filter(|n| *n != number)
            .collect();
        let later: Vec<RelayNumber> = others.iter().copied().filter(|n| *n > number).collect();

        let seed = sha256_parts(&[encoding_anchor.as_ref(), &number.value().to_be_bytes()]);
        let mut picker = Picker {
            chain: HashChain::new(seed),
        };
        let mut holders = KeyPartHolders::default();

        let mut draw = |holders: &mut KeyPartHolders,
                        group: HolderGroup,
                        pool: &[RelayNumber]|
         -> Result<(), RelayStateError> {
            let picked = picker
                .pick(pool, |candidate| {
                    if holders.contains(candidate) {
                        return false;
                    }
                    match group {
                        HolderGroup::KeyQuarterHolders => self
                            .relay(candidate)
                            .map_or(false, |c| c.holders.quarter_holder_position(number).is_none()),
                        _ => true,
                    }
                })
                .ok_or(RelayStateError::NoSuitableHolder(number))?;
            holders.group_mut(group).push(picked);
            Ok(())
        };

        for group in HolderGroup::ALL {
            draw(&mut holders, group, &later)?;
        }
        for _ in 1..KEY_QUARTER_HOLDERS {
            draw(&mut holders, HolderGroup::KeyQuarterHolders, &others)?;
        }
        for group in [
            HolderGroup::FirstKeySixteenthHolders,
            HolderGroup::SecondKeySixteenthHolders,
        ] {
            for _ in 1..KEY_SIXTEENTH_HOLDERS {
                draw(&mut holders, group, &others)?;
            }
        }

        debug!(relay = %number, "assigned key part holders");
        Ok(holders)
    }

    /// Choose who takes over a relay's key parts when it leaves or dies.
    ///
    /// The successor mustn't already be involved with the relay's key, or with
    /// the keys of the relays it holds a quarter of: after the succession it
    /// takes the relay's place in their holder lists, and it can't appear there
    /// twice or end up holding a quarter of its own key.
    pub fn assign_successor(
        &self,
        number: RelayNumber,
        newest: RelayNumber,
    ) -> Result<RelayNumber, RelayStateError> {
        let relay = self
            .relay(number)
            .ok_or(RelayStateError::NoSuchRelay(number))?;
        let sharers: Vec<&Relay> = self
            .key_quarter_sharers(number)
            .into_iter()
            .filter_map(|(n, _)| self.relay(n))
            .collect();

        let candidates: Vec<RelayNumber> = self
            .available(newest)
            .map(|r| r.number)
            .filter(|n| *n != number)
            .collect();

        let seed = relay.successor_seed();
        let mut picker = Picker {
            chain: HashChain::from_message_hash(&seed),
        };
        picker
            .pick(&candidates, |candidate| {
                let Some(c) = self.relay(candidate) else {
                    return false;
                };
                relay.holders.quarter_holder_position(candidate).is_none()
                    && c.holders.quarter_holder_position(number).is_none()
                    && sharers.iter().all(|s| {
                        s.number != candidate
                            && s.holders.quarter_holder_position(candidate).is_none()
                            && c.holders.quarter_holder_position(s.number).is_none()
                    })
            })
            .ok_or(RelayStateError::NoSuitableSuccessor(number))
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    use proptest::prelude::*;
    use rand_core::OsRng;

    use crate::{
        crypto::hash_value, keysplit::PublicKeySet, keystore::MemoryKeyStore,
        messages::RelayJoin,
    };

    /// A state with `n` joined relays, none of which has distributed keys.
    pub(crate) fn state_with_relays(n: u64) -> RelayState {
        let mut keys = MemoryKeyStore::new();
        let set = PublicKeySet::generate(&mut OsRng, &mut keys);
        let mut state = RelayState::new();
        for i in 0..n {
            let join = RelayJoin {
                admission_anchor: hash_value(b"test anchor", &i),
                public_key_set: set.clone(),
            };
            state
                .process_relay_join(hash_value(b"test join", &i), &join)
                .unwrap();
        }
        state
    }

    fn all_holders(holders: &KeyPartHolders) -> Vec<RelayNumber> {
        HolderGroup::ALL
            .iter()
            .flat_map(|g| holders.group(*g).iter().copied())
            .collect()
    }

    #[test]
    fn test_not_enough_relays() {
        let state = state_with_relays(37);
        let anchor = hash_value(b"test", &0u8);
        // Relay 35 has only two later joiners.
        assert_eq!(
            state.assign_key_part_holders(35.into(), &anchor, state.latest_relay_number()),
            Err(RelayStateError::NotEnoughRelays(35.into()))
        );
        assert!(state.assign_key_part_holders(34.into(), &anchor, state.latest_relay_number()).is_ok());

        let state = state_with_relays(36);
        assert_eq!(
            state.assign_key_part_holders(1.into(), &anchor, state.latest_relay_number()),
            Err(RelayStateError::NotEnoughRelays(1.into()))
        );
    }

    #[test]
    fn test_assignment_is_deterministic() {
        let state = state_with_relays(45);
        let anchor = hash_value(b"test", &0u8);
        let a = state.assign_key_part_holders(10.into(), &anchor, 45.into()).unwrap();
        let b = state.assign_key_part_holders(10.into(), &anchor, 45.into()).unwrap();
        assert_eq!(a, b);

        let other_anchor = hash_value(b"test", &1u8);
        let c = state
            .assign_key_part_holders(10.into(), &other_anchor, 45.into())
            .unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_quarter_holders_are_not_mutual() {
        let mut state = state_with_relays(45);
        let anchor = hash_value(b"test", &0u8);
        let first = state.assign_key_part_holders(1.into(), &anchor, 45.into()).unwrap();
        state.relay_mut(1.into()).unwrap().holders = first.clone();
        state.relay_mut(1.into()).unwrap().hashes.key_distribution = Some(anchor);

        // The last three relays can't have holders assigned yet.
        for &q in first.key_quarter_holders.iter().filter(|q| q.value() <= 42) {
            let theirs = state.assign_key_part_holders(q, &anchor, 45.into()).unwrap();
            assert!(!theirs.key_quarter_holders.contains(&1.into()));
        }
    }

    #[test]
    fn test_successor_avoids_conflicts() {
        let mut state = state_with_relays(45);
        let anchor = hash_value(b"test", &0u8);
        for n in 1..=5u64 {
            let holders = state.assign_key_part_holders(n.into(), &anchor, 45.into()).unwrap();
            let relay = state.relay_mut(n.into()).unwrap();
            relay.holders = holders;
            relay.hashes.key_distribution = Some(hash_value(b"kd", &n));
        }

        for n in 1..=45u64 {
            let number = RelayNumber::from(n);
            let successor = state.assign_successor(number, 45.into()).unwrap();
            assert_eq!(successor, state.assign_successor(number, 45.into()).unwrap());
            assert_ne!(successor, number);
            let relay = state.relay(number).unwrap();
            assert!(!relay.holders.key_quarter_holders.contains(&successor));
            for (sharer, _) in state.key_quarter_sharers(number) {
                assert_ne!(sharer, successor);
                let sharer = state.relay(sharer).unwrap();
                assert!(!sharer.holders.key_quarter_holders.contains(&successor));
            }
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_holders_are_distinct_and_exclude_the_relay(
            extra in 0u64..12,
            target_offset in 0u64..30,
            anchor_seed in any::<u64>(),
        ) {
            let n = 37 + extra;
            let state = state_with_relays(n);
            let target = RelayNumber::from(1 + target_offset.min(n - 4));
            let anchor = hash_value(b"prop anchor", &anchor_seed);

            let holders = state.assign_key_part_holders(target, &anchor, n.into()).unwrap();
            prop_assert!(holders.is_assigned());

            let all = all_holders(&holders);
            let mut sorted = all.clone();
            sorted.sort();
            sorted.dedup();
            prop_assert_eq!(sorted.len(), all.len());
            prop_assert!(!all.contains(&target));

            for group in HolderGroup::ALL {
                prop_assert!(holders.group(group).iter().any(|h| *h > target));
            }
        }
    }
}
