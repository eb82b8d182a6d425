//! Death, succession and departure of relays.
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::RelayState;
use crate::{
    crypto::{hash_value, MessageHash},
    error::RelayStateError,
    messages::{Goodbye, SecretRecovery, SecretRecoveryFailure, SuccessionCompleted},
    relay::RelayNumber,
    store::{MessageStore, Record, ResponseKind},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeathReason {
    SaidGoodbye,
    NotResponding,
    /// A complaint against the relay was upheld.
    UnrefutedComplaint,
    /// A complaint the relay made turned out to be false.
    RefutedComplaint,
}

/// The record of a relay's death, written once and never changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Obituary {
    pub dead_relay: RelayNumber,
    /// The state of the network the moment the relay died.
    pub relay_state_hash: MessageHash,
    pub successor: RelayNumber,
    pub reason: DeathReason,
    pub in_good_standing: bool,
}

impl Obituary {
    pub fn hash(&self) -> MessageHash {
        hash_value(b"obituary", self)
    }
}

impl RelayState {
    /// Declare a relay dead, choosing its successor.
    ///
    /// The obituary goes into the message store, and the relay's key quarter
    /// holders are given the task of recovering its secrets.
    pub fn record_relay_death(
        &mut self,
        dead: RelayNumber,
        reason: DeathReason,
        good_standing_age: u64,
        messages: &mut dyn MessageStore,
    ) -> Result<MessageHash, RelayStateError> {
        let successor = match self.successor_of(dead) {
            Some(successor) => successor,
            None => self.assign_successor(dead, self.latest_relay_number)?,
        };
        self.write_obituary(dead, successor, reason, good_standing_age, messages)
    }

    fn write_obituary(
        &mut self,
        dead: RelayNumber,
        successor: RelayNumber,
        reason: DeathReason,
        good_standing_age: u64,
        messages: &mut dyn MessageStore,
    ) -> Result<MessageHash, RelayStateError> {
        let relay_state_hash = self.hash();
        let latest = self.latest_relay_number;
        let relay = self.relay_mut_or_err(dead)?;
        if relay.is_dead() {
            return Err(RelayStateError::AlreadyDead(dead));
        }

        let obituary = Obituary {
            dead_relay: dead,
            relay_state_hash,
            successor,
            reason,
            in_good_standing: reason == DeathReason::SaidGoodbye
                && latest.value().saturating_sub(dead.value()) > good_standing_age,
        };
        let hash = messages.insert(Record::Obituary(obituary.clone()));
        relay.hashes.obituary = Some(hash);
        relay.successor = Some(successor);

        info!(relay = %dead, successor = %successor, reason = ?reason, hash = %hash, "relay died");
        self.process_obituary(hash, &obituary);
        Ok(hash)
    }

    /// Hand the recovery of a dead relay's secrets to its key quarter holders.
    pub fn process_obituary(&mut self, hash: MessageHash, obituary: &Obituary) {
        if obituary.reason == DeathReason::SaidGoodbye {
            return;
        }
        let quarter_holders = match self.relay(obituary.dead_relay) {
            Some(relay) => relay.holders.key_quarter_holders.clone(),
            None => return,
        };
        for holder in quarter_holders {
            if let Some(relay) = self.relay_mut(holder) {
                if !relay.tasks.contains(&hash) {
                    relay.tasks.push(hash);
                }
            }
        }
    }

    /// A complaint against a key distribution was upheld: the sharer dies.
    ///
    /// Every complaint is recorded, but only the first one kills. Returns the
    /// obituary if this complaint wrote one.
    pub fn process_key_distribution_complaint(
        &mut self,
        complaint_hash: MessageHash,
        sharer: RelayNumber,
        good_standing_age: u64,
        messages: &mut dyn MessageStore,
    ) -> Result<Option<MessageHash>, RelayStateError> {
        let relay = self.relay_mut_or_err(sharer)?;
        if let Some(distribution) = relay.hashes.key_distribution {
            messages.add_response(
                distribution,
                ResponseKind::KeyDistributionComplaints,
                complaint_hash,
            );
        }
        if !relay.hashes.key_distribution_complaints.contains(&complaint_hash) {
            relay.hashes.key_distribution_complaints.push(complaint_hash);
        }
        if relay.is_dead() {
            return Ok(None);
        }
        self.record_relay_death(
            sharer,
            DeathReason::UnrefutedComplaint,
            good_standing_age,
            messages,
        )
        .map(Some)
    }

    /// A relay complained falsely, as shown by the audits answering it.
    pub fn process_complaint_refutation(
        &mut self,
        complainer: RelayNumber,
        good_standing_age: u64,
        messages: &mut dyn MessageStore,
    ) -> Result<MessageHash, RelayStateError> {
        self.record_relay_death(
            complainer,
            DeathReason::RefutedComplaint,
            good_standing_age,
            messages,
        )
    }

    pub fn process_goodbye(
        &mut self,
        hash: MessageHash,
        goodbye: &Goodbye,
    ) -> Result<(), RelayStateError> {
        let relay = self.relay_mut_or_err(goodbye.dead_relay)?;
        relay.hashes.goodbye = Some(hash);
        relay.successor = Some(goodbye.successor);
        debug!(relay = %goodbye.dead_relay, successor = %goodbye.successor, "relay said goodbye");
        Ok(())
    }

    /// The successor couldn't open the goodbye: the leaving relay is treated
    /// as dead, and its secrets are recovered the hard way.
    pub fn process_goodbye_complaint(
        &mut self,
        goodbye_hash: MessageHash,
        complaint_hash: MessageHash,
        goodbye: &Goodbye,
        good_standing_age: u64,
        messages: &mut dyn MessageStore,
    ) -> Result<MessageHash, RelayStateError> {
        let relay = self.relay_mut_or_err(goodbye.dead_relay)?;
        relay.hashes.goodbye_complaints.push(complaint_hash);
        messages.add_response(goodbye_hash, ResponseKind::GoodbyeComplaints, complaint_hash);
        self.write_obituary(
            goodbye.dead_relay,
            goodbye.successor,
            DeathReason::UnrefutedComplaint,
            good_standing_age,
            messages,
        )
    }

    /// Record a recovery message.
    ///
    /// Returns true once the fourth quarter holder has sent theirs.
    pub fn process_secret_recovery(
        &mut self,
        hash: MessageHash,
        recovery: &SecretRecovery,
        messages: &mut dyn MessageStore,
    ) -> Result<bool, RelayStateError> {
        let dead = self.relay_mut_or_err(recovery.dead_relay)?;
        dead.hashes.secret_recoveries.push(hash);
        messages.add_response(recovery.obituary, ResponseKind::SecretRecoveries, hash);
        if let Some(holder) = self.relay_mut(recovery.quarter_holder) {
            holder.remove_task(&recovery.obituary);
        }
        Ok(messages
            .responses(&recovery.obituary, ResponseKind::SecretRecoveries)
            .len()
            == crate::constants::KEY_QUARTER_HOLDERS)
    }

    /// Throw out a recovery message whose sender turned out to be faulty.
    ///
    /// The sender gets its task back, to be inherited by its successor.
    fn discard_secret_recovery(
        &mut self,
        hash: MessageHash,
        recovery: &SecretRecovery,
        messages: &mut dyn MessageStore,
    ) {
        if let Some(dead) = self.relay_mut(recovery.dead_relay) {
            dead.hashes.secret_recoveries.retain(|h| *h != hash);
        }
        messages.remove_response(&recovery.obituary, ResponseKind::SecretRecoveries, &hash);
        if let Some(holder) = self.relay_mut(recovery.quarter_holder) {
            if !holder.tasks.contains(&recovery.obituary) {
                holder.tasks.push(recovery.obituary);
            }
        }
    }

    /// A shared secret quarter didn't decrypt: its sender dies.
    pub fn process_secret_recovery_complaint(
        &mut self,
        recovery_hash: MessageHash,
        complaint_hash: MessageHash,
        recovery: &SecretRecovery,
        good_standing_age: u64,
        messages: &mut dyn MessageStore,
    ) -> Result<MessageHash, RelayStateError> {
        let dead = self.relay_mut_or_err(recovery.dead_relay)?;
        dead.hashes.secret_recovery_complaints.push(complaint_hash);
        messages.add_response(
            recovery_hash,
            ResponseKind::SecretRecoveryComplaints,
            complaint_hash,
        );
        self.discard_secret_recovery(recovery_hash, recovery, messages);
        self.record_relay_death(
            recovery.quarter_holder,
            DeathReason::UnrefutedComplaint,
            good_standing_age,
            messages,
        )
    }

    pub fn process_secret_recovery_failure(
        &mut self,
        hash: MessageHash,
        failure: &SecretRecoveryFailure,
        dead_relay: RelayNumber,
        messages: &mut dyn MessageStore,
    ) -> Result<(), RelayStateError> {
        let dead = self.relay_mut_or_err(dead_relay)?;
        dead.hashes.secret_recovery_failures.push(hash);
        messages.add_response(failure.obituary, ResponseKind::SecretRecoveryFailures, hash);
        Ok(())
    }

    /// Record an audit. Returns the audits of the failure so far.
    pub fn process_recovery_failure_audit(
        &mut self,
        hash: MessageHash,
        failure_hash: MessageHash,
        dead_relay: RelayNumber,
        messages: &mut dyn MessageStore,
    ) -> Result<Vec<MessageHash>, RelayStateError> {
        let dead = self.relay_mut_or_err(dead_relay)?;
        dead.hashes.recovery_failure_audits.push(hash);
        messages.add_response(failure_hash, ResponseKind::RecoveryFailureAudits, hash);
        Ok(messages.responses(&failure_hash, ResponseKind::RecoveryFailureAudits))
    }

    /// A quarter holder was exposed by its audit, or never sent one.
    pub fn process_faulty_recovery(
        &mut self,
        recovery_hash: MessageHash,
        recovery: &SecretRecovery,
        reason: DeathReason,
        good_standing_age: u64,
        messages: &mut dyn MessageStore,
    ) -> Result<MessageHash, RelayStateError> {
        self.discard_secret_recovery(recovery_hash, recovery, messages);
        self.record_relay_death(recovery.quarter_holder, reason, good_standing_age, messages)
    }

    /// The successor has everything: the departed relay goes away for good.
    pub fn process_succession_completed(
        &mut self,
        hash: MessageHash,
        completed: &SuccessionCompleted,
        good_standing_age: u64,
        messages: &mut dyn MessageStore,
    ) -> Result<(), RelayStateError> {
        let dead = self.relay_mut_or_err(completed.dead_relay)?;
        dead.hashes.succession_completed.push(hash);
        let obituary = dead.hashes.obituary;

        match completed.goodbye {
            Some(goodbye) => {
                messages.add_response(goodbye, ResponseKind::SuccessionCompleted, hash);
                self.write_obituary(
                    completed.dead_relay,
                    completed.successor,
                    DeathReason::SaidGoodbye,
                    good_standing_age,
                    messages,
                )?;
            }
            None => {
                if let Some(obituary) = obituary {
                    messages.add_response(obituary, ResponseKind::SuccessionCompleted, hash);
                }
            }
        }
        self.process_relay_exit(completed.dead_relay)
    }

    /// Pass a departed relay's unfinished tasks to its successor, then remove it.
    pub fn process_relay_exit(&mut self, number: RelayNumber) -> Result<(), RelayStateError> {
        let relay = self
            .relay(number)
            .ok_or(RelayStateError::NoSuchRelay(number))?;
        let successor = relay.successor.ok_or(RelayStateError::NotDead(number))?;
        let tasks = relay.tasks.clone();

        let heir = self.relay_mut_or_err(successor)?;
        for task in tasks {
            if !heir.tasks.contains(&task) {
                heir.tasks.push(task);
            }
        }
        self.remove_relay(number, successor)
    }

    /// Delete a relay, putting its successor in its place wherever it held a key quarter.
    pub fn remove_relay(
        &mut self,
        number: RelayNumber,
        successor: RelayNumber,
    ) -> Result<(), RelayStateError> {
        let index = self
            .index_of(number)
            .ok_or(RelayStateError::NoSuchRelay(number))?;
        self.relays.remove(index);
        for relay in &mut self.relays {
            relay.holders.replace_quarter_holder(number, successor);
        }
        info!(relay = %number, successor = %successor, "relay removed");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::{
        crypto::hash_value, relay::HolderGroup, state::selection::test::state_with_relays,
        store::{MemoryMessageStore, MessageStoreExt},
    };

    fn distribute(state: &mut RelayState, n: u64) {
        let anchor = hash_value(b"test", &n);
        let holders = state.assign_key_part_holders(n.into(), &anchor, 40.into()).unwrap();
        let relay = state.relay_mut(n.into()).unwrap();
        relay.holders = holders;
        relay.hashes.key_distribution = Some(hash_value(b"kd", &n));
    }

    #[test]
    fn test_death_hands_tasks_to_quarter_holders() {
        let mut state = state_with_relays(40);
        distribute(&mut state, 1);
        let mut messages = MemoryMessageStore::new();

        let hash = state
            .record_relay_death(1.into(), DeathReason::NotResponding, 1440, &mut messages)
            .unwrap();
        let obituary = messages.obituary(&hash).unwrap().clone();
        assert_eq!(obituary.dead_relay, RelayNumber::from(1));
        assert!(!obituary.in_good_standing);

        let relay = state.relay(1.into()).unwrap();
        assert!(relay.is_dead());
        assert_eq!(relay.successor, Some(obituary.successor));
        for holder in &relay.holders.key_quarter_holders {
            assert_eq!(state.relay(*holder).unwrap().tasks, vec![hash]);
        }

        assert_eq!(
            state.record_relay_death(1.into(), DeathReason::NotResponding, 1440, &mut messages),
            Err(RelayStateError::AlreadyDead(1.into()))
        );
    }

    #[test]
    fn test_exit_rewires_holders_and_moves_tasks() {
        let mut state = state_with_relays(40);
        distribute(&mut state, 1);
        let mut messages = MemoryMessageStore::new();

        let quarter_holder = state.relay(1.into()).unwrap().holders.key_quarter_holders[0];
        let sixteenth_holder =
            state.relay(1.into()).unwrap().holders.first_set_of_key_sixteenth_holders[0];

        let hash = state
            .record_relay_death(1.into(), DeathReason::NotResponding, 1440, &mut messages)
            .unwrap();
        let dying = state.relay(quarter_holder).unwrap().clone();
        assert_eq!(dying.tasks, vec![hash]);

        let successor = state.assign_successor(quarter_holder, 40.into()).unwrap();
        state
            .record_relay_death(quarter_holder, DeathReason::NotResponding, 1440, &mut messages)
            .unwrap();
        state.process_relay_exit(quarter_holder).unwrap();

        assert!(state.relay(quarter_holder).is_none());
        assert!(state.relay(successor).unwrap().tasks.contains(&hash));
        let holders = &state.relay(1.into()).unwrap().holders;
        assert_eq!(holders.key_quarter_holders[0], successor);
        assert_eq!(
            holders.group(HolderGroup::FirstKeySixteenthHolders)[0],
            sixteenth_holder
        );
    }

    #[test]
    fn test_succession_keeps_holder_groups_apart() {
        let mut state = state_with_relays(40);
        for n in 1..=37 {
            distribute(&mut state, n);
        }
        let mut messages = MemoryMessageStore::new();
        let before = state.clone();

        let dead = state.relay(1.into()).unwrap().holders.key_quarter_holders[2];
        let successor = state.assign_successor(dead, 40.into()).unwrap();
        state
            .record_relay_death(dead, DeathReason::NotResponding, 1440, &mut messages)
            .unwrap();
        state.process_relay_exit(dead).unwrap();

        for relay in state.relays() {
            let old = &before.relay(relay.number).unwrap().holders;
            let new = &relay.holders;
            assert_eq!(
                new.first_set_of_key_sixteenth_holders,
                old.first_set_of_key_sixteenth_holders
            );
            assert_eq!(
                new.second_set_of_key_sixteenth_holders,
                old.second_set_of_key_sixteenth_holders
            );
            for (now, was) in new.key_quarter_holders.iter().zip(&old.key_quarter_holders) {
                let expected = if *was == dead { successor } else { *was };
                assert_eq!(*now, expected);
            }

            assert!(!new.contains(relay.number));
            let mut quarters = new.key_quarter_holders.clone();
            quarters.sort();
            quarters.dedup();
            assert_eq!(quarters.len(), new.key_quarter_holders.len());
            assert!(!quarters.contains(&dead));
        }
    }

    #[test]
    fn test_goodbye_completion_removes_relay() {
        let mut state = state_with_relays(40);
        let mut messages = MemoryMessageStore::new();
        let successor = state.assign_successor(2.into(), 40.into()).unwrap();
        let goodbye = Goodbye {
            dead_relay: 2.into(),
            successor,
            newest_relay: 40.into(),
            key_quarter_sharers: Vec::new(),
            key_quarter_positions: Vec::new(),
            encrypted_key_sixteenths: Vec::new(),
        };
        let goodbye_hash = hash_value(b"goodbye", &2u8);
        state.process_goodbye(goodbye_hash, &goodbye).unwrap();

        let completed = SuccessionCompleted {
            dead_relay: 2.into(),
            successor,
            goodbye: Some(goodbye_hash),
            secret_recoveries: Vec::new(),
        };
        state
            .process_succession_completed(hash_value(b"done", &2u8), &completed, 10, &mut messages)
            .unwrap();
        assert!(state.relay(2.into()).is_none());
        assert_eq!(
            messages
                .responses(&goodbye_hash, ResponseKind::SuccessionCompleted)
                .len(),
            1
        );
    }
}
