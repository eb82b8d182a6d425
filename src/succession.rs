//! Handing a departed relay's key parts over to its successor.
//!
//! A relay leaving of its own accord says goodbye, and its successor either
//! confirms the handover or complains. A relay that dies (or whose goodbye
//! was bad) has its secrets rebuilt by the successor from the shared secret
//! quarters its four key quarter holders send. Disputes about those are
//! settled in public by audits, and whoever turns out to be lying dies.
//!
//! Every relay that should have answered by some deadline and didn't dies
//! too, once a timeout says so (see [crate::timeout]).
use k256::{AffinePoint, ProjectivePoint, Scalar};
use tracing::{debug, info, warn};

use crate::{
    constants::{KEY_QUARTER_HOLDERS, SIXTEENTHS_PER_QUARTER},
    crypto::MessageHash,
    error::Error,
    keysplit::decrypt_with_shared_secret,
    messages::{
        Goodbye, GoodbyeComplaint, KeyDistribution, RecoveryFailureAudit, RelayMessage,
        SecretRecovery, SecretRecoveryComplaint, SecretRecoveryFailure, Signed,
        SuccessionCompleted,
    },
    node::RelayNode,
    relay::{HolderGroup, RelayNumber},
    scheduler::Task,
    state::DeathReason,
    store::{MessageFlag, MessageStoreExt, ResponseKind},
};

/// The outcome of adding up the shared secret quarters of four recovery messages.
enum Recovery {
    /// Key sixteenths to keep.
    Complete(Vec<Scalar>),
    /// This sum didn't unmask the key sixteenth at this sharer and part.
    Failed {
        key_sharer: RelayNumber,
        position: usize,
        sum: AffinePoint,
    },
    /// Something isn't there to work with yet.
    Pending,
}

impl RelayNode {
    /// Leave the network, handing the key parts `relay` holds to its successor.
    pub fn say_goodbye(&mut self, relay: RelayNumber) -> Result<RelayMessage, Error> {
        let leaving = self
            .state
            .relay(relay)
            .ok_or(Error::MissingKeyMaterial(relay))?;
        let content = Goodbye::generate(leaving, &self.state, &*self.keys)?;
        info!(relay = %relay, successor = %content.successor, "saying goodbye");
        self.publish_as(relay, content)
    }

    /// React to a newly written obituary.
    pub(crate) fn on_relay_death(&mut self, obituary_hash: MessageHash) {
        let Some(obituary) = self.messages.obituary(&obituary_hash).cloned() else {
            return;
        };
        if obituary.reason == DeathReason::SaidGoodbye {
            return;
        }
        self.schedule(Task::ObituaryResponseDeadline(obituary_hash));

        let quarter_holders = match self.state.relay(obituary.dead_relay) {
            Some(dead) => dead.holders.key_quarter_holders.clone(),
            None => return,
        };
        for holder in quarter_holders {
            self.respond(obituary_hash, |node| {
                node.send_secret_recovery(obituary_hash, obituary.dead_relay, holder)
            });
        }
    }

    fn send_secret_recovery(
        &mut self,
        obituary: MessageHash,
        dead: RelayNumber,
        quarter_holder: RelayNumber,
    ) -> Result<(), Error> {
        if !self.config.send_secret_recovery_messages || !self.controls(quarter_holder) {
            return Ok(());
        }
        match self.state.relay(quarter_holder) {
            Some(r) if !r.is_dead() => {}
            _ => return Ok(()),
        }
        let recovery =
            SecretRecovery::generate(obituary, dead, quarter_holder, &self.state, &*self.keys)?;
        debug!(relay = %dead, holder = %quarter_holder, "sending secret recovery");
        self.publish_as(quarter_holder, recovery)?;
        Ok(())
    }

    pub(crate) fn on_goodbye(
        &mut self,
        hash: MessageHash,
        goodbye: Signed<Goodbye>,
    ) -> Result<(), Error> {
        let goodbye = goodbye.content;
        self.state.process_goodbye(hash, &goodbye)?;
        self.schedule(Task::GoodbyeResponseDeadline(hash));
        if self.controls(goodbye.successor) {
            self.respond(hash, |node| node.open_goodbye(hash, &goodbye));
        }
        Ok(())
    }

    /// As the successor, take over the key sixteenths a goodbye hands on, or
    /// complain about the first one that doesn't open.
    fn open_goodbye(&mut self, hash: MessageHash, goodbye: &Goodbye) -> Result<(), Error> {
        let mut recovered = Vec::new();
        for (i, (sharer, quarter)) in goodbye
            .key_quarter_sharers
            .iter()
            .zip(goodbye.key_quarter_positions.iter())
            .enumerate()
        {
            for part in 0..SIXTEENTHS_PER_QUARTER {
                let point = self
                    .state
                    .relay(*sharer)
                    .and_then(|s| {
                        s.public_key_set
                            .key_sixteenth(*quarter as usize * SIXTEENTHS_PER_QUARTER + part)
                    })
                    .copied();
                let secret = match (point, self.state.relay(goodbye.successor)) {
                    (Some(point), Some(successor)) => successor.public_key_set.decrypt(
                        &goodbye.encrypted_key_sixteenths[i][part],
                        &point,
                        &*self.keys,
                    ),
                    _ => None,
                };
                match secret {
                    Some(secret) => recovered.push(secret),
                    None => {
                        warn!(relay = %goodbye.dead_relay, sharer = %sharer, part, "bad goodbye");
                        if self.config.send_goodbye_complaints {
                            let complaint = GoodbyeComplaint::generate(
                                hash,
                                goodbye,
                                i,
                                part,
                                &self.state,
                                &*self.keys,
                            )?;
                            self.publish_as(goodbye.successor, complaint)?;
                        }
                        return Ok(());
                    }
                }
            }
        }

        for secret in &recovered {
            self.store_row(secret);
        }
        if self.config.send_succession_completed_messages {
            let completed = SuccessionCompleted {
                dead_relay: goodbye.dead_relay,
                successor: goodbye.successor,
                goodbye: Some(hash),
                secret_recoveries: Vec::new(),
            };
            self.publish_as(goodbye.successor, completed)?;
        }
        Ok(())
    }

    pub(crate) fn on_goodbye_complaint(
        &mut self,
        hash: MessageHash,
        complaint: Signed<GoodbyeComplaint>,
    ) -> Result<(), Error> {
        let goodbye_hash = complaint.content.goodbye;
        let Some(goodbye) = self
            .messages
            .fetch::<Goodbye>(&goodbye_hash)
            .map(|g| g.content.clone())
        else {
            return Ok(());
        };
        warn!(relay = %goodbye.dead_relay, hash = %hash, "goodbye complaint upheld");
        let obituary = self.state.process_goodbye_complaint(
            goodbye_hash,
            hash,
            &goodbye,
            self.config.good_standing_age,
            &mut *self.messages,
        )?;
        self.on_relay_death(obituary);
        Ok(())
    }

    pub(crate) fn on_secret_recovery(
        &mut self,
        hash: MessageHash,
        recovery: Signed<SecretRecovery>,
    ) -> Result<(), Error> {
        let recovery = recovery.content;
        let complete = self
            .state
            .process_secret_recovery(hash, &recovery, &mut *self.messages)?;
        debug!(relay = %recovery.dead_relay, holder = %recovery.quarter_holder, "secret recovery received");
        if complete {
            self.schedule(Task::SuccessionDeadline(hash));
        }
        if self.controls(recovery.successor) {
            self.respond(hash, |node| {
                if node.check_secret_recovery(hash, &recovery)? && complete {
                    node.try_complete_succession(recovery.obituary)?;
                }
                Ok(())
            });
        }
        Ok(())
    }

    /// Check that every shared secret quarter in a recovery message opens,
    /// complaining about the first one that doesn't.
    fn check_secret_recovery(
        &mut self,
        hash: MessageHash,
        recovery: &SecretRecovery,
    ) -> Result<bool, Error> {
        let Some(successor) = self.state.relay(recovery.successor) else {
            return Ok(false);
        };
        for (i, (encrypted, commitments)) in recovery
            .encrypted_shared_secret_quarters
            .iter()
            .zip(recovery.shared_secret_quarter_commitments.iter())
            .enumerate()
        {
            for part in 0..SIXTEENTHS_PER_QUARTER {
                let opened = successor.public_key_set.decrypt_point(
                    &encrypted[part],
                    &commitments[part],
                    &*self.keys,
                );
                if opened.is_some() {
                    continue;
                }
                warn!(holder = %recovery.quarter_holder, sharer_position = i, part, "bad secret recovery");
                if self.config.send_secret_recovery_complaints {
                    let complaint = SecretRecoveryComplaint::generate(
                        hash,
                        recovery,
                        i,
                        part,
                        &self.state,
                        &*self.keys,
                    )?;
                    self.publish_as(recovery.successor, complaint)?;
                }
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Add up the shared secret quarters from the recovery messages for an
    /// obituary, and unmask the key sixteenths the dead relay held.
    fn recover_key_sixteenths(&self, obituary: MessageHash) -> Recovery {
        let recoveries: Vec<&SecretRecovery> = self
            .messages
            .responses(&obituary, ResponseKind::SecretRecoveries)
            .iter()
            .filter_map(|h| self.messages.fetch::<SecretRecovery>(h))
            .map(|r| &r.content)
            .collect();
        if recoveries.len() != KEY_QUARTER_HOLDERS {
            return Recovery::Pending;
        }
        let first = recoveries[0];
        let Some(successor) = self.state.relay(first.successor) else {
            return Recovery::Pending;
        };
        // Key sharers exposed by an audit sent nothing worth recovering.
        let at_fault: Vec<RelayNumber> = self
            .messages
            .responses(&obituary, ResponseKind::SecretRecoveryFailures)
            .iter()
            .filter(|h| self.messages.has_flag(h, MessageFlag::KeySharerAtFault))
            .filter_map(|h| self.messages.fetch::<SecretRecoveryFailure>(h))
            .map(|f| f.content.key_sharer)
            .collect();

        let mut secrets = Vec::new();
        for (sharer_number, quarter) in first
            .key_quarter_sharers
            .iter()
            .copied()
            .zip(first.key_quarter_positions.iter().copied())
        {
            if at_fault.contains(&sharer_number) {
                continue;
            }
            // A sharer that left between two recovery messages is only in
            // some of them, and there is nothing to add up for it.
            if !recoveries.iter().all(|r| r.covers(sharer_number, quarter)) {
                warn!(sharer = %sharer_number, "key sharer missing from some recovery messages");
                continue;
            }
            let Some(sharer) = self.state.relay(sharer_number) else {
                continue;
            };
            let Some(distribution) = sharer
                .hashes
                .key_distribution
                .and_then(|h| self.messages.fetch::<KeyDistribution>(&h))
            else {
                continue;
            };

            for part in 0..SIXTEENTHS_PER_QUARTER {
                let position = quarter as usize * SIXTEENTHS_PER_QUARTER + part;
                let mut sum = ProjectivePoint::IDENTITY;
                for recovery in &recoveries {
                    let opened = recovery
                        .shared_secret_quarter(sharer_number, part)
                        .and_then(|(encrypted, commitment)| {
                            successor
                                .public_key_set
                                .decrypt_point(encrypted, commitment, &*self.keys)
                        });
                    match opened {
                        Some(quarter) => sum += ProjectivePoint::from(quarter),
                        None => return Recovery::Pending,
                    }
                }
                let sum = sum.to_affine();

                let encrypted = distribution
                    .content
                    .secrets(HolderGroup::KeyQuarterHolders)
                    .get(position);
                let point = sharer.public_key_set.key_sixteenth(position);
                let secret = match (encrypted, point) {
                    (Some(e), Some(p)) => decrypt_with_shared_secret(e, p, &sum),
                    _ => None,
                };
                match secret {
                    Some(secret) => secrets.push(secret),
                    None => {
                        return Recovery::Failed {
                            key_sharer: sharer_number,
                            position: part,
                            sum,
                        }
                    }
                }
            }
        }
        Recovery::Complete(secrets)
    }

    fn try_complete_succession(&mut self, obituary_hash: MessageHash) -> Result<(), Error> {
        let Some(obituary) = self.messages.obituary(&obituary_hash).cloned() else {
            return Ok(());
        };
        if !self.controls(obituary.successor) || self.state.relay(obituary.dead_relay).is_none() {
            return Ok(());
        }
        let recoveries = self
            .messages
            .responses(&obituary_hash, ResponseKind::SecretRecoveries);

        match self.recover_key_sixteenths(obituary_hash) {
            Recovery::Pending => Ok(()),
            Recovery::Failed {
                key_sharer,
                position,
                sum,
            } => {
                warn!(relay = %obituary.dead_relay, sharer = %key_sharer, position, "secret recovery failed");
                let failure = SecretRecoveryFailure {
                    obituary: obituary_hash,
                    secret_recoveries: recoveries,
                    key_sharer,
                    position: position as u8,
                    sum_of_shared_secret_quarters: sum,
                };
                self.publish_as(obituary.successor, failure)?;
                Ok(())
            }
            Recovery::Complete(secrets) => {
                for secret in &secrets {
                    self.store_row(secret);
                }
                info!(relay = %obituary.dead_relay, successor = %obituary.successor, recovered = secrets.len(), "secrets recovered");
                if self.config.send_succession_completed_messages {
                    let completed = SuccessionCompleted {
                        dead_relay: obituary.dead_relay,
                        successor: obituary.successor,
                        goodbye: None,
                        secret_recoveries: recoveries,
                    };
                    self.publish_as(obituary.successor, completed)?;
                }
                Ok(())
            }
        }
    }

    pub(crate) fn on_secret_recovery_complaint(
        &mut self,
        hash: MessageHash,
        complaint: Signed<SecretRecoveryComplaint>,
    ) -> Result<(), Error> {
        let recovery_hash = complaint.content.secret_recovery;
        let Some(recovery) = self
            .messages
            .fetch::<SecretRecovery>(&recovery_hash)
            .map(|r| r.content.clone())
        else {
            return Ok(());
        };
        warn!(holder = %recovery.quarter_holder, hash = %hash, "secret recovery complaint upheld");
        let obituary = self.state.process_secret_recovery_complaint(
            recovery_hash,
            hash,
            &recovery,
            self.config.good_standing_age,
            &mut *self.messages,
        )?;
        self.on_relay_death(obituary);
        Ok(())
    }

    pub(crate) fn on_secret_recovery_failure(
        &mut self,
        hash: MessageHash,
        failure: Signed<SecretRecoveryFailure>,
    ) -> Result<(), Error> {
        let failure = failure.content;
        let target = failure.target(&self.state, &*self.messages)?;
        self.state.process_secret_recovery_failure(
            hash,
            &failure,
            target.dead_relay,
            &mut *self.messages,
        )?;
        self.schedule(Task::RecoveryFailureResponseDeadline(hash));
        if !self.config.send_audit_messages {
            return Ok(());
        }

        let auditors: Vec<RelayNumber> = failure
            .secret_recoveries
            .iter()
            .filter_map(|h| self.messages.fetch::<SecretRecovery>(h))
            .map(|r| r.content.quarter_holder)
            .filter(|n| self.controls(*n))
            .collect();
        for auditor in auditors {
            self.respond(hash, |node| {
                let audit = RecoveryFailureAudit::generate(
                    hash,
                    &failure,
                    auditor,
                    &node.state,
                    &*node.messages,
                    &*node.keys,
                )?;
                node.publish_as(auditor, audit)?;
                Ok(())
            });
        }
        Ok(())
    }

    pub(crate) fn on_recovery_failure_audit(
        &mut self,
        hash: MessageHash,
        audit: Signed<RecoveryFailureAudit>,
    ) -> Result<(), Error> {
        let audit = audit.content;
        let Some(failure) = self
            .messages
            .fetch::<SecretRecoveryFailure>(&audit.failure)
            .map(|f| f.content.clone())
        else {
            return Ok(());
        };
        let target = failure.target(&self.state, &*self.messages)?;
        let audits = self.state.process_recovery_failure_audit(
            hash,
            audit.failure,
            target.dead_relay,
            &mut *self.messages,
        )?;
        if self.messages.has_flag(&audit.failure, MessageFlag::Resolved) {
            return Ok(());
        }

        if !audit.is_correct(&failure, &self.state, &*self.messages)? {
            warn!(holder = %audit.quarter_holder, "audit exposed a bad secret recovery");
            self.messages
                .set_flag(audit.failure, MessageFlag::BadQuarterHolderFound);
            self.messages.set_flag(audit.failure, MessageFlag::Resolved);
            return self.discard_recovery_of(
                &failure,
                audit.quarter_holder,
                DeathReason::UnrefutedComplaint,
            );
        }
        if audits.len() < KEY_QUARTER_HOLDERS {
            return Ok(());
        }

        // Four correct audits: either the successor lied about the sum, or
        // the key sharer sent a bad key sixteenth in the first place.
        let sum = audits
            .iter()
            .filter_map(|h| self.messages.fetch::<RecoveryFailureAudit>(h))
            .fold(ProjectivePoint::IDENTITY, |acc, a| {
                acc + a.content.shared_secret_quarter(&target.point)
            })
            .to_affine();
        self.messages.set_flag(audit.failure, MessageFlag::Resolved);
        if sum != failure.sum_of_shared_secret_quarters {
            warn!(successor = %target.successor, "recovery failure refuted");
            let obituary = self.state.process_complaint_refutation(
                target.successor,
                self.config.good_standing_age,
                &mut *self.messages,
            )?;
            self.on_relay_death(obituary);
            Ok(())
        } else {
            warn!(sharer = %target.key_sharer, "recovery failure upheld");
            self.messages
                .set_flag(audit.failure, MessageFlag::KeySharerAtFault);
            self.kill(target.key_sharer, DeathReason::UnrefutedComplaint)?;
            self.respond(hash, |node| node.try_complete_succession(failure.obituary));
            Ok(())
        }
    }

    /// Kill a quarter holder at fault in a failed recovery, throwing out its
    /// recovery message so that its successor can send another.
    pub(crate) fn discard_recovery_of(
        &mut self,
        failure: &SecretRecoveryFailure,
        quarter_holder: RelayNumber,
        reason: DeathReason,
    ) -> Result<(), Error> {
        let Some((recovery_hash, recovery)) = failure
            .recovery_from(quarter_holder, &*self.messages)
            .map(|(h, r)| (h, r.clone()))
        else {
            return Ok(());
        };
        if self
            .state
            .relay(quarter_holder)
            .map_or(true, |r| r.is_dead())
        {
            return Ok(());
        }
        let obituary = self.state.process_faulty_recovery(
            recovery_hash,
            &recovery,
            reason,
            self.config.good_standing_age,
            &mut *self.messages,
        )?;
        self.on_relay_death(obituary);
        Ok(())
    }

    pub(crate) fn on_succession_completed(
        &mut self,
        hash: MessageHash,
        completed: Signed<SuccessionCompleted>,
    ) -> Result<(), Error> {
        let completed = completed.content;
        self.state.process_succession_completed(
            hash,
            &completed,
            self.config.good_standing_age,
            &mut *self.messages,
        )?;
        info!(relay = %completed.dead_relay, successor = %completed.successor, "succession completed");
        self.take_over_tasks(completed.successor);
        Ok(())
    }

    /// Act on the obituaries a successor inherited, in place of the quarter
    /// holder it replaced.
    fn take_over_tasks(&mut self, heir: RelayNumber) {
        let tasks = match self.state.relay(heir) {
            Some(r) => r.tasks.clone(),
            None => return,
        };
        for task in tasks {
            let Some(obituary) = self.messages.obituary(&task).cloned() else {
                continue;
            };
            let is_quarter_holder = self
                .state
                .relay(obituary.dead_relay)
                .map_or(false, |d| d.holders.quarter_holder_position(heir).is_some());
            if !is_quarter_holder {
                continue;
            }
            self.schedule(Task::ObituaryResponseDeadline(task));
            self.respond(task, |node| {
                node.send_secret_recovery(task, obituary.dead_relay, heir)
            });
        }
    }
}
