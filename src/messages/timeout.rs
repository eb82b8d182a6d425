//! Messages saying that an answer didn't come in time.
//!
//! A node waiting on an answer checks, once the response wait time is over,
//! whether it came. If it didn't, the node says so to the network, and the
//! timeout takes effect when it comes back in the common order of messages,
//! like any other message. A node replaying the log therefore goes through
//! the same deaths and acceptances as the nodes that lived through them.
//!
//! A timeout is checked against the state at its place in that order, never
//! against a clock: the ordering layer is trusted not to let one through
//! before its time.
use serde::{Deserialize, Serialize};

use super::{
    Goodbye, KeyDistribution, RecoveryFailureAudit, RelayMessage, SecretRecovery,
    SecretRecoveryFailure, Validate, ValidationContext,
};
use crate::{
    constants::KEY_QUARTER_HOLDERS,
    crypto::MessageHash,
    error::ValidationError,
    relay::{Relay, RelayNumber},
    state::DeathReason,
    store::{MessageFlag, MessageStoreExt, Record, ResponseKind},
};

fn relay<'a>(
    context: &'a ValidationContext<'_>,
    number: RelayNumber,
) -> Result<&'a Relay, ValidationError> {
    context
        .state
        .relay(number)
        .ok_or(ValidationError::UnknownRelay(number))
}

fn alive<'a>(
    context: &'a ValidationContext<'_>,
    number: RelayNumber,
) -> Result<&'a Relay, ValidationError> {
    let relay = relay(context, number)?;
    if relay.is_dead() {
        return Err(ValidationError::RelayIsDead(number));
    }
    Ok(relay)
}

/// What an accepted timeout does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Nobody complained about the key distribution of this relay.
    AcceptKeyDistribution(RelayNumber),
    /// This relay should have answered, and dies.
    Kill(RelayNumber),
    /// A key quarter holder didn't audit its part of a failed recovery. It
    /// dies, and its recovery message is thrown out.
    DiscardRecovery {
        failure: MessageHash,
        quarter_holder: RelayNumber,
    },
}

/// Nobody answered `message`.
///
/// After a key distribution, nobody complained, and the distribution is
/// accepted. After a goodbye, or after the fourth recovery message for a
/// dead relay, the successor did nothing, and dies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationWithoutResponse {
    pub message: MessageHash,
}

impl DurationWithoutResponse {
    pub fn dependencies(&self) -> Vec<MessageHash> {
        vec![self.message]
    }

    pub fn effect(&self, context: &ValidationContext<'_>) -> Result<Timeout, ValidationError> {
        let hash = self.message;
        match context.messages.get(&hash) {
            Some(Record::Message(RelayMessage::KeyDistribution(d))) => {
                unanswered_key_distribution(context, hash, &d.content)
            }
            Some(Record::Message(RelayMessage::Goodbye(g))) => {
                unanswered_goodbye(context, hash, &g.content)
            }
            Some(Record::Message(RelayMessage::SecretRecovery(r))) => {
                unanswered_recoveries(context, hash, &r.content)
            }
            Some(_) => Err(ValidationError::NotAwaitingResponse(hash)),
            None => Err(ValidationError::UnknownMessage(hash)),
        }
    }
}

impl Validate for DurationWithoutResponse {
    fn validate(&self, context: &ValidationContext<'_>) -> Result<(), ValidationError> {
        self.effect(context).map(|_| ())
    }
}

fn unanswered_key_distribution(
    context: &ValidationContext<'_>,
    hash: MessageHash,
    distribution: &KeyDistribution,
) -> Result<Timeout, ValidationError> {
    let sharer = alive(context, distribution.relay_number)?;
    if sharer.hashes.key_distribution != Some(hash) {
        return Err(ValidationError::NotTheKeyDistribution(hash));
    }
    if sharer.key_distribution_accepted {
        return Err(ValidationError::AlreadyAccepted(sharer.number));
    }
    if !sharer.hashes.key_distribution_complaints.is_empty() {
        return Err(ValidationError::ResponseReceived(hash));
    }
    Ok(Timeout::AcceptKeyDistribution(sharer.number))
}

fn unanswered_goodbye(
    context: &ValidationContext<'_>,
    hash: MessageHash,
    goodbye: &Goodbye,
) -> Result<Timeout, ValidationError> {
    let answered = [ResponseKind::SuccessionCompleted, ResponseKind::GoodbyeComplaints]
        .into_iter()
        .any(|kind| !context.messages.responses(&hash, kind).is_empty());
    if answered {
        return Err(ValidationError::ResponseReceived(hash));
    }
    let leaving = alive(context, goodbye.dead_relay)?;
    if leaving.hashes.goodbye != Some(hash) {
        return Err(ValidationError::NotAwaitingResponse(hash));
    }
    alive(context, goodbye.successor)?;
    Ok(Timeout::Kill(goodbye.successor))
}

/// The successor neither completed nor disputed a full set of recovery
/// messages, the last of which is `hash`.
fn unanswered_recoveries(
    context: &ValidationContext<'_>,
    hash: MessageHash,
    recovery: &SecretRecovery,
) -> Result<Timeout, ValidationError> {
    let obituary = recovery.obituary;
    if !context
        .messages
        .responses(&obituary, ResponseKind::SuccessionCompleted)
        .is_empty()
    {
        return Err(ValidationError::ResponseReceived(hash));
    }
    let recoveries = context
        .messages
        .responses(&obituary, ResponseKind::SecretRecoveries);
    if recoveries.len() < KEY_QUARTER_HOLDERS || !recoveries.contains(&hash) {
        return Err(ValidationError::NotAwaitingResponse(hash));
    }
    let disputed = context
        .messages
        .responses(&obituary, ResponseKind::SecretRecoveryFailures)
        .iter()
        .filter_map(|h| context.messages.fetch::<SecretRecoveryFailure>(h))
        .any(|f| f.content.secret_recoveries.iter().all(|r| recoveries.contains(r)));
    if disputed {
        return Err(ValidationError::ResponseReceived(hash));
    }
    alive(context, recovery.successor)?;
    Ok(Timeout::Kill(recovery.successor))
}

/// `relay` didn't answer `message`.
///
/// After an obituary, `relay` is a key quarter holder that sent no recovery
/// message. After a recovery failure, it is one that sent no audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationWithoutResponseFromRelay {
    pub message: MessageHash,
    pub relay: RelayNumber,
}

impl DurationWithoutResponseFromRelay {
    pub fn dependencies(&self) -> Vec<MessageHash> {
        vec![self.message]
    }

    pub fn effect(&self, context: &ValidationContext<'_>) -> Result<Timeout, ValidationError> {
        let hash = self.message;
        match context.messages.get(&hash) {
            Some(Record::Obituary(obituary)) => {
                if obituary.reason == DeathReason::SaidGoodbye {
                    return Err(ValidationError::NotAwaitingResponse(hash));
                }
                let dead = relay(context, obituary.dead_relay)?;
                if dead.hashes.obituary != Some(hash) {
                    return Err(ValidationError::ObituaryMismatch(dead.number));
                }
                if dead.holders.quarter_holder_position(self.relay).is_none() {
                    return Err(ValidationError::NotAKeyQuarterHolder {
                        holder: self.relay,
                        relay: dead.number,
                    });
                }
                alive(context, self.relay)?;
                let sent = context
                    .messages
                    .responses(&hash, ResponseKind::SecretRecoveries)
                    .iter()
                    .filter_map(|h| context.messages.fetch::<SecretRecovery>(h))
                    .any(|r| r.content.quarter_holder == self.relay);
                if sent {
                    return Err(ValidationError::ResponseReceived(hash));
                }
                Ok(Timeout::Kill(self.relay))
            }
            Some(Record::Message(RelayMessage::SecretRecoveryFailure(failure))) => {
                if context.messages.has_flag(&hash, MessageFlag::Resolved) {
                    return Err(ValidationError::ResponseReceived(hash));
                }
                if failure
                    .content
                    .recovery_from(self.relay, context.messages)
                    .is_none()
                {
                    return Err(ValidationError::NotAwaitingResponse(hash));
                }
                alive(context, self.relay)?;
                let audited = context
                    .messages
                    .responses(&hash, ResponseKind::RecoveryFailureAudits)
                    .iter()
                    .filter_map(|h| context.messages.fetch::<RecoveryFailureAudit>(h))
                    .any(|a| a.content.quarter_holder == self.relay);
                if audited {
                    return Err(ValidationError::ResponseReceived(hash));
                }
                Ok(Timeout::DiscardRecovery {
                    failure: hash,
                    quarter_holder: self.relay,
                })
            }
            Some(_) => Err(ValidationError::NotAwaitingResponse(hash)),
            None => Err(ValidationError::UnknownMessage(hash)),
        }
    }
}

impl Validate for DurationWithoutResponseFromRelay {
    fn validate(&self, context: &ValidationContext<'_>) -> Result<(), ValidationError> {
        self.effect(context).map(|_| ())
    }
}
