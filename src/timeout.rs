//! Acting on silence.
//!
//! Tasks never change the state themselves. When one comes due, the node
//! checks whether the answer it waited for came, and if not, sends a timeout
//! message. The state only changes once that message comes back through the
//! network, so a replaying node sees the same timeouts, in the same places.
use tracing::{debug, info, warn};

use crate::{
    crypto::MessageHash,
    error::Error,
    messages::{
        DurationWithoutResponse, DurationWithoutResponseFromRelay, SecretRecovery,
        SecretRecoveryFailure, Timeout, Unsigned, Validate,
    },
    node::RelayNode,
    relay::RelayNumber,
    scheduler::Task,
    state::DeathReason,
    store::{MessageFlag, MessageStoreExt},
};

impl RelayNode {
    pub(crate) fn on_task(&mut self, task: Task) {
        match task {
            Task::KeyDistributionWindowClosed(message)
            | Task::GoodbyeResponseDeadline(message)
            | Task::SuccessionDeadline(message) => {
                self.report_silence(DurationWithoutResponse { message })
            }
            Task::ObituaryResponseDeadline(obituary) => {
                let quarter_holders = self
                    .messages
                    .obituary(&obituary)
                    .and_then(|o| self.state.relay(o.dead_relay))
                    .map(|dead| dead.holders.key_quarter_holders.clone())
                    .unwrap_or_default();
                for relay in quarter_holders {
                    self.report_silence(DurationWithoutResponseFromRelay {
                        message: obituary,
                        relay,
                    });
                }
            }
            Task::RecoveryFailureResponseDeadline(failure) => {
                let auditors: Vec<RelayNumber> = self
                    .messages
                    .fetch::<SecretRecoveryFailure>(&failure)
                    .map(|f| {
                        f.content
                            .secret_recoveries
                            .iter()
                            .filter_map(|h| self.messages.fetch::<SecretRecovery>(h))
                            .map(|r| r.content.quarter_holder)
                            .collect()
                    })
                    .unwrap_or_default();
                for relay in auditors {
                    self.report_silence(DurationWithoutResponseFromRelay {
                        message: failure,
                        relay,
                    });
                }
            }
        }
    }

    /// Send a timeout, if it holds.
    fn report_silence<T: Unsigned + Validate>(&mut self, timeout: T) {
        if let Err(e) = timeout.validate(&self.context()) {
            debug!(reason = %e, "answered in time");
            return;
        }
        let message = timeout.into_message();
        debug!(hash = %message.hash(), kind = ?message.kind(), "no answer in time");
        self.publish(&message);
    }

    pub(crate) fn on_duration_without_response(
        &mut self,
        hash: MessageHash,
        timeout: DurationWithoutResponse,
    ) -> Result<(), Error> {
        let effect = timeout.effect(&self.context())?;
        self.take_effect(hash, effect)
    }

    pub(crate) fn on_duration_without_response_from_relay(
        &mut self,
        hash: MessageHash,
        timeout: DurationWithoutResponseFromRelay,
    ) -> Result<(), Error> {
        let effect = timeout.effect(&self.context())?;
        self.take_effect(hash, effect)
    }

    fn take_effect(&mut self, hash: MessageHash, effect: Timeout) -> Result<(), Error> {
        match effect {
            Timeout::AcceptKeyDistribution(relay) => {
                if self.state.accept_key_distribution(relay) {
                    info!(relay = %relay, "key distribution accepted");
                }
                Ok(())
            }
            Timeout::Kill(relay) => {
                warn!(relay = %relay, hash = %hash, "relay did not answer in time");
                self.kill(relay, DeathReason::NotResponding)
            }
            Timeout::DiscardRecovery {
                failure,
                quarter_holder,
            } => {
                let Some(failure_content) = self
                    .messages
                    .fetch::<SecretRecoveryFailure>(&failure)
                    .map(|f| f.content.clone())
                else {
                    return Ok(());
                };
                warn!(holder = %quarter_holder, hash = %hash, "quarter holder did not audit");
                self.messages
                    .set_flag(failure, MessageFlag::BadQuarterHolderFound);
                self.discard_recovery_of(
                    &failure_content,
                    quarter_holder,
                    DeathReason::NotResponding,
                )
            }
        }
    }
}
