//! Runtime configuration for a relay node.
use serde::{Deserialize, Serialize};

use crate::constants::{ADMISSION_EPOCH_WINDOW, GOOD_STANDING_AGE, RESPONSE_WAIT_TIME};

/// Whether a node is taking part in the protocol, or just rebuilding its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Respond to messages, broadcast, and schedule deadline checks.
    Live,
    /// Apply messages from a log. Nothing is broadcast or scheduled.
    Replay,
}

/// Configuration for a [RelayNode](crate::RelayNode).
///
/// Every field has a default, so a partial configuration file is fine.
/// The `send_*` switches exist so that an operator (or a test) can silence
/// one kind of response, which is how a misbehaving relay looks from outside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub mode: Mode,
    /// Microseconds to wait for a response before acting on its absence.
    pub response_wait_time: u64,
    /// Relays that must join after a departing relay for it to be in good standing.
    pub good_standing_age: u64,
    /// Maximum age, in epochs, of an admission anchor.
    pub admission_epoch_window: u64,
    pub send_key_distribution_complaints: bool,
    pub send_goodbye_complaints: bool,
    pub send_secret_recovery_messages: bool,
    pub send_secret_recovery_complaints: bool,
    pub send_audit_messages: bool,
    pub send_succession_completed_messages: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Live,
            response_wait_time: RESPONSE_WAIT_TIME,
            good_standing_age: GOOD_STANDING_AGE,
            admission_epoch_window: ADMISSION_EPOCH_WINDOW,
            send_key_distribution_complaints: true,
            send_goodbye_complaints: true,
            send_secret_recovery_messages: true,
            send_secret_recovery_complaints: true,
            send_audit_messages: true,
            send_succession_completed_messages: true,
        }
    }
}

impl RelayConfig {
    /// A configuration for rebuilding state from a message log.
    pub fn replay() -> Self {
        Self {
            mode: Mode::Replay,
            ..Self::default()
        }
    }

    pub fn is_live(&self) -> bool {
        self.mode == Mode::Live
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::serde::decode;

    #[test]
    fn test_partial_config_takes_defaults() -> Result<(), Box<dyn std::error::Error>> {
        #[derive(Serialize)]
        struct Partial {
            response_wait_time: u64,
            send_audit_messages: bool,
        }
        // Configuration files are keyed by field name.
        let bytes = rmp_serde::encode::to_vec_named(&Partial {
            response_wait_time: 5,
            send_audit_messages: false,
        })?;
        let config: RelayConfig = decode(&bytes)?;
        assert_eq!(config.response_wait_time, 5);
        assert!(!config.send_audit_messages);
        assert!(config.send_goodbye_complaints);
        assert_eq!(config.mode, Mode::Live);
        assert_eq!(config.good_standing_age, GOOD_STANDING_AGE);
        Ok(())
    }
}
