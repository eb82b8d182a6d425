//! The messages relays exchange.
//!
//! Most messages are a piece of content signed by the relay (or, for joins,
//! the ledger identity) it speaks for. A message is identified by the hash of
//! its content alone, so the signature never changes its identity. Timeouts
//! are the exception: they aren't signed, since anybody can check them.
//!
//! Admission messages live in [admission], everything concerning the death of
//! a relay in [succession], and timeouts in [timeout].
use elliptic_curve::NonZeroScalar;
use k256::{
    ecdsa::{
        signature::{Signer, Verifier},
        Signature, SigningKey, VerifyingKey,
    },
    AffinePoint, Scalar,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    config::RelayConfig,
    crypto::{hash_value, MessageHash},
    error::ValidationError,
    network::AdmissionAnchors,
    serde::{decode, encode},
    state::RelayState,
    store::MessageStore,
};

pub mod admission;
pub mod succession;
pub mod timeout;

pub use admission::{KeyDistribution, KeyDistributionComplaint, RelayJoin};
pub use succession::{
    Goodbye, GoodbyeComplaint, RecoveryFailureAudit, SecretRecovery, SecretRecoveryComplaint,
    SecretRecoveryFailure, SuccessionCompleted,
};
pub use timeout::{DurationWithoutResponse, DurationWithoutResponseFromRelay, Timeout};

/// Content carried by one of the variants of [RelayMessage].
pub trait Content: Serialize + DeserializeOwned + Clone {
    const KIND: MessageKind;

    fn from_message(message: &RelayMessage) -> Option<&Signed<Self>>;

    fn into_message(signed: Signed<Self>) -> RelayMessage;

    /// The identity of this content.
    fn hash(&self) -> MessageHash {
        hash_value(Self::KIND.domain(), self)
    }
}

/// Content sent as it is, without a signature.
///
/// Such a message states something every node can check for itself, so it
/// doesn't matter who sent it: copies from different nodes are the same
/// message.
pub trait Unsigned: Serialize + DeserializeOwned + Clone {
    const KIND: MessageKind;

    fn into_message(self) -> RelayMessage;

    fn hash(&self) -> MessageHash {
        hash_value(Self::KIND.domain(), self)
    }
}

/// Some content, with a signature over its hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "T: Content")]
pub struct Signed<T> {
    pub content: T,
    pub signature: Signature,
}

impl<T: Content> Signed<T> {
    /// Sign some content with a private key.
    ///
    /// This returns `None` if the key is zero.
    pub fn sign(content: T, private_key: &Scalar) -> Option<Self> {
        let key: NonZeroScalar<k256::Secp256k1> = Option::from(NonZeroScalar::new(*private_key))?;
        let signing_key = SigningKey::from(key);
        let signature: Signature = signing_key.sign(content.hash().as_ref());
        Some(Self { content, signature })
    }

    pub fn hash(&self) -> MessageHash {
        self.content.hash()
    }

    /// Check the signature against a public key.
    pub fn verify(&self, public_key: &AffinePoint) -> bool {
        match VerifyingKey::from_affine(*public_key) {
            Ok(key) => key
                .verify(self.hash().as_ref(), &self.signature)
                .is_ok(),
            Err(_) => false,
        }
    }

    pub fn verify_or_reject(&self, public_key: &AffinePoint) -> Result<(), ValidationError> {
        if self.verify(public_key) {
            Ok(())
        } else {
            Err(ValidationError::BadSignature)
        }
    }

    pub fn into_message(self) -> RelayMessage {
        T::into_message(self)
    }
}

/// What a message is checked against.
pub struct ValidationContext<'a> {
    pub state: &'a RelayState,
    pub messages: &'a dyn MessageStore,
    pub anchors: &'a dyn AdmissionAnchors,
    pub config: &'a RelayConfig,
}

/// Checks a message against the current state, without changing anything.
pub trait Validate {
    fn validate(&self, context: &ValidationContext<'_>) -> Result<(), ValidationError>;
}

macro_rules! relay_messages {
    (
        signed {
            $($variant:ident($ty:ty) => $domain:literal,)*
        }
        unsigned {
            $($bare:ident($bare_ty:ty) => $bare_domain:literal,)*
        }
    ) => {
        /// Every message of the protocol.
        #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
        pub enum RelayMessage {
            $($variant(Signed<$ty>),)*
            $($bare($bare_ty),)*
        }

        /// The type of a [RelayMessage].
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum MessageKind {
            $($variant,)*
            $($bare,)*
        }

        impl MessageKind {
            /// Domain separation for content hashes.
            pub fn domain(self) -> &'static [u8] {
                match self {
                    $(MessageKind::$variant => $domain,)*
                    $(MessageKind::$bare => $bare_domain,)*
                }
            }
        }

        $(
            impl Content for $ty {
                const KIND: MessageKind = MessageKind::$variant;

                fn from_message(message: &RelayMessage) -> Option<&Signed<Self>> {
                    match message {
                        RelayMessage::$variant(signed) => Some(signed),
                        _ => None,
                    }
                }

                fn into_message(signed: Signed<Self>) -> RelayMessage {
                    RelayMessage::$variant(signed)
                }
            }
        )*

        $(
            impl Unsigned for $bare_ty {
                const KIND: MessageKind = MessageKind::$bare;

                fn into_message(self) -> RelayMessage {
                    RelayMessage::$bare(self)
                }
            }
        )*

        impl RelayMessage {
            pub fn kind(&self) -> MessageKind {
                match self {
                    $(RelayMessage::$variant(_) => MessageKind::$variant,)*
                    $(RelayMessage::$bare(_) => MessageKind::$bare,)*
                }
            }

            pub fn hash(&self) -> MessageHash {
                match self {
                    $(RelayMessage::$variant(signed) => signed.hash(),)*
                    $(RelayMessage::$bare(content) => content.hash(),)*
                }
            }

            /// Stored records this message refers to.
            ///
            /// A message is only handled once all of these are known.
            pub fn dependencies(&self) -> Vec<MessageHash> {
                match self {
                    $(RelayMessage::$variant(signed) => signed.content.dependencies(),)*
                    $(RelayMessage::$bare(content) => content.dependencies(),)*
                }
            }
        }

        impl Validate for RelayMessage {
            fn validate(&self, context: &ValidationContext<'_>) -> Result<(), ValidationError> {
                match self {
                    $(RelayMessage::$variant(signed) => signed.validate(context),)*
                    $(RelayMessage::$bare(content) => content.validate(context),)*
                }
            }
        }
    };
}

relay_messages! {
    signed {
        RelayJoin(RelayJoin) => b"relay join",
        KeyDistribution(KeyDistribution) => b"key distribution",
        KeyDistributionComplaint(KeyDistributionComplaint) => b"key distribution complaint",
        Goodbye(Goodbye) => b"goodbye",
        GoodbyeComplaint(GoodbyeComplaint) => b"goodbye complaint",
        SecretRecovery(SecretRecovery) => b"secret recovery",
        SecretRecoveryComplaint(SecretRecoveryComplaint) => b"secret recovery complaint",
        SecretRecoveryFailure(SecretRecoveryFailure) => b"secret recovery failure",
        RecoveryFailureAudit(RecoveryFailureAudit) => b"recovery failure audit",
        SuccessionCompleted(SuccessionCompleted) => b"succession completed",
    }
    unsigned {
        DurationWithoutResponse(DurationWithoutResponse) => b"duration without response",
        DurationWithoutResponseFromRelay(DurationWithoutResponseFromRelay) => b"duration without response from relay",
    }
}

impl RelayMessage {
    /// The wire encoding of this message.
    pub fn to_bytes(&self) -> Vec<u8> {
        encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        decode(bytes)
    }
}

/// Check that a list of numbered positions has the expected length.
pub(crate) fn check_len<T>(list: &[T], len: usize, what: &'static str) -> Result<(), ValidationError> {
    if list.len() == len {
        Ok(())
    } else {
        Err(ValidationError::BadSize(what))
    }
}
