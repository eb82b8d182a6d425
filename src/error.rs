use thiserror::Error;

use crate::{crypto::MessageHash, relay::RelayNumber};

/// An operation on the relay state that could not be carried out.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayStateError {
    #[error("no relay numbered {0}")]
    NoSuchRelay(RelayNumber),
    #[error("no relay joined with message {0}")]
    UnknownJoin(MessageHash),
    #[error("admission anchor {0} has already been used")]
    AnchorAlreadyUsed(MessageHash),
    #[error("relay {0} already has key part holders")]
    HoldersAlreadyAssigned(RelayNumber),
    #[error("not enough relays to assign key part holders to {0}")]
    NotEnoughRelays(RelayNumber),
    #[error("could not find enough suitable key part holders for {0}")]
    NoSuitableHolder(RelayNumber),
    #[error("could not find a suitable successor for {0}")]
    NoSuitableSuccessor(RelayNumber),
    #[error("relay {0} is already dead")]
    AlreadyDead(RelayNumber),
    #[error("relay {0} is still alive")]
    NotDead(RelayNumber),
}

/// The reason a message was rejected.
///
/// A rejected message has no effect on the relay state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("wrong number of entries in {0}")]
    BadSize(&'static str),
    #[error("signature does not verify")]
    BadSignature,
    #[error("anchor {0} is not in the main chain")]
    AnchorNotInMainChain(MessageHash),
    #[error("anchor {0} is outside the admission window")]
    AnchorOutOfWindow(MessageHash),
    #[error("admission anchor {0} has already been used")]
    AnchorAlreadyUsed(MessageHash),
    #[error("relay {0} is unknown")]
    UnknownRelay(RelayNumber),
    #[error("relay {0} has not joined yet")]
    RelayNotYetJoined(RelayNumber),
    #[error("message {0} is unknown or of the wrong kind")]
    UnknownMessage(MessageHash),
    #[error("relay number does not match its join message")]
    RelayNumberMismatch,
    #[error("keys of relay {0} were already distributed")]
    AlreadyDistributed(RelayNumber),
    #[error("key distribution of relay {0} was already accepted")]
    AlreadyAccepted(RelayNumber),
    #[error("key part holders differ from the ones selected")]
    WrongKeyPartHolders,
    #[error("key distribution {0} is not the one the relay made")]
    NotTheKeyDistribution(MessageHash),
    #[error("position out of range")]
    PositionOutOfRange,
    #[error("revealed private key does not match the public receiving key")]
    WrongPrivateKey,
    #[error("the disputed secret decrypts correctly")]
    SecretDecryptsCorrectly,
    #[error("relay {0} is dead")]
    RelayIsDead(RelayNumber),
    #[error("relay {0} has already said goodbye")]
    AlreadySaidGoodbye(RelayNumber),
    #[error("successor should be {expected}, not {actual}")]
    WrongSuccessor {
        expected: RelayNumber,
        actual: RelayNumber,
    },
    #[error("key quarter sharers or their positions do not match")]
    WrongKeyQuarterSharers,
    #[error("relay {holder} is not a key quarter holder of {relay}")]
    NotAKeyQuarterHolder {
        holder: RelayNumber,
        relay: RelayNumber,
    },
    #[error("succession of relay {0} has already completed")]
    SuccessionAlreadyCompleted(RelayNumber),
    #[error("message does not match the obituary of relay {0}")]
    ObituaryMismatch(RelayNumber),
    #[error("relay {0} has already responded")]
    DuplicateResponse(RelayNumber),
    #[error("secret recovery messages do not belong together")]
    InconsistentRecoveryMessages,
    #[error("message {0} was answered")]
    ResponseReceived(MessageHash),
    #[error("message {0} is not waiting for a response")]
    NotAwaitingResponse(MessageHash),
    #[error(transparent)]
    State(#[from] RelayStateError),
}

impl ValidationError {
    /// Whether the message could still become valid, once this node has seen
    /// more of the anchor chain or of the relay network.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ValidationError::AnchorNotInMainChain(_) | ValidationError::RelayNotYetJoined(_)
        )
    }
}

/// Errors surfaced to the caller of a [RelayNode](crate::RelayNode).
///
/// Messages that are merely invalid are not errors; they are reported through
/// [Disposition::Rejected](crate::Disposition::Rejected).
#[derive(Debug, Error)]
pub enum Error {
    #[error("this node holds no key material for relay {0}")]
    MissingKeyMaterial(RelayNumber),
    #[error("failed to decode message: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("generated message was rejected: {0}")]
    Rejected(#[from] ValidationError),
    #[error(transparent)]
    State(#[from] RelayStateError),
}
