//! Messages by which a relay joins and hands out its key.
use k256::{ProjectivePoint, Scalar};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};

use super::{check_len, Signed, Validate, ValidationContext};
use crate::{
    constants::KEY_SIXTEENTHS,
    crypto::MessageHash,
    error::{Error, ValidationError},
    keysplit::{decrypt_with_receiving_key, EncryptedSecret, PublicKeySet},
    keystore::KeyStore,
    relay::{HolderGroup, KeyPartHolders, Relay, RelayNumber},
    state::RelayState,
    store::MessageStoreExt,
};

/// A request to join the network, signed with the key of a ledger anchor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayJoin {
    pub admission_anchor: MessageHash,
    pub public_key_set: PublicKeySet,
}

impl RelayJoin {
    /// Create a join message with a freshly generated key.
    pub fn generate<K: KeyStore + ?Sized>(
        admission_anchor: MessageHash,
        rng: &mut impl CryptoRngCore,
        keys: &mut K,
    ) -> Self {
        Self {
            admission_anchor,
            public_key_set: PublicKeySet::generate(rng, keys),
        }
    }

    pub fn dependencies(&self) -> Vec<MessageHash> {
        Vec::new()
    }
}

impl Validate for Signed<RelayJoin> {
    fn validate(&self, context: &ValidationContext<'_>) -> Result<(), ValidationError> {
        let anchor = &self.content.admission_anchor;
        if !self.content.public_key_set.is_well_formed() {
            return Err(ValidationError::BadSize("public key set"));
        }
        if !context.anchors.is_in_main_chain(anchor) {
            return Err(ValidationError::AnchorNotInMainChain(*anchor));
        }
        if context.state.is_anchor_used(anchor) {
            return Err(ValidationError::AnchorAlreadyUsed(*anchor));
        }
        let epoch = context
            .anchors
            .epoch(anchor)
            .ok_or(ValidationError::AnchorNotInMainChain(*anchor))?;
        let latest = context.anchors.latest_epoch();
        if epoch > latest || latest - epoch > context.config.admission_epoch_window {
            return Err(ValidationError::AnchorOutOfWindow(*anchor));
        }
        let key = context
            .anchors
            .admission_key(anchor)
            .ok_or(ValidationError::AnchorNotInMainChain(*anchor))?;
        self.verify_or_reject(&key)
    }
}

/// A relay's key sixteenths, encrypted to each of its three groups of holders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDistribution {
    pub relay_join: MessageHash,
    pub relay_number: RelayNumber,
    /// The ledger anchor whose hash seeds the choice of holders.
    pub encoding_anchor: MessageHash,
    /// The newest relay considered when choosing the holders.
    pub newest_relay: RelayNumber,
    pub holders: KeyPartHolders,
    pub key_quarter_holder_secrets: Vec<EncryptedSecret>,
    pub first_key_sixteenth_holder_secrets: Vec<EncryptedSecret>,
    pub second_key_sixteenth_holder_secrets: Vec<EncryptedSecret>,
}

impl KeyDistribution {
    /// Encrypt every key sixteenth of `relay` to the holders chosen for it.
    pub fn generate<K: KeyStore + ?Sized>(
        relay: &Relay,
        encoding_anchor: MessageHash,
        state: &RelayState,
        keys: &K,
    ) -> Result<Self, Error> {
        let newest_relay = state.latest_relay_number();
        let holders = state.assign_key_part_holders(relay.number, &encoding_anchor, newest_relay)?;

        let mut out = Self {
            relay_join: relay.hashes.join,
            relay_number: relay.number,
            encoding_anchor,
            newest_relay,
            holders,
            key_quarter_holder_secrets: Vec::with_capacity(KEY_SIXTEENTHS),
            first_key_sixteenth_holder_secrets: Vec::with_capacity(KEY_SIXTEENTHS),
            second_key_sixteenth_holder_secrets: Vec::with_capacity(KEY_SIXTEENTHS),
        };

        for group in HolderGroup::ALL {
            for (position, point) in relay.public_key_set.key_sixteenths().iter().enumerate() {
                let secret = keys
                    .private_key(point)
                    .ok_or(Error::MissingKeyMaterial(relay.number))?;
                let recipient = out
                    .holders
                    .recipient(group, position)
                    .and_then(|n| state.relay(n))
                    .ok_or(Error::MissingKeyMaterial(relay.number))?;
                let encrypted = recipient.public_key_set.encrypt(&secret);
                out.secrets_mut(group).push(encrypted);
            }
        }

        Ok(out)
    }

    pub fn dependencies(&self) -> Vec<MessageHash> {
        vec![self.relay_join]
    }

    pub fn secrets(&self, group: HolderGroup) -> &[EncryptedSecret] {
        match group {
            HolderGroup::KeyQuarterHolders => &self.key_quarter_holder_secrets,
            HolderGroup::FirstKeySixteenthHolders => &self.first_key_sixteenth_holder_secrets,
            HolderGroup::SecondKeySixteenthHolders => &self.second_key_sixteenth_holder_secrets,
        }
    }

    pub fn secrets_mut(&mut self, group: HolderGroup) -> &mut Vec<EncryptedSecret> {
        match group {
            HolderGroup::KeyQuarterHolders => &mut self.key_quarter_holder_secrets,
            HolderGroup::FirstKeySixteenthHolders => &mut self.first_key_sixteenth_holder_secrets,
            HolderGroup::SecondKeySixteenthHolders => &mut self.second_key_sixteenth_holder_secrets,
        }
    }
}

impl Validate for Signed<KeyDistribution> {
    fn validate(&self, context: &ValidationContext<'_>) -> Result<(), ValidationError> {
        let distribution = &self.content;
        for group in HolderGroup::ALL {
            check_len(distribution.secrets(group), KEY_SIXTEENTHS, "encrypted key sixteenths")?;
        }

        let relay = context
            .state
            .relay_by_join(&distribution.relay_join)
            .ok_or(ValidationError::UnknownMessage(distribution.relay_join))?;
        if relay.number != distribution.relay_number {
            return Err(ValidationError::RelayNumberMismatch);
        }
        if relay.has_distributed_keys() {
            return Err(ValidationError::AlreadyDistributed(relay.number));
        }
        if relay.is_dead() {
            return Err(ValidationError::RelayIsDead(relay.number));
        }
        if !context.anchors.is_in_main_chain(&distribution.encoding_anchor) {
            return Err(ValidationError::AnchorNotInMainChain(
                distribution.encoding_anchor,
            ));
        }

        if distribution.newest_relay > context.state.latest_relay_number() {
            return Err(ValidationError::RelayNotYetJoined(distribution.newest_relay));
        }
        let holders = context.state.assign_key_part_holders(
            relay.number,
            &distribution.encoding_anchor,
            distribution.newest_relay,
        )?;
        if holders != distribution.holders {
            return Err(ValidationError::WrongKeyPartHolders);
        }

        self.verify_or_reject(&relay.public_signing_key)
    }
}

/// A holder's proof that the secret sent to it was wrong.
///
/// The holder gives up its private receiving key for the disputed key
/// sixteenth, which lets everybody try the decryption themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDistributionComplaint {
    pub key_distribution: MessageHash,
    pub group: HolderGroup,
    pub position: u8,
    pub private_receiving_key: Scalar,
}

impl KeyDistributionComplaint {
    pub fn generate<K: KeyStore + ?Sized>(
        key_distribution: MessageHash,
        group: HolderGroup,
        position: usize,
        sharer: &Relay,
        complainer: &Relay,
        keys: &K,
    ) -> Result<Self, Error> {
        let point = sharer
            .public_key_set
            .key_sixteenth(position)
            .ok_or(Error::MissingKeyMaterial(sharer.number))?;
        let private_receiving_key = complainer
            .public_key_set
            .receiving_private_key(point, keys)
            .ok_or(Error::MissingKeyMaterial(complainer.number))?;
        Ok(Self {
            key_distribution,
            group,
            position: position as u8,
            private_receiving_key,
        })
    }

    pub fn dependencies(&self) -> Vec<MessageHash> {
        vec![self.key_distribution]
    }

    /// The relays that sent and received the disputed secret.
    pub fn parties(
        &self,
        context: &ValidationContext<'_>,
    ) -> Result<(RelayNumber, RelayNumber), ValidationError> {
        let distribution = context
            .messages
            .fetch::<KeyDistribution>(&self.key_distribution)
            .ok_or(ValidationError::UnknownMessage(self.key_distribution))?;
        let sharer = context
            .state
            .relay(distribution.content.relay_number)
            .ok_or(ValidationError::UnknownRelay(distribution.content.relay_number))?;
        let complainer = sharer
            .holders
            .recipient(self.group, self.position as usize)
            .ok_or(ValidationError::PositionOutOfRange)?;
        Ok((sharer.number, complainer))
    }
}

impl Validate for Signed<KeyDistributionComplaint> {
    fn validate(&self, context: &ValidationContext<'_>) -> Result<(), ValidationError> {
        let complaint = &self.content;
        let position = complaint.position as usize;
        if position >= KEY_SIXTEENTHS {
            return Err(ValidationError::PositionOutOfRange);
        }

        let (sharer_number, complainer_number) = complaint.parties(context)?;
        let sharer = context
            .state
            .relay(sharer_number)
            .ok_or(ValidationError::UnknownRelay(sharer_number))?;
        let complainer = context
            .state
            .relay(complainer_number)
            .ok_or(ValidationError::UnknownRelay(complainer_number))?;

        if sharer.hashes.key_distribution != Some(complaint.key_distribution) {
            return Err(ValidationError::NotTheKeyDistribution(
                complaint.key_distribution,
            ));
        }
        if sharer.key_distribution_accepted {
            return Err(ValidationError::AlreadyAccepted(sharer.number));
        }
        // Complaints about other secrets of a sharer that already died of one
        // are still heard.
        if sharer.is_dead() && sharer.hashes.key_distribution_complaints.is_empty() {
            return Err(ValidationError::RelayIsDead(sharer.number));
        }
        self.verify_or_reject(&complainer.public_signing_key)?;

        let point = sharer
            .public_key_set
            .key_sixteenth(position)
            .ok_or(ValidationError::PositionOutOfRange)?;
        let revealed = (ProjectivePoint::GENERATOR * complaint.private_receiving_key).to_affine();
        if complainer.public_key_set.receiving_public_key(point) != revealed {
            return Err(ValidationError::WrongPrivateKey);
        }

        let distribution = context
            .messages
            .fetch::<KeyDistribution>(&complaint.key_distribution)
            .ok_or(ValidationError::UnknownMessage(complaint.key_distribution))?;
        let encrypted = &distribution.content.secrets(complaint.group)[position];
        match decrypt_with_receiving_key(encrypted, point, &complaint.private_receiving_key) {
            Some(secret) if sharer.public_key_set.verify_row(position, &secret) => {
                Err(ValidationError::SecretDecryptsCorrectly)
            }
            _ => Ok(()),
        }
    }
}
