//! Messages handing a departed relay's key parts over to its successor.
//!
//! A relay that leaves voluntarily says [Goodbye], encrypting the key
//! sixteenths it holds for others directly to its successor. A relay that
//! dies can't do that, so each of its four key quarter holders sends a
//! [SecretRecovery] instead: for every key sixteenth `s` (with `P = s * G`)
//! that was encrypted to the dead relay, the quarter holder computes its
//! quarter of the shared secret, `r_q(P) * P`, and encrypts that to the
//! successor. The four quarters add up to `r(P) * P`, which unmasks `s`.
//!
//! Every step can be disputed: the successor complains about ciphertexts it
//! can't open, reports sums that don't unmask anything, and the quarter
//! holders then audit their own contributions in public.
use k256::{AffinePoint, ProjectivePoint, Scalar};
use serde::{Deserialize, Serialize};

use super::{Signed, Validate, ValidationContext};
use crate::{
    constants::SIXTEENTHS_PER_QUARTER,
    crypto::MessageHash,
    error::{Error, ValidationError},
    keysplit::{
        decrypt_point_with_receiving_key, decrypt_with_receiving_key, EncryptedPoint,
        EncryptedSecret,
    },
    keystore::KeyStore,
    relay::{Relay, RelayNumber},
    state::{DeathReason, RelayState},
    store::{MessageStore, MessageStoreExt, ResponseKind},
};

fn relay<'a>(state: &'a RelayState, number: RelayNumber) -> Result<&'a Relay, ValidationError> {
    state.relay(number).ok_or(ValidationError::UnknownRelay(number))
}

/// The key sixteenth at `part` of the quarter `position` of `sharer`.
fn shared_key_sixteenth(
    state: &RelayState,
    sharer: RelayNumber,
    position: u8,
    part: usize,
) -> Result<AffinePoint, ValidationError> {
    let index = position as usize * SIXTEENTHS_PER_QUARTER + part;
    relay(state, sharer)?
        .public_key_set
        .key_sixteenth(index)
        .copied()
        .ok_or(ValidationError::PositionOutOfRange)
}

/// Check that `sharers` and `positions` list exactly the relays sharing a key quarter with `dead`.
fn check_key_quarter_sharers(
    state: &RelayState,
    dead: RelayNumber,
    sharers: &[RelayNumber],
    positions: &[u8],
) -> Result<(), ValidationError> {
    let expected = state.key_quarter_sharers(dead);
    let matches = expected.len() == sharers.len()
        && expected.len() == positions.len()
        && expected
            .iter()
            .zip(sharers.iter().zip(positions.iter()))
            .all(|((n, p), (m, q))| n == m && *p == *q as usize);
    if matches {
        Ok(())
    } else {
        Err(ValidationError::WrongKeyQuarterSharers)
    }
}

fn check_revealed_key(
    recipient: &Relay,
    point: &AffinePoint,
    private_receiving_key: &Scalar,
) -> Result<(), ValidationError> {
    let revealed = (ProjectivePoint::GENERATOR * private_receiving_key).to_affine();
    if recipient.public_key_set.receiving_public_key(point) == revealed {
        Ok(())
    } else {
        Err(ValidationError::WrongPrivateKey)
    }
}

/// A relay leaving of its own accord, handing its key quarters to its successor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goodbye {
    pub dead_relay: RelayNumber,
    pub successor: RelayNumber,
    /// The newest relay considered when choosing the successor.
    pub newest_relay: RelayNumber,
    pub key_quarter_sharers: Vec<RelayNumber>,
    pub key_quarter_positions: Vec<u8>,
    pub encrypted_key_sixteenths: Vec<[EncryptedSecret; SIXTEENTHS_PER_QUARTER]>,
}

impl Goodbye {
    pub fn generate<K: KeyStore + ?Sized>(
        leaving: &Relay,
        state: &RelayState,
        keys: &K,
    ) -> Result<Self, Error> {
        let newest_relay = state.latest_relay_number();
        let successor_number = state.assign_successor(leaving.number, newest_relay)?;
        let successor = relay(state, successor_number)?;

        let mut out = Self {
            dead_relay: leaving.number,
            successor: successor_number,
            newest_relay,
            key_quarter_sharers: Vec::new(),
            key_quarter_positions: Vec::new(),
            encrypted_key_sixteenths: Vec::new(),
        };
        for (sharer, position) in state.key_quarter_sharers(leaving.number) {
            let mut encrypted = [EncryptedSecret::default(); SIXTEENTHS_PER_QUARTER];
            for (part, slot) in encrypted.iter_mut().enumerate() {
                let point = shared_key_sixteenth(state, sharer, position as u8, part)?;
                let secret = keys
                    .private_key(&point)
                    .ok_or(Error::MissingKeyMaterial(leaving.number))?;
                *slot = successor.public_key_set.encrypt(&secret);
            }
            out.key_quarter_sharers.push(sharer);
            out.key_quarter_positions.push(position as u8);
            out.encrypted_key_sixteenths.push(encrypted);
        }
        Ok(out)
    }

    pub fn dependencies(&self) -> Vec<MessageHash> {
        Vec::new()
    }
}

impl Validate for Signed<Goodbye> {
    fn validate(&self, context: &ValidationContext<'_>) -> Result<(), ValidationError> {
        let goodbye = &self.content;
        let n = goodbye.key_quarter_sharers.len();
        if goodbye.key_quarter_positions.len() != n || goodbye.encrypted_key_sixteenths.len() != n
        {
            return Err(ValidationError::BadSize("key quarter sharers"));
        }

        let leaving = relay(context.state, goodbye.dead_relay)?;
        if leaving.is_dead() {
            return Err(ValidationError::RelayIsDead(leaving.number));
        }
        if leaving.hashes.goodbye.is_some() {
            return Err(ValidationError::AlreadySaidGoodbye(leaving.number));
        }
        if goodbye.newest_relay > context.state.latest_relay_number() {
            return Err(ValidationError::RelayNotYetJoined(goodbye.newest_relay));
        }
        let expected = context
            .state
            .assign_successor(leaving.number, goodbye.newest_relay)?;
        if expected != goodbye.successor {
            return Err(ValidationError::WrongSuccessor {
                expected,
                actual: goodbye.successor,
            });
        }
        check_key_quarter_sharers(
            context.state,
            leaving.number,
            &goodbye.key_quarter_sharers,
            &goodbye.key_quarter_positions,
        )?;
        self.verify_or_reject(&leaving.public_signing_key)
    }
}

/// The successor's proof that a secret in a goodbye doesn't decrypt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoodbyeComplaint {
    pub goodbye: MessageHash,
    pub key_sharer_position: u32,
    pub position: u8,
    pub private_receiving_key: Scalar,
}

impl GoodbyeComplaint {
    pub fn generate<K: KeyStore + ?Sized>(
        goodbye_hash: MessageHash,
        goodbye: &Goodbye,
        key_sharer_position: usize,
        position: usize,
        state: &RelayState,
        keys: &K,
    ) -> Result<Self, Error> {
        let sharer = goodbye.key_quarter_sharers[key_sharer_position];
        let quarter = goodbye.key_quarter_positions[key_sharer_position];
        let point = shared_key_sixteenth(state, sharer, quarter, position)?;
        let successor = relay(state, goodbye.successor)?;
        let private_receiving_key = successor
            .public_key_set
            .receiving_private_key(&point, keys)
            .ok_or(Error::MissingKeyMaterial(successor.number))?;
        Ok(Self {
            goodbye: goodbye_hash,
            key_sharer_position: key_sharer_position as u32,
            position: position as u8,
            private_receiving_key,
        })
    }

    pub fn dependencies(&self) -> Vec<MessageHash> {
        vec![self.goodbye]
    }
}

impl Validate for Signed<GoodbyeComplaint> {
    fn validate(&self, context: &ValidationContext<'_>) -> Result<(), ValidationError> {
        let complaint = &self.content;
        let goodbye = &context
            .messages
            .fetch::<Goodbye>(&complaint.goodbye)
            .ok_or(ValidationError::UnknownMessage(complaint.goodbye))?
            .content;
        let sharer_position = complaint.key_sharer_position as usize;
        let position = complaint.position as usize;
        if sharer_position >= goodbye.key_quarter_sharers.len()
            || position >= SIXTEENTHS_PER_QUARTER
        {
            return Err(ValidationError::PositionOutOfRange);
        }
        if !context
            .messages
            .responses(&complaint.goodbye, ResponseKind::SuccessionCompleted)
            .is_empty()
        {
            return Err(ValidationError::SuccessionAlreadyCompleted(
                goodbye.dead_relay,
            ));
        }
        let leaving = relay(context.state, goodbye.dead_relay)?;
        if leaving.is_dead() {
            return Err(ValidationError::RelayIsDead(leaving.number));
        }

        let successor = relay(context.state, goodbye.successor)?;
        self.verify_or_reject(&successor.public_signing_key)?;

        let point = shared_key_sixteenth(
            context.state,
            goodbye.key_quarter_sharers[sharer_position],
            goodbye.key_quarter_positions[sharer_position],
            position,
        )?;
        check_revealed_key(successor, &point, &complaint.private_receiving_key)?;

        let encrypted = &goodbye.encrypted_key_sixteenths[sharer_position][position];
        match decrypt_with_receiving_key(encrypted, &point, &complaint.private_receiving_key) {
            Some(_) => Err(ValidationError::SecretDecryptsCorrectly),
            None => Ok(()),
        }
    }
}

/// A key quarter holder's share of a dead relay's shared secrets, for its successor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRecovery {
    pub obituary: MessageHash,
    pub dead_relay: RelayNumber,
    pub quarter_holder: RelayNumber,
    pub successor: RelayNumber,
    pub key_quarter_sharers: Vec<RelayNumber>,
    pub key_quarter_positions: Vec<u8>,
    pub encrypted_shared_secret_quarters: Vec<[EncryptedPoint; SIXTEENTHS_PER_QUARTER]>,
    /// The points the shared secret quarters were encrypted against.
    pub shared_secret_quarter_commitments: Vec<[AffinePoint; SIXTEENTHS_PER_QUARTER]>,
}

impl SecretRecovery {
    pub fn generate<K: KeyStore + ?Sized>(
        obituary_hash: MessageHash,
        dead_relay: RelayNumber,
        quarter_holder: RelayNumber,
        state: &RelayState,
        keys: &K,
    ) -> Result<Self, Error> {
        let dead = relay(state, dead_relay)?;
        let quarter = dead.holders.quarter_holder_position(quarter_holder).ok_or(
            ValidationError::NotAKeyQuarterHolder {
                holder: quarter_holder,
                relay: dead_relay,
            },
        )?;
        let obituary_successor = state
            .successor_of(dead_relay)
            .ok_or(ValidationError::ObituaryMismatch(dead_relay))?;
        let successor = relay(state, obituary_successor)?;

        let mut out = Self {
            obituary: obituary_hash,
            dead_relay,
            quarter_holder,
            successor: successor.number,
            key_quarter_sharers: Vec::new(),
            key_quarter_positions: Vec::new(),
            encrypted_shared_secret_quarters: Vec::new(),
            shared_secret_quarter_commitments: Vec::new(),
        };
        for (sharer, position) in state.key_quarter_sharers(dead_relay) {
            let mut encrypted = Vec::with_capacity(SIXTEENTHS_PER_QUARTER);
            let mut commitments = Vec::with_capacity(SIXTEENTHS_PER_QUARTER);
            for part in 0..SIXTEENTHS_PER_QUARTER {
                let point = shared_key_sixteenth(state, sharer, position as u8, part)?;
                let key_quarter = dead
                    .public_key_set
                    .receiving_private_key_quarter(&point, quarter, keys)
                    .ok_or(Error::MissingKeyMaterial(quarter_holder))?;
                let shared_secret_quarter = (ProjectivePoint::from(point) * key_quarter).to_affine();
                let (e, c) = successor.public_key_set.encrypt_point(&shared_secret_quarter);
                encrypted.push(e);
                commitments.push(c);
            }
            out.key_quarter_sharers.push(sharer);
            out.key_quarter_positions.push(position as u8);
            out.encrypted_shared_secret_quarters
                .push(to_quarter(encrypted).ok_or(ValidationError::BadSize("shared secret quarters"))?);
            out.shared_secret_quarter_commitments
                .push(to_quarter(commitments).ok_or(ValidationError::BadSize("shared secret quarters"))?);
        }
        Ok(out)
    }

    pub fn dependencies(&self) -> Vec<MessageHash> {
        vec![self.obituary]
    }

    /// Whether this message carries the key quarter `quarter` that `sharer`
    /// shares with the dead relay.
    pub fn covers(&self, sharer: RelayNumber, quarter: u8) -> bool {
        self.key_quarter_sharers
            .iter()
            .zip(self.key_quarter_positions.iter())
            .any(|(s, q)| *s == sharer && *q == quarter)
    }

    /// The shared secret quarter for `part` of the key quarter `sharer`
    /// shares with the dead relay, and the point it was encrypted against.
    pub fn shared_secret_quarter(
        &self,
        sharer: RelayNumber,
        part: usize,
    ) -> Option<(&EncryptedPoint, &AffinePoint)> {
        let i = self.key_quarter_sharers.iter().position(|s| *s == sharer)?;
        let encrypted = self.encrypted_shared_secret_quarters.get(i)?.get(part)?;
        let commitment = self.shared_secret_quarter_commitments.get(i)?.get(part)?;
        Some((encrypted, commitment))
    }
}

fn to_quarter<T>(parts: Vec<T>) -> Option<[T; SIXTEENTHS_PER_QUARTER]> {
    parts.try_into().ok()
}

impl Validate for Signed<SecretRecovery> {
    fn validate(&self, context: &ValidationContext<'_>) -> Result<(), ValidationError> {
        let recovery = &self.content;
        let n = recovery.key_quarter_sharers.len();
        if recovery.key_quarter_positions.len() != n
            || recovery.encrypted_shared_secret_quarters.len() != n
            || recovery.shared_secret_quarter_commitments.len() != n
        {
            return Err(ValidationError::BadSize("key quarter sharers"));
        }

        let obituary = context
            .messages
            .obituary(&recovery.obituary)
            .ok_or(ValidationError::UnknownMessage(recovery.obituary))?;
        if obituary.dead_relay != recovery.dead_relay
            || obituary.successor != recovery.successor
            || obituary.reason == DeathReason::SaidGoodbye
        {
            return Err(ValidationError::ObituaryMismatch(recovery.dead_relay));
        }

        let dead = relay(context.state, recovery.dead_relay)?;
        let holder = relay(context.state, recovery.quarter_holder)?;
        if holder.is_dead() {
            return Err(ValidationError::RelayIsDead(holder.number));
        }
        if dead.holders.quarter_holder_position(holder.number).is_none() {
            return Err(ValidationError::NotAKeyQuarterHolder {
                holder: holder.number,
                relay: dead.number,
            });
        }
        let already_sent = context
            .messages
            .responses(&recovery.obituary, ResponseKind::SecretRecoveries)
            .iter()
            .filter_map(|h| context.messages.fetch::<SecretRecovery>(h))
            .any(|r| r.content.quarter_holder == holder.number);
        if already_sent {
            return Err(ValidationError::DuplicateResponse(holder.number));
        }
        check_key_quarter_sharers(
            context.state,
            dead.number,
            &recovery.key_quarter_sharers,
            &recovery.key_quarter_positions,
        )?;
        self.verify_or_reject(&holder.public_signing_key)
    }
}

/// The successor's proof that a shared secret quarter it was sent doesn't decrypt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRecoveryComplaint {
    pub secret_recovery: MessageHash,
    pub key_sharer_position: u32,
    pub position: u8,
    pub private_receiving_key: Scalar,
}

impl SecretRecoveryComplaint {
    pub fn generate<K: KeyStore + ?Sized>(
        recovery_hash: MessageHash,
        recovery: &SecretRecovery,
        key_sharer_position: usize,
        position: usize,
        state: &RelayState,
        keys: &K,
    ) -> Result<Self, Error> {
        let commitment = recovery.shared_secret_quarter_commitments[key_sharer_position][position];
        let successor = relay(state, recovery.successor)?;
        let private_receiving_key = successor
            .public_key_set
            .receiving_private_key(&commitment, keys)
            .ok_or(Error::MissingKeyMaterial(successor.number))?;
        Ok(Self {
            secret_recovery: recovery_hash,
            key_sharer_position: key_sharer_position as u32,
            position: position as u8,
            private_receiving_key,
        })
    }

    pub fn dependencies(&self) -> Vec<MessageHash> {
        vec![self.secret_recovery]
    }
}

impl Validate for Signed<SecretRecoveryComplaint> {
    fn validate(&self, context: &ValidationContext<'_>) -> Result<(), ValidationError> {
        let complaint = &self.content;
        let recovery = &context
            .messages
            .fetch::<SecretRecovery>(&complaint.secret_recovery)
            .ok_or(ValidationError::UnknownMessage(complaint.secret_recovery))?
            .content;
        let sharer_position = complaint.key_sharer_position as usize;
        let position = complaint.position as usize;
        if sharer_position >= recovery.key_quarter_sharers.len()
            || position >= SIXTEENTHS_PER_QUARTER
        {
            return Err(ValidationError::PositionOutOfRange);
        }

        let dead = relay(context.state, recovery.dead_relay)?;
        if !dead
            .hashes
            .secret_recoveries
            .contains(&complaint.secret_recovery)
        {
            return Err(ValidationError::UnknownMessage(complaint.secret_recovery));
        }
        let successor = relay(context.state, recovery.successor)?;
        self.verify_or_reject(&successor.public_signing_key)?;

        let commitment = &recovery.shared_secret_quarter_commitments[sharer_position][position];
        check_revealed_key(successor, commitment, &complaint.private_receiving_key)?;

        let encrypted = &recovery.encrypted_shared_secret_quarters[sharer_position][position];
        match decrypt_point_with_receiving_key(
            encrypted,
            commitment,
            &complaint.private_receiving_key,
        ) {
            Some(_) => Err(ValidationError::SecretDecryptsCorrectly),
            None => Ok(()),
        }
    }
}

/// The successor's report that four valid recovery messages still didn't
/// unmask one of the key sixteenths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRecoveryFailure {
    pub obituary: MessageHash,
    pub secret_recoveries: Vec<MessageHash>,
    /// The relay whose key sixteenth couldn't be unmasked.
    pub key_sharer: RelayNumber,
    /// The part of the key quarter shared with the dead relay.
    pub position: u8,
    /// What the successor got by adding up the four shared secret quarters.
    pub sum_of_shared_secret_quarters: AffinePoint,
}

/// Everything a failure report refers to.
#[derive(Debug, Clone)]
pub struct FailureTarget {
    pub dead_relay: RelayNumber,
    pub successor: RelayNumber,
    pub key_sharer: RelayNumber,
    /// The key quarter the key sharer shares with the dead relay.
    pub quarter: u8,
    /// The key sixteenth that could not be recovered.
    pub point: AffinePoint,
}

impl SecretRecoveryFailure {
    pub fn dependencies(&self) -> Vec<MessageHash> {
        let mut out = vec![self.obituary];
        out.extend(self.secret_recoveries.iter().copied());
        out
    }

    pub fn target(
        &self,
        state: &RelayState,
        messages: &dyn MessageStore,
    ) -> Result<FailureTarget, ValidationError> {
        let obituary = messages
            .obituary(&self.obituary)
            .ok_or(ValidationError::UnknownMessage(self.obituary))?;
        let position = self.position as usize;
        if position >= SIXTEENTHS_PER_QUARTER {
            return Err(ValidationError::PositionOutOfRange);
        }
        let quarter = relay(state, self.key_sharer)?
            .holders
            .quarter_holder_position(obituary.dead_relay)
            .ok_or(ValidationError::WrongKeyQuarterSharers)?;
        let point = shared_key_sixteenth(state, self.key_sharer, quarter as u8, position)?;
        Ok(FailureTarget {
            dead_relay: obituary.dead_relay,
            successor: obituary.successor,
            key_sharer: self.key_sharer,
            quarter: quarter as u8,
            point,
        })
    }

    /// The recovery message a given quarter holder contributed.
    pub fn recovery_from<'a>(
        &self,
        quarter_holder: RelayNumber,
        messages: &'a dyn MessageStore,
    ) -> Option<(MessageHash, &'a SecretRecovery)> {
        self.secret_recoveries.iter().find_map(|h| {
            messages
                .fetch::<SecretRecovery>(h)
                .filter(|r| r.content.quarter_holder == quarter_holder)
                .map(|r| (*h, &r.content))
        })
    }
}

impl Validate for Signed<SecretRecoveryFailure> {
    fn validate(&self, context: &ValidationContext<'_>) -> Result<(), ValidationError> {
        let failure = &self.content;
        super::check_len(&failure.secret_recoveries, 4, "secret recoveries")?;

        let target = failure.target(context.state, context.messages)?;
        let dead = relay(context.state, target.dead_relay)?;

        let mut holders = Vec::with_capacity(4);
        for hash in &failure.secret_recoveries {
            let recovery = context
                .messages
                .fetch::<SecretRecovery>(hash)
                .ok_or(ValidationError::UnknownMessage(*hash))?;
            if recovery.content.obituary != failure.obituary
                || !dead.hashes.secret_recoveries.contains(hash)
                || holders.contains(&recovery.content.quarter_holder)
                || !recovery.content.covers(target.key_sharer, target.quarter)
            {
                return Err(ValidationError::InconsistentRecoveryMessages);
            }
            holders.push(recovery.content.quarter_holder);
        }

        let successor = relay(context.state, target.successor)?;
        self.verify_or_reject(&successor.public_signing_key)
    }
}

/// A quarter holder's public account of its contribution to a failed recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryFailureAudit {
    pub failure: MessageHash,
    pub quarter_holder: RelayNumber,
    pub private_receiving_key_quarter: Scalar,
}

impl RecoveryFailureAudit {
    pub fn generate<K: KeyStore + ?Sized>(
        failure_hash: MessageHash,
        failure: &SecretRecoveryFailure,
        quarter_holder: RelayNumber,
        state: &RelayState,
        messages: &dyn MessageStore,
        keys: &K,
    ) -> Result<Self, Error> {
        let target = failure.target(state, messages)?;
        let dead = relay(state, target.dead_relay)?;
        let quarter = dead.holders.quarter_holder_position(quarter_holder).ok_or(
            ValidationError::NotAKeyQuarterHolder {
                holder: quarter_holder,
                relay: dead.number,
            },
        )?;
        let private_receiving_key_quarter = dead
            .public_key_set
            .receiving_private_key_quarter(&target.point, quarter, keys)
            .ok_or(Error::MissingKeyMaterial(quarter_holder))?;
        Ok(Self {
            failure: failure_hash,
            quarter_holder,
            private_receiving_key_quarter,
        })
    }

    pub fn dependencies(&self) -> Vec<MessageHash> {
        vec![self.failure]
    }

    /// Whether the revealed key quarter is genuine, and produces exactly what
    /// the quarter holder sent in its recovery message.
    pub fn is_correct(
        &self,
        failure: &SecretRecoveryFailure,
        state: &RelayState,
        messages: &dyn MessageStore,
    ) -> Result<bool, ValidationError> {
        let target = failure.target(state, messages)?;
        let dead = relay(state, target.dead_relay)?;
        let successor = relay(state, target.successor)?;
        let quarter = dead
            .holders
            .quarter_holder_position(self.quarter_holder)
            .ok_or(ValidationError::NotAKeyQuarterHolder {
                holder: self.quarter_holder,
                relay: dead.number,
            })?;
        let (_, recovery) = failure
            .recovery_from(self.quarter_holder, messages)
            .ok_or(ValidationError::InconsistentRecoveryMessages)?;

        let revealed = (ProjectivePoint::GENERATOR * self.private_receiving_key_quarter).to_affine();
        if dead
            .public_key_set
            .receiving_public_key_quarter(&target.point, quarter)
            != revealed
        {
            return Ok(false);
        }

        let (encrypted, commitment) = recovery
            .shared_secret_quarter(failure.key_sharer, failure.position as usize)
            .ok_or(ValidationError::InconsistentRecoveryMessages)?;
        let shared_secret_quarter =
            (ProjectivePoint::from(target.point) * self.private_receiving_key_quarter).to_affine();
        let reencrypted = successor.public_key_set.encrypt_point(&shared_secret_quarter);
        Ok(reencrypted == (*encrypted, *commitment))
    }

    /// The shared secret quarter this audit vouches for.
    pub fn shared_secret_quarter(&self, point: &AffinePoint) -> ProjectivePoint {
        ProjectivePoint::from(*point) * self.private_receiving_key_quarter
    }
}

impl Validate for Signed<RecoveryFailureAudit> {
    fn validate(&self, context: &ValidationContext<'_>) -> Result<(), ValidationError> {
        let audit = &self.content;
        let failure = &context
            .messages
            .fetch::<SecretRecoveryFailure>(&audit.failure)
            .ok_or(ValidationError::UnknownMessage(audit.failure))?
            .content;
        let target = failure.target(context.state, context.messages)?;
        let dead = relay(context.state, target.dead_relay)?;
        if dead
            .holders
            .quarter_holder_position(audit.quarter_holder)
            .is_none()
            || failure
                .recovery_from(audit.quarter_holder, context.messages)
                .is_none()
        {
            return Err(ValidationError::NotAKeyQuarterHolder {
                holder: audit.quarter_holder,
                relay: dead.number,
            });
        }
        let already_sent = context
            .messages
            .responses(&audit.failure, ResponseKind::RecoveryFailureAudits)
            .iter()
            .filter_map(|h| context.messages.fetch::<RecoveryFailureAudit>(h))
            .any(|a| a.content.quarter_holder == audit.quarter_holder);
        if already_sent {
            return Err(ValidationError::DuplicateResponse(audit.quarter_holder));
        }
        let holder = relay(context.state, audit.quarter_holder)?;
        self.verify_or_reject(&holder.public_signing_key)
    }
}

/// Check that `recoveries` came from four different quarter holders of
/// `dead`, one for each key quarter, all answering the current obituary.
fn check_recoveries_cover_every_quarter(
    context: &ValidationContext<'_>,
    dead: &Relay,
    obituary: MessageHash,
    recoveries: &[MessageHash],
) -> Result<(), ValidationError> {
    let mut quarters = Vec::with_capacity(recoveries.len());
    for hash in recoveries {
        let recovery = &context
            .messages
            .fetch::<SecretRecovery>(hash)
            .ok_or(ValidationError::UnknownMessage(*hash))?
            .content;
        if recovery.obituary != obituary || !dead.hashes.secret_recoveries.contains(hash) {
            return Err(ValidationError::InconsistentRecoveryMessages);
        }
        match dead.holders.quarter_holder_position(recovery.quarter_holder) {
            Some(quarter) if !quarters.contains(&quarter) => quarters.push(quarter),
            _ => return Err(ValidationError::InconsistentRecoveryMessages),
        }
    }
    Ok(())
}

/// The successor's announcement that it now holds everything the dead relay held.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessionCompleted {
    pub dead_relay: RelayNumber,
    pub successor: RelayNumber,
    pub goodbye: Option<MessageHash>,
    pub secret_recoveries: Vec<MessageHash>,
}

impl SuccessionCompleted {
    pub fn dependencies(&self) -> Vec<MessageHash> {
        let mut out: Vec<MessageHash> = self.goodbye.iter().copied().collect();
        out.extend(self.secret_recoveries.iter().copied());
        out
    }
}

impl Validate for Signed<SuccessionCompleted> {
    fn validate(&self, context: &ValidationContext<'_>) -> Result<(), ValidationError> {
        let completed = &self.content;
        let dead = relay(context.state, completed.dead_relay)?;
        let successor = relay(context.state, completed.successor)?;

        match completed.goodbye {
            Some(goodbye_hash) => {
                let goodbye = context
                    .messages
                    .fetch::<Goodbye>(&goodbye_hash)
                    .ok_or(ValidationError::UnknownMessage(goodbye_hash))?;
                if dead.hashes.goodbye != Some(goodbye_hash)
                    || goodbye.content.successor != successor.number
                    || !completed.secret_recoveries.is_empty()
                {
                    return Err(ValidationError::WrongSuccessor {
                        expected: goodbye.content.successor,
                        actual: successor.number,
                    });
                }
                if dead.is_dead() {
                    return Err(ValidationError::RelayIsDead(dead.number));
                }
            }
            None => {
                super::check_len(&completed.secret_recoveries, 4, "secret recoveries")?;
                let obituary = dead
                    .hashes
                    .obituary
                    .ok_or(ValidationError::ObituaryMismatch(dead.number))?;
                let expected = context
                    .state
                    .successor_of(dead.number)
                    .ok_or(ValidationError::ObituaryMismatch(dead.number))?;
                if expected != successor.number {
                    return Err(ValidationError::WrongSuccessor {
                        expected,
                        actual: successor.number,
                    });
                }
                check_recoveries_cover_every_quarter(
                    context,
                    dead,
                    obituary,
                    &completed.secret_recoveries,
                )?;
            }
        }

        self.verify_or_reject(&successor.public_signing_key)
    }
}
