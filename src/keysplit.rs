//! Additive key splitting.
//!
//! Each relay's key is the sum of sixteen secret scalars, the *key sixteenths*.
//! Every sixteenth is the first entry of a row of four secrets, the other three
//! being derived from it by hashing, so that a holder of a sixteenth can
//! check the whole row it belongs to against the published points:
//! ```ignore
//! row i: s_i, H(s_i + 1), H(s_i + 2), H(s_i + 3)
//! ```
//! Four consecutive rows make up a *key quarter*.
//!
//! The 64 secrets also act as a decryption key. For any point `P`, hashing
//! `P` seeds a chain of 16 bit weights, one per secret, and the weighted sum
//! of the secrets is the private *receiving key* for `P`:
//! ```ignore
//! r(P) = sum_j w_j(P) * secret_j        R(P) = r(P) * G
//! ```
//! Anyone can compute `R(P)` from the public points. Restricting the sum to
//! the rows of one quarter gives a *receiving key quarter*; the four quarters
//! add up to the receiving key.
//!
//! To send a secret `s` with `P = s * G` to a relay, we mask it with the hash
//! of `s * R(P) = r(P) * P`, which only `s` and the owner of the receiving key
//! can compute. The recipient recovers `s` and checks it against `P`.
use elliptic_curve::{
    sec1::{FromEncodedPoint, ToEncodedPoint},
    Field,
};
use k256::{AffinePoint, EncodedPoint, ProjectivePoint, Scalar};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use subtle::{ConstantTimeEq, CtOption};

use crate::{
    constants::{KEY_QUARTERS, KEY_SIXTEENTHS, ROW_LENGTH, SIXTEENTHS_PER_QUARTER},
    crypto::{hash_point, scalar_hash, sha256_parts, weighted_sum, Digest256, HashChain},
    keystore::KeyStore,
};

/// A secret masked for one recipient.
pub type EncryptedSecret = Digest256;

/// Derive the row of secrets that starts with a key sixteenth.
pub fn row_secrets(key_sixteenth: &Scalar) -> [Scalar; ROW_LENGTH] {
    let mut out = [*key_sixteenth; ROW_LENGTH];
    for (i, part) in out.iter_mut().enumerate().skip(1) {
        let shifted = *key_sixteenth + Scalar::from(i as u64);
        *part = scalar_hash(&shifted.to_bytes());
    }
    out
}

fn row_points(secrets: &[Scalar; ROW_LENGTH]) -> [AffinePoint; ROW_LENGTH] {
    secrets.map(|s| (ProjectivePoint::GENERATOR * s).to_affine())
}

/// The public half of a relay's split key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeySet {
    rows: Vec<[AffinePoint; ROW_LENGTH]>,
}

impl PublicKeySet {
    /// Generate a fresh key, filing every secret in `keys`.
    pub fn generate<K: KeyStore + ?Sized>(rng: &mut impl CryptoRngCore, keys: &mut K) -> Self {
        let rows = (0..KEY_SIXTEENTHS)
            .map(|_| {
                let secrets = row_secrets(&Scalar::random(&mut *rng));
                let points = row_points(&secrets);
                for (point, secret) in points.iter().zip(secrets.iter()) {
                    keys.insert(*point, *secret);
                }
                points
            })
            .collect();
        Self { rows }
    }

    pub fn from_rows(rows: Vec<[AffinePoint; ROW_LENGTH]>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[[AffinePoint; ROW_LENGTH]] {
        &self.rows
    }

    /// Sixteen rows, none containing the identity.
    pub fn is_well_formed(&self) -> bool {
        self.rows.len() == KEY_SIXTEENTHS
            && self
                .rows
                .iter()
                .flatten()
                .all(|p| *p != AffinePoint::IDENTITY)
    }

    /// The public key sixteenths, i.e. the first point of each row.
    pub fn key_sixteenths(&self) -> Vec<AffinePoint> {
        self.rows.iter().map(|row| row[0]).collect()
    }

    pub fn key_sixteenth(&self, position: usize) -> Option<&AffinePoint> {
        self.rows.get(position).map(|row| &row[0])
    }

    /// The key this relay signs with: the sum of its key sixteenths.
    pub fn public_signing_key(&self) -> AffinePoint {
        self.rows
            .iter()
            .fold(ProjectivePoint::IDENTITY, |acc, row| acc + ProjectivePoint::from(row[0]))
            .to_affine()
    }

    pub fn private_signing_key<K: KeyStore + ?Sized>(&self, keys: &K) -> Option<Scalar> {
        self.rows.iter().try_fold(Scalar::ZERO, |acc, row| {
            keys.private_key(&row[0]).map(|s| acc + s)
        })
    }

    /// Check that a key sixteenth generates the published row at `position`.
    pub fn verify_row(&self, position: usize, key_sixteenth: &Scalar) -> bool {
        match self.rows.get(position) {
            Some(row) => row_points(&row_secrets(key_sixteenth)) == *row,
            None => false,
        }
    }

    /// Whether `keys` knows every secret in the row at `position`.
    pub fn has_row_secrets<K: KeyStore + ?Sized>(&self, position: usize, keys: &K) -> bool {
        self.rows
            .get(position)
            .map(|row| row.iter().all(|p| keys.contains(p)))
            .unwrap_or(false)
    }

    /// The 64 receiving key weights for `point`, in row order.
    ///
    /// The chain advances once per secret even when only a quarter is used,
    /// which keeps the quarters consistent with the full key.
    fn receiving_weights(point: &AffinePoint) -> Vec<u16> {
        let mut chain = HashChain::new(hash_point(point));
        (0..KEY_SIXTEENTHS * ROW_LENGTH)
            .map(|_| chain.advance().low_u16())
            .collect()
    }

    fn weighted_points(
        &self,
        point: &AffinePoint,
        quarter: Option<usize>,
    ) -> impl Iterator<Item = (u16, &AffinePoint)> {
        let weights = Self::receiving_weights(point);
        self.rows
            .iter()
            .take(KEY_SIXTEENTHS)
            .enumerate()
            .filter(move |(i, _)| quarter.map_or(true, |q| i / SIXTEENTHS_PER_QUARTER == q))
            .flat_map(|(i, row)| row.iter().enumerate().map(move |(j, p)| (i * ROW_LENGTH + j, p)))
            .map(move |(k, p)| (weights[k], p))
    }

    fn weighted_secrets<K: KeyStore + ?Sized>(
        &self,
        point: &AffinePoint,
        quarter: Option<usize>,
        keys: &K,
    ) -> Option<Scalar> {
        self.weighted_points(point, quarter)
            .try_fold(Scalar::ZERO, |acc, (w, p)| {
                keys.private_key(p).map(|s| acc + s * Scalar::from(w as u64))
            })
    }

    /// The public key used to encrypt the secret behind `point` to this relay.
    pub fn receiving_public_key(&self, point: &AffinePoint) -> AffinePoint {
        weighted_sum(self.weighted_points(point, None)).to_affine()
    }

    pub fn receiving_private_key<K: KeyStore + ?Sized>(
        &self,
        point: &AffinePoint,
        keys: &K,
    ) -> Option<Scalar> {
        self.weighted_secrets(point, None, keys)
    }

    /// The contribution of one key quarter to [Self::receiving_public_key].
    pub fn receiving_public_key_quarter(&self, point: &AffinePoint, quarter: usize) -> AffinePoint {
        debug_assert!(quarter < KEY_QUARTERS);
        weighted_sum(self.weighted_points(point, Some(quarter))).to_affine()
    }

    pub fn receiving_private_key_quarter<K: KeyStore + ?Sized>(
        &self,
        point: &AffinePoint,
        quarter: usize,
        keys: &K,
    ) -> Option<Scalar> {
        if quarter >= KEY_QUARTERS {
            return None;
        }
        self.weighted_secrets(point, Some(quarter), keys)
    }

    /// Encrypt `secret` so that only this relay can read it.
    pub fn encrypt(&self, secret: &Scalar) -> EncryptedSecret {
        let point = (ProjectivePoint::GENERATOR * secret).to_affine();
        let receiving_key = ProjectivePoint::from(self.receiving_public_key(&point));
        let shared = (receiving_key * secret).to_affine();
        Digest256::from_scalar(secret) ^ hash_point(&shared)
    }

    /// Decrypt the secret behind `point`.
    ///
    /// This returns `None` if this node lacks the receiving key, or if the
    /// ciphertext does not hold the discrete logarithm of `point`.
    pub fn decrypt<K: KeyStore + ?Sized>(
        &self,
        encrypted: &EncryptedSecret,
        point: &AffinePoint,
        keys: &K,
    ) -> Option<Scalar> {
        let receiving_key = self.receiving_private_key(point, keys)?;
        decrypt_with_receiving_key(encrypted, point, &receiving_key)
    }

    /// Encrypt a point to this relay.
    ///
    /// The returned commitment is published next to the ciphertext; it is the
    /// point whose receiving key masks the encrypted point.
    pub fn encrypt_point(&self, point: &AffinePoint) -> (EncryptedPoint, AffinePoint) {
        let c = point_commitment_scalar(point);
        let commitment = (ProjectivePoint::GENERATOR * c).to_affine();
        let receiving_key = ProjectivePoint::from(self.receiving_public_key(&commitment));
        let shared = (receiving_key * c).to_affine();
        (EncryptedPoint::mask(point, &shared), commitment)
    }

    pub fn decrypt_point<K: KeyStore + ?Sized>(
        &self,
        encrypted: &EncryptedPoint,
        commitment: &AffinePoint,
        keys: &K,
    ) -> Option<AffinePoint> {
        let receiving_key = self.receiving_private_key(commitment, keys)?;
        decrypt_point_with_receiving_key(encrypted, commitment, &receiving_key)
    }
}

/// Decrypt with an explicitly given private receiving key.
///
/// This is how third parties check a complaint, once the complainer has
/// revealed its receiving key.
pub fn decrypt_with_receiving_key(
    encrypted: &EncryptedSecret,
    point: &AffinePoint,
    receiving_key: &Scalar,
) -> Option<Scalar> {
    let shared = (ProjectivePoint::from(*point) * receiving_key).to_affine();
    decrypt_with_shared_secret(encrypted, point, &shared)
}

/// Decrypt with the shared secret `r(P) * P` itself.
///
/// A successor assembles this from the shared secret quarters sent by a dead
/// relay's key quarter holders.
pub fn decrypt_with_shared_secret(
    encrypted: &EncryptedSecret,
    point: &AffinePoint,
    shared: &AffinePoint,
) -> Option<Scalar> {
    let secret = (encrypted ^ hash_point(shared)).to_scalar()?;
    let matches = (ProjectivePoint::GENERATOR * secret).to_affine().ct_eq(point);
    Option::from(CtOption::new(secret, matches))
}

pub fn decrypt_point_with_receiving_key(
    encrypted: &EncryptedPoint,
    commitment: &AffinePoint,
    receiving_key: &Scalar,
) -> Option<AffinePoint> {
    let shared = (ProjectivePoint::from(*commitment) * receiving_key).to_affine();
    let point = encrypted.unmask(&shared)?;
    let c = point_commitment_scalar(&point);
    if (ProjectivePoint::GENERATOR * c).to_affine() == *commitment {
        Some(point)
    } else {
        None
    }
}

fn point_commitment_scalar(point: &AffinePoint) -> Scalar {
    scalar_hash(point.to_encoded_point(true).as_bytes())
}

/// A point masked for one recipient.
///
/// This is the compressed encoding of the point: a tag byte, and the x coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPoint {
    tag: u8,
    x: Digest256,
}

impl EncryptedPoint {
    fn masks(shared: &AffinePoint) -> (u8, Digest256) {
        let key = hash_point(shared);
        let tag_mask = sha256_parts(&[&key.0, b"tag"]).0[0];
        let x_mask = sha256_parts(&[&key.0, b"x"]);
        (tag_mask, x_mask)
    }

    fn mask(point: &AffinePoint, shared: &AffinePoint) -> Self {
        let encoded = point.to_encoded_point(true);
        let bytes = encoded.as_bytes();
        let (tag, x) = match bytes.len() {
            33 => {
                let mut x = [0u8; 32];
                x.copy_from_slice(&bytes[1..]);
                (bytes[0], Digest256(x))
            }
            _ => (0, Digest256::default()),
        };
        let (tag_mask, x_mask) = Self::masks(shared);
        Self {
            tag: tag ^ tag_mask,
            x: x ^ x_mask,
        }
    }

    fn unmask(&self, shared: &AffinePoint) -> Option<AffinePoint> {
        let (tag_mask, x_mask) = Self::masks(shared);
        let tag = self.tag ^ tag_mask;
        let x = self.x ^ x_mask;
        let encoded = if tag == 0 {
            EncodedPoint::identity()
        } else {
            let mut bytes = [0u8; 33];
            bytes[0] = tag;
            bytes[1..].copy_from_slice(&x.0);
            EncodedPoint::from_bytes(bytes).ok()?
        };
        Option::from(AffinePoint::from_encoded_point(&encoded))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use proptest::prelude::*;
    use rand_core::OsRng;

    use crate::keystore::MemoryKeyStore;

    fn setup() -> (PublicKeySet, MemoryKeyStore) {
        let mut keys = MemoryKeyStore::new();
        let set = PublicKeySet::generate(&mut OsRng, &mut keys);
        (set, keys)
    }

    #[test]
    fn test_generated_set_is_consistent() {
        let (set, keys) = setup();
        assert!(set.is_well_formed());
        assert_eq!(keys.len(), KEY_SIXTEENTHS * ROW_LENGTH);

        let private = set.private_signing_key(&keys).unwrap();
        assert_eq!(
            (ProjectivePoint::GENERATOR * private).to_affine(),
            set.public_signing_key()
        );
        for (i, sixteenth) in set.key_sixteenths().iter().enumerate() {
            let secret = keys.private_key(sixteenth).unwrap();
            assert!(set.verify_row(i, &secret));
            assert!(!set.verify_row((i + 1) % KEY_SIXTEENTHS, &secret));
        }
    }

    #[test]
    fn test_receiving_key_quarters_sum_to_receiving_key() {
        let (set, keys) = setup();
        let point = (ProjectivePoint::GENERATOR * Scalar::random(&mut OsRng)).to_affine();

        let private = set.receiving_private_key(&point, &keys).unwrap();
        let public = set.receiving_public_key(&point);
        assert_eq!((ProjectivePoint::GENERATOR * private).to_affine(), public);

        let mut private_sum = Scalar::ZERO;
        let mut public_sum = ProjectivePoint::IDENTITY;
        for q in 0..KEY_QUARTERS {
            let quarter = set.receiving_private_key_quarter(&point, q, &keys).unwrap();
            let public_quarter = set.receiving_public_key_quarter(&point, q);
            assert_eq!((ProjectivePoint::GENERATOR * quarter).to_affine(), public_quarter);
            private_sum += quarter;
            public_sum += ProjectivePoint::from(public_quarter);
        }
        assert_eq!(private_sum, private);
        assert_eq!(public_sum.to_affine(), public);
    }

    #[test]
    fn test_encryption_round_trip_and_tampering() {
        let (recipient, keys) = setup();
        let secret = Scalar::random(&mut OsRng);
        let point = (ProjectivePoint::GENERATOR * secret).to_affine();

        let encrypted = recipient.encrypt(&secret);
        assert_eq!(recipient.decrypt(&encrypted, &point, &keys), Some(secret));

        let mut tampered = encrypted;
        tampered.0[5] ^= 1;
        assert_eq!(recipient.decrypt(&tampered, &point, &keys), None);

        // Nobody else can read it.
        let (other, other_keys) = setup();
        assert_eq!(other.decrypt(&encrypted, &point, &other_keys), None);
    }

    #[test]
    fn test_point_encryption_is_deterministic() {
        let (recipient, keys) = setup();
        let point = (ProjectivePoint::GENERATOR * Scalar::random(&mut OsRng)).to_affine();

        let (encrypted, commitment) = recipient.encrypt_point(&point);
        assert_eq!(recipient.encrypt_point(&point), (encrypted, commitment));
        assert_eq!(
            recipient.decrypt_point(&encrypted, &commitment, &keys),
            Some(point)
        );

        let mut tampered = encrypted;
        tampered.x.0[0] ^= 0x80;
        assert_eq!(recipient.decrypt_point(&tampered, &commitment, &keys), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn test_summed_shared_secret_quarters_decrypt(seed in any::<[u8; 32]>()) {
            let (recipient, keys) = setup();
            let secret = scalar_hash(&seed);
            let point = (ProjectivePoint::GENERATOR * secret).to_affine();
            let encrypted = recipient.encrypt(&secret);

            let mut shared = ProjectivePoint::IDENTITY;
            for q in 0..KEY_QUARTERS {
                let quarter = recipient.receiving_private_key_quarter(&point, q, &keys).unwrap();
                shared += ProjectivePoint::from(point) * quarter;
            }
            let shared = shared.to_affine();
            prop_assert_eq!(decrypt_with_shared_secret(&encrypted, &point, &shared), Some(secret));

            // One quarter is not enough.
            let partial = recipient.receiving_private_key_quarter(&point, 0, &keys).unwrap();
            let partial = (ProjectivePoint::from(point) * partial).to_affine();
            prop_assert_eq!(decrypt_with_shared_secret(&encrypted, &point, &partial), None);
        }
    }
}
