//! Private key storage.
//!
//! Every secret this node learns is filed under its public point, so that
//! anything holding a public key set can ask for the matching secrets.
use std::collections::HashMap;

use elliptic_curve::sec1::ToEncodedPoint;
use k256::{AffinePoint, ProjectivePoint, Scalar};

const COMPRESSED_POINT_LEN: usize = 33;

type PointKey = [u8; COMPRESSED_POINT_LEN];

fn point_key(point: &AffinePoint) -> PointKey {
    // The identity encodes to a single zero byte.
    let encoded = point.to_encoded_point(true);
    let bytes = encoded.as_bytes();
    let mut out = [0u8; COMPRESSED_POINT_LEN];
    out[..bytes.len()].copy_from_slice(bytes);
    out
}

/// A store of private keys, indexed by public key.
pub trait KeyStore {
    /// The secret whose public point is `public`, if this node knows it.
    fn private_key(&self, public: &AffinePoint) -> Option<Scalar>;

    /// Remember `private` as the secret behind `public`.
    fn insert(&mut self, public: AffinePoint, private: Scalar);

    fn contains(&self, public: &AffinePoint) -> bool {
        self.private_key(public).is_some()
    }

    /// Remember a secret, computing its public point.
    fn insert_secret(&mut self, private: Scalar) -> AffinePoint {
        let public = (ProjectivePoint::GENERATOR * private).to_affine();
        self.insert(public, private);
        public
    }
}

/// An in memory key store.
#[derive(Default, Clone)]
pub struct MemoryKeyStore {
    keys: HashMap<PointKey, Scalar>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl KeyStore for MemoryKeyStore {
    fn private_key(&self, public: &AffinePoint) -> Option<Scalar> {
        self.keys.get(&point_key(public)).copied()
    }

    fn insert(&mut self, public: AffinePoint, private: Scalar) {
        self.keys.insert(point_key(&public), private);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use elliptic_curve::Field;
    use rand_core::OsRng;

    #[test]
    fn test_secrets_are_found_by_public_point() {
        let mut keys = MemoryKeyStore::new();
        let secret = Scalar::random(&mut OsRng);
        let public = keys.insert_secret(secret);

        assert_eq!(keys.private_key(&public), Some(secret));
        assert!(!keys.contains(&AffinePoint::GENERATOR));
        assert_eq!(keys.len(), 1);
    }
}
