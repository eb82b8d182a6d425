//! Hashing primitives shared by the rest of the crate.
//!
//! Two kinds of hash show up here. Message and state identities are
//! commitments made with Meow over the msgpack encoding of a value,
//! while the key splitting arithmetic uses plain SHA-256 digests, chained
//! to produce deterministic pseudo-random sequences.
use std::{fmt, io::Write};

use auto_ops::impl_op_ex;
use ck_meow::Meow;
use digest::{Digest, FixedOutput};
use ecdsa::hazmat::DigestPrimitive;
use elliptic_curve::{ops::Reduce, sec1::ToEncodedPoint, Curve};
use k256::{AffinePoint, FieldBytes, ProjectivePoint, Scalar, Secp256k1};
use serde::{Deserialize, Serialize};

use crate::serde::encode_writer;

const MESSAGE_HASH_LABEL: &[u8] = b"relay-custody v0.1.0 message hash";
const HASH_LEN: usize = 32;

struct MeowWriter<'a>(&'a mut Meow);

impl<'a> Write for MeowWriter<'a> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.ad(buf, true);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// The identity of a message, an obituary, a ledger anchor, or a state snapshot.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct MessageHash([u8; HASH_LEN]);

impl MessageHash {
    pub const fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; HASH_LEN]
    }
}

impl AsRef<[u8]> for MessageHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for MessageHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..8] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for MessageHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageHash({})", self)
    }
}

/// Hash an arbitrary serializable value, separated by a domain tag.
pub fn hash_value<T: Serialize + ?Sized>(domain: &[u8], val: &T) -> MessageHash {
    let mut meow = Meow::new(MESSAGE_HASH_LABEL);

    meow.ad(domain, false);
    encode_writer(&mut MeowWriter(&mut meow), val);

    let mut out = [0u8; HASH_LEN];
    meow.prf(&mut out, false);

    MessageHash(out)
}

/// A SHA-256 digest.
///
/// Digests can be xored together, which is how secrets get masked.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Digest256(pub [u8; HASH_LEN]);

impl_op_ex!(^ |a: &Digest256, b: &Digest256| -> Digest256 {
    let mut out = [0u8; HASH_LEN];
    for (o, (x, y)) in out.iter_mut().zip(a.0.iter().zip(b.0.iter())) {
        *o = x ^ y;
    }
    Digest256(out)
});

impl fmt::Debug for Digest256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest256(")?;
        for b in &self.0[..8] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

impl Digest256 {
    /// Interpret a scalar's big-endian encoding as a digest.
    pub fn from_scalar(scalar: &Scalar) -> Self {
        Self(scalar.to_bytes().into())
    }

    /// Read this digest back as a scalar, if it is canonical.
    pub fn to_scalar(&self) -> Option<Scalar> {
        let repr = FieldBytes::from(self.0);
        Option::from(<Scalar as elliptic_curve::PrimeField>::from_repr(repr))
    }

    /// The low 16 bits, read as a big-endian integer.
    pub fn low_u16(&self) -> u16 {
        u16::from_be_bytes([self.0[30], self.0[31]])
    }

    /// Reduce this digest, read as a big-endian integer, modulo `n`.
    pub fn modulo(&self, n: usize) -> usize {
        let mut acc: u128 = 0;
        let n = n as u128;
        for &b in &self.0 {
            acc = ((acc << 8) | b as u128) % n;
        }
        acc as usize
    }
}

/// SHA-256 of some bytes.
pub fn sha256(data: &[u8]) -> Digest256 {
    let digest = <Secp256k1 as DigestPrimitive>::Digest::new_with_prefix(data);
    Digest256(digest.finalize_fixed().into())
}

/// SHA-256 of several byte strings, concatenated.
pub fn sha256_parts(parts: &[&[u8]]) -> Digest256 {
    let mut digest = <Secp256k1 as DigestPrimitive>::Digest::new();
    for part in parts {
        digest.update(part);
    }
    Digest256(digest.finalize_fixed().into())
}

/// SHA-256 of the compressed encoding of a point.
pub fn hash_point(point: &AffinePoint) -> Digest256 {
    sha256(point.to_encoded_point(true).as_bytes())
}

/// Hash an arbitrary message in order to produce a scalar.
pub fn scalar_hash(msg: &[u8]) -> Scalar {
    let digest = <Secp256k1 as DigestPrimitive>::Digest::new_with_prefix(msg);
    let m_bytes: FieldBytes = digest.finalize_fixed();
    <Scalar as Reduce<<Secp256k1 as Curve>::Uint>>::reduce_bytes(&m_bytes)
}

/// An endless chain of digests, each the hash of the previous one.
///
/// Every deterministic choice in the protocol (holder selection, successor
/// selection, receiving key weights) walks one of these.
#[derive(Clone, Debug)]
pub struct HashChain {
    current: Digest256,
}

impl HashChain {
    pub fn new(seed: Digest256) -> Self {
        Self { current: seed }
    }

    pub fn from_message_hash(hash: &MessageHash) -> Self {
        Self::new(Digest256(hash.0))
    }

    /// Advance the chain, returning the new link.
    pub fn advance(&mut self) -> Digest256 {
        self.current = sha256(&self.current.0);
        self.current
    }
}

/// Compute `sum_i weights[i] * points[i]` for small weights.
///
/// The weights are only 16 bits wide, so a double-and-add over the weight bits
/// shared across every point is much cheaper than one full multiplication per point.
pub fn weighted_sum<'a>(terms: impl IntoIterator<Item = (u16, &'a AffinePoint)>) -> ProjectivePoint {
    let terms: Vec<(u16, ProjectivePoint)> = terms
        .into_iter()
        .map(|(w, p)| (w, ProjectivePoint::from(*p)))
        .collect();

    let mut acc = ProjectivePoint::IDENTITY;
    for bit in (0..16).rev() {
        acc = acc.double();
        for (w, p) in &terms {
            if (w >> bit) & 1 == 1 {
                acc += p;
            }
        }
    }
    acc
}

#[cfg(test)]
mod test {
    use super::*;

    use elliptic_curve::Field;
    use rand_core::OsRng;

    #[test]
    fn test_weighted_sum_matches_naive_sum() {
        let points: Vec<AffinePoint> = (0..5)
            .map(|_| (ProjectivePoint::GENERATOR * Scalar::random(&mut OsRng)).to_affine())
            .collect();
        let weights = [0u16, 1, 2, 0xFFFF, 0x1234];

        let expected = points
            .iter()
            .zip(weights.iter())
            .fold(ProjectivePoint::IDENTITY, |acc, (p, w)| {
                acc + ProjectivePoint::from(*p) * Scalar::from(*w as u64)
            });
        let actual = weighted_sum(weights.iter().copied().zip(points.iter()));

        assert_eq!(expected, actual);
    }

    #[test]
    fn test_modulo_agrees_with_small_values() {
        let mut bytes = [0u8; 32];
        bytes[31] = 200;
        bytes[30] = 1;
        let d = Digest256(bytes);
        assert_eq!(d.modulo(7), 456 % 7);
        assert_eq!(d.low_u16(), 456);
    }

    #[test]
    fn test_xor_is_an_involution() {
        let a = sha256(b"a");
        let b = sha256(b"b");
        assert_eq!(a ^ b ^ b, a);
        assert_ne!(a ^ b, a);
    }

    #[test]
    fn test_value_hashes_are_domain_separated() {
        assert_ne!(hash_value(b"one", &1u32), hash_value(b"two", &1u32));
        assert_eq!(hash_value(b"one", &1u32), hash_value(b"one", &1u32));
    }
}
