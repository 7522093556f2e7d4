//! Provable-data-possession primitives over BLS12-381.
//!
//! A storage provider tags every data segment with a homomorphic
//! authenticator; later it answers challenges by producing a compact proof
//! which any verifier can check against the provider's public parameters,
//! without ever seeing the data. The construction is the compact
//! pairing-based scheme: for segment `i` with data digest `m`,
//!
//! ```text
//! sigma_i = alpha * (H(i) + m * u)
//! ```
//!
//! where `alpha` is the private scalar, `u` a per-sector random group element
//! and `H` a hash-to-group map. A challenge is a random scalar `nu` bound to
//! `i`; the proof `(mu, sigma) = (nu * m, nu * sigma_i)` passes iff
//!
//! ```text
//! e(sigma, g2) == e(nu * H(i) + mu * u, v)       with v = alpha * g2
//! ```
//!
//! Everything that crosses a process boundary uses the textual encodings in
//! [`marshal`](PublicParams::marshal)/`parse`: comma-separated base64 fields,
//! with indices carried as base64 of their decimal representation.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bls12_381::{pairing, G1Affine, G1Projective, G2Affine, G2Projective, Scalar};
use ff::Field;
use group::{Curve, Group};
use rand::RngCore;
use sha2::{Digest, Sha512};

/// Domain separation prefixes for the hash-to-scalar derivations.
const DST_ALPHA: &[u8] = b"lambda-pdp:alpha";
const DST_DATA: &[u8] = b"lambda-pdp:data";
const DST_INDEX: &[u8] = b"lambda-pdp:index";
const DST_CHAL: &[u8] = b"lambda-pdp:chal";

#[derive(Debug, thiserror::Error)]
pub enum PdpError {
    #[error("secret material must not be empty")]
    EmptySecret,

    #[error("expected two comma-separated fields")]
    MalformedEncoding,

    #[error(transparent)]
    Base64(#[from] base64::DecodeError),

    #[error("encoded index is not a decimal integer")]
    InvalidIndex,

    #[error("invalid curve point encoding")]
    InvalidPoint,

    #[error("invalid scalar encoding")]
    InvalidScalar,
}

/// The prover-only half of a parameter pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateParams {
    alpha: Scalar,
}

/// Verifier-visible parameters: the tag generator `u` and the public key
/// `v = alpha * g2`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicParams {
    u: G1Affine,
    v: G2Affine,
}

/// Homomorphic authenticator for one data segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    index: i64,
    sigma: G1Affine,
}

/// A challenge against one segment index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chal {
    index: i64,
    nu: Scalar,
}

/// A possession proof answering one [`Chal`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proof {
    mu: Scalar,
    sigma: G1Affine,
}

impl PrivateParams {
    /// Derives the private scalar from caller-provided secret material
    /// (typically the provider's account key bytes).
    pub fn generate(secret: &[u8]) -> Result<Self, PdpError> {
        if secret.is_empty() {
            return Err(PdpError::EmptySecret);
        }
        Ok(Self {
            alpha: hash_to_scalar(DST_ALPHA, &[secret]),
        })
    }

    /// Binds a fresh random group element `u` into a public parameter set.
    pub fn derive_public(&self, u: G1Projective) -> PublicParams {
        PublicParams {
            u: u.to_affine(),
            v: (G2Projective::generator() * self.alpha).to_affine(),
        }
    }
}

/// A uniformly random element of the tag group.
pub fn rand_elliptic_point<R: RngCore>(rng: &mut R) -> G1Projective {
    G1Projective::random(rng)
}

/// Tags `data` as segment `index` under `(sp, pp)`.
pub fn gen_tag(sp: &PrivateParams, pp: &PublicParams, index: i64, data: &[u8]) -> Tag {
    let m = data_scalar(data);
    let base = index_point(index) + G1Projective::from(pp.u) * m;
    Tag {
        index,
        sigma: (base * sp.alpha).to_affine(),
    }
}

/// A random challenge for segment `index`.
pub fn gen_chal(index: i64) -> Chal {
    Chal {
        index,
        nu: Scalar::random(&mut rand::thread_rng()),
    }
}

/// A deterministic challenge for segment `index`, bound to a round-wide seed.
/// The same `(index, seed)` pair yields a bitwise-identical challenge on any
/// machine, so provers cannot be asked twice for different answers.
pub fn gen_chal_with_seed(index: i64, seed: &str) -> Chal {
    Chal {
        index,
        nu: hash_to_scalar(DST_CHAL, &[seed.as_bytes(), &index.to_le_bytes()]),
    }
}

/// Answers `chal` for the segment carrying `tag` over `data`.
pub fn prove(_pp: &PublicParams, chal: &Chal, tag: &Tag, data: &[u8]) -> Proof {
    let m = data_scalar(data);
    Proof {
        mu: chal.nu * m,
        sigma: (G1Projective::from(tag.sigma) * chal.nu).to_affine(),
    }
}

/// Pairing check: `e(sigma, g2) == e(nu * H(i) + mu * u, v)`.
pub fn verify(pp: &PublicParams, chal: &Chal, proof: &Proof) -> bool {
    let lhs = pairing(&proof.sigma, &G2Affine::generator());
    let combined =
        index_point(chal.index) * chal.nu + G1Projective::from(pp.u) * proof.mu;
    let rhs = pairing(&combined.to_affine(), &pp.v);
    lhs == rhs
}

impl PublicParams {
    pub fn marshal(&self) -> String {
        format!(
            "{},{}",
            BASE64.encode(self.u.to_compressed()),
            BASE64.encode(self.v.to_compressed())
        )
    }

    pub fn parse(s: &str) -> Result<Self, PdpError> {
        let (u, v) = split_fields(s)?;
        Ok(Self {
            u: decode_g1(u)?,
            v: decode_g2(v)?,
        })
    }
}

impl Tag {
    pub fn index(&self) -> i64 {
        self.index
    }

    pub fn marshal(&self) -> String {
        format!(
            "{},{}",
            BASE64.encode(self.index.to_string()),
            BASE64.encode(self.sigma.to_compressed())
        )
    }

    pub fn parse(s: &str) -> Result<Self, PdpError> {
        let (index, sigma) = split_fields(s)?;
        Ok(Self {
            index: decode_index(index)?,
            sigma: decode_g1(sigma)?,
        })
    }
}

impl Chal {
    /// The segment index this challenge targets. Verifiers recover the
    /// prover's claimed index from here.
    pub fn index(&self) -> i64 {
        self.index
    }

    pub fn marshal(&self) -> String {
        format!(
            "{},{}",
            BASE64.encode(self.index.to_string()),
            BASE64.encode(self.nu.to_bytes())
        )
    }

    pub fn parse(s: &str) -> Result<Self, PdpError> {
        let (index, nu) = split_fields(s)?;
        Ok(Self {
            index: decode_index(index)?,
            nu: decode_scalar(nu)?,
        })
    }
}

impl Proof {
    pub fn marshal(&self) -> String {
        format!(
            "{},{}",
            BASE64.encode(self.mu.to_bytes()),
            BASE64.encode(self.sigma.to_compressed())
        )
    }

    pub fn parse(s: &str) -> Result<Self, PdpError> {
        let (mu, sigma) = split_fields(s)?;
        Ok(Self {
            mu: decode_scalar(mu)?,
            sigma: decode_g1(sigma)?,
        })
    }
}

fn hash_to_scalar(domain: &[u8], parts: &[&[u8]]) -> Scalar {
    let mut hasher = Sha512::new();
    hasher.update(domain);
    for part in parts {
        hasher.update(part);
    }
    let mut wide = [0u8; 64];
    wide.copy_from_slice(&hasher.finalize());
    Scalar::from_bytes_wide(&wide)
}

fn data_scalar(data: &[u8]) -> Scalar {
    hash_to_scalar(DST_DATA, &[data])
}

fn index_point(index: i64) -> G1Projective {
    G1Projective::generator() * hash_to_scalar(DST_INDEX, &[&index.to_le_bytes()])
}

fn split_fields(s: &str) -> Result<(&str, &str), PdpError> {
    s.split_once(',').ok_or(PdpError::MalformedEncoding)
}

fn decode_g1(s: &str) -> Result<G1Affine, PdpError> {
    let bytes: [u8; 48] = BASE64
        .decode(s)?
        .try_into()
        .map_err(|_| PdpError::InvalidPoint)?;
    Option::from(G1Affine::from_compressed(&bytes)).ok_or(PdpError::InvalidPoint)
}

fn decode_g2(s: &str) -> Result<G2Affine, PdpError> {
    let bytes: [u8; 96] = BASE64
        .decode(s)?
        .try_into()
        .map_err(|_| PdpError::InvalidPoint)?;
    Option::from(G2Affine::from_compressed(&bytes)).ok_or(PdpError::InvalidPoint)
}

fn decode_scalar(s: &str) -> Result<Scalar, PdpError> {
    let bytes: [u8; 32] = BASE64
        .decode(s)?
        .try_into()
        .map_err(|_| PdpError::InvalidScalar)?;
    Option::from(Scalar::from_bytes(&bytes)).ok_or(PdpError::InvalidScalar)
}

fn decode_index(s: &str) -> Result<i64, PdpError> {
    let raw = BASE64.decode(s)?;
    let text = core::str::from_utf8(&raw).map_err(|_| PdpError::InvalidIndex)?;
    text.parse().map_err(|_| PdpError::InvalidIndex)
}
