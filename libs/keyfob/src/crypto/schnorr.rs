//! Schnorr signatures over P-256.
//!
//! Interactive commands are authenticated symmetrically; this asymmetric
//! scheme backs the offline JWS helper. Signature layout is `R.x || s`
//! (64 bytes), challenge `e = SHA-256(R.x || public_sec1 || message)`,
//! `s = k + e·d`.

use crate::error::Error;
use fleetlink_model::MessageFault;
use p256::elliptic_curve::PrimeField as _;
use p256::elliptic_curve::bigint::U256;
use p256::elliptic_curve::ops::Reduce;
use p256::elliptic_curve::sec1::ToEncodedPoint as _;
use p256::{FieldBytes, NonZeroScalar, ProjectivePoint, PublicKey, Scalar, SecretKey};
use rand::rngs::OsRng;
use sha2::{Digest as _, Sha256};

pub const SIGNATURE_LENGTH: usize = 64;

pub(crate) fn sign(secret: &SecretKey, message: &[u8]) -> Result<Vec<u8>, Error> {
    let public = secret.public_key().to_encoded_point(false);
    let d = *secret.to_nonzero_scalar().as_ref();

    let k = NonZeroScalar::random(&mut OsRng);
    let r = (ProjectivePoint::GENERATOR * *k.as_ref()).to_affine();
    let r = r.to_encoded_point(false);
    let r_x = r.x().ok_or_else(|| Error::new(MessageFault::Internal))?;

    let e = challenge(r_x, public.as_bytes(), message);
    let s = *k.as_ref() + e * d;

    let mut signature = Vec::with_capacity(SIGNATURE_LENGTH);
    signature.extend_from_slice(r_x);
    signature.extend_from_slice(&s.to_repr());

    Ok(signature)
}

pub fn verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    if signature.len() != SIGNATURE_LENGTH {
        return false;
    }
    let Ok(public) = PublicKey::from_sec1_bytes(public_key) else {
        return false;
    };

    let (r_x, s_bytes) = signature.split_at(32);
    let Some(s) = Option::<Scalar>::from(Scalar::from_repr(FieldBytes::clone_from_slice(s_bytes)))
    else {
        return false;
    };

    let e = challenge(r_x, public.to_encoded_point(false).as_bytes(), message);

    // R' = s·G − e·P; the signature is valid iff R'.x matches.
    let r_prime =
        (ProjectivePoint::GENERATOR * s - ProjectivePoint::from(*public.as_affine()) * e)
            .to_affine()
            .to_encoded_point(false);

    match r_prime.x() {
        Some(x) => x.as_slice() == r_x,
        None => false,
    }
}

fn challenge(r_x: &[u8], public_sec1: &[u8], message: &[u8]) -> Scalar {
    let mut digest = Sha256::new();
    digest.update(r_x);
    digest.update(public_sec1);
    digest.update(message);

    <Scalar as Reduce<U256>>::reduce_bytes(&digest.finalize())
}
