use oci_spec::image::{Descriptor, Digest, DigestAlgorithm, Sha256Digest};
use sha2::Sha256;

use crate::error::Error;

// sha256 is the only algorithm we mint ourselves; foreign descriptors may
// also carry sha512 and the verifier handles both
pub fn digest_bytes(data: impl AsRef<[u8]>) -> Digest {
    use sha2::Digest;
    use std::str::FromStr;
    Sha256Digest::from_str(&hex::encode(Sha256::digest(data)))
        .unwrap()
        .into()
}

pub fn descriptor_from_bytes(media_type: &str, data: &[u8]) -> Result<Descriptor, Error> {
    if media_type.is_empty() {
        return Err(Error::MissingMediaType);
    }
    Ok(Descriptor::new(
        media_type.into(),
        data.len() as u64,
        digest_bytes(data),
    ))
}

// digest+size only, the identity a CAS cares about
pub fn content_equal(a: &Descriptor, b: &Descriptor) -> bool {
    a.digest() == b.digest() && a.size() == b.size()
}

pub fn equal(a: &Descriptor, b: &Descriptor) -> bool {
    content_equal(a, b) && a.media_type() == b.media_type()
}

pub(crate) fn verify_bytes(expected: &Digest, data: &[u8]) -> Result<(), Error> {
    use sha2::Digest;
    let hex = match expected.algorithm() {
        DigestAlgorithm::Sha256 => hex::encode(Sha256::digest(data)),
        DigestAlgorithm::Sha512 => hex::encode(sha2::Sha512::digest(data)),
        algo => return Err(Error::Unsupported(format!("digest algorithm {algo}"))),
    };
    if hex == expected.digest() {
        Ok(())
    } else {
        Err(Error::MismatchedDigest)
    }
}
