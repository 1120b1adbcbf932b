// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Hashing utilities mainly used around challenge computation

pub(crate) const DIGEST_BYTES: usize = 16;
pub(crate) type Digest = [u8; DIGEST_BYTES];

/// Compute a challenge digest: MD5 over the cookie followed by the decimal
/// text of the challenge
pub(crate) fn challenge_digest(secret: &'_ str, challenge: u32) -> Digest {
    use md5::{Digest as _, Md5};

    let mut hasher = Md5::new();
    hasher.update(secret.as_bytes());
    hasher.update(challenge.to_string().as_bytes());
    hasher.finalize().into()
}
