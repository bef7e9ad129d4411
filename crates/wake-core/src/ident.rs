// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Client identity helpers.

use rand::Rng;

use crate::error::FatalError;

/// URL-safe alphabet for generated client ids (64 symbols).
const ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// Length of generated client ids.
const CLIENT_ID_LEN: usize = 21;

/// Generates a random 21-character URL-safe client id.
///
/// Stability across sessions is the caller's responsibility; a fresh id is
/// a fresh logical peer.
#[must_use]
pub fn random_client_id() -> String {
    let mut rng = rand::thread_rng();
    (0..CLIENT_ID_LEN)
        .map(|_| char::from(ALPHABET[rng.gen_range(0..ALPHABET.len())]))
        .collect()
}

/// Validates a caller-supplied client id.
///
/// # Errors
///
/// [`FatalError::InvalidClientId`] when the id contains the reserved `';'`
/// key delimiter.
pub fn validate_client_id(id: &str) -> Result<(), FatalError> {
    if id.contains(';') {
        return Err(FatalError::InvalidClientId(id.to_owned()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn generated_ids_are_url_safe_and_sized() {
        let id = random_client_id();
        assert_eq!(id.len(), CLIENT_ID_LEN);
        assert!(id.bytes().all(|b| ALPHABET.contains(&b)));
        validate_client_id(&id).unwrap();
    }

    #[test]
    fn semicolons_are_rejected() {
        assert!(matches!(
            validate_client_id("a;b"),
            Err(FatalError::InvalidClientId(_))
        ));
    }
}
