// Copyright 2025 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! MagicGate session key derivation.
//!
//! The adaptor refuses page I/O until a triple-DES challenge/response
//! handshake has completed. All key material is fixed; every operation is
//! two-key 3DES in CBC mode over a single 8-byte block, so the chaining is
//! done inline rather than through a streaming mode adapter.

use cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use des::TdesEde2;
use ps2mc_err::{Error, Result};

pub(crate) const KEY_LEFT: [u8; 16] = [
    0xCE, 0x62, 0xF6, 0x84, 0x20, 0xB6, 0x5A, 0x81, 0xE4, 0x59, 0xFA, 0x9A, 0x2B, 0xB3, 0x59, 0x8A,
];
pub(crate) const IV_LEFT: [u8; 8] = [0x6C, 0x26, 0xD3, 0x7F, 0x46, 0xEE, 0x9D, 0xA9];
pub(crate) const KEY_RIGHT: [u8; 16] = [
    0x70, 0x14, 0xA3, 0x2F, 0xCC, 0x5B, 0x12, 0x37, 0xAC, 0x1F, 0xBF, 0x4E, 0xD2, 0x6D, 0x1C, 0xC1,
];
pub(crate) const IV_RIGHT: [u8; 8] = [0x2C, 0xD1, 0x60, 0xFA, 0x8C, 0x2E, 0xD3, 0x62];
pub(crate) const CHALLENGE_IV: [u8; 8] = [0x2C, 0x5B, 0xF4, 0x8D, 0x32, 0x74, 0x91, 0x27];

/// Fixed token encrypted into the challenge chain.
pub(crate) const TOKEN: [u8; 8] = [0xDE, 0xAD, 0xC0, 0xDE, 0xDE, 0xAD, 0xC0, 0xDE];

pub(crate) fn tdes_cbc_encrypt(key: &[u8; 16], iv: &[u8; 8], block: &[u8; 8]) -> [u8; 8] {
    let cipher = TdesEde2::new(GenericArray::from_slice(key));
    let mut buffer = GenericArray::from(*block);
    for (byte, iv) in buffer.iter_mut().zip(iv) {
        *byte ^= iv;
    }
    cipher.encrypt_block(&mut buffer);
    buffer.into()
}

pub(crate) fn tdes_cbc_decrypt(key: &[u8; 16], iv: &[u8; 8], block: &[u8; 8]) -> [u8; 8] {
    let cipher = TdesEde2::new(GenericArray::from_slice(key));
    let mut buffer = GenericArray::from(*block);
    cipher.decrypt_block(&mut buffer);
    for (byte, iv) in buffer.iter_mut().zip(iv) {
        *byte ^= iv;
    }
    buffer.into()
}

/// Derives the per-session authentication key from the card's vector and
/// plain blocks.
pub(crate) fn derive_auth_key(vector: &[u8; 8], plain: &[u8; 8]) -> [u8; 16] {
    let mut block = [0u8; 8];
    for (byte, (vector, plain)) in block.iter_mut().zip(vector.iter().zip(plain)) {
        *byte = vector ^ plain;
    }

    let mut auth_key = [0u8; 16];
    auth_key[..8].copy_from_slice(&tdes_cbc_encrypt(&KEY_LEFT, &IV_LEFT, &block));
    auth_key[8..].copy_from_slice(&tdes_cbc_encrypt(&KEY_RIGHT, &IV_RIGHT, &block));
    auth_key
}

pub(crate) struct Challenges {
    pub challenge1: [u8; 8],
    pub challenge2: [u8; 8],
    pub challenge3: [u8; 8],
}

/// Chains the three challenge blocks; they are derived in reverse order,
/// each serving as the IV of the one before it.
pub(crate) fn derive_challenges(auth_key: &[u8; 16], nonce: &[u8; 8], vector: &[u8; 8]) -> Challenges {
    let challenge3 = tdes_cbc_encrypt(auth_key, &CHALLENGE_IV, &TOKEN);
    let challenge2 = tdes_cbc_encrypt(auth_key, &challenge3, nonce);
    let challenge1 = tdes_cbc_encrypt(auth_key, &challenge2, vector);
    Challenges {
        challenge1,
        challenge2,
        challenge3,
    }
}

/// Checks the card's responses against the nonce and token, returning the
/// session key. The session key is not used by any later command, but a
/// mismatch means the handshake silently failed and page reads would return
/// garbage.
pub(crate) fn verify_responses(
    auth_key: &[u8; 16],
    nonce: &[u8; 8],
    response1: &[u8; 8],
    response2: &[u8; 8],
    response3: &[u8; 8],
) -> Result<[u8; 8]> {
    if tdes_cbc_decrypt(auth_key, &CHALLENGE_IV, response1) != *nonce {
        return Err(Error::AuthFailure);
    }
    if tdes_cbc_decrypt(auth_key, response1, response2) != TOKEN {
        return Err(Error::AuthFailure);
    }
    Ok(tdes_cbc_decrypt(auth_key, response2, response3))
}

#[cfg(test)]
mod tests {
    use super::*;

    const VECTOR: [u8; 8] = [0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF];
    const PLAIN: [u8; 8] = [0x10, 0x32, 0x54, 0x76, 0x98, 0xBA, 0xDC, 0xFE];
    const NONCE: [u8; 8] = [0x5A, 0x5A, 0x00, 0xFF, 0x12, 0x34, 0x56, 0x78];

    #[test]
    fn cbc_round_trips() {
        let block = [0xDEu8, 0xAD, 0xBE, 0xEF, 0x00, 0x11, 0x22, 0x33];
        let encrypted = tdes_cbc_encrypt(&KEY_LEFT, &IV_LEFT, &block);
        assert_ne!(encrypted, block);
        assert_eq!(tdes_cbc_decrypt(&KEY_LEFT, &IV_LEFT, &encrypted), block);
    }

    #[test]
    fn auth_key_depends_on_both_blocks() {
        let auth_key = derive_auth_key(&VECTOR, &PLAIN);
        assert_ne!(auth_key, derive_auth_key(&VECTOR, &NONCE));
        assert_ne!(&auth_key[..8], &auth_key[8..]);
    }

    #[test]
    fn challenges_invert_back_to_their_inputs() {
        let auth_key = derive_auth_key(&VECTOR, &PLAIN);
        let challenges = derive_challenges(&auth_key, &NONCE, &VECTOR);
        assert_eq!(
            tdes_cbc_decrypt(&auth_key, &CHALLENGE_IV, &challenges.challenge3),
            TOKEN
        );
        assert_eq!(
            tdes_cbc_decrypt(&auth_key, &challenges.challenge3, &challenges.challenge2),
            NONCE
        );
        assert_eq!(
            tdes_cbc_decrypt(&auth_key, &challenges.challenge2, &challenges.challenge1),
            VECTOR
        );
    }

    #[test]
    fn verify_accepts_well_formed_responses() {
        let auth_key = derive_auth_key(&VECTOR, &PLAIN);
        let session_key = [0x42u8; 8];
        let response1 = tdes_cbc_encrypt(&auth_key, &CHALLENGE_IV, &NONCE);
        let response2 = tdes_cbc_encrypt(&auth_key, &response1, &TOKEN);
        let response3 = tdes_cbc_encrypt(&auth_key, &response2, &session_key);
        assert_eq!(
            verify_responses(&auth_key, &NONCE, &response1, &response2, &response3).unwrap(),
            session_key
        );
    }

    #[test]
    fn verify_rejects_tampered_responses() {
        let auth_key = derive_auth_key(&VECTOR, &PLAIN);
        let response1 = tdes_cbc_encrypt(&auth_key, &CHALLENGE_IV, &NONCE);
        let response2 = tdes_cbc_encrypt(&auth_key, &response1, &TOKEN);
        let response3 = tdes_cbc_encrypt(&auth_key, &response2, &[0x42; 8]);

        let mut bad = response1;
        bad[0] ^= 1;
        assert!(verify_responses(&auth_key, &NONCE, &bad, &response2, &response3).is_err());

        let mut bad = response2;
        bad[7] ^= 0x80;
        assert!(verify_responses(&auth_key, &NONCE, &response1, &bad, &response3).is_err());
    }
}
