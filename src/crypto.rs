//! Cryptographic primitives for session negotiation and frame protection.

use ring::{agreement, digest, hkdf, hmac, rand};
use ring::rand::SecureRandom;
use crypto::{aes, blockmodes, buffer};
use crypto::buffer::{BufferResult, ReadBuffer, WriteBuffer};
use untrusted::Input;

use crate::errors::*;

const AES_BLOCK_SIZE: usize = 16;
/// Fixed length of the `secret` blob delivered in the validation frame:
/// server public key (32) + HMAC tag (32) + encrypted key material (80).
const SECRET_LEN: usize = 144;

pub(crate) fn random_bytes(buf: &mut [u8]) -> Result<()> {
    rand::SystemRandom::new().fill(buf)?;
    Ok(())
}

/// Allocates a fresh client identifier (16 random bytes).
pub fn generate_client_id() -> Result<[u8; 16]> {
    let mut client_id = [0u8; 16];
    random_bytes(&mut client_id)?;
    Ok(client_id)
}

/// The wire rendering of a client identifier: 22 characters of unpadded base64.
pub fn client_id_to_string(client_id: &[u8; 16]) -> String {
    base64::encode_config(client_id, base64::STANDARD_NO_PAD)
}

/// Generates the ephemeral Curve25519 keypair used for a fresh-session handshake.
pub fn generate_keypair() -> Result<(agreement::EphemeralPrivateKey, Vec<u8>)> {
    let rng = rand::SystemRandom::new();
    let private_key = agreement::EphemeralPrivateKey::generate(&agreement::X25519, &rng)?;
    let public_key = private_key.compute_public_key()?.as_ref().to_vec();
    Ok((private_key, public_key))
}

/// HKDF-SHA256 with a 32-byte zero salt, filling `out`.
pub fn hkdf_expand(ikm: &[u8], info: &[u8], out: &mut [u8]) {
    let salt = hmac::SigningKey::new(&digest::SHA256, &[0u8; 32]);
    hkdf::extract_and_expand(&salt, ikm, info, out);
}

pub fn sign_hmac(key: &[u8], data: &[u8]) -> hmac::Signature {
    let key = hmac::SigningKey::new(&digest::SHA256, key);
    hmac::sign(&key, data)
}

pub fn verify_hmac(key: &[u8], data: &[u8], signature: &[u8]) -> Result<()> {
    let key = hmac::SigningKey::new(&digest::SHA256, key);
    hmac::verify_with_own_key(&key, data, signature)
        .map_err(|_| WaError::HmacMismatch)
}

/// Signs a server login challenge with the session's mac key.
pub fn sign_challenge(mac: &[u8], challenge: &[u8]) -> hmac::Signature {
    sign_hmac(mac, challenge)
}

fn aes_cbc_encrypt_raw(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut encryptor = aes::cbc_encryptor(aes::KeySize::KeySize256, key, iv, blockmodes::PkcsPadding);

    let mut ciphertext = Vec::new();
    let mut read_buffer = buffer::RefReadBuffer::new(plaintext);
    let mut block = [0u8; 4096];
    let mut write_buffer = buffer::RefWriteBuffer::new(&mut block);
    loop {
        let result = encryptor.encrypt(&mut read_buffer, &mut write_buffer, true)?;
        ciphertext.extend(write_buffer.take_read_buffer().take_remaining().iter().cloned());
        match result {
            BufferResult::BufferUnderflow => break,
            BufferResult::BufferOverflow => {}
        }
    }
    Ok(ciphertext)
}

/// AES-256-CBC encryption with PKCS#7 padding; the returned ciphertext is
/// prefixed with the freshly drawn 16-byte IV.
pub fn aes_cbc_encrypt(plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    let mut iv = [0u8; AES_BLOCK_SIZE];
    random_bytes(&mut iv)?;

    let mut out = iv.to_vec();
    out.extend(aes_cbc_encrypt_raw(key, &iv, plaintext)?);
    Ok(out)
}

/// AES-256-CBC decryption with an explicit IV, used where the IV travels
/// separately from the ciphertext (media keys, validation key material).
pub fn aes_cbc_decrypt_with_iv(ciphertext: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
    let mut decryptor = aes::cbc_decryptor(aes::KeySize::KeySize256, key, iv, blockmodes::PkcsPadding);

    let mut plaintext = Vec::new();
    let mut read_buffer = buffer::RefReadBuffer::new(ciphertext);
    let mut block = [0u8; 4096];
    let mut write_buffer = buffer::RefWriteBuffer::new(&mut block);
    loop {
        let result = decryptor.decrypt(&mut read_buffer, &mut write_buffer, true)?;
        plaintext.extend(write_buffer.take_read_buffer().take_remaining().iter().cloned());
        match result {
            BufferResult::BufferUnderflow => break,
            BufferResult::BufferOverflow => {}
        }
    }
    Ok(plaintext)
}

/// AES-256-CBC decryption consuming the leading 16-byte IV.
pub fn aes_cbc_decrypt(ciphertext: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() < AES_BLOCK_SIZE {
        return Err(WaError::Malformed("ciphertext shorter than IV"));
    }
    let (iv, ciphertext) = ciphertext.split_at(AES_BLOCK_SIZE);
    aes_cbc_decrypt_with_iv(ciphertext, key, iv)
}

/// Derives `(enc, mac)` from the 144-byte validation secret.
///
/// Layout dictated by the server: `secret[0..32]` is its Curve25519 public
/// key, `secret[32..64]` an HMAC tag over the rest, `secret[64..144]` the
/// encrypted session keys with their IV taken from the HKDF expansion.
pub fn calculate_secret_keys(secret: &[u8], private_key: agreement::EphemeralPrivateKey)
                             -> Result<([u8; 32], [u8; 32])> {
    if secret.len() != SECRET_LEN {
        return Err(WaError::Malformed("secret is not 144 bytes"));
    }

    let shared = agreement::agree_ephemeral(
        private_key,
        &agreement::X25519,
        Input::from(&secret[..32]),
        WaError::Crypto(ring::error::Unspecified),
        |shared| Ok(shared.to_vec()))?;

    let mut expanded = [0u8; 80];
    hkdf_expand(&shared, &[], &mut expanded);

    let mut signed = Vec::with_capacity(SECRET_LEN - 32);
    signed.extend_from_slice(&secret[..32]);
    signed.extend_from_slice(&secret[64..]);
    verify_hmac(&expanded[32..64], &signed, &secret[32..64])?;

    let key_material = aes_cbc_decrypt_with_iv(&secret[64..], &expanded[..32], &expanded[64..80])?;
    if key_material.len() < 64 {
        return Err(WaError::Malformed("decrypted key material too short"));
    }

    let mut enc = [0u8; 32];
    let mut mac = [0u8; 32];
    enc.copy_from_slice(&key_material[..32]);
    mac.copy_from_slice(&key_material[32..64]);
    Ok((enc, mac))
}

/// Protects an outbound binary frame body: AES-CBC under `enc`, then the
/// 32-byte HMAC-SHA256 tag under `mac` prepended to the ciphertext.
pub fn sign_and_encrypt_message(enc: &[u8], mac: &[u8], message: &[u8]) -> Result<Vec<u8>> {
    let ciphertext = aes_cbc_encrypt(message, enc)?;
    let mut out = sign_hmac(mac, &ciphertext).as_ref().to_vec();
    out.extend(ciphertext);
    Ok(out)
}

/// Inverse of [`sign_and_encrypt_message`]: checks the leading HMAC tag and
/// decrypts the remainder.
pub fn verify_and_decrypt_message(enc: &[u8], mac: &[u8], message: &[u8]) -> Result<Vec<u8>> {
    if message.len() <= 32 {
        return Err(WaError::Malformed("binary frame shorter than its HMAC tag"));
    }
    let (tag, ciphertext) = message.split_at(32);
    verify_hmac(mac, ciphertext, tag)?;
    aes_cbc_decrypt(ciphertext, enc)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_keys() -> ([u8; 32], [u8; 32]) {
        let mut enc = [0u8; 32];
        let mut mac = [0u8; 32];
        random_bytes(&mut enc).unwrap();
        random_bytes(&mut mac).unwrap();
        (enc, mac)
    }

    #[test]
    fn client_id_renders_as_22_chars() {
        let id = generate_client_id().unwrap();
        assert_eq!(client_id_to_string(&id).len(), 22);
    }

    #[test]
    fn hmac_is_deterministic_and_32_bytes() {
        let (_, mac) = test_keys();
        let a = sign_hmac(&mac, b"some frame body");
        let b = sign_hmac(&mac, b"some frame body");
        assert_eq!(a.as_ref().len(), 32);
        assert_eq!(a.as_ref(), b.as_ref());
        verify_hmac(&mac, b"some frame body", a.as_ref()).unwrap();
        assert!(verify_hmac(&mac, b"another body", a.as_ref()).is_err());
    }

    #[test]
    fn aes_cbc_round_trip() {
        let (enc, _) = test_keys();
        for len in &[0usize, 1, 15, 16, 17, 255] {
            let plaintext = vec![0x42u8; *len];
            let ciphertext = aes_cbc_encrypt(&plaintext, &enc).unwrap();
            assert_eq!(ciphertext.len() % AES_BLOCK_SIZE, 0);
            assert_eq!(aes_cbc_decrypt(&ciphertext, &enc).unwrap(), plaintext);
        }
    }

    #[test]
    fn message_protection_round_trip() {
        let (enc, mac) = test_keys();
        let sealed = sign_and_encrypt_message(&enc, &mac, b"node bytes").unwrap();
        assert_eq!(verify_and_decrypt_message(&enc, &mac, &sealed).unwrap(), b"node bytes");
    }

    #[test]
    fn tampered_message_fails_mac_check() {
        let (enc, mac) = test_keys();
        let mut sealed = sign_and_encrypt_message(&enc, &mac, b"node bytes").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 1;
        match verify_and_decrypt_message(&enc, &mac, &sealed) {
            Err(WaError::HmacMismatch) => {}
            other => panic!("expected HmacMismatch, got {:?}", other.map(|_| ())),
        }
    }

    /// Builds a `secret` blob the way a conforming server would, given the
    /// client's public key.
    fn server_secret(client_public: &[u8], enc: &[u8; 32], mac: &[u8; 32]) -> Vec<u8> {
        let (server_private, server_public) = generate_keypair().unwrap();
        let shared = agreement::agree_ephemeral(
            server_private,
            &agreement::X25519,
            Input::from(client_public),
            ring::error::Unspecified,
            |shared| Ok(shared.to_vec())).unwrap();

        let mut expanded = [0u8; 80];
        hkdf_expand(&shared, &[], &mut expanded);

        let mut key_material = Vec::with_capacity(64);
        key_material.extend_from_slice(enc);
        key_material.extend_from_slice(mac);
        let encrypted_keys = aes_cbc_encrypt_raw(&expanded[..32], &expanded[64..80], &key_material).unwrap();
        assert_eq!(encrypted_keys.len(), 80);

        let mut signed = server_public.clone();
        signed.extend_from_slice(&encrypted_keys);
        let tag = sign_hmac(&expanded[32..64], &signed);

        let mut secret = server_public;
        secret.extend_from_slice(tag.as_ref());
        secret.extend_from_slice(&encrypted_keys);
        assert_eq!(secret.len(), SECRET_LEN);
        secret
    }

    #[test]
    fn secret_key_agreement_recovers_server_keys() {
        let (enc, mac) = test_keys();
        let (client_private, client_public) = generate_keypair().unwrap();
        let secret = server_secret(&client_public, &enc, &mac);

        let (derived_enc, derived_mac) = calculate_secret_keys(&secret, client_private).unwrap();
        assert_eq!(derived_enc, enc);
        assert_eq!(derived_mac, mac);
    }

    #[test]
    fn secret_with_zeroed_tag_is_rejected() {
        let (enc, mac) = test_keys();
        let (client_private, client_public) = generate_keypair().unwrap();
        let mut secret = server_secret(&client_public, &enc, &mac);
        for b in &mut secret[32..64] {
            *b = 0;
        }

        match calculate_secret_keys(&secret, client_private) {
            Err(WaError::HmacMismatch) => {}
            other => panic!("expected HmacMismatch, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn secret_of_wrong_length_is_rejected() {
        let (client_private, _) = generate_keypair().unwrap();
        match calculate_secret_keys(&[0u8; 143], client_private) {
            Err(WaError::Malformed(_)) => {}
            other => panic!("expected Malformed, got {:?}", other.map(|_| ())),
        }
    }
}
