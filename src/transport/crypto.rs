//! AES-128-ECB payload encryption (protocol v3.3 / v3.4) and the
//! HMAC-SHA256 helper used for framing and session-key negotiation.

use crate::error::{ProjectorError, Result};
use aes::Aes128;
use cipher::generic_array::GenericArray;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit};
use ecb::{Decryptor, Encryptor};
use hmac::{Hmac, Mac};
use sha2::Sha256;

const BLOCK: usize = 16;

type HmacSha256 = Hmac<Sha256>;

/// AES-128-ECB with the device's local key (or the negotiated session key).
#[derive(Clone)]
pub struct EcbCipher {
    key: [u8; BLOCK],
}

impl EcbCipher {
    pub fn new(key: &[u8]) -> Result<Self> {
        let key: [u8; BLOCK] = key
            .try_into()
            .map_err(|_| ProjectorError::EncryptionFailed)?;
        Ok(Self { key })
    }

    /// Encrypts `data`. With `padding` PKCS7 is applied; without it the input
    /// must already be block aligned.
    pub fn encrypt(&self, data: &[u8], padding: bool) -> Result<Vec<u8>> {
        let mut buf = data.to_vec();
        if padding {
            let pad = BLOCK - data.len() % BLOCK;
            buf.extend(std::iter::repeat_n(pad as u8, pad));
        } else if !buf.len().is_multiple_of(BLOCK) {
            return Err(ProjectorError::EncryptionFailed);
        }

        let mut encryptor = Encryptor::<Aes128>::new(&self.key.into());
        for chunk in buf.chunks_mut(BLOCK) {
            encryptor.encrypt_block_mut(GenericArray::from_mut_slice(chunk));
        }
        Ok(buf)
    }

    /// Decrypts `data` and strips PKCS7 padding.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() || !data.len().is_multiple_of(BLOCK) {
            return Err(ProjectorError::DecryptionFailed);
        }

        let mut buf = data.to_vec();
        let mut decryptor = Decryptor::<Aes128>::new(&self.key.into());
        for chunk in buf.chunks_mut(BLOCK) {
            decryptor.decrypt_block_mut(GenericArray::from_mut_slice(chunk));
        }

        let pad = *buf.last().ok_or(ProjectorError::DecryptionFailed)? as usize;
        if pad == 0 || pad > BLOCK || buf[buf.len() - pad..].iter().any(|b| *b as usize != pad) {
            return Err(ProjectorError::DecryptionFailed);
        }
        buf.truncate(buf.len() - pad);
        Ok(buf)
    }
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|_| ProjectorError::EncryptionFailed)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

pub fn verify_hmac_sha256(key: &[u8], data: &[u8], expected: &[u8]) -> Result<()> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|_| ProjectorError::EncryptionFailed)?;
    mac.update(data);
    mac.verify_slice(expected)
        .map_err(|_| ProjectorError::HmacMismatch)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8] = b"0123456789abcdef";

    #[test]
    fn test_padded_payload_survives_encryption() {
        let cipher = EcbCipher::new(KEY).unwrap();
        let payload = br#"{"dps":{"20":true}}"#;
        let encrypted = cipher.encrypt(payload, true).unwrap();
        assert_eq!(encrypted.len(), 32);
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), payload.to_vec());
    }

    #[test]
    fn test_unpadded_requires_alignment() {
        let cipher = EcbCipher::new(KEY).unwrap();
        assert!(cipher.encrypt(&[0u8; 15], false).is_err());
        assert_eq!(cipher.encrypt(&[0u8; 16], false).unwrap().len(), 16);
    }

    #[test]
    fn test_decrypt_rejects_unaligned_input() {
        let cipher = EcbCipher::new(KEY).unwrap();
        assert_eq!(cipher.decrypt(&[0u8; 17]), Err(ProjectorError::DecryptionFailed));
        assert_eq!(cipher.decrypt(&[]), Err(ProjectorError::DecryptionFailed));
    }

    #[test]
    fn test_key_length_is_checked() {
        assert!(EcbCipher::new(b"short").is_err());
    }

    #[test]
    fn test_hmac_verification() {
        let tag = hmac_sha256(KEY, b"nonce").unwrap();
        assert!(verify_hmac_sha256(KEY, b"nonce", &tag).is_ok());
        assert_eq!(
            verify_hmac_sha256(KEY, b"other", &tag),
            Err(ProjectorError::HmacMismatch)
        );
    }

    #[test]
    fn test_hmac_known_vector() {
        // RFC 4231 test case 2
        let tag = hmac_sha256(b"Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            hex::encode(tag),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }
}
