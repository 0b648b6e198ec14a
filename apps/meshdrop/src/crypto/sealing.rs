//! Authenticated encryption of fragments for a single mesh node.
//!
//! Each payload uses a fresh ephemeral X25519 key (forward secrecy), HKDF-SHA256
//! key expansion and ChaCha20Poly1305 with a random 96-bit nonce.
//!
//! Wire format (little-endian lengths):
//!
//! ```text
//! version:u8 | ciphertext_len:u16 | ciphertext | nonce:12 | has_ephemeral:u8 | ephemeral_pub:32?
//! ```

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;

use crate::crypto::keys::{KEY_LEN, MeshKeyPair, PublicKey, derive_shared_secret};
use crate::error::{DropError, DropResult};

/// Current wire format version.
pub const PAYLOAD_VERSION: u8 = 1;

/// ChaCha20Poly1305 nonce size.
pub const NONCE_LEN: usize = 12;

/// HKDF info for node transport keys.
const NODE_TRANSPORT_CONTEXT: &[u8] = b"meshdrop/node-transport/v1";

/// Sealed fragment addressed to one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePayload {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
    pub ephemeral_pub: Option<PublicKey>,
}

pub(crate) fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

pub(crate) fn aead_seal(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> DropResult<Vec<u8>> {
    ChaCha20Poly1305::new(Key::from_slice(key))
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| DropError::Internal(format!("Seal failed: {e}")))
}

pub(crate) fn aead_open(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> DropResult<Vec<u8>> {
    ChaCha20Poly1305::new(Key::from_slice(key))
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| DropError::AuthenticationError("authentication tag mismatch".to_string()))
}

/// Encrypt `plaintext` so that only the holder of `node_pub`'s private key can read it.
pub fn encrypt_for_node(
    plaintext: &[u8],
    node_pub: &PublicKey,
    aad: Option<&[u8]>,
) -> DropResult<NodePayload> {
    let ephemeral = MeshKeyPair::generate();
    let key = derive_shared_secret(ephemeral.secret_key(), node_pub, NODE_TRANSPORT_CONTEXT)?;
    let nonce = random_nonce();
    let ciphertext = aead_seal(&key, &nonce, plaintext, aad.unwrap_or_default())?;

    Ok(NodePayload {
        ciphertext,
        nonce,
        ephemeral_pub: Some(ephemeral.public_key),
    })
}

/// Decrypt a payload addressed to the node holding `node_priv`.
pub fn decrypt_from_sender(
    payload: &NodePayload,
    node_priv: &[u8; KEY_LEN],
    aad: Option<&[u8]>,
) -> DropResult<Vec<u8>> {
    let ephemeral_pub = payload.ephemeral_pub.as_ref().ok_or_else(|| {
        DropError::AuthenticationError("payload carries no ephemeral key".to_string())
    })?;
    let key = derive_shared_secret(node_priv, ephemeral_pub, NODE_TRANSPORT_CONTEXT)?;
    aead_open(&key, &payload.nonce, &payload.ciphertext, aad.unwrap_or_default())
}

/// Encode a payload in the versioned wire format.
pub fn serialize_payload(payload: &NodePayload) -> DropResult<Vec<u8>> {
    let ct_len = u16::try_from(payload.ciphertext.len()).map_err(|_| {
        DropError::InvalidPayload(format!(
            "ciphertext of {} bytes exceeds the u16 length field",
            payload.ciphertext.len()
        ))
    })?;

    let mut out = Vec::with_capacity(1 + 2 + payload.ciphertext.len() + NONCE_LEN + 1 + KEY_LEN);
    out.push(PAYLOAD_VERSION);
    out.extend_from_slice(&ct_len.to_le_bytes());
    out.extend_from_slice(&payload.ciphertext);
    out.extend_from_slice(&payload.nonce);
    match &payload.ephemeral_pub {
        Some(key) => {
            out.push(1);
            out.extend_from_slice(key);
        }
        None => out.push(0),
    }
    Ok(out)
}

/// Decode the versioned wire format, rejecting truncated or trailing data.
pub fn deserialize_payload(bytes: &[u8]) -> DropResult<NodePayload> {
    let (&version, rest) = bytes
        .split_first()
        .ok_or_else(|| DropError::InvalidPayload("empty payload".to_string()))?;
    if version != PAYLOAD_VERSION {
        return Err(DropError::InvalidPayload(format!(
            "unsupported payload version {version}"
        )));
    }

    if rest.len() < 2 {
        return Err(DropError::InvalidPayload("missing length field".to_string()));
    }
    let ct_len = u16::from_le_bytes([rest[0], rest[1]]) as usize;
    let rest = &rest[2..];

    if rest.len() < ct_len + NONCE_LEN + 1 {
        return Err(DropError::InvalidPayload("payload truncated".to_string()));
    }
    let ciphertext = rest[..ct_len].to_vec();
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&rest[ct_len..ct_len + NONCE_LEN]);

    let flag = rest[ct_len + NONCE_LEN];
    let tail = &rest[ct_len + NONCE_LEN + 1..];

    let ephemeral_pub = match (flag, tail.len()) {
        (0, 0) => None,
        (1, KEY_LEN) => {
            let mut key = [0u8; KEY_LEN];
            key.copy_from_slice(tail);
            Some(key)
        }
        (0 | 1, len) => {
            return Err(DropError::InvalidPayload(format!(
                "unexpected {len} trailing bytes"
            )));
        }
        (other, _) => {
            return Err(DropError::InvalidPayload(format!(
                "invalid ephemeral flag {other}"
            )));
        }
    };

    Ok(NodePayload {
        ciphertext,
        nonce,
        ephemeral_pub,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let node = MeshKeyPair::generate();
        let plaintext = b"fragment share bytes";

        let payload = encrypt_for_node(plaintext, &node.public_key, None).unwrap();
        let decrypted = decrypt_from_sender(&payload, node.secret_key(), None).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_fresh_ephemeral_per_call() {
        let node = MeshKeyPair::generate();
        let a = encrypt_for_node(b"same", &node.public_key, None).unwrap();
        let b = encrypt_for_node(b"same", &node.public_key, None).unwrap();
        assert_ne!(a.ephemeral_pub, b.ephemeral_pub);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let node = MeshKeyPair::generate();
        let wrong = MeshKeyPair::generate();
        let payload = encrypt_for_node(b"secret", &node.public_key, None).unwrap();

        let result = decrypt_from_sender(&payload, wrong.secret_key(), None);
        assert!(matches!(result, Err(DropError::AuthenticationError(_))));
    }

    #[test]
    fn test_wrong_aad_fails() {
        let node = MeshKeyPair::generate();
        let payload = encrypt_for_node(b"secret", &node.public_key, Some(b"drop:1")).unwrap();

        let result = decrypt_from_sender(&payload, node.secret_key(), Some(b"drop:2"));
        assert!(matches!(result, Err(DropError::AuthenticationError(_))));

        let result = decrypt_from_sender(&payload, node.secret_key(), None);
        assert!(matches!(result, Err(DropError::AuthenticationError(_))));
    }

    #[test]
    fn test_missing_ephemeral_fails() {
        let node = MeshKeyPair::generate();
        let mut payload = encrypt_for_node(b"secret", &node.public_key, None).unwrap();
        payload.ephemeral_pub = None;

        let result = decrypt_from_sender(&payload, node.secret_key(), None);
        assert!(matches!(result, Err(DropError::AuthenticationError(_))));
    }

    #[test]
    fn test_wire_format_layout() {
        let payload = NodePayload {
            ciphertext: vec![0xaa; 3],
            nonce: [0x11; NONCE_LEN],
            ephemeral_pub: Some([0x22; KEY_LEN]),
        };
        let bytes = serialize_payload(&payload).unwrap();

        assert_eq!(bytes.len(), 1 + 2 + 3 + NONCE_LEN + 1 + KEY_LEN);
        assert_eq!(bytes[0], PAYLOAD_VERSION);
        assert_eq!(&bytes[1..3], &[3, 0]);
        assert_eq!(bytes[3 + 3 + NONCE_LEN], 1);
        assert_eq!(deserialize_payload(&bytes).unwrap(), payload);

        let bare = NodePayload {
            ephemeral_pub: None,
            ..payload
        };
        let bytes = serialize_payload(&bare).unwrap();
        assert_eq!(*bytes.last().unwrap(), 0);
        assert_eq!(deserialize_payload(&bytes).unwrap(), bare);
    }

    #[test]
    fn test_wire_format_rejects_malformed() {
        let payload = NodePayload {
            ciphertext: vec![1, 2, 3],
            nonce: [0; NONCE_LEN],
            ephemeral_pub: Some([9; KEY_LEN]),
        };
        let bytes = serialize_payload(&payload).unwrap();

        assert!(deserialize_payload(&[]).is_err());
        assert!(deserialize_payload(&bytes[..bytes.len() - 1]).is_err());

        let mut extra = bytes.clone();
        extra.push(0);
        assert!(deserialize_payload(&extra).is_err());

        let mut wrong_version = bytes;
        wrong_version[0] = 9;
        assert!(matches!(
            deserialize_payload(&wrong_version),
            Err(DropError::InvalidPayload(_))
        ));

        let oversized = NodePayload {
            ciphertext: vec![0; usize::from(u16::MAX) + 1],
            nonce: [0; NONCE_LEN],
            ephemeral_pub: None,
        };
        assert!(serialize_payload(&oversized).is_err());
    }
}
