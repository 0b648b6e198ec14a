//! Mesh cryptography.
//!
//! - `keys`: X25519 key pairs and HKDF-SHA256 shared secrets
//! - `sealing`: per-node ChaCha20Poly1305 payloads and their wire format
//! - `geohash`: coordinate quantization
//! - `location_lock`: encryption bound to a geohash cell
//! - `time_lock`: encryption bound to a validity window

pub mod geohash;
pub mod keys;
pub mod location_lock;
pub mod sealing;
pub mod time_lock;

pub use keys::{KEY_LEN, MeshKeyPair, PublicKey, derive_shared_secret, generate_keypair};
pub use location_lock::{
    LocationSealed, create_location_bound_key, decrypt_with_location, encrypt_with_location,
};
pub use sealing::{
    NodePayload, PAYLOAD_VERSION, decrypt_from_sender, deserialize_payload, encrypt_for_node,
    serialize_payload,
};
pub use time_lock::{create_time_bound_wrapper, unwrap_time_bound, unwrap_time_bound_at};
