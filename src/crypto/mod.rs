//! # Crypto
//!
//! At-rest secret sealing and artifact signature verification.
//!
//! - [`cipher`] - AES-256-GCM sealing/opening of stored secrets under the
//!   process-wide key handed in at boot.
//! - [`gpg`] - detached ASCII-armored signature verification for mirrored
//!   provider checksum manifests.

pub mod cipher;
pub mod gpg;

pub use cipher::{Cipher, CipherError};
pub use gpg::{GpgCliVerifier, SignatureVerifier};
