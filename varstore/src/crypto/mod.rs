//! Cryptography used to seal the variable store: AES-CBC payload encryption
//! and HKDF/HMAC integrity helpers. Each submodule focuses on a single
//! primitive family so the sealing code reads as a sequence of calls.

pub mod cipher;
pub mod integrity;
