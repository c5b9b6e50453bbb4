//! Sealing of a protected variable store.
//!
//! The store is a layout tree with an `FvHeader`, a `Variables` sequence and
//! three shortcuts (`RootKey`, `InitVec`, `RpmcCounter`). Sealing encrypts
//! every variable flagged for encryption, records each variable's
//! authenticated fields in a transcript, fixes the header checksum and writes
//! the transcript's HMAC into the `MetaDataHmacVar` variable.
//!
//! Transcript layout, one block per encrypted variable followed by the counter:
//!
//! ```text
//! ":" Name ":" VendorGuid Attributes CipherSize ":" Envelope
//! ":" PubKeyIndex MonotonicCount TimeStamp
//! ... RpmcCounter
//! ```
//!
//! The separators are UTF-16LE. The order is part of the format.

use std::fs;
use std::path::Path;

use thiserror::Error;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::crypto::cipher::{decrypt_cbc, encrypt_cbc, CipherError, BLOCK_SIZE};
use crate::crypto::integrity::{derive_key, sign_transcript, IntegrityError};
use crate::layout::{checksum, LayoutError, LayoutTree};

/// Variable whose data receives the store HMAC.
pub const HMAC_VAR_NAME: &str = "MetaDataHmacVar";
/// Variable that is never encrypted so firmware can always read it.
pub const ERROR_FLAG_VAR_NAME: &str = "VarErrorFlag";

pub const ROOT_KEY: &str = "RootKey";
pub const INIT_VEC: &str = "InitVec";
pub const RPMC_COUNTER: &str = "RpmcCounter";
pub const FV_HEADER: &str = "FvHeader";
pub const FV_HEADER_CHECKSUM: &str = "FvHeader.Checksum";
pub const VARIABLES: &str = "Variables";

/// `TPM_ALG_AES`.
pub const ENC_TYPE_AES: u32 = 0x0006;
pub const ENVELOPE_HEADER_LEN: usize = 16 + BLOCK_SIZE;

const ENC_KEY_LABEL: &str = "VAR_ENC_KEY";
const HMAC_KEY_LABEL: &str = "HMAC_KEY";
const SEPARATOR: &str = ":";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("layout error: {0}")]
    Layout(#[from] LayoutError),
    #[error("integrity error: {0}")]
    Integrity(#[from] IntegrityError),
    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),
    #[error("required field `{0}` is missing")]
    MissingField(String),
    #[error("`{0}` is too large for a 32-bit size field")]
    Oversized(String),
    #[error("image not written: {0}")]
    Io(String),
}

fn utf16(text: &str) -> Vec<u8> {
    text.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

/// UTF-16LE text with its terminator, the way variable names are stored.
pub fn variable_name(text: &str) -> Vec<u8> {
    let mut name = utf16(text);
    name.extend_from_slice(&[0, 0]);
    name
}

/// Encrypted variable payload: a fixed header followed by ciphertext.
///
/// ```text
/// u32 type | u32 header size | u32 plain size | u32 cipher size | iv[16] | ciphertext
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub plain_size: u32,
    pub iv: [u8; BLOCK_SIZE],
    pub cipher: Vec<u8>,
}

impl Envelope {
    pub fn seal(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Self, StoreError> {
        let iv: [u8; BLOCK_SIZE] = iv
            .try_into()
            .map_err(|_| CipherError::InvalidIvLength(iv.len()))?;
        let plain_size =
            u32::try_from(plaintext.len()).map_err(|_| StoreError::Oversized("Data".into()))?;
        let cipher = encrypt_cbc(key, &iv, plaintext)?;
        Ok(Self {
            plain_size,
            iv,
            cipher,
        })
    }

    pub fn cipher_size(&self) -> u32 {
        self.cipher.len() as u32
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENVELOPE_HEADER_LEN + self.cipher.len());
        out.extend_from_slice(&ENC_TYPE_AES.to_le_bytes());
        out.extend_from_slice(&(ENVELOPE_HEADER_LEN as u32).to_le_bytes());
        out.extend_from_slice(&self.plain_size.to_le_bytes());
        out.extend_from_slice(&self.cipher_size().to_le_bytes());
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.cipher);
        out
    }

    /// Parses an envelope. `None` if the header is not an AES envelope or
    /// the sizes disagree with the buffer.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let word = |at: usize| -> Option<u32> {
            Some(u32::from_le_bytes(bytes.get(at..at + 4)?.try_into().ok()?))
        };
        if word(0)? != ENC_TYPE_AES || word(4)? as usize != ENVELOPE_HEADER_LEN {
            return None;
        }
        let plain_size = word(8)?;
        let cipher_size = word(12)? as usize;
        let iv: [u8; BLOCK_SIZE] = bytes.get(16..ENVELOPE_HEADER_LEN)?.try_into().ok()?;
        let cipher = bytes.get(ENVELOPE_HEADER_LEN..)?;
        if cipher.len() != cipher_size || plain_size as usize > cipher_size {
            return None;
        }
        Some(Self {
            plain_size,
            iv,
            cipher: cipher.to_vec(),
        })
    }

    /// Decrypts and strips the block padding.
    pub fn open(&self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        let mut plain = decrypt_cbc(key, &self.iv, &self.cipher)?;
        plain.truncate(self.plain_size as usize);
        Ok(plain)
    }
}

/// The per-variable fields that feed key derivation and the transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryFields {
    pub name: Vec<u8>,
    pub vendor_guid: Vec<u8>,
    pub attributes: Vec<u8>,
    pub pub_key_index: Vec<u8>,
    pub monotonic_count: Vec<u8>,
    pub timestamp: Vec<u8>,
}

impl EntryFields {
    fn read(tree: &LayoutTree, entry: &str) -> Result<Self, StoreError> {
        Ok(Self {
            name: require(tree, &field(entry, "Name"))?,
            vendor_guid: require(tree, &field(entry, "VendorGuid"))?,
            attributes: require(tree, &field(entry, "Attributes"))?,
            pub_key_index: require(tree, &field(entry, "PubKeyIndex"))?,
            monotonic_count: require(tree, &field(entry, "MonotonicCount"))?,
            timestamp: require(tree, &field(entry, "TimeStamp"))?,
        })
    }
}

/// Running authentication transcript.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    buf: Vec<u8>,
}

impl Transcript {
    pub fn append_entry(&mut self, fields: &EntryFields, envelope: &[u8]) -> Result<(), StoreError> {
        let cipher_size =
            u32::try_from(envelope.len()).map_err(|_| StoreError::Oversized("Data".into()))?;
        let sep = utf16(SEPARATOR);
        let start = self.buf.len();

        self.buf.extend_from_slice(&sep);
        self.buf.extend_from_slice(&fields.name);
        self.buf.extend_from_slice(&sep);
        self.buf.extend_from_slice(&fields.vendor_guid);
        self.buf.extend_from_slice(&fields.attributes);
        self.buf.extend_from_slice(&cipher_size.to_le_bytes());
        self.buf.extend_from_slice(&sep);
        self.buf.extend_from_slice(envelope);
        self.buf.extend_from_slice(&sep);
        self.buf.extend_from_slice(&fields.pub_key_index);
        self.buf.extend_from_slice(&fields.monotonic_count);
        self.buf.extend_from_slice(&fields.timestamp);

        debug!(bytes = %hex::encode(&self.buf[start..]), "transcript entry");
        Ok(())
    }

    pub fn append_counter(&mut self, counter: &[u8]) {
        self.buf.extend_from_slice(counter);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn digest(&self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        Ok(sign_transcript(key, &self.buf)?)
    }
}

/// `Name || ":" || VendorGuid || ":" || Attributes || "VAR_ENC_KEY"`.
pub fn entry_key_context(fields: &EntryFields) -> Vec<u8> {
    let sep = utf16(SEPARATOR);
    let mut info = Vec::new();
    info.extend_from_slice(&fields.name);
    info.extend_from_slice(&sep);
    info.extend_from_slice(&fields.vendor_guid);
    info.extend_from_slice(&sep);
    info.extend_from_slice(&fields.attributes);
    info.extend_from_slice(&utf16(ENC_KEY_LABEL));
    info
}

/// Per-variable encryption key, as long as the root key.
pub fn derive_entry_key(root_key: &[u8], fields: &EntryFields) -> Result<Zeroizing<Vec<u8>>, StoreError> {
    let info = entry_key_context(fields);
    debug!(info = %hex::encode(&info), "deriving variable key");
    Ok(derive_key(root_key, &info)?)
}

pub fn derive_hmac_key(root_key: &[u8]) -> Result<Zeroizing<Vec<u8>>, StoreError> {
    Ok(derive_key(root_key, &utf16(HMAC_KEY_LABEL))?)
}

/// Zeroes `field`, sums `region` and stores the correction that makes the
/// region's 16-bit word sum zero. Returns the stored value.
pub fn fix_checksum(tree: &mut LayoutTree, region: &str, field: &str) -> Result<u16, StoreError> {
    tree.set(field, 0u64)?;
    let bytes = require(tree, region)?;
    let value = 0u16.wrapping_sub(checksum(&bytes));
    tree.set(field, u64::from(value))?;
    Ok(value)
}

/// The finished image plus the inputs a consumer needs to verify it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedStore {
    pub image: Vec<u8>,
    pub init_vec: Vec<u8>,
    pub counter: Vec<u8>,
    /// HMAC written into the holder variable, if the store has one.
    pub digest: Option<Vec<u8>>,
    /// Indices of the variables that were encrypted.
    pub encrypted: Vec<usize>,
}

impl SealedStore {
    /// Counter as a little-endian integer (first eight bytes).
    pub fn counter_value(&self) -> u64 {
        let mut word = [0u8; 8];
        let len = self.counter.len().min(8);
        word[..len].copy_from_slice(&self.counter[..len]);
        u64::from_le_bytes(word)
    }

    pub fn write_image(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        fs::write(path, &self.image).map_err(|e| StoreError::Io(format!("{e}")))
    }
}

/// Encrypts, authenticates and checksums the store in `tree`.
///
/// The tree is mutated in place. On error no image is produced; the tree
/// should be discarded.
pub fn seal(tree: &mut LayoutTree) -> Result<SealedStore, StoreError> {
    let root_key = Zeroizing::new(require(tree, ROOT_KEY)?);
    let init_vec = require(tree, INIT_VEC)?;
    let counter = require(tree, RPMC_COUNTER)?;
    info!(counter = %hex::encode(&counter), "sealing variable store");

    let hmac_name = variable_name(HMAC_VAR_NAME);
    let plaintext_names = [hmac_name.clone(), variable_name(ERROR_FLAG_VAR_NAME)];

    let mut transcript = Transcript::default();
    let mut hmac_index = None;
    let mut encrypted = Vec::new();

    let mut index = 0usize;
    loop {
        let entry = format!("{VARIABLES}.{index}");
        let data_path = field(&entry, "Data");
        let Some(name) = tree.get(&field(&entry, "Name")) else {
            break;
        };
        if tree.get(&data_path).is_none() {
            break;
        }
        let label = tree.render(&field(&entry, "Name")).unwrap_or_default();
        let flagged = require(tree, &field(&entry, "Reserved"))?
            .iter()
            .any(|b| *b != 0);

        if name == hmac_name && flagged {
            debug!(index, "found hmac holder");
            hmac_index = Some(index);
        }
        if !flagged || plaintext_names.contains(&name) {
            info!(index, name = %label, offset = ?tree.offset(&field(&entry, "StartId")), "kept in plaintext");
            index += 1;
            continue;
        }

        let fields = EntryFields::read(tree, &entry)?;
        let data = require(tree, &data_path)?;
        let key = derive_entry_key(&root_key, &fields)?;
        let envelope = Envelope::seal(&key, &init_vec, &data)?.to_bytes();
        debug!(header = %hex::encode(&envelope[..ENVELOPE_HEADER_LEN]), "envelope");

        tree.set(&field(&entry, "DataSize"), envelope.len() as u64)?;
        tree.set(&field(&entry, "Reserved"), 0u64)?;
        tree.set(&data_path, envelope.clone())?;
        transcript.append_entry(&fields, &envelope)?;
        encrypted.push(index);

        info!(
            index,
            name = %label,
            plain = data.len(),
            sealed = envelope.len(),
            offset = ?tree.offset(&field(&entry, "StartId")),
            "encrypted"
        );
        index += 1;
    }

    transcript.append_counter(&counter);

    let fv_checksum = fix_checksum(tree, FV_HEADER, FV_HEADER_CHECKSUM)?;
    debug!("header checksum {fv_checksum:#06x}");

    let digest = match hmac_index {
        Some(index) => {
            let key = derive_hmac_key(&root_key)?;
            let digest = transcript.digest(&key)?;
            tree.set(&field(&format!("{VARIABLES}.{index}"), "Data"), digest.clone())?;
            info!(hmac = %hex::encode(&digest), "store authenticated");
            Some(digest)
        }
        None => None,
    };

    Ok(SealedStore {
        image: tree.to_bytes(),
        init_vec,
        counter,
        digest,
        encrypted,
    })
}

fn field(entry: &str, name: &str) -> String {
    format!("{entry}.{name}")
}

fn require(tree: &LayoutTree, path: &str) -> Result<Vec<u8>, StoreError> {
    tree.get(path)
        .ok_or_else(|| StoreError::MissingField(path.to_string()))
}
