//! Embedded builtins blob
//!
//! The blob is a pair of byte sections:
//!
//! ```text
//! code section                          data section
//! ┌──────────────┐                      ┌────────────────────────────┐
//! │ JSEntry      │◄─────────────────────│ magic "KEELBLOB"  version  │
//! ├──────────────┤                      │ builtin count              │
//! │ CEntry       │◄──────────┐          │ sha256(code section)       │
//! ├──────────────┤           │          │ sha256(data after header)  │
//! │ ...          │           └──────────│ (offset, size) per builtin │
//! └──────────────┘                      └────────────────────────────┘
//! ```
//!
//! A blob is either linked into the binary (the immortal default returned by
//! [`binary_embedded_blob`]) or created at runtime when an isolate boots
//! without one. Runtime-created blobs are shared through the
//! [`EmbeddedBlobRegistry`] and refcounted.

mod registry;

pub use registry::{BlobHandle, BlobView, EmbeddedBlobRegistry};

use crate::code::{Address, Builtin};
use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};

const MAGIC: &[u8; 8] = b"KEELBLOB";
const VERSION: u32 = 1;
const HASH_SIZE: usize = 32;
const HEADER_SIZE: usize = 8 + 4 + 4 + HASH_SIZE + HASH_SIZE;
const CODE_ALIGNMENT: usize = 32;
/// Trap instruction used as padding between builtins
const PADDING_BYTE: u8 = 0xcc;

/// Errors from validating a blob
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlobError {
    #[error("Invalid blob magic")]
    InvalidMagic,

    #[error("Unsupported blob version {0}")]
    UnsupportedVersion(u32),

    #[error("Blob data section truncated: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Blob has {actual} builtins, runtime expects {expected}")]
    BuiltinCountMismatch { expected: usize, actual: usize },

    #[error("Checksum mismatch in {section} section: expected {expected}, got {actual}")]
    ChecksumMismatch {
        section: &'static str,
        expected: String,
        actual: String,
    },
}

/// Code and data sections of an embedded blob
pub struct EmbeddedBlob {
    code: Box<[u8]>,
    data: Box<[u8]>,
}

impl EmbeddedBlob {
    /// Lay out every builtin and compute the metadata section
    pub fn create() -> Self {
        let mut code = Vec::new();
        let mut table = Vec::with_capacity(Builtin::COUNT * 8);

        for builtin in Builtin::ALL {
            let offset = code.len();
            let size = builtin.instruction_size() as usize;
            code.resize(offset + size, builtin.index() as u8);
            if let Some(last) = code.last_mut() {
                *last = PADDING_BYTE;
            }
            let aligned = (code.len() + CODE_ALIGNMENT - 1) & !(CODE_ALIGNMENT - 1);
            code.resize(aligned, PADDING_BYTE);

            table.extend_from_slice(&(offset as u32).to_le_bytes());
            table.extend_from_slice(&(size as u32).to_le_bytes());
        }

        let mut data = Vec::with_capacity(HEADER_SIZE + table.len());
        data.extend_from_slice(MAGIC);
        data.extend_from_slice(&VERSION.to_le_bytes());
        data.extend_from_slice(&(Builtin::COUNT as u32).to_le_bytes());
        data.extend_from_slice(&Sha256::digest(&code));
        data.extend_from_slice(&Sha256::digest(&table));
        data.extend_from_slice(&table);

        tracing::debug!(
            code_size = code.len(),
            data_size = data.len(),
            "created embedded blob"
        );

        Self {
            code: code.into_boxed_slice(),
            data: data.into_boxed_slice(),
        }
    }

    /// Rebuild a blob from raw sections, validating it
    pub fn from_sections(code: Vec<u8>, data: Vec<u8>) -> Result<Self, BlobError> {
        let blob = Self {
            code: code.into_boxed_slice(),
            data: data.into_boxed_slice(),
        };
        blob.verify()?;
        Ok(blob)
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn code_address(&self) -> Address {
        self.code.as_ptr() as Address
    }

    pub fn data_address(&self) -> Address {
        self.data.as_ptr() as Address
    }

    pub fn code_size(&self) -> u32 {
        self.code.len() as u32
    }

    pub fn data_size(&self) -> u32 {
        self.data.len() as u32
    }

    /// Address/size summary of this blob
    pub fn view(&self) -> BlobView {
        BlobView {
            code: self.code_address(),
            code_size: self.code_size(),
            data: self.data_address(),
            data_size: self.data_size(),
        }
    }

    fn builtin_entry(&self, builtin: Builtin) -> (u32, u32) {
        let at = HEADER_SIZE + builtin.index() * 8;
        let word = |i: usize| {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&self.data[i..i + 4]);
            u32::from_le_bytes(bytes)
        };
        (word(at), word(at + 4))
    }

    /// Offset of a builtin's instructions within the code section
    pub fn builtin_offset(&self, builtin: Builtin) -> u32 {
        self.builtin_entry(builtin).0
    }

    pub fn builtin_size(&self, builtin: Builtin) -> u32 {
        self.builtin_entry(builtin).1
    }

    /// Absolute address of a builtin's first instruction
    pub fn instruction_start_of(&self, builtin: Builtin) -> Address {
        self.code_address() + self.builtin_offset(builtin) as usize
    }

    /// Check the header and both section digests
    pub fn verify(&self) -> Result<(), BlobError> {
        let expected_len = HEADER_SIZE + Builtin::COUNT * 8;
        if self.data.len() < HEADER_SIZE {
            return Err(BlobError::Truncated {
                expected: expected_len,
                actual: self.data.len(),
            });
        }
        if &self.data[0..8] != MAGIC {
            return Err(BlobError::InvalidMagic);
        }
        let version = u32::from_le_bytes([self.data[8], self.data[9], self.data[10], self.data[11]]);
        if version != VERSION {
            return Err(BlobError::UnsupportedVersion(version));
        }
        let count =
            u32::from_le_bytes([self.data[12], self.data[13], self.data[14], self.data[15]]) as usize;
        if count != Builtin::COUNT {
            return Err(BlobError::BuiltinCountMismatch {
                expected: Builtin::COUNT,
                actual: count,
            });
        }
        if self.data.len() < expected_len {
            return Err(BlobError::Truncated {
                expected: expected_len,
                actual: self.data.len(),
            });
        }

        let code_hash = &self.data[16..16 + HASH_SIZE];
        check_digest("code", code_hash, &self.code)?;
        let data_hash = &self.data[16 + HASH_SIZE..HEADER_SIZE];
        check_digest("data", data_hash, &self.data[HEADER_SIZE..])
    }
}

fn check_digest(section: &'static str, expected: &[u8], bytes: &[u8]) -> Result<(), BlobError> {
    let actual = Sha256::digest(bytes);
    if actual.as_slice() != expected {
        return Err(BlobError::ChecksumMismatch {
            section,
            expected: hex::encode(expected),
            actual: hex::encode(actual),
        });
    }
    Ok(())
}

impl std::fmt::Debug for EmbeddedBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddedBlob")
            .field("code", &format_args!("{:#x}+{}", self.code_address(), self.code.len()))
            .field("data", &format_args!("{:#x}+{}", self.data_address(), self.data.len()))
            .finish()
    }
}

static BINARY_EMBEDDED_BLOB: Lazy<EmbeddedBlob> = Lazy::new(EmbeddedBlob::create);

/// The blob linked into this binary. Immortal.
pub fn binary_embedded_blob() -> &'static EmbeddedBlob {
    &BINARY_EMBEDDED_BLOB
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_verifies() {
        let blob = EmbeddedBlob::create();
        blob.verify().unwrap();
        assert_eq!(blob.code_size() as usize % CODE_ALIGNMENT, 0);
    }

    #[test]
    fn test_builtins_do_not_overlap() {
        let blob = EmbeddedBlob::create();
        let mut previous_end = 0;
        for builtin in Builtin::ALL {
            let offset = blob.builtin_offset(builtin);
            assert!(offset >= previous_end, "{} overlaps", builtin.name());
            assert_eq!(blob.builtin_size(builtin), builtin.instruction_size());
            previous_end = offset + blob.builtin_size(builtin);
        }
        assert!(previous_end <= blob.code_size());
    }

    #[test]
    fn test_tampered_code_is_rejected() {
        let blob = EmbeddedBlob::create();
        let mut code = blob.code().to_vec();
        code[3] ^= 0xff;
        let err = EmbeddedBlob::from_sections(code, blob.data().to_vec()).unwrap_err();
        match err {
            BlobError::ChecksumMismatch { section, expected, actual } => {
                assert_eq!(section, "code");
                assert_eq!(expected.len(), 64);
                assert_ne!(expected, actual);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_bad_header() {
        let blob = EmbeddedBlob::create();
        let mut data = blob.data().to_vec();
        data[0] = b'X';
        assert_eq!(
            EmbeddedBlob::from_sections(blob.code().to_vec(), data).unwrap_err(),
            BlobError::InvalidMagic
        );
        assert!(matches!(
            EmbeddedBlob::from_sections(vec![], vec![1, 2, 3]).unwrap_err(),
            BlobError::Truncated { .. }
        ));
    }

    #[test]
    fn test_binary_blob_is_stable() {
        let a = binary_embedded_blob();
        let b = binary_embedded_blob();
        assert_eq!(a.code_address(), b.code_address());
    }
}
