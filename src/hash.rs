use anyhow::Result;
use std::fmt;

/// Opaque content hash of a commit as reported by the VCS backend.
/// Git uses 20 bytes, other backends may differ, so the length is not fixed.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash(Box<[u8]>);

impl Hash {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Hash(bytes.into())
    }

    /// Parse a hex string (as printed by `git log --format=%H`)
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str.trim())?;
        if bytes.is_empty() {
            anyhow::bail!("Invalid hash: empty string");
        }
        Ok(Hash(bytes.into_boxed_slice()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[inline]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// First 8 hex characters, for display
    pub fn short(&self) -> String {
        let hex = self.to_hex();
        hex[..hex.len().min(8)].to_string()
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.short())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
