use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable 256-bit content hash (blake3). Identical inputs hash identically across
/// runs and platforms, so it can key the result cache and the scheduler slots.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First 8 bytes as hex, enough to tell requests apart in logs.
    pub fn short(&self) -> String {
        self.0[..8].iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Domain-separated blake3 writer. Every variable-length field is length-prefixed
/// so that adjacent fields cannot alias ("ab","c" vs "a","bc").
pub(crate) struct FingerprintHasher {
    inner: blake3::Hasher,
}

impl FingerprintHasher {
    pub fn new(domain: &str) -> Self {
        let mut inner = blake3::Hasher::new();
        inner.update(domain.as_bytes());
        inner.update(b":");
        Self { inner }
    }

    pub fn tag(&mut self, tag: u8) -> &mut Self {
        self.inner.update(&[tag]);
        self
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.inner.update(&v.to_le_bytes());
        self
    }

    pub fn i64(&mut self, v: i64) -> &mut Self {
        self.inner.update(&v.to_le_bytes());
        self
    }

    pub fn len(&mut self, n: usize) -> &mut Self {
        self.u64(n as u64)
    }

    pub fn bool(&mut self, v: bool) -> &mut Self {
        self.tag(v as u8)
    }

    /// `-0.0` and `0.0` hash alike, all NaNs hash alike.
    pub fn f64(&mut self, v: f64) -> &mut Self {
        let bits = if v == 0.0 {
            0u64
        } else if v.is_nan() {
            f64::NAN.to_bits()
        } else {
            v.to_bits()
        };
        self.u64(bits)
    }

    pub fn str(&mut self, s: &str) -> &mut Self {
        self.len(s.len());
        self.inner.update(s.as_bytes());
        self
    }

    pub fn fingerprint(&mut self, fp: &Fingerprint) -> &mut Self {
        self.inner.update(fp.as_bytes());
        self
    }

    pub fn finish(&self) -> Fingerprint {
        Fingerprint(*self.inner.finalize().as_bytes())
    }
}
