// Wrapper for sha1 libraries.
// Piece verification is the main CPU consumer of the engine, so the backend is
// pluggable through features. The pure-rust one is the default as it needs no
// system libraries; crypto-hash uses the platform implementation.

#[cfg(feature = "sha1-crypto-hash")]
pub type Sha1 = Sha1System;

#[cfg(all(feature = "sha1-rust", not(feature = "sha1-crypto-hash")))]
pub type Sha1 = Sha1Rust;

pub trait ISha1 {
    fn new() -> Self;
    fn update(&mut self, buf: &[u8]);
    fn finish(self) -> [u8; 20];
}

/// Hash a single contiguous buffer.
pub fn sha1_digest<H: ISha1>(buf: &[u8]) -> [u8; 20] {
    let mut h = H::new();
    h.update(buf);
    h.finish()
}

#[cfg(feature = "sha1-rust")]
pub struct Sha1Rust {
    inner: sha1::Sha1,
}

#[cfg(feature = "sha1-rust")]
impl ISha1 for Sha1Rust {
    fn new() -> Self {
        use sha1::Digest;
        Sha1Rust {
            inner: sha1::Sha1::new(),
        }
    }

    fn update(&mut self, buf: &[u8]) {
        use sha1::Digest;
        self.inner.update(buf)
    }

    fn finish(self) -> [u8; 20] {
        use sha1::Digest;
        let mut out = [0u8; 20];
        out.copy_from_slice(&self.inner.finalize());
        out
    }
}

#[cfg(feature = "sha1-crypto-hash")]
pub struct Sha1System {
    inner: crypto_hash::Hasher,
}

#[cfg(feature = "sha1-crypto-hash")]
impl ISha1 for Sha1System {
    fn new() -> Self {
        Self {
            inner: crypto_hash::Hasher::new(crypto_hash::Algorithm::SHA1),
        }
    }

    fn update(&mut self, buf: &[u8]) {
        use std::io::Write;
        // Writing into an in-memory digest can't fail.
        let _ = self.inner.write_all(buf);
    }

    fn finish(mut self) -> [u8; 20] {
        let result = self.inner.finish();
        debug_assert_eq!(result.len(), 20);
        let mut result_arr = [0u8; 20];
        result_arr.copy_from_slice(&result);
        result_arr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        // sha1("abc")
        let expected = [
            0xa9, 0x99, 0x3e, 0x36, 0x47, 0x06, 0x81, 0x6a, 0xba, 0x3e, 0x25, 0x71, 0x78, 0x50,
            0xc2, 0x6c, 0x9c, 0xd0, 0xd8, 0x9d,
        ];
        assert_eq!(sha1_digest::<Sha1>(b"abc"), expected);
    }

    #[test]
    fn test_incremental_matches_oneshot() {
        let mut h = Sha1::new();
        h.update(b"hello ");
        h.update(b"world");
        assert_eq!(h.finish(), sha1_digest::<Sha1>(b"hello world"));
    }
}
