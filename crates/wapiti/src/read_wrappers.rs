use {
    crate::utils::Fingerprint,
    std::io::{self, Read},
};

/// wraps a reader so that reaching EOF with a byte count different from the
/// expected one becomes an io error instead of a silently short file
pub struct ValidateSize<R> {
    inner: R,
    expected: u64,
    seen: u64,
}

impl<R: Read> Read for ValidateSize<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.seen += read as u64;
        if read == 0 && self.seen != self.expected {
            return Err(io::Error::other(format!(
                "size mismatch: expected [{}] bytes, stream ended at [{}]",
                self.expected, self.seen
            )));
        }
        if self.seen > self.expected {
            return Err(io::Error::other(format!(
                "size mismatch: expected [{}] bytes, already saw [{}]",
                self.expected, self.seen
            )));
        }
        Ok(read)
    }
}

/// wraps a reader with a running xxh64; EOF with a digest other than the
/// expected one is an io error. validation happens exactly once, at the end,
/// so the wrapped stream is still consumed in one pass.
pub struct ValidateHash<R> {
    inner: R,
    expected: Fingerprint,
    hasher: xxhash_rust::xxh64::Xxh64,
    validated: bool,
}

impl<R: Read> Read for ValidateHash<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        match read {
            0 if !self.validated => {
                self.validated = true;
                let found = Fingerprint(self.hasher.digest());
                if found != self.expected {
                    return Err(io::Error::other(format!(
                        "hash mismatch: expected [{}], found [{}]",
                        self.expected, found
                    )));
                }
                Ok(0)
            }
            read => {
                self.hasher.update(&buf[..read]);
                Ok(read)
            }
        }
    }
}

#[extension_traits::extension(pub trait ReadExt)]
impl<R: Read> R {
    fn and_validate_size(self, expected: u64) -> ValidateSize<R> {
        ValidateSize {
            inner: self,
            expected,
            seen: 0,
        }
    }
    fn and_validate_hash(self, expected: Fingerprint) -> ValidateHash<R> {
        ValidateHash {
            inner: self,
            expected,
            hasher: xxhash_rust::xxh64::Xxh64::new(0),
            validated: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, std::io::Cursor};

    fn fingerprint_of(bytes: &[u8]) -> Fingerprint {
        let mut hasher = xxhash_rust::xxh64::Xxh64::new(0);
        hasher.update(bytes);
        Fingerprint(hasher.digest())
    }

    #[test]
    fn test_size_validation_passes_on_exact_size() {
        let mut out = Vec::new();
        std::io::copy(&mut Cursor::new(b"hello".to_vec()).and_validate_size(5), &mut out).unwrap();
        assert_eq!(out, b"hello");
    }

    #[test]
    fn test_size_validation_fails_on_short_stream() {
        let mut out = Vec::new();
        assert!(std::io::copy(&mut Cursor::new(b"hel".to_vec()).and_validate_size(5), &mut out).is_err());
    }

    #[test]
    fn test_hash_validation_round_trip() {
        let expected = fingerprint_of(b"payload");
        let mut out = Vec::new();
        std::io::copy(&mut Cursor::new(b"payload".to_vec()).and_validate_hash(expected), &mut out).unwrap();
        assert_eq!(out, b"payload");
    }

    #[test]
    fn test_hash_validation_rejects_corruption() {
        let expected = fingerprint_of(b"payload");
        let mut out = Vec::new();
        assert!(std::io::copy(&mut Cursor::new(b"paYload".to_vec()).and_validate_hash(expected), &mut out).is_err());
    }

    #[test]
    fn test_stacked_validators() {
        let expected = fingerprint_of(b"hello");
        let mut out = Vec::new();
        std::io::copy(
            &mut Cursor::new(b"hello".to_vec())
                .and_validate_size(5)
                .and_validate_hash(expected),
            &mut out,
        )
        .unwrap();
        assert_eq!(out, b"hello");
    }
}
