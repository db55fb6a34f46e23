//! Content fingerprints used as the dedup key for submitted media.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

/// Read buffer size for streaming content into the hasher
const CHUNK_SIZE: usize = 64 * 1024;

/// Length of a fingerprint in hex characters
pub const FINGERPRINT_LEN: usize = 64;

/// Hash everything the reader yields and return the lowercase hex digest.
///
/// The digest only depends on the bytes, never on how the reader splits them.
pub fn fingerprint<R: Read>(reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    io::copy(&mut BufReader::with_capacity(CHUNK_SIZE, reader), &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Fingerprint a file on disk
pub fn fingerprint_file(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;
    fingerprint(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::io::Write;

    /// Hands out at most `step` bytes per read call
    struct Trickle<'a> {
        data: &'a [u8],
        step: usize,
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.step.min(buf.len()).min(self.data.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    /// Fails every other read with `Interrupted`
    struct Flaky<'a> {
        data: &'a [u8],
        interrupt: bool,
    }

    impl Read for Flaky<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.interrupt = !self.interrupt;
            if self.interrupt {
                return Err(io::Error::from(io::ErrorKind::Interrupted));
            }
            let n = 3.min(buf.len()).min(self.data.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    struct Broken;

    impl Read for Broken {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::UnexpectedEof, "disk went away"))
        }
    }

    #[test]
    fn test_known_digests() {
        assert_eq!(
            fingerprint(Cursor::new(b"")).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            fingerprint(Cursor::new(b"abc")).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_chunking_does_not_matter() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();

        let whole = fingerprint(Cursor::new(&data)).unwrap();
        let byte_by_byte = fingerprint(Trickle { data: &data, step: 1 }).unwrap();
        let odd_steps = fingerprint(Trickle { data: &data, step: 7919 }).unwrap();

        assert_eq!(whole, byte_by_byte);
        assert_eq!(whole, odd_steps);
        assert_eq!(whole.len(), FINGERPRINT_LEN);
    }

    #[test]
    fn test_different_content_differs() {
        let a = fingerprint(Cursor::new(b"hello world")).unwrap();
        let b = fingerprint(Cursor::new(b"hello world!")).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_interrupted_reads_are_retried() {
        let data = b"interrupted but complete";
        let flaky = fingerprint(Flaky { data, interrupt: false }).unwrap();
        assert_eq!(flaky, fingerprint(Cursor::new(data)).unwrap());
    }

    #[test]
    fn test_read_failure_is_reported() {
        let err = fingerprint(Broken).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_fingerprint_file_matches_bytes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"abc").unwrap();
        file.flush().unwrap();

        assert_eq!(
            fingerprint_file(file.path()).unwrap(),
            fingerprint(Cursor::new(b"abc")).unwrap()
        );
        assert!(fingerprint_file(Path::new("/definitely/not/here.wav")).is_err());
    }
}
