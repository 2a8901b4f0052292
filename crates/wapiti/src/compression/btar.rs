//! in-process reader for the btar container: big-endian `"BTAR"` magic, a
//! 16-bit major/minor version pair, then packed `(name, payload)` records until
//! eof. entries are served as zero-copy windows into the source mapping.

use {
    super::{ExtractedFile, ProcessArchive, SliceEntry},
    crate::{paths::RelativePath, utils::PathReadWrite},
    anyhow::{bail, Context, Result},
    std::{path::Path, sync::Arc, time::SystemTime},
    tap::prelude::*,
};

const MAGIC: &[u8; 4] = b"BTAR";
const SUPPORTED_MAJOR: u16 = 1;
const SUPPORTED_MINORS: &[u16] = &[2, 3, 4];

#[derive(Debug, Clone)]
struct BtarEntry {
    name: RelativePath,
    start: usize,
    len: usize,
}

#[derive(Debug)]
pub struct BtarArchive {
    source: Arc<memmap2::Mmap>,
    entries: Vec<BtarEntry>,
    pub version: (u16, u16),
    modified: Option<SystemTime>,
}

fn take<'a>(bytes: &'a [u8], cursor: &mut usize, len: usize, what: &str) -> Result<&'a [u8]> {
    bytes
        .get(*cursor..*cursor + len)
        .with_context(|| format!("truncated btar: [{what}] needs [{len}] bytes at offset [{cursor}], source has [{}]", bytes.len()))
        .tap_ok(|_| *cursor += len)
}

fn take_u16(bytes: &[u8], cursor: &mut usize, what: &str) -> Result<u16> {
    take(bytes, cursor, 2, what).map(|b| u16::from_be_bytes([b[0], b[1]]))
}

fn take_u64(bytes: &[u8], cursor: &mut usize, what: &str) -> Result<u64> {
    take(bytes, cursor, 8, what).map(|b| u64::from_be_bytes(b.try_into().expect("length checked")))
}

impl BtarArchive {
    pub fn new(path: &Path) -> Result<Self> {
        path.open_file_read()
            .and_then(|(path, file)| {
                let modified = file.metadata().ok().and_then(|metadata| metadata.modified().ok());
                // SAFETY: the downloads directory is owned by the engine for the
                // duration of the install; nobody truncates archives under us
                unsafe { memmap2::Mmap::map(&file) }
                    .with_context(|| format!("mapping [{}]", path.display()))
                    .map(|mmap| (mmap, modified))
            })
            .and_then(|(mmap, modified)| {
                let bytes: &[u8] = &mmap;
                let mut cursor = 0usize;
                if take(bytes, &mut cursor, 4, "magic")? != MAGIC {
                    bail!("not a btar stream (bad magic)");
                }
                let major = take_u16(bytes, &mut cursor, "major version")?;
                let minor = take_u16(bytes, &mut cursor, "minor version")?;
                if major != SUPPORTED_MAJOR || !SUPPORTED_MINORS.contains(&minor) {
                    bail!("unsupported btar version [{major}.{minor}]");
                }
                let mut entries = Vec::new();
                while cursor < bytes.len() {
                    let name_len = take_u16(bytes, &mut cursor, "name length")? as usize;
                    let name = take(bytes, &mut cursor, name_len, "name")?
                        .pipe(std::str::from_utf8)
                        .context("entry name is not utf-8")?
                        .pipe(RelativePath::new);
                    let data_len = take_u64(bytes, &mut cursor, "data length")?;
                    let data_len = usize::try_from(data_len).context("entry too large for this platform")?;
                    let start = cursor;
                    take(bytes, &mut cursor, data_len, "payload")?;
                    entries.push(BtarEntry {
                        name,
                        start,
                        len: data_len,
                    });
                }
                Ok(Self {
                    source: Arc::new(mmap),
                    entries,
                    version: (major, minor),
                    modified,
                })
            })
    }

    fn entry_to_handle(&self, entry: &BtarEntry) -> ExtractedFile {
        ExtractedFile::Slice(SliceEntry {
            name: entry.name.clone(),
            source: self.source.clone(),
            start: entry.start,
            len: entry.len,
            modified: self.modified,
        })
    }
}

impl ProcessArchive for BtarArchive {
    fn list_paths(&mut self) -> Result<Vec<RelativePath>> {
        Ok(self.entries.iter().map(|entry| entry.name.clone()).collect())
    }
    fn get_many_handles(&mut self, paths: &[RelativePath]) -> Result<Vec<(RelativePath, ExtractedFile)>> {
        paths
            .iter()
            .map(|path| {
                self.entries
                    .iter()
                    .find(|entry| entry.name.normalized() == path.normalized())
                    .with_context(|| format!("path [{path:?}] not found in btar"))
                    .map(|entry| (path.clone(), self.entry_to_handle(entry)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        pretty_assertions::assert_eq,
        std::io::{Read, Write},
    };

    pub(crate) fn build_btar(minor: u16, entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&SUPPORTED_MAJOR.to_be_bytes());
        out.extend_from_slice(&minor.to_be_bytes());
        for (name, payload) in entries {
            out.extend_from_slice(&(name.len() as u16).to_be_bytes());
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(&(payload.len() as u64).to_be_bytes());
            out.extend_from_slice(payload);
        }
        out
    }

    fn write_temp(bytes: &[u8]) -> tempfile::NamedTempFile {
        tempfile::Builder::new()
            .suffix(".btar")
            .tempfile()
            .unwrap()
            .tap_mut(|file| file.write_all(bytes).unwrap())
    }

    #[test]
    fn test_v1_3_single_entry_round_trip() {
        let file = write_temp(&build_btar(3, &[("a/b.txt", b"hello")]));
        let mut archive = BtarArchive::new(file.path()).unwrap();
        assert_eq!(archive.version, (1, 3));
        assert_eq!(archive.list_paths().unwrap(), vec![RelativePath::new("a/b.txt")]);
        let handle = archive.get_handle(&RelativePath::new("a/b.txt")).unwrap();
        let mut contents = String::new();
        handle.get_stream().unwrap().read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "hello");
    }

    #[test]
    fn test_every_supported_minor_parses() {
        for minor in SUPPORTED_MINORS {
            let file = write_temp(&build_btar(*minor, &[("x", b"y")]));
            assert!(BtarArchive::new(file.path()).is_ok(), "minor version {minor}");
        }
    }

    #[test]
    fn test_unsupported_version_is_rejected() {
        let file = write_temp(&build_btar(9, &[]));
        assert!(BtarArchive::new(file.path()).is_err());
    }

    #[test]
    fn test_name_length_overrun_is_a_parse_error() {
        let mut bytes = build_btar(3, &[]);
        bytes.extend_from_slice(&100u16.to_be_bytes());
        bytes.extend_from_slice(b"short");
        let file = write_temp(&bytes);
        assert!(BtarArchive::new(file.path()).is_err());
    }

    #[test]
    fn test_data_length_overrun_is_a_parse_error() {
        let mut bytes = build_btar(3, &[]);
        bytes.extend_from_slice(&1u16.to_be_bytes());
        bytes.push(b'f');
        bytes.extend_from_slice(&1_000u64.to_be_bytes());
        bytes.extend_from_slice(b"not a thousand bytes");
        let file = write_temp(&bytes);
        assert!(BtarArchive::new(file.path()).is_err());
    }

    #[test]
    fn test_gathering_extract_yields_mapping() {
        let file = write_temp(&build_btar(3, &[("a/b.txt", b"hello"), ("c.txt", b"ignored")]));
        let gathered = crate::compression::gathering_extract(
            file.path(),
            |_| true,
            |_, handle| {
                let mut contents = String::new();
                handle
                    .get_stream()
                    .unwrap()
                    .read_to_string(&mut contents)
                    .map(|_| contents)
                    .map_err(anyhow::Error::from)
            },
            None,
            None,
        )
        .unwrap();
        assert_eq!(gathered.get(&RelativePath::new("a/b.txt")).map(String::as_str), Some("hello"));
        assert_eq!(gathered.len(), 2);
    }
}
