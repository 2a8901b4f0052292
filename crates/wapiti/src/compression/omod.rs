//! embedded unpacker for omod mod containers: an outer zip holding `data.crc` /
//! `plugins.crc` manifests (dotnet BinaryWriter tuples) next to `data` /
//! `plugins` streams that carry the concatenated file bodies behind zlib.

use {
    super::{ExtractedFile, ProcessArchive, ScratchEntry},
    crate::{paths::RelativePath, utils::MaybeWindowsPath},
    anyhow::{bail, Context, Result},
    std::{
        io::{BufWriter, Read, Write},
        path::Path,
        sync::Arc,
    },
    tap::prelude::*,
    tempfile::TempDir,
};

#[derive(Debug, Clone)]
struct OmodEntry {
    name: RelativePath,
    #[allow(dead_code)]
    crc: u32,
    length: u64,
}

#[derive(Debug)]
pub struct OmodArchive {
    zip: super::zip::ZipArchive,
    data_entries: Vec<OmodEntry>,
    plugin_entries: Vec<OmodEntry>,
}

fn read_u8(reader: &mut impl Read) -> Result<u8> {
    [0u8; 1].pipe(|mut buf| reader.read_exact(&mut buf).context("reading byte").map(|_| buf[0]))
}

/// dotnet BinaryWriter 7-bit-encoded length prefix
fn read_dotnet_string(reader: &mut impl Read) -> Result<String> {
    let mut length = 0usize;
    let mut shift = 0u32;
    loop {
        let byte = read_u8(reader).context("reading string length")?;
        length |= ((byte & 0x7f) as usize) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 28 {
            bail!("string length prefix does not terminate");
        }
    }
    vec![0u8; length].pipe(|mut buf| {
        reader
            .read_exact(&mut buf)
            .context("reading string bytes")
            .and_then(|_| String::from_utf8(buf).context("string is not utf-8"))
    })
}

fn read_crc_manifest(reader: &mut impl Read) -> Result<Vec<OmodEntry>> {
    let mut entries = Vec::new();
    loop {
        let name = match read_dotnet_string(reader) {
            Ok(name) => name,
            // manifests carry no count - they simply end
            Err(_) => break,
        };
        let mut crc = [0u8; 4];
        reader.read_exact(&mut crc).context("reading crc")?;
        let mut length = [0u8; 8];
        reader.read_exact(&mut length).context("reading length")?;
        entries.push(OmodEntry {
            name: MaybeWindowsPath(name).into_relative_path(),
            crc: u32::from_le_bytes(crc),
            length: i64::from_le_bytes(length)
                .pipe(u64::try_from)
                .context("negative entry length")?,
        });
    }
    Ok(entries)
}

impl OmodArchive {
    pub fn new(path: &Path) -> Result<Self> {
        super::zip::ZipArchive::new(path)
            .with_context(|| format!("opening omod container [{}]", path.display()))
            .and_then(|mut zip| {
                let data_entries = Self::manifest(&mut zip, "data.crc")?;
                let plugin_entries = Self::manifest(&mut zip, "plugins.crc")?;
                Ok(Self {
                    zip,
                    data_entries,
                    plugin_entries,
                })
            })
    }

    fn manifest(zip: &mut super::zip::ZipArchive, name: &str) -> Result<Vec<OmodEntry>> {
        let wanted = RelativePath::new(name);
        match zip.list_paths()?.iter().any(|path| path.normalized() == wanted.normalized()) {
            false => Ok(Vec::new()),
            true => zip
                .get_handle(&wanted)
                .and_then(|handle| handle.get_stream().and_then(|mut stream| read_crc_manifest(&mut stream)))
                .with_context(|| format!("reading omod manifest [{name}]")),
        }
    }

    /// splits one zlib stream into scratch files according to the manifest's
    /// declared lengths
    fn unpack_stream(&mut self, stream_name: &str, entries: &[OmodEntry], directory: &Arc<TempDir>) -> Result<Vec<(RelativePath, ExtractedFile)>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let handle = self
            .zip
            .get_handle(&RelativePath::new(stream_name))
            .with_context(|| format!("omod has a manifest but no [{stream_name}] stream"))?;
        let stream = handle.get_stream()?;
        let mut inflated = flate2::read::ZlibDecoder::new(stream);
        entries
            .iter()
            .map(|entry| {
                let scratch = tempfile::Builder::new()
                    .tempfile_in(directory.path())
                    .context("creating scratch file")?;
                let mut writer = BufWriter::new(scratch);
                std::io::copy(&mut (&mut inflated).take(entry.length), &mut writer)
                    .with_context(|| format!("inflating [{:?}]", entry.name))
                    .and_then(|inflated| {
                        inflated
                            .eq(&entry.length)
                            .then_some(())
                            .with_context(|| format!("omod stream ended inside [{:?}]: expected [{}], got [{inflated}]", entry.name, entry.length))
                    })?;
                let scratch = writer.into_inner().context("flushing scratch file")?;
                Ok((
                    entry.name.clone(),
                    ExtractedFile::Scratch(ScratchEntry::new(
                        entry.name.clone(),
                        scratch.into_temp_path(),
                        Some(directory.clone()),
                        None,
                    )),
                ))
            })
            .collect()
    }

    fn unpack_all(&mut self) -> Result<Vec<(RelativePath, ExtractedFile)>> {
        let directory = crate::utils::scoped_temp_dir().map(Arc::new)?;
        let data = self.data_entries.clone();
        let plugins = self.plugin_entries.clone();
        let mut unpacked = self.unpack_stream("data", &data, &directory)?;
        unpacked.extend(self.unpack_stream("plugins", &plugins, &directory)?);
        Ok(unpacked)
    }
}

impl ProcessArchive for OmodArchive {
    fn list_paths(&mut self) -> Result<Vec<RelativePath>> {
        Ok(self
            .data_entries
            .iter()
            .chain(self.plugin_entries.iter())
            .map(|entry| entry.name.clone())
            .collect())
    }
    fn get_many_handles(&mut self, paths: &[RelativePath]) -> Result<Vec<(RelativePath, ExtractedFile)>> {
        // the streams are sequential - everything has to be inflated anyway, so
        // unpack once and pick the requested subset
        let mut unpacked = self
            .unpack_all()?
            .into_iter()
            .map(|(path, handle)| (path.normalized(), handle))
            .collect::<std::collections::BTreeMap<_, _>>();
        paths
            .iter()
            .map(|path| {
                unpacked
                    .remove(&path.normalized())
                    .with_context(|| format!("path [{path:?}] not found in omod"))
                    .map(|handle| (path.clone(), handle))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use {super::*, pretty_assertions::assert_eq, std::io::Seek};

    fn dotnet_string(name: &str) -> Vec<u8> {
        let mut out = vec![name.len() as u8];
        out.extend_from_slice(name.as_bytes());
        out
    }

    fn crc_manifest(entries: &[(&str, u32, u64)]) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, crc, length) in entries {
            out.extend(dotnet_string(name));
            out.extend_from_slice(&crc.to_le_bytes());
            out.extend_from_slice(&(*length as i64).to_le_bytes());
        }
        out
    }

    fn build_omod(entries: &[(&str, &[u8])]) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".omod").tempfile().unwrap();
        {
            let mut zip = ::zip::ZipWriter::new(&mut file);
            let options = ::zip::write::SimpleFileOptions::default();
            zip.start_file("data.crc", options).unwrap();
            zip.write_all(&crc_manifest(
                &entries
                    .iter()
                    .map(|(name, payload)| (*name, 0u32, payload.len() as u64))
                    .collect::<Vec<_>>(),
            ))
            .unwrap();
            zip.start_file("data", options).unwrap();
            let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            for (_, payload) in entries {
                encoder.write_all(payload).unwrap();
            }
            zip.write_all(&encoder.finish().unwrap()).unwrap();
            zip.finish().unwrap();
        }
        file.rewind().unwrap();
        file
    }

    #[test]
    fn test_lists_manifest_entries() {
        let omod = build_omod(&[("meshes\\a.nif", b"AAAA"), ("textures\\b.dds", b"BB")]);
        let mut archive = OmodArchive::new(omod.path()).unwrap();
        assert_eq!(
            archive.list_paths().unwrap(),
            vec![RelativePath::new("meshes/a.nif"), RelativePath::new("textures/b.dds")]
        );
    }

    #[test]
    fn test_unpacks_payloads_by_length() {
        let omod = build_omod(&[("meshes/a.nif", b"AAAA"), ("textures/b.dds", b"BB")]);
        let mut archive = OmodArchive::new(omod.path()).unwrap();
        let handles = archive
            .get_many_handles(&[RelativePath::new("meshes/a.nif"), RelativePath::new("textures/b.dds")])
            .unwrap();
        let contents = handles
            .iter()
            .map(|(_, handle)| {
                let mut bytes = Vec::new();
                handle.get_stream().unwrap().read_to_end(&mut bytes).unwrap();
                bytes
            })
            .collect::<Vec<_>>();
        assert_eq!(contents, vec![b"AAAA".to_vec(), b"BB".to_vec()]);
    }
}
