//! streaming applier for the octodiff binary delta format.
//!
//! a delta file is `OCTODELTA`, a version byte, the signature-hash metadata
//! (algorithm name as a length-prefixed string, digest length, digest bytes),
//! the `>>>` end-of-metadata marker, then a command stream: `0x60` copies a
//! `(start, length)` run out of the source file, `0x80` carries `length` bytes
//! of literal data. applying never needs the whole output in memory - the
//! applier is a [`Read`] that serves commands lazily.

use {
    anyhow::{bail, Context, Result},
    std::io::{Read, Seek, SeekFrom},
    tap::prelude::*,
};

const DELTA_HEADER: &[u8] = b"OCTODELTA";
const END_OF_METADATA: &[u8] = b">>>";
const SUPPORTED_VERSION: u8 = 0x01;

const COMMAND_COPY: u8 = 0x60;
const COMMAND_DATA: u8 = 0x80;

fn read_u8(reader: &mut impl Read) -> Result<u8> {
    [0u8; 1].pipe(|mut buf| {
        reader
            .read_exact(&mut buf)
            .context("reading byte")
            .map(|_| buf[0])
    })
}

fn read_u64_le(reader: &mut impl Read) -> Result<u64> {
    [0u8; 8].pipe(|mut buf| {
        reader
            .read_exact(&mut buf)
            .context("reading u64")
            .map(|_| u64::from_le_bytes(buf))
    })
}

fn read_u32_le(reader: &mut impl Read) -> Result<u32> {
    [0u8; 4].pipe(|mut buf| {
        reader
            .read_exact(&mut buf)
            .context("reading u32")
            .map(|_| u32::from_le_bytes(buf))
    })
}

/// dotnet BinaryWriter strings carry a 7-bit-encoded length prefix
fn read_length_prefixed_string(reader: &mut impl Read) -> Result<String> {
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

enum PendingCommand {
    /// serving `remaining` bytes out of the source
    Copy { remaining: u64 },
    /// serving `remaining` literal bytes out of the delta stream
    Data { remaining: u64 },
    Exhausted,
}

/// applies a delta on the fly: reading from this yields the patched output
pub struct ApplyDelta<S, D> {
    source: S,
    delta: D,
    pending: PendingCommand,
}

impl<S, D> ApplyDelta<S, D>
where
    S: Read + Seek,
    D: Read,
{
    pub fn new_from_readers(source: S, mut delta: D) -> Result<Self> {
        let mut header = [0u8; DELTA_HEADER.len()];
        delta
            .read_exact(&mut header)
            .context("delta too short for header")?;
        if header != DELTA_HEADER {
            bail!("not a delta stream (bad header)");
        }
        let version = read_u8(&mut delta).context("reading version")?;
        if version != SUPPORTED_VERSION {
            bail!("unsupported delta version [{version}]");
        }
        let hash_algorithm = read_length_prefixed_string(&mut delta).context("reading hash algorithm name")?;
        let hash_length = read_u32_le(&mut delta).context("reading hash length")?;
        std::io::copy(&mut (&mut delta).take(hash_length as u64), &mut std::io::sink())
            .with_context(|| format!("skipping [{hash_length}] bytes of [{hash_algorithm}] digest"))?;
        let mut end_of_metadata = [0u8; END_OF_METADATA.len()];
        delta
            .read_exact(&mut end_of_metadata)
            .context("delta too short for end-of-metadata marker")?;
        if end_of_metadata != END_OF_METADATA {
            bail!("malformed delta: end-of-metadata marker not found");
        }
        Ok(Self {
            source,
            delta,
            pending: PendingCommand::Exhausted,
        })
    }

    fn next_command(&mut self) -> std::io::Result<bool> {
        let mut opcode = [0u8; 1];
        match self.delta.read(&mut opcode)? {
            0 => return Ok(false),
            _ => {}
        }
        match opcode[0] {
            COMMAND_COPY => {
                let start = read_u64_le(&mut self.delta).map_err(std::io::Error::other)?;
                let length = read_u64_le(&mut self.delta).map_err(std::io::Error::other)?;
                self.source.seek(SeekFrom::Start(start))?;
                self.pending = PendingCommand::Copy { remaining: length };
            }
            COMMAND_DATA => {
                let length = read_u64_le(&mut self.delta).map_err(std::io::Error::other)?;
                self.pending = PendingCommand::Data { remaining: length };
            }
            other => {
                return Err(std::io::Error::other(format!("unknown delta command [{other:#04x}]")));
            }
        }
        Ok(true)
    }
}

impl<S, D> Read for ApplyDelta<S, D>
where
    S: Read + Seek,
    D: Read,
{
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            match &mut self.pending {
                PendingCommand::Exhausted => {
                    if !self.next_command()? {
                        return Ok(0);
                    }
                }
                PendingCommand::Copy { remaining } => {
                    if *remaining == 0 {
                        self.pending = PendingCommand::Exhausted;
                        continue;
                    }
                    let window = buf.len().min(*remaining as usize);
                    let read = self.source.read(&mut buf[..window])?;
                    if read == 0 {
                        return Err(std::io::Error::other("source ended inside a copy command"));
                    }
                    *remaining -= read as u64;
                    return Ok(read);
                }
                PendingCommand::Data { remaining } => {
                    if *remaining == 0 {
                        self.pending = PendingCommand::Exhausted;
                        continue;
                    }
                    let window = buf.len().min(*remaining as usize);
                    let read = self.delta.read(&mut buf[..window])?;
                    if read == 0 {
                        return Err(std::io::Error::other("delta ended inside a data command"));
                    }
                    *remaining -= read as u64;
                    return Ok(read);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, pretty_assertions::assert_eq, std::io::Cursor};

    fn example_delta(commands: &[u8]) -> Vec<u8> {
        let mut delta = Vec::new();
        delta.extend_from_slice(DELTA_HEADER);
        delta.push(SUPPORTED_VERSION);
        delta.push(4); // length prefix of "SHA1"
        delta.extend_from_slice(b"SHA1");
        delta.extend_from_slice(&20u32.to_le_bytes());
        delta.extend_from_slice(&[0u8; 20]);
        delta.extend_from_slice(END_OF_METADATA);
        delta.extend_from_slice(commands);
        delta
    }

    fn copy_command(start: u64, length: u64) -> Vec<u8> {
        let mut command = vec![COMMAND_COPY];
        command.extend_from_slice(&start.to_le_bytes());
        command.extend_from_slice(&length.to_le_bytes());
        command
    }

    fn data_command(payload: &[u8]) -> Vec<u8> {
        let mut command = vec![COMMAND_DATA];
        command.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        command.extend_from_slice(payload);
        command
    }

    fn apply(source: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
        ApplyDelta::new_from_readers(Cursor::new(source.to_vec()), Cursor::new(delta.to_vec())).and_then(|mut apply| {
            let mut out = Vec::new();
            apply.read_to_end(&mut out).context("reading patched output")?;
            Ok(out)
        })
    }

    #[test]
    fn test_copy_then_data() {
        let source = b"0123456789";
        let delta = example_delta(
            &[copy_command(2, 3), data_command(b"XY"), copy_command(0, 1)]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>(),
        );
        assert_eq!(apply(source, &delta).unwrap(), b"234XY0");
    }

    #[test]
    fn test_pure_data_delta() {
        let delta = example_delta(&data_command(b"fresh contents"));
        assert_eq!(apply(b"", &delta).unwrap(), b"fresh contents");
    }

    #[test]
    fn test_bad_header_is_rejected() {
        assert!(apply(b"", b"NOTADELTA").is_err());
    }

    #[test]
    fn test_truncated_data_command_is_an_error() {
        let mut delta = example_delta(&data_command(b"full payload"));
        delta.truncate(delta.len() - 4);
        assert!(apply(b"", &delta).is_err());
    }

    #[test]
    fn test_unknown_command_is_an_error() {
        let delta = example_delta(&[0x42]);
        assert!(apply(b"", &delta).is_err());
    }
}
