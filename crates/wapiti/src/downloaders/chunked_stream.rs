//! a seekable read view over a remote archive, fetched chunk-by-chunk through
//! range requests - lets callers peek into remote modlist bundles without
//! committing to a full download.

use {
    anyhow::{Context, Result},
    std::{
        collections::BTreeMap,
        io::{Read, Seek, SeekFrom},
    },
    tracing::debug,
};

pub const CHUNK_SIZE: u64 = 1024 * 1024;
const MAX_CACHED_CHUNKS: usize = 8;

/// blocking on purpose: the zip machinery that consumes this wants `Read + Seek`,
/// and the peeking paths run on the blocking pool anyway
pub struct ChunkedRemoteStream {
    client: reqwest::blocking::Client,
    url: String,
    length: u64,
    position: u64,
    chunks: BTreeMap<u64, Vec<u8>>,
}

impl ChunkedRemoteStream {
    pub fn open(url: &str) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building blocking client")?;
        let length = client
            .head(url)
            .send()
            .and_then(|response| response.error_for_status())
            .with_context(|| format!("probing [{url}]"))?
            .content_length()
            .with_context(|| format!("[{url}] reports no content length - cannot seek into it"))?;
        Ok(Self {
            client,
            url: url.to_string(),
            length,
            position: 0,
            chunks: BTreeMap::new(),
        })
    }

    pub fn len(&self) -> u64 {
        self.length
    }
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    fn chunk_containing(&mut self, position: u64) -> std::io::Result<&[u8]> {
        let chunk_start = (position / CHUNK_SIZE) * CHUNK_SIZE;
        if !self.chunks.contains_key(&chunk_start) {
            let chunk_end = (chunk_start + CHUNK_SIZE - 1).min(self.length.saturating_sub(1));
            debug!(url = %self.url, chunk_start, chunk_end, "fetching chunk");
            let bytes = self
                .client
                .get(&self.url)
                .header(reqwest::header::RANGE, format!("bytes={chunk_start}-{chunk_end}"))
                .send()
                .and_then(|response| response.error_for_status())
                .map_err(std::io::Error::other)?
                .bytes()
                .map_err(std::io::Error::other)?
                .to_vec();
            if self.chunks.len() >= MAX_CACHED_CHUNKS {
                // evict the chunk furthest from the read head
                let victim = self
                    .chunks
                    .keys()
                    .max_by_key(|start| start.abs_diff(chunk_start))
                    .copied();
                victim.map(|victim| self.chunks.remove(&victim));
            }
            self.chunks.insert(chunk_start, bytes);
        }
        Ok(self.chunks.get(&chunk_start).expect("just inserted"))
    }
}

impl Read for ChunkedRemoteStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.position >= self.length {
            return Ok(0);
        }
        let position = self.position;
        let offset_in_chunk = (position % CHUNK_SIZE) as usize;
        let chunk = self.chunk_containing(position)?;
        let available = chunk.len().saturating_sub(offset_in_chunk);
        let window = buf.len().min(available);
        buf[..window].copy_from_slice(&chunk[offset_in_chunk..offset_in_chunk + window]);
        self.position += window as u64;
        Ok(window)
    }
}

impl Seek for ChunkedRemoteStream {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::End(offset) => self.length as i128 + offset as i128,
            SeekFrom::Current(offset) => self.position as i128 + offset as i128,
        };
        u64::try_from(target)
            .map_err(|_| std::io::Error::other("seek before start of stream"))
            .map(|target| {
                self.position = target;
                target
            })
    }
}
