// Multi-algorithm digest computation
use crate::error::{CaskError, CaskResult};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::io::{self, BufReader, Read, Write};
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const CHUNK_SIZE: usize = 16 * 1024; // 16KB chunks
const READ_BUFFER: usize = 1024 * 1024; // 1MB buffer

/// Supported hash algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    Sha256,
    Sha512,
    Blake3,
}

impl Algorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
            Algorithm::Blake3 => "blake3",
        }
    }

    /// Length of the hex digest.
    pub fn hex_len(&self) -> usize {
        match self {
            Algorithm::Sha256 | Algorithm::Blake3 => 64,
            Algorithm::Sha512 => 128,
        }
    }

    /// Check that `address` looks like a digest produced by this algorithm.
    pub fn validate_address(&self, address: &str) -> CaskResult<()> {
        let well_formed = address.len() == self.hex_len()
            && address
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if well_formed {
            Ok(())
        } else {
            Err(CaskError::config(format!(
                "invalid {} address: {:?}",
                self.name(),
                address
            )))
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Algorithm {
    type Err = CaskError;

    fn from_str(s: &str) -> CaskResult<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "").as_str() {
            "sha256" => Ok(Algorithm::Sha256),
            "sha512" => Ok(Algorithm::Sha512),
            "blake3" => Ok(Algorithm::Blake3),
            other => Err(CaskError::config(format!(
                "unsupported digest algorithm: {}",
                other
            ))),
        }
    }
}

/// Parse a comma separated algorithm list such as `"sha256,blake3"`.
pub fn parse_algorithms(list: &str) -> CaskResult<Vec<Algorithm>> {
    let algorithms = list
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(Algorithm::from_str)
        .collect::<CaskResult<Vec<_>>>()?;
    if algorithms.is_empty() {
        return Err(CaskError::config("digest algorithm list is empty"));
    }
    Ok(algorithms)
}

/// Every configured digest of one piece of content, in configured order.
///
/// The first entry is the canonical content address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestSet {
    entries: Vec<(Algorithm, String)>,
}

impl DigestSet {
    pub fn new(entries: Vec<(Algorithm, String)>) -> CaskResult<Self> {
        if entries.is_empty() {
            return Err(CaskError::config("digest set must not be empty"));
        }
        Ok(Self { entries })
    }

    /// Canonical content address (the first configured digest).
    pub fn content_address(&self) -> &str {
        &self.entries[0].1
    }

    pub fn canonical_algorithm(&self) -> Algorithm {
        self.entries[0].0
    }

    pub fn get(&self, algorithm: Algorithm) -> Option<&str> {
        self.entries
            .iter()
            .find(|(alg, _)| *alg == algorithm)
            .map(|(_, hex)| hex.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (Algorithm, &str)> {
        self.entries.iter().map(|(alg, hex)| (*alg, hex.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for DigestSet {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (alg, hex) in &self.entries {
            map.serialize_entry(alg.name(), hex)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for DigestSet {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DigestSetVisitor;

        impl<'de> Visitor<'de> for DigestSetVisitor {
            type Value = DigestSet;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of algorithm name to hex digest")
            }

            fn visit_map<A>(self, mut access: A) -> Result<DigestSet, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries = Vec::new();
                while let Some((name, hex)) = access.next_entry::<String, String>()? {
                    let alg = Algorithm::from_str(&name).map_err(serde::de::Error::custom)?;
                    entries.push((alg, hex));
                }
                DigestSet::new(entries).map_err(serde::de::Error::custom)
            }
        }

        deserializer.deserialize_map(DigestSetVisitor)
    }
}

enum HasherState {
    Sha256(Sha256),
    Sha512(Sha512),
    Blake3(Box<blake3::Hasher>),
}

/// Feeds every configured algorithm from the same buffer, so content is
/// only ever read once.
pub struct MultiHasher {
    states: Vec<(Algorithm, HasherState)>,
    bytes: u64,
}

impl MultiHasher {
    pub fn new(algorithms: &[Algorithm]) -> Self {
        let states = algorithms
            .iter()
            .map(|alg| {
                let state = match alg {
                    Algorithm::Sha256 => HasherState::Sha256(Sha256::new()),
                    Algorithm::Sha512 => HasherState::Sha512(Sha512::new()),
                    Algorithm::Blake3 => HasherState::Blake3(Box::new(blake3::Hasher::new())),
                };
                (*alg, state)
            })
            .collect();
        Self { states, bytes: 0 }
    }

    pub fn update(&mut self, data: &[u8]) {
        for (_, state) in self.states.iter_mut() {
            match state {
                HasherState::Sha256(h) => h.update(data),
                HasherState::Sha512(h) => h.update(data),
                HasherState::Blake3(h) => {
                    h.update(data);
                }
            }
        }
        self.bytes += data.len() as u64;
    }

    /// Bytes fed so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn finish(self) -> CaskResult<DigestSet> {
        let entries = self
            .states
            .into_iter()
            .map(|(alg, state)| {
                let hex = match state {
                    HasherState::Sha256(h) => hex::encode(h.finalize()),
                    HasherState::Sha512(h) => hex::encode(h.finalize()),
                    HasherState::Blake3(h) => h.finalize().to_hex().to_string(),
                };
                (alg, hex)
            })
            .collect();
        DigestSet::new(entries)
    }
}

/// Digest in-memory content.
pub fn digest_bytes(algorithms: &[Algorithm], data: &[u8]) -> CaskResult<DigestSet> {
    let mut hasher = MultiHasher::new(algorithms);
    hasher.update(data);
    hasher.finish()
}

/// Digest a blocking reader, optionally teeing every chunk into `sink`.
///
/// Returns the digest set and the number of bytes read.
pub fn digest_reader<R: Read>(
    algorithms: &[Algorithm],
    reader: R,
    mut sink: Option<&mut dyn Write>,
) -> CaskResult<(DigestSet, u64)> {
    let mut reader = BufReader::with_capacity(READ_BUFFER, reader);
    let mut hasher = MultiHasher::new(algorithms);
    let mut buffer = vec![0u8; CHUNK_SIZE];

    loop {
        let bytes_read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        hasher.update(&buffer[..bytes_read]);
        if let Some(sink) = sink.as_mut() {
            sink.write_all(&buffer[..bytes_read])?;
        }
    }

    if let Some(sink) = sink.as_mut() {
        sink.flush()?;
    }
    let bytes = hasher.bytes();
    Ok((hasher.finish()?, bytes))
}

/// Digest an async stream while copying it into `sink`.
pub async fn digest_stream_to<R, W>(
    algorithms: &[Algorithm],
    mut reader: R,
    sink: &mut W,
) -> CaskResult<(DigestSet, u64)>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut hasher = MultiHasher::new(algorithms);
    let mut buffer = vec![0u8; CHUNK_SIZE];

    loop {
        let bytes_read = reader.read(&mut buffer).await?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
        sink.write_all(&buffer[..bytes_read]).await?;
    }

    sink.flush().await?;
    let bytes = hasher.bytes();
    Ok((hasher.finish()?, bytes))
}
