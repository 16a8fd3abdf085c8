//! Decoder for the virtual live `RLA` stream format.
//!
//! A stream is a sequence of `(u64 ticks, u32 len, [u8; len])` frames, each
//! holding an `RTVL` envelope around a payload around a mask-driven record.

mod envelope;
mod streaming;
pub mod types;

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use byteorder::{LE, ReadBytesExt};
use serde_derive::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::utils::par_fold_reduce;

pub use envelope::{Envelope, decode_envelope, decode_payload, encode_envelope, unpack};
pub use streaming::{FLOAT_SENTINEL, StreamingReader, decode_streaming};
pub use types::{Record, RecordData, RecordType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RlaVersion(pub u8, pub u8);

impl RlaVersion {
    pub const KNOWN: [RlaVersion; 7] = [
        RlaVersion(1, 0),
        RlaVersion(1, 1),
        RlaVersion(1, 2),
        RlaVersion(1, 3),
        RlaVersion(1, 4),
        RlaVersion(1, 5),
        RlaVersion(1, 6),
    ];

    pub fn is_known(self) -> bool {
        RlaVersion::KNOWN.contains(&self)
    }

    pub fn check(self) -> Result<Self> {
        match self.is_known() {
            true => Ok(self),
            false => Err(Error::UnknownVersion(self.0, self.1)),
        }
    }

    /// Parses `major.minor`, as found in archive headers.
    pub fn parse(text: &str) -> Result<Self> {
        let invalid = || Error::invalid(format!("invalid RLA version '{text}'"));
        let (major, minor) = text.trim().split_once('.').ok_or_else(invalid)?;
        Ok(RlaVersion(
            major.parse().map_err(|_| invalid())?,
            minor.parse().map_err(|_| invalid())?,
        ))
    }
}

impl std::fmt::Display for RlaVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.0, self.1)
    }
}

/// Records of one tick, grouped by type.
pub type FrameRecords = BTreeMap<RecordType, Vec<Record>>;
/// Decoded stream, ordered by ascending tick.
pub type RlaFrames = BTreeMap<u64, FrameRecords>;

/// Decodes one frame buffer through envelope, payload and record decoding.
pub fn decode_frame(buffer: &[u8], version: RlaVersion, strict: bool) -> Result<Record> {
    let (signature, data) = unpack(buffer)?;
    decode_streaming(version, signature, &data, strict)
}

/// Splits a stream into `(ticks, buffer)` frames.
///
/// Stops at a zero tick, at the end of the input, or at a frame cut short by
/// the end of the input.
pub fn split_frames(mut src: impl Read) -> Result<Vec<(u64, Vec<u8>)>> {
    let mut frames = Vec::new();
    loop {
        let ticks = match src.read_u64::<LE>() {
            Ok(0) => break,
            Ok(ticks) => ticks,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                tracing::debug!("stream ended without terminator after {} frames", frames.len());
                break;
            }
            Err(e) => return Err(e.into()),
        };
        let frame = src.read_u32::<LE>().and_then(|len| {
            let mut buffer = Vec::new();
            src.by_ref().take(u64::from(len)).read_to_end(&mut buffer)?;
            if buffer.len() != len as usize {
                return Err(ErrorKind::UnexpectedEof.into());
            }
            Ok(buffer)
        });
        match frame {
            Ok(buffer) => frames.push((ticks, buffer)),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                tracing::warn!("frame at tick {ticks} is truncated, stopping");
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(frames)
}

fn warn_unknown_version(version: RlaVersion) {
    if let Err(e) = version.check() {
        tracing::warn!("{e}, decoding on a best-effort basis");
    }
}

fn insert_frame(frames: &mut RlaFrames, ticks: u64, buffer: &[u8], version: RlaVersion, strict: bool) {
    match decode_frame(buffer, version, strict) {
        Ok(record) => frames
            .entry(ticks)
            .or_default()
            .entry(record.record_type())
            .or_default()
            .push(record),
        Err(e) => tracing::warn!("skipping frame at tick {ticks}: {e}"),
    }
}

/// Reads a whole stream. Frames that fail to decode are logged and skipped.
pub fn read_rla(src: impl Read, version: RlaVersion, strict: bool) -> Result<RlaFrames> {
    warn_unknown_version(version);
    let mut frames = RlaFrames::new();
    for (ticks, buffer) in split_frames(src)? {
        insert_frame(&mut frames, ticks, &buffer, version, strict);
    }
    Ok(frames)
}

/// Same output as [`read_rla`], with frames decoded on the rayon pool.
pub fn read_rla_par(src: impl Read, version: RlaVersion, strict: bool) -> Result<RlaFrames> {
    warn_unknown_version(version);
    let split = split_frames(src)?;
    let frames = par_fold_reduce(split, |acc: &mut RlaFrames, (ticks, buffer)| {
        insert_frame(acc, ticks, &buffer, version, strict);
        Ok::<_, Error>(())
    })?;
    Ok(frames)
}

/// Memory-maps and reads a single segment file.
pub fn read_rla_file(path: &Path, version: RlaVersion, strict: bool) -> anyhow::Result<RlaFrames> {
    let file = File::open(path).with_context(|| format!("could not open {}", path.display()))?;
    let data = unsafe { memmap2::Mmap::map(&file)? };
    let frames = read_rla_par(data.as_ref(), version, strict)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(frames)
}

/// The `.rlh` JSON header describing an archive split into `.rla` segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RlaHeader {
    pub version: String,
    #[serde(default)]
    pub base_ticks: u64,
    #[serde(default)]
    pub split_seconds: u32,
    #[serde(default)]
    pub split_file_ids: Vec<u32>,
}

impl RlaHeader {
    pub fn from_reader(reader: impl Read) -> anyhow::Result<Self> {
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn version(&self) -> Result<RlaVersion> {
        RlaVersion::parse(&self.version)
    }

    /// Segment file names for an archive whose header is `<stem>.rlh`.
    pub fn segment_names(&self, stem: &str) -> Vec<String> {
        self.split_file_ids
            .iter()
            .map(|id| format!("{stem}-{id}.rla"))
            .collect()
    }
}

/// An `.rlh` header together with the directory holding its segments.
pub struct RlaArchive {
    pub header: RlaHeader,
    dir: PathBuf,
    stem: String,
}

impl RlaArchive {
    pub fn open(header_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let header_path = header_path.as_ref();
        let reader = BufReader::new(
            File::open(header_path)
                .with_context(|| format!("could not open {}", header_path.display()))?,
        );
        let header = RlaHeader::from_reader(reader)
            .with_context(|| format!("malformed RLA header {}", header_path.display()))?;
        let stem = header_path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .context("RLA header path has no file stem")?
            .to_owned();
        let dir = header_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(RlaArchive { header, dir, stem })
    }

    pub fn segment_paths(&self) -> Vec<PathBuf> {
        self.header
            .segment_names(&self.stem)
            .into_iter()
            .map(|name| self.dir.join(name))
            .collect()
    }

    /// Reads every segment and merges their frames.
    pub fn read_all(&self, strict: bool) -> anyhow::Result<RlaFrames> {
        let version = self.header.version()?;
        let mut frames = RlaFrames::new();
        for path in self.segment_paths() {
            let segment = read_rla_file(&path, version, strict)?;
            crate::utils::Merge::merge(&mut frames, segment);
        }
        Ok(frames)
    }
}
