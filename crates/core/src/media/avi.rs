//! RIFF/AVI indexer.
//!
//! Walks the top-level chunks of an AVI file once at startup and records
//! the byte position of every frame chunk listed in `idx1`. Frame payloads
//! are read later, on demand, straight from those positions.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::{AviErrorKind, Result, ServerError};

const RIFF: [u8; 4] = *b"RIFF";
const AVI: [u8; 4] = *b"AVI ";
const LIST: [u8; 4] = *b"LIST";
const HDRL: [u8; 4] = *b"hdrl";
const STRL: [u8; 4] = *b"strl";
const MOVI: [u8; 4] = *b"movi";
const AVIH: [u8; 4] = *b"avih";
const STRH: [u8; 4] = *b"strh";
const STRF: [u8; 4] = *b"strf";
const IDX1: [u8; 4] = *b"idx1";
const JUNK: [u8; 4] = *b"JUNK";
const PAD: [u8; 4] = *b"PAD ";
const VIDS: [u8; 4] = *b"vids";

/// Size of one `idx1` record: chunk id, flags, offset, length.
const INDEX_RECORD_LEN: u64 = 16;

/// Size of a frame chunk header: chunk id followed by a little-endian length.
pub const FRAME_HEADER_LEN: u64 = 8;

/// Fields of the `avih` main header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MainHeader {
    pub microsec_per_frame: u32,
    pub max_bytes_per_sec: u32,
    pub padding_granularity: u32,
    pub flags: u32,
    pub total_frames: u32,
    pub initial_frames: u32,
    pub streams: u32,
    pub suggested_buffer_size: u32,
    pub width: u32,
    pub height: u32,
}

/// One `strl` entry: the stream header plus, for video streams, the
/// bitmap format that follows it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamInfo {
    pub kind: [u8; 4],
    pub handler: [u8; 4],
    pub scale: u32,
    pub rate: u32,
    pub length: u32,
    pub width: i32,
    pub height: i32,
    pub compression: [u8; 4],
}

impl StreamInfo {
    pub fn is_video(&self) -> bool {
        self.kind == VIDS
    }
}

/// Result of indexing an AVI file.
#[derive(Debug, Clone)]
pub struct AviIndex {
    pub header: MainHeader,
    pub streams: Vec<StreamInfo>,
    /// Position of the `movi` form type inside its LIST chunk.
    pub movi_offset: u64,
    /// Absolute file position of each frame chunk header.
    pub offsets: Vec<u64>,
    /// Playback rate derived from `avih`, always at least 1.
    pub fps: u32,
}

impl AviIndex {
    pub fn total_frames(&self) -> u32 {
        u32::try_from(self.offsets.len()).unwrap_or(u32::MAX)
    }
}

/// Open and index the AVI file at `path`.
pub fn index_file(path: &Path) -> Result<AviIndex> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    parse(&mut reader).map_err(|kind| ServerError::Avi {
        path: path.to_path_buf(),
        kind,
    })
}

/// Index an AVI stream.
///
/// Only the RIFF header itself is strict. Once inside the form, a read
/// error or a malformed chunk ends the walk and whatever was gathered so
/// far is used.
pub fn parse<R: Read + Seek>(reader: &mut R) -> std::result::Result<AviIndex, AviErrorKind> {
    let id = read_fourcc(reader).map_err(|_| AviErrorKind::Truncated)?;
    if id != RIFF {
        return Err(AviErrorKind::NotRiff);
    }
    let riff_size = read_u32_le(reader).map_err(|_| AviErrorKind::Truncated)?;
    let form = read_fourcc(reader).map_err(|_| AviErrorKind::Truncated)?;
    if form != AVI {
        return Err(AviErrorKind::NotAvi);
    }

    // The declared size counts the form type we just consumed.
    let end = 8 + u64::from(riff_size);
    let mut walk = Walk::default();
    loop {
        match walk.step(reader, end) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                tracing::debug!(error = %e, "AVI chunk walk ended early");
                break;
            }
        }
    }

    if walk.offsets.is_empty() {
        return Err(AviErrorKind::MissingIndex);
    }
    let fps = frames_per_second(walk.header.microsec_per_frame)
        .ok_or(AviErrorKind::InvalidFrameRate)?;

    Ok(AviIndex {
        header: walk.header,
        streams: walk.streams,
        movi_offset: walk.movi_offset.unwrap_or(0),
        offsets: walk.offsets,
        fps,
    })
}

/// Convert the `avih` frame interval into whole frames per second,
/// rounding half up. Returns `None` when no positive rate results.
pub fn frames_per_second(microsec_per_frame: u32) -> Option<u32> {
    if microsec_per_frame == 0 {
        return None;
    }
    let exact = 1_000_000f64 / f64::from(microsec_per_frame);
    let whole = exact.trunc();
    let mut fps = whole as u32;
    if exact - whole >= 0.5 {
        fps += 1;
    }
    (fps > 0).then_some(fps)
}

/// Seek to the frame chunk at `offset` and return its declared payload
/// length. The reader is left positioned at the first payload byte.
pub fn read_frame_len<R: Read + Seek>(reader: &mut R, offset: u64) -> io::Result<u64> {
    reader.seek(SeekFrom::Start(offset))?;
    let mut header = [0u8; FRAME_HEADER_LEN as usize];
    reader.read_exact(&mut header)?;
    Ok(u64::from(u32::from_le_bytes([
        header[4], header[5], header[6], header[7],
    ])))
}

#[derive(Default)]
struct Walk {
    header: MainHeader,
    streams: Vec<StreamInfo>,
    movi_offset: Option<u64>,
    offsets: Vec<u64>,
}

impl Walk {
    /// Handle one top-level chunk. Returns `Ok(false)` when the walk is done.
    fn step<R: Read + Seek>(&mut self, reader: &mut R, end: u64) -> io::Result<bool> {
        let pos = reader.stream_position()?;
        if pos >= end {
            return Ok(false);
        }
        let id = read_fourcc(reader)?;
        let size = u64::from(read_u32_le(reader)?);
        let body = pos + 8;
        let next = body + size;

        match id {
            JUNK | PAD => {
                reader.seek(SeekFrom::Start(body + align4(size)))?;
                return Ok(true);
            }
            IDX1 => self.read_index(reader, size)?,
            LIST => match read_fourcc(reader)? {
                HDRL => self.read_hdrl(reader, body + 4, next)?,
                MOVI => self.movi_offset = Some(body),
                _ => {}
            },
            _ if size == 0 => return Ok(false),
            _ => {}
        }

        reader.seek(SeekFrom::Start(next))?;
        Ok(true)
    }

    fn read_hdrl<R: Read + Seek>(&mut self, reader: &mut R, start: u64, end: u64) -> io::Result<()> {
        let mut pos = start;
        while pos + 8 <= end {
            reader.seek(SeekFrom::Start(pos))?;
            let id = read_fourcc(reader)?;
            let size = u64::from(read_u32_le(reader)?);
            let body = pos + 8;
            match id {
                AVIH => self.header = read_main_header(reader)?,
                LIST => {
                    if read_fourcc(reader)? == STRL {
                        self.read_strl(reader, body + 4, body + size)?;
                    }
                }
                _ => {}
            }
            pos = body + align4(size);
        }
        Ok(())
    }

    fn read_strl<R: Read + Seek>(&mut self, reader: &mut R, start: u64, end: u64) -> io::Result<()> {
        let mut stream = StreamInfo::default();
        let mut pos = start;
        while pos + 8 <= end {
            reader.seek(SeekFrom::Start(pos))?;
            let id = read_fourcc(reader)?;
            let size = u64::from(read_u32_le(reader)?);
            match id {
                STRH => read_stream_header(reader, &mut stream)?,
                STRF if stream.is_video() => read_bitmap_format(reader, &mut stream)?,
                _ => {}
            }
            pos += 8 + align4(size);
        }
        tracing::debug!(
            kind = %String::from_utf8_lossy(&stream.kind),
            handler = %String::from_utf8_lossy(&stream.handler),
            width = stream.width,
            height = stream.height,
            "AVI stream"
        );
        self.streams.push(stream);
        Ok(())
    }

    /// Read `idx1` records. When the first record's offset is smaller than a
    /// record, offsets are taken as relative to the `movi` form type;
    /// otherwise they are absolute file positions.
    fn read_index<R: Read>(&mut self, reader: &mut R, size: u64) -> io::Result<()> {
        let count = size / INDEX_RECORD_LEN;
        let movi = self.movi_offset.unwrap_or(0);
        let mut first_relative = None;
        self.offsets = Vec::with_capacity(count.min(1 << 20) as usize);
        let mut record = [0u8; INDEX_RECORD_LEN as usize];
        for _ in 0..count {
            reader.read_exact(&mut record)?;
            let offset = u64::from(u32::from_le_bytes([
                record[8], record[9], record[10], record[11],
            ]));
            let relative = *first_relative.get_or_insert(offset < INDEX_RECORD_LEN);
            self.offsets.push(if relative { offset + movi } else { offset });
        }
        Ok(())
    }
}

fn read_main_header<R: Read>(reader: &mut R) -> io::Result<MainHeader> {
    Ok(MainHeader {
        microsec_per_frame: read_u32_le(reader)?,
        max_bytes_per_sec: read_u32_le(reader)?,
        padding_granularity: read_u32_le(reader)?,
        flags: read_u32_le(reader)?,
        total_frames: read_u32_le(reader)?,
        initial_frames: read_u32_le(reader)?,
        streams: read_u32_le(reader)?,
        suggested_buffer_size: read_u32_le(reader)?,
        width: read_u32_le(reader)?,
        height: read_u32_le(reader)?,
    })
}

fn read_stream_header<R: Read>(reader: &mut R, stream: &mut StreamInfo) -> io::Result<()> {
    stream.kind = read_fourcc(reader)?;
    stream.handler = read_fourcc(reader)?;
    let _flags = read_u32_le(reader)?;
    let _priority_language = read_u32_le(reader)?;
    let _initial_frames = read_u32_le(reader)?;
    stream.scale = read_u32_le(reader)?;
    stream.rate = read_u32_le(reader)?;
    let _start = read_u32_le(reader)?;
    stream.length = read_u32_le(reader)?;
    Ok(())
}

fn read_bitmap_format<R: Read>(reader: &mut R, stream: &mut StreamInfo) -> io::Result<()> {
    let _header_size = read_u32_le(reader)?;
    stream.width = read_u32_le(reader)? as i32;
    stream.height = read_u32_le(reader)? as i32;
    let _planes_bit_count = read_u32_le(reader)?;
    stream.compression = read_fourcc(reader)?;
    Ok(())
}

fn align4(size: u64) -> u64 {
    (size + 3) & !3
}

fn read_fourcc<R: Read>(reader: &mut R) -> io::Result<[u8; 4]> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_u32_le<R: Read>(reader: &mut R) -> io::Result<u32> {
    Ok(u32::from_le_bytes(read_fourcc(reader)?))
}
