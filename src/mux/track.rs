use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;

use super::boxes::{find_child, find_path, BoxHeader, ByteReader, FourCc};
use super::codec::codec_string;
use super::error::{MuxError, Result};

/// Media kind of a track, from its `hdlr` handler type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
    /// Subtitles, timed metadata, hint tracks; never segmented
    Other,
}

impl TrackKind {
    pub fn from_handler(handler: [u8; 4]) -> Self {
        match &handler {
            b"vide" => Self::Video,
            b"soun" => Self::Audio,
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Other => "other",
        }
    }
}

/// Immutable description of a segmented track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackDescriptor {
    /// Track ID from the movie header
    pub id: u32,

    pub kind: TrackKind,

    /// RFC 6381 codec string (e.g. "avc1.64001f")
    pub codec: String,

    /// Media timescale in ticks per second
    pub timescale: u32,

    /// MIME type for a Media Source buffer, e.g. `video/mp4; codecs="avc1.64001f"`
    pub mime_type: String,
}

impl TrackDescriptor {
    pub fn new(id: u32, kind: TrackKind, codec: impl Into<String>, timescale: u32) -> Self {
        let codec = codec.into();
        let mime_type = format!("{}/mp4; codecs=\"{}\"", kind.as_str(), codec);
        Self {
            id,
            kind,
            codec,
            timescale,
            mime_type,
        }
    }
}

/// Whether a segment initialises a track or carries media samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentKind {
    /// `ftyp` + single-track `moov`
    Init,
    /// `moof` + `mdat`
    Media,
}

/// An independently appendable fragment of the re-muxed stream.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Dense per-session sequence number, starting at 0
    pub sequence: u64,

    pub track_id: u32,

    pub track: Arc<TrackDescriptor>,

    pub kind: SegmentKind,

    pub payload: Bytes,
}

/// A `trak` box together with what the segmenter learned from it.
#[derive(Debug, Clone)]
pub(crate) struct ParsedTrack {
    pub id: u32,
    pub kind: TrackKind,
    pub timescale: u32,
    pub codec: String,
    /// The raw `trak` box, copied into the track's init segment
    pub trak: Bytes,
}

/// Parse the identity, kind, timescale and codec of a `trak` box.
pub(crate) fn parse_trak(trak: Bytes) -> Result<ParsedTrack> {
    let header = BoxHeader::parse(&trak)?.ok_or_else(|| MuxError::malformed("truncated trak"))?;
    let payload = &trak[header.header_size..];

    let tkhd = find_child(payload, FourCc::TKHD)?
        .ok_or_else(|| MuxError::malformed("trak without tkhd"))?;
    let mut reader = ByteReader::new(tkhd.payload);
    let (version, _) = reader.version_and_flags()?;
    // creation and modification times
    reader.skip(if version == 1 { 16 } else { 8 })?;
    let id = reader.u32()?;

    let mdhd = find_path(payload, &[FourCc::MDIA, FourCc::MDHD])?
        .ok_or_else(|| MuxError::malformed(format!("track {id} without mdhd")))?;
    let mut reader = ByteReader::new(mdhd.payload);
    let (version, _) = reader.version_and_flags()?;
    reader.skip(if version == 1 { 16 } else { 8 })?;
    let timescale = reader.u32()?;

    let hdlr = find_path(payload, &[FourCc::MDIA, FourCc::HDLR])?
        .ok_or_else(|| MuxError::malformed(format!("track {id} without hdlr")))?;
    let mut reader = ByteReader::new(hdlr.payload);
    reader.version_and_flags()?;
    reader.skip(4)?; // pre_defined
    let handler = reader.bytes(4)?;
    let kind = TrackKind::from_handler([handler[0], handler[1], handler[2], handler[3]]);

    let codec = if kind == TrackKind::Other {
        String::new()
    } else {
        let stsd = find_path(
            payload,
            &[FourCc::MDIA, FourCc::MINF, FourCc::STBL, FourCc::STSD],
        )?
        .ok_or_else(|| MuxError::malformed(format!("track {id} without stsd")))?;
        codec_string(stsd.payload)?
    };

    Ok(ParsedTrack {
        id,
        kind,
        timescale,
        codec,
        trak,
    })
}
