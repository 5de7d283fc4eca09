//! ISO-BMFF box framing.
//!
//! Every box is a 4-byte big-endian size, a 4-byte type, then content.
//! A size of 1 means a 64-bit size follows the type.

use super::error::{MuxError, Result};
use bytes::{BufMut, BytesMut};

/// Four-character box type code.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    pub const FTYP: Self = Self(*b"ftyp");
    pub const MOOV: Self = Self(*b"moov");
    pub const MVHD: Self = Self(*b"mvhd");
    pub const MVEX: Self = Self(*b"mvex");
    pub const MEHD: Self = Self(*b"mehd");
    pub const TREX: Self = Self(*b"trex");
    pub const TRAK: Self = Self(*b"trak");
    pub const TKHD: Self = Self(*b"tkhd");
    pub const MDIA: Self = Self(*b"mdia");
    pub const MDHD: Self = Self(*b"mdhd");
    pub const HDLR: Self = Self(*b"hdlr");
    pub const MINF: Self = Self(*b"minf");
    pub const STBL: Self = Self(*b"stbl");
    pub const STSD: Self = Self(*b"stsd");
    pub const MOOF: Self = Self(*b"moof");
    pub const MFHD: Self = Self(*b"mfhd");
    pub const TRAF: Self = Self(*b"traf");
    pub const TFHD: Self = Self(*b"tfhd");
    pub const TFDT: Self = Self(*b"tfdt");
    pub const TRUN: Self = Self(*b"trun");
    pub const MDAT: Self = Self(*b"mdat");

    /// Get the 4-char code as a string.
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("????")
    }
}

impl std::fmt::Display for FourCc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::fmt::Debug for FourCc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FourCc({})", self.as_str())
    }
}

/// Parsed box header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxHeader {
    pub fourcc: FourCc,
    /// Box size including the header.
    pub size: u64,
    /// 8, or 16 for 64-bit sizes.
    pub header_size: usize,
}

impl BoxHeader {
    /// Parse a top-level header from the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold a full header. A
    /// size of 0 ("extends to end of file") has no meaning on a live
    /// stream and is rejected.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>> {
        Self::parse_within(buf, None)
    }

    /// Parse a header of a child box whose parent holds `parent_len`
    /// remaining bytes. Size 0 extends to the end of the parent.
    fn parse_within(buf: &[u8], parent_len: Option<u64>) -> Result<Option<Self>> {
        if buf.len() < 8 {
            return Ok(None);
        }

        let size = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as u64;
        let fourcc = FourCc([buf[4], buf[5], buf[6], buf[7]]);

        let (size, header_size) = match size {
            1 => {
                if buf.len() < 16 {
                    return Ok(None);
                }
                let mut ext = [0u8; 8];
                ext.copy_from_slice(&buf[8..16]);
                (u64::from_be_bytes(ext), 16)
            }
            0 => match parent_len {
                Some(len) => (len, 8),
                None => {
                    return Err(MuxError::malformed(format!(
                        "box {fourcc} extends to end of stream"
                    )))
                }
            },
            n => (n, 8),
        };

        if size < header_size as u64 {
            return Err(MuxError::malformed(format!(
                "box {fourcc} declares size {size} smaller than its header"
            )));
        }

        Ok(Some(Self {
            fourcc,
            size,
            header_size,
        }))
    }
}

/// A complete box borrowed from a parent buffer.
#[derive(Debug, Clone, Copy)]
pub struct BoxRef<'a> {
    pub fourcc: FourCc,
    /// The whole box including its header.
    pub bytes: &'a [u8],
    /// Box content after the header.
    pub payload: &'a [u8],
}

/// Iterate over the child boxes packed in `payload`.
pub fn children(payload: &[u8]) -> Children<'_> {
    Children {
        rest: payload,
        failed: false,
    }
}

/// Find the first child box of the given type.
pub fn find_child(payload: &[u8], fourcc: FourCc) -> Result<Option<BoxRef<'_>>> {
    for child in children(payload) {
        let child = child?;
        if child.fourcc == fourcc {
            return Ok(Some(child));
        }
    }
    Ok(None)
}

/// Walk a path of nested container boxes, e.g. `mdia/minf/stbl`.
pub fn find_path<'a>(payload: &'a [u8], path: &[FourCc]) -> Result<Option<BoxRef<'a>>> {
    let mut current: Option<BoxRef<'a>> = None;
    let mut scope = payload;
    for fourcc in path {
        match find_child(scope, *fourcc)? {
            Some(child) => {
                scope = child.payload;
                current = Some(child);
            }
            None => return Ok(None),
        }
    }
    Ok(current)
}

/// Iterator returned by [`children`].
pub struct Children<'a> {
    rest: &'a [u8],
    failed: bool,
}

impl<'a> Iterator for Children<'a> {
    type Item = Result<BoxRef<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.rest.is_empty() {
            return None;
        }

        let header = match BoxHeader::parse_within(self.rest, Some(self.rest.len() as u64)) {
            Ok(Some(header)) if header.size <= self.rest.len() as u64 => header,
            Ok(_) => {
                self.failed = true;
                return Some(Err(MuxError::malformed("truncated child box")));
            }
            Err(e) => {
                self.failed = true;
                return Some(Err(e));
            }
        };

        let (bytes, rest) = self.rest.split_at(header.size as usize);
        self.rest = rest;
        Some(Ok(BoxRef {
            fourcc: header.fourcc,
            bytes,
            payload: &bytes[header.header_size..],
        }))
    }
}

/// Bounds-checked big-endian reader over box content.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos.min(self.buf.len())..]
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(MuxError::malformed(format!(
                "need {n} bytes at position {}, have {}",
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.bytes(n).map(|_| ())
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn i32(&mut self) -> Result<i32> {
        Ok(self.u32()? as i32)
    }

    pub fn u64(&mut self) -> Result<u64> {
        let b = self.bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_be_bytes(raw))
    }

    /// Read a full-box version byte and 24-bit flags.
    pub fn version_and_flags(&mut self) -> Result<(u8, u32)> {
        let raw = self.u32()?;
        Ok(((raw >> 24) as u8, raw & 0x00FF_FFFF))
    }
}

/// Open a box in `buf` with a placeholder size; returns its start offset.
pub(crate) fn begin_box(buf: &mut BytesMut, fourcc: FourCc) -> usize {
    let start = buf.len();
    buf.put_u32(0); // placeholder
    buf.put_slice(&fourcc.0);
    start
}

/// Patch the size of a box opened with [`begin_box`].
pub(crate) fn end_box(buf: &mut BytesMut, start: usize) {
    let size = (buf.len() - start) as u32;
    buf[start..start + 4].copy_from_slice(&size.to_be_bytes());
}

/// Write a full box header (version + flags).
pub(crate) fn put_version_and_flags(buf: &mut BytesMut, version: u8, flags: u32) {
    buf.put_u32(((version as u32) << 24) | (flags & 0x00FF_FFFF));
}
