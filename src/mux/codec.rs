//! RFC 6381 codec strings derived from sample descriptions.

use super::boxes::{children, ByteReader, FourCc};
use super::error::{MuxError, Result};

/// Size of the fields preceding child boxes in a visual sample entry.
const VISUAL_SAMPLE_ENTRY_SIZE: usize = 78;

/// Size of the fields preceding child boxes in a version 0 audio sample entry.
const AUDIO_SAMPLE_ENTRY_SIZE: usize = 28;

/// Derive the codec string of the first sample entry in an `stsd` payload.
///
/// Falls back to the sample entry's four-character code when the codec
/// has no richer representation (e.g. `Opus`, `fLaC`).
pub fn codec_string(stsd_payload: &[u8]) -> Result<String> {
    let mut reader = ByteReader::new(stsd_payload);
    reader.version_and_flags()?;
    let entry_count = reader.u32()?;
    if entry_count == 0 {
        return Err(MuxError::malformed("stsd has no sample entries"));
    }

    let entry = children(reader.rest())
        .next()
        .ok_or_else(|| MuxError::malformed("stsd has no sample entries"))??;

    let fourcc = entry.fourcc;
    let codec = match &fourcc.0 {
        b"avc1" | b"avc2" | b"avc3" | b"avc4" => {
            let config = visual_config(entry.payload, b"avcC")?;
            config.map(|c| avc_codec(fourcc, c)).transpose()?
        }
        b"hvc1" | b"hev1" => {
            let config = visual_config(entry.payload, b"hvcC")?;
            config.map(|c| hevc_codec(fourcc, c)).transpose()?
        }
        b"mp4a" => {
            let esds = audio_config(entry.payload, b"esds")?;
            esds.map(aac_codec).transpose()?
        }
        _ => None,
    };

    Ok(codec.unwrap_or_else(|| fourcc.as_str().to_string()))
}

fn visual_config<'a>(entry: &'a [u8], kind: &[u8; 4]) -> Result<Option<&'a [u8]>> {
    if entry.len() < VISUAL_SAMPLE_ENTRY_SIZE {
        return Err(MuxError::malformed("truncated visual sample entry"));
    }
    config_box(&entry[VISUAL_SAMPLE_ENTRY_SIZE..], kind)
}

fn audio_config<'a>(entry: &'a [u8], kind: &[u8; 4]) -> Result<Option<&'a [u8]>> {
    if entry.len() < AUDIO_SAMPLE_ENTRY_SIZE {
        return Err(MuxError::malformed("truncated audio sample entry"));
    }
    // QuickTime sound description versions 1 and 2 carry extra fields
    let version = u16::from_be_bytes([entry[8], entry[9]]);
    let skip = match version {
        1 => AUDIO_SAMPLE_ENTRY_SIZE + 16,
        2 => AUDIO_SAMPLE_ENTRY_SIZE + 36,
        _ => AUDIO_SAMPLE_ENTRY_SIZE,
    };
    if entry.len() < skip {
        return Err(MuxError::malformed("truncated audio sample entry"));
    }
    config_box(&entry[skip..], kind)
}

fn config_box<'a>(boxes: &'a [u8], kind: &[u8; 4]) -> Result<Option<&'a [u8]>> {
    for child in children(boxes) {
        let child = child?;
        if &child.fourcc.0 == kind {
            return Ok(Some(child.payload));
        }
    }
    Ok(None)
}

/// `avc1.PPCCLL` from an `avcC` record.
fn avc_codec(fourcc: FourCc, avcc: &[u8]) -> Result<String> {
    let mut reader = ByteReader::new(avcc);
    let _version = reader.u8()?;
    let profile = reader.u8()?;
    let compatibility = reader.u8()?;
    let level = reader.u8()?;
    Ok(format!("{fourcc}.{profile:02x}{compatibility:02x}{level:02x}"))
}

/// `hvc1.<space><profile>.<compat>.<tier><level>[.<constraints>]` from an `hvcC` record.
fn hevc_codec(fourcc: FourCc, hvcc: &[u8]) -> Result<String> {
    let mut reader = ByteReader::new(hvcc);
    let _version = reader.u8()?;
    let byte = reader.u8()?;
    let profile_space = match byte >> 6 {
        1 => "A",
        2 => "B",
        3 => "C",
        _ => "",
    };
    let tier = if byte & 0x20 != 0 { 'H' } else { 'L' };
    let profile_idc = byte & 0x1F;
    let compatibility = reader.u32()?.reverse_bits();
    let constraints = reader.bytes(6)?;
    let level = reader.u8()?;

    let mut codec = format!("{fourcc}.{profile_space}{profile_idc}.{compatibility:x}.{tier}{level}");
    let used = constraints
        .iter()
        .rposition(|b| *b != 0)
        .map_or(0, |last| last + 1);
    for b in &constraints[..used] {
        codec.push_str(&format!(".{b:x}"));
    }
    Ok(codec)
}

/// `mp4a.<oti>.<aot>` from an `esds` box.
fn aac_codec(esds: &[u8]) -> Result<String> {
    let mut reader = ByteReader::new(esds);
    reader.version_and_flags()?;

    // ES_Descriptor
    expect_descriptor(&mut reader, 0x03)?;
    reader.skip(2)?; // ES_ID
    let flags = reader.u8()?;
    if flags & 0x80 != 0 {
        reader.skip(2)?;
    }
    if flags & 0x40 != 0 {
        let url_len = reader.u8()? as usize;
        reader.skip(url_len)?;
    }
    if flags & 0x20 != 0 {
        reader.skip(2)?;
    }

    // DecoderConfigDescriptor
    expect_descriptor(&mut reader, 0x04)?;
    let object_type = reader.u8()?;
    reader.skip(12)?;

    // DecoderSpecificInfo is optional
    if reader.remaining() == 0 || reader.u8()? != 0x05 {
        return Ok(format!("mp4a.{object_type:02x}"));
    }
    descriptor_length(&mut reader)?;
    let first = reader.u8()?;
    let mut audio_object_type = first >> 3;
    if audio_object_type == 31 {
        let second = reader.u8()?;
        audio_object_type = 32 + (((first & 0x07) << 3) | (second >> 5));
    }
    Ok(format!("mp4a.{object_type:02x}.{audio_object_type}"))
}

fn expect_descriptor(reader: &mut ByteReader<'_>, tag: u8) -> Result<usize> {
    let found = reader.u8()?;
    if found != tag {
        return Err(MuxError::malformed(format!(
            "expected esds descriptor tag {tag:#04x}, found {found:#04x}"
        )));
    }
    descriptor_length(reader)
}

/// Expandable descriptor length: up to four bytes, 7 bits each.
fn descriptor_length(reader: &mut ByteReader<'_>) -> Result<usize> {
    let mut length = 0usize;
    for _ in 0..4 {
        let b = reader.u8()?;
        length = (length << 7) | (b & 0x7F) as usize;
        if b & 0x80 == 0 {
            break;
        }
    }
    Ok(length)
}
