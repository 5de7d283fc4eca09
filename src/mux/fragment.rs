//! Movie fragment (`moof` + `mdat`) demuxing and re-muxing.

use super::boxes::{begin_box, children, end_box, put_version_and_flags, ByteReader, FourCc};
use super::error::{MuxError, Result};
use bytes::{BufMut, Bytes, BytesMut};

// tfhd flags
const TFHD_BASE_DATA_OFFSET: u32 = 0x000001;
const TFHD_SAMPLE_DESCRIPTION_INDEX: u32 = 0x000002;
const TFHD_DEFAULT_DURATION: u32 = 0x000008;
const TFHD_DEFAULT_SIZE: u32 = 0x000010;
const TFHD_DEFAULT_FLAGS: u32 = 0x000020;
const TFHD_DEFAULT_BASE_IS_MOOF: u32 = 0x020000;

// trun flags
const TRUN_DATA_OFFSET: u32 = 0x000001;
const TRUN_FIRST_SAMPLE_FLAGS: u32 = 0x000004;
const TRUN_DURATION: u32 = 0x000100;
const TRUN_SIZE: u32 = 0x000200;
const TRUN_FLAGS: u32 = 0x000400;
const TRUN_COMPOSITION_OFFSET: u32 = 0x000800;

/// `sample_is_non_sync_sample` bit of the sample flags.
const SAMPLE_NON_SYNC: u32 = 0x0001_0000;

/// Upper bound on the sample count of a single `trun`.
const MAX_SAMPLES_PER_RUN: u32 = 1 << 20;

/// Per-track defaults declared by a `trex` box.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackDefaults {
    pub duration: u32,
    pub size: u32,
    pub flags: u32,
}

impl TrackDefaults {
    /// Parse a `trex` payload into its track id and defaults.
    pub fn parse_trex(payload: &[u8]) -> Result<(u32, Self)> {
        let mut reader = ByteReader::new(payload);
        reader.version_and_flags()?;
        let track_id = reader.u32()?;
        let _description_index = reader.u32()?;
        Ok((
            track_id,
            Self {
                duration: reader.u32()?,
                size: reader.u32()?,
                flags: reader.u32()?,
            },
        ))
    }
}

/// One demuxed sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub decode_time: u64,
    pub duration: u32,
    pub flags: u32,
    pub composition_offset: i32,
    pub data: Bytes,
}

impl Sample {
    /// Whether decoding can start at this sample.
    pub fn is_sync(&self) -> bool {
        self.flags & SAMPLE_NON_SYNC == 0
    }
}

/// Samples of one `traf`, in decode order.
#[derive(Debug, Clone)]
pub struct TrackRun {
    pub track_id: u32,
    pub samples: Vec<Sample>,
}

/// Where a fragment's media data lives relative to its `moof`.
#[derive(Debug, Clone)]
pub struct FragmentData {
    /// Stream offset of the first byte of the `moof`.
    pub moof_offset: u64,
    /// Stream offset of the first byte of the `mdat` content.
    pub mdat_offset: u64,
    /// The `mdat` content.
    pub mdat: Bytes,
}

/// Demux a `moof` payload into per-track sample runs.
///
/// `defaults` resolves a track id to the `trex` defaults declared in the
/// movie header.
pub fn demux(
    moof_payload: &[u8],
    data: &FragmentData,
    defaults: impl Fn(u32) -> Option<TrackDefaults>,
) -> Result<Vec<TrackRun>> {
    let mut runs = Vec::new();
    // Offset, relative to the moof, where the previous traf's data ended
    let mut previous_end: Option<u64> = None;

    for child in children(moof_payload) {
        let child = child?;
        if child.fourcc != FourCc::TRAF {
            continue;
        }
        runs.push(demux_traf(child.payload, data, &defaults, &mut previous_end)?);
    }

    Ok(runs)
}

struct TfhdFields {
    track_id: u32,
    base_offset: Option<u64>,
    defaults: TrackDefaults,
    base_is_moof: bool,
}

fn parse_tfhd(payload: &[u8], trex: impl Fn(u32) -> Option<TrackDefaults>) -> Result<TfhdFields> {
    let mut reader = ByteReader::new(payload);
    let (_, flags) = reader.version_and_flags()?;
    let track_id = reader.u32()?;
    let mut defaults = trex(track_id).unwrap_or_default();

    let base_offset = if flags & TFHD_BASE_DATA_OFFSET != 0 {
        Some(reader.u64()?)
    } else {
        None
    };
    if flags & TFHD_SAMPLE_DESCRIPTION_INDEX != 0 {
        reader.skip(4)?;
    }
    if flags & TFHD_DEFAULT_DURATION != 0 {
        defaults.duration = reader.u32()?;
    }
    if flags & TFHD_DEFAULT_SIZE != 0 {
        defaults.size = reader.u32()?;
    }
    if flags & TFHD_DEFAULT_FLAGS != 0 {
        defaults.flags = reader.u32()?;
    }

    Ok(TfhdFields {
        track_id,
        base_offset,
        defaults,
        base_is_moof: flags & TFHD_DEFAULT_BASE_IS_MOOF != 0,
    })
}

fn demux_traf(
    traf: &[u8],
    data: &FragmentData,
    trex: &impl Fn(u32) -> Option<TrackDefaults>,
    previous_end: &mut Option<u64>,
) -> Result<TrackRun> {
    let mut tfhd: Option<TfhdFields> = None;
    let mut decode_time = 0u64;
    let mut runs = Vec::new();

    for child in children(traf) {
        let child = child?;
        match child.fourcc {
            FourCc::TFHD => tfhd = Some(parse_tfhd(child.payload, trex)?),
            FourCc::TFDT => {
                let mut reader = ByteReader::new(child.payload);
                let (version, _) = reader.version_and_flags()?;
                decode_time = if version == 1 {
                    reader.u64()?
                } else {
                    reader.u32()? as u64
                };
            }
            FourCc::TRUN => runs.push(child.payload),
            _ => {}
        }
    }

    let tfhd = tfhd.ok_or_else(|| MuxError::malformed("traf without tfhd"))?;

    // Data offsets below are relative to the first byte of the moof
    let base = match tfhd.base_offset {
        Some(absolute) => absolute.checked_sub(data.moof_offset).ok_or_else(|| {
            MuxError::malformed(format!(
                "tfhd base data offset {absolute} precedes its moof"
            ))
        })?,
        None if tfhd.base_is_moof => 0,
        None => previous_end.unwrap_or(0),
    };
    let mdat_start = data
        .mdat_offset
        .checked_sub(data.moof_offset)
        .ok_or_else(|| MuxError::malformed("mdat precedes its moof"))?;

    let mut samples = Vec::new();
    let mut cursor = base;
    for trun in runs {
        let mut reader = ByteReader::new(trun);
        let (version, flags) = reader.version_and_flags()?;
        let count = reader.u32()?;
        if flags & TRUN_DATA_OFFSET != 0 {
            let offset = reader.i32()? as i64;
            cursor = base
                .checked_add_signed(offset)
                .ok_or_else(|| MuxError::malformed("trun data offset lies outside the stream"))?;
        }
        let first_flags = if flags & TRUN_FIRST_SAMPLE_FLAGS != 0 {
            Some(reader.u32()?)
        } else {
            None
        };
        check_sample_count(count, flags, reader.remaining(), tfhd.defaults.size, data.mdat.len())?;

        for index in 0..count {
            let duration = if flags & TRUN_DURATION != 0 {
                reader.u32()?
            } else {
                tfhd.defaults.duration
            };
            let size = if flags & TRUN_SIZE != 0 {
                reader.u32()?
            } else {
                tfhd.defaults.size
            };
            let sample_flags = if flags & TRUN_FLAGS != 0 {
                reader.u32()?
            } else {
                match first_flags {
                    Some(first) if index == 0 => first,
                    _ => tfhd.defaults.flags,
                }
            };
            let composition_offset = if flags & TRUN_COMPOSITION_OFFSET != 0 {
                if version == 0 {
                    reader.u32()?.min(i32::MAX as u32) as i32
                } else {
                    reader.i32()?
                }
            } else {
                0
            };

            let start = cursor
                .checked_sub(mdat_start)
                .ok_or_else(|| MuxError::malformed("sample data lies outside mdat"))?;
            let end = start
                .checked_add(size as u64)
                .filter(|end| *end <= data.mdat.len() as u64)
                .ok_or_else(|| {
                    MuxError::malformed(format!(
                        "sample of {size} bytes at mdat offset {start} overruns mdat of {} bytes",
                        data.mdat.len()
                    ))
                })?;

            samples.push(Sample {
                decode_time,
                duration,
                flags: sample_flags,
                composition_offset,
                data: data.mdat.slice(start as usize..end as usize),
            });
            decode_time = decode_time.saturating_add(duration as u64);
            cursor = cursor
                .checked_add(size as u64)
                .ok_or_else(|| MuxError::malformed("sample data lies outside the stream"))?;
        }
    }

    *previous_end = Some(cursor);

    Ok(TrackRun {
        track_id: tfhd.track_id,
        samples,
    })
}

/// Reject sample counts the `trun` and `mdat` cannot possibly back.
fn check_sample_count(
    count: u32,
    flags: u32,
    remaining: usize,
    default_size: u32,
    mdat_len: usize,
) -> Result<()> {
    if count > MAX_SAMPLES_PER_RUN {
        return Err(MuxError::malformed(format!(
            "trun declares {count} samples (limit {MAX_SAMPLES_PER_RUN})"
        )));
    }

    let per_sample_fields = [TRUN_DURATION, TRUN_SIZE, TRUN_FLAGS, TRUN_COMPOSITION_OFFSET]
        .iter()
        .filter(|field| flags & **field != 0)
        .count() as u64;
    if count as u64 * per_sample_fields * 4 > remaining as u64 {
        return Err(MuxError::malformed(format!(
            "trun declares {count} samples but carries {remaining} bytes of sample fields"
        )));
    }

    if flags & TRUN_SIZE == 0 && count as u64 * default_size as u64 > mdat_len as u64 {
        return Err(MuxError::malformed(format!(
            "trun declares {count} samples of {default_size} bytes but mdat has {mdat_len}"
        )));
    }
    Ok(())
}

/// Build a self-contained `moof` + `mdat` for one track.
pub fn write_media_segment(sequence_number: u32, track_id: u32, samples: &[Sample]) -> Bytes {
    let data_size: usize = samples.iter().map(|s| s.data.len()).sum();
    let mut buf = BytesMut::with_capacity(128 + samples.len() * 16 + data_size);

    let moof = begin_box(&mut buf, FourCc::MOOF);

    let mfhd = begin_box(&mut buf, FourCc::MFHD);
    put_version_and_flags(&mut buf, 0, 0);
    buf.put_u32(sequence_number);
    end_box(&mut buf, mfhd);

    let traf = begin_box(&mut buf, FourCc::TRAF);

    let tfhd = begin_box(&mut buf, FourCc::TFHD);
    put_version_and_flags(&mut buf, 0, TFHD_DEFAULT_BASE_IS_MOOF);
    buf.put_u32(track_id);
    end_box(&mut buf, tfhd);

    let tfdt = begin_box(&mut buf, FourCc::TFDT);
    put_version_and_flags(&mut buf, 1, 0);
    buf.put_u64(samples.first().map_or(0, |s| s.decode_time));
    end_box(&mut buf, tfdt);

    let trun = begin_box(&mut buf, FourCc::TRUN);
    put_version_and_flags(
        &mut buf,
        1,
        TRUN_DATA_OFFSET | TRUN_DURATION | TRUN_SIZE | TRUN_FLAGS | TRUN_COMPOSITION_OFFSET,
    );
    buf.put_u32(samples.len() as u32);
    let data_offset_pos = buf.len();
    buf.put_u32(0); // placeholder
    for sample in samples {
        buf.put_u32(sample.duration);
        buf.put_u32(sample.data.len() as u32);
        buf.put_u32(sample.flags);
        buf.put_i32(sample.composition_offset);
    }
    end_box(&mut buf, trun);

    end_box(&mut buf, traf);
    end_box(&mut buf, moof);

    // default-base-is-moof: data starts after the moof and the mdat header
    let data_offset = (buf.len() - moof + 8) as u32;
    buf[data_offset_pos..data_offset_pos + 4].copy_from_slice(&data_offset.to_be_bytes());

    buf.put_u32((data_size + 8) as u32);
    buf.put_slice(&FourCc::MDAT.0);
    for sample in samples {
        buf.put_slice(&sample.data);
    }

    buf.freeze()
}
