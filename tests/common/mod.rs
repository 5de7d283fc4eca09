// Shared fixtures: a synthetic fragmented MP4 stream shaped like the
// transcoder's output (empty moov, then moof/mdat pairs holding every track).
#![allow(dead_code)]

use std::path::{Path, PathBuf};

pub const VIDEO_TRACK: u32 = 1;
pub const AUDIO_TRACK: u32 = 2;
/// Timed metadata track the segmenter must drop
pub const META_TRACK: u32 = 3;

pub const VIDEO_SAMPLES_PER_FRAGMENT: usize = 3;
pub const AUDIO_SAMPLES_PER_FRAGMENT: usize = 4;
pub const MEDIA_SEGMENTS_PER_FRAGMENT: usize =
    VIDEO_SAMPLES_PER_FRAGMENT + AUDIO_SAMPLES_PER_FRAGMENT;

pub const VIDEO_CODEC: &str = "avc1.64001f";
pub const AUDIO_CODEC: &str = "mp4a.40.2";

const SYNC: u32 = 0x0200_0000;
const NON_SYNC: u32 = 0x0101_0000;

fn mp4_box(fourcc: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
    out.extend_from_slice(fourcc);
    out.extend_from_slice(payload);
    out
}

fn full_box(fourcc: &[u8; 4], version: u8, flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut content = (((version as u32) << 24) | flags).to_be_bytes().to_vec();
    content.extend_from_slice(payload);
    mp4_box(fourcc, &content)
}

fn concat(parts: &[Vec<u8>]) -> Vec<u8> {
    parts.concat()
}

fn u32s(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_be_bytes()).collect()
}

fn avc1_entry() -> Vec<u8> {
    let mut entry = vec![0u8; 78];
    entry[7] = 1; // data reference index
    let avcc = mp4_box(b"avcC", &[0x01, 0x64, 0x00, 0x1F, 0xFF, 0xE0, 0x00]);
    entry.extend_from_slice(&avcc);
    mp4_box(b"avc1", &entry)
}

fn mp4a_entry() -> Vec<u8> {
    let mut entry = vec![0u8; 28];
    entry[7] = 1;
    let esds = full_box(
        b"esds",
        0,
        0,
        &[
            0x03, 0x19, 0x00, 0x02, 0x00, // ES_Descriptor
            0x04, 0x11, 0x40, 0x15, 0x00, 0x00, 0x00, 0x00, 0x01, 0xF4, 0x00, 0x00, 0x01, 0xF4,
            0x00, // DecoderConfigDescriptor
            0x05, 0x02, 0x12, 0x10, // AudioSpecificConfig: AAC-LC
        ],
    );
    entry.extend_from_slice(&esds);
    mp4_box(b"mp4a", &entry)
}

fn trak(track_id: u32, handler: &[u8; 4], timescale: u32, entry: Vec<u8>) -> Vec<u8> {
    let mut tkhd = u32s(&[0, 0, track_id, 0, 0]);
    tkhd.extend_from_slice(&[0u8; 60]);
    let tkhd = full_box(b"tkhd", 0, 3, &tkhd);

    let mut mdhd = u32s(&[0, 0, timescale, 0]);
    mdhd.extend_from_slice(&[0x55, 0xC4, 0, 0]);
    let mdhd = full_box(b"mdhd", 0, 0, &mdhd);

    let mut hdlr = vec![0u8; 4];
    hdlr.extend_from_slice(handler);
    hdlr.extend_from_slice(&[0u8; 13]);
    let hdlr = full_box(b"hdlr", 0, 0, &hdlr);

    let mut stsd = u32s(&[1]);
    stsd.extend_from_slice(&entry);
    let stsd = full_box(b"stsd", 0, 0, &stsd);
    let stbl = mp4_box(b"stbl", &stsd);
    let minf = mp4_box(b"minf", &stbl);

    let mdia = mp4_box(b"mdia", &concat(&[mdhd, hdlr, minf]));
    mp4_box(b"trak", &concat(&[tkhd, mdia]))
}

fn trex(track_id: u32, default_duration: u32) -> Vec<u8> {
    full_box(b"trex", 0, 0, &u32s(&[track_id, 1, default_duration, 0, 0]))
}

/// `ftyp` + `moov` with a video, an audio and a metadata track.
pub fn init_section() -> Vec<u8> {
    let mut ftyp = b"isom".to_vec();
    ftyp.extend_from_slice(&0x200u32.to_be_bytes());
    ftyp.extend_from_slice(b"isomiso6iso2avc1mp41");
    let ftyp = mp4_box(b"ftyp", &ftyp);

    let mvhd = full_box(b"mvhd", 0, 0, &[0u8; 96]);
    let meta_entry = mp4_box(b"mett", &[0u8; 8]);
    let mvex = mp4_box(
        b"mvex",
        &concat(&[
            trex(VIDEO_TRACK, 3000),
            trex(AUDIO_TRACK, 1024),
            trex(META_TRACK, 1000),
        ]),
    );

    let moov = mp4_box(
        b"moov",
        &concat(&[
            mvhd,
            trak(VIDEO_TRACK, b"vide", 90000, avc1_entry()),
            trak(AUDIO_TRACK, b"soun", 48000, mp4a_entry()),
            trak(META_TRACK, b"meta", 1000, meta_entry),
            mvex,
        ]),
    );

    concat(&[ftyp, moov])
}

pub fn video_sample(fragment: u32, index: usize) -> Vec<u8> {
    vec![0x10 + index as u8; 100 + fragment as usize * 10 + index]
}

pub fn audio_sample(fragment: u32, index: usize) -> Vec<u8> {
    vec![0x40 + index as u8; 20 + fragment as usize]
}

struct Run {
    track_id: u32,
    decode_time: u64,
    /// (duration, flags, data)
    samples: Vec<(u32, u32, Vec<u8>)>,
}

fn traf(run: &Run, data_offset: u32) -> Vec<u8> {
    let tfhd = full_box(b"tfhd", 0, 0x020000, &u32s(&[run.track_id]));
    let tfdt = full_box(b"tfdt", 1, 0, &run.decode_time.to_be_bytes());

    // data offset, duration, size, flags
    let mut trun = u32s(&[run.samples.len() as u32, data_offset]);
    for (duration, flags, data) in &run.samples {
        trun.extend_from_slice(&u32s(&[*duration, data.len() as u32, *flags]));
    }
    let trun = full_box(b"trun", 0, 0x000701, &trun);

    mp4_box(b"traf", &concat(&[tfhd, tfdt, trun]))
}

fn moof_and_mdat(sequence: u32, runs: &[Run]) -> Vec<u8> {
    let build = |offsets: &[u32]| {
        let mut content = full_box(b"mfhd", 0, 0, &u32s(&[sequence]));
        for (run, offset) in runs.iter().zip(offsets) {
            content.extend_from_slice(&traf(run, *offset));
        }
        mp4_box(b"moof", &content)
    };

    // Sizes do not depend on the offsets, so lay out once to measure
    let moof_len = build(&vec![0; runs.len()]).len() as u32;
    let mut offsets = Vec::new();
    let mut cursor = moof_len + 8;
    for run in runs {
        offsets.push(cursor);
        cursor += run.samples.iter().map(|(_, _, d)| d.len() as u32).sum::<u32>();
    }

    let moof = build(&offsets);
    let data: Vec<u8> = runs
        .iter()
        .flat_map(|r| r.samples.iter().flat_map(|(_, _, d)| d.clone()))
        .collect();
    concat(&[moof, mp4_box(b"mdat", &data)])
}

/// One fragment holding every track; the first video sample is a sync
/// sample when `keyframe` is set, otherwise no video sample is.
pub fn fragment_with(index: u32, keyframe: bool) -> Vec<u8> {
    let video = Run {
        track_id: VIDEO_TRACK,
        decode_time: index as u64 * 9000,
        samples: (0..VIDEO_SAMPLES_PER_FRAGMENT)
            .map(|i| {
                let flags = if keyframe && i == 0 { SYNC } else { NON_SYNC };
                (3000, flags, video_sample(index, i))
            })
            .collect(),
    };
    let audio = Run {
        track_id: AUDIO_TRACK,
        decode_time: index as u64 * 4096,
        samples: (0..AUDIO_SAMPLES_PER_FRAGMENT)
            .map(|i| (1024, SYNC, audio_sample(index, i)))
            .collect(),
    };
    let meta = Run {
        track_id: META_TRACK,
        decode_time: index as u64 * 100,
        samples: vec![(100, SYNC, b"cue".to_vec())],
    };
    moof_and_mdat(index + 1, &[video, audio, meta])
}

/// A fragment with one video `traf` built from raw `tfhd` and `trun`
/// fields, for exercising hostile headers.
pub fn raw_fragment(
    tfhd_flags: u32,
    tfhd_fields: &[u32],
    trun_flags: u32,
    trun_fields: &[u32],
    mdat: &[u8],
) -> Vec<u8> {
    let mut tfhd = u32s(&[VIDEO_TRACK]);
    tfhd.extend_from_slice(&u32s(tfhd_fields));
    let tfhd = full_box(b"tfhd", 0, tfhd_flags, &tfhd);
    let trun = full_box(b"trun", 0, trun_flags, &u32s(trun_fields));
    let traf = mp4_box(b"traf", &concat(&[tfhd, trun]));
    let moof = mp4_box(b"moof", &concat(&[full_box(b"mfhd", 0, 0, &u32s(&[99])), traf]));
    concat(&[moof, mp4_box(b"mdat", mdat)])
}

pub fn fragment(index: u32) -> Vec<u8> {
    fragment_with(index, true)
}

/// Init section followed by `fragments` fragments.
pub fn stream(fragments: u32) -> Vec<u8> {
    let mut out = init_section();
    for i in 0..fragments {
        out.extend_from_slice(&fragment(i));
    }
    out
}

/// Segments expected from `stream(fragments)`
pub fn expected_segments(fragments: u32) -> usize {
    2 + fragments as usize * MEDIA_SEGMENTS_PER_FRAGMENT
}

/// Write `stream(fragments)` to a file
pub fn write_stream(dir: &Path, fragments: u32) -> std::io::Result<PathBuf> {
    let path = dir.join("stream.mp4");
    std::fs::write(&path, stream(fragments))?;
    Ok(path)
}

/// Write an executable shell script standing in for the transcoder
#[cfg(unix)]
pub fn fake_transcoder(dir: &Path, body: &str) -> std::io::Result<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-ffmpeg.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n"))?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    Ok(path)
}
