// Integration tests for the fragmented MP4 segmenter
//
// These tests feed synthetic transcoder output through the segmenter and
// verify the per-track init and media segments it produces.

mod common;

use common::*;
use live_relay::mux::{MuxError, MuxEvent, Segment, SegmentKind, SegmentOptions, Segmenter, TrackKind};

fn segments(events: Vec<MuxEvent>) -> Vec<Segment> {
    events
        .into_iter()
        .filter_map(|event| match event {
            MuxEvent::Segment(segment) => Some(segment),
            MuxEvent::Ready(_) => None,
        })
        .collect()
}

fn feed_in_chunks(data: &[u8], chunk_size: usize) -> Vec<Segment> {
    let mut segmenter = Segmenter::new();
    let mut offset = 0u64;
    let mut out = Vec::new();
    for chunk in data.chunks(chunk_size) {
        offset = segmenter.append(chunk, offset).expect("well-formed stream");
        out.extend(segments(segmenter.take_events()));
    }
    out
}

fn count(haystack: &[u8], needle: &[u8]) -> usize {
    haystack.windows(needle.len()).filter(|w| *w == needle).count()
}

#[test]
fn test_ready_then_init_segments_before_media() {
    let data = stream(3);
    let mut segmenter = Segmenter::new();
    let next = segmenter.append(&data, 0).unwrap();
    assert_eq!(next, data.len() as u64);
    assert!(segmenter.is_ready());

    let events = segmenter.take_events();

    // Verify: Ready comes first and lists only audio and video tracks
    let MuxEvent::Ready(tracks) = &events[0] else {
        panic!("first event should be Ready, got {:?}", events[0]);
    };
    assert_eq!(tracks.len(), 2);
    assert_eq!(tracks[0].id, VIDEO_TRACK);
    assert_eq!(tracks[0].kind, TrackKind::Video);
    assert_eq!(tracks[0].codec, VIDEO_CODEC);
    assert_eq!(tracks[0].timescale, 90000);
    assert_eq!(tracks[0].mime_type, "video/mp4; codecs=\"avc1.64001f\"");
    assert_eq!(tracks[1].id, AUDIO_TRACK);
    assert_eq!(tracks[1].mime_type, "audio/mp4; codecs=\"mp4a.40.2\"");

    let segments = segments(events);
    assert_eq!(segments.len(), expected_segments(3));

    // Verify: exactly two init segments, both before any media segment
    assert_eq!(segments[0].kind, SegmentKind::Init);
    assert_eq!(segments[1].kind, SegmentKind::Init);
    assert!(segments[2..].iter().all(|s| s.kind == SegmentKind::Media));

    let init_tracks = [segments[0].track_id, segments[1].track_id];
    assert!(segments
        .iter()
        .all(|s| init_tracks.contains(&s.track_id) && s.track.id == s.track_id));

    // Verify: sequence numbers are dense from 0
    for (i, segment) in segments.iter().enumerate() {
        assert_eq!(segment.sequence, i as u64);
    }
}

#[test]
fn test_init_segment_holds_only_its_track() {
    let mut segmenter = Segmenter::new();
    segmenter.append(&init_section(), 0).unwrap();
    let inits = segments(segmenter.take_events());
    assert_eq!(inits.len(), 2);

    let video = &inits[0].payload;
    assert_eq!(&video[4..8], b"ftyp");
    assert_eq!(count(video, b"moov"), 1);
    assert_eq!(count(video, b"trak"), 1);
    assert_eq!(count(video, b"trex"), 1);
    assert_eq!(count(video, b"avcC"), 1);
    assert_eq!(count(video, b"esds"), 0);

    let audio = &inits[1].payload;
    assert_eq!(count(audio, b"trak"), 1);
    assert_eq!(count(audio, b"esds"), 1);
    assert_eq!(count(audio, b"avcC"), 0);
}

#[test]
fn test_media_segment_carries_one_sample() {
    let data = stream(1);
    let segments = feed_in_chunks(&data, data.len());

    let first_video = segments
        .iter()
        .find(|s| s.kind == SegmentKind::Media && s.track_id == VIDEO_TRACK)
        .unwrap();
    assert_eq!(&first_video.payload[4..8], b"moof");
    assert_eq!(count(&first_video.payload, b"traf"), 1);
    assert!(first_video.payload.ends_with(&video_sample(0, 0)));

    let first_audio = segments
        .iter()
        .find(|s| s.kind == SegmentKind::Media && s.track_id == AUDIO_TRACK)
        .unwrap();
    assert!(first_audio.payload.ends_with(&audio_sample(0, 0)));

    // The metadata sample never shows up
    assert!(segments.iter().all(|s| count(&s.payload, b"cue") == 0));
}

#[test]
fn test_output_independent_of_chunk_boundaries() {
    let data = stream(4);
    let reference: Vec<Vec<u8>> = feed_in_chunks(&data, data.len())
        .into_iter()
        .map(|s| s.payload.to_vec())
        .collect();
    assert_eq!(reference.len(), expected_segments(4));

    for chunk_size in [1, 7, 13, 100, 4096] {
        let split: Vec<Vec<u8>> = feed_in_chunks(&data, chunk_size)
            .into_iter()
            .map(|s| s.payload.to_vec())
            .collect();
        assert_eq!(split, reference, "chunk size {chunk_size}");
    }
}

#[test]
fn test_overlapping_chunk_is_deduplicated() {
    let data = stream(2);
    let mut segmenter = Segmenter::new();

    let next = segmenter.append(&data[..500], 0).unwrap();
    assert_eq!(next, 500);
    // Re-send the last 100 bytes together with the rest
    let next = segmenter.append(&data[400..], 400).unwrap();
    assert_eq!(next, data.len() as u64);

    assert_eq!(segments(segmenter.take_events()).len(), expected_segments(2));
}

#[test]
fn test_gap_recovers_at_next_fragment() {
    let mut segmenter = Segmenter::new();
    let mut offset = 0u64;

    // Setup: init section and one complete fragment
    for part in [init_section(), fragment(0)] {
        offset = segmenter.append(&part, offset).unwrap();
    }
    let before = segments(segmenter.take_events());
    assert_eq!(before.len(), expected_segments(1));

    // Lose the first bytes of the next fragment
    let damaged = fragment(1);
    let result = segmenter.append(&damaged[10..], offset + 10);
    assert!(matches!(
        result,
        Err(MuxError::Discontinuity { expected, got }) if expected == offset && got == offset + 10
    ));
    assert!(segments(segmenter.take_events()).is_empty());
    offset += damaged.len() as u64;

    // Verify: the following fragment is segmented normally
    let next = fragment(2);
    let end = segmenter.append(&next, offset).unwrap();
    assert_eq!(end, offset + next.len() as u64);

    let after = segments(segmenter.take_events());
    assert_eq!(after.len(), MEDIA_SEGMENTS_PER_FRAGMENT);
    assert_eq!(after[0].sequence, before.len() as u64);
    assert!(after[0].payload.ends_with(&video_sample(2, 0)));
}

/// Feed the init section and one fragment, then `hostile`, and check the
/// hostile fragment is rejected without disturbing what follows.
fn assert_rejected_then_recovers(hostile: Vec<u8>) {
    let mut segmenter = Segmenter::new();
    let mut offset = 0u64;
    for part in [init_section(), fragment(0)] {
        offset = segmenter.append(&part, offset).unwrap();
    }
    let before = segments(segmenter.take_events());

    let result = segmenter.append(&hostile, offset);
    assert!(
        matches!(result, Err(MuxError::MalformedStream(_))),
        "unexpected result {result:?}"
    );
    assert!(segments(segmenter.take_events()).is_empty());
    offset += hostile.len() as u64;

    let next = fragment(1);
    assert_eq!(segmenter.append(&next, offset).unwrap(), offset + next.len() as u64);
    let after = segments(segmenter.take_events());
    assert_eq!(after.len(), MEDIA_SEGMENTS_PER_FRAGMENT);
    assert_eq!(after[0].sequence, before.len() as u64);
}

#[test]
fn test_base_data_offset_at_end_of_range_is_malformed() {
    // tfhd base-data-offset = u64::MAX, one sample of 200 bytes
    assert_rejected_then_recovers(raw_fragment(
        0x000001,
        &[u32::MAX, u32::MAX],
        0x000200,
        &[1, 200],
        &[0; 100],
    ));
}

#[test]
fn test_huge_sample_count_is_malformed() {
    // No per-sample fields and a default size of zero
    assert_rejected_then_recovers(raw_fragment(0x020000, &[], 0, &[u32::MAX], &[]));
}

#[test]
fn test_sample_count_beyond_trun_fields_is_malformed() {
    // 1000 samples declared, sizes present for only one
    assert_rejected_then_recovers(raw_fragment(0x020000, &[], 0x000200, &[1000, 4], &[0; 4]));
}

#[test]
fn test_sample_count_beyond_mdat_is_malformed() {
    // tfhd default size of 4 bytes, 1000 samples, 8 bytes of data
    assert_rejected_then_recovers(raw_fragment(0x020010, &[4], 0, &[1000], &[0; 8]));
}

#[test]
fn test_fragment_before_movie_header_is_malformed() {
    let mut segmenter = Segmenter::new();
    let early = fragment(0);

    let result = segmenter.append(&early, 0);
    assert!(matches!(result, Err(MuxError::MalformedStream(_))));
    assert!(segmenter.take_events().is_empty());
    assert!(!segmenter.is_ready());

    // Verify: the segmenter still accepts the real stream afterwards
    let mut offset = early.len() as u64;
    for part in [init_section(), fragment(1)] {
        offset = segmenter.append(&part, offset).unwrap();
    }
    assert_eq!(segments(segmenter.take_events()).len(), expected_segments(1));
}

#[test]
fn test_leading_non_sync_video_samples_dropped() {
    let mut data = init_section();
    data.extend_from_slice(&fragment_with(0, false));
    data.extend_from_slice(&fragment(1));

    let segments = feed_in_chunks(&data, data.len());
    let video: Vec<&Segment> = segments
        .iter()
        .filter(|s| s.kind == SegmentKind::Media && s.track_id == VIDEO_TRACK)
        .collect();
    let audio = segments
        .iter()
        .filter(|s| s.kind == SegmentKind::Media && s.track_id == AUDIO_TRACK)
        .count();

    // Verify: video starts at the keyframe of the second fragment
    assert_eq!(video.len(), VIDEO_SAMPLES_PER_FRAGMENT);
    assert!(video[0].payload.ends_with(&video_sample(1, 0)));
    assert_eq!(audio, 2 * AUDIO_SAMPLES_PER_FRAGMENT);
}

#[test]
fn test_samples_grouped_per_segment() {
    let data = stream(3);
    let mut segmenter = Segmenter::with_options(SegmentOptions {
        nb_samples: 3,
        ..Default::default()
    });
    segmenter.append(&data, 0).unwrap();
    let segments = segments(segmenter.take_events());

    let media_for = |track_id| {
        segments
            .iter()
            .filter(|s| s.kind == SegmentKind::Media && s.track_id == track_id)
            .count()
    };
    // 9 video samples and 12 audio samples, 3 per segment
    assert_eq!(media_for(VIDEO_TRACK), 3);
    assert_eq!(media_for(AUDIO_TRACK), 4);
}
