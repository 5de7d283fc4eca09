//! Incremental fragmented MP4 re-segmenter.
//!
//! The transcoder writes a single fMP4 stream (`ftyp`, `moov`, then
//! `moof`/`mdat` pairs) holding every track. [`Segmenter`] splits it into
//! per-track init segments and small per-track media segments, each one
//! independently appendable to a Media Source buffer.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::boxes::{begin_box, children, end_box, put_version_and_flags, BoxHeader, FourCc};
use super::error::{MuxError, Result};
use super::fragment::{demux, write_media_segment, FragmentData, Sample, TrackDefaults};
use super::track::{parse_trak, Segment, SegmentKind, TrackDescriptor, TrackKind};

/// Largest top-level box the segmenter will buffer (64 MiB).
pub const MAX_BOX_SIZE: u64 = 64 * 1024 * 1024;

/// Per-track segmentation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentOptions {
    /// Samples per media segment
    pub nb_samples: usize,

    /// Drop samples until the first sync sample of each track
    pub rap_alignment: bool,
}

impl Default for SegmentOptions {
    fn default() -> Self {
        Self {
            nb_samples: 1,
            rap_alignment: true,
        }
    }
}

/// Output of the segmenter, in emission order.
#[derive(Debug, Clone)]
pub enum MuxEvent {
    /// Stream metadata parsed; init segments follow immediately.
    Ready(Vec<Arc<TrackDescriptor>>),
    Segment(Segment),
}

struct TrackState {
    descriptor: Arc<TrackDescriptor>,
    pending: Vec<Sample>,
    /// A sync sample has been seen
    started: bool,
}

pub struct Segmenter {
    options: SegmentOptions,

    /// Unconsumed bytes
    buffer: BytesMut,

    /// Stream offset of `buffer[0]`
    buffer_offset: u64,

    ftyp: Option<Bytes>,
    ready: bool,
    tracks: Vec<TrackState>,
    defaults: HashMap<u32, TrackDefaults>,

    /// A `moof` waiting for its `mdat`, with its stream offset
    pending_moof: Option<(u64, Bytes)>,

    /// Discarding bytes until a plausible box header
    resyncing: bool,

    next_sequence: u64,
    fragment_number: u32,
    events: Vec<MuxEvent>,
}

impl Default for Segmenter {
    fn default() -> Self {
        Self::new()
    }
}

impl Segmenter {
    pub fn new() -> Self {
        Self::with_options(SegmentOptions::default())
    }

    pub fn with_options(options: SegmentOptions) -> Self {
        Self {
            options: SegmentOptions {
                nb_samples: options.nb_samples.max(1),
                ..options
            },
            buffer: BytesMut::new(),
            buffer_offset: 0,
            ftyp: None,
            ready: false,
            tracks: Vec::new(),
            defaults: HashMap::new(),
            pending_moof: None,
            resyncing: false,
            next_sequence: 0,
            fragment_number: 0,
            events: Vec::new(),
        }
    }

    /// Feed a chunk that starts at `offset` in the byte stream.
    ///
    /// Returns the offset the next chunk is expected at. Events produced
    /// by the chunk are collected with [`Segmenter::take_events`], also
    /// when an error is returned: errors never poison the segmenter.
    pub fn append(&mut self, chunk: &[u8], offset: u64) -> Result<u64> {
        let expected = self.next_offset();
        let mut gap = None;

        let chunk = if offset < expected {
            // Already consumed prefix
            let overlap = expected - offset;
            if overlap >= chunk.len() as u64 {
                return Ok(expected);
            }
            &chunk[overlap as usize..]
        } else {
            if offset > expected {
                debug!(
                    "Gap in segmenter input (expected offset {}, got {}), resynchronising",
                    expected,
                    offset
                );
                gap = Some(MuxError::Discontinuity {
                    expected,
                    got: offset,
                });
                self.buffer.clear();
                self.buffer_offset = offset;
                self.start_resync();
            }
            chunk
        };

        self.buffer.extend_from_slice(chunk);
        let result = self.process();

        match gap {
            Some(e) => Err(e),
            None => result.map(|()| self.next_offset()),
        }
    }

    /// Drain the events produced so far.
    pub fn take_events(&mut self) -> Vec<MuxEvent> {
        std::mem::take(&mut self.events)
    }

    /// Whether the movie header has been parsed.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Descriptors of the segmented tracks (empty until ready).
    pub fn tracks(&self) -> Vec<Arc<TrackDescriptor>> {
        self.tracks.iter().map(|t| Arc::clone(&t.descriptor)).collect()
    }

    /// Stream offset right after the last byte received.
    pub fn next_offset(&self) -> u64 {
        self.buffer_offset + self.buffer.len() as u64
    }

    fn process(&mut self) -> Result<()> {
        let mut first_error: Option<MuxError> = None;
        let mut record = |e: MuxError| {
            if first_error.is_none() {
                first_error = Some(e);
            } else {
                debug!("Additional segmenter error: {}", e);
            }
        };

        loop {
            if self.resyncing && !self.resync() {
                break;
            }

            let header = match BoxHeader::parse(&self.buffer) {
                Ok(Some(header)) => header,
                Ok(None) => break,
                Err(e) => {
                    record(e);
                    self.discard(1);
                    self.start_resync();
                    continue;
                }
            };

            if header.size > MAX_BOX_SIZE {
                record(MuxError::BoxTooLarge {
                    fourcc: header.fourcc,
                    size: header.size,
                    max: MAX_BOX_SIZE,
                });
                self.discard(1);
                self.start_resync();
                continue;
            }

            if (self.buffer.len() as u64) < header.size {
                break;
            }

            let offset = self.buffer_offset;
            let bytes = self.buffer.split_to(header.size as usize).freeze();
            self.buffer_offset += header.size;

            if let Err(e) = self.handle_box(header, offset, bytes) {
                record(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn discard(&mut self, n: usize) {
        let n = n.min(self.buffer.len());
        let _ = self.buffer.split_to(n);
        self.buffer_offset += n as u64;
    }

    fn start_resync(&mut self) {
        self.resyncing = true;
        self.pending_moof = None;
    }

    /// Skip to the next plausible header. Returns false when more bytes
    /// are needed.
    fn resync(&mut self) -> bool {
        let ready = self.ready;
        let found = self.buffer.windows(8).position(|window| {
            let size = u32::from_be_bytes([window[0], window[1], window[2], window[3]]) as u64;
            let fourcc = FourCc([window[4], window[5], window[6], window[7]]);
            let wanted = fourcc == FourCc::MOOF
                || (!ready && (fourcc == FourCc::FTYP || fourcc == FourCc::MOOV));
            wanted && size >= 8 && size <= MAX_BOX_SIZE
        });

        match found {
            Some(position) => {
                self.discard(position);
                self.resyncing = false;
                true
            }
            None => {
                // Keep a possible partial header
                let keep = self.buffer.len().min(7);
                self.discard(self.buffer.len() - keep);
                false
            }
        }
    }

    fn handle_box(&mut self, header: BoxHeader, offset: u64, bytes: Bytes) -> Result<()> {
        match header.fourcc {
            FourCc::FTYP => {
                if !self.ready {
                    self.ftyp = Some(bytes);
                }
            }
            FourCc::MOOV => {
                if self.ready {
                    debug!("Ignoring repeated moov");
                } else {
                    self.initialise(&bytes.slice(header.header_size..))?;
                }
            }
            FourCc::MOOF => {
                if !self.ready {
                    return Err(MuxError::malformed("moof before moov"));
                }
                if self.pending_moof.is_some() {
                    debug!("Dropped moof without mdat at offset {}", offset);
                }
                self.pending_moof = Some((offset, bytes));
            }
            FourCc::MDAT => {
                let Some((moof_offset, moof)) = self.pending_moof.take() else {
                    debug!("Skipped mdat without moof at offset {}", offset);
                    return Ok(());
                };
                let data = FragmentData {
                    moof_offset,
                    mdat_offset: offset + header.header_size as u64,
                    mdat: bytes.slice(header.header_size..),
                };
                self.fragment(&moof, &data)?;
            }
            other => debug!("Skipping {} box ({} bytes)", other, header.size),
        }
        Ok(())
    }

    /// Parse the movie header and emit one init segment per track.
    fn initialise(&mut self, moov: &Bytes) -> Result<()> {
        let mut mvhd = None;
        let mut mehd = None;
        let mut traks = Vec::new();
        let mut trex = HashMap::new();

        for child in children(moov) {
            let child = child?;
            match child.fourcc {
                FourCc::MVHD => mvhd = Some(moov.slice_ref(child.bytes)),
                FourCc::TRAK => traks.push(parse_trak(moov.slice_ref(child.bytes))?),
                FourCc::MVEX => {
                    for entry in children(child.payload) {
                        let entry = entry?;
                        match entry.fourcc {
                            FourCc::MEHD => mehd = Some(moov.slice_ref(entry.bytes)),
                            FourCc::TREX => {
                                let (track_id, defaults) = TrackDefaults::parse_trex(entry.payload)?;
                                trex.insert(track_id, (moov.slice_ref(entry.bytes), defaults));
                            }
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }

        let mvhd = mvhd.ok_or_else(|| MuxError::malformed("moov without mvhd"))?;
        if !traks.iter().any(|t| t.kind != TrackKind::Other) {
            return Err(MuxError::malformed("moov declares no audio or video track"));
        }

        let ftyp = self.ftyp.clone().unwrap_or_else(default_ftyp);
        let mut inits = Vec::new();

        for trak in traks {
            if trak.kind == TrackKind::Other {
                debug!("Dropping non audio/video track {}", trak.id);
                continue;
            }

            let (trex_box, defaults) = match trex.get(&trak.id) {
                Some((raw, defaults)) => (raw.clone(), *defaults),
                None => (default_trex(trak.id), TrackDefaults::default()),
            };
            self.defaults.insert(trak.id, defaults);

            let descriptor = Arc::new(TrackDescriptor::new(
                trak.id,
                trak.kind,
                trak.codec,
                trak.timescale,
            ));
            info!(
                "Track {} ready: {} ({})",
                descriptor.id, descriptor.mime_type, descriptor.timescale
            );

            let payload = write_init_segment(&ftyp, &mvhd, &trak.trak, mehd.as_deref(), &trex_box);
            inits.push((Arc::clone(&descriptor), payload));
            self.tracks.push(TrackState {
                descriptor,
                pending: Vec::new(),
                started: false,
            });
        }

        self.ready = true;
        self.events.push(MuxEvent::Ready(self.tracks()));
        for (descriptor, payload) in inits {
            self.emit(descriptor, SegmentKind::Init, payload);
        }
        Ok(())
    }

    fn fragment(&mut self, moof: &Bytes, data: &FragmentData) -> Result<()> {
        let header = BoxHeader::parse(moof)?.ok_or_else(|| MuxError::malformed("truncated moof"))?;
        let defaults = &self.defaults;
        let runs = demux(&moof[header.header_size..], data, |id| defaults.get(&id).copied())?;

        let nb_samples = self.options.nb_samples;
        let rap_alignment = self.options.rap_alignment;

        for run in runs {
            let Some(index) = self
                .tracks
                .iter()
                .position(|t| t.descriptor.id == run.track_id)
            else {
                continue;
            };

            for sample in run.samples {
                let track = &mut self.tracks[index];
                if !track.started {
                    if rap_alignment && !sample.is_sync() {
                        debug!(
                            "Dropping sample before first sync sample on track {}",
                            run.track_id
                        );
                        continue;
                    }
                    track.started = true;
                }

                track.pending.push(sample);
                if track.pending.len() < nb_samples {
                    continue;
                }

                let samples = std::mem::take(&mut track.pending);
                let descriptor = Arc::clone(&track.descriptor);
                self.fragment_number = self.fragment_number.wrapping_add(1);
                let payload = write_media_segment(self.fragment_number, descriptor.id, &samples);
                self.emit(descriptor, SegmentKind::Media, payload);
            }
        }
        Ok(())
    }

    fn emit(&mut self, track: Arc<TrackDescriptor>, kind: SegmentKind, payload: Bytes) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        debug!(
            "Segment {} ({:?}, track {}, {} bytes)",
            sequence,
            kind,
            track.id,
            payload.len()
        );
        self.events.push(MuxEvent::Segment(Segment {
            sequence,
            track_id: track.id,
            track,
            kind,
            payload,
        }));
    }
}

fn write_init_segment(
    ftyp: &[u8],
    mvhd: &[u8],
    trak: &[u8],
    mehd: Option<&[u8]>,
    trex: &[u8],
) -> Bytes {
    let mut buf = BytesMut::with_capacity(ftyp.len() + mvhd.len() + trak.len() + trex.len() + 64);
    buf.put_slice(ftyp);

    let moov = begin_box(&mut buf, FourCc::MOOV);
    buf.put_slice(mvhd);
    buf.put_slice(trak);
    let mvex = begin_box(&mut buf, FourCc::MVEX);
    if let Some(mehd) = mehd {
        buf.put_slice(mehd);
    }
    buf.put_slice(trex);
    end_box(&mut buf, mvex);
    end_box(&mut buf, moov);

    buf.freeze()
}

fn default_ftyp() -> Bytes {
    let mut buf = BytesMut::new();
    let ftyp = begin_box(&mut buf, FourCc::FTYP);
    buf.put_slice(b"isom");
    buf.put_u32(0x200);
    for brand in [b"isom", b"iso6", b"mp41"] {
        buf.put_slice(brand);
    }
    end_box(&mut buf, ftyp);
    buf.freeze()
}

fn default_trex(track_id: u32) -> Bytes {
    let mut buf = BytesMut::new();
    let trex = begin_box(&mut buf, FourCc::TREX);
    put_version_and_flags(&mut buf, 0, 0);
    buf.put_u32(track_id);
    buf.put_u32(1); // sample description index
    buf.put_u32(0);
    buf.put_u32(0);
    buf.put_u32(0);
    end_box(&mut buf, trex);
    buf.freeze()
}
