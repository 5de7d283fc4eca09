use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::mux::{Segment, SegmentKind};
use crate::relay::RelayEvent;

/// Recorder configuration
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Output directory for track files
    pub output_dir: PathBuf,
    /// Prefix of every file name (the relay client id)
    pub stream_id: String,
}

impl RecorderConfig {
    pub fn new(stream_id: String, output_dir: PathBuf) -> Self {
        Self {
            output_dir,
            stream_id,
        }
    }
}

/// Metadata for one written track file
#[derive(Debug, Clone, Serialize)]
pub struct TrackFileMetadata {
    pub track_id: u32,
    /// Incremented each time the track is re-initialised (relay restart)
    pub part: usize,
    pub mime_type: String,
    pub file_path: PathBuf,
    /// Media segments written, the init segment excluded
    pub segment_count: usize,
    pub bytes: u64,
}

/// Writes relay segments to one playable fMP4 file per track.
///
/// A track's init segment opens a new file; its media segments are
/// appended until the next init segment (after a restart) or the end of
/// the event stream.
pub struct SegmentRecorder {
    config: RecorderConfig,
    writers: HashMap<u32, TrackWriter>,
    parts: HashMap<u32, usize>,
}

impl SegmentRecorder {
    pub fn new(config: RecorderConfig) -> Result<Self> {
        fs::create_dir_all(&config.output_dir).with_context(|| {
            format!(
                "Failed to create output directory: {:?}",
                config.output_dir
            )
        })?;

        info!(
            "Segment recorder initialized: {} -> {:?}",
            config.stream_id, config.output_dir
        );

        Ok(Self {
            config,
            writers: HashMap::new(),
            parts: HashMap::new(),
        })
    }

    /// Consume relay events until the channel closes
    pub async fn record(
        &mut self,
        mut events: mpsc::UnboundedReceiver<RelayEvent>,
    ) -> Result<Vec<TrackFileMetadata>> {
        let mut metadata = Vec::new();

        while let Some(event) = events.recv().await {
            match event {
                RelayEvent::Segment(segment) => {
                    if let Some(finished) = self.write_segment(&segment)? {
                        metadata.push(finished);
                    }
                }
                RelayEvent::Error(message) => warn!("Relay: {}", message),
                RelayEvent::End => {
                    info!("Relay stream ended");
                    metadata.extend(self.finish_all()?);
                }
            }
        }

        metadata.extend(self.finish_all()?);

        info!("Recording complete: {} track files saved", metadata.len());

        Ok(metadata)
    }

    /// Write one segment; returns the metadata of a file closed by a new
    /// init segment.
    fn write_segment(&mut self, segment: &Segment) -> Result<Option<TrackFileMetadata>> {
        match segment.kind {
            SegmentKind::Init => {
                let finished = match self.writers.remove(&segment.track_id) {
                    Some(writer) => Some(writer.finish()?),
                    None => None,
                };

                let mut writer = self.start_track_file(segment)?;
                writer.write(&segment.payload)?;
                self.writers.insert(segment.track_id, writer);
                Ok(finished)
            }
            SegmentKind::Media => {
                match self.writers.get_mut(&segment.track_id) {
                    Some(writer) => {
                        writer.write(&segment.payload)?;
                        writer.metadata.segment_count += 1;
                    }
                    None => debug!(
                        "Dropping segment {} of uninitialised track {}",
                        segment.sequence, segment.track_id
                    ),
                }
                Ok(None)
            }
        }
    }

    fn start_track_file(&mut self, segment: &Segment) -> Result<TrackWriter> {
        let part = self.parts.entry(segment.track_id).or_insert(0);
        let file_name = if *part == 0 {
            format!("{}-track-{}.mp4", self.config.stream_id, segment.track_id)
        } else {
            format!(
                "{}-track-{}-part-{:03}.mp4",
                self.config.stream_id, segment.track_id, part
            )
        };

        let writer = TrackWriter::new(
            self.config.output_dir.join(file_name),
            segment.track_id,
            *part,
            segment.track.mime_type.clone(),
        )?;
        *part += 1;

        Ok(writer)
    }

    fn finish_all(&mut self) -> Result<Vec<TrackFileMetadata>> {
        let mut track_ids: Vec<u32> = self.writers.keys().copied().collect();
        track_ids.sort_unstable();

        let mut finished = Vec::new();
        for track_id in track_ids {
            if let Some(writer) = self.writers.remove(&track_id) {
                finished.push(writer.finish()?);
            }
        }
        Ok(finished)
    }
}

/// Writes a single track file to disk
struct TrackWriter {
    writer: Option<BufWriter<File>>,
    metadata: TrackFileMetadata,
}

impl TrackWriter {
    fn new(file_path: PathBuf, track_id: u32, part: usize, mime_type: String) -> Result<Self> {
        let file = File::create(&file_path)
            .with_context(|| format!("Failed to create track file: {:?}", file_path))?;

        Ok(Self {
            writer: Some(BufWriter::new(file)),
            metadata: TrackFileMetadata {
                track_id,
                part,
                mime_type,
                file_path,
                segment_count: 0,
                bytes: 0,
            },
        })
    }

    fn write(&mut self, payload: &[u8]) -> Result<()> {
        if let Some(writer) = &mut self.writer {
            writer
                .write_all(payload)
                .with_context(|| format!("Failed to write {:?}", self.metadata.file_path))?;
            self.metadata.bytes += payload.len() as u64;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<TrackFileMetadata> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().context("Failed to flush track file")?;
        }

        info!(
            "Track {} file complete: {:?} ({} segments, {} bytes)",
            self.metadata.track_id,
            self.metadata.file_path,
            self.metadata.segment_count,
            self.metadata.bytes
        );

        Ok(self.metadata.clone())
    }
}

impl Drop for TrackWriter {
    fn drop(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush() {
                warn!("Failed to flush track file on drop: {}", e);
            }
        }
    }
}
