use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::RelayConfig;
use super::error::RelayError;
use super::events::{Notification, SessionEvent};
use crate::mux::{MuxEvent, Segmenter};

/// How long the transcoder gets to exit after SIGTERM
pub const GRACE_PERIOD: Duration = Duration::from_secs(2);

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Command line for the transcoder: remux the RTMPS feed into fragmented
/// MP4 on stdout without re-encoding.
pub fn transcoder_args(config: &RelayConfig) -> Vec<String> {
    let url = config.source_url();
    let buffering = config.buffering.to_string();
    [
        "-loglevel",
        "0",
        "-i",
        url.as_str(),
        "-rtmp_live",
        "live",
        "-rtmp_buffer",
        buffering.as_str(),
        "-threads",
        "4",
        "-c:a",
        "copy",
        "-c:v",
        "copy",
        "-f",
        "mp4",
        "-movflags",
        "frag_keyframe+omit_tfhd_offset+empty_moov+default_base_moof",
        "-y",
        "pipe:1",
    ]
    .iter()
    .map(|arg| arg.to_string())
    .collect()
}

/// A running transcoder process and the tasks draining its output.
///
/// Stdout is fed through a [`Segmenter`] owned by the stdout task; every
/// resulting event is tagged with the session generation and sent to the
/// lifecycle dispatcher.
pub struct Transcoder {
    child: Option<Child>,
    stdout_task: Option<JoinHandle<()>>,
    stderr_task: Option<JoinHandle<()>>,
    generation: u64,
}

impl Transcoder {
    /// Spawn the transcoder. Returns once the process exists; streaming
    /// results arrive asynchronously through `notifier`.
    pub(crate) fn launch(
        config: &RelayConfig,
        generation: u64,
        notifier: UnboundedSender<Notification>,
    ) -> Result<Self, RelayError> {
        let mut child = Command::new(&config.transcoder)
            .args(transcoder_args(config))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RelayError::LaunchFailure {
                path: config.transcoder.clone(),
                source,
            })?;

        info!(
            "Transcoder launched (pid {:?}, generation {}, channel {}, {})",
            child.id(),
            generation,
            config.channel,
            config.resolution
        );

        let stdout_task = child.stdout.take().map(|stdout| {
            tokio::spawn(pump_stdout(
                stdout,
                Segmenter::new(),
                generation,
                notifier.clone(),
            ))
        });
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(pump_stderr(stderr, generation, notifier)));

        Ok(Self {
            child: Some(child),
            stdout_task,
            stderr_task,
            generation,
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Stop the transcoder: SIGTERM, then SIGKILL after [`GRACE_PERIOD`].
    ///
    /// Waits for the process to exit and for the output tasks to finish.
    /// Calling it again is a no-op.
    pub async fn terminate(&mut self) {
        if let Some(mut child) = self.child.take() {
            match child.try_wait() {
                Ok(Some(status)) => debug!("Transcoder already exited: {}", status),
                _ => {
                    request_exit(&mut child);
                    match tokio::time::timeout(GRACE_PERIOD, child.wait()).await {
                        Ok(Ok(status)) => debug!("Transcoder exited: {}", status),
                        Ok(Err(e)) => debug!("Failed to wait for transcoder: {}", e),
                        Err(_) => {
                            warn!(
                                "Transcoder did not exit within {:?}, killing it",
                                GRACE_PERIOD
                            );
                            if let Err(e) = child.kill().await {
                                warn!("Failed to kill transcoder: {}", e);
                            }
                        }
                    }
                }
            }
            info!("Transcoder stopped (generation {})", self.generation);
        }

        for task in [self.stdout_task.take(), self.stderr_task.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for Transcoder {
    fn drop(&mut self) {
        // The child itself is killed by kill_on_drop
        for task in [&self.stdout_task, &self.stderr_task].into_iter().flatten() {
            task.abort();
        }
    }
}

#[cfg(unix)]
fn request_exit(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!("Failed to send SIGTERM to transcoder: {}", e);
        }
    }
}

#[cfg(not(unix))]
fn request_exit(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!("Failed to kill transcoder: {}", e);
    }
}

fn send(notifier: &UnboundedSender<Notification>, generation: u64, event: SessionEvent) -> bool {
    notifier
        .send(Notification::Session { generation, event })
        .is_ok()
}

async fn pump_stdout(
    mut stdout: ChildStdout,
    mut segmenter: Segmenter,
    generation: u64,
    notifier: UnboundedSender<Notification>,
) {
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    let mut offset = 0u64;

    loop {
        let n = match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                send(
                    &notifier,
                    generation,
                    SessionEvent::Error(format!("transcoder output: {e}")),
                );
                break;
            }
        };

        let result = segmenter.append(&buf[..n], offset);

        // Events produced before an error still go out first
        for event in segmenter.take_events() {
            let event = match event {
                MuxEvent::Ready(tracks) => SessionEvent::Ready(tracks),
                MuxEvent::Segment(segment) => SessionEvent::Segment(segment),
            };
            if !send(&notifier, generation, event) {
                return;
            }
        }

        match result {
            Ok(next) => offset = next,
            Err(e) => {
                offset = segmenter.next_offset();
                if !send(&notifier, generation, SessionEvent::Error(format!("segmenter: {e}"))) {
                    return;
                }
            }
        }
    }

    debug!("Transcoder stdout closed after {} bytes", offset);
    send(&notifier, generation, SessionEvent::End);
}

async fn pump_stderr(stderr: ChildStderr, generation: u64, notifier: UnboundedSender<Notification>) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                // ffmpeg output is not guaranteed to be UTF-8
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end();
                if line.is_empty() {
                    continue;
                }
                if !send(&notifier, generation, SessionEvent::Error(format!("ffmpeg: {line}"))) {
                    break;
                }
            }
            Err(e) => {
                debug!("Failed to read transcoder stderr: {}", e);
                break;
            }
        }
    }
}
