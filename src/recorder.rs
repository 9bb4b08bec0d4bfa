//! On-disk session recording.
//!
//! One recorded run is one directory under `sessions/`, laid out as:
//!
//! ```text
//! sessions/{name}/
//!   metadata.json              parameters, timestamps, directions recorded
//!   anatomical.npy             optional anatomical reference frame
//!   {DIR}_camera.h5            dataset "frames" (n, H, W[, C]) u8, chunked+gzip
//!   {DIR}_events.json          one JSON object per line, line k <-> frame k
//! ```
//!
//! A dedicated `recorder-writer` thread drains a bounded queue of frames so
//! disk latency never reaches the capture thread; the capture thread blocks
//! on the queue for at most a short grace period and then surfaces
//! [`IsiError::RecorderBackpressure`].
//!
//! Finalization is atomic: the session is written into `{name}.partial/`,
//! every archive is closed, `metadata.json` is written last, and the
//! directory is renamed to its final name. A crash leaves a `.partial`
//! directory that the analysis pipeline can still read direction-by-direction.

use crossbeam_channel::{bounded, Receiver, Sender};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{AppResult, IsiError};
use crate::params::Parameters;
use crate::stimulus::Direction;
use crate::storage::write_str_attr;

/// Frames buffered in memory before an HDF5 append.
const APPEND_CHUNK_FRAMES: usize = 16;

/// How long the capture thread may wait on a full recorder queue before the
/// run is faulted with backpressure.
const ENQUEUE_GRACE: Duration = Duration::from_millis(500);

/// One line of `{DIR}_events.json`: the stimulus frame paired with one
/// recorded camera frame, in capture order.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameEvent {
    /// Camera timestamp (equals the stimulus presentation timestamp in
    /// camera-triggered mode).
    pub timestamp_us: u64,
    pub camera_frame_index: u64,
    /// Index into the direction's stimulus sequence.
    pub frame_index: u64,
    pub bar_angle_deg: f64,
}

/// Session document written last, gating the atomic rename.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_name: String,
    pub subject_id: String,
    pub notes: String,
    pub software_version: String,
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub end_time: chrono::DateTime<chrono::Utc>,
    /// True when the run was cancelled or faulted before completing.
    pub partial: bool,
    pub directions_recorded: Vec<Direction>,
    /// Every parameter group at session start.
    pub parameters: Parameters,
}

/// One camera frame routed to disk.
pub struct RecordedFrame {
    pub direction: Direction,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub pixels: Arc<Vec<u8>>,
    pub event: FrameEvent,
}

enum RecorderMsg {
    StartDirection(Direction),
    Frame(Box<RecordedFrame>),
    EndCycle(Direction),
    EndDirection(Direction),
    Finalize {
        cancelled: bool,
        reply: Sender<AppResult<PathBuf>>,
    },
}

/// Cloneable frame-only sink handed to the capture thread.
#[derive(Clone)]
pub struct FrameSink {
    tx: Sender<RecorderMsg>,
}

impl FrameSink {
    /// Route one camera frame to disk. Bounded wait; a queue that stays full
    /// past the grace period faults the run with backpressure.
    pub fn write_frame(&self, frame: RecordedFrame) -> AppResult<()> {
        match self
            .tx
            .send_timeout(RecorderMsg::Frame(Box::new(frame)), ENQUEUE_GRACE)
        {
            Ok(()) => Ok(()),
            Err(crossbeam_channel::SendTimeoutError::Timeout(_)) => {
                Err(IsiError::RecorderBackpressure)
            }
            Err(crossbeam_channel::SendTimeoutError::Disconnected(_)) => {
                Err(IsiError::Internal("recorder thread terminated".into()))
            }
        }
    }
}

/// Handle held by the orchestrator and the capture thread.
pub struct RecorderHandle {
    tx: Sender<RecorderMsg>,
    thread: Option<std::thread::JoinHandle<()>>,
    partial_dir: PathBuf,
}

impl RecorderHandle {
    /// Create the session directory (as `.partial`), write the anatomical
    /// reference if one is pending, and start the writer thread.
    ///
    /// `queue_capacity` is sized by the caller to roughly two seconds of
    /// frames at the camera rate.
    pub fn start(
        sessions_dir: &Path,
        parameters: Parameters,
        anatomical: Option<Array2<u8>>,
        queue_capacity: usize,
    ) -> AppResult<Self> {
        let name = if parameters.session.session_name.trim().is_empty() {
            format!("session_{}", chrono::Utc::now().format("%Y%m%d_%H%M%S"))
        } else {
            parameters.session.session_name.trim().to_string()
        };
        let partial_dir = sessions_dir.join(format!("{name}.partial"));
        if partial_dir.exists() {
            return Err(IsiError::Validation {
                field: "session.session_name".into(),
                reason: format!("a partial session named '{name}' already exists"),
            });
        }
        std::fs::create_dir_all(&partial_dir)?;

        if let Some(frame) = anatomical {
            ndarray_npy::write_npy(partial_dir.join("anatomical.npy"), &frame)
                .map_err(|e| IsiError::Internal(format!("anatomical.npy: {e}")))?;
        }

        let (tx, rx) = bounded(queue_capacity.max(8));
        let writer = SessionWriter {
            dir: partial_dir.clone(),
            name,
            parameters,
            start_time: chrono::Utc::now(),
            open: None,
            recorded: BTreeMap::new(),
            fault: None,
        };
        let thread = std::thread::Builder::new()
            .name("recorder-writer".into())
            .spawn(move || writer.run(rx))
            .map_err(IsiError::Io)?;

        Ok(Self {
            tx,
            thread: Some(thread),
            partial_dir,
        })
    }

    pub fn partial_dir(&self) -> &Path {
        &self.partial_dir
    }

    /// Frame sink for the capture thread.
    pub fn frame_sink(&self) -> FrameSink {
        FrameSink {
            tx: self.tx.clone(),
        }
    }

    /// Mark the start of one direction's recording.
    pub fn start_direction(&self, direction: Direction) -> AppResult<()> {
        self.send(RecorderMsg::StartDirection(direction))
    }

    /// Route one camera frame to disk; see [`FrameSink::write_frame`].
    pub fn write_frame(&self, frame: RecordedFrame) -> AppResult<()> {
        self.frame_sink().write_frame(frame)
    }

    /// Flush event lines at a cycle boundary.
    pub fn end_cycle(&self, direction: Direction) -> AppResult<()> {
        self.send(RecorderMsg::EndCycle(direction))
    }

    /// Close one direction's archives.
    pub fn end_direction(&self, direction: Direction) -> AppResult<()> {
        self.send(RecorderMsg::EndDirection(direction))
    }

    /// Flush everything, write `metadata.json`, atomically rename the
    /// session directory, and join the writer thread. Returns the final
    /// session path.
    pub fn finalize(mut self, cancelled: bool) -> AppResult<PathBuf> {
        let (reply_tx, reply_rx) = bounded(1);
        self.send(RecorderMsg::Finalize {
            cancelled,
            reply: reply_tx,
        })?;
        let result = reply_rx
            .recv()
            .map_err(|_| IsiError::Internal("recorder thread terminated".into()))?;
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        result
    }

    fn send(&self, msg: RecorderMsg) -> AppResult<()> {
        self.tx
            .send(msg)
            .map_err(|_| IsiError::Internal("recorder thread terminated".into()))
    }
}

/// Per-direction open archive state on the writer thread.
struct OpenDirection {
    direction: Direction,
    file: hdf5::File,
    dataset: Option<hdf5::Dataset>,
    events: std::io::BufWriter<std::fs::File>,
    width: u32,
    height: u32,
    channels: u32,
    frames_written: usize,
    /// Flat chunk buffer, `pending_frames * height * width * channels` bytes.
    pending: Vec<u8>,
    pending_frames: usize,
}

struct SessionWriter {
    dir: PathBuf,
    name: String,
    parameters: Parameters,
    start_time: chrono::DateTime<chrono::Utc>,
    open: Option<OpenDirection>,
    recorded: BTreeMap<Direction, usize>,
    fault: Option<IsiError>,
}

impl SessionWriter {
    fn run(mut self, rx: Receiver<RecorderMsg>) {
        while let Ok(msg) = rx.recv() {
            match msg {
                RecorderMsg::StartDirection(direction) => {
                    if let Err(err) = self.start_direction(direction) {
                        self.record_fault(err);
                    }
                }
                RecorderMsg::Frame(frame) => {
                    if self.fault.is_none() {
                        if let Err(err) = self.write_frame(&frame) {
                            self.record_fault(err);
                        }
                    }
                }
                RecorderMsg::EndCycle(direction) => {
                    if let Err(err) = self.end_cycle(direction) {
                        self.record_fault(err);
                    }
                }
                RecorderMsg::EndDirection(direction) => {
                    if let Err(err) = self.end_direction(direction) {
                        self.record_fault(err);
                    }
                }
                RecorderMsg::Finalize { cancelled, reply } => {
                    let result = self.finalize(cancelled);
                    let _ = reply.send(result);
                    return;
                }
            }
        }
        // Handle dropped without finalize: leave the .partial directory for
        // recovery.
        tracing::warn!(dir = %self.dir.display(), "recorder stopped without finalize");
    }

    fn record_fault(&mut self, err: IsiError) {
        tracing::error!(error = %err, "recorder fault; dropping subsequent frames");
        if self.fault.is_none() {
            self.fault = Some(err);
        }
    }

    fn start_direction(&mut self, direction: Direction) -> AppResult<()> {
        if self.open.is_some() {
            self.close_open()?;
        }
        let h5_path = self.dir.join(format!("{direction}_camera.h5"));
        let file = hdf5::File::create(&h5_path)?;
        let events = std::io::BufWriter::new(std::fs::File::create(
            self.dir.join(format!("{direction}_events.json")),
        )?);
        self.open = Some(OpenDirection {
            direction,
            file,
            dataset: None,
            events,
            width: 0,
            height: 0,
            channels: 0,
            frames_written: 0,
            pending: Vec::new(),
            pending_frames: 0,
        });
        tracing::info!(%direction, "recording direction");
        Ok(())
    }

    fn write_frame(&mut self, frame: &RecordedFrame) -> AppResult<()> {
        let open = self.open.as_mut().ok_or_else(|| {
            IsiError::Internal(format!(
                "frame for {} arrived with no open direction",
                frame.direction
            ))
        })?;
        if open.direction != frame.direction {
            return Err(IsiError::Internal(format!(
                "frame for {} arrived while recording {}",
                frame.direction, open.direction
            )));
        }

        if open.dataset.is_none() {
            open.width = frame.width;
            open.height = frame.height;
            open.channels = frame.channels;
            open.dataset = Some(create_frames_dataset(
                &open.file,
                frame.height as usize,
                frame.width as usize,
                frame.channels as usize,
            )?);
        }
        if frame.width != open.width || frame.height != open.height
            || frame.channels != open.channels
        {
            return Err(IsiError::ShapeMismatch {
                got: vec![
                    frame.height as usize,
                    frame.width as usize,
                    frame.channels as usize,
                ],
                expected: format!(
                    "{}x{}x{} as established by the first frame",
                    open.height, open.width, open.channels
                ),
            });
        }

        open.pending.extend_from_slice(&frame.pixels);
        open.pending_frames += 1;
        if open.pending_frames >= APPEND_CHUNK_FRAMES {
            flush_pending(open)?;
        }

        let line = serde_json::to_string(&frame.event)
            .map_err(|e| IsiError::Internal(e.to_string()))?;
        open.events.write_all(line.as_bytes())?;
        open.events.write_all(b"\n")?;
        Ok(())
    }

    fn end_cycle(&mut self, direction: Direction) -> AppResult<()> {
        if let Some(open) = self.open.as_mut() {
            if open.direction == direction {
                flush_pending(open)?;
                open.events.flush()?;
            }
        }
        Ok(())
    }

    fn end_direction(&mut self, direction: Direction) -> AppResult<()> {
        let matches = self
            .open
            .as_ref()
            .is_some_and(|open| open.direction == direction);
        if matches {
            self.close_open()?;
        }
        Ok(())
    }

    fn close_open(&mut self) -> AppResult<()> {
        let Some(mut open) = self.open.take() else {
            return Ok(());
        };
        flush_pending(&mut open)?;
        open.events.flush()?;
        open.events.get_ref().sync_all()?;

        if let Some(dataset) = &open.dataset {
            write_str_attr(dataset, "direction", open.direction.as_str())?;
            dataset
                .new_attr::<u64>()
                .create("num_frames")?
                .write_scalar(&(open.frames_written as u64))?;
            dataset
                .new_attr::<u32>()
                .create("width")?
                .write_scalar(&open.width)?;
            dataset
                .new_attr::<u32>()
                .create("height")?
                .write_scalar(&open.height)?;
            dataset
                .new_attr::<u32>()
                .create("channels")?
                .write_scalar(&open.channels)?;
        }
        tracing::info!(
            direction = %open.direction,
            frames = open.frames_written,
            "direction archives closed"
        );
        *self.recorded.entry(open.direction).or_insert(0) += open.frames_written;
        Ok(())
    }

    fn finalize(&mut self, cancelled: bool) -> AppResult<PathBuf> {
        self.close_open()?;

        let partial = cancelled || self.fault.is_some();
        let metadata = SessionMetadata {
            session_name: self.name.clone(),
            subject_id: self.parameters.session.subject_id.clone(),
            notes: self.parameters.session.notes.clone(),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
            start_time: self.start_time,
            end_time: chrono::Utc::now(),
            partial,
            directions_recorded: self.recorded.keys().copied().collect(),
            parameters: self.parameters.clone(),
        };
        let text = serde_json::to_string_pretty(&metadata)
            .map_err(|e| IsiError::Internal(e.to_string()))?;
        std::fs::write(self.dir.join("metadata.json"), text)?;

        let final_dir = final_session_dir(&self.dir, &self.name);
        std::fs::rename(&self.dir, &final_dir)?;
        tracing::info!(dir = %final_dir.display(), partial, "session finalized");

        match self.fault.take() {
            Some(err) => Err(err),
            None => Ok(final_dir),
        }
    }
}

fn final_session_dir(partial_dir: &Path, name: &str) -> PathBuf {
    let parent = partial_dir.parent().unwrap_or_else(|| Path::new("."));
    let candidate = parent.join(name);
    if !candidate.exists() {
        return candidate;
    }
    // Never clobber an existing session.
    parent.join(format!(
        "{name}_{}",
        chrono::Utc::now().format("%Y%m%d_%H%M%S")
    ))
}

fn create_frames_dataset(
    file: &hdf5::File,
    height: usize,
    width: usize,
    channels: usize,
) -> AppResult<hdf5::Dataset> {
    let chunk_frames = APPEND_CHUNK_FRAMES;
    let dataset = if channels <= 1 {
        file.new_dataset::<u8>()
            .chunk((chunk_frames, height, width))
            .shape((0.., height, width))
            .deflate(4)
            .create("frames")?
    } else {
        file.new_dataset::<u8>()
            .chunk((chunk_frames, height, width, channels))
            .shape((0.., height, width, channels))
            .deflate(4)
            .create("frames")?
    };
    Ok(dataset)
}

fn flush_pending(open: &mut OpenDirection) -> AppResult<()> {
    if open.pending_frames == 0 {
        return Ok(());
    }
    let dataset = open
        .dataset
        .as_ref()
        .ok_or_else(|| IsiError::Internal("flush before first frame".into()))?;
    let k = open.pending_frames;
    let n0 = open.frames_written;
    let height = open.height as usize;
    let width = open.width as usize;

    if open.channels <= 1 {
        dataset.resize((n0 + k, height, width))?;
        let view = ndarray::ArrayView3::from_shape((k, height, width), &open.pending)
            .map_err(|e| IsiError::Internal(e.to_string()))?;
        dataset.write_slice(&view, ndarray::s![n0..n0 + k, .., ..])?;
    } else {
        let channels = open.channels as usize;
        dataset.resize((n0 + k, height, width, channels))?;
        let view =
            ndarray::ArrayView4::from_shape((k, height, width, channels), &open.pending)
                .map_err(|e| IsiError::Internal(e.to_string()))?;
        dataset.write_slice(&view, ndarray::s![n0..n0 + k, .., .., ..])?;
    }

    open.frames_written += k;
    open.pending.clear();
    open.pending_frames = 0;
    Ok(())
}
