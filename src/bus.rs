//! Shared-memory frame bus for preview consumers.
//!
//! A pair of single-producer ring buffers backed by memory-mapped files: one
//! carries camera frames (header + pixels), the other stimulus metadata
//! (header only; stimulus pixels live in the pre-generated library and are
//! addressed by index). The capture thread publishes into both on every
//! camera frame; preview/GUI readers poll at their own pace.
//!
//! # Loss model
//!
//! The writer never blocks and never waits for readers: each publish
//! overwrites the oldest slot. Readers that fall behind skip forward and see
//! a prefix-closed subsequence of frames; a `drops` counter records slots
//! overwritten before the primary consumer read them. This is acceptable
//! because the bus feeds displays only; the record path writes its own copy
//! straight to the recorder.
//!
//! # Tearing
//!
//! Each slot carries a seqlock-style generation counter: the writer stores
//! `2*index + 1` before copying and `2*index + 2` after. A reader accepts a
//! slot only when the counter reads the same even value before and after its
//! copy, so a frame whose header and payload disagree is never observed.
//!
//! # Thread Safety
//!
//! - **Writes**: single producer (the capture thread); no locks.
//! - **Reads**: lock-free; any number of readers, each with its own cursor.
//! - **Concurrent read/write**: safe via the per-slot counter protocol.

use memmap2::{MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{AppResult, IsiError};
use crate::stimulus::{Direction, StimulusHeader};

/// Magic number for ring file validation
const MAGIC: u64 = 0x151F_0B05_0000_0001;

/// Size of the ring header in bytes (two cache lines)
const RING_HEADER_SIZE: usize = 128;

/// Size of the per-slot header in bytes, generation counter included
const SLOT_HEADER_SIZE: usize = 64;

/// Sentinel for "no stimulus frame" (baseline / between phases)
pub const NO_STIMULUS_FRAME: u64 = u64::MAX;

/// Ring file header.
///
/// `#[repr(C)]` keeps the layout predictable for out-of-process readers.
///
/// Layout (128 bytes total):
/// - magic: u64
/// - slot_count: u64
/// - slot_size: u64
/// - head: AtomicU64 (slots published since creation)
/// - read_cursor: AtomicU64 (primary consumer position, drops accounting)
/// - drops: AtomicU64
/// - _padding: [u8; 80]
#[repr(C)]
struct RingHeader {
    magic: u64,
    slot_count: u64,
    slot_size: u64,
    head: AtomicU64,
    read_cursor: AtomicU64,
    drops: AtomicU64,
    _padding: [u8; 80],
}

const _: () = assert!(
    std::mem::size_of::<RingHeader>() == RING_HEADER_SIZE,
    "RingHeader size must equal RING_HEADER_SIZE (128 bytes)"
);

/// Packed per-slot metadata, written after the slot's generation counter.
///
/// One struct serves both rings; `kind` discriminates. 56 bytes, which with
/// the leading u64 counter fills the 64-byte slot header.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SlotMeta {
    /// Payload bytes following the slot header.
    pub len: u32,
    /// [`slot_kind`] discriminant.
    pub kind: u32,
    /// Capture / presentation timestamp.
    pub timestamp_us: u64,
    /// Camera frame index, or stimulus frame index for metadata slots.
    pub frame_index: u64,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    _pad: u32,
    /// Direction code for stimulus slots ([`direction_code`]).
    pub aux_index: u64,
    /// Bar angle in degrees for stimulus slots.
    pub aux_angle: f64,
}

const _: () = assert!(
    std::mem::size_of::<SlotMeta>() + 8 == SLOT_HEADER_SIZE,
    "SlotMeta plus the generation counter must fill the 64-byte slot header"
);

/// Slot kind discriminants.
pub mod slot_kind {
    /// Camera frame: payload carries the pixels.
    pub const CAMERA: u32 = 0;
    /// Stimulus frame metadata: no payload.
    pub const STIMULUS: u32 = 1;
}

/// Direction wire codes for stimulus slots.
fn direction_code(direction: Direction) -> u64 {
    match direction {
        Direction::LR => 0,
        Direction::RL => 1,
        Direction::TB => 2,
        Direction::BT => 3,
    }
}

fn direction_from_code(code: u64) -> Option<Direction> {
    match code {
        0 => Some(Direction::LR),
        1 => Some(Direction::RL),
        2 => Some(Direction::TB),
        3 => Some(Direction::BT),
        _ => None,
    }
}

/// One single-producer shared-memory slot ring.
///
/// # Safety
///
/// The struct holds raw pointers into the memory mapping. They stay valid
/// because the mapping is owned by the same struct and never remapped.
/// Writers and readers communicate exclusively through the atomic counters
/// with the orderings documented on [`FrameRing::publish`] and
/// [`RingReader::poll`].
pub struct FrameRing {
    /// Keeps the mapping alive; never accessed directly after construction.
    #[allow(dead_code)]
    mmap: MmapMut,
    /// SAFETY: points to the start of mmap, valid while mmap lives.
    header: *const RingHeader,
    /// SAFETY: points RING_HEADER_SIZE bytes into mmap.
    slots_ptr: *mut u8,
    slot_count: u64,
    slot_size: u64,
}

// SAFETY: all shared mutation goes through atomics in the mapped header and
// the per-slot counters; the raw pointers are only dereferenced with the
// documented ordering protocol.
unsafe impl Send for FrameRing {}
unsafe impl Sync for FrameRing {}

impl FrameRing {
    /// Create a fresh ring at `path` with `slot_count` slots able to carry
    /// payloads up to `payload_capacity` bytes.
    pub fn create(path: &Path, slot_count: usize, payload_capacity: usize) -> AppResult<Arc<Self>> {
        if slot_count < 3 {
            return Err(IsiError::Configuration(
                "frame ring needs at least 3 slots".into(),
            ));
        }
        // Keep every slot 8-aligned so the counter and meta loads are aligned.
        let slot_size = (SLOT_HEADER_SIZE + payload_capacity + 7) / 8 * 8;
        let total_size = RING_HEADER_SIZE + slot_count * slot_size;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(total_size as u64)?;

        // SAFETY: the file was just created with the required length.
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };

        let header = mmap.as_mut_ptr() as *mut RingHeader;
        // SAFETY: the mapping is at least RING_HEADER_SIZE bytes.
        unsafe {
            (*header).magic = MAGIC;
            (*header).slot_count = slot_count as u64;
            (*header).slot_size = slot_size as u64;
            (*header).head = AtomicU64::new(0);
            (*header).read_cursor = AtomicU64::new(0);
            (*header).drops = AtomicU64::new(0);
            (*header)._padding.fill(0);
        }

        // SAFETY: total_size includes RING_HEADER_SIZE, so the offset is in
        // bounds.
        let slots_ptr = unsafe { mmap.as_mut_ptr().add(RING_HEADER_SIZE) };

        Ok(Arc::new(Self {
            mmap,
            header,
            slots_ptr,
            slot_count: slot_count as u64,
            slot_size: slot_size as u64,
        }))
    }

    /// Attach to a ring created by another process.
    pub fn open(path: &Path) -> AppResult<Arc<Self>> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        // SAFETY: mapping a file created by `create`.
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        let header = mmap.as_mut_ptr() as *mut RingHeader;
        // SAFETY: a valid ring file is at least RING_HEADER_SIZE bytes.
        let (magic, slot_count, slot_size) =
            unsafe { ((*header).magic, (*header).slot_count, (*header).slot_size) };
        if magic != MAGIC {
            return Err(IsiError::CorruptArchive {
                path: path.to_path_buf(),
                detail: format!("bad ring magic 0x{magic:016X}"),
            });
        }
        let slots_ptr = unsafe { mmap.as_mut_ptr().add(RING_HEADER_SIZE) };
        Ok(Arc::new(Self {
            mmap,
            header,
            slots_ptr,
            slot_count,
            slot_size,
        }))
    }

    fn header(&self) -> &RingHeader {
        // SAFETY: header points into the live mapping.
        unsafe { &*self.header }
    }

    /// Slots published since creation.
    pub fn published(&self) -> u64 {
        self.header().head.load(Ordering::Acquire)
    }

    /// Slots overwritten before the primary consumer read them.
    pub fn drops(&self) -> u64 {
        self.header().drops.load(Ordering::Relaxed)
    }

    pub fn payload_capacity(&self) -> usize {
        self.slot_size as usize - SLOT_HEADER_SIZE
    }

    fn slot_ptr(&self, slot: u64) -> *mut u8 {
        debug_assert!(slot < self.slot_count);
        // SAFETY: slot < slot_count, so the offset stays inside the mapping.
        unsafe { self.slots_ptr.add((slot * self.slot_size) as usize) }
    }

    fn slot_seq(&self, slot: u64) -> &AtomicU64 {
        // SAFETY: the first 8 bytes of every slot hold the generation
        // counter; the pointer is 8-aligned by construction.
        unsafe { &*(self.slot_ptr(slot) as *const AtomicU64) }
    }

    /// Publish one slot. Never blocks; overwrites the oldest slot when the
    /// ring is full and charges `drops` if the primary consumer had not read
    /// it yet.
    pub fn publish(&self, mut meta: SlotMeta, payload: &[u8]) -> AppResult<()> {
        if payload.len() > self.payload_capacity() {
            return Err(IsiError::Internal(format!(
                "payload of {} bytes exceeds ring slot capacity {}",
                payload.len(),
                self.payload_capacity()
            )));
        }
        meta.len = payload.len() as u32;

        let header = self.header();
        let index = header.head.load(Ordering::Relaxed);
        let slot = index % self.slot_count;

        if index >= self.slot_count {
            let cursor = header.read_cursor.load(Ordering::Relaxed);
            if index - cursor >= self.slot_count {
                header.drops.fetch_add(1, Ordering::Relaxed);
            }
        }

        let seq = self.slot_seq(slot);
        // Odd marks the write in progress. The AcqRel exchange keeps the
        // copy below from floating above the marker.
        seq.swap(2 * index + 1, Ordering::AcqRel);

        let slot_ptr = self.slot_ptr(slot);
        // SAFETY: meta fits in the slot header (compile-time assert above)
        // and payload length was checked against the slot capacity.
        unsafe {
            std::ptr::write_unaligned(slot_ptr.add(8) as *mut SlotMeta, meta);
            std::ptr::copy_nonoverlapping(
                payload.as_ptr(),
                slot_ptr.add(SLOT_HEADER_SIZE),
                payload.len(),
            );
        }

        // Even value encodes the publish index so readers can detect laps.
        seq.store(2 * index + 2, Ordering::Release);
        header.head.store(index + 1, Ordering::Release);
        Ok(())
    }

    /// A new reader positioned at the oldest available slot.
    pub fn reader(self: &Arc<Self>) -> RingReader {
        let head = self.published();
        RingReader {
            ring: Arc::clone(self),
            next: head.saturating_sub(self.slot_count),
        }
    }
}

/// Cursor over a [`FrameRing`]. Tolerant of loss: falling behind skips
/// forward to the oldest slot still present.
pub struct RingReader {
    ring: Arc<FrameRing>,
    next: u64,
}

impl RingReader {
    /// The next unread slot, or `None` when caught up.
    pub fn poll(&mut self) -> Option<(SlotMeta, Vec<u8>)> {
        loop {
            let head = self.ring.published();
            if self.next >= head {
                return None;
            }
            let oldest = head.saturating_sub(self.ring.slot_count);
            if self.next < oldest {
                self.next = oldest;
            }

            let index = self.next;
            match self.try_read(index) {
                Some(entry) => {
                    self.next = index + 1;
                    let header = self.ring.header();
                    // Primary-consumer position for the writer's drops
                    // accounting; last-writer-wins is fine, this is a gauge.
                    header.read_cursor.store(self.next, Ordering::Release);
                    return Some(entry);
                }
                // Slot was overwritten mid-read; skip it.
                None => self.next = index + 1,
            }
        }
    }

    /// Jump to the most recent slot, discarding anything older.
    pub fn latest(&mut self) -> Option<(SlotMeta, Vec<u8>)> {
        let head = self.ring.published();
        self.next = head.saturating_sub(1);
        self.poll()
    }

    fn try_read(&self, index: u64) -> Option<(SlotMeta, Vec<u8>)> {
        let ring = &self.ring;
        let slot = index % ring.slot_count;
        let expected = 2 * index + 2;

        let seq = ring.slot_seq(slot);
        if seq.load(Ordering::Acquire) != expected {
            return None;
        }

        let slot_ptr = ring.slot_ptr(slot);
        // SAFETY: the slot header always contains a SlotMeta written by
        // `publish`; validity of the bytes is confirmed by the counter
        // re-check below.
        let meta = unsafe { std::ptr::read_unaligned(slot_ptr.add(8) as *const SlotMeta) };
        let len = (meta.len as usize).min(ring.payload_capacity());
        // SAFETY: len is bounded by the slot capacity.
        let payload = unsafe {
            std::slice::from_raw_parts(slot_ptr.add(SLOT_HEADER_SIZE), len).to_vec()
        };

        // Loads must complete before the counter re-check.
        fence(Ordering::SeqCst);
        if seq.load(Ordering::Acquire) != expected {
            return None;
        }
        Some((meta, payload))
    }
}

/// Camera-frame header as published on the bus.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraFrameMeta {
    pub timestamp_us: u64,
    pub frame_index: u64,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
}

/// The pair of rings the acquisition engine publishes into.
pub struct SharedFrameBus {
    camera: Arc<FrameRing>,
    stimulus: Arc<FrameRing>,
}

impl SharedFrameBus {
    /// Create both rings under `shm_dir`. `camera_payload_capacity` must
    /// cover the largest camera frame that will be published.
    pub fn create(
        shm_dir: &Path,
        slot_count: usize,
        camera_payload_capacity: usize,
    ) -> AppResult<Self> {
        let camera = FrameRing::create(
            &shm_dir.join("camera_frames.ring"),
            slot_count,
            camera_payload_capacity,
        )?;
        let stimulus = FrameRing::create(&shm_dir.join("stimulus_meta.ring"), slot_count, 0)?;
        tracing::info!(
            dir = %shm_dir.display(),
            slots = slot_count,
            camera_payload_capacity,
            "shared frame bus created"
        );
        Ok(Self { camera, stimulus })
    }

    /// Publish a camera frame (pixels copied into the ring).
    pub fn publish_camera(&self, meta: CameraFrameMeta, pixels: &[u8]) -> AppResult<()> {
        self.camera.publish(
            SlotMeta {
                len: 0,
                kind: slot_kind::CAMERA,
                timestamp_us: meta.timestamp_us,
                frame_index: meta.frame_index,
                width: meta.width,
                height: meta.height,
                channels: meta.channels,
                _pad: 0,
                aux_index: 0,
                aux_angle: 0.0,
            },
            pixels,
        )
    }

    /// Publish the stimulus header paired with a camera frame. `None`
    /// publishes a blank marker (baseline / between phases).
    pub fn publish_stimulus(&self, header: Option<StimulusHeader>) -> AppResult<()> {
        let meta = match header {
            Some(h) => SlotMeta {
                len: 0,
                kind: slot_kind::STIMULUS,
                timestamp_us: h.timestamp_us,
                frame_index: h.frame_index,
                width: 0,
                height: 0,
                channels: 0,
                _pad: 0,
                aux_index: direction_code(h.direction),
                aux_angle: h.bar_angle_deg,
            },
            None => SlotMeta {
                len: 0,
                kind: slot_kind::STIMULUS,
                timestamp_us: 0,
                frame_index: NO_STIMULUS_FRAME,
                width: 0,
                height: 0,
                channels: 0,
                _pad: 0,
                aux_index: u64::MAX,
                aux_angle: 0.0,
            },
        };
        self.stimulus.publish(meta, &[])
    }

    /// Reader over the camera ring.
    pub fn subscribe_camera(&self) -> CameraReader {
        CameraReader {
            inner: self.camera.reader(),
        }
    }

    /// Reader over the stimulus metadata ring.
    pub fn subscribe_stimulus(&self) -> StimulusReader {
        StimulusReader {
            inner: self.stimulus.reader(),
        }
    }

    pub fn camera_drops(&self) -> u64 {
        self.camera.drops()
    }

    pub fn camera_published(&self) -> u64 {
        self.camera.published()
    }
}

/// Typed reader over the camera ring.
pub struct CameraReader {
    inner: RingReader,
}

impl CameraReader {
    pub fn poll(&mut self) -> Option<(CameraFrameMeta, Vec<u8>)> {
        let (meta, pixels) = self.inner.poll()?;
        Some((
            CameraFrameMeta {
                timestamp_us: meta.timestamp_us,
                frame_index: meta.frame_index,
                width: meta.width,
                height: meta.height,
                channels: meta.channels,
            },
            pixels,
        ))
    }

    pub fn latest(&mut self) -> Option<(CameraFrameMeta, Vec<u8>)> {
        let (meta, pixels) = self.inner.latest()?;
        Some((
            CameraFrameMeta {
                timestamp_us: meta.timestamp_us,
                frame_index: meta.frame_index,
                width: meta.width,
                height: meta.height,
                channels: meta.channels,
            },
            pixels,
        ))
    }
}

/// Typed reader over the stimulus metadata ring. Blank-phase markers decode
/// as `None` headers.
pub struct StimulusReader {
    inner: RingReader,
}

impl StimulusReader {
    pub fn poll(&mut self) -> Option<Option<StimulusHeader>> {
        let (meta, _) = self.inner.poll()?;
        if meta.frame_index == NO_STIMULUS_FRAME {
            return Some(None);
        }
        let direction = direction_from_code(meta.aux_index)?;
        Some(Some(StimulusHeader {
            direction,
            frame_index: meta.frame_index,
            bar_angle_deg: meta.aux_angle,
            timestamp_us: meta.timestamp_us,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn ring(slots: usize, capacity: usize) -> (tempfile::TempDir, Arc<FrameRing>) {
        let dir = tempfile::tempdir().unwrap();
        let ring = FrameRing::create(&dir.path().join("test.ring"), slots, capacity).unwrap();
        (dir, ring)
    }

    fn meta(frame_index: u64) -> SlotMeta {
        SlotMeta {
            len: 0,
            kind: slot_kind::CAMERA,
            timestamp_us: frame_index * 1000,
            frame_index,
            width: 4,
            height: 2,
            channels: 1,
            _pad: 0,
            aux_index: 0,
            aux_angle: 0.0,
        }
    }

    #[test]
    fn test_publish_then_poll() {
        let (_dir, ring) = ring(4, 64);
        let mut reader = ring.reader();
        assert!(reader.poll().is_none());

        ring.publish(meta(0), b"abcd").unwrap();
        let (m, payload) = reader.poll().unwrap();
        assert_eq!(m.frame_index, 0);
        assert_eq!(payload, b"abcd");
        assert!(reader.poll().is_none());
    }

    #[test]
    fn test_writer_overwrites_and_reader_skips() {
        let (_dir, ring) = ring(3, 64);
        let mut reader = ring.reader();
        for i in 0..10 {
            ring.publish(meta(i), format!("p{i}").as_bytes()).unwrap();
        }
        // Only the newest slot_count frames remain; the reader sees a suffix.
        let mut seen = Vec::new();
        while let Some((m, _)) = reader.poll() {
            seen.push(m.frame_index);
        }
        assert_eq!(seen, vec![7, 8, 9]);
        // Everything before the reader attached or skipped counts as drops.
        assert!(ring.drops() > 0);
    }

    #[test]
    fn test_oversized_payload_is_rejected() {
        let (_dir, ring) = ring(3, 16);
        let err = ring.publish(meta(0), &[0u8; 64]).unwrap_err();
        assert_eq!(err.code(), "internal");
    }

    #[test]
    fn test_no_tearing_under_concurrent_writes() {
        use std::sync::atomic::AtomicBool;

        let (_dir, ring) = ring(4, 256);
        let done = Arc::new(AtomicBool::new(false));
        let writer_ring = Arc::clone(&ring);
        let writer_done = Arc::clone(&done);
        let writer = thread::spawn(move || {
            for i in 0..5_000u64 {
                // Payload derived from the frame index lets the reader verify
                // header/payload agreement.
                let payload = vec![(i % 251) as u8; 32];
                writer_ring.publish(meta(i), &payload).unwrap();
            }
            writer_done.store(true, Ordering::Release);
        });

        let mut reader = ring.reader();
        let mut observed = 0usize;
        let mut last_index = None;
        loop {
            match reader.poll() {
                Some((m, payload)) => {
                    // Payload must always agree with its header.
                    assert!(payload.iter().all(|&b| b == (m.frame_index % 251) as u8));
                    if let Some(prev) = last_index {
                        assert!(m.frame_index > prev, "indices must move forward");
                    }
                    last_index = Some(m.frame_index);
                    observed += 1;
                }
                None if done.load(Ordering::Acquire) => break,
                None => std::hint::spin_loop(),
            }
        }
        writer.join().unwrap();
        assert!(observed > 0);
        assert_eq!(last_index, Some(4_999));
    }

    #[test]
    fn test_bus_pairs_camera_and_stimulus() {
        let dir = tempfile::tempdir().unwrap();
        let bus = SharedFrameBus::create(dir.path(), 4, 64).unwrap();
        let mut cam = bus.subscribe_camera();
        let mut stim = bus.subscribe_stimulus();

        bus.publish_camera(
            CameraFrameMeta {
                timestamp_us: 42,
                frame_index: 0,
                width: 4,
                height: 2,
                channels: 1,
            },
            &[1u8; 8],
        )
        .unwrap();
        bus.publish_stimulus(Some(StimulusHeader {
            direction: Direction::LR,
            frame_index: 7,
            bar_angle_deg: -12.5,
            timestamp_us: 42,
        }))
        .unwrap();
        bus.publish_stimulus(None).unwrap();

        let (m, pixels) = cam.poll().unwrap();
        assert_eq!((m.timestamp_us, pixels.len()), (42, 8));
        let header = stim.poll().unwrap().unwrap();
        assert_eq!(header.direction, Direction::LR);
        assert_eq!(header.frame_index, 7);
        assert_eq!(header.bar_angle_deg, -12.5);
        assert_eq!(stim.poll().unwrap(), None); // blank marker
    }

    #[test]
    fn test_open_attaches_to_existing_ring() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.ring");
        let ring = FrameRing::create(&path, 4, 64).unwrap();
        ring.publish(meta(3), b"xyz").unwrap();

        let attached = FrameRing::open(&path).unwrap();
        assert_eq!(attached.published(), 1);
        let mut reader = attached.reader();
        let (m, payload) = reader.poll().unwrap();
        assert_eq!(m.frame_index, 3);
        assert_eq!(payload, b"xyz");
    }
}
