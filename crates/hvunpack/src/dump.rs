//! Dump jobs and the bounded persistence queue.
//!
//! A dump job is one triggered snapshot: the ordered segments of the
//! monitored process's address space plus the trigger context. Jobs are
//! handed to a writer thread over a bounded channel; a full queue blocks
//! the producer, which is the event loop with the faulting vCPU still
//! paused, so backpressure pauses the guest instead of dropping data.
//!
//! Each segment buffer is owned by exactly one job; the transfer at
//! enqueue is final.

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::mpsc,
    thread,
};

use hvunpack_core::{MemoryAccess, Pid, Va};
use serde::Serialize;

use crate::{UnpackError, vad::VadType};

/// A captured range of the guest's virtual address space.
#[derive(Debug)]
pub struct MemorySegment {
    /// Virtual base address of the range.
    pub base: Va,

    /// Nominal size of the range in bytes.
    pub va_size: u64,

    /// The type of the backing VAD.
    pub vad_type: VadType,

    /// Protection of the range.
    pub protection: MemoryAccess,

    /// Whether the range is private to the process.
    pub is_private: bool,

    /// Backing file name, if any.
    pub filename: Option<String>,

    /// The captured bytes. May be shorter than `va_size` when parts of the
    /// range were paged out.
    pub data: Vec<u8>,
}

/// One triggered snapshot of a process address space.
#[derive(Debug)]
pub struct DumpJob {
    /// Sequence number, assigned in trigger order.
    pub seq: u64,

    /// The process the snapshot belongs to.
    pub pid: Pid,

    /// Instruction pointer at the triggering fault.
    pub rip: Va,

    /// Virtual address whose execution triggered the dump.
    pub trigger: Va,

    /// The captured segments, in ascending base order.
    pub segments: Vec<MemorySegment>,
}

/// One record of the `.map` sidecar.
#[derive(Serialize)]
struct MapRecord<'a> {
    offset: u64,
    virtual_base: Va,
    size: u64,
    captured: u64,
    protection: String,
    vadtype: VadType,
    isprivate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    filename: Option<&'a String>,
    rip: Va,
}

/// The producer side of the dump queue.
pub struct DumpSender {
    tx: mpsc::SyncSender<DumpJob>,
}

impl DumpSender {
    /// Queues a job for persistence, blocking while the queue is full.
    pub fn enqueue(&self, job: DumpJob) -> Result<(), UnpackError> {
        tracing::debug!(
            seq = job.seq,
            pid = %job.pid,
            segments = job.segments.len(),
            "queueing dump"
        );

        self.tx.send(job).map_err(|_| UnpackError::QueueClosed)
    }
}

/// Handle to the writer thread.
pub struct DumpWriter {
    thread: thread::JoinHandle<()>,
}

impl DumpWriter {
    /// Waits for the writer to drain the queue and exit.
    ///
    /// Every `DumpSender` must be dropped first, or this blocks forever.
    pub fn finish(self) {
        if self.thread.join().is_err() {
            tracing::error!("dump writer thread panicked");
        }
    }
}

/// Spawns the writer thread behind a bounded queue.
pub fn spawn_writer(output_dir: impl Into<PathBuf>, capacity: usize) -> (DumpSender, DumpWriter) {
    let output_dir = output_dir.into();
    let (tx, rx) = mpsc::sync_channel::<DumpJob>(capacity);

    let thread = thread::spawn(move || {
        while let Ok(job) = rx.recv() {
            if let Err(err) = persist(&output_dir, &job) {
                tracing::error!(seq = job.seq, pid = %job.pid, ?err, "failed to persist dump");
            }
        }
    });

    (DumpSender { tx }, DumpWriter { thread })
}

/// Writes one job to disk.
///
/// `<seq>.<pid>.dump` holds the concatenated segment bytes; jobs with more
/// than one segment also get a `<seq>.<pid>.map` sidecar describing each
/// segment's place in the concatenation.
fn persist(output_dir: &Path, job: &DumpJob) -> Result<(), std::io::Error> {
    let stem = format!("{:04}.{}", job.seq, job.pid);

    let dump_path = output_dir.join(format!("{stem}.dump"));
    let mut dump = BufWriter::new(File::create(&dump_path)?);
    for segment in &job.segments {
        dump.write_all(&segment.data)?;
    }
    dump.flush()?;

    if job.segments.len() > 1 {
        let map_path = output_dir.join(format!("{stem}.map"));
        let mut map = BufWriter::new(File::create(&map_path)?);

        let mut offset = 0u64;
        for segment in &job.segments {
            let record = MapRecord {
                offset,
                virtual_base: segment.base,
                size: segment.va_size,
                captured: segment.data.len() as u64,
                protection: segment.protection.to_string(),
                vadtype: segment.vad_type,
                isprivate: segment.is_private,
                filename: segment.filename.as_ref(),
                rip: job.rip,
            };

            serde_json::to_writer(&mut map, &record)?;
            map.write_all(b"\n")?;

            offset += segment.data.len() as u64;
        }
        map.flush()?;
    }

    tracing::info!(
        seq = job.seq,
        pid = %job.pid,
        rip = %job.rip,
        path = %dump_path.display(),
        "dump persisted"
    );

    Ok(())
}
