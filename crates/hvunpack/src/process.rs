//! Monitored process tracking.
//!
//! The tracker resolves the initial target by walking the kernel's
//! active-process list once at startup, and afterwards reacts to process
//! creation and exit events delivered by the driver. With follow-children
//! enabled, children of any tracked process are enlisted with the same
//! filter policy.

use std::collections::HashMap;

use hvunpack_core::{PAGE_MASK, Pa, Pid, Va, Vmi, VmiDriver, VmiError, profile::Profile};

use crate::{Target, UnpackError};

/// Upper bound on active-process list iteration, against corrupt links.
const PROCESS_LIST_MAX: usize = 65536;

/// One monitored guest process.
#[derive(Debug, Clone)]
pub struct Process {
    /// Guest process identifier.
    pub pid: Pid,

    /// Kernel address of the process descriptor.
    pub object: Va,

    /// Top-level page-table root.
    pub root: Pa,

    /// Root node of the VAD tree.
    pub vad_root: Va,

    /// Base address of the main image.
    pub image_base: Va,

    /// Short image file name.
    pub name: String,

    /// Parent link, set when enlisted via follow-children.
    pub parent: Option<Pid>,
}

/// Reads one process descriptor through the profile.
pub fn read_process<Driver>(
    vmi: &Vmi<Driver>,
    profile: &Profile,
    kernel_root: Pa,
    object: Va,
) -> Result<Process, VmiError>
where
    Driver: VmiDriver,
{
    let offsets = &profile.process;

    let pid = vmi.read_u64(kernel_root, object + offsets.unique_process_id)?;
    let table_base = vmi.read_u64(kernel_root, object + offsets.directory_table_base)?;
    let vad_root = vmi.read_va(kernel_root, object + offsets.vad_root)?;
    let image_base = vmi.read_va(kernel_root, object + offsets.section_base_address)?;

    // The image file name is a fixed 15-byte array, not NUL-guaranteed.
    let name_bytes = vmi.read_vec(kernel_root, object + offsets.image_file_name, 15)?;
    let name_len = name_bytes.iter().position(|&b| b == 0).unwrap_or(15);
    let name = String::from_utf8_lossy(&name_bytes[..name_len]).into_owned();

    Ok(Process {
        pid: Pid(pid as u32),
        object,
        root: Pa(table_base & PAGE_MASK),
        vad_root,
        image_base,
        name,
        parent: None,
    })
}

/// Walks the active-process list and returns the first process matching
/// the target.
pub fn resolve_target<Driver>(
    vmi: &Vmi<Driver>,
    profile: &Profile,
    kernel_root: Pa,
    target: &Target,
) -> Result<Process, UnpackError>
where
    Driver: VmiDriver,
{
    let head = profile.kernel.active_process_head;
    let links_offset = profile.process.active_process_links;

    // LIST_ENTRY.Flink is the first field of the links.
    let mut entry = vmi.read_va(kernel_root, head)?;

    for _ in 0..PROCESS_LIST_MAX {
        if entry == head || entry.is_null() {
            break;
        }

        let object = entry - links_offset;
        match read_process(vmi, profile, kernel_root, object) {
            Ok(process) => {
                let matched = match target {
                    Target::Pid(pid) => process.pid == *pid,
                    Target::Name(name) => process.name.eq_ignore_ascii_case(name),
                };

                if matched {
                    return Ok(process);
                }
            }
            Err(err) => {
                tracing::warn!(%object, ?err, "skipping unreadable process descriptor");
            }
        }

        entry = vmi.read_va(kernel_root, entry)?;
    }

    let target = match target {
        Target::Pid(pid) => pid.to_string(),
        Target::Name(name) => name.clone(),
    };
    Err(UnpackError::TargetNotFound(target))
}

/// The set of processes in scope for detection.
#[derive(Debug)]
pub struct ProcessTracker {
    processes: HashMap<Pid, Process>,
    follow_children: bool,
}

impl ProcessTracker {
    /// Creates an empty tracker.
    pub fn new(follow_children: bool) -> Self {
        Self {
            processes: HashMap::new(),
            follow_children,
        }
    }

    /// Enlists a process.
    pub fn insert(&mut self, process: Process) {
        tracing::info!(
            pid = %process.pid,
            name = %process.name,
            root = %process.root,
            "tracking process"
        );
        self.processes.insert(process.pid, process);
    }

    /// Returns a tracked process by PID.
    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.processes.get(&pid)
    }

    /// Returns the tracked process owning a translation root.
    pub fn by_root(&self, root: Pa) -> Option<&Process> {
        self.processes.values().find(|process| process.root == root)
    }

    /// Checks whether a child of `parent` should be enlisted.
    pub fn should_follow(&self, parent: Pid) -> bool {
        self.follow_children && self.processes.contains_key(&parent)
    }

    /// Removes a process from scope.
    pub fn remove(&mut self, pid: Pid) -> Option<Process> {
        self.processes.remove(&pid)
    }

    /// Checks whether any process is still tracked.
    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}
