use std::path::PathBuf;

use hvunpack_core::Pid;

use crate::classify::FilterPolicy;

/// The process the unpacker attaches to.
#[derive(Debug, Clone)]
pub enum Target {
    /// A process selected by its identifier.
    Pid(Pid),

    /// A process selected by its image file name.
    Name(String),
}

/// Immutable configuration for one unpacking run.
///
/// Built once by the caller and threaded through the component
/// constructors.
#[derive(Debug, Clone)]
pub struct UnpackConfig {
    /// Directory the dump artifacts are written to.
    pub output_dir: PathBuf,

    /// The process to monitor.
    pub target: Target,

    /// Whether child processes are enlisted as they are created.
    pub follow_children: bool,

    /// Which page categories participate beyond code and unknown pages.
    pub filter: FilterPolicy,

    /// Capacity of the bounded dump queue.
    pub queue_capacity: usize,

    /// Maximum number of segments captured per dump.
    pub max_segments: usize,
}

impl UnpackConfig {
    /// Default capacity of the dump queue.
    pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

    /// Default segment cap per dump.
    pub const DEFAULT_MAX_SEGMENTS: usize = 1024;

    /// Creates a configuration with default limits.
    pub fn new(output_dir: impl Into<PathBuf>, target: Target) -> Self {
        Self {
            output_dir: output_dir.into(),
            target,
            follow_children: false,
            filter: FilterPolicy::default(),
            queue_capacity: Self::DEFAULT_QUEUE_CAPACITY,
            max_segments: Self::DEFAULT_MAX_SEGMENTS,
        }
    }
}
