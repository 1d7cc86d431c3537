//! Hypervisor backend selection.
//!
//! The engine consumes the [`VmiDriver`] trait; the concrete driver is a
//! deployment concern. This module is the single seam where a backend
//! (e.g. a Xen altp2m driver) plugs in. Each backend lives in its own
//! crate and registers here behind a feature gate.

use hvunpack_core::VmiDriver;

/// An error that can occur while connecting to the hypervisor.
#[derive(Debug)]
pub struct BackendError(String);

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for BackendError {}

/// Connects to the named virtual machine.
pub fn connect(vm: &str) -> Result<Box<dyn VmiDriver>, BackendError> {
    Err(BackendError(format!(
        "no hypervisor backend was compiled into this build; \
         cannot attach to '{vm}' (rebuild with a driver feature enabled)"
    )))
}
