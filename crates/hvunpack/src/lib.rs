//! Hypervisor-assisted generic unpacker.
//!
//! Observes an untrusted guest process from outside the VM and captures a
//! snapshot of its user-mode address space each time the process executes
//! memory it previously wrote (a write-then-execute transition). No agent
//! runs inside the guest.
//!
//! The engine is driven by second-level (SLAT) page-fault events delivered
//! through the [`hvunpack_core::VmiDriver`] boundary:
//!
//! - [`mirror`] shadows the guest page tables and tracks per-page state,
//! - [`traps`] arms and re-arms the SLAT access traps,
//! - [`classify`] decides which pages are interesting,
//! - [`wx`] is the per-page write-then-execute state machine,
//! - [`vad`] walks the guest's VAD tree into memory segments,
//! - [`dump`] persists captured snapshots on a writer thread,
//! - [`process`] tracks the monitored processes,
//! - [`session`] ties everything together in the event loop.

pub mod classify;
mod config;
pub mod dump;
mod error;
pub mod mirror;
pub mod process;
pub mod session;
pub mod traps;
pub mod vad;
pub mod wx;

pub use self::{
    config::{Target, UnpackConfig},
    error::UnpackError,
    session::{ShutdownHandle, Unpacker},
};
