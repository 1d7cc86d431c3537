use crate::{Pa, Va};

/// An error that can occur while introspecting the guest.
#[derive(thiserror::Error, Debug)]
pub enum VmiError {
    /// An error occurred in the VMI driver.
    #[error(transparent)]
    Driver(Box<dyn std::error::Error>),

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A guest-virtual address is not mapped by the guest page tables.
    #[error("Page not mapped ({:?}, len: {})", .0[0], .0.len())]
    NotMapped(PageFaults),

    /// Waiting for an event timed out.
    #[error("Operation timed out.")]
    Timeout,

    /// The connection to the hypervisor was lost.
    #[error("Introspection connection lost.")]
    ConnectionLost,

    /// Out of bounds.
    #[error("Out of bounds")]
    OutOfBounds,

    /// Other error.
    #[error("{0}")]
    Other(&'static str),
}

/// A failed guest page-table translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageFault {
    /// The virtual address that could not be translated.
    pub address: Va,

    /// The root of the page table hierarchy.
    pub root: Pa,
}

/// A collection of page faults.
pub type PageFaults = smallvec::SmallVec<[PageFault; 1]>;

impl From<(Va, Pa)> for PageFault {
    fn from((address, root): (Va, Pa)) -> Self {
        Self { address, root }
    }
}

impl VmiError {
    /// Creates a new page fault error.
    pub fn page_fault(pf: impl Into<PageFault>) -> Self {
        Self::NotMapped(smallvec::smallvec![pf.into()])
    }

    /// Creates a new page fault error with multiple page faults.
    pub fn page_faults(pfs: impl IntoIterator<Item = PageFault>) -> Self {
        Self::NotMapped(pfs.into_iter().collect())
    }
}
