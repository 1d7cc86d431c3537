use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Access rights of a guest frame.
    ///
    /// These flags double as the trap vocabulary: a right missing from a
    /// frame's SLAT entry faults into the detector, so `RWX` means no
    /// trap fires and an armed frame carries the complement of the rights
    /// being watched.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MemoryAccess: u8 {
        /// The frame may be read.
        const R = 1 << 0;

        /// The frame may be written.
        const W = 1 << 1;

        /// The frame may be fetched for execution.
        const X = 1 << 2;

        /// Read and write.
        const RW = Self::R.bits() | Self::W.bits();

        /// Read and execute.
        const RX = Self::R.bits() | Self::X.bits();

        /// Unrestricted access.
        const RWX = Self::R.bits() | Self::W.bits() | Self::X.bits();
    }
}

impl std::fmt::Display for MemoryAccess {
    /// Formats the rights `ls`-style, e.g. `rw-` or `--x`.
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mark = |right, letter| if self.contains(right) { letter } else { '-' };

        write!(
            f,
            "{}{}{}",
            mark(MemoryAccess::R, 'r'),
            mark(MemoryAccess::W, 'w'),
            mark(MemoryAccess::X, 'x'),
        )
    }
}
