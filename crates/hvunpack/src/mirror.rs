//! The paging mirror: per-page state for every monitored process.
//!
//! The mirror is authoritative for "which frame backs this virtual page
//! right now". Records are reconciled lazily against a fresh page-table
//! walk on every fault, because packers routinely remap pages under a
//! stable virtual address.

use std::collections::HashMap;

use hvunpack_core::{Gfn, Pid, Va};

use crate::{classify::PageCategory, wx::WxState};

/// Per-page tracking state.
///
/// Keyed by `(process, virtual page)`; the same physical frame mapped
/// elsewhere gets its own record.
#[derive(Debug)]
pub struct PageRecord {
    /// Guest frame currently backing the page.
    pub gfn: Gfn,

    /// Category assigned at classification time.
    pub category: PageCategory,

    /// Write-then-execute state.
    pub state: WxState,

    /// Incremented on every observed write; distinguishes unpack layers.
    pub generation: u64,
}

/// Shadow of the per-process page state.
#[derive(Debug, Default)]
pub struct PagingMirror {
    records: HashMap<(Pid, Va), PageRecord>,
}

impl PagingMirror {
    /// Creates an empty mirror.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the record for a page, if one exists.
    pub fn record(&self, pid: Pid, page: Va) -> Option<&PageRecord> {
        self.records.get(&(pid, page))
    }

    /// Returns the record for a page, creating it in
    /// [`WxState::Clean`] if absent, and reconciling the backing frame.
    pub fn record_mut(
        &mut self,
        pid: Pid,
        page: Va,
        gfn: Gfn,
        category: PageCategory,
    ) -> &mut PageRecord {
        let record = self.records.entry((pid, page)).or_insert_with(|| PageRecord {
            gfn,
            category,
            state: WxState::Clean,
            generation: 0,
        });

        if record.gfn != gfn {
            tracing::debug!(%pid, %page, old = %record.gfn, new = %gfn, "page remapped");
            record.gfn = gfn;
        }
        record.category = category;

        record
    }

    /// Bumps the write generation of a page.
    pub fn bump_generation(&mut self, pid: Pid, page: Va) {
        if let Some(record) = self.records.get_mut(&(pid, page)) {
            record.generation += 1;
        }
    }

    /// Marks the in-flight dump of a page as emitted.
    pub fn mark_dumped(&mut self, pid: Pid, page: Va) {
        if let Some(record) = self.records.get_mut(&(pid, page)) {
            record.state = record.state.dump_emitted();
        }
    }

    /// Removes every record of a process, returning the frames that were
    /// tracked for it.
    pub fn remove_process(&mut self, pid: Pid) -> Vec<Gfn> {
        let mut frames = Vec::new();

        self.records.retain(|&(record_pid, _), record| {
            if record_pid == pid {
                frames.push(record.gfn);
                false
            }
            else {
                true
            }
        });

        frames
    }

    /// Returns the number of tracked pages.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Checks whether the mirror is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
