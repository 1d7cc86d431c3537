//! The detection session.
//!
//! A single-threaded event loop runs inside the trap callback: the
//! faulting vCPU stays paused while the paging mirror, classifier and
//! write-then-execute machine run. The only blocking points are the event
//! wait itself and the bounded dump queue.

use std::{
    ops::ControlFlow,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use hvunpack_core::{
    EventReason, EventResponse, Gfn, MemoryAccess, MemoryAccessEvent, Pa, Pid, Va, VcpuId, Vmi,
    VmiDriver, VmiError, VmiEvent,
    paging::{PAGE_SIZE, gfn_from_pa, va_align_down},
    profile::Profile,
};

use crate::{
    UnpackConfig, UnpackError, classify,
    dump::{DumpJob, DumpSender},
    mirror::{PageRecord, PagingMirror},
    process::{self, Process, ProcessTracker},
    traps::TrapController,
    vad::{self, SegmentCollector, VadInfo, VadNode, VadVisitor},
    wx::{Observation, WxAction},
};

/// Upper bound on VADs examined while instrumenting one process.
const INSTRUMENT_VAD_MAX: usize = 65536;

/// Requests a clean shutdown of a running [`Unpacker`].
#[derive(Debug, Clone)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    /// Asks the event loop to stop after the current event.
    pub fn request(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// The unpacker session.
///
/// Owns the per-process page state, the trap controller and the producer
/// side of the dump queue, and consumes the driver's event stream.
pub struct Unpacker<'a, Driver>
where
    Driver: VmiDriver,
{
    vmi: &'a Vmi<Driver>,
    profile: &'a Profile,
    config: UnpackConfig,

    /// Translation root used for kernel-structure reads.
    kernel_root: Pa,

    tracker: ProcessTracker,
    mirror: PagingMirror,
    traps: TrapController,
    dumps: DumpSender,

    /// Next dump sequence number, assigned in trigger order.
    next_seq: u64,

    shutdown: Arc<AtomicBool>,
}

impl<'a, Driver> Unpacker<'a, Driver>
where
    Driver: VmiDriver,
{
    /// Attaches to the target process and instruments its address space.
    ///
    /// The VM is paused for the duration of the setup.
    pub fn new(
        vmi: &'a Vmi<Driver>,
        profile: &'a Profile,
        config: UnpackConfig,
        dumps: DumpSender,
    ) -> Result<Self, UnpackError> {
        let _pause = vmi.pause_guard()?;

        let registers = vmi.registers(VcpuId(0))?;
        let kernel_root = registers.translation_root();

        let mut unpacker = Self {
            vmi,
            profile,
            tracker: ProcessTracker::new(config.follow_children),
            config,
            kernel_root,
            mirror: PagingMirror::new(),
            traps: TrapController::new(),
            dumps,
            next_seq: 0,
            shutdown: Arc::new(AtomicBool::new(false)),
        };

        let target = process::resolve_target(
            vmi,
            profile,
            kernel_root,
            &unpacker.config.target,
        )?;

        vmi.monitor_process_events(true)?;
        unpacker.enlist(target);

        Ok(unpacker)
    }

    /// Returns a handle that can stop the event loop from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown.clone())
    }

    /// Returns the page record tracked for `(pid, page)`, if any.
    pub fn page_record(&self, pid: Pid, page: Va) -> Option<&PageRecord> {
        self.mirror.record(pid, va_align_down(page))
    }

    /// Runs the event loop until shutdown is requested, every monitored
    /// process exited, or the introspection connection is lost.
    pub fn run(&mut self) -> Result<(), UnpackError> {
        const EVENT_TIMEOUT: Duration = Duration::from_millis(100);

        let result = loop {
            if self.shutdown.load(Ordering::Relaxed) {
                tracing::info!("shutdown requested");
                break Ok(());
            }

            if self.tracker.is_empty() {
                tracing::info!("all monitored processes exited");
                break Ok(());
            }

            let vmi = self.vmi;
            match vmi.wait_for_event(EVENT_TIMEOUT, |event| self.handle_event(event)) {
                Ok(()) => {}
                Err(VmiError::Timeout) => {}
                Err(err) => break Err(UnpackError::from(err)),
            }
        };

        self.traps.disarm_all(self.vmi);
        result
    }

    /// Handles one event with the faulting vCPU paused.
    ///
    /// No failure propagates past this boundary: every error is either
    /// recovered locally or turned into a shutdown request.
    pub fn handle_event(&mut self, event: &VmiEvent) -> EventResponse {
        match *event.reason() {
            EventReason::MemoryAccess(access) => self.on_memory_access(event, access),
            EventReason::Singlestep(_) => {
                self.traps.complete_singlestep(self.vmi, event.vcpu_id());
                EventResponse::toggle_singlestep()
            }
            EventReason::ProcessCreated(created) => {
                self.on_process_created(created.object, created.parent);
                EventResponse::default()
            }
            EventReason::ProcessExited(exited) => {
                self.on_process_exited(exited.pid);
                EventResponse::default()
            }
        }
    }

    /// Lets the faulting instruction complete with the trap lifted.
    fn step_over(&mut self, vcpu: VcpuId, gfn: Gfn) -> EventResponse {
        self.traps.begin_singlestep(self.vmi, vcpu, gfn);
        EventResponse::toggle_singlestep()
    }

    fn on_memory_access(
        &mut self,
        event: &VmiEvent,
        access: MemoryAccessEvent,
    ) -> EventResponse {
        let vcpu = event.vcpu_id();
        let gfn = gfn_from_pa(access.pa);
        let root = event.registers().translation_root();

        let process = match self.tracker.by_root(root) {
            Some(process) => process.clone(),
            // The frame is shared with an address space outside our scope.
            None => return self.step_over(vcpu, gfn),
        };

        let observation = if access.access.contains(MemoryAccess::W) {
            Observation::Write
        }
        else if access.access.contains(MemoryAccess::X) {
            Observation::Execute
        }
        else {
            // Spurious read observations never change state.
            return self.step_over(vcpu, gfn);
        };

        // Reconcile against a fresh walk; the event's frame may already be
        // stale.
        let mapping = match self.vmi.resolve(process.root, access.va) {
            Ok(mapping) => mapping,
            Err(err) => {
                tracing::debug!(va = %access.va, ?err, "page-walk gap, state unchanged");
                return self.step_over(vcpu, gfn);
            }
        };

        if !mapping.present {
            // Demand-paging fault: serviced by the guest, not a write.
            return self.step_over(vcpu, gfn);
        }

        let vad = match vad::find_segment(
            self.vmi,
            self.profile,
            self.kernel_root,
            process.vad_root,
            access.va,
        ) {
            Ok(vad) => vad,
            Err(err) => {
                tracing::warn!(va = %access.va, ?err, "VAD lookup failed");
                None
            }
        };

        let category = classify::classify(vad.as_ref(), process.image_base);
        if !self.config.filter.monitored(category) {
            return self.step_over(vcpu, gfn);
        }

        let page = va_align_down(access.va);
        let record = self
            .mirror
            .record_mut(process.pid, page, mapping.gfn(), category);

        let (next, action) = record.state.observe(observation);
        if observation == Observation::Write {
            record.generation += 1;
        }

        tracing::trace!(
            pid = %process.pid,
            %page,
            ?observation,
            from = ?record.state,
            to = ?next,
            generation = record.generation,
            "page observation"
        );

        record.state = next;

        match action {
            WxAction::None => {}
            WxAction::ArmExecute => {
                // Keep the write trap so later writes bump the generation.
                self.traps
                    .arm(self.vmi, mapping.gfn(), MemoryAccess::W | MemoryAccess::X);
            }
            WxAction::TriggerDump => {
                self.trigger_dump(&process, event, access.va, mapping.gfn(), page);
            }
        }

        self.step_over(vcpu, gfn)
    }

    /// Captures the process address space and hands it to the writer.
    fn trigger_dump(
        &mut self,
        process: &Process,
        event: &VmiEvent,
        trigger: Va,
        gfn: Gfn,
        page: Va,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;

        let rip = event.registers().instruction_pointer();
        tracing::info!(seq, pid = %process.pid, %rip, %trigger, "write-then-execute detected");

        let mut collector =
            SegmentCollector::new(self.vmi, process.root, self.config.max_segments);
        vad::walk(
            self.vmi,
            self.profile,
            self.kernel_root,
            process.vad_root,
            &mut collector,
        );

        let job = DumpJob {
            seq,
            pid: process.pid,
            rip,
            trigger,
            segments: collector.into_segments(),
        };

        match self.dumps.enqueue(job) {
            Ok(()) => {
                // The queue is FIFO with a single consumer, so acceptance
                // fixes the persistence order.
                self.mirror.mark_dumped(process.pid, page);
                self.traps.disarm(self.vmi, gfn, MemoryAccess::X);
            }
            Err(err) => {
                tracing::error!(?err, "dump queue closed, shutting down");
                self.shutdown.store(true, Ordering::Relaxed);
            }
        }
    }

    fn on_process_created(&mut self, object: Va, parent: Pid) {
        if !self.tracker.should_follow(parent) {
            return;
        }

        match process::read_process(self.vmi, self.profile, self.kernel_root, object) {
            Ok(mut child) => {
                child.parent = Some(parent);
                self.enlist(child);
            }
            Err(err) => {
                tracing::warn!(%object, ?err, "failed to read created process");
            }
        }
    }

    fn on_process_exited(&mut self, pid: Pid) {
        if self.tracker.remove(pid).is_none() {
            return;
        }

        tracing::info!(%pid, "monitored process exited");
        let frames = self.mirror.remove_process(pid);
        self.traps.disarm_frames(self.vmi, &frames);
    }

    /// Puts a process in scope: classifies its segments and write-arms the
    /// resolvable frames of monitored categories. Existing executable
    /// pages start clean; the original image is never dumped on its own.
    fn enlist(&mut self, process: Process) {
        let mut collector = InfoCollector::default();
        vad::walk(
            self.vmi,
            self.profile,
            self.kernel_root,
            process.vad_root,
            &mut collector,
        );

        let mut armed = 0usize;
        for info in &collector.infos {
            let category = classify::classify(Some(info), process.image_base);
            if !self.config.filter.monitored(category) {
                continue;
            }

            let mut page = info.base;
            while page < info.end {
                // Pages not present yet are picked up when observed later.
                if let Ok(mapping) = self.vmi.resolve(process.root, page) {
                    if mapping.present {
                        self.mirror
                            .record_mut(process.pid, page, mapping.gfn(), category);
                        self.traps.arm(self.vmi, mapping.gfn(), MemoryAccess::W);
                        armed += 1;
                    }
                }

                page = page + PAGE_SIZE;
            }
        }

        tracing::info!(
            pid = %process.pid,
            segments = collector.infos.len(),
            pages_armed = armed,
            "process instrumented"
        );

        self.tracker.insert(process);
    }
}

/// Collects segment attributes without capturing contents.
#[derive(Default)]
struct InfoCollector {
    infos: Vec<VadInfo>,
}

impl<Driver> VadVisitor<Driver> for InfoCollector
where
    Driver: VmiDriver,
{
    fn visit(&mut self, node: &VadNode<'_, Driver>) -> ControlFlow<()> {
        if self.infos.len() >= INSTRUMENT_VAD_MAX {
            tracing::warn!("too many regions, instrumentation truncated");
            return ControlFlow::Break(());
        }

        match node.describe() {
            Ok(Some(info)) => self.infos.push(info),
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(node = %node.va(), ?err, "unreadable region");
            }
        }

        ControlFlow::Continue(())
    }
}
