use crate::debugger::address::RemoteAddress;
use crate::debugger::config::DebuggerConfig;
use crate::debugger::error::Error;
use crate::debugger::native::NativePump;
use crate::debugger::object::{ObjectId, ObjectTree};
use crate::debugger::patch::PatchTable;
use crate::debugger::pump::PumpRequest;
use crate::debugger::runtime::RuntimeOffsets;
use crate::debugger::sync::Signal;
use crate::debugger::target::DataAccess;
use crate::debugger::transport::message::{IpcEvent, IpcEventKind};
use crate::debugger::transport::{send_two_way, Transport};
use crate::debugger::triage::unmanaged::{EventId, EventState, UnmanagedEvent, UnmanagedQueues};
use crate::debugger::triage::thread::ThreadRegistry;
use crate::debugger::EventHook;
use crate::version;
use log::{debug, error, info, warn};
use nix::unistd::Pid;
use parking_lot::{Mutex, ReentrantMutex};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::ThreadId;

/// Mutable process state, guarded by the process lock.
pub(super) struct ProcessState {
    pub(super) stop_count: u32,
    pub(super) synchronized: bool,
    /// Runtime reported sync complete and waits for a `Continue`.
    pub(super) sync_received: bool,
    /// A caller waits in a blocking stop.
    pub(super) stop_pending: bool,
    /// Async break sent on behalf of queued in-band events.
    pub(super) ib_stop_pending: bool,
    /// Process stopped by suspending native threads, runtime was not loaded.
    pub(super) uninitialized_stop: bool,
    pub(super) continue_counter: u32,
    pub(super) runtime_initialized: bool,
    pub(super) offsets: Option<RuntimeOffsets>,

    pub(super) exiting: bool,
    pub(super) exit_code: Option<i32>,
    pub(super) terminated: bool,
    pub(super) detached: bool,
    pub(super) unrecoverable: Option<String>,

    pub(super) dispatch_thread: Option<ThreadId>,
    /// Thread running an in-band or managed callback.
    pub(super) dispatching: Option<ThreadId>,
    /// Thread running an out-of-band callback.
    pub(super) dispatching_oob: Option<ThreadId>,

    pub(super) managed_queue: VecDeque<IpcEvent>,
    pub(super) unmanaged: UnmanagedQueues,
    pub(super) threads: ThreadRegistry,
    pub(super) patches: PatchTable,
    pub(super) objects: ObjectTree,
}

impl ProcessState {
    fn new(pid: Pid, config: &DebuggerConfig) -> Self {
        Self {
            stop_count: 0,
            synchronized: false,
            sync_received: false,
            stop_pending: false,
            ib_stop_pending: false,
            uninitialized_stop: false,
            continue_counter: 0,
            runtime_initialized: false,
            offsets: None,
            exiting: false,
            exit_code: None,
            terminated: false,
            detached: false,
            unrecoverable: None,
            dispatch_thread: None,
            dispatching: None,
            dispatching_oob: None,
            managed_queue: VecDeque::new(),
            unmanaged: UnmanagedQueues::default(),
            threads: ThreadRegistry::new(pid),
            patches: PatchTable::new(
                config.arch.breakpoint_instruction(),
                config.max_patch_entries,
            ),
            objects: ObjectTree::default(),
        }
    }

    pub(super) fn has_pending_notifications(&self) -> bool {
        !self.managed_queue.is_empty() || self.unmanaged.has_undispatched_in_band()
    }

    /// Mark dispatched in-band events as continued by the user, return their ids.
    pub(super) fn request_in_band_continue(&mut self, all: bool) -> Vec<EventId> {
        let ids = if all {
            self.unmanaged.in_band_ids()
        } else {
            self.unmanaged.dispatched_in_band()
        };
        for id in &ids {
            if let Ok(event) = self.unmanaged.get_mut(*id) {
                event.state.insert(EventState::CONTINUE_REQUESTED);
            }
        }
        ids
    }
}

/// Debugee process as seen by the controller.
///
/// All public methods are safe to call from any thread, including event callbacks.
pub struct Process {
    pid: Pid,
    pub(super) config: DebuggerConfig,

    /// Process lock.
    pub(super) state: ReentrantMutex<RefCell<ProcessState>>,
    /// Stop-go lock, always taken before the process lock.
    pub(super) stop_go: ReentrantMutex<()>,

    /// Wakes a caller blocked in stop.
    pub(super) stop_signal: Signal,
    /// Wakes the native event loop waiting for an out-of-band continue.
    pub(super) oob_signal: Signal,

    pub(super) transport: Arc<dyn Transport>,
    pub(super) data: Arc<dyn DataAccess>,
    pub(super) pump: Option<Arc<dyn NativePump>>,
    pub(super) hooks: Arc<dyn EventHook>,
    pub(super) pump_tx: Mutex<Option<mpsc::Sender<PumpRequest>>>,

    shutdown: AtomicBool,
    exit_reported: AtomicBool,
}

impl Process {
    pub(super) fn new(
        pid: Pid,
        config: DebuggerConfig,
        transport: Arc<dyn Transport>,
        data: Arc<dyn DataAccess>,
        pump: Option<Arc<dyn NativePump>>,
        hooks: Arc<dyn EventHook>,
    ) -> Self {
        Self {
            pid,
            state: ReentrantMutex::new(RefCell::new(ProcessState::new(pid, &config))),
            config,
            stop_go: ReentrantMutex::new(()),
            stop_signal: Signal::auto(),
            oob_signal: Signal::auto(),
            transport,
            data,
            pump,
            hooks,
            pump_tx: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            exit_reported: AtomicBool::new(false),
        }
    }

    /// Run `f` with exclusive access to the process state. `f` must not call hooks, transport
    /// or anything that may lock the process again.
    pub(super) fn with_state<R>(&self, f: impl FnOnce(&mut ProcessState) -> R) -> R {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        f(&mut state)
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn config(&self) -> &DebuggerConfig {
        &self.config
    }

    pub fn stop_count(&self) -> u32 {
        self.with_state(|s| s.stop_count)
    }

    pub fn is_synchronized(&self) -> bool {
        self.with_state(|s| s.synchronized)
    }

    /// Number of real resumes so far.
    pub fn continue_counter(&self) -> u32 {
        self.with_state(|s| s.continue_counter)
    }

    pub fn is_runtime_initialized(&self) -> bool {
        self.with_state(|s| s.runtime_initialized)
    }

    pub fn runtime_offsets(&self) -> Option<RuntimeOffsets> {
        self.with_state(|s| s.offsets)
    }

    pub fn is_terminated(&self) -> bool {
        self.with_state(|s| s.terminated)
    }

    pub fn is_detached(&self) -> bool {
        self.with_state(|s| s.detached)
    }

    pub fn is_unrecoverable(&self) -> bool {
        self.with_state(|s| s.unrecoverable.is_some())
    }

    /// True if the engine is currently running an event callback on some thread.
    pub fn is_dispatching(&self) -> bool {
        self.with_state(|s| s.dispatching.is_some() || s.dispatching_oob.is_some())
    }

    pub fn queued_managed_events(&self) -> usize {
        self.with_state(|s| s.managed_queue.len())
    }

    pub fn queued_in_band_events(&self) -> usize {
        self.with_state(|s| s.unmanaged.in_band_len())
    }

    pub fn unmanaged_event(&self, id: EventId) -> Result<UnmanagedEvent, Error> {
        self.with_state(|s| s.unmanaged.get(id).cloned())
    }

    /// Return an error if process can't be operated anymore.
    pub(super) fn fail_fast(&self) -> Result<(), Error> {
        self.with_state(|s| {
            if let Some(reason) = &s.unrecoverable {
                return Err(Error::Unrecoverable(reason.clone()));
            }
            if s.detached {
                return Err(Error::Detached);
            }
            if s.terminated {
                return Err(Error::ProcessTerminated);
            }
            Ok(())
        })
    }

    /// True when event loops have nothing to do anymore.
    pub(super) fn is_finished(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
            || self.with_state(|s| s.terminated || s.detached || s.unrecoverable.is_some())
    }

    /// Flip process into unrecoverable state, controller is notified once.
    pub(super) fn mark_unrecoverable(&self, err: &Error) {
        let first = self.with_state(|s| {
            if s.unrecoverable.is_some() {
                return false;
            }
            s.unrecoverable = Some(err.to_string());
            true
        });

        if first {
            error!(target: "stopgo", "process {} is unrecoverable: {err:#}", self.pid);
            self.stop_signal.set();
            self.oob_signal.set();
            self.hooks.on_unrecoverable_error(err);
        }
    }

    /// Log an error from background processing, fatal ones poison the process.
    pub(super) fn handle_error(&self, err: Error) {
        if err.is_fatal() {
            self.mark_unrecoverable(&err);
        } else {
            warn!(target: "stopgo", "{err:#}");
        }
    }

    /// Pass `result` through, poisoning the process on fatal errors.
    pub(super) fn check_fatal<T>(&self, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(ref e) = result {
            if e.is_fatal() {
                self.mark_unrecoverable(e);
            }
        }
        result
    }

    pub(super) fn mark_terminated(&self, code: i32) {
        self.with_state(|s| {
            s.terminated = true;
            s.exit_code.get_or_insert(code);
            s.stop_count = 0;
            s.synchronized = false;
            s.stop_pending = false;
            s.managed_queue.clear();
            s.unmanaged.clear();
            s.patches.invalidate();
            s.objects.neuter_all();
        });
        self.stop_signal.set();
        self.oob_signal.set();

        if !self.exit_reported.swap(true, Ordering::SeqCst) {
            let code = self.with_state(|s| s.exit_code.unwrap_or(code));
            info!(target: "stopgo", "process {} exited with code {code}", self.pid);
            self.hooks.on_exit(code);
        }
    }

    /// Runtime is loaded: check protocol version and fetch runtime offsets.
    pub(super) fn on_runtime_loaded(&self) -> Result<(), Error> {
        let block = self.data.control_block()?.ok_or(Error::RuntimeNotLoaded)?;
        version::check(&block)?;
        let offsets = RuntimeOffsets::fetch(self.data.as_ref(), block.runtime_offsets)?;

        debug!(
            target: "stopgo",
            "runtime loaded, protocol {}, generic hijack at {}",
            version::ProtocolVersion::from(&block),
            offsets.generic_hijack
        );
        self.with_state(|s| {
            s.runtime_initialized = true;
            s.offsets = Some(offsets);
            s.patches.invalidate();
        });
        Ok(())
    }

    pub(super) fn set_pump_channel(&self, tx: mpsc::Sender<PumpRequest>) {
        *self.pump_tx.lock() = Some(tx);
    }

    /// Stop event loops.
    pub(super) fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(tx) = self.pump_tx.lock().as_ref() {
            _ = tx.send(PumpRequest::Shutdown);
        }
        self.oob_signal.set();
    }

    /// Ask the native event loop to continue in-band events and wait until it's done.
    /// The loop resolves pending out-of-band events first.
    pub(super) fn continue_in_band(
        &self,
        events: Vec<EventId>,
        oob_pending: bool,
    ) -> Result<(), Error> {
        if events.is_empty() && !oob_pending {
            return Ok(());
        }
        let Some(tx) = self.pump_tx.lock().clone() else {
            return if events.is_empty() {
                Ok(())
            } else {
                Err(Error::PumpDisconnected)
            };
        };

        debug!(target: "stopgo", "continue {} in-band events", events.len());
        let (done_tx, done_rx) = mpsc::channel();
        tx.send(PumpRequest::ContinueInBand {
            events,
            done: done_tx,
        })
        .map_err(|_| Error::PumpDisconnected)?;
        done_rx.recv().map_err(|_| Error::PumpDisconnected)?
    }

    fn new_patch_table(&self) -> PatchTable {
        PatchTable::new(
            self.config.arch.breakpoint_instruction(),
            self.config.max_patch_entries,
        )
    }

    /// Patch table valid right now: the cache when synchronized, a fresh copy otherwise.
    /// The table is fetched without the process lock and cached only if no resume happened
    /// meanwhile.
    pub(super) fn patch_table(&self) -> Result<PatchTable, Error> {
        let (cached, layout, synchronized, counter) = self.with_state(|s| {
            let cached = (s.synchronized && s.patches.is_loaded()).then(|| s.patches.clone());
            (
                cached,
                s.offsets.map(|o| o.patch_table),
                s.synchronized,
                s.continue_counter,
            )
        });
        if let Some(table) = cached {
            return Ok(table);
        }

        let mut table = self.new_patch_table();
        table.refresh(self.data.as_ref(), layout.as_ref())?;

        if synchronized {
            self.with_state(|s| {
                if s.synchronized && s.continue_counter == counter && !s.patches.is_loaded() {
                    s.patches = table.clone();
                }
            });
        }
        Ok(table)
    }

    /// Read debugee memory, runtime breakpoints are invisible.
    pub fn read_memory(&self, addr: RemoteAddress, buf: &mut [u8]) -> Result<(), Error> {
        self.fail_fast()?;
        self.data.read_memory(addr, buf)?;
        self.patch_table()?.unapply(addr, buf);
        Ok(())
    }

    /// Write debugee memory, runtime breakpoints stay in place and remember the new bytes.
    pub fn write_memory(&self, addr: RemoteAddress, data: &[u8]) -> Result<(), Error> {
        self.fail_fast()?;
        let (layout, counter) =
            self.with_state(|s| (s.offsets.map(|o| o.patch_table), s.continue_counter));

        let mut table = self.patch_table()?;
        let mut out = data.to_vec();
        let scratch = table.apply_for_write(addr, &mut out);
        self.data.write_memory(addr, &out)?;
        table.commit(self.data.as_ref(), layout.as_ref(), &scratch)?;

        self.with_state(|s| {
            if s.continue_counter == counter && s.patches.is_loaded() {
                s.patches.store(&scratch);
            }
        });
        Ok(())
    }

    /// Mark exception of a native event as handled, so the debugee doesn't see it.
    pub fn clear_current_exception(&self, event: EventId) -> Result<(), Error> {
        self.fail_fast()?;
        self.with_state(|s| s.unmanaged.clear_exception(event))?;
        debug!(target: "triage", "exception of {event} cleared");
        Ok(())
    }

    /// Register controller object mirroring a debugee entity.
    pub fn register_object(
        &self,
        parent: Option<ObjectId>,
        remote_handle: Option<u64>,
    ) -> Result<ObjectId, Error> {
        self.fail_fast()?;
        self.with_state(|s| s.objects.insert(parent, remote_handle))
    }

    pub fn add_object_ref(&self, id: ObjectId) -> Result<(), Error> {
        self.with_state(|s| s.objects.add_ref(id))
    }

    /// Drop a reference, unreferenced objects are neutered after the next real resume.
    pub fn release_object(&self, id: ObjectId) -> Result<u32, Error> {
        self.with_state(|s| s.objects.release(id))
    }

    pub fn is_object_neutered(&self, id: ObjectId) -> bool {
        self.with_state(|s| s.objects.is_neutered(id))
    }

    /// Release debugee resources of unreferenced objects, then neuter them.
    pub(super) fn cleanup_sweeps(&self) {
        let handles = self.with_state(|s| s.objects.take_pending_release());
        for handle in handles {
            let request = IpcEvent::new(self.pid, IpcEventKind::ReleaseObject { handle });
            let result = send_two_way(
                self.transport.as_ref(),
                &request,
                self.config.reply_timeout(),
            );
            if let Err(e) = result {
                self.handle_error(e);
            }
        }
        self.with_state(|s| s.objects.neuter_unreferenced());
    }

    /// Detach from the debugee. Process must be synchronized without out-of-band events.
    pub fn detach(&self) -> Result<(), Error> {
        self.fail_fast()?;
        let _stop_go = self.stop_go.lock();

        let (in_band, uninitialized) = self.with_state(|s| {
            if !s.synchronized {
                return Err(Error::NotSynchronized);
            }
            if s.unmanaged.has_out_of_band() {
                return Err(Error::OutOfBandPending);
            }
            Ok((s.request_in_band_continue(true), s.uninitialized_stop))
        })?;

        self.check_fatal(self.continue_in_band(in_band, false))?;
        if uninitialized {
            if let Some(pump) = &self.pump {
                self.with_state(|s| s.threads.resume_suspended(pump.as_ref()))?;
            }
        } else {
            let request = IpcEvent::new(self.pid, IpcEventKind::Detach);
            self.check_fatal(send_two_way(
                self.transport.as_ref(),
                &request,
                self.config.reply_timeout(),
            ))?;
        }

        let neutered = self.with_state(|s| {
            s.detached = true;
            s.synchronized = false;
            s.sync_received = false;
            s.uninitialized_stop = false;
            s.stop_count = 0;
            s.managed_queue.clear();
            s.patches.invalidate();
            s.objects.neuter_all()
        });
        info!(target: "stopgo", "detached from {}, {neutered} objects neutered", self.pid);
        self.request_shutdown();
        Ok(())
    }
}
