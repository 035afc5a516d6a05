use crate::debugger::address::RemoteAddress;
use crate::debugger::error::Error;
use crate::debugger::native::{ExceptionCode, NativeEvent, NativePump, ThreadContext};
use crate::debugger::target::RemoteThreadInfo;
use crate::debugger::triage::unmanaged::EventId;
use crate::debugger::triage::ThreadFacts;
use log::{debug, warn};
use nix::unistd::Pid;
use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HijackKind {
    /// Thread parked in the generic stub while its event waits for in-band dispatch.
    Generic,
    /// Thread shows a first chance exception to the runtime.
    FirstChance,
}

/// Everything needed to put a hijacked thread back exactly where it was.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HijackState {
    pub kind: HijackKind,
    pub event: EventId,
    pub saved_context: ThreadContext,
    /// Exception handler chain head at hijack time.
    pub saved_handler_chain: Option<u64>,
}

/// Native thread known to the engine.
#[derive(Clone, Debug, PartialEq)]
pub struct UnmanagedThread {
    pub tid: Pid,
    pub hijack: Option<HijackState>,
    /// Hijacked thread is executing the runtime stub.
    pub in_stub: bool,
    /// Lifted breakpoint the thread single-steps over.
    pub step_over: Option<RemoteAddress>,
    /// Exception expected to be raised again after un-hijack.
    pub retrigger: Option<(ExceptionCode, RemoteAddress)>,
    /// Suspended by an uninitialized stop.
    pub suspended: bool,
}

impl UnmanagedThread {
    fn new(tid: Pid) -> Self {
        Self {
            tid,
            hijack: None,
            in_stub: false,
            step_over: None,
            retrigger: None,
            suspended: false,
        }
    }

    pub fn is_hijacked(&self) -> bool {
        self.hijack.is_some()
    }

    /// Facts for triage of `event` raised on this thread.
    pub fn facts(&self, remote: &RemoteThreadInfo, event: &NativeEvent) -> ThreadFacts {
        let exception = event.exception();
        ThreadFacts {
            cant_stop: remote.in_cant_stop_region(),
            is_helper: remote.is_helper,
            stepping_over_breakpoint: self.step_over.is_some()
                && exception.map(|(code, _)| code.is_single_step()).unwrap_or(false),
            hijacked: self.is_hijacked(),
            retrigger: exception.is_some() && self.retrigger == exception,
        }
    }
}

/// Registry of debugee native threads.
pub struct ThreadRegistry {
    threads: HashMap<Pid, UnmanagedThread>,
}

impl ThreadRegistry {
    pub fn new(process_pid: Pid) -> Self {
        Self {
            threads: HashMap::from([(process_pid, UnmanagedThread::new(process_pid))]),
        }
    }

    /// Thread entry, created on first sight.
    pub fn ensure(&mut self, tid: Pid) -> &mut UnmanagedThread {
        self.threads.entry(tid).or_insert_with(|| {
            debug!(target: "triage", "new native thread {tid}");
            UnmanagedThread::new(tid)
        })
    }

    pub fn remove(&mut self, tid: Pid) -> Option<UnmanagedThread> {
        debug!(target: "triage", "remove native thread {tid}");
        self.threads.remove(&tid)
    }

    /// Suspend every thread in `tids`. Threads that exited meanwhile are skipped. On failure
    /// threads suspended by this call are resumed again.
    pub fn suspend_all(&mut self, pump: &dyn NativePump, tids: &[Pid]) -> Result<(), Error> {
        let mut suspended = vec![];

        for tid in tids {
            if self.ensure(*tid).suspended {
                continue;
            }
            match pump.suspend_thread(*tid) {
                Ok(()) => {
                    self.ensure(*tid).suspended = true;
                    suspended.push(*tid);
                }
                Err(Error::ThreadNotFound(tid)) => {
                    warn!(target: "triage", "thread {tid} exited before suspend");
                    self.remove(tid);
                }
                Err(e) => {
                    for tid in suspended {
                        self.ensure(tid).suspended = false;
                        if let Err(e) = pump.resume_thread(tid) {
                            warn!(target: "triage", "rollback resume of {tid}: {e:#}");
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Resume threads suspended by [`ThreadRegistry::suspend_all`].
    pub fn resume_suspended(&mut self, pump: &dyn NativePump) -> Result<(), Error> {
        let mut errors = vec![];

        self.threads.values_mut().for_each(|thread| {
            if !thread.suspended {
                return;
            }
            thread.suspended = false;

            match pump.resume_thread(thread.tid) {
                Ok(()) => {}
                // thread exited meanwhile, it will be removed on exit event
                Err(Error::ThreadNotFound(tid)) => warn!(target: "triage", "thread {tid} not found"),
                Err(e) => errors.push(format!("thread {}: {e}", thread.tid)),
            }
        });

        if !errors.is_empty() {
            return Err(Error::NativePump(errors.join(";")));
        }
        Ok(())
    }
}
