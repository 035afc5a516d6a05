//! Native event loop: waits for native debug events, triages them and carries out all hijack
//! mechanics. Runs on its own thread, other threads talk to it through [`PumpRequest`].

use crate::debugger::address::RemoteAddress;
use crate::debugger::error::Error;
use crate::debugger::native::{ContinueStatus, NativeEvent, NativeEventKind, NativePump};
use crate::debugger::process::Process;
use crate::debugger::runtime::Flare;
use crate::debugger::target::{AddressKind, RemoteThreadInfo};
use crate::debugger::transport::message::{IpcEvent, IpcEventKind};
use crate::debugger::triage::hijack::{hijack, unhijack};
use crate::debugger::triage::thread::HijackKind;
use crate::debugger::triage::unmanaged::{Band, EventId, EventState};
use crate::debugger::triage::{triage, Reaction, TriageInput};
use crate::{muted_error, weak_error};
use log::{debug, trace, warn};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread;

pub enum PumpRequest {
    /// Continue in-band events, reply when done. Pending out-of-band events are resolved first.
    ContinueInBand {
        events: Vec<EventId>,
        done: Sender<Result<(), Error>>,
    },
    Shutdown,
}

enum Flow {
    Proceed,
    Shutdown,
}

struct NativeEventLoop<'a> {
    process: &'a Process,
    pump: &'a dyn NativePump,
    requests: Receiver<PumpRequest>,
    deferred: Vec<PumpRequest>,
    /// In-band event the debugee is frozen on, continued when the user continues it.
    outstanding: Option<(EventId, NativeEvent)>,
}

impl Process {
    /// Body of the native event thread. Returns when the process is terminated, detached,
    /// unrecoverable or shut down.
    pub fn run_native_loop(&self, requests: Receiver<PumpRequest>) {
        let Some(pump) = self.pump.clone() else {
            return;
        };
        let event_loop = NativeEventLoop {
            process: self,
            pump: pump.as_ref(),
            requests,
            deferred: vec![],
            outstanding: None,
        };
        event_loop.run();
        debug!(target: "pump", "native event loop finished");
    }
}

impl<'a> NativeEventLoop<'a> {
    fn run(mut self) {
        let poll = self.process.config.poll_interval();

        loop {
            if let Flow::Shutdown = self.serve_requests() {
                return;
            }
            if self.process.is_finished() {
                return;
            }

            if self.outstanding.is_some() {
                // debugee is frozen until the outstanding event is continued
                match self.requests.recv_timeout(poll) {
                    Ok(request) => self.deferred.push(request),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => return,
                }
                continue;
            }

            match self.pump.wait_for_event(poll) {
                Ok(Some(event)) => {
                    if let Err(e) = self.handle_event(event) {
                        self.process.handle_error(e);
                    }
                }
                Ok(None) => {}
                Err(e) => self.process.handle_error(e),
            }
        }
    }

    fn serve_requests(&mut self) -> Flow {
        loop {
            let request = if self.deferred.is_empty() {
                match self.requests.try_recv() {
                    Ok(request) => request,
                    Err(TryRecvError::Empty) => return Flow::Proceed,
                    Err(TryRecvError::Disconnected) => return Flow::Shutdown,
                }
            } else {
                self.deferred.remove(0)
            };

            match request {
                PumpRequest::Shutdown => return Flow::Shutdown,
                PumpRequest::ContinueInBand { events, done } => {
                    let result = events
                        .into_iter()
                        .try_for_each(|id| self.continue_in_band(id));
                    _ = done.send(result);
                }
            }
        }
    }

    fn remote_info(&self, event: &NativeEvent) -> RemoteThreadInfo {
        muted_error!(self.process.data.thread_info(event.thread)).unwrap_or_default()
    }

    fn handle_event(&mut self, event: NativeEvent) -> Result<(), Error> {
        trace!(target: "pump", "native event: {event}");

        if let NativeEventKind::ExitProcess { code } = event.kind {
            self.pump.continue_event(&event, ContinueStatus::Handled)?;
            self.process.mark_terminated(code);
            return Ok(());
        }

        let remote = self.remote_info(&event);
        let exception = event.exception();
        let flare = self.process.runtime_offsets().and_then(|offsets| {
            let (code, addr) = exception?;
            code.is_breakpoint().then(|| offsets.flare_at(addr)).flatten()
        });
        let address_kind = exception
            .map(|(_, addr)| self.process.data.classify_address(addr))
            .unwrap_or(AddressKind::Unrecognized);
        let in_patch_table = match exception {
            Some((code, addr)) if code.is_breakpoint() && flare.is_none() => {
                weak_error!(self.process.patch_table())
                    .map(|table| table.is_runtime_patch(addr))
                    .unwrap_or(false)
            }
            _ => false,
        };

        let reaction = self.process.with_state(|s| {
            let facts = s.threads.ensure(event.thread).facts(&remote, &event);
            triage(&TriageInput {
                event: &event,
                thread: facts,
                flare,
                in_patch_table,
                address_kind,
                synchronized: s.synchronized,
                runtime_loaded: s.runtime_initialized,
            })
        });
        debug!(target: "triage", "{event} -> {reaction}");

        match reaction {
            Reaction::Ignore => self.ignore(&event)?,
            Reaction::BelongsToRuntime => {
                self.pump.continue_event(&event, ContinueStatus::NotHandled)?
            }
            Reaction::InBand if flare == Some(Flare::NotForRuntime) => {
                self.promote_hijacked(&event)?
            }
            Reaction::InBand => self.queue_in_band(event.clone(), &remote)?,
            Reaction::OutOfBand => self.dispatch_out_of_band(event.clone())?,
            Reaction::HijackStart => {
                self.process
                    .with_state(|s| s.threads.ensure(event.thread).in_stub = true);
                self.pump.continue_event(&event, ContinueStatus::Handled)?;
            }
            Reaction::HijackComplete => self.complete_hijack(&event, &remote)?,
            Reaction::RequiresHijack => self.hijack_first_chance(&event, &remote)?,
            Reaction::Retrigger => {
                self.process
                    .with_state(|s| s.threads.ensure(event.thread).retrigger = None);
                self.pump
                    .continue_event(&event, ContinueStatus::NotHandled)?;
            }
        }

        if let NativeEventKind::ExitThread { .. } = event.kind {
            self.process.with_state(|s| s.threads.remove(event.thread));
        }
        Ok(())
    }

    fn ignore(&self, event: &NativeEvent) -> Result<(), Error> {
        let step_over = self.process.with_state(|s| {
            let thread = s.threads.ensure(event.thread);
            match event.exception() {
                Some((code, _)) if code.is_single_step() => thread.step_over.take(),
                _ => None,
            }
        });

        if let Some(addr) = step_over {
            trace!(target: "pump", "re-arm breakpoint at {addr}");
            self.process
                .patch_table()?
                .rearm(self.process.data.as_ref(), addr)?;
            let mut ctx = self.pump.get_context(event.thread)?;
            ctx.single_step = false;
            self.pump.set_context(event.thread, &ctx)?;
        }
        self.pump.continue_event(event, ContinueStatus::Handled)
    }

    /// Send async break so queued in-band events get dispatched, unless runtime is stopping
    /// anyway.
    fn request_sync(&self) -> Result<(), Error> {
        let send = self.process.with_state(|s| {
            if !s.runtime_initialized
                || s.sync_received
                || s.stop_pending
                || s.ib_stop_pending
                || s.synchronized
            {
                return false;
            }
            s.ib_stop_pending = true;
            true
        });
        if send {
            debug!(target: "pump", "async break for in-band events");
            let request = IpcEvent::new(self.process.pid(), IpcEventKind::AsyncBreak);
            self.process.transport.send(&request)?;
        }
        Ok(())
    }

    fn queue_in_band(&mut self, event: NativeEvent, remote: &RemoteThreadInfo) -> Result<(), Error> {
        let pump = self.pump;
        let process = self.process;

        let id = process.with_state(|s| -> Result<EventId, Error> {
            let id = s.unmanaged.track(event.clone());
            s.unmanaged.enqueue(id, Band::InBand)?;
            Ok(id)
        })?;

        let hijacked = process.with_state(|s| -> Result<bool, Error> {
            let Some(stub) = s.offsets.map(|o| o.generic_hijack) else {
                return Ok(false);
            };
            let thread = s.threads.ensure(event.thread);
            if !s.runtime_initialized || thread.is_hijacked() {
                return Ok(false);
            }
            hijack(
                pump,
                process.data.as_ref(),
                thread,
                remote,
                stub,
                HijackKind::Generic,
                id,
            )?;
            s.unmanaged
                .get_mut(id)?
                .state
                .insert(EventState::CONTINUED_HIJACKED);
            Ok(true)
        });

        match hijacked {
            Ok(true) => {
                self.pump.continue_event(&event, ContinueStatus::Handled)?;
                self.request_sync()
            }
            Ok(false) => {
                debug!(target: "pump", "in-band {id} stays outstanding");
                self.outstanding = Some((id, event));
                Ok(())
            }
            Err(e) => {
                // debugee stays frozen on the event
                warn!(target: "pump", "hijack for in-band {id} failed: {e:#}");
                self.outstanding = Some((id, event));
                Ok(())
            }
        }
    }

    /// Thread shown its first chance exception to the runtime, runtime said it's not its own.
    fn promote_hijacked(&mut self, flare_event: &NativeEvent) -> Result<(), Error> {
        let promoted = self.process.with_state(|s| -> Result<Option<EventId>, Error> {
            let thread = s.threads.ensure(flare_event.thread);
            let Some(hijack) = thread.hijack.as_mut() else {
                return Ok(None);
            };
            hijack.kind = HijackKind::Generic;
            let id = hijack.event;
            thread.in_stub = false;
            s.unmanaged.enqueue(id, Band::InBand)?;
            Ok(Some(id))
        })?;

        match promoted {
            Some(id) => {
                debug!(target: "pump", "exception {id} is not for runtime, queue in-band");
                self.pump
                    .continue_event(flare_event, ContinueStatus::Handled)?;
                self.request_sync()
            }
            None => {
                warn!(target: "pump", "not-for-runtime flare on a thread that is not hijacked");
                self.pump
                    .continue_event(flare_event, ContinueStatus::Handled)
            }
        }
    }

    fn hijack_first_chance(
        &mut self,
        event: &NativeEvent,
        remote: &RemoteThreadInfo,
    ) -> Result<(), Error> {
        let pump = self.pump;
        let process = self.process;

        process.with_state(|s| -> Result<(), Error> {
            let stub = s
                .offsets
                .map(|o| o.generic_hijack)
                .ok_or(Error::RuntimeNotLoaded)?;
            let id = s.unmanaged.track(event.clone());
            let thread = s.threads.ensure(event.thread);
            if let Err(e) = hijack(
                pump,
                process.data.as_ref(),
                thread,
                remote,
                stub,
                HijackKind::FirstChance,
                id,
            ) {
                s.unmanaged.remove(id);
                return Err(e);
            }
            s.unmanaged
                .get_mut(id)?
                .state
                .insert(EventState::CONTINUED_HIJACKED);
            Ok(())
        })?;

        self.pump.continue_event(event, ContinueStatus::Handled)
    }

    /// Hijacked thread left the runtime stub, runtime dealt with the exception.
    fn complete_hijack(&mut self, event: &NativeEvent, remote: &RemoteThreadInfo) -> Result<(), Error> {
        let pump = self.pump;
        let process = self.process;

        process.with_state(|s| -> Result<(), Error> {
            let thread = s.threads.ensure(event.thread);
            let Some(state) = thread.hijack else {
                warn!(target: "pump", "hijack complete flare on a thread that is not hijacked");
                return Ok(());
            };
            unhijack(pump, process.data.as_ref(), thread, remote)?;

            if let Some(original) = s.unmanaged.remove(state.event) {
                if !original.is_exception_cleared() {
                    thread.retrigger = original.event.exception();
                }
            }
            Ok(())
        })?;

        self.pump.continue_event(event, ContinueStatus::Handled)
    }

    fn dispatch_out_of_band(&mut self, event: NativeEvent) -> Result<(), Error> {
        let me = thread::current().id();
        let id = self.process.with_state(|s| -> Result<EventId, Error> {
            let id = s.unmanaged.track(event.clone());
            s.unmanaged.enqueue(id, Band::OutOfBand)?;
            s.unmanaged
                .get_mut(id)?
                .state
                .insert(EventState::DISPATCHED);
            s.dispatching_oob = Some(me);
            Ok(id)
        })?;

        debug!(target: "dispatch", "dispatch out-of-band {id}: {event}");
        self.process.oob_signal.reset();
        let result = self
            .process
            .hooks
            .on_native_event(self.process, id, &event, true);
        weak_error!(result.map_err(Error::Hook), "out-of-band callback:");
        self.process.with_state(|s| s.dispatching_oob = None);

        self.wait_out_of_band(id)?;

        let cleared = self.process.with_state(|s| {
            s.unmanaged
                .remove(id)
                .map(|e| e.is_exception_cleared())
                .unwrap_or(false)
        });
        self.finish_native(&event, cleared)
    }

    /// Block until the user continues out-of-band event `id`. Requests arriving meanwhile
    /// are deferred.
    fn wait_out_of_band(&mut self, id: EventId) -> Result<(), Error> {
        let poll = self.process.config.poll_interval();
        loop {
            let continued = self.process.with_state(|s| {
                s.unmanaged
                    .get(id)
                    .map(|e| e.state.contains(EventState::CONTINUE_REQUESTED))
                    .unwrap_or(true)
            });
            if continued {
                return Ok(());
            }
            if self.process.is_finished() {
                return Err(Error::ProcessTerminated);
            }

            loop {
                match self.requests.try_recv() {
                    Ok(request) => self.deferred.push(request),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return Err(Error::PumpDisconnected),
                }
            }
            self.process.oob_signal.wait(Some(poll));
        }
    }

    /// Continue a native event the debugee is frozen on. Cleared exceptions are dismissed,
    /// a cleared breakpoint at a runtime patch is stepped over.
    fn finish_native(&self, event: &NativeEvent, cleared: bool) -> Result<(), Error> {
        let status = match event.exception() {
            None => ContinueStatus::Handled,
            Some(_) if !cleared => ContinueStatus::NotHandled,
            Some((code, addr)) => {
                if code.is_breakpoint() {
                    self.step_over_patch(event, addr)?;
                }
                ContinueStatus::Handled
            }
        };
        self.pump.continue_event(event, status)
    }

    /// Lift the patch at `addr` and single-step the thread over it.
    fn step_over_patch(&self, event: &NativeEvent, addr: RemoteAddress) -> Result<(), Error> {
        let process = self.process;
        let lifted = process.patch_table()?.lift(process.data.as_ref(), addr)?;
        if !lifted {
            return Ok(());
        }

        let mut ctx = self.pump.get_context(event.thread)?;
        ctx.pc = addr.as_u64();
        ctx.single_step = true;
        self.pump.set_context(event.thread, &ctx)?;
        process.with_state(|s| s.threads.ensure(event.thread).step_over = Some(addr));
        trace!(target: "pump", "step over patch at {addr} on thread {}", event.thread);
        Ok(())
    }

    fn continue_in_band(&mut self, id: EventId) -> Result<(), Error> {
        if let Some((outstanding_id, event)) = self.outstanding.take() {
            if outstanding_id == id {
                let cleared = self.process.with_state(|s| {
                    s.unmanaged
                        .remove(id)
                        .map(|e| e.is_exception_cleared())
                        .unwrap_or(false)
                });
                return self.finish_native(&event, cleared);
            }
            self.outstanding = Some((outstanding_id, event));
        }

        let pump = self.pump;
        let process = self.process;
        let Some(tracked) = process.with_state(|s| s.unmanaged.remove(id)) else {
            return Ok(());
        };
        let event = &tracked.event;
        let remote = self.remote_info(event);

        let step_over = process.with_state(|s| -> Result<Option<RemoteAddress>, Error> {
            let thread = s.threads.ensure(event.thread);
            if thread.hijack.map(|h| h.event) != Some(id) {
                return Ok(None);
            }
            unhijack(pump, process.data.as_ref(), thread, &remote)?;
            thread.retrigger = None;

            match event.exception() {
                Some((code, addr)) if tracked.is_exception_cleared() => {
                    Ok(code.is_breakpoint().then_some(addr))
                }
                Some(exception) => {
                    // redelivered to the debugee's own handling
                    thread.retrigger = Some(exception);
                    Ok(None)
                }
                None => Ok(None),
            }
        })?;

        if let Some(addr) = step_over {
            self.step_over_patch(event, addr)?;
        }
        if !tracked.state.contains(EventState::CONTINUED_HIJACKED) {
            warn!(target: "pump", "in-band {id} was never continued natively");
        }
        Ok(())
    }
}
