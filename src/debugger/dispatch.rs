//! Runtime event receiving and user callback dispatch.
//!
//! A single thread receives runtime events and drains queued notifications into user
//! callbacks, one at a time. While a callback runs the process is synchronized with two stops
//! on top: the dispatch floor owned by [`DispatchGuard`] and the implicit stop the callback is
//! expected to continue.

use crate::debugger::error::Error;
use crate::debugger::native::NativeEvent;
use crate::debugger::process::Process;
use crate::debugger::transport::message::{IpcEvent, IpcEventKind};
use crate::debugger::triage::unmanaged::{EventId, EventState};
use crate::weak_error;
use log::{debug, trace};
use std::thread;

enum Pending {
    Managed(IpcEvent),
    Native(EventId, NativeEvent),
}

enum SyncAction {
    WakeStopper,
    Dispatch,
    Spurious(u32),
}

/// Releases the dispatch floor when the callback returns.
struct DispatchGuard<'a> {
    process: &'a Process,
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        let process = self.process;
        let _stop_go = process.stop_go.lock();
        process.with_state(|s| s.dispatching = None);
        if process.is_finished() {
            return;
        }
        if let Err(e) = process.do_continue(true) {
            process.handle_error(e);
        }
    }
}

impl Process {
    /// Body of the runtime event thread. Returns when the process is terminated, detached,
    /// unrecoverable or shut down.
    pub fn run_dispatch_loop(&self) {
        self.with_state(|s| s.dispatch_thread = Some(thread::current().id()));
        let poll = self.config.poll_interval();

        while !self.is_finished() {
            match self.transport.receive(poll) {
                Ok(Some(event)) => {
                    if let Err(e) = self.handle_runtime_event(event) {
                        self.handle_error(e);
                    }
                }
                Ok(None) => {}
                Err(Error::ProcessTerminated) => {
                    let code = self.with_state(|s| s.exit_code.unwrap_or_default());
                    self.mark_terminated(code);
                    break;
                }
                Err(e) => self.handle_error(e),
            }

            self.dispatch_pending();
        }
        debug!(target: "dispatch", "dispatch loop finished");
    }

    pub(super) fn handle_runtime_event(&self, event: IpcEvent) -> Result<(), Error> {
        trace!(target: "dispatch", "runtime event {}", event.event_type());

        match event.kind {
            IpcEventKind::SyncComplete => {
                let action = self.with_state(|s| {
                    s.sync_received = true;
                    s.ib_stop_pending = false;
                    if s.stop_pending {
                        return SyncAction::WakeStopper;
                    }
                    if s.synchronized || s.has_pending_notifications() {
                        return SyncAction::Dispatch;
                    }
                    // nobody asked for this stop
                    s.sync_received = false;
                    s.continue_counter += 1;
                    s.patches.invalidate();
                    SyncAction::Spurious(s.continue_counter)
                });

                match action {
                    SyncAction::WakeStopper => self.stop_signal.set(),
                    SyncAction::Dispatch => {}
                    SyncAction::Spurious(counter) => {
                        debug!(target: "dispatch", "spurious sync complete, continue");
                        self.transport.send(&IpcEvent::new(
                            self.pid(),
                            IpcEventKind::Continue { counter },
                        ))?;
                    }
                }
                Ok(())
            }
            IpcEventKind::RuntimeStartup => {
                let loaded = self.on_runtime_loaded();
                self.with_state(|s| s.managed_queue.push_back(event));
                loaded
            }
            IpcEventKind::ExitProcess { code } => {
                self.with_state(|s| {
                    s.exiting = true;
                    s.exit_code = Some(code);
                    s.managed_queue.push_back(event);
                });
                Ok(())
            }
            _ if event.event_type().is_notification() => {
                self.with_state(|s| s.managed_queue.push_back(event));
                Ok(())
            }
            _ => Err(Error::MalformedEvent("controller bound event from runtime")),
        }
    }

    /// Dispatch queued notifications until none is ready.
    pub(super) fn dispatch_pending(&self) {
        while let Some(pending) = self.next_pending() {
            let guard = DispatchGuard { process: self };

            let result = match &pending {
                Pending::Managed(event) => {
                    debug!(target: "dispatch", "dispatch {}", event.event_type());
                    self.hooks.on_managed_event(self, event)
                }
                Pending::Native(id, event) => {
                    debug!(target: "dispatch", "dispatch in-band {id}: {event}");
                    self.hooks.on_native_event(self, *id, event, false)
                }
            };
            weak_error!(result.map_err(Error::Hook), "event callback:");

            drop(guard);
        }
    }

    /// Take the next notification and raise the stop count for its dispatch.
    fn next_pending(&self) -> Option<Pending> {
        // stop-go owner may wait for sync complete this thread must receive
        let _stop_go = self.stop_go.try_lock()?;
        let me = thread::current().id();

        self.with_state(|s| {
            if s.terminated || s.detached || s.unrecoverable.is_some() {
                return None;
            }
            if s.synchronized || s.dispatching.is_some() {
                return None;
            }

            let pending = match s.unmanaged.next_undispatched_in_band() {
                Some(id) => {
                    if s.runtime_initialized && !s.sync_received {
                        return None;
                    }
                    let event = s.unmanaged.get_mut(id).ok()?;
                    event.state.insert(EventState::DISPATCHED);
                    Pending::Native(id, event.event.clone())
                }
                None if s.sync_received => Pending::Managed(s.managed_queue.pop_front()?),
                None => return None,
            };

            s.stop_count += 2;
            s.synchronized = true;
            s.dispatching = Some(me);
            Some(pending)
        })
    }
}
