//! Stop/continue protocol.
//!
//! Every successful stop increments the stop count and every continue decrements it. Only the
//! continue that brings the count to zero resumes the debugee.

use crate::debugger::error::Error;
use crate::debugger::process::Process;
use crate::debugger::transport::message::{IpcEvent, IpcEventKind};
use crate::debugger::triage::unmanaged::{EventId, EventState};
use log::{debug, trace};
use std::thread;
use std::time::{Duration, Instant};

enum StopPlan {
    Done,
    Wait,
}

enum ContinuePlan {
    /// Count still positive.
    Absorbed,
    /// Resume native threads suspended by an uninitialized stop.
    ResumeSuspended,
    /// Queued notifications remain, dispatcher takes over without resuming the runtime.
    HandOver {
        in_band: Vec<EventId>,
        oob_pending: bool,
    },
    Resume {
        in_band: Vec<EventId>,
        oob_pending: bool,
        counter: u32,
        send_continue: bool,
    },
}

impl Process {
    /// Synchronize the debugee. Blocks until the runtime reports sync complete, `None`
    /// timeout means wait forever.
    pub fn stop(&self, timeout: Option<Duration>) -> Result<(), Error> {
        self.fail_fast()?;
        let _stop_go = self.stop_go.lock();
        let me = thread::current().id();

        let plan = self.with_state(|s| -> Result<StopPlan, Error> {
            if s.synchronized {
                s.stop_count += 1;
                trace!(target: "stopgo", "nested stop, count {}", s.stop_count);
                return Ok(StopPlan::Done);
            }

            if !s.runtime_initialized {
                if let Some(pump) = &self.pump {
                    let threads = self.data.threads()?;
                    s.threads.suspend_all(pump.as_ref(), &threads)?;
                }
                s.uninitialized_stop = true;
                s.synchronized = true;
                s.stop_count += 1;
                debug!(target: "stopgo", "stop before runtime is loaded");
                return Ok(StopPlan::Done);
            }

            if s.sync_received {
                // runtime already stopped, its events are not dispatched yet
                s.synchronized = true;
                s.stop_count += 1;
                debug!(target: "stopgo", "stop on already stopped runtime");
                return Ok(StopPlan::Done);
            }

            if s.dispatch_thread == Some(me)
                || s.dispatching == Some(me)
                || s.dispatching_oob == Some(me)
            {
                return Err(Error::StopOnDispatchThread);
            }
            // sync complete handled after this point must not be lost
            self.stop_signal.reset();
            s.stop_pending = true;
            Ok(StopPlan::Wait)
        })?;

        if let StopPlan::Done = plan {
            return Ok(());
        }

        debug!(target: "stopgo", "send async break");
        let sent = self.transport.send(&IpcEvent::new(self.pid(), IpcEventKind::AsyncBreak));
        if let Err(e) = sent {
            self.with_state(|s| s.stop_pending = false);
            return self.check_fatal(Err(e));
        }

        debug_assert!(!self.state.is_owned_by_current_thread());
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let settled =
                self.with_state(|s| s.sync_received || s.terminated || s.unrecoverable.is_some());
            if settled {
                break;
            }
            let remaining = match deadline {
                None => None,
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(remaining) if !remaining.is_zero() => Some(remaining),
                    _ => break,
                },
            };
            self.stop_signal.wait(remaining);
        }

        self.with_state(|s| {
            s.stop_pending = false;
            if let Some(reason) = &s.unrecoverable {
                return Err(Error::Unrecoverable(reason.clone()));
            }
            if s.terminated {
                return Err(Error::ProcessTerminated);
            }
            if !s.sync_received {
                debug!(target: "stopgo", "stop timed out");
                return Err(Error::Timeout(timeout.unwrap_or_default()));
            }
            s.synchronized = true;
            s.stop_count += 1;
            debug!(target: "stopgo", "process synchronized, count {}", s.stop_count);
            Ok(())
        })
    }

    /// Synchronize the debugee, waiting at most the configured stop timeout.
    pub fn stop_default(&self) -> Result<(), Error> {
        self.stop(self.config.stop_timeout())
    }

    /// Undo one stop. With `out_of_band` set continue the out-of-band event currently
    /// dispatched instead, the stop count is untouched then.
    pub fn continue_debugee(&self, out_of_band: bool) -> Result<(), Error> {
        if out_of_band {
            return self.continue_out_of_band();
        }
        self.fail_fast()?;
        let _stop_go = self.stop_go.lock();
        self.do_continue(false)
    }

    fn continue_out_of_band(&self) -> Result<(), Error> {
        self.fail_fast()?;
        self.with_state(|s| -> Result<(), Error> {
            let id = s
                .unmanaged
                .current_out_of_band()
                .ok_or(Error::NoOutOfBandEvent)?;
            s.unmanaged
                .get_mut(id)?
                .state
                .insert(EventState::CONTINUE_REQUESTED);
            debug!(target: "stopgo", "continue out-of-band event {id}");
            Ok(())
        })?;
        self.oob_signal.set();
        Ok(())
    }

    /// Continue with the stop-go lock held. `from_guard` is set by the dispatch guard, which
    /// is the only one allowed to go below the dispatch floor.
    pub(super) fn do_continue(&self, from_guard: bool) -> Result<(), Error> {
        let me = thread::current().id();

        let plan = self.with_state(|s| {
            if !from_guard && s.dispatching_oob == Some(me) {
                return Err(Error::InBandContinueFromOutOfBand);
            }
            if s.stop_count == 0 {
                return Err(Error::SuperfluousContinue);
            }
            if !from_guard && s.dispatching.is_some() && s.stop_count <= 1 {
                return Err(Error::SuperfluousContinue);
            }

            s.stop_count -= 1;
            if s.stop_count > 0 {
                trace!(target: "stopgo", "continue absorbed, count {}", s.stop_count);
                return Ok(ContinuePlan::Absorbed);
            }

            if s.uninitialized_stop {
                s.uninitialized_stop = false;
                s.synchronized = false;
                return Ok(ContinuePlan::ResumeSuspended);
            }

            let oob_pending = s.unmanaged.has_out_of_band();
            if s.synchronized && s.has_pending_notifications() {
                s.synchronized = false;
                return Ok(ContinuePlan::HandOver {
                    in_band: s.request_in_band_continue(false),
                    oob_pending,
                });
            }

            s.patches.invalidate();
            s.continue_counter += 1;
            s.synchronized = false;
            Ok(ContinuePlan::Resume {
                in_band: s.request_in_band_continue(false),
                oob_pending,
                counter: s.continue_counter,
                send_continue: std::mem::take(&mut s.sync_received),
            })
        })?;

        debug_assert!(!self.state.is_owned_by_current_thread());
        match plan {
            ContinuePlan::Absorbed => Ok(()),
            ContinuePlan::ResumeSuspended => {
                debug!(target: "stopgo", "resume suspended native threads");
                match &self.pump {
                    Some(pump) => self.check_fatal(
                        self.with_state(|s| s.threads.resume_suspended(pump.as_ref())),
                    ),
                    None => Ok(()),
                }
            }
            ContinuePlan::HandOver {
                in_band,
                oob_pending,
            } => {
                debug!(target: "stopgo", "queued notifications left, hand over to dispatcher");
                self.check_fatal(self.continue_in_band(in_band, oob_pending))
            }
            ContinuePlan::Resume {
                in_band,
                oob_pending,
                counter,
                send_continue,
            } => {
                self.check_fatal(self.continue_in_band(in_band, oob_pending))?;
                if send_continue {
                    debug!(target: "stopgo", "resume runtime, continue #{counter}");
                    let request = IpcEvent::new(self.pid(), IpcEventKind::Continue { counter });
                    self.check_fatal(self.transport.send(&request))?;
                }
                self.cleanup_sweeps();
                Ok(())
            }
        }
    }
}
