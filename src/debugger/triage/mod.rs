//! Classification of native debug events in interop debugging.
//!
//! Every native event stops the whole debugee, including the managed runtime. Some events
//! belong to the runtime itself, some are runtime talking to the debugger through flares,
//! some must be handled right away because the thread can't be stopped for long, and some
//! are ordinary events for the user. [`triage`] decides which is which, it is a pure function
//! of the facts gathered by the native event loop.

pub mod hijack;
pub mod thread;
pub mod unmanaged;

use crate::debugger::native::{ExceptionCode, NativeEvent, NativeEventKind};
use crate::debugger::runtime::Flare;
use crate::debugger::target::AddressKind;
use serde::{Deserialize, Serialize};
use strum_macros::Display;

/// What to do with a native event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Reaction {
    /// Continue silently.
    Ignore,
    /// Runtime handles this event on its own.
    BelongsToRuntime,
    /// Queue for user dispatch, resolved before the next real resume.
    InBand,
    /// Dispatch immediately, the thread can't wait for synchronization.
    OutOfBand,
    /// Hijacked thread entered the runtime stub.
    HijackStart,
    /// Hijacked thread finished the runtime stub.
    HijackComplete,
    /// Exception must be shown to the runtime before deciding who owns it.
    RequiresHijack,
    /// Exception redelivered after un-hijack, goes to the debugee's own handling.
    Retrigger,
}

/// What the engine knows about the event thread.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadFacts {
    /// Thread is inside a region where the runtime can't let it be stopped.
    pub cant_stop: bool,
    /// Runtime helper thread.
    pub is_helper: bool,
    /// Thread single-steps over a lifted breakpoint.
    pub stepping_over_breakpoint: bool,
    pub hijacked: bool,
    /// Exception re-raise expected after un-hijack.
    pub retrigger: bool,
}

/// Everything [`triage`] looks at.
#[derive(Clone, Debug)]
pub struct TriageInput<'a> {
    pub event: &'a NativeEvent,
    pub thread: ThreadFacts,
    /// Flare located at the exception address.
    pub flare: Option<Flare>,
    /// Exception address is a runtime patch.
    pub in_patch_table: bool,
    pub address_kind: AddressKind,
    /// Controller has the runtime synchronized.
    pub synchronized: bool,
    pub runtime_loaded: bool,
}

/// Decide what to do with a native event. First matching rule wins.
pub fn triage(input: &TriageInput) -> Reaction {
    let facts = &input.thread;
    let by_region = || {
        if facts.cant_stop {
            Reaction::OutOfBand
        } else {
            Reaction::InBand
        }
    };

    let NativeEventKind::Exception {
        code, first_chance, ..
    } = input.event.kind
    else {
        // lifecycle events are never for the runtime but may come from threads that can't wait
        return if facts.is_helper {
            Reaction::OutOfBand
        } else {
            by_region()
        };
    };

    if code.is_breakpoint() {
        if let Some(flare) = input.flare {
            return match flare {
                Flare::SyncComplete => Reaction::Ignore,
                Flare::HijackStarted | Flare::HandoffStarted => Reaction::HijackStart,
                Flare::HijackComplete | Flare::HandoffComplete => Reaction::HijackComplete,
                Flare::NotForRuntime => Reaction::InBand,
            };
        }
    }

    if code.is_single_step() && facts.stepping_over_breakpoint {
        return Reaction::Ignore;
    }

    if facts.retrigger {
        return Reaction::Retrigger;
    }

    if facts.is_helper {
        return if code.is_breakpoint() || code.is_single_step() {
            Reaction::OutOfBand
        } else {
            Reaction::BelongsToRuntime
        };
    }

    if input.in_patch_table && input.address_kind != AddressKind::RuntimeCode {
        return by_region();
    }

    if input.address_kind == AddressKind::RuntimeCode {
        return Reaction::BelongsToRuntime;
    }

    if facts.cant_stop {
        return Reaction::OutOfBand;
    }

    if code == ExceptionCode::STACK_OVERFLOW && facts.hijacked {
        // no stack left to hijack again
        return Reaction::InBand;
    }

    if first_chance
        && !code.is_breakpoint()
        && !code.is_single_step()
        && input.runtime_loaded
        && !input.synchronized
        && !facts.hijacked
    {
        return Reaction::RequiresHijack;
    }

    Reaction::InBand
}
