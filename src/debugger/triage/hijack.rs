//! Thread hijacking: redirect a stopped thread into a runtime stub and put it back later.

use crate::debugger::address::RemoteAddress;
use crate::debugger::error::Error;
use crate::debugger::native::NativePump;
use crate::debugger::target::{DataAccess, DataAccessExt, RemoteThreadInfo};
use crate::debugger::triage::thread::{HijackKind, HijackState, UnmanagedThread};
use crate::debugger::triage::unmanaged::EventId;
use log::debug;

/// Stack area below sp the interrupted code may still use.
const RED_ZONE: u64 = 128;
const STACK_ALIGN: u64 = 16;

/// Index of the general purpose register carrying the hijack kind into the stub.
pub const KIND_REGISTER: usize = 0;

/// Redirect `thread` into the runtime stub at `stub`. Thread context and the head of its
/// exception handler chain are saved for [`unhijack`].
pub fn hijack(
    pump: &dyn NativePump,
    data: &dyn DataAccess,
    thread: &mut UnmanagedThread,
    remote: &RemoteThreadInfo,
    stub: RemoteAddress,
    kind: HijackKind,
    event: EventId,
) -> Result<(), Error> {
    if thread.is_hijacked() {
        return Err(Error::AlreadyHijacked(thread.tid));
    }

    let saved_context = pump.get_context(thread.tid)?;
    let saved_handler_chain = remote
        .handler_chain_slot
        .map(|slot| data.read_u64(slot))
        .transpose()?;

    let mut ctx = saved_context;
    ctx.sp = (saved_context.sp.saturating_sub(RED_ZONE) & !(STACK_ALIGN - 1)).saturating_sub(8);
    ctx.pc = stub.as_u64();
    ctx.single_step = false;
    ctx.gpr[KIND_REGISTER] = match kind {
        HijackKind::Generic => 0,
        HijackKind::FirstChance => 1,
    };
    pump.set_context(thread.tid, &ctx)?;

    debug!(
        target: "triage",
        "hijack thread {} ({kind:?}) from {:#x} into {stub}",
        thread.tid, saved_context.pc
    );
    thread.hijack = Some(HijackState {
        kind,
        event,
        saved_context,
        saved_handler_chain,
    });
    thread.in_stub = false;
    Ok(())
}

/// Put a hijacked thread back: restore exact prior context and exception handler chain head.
pub fn unhijack(
    pump: &dyn NativePump,
    data: &dyn DataAccess,
    thread: &mut UnmanagedThread,
    remote: &RemoteThreadInfo,
) -> Result<HijackState, Error> {
    let state = thread.hijack.ok_or(Error::NotHijacked(thread.tid))?;

    if let (Some(slot), Some(head)) = (remote.handler_chain_slot, state.saved_handler_chain) {
        data.write_u64(slot, head)?;
    }
    pump.set_context(thread.tid, &state.saved_context)?;

    debug!(
        target: "triage",
        "unhijack thread {} back to {:#x}",
        thread.tid, state.saved_context.pc
    );
    thread.hijack = None;
    thread.in_stub = false;
    Ok(state)
}
