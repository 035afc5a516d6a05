//! Native debug events and the native debug API seam.

use crate::debugger::address::RemoteAddress;
use crate::debugger::error::Error;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::time::Duration;

/// Native exception code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExceptionCode(pub u32);

impl ExceptionCode {
    pub const BREAKPOINT: ExceptionCode = ExceptionCode(0x8000_0003);
    pub const SINGLE_STEP: ExceptionCode = ExceptionCode(0x8000_0004);
    pub const ACCESS_VIOLATION: ExceptionCode = ExceptionCode(0xC000_0005);
    pub const STACK_OVERFLOW: ExceptionCode = ExceptionCode(0xC000_00FD);

    pub fn is_breakpoint(self) -> bool {
        self == Self::BREAKPOINT
    }

    pub fn is_single_step(self) -> bool {
        self == Self::SINGLE_STEP
    }
}

impl Display for ExceptionCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::BREAKPOINT => f.write_str("breakpoint"),
            Self::SINGLE_STEP => f.write_str("single step"),
            Self::ACCESS_VIOLATION => f.write_str("access violation"),
            Self::STACK_OVERFLOW => f.write_str("stack overflow"),
            ExceptionCode(code) => write!(f, "exception {code:#010x}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NativeEventKind {
    Exception {
        code: ExceptionCode,
        address: RemoteAddress,
        first_chance: bool,
    },
    CreateThread,
    ExitThread {
        code: i32,
    },
    CreateProcess,
    ExitProcess {
        code: i32,
    },
    LoadDll {
        base: RemoteAddress,
    },
    UnloadDll {
        base: RemoteAddress,
    },
    DebugString {
        message: String,
    },
}

/// Event reported by the operating system debug API.
#[derive(Clone, Debug, PartialEq)]
pub struct NativeEvent {
    pub process: Pid,
    pub thread: Pid,
    pub kind: NativeEventKind,
}

impl NativeEvent {
    /// Exception code and address if this is an exception event.
    pub fn exception(&self) -> Option<(ExceptionCode, RemoteAddress)> {
        match self.kind {
            NativeEventKind::Exception { code, address, .. } => Some((code, address)),
            _ => None,
        }
    }

    pub fn is_first_chance_exception(&self) -> bool {
        matches!(
            self.kind,
            NativeEventKind::Exception {
                first_chance: true,
                ..
            }
        )
    }
}

impl Display for NativeEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            NativeEventKind::Exception {
                code,
                address,
                first_chance,
            } => {
                let chance = if *first_chance { "first" } else { "last" };
                write!(f, "{code} at {address} ({chance} chance)")?
            }
            NativeEventKind::CreateThread => f.write_str("create thread")?,
            NativeEventKind::ExitThread { code } => write!(f, "exit thread ({code})")?,
            NativeEventKind::CreateProcess => f.write_str("create process")?,
            NativeEventKind::ExitProcess { code } => write!(f, "exit process ({code})")?,
            NativeEventKind::LoadDll { base } => write!(f, "load dll at {base}")?,
            NativeEventKind::UnloadDll { base } => write!(f, "unload dll at {base}")?,
            NativeEventKind::DebugString { message } => write!(f, "debug string {message:?}")?,
        };
        write!(f, " on thread {}", self.thread)
    }
}

/// How an exception event is continued.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContinueStatus {
    /// Exception is dismissed, thread resumes at its current context.
    Handled,
    /// Exception goes to the debugee's own handling.
    NotHandled,
}

/// Register state of a native thread.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ThreadContext {
    /// Instruction pointer. For breakpoint exceptions it points to the breakpoint instruction.
    pub pc: u64,
    pub sp: u64,
    /// Trap flag, when set the thread raises a single-step exception after next instruction.
    pub single_step: bool,
    pub gpr: [u64; 16],
}

/// Operating system debug API of the debugee.
pub trait NativePump: Send + Sync {
    /// Wait for the next native event. `Ok(None)` when nothing arrived in `timeout`.
    /// The debugee stays frozen until the returned event is continued.
    fn wait_for_event(&self, timeout: Duration) -> Result<Option<NativeEvent>, Error>;

    fn continue_event(&self, event: &NativeEvent, status: ContinueStatus) -> Result<(), Error>;

    fn suspend_thread(&self, tid: Pid) -> Result<(), Error>;

    fn resume_thread(&self, tid: Pid) -> Result<(), Error>;

    fn get_context(&self, tid: Pid) -> Result<ThreadContext, Error>;

    fn set_context(&self, tid: Pid, ctx: &ThreadContext) -> Result<(), Error>;
}
