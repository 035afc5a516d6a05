//! Fixed-format protocol messages exchanged with the debugee runtime.
//!
//! Every message is a 24 byte little-endian header followed by a per-type payload, the
//! whole frame must fit into a single transport buffer of [`IPC_BUFFER_SIZE`] bytes.

use crate::debugger::address::RemoteAddress;
use crate::debugger::error::Error;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use nix::unistd::Pid;
use strum_macros::{Display, FromRepr};

/// Size of send and receive buffers of the control channel.
pub const IPC_BUFFER_SIZE: usize = 4016;
pub const HEADER_SIZE: usize = 24;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MessageFlags: u8 {
        /// Sender expects a reply event.
        const TWO_WAY = 0b0001;
        /// Receiver must reply even if processing fails.
        const REPLY_REQUIRED = 0b0010;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, FromRepr)]
#[repr(u16)]
pub enum IpcEventType {
    // runtime -> controller
    RuntimeStartup = 0x0001,
    SyncComplete = 0x0002,
    Breakpoint = 0x0003,
    StepComplete = 0x0004,
    Exception = 0x0005,
    ThreadAttach = 0x0006,
    ThreadDetach = 0x0007,
    ModuleLoad = 0x0008,
    ModuleUnload = 0x0009,
    UserBreak = 0x000A,
    ExitProcess = 0x000B,

    // controller -> runtime
    AsyncBreak = 0x0101,
    Continue = 0x0102,
    Detach = 0x0103,
    ReleaseObject = 0x0104,

    // replies
    DetachResult = 0x0203,
    ReleaseObjectResult = 0x0204,
}

impl IpcEventType {
    /// Type of reply expected for a two-way event, `None` for one-way events.
    pub fn reply_type(self) -> Option<IpcEventType> {
        match self {
            IpcEventType::Detach => Some(IpcEventType::DetachResult),
            IpcEventType::ReleaseObject => Some(IpcEventType::ReleaseObjectResult),
            _ => None,
        }
    }

    /// True for notifications originated by the runtime and queued for user dispatch.
    pub fn is_notification(self) -> bool {
        (self as u16) < 0x0100 && self != IpcEventType::SyncComplete
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum IpcEventKind {
    RuntimeStartup,
    SyncComplete,
    Breakpoint {
        address: RemoteAddress,
    },
    StepComplete {
        address: RemoteAddress,
    },
    Exception {
        address: RemoteAddress,
        code: u32,
        first_chance: bool,
    },
    ThreadAttach,
    ThreadDetach,
    ModuleLoad {
        base: RemoteAddress,
        size: u64,
        name: String,
    },
    ModuleUnload {
        base: RemoteAddress,
    },
    UserBreak,
    ExitProcess {
        code: i32,
    },
    AsyncBreak,
    Continue {
        counter: u32,
    },
    Detach,
    ReleaseObject {
        handle: u64,
    },
    DetachResult,
    ReleaseObjectResult {
        handle: u64,
    },
}

impl IpcEventKind {
    pub fn event_type(&self) -> IpcEventType {
        match self {
            IpcEventKind::RuntimeStartup => IpcEventType::RuntimeStartup,
            IpcEventKind::SyncComplete => IpcEventType::SyncComplete,
            IpcEventKind::Breakpoint { .. } => IpcEventType::Breakpoint,
            IpcEventKind::StepComplete { .. } => IpcEventType::StepComplete,
            IpcEventKind::Exception { .. } => IpcEventType::Exception,
            IpcEventKind::ThreadAttach => IpcEventType::ThreadAttach,
            IpcEventKind::ThreadDetach => IpcEventType::ThreadDetach,
            IpcEventKind::ModuleLoad { .. } => IpcEventType::ModuleLoad,
            IpcEventKind::ModuleUnload { .. } => IpcEventType::ModuleUnload,
            IpcEventKind::UserBreak => IpcEventType::UserBreak,
            IpcEventKind::ExitProcess { .. } => IpcEventType::ExitProcess,
            IpcEventKind::AsyncBreak => IpcEventType::AsyncBreak,
            IpcEventKind::Continue { .. } => IpcEventType::Continue,
            IpcEventKind::Detach => IpcEventType::Detach,
            IpcEventKind::ReleaseObject { .. } => IpcEventType::ReleaseObject,
            IpcEventKind::DetachResult => IpcEventType::DetachResult,
            IpcEventKind::ReleaseObjectResult { .. } => IpcEventType::ReleaseObjectResult,
        }
    }

    fn put_payload(&self, buf: &mut BytesMut) -> Result<(), Error> {
        match self {
            IpcEventKind::Breakpoint { address } | IpcEventKind::StepComplete { address } => {
                buf.put_u64_le(address.as_u64())
            }
            IpcEventKind::Exception {
                address,
                code,
                first_chance,
            } => {
                buf.put_u64_le(address.as_u64());
                buf.put_u32_le(*code);
                buf.put_u8(*first_chance as u8);
            }
            IpcEventKind::ModuleLoad { base, size, name } => {
                let name_len = u16::try_from(name.len())
                    .map_err(|_| Error::EventTooLarge(HEADER_SIZE + name.len()))?;
                buf.put_u64_le(base.as_u64());
                buf.put_u64_le(*size);
                buf.put_u16_le(name_len);
                buf.put_slice(name.as_bytes());
            }
            IpcEventKind::ModuleUnload { base } => buf.put_u64_le(base.as_u64()),
            IpcEventKind::ExitProcess { code } => buf.put_i32_le(*code),
            IpcEventKind::Continue { counter } => buf.put_u32_le(*counter),
            IpcEventKind::ReleaseObject { handle }
            | IpcEventKind::ReleaseObjectResult { handle } => buf.put_u64_le(*handle),
            IpcEventKind::RuntimeStartup
            | IpcEventKind::SyncComplete
            | IpcEventKind::ThreadAttach
            | IpcEventKind::ThreadDetach
            | IpcEventKind::UserBreak
            | IpcEventKind::AsyncBreak
            | IpcEventKind::Detach
            | IpcEventKind::DetachResult => {}
        }
        Ok(())
    }

    fn from_payload(t: IpcEventType, mut payload: &[u8]) -> Result<Self, Error> {
        let buf = &mut payload;
        let kind = match t {
            IpcEventType::RuntimeStartup => IpcEventKind::RuntimeStartup,
            IpcEventType::SyncComplete => IpcEventKind::SyncComplete,
            IpcEventType::Breakpoint => IpcEventKind::Breakpoint {
                address: get_u64(buf)?.into(),
            },
            IpcEventType::StepComplete => IpcEventKind::StepComplete {
                address: get_u64(buf)?.into(),
            },
            IpcEventType::Exception => {
                let address = get_u64(buf)?.into();
                let code = get_u32(buf)?;
                need(buf, 1)?;
                let first_chance = buf.get_u8() != 0;
                IpcEventKind::Exception {
                    address,
                    code,
                    first_chance,
                }
            }
            IpcEventType::ThreadAttach => IpcEventKind::ThreadAttach,
            IpcEventType::ThreadDetach => IpcEventKind::ThreadDetach,
            IpcEventType::ModuleLoad => {
                let base = get_u64(buf)?.into();
                let size = get_u64(buf)?;
                need(buf, 2)?;
                let name_len = buf.get_u16_le() as usize;
                need(buf, name_len)?;
                let name = std::str::from_utf8(&buf[..name_len])
                    .map_err(|_| Error::MalformedEvent("module name is not utf-8"))?
                    .to_string();
                buf.advance(name_len);
                IpcEventKind::ModuleLoad { base, size, name }
            }
            IpcEventType::ModuleUnload => IpcEventKind::ModuleUnload {
                base: get_u64(buf)?.into(),
            },
            IpcEventType::UserBreak => IpcEventKind::UserBreak,
            IpcEventType::ExitProcess => IpcEventKind::ExitProcess {
                code: get_u32(buf)? as i32,
            },
            IpcEventType::AsyncBreak => IpcEventKind::AsyncBreak,
            IpcEventType::Continue => IpcEventKind::Continue {
                counter: get_u32(buf)?,
            },
            IpcEventType::Detach => IpcEventKind::Detach,
            IpcEventType::ReleaseObject => IpcEventKind::ReleaseObject {
                handle: get_u64(buf)?,
            },
            IpcEventType::DetachResult => IpcEventKind::DetachResult,
            IpcEventType::ReleaseObjectResult => IpcEventKind::ReleaseObjectResult {
                handle: get_u64(buf)?,
            },
        };

        if buf.has_remaining() {
            return Err(Error::MalformedEvent("trailing bytes after payload"));
        }
        Ok(kind)
    }
}

fn need(buf: &&[u8], n: usize) -> Result<(), Error> {
    if buf.remaining() < n {
        return Err(Error::MalformedEvent("truncated frame"));
    }
    Ok(())
}

fn get_u64(buf: &mut &[u8]) -> Result<u64, Error> {
    need(buf, 8)?;
    Ok(buf.get_u64_le())
}

fn get_u32(buf: &mut &[u8]) -> Result<u32, Error> {
    need(buf, 4)?;
    Ok(buf.get_u32_le())
}

/// Protocol message.
#[derive(Clone, Debug, PartialEq)]
pub struct IpcEvent {
    pub kind: IpcEventKind,
    /// Debugee process id.
    pub process: Pid,
    /// Thread the event relates to, if any.
    pub thread: Option<Pid>,
    pub flags: MessageFlags,
    /// Result code, meaningful for replies only.
    pub status: i32,
    /// Request sequence number, a reply carries the number of its request.
    pub seq: u32,
}

impl IpcEvent {
    pub fn new(process: Pid, kind: IpcEventKind) -> Self {
        let flags = if kind.event_type().reply_type().is_some() {
            MessageFlags::TWO_WAY | MessageFlags::REPLY_REQUIRED
        } else {
            MessageFlags::empty()
        };
        Self {
            kind,
            process,
            thread: None,
            flags,
            status: 0,
            seq: 0,
        }
    }

    /// Reply of `kind` to `request`.
    pub fn reply_to(request: &IpcEvent, kind: IpcEventKind) -> Self {
        Self {
            thread: request.thread,
            seq: request.seq,
            ..Self::new(request.process, kind)
        }
    }

    pub fn with_status(self, status: i32) -> Self {
        Self { status, ..self }
    }

    pub fn with_thread(self, thread: Pid) -> Self {
        Self {
            thread: Some(thread),
            ..self
        }
    }

    pub fn event_type(&self) -> IpcEventType {
        self.kind.event_type()
    }

    pub fn is_two_way(&self) -> bool {
        self.flags.contains(MessageFlags::TWO_WAY)
    }

    /// Serialize into a single transport frame.
    pub fn encode(&self) -> Result<Bytes, Error> {
        let mut payload = BytesMut::new();
        self.kind.put_payload(&mut payload)?;

        let total = HEADER_SIZE + payload.len();
        if total > IPC_BUFFER_SIZE {
            return Err(Error::EventTooLarge(total));
        }

        let mut frame = BytesMut::with_capacity(total);
        frame.put_u16_le(self.event_type() as u16);
        frame.put_u8(self.flags.bits());
        frame.put_u8(0);
        frame.put_u32_le(self.process.as_raw() as u32);
        frame.put_u32_le(self.thread.map(|t| t.as_raw() as u32).unwrap_or(0));
        frame.put_i32_le(self.status);
        frame.put_u32_le(payload.len() as u32);
        frame.put_u32_le(self.seq);
        frame.put_slice(&payload);
        Ok(frame.freeze())
    }

    /// Parse a transport frame.
    pub fn decode(frame: &[u8]) -> Result<Self, Error> {
        if frame.len() > IPC_BUFFER_SIZE {
            return Err(Error::EventTooLarge(frame.len()));
        }
        if frame.len() < HEADER_SIZE {
            return Err(Error::MalformedEvent("frame shorter than header"));
        }

        let mut header = &frame[..HEADER_SIZE];
        let raw_type = header.get_u16_le();
        let t = IpcEventType::from_repr(raw_type).ok_or(Error::UnknownEventType(raw_type))?;
        let flags = MessageFlags::from_bits(header.get_u8())
            .ok_or(Error::MalformedEvent("unknown message flags"))?;
        header.advance(1);
        let process = Pid::from_raw(header.get_u32_le() as i32);
        let thread = match header.get_u32_le() {
            0 => None,
            tid => Some(Pid::from_raw(tid as i32)),
        };
        let status = header.get_i32_le();
        let payload_len = header.get_u32_le() as usize;
        let seq = header.get_u32_le();

        let payload = &frame[HEADER_SIZE..];
        if payload.len() != payload_len {
            return Err(Error::MalformedEvent("payload length mismatch"));
        }

        Ok(Self {
            kind: IpcEventKind::from_payload(t, payload)?,
            process,
            thread,
            flags,
            status,
            seq,
        })
    }
}
