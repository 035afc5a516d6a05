pub mod loopback;
pub mod message;

use crate::debugger::error::Error;
use crate::debugger::transport::message::IpcEvent;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

pub use loopback::{loopback, LoopbackTransport, RuntimeEndpoint};

/// Outcome of waiting for a reply to a two-way event.
#[derive(Debug)]
pub enum Reply {
    Event(IpcEvent),
    Timeout,
    /// Debugee died before acknowledgement.
    Terminated,
    /// Runtime helper thread died before acknowledgement.
    HelperDead,
}

/// Control channel between controller and debugee runtime.
pub trait Transport: Send + Sync {
    /// Send event into the runtime.
    fn send(&self, event: &IpcEvent) -> Result<(), Error>;

    /// Wait for the reply of the last two-way event. The first of acknowledgement, debugee
    /// termination or helper thread death wins.
    fn wait_for_reply(&self, timeout: Duration) -> Result<Reply, Error>;

    /// Wait for the next runtime originated event. `Ok(None)` when nothing arrived in `timeout`,
    /// [`Error::ProcessTerminated`] when runtime side is gone and all events are drained.
    fn receive(&self, timeout: Duration) -> Result<Option<IpcEvent>, Error>;
}

static NEXT_SEQ: AtomicU32 = AtomicU32::new(1);

/// Send a two-way event and wait for reply of the expected type. Replies to other requests
/// (late acknowledgements of timed out exchanges) are dropped. Non-zero reply status is an
/// error.
pub fn send_two_way(
    transport: &dyn Transport,
    event: &IpcEvent,
    timeout: Duration,
) -> Result<IpcEvent, Error> {
    let expected = event
        .event_type()
        .reply_type()
        .ok_or(Error::MalformedEvent("one-way event sent as two-way"))?;

    let request = IpcEvent {
        seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
        ..event.clone()
    };
    log::debug!(target: "transport", "send two-way {} #{}", request.event_type(), request.seq);
    transport.send(&request)?;

    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let reply = match transport.wait_for_reply(remaining)? {
            Reply::Event(reply) => reply,
            Reply::Timeout => return Err(Error::Timeout(timeout)),
            Reply::Terminated => return Err(Error::ProcessTerminated),
            Reply::HelperDead => return Err(Error::HelperThreadDead),
        };

        if reply.seq != request.seq {
            log::debug!(
                target: "transport",
                "drop stale reply {} #{}, waiting for #{}",
                reply.event_type(),
                reply.seq,
                request.seq
            );
            continue;
        }
        if reply.event_type() != expected {
            return Err(Error::UnexpectedReply {
                got: reply.event_type(),
                expected,
            });
        }
        if reply.status != 0 {
            return Err(Error::ReplyStatus {
                reply: expected,
                status: reply.status,
            });
        }
        return Ok(reply);
    }
}
