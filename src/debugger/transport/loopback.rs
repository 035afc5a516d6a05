//! In-process transport, both ends live in the same address space.
//!
//! Frames cross the channel in their encoded form so the codec is exercised exactly as with a
//! real shared memory buffer.

use crate::debugger::error::Error;
use crate::debugger::transport::message::IpcEvent;
use crate::debugger::transport::{Reply, Transport};
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Default)]
struct Channel {
    requests: VecDeque<Bytes>,
    /// Replies tagged with the sequence number of their arrival.
    replies: VecDeque<(u64, Bytes)>,
    notifications: VecDeque<Bytes>,
    terminated: Option<u64>,
    helper_dead: Option<u64>,
    seq: u64,
}

impl Channel {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Earliest signalled outcome of a reply wait.
    fn race_winner(&mut self) -> Option<Result<Reply, Error>> {
        let reply_seq = self.replies.front().map(|(seq, _)| *seq);
        let candidates = [
            (reply_seq, 0),
            (self.terminated, 1),
            (self.helper_dead, 2),
        ];
        let (_, winner) = candidates
            .iter()
            .filter_map(|(seq, idx)| seq.map(|s| (s, *idx)))
            .min()?;

        Some(match winner {
            0 => {
                let (_, frame) = self.replies.pop_front()?;
                IpcEvent::decode(&frame).map(Reply::Event)
            }
            1 => Ok(Reply::Terminated),
            _ => Ok(Reply::HelperDead),
        })
    }
}

struct Shared {
    chan: Mutex<Channel>,
    cv: Condvar,
}

/// Create a connected pair of transport ends.
pub fn loopback() -> (LoopbackTransport, RuntimeEndpoint) {
    let shared = Arc::new(Shared {
        chan: Mutex::new(Channel::default()),
        cv: Condvar::new(),
    });
    (
        LoopbackTransport {
            shared: shared.clone(),
        },
        RuntimeEndpoint { shared },
    )
}

/// Controller end of the loopback channel.
pub struct LoopbackTransport {
    shared: Arc<Shared>,
}

impl Transport for LoopbackTransport {
    fn send(&self, event: &IpcEvent) -> Result<(), Error> {
        let frame = event.encode()?;
        let mut chan = self.shared.chan.lock();
        if chan.terminated.is_some() {
            return Err(Error::ProcessTerminated);
        }
        chan.requests.push_back(frame);
        self.shared.cv.notify_all();
        Ok(())
    }

    fn wait_for_reply(&self, timeout: Duration) -> Result<Reply, Error> {
        let deadline = Instant::now() + timeout;
        let mut chan = self.shared.chan.lock();
        loop {
            if let Some(outcome) = chan.race_winner() {
                return outcome;
            }
            if self.shared.cv.wait_until(&mut chan, deadline).timed_out() {
                return chan.race_winner().unwrap_or(Ok(Reply::Timeout));
            }
        }
    }

    fn receive(&self, timeout: Duration) -> Result<Option<IpcEvent>, Error> {
        let deadline = Instant::now() + timeout;
        let mut chan = self.shared.chan.lock();
        loop {
            if let Some(frame) = chan.notifications.pop_front() {
                drop(chan);
                return IpcEvent::decode(&frame).map(Some);
            }
            if chan.terminated.is_some() {
                return Err(Error::ProcessTerminated);
            }
            if self.shared.cv.wait_until(&mut chan, deadline).timed_out() {
                return Ok(None);
            }
        }
    }
}

/// Runtime end of the loopback channel.
#[derive(Clone)]
pub struct RuntimeEndpoint {
    shared: Arc<Shared>,
}

impl RuntimeEndpoint {
    /// Wait for the next controller request.
    pub fn recv_request(&self, timeout: Duration) -> Result<Option<IpcEvent>, Error> {
        let deadline = Instant::now() + timeout;
        let mut chan = self.shared.chan.lock();
        loop {
            if let Some(frame) = chan.requests.pop_front() {
                drop(chan);
                return IpcEvent::decode(&frame).map(Some);
            }
            if self.shared.cv.wait_until(&mut chan, deadline).timed_out() {
                return Ok(None);
            }
        }
    }

    /// Acknowledge a two-way request.
    pub fn reply(&self, event: &IpcEvent) -> Result<(), Error> {
        let frame = event.encode()?;
        let mut chan = self.shared.chan.lock();
        let seq = chan.next_seq();
        chan.replies.push_back((seq, frame));
        self.shared.cv.notify_all();
        Ok(())
    }

    /// Queue a runtime originated event.
    pub fn notify(&self, event: &IpcEvent) -> Result<(), Error> {
        let frame = event.encode()?;
        self.notify_raw(frame);
        Ok(())
    }

    /// Queue an already encoded frame, may be garbage.
    pub fn notify_raw(&self, frame: Bytes) {
        let mut chan = self.shared.chan.lock();
        chan.notifications.push_back(frame);
        self.shared.cv.notify_all();
    }

    pub fn signal_terminated(&self) {
        let mut chan = self.shared.chan.lock();
        if chan.terminated.is_none() {
            let seq = chan.next_seq();
            chan.terminated = Some(seq);
        }
        self.shared.cv.notify_all();
    }

    pub fn signal_helper_dead(&self) {
        let mut chan = self.shared.chan.lock();
        if chan.helper_dead.is_none() {
            let seq = chan.next_seq();
            chan.helper_dead = Some(seq);
        }
        self.shared.cv.notify_all();
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.chan.lock().terminated.is_some()
    }
}
