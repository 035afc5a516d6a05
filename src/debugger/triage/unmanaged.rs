use crate::debugger::error::Error;
use crate::debugger::native::{NativeEvent, NativeEventKind};
use bitflags::bitflags;
use std::collections::{HashMap, VecDeque};
use std::fmt::{Display, Formatter};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct EventState: u16 {
        const QUEUED = 1 << 0;
        const DISPATCHED = 1 << 1;
        /// Native event continued while the thread stays hijacked.
        const CONTINUED_HIJACKED = 1 << 2;
        const CONTINUED_UNHIJACKED = 1 << 3;
        const EXCEPTION_CLEARED = 1 << 4;
        /// Last chance exception, can't be cleared.
        const UNCLEARABLE = 1 << 5;
        /// User asked to continue the event.
        const CONTINUE_REQUESTED = 1 << 6;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub u64);

impl Display for EventId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ue#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Band {
    InBand,
    OutOfBand,
}

/// Native event tracked by the engine.
#[derive(Clone, Debug)]
pub struct UnmanagedEvent {
    pub id: EventId,
    pub event: NativeEvent,
    pub state: EventState,
    band: Option<Band>,
}

impl UnmanagedEvent {
    pub fn band(&self) -> Option<Band> {
        self.band
    }

    pub fn is_exception(&self) -> bool {
        matches!(self.event.kind, NativeEventKind::Exception { .. })
    }

    pub fn is_continued(&self) -> bool {
        self.state
            .intersects(EventState::CONTINUED_HIJACKED | EventState::CONTINUED_UNHIJACKED)
    }

    pub fn is_exception_cleared(&self) -> bool {
        self.state.contains(EventState::EXCEPTION_CLEARED)
    }
}

/// Native events known to the engine and the two dispatch queues.
/// An event sits in at most one queue.
#[derive(Default)]
pub struct UnmanagedQueues {
    events: HashMap<EventId, UnmanagedEvent>,
    in_band: VecDeque<EventId>,
    out_of_band: VecDeque<EventId>,
    next_id: u64,
}

impl UnmanagedQueues {
    /// Start tracking a native event.
    pub fn track(&mut self, event: NativeEvent) -> EventId {
        self.next_id += 1;
        let id = EventId(self.next_id);
        let state = match event.kind {
            NativeEventKind::Exception {
                first_chance: false,
                ..
            } => EventState::UNCLEARABLE,
            _ => EventState::empty(),
        };
        self.events.insert(
            id,
            UnmanagedEvent {
                id,
                event,
                state,
                band: None,
            },
        );
        id
    }

    pub fn get(&self, id: EventId) -> Result<&UnmanagedEvent, Error> {
        self.events.get(&id).ok_or(Error::EventNotFound(id.0))
    }

    pub fn get_mut(&mut self, id: EventId) -> Result<&mut UnmanagedEvent, Error> {
        self.events.get_mut(&id).ok_or(Error::EventNotFound(id.0))
    }

    /// Put an event in the back of a queue, moving it out of any other queue.
    pub fn enqueue(&mut self, id: EventId, band: Band) -> Result<(), Error> {
        self.dequeue(id)?;
        let event = self.get_mut(id)?;
        event.band = Some(band);
        event.state.insert(EventState::QUEUED);
        match band {
            Band::InBand => self.in_band.push_back(id),
            Band::OutOfBand => self.out_of_band.push_back(id),
        }
        Ok(())
    }

    /// Take an event out of its queue, it stays tracked.
    pub fn dequeue(&mut self, id: EventId) -> Result<(), Error> {
        let event = self.events.get_mut(&id).ok_or(Error::EventNotFound(id.0))?;
        match event.band.take() {
            Some(Band::InBand) => self.in_band.retain(|e| *e != id),
            Some(Band::OutOfBand) => self.out_of_band.retain(|e| *e != id),
            None => {}
        }
        event.state.remove(EventState::QUEUED);
        Ok(())
    }

    /// Stop tracking an event.
    pub fn remove(&mut self, id: EventId) -> Option<UnmanagedEvent> {
        self.dequeue(id).ok()?;
        self.events.remove(&id)
    }

    /// Oldest in-band event not dispatched yet.
    pub fn next_undispatched_in_band(&self) -> Option<EventId> {
        self.in_band
            .iter()
            .copied()
            .find(|id| !self.events[id].state.contains(EventState::DISPATCHED))
    }

    pub fn has_undispatched_in_band(&self) -> bool {
        self.next_undispatched_in_band().is_some()
    }

    /// In-band events dispatched to the user but not continued yet.
    pub fn dispatched_in_band(&self) -> Vec<EventId> {
        self.in_band
            .iter()
            .copied()
            .filter(|id| {
                let state = self.events[id].state;
                state.contains(EventState::DISPATCHED)
                    && !state.contains(EventState::CONTINUE_REQUESTED)
            })
            .collect()
    }

    /// Out-of-band event the user currently looks at.
    pub fn current_out_of_band(&self) -> Option<EventId> {
        self.out_of_band.iter().copied().find(|id| {
            let state = self.events[id].state;
            state.contains(EventState::DISPATCHED)
                && !state.contains(EventState::CONTINUE_REQUESTED)
        })
    }

    pub fn in_band_ids(&self) -> Vec<EventId> {
        self.in_band.iter().copied().collect()
    }

    pub fn has_out_of_band(&self) -> bool {
        !self.out_of_band.is_empty()
    }

    pub fn in_band_len(&self) -> usize {
        self.in_band.len()
    }

    /// Mark exception of the event as handled by the user.
    pub fn clear_exception(&mut self, id: EventId) -> Result<(), Error> {
        let event = self.get_mut(id)?;
        if event.state.contains(EventState::UNCLEARABLE) {
            return Err(Error::Unclearable(id.0));
        }
        if event.is_exception() {
            event.state.insert(EventState::EXCEPTION_CLEARED);
        }
        Ok(())
    }

    /// Forget everything, used when the debugee is gone.
    pub fn clear(&mut self) {
        self.events.clear();
        self.in_band.clear();
        self.out_of_band.clear();
    }
}
