//! Triage scenarios: a TOML description of the debugee surroundings and a list of native events,
//! replayed through [`crate::debugger::triage::triage`].
//!
//! ```toml
//! runtime_loaded = true
//! runtime_code = [[0x1000, 0x2000]]
//! patches = [0x4000]
//!
//! [flares]
//! sync_complete = 0x5100
//! hijack_started = 0x5110
//! handoff_started = 0x5120
//! handoff_complete = 0x5130
//! hijack_complete = 0x5140
//! not_for_runtime = 0x5150
//!
//! [threads.7]
//! cant_stop = true
//!
//! [[events]]
//! thread = 7
//! type = "exception"
//! code = 0x80000003
//! address = 0x4000
//! first_chance = true
//! ```

use crate::debugger::address::RemoteAddress;
use crate::debugger::error::Error;
use crate::debugger::native::{NativeEvent, NativeEventKind};
use crate::debugger::runtime::Flares;
use crate::debugger::target::AddressKind;
use crate::debugger::triage::{triage, Reaction, ThreadFacts, TriageInput};
use nix::unistd::Pid;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Deserialize)]
pub struct ScenarioEvent {
    pub thread: i32,
    #[serde(flatten)]
    pub kind: NativeEventKind,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Scenario {
    pub runtime_loaded: bool,
    pub synchronized: bool,
    /// Half-open `[start, end)` ranges of runtime code.
    pub runtime_code: Vec<[u64; 2]>,
    pub runtime_data: Vec<[u64; 2]>,
    /// Addresses of runtime breakpoint patches.
    pub patches: Vec<u64>,
    pub flares: Option<Flares>,
    /// Facts per thread id, threads not listed have none.
    pub threads: HashMap<String, ThreadFacts>,
    pub events: Vec<ScenarioEvent>,
}

/// Outcome of a single scenario event.
#[derive(Debug)]
pub struct Verdict {
    pub event: NativeEvent,
    pub reaction: Reaction,
}

fn in_ranges(ranges: &[[u64; 2]], addr: RemoteAddress) -> bool {
    let addr = addr.as_u64();
    ranges
        .iter()
        .any(|[start, end]| (*start..*end).contains(&addr))
}

impl Scenario {
    pub fn parse(data: &str) -> Result<Self, Error> {
        Ok(toml::from_str(data)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, Error> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    fn classify(&self, addr: RemoteAddress) -> AddressKind {
        if in_ranges(&self.runtime_code, addr) {
            AddressKind::RuntimeCode
        } else if in_ranges(&self.runtime_data, addr) {
            AddressKind::RuntimeData
        } else {
            AddressKind::Unrecognized
        }
    }

    fn facts(&self, thread: i32) -> ThreadFacts {
        self.threads
            .get(&thread.to_string())
            .copied()
            .unwrap_or_default()
    }

    /// Triage every event of the scenario in order.
    pub fn replay(&self) -> Vec<Verdict> {
        self.events
            .iter()
            .map(|e| {
                let event = NativeEvent {
                    process: Pid::from_raw(0),
                    thread: Pid::from_raw(e.thread),
                    kind: e.kind.clone(),
                };
                let exception = event.exception();
                let flare = match (exception, self.flares) {
                    (Some((code, addr)), Some(flares)) if code.is_breakpoint() => {
                        flares.find(addr)
                    }
                    _ => None,
                };
                let in_patch_table = exception
                    .map(|(_, addr)| self.patches.contains(&addr.as_u64()))
                    .unwrap_or(false);
                let address_kind = exception
                    .map(|(_, addr)| self.classify(addr))
                    .unwrap_or(AddressKind::Unrecognized);

                let reaction = triage(&TriageInput {
                    event: &event,
                    thread: self.facts(e.thread),
                    flare,
                    in_patch_table,
                    address_kind,
                    synchronized: self.synchronized,
                    runtime_loaded: self.runtime_loaded,
                });
                Verdict { event, reaction }
            })
            .collect()
    }
}
