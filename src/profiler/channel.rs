//! Sinks for wire events.
//!
//! The host registers a provider on its tracing channel and hands the agent a
//! [`TraceChannel`] for emission. The agent never blocks on the channel: an
//! emit failure is logged and the event is dropped.

use crate::profiler::events::ProfilerEvent;
use std::sync::{Arc, Mutex};

pub trait TraceChannel: Send {
    fn emit(&mut self, event: &ProfilerEvent) -> std::io::Result<()>;
}

/// A channel that discards all events. Useful for benchmarking callback
/// overhead without emission costs.
pub struct NullChannel;

impl TraceChannel for NullChannel {
    fn emit(&mut self, _event: &ProfilerEvent) -> std::io::Result<()> {
        Ok(())
    }
}

/// A channel that records every event in memory.
///
/// Clones share the same buffer, so a test (or tool) can keep one clone for
/// inspection and hand the other to the agent.
#[derive(Clone, Default)]
pub struct MemoryChannel {
    events: Arc<Mutex<Vec<ProfilerEvent>>>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything emitted so far.
    pub fn snapshot(&self) -> Vec<ProfilerEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Drain the buffer, returning everything emitted since the last take.
    pub fn take(&self) -> Vec<ProfilerEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TraceChannel for MemoryChannel {
    fn emit(&mut self, event: &ProfilerEvent) -> std::io::Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}
