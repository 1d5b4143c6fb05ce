//! Wire events and the keyword mask listeners use to select them.

use crate::profiler::ids::{
    AssemblyId, ClassId, FunctionId, HandleId, ModuleId, ObjectId, TypeToken,
};
use serde::Serialize;
use std::ops::{BitOr, BitOrAssign};

/// Provider identifier registered on the tracing channel. Fixed: downstream
/// decoders subscribe by this value.
pub const PROVIDER_ID: u128 = 0x6652970f_1756_5d8d_0805_e9aad152aa84;

/// Wire event emitted by the agent.
///
/// The wire contract is the `(event_id, fields-in-order)` tuple; the `Serialize`
/// impl is just for convenience of writing events to JSON in tools and tests.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event")]
pub enum ProfilerEvent {
    /// Describes a class id. Emitted once when the id is first resolved and
    /// again on every rundown.
    ClassIdDefinition {
        class_id: ClassId,
        token: TypeToken,
        flags: u32,
        module_id: ModuleId,
        name: String,
    },
    /// Describes a module id. Emitted once when the path becomes known and
    /// again on every rundown.
    ModuleIdDefinition {
        module_id: ModuleId,
        assembly_id: AssemblyId,
        path: String,
    },
    /// One sampled (or unsampled) allocation. `representative_size` covers the
    /// bytes of every suppressed allocation since the previous report, so
    /// summing it recovers the true allocated total for the type.
    ObjectAllocated {
        object_id: ObjectId,
        class_id: ClassId,
        size: u64,
        representative_size: u64,
    },
    GcStart {
        gc_index: u32,
        max_generation_collected: u32,
        induced: bool,
    },
    GcStop {
        gc_index: u32,
    },
    /// A slice of compacted ranges. Large batches are split so each event fits
    /// the channel payload budget; ordering is preserved across slices.
    ObjectsMoved {
        count: u32,
        old_starts: Vec<u64>,
        new_starts: Vec<u64>,
        lengths: Vec<u32>,
    },
    ObjectsSurvived {
        count: u32,
        starts: Vec<u64>,
        lengths: Vec<u32>,
    },
    RootReferences {
        count: u32,
        ref_ids: Vec<u64>,
        root_kinds: Vec<u32>,
        root_flags: Vec<u32>,
        root_ids: Vec<u64>,
    },
    ObjectReferences {
        object_id: ObjectId,
        class_id: ClassId,
        size: u64,
        ref_count: u32,
        ref_ids: Vec<u64>,
    },
    FinalizeableObjectQueued {
        object_id: ObjectId,
        class_id: ClassId,
    },
    HandleCreated {
        handle_id: HandleId,
        object_id: ObjectId,
    },
    HandleDestroyed {
        handle_id: HandleId,
    },
    CallEnter {
        function_id: FunctionId,
        sampling_rate: u32,
    },
    CaptureStateStart,
    CaptureStateStop,
    ProfilerShutdown,
    ProfilerError {
        code: i32,
        message: String,
    },
}

impl ProfilerEvent {
    /// Stable per-shape id used by the channel binding to tag the payload.
    pub fn event_id(&self) -> u16 {
        match self {
            ProfilerEvent::ClassIdDefinition { .. } => 1,
            ProfilerEvent::ModuleIdDefinition { .. } => 2,
            ProfilerEvent::ObjectAllocated { .. } => 3,
            ProfilerEvent::GcStart { .. } => 4,
            ProfilerEvent::GcStop { .. } => 5,
            ProfilerEvent::ObjectsMoved { .. } => 6,
            ProfilerEvent::ObjectsSurvived { .. } => 7,
            ProfilerEvent::RootReferences { .. } => 8,
            ProfilerEvent::ObjectReferences { .. } => 9,
            ProfilerEvent::FinalizeableObjectQueued { .. } => 10,
            ProfilerEvent::HandleCreated { .. } => 11,
            ProfilerEvent::HandleDestroyed { .. } => 12,
            ProfilerEvent::CallEnter { .. } => 13,
            ProfilerEvent::CaptureStateStart => 14,
            ProfilerEvent::CaptureStateStop => 15,
            ProfilerEvent::ProfilerShutdown => 16,
            ProfilerEvent::ProfilerError { .. } => 17,
        }
    }
}

/// Keyword bitmask carried by enable/capture-state commands.
///
/// Listeners set bits at subscribe time to select event families; the agent
/// maps them onto runtime subscriptions (see the control module).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Keywords(u64);

impl Keywords {
    pub const NONE: Keywords = Keywords(0);
    /// GC start/stop plus class/module rundown on capture-state.
    pub const GC: Keywords = Keywords(0x1);
    /// Every allocation, unsampled.
    pub const GC_ALLOC: Keywords = Keywords(0x2);
    /// Allocations through the adaptive per-type sampler.
    pub const GC_ALLOC_SAMPLED: Keywords = Keywords(0x4);
    /// Heap-walk events (roots, object references) plus forced GC on
    /// capture-state.
    pub const GC_HEAP: Keywords = Keywords(0x8);
    /// Call-entry events, every call.
    pub const CALL: Keywords = Keywords(0x10);
    /// Call-entry events through the countdown sampler.
    pub const CALL_SAMPLED: Keywords = Keywords(0x20);
    /// Startup hint: ask the runtime to disable inlining so entry hooks see
    /// every call.
    pub const DISABLE_INLINING: Keywords = Keywords(0x40);
    /// Capture-state only: detach the agent after rundown completes.
    pub const DETACH: Keywords = Keywords(0x80);

    /// Any keyword implying GC monitoring.
    pub const GC_FAMILY: Keywords =
        Keywords(Self::GC.0 | Self::GC_ALLOC.0 | Self::GC_ALLOC_SAMPLED.0 | Self::GC_HEAP.0);
    /// Keywords implying allocation events.
    pub const ALLOC_FAMILY: Keywords = Keywords(Self::GC_ALLOC.0 | Self::GC_ALLOC_SAMPLED.0);
    /// Keywords implying call-entry hooks.
    pub const CALL_FAMILY: Keywords = Keywords(Self::CALL.0 | Self::CALL_SAMPLED.0);
    /// Gate for handle created/destroyed passthrough.
    pub const HANDLE_FAMILY: Keywords =
        Keywords(Self::GC_HEAP.0 | Self::GC_ALLOC.0 | Self::GC_ALLOC_SAMPLED.0);

    pub const fn from_bits(bits: u64) -> Keywords {
        Keywords(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn intersects(self, other: Keywords) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn contains(self, other: Keywords) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn without(self, other: Keywords) -> Keywords {
        Keywords(self.0 & !other.0)
    }
}

impl BitOr for Keywords {
    type Output = Keywords;

    fn bitor(self, rhs: Keywords) -> Keywords {
        Keywords(self.0 | rhs.0)
    }
}

impl BitOrAssign for Keywords {
    fn bitor_assign(&mut self, rhs: Keywords) {
        self.0 |= rhs.0;
    }
}
