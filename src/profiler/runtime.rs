//! The capability surface the managed runtime exposes to the agent.
//!
//! The real binding (COM, FFI, whatever the host provides) implements
//! [`RuntimeProfiling`]; the agent only ever talks through these entry points,
//! which keeps every callback testable against a scripted fake.

use crate::profiler::ids::{AssemblyId, ClassId, ModuleId, ObjectId, TypeToken};
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;
use thiserror::Error;

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Failure from a runtime query or command.
///
/// These never propagate back into runtime callback frames; the agent converts
/// the ones worth reporting into `ProfilerError` events and drops the rest.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("runtime call failed with status {0:#010x}")]
    Failed(i32),
    #[error("module metadata unavailable")]
    MetadataUnavailable,
    #[error("unknown runtime id {0:#x}")]
    UnknownId(u64),
    #[error("subscription can only be changed at process startup")]
    StartupOnly,
}

impl RuntimeError {
    /// Numeric code carried by `ProfilerError` events.
    pub fn code(&self) -> i32 {
        match self {
            RuntimeError::Failed(code) => *code,
            RuntimeError::MetadataUnavailable => -2,
            RuntimeError::UnknownId(_) => -3,
            RuntimeError::StartupOnly => -4,
        }
    }
}

/// Runtime subscription bits the agent can read and commit.
///
/// The values are crate-local; the binding layer maps them onto whatever the
/// concrete runtime uses. The `ENABLE_*` and `DISABLE_*` bits are capability
/// switches honored only when set before the runtime starts executing managed
/// code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscriptionFlags(u32);

impl SubscriptionFlags {
    pub const NONE: SubscriptionFlags = SubscriptionFlags(0);
    /// Deliver module load/attach callbacks.
    pub const MONITOR_MODULE_LOADS: SubscriptionFlags = SubscriptionFlags(1 << 0);
    /// Deliver GC start/stop, moved/surviving, root and object references.
    pub const MONITOR_GC: SubscriptionFlags = SubscriptionFlags(1 << 1);
    /// Deliver per-allocation callbacks.
    pub const MONITOR_OBJECT_ALLOCATED: SubscriptionFlags = SubscriptionFlags(1 << 2);
    /// Deliver enter/tail-call hooks.
    pub const MONITOR_ENTER_LEAVE: SubscriptionFlags = SubscriptionFlags(1 << 3);
    /// Startup-only: make per-allocation callbacks available at all.
    pub const ENABLE_OBJECT_ALLOCATED: SubscriptionFlags = SubscriptionFlags(1 << 4);
    /// Startup-only: suppress inlining so entry hooks see every call.
    pub const DISABLE_INLINING: SubscriptionFlags = SubscriptionFlags(1 << 5);

    /// Bits the agent owns outright: set on enable, stripped on disable.
    /// Everything else is preserved as found.
    pub const AGENT_OWNED: SubscriptionFlags = SubscriptionFlags(
        Self::MONITOR_MODULE_LOADS.0 | Self::MONITOR_GC.0 | Self::MONITOR_OBJECT_ALLOCATED.0,
    );

    pub const fn from_bits(bits: u32) -> SubscriptionFlags {
        SubscriptionFlags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: SubscriptionFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: SubscriptionFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn without(self, other: SubscriptionFlags) -> SubscriptionFlags {
        SubscriptionFlags(self.0 & !other.0)
    }
}

impl BitOr for SubscriptionFlags {
    type Output = SubscriptionFlags;

    fn bitor(self, rhs: SubscriptionFlags) -> SubscriptionFlags {
        SubscriptionFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for SubscriptionFlags {
    fn bitor_assign(&mut self, rhs: SubscriptionFlags) {
        self.0 |= rhs.0;
    }
}

/// Result of the is-array query for a class that is an array type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayInfo {
    /// Element type code from the runtime's type system.
    pub element_type: u32,
    pub element_class: ClassId,
    pub rank: u32,
}

/// Field count and instance size of a composite (non-array) class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClassLayout {
    pub num_fields: u32,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRuntimeInfo {
    pub base_address: u64,
    pub path: String,
    pub assembly: AssemblyId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyRuntimeInfo {
    pub path: String,
    pub app_domain: u64,
    pub manifest_module: ModuleId,
}

/// Type-definition properties read from a module's metadata table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDefProps {
    pub name: String,
    pub flags: u32,
    pub base: TypeToken,
}

/// Reader for one module's type-definition table. Reference-counted and shared
/// with the runtime; the module descriptor holds it for its lifetime.
pub trait MetadataReader: Send + Sync {
    fn get_type_def_props(&self, token: TypeToken) -> RuntimeResult<TypeDefProps>;
}

/// Entry points the runtime provides for queries and commands.
///
/// All methods take `&self`: the runtime is shared across its own worker
/// threads and the control thread, and synchronizes internally.
pub trait RuntimeProfiling: Send + Sync {
    fn get_event_mask(&self) -> RuntimeResult<SubscriptionFlags>;
    fn set_event_mask(&self, flags: SubscriptionFlags) -> RuntimeResult<()>;

    /// Install the call hooks. The actual thunks live in the host binding;
    /// the booleans say which of the triad to wire up.
    fn set_enter_leave_hooks(&self, enter: bool, leave: bool, tailcall: bool) -> RuntimeResult<()>;

    /// Trigger a full, blocking collection. Called from a worker thread only.
    fn force_gc(&self) -> RuntimeResult<()>;

    /// Ask the runtime to unload the agent. Cooperative: success here only
    /// means the request was accepted; the runtime calls back into the agent's
    /// shutdown when the detach actually happens.
    fn request_detach(&self, timeout_ms: u32) -> RuntimeResult<()>;

    fn get_object_size(&self, object: ObjectId) -> RuntimeResult<u64>;
    fn get_class_from_object(&self, object: ObjectId) -> RuntimeResult<ClassId>;

    /// `Ok(Some(_))` for array classes, `Ok(None)` for composites.
    fn is_array_class(&self, class: ClassId) -> RuntimeResult<Option<ArrayInfo>>;
    fn get_class_layout(&self, class: ClassId) -> RuntimeResult<ClassLayout>;
    fn get_class_id_info(&self, class: ClassId) -> RuntimeResult<(ModuleId, TypeToken)>;

    fn get_module_metadata(&self, module: ModuleId) -> RuntimeResult<Arc<dyn MetadataReader>>;
    fn get_module_info(&self, module: ModuleId) -> RuntimeResult<ModuleRuntimeInfo>;
    fn get_assembly_info(&self, assembly: AssemblyId) -> RuntimeResult<AssemblyRuntimeInfo>;
}
