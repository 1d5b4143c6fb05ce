//! Opaque identifier types handed out by the runtime.
//!
//! All of these are stable handles owned by the runtime: the agent stores and
//! forwards them but never dereferences them. They serialize as their raw
//! integer value for wire convenience.

use serde::Serialize;

macro_rules! runtime_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize)]
        pub struct $name(u64);

        impl $name {
            pub const fn from_u64(value: u64) -> Self {
                $name(value)
            }

            pub const fn as_u64(self) -> u64 {
                self.0
            }
        }
    };
}

runtime_id! {
    /// Handle for a managed type. One cache entry exists per distinct value.
    ClassId
}

runtime_id! {
    /// Handle for a loaded module.
    ModuleId
}

runtime_id! {
    /// Handle for the assembly a module belongs to. Zero means "not yet known".
    AssemblyId
}

runtime_id! {
    /// Handle for a single heap object. Only valid until the next collection
    /// moves it, which is fine: the agent forwards it immediately.
    ObjectId
}

runtime_id! {
    /// Handle for a jitted method, reported by the call-entry hook.
    FunctionId
}

runtime_id! {
    /// Handle for a GC handle (pinning, weak, strong, ...).
    HandleId
}

/// Metadata token identifying a type definition inside its module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct TypeToken(u32);

impl TypeToken {
    pub const fn from_u32(value: u32) -> Self {
        TypeToken(value)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}
