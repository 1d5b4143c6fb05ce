pub mod agent;
pub mod channel;
pub mod control;
pub mod events;
pub mod ids;
pub mod metadata;
pub mod relay;
pub mod runtime;
pub mod sampler;

pub use agent::{AgentConfig, AgentError, ProfilerAgent};
pub use channel::{MemoryChannel, NullChannel, TraceChannel};
pub use control::{ControlCommand, ControlRequest, ProviderState, HOST_KEYWORDS_VAR};
pub use events::{Keywords, ProfilerEvent, PROVIDER_ID};
pub use ids::{AssemblyId, ClassId, FunctionId, HandleId, ModuleId, ObjectId, TypeToken};
pub use metadata::{ForceKeepOverride, NameMatch, SamplingPolicy};
pub use runtime::{
    ArrayInfo, AssemblyRuntimeInfo, ClassLayout, MetadataReader, ModuleRuntimeInfo, RuntimeError,
    RuntimeProfiling, RuntimeResult, SubscriptionFlags, TypeDefProps,
};
pub use sampler::{SampleDecision, SampleStats, DEFAULT_FORCE_KEEP_BYTES};
