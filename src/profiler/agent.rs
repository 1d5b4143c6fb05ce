//! The profiling agent: runtime callbacks in, channel events out.
//!
//! One agent exists per process. Runtime callbacks arrive on arbitrary worker
//! threads and the channel's control callback on its own thread; a single
//! mutex over the whole agent state serializes them. Every critical section is
//! bounded and every callback returns normally no matter what went wrong
//! inside — nothing here may raise into a runtime callback frame.

use crate::profiler::channel::TraceChannel;
use crate::profiler::control::{
    host_keyword_hint, plan_disable, plan_enable, ControlCommand, ControlRequest, ProviderState,
};
use crate::profiler::events::{Keywords, ProfilerEvent};
use crate::profiler::ids::{AssemblyId, ClassId, FunctionId, HandleId, ModuleId, ObjectId};
use crate::profiler::metadata::{DefEvents, MetadataCache, SamplingPolicy};
use crate::profiler::relay;
use crate::profiler::runtime::{RuntimeError, RuntimeProfiling, SubscriptionFlags};
use crate::profiler::sampler::SampleDecision;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Call-entry reporting interval when unsampled: every call.
const CALL_RATE_UNSAMPLED: u32 = 1;
/// Interval under the sampled-call hint. Prime, so it stays uncorrelated with
/// loop strides in the profiled program.
const CALL_RATE_SAMPLED: u32 = 997;
/// Timeout passed to the runtime's detach request.
const DETACH_TIMEOUT_MS: u32 = 1000;
/// The control thread polls the force-GC worker this often...
const FORCE_GC_POLL: Duration = Duration::from_millis(10);
/// ...at most this many times (20 s total) before giving up the wait.
const FORCE_GC_MAX_POLLS: u32 = 2000;

static INSTALLED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("a profiling agent is already installed in this process")]
    AlreadyInstalled,
    #[error("startup subscription rejected: {0}")]
    Startup(#[from] RuntimeError),
}

/// Construction-time configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// True when the agent was loaded with the process rather than attached to
    /// a live one. Several capabilities exist only in this mode.
    pub loaded_at_startup: bool,
    /// Keyword hints applied before any command arrives.
    pub startup_keywords: Keywords,
    pub sampling: SamplingPolicy,
}

impl AgentConfig {
    /// Configuration for a startup load, with hints from the host config key.
    pub fn at_startup() -> Self {
        AgentConfig {
            loaded_at_startup: true,
            startup_keywords: host_keyword_hint(),
            sampling: SamplingPolicy::default(),
        }
    }

    /// Configuration for a late attach.
    pub fn attached() -> Self {
        AgentConfig {
            loaded_at_startup: false,
            startup_keywords: Keywords::NONE,
            sampling: SamplingPolicy::default(),
        }
    }
}

struct AgentState {
    /// Released on shutdown; callbacks are no-ops afterwards.
    runtime: Option<Arc<dyn RuntimeProfiling>>,
    channel: Option<Box<dyn TraceChannel>>,
    cache: MetadataCache,
    keywords: Keywords,
    provider_state: ProviderState,
    smart_sampling: bool,
    gc_count: u32,
    /// Wire manifests were never emitted by this provider; the flag tracks
    /// the provider handshake state all the same.
    sent_manifest: bool,
    call_sampling_rate: u32,
    call_sample_count: i64,
}

pub struct ProfilerAgent {
    state: Mutex<AgentState>,
    /// Set while the force-GC worker runs; cleared by the worker when done.
    forcing_gc: Arc<AtomicBool>,
    /// Failure code from the worker's force-GC call, zero when it succeeded.
    force_gc_status: Arc<AtomicI32>,
    loaded_at_startup: bool,
    start: Instant,
    registered: bool,
}

impl ProfilerAgent {
    /// Create and initialize an agent without registering it as the process
    /// instance. Hosts use [`ProfilerAgent::install`]; this constructor exists
    /// so tests can run several agents side by side.
    pub fn new(
        runtime: Arc<dyn RuntimeProfiling>,
        channel: Box<dyn TraceChannel>,
        config: AgentConfig,
    ) -> Result<Self, AgentError> {
        let mut call_sampling_rate = CALL_RATE_UNSAMPLED;

        if config.loaded_at_startup {
            // Capabilities that exist only when requested before managed code
            // runs: allocation callbacks always, the rest per host hint.
            let mask = runtime.get_event_mask()?;
            runtime.set_event_mask(
                mask | SubscriptionFlags::MONITOR_MODULE_LOADS
                    | SubscriptionFlags::ENABLE_OBJECT_ALLOCATED,
            )?;

            let hints = config.startup_keywords;
            if hints.intersects(Keywords::DISABLE_INLINING) {
                let mask = runtime.get_event_mask()?;
                runtime.set_event_mask(mask | SubscriptionFlags::DISABLE_INLINING)?;
            }
            if hints.intersects(Keywords::CALL_FAMILY) {
                // Enter and tail-call only; there is no call-leave event.
                runtime.set_enter_leave_hooks(true, false, true)?;
                let mask = runtime.get_event_mask()?;
                runtime.set_event_mask(mask | SubscriptionFlags::MONITOR_ENTER_LEAVE)?;
                if hints.intersects(Keywords::CALL_SAMPLED) {
                    call_sampling_rate = CALL_RATE_SAMPLED;
                }
            }
        }

        Ok(ProfilerAgent {
            state: Mutex::new(AgentState {
                runtime: Some(runtime),
                channel: Some(channel),
                cache: MetadataCache::new(config.sampling),
                keywords: Keywords::NONE,
                provider_state: ProviderState::Disarmed,
                smart_sampling: false,
                gc_count: 0,
                sent_manifest: false,
                call_sampling_rate,
                call_sample_count: 1,
            }),
            forcing_gc: Arc::new(AtomicBool::new(false)),
            force_gc_status: Arc::new(AtomicI32::new(0)),
            loaded_at_startup: config.loaded_at_startup,
            start: Instant::now(),
            registered: false,
        })
    }

    /// Create the process-wide agent instance. Fails if one already exists;
    /// the slot frees when that instance drops.
    pub fn install(
        runtime: Arc<dyn RuntimeProfiling>,
        channel: Box<dyn TraceChannel>,
        config: AgentConfig,
    ) -> Result<Arc<Self>, AgentError> {
        if INSTALLED.swap(true, Ordering::SeqCst) {
            return Err(AgentError::AlreadyInstalled);
        }
        match Self::new(runtime, channel, config) {
            Ok(mut agent) => {
                agent.registered = true;
                Ok(Arc::new(agent))
            }
            Err(err) => {
                INSTALLED.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    fn now_ms(&self) -> u32 {
        self.start.elapsed().as_millis() as u32
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AgentState> {
        self.state.lock().unwrap()
    }

    fn emit(state: &mut AgentState, event: ProfilerEvent) {
        if let Some(channel) = state.channel.as_mut() {
            if let Err(err) = channel.emit(&event) {
                log::debug!("dropped event {}: {err}", event.event_id());
            }
        }
    }

    fn emit_defs(state: &mut AgentState, defs: DefEvents) {
        for event in defs {
            Self::emit(state, event);
        }
    }

    fn report_error(state: &mut AgentState, err: &RuntimeError, what: &str) {
        log::warn!("{what} failed: {err}");
        Self::emit(
            state,
            ProfilerEvent::ProfilerError {
                code: err.code(),
                message: format!("{what} failed: {err}"),
            },
        );
    }

    // ---- allocation path -------------------------------------------------

    /// Per-allocation callback. Resolves the class (emitting definitions on
    /// first sight), consults the sampler when smart sampling is on, and
    /// reports the allocation with its representative size.
    pub fn object_allocated(&self, object: ObjectId, class: ClassId) {
        let now_ms = self.now_ms();
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(runtime) = state.runtime.clone() else {
            return;
        };
        let Ok(size) = runtime.get_object_size(object) else {
            log::debug!("size query failed for {object:?}; allocation dropped");
            return;
        };

        let mut defs = DefEvents::new();
        let decision = match state.cache.class_info(runtime.as_ref(), class, now_ms, &mut defs) {
            Some(info) if state.smart_sampling => info.stats.observe(size, now_ms),
            Some(_) => SampleDecision::Emit {
                representative_size: size,
            },
            None => {
                // Any module definition produced along the way still goes out.
                Self::emit_defs(state, defs);
                return;
            }
        };

        Self::emit_defs(state, defs);
        if let SampleDecision::Emit {
            representative_size,
        } = decision
        {
            Self::emit(
                state,
                ProfilerEvent::ObjectAllocated {
                    object_id: object,
                    class_id: class,
                    size,
                    representative_size,
                },
            );
        }
    }

    // ---- module callbacks ------------------------------------------------

    pub fn module_attached_to_assembly(&self, module: ModuleId, assembly: AssemblyId) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(runtime) = state.runtime.clone() else {
            return;
        };
        let mut defs = DefEvents::new();
        state
            .cache
            .module_attached(runtime.as_ref(), module, assembly, &mut defs);
        Self::emit_defs(state, defs);
    }

    // ---- GC relay --------------------------------------------------------

    pub fn gc_started(&self, generation_collected: &[bool], induced: bool) {
        let mut state = self.lock();
        state.gc_count += 1;
        let event = ProfilerEvent::GcStart {
            gc_index: state.gc_count,
            max_generation_collected: relay::max_collected_generation(generation_collected),
            induced,
        };
        Self::emit(&mut state, event);
    }

    pub fn gc_finished(&self) {
        let mut state = self.lock();
        let event = ProfilerEvent::GcStop {
            gc_index: state.gc_count,
        };
        Self::emit(&mut state, event);
    }

    pub fn moved_references(&self, old_starts: &[u64], new_starts: &[u64], lengths: &[u32]) {
        let count = old_starts.len().min(new_starts.len()).min(lengths.len());
        let per_event = relay::max_records_per_event(relay::MOVED_RECORD_BYTES);
        let mut state = self.lock();
        for range in relay::chunk_ranges(count, per_event) {
            let event = ProfilerEvent::ObjectsMoved {
                count: range.len() as u32,
                old_starts: old_starts[range.clone()].to_vec(),
                new_starts: new_starts[range.clone()].to_vec(),
                lengths: lengths[range].to_vec(),
            };
            Self::emit(&mut state, event);
        }
    }

    pub fn surviving_references(&self, starts: &[u64], lengths: &[u32]) {
        let count = starts.len().min(lengths.len());
        let per_event = relay::max_records_per_event(relay::SURVIVED_RECORD_BYTES);
        let mut state = self.lock();
        for range in relay::chunk_ranges(count, per_event) {
            let event = ProfilerEvent::ObjectsSurvived {
                count: range.len() as u32,
                starts: starts[range.clone()].to_vec(),
                lengths: lengths[range].to_vec(),
            };
            Self::emit(&mut state, event);
        }
    }

    pub fn root_references(
        &self,
        ref_ids: &[u64],
        root_kinds: &[u32],
        root_flags: &[u32],
        root_ids: &[u64],
    ) {
        let mut state = self.lock();
        if !state.keywords.intersects(Keywords::GC_HEAP) {
            return;
        }
        let count = ref_ids
            .len()
            .min(root_kinds.len())
            .min(root_flags.len())
            .min(root_ids.len());
        let per_event = relay::max_records_per_event(relay::ROOT_RECORD_BYTES);
        for range in relay::chunk_ranges(count, per_event) {
            let event = ProfilerEvent::RootReferences {
                count: range.len() as u32,
                ref_ids: ref_ids[range.clone()].to_vec(),
                root_kinds: root_kinds[range.clone()].to_vec(),
                root_flags: root_flags[range.clone()].to_vec(),
                root_ids: root_ids[range].to_vec(),
            };
            Self::emit(&mut state, event);
        }
    }

    /// Heap-walk edge list for one object. The class is resolved first so the
    /// definition precedes the first reference to its id.
    pub fn object_references(&self, object: ObjectId, class: ClassId, ref_ids: &[u64]) {
        let now_ms = self.now_ms();
        let mut guard = self.lock();
        let state = &mut *guard;
        if !state.keywords.intersects(Keywords::GC_HEAP) {
            return;
        }
        let Some(runtime) = state.runtime.clone() else {
            return;
        };
        let mut defs = DefEvents::new();
        state
            .cache
            .class_info(runtime.as_ref(), class, now_ms, &mut defs);
        Self::emit_defs(state, defs);

        let size = runtime.get_object_size(object).unwrap_or_default();
        let per_event = relay::max_records_per_event(relay::OBJECT_REF_RECORD_BYTES);
        if ref_ids.is_empty() {
            Self::emit(
                state,
                ProfilerEvent::ObjectReferences {
                    object_id: object,
                    class_id: class,
                    size,
                    ref_count: 0,
                    ref_ids: Vec::new(),
                },
            );
            return;
        }
        for range in relay::chunk_ranges(ref_ids.len(), per_event) {
            let event = ProfilerEvent::ObjectReferences {
                object_id: object,
                class_id: class,
                size,
                ref_count: range.len() as u32,
                ref_ids: ref_ids[range].to_vec(),
            };
            Self::emit(state, event);
        }
    }

    pub fn finalizeable_object_queued(&self, object: ObjectId) {
        let mut guard = self.lock();
        let state = &mut *guard;
        if !state.keywords.intersects(Keywords::GC_FAMILY) {
            return;
        }
        let Some(runtime) = state.runtime.clone() else {
            return;
        };
        let class = runtime.get_class_from_object(object).unwrap_or_default();
        Self::emit(
            state,
            ProfilerEvent::FinalizeableObjectQueued {
                object_id: object,
                class_id: class,
            },
        );
    }

    pub fn handle_created(&self, handle: HandleId, object: ObjectId) {
        let mut state = self.lock();
        if !state.keywords.intersects(Keywords::HANDLE_FAMILY) {
            return;
        }
        Self::emit(
            &mut state,
            ProfilerEvent::HandleCreated {
                handle_id: handle,
                object_id: object,
            },
        );
    }

    pub fn handle_destroyed(&self, handle: HandleId) {
        let mut state = self.lock();
        if !state.keywords.intersects(Keywords::HANDLE_FAMILY) {
            return;
        }
        Self::emit(&mut state, ProfilerEvent::HandleDestroyed { handle_id: handle });
    }

    // ---- call entry ------------------------------------------------------

    /// Called by the host's entry/tail-call thunks. Counts down and reports
    /// every `call_sampling_rate`-th call.
    pub fn call_enter(&self, function: FunctionId) {
        let mut state = self.lock();
        state.call_sample_count -= 1;
        if state.call_sample_count > 0 {
            return;
        }
        state.call_sample_count = state.call_sampling_rate as i64;
        let sampling_rate = state.call_sampling_rate;
        Self::emit(
            &mut state,
            ProfilerEvent::CallEnter {
                function_id: function,
                sampling_rate,
            },
        );
    }

    // ---- control plane ---------------------------------------------------

    pub fn control(&self, request: &ControlRequest) {
        log::debug!(
            "control command {:?} keywords {:#x}",
            request.command,
            request.keywords.bits()
        );
        match request.command {
            ControlCommand::Enable => self.enable(request.keywords),
            ControlCommand::CaptureState => self.capture_state(request.keywords),
            ControlCommand::Disable => self.disable(),
        }
    }

    fn enable(&self, keywords: Keywords) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(runtime) = state.runtime.clone() else {
            return;
        };
        state.keywords = keywords;
        if state.provider_state != ProviderState::Detaching {
            state.provider_state = ProviderState::Armed;
        }

        let old_flags = runtime.get_event_mask().unwrap_or_default();
        let plan = plan_enable(keywords, old_flags, self.loaded_at_startup);
        if plan.smart_sampling {
            state.smart_sampling = true;
        }
        Self::commit_mask(state, runtime.as_ref(), old_flags, plan.flags);
    }

    fn capture_state(&self, keywords: Keywords) {
        {
            let mut state = self.lock();
            Self::emit(&mut state, ProfilerEvent::CaptureStateStart);
        }

        // The heap rundown wants a coherent heap; force a collection first.
        // The mutex is not held across the wait: the collection's own
        // callbacks need it.
        if keywords.intersects(Keywords::GC_HEAP) {
            self.force_gc();
        }

        {
            let mut guard = self.lock();
            let state = &mut *guard;
            if keywords.intersects(Keywords::GC) {
                for event in state.cache.dump_all() {
                    Self::emit(state, event);
                }
            }
            Self::emit(state, ProfilerEvent::CaptureStateStop);
        }

        // Detach last, after rundown completion went out: teardown may begin
        // as soon as the runtime accepts the request.
        if keywords.intersects(Keywords::DETACH) && !self.loaded_at_startup {
            self.begin_detach();
        }
    }

    fn disable(&self) {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.cache.clear();
        state.keywords = Keywords::NONE;
        state.smart_sampling = false;
        state.sent_manifest = false;
        if state.provider_state != ProviderState::Detaching {
            state.provider_state = ProviderState::Disarmed;
        }
        let Some(runtime) = state.runtime.clone() else {
            return;
        };
        let old_flags = runtime.get_event_mask().unwrap_or_default();
        let new_flags = plan_disable(old_flags);
        Self::commit_mask(state, runtime.as_ref(), old_flags, new_flags);
    }

    fn commit_mask(
        state: &mut AgentState,
        runtime: &dyn RuntimeProfiling,
        old_flags: SubscriptionFlags,
        new_flags: SubscriptionFlags,
    ) {
        if new_flags == old_flags || state.provider_state == ProviderState::Detaching {
            return;
        }
        if let Err(err) = runtime.set_event_mask(new_flags) {
            Self::report_error(state, &err, "set_event_mask");
        }
    }

    fn begin_detach(&self) {
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.provider_state == ProviderState::Detaching {
            return;
        }
        let Some(runtime) = state.runtime.clone() else {
            return;
        };
        state.provider_state = ProviderState::Detaching;
        if let Err(err) = runtime.request_detach(DETACH_TIMEOUT_MS) {
            Self::report_error(state, &err, "request_detach");
        }
    }

    /// Run a full collection on a worker thread and wait for it, bounded.
    /// Runs without the state mutex: the collection re-enters the agent
    /// through the GC callbacks.
    fn force_gc(&self) {
        let runtime = self.lock().runtime.clone();
        let Some(runtime) = runtime else {
            return;
        };

        self.force_gc_status.store(0, Ordering::SeqCst);
        self.forcing_gc.store(true, Ordering::SeqCst);
        let flag = Arc::clone(&self.forcing_gc);
        let status = Arc::clone(&self.force_gc_status);
        let spawned = std::thread::Builder::new()
            .name("profiler-force-gc".into())
            .spawn(move || {
                if let Err(err) = runtime.force_gc() {
                    status.store(err.code(), Ordering::SeqCst);
                }
                flag.store(false, Ordering::SeqCst);
            });

        let Ok(worker) = spawned else {
            self.forcing_gc.store(false, Ordering::SeqCst);
            return;
        };

        let mut worker = Some(worker);
        for _ in 0..FORCE_GC_MAX_POLLS {
            if !self.forcing_gc.load(Ordering::SeqCst) {
                if let Some(handle) = worker.take() {
                    let _ = handle.join();
                }
                break;
            }
            std::thread::sleep(FORCE_GC_POLL);
        }
        // On timeout the handle drops here and the collection finishes
        // asynchronously.

        let code = self.force_gc_status.load(Ordering::SeqCst);
        if code != 0 {
            let mut state = self.lock();
            Self::report_error(&mut state, &RuntimeError::Failed(code), "force_gc");
        }
    }

    // ---- lifecycle -------------------------------------------------------

    /// Final teardown: announce it, unregister from the channel, drop the
    /// caches, release the runtime handle. Callbacks become no-ops.
    pub fn shutdown(&self) {
        let mut guard = self.lock();
        let state = &mut *guard;
        Self::emit(state, ProfilerEvent::ProfilerShutdown);
        state.channel = None;
        state.cache.clear();
        state.runtime = None;
    }

    /// The runtime finished the requested detach.
    pub fn detach_succeeded(&self) {
        self.shutdown();
    }

    // ---- observers -------------------------------------------------------

    pub fn current_keywords(&self) -> Keywords {
        self.lock().keywords
    }

    pub fn provider_state(&self) -> ProviderState {
        self.lock().provider_state
    }

    pub fn smart_sampling(&self) -> bool {
        self.lock().smart_sampling
    }

    pub fn cached_class_count(&self) -> usize {
        self.lock().cache.class_count()
    }

    pub fn gc_index(&self) -> u32 {
        self.lock().gc_count
    }
}

impl Drop for ProfilerAgent {
    fn drop(&mut self) {
        if self.registered {
            INSTALLED.store(false, Ordering::SeqCst);
        }
    }
}
