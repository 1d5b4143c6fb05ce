//! Class and module descriptor caches.
//!
//! Both caches populate lazily from runtime queries on first sight of an id
//! and hold their entries until the control plane disables the provider.
//! Resolution is best-effort: a hard failure marks the descriptor and is never
//! retried; allocations of an unresolved class are dropped.
//!
//! Lookups return definition events through a caller-supplied buffer instead
//! of emitting directly, so the caller can write them ahead of whatever event
//! referenced the id. That ordering is what lets listeners decode a class id
//! the first time they see it.

use crate::profiler::events::ProfilerEvent;
use crate::profiler::ids::{AssemblyId, ClassId, ModuleId, TypeToken};
use crate::profiler::runtime::{MetadataReader, RuntimeProfiling};
use crate::profiler::sampler::{SampleStats, DEFAULT_FORCE_KEEP_BYTES};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::Arc;

/// Placeholder name when resolution cannot produce one.
pub const UNKNOWN_NAME: &str = "?";

/// Definition events produced as a side effect of a lookup. Usually zero or
/// two entries (module then class), more for nested array element chains.
pub type DefEvents = SmallVec<[ProfilerEvent; 4]>;

/// How a force-keep override selects class names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameMatch {
    Exact(String),
    Contains(String),
}

impl NameMatch {
    fn matches(&self, name: &str) -> bool {
        match self {
            NameMatch::Exact(wanted) => name == wanted,
            NameMatch::Contains(fragment) => name.contains(fragment.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForceKeepOverride {
    pub matcher: NameMatch,
    pub force_keep_bytes: u64,
}

/// Host-supplied force-keep tuning, applied when a class name resolves.
/// First matching override wins; unresolved names keep the default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplingPolicy {
    pub default_force_keep_bytes: u64,
    pub overrides: Vec<ForceKeepOverride>,
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        SamplingPolicy {
            default_force_keep_bytes: DEFAULT_FORCE_KEEP_BYTES,
            overrides: Vec::new(),
        }
    }
}

impl SamplingPolicy {
    pub fn force_keep_for(&self, name: &str) -> u64 {
        self.overrides
            .iter()
            .find(|o| o.matcher.matches(name))
            .map(|o| o.force_keep_bytes)
            .unwrap_or(self.default_force_keep_bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResolveState {
    /// Entry exists but classification has not finished. Only observable
    /// during the recursive element-class walk of the creating call.
    InProgress,
    Resolved,
    Failed,
}

/// What kind of type a class id names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassShape {
    Array {
        element: ClassId,
        element_type: u32,
        rank: u32,
    },
    Composite {
        size_bytes: u64,
        type_flags: u32,
    },
}

/// Cached description of one class id.
pub struct ClassInfo {
    pub id: ClassId,
    /// Resolved type name; [`UNKNOWN_NAME`] when resolution failed. Set once.
    pub name: String,
    pub shape: ClassShape,
    pub token: TypeToken,
    pub module: Option<ModuleId>,
    pub stats: SampleStats,
    state: ResolveState,
}

impl ClassInfo {
    fn new(id: ClassId, now_ms: u32) -> Self {
        ClassInfo {
            id,
            name: String::from(UNKNOWN_NAME),
            shape: ClassShape::Composite {
                size_bytes: 0,
                type_flags: 0,
            },
            token: TypeToken::default(),
            module: None,
            stats: SampleStats::new(now_ms),
            state: ResolveState::InProgress,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.state == ResolveState::Resolved
    }

    fn type_flags(&self) -> u32 {
        match self.shape {
            ClassShape::Array { .. } => 0,
            ClassShape::Composite { type_flags, .. } => type_flags,
        }
    }

    fn definition(&self) -> ProfilerEvent {
        ProfilerEvent::ClassIdDefinition {
            class_id: self.id,
            token: self.token,
            flags: self.type_flags(),
            module_id: self.module.unwrap_or_default(),
            name: self.name.clone(),
        }
    }
}

/// Cached description of one module id.
pub struct ModuleInfo {
    pub id: ModuleId,
    /// Zero until the runtime reports the owning assembly.
    pub assembly: AssemblyId,
    pub path: Option<String>,
    metadata: Option<Arc<dyn MetadataReader>>,
    /// Sticky: once metadata acquisition fails it is never retried.
    metadata_failed: bool,
    definition_emitted: bool,
}

impl ModuleInfo {
    fn new(id: ModuleId) -> Self {
        ModuleInfo {
            id,
            assembly: AssemblyId::default(),
            path: None,
            metadata: None,
            metadata_failed: false,
            definition_emitted: false,
        }
    }

    pub fn metadata(&self) -> Option<&Arc<dyn MetadataReader>> {
        self.metadata.as_ref()
    }

    fn definition(&self) -> ProfilerEvent {
        ProfilerEvent::ModuleIdDefinition {
            module_id: self.id,
            assembly_id: self.assembly,
            path: self.path.clone().unwrap_or_default(),
        }
    }
}

/// Synthesized array type name: element name, one bracket pair, `rank - 1`
/// commas. `Int32[]`, `Int32[,]`, ...
fn array_type_name(element_name: &str, rank: u32) -> String {
    let commas = rank.saturating_sub(1) as usize;
    let mut name = String::with_capacity(element_name.len() + commas + 2);
    name.push_str(element_name);
    name.push('[');
    for _ in 0..commas {
        name.push(',');
    }
    name.push(']');
    name
}

pub struct MetadataCache {
    classes: HashMap<ClassId, ClassInfo>,
    modules: HashMap<ModuleId, ModuleInfo>,
    policy: SamplingPolicy,
}

impl MetadataCache {
    pub fn new(policy: SamplingPolicy) -> Self {
        MetadataCache {
            classes: HashMap::new(),
            modules: HashMap::new(),
            policy,
        }
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    /// Look up a class, creating and resolving the descriptor on first sight.
    /// Definition events for anything newly resolved (the module, element
    /// classes, the class itself) are appended to `defs` in dependency order.
    /// Returns `None` for classes whose resolution failed, now or previously.
    pub fn class_info(
        &mut self,
        runtime: &dyn RuntimeProfiling,
        class: ClassId,
        now_ms: u32,
        defs: &mut DefEvents,
    ) -> Option<&mut ClassInfo> {
        self.ensure_class(runtime, class, now_ms, defs);
        match self.classes.get_mut(&class) {
            Some(info) if info.state == ResolveState::Resolved => Some(info),
            _ => None,
        }
    }

    fn ensure_class(
        &mut self,
        runtime: &dyn RuntimeProfiling,
        class: ClassId,
        now_ms: u32,
        defs: &mut DefEvents,
    ) {
        if self.classes.contains_key(&class) {
            return;
        }
        self.classes.insert(class, ClassInfo::new(class, now_ms));

        match runtime.is_array_class(class) {
            Ok(Some(array)) => {
                self.ensure_class(runtime, array.element_class, now_ms, defs);
                let element_name = match self.classes.get(&array.element_class) {
                    Some(element) if element.is_resolved() => element.name.clone(),
                    _ => String::from(UNKNOWN_NAME),
                };
                let shape = ClassShape::Array {
                    element: array.element_class,
                    element_type: array.element_type,
                    rank: array.rank,
                };
                let name = array_type_name(&element_name, array.rank);
                self.finish_class(class, name, shape, TypeToken::default(), None, defs);
            }
            Ok(None) => self.resolve_composite(runtime, class, defs),
            Err(_) => self.fail_class(class),
        }
    }

    fn resolve_composite(
        &mut self,
        runtime: &dyn RuntimeProfiling,
        class: ClassId,
        defs: &mut DefEvents,
    ) {
        // Layout failure is tolerated (size stays 0); the rest is required.
        let layout = runtime.get_class_layout(class).unwrap_or_default();
        let Ok((module_id, token)) = runtime.get_class_id_info(class) else {
            self.fail_class(class);
            return;
        };
        if module_id == ModuleId::default() {
            self.fail_class(class);
            return;
        }
        let Some(reader) = self
            .module_info(runtime, module_id, defs)
            .and_then(|m| m.metadata().cloned())
        else {
            self.fail_class(class);
            return;
        };
        let Ok(props) = reader.get_type_def_props(token) else {
            self.fail_class(class);
            return;
        };
        if props.name.is_empty() {
            self.fail_class(class);
            return;
        }
        let shape = ClassShape::Composite {
            size_bytes: layout.size_bytes,
            type_flags: props.flags,
        };
        self.finish_class(class, props.name, shape, token, Some(module_id), defs);
    }

    fn finish_class(
        &mut self,
        class: ClassId,
        name: String,
        shape: ClassShape,
        token: TypeToken,
        module: Option<ModuleId>,
        defs: &mut DefEvents,
    ) {
        if let Some(info) = self.classes.get_mut(&class) {
            info.name = name;
            info.shape = shape;
            info.token = token;
            info.module = module;
            info.state = ResolveState::Resolved;
            info.stats
                .set_force_keep_bytes(self.policy.force_keep_for(&info.name));
            defs.push(info.definition());
        }
    }

    fn fail_class(&mut self, class: ClassId) {
        log::debug!("class {class:?} could not be resolved");
        if let Some(info) = self.classes.get_mut(&class) {
            info.state = ResolveState::Failed;
        }
    }

    /// Look up a module, creating the descriptor and acquiring its metadata
    /// reader on first sight. Returns `None` once metadata acquisition has
    /// failed; path and assembly fetches are retried until they succeed.
    pub fn module_info(
        &mut self,
        runtime: &dyn RuntimeProfiling,
        module: ModuleId,
        defs: &mut DefEvents,
    ) -> Option<&mut ModuleInfo> {
        let info = self
            .modules
            .entry(module)
            .or_insert_with(|| ModuleInfo::new(module));
        if info.metadata_failed {
            return None;
        }
        if info.metadata.is_none() {
            match runtime.get_module_metadata(module) {
                Ok(reader) => info.metadata = Some(reader),
                Err(err) => {
                    log::debug!("metadata for module {module:?} unavailable: {err}");
                    info.metadata_failed = true;
                    return None;
                }
            }
        }
        if info.path.is_none() {
            if let Ok(runtime_info) = runtime.get_module_info(module) {
                if !runtime_info.path.is_empty() {
                    info.path = Some(runtime_info.path);
                    info.assembly = runtime_info.assembly;
                    if !info.definition_emitted {
                        info.definition_emitted = true;
                        defs.push(info.definition());
                    }
                }
            }
        }
        Some(info)
    }

    /// The runtime established the module-assembly binding. Fill in whatever
    /// is still missing, falling back to the assembly's path when the module
    /// itself has none, and emit the definition if it never went out.
    pub fn module_attached(
        &mut self,
        runtime: &dyn RuntimeProfiling,
        module: ModuleId,
        assembly: AssemblyId,
        defs: &mut DefEvents,
    ) {
        let Some(info) = self.module_info(runtime, module, defs) else {
            return;
        };
        if info.assembly == assembly {
            return;
        }
        if info.path.is_none() {
            let path = runtime
                .get_assembly_info(assembly)
                .map(|a| a.path)
                .unwrap_or_default();
            info.path = Some(path);
        }
        info.assembly = assembly;
        if !info.definition_emitted {
            info.definition_emitted = true;
            defs.push(info.definition());
        }
    }

    /// Rundown: definitions for every module with a known path, then every
    /// fully resolved class. Relative order within each group is unspecified.
    pub fn dump_all(&self) -> Vec<ProfilerEvent> {
        let mut events = Vec::with_capacity(self.modules.len() + self.classes.len());
        for module in self.modules.values() {
            if module.path.is_some() {
                events.push(module.definition());
            }
        }
        for class in self.classes.values() {
            if class.is_resolved() {
                events.push(class.definition());
            }
        }
        events
    }

    /// Drop every descriptor, releasing metadata-reader handles.
    pub fn clear(&mut self) {
        self.classes.clear();
        self.modules.clear();
    }
}
