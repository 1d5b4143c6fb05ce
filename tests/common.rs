//! Shared fixtures: a scripted runtime capability surface and event filters.
#![allow(dead_code)]

use etw_clr_profiler::profiler::{
    ArrayInfo, AssemblyId, AssemblyRuntimeInfo, ClassId, ClassLayout, MetadataReader, ModuleId,
    ModuleRuntimeInfo, ObjectId, ProfilerEvent, RuntimeError, RuntimeProfiling, RuntimeResult,
    SubscriptionFlags, TypeDefProps, TypeToken,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Everything the mock runtime knows and records, behind one lock so tests
/// can both script it up front and inspect it afterwards.
#[derive(Default)]
pub struct MockState {
    pub object_sizes: HashMap<ObjectId, u64>,
    pub object_classes: HashMap<ObjectId, ClassId>,
    pub arrays: HashMap<ClassId, ArrayInfo>,
    pub layouts: HashMap<ClassId, ClassLayout>,
    pub class_ids: HashMap<ClassId, (ModuleId, TypeToken)>,
    pub modules: HashMap<ModuleId, ModuleRuntimeInfo>,
    pub assemblies: HashMap<AssemblyId, AssemblyRuntimeInfo>,
    pub type_defs: HashMap<TypeToken, TypeDefProps>,

    pub event_mask: SubscriptionFlags,
    pub mask_history: Vec<SubscriptionFlags>,
    pub set_mask_error: Option<RuntimeError>,
    pub hooks: Option<(bool, bool, bool)>,
    pub force_gc_calls: u32,
    pub force_gc_error: Option<RuntimeError>,
    pub detach_requests: Vec<u32>,
    pub detach_error: Option<RuntimeError>,
}

pub struct MockRuntime {
    pub state: Arc<Mutex<MockState>>,
}

struct MockReader {
    state: Arc<Mutex<MockState>>,
}

impl MetadataReader for MockReader {
    fn get_type_def_props(&self, token: TypeToken) -> RuntimeResult<TypeDefProps> {
        self.state
            .lock()
            .unwrap()
            .type_defs
            .get(&token)
            .cloned()
            .ok_or(RuntimeError::UnknownId(token.as_u32() as u64))
    }
}

impl MockRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(MockRuntime {
            state: Arc::new(Mutex::new(MockState::default())),
        })
    }

    pub fn add_composite_class(
        &self,
        class: ClassId,
        module: ModuleId,
        token: TypeToken,
        name: &str,
        size: u64,
    ) {
        let mut state = self.state.lock().unwrap();
        state.class_ids.insert(class, (module, token));
        state.layouts.insert(
            class,
            ClassLayout {
                num_fields: 1,
                size_bytes: size,
            },
        );
        state.type_defs.insert(
            token,
            TypeDefProps {
                name: name.to_string(),
                flags: 0x100,
                base: TypeToken::default(),
            },
        );
    }

    pub fn add_array_class(&self, class: ClassId, element: ClassId, element_type: u32, rank: u32) {
        self.state.lock().unwrap().arrays.insert(
            class,
            ArrayInfo {
                element_type,
                element_class: element,
                rank,
            },
        );
    }

    pub fn add_module(&self, module: ModuleId, assembly: AssemblyId, path: &str) {
        self.state.lock().unwrap().modules.insert(
            module,
            ModuleRuntimeInfo {
                base_address: 0x0040_0000,
                path: path.to_string(),
                assembly,
            },
        );
    }

    pub fn add_object(&self, object: ObjectId, class: ClassId, size: u64) {
        let mut state = self.state.lock().unwrap();
        state.object_sizes.insert(object, size);
        state.object_classes.insert(object, class);
    }

    pub fn mask(&self) -> SubscriptionFlags {
        self.state.lock().unwrap().event_mask
    }

    pub fn mask_history(&self) -> Vec<SubscriptionFlags> {
        self.state.lock().unwrap().mask_history.clone()
    }

    pub fn force_gc_calls(&self) -> u32 {
        self.state.lock().unwrap().force_gc_calls
    }

    pub fn detach_requests(&self) -> Vec<u32> {
        self.state.lock().unwrap().detach_requests.clone()
    }

    pub fn hooks(&self) -> Option<(bool, bool, bool)> {
        self.state.lock().unwrap().hooks
    }
}

impl RuntimeProfiling for MockRuntime {
    fn get_event_mask(&self) -> RuntimeResult<SubscriptionFlags> {
        Ok(self.state.lock().unwrap().event_mask)
    }

    fn set_event_mask(&self, flags: SubscriptionFlags) -> RuntimeResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.set_mask_error.take() {
            return Err(err);
        }
        state.event_mask = flags;
        state.mask_history.push(flags);
        Ok(())
    }

    fn set_enter_leave_hooks(&self, enter: bool, leave: bool, tailcall: bool) -> RuntimeResult<()> {
        self.state.lock().unwrap().hooks = Some((enter, leave, tailcall));
        Ok(())
    }

    fn force_gc(&self) -> RuntimeResult<()> {
        let mut state = self.state.lock().unwrap();
        state.force_gc_calls += 1;
        match state.force_gc_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn request_detach(&self, timeout_ms: u32) -> RuntimeResult<()> {
        let mut state = self.state.lock().unwrap();
        state.detach_requests.push(timeout_ms);
        match state.detach_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn get_object_size(&self, object: ObjectId) -> RuntimeResult<u64> {
        self.state
            .lock()
            .unwrap()
            .object_sizes
            .get(&object)
            .copied()
            .ok_or(RuntimeError::UnknownId(object.as_u64()))
    }

    fn get_class_from_object(&self, object: ObjectId) -> RuntimeResult<ClassId> {
        self.state
            .lock()
            .unwrap()
            .object_classes
            .get(&object)
            .copied()
            .ok_or(RuntimeError::UnknownId(object.as_u64()))
    }

    fn is_array_class(&self, class: ClassId) -> RuntimeResult<Option<ArrayInfo>> {
        Ok(self.state.lock().unwrap().arrays.get(&class).copied())
    }

    fn get_class_layout(&self, class: ClassId) -> RuntimeResult<ClassLayout> {
        self.state
            .lock()
            .unwrap()
            .layouts
            .get(&class)
            .copied()
            .ok_or(RuntimeError::UnknownId(class.as_u64()))
    }

    fn get_class_id_info(&self, class: ClassId) -> RuntimeResult<(ModuleId, TypeToken)> {
        self.state
            .lock()
            .unwrap()
            .class_ids
            .get(&class)
            .copied()
            .ok_or(RuntimeError::UnknownId(class.as_u64()))
    }

    fn get_module_metadata(&self, _module: ModuleId) -> RuntimeResult<Arc<dyn MetadataReader>> {
        Ok(Arc::new(MockReader {
            state: Arc::clone(&self.state),
        }))
    }

    fn get_module_info(&self, module: ModuleId) -> RuntimeResult<ModuleRuntimeInfo> {
        self.state
            .lock()
            .unwrap()
            .modules
            .get(&module)
            .cloned()
            .ok_or(RuntimeError::UnknownId(module.as_u64()))
    }

    fn get_assembly_info(&self, assembly: AssemblyId) -> RuntimeResult<AssemblyRuntimeInfo> {
        self.state
            .lock()
            .unwrap()
            .assemblies
            .get(&assembly)
            .cloned()
            .ok_or(RuntimeError::UnknownId(assembly.as_u64()))
    }
}

/// Keep only allocation events.
pub fn allocations(events: &[ProfilerEvent]) -> Vec<&ProfilerEvent> {
    events
        .iter()
        .filter(|e| matches!(e, ProfilerEvent::ObjectAllocated { .. }))
        .collect()
}

/// Keep only class definitions.
pub fn class_defs(events: &[ProfilerEvent]) -> Vec<&ProfilerEvent> {
    events
        .iter()
        .filter(|e| matches!(e, ProfilerEvent::ClassIdDefinition { .. }))
        .collect()
}
