//! The plugin state: the one mutable record of a running plugin.
//!
//! ## Learning: Components by Name
//!
//! Programs live inside components and components are reachable from the
//! state, which in turn is what programs run against. Holding that cycle
//! with references would tie every lifetime together. Instead the state
//! keeps an immutable, shared [`ComponentCatalog`] and refers to active
//! components by name only:
//!
//! ```text
//!   PluginState
//!   ├── catalog: Arc<ComponentCatalog>   every known component (immutable)
//!   ├── components: ["internal", "c1"]   active, by name, ordered
//!   ├── programs                         config rpc + active components' rpc
//!   ├── component_data: TypeId ─▶ Box<dyn ComponentState>
//!   └── active_mappings: uuid ─▶ (Mapping, Program)
//! ```
//!
//! Enabling a component only touches the name list and recomputes
//! `programs`; the catalog never changes after startup.

use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::component::{Component, ComponentCatalog, ComponentState, StateSpec, StateType};
use crate::config::RuntimeConfig;
use crate::internal;
use crate::mapping::Mapping;
use crate::output::{DefaultInterpreter, GatherPool, IoExecutor, ProgIoInterpreter};
use crate::program::Program;
use crate::rpc::{ActiveRpcTrigger, RpcHandlerSpec, RpcProgram};
use crate::settings::PluginSettings;
use crate::view::Resources;
use crate::{PluginData, RibosomeError, RibosomeResult};

/// A sink whose verbosity can be changed at runtime.
pub trait LogHandler: Send + Sync {
    /// Applies a filter directive such as `debug` or `ribosome_core=trace`.
    fn set_level(&self, level: &str) -> Result<(), String>;

    /// The directive currently in effect.
    fn level(&self) -> String;
}

/// The immutable identity of a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicConfig {
    /// Plugin name, also the prefix of its editor variables
    pub name: String,
    /// Short prefix for trigger names
    pub prefix: String,
    /// Components that are always active
    pub core_components: Vec<String>,
    /// Components active unless the `components` setting overrides them
    pub default_components: Vec<String>,
    /// Module the editor-side settings are read from
    pub settings_module: Option<String>,
}

impl BasicConfig {
    pub fn new(name: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prefix: prefix.into(),
            core_components: Vec::new(),
            default_components: Vec::new(),
            settings_module: None,
        }
    }
}

/// Everything needed to build a [`PluginState`].
pub struct PluginConfig<D> {
    basic: BasicConfig,
    components: Vec<Component<D>>,
    rpc: Vec<RpcProgram<D>>,
    init: Option<Program<D>>,
    logger: Option<Program<D>>,
    io_executor: Option<IoExecutor>,
    interpreter: Option<Arc<dyn ProgIoInterpreter<D>>>,
}

impl<D: PluginData> PluginConfig<D> {
    pub fn new(name: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            basic: BasicConfig::new(name, prefix),
            components: Vec::new(),
            rpc: Vec::new(),
            init: None,
            logger: None,
            io_executor: None,
            interpreter: None,
        }
    }

    /// Makes `component` available for activation.
    pub fn component(mut self, component: Component<D>) -> Self {
        self.components.push(component);
        self
    }

    /// Activates the named component unconditionally.
    pub fn core(mut self, name: impl Into<String>) -> Self {
        self.basic.core_components.push(name.into());
        self
    }

    /// Activates the named component unless settings choose otherwise.
    pub fn default_component(mut self, name: impl Into<String>) -> Self {
        self.basic.default_components.push(name.into());
        self
    }

    /// Adds an rpc program that belongs to no component.
    pub fn rpc(mut self, program: RpcProgram<D>) -> Self {
        self.rpc.push(program);
        self
    }

    /// The program run by `internal_init` when the setting enables it.
    pub fn init(mut self, program: Program<D>) -> Self {
        self.init = Some(program);
        self
    }

    /// A program receiving `(messages, level)` for every echo.
    pub fn logger(mut self, program: Program<D>) -> Self {
        self.logger = Some(program);
        self
    }

    pub fn io_executor(mut self, executor: IoExecutor) -> Self {
        self.io_executor = Some(executor);
        self
    }

    /// Replaces the default effect interpreter.
    pub fn interpreter(mut self, interpreter: Arc<dyn ProgIoInterpreter<D>>) -> Self {
        self.interpreter = Some(interpreter);
        self
    }

    pub fn settings_module(mut self, module: impl Into<String>) -> Self {
        self.basic.settings_module = Some(module.into());
        self
    }

    pub fn basic(&self) -> &BasicConfig {
        &self.basic
    }

    /// Validates the configuration and builds the initial state.
    ///
    /// Every program is checked here, so a malformed program stops the
    /// plugin from starting rather than failing its first request.
    pub fn build(
        self,
        data: D,
        settings: PluginSettings,
        runtime: &RuntimeConfig,
    ) -> RibosomeResult<PluginState<D>> {
        let mut catalog = ComponentCatalog::new();
        catalog.register(internal::component())?;
        for component in self.components {
            catalog.register(component)?;
        }
        catalog.validate()?;
        for rpc in &self.rpc {
            catalog.validate_rpc(rpc)?;
        }
        for program in self.init.iter().chain(self.logger.iter()) {
            catalog.validate_program(program)?;
        }

        let mut basic = self.basic;
        if !basic.core_components.iter().any(|c| c == internal::NAME) {
            basic.core_components.insert(0, internal::NAME.to_string());
        }
        let selected = settings
            .components
            .clone()
            .unwrap_or_else(|| basic.default_components.clone());
        let mut components: Vec<String> = Vec::new();
        for name in basic.core_components.iter().chain(selected.iter()) {
            if !catalog.contains(name) {
                return Err(RibosomeError::UnknownComponent(name.clone()));
            }
            if !components.contains(name) {
                components.push(name.clone());
            }
        }

        let program_interpreter = match self.interpreter {
            Some(interpreter) => interpreter,
            None => {
                let pool = GatherPool::new(runtime.gather.threads, runtime.gather.default_timeout())
                    .map_err(|e| RibosomeError::Fatal(format!("cannot start gather pool: {}", e)))?;
                Arc::new(DefaultInterpreter::new(pool))
            }
        };

        let mut state = PluginState {
            basic,
            catalog: Arc::new(catalog),
            config_rpc: self.rpc,
            init: self.init,
            data,
            components: Vec::new(),
            component_data: HashMap::new(),
            programs: Vec::new(),
            rpc_triggers: Vec::new(),
            active_mappings: HashMap::new(),
            program_log: Vec::new(),
            settings,
            log_handler: None,
            logger: self.logger,
            io_executor: self.io_executor,
            program_interpreter,
        };
        state.programs = state.aggregate_programs(&components)?;
        state.components = components;
        info!(
            plugin = %state.basic.name,
            components = ?state.components,
            programs = state.programs.len(),
            "plugin state ready"
        );
        Ok(state)
    }
}

/// The mutable record a plugin's programs run against.
pub struct PluginState<D> {
    basic: BasicConfig,
    catalog: Arc<ComponentCatalog<D>>,
    config_rpc: Vec<RpcProgram<D>>,
    init: Option<Program<D>>,
    data: D,
    components: Vec<String>,
    component_data: HashMap<TypeId, Box<dyn ComponentState>>,
    programs: Vec<RpcProgram<D>>,
    rpc_triggers: Vec<ActiveRpcTrigger>,
    active_mappings: HashMap<String, (Mapping, Program<D>)>,
    program_log: Vec<String>,
    settings: PluginSettings,
    log_handler: Option<Arc<dyn LogHandler>>,
    logger: Option<Program<D>>,
    io_executor: Option<IoExecutor>,
    program_interpreter: Arc<dyn ProgIoInterpreter<D>>,
}

impl<D: PluginData> PluginState<D> {
    pub fn basic(&self) -> &BasicConfig {
        &self.basic
    }

    pub fn catalog(&self) -> &ComponentCatalog<D> {
        &self.catalog
    }

    pub fn data(&self) -> &D {
        &self.data
    }

    /// Replaces the user data as a whole.
    pub fn set_data(&mut self, data: D) {
        self.data = data;
    }

    /// Names of the active components, in activation order.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    pub fn settings(&self) -> &PluginSettings {
        &self.settings
    }

    pub fn programs(&self) -> &[RpcProgram<D>] {
        &self.programs
    }

    pub fn init(&self) -> Option<Program<D>> {
        self.init.clone()
    }

    pub fn logger(&self) -> Option<Program<D>> {
        self.logger.clone()
    }

    pub fn io_executor(&self) -> Option<IoExecutor> {
        self.io_executor.clone()
    }

    pub fn set_io_executor(&mut self, executor: IoExecutor) {
        self.io_executor = Some(executor);
    }

    pub fn program_interpreter(&self) -> Arc<dyn ProgIoInterpreter<D>> {
        self.program_interpreter.clone()
    }

    pub fn log_handler(&self) -> Option<Arc<dyn LogHandler>> {
        self.log_handler.clone()
    }

    pub fn set_log_handler(&mut self, handler: Arc<dyn LogHandler>) {
        self.log_handler = Some(handler);
    }

    /// The program registered for `method`, e.g. `command:incr`.
    pub fn lookup_method(&self, method: &str) -> Option<&RpcProgram<D>> {
        self.programs
            .iter()
            .find(|rpc| rpc.methods().iter().any(|m| m == method))
    }

    /// Appends to the diagnostic log of executed programs.
    pub fn log_program(&mut self, name: impl Into<String>) {
        self.program_log.push(name.into());
    }

    pub fn program_log(&self) -> &[String] {
        &self.program_log
    }

    pub fn rpc_triggers(&self) -> &[ActiveRpcTrigger] {
        &self.rpc_triggers
    }

    pub fn set_rpc_triggers(&mut self, triggers: Vec<ActiveRpcTrigger>) {
        self.rpc_triggers = triggers;
    }

    /// Handler metadata of every active program, one entry per trigger.
    pub fn distinct_specs(&self) -> Vec<RpcHandlerSpec> {
        let mut seen = HashSet::new();
        self.programs
            .iter()
            .flat_map(|rpc| rpc.specs(&self.basic))
            .filter(|spec| seen.insert((spec.kind, spec.name.clone())))
            .collect()
    }

    /// Activates `names`, recomputing the program table.
    ///
    /// Returns the names that were not active before. On error nothing
    /// changes.
    pub fn enable_components(&mut self, names: &[String]) -> RibosomeResult<Vec<String>> {
        let mut next = self.components.clone();
        let mut added = Vec::new();
        for name in names {
            if !self.catalog.contains(name) {
                return Err(RibosomeError::UnknownComponent(name.clone()));
            }
            if !next.contains(name) {
                next.push(name.clone());
                added.push(name.clone());
            }
        }
        let programs = self.aggregate_programs(&next)?;
        self.components = next;
        self.programs = programs;
        if !added.is_empty() {
            info!(components = ?added, "enabled components");
        }
        Ok(added)
    }

    /// Config rpc followed by the rpc of every component in `components`.
    fn aggregate_programs(&self, components: &[String]) -> RibosomeResult<Vec<RpcProgram<D>>> {
        let mut programs = self.config_rpc.clone();
        for name in components {
            let component = self
                .catalog
                .get(name)
                .ok_or_else(|| RibosomeError::UnknownComponent(name.clone()))?;
            programs.extend(component.rpc_programs().iter().cloned());
        }

        let mut methods = HashSet::new();
        let mut triggers = HashSet::new();
        for spec in programs.iter().flat_map(|rpc| rpc.specs(&self.basic)) {
            if !methods.insert(spec.method.clone()) {
                return Err(RibosomeError::Conflict(format!(
                    "method `{}` is defined twice",
                    spec.method
                )));
            }
            if !triggers.insert((spec.kind, spec.name.clone())) {
                return Err(RibosomeError::Conflict(format!(
                    "{} `{}` is defined twice",
                    spec.kind, spec.name
                )));
            }
        }
        Ok(programs)
    }

    fn is_active(&self, name: &str) -> bool {
        self.components.iter().any(|c| c == name)
    }

    /// The state spec of the active component owning `ty`.
    fn active_state_spec(&self, ty: StateType) -> RibosomeResult<StateSpec> {
        let owner = self
            .catalog
            .owner_of(ty)
            .filter(|owner| self.is_active(owner.name()))
            .ok_or_else(|| {
                RibosomeError::UnknownComponent(format!("no active component owns {}", ty.name()))
            })?;
        owner
            .state_spec()
            .cloned()
            .ok_or_else(|| RibosomeError::Fatal(format!("`{}` lost its state spec", owner.name())))
    }

    /// The state type of the active component `name`.
    fn active_state_type(&self, name: &str) -> RibosomeResult<StateType> {
        if !self.is_active(name) {
            return Err(RibosomeError::UnknownComponent(name.to_string()));
        }
        self.catalog
            .get(name)
            .and_then(Component::state_type)
            .ok_or_else(|| RibosomeError::Prog(format!("component `{}` has no state", name)))
    }

    /// Returns the state stored for `ty`, creating it on first access.
    fn ensure_state(&mut self, ty: StateType) -> RibosomeResult<&dyn ComponentState> {
        if !self.component_data.contains_key(&ty.id()) {
            let spec = self.active_state_spec(ty)?;
            self.component_data.insert(ty.id(), spec.create());
        }
        self.component_data
            .get(&ty.id())
            .map(|state| &**state)
            .ok_or_else(|| RibosomeError::Fatal(format!("state {} vanished", ty.name())))
    }

    /// The current private state of the component declaring `C`.
    pub fn component_value<C: PluginData>(&mut self) -> RibosomeResult<C> {
        let ty = StateType::of::<C>();
        self.ensure_state(ty)?
            .as_any()
            .downcast_ref::<C>()
            .cloned()
            .ok_or_else(|| RibosomeError::Fatal(format!("state stored for {} has another type", ty.name())))
    }

    /// Stores the private state of the active component declaring `C`.
    pub fn store_component_value<C: PluginData>(&mut self, value: C) -> RibosomeResult<()> {
        self.update_component_data(StateType::of::<C>(), Box::new(value))
    }

    /// Writes back a value previously projected with [`Self::component_value`].
    pub(crate) fn restore_component_value<C: PluginData>(&mut self, value: C) {
        self.component_data.insert(TypeId::of::<C>(), Box::new(value));
    }

    /// Stores a type-erased component state under `ty`.
    pub fn update_component_data(
        &mut self,
        ty: StateType,
        value: Box<dyn ComponentState>,
    ) -> RibosomeResult<()> {
        if value.as_any().type_id() != ty.id() {
            return Err(RibosomeError::type_error(
                ty.name(),
                "value does not match the component state type",
            ));
        }
        self.active_state_spec(ty)?;
        self.component_data.insert(ty.id(), value);
        Ok(())
    }

    /// The private state of the active component `name` as JSON.
    pub fn data_for(&mut self, name: &str) -> RibosomeResult<Value> {
        let ty = self.active_state_type(name)?;
        self.ensure_state(ty)?.to_json()
    }

    /// Applies `f` to the JSON form of component `name`'s state.
    ///
    /// The result must decode back into the component's state type.
    pub fn modify_component_data<F>(&mut self, name: &str, f: F) -> RibosomeResult<()>
    where
        F: FnOnce(Value) -> RibosomeResult<Value>,
    {
        let ty = self.active_state_type(name)?;
        let current = self.ensure_state(ty)?;
        let updated = current.decode_like(f(current.to_json()?)?)?;
        self.component_data.insert(ty.id(), updated);
        Ok(())
    }

    /// Every created component state as JSON, keyed by component name.
    pub fn component_state_json(&self) -> RibosomeResult<Value> {
        let mut out = Map::new();
        for name in &self.components {
            let Some(ty) = self.catalog.get(name).and_then(Component::state_type) else {
                continue;
            };
            if let Some(state) = self.component_data.get(&ty.id()) {
                out.insert(name.clone(), state.to_json()?);
            }
        }
        Ok(Value::Object(out))
    }

    /// Packages `state` with the plugin's settings and active components.
    pub fn resources_with<S>(&self, state: S) -> Resources<S> {
        Resources {
            state,
            settings: self.settings.clone(),
            components: self.components.clone(),
        }
    }

    /// The mapping `ident` declared by an active component.
    pub fn find_mapping(&self, ident: &str) -> Option<(Mapping, Program<D>)> {
        self.components
            .iter()
            .filter_map(|name| self.catalog.get(name))
            .flat_map(|component| component.mappings())
            .find(|(mapping, _)| mapping.ident == ident)
            .cloned()
    }

    pub fn insert_active_mapping(&mut self, uuid: String, mapping: Mapping, program: Program<D>) {
        self.active_mappings.insert(uuid, (mapping, program));
    }

    pub fn active_mapping(&self, uuid: &str) -> Option<&(Mapping, Program<D>)> {
        self.active_mappings.get(uuid)
    }
}

impl<D: Clone> Clone for PluginState<D> {
    fn clone(&self) -> Self {
        Self {
            basic: self.basic.clone(),
            catalog: self.catalog.clone(),
            config_rpc: self.config_rpc.clone(),
            init: self.init.clone(),
            data: self.data.clone(),
            components: self.components.clone(),
            component_data: self
                .component_data
                .iter()
                .map(|(id, state)| (*id, state.clone_state()))
                .collect(),
            programs: self.programs.clone(),
            rpc_triggers: self.rpc_triggers.clone(),
            active_mappings: self.active_mappings.clone(),
            program_log: self.program_log.clone(),
            settings: self.settings.clone(),
            log_handler: self.log_handler.clone(),
            logger: self.logger.clone(),
            io_executor: self.io_executor.clone(),
            program_interpreter: self.program_interpreter.clone(),
        }
    }
}

impl<D> fmt::Debug for PluginState<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginState")
            .field("plugin", &self.basic.name)
            .field("components", &self.components)
            .field("programs", &self.programs.len())
            .field("rpc_triggers", &self.rpc_triggers.len())
            .field("active_mappings", &self.active_mappings.len())
            .finish()
    }
}
