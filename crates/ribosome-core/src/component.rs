//! Components: named bundles of programs, private state and mappings.
//!
//! ## Learning: Type Erasure with a Blanket Impl
//!
//! Each component may own a private state of its own type. The plugin
//! state stores them side by side as `Box<dyn ComponentState>`; the blanket
//! impl below makes every [`PluginData`] type a `ComponentState`, so
//! component authors never implement the trait by hand. Typed access goes
//! back through [`Any`] downcasts keyed by [`StateType`].

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde_json::Value;

use crate::mapping::Mapping;
use crate::program::Program;
use crate::rpc::RpcProgram;
use crate::{PluginData, RibosomeError, RibosomeResult};

/// Identifies a component's private state type.
#[derive(Clone, Copy)]
pub struct StateType {
    id: TypeId,
    name: &'static str,
}

impl StateType {
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    /// The unqualified type name.
    pub fn name(&self) -> &'static str {
        let base = self.name.split('<').next().unwrap_or(self.name);
        base.rsplit("::").next().unwrap_or(base)
    }
}

impl PartialEq for StateType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for StateType {}

impl Hash for StateType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for StateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateType({})", self.name)
    }
}

/// Object-safe view of a component's private state.
pub trait ComponentState: Send + 'static {
    fn clone_state(&self) -> Box<dyn ComponentState>;

    fn to_json(&self) -> RibosomeResult<Value>;

    /// Decodes `value` into a new state of the same type.
    fn decode_like(&self, value: Value) -> RibosomeResult<Box<dyn ComponentState>>;

    fn as_any(&self) -> &dyn Any;
}

impl<T: PluginData> ComponentState for T {
    fn clone_state(&self) -> Box<dyn ComponentState> {
        Box::new(self.clone())
    }

    fn to_json(&self) -> RibosomeResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    fn decode_like(&self, value: Value) -> RibosomeResult<Box<dyn ComponentState>> {
        let decoded: T = serde_json::from_value(value)?;
        Ok(Box::new(decoded))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

type StateCtor = Arc<dyn Fn() -> Box<dyn ComponentState> + Send + Sync>;

/// How a component's private state is created on first access.
#[derive(Clone)]
pub struct StateSpec {
    ty: StateType,
    ctor: StateCtor,
}

impl StateSpec {
    pub fn ty(&self) -> StateType {
        self.ty
    }

    pub fn create(&self) -> Box<dyn ComponentState> {
        (self.ctor)()
    }
}

impl fmt::Debug for StateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateSpec").field("ty", &self.ty).finish()
    }
}

/// A named bundle of rpc programs, private state and mappings.
pub struct Component<D> {
    name: String,
    rpc: Vec<RpcProgram<D>>,
    state: Option<StateSpec>,
    config: Option<Value>,
    mappings: Vec<(Mapping, Program<D>)>,
}

impl<D: PluginData> Component<D> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rpc: Vec::new(),
            state: None,
            config: None,
            mappings: Vec::new(),
        }
    }

    /// Adds an rpc program.
    pub fn rpc(mut self, program: RpcProgram<D>) -> Self {
        self.rpc.push(program);
        self
    }

    /// Declares a private state created with `C::default()`.
    pub fn state<C: PluginData + Default>(self) -> Self {
        self.state_with(C::default)
    }

    /// Declares a private state created by `ctor`.
    pub fn state_with<C, F>(mut self, ctor: F) -> Self
    where
        C: PluginData,
        F: Fn() -> C + Send + Sync + 'static,
    {
        self.state = Some(StateSpec {
            ty: StateType::of::<C>(),
            ctor: Arc::new(move || Box::new(ctor())),
        });
        self
    }

    /// Attaches free-form component configuration.
    pub fn config(mut self, config: Value) -> Self {
        self.config = Some(config);
        self
    }

    /// Binds `program` to a key mapping.
    pub fn mapping(mut self, mapping: Mapping, program: Program<D>) -> Self {
        self.mappings.push((mapping, program));
        self
    }
}

impl<D> Component<D> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rpc_programs(&self) -> &[RpcProgram<D>] {
        &self.rpc
    }

    pub fn state_spec(&self) -> Option<&StateSpec> {
        self.state.as_ref()
    }

    pub fn state_type(&self) -> Option<StateType> {
        self.state.as_ref().map(StateSpec::ty)
    }

    pub fn component_config(&self) -> Option<&Value> {
        self.config.as_ref()
    }

    pub fn mappings(&self) -> &[(Mapping, Program<D>)] {
        &self.mappings
    }

    /// Returns true if one of this component's rpc programs runs `program`.
    pub fn contains(&self, program: &str) -> bool {
        self.rpc.iter().any(|rpc| rpc.program().name() == program)
    }
}

impl<D> Clone for Component<D> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            rpc: self.rpc.clone(),
            state: self.state.clone(),
            config: self.config.clone(),
            mappings: self.mappings.clone(),
        }
    }
}

impl<D> fmt::Debug for Component<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component")
            .field("name", &self.name)
            .field("rpc", &self.rpc.len())
            .field("state", &self.state_type())
            .finish()
    }
}

/// Every component a plugin knows about, active or not.
///
/// ## Learning: Registration-Time Validation
///
/// Lookups at request time assume the catalog is consistent, so the
/// invariants are checked once in [`ComponentCatalog::register`] and
/// [`ComponentCatalog::validate`]: names are unique, no two components
/// share a state type, and every program's view refers to state some
/// component owns.
pub struct ComponentCatalog<D> {
    components: Vec<Component<D>>,
    by_name: HashMap<String, usize>,
}

impl<D: PluginData> ComponentCatalog<D> {
    pub fn new() -> Self {
        Self {
            components: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    /// Adds a component.
    pub fn register(&mut self, component: Component<D>) -> RibosomeResult<()> {
        if self.by_name.contains_key(component.name()) {
            return Err(RibosomeError::Conflict(format!(
                "component `{}` is registered twice",
                component.name()
            )));
        }
        if let Some(ty) = component.state_type() {
            if let Some(owner) = self.owner_of(ty) {
                return Err(RibosomeError::Conflict(format!(
                    "components `{}` and `{}` both declare state type {}",
                    owner.name(),
                    component.name(),
                    ty.name()
                )));
            }
        }
        self.by_name
            .insert(component.name().to_string(), self.components.len());
        self.components.push(component);
        Ok(())
    }

    /// Checks that every program of every component is well formed.
    pub fn validate(&self) -> RibosomeResult<()> {
        for component in &self.components {
            for rpc in component.rpc_programs() {
                self.validate_rpc(rpc)?;
            }
            for (_, program) in component.mappings() {
                self.validate_program(program)?;
            }
        }
        Ok(())
    }

    /// Checks one rpc program against the catalog.
    pub fn validate_rpc(&self, rpc: &RpcProgram<D>) -> RibosomeResult<()> {
        if rpc.options().methods.is_empty() {
            return Err(RibosomeError::type_error(
                rpc.program().name(),
                "no rpc method declared",
            ));
        }
        self.validate_program(rpc.program())
    }

    /// Checks that the view `program` declares refers to owned state.
    pub fn validate_program(&self, program: &Program<D>) -> RibosomeResult<()> {
        let Some(descriptor) = program.params().state else {
            return Ok(());
        };
        match descriptor.component() {
            Some(ty) if self.owner_of(ty).is_none() => Err(RibosomeError::type_error(
                program.name(),
                format!("no component declares state type {}", ty.name()),
            )),
            _ => Ok(()),
        }
    }
}

impl<D> ComponentCatalog<D> {
    pub fn get(&self, name: &str) -> Option<&Component<D>> {
        self.by_name.get(name).map(|&i| &self.components[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// The component declaring state type `ty`.
    pub fn owner_of(&self, ty: StateType) -> Option<&Component<D>> {
        self.components
            .iter()
            .find(|c| c.state_type() == Some(ty))
    }

    /// Component names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.components.iter().map(|c| c.name()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Component<D>> {
        self.components.iter()
    }
}

impl<D: PluginData> Default for ComponentCatalog<D> {
    fn default() -> Self {
        Self::new()
    }
}
