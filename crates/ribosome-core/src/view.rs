//! State views: what part of the plugin state a program sees.
//!
//! ## Learning: Marker Types Instead of Reflection
//!
//! A program's code returns `NS<R, A>`. The shape of `R` decides which part
//! of [`PluginState`] is projected into the computation and written back
//! afterwards. Rather than inspecting `R` at runtime, every admissible shape
//! implements [`StateView`] with a distinct marker type parameter. The
//! compiler picks the one impl whose bounds hold, and the marker is
//! inferred, so callers never name it:
//!
//! ```text
//!   R                              marker           main        affiliation
//!   ─────────────────────────────  ───────────────  ──────────  ───────────
//!   D                              Plain<Data>      data        root
//!   PluginState<D>                 Plain<Internal>  whole state root
//!   ComponentData<D, C>            Comp<Data>       data        component C
//!   ComponentData<PluginState, C>  Comp<Internal>   whole state component C
//!   Resources<any of the above>    Res<..>          as inner    as inner
//!   Ribosome<D, C>                 Ribo             whole state component C
//! ```
//!
//! Shapes that make no sense (`Resources<Resources<_>>`, a component view
//! over something that is not plugin data) have no impl and fail to compile.

use std::fmt;
use std::marker::PhantomData;

use crate::component::StateType;
use crate::plugin_state::PluginState;
use crate::settings::PluginSettings;
use crate::{PluginData, RibosomeResult};

/// Main view over the user data `D`.
pub enum Data {}

/// Main view over the complete [`PluginState`].
pub enum Internal {}

/// Marker for a bare main view.
pub struct Plain<M>(PhantomData<M>);

/// Marker for a [`ComponentData`] view.
pub struct Comp<M>(PhantomData<M>);

/// Marker for a [`Resources`] view.
pub struct Res<M>(PhantomData<M>);

/// Marker for a [`Ribosome`] view.
pub enum Ribo {}

/// Markers of views that may be wrapped in [`Resources`].
pub trait Unwrapped {}

impl<M> Unwrapped for Plain<M> {}
impl<M> Unwrapped for Comp<M> {}

/// Which value a view treats as the main data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MainKind {
    /// The user's plugin data.
    Data,
    /// The whole plugin state.
    Internal,
}

/// Whether a view includes a component's private state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affiliation {
    Root,
    Component(StateType),
}

/// The outer wrapper of a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wrapping {
    Plain,
    Resources,
    Ribosome,
}

/// Describes a program's view, derived from its state type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateDescriptor {
    pub main: MainKind,
    pub affiliation: Affiliation,
    pub wrapping: Wrapping,
}

impl StateDescriptor {
    /// The component state type this view needs, if any.
    pub fn component(&self) -> Option<StateType> {
        match self.affiliation {
            Affiliation::Root => None,
            Affiliation::Component(ty) => Some(ty),
        }
    }
}

impl fmt::Display for StateDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let main = match self.main {
            MainKind::Data => "data",
            MainKind::Internal => "state",
        };
        let inner = match self.affiliation {
            Affiliation::Root => main.to_string(),
            Affiliation::Component(ty) => format!("{}+{}", main, ty.name()),
        };
        match self.wrapping {
            Wrapping::Plain => write!(f, "{}", inner),
            Wrapping::Resources => write!(f, "resources({})", inner),
            Wrapping::Ribosome => write!(f, "ribosome({})", inner),
        }
    }
}

/// The main half of a view: either `D` or the whole `PluginState<D>`.
pub trait MainView<D, M>: Sized + Send + 'static {
    const MAIN: MainKind;

    fn project_main(state: &PluginState<D>) -> Self;

    fn restore_main(self, state: &mut PluginState<D>);
}

impl<D: PluginData> MainView<D, Data> for D {
    const MAIN: MainKind = MainKind::Data;

    fn project_main(state: &PluginState<D>) -> Self {
        state.data().clone()
    }

    fn restore_main(self, state: &mut PluginState<D>) {
        state.set_data(self);
    }
}

impl<D: PluginData> MainView<D, Internal> for PluginState<D> {
    const MAIN: MainKind = MainKind::Internal;

    fn project_main(state: &PluginState<D>) -> Self {
        state.clone()
    }

    fn restore_main(self, state: &mut PluginState<D>) {
        *state = self;
    }
}

/// A shape of state a program can declare.
///
/// `project` may create component state on first access, hence `&mut`.
pub trait StateView<D, M>: Sized + Send + 'static {
    fn descriptor() -> StateDescriptor;

    fn project(state: &mut PluginState<D>) -> RibosomeResult<Self>;

    fn restore(self, state: &mut PluginState<D>);
}

impl<D, R, M> StateView<D, Plain<M>> for R
where
    D: PluginData,
    R: MainView<D, M>,
{
    fn descriptor() -> StateDescriptor {
        StateDescriptor {
            main: R::MAIN,
            affiliation: Affiliation::Root,
            wrapping: Wrapping::Plain,
        }
    }

    fn project(state: &mut PluginState<D>) -> RibosomeResult<Self> {
        Ok(R::project_main(state))
    }

    fn restore(self, state: &mut PluginState<D>) {
        self.restore_main(state);
    }
}

/// The main view paired with the private state `C` of one component.
#[derive(Debug, Clone)]
pub struct ComponentData<M, C> {
    pub main: M,
    pub comp: C,
}

impl<M, C> ComponentData<M, C> {
    pub fn new(main: M, comp: C) -> Self {
        Self { main, comp }
    }
}

impl<D, Main, C, M> StateView<D, Comp<M>> for ComponentData<Main, C>
where
    D: PluginData,
    Main: MainView<D, M>,
    C: PluginData,
{
    fn descriptor() -> StateDescriptor {
        StateDescriptor {
            main: Main::MAIN,
            affiliation: Affiliation::Component(StateType::of::<C>()),
            wrapping: Wrapping::Plain,
        }
    }

    fn project(state: &mut PluginState<D>) -> RibosomeResult<Self> {
        let comp = state.component_value::<C>()?;
        Ok(Self {
            main: Main::project_main(state),
            comp,
        })
    }

    fn restore(self, state: &mut PluginState<D>) {
        self.main.restore_main(state);
        state.restore_component_value(self.comp);
    }
}

/// A view bundled with read-only plugin resources.
#[derive(Debug, Clone)]
pub struct Resources<S> {
    pub state: S,
    pub settings: PluginSettings,
    pub components: Vec<String>,
}

impl<D, S, M> StateView<D, Res<M>> for Resources<S>
where
    D: PluginData,
    S: StateView<D, M>,
    M: Unwrapped,
{
    fn descriptor() -> StateDescriptor {
        StateDescriptor {
            wrapping: Wrapping::Resources,
            ..S::descriptor()
        }
    }

    fn project(state: &mut PluginState<D>) -> RibosomeResult<Self> {
        let inner = S::project(state)?;
        Ok(state.resources_with(inner))
    }

    fn restore(self, state: &mut PluginState<D>) {
        self.state.restore(state);
    }
}

/// The whole plugin state plus typed access to component `C`.
pub struct Ribosome<D, C> {
    pub state: PluginState<D>,
    _comp: PhantomData<fn() -> C>,
}

impl<D: PluginData, C: PluginData> Ribosome<D, C> {
    pub fn new(state: PluginState<D>) -> Self {
        Self {
            state,
            _comp: PhantomData,
        }
    }

    /// Reads the component's state.
    pub fn comp(&mut self) -> RibosomeResult<C> {
        self.state.component_value::<C>()
    }

    /// Replaces the component's state.
    pub fn set_comp(&mut self, comp: C) -> RibosomeResult<()> {
        self.state.store_component_value(comp)
    }
}

impl<D, C> StateView<D, Ribo> for Ribosome<D, C>
where
    D: PluginData,
    C: PluginData,
{
    fn descriptor() -> StateDescriptor {
        StateDescriptor {
            main: MainKind::Internal,
            affiliation: Affiliation::Component(StateType::of::<C>()),
            wrapping: Wrapping::Ribosome,
        }
    }

    fn project(state: &mut PluginState<D>) -> RibosomeResult<Self> {
        state.component_value::<C>()?;
        Ok(Self::new(state.clone()))
    }

    fn restore(self, state: &mut PluginState<D>) {
        *state = self.state;
    }
}

/// The projection and write-back functions for view `R`.
pub struct Wrappers<D, R> {
    descriptor: StateDescriptor,
    get: fn(&mut PluginState<D>) -> RibosomeResult<R>,
    put: fn(R, &mut PluginState<D>),
}

impl<D: PluginData, R> Wrappers<D, R> {
    /// Derives the wrappers from `R`'s view impl.
    pub fn of<M>() -> Self
    where
        R: StateView<D, M>,
    {
        Self {
            descriptor: <R as StateView<D, M>>::descriptor(),
            get: <R as StateView<D, M>>::project,
            put: <R as StateView<D, M>>::restore,
        }
    }
}

impl<D, R> Wrappers<D, R> {
    /// Builds wrappers from explicit functions.
    pub fn new(
        descriptor: StateDescriptor,
        get: fn(&mut PluginState<D>) -> RibosomeResult<R>,
        put: fn(R, &mut PluginState<D>),
    ) -> Self {
        Self {
            descriptor,
            get,
            put,
        }
    }

    pub fn descriptor(&self) -> StateDescriptor {
        self.descriptor
    }

    pub(crate) fn get(&self, state: &mut PluginState<D>) -> RibosomeResult<R> {
        (self.get)(state)
    }

    pub(crate) fn put(&self, view: R, state: &mut PluginState<D>) {
        (self.put)(view, state)
    }
}

impl<D, R> Clone for Wrappers<D, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<D, R> Copy for Wrappers<D, R> {}

impl<D, R> fmt::Debug for Wrappers<D, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wrappers")
            .field("descriptor", &self.descriptor)
            .finish()
    }
}
