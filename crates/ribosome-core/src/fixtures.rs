//! Shared test data.

use std::sync::Arc;

use ribosome_nvim::Nvim;
use ribosome_nvim::testing::RecordingApi;
use serde::{Deserialize, Serialize};

use crate::component::Component;
use crate::config::RuntimeConfig;
use crate::mapping::Mapping;
use crate::plugin_state::{BasicConfig, PluginConfig, PluginState};
use crate::program::Program;
use crate::rpc::RpcProgram;
use crate::settings::PluginSettings;
use crate::view::ComponentData;
use crate::NS;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Counter {
    pub counter: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Inner {
    pub x: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Other {
    pub y: i64,
}

pub fn bump_x() -> Program<Counter> {
    Program::block("bump_x", |(): ()| {
        NS::<ComponentData<Counter, Inner>, ()>::modify(|mut v| {
            v.comp.x += 1;
            v
        })
    })
}

pub fn basic() -> BasicConfig {
    BasicConfig::new("test_plugin", "tst")
}

pub fn runtime() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.gather.threads = 2;
    config
}

/// Active components: `internal` and `c1` (state `Inner`, program `bump_x`).
pub fn counter_state() -> PluginState<Counter> {
    PluginConfig::new("test_plugin", "tst")
        .component(Component::new("c1").state::<Inner>().rpc(RpcProgram::command(bump_x())))
        .default_component("c1")
        .build(Counter::default(), PluginSettings::default(), &runtime())
        .unwrap()
}

/// Active component `greeter` declares mapping `hello` bound to `greet`.
pub fn mapping_state() -> PluginState<Counter> {
    let greet = Program::block("greet", |(_keys,): (Option<String>,)| {
        NS::<Counter, ()>::modify(|mut c| {
            c.counter += 1;
            c
        })
    });
    PluginConfig::new("test_plugin", "tst")
        .component(Component::new("greeter").mapping(Mapping::new("hello", "gh"), greet))
        .default_component("greeter")
        .build(Counter::default(), PluginSettings::default(), &runtime())
        .unwrap()
}

pub fn nvim() -> Nvim {
    Nvim::new(RecordingApi::new())
}

pub fn recording() -> (Arc<RecordingApi>, Nvim) {
    let api = Arc::new(RecordingApi::new());
    (api.clone(), Nvim::from_arc(api))
}
