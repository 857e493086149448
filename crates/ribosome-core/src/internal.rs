//! The `internal` component every plugin carries.
//!
//! ## Learning: Built-ins Are Ordinary Programs
//!
//! Introspection, log control and component activation are written with
//! the same [`Program`] constructors user code uses. They differ only in
//! their trigger configuration: every one is a synchronous function with
//! the full plugin name as prefix, e.g. `MyPluginProgramLog()`.
//!
//! | Program                         | Result                              |
//! |---------------------------------|-------------------------------------|
//! | `program_log`                   | JSON array of executed program names|
//! | `set_log_level(level)`          | the directive now in effect         |
//! | `state`                         | JSON of the plugin data             |
//! | `component_state`               | JSON of every component's state     |
//! | `rpc_triggers`                  | JSON of the handler specs           |
//! | `update_state(query)`           | patches the plugin data             |
//! | `update_component_state(c, q)`  | patches component `c`'s state       |
//! | `enable_components(names..)`    | names newly enabled                 |
//! | `poll(..)`                      | `true`, state untouched             |
//! | `append_runtime_path(path)`     | extends `runtimepath`               |
//! | `show_runtime_path`             | entries of `runtimepath`            |
//! | `mapping(uuid, keys)`           | result of the mapped program        |
//! | `internal_init`                 | result of the init program          |
//!
//! The program log is diagnostic and not part of the observable state: a
//! dispatched `poll` appends to it like every other program.

use serde_json::{Value, json};
use tracing::{debug, info};

use crate::component::Component;
use crate::mapping::Mapping;
use crate::ns::NS;
use crate::plugin_state::PluginState;
use crate::prog::Prog;
use crate::program::{Program, Varargs};
use crate::query::StateQuery;
use crate::rpc::{PrefixStyle, RpcMethod, RpcProgram, define_triggers, undefine_triggers};
use crate::{NvimIO, PluginData, RibosomeError};

/// Name of the internal component.
pub const NAME: &str = "internal";

/// Replaces the editor-side triggers with the current handler specs.
///
/// Returns the number of triggers defined.
pub fn redefine_triggers<D: PluginData>() -> Prog<D, usize> {
    Prog::access("redefine_triggers", |state: &mut PluginState<D>, nvim| {
        let plugin = state.basic().name.clone();
        undefine_triggers(state.rpc_triggers(), &plugin).run(nvim)?;
        state.set_rpc_triggers(Vec::new());
        let triggers = define_triggers(state.distinct_specs(), nvim.channel_id(), &plugin).run(nvim)?;
        let count = triggers.len();
        state.set_rpc_triggers(triggers);
        info!(%plugin, triggers = count, "defined rpc triggers");
        Ok(count)
    })
}

fn program_log<D: PluginData>() -> Program<D> {
    Program::block("program_log", |(): ()| {
        NS::<PluginState<D>, String>::inspect_either(|s| serde_json::to_string(s.program_log()))
    })
}

fn set_log_level<D: PluginData>() -> Program<D> {
    Program::compose("set_log_level", |(level,): (String,)| {
        Prog::access("set_log_level", move |state: &mut PluginState<D>, _| {
            let handler = state
                .log_handler()
                .ok_or_else(|| RibosomeError::Prog("no log handler attached".to_string()))?;
            handler.set_level(&level).map_err(RibosomeError::Prog)?;
            info!(%level, "log level changed");
            Ok(handler.level())
        })
    })
}

fn state<D: PluginData>() -> Program<D> {
    Program::block("state", |(): ()| {
        NS::<PluginState<D>, String>::inspect_either(|s| serde_json::to_string(s.data()))
    })
}

fn component_state<D: PluginData>() -> Program<D> {
    Program::compose("component_state", |(): ()| {
        Prog::access("component_state", |state: &mut PluginState<D>, _| {
            Ok(serde_json::to_string(&state.component_state_json()?)?)
        })
    })
}

fn rpc_triggers<D: PluginData>() -> Program<D> {
    Program::block("rpc_triggers", |(): ()| {
        NS::<PluginState<D>, String>::inspect_either(|s| serde_json::to_string(&s.distinct_specs()))
    })
}

fn update_state<D: PluginData>() -> Program<D> {
    Program::compose("update_state", |(query,): (StateQuery,)| {
        Prog::access("update_state", move |state: &mut PluginState<D>, _| {
            let mut data = serde_json::to_value(state.data())?;
            query.apply(&mut data)?;
            state.set_data(serde_json::from_value(data)?);
            Ok(())
        })
    })
}

fn update_component_state<D: PluginData>() -> Program<D> {
    Program::compose(
        "update_component_state",
        |(name, query): (String, StateQuery)| {
            Prog::access("update_component_state", move |state: &mut PluginState<D>, _| {
                state.modify_component_data(&name, |mut value| {
                    query.apply(&mut value)?;
                    Ok(value)
                })
            })
        },
    )
}

fn enable_components<D: PluginData>() -> Program<D> {
    Program::compose("enable_components", |Varargs(names): Varargs<String>| {
        Prog::access("enable_components", move |state: &mut PluginState<D>, _| {
            state.enable_components(&names)
        })
        .flat_map(|added| redefine_triggers().map(move |_| added))
    })
}

fn poll<D: PluginData>() -> Program<D> {
    Program::compose("poll", |_: Varargs<Value>| Prog::pure(true))
}

fn append_runtime_path<D: PluginData>() -> Program<D> {
    Program::compose("append_runtime_path", |(path,): (String,)| {
        let escaped = path.replace('\\', "\\\\").replace(' ', "\\ ").replace(',', "\\,");
        Prog::nvim(NvimIO::command(format!("set runtimepath+={}", escaped)))
    })
}

fn show_runtime_path<D: PluginData>() -> Program<D> {
    Program::compose("show_runtime_path", |(): ()| {
        Prog::nvim(
            NvimIO::<String>::read_tpe("nvim_get_option", vec![json!("runtimepath")]).map(|rtp| {
                rtp.split(',')
                    .filter(|entry| !entry.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            }),
        )
    })
}

fn mapping<D: PluginData>() -> Program<D> {
    Program::compose("mapping", |(uuid, keys): (String, Option<String>)| {
        Prog::access("mapping", move |state: &mut PluginState<D>, _| {
            state
                .active_mapping(&uuid)
                .cloned()
                .ok_or_else(|| RibosomeError::UnknownMapping(uuid.clone()))
        })
        .flat_map(move |(mapping, program): (Mapping, Program<D>)| {
            debug!(%mapping, ?keys, "running mapping");
            let args = match keys {
                Some(keys) if program.params().accepts(1) => vec![json!(keys)],
                _ => Vec::new(),
            };
            program.call(args)
        })
    })
}

fn internal_init<D: PluginData>() -> Program<D> {
    Program::compose("internal_init", |(): ()| {
        Prog::access("internal_init", |state: &mut PluginState<D>, _| {
            Ok(state.init().filter(|_| state.settings().internal_init))
        })
        .flat_map(|init| match init {
            Some(program) => {
                info!(program = program.name(), "running init program");
                program.call(Vec::new())
            }
            None => Prog::pure(Value::Null),
        })
    })
}

/// The internal component, active in every plugin.
pub fn component<D: PluginData>() -> Component<D> {
    let function = |program: Program<D>| RpcProgram::function(program).prefix(PrefixStyle::Full);
    Component::new(NAME)
        .rpc(function(program_log()).read_only())
        .rpc(function(set_log_level()).also(RpcMethod::command()))
        .rpc(function(state()).read_only())
        .rpc(function(component_state()).read_only())
        .rpc(function(rpc_triggers()).read_only())
        .rpc(function(update_state()).json())
        .rpc(function(update_component_state()).json())
        .rpc(function(enable_components()).also(RpcMethod::command()))
        .rpc(function(poll()).read_only())
        .rpc(function(append_runtime_path()))
        .rpc(function(show_runtime_path()).read_only())
        .rpc(function(mapping()))
        .rpc(function(internal_init()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{Counter, Inner, counter_state, mapping_state, nvim, recording, runtime};
    use crate::mapping::activate_mapping;
    use crate::plugin_state::{LogHandler, PluginConfig};
    use crate::prog::run_prog;
    use crate::settings::PluginSettings;
    use proptest::prelude::*;
    use std::sync::{Arc, Mutex};

    fn call<D: PluginData>(
        state: &mut PluginState<D>,
        nvim: &crate::Nvim,
        program: Program<D>,
        args: Vec<Value>,
    ) -> crate::RibosomeResult<Value> {
        let prog = program.bind(args)?;
        run_prog(state, nvim, prog)
    }

    fn json_result(value: Value) -> Value {
        serde_json::from_str(value.as_str().unwrap()).unwrap()
    }

    struct TestHandler(Mutex<String>);

    impl LogHandler for TestHandler {
        fn set_level(&self, level: &str) -> Result<(), String> {
            if level == "loud" {
                return Err(format!("invalid directive `{}`", level));
            }
            *self.0.lock().unwrap() = level.to_string();
            Ok(())
        }

        fn level(&self) -> String {
            self.0.lock().unwrap().clone()
        }
    }

    #[test]
    fn test_internal_triggers_use_full_prefix() {
        let state = counter_state();
        let specs = state.distinct_specs();
        let log = specs.iter().find(|s| s.method == "function:program_log").unwrap();
        assert_eq!(log.name, "TestPluginProgramLog");
        assert!(log.sync);
        assert!(specs.iter().any(|s| s.method == "command:enable_components"));
    }

    #[test]
    fn test_program_log_and_state() {
        let mut state = counter_state();
        state.log_program("bump_x");
        state.set_data(Counter { counter: 4 });
        let log = call(&mut state, &nvim(), program_log(), vec![]).unwrap();
        assert_eq!(json_result(log), json!(["bump_x"]));
        let data = call(&mut state, &nvim(), super::state(), vec![]).unwrap();
        assert_eq!(json_result(data), json!({"counter": 4}));
    }

    #[test]
    fn test_component_state_json() {
        let mut state = counter_state();
        state.store_component_value(Inner { x: 3 }).unwrap();
        let out = call(&mut state, &nvim(), component_state(), vec![]).unwrap();
        assert_eq!(json_result(out), json!({"c1": {"x": 3}}));
    }

    #[test]
    fn test_update_state_patches_data() {
        let mut state = counter_state();
        let query = json!({"patch": {"query": "", "data": {"counter": 9}}});
        call(&mut state, &nvim(), update_state(), vec![query]).unwrap();
        assert_eq!(state.data().counter, 9);

        let wrong_type = json!({"patch": {"query": "counter", "data": "nine"}});
        let err = call(&mut state, &nvim(), update_state(), vec![wrong_type]).unwrap_err();
        assert!(matches!(err, RibosomeError::Decode(_)));
        assert_eq!(state.data().counter, 9);
    }

    #[test]
    fn test_update_component_state() {
        let mut state = counter_state();
        let query = json!({"patch": {"query": "", "data": {"x": 12}}});
        call(&mut state, &nvim(), update_component_state(), vec![json!("c1"), query.clone()]).unwrap();
        assert_eq!(state.component_value::<Inner>().unwrap().x, 12);
        let err = call(&mut state, &nvim(), update_component_state(), vec![json!("c9"), query]).unwrap_err();
        assert!(matches!(err, RibosomeError::UnknownComponent(_)));
    }

    #[test]
    fn test_set_log_level() {
        let mut state = counter_state();
        let err = call(&mut state, &nvim(), set_log_level(), vec![json!("debug")]).unwrap_err();
        assert!(err.to_string().contains("no log handler"));

        state.set_log_handler(Arc::new(TestHandler(Mutex::new("info".to_string()))));
        let level = call(&mut state, &nvim(), set_log_level(), vec![json!("debug")]).unwrap();
        assert_eq!(level, json!("debug"));
        let err = call(&mut state, &nvim(), set_log_level(), vec![json!("loud")]).unwrap_err();
        assert!(err.to_string().contains("invalid directive"));
    }

    #[test]
    fn test_runtime_path_helpers() {
        let api = ribosome_nvim::testing::RecordingApi::new().with_var("&runtimepath", json!("/a,/b"));
        let api = Arc::new(api);
        let nvim = crate::Nvim::from_arc(api.clone());
        let mut state = counter_state();
        call(&mut state, &nvim, append_runtime_path(), vec![json!("/my dir")]).unwrap();
        assert_eq!(api.commands(), vec!["set runtimepath+=/my\\ dir".to_string()]);
        let paths = call(&mut state, &nvim, show_runtime_path(), vec![]).unwrap();
        assert_eq!(paths, json!(["/a", "/b"]));
    }

    #[test]
    fn test_mapping_runs_bound_program() {
        let (_, nvim) = recording();
        let mut state = mapping_state();
        let uuid = run_prog(&mut state, &nvim, activate_mapping::<Counter>("hello")).unwrap();
        call(&mut state, &nvim, mapping(), vec![json!(uuid), json!("gh")]).unwrap();
        assert_eq!(state.data().counter, 1);
        let err = call(&mut state, &nvim, mapping(), vec![json!("unknown")]).unwrap_err();
        assert!(matches!(err, RibosomeError::UnknownMapping(_)));
    }

    #[test]
    fn test_internal_init_requires_setting() {
        let init = Program::<Counter>::block("init", |(): ()| {
            NS::<Counter, ()>::modify(|mut c| {
                c.counter = 50;
                c
            })
        });
        let build = |enabled: bool| {
            PluginConfig::new("test_plugin", "tst")
                .init(init.clone())
                .build(
                    Counter::default(),
                    PluginSettings {
                        components: None,
                        internal_init: enabled,
                    },
                    &runtime(),
                )
                .unwrap()
        };
        let mut disabled = build(false);
        assert_eq!(call(&mut disabled, &nvim(), internal_init(), vec![]).unwrap(), Value::Null);
        assert_eq!(disabled.data().counter, 0);

        let mut enabled = build(true);
        call(&mut enabled, &nvim(), internal_init(), vec![]).unwrap();
        assert_eq!(enabled.data().counter, 50);
    }

    #[test]
    fn test_enable_components_redefines_triggers() {
        let (api, nvim) = recording();
        let mut state = counter_state();
        run_prog(&mut state, &nvim, redefine_triggers::<Counter>()).unwrap();
        let before = state.rpc_triggers().len();

        let added = call(&mut state, &nvim, enable_components(), vec![json!("c1")]).unwrap();
        assert_eq!(added, json!([]));
        assert_eq!(state.rpc_triggers().len(), before);
        let execs = api
            .requests()
            .into_iter()
            .filter(|(method, _)| method == "nvim_exec2")
            .count();
        assert_eq!(execs, 3);
    }

    #[test]
    fn test_failed_redefine_forgets_removed_triggers() {
        let execs = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = execs.clone();
        let api = ribosome_nvim::testing::RecordingApi::new().on("nvim_exec2", move |_| {
            match seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst) {
                2 => Err(ribosome_nvim::NvimError::request("nvim_exec2", "E174: Command already exists")),
                _ => Ok(Value::Null),
            }
        });
        let nvim = crate::Nvim::new(api);
        let mut state = counter_state();
        let defined = run_prog(&mut state, &nvim, redefine_triggers::<Counter>()).unwrap();
        assert_eq!(state.rpc_triggers().len(), defined);

        assert!(run_prog(&mut state, &nvim, redefine_triggers::<Counter>()).is_err());
        assert_eq!(execs.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert!(state.rpc_triggers().is_empty());
    }

    /// Everything a program can observe, except the diagnostic program log.
    fn snapshot(state: &PluginState<Counter>) -> Value {
        json!({
            "data": state.data(),
            "components": state.components(),
            "component_state": state.component_state_json().unwrap(),
            "rpc_triggers": state.rpc_triggers(),
            "settings": state.settings(),
        })
    }

    proptest! {
        #[test]
        fn prop_poll_is_total_and_pure(args in prop::collection::vec(any::<i64>(), 0..6)) {
            let mut state = counter_state();
            state.store_component_value(Inner { x: 2 }).unwrap();
            let nvim = nvim();
            let args: Vec<Value> = args.into_iter().map(|a| json!(a)).collect();
            let before = snapshot(&state);
            prop_assert_eq!(call(&mut state, &nvim, poll(), args.clone()).unwrap(), json!(true));
            let between = snapshot(&state);
            prop_assert_eq!(call(&mut state, &nvim, poll(), args).unwrap(), json!(true));
            let after = snapshot(&state);
            prop_assert_eq!(&before, &between);
            prop_assert_eq!(before, after);
        }
    }
}
