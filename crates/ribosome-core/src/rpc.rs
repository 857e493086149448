//! Editor triggers: how a program becomes a command, function or autocmd.
//!
//! ## Learning: Registry by Naming Convention
//!
//! The editor reaches a program through a trigger it defines itself, for
//! example a user command calling `rpcrequest`. Every trigger sends a method
//! name of the form `<kind>:<name>`, which the dispatcher looks up among the
//! plugin's active programs.
//!
//! ```text
//!   :MyoIncr 3        ──▶ rpcnotify(chan, 'command:incr', '3')
//!   MyoProgramLog()   ──▶ rpcrequest(chan, 'function:program_log', [])
//!   BufEnter *.rs     ──▶ rpcnotify(chan, 'autocmd:buf_enter')
//! ```

use std::collections::BTreeMap;
use std::fmt;

use ribosome_nvim::NvimIO;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::plugin_state::BasicConfig;
use crate::program::{ParamsSpec, Program};

/// Converts `snake_case` or `kebab-case` to `CamelCase`.
pub fn camelcase(name: &str) -> String {
    name.split(['_', '-', ' '])
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

/// The kind of editor trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RpcKind {
    Command,
    Function,
    Autocmd,
}

impl RpcKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RpcKind::Command => "command",
            RpcKind::Function => "function",
            RpcKind::Autocmd => "autocmd",
        }
    }

    /// Parses the kind part of a method name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "command" => Some(RpcKind::Command),
            "function" => Some(RpcKind::Function),
            "autocmd" => Some(RpcKind::Autocmd),
            _ => None,
        }
    }
}

impl fmt::Display for RpcKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One way to trigger a program from the editor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcMethod {
    Command { sync: bool, bang: bool },
    Function { sync: bool },
    Autocmd { sync: bool, pattern: String },
}

impl RpcMethod {
    /// An asynchronous user command.
    pub fn command() -> Self {
        RpcMethod::Command {
            sync: false,
            bang: false,
        }
    }

    /// A synchronous function.
    pub fn function() -> Self {
        RpcMethod::Function { sync: true }
    }

    /// An asynchronous autocmd on `pattern`.
    pub fn autocmd(pattern: impl Into<String>) -> Self {
        RpcMethod::Autocmd {
            sync: false,
            pattern: pattern.into(),
        }
    }

    pub fn kind(&self) -> RpcKind {
        match self {
            RpcMethod::Command { .. } => RpcKind::Command,
            RpcMethod::Function { .. } => RpcKind::Function,
            RpcMethod::Autocmd { .. } => RpcKind::Autocmd,
        }
    }

    pub fn sync(&self) -> bool {
        match self {
            RpcMethod::Command { sync, .. }
            | RpcMethod::Function { sync }
            | RpcMethod::Autocmd { sync, .. } => *sync,
        }
    }

    fn set_sync(&mut self, value: bool) {
        match self {
            RpcMethod::Command { sync, .. }
            | RpcMethod::Function { sync }
            | RpcMethod::Autocmd { sync, .. } => *sync = value,
        }
    }
}

/// How a trigger name is prefixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrefixStyle {
    /// The plugin's short prefix, e.g. `MyoIncr`.
    #[default]
    Short,
    /// The plugin's full name, e.g. `MyPluginIncr`.
    Full,
    /// No prefix, e.g. `Incr`.
    Plain,
}

impl PrefixStyle {
    fn prefix(&self, basic: &BasicConfig) -> String {
        match self {
            PrefixStyle::Short => camelcase(&basic.prefix),
            PrefixStyle::Full => camelcase(&basic.name),
            PrefixStyle::Plain => String::new(),
        }
    }
}

/// Trigger configuration of an [`RpcProgram`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcOptions {
    /// Overrides the program name in method and trigger names.
    pub name: Option<String>,
    pub methods: Vec<RpcMethod>,
    pub prefix: PrefixStyle,
    /// Reassemble trailing arguments as one JSON document.
    pub json: bool,
    /// Whether the program mutates state.
    pub write: bool,
}

impl Default for RpcOptions {
    fn default() -> Self {
        Self {
            name: None,
            methods: vec![RpcMethod::command()],
            prefix: PrefixStyle::Short,
            json: false,
            write: true,
        }
    }
}

/// A program plus the editor triggers that run it.
pub struct RpcProgram<D> {
    program: Program<D>,
    options: RpcOptions,
}

impl<D> RpcProgram<D> {
    pub fn new(program: Program<D>, methods: Vec<RpcMethod>) -> Self {
        Self {
            program,
            options: RpcOptions {
                methods,
                ..RpcOptions::default()
            },
        }
    }

    /// Triggered by an asynchronous command.
    pub fn command(program: Program<D>) -> Self {
        Self::new(program, vec![RpcMethod::command()])
    }

    /// Triggered by a synchronous function.
    pub fn function(program: Program<D>) -> Self {
        Self::new(program, vec![RpcMethod::function()])
    }

    /// Triggered by an autocmd; the event is the camel-cased program name.
    pub fn autocmd(program: Program<D>, pattern: impl Into<String>) -> Self {
        Self::new(program, vec![RpcMethod::autocmd(pattern)])
    }

    /// Adds another trigger.
    pub fn also(mut self, method: RpcMethod) -> Self {
        self.options.methods.push(method);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.options.name = Some(name.into());
        self
    }

    pub fn prefix(mut self, prefix: PrefixStyle) -> Self {
        self.options.prefix = prefix;
        self
    }

    pub fn json(mut self) -> Self {
        self.options.json = true;
        self
    }

    /// Marks the program as not mutating state.
    pub fn read_only(mut self) -> Self {
        self.options.write = false;
        self
    }

    /// Makes every trigger synchronous.
    pub fn sync(mut self) -> Self {
        for method in &mut self.options.methods {
            method.set_sync(true);
        }
        self
    }

    /// Makes commands pass `<bang>` as the last argument.
    pub fn bang(mut self) -> Self {
        for method in &mut self.options.methods {
            if let RpcMethod::Command { bang, .. } = method {
                *bang = true;
            }
        }
        self
    }

    pub fn program(&self) -> &Program<D> {
        &self.program
    }

    pub fn options(&self) -> &RpcOptions {
        &self.options
    }

    /// The name used in method names.
    pub fn rpc_name(&self) -> &str {
        self.options
            .name
            .as_deref()
            .unwrap_or_else(|| self.program.name())
    }

    /// The method name for triggers of `kind`.
    pub fn method(&self, kind: RpcKind) -> String {
        format!("{}:{}", kind, self.rpc_name())
    }

    pub fn methods(&self) -> Vec<String> {
        self.options
            .methods
            .iter()
            .map(|m| self.method(m.kind()))
            .collect()
    }

    /// The editor-side name of the trigger for `kind`.
    pub fn trigger_name(&self, kind: RpcKind, basic: &BasicConfig) -> String {
        let base = camelcase(self.rpc_name());
        match kind {
            RpcKind::Autocmd => base,
            _ => format!("{}{}", self.options.prefix.prefix(basic), base),
        }
    }

    /// Editor-visible metadata, one entry per trigger.
    pub fn specs(&self, basic: &BasicConfig) -> Vec<RpcHandlerSpec> {
        self.options
            .methods
            .iter()
            .map(|method| {
                let kind = method.kind();
                let mut opts = BTreeMap::new();
                match method {
                    RpcMethod::Command { bang, .. } => {
                        let params = command_params(self.program.params(), *bang);
                        opts.insert("nargs".to_string(), json!(params.nargs()));
                        if *bang {
                            opts.insert("bang".to_string(), json!(""));
                        }
                    }
                    RpcMethod::Function { .. } => {}
                    RpcMethod::Autocmd { pattern, .. } => {
                        opts.insert("pattern".to_string(), json!(pattern));
                    }
                }
                RpcHandlerSpec {
                    kind,
                    sync: method.sync(),
                    name: self.trigger_name(kind, basic),
                    opts,
                    method: self.method(kind),
                    prefix: self.options.prefix,
                }
            })
            .collect()
    }
}

/// The params a command passes through `<f-args>`, excluding the bang flag.
fn command_params(params: &ParamsSpec, bang: bool) -> ParamsSpec {
    if !bang {
        return params.clone();
    }
    ParamsSpec {
        min: params.min.saturating_sub(1),
        max: params.max.map(|m| m.saturating_sub(1)),
        ..params.clone()
    }
}

impl<D> Clone for RpcProgram<D> {
    fn clone(&self) -> Self {
        Self {
            program: self.program.clone(),
            options: self.options.clone(),
        }
    }
}

impl<D> fmt::Debug for RpcProgram<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcProgram")
            .field("program", &self.program.name())
            .field("options", &self.options)
            .finish()
    }
}

/// Editor-visible metadata of one trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcHandlerSpec {
    #[serde(rename = "type")]
    pub kind: RpcKind,
    pub sync: bool,
    pub name: String,
    pub opts: BTreeMap<String, Value>,
    pub method: String,
    pub prefix: PrefixStyle,
}

impl RpcHandlerSpec {
    fn call(&self, channel: i64, args: &str) -> String {
        let rpc = if self.sync { "rpcrequest" } else { "rpcnotify" };
        format!("{}({}, '{}'{})", rpc, channel, self.method, args)
    }

    fn opt_str(&self, key: &str) -> Option<&str> {
        self.opts.get(key).and_then(Value::as_str)
    }

    /// Vimscript defining this trigger on `channel`.
    pub fn definition(&self, channel: i64, plugin: &str) -> String {
        match self.kind {
            RpcKind::Command => {
                let nargs = self.opt_str("nargs").unwrap_or("0");
                let bang = self.opts.contains_key("bang");
                let mut args = String::new();
                if nargs != "0" {
                    args.push_str(", <f-args>");
                }
                if bang {
                    args.push_str(", '<bang>' ==# '!'");
                }
                format!(
                    "command! -nargs={}{} {} call {}",
                    nargs,
                    if bang { " -bang" } else { "" },
                    self.name,
                    self.call(channel, &args)
                )
            }
            RpcKind::Function => format!(
                "function! {}(...) range\n  return {}\nendfunction",
                self.name,
                self.call(channel, ", a:000")
            ),
            RpcKind::Autocmd => format!(
                "augroup {}\n  autocmd {} {} call {}\naugroup end",
                plugin,
                self.name,
                self.opt_str("pattern").unwrap_or("*"),
                self.call(channel, "")
            ),
        }
    }

    /// Vimscript removing this trigger.
    pub fn removal(&self, plugin: &str) -> String {
        match self.kind {
            RpcKind::Command => format!("silent! delcommand {}", self.name),
            RpcKind::Function => format!("silent! delfunction! {}", self.name),
            RpcKind::Autocmd => format!(
                "silent! autocmd! {} {} {}",
                plugin,
                self.name,
                self.opt_str("pattern").unwrap_or("*")
            ),
        }
    }
}

/// A trigger currently defined in the editor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveRpcTrigger {
    pub spec: RpcHandlerSpec,
    pub channel: i64,
}

fn exec_vim(source: String) -> NvimIO<()> {
    NvimIO::write("nvim_exec2", vec![json!(source), json!({"output": false})])
}

/// Defines `specs` in the editor.
pub fn define_triggers(
    specs: Vec<RpcHandlerSpec>,
    channel: i64,
    plugin: &str,
) -> NvimIO<Vec<ActiveRpcTrigger>> {
    let source = specs
        .iter()
        .map(|spec| spec.definition(channel, plugin))
        .collect::<Vec<_>>()
        .join("\n");
    let active = specs
        .into_iter()
        .map(|spec| ActiveRpcTrigger { spec, channel })
        .collect::<Vec<_>>();
    if active.is_empty() {
        return NvimIO::pure(active);
    }
    exec_vim(source).map(move |()| active)
}

/// Removes `triggers` from the editor.
pub fn undefine_triggers(triggers: &[ActiveRpcTrigger], plugin: &str) -> NvimIO<()> {
    if triggers.is_empty() {
        return NvimIO::pure(());
    }
    let source = triggers
        .iter()
        .map(|t| t.spec.removal(plugin))
        .collect::<Vec<_>>()
        .join("\n");
    exec_vim(source)
}

/// The payload for the editor's `remote#host#RegisterPlugin`.
pub fn register_payload(host: &str, path: &str, specs: &[RpcHandlerSpec]) -> Value {
    json!([host, path, specs])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NS;
    use crate::fixtures::{Counter, basic};

    fn program(name: &str) -> Program<Counter> {
        Program::block(name.to_string(), |(x,): (i64,)| NS::<Counter, i64>::pure(x))
    }

    #[test]
    fn test_camelcase() {
        assert_eq!(camelcase("program_log"), "ProgramLog");
        assert_eq!(camelcase("my-plugin"), "MyPlugin");
        assert_eq!(camelcase("incr"), "Incr");
    }

    #[test]
    fn test_trigger_names_by_prefix() {
        let basic = basic();
        let rpc = RpcProgram::command(program("do_it"));
        assert_eq!(rpc.trigger_name(RpcKind::Command, &basic), "TstDoIt");
        let full = rpc.clone().prefix(PrefixStyle::Full);
        assert_eq!(full.trigger_name(RpcKind::Command, &basic), "TestPluginDoIt");
        let plain = rpc.prefix(PrefixStyle::Plain);
        assert_eq!(plain.trigger_name(RpcKind::Command, &basic), "DoIt");
    }

    #[test]
    fn test_command_definition() {
        let rpc = RpcProgram::command(program("incr")).sync();
        let specs = rpc.specs(&basic());
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].method, "command:incr");
        assert_eq!(
            specs[0].definition(3, "test_plugin"),
            "command! -nargs=1 TstIncr call rpcrequest(3, 'command:incr', <f-args>)"
        );
        assert_eq!(specs[0].removal("test_plugin"), "silent! delcommand TstIncr");
    }

    #[test]
    fn test_bang_is_not_counted_in_nargs() {
        let program = Program::<Counter>::block("force", |(_b,): (bool,)| NS::<Counter, ()>::pure(()));
        let spec = RpcProgram::command(program).bang().specs(&basic()).remove(0);
        assert_eq!(spec.opts["nargs"], json!("0"));
        assert_eq!(
            spec.definition(1, "p"),
            "command! -nargs=0 -bang TstForce call rpcnotify(1, 'command:force', '<bang>' ==# '!')"
        );
    }

    #[test]
    fn test_function_and_autocmd_definitions() {
        let rpc = RpcProgram::function(program("query")).also(RpcMethod::autocmd("*.rs"));
        let specs = rpc.specs(&basic());
        assert_eq!(specs[0].method, "function:query");
        assert!(specs[0].definition(2, "p").contains("return rpcrequest(2, 'function:query', a:000)"));
        assert_eq!(specs[1].name, "Query");
        assert_eq!(
            specs[1].definition(2, "p"),
            "augroup p\n  autocmd Query *.rs call rpcnotify(2, 'autocmd:query')\naugroup end"
        );
    }

    #[test]
    fn test_spec_json_shape() {
        let spec = RpcProgram::function(program("query")).specs(&basic()).remove(0);
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["type"], json!("function"));
        assert_eq!(value["sync"], json!(true));
        assert_eq!(value["prefix"], json!("short"));
    }
}
