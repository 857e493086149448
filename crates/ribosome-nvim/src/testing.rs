//! An in-memory editor for tests.
//!
//! `RecordingApi` records every request and answers the handful of API
//! calls the runtime itself makes. Anything else can be scripted with
//! [`RecordingApi::on`].

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

use crate::{NvimApi, NvimError, NvimResult};

type MethodHandler = Box<dyn Fn(&[Value]) -> NvimResult<Value> + Send + Sync>;

/// Records requests and serves variables from a table.
pub struct RecordingApi {
    channel: i64,
    requests: Mutex<Vec<(String, Vec<Value>)>>,
    vars: Mutex<HashMap<String, Value>>,
    handlers: HashMap<String, MethodHandler>,
}

impl RecordingApi {
    pub fn new() -> Self {
        Self {
            channel: 1,
            requests: Mutex::new(Vec::new()),
            vars: Mutex::new(HashMap::new()),
            handlers: HashMap::new(),
        }
    }

    /// Presets a global variable (`g:name`).
    pub fn with_var(self, name: &str, value: Value) -> Self {
        if let Ok(mut vars) = self.vars.lock() {
            vars.insert(name.to_string(), value);
        }
        self
    }

    /// Answers `method` with `handler` instead of the built-in behavior.
    pub fn on<F>(mut self, method: &str, handler: F) -> Self
    where
        F: Fn(&[Value]) -> NvimResult<Value> + Send + Sync + 'static,
    {
        self.handlers.insert(method.to_string(), Box::new(handler));
        self
    }

    /// Returns every request seen so far, in order.
    pub fn requests(&self) -> Vec<(String, Vec<Value>)> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Returns the ex commands sent through `nvim_command`.
    pub fn commands(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter(|(method, _)| method == "nvim_command")
            .filter_map(|(_, args)| args.first().and_then(Value::as_str).map(str::to_string))
            .collect()
    }

    /// Returns a variable as currently stored.
    pub fn var(&self, name: &str) -> Option<Value> {
        self.vars.lock().ok().and_then(|vars| vars.get(name).cloned())
    }

    fn builtin(&self, method: &str, args: &[Value]) -> NvimResult<Value> {
        let name = args.first().and_then(Value::as_str).unwrap_or_default();
        match method {
            "nvim_get_var" => self
                .var(name)
                .ok_or_else(|| NvimError::request(method, format!("Key not found: {}", name))),
            "nvim_set_var" => {
                let value = args.get(1).cloned().unwrap_or(Value::Null);
                if let Ok(mut vars) = self.vars.lock() {
                    vars.insert(name.to_string(), value);
                }
                Ok(Value::Null)
            }
            "nvim_get_option" => Ok(self.var(&format!("&{}", name)).unwrap_or(Value::Null)),
            "nvim_get_api_info" => Ok(Value::Array(vec![
                Value::from(self.channel),
                Value::Object(Default::default()),
            ])),
            _ => Ok(Value::Null),
        }
    }
}

impl Default for RecordingApi {
    fn default() -> Self {
        Self::new()
    }
}

impl NvimApi for RecordingApi {
    fn request(&self, method: &str, args: Vec<Value>) -> NvimResult<Value> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push((method.to_string(), args.clone()));
        }
        match self.handlers.get(method) {
            Some(handler) => handler(&args),
            None => self.builtin(method, &args),
        }
    }

    fn notify(&self, method: &str, args: Vec<Value>) -> NvimResult<()> {
        self.request(method, args).map(|_| ())
    }

    fn channel_id(&self) -> i64 {
        self.channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_vars_roundtrip_through_requests() {
        let api = RecordingApi::new();
        api.request("nvim_set_var", vec![json!("x"), json!(3)]).unwrap();
        assert_eq!(api.request("nvim_get_var", vec![json!("x")]).unwrap(), json!(3));
        assert!(api.request("nvim_get_var", vec![json!("y")]).is_err());
        assert_eq!(api.requests().len(), 3);
    }

    #[test]
    fn test_scripted_handler() {
        let api = RecordingApi::new().on("nvim_eval", |_| Ok(json!("evaluated")));
        assert_eq!(api.request("nvim_eval", vec![]).unwrap(), json!("evaluated"));
    }
}
