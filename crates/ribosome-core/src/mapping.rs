//! Key mappings bound to programs.
//!
//! ## Learning: Indirection Through an Id
//!
//! The editor cannot hold a reference to a Rust closure, so activating a
//! mapping allocates a UUID, stores the program under it in the plugin
//! state and defines an editor mapping that calls the internal `mapping`
//! function with that UUID. The key sequence is passed along for logging.
//!
//! Key sequences may be written in editor notation (`<C-s>`, `gg`) or in
//! the `ctrl+s` style familiar from other editors; both normalize to editor
//! notation.

use std::fmt;

use ribosome_nvim::NvimIO;
use serde::{Deserialize, Serialize};

use crate::prog::Prog;
use crate::rpc::camelcase;
use crate::{PluginData, RibosomeError};

/// Keyboard modifiers in a `ctrl+shift+x` style binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Modifiers {
    pub ctrl: bool,
    pub alt: bool,
    pub shift: bool,
    pub meta: bool,
}

impl Modifiers {
    /// Parses modifiers from a string like "ctrl+shift".
    pub fn parse(s: &str) -> Self {
        let mut mods = Modifiers::default();
        for part in s.to_lowercase().split('+') {
            match part {
                "ctrl" | "control" | "c" => mods.ctrl = true,
                "alt" | "option" | "m" | "a" => mods.alt = true,
                "shift" | "s" => mods.shift = true,
                "meta" | "cmd" | "d" => mods.meta = true,
                _ => {}
            }
        }
        mods
    }

    pub fn is_empty(&self) -> bool {
        !self.ctrl && !self.alt && !self.shift && !self.meta
    }

    fn notation(&self) -> String {
        let mut out = String::new();
        if self.ctrl {
            out.push_str("C-");
        }
        if self.alt {
            out.push_str("M-");
        }
        if self.shift {
            out.push_str("S-");
        }
        if self.meta {
            out.push_str("D-");
        }
        out
    }
}

/// A single key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    Char(char),
    Named(&'static str),
    F(u8),
}

impl Key {
    /// Parses a key name.
    pub fn parse(s: &str) -> Option<Self> {
        let lower = s.to_lowercase();
        let named = match lower.as_str() {
            "enter" | "return" | "cr" => "CR",
            "tab" => "Tab",
            "backspace" | "bs" => "BS",
            "delete" | "del" => "Del",
            "escape" | "esc" => "Esc",
            "up" => "Up",
            "down" => "Down",
            "left" => "Left",
            "right" => "Right",
            "home" => "Home",
            "end" => "End",
            "pageup" | "pgup" => "PageUp",
            "pagedown" | "pgdn" => "PageDown",
            "insert" | "ins" => "Insert",
            "space" => "Space",
            "leader" => "Leader",
            _ if lower.starts_with('f') && lower.len() > 1 && lower.len() <= 3 => {
                return lower[1..].parse().ok().map(Key::F);
            }
            _ => {
                let mut chars = s.chars();
                return match (chars.next(), chars.next()) {
                    (Some(c), None) => Some(Key::Char(c)),
                    _ => None,
                };
            }
        };
        Some(Key::Named(named))
    }
}

/// A key with modifiers, e.g. `ctrl+s`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyPress {
    pub key: Key,
    pub modifiers: Modifiers,
}

impl KeyPress {
    /// Parses a binding string like "ctrl+s".
    pub fn parse(s: &str) -> Option<Self> {
        let (mods, key) = match s.rsplit_once('+') {
            Some((mods, key)) if !key.is_empty() => (mods, key),
            _ => ("", s),
        };
        Some(Self {
            key: Key::parse(key)?,
            modifiers: Modifiers::parse(mods),
        })
    }

    /// Editor key notation, e.g. `<C-s>`.
    pub fn notation(&self) -> String {
        match (&self.key, self.modifiers.is_empty()) {
            (Key::Char(c), true) => c.to_string(),
            (Key::Char(c), false) => format!("<{}{}>", self.modifiers.notation(), c),
            (Key::Named(name), _) => format!("<{}{}>", self.modifiers.notation(), name),
            (Key::F(n), _) => format!("<{}F{}>", self.modifiers.notation(), n),
        }
    }
}

/// Normalizes a key sequence to editor notation.
///
/// Whitespace separates keys written as `ctrl+s`; anything else passes
/// through unchanged.
pub fn normalize_keys(keys: &str) -> String {
    keys.split_whitespace()
        .map(|part| {
            if part.starts_with('<') || (part.len() > 1 && !part.contains('+')) {
                part.to_string()
            } else {
                KeyPress::parse(part)
                    .map(|kp| kp.notation())
                    .unwrap_or_else(|| part.to_string())
            }
        })
        .collect()
}

/// A key mapping a component declares.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mapping {
    /// Identifies the mapping within the plugin.
    pub ident: String,
    /// Key sequence in editor notation.
    pub keys: String,
    /// Mode characters, e.g. `n`, `v`, `i`.
    pub modes: Vec<String>,
    /// Whether the mapping is local to the current buffer.
    pub buffer: bool,
}

impl Mapping {
    /// A normal-mode mapping.
    pub fn new(ident: impl Into<String>, keys: &str) -> Self {
        Self {
            ident: ident.into(),
            keys: normalize_keys(keys),
            modes: vec!["n".to_string()],
            buffer: false,
        }
    }

    pub fn modes(mut self, modes: &[&str]) -> Self {
        self.modes = modes.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn buffer(mut self) -> Self {
        self.buffer = true;
        self
    }

    /// Editor commands defining this mapping to call back with `uuid`.
    pub fn definitions(&self, plugin: &str, uuid: &str) -> Vec<String> {
        let literal = self.keys.replace('<', "<lt>").replace('\'', "''");
        let buffer = if self.buffer { "<buffer> " } else { "" };
        self.modes
            .iter()
            .map(|mode| {
                format!(
                    "{}noremap {}<silent> {} :call {}Mapping('{}', '{}')<cr>",
                    mode,
                    buffer,
                    self.keys,
                    camelcase(plugin),
                    uuid,
                    literal
                )
            })
            .collect()
    }
}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.ident, self.keys)
    }
}

/// Activates the mapping `ident` of an active component.
///
/// Returns the UUID the editor mapping calls back with.
pub fn activate_mapping<D: PluginData>(ident: impl Into<String>) -> Prog<D, String> {
    let ident = ident.into();
    Prog::access("activate_mapping", move |state, nvim| {
        let (mapping, program) = state
            .find_mapping(&ident)
            .ok_or_else(|| RibosomeError::UnknownMapping(ident.clone()))?;
        let uuid = uuid::Uuid::new_v4().to_string();
        let commands = mapping.definitions(&state.basic().name, &uuid);
        state.insert_active_mapping(uuid.clone(), mapping.clone(), program);
        tracing::info!(mapping = %mapping, %uuid, "activating mapping");
        commands
            .into_iter()
            .fold(NvimIO::pure(()), |io, cmd| io.then(move || NvimIO::command(cmd)))
            .run(nvim)?;
        Ok(uuid)
    })
}
