//! Patching nested JSON state by path.
//!
//! A query is a dotted path resolved left to right. A segment of the form
//! `items(name=foo)` selects the element of the array `items` whose `name`
//! attribute is `foo`. The patch data is deep-merged into the value the
//! path points to: objects merge key by key, anything else is replaced.
//!
//! ```text
//! {"patch":{"query":"a.b.items(name=foo).value","data":{"value":42}}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{RibosomeError, RibosomeResult};

/// The request body of the state update programs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateQuery {
    pub patch: Patch,
}

/// A path and the data to merge at it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub query: String,
    pub data: Value,
}

/// One step of a query path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Field(String),
    Select {
        field: String,
        key: String,
        value: String,
    },
}

impl Segment {
    fn parse(raw: &str) -> RibosomeResult<Self> {
        let Some(open) = raw.find('(') else {
            return Ok(Segment::Field(raw.to_string()));
        };
        let predicate = raw[open + 1..]
            .strip_suffix(')')
            .ok_or_else(|| invalid(raw, "unclosed predicate"))?;
        let (key, value) = predicate
            .split_once('=')
            .ok_or_else(|| invalid(raw, "predicate must be key=value"))?;
        Ok(Segment::Select {
            field: raw[..open].to_string(),
            key: key.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn invalid(segment: &str, reason: &str) -> RibosomeError {
    RibosomeError::Decode(format!("invalid query segment `{}`: {}", segment, reason))
}

/// Splits a query on dots outside parentheses.
pub fn parse_query(query: &str) -> RibosomeResult<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in query.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            '.' if depth == 0 => {
                segments.push(&query[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    segments.push(&query[start..]);
    segments
        .into_iter()
        .filter(|s| !s.is_empty())
        .map(Segment::parse)
        .collect()
}

fn matches(element: &Value, key: &str, expected: &str) -> bool {
    match element.get(key) {
        Some(Value::String(s)) => s == expected,
        Some(other) => other.to_string() == expected,
        None => false,
    }
}

fn step_mut<'a>(target: &'a mut Value, segment: &Segment) -> RibosomeResult<&'a mut Value> {
    match segment {
        Segment::Field(name) => target
            .get_mut(name.as_str())
            .ok_or_else(|| RibosomeError::Prog(format!("no field `{}` in state", name))),
        Segment::Select { field, key, value } => {
            let items = target
                .get_mut(field.as_str())
                .and_then(Value::as_array_mut)
                .ok_or_else(|| RibosomeError::Prog(format!("`{}` is not a list", field)))?;
            items
                .iter_mut()
                .find(|item| matches(item, key, value))
                .ok_or_else(|| {
                    RibosomeError::Prog(format!("no element of `{}` with {}={}", field, key, value))
                })
        }
    }
}

fn step<'a>(target: &'a Value, segment: &Segment) -> Option<&'a Value> {
    match segment {
        Segment::Field(name) => target.get(name.as_str()),
        Segment::Select { field, key, value } => target
            .get(field.as_str())?
            .as_array()?
            .iter()
            .find(|item| matches(item, key, value)),
    }
}

/// Merges `data` into `target`: objects key by key, anything else replaced.
pub fn deep_merge(target: &mut Value, data: Value) {
    match (target, data) {
        (Value::Object(existing), Value::Object(incoming)) => {
            for (key, value) in incoming {
                match existing.get_mut(&key) {
                    Some(slot) => deep_merge(slot, value),
                    None => {
                        existing.insert(key, value);
                    }
                }
            }
        }
        (slot, data) => *slot = data,
    }
}

/// Returns the value `query` points to.
pub fn fetch<'a>(target: &'a Value, query: &str) -> RibosomeResult<Option<&'a Value>> {
    let segments = parse_query(query)?;
    Ok(segments
        .iter()
        .try_fold(target, |node, segment| step(node, segment)))
}

impl StateQuery {
    pub fn new(query: impl Into<String>, data: Value) -> Self {
        Self {
            patch: Patch {
                query: query.into(),
                data,
            },
        }
    }

    /// Merges the patch data into `target` at the query path.
    pub fn apply(self, target: &mut Value) -> RibosomeResult<()> {
        let segments = parse_query(&self.patch.query)?;
        let mut node = target;
        for segment in &segments {
            node = step_mut(node, segment)?;
        }
        deep_merge(node, self.patch.data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_parse_query() {
        let segments = parse_query("a.b.items(name=foo.bar).value").unwrap();
        assert_eq!(segments.len(), 4);
        assert_eq!(
            segments[2],
            Segment::Select {
                field: "items".to_string(),
                key: "name".to_string(),
                value: "foo.bar".to_string(),
            }
        );
        assert!(parse_query("items(name").is_err());
        assert!(parse_query("").unwrap().is_empty());
    }

    #[test]
    fn test_apply_selects_element() {
        let mut state = json!({"d": {"items": [{"name": "first", "value": 4}, {"name": "second", "value": 7}]}});
        StateQuery::new("d.items(name=second)", json!({"value": 21}))
            .apply(&mut state)
            .unwrap();
        assert_eq!(state["d"]["items"][0]["value"], json!(4));
        assert_eq!(state["d"]["items"][1], json!({"name": "second", "value": 21}));
    }

    #[test]
    fn test_apply_replaces_scalars_and_root() {
        let mut state = json!({"a": 1, "b": {"c": 2}});
        StateQuery::new("a", json!("x")).apply(&mut state).unwrap();
        StateQuery::new("", json!({"b": {"d": 3}})).apply(&mut state).unwrap();
        assert_eq!(state, json!({"a": "x", "b": {"c": 2, "d": 3}}));
    }

    #[test]
    fn test_missing_path_is_error() {
        let mut state = json!({"a": []});
        assert!(StateQuery::new("x.y", json!(1)).apply(&mut state).is_err());
        assert!(StateQuery::new("a(id=1)", json!(1)).apply(&mut state).is_err());
    }

    #[test]
    fn test_query_decodes_from_wire_format() {
        let query: StateQuery =
            serde_json::from_str(r#"{"patch":{"query":"a.b","data":{"value":42}}}"#).unwrap();
        assert_eq!(query.patch.query, "a.b");
        assert_eq!(query.patch.data, json!({"value": 42}));
    }

    proptest! {
        #[test]
        fn prop_fetch_after_patch_is_merge(
            original in prop::collection::btree_map("[a-e]", 0i64..100, 0..5),
            patch in prop::collection::btree_map("[a-e]", 0i64..100, 0..5),
        ) {
            let mut state = json!({"outer": {"inner": original.clone()}});
            StateQuery::new("outer.inner", json!(patch.clone())).apply(&mut state).unwrap();

            let mut expected = original;
            expected.extend(patch);
            let fetched = fetch(&state, "outer.inner").unwrap().cloned();
            prop_assert_eq!(fetched, Some(json!(expected)));
        }
    }
}
