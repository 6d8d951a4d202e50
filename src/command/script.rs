//! Embedded script evaluation (§4.F).
//!
//! No example repo in the pack embeds a scripting engine for this kind of
//! per-command hook, so this reaches for `rhai`, the ecosystem-standard
//! embeddable engine for Rust hosts (see DESIGN.md Open Question #4). The
//! `Evaluator` trait is the narrow interface the spec calls for (§1
//! non-goals: "script evaluation is an embedded expression engine invoked
//! through a narrow interface"); `RhaiEvaluator` is the one implementation.

use std::collections::HashMap;
use std::sync::Mutex;

use rhai::{Dynamic, Engine, Scope, AST};

use crate::error::{Error, Result};

/// A value crossing the script boundary. `cmdFunc` output contract (§4.F):
/// `None` → null; `List` of `Tuple(tagId, value[, receivedTime])` →
/// responses; anything else is a script error at the call site.
#[derive(Debug, Clone)]
pub enum ScriptValue {
    None,
    Bool(bool),
    Str(String),
    Int(i64),
    List(Vec<ScriptValue>),
    Tuple(Vec<ScriptValue>),
    Dict(HashMap<String, ScriptValue>),
    Throwable(String),
    Other(String),
}

impl ScriptValue {
    pub fn is_none(&self) -> bool {
        matches!(self, ScriptValue::None)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScriptValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ScriptValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ScriptValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    fn from_dynamic(d: Dynamic) -> Self {
        if d.is_unit() {
            return ScriptValue::None;
        }
        if let Some(b) = d.clone().try_cast::<bool>() {
            return ScriptValue::Bool(b);
        }
        if let Some(s) = d.clone().try_cast::<rhai::ImmutableString>() {
            return ScriptValue::Str(s.to_string());
        }
        if let Some(i) = d.clone().try_cast::<i64>() {
            return ScriptValue::Int(i);
        }
        if let Some(arr) = d.clone().try_cast::<rhai::Array>() {
            return ScriptValue::List(arr.into_iter().map(ScriptValue::from_dynamic).collect());
        }
        if let Some(map) = d.clone().try_cast::<rhai::Map>() {
            return ScriptValue::Dict(
                map.into_iter().map(|(k, v)| (k.to_string(), ScriptValue::from_dynamic(v))).collect(),
            );
        }
        ScriptValue::Other(format!("{d:?}"))
    }

    fn into_dynamic(self) -> Dynamic {
        match self {
            ScriptValue::None => Dynamic::UNIT,
            ScriptValue::Bool(b) => b.into(),
            ScriptValue::Str(s) => s.into(),
            ScriptValue::Int(i) => i.into(),
            ScriptValue::List(items) => {
                Dynamic::from_array(items.into_iter().map(ScriptValue::into_dynamic).collect())
            }
            ScriptValue::Tuple(items) => {
                Dynamic::from_array(items.into_iter().map(ScriptValue::into_dynamic).collect())
            }
            ScriptValue::Dict(map) => {
                let mut m = rhai::Map::new();
                for (k, v) in map {
                    m.insert(k.into(), v.into_dynamic());
                }
                Dynamic::from_map(m)
            }
            ScriptValue::Throwable(msg) => msg.into(),
            ScriptValue::Other(s) => s.into(),
        }
    }
}

/// Narrow embedding interface the command runtime calls through (§1).
pub trait Evaluator: Send + Sync {
    /// Compile `source` under `script_id`, suffixed by the caller with the
    /// owning device id to prevent cross-device collisions (§4.F).
    fn compile(&self, script_id: &str, source: &str) -> Result<()>;

    /// Whether `script_id` defines a function named `fn_name` taking
    /// `arity` positional arguments.
    fn has_fn(&self, script_id: &str, fn_name: &str, arity: usize) -> bool;

    /// Invoke `fn_name` within `script_id` with `args`.
    fn call(&self, script_id: &str, fn_name: &str, args: Vec<ScriptValue>) -> Result<ScriptValue>;
}

pub struct RhaiEvaluator {
    engine: Engine,
    compiled: Mutex<HashMap<String, AST>>,
}

impl Default for RhaiEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl RhaiEvaluator {
    pub fn new() -> Self {
        Self {
            engine: Engine::new(),
            compiled: Mutex::new(HashMap::new()),
        }
    }
}

impl Evaluator for RhaiEvaluator {
    fn compile(&self, script_id: &str, source: &str) -> Result<()> {
        let ast = self
            .engine
            .compile(source)
            .map_err(|e| Error::Compile(format!("{script_id}: {e}")))?;
        self.compiled.lock().unwrap().insert(script_id.to_string(), ast);
        Ok(())
    }

    fn has_fn(&self, script_id: &str, fn_name: &str, arity: usize) -> bool {
        let compiled = self.compiled.lock().unwrap();
        match compiled.get(script_id) {
            Some(ast) => ast
                .iter_functions()
                .any(|f| f.name == fn_name && f.params.len() == arity),
            None => false,
        }
    }

    fn call(&self, script_id: &str, fn_name: &str, args: Vec<ScriptValue>) -> Result<ScriptValue> {
        let compiled = self.compiled.lock().unwrap();
        let ast = compiled
            .get(script_id)
            .ok_or_else(|| Error::Script(format!("script {script_id:?} not compiled")))?;
        let mut scope = Scope::new();
        let dyn_args: Vec<Dynamic> = args.into_iter().map(ScriptValue::into_dynamic).collect();
        self.engine
            .call_fn::<Dynamic>(&mut scope, ast, fn_name, dyn_args)
            .map(ScriptValue::from_dynamic)
            .map_err(|e| Error::Script(format!("{script_id}::{fn_name}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_and_call_simple_function() {
        let ev = RhaiEvaluator::new();
        ev.compile("d1#req", "fn req() { \"AA\" }").unwrap();
        let result = ev.call("d1#req", "req", vec![]).unwrap();
        assert_eq!(result.as_str(), Some("AA"));
    }

    #[test]
    fn test_has_fn_checks_arity() {
        let ev = RhaiEvaluator::new();
        ev.compile("d1#ctl", "fn control(i, err) { i + 1 }").unwrap();
        assert!(ev.has_fn("d1#ctl", "control", 2));
        assert!(!ev.has_fn("d1#ctl", "control", 3));
    }

    #[test]
    fn test_call_missing_script_is_script_error() {
        let ev = RhaiEvaluator::new();
        assert!(ev.call("missing", "f", vec![]).is_err());
    }
}
