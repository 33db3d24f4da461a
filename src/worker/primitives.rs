//! Interpreter-side primitives for action scripts.
//!
//! Registered into the Lua VM before any action script loads:
//!
//! - `action.register{...}` — declares an action (name, metadata, handler).
//!   Declarations collect into a host-side list the manager drains after
//!   each script loads.
//! - `log.info/warn/error(msg)` — leveled output routed to the current
//!   invocation's log sink (`log.debug` goes to the host log only — DEBUG is
//!   not a wire level).
//! - `print(...)` — redirected to the same sink, one INFO entry per
//!   non-empty line, mirroring Lua's `print` semantics (`tostring` each
//!   argument, join with tabs).
//!
//! Outside an invocation the sink is empty and output lands in the host log
//! under the `action` target, so top-level script output is not lost.
//!
//! # Usage in an action script
//!
//! ```lua
//! action.register({
//!     name = "clean_cache",
//!     description = "Remove stale cache entries",
//!     group = "maintenance",
//!     params = { days = { type = "int", default = 7 } },
//!     handler = function(params)
//!         log.info("removing entries older than " .. params.days .. " days")
//!         return { files_deleted = 42 }
//!     end,
//! })
//! ```

// Rust guideline compliant 2026-02

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use mlua::{Lua, LuaSerdeExt, MultiValue, RegistryKey, Table, Value};

use crate::protocol::{LogLevel, ParameterSpec};

/// Per-invocation log destination.
pub type LogSink = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Slot holding the sink of the invocation currently executing.
///
/// Only the executor thread installs and removes sinks, so there is never a
/// concurrent swap; the mutex exists because the Lua callbacks are `'static`
/// closures that need shared ownership.
pub type SharedLogSink = Arc<Mutex<Option<LogSink>>>;

/// An action declared by a script via `action.register`.
pub struct DeclaredAction {
    pub name: String,
    pub description: String,
    pub group: String,
    pub parameters: BTreeMap<String, ParameterSpec>,
    /// Handler function, stashed in the Lua registry.
    pub handler: RegistryKey,
}

impl std::fmt::Debug for DeclaredAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeclaredAction")
            .field("name", &self.name)
            .field("group", &self.group)
            .field("parameters", &self.parameters.len())
            .finish_non_exhaustive()
    }
}

/// Declarations collected while a script loads.
pub type PendingActions = Arc<Mutex<Vec<DeclaredAction>>>;

/// Route one message to the active sink, or to the host log when no
/// invocation is running. Multi-line messages become one entry per
/// non-empty line.
pub fn emit(sink: &SharedLogSink, level: LogLevel, message: &str) {
    let guard = sink.lock().ok();
    let active = guard.as_ref().and_then(|g| g.as_ref());
    for line in message.lines().filter(|l| !l.trim().is_empty()) {
        match active {
            Some(s) => s(level, line),
            None => match level {
                LogLevel::Info => log::info!(target: "action", "{line}"),
                LogLevel::Warn => log::warn!(target: "action", "{line}"),
                LogLevel::Error => log::error!(target: "action", "{line}"),
            },
        }
    }
}

/// Register every primitive table into the VM.
pub fn register_all(lua: &Lua, sink: SharedLogSink, pending: PendingActions) -> Result<()> {
    register_print(lua, Arc::clone(&sink))?;
    register_log(lua, sink)?;
    register_action_api(lua, pending)?;
    Ok(())
}

/// Redirect the global `print` into the invocation log sink.
fn register_print(lua: &Lua, sink: SharedLogSink) -> Result<()> {
    let print_fn = lua
        .create_function(move |lua, args: MultiValue| {
            // Lua's print applies tostring to each argument and joins with tabs.
            let tostring: mlua::Function = lua.globals().get("tostring")?;
            let mut parts = Vec::with_capacity(args.len());
            for value in args {
                parts.push(tostring.call::<String>(value)?);
            }
            emit(&sink, LogLevel::Info, &parts.join("\t"));
            Ok(())
        })
        .map_err(|e| anyhow!("failed to create print redirect: {e}"))?;
    lua.globals()
        .set("print", print_fn)
        .map_err(|e| anyhow!("failed to install print redirect: {e}"))?;
    Ok(())
}

/// Register the `log` table with leveled logging functions.
fn register_log(lua: &Lua, sink: SharedLogSink) -> Result<()> {
    let log_table = lua
        .create_table()
        .map_err(|e| anyhow!("failed to create log table: {e}"))?;

    for (method, level) in [
        ("info", LogLevel::Info),
        ("warn", LogLevel::Warn),
        ("error", LogLevel::Error),
    ] {
        let sink = Arc::clone(&sink);
        let log_fn = lua
            .create_function(move |_, msg: String| {
                emit(&sink, level, &msg);
                Ok(())
            })
            .map_err(|e| anyhow!("failed to create log.{method}: {e}"))?;
        log_table
            .set(method, log_fn)
            .map_err(|e| anyhow!("failed to set log.{method}: {e}"))?;
    }

    // log.debug(msg) — host-side diagnostics only.
    let debug_fn = lua
        .create_function(|_, msg: String| {
            log::debug!(target: "action", "{msg}");
            Ok(())
        })
        .map_err(|e| anyhow!("failed to create log.debug: {e}"))?;
    log_table
        .set("debug", debug_fn)
        .map_err(|e| anyhow!("failed to set log.debug: {e}"))?;

    lua.globals()
        .set("log", log_table)
        .map_err(|e| anyhow!("failed to register log table: {e}"))?;
    Ok(())
}

/// Register the `action` table with the `register` declaration primitive.
fn register_action_api(lua: &Lua, pending: PendingActions) -> Result<()> {
    let action_table = lua
        .create_table()
        .map_err(|e| anyhow!("failed to create action table: {e}"))?;

    let register_fn = lua
        .create_function(move |lua, spec: Table| {
            let name: String = spec.get("name").map_err(|_| {
                mlua::Error::external("action.register: 'name' must be a string")
            })?;
            if name.trim().is_empty() {
                return Err(mlua::Error::external("action.register: 'name' is empty"));
            }
            let handler: mlua::Function = spec.get("handler").map_err(|_| {
                mlua::Error::external(format!(
                    "action.register: '{name}' has no handler function"
                ))
            })?;
            let description: String = spec.get::<Option<String>>("description")?.unwrap_or_default();
            let group: String = spec.get::<Option<String>>("group")?.unwrap_or_default();

            let mut parameters = BTreeMap::new();
            if let Some(params) = spec.get::<Option<Table>>("params")? {
                for pair in params.pairs::<String, Value>() {
                    let (param_name, descriptor) = pair?;
                    let Value::Table(descriptor) = descriptor else {
                        return Err(mlua::Error::external(format!(
                            "action.register: param '{param_name}' of '{name}' must be a table"
                        )));
                    };
                    let kind: String = descriptor
                        .get::<Option<String>>("type")?
                        .unwrap_or_else(|| "string".to_string());
                    let default: serde_json::Value = lua
                        .from_value(descriptor.get("default")?)
                        .map_err(|e| {
                            mlua::Error::external(format!(
                                "action.register: default for '{param_name}' of '{name}' \
                                 is not JSON-serializable: {e}"
                            ))
                        })?;
                    parameters.insert(param_name, ParameterSpec { kind, default });
                }
            }

            let handler = lua.create_registry_value(handler)?;
            let mut queue = pending
                .lock()
                .map_err(|_| mlua::Error::external("declaration list poisoned"))?;
            queue.push(DeclaredAction { name, description, group, parameters, handler });
            Ok(())
        })
        .map_err(|e| anyhow!("failed to create action.register: {e}"))?;

    action_table
        .set("register", register_fn)
        .map_err(|e| anyhow!("failed to set action.register: {e}"))?;
    lua.globals()
        .set("action", action_table)
        .map_err(|e| anyhow!("failed to register action table: {e}"))?;
    Ok(())
}

/// Convert a JSON value to a Lua value, mapping JSON null to Lua nil.
///
/// Integer-valued numbers become Lua integers, everything else numeric
/// becomes a float. Object keys with null values are skipped entirely so
/// they read as absent (`nil`) from Lua, matching Lua convention.
pub fn json_to_lua(lua: &Lua, v: &serde_json::Value) -> mlua::Result<Value> {
    match v {
        serde_json::Value::Null => Ok(Value::Nil),
        serde_json::Value::Bool(b) => Ok(Value::Boolean(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Integer(i))
            } else if let Some(f) = n.as_f64() {
                Ok(Value::Number(f))
            } else {
                Ok(Value::Nil)
            }
        }
        serde_json::Value::String(s) => lua.create_string(s).map(Value::String),
        serde_json::Value::Array(arr) => {
            let table = lua.create_table()?;
            for (i, item) in arr.iter().enumerate() {
                table.set(i + 1, json_to_lua(lua, item)?)?;
            }
            Ok(Value::Table(table))
        }
        serde_json::Value::Object(map) => {
            let table = lua.create_table()?;
            for (key, val) in map {
                if !val.is_null() {
                    table.set(lua.create_string(key)?, json_to_lua(lua, val)?)?;
                }
            }
            Ok(Value::Table(table))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_vm() -> (Lua, SharedLogSink, PendingActions, Arc<Mutex<Vec<(LogLevel, String)>>>) {
        let lua = Lua::new();
        let sink: SharedLogSink = Arc::new(Mutex::new(None));
        let pending: PendingActions = Arc::new(Mutex::new(Vec::new()));
        register_all(&lua, Arc::clone(&sink), Arc::clone(&pending)).expect("register primitives");

        let captured = Arc::new(Mutex::new(Vec::new()));
        let captured_in = Arc::clone(&captured);
        *sink.lock().expect("sink lock") = Some(Arc::new(move |level, line: &str| {
            captured_in.lock().expect("captured lock").push((level, line.to_string()));
        }));
        (lua, sink, pending, captured)
    }

    #[test]
    fn print_splits_lines_and_joins_args_with_tabs() {
        let (lua, _sink, _pending, captured) = test_vm();
        lua.load(r#"print("a", 1, true) print("x\n\ny")"#)
            .exec()
            .expect("print should run");

        let lines = captured.lock().expect("captured lock").clone();
        assert_eq!(
            lines,
            vec![
                (LogLevel::Info, "a\t1\ttrue".to_string()),
                (LogLevel::Info, "x".to_string()),
                (LogLevel::Info, "y".to_string()),
            ]
        );
    }

    #[test]
    fn log_table_routes_levels() {
        let (lua, _sink, _pending, captured) = test_vm();
        lua.load(r#"log.info("i") log.warn("w") log.error("e")"#)
            .exec()
            .expect("log calls should run");

        let lines = captured.lock().expect("captured lock").clone();
        assert_eq!(
            lines,
            vec![
                (LogLevel::Info, "i".to_string()),
                (LogLevel::Warn, "w".to_string()),
                (LogLevel::Error, "e".to_string()),
            ]
        );
    }

    #[test]
    fn register_collects_declaration() {
        let (lua, _sink, pending, _captured) = test_vm();
        lua.load(
            r#"
            action.register({
                name = "clean_cache",
                description = "Remove stale cache entries",
                group = "maintenance",
                params = { days = { type = "int", default = 7 } },
                handler = function(params) return params.days end,
            })
            "#,
        )
        .exec()
        .expect("registration should succeed");

        let declared = pending.lock().expect("pending lock");
        assert_eq!(declared.len(), 1);
        let action = &declared[0];
        assert_eq!(action.name, "clean_cache");
        assert_eq!(action.group, "maintenance");
        let days = action.parameters.get("days").expect("days parameter");
        assert_eq!(days.kind, "int");
        assert_eq!(days.default, serde_json::json!(7));
    }

    #[test]
    fn register_rejects_missing_handler() {
        let (lua, _sink, pending, _captured) = test_vm();
        let err = lua
            .load(r#"action.register({ name = "broken" })"#)
            .exec()
            .expect_err("registration without handler should fail");
        assert!(err.to_string().contains("no handler function"));
        assert!(pending.lock().expect("pending lock").is_empty());
    }

    #[test]
    fn json_to_lua_preserves_integer_vs_float() {
        let lua = Lua::new();
        let value = json_to_lua(&lua, &serde_json::json!({"i": 3, "f": 1.5}))
            .expect("convert");
        let Value::Table(table) = value else { panic!("expected table") };
        assert!(matches!(table.get::<Value>("i").expect("i"), Value::Integer(3)));
        let Value::Number(f) = table.get::<Value>("f").expect("f") else {
            panic!("expected float")
        };
        assert!((f - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn json_to_lua_null_reads_as_nil() {
        let lua = Lua::new();
        let value = json_to_lua(&lua, &serde_json::json!({"gone": null}))
            .expect("convert");
        let Value::Table(table) = value else { panic!("expected table") };
        assert!(matches!(table.get::<Value>("gone").expect("gone"), Value::Nil));
    }

    #[test]
    fn json_to_lua_arrays_are_one_indexed() {
        let lua = Lua::new();
        let value = json_to_lua(&lua, &serde_json::json!([10, 20])).expect("convert");
        let Value::Table(table) = value else { panic!("expected table") };
        assert!(matches!(table.get::<Value>(1).expect("first"), Value::Integer(10)));
        assert!(matches!(table.get::<Value>(2).expect("second"), Value::Integer(20)));
    }
}
