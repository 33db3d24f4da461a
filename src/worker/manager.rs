//! Action manager — owns the embedded Lua interpreter.
//!
//! The Lua VM is single-threaded and `!Send`, so the manager runs it on one
//! dedicated executor thread and serializes invocations through a FIFO job
//! queue (the queue discipline): callers submit a job plus a completion
//! channel and await the outcome. At any instant at most one action handler
//! is executing, and only the executor thread ever touches the VM or swaps
//! the print-capture sink.
//!
//! ```text
//! trigger task ──Job{name, params, on_log, done}──► executor thread
//!                                                     install log sink
//!                                                     marshal params → Lua
//!                                                     call handler
//!                                                     marshal result → JSON
//!                                                     remove log sink
//!              ◄────────────── Outcome ──────────────  done.send()
//! ```
//!
//! Discovery runs once at startup on the executor thread: every `*.lua`
//! file in the actions directory is loaded (sorted by file name) after the
//! primitives are registered and the directory is prepended to
//! `package.path`. A script that fails to load is logged and skipped; its
//! actions are excluded. Duplicate action names resolve to the last
//! declaration, matching the catalog's last-retained-wins rule.

// Rust guideline compliant 2026-02

use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{anyhow, Context, Result};
use mlua::{Lua, LuaSerdeExt, RegistryKey, Table};
use tokio::sync::{mpsc, oneshot};

use crate::protocol::{ExecStatus, LogLevel, ParameterSpec};

use super::primitives::{self, DeclaredAction, LogSink, PendingActions, SharedLogSink};

/// Catalog-facing metadata for one discovered action.
#[derive(Debug, Clone)]
pub struct ActionInfo {
    pub name: String,
    pub description: String,
    pub group: String,
    pub parameters: BTreeMap<String, ParameterSpec>,
}

/// Terminal outcome of one invocation.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub status: ExecStatus,
    pub result: serde_json::Value,
    pub error: String,
}

impl Outcome {
    fn success(result: serde_json::Value) -> Self {
        Self { status: ExecStatus::Success, result, error: String::new() }
    }

    fn failure(error: impl Into<String>) -> Self {
        Self {
            status: ExecStatus::Failure,
            result: serde_json::Value::Null,
            error: error.into(),
        }
    }
}

struct Job {
    name: String,
    parameters: serde_json::Map<String, serde_json::Value>,
    on_log: LogSink,
    done: oneshot::Sender<Outcome>,
}

/// Handle to the executor thread plus the discovered catalog.
pub struct ActionManager {
    jobs: mpsc::UnboundedSender<Job>,
    actions: HashMap<String, ActionInfo>,
    executor: Option<thread::JoinHandle<()>>,
}

impl std::fmt::Debug for ActionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionManager")
            .field("actions", &self.actions.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl ActionManager {
    /// Spawn the executor thread, run discovery, and wait for its result.
    ///
    /// Interpreter initialization failure is fatal; a missing or empty
    /// actions directory yields a manager with zero actions.
    pub fn start(actions_dir: &Path) -> Result<Self> {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (init_tx, init_rx) = std::sync::mpsc::channel();
        let dir = actions_dir.to_path_buf();

        let executor = thread::Builder::new()
            .name("action-executor".to_string())
            .spawn(move || executor_main(&dir, jobs_rx, &init_tx))
            .context("spawn action executor thread")?;

        let actions = init_rx
            .recv()
            .context("action executor exited during initialization")?
            .context("action discovery failed")?;

        log::info!("[worker] discovered {} action(s)", actions.len());
        Ok(Self { jobs: jobs_tx, actions, executor: Some(executor) })
    }

    /// All discovered actions, keyed by name.
    pub fn list(&self) -> &HashMap<String, ActionInfo> {
        &self.actions
    }

    /// Metadata for one action.
    pub fn get(&self, name: &str) -> Option<&ActionInfo> {
        self.actions.get(name)
    }

    /// Invoke an action and wait for its outcome.
    ///
    /// `on_log` receives every captured output line while the handler runs.
    /// Safe to call from many tasks concurrently; invocations execute one at
    /// a time in submission order.
    pub async fn invoke(
        &self,
        name: &str,
        parameters: serde_json::Map<String, serde_json::Value>,
        on_log: LogSink,
    ) -> Outcome {
        let (done_tx, done_rx) = oneshot::channel();
        let job = Job { name: name.to_string(), parameters, on_log, done: done_tx };
        if self.jobs.send(job).is_err() {
            return Outcome::failure("action executor is not running");
        }
        done_rx
            .await
            .unwrap_or_else(|_| Outcome::failure("action executor stopped during invocation"))
    }
}

impl Drop for ActionManager {
    fn drop(&mut self) {
        // Closing the job queue ends the executor loop.
        if let Some(handle) = self.executor.take() {
            drop(std::mem::replace(&mut self.jobs, mpsc::unbounded_channel().0));
            let _ = handle.join();
        }
    }
}

// ─── Executor thread ───────────────────────────────────────────────────────

type InitResult = Result<HashMap<String, ActionInfo>>;

fn executor_main(
    actions_dir: &Path,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    init: &std::sync::mpsc::Sender<InitResult>,
) {
    let lua = Lua::new();
    let sink: SharedLogSink = Arc::new(Mutex::new(None));
    let pending: PendingActions = Arc::new(Mutex::new(Vec::new()));

    if let Err(e) = primitives::register_all(&lua, Arc::clone(&sink), Arc::clone(&pending)) {
        let _ = init.send(Err(e));
        return;
    }
    if let Err(e) = prepend_package_path(&lua, actions_dir) {
        let _ = init.send(Err(e));
        return;
    }

    let (infos, handlers) = discover(&lua, actions_dir, &pending);
    let _ = init.send(Ok(infos.clone()));

    while let Some(job) = jobs.blocking_recv() {
        let outcome = run_job(&lua, &infos, &handlers, &sink, &job);
        let _ = job.done.send(outcome);
    }
    log::debug!("[worker] action executor shutting down");
}

/// Prepend the actions directory to `package.path` so scripts can
/// `require` shared modules living next to them.
fn prepend_package_path(lua: &Lua, actions_dir: &Path) -> Result<()> {
    let package: Table = lua
        .globals()
        .get("package")
        .map_err(|e| anyhow!("failed to get package table: {e}"))?;
    let current: String = package
        .get("path")
        .map_err(|e| anyhow!("failed to get package.path: {e}"))?;
    let new_path = format!(
        "{dir}/?.lua;{dir}/?/init.lua;{current}",
        dir = actions_dir.display(),
        current = current
    );
    package
        .set("path", new_path)
        .map_err(|e| anyhow!("failed to set package.path: {e}"))?;
    Ok(())
}

/// Load every `*.lua` script and collect the actions they declare.
fn discover(
    lua: &Lua,
    actions_dir: &Path,
    pending: &PendingActions,
) -> (HashMap<String, ActionInfo>, HashMap<String, RegistryKey>) {
    let mut infos = HashMap::new();
    let mut handlers = HashMap::new();

    let mut scripts: Vec<PathBuf> = match std::fs::read_dir(actions_dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "lua"))
            .collect(),
        Err(e) => {
            log::warn!(
                "[worker] cannot read actions directory {}: {e}",
                actions_dir.display()
            );
            return (infos, handlers);
        }
    };
    scripts.sort();

    for script in scripts {
        if let Err(e) = load_script(lua, &script) {
            log::warn!("[worker] skipping action script {}: {e}", script.display());
            // Discard declarations from the partially-executed script.
            if let Ok(mut queue) = pending.lock() {
                queue.clear();
            }
            continue;
        }
        let declared: Vec<DeclaredAction> = match pending.lock() {
            Ok(mut queue) => queue.drain(..).collect(),
            Err(_) => continue,
        };
        for action in declared {
            if infos.contains_key(&action.name) {
                log::warn!(
                    "[worker] duplicate action '{}' in {}; keeping the later declaration",
                    action.name,
                    script.display()
                );
            }
            log::debug!("[worker] registered action '{}' from {}", action.name, script.display());
            infos.insert(
                action.name.clone(),
                ActionInfo {
                    name: action.name.clone(),
                    description: action.description,
                    group: action.group,
                    parameters: action.parameters,
                },
            );
            handlers.insert(action.name, action.handler);
        }
    }

    (infos, handlers)
}

fn load_script(lua: &Lua, path: &Path) -> Result<()> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    lua.load(&source)
        .set_name(path.to_string_lossy())
        .exec()
        .map_err(|e| anyhow!("{e}"))?;
    Ok(())
}

/// Execute one invocation on the executor thread.
fn run_job(
    lua: &Lua,
    infos: &HashMap<String, ActionInfo>,
    handlers: &HashMap<String, RegistryKey>,
    sink: &SharedLogSink,
    job: &Job,
) -> Outcome {
    let Some(key) = handlers.get(&job.name) else {
        return Outcome::failure(format!("unknown action: {}", job.name));
    };

    // Fill declared defaults for parameters the caller omitted.
    let mut parameters = job.parameters.clone();
    if let Some(info) = infos.get(&job.name) {
        for (name, spec) in &info.parameters {
            if !parameters.contains_key(name) && !spec.default.is_null() {
                parameters.insert(name.clone(), spec.default.clone());
            }
        }
    }

    // Marshal before touching the sink; a marshalling failure makes no call
    // and produces no log output.
    let args = match primitives::json_to_lua(lua, &serde_json::Value::Object(parameters)) {
        Ok(args) => args,
        Err(e) => return Outcome::failure(format!("Marshal error: {e}")),
    };

    let handler: mlua::Function = match lua.registry_value(key) {
        Ok(f) => f,
        Err(e) => return Outcome::failure(format!("handler lookup failed: {e}")),
    };

    // Capture scope: sink installed for exactly this invocation.
    if let Ok(mut slot) = sink.lock() {
        *slot = Some(Arc::clone(&job.on_log));
    }
    let _capture_guard = scopeguard::guard(Arc::clone(sink), |s| {
        if let Ok(mut slot) = s.lock() {
            *slot = None;
        }
    });

    let called = catch_unwind(AssertUnwindSafe(|| handler.call::<mlua::Value>(args)));

    match called {
        Ok(Ok(value)) => match lua.from_value::<serde_json::Value>(value) {
            Ok(result) => Outcome::success(result),
            Err(e) => {
                (job.on_log)(
                    LogLevel::Warn,
                    &format!("result is not JSON-serializable, reporting null: {e}"),
                );
                Outcome::success(serde_json::Value::Null)
            }
        },
        Ok(Err(lua_err)) => {
            // Emit the traceback as log lines before the failure result.
            let text = lua_err.to_string();
            for line in text.lines().filter(|l| !l.trim().is_empty()) {
                (job.on_log)(LogLevel::Error, line);
            }
            let summary = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("Lua error");
            Outcome::failure(summary)
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            log::error!("[worker] panic while running action '{}': {message}", job.name);
            Outcome::failure(format!("panic: {message}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_script(dir: &Path, name: &str, body: &str) {
        let mut file = std::fs::File::create(dir.join(name)).expect("create script");
        file.write_all(body.as_bytes()).expect("write script");
    }

    fn discard_logs() -> LogSink {
        Arc::new(|_, _| {})
    }

    #[tokio::test]
    async fn defaults_fill_missing_parameters() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_script(
            dir.path(),
            "clean.lua",
            r#"
            action.register({
                name = "clean_cache",
                params = { days = { type = "int", default = 7 } },
                handler = function(params) return { days = params.days } end,
            })
            "#,
        );
        let manager = ActionManager::start(dir.path()).expect("start manager");

        let outcome = manager
            .invoke("clean_cache", serde_json::Map::new(), discard_logs())
            .await;
        assert_eq!(outcome.status, ExecStatus::Success);
        assert_eq!(outcome.result, serde_json::json!({"days": 7}));

        let mut explicit = serde_json::Map::new();
        explicit.insert("days".to_string(), serde_json::json!(3));
        let outcome = manager.invoke("clean_cache", explicit, discard_logs()).await;
        assert_eq!(outcome.result, serde_json::json!({"days": 3}));
    }

    #[tokio::test]
    async fn unknown_action_fails_without_call() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = ActionManager::start(dir.path()).expect("start manager");
        let outcome = manager
            .invoke("missing", serde_json::Map::new(), discard_logs())
            .await;
        assert_eq!(outcome.status, ExecStatus::Failure);
        assert!(outcome.error.contains("unknown action"));
    }

    #[tokio::test]
    async fn broken_script_is_skipped_but_others_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_script(dir.path(), "aa_broken.lua", "this is not lua(");
        write_script(
            dir.path(),
            "ok.lua",
            r#"action.register({ name = "ok", handler = function() return 1 end })"#,
        );
        let manager = ActionManager::start(dir.path()).expect("start manager");
        assert!(manager.get("ok").is_some());
        assert_eq!(manager.list().len(), 1);
    }
}
