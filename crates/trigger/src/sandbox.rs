//! Open-script sandbox.
//!
//! Each invocation gets a brand new Lua state on a blocking worker thread.
//! Only the `table`, `string`, `math` and `utf8` libraries are loaded, the
//! file-loading globals are removed, and a memory limit plus an instruction
//! hook bound the run. The script's whole world is the capability set
//! injected here:
//!
//! | global                           | capability                            |
//! |----------------------------------|---------------------------------------|
//! | `send(payload, await_response)`  | write a frame, optionally await reply |
//! | `await_message()`                | wait for the next inbound frame       |
//! | `credentials`                    | `access_token`, `client_id`, `client_secret` |
//! | `get_parameter(name)`            | read node configuration               |
//! | `static_data`                    | `get`/`set`/`remove`/`keys` on workflow data |
//! | `log(msg)`, `print(...)`         | write to the tracing subscriber       |
//!
//! Values cross the boundary as JSON.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mlua::{HookTriggers, Lua, LuaOptions, LuaSerdeExt, MultiValue, StdLib, Variadic, VmState};
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::{AuthContext, DecodedMessage, SandboxError, StaticDataStore, TriggerConfig, TriggerError};

/// Globals removed from every fresh state.
const REMOVED_GLOBALS: &[&str] = &["dofile", "loadfile", "load", "require", "collectgarbage"];

/// The deadline is checked every this many VM instructions.
const HOOK_INTERVAL: u32 = 1_000;

/// Base functions that catch errors. Wrapped so they cannot swallow a deadline.
const PROTECTED_CALLS: &[&str] = &["pcall", "xpcall"];

const DEADLINE_EXCEEDED: &str = "script deadline exceeded";

/// The connection-side half of `send`/`await_message`.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Write `payload`; with `await_response`, resolve with the next inbound frame.
    async fn send(
        &self,
        payload: Value,
        await_response: bool,
    ) -> Result<Option<DecodedMessage>, TriggerError>;

    /// Resolve with the next inbound frame.
    async fn next_message(&self) -> Result<DecodedMessage, TriggerError>;
}

/// Read-only node configuration.
pub trait ParameterSource: Send + Sync {
    fn parameter(&self, name: &str) -> Option<Value>;
}

impl ParameterSource for Value {
    fn parameter(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

/// Everything one open-script invocation can reach.
#[derive(Clone)]
pub struct SandboxContext {
    channel: Arc<dyn MessageChannel>,
    auth: AuthContext,
    parameters: Arc<dyn ParameterSource>,
    static_data: Arc<dyn StaticDataStore>,
}

impl SandboxContext {
    pub fn new(
        channel: Arc<dyn MessageChannel>,
        auth: AuthContext,
        parameters: Arc<dyn ParameterSource>,
        static_data: Arc<dyn StaticDataStore>,
    ) -> Self {
        Self {
            channel,
            auth,
            parameters,
            static_data,
        }
    }
}

/// Resource bounds for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxLimits {
    /// Wall-clock budget, including time blocked in `send`/`await_message`.
    pub timeout: Duration,
    /// Lua heap limit in bytes.
    pub memory_limit: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self::from(&TriggerConfig::default())
    }
}

impl From<&TriggerConfig> for SandboxLimits {
    fn from(config: &TriggerConfig) -> Self {
        Self {
            timeout: config.script_timeout(),
            memory_limit: config.script_memory_limit,
        }
    }
}

/// Runs open-scripts. Cheap to clone; holds no interpreter state.
#[derive(Debug, Clone, Default)]
pub struct SandboxExecutor {
    limits: SandboxLimits,
}

impl SandboxExecutor {
    pub fn new(limits: SandboxLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    /// Run `script` once against `ctx`.
    ///
    /// A blank script completes immediately. Script faults come back as
    /// [`SandboxError`]; they never unwind into the caller.
    pub async fn run(&self, script: &str, ctx: SandboxContext) -> Result<(), SandboxError> {
        if script.trim().is_empty() {
            debug!("no open script configured");
            return Ok(());
        }

        let script = script.to_owned();
        let limits = self.limits.clone();
        let runtime = Handle::current();
        let started = Instant::now();

        let worker =
            tokio::task::spawn_blocking(move || run_isolated(&script, ctx, &limits, runtime));
        let outcome = match worker.await {
            Ok(outcome) => outcome,
            Err(err) if err.is_panic() => Err(SandboxError::Panicked),
            Err(err) => Err(SandboxError::Runtime(err.to_string())),
        };

        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = outcome.is_ok(),
            "open script finished"
        );
        outcome
    }
}

fn setup_error(err: mlua::Error) -> SandboxError {
    SandboxError::Setup(err.to_string())
}

fn run_isolated(
    script: &str,
    ctx: SandboxContext,
    limits: &SandboxLimits,
    runtime: Handle,
) -> Result<(), SandboxError> {
    let deadline = Instant::now() + limits.timeout;
    let expired = Arc::new(AtomicBool::new(false));

    let lua = isolated_state(limits)?;
    install_deadline(&lua, deadline, Arc::clone(&expired));
    guard_protected_calls(&lua, Arc::clone(&expired)).map_err(setup_error)?;

    let blocking = Blocking {
        runtime,
        deadline,
        expired: Arc::clone(&expired),
    };
    inject_capabilities(&lua, ctx, blocking).map_err(setup_error)?;

    match lua.load(script).set_name("open_script").exec() {
        Ok(()) => Ok(()),
        Err(_) if expired.load(Ordering::SeqCst) => Err(SandboxError::Timeout(limits.timeout)),
        Err(err) => Err(err.into()),
    }
}

fn isolated_state(limits: &SandboxLimits) -> Result<Lua, SandboxError> {
    let libs = StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8;
    let lua = Lua::new_with(libs, LuaOptions::new()).map_err(setup_error)?;
    lua.set_memory_limit(limits.memory_limit).map_err(setup_error)?;
    {
        let globals = lua.globals();
        for name in REMOVED_GLOBALS {
            globals.set(*name, mlua::Nil).map_err(setup_error)?;
        }
    }
    Ok(lua)
}

fn install_deadline(lua: &Lua, deadline: Instant, expired: Arc<AtomicBool>) {
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(HOOK_INTERVAL),
        move |_lua, _debug| {
            if expired.load(Ordering::SeqCst) || Instant::now() >= deadline {
                expired.store(true, Ordering::SeqCst);
                return Err(mlua::Error::RuntimeError(DEADLINE_EXCEEDED.into()));
            }
            Ok(VmState::Continue)
        },
    );
}

/// Replace `pcall`/`xpcall` with versions that re-raise once the deadline
/// has passed, so a caught deadline error still ends the script.
fn guard_protected_calls(lua: &Lua, expired: Arc<AtomicBool>) -> mlua::Result<()> {
    let globals = lua.globals();
    for name in PROTECTED_CALLS {
        let original: mlua::Function = globals.get(*name)?;
        let expired = Arc::clone(&expired);
        let guarded = lua.create_function(move |_, args: MultiValue| {
            let results: MultiValue = original.call(args)?;
            if expired.load(Ordering::SeqCst) {
                return Err(mlua::Error::RuntimeError(DEADLINE_EXCEEDED.into()));
            }
            Ok(results)
        })?;
        globals.set(*name, guarded)?;
    }
    Ok(())
}

/// Bridges a capability call on the script thread onto the async runtime.
#[derive(Clone)]
struct Blocking {
    runtime: Handle,
    deadline: Instant,
    expired: Arc<AtomicBool>,
}

impl Blocking {
    fn wait<T, F>(&self, fut: F) -> mlua::Result<T>
    where
        F: Future<Output = Result<T, TriggerError>>,
    {
        let deadline = tokio::time::Instant::from_std(self.deadline);
        let outcome = self
            .runtime
            .block_on(async move { tokio::time::timeout_at(deadline, fut).await });
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(mlua::Error::external(err)),
            Err(_) => {
                self.expired.store(true, Ordering::SeqCst);
                Err(mlua::Error::RuntimeError(format!(
                    "{DEADLINE_EXCEEDED} while waiting for a message"
                )))
            }
        }
    }
}

fn inject_capabilities(lua: &Lua, ctx: SandboxContext, blocking: Blocking) -> mlua::Result<()> {
    let globals = lua.globals();

    let channel = Arc::clone(&ctx.channel);
    let waiter = blocking.clone();
    let send = lua.create_function(
        move |lua, (payload, await_response): (mlua::Value, Option<bool>)| {
            let payload: Value = lua.from_value(payload)?;
            let reply = waiter.wait(channel.send(payload, await_response.unwrap_or(false)))?;
            match reply {
                Some(message) => lua.to_value(&message.into_value()),
                None => Ok(mlua::Value::Nil),
            }
        },
    )?;
    globals.set("send", send)?;

    let channel = Arc::clone(&ctx.channel);
    let waiter = blocking;
    let await_message = lua.create_function(move |lua, ()| {
        let message = waiter.wait(channel.next_message())?;
        lua.to_value(&message.into_value())
    })?;
    globals.set("await_message", await_message)?;

    let credentials = lua.create_table()?;
    credentials.set("access_token", ctx.auth.access_token())?;
    credentials.set("client_id", ctx.auth.client_id())?;
    credentials.set("client_secret", ctx.auth.client_secret())?;
    globals.set("credentials", credentials)?;

    let parameters = Arc::clone(&ctx.parameters);
    let get_parameter = lua.create_function(move |lua, name: String| {
        match parameters.parameter(&name) {
            Some(value) => lua.to_value(&value),
            None => Ok(mlua::Value::Nil),
        }
    })?;
    globals.set("get_parameter", get_parameter)?;

    globals.set("static_data", static_data_table(lua, &ctx.static_data)?)?;

    let log = lua.create_function(|_, message: String| {
        info!(target: "script", "{message}");
        Ok(())
    })?;
    globals.set("log", log)?;

    let print = lua.create_function(|_, values: Variadic<mlua::Value>| {
        let line = values.iter().map(describe).collect::<Vec<_>>().join("\t");
        info!(target: "script", "{line}");
        Ok(())
    })?;
    globals.set("print", print)?;

    Ok(())
}

fn static_data_table(lua: &Lua, store: &Arc<dyn StaticDataStore>) -> mlua::Result<mlua::Table> {
    let table = lua.create_table()?;

    let s = Arc::clone(store);
    table.set(
        "get",
        lua.create_function(move |lua, key: String| match s.get(&key) {
            Some(value) => lua.to_value(&value),
            None => Ok(mlua::Value::Nil),
        })?,
    )?;

    // Setting nil deletes the key, as with a plain Lua table.
    let s = Arc::clone(store);
    table.set(
        "set",
        lua.create_function(move |lua, (key, value): (String, mlua::Value)| {
            if value.is_nil() {
                s.remove(&key);
            } else {
                s.set(&key, lua.from_value(value)?);
            }
            Ok(())
        })?,
    )?;

    let s = Arc::clone(store);
    table.set(
        "remove",
        lua.create_function(move |lua, key: String| match s.remove(&key) {
            Some(value) => lua.to_value(&value),
            None => Ok(mlua::Value::Nil),
        })?,
    )?;

    let s = Arc::clone(store);
    table.set("keys", lua.create_function(move |_, ()| Ok(s.keys()))?)?;

    Ok(table)
}

fn describe(value: &mlua::Value) -> String {
    match value {
        mlua::Value::Nil => "nil".to_owned(),
        mlua::Value::Boolean(b) => b.to_string(),
        mlua::Value::Integer(i) => i.to_string(),
        mlua::Value::Number(n) => n.to_string(),
        mlua::Value::String(s) => s.to_string_lossy().to_string(),
        other => other.type_name().to_owned(),
    }
}
