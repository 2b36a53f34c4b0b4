//! Lua 5.4 script engine with per-invocation resource limits.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metapipe_core::config::{SandboxConfig, SandboxLibrary};
use metapipe_core::locator::LocatorPolicy;
use mlua::{Function, HookTriggers, Lua, LuaOptions, LuaSerdeExt, StdLib, Variadic};
use serde_json::Value;
use tracing::debug;

use super::error::SandboxError;
use super::helpers;

/// VM instructions between two limit checks.
const HOOK_INTERVAL: u32 = 1_000;

const REMOVED_GLOBALS: &[&str] = &["dofile", "loadfile", "load", "require", "collectgarbage"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Breach {
    Timeout,
    Instructions,
    Cancelled,
}

/// Globals bound for one invocation. Names left out, or bound to null, are
/// `nil`.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    entries: Vec<(&'static str, Value)>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &'static str, value: Value) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &'static str, value: Value) {
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }
}

/// Evaluates stage scripts. Every call runs in a fresh interpreter.
#[derive(Debug, Clone)]
pub struct Sandbox {
    config: SandboxConfig,
    policy: LocatorPolicy,
    cancel: Arc<AtomicBool>,
}

impl Sandbox {
    pub fn new(config: SandboxConfig, policy: LocatorPolicy, cancel: Arc<AtomicBool>) -> Self {
        Self {
            config,
            policy,
            cancel,
        }
    }

    fn std_libs(&self) -> StdLib {
        self.config
            .libraries
            .iter()
            .fold(StdLib::NONE, |libs, lib| {
                libs | match lib {
                    SandboxLibrary::Table => StdLib::TABLE,
                    SandboxLibrary::String => StdLib::STRING,
                    SandboxLibrary::Math => StdLib::MATH,
                    SandboxLibrary::Utf8 => StdLib::UTF8,
                    SandboxLibrary::Os => StdLib::OS,
                    SandboxLibrary::Io => StdLib::IO,
                    SandboxLibrary::Coroutine => StdLib::COROUTINE,
                    SandboxLibrary::Debug => StdLib::DEBUG,
                }
            })
    }

    fn fresh_state(&self) -> Result<Lua, SandboxError> {
        let setup = |e: mlua::Error| SandboxError::Setup(e.to_string());
        let libs = self.std_libs();
        let lua = if self.config.libraries.contains(&SandboxLibrary::Debug) {
            // SAFETY: the debug library is only loaded when configuration asks for it.
            unsafe { Lua::unsafe_new_with(libs, LuaOptions::new()) }
        } else {
            Lua::new_with(libs, LuaOptions::new()).map_err(setup)?
        };

        {
            let globals = lua.globals();
            for name in REMOVED_GLOBALS {
                globals.set(*name, mlua::Value::Nil).map_err(setup)?;
            }
            let print = lua
                .create_function(|_, args: Variadic<mlua::Value>| {
                    let line: Vec<String> = args.iter().map(display_value).collect();
                    debug!(target: "metapipe::script", "{}", line.join("\t"));
                    Ok(())
                })
                .map_err(setup)?;
            globals.set("print", print).map_err(setup)?;
        }
        helpers::install(&lua, &self.policy).map_err(setup)?;

        if self.config.deterministic_random && self.config.libraries.contains(&SandboxLibrary::Math) {
            lua.load(format!("math.randomseed({})", self.config.seed).as_str())
                .set_name("randomseed")
                .exec()
                .map_err(setup)?;
        }

        lua.set_memory_limit(self.config.memory_limit_bytes)
            .map_err(setup)?;
        Ok(lua)
    }

    /// Compile `source` without running it.
    pub fn check_syntax(&self, name: &str, source: &str) -> Result<(), SandboxError> {
        let lua = self.fresh_state()?;
        compile(&lua, name, source)
            .map(|_| ())
            .map_err(|e| SandboxError::Script(script_message(&e)))
    }

    /// Run `source` with `bindings` as globals and return its first result.
    ///
    /// A source that is a single expression is evaluated as one; otherwise it
    /// runs as a chunk whose `return` value is the result.
    pub fn eval(&self, name: &str, source: &str, bindings: &Bindings) -> Result<Value, SandboxError> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(SandboxError::Cancelled);
        }
        let lua = self.fresh_state()?;
        let breach: Rc<Cell<Option<Breach>>> = Rc::new(Cell::new(None));

        {
            let globals = lua.globals();
            for (key, value) in &bindings.entries {
                if value.is_null() {
                    continue;
                }
                let converted = lua
                    .to_value(value)
                    .map_err(|e| self.classify(&e, None))?;
                globals
                    .set(*key, converted)
                    .map_err(|e| self.classify(&e, None))?;
            }
        }

        let function = compile(&lua, name, source).map_err(|e| SandboxError::Script(script_message(&e)))?;

        let deadline = Instant::now() + Duration::from_millis(self.config.timeout_ms);
        let limit = self.config.instruction_limit;
        let cancel = Arc::clone(&self.cancel);
        let hook_breach = Rc::clone(&breach);
        let executed = Cell::new(0u64);
        lua.set_hook(
            HookTriggers::new().every_nth_instruction(HOOK_INTERVAL),
            move |_lua, _debug| {
                let count = executed.get() + u64::from(HOOK_INTERVAL);
                executed.set(count);
                let tripped = if cancel.load(Ordering::Relaxed) {
                    Some(Breach::Cancelled)
                } else if count > limit {
                    Some(Breach::Instructions)
                } else if Instant::now() >= deadline {
                    Some(Breach::Timeout)
                } else {
                    None
                };
                match tripped {
                    Some(b) => {
                        hook_breach.set(Some(b));
                        Err(mlua::Error::RuntimeError(format!("{b:?}")))
                    }
                    None => Ok(()),
                }
            },
        );

        let result = function.call::<_, mlua::Value>(());
        if let Some(b) = breach.get() {
            return Err(self.classify(&mlua::Error::RuntimeError(String::new()), Some(b)));
        }
        match result {
            Ok(value) => lua
                .from_value::<Value>(value)
                .map_err(|e| SandboxError::Script(format!("cannot convert result: {}", script_message(&e)))),
            Err(e) => Err(self.classify(&e, None)),
        }
    }

    fn classify(&self, err: &mlua::Error, breach: Option<Breach>) -> SandboxError {
        match breach {
            Some(Breach::Timeout) => SandboxError::Timeout {
                timeout_ms: self.config.timeout_ms,
            },
            Some(Breach::Instructions) => SandboxError::InstructionLimit {
                limit: self.config.instruction_limit,
            },
            Some(Breach::Cancelled) => SandboxError::Cancelled,
            None if is_memory_error(err) => SandboxError::MemoryLimit {
                limit_bytes: self.config.memory_limit_bytes,
            },
            None => SandboxError::Script(script_message(err)),
        }
    }
}

fn compile<'lua>(lua: &'lua Lua, name: &str, source: &str) -> mlua::Result<Function<'lua>> {
    let expression = format!("return {source}");
    match lua.load(expression.as_str()).set_name(name).into_function() {
        Ok(function) => Ok(function),
        Err(_) => lua.load(source).set_name(name).into_function(),
    }
}

fn is_memory_error(err: &mlua::Error) -> bool {
    match err {
        mlua::Error::MemoryError(_) => true,
        mlua::Error::CallbackError { cause, .. } => is_memory_error(cause),
        _ => false,
    }
}

/// Error text without the interpreter's stack traceback.
fn script_message(err: &mlua::Error) -> String {
    match err {
        mlua::Error::CallbackError { cause, .. } => script_message(cause),
        other => {
            let text = other.to_string();
            match text.find("\nstack traceback:") {
                Some(idx) => text[..idx].to_string(),
                None => text,
            }
        }
    }
}

fn display_value(value: &mlua::Value) -> String {
    match value {
        mlua::Value::Nil => "nil".to_string(),
        mlua::Value::Boolean(b) => b.to_string(),
        mlua::Value::Integer(i) => i.to_string(),
        mlua::Value::Number(n) => n.to_string(),
        mlua::Value::String(s) => s.to_string_lossy().into_owned(),
        other => other.type_name().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sandbox_with(config: SandboxConfig) -> Sandbox {
        Sandbox::new(config, LocatorPolicy::default(), Arc::new(AtomicBool::new(false)))
    }

    fn sandbox() -> Sandbox {
        sandbox_with(SandboxConfig::default())
    }

    #[test]
    fn test_expression_and_chunk_forms() {
        let sb = sandbox();
        let bindings = Bindings::new().with("meta", json!({"kind": "doc", "n": 2}));
        assert_eq!(
            sb.eval("filter", "meta.kind == 'doc'", &bindings).unwrap(),
            json!(true)
        );
        assert_eq!(
            sb.eval("map", "local t = {} t.double = meta.n * 2 return t", &bindings)
                .unwrap(),
            json!({"double": 4})
        );
    }

    #[test]
    fn test_nil_and_null() {
        let sb = sandbox();
        assert_eq!(sb.eval("map", "return nil", &Bindings::new()).unwrap(), Value::Null);
        let bindings = Bindings::new().with("value", Value::Null);
        assert_eq!(sb.eval("map", "value", &bindings).unwrap(), Value::Null);
        assert_eq!(sb.eval("map", "acc == nil", &Bindings::new()).unwrap(), json!(true));
    }

    #[test]
    fn test_null_binding_is_nil() {
        let sb = sandbox();
        let bindings = Bindings::new().with("existing", Value::Null);
        assert_eq!(
            sb.eval("map", "{ is_nil = existing == nil, ty = type(existing) }", &bindings)
                .unwrap(),
            json!({"is_nil": true, "ty": "nil"})
        );
        let bindings = Bindings::new().with("existing", json!({"a": 1}));
        assert_eq!(
            sb.eval("map", "existing and existing.a", &bindings).unwrap(),
            json!(1)
        );
    }

    #[test]
    fn test_arrays_survive_the_boundary() {
        let sb = sandbox();
        let bindings = Bindings::new().with("value", json!([1, 2, 3]));
        assert_eq!(
            sb.eval("map", "local out = {} for i, v in ipairs(value) do out[i] = v * 10 end return out", &bindings)
                .unwrap(),
            json!([10, 20, 30])
        );
    }

    #[test]
    fn test_timeout() {
        let sb = sandbox_with(SandboxConfig {
            timeout_ms: 50,
            instruction_limit: u64::MAX,
            ..SandboxConfig::default()
        });
        let err = sb.eval("map", "while true do end", &Bindings::new()).unwrap_err();
        assert_eq!(err, SandboxError::Timeout { timeout_ms: 50 });
    }

    #[test]
    fn test_instruction_limit() {
        let sb = sandbox_with(SandboxConfig {
            timeout_ms: 60_000,
            instruction_limit: 10_000,
            ..SandboxConfig::default()
        });
        let err = sb
            .eval("map", "local i = 0 while true do i = i + 1 end", &Bindings::new())
            .unwrap_err();
        assert_eq!(err, SandboxError::InstructionLimit { limit: 10_000 });
    }

    #[test]
    fn test_pcall_cannot_swallow_limits() {
        let sb = sandbox_with(SandboxConfig {
            timeout_ms: 60_000,
            instruction_limit: 10_000,
            ..SandboxConfig::default()
        });
        let err = sb
            .eval(
                "map",
                "pcall(function() while true do end end) return 1",
                &Bindings::new(),
            )
            .unwrap_err();
        assert_eq!(err, SandboxError::InstructionLimit { limit: 10_000 });
    }

    #[test]
    fn test_memory_limit() {
        let sb = sandbox_with(SandboxConfig {
            timeout_ms: 60_000,
            instruction_limit: u64::MAX,
            memory_limit_bytes: 2 * 1024 * 1024,
            ..SandboxConfig::default()
        });
        let err = sb
            .eval(
                "map",
                "local t = {} for i = 1, 1e8 do t[i] = string.rep('x', 64) .. i end return #t",
                &Bindings::new(),
            )
            .unwrap_err();
        assert!(matches!(err, SandboxError::MemoryLimit { .. }), "{err}");
    }

    #[test]
    fn test_cancelled_before_start() {
        let cancel = Arc::new(AtomicBool::new(true));
        let sb = Sandbox::new(SandboxConfig::default(), LocatorPolicy::default(), cancel);
        assert_eq!(
            sb.eval("map", "1", &Bindings::new()).unwrap_err(),
            SandboxError::Cancelled
        );
    }

    #[test]
    fn test_dangerous_globals_absent_by_default() {
        let sb = sandbox();
        let result = sb
            .eval(
                "filter",
                "dofile == nil and loadfile == nil and require == nil and io == nil and os == nil and debug == nil",
                &Bindings::new(),
            )
            .unwrap();
        assert_eq!(result, json!(true));
    }

    #[test]
    fn test_optional_library() {
        let mut config = SandboxConfig::default();
        config.libraries.push(SandboxLibrary::Os);
        let sb = sandbox_with(config);
        assert_eq!(
            sb.eval("map", "type(os.time)", &Bindings::new()).unwrap(),
            json!("function")
        );
    }

    #[test]
    fn test_helpers() {
        let sb = sandbox();
        assert_eq!(
            sb.eval(
                "map",
                "metapipe.join('a', 'b/') .. '|' .. metapipe.basename('x/y.tar.gz') .. '|' .. metapipe.dirname('x/y.tar.gz') .. '|' .. metapipe.extname('x/y.tar.gz')",
                &Bindings::new()
            )
            .unwrap(),
            json!("a/b/|y.tar.gz|x|gz")
        );
        assert_eq!(
            sb.eval("map", "metapipe.json_decode(metapipe.json_encode({a = 1}))", &Bindings::new())
                .unwrap(),
            json!({"a": 1})
        );
        assert_eq!(
            sb.eval("map", "metapipe.normalize_locator('docs//./a.md')", &Bindings::new())
                .unwrap(),
            json!("docs/a.md")
        );
        let err = sb
            .eval("map", "metapipe.normalize_locator('/etc/passwd')", &Bindings::new())
            .unwrap_err();
        assert!(matches!(err, SandboxError::Script(ref m) if m.contains("absolute")), "{err}");
    }

    #[test]
    fn test_deterministic_random() {
        let sb = sandbox();
        let a = sb.eval("map", "math.random(1, 1000000)", &Bindings::new()).unwrap();
        let b = sb.eval("map", "math.random(1, 1000000)", &Bindings::new()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_no_state_carries_over() {
        let sb = sandbox();
        let src = "counter = (counter or 0) + 1 return counter";
        assert_eq!(sb.eval("map", src, &Bindings::new()).unwrap(), json!(1));
        assert_eq!(sb.eval("map", src, &Bindings::new()).unwrap(), json!(1));
    }

    #[test]
    fn test_script_errors() {
        let sb = sandbox();
        let err = sb.eval("map", "error('boom')", &Bindings::new()).unwrap_err();
        match err {
            SandboxError::Script(msg) => {
                assert!(msg.contains("boom"));
                assert!(!msg.contains("stack traceback"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            sb.check_syntax("map", "return ("),
            Err(SandboxError::Script(_))
        ));
        sb.check_syntax("filter", "meta.kind == 'x'").unwrap();
        sb.check_syntax("map", "local x = 1 return x").unwrap();
    }

    #[test]
    fn test_print_is_harmless() {
        let sb = sandbox();
        assert_eq!(
            sb.eval("map", "print('hello', 1, nil) return 2", &Bindings::new()).unwrap(),
            json!(2)
        );
    }
}
