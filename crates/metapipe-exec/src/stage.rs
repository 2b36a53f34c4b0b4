//! Script stage contracts: compilation, invocation and result interpretation.

use std::sync::Arc;

use metapipe_core::config::StageScripts;
use metapipe_core::diff::{Desired, PatchOp};
use metapipe_core::domain::{MetapipeError, Result, StageError, StageKind};
use serde_json::Value;

use crate::sandbox::{Bindings, Sandbox, SandboxError};

/// One configured stage script.
#[derive(Debug, Clone)]
pub struct Script {
    kind: StageKind,
    source: Arc<str>,
}

impl Script {
    pub fn new(kind: StageKind, source: &str) -> Self {
        Self {
            kind,
            source: Arc::from(source),
        }
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Stage error for the item known as `locator`.
    pub fn error(&self, locator: &str, err: &SandboxError) -> StageError {
        StageError::for_locator(self.kind, locator, err.to_string())
    }
}

/// The stage scripts of a run, each checked for syntax errors.
#[derive(Debug, Clone, Default)]
pub struct CompiledScripts {
    pub filter: Option<Script>,
    pub map: Option<Script>,
    pub reduce: Option<Script>,
    pub post_map: Option<Script>,
}

impl CompiledScripts {
    /// Compile every configured script once, before any item is processed.
    pub fn compile(scripts: &StageScripts, sandbox: &Sandbox) -> Result<Self> {
        let check = |kind: StageKind, source: &Option<String>| -> Result<Option<Script>> {
            let Some(source) = source else {
                return Ok(None);
            };
            sandbox
                .check_syntax(kind.as_str(), source)
                .map_err(|e| MetapipeError::InvalidConfig(format!("{kind} script: {e}")))?;
            Ok(Some(Script::new(kind, source)))
        };
        Ok(Self {
            filter: check(StageKind::Filter, &scripts.filter)?,
            map: check(StageKind::Map, &scripts.map)?,
            reduce: check(StageKind::Reduce, &scripts.reduce)?,
            post_map: check(StageKind::PostMap, &scripts.post_map)?,
        })
    }

    /// Whether a stage produces the item's `value`.
    pub fn produces_value(&self) -> bool {
        self.map.is_some() || self.post_map.is_some()
    }
}

/// Run `script` on the blocking pool.
pub async fn run_script(
    sandbox: &Arc<Sandbox>,
    script: &Script,
    bindings: Bindings,
) -> std::result::Result<Value, SandboxError> {
    let sandbox = Arc::clone(sandbox);
    let script = script.clone();
    match tokio::task::spawn_blocking(move || {
        sandbox.eval(script.kind.as_str(), script.source(), &bindings)
    })
    .await
    {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Err(SandboxError::Cancelled),
        Err(e) => Err(SandboxError::Setup(format!("script task failed: {e}"))),
    }
}

/// Filter verdict: `nil` and `false` drop the item, anything else keeps it.
pub fn is_truthy(value: &Value) -> bool {
    !matches!(value, Value::Null | Value::Bool(false))
}

/// Interpret a file-flow post-map result as `{meta = ...}` or `{patch = ...}`.
///
/// When both are present the patch wins.
pub fn parse_file_result(value: Value) -> std::result::Result<Desired, String> {
    let Value::Object(mut fields) = value else {
        return Err("post-map must return a table with `meta` or `patch`".to_string());
    };
    if let Some(patch) = fields.remove("patch") {
        let ops: Vec<PatchOp> =
            serde_json::from_value(patch).map_err(|e| format!("invalid `patch`: {e}"))?;
        return Ok(Desired::Patch(ops));
    }
    match fields.remove("meta") {
        Some(meta @ Value::Object(_)) => Ok(Desired::Meta(meta)),
        Some(_) => Err("`meta` returned by post-map must be a table".to_string()),
        None => Err("post-map must return a table with `meta` or `patch`".to_string()),
    }
}
