//! RFC 6902 patches: computing them from two documents and applying them.

use std::collections::BTreeSet;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// RFC 6902 operation kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PatchOpKind {
    Add,
    Remove,
    Replace,
    Move,
    Copy,
    Test,
}

/// One RFC 6902 operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatchOp {
    pub op: PatchOpKind,
    pub path: String,
    /// `Some(Value::Null)` when the document says `"value": null`.
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl PatchOp {
    pub fn add(path: impl Into<String>, value: Value) -> Self {
        Self {
            op: PatchOpKind::Add,
            path: path.into(),
            value: Some(value),
            from: None,
        }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Self {
            op: PatchOpKind::Remove,
            path: path.into(),
            value: None,
            from: None,
        }
    }

    pub fn replace(path: impl Into<String>, value: Value) -> Self {
        Self {
            op: PatchOpKind::Replace,
            path: path.into(),
            value: Some(value),
            from: None,
        }
    }
}

/// Why a patch could not be applied.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PatchError {
    #[error("invalid JSON pointer {0:?}")]
    InvalidPointer(String),

    #[error("path {0:?} does not exist")]
    PathNotFound(String),

    #[error("array index {index:?} out of bounds at {path:?}")]
    IndexOutOfBounds { path: String, index: String },

    #[error("{op:?} operation at {path:?} requires `{field}`")]
    MissingField {
        op: PatchOpKind,
        path: String,
        field: &'static str,
    },

    #[error("cannot move {from:?} into its own child {path:?}")]
    MoveIntoChild { from: String, path: String },

    #[error("test failed at {0:?}")]
    TestFailed(String),

    #[error("cannot descend into scalar at {0:?}")]
    NotContainer(String),
}

/// Added/removed/changed operation counts of a patch.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PatchSummary {
    pub added: usize,
    pub removed: usize,
    pub changed: usize,
}

impl PatchSummary {
    pub fn of(ops: &[PatchOp]) -> Self {
        let mut summary = Self::default();
        for op in ops {
            match op.op {
                PatchOpKind::Add | PatchOpKind::Copy => summary.added += 1,
                PatchOpKind::Remove => summary.removed += 1,
                PatchOpKind::Replace | PatchOpKind::Move => summary.changed += 1,
                PatchOpKind::Test => {}
            }
        }
        summary
    }
}

// ---------------------------------------------------------------------------
// Pointers
// ---------------------------------------------------------------------------

/// Escape one reference token (RFC 6901).
pub fn escape_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

fn unescape_token(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

fn parse_pointer(pointer: &str) -> Result<Vec<String>, PatchError> {
    if pointer.is_empty() {
        return Ok(Vec::new());
    }
    if !pointer.starts_with('/') {
        return Err(PatchError::InvalidPointer(pointer.to_string()));
    }
    Ok(pointer[1..].split('/').map(unescape_token).collect())
}

fn parse_index(token: &str, len: usize, path: &str, allow_end: bool) -> Result<usize, PatchError> {
    let out_of_bounds = || PatchError::IndexOutOfBounds {
        path: path.to_string(),
        index: token.to_string(),
    };
    if token == "-" && allow_end {
        return Ok(len);
    }
    let well_formed = !token.is_empty()
        && token.bytes().all(|b| b.is_ascii_digit())
        && (token == "0" || !token.starts_with('0'));
    if !well_formed {
        return Err(out_of_bounds());
    }
    let index: usize = token.parse().map_err(|_| out_of_bounds())?;
    let limit = if allow_end { len } else { len.saturating_sub(1) };
    if (allow_end && index > limit) || (!allow_end && (len == 0 || index > limit)) {
        return Err(out_of_bounds());
    }
    Ok(index)
}

fn resolve_mut<'a>(
    doc: &'a mut Value,
    tokens: &[String],
    path: &str,
) -> Result<&'a mut Value, PatchError> {
    let mut current = doc;
    for token in tokens {
        current = match current {
            Value::Object(map) => map
                .get_mut(token)
                .ok_or_else(|| PatchError::PathNotFound(path.to_string()))?,
            Value::Array(items) => {
                let idx = parse_index(token, items.len(), path, false)?;
                &mut items[idx]
            }
            _ => return Err(PatchError::NotContainer(path.to_string())),
        };
    }
    Ok(current)
}

fn get<'a>(doc: &'a Value, pointer: &str) -> Result<&'a Value, PatchError> {
    let tokens = parse_pointer(pointer)?;
    let mut current = doc;
    for token in &tokens {
        current = match current {
            Value::Object(map) => map
                .get(token)
                .ok_or_else(|| PatchError::PathNotFound(pointer.to_string()))?,
            Value::Array(items) => {
                let idx = parse_index(token, items.len(), pointer, false)?;
                &items[idx]
            }
            _ => return Err(PatchError::NotContainer(pointer.to_string())),
        };
    }
    Ok(current)
}

fn add_at(doc: &mut Value, pointer: &str, value: Value) -> Result<(), PatchError> {
    let tokens = parse_pointer(pointer)?;
    let Some((last, parents)) = tokens.split_last() else {
        *doc = value;
        return Ok(());
    };
    match resolve_mut(doc, parents, pointer)? {
        Value::Object(map) => {
            map.insert(last.clone(), value);
            Ok(())
        }
        Value::Array(items) => {
            let idx = parse_index(last, items.len(), pointer, true)?;
            items.insert(idx, value);
            Ok(())
        }
        _ => Err(PatchError::NotContainer(pointer.to_string())),
    }
}

fn remove_at(doc: &mut Value, pointer: &str) -> Result<Value, PatchError> {
    let tokens = parse_pointer(pointer)?;
    let Some((last, parents)) = tokens.split_last() else {
        return Ok(std::mem::replace(doc, Value::Null));
    };
    match resolve_mut(doc, parents, pointer)? {
        Value::Object(map) => map
            .remove(last)
            .ok_or_else(|| PatchError::PathNotFound(pointer.to_string())),
        Value::Array(items) => {
            let idx = parse_index(last, items.len(), pointer, false)?;
            Ok(items.remove(idx))
        }
        _ => Err(PatchError::NotContainer(pointer.to_string())),
    }
}

fn required_value(op: &PatchOp) -> Result<Value, PatchError> {
    op.value.clone().ok_or_else(|| PatchError::MissingField {
        op: op.op,
        path: op.path.clone(),
        field: "value",
    })
}

fn required_from(op: &PatchOp) -> Result<&str, PatchError> {
    op.from.as_deref().ok_or_else(|| PatchError::MissingField {
        op: op.op,
        path: op.path.clone(),
        field: "from",
    })
}

/// Apply `ops` to a copy of `doc`. Either every operation applies or none does.
pub fn apply_patch(doc: &Value, ops: &[PatchOp]) -> Result<Value, PatchError> {
    let mut out = doc.clone();
    for op in ops {
        match op.op {
            PatchOpKind::Add => add_at(&mut out, &op.path, required_value(op)?)?,
            PatchOpKind::Remove => {
                remove_at(&mut out, &op.path)?;
            }
            PatchOpKind::Replace => {
                let value = required_value(op)?;
                let tokens = parse_pointer(&op.path)?;
                *resolve_mut(&mut out, &tokens, &op.path)? = value;
            }
            PatchOpKind::Move => {
                let from = required_from(op)?;
                if op.path != from && op.path.starts_with(&format!("{from}/")) {
                    return Err(PatchError::MoveIntoChild {
                        from: from.to_string(),
                        path: op.path.clone(),
                    });
                }
                let value = remove_at(&mut out, from)?;
                add_at(&mut out, &op.path, value)?;
            }
            PatchOpKind::Copy => {
                let value = get(&out, required_from(op)?)?.clone();
                add_at(&mut out, &op.path, value)?;
            }
            PatchOpKind::Test => {
                let expected = required_value(op)?;
                if get(&out, &op.path)? != &expected {
                    return Err(PatchError::TestFailed(op.path.clone()));
                }
            }
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Diff
// ---------------------------------------------------------------------------

/// Compute the operations that turn `before` into `after`.
///
/// Object keys are visited in sorted order and arrays are aligned on their
/// longest common subsequence, so the result depends only on the two inputs.
pub fn diff_values(before: &Value, after: &Value) -> Vec<PatchOp> {
    let mut ops = Vec::new();
    diff_into("", before, after, &mut ops);
    ops
}

fn diff_into(path: &str, before: &Value, after: &Value, ops: &mut Vec<PatchOp>) {
    if before == after {
        return;
    }
    match (before, after) {
        (Value::Object(a), Value::Object(b)) => diff_objects(path, a, b, ops),
        (Value::Array(a), Value::Array(b)) => diff_arrays(path, a, b, ops),
        _ => ops.push(PatchOp::replace(path, after.clone())),
    }
}

fn diff_objects(path: &str, a: &Map<String, Value>, b: &Map<String, Value>, ops: &mut Vec<PatchOp>) {
    let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
    for key in keys {
        let child = format!("{path}/{}", escape_token(key));
        match (a.get(key), b.get(key)) {
            (Some(va), Some(vb)) => diff_into(&child, va, vb, ops),
            (Some(_), None) => ops.push(PatchOp::remove(child)),
            (None, Some(vb)) => ops.push(PatchOp::add(child, vb.clone())),
            (None, None) => {}
        }
    }
}

fn diff_arrays(path: &str, a: &[Value], b: &[Value], ops: &mut Vec<PatchOp>) {
    let matches = lcs_alignment(a, b);
    // `idx` is the position in the array as rewritten so far.
    let mut idx = 0usize;
    let (mut i, mut j) = (0usize, 0usize);

    for (mi, mj) in matches.into_iter().chain(std::iter::once((a.len(), b.len()))) {
        let gap_a = mi - i;
        let gap_b = mj - j;
        let paired = gap_a.min(gap_b);

        for k in 0..paired {
            diff_into(&format!("{path}/{idx}"), &a[i + k], &b[j + k], ops);
            idx += 1;
        }
        for _ in paired..gap_a {
            ops.push(PatchOp::remove(format!("{path}/{idx}")));
        }
        for k in paired..gap_b {
            ops.push(PatchOp::add(format!("{path}/{idx}"), b[j + k].clone()));
            idx += 1;
        }
        if mi < a.len() {
            idx += 1;
        }
        i = mi + 1;
        j = mj + 1;
    }
}

/// Longest common subsequence of two arrays as `(index_a, index_b)` pairs.
fn lcs_alignment(a: &[Value], b: &[Value]) -> Vec<(usize, usize)> {
    let m = a.len();
    let n = b.len();
    if m == 0 || n == 0 {
        return Vec::new();
    }

    // dp[i][j] = length of LCS of a[i..] and b[j..]
    let mut dp = vec![vec![0usize; n + 1]; m + 1];
    for i in (0..m).rev() {
        for j in (0..n).rev() {
            dp[i][j] = if a[i] == b[j] {
                dp[i + 1][j + 1] + 1
            } else {
                dp[i + 1][j].max(dp[i][j + 1])
            };
        }
    }

    let mut alignment = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < m && j < n {
        if a[i] == b[j] {
            alignment.push((i, j));
            i += 1;
            j += 1;
        } else if dp[i + 1][j] >= dp[i][j + 1] {
            i += 1;
        } else {
            j += 1;
        }
    }
    alignment
}
