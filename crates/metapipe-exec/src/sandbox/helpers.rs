//! Host functions exposed to scripts under the `metapipe` global table.

use metapipe_core::domain::split_components;
use metapipe_core::locator::{normalize_locator, LocatorPolicy};
use mlua::{Lua, LuaSerdeExt, Table, Variadic};

/// Join path segments with `/`, collapsing separators at the seams.
pub fn join_segments<S: AsRef<str>>(parts: &[S]) -> String {
    let mut out = String::new();
    for part in parts {
        let part = part.as_ref();
        if part.is_empty() {
            continue;
        }
        if out.is_empty() {
            out.push_str(part);
            continue;
        }
        let trimmed_out = out.trim_end_matches('/').len();
        out.truncate(trimmed_out);
        out.push('/');
        out.push_str(part.trim_start_matches('/'));
    }
    out
}

/// Build the `metapipe` helper table.
pub fn install(lua: &Lua, policy: &LocatorPolicy) -> mlua::Result<()> {
    let helpers: Table = lua.create_table()?;

    let policy = policy.clone();
    helpers.set(
        "normalize_locator",
        lua.create_function(move |_, raw: String| {
            normalize_locator(&raw, &policy).map_err(mlua::Error::external)
        })?,
    )?;

    helpers.set(
        "basename",
        lua.create_function(|_, path: String| Ok(split_components(&path).1))?,
    )?;
    helpers.set(
        "dirname",
        lua.create_function(|_, path: String| Ok(split_components(&path).0))?,
    )?;
    helpers.set(
        "extname",
        lua.create_function(|_, path: String| Ok(split_components(&path).3))?,
    )?;
    helpers.set(
        "join",
        lua.create_function(|_, parts: Variadic<String>| Ok(join_segments(parts.as_slice())))?,
    )?;

    helpers.set(
        "json_encode",
        lua.create_function(|lua, value: mlua::Value| {
            let json: serde_json::Value = lua.from_value(value)?;
            serde_json::to_string(&json).map_err(mlua::Error::external)
        })?,
    )?;
    helpers.set(
        "json_decode",
        lua.create_function(|lua, text: String| {
            let json: serde_json::Value =
                serde_json::from_str(&text).map_err(mlua::Error::external)?;
            lua.to_value(&json)
        })?,
    )?;

    lua.globals().set("metapipe", helpers)
}
