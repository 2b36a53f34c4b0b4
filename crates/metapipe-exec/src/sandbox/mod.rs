//! Sandboxed Lua stage scripts.
//!
//! Scripts see a fixed surface: the base library, the configured standard
//! libraries, their stage inputs as globals and the `metapipe` helper table.

pub mod engine;
pub mod error;
pub mod helpers;

pub use engine::{Bindings, Sandbox};
pub use error::SandboxError;
