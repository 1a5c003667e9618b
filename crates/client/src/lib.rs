//! Compilation entry points: one [`SelectQueryInterpreter`] per query, plus the
//! [`Engine`] facade holding session settings, catalog and quota.

mod session;

pub mod engine;
pub mod interpreter;

pub use engine::Engine;
pub use interpreter::{BlockIo, CompilerComponents, SelectQueryInterpreter};
