//! Magic rule language and compiled signature databases.
//!
//! * **compiler** turns magic source files into a [`SignatureDatabase`],
//!   reporting syntax errors with file and line.
//! * **codec** reads and writes the precompiled `.mgc` image, rejecting
//!   images from another format version.
//!
//! Evaluation against file contents lives in `magic-core`.

pub mod codec;
pub mod compiler;
pub mod strength;
pub mod types;

pub use codec::{load, read_database, save, write_database};
pub use compiler::{Compiler, compile_files, compile_sources, compile_str, source_files};
pub use types::{
    Category, DatabaseStats, Entry, ListedEntry, MagicRule, RulesError, SignatureDatabase,
};
