//! Content-based file type detection.
//!
//! A [`Session`] holds a compiled magic database plus detection flags and
//! answers "what is this?" for paths, buffers and open descriptors:
//!
//! ```no_run
//! use magic_core::{MagicFlags, Session};
//!
//! let mut session = Session::open(MagicFlags::MIME_TYPE);
//! session.load(None)?;
//! println!("{}", session.file("/bin/sh")?);
//! # Ok::<(), magic_core::MagicError>(())
//! ```

pub mod builtin;
pub mod engine;
pub mod error;
pub mod flags;
pub mod params;
pub mod session;
pub mod source;

pub use builtin::builtin_database;
pub use engine::{Detection, Engine};
pub use error::{ErrorKind, LastError, MagicError, Result};
pub use flags::{MagicFlags, OutputMode};
pub use params::{Param, Params};
pub use session::{MAGIC_ENV, Session, default_database_path, exit_code};
