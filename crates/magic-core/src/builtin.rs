//! Rule set compiled into the library, used when no database is installed.

use magic_rules::{RulesError, SignatureDatabase, compile_sources};
use tracing::debug;

/// `(name, source)` of every embedded rule file, in load order.
pub const BUILTIN_SOURCES: &[(&str, &str)] = &[
    ("compress", include_str!("../magic/compress")),
    ("archive", include_str!("../magic/archive")),
    ("elf", include_str!("../magic/elf")),
    ("msdos", include_str!("../magic/msdos")),
    ("cdf", include_str!("../magic/cdf")),
    ("images", include_str!("../magic/images")),
    ("documents", include_str!("../magic/documents")),
    ("audio", include_str!("../magic/audio")),
    ("database", include_str!("../magic/database")),
    ("scripts", include_str!("../magic/scripts")),
    ("java", include_str!("../magic/java")),
];

/// Compile the embedded rules.
pub fn builtin_database() -> Result<SignatureDatabase, RulesError> {
    let db = compile_sources(BUILTIN_SOURCES)?;
    debug!(entries = db.entries().len(), "compiled built-in magic");
    Ok(db)
}
