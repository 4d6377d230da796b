//! A detection session: one attached database, flags, limits and the
//! outcome of the last operation.

use std::ffi::OsString;
use std::fs::{self, File, FileTimes};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use magic_rules::{Compiler, DatabaseStats, SignatureDatabase, compile_files, read_database};
use tracing::{debug, info};

use crate::builtin::{BUILTIN_SOURCES, builtin_database};
use crate::engine::{self, Detection, Engine};
use crate::error::{LastError, MagicError, Result};
use crate::flags::MagicFlags;
use crate::params::{Param, Params};
use crate::source;

/// Environment variable naming the default database.
pub const MAGIC_ENV: &str = "MAGIC";

const COMPILED_EXT: &str = "mgc";

/// Location of the default compiled database: the first entry of `$MAGIC`,
/// else `magic.mgc` under the per-user data directory.
pub fn default_database_path() -> PathBuf {
    let from_env = std::env::var_os(MAGIC_ENV)
        .and_then(|v| std::env::split_paths(&v).find(|p| !p.as_os_str().is_empty()));
    if let Some(path) = from_env {
        return path;
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("filemagic")
        .join("magic.mgc")
}

/// `0` for success, `1` for failure.
pub fn exit_code<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(_) => 1,
    }
}

/// Output file written by `compile` for a source path.
fn compiled_path(source: &Path) -> PathBuf {
    let mut name = OsString::from(source.as_os_str());
    name.push(".");
    name.push(COMPILED_EXT);
    PathBuf::from(name)
}

fn is_compiled(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == COMPILED_EXT)
}

/// Load the default database, or compile the built-in rules when it is
/// not installed.
fn default_database() -> Result<SignatureDatabase> {
    let path = default_database_path();
    if path.is_file() {
        return magic_rules::load(&path).map_err(|e| MagicError::from_load(path, e));
    }
    debug!(path = %path.display(), "no installed database, using built-in rules");
    Ok(builtin_database()?)
}

/// Compiled databases named by `paths`; a directory contributes its
/// `.mgc` files in name order.
fn load_compiled(paths: &[PathBuf]) -> Result<SignatureDatabase> {
    let mut files = Vec::new();
    for path in paths {
        let meta = fs::metadata(path).map_err(|e| MagicError::io(path, e))?;
        if !meta.is_dir() {
            files.push(path.clone());
            continue;
        }
        let mut found = Vec::new();
        for entry in fs::read_dir(path).map_err(|e| MagicError::io(path, e))? {
            let entry = entry.map_err(|e| MagicError::io(path, e))?;
            let p = entry.path();
            if p.is_file() && is_compiled(&p) {
                found.push(p);
            }
        }
        found.sort();
        files.extend(found);
    }

    let mut dbs = Vec::with_capacity(files.len());
    for file in files {
        let db = magic_rules::load(&file).map_err(|e| MagicError::from_load(file.clone(), e))?;
        dbs.push(db);
    }
    Ok(SignatureDatabase::merge(dbs)?)
}

/// Rules at `paths`, compiled from source unless the file is a `.mgc`
/// image.
fn read_any(paths: &[PathBuf]) -> Result<SignatureDatabase> {
    let (compiled, sources): (Vec<PathBuf>, Vec<PathBuf>) =
        paths.iter().cloned().partition(|p| is_compiled(p));
    let mut dbs = Vec::new();
    if !sources.is_empty() {
        dbs.push(compile_files(&sources)?);
    }
    if !compiled.is_empty() {
        dbs.push(load_compiled(&compiled)?);
    }
    Ok(SignatureDatabase::merge(dbs)?)
}

fn check_sources(paths: Option<&[PathBuf]>) -> Result<Vec<String>> {
    let mut compiler = Compiler::new().with_check(true);
    match non_empty(paths) {
        Some(paths) => {
            for path in paths {
                compiler.add_path(path)?;
            }
        }
        None => {
            for (name, text) in BUILTIN_SOURCES {
                compiler.add_source(name, text)?;
            }
        }
    }
    let warnings = compiler.warnings().to_vec();
    compiler.finish()?;
    Ok(warnings)
}

fn non_empty(paths: Option<&[PathBuf]>) -> Option<&[PathBuf]> {
    paths.filter(|p| !p.is_empty())
}

/// Handle on the detection engine.
///
/// Detection methods take `&self` and may run concurrently; attaching,
/// releasing and reconfiguring take `&mut self`.
#[derive(Debug)]
pub struct Session {
    db: Option<Arc<SignatureDatabase>>,
    flags: MagicFlags,
    params: Params,
    last_error: Mutex<Option<LastError>>,
}

impl Session {
    /// New session without a database.
    pub fn open(flags: MagicFlags) -> Self {
        Self {
            db: None,
            flags,
            params: Params::default(),
            last_error: Mutex::new(None),
        }
    }

    /// Like [`Session::open`], from a raw flag word.
    pub fn open_raw(flags: u32) -> Result<Self> {
        Ok(Self::open(MagicFlags::from_raw(flags)?))
    }

    pub fn flags(&self) -> MagicFlags {
        self.flags
    }

    /// Replace the flags, returning the previous set.
    pub fn set_flags(&mut self, flags: MagicFlags) -> MagicFlags {
        self.clear_error();
        std::mem::replace(&mut self.flags, flags)
    }

    pub fn set_flags_raw(&mut self, flags: u32) -> Result<MagicFlags> {
        let flags = self.record(MagicFlags::from_raw(flags))?;
        Ok(self.set_flags(flags))
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn param(&self, param: Param) -> usize {
        self.params.get(param)
    }

    pub fn set_param(&mut self, param: Param, value: usize) -> Result<()> {
        let result = self.params.set(param, value);
        self.record(result)
    }

    pub fn is_loaded(&self) -> bool {
        self.db.is_some()
    }

    /// The attached database, shareable with other threads.
    pub fn database(&self) -> Option<Arc<SignatureDatabase>> {
        self.db.clone()
    }

    //  Attaching

    /// Attach precompiled databases, replacing the current one. `None`
    /// loads the default database. On failure the previous database stays
    /// attached.
    pub fn load(&mut self, paths: Option<&[PathBuf]>) -> Result<()> {
        let result = match non_empty(paths) {
            Some(paths) => load_compiled(paths),
            None => default_database(),
        };
        self.attach(result)
    }

    /// Compile rule sources and attach the result. `None` uses the
    /// built-in rules.
    pub fn load_source(&mut self, paths: Option<&[PathBuf]>) -> Result<()> {
        let result = match non_empty(paths) {
            Some(paths) => compile_files(paths).map_err(MagicError::from),
            None => builtin_database().map_err(MagicError::from),
        };
        self.attach(result)
    }

    /// Attach databases from in-memory compiled images.
    pub fn load_buffers(&mut self, buffers: &[&[u8]]) -> Result<()> {
        let result = buffers
            .iter()
            .enumerate()
            .map(|(i, buf)| {
                read_database(&mut &buf[..])
                    .map_err(|e| MagicError::from_load(PathBuf::from(format!("<buffer {i}>")), e))
            })
            .collect::<Result<Vec<_>>>()
            .and_then(|dbs| Ok(SignatureDatabase::merge(dbs)?));
        self.attach(result)
    }

    fn attach(&mut self, result: Result<SignatureDatabase>) -> Result<()> {
        let db = self.record(result)?;
        info!(
            entries = db.entries().len(),
            rules = db.rules().len(),
            "magic database attached"
        );
        self.db = Some(Arc::new(db));
        Ok(())
    }

    /// Detach the database. Later detections fail with `NotLoaded`.
    pub fn close(&mut self) {
        self.clear_error();
        if self.db.take().is_some() {
            debug!("magic database released");
        }
    }

    //  Database tools

    /// Compile each source into `<source>.mgc`. `None` writes the built-in
    /// rules to the default database path. Returns the files written.
    pub fn compile(&mut self, paths: Option<&[PathBuf]>) -> Result<Vec<PathBuf>> {
        let result = self.compile_inner(paths);
        self.record(result)
    }

    fn compile_inner(&self, paths: Option<&[PathBuf]>) -> Result<Vec<PathBuf>> {
        let check = self.flags.contains(MagicFlags::CHECK);
        let Some(paths) = non_empty(paths) else {
            let out = default_database_path();
            if let Some(dir) = out.parent() {
                fs::create_dir_all(dir).map_err(|e| MagicError::io(dir, e))?;
            }
            let mut compiler = Compiler::new().with_check(check);
            for (name, text) in BUILTIN_SOURCES {
                compiler.add_source(name, text)?;
            }
            magic_rules::save(&compiler.finish()?, &out)?;
            return Ok(vec![out]);
        };

        let mut compiled = Vec::with_capacity(paths.len());
        for path in paths {
            let mut compiler = Compiler::new().with_check(check);
            compiler.add_path(path)?;
            compiled.push((path, compiler.finish()?));
        }

        let mut written = Vec::with_capacity(compiled.len());
        for (path, db) in compiled {
            let out = compiled_path(path);
            if let Err(e) = magic_rules::save(&db, &out) {
                for done in &written {
                    let _ = fs::remove_file(done);
                }
                return Err(e.into());
            }
            info!(source = %path.display(), output = %out.display(), "compiled magic");
            written.push(out);
        }
        Ok(written)
    }

    /// Parse rule sources in lint mode without attaching anything. Returns
    /// the lint warnings.
    pub fn check(&mut self, paths: Option<&[PathBuf]>) -> Result<Vec<String>> {
        let result = check_sources(paths);
        self.record(result)
    }

    /// Summarise the rules at `paths` (sources or `.mgc` images), or the
    /// attached database, or the default one.
    pub fn list(&mut self, paths: Option<&[PathBuf]>) -> Result<DatabaseStats> {
        let result = match (non_empty(paths), &self.db) {
            (Some(paths), _) => read_any(paths).map(|db| db.stats()),
            (None, Some(db)) => Ok(db.stats()),
            (None, None) => default_database().map(|db| db.stats()),
        };
        self.record(result)
    }

    //  Detection

    /// Identify the file at `path`.
    pub fn file(&self, path: impl AsRef<Path>) -> Result<Detection> {
        let result = self.detect_path(path.as_ref());
        self.record(result)
    }

    /// Identify an in-memory buffer.
    pub fn buffer(&self, buf: &[u8]) -> Result<Detection> {
        let result = self.engine_db().map(|db| self.engine(&db).detect(buf));
        self.record(result)
    }

    /// Identify the content readable from an open descriptor. The
    /// descriptor is not closed and a seekable one keeps its position.
    #[cfg(unix)]
    pub fn descriptor(&self, fd: impl std::os::fd::AsFd) -> Result<Detection> {
        use std::os::fd::AsRawFd;

        let fd = fd.as_fd();
        let result = self.engine_db().and_then(|db| {
            let buf = source::read_descriptor(fd, self.params.bytes_max).map_err(|e| {
                MagicError::io(format!("<descriptor {}>", fd.as_raw_fd()), e)
            })?;
            Ok(self.engine(&db).detect(&buf))
        });
        self.record(result)
    }

    fn engine_db(&self) -> Result<Arc<SignatureDatabase>> {
        self.db.clone().ok_or(MagicError::NotLoaded)
    }

    fn engine<'a>(&'a self, db: &'a SignatureDatabase) -> Engine<'a> {
        Engine::new(db, self.flags, &self.params)
    }

    fn detect_path(&self, path: &Path) -> Result<Detection> {
        let db = self.engine_db()?;
        let follow = self.flags.contains(MagicFlags::SYMLINK);
        let meta = if follow {
            fs::metadata(path)
        } else {
            fs::symlink_metadata(path)
        }
        .map_err(|e| MagicError::io(path, e))?;

        let file_type = meta.file_type();
        if file_type.is_symlink() {
            let target = fs::read_link(path).map_err(|e| MagicError::io(path, e))?;
            let desc = format!("symbolic link to {}", target.display());
            return Ok(engine::special(self.flags, &desc, "inode/symlink"));
        }
        if file_type.is_dir() {
            return Ok(engine::special(self.flags, "directory", "inode/directory"));
        }
        #[cfg(unix)]
        if !self.flags.contains(MagicFlags::DEVICES) {
            use std::os::unix::fs::FileTypeExt;
            let special = if file_type.is_char_device() {
                Some(("character special", "inode/chardevice"))
            } else if file_type.is_block_device() {
                Some(("block special", "inode/blockdevice"))
            } else if file_type.is_fifo() {
                Some(("fifo (named pipe)", "inode/fifo"))
            } else if file_type.is_socket() {
                Some(("socket", "inode/socket"))
            } else {
                None
            };
            if let Some((desc, mime)) = special {
                return Ok(engine::special(self.flags, desc, mime));
            }
        }

        let mut file = File::open(path).map_err(|e| MagicError::io(path, e))?;
        let atime = if self.flags.contains(MagicFlags::PRESERVE_ATIME) {
            file.metadata().and_then(|m| m.accessed()).ok()
        } else {
            None
        };
        let buf = source::read_prefix(&mut file, self.params.bytes_max)
            .map_err(|e| MagicError::io(path, e))?;
        if let Some(accessed) = atime {
            if let Err(e) = file.set_times(FileTimes::new().set_accessed(accessed)) {
                debug!(path = %path.display(), error = %e, "could not restore access time");
            }
        }

        let detection = self.engine(&db).detect(&buf);
        debug!(path = %path.display(), bytes = buf.len(), result = %detection, "identified");
        Ok(detection)
    }

    //  Errors

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<LastError>> {
        self.last_error.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record<T>(&self, result: Result<T>) -> Result<T> {
        *self.slot() = result.as_ref().err().map(LastError::from);
        result
    }

    fn clear_error(&self) {
        *self.slot() = None;
    }

    /// Failure of the most recent operation, if it failed.
    pub fn last_error(&self) -> Option<LastError> {
        self.slot().clone()
    }

    /// Message of the most recent failure.
    pub fn error(&self) -> Option<String> {
        self.slot().as_ref().map(|e| e.message.clone())
    }

    /// OS error number of the most recent failure, `0` when there is none.
    pub fn errno(&self) -> i32 {
        self.slot().as_ref().and_then(|e| e.os_code).unwrap_or(0)
    }
}
