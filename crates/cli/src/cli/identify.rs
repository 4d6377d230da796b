use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use magic_core::{Detection, MAGIC_ENV, Param, Session};
use tracing::debug;

use crate::cli::{IdentifyArgs, optional_paths};
use crate::config::AppConfig;

const STDIN_NAME: &str = "/dev/stdin";

pub async fn execute(args: IdentifyArgs) -> anyhow::Result<()> {
    if args.files.is_empty() {
        anyhow::bail!("No files given (see --help)");
    }
    let config = AppConfig::load_or_default()?;
    let mut session = Session::open(args.flags(&config)?);
    if let Some(limit) = args.bytes_max.or(config.bytes_max) {
        session.set_param(Param::BytesMax, limit)?;
    }
    load_database(&mut session, &args, &config)?;
    let session = Arc::new(session);

    let mut tasks = Vec::with_capacity(args.files.len());
    for path in args.files.iter().cloned() {
        let session = Arc::clone(&session);
        tasks.push(tokio::task::spawn_blocking(move || {
            let outcome = identify(&session, &path);
            (display_name(&path), outcome)
        }));
    }

    let brief = args.brief || config.brief;
    let mut failed = 0usize;
    let mut report = Vec::new();
    for task in tasks {
        let (name, outcome) = task.await?;
        match outcome {
            Ok(detection) if args.json => {
                report.push(serde_json::json!({ "file": name, "result": detection }));
            }
            Ok(detection) if brief => println!("{detection}"),
            Ok(detection) => println!("{name}: {detection}"),
            Err(e) => {
                failed += 1;
                if args.json {
                    report.push(serde_json::json!({ "file": name, "error": format!("{e:#}") }));
                } else {
                    eprintln!("{name}: {e:#}");
                }
            }
        }
    }
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} file(s) could not be identified", args.files.len());
    }
    Ok(())
}

/// `-m` wins over `$MAGIC`, which wins over the configured paths.
fn load_database(
    session: &mut Session,
    args: &IdentifyArgs,
    config: &AppConfig,
) -> anyhow::Result<()> {
    let paths: &[PathBuf] = if !args.magic_files.is_empty() {
        &args.magic_files
    } else if std::env::var_os(MAGIC_ENV).is_some() {
        &[]
    } else {
        &config.magic_paths
    };
    match optional_paths(paths) {
        None => session.load(None)?,
        Some(paths) if paths.iter().all(|p| is_compiled(p)) => session.load(Some(paths))?,
        Some(paths) => session.load_source(Some(paths))?,
    }
    Ok(())
}

fn is_compiled(path: &Path) -> bool {
    path.is_dir() || path.extension().is_some_and(|ext| ext == "mgc")
}

fn is_stdin(path: &Path) -> bool {
    path.as_os_str() == "-"
}

fn display_name(path: &Path) -> String {
    if is_stdin(path) {
        STDIN_NAME.to_string()
    } else {
        path.display().to_string()
    }
}

fn identify(session: &Session, path: &Path) -> anyhow::Result<Detection> {
    debug!(path = %path.display(), "identifying");
    if is_stdin(path) {
        let mut data = Vec::new();
        std::io::stdin().lock().read_to_end(&mut data)?;
        return Ok(session.buffer(&data)?);
    }
    Ok(session.file(path)?)
}

#[cfg(test)]
mod tests {
    use magic_core::MagicFlags;

    use super::*;

    #[test]
    fn test_compiled_paths() {
        let dir = tempfile::tempdir().unwrap();
        assert!(is_compiled(dir.path()));
        assert!(is_compiled(Path::new("/nowhere/magic.mgc")));
        assert!(!is_compiled(Path::new("/nowhere/magic")));
    }

    #[test]
    fn test_stdin_name() {
        assert_eq!(display_name(Path::new("-")), STDIN_NAME);
        assert_eq!(display_name(Path::new("a/b.txt")), "a/b.txt");
    }

    #[test]
    fn test_magic_file_sources_are_compiled() {
        let dir = tempfile::tempdir().unwrap();
        let rules = dir.path().join("rules");
        std::fs::write(&rules, "0\tstring\tHELLO\thello file\n").unwrap();
        let sample = dir.path().join("sample");
        std::fs::write(&sample, "HELLO there").unwrap();

        let args = IdentifyArgs {
            magic_files: vec![rules],
            ..IdentifyArgs::default()
        };
        let mut session = Session::open(MagicFlags::NONE);
        load_database(&mut session, &args, &AppConfig::default()).unwrap();
        let detection = identify(&session, &sample).unwrap();
        assert_eq!(detection.as_str(), "hello file");
        assert!(identify(&session, &dir.path().join("missing")).is_err());
    }
}
