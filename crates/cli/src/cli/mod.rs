pub mod config_cmd;
pub mod db;
pub mod identify;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use magic_core::MagicFlags;

use crate::config::AppConfig;

#[derive(Parser)]
#[command(
    name = "filemagic",
    version,
    about = "Identify file types from their content",
    args_conflicts_with_subcommands = true
)]
pub struct Cli {
    #[command(flatten)]
    pub identify: IdentifyArgs,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, clap::Args, Clone, Default)]
pub struct IdentifyArgs {
    /// Files to identify; `-` reads standard input.
    pub files: Vec<PathBuf>,

    /// Magic database or rule source to use (can be repeated).
    #[arg(short = 'm', long = "magic-file", value_name = "PATH")]
    pub magic_files: Vec<PathBuf>,

    /// Print MIME type and encoding, e.g. `text/plain; charset=us-ascii`.
    #[arg(short = 'i', long)]
    pub mime: bool,

    #[arg(long)]
    pub mime_type: bool,

    #[arg(long)]
    pub mime_encoding: bool,

    /// Print the usual file name extensions, slash separated.
    #[arg(long)]
    pub extension: bool,

    /// Print the Apple creator/type code.
    #[arg(long)]
    pub apple: bool,

    /// Report every match, not just the first.
    #[arg(short = 'k', long)]
    pub keep_going: bool,

    /// Don't escape unprintable characters.
    #[arg(short = 'r', long)]
    pub raw: bool,

    /// Follow symbolic links.
    #[arg(short = 'L', long)]
    pub dereference: bool,

    /// Read block and character devices.
    #[arg(short = 's', long)]
    pub special_files: bool,

    /// Look inside compressed files.
    #[arg(short = 'z', long)]
    pub uncompress: bool,

    /// Restore access times after reading.
    #[arg(short = 'p', long)]
    pub preserve_date: bool,

    /// Skip a test category (soft, tar, compress, elf, apptype, text, json, ...).
    #[arg(short = 'e', long = "exclude", value_name = "TEST")]
    pub exclude: Vec<String>,

    /// Don't prefix output lines with file names.
    #[arg(short = 'b', long)]
    pub brief: bool,

    /// Trace rule evaluation.
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Print results as JSON.
    #[arg(long)]
    pub json: bool,

    /// Bytes inspected per file.
    #[arg(long, env = "FILEMAGIC_BYTES_MAX")]
    pub bytes_max: Option<usize>,
}

impl IdentifyArgs {
    /// Detection flags for these arguments, with `config` exclusions applied.
    pub fn flags(&self, config: &AppConfig) -> anyhow::Result<MagicFlags> {
        let switches = [
            (self.mime, MagicFlags::MIME),
            (self.mime_type, MagicFlags::MIME_TYPE),
            (self.mime_encoding, MagicFlags::MIME_ENCODING),
            (self.extension, MagicFlags::EXTENSION),
            (self.apple, MagicFlags::APPLE),
            (self.keep_going, MagicFlags::CONTINUE),
            (self.raw, MagicFlags::RAW),
            (self.dereference, MagicFlags::SYMLINK),
            (self.special_files, MagicFlags::DEVICES),
            (self.uncompress, MagicFlags::COMPRESS),
            (self.preserve_date, MagicFlags::PRESERVE_ATIME),
            (self.debug, MagicFlags::DEBUG),
        ];
        let mut flags = MagicFlags::NONE;
        for (on, flag) in switches {
            if on {
                flags |= flag;
            }
        }
        for name in self.exclude.iter().chain(&config.exclude) {
            match MagicFlags::from_exclude(name) {
                Some(flag) => flags |= flag,
                None => anyhow::bail!("Unknown test name: {name}"),
            }
        }
        Ok(flags)
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Compile rule sources into `<source>.mgc` images.
    Compile(PathsArgs),
    /// Parse and lint rule sources without writing anything.
    Check(PathsArgs),
    /// Show the entries of a database in evaluation order.
    List(ListArgs),
    /// Print the default database location.
    Path,
    /// View or modify configuration.
    Config(ConfigArgs),
}

#[derive(Debug, clap::Args)]
pub struct PathsArgs {
    /// Rule sources; the default database when omitted.
    pub paths: Vec<PathBuf>,
}

#[derive(Debug, clap::Args)]
pub struct ListArgs {
    /// Databases or rule sources; the default database when omitted.
    pub paths: Vec<PathBuf>,

    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, clap::Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Show current configuration.
    Show,
    /// Set a configuration value.
    Set {
        /// Key: magic_paths, exclude, bytes_max, brief.
        key: String,
        value: String,
    },
}

/// `None` when no paths were given, so the library picks its default.
pub(crate) fn optional_paths(paths: &[PathBuf]) -> Option<&[PathBuf]> {
    (!paths.is_empty()).then_some(paths)
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_command_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_files_without_subcommand() {
        let cli = Cli::try_parse_from(["filemagic", "-i", "-b", "a.pdf", "-"]).unwrap();
        assert!(cli.command.is_none());
        assert!(cli.identify.mime && cli.identify.brief);
        assert_eq!(
            cli.identify.files,
            vec![PathBuf::from("a.pdf"), PathBuf::from("-")]
        );
    }

    #[test]
    fn test_subcommands() {
        let cli = Cli::try_parse_from(["filemagic", "list", "--json", "x.mgc"]).unwrap();
        match cli.command {
            Some(Commands::List(args)) => {
                assert!(args.json);
                assert_eq!(args.paths, vec![PathBuf::from("x.mgc")]);
            }
            _ => panic!("expected list"),
        }
        let cli = Cli::try_parse_from(["filemagic", "config", "set", "brief", "true"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Config(ConfigArgs { action: ConfigAction::Set { .. } }))
        ));
    }

    #[test]
    fn test_flags_from_switches() {
        let cli = Cli::try_parse_from(["filemagic", "-z", "-k", "-e", "tar", "--mime-type", "f"])
            .unwrap();
        let flags = cli.identify.flags(&AppConfig::default()).unwrap();
        assert_eq!(
            flags,
            MagicFlags::COMPRESS
                | MagicFlags::CONTINUE
                | MagicFlags::NO_CHECK_TAR
                | MagicFlags::MIME_TYPE
        );
    }

    #[test]
    fn test_flags_merge_config_exclusions() {
        let config = AppConfig {
            exclude: vec!["compress".into()],
            ..AppConfig::default()
        };
        let args = IdentifyArgs {
            exclude: vec!["soft".into()],
            ..IdentifyArgs::default()
        };
        let flags = args.flags(&config).unwrap();
        assert_eq!(flags, MagicFlags::NO_CHECK_SOFT | MagicFlags::NO_CHECK_COMPRESS);

        let bad = IdentifyArgs {
            exclude: vec!["bogus".into()],
            ..IdentifyArgs::default()
        };
        assert!(bad.flags(&config).is_err());
    }
}
