use magic_core::{MagicFlags, Session, default_database_path};

use crate::cli::{ListArgs, PathsArgs, optional_paths};

pub async fn compile(args: PathsArgs) -> anyhow::Result<()> {
    let mut session = Session::open(MagicFlags::NONE);
    for path in session.compile(optional_paths(&args.paths))? {
        println!("{}", path.display());
    }
    Ok(())
}

pub async fn check(args: PathsArgs) -> anyhow::Result<()> {
    let mut session = Session::open(MagicFlags::CHECK);
    let warnings = session.check(optional_paths(&args.paths))?;
    for warning in &warnings {
        println!("{warning}");
    }
    println!("{} warning(s)", warnings.len());
    Ok(())
}

pub async fn list(args: ListArgs) -> anyhow::Result<()> {
    let mut session = Session::open(MagicFlags::NONE);
    let stats = session.list(optional_paths(&args.paths))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!(
        "{:<8} {:<10} {:<48} {}",
        "STRENGTH", "CATEGORY", "DESCRIPTION", "MIME"
    );
    println!("{}", "-".repeat(90));
    for entry in &stats.listing {
        println!(
            "{:<8} {:<10} {:<48} {}",
            entry.strength,
            entry.category.as_str(),
            truncate(&entry.description, 48),
            entry.mime.as_deref().unwrap_or("-"),
        );
    }
    println!();
    println!(
        "{} entries, {} rules, {} named",
        stats.entries, stats.rules, stats.named
    );
    for (category, count) in &stats.categories {
        println!("  {category:<10} {count}");
    }
    Ok(())
}

pub async fn path() -> anyhow::Result<()> {
    let path = default_database_path();
    let state = if path.is_file() { "" } else { " (not installed, using built-in rules)" };
    println!("{}{state}", path.display());
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}
