//! `$MAGIC` selects the default database. Kept in its own test binary
//! because it changes the process environment.

use magic_core::{MAGIC_ENV, MagicFlags, Session, default_database_path};

#[test]
fn test_default_database_follows_magic_env() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("nested").join("magic.mgc");
    let value = format!("{}:/unused/second.mgc", target.display());
    // SAFETY: this binary runs a single test, so no other thread reads the
    // environment concurrently.
    unsafe { std::env::set_var(MAGIC_ENV, value) };
    assert_eq!(default_database_path(), target);

    // Nothing installed yet: the built-in rules are used.
    let mut session = Session::open(MagicFlags::MIME_TYPE);
    session.load(None).unwrap();
    assert_eq!(session.buffer(b"%PDF-1.4").unwrap().as_str(), "application/pdf");

    let written = session.compile(None).unwrap();
    assert_eq!(written, vec![target.clone()]);
    assert!(target.is_file());

    let mut from_disk = Session::open(MagicFlags::MIME_TYPE);
    from_disk.load(None).unwrap();
    assert_eq!(from_disk.buffer(b"%PDF-1.4").unwrap().as_str(), "application/pdf");

    std::fs::write(&target, b"garbage").unwrap();
    assert!(from_disk.load(None).is_err());
    assert!(from_disk.is_loaded());
}
