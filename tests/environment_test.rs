//! Integration tests for environments

use arbor::{
    ArborError, Database, DbConfig, DbType, EnvConfig, EnvFlags, Environment, OpenFlags,
};
use tempfile::TempDir;

fn open_env(dir: &TempDir) -> Environment {
    let env = Environment::with_config(EnvConfig::new().cache_pages(32));
    env.open(dir.path(), EnvFlags::CREATE | EnvFlags::INIT_MPOOL, 0)
        .unwrap();
    env
}

#[test]
fn test_env_open_missing_home() {
    let dir = TempDir::new().unwrap();
    let env = Environment::new();

    let err = env
        .open(dir.path().join("missing"), EnvFlags::INIT_MPOOL, 0)
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(!env.is_open());
}

#[test]
fn test_env_create_makes_home() {
    let dir = TempDir::new().unwrap();
    let home = dir.path().join("fresh");
    let env = Environment::new();

    env.open(&home, EnvFlags::CREATE | EnvFlags::INIT_MPOOL, 0)
        .unwrap();
    assert!(home.is_dir());
    let db = env
        .open_database("a.db", None, DbType::BTree, OpenFlags::CREATE)
        .unwrap();
    db.put(b"k", b"v").unwrap();
    db.close().unwrap();
    assert!(home.join("a.db").is_file());
    env.close().unwrap();

    // Only the last component is created.
    let deep = dir.path().join("x").join("y");
    let err = Environment::new()
        .open(&deep, EnvFlags::CREATE | EnvFlags::INIT_MPOOL, 0)
        .unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn test_env_open_file_as_home() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("plain");
    std::fs::write(&file, b"x").unwrap();

    let env = Environment::new();
    assert!(matches!(
        env.open(&file, EnvFlags::INIT_MPOOL, 0),
        Err(ArborError::InvalidArgument(_))
    ));
}

#[test]
fn test_env_open_twice() {
    let dir = TempDir::new().unwrap();
    let env = open_env(&dir);

    assert!(matches!(
        env.open(dir.path(), EnvFlags::INIT_MPOOL, 0),
        Err(ArborError::InvalidArgument(_))
    ));
    assert_eq!(env.home().unwrap(), dir.path().canonicalize().unwrap());
    assert_eq!(env.cache_pages(), Some(32));
}

#[test]
fn test_env_requires_mpool() {
    let dir = TempDir::new().unwrap();
    let env = Environment::new();
    env.open(dir.path(), EnvFlags::CREATE, 0).unwrap();

    let result = env.open_database("a.db", None, DbType::BTree, OpenFlags::CREATE);
    assert!(matches!(result, Err(ArborError::InvalidArgument(_))));
    assert_eq!(env.cache_pages(), None);
}

#[test]
fn test_env_not_open() {
    let env = Environment::new();
    let result = env.open_database("a.db", None, DbType::BTree, OpenFlags::CREATE);
    assert!(matches!(result, Err(ArborError::InvalidArgument(_))));
    assert!(matches!(env.close(), Err(ArborError::InvalidArgument(_))));
}

#[test]
fn test_env_databases_share_pool() {
    let dir = TempDir::new().unwrap();
    let env = open_env(&dir);

    let small = env
        .open_database_with_config(
            "small.db",
            None,
            DbType::BTree,
            OpenFlags::CREATE,
            DbConfig::new().page_size(512),
        )
        .unwrap();
    let large = env
        .open_database("large.db", None, DbType::BTree, OpenFlags::CREATE)
        .unwrap();
    assert_eq!(env.open_handles(), 2);

    for i in 0..1000u32 {
        small.put(&i.to_be_bytes(), b"small").unwrap();
        large.put(&i.to_be_bytes(), b"large").unwrap();
    }
    for i in 0..1000u32 {
        assert_eq!(&small.get(&i.to_be_bytes()).unwrap()[..], b"small");
        assert_eq!(&large.get(&i.to_be_bytes()).unwrap()[..], b"large");
    }
    small.check().unwrap();
    large.check().unwrap();
    assert_eq!(small.stat().unwrap().page_size, 512);

    assert!(dir.path().join("small.db").exists());
    assert!(dir.path().join("large.db").exists());
}

#[test]
fn test_env_close_busy_with_open_handles() {
    let dir = TempDir::new().unwrap();
    let env = open_env(&dir);

    let db = env
        .open_database("busy.db", None, DbType::BTree, OpenFlags::CREATE)
        .unwrap();
    db.put(b"k", b"v").unwrap();
    assert!(matches!(env.close(), Err(ArborError::ResourceBusy(_))));
    assert!(env.is_open());

    db.close().unwrap();
    assert_eq!(env.open_handles(), 0);
    env.close().unwrap();
    assert!(!env.is_open());

    // The data outlives the environment
    let env = open_env(&dir);
    let db = env
        .open_database("busy.db", None, DbType::Unknown, OpenFlags::empty())
        .unwrap();
    assert_eq!(&db.get(b"k").unwrap()[..], b"v");
}

#[test]
fn test_env_rename_and_remove() {
    let dir = TempDir::new().unwrap();
    let env = open_env(&dir);

    let db = env
        .open_database("x.db", None, DbType::BTree, OpenFlags::CREATE)
        .unwrap();
    assert!(matches!(
        env.remove_database("x.db"),
        Err(ArborError::ResourceBusy(_))
    ));
    db.close().unwrap();

    env.rename_database("x.db", "y.db").unwrap();
    env.remove_database("y.db").unwrap();
    assert!(env.remove_database("x.db").unwrap_err().is_not_found());
}

#[cfg(unix)]
#[test]
fn test_env_file_mode() {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().unwrap();
    let env = Environment::new();
    env.open(dir.path(), EnvFlags::INIT_MPOOL, 0o600).unwrap();

    let db = env
        .open_database("private.db", None, DbType::BTree, OpenFlags::CREATE)
        .unwrap();
    db.close().unwrap();

    let mode = std::fs::metadata(dir.path().join("private.db"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[test]
fn test_env_rejects_file_open_in_another_pool() {
    let dir = TempDir::new().unwrap();
    let env = open_env(&dir);

    let standalone =
        Database::open(dir.path().join("solo.db"), None, DbType::BTree, OpenFlags::CREATE)
            .unwrap();
    assert!(matches!(
        env.open_database("solo.db", None, DbType::BTree, OpenFlags::empty()),
        Err(ArborError::ResourceBusy(_))
    ));
    assert_eq!(env.open_handles(), 0);
    standalone.close().unwrap();

    // Inside the environment a standalone open joins the shared pool's file.
    let shared = env
        .open_database("solo.db", None, DbType::BTree, OpenFlags::empty())
        .unwrap();
    let joined =
        Database::open(dir.path().join("solo.db"), None, DbType::BTree, OpenFlags::empty())
            .unwrap();
    shared.put(b"k", b"v").unwrap();
    assert_eq!(&joined.get(b"k").unwrap()[..], b"v");
    joined.close().unwrap();
    shared.close().unwrap();
    env.close().unwrap();
}
