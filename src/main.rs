use arbor::{CursorMode, DbType, EnvFlags, Environment, OpenFlags, Result};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("arbor=info")),
        )
        .init();

    println!("{} - an embedded ordered key-value store", arbor::version());
    println!("=====================================================\n");

    // Scratch directory for the demonstration
    let home = std::env::temp_dir().join(format!("arbor-demo-{}", std::process::id()));
    std::fs::create_dir_all(&home)?;

    let env = Environment::new();
    env.open(&home, EnvFlags::CREATE | EnvFlags::INIT_MPOOL, 0)?;
    println!("Opened environment at {}", home.display());

    let db = env.open_database("demo.db", None, DbType::BTree, OpenFlags::CREATE)?;
    for i in 0..1000u32 {
        let key = format!("key-{:05}", i);
        let value = format!("value number {}", i);
        db.put(key.as_bytes(), value.as_bytes())?;
    }
    for i in (0..1000u32).step_by(3) {
        db.delete(format!("key-{:05}", i).as_bytes())?;
    }
    db.check()?;

    let stat = db.stat()?;
    println!("\nDatabase stats:");
    println!("  - Entries: {}", stat.entries);
    println!("  - Height: {}", stat.height);
    println!("  - Pages: {} ({} free)", stat.page_count, stat.free_pages);

    println!("\nFirst five entries:");
    let mut cursor = db.cursor()?;
    let mut mode = CursorMode::First;
    for _ in 0..5 {
        let Some((key, value)) = cursor.get(mode)? else {
            break;
        };
        println!(
            "  - {} => {}",
            String::from_utf8_lossy(&key),
            String::from_utf8_lossy(&value)
        );
        mode = CursorMode::Next;
    }

    db.close()?;

    // Reopen and confirm the deletes stuck
    let db = env.open_database("demo.db", None, DbType::Unknown, OpenFlags::empty())?;
    match db.get(b"key-00003") {
        Err(err) if err.is_not_found() => println!("\nkey-00003 stays deleted after reopen"),
        Err(err) => return Err(err),
        Ok(_) => println!("\nkey-00003 unexpectedly survived"),
    }
    println!("Entries after reopen: {}", db.len()?);
    db.close()?;
    env.close()?;

    // Clean up
    std::fs::remove_dir_all(&home)?;
    println!("\nDemo completed successfully!");
    Ok(())
}
