//! Basic usage of a shmkv pool

use shmkv::{Pool, PoolOptions, Result};
use std::env;

fn main() -> Result<()> {
    // Initialize logging
    env_logger::init();

    println!("shmkv Shared Memory Pool Example");
    println!("================================");

    // Keep the demo pool out of the system-wide namespace root
    let root = env::temp_dir().join("shmkv-demo");
    let options = PoolOptions::namespace("basic_usage")
        .with_namespace_root(&root)
        .with_size_mb(8.0);

    let mut pool = Pool::create_or_open(options.clone())?;
    println!("Pool ready at {}", pool.path().display());

    // Store a few values
    pool.set(b"greeting", b"hello from shmkv")?;
    pool.set(b"answer", b"42")?;
    for i in 0..1000 {
        pool.set(format!("item:{}", i).as_bytes(), &[i as u8; 32])?;
    }
    println!("Stored {} entries", pool.size()?);

    // Read them back
    if let Some(value) = pool.get(b"greeting")? {
        println!("  greeting = {}", String::from_utf8_lossy(&value));
    }

    // Replace and delete
    pool.set(b"answer", b"forty-two")?;
    println!("  answer   = {:?}", pool.get(b"answer")?.map(String::from_utf8));
    println!("  deleted item:0 -> {}", pool.delete(b"item:0")?);
    println!("  deleted item:0 again -> {}", pool.delete(b"item:0")?);

    println!("\nMemory usage:");
    println!("{}", pool.status()?);
    println!("Consistent: {}", pool.check_consistency()?);

    pool.clear()?;
    println!("\nAfter clear: {} entries", pool.size()?);

    pool.close()?;
    Pool::drop_pool(&options, false)?;
    println!("Pool dropped");

    Ok(())
}
