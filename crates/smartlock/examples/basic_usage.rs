//! Basic usage example for smartlock.
//!
//! This example walks through the core API against a local store:
//! - Opening a handle with a principal
//! - Issuing a remote unlock and watching the unlock status
//! - Enrolling, blocking and deleting an RFID tag
//! - Recording a knock pattern
//! - Opening the access log view
//! - Closing the handle
//!
//! Run with: cargo run --example basic_usage

use std::time::Duration;

use smartlock::{Config, DeleteTarget, SmartLock};

/// Wait until the mirrors satisfy `cond`, or give up after two seconds.
async fn wait_for(lock: &SmartLock, cond: impl Fn(&SmartLock) -> bool) {
    let mut changes = lock.changes();
    let _ = tokio::time::timeout(Duration::from_secs(2), async {
        while !cond(lock) {
            if changes.changed().await.is_err() {
                break;
            }
        }
    })
    .await;
}

#[tokio::main]
async fn main() -> smartlock::Result<()> {
    tracing_subscriber::fmt::init();

    println!("=== smartlock Basic Usage Example ===\n");

    // -------------------------------------------------------------------------
    // Step 1: Open the handle
    // -------------------------------------------------------------------------
    println!("1. Opening smart lock...");

    // A temporary local store; point `with_store_url` at a REST store instead
    // to talk to a real device backend
    let storage_path = std::env::temp_dir().join("smartlock-example");
    println!("   Storage path: {}", storage_path.display());

    let config = Config::new(&storage_path)
        .with_principal("owner")
        .with_unlock_hold(1);
    let lock = SmartLock::open(config).await?;
    println!("   Principal: {:?}\n", lock.principal().map(|p| p.to_string()));

    // -------------------------------------------------------------------------
    // Step 2: Remote unlock
    // -------------------------------------------------------------------------
    println!("2. Issuing remote unlock...");
    let mut status = lock.watch_unlock();
    lock.issue_unlock().await?;
    println!("   Status: {:?}", *status.borrow_and_update());
    let _ = tokio::time::timeout(Duration::from_secs(3), status.changed()).await;
    println!("   Status after hold: {:?}\n", lock.unlock_state());

    // -------------------------------------------------------------------------
    // Step 3: Keys
    // -------------------------------------------------------------------------
    println!("3. Enrolling an RFID tag...");
    let id = lock.enroll_key("A3B4C5", "Mom").await?;
    wait_for(&lock, |l| l.keys().iter().any(|k| k.id == id)).await;
    println!("   Enrolled {id}");

    let blocked = lock.toggle_key_blocked(&id).await?;
    println!("   Blocked: {blocked}");

    let token = lock.request_delete(DeleteTarget::Key(id.clone()))?;
    println!("   Prompt: {}", token.prompt());
    lock.confirm_delete(&token).await?;
    wait_for(&lock, |l| l.keys().iter().all(|k| k.id != id)).await;
    println!("   Deleted, {} keys left\n", lock.keys().len());

    // -------------------------------------------------------------------------
    // Step 4: Knock pattern
    // -------------------------------------------------------------------------
    println!("4. Recording a knock pattern...");
    if lock.patterns().len() < lock.config().max_patterns {
        lock.start_recording()?;
        for t in [0, 400, 900] {
            lock.record_tap_at(t);
        }
        println!("   Taps: {}", lock.tap_count());
        let id = lock.stop_and_save("Double").await?;
        wait_for(&lock, |l| l.patterns().iter().any(|p| p.id == id)).await;
    }
    for pattern in lock.patterns() {
        println!("   {} {:?}", pattern.name, pattern.intervals);
    }
    println!();

    // -------------------------------------------------------------------------
    // Step 5: Access log
    // -------------------------------------------------------------------------
    println!("5. Opening the access log...");
    for entry in lock.open_log_view().await?.iter().take(10) {
        println!("   {:?} {} {}", entry.timestamp, entry.kind, entry.detail);
    }
    println!();

    // -------------------------------------------------------------------------
    // Step 6: Close
    // -------------------------------------------------------------------------
    println!("6. Closing...");
    lock.close().await?;
    println!("   Done.");

    Ok(())
}
