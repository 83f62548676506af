//! # Session Roundtrip Example
//!
//! Stores identity state and a user list, then walks through the key
//! lifecycle a host application has to react to:
//! 1. Presence window lapses, writes are withheld until the user re-authenticates
//! 2. Enrollment changes, the key is destroyed and data stored under it is gone
//! 3. Clearing a store
//!
//! Run with `RUST_LOG=credstore=debug` to see the store's own logging.

use std::sync::Arc;

use credstore::{
    EventReceiver, MemoryKeystore, SecureStore, StoreConfig, StoreId, WriteOutcome,
};
use tracing_subscriber::EnvFilter;

fn print_events(rx: &EventReceiver) {
    for event in rx.drain() {
        println!("  event: {event}");
    }
}

pub fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let root = "tmp/session_demo";
    if std::path::Path::new(root).exists() {
        std::fs::remove_dir_all(root).expect("Failed to remove existing demo path");
    }

    let keystore = Arc::new(MemoryKeystore::new());
    let config = StoreConfig::new(root);
    let mut store =
        SecureStore::open(&config, keystore.clone()).expect("Failed to open secure store");
    let events = store.subscribe();

    println!("=== Secure Store Demo ===\n");

    let user = StoreId::user();
    let mpin = StoreId::mpin();
    store
        .write(&user, br#"[{"id":"alice@example.com"}]"#)
        .expect("Failed to write user list");
    store
        .write(&mpin, b"identity-state-v1")
        .expect("Failed to write identity state");

    let users = store.read(&user).expect("Failed to read user list");
    println!("user list: {}", String::from_utf8_lossy(&users));

    println!("\n-- presence window lapses --");
    keystore.presence().revoke_presence();
    let outcome = store
        .write(&mpin, b"identity-state-v2")
        .expect("Failed to write identity state");
    assert_eq!(outcome, WriteOutcome::Withheld);
    println!("write {outcome:?}: {}", store.last_error().unwrap_or("-"));
    print_events(&events);

    keystore.presence().confirm_presence();
    let identity = store.read(&mpin).expect("Failed to read identity state");
    println!("after re-auth: {}", String::from_utf8_lossy(&identity));

    println!("\n-- new fingerprint enrolled --");
    keystore.presence().enroll(b"fingerprint #2");
    let identity = store.read(&mpin).expect("Failed to read identity state");
    println!("identity state after invalidation: {} bytes", identity.len());
    print_events(&events);

    let outcome = store
        .write(&mpin, b"identity-state-fresh")
        .expect("Failed to write identity state");
    println!("re-registered: {outcome:?}");

    println!("\n-- clearing --");
    store.clear(&user).expect("Failed to clear user list");
    print_events(&events);

    println!("\n=== Done ===");
}
