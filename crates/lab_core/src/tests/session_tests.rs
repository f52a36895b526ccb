use super::*;

use std::{
    env,
    time::{SystemTime, UNIX_EPOCH},
};

#[test]
fn minted_identity_is_reused_until_cleared() {
    let store = MemorySessionStore::default();
    let first = load_or_mint_client_id(&store, "dashboard_");
    let second = load_or_mint_client_id(&store, "dashboard_");
    assert!(first.starts_with("dashboard_"));
    assert_eq!(first, second);

    store.clear().expect("clear");
    let third = load_or_mint_client_id(&store, "dashboard_");
    assert_ne!(first, third);
}

#[test]
fn file_store_round_trips_and_clears() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let root = env::temp_dir().join(format!("lab_dashboard_session_test_{suffix}"));
    let store = FileSessionStore::new(root.join("nested").join("client_id"));

    assert_eq!(store.load(), None);
    let minted = load_or_mint_client_id(&store, "dash_");
    assert_eq!(store.load(), Some(minted.clone()));
    assert_eq!(load_or_mint_client_id(&store, "dash_"), minted);

    store.clear().expect("clear");
    store.clear().expect("clearing twice is fine");
    assert_eq!(store.load(), None);

    fs::remove_dir_all(root).expect("cleanup");
}
