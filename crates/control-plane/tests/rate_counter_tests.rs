use control_plane::{CounterError, InMemoryRateCounterStore, RateCounterStore};

#[test]
fn increments_are_sequential_per_key() {
    let store = InMemoryRateCounterStore::new();
    assert_eq!(store.increment("rl:a", 60).expect("count"), 1);
    assert_eq!(store.increment("rl:a", 60).expect("count"), 2);
    assert_eq!(store.increment("rl:b", 60).expect("count"), 1);
    assert_eq!(store.current("rl:a").expect("count"), 2);
}

#[test]
fn counters_reset_after_the_ttl() {
    let store = InMemoryRateCounterStore::new();
    assert_eq!(store.increment("rl:ttl", 1).expect("count"), 1);
    assert_eq!(store.increment("rl:ttl", 1).expect("count"), 2);
    std::thread::sleep(std::time::Duration::from_millis(1_100));
    assert_eq!(store.current("rl:ttl").expect("count"), 0);
    assert_eq!(store.increment("rl:ttl", 1).expect("count"), 1);
}

#[test]
fn unavailable_store_surfaces_counter_error() {
    let store = InMemoryRateCounterStore::new();
    store.set_unavailable(true);
    assert!(matches!(
        store.increment("rl:a", 60),
        Err(CounterError::Unavailable(_))
    ));
    assert!(matches!(store.current("rl:a"), Err(CounterError::Unavailable(_))));

    store.set_unavailable(false);
    assert_eq!(store.increment("rl:a", 60).expect("count"), 1);
}

#[test]
fn missing_key_reads_as_zero() {
    let store = InMemoryRateCounterStore::new();
    assert_eq!(store.current("rl:never").expect("count"), 0);
}
