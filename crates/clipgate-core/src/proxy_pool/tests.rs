use std::time::Duration;

use super::*;

fn policy() -> ProxyPolicy {
    ProxyPolicy {
        failure_threshold: 5,
        base_quarantine: Duration::from_secs(30),
        max_quarantine: Duration::from_secs(300),
    }
}

fn pool_of(ids: &[&str]) -> ProxyPool {
    let pool = ProxyPool::new(policy());
    for id in ids {
        pool.register(id, &format!("http://{id}:3128")).unwrap();
    }
    pool
}

fn fail(pool: &ProxyPool, id: &str, times: u32) {
    for _ in 0..times {
        let lease = pool.try_assign().unwrap();
        assert_eq!(lease.id, id);
        pool.report_outcome(id, false).unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn five_consecutive_failures_quarantine_the_only_proxy() {
    let pool = pool_of(&["p1"]);
    fail(&pool, "p1", 4);
    assert!(pool.snapshot()[0].healthy);

    fail(&pool, "p1", 1);
    let snap = &pool.snapshot()[0];
    assert!(!snap.healthy);
    assert_eq!(snap.consecutive_failures, 5);
    assert_eq!(snap.quarantined_for_secs, Some(30));
    assert!(pool.try_assign().is_none());

    let stats = pool.stats();
    assert_eq!((stats.total, stats.healthy, stats.quarantined), (1, 0, 1));
}

#[tokio::test(start_paused = true)]
async fn success_resets_failure_streak() {
    let pool = pool_of(&["p1"]);
    fail(&pool, "p1", 4);
    pool.try_assign().unwrap();
    pool.report_outcome("p1", true).unwrap();
    assert_eq!(pool.snapshot()[0].consecutive_failures, 0);

    fail(&pool, "p1", 4);
    assert!(pool.snapshot()[0].healthy);
}

#[tokio::test(start_paused = true)]
async fn quarantined_proxy_is_readmitted_after_backoff() {
    let pool = pool_of(&["p1"]);
    fail(&pool, "p1", 5);
    assert!(pool.try_assign().is_none());

    tokio::time::advance(Duration::from_secs(29)).await;
    assert!(pool.try_assign().is_none());

    tokio::time::advance(Duration::from_secs(1)).await;
    let lease = pool.try_assign().expect("readmitted after quarantine");
    assert_eq!(lease.id, "p1");

    // Half-open: still carrying the streak, so one more failure re-quarantines
    // with a doubled backoff.
    pool.report_outcome("p1", false).unwrap();
    let snap = &pool.snapshot()[0];
    assert!(!snap.healthy);
    assert_eq!(snap.consecutive_failures, 6);
    assert_eq!(snap.quarantined_for_secs, Some(60));
}

#[tokio::test(start_paused = true)]
async fn healthy_iff_not_quarantined() {
    let pool = pool_of(&["a", "b", "c"]);
    // Round robin: every third lease goes to "b", which always fails.
    for _ in 0..15 {
        let lease = pool.try_assign().unwrap();
        pool.report_outcome(&lease.id, lease.id != "b").unwrap();
    }
    for snap in pool.snapshot() {
        assert_eq!(snap.healthy, snap.quarantined_for_secs.is_none(), "{}", snap.id);
    }
    let b = pool.snapshot().into_iter().find(|s| s.id == "b").unwrap();
    assert!(!b.healthy);
}

#[test]
fn assignment_rotates_least_recently_used() {
    let pool = pool_of(&["a", "b", "c"]);
    let order: Vec<_> = (0..6).map(|_| pool.try_assign().unwrap().id).collect();
    assert_eq!(order, ["a", "b", "c", "a", "b", "c"]);
    assert_eq!(pool.stats().in_use, 3);
}

#[test]
fn avoid_hint_prefers_other_proxy_but_falls_back() {
    let pool = pool_of(&["a", "b"]);
    let first = pool.try_assign().unwrap();
    assert_eq!(first.id, "a");
    // "b" is least recently used anyway; avoid it and "a" is picked.
    let second = pool.try_assign_avoiding(Some("b")).unwrap();
    assert_eq!(second.id, "a");

    let single = pool_of(&["only"]);
    assert_eq!(single.try_assign_avoiding(Some("only")).unwrap().id, "only");
}

#[test]
fn in_flight_tracking_and_deregister() {
    let pool = pool_of(&["a"]);
    pool.try_assign().unwrap();
    assert_eq!(pool.snapshot()[0].in_flight, 1);
    assert_eq!(
        pool.deregister("a"),
        Err(ProxyError::ProxyInUse {
            id: "a".to_string(),
            in_flight: 1
        })
    );
    pool.release("a").unwrap();
    assert_eq!(pool.snapshot()[0].in_flight, 0);
    pool.deregister("a").unwrap();
    assert!(pool.snapshot().is_empty());
    assert_eq!(
        pool.deregister("a"),
        Err(ProxyError::UnknownProxy("a".to_string()))
    );
}

#[test]
fn unknown_and_duplicate_proxies() {
    let pool = pool_of(&["a"]);
    assert_eq!(
        pool.register("a", "http://other"),
        Err(ProxyError::Duplicate("a".to_string()))
    );
    assert_eq!(
        pool.report_outcome("zzz", true),
        Err(ProxyError::UnknownProxy("zzz".to_string()))
    );
}

#[test]
fn empty_pool_assigns_nothing() {
    let pool = ProxyPool::new(policy());
    assert!(pool.try_assign().is_none());
    assert_eq!(pool.stats().utilization, 0.0);
}

#[test]
fn backoff_doubles_and_is_capped() {
    let p = policy();
    assert_eq!(quarantine_backoff(5, &p), Duration::from_secs(30));
    assert_eq!(quarantine_backoff(6, &p), Duration::from_secs(60));
    assert_eq!(quarantine_backoff(7, &p), Duration::from_secs(120));
    assert_eq!(quarantine_backoff(8, &p), Duration::from_secs(240));
    assert_eq!(quarantine_backoff(9, &p), Duration::from_secs(300));
    assert_eq!(quarantine_backoff(u32::MAX, &p), Duration::from_secs(300));
}

#[test]
fn from_config_skips_duplicates() {
    use crate::config::ProxyConfig;
    let proxies = vec![
        ProxyConfig { id: "a".into(), address: "http://a".into() },
        ProxyConfig { id: "a".into(), address: "http://a2".into() },
        ProxyConfig { id: "b".into(), address: "http://b".into() },
    ];
    let pool = ProxyPool::from_config(policy(), &proxies);
    let snap = pool.snapshot();
    assert_eq!(snap.len(), 2);
    assert_eq!(snap[0].address, "http://a");
}
