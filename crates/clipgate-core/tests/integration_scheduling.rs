//! Integration tests: submissions flowing through admission, the scheduler
//! loop and mock workers to a terminal state.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use clipgate_core::admission::{UserAdmission, UserLimits};
use clipgate_core::error::GateError;
use clipgate_core::fetch::FetchError;
use clipgate_core::gateway::GateState;
use clipgate_core::job_queue::{JobQueue, JobStatus, TransitionFields};
use clipgate_core::platform::Platform;
use clipgate_core::retry::ErrorKind;
use clipgate_core::stats::SystemStats;
use clipgate_core::Gateway;
use tempfile::tempdir;

use common::collaborators::{collaborators, MemoryStorage, MockFetcher};
use common::{config_with_proxies, count, fast_settings, jobs, wait_until, worker_settings, RunningScheduler};

#[tokio::test]
async fn platform_slots_cap_concurrent_downloads() {
    let mut cfg = config_with_proxies(&["p1", "p2", "p3"]);
    cfg.platforms.set(Platform::Kick, 2);
    let gw = Gateway::new(&cfg, JobQueue::open_memory().await.unwrap());
    let dir = tempdir().unwrap();
    let (fetcher, gate) = MockFetcher::gated();
    let storage = Arc::new(MemoryStorage::default());

    let mut ids = Vec::new();
    for user in ["u1", "u2", "u3"] {
        let sub = gw
            .submit(user, &format!("https://kick.com/{user}/clip"), false)
            .await
            .unwrap();
        ids.push(sub.job_id);
    }

    let scheduler = gw.scheduler(
        collaborators(fetcher, storage),
        worker_settings(dir.path()),
        fast_settings(3),
    );
    let running = RunningScheduler::start(scheduler);

    wait_until("two downloads", || async {
        count(&gw, JobStatus::Downloading).await == 2
    })
    .await;
    // Several ticks later the third job is still waiting for a slot.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(count(&gw, JobStatus::Downloading).await, 2);
    assert_eq!(gw.status(ids[2]).await.unwrap().status, JobStatus::Pending);
    assert_eq!(gw.state().slots.usage(Platform::Kick).slots_used, 2);

    gate.add_permits(1);
    wait_until("first completion and third dispatch", || async {
        count(&gw, JobStatus::Completed).await == 1
            && gw.status(ids[2]).await.unwrap().status == JobStatus::Downloading
    })
    .await;
    assert!(gw.state().slots.usage(Platform::Kick).slots_used <= 2);

    gate.add_permits(2);
    wait_until("all completed", || async {
        count(&gw, JobStatus::Completed).await == 3
    })
    .await;
    running.stop().await;

    assert_eq!(gw.state().slots.usage(Platform::Kick).slots_used, 0);
    for job in jobs(&gw).await {
        assert_eq!(job.progress, 100);
        assert_eq!(job.attempts, 1);
    }
}

#[tokio::test]
async fn failing_proxy_is_quarantined_and_blocks_admission() {
    let cfg = config_with_proxies(&["p1"]);
    let gw = Gateway::new(&cfg, JobQueue::open_memory().await.unwrap());
    let dir = tempdir().unwrap();
    let failures = (0..5).map(|_| FetchError::transient(ErrorKind::Proxy, "proxy refused CONNECT"));
    let fetcher = MockFetcher::failing_with(failures);
    let storage = Arc::new(MemoryStorage::default());

    let first = gw.submit("alice", "https://rumble.com/v1", false).await.unwrap();
    let scheduler = gw.scheduler(
        collaborators(fetcher.clone(), storage),
        worker_settings(dir.path()),
        fast_settings(5),
    );
    let running = RunningScheduler::start(scheduler);

    wait_until("job to exhaust retries", || async {
        gw.status(first.job_id).await.unwrap().status == JobStatus::Failed
    })
    .await;
    assert_eq!(fetcher.calls().len(), 5);

    let proxy = gw.state().proxies.snapshot().remove(0);
    assert!(!proxy.healthy);
    assert_eq!(proxy.consecutive_failures, 5);
    assert!(proxy.quarantined_for_secs.is_some());
    assert!(gw.state().proxies.try_assign().is_none());

    let second = gw.submit("alice", "https://rumble.com/v2", false).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(gw.status(second.job_id).await.unwrap().status, JobStatus::Pending);
    assert_eq!(fetcher.calls().len(), 5);
    assert_eq!(gw.state().slots.usage(Platform::Rumble).slots_used, 0);
    assert_eq!(gw.state().admission.active_jobs("alice"), 0);
    running.stop().await;
}

#[tokio::test]
async fn rate_limit_window_resets() {
    let cfg = config_with_proxies(&["p1"]);
    let mut state = GateState::from_config(&cfg, JobQueue::open_memory().await.unwrap());
    state.admission = Arc::new(UserAdmission::new(UserLimits {
        max_concurrent_jobs: 3,
        max_requests_per_window: 5,
        window: Duration::from_millis(300),
    }));
    let gw = Gateway::from_state(state);

    for i in 1..=5 {
        gw.submit("carol", &format!("https://www.twitch.tv/videos/{i}"), false)
            .await
            .unwrap();
    }
    match gw.submit("carol", "https://www.twitch.tv/videos/6", false).await {
        Err(GateError::RateLimited { limit, retry_after }) => {
            assert_eq!(limit, 5);
            assert!(retry_after <= Duration::from_millis(300));
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }
    // Other users have their own window.
    gw.submit("dave", "https://www.twitch.tv/videos/6", false)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(350)).await;
    let seventh = gw
        .submit("carol", "https://www.twitch.tv/videos/7", false)
        .await
        .unwrap();
    assert!(!seventh.duplicate);
    assert_eq!(count(&gw, JobStatus::Pending).await, 7);
}

#[tokio::test]
async fn transient_failure_retries_on_another_proxy() {
    let cfg = config_with_proxies(&["p1", "p2"]);
    let gw = Gateway::new(&cfg, JobQueue::open_memory().await.unwrap());
    let dir = tempdir().unwrap();
    let fetcher = MockFetcher::failing_with([FetchError::transient(
        ErrorKind::Connection,
        "connection reset by peer",
    )]);
    let storage = Arc::new(MemoryStorage::default());

    let sub = gw.submit("erin", "https://drive.google.com/file/d/abc/view", false).await.unwrap();
    let scheduler = gw.scheduler(
        collaborators(fetcher.clone(), storage.clone()),
        worker_settings(dir.path()),
        fast_settings(3),
    );
    let running = RunningScheduler::start(scheduler);

    wait_until("job to complete", || async {
        gw.status(sub.job_id).await.unwrap().status == JobStatus::Completed
    })
    .await;
    running.stop().await;

    let job = gw.status(sub.job_id).await.unwrap();
    assert_eq!(job.attempts, 2);
    assert!(job.last_error.unwrap().contains("connection reset"));
    assert!(job.error.is_none());
    assert_eq!(job.file_url.as_deref(), Some(&*format!("mem://downloads/erin/{}/{}.mp4", sub.job_id, sub.job_id)));

    let calls = fetcher.calls();
    assert_eq!(calls.len(), 2);
    assert_ne!(calls[0].1, calls[1].1, "retry should use a different proxy");
    let failed_proxy = &calls[0].1;
    for proxy in gw.state().proxies.snapshot() {
        let expected = u32::from(&proxy.id == failed_proxy);
        assert_eq!(proxy.consecutive_failures, expected);
        assert_eq!(proxy.in_flight, 0);
    }
    assert_eq!(storage.keys().len(), 1);
}

#[tokio::test]
async fn recovered_jobs_run_to_completion() {
    let state_dir = tempdir().unwrap();
    let db_path = state_dir.path().join("jobs.db");
    let cfg = config_with_proxies(&["p1"]);

    let job_id = {
        let gw = Gateway::new(&cfg, JobQueue::open_at(&db_path).await.unwrap());
        let sub = gw.submit("frank", "https://zoom.us/clips/share/xyz", true).await.unwrap();
        let queue = gw.queue();
        queue
            .transition(sub.job_id, JobStatus::Admitted, TransitionFields::default())
            .await
            .unwrap();
        queue
            .transition(sub.job_id, JobStatus::Downloading, TransitionFields::stage("downloading"))
            .await
            .unwrap();
        queue.update_progress(sub.job_id, 42, None).await.unwrap();
        sub.job_id
    };

    // A fresh process: reservations from before are gone.
    let gw = Gateway::new(&cfg, JobQueue::open_at(&db_path).await.unwrap());
    assert_eq!(gw.queue().recover_in_flight().await.unwrap(), 1);
    let job = gw.status(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.progress, 0);

    let dir = tempdir().unwrap();
    let mut scheduler = gw.scheduler(
        collaborators(MockFetcher::new(), Arc::new(MemoryStorage::default())),
        worker_settings(dir.path()),
        fast_settings(3),
    );
    tokio::time::timeout(Duration::from_secs(5), scheduler.run_until_idle())
        .await
        .expect("idle within 5s")
        .unwrap();

    let job = gw.status(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.with_subtitles);
    assert_eq!(scheduler.running(), 0);
}

#[tokio::test]
async fn shutdown_stops_workers_and_leaves_jobs_for_recovery() {
    let cfg = config_with_proxies(&["p1"]);
    let gw = Gateway::new(&cfg, JobQueue::open_memory().await.unwrap());
    let dir = tempdir().unwrap();
    let (fetcher, _gate) = MockFetcher::gated();
    let published: Arc<Mutex<Vec<SystemStats>>> = Arc::default();

    let sub = gw.submit("gina", "https://kick.com/clip/9", false).await.unwrap();
    let sink = Arc::clone(&published);
    let scheduler = gw
        .scheduler(
            collaborators(fetcher, Arc::new(MemoryStorage::default())),
            worker_settings(dir.path()),
            fast_settings(3),
        )
        .with_stats_sink(
            gw.stats_reporter(),
            Box::new(move |stats: &SystemStats| sink.lock().unwrap().push(stats.clone())),
        );
    let running = RunningScheduler::start(scheduler);

    wait_until("download to start", || async {
        gw.status(sub.job_id).await.unwrap().status == JobStatus::Downloading
    })
    .await;
    running.stop().await;

    let state = gw.state();
    assert_eq!(gw.status(sub.job_id).await.unwrap().status, JobStatus::Downloading);
    assert!(!state.control.is_registered(sub.job_id));
    assert_eq!(state.slots.usage(Platform::Kick).slots_used, 0);
    assert_eq!(state.proxies.stats().in_use, 0);
    assert_eq!(state.admission.active_jobs("gina"), 0);
    assert_eq!(gw.queue().recover_in_flight().await.unwrap(), 1);

    let published = published.lock().unwrap();
    assert!(!published.is_empty());
    assert!(published.iter().any(|s| s.queue.active == 1));
}
