//! Concurrency scenarios for the durable queue: no double claims under a
//! pool of workers, FIFO ordering, terminal-state discipline.

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

use tracemark::store::jobs::new_job;
use tracemark::store::models::{JobKind, JobState};
use tracemark::store::Store;

#[test]
fn hundred_jobs_eight_workers_each_claimed_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Store::open_at(&dir.path().join("queue.db")).expect("open");

    let mut expected = HashSet::new();
    for n in 0..100 {
        let mut job = new_job(JobKind::EmbedImage, "c1", Some(&format!("t{n}")));
        job.created_at = 1_000 + n as i64;
        assert!(store.enqueue(&job).expect("enqueue"));
        expected.insert(job.id);
    }

    let workers = 8;
    let barrier = Arc::new(Barrier::new(workers));
    let mut handles = Vec::new();
    for _ in 0..workers {
        let worker_store = store.reopen().expect("reopen");
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            let mut claimed = Vec::new();
            loop {
                match worker_store.claim_next(&[JobKind::EmbedImage, JobKind::EmbedVideo]) {
                    Ok(Some(job)) => {
                        assert_eq!(job.state, JobState::Running);
                        worker_store.complete_job(&job.id).expect("complete");
                        claimed.push(job.id);
                    }
                    Ok(None) => break,
                    Err(e) => panic!("claim failed: {e}"),
                }
            }
            claimed
        }));
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    for handle in handles {
        for id in handle.join().expect("join") {
            total += 1;
            assert!(seen.insert(id), "job claimed twice");
        }
    }
    assert_eq!(total, 100);
    assert_eq!(seen, expected);

    // Every row ended COMPLETED exactly once.
    for id in &seen {
        let job = store.job(id).expect("query").expect("present");
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.progress, 100);
        assert!(job.completed_at.is_some());
    }
}

#[test]
fn claims_come_out_oldest_first() {
    let store = Store::open(":memory:").expect("open");
    let mut ids = Vec::new();
    for n in 0..10 {
        let mut job = new_job(JobKind::Detect, "acct", None);
        job.created_at = 5_000 + n;
        store.enqueue(&job).expect("enqueue");
        ids.push(job.id);
    }
    for expected in &ids {
        let claimed = store
            .claim_next(&[JobKind::Detect])
            .expect("claim")
            .expect("job");
        assert_eq!(&claimed.id, expected);
    }
}

#[test]
fn mixed_kinds_share_the_pool_without_cross_talk() {
    let store = Store::open(":memory:").expect("open");
    let mut embed = new_job(JobKind::EmbedVideo, "c1", Some("t1"));
    embed.created_at = 10;
    let mut detect = new_job(JobKind::Detect, "acct", None);
    detect.created_at = 20;
    store.enqueue(&embed).expect("enqueue");
    store.enqueue(&detect).expect("enqueue");

    // The oldest job wins regardless of kind when both are requested.
    let first = store
        .claim_next(&[JobKind::EmbedVideo, JobKind::Detect])
        .expect("claim")
        .expect("job");
    assert_eq!(first.id, embed.id);

    // A worker asking only for detects skips the embed queue entirely.
    let second = store
        .claim_next(&[JobKind::Detect])
        .expect("claim")
        .expect("job");
    assert_eq!(second.id, detect.id);
}

#[test]
fn interrupted_jobs_stay_running_and_visible() {
    let store = Store::open(":memory:").expect("open");
    let job = new_job(JobKind::EmbedImage, "c1", Some("t1"));
    store.enqueue(&job).expect("enqueue");
    store.claim_next(&[JobKind::EmbedImage]).expect("claim");

    // Nobody completes or fails it (simulated crash): it stays RUNNING and
    // shows up in the stuck report, but is never auto-released.
    let row = store.job(&job.id).expect("query").expect("present");
    assert_eq!(row.state, JobState::Running);
    assert_eq!(store.stale_running_jobs(-1).expect("stale").len(), 1);
    assert!(store.claim_next(&[JobKind::EmbedImage]).expect("claim").is_none());
}
