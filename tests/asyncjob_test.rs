use servicekit::asyncjob::{Group, Job, JobState};
use servicekit::mock::{CallJournal, MockComponent, MockHandle};
use servicekit::{BoxError, JobError, ServiceBuilder, ServiceContext};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn flaky(name: &str, failures: usize, journal: &CallJournal) -> Job {
    let attempts = Arc::new(AtomicUsize::new(0));
    let journal = journal.clone();
    let label = name.to_string();
    Job::new(name, move |_| {
        let attempts = attempts.clone();
        let journal = journal.clone();
        let label = label.clone();
        async move {
            journal.record(format!("{label}:attempt"));
            if attempts.fetch_add(1, Ordering::SeqCst) < failures {
                return Err::<(), BoxError>(format!("{label} not ready").into());
            }
            Ok(())
        }
    })
    .with_retry_durations(vec![Duration::from_secs(1), Duration::from_secs(2)])
}

/// Parallel jobs wait out their retries side by side, not one after another.
#[tokio::test(start_paused = true)]
async fn test_parallel_group_retries_concurrently() {
    let journal = CallJournal::default();
    let group = Group::parallel([
        flaky("a", 1, &journal),
        flaky("b", 1, &journal),
        flaky("c", 0, &journal),
    ]);

    let started = tokio::time::Instant::now();
    group.run().await.expect("every job recovers");
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(2));
    assert!(group.jobs().iter().all(|job| job.state() == JobState::Completed));
    assert_eq!(journal.count("a:attempt"), 2);
    assert_eq!(journal.count("c:attempt"), 1);
}

/// A sequential group stops at the first job that exhausts its retries.
#[tokio::test(start_paused = true)]
async fn test_sequential_group_short_circuits_after_retries() {
    let journal = CallJournal::default();
    let group = Group::sequential([
        flaky("first", 0, &journal),
        flaky("broken", usize::MAX, &journal),
        flaky("never", 0, &journal),
    ]);

    let err = group.run().await.expect_err("group should fail");

    assert!(matches!(err, JobError::TaskFailed { ref name } if name == "broken"));
    assert_eq!(journal.count("broken:attempt"), 3);
    assert_eq!(journal.count("never:attempt"), 0);
    assert_eq!(group.jobs()[1].state(), JobState::Failed);
    assert_eq!(group.jobs()[2].state(), JobState::Init);
}

/// Cancelling a group ends jobs that are waiting to retry.
#[tokio::test]
async fn test_cancel_group() {
    let job = Job::new("stubborn", |_| async { Err::<(), BoxError>("no".into()) })
        .with_retry_durations(vec![Duration::from_secs(3600)]);
    let group = Group::parallel([job.clone()]);

    let running = {
        let group = group.clone();
        tokio::spawn(async move { group.run().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    group.cancel();

    let err = tokio::time::timeout(Duration::from_secs(2), running)
        .await
        .expect("group ignored cancel")
        .unwrap()
        .expect_err("cancelled group fails");
    assert!(matches!(err, JobError::Cancelled(ref name) if name == "stubborn"));
    assert!(job.is_cancelled());
}

/// A one-shot function reaches init components through the service context.
#[tokio::test]
async fn test_run_function_with_jobs() {
    let service = ServiceBuilder::new()
        .name("jobs-test")
        .without_env_file()
        .with_args(Vec::<String>::new())
        .with_init_runnable(MockComponent::new("store"))
        .build()
        .expect("Failed to build service");
    service.init().await.expect("init failed");

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    service
        .run_function(|ctx| async move {
            let store = ctx
                .get_handle("store")
                .ok_or("store missing")?
                .downcast::<MockHandle>()
                .map_err(|_| "store has another type")?;
            let job = Job::new("count-runs", move |_| {
                let counter = counter.clone();
                let runs = store.runs();
                async move {
                    counter.fetch_add(runs, Ordering::SeqCst);
                    Ok::<(), BoxError>(())
                }
            });
            Group::sequential([job]).run().await?;
            Ok::<(), BoxError>(())
        })
        .await
        .expect("function failed");

    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert_eq!(ServiceContext::env(&service), "dev");
}
