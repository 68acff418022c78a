use servicekit::lifecycle::LifecycleState;
use servicekit::mock::{CallJournal, MockComponent, MockHandle};
use servicekit::{ProcessSignal, Service, ServiceBuilder, ServiceError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

fn builder() -> ServiceBuilder {
    ServiceBuilder::new()
        .name("service-test")
        .version("0.0.1")
        .without_env_file()
        .with_args(Vec::<String>::new())
}

/// Starts `service` on its own task with an injected signal channel.
fn start(
    service: &Arc<Service>,
) -> (
    mpsc::Sender<ProcessSignal>,
    JoinHandle<Result<(), ServiceError>>,
) {
    let (tx, rx) = mpsc::channel(4);
    let service = service.clone();
    let handle = tokio::spawn(async move { service.start_with_signals(rx).await });
    (tx, handle)
}

fn state_of(service: &Service, name: &str) -> LifecycleState {
    service
        .component_states()
        .into_iter()
        .find(|(n, _)| n == name)
        .map(|(_, state)| state)
        .expect("component not registered")
}

/// The first failing init component aborts init; later ones are untouched.
#[tokio::test]
async fn test_init_is_sequential_and_fails_fast() {
    let journal = CallJournal::default();
    let service = builder()
        .with_init_runnable(MockComponent::new("a").journal(&journal))
        .with_init_runnable(MockComponent::new("b").journal(&journal).fail_run("boom"))
        .with_init_runnable(MockComponent::new("c").journal(&journal))
        .build()
        .expect("Failed to build service");

    let err = service.init().await.expect_err("init should fail");

    match err {
        ServiceError::Init { name, source } => {
            assert_eq!(name, "b");
            assert!(source.to_string().contains("boom"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(journal.position("a:run").unwrap() < journal.position("b:configure").unwrap());
    assert_eq!(journal.count("c:configure"), 0);
    assert_eq!(journal.count("c:run"), 0);

    assert_eq!(state_of(&service, "a"), LifecycleState::Running);
    assert_eq!(state_of(&service, "b"), LifecycleState::Failed);
    assert_eq!(state_of(&service, "c"), LifecycleState::FlagsRegistered);
}

/// A configure error is reported as an init failure too.
#[tokio::test]
async fn test_init_configure_failure() {
    let service = builder()
        .with_init_runnable(MockComponent::new("db").fail_configure("bad dsn"))
        .build()
        .expect("Failed to build service");

    let err = service.init().await.expect_err("init should fail");
    assert!(matches!(err, ServiceError::Init { ref name, .. } if name == "db"));
    assert_eq!(service.get::<MockHandle>("db").unwrap().runs(), 0);
}

/// Stop fans out to every component and returns only once the slowest one
/// has finished, taking about as long as that one alone.
#[tokio::test(start_paused = true)]
async fn test_stop_is_a_concurrent_join_barrier() {
    let journal = CallJournal::default();
    let service = Arc::new(
        builder()
            .with_runnable(
                MockComponent::new("fast")
                    .journal(&journal)
                    .run_until_stopped()
                    .stop_delay(Duration::from_millis(50)),
            )
            .with_runnable(
                MockComponent::new("slow")
                    .journal(&journal)
                    .run_until_stopped()
                    .stop_delay(Duration::from_millis(300)),
            )
            .with_init_runnable(
                MockComponent::new("store")
                    .journal(&journal)
                    .stop_delay(Duration::from_millis(150)),
            )
            .build()
            .expect("Failed to build service"),
    );
    service.init().await.expect("init failed");

    let (signals, running) = start(&service);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(state_of(&service, "slow"), LifecycleState::Running);

    let stopping = tokio::time::Instant::now();
    signals.send(ProcessSignal::Terminate).await.unwrap();
    running.await.unwrap().expect("terminate is a clean shutdown");
    let elapsed = stopping.elapsed();

    for name in ["fast", "slow", "store"] {
        assert_eq!(journal.count(&format!("{name}:stopped")), 1, "{name} not stopped");
        assert_eq!(state_of(&service, name), LifecycleState::Stopped);
    }
    assert!(elapsed >= Duration::from_millis(300), "returned before slowest stop");
    assert!(elapsed < Duration::from_millis(500), "stops ran one after another");
}

/// A component whose stop hangs is abandoned after the stop timeout.
#[tokio::test(start_paused = true)]
async fn test_stop_timeout_abandons_hung_component() {
    let service = builder()
        .stop_timeout(Duration::from_millis(100))
        .with_init_runnable(MockComponent::new("stuck").stop_delay(Duration::from_secs(3600)))
        .build()
        .expect("Failed to build service");

    let started = tokio::time::Instant::now();
    service.stop().await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_ne!(state_of(&service, "stuck"), LifecycleState::Stopped);
}

/// The first always-running component to fail brings everything down.
#[tokio::test]
async fn test_component_failure_stops_service() {
    let journal = CallJournal::default();
    let service = Arc::new(
        builder()
            .with_runnable(MockComponent::new("steady").journal(&journal).run_until_stopped())
            .with_runnable(
                MockComponent::new("broken")
                    .journal(&journal)
                    .run_delay(Duration::from_millis(20))
                    .fail_run("lost connection"),
            )
            .build()
            .expect("Failed to build service"),
    );

    let (_signals, running) = start(&service);
    let err = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("start did not return")
        .unwrap()
        .expect_err("start should fail");

    assert!(matches!(err, ServiceError::Component { ref name, .. } if name == "broken"));
    assert_eq!(journal.count("steady:stopped"), 1);
    assert_eq!(state_of(&service, "broken"), LifecycleState::Stopped);
}

/// A component that simply returns does not end the service.
#[tokio::test]
async fn test_component_returning_ok_is_ignored() {
    let journal = CallJournal::default();
    let service = Arc::new(
        builder()
            .with_runnable(MockComponent::new("oneshot").journal(&journal))
            .build()
            .expect("Failed to build service"),
    );

    let (signals, running) = start(&service);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!running.is_finished());
    assert_eq!(journal.count("oneshot:run"), 1);

    signals.send(ProcessSignal::Interrupt).await.unwrap();
    running.await.unwrap().expect("interrupt is a clean shutdown");
    assert_eq!(journal.count("oneshot:stopped"), 1);
}

/// Hangup hands control back without stopping anything.
#[tokio::test]
async fn test_hangup_returns_without_stopping() {
    let journal = CallJournal::default();
    let service = Arc::new(
        builder()
            .with_runnable(MockComponent::new("worker").journal(&journal).run_until_stopped())
            .build()
            .expect("Failed to build service"),
    );

    let (signals, running) = start(&service);
    tokio::time::sleep(Duration::from_millis(20)).await;
    signals.send(ProcessSignal::Hangup).await.unwrap();
    running.await.unwrap().expect("hangup is not an error");

    assert_eq!(journal.count("worker:stop"), 0);
    assert_eq!(state_of(&service, "worker"), LifecycleState::Running);

    service.stop().await;
    assert_eq!(journal.count("worker:stopped"), 1);
}

/// Registering two init components under one prefix is rejected at build.
#[tokio::test]
async fn test_duplicate_prefix_is_a_build_error() {
    let result = builder()
        .with_init_runnable(MockComponent::new("primary").prefix("db"))
        .with_init_runnable(MockComponent::new("replica").prefix("db"))
        .build();

    assert!(matches!(result, Err(ServiceError::DuplicatePrefix(ref p)) if p == "db"));
}

/// Lookups by prefix, typed and untyped.
#[tokio::test]
async fn test_get_and_must_get() {
    let service = builder()
        .with_init_runnable(MockComponent::new("cache"))
        .build()
        .expect("Failed to build service");
    service.init().await.expect("init failed");

    let cache: Arc<MockHandle> = service.must_get("cache");
    assert_eq!(cache.name, "cache");
    assert_eq!(cache.runs(), 1);
    assert!(service.get_handle("cache").is_some());
    assert!(service.get::<MockHandle>("nothing").is_none());
}

/// Command-line flags beat environment variables, which beat defaults.
#[tokio::test]
async fn test_flag_precedence() {
    std::env::set_var("PRECEDENCE_ENV_SETTING", "from-env");
    std::env::set_var("PRECEDENCE_CLI_SETTING", "from-env");

    let service = builder()
        .with_args(["--precedence-cli-setting=from-cli"])
        .with_init_runnable(MockComponent::new("precedence-env"))
        .with_init_runnable(MockComponent::new("precedence-cli"))
        .with_init_runnable(MockComponent::new("precedence-default"))
        .build()
        .expect("Failed to build service");

    let setting = |prefix: &str| {
        service
            .must_get::<MockHandle>(prefix)
            .setting()
            .expect("setting flag not registered")
    };
    assert_eq!(setting("precedence-env"), "from-env");
    assert_eq!(setting("precedence-cli"), "from-cli");
    assert_eq!(setting("precedence-default"), "");
}

/// Unknown command-line flags fail the build.
#[tokio::test]
async fn test_unknown_flag_is_rejected() {
    let result = builder().with_args(["--no-such-flag=1"]).build();
    assert!(matches!(result, Err(ServiceError::Config(_))));
}
