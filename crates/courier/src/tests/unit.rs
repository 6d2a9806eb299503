//! Unit tests for the daemon bootstrap sequence.

use std::sync::Arc;

use mockall::predicate::eq;
use rstest::rstest;
use serde_json::json;

use courier_config::Config;

use crate::bootstrap::{BootstrapError, bootstrap_with};
use crate::broker::{BrokerError, GLOBAL_EXCHANGE};
use crate::dispatch::{HandlerError, HandlerOutput, HandlerRegistration};
use crate::health::{MockHealthReporter, ServingSummary};
use crate::model::{CallRequest, CallRequestDto, RoutingKey};
use crate::orchestrator::{InternalCaller, LifecycleHooks};
use crate::server::RpcServer;

use super::support::{
    FailingConfigLoader, HealthEvent, MemoryConnector, RecordingHealthReporter, TestConfigLoader,
};

#[rstest]
#[tokio::test]
async fn standalone_bootstrap_skips_the_broker() {
    let reporter = Arc::new(RecordingHealthReporter::default());
    let connector = MemoryConnector::default();

    let daemon = bootstrap_with(
        &TestConfigLoader::new(),
        reporter.clone(),
        &connector,
        LifecycleHooks::default(),
    )
    .await
    .expect("bootstrap should succeed");

    assert_eq!(daemon.server().display_name(), "test-daemon");
    assert_eq!(connector.connects(), 0);
    assert_eq!(
        reporter.events(),
        vec![HealthEvent::BootstrapStarting, HealthEvent::BootstrapSucceeded]
    );
}

#[rstest]
#[tokio::test]
async fn broker_endpoint_is_reported_without_credentials() {
    let reporter = Arc::new(RecordingHealthReporter::default());
    let connector = MemoryConnector::default();

    bootstrap_with(
        &TestConfigLoader::with_broker(),
        reporter.clone(),
        &connector,
        LifecycleHooks::default(),
    )
    .await
    .expect("bootstrap should succeed");

    assert_eq!(connector.connects(), 1);
    let events = reporter.events();
    assert!(events.contains(&HealthEvent::BrokerConnecting(
        "amqp://broker.test:5672/%2f".to_owned()
    )));
    assert!(events.contains(&HealthEvent::BrokerReady(
        "amqp://broker.test:5672/%2f".to_owned()
    )));
    assert!(
        events
            .iter()
            .all(|event| !format!("{event:?}").contains("secret"))
    );
}

#[rstest]
#[tokio::test]
async fn broker_failure_aborts_bootstrap() {
    let reporter = Arc::new(RecordingHealthReporter::default());
    let connector = MemoryConnector::failing();

    let error = bootstrap_with(
        &TestConfigLoader::with_broker(),
        reporter.clone(),
        &connector,
        LifecycleHooks::default(),
    )
    .await
    .expect_err("broker is down");

    assert!(matches!(
        error,
        BootstrapError::Broker {
            source: BrokerError::Disconnected
        }
    ));
    let events = reporter.events();
    assert!(events.contains(&HealthEvent::BrokerFailed(
        "amqp://broker.test:5672/%2f".to_owned()
    )));
    assert!(matches!(events.last(), Some(HealthEvent::BootstrapFailed(_))));
}

#[rstest]
#[tokio::test]
async fn configuration_errors_are_reported() {
    let reporter = Arc::new(RecordingHealthReporter::default());

    let error = bootstrap_with(
        &FailingConfigLoader,
        reporter.clone(),
        &MemoryConnector::default(),
        LifecycleHooks::default(),
    )
    .await
    .expect_err("loader fails");

    assert!(matches!(error, BootstrapError::Configuration { .. }));
    assert_eq!(
        reporter.events(),
        vec![
            HealthEvent::BootstrapStarting,
            HealthEvent::BootstrapFailed(error.to_string()),
        ]
    );
}

#[rstest]
#[tokio::test]
async fn invalid_configuration_is_rejected_before_telemetry() {
    let mut reporter = MockHealthReporter::new();
    reporter.expect_bootstrap_starting().times(1).return_const(());
    reporter
        .expect_bootstrap_failed()
        .withf(|error| matches!(error, BootstrapError::InvalidConfiguration { .. }))
        .times(1)
        .return_const(());
    reporter.expect_bootstrap_succeeded().never();

    let loader = TestConfigLoader::with(Config {
        rpc_timeout_ms: 0,
        ..Config::named("test-daemon")
    });
    let result = bootstrap_with(
        &loader,
        Arc::new(reporter),
        &MemoryConnector::default(),
        LifecycleHooks::default(),
    )
    .await;
    assert!(result.is_err());
}

#[rstest]
#[tokio::test]
async fn broker_events_are_not_reported_without_uri() {
    let mut reporter = MockHealthReporter::new();
    reporter.expect_bootstrap_starting().return_const(());
    reporter.expect_bootstrap_succeeded().times(1).return_const(());
    reporter
        .expect_broker_connecting()
        .with(eq("amqp://broker.test:5672/%2f"))
        .never();

    bootstrap_with(
        &TestConfigLoader::new(),
        Arc::new(reporter),
        &MemoryConnector::default(),
        LifecycleHooks::default(),
    )
    .await
    .expect("bootstrap should succeed");
}

#[rstest]
#[tokio::test]
async fn standalone_daemon_reports_serving_without_queue() {
    let reporter = Arc::new(RecordingHealthReporter::default());
    let daemon = bootstrap_with(
        &TestConfigLoader::new(),
        reporter.clone(),
        &MemoryConnector::default(),
        LifecycleHooks::default(),
    )
    .await
    .expect("bootstrap should succeed");

    daemon.run(async {}).await.expect("daemon run");

    let events = reporter.events();
    assert!(events.contains(&HealthEvent::Serving(ServingSummary {
        display_name: "test-daemon".to_owned(),
        queue: None,
        handlers: Vec::new(),
    })));
    assert_eq!(
        events.last(),
        Some(&HealthEvent::Stopped("test-daemon".to_owned(), None))
    );
}

#[rstest]
#[tokio::test]
async fn bootstrapped_daemon_serves_over_the_broker() {
    let reporter = Arc::new(RecordingHealthReporter::default());
    let connector = MemoryConnector::default();
    let daemon = bootstrap_with(
        &TestConfigLoader::with_broker(),
        reporter.clone(),
        &connector,
        LifecycleHooks::default(),
    )
    .await
    .expect("bootstrap should succeed");

    daemon
        .server()
        .register(
            HandlerRegistration::new("ping"),
            |_: CallRequest, _: InternalCaller| async move {
                Ok::<_, HandlerError>(HandlerOutput::Data(json!("pong")))
            },
        )
        .await
        .expect("register");

    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    let run = daemon.run(async {
        let _ = stopped.await;
    });
    let check = async {
        // Wait for the daemon to bind its queue.
        while connector
            .broker
            .bound_queues(GLOBAL_EXCHANGE, "global::ping::1")
            .is_empty()
        {
            tokio::task::yield_now().await;
        }
        let client = RpcServer::builder("client")
            .transport(Arc::new(connector.broker.transport()))
            .build()
            .expect("client");
        client.start().await.expect("client start");
        let response = client
            .call(CallRequestDto::method("ping"), "unit test")
            .await
            .expect("ping over the broker");
        assert_eq!(response.data(), Some(&json!("pong")));
        client.stop().await.expect("client stop");
        stop.send(()).expect("daemon still running");
    };
    let (result, ()) = tokio::join!(run, check);
    result.expect("daemon run");
    let events = reporter.events();
    let serving = events.iter().find_map(|event| match event {
        HealthEvent::Serving(summary) => Some(summary.clone()),
        _ => None,
    });
    let summary = serving.expect("serving reported");
    assert_eq!(summary.display_name, "test-daemon");
    assert_eq!(summary.handlers, vec![RoutingKey::global("ping")]);
    assert!(
        summary
            .queue
            .as_deref()
            .is_some_and(|queue| queue.starts_with("test-daemon-rpc-"))
    );
    assert_eq!(
        events.last(),
        Some(&HealthEvent::Stopped("test-daemon".to_owned(), None))
    );
    assert!(
        connector
            .broker
            .bound_queues(GLOBAL_EXCHANGE, "global::ping::1")
            .is_empty()
    );
}
