#![allow(clippy::unwrap_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use courier_core::clock::SystemClock;
use courier_core::config::QueueConfig;
use courier_core::types::{
    ExitMetadata, JourneySettings, MessageMetadata, QueueName, StartMetadata, StepKind,
    TelemetryEventType,
};
use courier_core::SendFault;
use courier_journey::{JourneyEngine, QueueFabric, WorkerPool};
use uuid::Uuid;

use common::{context, customer};

#[tokio::test]
async fn test_pool_drives_customer_to_exit_with_retry() {
    let fabric = Arc::new(QueueFabric::new(100));
    let (ctx, fakes) = context(fabric.clone(), Arc::new(SystemClock), false);

    let template = Uuid::new_v4();
    fakes.catalog.insert_template(courier_core::types::Template {
        id: template,
        owner_id: Uuid::nil(),
        name: "pool".to_string(),
        channel: courier_core::types::Channel::Email,
        subject: None,
        body: "hello".to_string(),
        webhook: None,
    });
    let (start, message, exit) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let journey_id = Uuid::new_v4();
    for (id, kind) in [
        (start, StepKind::Start(StartMetadata { destination: Some(message) })),
        (
            message,
            StepKind::Message(MessageMetadata {
                template_id: template,
                destination: Some(exit),
            }),
        ),
        (exit, StepKind::Exit(ExitMetadata::default())),
    ] {
        fakes.catalog.insert_step(courier_core::types::Step {
            id,
            journey_id,
            name: kind.label().to_string(),
            kind,
        });
    }
    let now = chrono::Utc::now();
    fakes.journeys.register(courier_core::types::Journey {
        id: journey_id,
        owner_id: Uuid::nil(),
        name: "pool journey".to_string(),
        steps: vec![start, message, exit],
        settings: JourneySettings::default(),
        is_paused: false,
        is_stopped: false,
        created_at: now,
        updated_at: now,
        version: 1,
    });

    let engine = JourneyEngine::new(ctx);
    let config = QueueConfig {
        retry_backoff_ms: 10,
        stalled_interval_ms: 5_000,
        ..QueueConfig::default()
    };
    let mut pool = WorkerPool::new(fabric.clone(), engine.dispatcher(), config);
    pool.start();
    assert_eq!(pool.consumer_count(), 10);

    fakes.sender.fail_next(SendFault::Transient("flaky provider".into()));
    engine
        .admit(customer("pool"), journey_id, start, None)
        .await
        .unwrap();

    let message_stats = || {
        fabric
            .stats()
            .into_iter()
            .find(|s| s.queue == QueueName::Message)
            .unwrap()
    };
    let finished = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let exited = engine.location("pool", journey_id).await.unwrap().is_none()
                && fakes.telemetry.count_type(TelemetryEventType::JourneyExited) == 1;
            if exited && message_stats().completed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    pool.shutdown();
    assert!(finished.is_ok(), "customer never reached the exit step");

    assert_eq!(fakes.sender.count(), 1);
    assert_eq!(message_stats().retried, 1);
    assert!(fabric.recent(10).len() >= 3);
}
