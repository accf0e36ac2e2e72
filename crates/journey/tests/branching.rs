#![allow(clippy::unwrap_used)]

mod common;

use chrono::{Duration, TimeZone, Utc};
use courier_core::types::{
    Branch, ComparisonOperator, Condition, ExitMetadata, ExperimentMetadata, ExperimentVariant,
    JourneySettings, LoopMetadata, MultisplitMetadata, StartMetadata, StepKind,
    TimeWindowMetadata, WaitUntilMetadata,
};
use courier_core::CourierError;
use courier_journey::Outcome;
use uuid::Uuid;

use common::{customer, hm, Harness};

fn customer_equals(key: &str, value: &str) -> Condition {
    Condition::Customer {
        key: key.to_string(),
        operator: ComparisonOperator::Equals,
        value: serde_json::json!(value),
    }
}

fn exit() -> StepKind {
    StepKind::Exit(ExitMetadata::default())
}

fn start(destination: Uuid) -> StepKind {
    StepKind::Start(StartMetadata {
        destination: Some(destination),
    })
}

#[tokio::test]
async fn test_multisplit_follows_first_matching_branch() {
    let h = Harness::new();
    let (entry, split, vip, rest) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let journey = h.journey(
        JourneySettings::default(),
        &[
            (entry, start(split)),
            (
                split,
                StepKind::Multisplit(MultisplitMetadata {
                    branches: vec![Branch {
                        condition: customer_equals("tier", "vip"),
                        destination: Some(vip),
                    }],
                    default_destination: Some(rest),
                }),
            ),
            (vip, exit()),
            (rest, exit()),
        ],
    );

    let gold = customer("gold").with_attribute("tier", serde_json::json!("vip"));
    h.admit(&gold, journey, entry).await;
    h.admit(&customer("plain"), journey, entry).await;
    h.run_next().await.unwrap();
    h.run_next().await.unwrap();

    assert_eq!(h.run_next().await.unwrap(), Outcome::Advanced { to: vip });
    assert_eq!(h.run_next().await.unwrap(), Outcome::Advanced { to: rest });

    let vip_job = h.next_job();
    assert_eq!(vip_job.customer.id, "gold");
    assert_eq!(vip_job.branch, Some(0));
    let rest_job = h.next_job();
    assert_eq!(rest_job.branch, None);
}

#[tokio::test]
async fn test_experiment_never_picks_zero_weight_variant() {
    let h = Harness::new();
    let (entry, experiment, control, treatment) =
        (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let journey = h.journey(
        JourneySettings::default(),
        &[
            (entry, start(experiment)),
            (
                experiment,
                StepKind::Experiment(ExperimentMetadata {
                    variants: vec![
                        ExperimentVariant {
                            name: "control".to_string(),
                            weight: 0.0,
                            destination: Some(control),
                        },
                        ExperimentVariant {
                            name: "treatment".to_string(),
                            weight: 1.0,
                            destination: Some(treatment),
                        },
                    ],
                }),
            ),
            (control, exit()),
            (treatment, exit()),
        ],
    );

    for id in ["e1", "e2", "e3"] {
        h.admit(&customer(id), journey, entry).await;
        h.run_next().await.unwrap();
        assert_eq!(h.run_next().await.unwrap(), Outcome::Advanced { to: treatment });
        assert_eq!(h.next_job().branch, Some(1));
    }
}

#[tokio::test]
async fn test_loop_can_revisit_an_earlier_step() {
    let h = Harness::new();
    let (entry, back, window) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let journey = h.journey(
        JourneySettings::default(),
        &[
            (entry, start(back)),
            (
                back,
                StepKind::Loop(LoopMetadata {
                    destination: Some(window),
                }),
            ),
            (
                window,
                StepKind::TimeWindow(TimeWindowMetadata {
                    from: hm(0, 0),
                    to: hm(0, 0),
                    timezone_offset_minutes: 0,
                    weekdays: vec![],
                    destination: Some(back),
                }),
            ),
        ],
    );
    h.admit(&customer("lo"), journey, entry).await;

    assert_eq!(h.run_next().await.unwrap(), Outcome::Advanced { to: back });
    assert_eq!(h.run_next().await.unwrap(), Outcome::Parked { at: window });

    // An always-open window fires immediately and loops back.
    let wake = h.next();
    assert_eq!(wake.delay, None);
    assert_eq!(h.run(wake.payload).await.unwrap(), Outcome::Advanced { to: back });
    assert_eq!(h.run_next().await.unwrap(), Outcome::Parked { at: window });
}

#[tokio::test]
async fn test_time_window_waits_for_next_opening() {
    let h = Harness::new();
    let (entry, window, done) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let journey = h.journey(
        JourneySettings::default(),
        &[
            (entry, start(window)),
            (
                window,
                StepKind::TimeWindow(TimeWindowMetadata {
                    from: hm(9, 0),
                    to: hm(10, 0),
                    timezone_offset_minutes: 0,
                    weekdays: vec![],
                    destination: Some(done),
                }),
            ),
            (done, exit()),
        ],
    );
    h.admit(&customer("tw"), journey, entry).await;
    assert_eq!(h.run_next().await.unwrap(), Outcome::Parked { at: window });

    // 12:00:30 Monday -> 09:00 Tuesday.
    let wake = h.next();
    assert_eq!(
        wake.delay,
        Some(std::time::Duration::from_secs(20 * 3600 + 59 * 60 + 30))
    );
    h.clock.set(Utc.with_ymd_and_hms(2024, 3, 5, 9, 0, 0).unwrap());
    assert_eq!(h.run(wake.payload).await.unwrap(), Outcome::Advanced { to: done });
}

struct WaitFlow {
    journey: Uuid,
    entry: Uuid,
    wait: Uuid,
    matched: Uuid,
    timed_out: Uuid,
}

fn wait_flow(h: &Harness) -> WaitFlow {
    let (entry, wait, matched, timed_out) =
        (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let journey = h.journey(
        JourneySettings::default(),
        &[
            (entry, start(wait)),
            (
                wait,
                StepKind::WaitUntilBranch(WaitUntilMetadata {
                    branches: vec![Branch {
                        condition: customer_equals("plan", "pro"),
                        destination: Some(matched),
                    }],
                    timeout_secs: Some(600),
                    timeout_destination: Some(timed_out),
                }),
            ),
            (matched, exit()),
            (timed_out, exit()),
        ],
    );
    WaitFlow {
        journey,
        entry,
        wait,
        matched,
        timed_out,
    }
}

#[tokio::test]
async fn test_wait_until_resumes_on_match() {
    let h = Harness::new();
    let flow = wait_flow(&h);
    h.admit(&customer("wu"), flow.journey, flow.entry).await;

    assert_eq!(h.run_next().await.unwrap(), Outcome::Parked { at: flow.wait });
    assert_eq!(
        h.run_next().await.unwrap(),
        Outcome::Requeued { at: h.later(600) }
    );
    assert!(!h.is_locked("wu", flow.journey).await);

    let upgraded = customer("wu").with_attribute("plan", serde_json::json!("pro"));
    h.engine
        .resume(upgraded, flow.journey, flow.wait, None)
        .await
        .unwrap();
    let mut pending = h.queue.drain();
    assert_eq!(pending.len(), 2);
    let resumed = pending.pop().unwrap();
    let deadline = pending.pop().unwrap();

    assert_eq!(
        h.run(resumed.payload).await.unwrap(),
        Outcome::Advanced { to: flow.matched }
    );
    assert_eq!(h.run_next().await.unwrap(), Outcome::Exited);

    h.clock.advance(Duration::seconds(600));
    assert_eq!(h.run(deadline.payload).await.unwrap(), Outcome::Missing);
}

#[tokio::test]
async fn test_wait_until_times_out() {
    let h = Harness::new();
    let flow = wait_flow(&h);
    h.admit(&customer("wt"), flow.journey, flow.entry).await;
    h.run_next().await.unwrap();
    h.run_next().await.unwrap();

    h.clock.advance(Duration::seconds(600));
    assert_eq!(
        h.run_next().await.unwrap(),
        Outcome::Advanced { to: flow.timed_out }
    );
}

#[tokio::test]
async fn test_admission_requires_known_journey() {
    let h = Harness::new();
    let missing = Uuid::new_v4();
    assert!(matches!(
        h.engine.admit(customer("x"), missing, Uuid::new_v4(), None).await,
        Err(CourierError::JourneyNotFound(id)) if id == missing
    ));
}
