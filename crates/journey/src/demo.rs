//! Demo journey for local runs.

use chrono::{NaiveTime, Utc};
use courier_core::types::{
    Branch, Channel, ComparisonOperator, Condition, ExitMetadata, Journey, JourneySettings,
    MessageMetadata, MultisplitMetadata, QuietHoursConfig, QuietHoursFallback, RateLimitConfig,
    StartMetadata, Step, StepKind, Template, TimeDelayMetadata,
};
use tracing::info;
use uuid::Uuid;

use crate::catalog::InMemoryCatalog;
use crate::registry::JourneyRegistry;

/// Ids a caller needs to admit customers into the demo journey.
#[derive(Debug, Clone, Copy)]
pub struct DemoJourney {
    pub journey_id: Uuid,
    pub start_step: Uuid,
}

/// Seeds a welcome series: welcome email, one-day delay, then a VIP offer
/// for customers whose `tier` is `vip` before exiting.
pub fn seed_demo_journey(catalog: &InMemoryCatalog, registry: &JourneyRegistry) -> DemoJourney {
    let now = Utc::now();
    let journey_id = Uuid::new_v4();
    let owner_id = Uuid::new_v4();

    let start_id = Uuid::new_v4();
    let welcome_id = Uuid::new_v4();
    let delay_id = Uuid::new_v4();
    let split_id = Uuid::new_v4();
    let offer_id = Uuid::new_v4();
    let exit_id = Uuid::new_v4();

    let welcome_template = Template {
        id: Uuid::new_v4(),
        owner_id,
        name: "welcome_email".to_string(),
        channel: Channel::Email,
        subject: Some("Welcome, {{customer.first_name | default}}".to_string()),
        body: "Hi {{customer.first_name | default}}, thanks for joining.".to_string(),
        webhook: None,
    };
    let offer_template = Template {
        id: Uuid::new_v4(),
        owner_id,
        name: "vip_offer".to_string(),
        channel: Channel::Email,
        subject: Some("A little something for you".to_string()),
        body: "{{customer.first_name | upcase}}, here is 20% off your next order.".to_string(),
        webhook: None,
    };

    let steps = vec![
        (start_id, StepKind::Start(StartMetadata {
            destination: Some(welcome_id),
        })),
        (welcome_id, StepKind::Message(MessageMetadata {
            template_id: welcome_template.id,
            destination: Some(delay_id),
        })),
        (delay_id, StepKind::TimeDelay(TimeDelayMetadata {
            delay_secs: 86_400,
            destination: Some(split_id),
        })),
        (split_id, StepKind::Multisplit(MultisplitMetadata {
            branches: vec![Branch {
                condition: Condition::Customer {
                    key: "tier".to_string(),
                    operator: ComparisonOperator::Equals,
                    value: serde_json::json!("vip"),
                },
                destination: Some(offer_id),
            }],
            default_destination: Some(exit_id),
        })),
        (offer_id, StepKind::Message(MessageMetadata {
            template_id: offer_template.id,
            destination: Some(exit_id),
        })),
        (exit_id, StepKind::Exit(ExitMetadata {
            reason: "Welcome series complete".to_string(),
        })),
    ];

    let journey = Journey {
        id: journey_id,
        owner_id,
        name: "Welcome Series".to_string(),
        steps: steps.iter().map(|(id, _)| *id).collect(),
        settings: JourneySettings {
            quiet_hours: QuietHoursConfig {
                enabled: true,
                start_time: NaiveTime::from_hms_opt(22, 0, 0).unwrap_or_default(),
                end_time: NaiveTime::from_hms_opt(7, 0, 0).unwrap_or_default(),
                timezone_offset_minutes: 0,
                fallback: Some(QuietHoursFallback::RequeueAtNextAvailableTime),
            },
            max_messages_per_minute: RateLimitConfig {
                enabled: true,
                max: 600,
            },
            ..JourneySettings::default()
        },
        is_paused: false,
        is_stopped: false,
        created_at: now,
        updated_at: now,
        version: 1,
    };

    for (id, kind) in steps {
        catalog.insert_step(Step {
            id,
            journey_id,
            name: kind.label().to_string(),
            kind,
        });
    }
    catalog.insert_template(welcome_template);
    catalog.insert_template(offer_template);
    registry.register(journey);

    info!(journey_id = %journey_id, start_step = %start_id, "Seeded demo journey");
    DemoJourney {
        journey_id,
        start_step: start_id,
    }
}
