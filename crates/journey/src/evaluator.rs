//! Branch, split and timer evaluation for journey steps.
//!
//! Everything here is a pure function of the step metadata, the customer
//! snapshot, the triggering event and "now"; the dispatcher decides what to
//! do with the result.

use std::cmp::Ordering;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Utc};
use courier_core::types::{
    Branch, ComparisonOperator, Condition, Customer, ExperimentVariant, TimeWindowMetadata,
    TriggerEvent,
};
use rand::Rng;
use serde_json::Value;

/// Evaluates one branch condition against the customer and event.
pub fn condition_matches(
    condition: &Condition,
    customer: &Customer,
    event: Option<&TriggerEvent>,
) -> bool {
    match condition {
        Condition::Always => true,
        Condition::Customer {
            key,
            operator,
            value,
        } => compare_values(&customer_value(customer, key), operator, value),
        Condition::Event {
            key,
            operator,
            value,
        } => compare_values(&event_value(event, key), operator, value),
    }
}

/// First branch whose condition holds, with its index.
pub fn first_match<'a>(
    branches: &'a [Branch],
    customer: &Customer,
    event: Option<&TriggerEvent>,
) -> Option<(usize, &'a Branch)> {
    branches
        .iter()
        .enumerate()
        .find(|(_, branch)| condition_matches(&branch.condition, customer, event))
}

pub fn compare_values(actual: &Value, operator: &ComparisonOperator, expected: &Value) -> bool {
    match operator {
        ComparisonOperator::Equals => loosely_equal(actual, expected),
        ComparisonOperator::NotEquals => !loosely_equal(actual, expected),
        ComparisonOperator::GreaterThan => {
            numeric_cmp(actual, expected).map_or(false, |o| o == Ordering::Greater)
        }
        ComparisonOperator::LessThan => {
            numeric_cmp(actual, expected).map_or(false, |o| o == Ordering::Less)
        }
        ComparisonOperator::Contains => match actual {
            Value::String(a) => expected.as_str().map_or(false, |e| a.contains(e)),
            Value::Array(items) => items.iter().any(|item| loosely_equal(item, expected)),
            _ => false,
        },
        ComparisonOperator::IsSet => !actual.is_null(),
        ComparisonOperator::IsNotSet => actual.is_null(),
        ComparisonOperator::InList => expected
            .as_array()
            .map_or(false, |list| list.iter().any(|item| loosely_equal(actual, item))),
    }
}

/// Numbers compare by value so `1` matches `1.0`.
fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn numeric_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    let a = a.as_f64().or_else(|| a.as_str()?.parse().ok())?;
    let b = b.as_f64().or_else(|| b.as_str()?.parse().ok())?;
    a.partial_cmp(&b)
}

fn customer_value(customer: &Customer, key: &str) -> Value {
    if key == "id" {
        return Value::String(customer.id.clone());
    }
    customer.attributes.get(key).cloned().unwrap_or(Value::Null)
}

fn event_value(event: Option<&TriggerEvent>, key: &str) -> Value {
    match event {
        None => Value::Null,
        Some(event) if key == "name" => Value::String(event.name.clone()),
        Some(event) => event.payload.get(key).cloned().unwrap_or(Value::Null),
    }
}

/// Weighted random choice among variants. Variants with non-positive
/// weight are never picked; `None` when no variant has weight.
pub fn pick_variant<'a, R: Rng>(
    variants: &'a [ExperimentVariant],
    rng: &mut R,
) -> Option<(usize, &'a ExperimentVariant)> {
    let total: f32 = variants.iter().map(|v| v.weight.max(0.0)).sum();
    if total <= 0.0 {
        return None;
    }
    let mut roll = rng.gen::<f32>() * total;
    let mut last = None;
    for (index, variant) in variants.iter().enumerate() {
        if variant.weight <= 0.0 {
            continue;
        }
        last = Some((index, variant));
        roll -= variant.weight;
        if roll < 0.0 {
            return last;
        }
    }
    // Float rounding can leave a sliver of roll; it belongs to the last variant.
    last
}

/// Earliest instant at or after `now` that lies inside the recurring window.
///
/// `from == to` means the whole day. Returns `None` only when the weekday
/// filter can never match.
pub fn next_window_instant(
    window: &TimeWindowMetadata,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let offset = Duration::minutes(window.timezone_offset_minutes as i64);
    let local_now = now.naive_utc() + offset;
    let today = local_now.date();

    // Start one day back so an overnight window opened yesterday is seen.
    for day in -1..=7 {
        let date = today + Duration::days(day);
        if !weekday_allowed(window, date) {
            continue;
        }
        let (start, end) = window_bounds(window, date);
        if local_now < start {
            return Some(to_utc(start, offset));
        }
        if local_now < end {
            return Some(now);
        }
    }
    None
}

fn weekday_allowed(window: &TimeWindowMetadata, date: NaiveDate) -> bool {
    window.weekdays.is_empty() || window.weekdays.contains(&date.weekday())
}

fn window_bounds(window: &TimeWindowMetadata, date: NaiveDate) -> (NaiveDateTime, NaiveDateTime) {
    let start = date.and_time(window.from);
    let end = if window.from < window.to {
        date.and_time(window.to)
    } else {
        (date + Duration::days(1)).and_time(window.to)
    };
    (start, end)
}

fn to_utc(local: NaiveDateTime, offset: Duration) -> DateTime<Utc> {
    DateTime::<Utc>::from_naive_utc_and_offset(local - offset, Utc)
}
