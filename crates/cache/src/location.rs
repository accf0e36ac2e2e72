//! Redis-backed journey locations.
//!
//! One hash per (journey, customer). Lock transitions run as Lua scripts so
//! the compare and the write happen in a single server-side step.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::contracts::LocationStore;
use courier_core::types::{JourneyLocation, LockAttempt, LockState};
use courier_core::{CourierError, CourierResult};
use redis::{AsyncCommands, Script};
use uuid::Uuid;

use crate::client::{store_err, RedisClient};

const CREATE: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('HSET', KEYS[1], unpack(ARGV))
return 1
"#;

// ARGV: token, now_ms, max_hold_ms
const TRY_LOCK: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return {'missing'}
end
local state = redis.call('HGET', KEYS[1], 'lock_state') or 'unlocked'
local holder = redis.call('HGET', KEYS[1], 'lock_token') or ''
if state == 'unlocked' or (state == 'reserved' and holder == ARGV[1]) then
  redis.call('HSET', KEYS[1], 'lock_state', 'held', 'lock_token', ARGV[1], 'locked_at', ARGV[2])
  return {'acquired'}
end
local locked_at = tonumber(redis.call('HGET', KEYS[1], 'locked_at') or '0')
if tonumber(ARGV[2]) - locked_at >= tonumber(ARGV[3]) then
  redis.call('HSET', KEYS[1], 'lock_state', 'held', 'lock_token', ARGV[1], 'locked_at', ARGV[2])
  return {'reclaimed', holder}
end
return {'busy'}
"#;

// ARGV: token
const UNLOCK: &str = r#"
if redis.call('HGET', KEYS[1], 'lock_token') ~= ARGV[1] then
  return 0
end
redis.call('HSET', KEYS[1], 'lock_state', 'unlocked')
redis.call('HDEL', KEYS[1], 'lock_token', 'locked_at')
return 1
"#;

// ARGV: token, next_token, now_ms
const HAND_OFF: &str = r#"
if redis.call('HGET', KEYS[1], 'lock_state') ~= 'held' or redis.call('HGET', KEYS[1], 'lock_token') ~= ARGV[1] then
  return 0
end
redis.call('HSET', KEYS[1], 'lock_state', 'reserved', 'lock_token', ARGV[2], 'locked_at', ARGV[3])
return 1
"#;

// ARGV: token, then field/value pairs
const UPDATE_IF_OWNER: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return -1
end
local state = redis.call('HGET', KEYS[1], 'lock_state')
if (state ~= 'held' and state ~= 'reserved') or redis.call('HGET', KEYS[1], 'lock_token') ~= ARGV[1] then
  return 0
end
redis.call('HSET', KEYS[1], unpack(ARGV, 2))
return 1
"#;

// ARGV: token
const FINALIZE_IF_OWNER: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 1
end
local state = redis.call('HGET', KEYS[1], 'lock_state')
if (state ~= 'held' and state ~= 'reserved') or redis.call('HGET', KEYS[1], 'lock_token') ~= ARGV[1] then
  return 0
end
redis.call('DEL', KEYS[1])
return 1
"#;

pub struct RedisLocationStore {
    client: RedisClient,
    create: Script,
    try_lock: Script,
    unlock: Script,
    hand_off: Script,
    update: Script,
    finalize: Script,
}

impl RedisLocationStore {
    pub fn new(client: RedisClient) -> Self {
        Self {
            client,
            create: Script::new(CREATE),
            try_lock: Script::new(TRY_LOCK),
            unlock: Script::new(UNLOCK),
            hand_off: Script::new(HAND_OFF),
            update: Script::new(UPDATE_IF_OWNER),
            finalize: Script::new(FINALIZE_IF_OWNER),
        }
    }

    async fn update(
        &self,
        customer_id: &str,
        journey_id: Uuid,
        token: Uuid,
        fields: &[(&str, String)],
    ) -> CourierResult<()> {
        let mut conn = self.client.conn();
        let mut invocation = self.update.key(self.client.keys().location(journey_id, customer_id));
        invocation.arg(token.to_string());
        for (field, value) in fields {
            invocation.arg(*field).arg(value);
        }
        let updated: i64 = invocation.invoke_async(&mut conn).await.map_err(store_err)?;
        match updated {
            1 => Ok(()),
            0 => Err(not_owner(customer_id, journey_id, token)),
            _ => Err(CourierError::Store(format!(
                "location for customer {customer_id} in journey {journey_id} is gone"
            ))),
        }
    }
}

fn not_owner(customer_id: &str, journey_id: Uuid, token: Uuid) -> CourierError {
    CourierError::Store(format!(
        "lock for customer {customer_id} in journey {journey_id} is not owned by {token}"
    ))
}

/// Flattens a location into hash fields.
pub fn location_fields(location: &JourneyLocation) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        ("current_step_id", location.current_step_id.to_string()),
        ("message_sent", if location.message_sent { "1" } else { "0" }.to_string()),
        ("step_entered_at", location.step_entered_at.timestamp_millis().to_string()),
        ("admitted_at", location.admitted_at.timestamp_millis().to_string()),
    ];
    let (state, token) = match location.lock {
        LockState::Unlocked => ("unlocked", None),
        LockState::Reserved { token } => ("reserved", Some(token)),
        LockState::Held { token } => ("held", Some(token)),
    };
    fields.push(("lock_state", state.to_string()));
    if let Some(token) = token {
        fields.push(("lock_token", token.to_string()));
    }
    if let Some(locked_at) = location.locked_at {
        fields.push(("locked_at", locked_at.timestamp_millis().to_string()));
    }
    fields
}

/// Rebuilds a location from `HGETALL`; an empty map means no location.
pub fn parse_location(
    customer_id: &str,
    journey_id: Uuid,
    fields: &HashMap<String, String>,
) -> CourierResult<Option<JourneyLocation>> {
    if fields.is_empty() {
        return Ok(None);
    }
    let field = |name: &str| {
        fields
            .get(name)
            .ok_or_else(|| CourierError::Store(format!("location field '{name}' missing")))
    };
    let uuid = |name: &str| -> CourierResult<Uuid> {
        Uuid::parse_str(field(name)?).map_err(|e| CourierError::Store(format!("{name}: {e}")))
    };
    let millis = |raw: &str, name: &str| -> CourierResult<DateTime<Utc>> {
        raw.parse::<i64>()
            .ok()
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| CourierError::Store(format!("{name}: invalid timestamp '{raw}'")))
    };

    let lock = match field("lock_state")?.as_str() {
        "unlocked" => LockState::Unlocked,
        "reserved" => LockState::Reserved {
            token: uuid("lock_token")?,
        },
        "held" => LockState::Held {
            token: uuid("lock_token")?,
        },
        other => return Err(CourierError::Store(format!("unknown lock state '{other}'"))),
    };
    let locked_at = match fields.get("locked_at") {
        Some(raw) => Some(millis(raw, "locked_at")?),
        None => None,
    };

    Ok(Some(JourneyLocation {
        customer_id: customer_id.to_string(),
        journey_id,
        current_step_id: uuid("current_step_id")?,
        lock,
        locked_at,
        message_sent: field("message_sent")? == "1",
        step_entered_at: millis(field("step_entered_at")?, "step_entered_at")?,
        admitted_at: millis(field("admitted_at")?, "admitted_at")?,
    }))
}

#[async_trait]
impl LocationStore for RedisLocationStore {
    async fn create(&self, location: JourneyLocation) -> CourierResult<bool> {
        let mut conn = self.client.conn();
        let key = self
            .client
            .keys()
            .location(location.journey_id, &location.customer_id);
        let mut invocation = self.create.key(key);
        for (field, value) in location_fields(&location) {
            invocation.arg(field).arg(value);
        }
        let created: i64 = invocation.invoke_async(&mut conn).await.map_err(store_err)?;
        Ok(created == 1)
    }

    async fn get(
        &self,
        customer_id: &str,
        journey_id: Uuid,
    ) -> CourierResult<Option<JourneyLocation>> {
        let mut conn = self.client.conn();
        let fields: HashMap<String, String> = conn
            .hgetall(self.client.keys().location(journey_id, customer_id))
            .await
            .map_err(store_err)?;
        parse_location(customer_id, journey_id, &fields)
    }

    async fn try_lock(
        &self,
        customer_id: &str,
        journey_id: Uuid,
        token: Uuid,
        now: DateTime<Utc>,
        max_hold: chrono::Duration,
    ) -> CourierResult<LockAttempt> {
        let mut conn = self.client.conn();
        let reply: Vec<String> = self
            .try_lock
            .key(self.client.keys().location(journey_id, customer_id))
            .arg(token.to_string())
            .arg(now.timestamp_millis())
            .arg(max_hold.num_milliseconds())
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;

        match reply.first().map(String::as_str) {
            Some("acquired") => Ok(LockAttempt::Acquired),
            Some("reclaimed") => Ok(LockAttempt::Reclaimed {
                previous: reply
                    .get(1)
                    .and_then(|raw| Uuid::parse_str(raw).ok())
                    .unwrap_or_default(),
            }),
            Some("busy") => Ok(LockAttempt::Busy),
            Some("missing") => Ok(LockAttempt::Missing),
            other => Err(CourierError::Store(format!("unexpected lock reply {other:?}"))),
        }
    }

    async fn unlock(&self, customer_id: &str, journey_id: Uuid, token: Uuid) -> CourierResult<bool> {
        let mut conn = self.client.conn();
        let released: i64 = self
            .unlock
            .key(self.client.keys().location(journey_id, customer_id))
            .arg(token.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(released == 1)
    }

    async fn hand_off(
        &self,
        customer_id: &str,
        journey_id: Uuid,
        token: Uuid,
        next_token: Uuid,
        now: DateTime<Utc>,
    ) -> CourierResult<bool> {
        let mut conn = self.client.conn();
        let moved: i64 = self
            .hand_off
            .key(self.client.keys().location(journey_id, customer_id))
            .arg(token.to_string())
            .arg(next_token.to_string())
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(moved == 1)
    }

    async fn move_to(
        &self,
        customer_id: &str,
        journey_id: Uuid,
        token: Uuid,
        step_id: Uuid,
        now: DateTime<Utc>,
    ) -> CourierResult<()> {
        self.update(
            customer_id,
            journey_id,
            token,
            &[
                ("current_step_id", step_id.to_string()),
                ("message_sent", "0".to_string()),
                ("step_entered_at", now.timestamp_millis().to_string()),
            ],
        )
        .await
    }

    async fn set_message_sent(
        &self,
        customer_id: &str,
        journey_id: Uuid,
        token: Uuid,
    ) -> CourierResult<()> {
        self.update(customer_id, journey_id, token, &[("message_sent", "1".to_string())])
            .await
    }

    async fn finalize(&self, customer_id: &str, journey_id: Uuid, token: Uuid) -> CourierResult<()> {
        let mut conn = self.client.conn();
        let removed: i64 = self
            .finalize
            .key(self.client.keys().location(journey_id, customer_id))
            .arg(token.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        if removed == 1 {
            Ok(())
        } else {
            Err(not_owner(customer_id, journey_id, token))
        }
    }
}
