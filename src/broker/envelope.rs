//! Broker-level message representation and dead-letter history.

use std::fmt;

use bytes::Bytes;
use time::OffsetDateTime;
use uuid::Uuid;

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Why a queue dead-lettered a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeathReason {
    Rejected,
    Expired,
}

impl DeathReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DeathReason::Rejected => "rejected",
            DeathReason::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "rejected" => Some(DeathReason::Rejected),
            "expired" => Some(DeathReason::Expired),
            _ => None,
        }
    }
}

impl fmt::Display for DeathReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `x-death` entry: how often the message died in `queue` for `reason`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeathRecord {
    pub queue: String,
    pub reason: DeathReason,
    pub count: u64,
    pub exchange: String,
    pub routing_keys: Vec<String>,
    pub time: OffsetDateTime,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryHeaders {
    /// Most recent death first, one entry per (queue, reason).
    pub deaths: Vec<DeathRecord>,
    pub first_death_queue: Option<String>,
    pub first_death_reason: Option<DeathReason>,
    /// Set when the dispatcher quarantines a message.
    pub final_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub message_id: String,
    pub content_type: String,
    pub persistent: bool,
    pub payload: Bytes,
    /// Exchange and key the message was last routed with.
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub headers: DeliveryHeaders,
}

impl Envelope {
    /// A fresh persistent JSON message with a random id.
    pub fn json(payload: Bytes) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            content_type: JSON_CONTENT_TYPE.to_string(),
            persistent: true,
            payload,
            exchange: String::new(),
            routing_key: String::new(),
            redelivered: false,
            headers: DeliveryHeaders::default(),
        }
    }

    /// How many times `queue` rejected this message.
    pub fn rejections_from(&self, queue: &str) -> u64 {
        self.deaths_in(queue, DeathReason::Rejected)
    }

    pub fn deaths_in(&self, queue: &str, reason: DeathReason) -> u64 {
        self.headers
            .deaths
            .iter()
            .filter(|death| death.queue == queue && death.reason == reason)
            .map(|death| death.count)
            .sum()
    }

    /// Records that `queue` dead-lettered the message, following the broker's
    /// `x-death` rules: the matching entry is incremented and moved to the
    /// front, otherwise a new entry is prepended.
    pub fn record_death(&mut self, queue: &str, reason: DeathReason, at: OffsetDateTime) {
        let position = self
            .headers
            .deaths
            .iter()
            .position(|death| death.queue == queue && death.reason == reason);

        let record = match position {
            Some(index) => {
                let mut existing = self.headers.deaths.remove(index);
                existing.count += 1;
                existing.time = at;
                existing.exchange = self.exchange.clone();
                existing.routing_keys = vec![self.routing_key.clone()];
                existing
            }
            None => DeathRecord {
                queue: queue.to_string(),
                reason,
                count: 1,
                exchange: self.exchange.clone(),
                routing_keys: vec![self.routing_key.clone()],
                time: at,
            },
        };
        self.headers.deaths.insert(0, record);

        if self.headers.first_death_queue.is_none() {
            self.headers.first_death_queue = Some(queue.to_string());
            self.headers.first_death_reason = Some(reason);
        }
    }

    /// Copy for the terminal queue: history kept, failure recorded.
    pub fn quarantined(&self, final_error: impl Into<String>) -> Self {
        let mut copy = self.clone();
        copy.persistent = true;
        copy.redelivered = false;
        copy.headers.final_error = Some(final_error.into());
        copy
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    fn routed(exchange: &str, key: &str) -> Envelope {
        let mut envelope = Envelope::json(Bytes::from_static(b"{}"));
        envelope.exchange = exchange.to_string();
        envelope.routing_key = key.to_string();
        envelope
    }

    #[test]
    fn fresh_envelope_is_persistent_json() {
        let envelope = Envelope::json(Bytes::from_static(b"{}"));
        assert!(envelope.persistent);
        assert_eq!(envelope.content_type, JSON_CONTENT_TYPE);
        assert!(!envelope.message_id.is_empty());
        assert_eq!(envelope.rejections_from("primary"), 0);
    }

    #[test]
    fn repeated_deaths_in_the_same_queue_increment_one_entry() {
        let mut envelope = routed("ex", "key");
        envelope.record_death("primary", DeathReason::Rejected, datetime!(2024-01-01 0:00 UTC));
        envelope.record_death("tier-1", DeathReason::Expired, datetime!(2024-01-01 0:00:05 UTC));
        envelope.record_death("primary", DeathReason::Rejected, datetime!(2024-01-01 0:01 UTC));

        assert_eq!(envelope.headers.deaths.len(), 2);
        assert_eq!(envelope.headers.deaths[0].queue, "primary");
        assert_eq!(envelope.headers.deaths[0].count, 2);
        assert_eq!(envelope.rejections_from("primary"), 2);
        assert_eq!(envelope.deaths_in("tier-1", DeathReason::Expired), 1);
        assert_eq!(envelope.headers.first_death_queue.as_deref(), Some("primary"));
        assert_eq!(envelope.headers.first_death_reason, Some(DeathReason::Rejected));
    }

    #[test]
    fn expirations_do_not_count_as_rejections() {
        let mut envelope = routed("ex", "key");
        envelope.record_death("primary", DeathReason::Expired, datetime!(2024-01-01 0:00 UTC));
        assert_eq!(envelope.rejections_from("primary"), 0);
    }

    #[test]
    fn quarantine_keeps_history_and_records_error() {
        let mut envelope = routed("ex", "key");
        envelope.redelivered = true;
        envelope.record_death("primary", DeathReason::Rejected, datetime!(2024-01-01 0:00 UTC));

        let copy = envelope.quarantined("database timeout");
        assert_eq!(copy.message_id, envelope.message_id);
        assert_eq!(copy.headers.deaths, envelope.headers.deaths);
        assert_eq!(copy.headers.final_error.as_deref(), Some("database timeout"));
        assert!(!copy.redelivered);
    }
}
