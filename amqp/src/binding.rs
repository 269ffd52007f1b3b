use serde::{Deserialize, Serialize};
use strum_macros::EnumString;

#[derive(
    strum_macros::Display,
    EnumString,
    Debug,
    Default,
    PartialEq,
    Eq,
    Clone,
    Copy,
    Hash,
    Deserialize,
    Serialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExchangeType {
    #[default]
    Direct,
    Topic,
    Fanout,
    Headers,
}

/// Exchange/queue/routing-key link owned by the channel or command that
/// created it. `event_key`/`event_subkey` name the payload fields used to
/// classify a delivery without handing the whole body around.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Binding {
    pub exchange: String,
    #[serde(default)]
    pub exchange_type: ExchangeType,
    pub routing_key: String,
    pub queue: String,
    #[serde(default)]
    pub event_key: Option<String>,
    #[serde(default)]
    pub event_subkey: Option<String>,
    #[serde(default)]
    pub passive: bool,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub no_ack: bool,
    #[serde(default)]
    pub wait_for_consumer_ack: bool,
    #[serde(default)]
    pub federate: bool,
}

impl Binding {
    pub fn new(
        exchange: &str,
        exchange_type: ExchangeType,
        queue: &str,
        routing_key: &str,
    ) -> Self {
        Self {
            exchange: exchange.to_string(),
            exchange_type,
            routing_key: routing_key.to_string(),
            queue: queue.to_string(),
            ..Default::default()
        }
    }

    pub fn with_event_keys(mut self, key: &str, subkey: &str) -> Self {
        self.event_key = Some(key.to_string());
        self.event_subkey = Some(subkey.to_string());
        self
    }

    pub fn federated(mut self) -> Self {
        self.federate = true;
        self
    }

    /// Whether deliveries on this binding have to be acked by the broker
    /// client at all.
    pub fn needs_ack(&self) -> bool {
        !self.no_ack
    }

    /// Pulls the event key and subkey values out of a JSON payload.
    pub fn classify(&self, payload: &str) -> (Option<String>, Option<String>) {
        if self.event_key.is_none() && self.event_subkey.is_none() {
            return (None, None);
        }
        let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) else {
            return (None, None);
        };
        let field = |name: &Option<String>| {
            name.as_ref()
                .and_then(|name| value.get(name))
                .and_then(|v| v.as_str())
                .map(|v| v.to_string())
        };
        (field(&self.event_key), field(&self.event_subkey))
    }

    /// AMQP topic matching: `*` is exactly one word, `#` zero or more.
    pub fn matches(&self, routing_key: &str) -> bool {
        match self.exchange_type {
            ExchangeType::Fanout => true,
            ExchangeType::Direct | ExchangeType::Headers => {
                self.routing_key == routing_key
            }
            ExchangeType::Topic => topic_match(
                &self.routing_key.split('.').collect::<Vec<_>>(),
                &routing_key.split('.').collect::<Vec<_>>(),
            ),
        }
    }
}

fn topic_match(pattern: &[&str], words: &[&str]) -> bool {
    match (pattern.first(), words.first()) {
        (None, None) => true,
        (Some(&"#"), _) => {
            topic_match(&pattern[1..], words)
                || (!words.is_empty() && topic_match(pattern, &words[1..]))
        }
        (Some(&"*"), Some(_)) => topic_match(&pattern[1..], &words[1..]),
        (Some(p), Some(w)) if p == w => topic_match(&pattern[1..], &words[1..]),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn topic_matching() {
        let binding =
            Binding::new("dialoginfo", ExchangeType::Topic, "q", "dialog.*.#");
        assert!(binding.matches("dialog.user.realm"));
        assert!(binding.matches("dialog.user"));
        assert!(!binding.matches("presence.user"));
        assert!(!binding.matches("dialog"));

        let binding = Binding::new("presence", ExchangeType::Topic, "q", "#");
        assert!(binding.matches("anything.at.all"));
    }

    #[test]
    fn direct_and_fanout() {
        let direct = Binding::new("targeted", ExchangeType::Direct, "q", "a.b");
        assert!(direct.matches("a.b"));
        assert!(!direct.matches("a.c"));
        let fanout = Binding::new("broadcast", ExchangeType::Fanout, "q", "");
        assert!(fanout.matches("whatever"));
    }

    #[test]
    fn classify_payload() {
        let binding = Binding::new("presence", ExchangeType::Topic, "q", "#")
            .with_event_keys("Event-Category", "Event-Name");
        let (key, subkey) = binding.classify(
            r#"{"Event-Category":"presence","Event-Name":"update","From":"a"}"#,
        );
        assert_eq!(key.as_deref(), Some("presence"));
        assert_eq!(subkey.as_deref(), Some("update"));
        assert_eq!(binding.classify("not json"), (None, None));
    }

    #[test]
    fn exchange_type_names() {
        assert_eq!(ExchangeType::Topic.to_string(), "topic");
        assert_eq!(ExchangeType::from_str("fanout").unwrap(), ExchangeType::Fanout);
    }
}
