//! Events, event names and transition event descriptors.

use crate::error::EventError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Event processor type of SCXML sessions.
pub const SCXML_EVENT_PROCESSOR: &str = "http://www.w3.org/TR/scxml/#SCXMLEventProcessor";

/// Dot-separated event name (`error.execution`, `done.state.s1`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventName {
    name: String,
    parts: Vec<String>,
}

impl EventName {
    pub fn parse(name: &str) -> Result<Self, EventError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EventError::InvalidName {
                name: name.to_string(),
                reason: "empty name".to_string(),
            });
        }

        let parts: Vec<String> = name.split('.').map(|p| p.to_string()).collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(EventError::InvalidName {
                name: name.to_string(),
                reason: "empty name part".to_string(),
            });
        }
        if parts.iter().any(|p| p.chars().any(char::is_whitespace)) {
            return Err(EventError::InvalidName {
                name: name.to_string(),
                reason: "names cannot contain whitespace".to_string(),
            });
        }

        Ok(Self {
            name: name.to_string(),
            parts,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    /// Checks that `suffix` can complete a generated name such as
    /// `done.state.<id>`: no whitespace and no empty parts.
    pub fn check_suffix(suffix: &str) -> Result<(), EventError> {
        let invalid = |reason: &str| EventError::InvalidName {
            name: suffix.to_string(),
            reason: reason.to_string(),
        };
        if suffix.chars().any(char::is_whitespace) {
            return Err(invalid("names cannot contain whitespace"));
        }
        if suffix.split('.').any(str::is_empty) {
            return Err(invalid("empty name part"));
        }
        Ok(())
    }

    /// Returns true for `error.*` platform events.
    pub fn is_error(&self) -> bool {
        self.parts.first().map(|p| p == "error").unwrap_or(false)
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl TryFrom<String> for EventName {
    type Error = EventError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<EventName> for String {
    fn from(value: EventName) -> Self {
        value.name
    }
}

/// One entry of a transition's `event` attribute.
///
/// A descriptor matches an event when the event's name parts start with the
/// descriptor's parts. A trailing `*` requires at least one further part and
/// a lone `*` matches every event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDescriptor {
    parts: Vec<String>,
    wildcard: bool,
}

impl EventDescriptor {
    pub fn parse(descriptor: &str) -> Result<Self, EventError> {
        let text = descriptor.trim();
        let invalid = |reason: &str| EventError::InvalidDescriptor {
            descriptor: descriptor.to_string(),
            reason: reason.to_string(),
        };

        if text.is_empty() {
            return Err(invalid("empty descriptor"));
        }
        if text == "*" {
            return Ok(Self {
                parts: Vec::new(),
                wildcard: true,
            });
        }

        let mut parts: Vec<&str> = text.split('.').collect();
        let mut wildcard = false;
        match parts.last() {
            Some(&"*") => {
                wildcard = true;
                parts.pop();
            }
            Some(&"") => {
                parts.pop();
            }
            _ => {}
        }

        if parts.is_empty() || parts.iter().any(|p| p.is_empty()) {
            return Err(invalid("empty descriptor part"));
        }
        if parts.iter().any(|p| p.contains('*')) {
            return Err(invalid("'*' is only allowed as the last part"));
        }

        Ok(Self {
            parts: parts.into_iter().map(str::to_string).collect(),
            wildcard,
        })
    }

    /// Parses a whitespace separated descriptor list.
    pub fn parse_list(descriptors: &str) -> Result<Vec<Self>, EventError> {
        descriptors.split_whitespace().map(Self::parse).collect()
    }

    pub fn matches(&self, event: &EventName) -> bool {
        let parts = event.parts();
        if parts.len() < self.parts.len() {
            return false;
        }
        if self.wildcard && !self.parts.is_empty() && parts.len() == self.parts.len() {
            return false;
        }
        self.parts.iter().zip(parts).all(|(d, e)| d == e)
    }

    pub fn is_wildcard(&self) -> bool {
        self.wildcard
    }
}

impl fmt::Display for EventDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.parts.is_empty(), self.wildcard) {
            (true, _) => f.write_str("*"),
            (false, true) => write!(f, "{}.*", self.parts.join(".")),
            (false, false) => f.write_str(&self.parts.join(".")),
        }
    }
}

/// Source class of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    /// Raised by the platform (errors, `done.*`).
    Platform,
    /// Raised by `<raise>` or `<send target="#_internal">`.
    Internal,
    /// Everything delivered through the external queue.
    #[default]
    External,
}

/// An event as seen by the state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: EventName,

    #[serde(rename = "type", default)]
    pub event_type: EventType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoke_id: Option<String>,

    #[serde(default)]
    pub data: Value,
}

impl Event {
    pub fn new(name: EventName, event_type: EventType) -> Self {
        Self {
            name,
            event_type,
            send_id: None,
            origin: None,
            origin_type: None,
            invoke_id: None,
            data: Value::Null,
        }
    }

    /// Creates an external event. Fails on malformed names.
    pub fn external(name: &str) -> Result<Self, EventError> {
        Ok(Self::new(EventName::parse(name)?, EventType::External))
    }

    pub fn internal(name: EventName) -> Self {
        Self::new(name, EventType::Internal)
    }

    /// Creates a platform event (`done.*`, `error.*`).
    pub fn platform(name: &str) -> Result<Self, EventError> {
        Ok(Self::new(EventName::parse(name)?, EventType::Platform))
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_send_id(mut self, send_id: impl Into<String>) -> Self {
        self.send_id = Some(send_id.into());
        self
    }

    pub fn with_invoke_id(mut self, invoke_id: impl Into<String>) -> Self {
        self.invoke_id = Some(invoke_id.into());
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>, origin_type: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self.origin_type = Some(origin_type.into());
        self
    }

    /// Value of the `_event` system variable.
    pub fn to_system_variable(&self) -> Value {
        serde_json::json!({
            "name": self.name.as_str(),
            "type": self.event_type,
            "sendid": self.send_id,
            "origin": self.origin,
            "origintype": self.origin_type,
            "invokeid": self.invoke_id,
            "data": self.data,
        })
    }
}

/// An event produced by `<send>`, before routing.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingEvent {
    pub name: EventName,
    pub send_id: String,
    pub target: Option<String>,
    pub event_type: Option<String>,
    pub delay: Duration,
    pub data: Value,
    /// Sending session (`#_scxml_<sessionid>`).
    pub origin: String,
}

impl OutgoingEvent {
    /// Converts into the event delivered to a receiving SCXML session.
    pub fn into_event(self, event_type: EventType) -> Event {
        Event {
            name: self.name,
            event_type,
            send_id: Some(self.send_id),
            origin: Some(self.origin),
            origin_type: Some(SCXML_EVENT_PROCESSOR.to_string()),
            invoke_id: None,
            data: self.data,
        }
    }
}

/// Parses a send delay: `"250ms"`, `"2s"`, `"1.5s"`, `"1m"`, `"0"`.
pub fn parse_delay(delay: &str) -> Result<Duration, EventError> {
    let text = delay.trim();
    let invalid = || EventError::InvalidDelay(delay.to_string());

    let (number, scale) = if let Some(n) = text.strip_suffix("ms") {
        (n, 0.001)
    } else if let Some(n) = text.strip_suffix('s') {
        (n, 1.0)
    } else if let Some(n) = text.strip_suffix('m') {
        (n, 60.0)
    } else if let Some(n) = text.strip_suffix('h') {
        (n, 3600.0)
    } else {
        (text, 0.001)
    };

    let value: f64 = number.trim().parse().map_err(|_| invalid())?;
    if !value.is_finite() || value < 0.0 {
        return Err(invalid());
    }
    Ok(Duration::from_secs_f64(value * scale))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn name(s: &str) -> EventName {
        EventName::parse(s).unwrap()
    }

    fn desc(s: &str) -> EventDescriptor {
        EventDescriptor::parse(s).unwrap()
    }

    #[test]
    fn test_prefix_matching() {
        assert!(desc("error").matches(&name("error")));
        assert!(desc("error").matches(&name("error.execution")));
        assert!(!desc("error").matches(&name("errors")));
        assert!(!desc("foo").matches(&name("foobar")));
        assert!(!desc("error.execution").matches(&name("error")));
    }

    #[test]
    fn test_check_suffix() {
        assert!(EventName::check_suffix("s1").is_ok());
        assert!(EventName::check_suffix("job.42").is_ok());
        assert!(EventName::check_suffix("my work").is_err());
        assert!(EventName::check_suffix("a.").is_err());
        assert!(EventName::check_suffix("a..b").is_err());
        assert!(EventName::check_suffix("").is_err());
    }

    #[test]
    fn test_wildcard_matching() {
        assert!(desc("error.*").matches(&name("error.execution")));
        assert!(desc("error.*").matches(&name("error.execution.deep")));
        assert!(!desc("error.*").matches(&name("error")));
        assert!(desc("*").matches(&name("anything")));
        assert!(desc("*").matches(&name("a.b.c")));
    }

    #[test]
    fn test_trailing_dot_is_ignored() {
        let d = desc("done.state.");
        assert!(d.matches(&name("done.state")));
        assert!(d.matches(&name("done.state.s1")));
        assert_eq!(d.to_string(), "done.state");
    }

    #[test]
    fn test_invalid_descriptors() {
        assert!(EventDescriptor::parse("").is_err());
        assert!(EventDescriptor::parse("a..b").is_err());
        assert!(EventDescriptor::parse("a.*.b").is_err());
        assert!(EventDescriptor::parse("a*").is_err());
    }

    #[test]
    fn test_descriptor_list() {
        let list = EventDescriptor::parse_list("go  stop.*\terror").unwrap();
        assert_eq!(list.len(), 3);
        assert!(list[1].is_wildcard());
    }

    #[test]
    fn test_event_name_validation() {
        assert!(EventName::parse("").is_err());
        assert!(EventName::parse("a..b").is_err());
        assert!(EventName::parse(".a").is_err());
        assert!(name("error.platform").is_error());
        assert!(!name("errors").is_error());
    }

    #[test]
    fn test_event_serde() {
        let event = Event::external("order.paid")
            .unwrap()
            .with_data(serde_json::json!({"amount": 10}))
            .with_send_id("s-1");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["name"], "order.paid");
        assert_eq!(json["type"], "external");

        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);

        let bad = serde_json::json!({"name": "a..b"});
        assert!(serde_json::from_value::<Event>(bad).is_err());
    }

    #[test]
    fn test_parse_delay() {
        assert_eq!(parse_delay("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_delay("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_delay("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_delay("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_delay("0").unwrap(), Duration::ZERO);
        assert!(parse_delay("soon").is_err());
        assert!(parse_delay("-1s").is_err());
    }

    proptest! {
        #[test]
        fn prop_name_matches_its_own_prefixes(parts in prop::collection::vec("[a-z]{1,6}", 1..5)) {
            let event = name(&parts.join("."));
            for len in 1..=parts.len() {
                let prefix = parts[..len].join(".");
                prop_assert!(desc(&prefix).matches(&event));
                if len < parts.len() {
                    let wildcard = format!("{}.*", prefix);
                    prop_assert!(desc(&wildcard).matches(&event));
                }
            }
        }

        #[test]
        fn prop_wildcard_never_matches_equal_length(parts in prop::collection::vec("[a-z]{1,6}", 1..5)) {
            let joined = parts.join(".");
            let wildcard = format!("{}.*", joined);
            prop_assert!(!desc(&wildcard).matches(&name(&joined)));
        }
    }
}
