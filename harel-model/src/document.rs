//! Statechart document types.
//!
//! Documents mirror the SCXML element tree and can be built in code or
//! deserialized from a JSON DSL:
//!
//! ```json
//! {
//!   "name": "door",
//!   "datamodel": "json",
//!   "data": [{"id": "opened", "expr": "0"}],
//!   "states": [
//!     {"kind": "state", "id": "closed", "transitions": [
//!       {"event": "open", "target": "open", "actions": [
//!         {"action": "assign", "location": "opened", "expr": "opened + 1"}
//!       ]}
//!     ]},
//!     {"kind": "state", "id": "open", "transitions": [
//!       {"event": "close", "target": "closed"}
//!     ]},
//!     {"kind": "final", "id": "broken"}
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Root of a statechart document (`<scxml>`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Document {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Initial state ids; defaults to the first child state.
    #[serde(deserialize_with = "deserialize_id_list")]
    pub initial: Vec<String>,

    /// Data model handler name (`json`, `null`); registry default if absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datamodel: Option<String>,

    pub binding: Binding,

    pub data: Vec<DataElement>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<ScriptElement>,

    pub states: Vec<StateElement>,
}

impl Document {
    /// Parses a document from its JSON representation.
    pub fn from_json(json: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(json.clone())
    }

    /// Checksum of the canonical JSON form, used to cache built models.
    pub fn checksum(&self) -> Result<String, serde_json::Error> {
        let bytes = serde_json::to_vec(self)?;
        Ok(format!("{:08x}", crc32c::crc32c(&bytes)))
    }
}

/// Data binding mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Binding {
    /// All data is initialized when the session starts.
    #[default]
    Early,
    /// Data is initialized when its state is first entered.
    Late,
}

/// A state-like child element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StateElement {
    State(StateDefinition),
    Parallel(ParallelDefinition),
    Final(FinalDefinition),
    History(HistoryDefinition),
}

impl StateElement {
    pub fn id(&self) -> Option<&str> {
        match self {
            StateElement::State(s) => s.id.as_deref(),
            StateElement::Parallel(p) => p.id.as_deref(),
            StateElement::Final(f) => f.id.as_deref(),
            StateElement::History(h) => h.id.as_deref(),
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            StateElement::State(_) => "state",
            StateElement::Parallel(_) => "parallel",
            StateElement::Final(_) => "final",
            StateElement::History(_) => "history",
        }
    }
}

/// `<state>`: atomic when it has no child states, compound otherwise.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateDefinition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(deserialize_with = "deserialize_id_list", skip_serializing_if = "Vec::is_empty")]
    pub initial: Vec<String>,

    /// `<initial>` child element.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_transition: Option<TransitionDefinition>,

    pub states: Vec<StateElement>,
    pub transitions: Vec<TransitionDefinition>,
    pub on_entry: Vec<ActionElement>,
    pub on_exit: Vec<ActionElement>,
    pub invoke: Vec<InvokeDefinition>,
    pub data: Vec<DataElement>,
}

/// `<parallel>`: every child region is active at once.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelDefinition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub states: Vec<StateElement>,
    pub transitions: Vec<TransitionDefinition>,
    pub on_entry: Vec<ActionElement>,
    pub on_exit: Vec<ActionElement>,
    pub invoke: Vec<InvokeDefinition>,
    pub data: Vec<DataElement>,
}

/// `<final>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalDefinition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub on_entry: Vec<ActionElement>,
    pub on_exit: Vec<ActionElement>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub done_data: Option<DoneDataDefinition>,

    /// Must stay empty; kept so invalid documents can be reported.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub states: Vec<StateElement>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<TransitionDefinition>,
}

/// History pseudostate kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryType {
    #[default]
    Shallow,
    Deep,
}

/// `<history>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryDefinition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub history_type: HistoryType,
    /// Default transition taken when no history was recorded yet.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transition: Option<TransitionDefinition>,
}

/// Transition kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionType {
    #[default]
    External,
    Internal,
}

/// `<transition>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransitionDefinition {
    /// Whitespace separated event descriptors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cond: Option<String>,

    #[serde(deserialize_with = "deserialize_id_list", skip_serializing_if = "Vec::is_empty")]
    pub target: Vec<String>,

    #[serde(rename = "type")]
    pub transition_type: TransitionType,

    pub actions: Vec<ActionElement>,
}

/// `<data>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataElement {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expr: Option<String>,
    /// Inline literal content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
}

/// `<script>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptElement {
    pub source: String,
}

/// `<content>`: either an expression or a literal body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentElement {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// `<param>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParamElement {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// `<donedata>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DoneDataDefinition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<ContentElement>,
    pub params: Vec<ParamElement>,
}

/// `<invoke>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvokeDefinition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idlocation: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub invoke_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub typeexpr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub srcexpr: Option<String>,
    pub autoforward: bool,
    pub namelist: Vec<String>,
    pub params: Vec<ParamElement>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<ContentElement>,
    pub finalize: Vec<ActionElement>,
}

/// `<send>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendElement {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eventexpr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub targetexpr: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub send_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub typeexpr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idlocation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delayexpr: Option<String>,
    pub namelist: Vec<String>,
    pub params: Vec<ParamElement>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<ContentElement>,
}

/// `<elseif>` branch of an `<if>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElseIfElement {
    pub cond: String,
    pub actions: Vec<ActionElement>,
}

/// Executable content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ActionElement {
    Raise {
        event: String,
    },
    Send(SendElement),
    Cancel {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sendid: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sendidexpr: Option<String>,
    },
    Assign {
        location: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expr: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<Value>,
    },
    Log {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expr: Option<String>,
    },
    If {
        cond: String,
        #[serde(default)]
        then: Vec<ActionElement>,
        #[serde(default, rename = "elseif", skip_serializing_if = "Vec::is_empty")]
        else_if: Vec<ElseIfElement>,
        #[serde(default, rename = "else", skip_serializing_if = "Vec::is_empty")]
        otherwise: Vec<ActionElement>,
    },
    Foreach {
        array: String,
        item: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<String>,
        #[serde(default)]
        actions: Vec<ActionElement>,
    },
    Script {
        source: String,
    },
}

/// Accepts either a whitespace separated string or an array of ids.
fn deserialize_id_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{self, Visitor};
    use std::fmt;

    struct IdListVisitor;

    impl<'de> Visitor<'de> for IdListVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or array of strings")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(v.split_whitespace().map(str::to_string).collect())
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut ids = Vec::new();
            while let Some(s) = seq.next_element::<String>()? {
                ids.push(s);
            }
            Ok(ids)
        }
    }

    deserializer.deserialize_any(IdListVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_document() {
        let doc = Document::from_json(&json!({
            "name": "door",
            "initial": "closed",
            "states": [
                {"kind": "state", "id": "closed", "transitions": [
                    {"event": "open", "target": "open"}
                ]},
                {"kind": "state", "id": "open", "transitions": [
                    {"event": "close", "target": ["closed"]}
                ]}
            ]
        }))
        .unwrap();

        assert_eq!(doc.name.as_deref(), Some("door"));
        assert_eq!(doc.initial, vec!["closed".to_string()]);
        assert_eq!(doc.states.len(), 2);
        assert_eq!(doc.states[0].id(), Some("closed"));
        assert_eq!(doc.binding, Binding::Early);
    }

    #[test]
    fn test_space_separated_targets() {
        let t: TransitionDefinition =
            serde_json::from_value(json!({"event": "go", "target": "a  b"})).unwrap();
        assert_eq!(t.target, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(t.transition_type, TransitionType::External);
    }

    #[test]
    fn test_parse_actions() {
        let actions: Vec<ActionElement> = serde_json::from_value(json!([
            {"action": "raise", "event": "next"},
            {"action": "send", "event": "tick", "delay": "1s", "id": "timer"},
            {"action": "if", "cond": "x > 1", "then": [{"action": "log", "expr": "x"}],
             "elseif": [{"cond": "x == 1", "actions": []}],
             "else": [{"action": "cancel", "sendid": "timer"}]}
        ]))
        .unwrap();

        assert_eq!(actions.len(), 3);
        match &actions[1] {
            ActionElement::Send(send) => {
                assert_eq!(send.delay.as_deref(), Some("1s"));
                assert_eq!(send.id.as_deref(), Some("timer"));
            }
            other => panic!("expected send, got {:?}", other),
        }
        match &actions[2] {
            ActionElement::If {
                else_if, otherwise, ..
            } => {
                assert_eq!(else_if.len(), 1);
                assert_eq!(otherwise.len(), 1);
            }
            other => panic!("expected if, got {:?}", other),
        }
    }

    #[test]
    fn test_checksum_is_stable() {
        let doc = Document::from_json(&json!({
            "states": [{"kind": "final", "id": "done"}]
        }))
        .unwrap();
        assert_eq!(doc.checksum().unwrap(), doc.clone().checksum().unwrap());

        let other = Document::from_json(&json!({
            "states": [{"kind": "final", "id": "end"}]
        }))
        .unwrap();
        assert_ne!(doc.checksum().unwrap(), other.checksum().unwrap());
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let result = Document::from_json(&json!({
            "states": [{"kind": "bogus", "id": "x"}]
        }));
        assert!(result.is_err());
    }
}
