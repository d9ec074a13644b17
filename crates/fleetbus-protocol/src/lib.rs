// fleetbus-protocol: Bus envelope types and serialization.
//
// Both channels carry UTF-8 JSON objects, one per line.  Requests flow
// master -> agents on the broadcast channel; replies flow agent -> master on
// the collector channel.  Fields that are unset are omitted from the wire.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Target selector
// ---------------------------------------------------------------------------

/// Agent selector carried in a request.
///
/// Either a single agent id or a set of ids.  An absent selector means
/// "all agents"; that case is modeled as `Option<Target>` on [`Request`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Target {
    One(String),
    Many(Vec<String>),
}

impl Target {
    /// True when this selector includes `agent_id`.
    pub fn selects(&self, agent_id: &str) -> bool {
        match self {
            Target::One(id) => id == agent_id,
            Target::Many(ids) => ids.iter().any(|id| id == agent_id),
        }
    }
}

// ---------------------------------------------------------------------------
// Request envelope
// ---------------------------------------------------------------------------

/// A broadcast request.
///
/// `req` is the correlation id minted by the master's engine immediately
/// before publishing; agents echo it verbatim.  Action-specific fields
/// (e.g. `path`, `thread`, `size`) ride in the flattened `fields` map so the
/// HTTP front can forward arbitrary operator input without the envelope
/// having to know every action's schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Request {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Target>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Request {
    /// Look up an action-specific field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Look up an action-specific field as a string.
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// True when the field is present and truthy (see [`truthy`]).
    pub fn field_truthy(&self, name: &str) -> bool {
        self.fields.get(name).is_some_and(truthy)
    }

    /// True when this request addresses `agent_id` (no selector = everyone).
    pub fn selects(&self, agent_id: &str) -> bool {
        self.target
            .as_ref()
            .is_none_or(|target| target.selects(agent_id))
    }
}

// ---------------------------------------------------------------------------
// Reply envelope
// ---------------------------------------------------------------------------

/// A single agent's reply to a broadcast request.
///
/// Always carries `req` and `agent`; every other field is action-specific
/// and omitted from the wire when unset.  `exit_code` is doubly optional:
/// `check` on a still-running child reports an explicit `null`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub req: String,
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<Option<i64>>,
    /// Spool file path backing the detached child's stdout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_fh: Option<String>,
    /// Spool file path backing the detached child's stderr.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_fh: Option<String>,
    /// Bytes the tail reader has not yet consumed from the stdout spool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_remain: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_remain: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Reply {
    /// The `{req, agent}` shell every handler starts from.
    pub fn skeleton(req: impl Into<String>, agent: impl Into<String>) -> Self {
        Reply {
            req: req.into(),
            agent: agent.into(),
            ..Reply::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Value coercions
// ---------------------------------------------------------------------------
//
// Operator input reaches the bus through an HTML-form front, so field values
// are usually strings ("true", "4200", "1000.") and list-valued fields may
// arrive as a bare string when the form carried the key once.  These helpers
// centralize the coercion rules the handlers share.

/// Truthiness of a JSON value, form-input flavored: `true`, any non-zero
/// number, and any non-empty string/array/object are truthy.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// A list-of-strings field: a bare string is a one-element list.
pub fn string_list(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::String(s) => Some(vec![s.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|item| item.as_str().map(str::to_owned))
            .collect(),
        _ => None,
    }
}

/// A numeric field: accepts a JSON number or a float spelling in a string
/// (`"1000."`, `"Inf"`).
pub fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn target_deserializes_from_string_and_array() {
        let one: Target = serde_json::from_value(json!("abc")).unwrap();
        assert_eq!(one, Target::One("abc".to_owned()));
        assert!(one.selects("abc"));
        assert!(!one.selects("def"));

        let many: Target = serde_json::from_value(json!(["abc", "def"])).unwrap();
        assert!(many.selects("def"));
        assert!(!many.selects("ghi"));
    }

    #[test]
    fn request_flattens_action_fields() {
        let request: Request = serde_json::from_value(json!({
            "req": "42",
            "action": "command",
            "path": ["bash", "--version"],
            "thread": "true",
        }))
        .unwrap();

        assert_eq!(request.req.as_deref(), Some("42"));
        assert_eq!(request.action.as_deref(), Some("command"));
        assert!(request.field_truthy("thread"));
        assert_eq!(
            string_list(request.field("path").unwrap()).unwrap(),
            vec!["bash".to_owned(), "--version".to_owned()]
        );
        // No selector addresses everyone.
        assert!(request.selects("anything"));
    }

    #[test]
    fn reply_omits_unset_fields() {
        let reply = Reply::skeleton("42", "agent-1");
        let wire = serde_json::to_value(&reply).unwrap();
        assert_eq!(wire, json!({"req": "42", "agent": "agent-1"}));
    }

    #[test]
    fn reply_exit_code_serializes_explicit_null_while_running() {
        let mut reply = Reply::skeleton("42", "agent-1");
        reply.exit_code = Some(None);
        let wire = serde_json::to_value(&reply).unwrap();
        assert_eq!(wire, json!({"req": "42", "agent": "agent-1", "exit_code": null}));

        reply.exit_code = Some(Some(0));
        let wire = serde_json::to_value(&reply).unwrap();
        assert_eq!(wire["exit_code"], json!(0));
    }

    #[test]
    fn truthiness_is_form_input_flavored() {
        assert!(truthy(&json!(true)));
        assert!(truthy(&json!("true")));
        assert!(truthy(&json!("0"))); // non-empty string
        assert!(truthy(&json!(1)));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!(null)));
    }

    #[test]
    fn number_accepts_float_spellings() {
        assert_eq!(number(&json!("1000.")), Some(1000.0));
        assert_eq!(number(&json!(16)), Some(16.0));
        assert_eq!(number(&json!("Inf")), Some(f64::INFINITY));
        assert_eq!(number(&json!("nope")), None);
    }
}
