use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Parameters of an `elicitation/create` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElicitParams {
    /// The message shown to the user.
    pub message: String,
    /// A restricted JSON schema: a flat object of primitive properties.
    #[serde(rename = "requestedSchema", default)]
    pub requested_schema: ElicitSchema,
    /// `form` (the default) or `url`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// The page the user is asked to visit in `url` mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(rename = "elicitationId", skip_serializing_if = "Option::is_none")]
    pub elicitation_id: Option<String>,
    #[serde(rename = "_meta", skip_serializing_if = "Option::is_none")]
    pub meta: Option<Map<String, Value>>,
}

impl ElicitParams {
    pub fn new(message: impl Into<String>, schema: ElicitSchema) -> Self {
        Self {
            message: message.into(),
            requested_schema: schema,
            mode: None,
            url: None,
            elicitation_id: None,
            meta: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.mode = Some("url".to_string());
        self.url = Some(url.into());
        self
    }

    pub fn with_elicitation_id(mut self, id: impl Into<String>) -> Self {
        self.elicitation_id = Some(id.into());
        self
    }

    pub fn is_url_mode(&self) -> bool {
        self.mode.as_deref() == Some("url")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ElicitSchema {
    #[serde(rename = "type")]
    pub schema_type: String,
    #[serde(default)]
    pub properties: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
}

impl Default for ElicitSchema {
    fn default() -> Self {
        Self {
            schema_type: "object".to_string(),
            properties: HashMap::new(),
            required: Vec::new(),
        }
    }
}

impl ElicitSchema {
    pub fn with_property(mut self, name: impl Into<String>, schema: Value) -> Self {
        self.properties.insert(name.into(), schema);
        self
    }

    pub fn with_required(mut self, name: impl Into<String>) -> Self {
        self.required.push(name.into());
        self
    }

    /// The declared `type` of a property, if any.
    pub fn property_type(&self, name: &str) -> Option<&str> {
        self.properties
            .get(name)
            .and_then(|p| p.get("type"))
            .and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ElicitAction {
    Accept,
    Decline,
    Cancel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ElicitResult {
    pub action: ElicitAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<HashMap<String, Value>>,
}

impl ElicitResult {
    pub fn accept(content: HashMap<String, Value>) -> Self {
        Self {
            action: ElicitAction::Accept,
            content: Some(content),
        }
    }

    pub fn decline() -> Self {
        Self {
            action: ElicitAction::Decline,
            content: None,
        }
    }

    pub fn cancel() -> Self {
        Self {
            action: ElicitAction::Cancel,
            content: None,
        }
    }
}

/// Parameters of an `interaction/create` request. The payload is opaque to
/// the runtime and passed through untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractResult {
    pub action: ElicitAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
}
