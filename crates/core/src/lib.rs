use serde_json::{Map as JsonMap, Value as Json};
use std::path::PathBuf;
use thiserror::Error;

/// Resolved end-state of a resource change: attribute name to value.
pub type AfterState = JsonMap<String, Json>;

/// Errors that mean the input pipeline is broken. These never describe a
/// policy outcome; a run that hits one has nothing meaningful to evaluate.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("provisioning tool not found: {0}")]
    ToolNotFound(String),
    #[error("spawn {stage}: {source}")]
    Spawn {
        stage: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{stage} failed ({}): {stderr}", exit_label(*code))]
    Tool {
        stage: &'static str,
        code: Option<i32>,
        stderr: String,
    },
    #[error("read plan {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("plan is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("plan has no resource_changes field")]
    MissingResourceChanges,
    #[error("resource_changes is {0}, expected an array")]
    ResourceChangesNotSequence(&'static str),
    #[error("resource_changes[{index}]: {reason}")]
    MalformedRecord { index: usize, reason: &'static str },
}

fn exit_label(code: Option<i32>) -> String {
    match code {
        Some(c) => format!("exit status {c}"),
        None => "terminated by signal".to_string(),
    }
}

/// Short name of a JSON value's shape, for diagnostics.
pub fn kind_name(v: &Json) -> &'static str {
    match v {
        Json::Null => "null",
        Json::Bool(_) => "boolean",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

/// One entry of `resource_changes`.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceChange {
    pub type_name: String,
    pub address: Option<String>,
    /// Raw `change` value; `Null` when the record has none.
    pub change: Json,
}

impl ResourceChange {
    /// Address when the plan carries one, otherwise the bare type.
    pub fn label(&self) -> &str {
        self.address.as_deref().unwrap_or(&self.type_name)
    }

    pub fn after(&self) -> AfterState {
        resolve_after(self)
    }

    fn change_field(&self, field: &str) -> AfterState {
        match &self.change {
            Json::Object(change) => match change.get(field) {
                Some(Json::Object(m)) => m.clone(),
                _ => AfterState::new(),
            },
            _ => AfterState::new(),
        }
    }
}

/// `change.after`, or an empty mapping when either level is absent or not an
/// object. Resources being destroyed have a null `after`.
pub fn resolve_after(rc: &ResourceChange) -> AfterState {
    rc.change_field("after")
}

/// `change.after_unknown`: attributes whose values are only known after apply.
pub fn resolve_after_unknown(rc: &ResourceChange) -> AfterState {
    rc.change_field("after_unknown")
}

/// Nested blocks show up either as an object or as a one-element array of
/// objects depending on provider schema version. Returns the object in both
/// cases and `None` for anything else.
pub fn first_object(value: &Json) -> Option<&AfterState> {
    match value {
        Json::Object(m) => Some(m),
        Json::Array(items) => match items.first() {
            Some(Json::Object(m)) => Some(m),
            _ => None,
        },
        _ => None,
    }
}

/// A parsed change-plan (`terraform show -json` output).
#[derive(Debug, Clone, Default)]
pub struct ChangeDocument {
    pub format_version: Option<String>,
    pub terraform_version: Option<String>,
    resource_changes: Vec<ResourceChange>,
}

impl ChangeDocument {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, LoadError> {
        let value: Json = serde_json::from_slice(bytes)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Json) -> Result<Self, LoadError> {
        let mut root = match value {
            Json::Object(m) => m,
            _ => return Err(LoadError::MissingResourceChanges),
        };
        let records = match root.remove("resource_changes") {
            None | Some(Json::Null) => return Err(LoadError::MissingResourceChanges),
            Some(Json::Array(items)) => items,
            Some(other) => return Err(LoadError::ResourceChangesNotSequence(kind_name(&other))),
        };

        let mut resource_changes = Vec::with_capacity(records.len());
        for (index, record) in records.into_iter().enumerate() {
            let mut m = match record {
                Json::Object(m) => m,
                _ => return Err(LoadError::MalformedRecord { index, reason: "record is not an object" }),
            };
            let type_name = match m.remove("type") {
                Some(Json::String(s)) => s,
                _ => return Err(LoadError::MalformedRecord { index, reason: "missing string field 'type'" }),
            };
            let address = match m.remove("address") {
                Some(Json::String(s)) => Some(s),
                _ => None,
            };
            let change = m.remove("change").unwrap_or(Json::Null);
            resource_changes.push(ResourceChange { type_name, address, change });
        }

        let text = |v: Option<Json>| match v {
            Some(Json::String(s)) => Some(s),
            _ => None,
        };
        let doc = ChangeDocument {
            format_version: text(root.remove("format_version")),
            terraform_version: text(root.remove("terraform_version")),
            resource_changes,
        };
        tracing::debug!(records = doc.resource_changes.len(), format_version = ?doc.format_version, "plan loaded");
        Ok(doc)
    }

    pub fn resource_changes(&self) -> &[ResourceChange] {
        &self.resource_changes
    }

    /// Records whose type equals `type_name`, in plan order. Empty when none match.
    pub fn find_by_type(&self, type_name: &str) -> Vec<&ResourceChange> {
        self.resource_changes.iter().filter(|rc| rc.type_name == type_name).collect()
    }

    pub fn first_of_type(&self, type_name: &str) -> Option<&ResourceChange> {
        self.resource_changes.iter().find(|rc| rc.type_name == type_name)
    }
}
