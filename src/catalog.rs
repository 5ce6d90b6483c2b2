//! Dialogue node catalog
//!
//! The catalog is a static configuration document loaded once at startup:
//! one prompt template, variable specs, and optional API actions per node,
//! plus the top-level system prompt. Read-only at runtime.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Identifier of a dialogue node.
///
/// The reserved id `END` is a pseudo-node: transitioning into it means the
/// call is over and no further turn processing happens.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The terminal pseudo-node.
    pub fn end() -> Self {
        Self("END".to_string())
    }

    pub fn is_end(&self) -> bool {
        self.0 == "END"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Declared type of an extractable variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableKind {
    #[default]
    String,
    Boolean,
    Number,
    Date,
}

/// One variable a node asks the extraction collaborator to fill in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableSpec {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: VariableKind,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiMethod {
    Get,
    Post,
}

/// One field of an API request body. `value` is a template string and gets
/// variable substitution against the call context before the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BodyField {
    pub key: String,
    pub value: String,
}

/// Maps a path in the API response body to a context key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseField {
    pub key: String,
    /// Dot-separated path into the response JSON. Defaults to `key`.
    #[serde(default)]
    pub path: Option<String>,
}

impl ResponseField {
    pub fn path(&self) -> &str {
        self.path.as_deref().unwrap_or(&self.key)
    }
}

/// An external API action a node executes on entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiAction {
    pub method: ApiMethod,
    /// URL template; gets variable substitution before the request.
    pub url: String,
    #[serde(default)]
    pub body: Vec<BodyField>,
    #[serde(default)]
    pub response_map: Vec<ResponseField>,
}

/// A single dialogue node as declared in the catalog document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub prompt: String,
    #[serde(default)]
    pub variables: Vec<VariableSpec>,
    #[serde(default)]
    pub apis: Vec<ApiAction>,
}

/// On-disk shape of the catalog document.
#[derive(Debug, Deserialize)]
struct CatalogDocument {
    system_prompt: String,
    greeting_node: NodeId,
    nodes: HashMap<NodeId, NodeDefinition>,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog at {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse catalog: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("greeting node {0} is not declared in the catalog")]
    MissingGreetingNode(NodeId),
}

/// The loaded, validated catalog.
pub struct NodeCatalog {
    system_prompt: String,
    greeting_node: NodeId,
    nodes: HashMap<NodeId, NodeDefinition>,
}

impl NodeCatalog {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, CatalogError> {
        let doc: CatalogDocument = serde_json::from_str(raw)?;
        if !doc.nodes.contains_key(&doc.greeting_node) {
            return Err(CatalogError::MissingGreetingNode(doc.greeting_node));
        }
        tracing::info!(
            nodes = doc.nodes.len(),
            greeting = %doc.greeting_node,
            "node catalog loaded"
        );
        Ok(Self {
            system_prompt: doc.system_prompt,
            greeting_node: doc.greeting_node,
            nodes: doc.nodes,
        })
    }

    /// Raw system prompt template (render before use).
    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// The node every new call starts in.
    pub fn greeting_node(&self) -> &NodeId {
        &self.greeting_node
    }

    pub fn node(&self, id: &NodeId) -> Option<&NodeDefinition> {
        self.nodes.get(id)
    }

    /// Variable specs for a node; empty for unknown ids.
    pub fn variable_specs(&self, id: &NodeId) -> &[VariableSpec] {
        self.nodes.get(id).map_or(&[], |n| n.variables.as_slice())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
