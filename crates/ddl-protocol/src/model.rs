//! Federation records carried inside messages: nodes, networks, users.
//!
//! These are plain serde types. Field names on the wire are camelCase.
//! Identity fields (`nodeId`, `networkId`, `userId`) have no serde default,
//! so a record missing one fails to decode.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::ops::{Add, AddAssign};

// ============================================================================
// Data index
// ============================================================================

/// Summary of the data a node holds. Only `recordCount` is interpreted
/// (by the scorer); every other key is carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataIndex {
    #[serde(default)]
    pub record_count: u64,
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

impl DataIndex {
    pub fn with_records(record_count: u64) -> Self {
        Self {
            record_count,
            extensions: Map::new(),
        }
    }
}

impl Add for DataIndex {
    type Output = DataIndex;

    fn add(mut self, rhs: DataIndex) -> DataIndex {
        self += rhs;
        self
    }
}

impl AddAssign for DataIndex {
    /// Counts are summed. Extension keys already present on the left win.
    fn add_assign(&mut self, rhs: DataIndex) {
        self.record_count = self.record_count.saturating_add(rhs.record_count);
        for (key, value) in rhs.extensions {
            self.extensions.entry(key).or_insert(value);
        }
    }
}

impl std::iter::Sum for DataIndex {
    fn sum<I: Iterator<Item = DataIndex>>(iter: I) -> Self {
        iter.fold(DataIndex::default(), |acc, idx| acc + idx)
    }
}

// ============================================================================
// User mapping
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MappingError {
    #[error("no subject to map")]
    MissingSubject,
    #[error("subject {0} has no local user")]
    UnknownSubject(String),
}

/// How a remote node's callers are turned into local user IDs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mappingType", rename_all = "camelCase")]
pub enum UserMapping {
    /// The external subject is used as the local user ID.
    #[default]
    NoMapping,
    /// Every caller from the node acts as one local user.
    Static {
        #[serde(rename = "userId")]
        user_id: String,
    },
    /// Per-subject lookup table.
    Dynamic {
        #[serde(default)]
        mapping: BTreeMap<String, String>,
    },
}

impl UserMapping {
    pub fn remap(&self, subject: Option<&str>) -> Result<String, MappingError> {
        match self {
            UserMapping::Static { user_id } => Ok(user_id.clone()),
            UserMapping::NoMapping => subject
                .map(str::to_string)
                .ok_or(MappingError::MissingSubject),
            UserMapping::Dynamic { mapping } => {
                let subject = subject.ok_or(MappingError::MissingSubject)?;
                mapping
                    .get(subject)
                    .cloned()
                    .ok_or_else(|| MappingError::UnknownSubject(subject.to_string()))
            }
        }
    }
}

// ============================================================================
// Node
// ============================================================================

/// A protocol participant.
///
/// `score` is owned by the scorer: protocol code copies it around but only
/// the score update path writes a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub node_id: String,
    pub node_name: String,
    pub url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default)]
    pub authentication_enabled: bool,
    #[serde(default)]
    pub user_mapping: UserMapping,
    #[serde(default)]
    pub data_index: DataIndex,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub approved: bool,
}

impl Node {
    pub fn new(node_id: impl Into<String>, node_name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            node_name: node_name.into(),
            url: url.into(),
            description: String::new(),
            client_id: String::new(),
            public_key: None,
            authentication_enabled: false,
            user_mapping: UserMapping::default(),
            data_index: DataIndex::default(),
            score: 0.0,
            approved: false,
        }
    }

    /// Copy of this node with the public key removed, for callers not
    /// entitled to see it.
    pub fn without_key(&self) -> Self {
        Self {
            public_key: None,
            ..self.clone()
        }
    }
}

// ============================================================================
// Network
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    pub network_id: String,
    pub network_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub node_ids: Vec<String>,
    #[serde(default)]
    pub visible: bool,
    #[serde(default)]
    pub registered: bool,
    /// This instance's own node ID inside the network.
    #[serde(default)]
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub central_node: Option<String>,
}

impl Network {
    pub fn new(
        network_id: impl Into<String>,
        network_name: impl Into<String>,
        instance_id: impl Into<String>,
    ) -> Self {
        let instance_id = instance_id.into();
        Self {
            network_id: network_id.into(),
            network_name: network_name.into(),
            description: String::new(),
            node_ids: vec![instance_id.clone()],
            visible: false,
            registered: false,
            instance_id,
            central_node: None,
        }
    }

    /// The view of this network that may leave the instance: membership and
    /// instance identity cleared.
    pub fn public_view(&self) -> Self {
        Self {
            node_ids: Vec::new(),
            instance_id: String::new(),
            ..self.clone()
        }
    }

    /// Wire form of [`Network::public_view`]: the stripped keys are absent,
    /// not empty.
    pub fn to_public_value(&self) -> Value {
        let mut value = serde_json::to_value(self.public_view()).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut value {
            map.remove("nodeIds");
            map.remove("instanceId");
        }
        value
    }
}

/// Sum of the instance's own index and every approved member's index.
pub fn network_data_index<'a>(
    own: &DataIndex,
    nodes: impl IntoIterator<Item = &'a Node>,
) -> DataIndex {
    nodes
        .into_iter()
        .filter(|n| n.approved)
        .fold(own.clone(), |acc, n| acc + n.data_index.clone())
}

// ============================================================================
// User
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

impl User {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            public_key: None,
        }
    }
}
