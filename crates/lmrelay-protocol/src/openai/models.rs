use serde::{Deserialize, Serialize};

/// `GET /v1/models` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelEntry>,
}

impl ModelList {
    pub fn new(data: Vec<ModelEntry>) -> Self {
        Self {
            object: "list".to_string(),
            data,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    #[serde(default = "model_object")]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub owned_by: String,
    #[serde(default)]
    pub permission: Vec<ModelPermission>,
    #[serde(default)]
    pub root: String,
    #[serde(default)]
    pub parent: Option<String>,
}

impl ModelEntry {
    pub fn new(id: impl Into<String>, owned_by: impl Into<String>, created: i64) -> Self {
        let id = id.into();
        Self {
            permission: vec![ModelPermission {
                id: format!("modelperm-{id}"),
                object: "model_permission".to_string(),
                created,
                organization: "*".to_string(),
                group: None,
                is_blocking: false,
            }],
            root: id.clone(),
            id,
            object: model_object(),
            created,
            owned_by: owned_by.into(),
            parent: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPermission {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub organization: String,
    pub group: Option<String>,
    pub is_blocking: bool,
}

fn model_object() -> String {
    "model".to_string()
}
