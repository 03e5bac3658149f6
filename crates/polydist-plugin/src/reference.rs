use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Per-instance plugin options as written in the distribution config.
pub type PluginOptions = Map<String, Value>;

/// Reference id standing in for the distribution's own custom scripts.
pub const THIS_PLUGIN_ID: &str = "@this";

/// A plugin reference: either a bare id or an id with inline options.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PluginReference {
    Id(String),
    WithOptions {
        id: String,
        #[serde(default)]
        options: PluginOptions,
    },
}

impl PluginReference {
    pub fn with_options(id: impl Into<String>, options: PluginOptions) -> Self {
        Self::WithOptions {
            id: id.into(),
            options,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Id(id) | Self::WithOptions { id, .. } => id,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.id() == THIS_PLUGIN_ID
    }

    pub fn normalize(&self) -> (String, PluginOptions) {
        match self {
            Self::Id(id) => (id.clone(), PluginOptions::new()),
            Self::WithOptions { id, options } => (id.clone(), options.clone()),
        }
    }
}

impl From<&str> for PluginReference {
    fn from(id: &str) -> Self {
        Self::Id(id.to_string())
    }
}

impl From<String> for PluginReference {
    fn from(id: String) -> Self {
        Self::Id(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserialize_mixed_reference_list_expected_normalized_pairs() {
        let references: Vec<PluginReference> =
            serde_json::from_value(json!(["pluginA", { "id": "pluginB", "options": { "x": 1 } }]))
                .expect("references should deserialize");

        let normalized: Vec<(String, PluginOptions)> =
            references.iter().map(PluginReference::normalize).collect();
        assert_eq!(normalized[0], ("pluginA".to_string(), PluginOptions::new()));
        assert_eq!(normalized[1].0, "pluginB");
        assert_eq!(normalized[1].1.get("x"), Some(&json!(1)));
    }

    #[test]
    fn reference_without_options_field_expected_empty_options() {
        let reference: PluginReference =
            serde_json::from_value(json!({ "id": "pluginC" })).expect("deserialize");
        assert_eq!(reference.normalize(), ("pluginC".to_string(), PluginOptions::new()));
        assert!(!reference.is_placeholder());
        assert!(PluginReference::from("@this").is_placeholder());
    }
}
