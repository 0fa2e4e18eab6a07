//! YAML registration loader.
//!
//! Lets deployments declare their hook catalog in a file instead of
//! code:
//!
//! ```yaml
//! definitions:
//!   - id: on_created
//!     name: on entity created
//!     description: triggered when an entity is created
//!     payload_scheme: '{"type": "object"}'
//!     http_request_method: POST
//!     total_attempts: 10
//!     configurations:
//!       - id: default
//!         tag: global
//!         url: https://example.com/webhook
//! ```

use serde::Deserialize;

use crate::engine::Engine;
use crate::error::{HookError, Result};
use crate::types::{HookConfiguration, HookDefinition, HttpMethod};

#[derive(Debug, Deserialize)]
struct YamlCatalog {
    #[serde(default)]
    definitions: Vec<YamlDefinition>,
}

#[derive(Debug, Deserialize)]
struct YamlDefinition {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    /// JSON Schema document as a string; empty means no validation.
    #[serde(default)]
    payload_scheme: String,
    http_request_method: HttpMethod,
    total_attempts: u32,
    #[serde(default)]
    hide_execution_metadata: bool,
    #[serde(default)]
    configurations: Vec<YamlConfiguration>,
}

#[derive(Debug, Deserialize)]
struct YamlConfiguration {
    id: String,
    tag: String,
    url: String,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default)]
    client_rsa_private_key: Option<String>,
}

impl Engine {
    /// Register every definition and configuration declared in a YAML
    /// document.
    pub async fn load_from_yaml_str(&self, yaml: &str) -> Result<()> {
        let catalog: YamlCatalog = serde_yaml::from_str(yaml)
            .map_err(|e| HookError::validation(format!("invalid yaml catalog: {e}")))?;

        let mut definitions = Vec::new();
        let mut configurations = Vec::new();

        for def in catalog.definitions {
            let payload_scheme = if def.payload_scheme.is_empty() {
                None
            } else {
                Some(serde_json::from_str(&def.payload_scheme).map_err(|e| {
                    HookError::validation(format!(
                        "payload_scheme of {} is not valid JSON: {e}",
                        def.id
                    ))
                })?)
            };

            for cfg in def.configurations {
                configurations.push(HookConfiguration {
                    id: cfg.id,
                    hook_definition_id: def.id.clone(),
                    tag: cfg.tag,
                    url: cfg.url,
                    client_secret: cfg.client_secret,
                    client_rsa_private_key: cfg.client_rsa_private_key,
                    created_at: chrono::Utc::now(),
                    hook_definition: None,
                });
            }

            definitions.push(HookDefinition {
                id: def.id,
                name: def.name,
                description: def.description,
                payload_scheme,
                http_request_method: def.http_request_method,
                total_attempts: def.total_attempts,
                hide_execution_metadata: def.hide_execution_metadata,
            });
        }

        self.register_definitions(&definitions).await?;
        self.register_configurations(configurations).await
    }

    /// [`load_from_yaml_str`](Self::load_from_yaml_str) from a file path.
    pub async fn load_from_yaml_file(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| HookError::validation(format!("cannot read yaml catalog: {e}")))?;
        self.load_from_yaml_str(&yaml).await
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::Engine;

    const CATALOG: &str = r#"
definitions:
  - id: on_created
    name: on entity created
    description: triggered when an entity is created
    payload_scheme: '{"type": "object", "properties": {"entity_id": {"type": "string"}}}'
    http_request_method: POST
    total_attempts: 10
    configurations:
      - id: default
        tag: global
        url: http://example.com/webhook
        client_secret: super-secret
  - id: on_deleted
    name: on entity deleted
    http_request_method: DELETE
    total_attempts: 3
"#;

    #[tokio::test]
    async fn catalog_registers_definitions_and_configurations() {
        let engine = Engine::builder().build();
        engine.load_from_yaml_str(CATALOG).await.expect("catalog loads");

        let definitions = engine.list_definitions().await.unwrap();
        assert_eq!(definitions.len(), 2);

        let configurations = engine.list_configurations_by_tag("global").await.unwrap();
        assert_eq!(configurations.len(), 1);
        assert_eq!(configurations[0].hook_definition_id, "on_created");
        assert_eq!(configurations[0].client_secret.as_deref(), Some("super-secret"));

        let on_created = definitions.iter().find(|d| d.id == "on_created").unwrap();
        assert!(on_created.payload_scheme.is_some());
    }

    #[tokio::test]
    async fn invalid_catalog_entries_are_rejected() {
        let engine = Engine::builder().build();

        let zero_attempts = r#"
definitions:
  - id: bad
    http_request_method: POST
    total_attempts: 0
"#;
        assert!(engine.load_from_yaml_str(zero_attempts).await.is_err());

        let bad_scheme = r#"
definitions:
  - id: bad
    http_request_method: POST
    total_attempts: 1
    payload_scheme: 'not json'
"#;
        assert!(engine.load_from_yaml_str(bad_scheme).await.is_err());
    }
}
