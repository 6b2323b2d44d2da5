//! Resource schemas and extension declarations loaded from schema files.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::{MigrateError, Result};

fn default_code_type() -> String {
    "javascript".to_string()
}

/// A resource type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub id: String,
    #[serde(default)]
    pub plural: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub parent: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Schema {
    /// URL of the resource collection, e.g. `/v2.0/networks`.
    pub fn plural_url(&self) -> String {
        let prefix = self.prefix.trim_matches('/');
        if prefix.is_empty() {
            format!("/{}", self.plural)
        } else {
            format!("/{}/{}", prefix, self.plural)
        }
    }

    fn flag(&self, key: &str) -> bool {
        self.metadata.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Resources of this schema are never replicated to the sync backend.
    pub fn nosync(&self) -> bool {
        self.flag("nosync")
    }

    /// Publish the raw body instead of the `{"body", "version"}` envelope.
    pub fn sync_plain(&self) -> bool {
        self.flag("sync_plain")
    }

    /// Publish at the resource path as is, without the `/config` prefix.
    pub fn skip_config_prefix(&self) -> bool {
        self.flag("sync_skip_config_prefix")
    }

    /// Publish only this property of the body.
    pub fn sync_property(&self) -> Option<&str> {
        self.metadata.get("sync_property").and_then(Value::as_str)
    }

    pub fn sync_key_template(&self) -> Option<&str> {
        self.metadata.get("sync_key_template").and_then(Value::as_str)
    }

    /// Render `sync_key_template` with the properties of `data`, e.g. `/ports/{{id}}`.
    pub fn generate_custom_path(&self, data: &Map<String, Value>) -> Result<String> {
        let template = self.sync_key_template().ok_or_else(|| {
            MigrateError::Schema(format!("schema {} has no sync_key_template", self.id))
        })?;

        let mut missing = None;
        let path = template_pattern().replace_all(template, |captures: &regex::Captures<'_>| {
            match data.get(&captures[1]) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => {
                    missing.get_or_insert_with(|| captures[1].to_string());
                    String::new()
                }
            }
        });

        match missing {
            Some(name) => Err(MigrateError::Schema(format!(
                "sync_key_template of {} refers to missing property '{}'",
                self.id, name
            ))),
            None => Ok(path.into_owned()),
        }
    }
}

fn template_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}")
            .unwrap_or_else(|e| unreachable!("invalid template pattern: {}", e))
    })
}

#[derive(Debug, Clone, Deserialize)]
struct ExtensionDocument {
    id: String,
    #[serde(default = "default_code_type")]
    code_type: String,
    #[serde(default)]
    path: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    code: String,
}

/// Extension declared in a schema file, bound to every schema whose plural URL matches `path`.
#[derive(Debug, Clone)]
pub struct Extension {
    pub id: String,
    pub code_type: String,
    pub path: Regex,
    pub url: String,
    pub code: String,
}

impl Extension {
    pub fn matches(&self, plural_url: &str) -> bool {
        self.path.is_match(plural_url)
    }
}

impl TryFrom<ExtensionDocument> for Extension {
    type Error = MigrateError;

    fn try_from(doc: ExtensionDocument) -> Result<Self> {
        let path = Regex::new(&doc.path).map_err(|e| {
            MigrateError::Schema(format!("extension {} has an invalid path: {}", doc.id, e))
        })?;
        Ok(Self {
            id: doc.id,
            code_type: doc.code_type,
            path,
            url: doc.url,
            code: doc.code,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct SchemaDocument {
    #[serde(default)]
    schemas: Vec<Schema>,
    #[serde(default)]
    extensions: Vec<ExtensionDocument>,
}

/// Schemas and extensions of one configuration, in file order.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: Vec<Arc<Schema>>,
    extensions: Vec<Arc<Extension>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load schema files (YAML or JSON) in order.
    pub async fn load_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut registry = Self::new();
        for path in paths {
            let path = path.as_ref();
            let content = tokio::fs::read_to_string(path).await.map_err(|e| {
                MigrateError::Schema(format!("failed to read schema file {}: {}", path.display(), e))
            })?;
            registry.add_document(&content).map_err(|e| match e {
                MigrateError::Schema(message) => {
                    MigrateError::Schema(format!("{}: {}", path.display(), message))
                }
                other => other,
            })?;
            debug!("loaded schema file {}", path.display());
        }
        info!(
            "Loaded {} schema(s) and {} extension(s)",
            registry.schemas.len(),
            registry.extensions.len()
        );
        Ok(registry)
    }

    /// Add the schemas and extensions of one schema file.
    pub fn add_document(&mut self, content: &str) -> Result<()> {
        let doc: SchemaDocument = serde_yaml::from_str(content)
            .map_err(|e| MigrateError::Schema(format!("invalid schema file: {}", e)))?;

        let mut ids: HashSet<String> = self.schemas.iter().map(|s| s.id.clone()).collect();
        for schema in &doc.schemas {
            if schema.id.is_empty() {
                return Err(MigrateError::Schema("schema without id".to_string()));
            }
            if !ids.insert(schema.id.clone()) {
                return Err(MigrateError::Schema(format!("duplicate schema id: {}", schema.id)));
            }
        }

        let extensions = doc
            .extensions
            .into_iter()
            .map(|doc| Extension::try_from(doc).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        self.schemas.extend(doc.schemas.into_iter().map(Arc::new));
        self.extensions.extend(extensions);
        Ok(())
    }

    pub fn schemas(&self) -> &[Arc<Schema>] {
        &self.schemas
    }

    pub fn schema(&self, id: &str) -> Option<&Arc<Schema>> {
        self.schemas.iter().find(|s| s.id == id)
    }

    /// Schema owning the resource URL `path`; the longest matching collection URL wins.
    pub fn schema_by_url_path(&self, path: &str) -> Option<&Arc<Schema>> {
        let path = format!("{}/", path);
        self.schemas
            .iter()
            .filter(|schema| !schema.plural.is_empty())
            .filter(|schema| path.starts_with(&format!("{}/", schema.plural_url())))
            .max_by_key(|schema| schema.plural_url().len())
    }

    pub fn extensions(&self) -> &[Arc<Extension>] {
        &self.extensions
    }

    /// Extensions whose path matches `plural_url`, in declaration order.
    pub fn extensions_for_path(&self, plural_url: &str) -> Vec<Arc<Extension>> {
        self.extensions
            .iter()
            .filter(|extension| extension.matches(plural_url))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const SCHEMAS: &str = r#"
schemas:
  - id: network
    plural: networks
    prefix: /v2.0
  - id: port
    plural: ports
    prefix: /v2.0/
    metadata:
      sync_key_template: "/ports/{{ network_id }}/{{id}}"
      sync_plain: true
  - id: audit
    plural: audits
    metadata:
      nosync: true
extensions:
  - id: network_hooks
    code_type: native
    path: /v2.0/networks.*
  - id: everything
"#;

    #[test]
    fn test_plural_url() {
        let mut schema = Schema {
            id: "network".to_string(),
            plural: "networks".to_string(),
            ..Default::default()
        };
        assert_eq!(schema.plural_url(), "/networks");
        schema.prefix = "/v2.0/".to_string();
        assert_eq!(schema.plural_url(), "/v2.0/networks");
    }

    #[test]
    fn test_load_document() {
        let mut registry = SchemaRegistry::new();
        registry.add_document(SCHEMAS).unwrap();

        let ids: Vec<&str> = registry.schemas().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["network", "port", "audit"]);
        assert!(registry.schema("audit").unwrap().nosync());
        assert!(registry.schema("port").unwrap().sync_plain());
        assert!(!registry.schema("network").unwrap().sync_plain());

        let extensions = registry.extensions();
        assert_eq!(extensions[0].code_type, "native");
        assert_eq!(extensions[1].code_type, "javascript");
        let ids: Vec<String> = registry
            .extensions_for_path("/v2.0/networks")
            .iter()
            .map(|e| e.id.clone())
            .collect();
        assert_eq!(ids, vec!["network_hooks", "everything"]);
        assert_eq!(registry.extensions_for_path("/v2.0/ports").len(), 1);
    }

    #[test]
    fn test_duplicate_schema_rejected() {
        let mut registry = SchemaRegistry::new();
        registry.add_document(SCHEMAS).unwrap();
        assert!(matches!(
            registry.add_document("schemas:\n  - id: network\n    plural: nets\n"),
            Err(MigrateError::Schema(_))
        ));
        assert!(matches!(
            registry.add_document("extensions:\n  - id: broken\n    path: '('\n"),
            Err(MigrateError::Schema(_))
        ));
    }

    #[test]
    fn test_custom_path() {
        let mut registry = SchemaRegistry::new();
        registry.add_document(SCHEMAS).unwrap();
        let port = registry.schema("port").unwrap();

        let data = json!({"id": "p1", "network_id": 7});
        assert_eq!(port.generate_custom_path(data.as_object().unwrap()).unwrap(), "/ports/7/p1");

        let data = json!({"id": "p1"});
        assert!(port.generate_custom_path(data.as_object().unwrap()).is_err());

        let network = registry.schema("network").unwrap();
        assert!(network.generate_custom_path(&Map::new()).is_err());
    }

    #[test]
    fn test_schema_by_url_path() {
        let mut registry = SchemaRegistry::new();
        registry.add_document(SCHEMAS).unwrap();
        registry
            .add_document("schemas:\n  - id: network_tag\n    plural: networks/tags\n    prefix: /v2.0\n")
            .unwrap();

        assert_eq!(registry.schema_by_url_path("/v2.0/networks/n1").unwrap().id, "network");
        assert_eq!(registry.schema_by_url_path("/v2.0/networks/tags/t1").unwrap().id, "network_tag");
        assert_eq!(registry.schema_by_url_path("/audits/a1").unwrap().id, "audit");
        assert!(registry.schema_by_url_path("/v2.0/networksx/n1").is_none());
    }

    #[tokio::test]
    async fn test_load_files() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = dir.path().join("schema.yaml");
        let json = dir.path().join("extra.json");
        std::fs::write(&yaml, SCHEMAS).unwrap();
        std::fs::write(&json, r#"{"schemas": [{"id": "subnet", "plural": "subnets"}]}"#).unwrap();

        let registry = SchemaRegistry::load_files(&[&yaml, &json]).await.unwrap();
        assert_eq!(registry.schemas().len(), 4);
        assert_eq!(registry.schemas()[3].id, "subnet");

        let missing = dir.path().join("missing.yaml");
        assert!(matches!(
            SchemaRegistry::load_files(&[missing]).await,
            Err(MigrateError::Schema(_))
        ));
    }
}
