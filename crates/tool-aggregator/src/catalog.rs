//! Qualified-name construction and OpenAI-format catalog assembly (spec §4.3
//! "Catalog construction", steps 4-6).

use std::collections::HashMap;

use serde_json::{json, Value};

use crate::config::ToolServerConfig;
use crate::protocol::RawToolSpec;

/// One tool after qualification, ready to be invoked or rendered into the
/// catalog.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub qualified_name: String,
    pub server_id: String,
    pub raw_name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: HashMap<String, CatalogEntry>,
}

impl Catalog {
    pub fn resolve(&self, qualified_name: &str) -> Option<&CatalogEntry> {
        self.entries.get(qualified_name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Renders the OpenAI-format `tools` array (spec §4.3 step 6).
    pub fn to_openai_tools(&self) -> Vec<Value> {
        let mut entries: Vec<&CatalogEntry> = self.entries.values().collect();
        entries.sort_by(|a, b| a.qualified_name.cmp(&b.qualified_name));
        entries
            .into_iter()
            .map(|e| {
                json!({
                    "type": "function",
                    "function": {
                        "name": e.qualified_name,
                        "description": format!("[{}] {}", e.server_id, e.description),
                        "parameters": e.input_schema,
                    }
                })
            })
            .collect()
    }
}

/// Builds a catalog from each connected server's raw tool list, applying
/// prefixing, collision suffixing, disabled-tool filtering, and per-tool
/// overrides.
pub fn build_catalog(
    per_server_tools: &[(ToolServerConfig, Vec<RawToolSpec>)],
) -> Catalog {
    let mut entries: HashMap<String, CatalogEntry> = HashMap::new();

    for (config, tools) in per_server_tools {
        for tool in tools {
            if config.disabled_tools.contains(&tool.name) {
                continue;
            }

            let mut qualified_name = match &config.tool_prefix {
                Some(prefix) => format!("{prefix}__{}", tool.name),
                None => tool.name.clone(),
            };

            if entries.contains_key(&qualified_name) {
                qualified_name = format!("{qualified_name}__{}", config.id);
            }

            let input_schema = match config.tool_overrides.get(&tool.name) {
                Some(override_schema) => override_schema.clone(),
                None => tool.input_schema.clone(),
            };

            entries.insert(
                qualified_name.clone(),
                CatalogEntry {
                    qualified_name,
                    server_id: config.id.clone(),
                    raw_name: tool.name.clone(),
                    description: tool.description.clone(),
                    input_schema,
                },
            );
        }
    }

    Catalog { entries }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;

    fn server(id: &str, prefix: Option<&str>) -> ToolServerConfig {
        ToolServerConfig {
            id: id.to_string(),
            enabled: true,
            transport: TransportConfig::CommandVector { command: vec!["x".into()] },
            tool_prefix: prefix.map(|p| p.to_string()),
            disabled_tools: Default::default(),
            tool_overrides: Default::default(),
        }
    }

    fn spec(name: &str) -> RawToolSpec {
        RawToolSpec {
            name: name.to_string(),
            description: "does a thing".to_string(),
            input_schema: json!({"type": "object", "properties": {}}),
        }
    }

    #[test]
    fn unprefixed_tool_keeps_raw_name() {
        let catalog = build_catalog(&[(server("calendar", None), vec![spec("list_events")])]);
        assert!(catalog.resolve("list_events").is_some());
    }

    #[test]
    fn prefixed_tool_is_double_underscore_joined() {
        let catalog = build_catalog(&[(server("drive", Some("drive")), vec![spec("search")])]);
        assert!(catalog.resolve("drive__search").is_some());
    }

    #[test]
    fn colliding_names_suffix_the_second_with_server_id() {
        let catalog = build_catalog(&[
            (server("a", None), vec![spec("search")]),
            (server("b", None), vec![spec("search")]),
        ]);
        assert!(catalog.resolve("search").is_some());
        assert!(catalog.resolve("search__b").is_some());
        assert_eq!(catalog.len(), 2);
    }

    #[test]
    fn disabled_tools_are_excluded() {
        let mut cfg = server("calendar", None);
        cfg.disabled_tools.insert("delete_event".to_string());
        let catalog = build_catalog(&[(cfg, vec![spec("delete_event"), spec("list_events")])]);
        assert!(catalog.resolve("delete_event").is_none());
        assert!(catalog.resolve("list_events").is_some());
    }

    #[test]
    fn description_is_server_id_prefixed_in_rendered_tools() {
        let catalog = build_catalog(&[(server("calendar", None), vec![spec("list_events")])]);
        let rendered = catalog.to_openai_tools();
        let description = rendered[0]["function"]["description"].as_str().unwrap();
        assert_eq!(description, "[calendar] does a thing");
    }
}
