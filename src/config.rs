//! Configuration types for the transformation filter.
//!
//! Mirrors the template schema carried in the proxy's filter configuration:
//! a registry of named transformations, each describing header rewrites,
//! extractions, dynamic metadata writes, and a body transformation. Parsed
//! from YAML or JSON; compiled into [`crate::Transformation`]s at load time.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Filter-level configuration: the registry of transformations routes can
/// reference by id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformationsConfig {
    pub transformations: BTreeMap<String, TransformationTemplate>,
}

/// A single transformation template, prior to compilation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformationTemplate {
    /// Switches lookup paths to JSON Pointer notation and stores extractions
    /// flat by name instead of merging them into the parsed body.
    pub advanced_templates: bool,
    /// Named extractions evaluated before any template renders.
    pub extractors: BTreeMap<String, ExtractionConfig>,
    /// Headers to set: all existing values are replaced by the rendered one.
    pub headers: BTreeMap<String, TemplateText>,
    /// Headers to append: rendered values are added, keeping existing ones.
    pub headers_to_append: Vec<HeaderToAppend>,
    /// Headers to remove.
    pub headers_to_remove: Vec<String>,
    /// Dynamic metadata entries to write on the stream.
    pub dynamic_metadata_values: Vec<DynamicMetadataValueConfig>,
    /// Whether the body is parsed as JSON before templates render.
    pub parse_body_behavior: ParseBodyBehavior,
    /// Swallow body JSON parse errors, leaving the context null.
    pub ignore_error_on_parse: bool,
    /// Replace the body with this rendered template.
    pub body: Option<TemplateText>,
    /// Leave the body untouched.
    pub passthrough: Option<Empty>,
    /// Replace the body with the parsed JSON after extraction injection.
    pub merge_extractors_to_body: Option<Empty>,
}

/// A template source string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateText {
    pub text: String,
}

impl From<&str> for TemplateText {
    fn from(text: &str) -> Self {
        Self {
            text: text.to_string(),
        }
    }
}

/// A header append entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeaderToAppend {
    pub key: String,
    pub value: TemplateText,
}

/// A dynamic metadata write. An empty namespace defaults to the filter's
/// canonical namespace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicMetadataValueConfig {
    pub metadata_namespace: String,
    pub key: String,
    pub value: TemplateText,
}

/// Body parse policy applied before templates render.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseBodyBehavior {
    #[default]
    ParseAsJson,
    DontParse,
}

/// An extraction definition: a regex over a named header or the body,
/// selecting one capture group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub header: Option<String>,
    pub body: Option<Empty>,
    pub regex: String,
    pub subgroup: usize,
}

/// Marker for fields whose presence alone carries meaning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_template() {
        let template = TransformationTemplate::default();
        assert!(!template.advanced_templates);
        assert_eq!(template.parse_body_behavior, ParseBodyBehavior::ParseAsJson);
        assert!(!template.ignore_error_on_parse);
        assert!(template.body.is_none());
        assert!(template.passthrough.is_none());
        assert!(template.merge_extractors_to_body.is_none());
    }

    #[test]
    fn test_parse_yaml_config() {
        let yaml = r#"
transformations:
  bearer-token:
    extractors:
      auth.token:
        header: authorization
        regex: "Bearer (.*)"
        subgroup: 1
    merge_extractors_to_body: {}
  echo-header:
    parse_body_behavior: dont_parse
    headers:
      x-echo:
        text: '{{ header("x-in") }}'
"#;
        let config: TransformationsConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.transformations.len(), 2);

        let bearer = &config.transformations["bearer-token"];
        assert!(bearer.merge_extractors_to_body.is_some());
        let extractor = &bearer.extractors["auth.token"];
        assert_eq!(extractor.header.as_deref(), Some("authorization"));
        assert_eq!(extractor.regex, "Bearer (.*)");
        assert_eq!(extractor.subgroup, 1);

        let echo = &config.transformations["echo-header"];
        assert_eq!(echo.parse_body_behavior, ParseBodyBehavior::DontParse);
        assert_eq!(
            echo.headers["x-echo"].text,
            r#"{{ header("x-in") }}"#
        );
    }

    #[test]
    fn test_parse_json_config() {
        let json = r#"{
            "transformations": {
                "rewrite": {
                    "advanced_templates": true,
                    "body": {"text": "{{ extraction(\"id\") }}"},
                    "headers_to_append": [
                        {"key": "x-tag", "value": {"text": "a"}}
                    ],
                    "headers_to_remove": ["x-internal"],
                    "dynamic_metadata_values": [
                        {"key": "user", "value": {"text": "{{ header(\"x-user\") }}"}}
                    ]
                }
            }
        }"#;
        let config: TransformationsConfig = serde_json::from_str(json).unwrap();
        let rewrite = &config.transformations["rewrite"];
        assert!(rewrite.advanced_templates);
        assert!(rewrite.body.is_some());
        assert_eq!(rewrite.headers_to_append.len(), 1);
        assert_eq!(rewrite.headers_to_remove, vec!["x-internal".to_string()]);
        assert_eq!(rewrite.dynamic_metadata_values[0].key, "user");
        assert!(rewrite.dynamic_metadata_values[0].metadata_namespace.is_empty());
    }

    #[test]
    fn test_extraction_body_source() {
        let yaml = r#"
body: {}
regex: ".*"
subgroup: 0
"#;
        let config: ExtractionConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.body.is_some());
        assert!(config.header.is_none());
    }
}
