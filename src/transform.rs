//! Compiled transformations and their application to live messages.

use crate::config::{ParseBodyBehavior, TransformationTemplate};
use crate::extract::{ExtractionError, Extractor};
use crate::host::{BodyBuffer, FilterCallbacks, HeaderMap, RandomGenerator, Value};
use crate::template::{ElementNotation, LazyBody, RenderError, Template, TemplateError, TransformerInstance};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};

/// Errors raised while compiling a [`Transformation`] from configuration.
/// Any of these aborts the configuration load.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse header template '{name}': {source}")]
    HeaderTemplate { name: String, source: TemplateError },
    #[error("failed to parse body template: {0}")]
    BodyTemplate(TemplateError),
    #[error("failed to parse dynamic metadata template '{key}': {source}")]
    DynamicMetadataTemplate { key: String, source: TemplateError },
    #[error("extraction '{name}': {source}")]
    Extraction {
        name: String,
        source: ExtractionError,
    },
    #[error("only one of body, passthrough, or merge_extractors_to_body may be set")]
    AmbiguousBodyTransformation,
    #[error("transformation '{name}': {source}")]
    Transformation {
        name: String,
        source: Box<ConfigError>,
    },
}

/// Errors raised while applying a transformation to a message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransformError {
    #[error("{0}")]
    JsonParse(String),
    #[error("{0}")]
    TemplateRender(String),
}

impl From<RenderError> for TransformError {
    fn from(error: RenderError) -> Self {
        Self::TemplateRender(error.to_string())
    }
}

#[derive(Debug, Clone)]
enum BodyTransformation {
    Unset,
    Passthrough,
    Body(Template),
    MergeExtractorsToBody,
}

#[derive(Debug, Clone)]
struct DynamicMetadataValue {
    namespace: String,
    key: String,
    template: Template,
}

/// A transformation compiled at configuration load: every template is parsed
/// once here and reused across streams.
#[derive(Debug, Clone)]
pub struct Transformation {
    headers: Vec<(String, Template)>,
    headers_to_append: Vec<(String, Template)>,
    headers_to_remove: Vec<String>,
    dynamic_metadata: Vec<DynamicMetadataValue>,
    body: BodyTransformation,
    parse_body_behavior: ParseBodyBehavior,
    ignore_error_on_parse: bool,
    advanced_templates: bool,
    extractors: Vec<(String, Extractor)>,
    environ: HashMap<String, String>,
}

impl Transformation {
    /// Compile a transformation, snapshotting the process environment for
    /// the `env` callback.
    pub fn new(config: &TransformationTemplate) -> Result<Self, ConfigError> {
        Self::with_environ(config, std::env::vars().collect())
    }

    /// Compile a transformation with an explicit environment snapshot.
    pub fn with_environ(
        config: &TransformationTemplate,
        environ: HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let notation = if config.advanced_templates {
            ElementNotation::Pointer
        } else {
            ElementNotation::Dot
        };

        let mut headers = Vec::with_capacity(config.headers.len());
        for (name, template) in &config.headers {
            let compiled = Template::parse(&template.text, notation).map_err(|source| {
                ConfigError::HeaderTemplate {
                    name: name.clone(),
                    source,
                }
            })?;
            headers.push((name.to_lowercase(), compiled));
        }

        let mut headers_to_append = Vec::with_capacity(config.headers_to_append.len());
        for entry in &config.headers_to_append {
            let compiled = Template::parse(&entry.value.text, notation).map_err(|source| {
                ConfigError::HeaderTemplate {
                    name: entry.key.clone(),
                    source,
                }
            })?;
            headers_to_append.push((entry.key.to_lowercase(), compiled));
        }

        let mut dynamic_metadata = Vec::with_capacity(config.dynamic_metadata_values.len());
        for entry in &config.dynamic_metadata_values {
            let compiled = Template::parse(&entry.value.text, notation).map_err(|source| {
                ConfigError::DynamicMetadataTemplate {
                    key: entry.key.clone(),
                    source,
                }
            })?;
            let namespace = if entry.metadata_namespace.is_empty() {
                crate::METADATA_NAMESPACE.to_string()
            } else {
                entry.metadata_namespace.clone()
            };
            dynamic_metadata.push(DynamicMetadataValue {
                namespace,
                key: entry.key.clone(),
                template: compiled,
            });
        }

        let mut body_modes = 0;
        body_modes += usize::from(config.body.is_some());
        body_modes += usize::from(config.passthrough.is_some());
        body_modes += usize::from(config.merge_extractors_to_body.is_some());
        if body_modes > 1 {
            return Err(ConfigError::AmbiguousBodyTransformation);
        }
        let body = if let Some(template) = &config.body {
            BodyTransformation::Body(
                Template::parse(&template.text, notation).map_err(ConfigError::BodyTemplate)?,
            )
        } else if config.passthrough.is_some() {
            BodyTransformation::Passthrough
        } else if config.merge_extractors_to_body.is_some() {
            BodyTransformation::MergeExtractorsToBody
        } else {
            BodyTransformation::Unset
        };

        let mut extractors = Vec::with_capacity(config.extractors.len());
        for (name, extraction) in &config.extractors {
            let extractor = Extractor::new(extraction).map_err(|source| ConfigError::Extraction {
                name: name.clone(),
                source,
            })?;
            extractors.push((name.clone(), extractor));
        }

        Ok(Self {
            headers,
            headers_to_append,
            headers_to_remove: config
                .headers_to_remove
                .iter()
                .map(|name| name.to_lowercase())
                .collect(),
            dynamic_metadata,
            body,
            parse_body_behavior: config.parse_body_behavior,
            ignore_error_on_parse: config.ignore_error_on_parse,
            advanced_templates: config.advanced_templates,
            extractors,
            environ,
        })
    }

    /// Apply the transformation to a message in place.
    ///
    /// All templates render against the original headers and body; header
    /// mutations, dynamic metadata writes, and the body replacement are
    /// applied afterwards, body strictly last.
    pub fn transform(
        &self,
        headers: &mut HeaderMap,
        request_headers: Option<&HeaderMap>,
        body: &mut BodyBuffer,
        callbacks: &mut dyn FilterCallbacks,
        rng: &dyn RandomGenerator,
    ) -> Result<(), TransformError> {
        let lazy_body = LazyBody::new(&*body);

        let mut json_body = JsonValue::Null;
        if self.parse_body_behavior == ParseBodyBehavior::ParseAsJson && body.length() > 0 {
            match serde_json::from_str(lazy_body.get()) {
                Ok(parsed) => json_body = parsed,
                Err(error) => {
                    if !self.ignore_error_on_parse {
                        return Err(TransformError::JsonParse(error.to_string()));
                    }
                }
            }
        }

        let mut extractions = HashMap::new();
        for (name, extractor) in &self.extractors {
            let value = extractor.extract(&*headers, &lazy_body);
            if self.advanced_templates {
                extractions.insert(name.clone(), value);
            } else {
                inject_extraction(&mut json_body, name, value);
            }
        }

        let cluster_info = callbacks.cluster_info();
        let cluster_metadata = cluster_info.as_deref().map(|cluster| &cluster.metadata);

        let mut instance = TransformerInstance::new(
            &*headers,
            request_headers,
            &lazy_body,
            &extractions,
            &json_body,
            &self.environ,
            cluster_metadata,
            rng,
        );

        let new_body = match &self.body {
            BodyTransformation::Body(template) => Some(instance.render(template)?),
            BodyTransformation::MergeExtractorsToBody => Some(json_body.to_string()),
            BodyTransformation::Passthrough | BodyTransformation::Unset => None,
        };

        let mut metadata_writes = Vec::with_capacity(self.dynamic_metadata.len());
        for entry in &self.dynamic_metadata {
            let output = instance.render(&entry.template)?;
            if !output.is_empty() {
                metadata_writes.push((entry.namespace.clone(), entry.key.clone(), output));
            }
        }

        let mut header_values = Vec::with_capacity(self.headers.len());
        for (name, template) in &self.headers {
            header_values.push((name, instance.render(template)?));
        }

        let mut append_values = Vec::with_capacity(self.headers_to_append.len());
        for (name, template) in &self.headers_to_append {
            append_values.push((name, instance.render(template)?));
        }

        // The evaluator and the body view hold shared borrows of the
        // message; release them before mutating it.
        drop(instance);
        drop(lazy_body);

        for (namespace, key, output) in metadata_writes {
            let mut values = BTreeMap::new();
            values.insert(key, Value::String(output));
            callbacks.set_dynamic_metadata(&namespace, values);
        }

        for (name, output) in header_values {
            headers.remove(name);
            if !output.is_empty() {
                headers.add(name.clone(), output);
            }
        }

        for name in &self.headers_to_remove {
            headers.remove(name);
        }

        for (name, output) in append_values {
            if !output.is_empty() {
                headers.add(name.clone(), output);
            }
        }

        // Replace the body last so everything above observed the original.
        if let Some(new_body) = new_body {
            headers.remove_content_length();
            body.drain(body.length());
            body.prepend(new_body.as_bytes());
            headers.set_content_length(body.length());
        }

        Ok(())
    }
}

/// Write an extraction into the parsed body under its dotted name, creating
/// intermediate objects and overwriting non-object values on the way.
fn inject_extraction(root: &mut JsonValue, name: &str, value: String) {
    let mut current = root;
    let mut rest = name;
    while let Some(position) = rest.find('.') {
        let field = &rest[..position];
        if !current.is_object() {
            *current = JsonValue::Object(Default::default());
        }
        current = current
            .as_object_mut()
            .expect("just replaced with an object")
            .entry(field.to_string())
            .or_insert(JsonValue::Null);
        rest = &rest[position + 1..];
    }
    if !current.is_object() {
        *current = JsonValue::Object(Default::default());
    }
    current
        .as_object_mut()
        .expect("just replaced with an object")
        .insert(rest.to_string(), JsonValue::String(value));
}
