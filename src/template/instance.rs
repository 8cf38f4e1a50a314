//! Per-message template evaluation.

use super::{Expr, RootPath, Segment, Template};
use crate::host::{BodyBuffer, HeaderMap, Metadata, RandomGenerator, Value};
use base64::{
    engine::general_purpose::{STANDARD, STANDARD_NO_PAD},
    Engine as _,
};
use serde_json::{json, Value as JsonValue};
use std::cell::OnceCell;
use std::collections::HashMap;
use std::sync::LazyLock;

static EMPTY_OBJECT: LazyLock<JsonValue> = LazyLock::new(|| JsonValue::Object(Default::default()));

/// Errors raised while rendering a compiled template.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("no value found for '{0}'")]
    Undefined(String),
    #[error("argument {index} to '{function}' must be a string")]
    ArgumentType {
        function: &'static str,
        index: usize,
    },
}

/// Body bytes exposed as a string, converted at most once per message.
pub struct LazyBody<'a> {
    buffer: &'a BodyBuffer,
    cache: OnceCell<String>,
}

impl<'a> LazyBody<'a> {
    pub fn new(buffer: &'a BodyBuffer) -> Self {
        Self {
            buffer,
            cache: OnceCell::new(),
        }
    }

    pub fn get(&self) -> &str {
        self.cache.get_or_init(|| self.buffer.to_string_lossy())
    }
}

/// Evaluates compiled templates against one live message.
///
/// Holds references into the message and its derived state; it must not
/// outlive any of them. The pattern→random memo keeps
/// `replace_with_random` stable for equal patterns within the message.
pub struct TransformerInstance<'a> {
    headers: &'a HeaderMap,
    request_headers: Option<&'a HeaderMap>,
    body: &'a LazyBody<'a>,
    extractions: &'a HashMap<String, String>,
    context: &'a JsonValue,
    environ: &'a HashMap<String, String>,
    cluster_metadata: Option<&'a Metadata>,
    rng: &'a dyn RandomGenerator,
    pattern_replacements: HashMap<String, String>,
}

impl<'a> TransformerInstance<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        headers: &'a HeaderMap,
        request_headers: Option<&'a HeaderMap>,
        body: &'a LazyBody<'a>,
        extractions: &'a HashMap<String, String>,
        context: &'a JsonValue,
        environ: &'a HashMap<String, String>,
        cluster_metadata: Option<&'a Metadata>,
        rng: &'a dyn RandomGenerator,
    ) -> Self {
        Self {
            headers,
            request_headers,
            body,
            extractions,
            context,
            environ,
            cluster_metadata,
            rng,
            pattern_replacements: HashMap::new(),
        }
    }

    /// Render a compiled template to a string.
    pub fn render(&mut self, template: &Template) -> Result<String, RenderError> {
        let mut output = String::new();
        for segment in &template.segments {
            match segment {
                Segment::Literal(text) => output.push_str(text),
                Segment::Expr(expr) => {
                    let value = self.eval(expr)?;
                    output.push_str(&stringify(&value));
                }
            }
        }
        Ok(output)
    }

    /// The lookup root for bare paths. Non-object contexts are replaced with
    /// an empty object so callbacks that need no context still render;
    /// `context()` itself returns the original value.
    fn root(&self) -> &JsonValue {
        if self.context.is_object() {
            self.context
        } else {
            &EMPTY_OBJECT
        }
    }

    fn eval(&mut self, expr: &Expr) -> Result<JsonValue, RenderError> {
        match expr {
            Expr::Str(value) => Ok(JsonValue::String(value.clone())),
            Expr::Int(value) => Ok(json!(value)),
            Expr::Root(RootPath::Key(key)) => self
                .root()
                .get(key)
                .cloned()
                .ok_or_else(|| RenderError::Undefined(key.clone())),
            Expr::Root(RootPath::Pointer(pointer)) => self
                .root()
                .pointer(pointer)
                .cloned()
                .ok_or_else(|| RenderError::Undefined(pointer.clone())),
            Expr::Select { base, path } => {
                let mut value = self.eval(base)?;
                for segment in path {
                    let next = match &value {
                        JsonValue::Object(map) => map.get(segment).cloned(),
                        JsonValue::Array(items) => segment
                            .parse::<usize>()
                            .ok()
                            .and_then(|index| items.get(index).cloned()),
                        _ => None,
                    };
                    value = next.ok_or_else(|| RenderError::Undefined(segment.clone()))?;
                }
                Ok(value)
            }
            Expr::Call { name, args } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg)?);
                }
                self.invoke(name, values)
            }
        }
    }

    fn invoke(&mut self, name: &str, args: Vec<JsonValue>) -> Result<JsonValue, RenderError> {
        match name {
            "header" => {
                let name = str_arg("header", &args, 0)?;
                Ok(json!(self.headers.get(name).unwrap_or("")))
            }
            "request_header" => {
                let name = str_arg("request_header", &args, 0)?;
                let value = self
                    .request_headers
                    .and_then(|headers| headers.get(name))
                    .unwrap_or("");
                Ok(json!(value))
            }
            "extraction" => {
                let name = str_arg("extraction", &args, 0)?;
                let value = self.extractions.get(name).map(String::as_str).unwrap_or("");
                Ok(json!(value))
            }
            "context" => Ok(self.context.clone()),
            "body" => Ok(json!(self.body.get())),
            "env" => {
                let key = str_arg("env", &args, 0)?;
                let value = self.environ.get(key).map(String::as_str).unwrap_or("");
                Ok(json!(value))
            }
            "clusterMetadata" => {
                let key = str_arg("clusterMetadata", &args, 0)?;
                Ok(self.cluster_metadata_value(key))
            }
            "base64_encode" => {
                let input = str_arg("base64_encode", &args, 0)?;
                Ok(json!(STANDARD.encode(input)))
            }
            "base64_decode" => {
                let input = str_arg("base64_decode", &args, 0)?;
                let decoded = match STANDARD.decode(input) {
                    Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                    Err(_) => String::new(),
                };
                Ok(json!(decoded))
            }
            "substring" => self.substring(&args),
            "replace_with_random" => {
                let source = str_arg("replace_with_random", &args, 0)?.to_string();
                let pattern = str_arg("replace_with_random", &args, 1)?.to_string();
                let replacement = self.random_for_pattern(&pattern).to_string();
                Ok(json!(source.replace(&pattern, &replacement)))
            }
            other => Err(RenderError::Undefined(other.to_string())),
        }
    }

    /// Byte substring of `args[0]` from `start`, optionally capped at `len`
    /// bytes. Out-of-range starts and non-integer positions yield an empty
    /// string; overlong lengths clamp to the end of the input.
    fn substring(&self, args: &[JsonValue]) -> Result<JsonValue, RenderError> {
        let input = str_arg("substring", args, 0)?;
        let Some(start) = args[1].as_i64() else {
            return Ok(json!(""));
        };
        let mut length = -1;
        if args.len() == 3 {
            match args[2].as_i64() {
                Some(value) => length = value,
                None => return Ok(json!("")),
            }
        }

        let input_len = input.len() as i64;
        if start < 0 || start >= input_len {
            return Ok(json!(""));
        }

        let bytes = input.as_bytes();
        let slice = if length <= 0 || start.saturating_add(length) > input_len {
            &bytes[start as usize..]
        } else {
            &bytes[start as usize..(start + length) as usize]
        };
        Ok(json!(String::from_utf8_lossy(slice).into_owned()))
    }

    fn cluster_metadata_value(&self, key: &str) -> JsonValue {
        let Some(metadata) = self.cluster_metadata else {
            return json!("");
        };
        let Some(value) = metadata.value(crate::METADATA_NAMESPACE, key) else {
            return json!("");
        };
        match value {
            Value::String(value) => json!(value),
            Value::Number(value) => json!(*value),
            Value::Bool(value) => json!(if *value { "true" } else { "false" }),
            Value::List(items) if !items.is_empty() => {
                let mut joined = String::new();
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        joined.push(',');
                    }
                    match item {
                        Value::String(value) => joined.push_str(value),
                        Value::Number(value) => joined.push_str(&value.to_string()),
                        Value::Bool(value) => {
                            joined.push_str(if *value { "true" } else { "false" })
                        }
                        _ => {}
                    }
                }
                json!(joined)
            }
            _ => json!(""),
        }
    }

    /// The 128-bit random replacement for `pattern`, generated on first use
    /// and reused for the lifetime of this instance.
    fn random_for_pattern(&mut self, pattern: &str) -> &str {
        if !self.pattern_replacements.contains_key(pattern) {
            let low = self.rng.random();
            let high = self.rng.random();
            let mut bytes = [0u8; 16];
            bytes[..8].copy_from_slice(&low.to_le_bytes());
            bytes[8..].copy_from_slice(&high.to_le_bytes());
            self.pattern_replacements
                .insert(pattern.to_string(), STANDARD_NO_PAD.encode(bytes));
        }
        &self.pattern_replacements[pattern]
    }
}

/// String values render raw; everything else renders as its JSON form.
fn stringify(value: &JsonValue) -> String {
    match value {
        JsonValue::String(value) => value.clone(),
        other => other.to_string(),
    }
}

fn str_arg<'v>(
    function: &'static str,
    args: &'v [JsonValue],
    index: usize,
) -> Result<&'v str, RenderError> {
    args[index]
        .as_str()
        .ok_or(RenderError::ArgumentType { function, index })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::ElementNotation;

    struct Fixture {
        headers: HeaderMap,
        request_headers: Option<HeaderMap>,
        body: BodyBuffer,
        extractions: HashMap<String, String>,
        context: JsonValue,
        environ: HashMap<String, String>,
        cluster_metadata: Option<Metadata>,
    }

    impl Default for Fixture {
        fn default() -> Self {
            let mut headers = HeaderMap::new();
            headers.add("x-custom", "custom-value");
            headers.add(":path", "/api/users");

            let mut extractions = HashMap::new();
            extractions.insert("token".to_string(), "abc123".to_string());

            let mut environ = HashMap::new();
            environ.insert("REGION".to_string(), "us-east-1".to_string());

            Self {
                headers,
                request_headers: None,
                body: BodyBuffer::from(r#"{"user":{"name":"ada"}}"#),
                extractions,
                context: serde_json::json!({"user": {"name": "ada", "tags": ["a", "b"]}}),
                environ,
                cluster_metadata: None,
            }
        }
    }

    impl Fixture {
        fn render(&self, source: &str) -> Result<String, RenderError> {
            self.render_with(source, ElementNotation::Dot)
        }

        fn render_with(
            &self,
            source: &str,
            notation: ElementNotation,
        ) -> Result<String, RenderError> {
            let template = Template::parse(source, notation).unwrap();
            let body = LazyBody::new(&self.body);
            let rng = crate::host::StdRandomGenerator;
            let mut instance = TransformerInstance::new(
                &self.headers,
                self.request_headers.as_ref(),
                &body,
                &self.extractions,
                &self.context,
                &self.environ,
                self.cluster_metadata.as_ref(),
                &rng,
            );
            instance.render(&template)
        }
    }

    #[test]
    fn test_header_callback() {
        let fixture = Fixture::default();
        assert_eq!(
            fixture.render(r#"{{ header("x-custom") }}"#).unwrap(),
            "custom-value"
        );
        assert_eq!(fixture.render(r#"{{ header("missing") }}"#).unwrap(), "");
    }

    #[test]
    fn test_request_header_callback_unbound() {
        let fixture = Fixture::default();
        assert_eq!(
            fixture.render(r#"{{ request_header("x-custom") }}"#).unwrap(),
            ""
        );
    }

    #[test]
    fn test_request_header_callback_bound() {
        let mut request_headers = HeaderMap::new();
        request_headers.add("x-request-id", "r1");
        let fixture = Fixture {
            request_headers: Some(request_headers),
            ..Fixture::default()
        };
        assert_eq!(
            fixture
                .render(r#"{{ request_header("x-request-id") }}"#)
                .unwrap(),
            "r1"
        );
    }

    #[test]
    fn test_extraction_callback() {
        let fixture = Fixture::default();
        assert_eq!(
            fixture.render(r#"{{ extraction("token") }}"#).unwrap(),
            "abc123"
        );
        assert_eq!(fixture.render(r#"{{ extraction("nope") }}"#).unwrap(), "");
    }

    #[test]
    fn test_body_callback() {
        let fixture = Fixture::default();
        assert_eq!(
            fixture.render("{{ body() }}").unwrap(),
            r#"{"user":{"name":"ada"}}"#
        );
    }

    #[test]
    fn test_env_callback() {
        let fixture = Fixture::default();
        assert_eq!(fixture.render(r#"{{ env("REGION") }}"#).unwrap(), "us-east-1");
        assert_eq!(fixture.render(r#"{{ env("MISSING") }}"#).unwrap(), "");
    }

    #[test]
    fn test_context_path() {
        let fixture = Fixture::default();
        assert_eq!(
            fixture.render("{{ context().user.name }}").unwrap(),
            "ada"
        );
        assert_eq!(fixture.render("{{ user.name }}").unwrap(), "ada");
        assert_eq!(fixture.render("{{ user.tags.1 }}").unwrap(), "b");
    }

    #[test]
    fn test_pointer_notation() {
        let fixture = Fixture::default();
        assert_eq!(
            fixture
                .render_with("{{ /user/name }}", ElementNotation::Pointer)
                .unwrap(),
            "ada"
        );
    }

    #[test]
    fn test_missing_path_is_error() {
        let fixture = Fixture::default();
        assert_eq!(
            fixture.render("{{ user.missing }}"),
            Err(RenderError::Undefined("missing".to_string()))
        );
    }

    #[test]
    fn test_non_object_context() {
        let fixture = Fixture {
            context: JsonValue::Null,
            ..Fixture::default()
        };
        // Lookups fail, but callbacks that need no context still render, and
        // context() returns the original value.
        assert!(fixture.render("{{ user.name }}").is_err());
        assert_eq!(
            fixture.render(r#"{{ header("x-custom") }}"#).unwrap(),
            "custom-value"
        );
        assert_eq!(fixture.render("{{ context() }}").unwrap(), "null");
    }

    #[test]
    fn test_base64_round_trip() {
        let fixture = Fixture::default();
        assert_eq!(
            fixture.render(r#"{{ base64_encode("hello") }}"#).unwrap(),
            "aGVsbG8="
        );
        assert_eq!(
            fixture.render(r#"{{ base64_decode("aGVsbG8=") }}"#).unwrap(),
            "hello"
        );
        assert_eq!(
            fixture.render(r#"{{ base64_decode("not base64!") }}"#).unwrap(),
            ""
        );
    }

    #[test]
    fn test_substring() {
        let fixture = Fixture::default();
        assert_eq!(
            fixture.render(r#"{{ substring("abcdef", 2) }}"#).unwrap(),
            "cdef"
        );
        assert_eq!(
            fixture.render(r#"{{ substring("abcdef", 2, 3) }}"#).unwrap(),
            "cde"
        );
        // Overlong length clamps to the end of the input.
        assert_eq!(
            fixture.render(r#"{{ substring("abcdef", 4, 100) }}"#).unwrap(),
            "ef"
        );
        assert_eq!(
            fixture.render(r#"{{ substring("abcdef", -1) }}"#).unwrap(),
            ""
        );
        assert_eq!(
            fixture.render(r#"{{ substring("abcdef", 6) }}"#).unwrap(),
            ""
        );
        assert_eq!(
            fixture
                .render(r#"{{ substring("abcdef", "nope") }}"#)
                .unwrap(),
            ""
        );
    }

    #[test]
    fn test_cluster_metadata_kinds() {
        let mut metadata = Metadata::default();
        metadata.insert(crate::METADATA_NAMESPACE, "name", Value::from("upstream"));
        metadata.insert(crate::METADATA_NAMESPACE, "weight", Value::Number(3.0));
        metadata.insert(crate::METADATA_NAMESPACE, "canary", Value::Bool(true));
        metadata.insert(
            crate::METADATA_NAMESPACE,
            "zones",
            Value::List(vec![
                Value::from("a"),
                Value::Number(2.0),
                Value::Bool(false),
            ]),
        );
        metadata.insert(
            crate::METADATA_NAMESPACE,
            "nested",
            Value::Struct(Default::default()),
        );
        let fixture = Fixture {
            cluster_metadata: Some(metadata),
            ..Fixture::default()
        };

        assert_eq!(
            fixture.render(r#"{{ clusterMetadata("name") }}"#).unwrap(),
            "upstream"
        );
        assert_eq!(
            fixture.render(r#"{{ clusterMetadata("weight") }}"#).unwrap(),
            "3.0"
        );
        assert_eq!(
            fixture.render(r#"{{ clusterMetadata("canary") }}"#).unwrap(),
            "true"
        );
        assert_eq!(
            fixture.render(r#"{{ clusterMetadata("zones") }}"#).unwrap(),
            "a,2,false"
        );
        assert_eq!(
            fixture.render(r#"{{ clusterMetadata("nested") }}"#).unwrap(),
            ""
        );
        assert_eq!(
            fixture.render(r#"{{ clusterMetadata("missing") }}"#).unwrap(),
            ""
        );
    }

    #[test]
    fn test_cluster_metadata_unbound() {
        let fixture = Fixture::default();
        assert_eq!(
            fixture.render(r#"{{ clusterMetadata("name") }}"#).unwrap(),
            ""
        );
    }

    #[test]
    fn test_replace_with_random_stable_within_instance() {
        let fixture = Fixture::default();
        let template = Template::parse(
            r#"{{ replace_with_random("x-PAT-x", "PAT") }}|{{ replace_with_random("y-PAT-y", "PAT") }}"#,
            ElementNotation::Dot,
        )
        .unwrap();

        let body = LazyBody::new(&fixture.body);
        let rng = crate::host::StdRandomGenerator;
        let mut instance = TransformerInstance::new(
            &fixture.headers,
            None,
            &body,
            &fixture.extractions,
            &fixture.context,
            &fixture.environ,
            None,
            &rng,
        );
        let output = instance.render(&template).unwrap();
        let (left, right) = output.split_once('|').unwrap();
        let token_left = left
            .strip_prefix("x-")
            .and_then(|s| s.strip_suffix("-x"))
            .unwrap();
        let token_right = right
            .strip_prefix("y-")
            .and_then(|s| s.strip_suffix("-y"))
            .unwrap();
        assert_eq!(token_left, token_right);
        // 16 bytes unpadded -> 22 base64 characters.
        assert_eq!(token_left.len(), 22);
        assert!(!token_left.contains('='));
    }

    #[test]
    fn test_replace_with_random_fresh_across_instances() {
        let fixture = Fixture::default();
        let first = fixture
            .render(r#"{{ replace_with_random("PAT", "PAT") }}"#)
            .unwrap();
        let second = fixture
            .render(r#"{{ replace_with_random("PAT", "PAT") }}"#)
            .unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_render_deterministic() {
        let fixture = Fixture::default();
        let source = r#"{{ header("x-custom") }}-{{ user.name }}-{{ extraction("token") }}"#;
        assert_eq!(
            fixture.render(source).unwrap(),
            fixture.render(source).unwrap()
        );
    }

    #[test]
    fn test_non_string_argument_is_error() {
        let fixture = Fixture::default();
        assert_eq!(
            fixture.render("{{ header(42) }}"),
            Err(RenderError::ArgumentType {
                function: "header",
                index: 0,
            })
        );
    }

    #[test]
    fn test_nested_calls() {
        let fixture = Fixture::default();
        assert_eq!(
            fixture
                .render(r#"{{ base64_decode(base64_encode(header("x-custom"))) }}"#)
                .unwrap(),
            "custom-value"
        );
    }
}
