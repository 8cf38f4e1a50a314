//! Regex extractions from headers or the body.

use crate::config::ExtractionConfig;
use crate::host::HeaderMap;
use crate::template::LazyBody;
use regex::Regex;
use tracing::debug;

/// Errors raised while compiling an extraction.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error(transparent)]
    Regex(#[from] regex::Error),
    #[error("group {group} requested for regex with only {count} sub groups")]
    InvalidSubgroup { group: usize, count: usize },
    #[error("exactly one of header or body must be set")]
    InvalidSource,
}

#[derive(Debug, Clone)]
enum ExtractionSource {
    /// A lowercased header name.
    Header(String),
    Body,
}

/// A compiled extraction: a regex applied end-to-end against a chosen input,
/// yielding one capture group.
#[derive(Debug, Clone)]
pub struct Extractor {
    source: ExtractionSource,
    regex: Regex,
    group: usize,
}

impl Extractor {
    pub fn new(config: &ExtractionConfig) -> Result<Self, ExtractionError> {
        let source = match (&config.header, &config.body) {
            (Some(header), None) if !header.is_empty() => {
                ExtractionSource::Header(header.to_lowercase())
            }
            (None, Some(_)) => ExtractionSource::Body,
            _ => return Err(ExtractionError::InvalidSource),
        };

        // The configured pattern must match the whole input, so anchor it.
        let regex = Regex::new(&format!("^(?:{})$", config.regex))?;
        let sub_groups = regex.captures_len() - 1;
        if config.subgroup > sub_groups {
            return Err(ExtractionError::InvalidSubgroup {
                group: config.subgroup,
                count: sub_groups,
            });
        }

        Ok(Self {
            source,
            regex,
            group: config.subgroup,
        })
    }

    /// Run the extraction against the message. Returns an empty string when
    /// the header is absent or the regex does not match.
    pub fn extract(&self, headers: &HeaderMap, body: &LazyBody<'_>) -> String {
        match &self.source {
            ExtractionSource::Body => self.extract_value(body.get()),
            ExtractionSource::Header(name) => match headers.get(name) {
                Some(value) => self.extract_value(value),
                None => String::new(),
            },
        }
    }

    fn extract_value(&self, input: &str) -> String {
        match self.regex.captures(input) {
            Some(captures) => match captures.get(self.group) {
                Some(matched) => matched.as_str().to_string(),
                None => {
                    debug!(group = self.group, "extraction group did not participate");
                    String::new()
                }
            },
            None => {
                debug!("extraction regex did not match input");
                String::new()
            }
        }
    }
}
