//! The HTTP filter driving transformations through the proxy's
//! decode/encode lifecycle.
//!
//! Each stream gets its own filter instance. On the request path the filter
//! resolves a transformation from route metadata, buffers the body up to the
//! decoder limit, and transforms once end-of-stream is seen; errors become a
//! local reply. The response path works the same against the encoder limit,
//! except errors are rewritten in place because the upstream has already
//! started responding.

use crate::config::TransformationsConfig;
use crate::host::{
    BodyBuffer, FilterCallbacks, HeaderMap, MetadataAccessor, RandomGenerator, StdRandomGenerator,
};
use crate::transform::{ConfigError, TransformError, Transformation};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Route metadata key selecting the request-side transformation.
pub const REQUEST_TRANSFORMATION_KEY: &str = "request_transformation";
/// Route metadata key selecting the response-side transformation.
pub const RESPONSE_TRANSFORMATION_KEY: &str = "response_transformation";

/// Status returned from header callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterHeadersStatus {
    Continue,
    StopIteration,
}

/// Status returned from data callbacks. `StopIterationNoBuffer` tells the
/// host not to buffer on the filter's behalf; the filter holds the bytes
/// itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDataStatus {
    Continue,
    StopIterationNoBuffer,
}

/// Status returned from trailer callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterTrailersStatus {
    Continue,
    StopIteration,
}

/// Errors surfaced to the client, with their HTTP status and body text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
    #[error("payload too large")]
    PayloadTooLarge,
    #[error("bad request: {0}")]
    JsonParse(String),
    #[error("bad request: {0}")]
    TemplateRender(String),
    #[error("transformation for function not found")]
    TransformationNotFound,
}

impl FilterError {
    pub fn status(&self) -> u16 {
        match self {
            Self::PayloadTooLarge => 413,
            Self::JsonParse(_) | Self::TemplateRender(_) => 400,
            Self::TransformationNotFound => 404,
        }
    }
}

impl From<TransformError> for FilterError {
    fn from(error: TransformError) -> Self {
        match error {
            TransformError::JsonParse(detail) => Self::JsonParse(detail),
            TransformError::TemplateRender(detail) => Self::TemplateRender(detail),
        }
    }
}

/// Immutable filter configuration shared across streams: the compiled
/// transformation registry and the RNG handed to template rendering.
pub struct FilterConfig {
    transformations: HashMap<String, Arc<Transformation>>,
    rng: Arc<dyn RandomGenerator>,
}

impl std::fmt::Debug for FilterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterConfig")
            .field("transformations", &self.transformations.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl FilterConfig {
    /// Compile every transformation in the registry. Any template or
    /// extraction error aborts the load.
    pub fn new(config: &TransformationsConfig) -> Result<Self, ConfigError> {
        Self::with_rng(config, Arc::new(StdRandomGenerator))
    }

    pub fn with_rng(
        config: &TransformationsConfig,
        rng: Arc<dyn RandomGenerator>,
    ) -> Result<Self, ConfigError> {
        let mut transformations = HashMap::with_capacity(config.transformations.len());
        for (name, template) in &config.transformations {
            let transformation =
                Transformation::new(template).map_err(|source| ConfigError::Transformation {
                    name: name.clone(),
                    source: Box::new(source),
                })?;
            transformations.insert(name.clone(), Arc::new(transformation));
        }
        Ok(Self {
            transformations,
            rng,
        })
    }

    pub fn transformation(&self, name: &str) -> Option<Arc<Transformation>> {
        self.transformations.get(name).cloned()
    }

    pub fn rng(&self) -> &dyn RandomGenerator {
        &*self.rng
    }
}

/// Per-stream filter state.
pub struct TransformationFilter {
    config: Arc<FilterConfig>,
    /// Functional mode: route metadata maps cluster and function name to a
    /// transformation id instead of naming one directly.
    functional: bool,
    decoder_buffer_limit: usize,
    encoder_buffer_limit: usize,
    error: Option<FilterError>,
    request_body: BodyBuffer,
    response_body: BodyBuffer,
    /// Snapshot of the request headers for `request_header` callbacks,
    /// refreshed after the request-side transformation runs.
    request_headers: Option<HeaderMap>,
    request_transformation: Option<Arc<Transformation>>,
    response_transformation: Option<Arc<Transformation>>,
    current_function: Option<String>,
    destroyed: bool,
}

impl TransformationFilter {
    /// Create the filter for one stream. A buffer limit of zero disables the
    /// cap for that direction.
    pub fn new(
        config: Arc<FilterConfig>,
        functional: bool,
        decoder_buffer_limit: usize,
        encoder_buffer_limit: usize,
    ) -> Self {
        Self {
            config,
            functional,
            decoder_buffer_limit,
            encoder_buffer_limit,
            error: None,
            request_body: BodyBuffer::new(),
            response_body: BodyBuffer::new(),
            request_headers: None,
            request_transformation: None,
            response_transformation: None,
            current_function: None,
            destroyed: false,
        }
    }

    /// Record the function selected for this request. Must run before
    /// decoding in functional mode.
    pub fn retrieve_function(&mut self, accessor: &dyn MetadataAccessor) {
        self.current_function = accessor.function_name().map(str::to_string);
    }

    pub fn decode_headers(
        &mut self,
        callbacks: &mut dyn FilterCallbacks,
        headers: &mut HeaderMap,
        end_stream: bool,
    ) -> FilterHeadersStatus {
        self.check_request_active(callbacks);

        if self.is_error() {
            return FilterHeadersStatus::StopIteration;
        }

        self.request_headers = Some(headers.clone());

        if !self.request_active() {
            return FilterHeadersStatus::Continue;
        }

        if end_stream {
            self.transform_request(callbacks, headers);
            self.request_headers = Some(headers.clone());
            return if self.is_error() {
                FilterHeadersStatus::StopIteration
            } else {
                FilterHeadersStatus::Continue
            };
        }

        FilterHeadersStatus::StopIteration
    }

    pub fn decode_data(
        &mut self,
        callbacks: &mut dyn FilterCallbacks,
        headers: &mut HeaderMap,
        data: &mut BodyBuffer,
        end_stream: bool,
    ) -> FilterDataStatus {
        if !self.request_active() {
            return FilterDataStatus::Continue;
        }

        self.request_body.move_from(data);
        if self.decoder_buffer_limit != 0 && self.request_body.length() > self.decoder_buffer_limit
        {
            self.set_error(FilterError::PayloadTooLarge);
            self.send_request_error(callbacks);
            return FilterDataStatus::StopIterationNoBuffer;
        }

        if end_stream {
            self.transform_request(callbacks, headers);
            self.request_headers = Some(headers.clone());
            return if self.is_error() {
                FilterDataStatus::StopIterationNoBuffer
            } else {
                FilterDataStatus::Continue
            };
        }

        FilterDataStatus::StopIterationNoBuffer
    }

    pub fn decode_trailers(
        &mut self,
        callbacks: &mut dyn FilterCallbacks,
        headers: &mut HeaderMap,
    ) -> FilterTrailersStatus {
        if self.request_active() {
            self.transform_request(callbacks, headers);
            self.request_headers = Some(headers.clone());
        }
        if self.is_error() {
            FilterTrailersStatus::StopIteration
        } else {
            FilterTrailersStatus::Continue
        }
    }

    pub fn encode_headers(
        &mut self,
        callbacks: &mut dyn FilterCallbacks,
        headers: &mut HeaderMap,
        end_stream: bool,
    ) -> FilterHeadersStatus {
        self.check_response_active(callbacks);

        if !self.response_active() {
            return FilterHeadersStatus::Continue;
        }

        if end_stream {
            self.transform_response(callbacks, headers);
            return FilterHeadersStatus::Continue;
        }

        FilterHeadersStatus::StopIteration
    }

    pub fn encode_data(
        &mut self,
        callbacks: &mut dyn FilterCallbacks,
        headers: &mut HeaderMap,
        data: &mut BodyBuffer,
        end_stream: bool,
    ) -> FilterDataStatus {
        if !self.response_active() {
            return FilterDataStatus::Continue;
        }

        self.response_body.move_from(data);
        if self.encoder_buffer_limit != 0
            && self.response_body.length() > self.encoder_buffer_limit
        {
            self.set_error(FilterError::PayloadTooLarge);
            self.send_response_error(callbacks, headers);
            return FilterDataStatus::Continue;
        }

        if end_stream {
            self.transform_response(callbacks, headers);
            return FilterDataStatus::Continue;
        }

        FilterDataStatus::StopIterationNoBuffer
    }

    pub fn encode_trailers(
        &mut self,
        callbacks: &mut dyn FilterCallbacks,
        headers: &mut HeaderMap,
    ) -> FilterTrailersStatus {
        if self.response_active() {
            self.transform_response(callbacks, headers);
        }
        FilterTrailersStatus::Continue
    }

    /// Called when the stream is torn down. Suppresses any later local
    /// reply.
    pub fn on_destroy(&mut self) {
        self.reset_internal_state();
        self.destroyed = true;
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    fn request_active(&self) -> bool {
        self.request_transformation.is_some()
    }

    fn response_active(&self) -> bool {
        self.response_transformation.is_some()
    }

    fn check_request_active(&mut self, callbacks: &mut dyn FilterCallbacks) {
        self.request_transformation =
            self.transformation_from_route(callbacks, REQUEST_TRANSFORMATION_KEY);

        if self.functional && self.request_transformation.is_none() {
            self.set_error(FilterError::TransformationNotFound);
            self.send_request_error(callbacks);
        }
    }

    fn check_response_active(&mut self, callbacks: &mut dyn FilterCallbacks) {
        self.response_transformation =
            self.transformation_from_route(callbacks, RESPONSE_TRANSFORMATION_KEY);
    }

    /// Resolve a transformation id from route metadata. In direct mode the
    /// value is the id itself; in functional mode it is a struct keyed by
    /// cluster name, then function name.
    fn transformation_from_route(
        &self,
        callbacks: &dyn FilterCallbacks,
        key: &str,
    ) -> Option<Arc<Transformation>> {
        let route = callbacks.route()?;
        let value = route.metadata.value(crate::METADATA_NAMESPACE, key)?;

        let name = if !self.functional {
            match value.as_str() {
                Some(name) if !name.is_empty() => name,
                _ => return None,
            }
        } else {
            let function = self.current_function.as_deref()?;
            let clusters = value.as_struct()?;
            let functions = clusters.get(&route.cluster_name)?.as_struct()?;
            functions.get(function)?.as_str()?
        };

        let transformation = self.config.transformation(name);
        if transformation.is_some() {
            debug!(transformation = name, key, "selected transformation");
        }
        transformation
    }

    fn transform_request(&mut self, callbacks: &mut dyn FilterCallbacks, headers: &mut HeaderMap) {
        let Some(transformation) = self.request_transformation.take() else {
            return;
        };

        let snapshot = self.request_headers.clone();
        let result = transformation.transform(
            headers,
            snapshot.as_ref(),
            &mut self.request_body,
            callbacks,
            self.config.rng(),
        );

        match result {
            Ok(()) => {
                if self.request_body.length() > 0 {
                    callbacks.inject_data(std::mem::take(&mut self.request_body));
                } else {
                    headers.remove_content_type();
                }
            }
            Err(error) => {
                self.set_error(error.into());
                self.send_request_error(callbacks);
            }
        }
    }

    fn transform_response(&mut self, callbacks: &mut dyn FilterCallbacks, headers: &mut HeaderMap) {
        let Some(transformation) = self.response_transformation.take() else {
            return;
        };

        let result = transformation.transform(
            headers,
            self.request_headers.as_ref(),
            &mut self.response_body,
            callbacks,
            self.config.rng(),
        );

        match result {
            Ok(()) => {
                if self.response_body.length() > 0 {
                    callbacks.inject_data(std::mem::take(&mut self.response_body));
                } else {
                    headers.remove_content_type();
                }
            }
            Err(error) => {
                self.set_error(error.into());
                self.send_response_error(callbacks, headers);
            }
        }
    }

    /// Record an error, drain the accumulators, and deactivate both
    /// directions so no further body bytes are buffered.
    fn set_error(&mut self, error: FilterError) {
        warn!(error = %error, status = error.status(), "transformation failed");
        self.reset_internal_state();
        self.request_transformation = None;
        self.response_transformation = None;
        self.error = Some(error);
    }

    /// Request-side errors synthesize a local reply, unless the stream is
    /// already gone.
    fn send_request_error(&mut self, callbacks: &mut dyn FilterCallbacks) {
        if self.destroyed {
            return;
        }
        if let Some(error) = &self.error {
            callbacks.send_local_reply(error.status(), &error.to_string());
        }
    }

    /// Response-side errors rewrite the response in place: the upstream has
    /// already begun responding, so no local reply can be sent.
    fn send_response_error(&mut self, callbacks: &mut dyn FilterCallbacks, headers: &mut HeaderMap) {
        let Some(error) = &self.error else {
            return;
        };
        let body = error.to_string();
        headers.set_status(error.status());
        headers.remove_content_type();
        headers.set_content_length(body.len());
        callbacks.inject_data(BodyBuffer::from(body));
    }

    fn reset_internal_state(&mut self) {
        self.request_body.drain(self.request_body.length());
        self.response_body.drain(self.response_body.length());
    }
}
