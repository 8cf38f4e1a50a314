//! Request/response transformation filter for layer-7 proxies.
//!
//! The filter sits in the proxy's HTTP filter chain and rewrites headers,
//! body, and per-request dynamic metadata according to declarative templates
//! attached to each route:
//!
//! - Header set/append/remove driven by compiled text templates
//! - Regex extractions from named headers or the buffered body
//! - JSON body parsing exposed to templates as a lookup context
//! - Body replacement from a template or from merged extractions
//! - Dynamic metadata writes for downstream filters and access logs
//!
//! Templates are compiled once at configuration load, so malformed templates
//! are rejected before any traffic flows. At runtime the filter buffers each
//! direction's body up to a configured cap, evaluates the templates against
//! the live message, and mutates it in place.
//!
//! ## Configuration Example
//!
//! ```yaml
//! transformations:
//!   extract-user:
//!     headers:
//!       x-user:
//!         text: '{{ context().user.name }}'
//! ```
//!
//! Routes select a transformation by id through their metadata, under the
//! [`METADATA_NAMESPACE`] namespace and the `request_transformation` /
//! `response_transformation` keys.

pub mod config;
pub mod extract;
pub mod filter;
pub mod host;
pub mod template;
pub mod transform;

/// Canonical metadata namespace of the filter. Route metadata, cluster
/// metadata, and default dynamic metadata writes all live under this key.
pub const METADATA_NAMESPACE: &str = "proxy.filters.http.transformation";

pub use config::{TransformationTemplate, TransformationsConfig};
pub use filter::{FilterConfig, FilterError, TransformationFilter};
pub use transform::{ConfigError, Transformation};
