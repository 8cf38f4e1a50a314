//! Transformation filter configuration tool.
//!
//! Checks a transformation registry offline: the schema by default, and with
//! `--validate` the full template and extraction compilation, so malformed
//! configurations are caught before being pushed to a proxy.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use transform_filter::{FilterConfig, TransformationsConfig};

#[derive(Parser, Debug)]
#[command(name = "transform-filter")]
#[command(
    author,
    version,
    about = "Validate transformation filter configuration"
)]
struct Args {
    /// Configuration file path (YAML or JSON)
    #[arg(short, long, env = "TRANSFORM_FILTER_CONFIG")]
    config: Option<PathBuf>,

    /// Output logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print example configuration and exit.
    #[arg(long)]
    example_config: bool,

    /// Compile every transformation, exiting non-zero on the first template
    /// or extraction error. Without this, the configuration is only checked
    /// against the schema.
    #[arg(long)]
    validate: bool,
}

fn print_example_config() {
    let example = r#"# Transformation filter configuration example
transformations:
  # Copy a JSON body field into a header
  extract-user:
    parse_body_behavior: parse_as_json
    headers:
      x-user:
        text: '{{ context().user.name }}'

  # Pull a bearer token out of the authorization header and merge it
  # into the request body
  bearer-token:
    extractors:
      auth.token:
        header: authorization
        regex: "Bearer (.*)"
        subgroup: 1
    merge_extractors_to_body: {}

  # Rewrite the body from a template, tagging the request on the way
  rewrite:
    parse_body_behavior: dont_parse
    headers_to_append:
      - key: x-request-tag
        value:
          text: '{{ replace_with_random("tag-ID", "ID") }}'
    body:
      text: '{ "raw": "{{ base64_encode(body()) }}" }'
"#;
    println!("{}", example);
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    if args.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }

    if args.example_config {
        print_example_config();
        return Ok(());
    }

    let config_path = args
        .config
        .context("no configuration file given (see --help)")?;
    let content = std::fs::read_to_string(&config_path)
        .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

    let config: TransformationsConfig = if config_path
        .extension()
        .is_some_and(|e| e == "yaml" || e == "yml")
    {
        serde_yaml::from_str(&content)?
    } else {
        serde_json::from_str(&content)?
    };

    if args.validate {
        FilterConfig::new(&config).context("Configuration is invalid")?;
        info!(
            config = %config_path.display(),
            transformations = config.transformations.len(),
            "Configuration is valid"
        );
        return Ok(());
    }

    info!(
        config = %config_path.display(),
        transformations = config.transformations.len(),
        "Configuration parsed; rerun with --validate to compile the templates"
    );

    Ok(())
}
