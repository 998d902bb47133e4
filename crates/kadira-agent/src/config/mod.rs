// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Agent configuration.
//!
//! Values are layered: hard-coded defaults first, then every registered [`ConfigSource`]
//! in order. Unlike most settings loaders, a malformed value is fatal: [`ConfigBuilder::build`]
//! returns the first [`ConfigError`] so the host fails at startup instead of running with a
//! silently different configuration.

pub mod env;

use crate::constants::DEFAULT_MAX_ERRORS;
use crate::errors::ConfigError;
use crate::send::ProcessRole;
use std::time::Duration;

/// Merges `Option<T>` source fields into `T` config fields when the source has a value.
#[macro_export]
macro_rules! merge_option_to_value {
    ($config:expr, $config_field:ident, $source:expr, $source_field:ident) => {
        if let Some(value) = &$source.$source_field {
            $config.$config_field = value.clone();
        }
    };
    ($config:expr, $source:expr, $field:ident) => {
        if let Some(value) = &$source.$field {
            $config.$field = value.clone();
        }
    };
}

/// Merges `Option<T>` source fields into `Option<T>` config fields when the source has a value.
#[macro_export]
macro_rules! merge_option {
    ($config:expr, $config_field:ident, $source:expr, $source_field:ident) => {
        if $source.$source_field.is_some() {
            $config.$config_field.clone_from(&$source.$source_field);
        }
    };
    ($config:expr, $source:expr, $field:ident) => {
        if $source.$field.is_some() {
            $config.$field.clone_from(&$source.$field);
        }
    };
}

#[allow(clippy::module_name_repetitions)]
pub trait ConfigSource {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError>;
}

#[derive(Default)]
#[allow(clippy::module_name_repetitions)]
pub struct ConfigBuilder {
    sources: Vec<Box<dyn ConfigSource>>,
    config: Config,
}

#[allow(clippy::module_name_repetitions)]
impl ConfigBuilder {
    #[must_use]
    pub fn add_source(mut self, source: Box<dyn ConfigSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn build(mut self) -> Result<Config, ConfigError> {
        for source in &self.sources {
            source.load(&mut self.config)?;
        }

        if let Some(endpoint) = &self.config.endpoint {
            self.config.endpoint = normalize_url(endpoint);
        }
        if self.config.process_role == ProcessRole::Proxied && self.config.relay_url.is_none() {
            return Err(ConfigError::Parse(
                "a proxied process requires a relay url".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.config.timing_sample_rate) {
            return Err(ConfigError::Parse(format!(
                "\"{}\" is not a sample rate between 0 and 1",
                self.config.timing_sample_rate
            )));
        }

        Ok(self.config)
    }
}

/// Trims the url, adds `https://` when no scheme is given and drops trailing slashes.
/// An empty url means no endpoint.
fn normalize_url(url: &str) -> Option<String> {
    let url = url.trim().trim_end_matches('/');
    if url.is_empty() {
        None
    } else if url.starts_with("http://") || url.starts_with("https://") {
        Some(url.to_string())
    } else {
        Some(format!("https://{url}"))
    }
}

/// Loads the configuration from defaults and `KADIRA_*` environment variables.
pub fn get_config() -> Result<Config, ConfigError> {
    ConfigBuilder::default()
        .add_source(Box::new(env::EnvConfigSource))
        .build()
}

#[derive(Debug, PartialEq, Clone)]
#[allow(clippy::struct_excessive_bools)]
pub struct Config {
    // Destination. The agent is connected once endpoint and credentials are known.
    pub endpoint: Option<String>,
    pub app_id: Option<String>,
    pub app_secret: Option<String>,
    pub process_role: ProcessRole,
    /// Where a proxied process hands its payloads to the host.
    pub relay_url: Option<String>,
    pub request_timeout: Duration,

    /// Delay before a browser client first syncs with the engine.
    pub client_engine_sync_delay: Duration,
    /// How often tracked errors are flushed.
    pub error_dump_interval: Duration,
    pub max_errors_per_interval: usize,
    pub collect_all_stacks: bool,
    pub enable_error_tracking: bool,

    // DogStatsD agent
    pub datadog_agent_host: Option<String>,
    pub datadog_agent_port: u16,
    pub timing_sample_rate: f64,

    // Log shipping service
    pub loggly_token: Option<String>,
    pub loggly_subdomain: Option<String>,
    pub loggly_tags: Option<String>,

    /// How often method metrics are flushed.
    pub payload_timeout: Duration,
    pub document_size_cache_size: usize,
}

impl Config {
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.endpoint.is_some() && self.app_id.is_some() && self.app_secret.is_some()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: Some("https://engine.kadira.io".to_string()),
            app_id: None,
            app_secret: None,
            process_role: ProcessRole::InProcess,
            relay_url: None,
            request_timeout: Duration::from_secs(10),

            client_engine_sync_delay: Duration::from_millis(10_000),
            error_dump_interval: Duration::from_millis(60_000),
            max_errors_per_interval: DEFAULT_MAX_ERRORS,
            collect_all_stacks: false,
            enable_error_tracking: true,

            datadog_agent_host: None,
            datadog_agent_port: 8125,
            timing_sample_rate: 1.0,

            loggly_token: None,
            loggly_subdomain: None,
            loggly_tags: None,

            payload_timeout: Duration::from_millis(20_000),
            document_size_cache_size: 10_000,
        }
    }
}
