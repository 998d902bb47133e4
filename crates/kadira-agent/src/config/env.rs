// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use figment::{providers::Env, Figment};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::{
    config::{Config, ConfigSource},
    errors::ConfigError,
    merge_option, merge_option_to_value,
    send::ProcessRole,
};

/// `KADIRA_OPTIONS_*` variables, plus the application credentials.
#[derive(Debug, PartialEq, Deserialize, Clone, Default)]
#[serde(default)]
#[allow(clippy::module_name_repetitions)]
pub struct EnvConfig {
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub kadira_app_id: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub kadira_app_secret: Option<String>,

    #[serde(deserialize_with = "deserialize_optional_string")]
    pub endpoint: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub relay_url: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_duration_from_millis")]
    pub request_timeout: Option<Duration>,

    #[serde(deserialize_with = "deserialize_optional_duration_from_millis")]
    pub client_engine_sync_delay: Option<Duration>,
    #[serde(deserialize_with = "deserialize_optional_duration_from_millis")]
    pub error_dump_interval: Option<Duration>,
    #[serde(deserialize_with = "deserialize_optional_usize")]
    pub max_errors_per_interval: Option<usize>,
    #[serde(deserialize_with = "deserialize_optional_bool")]
    pub collect_all_stacks: Option<bool>,
    #[serde(deserialize_with = "deserialize_optional_bool")]
    pub enable_error_tracking: Option<bool>,

    #[serde(deserialize_with = "deserialize_optional_string")]
    pub datadog_agent_host: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_port")]
    pub datadog_agent_port: Option<u16>,
    #[serde(deserialize_with = "deserialize_optional_f64")]
    pub timing_sample_rate: Option<f64>,

    #[serde(deserialize_with = "deserialize_optional_string")]
    pub loggly_token: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub loggly_subdomain: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub loggly_tags: Option<String>,

    #[serde(deserialize_with = "deserialize_optional_duration_from_millis")]
    pub payload_timeout: Option<Duration>,
    #[serde(deserialize_with = "deserialize_optional_usize")]
    pub document_size_cache_size: Option<usize>,
}

#[allow(clippy::module_name_repetitions)]
pub struct EnvConfigSource;

impl ConfigSource for EnvConfigSource {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError> {
        let figment = Figment::new()
            .merge(Env::prefixed("KADIRA_OPTIONS_"))
            .merge(Env::raw().only(&["KADIRA_APP_ID", "KADIRA_APP_SECRET"]));

        let env_config: EnvConfig = figment.extract()?;

        merge_option!(config, app_id, env_config, kadira_app_id);
        merge_option!(config, app_secret, env_config, kadira_app_secret);
        merge_option!(config, env_config, endpoint);
        merge_option!(config, env_config, relay_url);
        merge_option_to_value!(config, env_config, request_timeout);

        merge_option_to_value!(config, env_config, client_engine_sync_delay);
        merge_option_to_value!(config, env_config, error_dump_interval);
        merge_option_to_value!(config, env_config, max_errors_per_interval);
        merge_option_to_value!(config, env_config, collect_all_stacks);
        merge_option_to_value!(config, env_config, enable_error_tracking);

        merge_option!(config, env_config, datadog_agent_host);
        merge_option_to_value!(config, env_config, datadog_agent_port);
        merge_option_to_value!(config, env_config, timing_sample_rate);

        merge_option!(config, env_config, loggly_token);
        merge_option!(config, env_config, loggly_subdomain);
        merge_option!(config, env_config, loggly_tags);

        merge_option_to_value!(config, env_config, payload_timeout);
        merge_option_to_value!(config, env_config, document_size_cache_size);

        if env_config.relay_url.is_some() {
            config.process_role = ProcessRole::Proxied;
        }

        Ok(())
    }
}

/// Reads the raw value, treating missing, null and empty strings as unset.
fn raw_value<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.trim().is_empty() => None,
        Some(value) => Some(value),
    })
}

pub fn deserialize_optional_string<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    match raw_value(deserializer)? {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(other) => Err(D::Error::custom(format!("\"{other}\" is not a string"))),
    }
}

pub fn deserialize_optional_u64<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<u64>, D::Error> {
    match raw_value(deserializer)? {
        None => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("\"{n}\" is not a number"))),
        Some(Value::String(s)) => s
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| D::Error::custom(format!("\"{s}\" is not a number"))),
        Some(other) => Err(D::Error::custom(format!("\"{other}\" is not a number"))),
    }
}

pub fn deserialize_optional_usize<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<usize>, D::Error> {
    deserialize_optional_u64(deserializer)?
        .map(|n| usize::try_from(n).map_err(|_| D::Error::custom(format!("\"{n}\" is too large"))))
        .transpose()
}

pub fn deserialize_optional_port<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<u16>, D::Error> {
    deserialize_optional_u64(deserializer)?
        .map(|n| u16::try_from(n).map_err(|_| D::Error::custom(format!("\"{n}\" is not a port"))))
        .transpose()
}

pub fn deserialize_optional_duration_from_millis<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error> {
    Ok(deserialize_optional_u64(deserializer)?.map(Duration::from_millis))
}

pub fn deserialize_optional_f64<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<f64>, D::Error> {
    match raw_value(deserializer)? {
        None => Ok(None),
        Some(Value::Number(n)) => n
            .as_f64()
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("\"{n}\" is not a number"))),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| D::Error::custom(format!("\"{s}\" is not a number"))),
        Some(other) => Err(D::Error::custom(format!("\"{other}\" is not a number"))),
    }
}

pub fn deserialize_optional_bool<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<bool>, D::Error> {
    match raw_value(deserializer)? {
        None => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(b)),
        Some(Value::String(s)) => match s.trim().to_lowercase().as_str() {
            "true" => Ok(Some(true)),
            "false" => Ok(Some(false)),
            _ => Err(D::Error::custom(format!("{s} is not a boolean"))),
        },
        Some(other) => Err(D::Error::custom(format!("{other} is not a boolean"))),
    }
}
