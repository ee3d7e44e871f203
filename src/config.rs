// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::path::Path;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::errors::PoolError;

pub(crate) const DEFAULT_MAX_SIZE: usize = 10;
pub(crate) const DEFAULT_STREAMS_LOW_WATERMARK: usize = 100;

/// Top-level pool configuration document.
///
/// The wire format is JSON with camelCase field names. Absent fields take
/// the documented defaults and unknown fields are ignored.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiConfig {
    /// Pool sizing parameters.
    pub channel_pool: ChannelPoolConfig,

    /// Per-method affinity declarations.
    pub method: Vec<MethodConfig>,
}

/// Pool sizing parameters.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelPoolConfig {
    /// Upper bound on the number of channels. Zero means "use the default".
    pub max_size: usize,

    /// Per-channel active-stream threshold above which the pool prefers
    /// growing over piling more calls onto one channel. Zero means "use
    /// the default".
    pub max_concurrent_streams_low_watermark: usize,
}

/// Affinity declaration for a set of methods.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct MethodConfig {
    /// Fully-qualified method names this entry applies to.
    pub name: Vec<String>,

    /// The affinity behavior of these methods. Entries without one are
    /// ignored.
    pub affinity: Option<AffinityConfig>,
}

/// How one method participates in affinity routing.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct AffinityConfig {
    /// Dotted path to the key field inside the request or response message.
    pub affinity_key: String,

    pub command: AffinityCommand,
}

/// Affinity command of a method.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AffinityCommand {
    /// Route by the request key; the binding is preserved.
    #[default]
    Bound,
    /// Create the binding from this call's response.
    Bind,
    /// Route by the request key and release the binding after the call.
    Unbind,
}

impl ApiConfig {
    /// Decodes a config document from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, PoolError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads and decodes a config document from a file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PoolError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }
}

/// Pool limits and the method affinity table, after defaults are applied.
#[derive(Debug, Clone)]
pub(crate) struct PoolOptions {
    pub(crate) max_size: usize,
    pub(crate) low_watermark: usize,
    pub(crate) method_affinity: HashMap<String, AffinityConfig>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions {
            max_size: DEFAULT_MAX_SIZE,
            low_watermark: DEFAULT_STREAMS_LOW_WATERMARK,
            method_affinity: HashMap::new(),
        }
    }
}

impl PoolOptions {
    /// Applies a decoded config document on top of the defaults.
    ///
    /// Zero-valued limits keep their defaults; method entries without an
    /// affinity stanza contribute nothing.
    pub(crate) fn from_config(config: &ApiConfig) -> Self {
        let mut options = PoolOptions::default();
        if config.channel_pool.max_size != 0 {
            options.max_size = config.channel_pool.max_size;
        }
        if config.channel_pool.max_concurrent_streams_low_watermark != 0 {
            options.low_watermark = config.channel_pool.max_concurrent_streams_low_watermark;
        }
        for method in &config.method {
            let Some(affinity) = &method.affinity else {
                continue;
            };
            for name in &method.name {
                options
                    .method_affinity
                    .insert(name.clone(), affinity.clone());
            }
        }
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = PoolOptions::default();
        assert_eq!(options.max_size, 10);
        assert_eq!(options.low_watermark, 100);
        assert!(options.method_affinity.is_empty());
    }

    #[test]
    fn test_decode() {
        let config = ApiConfig::from_json(
            r#"{
                "channelPool": {
                    "maxSize": 5,
                    "maxConcurrentStreamsLowWatermark": 1
                },
                "method": [
                    {
                        "name": ["/a.B/One", "/a.B/Two"],
                        "affinity": { "affinityKey": "name", "command": "BIND" }
                    },
                    {
                        "name": ["/a.B/Three"]
                    }
                ],
                "unknownField": true
            }"#,
        )
        .unwrap();

        assert_eq!(config.channel_pool.max_size, 5);
        assert_eq!(config.channel_pool.max_concurrent_streams_low_watermark, 1);
        assert_eq!(config.method.len(), 2);

        let options = PoolOptions::from_config(&config);
        assert_eq!(options.max_size, 5);
        assert_eq!(options.low_watermark, 1);
        // one row per listed name, the affinity-less entry is skipped
        assert_eq!(options.method_affinity.len(), 2);
        let affinity = &options.method_affinity["/a.B/One"];
        assert_eq!(affinity.affinity_key, "name");
        assert_eq!(affinity.command, AffinityCommand::Bind);
    }

    #[test]
    fn test_zero_limits_keep_defaults() {
        let config = ApiConfig::from_json(r#"{ "channelPool": { "maxSize": 0 } }"#).unwrap();
        let options = PoolOptions::from_config(&config);
        assert_eq!(options.max_size, 10);
        assert_eq!(options.low_watermark, 100);
    }

    #[test]
    fn test_malformed_document() {
        assert!(ApiConfig::from_json("{ not json").is_err());
        assert!(ApiConfig::from_file("/does/not/exist.json").is_err());
    }

    #[test]
    fn test_from_file() {
        let test_path: &str = env!("CARGO_MANIFEST_DIR");
        let config =
            ApiConfig::from_file(format!("{}/testdata/spanner_grpc_config.json", test_path))
                .unwrap();

        assert_eq!(config.channel_pool.max_size, 10);
        assert_eq!(config.channel_pool.max_concurrent_streams_low_watermark, 1);

        let options = PoolOptions::from_config(&config);
        assert_eq!(options.method_affinity.len(), 3);
        assert_eq!(
            options.method_affinity["/google.spanner.v1.Spanner/GetSession"].command,
            AffinityCommand::Bound
        );
        assert_eq!(
            options.method_affinity["/google.spanner.v1.Spanner/DeleteSession"].command,
            AffinityCommand::Unbind
        );
    }
}
