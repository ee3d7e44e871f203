// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Tonic-backed pool members.
//!
//! [`GrpcChannelBuilder`] dials lazily-connecting tonic channels, so pool
//! growth never blocks inside the pool lock. Tonic channels expose neither
//! connectivity feedback nor a shutdown handshake, so the wrapper keeps its
//! own lifecycle bookkeeping: it reports idle until it is shut down, and a
//! shutdown channel counts as terminated once its termination token fires.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use duration_str::deserialize_duration;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint, Uri};

use crate::channel::{ChannelBuilder, ConnectivityState, ManagedChannel};
use crate::errors::PoolError;

/// Keepalive configuration for pooled channels.
/// This struct contains the keepalive time for TCP and HTTP2,
/// the timeout duration for the keepalive, and whether to permit
/// keepalive without an active stream.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, JsonSchema)]
pub struct KeepaliveConfig {
    /// The duration of the keepalive time for TCP
    #[serde(
        default = "default_tcp_keepalive",
        deserialize_with = "deserialize_duration"
    )]
    #[schemars(with = "String")]
    pub tcp_keepalive: Duration,

    /// The duration of the keepalive time for HTTP2
    #[serde(
        default = "default_http2_keepalive",
        deserialize_with = "deserialize_duration"
    )]
    #[schemars(with = "String")]
    pub http2_keepalive: Duration,

    /// The timeout duration for the keepalive
    #[serde(default = "default_timeout", deserialize_with = "deserialize_duration")]
    #[schemars(with = "String")]
    pub timeout: Duration,

    /// Whether to permit keepalive without an active stream
    #[serde(default = "default_keep_alive_while_idle")]
    pub keep_alive_while_idle: bool,
}

/// Defaults for KeepaliveConfig
impl Default for KeepaliveConfig {
    fn default() -> Self {
        KeepaliveConfig {
            tcp_keepalive: default_tcp_keepalive(),
            http2_keepalive: default_http2_keepalive(),
            timeout: default_timeout(),
            keep_alive_while_idle: default_keep_alive_while_idle(),
        }
    }
}

fn default_tcp_keepalive() -> Duration {
    Duration::from_secs(60)
}

fn default_http2_keepalive() -> Duration {
    Duration::from_secs(60)
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_keep_alive_while_idle() -> bool {
    false
}

/// Client-side settings for the channels the pool dials.
/// This struct contains the endpoint, origin, keepalive settings,
/// timeout settings, and buffer size settings.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct GrpcChannelConfig {
    /// The target the pool members connect to.
    pub endpoint: String,

    /// Origin for the channels.
    pub origin: Option<String>,

    /// Keepalive parameters.
    pub keepalive: Option<KeepaliveConfig>,

    /// Timeout for the connection.
    #[serde(
        default = "default_connect_timeout",
        deserialize_with = "deserialize_duration"
    )]
    #[schemars(with = "String")]
    pub connect_timeout: Duration,

    /// Timeout per request.
    #[serde(
        default = "default_request_timeout",
        deserialize_with = "deserialize_duration"
    )]
    #[schemars(with = "String")]
    pub request_timeout: Duration,

    /// ReadBufferSize.
    pub buffer_size: Option<usize>,
}

/// Defaults for GrpcChannelConfig
impl Default for GrpcChannelConfig {
    fn default() -> Self {
        GrpcChannelConfig {
            endpoint: String::new(),
            origin: None,
            keepalive: None,
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
            buffer_size: None,
        }
    }
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(0)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(0)
}

impl GrpcChannelConfig {
    /// Creates a new channel configuration with the given endpoint.
    pub fn with_endpoint(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            ..Self::default()
        }
    }

    pub fn with_origin(self, origin: &str) -> Self {
        Self {
            origin: Some(origin.to_string()),
            ..self
        }
    }

    pub fn with_keepalive(self, keepalive: KeepaliveConfig) -> Self {
        Self {
            keepalive: Some(keepalive),
            ..self
        }
    }

    pub fn with_connect_timeout(self, connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            ..self
        }
    }

    pub fn with_request_timeout(self, request_timeout: Duration) -> Self {
        Self {
            request_timeout,
            ..self
        }
    }

    pub fn with_buffer_size(self, buffer_size: usize) -> Self {
        Self {
            buffer_size: Some(buffer_size),
            ..self
        }
    }

    /// Converts the configuration into a tonic endpoint.
    /// The function will set the keepalive settings, timeout settings,
    /// buffer size settings, and origin settings.
    fn to_endpoint(&self) -> Result<Endpoint, PoolError> {
        if self.endpoint.is_empty() {
            return Err(PoolError::MissingEndpoint);
        }
        let uri = Uri::from_str(&self.endpoint)?;
        let mut builder = Channel::builder(uri);

        // set the buffer size
        if let Some(size) = self.buffer_size {
            builder = builder.buffer_size(size);
        }

        // set keepalive settings
        if let Some(keepalive) = &self.keepalive {
            builder = builder
                .tcp_keepalive(Some(keepalive.tcp_keepalive))
                .keep_alive_timeout(keepalive.timeout)
                .keep_alive_while_idle(keepalive.keep_alive_while_idle)
                // HTTP level keepalive
                .http2_keep_alive_interval(keepalive.http2_keepalive);
        }

        // set origin settings
        if let Some(origin) = &self.origin {
            let origin_uri = Uri::from_str(origin.as_str())?;
            builder = builder.origin(origin_uri);
        }

        // set the connection timeout
        if self.connect_timeout.as_secs() > 0 {
            builder = builder.connect_timeout(self.connect_timeout);
        }

        // set the request timeout
        if self.request_timeout.as_secs() > 0 {
            builder = builder.timeout(self.request_timeout);
        }

        Ok(builder)
    }
}

/// Dials tonic channels for the pool.
pub struct GrpcChannelBuilder {
    config: GrpcChannelConfig,
}

impl GrpcChannelBuilder {
    pub fn new(config: GrpcChannelConfig) -> Self {
        GrpcChannelBuilder { config }
    }
}

impl ChannelBuilder for GrpcChannelBuilder {
    type Channel = GrpcChannel;

    fn connect(&self) -> Result<GrpcChannel, PoolError> {
        let endpoint = self.config.to_endpoint()?;
        let authority = Uri::from_str(&self.config.endpoint)?
            .authority()
            .map(|authority| authority.to_string())
            .unwrap_or_default();
        Ok(GrpcChannel {
            channel: endpoint.connect_lazy(),
            authority,
            shutdown: AtomicBool::new(false),
            terminated: CancellationToken::new(),
        })
    }
}

/// A pool member backed by a tonic [`Channel`].
pub struct GrpcChannel {
    channel: Channel,
    authority: String,
    shutdown: AtomicBool,
    terminated: CancellationToken,
}

impl GrpcChannel {
    /// The underlying tonic channel, for constructing generated clients.
    pub fn transport(&self) -> Channel {
        self.channel.clone()
    }
}

#[async_trait]
impl ManagedChannel for GrpcChannel {
    fn authority(&self) -> String {
        self.authority.clone()
    }

    fn state(&self, _request_connection: bool) -> ConnectivityState {
        if self.shutdown.load(Ordering::Acquire) {
            ConnectivityState::Shutdown
        } else {
            ConnectivityState::Idle
        }
    }

    fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.terminated.cancel();
    }

    fn shutdown_now(&self) {
        self.shutdown();
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn is_terminated(&self) -> bool {
        self.terminated.is_cancelled()
    }

    async fn wait_terminated(&self) {
        self.terminated.cancelled().await
    }
}
