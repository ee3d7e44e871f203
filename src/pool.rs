// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::call::PoolCall;
use crate::channel::{ChannelBuilder, ChannelRef, ConnectivityState, ManagedChannel};
use crate::config::{ApiConfig, PoolOptions};
use crate::errors::PoolError;
use crate::registry::AffinityRegistry;

/// Bounded pool of transport channels that presents itself as a single
/// channel.
///
/// Calls are routed either to the channel bound to their affinity key or to
/// the least-loaded member. The pool grows lazily, one channel at a time,
/// whenever every member is at or above the configured stream watermark,
/// until it reaches its capacity cap. Bound keys are never rebalanced and
/// members are never evicted.
///
/// The handle is cheap to clone; all clones share the same pool.
pub struct ChannelPool<C: ManagedChannel> {
    pub(crate) inner: Arc<PoolInner<C>>,
}

impl<C: ManagedChannel> Clone for ChannelPool<C> {
    fn clone(&self) -> Self {
        ChannelPool {
            inner: Arc::clone(&self.inner),
        }
    }
}

pub(crate) struct PoolInner<C: ManagedChannel> {
    builder: Box<dyn ChannelBuilder<Channel = C>>,
    pub(crate) options: PoolOptions,

    // Pool lock: member list and growth. Never taken while the bind lock
    // (inside the registry) is held, or vice versa.
    channels: Mutex<Vec<Arc<ChannelRef<C>>>>,
    pub(crate) registry: AffinityRegistry<C>,
}

impl<C: ManagedChannel> ChannelPool<C> {
    /// Pool with default limits and no method affinity.
    pub fn new(builder: impl ChannelBuilder<Channel = C> + 'static) -> Result<Self, PoolError> {
        Self::with_options(Box::new(builder), PoolOptions::default())
    }

    /// Pool configured from a decoded config document.
    pub fn with_config(
        builder: impl ChannelBuilder<Channel = C> + 'static,
        config: &ApiConfig,
    ) -> Result<Self, PoolError> {
        Self::with_options(Box::new(builder), PoolOptions::from_config(config))
    }

    /// Pool configured from a JSON config file.
    ///
    /// A missing or malformed file is not fatal: the pool falls back to the
    /// defaults and an empty method table.
    pub fn with_config_file(
        builder: impl ChannelBuilder<Channel = C> + 'static,
        path: impl AsRef<Path>,
    ) -> Result<Self, PoolError> {
        let options = match ApiConfig::from_file(&path) {
            Ok(config) => PoolOptions::from_config(&config),
            Err(error) => {
                warn!(%error, path = %path.as_ref().display(), "cannot load pool config, using defaults");
                PoolOptions::default()
            }
        };
        Self::with_options(Box::new(builder), options)
    }

    fn with_options(
        builder: Box<dyn ChannelBuilder<Channel = C>>,
        options: PoolOptions,
    ) -> Result<Self, PoolError> {
        let inner = Arc::new(PoolInner {
            builder,
            options,
            channels: Mutex::new(Vec::new()),
            registry: AffinityRegistry::default(),
        });
        // the first member is created eagerly so authority() and state()
        // always have a channel to consult
        inner.pick(None)?;
        Ok(ChannelPool { inner })
    }

    /// Creates a call for `method`.
    ///
    /// The returned guard participates in the affinity behavior configured
    /// for the method; methods without configuration are routed to the
    /// least-loaded channel.
    pub fn new_call(&self, method: &str) -> PoolCall<C> {
        let affinity = self.inner.options.method_affinity.get(method).cloned();
        PoolCall::new(Arc::clone(&self.inner), affinity)
    }

    /// Starts a graceful shutdown of every member. Idempotent.
    pub fn shutdown(&self) {
        for channel_ref in self.inner.channels.lock().iter() {
            channel_ref.channel().shutdown();
        }
    }

    /// Forcefully shuts down every member that has not yet terminated.
    /// Idempotent.
    pub fn shutdown_now(&self) {
        for channel_ref in self.inner.channels.lock().iter() {
            if !channel_ref.channel().is_terminated() {
                channel_ref.channel().shutdown_now();
            }
        }
    }

    /// True iff every member reports shutdown.
    pub fn is_shutdown(&self) -> bool {
        self.inner
            .channels
            .lock()
            .iter()
            .all(|channel_ref| channel_ref.channel().is_shutdown())
    }

    /// True iff every member reports terminated.
    pub fn is_terminated(&self) -> bool {
        self.inner
            .channels
            .lock()
            .iter()
            .all(|channel_ref| channel_ref.channel().is_terminated())
    }

    /// Waits up to `timeout` for every member to terminate, walking them in
    /// turn with the remaining budget. Returns [`Self::is_terminated`].
    pub async fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let members: Vec<_> = self.inner.channels.lock().iter().cloned().collect();
        for channel_ref in members {
            if channel_ref.channel().is_terminated() {
                continue;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            let _ = tokio::time::timeout(remaining, channel_ref.channel().wait_terminated()).await;
        }
        self.is_terminated()
    }

    /// Aggregate connectivity state of the pool.
    ///
    /// A single ready member means the pool can serve, so the tally reports
    /// the first non-empty bucket in the order ready, connecting, transient
    /// failure, idle, shutdown. An empty pool has no state.
    pub fn state(&self, request_connection: bool) -> Option<ConnectivityState> {
        let channels = self.inner.channels.lock();
        if channels.is_empty() {
            return None;
        }

        let mut ready = 0;
        let mut connecting = 0;
        let mut transient_failure = 0;
        let mut idle = 0;
        for channel_ref in channels.iter() {
            match channel_ref.channel().state(request_connection) {
                ConnectivityState::Ready => ready += 1,
                ConnectivityState::Connecting => connecting += 1,
                ConnectivityState::TransientFailure => transient_failure += 1,
                ConnectivityState::Idle => idle += 1,
                ConnectivityState::Shutdown => {}
            }
        }

        if ready > 0 {
            Some(ConnectivityState::Ready)
        } else if connecting > 0 {
            Some(ConnectivityState::Connecting)
        } else if transient_failure > 0 {
            Some(ConnectivityState::TransientFailure)
        } else if idle > 0 {
            Some(ConnectivityState::Idle)
        } else {
            Some(ConnectivityState::Shutdown)
        }
    }

    /// Authority of the pool, delegated to its first member.
    pub fn authority(&self) -> String {
        self.inner
            .channels
            .lock()
            .first()
            .map(|channel_ref| channel_ref.channel().authority())
            .unwrap_or_default()
    }

    /// Current number of channels in the pool.
    pub fn number_of_channels(&self) -> usize {
        self.inner.channels.lock().len()
    }

    /// Capacity cap of the pool.
    pub fn max_size(&self) -> usize {
        self.inner.options.max_size
    }

    /// Per-channel active-stream threshold that triggers growth.
    pub fn streams_low_watermark(&self) -> usize {
        self.inner.options.low_watermark
    }
}

impl<C: ManagedChannel> PoolInner<C> {
    /// Selects the channel for one call, creating a new one if necessary.
    ///
    /// A non-empty `key` routes to the channel it is bound to. Unknown keys
    /// and unkeyed calls go to the least-loaded member while it is under
    /// the stream watermark; otherwise the pool grows, and once saturated
    /// the least-loaded member absorbs the overload.
    pub(crate) fn pick(&self, key: Option<&str>) -> Result<Arc<ChannelRef<C>>, PoolError> {
        if let Some(key) = key.filter(|key| !key.is_empty()) {
            if let Some(bound) = self.registry.lookup(key) {
                return Ok(bound);
            }
            // unknown key: fall through to the unkeyed policy
        }

        let mut channels = self.channels.lock();
        // least loaded first; ties resolve to the lowest id so selection is
        // deterministic
        channels.sort_by_key(|channel_ref| (channel_ref.active_streams(), channel_ref.id()));

        if let Some(first) = channels.first() {
            if first.active_streams() < self.options.low_watermark {
                return Ok(Arc::clone(first));
            }
        }
        if channels.len() < self.options.max_size {
            let channel = self.builder.connect()?;
            let channel_ref = Arc::new(ChannelRef::new(channel, channels.len()));
            debug!(channel_id = channel_ref.id(), "adding a new channel to the pool");
            channels.push(Arc::clone(&channel_ref));
            return Ok(channel_ref);
        }
        // saturated: pile onto the least-loaded member
        Ok(Arc::clone(&channels[0]))
    }

    #[cfg(test)]
    pub(crate) fn push_preset(&self, streams: usize) -> Arc<ChannelRef<C>> {
        let channel = self.builder.connect().expect("test builder cannot fail");
        let mut channels = self.channels.lock();
        let channel_ref = Arc::new(ChannelRef::new(channel, channels.len()));
        for _ in 0..streams {
            channel_ref.incr_streams();
        }
        channels.push(Arc::clone(&channel_ref));
        channel_ref
    }
}
