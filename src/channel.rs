// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::errors::PoolError;

/// Connectivity state of a transport channel, as reported by the channel
/// itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

/// Lifecycle interface of one underlying transport channel.
///
/// The pool never drives the transport directly; it only forwards shutdown
/// requests and aggregates the states its members report here. A channel is
/// shared by every caller routed to it, so all methods take `&self`.
#[async_trait]
pub trait ManagedChannel: Send + Sync + 'static {
    /// Authority (host) this channel is connected to.
    fn authority(&self) -> String;

    /// Current connectivity state. `request_connection` asks an idle
    /// channel to start connecting.
    fn state(&self, request_connection: bool) -> ConnectivityState;

    /// Starts a graceful shutdown. In-flight calls are allowed to finish.
    fn shutdown(&self);

    /// Starts a forceful shutdown, cancelling in-flight calls.
    fn shutdown_now(&self);

    fn is_shutdown(&self) -> bool;

    fn is_terminated(&self) -> bool;

    /// Resolves once the channel reports terminated.
    async fn wait_terminated(&self);
}

/// Factory for new pool members.
///
/// `connect` must not block: members are created while the pool lock is
/// held, so the transport has to establish the connection lazily.
pub trait ChannelBuilder: Send + Sync {
    type Channel: ManagedChannel;

    fn connect(&self) -> Result<Self::Channel, PoolError>;
}

/// One pool member: a transport channel plus the counters the selection
/// policy reads.
///
/// `active_streams` counts in-flight calls routed to this channel and
/// `affinity_count` counts the distinct affinity keys currently mapped to
/// it. The counters are atomics so the ref itself carries no lock; callers
/// serialize compound updates through the pool and registry locks.
pub struct ChannelRef<C> {
    channel: C,
    id: usize,
    active_streams: AtomicUsize,
    affinity_count: AtomicUsize,
}

impl<C> ChannelRef<C> {
    pub(crate) fn new(channel: C, id: usize) -> Self {
        ChannelRef {
            channel,
            id,
            active_streams: AtomicUsize::new(0),
            affinity_count: AtomicUsize::new(0),
        }
    }

    /// The underlying transport channel.
    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Stable identifier assigned when the member joined the pool.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Number of in-flight calls routed to this channel.
    pub fn active_streams(&self) -> usize {
        self.active_streams.load(Ordering::Acquire)
    }

    /// Number of affinity keys currently bound to this channel.
    pub fn affinity_count(&self) -> usize {
        self.affinity_count.load(Ordering::Acquire)
    }

    pub(crate) fn incr_streams(&self) {
        self.active_streams.fetch_add(1, Ordering::AcqRel);
    }

    // Saturating: decrementing past zero is a no-op.
    pub(crate) fn decr_streams(&self) {
        let _ = self
            .active_streams
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
    }

    pub(crate) fn incr_affinity(&self) {
        self.affinity_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn decr_affinity(&self) {
        let _ = self
            .affinity_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
    }
}

impl<C> std::fmt::Debug for ChannelRef<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRef")
            .field("id", &self.id)
            .field("active_streams", &self.active_streams())
            .field("affinity_count", &self.affinity_count())
            .finish()
    }
}
