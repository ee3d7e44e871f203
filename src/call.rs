// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use tracing::trace;

use crate::channel::{ChannelRef, ManagedChannel};
use crate::config::{AffinityCommand, AffinityConfig};
use crate::errors::PoolError;
use crate::key::{KeyedMessage, affinity_key};
use crate::pool::PoolInner;

/// One outbound call checked out of the pool.
///
/// The guard tracks the chosen channel's active-stream count for the
/// lifetime of the call and drives the affinity binding configured for the
/// method:
///
/// - `BOUND` and `UNBIND` methods are routed by the key extracted from the
///   request at [`start`](Self::start);
/// - `BIND` methods are routed like unkeyed calls and establish their
///   binding from the response, via [`recv_response`](Self::recv_response);
/// - `UNBIND` methods release the request key when the call ends.
///
/// Dropping the guard is the call's terminal event. It fires on success,
/// failure and cancellation alike, so counters and pending unbinds are
/// settled no matter how the call ends. The guard never retries anything.
pub struct PoolCall<C: ManagedChannel> {
    pool: Arc<PoolInner<C>>,
    affinity: Option<AffinityConfig>,
    channel: Option<Arc<ChannelRef<C>>>,
    request_key: Option<String>,
}

impl<C: ManagedChannel> PoolCall<C> {
    pub(crate) fn new(pool: Arc<PoolInner<C>>, affinity: Option<AffinityConfig>) -> Self {
        PoolCall {
            pool,
            affinity,
            channel: None,
            request_key: None,
        }
    }

    /// Routes the call using `request` for key extraction and marks its
    /// stream active. Returns the transport channel to issue the call on.
    ///
    /// A request without the configured key demotes the call to unkeyed
    /// routing; it still completes normally, only without affinity.
    pub fn start(&mut self, request: &dyn KeyedMessage) -> Result<&C, PoolError> {
        let key = match &self.affinity {
            Some(config) if config.command != AffinityCommand::Bind => {
                affinity_key(request, &config.affinity_key)
            }
            _ => None,
        };
        self.route(key)
    }

    /// Routes the call without inspecting a request message.
    ///
    /// Used for methods with no affinity configuration and for `BIND`
    /// methods, whose channel is chosen by the unkeyed policy.
    pub fn start_unkeyed(&mut self) -> Result<&C, PoolError> {
        self.route(None)
    }

    fn route(&mut self, key: Option<String>) -> Result<&C, PoolError> {
        if self.channel.is_some() {
            return Err(PoolError::CallAlreadyStarted);
        }
        let channel_ref = self.pool.pick(key.as_deref())?;
        channel_ref.incr_streams();
        trace!(
            channel_id = channel_ref.id(),
            keyed = key.is_some(),
            "call started"
        );
        if matches!(
            self.affinity.as_ref().map(|config| config.command),
            Some(AffinityCommand::Unbind)
        ) {
            self.request_key = key;
        }
        Ok(self.channel.insert(channel_ref).channel())
    }

    /// Records one successful response message.
    ///
    /// `BIND` methods establish their affinity binding here, from the key
    /// carried in the response. A response without the key leaves the
    /// registry untouched; the call still completes normally.
    pub fn recv_response(&mut self, response: &dyn KeyedMessage) {
        let (Some(config), Some(channel_ref)) = (&self.affinity, &self.channel) else {
            return;
        };
        if config.command != AffinityCommand::Bind {
            return;
        }
        if let Some(key) = affinity_key(response, &config.affinity_key) {
            self.pool.registry.bind(channel_ref, &key);
        }
    }

    /// The transport channel the call was routed to, once started.
    pub fn channel(&self) -> Option<&C> {
        self.channel.as_ref().map(|channel_ref| channel_ref.channel())
    }

    /// Pool id of the channel the call was routed to, once started.
    pub fn channel_id(&self) -> Option<usize> {
        self.channel.as_ref().map(|channel_ref| channel_ref.id())
    }
}

impl<C: ManagedChannel> Drop for PoolCall<C> {
    fn drop(&mut self) {
        let Some(channel_ref) = self.channel.take() else {
            return;
        };
        channel_ref.decr_streams();
        if let Some(key) = self.request_key.take() {
            self.pool.registry.unbind(&key);
        }
        trace!(channel_id = channel_ref.id(), "call finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;

    use prost_types::value::Kind;
    use prost_types::{Struct, Value};
    use tracing_test::traced_test;

    use crate::config::ApiConfig;
    use crate::pool::ChannelPool;
    use crate::testutils::{TestChannel, TestChannelBuilder};

    const CREATE: &str = "/google.spanner.v1.Spanner/CreateSession";
    const GET: &str = "/google.spanner.v1.Spanner/GetSession";
    const DELETE: &str = "/google.spanner.v1.Spanner/DeleteSession";

    fn session_pool() -> ChannelPool<TestChannel> {
        let config = ApiConfig::from_json(
            r#"{
                "channelPool": { "maxConcurrentStreamsLowWatermark": 1 },
                "method": [
                    { "name": ["/google.spanner.v1.Spanner/CreateSession"],
                      "affinity": { "affinityKey": "name", "command": "BIND" } },
                    { "name": ["/google.spanner.v1.Spanner/GetSession"],
                      "affinity": { "affinityKey": "name", "command": "BOUND" } },
                    { "name": ["/google.spanner.v1.Spanner/DeleteSession"],
                      "affinity": { "affinityKey": "name", "command": "UNBIND" } }
                ]
            }"#,
        )
        .unwrap();
        ChannelPool::with_config(TestChannelBuilder::new("call.test:443"), &config).unwrap()
    }

    fn session(name: &str) -> Struct {
        Struct {
            fields: BTreeMap::from([(
                "name".to_owned(),
                Value {
                    kind: Some(Kind::StringValue(name.to_owned())),
                },
            )]),
        }
    }

    #[test]
    #[traced_test]
    fn test_simple_call_counters() {
        let pool = ChannelPool::new(TestChannelBuilder::new("call.test:443")).unwrap();

        let mut call = pool.new_call("/unconfigured.Service/Method");
        call.start_unkeyed().unwrap();
        assert_eq!(call.channel_id(), Some(0));

        // under the default watermark the same member keeps absorbing calls
        let channel_ref = pool.inner.pick(None).unwrap();
        assert_eq!(channel_ref.active_streams(), 1);

        drop(call);
        assert_eq!(channel_ref.active_streams(), 0);
    }

    #[test]
    #[traced_test]
    fn test_start_twice_fails() {
        let pool = session_pool();
        let mut call = pool.new_call(GET);
        call.start(&session("s")).unwrap();
        assert!(matches!(
            call.start(&session("s")),
            Err(PoolError::CallAlreadyStarted)
        ));
    }

    #[test]
    #[traced_test]
    fn test_bind_from_response_then_bound_routing() {
        let pool = session_pool();

        let mut create = pool.new_call(CREATE);
        create.start_unkeyed().unwrap();
        let bound_id = create.channel_id().unwrap();
        create.recv_response(&session("session-1"));
        assert_eq!(pool.inner.registry.len(), 1);

        let mut hold = pool.new_call(GET);
        hold.start(&session("session-1")).unwrap();
        assert_eq!(hold.channel_id(), Some(bound_id));
        drop(hold);
        drop(create);

        // still routed by the key once the calls are gone
        let mut get = pool.new_call(GET);
        get.start(&session("session-1")).unwrap();
        assert_eq!(get.channel_id(), Some(bound_id));
    }

    #[test]
    #[traced_test]
    fn test_bind_without_key_in_response() {
        let pool = session_pool();
        let mut create = pool.new_call(CREATE);
        create.start_unkeyed().unwrap();
        create.recv_response(&session(""));
        assert_eq!(pool.inner.registry.len(), 0);
    }

    #[test]
    #[traced_test]
    fn test_unbind_on_terminal_event() {
        let pool = session_pool();

        let mut create = pool.new_call(CREATE);
        create.start_unkeyed().unwrap();
        create.recv_response(&session("session-1"));
        drop(create);
        assert_eq!(pool.inner.registry.len(), 1);

        // the key is released only when the delete call ends
        let mut delete = pool.new_call(DELETE);
        delete.start(&session("session-1")).unwrap();
        assert_eq!(pool.inner.registry.len(), 1);
        drop(delete);
        assert_eq!(pool.inner.registry.len(), 0);
    }

    #[test]
    #[traced_test]
    fn test_missing_request_key_runs_unkeyed() {
        let pool = session_pool();

        let mut delete = pool.new_call(DELETE);
        delete.start(&session("")).unwrap();
        assert!(delete.channel_id().is_some());
        drop(delete);
        // nothing was bound, nothing to release
        assert_eq!(pool.inner.registry.len(), 0);
    }

    #[test]
    #[traced_test]
    fn test_cancellation_settles_counters() {
        let pool = session_pool();

        let mut create = pool.new_call(CREATE);
        create.start_unkeyed().unwrap();
        // caller abandons the call before any response arrives
        drop(create);

        let channel_ref = pool.inner.pick(None).unwrap();
        assert_eq!(channel_ref.id(), 0);
        assert_eq!(channel_ref.active_streams(), 0);
        assert_eq!(pool.number_of_channels(), 1);
        assert_eq!(pool.inner.registry.len(), 0);
    }
}
