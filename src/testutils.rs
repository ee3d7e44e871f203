// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! In-memory transport used by the crate's own tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelBuilder, ConnectivityState, ManagedChannel};
use crate::errors::PoolError;

/// A transport channel that connects nowhere.
///
/// Its connectivity state is settable from tests. Graceful shutdown flips
/// the state to shutdown without terminating; forceful shutdown terminates
/// immediately.
pub struct TestChannel {
    authority: String,
    state: Mutex<ConnectivityState>,
    shutdown: AtomicBool,
    terminated: CancellationToken,
}

impl TestChannel {
    pub fn new(authority: &str) -> Self {
        TestChannel {
            authority: authority.to_owned(),
            state: Mutex::new(ConnectivityState::Idle),
            shutdown: AtomicBool::new(false),
            terminated: CancellationToken::new(),
        }
    }

    pub fn set_state(&self, state: ConnectivityState) {
        *self.state.lock() = state;
    }
}

#[async_trait]
impl ManagedChannel for TestChannel {
    fn authority(&self) -> String {
        self.authority.clone()
    }

    fn state(&self, _request_connection: bool) -> ConnectivityState {
        *self.state.lock()
    }

    fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.set_state(ConnectivityState::Shutdown);
    }

    fn shutdown_now(&self) {
        self.shutdown();
        self.terminated.cancel();
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

/// Builder handing out [`TestChannel`]s, counting how many were dialed.
pub struct TestChannelBuilder {
    authority: String,
    dialed: AtomicUsize,
}

impl TestChannelBuilder {
    pub fn new(authority: &str) -> Self {
        TestChannelBuilder {
            authority: authority.to_owned(),
            dialed: AtomicUsize::new(0),
        }
    }

    pub fn dialed(&self) -> usize {
        self.dialed.load(Ordering::Acquire)
    }
}

impl ChannelBuilder for TestChannelBuilder {
    type Channel = TestChannel;

    fn connect(&self) -> Result<TestChannel, PoolError> {
        self.dialed.fetch_add(1, Ordering::AcqRel);
        Ok(TestChannel::new(&self.authority))
    }
}
