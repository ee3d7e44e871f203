// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Client-side gRPC channel pool with affinity-based routing.
//!
//! The pool multiplexes logical calls across a bounded set of transport
//! channels and presents their aggregate lifecycle and health as a single
//! channel. Each call is routed either to the channel bound to its
//! affinity key, so a stateful server-side resource (a session, a
//! transaction) keeps being served by the same connection, or to the
//! least-loaded member. The pool grows lazily up to its capacity cap and
//! degrades to the least-loaded member once saturated.
//!
//! Affinity behavior is declared per method in a JSON config document:
//! `BIND` methods create a binding from the key in their response, `BOUND`
//! methods route by the key in their request, and `UNBIND` methods route by
//! the request key and release the binding when the call ends.
//!
//! ```no_run
//! use grpc_affinity_pool::{ChannelPool, GrpcChannelBuilder, GrpcChannelConfig};
//!
//! # fn main() -> Result<(), grpc_affinity_pool::PoolError> {
//! let builder = GrpcChannelBuilder::new(GrpcChannelConfig::with_endpoint(
//!     "https://spanner.googleapis.com",
//! ));
//! let pool = ChannelPool::with_config_file(builder, "spanner_grpc_config.json")?;
//!
//! let mut call = pool.new_call("/google.spanner.v1.Spanner/CreateSession");
//! let channel = call.start_unkeyed()?;
//! // issue the RPC on `channel.transport()`, then feed the response back:
//! // call.recv_response(&response);
//! # Ok(())
//! # }
//! ```

pub mod call;
pub mod channel;
pub mod config;
pub mod errors;
pub mod grpc;
pub mod key;
pub mod pool;

mod registry;

pub mod testutils;

pub use call::PoolCall;
pub use channel::{ChannelBuilder, ChannelRef, ConnectivityState, ManagedChannel};
pub use config::{AffinityCommand, AffinityConfig, ApiConfig, ChannelPoolConfig, MethodConfig};
pub use errors::PoolError;
pub use grpc::{GrpcChannel, GrpcChannelBuilder, GrpcChannelConfig, KeepaliveConfig};
pub use key::{FieldValue, KeyedMessage, affinity_key};
pub use pool::ChannelPool;
