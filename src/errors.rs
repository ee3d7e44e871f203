// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Errors for the channel pool.
/// This is a custom error type for handling pool-related errors.
/// It is used to provide more context to the error messages.
#[derive(Error, Debug)]
pub enum PoolError {
    // Configuration
    #[error("config read error")]
    ConfigRead(#[from] std::io::Error),
    #[error("config parse error")]
    ConfigParse(#[from] serde_json::Error),

    // Endpoint / transport
    #[error("missing grpc endpoint")]
    MissingEndpoint,
    #[error("URI parse error")]
    UriParse(#[from] http::uri::InvalidUri),
    #[error("transport error")]
    TransportError(#[from] tonic::transport::Error),

    // Call lifecycle
    #[error("call already started")]
    CallAlreadyStarted,
}
