/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module defining the contract between the client and whatever byte-oriented transport it is
configured with.

The engine never opens sockets itself.  It consumes a factory that asynchronously produces a
fresh bidirectional byte duplex (`AsyncRead + AsyncWrite`) on demand; one duplex per
connection attempt, exclusively owned by the session that attachment creates.  Reads
returning zero bytes, read errors, and write errors all signal transport loss to the session
engine.  TCP, TLS, websockets, and in-memory test duplexes all fit this shape.
 */

use tokio::io::{AsyncRead, AsyncWrite};

use std::future::Future;
use std::pin::Pin;

/// Future type produced by a transport factory invocation
pub type TransportFactoryReturn<T> = Pin<Box<dyn Future<Output = std::io::Result<T>> + Send>>;

/// Factory function that asynchronously produces a fresh byte duplex for each connection
/// attempt
pub type TransportFactory<T> = Box<dyn Fn() -> TransportFactoryReturn<T> + Send>;

/// Marker bound for usable transport stream types
pub trait TransportStream: AsyncRead + AsyncWrite + Send + 'static {}

impl<T> TransportStream for T where T: AsyncRead + AsyncWrite + Send + 'static {}
