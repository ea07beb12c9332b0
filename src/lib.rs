//! Lightweight, client-side WebSockets for Rust.
//!
//! Implements the client role of RFC 6455: the HTTP/1.1 opening handshake,
//! the framing protocol with fragmentation reassembly, control-frame
//! semantics, mandatory outbound masking, and TLS transport with an
//! optional trust decision hook. Events are delivered through callbacks or
//! a delegate-style [`Listener`](client::Listener) on a caller-chosen
//! [`Executor`](executor::Executor).
#![deny(
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unstable_features,
    unused_must_use,
    unused_mut,
    unused_imports,
    unused_import_braces
)]

pub mod client;
pub mod error;
pub mod executor;
pub mod handshake;
pub mod protocol;
pub mod stream;
pub mod tls;

pub use crate::{
    client::{ConnectionState, Listener, WebSocket},
    error::{Error, Result},
    protocol::{
        frame::{coding::CloseCode, CloseFrame, Utf8Bytes},
        Message, WebSocketConfig,
    },
    tls::TrustEvaluator,
};
