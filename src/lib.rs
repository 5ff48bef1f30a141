//! Switchboard - RPC over a shared topic exchange
//!
//! Every operation is a routing key on one topic exchange. Callers issue
//! correlated requests with a timeout, or fire-and-forget publishes; services
//! register handlers whose outcomes travel back in a tagged result envelope.

pub mod broker;
pub mod client;
pub mod config;
pub mod context;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod server;
pub mod topology;
pub mod utils;

pub use client::RpcClient;
pub use context::{ContextError, ServiceContext};
pub use envelope::{Envelope, Failure};
pub use error::RpcError;
pub use handler::{HandlerError, HandlerResult, Request, RpcHandler};
pub use server::{FailurePolicy, RpcServer, ServerError};
pub use topology::{QueueName, RoutingKey, Topology};
