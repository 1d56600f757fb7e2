//! # mcp-bridge
//!
//! A Model Context Protocol runtime and a bridge that exposes remote MCP
//! servers to local clients.
//!
//! ## Overview
//!
//! The crate provides both halves of the protocol over a common connection
//! runtime:
//!
//! - **Client**: [`Client`] performs the handshake, issues typed requests
//!   through [`ServerAPI`], recovers lost sessions and answers `-32001`
//!   challenges with tokens from a [`TokenProvider`].
//! - **Server**: [`Server`] runs sessions over stdio, byte streams, or HTTP
//!   (Streamable HTTP and legacy SSE), dispatching to a [`ServerHandler`].
//! - **Auth**: [`auth::AuthTransport`] wraps outbound HTTP with OAuth 2.1
//!   discovery, PKCE, refresh and token caching; [`auth::Policy`] guards
//!   server operations.
//! - **Bridge**: [`bridge::Bridge`] proxies a remote server to a local client,
//!   serving elicitation through a local page when the client cannot.
//!
//! ## Quick Example
//!
//! ```rust,no_run
//! use mcp_bridge::{Result, Server, ServerHandler, schema::*, RequestContext};
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl ServerHandler for Echo {
//!     async fn list_tools(
//!         &self,
//!         _ctx: &RequestContext,
//!         _params: PaginatedParams,
//!     ) -> Result<ListToolsResult> {
//!         Ok(ListToolsResult::new().with_tool(Tool::new("echo", ToolSchema::default())))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     Server::new("echo", "0.1.0")
//!         .with_handler(|_ctx| Echo)
//!         .serve_stdio()
//!         .await
//! }
//! ```

mod api;
mod client;
mod codec;
mod context;
mod error;
mod jsonrpc;
mod peer;

pub mod auth;
pub mod bridge;
pub mod config;
pub mod schema;
pub mod server;
pub mod testutils;
pub mod transport;

pub use api::{ClientAPI, ServerAPI};
pub use client::{
    CallOptions, CallScope, Client, ClientBuilder, ClientHandler, Connector, NoopClientHandler,
    TokenProvider,
};
pub use codec::JsonRpcCodec;
pub use context::RequestContext;
pub use error::{Error, Result};
pub use jsonrpc::IdGenerator;
pub use peer::{Handler, Peer};
pub use server::{
    Authorizer, ClientOps, HttpOptions, HttpServerHandle, Logger, Notifier, Server, ServerHandle,
    ServerHandler, SessionCtx,
};

// Re-export schemars for users
pub use schemars;
