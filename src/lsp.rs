pub mod capability;
pub mod channel_transport;
pub mod client;
pub mod config;
pub mod correlator;
pub mod error;
pub mod framed;
pub mod handler;
pub mod health;
pub mod lifecycle;
pub mod listeners;
pub mod message_creator;
pub mod message_parser;
pub mod middleware;
pub mod partial;
pub mod peer;
pub mod registration;
pub mod server;
pub mod stream_transport;
pub mod transport;
pub mod types;

pub use channel_transport::ChannelTransport;
pub use client::Client;
pub use config::{HeartbeatConfig, PeerConfig, PeerInfo, ReconnectPolicy};
pub use error::RpcError;
pub use handler::{notification_fn, request_fn, RequestContext};
pub use lifecycle::PeerState;
pub use middleware::{Middleware, MiddlewareContext, Next, Outcome};
pub use peer::{Peer, RequestOptions, Role};
pub use server::Server;
pub use stream_transport::StreamTransport;
pub use transport::Transport;
pub use types::{Message, Notification, Request, RequestId, Response};
