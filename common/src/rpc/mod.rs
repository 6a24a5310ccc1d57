//! Length-prefixed RPC over local sockets.
//!
//! Every call runs on its own connection: the caller sends a `Call` frame
//! naming the service and method, then request messages and a `Close`; the
//! callee answers with response messages and a terminal `Status`.

mod call;
mod channel;
mod frame;
mod server;
mod status;

pub use call::{ServerCall, Sink, Streaming};
pub use channel::Channel;
pub use server::{Server, Service};
pub use status::{Code, Status};
