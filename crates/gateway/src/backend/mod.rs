// Backend side: TCP links to worker processes and the envelope protocol
// running over them.

pub mod engine;
pub mod links;
pub mod server;

pub use engine::{BackendEngine, CustomHandler, InboundQueue, PushHandler};
pub use links::{BackendLink, LinkRegistry};
pub use server::{serve_backend, serve_link};
