// Backend TCP protocol: newline-delimited JSON envelopes.

pub mod envelope;
pub mod push;

pub use envelope::{
    decode_line, encode_line, BackendAction, BackendEnvelope, Envelope, Params, ServerAction,
    ServerEnvelope,
};
pub use push::{ClientContext, PushCommand, PushDecodeError};
