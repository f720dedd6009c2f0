//! NLM v4 protocol adapter (spec §4.4): wire codec, RPC framing, owner
//! identity translation, the GRANTED callback client, and the request
//! handler that drives the cross-protocol lock core.

pub mod callback;
pub mod handler;
pub mod owner;
pub mod record;
pub mod xdr;

pub use callback::CallbackClient;
pub use handler::{CallbackTarget, NlmHandler};
