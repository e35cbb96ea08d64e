//! Loam Remote - The sync contract between child and parent contexts in a
//! three-tier deployment.
//!
//! A child context forwards its queries and pending diffs over a
//! [`RemoteChannel`]; the parent-side [`ServerChannel`] applies them to a
//! server context and hands back a client-safe diff describing what the
//! commit changed, most importantly the promotion of temporary ids.

pub mod channel;
pub mod client_diff;

pub use channel::{RemoteChannel, RemoteResponse, ServerChannel, SyncKind};
pub use client_diff::{compact, translate_for_client};
