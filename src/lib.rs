//! capwire — a peer-to-peer Cap'n Proto RPC runtime.
//!
//! One [`Peer`] per connection owns the full protocol state: exports and
//! imports with refcounts, outstanding questions and answers, promise
//! pipelining, call forwarding (tail calls), embargoes, and the level-4
//! three-party hand-off primitives (provide/accept/join, third-party answer
//! adoption). It is transport-agnostic: frames come in through
//! [`Peer::handle_frame`] and go out through a [`Transport`] (or a test
//! override), in strict order, with full rollback of capability-table side
//! effects when a send fails.
//!
//! The [`connection`] module pumps a tokio byte stream into a peer with
//! length-prefixed framing. Everything else is runtime-free and
//! single-threaded: drive a peer from one task.

/// Code generated from `schema/rpc.capnp`.
#[allow(unused_parens, dead_code, clippy::all)]
pub mod rpc_capnp {
    include!(concat!(env!("OUT_DIR"), "/rpc_capnp.rs"));
}

mod cap_table;
mod codec;
pub mod connection;
mod error;
mod handoff;
mod inbound;
mod peer;

pub use cap_table::{CapTable, InboundCaps, OutboundCap, ResolvedCap};
pub use codec::{
    build_abort, build_bootstrap, build_disembargo_accept, build_disembargo_provide,
    build_disembargo_receiver_loopback, build_disembargo_sender_loopback, build_finish,
    build_frame, build_release, build_resolve_exception, build_resolve_sender_hosted,
    build_unimplemented_echo, canonical_pointer_bytes, decode_transform, text_to_string,
    DecodedMessage, MessageTag, TransformOps,
};
pub use connection::drive;
pub use error::Error;
pub use peer::{
    CallHandler, InboundCall, PayloadBuilder, Peer, ResultsReader, ReturnCallback, ReturnOutcome,
    Transport, THIRD_PARTY_ANSWER_BASE,
};
