//! Frame-level codec: build and decode the 15 RPC message variants.
//!
//! Every frame is a single-segment Cap'n Proto message whose root is the
//! `Message` union from `schema/rpc.capnp`. The helpers here are pure — they
//! allocate nothing shared across frames — so the peer can call them from any
//! handler without re-entrancy concerns.

use capnp::message::ReaderOptions;
use capnp::serialize;
use smallvec::SmallVec;

use crate::error::Error;
use crate::rpc_capnp;

/// Transform ops are almost always one or two pointer hops.
pub type TransformOps = SmallVec<[u16; 4]>;

// ─── Message tags ─────────────────────────────────────────────────────────────

/// Root-union discriminants, locked for wire compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTag {
    Unimplemented,
    Abort,
    Call,
    Return,
    Finish,
    Resolve,
    Release,
    ObsoleteSave,
    Bootstrap,
    ObsoleteDelete,
    Provide,
    Accept,
    Join,
    Disembargo,
    ThirdPartyAnswer,
}

impl MessageTag {
    pub fn from_u16(tag: u16) -> Option<Self> {
        Some(match tag {
            0 => MessageTag::Unimplemented,
            1 => MessageTag::Abort,
            2 => MessageTag::Call,
            3 => MessageTag::Return,
            4 => MessageTag::Finish,
            5 => MessageTag::Resolve,
            6 => MessageTag::Release,
            7 => MessageTag::ObsoleteSave,
            8 => MessageTag::Bootstrap,
            9 => MessageTag::ObsoleteDelete,
            10 => MessageTag::Provide,
            11 => MessageTag::Accept,
            12 => MessageTag::Join,
            13 => MessageTag::Disembargo,
            14 => MessageTag::ThirdPartyAnswer,
            _ => return None,
        })
    }

    pub fn as_u16(self) -> u16 {
        match self {
            MessageTag::Unimplemented => 0,
            MessageTag::Abort => 1,
            MessageTag::Call => 2,
            MessageTag::Return => 3,
            MessageTag::Finish => 4,
            MessageTag::Resolve => 5,
            MessageTag::Release => 6,
            MessageTag::ObsoleteSave => 7,
            MessageTag::Bootstrap => 8,
            MessageTag::ObsoleteDelete => 9,
            MessageTag::Provide => 10,
            MessageTag::Accept => 11,
            MessageTag::Join => 12,
            MessageTag::Disembargo => 13,
            MessageTag::ThirdPartyAnswer => 14,
        }
    }
}

// ─── Decoding ─────────────────────────────────────────────────────────────────

/// An inbound frame, decoded into an owned message reader.
pub struct DecodedMessage {
    reader: capnp::message::Reader<serialize::OwnedSegments>,
}

impl DecodedMessage {
    pub fn new(bytes: &[u8]) -> Result<Self, Error> {
        let reader = serialize::read_message(bytes, ReaderOptions::new())?;
        Ok(DecodedMessage { reader })
    }

    pub fn root(&self) -> Result<rpc_capnp::message::Reader<'_>, Error> {
        Ok(self.reader.get_root::<rpc_capnp::message::Reader>()?)
    }

    /// The root-union tag, or `InvalidMessageTag` for out-of-schema values.
    pub fn tag(&self) -> Result<MessageTag, Error> {
        use rpc_capnp::message::Which;
        Ok(match self.root()?.which()? {
            Which::Unimplemented(_) => MessageTag::Unimplemented,
            Which::Abort(_) => MessageTag::Abort,
            Which::Call(_) => MessageTag::Call,
            Which::Return(_) => MessageTag::Return,
            Which::Finish(_) => MessageTag::Finish,
            Which::Resolve(_) => MessageTag::Resolve,
            Which::Release(_) => MessageTag::Release,
            Which::ObsoleteSave(_) => MessageTag::ObsoleteSave,
            Which::Bootstrap(_) => MessageTag::Bootstrap,
            Which::ObsoleteDelete(_) => MessageTag::ObsoleteDelete,
            Which::Provide(_) => MessageTag::Provide,
            Which::Accept(_) => MessageTag::Accept,
            Which::Join(_) => MessageTag::Join,
            Which::Disembargo(_) => MessageTag::Disembargo,
            Which::ThirdPartyAnswer(_) => MessageTag::ThirdPartyAnswer,
        })
    }
}

// ─── Building ─────────────────────────────────────────────────────────────────

/// Build a single frame; the closure fills in the root `Message`.
pub fn build_frame<F>(fill: F) -> Result<Vec<u8>, Error>
where
    F: FnOnce(rpc_capnp::message::Builder<'_>) -> Result<(), Error>,
{
    let mut message = capnp::message::Builder::new_default();
    fill(message.init_root::<rpc_capnp::message::Builder>())?;
    Ok(serialize::write_message_to_words(&message))
}

pub fn build_bootstrap(question_id: u32) -> Result<Vec<u8>, Error> {
    build_frame(|root| {
        root.init_bootstrap().set_question_id(question_id);
        Ok(())
    })
}

pub fn build_finish(
    question_id: u32,
    release_result_caps: bool,
    require_early_cancellation: bool,
) -> Result<Vec<u8>, Error> {
    build_frame(|root| {
        let mut finish = root.init_finish();
        finish.set_question_id(question_id);
        finish.set_release_result_caps(release_result_caps);
        finish.set_require_early_cancellation(require_early_cancellation);
        Ok(())
    })
}

pub fn build_release(import_id: u32, reference_count: u32) -> Result<Vec<u8>, Error> {
    build_frame(|root| {
        let mut release = root.init_release();
        release.set_id(import_id);
        release.set_reference_count(reference_count);
        Ok(())
    })
}

pub fn build_abort(reason: &str) -> Result<Vec<u8>, Error> {
    build_frame(|root| {
        let mut exception = root.init_abort();
        exception.set_reason(reason);
        exception.set_type(rpc_capnp::exception::Type::Failed);
        Ok(())
    })
}

pub fn build_resolve_sender_hosted(promise_id: u32, export_id: u32) -> Result<Vec<u8>, Error> {
    build_frame(|root| {
        let mut resolve = root.init_resolve();
        resolve.set_promise_id(promise_id);
        resolve.init_cap().set_sender_hosted(export_id);
        Ok(())
    })
}

pub fn build_resolve_exception(promise_id: u32, reason: &str) -> Result<Vec<u8>, Error> {
    build_frame(|root| {
        let mut resolve = root.init_resolve();
        resolve.set_promise_id(promise_id);
        let mut exception = resolve.init_exception();
        exception.set_reason(reason);
        exception.set_type(rpc_capnp::exception::Type::Failed);
        Ok(())
    })
}

pub fn build_disembargo_sender_loopback(import_id: u32, embargo_id: u32) -> Result<Vec<u8>, Error> {
    build_frame(|root| {
        let mut disembargo = root.init_disembargo();
        disembargo.reborrow().init_target().set_imported_cap(import_id);
        disembargo.get_context().set_sender_loopback(embargo_id);
        Ok(())
    })
}

/// Echo of a sender-loopback disembargo, with the original target preserved.
pub fn build_disembargo_receiver_loopback(
    target: rpc_capnp::message_target::Reader<'_>,
    embargo_id: u32,
) -> Result<Vec<u8>, Error> {
    build_frame(|root| {
        let mut disembargo = root.init_disembargo();
        disembargo.set_target(target)?;
        disembargo.get_context().set_receiver_loopback(embargo_id);
        Ok(())
    })
}

pub fn build_disembargo_accept(import_id: u32) -> Result<Vec<u8>, Error> {
    build_frame(|root| {
        let mut disembargo = root.init_disembargo();
        disembargo.reborrow().init_target().set_imported_cap(import_id);
        disembargo.get_context().set_accept(());
        Ok(())
    })
}

pub fn build_disembargo_provide(import_id: u32, provide_question_id: u32) -> Result<Vec<u8>, Error> {
    build_frame(|root| {
        let mut disembargo = root.init_disembargo();
        disembargo.reborrow().init_target().set_imported_cap(import_id);
        disembargo.get_context().set_provide(provide_question_id);
        Ok(())
    })
}

/// Reply to a frame we cannot handle: echo the whole inbound root back.
pub fn build_unimplemented_echo(
    original: rpc_capnp::message::Reader<'_>,
) -> Result<Vec<u8>, Error> {
    build_frame(|mut root| {
        root.set_unimplemented(original)?;
        Ok(())
    })
}

// ─── Pointers and transforms ──────────────────────────────────────────────────

/// Canonical key bytes for an AnyPointer: the pointer deep-copied into a
/// fresh single-segment message and serialized. Logically equal values
/// produced by this codec serialize identically, which is all the keyed
/// tables (provide recipients, third-party completions) need.
pub fn canonical_pointer_bytes(
    pointer: capnp::any_pointer::Reader<'_>,
) -> Result<Vec<u8>, Error> {
    let mut message = capnp::message::Builder::new_default();
    let mut root = message.init_root::<capnp::any_pointer::Builder>();
    root.set_as(pointer)?;
    Ok(serialize::write_message_to_words(&message))
}

/// Decode canonical key bytes back into a message so the pointer can be
/// copied into an outbound frame.
pub fn decode_pointer_bytes(bytes: &[u8]) -> Result<DecodedMessage, Error> {
    DecodedMessage::new(bytes)
}

impl DecodedMessage {
    /// Root of a frame produced by [`canonical_pointer_bytes`].
    pub fn root_pointer(&self) -> Result<capnp::any_pointer::Reader<'_>, Error> {
        Ok(self.reader.get_root::<capnp::any_pointer::Reader>()?)
    }
}

/// Flatten a promised-answer transform to its pointer-field hops.
pub fn decode_transform(
    promised: rpc_capnp::promised_answer::Reader<'_>,
) -> Result<TransformOps, Error> {
    use rpc_capnp::promised_answer::op::Which;
    let mut ops = TransformOps::new();
    for op in promised.get_transform()?.iter() {
        match op.which()? {
            Which::Noop(()) => {}
            Which::GetPointerField(index) => ops.push(index),
        }
    }
    Ok(ops)
}

/// Write a transform into a promised-answer builder.
pub fn write_transform(
    mut promised: rpc_capnp::promised_answer::Builder<'_>,
    question_id: u32,
    ops: &[u16],
) {
    promised.set_question_id(question_id);
    let mut transform = promised.init_transform(ops.len() as u32);
    for (index, op) in ops.iter().enumerate() {
        transform.reborrow().get(index as u32).set_get_pointer_field(*op);
    }
}

/// Lossy text extraction; reasons and names are display-only.
pub fn text_to_string(text: capnp::text::Reader<'_>) -> String {
    String::from_utf8_lossy(text.as_bytes()).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_tags_round_trip_through_u16() {
        for tag in 0u16..15 {
            let parsed = MessageTag::from_u16(tag).expect("tag in range");
            assert_eq!(parsed.as_u16(), tag);
        }
        assert_eq!(MessageTag::from_u16(15), None);
        assert_eq!(MessageTag::from_u16(999), None);
    }

    #[test]
    fn finish_defaults_survive_encoding() {
        let bytes = build_finish(7, false, true).unwrap();
        let decoded = DecodedMessage::new(&bytes).unwrap();
        assert_eq!(decoded.tag().unwrap(), MessageTag::Finish);
        let root = decoded.root().unwrap();
        let finish = match root.which().unwrap() {
            rpc_capnp::message::Which::Finish(finish) => finish.unwrap(),
            _ => panic!("expected finish"),
        };
        assert_eq!(finish.get_question_id(), 7);
        assert!(!finish.get_release_result_caps());
        assert!(finish.get_require_early_cancellation());
    }

    #[test]
    fn abort_carries_reason() {
        let bytes = build_abort("duplicate provide recipient").unwrap();
        let decoded = DecodedMessage::new(&bytes).unwrap();
        let root = decoded.root().unwrap();
        let exception = match root.which().unwrap() {
            rpc_capnp::message::Which::Abort(exception) => exception.unwrap(),
            _ => panic!("expected abort"),
        };
        assert_eq!(
            text_to_string(exception.get_reason().unwrap()),
            "duplicate provide recipient"
        );
    }

    #[test]
    fn canonical_bytes_equal_for_equal_pointers() {
        let token_frame = |question_id: u32, token: u32| {
            build_frame(|root| {
                let mut accept = root.init_accept();
                accept.set_question_id(question_id);
                let mut key = accept
                    .init_provision()
                    .init_as::<rpc_capnp::join_key_part::Builder>();
                key.set_join_id(token);
                Ok(())
            })
            .unwrap()
        };
        let frame_a = token_frame(1, 42);
        let frame_b = token_frame(99, 42);

        let key = |bytes: &[u8]| {
            let decoded = DecodedMessage::new(bytes).unwrap();
            let root = decoded.root().unwrap();
            let accept = match root.which().unwrap() {
                rpc_capnp::message::Which::Accept(accept) => accept.unwrap(),
                _ => panic!("expected accept"),
            };
            canonical_pointer_bytes(accept.get_provision()).unwrap()
        };

        assert_eq!(key(&frame_a), key(&frame_b));
    }

    #[test]
    fn transform_ops_drop_noops() {
        let bytes = build_frame(|root| {
            let mut call = root.init_call();
            call.set_question_id(3);
            let promised = call.init_target().init_promised_answer();
            write_transform(promised, 11, &[0, 2]);
            Ok(())
        })
        .unwrap();
        let decoded = DecodedMessage::new(&bytes).unwrap();
        let root = decoded.root().unwrap();
        let call = match root.which().unwrap() {
            rpc_capnp::message::Which::Call(call) => call.unwrap(),
            _ => panic!("expected call"),
        };
        let promised = match call.get_target().unwrap().which().unwrap() {
            rpc_capnp::message_target::Which::PromisedAnswer(promised) => promised.unwrap(),
            _ => panic!("expected promised answer"),
        };
        assert_eq!(promised.get_question_id(), 11);
        let ops = decode_transform(promised).unwrap();
        assert_eq!(&ops[..], &[0, 2]);
    }
}
