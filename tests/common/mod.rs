//! Shared test harness: frame capture via the send override, an in-memory
//! two-peer pump, frame summaries for assertions, and stock call handlers.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use capwire::rpc_capnp;
use capwire::{
    build_frame, text_to_string, CallHandler, DecodedMessage, Error, InboundCall, OutboundCap,
    Peer, ReturnOutcome,
};

// ─── Frame capture ────────────────────────────────────────────────────────────

/// Outbound frames captured through the send override.
#[derive(Clone, Default)]
pub struct FrameLog {
    frames: Rc<RefCell<VecDeque<Vec<u8>>>>,
}

impl FrameLog {
    pub fn pop(&self) -> Option<Vec<u8>> {
        self.frames.borrow_mut().pop_front()
    }

    pub fn drain(&self) -> Vec<Vec<u8>> {
        self.frames.borrow_mut().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.frames.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.borrow().is_empty()
    }

    /// Summaries of everything captured so far, consuming the log.
    pub fn summaries(&self) -> Vec<Frame> {
        self.drain().iter().map(|bytes| summarize(bytes)).collect()
    }
}

/// A detached peer whose outbound frames land in the returned log.
pub fn capture_peer() -> (Peer, FrameLog) {
    let mut peer = Peer::new_detached();
    let log = FrameLog::default();
    let sink = log.frames.clone();
    peer.set_send_frame_override(Box::new(move |bytes| {
        sink.borrow_mut().push_back(bytes.to_vec());
        Ok(())
    }));
    (peer, log)
}

/// A detached peer whose sends all fail with a transport error.
pub fn failing_peer() -> Peer {
    let mut peer = Peer::new_detached();
    peer.set_send_frame_override(Box::new(|_| {
        Err(Error::Transport("test send failed".to_string()))
    }));
    peer
}

// ─── Two-peer pump ────────────────────────────────────────────────────────────

/// Two peers wired back to back in memory; `pump` shuttles frames until both
/// sides go quiet.
pub struct PeerPair {
    pub a: Peer,
    pub b: Peer,
    a_out: FrameLog,
    b_out: FrameLog,
}

impl PeerPair {
    pub fn new() -> Self {
        let (a, a_out) = capture_peer();
        let (b, b_out) = capture_peer();
        PeerPair { a, b, a_out, b_out }
    }

    pub fn pump(&mut self) {
        loop {
            let mut moved = false;
            while let Some(frame) = self.a_out.pop() {
                moved = true;
                self.b
                    .handle_frame(&frame)
                    .unwrap_or_else(|err| panic!("peer b rejected {:?}: {err}", summarize(&frame)));
            }
            while let Some(frame) = self.b_out.pop() {
                moved = true;
                self.a
                    .handle_frame(&frame)
                    .unwrap_or_else(|err| panic!("peer a rejected {:?}: {err}", summarize(&frame)));
            }
            if !moved {
                return;
            }
        }
    }
}

// ─── Frame summaries ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Bootstrap {
        question_id: u32,
    },
    Call {
        question_id: u32,
        interface_id: u64,
        method_id: u16,
        yourself: bool,
    },
    Return {
        answer_id: u32,
        what: ReturnKind,
    },
    Finish {
        question_id: u32,
        release_result_caps: bool,
    },
    Release {
        id: u32,
        count: u32,
    },
    Resolve {
        promise_id: u32,
        broken: bool,
    },
    Disembargo(DisembargoKind),
    ThirdPartyAnswer {
        answer_id: u32,
    },
    Provide {
        question_id: u32,
    },
    Accept {
        question_id: u32,
    },
    Join {
        question_id: u32,
    },
    Unimplemented,
    Abort {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReturnKind {
    Results { cap_count: u32 },
    Exception { reason: String },
    Canceled,
    ResultsSentElsewhere,
    TakeFromOtherQuestion(u32),
    AcceptFromThirdParty,
    AwaitFromThirdParty,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DisembargoKind {
    SenderLoopback(u32),
    ReceiverLoopback(u32),
    Accept,
    Provide(u32),
}

pub fn summarize(bytes: &[u8]) -> Frame {
    let decoded = DecodedMessage::new(bytes).expect("captured frame decodes");
    let root = decoded.root().expect("captured frame has a root");
    use rpc_capnp::message::Which;
    match root.which().expect("captured frame tag is known") {
        Which::Bootstrap(b) => Frame::Bootstrap {
            question_id: b.unwrap().get_question_id(),
        },
        Which::Call(c) => {
            let c = c.unwrap();
            let yourself = matches!(
                c.get_send_results_to().which().unwrap(),
                rpc_capnp::call::send_results_to::Which::Yourself(())
            );
            Frame::Call {
                question_id: c.get_question_id(),
                interface_id: c.get_interface_id(),
                method_id: c.get_method_id(),
                yourself,
            }
        }
        Which::Return(r) => {
            let r = r.unwrap();
            use rpc_capnp::return_::Which as R;
            let what = match r.which().unwrap() {
                R::Results(payload) => ReturnKind::Results {
                    cap_count: payload.unwrap().get_cap_table().unwrap().len(),
                },
                R::Exception(e) => ReturnKind::Exception {
                    reason: text_to_string(e.unwrap().get_reason().unwrap()),
                },
                R::Canceled(()) => ReturnKind::Canceled,
                R::ResultsSentElsewhere(()) => ReturnKind::ResultsSentElsewhere,
                R::TakeFromOtherQuestion(q) => ReturnKind::TakeFromOtherQuestion(q),
                R::AcceptFromThirdParty(_) => ReturnKind::AcceptFromThirdParty,
                R::AwaitFromThirdParty(_) => ReturnKind::AwaitFromThirdParty,
            };
            Frame::Return {
                answer_id: r.get_answer_id(),
                what,
            }
        }
        Which::Finish(f) => {
            let f = f.unwrap();
            Frame::Finish {
                question_id: f.get_question_id(),
                release_result_caps: f.get_release_result_caps(),
            }
        }
        Which::Release(r) => {
            let r = r.unwrap();
            Frame::Release {
                id: r.get_id(),
                count: r.get_reference_count(),
            }
        }
        Which::Resolve(r) => {
            let r = r.unwrap();
            let broken = matches!(
                r.which().unwrap(),
                rpc_capnp::resolve::Which::Exception(_)
            );
            Frame::Resolve {
                promise_id: r.get_promise_id(),
                broken,
            }
        }
        Which::Disembargo(d) => {
            let d = d.unwrap();
            use rpc_capnp::disembargo::context::Which as C;
            Frame::Disembargo(match d.get_context().which().unwrap() {
                C::SenderLoopback(id) => DisembargoKind::SenderLoopback(id),
                C::ReceiverLoopback(id) => DisembargoKind::ReceiverLoopback(id),
                C::Accept(()) => DisembargoKind::Accept,
                C::Provide(q) => DisembargoKind::Provide(q),
            })
        }
        Which::ThirdPartyAnswer(t) => Frame::ThirdPartyAnswer {
            answer_id: t.unwrap().get_answer_id(),
        },
        Which::Provide(p) => Frame::Provide {
            question_id: p.unwrap().get_question_id(),
        },
        Which::Accept(a) => Frame::Accept {
            question_id: a.unwrap().get_question_id(),
        },
        Which::Join(j) => Frame::Join {
            question_id: j.unwrap().get_question_id(),
        },
        Which::Unimplemented(_) => Frame::Unimplemented,
        Which::Abort(e) => Frame::Abort {
            reason: text_to_string(e.unwrap().get_reason().unwrap()),
        },
        Which::ObsoleteSave(_) | Which::ObsoleteDelete(_) => {
            panic!("unexpected obsolete frame in capture")
        }
    }
}

// ─── Inbound frame builders ───────────────────────────────────────────────────

pub fn call_frame(question_id: u32, target_export: u32, interface_id: u64, method_id: u16) -> Vec<u8> {
    build_frame(|root| {
        let mut call = root.init_call();
        call.set_question_id(question_id);
        call.set_interface_id(interface_id);
        call.set_method_id(method_id);
        call.reborrow().init_target().set_imported_cap(target_export);
        call.reborrow().get_send_results_to().set_caller(());
        Ok(())
    })
    .unwrap()
}

pub fn call_frame_yourself(question_id: u32, target_export: u32) -> Vec<u8> {
    build_frame(|root| {
        let mut call = root.init_call();
        call.set_question_id(question_id);
        call.set_interface_id(1);
        call.set_method_id(0);
        call.reborrow().init_target().set_imported_cap(target_export);
        call.reborrow().get_send_results_to().set_yourself(());
        Ok(())
    })
    .unwrap()
}

pub fn call_frame_third_party(question_id: u32, target_export: u32, token: u32) -> Vec<u8> {
    build_frame(|root| {
        let mut call = root.init_call();
        call.set_question_id(question_id);
        call.set_interface_id(1);
        call.set_method_id(0);
        call.reborrow().init_target().set_imported_cap(target_export);
        let mut key = call
            .reborrow()
            .get_send_results_to()
            .init_third_party()
            .init_as::<rpc_capnp::join_key_part::Builder>();
        key.set_join_id(token);
        Ok(())
    })
    .unwrap()
}

pub fn pipelined_call_frame(
    question_id: u32,
    promised_answer_id: u32,
    ops: &[u16],
    interface_id: u64,
    method_id: u16,
) -> Vec<u8> {
    build_frame(|root| {
        let mut call = root.init_call();
        call.set_question_id(question_id);
        call.set_interface_id(interface_id);
        call.set_method_id(method_id);
        let mut promised = call.reborrow().init_target().init_promised_answer();
        promised.set_question_id(promised_answer_id);
        let mut transform = promised.init_transform(ops.len() as u32);
        for (index, op) in ops.iter().enumerate() {
            transform
                .reborrow()
                .get(index as u32)
                .set_get_pointer_field(*op);
        }
        call.reborrow().get_send_results_to().set_caller(());
        Ok(())
    })
    .unwrap()
}

pub fn bootstrap_frame(question_id: u32) -> Vec<u8> {
    capwire::build_bootstrap(question_id).unwrap()
}

pub fn finish_frame(question_id: u32, release_result_caps: bool, require_early: bool) -> Vec<u8> {
    capwire::build_finish(question_id, release_result_caps, require_early).unwrap()
}

pub fn release_frame(id: u32, count: u32) -> Vec<u8> {
    capwire::build_release(id, count).unwrap()
}

pub fn return_exception_frame(answer_id: u32, reason: &str) -> Vec<u8> {
    build_frame(|root| {
        let mut ret = root.init_return();
        ret.set_answer_id(answer_id);
        let mut exception = ret.init_exception();
        exception.set_reason(reason);
        exception.set_type(rpc_capnp::exception::Type::Failed);
        Ok(())
    })
    .unwrap()
}

pub fn return_results_frame(answer_id: u32) -> Vec<u8> {
    build_frame(|root| {
        let mut ret = root.init_return();
        ret.set_answer_id(answer_id);
        ret.init_results();
        Ok(())
    })
    .unwrap()
}

/// Results Return whose cap table holds a single descriptor.
pub fn return_results_cap_frame(answer_id: u32, descriptor: CapKind) -> Vec<u8> {
    build_frame(|root| {
        let mut ret = root.init_return();
        ret.set_answer_id(answer_id);
        let payload = ret.init_results();
        let mut table = payload.init_cap_table(1);
        let mut entry = table.reborrow().get(0);
        match descriptor {
            CapKind::SenderHosted(id) => entry.set_sender_hosted(id),
            CapKind::SenderPromise(id) => entry.set_sender_promise(id),
            CapKind::ReceiverHosted(id) => entry.set_receiver_hosted(id),
        }
        Ok(())
    })
    .unwrap()
}

#[derive(Debug, Clone, Copy)]
pub enum CapKind {
    SenderHosted(u32),
    SenderPromise(u32),
    ReceiverHosted(u32),
}

pub fn return_sent_elsewhere_frame(answer_id: u32) -> Vec<u8> {
    build_frame(|root| {
        let mut ret = root.init_return();
        ret.set_answer_id(answer_id);
        ret.set_results_sent_elsewhere(());
        Ok(())
    })
    .unwrap()
}

/// `awaitFromThirdParty` Return with a small struct token as completion.
pub fn return_await_third_party_frame(answer_id: u32, token: u32) -> Vec<u8> {
    build_frame(|root| {
        let mut ret = root.init_return();
        ret.set_answer_id(answer_id);
        let mut key = ret
            .init_await_from_third_party()
            .init_as::<rpc_capnp::join_key_part::Builder>();
        key.set_join_id(token);
        Ok(())
    })
    .unwrap()
}

pub fn third_party_answer_frame(answer_id: u32, token: u32) -> Vec<u8> {
    build_frame(|root| {
        let mut announce = root.init_third_party_answer();
        announce.set_answer_id(answer_id);
        let mut key = announce
            .init_completion()
            .init_as::<rpc_capnp::join_key_part::Builder>();
        key.set_join_id(token);
        Ok(())
    })
    .unwrap()
}

pub fn provide_frame(question_id: u32, target_export: u32, recipient_token: u32) -> Vec<u8> {
    build_frame(|root| {
        let mut provide = root.init_provide();
        provide.set_question_id(question_id);
        provide.reborrow().init_target().set_imported_cap(target_export);
        let mut key = provide
            .init_recipient()
            .init_as::<rpc_capnp::join_key_part::Builder>();
        key.set_join_id(recipient_token);
        Ok(())
    })
    .unwrap()
}

pub fn accept_frame(question_id: u32, provision_token: u32, embargo: bool) -> Vec<u8> {
    build_frame(|root| {
        let mut accept = root.init_accept();
        accept.set_question_id(question_id);
        accept.set_embargo(embargo);
        let mut key = accept
            .init_provision()
            .init_as::<rpc_capnp::join_key_part::Builder>();
        key.set_join_id(provision_token);
        Ok(())
    })
    .unwrap()
}

pub fn join_frame(
    question_id: u32,
    target_export: u32,
    join_id: u32,
    part_count: u16,
    part_num: u16,
) -> Vec<u8> {
    build_frame(|root| {
        let mut join = root.init_join();
        join.set_question_id(question_id);
        join.reborrow().init_target().set_imported_cap(target_export);
        let mut key = join
            .init_key_part()
            .init_as::<rpc_capnp::join_key_part::Builder>();
        key.set_join_id(join_id);
        key.set_part_count(part_count);
        key.set_part_num(part_num);
        Ok(())
    })
    .unwrap()
}

pub fn disembargo_provide_frame(import_id: u32, provide_question_id: u32) -> Vec<u8> {
    capwire::build_disembargo_provide(import_id, provide_question_id).unwrap()
}

pub fn resolve_frame(promise_id: u32, concrete_export: u32) -> Vec<u8> {
    capwire::build_resolve_sender_hosted(promise_id, concrete_export).unwrap()
}

// ─── Stock handlers ───────────────────────────────────────────────────────────

/// Replies with empty results immediately.
pub struct EchoHandler;

impl CallHandler for EchoHandler {
    fn call(&self, peer: &mut Peer, call: &mut InboundCall<'_>) -> Result<(), Error> {
        peer.send_return_results(call.answer_id, |_| Ok(()))
    }
}

/// Replies with an exception carrying a fixed reason.
pub struct ExceptionHandler(pub &'static str);

impl CallHandler for ExceptionHandler {
    fn call(&self, peer: &mut Peer, call: &mut InboundCall<'_>) -> Result<(), Error> {
        peer.send_return_exception(call.answer_id, self.0)
    }
}

/// Records `(interface_id, method_id, answer_id)` then replies with results
/// whose content is a token struct.
#[derive(Default)]
pub struct RecordingHandler {
    pub calls: Rc<RefCell<Vec<(u64, u16, u32)>>>,
}

impl CallHandler for RecordingHandler {
    fn call(&self, peer: &mut Peer, call: &mut InboundCall<'_>) -> Result<(), Error> {
        self.calls
            .borrow_mut()
            .push((call.interface_id, call.method_id, call.answer_id));
        let token = call.method_id as u32;
        peer.send_return_results(call.answer_id, |results| {
            let mut key = results
                .content()
                .init_as::<rpc_capnp::join_key_part::Builder>();
            key.set_join_id(token);
            Ok(())
        })
    }
}

/// Replies with results that re-export a fixed capability.
pub struct CapReturningHandler(pub OutboundCap);

impl CallHandler for CapReturningHandler {
    fn call(&self, peer: &mut Peer, call: &mut InboundCall<'_>) -> Result<(), Error> {
        let cap = self.0.clone();
        peer.send_return_results(call.answer_id, |results| {
            results.add_cap(cap);
            Ok(())
        })
    }
}

/// Collects return outcomes delivered to a callback.
#[derive(Clone, Default)]
pub struct OutcomeLog {
    pub entries: Rc<RefCell<Vec<String>>>,
}

impl OutcomeLog {
    /// Callback that renders each outcome to a compact string.
    pub fn callback(&self) -> capwire::ReturnCallback {
        let entries = self.entries.clone();
        Box::new(move |_peer, question_id, outcome| {
            let rendered = match outcome {
                ReturnOutcome::Results(results) => {
                    format!("results caps={}", results.caps.len())
                }
                ReturnOutcome::Exception { reason } => format!("exception {reason}"),
                ReturnOutcome::Canceled => "canceled".to_string(),
                ReturnOutcome::TakenFromOtherQuestion { question_id } => {
                    format!("taken-from {question_id}")
                }
            };
            entries.borrow_mut().push(format!("q{question_id}: {rendered}"));
        })
    }

    pub fn take(&self) -> Vec<String> {
        self.entries.borrow_mut().drain(..).collect()
    }
}
