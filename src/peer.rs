//! The per-connection RPC state machine.
//!
//! One `Peer` owns every protocol table for one bidirectional transport:
//! exports, imports, questions, answers, forwarded calls, embargoes,
//! provide/accept/join records, and third-party adoption state. It is driven
//! entirely by `handle_frame` on the inbound side and the `send_*` family on
//! the outbound side; it spawns no tasks and takes no locks. A peer is not
//! thread-safe — drive it from a single task (see `connection`).
//!
//! Outbound sends that fail roll back every capability-table side effect
//! they performed, so a failed send leaves the tables exactly as they were.

use std::collections::HashMap;
use std::rc::Rc;

use crate::cap_table::{CapEffects, CapTable, InboundCaps, OutboundCap, ResolvedCap};
use crate::codec::{self, MessageTag, TransformOps};
use crate::error::Error;
use crate::rpc_capnp;

/// Remote-chosen third-party answer ids live in this half-space.
pub const THIRD_PARTY_ANSWER_BASE: u32 = 0x4000_0000;

/// Loopback answer ids are internal only and never appear on the wire, so
/// they are allocated above everything a remote can legitimately choose.
const LOOPBACK_ANSWER_BASE: u32 = 0x8000_0000;

/// Our own question ids stay below the third-party half-space.
const QUESTION_ID_LIMIT: u32 = THIRD_PARTY_ANSWER_BASE;

// ─── Public collaborator traits ───────────────────────────────────────────────

/// The byte transport a peer writes frames to. `send_frame` is a non-blocking
/// enqueue and must not retain `bytes` past the call.
pub trait Transport {
    fn send_frame(&self, bytes: &[u8]) -> Result<(), Error>;
    fn is_closing(&self) -> bool;
    fn close(&self);
}

/// A locally hosted capability. The handler is invoked synchronously for each
/// inbound call and must eventually answer via `send_return_results` or
/// `send_return_exception` for `call.answer_id` (or complete through another
/// path when the caller redirected the results). Returning an error without
/// having answered makes the peer synthesize an exception Return carrying the
/// error's display text.
pub trait CallHandler {
    fn call(&self, peer: &mut Peer, call: &mut InboundCall<'_>) -> Result<(), Error>;
}

/// One inbound call as seen by an export handler.
pub struct InboundCall<'a> {
    pub answer_id: u32,
    pub interface_id: u64,
    pub method_id: u16,
    /// Opaque params content; capability references in it are indices into
    /// `caps` by convention.
    pub content: capnp::any_pointer::Reader<'a>,
    pub caps: InboundCaps,
}

/// Results payload delivered to a return callback.
pub struct ResultsReader<'a> {
    pub content: capnp::any_pointer::Reader<'a>,
    pub caps: &'a mut InboundCaps,
}

/// What a question's callback receives when its Return arrives.
pub enum ReturnOutcome<'a> {
    Results(ResultsReader<'a>),
    Exception { reason: String },
    Canceled,
    /// The results are those of another question (tail-call chain); the id
    /// has already been translated through the forwarding tables.
    TakenFromOtherQuestion { question_id: u32 },
}

pub type ReturnCallback = Box<dyn FnOnce(&mut Peer, u32, ReturnOutcome<'_>)>;

type SendOverride = Box<dyn FnMut(&[u8]) -> Result<(), Error>>;

/// Builder handed to `send_call`/`send_return_results` closures: fill in the
/// content pointer, register capabilities in order.
pub struct PayloadBuilder<'a, 'b> {
    payload: rpc_capnp::payload::Builder<'a>,
    caps: &'b mut Vec<OutboundCap>,
}

impl PayloadBuilder<'_, '_> {
    pub fn content(&mut self) -> capnp::any_pointer::Builder<'_> {
        self.payload.reborrow().get_content()
    }

    /// Register a capability; returns its cap-table index.
    pub fn add_cap(&mut self, cap: OutboundCap) -> u32 {
        self.caps.push(cap);
        (self.caps.len() - 1) as u32
    }
}

// ─── Table entries ────────────────────────────────────────────────────────────

pub(crate) struct Export {
    pub kind: ExportKind,
    pub ref_count: u32,
    pub is_bootstrap: bool,
}

pub(crate) enum ExportKind {
    Handler(Rc<dyn CallHandler>),
    Promise(PromiseState),
}

#[derive(Default)]
pub(crate) struct PromiseState {
    pub resolved_to: Option<u32>,
    pub broken: Option<String>,
    pub queued: Vec<QueuedCall>,
}

/// An inbound call parked on an unresolved promise export, kept as raw frame
/// bytes and replayed against the concrete export once the promise resolves.
pub(crate) struct QueuedCall {
    pub answer_id: u32,
    pub frame: Vec<u8>,
}

pub(crate) struct Question {
    pub on_return: Option<ReturnCallback>,
    pub is_loopback: bool,
    pub suppress_auto_finish: bool,
}

/// Where the results of an inbound call are supposed to go.
#[derive(Clone)]
pub(crate) enum ResultsMode {
    Caller,
    Yourself,
    /// Canonical bytes of the captured `sendResultsTo.thirdParty` pointer.
    ThirdParty(Option<Vec<u8>>),
    /// Internal answer for a locally dispatched (loopback) call.
    Loopback,
}

pub(crate) struct ForwardedQuestion {
    pub original_answer_id: u32,
    pub expect: ForwardExpect,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum ForwardExpect {
    /// Forwarded with `sendResultsTo.yourself`; a `resultsSentElsewhere`
    /// Return closes it.
    SentElsewhere,
    /// Forwarded with `sendResultsTo.thirdParty`; an `awaitFromThirdParty`
    /// Return is relayed to the original caller.
    ThirdParty,
}

pub(crate) struct ResolvedImport {
    #[allow(dead_code)]
    pub resolved: ResolvedCap,
    pub embargo_id: Option<u32>,
    pub embargoed: bool,
}

/// Outbound calls held back until a disembargo round-trip confirms ordering.
#[derive(Default)]
pub(crate) struct PendingEmbargo {
    pub import_id: u32,
    pub queued: Vec<PendingSend>,
}

pub(crate) struct PendingSend {
    pub question_id: u32,
    pub frame: Vec<u8>,
}

pub(crate) struct ProvideRecord {
    pub export_id: u32,
    pub recipient_key: Vec<u8>,
}

pub(crate) struct PendingAccept {
    pub provide_question_id: u32,
    pub export_id: u32,
}

pub(crate) struct JoinState {
    pub part_count: u16,
    /// part number → resolved export id
    pub parts: HashMap<u16, u32>,
    pub question_ids: Vec<u32>,
}

// ─── Peer ─────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct Peer {
    next_question_id: u32,
    next_export_id: u32,
    next_embargo_id: u32,
    next_loopback_id: u32,
    next_adopted_id: u32,

    pub(crate) exports: HashMap<u32, Export>,
    pub(crate) bootstrap_export: Option<u32>,
    pub(crate) questions: HashMap<u32, Question>,
    pub(crate) answers: HashMap<u32, ResultsMode>,
    pub(crate) cap_table: CapTable,

    /// Answer id → cached wire bytes of the results Return we produced, kept
    /// so pipelined calls can resolve cap descriptors against it.
    pub(crate) resolved_answers: HashMap<u32, Vec<u8>>,

    /// Forwarded question id → original inbound answer.
    pub(crate) forwarded_questions: HashMap<u32, ForwardedQuestion>,
    /// Inbound answer id → forwarded question id, so Finish propagates.
    pub(crate) forwarded_tail_questions: HashMap<u32, u32>,

    /// Promise import id → what it resolved to (plus embargo state).
    pub(crate) resolved_imports: HashMap<u32, ResolvedImport>,
    pub(crate) pending_embargoes: HashMap<u32, PendingEmbargo>,

    pub(crate) provides_by_question: HashMap<u32, ProvideRecord>,
    pub(crate) provides_by_key: HashMap<Vec<u8>, u32>,
    pub(crate) pending_accepts: HashMap<u32, PendingAccept>,
    /// Provide question id → accept question id blocked on its disembargo.
    pub(crate) pending_accepts_by_embargo: HashMap<u32, u32>,

    pub(crate) joins: HashMap<u32, JoinState>,
    /// Join question id → (join id, part number), for Finish cleanup.
    pub(crate) join_questions: HashMap<u32, (u32, u16)>,

    /// Canonical completion bytes → question awaiting a thirdPartyAnswer.
    pub(crate) pending_third_party_awaits: HashMap<Vec<u8>, u32>,
    /// Canonical completion bytes → adopted answer id that arrived first.
    pub(crate) pending_third_party_answers: HashMap<Vec<u8>, u32>,
    /// Adopted answer id → buffered terminal Return that arrived early.
    pub(crate) pending_third_party_returns: HashMap<u32, Vec<u8>>,
    /// Adopted answer id → original question id.
    pub(crate) adopted_third_party_answers: HashMap<u32, u32>,

    shutting_down: bool,
    on_shutdown: Option<Box<dyn FnOnce()>>,
    pub(crate) last_inbound_tag: Option<MessageTag>,
    pub(crate) last_remote_abort_reason: Option<String>,

    transport: Option<Box<dyn Transport>>,
    send_override: Option<SendOverride>,
    on_error: Option<Box<dyn Fn(&Error)>>,
    on_close: Option<Box<dyn FnOnce()>>,
}

impl Peer {
    /// A peer bound to a transport from the start.
    pub fn new(transport: Box<dyn Transport>) -> Self {
        let mut peer = Peer::new_detached();
        peer.transport = Some(transport);
        peer
    }

    /// A peer with no transport; attach one later or install a send override.
    pub fn new_detached() -> Self {
        Peer::default()
    }

    // ─── Transport binding ────────────────────────────────────────────

    pub fn attach_transport(&mut self, transport: Box<dyn Transport>) {
        self.transport = Some(transport);
    }

    pub fn detach_transport(&mut self) {
        self.transport = None;
    }

    pub fn has_attached_transport(&self) -> bool {
        self.transport.is_some()
    }

    /// Bypass the transport and hand every outbound frame to `f` instead.
    /// Tests use this to capture frames in memory.
    pub fn set_send_frame_override(&mut self, f: SendOverride) {
        self.send_override = Some(f);
    }

    pub fn clear_send_frame_override(&mut self) {
        self.send_override = None;
    }

    /// Register error/close observers; the connection driver feeds these.
    pub fn start(&mut self, on_error: Box<dyn Fn(&Error)>, on_close: Box<dyn FnOnce()>) {
        self.on_error = Some(on_error);
        self.on_close = Some(on_close);
    }

    pub(crate) fn notify_error(&self, err: &Error) {
        if let Some(on_error) = &self.on_error {
            on_error(err);
        }
    }

    pub(crate) fn notify_close(&mut self) {
        if let Some(on_close) = self.on_close.take() {
            on_close();
        }
    }

    /// Begin shutdown: new outbound calls are rejected, and once the
    /// questions table drains the transport is closed and `on_shutdown`
    /// fires. Fires immediately when nothing is outstanding.
    pub fn shutdown(&mut self, on_shutdown: Option<Box<dyn FnOnce()>>) {
        self.shutting_down = true;
        if let Some(cb) = on_shutdown {
            self.on_shutdown = Some(cb);
        }
        self.maybe_complete_shutdown();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    pub(crate) fn maybe_complete_shutdown(&mut self) {
        if !self.shutting_down || !self.questions.is_empty() {
            return;
        }
        if let Some(transport) = &self.transport {
            transport.close();
        }
        if let Some(cb) = self.on_shutdown.take() {
            cb();
        }
    }

    // ─── Observers ────────────────────────────────────────────────────

    pub fn last_inbound_tag(&self) -> Option<MessageTag> {
        self.last_inbound_tag
    }

    pub fn last_remote_abort_reason(&self) -> Option<&str> {
        self.last_remote_abort_reason.as_deref()
    }

    pub fn question_count(&self) -> usize {
        self.questions.len()
    }

    pub fn cap_table(&self) -> &CapTable {
        &self.cap_table
    }

    pub fn export_ref_count(&self, export_id: u32) -> Option<u32> {
        self.exports.get(&export_id).map(|e| e.ref_count)
    }

    pub fn has_export(&self, export_id: u32) -> bool {
        self.exports.contains_key(&export_id)
    }

    /// True while any third-party hand-off state is still in flight; all the
    /// adoption tables drain to empty at steady state.
    pub fn has_pending_third_party_state(&self) -> bool {
        !self.pending_third_party_awaits.is_empty()
            || !self.pending_third_party_answers.is_empty()
            || !self.pending_third_party_returns.is_empty()
            || !self.adopted_third_party_answers.is_empty()
    }

    // ─── Export lifecycle ─────────────────────────────────────────────

    /// Host a capability; the remote can reference it once a descriptor for
    /// it has been sent. Starts at refcount zero.
    pub fn add_export(&mut self, handler: Rc<dyn CallHandler>) -> u32 {
        let id = self.allocate_export_id();
        self.exports.insert(
            id,
            Export {
                kind: ExportKind::Handler(handler),
                ref_count: 0,
                is_bootstrap: false,
            },
        );
        id
    }

    /// Install the bootstrap capability. The bootstrap export survives
    /// Release even at refcount zero.
    pub fn set_bootstrap(&mut self, handler: Rc<dyn CallHandler>) -> u32 {
        let id = self.allocate_export_id();
        self.exports.insert(
            id,
            Export {
                kind: ExportKind::Handler(handler),
                ref_count: 0,
                is_bootstrap: true,
            },
        );
        self.bootstrap_export = Some(id);
        id
    }

    /// Host a promise that will later resolve to a concrete export. Calls
    /// targeting it queue until resolution.
    pub fn add_promise_export(&mut self) -> u32 {
        let id = self.allocate_export_id();
        self.exports.insert(
            id,
            Export {
                kind: ExportKind::Promise(PromiseState::default()),
                ref_count: 0,
                is_bootstrap: false,
            },
        );
        id
    }

    /// Resolve a promise export: emit a Resolve frame pointing at the
    /// concrete export, then replay every queued call against it, in arrival
    /// order.
    pub fn resolve_promise_export_to_export(
        &mut self,
        promise_id: u32,
        concrete_id: u32,
    ) -> Result<(), Error> {
        self.ensure_not_aborted()?;
        if !self.exports.contains_key(&concrete_id) {
            return Err(Error::UnknownExport(concrete_id));
        }
        {
            let export = self
                .exports
                .get_mut(&promise_id)
                .ok_or(Error::UnknownExport(promise_id))?;
            let ExportKind::Promise(promise) = &export.kind else {
                return Err(Error::MalformedMessage("export is not a promise"));
            };
            if promise.resolved_to.is_some() || promise.broken.is_some() {
                return Err(Error::MalformedMessage("promise already resolved"));
            }
        }

        // The Resolve frame carries a senderHosted descriptor, which the
        // remote observes like any other: one reference.
        self.bump_export_ref_plain(concrete_id)?;
        let frame = codec::build_resolve_sender_hosted(promise_id, concrete_id)?;
        if let Err(err) = self.send_frame(&frame) {
            self.unbump_export_ref(concrete_id);
            return Err(err);
        }

        let queued = {
            let export = self.exports.get_mut(&promise_id).expect("checked above");
            let ExportKind::Promise(promise) = &mut export.kind else {
                unreachable!("checked above");
            };
            promise.resolved_to = Some(concrete_id);
            std::mem::take(&mut promise.queued)
        };
        for call in queued {
            self.replay_queued_call(call, ResolvedCap::Exported { id: concrete_id });
        }
        Ok(())
    }

    /// Break a promise export: emit a Resolve exception and fail every
    /// queued call with the given reason.
    pub fn break_promise_export(&mut self, promise_id: u32, reason: &str) -> Result<(), Error> {
        self.ensure_not_aborted()?;
        {
            let export = self
                .exports
                .get_mut(&promise_id)
                .ok_or(Error::UnknownExport(promise_id))?;
            let ExportKind::Promise(promise) = &export.kind else {
                return Err(Error::MalformedMessage("export is not a promise"));
            };
            if promise.resolved_to.is_some() || promise.broken.is_some() {
                return Err(Error::MalformedMessage("promise already resolved"));
            }
        }
        let frame = codec::build_resolve_exception(promise_id, reason)?;
        self.send_frame(&frame)?;

        let queued = {
            let export = self.exports.get_mut(&promise_id).expect("checked above");
            let ExportKind::Promise(promise) = &mut export.kind else {
                unreachable!("checked above");
            };
            promise.broken = Some(reason.to_string());
            std::mem::take(&mut promise.queued)
        };
        let reason = reason.to_string();
        for call in queued {
            self.answers.entry(call.answer_id).or_insert(ResultsMode::Caller);
            if let Err(err) = self.send_return_exception(call.answer_id, &reason) {
                tracing::warn!(answer_id = call.answer_id, error = %err, "failed to fail queued call");
            }
        }
        Ok(())
    }

    // ─── Outbound calls ───────────────────────────────────────────────

    /// Bootstrap the remote's root capability.
    pub fn send_bootstrap(&mut self, on_return: ReturnCallback) -> Result<u32, Error> {
        self.ensure_may_call()?;
        let question_id = self.allocate_question_id();
        let frame = codec::build_bootstrap(question_id)?;
        self.send_frame(&frame)?;
        self.questions.insert(
            question_id,
            Question {
                on_return: Some(on_return),
                is_loopback: false,
                suppress_auto_finish: false,
            },
        );
        Ok(question_id)
    }

    /// Call a method on a remote capability we import.
    pub fn send_call<F>(
        &mut self,
        target_import_id: u32,
        interface_id: u64,
        method_id: u16,
        build_params: F,
        on_return: ReturnCallback,
    ) -> Result<u32, Error>
    where
        F: FnOnce(&mut PayloadBuilder<'_, '_>) -> Result<(), Error>,
    {
        self.send_wire_call(
            WireTarget::Import(target_import_id),
            interface_id,
            method_id,
            build_params,
            on_return,
        )
    }

    /// Call through an already resolved capability. Exported targets are
    /// dispatched locally (loopback: no wire frames, no Finish); `None`
    /// fails immediately.
    pub fn send_call_resolved<F>(
        &mut self,
        target: ResolvedCap,
        interface_id: u64,
        method_id: u16,
        build_params: F,
        on_return: ReturnCallback,
    ) -> Result<u32, Error>
    where
        F: FnOnce(&mut PayloadBuilder<'_, '_>) -> Result<(), Error>,
    {
        match target {
            ResolvedCap::None => Err(Error::CapabilityUnavailable),
            ResolvedCap::Imported { id } => {
                self.send_call(id, interface_id, method_id, build_params, on_return)
            }
            ResolvedCap::Promised { question_id, transform } => self.send_wire_call(
                WireTarget::Promised { question_id, ops: transform },
                interface_id,
                method_id,
                build_params,
                on_return,
            ),
            ResolvedCap::Exported { id } => {
                self.send_loopback_call(id, interface_id, method_id, build_params, on_return)
            }
        }
    }

    fn send_wire_call<F>(
        &mut self,
        target: WireTarget,
        interface_id: u64,
        method_id: u16,
        build_params: F,
        on_return: ReturnCallback,
    ) -> Result<u32, Error>
    where
        F: FnOnce(&mut PayloadBuilder<'_, '_>) -> Result<(), Error>,
    {
        self.ensure_may_call()?;
        let question_id = self.allocate_question_id();
        let mut effects = CapEffects::default();
        let frame = match self.build_call_frame(
            question_id,
            &target,
            interface_id,
            method_id,
            build_params,
            WireResultsTo::Caller,
            &mut effects,
        ) {
            Ok(frame) => frame,
            Err(err) => {
                self.rollback_effects(effects);
                return Err(err);
            }
        };

        // Ordering: a call that targets a freshly resolved import must not
        // overtake its disembargo round-trip.
        if let WireTarget::Import(import_id) = target {
            if let Some(embargo_id) = self.embargo_for_import(import_id) {
                self.pending_embargoes
                    .get_mut(&embargo_id)
                    .expect("embargo id maps to a pending entry")
                    .queued
                    .push(PendingSend { question_id, frame });
                self.questions.insert(
                    question_id,
                    Question {
                        on_return: Some(on_return),
                        is_loopback: false,
                        suppress_auto_finish: false,
                    },
                );
                return Ok(question_id);
            }
        }

        if let Err(err) = self.send_frame(&frame) {
            self.rollback_effects(effects);
            return Err(err);
        }
        self.questions.insert(
            question_id,
            Question {
                on_return: Some(on_return),
                is_loopback: false,
                suppress_auto_finish: false,
            },
        );
        Ok(question_id)
    }

    fn send_loopback_call<F>(
        &mut self,
        export_id: u32,
        interface_id: u64,
        method_id: u16,
        build_params: F,
        on_return: ReturnCallback,
    ) -> Result<u32, Error>
    where
        F: FnOnce(&mut PayloadBuilder<'_, '_>) -> Result<(), Error>,
    {
        self.ensure_may_call()?;
        if !self.exports.contains_key(&export_id) {
            return Err(Error::UnknownExport(export_id));
        }
        let question_id = self.allocate_loopback_id();
        let mut effects = CapEffects::default();
        let frame = match self.build_call_frame(
            question_id,
            &WireTarget::Import(export_id),
            interface_id,
            method_id,
            build_params,
            WireResultsTo::Caller,
            &mut effects,
        ) {
            Ok(frame) => frame,
            Err(err) => {
                self.rollback_effects(effects);
                return Err(err);
            }
        };
        // Nothing reaches the remote on the loopback path, so the encode's
        // refcount bumps are not remote-observed descriptors. Undo them.
        self.rollback_effects(effects);

        self.questions.insert(
            question_id,
            Question {
                on_return: Some(on_return),
                is_loopback: true,
                suppress_auto_finish: false,
            },
        );
        self.answers.insert(question_id, ResultsMode::Loopback);
        self.dispatch_local_frame(export_id, frame, question_id);
        Ok(question_id)
    }

    // ─── Outbound returns ─────────────────────────────────────────────

    /// Answer an inbound call with results. Where the results actually go
    /// depends on the call's `sendResultsTo` mode.
    pub fn send_return_results<F>(&mut self, answer_id: u32, build_results: F) -> Result<(), Error>
    where
        F: FnOnce(&mut PayloadBuilder<'_, '_>) -> Result<(), Error>,
    {
        let mode = self
            .answers
            .get(&answer_id)
            .cloned()
            .ok_or(Error::UnknownQuestion(answer_id))?;

        match mode {
            ResultsMode::Caller => {
                let mut effects = CapEffects::default();
                let frame =
                    match self.build_results_frame(answer_id, build_results, &mut effects) {
                        Ok(frame) => frame,
                        Err(err) => {
                            self.rollback_effects(effects);
                            return Err(err);
                        }
                    };
                if let Err(err) = self.send_frame(&frame) {
                    self.rollback_effects(effects);
                    return Err(err);
                }
                self.answers.remove(&answer_id);
                self.resolved_answers.insert(answer_id, frame);
                Ok(())
            }
            ResultsMode::Yourself => {
                // The caller takes these results through a question of its
                // own (`takeFromOtherQuestion`), so the payload stays here.
                let mut effects = CapEffects::default();
                let frame =
                    match self.build_results_frame(answer_id, build_results, &mut effects) {
                        Ok(frame) => frame,
                        Err(err) => {
                            self.rollback_effects(effects);
                            return Err(err);
                        }
                    };
                // Not sent, so not remote-observed.
                self.rollback_effects(effects);
                let elsewhere = codec::build_frame(|root| {
                    let mut ret = root.init_return();
                    ret.set_answer_id(answer_id);
                    ret.set_results_sent_elsewhere(());
                    Ok(())
                })?;
                self.send_frame(&elsewhere)?;
                self.answers.remove(&answer_id);
                self.resolved_answers.insert(answer_id, frame);
                Ok(())
            }
            ResultsMode::ThirdParty(completion) => {
                self.send_third_party_results(answer_id, completion, build_results)
            }
            ResultsMode::Loopback => self.send_loopback_results(answer_id, build_results),
        }
    }

    /// Answer an inbound call with an exception.
    pub fn send_return_exception(&mut self, answer_id: u32, reason: &str) -> Result<(), Error> {
        let mode = self
            .answers
            .get(&answer_id)
            .cloned()
            .ok_or(Error::UnknownQuestion(answer_id))?;

        if let ResultsMode::Loopback = mode {
            self.answers.remove(&answer_id);
            self.deliver_return_outcome(
                answer_id,
                ReturnOutcome::Exception {
                    reason: reason.to_string(),
                },
            );
            return Ok(());
        }

        let frame = codec::build_frame(|root| {
            let mut ret = root.init_return();
            ret.set_answer_id(answer_id);
            let mut exception = ret.init_exception();
            exception.set_reason(reason);
            exception.set_type(rpc_capnp::exception::Type::Failed);
            Ok(())
        })?;
        self.send_frame(&frame)?;
        self.answers.remove(&answer_id);
        Ok(())
    }

    /// Send an already serialized Return frame, updating answer-side state
    /// from its contents. Results frames enter the resolved-answer cache.
    pub fn send_prebuilt_return_frame(&mut self, frame: &[u8]) -> Result<(), Error> {
        let decoded = codec::DecodedMessage::new(frame)?;
        let root = decoded.root()?;
        let rpc_capnp::message::Which::Return(ret) = root.which()? else {
            return Err(Error::MalformedMessage("prebuilt frame is not a return"));
        };
        let ret = ret?;
        let answer_id = ret.get_answer_id();
        let is_results = matches!(ret.which()?, rpc_capnp::return_::Which::Results(_));
        self.send_frame(frame)?;
        self.answers.remove(&answer_id);
        if is_results {
            self.resolved_answers.insert(answer_id, frame.to_vec());
        }
        Ok(())
    }

    // ─── Host-side release / finish ───────────────────────────────────

    /// Explicitly drop references the host retained on an import.
    pub fn send_release_for_host(&mut self, import_id: u32, refs: u32) -> Result<(), Error> {
        if refs == 0 {
            return Ok(());
        }
        let dropped = self.cap_table.release_import(import_id, refs);
        if dropped == 0 {
            return Ok(());
        }
        let frame = codec::build_release(import_id, dropped)?;
        self.send_frame(&frame)
    }

    /// Send an early Finish (cancellation). The question entry is retained
    /// (with auto-Finish suppressed) until the Return arrives; the Return is
    /// still delivered to the callback.
    pub fn send_finish_for_host(
        &mut self,
        question_id: u32,
        release_result_caps: bool,
        require_early_cancellation: bool,
    ) -> Result<(), Error> {
        let question = self
            .questions
            .get_mut(&question_id)
            .ok_or(Error::UnknownQuestion(question_id))?;
        question.suppress_auto_finish = true;
        let frame =
            codec::build_finish(question_id, release_result_caps, require_early_cancellation)?;
        self.send_frame(&frame)
    }

    // ─── Frame building (calls and results) ───────────────────────────

    pub(crate) fn build_call_frame<F>(
        &mut self,
        question_id: u32,
        target: &WireTarget,
        interface_id: u64,
        method_id: u16,
        build_params: F,
        results_to: WireResultsTo<'_>,
        effects: &mut CapEffects,
    ) -> Result<Vec<u8>, Error>
    where
        F: FnOnce(&mut PayloadBuilder<'_, '_>) -> Result<(), Error>,
    {
        let mut message = capnp::message::Builder::new_default();
        {
            let root = message.init_root::<rpc_capnp::message::Builder>();
            let mut call = root.init_call();
            call.set_question_id(question_id);
            call.set_interface_id(interface_id);
            call.set_method_id(method_id);
            match target {
                WireTarget::Import(id) => {
                    call.reborrow().init_target().set_imported_cap(*id);
                }
                WireTarget::Promised { question_id, ops } => {
                    let promised = call.reborrow().init_target().init_promised_answer();
                    codec::write_transform(promised, *question_id, ops);
                }
            }
            match results_to {
                WireResultsTo::Caller => {
                    call.reborrow().get_send_results_to().set_caller(());
                }
                WireResultsTo::Yourself => {
                    call.reborrow().get_send_results_to().set_yourself(());
                }
                WireResultsTo::ThirdParty(bytes) => {
                    let decoded = codec::decode_pointer_bytes(bytes)?;
                    let mut pointer =
                        call.reborrow().get_send_results_to().init_third_party();
                    pointer.set_as(decoded.root_pointer()?)?;
                }
            }
            let mut payload = call.init_params();
            let mut caps: Vec<OutboundCap> = Vec::new();
            {
                let mut builder = PayloadBuilder {
                    payload: payload.reborrow(),
                    caps: &mut caps,
                };
                build_params(&mut builder)?;
            }
            self.encode_payload_caps(&mut payload, &caps, effects)?;
        }
        Ok(capnp::serialize::write_message_to_words(&message))
    }

    pub(crate) fn build_results_frame<F>(
        &mut self,
        answer_id: u32,
        build_results: F,
        effects: &mut CapEffects,
    ) -> Result<Vec<u8>, Error>
    where
        F: FnOnce(&mut PayloadBuilder<'_, '_>) -> Result<(), Error>,
    {
        let mut message = capnp::message::Builder::new_default();
        {
            let root = message.init_root::<rpc_capnp::message::Builder>();
            let mut ret = root.init_return();
            ret.set_answer_id(answer_id);
            let mut payload = ret.init_results();
            let mut caps: Vec<OutboundCap> = Vec::new();
            {
                let mut builder = PayloadBuilder {
                    payload: payload.reborrow(),
                    caps: &mut caps,
                };
                build_results(&mut builder)?;
            }
            self.encode_payload_caps(&mut payload, &caps, effects)?;
        }
        Ok(capnp::serialize::write_message_to_words(&message))
    }

    /// A results Return whose cap table is a single sender-hosted descriptor
    /// (bootstrap answers, accept answers, join answers).
    pub(crate) fn build_single_cap_results_frame(
        &mut self,
        answer_id: u32,
        export_id: u32,
        effects: &mut CapEffects,
    ) -> Result<Vec<u8>, Error> {
        self.build_results_frame(
            answer_id,
            |results| {
                results.add_cap(OutboundCap::Exported(export_id));
                Ok(())
            },
            effects,
        )
    }

    /// Answer a question with a single capability, caching the frame for
    /// pipelined calls. Rolls back refcounts on send failure.
    pub(crate) fn send_single_cap_results(
        &mut self,
        answer_id: u32,
        export_id: u32,
    ) -> Result<(), Error> {
        let mut effects = CapEffects::default();
        let frame = match self.build_single_cap_results_frame(answer_id, export_id, &mut effects) {
            Ok(frame) => frame,
            Err(err) => {
                self.rollback_effects(effects);
                return Err(err);
            }
        };
        if let Err(err) = self.send_frame(&frame) {
            self.rollback_effects(effects);
            return Err(err);
        }
        self.answers.remove(&answer_id);
        self.resolved_answers.insert(answer_id, frame);
        Ok(())
    }

    fn encode_payload_caps(
        &mut self,
        payload: &mut rpc_capnp::payload::Builder<'_>,
        caps: &[OutboundCap],
        effects: &mut CapEffects,
    ) -> Result<(), Error> {
        if caps.is_empty() {
            return Ok(());
        }
        let mut table = payload.reborrow().init_cap_table(caps.len() as u32);
        for (index, cap) in caps.iter().enumerate() {
            let descriptor = table.reborrow().get(index as u32);
            self.encode_descriptor(descriptor, cap, effects)?;
        }
        Ok(())
    }

    pub(crate) fn encode_descriptor(
        &mut self,
        mut descriptor: rpc_capnp::cap_descriptor::Builder<'_>,
        cap: &OutboundCap,
        effects: &mut CapEffects,
    ) -> Result<(), Error> {
        match cap {
            OutboundCap::None => descriptor.set_none(()),
            OutboundCap::Imported(id) => descriptor.set_receiver_hosted(*id),
            OutboundCap::Exported(id) => {
                let export = self.exports.get(id).ok_or(Error::UnknownExport(*id))?;
                match &export.kind {
                    ExportKind::Promise(promise) => match promise.resolved_to {
                        Some(concrete) => {
                            self.bump_export_ref(concrete, effects)?;
                            descriptor.set_sender_hosted(concrete);
                        }
                        None => {
                            self.bump_export_ref(*id, effects)?;
                            descriptor.set_sender_promise(*id);
                        }
                    },
                    ExportKind::Handler(_) => {
                        self.bump_export_ref(*id, effects)?;
                        descriptor.set_sender_hosted(*id);
                    }
                }
            }
            OutboundCap::Promised { question_id, transform } => {
                let local = self.cap_table.note_receiver_answer(*question_id, transform);
                effects.receiver_answers.push(local);
                let promised = descriptor.init_receiver_answer();
                codec::write_transform(promised, *question_id, transform);
            }
        }
        Ok(())
    }

    // ─── Refcount plumbing ────────────────────────────────────────────

    fn bump_export_ref(&mut self, id: u32, effects: &mut CapEffects) -> Result<(), Error> {
        self.bump_export_ref_plain(id)?;
        effects.export_refs.push(id);
        Ok(())
    }

    pub(crate) fn bump_export_ref_plain(&mut self, id: u32) -> Result<(), Error> {
        let export = self.exports.get_mut(&id).ok_or(Error::UnknownExport(id))?;
        export.ref_count += 1;
        Ok(())
    }

    fn unbump_export_ref(&mut self, id: u32) {
        if let Some(export) = self.exports.get_mut(&id) {
            export.ref_count = export.ref_count.saturating_sub(1);
        }
    }

    /// Remote-driven release: decrement and drop the export at zero, unless
    /// it is the bootstrap export.
    pub(crate) fn release_export_refs(&mut self, id: u32, count: u32) {
        let Some(export) = self.exports.get_mut(&id) else {
            return;
        };
        export.ref_count -= count.min(export.ref_count);
        if export.ref_count == 0 && !export.is_bootstrap {
            self.exports.remove(&id);
        }
    }

    pub(crate) fn rollback_effects(&mut self, effects: CapEffects) {
        if effects.is_empty() {
            return;
        }
        for id in effects.export_refs {
            self.unbump_export_ref(id);
        }
        for local in effects.receiver_answers {
            self.cap_table.forget_receiver_answer(local);
        }
    }

    // ─── Sending ──────────────────────────────────────────────────────

    pub(crate) fn send_frame(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if let Some(send) = self.send_override.as_mut() {
            return send(bytes);
        }
        match &self.transport {
            Some(transport) => transport.send_frame(bytes),
            None => Err(Error::TransportNotAttached),
        }
    }

    /// Send an abort frame for a protocol breach and hand the error back.
    pub(crate) fn abort_with(&mut self, err: Error) -> Error {
        match codec::build_abort(&err.to_string()) {
            Ok(frame) => {
                if let Err(send_err) = self.send_frame(&frame) {
                    tracing::warn!(error = %send_err, "failed to send abort frame");
                }
            }
            Err(build_err) => {
                tracing::warn!(error = %build_err, "failed to build abort frame");
            }
        }
        err
    }

    pub(crate) fn ensure_not_aborted(&self) -> Result<(), Error> {
        if let Some(reason) = &self.last_remote_abort_reason {
            return Err(Error::RemoteAbort(reason.clone()));
        }
        Ok(())
    }

    fn ensure_may_call(&self) -> Result<(), Error> {
        self.ensure_not_aborted()?;
        if self.shutting_down {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    // ─── Return delivery ──────────────────────────────────────────────

    /// Remove the question, run its callback, emit the auto-Finish.
    pub(crate) fn deliver_return_outcome(&mut self, question_id: u32, outcome: ReturnOutcome<'_>) {
        let Some(mut question) = self.questions.remove(&question_id) else {
            tracing::warn!(question_id, "return for unknown question dropped");
            return;
        };
        if let Some(callback) = question.on_return.take() {
            callback(self, question_id, outcome);
        }
        // Receiver-answer descriptors that pointed at this question are now
        // stale on both sides.
        self.cap_table.clear_receiver_answers_for(question_id);
        if !question.is_loopback && !question.suppress_auto_finish {
            match codec::build_finish(question_id, true, false) {
                Ok(frame) => {
                    if let Err(err) = self.send_frame(&frame) {
                        tracing::warn!(question_id, error = %err, "auto-finish send failed");
                    }
                }
                Err(err) => {
                    tracing::warn!(question_id, error = %err, "auto-finish build failed");
                }
            }
        }
        self.maybe_complete_shutdown();
    }

    /// Fail a question locally with an exception outcome (no wire traffic).
    pub(crate) fn fail_question(&mut self, question_id: u32, reason: &str) {
        if let Some(question) = self.questions.get_mut(&question_id) {
            // No Return will arrive; nothing to auto-finish.
            question.suppress_auto_finish = true;
        }
        self.deliver_return_outcome(
            question_id,
            ReturnOutcome::Exception {
                reason: reason.to_string(),
            },
        );
    }

    // ─── Embargo plumbing ─────────────────────────────────────────────

    pub(crate) fn allocate_embargo_id(&mut self) -> u32 {
        loop {
            let candidate = self.next_embargo_id;
            self.next_embargo_id = self.next_embargo_id.wrapping_add(1);
            if !self.pending_embargoes.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    fn embargo_for_import(&self, import_id: u32) -> Option<u32> {
        let resolved = self.resolved_imports.get(&import_id)?;
        if resolved.embargoed {
            resolved.embargo_id
        } else {
            None
        }
    }

    /// Disembargo ack: flush every call queued behind the embargo, in order.
    pub(crate) fn lift_embargo(&mut self, embargo_id: u32) {
        let Some(pending) = self.pending_embargoes.remove(&embargo_id) else {
            tracing::warn!(embargo_id, "disembargo ack for unknown embargo");
            return;
        };
        if let Some(resolved) = self.resolved_imports.get_mut(&pending.import_id) {
            resolved.embargoed = false;
        }
        for send in pending.queued {
            if let Err(err) = self.send_frame(&send.frame) {
                tracing::warn!(
                    question_id = send.question_id,
                    error = %err,
                    "flushing embargoed call failed"
                );
                self.fail_question(send.question_id, &err.to_string());
            }
        }
    }

    // ─── Id allocation ────────────────────────────────────────────────

    pub(crate) fn allocate_question_id(&mut self) -> u32 {
        loop {
            let candidate = self.next_question_id;
            self.next_question_id = (self.next_question_id + 1) % QUESTION_ID_LIMIT;
            if !self.questions.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    fn allocate_export_id(&mut self) -> u32 {
        loop {
            let candidate = self.next_export_id;
            self.next_export_id = self.next_export_id.wrapping_add(1);
            if !self.exports.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    fn allocate_loopback_id(&mut self) -> u32 {
        loop {
            let candidate = LOOPBACK_ANSWER_BASE + (self.next_loopback_id & 0x7fff_ffff);
            self.next_loopback_id = self.next_loopback_id.wrapping_add(1);
            if !self.questions.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    pub(crate) fn allocate_adopted_answer_id(&mut self) -> u32 {
        loop {
            let candidate = THIRD_PARTY_ANSWER_BASE + (self.next_adopted_id & 0x3fff_ffff);
            self.next_adopted_id = self.next_adopted_id.wrapping_add(1);
            if !self.resolved_answers.contains_key(&candidate)
                && !self.answers.contains_key(&candidate)
            {
                return candidate;
            }
        }
    }
}

/// Wire rendering of a call target.
pub(crate) enum WireTarget {
    Import(u32),
    Promised { question_id: u32, ops: TransformOps },
}

/// Wire rendering of `sendResultsTo`.
pub(crate) enum WireResultsTo<'a> {
    Caller,
    Yourself,
    ThirdParty(&'a [u8]),
}
