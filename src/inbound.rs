//! Inbound frame dispatch.
//!
//! `handle_frame` is the peer's single entry point for bytes off the wire.
//! Each handler runs to completion before the next frame is processed;
//! outbound frames produced along the way are enqueued in order.

use crate::cap_table::{CapEffects, InboundCaps, ResolvedCap};
use crate::codec::{self, DecodedMessage};
use crate::error::Error;
use crate::peer::{
    ExportKind, ForwardExpect, ForwardedQuestion, Peer, QueuedCall, ResultsMode, ResultsReader,
    ReturnOutcome, WireResultsTo, WireTarget, THIRD_PARTY_ANSWER_BASE,
};
use crate::rpc_capnp;

use std::collections::HashMap;
use std::rc::Rc;

/// Where an inbound call target landed after resolution.
pub(crate) enum TargetResolution {
    Cap(ResolvedCap),
    /// Park the call on this unresolved promise export.
    Queue(u32),
}

impl Peer {
    /// Process one complete inbound frame.
    ///
    /// Returns `RemoteAbort` when the frame is an abort (the connection is
    /// dead afterwards); protocol breaches send an abort to the remote and
    /// surface here as the matching error.
    pub fn handle_frame(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.ensure_not_aborted()?;
        let decoded = DecodedMessage::new(bytes)?;
        let root = decoded.root()?;

        use rpc_capnp::message::Which;
        let which = match root.which() {
            Ok(which) => which,
            Err(capnp::NotInSchema(tag)) => {
                // Unknown discriminant: reply unimplemented, touch nothing.
                tracing::debug!(tag, "echoing unknown message tag as unimplemented");
                let reply = codec::build_unimplemented_echo(root)?;
                return self.send_frame(&reply);
            }
        };

        self.last_inbound_tag = Some(decoded.tag()?);
        match which {
            Which::Unimplemented(inner) => self.handle_unimplemented(inner?),
            Which::Abort(exception) => {
                let reason = codec::text_to_string(exception?.get_reason()?);
                tracing::warn!(reason = %reason, "remote aborted the connection");
                self.last_remote_abort_reason = Some(reason.clone());
                Err(Error::RemoteAbort(reason))
            }
            Which::Call(call) => self.handle_call(call?, bytes),
            Which::Return(ret) => self.handle_return(ret?, bytes),
            Which::Finish(finish) => self.handle_finish(finish?),
            Which::Resolve(resolve) => self.handle_resolve(resolve?),
            Which::Release(release) => {
                let release = release?;
                self.release_export_refs(release.get_id(), release.get_reference_count());
                Ok(())
            }
            Which::Bootstrap(bootstrap) => self.handle_bootstrap(bootstrap?),
            Which::ObsoleteSave(_) | Which::ObsoleteDelete(_) => {
                let reply = codec::build_unimplemented_echo(root)?;
                self.send_frame(&reply)
            }
            Which::Provide(provide) => self.handle_provide(provide?),
            Which::Accept(accept) => self.handle_accept(accept?),
            Which::Join(join) => self.handle_join(join?),
            Which::Disembargo(disembargo) => self.handle_disembargo(disembargo?),
            Which::ThirdPartyAnswer(answer) => self.handle_third_party_answer(answer?),
        }
    }

    // ─── Call path ────────────────────────────────────────────────────

    fn handle_call(
        &mut self,
        call: rpc_capnp::call::Reader<'_>,
        frame: &[u8],
    ) -> Result<(), Error> {
        let answer_id = call.get_question_id();
        tracing::trace!(
            answer_id,
            interface_id = call.get_interface_id(),
            method_id = call.get_method_id(),
            "inbound call"
        );

        let mode = self.note_call_send_results(&call)?;
        self.answers.insert(answer_id, mode);

        if !call.has_target() {
            return Err(self.abort_with(Error::MissingCallTarget));
        }
        let resolution = match call.get_target()?.which()? {
            rpc_capnp::message_target::Which::ImportedCap(id) => {
                TargetResolution::Cap(ResolvedCap::Exported { id })
            }
            rpc_capnp::message_target::Which::PromisedAnswer(promised) => {
                let Ok(promised) = promised else {
                    return Err(self.abort_with(Error::MissingPromisedAnswer));
                };
                let ops = codec::decode_transform(promised)?;
                match self.resolve_promised_target(promised.get_question_id(), &ops) {
                    Ok(resolution) => resolution,
                    Err(err) => return Err(self.abort_with(err)),
                }
            }
        };

        match resolution {
            TargetResolution::Cap(cap) => self.dispatch_resolved_call(cap, call, frame, answer_id),
            TargetResolution::Queue(promise_id) => {
                self.queue_call_on_promise(promise_id, answer_id, frame);
                Ok(())
            }
        }
    }

    /// Record where this call wants its results sent; `caller` is a no-op.
    fn note_call_send_results(
        &mut self,
        call: &rpc_capnp::call::Reader<'_>,
    ) -> Result<ResultsMode, Error> {
        use rpc_capnp::call::send_results_to::Which;
        Ok(match call.get_send_results_to().which()? {
            Which::Caller(()) => ResultsMode::Caller,
            Which::Yourself(()) => ResultsMode::Yourself,
            Which::ThirdParty(pointer) => {
                if pointer.is_null() {
                    ResultsMode::ThirdParty(None)
                } else {
                    ResultsMode::ThirdParty(Some(codec::canonical_pointer_bytes(pointer)?))
                }
            }
        })
    }

    /// Resolve a promisedAnswer target through the resolved-answer cache.
    pub(crate) fn resolve_promised_target(
        &mut self,
        answer_id: u32,
        ops: &[u16],
    ) -> Result<TargetResolution, Error> {
        // The referenced answer may itself still be parked on a promise;
        // pipelined calls on it park behind it.
        if let Some(promise_id) = self.find_promise_holding_answer(answer_id) {
            return Ok(TargetResolution::Queue(promise_id));
        }

        let decoded = match self.resolved_answers.get(&answer_id) {
            Some(frame) => DecodedMessage::new(frame)?,
            None => return Err(Error::PromisedAnswerMissing(answer_id)),
        };
        let root = decoded.root()?;
        let rpc_capnp::message::Which::Return(ret) = root.which()? else {
            return Err(Error::PromisedAnswerMissing(answer_id));
        };
        let rpc_capnp::return_::Which::Results(payload) = ret?.which()? else {
            return Err(Error::PromisedAnswerMissing(answer_id));
        };
        let table = payload?.get_cap_table()?;
        let index = ops.last().copied().unwrap_or(0) as u32;
        if index >= table.len() {
            return Err(Error::PromisedAnswerMissing(answer_id));
        }

        use rpc_capnp::cap_descriptor::Which;
        Ok(TargetResolution::Cap(match table.get(index).which()? {
            Which::None(()) => ResolvedCap::None,
            Which::SenderHosted(id) | Which::SenderPromise(id) => ResolvedCap::Exported { id },
            Which::ReceiverHosted(id) => ResolvedCap::Imported { id },
            Which::ReceiverAnswer(promised) => {
                let promised = promised?;
                ResolvedCap::Promised {
                    question_id: promised.get_question_id(),
                    transform: codec::decode_transform(promised)?,
                }
            }
            Which::ThirdPartyHosted(third) => ResolvedCap::Imported {
                id: third?.get_vine_id(),
            },
        }))
    }

    fn find_promise_holding_answer(&self, answer_id: u32) -> Option<u32> {
        self.exports.iter().find_map(|(id, export)| match &export.kind {
            ExportKind::Promise(promise)
                if promise.queued.iter().any(|q| q.answer_id == answer_id) =>
            {
                Some(*id)
            }
            _ => None,
        })
    }

    fn queue_call_on_promise(&mut self, promise_id: u32, answer_id: u32, frame: &[u8]) {
        if let Some(export) = self.exports.get_mut(&promise_id) {
            if let ExportKind::Promise(promise) = &mut export.kind {
                promise.queued.push(QueuedCall {
                    answer_id,
                    frame: frame.to_vec(),
                });
                return;
            }
        }
        tracing::warn!(promise_id, answer_id, "queue target is not a promise export");
    }

    pub(crate) fn dispatch_resolved_call(
        &mut self,
        cap: ResolvedCap,
        call: rpc_capnp::call::Reader<'_>,
        frame: &[u8],
        answer_id: u32,
    ) -> Result<(), Error> {
        match cap {
            ResolvedCap::None => self.send_return_exception(answer_id, "null capability"),
            ResolvedCap::Exported { id } => {
                enum Decision {
                    Missing,
                    Queue,
                    Broken(String),
                    Redirect(u32),
                    Invoke(Rc<dyn crate::peer::CallHandler>),
                }
                let decision = match self.exports.get(&id) {
                    None => Decision::Missing,
                    Some(export) => match &export.kind {
                        ExportKind::Handler(handler) => Decision::Invoke(handler.clone()),
                        ExportKind::Promise(promise) => {
                            if let Some(concrete) = promise.resolved_to {
                                Decision::Redirect(concrete)
                            } else if let Some(reason) = &promise.broken {
                                Decision::Broken(reason.clone())
                            } else {
                                Decision::Queue
                            }
                        }
                    },
                };
                match decision {
                    Decision::Missing => self.send_return_exception(answer_id, "no such capability"),
                    Decision::Broken(reason) => self.send_return_exception(answer_id, &reason),
                    Decision::Queue => {
                        self.queue_call_on_promise(id, answer_id, frame);
                        Ok(())
                    }
                    Decision::Redirect(concrete) => self.dispatch_resolved_call(
                        ResolvedCap::Exported { id: concrete },
                        call,
                        frame,
                        answer_id,
                    ),
                    Decision::Invoke(handler) => self.invoke_export_handler(handler, call, answer_id),
                }
            }
            ResolvedCap::Imported { id } => {
                self.forward_call(WireTarget::Import(id), call, answer_id)
            }
            ResolvedCap::Promised { question_id, transform } => self.forward_call(
                WireTarget::Promised {
                    question_id,
                    ops: transform,
                },
                call,
                answer_id,
            ),
        }
    }

    fn invoke_export_handler(
        &mut self,
        handler: Rc<dyn crate::peer::CallHandler>,
        call: rpc_capnp::call::Reader<'_>,
        answer_id: u32,
    ) -> Result<(), Error> {
        let loopback = matches!(self.answers.get(&answer_id), Some(ResultsMode::Loopback));
        let payload = call.get_params()?;
        let caps = self.resolve_inbound_caps(payload.get_cap_table()?, loopback)?;
        let mut inbound = crate::peer::InboundCall {
            answer_id,
            interface_id: call.get_interface_id(),
            method_id: call.get_method_id(),
            content: payload.get_content(),
            caps,
        };
        let result = handler.call(self, &mut inbound);
        if !loopback {
            let releases = inbound.caps.unretained_import_counts();
            self.flush_inbound_releases(releases);
        }
        if let Err(err) = result {
            // Handler failed without answering: answer for it.
            if self.answers.contains_key(&answer_id) {
                let reason = err.to_string();
                tracing::debug!(answer_id, reason = %reason, "export handler failed");
                if let Err(send_err) = self.send_return_exception(answer_id, &reason) {
                    tracing::warn!(answer_id, error = %send_err, "failed to answer for failed handler");
                }
            }
        }
        Ok(())
    }

    /// Resolve an inbound cap-descriptor list to local handles. `local` is
    /// set when the frame was produced by this peer (loopback dispatch,
    /// stored tail-call results): sender/receiver roles flip and no import
    /// references are taken.
    pub(crate) fn resolve_inbound_caps(
        &mut self,
        table: capnp::struct_list::Reader<'_, rpc_capnp::cap_descriptor::Owned>,
        local: bool,
    ) -> Result<InboundCaps, Error> {
        use rpc_capnp::cap_descriptor::Which;
        let mut entries = Vec::with_capacity(table.len() as usize);
        for descriptor in table.iter() {
            entries.push(match descriptor.which()? {
                Which::None(()) => ResolvedCap::None,
                Which::SenderHosted(id) | Which::SenderPromise(id) => {
                    if local {
                        ResolvedCap::Exported { id }
                    } else {
                        self.cap_table.note_import(id);
                        ResolvedCap::Imported { id }
                    }
                }
                Which::ReceiverHosted(id) => {
                    if local {
                        // Our own frame: the receiver is the remote, so this
                        // names one of our imports. No refcount change when
                        // reading back what we wrote.
                        ResolvedCap::Imported { id }
                    } else {
                        ResolvedCap::Exported { id }
                    }
                }
                Which::ReceiverAnswer(promised) => {
                    let promised = promised?;
                    ResolvedCap::Promised {
                        question_id: promised.get_question_id(),
                        transform: codec::decode_transform(promised)?,
                    }
                }
                Which::ThirdPartyHosted(third) => {
                    let id = third?.get_vine_id();
                    if !local {
                        self.cap_table.note_import(id);
                    }
                    ResolvedCap::Imported { id }
                }
            });
        }
        Ok(InboundCaps::new(entries))
    }

    /// One batched Release per import id for everything unretained.
    pub(crate) fn flush_inbound_releases(&mut self, counts: HashMap<u32, u32>) {
        for (id, count) in counts {
            let dropped = self.cap_table.release_import(id, count);
            if dropped == 0 {
                continue;
            }
            match codec::build_release(id, dropped) {
                Ok(frame) => {
                    if let Err(err) = self.send_frame(&frame) {
                        tracing::warn!(import_id = id, error = %err, "release send failed");
                    }
                }
                Err(err) => {
                    tracing::warn!(import_id = id, error = %err, "release build failed");
                }
            }
        }
    }

    // ─── Forwarding ───────────────────────────────────────────────────

    /// The inbound call's target lives upstream: re-emit it under a new
    /// question and splice the answers together.
    fn forward_call(
        &mut self,
        target: WireTarget,
        call: rpc_capnp::call::Reader<'_>,
        answer_id: u32,
    ) -> Result<(), Error> {
        let mode = self
            .answers
            .get(&answer_id)
            .cloned()
            .unwrap_or(ResultsMode::Caller);

        let payload = call.get_params()?;
        let inbound = self.resolve_inbound_caps(payload.get_cap_table()?, false)?;
        let forwarded_qid = self.allocate_question_id();

        let third_party_bytes;
        let results_to = match &mode {
            ResultsMode::Caller | ResultsMode::Yourself | ResultsMode::Loopback => {
                WireResultsTo::Yourself
            }
            ResultsMode::ThirdParty(Some(bytes)) => {
                third_party_bytes = bytes.clone();
                WireResultsTo::ThirdParty(&third_party_bytes)
            }
            ResultsMode::ThirdParty(None) => {
                return Err(self.abort_with(Error::MissingThirdPartyPayload));
            }
        };

        let mut effects = CapEffects::default();
        let frame = match self.build_forward_frame(
            forwarded_qid,
            &target,
            call,
            &inbound,
            results_to,
            &mut effects,
        ) {
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

        // Nothing here retains the params caps once the forward is out.
        let releases = inbound.unretained_import_counts();
        self.flush_inbound_releases(releases);

        let expect = match &mode {
            ResultsMode::ThirdParty(_) => ForwardExpect::ThirdParty,
            _ => ForwardExpect::SentElsewhere,
        };
        self.forwarded_questions.insert(
            forwarded_qid,
            ForwardedQuestion {
                original_answer_id: answer_id,
                expect,
            },
        );

        if matches!(mode, ResultsMode::Caller) {
            // Tail call: tell the caller to pick the results up from the
            // question we just sent it.
            self.forwarded_tail_questions.insert(answer_id, forwarded_qid);
            let take = codec::build_frame(|root| {
                let mut ret = root.init_return();
                ret.set_answer_id(answer_id);
                ret.set_take_from_other_question(forwarded_qid);
                Ok(())
            })?;
            self.send_frame(&take)?;
            self.answers.remove(&answer_id);
        }
        Ok(())
    }

    fn build_forward_frame(
        &mut self,
        question_id: u32,
        target: &WireTarget,
        call: rpc_capnp::call::Reader<'_>,
        inbound: &InboundCaps,
        results_to: WireResultsTo<'_>,
        effects: &mut CapEffects,
    ) -> Result<Vec<u8>, Error> {
        use crate::cap_table::OutboundCap;

        // Entry order is preserved, so content-held cap indices stay valid.
        let mut outbound: Vec<OutboundCap> = Vec::with_capacity(inbound.len());
        for cap in inbound.entries() {
            outbound.push(match cap {
                ResolvedCap::None => OutboundCap::None,
                ResolvedCap::Exported { id } => OutboundCap::Exported(*id),
                ResolvedCap::Imported { id } => OutboundCap::Imported(*id),
                ResolvedCap::Promised { question_id, transform } => {
                    self.promised_cap_to_outbound(*question_id, transform)
                }
            });
        }

        let mut message = capnp::message::Builder::new_default();
        {
            let root = message.init_root::<rpc_capnp::message::Builder>();
            let mut fcall = root.init_call();
            fcall.set_question_id(question_id);
            fcall.set_interface_id(call.get_interface_id());
            fcall.set_method_id(call.get_method_id());
            match target {
                WireTarget::Import(id) => {
                    fcall.reborrow().init_target().set_imported_cap(*id);
                }
                WireTarget::Promised { question_id, ops } => {
                    let promised = fcall.reborrow().init_target().init_promised_answer();
                    codec::write_transform(promised, *question_id, ops);
                }
            }
            match results_to {
                WireResultsTo::Caller => fcall.reborrow().get_send_results_to().set_caller(()),
                WireResultsTo::Yourself => fcall.reborrow().get_send_results_to().set_yourself(()),
                WireResultsTo::ThirdParty(bytes) => {
                    let decoded = codec::decode_pointer_bytes(bytes)?;
                    let mut pointer = fcall.reborrow().get_send_results_to().init_third_party();
                    pointer.set_as(decoded.root_pointer()?)?;
                }
            }
            let mut payload = fcall.init_params();
            {
                let mut content = payload.reborrow().get_content();
                content.set_as(call.get_params()?.get_content())?;
            }
            if !outbound.is_empty() {
                let mut table = payload.reborrow().init_cap_table(outbound.len() as u32);
                for (index, cap) in outbound.iter().enumerate() {
                    let descriptor = table.reborrow().get(index as u32);
                    self.encode_descriptor(descriptor, cap, effects)?;
                }
            }
        }
        Ok(capnp::serialize::write_message_to_words(&message))
    }

    /// Re-express an inbound receiverAnswer cap (one of our own answers) for
    /// the peer we are forwarding to, by resolving it through the cache.
    fn promised_cap_to_outbound(
        &mut self,
        answer_id: u32,
        ops: &[u16],
    ) -> crate::cap_table::OutboundCap {
        use crate::cap_table::OutboundCap;
        match self.resolve_promised_target(answer_id, ops) {
            Ok(TargetResolution::Cap(ResolvedCap::Exported { id })) => OutboundCap::Exported(id),
            Ok(TargetResolution::Cap(ResolvedCap::Imported { id })) => OutboundCap::Imported(id),
            Ok(TargetResolution::Cap(ResolvedCap::Promised { question_id, transform })) => {
                OutboundCap::Promised {
                    question_id,
                    transform,
                }
            }
            Ok(TargetResolution::Cap(ResolvedCap::None)) | Ok(TargetResolution::Queue(_)) => {
                OutboundCap::None
            }
            Err(err) => {
                tracing::warn!(answer_id, error = %err, "unresolvable promised cap while forwarding");
                OutboundCap::None
            }
        }
    }

    // ─── Return path ──────────────────────────────────────────────────

    fn handle_return(
        &mut self,
        ret: rpc_capnp::return_::Reader<'_>,
        frame: &[u8],
    ) -> Result<(), Error> {
        let answer_id = ret.get_answer_id();
        tracing::trace!(answer_id, "inbound return");

        if self.forwarded_questions.contains_key(&answer_id) {
            return self.handle_forwarded_return(answer_id, ret);
        }

        if answer_id >= THIRD_PARTY_ANSWER_BASE {
            if let Some(original) = self.adopted_third_party_answers.remove(&answer_id) {
                self.deliver_wire_return(original, ret)?;
                match codec::build_finish(answer_id, true, false) {
                    Ok(finish) => {
                        if let Err(err) = self.send_frame(&finish) {
                            tracing::warn!(answer_id, error = %err, "adopted-answer finish failed");
                        }
                    }
                    Err(err) => {
                        tracing::warn!(answer_id, error = %err, "adopted-answer finish build failed");
                    }
                }
                return Ok(());
            }
            if self.is_terminal_return(&ret)? {
                // Terminal Return racing ahead of its adoption: buffer it.
                if self.pending_third_party_returns.contains_key(&answer_id) {
                    return Err(self.abort_with(Error::DuplicateThirdPartyReturn(answer_id)));
                }
                self.pending_third_party_returns.insert(answer_id, frame.to_vec());
                return Ok(());
            }
        }

        self.deliver_wire_return(answer_id, ret)
    }

    fn is_terminal_return(&self, ret: &rpc_capnp::return_::Reader<'_>) -> Result<bool, Error> {
        use rpc_capnp::return_::Which;
        Ok(matches!(
            ret.which()?,
            Which::Results(_) | Which::Exception(_) | Which::Canceled(())
        ))
    }

    fn deliver_wire_return(
        &mut self,
        question_id: u32,
        ret: rpc_capnp::return_::Reader<'_>,
    ) -> Result<(), Error> {
        use rpc_capnp::return_::Which;
        match ret.which()? {
            Which::Results(payload) => {
                let payload = payload?;
                let mut caps = self.resolve_inbound_caps(payload.get_cap_table()?, false)?;
                self.deliver_return_outcome(
                    question_id,
                    ReturnOutcome::Results(ResultsReader {
                        content: payload.get_content(),
                        caps: &mut caps,
                    }),
                );
                let releases = caps.unretained_import_counts();
                self.flush_inbound_releases(releases);
                Ok(())
            }
            Which::Exception(exception) => {
                let reason = codec::text_to_string(exception?.get_reason()?);
                self.deliver_return_outcome(question_id, ReturnOutcome::Exception { reason });
                Ok(())
            }
            Which::Canceled(()) => {
                self.deliver_return_outcome(question_id, ReturnOutcome::Canceled);
                Ok(())
            }
            Which::TakeFromOtherQuestion(other) => {
                // Tail-call unwind: translate through the forwarding table,
                // then deliver our stored results if we hold them.
                let other = self
                    .forwarded_questions
                    .get(&other)
                    .map(|f| f.original_answer_id)
                    .unwrap_or(other);
                if self.resolved_answers.contains_key(&other) {
                    return self.deliver_stored_results(question_id, other);
                }
                self.deliver_return_outcome(
                    question_id,
                    ReturnOutcome::TakenFromOtherQuestion { question_id: other },
                );
                Ok(())
            }
            Which::ResultsSentElsewhere(()) => {
                // Only meaningful on a forwarded question, which was handled
                // before we got here.
                self.deliver_return_outcome(
                    question_id,
                    ReturnOutcome::Exception {
                        reason: "forwarded resultsSentElsewhere unsupported".to_string(),
                    },
                );
                Ok(())
            }
            Which::AcceptFromThirdParty(pointer) | Which::AwaitFromThirdParty(pointer) => {
                self.register_third_party_await(question_id, pointer)
            }
        }
    }

    /// Deliver results this peer stored for one of its own answers (a
    /// `sendResultsTo.yourself` call it completed) to a local question.
    fn deliver_stored_results(
        &mut self,
        question_id: u32,
        stored_answer_id: u32,
    ) -> Result<(), Error> {
        let decoded = match self.resolved_answers.get(&stored_answer_id) {
            Some(frame) => DecodedMessage::new(frame)?,
            None => return Err(Error::PromisedAnswerMissing(stored_answer_id)),
        };
        let root = decoded.root()?;
        let rpc_capnp::message::Which::Return(ret) = root.which()? else {
            return Err(Error::MalformedMessage("stored answer is not a return"));
        };
        let rpc_capnp::return_::Which::Results(payload) = ret?.which()? else {
            return Err(Error::MalformedMessage("stored answer has no results"));
        };
        let payload = payload?;
        // Our own frame: descriptors read with roles flipped, no imports.
        let mut caps = self.resolve_inbound_caps(payload.get_cap_table()?, true)?;
        self.deliver_return_outcome(
            question_id,
            ReturnOutcome::Results(ResultsReader {
                content: payload.get_content(),
                caps: &mut caps,
            }),
        );
        Ok(())
    }

    fn handle_forwarded_return(
        &mut self,
        forwarded_qid: u32,
        ret: rpc_capnp::return_::Reader<'_>,
    ) -> Result<(), Error> {
        use rpc_capnp::return_::Which;
        let (original, expect) = {
            let fw = self
                .forwarded_questions
                .get(&forwarded_qid)
                .expect("checked by caller");
            (fw.original_answer_id, fw.expect)
        };

        match ret.which()? {
            Which::ResultsSentElsewhere(()) if expect == ForwardExpect::SentElsewhere => {
                self.forwarded_questions.remove(&forwarded_qid);
                // A yourself-mode original is still waiting for its own
                // resultsSentElsewhere; relay it. (Tail-call originals were
                // already answered with takeFromOtherQuestion.)
                if let Some(ResultsMode::Yourself) = self.answers.get(&original) {
                    let frame = codec::build_frame(|root| {
                        let mut reply = root.init_return();
                        reply.set_answer_id(original);
                        reply.set_results_sent_elsewhere(());
                        Ok(())
                    })?;
                    self.send_frame(&frame)?;
                    self.answers.remove(&original);
                }
                Ok(())
            }
            Which::AwaitFromThirdParty(_) if expect == ForwardExpect::ThirdParty => {
                let Some(ResultsMode::ThirdParty(Some(bytes))) =
                    self.answers.get(&original).cloned()
                else {
                    return Err(self.abort_with(Error::MissingThirdPartyPayload));
                };
                let frame = codec::build_frame(|root| {
                    let mut reply = root.init_return();
                    reply.set_answer_id(original);
                    let decoded = codec::decode_pointer_bytes(&bytes)?;
                    let mut pointer = reply.init_await_from_third_party();
                    pointer.set_as(decoded.root_pointer()?)?;
                    Ok(())
                })?;
                self.send_frame(&frame)?;
                self.answers.remove(&original);
                self.forwarded_questions.remove(&forwarded_qid);
                Ok(())
            }
            Which::Exception(exception) => {
                // The upstream failed; relay the failure if the original is
                // still answerable.
                let reason = codec::text_to_string(exception?.get_reason()?);
                self.forwarded_questions.remove(&forwarded_qid);
                self.forwarded_tail_questions.remove(&original);
                if self.answers.contains_key(&original) {
                    if let Err(err) = self.send_return_exception(original, &reason) {
                        tracing::warn!(original, error = %err, "failed to relay forwarded exception");
                    }
                } else {
                    tracing::debug!(original, reason = %reason, "forwarded call failed after tail return");
                }
                Ok(())
            }
            _ => Err(self.abort_with(Error::UnexpectedForwardedTailReturn(forwarded_qid))),
        }
    }

    // ─── Finish ───────────────────────────────────────────────────────

    fn handle_finish(&mut self, finish: rpc_capnp::finish::Reader<'_>) -> Result<(), Error> {
        let question_id = finish.get_question_id();
        let release_result_caps = finish.get_release_result_caps();
        let keep_queued = finish.get_require_early_cancellation();
        tracing::trace!(question_id, release_result_caps, "inbound finish");

        // Each of these clears is idempotent; order is immaterial.
        self.answers.remove(&question_id);
        if let Some(provide) = self.provides_by_question.remove(&question_id) {
            self.provides_by_key.remove(&provide.recipient_key);
        }
        if let Some((join_id, part_num)) = self.join_questions.remove(&question_id) {
            if let Some(join) = self.joins.get_mut(&join_id) {
                join.parts.remove(&part_num);
                join.question_ids.retain(|q| *q != question_id);
                if join.question_ids.is_empty() {
                    self.joins.remove(&join_id);
                }
            }
        }
        if let Some(accept) = self.pending_accepts.remove(&question_id) {
            self.pending_accepts_by_embargo
                .remove(&accept.provide_question_id);
        }
        if !keep_queued {
            self.cancel_queued_promise_call(question_id);
        }

        if let Some(forwarded_qid) = self.forwarded_tail_questions.remove(&question_id) {
            match codec::build_finish(forwarded_qid, false, false) {
                Ok(frame) => {
                    if let Err(err) = self.send_frame(&frame) {
                        tracing::warn!(forwarded_qid, error = %err, "finish propagation failed");
                    }
                }
                Err(err) => {
                    tracing::warn!(forwarded_qid, error = %err, "finish propagation build failed");
                }
            }
        }

        if let Some(frame) = self.resolved_answers.remove(&question_id) {
            if release_result_caps {
                self.release_caps_for_frame(&frame);
            }
        }
        Ok(())
    }

    /// An early Finish cancels a call still parked on a promise export.
    fn cancel_queued_promise_call(&mut self, answer_id: u32) {
        let mut canceled = false;
        for export in self.exports.values_mut() {
            if let ExportKind::Promise(promise) = &mut export.kind {
                let before = promise.queued.len();
                promise.queued.retain(|q| q.answer_id != answer_id);
                if promise.queued.len() != before {
                    canceled = true;
                }
            }
        }
        if canceled {
            match codec::build_frame(|root| {
                let mut ret = root.init_return();
                ret.set_answer_id(answer_id);
                ret.set_canceled(());
                Ok(())
            }) {
                Ok(frame) => {
                    if let Err(err) = self.send_frame(&frame) {
                        tracing::warn!(answer_id, error = %err, "canceled return send failed");
                    }
                }
                Err(err) => {
                    tracing::warn!(answer_id, error = %err, "canceled return build failed");
                }
            }
        }
    }

    /// Drop the export references held by a cached results frame.
    fn release_caps_for_frame(&mut self, frame: &[u8]) {
        let released = (|| -> Result<(), Error> {
            let decoded = DecodedMessage::new(frame)?;
            let root = decoded.root()?;
            let rpc_capnp::message::Which::Return(ret) = root.which()? else {
                return Ok(());
            };
            let rpc_capnp::return_::Which::Results(payload) = ret?.which()? else {
                return Ok(());
            };
            use rpc_capnp::cap_descriptor::Which;
            for descriptor in payload?.get_cap_table()?.iter() {
                if let Which::SenderHosted(id) | Which::SenderPromise(id) = descriptor.which()? {
                    self.release_export_refs(id, 1);
                }
            }
            Ok(())
        })();
        if let Err(err) = released {
            tracing::warn!(error = %err, "failed to release caps of cached answer");
        }
    }

    // ─── Resolve / disembargo ─────────────────────────────────────────

    fn handle_resolve(&mut self, resolve: rpc_capnp::resolve::Reader<'_>) -> Result<(), Error> {
        let promise_id = resolve.get_promise_id();
        if !self.cap_table.has_import(promise_id) {
            // We hold no reference to this promise; hand back whatever the
            // resolution would have granted us.
            if let rpc_capnp::resolve::Which::Cap(descriptor) = resolve.which()? {
                use rpc_capnp::cap_descriptor::Which;
                if let Which::SenderHosted(id) | Which::SenderPromise(id) = descriptor?.which()? {
                    let frame = codec::build_release(id, 1)?;
                    self.send_frame(&frame)?;
                }
            }
            tracing::debug!(promise_id, "resolve for promise we do not import");
            return Ok(());
        }

        let resolved = match resolve.which()? {
            rpc_capnp::resolve::Which::Cap(descriptor) => {
                self.resolve_descriptor(descriptor?)?
            }
            rpc_capnp::resolve::Which::Exception(_) => ResolvedCap::None,
        };

        // The freshly resolved path must not be used until the loopback
        // round-trip confirms everything sent before the Resolve has landed.
        let embargo_id = self.allocate_embargo_id();
        self.pending_embargoes.insert(
            embargo_id,
            crate::peer::PendingEmbargo {
                import_id: promise_id,
                queued: Vec::new(),
            },
        );
        self.resolved_imports.insert(
            promise_id,
            crate::peer::ResolvedImport {
                resolved,
                embargo_id: Some(embargo_id),
                embargoed: true,
            },
        );
        let frame = codec::build_disembargo_sender_loopback(promise_id, embargo_id)?;
        self.send_frame(&frame)
    }

    fn resolve_descriptor(
        &mut self,
        descriptor: rpc_capnp::cap_descriptor::Reader<'_>,
    ) -> Result<ResolvedCap, Error> {
        use rpc_capnp::cap_descriptor::Which;
        Ok(match descriptor.which()? {
            Which::None(()) => ResolvedCap::None,
            Which::SenderHosted(id) | Which::SenderPromise(id) => {
                self.cap_table.note_import(id);
                ResolvedCap::Imported { id }
            }
            Which::ReceiverHosted(id) => ResolvedCap::Exported { id },
            Which::ReceiverAnswer(promised) => {
                let promised = promised?;
                ResolvedCap::Promised {
                    question_id: promised.get_question_id(),
                    transform: codec::decode_transform(promised)?,
                }
            }
            Which::ThirdPartyHosted(third) => {
                let id = third?.get_vine_id();
                self.cap_table.note_import(id);
                ResolvedCap::Imported { id }
            }
        })
    }

    fn handle_disembargo(
        &mut self,
        disembargo: rpc_capnp::disembargo::Reader<'_>,
    ) -> Result<(), Error> {
        use rpc_capnp::disembargo::context::Which;
        match disembargo.get_context().which()? {
            Which::SenderLoopback(embargo_id) => {
                // Echo back on the same path; ordering does the rest.
                let frame = codec::build_disembargo_receiver_loopback(
                    disembargo.get_target()?,
                    embargo_id,
                )?;
                self.send_frame(&frame)
            }
            Which::ReceiverLoopback(embargo_id) => {
                self.lift_embargo(embargo_id);
                Ok(())
            }
            Which::Accept(()) => {
                if let rpc_capnp::message_target::Which::ImportedCap(import_id) =
                    disembargo.get_target()?.which()?
                {
                    let embargo_id = self
                        .resolved_imports
                        .get(&import_id)
                        .and_then(|r| r.embargo_id);
                    if let Some(embargo_id) = embargo_id {
                        self.lift_embargo(embargo_id);
                        return Ok(());
                    }
                }
                tracing::warn!("disembargo accept with no matching embargo");
                Ok(())
            }
            Which::Provide(provide_question_id) => {
                self.complete_embargoed_accept(provide_question_id)
            }
        }
    }

    // ─── Bootstrap / unimplemented ────────────────────────────────────

    fn handle_bootstrap(
        &mut self,
        bootstrap: rpc_capnp::bootstrap::Reader<'_>,
    ) -> Result<(), Error> {
        let question_id = bootstrap.get_question_id();
        self.answers.insert(question_id, ResultsMode::Caller);
        match self.bootstrap_export {
            None => self.send_return_exception(question_id, "bootstrap not configured"),
            Some(export_id) => self.send_single_cap_results(question_id, export_id),
        }
    }

    fn handle_unimplemented(
        &mut self,
        inner: rpc_capnp::message::Reader<'_>,
    ) -> Result<(), Error> {
        use rpc_capnp::message::Which;
        match inner.which() {
            Ok(Which::Call(call)) => {
                let question_id = call?.get_question_id();
                self.handle_unimplemented_question(question_id);
                Ok(())
            }
            Ok(Which::Bootstrap(bootstrap)) => {
                let question_id = bootstrap?.get_question_id();
                self.handle_unimplemented_question(question_id);
                Ok(())
            }
            _ => {
                tracing::debug!("remote could not handle a non-question frame");
                Ok(())
            }
        }
    }

    /// The remote refused one of our questions: answer it locally with an
    /// "unimplemented" exception. Unknown ids are swallowed.
    fn handle_unimplemented_question(&mut self, question_id: u32) {
        if !self.questions.contains_key(&question_id) {
            return;
        }
        self.deliver_return_outcome(
            question_id,
            ReturnOutcome::Exception {
                reason: "unimplemented".to_string(),
            },
        );
    }

    // ─── Loopback dispatch and promise replay ─────────────────────────

    /// Run a locally targeted call (from `send_call_resolved`) through the
    /// same machinery as a wire call.
    pub(crate) fn dispatch_local_frame(&mut self, export_id: u32, frame: Vec<u8>, answer_id: u32) {
        let result = (|this: &mut Peer| -> Result<(), Error> {
            let decoded = DecodedMessage::new(&frame)?;
            let root = decoded.root()?;
            let rpc_capnp::message::Which::Call(call) = root.which()? else {
                return Err(Error::MalformedMessage("loopback frame is not a call"));
            };
            this.dispatch_resolved_call(
                ResolvedCap::Exported { id: export_id },
                call?,
                &frame,
                answer_id,
            )
        })(self);
        if let Err(err) = result {
            tracing::warn!(answer_id, error = %err, "loopback dispatch failed");
            self.answers.remove(&answer_id);
            self.fail_question(answer_id, &err.to_string());
        }
    }

    /// Replay a call that was parked on a promise export, against the
    /// capability the promise resolved to.
    pub(crate) fn replay_queued_call(&mut self, queued: QueuedCall, cap: ResolvedCap) {
        let QueuedCall { answer_id, frame } = queued;
        let result = (|this: &mut Peer| -> Result<(), Error> {
            let decoded = DecodedMessage::new(&frame)?;
            let root = decoded.root()?;
            let rpc_capnp::message::Which::Call(call) = root.which()? else {
                return Err(Error::MalformedMessage("queued frame is not a call"));
            };
            this.dispatch_resolved_call(cap, call?, &frame, answer_id)
        })(self);
        if let Err(err) = result {
            tracing::warn!(answer_id, error = %err, "replaying queued call failed");
            if self.answers.contains_key(&answer_id) {
                let reason = err.to_string();
                if let Err(send_err) = self.send_return_exception(answer_id, &reason) {
                    tracing::warn!(answer_id, error = %send_err, "failed to fail replayed call");
                }
            }
        }
    }

    /// Loopback results delivery for `send_return_results`.
    pub(crate) fn send_loopback_results<F>(
        &mut self,
        answer_id: u32,
        build_results: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(&mut crate::peer::PayloadBuilder<'_, '_>) -> Result<(), Error>,
    {
        let mut effects = CapEffects::default();
        let frame = match self.build_results_frame(answer_id, build_results, &mut effects) {
            Ok(frame) => frame,
            Err(err) => {
                self.rollback_effects(effects);
                return Err(err);
            }
        };
        // Local delivery only; the encode's refcount bumps are not
        // remote-observed descriptors.
        self.rollback_effects(effects);
        self.answers.remove(&answer_id);

        let decoded = DecodedMessage::new(&frame)?;
        let root = decoded.root()?;
        let rpc_capnp::message::Which::Return(ret) = root.which()? else {
            return Err(Error::MalformedMessage("loopback results frame is not a return"));
        };
        let rpc_capnp::return_::Which::Results(payload) = ret?.which()? else {
            return Err(Error::MalformedMessage("loopback results frame has no results"));
        };
        let payload = payload?;
        let mut caps = self.resolve_inbound_caps(payload.get_cap_table()?, true)?;
        self.deliver_return_outcome(
            answer_id,
            ReturnOutcome::Results(ResultsReader {
                content: payload.get_content(),
                caps: &mut caps,
            }),
        );
        Ok(())
    }
}
