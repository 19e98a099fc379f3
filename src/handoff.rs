//! Level-4 three-party hand-offs: provide/accept/join, and the adoption of
//! answers that travel through a third party.
//!
//! Provide records are indexed both by question id (for Finish cleanup) and
//! by the canonicalized recipient pointer (for Accept lookups). Third-party
//! adoption tolerates every arrival order of `awaitFromThirdParty`,
//! `thirdPartyAnswer`, and the terminal Return on the adopted id; all four
//! adoption tables drain to empty once a hand-off completes.

use crate::cap_table::ResolvedCap;
use crate::codec;
use crate::error::Error;
use crate::inbound::TargetResolution;
use crate::peer::{
    ExportKind, JoinState, Peer, PendingAccept, ProvideRecord, ResultsMode,
    THIRD_PARTY_ANSWER_BASE,
};
use crate::rpc_capnp;

impl Peer {
    // ─── Provide ──────────────────────────────────────────────────────

    pub(crate) fn handle_provide(
        &mut self,
        provide: rpc_capnp::provide::Reader<'_>,
    ) -> Result<(), Error> {
        let question_id = provide.get_question_id();
        if self.provides_by_question.contains_key(&question_id) {
            return Err(self.abort_with(Error::DuplicateProvideQuestionId(question_id)));
        }

        let export_id = match self.resolve_local_target(
            provide.has_target(),
            provide.get_target()?,
        ) {
            Ok(export_id) => export_id,
            Err(err) => return Err(self.abort_with(err)),
        };

        let recipient_key = codec::canonical_pointer_bytes(provide.get_recipient())?;
        if self.provides_by_key.contains_key(&recipient_key) {
            return Err(self.abort_with(Error::DuplicateProvideRecipient));
        }

        tracing::debug!(question_id, export_id, "recording provide");
        self.provides_by_key.insert(recipient_key.clone(), question_id);
        self.provides_by_question.insert(
            question_id,
            ProvideRecord {
                export_id,
                recipient_key,
            },
        );
        Ok(())
    }

    /// Resolve a provide/join target down to a concrete local export.
    pub(crate) fn resolve_local_target(
        &mut self,
        has_target: bool,
        target: rpc_capnp::message_target::Reader<'_>,
    ) -> Result<u32, Error> {
        if !has_target {
            return Err(Error::MissingCallTarget);
        }
        let export_id = match target.which()? {
            rpc_capnp::message_target::Which::ImportedCap(id) => id,
            rpc_capnp::message_target::Which::PromisedAnswer(promised) => {
                let Ok(promised) = promised else {
                    return Err(Error::MissingPromisedAnswer);
                };
                let answer_id = promised.get_question_id();
                let ops = codec::decode_transform(promised)?;
                match self.resolve_promised_target(answer_id, &ops)? {
                    TargetResolution::Cap(ResolvedCap::Exported { id }) => id,
                    TargetResolution::Queue(promise_id) => {
                        return Err(Error::PromiseUnresolved(promise_id));
                    }
                    _ => return Err(Error::PromisedAnswerMissing(answer_id)),
                }
            }
        };
        match self.exports.get(&export_id) {
            None => Err(Error::UnknownExport(export_id)),
            Some(export) => match &export.kind {
                ExportKind::Handler(_) => Ok(export_id),
                ExportKind::Promise(promise) => {
                    if let Some(concrete) = promise.resolved_to {
                        Ok(concrete)
                    } else if promise.broken.is_some() {
                        Err(Error::PromiseBroken(export_id))
                    } else {
                        Err(Error::PromiseUnresolved(export_id))
                    }
                }
            },
        }
    }

    // ─── Accept ───────────────────────────────────────────────────────

    pub(crate) fn handle_accept(
        &mut self,
        accept: rpc_capnp::accept::Reader<'_>,
    ) -> Result<(), Error> {
        let question_id = accept.get_question_id();
        let key = codec::canonical_pointer_bytes(accept.get_provision())?;
        self.answers.insert(question_id, ResultsMode::Caller);

        let Some(&provide_question_id) = self.provides_by_key.get(&key) else {
            tracing::debug!(question_id, "accept for unknown provision");
            return self.send_return_exception(question_id, "unknown provision");
        };
        let export_id = self
            .provides_by_question
            .get(&provide_question_id)
            .expect("provide indexes are kept in lockstep")
            .export_id;

        if accept.get_embargo() {
            // Hold the hand-off until the provider's disembargo confirms
            // every earlier message on the old path has landed.
            self.pending_accepts.insert(
                question_id,
                PendingAccept {
                    provide_question_id,
                    export_id,
                },
            );
            self.pending_accepts_by_embargo
                .insert(provide_question_id, question_id);
            return Ok(());
        }
        self.send_single_cap_results(question_id, export_id)
    }

    /// `Disembargo { provide }` releases the matching queued accept.
    pub(crate) fn complete_embargoed_accept(
        &mut self,
        provide_question_id: u32,
    ) -> Result<(), Error> {
        let Some(accept_question_id) =
            self.pending_accepts_by_embargo.remove(&provide_question_id)
        else {
            tracing::warn!(provide_question_id, "disembargo for no pending accept");
            return Ok(());
        };
        let Some(pending) = self.pending_accepts.remove(&accept_question_id) else {
            tracing::warn!(accept_question_id, "pending accept index out of lockstep");
            return Ok(());
        };
        self.send_single_cap_results(accept_question_id, pending.export_id)
    }

    // ─── Join ─────────────────────────────────────────────────────────

    pub(crate) fn handle_join(&mut self, join: rpc_capnp::join::Reader<'_>) -> Result<(), Error> {
        let question_id = join.get_question_id();
        if self.join_questions.contains_key(&question_id) {
            return Err(self.abort_with(Error::DuplicateJoinQuestionId(question_id)));
        }

        let export_id =
            match self.resolve_local_target(join.has_target(), join.get_target()?) {
                Ok(export_id) => export_id,
                Err(err) => return Err(self.abort_with(err)),
            };

        let key_part = join.get_key_part();
        if key_part.is_null() {
            return Err(self.abort_with(Error::MalformedMessage("join key part missing")));
        }
        let key = key_part.get_as::<rpc_capnp::join_key_part::Reader>()?;
        let join_id = key.get_join_id();
        let part_count = key.get_part_count();
        let part_num = key.get_part_num();
        if part_count == 0 {
            return Err(self.abort_with(Error::MalformedMessage("join part count is zero")));
        }
        if part_num >= part_count {
            return Err(self.abort_with(Error::MalformedMessage("join part number out of range")));
        }

        {
            let state = self.joins.entry(join_id).or_insert_with(|| JoinState {
                part_count,
                parts: Default::default(),
                question_ids: Vec::new(),
            });
            if state.part_count != part_count {
                return Err(self.abort_with(Error::MalformedMessage("join part count mismatch")));
            }
            if state.parts.contains_key(&part_num) {
                return Err(self.abort_with(Error::MalformedMessage("join part repeated")));
            }
            state.parts.insert(part_num, export_id);
            state.question_ids.push(question_id);
        }
        self.join_questions.insert(question_id, (join_id, part_num));
        self.answers.insert(question_id, ResultsMode::Caller);

        let complete = self
            .joins
            .get(&join_id)
            .map(|s| s.parts.len() == s.part_count as usize)
            .unwrap_or(false);
        if !complete {
            return Ok(());
        }

        let state = self.joins.remove(&join_id).expect("checked above");
        for qid in &state.question_ids {
            self.join_questions.remove(qid);
        }
        let mut targets = state.parts.values();
        let first = *targets.next().expect("part count is nonzero");
        let matched = targets.all(|t| *t == first);
        tracing::debug!(join_id, matched, "join complete");
        for qid in state.question_ids {
            if matched {
                self.send_single_cap_results(qid, first)?;
            } else {
                self.send_return_exception(qid, "join target mismatch")?;
            }
        }
        Ok(())
    }

    // ─── Third-party answers ──────────────────────────────────────────

    pub(crate) fn handle_third_party_answer(
        &mut self,
        answer: rpc_capnp::third_party_answer::Reader<'_>,
    ) -> Result<(), Error> {
        let adopted_id = answer.get_answer_id();
        if !(THIRD_PARTY_ANSWER_BASE..(THIRD_PARTY_ANSWER_BASE << 1)).contains(&adopted_id) {
            return Err(self.abort_with(Error::MalformedMessage(
                "third-party answer id outside the reserved half-space",
            )));
        }
        if self.adopted_third_party_answers.contains_key(&adopted_id) {
            // Identical re-announcement after adoption.
            return Ok(());
        }

        let completion = answer.get_completion();
        if completion.is_null() {
            return Err(self.abort_with(Error::MissingThirdPartyPayload));
        }
        let key = codec::canonical_pointer_bytes(completion)?;

        if let Some(&existing) = self.pending_third_party_answers.get(&key) {
            if existing == adopted_id {
                return Ok(());
            }
            return Err(self.abort_with(Error::ConflictingThirdPartyAnswer));
        }

        if let Some(question_id) = self.pending_third_party_awaits.remove(&key) {
            return self.adopt_third_party_answer(question_id, adopted_id);
        }
        // Answer-first order: park until the matching await shows up.
        self.pending_third_party_answers.insert(key, adopted_id);
        Ok(())
    }

    /// A Return told us the results travel through a third party: register
    /// the await (or complete it if the announcement already arrived) and
    /// finish the wire question while keeping its callback alive.
    pub(crate) fn register_third_party_await(
        &mut self,
        question_id: u32,
        completion: capnp::any_pointer::Reader<'_>,
    ) -> Result<(), Error> {
        if completion.is_null() {
            return Err(self.abort_with(Error::MissingThirdPartyPayload));
        }
        let key = codec::canonical_pointer_bytes(completion)?;

        if let Some(question) = self.questions.get_mut(&question_id) {
            // The adopted id gets its own Finish later.
            question.suppress_auto_finish = true;
        }
        let finish = codec::build_finish(question_id, false, false)?;
        self.send_frame(&finish)?;

        if let Some(adopted_id) = self.pending_third_party_answers.remove(&key) {
            return self.adopt_third_party_answer(question_id, adopted_id);
        }
        if self.pending_third_party_awaits.contains_key(&key) {
            return Err(self.abort_with(Error::DuplicateThirdPartyAwait));
        }
        self.pending_third_party_awaits.insert(key, question_id);
        Ok(())
    }

    /// Bind an adopted answer id to the question awaiting it, replaying a
    /// buffered early Return if one raced ahead.
    pub(crate) fn adopt_third_party_answer(
        &mut self,
        question_id: u32,
        adopted_id: u32,
    ) -> Result<(), Error> {
        if self.adopted_third_party_answers.contains_key(&adopted_id) {
            return Err(self.abort_with(Error::MalformedMessage(
                "third-party answer adopted twice",
            )));
        }
        tracing::debug!(question_id, adopted_id, "adopting third-party answer");
        self.adopted_third_party_answers.insert(adopted_id, question_id);
        if let Some(frame) = self.pending_third_party_returns.remove(&adopted_id) {
            self.handle_frame(&frame)?;
        }
        Ok(())
    }

    /// Results for a call whose caller redirected them to a third party:
    /// hand the caller the completion to await, announce the adopted answer
    /// id, then publish the results under it.
    pub(crate) fn send_third_party_results<F>(
        &mut self,
        answer_id: u32,
        completion: Option<Vec<u8>>,
        build_results: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(&mut crate::peer::PayloadBuilder<'_, '_>) -> Result<(), Error>,
    {
        let Some(completion) = completion else {
            return Err(Error::MissingThirdPartyPayload);
        };

        let await_frame = codec::build_frame(|root| {
            let mut ret = root.init_return();
            ret.set_answer_id(answer_id);
            let decoded = codec::decode_pointer_bytes(&completion)?;
            let mut pointer = ret.init_await_from_third_party();
            pointer.set_as(decoded.root_pointer()?)?;
            Ok(())
        })?;
        self.send_frame(&await_frame)?;
        self.answers.remove(&answer_id);

        let adopted_id = self.allocate_adopted_answer_id();
        let announce_frame = codec::build_frame(|root| {
            let mut announce = root.init_third_party_answer();
            announce.set_answer_id(adopted_id);
            let decoded = codec::decode_pointer_bytes(&completion)?;
            let mut pointer = announce.init_completion();
            pointer.set_as(decoded.root_pointer()?)?;
            Ok(())
        })?;
        self.send_frame(&announce_frame)?;

        let mut effects = crate::cap_table::CapEffects::default();
        let frame = match self.build_results_frame(adopted_id, build_results, &mut effects) {
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
        self.resolved_answers.insert(adopted_id, frame);
        Ok(())
    }
}
