//! Capability bookkeeping on both sides of the wire.
//!
//! Outbound: which remote capabilities we hold references to (`imports`) and
//! which receiver-answer descriptors we have attached to outgoing messages.
//! Inbound: resolving a message's cap-descriptor list into local handles,
//! with retain/release-on-drop accounting batched into single Release frames.

use std::collections::HashMap;

use crate::codec::TransformOps;

/// A capability descriptor resolved to this peer's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedCap {
    /// Null slot; calls against it fail.
    None,
    /// Hosted by the remote; `id` indexes our import table.
    Imported { id: u32 },
    /// Hosted by us; `id` indexes our export table.
    Exported { id: u32 },
    /// A pipelined result of a question that has not necessarily returned.
    Promised { question_id: u32, transform: TransformOps },
}

/// A capability to attach to an outbound payload.
#[derive(Debug, Clone)]
pub enum OutboundCap {
    None,
    /// One of our exports; the wire descriptor is senderHosted/senderPromise.
    Exported(u32),
    /// One of our imports; the wire descriptor is receiverHosted.
    Imported(u32),
    /// A pipelined result of one of our outbound questions; the wire
    /// descriptor is receiverAnswer.
    Promised { question_id: u32, transform: TransformOps },
}

#[derive(Debug)]
pub(crate) struct ReceiverAnswer {
    pub answer_id: u32,
    #[allow(dead_code)]
    pub ops: TransformOps,
}

/// Outbound capability table: import refcounts plus receiver-answer records.
#[derive(Default)]
pub struct CapTable {
    imports: HashMap<u32, u32>,
    receiver_answers: HashMap<u32, ReceiverAnswer>,
    next_receiver_answer_id: u32,
}

impl CapTable {
    /// Take one more local reference to a remote capability.
    pub fn note_import(&mut self, id: u32) {
        *self.imports.entry(id).or_insert(0) += 1;
    }

    pub fn has_import(&self, id: u32) -> bool {
        self.imports.contains_key(&id)
    }

    pub fn import_ref_count(&self, id: u32) -> u32 {
        self.imports.get(&id).copied().unwrap_or(0)
    }

    /// Drop up to `count` local references; the entry disappears at zero.
    /// Returns how many references were actually dropped.
    pub fn release_import(&mut self, id: u32, count: u32) -> u32 {
        let Some(refs) = self.imports.get_mut(&id) else {
            return 0;
        };
        let dropped = count.min(*refs);
        *refs -= dropped;
        if *refs == 0 {
            self.imports.remove(&id);
        }
        dropped
    }

    /// Record a receiverAnswer descriptor attached to an outbound message.
    /// The returned local id is only used to undo the record on send failure.
    pub(crate) fn note_receiver_answer(&mut self, answer_id: u32, ops: &[u16]) -> u32 {
        let id = loop {
            let candidate = self.next_receiver_answer_id;
            self.next_receiver_answer_id = self.next_receiver_answer_id.wrapping_add(1);
            if !self.receiver_answers.contains_key(&candidate) {
                break candidate;
            }
        };
        self.receiver_answers.insert(
            id,
            ReceiverAnswer {
                answer_id,
                ops: TransformOps::from_slice(ops),
            },
        );
        id
    }

    pub(crate) fn forget_receiver_answer(&mut self, local_id: u32) {
        self.receiver_answers.remove(&local_id);
    }

    pub(crate) fn has_receiver_answer(&self, local_id: u32) -> bool {
        self.receiver_answers.contains_key(&local_id)
    }

    /// Drop every receiver-answer record pointing at a finished question.
    pub(crate) fn clear_receiver_answers_for(&mut self, answer_id: u32) {
        self.receiver_answers
            .retain(|_, record| record.answer_id != answer_id);
    }

    pub fn receiver_answer_count(&self) -> usize {
        self.receiver_answers.len()
    }

    pub fn import_count(&self) -> usize {
        self.imports.len()
    }
}

/// The resolved cap list of one inbound payload.
///
/// Handlers and return callbacks may call [`retain`](Self::retain) to keep a
/// reference alive past the payload; everything unretained is released back
/// to the sender in one batched Release per import id.
#[derive(Debug, Default)]
pub struct InboundCaps {
    entries: Vec<ResolvedCap>,
    retained: Vec<bool>,
}

impl InboundCaps {
    pub(crate) fn new(entries: Vec<ResolvedCap>) -> Self {
        let retained = vec![false; entries.len()];
        InboundCaps { entries, retained }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ResolvedCap> {
        self.entries.get(index)
    }

    /// Keep the capability at `index` past this payload's lifetime. The
    /// caller becomes responsible for an eventual `send_release_for_host`.
    pub fn retain(&mut self, index: usize) {
        if let Some(slot) = self.retained.get_mut(index) {
            *slot = true;
        }
    }

    pub fn entries(&self) -> &[ResolvedCap] {
        &self.entries
    }

    /// Unretained import occurrences, batched per import id.
    pub(crate) fn unretained_import_counts(&self) -> HashMap<u32, u32> {
        let mut counts = HashMap::new();
        for (entry, retained) in self.entries.iter().zip(&self.retained) {
            if *retained {
                continue;
            }
            if let ResolvedCap::Imported { id } = entry {
                *counts.entry(*id).or_insert(0) += 1;
            }
        }
        counts
    }
}

/// Side effects of encoding one outbound cap table, kept so a failed send
/// can restore the exact pre-call state.
#[derive(Debug, Default)]
pub(crate) struct CapEffects {
    /// Export ids whose refcount was incremented, one entry per increment.
    pub export_refs: Vec<u32>,
    /// Local receiver-answer record ids allocated for this message.
    pub receiver_answers: Vec<u32>,
}

impl CapEffects {
    pub fn is_empty(&self) -> bool {
        self.export_refs.is_empty() && self.receiver_answers.is_empty()
    }
}
