//! Provide/accept hand-offs (including the embargoed path) and multi-part
//! joins.

mod common;

use std::rc::Rc;

use capwire::Error;
use common::*;

#[test]
fn provide_then_accept_returns_the_capability() {
    let (mut peer, out) = capture_peer();
    let export = peer.add_export(Rc::new(EchoHandler));

    peer.handle_frame(&provide_frame(1, export, 0xAA)).unwrap();
    assert!(out.is_empty(), "provide is silently recorded");

    peer.handle_frame(&accept_frame(2, 0xAA, false)).unwrap();
    assert_eq!(
        out.summaries(),
        vec![Frame::Return {
            answer_id: 2,
            what: ReturnKind::Results { cap_count: 1 },
        }]
    );
    assert_eq!(peer.export_ref_count(export), Some(1));
}

#[test]
fn accept_of_unknown_provision_is_an_exception() {
    let (mut peer, out) = capture_peer();
    peer.handle_frame(&accept_frame(2, 0xDEAD, false)).unwrap();
    assert_eq!(
        out.summaries(),
        vec![Frame::Return {
            answer_id: 2,
            what: ReturnKind::Exception {
                reason: "unknown provision".to_string(),
            },
        }]
    );
}

#[test]
fn duplicate_provide_recipient_aborts() {
    let (mut peer, out) = capture_peer();
    let export = peer.add_export(Rc::new(EchoHandler));

    peer.handle_frame(&provide_frame(1, export, 0xBB)).unwrap();
    let err = peer
        .handle_frame(&provide_frame(2, export, 0xBB))
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateProvideRecipient));
    assert!(matches!(out.summaries().as_slice(), [Frame::Abort { .. }]));
}

#[test]
fn duplicate_provide_question_aborts() {
    let (mut peer, _out) = capture_peer();
    let export = peer.add_export(Rc::new(EchoHandler));

    peer.handle_frame(&provide_frame(1, export, 0xC1)).unwrap();
    let err = peer
        .handle_frame(&provide_frame(1, export, 0xC2))
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateProvideQuestionId(1)));
}

#[test]
fn provide_of_unknown_export_aborts() {
    let (mut peer, _out) = capture_peer();
    let err = peer.handle_frame(&provide_frame(1, 999, 0xC3)).unwrap_err();
    assert!(matches!(err, Error::UnknownExport(999)));
}

#[test]
fn provide_of_unresolved_promise_aborts() {
    let (mut peer, _out) = capture_peer();
    let promise = peer.add_promise_export();
    let err = peer
        .handle_frame(&provide_frame(1, promise, 0xC4))
        .unwrap_err();
    assert!(matches!(err, Error::PromiseUnresolved(id) if id == promise));
}

#[test]
fn finish_withdraws_a_provide() {
    let (mut peer, out) = capture_peer();
    let export = peer.add_export(Rc::new(EchoHandler));

    peer.handle_frame(&provide_frame(1, export, 0xCC)).unwrap();
    peer.handle_frame(&finish_frame(1, false, false)).unwrap();
    peer.handle_frame(&accept_frame(2, 0xCC, false)).unwrap();
    assert_eq!(
        out.summaries(),
        vec![Frame::Return {
            answer_id: 2,
            what: ReturnKind::Exception {
                reason: "unknown provision".to_string(),
            },
        }]
    );
}

#[test]
fn embargoed_accept_waits_for_the_disembargo() {
    let (mut peer, out) = capture_peer();
    let export = peer.add_export(Rc::new(EchoHandler));

    peer.handle_frame(&provide_frame(4, export, 0xD1)).unwrap();
    peer.handle_frame(&accept_frame(5, 0xD1, true)).unwrap();
    assert!(out.is_empty(), "embargoed accept must not answer yet");

    peer.handle_frame(&disembargo_provide_frame(0, 4)).unwrap();
    assert_eq!(
        out.summaries(),
        vec![Frame::Return {
            answer_id: 5,
            what: ReturnKind::Results { cap_count: 1 },
        }]
    );
}

#[test]
fn finish_cancels_a_pending_embargoed_accept() {
    let (mut peer, out) = capture_peer();
    let export = peer.add_export(Rc::new(EchoHandler));

    peer.handle_frame(&provide_frame(6, export, 0xD2)).unwrap();
    peer.handle_frame(&accept_frame(7, 0xD2, true)).unwrap();
    peer.handle_frame(&finish_frame(7, false, false)).unwrap();

    // The disembargo finds nothing to release.
    peer.handle_frame(&disembargo_provide_frame(0, 6)).unwrap();
    assert!(out.is_empty());
    assert_eq!(peer.export_ref_count(export), Some(0));
}

#[test]
fn join_completes_when_all_parts_match() {
    let (mut peer, out) = capture_peer();
    let export = peer.add_export(Rc::new(EchoHandler));

    peer.handle_frame(&join_frame(8, export, 1, 2, 0)).unwrap();
    assert!(out.is_empty(), "half a join answers nothing");
    peer.handle_frame(&join_frame(9, export, 1, 2, 1)).unwrap();

    let frames = out.summaries();
    assert_eq!(frames.len(), 2);
    for (frame, expected) in frames.iter().zip([8u32, 9]) {
        assert_eq!(
            *frame,
            Frame::Return {
                answer_id: expected,
                what: ReturnKind::Results { cap_count: 1 },
            }
        );
    }
    assert_eq!(peer.export_ref_count(export), Some(2));
}

#[test]
fn join_target_mismatch_fails_every_part() {
    let (mut peer, out) = capture_peer();
    let first = peer.add_export(Rc::new(EchoHandler));
    let second = peer.add_export(Rc::new(EchoHandler));

    peer.handle_frame(&join_frame(10, first, 2, 2, 0)).unwrap();
    peer.handle_frame(&join_frame(11, second, 2, 2, 1)).unwrap();

    let frames = out.summaries();
    assert_eq!(frames.len(), 2);
    for frame in frames {
        assert!(matches!(
            frame,
            Frame::Return {
                what: ReturnKind::Exception { ref reason },
                ..
            } if reason == "join target mismatch"
        ));
    }
}

#[test]
fn duplicate_join_question_aborts() {
    let (mut peer, _out) = capture_peer();
    let export = peer.add_export(Rc::new(EchoHandler));

    peer.handle_frame(&join_frame(12, export, 3, 2, 0)).unwrap();
    let err = peer.handle_frame(&join_frame(12, export, 3, 2, 1)).unwrap_err();
    assert!(matches!(err, Error::DuplicateJoinQuestionId(12)));
}

#[test]
fn repeated_join_part_aborts() {
    let (mut peer, _out) = capture_peer();
    let export = peer.add_export(Rc::new(EchoHandler));

    peer.handle_frame(&join_frame(13, export, 4, 3, 1)).unwrap();
    let err = peer.handle_frame(&join_frame(14, export, 4, 3, 1)).unwrap_err();
    assert!(matches!(err, Error::MalformedMessage("join part repeated")));
}

#[test]
fn join_part_count_mismatch_aborts() {
    let (mut peer, _out) = capture_peer();
    let export = peer.add_export(Rc::new(EchoHandler));

    peer.handle_frame(&join_frame(15, export, 5, 2, 0)).unwrap();
    let err = peer.handle_frame(&join_frame(16, export, 5, 3, 1)).unwrap_err();
    assert!(matches!(err, Error::MalformedMessage("join part count mismatch")));
}
