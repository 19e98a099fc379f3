//! Error type shared by the peer state machine, codec, and connection driver.

/// Everything that can go wrong while driving a peer.
///
/// Protocol-contract breaches by the remote (`Duplicate*`, `Conflicting*`,
/// malformed frames) are also reported to the remote as an `abort` frame
/// before the error surfaces to the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no transport attached")]
    TransportNotAttached,

    #[error("peer is shutting down")]
    ShuttingDown,

    #[error("capability is unavailable")]
    CapabilityUnavailable,

    #[error("unknown export {0}")]
    UnknownExport(u32),

    #[error("unknown question {0}")]
    UnknownQuestion(u32),

    #[error("promise export {0} is not resolved")]
    PromiseUnresolved(u32),

    #[error("promise export {0} is broken")]
    PromiseBroken(u32),

    #[error("no answer is available for question {0}")]
    PromisedAnswerMissing(u32),

    #[error("call target is missing")]
    MissingCallTarget,

    #[error("promised answer target is missing")]
    MissingPromisedAnswer,

    #[error("third-party completion payload is missing")]
    MissingThirdPartyPayload,

    #[error("unexpected return for forwarded question {0}")]
    UnexpectedForwardedTailReturn(u32),

    #[error("invalid message tag {0}")]
    InvalidMessageTag(u16),

    #[error("duplicate provide recipient")]
    DuplicateProvideRecipient,

    #[error("duplicate provide question {0}")]
    DuplicateProvideQuestionId(u32),

    #[error("duplicate join question {0}")]
    DuplicateJoinQuestionId(u32),

    #[error("duplicate awaitFromThirdParty completion")]
    DuplicateThirdPartyAwait,

    #[error("duplicate buffered return for third-party answer {0}")]
    DuplicateThirdPartyReturn(u32),

    #[error("conflicting thirdPartyAnswer completion")]
    ConflictingThirdPartyAnswer,

    #[error("malformed message: {0}")]
    MalformedMessage(&'static str),

    #[error("remote aborted: {0}")]
    RemoteAbort(String),

    #[error("transport: {0}")]
    Transport(String),

    #[error("codec: {0}")]
    Codec(#[from] capnp::Error),
}

impl From<capnp::NotInSchema> for Error {
    fn from(err: capnp::NotInSchema) -> Self {
        Error::InvalidMessageTag(err.0)
    }
}
