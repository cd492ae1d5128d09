use thiserror::Error;

/// Error taxonomy for the stream engine and its collaborators.
///
/// Validation errors are fatal to the current `append` but never to an
/// enclosing sync's already-appended prefix. `OtsPending` and
/// `OtsWaitingConfirmations` are non-errors for `append` and surface as
/// warnings from `ots verify`.
#[derive(Error, Debug)]
pub enum StreamError {
    // Validation
    #[error("event author {found} does not match stream owner {expected}")]
    WrongAuthor { expected: String, found: String },

    #[error("signature verification failed for event {0}")]
    InvalidSignature(String),

    #[error("chain break: expected prev {expected}, event {id} carries prev {found}")]
    ChainBreak {
        id: String,
        expected: String,
        found: String,
    },

    #[error("event {0} carries no OTS attestation")]
    MissingOts(String),

    #[error("nonlinear attestation: event {id} attested at {attested} before {reference}")]
    NonlinearAttestation {
        id: String,
        attested: i64,
        reference: i64,
    },

    #[error("fork detected: events {first} and {second} both claim prev {prev}")]
    Fork {
        prev: String,
        first: String,
        second: String,
    },

    // OTS state
    #[error("timestamp pending confirmation in the Bitcoin blockchain")]
    OtsPending,

    #[error("timestamp waiting for 5 confirmations")]
    OtsWaitingConfirmations,

    #[error("malformed OTS attestation: {0}")]
    OtsMalformed(String),

    #[error("OTS upgrade failed: {0}")]
    OtsUpgradeFailed(String),

    // Transport
    #[error("failed to dial relay {url}: {reason}")]
    RelayDialFailed { url: String, reason: String },

    #[error("publish failed: {0}")]
    PublishFailed(String),

    #[error("OTS calendar unreachable: {0}")]
    CalendarUnreachable(String),

    #[error("Bitcoin RPC error: {0}")]
    BitcoinRpc(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // Config / store
    #[error("no active stream set, run `es switch <name>` first")]
    NoActiveStream,

    #[error("name {name} is ambiguous: streams {first} and {second} both use it")]
    AmbiguousName {
        name: String,
        first: String,
        second: String,
    },

    #[error("could not find stream {0}")]
    NameNotFound(String),

    #[error("stream is read-only: no private key present")]
    ReadOnly,

    #[error("relay pool is empty")]
    EmptyPool,

    #[error("relay {0} already added")]
    AlreadyAdded(String),

    #[error("relay {0} not found")]
    NotFound(String),

    // Ambient
    #[error("key error: {0}")]
    Key(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StreamError>;
