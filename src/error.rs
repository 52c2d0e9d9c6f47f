pub use anyhow::Error as RuntimeError;
use thiserror::Error;

use crate::flow::FlowId;
use crate::key::Key;
use crate::permissions::{CaptureOp, Permissions};
use crate::usage::UseId;

/// Raised by [`CaptureOp::resolve`] when the requested operator cannot be
/// granted from the source permission.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("cannot apply {op:?} to a source holding {held}")]
pub struct InvalidCapture {
    pub op: CaptureOp,
    pub held: Permissions,
}

/// Two downgrades that clear opposing bits cannot be combined.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DowngradeConflict {
    #[error("a capture cannot be both read-only and write-only")]
    ReadAndWriteOnly,

    #[error("a capture cannot be both schedule-only and leaf")]
    ScheduleOnlyAndLeaf,
}

/// Every violation detected while deriving the dependency graph.
///
/// None of these are recoverable: the call that detects one returns it, and
/// [`Runtime::run`](crate::Runtime::run) aborts with it.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("Key {key}: {operation} needs {requested} but the enclosing scope holds scheduling {scheduling}, immediate {immediate}")]
    PermissionDenied {
        key: Key,
        operation: &'static str,
        requested: String,
        scheduling: Permissions,
        immediate: Permissions,
    },

    #[error("Key {key}: capture with scheduling permission None (leaf use)")]
    LeafCapture { key: Key },

    #[error("Key {key}: captured more than once by the same task without allowing aliasing")]
    UnallowedAliasing { key: Key },

    #[error("Key {key}: handle is not available in this scope")]
    NotInScope { key: Key },

    #[error("Use {0} was released")]
    UseAfterRelease(UseId),

    #[error("Key {key}: flow {flow} was released")]
    FlowReleased { key: Key, flow: FlowId },

    #[error("Key {key}: flow {flow} was already advanced")]
    DoubleAdvance { key: Key, flow: FlowId },

    #[error("Key {key}: flow {found} does not continue from flow {expected}")]
    LineageBroken {
        key: Key,
        expected: FlowId,
        found: FlowId,
    },

    #[error("Key {key}: no publication at version {version}")]
    UnknownPublication { key: Key, version: Key },

    #[error("Key {key}: version {version} is already published")]
    DuplicatePublication { key: Key, version: Key },

    #[error("Key {key}: version {version} was published for {readers} reader(s), fetched {fetches} time(s)")]
    ReaderCountExceeded {
        key: Key,
        version: Key,
        readers: usize,
        fetches: usize,
    },

    #[error("Key {key}: version {version} was published for {readers} reader(s), fetched {fetches} time(s) when the run ended")]
    ReadersMissing {
        key: Key,
        version: Key,
        readers: usize,
        fetches: usize,
    },

    #[error("Key {key}: a publication needs at least one reader")]
    InvalidReaderCount { key: Key },

    #[error("Key {key}: index {index} is outside a collection of {len} elements")]
    IndexOutOfRange { key: Key, index: usize, len: usize },

    #[error("Key {key}: element {index} would be written by more than one task")]
    ConflictingCollectionWrite { key: Key, index: usize },

    #[error("Key {key}: concurrent tasks can only read plain handles")]
    ConcurrentWrite { key: Key },

    #[error("Key {key}: a collective tagged {tag} is already pending")]
    DuplicateCollectiveTag { key: Key, tag: Key },

    #[error("Key {key}: read before any value was written")]
    Uninitialized { key: Key },

    #[error("Key {key}: holds {found}, accessed as {expected}")]
    TypeMismatch {
        key: Key,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Key {key}: {message}")]
    Collective { key: Key, message: String },

    #[error(transparent)]
    Downgrade(#[from] DowngradeConflict),

    #[error("More than {0} tasks were executed")]
    TaskLimitExceeded(usize),

    #[error("{0} task(s) never became ready")]
    Stalled(usize),

    #[error("Task '{0}':\n{1}")]
    Task(String, anyhow::Error),

    #[error(transparent)]
    Config(#[from] serde_json::Error),
}

pub type Result<T, E = FlowError> = std::result::Result<T, E>;
