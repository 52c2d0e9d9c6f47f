#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod backend;
mod builder;
mod capture;
mod collective;
mod config;
mod core;
mod error;
mod flow;
mod handle;
mod key;
pub mod mapping;
mod permissions;
mod publish;
mod runtime;
mod task;
mod usage;
mod utils;

pub use crate::backend::{Backend, Call, Recorder, Serial};
pub use crate::builder::{
    ConcurrentDef, IfDef, IfElse, IfThen, TaskDef, WhileDef, WhileDo, WhileReady,
};
pub use crate::capture::{CaptureDescription, CaptureRequest, Captures, Request};
pub use crate::collective::{CombineError, ReduceDetails, ReduceOp, ReduceOptions, Reducible};
pub use crate::config::Config;
pub use crate::error::*;
pub use crate::flow::{Flow, FlowId, FlowRelation, FlowState, Shape};
pub use crate::handle::{AccessHandle, AccessHandleCollection, Capturable, CaptureTarget, VarId};
pub use crate::key::{Hash32, Key, KeyPart};
pub use crate::mapping::{
    Block, Composite, Identity, IndexMapping, IndexRange, MappingExt, Range1d, Range2d, Reverse,
    Transpose,
};
pub use crate::permissions::{
    Access, CaptureOp, Downgrade, PermissionPair, Permissions, Scope, requested_permissions,
};
pub use crate::publish::{PublicationDetails, PublishOptions};
pub use crate::runtime::{Context, Runtime};
pub use crate::task::{Diagnostics, TaskDescriptor, TaskExecution, TaskId, TaskKind};
pub use crate::usage::{Data, Dynamic, UseId, UseKind, UseRecord, UseState};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
