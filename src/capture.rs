//! Capture requests, descriptions and the table that decides which flows a
//! capture derives.
use serde::{Deserialize, Serialize};

use crate::handle::{Capturable, CaptureTarget, VarId};
use crate::permissions::{CaptureOp, Downgrade, PermissionPair, Permissions};
use crate::usage::UseId;

/// How a request picks its permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Resolve `op` against the source after applying `downgrade`.
    Op { op: CaptureOp, downgrade: Downgrade },
    /// Ask for exactly this pair.
    Exact(PermissionPair),
}

#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub target: CaptureTarget,
    pub request: Request,
}

/// The captures a task asks for, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct Captures {
    pub(crate) requests: Vec<CaptureRequest>,
    pub(crate) allow_aliasing: bool,
}

impl Captures {
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures with the default (modify) request, narrowed by `downgrade`.
    pub fn capture(mut self, target: &impl Capturable, downgrade: Downgrade) -> Self {
        self.requests.push(CaptureRequest {
            target: target.target(),
            request: Request::Op {
                op: CaptureOp::Modify,
                downgrade,
            },
        });
        self
    }

    pub fn capture_exact(mut self, target: &impl Capturable, permissions: PermissionPair) -> Self {
        self.requests.push(CaptureRequest {
            target: target.target(),
            request: Request::Exact(permissions),
        });
        self
    }

    pub fn modify(self, target: &impl Capturable) -> Self {
        self.capture(target, Downgrade::NONE)
    }

    pub fn reads(self, target: &impl Capturable) -> Self {
        self.capture(target, Downgrade::reads())
    }

    pub fn writes(self, target: &impl Capturable) -> Self {
        self.capture(target, Downgrade::writes())
    }

    pub fn schedule_only(self, target: &impl Capturable) -> Self {
        self.capture(target, Downgrade::schedule_only())
    }

    pub fn leaf(self, target: &impl Capturable) -> Self {
        self.capture(target, Downgrade::leaf())
    }

    /// Lets the same handle be captured more than once; the requests are
    /// merged into a single capture.
    pub fn allow_aliasing(mut self) -> Self {
        self.allow_aliasing = true;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

/// One resolved capture, waiting to be materialized.
#[derive(Debug, Clone)]
pub struct CaptureDescription {
    pub target: CaptureTarget,
    /// The enclosing scope's use the capture derives from.
    pub source: UseId,
    pub requested: PermissionPair,
}

impl CaptureDescription {
    pub fn var(&self) -> VarId {
        self.target.var()
    }

    /// Widens the scheduling permission so that whatever `other` asks for,
    /// scheduling or immediate, can later be captured from this one.
    pub fn require_ability_to_schedule(&mut self, other: &CaptureDescription) {
        self.requested.scheduling =
            self.requested.scheduling | other.requested.scheduling | other.requested.immediate;
    }
}

/// Where a captured use's input flow comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputFlow {
    /// The same state as the source's input.
    Same,
    /// The state of the source's input after the source's own writes.
    Forwarding,
}

/// Which captured flow a continuation picks up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContinueFrom {
    CapturedIn,
    CapturedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationPlan {
    pub permissions: PermissionPair,
    pub from: ContinueFrom,
}

/// The flows a capture derives and what happens to the source afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturePlan {
    pub input: InputFlow,
    /// The captured use's output is the next version of its input.
    pub advance: bool,
    /// `None` when the source keeps its current use.
    pub continuation: Option<ContinuationPlan>,
}

/// Decides how to capture `requested` from a source holding `source`.
///
/// A source that may write its data right now has to hand its current state
/// over through a forwarding flow. A capture that may write (now or through
/// nested tasks) advances the lineage, and the source continues from the
/// captured output without immediate access.
pub fn plan(source: PermissionPair, requested: PermissionPair) -> CapturePlan {
    let input = if source.immediate.writes() {
        InputFlow::Forwarding
    } else {
        InputFlow::Same
    };

    match (requested.writes(), input) {
        (false, InputFlow::Same) => CapturePlan {
            input,
            advance: false,
            continuation: None,
        },
        (false, InputFlow::Forwarding) => CapturePlan {
            input,
            advance: false,
            continuation: Some(ContinuationPlan {
                permissions: PermissionPair::new(
                    source.scheduling,
                    source.immediate.without_write(),
                ),
                from: ContinueFrom::CapturedIn,
            }),
        },
        (true, _) => CapturePlan {
            input,
            advance: true,
            continuation: Some(ContinuationPlan {
                permissions: PermissionPair::new(source.scheduling, Permissions::None),
                from: ContinueFrom::CapturedOut,
            }),
        },
    }
}

/// Merges the captures of a conditional construct into one description per
/// variable.
///
/// The immediate part comes from the condition alone. The scheduling part
/// must cover everything any branch may later capture.
pub fn reconcile(
    condition: Vec<CaptureDescription>,
    branches: &[&[CaptureDescription]],
) -> Vec<CaptureDescription> {
    let mut merged = condition;

    for branch in branches {
        for desc in branch.iter() {
            let index = match merged.iter().position(|m| m.var() == desc.var()) {
                Some(index) => index,
                None => {
                    merged.push(CaptureDescription {
                        target: desc.target.clone(),
                        source: desc.source,
                        requested: PermissionPair::default(),
                    });
                    merged.len() - 1
                }
            };
            merged[index].require_ability_to_schedule(desc);
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowId;
    use crate::key;
    use crate::usage::{UseArena, UseKind, UseRecord};
    use Permissions as P;

    fn pair(s: P, i: P) -> PermissionPair {
        PermissionPair::new(s, i)
    }

    #[test]
    fn test_read_from_scheduling_only_source() {
        let plan = plan(pair(P::Modify, P::None), pair(P::Read, P::Read));
        assert_eq!(plan.input, InputFlow::Same);
        assert!(!plan.advance);
        assert_eq!(plan.continuation, None);
    }

    #[test]
    fn test_modify_from_scheduling_only_source() {
        let plan = plan(pair(P::Modify, P::None), pair(P::Modify, P::Modify));
        assert_eq!(plan.input, InputFlow::Same);
        assert!(plan.advance);
        assert_eq!(
            plan.continuation,
            Some(ContinuationPlan {
                permissions: pair(P::Modify, P::None),
                from: ContinueFrom::CapturedOut,
            })
        );
    }

    #[test]
    fn test_read_from_modifying_source_forwards() {
        let plan = plan(pair(P::Modify, P::Modify), pair(P::None, P::Read));
        assert_eq!(plan.input, InputFlow::Forwarding);
        assert!(!plan.advance);
        assert_eq!(
            plan.continuation,
            Some(ContinuationPlan {
                permissions: pair(P::Modify, P::Read),
                from: ContinueFrom::CapturedIn,
            })
        );
    }

    #[test]
    fn test_modify_from_modifying_source() {
        let plan = plan(pair(P::Modify, P::Modify), pair(P::Modify, P::Modify));
        assert_eq!(plan.input, InputFlow::Forwarding);
        assert!(plan.advance);
        assert_eq!(
            plan.continuation.map(|c| (c.permissions, c.from)),
            Some((pair(P::Modify, P::None), ContinueFrom::CapturedOut))
        );
    }

    #[test]
    fn test_modify_from_reading_source() {
        let plan = plan(pair(P::Modify, P::Read), pair(P::Modify, P::Modify));
        assert_eq!(plan.input, InputFlow::Same);
        assert!(plan.advance);
        assert_eq!(
            plan.continuation.map(|c| c.permissions),
            Some(pair(P::Modify, P::None))
        );
    }

    #[test]
    fn test_schedule_only_write_advances() {
        let plan = plan(pair(P::Modify, P::None), pair(P::Modify, P::None));
        assert!(plan.advance);
    }

    fn description(var: u32, requested: PermissionPair) -> CaptureDescription {
        let mut arena = UseArena::new();
        let source = arena.insert(UseRecord::new(
            key!("h"),
            VarId(var),
            (FlowId(0), FlowId(1)),
            pair(P::Modify, P::None),
            UseKind::Handle,
            "i32",
        ));
        CaptureDescription {
            target: CaptureTarget::Handle(VarId(var)),
            source,
            requested,
        }
    }

    #[test]
    fn test_reconcile_unions_branches() {
        let then = [description(0, pair(P::Write, P::Write))];
        let otherwise = [description(0, pair(P::Read, P::Read))];

        let merged = reconcile(Vec::new(), &[&then[..], &otherwise[..]]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].requested, pair(P::Modify, P::None));
    }

    #[test]
    fn test_reconcile_keeps_condition_immediate() {
        let condition = vec![description(0, pair(P::Read, P::Read))];
        let body = [
            description(0, pair(P::Modify, P::Modify)),
            description(1, pair(P::None, P::Read)),
        ];

        let merged = reconcile(condition, &[&body[..]]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].requested, pair(P::Modify, P::Read));
        assert_eq!(merged[1].requested, pair(P::Read, P::None));
    }
}
