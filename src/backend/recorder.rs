use serde::Serialize;

use crate::backend::Backend;
use crate::collective::{ReduceDetails, ReduceOp};
use crate::flow::{Flow, FlowId};
use crate::key::Key;
use crate::permissions::PermissionPair;
use crate::publish::PublicationDetails;
use crate::task::{TaskDescriptor, TaskId};
use crate::usage::{UseId, UseRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FlowOp {
    Initial,
    Null,
    Same,
    Next,
    Forwarding,
    Indexed,
    Fetch,
}

#[derive(Debug, Clone, Serialize)]
pub struct UseSummary {
    pub id: UseId,
    pub key: Key,
    pub in_flow: FlowId,
    pub out_flow: FlowId,
    pub permissions: PermissionPair,
}

impl UseSummary {
    fn of(id: UseId, record: &UseRecord) -> Self {
        Self {
            id,
            key: record.key.clone(),
            in_flow: record.in_flow,
            out_flow: record.out_flow,
            permissions: record.permissions,
        }
    }
}

/// One notification received by a [`Recorder`].
#[derive(Debug, Clone, Serialize)]
pub enum Call {
    Flow(FlowOp, Flow),
    Alias { from: FlowId, to: FlowId },
    RegisterUse(UseSummary),
    ReleaseUse { summary: UseSummary, produced: bool },
    PublishUse { summary: UseSummary, details: PublicationDetails },
    RegisterTask(TaskDescriptor),
    Reduce {
        collection: UseSummary,
        output: UseSummary,
        op: ReduceOp,
        tag: Key,
    },
}

/// A backend that never runs anything and remembers every call.
///
/// Useful to inspect the graph a program derives without executing it.
#[derive(Debug, Default)]
pub struct Recorder {
    calls: Vec<Call>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.calls)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskDescriptor> {
        self.calls.iter().filter_map(|call| match call {
            Call::RegisterTask(task) => Some(task),
            _ => None,
        })
    }

    pub fn task_named(&self, name: &str) -> Option<&TaskDescriptor> {
        self.tasks().find(|task| task.name == name)
    }

    /// The most recent registration of `id`.
    pub fn registered(&self, id: UseId) -> Option<&UseSummary> {
        self.calls.iter().rev().find_map(|call| match call {
            Call::RegisterUse(summary) if summary.id == id => Some(summary),
            _ => None,
        })
    }

    /// Uses the task depends on, as they were registered.
    pub fn dependencies_of(&self, task: TaskId) -> Vec<&UseSummary> {
        let Some(descriptor) = self.tasks().find(|t| t.id == task) else {
            return Vec::new();
        };
        let position = self
            .calls
            .iter()
            .position(|call| matches!(call, Call::RegisterTask(t) if t.id == task))
            .unwrap_or(self.calls.len());

        descriptor
            .dependencies
            .iter()
            .filter_map(|id| {
                self.calls[..position].iter().rev().find_map(|call| match call {
                    Call::RegisterUse(summary) if summary.id == *id => Some(summary),
                    _ => None,
                })
            })
            .collect()
    }

    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.calls.iter().filter(|call| predicate(call)).count()
    }

    fn flow(&mut self, op: FlowOp, flow: &Flow) {
        self.calls.push(Call::Flow(op, flow.clone()));
    }
}

impl Backend for Recorder {
    fn make_initial_flow(&mut self, flow: &Flow) {
        self.flow(FlowOp::Initial, flow);
    }

    fn make_null_flow(&mut self, flow: &Flow) {
        self.flow(FlowOp::Null, flow);
    }

    fn make_same_flow(&mut self, flow: &Flow) {
        self.flow(FlowOp::Same, flow);
    }

    fn make_next_flow(&mut self, flow: &Flow) {
        self.flow(FlowOp::Next, flow);
    }

    fn make_forwarding_flow(&mut self, flow: &Flow) {
        self.flow(FlowOp::Forwarding, flow);
    }

    fn make_indexed_flow(&mut self, flow: &Flow) {
        self.flow(FlowOp::Indexed, flow);
    }

    fn fetch_flow(&mut self, flow: &Flow, _key: &Key, _version: &Key) {
        self.flow(FlowOp::Fetch, flow);
    }

    fn establish_flow_alias(&mut self, from: &Flow, to: &Flow) {
        self.calls.push(Call::Alias {
            from: from.id,
            to: to.id,
        });
    }

    fn register_use(&mut self, id: UseId, record: &UseRecord) {
        self.calls.push(Call::RegisterUse(UseSummary::of(id, record)));
    }

    fn release_use(&mut self, id: UseId, record: UseRecord) {
        self.calls.push(Call::ReleaseUse {
            summary: UseSummary::of(id, &record),
            produced: record.produces_output(),
        });
    }

    fn publish_use(&mut self, id: UseId, record: &UseRecord, details: &PublicationDetails) {
        self.calls.push(Call::PublishUse {
            summary: UseSummary::of(id, record),
            details: details.clone(),
        });
    }

    fn register_task(&mut self, task: &TaskDescriptor) {
        self.calls.push(Call::RegisterTask(task.clone()));
    }

    fn reduce_collection_use(
        &mut self,
        (collection_id, collection): (UseId, UseRecord),
        (output_id, output): (UseId, UseRecord),
        details: &ReduceDetails,
    ) {
        self.calls.push(Call::Reduce {
            collection: UseSummary::of(collection_id, &collection),
            output: UseSummary::of(output_id, &output),
            op: details.op,
            tag: details.tag.clone(),
        });
    }
}
