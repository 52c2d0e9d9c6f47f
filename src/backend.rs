//! The narrow interface between graph construction and the scheduler that
//! consumes the graph.
pub mod recorder;
pub mod serial;

use crate::collective::ReduceDetails;
use crate::error::Result;
use crate::flow::{Flow, FlowRelation};
use crate::key::Key;
use crate::publish::PublicationDetails;
use crate::task::{TaskDescriptor, TaskId};
use crate::usage::{UseId, UseRecord};

pub use recorder::{Call, Recorder};
pub use serial::Serial;

/// A scheduler that consumes flows, uses and tasks.
///
/// Every method is a notification from the front end, issued in the order the
/// dependency graph is built. Uses passed to [`Backend::release_use`] and
/// [`Backend::reduce_collection_use`] are handed over by value: the front end
/// no longer tracks them. A published use stays with the front end until its
/// last reader fetched it, then it is released.
///
/// A backend that [executes tasks](Backend::executes_tasks) hands ready tasks
/// back through [`Backend::next_ready_task`] and fills the data slot of each
/// dependency in [`Backend::acquire_data`] before the task body runs.
pub trait Backend {
    fn make_initial_flow(&mut self, flow: &Flow);

    fn make_null_flow(&mut self, flow: &Flow);

    fn make_same_flow(&mut self, flow: &Flow);

    fn make_next_flow(&mut self, flow: &Flow);

    fn make_forwarding_flow(&mut self, flow: &Flow);

    fn make_indexed_flow(&mut self, flow: &Flow);

    fn fetch_flow(&mut self, flow: &Flow, key: &Key, version: &Key);

    /// Declares `to` equivalent to `from`.
    fn establish_flow_alias(&mut self, from: &Flow, to: &Flow);

    fn register_use(&mut self, id: UseId, record: &UseRecord);

    fn release_use(&mut self, id: UseId, record: UseRecord);

    fn publish_use(&mut self, id: UseId, record: &UseRecord, details: &PublicationDetails);

    fn register_task(&mut self, task: &TaskDescriptor);

    fn reduce_collection_use(
        &mut self,
        collection: (UseId, UseRecord),
        output: (UseId, UseRecord),
        details: &ReduceDetails,
    );

    /// Points the use's data slot at the value its input flow carries.
    fn acquire_data(&mut self, _id: UseId, _record: &mut UseRecord) -> Result<()> {
        Ok(())
    }

    fn next_ready_task(&mut self) -> Result<Option<TaskId>> {
        Ok(None)
    }

    fn executes_tasks(&self) -> bool {
        false
    }
}

/// Tells the backend about a freshly derived flow.
pub(crate) fn announce<B: Backend>(backend: &mut B, flow: &Flow) {
    match &flow.relation {
        FlowRelation::Initial => backend.make_initial_flow(flow),
        FlowRelation::Null => backend.make_null_flow(flow),
        FlowRelation::Same(_) => backend.make_same_flow(flow),
        FlowRelation::Next(_) => backend.make_next_flow(flow),
        FlowRelation::Forwarding(_) => backend.make_forwarding_flow(flow),
        FlowRelation::Indexed { .. } => backend.make_indexed_flow(flow),
        FlowRelation::Fetching { version } => backend.fetch_flow(flow, &flow.key, version),
    }
}
