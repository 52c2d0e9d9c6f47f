use std::collections::{HashMap, VecDeque};

use petgraph::Graph;
use petgraph::graph::NodeIndex;

use crate::backend::Backend;
use crate::collective::ReduceDetails;
use crate::error::{FlowError, Result};
use crate::flow::{Flow, FlowId, Shape};
use crate::key::Key;
use crate::permissions::PermissionPair;
use crate::publish::PublicationDetails;
use crate::task::{TaskDescriptor, TaskId};
use crate::usage::{Dynamic, UseId, UseKind, UseRecord};

/// The state a flow stands for, once known.
#[derive(Debug, Clone)]
enum Value {
    Single(Option<Dynamic>),
    Elements(Vec<Option<Dynamic>>),
}

/// A collection flow whose elements are `base` overwritten by whatever its
/// indexed children produce.
#[derive(Debug, Clone, Copy)]
struct Assembly {
    target: FlowId,
    base: FlowId,
}

/// Shared by every flow of one equivalence class; only the root's is used.
#[derive(Debug, Default)]
struct Slot {
    value: Option<Value>,
    indexed: Vec<(FlowId, usize)>,
    assembly: Option<Assembly>,
    producer: Option<TaskId>,
}

#[derive(Debug, Clone, Copy)]
struct Dependency {
    in_flow: FlowId,
    permissions: PermissionPair,
    elementwise: bool,
}

#[derive(Debug)]
struct Waiting {
    id: TaskId,
    dependencies: Vec<UseId>,
}

#[derive(Debug)]
struct Reduction {
    key: Key,
    collection: FlowId,
    output_in: FlowId,
    output_out: FlowId,
    details: ReduceDetails,
}

/// Runs tasks one at a time on the calling thread, in registration order
/// among those whose inputs are available.
///
/// Flows declared equivalent (derived as the same state, aliased, or
/// matched by a fetch) share one slot, so a value produced through any of
/// them is seen through all of them.
#[derive(Debug, Default)]
pub struct Serial {
    parents: Vec<usize>,
    slots: Vec<Slot>,
    /// Element flows derived from a collection flow, by that flow.
    children: HashMap<FlowId, Vec<(usize, FlowId)>>,
    /// Forwarding flows waiting for the use that owns their parent.
    forwards: HashMap<FlowId, Vec<FlowId>>,
    publications: HashMap<(Key, Key), FlowId>,
    awaiting: Vec<(FlowId, Key, Key)>,
    uses: HashMap<UseId, Dependency>,
    owners: HashMap<UseId, TaskId>,
    waiting: VecDeque<Waiting>,
    reductions: Vec<Reduction>,
    graph: Graph<String, ()>,
    nodes: HashMap<TaskId, NodeIndex>,
}

impl Serial {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tasks as nodes, an edge from each task to the tasks that consumed a
    /// value it produced.
    pub fn graph(&self) -> &Graph<String, ()> {
        &self.graph
    }

    pub fn waiting(&self) -> usize {
        self.waiting.len()
    }

    fn add(&mut self, flow: &Flow) {
        let index = flow.id.index();
        while self.slots.len() <= index {
            self.parents.push(self.slots.len());
            self.slots.push(Slot::default());
        }
    }

    fn find(&self, flow: FlowId) -> usize {
        let mut index = flow.index();
        while self.parents[index] != index {
            index = self.parents[index];
        }
        index
    }

    fn union(&mut self, a: FlowId, b: FlowId) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        self.parents[rb] = ra;

        let merged = std::mem::take(&mut self.slots[rb]);
        let root = &mut self.slots[ra];
        if root.value.is_none() {
            root.value = merged.value;
        }
        root.indexed.extend(merged.indexed);
        if root.assembly.is_none() {
            root.assembly = merged.assembly;
        }
        if root.producer.is_none() {
            root.producer = merged.producer;
        }
    }

    fn produce(&mut self, flow: FlowId, value: Value, producer: Option<TaskId>) {
        let root = self.find(flow);
        let slot = &mut self.slots[root];
        slot.value = Some(value);
        slot.producer = producer;
    }

    fn assemble(&mut self, target: FlowId, base: FlowId) {
        let root = self.find(target);
        self.slots[root].assembly = Some(Assembly { target, base });
    }

    /// The value of `flow`, if everything it depends on was produced.
    ///
    /// `exclude` is the class being assembled, so that an element never
    /// falls back on the collection it is part of.
    fn resolve(&self, flow: FlowId, exclude: Option<usize>) -> Option<Value> {
        let root = self.find(flow);
        let slot = &self.slots[root];
        if let Some(value) = &slot.value {
            return Some(value.clone());
        }

        if let Some(assembly) = slot.assembly {
            let Value::Elements(mut elements) = self.resolve(assembly.base, None)? else {
                return None;
            };
            for &(index, child) in self.children.get(&assembly.target).into_iter().flatten() {
                let Value::Single(value) = self.resolve(child, Some(root))? else {
                    return None;
                };
                if let Some(element) = elements.get_mut(index) {
                    *element = value;
                }
            }
            return Some(Value::Elements(elements));
        }

        for &(parent, index) in &slot.indexed {
            if Some(self.find(parent)) == exclude {
                continue;
            }
            if let Some(Value::Elements(elements)) = self.resolve(parent, None) {
                return Some(Value::Single(elements.get(index).cloned().flatten()));
            }
        }
        None
    }

    fn is_ready(&self, id: &UseId) -> bool {
        match self.uses.get(id) {
            Some(dep) if !dep.permissions.immediate.is_none() => {
                self.resolve(dep.in_flow, None).is_some()
            }
            _ => true,
        }
    }

    fn run_reductions(&mut self) -> Result<()> {
        loop {
            let ready = self.reductions.iter().position(|r| {
                matches!(self.resolve(r.collection, None), Some(Value::Elements(_)))
                    && self.resolve(r.output_in, None).is_some()
            });
            let Some(position) = ready else {
                return Ok(());
            };

            let reduction = self.reductions.remove(position);
            let Some(Value::Elements(elements)) = self.resolve(reduction.collection, None) else {
                continue;
            };
            let total = (reduction.details.combine)(&elements).map_err(|err| FlowError::Collective {
                key: reduction.key.clone(),
                message: err.to_string(),
            })?;

            tracing::debug!("reduced {} elements into {}", elements.len(), reduction.key);
            self.produce(reduction.output_out, Value::Single(Some(total)), None);
        }
    }
}

impl Backend for Serial {
    fn make_initial_flow(&mut self, flow: &Flow) {
        self.add(flow);
        let value = match flow.shape {
            Shape::Single => Value::Single(None),
            Shape::Collection(len) => Value::Elements(vec![None; len]),
        };
        self.produce(flow.id, value, None);
    }

    fn make_null_flow(&mut self, flow: &Flow) {
        self.add(flow);
    }

    fn make_same_flow(&mut self, flow: &Flow) {
        self.add(flow);
        if let Some(parent) = flow.relation.parent() {
            self.union(parent, flow.id);
        }
    }

    fn make_next_flow(&mut self, flow: &Flow) {
        self.add(flow);
    }

    fn make_forwarding_flow(&mut self, flow: &Flow) {
        self.add(flow);
        if let Some(parent) = flow.relation.parent() {
            self.forwards.entry(parent).or_default().push(flow.id);
        }
    }

    fn make_indexed_flow(&mut self, flow: &Flow) {
        self.add(flow);
        if let crate::flow::FlowRelation::Indexed { parent, index } = flow.relation {
            let root = self.find(flow.id);
            self.slots[root].indexed.push((parent, index));
            self.children.entry(parent).or_default().push((index, flow.id));
        }
    }

    fn fetch_flow(&mut self, flow: &Flow, key: &Key, version: &Key) {
        self.add(flow);
        match self.publications.get(&(key.clone(), version.clone())) {
            Some(&published) => self.union(published, flow.id),
            None => self.awaiting.push((flow.id, key.clone(), version.clone())),
        }
    }

    fn establish_flow_alias(&mut self, from: &Flow, to: &Flow) {
        // elements of `to` may still be produced one by one
        if self.children.contains_key(&to.id) {
            self.assemble(to.id, from.id);
        } else {
            self.union(from.id, to.id);
        }
    }

    fn register_use(&mut self, id: UseId, record: &UseRecord) {
        self.uses.insert(
            id,
            Dependency {
                in_flow: record.in_flow,
                permissions: record.permissions,
                elementwise: matches!(record.kind, UseKind::Collection(_)),
            },
        );
    }

    fn release_use(&mut self, id: UseId, mut record: UseRecord) {
        let producer = self.owners.remove(&id);
        let elementwise = self
            .uses
            .remove(&id)
            .is_some_and(|dep| dep.elementwise);

        if record.produces_output() {
            if elementwise {
                self.assemble(record.out_flow, record.in_flow);
            } else {
                let data = record.shared();
                self.produce(record.out_flow, Value::Single(data), producer);
            }
        }

        if record.superseded {
            for flow in self.forwards.remove(&record.in_flow).unwrap_or_default() {
                if elementwise {
                    self.assemble(flow, record.in_flow);
                } else {
                    let data = record.shared();
                    self.produce(flow, Value::Single(data), producer);
                }
            }
        }
    }

    fn publish_use(&mut self, _id: UseId, record: &UseRecord, details: &PublicationDetails) {
        let slot = (record.key.clone(), details.version.clone());
        self.publications.insert(slot, record.in_flow);

        let (matched, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.awaiting)
            .into_iter()
            .partition(|(_, key, version)| *key == record.key && *version == details.version);
        self.awaiting = rest;
        for (flow, _, _) in matched {
            self.union(record.in_flow, flow);
        }
    }

    fn register_task(&mut self, task: &TaskDescriptor) {
        for &dep in &task.dependencies {
            self.owners.insert(dep, task.id);
        }
        let node = self.graph.add_node(format!("{} {}", task.id, task.name));
        self.nodes.insert(task.id, node);
        self.waiting.push_back(Waiting {
            id: task.id,
            dependencies: task.dependencies.clone(),
        });
    }

    fn reduce_collection_use(
        &mut self,
        (collection_id, collection): (UseId, UseRecord),
        (output_id, output): (UseId, UseRecord),
        details: &ReduceDetails,
    ) {
        self.uses.remove(&collection_id);
        self.uses.remove(&output_id);
        self.reductions.push(Reduction {
            key: output.key.clone(),
            collection: collection.in_flow,
            output_in: output.in_flow,
            output_out: output.out_flow,
            details: details.clone(),
        });
    }

    fn acquire_data(&mut self, id: UseId, record: &mut UseRecord) -> Result<()> {
        let Some(dep) = self.uses.get(&id) else {
            return Ok(());
        };
        if dep.permissions.immediate.is_none() || dep.elementwise {
            return Ok(());
        }
        if let Some(Value::Single(data)) = self.resolve(dep.in_flow, None) {
            record.fill(data);
        }
        Ok(())
    }

    fn next_ready_task(&mut self) -> Result<Option<TaskId>> {
        self.run_reductions()?;

        let Some(position) = self
            .waiting
            .iter()
            .position(|task| task.dependencies.iter().all(|dep| self.is_ready(dep)))
        else {
            return Ok(None);
        };
        let Some(task) = self.waiting.remove(position) else {
            return Ok(None);
        };

        let node = self.nodes.get(&task.id).copied();
        for dep in &task.dependencies {
            let producer = self
                .uses
                .get(dep)
                .and_then(|dep| self.slots[self.find(dep.in_flow)].producer);
            if let (Some(producer), Some(node)) = (producer, node)
                && let Some(&source) = self.nodes.get(&producer)
            {
                self.graph.update_edge(source, node, ());
            }
        }

        Ok(Some(task.id))
    }

    fn executes_tasks(&self) -> bool {
        true
    }
}

impl std::fmt::Display for Serial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            writeln!(f, "    {:?}[\"{}\"]", index.index(), self.graph[index])?;
        }

        for edge in self.graph.edge_indices() {
            let Some((source, target)) = self.graph.edge_endpoints(edge) else {
                continue;
            };
            writeln!(f, "    {:?} --> {:?}", source.index(), target.index())?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::{ReduceOp, ReduceOptions};
    use crate::key;
    use crate::mapping::{Block, Range1d};
    use crate::publish::PublishOptions;
    use crate::runtime::Runtime;

    #[test]
    fn test_sum_of_collection() {
        let mut runtime = Runtime::new();
        let diagnostics = runtime
            .run(|ctx| {
                let c = ctx.initial_collection::<i64>(key!("c"), Range1d::upto(4))?;
                let total = ctx.initial_access::<i64>(key!("total"))?;

                let writer = c.clone();
                ctx.concurrent(4).name("write").writes(&c).run(move |ctx, i| {
                    let local = ctx.local(&writer)?;
                    ctx.set(&local, i as i64)?;
                    Ok(())
                })?;
                ctx.reduce(&c, &total, ReduceOptions::op(ReduceOp::Sum))?;
                ctx.concurrent(4).name("read").reads(&total).run(move |ctx, _| {
                    assert_eq!(*ctx.get(&total)?, 6);
                    Ok(())
                })?;
                Ok(())
            })
            .unwrap();

        // the four readers only run once every write landed
        assert_eq!(diagnostics.executed(), 8);
        let order = diagnostics.order();
        assert!(order[..4].iter().all(|n| n.starts_with("write[")));
        assert!(order[4..].iter().all(|n| n.starts_with("read[")));
    }

    #[test]
    fn test_reduction_overflow_fails_the_run() {
        let mut runtime = Runtime::new();
        let err = runtime
            .run(|ctx| {
                let c = ctx.initial_collection::<u8>(key!("bytes"), 2)?;
                let total = ctx.initial_access::<u8>(key!("total"))?;
                let writer = c.clone();
                ctx.concurrent(2).writes(&c).run(move |ctx, _| {
                    let local = ctx.local(&writer)?;
                    ctx.set(&local, 200)?;
                    Ok(())
                })?;
                ctx.reduce(&c, &total, ReduceOptions::op(ReduceOp::Sum))?;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(&err, FlowError::Collective { message, .. } if message.contains("overflows u8")));
    }

    #[test]
    fn test_duplicate_collective_tag() {
        let mut runtime = Runtime::new();
        let err = runtime
            .run(|ctx| {
                let c = ctx.initial_collection::<i64>(key!("c"), 2)?;
                let out = ctx.initial_access::<i64>(key!("out"))?;
                ctx.reduce(&c, &out, ReduceOptions::default().tag("a"))?;
                ctx.reduce(&c, &out, ReduceOptions::default().tag("a"))?;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, FlowError::DuplicateCollectiveTag { .. }));
    }

    #[test]
    fn test_unwritten_element_fails_reduction() {
        let mut runtime = Runtime::new();
        let err = runtime
            .run(|ctx| {
                let c = ctx.initial_collection::<i64>(key!("c"), 2)?;
                let out = ctx.initial_access::<i64>(key!("out"))?;
                ctx.reduce(&c, &out, ReduceOptions::default())?;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, FlowError::Collective { .. }));
    }

    #[test]
    fn test_block_mapping_reads_shared_elements() {
        let mut runtime = Runtime::new();
        runtime
            .run(|ctx| {
                let c = ctx.initial_collection::<usize>(key!("c"), 2)?;
                let writer = c.clone();
                ctx.concurrent(2).modify(&c).run(move |ctx, i| {
                    let local = ctx.local(&writer)?;
                    ctx.set(&local, 100 + i)?;
                    Ok(())
                })?;

                let blocked = c.mapped(Block::new(2));
                let reader = blocked.clone();
                ctx.concurrent(4).reads(&blocked).run(move |ctx, i| {
                    let local = ctx.local(&reader)?;
                    assert_eq!(*ctx.get(&local)?, 100 + i / 2);
                    Ok(())
                })?;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_nested_writes_inside_group_members() {
        let mut runtime = Runtime::new();
        runtime
            .run(|ctx| {
                let c = ctx.initial_collection::<u32>(key!("c"), 2)?;
                let total = ctx.initial_access::<u32>(key!("total"))?;

                let writer = c.clone();
                ctx.concurrent(2).schedule_only(&c).run(move |ctx, i| {
                    let local = ctx.local(&writer)?;
                    ctx.task().modify(&local).run(move |ctx| {
                        ctx.set(&local, (i as u32 + 1) * 5)?;
                        Ok(())
                    })?;
                    Ok(())
                })?;
                ctx.reduce(&c, &total, ReduceOptions::op(ReduceOp::Max))?;
                ctx.task().reads(&total).run(move |ctx| {
                    assert_eq!(*ctx.get(&total)?, 10);
                    Ok(())
                })?;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_fetch_before_publish_resolves() {
        let mut runtime = Runtime::new();
        runtime
            .run(|ctx| {
                let early = ctx.fetch::<String>(key!("msg"), "v")?;
                ctx.task().name("reader").reads(&early).run(move |ctx| {
                    assert_eq!(ctx.get(&early)?, "hello");
                    Ok(())
                })?;

                let h = ctx.initial_access::<String>(key!("msg"))?;
                ctx.task().name("writer").writes(&h).run(move |ctx| {
                    ctx.set(&h, "hello".to_string())?;
                    Ok(())
                })?;
                ctx.publish(&h, PublishOptions::default().version("v"))?;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_empty_collection_reduces_to_identity() {
        let mut runtime = Runtime::new();
        let diagnostics = runtime
            .run(|ctx| {
                let c = ctx.initial_collection::<i32>(key!("c"), 0)?;
                let product = ctx.initial_access::<i32>(key!("product"))?;
                ctx.reduce(&c, &product, ReduceOptions::op(ReduceOp::Product))?;
                ctx.task().reads(&product).run(move |ctx| {
                    assert_eq!(*ctx.get(&product)?, 1);
                    Ok(())
                })?;
                Ok(())
            })
            .unwrap();
        assert_eq!(diagnostics.executed(), 1);
    }

    #[test]
    fn test_mermaid_output() {
        let mut runtime = Runtime::new();
        runtime
            .run(|ctx| {
                let h = ctx.initial_access::<i32>(key!("h"))?;
                ctx.task().name("first").writes(&h).run(move |ctx| {
                    ctx.set(&h, 1)?;
                    Ok(())
                })?;
                ctx.task().name("second").reads(&h).run(|_| Ok(()))?;
                Ok(())
            })
            .unwrap();

        let rendered = runtime.backend().to_string();
        assert!(rendered.starts_with("graph LR"));
        assert!(rendered.contains("first"));
        assert!(rendered.contains("0 --> 1"));
        assert_eq!(runtime.backend().graph().edge_count(), 1);
    }
}
