//! Graph construction: variables, uses and captures, plus the bookkeeping for
//! publications, collectives and concurrent groups.
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::backend::{Backend, announce};
use crate::capture::{
    CaptureDescription, CaptureRequest, Captures, ContinueFrom, InputFlow, Request, plan,
};
use crate::collective::ReduceDetails;
use crate::config::Config;
use crate::error::{FlowError, Result};
use crate::flow::{FlowId, FlowState, FlowTable, Shape};
use crate::handle::{CaptureTarget, VarId, VarRecord};
use crate::key::Key;
use crate::mapping::Identity;
use crate::permissions::{PermissionPair, Permissions, requested_permissions};
use crate::publish::{FetchOutcome, PublicationDetails, PublicationTable, PublishOptions};
use crate::task::TaskId;
use crate::usage::{
    CollectionUse, LocalUse, PublicationUse, UseArena, UseId, UseKind, UseRecord, UseState,
};

/// The uses visible to one task body, or to the top level.
#[derive(Debug, Default)]
pub(crate) struct Scope {
    pub task: Option<TaskId>,
    pub uses: BTreeMap<VarId, UseId>,
    /// Collection variable to the element variable a group member sees.
    pub locals: HashMap<VarId, VarId>,
    pub index: Option<usize>,
}

impl Scope {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn task(task: TaskId) -> Self {
        Self {
            task: Some(task),
            ..Default::default()
        }
    }
}

#[derive(Debug)]
struct Group {
    remaining: usize,
    uses: Vec<UseId>,
}

/// One task of a concurrent group, with its uses already in place.
#[derive(Debug)]
pub(crate) struct Member {
    pub task: TaskId,
    pub index: usize,
    pub scope: Scope,
    pub dependencies: Vec<UseId>,
}

pub(crate) struct Core {
    pub config: Config,
    vars: Vec<VarRecord>,
    pub flows: FlowTable,
    pub uses: UseArena,
    pub publications: PublicationTable,
    /// `(output key, tag)` of every reduction started during the run.
    collectives: HashSet<(Key, Key)>,
    groups: HashMap<u32, Group>,
    next_task: u32,
    next_group: u32,
}

impl Core {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            vars: Vec::new(),
            flows: FlowTable::new(),
            uses: UseArena::new(),
            publications: PublicationTable::new(),
            collectives: HashSet::new(),
            groups: HashMap::new(),
            next_task: 0,
            next_group: 0,
        }
    }

    pub fn next_task(&mut self) -> TaskId {
        let id = TaskId(self.next_task);
        self.next_task += 1;
        id
    }

    fn new_var(&mut self, key: Key, shape: Shape, type_name: &'static str) -> VarId {
        let var = VarId(self.vars.len() as u32);
        self.vars.push(VarRecord {
            key,
            shape,
            type_name,
        });
        var
    }

    fn var(&self, var: VarId) -> Option<&VarRecord> {
        self.vars.get(var.0 as usize)
    }

    /// The key of a variable. A handle this runtime never created is named
    /// by its id, and fails every lookup in a scope.
    pub fn key(&self, var: VarId) -> Key {
        match self.var(var) {
            Some(record) => record.key.clone(),
            None => Key::new(var.to_string()),
        }
    }

    fn len_of(&self, var: VarId) -> usize {
        match self.var(var).map(|record| record.shape) {
            Some(Shape::Collection(len)) => len,
            Some(Shape::Single) | None => 0,
        }
    }

    fn derive<B: Backend>(
        &mut self,
        backend: &mut B,
        make: impl FnOnce(&mut FlowTable) -> Result<FlowId>,
    ) -> Result<FlowId> {
        let id = make(&mut self.flows)?;
        announce(backend, self.flows.get(id));
        Ok(id)
    }

    fn insert_use<B: Backend>(&mut self, backend: &mut B, record: UseRecord) -> Result<UseId> {
        self.flows.bind(record.in_flow)?;
        self.flows.bind(record.out_flow)?;
        let id = self.uses.insert(record);
        backend.register_use(id, self.uses.get(id)?);
        Ok(id)
    }

    /// Removes the use from the front end without releasing it.
    fn take_use(&mut self, id: UseId) -> Result<(UseId, UseRecord)> {
        let record = self.uses.remove(id)?;
        self.flows.unbind(record.in_flow);
        self.flows.unbind(record.out_flow);
        Ok((id, record))
    }

    pub fn release_use<B: Backend>(&mut self, backend: &mut B, id: UseId) -> Result<()> {
        let (id, record) = self.take_use(id)?;
        if record.establishes_alias() {
            backend.establish_flow_alias(self.flows.get(record.in_flow), self.flows.get(record.out_flow));
        }
        tracing::trace!("released {} of {}", id, record.key);
        backend.release_use(id, record);
        Ok(())
    }

    /// Releases every use of the scope, in variable order.
    pub fn release_scope<B: Backend>(&mut self, backend: &mut B, scope: &mut Scope) -> Result<()> {
        for id in std::mem::take(&mut scope.uses).into_values() {
            self.release_use(backend, id)?;
        }
        Ok(())
    }

    /// Creates a variable whose data starts out unset, held by `scope` with
    /// scheduling-only modify access.
    pub fn create<B: Backend>(
        &mut self,
        backend: &mut B,
        scope: &mut Scope,
        key: Key,
        shape: Shape,
        type_name: &'static str,
    ) -> Result<VarId> {
        let var = self.new_var(key.clone(), shape, type_name);
        let initial_key = key.clone();
        let in_flow = self.derive(backend, |flows| Ok(flows.initial(initial_key, shape)))?;
        let null_key = key.clone();
        let out_flow = self.derive(backend, |flows| Ok(flows.null(null_key, shape)))?;

        let kind = match shape {
            Shape::Single => UseKind::Handle,
            Shape::Collection(len) => UseKind::Collection(CollectionUse {
                len,
                mapping: Arc::new(Identity),
            }),
        };
        let record = UseRecord::new(
            key,
            var,
            (in_flow, out_flow),
            PermissionPair::new(Permissions::Modify, Permissions::None),
            kind,
            type_name,
        );
        let id = self.insert_use(backend, record)?;
        scope.uses.insert(var, id);
        Ok(var)
    }

    fn denied(key: Key, requested: String, held: PermissionPair) -> FlowError {
        FlowError::PermissionDenied {
            key,
            operation: "capture",
            requested,
            scheduling: held.scheduling,
            immediate: held.immediate,
        }
    }

    /// Resolves one capture request against the scope it is made from.
    pub fn describe(&self, scope: &Scope, request: &CaptureRequest) -> Result<CaptureDescription> {
        let var = request.target.var();
        let key = self.key(var);
        let source = *scope
            .uses
            .get(&var)
            .ok_or_else(|| FlowError::NotInScope { key: key.clone() })?;
        let held = self.uses.get(source)?.permissions;
        if held.scheduling.is_none() {
            return Err(FlowError::LeafCapture { key });
        }

        let requested = match request.request {
            Request::Op { op, downgrade } => requested_permissions(held.scheduling, op, downgrade)
                .map_err(|err| Self::denied(key, err.to_string(), held))?,
            Request::Exact(pair) => pair,
        };

        Ok(CaptureDescription {
            target: request.target.clone(),
            source,
            requested,
        })
    }

    /// Describes every capture of a task, merging repeated captures of one
    /// variable when aliasing is allowed.
    pub fn describe_all(&self, scope: &Scope, captures: &Captures) -> Result<Vec<CaptureDescription>> {
        let aliasing = captures.allow_aliasing || self.config.allow_aliasing;
        let mut descriptions: Vec<CaptureDescription> = Vec::new();

        for request in &captures.requests {
            let desc = self.describe(scope, request)?;
            match descriptions.iter_mut().find(|d| d.var() == desc.var()) {
                Some(existing) if aliasing => {
                    existing.requested = existing.requested.union(desc.requested);
                }
                Some(_) => {
                    return Err(FlowError::UnallowedAliasing {
                        key: self.key(desc.var()),
                    });
                }
                None => descriptions.push(desc),
            }
        }

        Ok(descriptions)
    }

    fn kind_for(&self, target: &CaptureTarget) -> UseKind {
        match target {
            CaptureTarget::Handle(_) => UseKind::Handle,
            CaptureTarget::Collection { var, mapping } => UseKind::Collection(CollectionUse {
                len: self.len_of(*var),
                mapping: mapping.clone().unwrap_or_else(|| Arc::new(Identity)),
            }),
        }
    }

    /// Derives the flows of a capture, registers the captured use and, when
    /// the source cannot keep its current use, replaces it in `scope` with a
    /// continuation.
    ///
    /// Returns `None` for a capture that asks for nothing.
    pub fn materialize<B: Backend>(
        &mut self,
        backend: &mut B,
        scope: &mut Scope,
        desc: &CaptureDescription,
        kind: UseKind,
    ) -> Result<Option<UseId>> {
        let requested = desc.requested;
        if requested.is_none() {
            return Ok(None);
        }

        let var = desc.var();
        if scope.uses.get(&var) != Some(&desc.source) {
            return Err(FlowError::UseAfterRelease(desc.source));
        }

        let source = self.uses.get(desc.source)?;
        let key = source.key.clone();
        let (source_in, source_out) = (source.in_flow, source.out_flow);
        let held = source.permissions;
        let source_kind = source.kind.clone();
        let type_name = source.type_name;

        if held.scheduling.is_none() {
            return Err(FlowError::LeafCapture { key });
        }
        if !requested.scheduling.is_within(held.scheduling)
            || !requested.immediate.is_within(held.scheduling)
        {
            return Err(Self::denied(key, requested.to_string(), held));
        }

        let plan = plan(held, requested);
        let captured_in = match plan.input {
            InputFlow::Same => self.derive(backend, |flows| flows.same(source_in))?,
            InputFlow::Forwarding => self.derive(backend, |flows| flows.forwarding(source_in))?,
        };
        let captured_out = if plan.advance {
            self.derive(backend, |flows| flows.next(captured_in))?
        } else {
            captured_in
        };
        let captured = self.insert_use(
            backend,
            UseRecord::new(
                key.clone(),
                var,
                (captured_in, captured_out),
                requested,
                kind,
                type_name,
            ),
        )?;
        tracing::trace!("captured {} of {} as {}", captured, key, requested);

        if let Some(continuation) = plan.continuation {
            let from = match continuation.from {
                ContinueFrom::CapturedIn => captured_in,
                ContinueFrom::CapturedOut => captured_out,
            };
            let mut record = UseRecord::new(
                key,
                var,
                (from, source_out),
                continuation.permissions,
                source_kind,
                type_name,
            );
            if continuation.permissions.immediate.reads() {
                record.fill(self.uses.get_mut(desc.source)?.shared());
            }
            self.continue_with(backend, scope, desc.source, record)?;
        }

        Ok(Some(captured))
    }

    /// Installs `record` as the scope's use of its variable. The use it
    /// replaces is superseded and released.
    ///
    /// The continuation must start from a state derived from the replaced
    /// use's input and end at the same output.
    pub fn continue_with<B: Backend>(
        &mut self,
        backend: &mut B,
        scope: &mut Scope,
        source: UseId,
        record: UseRecord,
    ) -> Result<UseId> {
        if self.config.verify_lineage {
            let replaced = self.uses.get(source)?;
            self.flows.check_lineage(replaced.in_flow, record.in_flow)?;
            if !self.flows.is_same(replaced.out_flow, record.out_flow) {
                return Err(FlowError::LineageBroken {
                    key: record.key.clone(),
                    expected: replaced.out_flow,
                    found: record.out_flow,
                });
            }
        }
        let var = record.var;
        let id = self.insert_use(backend, record)?;
        self.uses.get_mut(source)?.superseded = true;
        self.release_use(backend, source)?;
        scope.uses.insert(var, id);
        Ok(id)
    }

    /// Materializes the captures of a task into a fresh scope owned by it.
    pub fn capture_into<B: Backend>(
        &mut self,
        backend: &mut B,
        parent: &mut Scope,
        descriptions: &[CaptureDescription],
        task: TaskId,
    ) -> Result<(Scope, Vec<UseId>)> {
        let mut scope = Scope::task(task);
        let mut dependencies = Vec::new();

        for desc in descriptions {
            let kind = self.kind_for(&desc.target);
            let Some(id) = self.materialize(backend, parent, desc, kind)? else {
                continue;
            };
            let record = self.uses.get_mut(id)?;
            record.state = UseState::Dependency(task);
            let (in_flow, out_flow) = (record.in_flow, record.out_flow);
            self.flows.mark(in_flow, FlowState::InUse);
            self.flows.mark(out_flow, FlowState::InUse);
            scope.uses.insert(desc.var(), id);
            dependencies.push(id);
        }

        Ok((scope, dependencies))
    }

    /// Captures everything a concurrent group asks for at group level, then
    /// hands each of the `len` members its own view: one element of each
    /// collection, read access to each plain handle.
    pub fn concurrent<B: Backend>(
        &mut self,
        backend: &mut B,
        parent: &mut Scope,
        descriptions: &[CaptureDescription],
        len: usize,
    ) -> Result<(u32, Vec<Member>)> {
        for desc in descriptions {
            self.check_group_capture(desc, len)?;
        }

        let group = self.next_group;
        self.next_group += 1;

        let mut group_uses = Vec::new();
        for desc in descriptions {
            let kind = self.kind_for(&desc.target);
            if let Some(id) = self.materialize(backend, parent, desc, kind)? {
                group_uses.push(id);
            }
        }

        let mut members = Vec::with_capacity(len);
        for index in 0..len {
            let task = self.next_task();
            let mut scope = Scope {
                index: Some(index),
                ..Scope::task(task)
            };
            let mut dependencies = Vec::new();

            for &group_use in &group_uses {
                let id = self.member_use(backend, &mut scope, group_use, index)?;
                self.uses.get_mut(id)?.state = UseState::Dependency(task);
                dependencies.push(id);
            }

            members.push(Member {
                task,
                index,
                scope,
                dependencies,
            });
        }

        if len == 0 {
            for id in group_uses {
                self.release_use(backend, id)?;
            }
        } else {
            self.groups.insert(
                group,
                Group {
                    remaining: len,
                    uses: group_uses,
                },
            );
        }

        Ok((group, members))
    }

    fn check_group_capture(&self, desc: &CaptureDescription, len: usize) -> Result<()> {
        let key = self.key(desc.var());
        match &desc.target {
            CaptureTarget::Handle(_) => {
                if desc.requested.writes() {
                    return Err(FlowError::ConcurrentWrite { key });
                }
            }
            CaptureTarget::Collection { var, mapping } => {
                let elements = self.len_of(*var);
                let mut seen = HashSet::new();
                for outer in 0..len {
                    let inner = match mapping {
                        Some(m) => m.map_forward(outer),
                        None => Some(outer),
                    };
                    let inner = match inner {
                        Some(inner) if inner < elements => inner,
                        Some(inner) => {
                            return Err(FlowError::IndexOutOfRange {
                                key,
                                index: inner,
                                len: elements,
                            });
                        }
                        // the mapping has no image for this task
                        None => {
                            return Err(FlowError::IndexOutOfRange {
                                key,
                                index: outer,
                                len: elements,
                            });
                        }
                    };
                    if desc.requested.writes() && !seen.insert(inner) {
                        return Err(FlowError::ConflictingCollectionWrite { key, index: inner });
                    }
                }
            }
        }
        Ok(())
    }

    /// Derives the use member `index` of a group holds for one group-level use.
    fn member_use<B: Backend>(
        &mut self,
        backend: &mut B,
        scope: &mut Scope,
        group_use: UseId,
        index: usize,
    ) -> Result<UseId> {
        let record = self.uses.get(group_use)?;
        let key = record.key.clone();
        let var = record.var;
        let (group_in, group_out) = (record.in_flow, record.out_flow);
        let permissions = record.permissions;
        let kind = record.kind.clone();
        let type_name = record.type_name;

        match kind {
            UseKind::Collection(collection) => {
                let inner = collection.mapping.map_forward(index).ok_or_else(|| {
                    FlowError::IndexOutOfRange {
                        key: key.clone(),
                        index,
                        len: self.len_of(var),
                    }
                })?;
                let local_in = self.derive(backend, |flows| flows.indexed(group_in, inner))?;
                let local_out = if permissions.writes() {
                    self.derive(backend, |flows| flows.indexed(group_out, inner))?
                } else {
                    local_in
                };
                let local = self.new_var(key.clone().with(inner), Shape::Single, type_name);
                let id = self.insert_use(
                    backend,
                    UseRecord::new(
                        key,
                        local,
                        (local_in, local_out),
                        permissions,
                        UseKind::Local(LocalUse {
                            collection: var,
                            index: inner,
                        }),
                        type_name,
                    ),
                )?;
                scope.uses.insert(local, id);
                scope.locals.insert(var, local);
                Ok(id)
            }
            _ => {
                let local_in = self.derive(backend, |flows| flows.same(group_in))?;
                let id = self.insert_use(
                    backend,
                    UseRecord::new(
                        key,
                        var,
                        (local_in, local_in),
                        permissions,
                        UseKind::Handle,
                        type_name,
                    ),
                )?;
                scope.uses.insert(var, id);
                Ok(id)
            }
        }
    }

    /// Counts one finished member of `group`; the last one releases the
    /// group-level uses.
    pub fn finish_member<B: Backend>(&mut self, backend: &mut B, group: u32) -> Result<()> {
        let Some(entry) = self.groups.get_mut(&group) else {
            return Ok(());
        };
        entry.remaining = entry.remaining.saturating_sub(1);
        if entry.remaining == 0
            && let Some(done) = self.groups.remove(&group)
        {
            for id in done.uses {
                self.release_use(backend, id)?;
            }
        }
        Ok(())
    }

    pub fn reduce<B: Backend>(
        &mut self,
        backend: &mut B,
        scope: &mut Scope,
        collection: CaptureTarget,
        output: VarId,
        details: ReduceDetails,
    ) -> Result<()> {
        let key = self.key(output);
        if !self.collectives.insert((key.clone(), details.tag.clone())) {
            return Err(FlowError::DuplicateCollectiveTag {
                key,
                tag: details.tag,
            });
        }

        let collection = self.describe(
            scope,
            &CaptureRequest {
                target: collection,
                request: Request::Exact(PermissionPair::new(Permissions::None, Permissions::Read)),
            },
        )?;
        let output = self.describe(
            scope,
            &CaptureRequest {
                target: CaptureTarget::Handle(output),
                request: Request::Exact(PermissionPair::new(
                    Permissions::None,
                    Permissions::Modify,
                )),
            },
        )?;

        let kind = self.kind_for(&collection.target);
        let collection = self
            .materialize(backend, scope, &collection, kind)?
            .map(|id| self.take_use(id))
            .transpose()?;
        let output = self
            .materialize(backend, scope, &output, UseKind::Handle)?
            .map(|id| self.take_use(id))
            .transpose()?;

        if let (Some(collection), Some(output)) = (collection, output) {
            tracing::debug!("reducing {} into {} ({:?})", collection.1.key, key, details.op);
            backend.reduce_collection_use(collection, output, &details);
        }
        Ok(())
    }

    /// Offers the current value of `var` to `options.readers` fetches.
    pub fn publish<B: Backend>(
        &mut self,
        backend: &mut B,
        scope: &mut Scope,
        var: VarId,
        options: PublishOptions,
    ) -> Result<()> {
        let key = self.key(var);
        if options.readers == 0 {
            return Err(FlowError::InvalidReaderCount { key });
        }

        let desc = self.describe(
            scope,
            &CaptureRequest {
                target: CaptureTarget::Handle(var),
                request: Request::Exact(PermissionPair::new(Permissions::None, Permissions::Read)),
            },
        )?;
        let kind = UseKind::Publication(PublicationUse {
            version: options.version.clone(),
            readers: options.readers,
        });
        let Some(id) = self.materialize(backend, scope, &desc, kind)? else {
            return Ok(());
        };

        let release_now = self
            .publications
            .publish(&key, &options.version, id, options.readers)?;

        let record = self.uses.get_mut(id)?;
        record.state = UseState::Published;
        let in_flow = record.in_flow;
        self.flows.mark(in_flow, FlowState::Published);

        tracing::debug!("published {} version {} for {} reader(s)", key, options.version, options.readers);
        let details = PublicationDetails {
            version: options.version,
            readers: options.readers,
        };
        backend.publish_use(id, self.uses.get(id)?, &details);

        if let Some(done) = release_now {
            self.release_use(backend, done)?;
        }
        Ok(())
    }

    /// Binds a new read-only variable to a published version of `key`.
    pub fn fetch<B: Backend>(
        &mut self,
        backend: &mut B,
        scope: &mut Scope,
        key: Key,
        version: Key,
        type_name: &'static str,
    ) -> Result<VarId> {
        let outcome = self.publications.fetch(&key, &version)?;
        let var = self.new_var(key.clone(), Shape::Single, type_name);

        let fetched_key = key.clone();
        let flow = self.derive(backend, move |flows| Ok(flows.fetching(fetched_key, version)))?;
        let id = self.insert_use(
            backend,
            UseRecord::new(
                key,
                var,
                (flow, flow),
                PermissionPair::new(Permissions::Read, Permissions::None),
                UseKind::Handle,
                type_name,
            ),
        )?;
        scope.uses.insert(var, id);

        if let FetchOutcome::Last(publication) = outcome {
            self.release_use(backend, publication)?;
        }
        Ok(var)
    }

    /// Errors for publications left dangling when the run is over.
    pub fn check_publications(&self) -> Result<()> {
        if let Some((key, version)) = self.publications.first_unresolved() {
            return Err(FlowError::UnknownPublication {
                key: key.clone(),
                version: version.clone(),
            });
        }
        if let Some((key, version, readers, fetches)) = self.publications.first_underfetched() {
            return Err(FlowError::ReadersMissing {
                key: key.clone(),
                version: version.clone(),
                readers,
                fetches,
            });
        }
        Ok(())
    }
}
