//! Running a program: the top-level body, the task loop and the [`Context`]
//! handed to every task body.
use std::any::type_name;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::Level;

use crate::backend::{Backend, Serial};
use crate::builder::{ConcurrentDef, IfDef, TaskDef, WhileDef};
use crate::capture::{CaptureDescription, CaptureRequest, Captures};
use crate::collective::{ReduceDetails, ReduceOptions, Reducible};
use crate::config::Config;
use crate::core::{Core, Scope};
use crate::error::{FlowError, Result};
use crate::flow::Shape;
use crate::handle::{AccessHandle, AccessHandleCollection, Capturable, VarId};
use crate::key::Key;
use crate::mapping::IndexRange;
use crate::permissions::PermissionPair;
use crate::publish::PublishOptions;
use crate::task::{Diagnostics, TaskDescriptor, TaskExecution, TaskId, TaskKind};

pub(crate) type Work<B> = Box<dyn FnOnce(&mut Context<'_, B>) -> anyhow::Result<()>>;
pub(crate) type Test<B> = Arc<dyn Fn(&mut Context<'_, B>) -> anyhow::Result<bool>>;
pub(crate) type Step<B> = Arc<dyn Fn(&mut Context<'_, B>) -> anyhow::Result<()>>;
pub(crate) type MemberBody<B> = Arc<dyn Fn(&mut Context<'_, B>, usize) -> anyhow::Result<()>>;

pub(crate) struct Branch<B: Backend> {
    pub captures: Captures,
    pub body: Work<B>,
}

pub(crate) enum Body<B: Backend> {
    Work(Work<B>),
    If {
        test: Test<B>,
        then: Branch<B>,
        otherwise: Option<Branch<B>>,
    },
    While {
        test: Test<B>,
        step_captures: Captures,
        step: Step<B>,
        /// What every iteration's test captures, reconciled once.
        merged: Vec<CaptureRequest>,
    },
    Member {
        body: MemberBody<B>,
        index: usize,
    },
}

struct Pending<B: Backend> {
    name: Cow<'static, str>,
    kind: TaskKind,
    scope: Scope,
    body: Body<B>,
}

/// Builds the dependency graph of a program and, with a backend that
/// executes tasks, runs it.
///
/// ```rust
/// use nagare::{Runtime, key};
///
/// let mut runtime = Runtime::new();
/// runtime
///     .run(|ctx| {
///         let h = ctx.initial_access::<i32>(key!("h"))?;
///         ctx.task().name("init").modify(&h).run(move |ctx| {
///             ctx.set(&h, 42)?;
///             Ok(())
///         })?;
///         ctx.task().name("check").reads(&h).run(move |ctx| {
///             assert_eq!(*ctx.get(&h)?, 42);
///             Ok(())
///         })?;
///         Ok(())
///     })
///     .unwrap();
/// ```
pub struct Runtime<B: Backend = Serial> {
    pub(crate) core: Core,
    pub(crate) backend: B,
    pending: HashMap<TaskId, Pending<B>>,
    diagnostics: Diagnostics,
}

impl Runtime<Serial> {
    pub fn new() -> Self {
        Self::with_backend(Serial::new(), Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self::with_backend(Serial::new(), config)
    }
}

impl Default for Runtime<Serial> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend + 'static> Runtime<B> {
    pub fn with_backend(backend: B, config: Config) -> Self {
        Self {
            core: Core::new(config),
            backend,
            pending: HashMap::new(),
            diagnostics: Diagnostics::default(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    pub fn config(&self) -> &Config {
        &self.core.config
    }

    /// Runs `main` as the top-level body, then every task it transitively
    /// creates.
    pub fn run<F>(&mut self, main: F) -> Result<Diagnostics>
    where
        F: FnOnce(&mut Context<'_, B>) -> anyhow::Result<()>,
    {
        let span = tracing::span!(Level::INFO, "run");
        let _enter = span.enter();

        let mut ctx = Context {
            rt: self,
            scope: Scope::root(),
        };
        let outcome = main(&mut ctx);
        let mut scope = ctx.scope;
        outcome.map_err(|err| task_error("main", err))?;
        self.core.release_scope(&mut self.backend, &mut scope)?;

        self.drain()?;
        self.finish()
    }

    fn drain(&mut self) -> Result<()> {
        if !self.backend.executes_tasks() {
            return Ok(());
        }

        while let Some(task) = self.backend.next_ready_task()? {
            if let Some(limit) = self.core.config.max_tasks
                && self.diagnostics.executed() >= limit
            {
                return Err(FlowError::TaskLimitExceeded(limit));
            }
            self.execute(task)?;
        }

        Ok(())
    }

    fn finish(&mut self) -> Result<Diagnostics> {
        self.core.check_publications()?;

        if self.backend.executes_tasks() && !self.pending.is_empty() {
            return Err(FlowError::Stalled(self.pending.len()));
        }

        let diagnostics = std::mem::take(&mut self.diagnostics);
        tracing::info!(
            "run complete, {} of {} task(s) executed",
            diagnostics.executed(),
            diagnostics.registered
        );
        Ok(diagnostics)
    }

    fn register(&mut self, descriptor: TaskDescriptor, scope: Scope, body: Body<B>) {
        tracing::debug!(
            "registered {} {} with {} dependencies",
            descriptor.id,
            descriptor.name,
            descriptor.dependencies.len()
        );
        self.backend.register_task(&descriptor);
        self.diagnostics.registered += 1;
        self.pending.insert(
            descriptor.id,
            Pending {
                name: descriptor.name,
                kind: descriptor.kind,
                scope,
                body,
            },
        );
    }

    fn execute(&mut self, task: TaskId) -> Result<()> {
        let Some(Pending {
            name,
            kind,
            scope,
            body,
        }) = self.pending.remove(&task)
        else {
            return Ok(());
        };

        let span = tracing::span!(Level::INFO, "task", name = %name);
        let _enter = span.enter();

        for &id in scope.uses.values() {
            self.backend.acquire_data(id, self.core.uses.get_mut(id)?)?;
        }

        let start = Instant::now();
        let mut ctx = Context { rt: self, scope };
        let outcome = ctx.run_body(&name, body);
        let mut scope = ctx.scope;
        let duration = start.elapsed();

        self.diagnostics.executions.push(TaskExecution {
            task,
            name: name.clone(),
            start,
            duration,
        });
        outcome.map_err(|err| task_error(&name, err))?;

        self.core.release_scope(&mut self.backend, &mut scope)?;
        if let TaskKind::Member { group, .. } = kind {
            self.core.finish_member(&mut self.backend, group)?;
        }

        tracing::debug!("finished {} in {:.2?}", name, duration);
        Ok(())
    }
}

/// Errors raised by the runtime pass through task bodies unchanged.
fn task_error(name: &str, err: anyhow::Error) -> FlowError {
    let err = match err.downcast::<FlowError>() {
        Ok(err) => err,
        Err(err) => FlowError::Task(name.to_string(), err),
    };
    tracing::error!("{} failed: {}", name, err);
    err
}

/// The view a body has of the program: the uses of its own scope, and the
/// means to create data and tasks.
pub struct Context<'rt, B: Backend = Serial> {
    pub(crate) rt: &'rt mut Runtime<B>,
    pub(crate) scope: Scope,
}

impl<'rt, B: Backend + 'static> Context<'rt, B> {
    fn run_body(&mut self, name: &Cow<'static, str>, body: Body<B>) -> anyhow::Result<()> {
        match body {
            Body::Work(work) => work(self),
            Body::If {
                test,
                then,
                otherwise,
            } => {
                let branch = if test(self)? { Some(then) } else { otherwise };
                if let Some(Branch { captures, body }) = branch {
                    self.submit(branch_name(name, "branch"), TaskKind::Work, &captures, Body::Work(body))?;
                }
                Ok(())
            }
            Body::While {
                test,
                step_captures,
                step,
                merged,
            } => {
                if !test(self)? {
                    return Ok(());
                }
                let iteration = step.clone();
                self.submit(
                    branch_name(name, "step"),
                    TaskKind::Work,
                    &step_captures,
                    Body::Work(Box::new(move |ctx: &mut Context<'_, B>| iteration(ctx))),
                )?;

                let next = Captures {
                    requests: merged.clone(),
                    allow_aliasing: false,
                };
                self.submit(
                    name.clone(),
                    TaskKind::Loop,
                    &next,
                    Body::While {
                        test,
                        step_captures,
                        step,
                        merged,
                    },
                )?;
                Ok(())
            }
            Body::Member { body, index } => body(self, index),
        }
    }

    /// Describes `captures` against this scope and registers the task.
    pub(crate) fn submit(
        &mut self,
        name: Cow<'static, str>,
        kind: TaskKind,
        captures: &Captures,
        body: Body<B>,
    ) -> Result<TaskId> {
        let descriptions = self.rt.core.describe_all(&self.scope, captures)?;
        self.spawn(name, kind, descriptions, body)
    }

    pub(crate) fn spawn(
        &mut self,
        name: Cow<'static, str>,
        kind: TaskKind,
        descriptions: Vec<CaptureDescription>,
        body: Body<B>,
    ) -> Result<TaskId> {
        let Runtime { core, backend, .. } = &mut *self.rt;
        let task = core.next_task();
        let (scope, dependencies) = core.capture_into(backend, &mut self.scope, &descriptions, task)?;

        let descriptor = TaskDescriptor {
            id: task,
            name,
            parent: self.scope.task,
            kind,
            dependencies,
        };
        self.rt.register(descriptor, scope, body);
        Ok(task)
    }

    pub(crate) fn spawn_group(
        &mut self,
        name: Cow<'static, str>,
        captures: &Captures,
        len: usize,
        body: MemberBody<B>,
    ) -> Result<Vec<TaskId>> {
        let Runtime { core, backend, .. } = &mut *self.rt;
        let descriptions = core.describe_all(&self.scope, captures)?;
        let (group, members) = core.concurrent(backend, &mut self.scope, &descriptions, len)?;

        let mut tasks = Vec::with_capacity(members.len());
        for member in members {
            let descriptor = TaskDescriptor {
                id: member.task,
                name: Cow::Owned(format!("{}[{}]", name, member.index)),
                parent: self.scope.task,
                kind: TaskKind::Member {
                    group,
                    index: member.index,
                },
                dependencies: member.dependencies,
            };
            tasks.push(member.task);
            self.rt.register(
                descriptor,
                member.scope,
                Body::Member {
                    body: body.clone(),
                    index: member.index,
                },
            );
        }
        Ok(tasks)
    }

    pub(crate) fn describe_all(&self, captures: &Captures) -> Result<Vec<CaptureDescription>> {
        self.rt.core.describe_all(&self.scope, captures)
    }

    fn use_of(&self, var: VarId) -> Result<crate::usage::UseId> {
        self.scope
            .uses
            .get(&var)
            .copied()
            .ok_or_else(|| FlowError::NotInScope {
                key: self.rt.core.key(var),
            })
    }

    /// Creates a fresh variable under `key`. The creating scope may schedule
    /// any access to it, but touches its data only through tasks.
    pub fn initial_access<T: Send + Sync + 'static>(
        &mut self,
        key: impl Into<Key>,
    ) -> Result<AccessHandle<T>> {
        let Runtime { core, backend, .. } = &mut *self.rt;
        let var = core.create(backend, &mut self.scope, key.into(), Shape::Single, type_name::<T>())?;
        Ok(AccessHandle::new(var))
    }

    /// Creates a collection of `range.len()` elements under `key`.
    pub fn initial_collection<T: Send + Sync + 'static>(
        &mut self,
        key: impl Into<Key>,
        range: impl IndexRange,
    ) -> Result<AccessHandleCollection<T>> {
        let len = range.len();
        let Runtime { core, backend, .. } = &mut *self.rt;
        let var = core.create(
            backend,
            &mut self.scope,
            key.into(),
            Shape::Collection(len),
            type_name::<T>(),
        )?;
        Ok(AccessHandleCollection::new(var, len))
    }

    /// Makes the current value of `handle` available to `options.readers`
    /// fetches of `(key, options.version)`.
    pub fn publish<T>(&mut self, handle: &AccessHandle<T>, options: PublishOptions) -> Result<()> {
        let Runtime { core, backend, .. } = &mut *self.rt;
        core.publish(backend, &mut self.scope, handle.var, options)
    }

    /// A read-only handle to the value published under `(key, version)`.
    pub fn fetch<T: Send + Sync + 'static>(
        &mut self,
        key: impl Into<Key>,
        version: impl Into<Key>,
    ) -> Result<AccessHandle<T>> {
        let Runtime { core, backend, .. } = &mut *self.rt;
        let var = core.fetch(backend, &mut self.scope, key.into(), version.into(), type_name::<T>())?;
        Ok(AccessHandle::new(var))
    }

    /// Gives up this scope's use of `handle` before the body returns.
    pub fn release(&mut self, target: &impl Capturable) -> Result<()> {
        let var = target.target().var();
        let id = self.use_of(var)?;
        self.scope.uses.remove(&var);
        let Runtime { core, backend, .. } = &mut *self.rt;
        core.release_use(backend, id)
    }

    /// What this scope may currently do with `target`, if it holds it at all.
    pub fn permissions(&self, target: &impl Capturable) -> Option<PermissionPair> {
        let id = self.scope.uses.get(&target.target().var())?;
        self.rt.core.uses.get(*id).ok().map(|record| record.permissions)
    }

    fn denied(&self, var: VarId, operation: &'static str) -> FlowError {
        let held = self.permissions(&AccessHandle::<()>::new(var)).unwrap_or_default();
        FlowError::PermissionDenied {
            key: self.rt.core.key(var),
            operation,
            requested: operation.to_string(),
            scheduling: held.scheduling,
            immediate: held.immediate,
        }
    }

    pub fn get<T: 'static>(&self, handle: &AccessHandle<T>) -> Result<&T> {
        let record = self.rt.core.uses.get(self.use_of(handle.var)?)?;
        if !record.permissions.immediate.reads() {
            return Err(self.denied(handle.var, "read"));
        }
        record.get::<T>()
    }

    /// Mutable access to the value; the first call copies it out of the
    /// version the task read.
    pub fn get_mut<T: Clone + Send + Sync + 'static>(
        &mut self,
        handle: &AccessHandle<T>,
    ) -> Result<&mut T> {
        let id = self.use_of(handle.var)?;
        let immediate = self.rt.core.uses.get(id)?.permissions.immediate;
        if !(immediate.reads() && immediate.writes()) {
            return Err(self.denied(handle.var, "modify"));
        }
        self.rt.core.uses.get_mut(id)?.get_mut::<T>()
    }

    pub fn set<T: Send + Sync + 'static>(&mut self, handle: &AccessHandle<T>, value: T) -> Result<()> {
        let id = self.use_of(handle.var)?;
        if !self.rt.core.uses.get(id)?.permissions.immediate.writes() {
            return Err(self.denied(handle.var, "write"));
        }
        self.rt.core.uses.get_mut(id)?.set(value);
        Ok(())
    }

    /// Inside a member of a concurrent group, the element of `collection`
    /// this member was given.
    pub fn local<T>(&self, collection: &AccessHandleCollection<T>) -> Result<AccessHandle<T>> {
        self.scope
            .locals
            .get(&collection.var)
            .map(|local| AccessHandle::new(*local))
            .ok_or_else(|| FlowError::NotInScope {
                key: self.rt.core.key(collection.var),
            })
    }

    /// The member index, inside a concurrent group.
    pub fn index(&self) -> Option<usize> {
        self.scope.index
    }

    pub fn current_task(&self) -> Option<TaskId> {
        self.scope.task
    }

    pub fn task(&mut self) -> TaskDef<'_, 'rt, B> {
        TaskDef::new(self)
    }

    pub fn create_work_if(&mut self) -> IfDef<'_, 'rt, B> {
        IfDef::new(self)
    }

    pub fn create_work_while(&mut self) -> WhileDef<'_, 'rt, B> {
        WhileDef::new(self)
    }

    /// A group of `range.len()` tasks running the same body.
    pub fn concurrent(&mut self, range: impl IndexRange) -> ConcurrentDef<'_, 'rt, B> {
        ConcurrentDef::new(self, range.len())
    }

    /// Combines every element of `collection` into `output` once both are
    /// available. `(output key, tag)` must be unique within a run.
    pub fn reduce<T: Reducible>(
        &mut self,
        collection: &AccessHandleCollection<T>,
        output: &AccessHandle<T>,
        options: ReduceOptions,
    ) -> Result<()> {
        let details = ReduceDetails::new::<T>(options);
        let Runtime { core, backend, .. } = &mut *self.rt;
        core.reduce(backend, &mut self.scope, collection.target(), output.var, details)
    }
}

fn branch_name(name: &str, suffix: &str) -> Cow<'static, str> {
    Cow::Owned(format!("{name}.{suffix}"))
}
