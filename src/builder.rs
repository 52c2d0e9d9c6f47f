//! Builders for tasks, conditionals, loops and concurrent groups.
//!
//! Every builder borrows the [`Context`] it was created from and registers its
//! task when finished. Captures are listed explicitly; a handle the body uses
//! but the builder never captured is not in the task's scope.
use std::any::type_name;
use std::borrow::Cow;
use std::sync::Arc;

use crate::backend::Backend;
use crate::capture::{CaptureRequest, Captures, Request, reconcile};
use crate::error::Result;
use crate::handle::Capturable;
use crate::permissions::{Downgrade, PermissionPair};
use crate::runtime::{Body, Branch, Context};
use crate::task::{TaskId, TaskKind};

/// Capture methods shared by every builder that gathers `self.captures`.
macro_rules! capture_methods {
    () => {
        /// Captures with full access, as far as the source allows.
        pub fn modify(mut self, target: &impl Capturable) -> Self {
            self.captures = self.captures.modify(target);
            self
        }

        pub fn reads(mut self, target: &impl Capturable) -> Self {
            self.captures = self.captures.reads(target);
            self
        }

        pub fn writes(mut self, target: &impl Capturable) -> Self {
            self.captures = self.captures.writes(target);
            self
        }

        /// The task may create tasks that touch the data, but never touches it
        /// itself.
        pub fn schedule_only(mut self, target: &impl Capturable) -> Self {
            self.captures = self.captures.schedule_only(target);
            self
        }

        /// The task touches the data but cannot pass it on to other tasks.
        pub fn leaf(mut self, target: &impl Capturable) -> Self {
            self.captures = self.captures.leaf(target);
            self
        }

        pub fn capture(mut self, target: &impl Capturable, downgrade: Downgrade) -> Self {
            self.captures = self.captures.capture(target, downgrade);
            self
        }

        pub fn capture_exact(mut self, target: &impl Capturable, permissions: PermissionPair) -> Self {
            self.captures = self.captures.capture_exact(target, permissions);
            self
        }

        pub fn allow_aliasing(mut self) -> Self {
            self.captures = self.captures.allow_aliasing();
            self
        }
    };
}

pub struct TaskDef<'c, 'rt, B: Backend + 'static> {
    ctx: &'c mut Context<'rt, B>,
    name: Option<Cow<'static, str>>,
    captures: Captures,
}

impl<'c, 'rt, B: Backend + 'static> TaskDef<'c, 'rt, B> {
    pub(crate) fn new(ctx: &'c mut Context<'rt, B>) -> Self {
        Self {
            ctx,
            name: None,
            captures: Captures::new(),
        }
    }

    pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    capture_methods!();

    pub fn run<F>(self, body: F) -> Result<TaskId>
    where
        F: FnOnce(&mut Context<'_, B>) -> anyhow::Result<()> + 'static,
    {
        let name = self.name.unwrap_or(type_name::<F>().into());
        self.ctx
            .submit(name, TaskKind::Work, &self.captures, Body::Work(Box::new(body)))
    }
}

/// Collects what the condition of a conditional reads.
pub struct IfDef<'c, 'rt, B: Backend + 'static> {
    ctx: &'c mut Context<'rt, B>,
    name: Option<Cow<'static, str>>,
    captures: Captures,
}

impl<'c, 'rt, B: Backend + 'static> IfDef<'c, 'rt, B> {
    pub(crate) fn new(ctx: &'c mut Context<'rt, B>) -> Self {
        Self {
            ctx,
            name: None,
            captures: Captures::new(),
        }
    }

    pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    capture_methods!();

    pub fn test<F>(self, test: F) -> IfThen<'c, 'rt, B>
    where
        F: Fn(&mut Context<'_, B>) -> anyhow::Result<bool> + 'static,
    {
        IfThen {
            ctx: self.ctx,
            name: self.name.unwrap_or(type_name::<F>().into()),
            condition: self.captures,
            test: Arc::new(test),
        }
    }
}

pub struct IfThen<'c, 'rt, B: Backend + 'static> {
    ctx: &'c mut Context<'rt, B>,
    name: Cow<'static, str>,
    condition: Captures,
    test: crate::runtime::Test<B>,
}

impl<'c, 'rt, B: Backend + 'static> IfThen<'c, 'rt, B> {
    pub fn then_<F>(self, captures: Captures, body: F) -> IfElse<'c, 'rt, B>
    where
        F: FnOnce(&mut Context<'_, B>) -> anyhow::Result<()> + 'static,
    {
        IfElse {
            ctx: self.ctx,
            name: self.name,
            condition: self.condition,
            test: self.test,
            then: Branch {
                captures,
                body: Box::new(body),
            },
            otherwise: None,
        }
    }
}

pub struct IfElse<'c, 'rt, B: Backend + 'static> {
    ctx: &'c mut Context<'rt, B>,
    name: Cow<'static, str>,
    condition: Captures,
    test: crate::runtime::Test<B>,
    then: Branch<B>,
    otherwise: Option<Branch<B>>,
}

impl<'c, 'rt, B: Backend + 'static> IfElse<'c, 'rt, B> {
    pub fn else_<F>(mut self, captures: Captures, body: F) -> Self
    where
        F: FnOnce(&mut Context<'_, B>) -> anyhow::Result<()> + 'static,
    {
        self.otherwise = Some(Branch {
            captures,
            body: Box::new(body),
        });
        self
    }

    /// Registers the conditional. It holds the condition's immediate access
    /// and enough scheduling access for either branch.
    pub fn submit(self) -> Result<TaskId> {
        let condition = self.ctx.describe_all(&self.condition)?;
        let then = self.ctx.describe_all(&self.then.captures)?;
        let otherwise = match &self.otherwise {
            Some(branch) => self.ctx.describe_all(&branch.captures)?,
            None => Vec::new(),
        };
        let merged = reconcile(condition, &[then.as_slice(), otherwise.as_slice()]);

        self.ctx.spawn(
            self.name,
            TaskKind::Conditional,
            merged,
            Body::If {
                test: self.test,
                then: self.then,
                otherwise: self.otherwise,
            },
        )
    }
}

/// Collects what the condition of a loop reads.
pub struct WhileDef<'c, 'rt, B: Backend + 'static> {
    ctx: &'c mut Context<'rt, B>,
    name: Option<Cow<'static, str>>,
    captures: Captures,
}

impl<'c, 'rt, B: Backend + 'static> WhileDef<'c, 'rt, B> {
    pub(crate) fn new(ctx: &'c mut Context<'rt, B>) -> Self {
        Self {
            ctx,
            name: None,
            captures: Captures::new(),
        }
    }

    pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    capture_methods!();

    pub fn test<F>(self, test: F) -> WhileDo<'c, 'rt, B>
    where
        F: Fn(&mut Context<'_, B>) -> anyhow::Result<bool> + 'static,
    {
        WhileDo {
            ctx: self.ctx,
            name: self.name.unwrap_or(type_name::<F>().into()),
            condition: self.captures,
            test: Arc::new(test),
        }
    }
}

pub struct WhileDo<'c, 'rt, B: Backend + 'static> {
    ctx: &'c mut Context<'rt, B>,
    name: Cow<'static, str>,
    condition: Captures,
    test: crate::runtime::Test<B>,
}

impl<'c, 'rt, B: Backend + 'static> WhileDo<'c, 'rt, B> {
    /// The body run by every iteration whose test passed.
    pub fn do_<F>(self, captures: Captures, step: F) -> WhileReady<'c, 'rt, B>
    where
        F: Fn(&mut Context<'_, B>) -> anyhow::Result<()> + 'static,
    {
        WhileReady {
            ctx: self.ctx,
            name: self.name,
            condition: self.condition,
            test: self.test,
            step_captures: captures,
            step: Arc::new(step),
        }
    }
}

pub struct WhileReady<'c, 'rt, B: Backend + 'static> {
    ctx: &'c mut Context<'rt, B>,
    name: Cow<'static, str>,
    condition: Captures,
    test: crate::runtime::Test<B>,
    step_captures: Captures,
    step: crate::runtime::Step<B>,
}

impl<'c, 'rt, B: Backend + 'static> WhileReady<'c, 'rt, B> {
    /// Registers the first test. Every passing test schedules one iteration
    /// followed by the next test, which captures exactly what the first did.
    pub fn submit(self) -> Result<TaskId> {
        let condition = self.ctx.describe_all(&self.condition)?;
        let body = self.ctx.describe_all(&self.step_captures)?;
        let merged = reconcile(condition, &[body.as_slice()]);

        let requests = merged
            .iter()
            .map(|desc| CaptureRequest {
                target: desc.target.clone(),
                request: Request::Exact(desc.requested),
            })
            .collect();

        self.ctx.spawn(
            self.name,
            TaskKind::Loop,
            merged,
            Body::While {
                test: self.test,
                step_captures: self.step_captures,
                step: self.step,
                merged: requests,
            },
        )
    }
}

/// A group of tasks indexed over a range, each seeing one element of every
/// captured collection.
pub struct ConcurrentDef<'c, 'rt, B: Backend + 'static> {
    ctx: &'c mut Context<'rt, B>,
    name: Option<Cow<'static, str>>,
    len: usize,
    captures: Captures,
}

impl<'c, 'rt, B: Backend + 'static> ConcurrentDef<'c, 'rt, B> {
    pub(crate) fn new(ctx: &'c mut Context<'rt, B>, len: usize) -> Self {
        Self {
            ctx,
            name: None,
            len,
            captures: Captures::new(),
        }
    }

    pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    capture_methods!();

    pub fn run<F>(self, body: F) -> Result<Vec<TaskId>>
    where
        F: Fn(&mut Context<'_, B>, usize) -> anyhow::Result<()> + 'static,
    {
        let name = self.name.unwrap_or(type_name::<F>().into());
        self.ctx
            .spawn_group(name, &self.captures, self.len, Arc::new(body))
    }
}

#[cfg(test)]
mod tests {
    use crate::backend::Recorder;
    use crate::capture::Captures;
    use crate::config::Config;
    use crate::error::FlowError;
    use crate::key;
    use crate::permissions::{PermissionPair, Permissions as P};
    use crate::runtime::Runtime;
    use crate::task::TaskKind;

    #[test]
    fn test_conditional_registers_reconciled_captures() {
        let mut runtime = Runtime::with_backend(Recorder::new(), Config::default());
        runtime
            .run(|ctx| {
                let h = ctx.initial_access::<i32>(key!("h"))?;
                ctx.create_work_if()
                    .name("if")
                    .test(|_| Ok(true))
                    .then_(Captures::new().writes(&h), |_| Ok(()))
                    .else_(Captures::new().reads(&h), |_| Ok(()))
                    .submit()?;
                Ok(())
            })
            .unwrap();

        let recorder = runtime.into_backend();
        let task = recorder.task_named("if").unwrap();
        assert_eq!(task.kind, TaskKind::Conditional);
        let deps = recorder.dependencies_of(task.id);
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].permissions, PermissionPair::new(P::Modify, P::None));
    }

    #[test]
    fn test_conditional_picks_branch() {
        let mut runtime = Runtime::new();
        let diagnostics = runtime
            .run(|ctx| {
                let flag = ctx.initial_access::<bool>(key!("flag"))?;
                let out = ctx.initial_access::<&'static str>(key!("out"))?;
                ctx.task().name("init").writes(&flag).run(move |ctx| {
                    ctx.set(&flag, false)?;
                    Ok(())
                })?;
                ctx.create_work_if()
                    .name("choose")
                    .reads(&flag)
                    .test(move |ctx| Ok(*ctx.get(&flag)?))
                    .then_(Captures::new().writes(&out), move |ctx| {
                        ctx.set(&out, "then")?;
                        Ok(())
                    })
                    .else_(Captures::new().writes(&out), move |ctx| {
                        ctx.set(&out, "else")?;
                        Ok(())
                    })
                    .submit()?;
                ctx.task().name("check").reads(&out).run(move |ctx| {
                    assert_eq!(*ctx.get(&out)?, "else");
                    Ok(())
                })?;
                Ok(())
            })
            .unwrap();

        assert_eq!(diagnostics.order(), ["init", "choose", "choose.branch", "check"]);
    }

    #[test]
    fn test_while_counts_down() {
        let mut runtime = Runtime::new();
        let diagnostics = runtime
            .run(|ctx| {
                let n = ctx.initial_access::<u32>(key!("n"))?;
                ctx.task().name("init").writes(&n).run(move |ctx| {
                    ctx.set(&n, 3)?;
                    Ok(())
                })?;
                ctx.create_work_while()
                    .name("loop")
                    .reads(&n)
                    .test(move |ctx| Ok(*ctx.get(&n)? > 0))
                    .do_(Captures::new().modify(&n), move |ctx| {
                        *ctx.get_mut(&n)? -= 1;
                        Ok(())
                    })
                    .submit()?;
                ctx.task().name("check").reads(&n).run(move |ctx| {
                    assert_eq!(*ctx.get(&n)?, 0);
                    Ok(())
                })?;
                Ok(())
            })
            .unwrap();

        // four tests, three iterations
        assert_eq!(diagnostics.order().iter().filter(|n| **n == "loop").count(), 4);
        assert_eq!(diagnostics.order().iter().filter(|n| **n == "loop.step").count(), 3);
        assert_eq!(diagnostics.order().last(), Some(&"check"));
    }

    #[test]
    fn test_aliasing_rejected_then_merged() {
        let mut runtime = Runtime::new();
        let err = runtime
            .run(|ctx| {
                let h = ctx.initial_access::<i32>(key!("h"))?;
                ctx.task().reads(&h).writes(&h).run(|_| Ok(()))?;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, FlowError::UnallowedAliasing { .. }));

        let mut runtime = Runtime::new();
        runtime
            .run(|ctx| {
                let h = ctx.initial_access::<i32>(key!("h"))?;
                ctx.task()
                    .reads(&h)
                    .writes(&h)
                    .allow_aliasing()
                    .run(move |ctx| {
                        assert_eq!(ctx.permissions(&h), Some(PermissionPair::new(P::Modify, P::Modify)));
                        Ok(())
                    })?;
                Ok(())
            })
            .unwrap();
    }
}
