//! Processors, task spawning, and the machine topology.
//!
//! Each local processor drains a FIFO queue of task bodies. `spawn`
//! mints a finish event for the task, defers the body behind an
//! untriggered precondition, and poisons the finish event instead of
//! running the body when the precondition was poisoned. Cross-node
//! dispatch is a scheduler concern outside the core: spawn targets
//! must be local.
//!
//! A processor normally runs one worker thread. When a task suspends in
//! an event or barrier wait, the worker marks itself blocked and the
//! processor adds a spare worker so queued tasks keep draining; spares
//! retire once no worker is blocked. This keeps nested
//! spawn-then-wait patterns deadlock-free without a preemptive
//! scheduler.

use crate::error::{Error, ErrorKind, Result};
use crate::event::{self, Event};
use crate::runtime::{Runtime, RuntimeCore};
use crate::types::{Id, IdKind, NodeId};
use crossbeam_queue::SegQueue;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

/// Identifier of a registered task function.
pub type TaskFuncId = u32;

/// First task id available to applications; lower ids are reserved.
pub const TASK_ID_FIRST_AVAILABLE: TaskFuncId = 4;

/// A registered task entry point.
pub type TaskFn = fn(&TaskContext, &[u8]);

/// Execution context handed to every task body.
pub struct TaskContext {
    runtime: Runtime,
    proc: Processor,
}

impl TaskContext {
    /// The runtime this task runs under.
    #[must_use]
    pub const fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// The processor executing this task.
    #[must_use]
    pub const fn proc(&self) -> Processor {
        self.proc
    }
}

/// The flavor of a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessorKind {
    /// A general-purpose CPU worker.
    Cpu,
    /// A utility worker reserved for runtime-internal tasks.
    Utility,
}

/// A handle to a processor.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct Processor {
    /// The processor's id.
    pub id: Id,
}

impl Processor {
    /// Returns this processor's kind from the machine topology.
    pub fn kind(&self, rt: &Runtime) -> Result<ProcessorKind> {
        rt.machine().kind_of(*self)
    }

    /// Returns the node hosting this processor.
    #[must_use]
    pub fn node(&self) -> NodeId {
        self.id.owner()
    }

    /// Queues `task` on this processor once `wait_on` triggers.
    ///
    /// Returns the task's finish event. The processor must be local to
    /// the calling runtime's node.
    pub fn spawn(
        &self,
        rt: &Runtime,
        task: TaskFuncId,
        args: &[u8],
        wait_on: Event,
    ) -> Result<Event> {
        spawn(rt.core(), *self, task, args.to_vec(), wait_on)
    }
}

struct TaskBody {
    func: TaskFuncId,
    args: Vec<u8>,
    finish: Event,
    poisoned: bool,
}

#[derive(Debug, Default)]
struct ProcState {
    shutdown: bool,
    /// Worker threads currently attached to this processor.
    active: usize,
    /// Workers suspended in an event or barrier wait.
    blocked: usize,
}

/// A local processor: a task queue and its worker threads.
pub struct ProcessorImpl {
    me: Id,
    kind: ProcessorKind,
    queue: SegQueue<TaskBody>,
    state: Mutex<ProcState>,
    cvar: Condvar,
}

impl std::fmt::Debug for ProcessorImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorImpl")
            .field("me", &self.me)
            .field("kind", &self.kind)
            .field("queued", &self.queue.len())
            .finish()
    }
}

struct WorkerContext {
    proc: Arc<ProcessorImpl>,
    core: Weak<RuntimeCore>,
}

thread_local! {
    static WORKER_CONTEXT: RefCell<Option<WorkerContext>> = const { RefCell::new(None) };
}

impl ProcessorImpl {
    pub(crate) fn new(me: Id, kind: ProcessorKind) -> Self {
        Self {
            me,
            kind,
            queue: SegQueue::new(),
            state: Mutex::new(ProcState::default()),
            cvar: Condvar::new(),
        }
    }

    /// Returns this processor's well-known id.
    pub(crate) const fn id(&self) -> Id {
        self.me
    }

    pub(crate) const fn kind(&self) -> ProcessorKind {
        self.kind
    }

    /// Worker threads still attached (for teardown bookkeeping).
    pub(crate) fn active_workers(&self) -> usize {
        self.state.lock().expect("processor lock poisoned").active
    }

    fn enqueue(self: &Arc<Self>, core: &Arc<RuntimeCore>, body: TaskBody) {
        self.queue.push(body);
        let mut st = self.state.lock().expect("processor lock poisoned");
        if st.blocked >= st.active {
            self.add_worker_locked(core, &mut st, false);
        }
        drop(st);
        self.cvar.notify_one();
    }

    /// Asks the workers to exit once the queue is drained.
    pub(crate) fn request_shutdown(&self) {
        let mut st = self.state.lock().expect("processor lock poisoned");
        st.shutdown = true;
        drop(st);
        self.cvar.notify_all();
    }

    /// Attaches a worker thread to this processor.
    ///
    /// The primary worker lives until shutdown; spares retire once no
    /// worker is blocked.
    pub(crate) fn spawn_worker(self: &Arc<Self>, core: &Arc<RuntimeCore>, primary: bool) {
        let mut st = self.state.lock().expect("processor lock poisoned");
        self.add_worker_locked(core, &mut st, primary);
    }

    fn add_worker_locked(
        self: &Arc<Self>,
        core: &Arc<RuntimeCore>,
        st: &mut ProcState,
        primary: bool,
    ) {
        st.active += 1;
        let proc = Arc::clone(self);
        let worker_core = Arc::clone(core);
        let name = format!(
            "{}-n{}-p{}{}",
            core.thread_name_prefix(),
            core.node_id().0,
            self.me.index(),
            if primary { "" } else { "-s" }
        );
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || proc.worker_loop(&worker_core, primary))
            .expect("worker thread spawn failed");
        core.adopt_worker(handle);
    }

    fn worker_loop(self: &Arc<Self>, core: &Arc<RuntimeCore>, primary: bool) {
        WORKER_CONTEXT.with(|ctx| {
            *ctx.borrow_mut() = Some(WorkerContext {
                proc: Arc::clone(self),
                core: Arc::downgrade(core),
            });
        });
        loop {
            if let Some(body) = self.queue.pop() {
                self.execute(core, body);
                continue;
            }
            let guard = self.state.lock().expect("processor lock poisoned");
            if self.queue.is_empty() {
                if guard.shutdown || (!primary && guard.blocked == 0) {
                    break;
                }
                let (guard, _) = self
                    .cvar
                    .wait_timeout(guard, Duration::from_millis(10))
                    .expect("processor lock poisoned");
                drop(guard);
            }
        }
        let mut st = self.state.lock().expect("processor lock poisoned");
        st.active -= 1;
        drop(st);
        WORKER_CONTEXT.with(|ctx| ctx.borrow_mut().take());
        tracing::debug!(proc = %self.me, primary, "processor worker exiting");
    }

    fn execute(&self, core: &Arc<RuntimeCore>, body: TaskBody) {
        if body.poisoned {
            self.finish(core, body.finish, true);
            return;
        }
        let Some(func) = core.task_fn(body.func) else {
            tracing::error!(proc = %self.me, task = body.func, "unknown task id");
            self.finish(core, body.finish, true);
            return;
        };
        let ctx = TaskContext {
            runtime: Runtime::from_core(Arc::clone(core)),
            proc: Processor { id: self.me },
        };
        tracing::trace!(proc = %self.me, task = body.func, "task starting");
        let outcome = catch_unwind(AssertUnwindSafe(|| func(&ctx, &body.args)));
        let poisoned = outcome.is_err();
        if poisoned {
            tracing::error!(proc = %self.me, task = body.func, "task panicked");
        }
        self.finish(core, body.finish, poisoned);
    }

    fn finish(&self, core: &Arc<RuntimeCore>, finish: Event, poisoned: bool) {
        if let Err(err) = event::trigger(core, finish, poisoned) {
            tracing::error!(%err, proc = %self.me, "finish event trigger failed");
        }
    }

    fn begin_blocking(self: &Arc<Self>, core: &Arc<RuntimeCore>) {
        let mut st = self.state.lock().expect("processor lock poisoned");
        st.blocked += 1;
        if st.blocked >= st.active {
            self.add_worker_locked(core, &mut st, false);
        }
    }

    fn end_blocking(&self) {
        let mut st = self.state.lock().expect("processor lock poisoned");
        st.blocked -= 1;
        drop(st);
        self.cvar.notify_all();
    }
}

/// Marks the calling worker blocked for the duration of the guard.
///
/// Returns an inert guard when the caller is not one of `rt`'s
/// processor workers (e.g. the driver's main thread).
pub(crate) fn blocking_section(rt: &RuntimeCore) -> BlockingGuard {
    WORKER_CONTEXT.with(|ctx| {
        let borrow = ctx.borrow();
        if let Some(wc) = borrow.as_ref() {
            if let Some(core) = wc.core.upgrade() {
                if std::ptr::eq(Arc::as_ptr(&core), std::ptr::from_ref(rt)) {
                    wc.proc.begin_blocking(&core);
                    return BlockingGuard {
                        proc: Some(Arc::clone(&wc.proc)),
                    };
                }
            }
        }
        BlockingGuard { proc: None }
    })
}

/// Guard returned by [`blocking_section`]; unblocks on drop.
pub(crate) struct BlockingGuard {
    proc: Option<Arc<ProcessorImpl>>,
}

impl Drop for BlockingGuard {
    fn drop(&mut self) {
        if let Some(proc) = self.proc.take() {
            proc.end_blocking();
        }
    }
}

/// Queues a task on a local processor behind a precondition.
pub(crate) fn spawn(
    rt: &RuntimeCore,
    proc: Processor,
    func: TaskFuncId,
    args: Vec<u8>,
    wait_on: Event,
) -> Result<Event> {
    proc.id.expect_kind(IdKind::Processor)?;
    if proc.id.owner() != rt.node_id() {
        return Err(Error::new(ErrorKind::RemoteSpawn).with_context(format!(
            "processor {} is hosted by {}",
            proc.id,
            proc.id.owner()
        )));
    }
    let imp = rt.processor_impl(proc.id)?;
    let finish = event::create(rt)?;
    let (triggered, poisoned) = event::observe(rt, wait_on)?;
    if triggered {
        let core = rt.arc()?;
        imp.enqueue(
            &core,
            TaskBody {
                func,
                args,
                finish,
                poisoned,
            },
        );
    } else {
        event::subscribe(
            rt,
            wait_on,
            Box::new(move |rt2: &RuntimeCore, poisoned: bool| {
                let queued = rt2.arc().and_then(|core| {
                    let imp = rt2.processor_impl(proc.id)?;
                    imp.enqueue(
                        &core,
                        TaskBody {
                            func,
                            args,
                            finish,
                            poisoned,
                        },
                    );
                    Ok(())
                });
                if let Err(err) = queued {
                    tracing::error!(%err, "deferred spawn lost its processor");
                }
            }),
        )?;
    }
    Ok(finish)
}

/// The static machine topology: every processor on every node.
#[derive(Debug, Clone)]
pub struct Machine {
    procs: Arc<Vec<(Processor, ProcessorKind)>>,
}

impl Machine {
    pub(crate) fn new(procs: Vec<(Processor, ProcessorKind)>) -> Self {
        Self {
            procs: Arc::new(procs),
        }
    }

    /// Every processor in the machine, across all nodes.
    #[must_use]
    pub fn all_processors(&self) -> Vec<Processor> {
        self.procs.iter().map(|(p, _)| *p).collect()
    }

    /// Every processor of the given kind, across all nodes.
    #[must_use]
    pub fn processors_of_kind(&self, kind: ProcessorKind) -> Vec<Processor> {
        self.procs
            .iter()
            .filter(|(_, k)| *k == kind)
            .map(|(p, _)| *p)
            .collect()
    }

    /// The kind of one processor.
    pub fn kind_of(&self, proc: Processor) -> Result<ProcessorKind> {
        self.procs
            .iter()
            .find(|(p, _)| *p == proc)
            .map(|(_, k)| *k)
            .ok_or_else(|| {
                Error::new(ErrorKind::KindMismatch)
                    .with_context(format!("{} is not a machine processor", proc.id))
            })
    }
}
