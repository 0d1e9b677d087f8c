//! The runtime facade: node wiring, resolvers, run styles, shutdown.
//!
//! A [`Runtime`] is a cheap-clone handle over one node's shared core.
//! `init` builds a single-node runtime; `init_mesh` builds one runtime
//! per configured node, wired over an in-process [`MeshTransport`].
//! Each node drives one message poller thread, one worker thread per
//! processor, and one shutdown finalizer thread.
//!
//! # Lock Order
//!
//! `FreeList < Table < Slot`; the shutdown gate is leaf-level and never
//! held while calling into slots or the transport.
//!
//! # Shutdown
//!
//! Two-phase: a shutdown request (local call or incoming
//! `RuntimeShutdown`) wakes the node's finalizer, which drains and
//! joins the processor workers, then broadcasts the node's own
//! `RuntimeShutdown` echo. The poller keeps dispatching until every
//! node's echo has arrived and the inbox has gone quiet, so messages
//! sent before a peer's flush are applied before exit. Every node's
//! `wait_for_shutdown` returns exactly once, after its finalizer
//! completes.

use crate::barrier::BarrierImpl;
use crate::config::{self, RuntimeConfig};
use crate::error::{Error, ErrorKind, Result};
use crate::event::{self, Event, GenEventImpl};
use crate::index_space::IndexSpaceImpl;
use crate::message::{self, Deduper, Envelope, MessageBody};
use crate::node::{MemoryInfo, MemoryKind, Node};
use crate::proc::{Machine, Processor, ProcessorImpl, ProcessorKind, TaskFn, TaskFuncId};
use crate::proc_group::ProcessorGroupImpl;
use crate::reduction::{ReductionOp, ReductionRegistry};
use crate::reservation::ReservationImpl;
use crate::table::{DynamicTable, FreeList};
use crate::transport::{MeshTransport, Transport};
use crate::types::{Id, IdKind, NodeId};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// Bytes of system memory recorded per node.
const SYSTEM_MEMORY_BYTES: u64 = 256 << 20;

/// How many copies of a task `run` launches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStyle {
    /// One task in the whole machine, on node 0's first CPU.
    OneTaskOnly,
    /// One task on every CPU processor of the calling node.
    OneTaskPerProc,
    /// One task on the calling node's first CPU.
    OneTaskPerNode,
}

/// An event-capable implementor: generational event or barrier.
#[derive(Debug)]
pub(crate) enum EventImplRef {
    Gen(Arc<GenEventImpl>),
    Barrier(Arc<BarrierImpl>),
}

#[derive(Debug, Default)]
struct ShutdownState {
    requested: bool,
    abnormal: bool,
    initiator: Option<NodeId>,
    echoes: BTreeSet<NodeId>,
    completed: bool,
}

#[derive(Debug, Default)]
struct ShutdownGate {
    state: Mutex<ShutdownState>,
    cvar: Condvar,
}

/// One node's shared state.
pub(crate) struct RuntimeCore {
    self_ref: std::sync::Weak<RuntimeCore>,
    node_id: NodeId,
    nodes: Vec<Node>,
    machine: Machine,
    transport: Arc<dyn Transport>,
    config: RuntimeConfig,

    event_free: FreeList,
    barrier_free: FreeList,
    reservation_free: FreeList,
    index_space_free: FreeList,
    proc_group_free: FreeList,

    tasks: RwLock<HashMap<TaskFuncId, TaskFn>>,
    reductions: ReductionRegistry,

    deduper: Deduper,
    send_seqs: Vec<AtomicU64>,

    gate: ShutdownGate,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    poller_handle: Mutex<Option<JoinHandle<()>>>,
    finalizer_handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RuntimeCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeCore")
            .field("node_id", &self.node_id)
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

impl RuntimeCore {
    pub(crate) fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Upgrades the self-reference for thread spawning.
    pub(crate) fn arc(&self) -> Result<Arc<Self>> {
        self.self_ref.upgrade().ok_or_else(|| {
            Error::new(ErrorKind::ShutdownInProgress).with_context("runtime is being torn down")
        })
    }

    pub(crate) fn thread_name_prefix(&self) -> &str {
        &self.config.thread_name_prefix
    }

    /// Registers a worker thread handle for teardown joining.
    pub(crate) fn adopt_worker(&self, handle: JoinHandle<()>) {
        self.worker_handles
            .lock()
            .expect("worker handles poisoned")
            .push(handle);
    }

    pub(crate) fn reductions(&self) -> &ReductionRegistry {
        &self.reductions
    }

    pub(crate) fn deduper(&self) -> &Deduper {
        &self.deduper
    }

    pub(crate) fn event_free_list(&self) -> &FreeList {
        &self.event_free
    }

    pub(crate) fn barrier_free_list(&self) -> &FreeList {
        &self.barrier_free
    }

    pub(crate) fn reservation_free_list(&self) -> &FreeList {
        &self.reservation_free
    }

    pub(crate) fn index_space_free_list(&self) -> &FreeList {
        &self.index_space_free
    }

    pub(crate) fn proc_group_free_list(&self) -> &FreeList {
        &self.proc_group_free
    }

    fn local_node(&self) -> &Node {
        &self.nodes[self.node_id.as_usize()]
    }

    pub(crate) fn local_node_events(&self) -> &DynamicTable<GenEventImpl> {
        &self.local_node().events
    }

    pub(crate) fn local_node_barriers(&self) -> &DynamicTable<BarrierImpl> {
        &self.local_node().barriers
    }

    pub(crate) fn local_node_reservations(&self) -> &DynamicTable<ReservationImpl> {
        &self.local_node().reservations
    }

    pub(crate) fn local_node_index_spaces(&self) -> &DynamicTable<IndexSpaceImpl> {
        &self.local_node().index_spaces
    }

    pub(crate) fn local_node_proc_groups(&self) -> &DynamicTable<ProcessorGroupImpl> {
        &self.local_node().proc_groups
    }

    fn owner_node(&self, id: Id) -> Result<&Node> {
        self.nodes.get(id.owner().as_usize()).ok_or_else(|| {
            Error::new(ErrorKind::Internal)
                .with_context(format!("id {id:?} names a node outside this machine"))
        })
    }

    /// Resolves a generational-event id to its slot (or proxy).
    pub(crate) fn genevent_impl(&self, id: Id) -> Result<Arc<GenEventImpl>> {
        id.expect_kind(IdKind::Event)?;
        self.owner_node(id)?.events.lookup(id.index())
    }

    /// Resolves a barrier id to its slot (or proxy).
    pub(crate) fn barrier_impl(&self, id: Id) -> Result<Arc<BarrierImpl>> {
        id.expect_kind(IdKind::Barrier)?;
        self.owner_node(id)?.barriers.lookup(id.index())
    }

    /// Resolves any event-capable id: a generational event or a
    /// barrier observed through the event contract.
    pub(crate) fn event_impl(&self, id: Id) -> Result<EventImplRef> {
        match id.kind() {
            IdKind::Event => Ok(EventImplRef::Gen(self.genevent_impl(id)?)),
            IdKind::Barrier => Ok(EventImplRef::Barrier(self.barrier_impl(id)?)),
            other => Err(Error::new(ErrorKind::KindMismatch)
                .with_context(format!("id {id:?} ({other:?}) is not event-capable"))),
        }
    }

    pub(crate) fn reservation_impl(&self, id: Id) -> Result<Arc<ReservationImpl>> {
        id.expect_kind(IdKind::Reservation)?;
        self.owner_node(id)?.reservations.lookup(id.index())
    }

    pub(crate) fn index_space_impl(&self, id: Id) -> Result<Arc<IndexSpaceImpl>> {
        id.expect_kind(IdKind::IndexSpace)?;
        self.owner_node(id)?.index_spaces.lookup(id.index())
    }

    pub(crate) fn proc_group_impl(&self, id: Id) -> Result<Arc<ProcessorGroupImpl>> {
        id.expect_kind(IdKind::ProcGroup)?;
        self.owner_node(id)?.proc_groups.lookup(id.index())
    }

    /// Resolves a local processor id to its worker.
    pub(crate) fn processor_impl(&self, id: Id) -> Result<Arc<ProcessorImpl>> {
        id.expect_kind(IdKind::Processor)?;
        if id.owner() != self.node_id {
            return Err(Error::new(ErrorKind::RemoteSpawn)
                .with_context(format!("processor {id} is hosted by {}", id.owner())));
        }
        self.local_node()
            .processors
            .get(id.index() as usize)
            .cloned()
            .ok_or_else(|| {
                Error::new(ErrorKind::Internal).with_context(format!("no processor {id}"))
            })
    }

    /// Resolves a memory id to its record.
    pub(crate) fn memory_info(&self, id: Id) -> Result<MemoryInfo> {
        id.expect_kind(IdKind::Memory)?;
        self.owner_node(id)?
            .memories
            .iter()
            .find(|m| m.id == id)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::Internal).with_context(format!("no memory {id}")))
    }

    pub(crate) fn task_fn(&self, id: TaskFuncId) -> Option<TaskFn> {
        self.tasks.read().get(&id).copied()
    }

    /// Sends a typed message to `target`, stamping the link sequence
    /// number. Transport failures escalate to an abnormal shutdown.
    pub(crate) fn send_message(&self, target: NodeId, body: MessageBody) -> Result<()> {
        let msg_id = body.msg_id();
        let seq = self.send_seqs[target.as_usize()].fetch_add(1, Ordering::Relaxed) + 1;
        let envelope = Envelope {
            sender: self.node_id,
            seq,
            body,
        };
        let bytes = envelope.encode()?;
        tracing::trace!(%target, seq, msg_id, "message sent");
        match self.transport.send(target, bytes) {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::error!(%err, %target, msg_id, "transport send failed");
                self.request_shutdown(self.node_id, true);
                Err(Error::new(ErrorKind::TransportFailure).with_source(err))
            }
        }
    }

    /// Records a shutdown request; idempotent.
    pub(crate) fn request_shutdown(&self, initiator: NodeId, abnormal: bool) {
        let mut st = self.gate.state.lock().expect("shutdown gate poisoned");
        if !st.requested {
            st.requested = true;
            st.initiator = Some(initiator);
            tracing::info!(node = %self.node_id, %initiator, abnormal, "shutdown requested");
        }
        if abnormal {
            st.abnormal = true;
        }
        drop(st);
        self.gate.cvar.notify_all();
    }

    fn record_echo(&self, from: NodeId) {
        let mut st = self.gate.state.lock().expect("shutdown gate poisoned");
        st.echoes.insert(from);
        drop(st);
        self.gate.cvar.notify_all();
    }

    /// True once the poller may stop dispatching.
    fn shutdown_drained(&self) -> bool {
        let st = self.gate.state.lock().expect("shutdown gate poisoned");
        if st.abnormal {
            return true;
        }
        st.requested
            && st.echoes.len() == self.transport.node_count()
            && !self.transport.has_pending(self.node_id)
    }

    fn local_processors(&self) -> &[Arc<ProcessorImpl>] {
        &self.local_node().processors
    }

    /// The finalizer thread body: flush local work, echo, drain, done.
    fn finalizer_loop(self: &Arc<Self>) {
        {
            let mut st = self.gate.state.lock().expect("shutdown gate poisoned");
            while !st.requested {
                st = self
                    .gate
                    .cvar
                    .wait(st)
                    .expect("shutdown gate poisoned");
            }
        }
        for proc in self.local_processors() {
            proc.request_shutdown();
        }
        // Spare workers may still be spawned while blocked tasks
        // resume; keep joining until every worker has detached.
        loop {
            let workers = std::mem::take(
                &mut *self.worker_handles.lock().expect("worker handles poisoned"),
            );
            if workers.is_empty() {
                if self
                    .local_processors()
                    .iter()
                    .all(|p| p.active_workers() == 0)
                {
                    break;
                }
                std::thread::sleep(std::time::Duration::from_millis(1));
                continue;
            }
            for handle in workers {
                if handle.join().is_err() {
                    tracing::error!(node = %self.node_id, "worker thread panicked");
                }
            }
        }
        self.broadcast_echo();
        let poller = self
            .poller_handle
            .lock()
            .expect("poller handle poisoned")
            .take();
        if let Some(handle) = poller {
            if handle.join().is_err() {
                tracing::error!(node = %self.node_id, "poller thread panicked");
            }
        }
        let mut st = self.gate.state.lock().expect("shutdown gate poisoned");
        st.completed = true;
        drop(st);
        self.gate.cvar.notify_all();
        tracing::info!(node = %self.node_id, "shutdown complete");
    }

    /// Broadcasts this node's shutdown echo after its local flush.
    fn broadcast_echo(&self) {
        let initiating_node = {
            let st = self.gate.state.lock().expect("shutdown gate poisoned");
            st.initiator.unwrap_or(self.node_id)
        };
        for n in 0..self.transport.node_count() {
            let target = NodeId(n as u16);
            if target == self.node_id {
                continue;
            }
            if let Err(err) = self.send_message(target, MessageBody::RuntimeShutdown { initiating_node }) {
                tracing::warn!(%err, %target, "shutdown echo not delivered");
            }
        }
        self.record_echo(self.node_id);
    }

    /// The poller thread body: dispatch until shutdown has drained.
    fn poller_loop(self: &Arc<Self>) {
        loop {
            if let Some(bytes) = self
                .transport
                .recv_timeout(self.node_id, self.config.poll_interval)
            {
                match Envelope::decode(&bytes) {
                    Ok(envelope) => message::dispatch(self, envelope),
                    Err(err) => tracing::error!(%err, "undecodable message dropped"),
                }
                continue;
            }
            // The inbox stayed quiet for a full poll interval; exit if
            // the machine-wide drain has completed.
            if self.shutdown_drained() {
                break;
            }
        }
        self.transport.detach(self.node_id);
        tracing::debug!(node = %self.node_id, "poller exiting");
    }
}

/// Handler for an incoming `RuntimeShutdown` echo.
pub(crate) fn handle_shutdown_message(rt: &RuntimeCore, initiating_node: NodeId, sender: NodeId) {
    rt.record_echo(sender);
    rt.request_shutdown(initiating_node, false);
}

/// A handle to one node's runtime.
#[derive(Clone, Debug)]
pub struct Runtime {
    core: Arc<RuntimeCore>,
}

impl Runtime {
    /// Initializes a single-node runtime.
    pub fn init(config: &RuntimeConfig) -> Result<Self> {
        let mut config = config.clone();
        config::apply_env_overrides(&mut config)
            .map_err(|err| Error::new(ErrorKind::InvalidConfig).with_source(err))?;
        if config.node_count != 1 {
            return Err(Error::new(ErrorKind::InvalidConfig)
                .with_context("init builds one node; use init_mesh for more"));
        }
        let mut runtimes = Self::build_mesh(config)?;
        runtimes
            .pop()
            .ok_or_else(|| Error::new(ErrorKind::Internal).with_context("mesh built no nodes"))
    }

    /// Initializes `config.node_count` runtimes wired over an
    /// in-process mesh; element `i` is node `i`.
    pub fn init_mesh(config: &RuntimeConfig) -> Result<Vec<Self>> {
        let mut config = config.clone();
        config::apply_env_overrides(&mut config)
            .map_err(|err| Error::new(ErrorKind::InvalidConfig).with_source(err))?;
        Self::build_mesh(config)
    }

    fn build_mesh(config: RuntimeConfig) -> Result<Vec<Self>> {
        config
            .validate()
            .map_err(|err| Error::new(ErrorKind::InvalidConfig).with_source(err))?;
        let node_count = config.node_count;
        let transport: Arc<dyn Transport> = Arc::new(MeshTransport::new(node_count));

        let mut topology = Vec::new();
        for n in 0..node_count {
            let node = NodeId(n as u16);
            for i in 0..config.cpus_per_node {
                let id = Id::new(IdKind::Processor, node, i as u64);
                topology.push((Processor { id }, ProcessorKind::Cpu));
            }
            for i in 0..config.utility_procs_per_node {
                let id = Id::new(IdKind::Processor, node, (config.cpus_per_node + i) as u64);
                topology.push((Processor { id }, ProcessorKind::Utility));
            }
        }
        let machine = Machine::new(topology);

        let mut runtimes = Vec::with_capacity(node_count);
        for n in 0..node_count {
            runtimes.push(Self::build_node(
                NodeId(n as u16),
                &config,
                Arc::clone(&transport),
                machine.clone(),
            ));
        }
        Ok(runtimes)
    }

    fn build_node(
        node_id: NodeId,
        config: &RuntimeConfig,
        transport: Arc<dyn Transport>,
        machine: Machine,
    ) -> Self {
        let node_count = transport.node_count();
        let mut nodes: Vec<Node> = (0..node_count).map(|n| Node::new(NodeId(n as u16))).collect();
        for (n, node) in nodes.iter_mut().enumerate() {
            node.memories.push(MemoryInfo {
                id: Id::new(IdKind::Memory, NodeId(n as u16), 1),
                kind: MemoryKind::System,
                capacity: SYSTEM_MEMORY_BYTES,
            });
        }
        let local = &mut nodes[node_id.as_usize()];
        for proc in machine.processors_of_kind(ProcessorKind::Cpu) {
            if proc.node() == node_id {
                local
                    .processors
                    .push(Arc::new(ProcessorImpl::new(proc.id, ProcessorKind::Cpu)));
            }
        }
        for proc in machine.processors_of_kind(ProcessorKind::Utility) {
            if proc.node() == node_id {
                local
                    .processors
                    .push(Arc::new(ProcessorImpl::new(proc.id, ProcessorKind::Utility)));
            }
        }

        let core = Arc::new_cyclic(|self_ref| RuntimeCore {
            self_ref: self_ref.clone(),
            node_id,
            nodes,
            machine,
            transport,
            config: config.clone(),
            event_free: FreeList::new(),
            barrier_free: FreeList::new(),
            reservation_free: FreeList::new(),
            index_space_free: FreeList::new(),
            proc_group_free: FreeList::new(),
            tasks: RwLock::new(HashMap::new()),
            reductions: ReductionRegistry::new(),
            deduper: Deduper::new(),
            send_seqs: (0..node_count).map(|_| AtomicU64::new(0)).collect(),
            gate: ShutdownGate::default(),
            worker_handles: Mutex::new(Vec::new()),
            poller_handle: Mutex::new(None),
            finalizer_handle: Mutex::new(None),
        });

        let prefix = &config.thread_name_prefix;
        for proc in core.local_processors() {
            proc.spawn_worker(&core, true);
        }

        let poller_core = Arc::clone(&core);
        let poller = std::thread::Builder::new()
            .name(format!("{prefix}-n{}-amsg", node_id.0))
            .spawn(move || poller_core.poller_loop())
            .expect("poller thread spawn failed");
        *core.poller_handle.lock().expect("poller handle poisoned") = Some(poller);

        let finalizer_core = Arc::clone(&core);
        let finalizer = std::thread::Builder::new()
            .name(format!("{prefix}-n{}-final", node_id.0))
            .spawn(move || finalizer_core.finalizer_loop())
            .expect("finalizer thread spawn failed");
        *core
            .finalizer_handle
            .lock()
            .expect("finalizer handle poisoned") = Some(finalizer);

        tracing::info!(node = %node_id, "runtime node initialized");
        Self { core }
    }

    pub(crate) fn from_core(core: Arc<RuntimeCore>) -> Self {
        Self { core }
    }

    pub(crate) fn core(&self) -> &RuntimeCore {
        &self.core
    }

    /// This runtime's node id.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.core.node_id
    }

    /// The static machine topology.
    #[must_use]
    pub fn machine(&self) -> &Machine {
        &self.core.machine
    }

    /// Registers a task function under `id`.
    pub fn register_task(&self, id: TaskFuncId, func: TaskFn) -> Result<()> {
        let mut tasks = self.core.tasks.write();
        if tasks.insert(id, func).is_some() {
            return Err(Error::new(ErrorKind::DuplicateRegistration)
                .with_context(format!("task {id} already registered")));
        }
        Ok(())
    }

    /// Registers a reduction operator.
    pub fn register_reduction(&self, op: ReductionOp) -> Result<()> {
        self.core.reductions.register(op)
    }

    /// Creates an untriggered event the caller may later trigger.
    pub fn create_user_event(&self) -> Result<Event> {
        event::create(&self.core)
    }

    /// Resolves a memory id to its record.
    pub fn memory_info(&self, id: Id) -> Result<MemoryInfo> {
        self.core.memory_info(id)
    }

    /// Launches `task` according to `style`; non-background calls block
    /// in [`Runtime::wait_for_shutdown`].
    pub fn run(
        &self,
        task: TaskFuncId,
        style: RunStyle,
        args: &[u8],
        background: bool,
    ) -> Result<()> {
        if self.core.task_fn(task).is_none() {
            return Err(
                Error::new(ErrorKind::UnknownTask).with_context(format!("task {task}"))
            );
        }
        let cpus: Vec<Arc<ProcessorImpl>> = self
            .core
            .local_processors()
            .iter()
            .filter(|p| p.kind() == ProcessorKind::Cpu)
            .cloned()
            .collect();
        let first = cpus.first().ok_or_else(|| {
            Error::new(ErrorKind::Internal).with_context("node has no CPU processors")
        })?;
        let targets: Vec<Id> = match style {
            RunStyle::OneTaskOnly => {
                if self.core.node_id == NodeId(0) {
                    vec![first.id()]
                } else {
                    Vec::new()
                }
            }
            RunStyle::OneTaskPerNode => vec![first.id()],
            RunStyle::OneTaskPerProc => cpus.iter().map(|p| p.id()).collect(),
        };
        for id in targets {
            crate::proc::spawn(
                &self.core,
                Processor { id },
                task,
                args.to_vec(),
                Event::NO_EVENT,
            )?;
        }
        if !background {
            self.wait_for_shutdown();
        }
        Ok(())
    }

    /// Requests a machine-wide shutdown from this node.
    pub fn shutdown(&self) {
        self.core.request_shutdown(self.core.node_id, false);
    }

    /// Blocks until this node's shutdown has completed.
    ///
    /// Returns exactly once per node, after local work has flushed and
    /// in-flight messages have drained.
    pub fn wait_for_shutdown(&self) {
        {
            let mut st = self
                .core
                .gate
                .state
                .lock()
                .expect("shutdown gate poisoned");
            while !st.completed {
                st = self
                    .core
                    .gate
                    .cvar
                    .wait(st)
                    .expect("shutdown gate poisoned");
            }
        }
        let finalizer = self
            .core
            .finalizer_handle
            .lock()
            .expect("finalizer handle poisoned")
            .take();
        if let Some(handle) = finalizer {
            if handle.join().is_err() {
                tracing::error!(node = %self.core.node_id, "finalizer thread panicked");
            }
        }
    }
}

static CURRENT: Mutex<Option<Runtime>> = Mutex::new(None);

/// Installs a runtime as the process-wide instance (driver path only;
/// tests construct fresh runtimes and never touch this).
pub fn install(rt: &Runtime) -> Result<()> {
    let mut current = CURRENT.lock().expect("runtime singleton poisoned");
    if current.is_some() {
        return Err(Error::new(ErrorKind::DuplicateRegistration)
            .with_context("a runtime is already installed"));
    }
    *current = Some(rt.clone());
    Ok(())
}

/// Returns the installed runtime, if any.
#[must_use]
pub fn current() -> Option<Runtime> {
    CURRENT.lock().expect("runtime singleton poisoned").clone()
}

/// Clears the installed runtime.
pub fn uninstall() {
    CURRENT.lock().expect("runtime singleton poisoned").take();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Envelope;
    use crate::test_utils::{init_test_logging, shutdown_mesh, test_mesh, test_runtime};
    use crate::Barrier;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn invalid_config_is_rejected() {
        init_test_logging();
        let err = Runtime::init(&RuntimeConfig::new().cpus_per_node(0)).expect_err("expected err");
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
        let err = Runtime::init(&RuntimeConfig::new().node_count(2)).expect_err("expected err");
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }

    #[test]
    fn resolvers_reject_wrong_kinds() {
        init_test_logging();
        let rt = test_runtime();
        let event = rt.create_user_event().expect("create failed");
        let err = rt.core().barrier_impl(event.id).expect_err("expected err");
        assert_eq!(err.kind(), ErrorKind::KindMismatch);
        let err = rt.core().event_impl(Id::new(IdKind::Memory, NodeId(0), 1));
        assert_eq!(err.expect_err("expected err").kind(), ErrorKind::KindMismatch);
        rt.shutdown();
        rt.wait_for_shutdown();
    }

    #[test]
    fn duplicate_task_registration_is_rejected() {
        init_test_logging();
        fn noop(_ctx: &crate::TaskContext, _args: &[u8]) {}
        let rt = test_runtime();
        rt.register_task(10, noop).expect("register failed");
        let err = rt.register_task(10, noop).expect_err("expected err");
        assert_eq!(err.kind(), ErrorKind::DuplicateRegistration);
        rt.shutdown();
        rt.wait_for_shutdown();
    }

    #[test]
    fn run_rejects_unregistered_tasks() {
        init_test_logging();
        let rt = test_runtime();
        let err = rt
            .run(99, RunStyle::OneTaskPerNode, &[], true)
            .expect_err("expected err");
        assert_eq!(err.kind(), ErrorKind::UnknownTask);
        rt.shutdown();
        rt.wait_for_shutdown();
    }

    #[test]
    fn memory_records_resolve() {
        init_test_logging();
        let rt = test_runtime();
        let id = Id::new(IdKind::Memory, NodeId(0), 1);
        let info = rt.memory_info(id).expect("resolve failed");
        assert_eq!(info.id, id);
        rt.shutdown();
        rt.wait_for_shutdown();
    }

    #[test]
    fn run_one_task_per_proc_runs_on_every_cpu() {
        init_test_logging();
        crate::test_phase!("run_one_task_per_proc_runs_on_every_cpu");
        static RUNS: AtomicUsize = AtomicUsize::new(0);
        fn count_task(ctx: &crate::TaskContext, _args: &[u8]) {
            RUNS.fetch_add(1, Ordering::SeqCst);
            if RUNS.load(Ordering::SeqCst) == crate::test_utils::TEST_CPUS {
                ctx.runtime().shutdown();
            }
        }
        let rt = test_runtime();
        rt.register_task(20, count_task).expect("register failed");
        rt.run(20, RunStyle::OneTaskPerProc, &[], false)
            .expect("run failed");
        assert_eq!(RUNS.load(Ordering::SeqCst), crate::test_utils::TEST_CPUS);
        crate::test_complete!("run_one_task_per_proc_runs_on_every_cpu");
    }

    #[test]
    fn singleton_install_round_trip() {
        init_test_logging();
        let rt = test_runtime();
        install(&rt).expect("install failed");
        assert!(current().is_some());
        let err = install(&rt).expect_err("expected err");
        assert_eq!(err.kind(), ErrorKind::DuplicateRegistration);
        uninstall();
        assert!(current().is_none());
        rt.shutdown();
        rt.wait_for_shutdown();
    }

    #[test]
    fn replayed_arrival_is_idempotent() {
        init_test_logging();
        crate::test_phase!("replayed_arrival_is_idempotent");
        let runtimes = test_mesh(2);
        let owner = &runtimes[0];

        let b = Barrier::create_barrier(owner, 2, None, &[]).expect("create failed");
        // A sender id outside the mesh keeps the crafted replay from
        // colliding with node 1's organic sequence numbers.
        let envelope = Envelope {
            sender: NodeId(9),
            seq: 1,
            body: MessageBody::BarrierArrival {
                barrier: b.id,
                creator_gen: 0,
                gen: 1,
                count: 1,
                value: None,
                poisoned: false,
            },
        };
        // At-least-once delivery: the same envelope lands twice, and
        // the second copy must not count as a new arrival.
        message::dispatch(owner.core(), envelope.clone());
        message::dispatch(owner.core(), envelope);
        let mut out = [0_u8; 0];
        assert!(!b.get_result(owner, &mut out).expect("get_result failed"));

        b.arrive(owner, 1, Event::NO_EVENT, None).expect("arrive failed");
        assert!(b.get_result(owner, &mut out).expect("get_result failed"));

        shutdown_mesh(&runtimes);
        crate::test_complete!("replayed_arrival_is_idempotent");
    }
}
