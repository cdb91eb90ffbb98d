//! Per-node lifecycle manager for addressable activations.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ ExecutionSystem                              │
//! │                                              │
//! │  handles: reference → ExecutionHandle        │
//! │  leases:  reference → AddressableLease       │
//! │                                              │
//! │  handle_invocation ─▶ lease ─▶ get_or_create │
//! │                                  └▶ invoke   │
//! │  tick ─▶ external / TTL / lease checks       │
//! │  stop ─▶ deactivate all, paced by strategy   │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! # Get-or-create
//!
//! ```text
//! Fast path:  handles.get(reference) → existing handle
//! Slow path:  handles.entry(reference)
//!               Occupied → existing handle (lost the race)
//!               Vacant   → spawn handle, enqueue activation, insert
//! ```
//!
//! The activation event is enqueued before the handle becomes visible, so
//! it is always the first event its worker sees.
//!
//! # Retirement
//!
//! When a worker finishes its deactivate hook it removes itself from
//! `handles` and releases the lease in one step, holding the lease slot
//! that get-or-create also holds. Invocations that still find the old
//! handle land in its closed queue and are rerouted.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::addressable::{AddressableFactory, AddressableInvocation, AddressableReference, AddressableRegistry};
use crate::cluster::NodeId;
use crate::config::RuntimeConfig;
use crate::error::{ExecutionError, InvocationError, LeaseError};
use crate::execution::{
    DeactivationReason, DeactivationStrategy, ExecutionHandle, ExecutionLeases, HandleEnv, HandleObserver,
};
use crate::pipeline::{Completion, Envelope, Message, PipelineHandle};
use crate::task::TaskSupervisor;
use crate::time::{Clock, Timestamp};

type Handles = Arc<DashMap<AddressableReference, ExecutionHandle>>;

/// Forgets a finished activation and releases its lease.
struct Retirement {
    leases: Arc<ExecutionLeases>,
    handles: Handles,
}

#[async_trait]
impl HandleObserver for Retirement {
    async fn retired(&self, reference: &AddressableReference, handle_id: u64) {
        release(&self.leases, &self.handles, reference, handle_id).await;
    }
}

/// Drop `handle_id` from `handles` and release the lease, as one step under
/// the lease slot. A handle that is no longer registered (already forced
/// out, or replaced) leaves the lease to its successor.
async fn release(leases: &ExecutionLeases, handles: &Handles, reference: &AddressableReference, handle_id: u64) -> bool {
    leases
        .abandon_lease_if(reference, || {
            handles
                .remove_if(reference, |_, handle| handle.id() == handle_id)
                .is_some()
        })
        .await
}

struct Inner {
    node_id: NodeId,
    registry: Arc<AddressableRegistry>,
    handles: Handles,
    leases: Arc<ExecutionLeases>,
    pipeline: PipelineHandle,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn HandleObserver>,
    supervisor: TaskSupervisor,
    addressable_ttl: Duration,
    deactivation_timeout: Duration,
    strategy: DeactivationStrategy,
    queue_capacity: usize,
    next_handle_id: AtomicU64,
    stopping: AtomicBool,
}

/// Activates, invokes and reaps the addressables hosted by one node.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ExecutionSystem {
    inner: Arc<Inner>,
}

impl ExecutionSystem {
    pub fn new(
        node_id: NodeId,
        config: &RuntimeConfig,
        registry: Arc<AddressableRegistry>,
        leases: Arc<ExecutionLeases>,
        pipeline: PipelineHandle,
        clock: Arc<dyn Clock>,
        supervisor: TaskSupervisor,
    ) -> Self {
        let handles: Handles = Arc::new(DashMap::new());
        let observer = Arc::new(Retirement {
            leases: leases.clone(),
            handles: handles.clone(),
        });

        Self {
            inner: Arc::new(Inner {
                node_id,
                registry,
                handles,
                leases,
                pipeline,
                clock,
                observer,
                supervisor,
                addressable_ttl: config.addressable_ttl(),
                deactivation_timeout: config.deactivation_timeout(),
                strategy: config.deactivation_strategy(),
                queue_capacity: config.handle_queue_capacity(),
                next_handle_id: AtomicU64::new(1),
                stopping: AtomicBool::new(false),
            }),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.inner.node_id
    }

    pub fn leases(&self) -> &Arc<ExecutionLeases> {
        &self.inner.leases
    }

    /// Number of activations currently registered.
    pub fn active_count(&self) -> usize {
        self.inner.handles.len()
    }

    pub fn is_active(&self, reference: &AddressableReference) -> bool {
        self.inner.handles.contains_key(reference)
    }

    pub fn handle(&self, reference: &AddressableReference) -> Option<ExecutionHandle> {
        self.inner.handles.get(reference).map(|entry| entry.value().clone())
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::Acquire)
    }

    /// Deliver `invocation` to its local activation, creating it if needed.
    ///
    /// Never fails synchronously: every outcome, including refusal, is
    /// reported through `completion`. If another node holds the lease the
    /// invocation goes back through routing with `attempts + 1`.
    pub(crate) async fn handle_invocation(
        &self,
        invocation: AddressableInvocation,
        completion: Option<Completion>,
        attempts: u32,
    ) {
        let reference = invocation.reference.clone();

        let factory = match self.inner.registry.resolve(&reference.addressable_type) {
            Ok(factory) => factory,
            Err(e) => {
                tracing::warn!(reference = %reference, "cannot host addressable: {}", e);
                fail(completion, ExecutionError::UnsupportedType(reference.addressable_type.clone()));
                return;
            }
        };

        // Registration happens under the lease, so a retiring activation
        // cannot release it in between.
        let registered = self
            .inner
            .leases
            .with_lease(&reference, |_| self.get_or_create(&reference, factory.as_ref()))
            .await;
        let handle = match registered {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                fail(completion, e);
                return;
            }
            Err(LeaseError::NotHolder { holder, .. }) => {
                tracing::debug!(
                    reference = %reference,
                    holder = ?holder,
                    attempts,
                    "lease held elsewhere, rerouting"
                );
                self.reroute(invocation, completion, attempts + 1);
                return;
            }
            Err(e) => {
                tracing::warn!(reference = %reference, "lease acquisition failed: {}", e);
                fail(completion, e);
                return;
            }
        };

        if let Err(rejected) = handle.invoke(invocation, completion, attempts) {
            if rejected.closed {
                tracing::debug!(reference = %reference, "activation retired, rerouting");
                self.reroute(rejected.invocation, rejected.completion, rejected.attempts + 1);
            } else {
                tracing::warn!(reference = %reference, capacity = self.inner.queue_capacity, "invocation queue full");
                fail(
                    rejected.completion,
                    ExecutionError::CapacityExceeded {
                        reference,
                        capacity: self.inner.queue_capacity,
                    },
                );
            }
        }
    }

    fn reroute(&self, invocation: AddressableInvocation, completion: Option<Completion>, attempts: u32) {
        let mut message = Message::request(invocation);
        message.attempts = attempts;
        self.inner.pipeline.requeue(Envelope::new(message, completion));
    }

    fn get_or_create(
        &self,
        reference: &AddressableReference,
        factory: &dyn AddressableFactory,
    ) -> Result<ExecutionHandle, ExecutionError> {
        if let Some(existing) = self.inner.handles.get(reference) {
            return Ok(existing.value().clone());
        }

        match self.inner.handles.entry(reference.clone()) {
            Entry::Occupied(existing) => Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                let env = HandleEnv {
                    handle_id: self.inner.next_handle_id.fetch_add(1, Ordering::Relaxed),
                    node_id: self.inner.node_id.clone(),
                    clock: self.inner.clock.clone(),
                    capacity: self.inner.queue_capacity,
                    pipeline: self.inner.pipeline.clone(),
                    observer: self.inner.observer.clone(),
                    supervisor: self.inner.supervisor.clone(),
                };
                let handle = factory.spawn(reference.clone(), env);
                // Failures reach the invocations queued behind the activation.
                let _activation = handle.activate()?;
                tracing::debug!(reference = %reference, handle = handle.id(), "created activation");
                slot.insert(handle.clone());
                Ok(handle)
            }
        }
    }

    /// Start deactivating one activation.
    ///
    /// Returns `false` if it is not active here or is already deactivating.
    pub async fn deactivate(&self, reference: &AddressableReference, reason: DeactivationReason) -> bool {
        match self.handle(reference) {
            Some(handle) => handle.deactivate(reason).await,
            None => false,
        }
    }

    /// One sweep over every activation.
    ///
    /// Each activation is checked on its own; a failed lease renewal only
    /// deactivates the activation it belongs to.
    pub async fn tick(&self) {
        let now = self.inner.clock.now();
        let handles: Vec<ExecutionHandle> = self
            .inner
            .handles
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        for handle in handles {
            if handle.deactivation_started() {
                continue;
            }
            if let Some(reason) = self.check(&handle, now).await {
                // Enqueueing may wait for queue space; don't hold up the sweep.
                tokio::spawn(async move {
                    handle.deactivate(reason).await;
                });
            }
        }
    }

    async fn check(&self, handle: &ExecutionHandle, now: Timestamp) -> Option<DeactivationReason> {
        if handle.deactivation_requested() {
            return Some(DeactivationReason::ExternallyTriggered);
        }

        if now.saturating_duration_since(handle.last_activity()) > self.inner.addressable_ttl {
            return Some(DeactivationReason::TtlExpired);
        }

        match self.inner.leases.renew_lease(handle.reference()).await {
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(reference = %handle.reference(), "lease renewal failed: {}", e);
                Some(DeactivationReason::LeaseRenewalFailed)
            }
        }
    }

    /// Deactivate everything with `NodeShuttingDown`.
    ///
    /// Repeats until no activation is left, so activations created while
    /// draining are deactivated too. An activation that does not finish
    /// within the deactivation timeout is dropped from the node and its
    /// lease released anyway.
    pub async fn stop(&self) {
        self.inner.stopping.store(true, Ordering::Release);
        let started = tokio::time::Instant::now();

        loop {
            let batch: Vec<ExecutionHandle> = self
                .inner
                .handles
                .iter()
                .map(|entry| entry.value().clone())
                .collect();
            if batch.is_empty() {
                break;
            }
            let strategy = self.inner.strategy.after(started.elapsed());
            tracing::info!(node = %self.inner.node_id, count = batch.len(), strategy = ?strategy, "deactivating addressables");

            let inner = self.inner.clone();
            strategy
                .run(batch, move |handle| shut_down(inner.clone(), handle))
                .await;
        }
    }
}

async fn shut_down(inner: Arc<Inner>, handle: ExecutionHandle) {
    // Enqueueing waits for queue space, so it counts against the timeout too.
    let deactivated = tokio::time::timeout(inner.deactivation_timeout, async {
        handle.deactivate(DeactivationReason::NodeShuttingDown).await;
        handle.wait_deactivated().await;
    })
    .await;

    if deactivated.is_err() {
        tracing::warn!(
            reference = %handle.reference(),
            timeout = ?inner.deactivation_timeout,
            "addressable did not deactivate in time, forcing removal; possible state corruption"
        );
        release(&inner.leases, &inner.handles, handle.reference(), handle.id()).await;
    }
}

fn fail(completion: Option<Completion>, error: impl Into<InvocationError>) {
    if let Some(completion) = completion {
        let _ = completion.send(Err(error.into()));
    }
}

impl fmt::Debug for ExecutionSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionSystem")
            .field("node_id", &self.inner.node_id)
            .field("active", &self.inner.handles.len())
            .field("stopping", &self.is_stopping())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde::{Deserialize, Serialize};
    use tokio::sync::{mpsc, oneshot, Notify};

    use super::*;
    use crate::addressable::{Addressable, AddressableContext, DispatchTable, MethodHandler};
    use crate::codec::Value;
    use crate::directory::{AddressableDirectory, InMemoryAddressableDirectory, RandomRouting};
    use crate::error::AddressableError;
    use crate::pipeline::PipelineTask;
    use crate::task::{ErrorHandler, TaskError};
    use crate::time::ManualClock;

    #[derive(Default)]
    struct Counter {
        count: u64,
        log: Option<Arc<Mutex<Vec<(String, DeactivationReason)>>>>,
        /// Signalled from the deactivate hook, which then lingers briefly.
        draining: Option<Arc<Notify>>,
    }

    #[derive(Serialize, Deserialize)]
    struct Increment;

    #[derive(Serialize, Deserialize)]
    struct Hang;

    #[derive(Serialize, Deserialize)]
    struct Explode;

    #[derive(Debug, Default)]
    struct RecordingHandler(Mutex<Vec<(String, TaskError)>>);

    impl ErrorHandler for RecordingHandler {
        fn handle(&self, task: &str, error: &TaskError) {
            self.0.lock().expect("lock").push((task.to_string(), error.clone()));
        }
    }

    #[async_trait]
    impl Addressable for Counter {
        const ADDRESSABLE_TYPE: &'static str = "Counter";

        fn register_methods(table: &mut DispatchTable<Self>) {
            table
                .register::<Increment, u64>()
                .register::<Hang, ()>()
                .register::<Explode, ()>();
        }

        async fn on_deactivate(
            &mut self,
            ctx: &AddressableContext,
            reason: DeactivationReason,
        ) -> Result<(), AddressableError> {
            if let Some(log) = &self.log {
                log.lock().expect("lock").push((ctx.reference().key.to_string(), reason));
            }
            if let Some(draining) = &self.draining {
                draining.notify_one();
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Ok(())
        }
    }

    #[async_trait]
    impl MethodHandler<Increment, u64> for Counter {
        async fn handle(&mut self, _req: Increment, ctx: &AddressableContext) -> Result<u64, AddressableError> {
            self.count += 1;
            if self.count == 100 {
                ctx.deactivate_on_idle();
            }
            Ok(self.count)
        }
    }

    #[async_trait]
    impl MethodHandler<Hang, ()> for Counter {
        async fn handle(&mut self, _req: Hang, _ctx: &AddressableContext) -> Result<(), AddressableError> {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
            Ok(())
        }
    }

    #[async_trait]
    impl MethodHandler<Explode, ()> for Counter {
        async fn handle(&mut self, _req: Explode, _ctx: &AddressableContext) -> Result<(), AddressableError> {
            let explode = true;
            if explode {
                panic!("kaboom");
            }
            Ok(())
        }
    }

    struct Harness {
        system: ExecutionSystem,
        directory: Arc<InMemoryAddressableDirectory>,
        clock: ManualClock,
        pipeline: mpsc::Receiver<PipelineTask>,
        log: Arc<Mutex<Vec<(String, DeactivationReason)>>>,
        errors: Arc<RecordingHandler>,
        draining: Arc<Notify>,
    }

    impl Harness {
        fn reasons(&self) -> Vec<DeactivationReason> {
            self.log.lock().expect("lock").iter().map(|(_, reason)| *reason).collect()
        }
    }

    fn harness(config: RuntimeConfig) -> Harness {
        let clock = ManualClock::new(Timestamp::from_millis(1_000));
        let node = NodeId::new("a", "default");
        let directory = Arc::new(InMemoryAddressableDirectory::new(
            Arc::new(RandomRouting::seeded(1)),
            Arc::new(clock.clone()),
            config.addressable_lease_duration(),
        ));
        let log = Arc::new(Mutex::new(Vec::new()));
        let draining = Arc::new(Notify::new());
        let errors = Arc::new(RecordingHandler::default());
        let mut registry = AddressableRegistry::new();
        {
            let log = log.clone();
            let draining = draining.clone();
            registry.register_with::<Counter, _>(move |reference| Counter {
                count: 0,
                log: Some(log.clone()),
                draining: (reference.key.to_string() == "slow-exit").then(|| draining.clone()),
            });
        }
        let (sender, pipeline) = mpsc::channel(64);
        let system = ExecutionSystem::new(
            node.clone(),
            &config,
            Arc::new(registry),
            Arc::new(ExecutionLeases::new(node, directory.clone(), Arc::new(clock.clone()))),
            PipelineHandle::new(sender),
            Arc::new(clock.clone()),
            TaskSupervisor::new(errors.clone()),
        );
        Harness {
            system,
            directory,
            clock,
            pipeline,
            log,
            errors,
            draining,
        }
    }

    fn config() -> RuntimeConfig {
        RuntimeConfig::builder()
            .tick_rate(Duration::from_millis(100))
            .addressable_ttl(Duration::from_millis(1_000))
            .deactivation_timeout(Duration::from_millis(200))
            .build()
            .expect("valid config")
    }

    fn reference(key: &str) -> AddressableReference {
        AddressableReference::new("Counter", key)
    }

    async fn call(system: &ExecutionSystem, reference: AddressableReference, method: &str) -> Result<Value, InvocationError> {
        let (completion, receiver) = oneshot::channel();
        system
            .handle_invocation(AddressableInvocation::new(reference, method, Value::Null), Some(completion), 0)
            .await;
        receiver.await.expect("completed")
    }

    async fn wait_inactive(system: &ExecutionSystem, reference: &AddressableReference) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while system.is_active(reference) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("deactivated in time");
    }

    #[tokio::test]
    async fn test_activates_once_and_keeps_state() {
        let h = harness(config());

        assert_eq!(call(&h.system, reference("x"), "Increment").await, Ok(serde_json::json!(1)));
        assert_eq!(call(&h.system, reference("x"), "Increment").await, Ok(serde_json::json!(2)));

        assert_eq!(h.system.active_count(), 1);
        assert_eq!(
            h.directory.locate(&reference("x")).await,
            Some(NodeId::new("a", "default"))
        );
    }

    #[tokio::test]
    async fn test_unknown_type_is_refused() {
        let h = harness(config());

        let result = call(&h.system, AddressableReference::new("Ledger", "x"), "Increment").await;

        assert_eq!(
            result,
            Err(InvocationError::Execution(ExecutionError::UnsupportedType("Ledger".to_string())))
        );
        assert_eq!(h.system.active_count(), 0);
    }

    #[tokio::test]
    async fn test_foreign_lease_reroutes_with_incremented_attempts() {
        let mut h = harness(config());
        h.directory
            .acquire(&reference("x"), &NodeId::new("b", "default"))
            .await
            .expect("b holds it");

        let (completion, _receiver) = oneshot::channel();
        h.system
            .handle_invocation(
                AddressableInvocation::new(reference("x"), "Increment", Value::Null),
                Some(completion),
                2,
            )
            .await;

        match h.pipeline.recv().await.expect("requeued") {
            PipelineTask::Outbound(envelope) => {
                assert_eq!(envelope.message.attempts, 3);
                assert!(envelope.completion.is_some());
            }
            PipelineTask::Inbound(_) => panic!("expected outbound"),
        }
        assert!(!h.system.is_active(&reference("x")));
    }

    #[tokio::test]
    async fn test_ttl_reaps_and_next_call_gets_fresh_instance() {
        let h = harness(config());
        for expected in 1..=3 {
            assert_eq!(
                call(&h.system, reference("x"), "Increment").await,
                Ok(serde_json::json!(expected))
            );
        }

        h.clock.advance(Duration::from_millis(2_500));
        h.system.tick().await;
        wait_inactive(&h.system, &reference("x")).await;

        assert_eq!(h.reasons(), vec![DeactivationReason::TtlExpired]);
        assert!(h.directory.locate(&reference("x")).await.is_none());
        assert_eq!(call(&h.system, reference("x"), "Increment").await, Ok(serde_json::json!(1)));
    }

    #[tokio::test]
    async fn test_idle_within_ttl_survives_tick() {
        let h = harness(config());
        call(&h.system, reference("x"), "Increment").await.expect("ok");

        h.clock.advance(Duration::from_millis(900));
        h.system.tick().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(h.system.is_active(&reference("x")));
    }

    #[tokio::test]
    async fn test_lost_lease_deactivates_with_renewal_failure() {
        let config = RuntimeConfig::builder()
            .tick_rate(Duration::from_millis(100))
            .addressable_ttl(Duration::from_secs(600))
            .addressable_lease_duration(Duration::from_secs(10))
            .build()
            .expect("valid config");
        let h = harness(config);
        call(&h.system, reference("x"), "Increment").await.expect("ok");

        // Another node took over after an outage.
        h.directory.remove(&reference("x"), &NodeId::new("a", "default")).await;
        h.directory
            .acquire(&reference("x"), &NodeId::new("b", "default"))
            .await
            .expect("b takes over");
        h.clock.advance(Duration::from_secs(6));
        h.system.tick().await;
        wait_inactive(&h.system, &reference("x")).await;

        assert_eq!(h.reasons(), vec![DeactivationReason::LeaseRenewalFailed]);
        // Releasing on retirement must not touch b's lease.
        assert_eq!(
            h.directory.locate(&reference("x")).await,
            Some(NodeId::new("b", "default"))
        );
    }

    #[tokio::test]
    async fn test_requested_deactivation_happens_on_tick() {
        let h = harness(config());
        for _ in 0..100 {
            call(&h.system, reference("x"), "Increment").await.expect("ok");
        }

        h.system.tick().await;
        wait_inactive(&h.system, &reference("x")).await;

        assert_eq!(h.reasons(), vec![DeactivationReason::ExternallyTriggered]);
    }

    #[tokio::test]
    async fn test_stop_deactivates_everything_once() {
        let h = harness(config());
        for key in ["a", "b", "c", "d"] {
            call(&h.system, reference(key), "Increment").await.expect("ok");
        }

        h.system.stop().await;

        assert_eq!(h.system.active_count(), 0);
        assert_eq!(h.reasons(), vec![DeactivationReason::NodeShuttingDown; 4]);
        assert!(h.directory.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_activation_is_forced_out_after_timeout() {
        let h = harness(config());
        let (completion, _receiver) = oneshot::channel();
        h.system
            .handle_invocation(
                AddressableInvocation::new(reference("x"), "Hang", Value::Null),
                Some(completion),
                0,
            )
            .await;

        let started = tokio::time::Instant::now();
        h.system.stop().await;

        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(h.system.active_count(), 0);
        assert!(h.directory.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_bounded_when_the_queue_is_full() {
        let config = RuntimeConfig::builder()
            .tick_rate(Duration::from_millis(100))
            .deactivation_timeout(Duration::from_millis(200))
            .handle_queue_capacity(2)
            .build()
            .expect("valid config");
        let h = harness(config);
        let (completion, _hanging) = oneshot::channel();
        h.system
            .handle_invocation(
                AddressableInvocation::new(reference("x"), "Hang", Value::Null),
                Some(completion),
                0,
            )
            .await;
        // Let the worker pick up the hanging invocation.
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Fill the queue behind it until it refuses.
        let mut waiting = Vec::new();
        loop {
            let (completion, mut receiver) = oneshot::channel();
            h.system
                .handle_invocation(
                    AddressableInvocation::new(reference("x"), "Increment", Value::Null),
                    Some(completion),
                    0,
                )
                .await;
            match receiver.try_recv() {
                Ok(result) => {
                    assert!(
                        matches!(result, Err(InvocationError::Execution(ExecutionError::CapacityExceeded { .. }))),
                        "got {result:?}"
                    );
                    break;
                }
                Err(_) => waiting.push(receiver),
            }
            assert!(waiting.len() <= 4, "queue never filled");
        }

        tokio::time::timeout(Duration::from_secs(3), h.system.stop())
            .await
            .expect("stop finishes within the deactivation timeout");

        assert_eq!(h.system.active_count(), 0);
        assert!(h.directory.is_empty());
        assert!(h.system.leases().is_empty());
    }

    #[tokio::test]
    async fn test_panicking_method_frees_the_reference() {
        let h = harness(config());
        assert_eq!(call(&h.system, reference("x"), "Increment").await, Ok(serde_json::json!(1)));

        let result = call(&h.system, reference("x"), "Explode").await;

        assert!(
            matches!(
                &result,
                Err(InvocationError::Execution(ExecutionError::Panicked { message, .. })) if message == "kaboom"
            ),
            "got {result:?}"
        );
        assert!(!h.system.is_active(&reference("x")));
        assert!(h.directory.locate(&reference("x")).await.is_none());

        // Served by a fresh instance, not rerouted forever.
        assert_eq!(call(&h.system, reference("x"), "Increment").await, Ok(serde_json::json!(1)));

        tokio::time::timeout(Duration::from_secs(5), async {
            while h.errors.0.lock().expect("lock").is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("panic reported");
        let reported = h.errors.0.lock().expect("lock").clone();
        assert_eq!(
            reported,
            vec![(
                "activation Counter/x".to_string(),
                TaskError::Panicked("kaboom".to_string())
            )]
        );
    }

    async fn activation_during_drain(strategy: DeactivationStrategy) {
        let config = RuntimeConfig::builder()
            .tick_rate(Duration::from_millis(100))
            .deactivation_strategy(strategy)
            .build()
            .expect("valid config");
        let h = harness(config);
        call(&h.system, reference("slow-exit"), "Increment").await.expect("ok");

        let stopping = tokio::spawn({
            let system = h.system.clone();
            async move { system.stop().await }
        });
        h.draining.notified().await;
        // Arrives while the first batch is still deactivating.
        assert_eq!(call(&h.system, reference("late"), "Increment").await, Ok(serde_json::json!(1)));
        stopping.await.expect("stop");

        let mut log = h.log.lock().expect("lock").clone();
        log.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            log,
            vec![
                ("late".to_string(), DeactivationReason::NodeShuttingDown),
                ("slow-exit".to_string(), DeactivationReason::NodeShuttingDown),
            ],
            "{strategy:?}"
        );
        assert_eq!(h.system.active_count(), 0);
        assert!(h.directory.is_empty());
        assert!(h.system.leases().is_empty());
    }

    #[tokio::test]
    async fn test_drain_catches_late_activation_instant() {
        activation_during_drain(DeactivationStrategy::Instant).await;
    }

    #[tokio::test]
    async fn test_drain_catches_late_activation_concurrent() {
        activation_during_drain(DeactivationStrategy::Concurrent { max: 2 }).await;
    }

    #[tokio::test]
    async fn test_drain_catches_late_activation_rate_limited() {
        activation_during_drain(DeactivationStrategy::RateLimited { per_second: 20 }).await;
    }

    #[tokio::test]
    async fn test_drain_catches_late_activation_time_span() {
        activation_during_drain(DeactivationStrategy::TimeSpan { millis: 200 }).await;
    }

    #[tokio::test]
    async fn test_stale_retirement_keeps_the_successor_lease() {
        let h = harness(config());
        call(&h.system, reference("x"), "Increment").await.expect("ok");
        let first = h.system.handle(&reference("x")).expect("active");

        // Forced out, then replaced by a new activation.
        assert!(release(&h.system.inner.leases, &h.system.inner.handles, &reference("x"), first.id()).await);
        call(&h.system, reference("x"), "Increment").await.expect("ok");
        let second = h.system.handle(&reference("x")).expect("active");
        assert_ne!(first.id(), second.id());

        // The first activation's late retirement must not touch the second.
        assert!(!release(&h.system.inner.leases, &h.system.inner.handles, &reference("x"), first.id()).await);

        assert!(h.system.is_active(&reference("x")));
        assert_eq!(
            h.directory.locate(&reference("x")).await,
            Some(NodeId::new("a", "default"))
        );
        assert!(h.system.leases().cached(&reference("x")).await.is_some());
    }
}
