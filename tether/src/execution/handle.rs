//! The serialization boundary around one activation.
//!
//! Every activation owns a bounded event queue and a single worker task.
//! Activation, invocations and deactivation all go through that one queue,
//! so they are processed one at a time in submission order:
//!
//! ```text
//! activate ─┐
//! invoke  ──┼─▶ [ bounded FIFO ] ─▶ worker ─▶ addressable
//! invoke  ──┤
//! deactivate┘   (terminal: later invokes are rerouted)
//! ```

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot, watch};

use crate::addressable::{Addressable, AddressableContext, AddressableInvocation, AddressableReference, DispatchTable};
use crate::cluster::NodeId;
use crate::error::{ExecutionError, InvocationError};
use crate::execution::{DeactivationReason, HandleState};
use crate::pipeline::{Completion, PipelineHandle};
use crate::task::{panic_message, TaskError, TaskSupervisor};
use crate::time::{Clock, Timestamp};

pub(crate) enum HandleEvent {
    Activate {
        completion: oneshot::Sender<Result<(), InvocationError>>,
    },
    Invoke {
        invocation: AddressableInvocation,
        completion: Option<Completion>,
        attempts: u32,
    },
    Deactivate {
        reason: DeactivationReason,
    },
}

/// Told when an activation stops owning its reference.
#[async_trait]
pub(crate) trait HandleObserver: Send + Sync {
    /// Runs on the worker after the deactivate hook and before queued
    /// invocations are rerouted.
    async fn retired(&self, reference: &AddressableReference, handle_id: u64);
}

/// What a new handle needs from its hosting node.
pub(crate) struct HandleEnv {
    pub handle_id: u64,
    pub supervisor: TaskSupervisor,
    pub node_id: NodeId,
    pub clock: Arc<dyn Clock>,
    pub capacity: usize,
    pub pipeline: PipelineHandle,
    pub observer: Arc<dyn HandleObserver>,
}

/// An invocation the queue refused, handed back to the caller.
pub(crate) struct RejectedInvoke {
    /// `true` if the handle is gone, `false` if its queue is full.
    pub closed: bool,
    pub invocation: AddressableInvocation,
    pub completion: Option<Completion>,
    pub attempts: u32,
}

struct HandleShared {
    state: AtomicU8,
    last_activity: AtomicU64,
    deactivation_requested: Arc<AtomicBool>,
    deactivation_started: AtomicBool,
    finished: watch::Sender<bool>,
}

impl HandleShared {
    fn state(&self) -> HandleState {
        HandleState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn advance(&self, next: HandleState) -> Result<(), ExecutionError> {
        let mut current = self.state();
        loop {
            if !current.can_transition_to(next) {
                return Err(ExecutionError::InvalidStateTransition { from: current, to: next });
            }
            match self.state.compare_exchange(
                current as u8,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = HandleState::from_u8(actual),
            }
        }
    }

    fn touch(&self, now: Timestamp) {
        self.last_activity.fetch_max(now.as_millis(), Ordering::AcqRel);
    }

    fn finish(&self) {
        self.state.store(HandleState::Deactivated as u8, Ordering::Release);
        self.finished.send_replace(true);
    }
}

/// Client side of one activation: enqueues events for its worker.
///
/// Cheap to clone; all clones feed the same queue.
#[derive(Clone)]
pub struct ExecutionHandle {
    id: u64,
    reference: AddressableReference,
    created_at: Timestamp,
    capacity: usize,
    events: mpsc::Sender<HandleEvent>,
    shared: Arc<HandleShared>,
}

impl ExecutionHandle {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub fn reference(&self) -> &AddressableReference {
        &self.reference
    }

    /// When this activation was created.
    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn state(&self) -> HandleState {
        self.shared.state()
    }

    /// Start time of the most recently dequeued invocation.
    pub fn last_activity(&self) -> Timestamp {
        Timestamp::from_millis(self.shared.last_activity.load(Ordering::Acquire))
    }

    /// Whether the addressable asked to be deactivated.
    pub fn deactivation_requested(&self) -> bool {
        self.shared.deactivation_requested.load(Ordering::Acquire)
    }

    /// Whether a deactivate event has been enqueued.
    pub fn deactivation_started(&self) -> bool {
        self.shared.deactivation_started.load(Ordering::Acquire)
    }

    /// Enqueue the activation event. Must be the first event of the queue.
    pub(crate) fn activate(&self) -> Result<oneshot::Receiver<Result<(), InvocationError>>, ExecutionError> {
        let (completion, receiver) = oneshot::channel();
        self.events
            .try_send(HandleEvent::Activate { completion })
            .map_err(|_| ExecutionError::CapacityExceeded {
                reference: self.reference.clone(),
                capacity: self.capacity,
            })?;
        Ok(receiver)
    }

    /// Enqueue an invocation without waiting for queue space.
    pub(crate) fn invoke(
        &self,
        invocation: AddressableInvocation,
        completion: Option<Completion>,
        attempts: u32,
    ) -> Result<(), RejectedInvoke> {
        let event = HandleEvent::Invoke {
            invocation,
            completion,
            attempts,
        };
        let (closed, event) = match self.events.try_send(event) {
            Ok(()) => return Ok(()),
            Err(mpsc::error::TrySendError::Full(event)) => (false, event),
            Err(mpsc::error::TrySendError::Closed(event)) => (true, event),
        };
        match event {
            HandleEvent::Invoke {
                invocation,
                completion,
                attempts,
            } => Err(RejectedInvoke {
                closed,
                invocation,
                completion,
                attempts,
            }),
            // Never built above; the queue hands back what it was given.
            HandleEvent::Activate { .. } | HandleEvent::Deactivate { .. } => Ok(()),
        }
    }

    /// Enqueue the terminal deactivate event.
    ///
    /// Only the first call enqueues; it returns `false` for every later
    /// call, so an activation is deactivated at most once.
    pub async fn deactivate(&self, reason: DeactivationReason) -> bool {
        if self.shared.deactivation_started.swap(true, Ordering::AcqRel) {
            return false;
        }
        tracing::debug!(reference = %self.reference, reason = ?reason, "deactivation requested");
        self.events.send(HandleEvent::Deactivate { reason }).await.is_ok()
    }

    /// Resolves once the worker has finished.
    pub async fn wait_deactivated(&self) {
        let mut finished = self.shared.finished.subscribe();
        // The sender lives in `shared`, which `self` keeps alive.
        let _ = finished.wait_for(|done| *done).await;
    }

    pub fn is_deactivated(&self) -> bool {
        *self.shared.finished.borrow()
    }
}

impl fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("id", &self.id)
            .field("reference", &self.reference)
            .field("state", &self.state())
            .field("created_at", &self.created_at)
            .field("last_activity", &self.last_activity())
            .finish()
    }
}

/// Create the activation's queue and start its worker.
///
/// The worker runs under the node's [`TaskSupervisor`], so a panicking
/// addressable is reported to the node's error handler.
pub(crate) fn spawn_handle<A: Addressable>(
    addressable: A,
    table: Arc<DispatchTable<A>>,
    reference: AddressableReference,
    env: HandleEnv,
) -> ExecutionHandle {
    let now = env.clock.now();
    let (events, receiver) = mpsc::channel(env.capacity);
    let (finished, _) = watch::channel(false);
    let deactivation_requested = Arc::new(AtomicBool::new(false));

    let shared = Arc::new(HandleShared {
        state: AtomicU8::new(HandleState::Created as u8),
        last_activity: AtomicU64::new(now.as_millis()),
        deactivation_requested: deactivation_requested.clone(),
        deactivation_started: AtomicBool::new(false),
        finished,
    });

    let ctx = AddressableContext::new(
        reference.clone(),
        env.node_id.clone(),
        now,
        deactivation_requested,
        env.pipeline.clone(),
    );

    let handle = ExecutionHandle {
        id: env.handle_id,
        reference: reference.clone(),
        created_at: now,
        capacity: env.capacity,
        events,
        shared: shared.clone(),
    };

    let supervisor = env.supervisor.clone();
    let worker = Worker {
        table,
        ctx,
        shared,
        events: receiver,
        env,
    };
    supervisor.spawn_task(&format!("activation {reference}"), worker.run(addressable));
    handle
}

struct Worker<A: Addressable> {
    table: Arc<DispatchTable<A>>,
    ctx: AddressableContext,
    shared: Arc<HandleShared>,
    events: mpsc::Receiver<HandleEvent>,
    env: HandleEnv,
}

impl<A: Addressable> Worker<A> {
    fn reference(&self) -> &AddressableReference {
        self.ctx.reference()
    }

    fn panicked(&self, payload: &(dyn Any + Send)) -> (ExecutionError, TaskError) {
        let message = panic_message(payload);
        tracing::error!(reference = %self.reference(), "addressable panicked: {}", message);
        let error = ExecutionError::Panicked {
            reference: self.reference().clone(),
            message: message.clone(),
        };
        (error, TaskError::Panicked(message))
    }

    async fn run(mut self, mut addressable: A) -> Result<(), TaskError> {
        while let Some(event) = self.events.recv().await {
            match event {
                HandleEvent::Activate { completion } => {
                    if let Err(e) = self.shared.advance(HandleState::Activating) {
                        tracing::warn!(reference = %self.reference(), "ignoring activation: {}", e);
                        let _ = completion.send(Err(e.into()));
                        continue;
                    }

                    let activated = AssertUnwindSafe(addressable.on_activate(&self.ctx))
                        .catch_unwind()
                        .await;
                    let (failure, outcome) = match activated {
                        Ok(Ok(())) => {
                            let _ = self.shared.advance(HandleState::Ready);
                            tracing::info!(reference = %self.reference(), node = %self.env.node_id, "addressable activated");
                            let _ = completion.send(Ok(()));
                            continue;
                        }
                        Ok(Err(error)) => {
                            tracing::warn!(reference = %self.reference(), "activation failed: {}", error);
                            let failure = ExecutionError::ActivationFailed {
                                reference: self.reference().clone(),
                                error,
                            };
                            (failure, Ok(()))
                        }
                        Err(payload) => {
                            let (failure, report) = self.panicked(payload.as_ref());
                            (failure, Err(report))
                        }
                    };

                    self.fail_remaining(&failure).await;
                    let _ = completion.send(Err(failure.into()));
                    return outcome;
                }

                HandleEvent::Invoke {
                    invocation,
                    completion,
                    ..
                } => {
                    // Activity is measured from the start of processing, not from enqueue.
                    self.shared.touch(self.env.clock.now());

                    let result = if self.shared.state().can_process_invocations() {
                        let dispatched = AssertUnwindSafe(self.table.dispatch(
                            &mut addressable,
                            &invocation.method,
                            invocation.args,
                            &self.ctx,
                        ))
                        .catch_unwind()
                        .await;
                        match dispatched {
                            Ok(result) => result,
                            Err(payload) => {
                                // The instance may be half-updated; it does not serve again.
                                let (error, report) = self.panicked(payload.as_ref());
                                self.retire().await;
                                if let Some(completion) = completion {
                                    let _ = completion.send(Err(error.into()));
                                }
                                return Err(report);
                            }
                        }
                    } else {
                        Err(ExecutionError::NoActiveAddressable {
                            reference: self.reference().clone(),
                        }
                        .into())
                    };

                    if let Err(error) = &result {
                        tracing::debug!(
                            reference = %self.reference(),
                            method = %invocation.method,
                            "invocation failed: {}",
                            error
                        );
                    }
                    if let Some(completion) = completion {
                        let _ = completion.send(result);
                    }
                }

                HandleEvent::Deactivate { reason } => {
                    if let Err(e) = self.shared.advance(HandleState::Deactivating) {
                        tracing::warn!(reference = %self.reference(), "{}", e);
                    }
                    tracing::info!(reference = %self.reference(), reason = ?reason, "deactivating addressable");

                    let hook = AssertUnwindSafe(addressable.on_deactivate(&self.ctx, reason))
                        .catch_unwind()
                        .await;
                    let outcome = match hook {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(error)) => {
                            tracing::warn!(
                                reference = %self.reference(),
                                reason = ?reason,
                                "deactivate hook failed: {}",
                                error
                            );
                            Ok(())
                        }
                        Err(payload) => Err(self.panicked(payload.as_ref()).1),
                    };

                    self.retire().await;
                    tracing::info!(reference = %self.reference(), reason = ?reason, "addressable deactivated");
                    return outcome;
                }
            }
        }

        // Every sender was dropped without a deactivate event.
        tracing::debug!(reference = %self.reference(), "event queue dropped, worker exiting");
        self.retire().await;
        Ok(())
    }

    /// Give up the reference, then reroute whatever is still queued.
    async fn retire(&mut self) {
        let reference = self.reference().clone();
        let _ = self.shared.advance(HandleState::Deactivating);
        self.shared.deactivation_started.store(true, Ordering::Release);
        self.env.observer.retired(&reference, self.env.handle_id).await;

        self.events.close();
        let mut rerouted = 0usize;
        while let Ok(queued) = self.events.try_recv() {
            match queued {
                HandleEvent::Invoke {
                    invocation,
                    completion,
                    attempts,
                } => {
                    rerouted += 1;
                    self.env.pipeline.reroute(invocation, completion, attempts + 1).await;
                }
                HandleEvent::Activate { completion } => {
                    let _ = completion.send(Err(ExecutionError::NoActiveAddressable {
                        reference: reference.clone(),
                    }
                    .into()));
                }
                HandleEvent::Deactivate { .. } => {}
            }
        }
        if rerouted > 0 {
            tracing::warn!(reference = %reference, rerouted, "rerouted invocations queued behind deactivation");
        }

        let _ = self.shared.advance(HandleState::Deactivated);
        self.shared.finish();
    }

    /// Activation never completed: fail everything queued with `failure`.
    async fn fail_remaining(&mut self, failure: &ExecutionError) {
        let reference = self.reference().clone();
        let _ = self.shared.advance(HandleState::Deactivating);
        self.shared.deactivation_started.store(true, Ordering::Release);
        self.env.observer.retired(&reference, self.env.handle_id).await;

        self.events.close();
        while let Ok(queued) = self.events.try_recv() {
            fail_event(queued, failure);
        }
        self.shared.finish();
    }
}

fn fail_event(event: HandleEvent, failure: &ExecutionError) {
    match event {
        HandleEvent::Invoke {
            completion: Some(completion),
            ..
        } => {
            let _ = completion.send(Err(failure.clone().into()));
        }
        HandleEvent::Activate { completion } => {
            let _ = completion.send(Err(failure.clone().into()));
        }
        HandleEvent::Invoke { completion: None, .. } | HandleEvent::Deactivate { .. } => {}
    }
}
