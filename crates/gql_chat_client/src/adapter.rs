//! Callback-style subscriptions over a shared transport.
//!
//! [`SubscriptionAdapter::subscribe`] opens one logical subscription and returns
//! a [`SubscriptionHandle`] that stops only that subscription.
//! [`SubscriptionAdapter::close`] tears down the shared connection, after which
//! every handle is inert and queued events are discarded.
//!
//! Each subscription gets its own dispatch task fed by an unbounded FIFO queue.
//! Events for one subscription reach the callbacks in transport order; a slow
//! callback only delays its own subscription. Callbacks run on the Tokio
//! runtime and should not block.

use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::catalog::QueryDescriptor;
use crate::transport::{OperationId, SubscriptionError, SubscriptionTransport, TransportEvent};

/// Invoked once per event, with the payload exactly as the server sent it.
pub type DataCallback = Box<dyn FnMut(Value) + Send + 'static>;

/// Invoked once per failure.
pub type ErrorCallback = Box<dyn FnMut(SubscriptionError) + Send + 'static>;

/// Variables and callbacks for one `subscribe` call. Every field is optional.
#[derive(Default)]
pub struct SubscribeOptions {
    variables: Option<Map<String, Value>>,
    data: Option<DataCallback>,
    error: Option<ErrorCallback>,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn variables(mut self, variables: Map<String, Value>) -> Self {
        self.variables = Some(variables);
        self
    }

    /// Adds one variable.
    pub fn variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables
            .get_or_insert_with(Map::new)
            .insert(name.into(), value.into());
        self
    }

    pub fn data(mut self, callback: impl FnMut(Value) + Send + 'static) -> Self {
        self.data = Some(Box::new(callback));
        self
    }

    pub fn error(mut self, callback: impl FnMut(SubscriptionError) + Send + 'static) -> Self {
        self.error = Some(Box::new(callback));
        self
    }
}

/// Callback facade over a [`SubscriptionTransport`]. Clones share the
/// transport and the closed state.
#[derive(Clone)]
pub struct SubscriptionAdapter {
    transport: Arc<dyn SubscriptionTransport>,
    runtime: Handle,
    closed: Arc<AtomicBool>,
}

impl SubscriptionAdapter {
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime; use
    /// [`SubscriptionAdapter::with_runtime`] there.
    pub fn new(transport: Arc<dyn SubscriptionTransport>) -> Self {
        Self::with_runtime(transport, Handle::current())
    }

    pub fn with_runtime(transport: Arc<dyn SubscriptionTransport>, runtime: Handle) -> Self {
        Self {
            transport,
            runtime,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Opens one subscription and returns immediately. Never fails: transport
    /// problems arrive through the `error` callback, or are dropped when there
    /// is none. After [`SubscriptionAdapter::close`] the returned handle is
    /// already inert.
    pub fn subscribe(
        &self,
        query: &QueryDescriptor,
        options: SubscribeOptions,
    ) -> SubscriptionHandle {
        let SubscribeOptions {
            variables,
            data,
            error,
        } = options;
        let cancelled = Arc::new(AtomicBool::new(false));
        let (sink, events) = mpsc::unbounded_channel();

        // Spawned even without callbacks: the task also marks the handle
        // finished when the transport ends the operation.
        self.runtime.spawn(dispatch(
            events,
            data,
            error,
            cancelled.clone(),
            self.closed.clone(),
        ));

        let id = self.transport.open(query.to_payload(variables), sink);
        SubscriptionHandle {
            id,
            cancelled,
            closed: self.closed.clone(),
            transport: self.transport.clone(),
        }
    }

    /// Closes the shared connection. Every subscription opened through it,
    /// including ones opened by other adapters on the same transport, ends.
    /// Repeat calls are no-ops.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.transport.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.transport.is_closed()
    }
}

/// Cancellation handle for one subscription. Dropping it does not unsubscribe.
#[derive(Clone)]
pub struct SubscriptionHandle {
    id: OperationId,
    cancelled: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    transport: Arc<dyn SubscriptionTransport>,
}

impl SubscriptionHandle {
    /// Stops this subscription only. Events not yet dispatched are discarded;
    /// on a multi-thread runtime one callback that was already being started
    /// may still run. Only the first call reaches the transport.
    pub fn unsubscribe(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        if !self.closed.load(Ordering::SeqCst) {
            self.transport.stop(self.id);
        }
    }

    /// False once unsubscribed, completed by the server, or closed.
    pub fn is_active(&self) -> bool {
        !self.cancelled.load(Ordering::SeqCst)
            && !self.closed.load(Ordering::SeqCst)
            && !self.transport.is_closed()
    }

    pub fn id(&self) -> OperationId {
        self.id
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

async fn dispatch(
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    mut data: Option<DataCallback>,
    mut error: Option<ErrorCallback>,
    cancelled: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
) {
    while let Some(event) = events.recv().await {
        if cancelled.load(Ordering::SeqCst) || closed.load(Ordering::SeqCst) {
            break;
        }
        match event {
            TransportEvent::Data(payload) => {
                if let Some(callback) = data.as_mut() {
                    callback(payload);
                }
            }
            TransportEvent::Error(err) => {
                if let Some(callback) = error.as_mut() {
                    callback(err);
                }
            }
            TransportEvent::Complete => break,
        }
    }
    // The operation is over on the transport side too; a later unsubscribe
    // has nothing to stop.
    cancelled.store(true, Ordering::SeqCst);
}
