//! Out-of-process plugins
//!
//! A remote plugin appears to the engine as a [`ProxyPlugin`]: requests are
//! forwarded as [`Message`]s over a [`Connector`] and answered by a
//! `response` with the same id. The remote side talks back through the same
//! connector to emit events, subscribe to other plugins' events and call
//! other plugins. [`RemoteClient`] implements that side.
//!
//! ```text
//!  engine ──add_request──► ProxyPlugin ──request──►  connector  ──► RemoteClient
//!         ◄──emit/on/call── ProxyPlugin ◄─notification/listen/request── RemoteClient
//! ```
//!
//! Framing, handshakes and origin checks belong to concrete connectors;
//! [`ChannelConnector`] is an in-process pair built on tokio channels.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use plexus_api::{Action, Message, PluginError, Profile, Request, Value};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::context::PluginContext;
use crate::plugin::Plugin;

/// Receives every inbound message of a connector
pub type MessageCallback = Arc<dyn Fn(Message) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("transport failure: {0}")]
    Failed(String),
}

/// Bidirectional message pipe to a remote plugin
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn send(&self, message: Message) -> Result<(), TransportError>;

    /// Register a callback for inbound messages
    fn on(&self, callback: MessageCallback);
}

fn spawn_send<C: Connector>(connector: Arc<C>, message: Message) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(e) = connector.send(message).await {
                    tracing::warn!(error = %e, "Failed to send message");
                }
            });
        }
        Err(_) => tracing::warn!(key = %message.key, "No tokio runtime, message dropped"),
    }
}

// ============================================================================
// In-process connector
// ============================================================================

#[derive(Default)]
struct Inbox {
    callbacks: Vec<MessageCallback>,
    /// Messages received before the first callback was registered
    backlog: Vec<Message>,
}

/// One end of an in-process connector pair
///
/// Must be created inside a tokio runtime. Messages that arrive before a
/// callback is registered are held and replayed to the first callback.
pub struct ChannelConnector {
    tx: mpsc::UnboundedSender<Message>,
    inbox: Arc<Mutex<Inbox>>,
    task: JoinHandle<()>,
}

impl ChannelConnector {
    pub fn pair() -> (Self, Self) {
        let (to_left, left_rx) = mpsc::unbounded_channel();
        let (to_right, right_rx) = mpsc::unbounded_channel();
        (Self::spawn(to_right, left_rx), Self::spawn(to_left, right_rx))
    }

    fn spawn(tx: mpsc::UnboundedSender<Message>, mut rx: mpsc::UnboundedReceiver<Message>) -> Self {
        let inbox = Arc::new(Mutex::new(Inbox::default()));
        let receiver = Arc::clone(&inbox);
        let task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let callbacks = {
                    let mut inbox = receiver.lock().unwrap_or_else(PoisonError::into_inner);
                    if inbox.callbacks.is_empty() {
                        inbox.backlog.push(message);
                        continue;
                    }
                    inbox.callbacks.clone()
                };
                for callback in &callbacks {
                    callback(message.clone());
                }
            }
        });

        Self { tx, inbox, task }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn send(&self, message: Message) -> Result<(), TransportError> {
        self.tx.send(message).map_err(|_| TransportError::Closed)
    }

    fn on(&self, callback: MessageCallback) {
        let backlog = {
            let mut inbox = self.inbox.lock().unwrap_or_else(PoisonError::into_inner);
            inbox.callbacks.push(Arc::clone(&callback));
            std::mem::take(&mut inbox.backlog)
        };
        for message in backlog {
            callback(message);
        }
    }
}

impl Drop for ChannelConnector {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl fmt::Debug for ChannelConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelConnector")
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// Request correlation
// ============================================================================

type Reply = Result<Value, PluginError>;

#[derive(Default)]
struct Pending {
    waiters: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    next_id: AtomicU64,
}

impl Pending {
    fn waiters(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Reply>>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self) -> (u64, oneshot::Receiver<Reply>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.waiters().insert(id, tx);
        (id, rx)
    }

    fn resolve(&self, message: Message) {
        let Some(waiter) = self.waiters().remove(&message.id) else {
            tracing::debug!(id = message.id, "Response without a pending request");
            return;
        };
        let reply = match message.error {
            Some(error) => Err(error),
            None => Ok(message.payload.into_iter().next().unwrap_or(Value::Null)),
        };
        let _ = waiter.send(reply);
    }

    fn fail_all(&self, error: PluginError) {
        for (_, waiter) in self.waiters().drain() {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    async fn request<C: Connector>(
        &self,
        connector: &C,
        build: impl FnOnce(u64) -> Message,
    ) -> Reply {
        let (id, rx) = self.register();
        if let Err(e) = connector.send(build(id)).await {
            self.waiters().remove(&id);
            return Err(PluginError::system(e.to_string()));
        }
        rx.await
            .unwrap_or_else(|_| Err(PluginError::system("connection dropped before reply")))
    }
}

// ============================================================================
// Host side
// ============================================================================

#[derive(Default)]
struct ProxyState {
    pending: Pending,
    context: Mutex<Option<PluginContext>>,
}

impl ProxyState {
    fn context(&self) -> Option<PluginContext> {
        self.context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn handle<C: Connector>(&self, connector: &Weak<C>, message: Message) {
        match message.action {
            Action::Response => self.pending.resolve(message),
            Action::Notification => {
                let Some(ctx) = self.context() else {
                    tracing::debug!(event = %message.key, "Notification while inactive, dropped");
                    return;
                };
                if let Err(e) = ctx.emit(&message.key, message.payload) {
                    tracing::warn!(plugin = %ctx.name(), event = %message.key, error = %e, "Failed to re-emit notification");
                }
            }
            Action::Listen => {
                let Some(ctx) = self.context() else {
                    return;
                };
                let weak = connector.clone();
                let (emitter, event) = (message.name.clone(), message.key.clone());
                let subscribed = ctx.on(&message.name, &message.key, move |payload: &[Value]| {
                    if let Some(connector) = weak.upgrade() {
                        spawn_send(
                            connector,
                            Message::notification(emitter.clone(), event.clone(), payload.to_vec()),
                        );
                    }
                });
                if let Err(e) = subscribed {
                    tracing::warn!(emitter = %message.name, event = %message.key, error = %e, "Failed to subscribe");
                }
            }
            Action::Request => {
                let (Some(ctx), Some(connector)) = (self.context(), connector.upgrade()) else {
                    return;
                };
                let key = message.key.clone();
                let spawned = tokio::runtime::Handle::try_current().map(|handle| {
                    handle.spawn(async move {
                        let reply = match ctx.call(&message.name, &message.key, message.payload.clone()).await {
                            Ok(value) => Message::response_to(&message, value),
                            Err(e) => Message::error_to(&message, PluginError::user(e.to_string())),
                        };
                        if let Err(e) = connector.send(reply).await {
                            tracing::warn!(error = %e, "Failed to answer remote request");
                        }
                    })
                });
                if spawned.is_err() {
                    tracing::warn!(key = %key, "No tokio runtime, remote request dropped");
                }
            }
        }
    }
}

/// A [`Plugin`] implemented on the far side of a [`Connector`]
pub struct ProxyPlugin<C: Connector> {
    profile: Profile,
    connector: Arc<C>,
    state: Arc<ProxyState>,
}

impl<C: Connector> ProxyPlugin<C> {
    pub fn new(profile: Profile, connector: C) -> Self {
        let connector = Arc::new(connector);
        let state = Arc::new(ProxyState::default());

        let weak_state = Arc::downgrade(&state);
        let weak_connector = Arc::downgrade(&connector);
        connector.on(Arc::new(move |message: Message| {
            if let Some(state) = weak_state.upgrade() {
                state.handle(&weak_connector, message);
            }
        }));

        Self {
            profile,
            connector,
            state,
        }
    }

    pub fn connector(&self) -> &Arc<C> {
        &self.connector
    }
}

#[async_trait]
impl<C: Connector> Plugin for ProxyPlugin<C> {
    fn profile(&self) -> Profile {
        self.profile.clone()
    }

    async fn activate(&self, ctx: PluginContext) -> Result<(), PluginError> {
        *self.state.context.lock().unwrap_or_else(PoisonError::into_inner) = Some(ctx);
        Ok(())
    }

    async fn deactivate(&self) -> Result<(), PluginError> {
        self.state
            .context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.state.pending.fail_all(PluginError::system(format!(
            "{} was deactivated",
            self.profile.name
        )));
        Ok(())
    }

    async fn add_request(
        &self,
        request: Request,
        method: &str,
        payload: Vec<Value>,
    ) -> Result<Value, PluginError> {
        let name = self.profile.name.clone();
        self.state
            .pending
            .request(self.connector.as_ref(), |id| {
                Message::request(id, name, method, payload, request)
            })
            .await
    }
}

impl<C: Connector> fmt::Debug for ProxyPlugin<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyPlugin")
            .field("profile", &self.profile)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Remote side
// ============================================================================

type RemoteMethod = Arc<dyn Fn(Request, Vec<Value>) -> Result<Value, PluginError> + Send + Sync>;
type RemoteListener = Arc<dyn Fn(Vec<Value>) + Send + Sync>;

#[derive(Default)]
struct ClientState {
    methods: Mutex<HashMap<String, RemoteMethod>>,
    listeners: Mutex<HashMap<(String, String), RemoteListener>>,
    pending: Pending,
}

impl ClientState {
    fn handle<C: Connector>(&self, connector: &Weak<C>, message: Message) {
        match message.action {
            Action::Response => self.pending.resolve(message),
            Action::Notification => {
                let listener = self
                    .listeners
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&(message.name.clone(), message.key.clone()))
                    .cloned();
                if let Some(listener) = listener {
                    listener(message.payload);
                }
            }
            Action::Request => {
                let method = self
                    .methods
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&message.key)
                    .cloned();
                let reply = match method {
                    Some(method) => {
                        let request = message
                            .request_info
                            .clone()
                            .unwrap_or_else(|| Request::new(""));
                        match method(request, message.payload.clone()) {
                            Ok(value) => Message::response_to(&message, value),
                            Err(e) => Message::error_to(&message, e),
                        }
                    }
                    None => Message::error_to(
                        &message,
                        PluginError::user(format!("unknown method: {}", message.key)),
                    ),
                };
                if let Some(connector) = connector.upgrade() {
                    spawn_send(connector, reply);
                }
            }
            Action::Listen => {
                tracing::debug!(event = %message.key, "Listen sent to remote client, ignored");
            }
        }
    }
}

/// Remote end of a [`ProxyPlugin`]
pub struct RemoteClient<C: Connector> {
    name: String,
    connector: Arc<C>,
    state: Arc<ClientState>,
}

impl<C: Connector> RemoteClient<C> {
    pub fn new(name: impl Into<String>, connector: C) -> Self {
        let connector = Arc::new(connector);
        let state = Arc::new(ClientState::default());

        let weak_state = Arc::downgrade(&state);
        let weak_connector = Arc::downgrade(&connector);
        connector.on(Arc::new(move |message: Message| {
            if let Some(state) = weak_state.upgrade() {
                state.handle(&weak_connector, message);
            }
        }));

        Self {
            name: name.into(),
            connector,
            state,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Answer requests for `method`
    pub fn expose<F>(&self, method: impl Into<String>, handler: F) -> &Self
    where
        F: Fn(Request, Vec<Value>) -> Result<Value, PluginError> + Send + Sync + 'static,
    {
        self.state
            .methods
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(method.into(), Arc::new(handler));
        self
    }

    /// Emit `event` through the host-side proxy
    pub async fn emit(&self, event: &str, payload: Vec<Value>) -> Result<(), TransportError> {
        self.connector
            .send(Message::notification(self.name.clone(), event, payload))
            .await
    }

    /// Subscribe to `event` emitted by `emitter` on the host
    pub async fn listen<F>(&self, emitter: &str, event: &str, callback: F) -> Result<(), TransportError>
    where
        F: Fn(Vec<Value>) + Send + Sync + 'static,
    {
        self.state
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((emitter.to_string(), event.to_string()), Arc::new(callback));

        let mut message = Message::notification(emitter, event, Vec::new());
        message.action = Action::Listen;
        self.connector.send(message).await
    }

    /// Call `target.method` on the host as the proxied plugin
    pub async fn call(
        &self,
        target: &str,
        method: &str,
        payload: Vec<Value>,
    ) -> Result<Value, PluginError> {
        let caller = Request::new(self.name.clone());
        self.state
            .pending
            .request(self.connector.as_ref(), |id| {
                Message::request(id, target, method, payload, caller)
            })
            .await
    }
}

impl<C: Connector> fmt::Debug for RemoteClient<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteClient")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
