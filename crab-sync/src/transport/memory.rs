// crab-sync/src/transport/memory.rs
// 内存传输 - 同进程内的可编排远程服务 (tests, demos, embedding)

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::{
    CallbackResult, Connection, ConnectionEvents, ConnectRequest, DisconnectCallback,
    ResultCallback, SubscribeCallbacks, Subscription, Transport,
};
use crate::error::{RemoteError, SyncError, TransportError};

const ENDPOINT_SCHEMES: [&str; 5] = ["ws://", "wss://", "http://", "https://", "memory://"];

/// How the service answers a new session's handshake
#[derive(Debug, Clone, Default)]
pub enum Handshake {
    /// Report success immediately
    #[default]
    Accept,
    /// Drop the session with this error
    Refuse(TransportError),
    /// Signal a forced reconnect (version renegotiation), then succeed
    ForcedReconnectThenAccept,
    /// Never answer; the connect timeout cuts the attempt off
    Stall,
}

type MethodHandler = Arc<dyn Fn(&[Value]) -> Result<Value, RemoteError> + Send + Sync>;
type PublicationHandler = Arc<dyn Fn(&[Value]) -> Result<(), RemoteError> + Send + Sync>;

#[derive(Clone)]
enum MethodBehavior {
    Reply(MethodHandler),
    Hang,
    Disconnect(Option<TransportError>),
}

#[derive(Clone)]
enum PublicationBehavior {
    Reply(PublicationHandler),
    Hang,
}

enum SessionEvent {
    Apply {
        name: String,
        args: Vec<Value>,
        callback: ResultCallback,
    },
    Subscribe {
        id: String,
        name: String,
        args: Vec<Value>,
        callbacks: SubscribeCallbacks,
    },
    Unsubscribe {
        id: String,
    },
    FailSubscriptions {
        name: String,
        error: RemoteError,
        done: oneshot::Sender<()>,
    },
    Disconnect {
        error: Option<TransportError>,
        done: oneshot::Sender<()>,
    },
    ForceReconnect {
        done: oneshot::Sender<()>,
    },
    CountSubscriptions {
        reply: oneshot::Sender<usize>,
    },
    Flush {
        done: oneshot::Sender<()>,
    },
    Close,
}

/// State shared between the service handle and its session tasks
#[derive(Default)]
struct Registry {
    methods: RwLock<HashMap<String, MethodBehavior>>,
    publications: RwLock<HashMap<String, PublicationBehavior>>,
    sessions: Mutex<Vec<mpsc::UnboundedSender<SessionEvent>>>,
    connect_requests: Mutex<Vec<ConnectRequest>>,
    unhandled: Mutex<Vec<SyncError>>,
    calls_received: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Registry {
    fn method(&self, name: &str) -> Option<MethodBehavior> {
        let methods = self.methods.read().unwrap_or_else(|p| p.into_inner());
        methods.get(name).cloned()
    }

    fn publication(&self, name: &str) -> Option<PublicationBehavior> {
        let publications = self.publications.read().unwrap_or_else(|p| p.into_inner());
        publications.get(name).cloned()
    }

    /// Surface an error raised by a callback; the event loop keeps running
    fn raise(&self, result: CallbackResult) {
        if let Err(e) = result {
            tracing::error!("Unhandled error raised by callback: {}", e);
            lock(&self.unhandled).push(e);
        }
    }

    fn live_sessions(&self) -> Vec<mpsc::UnboundedSender<SessionEvent>> {
        let mut sessions = lock(&self.sessions);
        sessions.retain(|tx| !tx.is_closed());
        sessions.clone()
    }
}

/// Dedicated thread running the tokio runtime that drives every session
#[derive(Debug)]
struct RuntimeThread {
    handle: tokio::runtime::Handle,
    shutdown_tx: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl RuntimeThread {
    fn start() -> std::io::Result<Self> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let (handle_tx, handle_rx) = oneshot::channel::<std::io::Result<tokio::runtime::Handle>>();

        let thread = thread::Builder::new()
            .name("crab-sync-memory".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(2)
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = handle_tx.send(Err(e));
                        return;
                    }
                };

                if handle_tx.send(Ok(runtime.handle().clone())).is_err() {
                    return;
                }

                // Keep sessions running until the service goes away
                runtime.block_on(async move {
                    let _ = shutdown_rx.recv().await;
                });
            })?;

        let handle = handle_rx.blocking_recv().map_err(|_| {
            std::io::Error::other("memory runtime thread exited before reporting its handle")
        })??;

        Ok(Self {
            handle,
            shutdown_tx: Some(shutdown_tx),
            thread: Some(thread),
        })
    }
}

impl Drop for RuntimeThread {
    fn drop(&mut self) {
        self.shutdown_tx.take();
        if let Some(thread) = self.thread.take()
            && thread.thread().id() != thread::current().id()
        {
            let _ = thread.join();
        }
    }
}

/// In-process remote service
///
/// A scriptable stand-in for a real server: register methods and
/// publications, pick how the handshake goes, then drive disconnects and
/// late subscription failures from the test thread. Every session gets a
/// single event task, so callbacks for one connection never overlap.
///
/// Control methods (`disconnect`, `force_reconnect`, `fail_subscriptions`,
/// `flush`, `live_subscriptions`) block until the sessions processed the event and
/// must not be called from inside an async runtime.
#[derive(Clone)]
pub struct MemoryService {
    registry: Arc<Registry>,
    runtime: Arc<RuntimeThread>,
    handshake: Arc<Mutex<Handshake>>,
}

impl std::fmt::Debug for MemoryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryService")
            .field("handshake", &*lock(&self.handshake))
            .field("sessions", &lock(&self.registry.sessions).len())
            .finish_non_exhaustive()
    }
}

impl MemoryService {
    /// Start the service's runtime thread
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            registry: Arc::new(Registry::default()),
            runtime: Arc::new(RuntimeThread::start()?),
            handshake: Arc::new(Mutex::new(Handshake::Accept)),
        })
    }

    /// Handshake behaviour for sessions opened from now on
    pub fn with_handshake(self, handshake: Handshake) -> Self {
        *lock(&self.handshake) = handshake;
        self
    }

    /// Register a method that replies with the handler's outcome
    pub fn method<F>(&self, name: impl Into<String>, handler: F) -> &Self
    where
        F: Fn(&[Value]) -> Result<Value, RemoteError> + Send + Sync + 'static,
    {
        self.set_method(name.into(), MethodBehavior::Reply(Arc::new(handler)))
    }

    /// Register a method that never replies
    pub fn hang_method(&self, name: impl Into<String>) -> &Self {
        self.set_method(name.into(), MethodBehavior::Hang)
    }

    /// Register a method that drops the session instead of replying
    pub fn disconnect_on(&self, name: impl Into<String>, error: Option<TransportError>) -> &Self {
        self.set_method(name.into(), MethodBehavior::Disconnect(error))
    }

    fn set_method(&self, name: String, behavior: MethodBehavior) -> &Self {
        let mut methods = self.registry.methods.write().unwrap_or_else(|p| p.into_inner());
        methods.insert(name, behavior);
        self
    }

    /// Register a publication; `Ok` marks it ready, `Err` fails it
    pub fn publish<F>(&self, name: impl Into<String>, handler: F) -> &Self
    where
        F: Fn(&[Value]) -> Result<(), RemoteError> + Send + Sync + 'static,
    {
        self.set_publication(name.into(), PublicationBehavior::Reply(Arc::new(handler)))
    }

    /// Register a publication that never becomes ready on its own
    pub fn hang_publication(&self, name: impl Into<String>) -> &Self {
        self.set_publication(name.into(), PublicationBehavior::Hang)
    }

    fn set_publication(&self, name: String, behavior: PublicationBehavior) -> &Self {
        let mut publications = self
            .registry
            .publications
            .write()
            .unwrap_or_else(|p| p.into_inner());
        publications.insert(name, behavior);
        self
    }

    /// Drop every live session, reporting `error` (or a clean disconnect)
    pub fn disconnect(&self, error: Option<TransportError>) {
        self.broadcast(|done| SessionEvent::Disconnect {
            error: error.clone(),
            done,
        });
    }

    /// Emit a forced-reconnect disconnect on every live session
    pub fn force_reconnect(&self) {
        self.broadcast(|done| SessionEvent::ForceReconnect { done });
    }

    /// Fail every subscription to `name`, ready or not
    pub fn fail_subscriptions(&self, name: &str, error: RemoteError) {
        self.broadcast(|done| SessionEvent::FailSubscriptions {
            name: name.to_string(),
            error: error.clone(),
            done,
        });
    }

    /// Wait until every live session has processed the events queued so far
    pub fn flush(&self) {
        self.broadcast(|done| SessionEvent::Flush { done });
    }

    /// Number of subscriptions still registered across live sessions
    pub fn live_subscriptions(&self) -> usize {
        self.registry
            .live_sessions()
            .into_iter()
            .filter_map(|tx| {
                let (reply, rx) = oneshot::channel();
                tx.send(SessionEvent::CountSubscriptions { reply }).ok()?;
                rx.blocking_recv().ok()
            })
            .sum()
    }

    fn broadcast<F>(&self, make: F)
    where
        F: Fn(oneshot::Sender<()>) -> SessionEvent,
    {
        let pending: Vec<_> = self
            .registry
            .live_sessions()
            .into_iter()
            .filter_map(|tx| {
                let (done, rx) = oneshot::channel();
                tx.send(make(done)).ok().map(|_| rx)
            })
            .collect();

        for rx in pending {
            // A session that ends first drops `done`; it has still processed the event
            let _ = rx.blocking_recv();
        }
    }

    /// Every connect request received so far
    pub fn connect_requests(&self) -> Vec<ConnectRequest> {
        lock(&self.registry.connect_requests).clone()
    }

    /// Number of method calls handed to any connection
    pub fn calls_received(&self) -> usize {
        self.registry.calls_received.load(Ordering::SeqCst)
    }

    /// Drain the errors callbacks raised into the event loop
    pub fn take_unhandled(&self) -> Vec<SyncError> {
        std::mem::take(&mut *lock(&self.registry.unhandled))
    }
}

impl Transport for MemoryService {
    fn connect(
        &self,
        request: ConnectRequest,
        events: ConnectionEvents,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        if !ENDPOINT_SCHEMES
            .iter()
            .any(|scheme| request.endpoint.starts_with(scheme))
        {
            return Err(TransportError::new(format!(
                "Invalid endpoint: {}",
                request.endpoint
            )));
        }

        let session_id = Uuid::new_v4();
        let handshake = lock(&self.handshake).clone();
        tracing::debug!("Opening memory session {} to {}", session_id, request.endpoint);

        lock(&self.registry.connect_requests).push(request.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.registry.sessions).push(tx.clone());

        let session = Session {
            id: session_id,
            registry: self.registry.clone(),
            on_disconnect: events.on_disconnect,
            alive: true,
            subscriptions: HashMap::new(),
        };
        self.runtime
            .handle
            .spawn(session.run(request, handshake, events.on_connected, rx));

        Ok(Arc::new(MemoryConnection {
            session_id,
            tx,
            registry: self.registry.clone(),
            _runtime: self.runtime.clone(),
        }))
    }
}

struct PendingSubscription {
    name: String,
    on_ready: Option<Box<dyn FnOnce() -> CallbackResult + Send>>,
    on_error: Box<dyn FnOnce(RemoteError) -> CallbackResult + Send>,
}

struct Session {
    id: Uuid,
    registry: Arc<Registry>,
    on_disconnect: DisconnectCallback,
    alive: bool,
    subscriptions: HashMap<String, PendingSubscription>,
}

impl Session {
    async fn run(
        mut self,
        request: ConnectRequest,
        handshake: Handshake,
        on_connected: super::ConnectedCallback,
        mut rx: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        match handshake {
            Handshake::Accept => self.registry.raise(on_connected()),
            Handshake::Refuse(error) => self.drop_session(Some(error)),
            Handshake::ForcedReconnectThenAccept => {
                self.registry.raise((self.on_disconnect)(Some(
                    TransportError::forced_reconnect("protocol version mismatch"),
                )));
                self.registry.raise(on_connected());
            }
            Handshake::Stall => {
                let timeout = request.options.connect_timeout;
                let deadline = tokio::time::sleep(timeout);
                tokio::pin!(deadline);
                loop {
                    tokio::select! {
                        _ = &mut deadline => {
                            if request.options.retry {
                                tracing::debug!("Session {} connect timed out, retrying", self.id);
                                deadline.as_mut().reset(tokio::time::Instant::now() + timeout);
                                continue;
                            }
                            self.drop_session(Some(TransportError::connect_timeout(timeout)));
                            break;
                        }
                        event = rx.recv() => match event {
                            Some(SessionEvent::Disconnect { error, done }) => {
                                self.drop_session(error);
                                let _ = done.send(());
                                break;
                            }
                            Some(SessionEvent::Close) | None => {
                                self.drop_session(None);
                                return;
                            }
                            Some(_) => continue,
                        },
                    }
                }
            }
        }

        while let Some(event) = rx.recv().await {
            if !self.handle(event) {
                break;
            }
        }
        tracing::debug!("Memory session {} ended", self.id);
    }

    /// Process one event; `false` ends the session task
    fn handle(&mut self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::Apply {
                name,
                args,
                callback,
            } => {
                if !self.alive {
                    tracing::debug!("Session {} gone, dropping call {}", self.id, name);
                    return true;
                }
                match self.registry.method(&name) {
                    Some(MethodBehavior::Reply(handler)) => {
                        self.registry.raise(callback(handler(&args)));
                    }
                    Some(MethodBehavior::Hang) => {
                        tracing::debug!("Method {} will never reply", name);
                    }
                    Some(MethodBehavior::Disconnect(error)) => self.drop_session(error),
                    None => {
                        self.registry
                            .raise(callback(Err(RemoteError::not_found("Method", &name))));
                    }
                }
            }
            SessionEvent::Subscribe {
                id,
                name,
                args,
                callbacks,
            } => {
                if !self.alive {
                    return true;
                }
                self.subscribe(id, name, args, callbacks);
            }
            SessionEvent::Unsubscribe { id } => {
                if self.subscriptions.remove(&id).is_some() {
                    tracing::debug!("Subscription {} stopped", id);
                }
            }
            SessionEvent::FailSubscriptions { name, error, done } => {
                let ids: Vec<String> = self
                    .subscriptions
                    .iter()
                    .filter(|(_, sub)| sub.name == name)
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in ids {
                    if let Some(sub) = self.subscriptions.remove(&id) {
                        self.registry.raise((sub.on_error)(error.clone()));
                    }
                }
                let _ = done.send(());
            }
            SessionEvent::Disconnect { error, done } => {
                self.drop_session(error);
                let _ = done.send(());
            }
            SessionEvent::ForceReconnect { done } => {
                if self.alive {
                    self.registry.raise((self.on_disconnect)(Some(
                        TransportError::forced_reconnect("server requested reconnect"),
                    )));
                }
                let _ = done.send(());
            }
            SessionEvent::CountSubscriptions { reply } => {
                let _ = reply.send(self.subscriptions.len());
            }
            SessionEvent::Flush { done } => {
                let _ = done.send(());
            }
            SessionEvent::Close => {
                self.drop_session(None);
                return false;
            }
        }
        true
    }

    fn subscribe(
        &mut self,
        id: String,
        name: String,
        args: Vec<Value>,
        callbacks: SubscribeCallbacks,
    ) {
        let SubscribeCallbacks { on_ready, on_error } = callbacks;

        match self.registry.publication(&name) {
            Some(PublicationBehavior::Reply(handler)) => match handler(&args) {
                Ok(()) => {
                    self.registry.raise(on_ready());
                    self.subscriptions.insert(
                        id,
                        PendingSubscription {
                            name,
                            on_ready: None,
                            on_error,
                        },
                    );
                }
                Err(e) => self.registry.raise(on_error(e)),
            },
            Some(PublicationBehavior::Hang) => {
                self.subscriptions.insert(
                    id,
                    PendingSubscription {
                        name,
                        on_ready: Some(on_ready),
                        on_error,
                    },
                );
            }
            None => {
                self.registry
                    .raise(on_error(RemoteError::not_found("Subscription", &name)));
            }
        }
    }

    fn drop_session(&mut self, error: Option<TransportError>) {
        if !self.alive {
            return;
        }
        self.alive = false;
        let pending_ready = self
            .subscriptions
            .drain()
            .filter(|(_, sub)| sub.on_ready.is_some())
            .count();
        tracing::debug!(
            "Session {} dropped ({} subscriptions never became ready)",
            self.id,
            pending_ready
        );
        self.registry.raise((self.on_disconnect)(error));
    }
}

/// Connection handle returned by [`MemoryService`]
#[derive(Debug)]
pub struct MemoryConnection {
    session_id: Uuid,
    tx: mpsc::UnboundedSender<SessionEvent>,
    registry: Arc<Registry>,
    _runtime: Arc<RuntimeThread>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("calls_received", &self.calls_received.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Connection for MemoryConnection {
    fn apply(&self, name: &str, args: Vec<Value>, callback: ResultCallback) {
        self.registry.calls_received.fetch_add(1, Ordering::SeqCst);
        let event = SessionEvent::Apply {
            name: name.to_string(),
            args,
            callback,
        };
        if self.tx.send(event).is_err() {
            tracing::warn!("Session {} closed, call {} not delivered", self.session_id, name);
        }
    }

    fn subscribe(
        &self,
        name: &str,
        args: Vec<Value>,
        callbacks: SubscribeCallbacks,
    ) -> Box<dyn Subscription> {
        let id = Uuid::new_v4().to_string();
        let event = SessionEvent::Subscribe {
            id: id.clone(),
            name: name.to_string(),
            args,
            callbacks,
        };
        if self.tx.send(event).is_err() {
            tracing::warn!(
                "Session {} closed, subscription {} not delivered",
                self.session_id,
                name
            );
        }
        Box::new(MemorySubscription {
            id,
            tx: self.tx.clone(),
        })
    }

    fn close(&self) {
        tracing::debug!("Closing memory session {}", self.session_id);
        let _ = self.tx.send(SessionEvent::Close);
    }
}

#[derive(Debug)]
struct MemorySubscription {
    id: String,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl Subscription for MemorySubscription {
    fn id(&self) -> &str {
        &self.id
    }

    fn stop(&self) {
        let _ = self.tx.send(SessionEvent::Unsubscribe {
            id: self.id.clone(),
        });
    }
}
