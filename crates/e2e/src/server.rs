//! Live server thread - binds a negotiated port and serves the app until stopped

use std::any::Any;
use std::io::{self, ErrorKind};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use axum::Router;
use ghostrunner_common::{AppContext, Connections, Database, DatabaseSettings, RequestFinished};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use parking_lot::{Condvar, Mutex};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{E2eError, E2eResult};
use crate::shared::SharedConnectionSet;

/// Builds the application served by the live server from the connections
/// visible to the server thread
pub type AppFactory = Arc<dyn Fn(AppContext) -> Router + Send + Sync>;

/// Lifecycle of the server thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerPhase {
    Created,
    Starting,
    Ready,
    Failed,
    Stopped,
}

struct Readiness {
    phase: ServerPhase,
    addr: Option<SocketAddr>,
    error: Option<E2eError>,
    failure: Option<String>,
}

/// One-shot readiness notification released by the server thread
struct ReadySignal {
    state: Mutex<Readiness>,
    released: Condvar,
}

impl ReadySignal {
    fn new() -> Self {
        Self {
            state: Mutex::new(Readiness {
                phase: ServerPhase::Created,
                addr: None,
                error: None,
                failure: None,
            }),
            released: Condvar::new(),
        }
    }

    fn starting(&self) {
        self.state.lock().phase = ServerPhase::Starting;
    }

    fn ready(&self, addr: SocketAddr) {
        let mut state = self.state.lock();
        state.phase = ServerPhase::Ready;
        state.addr = Some(addr);
        self.released.notify_all();
    }

    fn fail(&self, err: E2eError) {
        let mut state = self.state.lock();
        state.phase = ServerPhase::Failed;
        state.failure = Some(err.to_string());
        state.error = Some(err);
        self.released.notify_all();
    }

    fn stopped(&self) {
        self.state.lock().phase = ServerPhase::Stopped;
    }

    fn phase(&self) -> ServerPhase {
        self.state.lock().phase
    }

    fn addr(&self) -> Option<SocketAddr> {
        self.state.lock().addr
    }
}

/// A server thread that has been configured but not started
pub struct ServerThread {
    host: String,
    candidates: Vec<u16>,
    settings: Vec<DatabaseSettings>,
    shared: Vec<Database>,
    request_finished: RequestFinished,
    app: AppFactory,
    /// Keeps `shared` from being revoked until this thread is done with it
    _lease: Arc<()>,
}

impl ServerThread {
    /// Configure a server thread for `host` and the ordered `candidates`.
    ///
    /// Aliases in `shared` are served through the foreground's connections;
    /// every other alias in `context` gets a private connection owned by the
    /// server thread.
    pub fn new(
        host: impl Into<String>,
        candidates: Vec<u16>,
        context: &AppContext,
        shared: &SharedConnectionSet,
        app: AppFactory,
    ) -> Self {
        Self {
            host: host.into(),
            candidates,
            settings: context.connections.settings(),
            shared: shared.databases().cloned().collect(),
            request_finished: context.request_finished.clone(),
            app,
            _lease: shared.lease(),
        }
    }

    /// Spawn the thread. The returned handle is `Starting` until the thread
    /// releases its readiness signal.
    pub fn start(self) -> E2eResult<ServerHandle> {
        let host = self.host.clone();
        let signal = Arc::new(ReadySignal::new());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        signal.starting();
        let thread_signal = signal.clone();
        let thread = thread::Builder::new()
            .name("live-server".to_string())
            .spawn(move || self.run(thread_signal, shutdown_rx))
            .map_err(|e| E2eError::ServerStartup(format!("failed to spawn server thread: {}", e)))?;

        Ok(ServerHandle {
            host,
            signal,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    fn run(self, signal: Arc<ReadySignal>, shutdown: oneshot::Receiver<()>) {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(rt) => rt,
            Err(e) => {
                signal.fail(E2eError::ServerStartup(format!("failed to build runtime: {}", e)));
                return;
            }
        };

        let bound = match bind_first_available(&self.host, &self.candidates) {
            Ok(bound) => bound,
            Err(e) => {
                signal.fail(e);
                return;
            }
        };

        let context = AppContext {
            connections: thread_connections(&self.settings, &self.shared),
            request_finished: self.request_finished,
        };
        let app = &self.app;
        let router = match panic::catch_unwind(AssertUnwindSafe(|| app(context))) {
            Ok(router) => router,
            Err(payload) => {
                signal.fail(E2eError::ServerStartup(format!(
                    "app factory panicked: {}",
                    panic_message(payload.as_ref())
                )));
                return;
            }
        };

        runtime.block_on(async move {
            let mut listeners = Vec::with_capacity(bound.len());
            for listener in bound {
                match listener.set_nonblocking(true).and_then(|_| TcpListener::from_std(listener)) {
                    Ok(listener) => listeners.push(listener),
                    Err(e) => {
                        signal.fail(E2eError::ServerStartup(format!("failed to register listener: {}", e)));
                        return;
                    }
                }
            }
            let addrs = match listeners.iter().map(TcpListener::local_addr).collect::<io::Result<Vec<_>>>() {
                Ok(addrs) => addrs,
                Err(e) => {
                    signal.fail(E2eError::Io(e));
                    return;
                }
            };

            let Some(&addr) = addrs.first() else {
                signal.fail(E2eError::ServerStartup("no listening address".to_string()));
                return;
            };

            info!("Live server listening on {:?}", addrs);
            signal.ready(addr);
            accept_loop(listeners, router, shutdown).await;
        });

        debug!("Live server thread exiting");
    }
}

/// Foreground handle to a started server thread
pub struct ServerHandle {
    host: String,
    signal: Arc<ReadySignal>,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// Block until the server is ready or has failed, for at most `timeout`.
    ///
    /// A recorded startup error is returned as-is the first time it is observed.
    pub fn wait_ready(&self, timeout: Duration) -> E2eResult<SocketAddr> {
        let deadline = Instant::now() + timeout;
        let mut state = self.signal.state.lock();

        while state.phase == ServerPhase::Starting {
            if self.signal.released.wait_until(&mut state, deadline).timed_out()
                && state.phase == ServerPhase::Starting
            {
                return Err(E2eError::Timeout(format!(
                    "live server readiness after {:?}",
                    timeout
                )));
            }
        }

        match (state.phase, state.addr) {
            (ServerPhase::Ready, Some(addr)) => Ok(addr),
            (ServerPhase::Failed, _) => Err(state.error.take().unwrap_or_else(|| {
                E2eError::ServerStartup(state.failure.clone().unwrap_or_default())
            })),
            (phase, _) => Err(E2eError::ServerStartup(format!("live server is {:?}", phase))),
        }
    }

    pub fn phase(&self) -> ServerPhase {
        self.signal.phase()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.signal.addr()
    }

    pub fn port(&self) -> Option<u16> {
        self.local_addr().map(|addr| addr.port())
    }

    /// `http://<host>:<port>` once the server is bound
    pub fn live_server_url(&self) -> Option<String> {
        self.port().map(|port| format!("http://{}:{}", self.host, port))
    }

    /// Whether the server thread has not been joined yet
    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// Signal the accept loop to exit and join the thread. Idempotent.
    pub fn stop(&mut self) -> E2eResult<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };

        info!("Stopping live server on {}", self.host);
        if let Some(shutdown) = self.shutdown.take() {
            // The loop may already be gone if startup failed.
            let _ = shutdown.send(());
        }

        let joined = thread.join();
        self.signal.stopped();
        joined.map_err(|_| E2eError::ServerStartup("live server thread panicked".to_string()))
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Bind the first candidate port that is free on every address `host`
/// resolves to.
///
/// "Address in use" on any address moves on to the next candidate; any other
/// error is fatal.
fn bind_first_available(host: &str, candidates: &[u16]) -> E2eResult<Vec<std::net::TcpListener>> {
    let bind_error = |attempted: usize, reason: String| E2eError::Bind {
        host: host.to_string(),
        attempted,
        reason,
    };
    let ips = resolve(host).map_err(|e| bind_error(0, format!("cannot resolve host: {}", e)))?;
    let mut last_in_use = None;

    for (index, port) in candidates.iter().enumerate() {
        match bind_all(&ips, *port) {
            Ok(listeners) => {
                debug!("Bound {}:{} after {} attempt(s)", host, port, index + 1);
                return Ok(listeners);
            }
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                debug!("Port {} in use, trying next candidate", port);
                last_in_use = Some(e);
            }
            Err(e) => return Err(bind_error(index + 1, e.to_string())),
        }
    }

    Err(bind_error(
        candidates.len(),
        last_in_use
            .map(|e| format!("all candidate ports in use ({})", e))
            .unwrap_or_else(|| "no candidate ports".to_string()),
    ))
}

/// Addresses `host` resolves to, in resolver order without duplicates
fn resolve(host: &str) -> io::Result<Vec<IpAddr>> {
    let mut ips = Vec::new();
    for addr in (host, 0).to_socket_addrs()? {
        if !ips.contains(&addr.ip()) {
            ips.push(addr.ip());
        }
    }
    if ips.is_empty() {
        return Err(io::Error::new(ErrorKind::AddrNotAvailable, "no addresses"));
    }
    Ok(ips)
}

/// Bind `port` on every address in `ips`.
///
/// Fails with `AddrInUse` if any address has the port taken. Addresses the
/// machine cannot bind at all (no IPv6, say) are skipped as long as one binds.
fn bind_all(ips: &[IpAddr], port: u16) -> io::Result<Vec<std::net::TcpListener>> {
    let mut listeners: Vec<std::net::TcpListener> = Vec::new();
    let mut unavailable = None;

    for ip in ips {
        // Port 0 lets the first bind choose; the other addresses follow it.
        let port = match listeners.first() {
            Some(first) => first.local_addr()?.port(),
            None => port,
        };
        match std::net::TcpListener::bind(SocketAddr::new(*ip, port)) {
            Ok(listener) => listeners.push(listener),
            Err(e) if e.kind() == ErrorKind::AddrInUse => return Err(e),
            Err(e) => {
                debug!("Skipping {}:{}: {}", ip, port, e);
                unavailable = Some(e);
            }
        }
    }

    match unavailable {
        Some(e) if listeners.is_empty() => Err(e),
        _ => Ok(listeners),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

/// Connections for the server thread: shared aliases reuse the foreground's
/// connection, the rest connect privately on first use
fn thread_connections(settings: &[DatabaseSettings], shared: &[Database]) -> Connections {
    let mut connections = Connections::new();
    for db in shared {
        connections.insert(db.clone());
    }
    for s in settings {
        if !shared.iter().any(|db| db.alias() == s.alias) {
            connections.insert(Database::lazy(s.clone()));
        }
    }
    connections
}

async fn accept_loop(listeners: Vec<TcpListener>, router: Router, mut shutdown: oneshot::Receiver<()>) {
    let (accepted_tx, mut accepted) = mpsc::channel(16);
    let mut acceptors = JoinSet::new();
    for listener in listeners {
        let accepted_tx = accepted_tx.clone();
        acceptors.spawn(async move {
            loop {
                match listener.accept().await {
                    Ok(conn) => {
                        if accepted_tx.send(conn).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Live server accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        });
    }
    drop(accepted_tx);

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            Some((stream, peer)) = accepted.recv() => {
                let service = TowerToHyperService::new(router.clone());
                connections.spawn(async move {
                    let builder = auto::Builder::new(TokioExecutor::new());
                    if let Err(err) = builder.serve_connection(TokioIo::new(stream), service).await {
                        report_connection_error(peer, &*err);
                    }
                });
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    // Dropping the acceptors closes the listening sockets.
    acceptors.abort_all();
    while acceptors.join_next().await.is_some() {}
    connections.abort_all();
    while connections.join_next().await.is_some() {}
    debug!("Live server accept loop stopped");
}

fn report_connection_error(peer: SocketAddr, err: &(dyn std::error::Error + 'static)) {
    if is_broken_connection(err) {
        warn!("Client {} disconnected mid-response: {}", peer, err);
    } else {
        error!("Error serving {}: {}", peer, err);
    }
}

/// Peer went away: broken pipe, reset/aborted connection, or a truncated message
fn is_broken_connection(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
            ) {
                return true;
            }
        }
        if let Some(hyper_err) = e.downcast_ref::<hyper::Error>() {
            if hyper_err.is_incomplete_message() {
                return true;
            }
        }
        current = e.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use std::net::TcpListener as StdListener;

    fn app() -> AppFactory {
        Arc::new(|_| Router::new().route("/", get(|| async { "ok" })))
    }

    fn server(candidates: Vec<u16>) -> ServerThread {
        let context = AppContext::new(&[]);
        ServerThread::new("127.0.0.1", candidates, &context, &SharedConnectionSet::default(), app())
    }

    #[test]
    fn test_serves_after_ready() {
        let mut handle = server(vec![0]).start().unwrap();
        let addr = handle.wait_ready(Duration::from_secs(5)).unwrap();

        assert_eq!(handle.phase(), ServerPhase::Ready);
        assert_eq!(handle.live_server_url().unwrap(), format!("http://127.0.0.1:{}", addr.port()));

        let body = reqwest::blocking::get(handle.live_server_url().unwrap())
            .unwrap()
            .text()
            .unwrap();
        assert_eq!(body, "ok");

        handle.stop().unwrap();
        assert_eq!(handle.phase(), ServerPhase::Stopped);
        assert!(!handle.is_running());
        assert!(StdListener::bind(addr).is_ok(), "socket must be closed after stop");
    }

    #[test]
    fn test_skips_ports_in_use() {
        let occupied = StdListener::bind("127.0.0.1:0").unwrap();
        let busy = occupied.local_addr().unwrap().port();

        let mut handle = server(vec![busy, 0]).start().unwrap();
        let addr = handle.wait_ready(Duration::from_secs(5)).unwrap();
        assert_ne!(addr.port(), busy);
        handle.stop().unwrap();
    }

    #[test]
    fn test_failure_releases_readiness() {
        let occupied = StdListener::bind("127.0.0.1:0").unwrap();
        let busy = occupied.local_addr().unwrap().port();

        let mut handle = server(vec![busy]).start().unwrap();
        let err = handle.wait_ready(Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, E2eError::Bind { attempted: 1, .. }), "{err}");
        assert_eq!(handle.phase(), ServerPhase::Failed);

        // The error is raised once; later waits still fail.
        assert!(handle.wait_ready(Duration::from_millis(10)).is_err());

        handle.stop().unwrap();
        handle.stop().unwrap();
        assert_eq!(handle.phase(), ServerPhase::Stopped);
    }

    #[test]
    fn test_no_candidates_is_a_bind_error() {
        let err = bind_first_available("127.0.0.1", &[]).unwrap_err();
        assert!(matches!(err, E2eError::Bind { attempted: 0, .. }));
    }

    #[test]
    fn test_panicking_app_factory_fails_startup() {
        let context = AppContext::new(&[]);
        let app: AppFactory = Arc::new(|_: AppContext| -> Router { panic!("router misconfigured") });
        let mut handle = ServerThread::new("127.0.0.1", vec![0], &context, &SharedConnectionSet::default(), app)
            .start()
            .unwrap();

        let started = Instant::now();
        let err = handle.wait_ready(Duration::from_secs(20)).unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(
            matches!(&err, E2eError::ServerStartup(msg) if msg.contains("router misconfigured")),
            "{err}"
        );
        assert_eq!(handle.phase(), ServerPhase::Failed);
        handle.stop().unwrap();
    }

    #[test]
    fn test_port_taken_on_one_address_is_skipped() {
        let occupied = StdListener::bind("127.0.0.1:0").unwrap();
        let busy = occupied.local_addr().unwrap().port();

        let listeners = bind_first_available("localhost", &[busy, 0]).unwrap();
        let ports: Vec<u16> = listeners.iter().map(|l| l.local_addr().unwrap().port()).collect();
        assert!(!ports.is_empty());
        assert!(ports.iter().all(|p| *p != busy && *p == ports[0]), "{ports:?}");
    }

    #[test]
    fn test_sharing_cannot_be_revoked_while_serving() {
        let context = AppContext::new(&[DatabaseSettings::new("default", ghostrunner_common::Engine::SqliteMemory)]);
        let mut shared = SharedConnectionSet::enable(&context.connections);
        let mut handle = ServerThread::new("127.0.0.1", vec![0], &context, &shared, app())
            .start()
            .unwrap();
        handle.wait_ready(Duration::from_secs(5)).unwrap();

        assert!(matches!(shared.disable(), Err(E2eError::SharingInUse)));
        assert!(context.connections.default_db().unwrap().allows_thread_sharing());

        handle.stop().unwrap();
        shared.disable().unwrap();
        assert!(!context.connections.default_db().unwrap().allows_thread_sharing());
    }

    #[test]
    fn test_broken_connection_classification() {
        let reset = std::io::Error::from(ErrorKind::ConnectionReset);
        let pipe = std::io::Error::new(ErrorKind::BrokenPipe, "write failed");
        let refused = std::io::Error::from(ErrorKind::ConnectionRefused);

        assert!(is_broken_connection(&reset));
        assert!(is_broken_connection(&pipe));
        assert!(!is_broken_connection(&refused));
    }

    #[test]
    fn test_thread_connections_prefer_shared() {
        let shared = Database::open_memory("default").unwrap();
        let settings = vec![
            shared.settings().clone(),
            DatabaseSettings::from_url("other", "sqlite::memory:").unwrap(),
        ];

        let connections = thread_connections(&settings, std::slice::from_ref(&shared));
        assert_eq!(connections.len(), 2);
        assert!(connections.default_db().unwrap().is_open());
        assert!(!connections.get("other").unwrap().is_open());
    }
}
