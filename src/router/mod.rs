//! # 路由器编排模块
//!
//! 持有监听器并按依赖注入方式组装各组件：
//!
//! - 生命周期：`Created → Started → Stopped`，停止后不可重启
//! - 中间件链：请求ID → 防火墙 → 限流 → CORS → 安全响应头 → 访问日志
//! - 管理接口与代理路径共用同一条中间件链
//! - 优雅停机：停止接收新连接，在截止时间内等待进行中的请求

mod admin; // 管理接口
pub mod middleware; // 请求ID、防火墙、限流、CORS、安全头、访问日志
pub mod response; // 统一响应信封

use chrono::{DateTime, Utc};
use hyper::header::ORIGIN;
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Request, Response};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::collections::HashSet;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::balancer::{client_ip, Algorithm, LoadBalancer};
use crate::config::Config;
use crate::error::{RouterError, RouterResult};
use crate::health::HealthChecker;
use crate::proxy::{build_client, is_websocket_upgrade, ReverseProxy};
use crate::ratelimit::RateLimiter;
use crate::registry::{ServiceLookup, ServiceRegistry, ServiceType, Storage};
use response::error_response;

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(30);
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);
const SERVICE_TYPE_HEADER: &str = "x-service-type";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RouterState {
    Created,
    Started,
    Stopped,
}

impl fmt::Display for RouterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RouterState::Created => "created",
            RouterState::Started => "started",
            RouterState::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone)]
struct Lifecycle {
    state: RouterState,
    started_at: Option<Instant>,
    started_at_utc: Option<DateTime<Utc>>,
    local_addr: Option<SocketAddr>,
}

/// Components shared by every request task
pub(crate) struct RouterContext {
    config: RwLock<Arc<Config>>,
    config_path: Option<PathBuf>,
    pub(crate) registry: ServiceRegistry,
    pub(crate) health: HealthChecker,
    pub(crate) balancer: LoadBalancer,
    pub(crate) limiter: RateLimiter,
    proxy: ReverseProxy,
    prometheus: Option<PrometheusHandle>,
    lifecycle: StdMutex<Lifecycle>,
    created_at: Instant,
    shutdown: CancellationToken,
}

impl RouterContext {
    pub(crate) fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn state(&self) -> RouterState {
        self.lifecycle().state
    }

    pub(crate) fn uptime(&self) -> Duration {
        self.lifecycle()
            .started_at
            .map(|t| t.elapsed())
            .unwrap_or_else(|| self.created_at.elapsed())
    }

    pub(crate) fn started_at(&self) -> Option<DateTime<Utc>> {
        self.lifecycle().started_at_utc
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle().local_addr
    }

    pub(crate) fn prometheus(&self) -> Option<&PrometheusHandle> {
        self.prometheus.as_ref()
    }

    /// Register the statically configured services, updating ones already present
    async fn register_static_services(&self, config: &Config) -> RouterResult<usize> {
        let mut count = 0;
        for spec in &config.services.discovery.services {
            let service = spec.clone().into_service();
            match self.registry.register(service.clone()).await {
                Ok(_) => count += 1,
                Err(RouterError::AlreadyExists { .. }) => {
                    self.registry.update_service(service).await?;
                    count += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(count)
    }

    /// Re-read the configuration file, if any, and apply what can change at runtime
    pub(crate) async fn reload(&self) -> RouterResult<()> {
        let config = match &self.config_path {
            Some(path) => {
                info!(path = %path.display(), "Reloading configuration");
                Config::from_file_with_env(path).await?
            }
            None => {
                info!("Reloading configuration from memory");
                (*self.config()).clone()
            }
        };

        // Nothing below may fail once the balancer has been touched
        config.validate()?;
        let algorithm: Algorithm = config.load_balancer.algorithm.parse()?;

        let registered = self.register_static_services(&config).await?;
        if algorithm != self.balancer.algorithm() {
            self.balancer.set_algorithm(algorithm.as_str())?;
        }
        self.balancer.set_weights(config.load_balancer.weights.clone())?;
        if config.server.address() != self.config().server.address() {
            warn!("Listener address changes take effect after restart");
        }

        *self.config.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(config);
        info!(static_services = registered, "Configuration reloaded");
        Ok(())
    }

    /// Middleware chain in front of the admin and proxy routes
    async fn handle(self: Arc<Self>, mut req: Request<Body>) -> Response<Body> {
        let started = Instant::now();
        let config = self.config();
        let request_id = middleware::assign_request_id(&mut req, config.logging.correlation_id);
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let client = client_ip(&req);
        let origin = req
            .headers()
            .get(ORIGIN)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let cors = &config.security.cors;
        let preflight = cors.enabled && middleware::is_preflight(&req);
        let scheme = if config.ssl.enabled { "https" } else { "http" };
        let port = self.local_addr().map(|a| a.port());

        let mut response = if let Err(refused) =
            middleware::check_firewall(&config.security.firewall, client, scheme, port)
        {
            refused
        } else if preflight {
            middleware::preflight_response(cors, origin.as_deref(), &req)
        } else {
            match middleware::admit(
                &self.limiter,
                &config.security.rate_limit,
                &method,
                &path,
                client,
            ) {
                Err(refused) => refused,
                Ok(status) => {
                    let mut response = Arc::clone(&self).dispatch_guarded(req).await;
                    if let Some(status) = status {
                        middleware::apply_rate_limit_headers(response.headers_mut(), &status);
                    }
                    response
                }
            }
        };

        if cors.enabled && !preflight {
            middleware::apply_cors(cors, origin.as_deref(), response.headers_mut(), false);
        }
        if config.security.headers {
            middleware::apply_security_headers(response.headers_mut(), config.ssl.enabled);
        }
        middleware::set_request_id(response.headers_mut(), &request_id);

        let elapsed = started.elapsed();
        middleware::log_access(&request_id, &method, &path, response.status(), elapsed, client);
        crate::metrics::record_request(response.status().as_u16(), elapsed);
        response
    }

    /// Run the route on its own task so a panic or an overrun becomes a response
    async fn dispatch_guarded(self: Arc<Self>, req: Request<Body>) -> Response<Body> {
        let write_timeout = self.config().server.get_write_timeout();
        let path = req.uri().path().to_string();
        run_guarded(write_timeout, path, async move { self.dispatch(req).await }).await
    }

    async fn dispatch(self: Arc<Self>, req: Request<Body>) -> Response<Body> {
        let req = match admin::route(&self, req).await {
            admin::Routed::Handled(response) => return response,
            admin::Routed::Proxy(req) => req,
        };
        match self.forward(req).await {
            Ok(response) => response,
            Err(e) => error_response(&e),
        }
    }

    async fn forward(&self, req: Request<Body>) -> RouterResult<Response<Body>> {
        let mut candidates = self.registry.get_healthy_services().await;
        if let Some(wanted) = req
            .headers()
            .get(SERVICE_TYPE_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let wanted: ServiceType = wanted.parse()?;
            candidates.retain(|s| s.service_type == wanted);
        }

        let target = self.balancer.select_service(&req, &candidates)?;
        let _in_flight = self.balancer.begin_request(&target.id);
        let started = Instant::now();

        let result = if is_websocket_upgrade(&req) {
            self.proxy.proxy_websocket(req, &target).await
        } else {
            self.proxy.proxy_request(req, &target).await
        };

        let success = matches!(&result, Ok(r) if !r.status().is_server_error());
        self.balancer
            .record_response(&target.id, started.elapsed(), success);
        result
    }
}

async fn run_guarded<F>(write_timeout: Duration, path: String, fut: F) -> Response<Body>
where
    F: Future<Output = Response<Body>> + Send + 'static,
{
    let task = tokio::spawn(fut);
    let abort = task.abort_handle();

    match tokio::time::timeout(write_timeout, task).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) if e.is_panic() => {
            error!(path = %path, "Request handler panicked");
            error_response(&RouterError::internal("request handler panicked"))
        }
        Ok(Err(e)) => error_response(&RouterError::internal(format!(
            "request handler cancelled: {}",
            e
        ))),
        Err(_) => {
            abort.abort();
            error_response(&RouterError::gateway_timeout(write_timeout, path))
        }
    }
}

/// Service router: registry, health checker, balancer, rate limiter and
/// reverse proxy behind one HTTP listener.
pub struct Router {
    ctx: Arc<RouterContext>,
    control: Mutex<Option<ServerTasks>>,
}

struct ServerTasks {
    /// Resolves to the still-open connections once accepting stops
    server: JoinHandle<JoinSet<()>>,
    housekeeping: JoinHandle<()>,
}

impl Router {
    /// Build every component from `config` and register static services
    pub async fn new(config: Config) -> RouterResult<Self> {
        Self::with_source(config, None).await
    }

    /// Load `path` and remember it for `/router/reload`
    pub async fn from_config_file<P: Into<PathBuf>>(path: P) -> RouterResult<Self> {
        let path = path.into();
        let config = Config::from_file_with_env(&path).await?;
        Self::with_source(config, Some(path)).await
    }

    /// Build from an already loaded `config`; `config_path` is re-read on reload
    pub async fn with_source(config: Config, config_path: Option<PathBuf>) -> RouterResult<Self> {
        Self::build(config, config_path, None).await
    }

    /// Persist registrations to `storage` and restore whatever it already
    /// holds before static services are applied on top
    pub async fn with_storage(config: Config, storage: Arc<dyn Storage>) -> RouterResult<Self> {
        Self::build(config, None, Some(storage)).await
    }

    async fn build(
        config: Config,
        config_path: Option<PathBuf>,
        storage: Option<Arc<dyn Storage>>,
    ) -> RouterResult<Self> {
        config.validate()?;
        let shutdown = CancellationToken::new();
        let client = build_client(&config.http_client);

        let registry = match (storage, config.storage.storage_type.as_str()) {
            (Some(storage), _) => {
                let registry = ServiceRegistry::with_storage(storage);
                let restored = registry.load_from_storage().await?;
                info!(restored, "Registry restored from storage");
                registry
            }
            // Process-local: nothing outlives the router, so nothing to persist
            (None, "memory") => ServiceRegistry::new(),
            (None, other) => {
                return Err(RouterError::config(format!(
                    "unsupported storage type: {}",
                    other
                )))
            }
        };
        let health = HealthChecker::new(
            Arc::new(registry.clone()),
            client.clone(),
            config.services.health.clone(),
        );
        let balancer = LoadBalancer::new(&config.load_balancer)?;
        let proxy = ReverseProxy::new(
            client,
            &config.http_client,
            config.ssl.enabled,
            shutdown.clone(),
        );
        let prometheus = crate::metrics::install(&config.monitoring);

        let ctx = Arc::new(RouterContext {
            config: RwLock::new(Arc::new(config.clone())),
            config_path,
            registry,
            health,
            balancer,
            limiter: RateLimiter::new(),
            proxy,
            prometheus,
            lifecycle: StdMutex::new(Lifecycle {
                state: RouterState::Created,
                started_at: None,
                started_at_utc: None,
                local_addr: None,
            }),
            created_at: Instant::now(),
            shutdown,
        });

        let registered = ctx.register_static_services(&config).await?;
        info!(
            algorithm = %ctx.balancer.algorithm(),
            static_services = registered,
            "Router created"
        );

        Ok(Self {
            ctx,
            control: Mutex::new(None),
        })
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.ctx.registry
    }

    pub fn health_checker(&self) -> &HealthChecker {
        &self.ctx.health
    }

    pub fn load_balancer(&self) -> &LoadBalancer {
        &self.ctx.balancer
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.ctx.limiter
    }

    pub fn config(&self) -> Arc<Config> {
        self.ctx.config()
    }

    pub fn state(&self) -> RouterState {
        self.ctx.state()
    }

    /// Bound listener address once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.ctx.local_addr()
    }

    /// Cancelled when the router stops or the accept loop dies
    pub fn shutdown_token(&self) -> CancellationToken {
        self.ctx.shutdown.clone()
    }

    /// Bind the listener, start health checks and begin accepting.
    pub async fn start(&self) -> RouterResult<SocketAddr> {
        let mut control = self.control.lock().await;
        match self.ctx.state() {
            RouterState::Created => {}
            RouterState::Started => return Err(RouterError::AlreadyStarted),
            RouterState::Stopped => {
                return Err(RouterError::invalid_state(
                    "router has been stopped and cannot be restarted",
                ))
            }
        }

        let config = self.ctx.config();
        let acceptor = crate::tls::build_acceptor(&config.ssl)?;
        let address = config.server.address();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|e| RouterError::config(format!("failed to bind {}: {}", address, e)))?;
        let local_addr = listener.local_addr()?;

        self.ctx.health.start_health_checks(&self.ctx.shutdown).await?;

        let server = spawn_server(Arc::clone(&self.ctx), listener, acceptor);
        let housekeeping = spawn_housekeeping(Arc::clone(&self.ctx));
        *control = Some(ServerTasks {
            server,
            housekeeping,
        });

        {
            let mut lifecycle = self
                .ctx
                .lifecycle
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            lifecycle.state = RouterState::Started;
            lifecycle.started_at = Some(Instant::now());
            lifecycle.started_at_utc = Some(Utc::now());
            lifecycle.local_addr = Some(local_addr);
        }

        info!(
            address = %local_addr,
            tls = config.ssl.enabled,
            "Router listening"
        );
        Ok(local_addr)
    }

    /// Stop accepting, let in-flight requests finish within `deadline`, then
    /// close whatever is left. Stopping twice is a no-op.
    pub async fn stop(&self, deadline: Duration) -> RouterResult<()> {
        let mut control = self.control.lock().await;
        let previous = {
            let mut lifecycle = self
                .ctx
                .lifecycle
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut lifecycle.state, RouterState::Stopped)
        };
        if previous == RouterState::Stopped {
            debug!("Router already stopped");
            return Ok(());
        }

        info!(deadline_secs = deadline.as_secs(), "Stopping router");
        self.ctx.shutdown.cancel();

        if let Some(tasks) = control.take() {
            let mut connections = match tasks.server.await {
                Ok(connections) => connections,
                Err(e) => {
                    warn!(error = %e, "Accept loop ended abnormally");
                    JoinSet::new()
                }
            };

            let in_flight = connections.len();
            let drained = tokio::time::timeout(deadline, async {
                while connections.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(
                    remaining = connections.len(),
                    "Shutdown deadline reached, closing remaining connections"
                );
                connections.shutdown().await;
            } else if in_flight > 0 {
                debug!(connections = in_flight, "Connections drained");
            }

            tasks.housekeeping.abort();
        }

        self.ctx.health.stop_health_checks().await;
        info!("Router stopped");
        Ok(())
    }
}

fn spawn_server(
    ctx: Arc<RouterContext>,
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
) -> JoinHandle<JoinSet<()>> {
    let shutdown = ctx.shutdown.clone();
    let accept = tokio::spawn(accept_loop(ctx, listener, acceptor));
    tokio::spawn(async move {
        match accept.await {
            Ok(connections) => connections,
            Err(e) => {
                // A broken accept loop takes the whole router down
                error!(error = %e, "Accept loop failed, shutting down");
                shutdown.cancel();
                JoinSet::new()
            }
        }
    })
}

async fn accept_loop(
    ctx: Arc<RouterContext>,
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
) -> JoinSet<()> {
    let shutdown = ctx.shutdown.clone();
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        continue;
                    }
                };
                let ctx = Arc::clone(&ctx);
                match acceptor.clone() {
                    None => {
                        connections.spawn(serve_connection(ctx, stream, peer));
                    }
                    Some(acceptor) => {
                        connections.spawn(async move {
                            match acceptor.accept(stream).await {
                                Ok(tls_stream) => serve_connection(ctx, tls_stream, peer).await,
                                Err(e) => debug!("TLS handshake failed from {}: {}", peer, e),
                            }
                        });
                    }
                }
            }
        }
    }

    // Dropping the listener here refuses further connections
    drop(listener);
    debug!(open = connections.len(), "Accept loop stopped");
    connections
}

async fn serve_connection<I>(ctx: Arc<RouterContext>, io: I, peer: SocketAddr)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let shutdown = ctx.shutdown.clone();
    let read_timeout = ctx.config().server.get_read_timeout();
    let service = service_fn(move |mut req: Request<Body>| {
        let ctx = Arc::clone(&ctx);
        req.extensions_mut().insert(peer);
        async move { Ok::<_, Infallible>(ctx.handle(req).await) }
    });

    let mut http = Http::new();
    http.http1_header_read_timeout(read_timeout);
    let conn = http.serve_connection(io, service).with_upgrades();
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                debug!("Error serving connection from {}: {}", peer, e);
            }
        }
        _ = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            if let Err(e) = conn.await {
                debug!("Error draining connection from {}: {}", peer, e);
            }
        }
    }
}

/// Periodic cleanup of rate limiter windows and balancer connection state
fn spawn_housekeeping(ctx: Arc<RouterContext>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let shutdown = ctx.shutdown.clone();
        let mut ticker = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let config = ctx.config();
                    let rate_limit = &config.security.rate_limit;
                    let longest = rate_limit
                        .rules
                        .iter()
                        .map(|r| r.get_window())
                        .chain(std::iter::once(rate_limit.get_window()))
                        .max()
                        .unwrap_or(HOUSEKEEPING_INTERVAL);
                    let purged = ctx.limiter.purge_expired(longest);

                    let live: HashSet<String> = ctx
                        .registry
                        .get_services()
                        .await
                        .into_iter()
                        .map(|s| s.id)
                        .collect();
                    ctx.balancer.forget_missing(&live);
                    debug!(purged, services = live.len(), "Housekeeping finished");
                }
            }
        }
    })
}
