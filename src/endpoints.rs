//! The central dispatcher.
//!
//! [`Endpoints`] owns the registry, the worker pool, the single-flight
//! group, and the metric reporter, and is the entry point for every fn
//! invocation, whether it arrived over HTTP or from inside another fn
//! body. The dispatch path validates, resolves, collapses, schedules, and
//! awaits under the caller's deadline; each stage surfaces its own coded
//! failure.
//!
//! # Examples
//!
//! ```rust,no_run
//! use fns::config::Config;
//! use fns::endpoint::Service;
//! use fns::endpoints::Endpoints;
//!
//! # async fn example(users: Service) -> Result<(), fns::errors::CodeError> {
//! let endpoints = Endpoints::builder(Config::default())
//!     .deploy(users)
//!     .build()
//!     .await?;
//! endpoints.listen().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::join_all;
use once_cell::sync::OnceCell;
use semver::Version;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{Config, TransportConfig};
use crate::documents::Documents;
use crate::endpoint::{Components, Endpoint, FnHandler};
use crate::errors::CodeError;
use crate::log;
use crate::metrics::{Metric, ReportSink, Reporter};
use crate::param::Param;
use crate::promise::{self, Promise};
use crate::registry::{GetOptions, Registry};
use crate::request::{HashPolicy, Request, RequestOptions};
use crate::response::FnResponse;
use crate::singleflight::Group;
use crate::tracer::{SpanId, Tracer};
use crate::workers::Workers;

/// Endpoint name metric reports are forwarded to, when deployed.
pub const METRICS_ENDPOINT: &str = "metrics";
/// Fn name metric reports are forwarded to.
pub const METRICS_REPORT_FN: &str = "report";

/// Startup window within which a listener's immediate failure is caught.
const LISTEN_STARTUP_WINDOW: Duration = Duration::from_secs(5);

/// Capacity of the metric report queue.
const REPORT_QUEUE_CAPACITY: usize = 4096;

/// Assembles an [`Endpoints`] manager from config and deployed services.
pub struct EndpointsBuilder {
    config: Config,
    id: Option<String>,
    version: Version,
    hash_policy: HashPolicy,
    report_sink: Option<ReportSink>,
    deployed: Vec<Box<dyn Endpoint>>,
}

impl EndpointsBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            id: None,
            version: Version::new(1, 0, 0),
            hash_policy: HashPolicy::default(),
            report_sink: None,
            deployed: Vec::new(),
        }
    }

    /// Overrides the generated process instance id.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets this process's semantic version, matched against request
    /// version intervals.
    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    /// Adjusts which identity fields participate in single-flight keys.
    pub fn hash_policy(mut self, policy: HashPolicy) -> Self {
        self.hash_policy = policy;
        self
    }

    /// Overrides where drained metric reports go.
    ///
    /// Without a sink, reports are forwarded as internal requests to a
    /// deployed `metrics` endpoint, or dropped when none is deployed.
    pub fn report_sink(mut self, sink: ReportSink) -> Self {
        self.report_sink = Some(sink);
        self
    }

    /// Deploys an endpoint. Registration order does not matter.
    pub fn deploy(mut self, endpoint: impl Endpoint) -> Self {
        self.deployed.push(Box::new(endpoint));
        self
    }

    /// Constructs every deployed endpoint and freezes the registry.
    pub async fn build(self) -> Result<Arc<Endpoints>, CodeError> {
        log::init_logging(&self.config.log);

        let id = self.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut registry = Registry::default();
        for endpoint in self.deployed {
            let node = self.config.node(endpoint.name());
            registry.add(endpoint, &id, &self.version, node).await?;
        }

        let runtime = &self.config.runtime;
        let endpoints = Arc::new(Endpoints {
            id,
            version: self.version,
            registry,
            workers: Workers::new(runtime.max_workers, runtime.worker_max_idle()),
            group: Group::new(),
            hash_policy: self.hash_policy,
            handle_timeout: runtime.handle_timeout(),
            transport: self.config.transport.clone(),
            documents: Documents::new(),
            reporter: OnceCell::new(),
            shutdown_token: CancellationToken::new(),
        });
        endpoints.documents.refresh(endpoints.registry.info());
        endpoints.install_reporter(self.report_sink);
        Ok(endpoints)
    }
}

/// The endpoints manager. See the module docs.
pub struct Endpoints {
    id: String,
    version: Version,
    registry: Registry,
    workers: Workers,
    group: Group<FnResponse>,
    hash_policy: HashPolicy,
    handle_timeout: Duration,
    transport: TransportConfig,
    documents: Documents,
    reporter: OnceCell<Arc<Reporter>>,
    shutdown_token: CancellationToken,
}

impl Endpoints {
    pub fn builder(config: Config) -> EndpointsBuilder {
        EndpointsBuilder::new(config)
    }

    /// This process's instance id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// This process's semantic version.
    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn documents(&self) -> &Documents {
        &self.documents
    }

    pub(crate) fn transport(&self) -> &TransportConfig {
        &self.transport
    }

    /// Invokes `{endpoint_name}/{fn_name}` with `param`.
    ///
    /// `parent` carries identity inheritance for fn-to-fn fan-out; external
    /// ingress passes `None` and supplies identity through `options`. The
    /// await is bounded by the request deadline, falling back to the
    /// configured handle timeout.
    pub async fn request(
        self: &Arc<Self>,
        parent: Option<&Request>,
        endpoint_name: &str,
        fn_name: &str,
        param: Param,
        options: RequestOptions,
    ) -> Result<FnResponse, CodeError> {
        if endpoint_name.is_empty() || fn_name.is_empty() {
            return Err(CodeError::bad_request("endpoint name and fn name are required"));
        }
        let request = Request::acquire(parent, endpoint_name, fn_name, param, options)?;

        let header = request.header();
        let get_options = GetOptions {
            id: header.endpoint_id.clone(),
            versions: if header.accepted_versions.is_empty() {
                None
            } else {
                Some(header.accepted_versions.clone())
            },
        };
        let endpoint = self.registry.get(endpoint_name, &get_options).ok_or_else(|| {
            CodeError::not_found("endpoint was not found").with_meta("endpoint", endpoint_name)
        })?;
        let handler = endpoint.functions().find(fn_name).ok_or_else(|| {
            CodeError::not_found("fn was not found")
                .with_meta("endpoint", endpoint_name)
                .with_meta("fn", fn_name)
        })?;
        if !header.internal && (endpoint.internal() || handler.internal()) {
            // Internal surfaces stay indistinguishable from absent ones.
            return Err(CodeError::not_found("fn was not found")
                .with_meta("endpoint", endpoint_name)
                .with_meta("fn", fn_name));
        }

        if let Some(components) = endpoint.components() {
            request.locals().set(components.clone());
        }

        let tracer = match request.locals().get::<Tracer>() {
            Some(tracer) => tracer,
            None => {
                let tracer = Arc::new(Tracer::new(request.header().process_id.clone()));
                request.locals().set_shared(tracer.clone());
                tracer
            }
        };
        let span = tracer.begin(
            endpoint_name,
            fn_name,
            [("scope".to_string(), "local".to_string())],
        );

        let key = request.fingerprint(self.hash_policy);
        let deadline = request
            .deadline()
            .unwrap_or_else(|| Instant::now() + self.handle_timeout);

        let mut waiter_metric = Metric::begin(&request);
        let (settled, shared) = self
            .group
            .run(key, || {
                let this = self.clone();
                let request = request.clone();
                let tracer = tracer.clone();
                async move { this.dispatch(handler, request, tracer, span, deadline).await }
            })
            .await;

        if shared {
            // Collapsed waiters finish their own span and produce their own
            // metric; only the leader ran the fn.
            self.finish_span(&tracer, span, settled.as_ref().err());
            waiter_metric.end(settled.as_ref().err());
            waiter_metric.mark_shared();
            self.report(endpoint_name, waiter_metric).await;
        }

        settled
    }

    /// Leader path under the single-flight group: schedule and await.
    async fn dispatch(
        self: Arc<Self>,
        handler: Arc<dyn FnHandler>,
        request: Arc<Request>,
        tracer: Arc<Tracer>,
        span: SpanId,
        deadline: Instant,
    ) -> Result<FnResponse, CodeError> {
        let endpoint_name = request.endpoint_name().to_string();
        let fn_name = request.fn_name().to_string();

        let (promise, future) = promise::pair();
        let task = FnTask {
            endpoints: self.clone(),
            handler,
            request,
            tracer: tracer.clone(),
            span,
            promise,
        };
        if !self.workers.dispatch(Box::pin(task.run())) {
            let err = CodeError::too_many_requests("worker pool is saturated")
                .with_meta("endpoint", &endpoint_name)
                .with_meta("fn", &fn_name);
            self.finish_span(&tracer, span, Some(&err));
            return Err(err);
        }

        future.get(Some(deadline)).await.map_err(|err| {
            // Fn-originated failures were annotated and span-finished by the
            // task; errors born here (deadline expiry, a dropped promise)
            // still need both.
            if err.meta().contains_key("endpoint") {
                return err;
            }
            self.finish_span(&tracer, span, Some(&err));
            err.with_meta("endpoint", &endpoint_name).with_meta("fn", &fn_name)
        })
    }

    /// Starts every endpoint that exposes a background listener.
    ///
    /// A listener that fails inside the startup window fails the whole
    /// phase; after the window it is considered started.
    pub async fn listen(self: &Arc<Self>) -> Result<(), CodeError> {
        let mut startups = Vec::new();
        for endpoint in self.registry.endpoints() {
            if endpoint.as_listenable().is_none() {
                continue;
            }
            let endpoint = endpoint.clone();
            let token = self.shutdown_token.child_token();
            startups.push(async move {
                let name = endpoint.name().to_string();
                let mut handle = tokio::spawn(async move {
                    match endpoint.as_listenable() {
                        Some(listenable) => listenable.listen(token).await,
                        None => Ok(()),
                    }
                });
                match tokio::time::timeout(LISTEN_STARTUP_WINDOW, &mut handle).await {
                    // Exited inside the window: propagate its verdict.
                    Ok(Ok(result)) => result.map_err(|err| {
                        CodeError::internal(format!("endpoint {name:?} failed to listen"))
                            .with_cause(err)
                    }),
                    Ok(Err(join_err)) => Err(CodeError::internal(format!(
                        "endpoint {name:?} listener crashed: {join_err}"
                    ))),
                    // Still running: started.
                    Err(_) => Ok(()),
                }
            });
        }
        for result in join_all(startups).await {
            result?;
        }
        Ok(())
    }

    /// Fans shutdown out to every endpoint, bounded by `timeout`.
    pub async fn shutdown(&self, timeout: Duration) {
        self.shutdown_token.cancel();
        let cohort = join_all(self.registry.endpoints().map(|endpoint| endpoint.shutdown()));
        if tokio::time::timeout(timeout, cohort).await.is_err() {
            warn!("shutdown deadline expired with endpoints still closing");
        }
        self.workers.stop();
    }

    fn finish_span(&self, tracer: &Tracer, span: SpanId, cause: Option<&CodeError>) {
        let tags = match cause {
            None => vec![("succeed".to_string(), "true".to_string())],
            Some(err) => vec![
                ("succeed".to_string(), "false".to_string()),
                ("cause".to_string(), err.name().to_string()),
            ],
        };
        if let Some(tree) = tracer.end(span, tags) {
            match serde_json::to_string(&tree) {
                Ok(tree) => debug!(target: "fns::tracer", tracer = %tracer.id(), %tree),
                Err(_) => {}
            }
        }
    }

    /// Meters an exchange that was collapsed at the transport and never
    /// reached dispatch.
    pub(crate) async fn report_shared(&self, mut metric: Metric, succeed: bool, status: u16) {
        metric.end(None);
        metric.succeed = succeed;
        if !succeed {
            metric.error_code = status;
        }
        metric.mark_shared();
        let endpoint_name = metric.endpoint.clone();
        self.report(&endpoint_name, metric).await;
    }

    async fn report(&self, endpoint_name: &str, metric: Metric) {
        // Reports about the metrics endpoint itself would recurse.
        if endpoint_name == METRICS_ENDPOINT {
            return;
        }
        if let Some(reporter) = self.reporter.get() {
            reporter.report(metric).await;
        }
    }

    fn install_reporter(self: &Arc<Self>, custom: Option<ReportSink>) {
        if let Some(sink) = custom {
            let reporter = Reporter::new(REPORT_QUEUE_CAPACITY, sink);
            let _ = self.reporter.set(Arc::new(reporter));
            return;
        }
        let has_sink = self
            .registry
            .get(METRICS_ENDPOINT, &GetOptions::default())
            .map(|endpoint| endpoint.functions().find(METRICS_REPORT_FN).is_some())
            .unwrap_or(false);
        let reporter = if has_sink {
            let weak = Arc::downgrade(self);
            Reporter::new(
                REPORT_QUEUE_CAPACITY,
                Box::new(move |metric| {
                    let weak = weak.clone();
                    async move {
                        let Some(endpoints) = weak.upgrade() else {
                            return Ok(());
                        };
                        let param = Param::from_value(&metric)?;
                        endpoints
                            .request(
                                None,
                                METRICS_ENDPOINT,
                                METRICS_REPORT_FN,
                                param,
                                RequestOptions::new().internal(),
                            )
                            .await
                            .map(|_| ())
                    }
                    .boxed()
                }),
            )
        } else {
            Reporter::disabled()
        };
        let _ = self.reporter.set(Arc::new(reporter));
    }
}

/// One scheduled unit of work: run one fn against one request and settle
/// the promise, whatever happens inside the body.
struct FnTask {
    endpoints: Arc<Endpoints>,
    handler: Arc<dyn FnHandler>,
    request: Arc<Request>,
    tracer: Arc<Tracer>,
    span: SpanId,
    promise: Promise,
}

impl FnTask {
    async fn run(self) {
        let Self {
            endpoints,
            handler,
            request,
            tracer,
            span,
            promise,
        } = self;

        tracer.mark_begin_handling(span);
        let mut metric = Metric::begin(&request);

        let outcome = std::panic::AssertUnwindSafe(handler.handle(request.clone()))
            .catch_unwind()
            .await;
        let settled: Result<FnResponse, CodeError> = match outcome {
            Ok(Ok(value)) => Ok(FnResponse::new(value)),
            Ok(Err(err)) => Err(err
                .with_meta("endpoint", request.endpoint_name())
                .with_meta("fn", request.fn_name())),
            Err(_) => Err(CodeError::internal("fn panicked")
                .with_meta("endpoint", request.endpoint_name())
                .with_meta("fn", request.fn_name())),
        };

        metric.end(settled.as_ref().err());
        endpoints.finish_span(&tracer, span, settled.as_ref().err());
        endpoints.report(request.endpoint_name(), metric).await;

        match settled {
            Ok(response) => promise.succeed(response),
            Err(err) => promise.fail(err),
        }
    }
}
