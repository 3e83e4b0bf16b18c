//! Per-call metric records and the off-hot-path reporter.
//!
//! Every fn invocation produces one [`Metric`]: begin stamped at dispatch,
//! outcome and latency filled when the task settles. Records are pushed
//! through a bounded queue with a short-deadline send so the hot path can
//! never stall on reporting; under saturation records are dropped. A
//! dedicated listener drains the queue and forwards each record to the
//! configured sink, swallowing failures. A panicking sink is logged and the
//! listener continues.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::errors::CodeError;
use crate::request::Request;

/// How long the hot path will wait on a full report queue.
const REPORT_SEND_BUDGET: Duration = Duration::from_millis(10);

/// Timing and outcome of one fn invocation.
#[derive(Clone, Debug, Serialize)]
pub struct Metric {
    pub endpoint: String,
    #[serde(rename = "fn")]
    pub fn_name: String,
    /// Microseconds between begin and end.
    pub latency: u64,
    pub succeed: bool,
    #[serde(skip_serializing_if = "is_zero")]
    pub error_code: u16,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error_name: String,
    pub device_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub device_ip: String,
    /// Unix milliseconds at begin.
    pub beg: u64,
    /// True when the result was shared from a collapsed execution.
    pub shared: bool,
    #[serde(skip)]
    beg_instant: Option<Instant>,
}

fn is_zero(code: &u16) -> bool {
    *code == 0
}

impl Metric {
    /// Stamps the begin of an invocation.
    pub fn begin(request: &Request) -> Self {
        let header = request.header();
        Self {
            endpoint: request.endpoint_name().to_string(),
            fn_name: request.fn_name().to_string(),
            latency: 0,
            succeed: false,
            error_code: 0,
            error_name: String::new(),
            device_id: header.device_id.clone(),
            device_ip: header.device_ip.clone().unwrap_or_default(),
            beg: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            shared: false,
            beg_instant: Some(Instant::now()),
        }
    }

    /// Stamps the begin of an exchange observed at the transport, before a
    /// request value exists.
    pub fn collapsed(
        endpoint: &str,
        fn_name: &str,
        device_id: &str,
        device_ip: Option<&str>,
    ) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            fn_name: fn_name.to_string(),
            latency: 0,
            succeed: false,
            error_code: 0,
            error_name: String::new(),
            device_id: device_id.to_string(),
            device_ip: device_ip.unwrap_or_default().to_string(),
            beg: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            shared: false,
            beg_instant: Some(Instant::now()),
        }
    }

    /// Fills latency and outcome. `cause` present means failure.
    pub fn end(&mut self, cause: Option<&CodeError>) {
        self.latency = self
            .beg_instant
            .map(|beg| beg.elapsed().as_micros() as u64)
            .unwrap_or(0);
        match cause {
            None => {
                self.succeed = true;
            }
            Some(err) => {
                self.succeed = false;
                self.error_code = err.code();
                self.error_name = err.name().to_string();
            }
        }
    }

    /// Marks the record as served from a collapsed execution.
    pub fn mark_shared(&mut self) {
        self.shared = true;
    }

    /// The record as forwarded to the metrics endpoint.
    pub fn to_report(&self) -> BTreeMap<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map.into_iter().collect(),
            _ => BTreeMap::new(),
        }
    }
}

/// Where drained records go, typically an internal request to the
/// deployed metrics endpoint.
pub type ReportSink =
    Box<dyn Fn(Metric) -> BoxFuture<'static, Result<(), CodeError>> + Send + Sync>;

/// The bounded report queue plus its drain listener.
pub struct Reporter {
    tx: mpsc::Sender<Metric>,
}

impl Reporter {
    /// Creates the queue and spawns the drain listener.
    pub fn new(capacity: usize, sink: ReportSink) -> Self {
        let (tx, mut rx) = mpsc::channel::<Metric>(capacity.max(1));
        tokio::spawn(async move {
            while let Some(metric) = rx.recv().await {
                let forwarded = std::panic::AssertUnwindSafe(sink(metric))
                    .catch_unwind()
                    .await;
                match forwarded {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        // Best effort: a failed report never fails a request.
                        debug!(error = %err, "metric report failed");
                    }
                    Err(_) => {
                        error!("metric report sink panicked");
                    }
                }
            }
        });
        Self { tx }
    }

    /// A reporter that drops everything, for processes without a metrics
    /// endpoint.
    pub fn disabled() -> Self {
        Self::new(1, Box::new(|_metric| async { Ok::<(), CodeError>(()) }.boxed()))
    }

    /// Enqueues a record, waiting at most a few milliseconds.
    pub async fn report(&self, metric: Metric) {
        if let Err(err) = self.tx.send_timeout(metric, REPORT_SEND_BUDGET).await {
            debug!(error = %err, "metric report dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::Param;
    use crate::request::RequestOptions;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request() -> Arc<Request> {
        Request::acquire(
            None,
            "users",
            "get",
            Param::Empty,
            RequestOptions::new().device_id("d-1").device_ip("10.1.1.1"),
        )
        .unwrap()
    }

    #[test]
    fn end_fills_outcome() {
        let mut metric = Metric::begin(&request());
        metric.end(None);
        assert!(metric.succeed);
        assert_eq!(metric.error_code, 0);

        let mut metric = Metric::begin(&request());
        metric.end(Some(&CodeError::timeout("late")));
        assert!(!metric.succeed);
        assert_eq!(metric.error_code, 408);
        assert_eq!(metric.error_name, "***TIMEOUT***");
    }

    #[tokio::test]
    async fn reporter_forwards_records() {
        let seen = Arc::new(AtomicUsize::new(0));
        let sink_seen = seen.clone();
        let reporter = Reporter::new(
            16,
            Box::new(move |_metric| {
                let seen = sink_seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), CodeError>(())
                }
                .boxed()
            }),
        );
        for _ in 0..4 {
            reporter.report(Metric::begin(&request())).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn panicking_sink_does_not_stop_the_listener() {
        let seen = Arc::new(AtomicUsize::new(0));
        let sink_seen = seen.clone();
        let reporter = Reporter::new(
            16,
            Box::new(move |metric| {
                let seen = sink_seen.clone();
                async move {
                    if metric.shared {
                        panic!("boom");
                    }
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), CodeError>(())
                }
                .boxed()
            }),
        );
        let mut poisoned = Metric::begin(&request());
        poisoned.mark_shared();
        reporter.report(poisoned).await;
        reporter.report(Metric::begin(&request())).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
