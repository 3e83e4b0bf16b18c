//! The HTTP mux: `/{endpoint}/{fn}` URLs become dispatched fn invocations.
//!
//! The mux owns the whole external surface. It parses the two-segment path,
//! enforces the match policy (GET only for readonly fns, POST only with a
//! JSON content type, nothing internal), maps the `X-Fns-*` headers into a
//! request, collapses identical concurrent requests, and writes the JSON
//! reply with the response headers every reply carries.
//!
//! A request moves through `parsed -> matched -> dispatched -> awaited ->
//! written`; anything that fails before dispatch is rejected with a coded
//! 4xx body and never consumes a worker slot.

use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderValue, Method, StatusCode};
use http_body_util::BodyExt;
use tokio::time::Instant;

use crate::body::FnsBody;
use crate::endpoints::Endpoints;
use crate::errors::CodeError;
use crate::param::Param;
use crate::request::{RequestOptions, seeded_hasher};
use crate::singleflight::Group;
use crate::types::HttpResponse;
use crate::versions::RequestVersions;

/// Required on externally originated calls.
pub const HEADER_DEVICE_ID: &str = "X-Fns-Device-Id";
/// Optional caller address; transport fallbacks apply.
pub const HEADER_DEVICE_IP: &str = "X-Fns-Device-Ip";
/// Stable id of one logical request; generated when absent.
pub const HEADER_REQUEST_ID: &str = "X-Fns-Request-Id";
/// Version interval set, `name=low:high` pairs.
pub const HEADER_REQUEST_VERSION: &str = "X-Fns-Request-Version";
/// Deadline for the whole invocation, integer milliseconds.
pub const HEADER_REQUEST_TIMEOUT: &str = "X-Fns-Request-Timeout";
/// Replied: the instance that served the call.
pub const HEADER_ENDPOINT_ID: &str = "X-Fns-Endpoint-Id";
/// Replied: the serving instance's version.
pub const HEADER_ENDPOINT_VERSION: &str = "X-Fns-Endpoint-Version";
/// Replied: wall time between match and write.
pub const HEADER_HANDLE_LATENCY: &str = "X-Fns-Handle-Latency";

const SERVER_NAME: &str = "FNS";
const CONTENT_TYPE_JSON: &str = "application/json";
const DOCUMENTS_PATH: &str = "/documents";

/// Status and body shared between collapsed callers.
#[derive(Clone)]
struct Written {
    status: StatusCode,
    body: Bytes,
}

/// The external surface of one [`Endpoints`] manager.
pub struct FnsHandler {
    endpoints: Arc<Endpoints>,
    group: Group<Written>,
}

impl FnsHandler {
    pub fn new(endpoints: Arc<Endpoints>) -> Self {
        Self {
            endpoints,
            group: Group::new(),
        }
    }

    /// Serves one HTTP exchange. Never errors; failures become coded
    /// bodies.
    pub async fn dispatch<B>(&self, req: hyper::Request<B>) -> HttpResponse
    where
        B: hyper::body::Body + Send + 'static,
        B::Data: Send,
    {
        let started = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        if method == Method::GET
            && path == DOCUMENTS_PATH
            && self.endpoints.transport().documents
        {
            return self.write(
                StatusCode::OK,
                self.endpoints.documents().to_json(),
                None,
                started,
            );
        }

        match self.handle(req, &method, &path, started).await {
            Ok(response) => response,
            Err((err, request_id)) => self.write(
                err.status(),
                err.to_json(),
                request_id.as_deref(),
                started,
            ),
        }
    }

    async fn handle<B>(
        &self,
        req: hyper::Request<B>,
        method: &Method,
        path: &str,
        started: Instant,
    ) -> Result<HttpResponse, (CodeError, Option<String>)>
    where
        B: hyper::body::Body + Send + 'static,
        B::Data: Send,
    {
        let (endpoint_name, fn_name) = parse_path(path).map_err(|err| (err, None))?;

        // Match against the discovery snapshot before anything is spent on
        // the request. Internal surfaces and version misses look identical
        // to absent ones.
        let snapshot = self.endpoints.documents().get();
        let matched = snapshot
            .iter()
            .find(|info| info.name == endpoint_name)
            .filter(|info| !info.internal)
            .and_then(|info| info.fn_info(&fn_name))
            .filter(|fn_info| !fn_info.internal);
        let Some(fn_info) = matched else {
            return Err((
                CodeError::not_found("fn was not found").with_meta("path", path),
                None,
            ));
        };
        match *method {
            Method::GET => {
                if !fn_info.readonly {
                    return Err((
                        CodeError::not_found("fn was not found").with_meta("path", path),
                        None,
                    ));
                }
            }
            Method::POST => {
                let json = req
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|ct| ct.to_str().ok())
                    .map(|ct| ct.starts_with(CONTENT_TYPE_JSON))
                    .unwrap_or(false);
                if !json {
                    return Err((
                        CodeError::bad_request("content type must be application/json")
                            .with_meta("path", path),
                        None,
                    ));
                }
            }
            _ => {
                return Err((
                    CodeError::bad_request("method must be GET or POST").with_meta("path", path),
                    None,
                ));
            }
        }

        let Some(device_id) = header_string(&req, HEADER_DEVICE_ID) else {
            return Err((
                CodeError::not_acceptable("device id is required").with_meta("path", path),
                None,
            ));
        };
        let device_ip = client_ip(&req);
        let request_id = header_string(&req, HEADER_REQUEST_ID)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let versions = match header_string(&req, HEADER_REQUEST_VERSION) {
            Some(raw) => RequestVersions::parse(&raw).map_err(|err| {
                (
                    CodeError::not_acceptable(format!("request version is malformed: {err}"))
                        .with_meta("path", path),
                    Some(request_id.clone()),
                )
            })?,
            None => RequestVersions::none(),
        };
        let deadline = match header_string(&req, HEADER_REQUEST_TIMEOUT) {
            Some(raw) => match raw.parse::<u64>() {
                Ok(ms) if ms > 0 => Some(Instant::now() + Duration::from_millis(ms)),
                _ => {
                    return Err((
                        CodeError::bad_request("request timeout must be integer milliseconds")
                            .with_meta("path", path),
                        Some(request_id),
                    ));
                }
            },
            None => None,
        };
        let token = req
            .headers()
            .get(AUTHORIZATION)
            .map(|v| Bytes::copy_from_slice(v.as_bytes()));

        let payload = match *method {
            Method::GET => Bytes::copy_from_slice(req.uri().query().unwrap_or("").as_bytes()),
            _ => match req.into_body().collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(_) => {
                    return Err((
                        CodeError::bad_request("request body could not be read")
                            .with_meta("path", path),
                        Some(request_id),
                    ));
                }
            },
        };
        let param = if *method == Method::GET {
            Param::from_query(std::str::from_utf8(&payload).unwrap_or(""))
        } else {
            Param::from_json(payload.clone())
        };

        // Identical concurrent exchanges collapse locally before a single
        // worker slot is reserved for them.
        let key = collapse_key(path, &device_id, &versions, token.as_deref(), &payload);
        let collapsed = crate::metrics::Metric::collapsed(
            &endpoint_name,
            &fn_name,
            &device_id,
            device_ip.as_deref(),
        );
        let (written, shared) = self
            .group
            .run(key, || {
                let endpoints = self.endpoints.clone();
                let endpoint_name = endpoint_name.clone();
                let fn_name = fn_name.clone();
                let request_id = request_id.clone();
                let versions = versions.clone();
                async move {
                    let mut options = RequestOptions::new()
                        .request_id(request_id)
                        .device_id(device_id)
                        .accepted_versions(versions);
                    if let Some(ip) = device_ip {
                        options = options.device_ip(ip);
                    }
                    if let Some(token) = token {
                        options = options.token(token);
                    }
                    if let Some(deadline) = deadline {
                        options = options.deadline(deadline);
                    }
                    let written = match endpoints
                        .request(None, &endpoint_name, &fn_name, param, options)
                        .await
                    {
                        Ok(response) => Written {
                            status: StatusCode::OK,
                            body: response.to_json().unwrap_or_else(|err| err.to_json()),
                        },
                        Err(err) => Written {
                            status: err.status(),
                            body: err.to_json(),
                        },
                    };
                    Ok(written)
                }
            })
            .await;

        let written = written.map_err(|err| (err, Some(request_id.clone())))?;
        if shared {
            self.endpoints
                .report_shared(
                    collapsed,
                    written.status.is_success(),
                    written.status.as_u16(),
                )
                .await;
        }
        Ok(self.write(written.status, written.body, Some(&request_id), started))
    }

    /// Stamps the response headers every reply carries.
    fn write(
        &self,
        status: StatusCode,
        body: Bytes,
        request_id: Option<&str>,
        started: Instant,
    ) -> HttpResponse {
        let mut builder = hyper::Response::builder()
            .status(status)
            .header(CONTENT_TYPE, CONTENT_TYPE_JSON)
            .header(http::header::SERVER, SERVER_NAME)
            .header(HEADER_ENDPOINT_ID, self.endpoints.id())
            .header(HEADER_ENDPOINT_VERSION, self.endpoints.version().to_string())
            .header(
                HEADER_HANDLE_LATENCY,
                format!("{:?}", started.elapsed()),
            );
        if let Some(request_id) = request_id {
            if let Ok(value) = HeaderValue::from_str(request_id) {
                builder = builder.header(HEADER_REQUEST_ID, value);
            }
        }
        match builder.body(FnsBody::from(body)) {
            Ok(response) => response,
            Err(_) => {
                let mut response = hyper::Response::new(FnsBody::empty());
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response
            }
        }
    }
}

/// Splits `/{endpoint}/{fn}` into its two non-empty segments.
fn parse_path(path: &str) -> Result<(String, String), CodeError> {
    let mut segments = path.trim_matches('/').split('/');
    let endpoint = segments.next().unwrap_or("");
    let fn_name = segments.next().unwrap_or("");
    if endpoint.is_empty() || fn_name.is_empty() || segments.next().is_some() {
        return Err(
            CodeError::bad_request("path must be /{endpoint}/{fn}").with_meta("path", path)
        );
    }
    Ok((endpoint.to_string(), fn_name.to_string()))
}

fn header_string<B>(req: &hyper::Request<B>, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Resolves the caller address: explicit header, proxy headers, then the
/// connection peer.
fn client_ip<B>(req: &hyper::Request<B>) -> Option<String> {
    if let Some(ip) = header_string(req, HEADER_DEVICE_IP) {
        return Some(ip);
    }
    if let Some(forwarded) = header_string(req, "X-Forwarded-For") {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return Some(first.to_string());
            }
        }
    }
    if let Some(real) = header_string(req, "X-Real-Ip") {
        return Some(real);
    }
    req.extensions()
        .get::<SocketAddr>()
        .map(|addr| addr.ip().to_string())
}

fn collapse_key(
    path: &str,
    device_id: &str,
    versions: &RequestVersions,
    token: Option<&[u8]>,
    payload: &[u8],
) -> u64 {
    let mut hasher = seeded_hasher();
    path.hash(&mut hasher);
    device_id.hash(&mut hasher);
    versions.to_string().hash(&mut hasher);
    token.unwrap_or_default().hash(&mut hasher);
    payload.hash(&mut hasher);
    hasher.finish()
}
