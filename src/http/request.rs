//! Outbound request construction.
//!
//! # Responsibilities
//! - Build the upstream request from the inbound one: target path, injected
//!   headers, forwarded-for headers, hop-by-hop stripping
//! - Hold the request body back until an upstream `100 Continue` when the
//!   client asked for one
//!
//! # Design Decisions
//! - The body is streamed, never buffered
//! - Injected headers win over inbound headers of the same name
//! - Path segments are percent-encoded only when they need it; matrix
//!   parameters and the query string pass through verbatim

use axum::body::Body;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::request::Parts;
use axum::http::{Request, Version};
use bytes::Bytes;
use http_body::{Body as HttpBody, Frame, SizeHint};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use std::borrow::Cow;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::watch;

use crate::config::ProxySettingsConfig;
use crate::error::ProxyError;
use crate::http::attribute::{AttributeContext, AttributeResolver, TemplateAttribute};
use crate::http::exchange::TlsSessionInfo;
use crate::load_balancer::backend::BackendTarget;

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
pub const X_FORWARDED_PORT: HeaderName = HeaderName::from_static("x-forwarded-port");
pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Bytes that may not appear raw in a path segment. `%` is absent: inbound
/// paths are already encoded.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'|')
    .add(b'^')
    .add(b'\\');

/// Progress of an `Expect: 100-continue` hand-shake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Waiting,
    Open,
    /// Upstream answered without asking for the body.
    Abandoned,
}

/// Releases a held-back request body.
#[derive(Debug, Clone)]
pub struct ContinueGate {
    state: Arc<watch::Sender<GateState>>,
}

/// Handle that can open the gate without keeping it alive.
#[derive(Debug, Clone)]
pub struct WeakContinueGate(Weak<watch::Sender<GateState>>);

impl ContinueGate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(GateState::Waiting);
        Self { state: Arc::new(tx) }
    }

    pub fn state(&self) -> GateState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == GateState::Open
    }

    pub fn open(&self) {
        self.settle(GateState::Open);
    }

    pub fn abandon(&self) {
        self.settle(GateState::Abandoned);
    }

    fn settle(&self, next: GateState) {
        self.state.send_if_modified(|state| {
            if *state == GateState::Waiting {
                *state = next;
                true
            } else {
                false
            }
        });
    }

    pub fn downgrade(&self) -> WeakContinueGate {
        WeakContinueGate(Arc::downgrade(&self.state))
    }

    /// Wrap `body` so it is only read once the gate opens.
    ///
    /// An abandoned gate keeps the body pending until every strong handle is
    /// dropped, then fails it; the upstream connection is not reused.
    pub fn hold(&self, body: Body) -> Body {
        let mut rx = self.state.subscribe();
        let opened = async move {
            let state = match rx.wait_for(|state| *state != GateState::Waiting).await {
                Ok(state) => *state,
                Err(_) => return false,
            };
            if state == GateState::Open {
                return true;
            }
            while rx.changed().await.is_ok() {}
            false
        };
        Body::new(GatedBody {
            inner: body,
            opened: Some(Box::pin(opened)),
        })
    }
}

impl Default for ContinueGate {
    fn default() -> Self {
        Self::new()
    }
}

impl WeakContinueGate {
    pub fn open(&self) {
        if let Some(state) = self.0.upgrade() {
            ContinueGate { state }.open();
        }
    }
}

struct GatedBody {
    inner: Body,
    opened: Option<Pin<Box<dyn Future<Output = bool> + Send>>>,
}

impl HttpBody for GatedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, axum::Error>>> {
        if let Some(opened) = self.opened.as_mut() {
            match opened.as_mut().poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(true) => self.opened = None,
                Poll::Ready(false) => {
                    return Poll::Ready(Some(Err(axum::Error::new(
                        "upstream responded before 100-continue",
                    ))));
                }
            }
        }
        Pin::new(&mut self.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.opened.is_none() && self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Header rewriting applied to every outbound request.
#[derive(Debug, Clone, Default)]
pub struct RequestRewrite {
    pub rewrite_host: bool,
    pub reuse_x_forwarded: bool,
    pub headers: Vec<(HeaderName, TemplateAttribute)>,
}

impl RequestRewrite {
    pub fn from_config(config: &ProxySettingsConfig) -> Self {
        let headers = config
            .request_headers
            .iter()
            .filter_map(|(name, template)| match HeaderName::try_from(name.as_str()) {
                Ok(name) => Some((name, TemplateAttribute::parse(template))),
                Err(_) => {
                    tracing::warn!(header = %name, "Ignoring invalid request header name");
                    None
                }
            })
            .collect();
        Self {
            rewrite_host: config.rewrite_host_header,
            reuse_x_forwarded: config.reuse_existing_x_forwarded_for,
            headers,
        }
    }
}

/// Downstream facts the outbound request is built from.
#[derive(Debug, Clone, Copy)]
pub struct ForwardContext<'a> {
    pub remote_addr: std::net::SocketAddr,
    pub local_port: Option<u16>,
    pub scheme: &'a str,
    pub relative_path: &'a str,
    pub request_id: Option<&'a str>,
    pub tls: Option<&'a TlsSessionInfo>,
}

/// Whether the request asks to switch protocols.
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers.contains_key(header::UPGRADE) && connection_has(headers, "upgrade")
}

pub fn expects_continue(headers: &HeaderMap) -> bool {
    headers
        .get(header::EXPECT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("100-continue"))
}

fn connection_has(headers: &HeaderMap, token: &str) -> bool {
    connection_tokens(headers).any(|t| t.eq_ignore_ascii_case(token))
}

fn connection_tokens(headers: &HeaderMap) -> impl Iterator<Item = &str> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Remove hop-by-hop headers in place. `keep_upgrade` preserves the
/// `Connection`/`Upgrade` pair of a protocol switch.
pub fn strip_hop_by_hop(headers: &mut HeaderMap, keep_upgrade: bool) {
    let listed: Vec<HeaderName> = connection_tokens(headers)
        .filter(|token| !(keep_upgrade && token.eq_ignore_ascii_case("upgrade")))
        .filter_map(|token| HeaderName::try_from(token).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }

    let trailers = headers
        .get(header::TE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.split(',').any(|t| t.trim().eq_ignore_ascii_case("trailers")));

    for name in ["keep-alive", "proxy-connection", "proxy-authenticate", "proxy-authorization"] {
        headers.remove(name);
    }
    headers.remove(header::TRANSFER_ENCODING);
    headers.remove(header::TE);
    if trailers {
        headers.insert(header::TE, HeaderValue::from_static("trailers"));
    }
    if keep_upgrade {
        headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
    } else {
        headers.remove(header::CONNECTION);
        headers.remove(header::UPGRADE);
    }
}

/// Percent-encode what needs it; returns the input when nothing does.
pub fn encode_path(path: &str) -> Cow<'_, str> {
    utf8_percent_encode(path, PATH_SEGMENT).into()
}

/// Path and query sent upstream: the target's base path followed by the
/// exchange's relative path.
pub fn outbound_path(base_path: &str, relative: &str, query: Option<&str>) -> String {
    let relative = encode_path(relative);
    let mut path = String::with_capacity(base_path.len() + relative.len() + 1);
    path.push_str(base_path.trim_end_matches('/'));
    if !relative.starts_with('/') {
        path.push('/');
    }
    path.push_str(&relative);
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        path.push('?');
        path.push_str(query);
    }
    path
}

fn client_address(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => format!("[{v6}]"),
        },
    }
}

/// Host header without a port; IPv6 literals keep their brackets.
fn host_without_port(host: &str) -> &str {
    if host.starts_with('[') {
        return host.find(']').map_or(host, |end| &host[..=end]);
    }
    host.rsplit_once(':').map_or(host, |(name, _)| name)
}

fn host_port(host: &str) -> Option<u16> {
    let after = if host.starts_with('[') {
        &host[host.find(']')? + 1..]
    } else {
        host
    };
    after.rsplit_once(':')?.1.parse().ok()
}

fn header_value(value: &str) -> Result<HeaderValue, ProxyError> {
    HeaderValue::try_from(value).map_err(|_| ProxyError::InvalidRequest(format!("invalid header value: {value}")))
}

/// Build the upstream request. Consumes the inbound body.
pub fn build_outbound(
    inbound: &Parts,
    body: Body,
    target: &BackendTarget,
    ctx: &ForwardContext<'_>,
    rewrite: &RequestRewrite,
    gate: Option<&ContinueGate>,
) -> Result<Request<Body>, ProxyError> {
    let upgrade = is_upgrade_request(&inbound.headers);
    let inbound_host = inbound
        .headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| inbound.uri.authority().map(|a| a.to_string()));

    let mut headers = HeaderMap::with_capacity(inbound.headers.len() + rewrite.headers.len() + 4);

    let attributes = AttributeContext {
        remote_addr: ctx.remote_addr,
        request_id: ctx.request_id,
        host: inbound_host.as_deref(),
        method: inbound.method.as_str(),
        path: inbound.uri.path(),
        scheme: ctx.scheme,
    };
    for (name, template) in &rewrite.headers {
        headers.insert(name.clone(), header_value(&template.resolve(&attributes))?);
    }

    for (name, value) in inbound.headers.iter() {
        if rewrite.headers.iter().any(|(injected, _)| injected == name) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    strip_hop_by_hop(&mut headers, upgrade);

    let client = client_address(ctx.remote_addr.ip());
    let existing_xff = headers
        .get_all(&X_FORWARDED_FOR)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect::<Vec<_>>()
        .join(", ");
    let xff = if rewrite.reuse_x_forwarded && !existing_xff.is_empty() {
        format!("{existing_xff}, {client}")
    } else {
        client
    };
    headers.insert(X_FORWARDED_FOR, header_value(&xff)?);

    let keep_existing = |headers: &HeaderMap, name: &HeaderName| rewrite.reuse_x_forwarded && headers.contains_key(name);
    if !keep_existing(&headers, &X_FORWARDED_PROTO) {
        headers.insert(X_FORWARDED_PROTO, header_value(ctx.scheme)?);
    }
    if let Some(host) = inbound_host.as_deref() {
        if !keep_existing(&headers, &X_FORWARDED_HOST) {
            headers.insert(X_FORWARDED_HOST, header_value(host_without_port(host))?);
        }
    }
    if !keep_existing(&headers, &X_FORWARDED_PORT) {
        let default_port = if ctx.scheme == "https" { 443 } else { 80 };
        let port = inbound_host
            .as_deref()
            .and_then(host_port)
            .or(ctx.local_port)
            .unwrap_or(default_port);
        headers.insert(X_FORWARDED_PORT, HeaderValue::from(port));
    }

    if rewrite.rewrite_host || !headers.contains_key(header::HOST) {
        headers.insert(header::HOST, header_value(&target.authority())?);
    }

    let path = outbound_path(target.base_path(), ctx.relative_path, inbound.uri.query());
    let body = match gate {
        Some(gate) => gate.hold(body),
        None => body,
    };

    let mut request = Request::builder()
        .method(inbound.method.clone())
        .uri(path.as_str())
        .version(Version::HTTP_11)
        .body(body)
        .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;
    *request.headers_mut() = headers;
    if let Some(tls) = ctx.tls {
        request.extensions_mut().insert(tls.clone());
    }
    if let Some(gate) = gate {
        request.extensions_mut().insert(gate.downgrade());
    }
    Ok(request)
}
