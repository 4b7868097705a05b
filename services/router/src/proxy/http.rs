//! HTTP forwarding path.
//!
//! Every inbound request resolves its own target, so consecutive requests on
//! one keep-alive connection may land on different backends. Any failure
//! before the response is committed becomes a `502 Bad Gateway` whose body is
//! the failure message.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Body as _, Frame, Incoming};
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use reqwest::{Client, Url};
use tracing::debug;

use super::listen::ListenScheme;
use super::listener::BoxConn;
use super::server::{Proxy, ProxyOptions, ResponseHead};
use crate::error::ProxyError;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Response body produced by the proxy.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_PORT: HeaderName = HeaderName::from_static("x-forwarded-port");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Headers scoped to a single connection; never copied from backend responses.
const HOP_BY_HOP: [HeaderName; 6] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
];

/// Request-level reverse proxy for `http` and `https` listeners.
pub(crate) struct HttpForwarder {
    client: Client,
    forwarded_port: HeaderValue,
    forwarded_proto: HeaderValue,
    response_head: ResponseHead,
}

impl HttpForwarder {
    pub(crate) fn new(
        options: &ProxyOptions,
        scheme: ListenScheme,
        advertised_port: u16,
    ) -> Result<Self, ProxyError> {
        // Failures are never retried and redirects go back to the caller.
        // Header names go out title-cased (`X-Forwarded-For`) for backends
        // that match them byte-for-byte.
        let mut builder = Client::builder()
            .no_proxy()
            .http1_title_case_headers()
            .redirect(reqwest::redirect::Policy::none());
        if let Some(timeout) = options.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }

        Ok(Self {
            client: builder.build()?,
            forwarded_port: HeaderValue::from(advertised_port),
            forwarded_proto: HeaderValue::from_static(scheme.as_str()),
            response_head: options.response_head,
        })
    }

    /// Drive one inbound HTTP/1 connection until the client goes away.
    pub(crate) async fn serve_connection(
        self: Arc<Self>,
        proxy: Arc<Proxy>,
        conn: BoxConn,
        peer_addr: SocketAddr,
    ) -> anyhow::Result<()> {
        let service = service_fn(move |req| {
            let forwarder = Arc::clone(&self);
            let proxy = Arc::clone(&proxy);
            async move { Ok::<_, Infallible>(forwarder.forward(&proxy, req, peer_addr).await) }
        });

        http1::Builder::new()
            .serve_connection(TokioIo::new(conn), service)
            .await
            .context("http connection")
    }

    /// Forward one request to a freshly resolved target.
    pub(crate) async fn forward(
        &self,
        proxy: &Proxy,
        req: Request<Incoming>,
        peer_addr: SocketAddr,
    ) -> Response<ProxyBody> {
        let target = match proxy.resolver().resolve().await {
            Ok(target) => target,
            Err(e) => {
                proxy
                    .stats_handle()
                    .resolve_failed
                    .fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "Target resolution failed");
                return bad_gateway(format!("{e:#}"));
            }
        };

        let outbound = self.outbound_request(req, &target, peer_addr);

        let response = match self.client.execute(outbound).await {
            Ok(response) => response,
            Err(e) => {
                proxy
                    .stats_handle()
                    .backend_failed
                    .fetch_add(1, Ordering::Relaxed);
                debug!(target = %target, error = %e, "Backend request failed");
                return bad_gateway(e.to_string());
            }
        };

        debug!(target = %target, status = %response.status(), "Backend responded");

        self.relay_response(response).await
    }

    fn outbound_request(
        &self,
        req: Request<Incoming>,
        target: &Url,
        peer_addr: SocketAddr,
    ) -> reqwest::Request {
        let (parts, body) = req.into_parts();
        let mut outbound = reqwest::Request::new(parts.method, target.clone());

        let headers = outbound.headers_mut();
        copy_request_headers(&parts.headers, headers);
        append_forwarding_headers(
            headers,
            peer_addr,
            &self.forwarded_port,
            &self.forwarded_proto,
        );

        if !body.is_end_stream() {
            *outbound.body_mut() = Some(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        outbound
    }

    /// Stream the backend body back to the caller.
    ///
    /// The first chunk is read before the response is committed so that a
    /// failure with nothing yet sent still becomes a 502.
    async fn relay_response(&self, response: reqwest::Response) -> Response<ProxyBody> {
        let status = response.status();
        let backend_headers = response.headers().clone();

        let mut chunks = Box::pin(response.bytes_stream());
        let first = match chunks.next().await {
            Some(Ok(chunk)) => Some(chunk),
            Some(Err(e)) => {
                debug!(error = %e, "Backend body failed before first byte");
                return bad_gateway(e.to_string());
            }
            None => None,
        };

        let frames = stream::iter(first.map(Ok::<Bytes, reqwest::Error>))
            .chain(chunks)
            .map(|chunk| {
                chunk
                    .map(Frame::data)
                    .map_err(|e| -> BoxError { Box::new(e) })
            });

        let mut out = Response::new(StreamBody::new(frames).boxed_unsync());
        if self.response_head == ResponseHead::Passthrough {
            *out.status_mut() = status;
            copy_response_headers(&backend_headers, out.headers_mut());
        }
        out
    }
}

/// Copy every inbound header, keeping repeated values in order. The outbound
/// `Host` comes from the target URL.
fn copy_request_headers(from: &HeaderMap, to: &mut HeaderMap) {
    for (name, value) in from {
        if name == header::HOST {
            continue;
        }
        to.append(name.clone(), value.clone());
    }
}

/// `X-Forwarded-For` extends any existing chain; port and proto overwrite.
fn append_forwarding_headers(
    headers: &mut HeaderMap,
    peer_addr: SocketAddr,
    port: &HeaderValue,
    proto: &HeaderValue,
) {
    if let Ok(peer) = HeaderValue::from_str(&peer_addr.to_string()) {
        headers.append(X_FORWARDED_FOR, peer);
    }
    headers.insert(X_FORWARDED_PORT, port.clone());
    headers.insert(X_FORWARDED_PROTO, proto.clone());
}

fn copy_response_headers(from: &HeaderMap, to: &mut HeaderMap) {
    for (name, value) in from {
        if HOP_BY_HOP.contains(name) {
            continue;
        }
        to.append(name.clone(), value.clone());
    }
}

/// Plain-text 502 carrying the failure message.
pub fn bad_gateway(message: impl Into<String>) -> Response<ProxyBody> {
    let mut body = message.into();
    body.push('\n');

    let mut response = Response::new(
        Full::new(Bytes::from(body))
            .map_err(|never| match never {})
            .boxed_unsync(),
    );
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    response
}
