//! Request view routing body access through the capture state machine.

use axum::body::{Body, Bytes};
use axum::extract::ConnectInfo;
use axum::http::{request::Parts, uri::Authority, Method, Uri, Version};
use bytes::BytesMut;
use encoding_rs::Encoding;
use http_body_util::BodyExt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::capture::{CaptureState, Phase, StateCell};
use crate::config::FormRequestMode;
use crate::tee::CaptureError;
use crate::types::{protocol_version, Headers, Origin, RequestData};

/// Form parameters a host or an earlier layer already parsed out of the request.
///
/// Insert this into the request extensions when the raw form body has been drained, so
/// [`FormRequestMode::Parameter`] can rebuild an equivalent body for the log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormParameters(pub Vec<(String, String)>);

/// An incoming request as seen by the logging middleware.
///
/// Metadata is read once from the request head. The body is held back until someone
/// accesses it, at which point the capture state decides between handing out the raw
/// stream and buffering it.
#[derive(Debug)]
pub struct RemoteRequest {
    remote: String,
    method: Method,
    uri: Uri,
    version: Version,
    headers: Headers,
    parameters: Option<FormParameters>,
    form_request_mode: FormRequestMode,
    raw: Mutex<Option<Body>>,
    state: StateCell<OnceCell<Bytes>>,
}

impl RemoteRequest {
    pub fn new(parts: &Parts, body: Body, form_request_mode: FormRequestMode) -> Self {
        let remote = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string());

        Self {
            remote,
            method: parts.method.clone(),
            uri: parts.uri.clone(),
            version: parts.version,
            headers: Headers::from(&parts.headers),
            parameters: parts.extensions.get::<FormParameters>().cloned(),
            form_request_mode,
            raw: Mutex::new(Some(body)),
            state: StateCell::new(),
        }
    }

    pub fn origin(&self) -> Origin {
        Origin::Remote
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn scheme(&self) -> &str {
        self.uri.scheme_str().unwrap_or("http")
    }

    fn authority(&self) -> Option<Authority> {
        self.uri.authority().cloned().or_else(|| {
            self.headers
                .first("Host")
                .and_then(|host| Authority::from_str(host).ok())
        })
    }

    /// Host from the request target, else from the `Host` header.
    pub fn host(&self) -> String {
        self.authority()
            .map(|authority| authority.host().to_string())
            .unwrap_or_else(|| "localhost".to_string())
    }

    /// Explicit port, omitted when it is the default for the scheme.
    pub fn port(&self) -> Option<u16> {
        let port = self.authority()?.port_u16()?;
        match (self.scheme(), port) {
            ("http", 80) | ("https", 443) => None,
            _ => Some(port),
        }
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn query(&self) -> &str {
        self.uri.query().unwrap_or("")
    }

    pub fn protocol_version(&self) -> &'static str {
        protocol_version(self.version)
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn charset(&self) -> &'static Encoding {
        self.headers.charset()
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    /// Asks for the body to be captured. No effect once the raw stream was handed out.
    pub fn with_body(&self) -> &Self {
        self.state.with_body();
        self
    }

    pub fn without_body(&self) -> &Self {
        self.state.without_body();
        self
    }

    /// The captured body, empty unless this exchange is buffering.
    ///
    /// This counts as a body access: if nothing touched the body yet, a pending
    /// `with_body` is honoured now by reading the stream into the buffer.
    pub async fn body(&self) -> Result<Bytes, CaptureError> {
        match self.state.expose() {
            CaptureState::Buffering(buffer) => {
                buffer.get_or_try_init(|| self.buffer()).await.cloned()
            }
            _ => Ok(Bytes::new()),
        }
    }

    /// Hands the body stream to the application.
    ///
    /// Passing exchanges get the untouched raw stream. Buffering exchanges get a replay of
    /// the buffer, or the raw stream when a form mode left it unread. If buffering failed,
    /// the frames read before the failure are replayed followed by the original error.
    pub async fn take_body(&self) -> Body {
        let state = self.state.expose();
        if let Some(buffer) = state.buffer() {
            if let Ok(bytes) = buffer.get_or_try_init(|| self.buffer()).await {
                return self.take_raw().unwrap_or_else(|| Body::from(bytes.clone()));
            }
        }
        self.take_raw().unwrap_or_else(Body::empty)
    }

    /// Snapshot for logging; triggers a body access like [`body`](Self::body).
    pub async fn data(&self) -> Result<RequestData, CaptureError> {
        let body = self.body().await?;
        Ok(RequestData {
            origin: self.origin(),
            remote: self.remote.clone(),
            method: self.method.clone(),
            scheme: self.scheme().to_string(),
            host: self.host(),
            port: self.port(),
            path: self.path().to_string(),
            query: self.query().to_string(),
            protocol_version: self.protocol_version().to_string(),
            headers: self.headers.clone(),
            body,
        })
    }

    fn take_raw(&self) -> Option<Body> {
        self.raw.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    fn put_raw(&self, body: Body) {
        *self.raw.lock().unwrap_or_else(PoisonError::into_inner) = Some(body);
    }

    fn is_form_request(&self) -> bool {
        self.headers.content_type().is_some_and(|content_type| {
            content_type.type_() == mime::APPLICATION
                && content_type.subtype() == mime::WWW_FORM_URLENCODED
        })
    }

    async fn buffer(&self) -> Result<Bytes, CaptureError> {
        if self.is_form_request() {
            match self.form_request_mode {
                FormRequestMode::Parameter => return Ok(self.reconstruct_form()),
                FormRequestMode::Off => return Ok(Bytes::new()),
                FormRequestMode::On => {}
            }
        }

        // A failed read already gave its frames back to the application.
        if self.state.phase() == Phase::Passing {
            return Err(CaptureError::Consumed);
        }
        let mut raw = self.take_raw().ok_or(CaptureError::Consumed)?;

        let mut chunks = Vec::new();
        while let Some(frame) = raw.frame().await {
            match frame {
                Ok(frame) => {
                    if let Ok(data) = frame.into_data() {
                        chunks.push(data);
                    }
                }
                Err(e) => {
                    let error = CaptureError::Stream(e.to_string());
                    debug!(error = %e, "Request body read failed, replaying to application");
                    self.put_raw(replay(chunks, e));
                    self.state.abandon();
                    return Err(error);
                }
            }
        }
        Ok(concat(chunks))
    }

    /// Rebuilds a form body from parsed parameters. Equivalent, not byte-identical: order
    /// and percent-escaping follow the parameters, not the original wire bytes.
    fn reconstruct_form(&self) -> Bytes {
        let Some(FormParameters(pairs)) = &self.parameters else {
            return Bytes::new();
        };
        url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish()
            .into()
    }
}

fn concat(mut chunks: Vec<Bytes>) -> Bytes {
    if chunks.len() == 1 {
        return chunks.remove(0);
    }
    let mut buffer = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
    for chunk in chunks {
        buffer.extend_from_slice(&chunk);
    }
    buffer.freeze()
}

fn replay(chunks: Vec<Bytes>, error: axum::Error) -> Body {
    let frames = chunks
        .into_iter()
        .map(Ok)
        .chain(std::iter::once(Err(error)));
    Body::from_stream(futures::stream::iter(frames))
}
