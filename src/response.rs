//! Response view routing the outgoing body through the capture state machine.

use axum::body::{Body, Bytes};
use axum::http::{response::Parts, StatusCode, Version};
use encoding_rs::Encoding;
use std::sync::{Mutex, PoisonError};

use crate::capture::{CaptureState, Phase, StateCell};
use crate::tee::{Capture, CaptureError, Tee};
use crate::types::{protocol_version, Headers, Origin, ResponseData};

/// A response produced by this process, as seen by the logging middleware.
///
/// When buffering, the body handed back to the host is a [`Tee`]: every frame the host
/// pulls for the client is copied into the capture on its way out.
#[derive(Debug)]
pub struct LocalResponse {
    status: StatusCode,
    version: Version,
    headers: Headers,
    raw: Mutex<Option<Body>>,
    state: StateCell<Capture>,
}

impl LocalResponse {
    pub fn new(parts: &Parts, body: Body) -> Self {
        Self {
            status: parts.status,
            version: parts.version,
            headers: Headers::from(&parts.headers),
            raw: Mutex::new(Some(body)),
            state: StateCell::new(),
        }
    }

    pub fn origin(&self) -> Origin {
        Origin::Local
    }

    pub fn status(&self) -> StatusCode {
        self.status
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

    pub fn with_body(&self) -> &Self {
        self.state.with_body();
        self
    }

    pub fn without_body(&self) -> &Self {
        self.state.without_body();
        self
    }

    /// Hands the body to the host for writing. Only the first call gets the stream.
    pub fn take_body(&self) -> Body {
        let state = self.state.expose();
        let Some(raw) = self.take_raw() else {
            return Body::empty();
        };
        match state.buffer() {
            Some(capture) => Body::new(Tee::new(raw, capture.clone())),
            None => raw,
        }
    }

    /// Bytes written so far, empty unless this exchange is buffering.
    pub fn body(&self) -> Bytes {
        match self.state.expose() {
            CaptureState::Buffering(capture) => capture.snapshot(),
            _ => Bytes::new(),
        }
    }

    /// Waits until a handed-out capturing body has been fully written, failed, or dropped.
    ///
    /// Returns immediately when nothing is being captured or the body was never taken.
    pub async fn finished(&self) -> Result<(), CaptureError> {
        let Some(capture) = self.state.load().buffer().cloned() else {
            return Ok(());
        };
        if self.raw.lock().unwrap_or_else(PoisonError::into_inner).is_some() {
            return Ok(());
        }
        capture.finished().await
    }

    /// Snapshot for logging; triggers a body access like [`body`](Self::body).
    pub fn data(&self) -> ResponseData {
        ResponseData {
            origin: self.origin(),
            protocol_version: self.protocol_version().to_string(),
            status: self.status.as_u16(),
            headers: self.headers.clone(),
            body: self.body(),
        }
    }

    fn take_raw(&self) -> Option<Body> {
        self.raw.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}
