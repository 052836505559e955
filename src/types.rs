//! Data types for captured HTTP exchanges.
//!
//! This module contains the snapshots handed to a [`Sink`](crate::Sink) once a request or
//! response has been observed, the correlation context that ties the two together, and the
//! ordered header map both are rendered from.

use axum::http::{self, Method, Version};
use bytes::Bytes;
use encoding_rs::Encoding;
use std::str::FromStr;
use std::time::{Duration, SystemTime};

/// Which side of the exchange produced a message.
///
/// `Local` means this process produced it (an outgoing request or our own response),
/// `Remote` means it arrived from elsewhere (an incoming request or a peer's response).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    Local,
    Remote,
}

/// Correlation context of an exchange whose response has not finished yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Precorrelation {
    id: String,
    start: SystemTime,
}

impl Precorrelation {
    pub fn new(id: impl Into<String>, start: SystemTime) -> Self {
        Self {
            id: id.into(),
            start,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn start(&self) -> SystemTime {
        self.start
    }

    /// Completes the context with the time the response finished.
    ///
    /// Consumes `self`, so the end timestamp of an exchange is set exactly once.
    pub fn correlate(self, end: SystemTime) -> Correlation {
        Correlation {
            id: self.id,
            start: self.start,
            end,
        }
    }
}

/// Correlation context of a finished exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correlation {
    id: String,
    start: SystemTime,
    end: SystemTime,
}

impl Correlation {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn start(&self) -> SystemTime {
        self.start
    }

    pub fn end(&self) -> SystemTime {
        self.end
    }

    /// Time between start and end. Clock skew backwards yields zero.
    pub fn duration(&self) -> Duration {
        self.end.duration_since(self.start).unwrap_or_default()
    }
}

/// Ordered header multimap.
///
/// Names compare case-insensitively but keep the casing they were first inserted with.
/// Entries iterate in insertion order, values in the order they were appended, and a
/// name may map to an empty list (present, no value).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, Vec<String>)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(existing, _)| existing.eq_ignore_ascii_case(name))
    }

    /// Appends one value, creating the entry if the name is new.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        match self.position(&name) {
            Some(index) => self.entries[index].1.push(value.into()),
            None => self.entries.push((name, vec![value.into()])),
        }
    }

    /// Replaces all values of a header. An existing entry keeps its position and casing.
    pub fn insert<I, V>(&mut self, name: impl Into<String>, values: I)
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        let name = name.into();
        let values = values.into_iter().map(Into::into).collect();
        match self.position(&name) {
            Some(index) => self.entries[index].1 = values,
            None => self.entries.push((name, values)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.position(name).map(|index| self.entries[index].1.as_slice())
    }

    pub fn first(&self, name: &str) -> Option<&str> {
        self.get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parsed `Content-Type`, if present and well-formed.
    pub fn content_type(&self) -> Option<mime::Mime> {
        self.first("Content-Type")
            .and_then(|value| mime::Mime::from_str(value).ok())
    }

    /// Character set declared by `Content-Type`, falling back to UTF-8 when the header is
    /// missing, has no `charset` parameter, or names a label that cannot decode text.
    pub fn charset(&self) -> &'static Encoding {
        self.content_type()
            .and_then(|content_type| {
                content_type
                    .get_param(mime::CHARSET)
                    .and_then(|label| {
                        Encoding::for_label_no_replacement(label.as_str().as_bytes())
                    })
            })
            .unwrap_or(encoding_rs::UTF_8)
    }
}

impl From<&http::HeaderMap> for Headers {
    fn from(map: &http::HeaderMap) -> Self {
        let mut headers = Headers::new();
        for name in map.keys() {
            headers.insert(
                name.as_str(),
                map.get_all(name)
                    .iter()
                    .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned()),
            );
        }
        headers
    }
}

impl<N, I, V> FromIterator<(N, I)> for Headers
where
    N: Into<String>,
    I: IntoIterator<Item = V>,
    V: Into<String>,
{
    fn from_iter<T: IntoIterator<Item = (N, I)>>(iter: T) -> Self {
        let mut headers = Headers::new();
        for (name, values) in iter {
            headers.insert(name, values);
        }
        headers
    }
}

/// Renders a protocol version the way it appears on a request or status line.
pub fn protocol_version(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}

/// Snapshot of an observed HTTP request.
///
/// `body` is empty unless the body was buffered for this exchange.
#[derive(Debug, Clone)]
pub struct RequestData {
    pub origin: Origin,
    /// Address of the peer, or `"unknown"` when the host did not supply one
    pub remote: String,
    pub method: Method,
    pub scheme: String,
    pub host: String,
    /// Explicit, non-default port
    pub port: Option<u16>,
    pub path: String,
    /// Raw query string without the leading `?`; empty when the URI had none
    pub query: String,
    pub protocol_version: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl RequestData {
    pub fn charset(&self) -> &'static Encoding {
        self.headers.charset()
    }
}

/// Snapshot of an observed HTTP response.
#[derive(Debug, Clone)]
pub struct ResponseData {
    pub origin: Origin,
    pub protocol_version: String,
    /// Raw status code; values outside the registered range are kept as-is
    pub status: u16,
    pub headers: Headers,
    pub body: Bytes,
}

impl ResponseData {
    pub fn charset(&self) -> &'static Encoding {
        self.headers.charset()
    }
}

/// Tasks sent to the background processing task.
///
/// The middleware sends these to a background async task so sink work never runs on the
/// request path.
#[derive(Debug, Clone)]
pub(crate) enum BackgroundTask {
    /// A request has been captured and is ready to be written
    Request {
        precorrelation: Precorrelation,
        request: RequestData,
    },
    /// A response has finished; carries the request as well for full context
    Response {
        correlation: Correlation,
        request: RequestData,
        response: ResponseData,
    },
}

impl BackgroundTask {
    pub(crate) fn id(&self) -> &str {
        match self {
            BackgroundTask::Request { precorrelation, .. } => precorrelation.id(),
            BackgroundTask::Response { correlation, .. } => correlation.id(),
        }
    }
}
