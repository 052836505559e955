//! Duplicating body streams.
//!
//! A [`Tee`] sits in front of a body (or any async writer) and copies every byte that
//! passes through it into a shared [`Capture`], while the original consumer sees exactly
//! what it would have seen without it: same frames, same readiness, same errors.

use axum::body::Bytes;
use bytes::BytesMut;
use http_body::{Body, Frame, SizeHint};
use std::fmt::Display;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::task::{ready, Context, Poll};
use tokio::io::AsyncWrite;
use tokio::sync::Notify;

/// Error type for body capture operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("Body stream error: {0}")]
    Stream(String),
    #[error("Body stream was already handed out")]
    Consumed,
}

#[derive(Debug, Default)]
struct Shared {
    bytes: Mutex<BytesMut>,
    outcome: OnceLock<Result<(), CaptureError>>,
    done: Notify,
}

/// In-memory accumulator shared between a [`Tee`] and whoever wants the bytes later.
///
/// Cloning is cheap; all clones see the same bytes.
#[derive(Debug, Clone, Default)]
pub struct Capture {
    shared: Arc<Shared>,
}

impl Capture {
    pub fn new() -> Self {
        Self::default()
    }

    fn extend(&self, data: &[u8]) {
        self.shared
            .bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(data);
    }

    /// Everything written so far. Later writes do not affect a returned snapshot.
    pub fn snapshot(&self) -> Bytes {
        let bytes = self
            .shared
            .bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Bytes::copy_from_slice(&bytes)
    }

    pub fn len(&self) -> usize {
        self.shared
            .bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Marks the stream complete. Only the first outcome sticks.
    pub fn finish(&self) {
        self.complete(Ok(()));
    }

    pub fn fail(&self, error: impl Display) {
        self.complete(Err(CaptureError::Stream(error.to_string())));
    }

    fn complete(&self, outcome: Result<(), CaptureError>) {
        if self.shared.outcome.set(outcome).is_ok() {
            self.shared.done.notify_waiters();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.shared.outcome.get().is_some()
    }

    /// Resolves once the stream feeding this capture ended, failed, or was dropped.
    pub async fn finished(&self) -> Result<(), CaptureError> {
        loop {
            // Register before checking so a completion in between is not missed.
            let notified = self.shared.done.notified();
            if let Some(outcome) = self.shared.outcome.get() {
                return outcome.clone();
            }
            notified.await;
        }
    }
}

/// Decorator writing everything its inner stream carries into a [`Capture`] as well.
///
/// As an [`http_body::Body`] every frame is forwarded unchanged and data frames are
/// copied; as an [`AsyncWrite`] bytes go to the inner writer first and only the count it
/// accepted is copied. Dropping the tee marks the capture finished.
#[derive(Debug)]
pub struct Tee<S> {
    inner: S,
    capture: Capture,
}

impl<S> Tee<S> {
    pub fn new(inner: S, capture: Capture) -> Self {
        Self { inner, capture }
    }

    pub fn capture(&self) -> &Capture {
        &self.capture
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S> Drop for Tee<S> {
    fn drop(&mut self) {
        self.capture.finish();
    }
}

impl<B> Body for Tee<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Display,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    this.capture.extend(data);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Some(Err(e)) => {
                this.capture.fail(&e);
                Poll::Ready(Some(Err(e)))
            }
            None => {
                this.capture.finish();
                Poll::Ready(None)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<W> AsyncWrite for Tee<W>
where
    W: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let result = ready!(Pin::new(&mut this.inner).poll_write(cx, buf));
        match &result {
            Ok(written) => this.capture.extend(&buf[..*written]),
            Err(e) => this.capture.fail(e),
        }
        Poll::Ready(result)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let result = ready!(Pin::new(&mut this.inner).poll_shutdown(cx));
        match &result {
            Ok(()) => this.capture.finish(),
            Err(e) => this.capture.fail(e),
        }
        Poll::Ready(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body as AxumBody;
    use futures::stream;
    use http_body_util::BodyExt;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_streaming_body_capture() {
        let capture = Capture::new();
        let body = AxumBody::new(Tee::new(AxumBody::from("Hello, World!"), capture.clone()));

        let collected = body.collect().await.unwrap().to_bytes();

        assert_eq!(collected, "Hello, World!");
        assert_eq!(capture.snapshot(), "Hello, World!");
        assert!(capture.finished().await.is_ok());
    }

    #[tokio::test]
    async fn test_chunks_arrive_in_order() {
        let chunks = vec!["chunk1", "chunk2", "chunk3"];
        let stream = stream::iter(
            chunks
                .clone()
                .into_iter()
                .map(|chunk| Ok::<_, std::convert::Infallible>(Bytes::from(chunk))),
        );
        let capture = Capture::new();
        let tee = Tee::new(AxumBody::from_stream(stream), capture.clone());

        let received = AxumBody::new(tee).collect().await.unwrap().to_bytes();

        assert_eq!(received, chunks.concat());
        assert_eq!(capture.snapshot(), received);
    }

    #[tokio::test]
    async fn test_stream_error_passes_through() {
        let stream = stream::iter(vec![
            Ok(Bytes::from("partial")),
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "connection reset")),
        ]);
        let capture = Capture::new();
        let mut tee = Tee::new(AxumBody::from_stream(stream), capture.clone());

        let first = tee.frame().await.unwrap().unwrap();
        assert_eq!(first.into_data().unwrap(), "partial");
        assert!(tee.frame().await.unwrap().is_err());

        assert_eq!(capture.snapshot(), "partial");
        assert!(matches!(
            capture.finished().await,
            Err(CaptureError::Stream(message)) if message.contains("connection reset")
        ));
    }

    #[tokio::test]
    async fn test_drop_before_end_finishes_capture() {
        let capture = Capture::new();
        let waiter = {
            let capture = capture.clone();
            tokio::spawn(async move { capture.finished().await })
        };

        let tee = Tee::new(AxumBody::from("never read"), capture.clone());
        drop(tee);

        assert!(waiter.await.unwrap().is_ok());
        assert!(capture.is_empty());
    }

    #[tokio::test]
    async fn test_writer_copies_every_write() {
        let capture = Capture::new();
        let mut tee = Tee::new(Vec::new(), capture.clone());

        for part in ["alpha", "", "beta", "gamma"] {
            tee.write_all(part.as_bytes()).await.unwrap();
        }
        tee.flush().await.unwrap();
        tee.shutdown().await.unwrap();

        assert_eq!(tee.get_ref().as_slice(), b"alphabetagamma");
        assert_eq!(capture.snapshot(), "alphabetagamma");
        assert!(capture.is_finished());
    }

    #[tokio::test]
    async fn test_writer_copies_only_accepted_bytes() {
        // A duplex pipe with a tiny buffer accepts partial writes.
        let (writer, mut reader) = tokio::io::duplex(4);
        let capture = Capture::new();
        let mut tee = Tee::new(writer, capture.clone());

        let written = tee.write(b"abcdefgh").await.unwrap();
        assert_eq!(written, 4);
        assert_eq!(capture.snapshot(), "abcd");

        let mut received = [0u8; 4];
        tokio::io::AsyncReadExt::read_exact(&mut reader, &mut received)
            .await
            .unwrap();
        assert_eq!(&received, b"abcd");
    }
}
