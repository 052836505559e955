//! Fan-out of one record to several sinks, with panic isolation.
//!
//! Every record reaches every member concurrently. A member that panics loses that one
//! record; the others still receive it and the panicking member keeps receiving later
//! records. The layer's background task delivers through the same guard, so a faulty
//! sink never stops logging for the rest of the process.
//!
//! # Example
//!
//! ```rust
//! use logbook::{CompositeSink, LoggingSink};
//!
//! let sink = CompositeSink::new()
//!     .with(LoggingSink::new());
//!
//! // let layer = LogbookLayer::new(config, sink);
//! ```

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use tracing::{error, warn};

use crate::types::{BackgroundTask, Correlation, Precorrelation, RequestData, ResponseData};
use crate::Sink;

async fn dispatch<S: Sink>(sink: &S, task: BackgroundTask) {
    match task {
        BackgroundTask::Request {
            precorrelation,
            request,
        } => sink.write(precorrelation, request).await,
        BackgroundTask::Response {
            correlation,
            request,
            response,
        } => sink.write_both(correlation, request, response).await,
    }
}

/// Delivers `task` to `sink`, turning a panic into an `error!` event.
///
/// Returns whether the sink completed normally.
pub(crate) async fn deliver_isolated<S: Sink>(
    name: &str,
    sink: &S,
    task: BackgroundTask,
) -> bool {
    let id = task.id().to_string();
    isolated(name, &id, dispatch(sink, task)).await
}

async fn isolated<F>(name: &str, id: &str, delivery: F) -> bool
where
    F: std::future::Future<Output = ()>,
{
    match AssertUnwindSafe(delivery).catch_unwind().await {
        Ok(()) => true,
        Err(panic) => {
            error!(
                sink = name,
                correlation_id = %id,
                panic = panic_message(panic.as_ref()),
                "Sink panicked, record dropped"
            );
            false
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

/// [`Sink`] with its async methods folded into one boxed entry point.
trait ErasedSink: Send + Sync {
    fn deliver(&self, task: BackgroundTask) -> BoxFuture<'_, ()>;
}

impl<S: Sink> ErasedSink for S {
    fn deliver(&self, task: BackgroundTask) -> BoxFuture<'_, ()> {
        dispatch(self, task).boxed()
    }
}

struct Member {
    name: &'static str,
    sink: Box<dyn ErasedSink>,
}

/// A sink that hands every record to all of its members at once.
#[derive(Default)]
pub struct CompositeSink {
    members: Vec<Member>,
}

impl CompositeSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member. Returns self for builder pattern.
    pub fn with<S: Sink>(mut self, sink: S) -> Self {
        self.members.push(Member {
            name: std::any::type_name::<S>(),
            sink: Box::new(sink),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    async fn fan_out(&self, task: BackgroundTask) {
        let id = task.id().to_string();
        let deliveries = self
            .members
            .iter()
            .map(|member| isolated(member.name, &id, member.sink.deliver(task.clone())));
        let dropped = join_all(deliveries)
            .await
            .into_iter()
            .filter(|delivered| !delivered)
            .count();
        if dropped > 0 {
            warn!(
                correlation_id = %id,
                dropped,
                members = self.members.len(),
                "Record not delivered to every sink"
            );
        }
    }
}

impl fmt::Debug for CompositeSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeSink")
            .field(
                "members",
                &self.members.iter().map(|m| m.name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Sink for CompositeSink {
    async fn write(&self, precorrelation: Precorrelation, request: RequestData) {
        self.fan_out(BackgroundTask::Request {
            precorrelation,
            request,
        })
        .await;
    }

    async fn write_both(&self, correlation: Correlation, request: RequestData, response: ResponseData) {
        self.fan_out(BackgroundTask::Response {
            correlation,
            request,
            response,
        })
        .await;
    }
}
