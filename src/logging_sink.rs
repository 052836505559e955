//! Sink that writes formatted exchanges to `tracing`.
//!
//! [`LoggingSink`] renders every request and response with an [`HttpLogFormatter`] and
//! emits the text as one `INFO` event per exchange phase, tagged with the correlation id.
//! Where the event ends up (console, file, collector) is up to the installed subscriber.

use tracing::info;

use crate::formatter::{DefaultHttpLogFormatter, HttpLogFormatter};
use crate::types::{Correlation, Precorrelation, RequestData, ResponseData};
use crate::Sink;

/// [`Sink`] emitting formatted text through `tracing`.
///
/// # Examples
///
/// ```rust,no_run
/// use logbook::{LogbookConfig, LogbookLayer, LoggingSink};
///
/// # #[tokio::main]
/// # async fn main() {
/// let layer = LogbookLayer::new(LogbookConfig::default(), LoggingSink::new());
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct LoggingSink<F = DefaultHttpLogFormatter> {
    formatter: F,
}

impl LoggingSink {
    pub fn new() -> Self {
        Self::with_formatter(DefaultHttpLogFormatter)
    }
}

impl Default for LoggingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: HttpLogFormatter> LoggingSink<F> {
    pub fn with_formatter(formatter: F) -> Self {
        Self { formatter }
    }
}

impl<F: HttpLogFormatter> Sink for LoggingSink<F> {
    async fn write(&self, precorrelation: Precorrelation, request: RequestData) {
        let message = self.formatter.format_request(&precorrelation, &request);
        info!(correlation_id = %precorrelation.id(), "{message}");
    }

    async fn write_both(
        &self,
        correlation: Correlation,
        _request: RequestData,
        response: ResponseData,
    ) {
        let message = self.formatter.format_response(&correlation, &response);
        info!(
            correlation_id = %correlation.id(),
            duration_ms = correlation.duration().as_millis() as u64,
            "{message}"
        );
    }
}
