//! Plain-text rendering of captured exchanges.
//!
//! ```text
//! Incoming Request: 2bd05240-6827-11e5-bbee-10ddb1ee7671
//! Remote: 127.0.0.1
//! GET http://localhost/test?limit=1 HTTP/1.1
//! Accept: application/json
//!
//! Hello, world!
//! ```

use axum::http::StatusCode;
use bytes::Bytes;
use encoding_rs::Encoding;

use crate::types::{Correlation, Headers, Origin, Precorrelation, RequestData, ResponseData};

/// Turns captured requests and responses into log text.
///
/// Used by [`LoggingSink`](crate::LoggingSink); implement it to change the record layout
/// without writing a whole [`Sink`](crate::Sink).
pub trait HttpLogFormatter: Send + Sync + 'static {
    /// Render a request record.
    ///
    /// # Arguments
    ///
    /// * `precorrelation` - The correlation id; no end time is known yet
    /// * `request` - The captured request, with the body decoded via [`RequestData::charset`]
    fn format_request(&self, precorrelation: &Precorrelation, request: &RequestData) -> String;

    /// Render a response record.
    ///
    /// # Arguments
    ///
    /// * `correlation` - The correlation id and the elapsed time of the exchange
    /// * `response` - The captured response, with the body decoded via [`ResponseData::charset`]
    fn format_response(&self, correlation: &Correlation, response: &ResponseData) -> String;
}

/// The canonical multi-line HTTP-like format.
///
/// Start line with direction and correlation id, then either the remote address and
/// request line or the duration and status line, one line per header, and finally the
/// body after a blank line if one was captured. Lines are separated by `\n` with no
/// trailing newline.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHttpLogFormatter;

impl HttpLogFormatter for DefaultHttpLogFormatter {
    fn format_request(&self, precorrelation: &Precorrelation, request: &RequestData) -> String {
        let mut lines = vec![
            format!(
                "{} Request: {}",
                direction(request.origin),
                precorrelation.id()
            ),
            format!("Remote: {}", request.remote),
            request_line(request),
        ];
        append_message(&mut lines, &request.headers, &request.body, request.charset());
        lines.join("\n")
    }

    fn format_response(&self, correlation: &Correlation, response: &ResponseData) -> String {
        let mut lines = vec![
            format!(
                "{} Response: {}",
                direction(response.origin),
                correlation.id()
            ),
            format!("Duration: {} ms", correlation.duration().as_millis()),
            status_line(response),
        ];
        append_message(
            &mut lines,
            &response.headers,
            &response.body,
            response.charset(),
        );
        lines.join("\n")
    }
}

fn direction(origin: Origin) -> &'static str {
    match origin {
        Origin::Remote => "Incoming",
        Origin::Local => "Outgoing",
    }
}

fn request_line(request: &RequestData) -> String {
    let mut line = format!("{} {}://{}", request.method, request.scheme, request.host);
    if let Some(port) = request.port {
        line.push(':');
        line.push_str(&port.to_string());
    }
    line.push_str(&request.path);
    if !request.query.is_empty() {
        line.push('?');
        line.push_str(&request.query);
    }
    line.push(' ');
    line.push_str(&request.protocol_version);
    line
}

fn status_line(response: &ResponseData) -> String {
    // Codes outside 100..=999 or without a registered phrase render bare.
    let reason = StatusCode::from_u16(response.status)
        .ok()
        .and_then(|status| status.canonical_reason());
    match reason {
        Some(reason) => format!("{} {} {}", response.protocol_version, response.status, reason),
        None => format!("{} {}", response.protocol_version, response.status),
    }
}

fn append_message(
    lines: &mut Vec<String>,
    headers: &Headers,
    body: &Bytes,
    charset: &'static Encoding,
) {
    lines.extend(
        headers
            .iter()
            .map(|(name, values)| format!("{}: {}", name, values.join(", "))),
    );
    if !body.is_empty() {
        lines.push(String::new());
        let (text, _) = charset.decode_without_bom_handling(body);
        lines.push(text.into_owned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Method;
    use std::time::{Duration, SystemTime};

    fn request(origin: Origin) -> RequestData {
        RequestData {
            origin,
            remote: "127.0.0.1".to_string(),
            method: Method::GET,
            scheme: "http".to_string(),
            host: "localhost".to_string(),
            port: None,
            path: "/test".to_string(),
            query: String::new(),
            protocol_version: "HTTP/1.1".to_string(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    fn response(origin: Origin, status: u16) -> ResponseData {
        ResponseData {
            origin,
            protocol_version: "HTTP/1.1".to_string(),
            status,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    fn precorrelation(id: &str) -> Precorrelation {
        Precorrelation::new(id, SystemTime::UNIX_EPOCH)
    }

    fn correlation(id: &str, millis: u64) -> Correlation {
        precorrelation(id).correlate(SystemTime::UNIX_EPOCH + Duration::from_millis(millis))
    }

    #[test]
    fn test_request() {
        let mut data = request(Origin::Remote);
        data.protocol_version = "HTTP/1.0".to_string();
        data.query = "limit=1".to_string();
        data.headers = [("Accept", ["application/json"]), ("Content-Type", ["text/plain"])]
            .into_iter()
            .collect();
        data.body = Bytes::from("Hello, world!");

        let http = DefaultHttpLogFormatter.format_request(
            &precorrelation("c9408eaa-677d-11e5-9457-10ddb1ee7671"),
            &data,
        );

        assert_eq!(
            http,
            "Incoming Request: c9408eaa-677d-11e5-9457-10ddb1ee7671\n\
             Remote: 127.0.0.1\n\
             GET http://localhost/test?limit=1 HTTP/1.0\n\
             Accept: application/json\n\
             Content-Type: text/plain\n\
             \n\
             Hello, world!"
        );
    }

    #[test]
    fn test_request_without_query() {
        let mut data = request(Origin::Local);
        data.headers = [("Accept", ["application/json"])].into_iter().collect();
        data.body = Bytes::from("Hello, world!");

        let http = DefaultHttpLogFormatter.format_request(&precorrelation("2bd05240"), &data);

        assert_eq!(
            http,
            "Outgoing Request: 2bd05240\n\
             Remote: 127.0.0.1\n\
             GET http://localhost/test HTTP/1.1\n\
             Accept: application/json\n\
             \n\
             Hello, world!"
        );
    }

    #[test]
    fn test_request_without_body() {
        let mut data = request(Origin::Remote);
        data.headers = [("Accept", ["application/json"])].into_iter().collect();

        let http = DefaultHttpLogFormatter.format_request(&precorrelation("0eae9f6c"), &data);

        assert_eq!(
            http,
            "Incoming Request: 0eae9f6c\n\
             Remote: 127.0.0.1\n\
             GET http://localhost/test HTTP/1.1\n\
             Accept: application/json"
        );
    }

    #[test]
    fn test_request_with_port_and_no_headers() {
        let mut data = request(Origin::Remote);
        data.method = Method::POST;
        data.scheme = "https".to_string();
        data.port = Some(8443);
        data.body = Bytes::from("x=1");

        let http = DefaultHttpLogFormatter.format_request(&precorrelation("p"), &data);

        assert_eq!(
            http,
            "Incoming Request: p\n\
             Remote: 127.0.0.1\n\
             POST https://localhost:8443/test HTTP/1.1\n\
             \n\
             x=1"
        );
    }

    #[test]
    fn test_response() {
        let mut data = response(Origin::Remote, 201);
        data.protocol_version = "HTTP/1.0".to_string();
        data.headers = [("Content-Type", ["application/json"])].into_iter().collect();
        data.body = Bytes::from(r#"{"success":true}"#);

        let http = DefaultHttpLogFormatter.format_response(&correlation("abc-1", 125), &data);

        assert_eq!(
            http,
            "Incoming Response: abc-1\nDuration: 125 ms\nHTTP/1.0 201 Created\nContent-Type: application/json\n\n{\"success\":true}"
        );
    }

    #[test]
    fn test_response_without_body() {
        let mut data = response(Origin::Local, 400);
        data.headers = [("Content-Type", ["application/json"])].into_iter().collect();

        let http = DefaultHttpLogFormatter.format_response(&correlation("3881ae92", 100), &data);

        assert_eq!(
            http,
            "Outgoing Response: 3881ae92\n\
             Duration: 100 ms\n\
             HTTP/1.1 400 Bad Request\n\
             Content-Type: application/json"
        );
    }

    #[test]
    fn test_response_unknown_status() {
        let mut data = response(Origin::Remote, 1000);
        data.protocol_version = "HTTP/1.0".to_string();
        data.headers = [("Content-Type", ["application/json"])].into_iter().collect();
        data.body = Bytes::from(r#"{"success":true}"#);

        let http = DefaultHttpLogFormatter.format_response(&correlation("2d51bc02", 125), &data);

        assert_eq!(
            http,
            "Incoming Response: 2d51bc02\nDuration: 125 ms\nHTTP/1.0 1000\nContent-Type: application/json\n\n{\"success\":true}"
        );
    }

    #[test]
    fn test_response_registered_code_without_phrase() {
        let data = response(Origin::Local, 299);
        let http = DefaultHttpLogFormatter.format_response(&correlation("x", 0), &data);
        assert!(http.ends_with("\nHTTP/1.1 299"));
    }

    #[test]
    fn test_response_empty_header() {
        let mut data = response(Origin::Remote, 201);
        data.protocol_version = "HTTP/1.0".to_string();
        data.headers.insert("Content-Type", ["application/json"]);
        data.headers.insert("X-Empty-Header", Vec::<String>::new());
        data.body = Bytes::from(r#"{"success":true}"#);

        let http = DefaultHttpLogFormatter.format_response(&correlation("2d51bc02", 125), &data);

        assert_eq!(
            http,
            "Incoming Response: 2d51bc02\nDuration: 125 ms\nHTTP/1.0 201 Created\nContent-Type: application/json\nX-Empty-Header: \n\n{\"success\":true}"
        );
    }

    #[test]
    fn test_multiple_values_are_comma_joined() {
        let mut data = response(Origin::Local, 200);
        data.headers.append("Set-Cookie", "a=1");
        data.headers.append("Set-Cookie", "b=2");

        let http = DefaultHttpLogFormatter.format_response(&correlation("m", 3), &data);

        assert!(http.ends_with("HTTP/1.1 200 OK\nSet-Cookie: a=1, b=2"));
    }

    #[test]
    fn test_duration_truncates() {
        let data = response(Origin::Local, 204);
        let correlation = precorrelation("t")
            .correlate(SystemTime::UNIX_EPOCH + Duration::from_micros(1_999));

        let http = DefaultHttpLogFormatter.format_response(&correlation, &data);

        assert!(http.contains("\nDuration: 1 ms\n"));
    }

    #[test]
    fn test_body_decoded_with_declared_charset() {
        let mut data = response(Origin::Local, 200);
        data.headers
            .insert("Content-Type", ["text/plain; charset=ISO-8859-1"]);
        data.body = Bytes::from_static(b"caf\xe9");

        let http = DefaultHttpLogFormatter.format_response(&correlation("c", 1), &data);

        assert!(http.ends_with("\n\ncafé"));
    }

    #[test]
    fn test_body_with_replacement_charset_decodes_as_utf8() {
        let mut data = response(Origin::Local, 200);
        data.headers
            .insert("Content-Type", ["text/plain; charset=iso-2022-kr"]);
        data.body = Bytes::from("hello");

        let http = DefaultHttpLogFormatter.format_response(&correlation("r", 1), &data);

        assert!(http.ends_with("charset=iso-2022-kr\n\nhello"));
    }
}
