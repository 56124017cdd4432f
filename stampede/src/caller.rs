//! The instrumented HTTP caller used by virtual users.
//!
//! ## Metrics
//!
//! `total_requests_count`: Requests issued, labelled by path and method
//! `processed_requests_count`: Requests with an outcome, labelled by path,
//! method and status, where status is numeric or `Timeout`
//! `request_duration_seconds`: Request duration histogram, same labels
//!

use std::{
    collections::HashMap,
    fmt,
    time::{Duration, Instant},
};

use metrics::{counter, histogram};
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::core;

pub mod test;

/// Runs of hex-and-dash characters at least this long are almost always ids;
/// collapsing them keeps the metric label space bounded.
static UUID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[a-f0-9\-]{8,}").expect("invalid path pattern"));

const TIMEOUT_STATUS: &str = "Timeout";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const KEEPALIVE: Duration = Duration::from_secs(120);

/// Errors produced by the HTTP caller.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wrapper around [`reqwest::Error`].
    #[error("http transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// The response status fell outside the 2xx-3xx range.
    #[error("unacceptable status code {0}")]
    UnacceptableCode(u16),
    /// The request context was cancelled mid-flight.
    #[error("request cancelled")]
    Cancelled,
}

impl From<Error> for core::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::UnacceptableCode(code) => core::Error::UnacceptableCode(code),
            other => core::Error::ScenarioExecutionViolation(other.to_string()),
        }
    }
}

/// An HTTP client shared by a group of virtual users.
///
/// The idle-connection timeout is sampled uniformly from the configured
/// range at construction so that clients created together do not reconnect
/// in lockstep.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: reqwest::Client,
}

/// Build a pooled client with an idle-connection timeout sampled uniformly
/// from `[min_idle_sec, max_idle_sec]`.
///
/// # Errors
///
/// Returns an error if the underlying client cannot be constructed.
///
/// # Panics
///
/// Panics if `min_idle_sec > max_idle_sec`.
pub fn new_client(min_idle_sec: u64, max_idle_sec: u64) -> Result<HttpClient, Error> {
    assert!(
        min_idle_sec <= max_idle_sec,
        "min idle timeout must not exceed max idle timeout"
    );
    let idle_sec = rand::thread_rng().gen_range(min_idle_sec..=max_idle_sec);

    let inner = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .tcp_keepalive(KEEPALIVE)
        .pool_idle_timeout(Duration::from_secs(idle_sec))
        .build()?;

    Ok(HttpClient { inner })
}

impl HttpClient {
    /// Begin building a request against this client.
    #[must_use]
    pub fn request(&self) -> Request {
        Request {
            client: self.inner.clone(),
            path_template: String::new(),
            path_args: Vec::new(),
            headers: Vec::new(),
            query: Vec::new(),
            form: None,
            json: None,
            auth_token: None,
        }
    }
}

/// A fluent request builder. Setters return `self`; a verb executes the
/// request with full metric instrumentation.
#[derive(Debug)]
pub struct Request {
    client: reqwest::Client,
    path_template: String,
    path_args: Vec<String>,
    headers: Vec<(String, String)>,
    query: Vec<(String, String)>,
    form: Option<HashMap<String, String>>,
    json: Option<serde_json::Value>,
    auth_token: Option<String>,
}

impl Request {
    /// Set the `Authorization: Bearer` token.
    #[must_use]
    pub fn auth_token(mut self, token: &str) -> Self {
        self.auth_token = Some(token.to_string());
        self
    }

    /// Set a JSON body.
    ///
    /// # Panics
    ///
    /// Panics if `body` does not serialize to JSON.
    #[must_use]
    pub fn body<T: Serialize>(mut self, body: &T) -> Self {
        self.json = Some(serde_json::to_value(body).expect("body must serialize to JSON"));
        self
    }

    /// Set a form-urlencoded body.
    #[must_use]
    pub fn form_data(mut self, form: HashMap<String, String>) -> Self {
        self.form = Some(form);
        self
    }

    /// Set a request header.
    #[must_use]
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Set the query parameters.
    #[must_use]
    pub fn query_params(mut self, params: Vec<(String, String)>) -> Self {
        self.query = params;
        self
    }

    /// Set the URL from a template whose `{}` markers are substituted with
    /// `args` in order.
    #[must_use]
    pub fn path(mut self, template: &str, args: &[&dyn fmt::Display]) -> Self {
        self.path_template = template.to_string();
        self.path_args = args.iter().map(ToString::to_string).collect();
        self
    }

    /// Execute as a GET request.
    ///
    /// # Errors
    ///
    /// See [`Error`].
    pub async fn get(self, ctx: &CancellationToken) -> Result<Response, Error> {
        self.execute(ctx, reqwest::Method::GET).await
    }

    /// Execute as a POST request.
    ///
    /// # Errors
    ///
    /// See [`Error`].
    pub async fn post(self, ctx: &CancellationToken) -> Result<Response, Error> {
        self.execute(ctx, reqwest::Method::POST).await
    }

    /// Execute as a PATCH request.
    ///
    /// # Errors
    ///
    /// See [`Error`].
    pub async fn patch(self, ctx: &CancellationToken) -> Result<Response, Error> {
        self.execute(ctx, reqwest::Method::PATCH).await
    }

    /// Execute as a PUT request.
    ///
    /// # Errors
    ///
    /// See [`Error`].
    pub async fn put(self, ctx: &CancellationToken) -> Result<Response, Error> {
        self.execute(ctx, reqwest::Method::PUT).await
    }

    /// Execute as a DELETE request.
    ///
    /// # Errors
    ///
    /// See [`Error`].
    pub async fn delete(self, ctx: &CancellationToken) -> Result<Response, Error> {
        self.execute(ctx, reqwest::Method::DELETE).await
    }

    async fn execute(
        self,
        ctx: &CancellationToken,
        method: reqwest::Method,
    ) -> Result<Response, Error> {
        let url = format_path(&self.path_template, &self.path_args);
        let labels = vec![
            ("path".to_string(), normalize_path(&url)),
            ("method".to_string(), method.to_string()),
        ];

        counter!("total_requests_count", &labels).increment(1);

        let mut request = self.client.request(method, &url);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        if !self.query.is_empty() {
            request = request.query(&self.query);
        }
        if let Some(json) = &self.json {
            request = request.json(json);
        }
        if let Some(form) = &self.form {
            request = request.form(form);
        }

        let start = Instant::now();
        let result = tokio::select! {
            () = ctx.cancelled() => Err(Error::Cancelled),
            result = request.send() => result.map_err(Error::Transport),
        };
        let duration = start.elapsed().as_secs_f64();

        match result {
            Ok(response) => {
                let status = response.status().as_u16();
                record_outcome(&labels, &status.to_string(), duration);

                let body = response.bytes().await?;
                if !(200..400).contains(&status) {
                    return Err(Error::UnacceptableCode(status));
                }

                Ok(Response { status, body })
            }
            Err(err) => {
                let timed_out = matches!(&err, Error::Cancelled)
                    || matches!(&err, Error::Transport(e) if e.is_timeout());
                if timed_out {
                    record_outcome(&labels, TIMEOUT_STATUS, duration);
                }
                Err(err)
            }
        }
    }
}

fn record_outcome(labels: &[(String, String)], status: &str, duration: f64) {
    let mut labels = labels.to_vec();
    labels.push(("status".to_string(), status.to_string()));
    counter!("processed_requests_count", &labels).increment(1);
    histogram!("request_duration_seconds", &labels).record(duration);
}

/// A response whose status fell in the acceptable range.
#[derive(Debug, Clone)]
pub struct Response {
    status: u16,
    body: bytes::Bytes,
}

impl Response {
    /// The HTTP status code.
    #[must_use]
    pub fn status(&self) -> u16 {
        self.status
    }

    /// The raw response body.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

/// Substitute `{}` markers in `template` with `args` in order. Unmatched
/// markers are left in place.
fn format_path(template: &str, args: &[String]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut args = args.iter();

    while let Some(idx) = rest.find("{}") {
        out.push_str(&rest[..idx]);
        match args.next() {
            Some(arg) => out.push_str(arg),
            None => out.push_str("{}"),
        }
        rest = &rest[idx + 2..];
    }
    out.push_str(rest);

    out
}

/// Collapse UUID-like path runs so dynamic segments aggregate under one
/// metric label.
fn normalize_path(path: &str) -> String {
    UUID_PATTERN.replace_all(path, "%s").into_owned()
}

/// The client façade handed to every virtual user. Bundles one caller per
/// target service, all sharing the same pooled HTTP client.
#[derive(Debug)]
pub struct Caller {
    /// Caller for the test service endpoints.
    pub test: test::TestCaller,
}

impl Caller {
    /// Create a new caller over `client`.
    #[must_use]
    pub fn new(client: HttpClient) -> Self {
        Self {
            test: test::TestCaller::new(client),
        }
    }
}
