//! HTTP requester backed by a shared blocking client.
//!
//! One client is built per process and shared by reference across all
//! requesters; each requester only rotates through the precomputed target
//! URLs and validates the response status.

use crate::config::{Protocol, Request as RequestConfig};
use crate::requester::{RequestError, Requester, RequesterFactory};
use reqwest::Method;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Build the process-wide blocking client. TCP keepalives are disabled:
/// the benchmark sends continuously, so they only add probe traffic.
pub fn build_client(
    protocol: Protocol,
    reuse_connections: bool,
    request_timeout: Duration,
) -> Result<Client, RequestError> {
    let mut builder = Client::builder()
        .timeout(request_timeout)
        .connect_timeout(request_timeout)
        .tcp_keepalive(None);

    builder = match protocol {
        Protocol::Http1 => builder.http1_only(),
        Protocol::Http2 => builder.http2_prior_knowledge(),
    };

    if !reuse_connections {
        builder = builder.pool_max_idle_per_host(0);
    }

    Ok(builder.build()?)
}

/// Everything a request needs, computed once at factory construction.
#[derive(Debug)]
struct RequestPlan {
    method: Method,
    urls: Vec<reqwest::Url>,
    headers: HeaderMap,
    body: Vec<u8>,
    expected_status: u16,
    /// Round-robin cursor across `urls`, shared by all requesters.
    cursor: AtomicUsize,
}

impl RequestPlan {
    fn next_url(&self) -> &reqwest::Url {
        let i = self.cursor.fetch_add(1, Ordering::Relaxed);
        &self.urls[i % self.urls.len()]
    }
}

pub struct HttpRequesterFactory {
    client: Client,
    plan: Arc<RequestPlan>,
}

impl HttpRequesterFactory {
    pub fn new(config: &RequestConfig, client: Client) -> Result<Self, RequestError> {
        let urls = resolve_urls(config)?;

        let body = match &config.body_file {
            Some(path) => std::fs::read(path)
                .map_err(|e| format!("failed to read body file {}: {e}", path.display()))?,
            None => config.body.clone().unwrap_or_default().into_bytes(),
        };

        let method = match &config.method {
            Some(name) => name.parse::<Method>().map_err(|_| {
                format!("invalid HTTP method {name:?}")
            })?,
            None if body.is_empty() => Method::GET,
            None => Method::POST,
        };

        let headers = expand_headers(&config.headers)?;

        Ok(Self {
            client,
            plan: Arc::new(RequestPlan {
                method,
                urls,
                headers,
                body,
                expected_status: config.expected_status,
                cursor: AtomicUsize::new(0),
            }),
        })
    }
}

impl RequesterFactory for HttpRequesterFactory {
    fn get_requester(&self, _number: u64) -> Result<Box<dyn Requester>, RequestError> {
        Ok(Box::new(HttpRequester {
            client: self.client.clone(),
            plan: Arc::clone(&self.plan),
        }))
    }
}

pub struct HttpRequester {
    client: Client,
    plan: Arc<RequestPlan>,
}

impl Requester for HttpRequester {
    fn setup(&mut self) -> Result<(), RequestError> {
        Ok(())
    }

    fn request(&mut self) -> Result<(), RequestError> {
        let url = self.plan.next_url().clone();
        let mut request = self
            .client
            .request(self.plan.method.clone(), url)
            .headers(self.plan.headers.clone());
        if !self.plan.body.is_empty() {
            request = request.body(self.plan.body.clone());
        }

        let response = request.send()?;
        let status = response.status().as_u16();
        // Drain the body so the connection is reusable; a truncated body is
        // not a validation failure.
        let _ = response.bytes();

        if status != self.plan.expected_status {
            return Err(format!(
                "Expected {}-response, but got {}",
                self.plan.expected_status, status
            )
            .into());
        }

        Ok(())
    }

    fn teardown(&mut self) -> Result<(), RequestError> {
        Ok(())
    }
}

/// The target list: explicit `urls`, or `hosts` substituted into the base
/// `url`, or the single `url`.
fn resolve_urls(config: &RequestConfig) -> Result<Vec<reqwest::Url>, RequestError> {
    if !config.urls.is_empty() {
        return config
            .urls
            .iter()
            .map(|u| parse_url(u))
            .collect();
    }

    let base = config
        .url
        .as_deref()
        .ok_or("request.url or request.urls is required")?;
    let base = parse_url(base)?;

    if config.hosts.is_empty() {
        return Ok(vec![base]);
    }

    config
        .hosts
        .iter()
        .map(|host| {
            let mut url = base.clone();
            let (name, port) = match host.rsplit_once(':') {
                Some((name, port)) => {
                    let port: u16 = port
                        .parse()
                        .map_err(|_| format!("invalid port in host {host:?}"))?;
                    (name, Some(port))
                }
                None => (host.as_str(), None),
            };
            url.set_host(Some(name))
                .map_err(|e| format!("invalid host {host:?}: {e}"))?;
            url.set_port(port)
                .map_err(|_| format!("cannot set port on {host:?}"))?;
            Ok(url)
        })
        .collect()
}

fn parse_url(s: &str) -> Result<reqwest::Url, RequestError> {
    reqwest::Url::parse(s)
        .map_err(|e| format!("invalid URL {s:?}: {e}").into())
}

fn expand_headers(
    headers: &std::collections::HashMap<String, String>,
) -> Result<HeaderMap, RequestError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name: HeaderName = name
            .parse()
            .map_err(|_| format!("invalid header name {name:?}"))?;
        let value: HeaderValue = expand_env(value)
            .parse()
            .map_err(|_| format!("invalid header value for {name}"))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Substitute `$NAME` and `${NAME}` references with environment variables;
/// unset variables expand to the empty string.
fn expand_env(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }

        let braced = matches!(chars.peek(), Some((_, '{')));
        if braced {
            chars.next();
        }

        let mut name = String::new();
        while let Some(&(_, c)) = chars.peek() {
            let part_of_name = if braced {
                c != '}'
            } else {
                c.is_ascii_alphanumeric() || c == '_'
            };
            if !part_of_name {
                break;
            }
            name.push(c);
            chars.next();
        }
        if braced {
            chars.next(); // consume '}'
        }

        if name.is_empty() {
            out.push('$');
            if braced {
                out.push('{');
                out.push('}');
            }
            continue;
        }

        if let Ok(v) = std::env::var(&name) {
            out.push_str(&v);
        }
    }

    out
}
