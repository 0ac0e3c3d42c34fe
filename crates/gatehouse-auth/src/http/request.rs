//! Request abstraction consumed by the guards.

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::http::request::Parts;
use axum::http::{HeaderMap, Method};
use cookie::Cookie;

/// What the security components need to know about an inbound request.
pub trait SecurityRequest {
    /// HTTP method.
    fn method(&self) -> &Method;

    /// Request path, without the query string.
    fn path(&self) -> &str;

    /// First value of header `name`, if valid UTF-8.
    fn header(&self, name: &str) -> Option<&str>;

    /// Value of cookie `name`.
    fn cookie(&self, name: &str) -> Option<&str>;

    /// Value of form field `name`, when a form body was parsed.
    fn form_value(&self, name: &str) -> Option<&str>;

    /// Peer address, when known.
    fn remote_addr(&self) -> Option<SocketAddr>;
}

/// Owned snapshot of a request's security-relevant parts.
#[derive(Debug, Clone)]
pub struct RequestSnapshot {
    method: Method,
    path: String,
    headers: HeaderMap,
    cookies: HashMap<String, String>,
    form: HashMap<String, String>,
    remote_addr: Option<SocketAddr>,
}

impl RequestSnapshot {
    /// Captures method, path, headers and cookies from request parts.
    #[must_use]
    pub fn from_parts(parts: &Parts) -> Self {
        let cookies = parts
            .headers
            .get_all(axum::http::header::COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|header| {
                Cookie::split_parse_encoded(header.to_string())
                    .filter_map(Result::ok)
                    .map(|c| (c.name().to_string(), c.value().to_string()))
                    .collect::<Vec<_>>()
            })
            .collect();

        let remote_addr = parts
            .extensions
            .get::<axum::extract::ConnectInfo<SocketAddr>>()
            .map(|info| info.0);

        Self {
            method: parts.method.clone(),
            path: parts.uri.path().to_string(),
            headers: parts.headers.clone(),
            cookies,
            form: HashMap::new(),
            remote_addr,
        }
    }

    /// Minimal snapshot for a method and path.
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            cookies: HashMap::new(),
            form: HashMap::new(),
            remote_addr: None,
        }
    }

    /// Attaches a parsed form body.
    #[must_use]
    pub fn with_form(mut self, form: HashMap<String, String>) -> Self {
        self.form = form;
        self
    }

    /// Adds a header. Invalid names or values are ignored.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::try_from(name),
            axum::http::HeaderValue::try_from(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    /// Adds a cookie.
    #[must_use]
    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    /// Sets the peer address.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }
}

impl SecurityRequest for RequestSnapshot {
    fn method(&self) -> &Method {
        &self.method
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    fn form_value(&self, name: &str) -> Option<&str> {
        self.form.get(name).map(String::as_str)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    #[test]
    fn test_from_parts() {
        let (mut parts, ()) = Request::builder()
            .method(Method::POST)
            .uri("/api/items?x=1")
            .header("X-CSRF-Token", "abc")
            .header("Cookie", "session=s1; _csrf=abc")
            .header("Cookie", "theme=dark%20mode")
            .body(())
            .unwrap()
            .into_parts();
        let addr: SocketAddr = "10.1.2.3:4567".parse().unwrap();
        parts.extensions.insert(axum::extract::ConnectInfo(addr));

        let snapshot = RequestSnapshot::from_parts(&parts);
        assert_eq!(snapshot.method(), Method::POST);
        assert_eq!(snapshot.path(), "/api/items");
        assert_eq!(snapshot.header("x-csrf-token"), Some("abc"));
        assert_eq!(snapshot.cookie("session"), Some("s1"));
        assert_eq!(snapshot.cookie("_csrf"), Some("abc"));
        assert_eq!(snapshot.cookie("theme"), Some("dark mode"));
        assert_eq!(snapshot.cookie("missing"), None);
        assert_eq!(snapshot.remote_addr(), Some(addr));
    }

    #[test]
    fn test_builders() {
        let mut form = HashMap::new();
        form.insert("csrf_token".to_string(), "t".to_string());
        let snapshot = RequestSnapshot::new(Method::GET, "/")
            .with_form(form)
            .with_header("X-Test", "1")
            .with_cookie("a", "b");
        assert_eq!(snapshot.form_value("csrf_token"), Some("t"));
        assert_eq!(snapshot.header("x-test"), Some("1"));
        assert_eq!(snapshot.cookie("a"), Some("b"));
        assert_eq!(snapshot.remote_addr(), None);
    }
}
