use crate::types::Headers;
use bytes::Bytes;
use url::Url;

#[derive(Debug, Clone, derive_more::Display)]
pub enum Method {
    #[display(fmt = "GET")]
    Get,
    #[display(fmt = "POST")]
    Post,
    #[display(fmt = "PUT")]
    Put,
    #[display(fmt = "DELETE")]
    Delete,
    #[display(fmt = "HEAD")]
    Head,
    #[display(fmt = "PATCH")]
    Patch,
    #[display(fmt = "OPTIONS")]
    Options,
    #[display(fmt = "{}", _0)]
    Other(String),
}

/// A request ready for the wire: pseudo-headers first, then regular
/// headers, then an optional body.
#[derive(Debug, Clone)]
pub struct Request {
    pub url: Url,
    pub headers: Headers,
    pub body: Bytes,
}

impl Request {
    pub fn new(method: Method, url: Url, body: impl Into<Bytes>) -> Self {
        let authority = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_owned(),
            (None, _) => String::new(),
        };
        let headers = vec![
            (":method".to_owned(), method.to_string()),
            (":scheme".to_owned(), url.scheme().to_owned()),
            (":path".to_owned(), url.path().to_owned()),
            (":authority".to_owned(), authority),
        ];
        Self {
            url,
            headers,
            body: body.into(),
        }
    }

    #[inline]
    #[must_use]
    pub fn get(url: Url) -> Self {
        Self::new(Method::Get, url, Bytes::new())
    }

    #[inline]
    #[must_use]
    pub fn post(url: Url, body: impl Into<Bytes>) -> Self {
        Self::new(Method::Post, url, body)
    }

    #[cfg(feature = "json")]
    pub fn post_json<T: serde::Serialize>(url: Url, body: &T) -> serde_json::Result<Self> {
        Ok(Self::new(Method::Post, url, serde_json::to_vec(body)?)
            .header("content-type", "application/json"))
    }

    /// Appends a regular header. Names should already be lowercase.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn method(&self) -> &str {
        self.headers
            .iter()
            .find(|(name, _)| name == ":method")
            .map_or("GET", |(_, value)| value)
    }
}
