use crate::types::Headers;
use bytes::Bytes;

#[derive(Debug, Clone)]
pub struct Response {
    /// Response headers in wire order; trailers, if any, follow them.
    pub headers: Headers,
    pub body: Bytes,
}

impl Response {
    /// First header with the given name, compared case-insensitively
    /// (HTTP/2 header names are lowercase on the wire).
    pub fn header(&self, name: impl AsRef<str>) -> Option<&str> {
        let name = name.as_ref();
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// The `:status` pseudo-header; 0 when the peer sent none.
    #[must_use]
    pub fn status(&self) -> u16 {
        self.header(":status")
            .and_then(|status| status.parse().ok())
            .unwrap_or(0)
    }

    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    #[cfg(feature = "json")]
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }
}
