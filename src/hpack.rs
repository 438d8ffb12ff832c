//! Thin confinement layer over the `hpack` crate. The encoder instance
//! lives in the writer task and the decoder instance in the reader task, so
//! dynamic-table state always matches wire order.

use crate::{
    error::{Error, Result},
    types::Headers,
};
use bytes::Bytes;

pub struct HeaderEncoder {
    inner: ::hpack::Encoder<'static>,
}

impl HeaderEncoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: ::hpack::Encoder::new(),
        }
    }

    /// Encodes one complete header block. Splitting into HEADERS +
    /// CONTINUATION frames is the writer's job; the fragment is returned
    /// whole.
    pub fn encode(&mut self, headers: &Headers) -> Bytes {
        Bytes::from(
            self.inner
                .encode(headers.iter().map(|(k, v)| (k.as_bytes(), v.as_bytes()))),
        )
    }
}

impl Default for HeaderEncoder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct HeaderDecoder {
    inner: ::hpack::Decoder<'static>,
}

impl HeaderDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: ::hpack::Decoder::new(),
        }
    }

    /// Applies our (ACKed) SETTINGS_HEADER_TABLE_SIZE to the peer-facing
    /// dynamic table bound.
    pub fn set_max_table_size(&mut self, size: usize) {
        self.inner.set_max_table_size(size);
    }

    /// Decodes one complete header block; a failure is a connection-level
    /// COMPRESSION_ERROR.
    pub fn decode(&mut self, fragment: &[u8]) -> Result<Headers> {
        let mut headers = Headers::new();
        self.inner
            .decode_with_cb(fragment, |name, value| {
                headers.push((
                    String::from_utf8_lossy(&name).into_owned(),
                    String::from_utf8_lossy(&value).into_owned(),
                ));
            })
            .map_err(Error::Hpack)?;
        Ok(headers)
    }
}

impl Default for HeaderDecoder {
    fn default() -> Self {
        Self::new()
    }
}
