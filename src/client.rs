use crate::{
    connection::{Connection, ConnectionConfig},
    error::{Error, Result},
    request::Request,
    response::Response,
    stream::StreamEvent,
    types::Headers,
};
use bytes::BytesMut;
use log::trace;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::{
    rustls::{self, OwnedTrustAnchor, RootCertStore, ServerName},
    TlsConnector,
};

/// HTTP/2 client: rustls configuration plus connection knobs. The default
/// trusts the webpki root set and offers only `h2` via ALPN.
pub struct Client {
    rustls_config: Arc<rustls::ClientConfig>,
    config: ConnectionConfig,
}

impl Client {
    #[must_use]
    pub fn new(rustls_config: Arc<rustls::ClientConfig>, config: ConnectionConfig) -> Self {
        Self {
            rustls_config,
            config,
        }
    }

    /// Dials `host:port`, runs the TLS handshake, verifies the peer picked
    /// `h2` and performs the HTTP/2 connection setup.
    pub async fn connect(&self, host: &str, port: u16) -> Result<Connection> {
        let tcp = TcpStream::connect((host, port)).await?;
        let server_name =
            ServerName::try_from(host).map_err(|err| Error::Tls(err.to_string()))?;
        let tls = TlsConnector::from(self.rustls_config.clone())
            .connect(server_name, tcp)
            .await?;
        if tls.get_ref().1.alpn_protocol() != Some(&b"h2"[..]) {
            return Err(Error::AlpnRejected);
        }
        Connection::handshake(tls, self.config.clone()).await
    }

    /// Convenience: one request on a fresh connection, driven to
    /// completion.
    pub async fn request(&self, request: Request) -> Result<Response> {
        let host = request
            .url
            .host_str()
            .ok_or(Error::Internal("request URL has no host"))?;
        let port = request
            .url
            .port_or_known_default()
            .ok_or(Error::Internal("request URL has no port"))?;
        let connection = self.connect(host, port).await?;
        trace!("{} {}", request.method(), request.url);

        let end_stream = request.body.is_empty();
        let mut stream = connection
            .start_stream(request.headers.clone(), end_stream)
            .await?;
        if !end_stream {
            stream.send_data(request.body.clone(), true).await?;
        }

        let mut headers = Headers::new();
        let mut body = BytesMut::new();
        while let Some(event) = stream.next_event().await {
            match event {
                StreamEvent::Headers {
                    headers: block, ..
                } => headers.extend(block),
                StreamEvent::Data { data, .. } => body.extend_from_slice(&data),
                StreamEvent::Reset(code) => return Err(Error::StreamReset(code)),
                StreamEvent::ConnectionClosed(cause) => return Err(Error::Closed(cause)),
            }
        }
        let response = Response {
            headers,
            body: body.freeze(),
        };
        trace!("response: {:?}", response.status());
        Ok(response)
    }
}

impl Default for Client {
    fn default() -> Self {
        let mut root_store = RootCertStore::empty();
        root_store.add_server_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.0.iter().map(|ta| {
            OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));
        let mut config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"h2".to_vec()];
        Self {
            rustls_config: Arc::new(config),
            config: ConnectionConfig::default(),
        }
    }
}
