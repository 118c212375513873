//! The byte-level link to the device's alert stream.
//!
//! A `Connector` opens the long-lived HTTP request and hands back the multipart boundary and the
//! unbounded response body. A `ByteStreamReader` then pulls chunks from that body, bounding each
//! read by an idle timeout and giving up immediately on shutdown.
use std::str::FromStr;
use std::time;

use alert_common::multipart::boundary_from_content_type;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use http::StatusCode;
use reqwest::header;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::error::TransportError;

pub type ChunkStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// An established alert stream: the multipart boundary announced by the device and the body.
pub struct Connection {
    pub boundary: String,
    pub body: ChunkStream,
}

/// Opens connections to the device. The supervisor only talks to the device through this.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Connection, TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    None,
    Basic,
    Digest,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseAuthSchemeError(String);

impl FromStr for AuthScheme {
    type Err = ParseAuthSchemeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(AuthScheme::None),
            "basic" => Ok(AuthScheme::Basic),
            "digest" => Ok(AuthScheme::Digest),
            invalid => Err(ParseAuthSchemeError(invalid.to_owned())),
        }
    }
}

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Connects to the device over HTTP(S) with `reqwest`.
pub struct HttpConnector {
    client: reqwest::Client,
    endpoint: Url,
    connect_timeout: time::Duration,
    auth: AuthScheme,
    credentials: Option<Credentials>,
}

impl HttpConnector {
    /// The client has no overall request timeout, as the response never ends. Only the
    /// handshake is bounded by `connect_timeout`.
    pub fn new(
        endpoint: Url,
        connect_timeout: time::Duration,
        accept_invalid_certs: bool,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent("alert-worker/1.0")
            .connect_timeout(connect_timeout)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()?;

        Ok(Self {
            client,
            endpoint,
            connect_timeout,
            auth: AuthScheme::None,
            credentials: None,
        })
    }

    pub fn with_auth(mut self, auth: AuthScheme, credentials: Credentials) -> Self {
        self.auth = auth;
        self.credentials = Some(credentials);
        self
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, TransportError> {
        tokio::time::timeout(self.connect_timeout, request.send())
            .await
            .map_err(|_| TransportError::ConnectTimeout(self.connect_timeout))?
            .map_err(TransportError::ConnectError)
    }

    fn request(&self) -> reqwest::RequestBuilder {
        let request = self.client.get(self.endpoint.clone());
        match (&self.auth, &self.credentials) {
            (AuthScheme::Basic, Some(credentials)) => {
                request.basic_auth(&credentials.username, Some(&credentials.password))
            }
            _ => request,
        }
    }

    /// Answer a digest challenge from the device.
    fn digest_authorization(&self, challenge: &str) -> Result<String, TransportError> {
        let credentials = self
            .credentials
            .as_ref()
            .ok_or_else(|| TransportError::AuthError("no credentials configured".to_owned()))?;

        let uri = match self.endpoint.query() {
            Some(query) => format!("{}?{}", self.endpoint.path(), query),
            None => self.endpoint.path().to_owned(),
        };
        let context = digest_auth::AuthContext::new(
            credentials.username.as_str(),
            credentials.password.as_str(),
            uri.as_str(),
        );

        let mut prompt =
            digest_auth::parse(challenge).map_err(|e| TransportError::AuthError(e.to_string()))?;
        let answer = prompt
            .respond(&context)
            .map_err(|e| TransportError::AuthError(e.to_string()))?;

        Ok(answer.to_header_string())
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(&self) -> Result<Connection, TransportError> {
        let mut response = self.send(self.request()).await?;

        if response.status() == StatusCode::UNAUTHORIZED && self.auth == AuthScheme::Digest {
            let challenge = response
                .headers()
                .get_all(header::WWW_AUTHENTICATE)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .find(|value| is_digest_challenge(value))
                .ok_or_else(|| {
                    TransportError::AuthError("device sent no digest challenge".to_owned())
                })?;
            let authorization = self.digest_authorization(challenge)?;

            debug!("answering digest challenge");
            response = self
                .send(self.request().header(header::AUTHORIZATION, authorization))
                .await?;
        }

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::UnexpectedStatus(status));
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_owned();
        let boundary = boundary_from_content_type(&content_type)
            .ok_or(TransportError::MissingBoundary(content_type))?;

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| TransportError::ReadError(e.to_string())))
            .boxed();

        Ok(Connection { boundary, body })
    }
}

/// Devices may offer several schemes, one `WWW-Authenticate` header each.
fn is_digest_challenge(value: &str) -> bool {
    value
        .trim_start()
        .get(..6)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("digest"))
}

/// What a single read from the device produced.
#[derive(Debug)]
pub enum ReadOutcome {
    Chunk(Bytes),
    EndOfStream,
    /// Nothing arrived within the idle timeout.
    Stalled,
    Failed(TransportError),
    Cancelled,
}

pub struct ByteStreamReader {
    body: ChunkStream,
    idle_timeout: time::Duration,
    shutdown: CancellationToken,
}

impl ByteStreamReader {
    pub fn new(body: ChunkStream, idle_timeout: time::Duration, shutdown: CancellationToken) -> Self {
        Self {
            body,
            idle_timeout,
            shutdown,
        }
    }

    pub fn idle_timeout(&self) -> time::Duration {
        self.idle_timeout
    }

    pub async fn read_chunk(&mut self) -> ReadOutcome {
        tokio::select! {
            biased;

            _ = self.shutdown.cancelled() => ReadOutcome::Cancelled,

            next = tokio::time::timeout(self.idle_timeout, self.body.next()) => match next {
                Err(_) => ReadOutcome::Stalled,
                Ok(None) => ReadOutcome::EndOfStream,
                Ok(Some(Ok(chunk))) => ReadOutcome::Chunk(chunk),
                Ok(Some(Err(error))) => ReadOutcome::Failed(error),
            },
        }
    }
}
