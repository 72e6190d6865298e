//! A minimal HTTP layer. Geocoding and downloads both go through
//! [`HttpFetcher`], so that tests can replace the network.

use std::{sync::Arc, time::Instant};

use anyhow::{format_err, Context};
use async_trait::async_trait;
use futures::StreamExt;
use hyper::{body::Bytes, client::HttpConnector, header, Body, Client, Request};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use metrics::{counter, describe_histogram, histogram, Unit};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::instrument;
use url::Url;

use crate::errors::hyper_error_description_for_metrics;
use crate::Result;

/// The `User-Agent` we send. Nominatim's usage policy requires an
/// identifying agent.
pub const USER_AGENT: &str =
    concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// A `hyper` client shared between multiple workers.
pub type SharedHttpClient = Arc<Client<HttpsConnector<HttpConnector>>>;

pub fn shared_http_client(concurrency: usize) -> SharedHttpClient {
    // Create a shared `hyper::Client` with a connection pool, so that we can
    // use keep-alive.
    Arc::new(
        Client::builder().pool_max_idle_per_host(concurrency).build(
            HttpsConnectorBuilder::new()
                .with_native_roots()
                .https_or_http()
                .enable_http1()
                .enable_http2()
                .build(),
        ),
    )
}

/// A complete HTTP response.
#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Something that can perform an HTTP GET request.
///
/// This returns an error only if we never got a response at all. Error
/// statuses are returned as normal responses.
#[async_trait]
pub trait HttpFetcher: Send + Sync + 'static {
    /// Fetch `url` and read the entire body.
    async fn get(&self, url: &Url) -> Result<HttpResponse>;
}

/// The real implementation of [`HttpFetcher`].
pub struct HyperFetcher {
    /// Used to label our metrics.
    component: &'static str,
    client: SharedHttpClient,
}

impl HyperFetcher {
    pub fn new(component: &'static str, client: SharedHttpClient) -> HyperFetcher {
        describe_histogram!(
            "ticketgeocode.http_request.duration_seconds",
            Unit::Seconds,
            "Time required for a single HTTP request"
        );
        HyperFetcher { component, client }
    }

    /// Send a GET request and return the response head and body stream.
    async fn send(&self, url: &Url) -> Result<hyper::Response<Body>> {
        let req = Request::builder()
            .method("GET")
            .uri(url.as_str())
            .header(header::USER_AGENT, USER_AGENT)
            .header(header::ACCEPT, "application/json")
            .body(Body::empty())?;
        match self.client.request(req).await {
            Ok(res) => Ok(res),
            Err(err) => {
                // Errors that occur here are being reported by our local HTTP
                // stack, not the remote server.
                let desc = hyper_error_description_for_metrics(&err);
                counter!("ticketgeocode.selected_errors.count", 1, "component" => self.component, "cause" => desc);
                Err(err.into())
            }
        }
    }

    /// Stream the body of `url` into `out`, returning the number of bytes
    /// written. Fails on any non-2xx status.
    #[instrument(level = "debug", skip(self, url, out), fields(url = %url))]
    pub async fn download<W>(&self, url: &Url, out: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let res = self.send(url).await?;
        let status = res.status();
        if !status.is_success() {
            return Err(format_err!("could not download {}: {}", url, status));
        }
        let mut body = res.into_body();
        let mut written = 0;
        while let Some(chunk_result) = body.next().await {
            let chunk = chunk_result.context("error reading download body")?;
            out.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        out.flush().await?;
        Ok(written)
    }
}

#[async_trait]
impl HttpFetcher for HyperFetcher {
    async fn get(&self, url: &Url) -> Result<HttpResponse> {
        let start = Instant::now();
        let res = self.send(url).await?;
        let status = res.status();
        let body = hyper::body::to_bytes(res.into_body())
            .await
            .context("error reading response body")?;

        histogram!(
            "ticketgeocode.http_request.duration_seconds",
            (Instant::now() - start).as_secs_f64(),
            "component" => self.component,
        );

        if !status.is_success() {
            // This error was reported by the remote server.
            counter!("ticketgeocode.selected_errors.count", 1, "component" => self.component, "cause" => status.as_str().to_owned());
        }
        Ok(HttpResponse {
            status: status.as_u16(),
            body,
        })
    }
}
