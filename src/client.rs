use futures::stream::Stream;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{Method, RequestBuilder, Response};
use serde::{Serialize, de::DeserializeOwned};
use std::pin::Pin;
use tracing::{Level, event, instrument};

use crate::event_stream::{self, SseEvent};

pub type BoxedStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

/// JSON client bound to one API base URL.
#[derive(Clone)]
pub struct Client {
    client: reqwest::Client,
    base_url: String,
}

impl Client {
    pub fn new(base_url: &str) -> Self {
        Client {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Client that authenticates every request with a bearer token.
    pub fn with_token(base_url: &str, token: &str) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token))?,
        );
        Ok(Client {
            client: reqwest::Client::builder()
                .default_headers(headers)
                .build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Raw request builder for callers that need headers beyond JSON.
    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client.request(method, url)
    }

    #[instrument(level = "info", skip(self))]
    pub async fn get<T>(&self, path: &str, query: &[(&str, String)]) -> anyhow::Result<T>
    where
        T: DeserializeOwned,
    {
        let response = self.client.get(self.url(path)).query(query).send().await?;
        Self::decode(response).await
    }

    #[instrument(level = "info", skip(self, request), fields(json_request = serde_json::to_string(request).unwrap_or_default()))]
    pub async fn post<S, T>(
        &self,
        path: &str,
        query: &[(&str, String)],
        request: &S,
    ) -> anyhow::Result<T>
    where
        S: Serialize + Sized,
        T: DeserializeOwned,
    {
        let response = self
            .client
            .post(self.url(path))
            .query(query)
            .json(request)
            .send()
            .await?;
        Self::decode(response).await
    }

    #[instrument(level = "info", skip(self, request), fields(json_request = serde_json::to_string(request).unwrap_or_default()))]
    pub async fn put<S, T>(
        &self,
        path: &str,
        query: &[(&str, String)],
        request: &S,
    ) -> anyhow::Result<T>
    where
        S: Serialize + Sized,
        T: DeserializeOwned,
    {
        let response = self
            .client
            .put(self.url(path))
            .query(query)
            .json(request)
            .send()
            .await?;
        Self::decode(response).await
    }

    #[instrument(level = "info", skip(self))]
    pub async fn delete(&self, path: &str, query: &[(&str, String)]) -> anyhow::Result<()> {
        let response = self
            .client
            .delete(self.url(path))
            .query(query)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    /// Open a server-sent event channel.
    #[instrument(level = "info", skip(self))]
    pub async fn event_source(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> anyhow::Result<BoxedStream<anyhow::Result<SseEvent>>> {
        let response = self
            .client
            .get(self.url(path))
            .query(query)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(event_stream::decode(response.bytes_stream()))
    }

    async fn check(response: Response) -> anyhow::Result<Response> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!(
                "Request failed with status: {} - {}",
                status,
                body
            ));
        }
        Ok(response)
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> anyhow::Result<T> {
        let response = Self::check(response).await?;
        let text = response.text().await?;
        event!(Level::DEBUG, response = text);

        Ok(serde_json::from_str::<T>(&text)?)
    }
}
