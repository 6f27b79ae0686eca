use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    ApiClient, BoxFuture, CoreClient, DiscoveryClient, MetadataCrateReader, ServiceDiscoveryResult,
};
use crate::model::{
    CrateId, CreateDatasetEntry, DatasetDefinition, DatasetEntry, DatasetMetadata, Manifest,
};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HttpCredentials {
    Basic { username: String, password: String },
    BearerToken { token: String },
}

fn authorize(
    credentials: &Option<HttpCredentials>,
    request: reqwest::RequestBuilder,
) -> reqwest::RequestBuilder {
    match credentials {
        Some(HttpCredentials::Basic { username, password }) => {
            request.basic_auth(username, Some(password))
        }
        Some(HttpCredentials::BearerToken { token }) => request.bearer_auth(token),
        None => request,
    }
}

fn endpoint(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

async fn read_json<T: serde::de::DeserializeOwned>(res: reqwest::Response) -> Result<T> {
    let status = res.status();
    let body = res.text().await?;
    if !status.is_success() {
        return Err(Error::remote(format!("http {status}: {body}")));
    }
    serde_json::from_str(&body).map_err(|e| Error::Remote {
        message: format!("invalid json: {e}; body={body}"),
    })
}

async fn read_optional_json<T: serde::de::DeserializeOwned>(
    res: reqwest::Response,
) -> Result<Option<T>> {
    if res.status() == reqwest::StatusCode::NOT_FOUND {
        return Ok(None);
    }
    read_json(res).await.map(Some)
}

pub struct HttpCoreClient {
    id: String,
    base_url: String,
    credentials: Option<HttpCredentials>,
    client: reqwest::Client,
}

impl HttpCoreClient {
    pub fn new(
        id: impl Into<String>,
        base_url: impl Into<String>,
        credentials: Option<HttpCredentials>,
    ) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into(),
            credentials,
            client: reqwest::Client::new(),
        }
    }
}

impl CoreClient for HttpCoreClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn push<'a>(&'a self, manifest: Manifest, content: Vec<u8>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let url = endpoint(&self.base_url, &format!("crates/{}", manifest.crate_id));
            let request = self
                .client
                .put(url)
                .query(&[
                    ("size", manifest.size.to_string()),
                    ("copies", manifest.copies.to_string()),
                    ("origin", manifest.origin.to_string()),
                    ("source", manifest.source.to_string()),
                ])
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(content);

            let res = authorize(&self.credentials, request).send().await?;
            let status = res.status();
            if !status.is_success() {
                let body = res.text().await.unwrap_or_default();
                return Err(Error::remote(format!(
                    "push of crate {} failed: http {status}: {body}",
                    manifest.crate_id
                )));
            }
            Ok(())
        })
    }

    fn pull<'a>(&'a self, crate_id: CrateId) -> BoxFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move {
            let url = endpoint(&self.base_url, &format!("crates/{crate_id}"));
            let res = authorize(&self.credentials, self.client.get(url)).send().await?;
            let status = res.status();
            if status == reqwest::StatusCode::NOT_FOUND {
                return Ok(None);
            }
            if !status.is_success() {
                let body = res.text().await.unwrap_or_default();
                return Err(Error::remote(format!(
                    "pull of crate {crate_id} failed: http {status}: {body}"
                )));
            }
            Ok(Some(res.bytes().await?.to_vec()))
        })
    }
}

pub struct HttpApiClient {
    id: String,
    base_url: String,
    credentials: Option<HttpCredentials>,
    client: reqwest::Client,
    metadata: MetadataCrateReader,
}

#[derive(Debug, Deserialize)]
struct CreatedEntry {
    entry: Uuid,
}

impl HttpApiClient {
    pub fn new(
        id: impl Into<String>,
        base_url: impl Into<String>,
        credentials: Option<HttpCredentials>,
        metadata: MetadataCrateReader,
    ) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into(),
            credentials,
            client: reqwest::Client::new(),
            metadata,
        }
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let request = self.client.get(endpoint(&self.base_url, path));
        Ok(authorize(&self.credentials, request).send().await?)
    }
}

impl ApiClient for HttpApiClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn dataset_definitions<'a>(&'a self) -> BoxFuture<'a, Vec<DatasetDefinition>> {
        Box::pin(async move { read_json(self.get("v1/datasets/definitions/own").await?).await })
    }

    fn dataset_definition<'a>(&'a self, definition: Uuid) -> BoxFuture<'a, DatasetDefinition> {
        Box::pin(async move {
            read_json(
                self.get(&format!("v1/datasets/definitions/own/{definition}"))
                    .await?,
            )
            .await
        })
    }

    fn dataset_entries<'a>(&'a self, definition: Uuid) -> BoxFuture<'a, Vec<DatasetEntry>> {
        Box::pin(async move {
            read_json(
                self.get(&format!("v1/datasets/entries/own/for-definition/{definition}"))
                    .await?,
            )
            .await
        })
    }

    fn dataset_entry<'a>(&'a self, entry: Uuid) -> BoxFuture<'a, DatasetEntry> {
        Box::pin(async move {
            read_json(self.get(&format!("v1/datasets/entries/own/{entry}")).await?).await
        })
    }

    fn latest_entry<'a>(
        &'a self,
        definition: Uuid,
        until: Option<DateTime<Utc>>,
    ) -> BoxFuture<'a, Option<DatasetEntry>> {
        Box::pin(async move {
            let mut path = format!("v1/datasets/entries/own/for-definition/{definition}/latest");
            if let Some(until) = until {
                path.push_str(&format!("?until={}", until.timestamp()));
            }
            read_optional_json(self.get(&path).await?).await
        })
    }

    fn create_dataset_entry<'a>(&'a self, request: CreateDatasetEntry) -> BoxFuture<'a, Uuid> {
        Box::pin(async move {
            let builder = self
                .client
                .post(endpoint(&self.base_url, "v1/datasets/entries"))
                .json(&request);
            let res = authorize(&self.credentials, builder).send().await?;
            let created: CreatedEntry = read_json(res).await?;
            Ok(created.entry)
        })
    }

    fn dataset_metadata<'a>(&'a self, entry: &'a DatasetEntry) -> BoxFuture<'a, DatasetMetadata> {
        Box::pin(async move { self.metadata.read(entry).await })
    }
}

pub struct HttpDiscoveryClient {
    id: String,
    base_url: String,
    credentials: Option<HttpCredentials>,
    client: reqwest::Client,
}

impl HttpDiscoveryClient {
    pub fn new(
        id: impl Into<String>,
        base_url: impl Into<String>,
        credentials: Option<HttpCredentials>,
    ) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into(),
            credentials,
            client: reqwest::Client::new(),
        }
    }
}

impl DiscoveryClient for HttpDiscoveryClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn latest<'a>(&'a self, is_initial_request: bool) -> BoxFuture<'a, ServiceDiscoveryResult> {
        Box::pin(async move {
            let request = self
                .client
                .get(endpoint(&self.base_url, "v1/discovery/provide"))
                .query(&[("initial", is_initial_request)]);
            let res = authorize(&self.credentials, request).send().await?;
            read_json(res).await
        })
    }
}
