use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use super::{Blob, BlobStore, Precondition};
use crate::error::{GraphError, Result};

const GENERATION_HEADER: &str = "x-goog-generation";

#[derive(Debug, Clone)]
pub struct GcsConfig {
    pub bucket: String,
    /// OAuth bearer token; requests go out unauthenticated without one.
    pub token: Option<String>,
    pub base_url: String,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl GcsConfig {
    pub fn new(bucket: &str, token: Option<String>) -> Self {
        Self {
            bucket: bucket.to_string(),
            token,
            base_url: "https://storage.googleapis.com".to_string(),
            max_retries: 3,
            retry_delay_ms: 200,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ObjectResource {
    generation: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectList {
    #[serde(default)]
    items: Vec<ListedObject>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListedObject {
    name: String,
}

/// A read failure, split by whether trying again can help.
enum ReadFailure {
    Transient(GraphError),
    Fatal(GraphError),
}

impl ReadFailure {
    fn into_inner(self) -> GraphError {
        match self {
            ReadFailure::Transient(e) | ReadFailure::Fatal(e) => e,
        }
    }
}

fn is_transient(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Google Cloud Storage over the JSON API.
#[derive(Debug, Clone)]
pub struct GcsBlobStore {
    client: Client,
    config: GcsConfig,
}

impl GcsBlobStore {
    pub fn new(config: GcsConfig) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self { client, config })
    }

    /// Create a store against a custom endpoint (emulators, tests).
    pub fn with_base_url(mut config: GcsConfig, base_url: String) -> Result<Self> {
        config.base_url = base_url;
        Self::new(config)
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.config.base_url)
            .map_err(|e| GraphError::Validation(format!("invalid GCS base url: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| GraphError::Validation("GCS base url cannot take a path".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn object_url(&self, key: &str) -> Result<Url> {
        self.url(&["storage", "v1", "b", &self.config.bucket, "o", key])
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn with_retries<T, F, Fut>(&self, key: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, ReadFailure>>,
    {
        let strategy = ExponentialBackoff::from_millis(self.config.retry_delay_ms)
            .max_delay(Duration::from_secs(5))
            .map(jitter)
            .take(self.config.max_retries);

        RetryIf::spawn(strategy, op, |e: &ReadFailure| matches!(e, ReadFailure::Transient(_)))
            .await
            .map_err(|e| {
                let err = e.into_inner();
                tracing::error!(key = %key, bucket = %self.config.bucket, error = %err, "GCS read failed");
                err
            })
    }

    async fn get_once(&self, key: &str) -> std::result::Result<Option<Blob>, ReadFailure> {
        let mut url = self.object_url(key).map_err(ReadFailure::Fatal)?;
        url.query_pairs_mut().append_pair("alt", "media");

        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(|e| ReadFailure::Transient(e.into()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = GraphError::storage(key, format!("GCS returned {}: {}", status, body));
            return Err(if is_transient(status) {
                ReadFailure::Transient(err)
            } else {
                ReadFailure::Fatal(err)
            });
        }

        let generation = response
            .headers()
            .get(GENERATION_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok())
            .ok_or_else(|| {
                ReadFailure::Fatal(GraphError::storage(key, "response missing object generation"))
            })?;
        let data = response
            .bytes()
            .await
            .map_err(|e| ReadFailure::Transient(e.into()))?;
        Ok(Some(Blob { data, generation }))
    }

    async fn list_page(
        &self,
        prefix: &str,
        page_token: Option<&str>,
    ) -> std::result::Result<ObjectList, ReadFailure> {
        let mut url = self
            .url(&["storage", "v1", "b", &self.config.bucket, "o"])
            .map_err(ReadFailure::Fatal)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("prefix", prefix);
            query.append_pair("fields", "items(name),nextPageToken");
            if let Some(token) = page_token {
                query.append_pair("pageToken", token);
            }
        }

        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(|e| ReadFailure::Transient(e.into()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = GraphError::storage(prefix, format!("GCS list returned {}: {}", status, body));
            return Err(if is_transient(status) {
                ReadFailure::Transient(err)
            } else {
                ReadFailure::Fatal(err)
            });
        }
        response
            .json::<ObjectList>()
            .await
            .map_err(|e| ReadFailure::Fatal(e.into()))
    }
}

#[async_trait]
impl BlobStore for GcsBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Blob>> {
        self.with_retries(key, || self.get_once(key)).await
    }

    async fn put(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
        condition: Precondition,
    ) -> Result<i64> {
        let mut url = self.url(&["upload", "storage", "v1", "b", &self.config.bucket, "o"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("uploadType", "media");
            query.append_pair("name", key);
            match condition {
                Precondition::None => {}
                // Generation 0 means "no live object" to GCS.
                Precondition::DoesNotExist => {
                    query.append_pair("ifGenerationMatch", "0");
                }
                Precondition::GenerationMatch(g) => {
                    query.append_pair("ifGenerationMatch", &g.to_string());
                }
            }
        }

        let response = self
            .authorize(self.client.post(url))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(data)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::PRECONDITION_FAILED {
            tracing::warn!(key = %key, "GCS write precondition failed");
            return Err(GraphError::Conflict {
                path: key.to_string(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(key = %key, status = %status, "GCS upload failed");
            return Err(GraphError::storage(
                key,
                format!("GCS upload returned {}: {}", status, body),
            ));
        }

        let resource: ObjectResource = response.json().await?;
        resource
            .generation
            .parse::<i64>()
            .map_err(|_| GraphError::storage(key, "upload response has a non-numeric generation"))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let token = page_token.clone();
            let page = self
                .with_retries(prefix, || self.list_page(prefix, token.as_deref()))
                .await?;
            keys.extend(page.items.into_iter().map(|o| o.name));
            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn name(&self) -> &str {
        "gcs"
    }

    fn location(&self) -> String {
        self.config.bucket.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, path_regex, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config() -> GcsConfig {
        GcsConfig {
            bucket: "bkt".to_string(),
            token: Some("test-token".to_string()),
            base_url: String::new(),
            max_retries: 2,
            retry_delay_ms: 10,
        }
    }

    async fn store(server: &MockServer) -> GcsBlobStore {
        GcsBlobStore::with_base_url(test_config(), server.uri()).expect("client")
    }

    #[tokio::test]
    async fn test_get_returns_body_and_generation() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/bkt/o/schema.json"))
            .and(query_param("alt", "media"))
            .and(header("authorization", "Bearer test-token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-goog-generation", "1700000000000001")
                    .set_body_string("{\"version\":\"1.0\"}"),
            )
            .mount(&server)
            .await;

        let blob = store(&server).await.get("schema.json").await.unwrap().unwrap();
        assert_eq!(blob.generation, 1_700_000_000_000_001);
        assert_eq!(&blob.data[..], b"{\"version\":\"1.0\"}");
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        assert!(store(&server).await.get("graph/nodes/task.jsonl").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_encodes_slashes_in_object_name() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/storage/v1/b/bkt/o/graph%2Findexes%2Fby_type\.json$"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-goog-generation", "5")
                    .set_body_string("{}"),
            )
            .mount(&server)
            .await;

        let blob = store(&server).await.get("graph/indexes/by_type.json").await.unwrap();
        assert_eq!(blob.unwrap().generation, 5);
    }

    #[tokio::test]
    async fn test_get_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-goog-generation", "2")
                    .set_body_string("ok"),
            )
            .mount(&server)
            .await;

        let blob = store(&server).await.get("k").await.unwrap().unwrap();
        assert_eq!(&blob.data[..], b"ok");
    }

    #[tokio::test]
    async fn test_get_does_not_retry_forbidden() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_string("denied"))
            .expect(1)
            .mount(&server)
            .await;

        let result = store(&server).await.get("k").await;
        assert!(matches!(result, Err(GraphError::Storage { .. })));
    }

    #[tokio::test]
    async fn test_put_sends_generation_precondition() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload/storage/v1/b/bkt/o"))
            .and(query_param("uploadType", "media"))
            .and(query_param("name", "graph/edges/relationships.jsonl"))
            .and(query_param("ifGenerationMatch", "41"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"name": "graph/edges/relationships.jsonl", "generation": "42"})),
            )
            .mount(&server)
            .await;

        let generation = store(&server)
            .await
            .put(
                "graph/edges/relationships.jsonl",
                Bytes::from_static(b"{}\n"),
                "application/jsonl",
                Precondition::GenerationMatch(41),
            )
            .await
            .unwrap();
        assert_eq!(generation, 42);
    }

    #[tokio::test]
    async fn test_put_precondition_failure_is_conflict() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(query_param("ifGenerationMatch", "0"))
            .respond_with(ResponseTemplate::new(412))
            .mount(&server)
            .await;

        let result = store(&server)
            .await
            .put("schema.json", Bytes::from_static(b"{}"), "application/json", Precondition::DoesNotExist)
            .await;
        assert!(matches!(result, Err(GraphError::Conflict { .. })));
    }

    #[tokio::test]
    async fn test_list_follows_page_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/bkt/o"))
            .and(query_param("pageToken", "p2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{"name": "g/nodes/a.jsonl"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/bkt/o"))
            .and(query_param("prefix", "g/nodes/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{"name": "g/nodes/b.jsonl"}],
                "nextPageToken": "p2"
            })))
            .mount(&server)
            .await;

        let keys = store(&server).await.list("g/nodes/").await.unwrap();
        assert_eq!(keys, vec!["g/nodes/a.jsonl", "g/nodes/b.jsonl"]);
    }
}
