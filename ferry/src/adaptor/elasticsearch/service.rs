use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::{Certificate, Client as HttpClient, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::adaptor::elasticsearch::request::{BulkRequest, bulk_body};
use crate::bail;
use crate::bulk::{BulkItemResponse, BulkResponse, BulkService};
use crate::error::{ErrorKind, FerryResult};
use crate::ferry_error;

const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// Basic authentication taken from the user info of a cluster URI.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: Option<SecretString>,
}

/// Commits batches through the `_bulk` endpoint of an Elasticsearch cluster.
#[derive(Debug, Clone)]
pub struct HttpBulkService {
    http: HttpClient,
    base_url: Url,
    credentials: Option<Credentials>,
}

impl HttpBulkService {
    pub fn new(
        base_url: Url,
        credentials: Option<Credentials>,
        timeout: Option<Duration>,
        root_certificates: Vec<Certificate>,
    ) -> FerryResult<Self> {
        let mut builder = HttpClient::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        for certificate in root_certificates {
            builder = builder.add_root_certificate(certificate);
        }
        let http = builder.build().map_err(|err| {
            ferry_error!(
                ErrorKind::ConfigError,
                "Could not build HTTP client",
                err.to_string(),
                source: err
            )
        })?;

        Ok(Self {
            http,
            base_url,
            credentials,
        })
    }

    fn bulk_url(&self) -> FerryResult<Url> {
        self.base_url.join("_bulk").map_err(|err| {
            ferry_error!(
                ErrorKind::ConfigError,
                "Invalid Elasticsearch URI",
                err.to_string(),
                source: err
            )
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.credentials {
            Some(credentials) => request.basic_auth(
                &credentials.username,
                credentials
                    .password
                    .as_ref()
                    .map(|password| password.expose_secret()),
            ),
            None => request,
        }
    }
}

impl BulkService for HttpBulkService {
    type Request = BulkRequest;

    async fn commit(&self, requests: &[BulkRequest]) -> FerryResult<BulkResponse> {
        let body = bulk_body(requests)?;
        debug!(requests = requests.len(), bytes = body.len(), "posting bulk request");

        let response = self
            .authorize(self.http.post(self.bulk_url()?))
            .header(CONTENT_TYPE, NDJSON_CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .map_err(|err| {
                ferry_error!(
                    ErrorKind::BulkCommitFailed,
                    "Bulk request could not be delivered",
                    self.base_url.as_str(),
                    source: err
                )
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!(
                ErrorKind::BulkCommitFailed,
                "Elasticsearch rejected the bulk request",
                format!("status {status}: {text}")
            );
        }

        let response: BulkApiResponse = response.json().await?;

        Ok(response.into_bulk_response())
    }

    /// Checks that the cluster answers on its root endpoint.
    async fn ping(&self) -> FerryResult<()> {
        let response = self
            .authorize(self.http.get(self.base_url.clone()))
            .send()
            .await
            .map_err(|err| {
                ferry_error!(
                    ErrorKind::DestinationConnectionFailed,
                    "Elasticsearch cluster is unreachable",
                    self.base_url.as_str(),
                    source: err
                )
            })?;

        if !response.status().is_success() {
            bail!(
                ErrorKind::DestinationConnectionFailed,
                "Elasticsearch cluster rejected the connection",
                format!("{} answered {}", self.base_url, response.status())
            );
        }

        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct BulkApiResponse {
    took: u64,
    #[serde(default)]
    items: Vec<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct BulkApiItem {
    #[serde(rename = "_id")]
    id: Option<String>,
    status: u16,
    error: Option<Value>,
}

impl BulkApiResponse {
    fn into_bulk_response(self) -> BulkResponse {
        let items = self
            .items
            .into_iter()
            .map(|item| {
                // Every item is keyed by its action name.
                let parsed = item
                    .into_iter()
                    .next()
                    .and_then(|(_, outcome)| serde_json::from_value::<BulkApiItem>(outcome).ok());

                match parsed {
                    Some(BulkApiItem {
                        id,
                        status,
                        error: Some(error),
                    }) => BulkItemResponse::failed(id, status, error_reason(&error)),
                    Some(BulkApiItem { id, status, .. }) => BulkItemResponse::ok(id, status),
                    None => BulkItemResponse::failed(None, 0, "unreadable bulk item"),
                }
            })
            .collect();

        BulkResponse {
            took: Duration::from_millis(self.took),
            items,
        }
    }
}

fn error_reason(error: &Value) -> String {
    error
        .get("reason")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_bulk_api_response() {
        let raw = json!({
            "took": 30,
            "errors": true,
            "items": [
                {"index": {"_id": "1", "status": 201}},
                {"update": {"_id": "2", "status": 404, "error": {
                    "type": "document_missing_exception",
                    "reason": "document missing"
                }}},
                {"delete": {"_id": "3", "status": 200}}
            ]
        });

        let response: BulkApiResponse = serde_json::from_value(raw).unwrap();
        let response = response.into_bulk_response();

        assert_eq!(response.took, Duration::from_millis(30));
        assert_eq!(response.succeeded(), 2);
        assert_eq!(response.failed(), 1);
        assert_eq!(
            response.items[1],
            BulkItemResponse::failed(Some("2".to_string()), 404, "document missing")
        );
    }

    #[test]
    fn bulk_url_is_relative_to_the_cluster() {
        let service = HttpBulkService::new(
            Url::parse("http://localhost:9200/").unwrap(),
            None,
            Some(Duration::from_secs(5)),
            Vec::new(),
        )
        .unwrap();

        assert_eq!(
            service.bulk_url().unwrap().as_str(),
            "http://localhost:9200/_bulk"
        );
    }

    #[tokio::test]
    async fn unreachable_cluster_fails_commits_softly_and_pings_fatally() {
        let service = HttpBulkService::new(
            Url::parse("http://127.0.0.1:1/").unwrap(),
            None,
            Some(Duration::from_secs(5)),
            Vec::new(),
        )
        .unwrap();
        let requests = [BulkRequest::Delete {
            index: "shop".to_string(),
            doc_type: "orders".to_string(),
            id: "1".to_string(),
        }];

        let err = service.commit(&requests).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BulkCommitFailed);
        assert!(!err.kind().is_fatal());

        let err = service.ping().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DestinationConnectionFailed);
        assert!(err.kind().is_fatal());
    }
}
