use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::gateway::query::{Collection, CollectionQuery};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_RANGE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::{debug, warn};
use url::Url;

const API_KEY_HEADER: &str = "apikey";
const PREFER_HEADER: &str = "Prefer";

/// HTTP client for the backend's PostgREST surface
#[derive(Debug, Clone)]
pub struct RestClient {
    client: Client,
    rest_root: Url,
    api_key: String,
    bearer_token: String,
}

impl RestClient {
    /// Create a new REST client from configuration
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        let mut base = Url::parse(&config.url)
            .map_err(|e| Error::Config(format!("Invalid backend url {}: {}", config.url, e)))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let rest_root = base
            .join(&format!("{}/", config.rest_path.trim_matches('/')))
            .map_err(|e| Error::Config(format!("Invalid rest path {}: {}", config.rest_path, e)))?;

        Ok(Self {
            client,
            rest_root,
            api_key: config.api_key.clone(),
            bearer_token: config.bearer_token().to_string(),
        })
    }

    pub fn endpoint(&self, collection: Collection) -> Result<Url> {
        self.rest_root
            .join(collection.table_name())
            .map_err(|e| Error::Internal(format!("Failed to build {} endpoint: {}", collection, e)))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header(API_KEY_HEADER, &self.api_key)
            .header(AUTHORIZATION, format!("Bearer {}", self.bearer_token))
    }

    /// `GET /<collection>?select=..&<filters>&order=..`
    pub async fn select(&self, query: &CollectionQuery) -> Result<Vec<serde_json::Value>> {
        let url = self.endpoint(query.collection)?;
        debug!("GET {} {:?}", url, query.to_query_pairs());

        let response = self
            .authorized(self.client.get(url))
            .query(&query.to_query_pairs())
            .header(ACCEPT, "application/json")
            .send()
            .await?;
        let response = Self::check_status(response).await?;

        response
            .json::<Vec<serde_json::Value>>()
            .await
            .map_err(|e| Error::Transport(format!("Malformed {} response: {}", query.collection, e)))
    }

    /// `HEAD` with `Prefer: count=exact`; the total comes back in `Content-Range`.
    pub async fn count(&self, query: &CollectionQuery) -> Result<u64> {
        let url = self.endpoint(query.collection)?;
        debug!("HEAD {} {:?}", url, query.to_query_pairs());

        let response = self
            .authorized(self.client.head(url))
            .query(&query.to_query_pairs())
            .header(PREFER_HEADER, "count=exact")
            .send()
            .await?;
        let response = Self::check_status(response).await?;

        match content_range_total(&response) {
            Some(total) => Ok(total),
            None => {
                warn!("No count in {} response, assuming 0", query.collection);
                Ok(0)
            }
        }
    }

    /// `PATCH /<collection>?id=eq.<id>` with a partial body. A patch that
    /// matches no row is rejected rather than silently succeeding.
    pub async fn patch(&self, collection: Collection, id: &str, fields: &serde_json::Value) -> Result<()> {
        let url = self.endpoint(collection)?;
        debug!("PATCH {} id={} {}", url, id, fields);

        let response = self
            .authorized(self.client.patch(url))
            .query(&[("id", format!("eq.{}", id))])
            .header(PREFER_HEADER, "return=minimal,count=exact")
            .json(fields)
            .send()
            .await?;
        let response = Self::check_status(response).await?;

        if content_range_total(&response) == Some(0) {
            return Err(Error::Rejected {
                status: StatusCode::NOT_FOUND.as_u16(),
                message: format!("No {} row with id {}", collection, id),
            });
        }

        Ok(())
    }

    async fn check_status(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_failure(status, &body))
    }
}

fn content_range_total(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_content_range_total)
}

/// Total from a `Content-Range` value such as `0-24/3573` or `*/0`.
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    value
        .rsplit_once('/')
        .and_then(|(_, total)| total.trim().parse().ok())
}

/// Server-side and throttling failures are transport errors; every other
/// client error is a rejection.
pub fn classify_failure(status: StatusCode, body: &str) -> Error {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .or_else(|| Some(body.trim().to_string()).filter(|b| !b.is_empty()))
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("no reason").to_string());

    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        Error::Transport(format!("{}: {}", status, message))
    } else if status.is_client_error() {
        Error::Rejected {
            status: status.as_u16(),
            message,
        }
    } else {
        Error::Transport(format!("Unexpected status {}: {}", status, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_range_total() {
        assert_eq!(parse_content_range_total("0-24/3573"), Some(3573));
        assert_eq!(parse_content_range_total("*/0"), Some(0));
        assert_eq!(parse_content_range_total("0-9/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[test]
    fn test_classify_failure() {
        let err = classify_failure(
            StatusCode::FORBIDDEN,
            r#"{"code":"42501","message":"permission denied for table incidents"}"#,
        );
        assert_eq!(
            err,
            Error::Rejected {
                status: 403,
                message: "permission denied for table incidents".to_string()
            }
        );

        assert!(matches!(
            classify_failure(StatusCode::BAD_GATEWAY, ""),
            Error::Transport(_)
        ));
        assert!(matches!(
            classify_failure(StatusCode::TOO_MANY_REQUESTS, "slow down"),
            Error::Transport(_)
        ));
        assert_eq!(
            classify_failure(StatusCode::UNPROCESSABLE_ENTITY, "bad column"),
            Error::Rejected {
                status: 422,
                message: "bad column".to_string()
            }
        );
    }

    #[test]
    fn test_endpoint_respects_base_path() {
        let config = BackendConfig {
            url: "http://localhost:8000/proxy".to_string(),
            api_key: "k".to_string(),
            ..BackendConfig::default()
        };
        let client = RestClient::new(&config).unwrap();
        assert_eq!(
            client.endpoint(Collection::Incidents).unwrap().as_str(),
            "http://localhost:8000/proxy/rest/v1/incidents"
        );
    }
}
