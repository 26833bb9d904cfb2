//! RemoteStore backed by the state-conductor data services over HTTP
//!
//! Every data-service call is a form-encoded `POST` to
//! `/state-conductor/dataservices/<name>.sjs`; multi-valued parameters are
//! sent as repeated keys. The active node count is evaluated on the app
//! services port through `/v1/eval`.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, instrument, trace};

use super::{CandidateQuery, ItemResult, RemoteStore, StoreError};

const DATA_SERVICES_PATH: &str = "/state-conductor/dataservices";

/// Counts hosts whose status carries no error
const ACTIVE_HOSTS_QUERY: &str = "xdmp.hosts().toArray().map(id => fn.head(xdmp.hostStatus(id))).filter(status => !status.error).length";

/// Connection settings for [`HttpRemoteStore`]
#[derive(Debug, Clone)]
pub struct HttpStoreConfig {
    /// Base URL of the data services app server, e.g. `http://localhost:8000`
    pub base_url: String,
    /// Base URL of the app server that accepts `/v1/eval`
    pub app_services_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Database holding the execution documents, passed to `/v1/eval`
    pub database: Option<String>,
    pub timeout: Duration,
}

impl HttpStoreConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            app_services_url: base_url.clone(),
            base_url,
            username: None,
            password: None,
            database: None,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_app_services_url(mut self, url: impl Into<String>) -> Self {
        self.app_services_url = url.into();
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// HTTP client for the state-conductor data services
pub struct HttpRemoteStore {
    client: reqwest::Client,
    config: HttpStoreConfig,
}

impl HttpRemoteStore {
    pub fn new(config: HttpStoreConfig) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn service_url(&self, service: &str) -> String {
        format!(
            "{}{}/{}",
            self.config.base_url.trim_end_matches('/'),
            DATA_SERVICES_PATH,
            service
        )
    }

    async fn post_form(&self, url: String, params: &[(&str, String)]) -> Result<String, StoreError> {
        trace!(%url, ?params, "POST");
        let mut request = self.client.post(&url).form(params);
        if let Some(username) = &self.config.username {
            request = request.basic_auth(username, self.config.password.as_deref());
        }

        let response = request
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(StoreError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }

    async fn call_service(&self, service: &str, params: &[(&str, String)]) -> Result<String, StoreError> {
        self.post_form(self.service_url(service), params).await
    }
}

fn parse_string_list(body: &str) -> Result<Vec<String>, StoreError> {
    if body.trim().is_empty() {
        return Ok(vec![]);
    }
    serde_json::from_str::<Vec<String>>(body).map_err(|e| StoreError::Decode(e.to_string()))
}

fn parse_item_results(body: &str) -> Result<Vec<ItemResult>, StoreError> {
    let entries: Vec<Value> =
        serde_json::from_str(body).map_err(|e| StoreError::Decode(e.to_string()))?;

    entries
        .into_iter()
        .map(|entry| {
            let id = entry
                .get("execution")
                .and_then(Value::as_str)
                .ok_or_else(|| StoreError::Decode(format!("result without execution: {entry}")))?;

            let error = match entry.get("error") {
                None | Some(Value::Null) => None,
                Some(Value::String(message)) => Some(message.clone()),
                Some(other) => Some(other.to_string()),
            };

            Ok(match error {
                Some(error) => ItemResult::failure(id, error),
                None => ItemResult::success(id),
            })
        })
        .collect()
}

/// Read the first integer line from a `/v1/eval` response (multipart or plain)
fn parse_eval_count(body: &str) -> Result<usize, StoreError> {
    body.lines()
        .map(str::trim)
        .find_map(|line| line.parse::<usize>().ok())
        .ok_or_else(|| StoreError::Decode(format!("no integer in eval response: {body}")))
}

fn parse_identifier(body: &str) -> Result<String, StoreError> {
    let trimmed = body.trim();
    let id = serde_json::from_str::<String>(trimmed).unwrap_or_else(|_| trimmed.to_string());
    if id.is_empty() {
        return Err(StoreError::Decode("empty identifier returned".into()));
    }
    Ok(id)
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    #[instrument(skip(self), fields(start = query.start, count = query.count))]
    async fn fetch_candidates(&self, query: &CandidateQuery) -> Result<Vec<String>, StoreError> {
        let mut params = vec![
            ("start", query.start.to_string()),
            ("count", query.count.to_string()),
        ];
        if let Some(names) = &query.names {
            params.push(("names", names.clone()));
        }
        params.extend(query.status.iter().map(|s| ("status", s.clone())));

        let body = self.call_service("getExecutions.sjs", &params).await?;
        parse_string_list(&body)
    }

    #[instrument(skip(self, ids), fields(size = ids.len()))]
    async fn process_batch(&self, ids: &[String]) -> Result<Vec<ItemResult>, StoreError> {
        let params: Vec<(&str, String)> = ids.iter().map(|id| ("uri", id.clone())).collect();
        let body = self.call_service("processExecution.sjs", &params).await?;
        parse_item_results(&body)
    }

    async fn create_work_item(&self, target_uri: &str, kind: &str) -> Result<String, StoreError> {
        let params = [("uri", target_uri.to_string()), ("name", kind.to_string())];
        let body = self.call_service("createExecution.sjs", &params).await?;
        let id = parse_identifier(&body)?;
        debug!(target_uri, execution = %id, "created execution");
        Ok(id)
    }

    async fn active_node_count(&self) -> Result<usize, StoreError> {
        let url = format!(
            "{}/v1/eval",
            self.config.app_services_url.trim_end_matches('/')
        );
        let mut params = vec![("javascript", ACTIVE_HOSTS_QUERY.to_string())];
        if let Some(database) = &self.config.database {
            params.push(("database", database.clone()));
        }
        let body = self.post_form(url, &params).await?;
        parse_eval_count(&body)
    }

    async fn find_targets(
        &self,
        kind: &str,
        start: usize,
        count: usize,
    ) -> Result<Vec<String>, StoreError> {
        let params = [
            ("name", kind.to_string()),
            ("start", start.to_string()),
            ("count", count.to_string()),
        ];
        let body = self.call_service("findStateMachineTargets.sjs", &params).await?;
        parse_string_list(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn store_for(server: &MockServer) -> HttpRemoteStore {
        HttpRemoteStore::new(HttpStoreConfig::new(server.uri())).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_candidates_sends_paging_and_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/state-conductor/dataservices/getExecutions.sjs"))
            .and(body_string_contains("start=1001"))
            .and(body_string_contains("count=1000"))
            .and(body_string_contains("status=new"))
            .and(body_string_contains("status=working"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(["/e/1", "/e/2"])))
            .expect(1)
            .mount(&server)
            .await;

        let store = store_for(&server).await;
        let query = CandidateQuery {
            status: vec!["new".into(), "working".into()],
            ..CandidateQuery::page(1001, 1000)
        };
        let ids = store.fetch_candidates(&query).await.unwrap();
        assert_eq!(ids, vec!["/e/1", "/e/2"]);
    }

    #[tokio::test]
    async fn test_process_batch_maps_errors_to_business_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/state-conductor/dataservices/processExecution.sjs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"execution": "/e/1", "result": true},
                {"execution": "/e/2", "error": {"name": "Error", "message": "bad state"}},
                {"execution": "/e/3", "error": "timeout in state"}
            ])))
            .mount(&server)
            .await;

        let store = store_for(&server).await;
        let ids = vec!["/e/1".to_string(), "/e/2".to_string(), "/e/3".to_string()];
        let results = store.process_batch(&ids).await.unwrap();

        assert_eq!(results[0], ItemResult::success("/e/1"));
        assert!(!results[1].succeeded);
        assert!(results[1].error.as_deref().unwrap().contains("bad state"));
        assert_eq!(results[2], ItemResult::failure("/e/3", "timeout in state"));
    }

    #[tokio::test]
    async fn test_non_success_status_is_a_call_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/state-conductor/dataservices/processExecution.sjs"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let store = store_for(&server).await;
        let err = store.process_batch(&["/e/1".to_string()]).await.unwrap_err();
        assert!(matches!(err, StoreError::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_active_node_count_reads_multipart_eval() {
        let server = MockServer::start().await;
        let body = "\r\n--abc\r\nContent-Type: text/plain\r\nX-Primitive: integer\r\n\r\n3\r\n--abc--\r\n";
        Mock::given(method("POST"))
            .and(path("/v1/eval"))
            .and(body_string_contains("javascript="))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let config = HttpStoreConfig::new(server.uri()).with_credentials("admin", "admin");
        let store = HttpRemoteStore::new(config).unwrap();
        assert_eq!(store.active_node_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_create_work_item_returns_identifier() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/state-conductor/dataservices/createExecution.sjs"))
            .and(body_string_contains("name=orders"))
            .respond_with(ResponseTemplate::new(200).set_body_string("\"3f2a-77\""))
            .mount(&server)
            .await;

        let store = store_for(&server).await;
        let id = store.create_work_item("/docs/1.json", "orders").await.unwrap();
        assert_eq!(id, "3f2a-77");
    }

    #[test]
    fn test_parse_helpers() {
        assert!(parse_string_list("").unwrap().is_empty());
        assert!(matches!(parse_string_list("{"), Err(StoreError::Decode(_))));
        assert_eq!(parse_eval_count("7").unwrap(), 7);
        assert!(parse_eval_count("no hosts").is_err());
        assert!(parse_item_results("[{\"error\": \"x\"}]").is_err());
        assert_eq!(parse_identifier(" plain-id \n").unwrap(), "plain-id");
    }
}
