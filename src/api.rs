use async_trait::async_trait;
use reqwest::Method;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RunError;

pub const DEFAULT_API_HOST: &str = "https://slack.com";

const CONNECTIONS_OPEN_METHOD: &str = "apps.connections.open";
const AUTH_TEST_METHOD: &str = "auth.test";
const ACTIVITIES_LIST_METHOD: &str = "apps.activities.list";
const DEVELOPER_INSTALL_METHOD: &str = "apps.developerInstall";
const APP_DELETE_METHOD: &str = "apps.delete";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AuthSession {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(rename = "user", default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(rename = "team", default)]
    pub team_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivityRequest {
    pub app_id: String,
    pub limit: u32,
    pub min_level: String,
    pub event_type: String,
    pub min_date_created: i64,
    pub max_date_created: i64,
    pub component_type: String,
    pub component_id: String,
    pub source: String,
    pub trace_id: String,
}

impl ActivityRequest {
    /// Query string for `apps.activities.list`; unset filters are omitted.
    pub fn query(&self) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("app_id", self.app_id.clone()),
            ("limit", self.limit.to_string()),
        ];
        let optional = [
            ("min_log_level", &self.min_level),
            ("log_event_type", &self.event_type),
            ("component_type", &self.component_type),
            ("component_id", &self.component_id),
            ("source", &self.source),
            ("trace_id", &self.trace_id),
        ];
        query.extend(
            optional
                .into_iter()
                .filter(|(_, value)| !value.is_empty())
                .map(|(key, value)| (key, value.clone())),
        );
        if self.min_date_created != 0 {
            query.push(("min_date_created", self.min_date_created.to_string()));
        }
        if self.max_date_created != 0 {
            query.push(("max_date_created", self.max_date_created.to_string()));
        }
        query
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Activity {
    #[serde(default)]
    pub trace_id: String,
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub component_type: String,
    #[serde(default)]
    pub component_id: String,
    #[serde(default)]
    pub payload: Option<Map<String, Value>>,
    /// Microseconds since the epoch.
    #[serde(default)]
    pub created: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActivityResult {
    pub activities: Vec<Activity>,
    pub next_cursor: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstallRequest {
    pub app_id: String,
    #[serde(rename = "team_id", skip_serializing_if = "Option::is_none")]
    pub org_grant_workspace_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallState {
    #[default]
    Success,
    RequestPending,
    RequestCancelled,
    RequestNotSent,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallResult {
    pub app_id: String,
    pub bot_token: String,
    pub app_level_token: String,
    pub state: InstallState,
}

/// The platform endpoints the local run depends on.
#[async_trait]
pub trait PlatformApi: Send + Sync {
    /// Returns a fresh relay connection URL for an app-level token.
    async fn connections_open(&self, app_token: &str) -> Result<String, RunError>;

    async fn validate_session(&self, token: &str) -> Result<AuthSession, RunError>;

    async fn activity(
        &self,
        token: &str,
        request: &ActivityRequest,
    ) -> Result<ActivityResult, RunError>;

    async fn install_local_app(
        &self,
        token: &str,
        request: &InstallRequest,
    ) -> Result<InstallResult, RunError>;

    async fn delete_app(&self, token: &str, app_id: &str) -> Result<(), RunError>;
}

#[derive(Deserialize)]
struct ConnectionsOpenResponse {
    url: String,
}

#[derive(Deserialize)]
struct ActivitiesResponse {
    #[serde(default)]
    activities: Vec<Activity>,
    #[serde(default)]
    response_metadata: ResponseMetadata,
}

#[derive(Default, Deserialize)]
struct ResponseMetadata {
    #[serde(default)]
    next_cursor: String,
}

#[derive(Default, Deserialize)]
struct ApiAccessTokens {
    #[serde(default)]
    bot: String,
    #[serde(default)]
    app_level: String,
}

#[derive(Deserialize)]
struct DeveloperInstallResponse {
    #[serde(default)]
    app_id: Option<String>,
    #[serde(default)]
    api_access_tokens: ApiAccessTokens,
}

const PENDING_APPROVAL_ERRORS: [&str; 2] = ["app_approval_request_pending", "app_approval_request_eligible"];
const DENIED_APPROVAL_ERRORS: [&str; 1] = ["app_approval_request_denied"];

/// `reqwest` client for the platform Web API.
#[derive(Clone)]
pub struct PlatformClient {
    http: reqwest::Client,
    base_url: String,
}

impl PlatformClient {
    pub fn new(api_host: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: format!("{}/api", api_host.trim_end_matches('/')),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        api_method: &str,
        token: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<T, RunError> {
        let url = format!("{}/{}", self.base_url, api_method);
        let mut request = self
            .http
            .request(method, &url)
            .bearer_auth(token)
            .query(query);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let res = request.send().await?;
        let status = res.status();
        let body: Value = res.json().await?;
        if !body.get("ok").and_then(Value::as_bool).unwrap_or(false) {
            let code = body
                .get("error")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| format!("http_{}", status.as_u16()));
            tracing::debug!(target = "local_run::api", method = api_method, error = %code, "platform call failed");
            return Err(RunError::Api {
                method: api_method.to_string(),
                code,
            });
        }
        Ok(serde_json::from_value(body)?)
    }
}

#[async_trait]
impl PlatformApi for PlatformClient {
    async fn connections_open(&self, app_token: &str) -> Result<String, RunError> {
        let res: ConnectionsOpenResponse = self
            .call(
                Method::POST,
                CONNECTIONS_OPEN_METHOD,
                app_token,
                &[],
                Some(serde_json::json!({})),
            )
            .await?;
        Ok(res.url)
    }

    async fn validate_session(&self, token: &str) -> Result<AuthSession, RunError> {
        self.call(Method::POST, AUTH_TEST_METHOD, token, &[], None)
            .await
    }

    async fn activity(
        &self,
        token: &str,
        request: &ActivityRequest,
    ) -> Result<ActivityResult, RunError> {
        if request.app_id.is_empty() {
            return Err(RunError::Install("app is not deployed".to_string()));
        }
        let res: ActivitiesResponse = self
            .call(
                Method::GET,
                ACTIVITIES_LIST_METHOD,
                token,
                &request.query(),
                None,
            )
            .await?;
        Ok(ActivityResult {
            activities: res.activities,
            next_cursor: res.response_metadata.next_cursor,
        })
    }

    async fn install_local_app(
        &self,
        token: &str,
        request: &InstallRequest,
    ) -> Result<InstallResult, RunError> {
        let body = serde_json::to_value(request)?;
        let res = self
            .call::<DeveloperInstallResponse>(
                Method::POST,
                DEVELOPER_INSTALL_METHOD,
                token,
                &[],
                Some(body),
            )
            .await;

        let res = match res {
            Ok(res) => res,
            Err(RunError::Api { code, .. }) if PENDING_APPROVAL_ERRORS.contains(&code.as_str()) => {
                return Ok(pending_install(request, InstallState::RequestPending))
            }
            Err(RunError::Api { code, .. }) if DENIED_APPROVAL_ERRORS.contains(&code.as_str()) => {
                return Ok(pending_install(request, InstallState::RequestCancelled))
            }
            Err(error) => return Err(error),
        };

        Ok(InstallResult {
            app_id: res.app_id.unwrap_or_else(|| request.app_id.clone()),
            bot_token: res.api_access_tokens.bot,
            app_level_token: res.api_access_tokens.app_level,
            state: InstallState::Success,
        })
    }

    async fn delete_app(&self, token: &str, app_id: &str) -> Result<(), RunError> {
        self.call::<Value>(
            Method::POST,
            APP_DELETE_METHOD,
            token,
            &[],
            Some(serde_json::json!({ "app_id": app_id })),
        )
        .await
        .map(|_| ())
    }
}

fn pending_install(request: &InstallRequest, state: InstallState) -> InstallResult {
    InstallResult {
        app_id: request.app_id.clone(),
        state,
        ..InstallResult::default()
    }
}

#[cfg(test)]
mod tests {
    use httpmock::Method::{GET, POST};
    use httpmock::MockServer;

    use super::{ActivityRequest, InstallRequest, InstallState, PlatformApi, PlatformClient};
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn connections_open_returns_url() {
        let server = MockServer::start();
        let open = server.mock(|when, then| {
            when.method(POST)
                .path("/api/apps.connections.open")
                .header("authorization", "Bearer xapp-1");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"ok":true,"url":"wss://relay.example/link"}"#);
        });

        let client = PlatformClient::new(&server.base_url());
        let url = client.connections_open("xapp-1").await.unwrap();

        assert_eq!(url, "wss://relay.example/link");
        open.assert_hits(1);
    }

    #[tokio::test]
    async fn api_error_carries_method_and_code() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/api/apps.connections.open");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"ok":false,"error":"invalid_auth"}"#);
        });

        let client = PlatformClient::new(&server.base_url());
        let err = client.connections_open("xapp-bad").await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Api);
        assert!(err.to_string().contains("apps.connections.open"));
        assert!(err.to_string().contains("invalid_auth"));
    }

    #[tokio::test]
    async fn validate_session_reads_user_and_team() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/api/auth.test");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"ok":true,"user":"ada","user_id":"U1","team":"Analytical","team_id":"T1"}"#);
        });

        let client = PlatformClient::new(&server.base_url());
        let session = client.validate_session("xoxp-1").await.unwrap();

        assert_eq!(session.user_name.as_deref(), Some("ada"));
        assert_eq!(session.team_name.as_deref(), Some("Analytical"));
        assert_eq!(session.team_id.as_deref(), Some("T1"));
    }

    #[tokio::test]
    async fn activity_sends_only_set_filters() {
        let server = MockServer::start();
        let list = server.mock(|when, then| {
            when.method(GET)
                .path("/api/apps.activities.list")
                .query_param("app_id", "A1")
                .query_param("limit", "100")
                .query_param("min_log_level", "info")
                .query_param("min_date_created", "1700000000000001");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"ok":true,"activities":[{"trace_id":"Tr1","level":"info","event_type":"function_execution_started","component_id":"Fn1","payload":{"function_name":"greet"},"created":1700000000000002}],"response_metadata":{"next_cursor":"c2"}}"#);
        });

        let client = PlatformClient::new(&server.base_url());
        let request = ActivityRequest {
            app_id: "A1".into(),
            limit: 100,
            min_level: "info".into(),
            min_date_created: 1_700_000_000_000_001,
            ..ActivityRequest::default()
        };
        let result = client.activity("xoxp-1", &request).await.unwrap();

        list.assert_hits(1);
        assert_eq!(result.next_cursor, "c2");
        assert_eq!(result.activities.len(), 1);
        assert_eq!(result.activities[0].component_id, "Fn1");
        assert_eq!(result.activities[0].created, 1_700_000_000_000_002);
    }

    #[test]
    fn activity_query_omits_unset_filters() {
        let request = ActivityRequest {
            app_id: "A1".into(),
            limit: 20,
            trace_id: "Tr9".into(),
            ..ActivityRequest::default()
        };
        let keys: Vec<&str> = request.query().iter().map(|(key, _)| *key).collect();
        assert_eq!(keys, vec!["app_id", "limit", "trace_id"]);
    }

    #[tokio::test]
    async fn install_returns_tokens() {
        let server = MockServer::start();
        let install = server.mock(|when, then| {
            when.method(POST)
                .path("/api/apps.developerInstall")
                .json_body(serde_json::json!({"app_id": "A1"}));
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"ok":true,"app_id":"A1","api_access_tokens":{"bot":"xoxb-1","app_level":"xapp-1","user":"xoxp-1"}}"#);
        });

        let client = PlatformClient::new(&server.base_url());
        let result = client
            .install_local_app(
                "xoxp-1",
                &InstallRequest {
                    app_id: "A1".into(),
                    org_grant_workspace_id: None,
                },
            )
            .await
            .unwrap();

        install.assert_hits(1);
        assert_eq!(result.bot_token, "xoxb-1");
        assert_eq!(result.app_level_token, "xapp-1");
        assert_eq!(result.state, InstallState::Success);
    }

    #[tokio::test]
    async fn install_pending_approval_is_not_an_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/api/apps.developerInstall");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"ok":false,"error":"app_approval_request_pending"}"#);
        });

        let client = PlatformClient::new(&server.base_url());
        let result = client
            .install_local_app(
                "xoxp-1",
                &InstallRequest {
                    app_id: "A1".into(),
                    org_grant_workspace_id: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(result.state, InstallState::RequestPending);
        assert!(result.app_level_token.is_empty());
    }

    #[tokio::test]
    async fn delete_app_posts_app_id() {
        let server = MockServer::start();
        let delete = server.mock(|when, then| {
            when.method(POST)
                .path("/api/apps.delete")
                .json_body(serde_json::json!({"app_id": "A9"}));
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"ok":true}"#);
        });

        let client = PlatformClient::new(&server.base_url());
        client.delete_app("xoxp-1", "A9").await.unwrap();
        delete.assert_hits(1);
    }
}
