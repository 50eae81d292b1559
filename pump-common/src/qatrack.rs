//! # QATrack+
//!
//! `TargetApi` implementation for the QATrack+ REST API, and the configuration section every pump
//! uploading to it declares.
use std::time::Duration;

use async_trait::async_trait;
use http::StatusCode;
use reqwest::{header, redirect};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::{
    ChoiceProvider, ConfigState, FieldDef, FieldKind, FieldValues, FieldValuesExt, SectionDef,
};
use crate::error::TargetError;
use crate::payload::Payload;
use crate::pipeline::{MissingDataRule, PipelineOptions, TargetApi, UploadResponse};
use crate::validation::{SectionValidator, Validation};

pub const QATRACK_SECTION: &str = "QATrack+ API";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const USER_AGENT: &str = concat!("QCPump/", env!("CARGO_PKG_VERSION"));
const DEFAULT_THROTTLE: Duration = Duration::from_millis(500);

/// The `QATrack+ API` configuration section, validated by connecting to the configured server.
pub fn qatrack_section(timeout: Duration) -> SectionDef {
    SectionDef::new(QATRACK_SECTION)
        .field(
            FieldDef::new("api url", FieldKind::String)
                .required()
                .default("https://qatrack.example.com/api")
                .help("Root api url of the QATrack+ instance, e.g. http://yourqatrackserver/api"),
        )
        .field(
            FieldDef::new("auth token", FieldKind::String)
                .required()
                .help("Authorization token of the QATrack+ user uploading data"),
        )
        .field(
            FieldDef::new("throttle", FieldKind::Float)
                .required()
                .default(0.5)
                .range(0.0, 60.0)
                .help("Minimum interval in seconds between two uploads"),
        )
        .field(
            FieldDef::new("verify ssl", FieldKind::Bool)
                .default(true)
                .help("Disable to bypass SSL certificate checks"),
        )
        .field(FieldDef::new("http proxy", FieldKind::String).help("e.g. http://10.10.1.10:3128"))
        .field(FieldDef::new("https proxy", FieldKind::String).help("e.g. https://10.10.1.10:3128"))
        .field(
            FieldDef::new("key slug", FieldKind::String)
                .default("qcpump_key")
                .help("Macro name of the string test the upload key of each record is stored in"),
        )
        .field(
            FieldDef::new("autoskip", FieldKind::Bool)
                .default(true)
                .help("Retry uploads rejected for missing test data with those tests skipped"),
        )
        .validator(ConnectionCheck { timeout })
}

/// Connection settings read from the `QATrack+ API` section.
#[derive(Debug, Clone, PartialEq)]
pub struct QATrackSettings {
    pub api_url: String,
    pub auth_token: String,
    pub throttle: Duration,
    pub verify_ssl: bool,
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    pub key_slug: String,
    pub autoskip: bool,
}

impl QATrackSettings {
    pub fn from_values(values: &FieldValues) -> Self {
        let proxy = |field: &str| {
            let proxy = values.str_field(field).trim();
            (!proxy.is_empty()).then(|| proxy.to_owned())
        };

        Self {
            api_url: values.str_field("api url").trim().to_owned(),
            auth_token: values.str_field("auth token").trim().to_owned(),
            throttle: values
                .f64_field("throttle")
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                .unwrap_or(DEFAULT_THROTTLE),
            verify_ssl: values.bool_field("verify ssl").unwrap_or(true),
            http_proxy: proxy("http proxy"),
            https_proxy: proxy("https proxy"),
            key_slug: values.str_field("key slug").trim().to_owned(),
            autoskip: values.bool_field("autoskip").unwrap_or(false),
        }
    }

    pub fn pipeline_options(&self, missing_data: MissingDataRule) -> PipelineOptions {
        PipelineOptions {
            throttle: self.throttle,
            autoskip: self.autoskip,
            missing_data,
        }
    }

    /// Join the api url and `endpoint` with exactly one slash, with a trailing slash.
    pub fn construct_api_url(&self, endpoint: &str) -> String {
        format!(
            "{}/{}/",
            self.api_url.trim_matches('/'),
            endpoint.trim_matches('/')
        )
    }

    fn client_builder(&self, timeout: Duration) -> Result<reqwest::ClientBuilder, TargetError> {
        let token = header::HeaderValue::from_str(&format!("Token {}", self.auth_token))
            .map_err(|_| TargetError::Settings("auth token is not a valid header value".to_owned()))?;
        let mut headers = header::HeaderMap::new();
        headers.insert(header::AUTHORIZATION, token);

        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .danger_accept_invalid_certs(!self.verify_ssl);

        if let Some(proxy) = &self.http_proxy {
            builder = builder.proxy(reqwest::Proxy::http(proxy).map_err(TargetError::Client)?);
        }
        if let Some(proxy) = &self.https_proxy {
            builder = builder.proxy(reqwest::Proxy::https(proxy).map_err(TargetError::Client)?);
        }

        Ok(builder)
    }
}

/// Validator of the `QATrack+ API` section.
struct ConnectionCheck {
    timeout: Duration,
}

#[async_trait]
impl SectionValidator for ConnectionCheck {
    async fn validate(&self, values: Vec<FieldValues>) -> Validation {
        let Some(values) = values.first() else {
            return Validation::invalid("No QATrack+ API settings");
        };
        check_connection(&QATrackSettings::from_values(values), self.timeout).await
    }
}

/// Check the server is reachable and accepts the auth token, without following redirects.
pub async fn check_connection(settings: &QATrackSettings, timeout: Duration) -> Validation {
    if let Err(e) = url::Url::parse(&settings.api_url) {
        return Validation::invalid(format!("Invalid API URL {:?}: {}", settings.api_url, e));
    }

    let client = match settings
        .client_builder(timeout)
        .and_then(|builder| {
            builder
                .redirect(redirect::Policy::none())
                .build()
                .map_err(TargetError::Client)
        }) {
        Ok(client) => client,
        Err(e) => return Validation::invalid(e.to_string()),
    };

    let response = match client.get(settings.construct_api_url("auth")).send().await {
        Ok(response) => response,
        Err(e) => return Validation::invalid(e.to_string()),
    };

    match response.status() {
        StatusCode::OK => Validation::valid("Connected Successfully"),
        StatusCode::FOUND => Validation::invalid(
            "Server responded with a 302 Redirect. Did you forget the '/api/' on the end of your API URL?",
        ),
        status => {
            let is_json = response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|ct| ct.to_str().ok())
                .is_some_and(|ct| ct.contains("json"));
            let body = response.text().await.unwrap_or_default();

            let detail = is_json
                .then(|| serde_json::from_str::<Value>(&body).ok())
                .flatten()
                .and_then(|v| v.get("detail").and_then(Value::as_str).map(str::to_owned));

            Validation::invalid(
                detail
                    .or_else(|| (!body.is_empty()).then_some(body))
                    .unwrap_or_else(|| format!("Authorization failed with code {}", status.as_u16())),
            )
        }
    }
}

/// Choices listed from the names of a QATrack+ list endpoint, using the connection settings of the
/// `QATrack+ API` section. Fields using it must have their section depend on that section.
pub struct QATrackChoices {
    endpoint: String,
    timeout: Duration,
}

impl QATrackChoices {
    pub fn new(endpoint: &str, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.to_owned(),
            timeout,
        }
    }

    pub fn units(timeout: Duration) -> Self {
        Self::new("units/units", timeout)
    }
}

#[async_trait]
impl ChoiceProvider for QATrackChoices {
    async fn choices(&self, state: ConfigState) -> Result<Vec<String>, String> {
        let values = state
            .get(QATRACK_SECTION)
            .and_then(|subsections| subsections.first())
            .ok_or_else(|| format!("no {QATRACK_SECTION} settings"))?;
        let client = QATrackClient::new(QATrackSettings::from_values(values), self.timeout)
            .map_err(|e| e.to_string())?;

        client.names(&self.endpoint).await.map_err(|e| e.to_string())
    }
}

/// One page of a QATrack+ list endpoint.
#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    count: u64,
    #[serde(default)]
    next: Option<String>,
    #[serde(default)]
    results: Vec<Value>,
}

pub struct QATrackClient {
    settings: QATrackSettings,
    client: reqwest::Client,
}

impl QATrackClient {
    pub fn new(settings: QATrackSettings, timeout: Duration) -> Result<Self, TargetError> {
        let client = settings
            .client_builder(timeout)?
            .build()
            .map_err(TargetError::Client)?;

        Ok(Self { settings, client })
    }

    pub fn settings(&self) -> &QATrackSettings {
        &self.settings
    }

    pub fn construct_api_url(&self, endpoint: &str) -> String {
        self.settings.construct_api_url(endpoint)
    }

    /// Every object of a paginated list endpoint, e.g. `units/units`.
    pub async fn list(&self, endpoint: &str) -> Result<Vec<Value>, TargetError> {
        let mut objects = Vec::new();
        let mut next = Some(self.construct_api_url(endpoint));

        while let Some(url) = next.take() {
            let page = self.get_page(&url, &[]).await?;
            objects.extend(page.results);
            next = page.next;
        }

        Ok(objects)
    }

    /// Sorted `name` of every object of a paginated list endpoint.
    pub async fn names(&self, endpoint: &str) -> Result<Vec<String>, TargetError> {
        let mut names: Vec<String> = self
            .list(endpoint)
            .await?
            .iter()
            .filter_map(|obj| obj.get("name").and_then(Value::as_str))
            .map(str::to_owned)
            .collect();
        names.sort();
        Ok(names)
    }

    async fn get_page(&self, url: &str, query: &[(&str, &str)]) -> Result<Page, TargetError> {
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|error| TargetError::Request {
                url: url.to_owned(),
                error,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TargetError::Status {
                url: url.to_owned(),
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        response.json().await.map_err(|e| TargetError::Malformed {
            url: url.to_owned(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl TargetApi for QATrackClient {
    async fn is_already_recorded(&self, key: &str) -> Result<bool, TargetError> {
        let url = self.construct_api_url("qa/testinstances");
        let page = self
            .get_page(
                &url,
                &[
                    ("unit_test_info__test__slug", self.settings.key_slug.as_str()),
                    ("string_value", key),
                ],
            )
            .await?;

        Ok(page.count >= 1)
    }

    async fn resolve_upload_target(
        &self,
        unit: &str,
        test_list: &str,
    ) -> Result<String, TargetError> {
        let url = self.construct_api_url("qa/unittestcollections");
        let page = self
            .get_page(&url, &[("unit__name", unit), ("test_list__name", test_list)])
            .await?;

        match page.count {
            0 => Err(TargetError::NotFound {
                unit: unit.to_owned(),
                test_list: test_list.to_owned(),
            }),
            1 => page
                .results
                .first()
                .and_then(|utc| utc.get("url"))
                .and_then(Value::as_str)
                .map(str::to_owned)
                .ok_or_else(|| TargetError::Malformed {
                    url,
                    reason: "unit test collection has no url".to_owned(),
                }),
            count => Err(TargetError::Ambiguous {
                unit: unit.to_owned(),
                test_list: test_list.to_owned(),
                count,
            }),
        }
    }

    async fn upload(&self, payload: &Payload) -> Result<UploadResponse, TargetError> {
        let url = self.construct_api_url("qa/testlistinstances");

        let mut body = serde_json::to_value(payload).map_err(|e| TargetError::Malformed {
            url: url.clone(),
            reason: e.to_string(),
        })?;
        if !self.settings.key_slug.is_empty() {
            if let Some(tests) = body.get_mut("tests").and_then(Value::as_object_mut) {
                tests.insert(
                    self.settings.key_slug.clone(),
                    json!({ "value": payload.key }),
                );
            }
        }

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|error| TargetError::Request {
                url: url.clone(),
                error,
            })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Ok(UploadResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::NaiveDate;
    use httpmock::prelude::*;

    use super::*;
    use crate::payload::TestValue;

    fn settings(api_url: &str) -> QATrackSettings {
        QATrackSettings {
            api_url: api_url.to_owned(),
            auth_token: "abc123".to_owned(),
            throttle: Duration::ZERO,
            verify_ssl: true,
            http_proxy: None,
            https_proxy: None,
            key_slug: "qcpump_key".to_owned(),
            autoskip: true,
        }
    }

    fn client(server: &MockServer) -> QATrackClient {
        QATrackClient::new(settings(&server.url("/api/")), Duration::from_secs(5))
            .expect("client builds")
    }

    #[test]
    fn test_construct_api_url() {
        let cases = [
            ("http://qatrack/api", "qa/testlists", "http://qatrack/api/qa/testlists/"),
            ("http://qatrack/api/", "/qa/testlists/", "http://qatrack/api/qa/testlists/"),
            ("http://qatrack/api//", "auth", "http://qatrack/api/auth/"),
        ];

        for (api_url, endpoint, expected) in cases {
            assert_eq!(settings(api_url).construct_api_url(endpoint), expected);
        }
    }

    #[test]
    fn test_settings_from_values() {
        let values: FieldValues = serde_json::from_value(json!({
            "api url": " http://qatrack/api ",
            "auth token": "abc",
            "throttle": 1.5,
            "verify ssl": false,
            "http proxy": "",
            "https proxy": "https://proxy:3128",
            "key slug": "key",
            "autoskip": true
        }))
        .unwrap();

        let settings = QATrackSettings::from_values(&values);

        assert_eq!(settings.api_url, "http://qatrack/api");
        assert_eq!(settings.throttle, Duration::from_millis(1500));
        assert!(!settings.verify_ssl);
        assert_eq!(settings.http_proxy, None);
        assert_eq!(settings.https_proxy.as_deref(), Some("https://proxy:3128"));
        assert!(settings.pipeline_options(MissingDataRule::default()).autoskip);
    }

    #[tokio::test]
    async fn test_is_already_recorded() {
        let server = MockServer::start_async().await;
        let found = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api/qa/testinstances/")
                    .header("Authorization", "Token abc123")
                    .query_param("unit_test_info__test__slug", "qcpump_key")
                    .query_param("string_value", "QCPump/1");
                then.status(200).json_body(json!({"count": 1, "results": [{}]}));
            })
            .await;
        let missing = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api/qa/testinstances/")
                    .query_param("string_value", "QCPump/2");
                then.status(200).json_body(json!({"count": 0, "results": []}));
            })
            .await;

        let client = client(&server);

        assert!(client.is_already_recorded("QCPump/1").await.unwrap());
        assert!(!client.is_already_recorded("QCPump/2").await.unwrap());
        found.assert_async().await;
        missing.assert_async().await;
    }

    #[tokio::test]
    async fn test_is_already_recorded_error_status() {
        let server = MockServer::start_async().await;
        let forbidden = server
            .mock_async(|when, then| {
                when.method(GET).path("/api/qa/testinstances/");
                then.status(403).body("nope");
            })
            .await;

        let result = client(&server).is_already_recorded("QCPump/1").await;

        assert!(matches!(
            result,
            Err(TargetError::Status { status: 403, .. })
        ));
        forbidden.assert_async().await;
    }

    #[tokio::test]
    async fn test_resolve_upload_target() {
        let server = MockServer::start_async().await;
        let single = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api/qa/unittestcollections/")
                    .query_param("unit__name", "TB1")
                    .query_param("test_list__name", "Daily");
                then.status(200).json_body(json!({
                    "count": 1,
                    "results": [{"url": "http://qatrack/api/qa/unittestcollections/7/"}]
                }));
            })
            .await;
        let ambiguous = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api/qa/unittestcollections/")
                    .query_param("unit__name", "TB2");
                then.status(200)
                    .json_body(json!({"count": 2, "results": [{"url": "a"}, {"url": "b"}]}));
            })
            .await;
        let none = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api/qa/unittestcollections/")
                    .query_param("unit__name", "TB3");
                then.status(200).json_body(json!({"count": 0, "results": []}));
            })
            .await;

        let client = client(&server);

        assert_eq!(
            client.resolve_upload_target("TB1", "Daily").await.unwrap(),
            "http://qatrack/api/qa/unittestcollections/7/"
        );
        let ambiguous_result = client.resolve_upload_target("TB2", "Daily").await;
        assert!(ambiguous_result.as_ref().is_err_and(TargetError::is_ambiguous));
        assert!(matches!(
            client.resolve_upload_target("TB3", "Daily").await,
            Err(TargetError::NotFound { .. })
        ));
        single.assert_async().await;
        ambiguous.assert_async().await;
        none.assert_async().await;
    }

    #[tokio::test]
    async fn test_upload_embeds_key() {
        let server = MockServer::start_async().await;
        let created = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/qa/testlistinstances/")
                    .json_body(json!({
                        "unit_test_collection": "utc/7",
                        "work_started": "2024-03-01 08:00:00",
                        "work_completed": "2024-03-01 08:05:00",
                        "tests": {
                            "output": {"value": 1.0},
                            "qcpump_key": {"value": "QCPump/1"}
                        }
                    }));
                then.status(201).json_body(json!({"url": "tli/1"}));
            })
            .await;

        let start = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();
        let payload = Payload {
            unit_test_collection: "utc/7".to_owned(),
            work_started: start,
            work_completed: start + chrono::Duration::minutes(5),
            tests: BTreeMap::from([("output".to_owned(), TestValue::new(1.0))]),
            comment: None,
            key: "QCPump/1".to_owned(),
        };

        let response = client(&server).upload(&payload).await.unwrap();

        assert_eq!(response.status, StatusCode::CREATED);
        created.assert_async().await;
    }

    #[tokio::test]
    async fn test_names_follows_pagination() {
        let server = MockServer::start_async().await;
        let first = server
            .mock_async(|when, then| {
                when.method(GET).path("/api/units/units/");
                then.status(200).json_body(json!({
                    "count": 3,
                    "next": server.url("/api/units/units/page2/"),
                    "results": [{"name": "TB2"}, {"name": "TB1"}]
                }));
            })
            .await;
        let second = server
            .mock_async(|when, then| {
                when.method(GET).path("/api/units/units/page2/");
                then.status(200).json_body(json!({
                    "count": 3,
                    "next": null,
                    "results": [{"name": "Agility"}]
                }));
            })
            .await;

        let names = client(&server).names("units/units").await.unwrap();

        assert_eq!(names, vec!["Agility", "TB1", "TB2"]);
        first.assert_async().await;
        second.assert_async().await;
    }

    #[tokio::test]
    async fn test_unit_choices_use_configured_server() {
        let server = MockServer::start_async().await;
        let units = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api/units/units/")
                    .header("Authorization", "Token abc123");
                then.status(200).json_body(json!({
                    "count": 1,
                    "next": null,
                    "results": [{"name": "TB1", "serial_number": "1234"}]
                }));
            })
            .await;
        let state: ConfigState = serde_json::from_value(json!({
            QATRACK_SECTION: [{"api url": server.url("/api/"), "auth token": "abc123"}]
        }))
        .unwrap();

        let provider = QATrackChoices::units(DEFAULT_TIMEOUT);
        assert_eq!(provider.choices(state).await, Ok(vec!["TB1".to_owned()]));
        assert!(provider.choices(ConfigState::new()).await.is_err());
        units.assert_async().await;
    }

    #[tokio::test]
    async fn test_unit_choices_error_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/units/units/");
                then.status(500);
            })
            .await;
        let state: ConfigState = serde_json::from_value(json!({
            QATRACK_SECTION: [{"api url": server.url("/api/"), "auth token": "abc123"}]
        }))
        .unwrap();

        let result = QATrackChoices::units(DEFAULT_TIMEOUT).choices(state).await;

        assert!(result.unwrap_err().contains("500"));
    }

    #[tokio::test]
    async fn test_check_connection() {
        let server = MockServer::start_async().await;
        let ok = server
            .mock_async(|when, then| {
                when.method(GET).path("/api/auth/");
                then.status(200);
            })
            .await;

        let validation = check_connection(&settings(&server.url("/api")), DEFAULT_TIMEOUT).await;

        assert_eq!(validation, Validation::valid("Connected Successfully"));
        ok.assert_async().await;
    }

    #[tokio::test]
    async fn test_check_connection_redirect() {
        let server = MockServer::start_async().await;
        let redirect = server
            .mock_async(|when, then| {
                when.method(GET).path("/auth/");
                then.status(302).header("Location", "/accounts/login/");
            })
            .await;

        let validation = check_connection(&settings(&server.url("")), DEFAULT_TIMEOUT).await;

        assert!(!validation.valid);
        assert!(validation.message.contains("'/api/'"));
        redirect.assert_async().await;
    }

    #[tokio::test]
    async fn test_check_connection_bad_token() {
        let server = MockServer::start_async().await;
        let unauthorized = server
            .mock_async(|when, then| {
                when.method(GET).path("/api/auth/");
                then.status(401)
                    .json_body(json!({"detail": "Invalid token."}));
            })
            .await;

        let validation = check_connection(&settings(&server.url("/api/")), DEFAULT_TIMEOUT).await;

        assert_eq!(validation, Validation::invalid("Invalid token."));
        unauthorized.assert_async().await;
    }

    #[tokio::test]
    async fn test_check_connection_unparseable_url() {
        let validation = check_connection(&settings("qatrack/api"), DEFAULT_TIMEOUT).await;

        assert!(!validation.valid);
        assert!(validation.message.starts_with("Invalid API URL"));
    }
}
