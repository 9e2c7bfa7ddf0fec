//! Writes remediation outcomes back onto `ExceptionLogger__c` records.

use crate::llm::client::create_http_client;
use crate::pipeline::{RemediationOutcome, StatusRecorder};
use crate::util::sanitize_error_body;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

const API_VERSION: &str = "v60.0";
const SOBJECT: &str = "ExceptionLogger__c";
const API_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct SalesforceSettings {
    /// Org instance URL, e.g. `https://acme.my.salesforce.com`
    pub instance_url: String,
    pub access_token: String,
}

pub struct SalesforceStatusRecorder {
    http: reqwest::Client,
    settings: SalesforceSettings,
}

#[derive(Serialize)]
struct StatusPatch<'a> {
    #[serde(rename = "Status__c")]
    status: &'a str,
    #[serde(rename = "Pull_Request__c")]
    pull_request: Option<&'a str>,
}

/// Record ids are 15 or 18 character alphanumerics; anything else would alter
/// the request path.
fn is_valid_record_id(id: &str) -> bool {
    matches!(id.len(), 15 | 18) && id.chars().all(|c| c.is_ascii_alphanumeric())
}

impl SalesforceStatusRecorder {
    pub fn new(settings: SalesforceSettings) -> Result<Self> {
        let http = create_http_client(Duration::from_secs(API_TIMEOUT_SECS))?;
        Ok(Self { http, settings })
    }

    fn record_url(&self, exception_id: &str) -> String {
        format!(
            "{}/services/data/{}/sobjects/{}/{}",
            self.settings.instance_url.trim_end_matches('/'),
            API_VERSION,
            SOBJECT,
            exception_id
        )
    }
}

#[async_trait]
impl StatusRecorder for SalesforceStatusRecorder {
    fn validate_id(&self, exception_id: &str) -> Result<()> {
        if !is_valid_record_id(exception_id) {
            anyhow::bail!("Invalid Salesforce record id: {:?}", exception_id);
        }
        Ok(())
    }

    async fn record(&self, exception_id: &str, outcome: &RemediationOutcome) -> Result<()> {
        self.validate_id(exception_id)?;

        let patch = StatusPatch {
            status: outcome.status.as_str(),
            pull_request: outcome.pr_url.as_deref(),
        };
        let resp = self
            .http
            .patch(self.record_url(exception_id))
            .bearer_auth(&self.settings.access_token)
            .json(&patch)
            .send()
            .await
            .context("Failed to send Salesforce update")?;

        let status = resp.status();
        if status.is_success() {
            tracing::info!(exception_id, status = %outcome.status, "updated exception record");
            return Ok(());
        }

        let body = resp.text().await.unwrap_or_default();
        Err(anyhow::anyhow!(
            "Salesforce update failed ({}): {}",
            status.as_u16(),
            sanitize_error_body(&body)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn recorder_for(server: &MockServer) -> SalesforceStatusRecorder {
        SalesforceStatusRecorder::new(SalesforceSettings {
            instance_url: server.uri(),
            access_token: "00Dxx!token".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_record_id_validation() {
        assert!(is_valid_record_id("a0X5e000001AbCdEAF"));
        assert!(is_valid_record_id("a0X5e000001AbCd"));
        assert!(!is_valid_record_id(""));
        assert!(!is_valid_record_id("a0X5e000001"));
        assert!(!is_valid_record_id("EXC-42"));
        assert!(!is_valid_record_id("../Account/001"));
        assert!(!is_valid_record_id("a0X5e000001AbCdEAFextra"));
    }

    #[tokio::test]
    async fn test_resolved_outcome_patches_status_and_pr() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/services/data/v60.0/sobjects/ExceptionLogger__c/a0X5e000001AbCd"))
            .and(header("authorization", "Bearer 00Dxx!token"))
            .and(body_json(serde_json::json!({
                "Status__c": "Resolved",
                "Pull_Request__c": "https://github.com/acme/app/pull/1"
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        recorder_for(&server)
            .record(
                "a0X5e000001AbCd",
                &RemediationOutcome::resolved("https://github.com/acme/app/pull/1"),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_human_intervention_sends_null_pr() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(body_json(serde_json::json!({
                "Status__c": "Human Intervention",
                "Pull_Request__c": null
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        recorder_for(&server)
            .record("a0X5e000001AbCd", &RemediationOutcome::human_intervention())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rejected_update_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(401).set_body_string(
                r#"[{"message":"Session expired or invalid","errorCode":"INVALID_SESSION_ID"}]"#,
            ))
            .mount(&server)
            .await;

        let err = recorder_for(&server)
            .record("a0X5e000001AbCd", &RemediationOutcome::human_intervention())
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Salesforce update failed (401)"));
        assert!(err.to_string().contains("INVALID_SESSION_ID"));
    }

    #[tokio::test]
    async fn test_invalid_id_never_hits_the_network() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(204))
            .expect(0)
            .mount(&server)
            .await;

        let err = recorder_for(&server)
            .record("a/b", &RemediationOutcome::human_intervention())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid Salesforce record id"));
    }

    #[tokio::test]
    async fn test_validate_id_matches_record_check() {
        let server = MockServer::start().await;
        let recorder = recorder_for(&server);
        assert!(recorder.validate_id("a0X5e000001AbCdEAF").is_ok());
        let err = recorder.validate_id("EXC-42").unwrap_err();
        assert_eq!(err.to_string(), "Invalid Salesforce record id: \"EXC-42\"");
    }
}
