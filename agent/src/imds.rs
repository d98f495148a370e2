//! Client for the instance metadata service's scheduled events API.
//!
//! The endpoint is a link-local address only reachable from the VM itself.
//! It requires the `Metadata: true` header, must not be queried through a
//! proxy, and is known to drop idle connections, which surfaces as a clean
//! EOF mid-request; those are retried with backoff, everything else is
//! surfaced to the caller immediately.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use snafu::{ResultExt, Snafu};
use std::error::Error as StdError;
use tokio::time::Duration;
use tokio_retry::{strategy::ExponentialBackoff, RetryIf};
use tracing::{debug, instrument, warn};

#[cfg(test)]
use mockall::automock;

use models::constants;

// The metadata service's idle-close behavior is retried with exponential
// backoff: 2s, 4s, 8s, capped at 10s, at most three retries.
const EOF_RETRY_BASE_DELAY: Duration = Duration::from_secs(2);
const EOF_RETRY_MAX_DELAY: Duration = Duration::from_secs(10);
const EOF_NUM_RETRIES: usize = 3;

pub type Result<T> = std::result::Result<T, ImdsError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ImdsError {
    #[snafu(display("Unable to build the metadata service HTTP client: '{}'", source))]
    BuildClient { source: reqwest::Error },

    #[snafu(display("Unable to query the metadata service: '{}'", source))]
    Query { source: reqwest::Error },

    #[snafu(display("Unable to decode the scheduled events document: '{}'", source))]
    Decode { source: reqwest::Error },
}

impl ImdsError {
    /// True for the metadata service's idle-close behavior: the connection
    /// was dropped cleanly before a response arrived.
    fn is_clean_eof(&self) -> bool {
        match self {
            ImdsError::Query { source } => {
                let mut cause: Option<&(dyn StdError + 'static)> = source.source();
                while let Some(err) = cause {
                    let text = err.to_string();
                    if text.contains("IncompleteMessage")
                        || text.contains("connection closed before message completed")
                    {
                        return true;
                    }
                    cause = err.source();
                }
                false
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum ScheduledEventType {
    Reboot,
    Redeploy,
    Freeze,
    Preempt,
    Terminate,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum ScheduledEventStatus {
    Scheduled,
    Started,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum ScheduledEventSource {
    Platform,
    User,
    #[default]
    #[serde(other)]
    Unknown,
}

/// A single event from the scheduled events document.
///
/// Field names follow the wire format. Decoding is lenient: unknown fields
/// are ignored and missing fields fall back to defaults so a metadata-side
/// schema addition can never take the agent down.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScheduledEvent {
    #[serde(rename = "EventId", default)]
    pub event_id: String,
    #[serde(rename = "EventType", default)]
    pub event_type: ScheduledEventType,
    #[serde(rename = "ResourceType", default)]
    pub resource_type: String,
    #[serde(rename = "Resources", default)]
    pub resources: Vec<String>,
    #[serde(rename = "EventStatus", default)]
    pub event_status: ScheduledEventStatus,
    /// Time in UTC. The service may send an empty string here.
    #[serde(rename = "NotBefore", default, deserialize_with = "deserialize_not_before")]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(rename = "Description", default)]
    pub description: String,
    #[serde(rename = "EventSource", default)]
    pub event_source: ScheduledEventSource,
    #[serde(rename = "DurationInSeconds", default = "unknown_duration")]
    pub duration_in_seconds: i64,
}

/// The full response returned from the scheduled events API.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScheduledEventsResponse {
    /// Advanced by the metadata service on each change; only an
    /// observability aid.
    #[serde(rename = "DocumentIncarnation", default)]
    pub incarnation_id: i64,
    #[serde(rename = "Events", default)]
    pub events: Vec<ScheduledEvent>,
}

fn unknown_duration() -> i64 {
    -1
}

/// `NotBefore` arrives as an RFC-1123 date, or empty when the platform has
/// not committed to a time yet.
fn deserialize_not_before<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if raw.is_empty() {
        debug!("scheduled event has no NotBefore time");
        return Ok(None);
    }

    match DateTime::parse_from_rfc2822(&raw) {
        Ok(parsed) => Ok(Some(parsed.with_timezone(&Utc))),
        Err(err) => {
            debug!(not_before = %raw, error = %err, "unparseable NotBefore time, leaving unset");
            Ok(None)
        }
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
/// The metadata probe: produce a current snapshot of scheduled platform
/// events for this VM. Stateless and safe to call concurrently.
pub trait ImdsProbe: Send + Sync {
    async fn scheduled_events(&self) -> Result<ScheduledEventsResponse>;
}

#[derive(Debug, Clone)]
pub struct ImdsClient {
    http: reqwest::Client,
    endpoint: String,
}

impl ImdsClient {
    pub fn new() -> Result<Self> {
        Self::with_endpoint(constants::IMDS_SCHEDULED_EVENTS_ENDPOINT.to_string())
    }

    pub fn with_endpoint(endpoint: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .no_proxy()
            .build()
            .context(BuildClientSnafu)?;
        Ok(ImdsClient { http, endpoint })
    }

    async fn query(&self) -> Result<ScheduledEventsResponse> {
        let response = self
            .http
            .get(&self.endpoint)
            .header("Metadata", "true")
            .query(&[("api-version", constants::IMDS_API_VERSION)])
            .send()
            .await
            .context(QuerySnafu)?
            .error_for_status()
            .context(QuerySnafu)?;

        let document: ScheduledEventsResponse =
            response.json().await.context(DecodeSnafu)?;

        debug!(
            incarnation = document.incarnation_id,
            events = document.events.len(),
            "scheduled events document received"
        );
        Ok(document)
    }
}

#[async_trait]
impl ImdsProbe for ImdsClient {
    #[instrument(skip(self), err)]
    async fn scheduled_events(&self) -> Result<ScheduledEventsResponse> {
        RetryIf::spawn(
            ExponentialBackoff::from_millis(EOF_RETRY_BASE_DELAY.as_millis() as u64)
                .max_delay(EOF_RETRY_MAX_DELAY)
                .take(EOF_NUM_RETRIES),
            || async {
                self.query().await.inspect_err(|err| {
                    if err.is_clean_eof() {
                        warn!("metadata service closed the connection early, retrying");
                    }
                })
            },
            ImdsError::is_clean_eof,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    // The document shape published by the platform, plus an unknown field.
    const SCHEDULED_EVENTS_DOCUMENT: &str = r#"{
        "DocumentIncarnation": 4,
        "Events": [
            {
                "EventId": "602d9444-d2cd-49c7-8624-8643e7171297",
                "EventType": "Freeze",
                "ResourceType": "VirtualMachine",
                "Resources": ["test-vmss_1"],
                "EventStatus": "Scheduled",
                "NotBefore": "Mon, 19 Sep 2016 18:29:47 GMT",
                "Description": "Virtual machine is being paused because of a memory-preserving Live Migration operation.",
                "EventSource": "Platform",
                "DurationInSeconds": 5,
                "SomeFutureField": "ignored"
            }
        ]
    }"#;

    #[test]
    fn decodes_full_document() {
        let document: ScheduledEventsResponse =
            serde_json::from_str(SCHEDULED_EVENTS_DOCUMENT).unwrap();

        assert_eq!(document.incarnation_id, 4);
        assert_eq!(document.events.len(), 1);

        let event = &document.events[0];
        assert_eq!(event.event_type, ScheduledEventType::Freeze);
        assert_eq!(event.resource_type, "VirtualMachine");
        assert_eq!(event.resources, vec!["test-vmss_1".to_string()]);
        assert_eq!(event.event_status, ScheduledEventStatus::Scheduled);
        assert_eq!(event.event_source, ScheduledEventSource::Platform);
        assert_eq!(event.duration_in_seconds, 5);
        assert!(event.not_before.is_some());
        assert!(event.description.contains("memory-preserving"));
    }

    #[test]
    fn decodes_empty_not_before_as_unset() {
        let json = r#"{
            "DocumentIncarnation": 1,
            "Events": [{"EventId": "e", "EventType": "Reboot", "NotBefore": ""}]
        }"#;

        let document: ScheduledEventsResponse = serde_json::from_str(json).unwrap();
        let event = &document.events[0];
        assert_eq!(event.event_type, ScheduledEventType::Reboot);
        assert!(event.not_before.is_none());
        // missing fields fall back to defaults rather than failing the decode
        assert_eq!(event.duration_in_seconds, -1);
        assert_eq!(event.event_status, ScheduledEventStatus::Unknown);
    }

    #[test]
    fn decodes_unknown_event_type() {
        let json = r#"{"Events": [{"EventType": "SomethingNew"}]}"#;

        let document: ScheduledEventsResponse = serde_json::from_str(json).unwrap();
        assert_eq!(document.events[0].event_type, ScheduledEventType::Unknown);
    }

    #[test]
    fn decodes_empty_document() {
        let document: ScheduledEventsResponse =
            serde_json::from_str(r#"{"DocumentIncarnation": 2, "Events": []}"#).unwrap();
        assert_eq!(document.incarnation_id, 2);
        assert!(document.events.is_empty());
    }

    #[tokio::test]
    async fn queries_with_metadata_header_and_api_version() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/metadata/scheduledevents"))
            .and(header("Metadata", "true"))
            .and(query_param("api-version", constants::IMDS_API_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                SCHEDULED_EVENTS_DOCUMENT,
                "application/json",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let client =
            ImdsClient::with_endpoint(format!("{}/metadata/scheduledevents", server.uri()))
                .unwrap();
        let document = client.scheduled_events().await.unwrap();

        assert_eq!(document.incarnation_id, 4);
        assert_eq!(document.events.len(), 1);
    }

    #[tokio::test]
    async fn server_errors_surface_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let client =
            ImdsClient::with_endpoint(format!("{}/metadata/scheduledevents", server.uri()))
                .unwrap();
        let result = client.scheduled_events().await;

        assert!(matches!(result, Err(ImdsError::Query { .. })));
    }

    #[tokio::test]
    async fn malformed_body_is_a_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("{not json", "application/json"))
            .mount(&server)
            .await;

        let client =
            ImdsClient::with_endpoint(format!("{}/metadata/scheduledevents", server.uri()))
                .unwrap();
        let result = client.scheduled_events().await;

        assert!(matches!(result, Err(ImdsError::Decode { .. })));
    }
}
