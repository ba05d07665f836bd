//! AWS-backed collaborators: SQS event bus, the Lambda/EventBridge invoker
//! and partner event source provisioning.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use aws_sdk_eventbridge::types::PutPartnerEventsRequestEntry;
use aws_sdk_lambda::primitives::Blob;
use aws_sdk_lambda::types::InvocationType;
use dashmap::DashMap;
use ets_common::OutboxEntry;
use ets_outbox::EventBus;
use serde_json::Value;
use tracing::{debug, info};

use crate::invoker::{Invoker, PartnerEventSource, PartnerEventSources};

/// Publishes relayed outbox entries to a FIFO queue, one message group per
/// entry group
pub struct SqsEventBus {
    client: aws_sdk_sqs::Client,
    queue_url: String,
}

impl SqsEventBus {
    pub fn new(client: aws_sdk_sqs::Client, queue_url: String) -> Self {
        Self { client, queue_url }
    }
}

#[async_trait]
impl EventBus for SqsEventBus {
    async fn publish(&self, entry: &OutboxEntry) -> Result<()> {
        let body = serde_json::to_string(&serde_json::json!({
            "id": entry.id,
            "topic": entry.topic,
            "payload": entry.payload,
            "createdAt": entry.created_at,
        }))?;

        self.client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .message_group_id(&entry.message_group)
            .message_deduplication_id(&entry.id)
            .send()
            .await
            .map_err(|e| anyhow!("SQS send error: {}", e))?;

        debug!(entry_id = %entry.id, topic = %entry.topic, "Published to event bus");
        Ok(())
    }
}

/// EventBridge clients cached per region; a partner source lives in its
/// subscriber's region
struct RegionalEventBridge {
    base: aws_config::SdkConfig,
    clients: DashMap<String, aws_sdk_eventbridge::Client>,
}

impl RegionalEventBridge {
    fn new(base: aws_config::SdkConfig) -> Self {
        Self {
            base,
            clients: DashMap::new(),
        }
    }

    fn client(&self, region: &str) -> aws_sdk_eventbridge::Client {
        self.clients
            .entry(region.to_string())
            .or_insert_with(|| {
                let config = aws_sdk_eventbridge::config::Builder::from(&self.base)
                    .region(aws_sdk_eventbridge::config::Region::new(region.to_string()))
                    .build();
                aws_sdk_eventbridge::Client::from_conf(config)
            })
            .clone()
    }
}

pub struct AwsInvoker {
    lambda: aws_sdk_lambda::Client,
    eventbridge: RegionalEventBridge,
}

impl AwsInvoker {
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self {
            lambda: aws_sdk_lambda::Client::new(config),
            eventbridge: RegionalEventBridge::new(config.clone()),
        }
    }
}

#[async_trait]
impl Invoker for AwsInvoker {
    async fn invoke_lambda(&self, function_name: &str, payload: &Value) -> Result<()> {
        let body = serde_json::to_vec(payload)?;
        let output = self
            .lambda
            .invoke()
            .function_name(function_name)
            .invocation_type(InvocationType::Event)
            .payload(Blob::new(body))
            .send()
            .await
            .map_err(|e| anyhow!("Lambda invoke of {} failed: {}", function_name, e))?;

        if let Some(error) = output.function_error() {
            return Err(anyhow!("Lambda {} reported {}", function_name, error));
        }
        Ok(())
    }

    async fn send_partner_event(
        &self,
        region: &str,
        source_name: &str,
        trigger_id: &str,
        detail: &Value,
    ) -> Result<()> {
        let entry = PutPartnerEventsRequestEntry::builder()
            .source(source_name)
            .detail_type(trigger_id)
            .detail(serde_json::to_string(detail)?)
            .build();

        let output = self
            .eventbridge
            .client(region)
            .put_partner_events()
            .entries(entry)
            .send()
            .await
            .map_err(|e| anyhow!("PutPartnerEvents to {} failed: {}", source_name, e))?;

        if let Some(failed) = output.entries().iter().find(|e| e.error_code().is_some()) {
            return Err(anyhow!(
                "partner event rejected: {} {}",
                failed.error_code().unwrap_or_default(),
                failed.error_message().unwrap_or_default()
            ));
        }
        Ok(())
    }
}

/// Provisions the partner event source of an EVENTBRIDGE subscription in the
/// subscriber's account and region
pub struct AwsPartnerEventSources {
    eventbridge: RegionalEventBridge,
}

impl AwsPartnerEventSources {
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self {
            eventbridge: RegionalEventBridge::new(config.clone()),
        }
    }
}

#[async_trait]
impl PartnerEventSources for AwsPartnerEventSources {
    async fn create(
        &self,
        aws_account: &str,
        aws_region: &str,
        name: &str,
    ) -> Result<PartnerEventSource> {
        let output = self
            .eventbridge
            .client(aws_region)
            .create_partner_event_source()
            .name(name)
            .account(aws_account)
            .send()
            .await
            .map_err(|e| anyhow!("CreatePartnerEventSource {} failed: {}", name, e))?;

        let arn = output
            .event_source_arn()
            .ok_or_else(|| anyhow!("CreatePartnerEventSource {} returned no ARN", name))?;
        info!(name, aws_account, aws_region, "Partner event source created");
        Ok(PartnerEventSource {
            name: name.to_string(),
            arn: arn.to_string(),
        })
    }

    async fn delete(&self, aws_account: &str, aws_region: &str, name: &str) -> Result<()> {
        self.eventbridge
            .client(aws_region)
            .delete_partner_event_source()
            .name(name)
            .account(aws_account)
            .send()
            .await
            .map_err(|e| anyhow!("DeletePartnerEventSource {} failed: {}", name, e))?;
        info!(name, aws_account, aws_region, "Partner event source deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::http::{header, HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::post;
    use parking_lot::Mutex;

    const ARN: &str = "arn:aws:events:eu-west-1:123456789012:event-source/aws.partner/ets/acme";

    /// (X-Amz-Target, request body) pairs seen by the stub endpoint
    type Requests = Arc<Mutex<Vec<(String, serde_json::Value)>>>;

    async fn eventbridge_stub() -> (String, Requests) {
        let requests: Requests = Arc::default();
        let seen = requests.clone();
        let app = axum::Router::new().route(
            "/",
            post(move |headers: HeaderMap, body: String| {
                let seen = seen.clone();
                async move {
                    let target = headers
                        .get("x-amz-target")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    let body: serde_json::Value =
                        serde_json::from_str(&body).unwrap_or_default();
                    let response = if target.ends_with("CreatePartnerEventSource") {
                        serde_json::json!({ "EventSourceArn": ARN })
                    } else {
                        serde_json::json!({})
                    };
                    seen.lock().push((target, body));
                    (
                        StatusCode::OK,
                        [(header::CONTENT_TYPE, "application/x-amz-json-1.1")],
                        response.to_string(),
                    )
                        .into_response()
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        (format!("http://{}", addr), requests)
    }

    async fn sdk_config(endpoint: &str) -> aws_config::SdkConfig {
        aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new("us-east-1"))
            .endpoint_url(endpoint)
            .credentials_provider(aws_sdk_eventbridge::config::Credentials::new(
                "test", "test", None, None, "ets-worker-test",
            ))
            .load()
            .await
    }

    #[tokio::test]
    async fn test_create_and_delete_partner_event_source() {
        let (endpoint, requests) = eventbridge_stub().await;
        let sources = AwsPartnerEventSources::new(&sdk_config(&endpoint).await);

        let created = sources
            .create("123456789012", "eu-west-1", "aws.partner/ets/acme")
            .await
            .unwrap();
        assert_eq!(created.name, "aws.partner/ets/acme");
        assert_eq!(created.arn, ARN);

        sources
            .delete("123456789012", "eu-west-1", "aws.partner/ets/acme")
            .await
            .unwrap();

        let requests = requests.lock().clone();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].0, "AWSEvents.CreatePartnerEventSource");
        assert_eq!(requests[0].1["Account"], "123456789012");
        assert_eq!(requests[0].1["Name"], "aws.partner/ets/acme");
        assert_eq!(requests[1].0, "AWSEvents.DeletePartnerEventSource");
    }

    #[tokio::test]
    async fn test_create_without_arn_fails() {
        let app = axum::Router::new().route(
            "/",
            post(|| async {
                (
                    [(header::CONTENT_TYPE, "application/x-amz-json-1.1")],
                    "{}",
                )
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        let sources =
            AwsPartnerEventSources::new(&sdk_config(&format!("http://{}", addr)).await);
        let err = sources
            .create("123456789012", "eu-west-1", "aws.partner/ets/acme")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no ARN"));
    }
}
