//! Amazon SQS work queue.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_sqs::types::QueueAttributeName;
use aws_sdk_sqs::Client;
use tracing::{debug, info};

use super::{Message, QueueOptions, WorkQueue};
use crate::aws::{from_sdk, load_config};
use crate::error::CloudError;

const SERVICE: &str = "sqs";

/// SQS-backed work queue.
#[derive(Debug, Clone)]
pub struct SqsQueue {
    client: Client,
    name: String,
    queue_url: String,
}

impl SqsQueue {
    /// Resolve an existing queue by name.
    pub async fn open(name: &str, options: &QueueOptions) -> Result<Self, CloudError> {
        let client = Client::new(&load_config(options.region.as_deref()).await);
        let output = client
            .get_queue_url()
            .queue_name(name)
            .send()
            .await
            .map_err(|e| from_sdk(SERVICE, e))?;
        let queue_url = output
            .queue_url()
            .ok_or_else(|| CloudError::NotFound(format!("sqs queue {name}")))?
            .to_string();

        debug!(queue = %name, url = %queue_url, "Resolved SQS queue");
        Ok(Self {
            client,
            name: name.to_string(),
            queue_url,
        })
    }

    /// Create the queue (idempotent when attributes match).
    pub async fn create(name: &str, options: &QueueOptions) -> Result<Self, CloudError> {
        let client = Client::new(&load_config(options.region.as_deref()).await);
        let output = client
            .create_queue()
            .queue_name(name)
            .attributes(
                QueueAttributeName::VisibilityTimeout,
                options.visibility_timeout.as_secs().to_string(),
            )
            .send()
            .await
            .map_err(|e| from_sdk(SERVICE, e))?;
        let queue_url = output
            .queue_url()
            .ok_or_else(|| CloudError::NotFound(format!("sqs queue {name}")))?
            .to_string();

        info!(queue = %name, url = %queue_url, "Created SQS queue");
        Ok(Self {
            client,
            name: name.to_string(),
            queue_url,
        })
    }
}

fn timeout_secs(timeout: Duration) -> i32 {
    i32::try_from(timeout.as_secs()).unwrap_or(i32::MAX)
}

#[async_trait]
impl WorkQueue for SqsQueue {
    async fn read(&self) -> Result<Option<Message>, CloudError> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(1)
            .send()
            .await
            .map_err(|e| from_sdk(SERVICE, e))?;

        Ok(output.messages().first().and_then(|m| {
            Some(Message {
                id: m.message_id()?.to_string(),
                receipt: m.receipt_handle()?.to_string(),
                body: m.body().unwrap_or_default().to_string(),
            })
        }))
    }

    async fn change_visibility(
        &self,
        message: &Message,
        timeout: Duration,
    ) -> Result<(), CloudError> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(&message.receipt)
            .visibility_timeout(timeout_secs(timeout))
            .send()
            .await
            .map_err(|e| from_sdk(SERVICE, e))?;
        Ok(())
    }

    async fn delete(&self, message: &Message) -> Result<(), CloudError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(&message.receipt)
            .send()
            .await
            .map_err(|e| from_sdk(SERVICE, e))?;
        Ok(())
    }

    async fn push(&self, body: &str) -> Result<(), CloudError> {
        self.client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .send()
            .await
            .map_err(|e| from_sdk(SERVICE, e))?;
        Ok(())
    }

    async fn count(&self) -> Result<u64, CloudError> {
        let output = self
            .client
            .get_queue_attributes()
            .queue_url(&self.queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .send()
            .await
            .map_err(|e| from_sdk(SERVICE, e))?;

        Ok(output
            .attributes()
            .and_then(|attrs| attrs.get(&QueueAttributeName::ApproximateNumberOfMessages))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    async fn clear(&self) -> Result<(), CloudError> {
        self.client
            .purge_queue()
            .queue_url(&self.queue_url)
            .send()
            .await
            .map_err(|e| from_sdk(SERVICE, e))?;
        Ok(())
    }

    async fn destroy(&self) -> Result<(), CloudError> {
        self.client
            .delete_queue()
            .queue_url(&self.queue_url)
            .send()
            .await
            .map_err(|e| from_sdk(SERVICE, e))?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("sqs://{}", self.name)
    }
}
