//! Reply publication and acknowledgment.
//!
//! A delivery is acknowledged only after its reply was handed to the broker.
//! If publishing the reply fails, one error envelope describing that failure
//! is published instead; if that fails too, the delivery stays unacknowledged
//! so the broker redelivers it once the channel closes.

use std::sync::Arc;

use bytes::Bytes;
use switchyard_core::{ErrorResponse, CONTENT_TYPE_JSON};

use crate::logging::RequestLogger;
use crate::transport::{Delivery, MessageProperties, Transport, TransportError, DEFAULT_EXCHANGE};

/// Context reported when the reply itself could not be published.
pub const REPLY_CONTEXT: &str = "Reply publisher";

/// What happened to a delivery after a reply attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// Reply published, delivery acknowledged.
    Replied,
    /// Reply failed; the fallback error envelope was published and the delivery acknowledged.
    FallbackReplied,
    /// The request carried no reply destination; acknowledged without a reply.
    NoReplyDestination,
    /// Neither the reply nor the fallback could be published; left unacknowledged.
    Unacknowledged,
}

/// Publishes replies on the channel the request arrived on.
#[derive(Clone)]
pub struct Responder {
    transport: Arc<dyn Transport>,
    logger: Arc<dyn RequestLogger>,
}

impl Responder {
    /// A responder publishing on `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, logger: Arc<dyn RequestLogger>) -> Self {
        Self { transport, logger }
    }

    /// Sends `body` to the delivery's reply destination, then acknowledges it.
    pub async fn reply(&self, delivery: &Delivery, body: Bytes) -> ReplyOutcome {
        let Some(reply_to) = delivery
            .properties
            .reply_to
            .as_deref()
            .filter(|destination| !destination.is_empty())
        else {
            self.logger
                .error(REPLY_CONTEXT, &"request has no reply destination; dropping reply");
            self.ack(delivery).await;
            return ReplyOutcome::NoReplyDestination;
        };

        match self.publish(delivery, reply_to, body).await {
            Ok(()) => {
                self.ack(delivery).await;
                ReplyOutcome::Replied
            }
            Err(err) => {
                self.logger.error(REPLY_CONTEXT, &err);
                let fallback =
                    ErrorResponse::new(format!("failed to publish reply: {err}"), REPLY_CONTEXT);
                match self
                    .publish(delivery, reply_to, Bytes::from(fallback.encode()))
                    .await
                {
                    Ok(()) => {
                        self.ack(delivery).await;
                        ReplyOutcome::FallbackReplied
                    }
                    Err(err) => {
                        self.logger.error(REPLY_CONTEXT, &err);
                        ReplyOutcome::Unacknowledged
                    }
                }
            }
        }
    }

    /// Sends an error envelope as the reply.
    pub async fn reply_error(&self, delivery: &Delivery, response: &ErrorResponse) -> ReplyOutcome {
        self.reply(delivery, Bytes::from(response.encode())).await
    }

    async fn publish(
        &self,
        delivery: &Delivery,
        reply_to: &str,
        body: Bytes,
    ) -> Result<(), TransportError> {
        let mut properties = MessageProperties::with_content_type(CONTENT_TYPE_JSON);
        properties.correlation_id.clone_from(&delivery.properties.correlation_id);
        self.transport
            .publish(DEFAULT_EXCHANGE, reply_to, properties, body)
            .await
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(err) = self.transport.ack(delivery).await {
            self.logger.error(REPLY_CONTEXT, &err);
        }
    }
}
