//! Fire-and-forget publication of order events and email requests.

use serde::Serialize;
use tracing::{debug, warn};
use crate::domain::events::{EmailRequest, OrderEvent};

/// Publishes on NATS when connected; otherwise a no-op. Never blocks or
/// fails the caller.
#[derive(Clone, Default)]
pub struct EventPublisher {
    nats: Option<async_nats::Client>,
}

impl EventPublisher {
    pub fn new(nats: Option<async_nats::Client>) -> Self { Self { nats } }

    pub fn disabled() -> Self { Self::default() }

    pub fn is_connected(&self) -> bool { self.nats.is_some() }

    pub fn order_event(&self, event: OrderEvent) { self.publish(event.subject(), &event); }

    pub fn email(&self, request: Option<EmailRequest>) {
        match request {
            Some(request) => self.publish(EmailRequest::SUBJECT, &request),
            None => debug!("no customer email, skipping notification"),
        }
    }

    fn publish<T: Serialize>(&self, subject: &'static str, payload: &T) {
        let Some(client) = self.nats.clone() else { return };
        let bytes = match serde_json::to_vec(payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(subject, error = %e, "failed to encode event");
                return;
            }
        };
        tokio::spawn(async move {
            if let Err(e) = client.publish(subject.to_string(), bytes.into()).await {
                warn!(subject, error = %e, "failed to publish event");
            }
        });
    }
}
