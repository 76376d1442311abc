//! Alert dispatch seam.
//!
//! `AlertDispatcher` is the external collaborator that performs the
//! actual call/SMS side effects; the engine only decides when, to whom,
//! and with what payload. Per-contact failures are reported back and
//! recorded on the episode; they never abort the escalation.

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::contacts::Contact;
use crate::message::MessageBundle;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Dial failed: {0}")]
    Dial(String),

    #[error("Bundle delivery failed: {0}")]
    Delivery(String),
}

/// Per-recipient delivery outcome for a dispatched bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub phone: String,
    pub delivered: bool,
}

/// Call/SMS transport. Implementations must be cheap to call
/// concurrently: the secondary escalation wave dials every remaining
/// contact at once.
pub trait AlertDispatcher: Send + Sync {
    /// Initiate a call to one contact. Resolves when the attempt
    /// completes or definitively fails.
    fn dial(&self, contact: Contact) -> BoxFuture<'static, Result<(), DispatchError>>;

    /// Deliver the alert bundle to its recipients, best-effort.
    fn send_bundle(
        &self,
        bundle: MessageBundle,
    ) -> BoxFuture<'static, Result<Vec<Delivery>, DispatchError>>;
}

/// Dispatcher that only logs, the demo stand-in for real telephony.
pub struct LoggingDispatcher;

impl AlertDispatcher for LoggingDispatcher {
    fn dial(&self, contact: Contact) -> BoxFuture<'static, Result<(), DispatchError>> {
        Box::pin(async move {
            tracing::info!(name = %contact.name, phone = %contact.phone, "simulated emergency call");
            Ok(())
        })
    }

    fn send_bundle(
        &self,
        bundle: MessageBundle,
    ) -> BoxFuture<'static, Result<Vec<Delivery>, DispatchError>> {
        Box::pin(async move {
            tracing::info!(recipients = bundle.recipients.len(), "simulated alert bundle\n{}", bundle.text);
            Ok(bundle
                .recipients
                .into_iter()
                .map(|phone| Delivery {
                    phone,
                    delivered: true,
                })
                .collect())
        })
    }
}
