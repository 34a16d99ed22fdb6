//! Delivery confirmation messages
//!
//! After the handler processes an inbound message, the device publishes a
//! confirmation to the confirmation queue. Field names on the wire match
//! what the upstream sync service listens for.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Outcome reported for one inbound message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmationStatus {
    Success,
    Failure,
}

/// Confirmation published to the confirmation queue
///
/// # Examples
/// ```
/// use broker_link::protocol::DeliveryConfirmation;
///
/// let confirmation = DeliveryConfirmation::success("contact-42", "device-7", "stored");
/// let json = confirmation.to_json().unwrap();
/// assert!(json.contains("\"status\":\"success\""));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryConfirmation {
    /// Identifier of the inbound message being confirmed
    #[serde(rename = "contact_id")]
    pub message_id: String,
    pub status: ConfirmationStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Identifier the device assigned locally, when it created something
    #[serde(
        rename = "android_contact_id",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub local_id: Option<String>,
    pub device_id: String,
    /// Unix epoch milliseconds
    pub timestamp: i64,
}

impl DeliveryConfirmation {
    pub fn success(
        message_id: impl Into<String>,
        device_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            status: ConfirmationStatus::Success,
            message: message.into(),
            error: None,
            local_id: None,
            device_id: device_id.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn failure(
        message_id: impl Into<String>,
        device_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        let error = error.into();
        Self {
            message_id: message_id.into(),
            status: ConfirmationStatus::Failure,
            message: "processing failed".to_string(),
            error: Some(error),
            local_id: None,
            device_id: device_id.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn with_local_id(mut self, local_id: impl Into<String>) -> Self {
        self.local_id = Some(local_id.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ConfirmationStatus::Success
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
