// ABOUTME: Common response schemas adapters normalize provider payloads into
// ABOUTME: Messages, calendar events, and pagination wrappers
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Links HQ

//! Normalized response shapes.
//!
//! Adapters translate provider payloads into these schemas; where a provider
//! has no semantic analog for a field the field is omitted, never defaulted.
//! The optional `raw` member preserves the untranslated payload for callers
//! that need provider-specific detail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An email address with an optional display name
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmailAddress {
    /// Address
    pub email: String,
    /// Display name when the provider carries one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Message body in the formats the provider exposes
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MessageBody {
    /// Plain-text body
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// HTML body
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
}

/// Attachment metadata; content is fetched separately
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// Provider attachment id
    pub id: String,
    /// File name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// MIME type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Size in bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// A mail message in the common schema
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedMessage {
    /// Provider message id
    pub id: String,
    /// Thread id when the provider threads mail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// Source provider name
    pub provider: String,
    /// Subject line
    pub subject: String,
    /// Short preview when available
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    /// Body when requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<MessageBody>,
    /// Sender
    pub from: EmailAddress,
    /// Primary recipients
    pub to: Vec<EmailAddress>,
    /// Carbon-copy recipients
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cc: Option<Vec<EmailAddress>>,
    /// Message timestamp (RFC 3339 on the wire)
    pub timestamp: DateTime<Utc>,
    /// Read marker
    pub is_read: bool,
    /// Provider labels or folders
    pub labels: Vec<String>,
    /// Attachment metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,
    /// Untranslated provider payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

/// A point or whole-day boundary of a calendar event
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct EventTime {
    /// Instant, for timed events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_time: Option<DateTime<Utc>>,
    /// Date only, for all-day events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    /// IANA time zone
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
}

/// An event participant
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attendee {
    /// Address
    pub email: String,
    /// Display name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// accepted | declined | tentative | needsAction
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_status: Option<String>,
}

/// Calendar event status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    /// Will happen
    Confirmed,
    /// May happen
    Tentative,
    /// Cancelled
    Cancelled,
}

/// A calendar event in the common schema
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedEvent {
    /// Provider event id
    pub id: String,
    /// Source provider name
    pub provider: String,
    /// Calendar the event belongs to
    pub calendar_id: String,
    /// Title
    pub summary: String,
    /// Description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Location
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Start boundary
    pub start: EventTime,
    /// End boundary
    pub end: EventTime,
    /// Participants
    pub attendees: Vec<Attendee>,
    /// Organizer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organizer: Option<Attendee>,
    /// Status
    pub status: EventStatus,
    /// Provider web link
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html_link: Option<String>,
    /// Untranslated provider payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

/// Paginated result wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    /// Items in this page
    pub items: Vec<T>,
    /// Opaque token for the next page
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
    /// Provider's estimate of the full result size
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_size_estimate: Option<u64>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn absent_fields_are_omitted_not_defaulted() {
        let message = NormalizedMessage {
            id: "m1".into(),
            thread_id: None,
            provider: "gmail".into(),
            subject: "hello".into(),
            snippet: None,
            body: None,
            from: EmailAddress {
                email: "a@example.com".into(),
                name: None,
            },
            to: vec![],
            cc: None,
            timestamp: Utc::now(),
            is_read: false,
            labels: vec![],
            attachments: None,
            raw: None,
        };
        let json = serde_json::to_value(&message).unwrap();
        let object = json.as_object().unwrap();
        assert!(!object.contains_key("threadId"));
        assert!(!object.contains_key("snippet"));
        assert!(!object.contains_key("raw"));
        assert!(object.contains_key("isRead"));
    }

    #[test]
    fn page_serializes_camel_case() {
        let page = Page {
            items: vec![1, 2, 3],
            next_page_token: Some("tok".into()),
            result_size_estimate: None,
        };
        let json = serde_json::to_value(&page).unwrap();
        assert_eq!(json["nextPageToken"], "tok");
        assert!(json.get("resultSizeEstimate").is_none());
    }
}
