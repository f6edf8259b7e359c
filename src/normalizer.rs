//! Maps raw extraction records onto the canonical [`Message`] shape.

use crate::error::NormalizeError;
use crate::models::{parse_timestamp, Flag, Message, RawRecord};

pub const MESSAGE_URL_BASE: &str = "https://discord.com/channels";

/// Deterministic permalink for a message.
pub fn message_url(server_id: &str, channel_id: &str, message_id: &str) -> String {
    format!("{}/{}/{}/{}", MESSAGE_URL_BASE, server_id, channel_id, message_id)
}

/// Normalizes one raw record for `channel_id` on `server_id`.
///
/// Pure: the same inputs always give the same message. Missing optionals stay
/// `None`. Blank ids, URLs and timestamps count as missing; content is kept
/// verbatim unless empty. Attachment and embed payloads are only serialized
/// when present and non-empty, and boolean-ish flags collapse to `bool` with
/// absent meaning `false`.
pub fn normalize(
    raw: &RawRecord,
    channel_id: &str,
    server_id: &str,
) -> Result<Message, NormalizeError> {
    let timestamp =
        parse_timestamp(&raw.timestamp).ok_or_else(|| NormalizeError::InvalidTimestamp {
            id: raw.id.clone(),
            value: raw.timestamp.clone(),
        })?;

    let edited_timestamp = match non_blank(&raw.edited_timestamp) {
        Some(value) => Some(parse_timestamp(&value).ok_or_else(|| {
            NormalizeError::InvalidEditedTimestamp {
                id: raw.id.clone(),
                value,
            }
        })?),
        None => None,
    };

    let attachment_urls = match raw.attachment_urls.as_deref() {
        Some(urls) if !urls.is_empty() => Some(serde_json::to_string(urls).map_err(|source| {
            NormalizeError::Serialize {
                id: raw.id.clone(),
                field: "attachment_urls",
                source,
            }
        })?),
        _ => None,
    };

    let embed_data = match raw.embed_data.as_ref() {
        Some(value) if !is_empty_json(value) => {
            Some(serde_json::to_string(value).map_err(|source| NormalizeError::Serialize {
                id: raw.id.clone(),
                field: "embed_data",
                source,
            })?)
        }
        _ => None,
    };

    Ok(Message {
        id: raw.id.clone(),
        channel_id: channel_id.to_string(),
        author_id: raw.author_id.clone(),
        author_name: raw.author_name.clone(),
        author_avatar_url: non_blank(&raw.author_avatar_url),
        content: raw.content.clone().filter(|c| !c.is_empty()),
        timestamp,
        reply_to_message_id: non_blank(&raw.reply_to_message_id),
        edited_timestamp,
        is_pinned: Flag::is_set(raw.is_pinned),
        attachment_urls,
        embed_data,
        message_url: message_url(server_id, channel_id, &raw.id),
        has_attachments: Flag::is_set(raw.has_attachments),
        has_embeds: Flag::is_set(raw.has_embeds),
    })
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
}

fn is_empty_json(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::Array(items) => items.is_empty(),
        serde_json::Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(id: &str) -> RawRecord {
        RawRecord {
            id: id.to_string(),
            author_id: "u1".to_string(),
            author_name: "Alice".to_string(),
            timestamp: "2024-05-01T12:00:00.000Z".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_minimal_record_keeps_optionals_absent() {
        let msg = normalize(&raw("m1"), "c1", "g1").unwrap();

        assert_eq!(msg.id, "m1");
        assert_eq!(msg.channel_id, "c1");
        assert_eq!(msg.content, None);
        assert_eq!(msg.author_avatar_url, None);
        assert_eq!(msg.reply_to_message_id, None);
        assert_eq!(msg.edited_timestamp, None);
        assert_eq!(msg.attachment_urls, None);
        assert_eq!(msg.embed_data, None);
        assert!(!msg.is_pinned);
        assert!(!msg.has_attachments);
        assert!(!msg.has_embeds);
    }

    #[test]
    fn test_message_url_is_deterministic() {
        let msg = normalize(&raw("m1"), "c1", "g1").unwrap();
        assert_eq!(msg.message_url, "https://discord.com/channels/g1/c1/m1");
        assert_eq!(msg, normalize(&raw("m1"), "c1", "g1").unwrap());
    }

    #[test]
    fn test_blank_strings_become_absent() {
        let mut record = raw("m1");
        record.content = Some(String::new());
        record.reply_to_message_id = Some("  ".to_string());
        record.edited_timestamp = Some(String::new());

        let msg = normalize(&record, "c1", "g1").unwrap();
        assert_eq!(msg.content, None);
        assert_eq!(msg.reply_to_message_id, None);
        assert_eq!(msg.edited_timestamp, None);
    }

    #[test]
    fn test_whitespace_content_is_kept() {
        let mut record = raw("m1");
        record.content = Some("   ".to_string());

        let msg = normalize(&record, "c1", "g1").unwrap();
        assert_eq!(msg.content.as_deref(), Some("   "));
    }

    #[test]
    fn test_payloads_serialized_only_when_present() {
        let mut record = raw("m1");
        record.attachment_urls = Some(vec![
            "https://cdn.example/b.png".to_string(),
            "https://cdn.example/a.png".to_string(),
        ]);
        record.embed_data = Some(json!({"title": "hello"}));
        record.has_attachments = Some(Flag::Int(1));
        record.has_embeds = Some(Flag::Bool(true));
        record.is_pinned = Some(Flag::Int(0));

        let msg = normalize(&record, "c1", "g1").unwrap();
        assert_eq!(
            msg.attachment_urls.as_deref(),
            Some(r#"["https://cdn.example/b.png","https://cdn.example/a.png"]"#)
        );
        assert_eq!(msg.embed_data.as_deref(), Some(r#"{"title":"hello"}"#));
        assert!(msg.has_attachments);
        assert!(msg.has_embeds);
        assert!(!msg.is_pinned);

        record.attachment_urls = Some(Vec::new());
        record.embed_data = Some(json!([]));
        let msg = normalize(&record, "c1", "g1").unwrap();
        assert_eq!(msg.attachment_urls, None);
        assert_eq!(msg.embed_data, None);
    }

    #[test]
    fn test_invalid_timestamp_is_an_error() {
        let mut record = raw("m1");
        record.timestamp = "yesterday".to_string();
        let err = normalize(&record, "c1", "g1").unwrap_err();
        assert!(err.to_string().contains("yesterday"));

        let mut record = raw("m2");
        record.edited_timestamp = Some("not a date".to_string());
        assert!(matches!(
            normalize(&record, "c1", "g1"),
            Err(NormalizeError::InvalidEditedTimestamp { .. })
        ));
    }

    #[test]
    fn test_offset_timestamps_are_converted_to_utc() {
        let mut record = raw("m1");
        record.timestamp = "2024-05-01T14:00:00+02:00".to_string();
        let msg = normalize(&record, "c1", "g1").unwrap();
        assert_eq!(
            crate::models::format_timestamp(&msg.timestamp),
            "2024-05-01T12:00:00.000Z"
        );
    }
}
