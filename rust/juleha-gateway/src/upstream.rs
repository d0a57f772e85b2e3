/*
 * AicengHub — guarded AI chat gateway and curated tool catalog
 * Copyright (C) 2025–2026 AicengHub contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Upstream model fan-out: strictly sequential primary → secondary →
//! tertiary; a later route is only attempted after the previous one failed.
//! Route failures are logged and swallowed; only exhaustion surfaces.

use aicenghub_config::RoutesConfig;
use serde_json::json;
use std::time::Duration;
use tracing::warn;

use crate::sanitize::CleanMessage;

const UPSTREAM_ENDPOINT: &str = "https://openrouter.ai/api/v1/chat/completions";
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// First successful route's redactable output.
#[derive(Debug, Clone)]
pub struct RouteOutcome {
    pub text: String,
    pub label: String,
}

/// Pull assistant text out of a chat-completions payload; content may be a
/// string or an array of text parts.
pub fn extract_assistant_text(payload: &serde_json::Value) -> Option<String> {
    let content = payload
        .get("choices")?
        .as_array()?
        .first()?
        .get("message")?
        .get("content")?;
    let text = match content {
        serde_json::Value::String(text) => text.clone(),
        serde_json::Value::Array(parts) => parts
            .iter()
            .filter_map(|part| {
                part.as_str().map(str::to_string).or_else(|| {
                    part.get("text")
                        .and_then(serde_json::Value::as_str)
                        .map(str::to_string)
                })
            })
            .collect::<Vec<_>>()
            .join(""),
        _ => return None,
    };
    let trimmed = text.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Human-readable failure for a non-2xx route response: the upstream
/// `error.message` when present, else a status-specific description.
pub fn route_error_message(status: u16, payload: &serde_json::Value) -> String {
    if let Some(message) = payload
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(serde_json::Value::as_str)
    {
        return message.to_string();
    }
    match status {
        401 | 403 => "invalid key or unauthorized model".to_string(),
        402 => "insufficient credits on this route".to_string(),
        429 => "provider-rate-limited".to_string(),
        other => format!("HTTP {other}"),
    }
}

fn messages_payload(system: &[String], conversation: &[CleanMessage]) -> serde_json::Value {
    let mut messages: Vec<serde_json::Value> = system
        .iter()
        .map(|content| json!({"role": "system", "content": content}))
        .collect();
    messages.extend(
        conversation
            .iter()
            .map(|m| json!({"role": m.role, "content": m.content})),
    );
    serde_json::Value::Array(messages)
}

/// Try each configured route in order; return the first non-empty assistant
/// text. `None` means every route failed.
pub async fn fan_out(
    client: &reqwest::Client,
    routes: &RoutesConfig,
    system_messages: &[String],
    conversation: &[CleanMessage],
) -> Option<RouteOutcome> {
    let messages = messages_payload(system_messages, conversation);

    for route in &routes.routes {
        let body = json!({"model": route.model, "messages": messages});
        let sent = client
            .post(UPSTREAM_ENDPOINT)
            .timeout(UPSTREAM_TIMEOUT)
            .bearer_auth(&route.api_key)
            .header("HTTP-Referer", &routes.http_referer)
            .header("X-Title", &routes.app_title)
            .json(&body)
            .send()
            .await;

        let resp = match sent {
            Ok(resp) => resp,
            Err(e) => {
                warn!(route = %route.label, error = %e, "upstream request failed");
                continue;
            }
        };

        let status = resp.status().as_u16();
        let payload: serde_json::Value = resp.json().await.unwrap_or_default();

        if !(200..300).contains(&status) {
            warn!(
                route = %route.label,
                status,
                error = %route_error_message(status, &payload),
                "upstream route rejected request"
            );
            continue;
        }

        match extract_assistant_text(&payload) {
            Some(text) => {
                return Some(RouteOutcome {
                    text,
                    label: route.label.clone(),
                });
            }
            None => {
                warn!(route = %route.label, "empty-assistant-response");
                continue;
            }
        }
    }

    None
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_string_content() {
        let payload = json!({"choices": [{"message": {"content": "  hello  "}}]});
        assert_eq!(extract_assistant_text(&payload), Some("hello".to_string()));
    }

    #[test]
    fn test_extract_part_array_content() {
        let payload = json!({"choices": [{"message": {"content": [
            {"type": "text", "text": "a"},
            "b",
            {"text": "c"},
        ]}}]});
        assert_eq!(extract_assistant_text(&payload), Some("abc".to_string()));
    }

    #[test]
    fn test_extract_rejects_empty_and_missing() {
        assert_eq!(
            extract_assistant_text(&json!({"choices": [{"message": {"content": "   "}}]})),
            None
        );
        assert_eq!(extract_assistant_text(&json!({"choices": []})), None);
        assert_eq!(extract_assistant_text(&json!({})), None);
        assert_eq!(
            extract_assistant_text(&json!({"choices": [{"message": {"content": 7}}]})),
            None
        );
    }

    #[test]
    fn test_route_error_prefers_upstream_message() {
        let payload = json!({"error": {"message": "model is overloaded"}});
        assert_eq!(route_error_message(500, &payload), "model is overloaded");
    }

    #[test]
    fn test_route_error_status_specific() {
        let empty = json!({});
        assert_eq!(
            route_error_message(401, &empty),
            "invalid key or unauthorized model"
        );
        assert_eq!(
            route_error_message(403, &empty),
            "invalid key or unauthorized model"
        );
        assert_eq!(
            route_error_message(402, &empty),
            "insufficient credits on this route"
        );
        assert_eq!(route_error_message(429, &empty), "provider-rate-limited");
        assert_eq!(route_error_message(503, &empty), "HTTP 503");
    }

    #[test]
    fn test_messages_payload_prepends_system() {
        let system = vec!["prompt one".to_string(), "prompt two".to_string()];
        let conversation = vec![CleanMessage {
            role: "user".to_string(),
            content: "hi".to_string(),
        }];
        let payload = messages_payload(&system, &conversation);
        let arr = payload.as_array().unwrap();
        assert_eq!(arr.len(), 3);
        assert_eq!(arr[0]["role"], "system");
        assert_eq!(arr[0]["content"], "prompt one");
        assert_eq!(arr[2]["role"], "user");
    }
}
