//! Extractors for the handful of payload shapes upstream providers answer with.
//!
//! Each extractor looks in exactly one place and returns `None` when that place
//! is absent or blank. The `coalesce_*` functions try them in a fixed priority
//! order and return the first hit.

use serde_json::Value;

type TextExtractor = fn(&Value) -> Option<&str>;
type ParsedExtractor = fn(&Value) -> Option<&Value>;

/// Priority order for raw text.
const TEXT_EXTRACTORS: [TextExtractor; 3] = [output_text_field, message_output_text, choice_text];

/// Priority order for provider-side parsed objects.
const PARSED_EXTRACTORS: [ParsedExtractor; 2] = [output_parsed_field, message_output_parsed];

pub fn coalesce_output_text(payload: &Value) -> Option<&str> {
    TEXT_EXTRACTORS.iter().find_map(|extract| extract(payload))
}

pub fn coalesce_parsed_output(payload: &Value) -> Option<&Value> {
    PARSED_EXTRACTORS.iter().find_map(|extract| extract(payload))
}

/// Top-level `output_text` (responses API convenience field).
pub fn output_text_field(payload: &Value) -> Option<&str> {
    payload
        .get("output_text")
        .and_then(|v| v.as_str())
        .filter(|s| !is_blank(s))
}

/// `output[type=message].content[type=output_text].text`
pub fn message_output_text(payload: &Value) -> Option<&str> {
    output_text_parts(payload).find_map(|part| {
        part.get("text")
            .and_then(|v| v.as_str())
            .filter(|s| !is_blank(s))
    })
}

/// `choices[].message.content` (chat completions).
pub fn choice_text(payload: &Value) -> Option<&str> {
    payload
        .get("choices")
        .and_then(|v| v.as_array())?
        .iter()
        .find_map(|choice| {
            choice
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(|c| c.as_str())
                .filter(|s| !is_blank(s))
        })
}

pub fn output_parsed_field(payload: &Value) -> Option<&Value> {
    payload.get("output_parsed").filter(|v| !v.is_null())
}

/// `output[type=message].content[type=output_text].parsed`
pub fn message_output_parsed(payload: &Value) -> Option<&Value> {
    output_text_parts(payload).find_map(|part| part.get("parsed").filter(|v| !v.is_null()))
}

fn output_text_parts(payload: &Value) -> impl Iterator<Item = &Value> {
    payload
        .get("output")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
        .filter(|item| item.get("type").and_then(|t| t.as_str()) == Some("message"))
        .filter_map(|item| item.get("content").and_then(|c| c.as_array()))
        .flatten()
        .filter(|part| part.get("type").and_then(|t| t.as_str()) == Some("output_text"))
}

fn is_blank(s: &str) -> bool {
    s.trim().is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn responses_payload(text: &str) -> Value {
        json!({
            "output": [
                { "type": "reasoning", "content": [{ "type": "output_text", "text": "ignored" }] },
                { "type": "message", "content": [
                    { "type": "refusal", "refusal": "no" },
                    { "type": "output_text", "text": text }
                ]}
            ]
        })
    }

    #[test]
    fn output_text_field_wins_over_nested_shapes() {
        let mut payload = responses_payload("nested");
        payload["output_text"] = json!("direct");
        payload["choices"] = json!([{ "message": { "content": "chat" } }]);
        assert_eq!(coalesce_output_text(&payload), Some("direct"));
    }

    #[test]
    fn message_content_wins_over_choices() {
        let mut payload = responses_payload("nested");
        payload["output_text"] = json!("   ");
        payload["choices"] = json!([{ "message": { "content": "chat" } }]);
        assert_eq!(coalesce_output_text(&payload), Some("nested"));
    }

    #[test]
    fn chat_choices_are_scanned_in_order() {
        let payload = json!({
            "choices": [
                { "message": { "content": "" } },
                { "message": { "content": null } },
                { "message": { "content": "second" } }
            ]
        });
        assert_eq!(coalesce_output_text(&payload), Some("second"));
    }

    #[test]
    fn nothing_found_is_none() {
        assert_eq!(coalesce_output_text(&json!({})), None);
        assert_eq!(coalesce_output_text(&json!("text")), None);
        assert_eq!(coalesce_output_text(&responses_payload(" ")), None);
        assert_eq!(coalesce_parsed_output(&json!({ "output_parsed": null })), None);
    }

    #[test]
    fn parsed_field_wins_over_part_parsed() {
        let payload = json!({
            "output_parsed": { "headline": "top" },
            "output": [{ "type": "message", "content": [
                { "type": "output_text", "text": "{}", "parsed": { "headline": "part" } }
            ]}]
        });
        assert_eq!(
            coalesce_parsed_output(&payload),
            Some(&json!({ "headline": "top" }))
        );

        let payload = json!({
            "output": [{ "type": "message", "content": [
                { "type": "output_text", "text": "{}", "parsed": { "headline": "part" } }
            ]}]
        });
        assert_eq!(
            coalesce_parsed_output(&payload),
            Some(&json!({ "headline": "part" }))
        );
    }
}
