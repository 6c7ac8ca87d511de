use serde_json::Value;

/// Concatenates the `text` parts of a content-block array with `\n`.
/// Non-text parts (images, tool calls) are dropped.
pub fn flatten_content_blocks(blocks: &[Value]) -> String {
    blocks
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Message content is either a plain string or a content-block array.
pub fn content_to_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(blocks)) => flatten_content_blocks(blocks),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn only_text_parts_are_joined() {
        let blocks = json!([
            {"type": "text", "text": "first"},
            {"type": "tool_use", "id": "t1", "name": "lookup", "input": {}},
            {"type": "text", "text": "second"}
        ]);
        assert_eq!(
            flatten_content_blocks(blocks.as_array().unwrap()),
            "first\nsecond"
        );
    }

    #[test]
    fn string_content_passes_through() {
        assert_eq!(content_to_text(Some(&json!("hi"))), "hi");
        assert_eq!(content_to_text(None), "");
    }
}
