use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

/// Extract a JSON fragment between the first `open` and the last `close`
pub fn extract_json_fragment(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    if start <= end {
        Some(&text[start..=end])
    } else {
        None
    }
}

/// Parse the first `{` .. last `}` slice of a model reply.
///
/// Models often wrap JSON in prose or markdown fences; anything outside the
/// outermost braces is ignored.
pub fn parse_json_object<T: DeserializeOwned>(text: &str) -> Result<T> {
    let fragment = extract_json_fragment(text, '{', '}')
        .ok_or_else(|| anyhow::anyhow!("No JSON object in model reply"))?;
    serde_json::from_str(fragment).context("Model reply is not valid JSON")
}

/// Deserialize a field that may be null or missing as its default
pub fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + serde::Deserialize<'de>,
{
    use serde::Deserialize;
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Reply {
        ok: bool,
        #[serde(default, deserialize_with = "null_as_default")]
        items: Vec<String>,
    }

    #[test]
    fn test_extract_from_fenced_prose() {
        let text = "Here you go:\n```json\n{\"ok\": true, \"items\": [\"a\"]}\n```\nThanks";
        let reply: Reply = parse_json_object(text).unwrap();
        assert_eq!(
            reply,
            Reply {
                ok: true,
                items: vec!["a".to_string()]
            }
        );
    }

    #[test]
    fn test_null_list_becomes_empty() {
        let reply: Reply = parse_json_object(r#"{"ok": false, "items": null}"#).unwrap();
        assert!(reply.items.is_empty());
    }

    #[test]
    fn test_no_object_is_error() {
        assert!(parse_json_object::<Reply>("I could not find a bug.").is_err());
        assert!(parse_json_object::<Reply>("} backwards {").is_err());
        assert!(parse_json_object::<Reply>("{not json}").is_err());
    }

    #[test]
    fn test_extract_fragment_bounds() {
        assert_eq!(extract_json_fragment("x[1,[2]]y", '[', ']'), Some("[1,[2]]"));
        assert_eq!(extract_json_fragment("none", '{', '}'), None);
    }
}
