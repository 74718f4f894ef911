//! `@block` mention routing for chat submissions.

use super::IoType;

/// Text destined for one input block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedInput {
    /// Input block name.
    pub block: String,
    /// Text with mentions removed.
    pub text: String,
}

/// Split `message` into `@name` mentions and the remaining text.
pub fn split_mentions(message: &str) -> (Vec<&str>, String) {
    let mut mentions = Vec::new();
    let mut text = String::with_capacity(message.len());
    let mut rest = message;

    while let Some(at) = rest.find('@') {
        text.push_str(&rest[..at]);
        let tail = &rest[at..];
        let end = tail
            .char_indices()
            .find(|(_, c)| c.is_whitespace())
            .map_or(tail.len(), |(i, _)| i);
        let name = &tail[1..end];
        if name.is_empty() {
            text.push('@');
        } else {
            mentions.push(name);
        }
        rest = &tail[end..];
    }
    text.push_str(rest);

    (mentions, text.trim().to_string())
}

/// Decide which input blocks receive `message`.
///
/// Without mentions the first input gets the text. Each mention of a declared
/// input routes there; unknown mentions fall back to the first input. A block
/// is targeted at most once. Blank messages or pipelines without inputs
/// route nowhere.
pub fn route_message(message: &str, inputs: &[IoType]) -> Vec<RoutedInput> {
    let Some(first) = inputs.first() else {
        return Vec::new();
    };
    if message.trim().is_empty() {
        return Vec::new();
    }

    let (mentions, text) = split_mentions(message);
    let mut targets: Vec<&str> = Vec::new();
    if mentions.is_empty() {
        targets.push(&first.name);
    }
    for mention in mentions {
        let target = inputs
            .iter()
            .find(|input| input.name == mention)
            .map_or(first.name.as_str(), |input| input.name.as_str());
        if !targets.contains(&target) {
            targets.push(target);
        }
    }

    targets
        .into_iter()
        .map(|block| RoutedInput {
            block: block.to_string(),
            text: text.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(names: &[&str]) -> Vec<IoType> {
        names
            .iter()
            .map(|n| IoType {
                name: (*n).to_string(),
                io_type: "text_input".to_string(),
            })
            .collect()
    }

    #[test]
    fn test_split_mentions() {
        let (mentions, text) = split_mentions("@search find @summary cats");
        assert_eq!(mentions, ["search", "summary"]);
        assert_eq!(text, "find  cats");
    }

    #[test]
    fn test_lone_at_sign_is_text() {
        let (mentions, text) = split_mentions("mail me @ home");
        assert!(mentions.is_empty());
        assert_eq!(text, "mail me @ home");
    }

    #[test]
    fn test_plain_message_goes_to_first_input() {
        let routed = route_message("hello", &inputs(&["chat", "other"]));
        assert_eq!(
            routed,
            [RoutedInput {
                block: "chat".into(),
                text: "hello".into()
            }]
        );
    }

    #[test]
    fn test_mentions_route_to_named_inputs() {
        let routed = route_message("@other hi", &inputs(&["chat", "other"]));
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].block, "other");
        assert_eq!(routed[0].text, "hi");
    }

    #[test]
    fn test_unknown_mentions_fall_back_once() {
        let routed = route_message("@x @y hi", &inputs(&["chat"]));
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].block, "chat");
    }

    #[test]
    fn test_blank_or_no_inputs_routes_nowhere() {
        assert!(route_message("   ", &inputs(&["chat"])).is_empty());
        assert!(route_message("hi", &[]).is_empty());
    }
}
