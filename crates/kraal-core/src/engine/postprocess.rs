//! Output post-processing: stop-sequence truncation and gpt-oss cleanup.

/// Stop sequences checked against generated text, in priority order.
/// Some models emit these as plain text without flagging an EOG token.
pub const STOP_SEQUENCES: &[&str] = &[
    "<|im_end|>",    // ChatML (Qwen3, etc.)
    "<|end|>",       // gpt-oss, some others
    "<|start|>",     // gpt-oss: a new message is starting
    "<|eot_id|>",    // Llama 3
    "</s>",          // Llama 2, Mistral
    "<|endoftext|>", // GPT-style
];

/// Find the first stop sequence (by list order) in `text`.
pub fn find_stop(text: &str) -> Option<(usize, &'static str)> {
    for stop in STOP_SEQUENCES {
        if let Some(pos) = text.find(stop) {
            return Some((pos, stop));
        }
    }
    None
}

/// Truncate `text` at the first stop sequence, if any.
pub fn truncate_at_stop(text: &str) -> &str {
    match find_stop(text) {
        Some((pos, _)) => &text[..pos],
        None => text,
    }
}

const CONTROL_TOKENS: &[&str] = &[
    "<|start|>",
    "<|end|>",
    "<|message|>",
    "<|channel|>",
    "<|im_start|>",
    "<|im_end|>",
    "<s>",
    "</s>",
    "<|endoftext|>",
    "<|eot_id|>",
];

/// Remove bare control tokens and trim surrounding whitespace.
pub fn strip_control_tokens(text: &str) -> String {
    let mut result = text.to_string();
    for token in CONTROL_TOKENS {
        result = result.replace(token, "");
    }
    result.trim().to_string()
}

/// Extract the last `final` channel segment from gpt-oss output, when the
/// channel marker survived generation.
pub fn extract_final_channel(output: &str) -> Option<String> {
    const MARKER: &str = "<|channel|>final<|message|>";
    const END: &str = "<|end|>";

    let start = output.rfind(MARKER)? + MARKER.len();
    let segment = match output[start..].find(END) {
        Some(end) => &output[start..start + end],
        None => &output[start..],
    };
    Some(strip_control_tokens(segment))
}

const GPT_OSS_TOKENS: &[&str] = &[
    // gpt-oss tokens
    "<|start|>",
    "<|end|>",
    "<|message|>",
    "<|channel|>",
    "<|startoftext|>",
    "<|endoftext|>",
    "<|return|>",
    "<|call|>",
    "<|constrain|>",
    "<|endofprompt|>",
    // ChatML tokens
    "<|im_start|>",
    "<|im_end|>",
    "<|assistant>",
    "<|user>",
    "<|system>",
    // Common control tokens
    "<|eot_id|>",
    "</s>",
    "<s>",
    "<|begin_of_text|>",
    "<|end_of_text|>",
];

const CHANNEL_PATTERNS: &[&str] = &[
    // Concatenated role+channel forms first
    "assistantanalysis:",
    "assistantfinal:",
    "assistantcommentary:",
    "useranalysis:",
    "userfinal:",
    "usercommentary:",
    "systemanalysis:",
    "systemfinal:",
    "systemcommentary:",
    // Bare channel and role labels
    "analysis:",
    "final:",
    "commentary:",
    "assistant:",
    "user:",
    "system:",
    "developer:",
    // "=name" forms
    "=assistant",
    "=analysis",
    "=final",
    "=commentary",
    "=user",
    "=system",
    "=developer",
];

const CHANNEL_NAMES: &[&str] = &[
    "assistant",
    "analysis",
    "final",
    "commentary",
    "user",
    "system",
    "developer",
];

/// Scrub gpt-oss channel markup that leaked into generated text.
pub fn clean_gpt_oss_output(output: &str) -> String {
    let mut result = output.to_string();

    for token in GPT_OSS_TOKENS {
        result = result.replace(token, "");
    }

    result = remove_to_targets(&result);

    for pattern in CHANNEL_PATTERNS {
        result = result.replace(pattern, "");
    }

    // Channel names sitting alone on a line.
    for name in CHANNEL_NAMES {
        let line_pattern = format!("\n{}\n", name);
        while let Some(pos) = result.find(&line_pattern) {
            result.replace_range(pos + 1..pos + 1 + name.len() + 1, "");
        }
        let leading = format!("{}\n", name);
        if result.starts_with(&leading) {
            result.replace_range(..leading.len(), "");
        }
    }

    result.trim().to_string()
}

/// Drop `to=<word>` routing directives, e.g. `to=assistant`.
fn remove_to_targets(text: &str) -> String {
    let mut result = text.to_string();
    let mut search_from = 0;
    while let Some(found) = result[search_from..].find("to=") {
        let pos = search_from + found;
        let mut end = pos + 3;
        for c in result[end..].chars() {
            if c.is_ascii_alphanumeric() || c == '_' {
                end += c.len_utf8();
            } else {
                break;
            }
        }
        result.replace_range(pos..end, "");
        search_from = pos;
    }
    result
}

/// Full gpt-oss post-processing: prefer the explicit `final` channel when
/// its marker is present, otherwise scrub the whole output.
pub fn postprocess_gpt_oss(output: &str) -> String {
    match extract_final_channel(output) {
        Some(segment) => segment,
        None => clean_gpt_oss_output(output),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_at_first_stop() {
        assert_eq!(truncate_at_stop("Hello<|im_end|>junk"), "Hello");
        assert_eq!(truncate_at_stop("Hi<|eot_id|>"), "Hi");
        assert_eq!(truncate_at_stop("clean output"), "clean output");
    }

    #[test]
    fn stop_priority_is_list_order() {
        // "</s>" appears earlier in the text, but "<|im_end|>" wins by rank.
        let text = "a</s>b<|im_end|>c";
        let (pos, stop) = find_stop(text).unwrap();
        assert_eq!(stop, "<|im_end|>");
        assert_eq!(pos, 6);
    }

    #[test]
    fn strips_control_tokens_and_trims() {
        assert_eq!(strip_control_tokens("  <|end|>hello</s>\n"), "hello");
    }

    #[test]
    fn extracts_last_final_channel() {
        let raw = "<|channel|>analysis<|message|>thinking...<|end|>\
                   <|channel|>final<|message|>The answer is 4.<|end|>";
        assert_eq!(extract_final_channel(raw).unwrap(), "The answer is 4.");
    }

    #[test]
    fn extract_without_end_runs_to_eof() {
        let raw = "<|channel|>final<|message|>open ended";
        assert_eq!(extract_final_channel(raw).unwrap(), "open ended");
    }

    #[test]
    fn extract_without_marker_is_none() {
        assert!(extract_final_channel("plain text").is_none());
    }

    #[test]
    fn cleans_to_targets() {
        assert_eq!(remove_to_targets("hi to=assistant there"), "hi  there");
        assert_eq!(remove_to_targets("to=user_1!"), "!");
    }

    #[test]
    fn cleans_channel_noise() {
        let raw = "assistantfinal:Hello there<|end|>";
        assert_eq!(clean_gpt_oss_output(raw), "Hello there");
    }

    #[test]
    fn cleans_leading_channel_line() {
        let raw = "final\nThe result.";
        assert_eq!(clean_gpt_oss_output(raw), "The result.");
    }

    #[test]
    fn postprocess_prefers_final_channel() {
        let raw = "<|channel|>analysis<|message|>noise<|end|>\
                   <|channel|>final<|message|>Answer.<|end|>";
        assert_eq!(postprocess_gpt_oss(raw), "Answer.");
        assert_eq!(postprocess_gpt_oss("analysis:noise final:Answer."), "noise Answer.");
    }
}
