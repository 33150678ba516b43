//! Chat-template selection and prompt construction.
//!
//! gpt-oss models get a dedicated format: their templates use the harmony
//! control tokens (`<|start|>`, `<|message|>`, `<|channel|>`) and expect a
//! `Reasoning: none` directive in the system message plus an opened `final`
//! channel for the assistant turn. Everything else goes through the model's
//! own template when it has one, falling back to ChatML.

use crate::backend::{ChatMessage, LoadedModel};

/// Which prompt format a model gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    GptOss,
    ChatMl,
}

impl TemplateKind {
    /// Classify a model from its metadata: the `gptoss` architecture string
    /// or harmony tokens in its chat template mark it as gpt-oss.
    pub fn detect(model: &dyn LoadedModel) -> Self {
        if model
            .architecture()
            .is_some_and(|arch| arch == "gptoss")
        {
            return TemplateKind::GptOss;
        }
        if model.chat_template().is_some_and(|template| {
            template.contains("<|start|>") || template.contains("<|message|>")
        }) {
            return TemplateKind::GptOss;
        }
        TemplateKind::ChatMl
    }
}

/// Build the prompt for a message sequence.
pub fn build_prompt(model: &dyn LoadedModel, kind: TemplateKind, messages: &[ChatMessage]) -> String {
    match kind {
        TemplateKind::GptOss => build_gpt_oss_prompt(messages),
        TemplateKind::ChatMl => model
            .apply_chat_template(messages)
            .unwrap_or_else(|| build_chat_ml_prompt(messages)),
    }
}

/// ChatML fallback: `<|im_start|>role\ncontent<|im_end|>` per message, with
/// the assistant turn opened at the end.
pub fn build_chat_ml_prompt(messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    for message in messages {
        prompt.push_str("<|im_start|>");
        prompt.push_str(&message.role);
        prompt.push('\n');
        prompt.push_str(&message.content);
        prompt.push_str("<|im_end|>\n");
    }
    prompt.push_str("<|im_start|>assistant\n");
    prompt
}

/// gpt-oss prompt: `Reasoning: none` disables the analysis channel, and the
/// assistant turn opens directly on the `final` channel. User content is
/// passed through untouched.
pub fn build_gpt_oss_prompt(messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();

    let has_system = messages.iter().any(|m| m.role == "system");
    if !has_system {
        prompt.push_str(
            "<|start|>system<|message|>You are a helpful assistant.\n\nReasoning: none<|end|>",
        );
    }

    for message in messages {
        if message.role == "system" {
            prompt.push_str("<|start|>system<|message|>");
            prompt.push_str(&message.content);
            prompt.push_str("\n\nReasoning: none<|end|>");
        } else {
            prompt.push_str("<|start|>");
            prompt.push_str(&message.role);
            prompt.push_str("<|message|>");
            prompt.push_str(&message.content);
            prompt.push_str("<|end|>");
        }
    }

    prompt.push_str("<|start|>assistant<|channel|>final<|message|>");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::stub::StubBackend;
    use crate::backend::Backend;
    use std::io::Write;
    use std::path::Path;

    fn model_with(backend: StubBackend) -> std::sync::Arc<dyn LoadedModel> {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("model.gguf");
        let mut body = b"GGUF".to_vec();
        body.resize(2048, 0);
        std::fs::File::create(&path).unwrap().write_all(&body).unwrap();
        backend.load_model(Path::new(&path), 0).unwrap()
    }

    #[test]
    fn detects_gpt_oss_by_architecture() {
        let model = model_with(StubBackend::new().with_architecture("gptoss"));
        assert_eq!(TemplateKind::detect(model.as_ref()), TemplateKind::GptOss);
    }

    #[test]
    fn detects_gpt_oss_by_template_tokens() {
        let model = model_with(
            StubBackend::new().with_chat_template("<|start|>{{ role }}<|message|>{{ content }}"),
        );
        assert_eq!(TemplateKind::detect(model.as_ref()), TemplateKind::GptOss);
    }

    #[test]
    fn plain_models_are_chat_ml() {
        let model = model_with(StubBackend::new());
        assert_eq!(TemplateKind::detect(model.as_ref()), TemplateKind::ChatMl);
    }

    #[test]
    fn chat_ml_prompt_shape() {
        let messages = vec![
            ChatMessage::new("system", "You are a bot."),
            ChatMessage::new("user", "Hello"),
        ];
        let prompt = build_chat_ml_prompt(&messages);
        assert_eq!(
            prompt,
            "<|im_start|>system\nYou are a bot.<|im_end|>\n\
             <|im_start|>user\nHello<|im_end|>\n\
             <|im_start|>assistant\n"
        );
    }

    #[test]
    fn gpt_oss_prompt_injects_reasoning_none_into_system() {
        let messages = vec![
            ChatMessage::new("system", "Be terse."),
            ChatMessage::new("user", "Hi"),
        ];
        let prompt = build_gpt_oss_prompt(&messages);
        assert!(prompt.contains("<|start|>system<|message|>Be terse.\n\nReasoning: none<|end|>"));
        assert!(prompt.contains("<|start|>user<|message|>Hi<|end|>"));
        assert!(prompt.ends_with("<|start|>assistant<|channel|>final<|message|>"));
    }

    #[test]
    fn gpt_oss_prompt_adds_default_system_when_absent() {
        let messages = vec![ChatMessage::new("user", "Hi")];
        let prompt = build_gpt_oss_prompt(&messages);
        assert!(prompt.starts_with("<|start|>system<|message|>You are a helpful assistant."));
        assert!(prompt.contains("Reasoning: none"));
    }
}
