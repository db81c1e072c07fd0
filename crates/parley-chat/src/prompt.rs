use chrono::{DateTime, Utc};

use parley_types::models::{Message, MessagePart, Role, Settings};

use crate::model::PromptMessage;

const BASE_SYSTEM_PROMPT: &str = "You are a helpful assistant. Answer clearly and use Markdown where it helps.";

pub fn system_prompt(settings: &Settings, now: DateTime<Utc>) -> String {
    let mut prompt = format!("{BASE_SYSTEM_PROMPT}\nThe current date is {}.", now.format("%Y-%m-%d"));

    if let Some(nickname) = settings.nickname.as_deref().filter(|n| !n.trim().is_empty()) {
        prompt.push_str(&format!("\nThe user prefers to be called {}.", nickname.trim()));
    }
    if let Some(instructions) = settings.custom_instructions.as_deref().filter(|i| !i.trim().is_empty()) {
        prompt.push_str("\n\nFollow these instructions from the user:\n");
        prompt.push_str(instructions.trim());
    }
    prompt
}

/// Flatten stored messages into the text-only form the model API takes.
/// System messages are dropped: the system prompt is rebuilt per request.
pub fn prompt_messages(history: &[Message]) -> Vec<PromptMessage> {
    history
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| PromptMessage {
            role: m.role,
            content: render_parts(&m.parts),
        })
        .collect()
}

fn render_parts(parts: &[MessagePart]) -> String {
    parts
        .iter()
        .map(|part| match part {
            MessagePart::Text { text } => text.clone(),
            MessagePart::File { url, media_type, filename } => {
                let name = filename.as_deref().unwrap_or("file");
                format!("[Attached {name} ({media_type}): {url}]")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}
