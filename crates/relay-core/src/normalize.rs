// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Transcript normalization applied to every incoming request before
//! routing.  Normalizing an already-normalized transcript is a no-op.

use relay_model::{Message, MessageContent, Role};

/// Ambient operating instructions injected when the client supplies no
/// system message of its own.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a coding assistant operating on the \
developer's project through the available tools. Prefer reading project state over \
guessing. When a tool is needed, emit exactly one tool call in the format you were \
instructed to use; otherwise answer directly and concisely.";

/// Normalize a transcript:
/// 1. strip control characters that break downstream tokenizers (C0 except
///    newline and tab) from every text message;
/// 2. merge consecutive same-role `user`/`system` text messages;
/// 3. ensure exactly one leading system message, synthesising the ambient
///    instructions when the client sent none.
pub fn normalize(messages: Vec<Message>) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(messages.len() + 1);

    for msg in messages {
        let msg = strip_control_chars(msg);

        // Merge runs of same-role user/system text messages into one.
        let mergeable = matches!(msg.role, Role::User | Role::System)
            && matches!(msg.content, MessageContent::Text(_));
        if mergeable {
            if let Some(prev) = out.last_mut() {
                if prev.role == msg.role {
                    if let (MessageContent::Text(a), MessageContent::Text(b)) =
                        (&prev.content, &msg.content)
                    {
                        let joined = if a.is_empty() {
                            b.clone()
                        } else if b.is_empty() {
                            a.clone()
                        } else {
                            format!("{a}\n\n{b}")
                        };
                        prev.content = MessageContent::Text(joined);
                        continue;
                    }
                }
            }
        }
        out.push(msg);
    }

    match out.first() {
        Some(m) if m.role == Role::System => {}
        _ => out.insert(0, Message::system(DEFAULT_SYSTEM_PROMPT)),
    }

    out
}

fn strip_control_chars(mut msg: Message) -> Message {
    if let MessageContent::Text(t) = &msg.content {
        if t.chars().any(is_stripped_control) {
            let cleaned: String = t.chars().filter(|c| !is_stripped_control(*c)).collect();
            msg.content = MessageContent::Text(cleaned);
        }
    }
    msg
}

fn is_stripped_control(c: char) -> bool {
    c.is_control() && c != '\n' && c != '\t'
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
