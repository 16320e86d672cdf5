//! System message builders: persona, tag protocol and date/time context.

use chrono::{DateTime, Local, Utc};

/// Instructions for the inline tags the output pipeline understands.
const TAG_PROTOCOL: &str = "You may weave these tags into your reply. They are hidden from {{user}} and acted on for real:\n\
- [[ACTION:POKE]] to playfully poke {{user}}.\n\
- [[ACTION:TRANSFER:<whole number>]] to send {{user}} a money gift.\n\
- [[ACTION:ADD_EVENT | <title> | <YYYY-MM-DD>]] to put something on the shared calendar.\n\
- [schedule_message | <YYYY-MM-DD HH:MM> | fixed | <text>] to message {{user}} on your own at a later time.\n\
- [[SEND_EMOJI: <name>]] to send a sticker.\n\
- [[QUOTE: <words from one of {{user}}'s messages>]] to reply to that specific message.\n\
- [[RECALL:<YYYY-MM>]] alone, when you need to remember what happened in an earlier month.\n\
Write the way people text: short lines, one thought each.";

/// Substitutes participant names into a persona template.
pub fn render_persona(template: &str, character: &str, user: &str) -> String {
    template.replace("{{char}}", character).replace("{{user}}", user)
}

/// Persona prompt followed by the tag protocol.
pub fn build_persona_message(template: &str, character: &str, user: &str) -> String {
    format!(
        "{}\n\n{}",
        render_persona(template, character, user),
        render_persona(TAG_PROTOCOL, character, user)
    )
}

/// Format a date and time for inclusion in system prompts
///
/// ```text
/// Current date/time: Wednesday, February 5, 2025, 14:30:15 UTC (2025-02-05T14:30:15Z)
/// Local time: Wednesday, February 5, 2025, 09:30:15 -05:00 (2025-02-05T09:30:15-05:00)
/// ```
pub fn datetime_context_at(now: DateTime<Utc>) -> String {
    let local_now = now.with_timezone(&Local);

    format!(
        "Current date/time: {}, {} UTC ({})\nLocal time: {}, {} ({})",
        now.format("%A, %B %d, %Y"),
        now.format("%H:%M:%S"),
        now.to_rfc3339(),
        local_now.format("%A, %B %d, %Y"),
        local_now.format("%H:%M:%S %:z"),
        local_now.to_rfc3339()
    )
}
