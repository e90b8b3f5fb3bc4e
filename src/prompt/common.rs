// Common text blocks for all prompts
pub const DONT_TELL_ME: &str = r#"
Important instructions for your responses:

1. Do not narrate or describe your actions.
2. Do not summarize or restate the instructions I've given you.
3. Do not preface your response with phrases like "Here's my answer..." or "I will now...".
4. Do not acknowledge or confirm that you understand these instructions.
5. Answer directly, without any meta-commentary.
"#;

pub const JSON_ONLY: &str = r#"
Respond with a single JSON object and nothing else: no Markdown code fences,
no commentary before or after the object.
"#;
