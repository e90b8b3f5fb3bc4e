use serde::Deserialize;

use super::common::{DONT_TELL_ME, JSON_ONLY};
use crate::entity::EntityType;
use crate::error::{DedupError, Result};
use crate::oracle::{OracleVerdict, VerificationContext};

fn describe(context: &VerificationContext) -> String {
    let mut lines = vec![format!("Name: {}", context.entity.name)];
    for (field, value) in &context.entity.attributes {
        lines.push(format!("{}: {}", field, value));
    }
    lines.push(format!("Relationships in the graph: {}", context.relationship_count));
    if context.related_documents.is_empty() {
        lines.push("Related documents: none".to_string());
    } else {
        lines.push("Related documents:".to_string());
        for title in &context.related_documents {
            lines.push(format!("  - {}", title));
        }
    }
    lines.join("\n")
}

/// Generate a prompt asking whether two knowledge-graph entities are the same
pub fn duplicate_verification_prompt(
    entity_type: EntityType,
    a: &VerificationContext,
    b: &VerificationContext,
) -> String {
    format!(
        r#"
{dont_tell_me}

You are curating a research knowledge graph. Two {entity_type} entities were
flagged as possible duplicates.

ENTITY A:
----------
{a}
----------

ENTITY B:
----------
{b}
----------

TASK: Decide whether A and B refer to the same real-world {entity_type}.
Spelling, casing, abbreviations and plural forms do not make entities
different. Related but distinct concepts (a field and one of its sub-fields,
a person and their institution, two versions of a project) ARE different.

If they are the same, choose the best display name for the merged entity;
it must be exactly one of the two names above.

{json_only}
{{
  "is_duplicate": true or false,
  "explanation": "one or two sentences",
  "canonical_name": "exact name of A or B, or null"
}}
"#,
        dont_tell_me = DONT_TELL_ME,
        entity_type = entity_type,
        a = describe(a),
        b = describe(b),
        json_only = JSON_ONLY,
    )
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    is_duplicate: bool,
    #[serde(default)]
    explanation: String,
    #[serde(default)]
    canonical_name: Option<String>,
}

/// Parse an LLM answer into a verdict.
///
/// Tolerates code fences and chatter around the JSON object.
pub fn parse_verification_response(response: &str) -> Result<OracleVerdict> {
    let start = response.find('{');
    let end = response.rfind('}');
    let json = match (start, end) {
        (Some(start), Some(end)) if start < end => &response[start..=end],
        _ => {
            return Err(DedupError::Oracle(format!(
                "no JSON object in oracle response: {}",
                response.trim()
            )))
        }
    };

    let raw: RawVerdict = serde_json::from_str(json)
        .map_err(|e| DedupError::Oracle(format!("malformed verdict: {}", e)))?;
    let canonical_name_hint = raw
        .canonical_name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty() && !name.eq_ignore_ascii_case("null"));

    Ok(OracleVerdict {
        is_duplicate: raw.is_duplicate,
        explanation: raw.explanation.trim().to_string(),
        canonical_name_hint,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{AttributeField, Entity};

    fn context(id: i64, name: &str) -> VerificationContext {
        VerificationContext {
            entity: Entity::new(id, EntityType::Person, name)
                .with_attribute(AttributeField::Affiliation, "ETH Zurich"),
            relationship_count: 4,
            related_documents: vec!["Sinkhorn Distances".to_string()],
        }
    }

    #[test]
    fn test_prompt_contains_both_contexts() {
        let prompt = duplicate_verification_prompt(
            EntityType::Person,
            &context(1, "Marco Cuturi"),
            &context(2, "M. Cuturi"),
        );
        assert!(prompt.contains("Name: Marco Cuturi"));
        assert!(prompt.contains("Name: M. Cuturi"));
        assert!(prompt.contains("affiliation: ETH Zurich"));
        assert!(prompt.contains("  - Sinkhorn Distances"));
        assert!(prompt.contains("same real-world person"));
    }

    #[test]
    fn test_parse_plain_and_fenced_json() {
        let verdict = parse_verification_response(
            r#"{"is_duplicate": true, "explanation": "Same person.", "canonical_name": "Marco Cuturi"}"#,
        )
        .unwrap();
        assert!(verdict.is_duplicate);
        assert_eq!(verdict.canonical_name_hint.as_deref(), Some("Marco Cuturi"));

        let fenced = "```json\n{\"is_duplicate\": false, \"explanation\": \"Different.\", \"canonical_name\": null}\n```";
        let verdict = parse_verification_response(fenced).unwrap();
        assert!(!verdict.is_duplicate);
        assert_eq!(verdict.canonical_name_hint, None);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_verification_response("yes"),
            Err(DedupError::Oracle(_))
        ));
        assert!(matches!(
            parse_verification_response("{\"explanation\": \"missing flag\"}"),
            Err(DedupError::Oracle(msg)) if msg.starts_with("malformed verdict")
        ));
    }
}
