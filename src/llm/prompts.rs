// Prompt and answer-shape definitions for the classification fallback

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const SYSTEM_PROMPT_CLASSIFICATION: &str = r#"
You are a Brazilian fiscal-classification specialist resolving product and
service codes for electronic fiscal documents.

## YOUR MISSION
Given one line-item description (and the code the document declared, which
may be wrong or missing), pick the single best classification code.

## INPUT
- The item description, verbatim from the document. It may be in Portuguese,
  abbreviated, or contain model numbers and packaging noise.
- The declared code, when the document carried one.
- A ranked CANDIDATE LIST of known codes with reference descriptions.

## CRITICAL RULES - READ CAREFULLY

### Choosing a code
✅ DO:
- Prefer a code from the candidate list whenever one plausibly matches.
- Judge by what the goods or service ARE, not by brand names.
- Keep the declared code when the description genuinely supports it.

❌ DO NOT:
- Invent digits or "average" two candidate codes together.
- Choose a code only because it is first in the list.
- Let packaging words ("caixa", "kit", "unidade") drive the decision.

### Answer format
Respond with a single JSON object and nothing else:
{"code": "<8-digit code>", "rationale": "<one short sentence>"}

- "code" must be exactly 8 digits, no dots.
- If no candidate fits and the declared code is unusable, answer with the
  declared code anyway and say so in the rationale.
"#;

/// Wire shape of the model's classification answer.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ClassificationAnswer {
    #[schemars(description = "The resolved classification code: exactly 8 digits, no punctuation")]
    pub code: String,

    #[schemars(description = "One short sentence explaining the choice")]
    pub rationale: String,
}

/// JSON schema for [`ClassificationAnswer`], in the form the completion
/// service accepts as a response constraint.
pub fn classification_answer_schema() -> serde_json::Value {
    let root = schemars::schema_for!(ClassificationAnswer);
    serde_json::to_value(root.schema).unwrap_or_else(|_| serde_json::json!({ "type": "object" }))
}

/// Builds the user prompt for one line item. Candidates are (code,
/// reference description) pairs, best match first.
pub fn classification_user_prompt(
    item_description: &str,
    declared_code: &str,
    candidates: &[(String, String)],
) -> String {
    let mut prompt = format!("ITEM DESCRIPTION:\n{}\n\n", item_description.trim());

    if declared_code.is_empty() {
        prompt.push_str("DECLARED CODE: none\n\n");
    } else {
        prompt.push_str(&format!("DECLARED CODE: {}\n\n", declared_code));
    }

    if candidates.is_empty() {
        prompt.push_str("CANDIDATE LIST: empty (no reference entry resembles this item)\n");
    } else {
        prompt.push_str("CANDIDATE LIST (best match first):\n");
        for (code, description) in candidates {
            prompt.push_str(&format!("- {}: {}\n", code, description));
        }
    }

    prompt.push_str("\nAnswer with the JSON object only.");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_prompt_lists_candidates_in_order() {
        let candidates = vec![
            ("85171231".to_string(), "Smartphones".to_string()),
            ("85044090".to_string(), "Carregadores".to_string()),
        ];
        let prompt = classification_user_prompt("Celular XPhone 128GB", "85171200", &candidates);

        assert!(prompt.contains("Celular XPhone 128GB"));
        assert!(prompt.contains("DECLARED CODE: 85171200"));
        let first = prompt.find("85171231").unwrap();
        let second = prompt.find("85044090").unwrap();
        assert!(first < second);
    }

    #[test]
    fn test_answer_schema_names_both_fields() {
        let schema = classification_answer_schema();
        let text = schema.to_string();
        assert!(text.contains("\"code\""));
        assert!(text.contains("\"rationale\""));
    }

    #[test]
    fn test_answer_round_trip() {
        let answer: ClassificationAnswer =
            serde_json::from_str(r#"{"code":"85171231","rationale":"matches smartphones"}"#)
                .unwrap();
        assert_eq!(answer.code, "85171231");
    }
}
