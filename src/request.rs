//! Request decoding and validation.
//!
//! Bodies are decoded from raw JSON so that every problem can be reported
//! against the field that caused it, in one pass, before any side effect.
//!
//! | Field | Rule |
//! |-------|------|
//! | `question` | required string, at least 3 characters |
//! | `topK` | optional integer in `[1, 20]` |
//! | `course_id`, `module_id` | optional strings |
//! | `conversationId` | optional string, at least 4 characters (stream only) |
//! | `persona` | optional `instructor` or `coach` (spoken only) |

use serde_json::{Map, Value};

use crate::config::MAX_TOP_K;
use crate::error::ValidationErrors;
use crate::filter::Filters;
use crate::prompt::Persona;

const MIN_QUESTION_CHARS: usize = 3;
const MIN_CONVERSATION_ID_CHARS: usize = 4;

/// The retrieval part shared by every endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub question: String,
    pub top_k: usize,
    pub filters: Filters,
}

/// Body of `POST /api/trainer/respond`.
#[derive(Debug, Clone, PartialEq)]
pub struct SpokenRequest {
    pub query: QueryRequest,
    pub persona: Persona,
}

/// Body of `POST /api/trainer/respond/stream`.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    /// Caller-supplied id; `None` means a fresh conversation.
    pub conversation_id: Option<String>,
    pub query: QueryRequest,
}

/// Decode a `POST /api/rag/answer` body.
///
/// `default_top_k` applies when `topK` is absent or `null`.
pub fn parse_query(body: &Value, default_top_k: usize) -> Result<QueryRequest, ValidationErrors> {
    let obj = as_object(body)?;
    let mut errs = ValidationErrors::default();
    let query = query_fields(obj, default_top_k, &mut errs);
    finish(errs, query)
}

/// Decode a `POST /api/trainer/respond` body. An absent `persona` means
/// [`Persona::Instructor`].
pub fn parse_spoken(body: &Value, default_top_k: usize) -> Result<SpokenRequest, ValidationErrors> {
    let obj = as_object(body)?;
    let mut errs = ValidationErrors::default();
    let query = query_fields(obj, default_top_k, &mut errs);

    let persona = match optional_string(obj, "persona", &mut errs) {
        Some(raw) => Persona::parse(&raw).unwrap_or_else(|| {
            errs.add("persona", "must be one of: instructor, coach");
            Persona::default()
        }),
        None => Persona::default(),
    };

    finish(errs, SpokenRequest { query, persona })
}

/// Decode a `POST /api/trainer/respond/stream` body, including the optional
/// `conversationId`.
pub fn parse_stream(body: &Value, default_top_k: usize) -> Result<StreamRequest, ValidationErrors> {
    let obj = as_object(body)?;
    let mut errs = ValidationErrors::default();
    let query = query_fields(obj, default_top_k, &mut errs);

    let conversation_id = optional_string(obj, "conversationId", &mut errs);
    if let Some(id) = &conversation_id {
        if id.chars().count() < MIN_CONVERSATION_ID_CHARS {
            errs.add(
                "conversationId",
                format!("must be at least {} characters", MIN_CONVERSATION_ID_CHARS),
            );
        }
    }

    finish(
        errs,
        StreamRequest {
            conversation_id,
            query,
        },
    )
}

fn finish<T>(errs: ValidationErrors, value: T) -> Result<T, ValidationErrors> {
    if errs.is_empty() {
        Ok(value)
    } else {
        Err(errs)
    }
}

fn as_object(body: &Value) -> Result<&Map<String, Value>, ValidationErrors> {
    body.as_object().ok_or_else(|| {
        let mut errs = ValidationErrors::default();
        errs.add("body", "expected a JSON object");
        errs
    })
}

fn query_fields(
    obj: &Map<String, Value>,
    default_top_k: usize,
    errs: &mut ValidationErrors,
) -> QueryRequest {
    let question = match obj.get("question") {
        Some(Value::String(q)) => {
            if q.chars().count() < MIN_QUESTION_CHARS {
                errs.add(
                    "question",
                    format!("must be at least {} characters", MIN_QUESTION_CHARS),
                );
            }
            q.clone()
        }
        None | Some(Value::Null) => {
            errs.add("question", "is required");
            String::new()
        }
        Some(_) => {
            errs.add("question", "expected a string");
            String::new()
        }
    };

    let top_k = match obj.get("topK") {
        None | Some(Value::Null) => default_top_k,
        Some(v) => match integral(v) {
            Some(k) if (1..=MAX_TOP_K as i64).contains(&k) => k as usize,
            Some(_) => {
                errs.add("topK", format!("must be between 1 and {}", MAX_TOP_K));
                default_top_k
            }
            None => {
                errs.add("topK", "expected an integer");
                default_top_k
            }
        },
    };

    let filters = Filters {
        course_id: optional_string(obj, "course_id", errs),
        module_id: optional_string(obj, "module_id", errs),
    };

    QueryRequest {
        question,
        top_k,
        filters,
    }
}

/// A JSON number with no fractional part, so `8` and `8.0` both count.
fn integral(v: &Value) -> Option<i64> {
    if let Some(i) = v.as_i64() {
        return Some(i);
    }
    if v.is_u64() {
        return Some(i64::MAX);
    }
    v.as_f64()
        .filter(|f| f.is_finite() && f.fract() == 0.0)
        .map(|f| f as i64)
}

fn optional_string(
    obj: &Map<String, Value>,
    field: &str,
    errs: &mut ValidationErrors,
) -> Option<String> {
    match obj.get(field) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            errs.add(field, "expected a string");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_applied() {
        let req = parse_query(&json!({ "question": "What is onboarding?" }), 8).unwrap();
        assert_eq!(req.top_k, 8);
        assert_eq!(req.filters, Filters::default());
    }

    #[test]
    fn test_short_question_rejected() {
        let errs = parse_query(&json!({ "question": "hi" }), 8).unwrap_err();
        assert_eq!(errs.fields().collect::<Vec<_>>(), vec!["question"]);
    }

    #[test]
    fn test_missing_question_rejected() {
        let errs = parse_query(&json!({}), 8).unwrap_err();
        assert!(errs.0["question"][0].contains("required"));
    }

    #[test]
    fn test_top_k_bounds() {
        assert!(parse_query(&json!({ "question": "abc", "topK": 0 }), 8).is_err());
        assert!(parse_query(&json!({ "question": "abc", "topK": 21 }), 8).is_err());
        assert!(parse_query(&json!({ "question": "abc", "topK": -3 }), 8).is_err());
        assert!(parse_query(&json!({ "question": "abc", "topK": 2.5 }), 8).is_err());
        assert_eq!(
            parse_query(&json!({ "question": "abc", "topK": 20 }), 8)
                .unwrap()
                .top_k,
            20
        );
    }

    #[test]
    fn test_top_k_accepts_integral_float() {
        let req = parse_query(&json!({ "question": "abc", "topK": 8.0 }), 5).unwrap();
        assert_eq!(req.top_k, 8);

        let errs = parse_query(&json!({ "question": "abc", "topK": 21.0 }), 5).unwrap_err();
        assert!(errs.0["topK"][0].contains("between"));
        let errs = parse_query(&json!({ "question": "abc", "topK": 2.5 }), 5).unwrap_err();
        assert!(errs.0["topK"][0].contains("integer"));
    }

    #[test]
    fn test_all_field_errors_reported_together() {
        let errs = parse_stream(
            &json!({ "question": 5, "topK": "x", "course_id": 1, "conversationId": "ab" }),
            8,
        )
        .unwrap_err();
        let fields: Vec<&str> = errs.fields().collect();
        assert_eq!(fields, vec!["conversationId", "course_id", "question", "topK"]);
    }

    #[test]
    fn test_stream_request_keeps_conversation_id() {
        let req = parse_stream(
            &json!({ "conversationId": "conv-1", "question": "abc", "module_id": "m1" }),
            8,
        )
        .unwrap();
        assert_eq!(req.conversation_id.as_deref(), Some("conv-1"));
        assert_eq!(req.query.filters.module_id.as_deref(), Some("m1"));
    }

    #[test]
    fn test_persona() {
        let req = parse_spoken(&json!({ "question": "abc", "persona": "coach" }), 8).unwrap();
        assert_eq!(req.persona, Persona::Coach);

        let req = parse_spoken(&json!({ "question": "abc" }), 8).unwrap();
        assert_eq!(req.persona, Persona::Instructor);

        let errs = parse_spoken(&json!({ "question": "abc", "persona": "pirate" }), 8).unwrap_err();
        assert!(errs.0.contains_key("persona"));
    }

    #[test]
    fn test_non_object_body() {
        let errs = parse_query(&json!(["question"]), 8).unwrap_err();
        assert!(errs.0.contains_key("body"));
    }
}
