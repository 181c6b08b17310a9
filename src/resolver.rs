//! Step content resolver
//!
//! Maps a step name to the rule that extracts displayable content from its
//! payload. Narrative rules yield text; the render rule yields a structured
//! object that replaces the business buffer; the recommendation rule yields
//! suggestions merged into the buffer after the fact.

use std::collections::HashMap;

use serde_json::{Map, Value};
use tracing::warn;

use crate::config::{RENDER_STEP, SUMMARY_STEP};
use crate::engine::StepEvent;
use crate::error::{Result, StreamError};

/// Extraction rule of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepRule {
    /// `db_info` -> table count and names
    SchemaInspected,
    /// `table_relationship` -> JSON text
    RelationshipsComputed,
    /// `generated_sql` -> SQL text
    SqlGenerated,
    /// `execution_result.success` -> success / failure line
    SqlExecuted,
    /// `report_summary` -> final narrative, always forwarded
    Summary,
    /// `render_data` -> structured payload, always forwarded
    Render,
    /// `recommended_questions` -> suggestions merged into the business buffer
    Recommendation,
}

impl StepRule {
    /// Terminal rules are never wrapped in a section and bypass the
    /// show-sections gate.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Summary | Self::Render)
    }
}

/// What a step contributes to the client stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StepContent {
    /// Nothing to show.
    Nothing,
    /// Narrative text; `always_forwarded` bypasses the show-sections gate.
    Narrative {
        /// Text to send
        text: String,
        /// Sent even when sections are hidden
        always_forwarded: bool,
    },
    /// Structured payload replacing the business buffer.
    Business(Value),
    /// Suggestions to merge into the business buffer.
    Enrichment(Vec<Value>),
}

/// Line shown when the SQL executor succeeded.
pub const SQL_EXECUTED_OK: &str = "SQL executed successfully";

/// Line shown when the SQL executor failed.
pub const SQL_EXECUTED_FAILED: &str = "SQL execution failed";

/// Step name -> extraction rule table.
#[derive(Debug, Clone)]
pub struct StepResolver {
    rules: HashMap<String, StepRule>,
}

impl Default for StepResolver {
    fn default() -> Self {
        Self::empty()
            .with_rule("schema_inspector", StepRule::SchemaInspected)
            .with_rule("table_relationship", StepRule::RelationshipsComputed)
            .with_rule("sql_generator", StepRule::SqlGenerated)
            .with_rule("sql_executor", StepRule::SqlExecuted)
            .with_rule(SUMMARY_STEP, StepRule::Summary)
            .with_rule(RENDER_STEP, StepRule::Render)
            .with_rule("question_recommender", StepRule::Recommendation)
    }
}

impl StepResolver {
    /// Resolver with no rules; every step resolves to `Nothing`.
    pub fn empty() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    /// Bind `step` to `rule`, replacing any previous binding.
    pub fn with_rule(mut self, step: impl Into<String>, rule: StepRule) -> Self {
        self.rules.insert(step.into(), rule);
        self
    }

    /// Rule bound to `step`.
    pub fn rule_for(&self, step: &str) -> Option<StepRule> {
        self.rules.get(step).copied()
    }

    /// Whether `step` is bound to a terminal rule. Unbound steps are not.
    pub fn is_terminal(&self, step: &str) -> bool {
        self.rule_for(step).is_some_and(|rule| rule.is_terminal())
    }

    /// Extract the content of one step.
    ///
    /// An empty payload contributes nothing. A payload missing a field its
    /// rule needs is `MalformedStepPayload`.
    pub fn resolve(&self, event: &StepEvent) -> Result<StepContent> {
        let Some(rule) = self.rule_for(&event.name) else {
            return Ok(StepContent::Nothing);
        };
        if event.payload.is_empty() {
            return Ok(StepContent::Nothing);
        }

        let step = event.name.as_str();
        let payload = &event.payload;
        let narrative = |text: String| StepContent::Narrative {
            text,
            always_forwarded: rule.is_terminal(),
        };

        let content = match rule {
            StepRule::SchemaInspected => {
                narrative(format_schema_summary(step, field(step, payload, "db_info")?)?)
            }
            StepRule::RelationshipsComputed => {
                narrative(serde_json::to_string(field(step, payload, "table_relationship")?)?)
            }
            StepRule::SqlGenerated => narrative(string_field(step, payload, "generated_sql")?),
            StepRule::SqlExecuted => {
                let success = field(step, payload, "execution_result")?
                    .get("success")
                    .and_then(Value::as_bool)
                    .ok_or_else(|| StreamError::malformed(step, "execution_result.success"))?;
                let line = if success { SQL_EXECUTED_OK } else { SQL_EXECUTED_FAILED };
                narrative(line.to_string())
            }
            StepRule::Summary => narrative(string_field(step, payload, "report_summary")?),
            StepRule::Render => match payload.get("render_data") {
                None | Some(Value::Null) => StepContent::Business(Value::Object(Map::new())),
                Some(data) => StepContent::Business(data.clone()),
            },
            StepRule::Recommendation => match payload.get("recommended_questions") {
                Some(Value::Array(items)) if !items.is_empty() => {
                    StepContent::Enrichment(items.clone())
                }
                other => {
                    warn!(step, recommendations = ?other, "recommendations empty or not a list, ignoring");
                    StepContent::Nothing
                }
            },
        };
        Ok(content)
    }
}

fn field<'a>(step: &str, payload: &'a Map<String, Value>, name: &str) -> Result<&'a Value> {
    payload
        .get(name)
        .ok_or_else(|| StreamError::malformed(step, name))
}

fn string_field(step: &str, payload: &Map<String, Value>, name: &str) -> Result<String> {
    field(step, payload, name)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| StreamError::malformed(step, name))
}

/// `"Retrieved N tables: a(comment), b."`
fn format_schema_summary(step: &str, db_info: &Value) -> Result<String> {
    let tables = match db_info {
        Value::Null => return Ok("Retrieved 0 tables.".to_string()),
        Value::Object(tables) if tables.is_empty() => {
            return Ok("Retrieved 0 tables.".to_string());
        }
        Value::Object(tables) => tables,
        _ => return Err(StreamError::malformed(step, "db_info")),
    };

    let names: Vec<String> = tables
        .iter()
        .map(|(name, info)| {
            match info.get("table_comment").and_then(Value::as_str) {
                Some(comment) if !comment.is_empty() => format!("{name}({comment})"),
                _ => name.clone(),
            }
        })
        .collect();
    Ok(format!("Retrieved {} tables: {}.", tables.len(), names.join(", ")))
}

/// Latest structured payload surfaced to the client.
///
/// Replaced wholesale by render steps; enrichment merges into it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BusinessBuffer {
    data: Option<Value>,
}

impl BusinessBuffer {
    /// Empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current payload.
    pub fn get(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    /// Whether no render step has filled the buffer yet.
    pub fn is_empty(&self) -> bool {
        self.data.is_none()
    }

    /// Replace the payload.
    pub fn replace(&mut self, data: Value) {
        self.data = Some(data);
    }

    /// Merge `items` under `key` and return the updated payload.
    ///
    /// Returns `None` (buffer untouched) when the buffer is empty or does not
    /// hold an object.
    pub fn merge(&mut self, key: &str, items: Vec<Value>) -> Option<&Value> {
        let Some(Value::Object(map)) = self.data.as_mut() else {
            return None;
        };
        map.insert(key.to_string(), Value::Array(items));
        self.data.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolve(name: &str, payload: Value) -> Result<StepContent> {
        StepResolver::default().resolve(&StepEvent::new(name, payload))
    }

    fn narrative(text: &str, always_forwarded: bool) -> StepContent {
        StepContent::Narrative {
            text: text.into(),
            always_forwarded,
        }
    }

    #[test]
    fn schema_summary_lists_tables_with_comments() {
        let content = resolve(
            "schema_inspector",
            json!({"db_info": {"orders": {"table_comment": "sales orders"}, "users": {}}}),
        )
        .unwrap();
        assert_eq!(
            content,
            narrative("Retrieved 2 tables: orders(sales orders), users.", false)
        );
    }

    #[test]
    fn schema_summary_keeps_engine_table_order() {
        let content = resolve(
            "schema_inspector",
            json!({"db_info": {"users": {}, "orders": {}, "items": {}}}),
        )
        .unwrap();
        assert_eq!(
            content,
            narrative("Retrieved 3 tables: users, orders, items.", false)
        );
    }

    #[test]
    fn schema_summary_with_no_tables() {
        let content = resolve("schema_inspector", json!({"db_info": {}})).unwrap();
        assert_eq!(content, narrative("Retrieved 0 tables.", false));
    }

    #[test]
    fn relationships_are_rendered_as_json() {
        let content = resolve(
            "table_relationship",
            json!({"table_relationship": [{"from": "orders", "to": "users"}]}),
        )
        .unwrap();
        assert_eq!(content, narrative(r#"[{"from":"orders","to":"users"}]"#, false));
    }

    #[test]
    fn execution_result_maps_to_status_line() {
        let ok = resolve("sql_executor", json!({"execution_result": {"success": true}})).unwrap();
        assert_eq!(ok, narrative(SQL_EXECUTED_OK, false));
        let failed =
            resolve("sql_executor", json!({"execution_result": {"success": false}})).unwrap();
        assert_eq!(failed, narrative(SQL_EXECUTED_FAILED, false));
    }

    #[test]
    fn missing_field_is_malformed() {
        let err = resolve("sql_generator", json!({"sql": "SELECT 1"})).unwrap_err();
        assert_eq!(err, StreamError::malformed("sql_generator", "generated_sql"));

        let err = resolve("sql_executor", json!({"execution_result": {}})).unwrap_err();
        assert_eq!(
            err,
            StreamError::malformed("sql_executor", "execution_result.success")
        );
    }

    #[test]
    fn summary_is_always_forwarded() {
        let content = resolve("summarize", json!({"report_summary": "done"})).unwrap();
        assert_eq!(content, narrative("done", true));
    }

    #[test]
    fn render_yields_object_and_defaults_to_empty() {
        let content = resolve("data_render", json!({"render_data": {"table": [1]}})).unwrap();
        assert_eq!(content, StepContent::Business(json!({"table": [1]})));

        let content = resolve("data_render", json!({"other": 1})).unwrap();
        assert_eq!(content, StepContent::Business(json!({})));
    }

    #[test]
    fn recommendation_yields_enrichment() {
        let content =
            resolve("question_recommender", json!({"recommended_questions": ["q1", "q2"]}))
                .unwrap();
        assert_eq!(content, StepContent::Enrichment(vec![json!("q1"), json!("q2")]));
    }

    #[test]
    fn empty_recommendations_are_ignored() {
        let content =
            resolve("question_recommender", json!({"recommended_questions": []})).unwrap();
        assert_eq!(content, StepContent::Nothing);
        let content =
            resolve("question_recommender", json!({"recommended_questions": "q1"})).unwrap();
        assert_eq!(content, StepContent::Nothing);
    }

    #[test]
    fn unknown_step_and_empty_payload_yield_nothing() {
        assert_eq!(resolve("planner", json!({"x": 1})).unwrap(), StepContent::Nothing);
        assert_eq!(resolve("sql_generator", json!({})).unwrap(), StepContent::Nothing);
    }

    #[test]
    fn custom_rule_binding() {
        let resolver = StepResolver::empty().with_rule("final_answer", StepRule::Summary);
        let content = resolver
            .resolve(&StepEvent::new("final_answer", json!({"report_summary": "ok"})))
            .unwrap();
        assert_eq!(content, narrative("ok", true));
        assert_eq!(resolver.rule_for("summarize"), None);
        assert!(resolver.is_terminal("final_answer"));
        assert!(!resolver.is_terminal("summarize"));
    }

    #[test]
    fn default_terminal_steps() {
        let resolver = StepResolver::default();
        assert!(resolver.is_terminal(SUMMARY_STEP));
        assert!(resolver.is_terminal(RENDER_STEP));
        assert!(!resolver.is_terminal("sql_generator"));
        assert!(!resolver.is_terminal("question_recommender"));
        assert!(!resolver.is_terminal("planner"));
    }

    #[test]
    fn business_buffer_merge_requires_object() {
        let mut buffer = BusinessBuffer::new();
        assert!(buffer.merge("recommendations", vec![json!("q1")]).is_none());
        assert!(buffer.is_empty());

        buffer.replace(json!([1, 2]));
        assert!(buffer.merge("recommendations", vec![json!("q1")]).is_none());

        buffer.replace(json!({"table": []}));
        let merged = buffer.merge("recommendations", vec![json!("q1")]).cloned();
        assert_eq!(merged, Some(json!({"table": [], "recommendations": ["q1"]})));
    }
}
