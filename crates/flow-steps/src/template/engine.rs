//! Template engine implementation using minijinja.

use minijinja::{Environment, Error, ErrorKind, Value};

use crate::error::StepError;

/// Template engine with Jinja2-compatible syntax.
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl TemplateEngine {
    /// Create a new template engine with custom filters.
    pub fn new() -> Self {
        let mut env = Environment::new();

        env.add_filter("int", filter_int);
        env.add_filter("float", filter_float);
        env.add_filter("tojson", filter_tojson);
        env.add_filter("fromjson", filter_fromjson);
        env.add_filter("split", filter_split);

        Self { env }
    }

    /// Render a template string with the given context.
    pub fn render(&self, template: &str, context: &serde_json::Value) -> Result<String, StepError> {
        self.env
            .render_str(template, Value::from_serialize(context))
            .map_err(|e| StepError::Template(e.to_string()))
    }

    /// Check if a string contains template syntax.
    pub fn is_template(s: &str) -> bool {
        s.contains("{{") || s.contains("{%")
    }

    /// Render a value that might contain templates.
    ///
    /// Strings with template syntax are rendered and parsed as JSON when
    /// possible; objects and arrays are rendered recursively.
    pub fn render_value(
        &self,
        value: &serde_json::Value,
        context: &serde_json::Value,
    ) -> Result<serde_json::Value, StepError> {
        match value {
            serde_json::Value::String(s) if Self::is_template(s) => {
                let rendered = self.render(s, context)?;
                Ok(serde_json::from_str(&rendered).unwrap_or(serde_json::Value::String(rendered)))
            }
            serde_json::Value::Object(obj) => {
                let mut result = serde_json::Map::new();
                for (k, v) in obj {
                    result.insert(k.clone(), self.render_value(v, context)?);
                }
                Ok(serde_json::Value::Object(result))
            }
            serde_json::Value::Array(arr) => {
                let result: Result<Vec<_>, _> =
                    arr.iter().map(|v| self.render_value(v, context)).collect();
                Ok(serde_json::Value::Array(result?))
            }
            _ => Ok(value.clone()),
        }
    }

    /// Evaluate a boolean expression such as `event.type == 'Published'`.
    ///
    /// Bare expressions are tested with Jinja truthiness. Expressions already
    /// wrapped in `{{ }}` are rendered and the output is compared against the
    /// usual truthy spellings.
    pub fn evaluate_condition(
        &self,
        condition: &str,
        context: &serde_json::Value,
    ) -> Result<bool, StepError> {
        if Self::is_template(condition) {
            let rendered = self.render(condition, context)?;
            let trimmed = rendered.trim().to_lowercase();
            return Ok(matches!(trimmed.as_str(), "true" | "1" | "yes"));
        }

        let template = format!("{{% if ({}) %}}true{{% else %}}false{{% endif %}}", condition);
        Ok(self.render(&template, context)? == "true")
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TemplateEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateEngine").finish_non_exhaustive()
    }
}

// Custom filters

fn filter_int(value: Value) -> Result<Value, Error> {
    let s = value.to_string();
    if let Ok(n) = s.trim().parse::<i64>() {
        return Ok(Value::from(n));
    }
    if let Ok(f) = s.trim().parse::<f64>() {
        return Ok(Value::from(f as i64));
    }
    Err(Error::new(
        ErrorKind::InvalidOperation,
        format!("cannot convert '{}' to int", s),
    ))
}

fn filter_float(value: Value) -> Result<Value, Error> {
    let s = value.to_string();
    s.trim().parse::<f64>().map(Value::from).map_err(|_| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("cannot convert '{}' to float", s),
        )
    })
}

fn filter_tojson(value: Value) -> Result<String, Error> {
    serde_json::to_string(&value).map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))
}

fn filter_fromjson(value: Value) -> Result<Value, Error> {
    let s = value.to_string();
    let json: serde_json::Value = serde_json::from_str(&s)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))?;
    Ok(Value::from_serialize(&json))
}

fn filter_split(value: Value, sep: String) -> Vec<String> {
    value.to_string().split(&sep).map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_simple_template() {
        let engine = TemplateEngine::new();
        let ctx = json!({"name": "World"});
        let result = engine.render("Hello {{ name }}!", &ctx).unwrap();
        assert_eq!(result, "Hello World!");
    }

    #[test]
    fn test_filter_int() {
        let engine = TemplateEngine::new();
        let ctx = json!({"value": "42"});
        assert_eq!(engine.render("{{ value | int }}", &ctx).unwrap(), "42");
        assert!(engine.render("{{ 'abc' | int }}", &ctx).is_err());
    }

    #[test]
    fn test_filter_tojson_fromjson() {
        let engine = TemplateEngine::new();
        let ctx = json!({"data": {"a": 1}, "raw": "[1,2]"});
        assert_eq!(engine.render("{{ data | tojson }}", &ctx).unwrap(), r#"{"a":1}"#);
        assert_eq!(engine.render("{{ (raw | fromjson)[1] }}", &ctx).unwrap(), "2");
    }

    #[test]
    fn test_is_template() {
        assert!(TemplateEngine::is_template("{{ x }}"));
        assert!(TemplateEngine::is_template("{% if x %}y{% endif %}"));
        assert!(!TemplateEngine::is_template("plain"));
    }

    #[test]
    fn test_render_value() {
        let engine = TemplateEngine::new();
        let ctx = json!({"id": 7, "schema": "blog"});
        let value = json!({
            "content": "{{ id }}",
            "path": "/api/{{ schema }}",
            "tags": ["{{ schema }}", "static"],
            "count": 3
        });

        let rendered = engine.render_value(&value, &ctx).unwrap();
        assert_eq!(rendered["content"], json!(7));
        assert_eq!(rendered["path"], json!("/api/blog"));
        assert_eq!(rendered["tags"], json!(["blog", "static"]));
        assert_eq!(rendered["count"], json!(3));
    }

    #[test]
    fn test_evaluate_expression() {
        let engine = TemplateEngine::new();
        let ctx = json!({"status": "success", "count": 5, "event": {"type": "Published"}});

        assert!(engine.evaluate_condition("status == 'success'", &ctx).unwrap());
        assert!(!engine.evaluate_condition("status == 'failed'", &ctx).unwrap());
        assert!(engine.evaluate_condition("count > 3", &ctx).unwrap());
        assert!(engine.evaluate_condition("event.type == 'Published'", &ctx).unwrap());
        assert!(!engine.evaluate_condition("missing", &ctx).unwrap());
    }

    #[test]
    fn test_evaluate_wrapped_condition() {
        let engine = TemplateEngine::new();
        let ctx = json!({"count": 5});
        assert!(engine.evaluate_condition("{{ count > 3 }}", &ctx).unwrap());
        assert!(!engine.evaluate_condition("{{ count > 10 }}", &ctx).unwrap());
    }

    #[test]
    fn test_evaluate_invalid_expression() {
        let engine = TemplateEngine::new();
        let result = engine.evaluate_condition("count >", &json!({}));
        assert!(matches!(result, Err(StepError::Template(_))));
    }
}
