use handlebars::{no_escape, Context, Handlebars, Helper, Output, RenderContext};
use serde::Serialize;
use thiserror::Error;

pub const TEST_OUTLINE_TEMPLATE: &str = "test_outline";
pub const ANALYSIS_REPORT_TEMPLATE: &str = "analysis_report";

const TEST_OUTLINE: &str = r#"TEST OUTLINE
Generated: {{generated}}
Coverage: {{percent coverage.coverage_percentage}} ({{coverage.covered_requirements}}/{{coverage.total_requirements}} requirements)
{{#each test_cases}}

{{id}}: {{name}}
  Requirement: {{requirement_id}}
  Priority: {{priority}} | Category: {{category}}
  Description: {{description}}
{{#if preconditions}}
  Preconditions:
{{#each preconditions}}
    - {{this}}
{{/each}}
{{/if}}
  Steps:
{{#each steps}}
    {{step_number}}. {{action}}
       Expected: {{expected_result}}
{{/each}}
{{/each}}
{{#if validation_errors}}

Validation errors:
{{#each validation_errors}}
  - {{this}}
{{/each}}
{{/if}}
"#;

const ANALYSIS_REPORT: &str = r#"# Analysis Report: {{project_name}}

- Run: `{{run_id}}`
- Generated: {{generated}}
- Status: **{{status}}** ({{stages_completed}}/{{total_stages}} stages succeeded)
- Generation method: {{generation_method}}

## Features ({{len features}})

| ID | Category | Confidence | Description |
|----|----------|------------|-------------|
{{#each features}}
| {{id}} | {{category}} | {{ratio confidence}} | {{description}} |
{{/each}}

## Requirements

{{#each user_requirements}}
- **{{id}}** {{text}}
{{/each}}
{{#each software_requirements}}
- **{{id}}** ({{join derived_from}}) {{text}}
{{/each}}

## Risk Register ({{len risks}} {{pluralize (len risks) "risk" "risks"}})

| ID | Hazard | Severity | Probability | Level |
|----|--------|----------|-------------|-------|
{{#each risks}}
| {{id}} | {{hazard}} | {{severity}} | {{probability}} | {{uppercase risk_level}} |
{{/each}}

## Traceability

- Rows: {{traceability.total_rows}}, gaps: {{traceability.gap_rows}}
- Code coverage: {{percent traceability.code_coverage_percentage}}
- Test coverage: {{percent test_coverage}}
{{#if errors}}

## Pipeline Issues

{{#each errors}}
- [{{stage}}] {{message}}
{{/each}}
{{/if}}
"#;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("invalid template: {0}")]
    Template(#[from] handlebars::TemplateError),

    #[error("failed to render template: {0}")]
    Render(#[from] handlebars::RenderError),
}

/// Handlebars registry preloaded with the built-in text and markdown templates.
pub struct TemplateEngine {
    handlebars: Handlebars<'static>,
}

impl TemplateEngine {
    pub fn new() -> Result<Self, ReportError> {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(false);
        handlebars.register_escape_fn(no_escape);
        Self::register_helpers(&mut handlebars);

        handlebars.register_template_string(TEST_OUTLINE_TEMPLATE, TEST_OUTLINE)?;
        handlebars.register_template_string(ANALYSIS_REPORT_TEMPLATE, ANALYSIS_REPORT)?;

        Ok(Self { handlebars })
    }

    fn register_helpers(handlebars: &mut Handlebars) {
        handlebars.register_helper(
            "uppercase",
            Box::new(|h: &Helper, _: &Handlebars, _: &Context, _: &mut RenderContext, out: &mut dyn Output| {
                let text = h.param(0).and_then(|v| v.value().as_str()).unwrap_or("");
                out.write(&text.to_uppercase())?;
                Ok(())
            }),
        );

        handlebars.register_helper(
            "pluralize",
            Box::new(|h: &Helper, _: &Handlebars, _: &Context, _: &mut RenderContext, out: &mut dyn Output| {
                let count = h.param(0).and_then(|v| v.value().as_u64()).unwrap_or(0);
                let singular = h.param(1).and_then(|v| v.value().as_str()).unwrap_or("");
                let plural = h
                    .param(2)
                    .and_then(|v| v.value().as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{}s", singular));
                out.write(if count == 1 { singular } else { plural.as_str() })?;
                Ok(())
            }),
        );

        handlebars.register_helper(
            "percent",
            Box::new(|h: &Helper, _: &Handlebars, _: &Context, _: &mut RenderContext, out: &mut dyn Output| {
                let value = h.param(0).and_then(|v| v.value().as_f64()).unwrap_or(0.0);
                out.write(&format!("{:.1}%", value))?;
                Ok(())
            }),
        );

        // 0.873 -> "87.3%"
        handlebars.register_helper(
            "ratio",
            Box::new(|h: &Helper, _: &Handlebars, _: &Context, _: &mut RenderContext, out: &mut dyn Output| {
                let value = h.param(0).and_then(|v| v.value().as_f64()).unwrap_or(0.0);
                out.write(&format!("{:.1}%", value * 100.0))?;
                Ok(())
            }),
        );

        handlebars.register_helper(
            "join",
            Box::new(|h: &Helper, _: &Handlebars, _: &Context, _: &mut RenderContext, out: &mut dyn Output| {
                let joined = h
                    .param(0)
                    .and_then(|v| v.value().as_array())
                    .map(|items| {
                        items
                            .iter()
                            .map(|item| match item.as_str() {
                                Some(text) => text.to_string(),
                                None => item.to_string(),
                            })
                            .collect::<Vec<_>>()
                            .join(", ")
                    })
                    .unwrap_or_default();
                out.write(&joined)?;
                Ok(())
            }),
        );
    }

    pub fn template_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlebars.get_templates().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn render<T: Serialize>(&self, template_name: &str, data: &T) -> Result<String, ReportError> {
        Ok(self.handlebars.render(template_name, data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_built_in_templates_registered() {
        let engine = TemplateEngine::new().unwrap();
        assert_eq!(engine.template_names(), vec![ANALYSIS_REPORT_TEMPLATE, TEST_OUTLINE_TEMPLATE]);
    }

    #[test]
    fn test_helpers() {
        let mut engine = TemplateEngine::new().unwrap();
        engine
            .handlebars
            .register_template_string("helpers", "{{ratio a}} {{percent b}} {{join ids}} {{pluralize n \"risk\"}} {{uppercase s}}")
            .unwrap();
        let out = engine
            .render(
                "helpers",
                &json!({"a": 0.5, "b": 87.26, "ids": ["SR_0001", "SR_0002"], "n": 2, "s": "low"}),
            )
            .unwrap();
        assert_eq!(out, "50.0% 87.3% SR_0001, SR_0002 risks LOW");
    }

    #[test]
    fn test_unknown_template_is_an_error() {
        let engine = TemplateEngine::new().unwrap();
        assert!(engine.render("missing", &json!({})).is_err());
    }
}
