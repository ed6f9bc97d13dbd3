//! Template expansion for manifest fields.
//!
//! A template is literal text interleaved with `{{ <selector> (| <func>)* }}`
//! pipelines. Selectors address the per-step context: `.Inputs.<name>`,
//! `.Steps.<id>.result`, `.Steps.<id>.outputs.<name>`,
//! `.event.payload.<name>`, and `.env.<VAR>` (workflow environment only; the
//! process environment never leaks in).
//!
//! Expanded values routinely reach a shell, so the function set includes
//! `shell_quote` alongside `json_escape`, `html_escape` and `url_encode`.

use indexmap::IndexMap;
use thiserror::Error;

use crate::codes::ErrorCode;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("unbalanced template delimiters in `{0}`")]
    Unbalanced(String),
    #[error("empty interpolation in `{0}`")]
    EmptyInterpolation(String),
    #[error("unknown selector `{0}`")]
    UnknownSelector(String),
    #[error("undefined reference `{0}`")]
    Undefined(String),
    #[error("unknown template function `{0}`")]
    UnknownFunction(String),
}

impl TemplateError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::TemplateExpansionFailed
    }
}

pub type Result<T> = std::result::Result<T, TemplateError>;

/// Values a step's templates can see.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    pub inputs: IndexMap<String, String>,
    pub steps: IndexMap<String, StepScope>,
    pub event: Option<EventScope>,
    pub env: IndexMap<String, String>,
}

/// Completed-step values visible to later steps.
#[derive(Debug, Clone, Default)]
pub struct StepScope {
    /// `"success"`, `"failure"`, or `"skipped"`.
    pub result: String,
    pub outputs: IndexMap<String, String>,
}

/// The triggering event, present only in subscription-triggered runs.
#[derive(Debug, Clone, Default)]
pub struct EventScope {
    pub event_type: String,
    pub schema_version: Option<String>,
    pub payload: IndexMap<String, String>,
}

impl TemplateContext {
    pub fn with_inputs(inputs: IndexMap<String, String>) -> Self {
        Self {
            inputs,
            ..Self::default()
        }
    }

    /// Record a finished step so later steps can reference it.
    pub fn record_step(&mut self, id: &str, scope: StepScope) {
        self.steps.insert(id.to_string(), scope);
    }
}

/// Expand every `{{ … }}` pipeline in `template` against `ctx`.
pub fn expand(template: &str, ctx: &TemplateContext) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            return Err(TemplateError::Unbalanced(template.to_string()));
        };
        let pipeline = &after[..end];
        out.push_str(&eval_pipeline(pipeline, template, Some(ctx))?.unwrap_or_default());
        rest = &after[end + 2..];
    }
    if rest.contains("}}") {
        return Err(TemplateError::Unbalanced(template.to_string()));
    }
    out.push_str(rest);
    Ok(out)
}

/// Expand a whole templated map, preserving order.
pub fn expand_map(
    map: &IndexMap<String, String>,
    ctx: &TemplateContext,
) -> Result<IndexMap<String, String>> {
    let mut out = IndexMap::with_capacity(map.len());
    for (key, value) in map {
        out.insert(key.clone(), expand(value, ctx)?);
    }
    Ok(out)
}

/// Syntax-only check: balanced delimiters, nonempty pipelines, recognized
/// selector heads and functions. Runs without a context, so the validator
/// can use it at load time.
pub fn check_syntax(template: &str) -> Result<()> {
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            return Err(TemplateError::Unbalanced(template.to_string()));
        };
        eval_pipeline(&after[..end], template, None)?;
        rest = &after[end + 2..];
    }
    if rest.contains("}}") {
        return Err(TemplateError::Unbalanced(template.to_string()));
    }
    Ok(())
}

/// Evaluate one pipeline. With `ctx` None this only checks shape.
/// Returns None for optional-and-absent references (which expand empty).
fn eval_pipeline(
    pipeline: &str,
    template: &str,
    ctx: Option<&TemplateContext>,
) -> Result<Option<String>> {
    let mut parts = pipeline.split('|').map(str::trim);
    let selector = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| TemplateError::EmptyInterpolation(template.to_string()))?;

    let mut value = resolve_selector(selector, ctx)?;
    for func in parts {
        if func.is_empty() {
            return Err(TemplateError::EmptyInterpolation(template.to_string()));
        }
        value = match ctx {
            Some(_) => value.map(|v| apply_function(func, &v)).transpose()?,
            None => {
                check_function(func)?;
                None
            }
        };
    }
    Ok(value)
}

/// Resolve a selector against the context. Optional fields (event payload
/// entries, step outputs, env vars) resolve to None when absent; required
/// references (inputs, step ids) error instead.
fn resolve_selector(selector: &str, ctx: Option<&TemplateContext>) -> Result<Option<String>> {
    let path: Vec<&str> = selector
        .strip_prefix('.')
        .ok_or_else(|| TemplateError::UnknownSelector(selector.to_string()))?
        .split('.')
        .collect();

    match path.as_slice() {
        ["Inputs", name] => {
            let Some(ctx) = ctx else { return Ok(None) };
            ctx.inputs
                .get(*name)
                .cloned()
                .map(Some)
                .ok_or_else(|| TemplateError::Undefined(selector.to_string()))
        }
        ["Steps", id, "result"] => {
            let Some(ctx) = ctx else { return Ok(None) };
            ctx.steps
                .get(*id)
                .map(|s| Some(s.result.clone()))
                .ok_or_else(|| TemplateError::Undefined(selector.to_string()))
        }
        ["Steps", id, "outputs", name] => {
            let Some(ctx) = ctx else { return Ok(None) };
            let scope = ctx
                .steps
                .get(*id)
                .ok_or_else(|| TemplateError::Undefined(selector.to_string()))?;
            Ok(Some(scope.outputs.get(*name).cloned().unwrap_or_default()))
        }
        ["event", "type"] => Ok(ctx.and_then(|c| {
            c.event
                .as_ref()
                .map(|e| e.event_type.clone())
        })),
        ["event", "schema_version"] => Ok(ctx.and_then(|c| {
            c.event
                .as_ref()
                .and_then(|e| e.schema_version.clone())
        })),
        ["event", "payload", name] => Ok(ctx.and_then(|c| {
            c.event
                .as_ref()
                .and_then(|e| e.payload.get(*name).cloned())
        })),
        ["env", var] => Ok(ctx.and_then(|c| c.env.get(*var).cloned())),
        _ => Err(TemplateError::UnknownSelector(selector.to_string())),
    }
}

fn check_function(name: &str) -> Result<()> {
    match name {
        "shell_quote" | "json_escape" | "html_escape" | "url_encode" => Ok(()),
        other => Err(TemplateError::UnknownFunction(other.to_string())),
    }
}

fn apply_function(name: &str, value: &str) -> Result<String> {
    match name {
        "shell_quote" => Ok(shell_quote(value)),
        "json_escape" => Ok(json_escape(value)),
        "html_escape" => Ok(html_escape(value)),
        "url_encode" => Ok(urlencoding::encode(value).into_owned()),
        other => Err(TemplateError::UnknownFunction(other.to_string())),
    }
}

/// Wrap in single quotes, escaping embedded single quotes the POSIX way.
/// The result is always one shell token, whatever the input contains.
pub fn shell_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

/// JSON string-escape without the surrounding quotes.
pub fn json_escape(value: &str) -> String {
    let quoted = serde_json::to_string(value).unwrap_or_default();
    quoted
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(&quoted)
        .to_string()
}

pub fn html_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}
