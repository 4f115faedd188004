//! Template renderer facade: a sandboxed wrapper around the handlebars
//! engine with the helper set pack templates rely on.
//!
//! The facade owns the limits, not the engine: template size is checked
//! before rendering, output size after, and the render itself runs on a
//! watchdog thread under a wall-clock timeout (an abandoned render cannot
//! hold up an apply). Rendering never touches the filesystem; writing the
//! output is the applier's job. Reserved context keys are stripped from user
//! data before the runtime merges its own.

use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use handlebars::{Handlebars, handlebars_helper};
use heck::{ToKebabCase, ToLowerCamelCase, ToSnakeCase, ToUpperCamelCase};
use serde_json::Value;

use crate::config::TemplateConfig;
use crate::error::GitvanError;

/// Context keys owned by the runtime; user data may not supply them.
const RESERVED_KEYS: [&str; 2] = ["__system", "gitvan"];

handlebars_helper!(camel_case: |s: str| s.to_lower_camel_case());
handlebars_helper!(pascal_case: |s: str| s.to_upper_camel_case());
handlebars_helper!(kebab_case: |s: str| s.to_kebab_case());
handlebars_helper!(snake_case: |s: str| s.to_snake_case());
handlebars_helper!(upper_case: |s: str| s.to_uppercase());
handlebars_helper!(lower_case: |s: str| s.to_lowercase());

handlebars_helper!(capitalize: |s: str| {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
});

handlebars_helper!(js_escape: |s: str| {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '`' => out.push_str("\\`"),
            _ => out.push(c),
        }
    }
    out
});

handlebars_helper!(split: |s: str, sep: str| {
    Value::Array(s.split(sep).map(|p| Value::String(p.to_string())).collect())
});

handlebars_helper!(last: |v: Json| {
    match v {
        Value::Array(items) => items.last().cloned().unwrap_or(Value::Null),
        other => other.clone(),
    }
});

handlebars_helper!(tojson: |v: Json| serde_json::to_string(v).unwrap_or_default());

handlebars_helper!(date: |value: Json, fmt: str| {
    let instant: DateTime<Utc> = match value {
        Value::String(s) if s.as_str() == "now" => Utc::now(),
        Value::String(s) => s.parse().unwrap_or_else(|_| Utc::now()),
        _ => Utc::now(),
    };
    instant.format(fmt).to_string()
});

handlebars_helper!(sum: |items: Json, {attribute: str = ""}| {
    let total: f64 = match items {
        Value::Array(entries) => entries
            .iter()
            .filter_map(|e| {
                let v = if attribute.is_empty() { e } else { e.get(attribute)? };
                v.as_f64()
            })
            .sum(),
        _ => 0.0,
    };
    if total.fract() == 0.0 {
        Value::from(total as i64)
    } else {
        Value::from(total)
    }
});

/// Sandboxed renderer; construction registers the helper set once.
pub struct TemplateRenderer {
    registry: Arc<Handlebars<'static>>,
    config: TemplateConfig,
}

impl TemplateRenderer {
    pub fn new(config: TemplateConfig) -> Self {
        let mut registry = Handlebars::new();
        // Output is source code and config text, not HTML.
        registry.register_escape_fn(handlebars::no_escape);
        registry.register_helper("camelCase", Box::new(camel_case));
        registry.register_helper("pascalCase", Box::new(pascal_case));
        registry.register_helper("kebabCase", Box::new(kebab_case));
        registry.register_helper("snakeCase", Box::new(snake_case));
        registry.register_helper("upperCase", Box::new(upper_case));
        registry.register_helper("lowerCase", Box::new(lower_case));
        registry.register_helper("capitalize", Box::new(capitalize));
        registry.register_helper("jsEscape", Box::new(js_escape));
        registry.register_helper("split", Box::new(split));
        registry.register_helper("last", Box::new(last));
        registry.register_helper("tojson", Box::new(tojson));
        registry.register_helper("date", Box::new(date));
        registry.register_helper("sum", Box::new(sum));

        Self {
            registry: Arc::new(registry),
            config,
        }
    }

    #[cfg(test)]
    fn register_test_helper(
        &mut self,
        name: &str,
        helper: Box<dyn handlebars::HelperDef + Send + Sync>,
    ) {
        Arc::get_mut(&mut self.registry)
            .expect("registry not shared yet")
            .register_helper(name, helper);
    }

    /// Render template text against a data object, enforcing the size and
    /// wall-clock limits. `name` only labels errors.
    pub fn render(&self, name: &str, template: &str, data: &Value) -> Result<String> {
        let fail = |reason: String| -> anyhow::Error {
            GitvanError::TemplateRenderError {
                template: name.to_string(),
                reason,
            }
            .into()
        };

        if template.len() > self.config.max_template_bytes {
            return Err(fail(format!(
                "template is {} bytes, over the {} byte limit",
                template.len(),
                self.config.max_template_bytes
            )));
        }

        let registry = Arc::clone(&self.registry);
        let template_owned = template.to_string();
        let data_owned = data.clone();
        let (tx, rx) = mpsc::channel();

        // The watchdog owns the render; on timeout the thread is abandoned
        // and its eventual result dropped.
        thread::spawn(move || {
            let result = registry.render_template(&template_owned, &data_owned);
            let _ = tx.send(result);
        });

        let rendered = match rx.recv_timeout(self.config.render_timeout) {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => return Err(fail(e.to_string())),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                return Err(fail(format!(
                    "render exceeded {}",
                    humantime::format_duration(self.config.render_timeout)
                )));
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(fail("render thread died".to_string()));
            }
        };

        if rendered.len() > self.config.max_output_bytes {
            return Err(fail(format!(
                "output is {} bytes, over the {} byte limit",
                rendered.len(),
                self.config.max_output_bytes
            )));
        }

        Ok(rendered)
    }
}

/// Remove runtime-reserved keys from a user data object.
pub fn sanitize_context(data: &mut Value) {
    if let Value::Object(map) = data {
        for key in RESERVED_KEYS {
            map.remove(key);
        }
        map.retain(|k, _| !k.starts_with("__"));
    }
}

/// Split a leading `---` front-matter block (TOML) off template text.
/// Returns the parsed block, when present, and the remaining body.
pub fn split_front_matter(text: &str) -> Result<(Option<Value>, &str)> {
    let Some(rest) = text.strip_prefix("---\n").or_else(|| text.strip_prefix("---\r\n")) else {
        return Ok((None, text));
    };

    let Some(end) = rest.find("\n---").map(|i| i + 1) else {
        return Err(GitvanError::TemplateRenderError {
            template: "front matter".to_string(),
            reason: "unterminated front-matter block".to_string(),
        }
        .into());
    };

    let block = &rest[..end - 1];
    let after = rest[end + 3..].strip_prefix('\n').unwrap_or(&rest[end + 3..]);

    let table: toml::Table =
        toml::from_str(block).map_err(|e| GitvanError::TemplateRenderError {
            template: "front matter".to_string(),
            reason: format!("invalid front matter: {e}"),
        })?;
    let value = serde_json::to_value(table)?;
    Ok((Some(value), after))
}
