//! Placeholder rendering for message templates.
//!
//! Supports `{{customer.<attr>}}` and `{{event.<field>}}` with an optional
//! `| filter` suffix. Unknown placeholders render as an empty string.

use std::collections::HashMap;

use courier_core::types::{Customer, RenderedMessage, Template, TriggerEvent};

type FilterFn = Box<dyn Fn(&str) -> String + Send + Sync>;

pub struct TemplateRenderer {
    filters: HashMap<String, FilterFn>,
}

impl TemplateRenderer {
    pub fn new() -> Self {
        let mut filters: HashMap<String, FilterFn> = HashMap::new();
        filters.insert("upcase".to_string(), Box::new(|s: &str| s.to_uppercase()));
        filters.insert("downcase".to_string(), Box::new(|s: &str| s.to_lowercase()));
        filters.insert("strip".to_string(), Box::new(|s: &str| s.trim().to_string()));
        filters.insert(
            "default".to_string(),
            Box::new(|s: &str| {
                if s.is_empty() {
                    "N/A".to_string()
                } else {
                    s.to_string()
                }
            }),
        );
        Self { filters }
    }

    pub fn render(
        &self,
        template: &Template,
        customer: &Customer,
        event: Option<&TriggerEvent>,
    ) -> RenderedMessage {
        RenderedMessage {
            subject: template
                .subject
                .as_deref()
                .map(|s| self.render_text(s, customer, event)),
            body: self.render_text(&template.body, customer, event),
        }
    }

    pub fn render_text(
        &self,
        text: &str,
        customer: &Customer,
        event: Option<&TriggerEvent>,
    ) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(open) = rest.find("{{") {
            out.push_str(&rest[..open]);
            let after = &rest[open + 2..];
            let Some(close) = after.find("}}") else {
                out.push_str(&rest[open..]);
                return out;
            };
            out.push_str(&self.expand(&after[..close], customer, event));
            rest = &after[close + 2..];
        }
        out.push_str(rest);
        out
    }

    fn expand(&self, expr: &str, customer: &Customer, event: Option<&TriggerEvent>) -> String {
        let mut parts = expr.split('|').map(str::trim);
        let path = parts.next().unwrap_or_default();
        let value = lookup(path, customer, event);
        parts.fold(value, |acc, name| match self.filters.get(name) {
            Some(filter) => filter(&acc),
            None => acc,
        })
    }
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

fn lookup(path: &str, customer: &Customer, event: Option<&TriggerEvent>) -> String {
    let value = match path.split_once('.') {
        Some(("customer", "id")) => return customer.id.clone(),
        Some(("customer", key)) => customer.attributes.get(key),
        Some(("event", "name")) => return event.map(|e| e.name.clone()).unwrap_or_default(),
        Some(("event", key)) => event.and_then(|e| e.payload.get(key)),
        _ => None,
    };
    match value {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}
