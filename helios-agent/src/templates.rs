//! Template rendering seam
//!
//! Templates are mustache files shipped inside the installed version; the
//! rendering itself is delegated to the `mustache` crate.

use serde_json::Value;
use std::collections::BTreeMap;

pub trait TemplateEngine: Send + Sync {
    fn render(&self, source: &str, context: &BTreeMap<String, Value>) -> Result<String, String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MustacheEngine;

impl TemplateEngine for MustacheEngine {
    fn render(&self, source: &str, context: &BTreeMap<String, Value>) -> Result<String, String> {
        let template = mustache::compile_str(source).map_err(|e| e.to_string())?;
        let mut rendered = Vec::new();
        template
            .render(&mut rendered, context)
            .map_err(|e| e.to_string())?;
        String::from_utf8(rendered).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_merged_config() {
        let mut context = BTreeMap::new();
        context.insert("host_ip".to_string(), Value::from("10.0.0.7"));
        context.insert("port".to_string(), Value::from("8080"));

        let rendered = MustacheEngine
            .render("listen {{host_ip}}:{{port}};{{missing}}", &context)
            .unwrap();
        assert_eq!(rendered, "listen 10.0.0.7:8080;");
    }

    #[test]
    fn test_unclosed_tag_is_an_error() {
        assert!(MustacheEngine.render("{{#section}}never closed", &BTreeMap::new()).is_err());
    }
}
