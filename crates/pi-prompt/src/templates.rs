//! 基于 Handlebars 的模板注册表
//!
//! 注册表由调用方持有并注入，内部只有一把读写锁；
//! 同名模板的替换在写锁内一次完成。

use crate::system_prompts;
use handlebars::{handlebars_helper, no_escape, Handlebars, Template};
use pi_error::{PiError, Result};
use serde_json::Value;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

fn display_value(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max).collect();
    out.push('…');
    out
}

handlebars_helper!(upper: |s: str| s.to_uppercase());
handlebars_helper!(lower: |s: str| s.to_lowercase());
handlebars_helper!(truncate: |s: str, n: u64| truncate_chars(s, n as usize));
handlebars_helper!(join: |items: array, sep: str| {
    items.iter().map(display_value).collect::<Vec<_>>().join(sep)
});
handlebars_helper!(bullets: |items: array| {
    items
        .iter()
        .map(|v| format!("- {}", display_value(v)))
        .collect::<Vec<_>>()
        .join("\n")
});

pub struct TemplateRegistry {
    inner: RwLock<Handlebars<'static>>,
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRegistry {
    /// 空注册表，已注册 `join` `upper` `lower` `truncate` `bullets` 辅助函数
    pub fn new() -> Self {
        let mut hb = Handlebars::new();
        // 输出是提示词与 Markdown，不做 HTML 转义
        hb.register_escape_fn(no_escape);
        hb.set_strict_mode(false);
        hb.register_helper("upper", Box::new(upper));
        hb.register_helper("lower", Box::new(lower));
        hb.register_helper("truncate", Box::new(truncate));
        hb.register_helper("join", Box::new(join));
        hb.register_helper("bullets", Box::new(bullets));
        Self {
            inner: RwLock::new(hb),
        }
    }

    /// 预置每个分析任务的系统提示词
    pub fn with_builtins() -> Result<Self> {
        let registry = Self::new();
        for (name, body) in system_prompts::builtin_templates() {
            registry.register_template(&name, body)?;
        }
        Ok(registry)
    }

    pub fn register_template(&self, name: &str, body: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(PiError::InvalidRequest {
                reason: "template name must not be empty".to_string(),
            });
        }
        if body.trim().is_empty() {
            return Err(PiError::InvalidRequest {
                reason: format!("template {} has an empty body", name),
            });
        }

        // 先编译再加锁，语法错误不会影响已有同名模板
        let template = Template::compile(body).map_err(|e| PiError::Template {
            name: name.to_string(),
            message: e.to_string(),
        })?;

        let mut hb = self.write()?;
        let replaced = hb.has_template(name);
        hb.register_template(name, template);
        debug!(template = name, replaced, "Registered template");
        Ok(())
    }

    pub fn render_template(&self, name: &str, data: &Value) -> Result<String> {
        let hb = self.read()?;
        if !hb.has_template(name) {
            return Err(PiError::NotFound {
                resource: format!("template {}", name),
            });
        }
        hb.render(name, data).map_err(|e| PiError::Template {
            name: name.to_string(),
            message: e.to_string(),
        })
    }

    /// 已注册模板名，按字典序
    pub fn list_templates(&self) -> Result<Vec<String>> {
        let hb = self.read()?;
        let mut names: Vec<String> = hb.get_templates().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    pub fn has_template(&self, name: &str) -> bool {
        self.read().map(|hb| hb.has_template(name)).unwrap_or(false)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Handlebars<'static>>> {
        self.inner.read().map_err(|_| PiError::Concurrency {
            operation: "template_registry.read".to_string(),
            message: "lock poisoned".to_string(),
        })
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Handlebars<'static>>> {
        self.inner.write().map_err(|_| PiError::Concurrency {
            operation: "template_registry.write".to_string(),
            message: "lock poisoned".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pi_core::AnalysisTask;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_register_and_render() {
        let registry = TemplateRegistry::new();
        registry
            .register_template(
                "greeting",
                "Hello {{upper name}}{{#if tags}} [{{join tags \", \"}}]{{/if}}",
            )
            .unwrap();
        let out = registry
            .render_template("greeting", &json!({"name": "ada", "tags": ["a", "b"]}))
            .unwrap();
        assert_eq!(out, "Hello ADA [a, b]");

        let out = registry
            .render_template("greeting", &json!({"name": "ada"}))
            .unwrap();
        assert_eq!(out, "Hello ADA");
    }

    #[test]
    fn test_helpers() {
        let registry = TemplateRegistry::new();
        registry
            .register_template("h", "{{lower a}}|{{truncate b 3}}|{{bullets c}}")
            .unwrap();
        let out = registry
            .render_template("h", &json!({"a": "ABC", "b": "abcdef", "c": ["x", "y"]}))
            .unwrap();
        assert_eq!(out, "abc|abc…|- x\n- y");
    }

    #[test]
    fn test_no_html_escaping() {
        let registry = TemplateRegistry::new();
        registry.register_template("t", "{{v}}").unwrap();
        let out = registry.render_template("t", &json!({"v": "a < b & c"})).unwrap();
        assert_eq!(out, "a < b & c");
    }

    #[test]
    fn test_input_errors() {
        let registry = TemplateRegistry::new();
        assert!(matches!(
            registry.register_template("", "body"),
            Err(PiError::InvalidRequest { .. })
        ));
        assert!(matches!(
            registry.register_template("x", "  "),
            Err(PiError::InvalidRequest { .. })
        ));
        assert!(matches!(
            registry.register_template("x", "{{#if a}}unclosed"),
            Err(PiError::Template { .. })
        ));
        assert!(matches!(
            registry.render_template("missing", &json!({})),
            Err(PiError::NotFound { .. })
        ));
    }

    #[test]
    fn test_failed_replacement_keeps_old_template() {
        let registry = TemplateRegistry::new();
        registry.register_template("t", "v1").unwrap();
        assert!(registry.register_template("t", "{{#each}}").is_err());
        assert_eq!(registry.render_template("t", &json!({})).unwrap(), "v1");

        registry.register_template("t", "v2").unwrap();
        assert_eq!(registry.render_template("t", &json!({})).unwrap(), "v2");
    }

    #[test]
    fn test_builtins_cover_every_task() {
        let registry = TemplateRegistry::with_builtins().unwrap();
        let names = registry.list_templates().unwrap();
        for task in AnalysisTask::ALL {
            let name = system_prompts::template_name(task);
            assert!(names.contains(&name), "missing {}", name);
            let rendered = registry
                .render_template(&name, &json!({"task_name": task.display_name()}))
                .unwrap();
            assert!(rendered.contains(task.display_name()));
        }
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn test_concurrent_readers_and_writers() {
        let registry = Arc::new(TemplateRegistry::new());
        registry.register_template("shared", "0").unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for j in 0..50 {
                        if i % 2 == 0 {
                            registry
                                .register_template("shared", &format!("{}", j))
                                .unwrap();
                        } else {
                            let out = registry.render_template("shared", &json!({})).unwrap();
                            assert!(out.parse::<u32>().is_ok());
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
