//! Compiled template cache and rendering.
//!
//! Templates are keyed by the fingerprint of their text, so identical text
//! compiles once no matter where it came from. A template that fails to
//! render is evicted so the next call recompiles it.
//!
//! Syntax is minijinja's: `{{ expr }}`, `{% stmt %}`, `{# comment #}`.
//! Output is HTML, so expressions are escaped unless marked `|safe`.
//! Include directives must already be resolved; a leftover `{include ...}`
//! is plain text to the renderer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use minijinja::{AutoEscape, Environment, UndefinedBehavior};
use parking_lot::{RwLock, RwLockWriteGuard};
use serde::Serialize;

use crate::bus::Bus;
use crate::debug;
use crate::error::RenderError;
use crate::fingerprint::Fingerprint;

pub struct Renderer {
    env: RwLock<Environment<'static>>,
    debug: AtomicBool,
    bus: Arc<Bus>,
}

impl Renderer {
    pub fn new(bus: Arc<Bus>, debug: bool) -> Self {
        let mut env = Environment::new();
        // Names are fingerprints, so there is no extension to infer from
        env.set_auto_escape_callback(|_| AutoEscape::Html);

        let renderer = Self {
            env: RwLock::new(env),
            debug: AtomicBool::new(false),
            bus,
        };
        renderer.set_debug(debug);
        renderer
    }

    /// Toggle strict undefined handling and detailed error output.
    pub fn set_debug(&self, debug: bool) {
        let mut env = self.env.write();
        env.set_debug(debug);
        env.set_undefined_behavior(if debug {
            UndefinedBehavior::Strict
        } else {
            UndefinedBehavior::Lenient
        });
        self.debug.store(debug, Ordering::Relaxed);
    }

    /// Render `text` with `data`, compiling it on first use.
    pub fn render<T: Serialize>(&self, text: &str, data: T) -> Result<String, RenderError> {
        let name = Fingerprint::of(text).to_hex();

        let cached = {
            let env = self.env.read();
            env.get_template(&name).ok().map(|tpl| tpl.render(&data))
        };

        let rendered = match cached {
            Some(rendered) => rendered,
            None => {
                let mut env = self.env.write();
                if let Err(err) = env.add_template_owned(name.clone(), text.to_owned()) {
                    return Err(self.fail(RenderError::Compile(self.describe(&err))));
                }
                debug!("cache"; "compiled template {}", &name[..16]);

                let env = RwLockWriteGuard::downgrade(env);
                match env.get_template(&name) {
                    Ok(tpl) => tpl.render(&data),
                    Err(err) => Err(err),
                }
            }
        };

        rendered.map_err(|err| {
            self.env.write().remove_template(&name);
            self.fail(RenderError::Render(self.describe(&err)))
        })
    }

    /// Drop every compiled template.
    pub fn clear(&self) {
        self.env.write().clear_templates();
        debug!("cache"; "cleared compiled templates");
    }

    /// Whether `text` is currently compiled.
    pub fn contains(&self, text: &str) -> bool {
        let name = Fingerprint::of(text).to_hex();
        let env = self.env.read();
        env.get_template(&name).is_ok()
    }

    /// Number of compiled templates.
    pub fn len(&self) -> usize {
        self.env.read().templates().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn describe(&self, err: &minijinja::Error) -> String {
        if self.debug.load(Ordering::Relaxed) {
            format!("{err:#}")
        } else {
            err.to_string()
        }
    }

    fn fail(&self, err: RenderError) -> RenderError {
        self.bus.report(format!("render: {err}"));
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn renderer(debug: bool) -> (Renderer, Arc<Bus>) {
        let bus = Arc::new(Bus::new());
        (Renderer::new(Arc::clone(&bus), debug), bus)
    }

    #[test]
    fn test_render_with_data() {
        let (renderer, _) = renderer(false);
        let out = renderer
            .render("Hello {{ name }}!", json!({ "name": "weave" }))
            .unwrap();
        assert_eq!(out, "Hello weave!");
    }

    #[test]
    fn test_identical_text_compiles_once() {
        let (renderer, _) = renderer(false);
        let text = "{% for x in items %}{{ x }}{% endfor %}";
        assert_eq!(renderer.render(text, json!({ "items": [1, 2] })).unwrap(), "12");
        assert_eq!(renderer.render(text, json!({ "items": [3] })).unwrap(), "3");
        assert_eq!(renderer.len(), 1);
        assert!(renderer.contains(text));
    }

    #[test]
    fn test_compile_error_caches_nothing() {
        let (renderer, _) = renderer(false);
        let err = renderer.render("{{ unclosed", json!({})).unwrap_err();
        assert!(matches!(err, RenderError::Compile(_)));
        assert!(renderer.is_empty());
    }

    #[test]
    fn test_render_error_evicts_template() {
        let (renderer, _) = renderer(true);
        let text = "{{ missing.field }}";
        let err = renderer.render(text, json!({})).unwrap_err();
        assert!(matches!(err, RenderError::Render(_)));
        assert!(!renderer.contains(text));
    }

    #[test]
    fn test_output_is_html_escaped() {
        let (renderer, _) = renderer(false);
        let data = json!({ "v": "<b>&" });
        assert_eq!(renderer.render("{{ v }}", &data).unwrap(), "&lt;b&gt;&amp;");
        assert_eq!(renderer.render("{{ v|safe }}", &data).unwrap(), "<b>&");
    }

    #[test]
    fn test_lenient_undefined_outside_debug() {
        let (renderer, _) = renderer(false);
        assert_eq!(renderer.render("[{{ missing }}]", json!({})).unwrap(), "[]");
    }

    #[test]
    fn test_errors_reach_diagnostic_channel() {
        let (renderer, bus) = renderer(false);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.on_diagnostic(move |message| sink.lock().push(message.to_string()));

        let _ = renderer.render("{% if %}", json!({}));
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].starts_with("render:"));
    }

    #[test]
    fn test_clear() {
        let (renderer, _) = renderer(false);
        renderer.render("a", json!({})).unwrap();
        renderer.render("b", json!({})).unwrap();
        assert_eq!(renderer.len(), 2);
        renderer.clear();
        assert!(renderer.is_empty());
    }
}
