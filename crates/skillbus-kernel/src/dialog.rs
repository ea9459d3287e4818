//! Dialog-template lookup.
//!
//! Skills speak through named dialog templates registered per language.  A
//! template has one or more variants; [`DialogLibrary::get_dialog`] rotates
//! through them so consecutive replies do not repeat, and substitutes
//! `{key}` / `{{key}}` placeholders from a context map.
//!
//! Lookup falls back from the full language tag (`en-us`) to its primary
//! subtag (`en`).  When no template exists the requested phrase itself is
//! returned, so a missing resource degrades to speaking the template name
//! rather than failing.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;

struct Template {
    variants: Vec<String>,
    cursor: AtomicUsize,
}

/// Shared registry of dialog templates, cheaply cloneable.
#[derive(Clone, Default)]
pub struct DialogLibrary {
    templates: Arc<DashMap<(String, String), Template>>,
}

impl DialogLibrary {
    /// Create an empty library.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the variants for `name` in `lang`.
    ///
    /// Blank variants are ignored; registering only blanks removes the
    /// template.
    pub fn register<I, S>(&self, lang: &str, name: &str, variants: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let variants: Vec<String> = variants
            .into_iter()
            .map(Into::into)
            .filter(|v: &String| !v.trim().is_empty())
            .collect();
        let key = (normalize_lang(lang), name.to_string());

        if variants.is_empty() {
            self.templates.remove(&key);
            return;
        }
        tracing::debug!(lang = %key.0, name = %name, variants = variants.len(), "dialog registered");
        self.templates.insert(
            key,
            Template {
                variants,
                cursor: AtomicUsize::new(0),
            },
        );
    }

    /// Whether a template exists for `name` in `lang` or its primary subtag.
    pub fn contains(&self, lang: &str, name: &str) -> bool {
        candidate_langs(lang)
            .iter()
            .any(|l| self.templates.contains_key(&(l.clone(), name.to_string())))
    }

    /// Render the next variant of `phrase` for `lang`.
    ///
    /// Returns `phrase` unchanged (after placeholder substitution) when no
    /// template is registered.
    pub fn get_dialog(&self, phrase: &str, lang: &str, context: &HashMap<String, String>) -> String {
        for candidate in candidate_langs(lang) {
            if let Some(template) = self.templates.get(&(candidate, phrase.to_string())) {
                let index = template.cursor.fetch_add(1, Ordering::Relaxed) % template.variants.len();
                return render(&template.variants[index], context);
            }
        }
        tracing::debug!(phrase = %phrase, lang = %lang, "no dialog template, speaking phrase");
        render(phrase, context)
    }
}

fn normalize_lang(lang: &str) -> String {
    lang.trim().to_lowercase().replace('_', "-")
}

fn candidate_langs(lang: &str) -> Vec<String> {
    let full = normalize_lang(lang);
    let mut langs = vec![full.clone()];
    if let Some((primary, _)) = full.split_once('-') {
        langs.push(primary.to_string());
    }
    langs
}

fn render(template: &str, context: &HashMap<String, String>) -> String {
    let mut out = template.to_string();
    for (key, value) in context {
        out = out.replace(&format!("{{{{{key}}}}}"), value);
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn missing_template_returns_phrase() {
        let library = DialogLibrary::new();
        assert_eq!(library.get_dialog("unknown", "en-us", &HashMap::new()), "unknown");
    }

    #[test]
    fn variants_rotate() {
        let library = DialogLibrary::new();
        library.register("en-us", "greeting", ["hello", "hi there"]);

        let none = HashMap::new();
        assert_eq!(library.get_dialog("greeting", "en-us", &none), "hello");
        assert_eq!(library.get_dialog("greeting", "en-us", &none), "hi there");
        assert_eq!(library.get_dialog("greeting", "en-us", &none), "hello");
    }

    #[test]
    fn placeholders_are_substituted() {
        let library = DialogLibrary::new();
        library.register("en-us", "weather", ["it is {condition} in {{location}}"]);

        let rendered = library.get_dialog(
            "weather",
            "en-us",
            &ctx(&[("condition", "sunny"), ("location", "paris")]),
        );
        assert_eq!(rendered, "it is sunny in paris");
    }

    #[test]
    fn falls_back_to_primary_language() {
        let library = DialogLibrary::new();
        library.register("en", "bye", ["goodbye"]);

        assert!(library.contains("en-GB", "bye"));
        assert_eq!(library.get_dialog("bye", "en_GB", &HashMap::new()), "goodbye");
        assert!(!library.contains("pt-pt", "bye"));
    }

    #[test]
    fn blank_registration_removes_template() {
        let library = DialogLibrary::new();
        library.register("en-us", "x", ["something"]);
        library.register("en-us", "x", ["  "]);
        assert!(!library.contains("en-us", "x"));
    }
}
