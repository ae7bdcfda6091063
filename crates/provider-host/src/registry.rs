//! Tool registry and name normalizer.
//!
//! Providers expose tool names in their own convention (single
//! underscores, camelCase, dotted paths). The registry maintains the
//! bidirectional map between the canonical form `provider__action` and
//! the wire form each provider actually accepts; every other subsystem
//! sees only canonical names.

use std::collections::HashMap;

use parking_lot::RwLock;

use td_domain::tool::{canonical_name, ToolDef};

use crate::protocol::WireToolDef;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Name normalization & similarity
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Normalize a wire tool name into the canonical action form:
/// lowercase snake_case with camelCase boundaries split and punctuation
/// collapsed to single underscores.
pub fn normalize_action(wire: &str) -> String {
    let mut out = String::with_capacity(wire.len() + 4);
    let mut prev_lower = false;
    for ch in wire.chars() {
        if ch.is_alphanumeric() {
            if ch.is_uppercase() {
                if prev_lower {
                    out.push('_');
                }
                for low in ch.to_lowercase() {
                    out.push(low);
                }
                prev_lower = false;
            } else {
                out.push(ch);
                prev_lower = ch.is_lowercase() || ch.is_numeric();
            }
        } else if !out.ends_with('_') && !out.is_empty() {
            out.push('_');
            prev_lower = false;
        }
    }
    out.trim_end_matches('_').to_string()
}

/// Similarity ratio in 0.0..=1.0 between two tool identifiers.
///
/// Plain normalized Levenshtein under-scores containment pairs like
/// `navigate` vs `browser_navigate`, so the score also considers the best
/// same-length window of the longer string, discounted slightly so exact
/// full matches still win.
pub fn similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let full = strsim::normalized_levenshtein(a, b);

    let (short, long) = if a.chars().count() <= b.chars().count() {
        (a, b)
    } else {
        (b, a)
    };
    let short_chars: Vec<char> = short.chars().collect();
    let long_chars: Vec<char> = long.chars().collect();
    let window = short_chars.len();
    let mut best_partial = 0.0f64;
    for start in 0..=(long_chars.len() - window) {
        let slice: String = long_chars[start..start + window].iter().collect();
        let score = strsim::normalized_levenshtein(short, &slice);
        if score > best_partial {
            best_partial = score;
        }
    }

    full.max(best_partial * 0.95)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
struct RegisteredTool {
    def: ToolDef,
    wire_name: String,
}

/// Aggregated tool namespace keyed by canonical name.
#[derive(Default)]
pub struct ToolRegistry {
    inner: RwLock<HashMap<String, RegisteredTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every entry belonging to `provider` with the given wire
    /// tools. Old entries are dropped atomically with the insert, so a
    /// provider re-list never leaves a mixed cache.
    pub fn replace_provider(&self, provider: &str, tools: &[WireToolDef]) {
        let fresh: HashMap<String, RegisteredTool> = tools
            .iter()
            .map(|t| {
                let action = normalize_action(&t.name);
                let canonical = canonical_name(provider, &action);
                (
                    canonical.clone(),
                    RegisteredTool {
                        def: ToolDef {
                            name: canonical,
                            provider: provider.to_string(),
                            description: t.description.clone(),
                            input_schema: t.input_schema.clone(),
                        },
                        wire_name: t.name.clone(),
                    },
                )
            })
            .collect();

        let mut inner = self.inner.write();
        inner.retain(|_, tool| tool.def.provider != provider);
        inner.extend(fresh);
    }

    /// Drop every entry belonging to `provider`.
    pub fn remove_provider(&self, provider: &str) {
        self.inner.write().retain(|_, tool| tool.def.provider != provider);
    }

    /// All tools, sorted by canonical name.
    pub fn list(&self) -> Vec<ToolDef> {
        let mut tools: Vec<ToolDef> = self.inner.read().values().map(|t| t.def.clone()).collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Tools of one provider, sorted by canonical name.
    pub fn list_provider(&self, provider: &str) -> Vec<ToolDef> {
        let mut tools: Vec<ToolDef> = self
            .inner
            .read()
            .values()
            .filter(|t| t.def.provider == provider)
            .map(|t| t.def.clone())
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub fn get(&self, canonical: &str) -> Option<ToolDef> {
        self.inner.read().get(canonical).map(|t| t.def.clone())
    }

    /// Resolve a canonical name to `(provider, wire_name)` for dispatch.
    pub fn wire_name(&self, canonical: &str) -> Option<(String, String)> {
        self.inner
            .read()
            .get(canonical)
            .map(|t| (t.def.provider.clone(), t.wire_name.clone()))
    }

    /// Tools whose canonical name scores at or above `threshold` against
    /// `name`, best first.
    pub fn find_similar(&self, name: &str, threshold: f64) -> Vec<(ToolDef, f64)> {
        let mut matches: Vec<(ToolDef, f64)> = self
            .inner
            .read()
            .values()
            .filter_map(|t| {
                let score = similarity(name, &t.def.name);
                (score >= threshold).then(|| (t.def.clone(), score))
            })
            .collect();
        matches.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        matches
    }

    /// Best match for `action` among one provider's tools, scored on the
    /// action component only.
    pub fn find_similar_in_provider(
        &self,
        provider: &str,
        action: &str,
        threshold: f64,
    ) -> Option<(ToolDef, f64)> {
        self.inner
            .read()
            .values()
            .filter(|t| t.def.provider == provider)
            .filter_map(|t| {
                let tool_action = td_domain::tool::split_canonical(&t.def.name)?.1;
                let score = similarity(action, tool_action);
                (score >= threshold).then(|| (t.def.clone(), score))
            })
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(name: &str) -> WireToolDef {
        WireToolDef {
            name: name.into(),
            description: String::new(),
            input_schema: serde_json::json!({ "type": "object", "properties": {} }),
        }
    }

    #[test]
    fn normalize_snake_passthrough() {
        assert_eq!(normalize_action("read_file"), "read_file");
    }

    #[test]
    fn normalize_camel_case() {
        assert_eq!(normalize_action("readFile"), "read_file");
        assert_eq!(normalize_action("browserNavigateBack"), "browser_navigate_back");
    }

    #[test]
    fn normalize_punctuation() {
        assert_eq!(normalize_action("browser.navigate"), "browser_navigate");
        assert_eq!(normalize_action("shell-run-command"), "shell_run_command");
        assert_eq!(normalize_action("a..b"), "a_b");
    }

    #[test]
    fn similarity_exact_is_one() {
        assert_eq!(similarity("navigate", "navigate"), 1.0);
    }

    #[test]
    fn similarity_containment_scores_high() {
        // The auto-correction case that matters in practice: `navigate`
        // against `browser_navigate` must clear the 0.8 threshold.
        assert!(similarity("navigate", "browser_navigate") >= 0.8);
        assert!(similarity("navigate", "browser_navigate") < 1.0);
    }

    #[test]
    fn similarity_unrelated_scores_low() {
        assert!(similarity("navigate", "read_file") < 0.5);
    }

    #[test]
    fn similarity_close_typo() {
        assert!(similarity("write_fiel", "write_file") >= 0.8);
    }

    #[test]
    fn replace_provider_builds_canonical_names() {
        let registry = ToolRegistry::new();
        registry.replace_provider("playwright", &[wire("browser.navigate"), wire("click")]);

        let names: Vec<String> = registry.list().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["playwright__browser_navigate", "playwright__click"]);
        assert_eq!(
            registry.wire_name("playwright__browser_navigate"),
            Some(("playwright".into(), "browser.navigate".into()))
        );
    }

    #[test]
    fn replace_provider_drops_old_entries_atomically() {
        let registry = ToolRegistry::new();
        registry.replace_provider("filesystem", &[wire("read_file"), wire("write_file")]);
        assert_eq!(registry.len(), 2);

        registry.replace_provider("filesystem", &[wire("read_file")]);
        assert_eq!(registry.len(), 1);
        assert!(registry.get("filesystem__write_file").is_none());
    }

    #[test]
    fn replace_provider_leaves_other_providers_alone() {
        let registry = ToolRegistry::new();
        registry.replace_provider("filesystem", &[wire("read_file")]);
        registry.replace_provider("shell", &[wire("run_command")]);

        registry.replace_provider("filesystem", &[]);
        assert!(registry.get("shell__run_command").is_some());
        assert!(registry.get("filesystem__read_file").is_none());
    }

    #[test]
    fn find_similar_in_provider_picks_best() {
        let registry = ToolRegistry::new();
        registry.replace_provider(
            "playwright",
            &[wire("browser_navigate"), wire("browser_navigate_back"), wire("click")],
        );

        let (best, score) = registry
            .find_similar_in_provider("playwright", "navigate", 0.8)
            .unwrap();
        assert_eq!(best.name, "playwright__browser_navigate");
        assert!(score >= 0.8);

        assert!(registry
            .find_similar_in_provider("playwright", "zzzz", 0.8)
            .is_none());
    }

    #[test]
    fn find_similar_respects_threshold() {
        let registry = ToolRegistry::new();
        registry.replace_provider("filesystem", &[wire("read_file")]);
        assert!(registry.find_similar("filesystem__read_fiel", 0.8).len() == 1);
        assert!(registry.find_similar("unrelated__tool", 0.95).is_empty());
    }
}
