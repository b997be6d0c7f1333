//! Target naming index. Scans the template directory and the DOM
//! selector definition file, then lets scripts refer to targets by a
//! human-friendly short name (`submit` for `btn_submit.png`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const STRIP_PREFIXES: &[&str] = &["btn_", "img_", "tpl_"];
const STRIP_SUFFIXES: &[&str] = &["_button", "_btn", "_field", "_icon"];

/// Known targets plus their de-aliased short names and per-target
/// lookup data for the resolver.
#[derive(Debug, Default)]
pub struct TargetCatalog {
    /// Lowercased alias -> canonical name. `None` marks an alias shared
    /// by two targets; ambiguous aliases never resolve.
    aliases: HashMap<String, Option<String>>,
    templates: HashMap<String, PathBuf>,
    dom_selectors: HashMap<String, String>,
}

impl TargetCatalog {
    /// Builds the catalog by scanning `template_dir` for `*.png`
    /// reference images and reading `selector_file` (a JSON object of
    /// name -> selector). Missing sources are fine; the catalog is then
    /// simply sparser.
    pub fn scan(template_dir: &Path, selector_file: &Path) -> Self {
        let mut catalog = Self::default();

        if let Ok(entries) = std::fs::read_dir(template_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                let is_png = path
                    .extension()
                    .map(|e| e.eq_ignore_ascii_case("png"))
                    .unwrap_or(false);
                if !is_png {
                    continue;
                }
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    let name = stem.to_string();
                    catalog.templates.insert(name.to_lowercase(), path.clone());
                    catalog.register(&name);
                }
            }
        } else {
            debug!(dir = %template_dir.display(), "no template directory, skipping scan");
        }

        match std::fs::read_to_string(selector_file) {
            Ok(content) => match serde_json::from_str::<HashMap<String, String>>(&content) {
                Ok(map) => {
                    for (name, selector) in map {
                        catalog
                            .dom_selectors
                            .insert(name.to_lowercase(), selector);
                        catalog.register(&name);
                    }
                }
                Err(e) => warn!(file = %selector_file.display(), "invalid selector file: {e}"),
            },
            Err(_) => debug!(file = %selector_file.display(), "no selector file, skipping"),
        }

        catalog
    }

    fn register(&mut self, name: &str) {
        let canonical = name.to_string();
        self.insert_alias(name.to_lowercase(), &canonical);
        let short = dealias(name);
        if short != name.to_lowercase() {
            self.insert_alias(short, &canonical);
        }
    }

    fn insert_alias(&mut self, alias: String, canonical: &str) {
        match self.aliases.get(&alias) {
            Some(Some(existing)) if existing != canonical => {
                warn!(%alias, "alias is ambiguous between targets, dropping it");
                self.aliases.insert(alias, None);
            }
            Some(_) => {}
            None => {
                self.aliases.insert(alias, Some(canonical.to_string()));
            }
        }
    }

    /// Case-insensitive exact match on alias or full name. Unknown
    /// names return `None`: the compiler then passes the identifier
    /// through unresolved for the resolver to treat as a literal.
    pub fn resolve(&self, name: &str) -> Option<String> {
        self.aliases.get(&name.to_lowercase()).cloned().flatten()
    }

    pub fn template_path(&self, target: &str) -> Option<&PathBuf> {
        self.templates.get(&target.to_lowercase())
    }

    pub fn dom_selector(&self, target: &str) -> Option<&String> {
        self.dom_selectors.get(&target.to_lowercase())
    }
}

/// Strips one known prefix, one known suffix and casing, yielding the
/// short name a script author would write.
fn dealias(name: &str) -> String {
    let mut s = name.to_lowercase();
    for prefix in STRIP_PREFIXES {
        if let Some(rest) = s.strip_prefix(prefix) {
            s = rest.to_string();
            break;
        }
    }
    for suffix in STRIP_SUFFIXES {
        if let Some(rest) = s.strip_suffix(suffix) {
            s = rest.to_string();
            break;
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dealias_strips_prefix_and_suffix() {
        assert_eq!(dealias("btn_submit"), "submit");
        assert_eq!(dealias("Save_button"), "save");
        assert_eq!(dealias("btn_ok_icon"), "ok");
        assert_eq!(dealias("plain"), "plain");
    }

    #[test]
    fn ambiguous_alias_is_dropped() {
        let mut catalog = TargetCatalog::default();
        catalog.register("btn_save");
        catalog.register("save_icon");
        // Both de-alias to "save": the short name must no longer resolve,
        // while the full names still do.
        assert_eq!(catalog.resolve("save"), None);
        assert_eq!(catalog.resolve("btn_save"), Some("btn_save".into()));
        assert_eq!(catalog.resolve("SAVE_ICON"), Some("save_icon".into()));
    }
}
