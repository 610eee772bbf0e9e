use super::NormalizedFileSet;
use regex::Regex;
use tracing::{debug, warn};

/// A textual rewrite applied to well-known build-tool config files
#[derive(Debug, Clone)]
pub struct ManifestRule {
    /// File names (not paths) the rule applies to
    pub file_names: Vec<String>,
    /// Presence of this token means the file is already patched
    pub marker: String,
    /// The directive is inserted right after the first match
    pub anchor: Regex,
    pub directive: String,
}

impl ManifestRule {
    /// Binds a Vite dev server to all interfaces and accepts any Host header,
    /// which the sandbox's public domain requires.
    pub fn vite_server_binding() -> Self {
        Self {
            file_names: ["js", "ts", "mjs", "mts", "cjs"]
                .iter()
                .map(|ext| format!("vite.config.{}", ext))
                .collect(),
            marker: "allowedHosts".to_string(),
            anchor: Regex::new(r"defineConfig\(\s*\{").expect("static regex"),
            directive: "\n  server: { host: '0.0.0.0', allowedHosts: true },".to_string(),
        }
    }

    fn applies_to(&self, path: &str) -> bool {
        let file_name = path.rsplit('/').next().unwrap_or(path);
        self.file_names.iter().any(|name| name == file_name)
    }

    /// Returns the rewritten content, or `None` when the file is left alone
    fn rewrite(&self, content: &str) -> Option<String> {
        if content.contains(&self.marker) {
            return None;
        }
        let anchor = self.anchor.find(content)?;

        let mut out = String::with_capacity(content.len() + self.directive.len());
        out.push_str(&content[..anchor.end()]);
        out.push_str(&self.directive);
        out.push_str(&content[anchor.end()..]);
        Some(out)
    }
}

/// Applies every configured rule to a normalized file set
#[derive(Debug, Clone)]
pub struct ManifestTransformer {
    rules: Vec<ManifestRule>,
}

impl Default for ManifestTransformer {
    fn default() -> Self {
        Self::new(vec![ManifestRule::vite_server_binding()])
    }
}

impl ManifestTransformer {
    pub fn new(rules: Vec<ManifestRule>) -> Self {
        Self { rules }
    }

    /// Rewrite matching files in place and return how many changed.
    /// A file whose anchor is missing is skipped, never an error.
    pub fn apply(&self, files: &mut NormalizedFileSet) -> usize {
        let mut rewritten = 0;

        for (path, content) in files.iter_mut() {
            for rule in self.rules.iter().filter(|rule| rule.applies_to(path)) {
                match rule.rewrite(content.as_str()) {
                    Some(updated) => {
                        debug!(path = %path, "Injected dev-server binding");
                        *content = updated;
                        rewritten += 1;
                    }
                    None if !content.contains(&rule.marker) => {
                        warn!(path = %path, "Config anchor not found, leaving file unchanged");
                    }
                    None => {}
                }
            }
        }

        rewritten
    }
}
