//! Language registry: build/run commands and default limits per toolbox

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::core::{LimitsOverride, ResourceLimits};

/// Embedded default language table
const BUILTIN_LANGUAGES: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/languages.toml"));

/// Configuration for a supported programming language
#[derive(Debug, Clone)]
pub struct LanguageSpec {
    /// Canonical language id (e.g., "cpp")
    pub id: String,
    /// Name of the source file (e.g., "main.cpp")
    pub source_file: String,
    /// Compile command (None for interpreted languages)
    pub compile_command: Option<Vec<String>>,
    /// Run command
    pub run_command: Vec<String>,
    /// Toolbox image the docker backend runs commands in
    pub image: String,
    /// Compile step timeout; None means the service default
    pub compile_timeout: Option<Duration>,
    /// Default limits for jobs in this language
    pub default_limits: ResourceLimits,
}

impl LanguageSpec {
    pub fn needs_compile(&self) -> bool {
        self.compile_command.is_some()
    }
}

/// Raw TOML configuration for a language
#[derive(Debug, Deserialize)]
struct RawLanguageConfig {
    source_file: String,
    compile_command: Option<String>,
    run_command: String,
    image: Option<String>,
    compile_timeout_ms: Option<u64>,
    #[serde(default)]
    limits: LimitsOverride,
    #[serde(default)]
    aliases: Vec<String>,
}

/// Read-only lookup table from language id to `LanguageSpec`
#[derive(Debug, Default)]
pub struct LanguageRegistry {
    languages: HashMap<String, Arc<LanguageSpec>>,
    aliases: HashMap<String, String>,
}

impl LanguageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry built from the embedded `files/languages.toml`
    pub fn builtin(defaults: &ResourceLimits) -> anyhow::Result<Self> {
        Self::from_toml(BUILTIN_LANGUAGES, defaults)
    }

    /// Load a language table from a TOML file
    pub fn load(path: impl AsRef<Path>, defaults: &ResourceLimits) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read language config {:?}", path))?;
        Self::from_toml(&content, defaults)
    }

    /// Parse a language table; limits missing from a language fall back to `defaults`
    pub fn from_toml(content: &str, defaults: &ResourceLimits) -> anyhow::Result<Self> {
        let raw_configs: HashMap<String, RawLanguageConfig> =
            toml::from_str(content).context("Invalid language configuration")?;

        let mut registry = Self::new();
        for (name, raw) in raw_configs {
            let run_command = into_command(&raw.run_command);
            if run_command.is_empty() {
                anyhow::bail!("Empty run_command for {}", name);
            }
            let compile_command = raw.compile_command.map(|cmd| into_command(&cmd));
            if matches!(&compile_command, Some(cmd) if cmd.is_empty()) {
                anyhow::bail!("Empty compile_command for {}", name);
            }

            let spec = LanguageSpec {
                id: name.to_lowercase(),
                source_file: raw.source_file,
                compile_command,
                run_command,
                image: raw.image.unwrap_or_else(|| format!("{}-toolbox", name.to_lowercase())),
                compile_timeout: raw.compile_timeout_ms.map(Duration::from_millis),
                default_limits: defaults.with_override(&raw.limits),
            };
            registry.register(spec, &raw.aliases);
        }

        Ok(registry)
    }

    /// Add or replace a language. Administrative operation; done before the
    /// registry is shared with workers.
    pub fn register(&mut self, spec: LanguageSpec, aliases: &[String]) {
        let id = spec.id.to_lowercase();
        for alias in aliases {
            self.aliases.insert(alias.to_lowercase(), id.clone());
        }
        self.languages.insert(id, Arc::new(spec));
    }

    /// Remove a language and its aliases
    pub fn remove(&mut self, language: &str) -> Option<Arc<LanguageSpec>> {
        let id = language.to_lowercase();
        let removed = self.languages.remove(&id)?;
        self.aliases.retain(|_, target| *target != id);
        Some(removed)
    }

    /// Look up a language by id or alias
    pub fn lookup(&self, language: &str) -> Option<Arc<LanguageSpec>> {
        let key = language.to_lowercase();
        let id = self.aliases.get(&key).unwrap_or(&key);
        self.languages.get(id).cloned()
    }

    /// Canonical ids of all supported languages, sorted
    pub fn languages(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.languages.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.languages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.languages.is_empty()
    }
}

fn into_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const TEST_CONFIG: &str = r#"
[c]
source_file = "main.c"
compile_command = "gcc -o main main.c"
run_command = "./main"

[python]
source_file = "main.py"
run_command = "python3 main.py"
aliases = ["py", "python3"]

[python.limits]
wall_time_ms = 2000
"#;

    #[test]
    fn test_load_languages() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{}", TEST_CONFIG).unwrap();

        let registry = LanguageRegistry::load(file.path(), &ResourceLimits::default()).unwrap();
        assert_eq!(registry.languages(), vec!["c", "python"]);

        let c = registry.lookup("C").unwrap();
        assert!(c.needs_compile());
        assert_eq!(c.compile_command.as_ref().unwrap()[0], "gcc");
        assert_eq!(c.image, "c-toolbox");
    }

    #[test]
    fn test_aliases_and_limit_defaults() {
        let defaults = ResourceLimits::default();
        let registry = LanguageRegistry::from_toml(TEST_CONFIG, &defaults).unwrap();

        let py = registry.lookup("py").unwrap();
        assert_eq!(py.id, "python");
        assert!(!py.needs_compile());
        assert_eq!(py.default_limits.wall_time_ms, 2000);
        assert_eq!(py.default_limits.memory_mb, defaults.memory_mb);
        assert!(registry.lookup("python3").is_some());
        assert!(registry.lookup("cobol").is_none());
    }

    #[test]
    fn test_register_and_remove() {
        let mut registry = LanguageRegistry::from_toml(TEST_CONFIG, &ResourceLimits::default()).unwrap();
        registry.register(
            LanguageSpec {
                id: "sh".into(),
                source_file: "main.sh".into(),
                compile_command: None,
                run_command: vec!["sh".into(), "main.sh".into()],
                image: "busybox".into(),
                compile_timeout: None,
                default_limits: ResourceLimits::default(),
            },
            &["shell".to_string()],
        );
        assert_eq!(registry.lookup("shell").unwrap().id, "sh");

        assert!(registry.remove("python").is_some());
        assert!(registry.lookup("py").is_none());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_rejects_empty_run_command() {
        let config = r#"
[broken]
source_file = "x"
run_command = "   "
"#;
        assert!(LanguageRegistry::from_toml(config, &ResourceLimits::default()).is_err());
    }

    #[test]
    fn test_builtin_languages() {
        let registry = LanguageRegistry::builtin(&ResourceLimits::default()).unwrap();
        let cpp = registry.lookup("cpp").unwrap();
        assert_eq!(cpp.source_file, "main.cpp");
        assert_eq!(cpp.run_command, vec!["./main"]);
        assert_eq!(cpp.image, "cpp-toolbox");
        assert_eq!(registry.lookup("c++").unwrap().id, "cpp");
        assert!(registry.lookup("java").unwrap().needs_compile());
    }
}
