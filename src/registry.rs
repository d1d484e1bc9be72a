//! Static mapping from language tags to sandbox images.

use crate::error::{Result, SandboxError};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// How one language is materialized and executed inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LanguageSpec {
    /// Name of the single source file written into the workspace.
    pub file: String,
    /// Sandbox image reference.
    pub image: String,
    /// Build+run command line, executed by `bash -c` in the workspace.
    pub command: String,
}

impl LanguageSpec {
    pub fn new(file: impl Into<String>, image: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            image: image.into(),
            command: command.into(),
        }
    }
}

const BUILTIN: &[(&str, &str, &str, &str)] = &[
    ("cpp", "main.cpp", "cpp-runner", "g++ main.cpp -o main.out && ./main.out"),
    ("python", "main.py", "py-runner", "python3 main.py"),
    ("java", "Main.java", "java-runner", "javac Main.java && java Main"),
    ("javascript", "main.js", "js-runner", "node main.js"),
    ("go", "main.go", "go-runner", "go run main.go"),
    ("ruby", "main.rb", "ruby-runner", "ruby main.rb"),
    ("php", "main.php", "php-runner", "php main.php"),
    ("rust", "main.rs", "rust-runner", "rustc main.rs -o main.out && ./main.out"),
    ("swift", "main.swift", "swift-runner", "swift main.swift"),
    (
        "csharp",
        "Program.cs",
        "csharp-runner",
        "dotnet new console -o app --no-restore && mv Program.cs app/Program.cs || true && cd app && dotnet run",
    ),
];

/// Read-only language table, shared by every session.
///
/// Lookups are exact: a tag that is not in the table is rejected, never
/// mapped to some default language.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    languages: BTreeMap<String, LanguageSpec>,
}

impl Registry {
    pub fn builtin() -> Self {
        let languages = BUILTIN
            .iter()
            .map(|(lang, file, image, command)| (lang.to_string(), LanguageSpec::new(*file, *image, *command)))
            .collect();
        Self { languages }
    }

    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, LanguageSpec)>,
        S: Into<String>,
    {
        Self {
            languages: entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Builtin table with entries from a JSON object file layered on top.
    pub fn with_overrides(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(SandboxError::io("read language table"))?;
        let mut registry = Self::builtin();
        registry.merge_json(&raw)?;
        Ok(registry)
    }

    fn merge_json(&mut self, raw: &str) -> Result<()> {
        let entries: BTreeMap<String, LanguageSpec> =
            serde_json::from_str(raw).map_err(|e| SandboxError::Registry(e.to_string()))?;
        for (lang, spec) in entries {
            validate(&lang, &spec)?;
            self.languages.insert(lang, spec);
        }
        Ok(())
    }

    pub fn resolve(&self, language: &str) -> Result<&LanguageSpec> {
        self.languages
            .get(language)
            .ok_or_else(|| SandboxError::UnsupportedLanguage(language.to_string()))
    }

    /// Supported tags, sorted.
    pub fn languages(&self) -> Vec<&str> {
        self.languages.keys().map(String::as_str).collect()
    }
}

fn validate(lang: &str, spec: &LanguageSpec) -> Result<()> {
    if lang.is_empty() {
        return Err(SandboxError::Registry("empty language tag".into()));
    }
    // The file lands directly in the workspace root.
    if spec.file.is_empty() || spec.file.contains('/') || spec.file == "." || spec.file == ".." {
        return Err(SandboxError::Registry(format!("{lang}: invalid file name {:?}", spec.file)));
    }
    if spec.image.trim().is_empty() || spec.command.trim().is_empty() {
        return Err(SandboxError::Registry(format!("{lang}: image and command are required")));
    }
    Ok(())
}
