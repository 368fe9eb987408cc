use std::collections::HashMap;
use std::sync::Arc;

use crate::config::LanguageConfig;
use crate::error::JudgeError;

/// Name of the compiled artifact inside a workspace
pub const EXECUTABLE_NAME: &str = "main";

/// Compile/run command templates for one submission language
///
/// Templates may reference `%INPUT%` (the source file) and `%OUTPUT%` (the
/// executable). Both expand to bare file names relative to the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageTemplate {
    pub name: String,
    pub file_name: String,
    pub compile: Option<Vec<String>>,
    pub run: Vec<String>,
    pub limit_address_space: bool,
}

impl LanguageTemplate {
    pub fn needs_compilation(&self) -> bool {
        self.compile.is_some()
    }

    pub fn compile_command(&self) -> Option<String> {
        self.compile.as_deref().map(|cmd| self.expand(cmd))
    }

    pub fn run_command(&self) -> String {
        self.expand(&self.run)
    }

    fn expand(&self, cmd_template: &[String]) -> String {
        let mut mapping = HashMap::<&str, &str>::new();
        mapping.insert("%INPUT%", &self.file_name);
        mapping.insert("%OUTPUT%", EXECUTABLE_NAME);
        apply_template_and_join(cmd_template, &mapping)
    }
}

impl From<LanguageConfig> for LanguageTemplate {
    fn from(config: LanguageConfig) -> Self {
        Self {
            name: config.name.to_ascii_uppercase(),
            file_name: config.file_name,
            compile: config.compile,
            run: config.run,
            limit_address_space: config.limit_address_space,
        }
    }
}

/// Supported languages, looked up case-insensitively by tag
#[derive(Debug, Clone, Default)]
pub struct LanguageRegistry {
    templates: HashMap<String, Arc<LanguageTemplate>>,
}

impl LanguageRegistry {
    pub fn new(languages: impl IntoIterator<Item = LanguageConfig>) -> Self {
        let templates = languages
            .into_iter()
            .map(LanguageTemplate::from)
            .map(|t| (t.name.clone(), Arc::new(t)))
            .collect();
        Self { templates }
    }

    /// Resolves a submission's language tag, rejecting unknown tags
    pub fn resolve(&self, tag: &str) -> Result<Arc<LanguageTemplate>, JudgeError> {
        self.templates
            .get(&tag.trim().to_ascii_uppercase())
            .cloned()
            .ok_or_else(|| JudgeError::UnsupportedLanguage(tag.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }
}

/// Applies template substitutions to command arguments and joins them
///
/// This function takes a command template (array of strings) and a mapping
/// of placeholders to actual values, then replaces all occurrences and
/// joins the result into a single command string.
fn apply_template_and_join(cmd_template: &[String], mapping: &HashMap<&str, &str>) -> String {
    let replaced: Vec<String> = cmd_template
        .iter()
        .map(|s| {
            let mut t = s.clone();
            for (k, v) in mapping.iter() {
                t = t.replace(k, v);
            }
            t
        })
        .collect();

    replaced.join(" ")
}
