//! `{{variable}}` prompt templates.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Result alias for template operations.
pub type TemplateResult<T> = Result<T, TemplateError>;

/// Errors that can occur during template operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TemplateError {
    /// A placeholder had no value and no default.
    #[error("missing template variable `{name}`")]
    MissingVariable {
        /// Name of the missing variable.
        name: String,
    },

    /// A `{{` was never closed.
    #[error("unterminated placeholder at byte {offset}")]
    Unterminated {
        /// Byte offset of the opening braces.
        offset: usize,
    },
}

/// Variables supplied at render time.
pub type Vars = BTreeMap<String, String>;

/// Prompt text with `{{name}}` placeholders.
///
/// Rendering is single pass: substituted values are never scanned for
/// further placeholders, so tool descriptions or code containing `{{` are
/// inserted verbatim.
///
/// # Examples
///
/// ```
/// use agent_prompts::template::{PromptTemplate, Vars};
///
/// let template = PromptTemplate::new("You are {{role}}.").with_default("role", "an assistant");
/// assert_eq!(template.render(&Vars::new()).unwrap(), "You are an assistant.");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTemplate {
    template: String,
    #[serde(default)]
    defaults: Vars,
}

impl PromptTemplate {
    /// Creates a template from raw text.
    #[must_use]
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            defaults: Vars::new(),
        }
    }

    /// Sets the value used when a render does not supply `name`.
    #[must_use]
    pub fn with_default(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.defaults.insert(name.into(), value.into());
        self
    }

    /// Placeholder names in order of appearance, duplicates included.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError::Unterminated`] for an unclosed `{{`.
    pub fn placeholders(&self) -> TemplateResult<Vec<&str>> {
        let mut names = Vec::new();
        for segment in segments(&self.template) {
            if let Segment::Placeholder(name) = segment? {
                names.push(name);
            }
        }
        Ok(names)
    }

    /// Renders the template. Supplied variables win over defaults.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError::MissingVariable`] when a placeholder has no
    /// value and [`TemplateError::Unterminated`] for an unclosed `{{`.
    pub fn render(&self, vars: &Vars) -> TemplateResult<String> {
        let mut out = String::with_capacity(self.template.len());
        for segment in segments(&self.template) {
            match segment? {
                Segment::Text(text) => out.push_str(text),
                Segment::Placeholder(name) => {
                    let value = vars
                        .get(name)
                        .or_else(|| self.defaults.get(name))
                        .ok_or_else(|| TemplateError::MissingVariable {
                            name: name.to_owned(),
                        })?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }

    /// Returns the raw template string.
    #[must_use]
    pub fn template(&self) -> &str {
        &self.template
    }
}

impl fmt::Display for PromptTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.template)
    }
}

impl From<&str> for PromptTemplate {
    fn from(template: &str) -> Self {
        Self::new(template)
    }
}

enum Segment<'a> {
    Text(&'a str),
    Placeholder(&'a str),
}

fn segments(template: &str) -> impl Iterator<Item = TemplateResult<Segment<'_>>> {
    let mut rest = template;
    let mut offset = 0;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let Some(open) = rest.find("{{") else {
            let text = rest;
            rest = "";
            return Some(Ok(Segment::Text(text)));
        };
        if open > 0 {
            let text = &rest[..open];
            rest = &rest[open..];
            offset += open;
            return Some(Ok(Segment::Text(text)));
        }
        let Some(close) = rest[2..].find("}}") else {
            let at = offset;
            rest = "";
            return Some(Err(TemplateError::Unterminated { offset: at }));
        };
        let name = rest[2..2 + close].trim();
        rest = &rest[close + 4..];
        offset += close + 4;
        Some(Ok(Segment::Placeholder(name)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vars {
        pairs
            .iter()
            .map(|(name, value)| ((*name).to_owned(), (*value).to_owned()))
            .collect()
    }

    #[test]
    fn renders_variables_over_defaults() {
        let template = PromptTemplate::new("{{greeting}} {{ name }}!").with_default("name", "World");
        assert_eq!(
            template.render(&vars(&[("greeting", "Hello")])).unwrap(),
            "Hello World!"
        );
        assert_eq!(
            template
                .render(&vars(&[("greeting", "Hi"), ("name", "Ada")]))
                .unwrap(),
            "Hi Ada!"
        );
    }

    #[test]
    fn missing_variables_error() {
        let err = PromptTemplate::new("Task: {{task}}")
            .render(&Vars::new())
            .unwrap_err();
        assert_eq!(
            err,
            TemplateError::MissingVariable {
                name: "task".into()
            }
        );
    }

    #[test]
    fn substituted_values_are_not_rescanned() {
        let template = PromptTemplate::new("Code: {{code}}");
        let rendered = template.render(&vars(&[("code", "{{not_a_var}}")])).unwrap();
        assert_eq!(rendered, "Code: {{not_a_var}}");
    }

    #[test]
    fn lists_placeholders_and_rejects_unterminated() {
        let template = PromptTemplate::new("{{a}} and {{b}} then {{a}}");
        assert_eq!(template.placeholders().unwrap(), ["a", "b", "a"]);

        let err = PromptTemplate::new("ok {{broken").placeholders().unwrap_err();
        assert_eq!(err, TemplateError::Unterminated { offset: 3 });
    }
}
