//! `${NAME}` substitution.
//!
//! Only the braced form is expanded; a bare `$NAME` is left for the shell or
//! the supervised program. `$${` produces a literal `${`.

use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("unresolved variable(s): {}", .0.join(", "))]
    Unresolved(Vec<String>),
    #[error("unterminated '${{' at byte {0}")]
    Unterminated(usize),
    #[error("invalid variable name '{0}'")]
    InvalidName(String),
}

/// Substitute every `${NAME}` in `template` from `vars`.
///
/// All missing names are reported together.
pub fn substitute(template: &str, vars: &BTreeMap<String, String>) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut missing: Vec<String> = Vec::new();
    let mut rest = template;
    let mut offset = 0;

    while let Some(idx) = rest.find("${") {
        if rest[..idx].ends_with('$') {
            out.push_str(&rest[..idx - 1]);
            out.push_str("${");
            rest = &rest[idx + 2..];
            offset += idx + 2;
            continue;
        }
        out.push_str(&rest[..idx]);
        let after = &rest[idx + 2..];
        let end = after
            .find('}')
            .ok_or(TemplateError::Unterminated(offset + idx))?;
        let name = &after[..end];
        if !is_valid_name(name) {
            return Err(TemplateError::InvalidName(name.to_string()));
        }
        match vars.get(name) {
            Some(value) => out.push_str(value),
            None => {
                if !missing.iter().any(|m| m == name) {
                    missing.push(name.to_string());
                }
            }
        }
        let consumed = idx + 2 + end + 1;
        rest = &rest[consumed..];
        offset += consumed;
    }
    out.push_str(rest);

    if missing.is_empty() {
        Ok(out)
    } else {
        Err(TemplateError::Unresolved(missing))
    }
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
