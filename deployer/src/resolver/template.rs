//! `{{placeholder}}` substitution for command templates
//!
//! Single braces pass through untouched so JSON request bodies need no
//! escaping.

use std::collections::BTreeMap;

/// Substitute every `{{name}}` in `template` from `vars`
///
/// Whitespace inside the braces is ignored. Returns the first unknown
/// placeholder name as the error.
pub fn render(template: &str, vars: &BTreeMap<String, String>) -> Result<String, String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| format!("unterminated placeholder near '{}'", &rest[start..]))?;
        let name = after[..end].trim();
        let value = vars
            .get(name)
            .ok_or_else(|| format!("unknown placeholder '{}'", name))?;
        out.push_str(value);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}
