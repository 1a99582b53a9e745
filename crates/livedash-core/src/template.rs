//! `${name}` template resolution against dashboard variables.

use std::collections::HashMap;

/// Variable name to current value.
pub type VariableBindings = HashMap<String, String>;

/// Substitute every `${name}` in `template` with its bound value.
///
/// Unknown names and unterminated placeholders are left intact, so a
/// resolved subject that still contains `${` is detectably incomplete.
pub fn resolve_template(template: &str, vars: &VariableBindings) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let name = &after[..end];
        match vars.get(name) {
            Some(value) => out.push_str(value),
            None => out.push_str(&rest[start..start + 2 + end + 1]),
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}
