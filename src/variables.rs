use serde::{Deserialize, Serialize};

use crate::errors::{AgentError, AgentResult};

/// A variable declared by a unit: a default, an optional per-server
/// override, and a pipe-delimited rule string such as
/// `nullable|string|max:20`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VariableDefinition {
    pub name: String,
    pub default_value: String,
    #[serde(default)]
    pub current_value: Option<String>,
    #[serde(default)]
    pub rules: String,
}

impl VariableDefinition {
    pub fn effective_value(&self) -> &str {
        self.current_value.as_deref().unwrap_or(&self.default_value)
    }

    /// Placeholder token as it appears in scripts: `%name%`, lower-cased
    /// with spaces turned into underscores.
    pub fn placeholder(&self) -> String {
        format!("%{}%", self.name.to_lowercase().replace(' ', "_"))
    }
}

/// Validate every variable and substitute its placeholder into the
/// template. Any rule violation rejects the whole operation. Placeholders
/// with no matching definition are left in place rather than treated as
/// errors, so a typo in a unit never blocks an install outright.
pub fn process(template: &str, variables: &[VariableDefinition]) -> AgentResult<String> {
    let mut output = template.to_string();

    for variable in variables {
        let value = variable.effective_value();
        validate(&variable.name, value, &variable.rules)?;
        output = output.replace(&variable.placeholder(), value);
    }

    Ok(output)
}

fn validate(name: &str, value: &str, rules: &str) -> AgentResult<()> {
    for rule in rules.split('|').map(str::trim).filter(|r| !r.is_empty()) {
        if rule == "nullable" {
            if value.is_empty() {
                return Ok(());
            }
            continue;
        }

        if rule == "string" {
            continue;
        }

        if let Some(limit) = rule.strip_prefix("max:") {
            let limit: usize = limit.parse().map_err(|_| {
                AgentError::ValidationError(format!(
                    "Variable {} has malformed rule {}",
                    name, rule
                ))
            })?;
            if value.len() > limit {
                return Err(AgentError::ValidationError(format!(
                    "Variable {} exceeds maximum length of {}",
                    name, limit
                )));
            }
            continue;
        }

        // Unknown rules are ignored so units can carry rules this daemon
        // does not enforce yet.
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(name: &str, default: &str, current: Option<&str>, rules: &str) -> VariableDefinition {
        VariableDefinition {
            name: name.to_string(),
            default_value: default.to_string(),
            current_value: current.map(str::to_string),
            rules: rules.to_string(),
        }
    }

    #[test]
    fn substitutes_current_over_default() {
        let vars = vec![var("Server Jar", "server.jar", Some("paper.jar"), "string")];
        let out = process("java -jar %server_jar%", &vars).unwrap();
        assert_eq!(out, "java -jar paper.jar");
    }

    #[test]
    fn falls_back_to_default() {
        let vars = vec![var("MEMORY", "1024", None, "string")];
        let out = process("-Xmx%memory%M", &vars).unwrap();
        assert_eq!(out, "-Xmx1024M");
    }

    #[test]
    fn max_rule_rejects_long_values() {
        let vars = vec![var("Name", "abcdef", None, "string|max:5")];
        let err = process("%name%", &vars).unwrap_err();
        assert!(matches!(err, AgentError::ValidationError(_)));
    }

    #[test]
    fn max_rule_accepts_boundary_length() {
        let vars = vec![var("Name", "abcde", None, "string|max:5")];
        assert_eq!(process("%name%", &vars).unwrap(), "abcde");
    }

    #[test]
    fn nullable_short_circuits_empty_value() {
        // max:0 would reject anything non-empty; nullable lets the empty
        // value through before max is ever consulted.
        let vars = vec![var("Flags", "", None, "nullable|max:0")];
        assert_eq!(process("[%flags%]", &vars).unwrap(), "[]");
    }

    #[test]
    fn nullable_does_not_bypass_rules_for_present_values() {
        let vars = vec![var("Flags", "toolong", None, "nullable|max:3")];
        assert!(process("%flags%", &vars).is_err());
    }

    #[test]
    fn unknown_placeholder_is_left_verbatim() {
        // Deliberate leniency: an unmatched token is not an error.
        let vars = vec![var("Known", "x", None, "string")];
        let out = process("%known% %unknown%", &vars).unwrap();
        assert_eq!(out, "x %unknown%");
    }

    #[test]
    fn placeholder_name_is_normalized() {
        let def = var("Server Jar File", "a", None, "");
        assert_eq!(def.placeholder(), "%server_jar_file%");
    }
}
