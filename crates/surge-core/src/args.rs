use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestrationError, Result};
use crate::tag::RunTag;

/// One argv entry (or environment value) of a remote job.
///
/// `Template` entries are resolved immediately before the backend call is
/// formatted: `{tag}` becomes the RunTag and any other `{name}` is looked up
/// in the variables bound on the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Arg {
    Literal(String),
    Template(String),
}

impl Arg {
    pub fn lit(value: impl ToString) -> Self {
        Arg::Literal(value.to_string())
    }

    pub fn tmpl(pattern: impl Into<String>) -> Self {
        Arg::Template(pattern.into())
    }

    pub fn resolve(&self, tag: &RunTag, vars: &BTreeMap<String, String>) -> Result<String> {
        match self {
            Arg::Literal(v) => Ok(v.clone()),
            Arg::Template(pattern) => render_template(pattern, tag, vars),
        }
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Arg::Literal(value.to_string())
    }
}

impl From<String> for Arg {
    fn from(value: String) -> Self {
        Arg::Literal(value)
    }
}

pub fn resolve_all(
    args: &[Arg],
    tag: &RunTag,
    vars: &BTreeMap<String, String>,
) -> Result<Vec<String>> {
    args.iter().map(|a| a.resolve(tag, vars)).collect()
}

fn render_template(pattern: &str, tag: &RunTag, vars: &BTreeMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(pattern.len() + 32);
    let mut rest = pattern;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after.find('}').ok_or_else(|| {
            OrchestrationError::Dispatch(format!("unterminated placeholder in {:?}", pattern))
        })?;
        let name = &after[..close];
        if name == "tag" {
            out.push_str(&tag.to_string());
        } else if let Some(value) = vars.get(name) {
            out.push_str(value);
        } else {
            return Err(OrchestrationError::Dispatch(format!(
                "unknown placeholder {{{}}} in {:?}",
                name, pattern
            )));
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
