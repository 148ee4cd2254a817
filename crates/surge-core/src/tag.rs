use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestrationError, Result};

/// Canonical identifier of one pipeline execution.
///
/// Renders as `{storm_name}_{storm_year}_{run_id}` and is used verbatim as a
/// storage path prefix, as the value of the compute placement tag, and as the
/// log correlation key. Components are restricted to `[A-Za-z0-9-]` (plus `.`
/// in the run id) so the rendered form is safe both as a path segment and as a
/// cloud tag value. Uniqueness is the caller's responsibility.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunTag {
    storm_name: String,
    storm_year: u16,
    run_id: String,
}

impl RunTag {
    pub fn new(storm_name: &str, storm_year: u16, run_id: &str) -> Result<Self> {
        validate_component("storm_name", storm_name, false)?;
        validate_component("run_id", run_id, true)?;
        Ok(Self {
            storm_name: storm_name.to_string(),
            storm_year,
            run_id: run_id.to_string(),
        })
    }

    pub fn storm_name(&self) -> &str {
        &self.storm_name
    }

    pub fn storm_year(&self) -> u16 {
        self.storm_year
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Prefix shared by every run of the same storm, e.g. `IAN_2022_`.
    pub fn storm_prefix(&self) -> String {
        format!("{}_{}_", self.storm_name, self.storm_year)
    }

    /// Derived tag for a sub-job that needs its own compute claim (ensemble
    /// members run concurrently and must never share an instance).
    pub fn member(&self, suffix: &str) -> Result<Self> {
        RunTag::new(
            &self.storm_name,
            self.storm_year,
            &format!("{}-{}", self.run_id, suffix),
        )
    }
}

impl fmt::Display for RunTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.storm_name, self.storm_year, self.run_id)
    }
}

fn validate_component(field: &'static str, value: &str, allow_dot: bool) -> Result<()> {
    let ok = !value.is_empty()
        && value.len() <= 128
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || (allow_dot && c == '.'))
        && !value.starts_with('.');
    if ok {
        Ok(())
    } else {
        Err(OrchestrationError::InvalidRunTag {
            field,
            value: value.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_name_year_id() {
        let tag = RunTag::new("IAN", 2022, "7").expect("valid tag");
        assert_eq!(tag.to_string(), "IAN_2022_7");
        assert_eq!(tag.storm_prefix(), "IAN_2022_");
    }

    #[test]
    fn rejects_path_and_tag_unsafe_components() {
        assert!(RunTag::new("", 2022, "7").is_err());
        assert!(RunTag::new("IAN/..", 2022, "7").is_err());
        assert!(RunTag::new("IAN", 2022, "a b").is_err());
        assert!(RunTag::new("IAN", 2022, "..").is_err());
        assert!(RunTag::new("IAN_X", 2022, "7").is_err());
        assert!(RunTag::new("florence", 2018, "0c1f-77aa.2").is_ok());
    }

    #[test]
    fn member_tags_extend_the_run_id() {
        let tag = RunTag::new("IAN", 2022, "7").expect("valid tag");
        let member = tag.member("run003").expect("member tag");
        assert_eq!(member.to_string(), "IAN_2022_7-run003");
        assert_eq!(member.storm_prefix(), tag.storm_prefix());
    }
}
