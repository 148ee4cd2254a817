use std::fmt;

/// Terminal result of one remote job or of an ensemble group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Failed,
    TimedOut,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Succeeded => "succeeded",
            Outcome::Failed => "failed",
            Outcome::TimedOut => "timed_out",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    Info,
    Mesh,
    Setup,
    Solve,
    Visualize,
    Finalize,
    Cleanup,
}

impl Stage {
    pub const ALL: [Stage; 8] = [
        Stage::Init,
        Stage::Info,
        Stage::Mesh,
        Stage::Setup,
        Stage::Solve,
        Stage::Visualize,
        Stage::Finalize,
        Stage::Cleanup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::Info => "info",
            Stage::Mesh => "mesh",
            Stage::Setup => "setup",
            Stage::Solve => "solve",
            Stage::Visualize => "visualize",
            Stage::Finalize => "finalize",
            Stage::Cleanup => "cleanup",
        }
    }

    /// The stage that must succeed before this one may start.
    pub fn predecessor(&self) -> Option<Stage> {
        let idx = Stage::ALL.iter().position(|s| s == self)?;
        idx.checked_sub(1).map(|i| Stage::ALL[i])
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_order_is_linear() {
        assert_eq!(Stage::Init.predecessor(), None);
        assert_eq!(Stage::Mesh.predecessor(), Some(Stage::Info));
        assert_eq!(Stage::Cleanup.predecessor(), Some(Stage::Finalize));
    }
}
