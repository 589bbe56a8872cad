//! Events a module prints on stdout, one JSON object per line

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ModuleEvent {
    #[serde(alias = "activity:started")]
    Started {
        #[serde(default)]
        message: Option<String>,
    },

    #[serde(alias = "activity:info")]
    Info { message: String },

    #[serde(alias = "activity:error")]
    Error { message: String },

    /// Cumulative job counter for the module's subnet
    #[serde(alias = "activity:jobs-completed")]
    JobsCompleted {
        total: u64,
    },
}

impl ModuleEvent {
    pub fn parse(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim())
    }
}
