use std::fmt;
use std::str::FromStr;

use hangar_core::Resource;
use serde::{Deserialize, Serialize};

/// Instance annotation overriding the airway's mode.
pub const ANNOTATION_OVERRIDE_MODE: &str = "hangar.dev/override-mode";

/// Which external changes retrigger an instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Only changes to the instance itself.
    #[default]
    Standard,
    /// Like standard; the admission layer additionally blocks edits to release resources.
    Static,
    /// Any change to a resource of a kind the release produced, in the same namespace.
    Dynamic,
    /// Changes to exactly the resources of the active revision.
    Subscription,
}

impl Mode {
    pub const ALL: [Mode; 4] = [Mode::Standard, Mode::Static, Mode::Dynamic, Mode::Subscription];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Standard => "standard",
            Mode::Static => "static",
            Mode::Dynamic => "dynamic",
            Mode::Subscription => "subscription",
        }
    }

    /// Mode for `instance`: a valid override annotation wins over the airway's mode.
    pub fn resolve(instance: &Resource, airway: Mode) -> Mode {
        instance.annotation(ANNOTATION_OVERRIDE_MODE).and_then(|s| s.parse().ok()).unwrap_or(airway)
    }

    /// Whether external changes are routed back to the instance.
    pub fn tracks(&self) -> bool { matches!(self, Mode::Dynamic | Mode::Subscription) }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Mode::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown mode {:?}", s))
    }
}
