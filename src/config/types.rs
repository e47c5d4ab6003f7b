use serde::{Deserialize, Serialize};

use crate::device::constants::{LB_TO_KG, POLL_INTERVAL};

/// Unit readings are displayed in. The session always reports pounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayUnit {
    Lb,
    Kg,
}

impl DisplayUnit {
    pub fn convert(&self, value: f64) -> f64 {
        match self {
            DisplayUnit::Lb => value,
            DisplayUnit::Kg => value * LB_TO_KG,
        }
    }

    pub fn toggled(&self) -> DisplayUnit {
        match self {
            DisplayUnit::Lb => DisplayUnit::Kg,
            DisplayUnit::Kg => DisplayUnit::Lb,
        }
    }
}

impl std::fmt::Display for DisplayUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let result = match self {
            DisplayUnit::Lb => "lb",
            DisplayUnit::Kg => "kg",
        };

        write!(f, "{}", result)
    }
}

impl std::str::FromStr for DisplayUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lb" | "lbs" => Ok(DisplayUnit::Lb),
            "kg" => Ok(DisplayUnit::Kg),
            other => Err(format!("unknown unit {:?}, expected lb or kg", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub poll_interval_ms: u64,
    pub display_unit: DisplayUnit,
    // connect to the first discovered peripheral with a name containing this
    pub device_name: Option<String>,
    pub scan_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            poll_interval_ms: POLL_INTERVAL,
            display_unit: DisplayUnit::Lb,
            device_name: None,
            scan_timeout_secs: 10,
        }
    }
}
