use serde::{Deserialize, Serialize};

/// Coarse size classification used by guardrail assessments
/// (`config::GuardrailsConfig`). Distinct from `record::Weight`, which
/// drives phase-sequence selection rather than a size ceiling.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SizeLevel {
    Small,
    Medium,
    Large,
}

impl std::fmt::Display for SizeLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SizeLevel::Small => write!(f, "small"),
            SizeLevel::Medium => write!(f, "medium"),
            SizeLevel::Large => write!(f, "large"),
        }
    }
}

pub fn parse_size_level(s: &str) -> Result<SizeLevel, String> {
    match s.to_lowercase().as_str() {
        "small" | "s" => Ok(SizeLevel::Small),
        "medium" | "m" => Ok(SizeLevel::Medium),
        "large" | "l" => Ok(SizeLevel::Large),
        _ => Err(format!(
            "Invalid size '{}': expected small, medium, or large",
            s
        )),
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DimensionLevel {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for DimensionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DimensionLevel::Low => write!(f, "low"),
            DimensionLevel::Medium => write!(f, "medium"),
            DimensionLevel::High => write!(f, "high"),
        }
    }
}

pub fn parse_dimension_level(s: &str) -> Result<DimensionLevel, String> {
    match s.to_lowercase().as_str() {
        "low" | "l" => Ok(DimensionLevel::Low),
        "medium" | "m" => Ok(DimensionLevel::Medium),
        "high" | "h" => Ok(DimensionLevel::High),
        _ => Err(format!(
            "Invalid level '{}': expected low, medium, or high",
            s
        )),
    }
}
