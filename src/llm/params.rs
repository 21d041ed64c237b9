//! Fixed sampling parameters per named LLM operation.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OperationParams {
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    FeatureExtraction,
    UserRequirements,
    SoftwareRequirements,
    HazardIdentification,
    TestCaseGeneration,
}

impl Operation {
    pub const ALL: [Operation; 5] = [
        Operation::FeatureExtraction,
        Operation::UserRequirements,
        Operation::SoftwareRequirements,
        Operation::HazardIdentification,
        Operation::TestCaseGeneration,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Operation::FeatureExtraction => "feature_extraction",
            Operation::UserRequirements => "user_requirements",
            Operation::SoftwareRequirements => "software_requirements",
            Operation::HazardIdentification => "hazard_identification",
            Operation::TestCaseGeneration => "test_case_generation",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.name() == name)
    }

    pub fn params(&self) -> OperationParams {
        match self {
            Operation::FeatureExtraction => OperationParams { temperature: 0.2, max_tokens: 2000 },
            Operation::UserRequirements => OperationParams { temperature: 0.3, max_tokens: 1200 },
            Operation::SoftwareRequirements => OperationParams { temperature: 0.2, max_tokens: 1500 },
            Operation::HazardIdentification => OperationParams { temperature: 0.1, max_tokens: 2500 },
            Operation::TestCaseGeneration => OperationParams { temperature: 0.3, max_tokens: 1500 },
        }
    }
}

/// Lookup by operation name, e.g. `"hazard_identification"`.
pub fn params_for(name: &str) -> Option<OperationParams> {
    Operation::from_name(name).map(|op| op.params())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for op in Operation::ALL {
            assert_eq!(Operation::from_name(op.name()), Some(op));
        }
        assert_eq!(Operation::from_name("unknown"), None);
    }

    #[test]
    fn test_registry_is_deterministic() {
        let first = params_for("hazard_identification").unwrap();
        let second = params_for("hazard_identification").unwrap();
        assert_eq!(first, second);
        assert_eq!(first.temperature, 0.1);
        assert_eq!(first.max_tokens, 2500);
    }

    #[test]
    fn test_all_operations_have_sane_params() {
        for op in Operation::ALL {
            let params = op.params();
            assert!(params.temperature >= 0.0 && params.temperature <= 1.0);
            assert!(params.max_tokens >= 512);
        }
    }
}
