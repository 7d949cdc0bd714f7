use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Monetizable capabilities that plans gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    DocumentAnalysis,
    AiAssistant,
    CreditScoring,
    FinancialForecast,
    IdentityVerification,
    ReportExport,
    ApiCalls,
    FileStorage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceCategory {
    Ai,
    Analytics,
    Compliance,
    Reporting,
    Integration,
    Storage,
}

impl Feature {
    pub const ALL: [Feature; 8] = [
        Feature::DocumentAnalysis,
        Feature::AiAssistant,
        Feature::CreditScoring,
        Feature::FinancialForecast,
        Feature::IdentityVerification,
        Feature::ReportExport,
        Feature::ApiCalls,
        Feature::FileStorage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::DocumentAnalysis => "document_analysis",
            Feature::AiAssistant => "ai_assistant",
            Feature::CreditScoring => "credit_scoring",
            Feature::FinancialForecast => "financial_forecast",
            Feature::IdentityVerification => "identity_verification",
            Feature::ReportExport => "report_export",
            Feature::ApiCalls => "api_calls",
            Feature::FileStorage => "file_storage",
        }
    }

    pub fn category(&self) -> ServiceCategory {
        match self {
            Feature::DocumentAnalysis | Feature::AiAssistant => ServiceCategory::Ai,
            Feature::CreditScoring | Feature::FinancialForecast => ServiceCategory::Analytics,
            Feature::IdentityVerification => ServiceCategory::Compliance,
            Feature::ReportExport => ServiceCategory::Reporting,
            Feature::ApiCalls => ServiceCategory::Integration,
            Feature::FileStorage => ServiceCategory::Storage,
        }
    }
}

impl ServiceCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceCategory::Ai => "ai",
            ServiceCategory::Analytics => "analytics",
            ServiceCategory::Compliance => "compliance",
            ServiceCategory::Reporting => "reporting",
            ServiceCategory::Integration => "integration",
            ServiceCategory::Storage => "storage",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown feature code '{0}'")]
pub struct UnknownFeature(pub String);

impl FromStr for Feature {
    type Err = UnknownFeature;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Feature::ALL
            .iter()
            .copied()
            .find(|feature| feature.as_str() == value)
            .ok_or_else(|| UnknownFeature(value.to_string()))
    }
}

/// Typed per-feature details attached to a consumption record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "feature", rename_all = "snake_case")]
pub enum ConsumptionContext {
    DocumentAnalysis {
        document_type: String,
        page_count: u32,
    },
    AiAssistant {
        conversation_id: String,
        #[serde(default)]
        model: Option<String>,
    },
    CreditScoring {
        subject_reference: String,
        #[serde(default)]
        bureau: Option<String>,
    },
    FinancialForecast {
        horizon_months: u32,
    },
    IdentityVerification {
        document_country: String,
        check_kind: String,
    },
    ReportExport {
        format: String,
    },
    ApiCalls {
        endpoint: String,
    },
    FileStorage {
        bytes: u64,
        #[serde(default)]
        content_type: Option<String>,
    },
}

impl ConsumptionContext {
    pub fn feature(&self) -> Feature {
        match self {
            ConsumptionContext::DocumentAnalysis { .. } => Feature::DocumentAnalysis,
            ConsumptionContext::AiAssistant { .. } => Feature::AiAssistant,
            ConsumptionContext::CreditScoring { .. } => Feature::CreditScoring,
            ConsumptionContext::FinancialForecast { .. } => Feature::FinancialForecast,
            ConsumptionContext::IdentityVerification { .. } => Feature::IdentityVerification,
            ConsumptionContext::ReportExport { .. } => Feature::ReportExport,
            ConsumptionContext::ApiCalls { .. } => Feature::ApiCalls,
            ConsumptionContext::FileStorage { .. } => Feature::FileStorage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_codes_parse_back() {
        for feature in Feature::ALL {
            assert_eq!(feature.as_str().parse::<Feature>().unwrap(), feature);
        }
        assert!(matches!(
            "teleportation".parse::<Feature>(),
            Err(UnknownFeature(code)) if code == "teleportation"
        ));
    }

    #[test]
    fn categories_follow_feature_groups() {
        assert_eq!(Feature::DocumentAnalysis.category(), ServiceCategory::Ai);
        assert_eq!(Feature::CreditScoring.category(), ServiceCategory::Analytics);
        assert_eq!(Feature::FileStorage.category().as_str(), "storage");
    }

    #[test]
    fn context_is_tagged_by_feature() {
        let context = ConsumptionContext::DocumentAnalysis {
            document_type: "bank_statement".to_string(),
            page_count: 12,
        };
        let encoded = serde_json::to_value(&context).unwrap();
        assert_eq!(encoded["feature"], "document_analysis");
        assert_eq!(context.feature(), Feature::DocumentAnalysis);

        let decoded: ConsumptionContext = serde_json::from_value(serde_json::json!({
            "feature": "api_calls",
            "endpoint": "/v1/score"
        }))
        .unwrap();
        assert_eq!(decoded.feature(), Feature::ApiCalls);
    }
}
