use serde::{Deserialize, Serialize};

// Rate metadata echoed back to callers alongside a response.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RateMeta {
    pub limit: Option<i64>,
    pub remaining: Option<i64>,
    pub reset_at: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AnalysisResponse {
    pub value: serde_json::Value,
    pub rate: RateMeta,
}
