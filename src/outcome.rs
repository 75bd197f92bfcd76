//! Response envelope handed to callers outside the crate.
//!
//! Three shapes, distinguished by their keys:
//!
//! ```text
//! {"success": true,  "data": ...}
//! {"success": false, "error": "...", "code": "..."}
//! {"partialSuccess": true, "externalRef": "...", "requiresManualReconciliation": true, "reconciliationId": "..."}
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorClass, ErrorCode};
use crate::settlement::SettlementOutcome;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ApiResponse<T> {
    #[serde(rename_all = "camelCase")]
    PartialSuccess {
        partial_success: bool,
        external_ref: String,
        requires_manual_reconciliation: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reconciliation_id: Option<Uuid>,
    },
    Success {
        success: bool,
        data: T,
    },
    Failure {
        success: bool,
        error: String,
        code: String,
    },
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        ApiResponse::Success {
            success: true,
            data,
        }
    }

    pub fn error<E: ErrorCode + fmt::Display>(err: &E) -> Self {
        ApiResponse::Failure {
            success: false,
            error: err.to_string(),
            code: err.code().to_string(),
        }
    }

    pub fn partial(external_ref: impl Into<String>, reconciliation_id: Option<Uuid>) -> Self {
        ApiResponse::PartialSuccess {
            partial_success: true,
            external_ref: external_ref.into(),
            requires_manual_reconciliation: true,
            reconciliation_id,
        }
    }

    pub fn from_result<E: ErrorCode + fmt::Display>(result: Result<T, E>) -> Self {
        match result {
            Ok(data) => ApiResponse::ok(data),
            Err(err) => ApiResponse::error(&err),
        }
    }

    /// Flatten an orchestrated operation. A divergent outcome becomes a
    /// partial success; the confirmed output becomes the data.
    pub fn from_outcome<E: ErrorCode + fmt::Display>(result: Result<SettlementOutcome<T>, E>) -> Self {
        match result {
            Ok(SettlementOutcome::Confirmed { output, .. }) => ApiResponse::ok(output),
            Ok(SettlementOutcome::Divergent {
                external_ref,
                reconciliation_id,
                ..
            }) => ApiResponse::partial(external_ref, reconciliation_id),
            Err(err) => ApiResponse::error(&err),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ApiResponse::Success { .. })
    }

    pub fn requires_manual_reconciliation(&self) -> bool {
        matches!(self, ApiResponse::PartialSuccess { .. })
    }

    pub fn data(&self) -> Option<&T> {
        match self {
            ApiResponse::Success { data, .. } => Some(data),
            _ => None,
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            ApiResponse::Failure { code, .. } => Some(code),
            _ => None,
        }
    }
}

/// HTTP-style status a transport layer would attach to an error class.
pub fn status_for(class: ErrorClass) -> u16 {
    match class {
        ErrorClass::Validation => 400,
        ErrorClass::DomainState => 409,
        ErrorClass::ExternalTransient => 503,
        ErrorClass::Divergence => 202,
        ErrorClass::Internal => 500,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::money::MoneyError;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_success_shape() {
        let response = ApiResponse::ok(json!({ "amount": "10.00" }));
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value, json!({ "success": true, "data": { "amount": "10.00" } }));
    }

    #[test]
    fn test_failure_shape() {
        let err = MoneyError::PrecisionExceeded {
            amount: dec!(1.001),
            scale: 2,
        };
        let response: ApiResponse<()> = ApiResponse::from_result(Err(err));
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["success"], json!(false));
        assert_eq!(value["code"], json!("INVALID_AMOUNT"));
        assert!(value["error"].as_str().unwrap().contains("1.001"));
    }

    #[test]
    fn test_partial_success_shape() {
        let id = Uuid::new_v4();
        let outcome: Result<SettlementOutcome<u32>, MoneyError> = Ok(SettlementOutcome::Divergent {
            external_ref: "SIM-00000001".into(),
            reconciliation_id: Some(id),
            error: "confirm failed".into(),
        });
        let response = ApiResponse::from_outcome(outcome);
        assert!(response.requires_manual_reconciliation());
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(
            value,
            json!({
                "partialSuccess": true,
                "externalRef": "SIM-00000001",
                "requiresManualReconciliation": true,
                "reconciliationId": id.to_string(),
            })
        );
    }

    #[test]
    fn test_parses_each_shape() {
        let ok: ApiResponse<u32> = serde_json::from_str(r#"{"success":true,"data":7}"#).unwrap();
        assert_eq!(ok.data(), Some(&7));
        let failed: ApiResponse<u32> =
            serde_json::from_str(r#"{"success":false,"error":"nope","code":"NOT_FOUND"}"#).unwrap();
        assert_eq!(failed.code(), Some("NOT_FOUND"));
        let partial: ApiResponse<u32> = serde_json::from_str(
            r#"{"partialSuccess":true,"externalRef":"X","requiresManualReconciliation":true}"#,
        )
        .unwrap();
        assert!(partial.requires_manual_reconciliation());
    }
}
