use crate::device::DeviceReport;
use crate::repository::RepositoryError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Status classification attached to every operation outcome
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok,
    Created,
    BadRequest,
    InternalServerError,
}

/// Structured result returned by every manager operation
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Outcome<T> {
    pub is_success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,
    pub status: StatusCode,
}

/// Errors raised by the scheduling and interlock engine
#[derive(Debug, thiserror::Error)]
pub enum RigError {
    /// Bad input or invariant violation; nothing was touched
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("Persistence failed: {0}")]
    Persistence(#[from] RepositoryError),
    /// A write was not confirmed by read-back
    #[error("Actuation fault: {}", describe_faults(.0))]
    Actuation(Vec<DeviceReport>),
    /// Cache and storage diverged; a programming error, never recoverable
    #[error("Internal inconsistency: {0}")]
    InternalInconsistency(String),
    #[error("The Pump does not exist.")]
    NoPumpConfigured,
}

impl StatusCode {
    pub fn code(&self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::Created => 201,
            StatusCode::BadRequest => 400,
            StatusCode::InternalServerError => 500,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StatusCode::Ok | StatusCode::Created)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl RigError {
    pub fn validation(message: impl Into<String>) -> Self {
        RigError::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        RigError::NotFound(message.into())
    }

    pub fn inconsistency(message: impl Into<String>) -> Self {
        RigError::InternalInconsistency(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            RigError::Validation(_) | RigError::NotFound(_) | RigError::NoPumpConfigured => {
                StatusCode::BadRequest
            }
            RigError::Persistence(e) => e.status(),
            RigError::Actuation(_) | RigError::InternalInconsistency(_) => {
                StatusCode::InternalServerError
            }
        }
    }

    /// Devices that failed read-back, if this is an actuation fault
    pub fn faults(&self) -> &[DeviceReport] {
        match self {
            RigError::Actuation(reports) => reports,
            _ => &[],
        }
    }
}

fn describe_faults(reports: &[DeviceReport]) -> String {
    reports
        .iter()
        .filter(|r| !r.is_ok())
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl<T> Outcome<T> {
    pub fn ok(result: T) -> Self {
        Self {
            is_success: true,
            message: None,
            result: Some(result),
            status: StatusCode::Ok,
        }
    }

    pub fn created(result: T) -> Self {
        Self {
            status: StatusCode::Created,
            ..Self::ok(result)
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn from_error(error: &RigError) -> Self {
        Self {
            is_success: false,
            message: Some(error.to_string()),
            result: None,
            status: error.status(),
        }
    }

    /// Failed outcome that still carries a payload, e.g. per-device reports
    pub fn failure_with(error: &RigError, result: T) -> Self {
        Self {
            result: Some(result),
            ..Self::from_error(error)
        }
    }
}

impl Outcome<()> {
    pub fn done(message: impl Into<String>) -> Self {
        Self {
            is_success: true,
            message: Some(message.into()),
            result: None,
            status: StatusCode::Ok,
        }
    }
}

impl Outcome<Vec<DeviceReport>> {
    /// Successful only if every device read back what was commanded
    pub fn from_reports(reports: Vec<DeviceReport>, message: impl Into<String>) -> Self {
        if reports.iter().all(DeviceReport::is_ok) {
            Outcome::ok(reports).with_message(message)
        } else {
            let error = RigError::Actuation(reports.clone());
            Outcome::failure_with(&error, reports)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::PinState;

    fn report(requested: PinState, actual: PinState) -> DeviceReport {
        DeviceReport {
            id: 1,
            name: "V1".to_string(),
            pin_no: 17,
            requested,
            actual,
        }
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(RigError::validation("x").status(), StatusCode::BadRequest);
        assert_eq!(RigError::not_found("x").status(), StatusCode::BadRequest);
        assert_eq!(RigError::NoPumpConfigured.status(), StatusCode::BadRequest);
        assert_eq!(
            RigError::Actuation(vec![]).status(),
            StatusCode::InternalServerError
        );
        assert_eq!(
            RigError::from(RepositoryError::Storage("disk full".into())).status(),
            StatusCode::InternalServerError
        );
    }

    #[test]
    fn test_reports_aggregate_into_outcome() {
        let fine = Outcome::from_reports(vec![report(PinState::High, PinState::High)], "ok");
        assert!(fine.is_success);
        assert_eq!(fine.status, StatusCode::Ok);

        let faulty = Outcome::from_reports(
            vec![
                report(PinState::High, PinState::High),
                report(PinState::High, PinState::Low),
            ],
            "ok",
        );
        assert!(!faulty.is_success);
        assert_eq!(faulty.status, StatusCode::InternalServerError);
        assert_eq!(faulty.result.map(|r| r.len()), Some(2));
        assert!(faulty.message.unwrap().contains("expected HIGH, read LOW"));
    }

    #[test]
    fn test_outcome_serializes_camel_case() {
        let outcome = Outcome::created(7u32).with_message("added");
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["isSuccess"], true);
        assert_eq!(json["status"], "Created");
        assert_eq!(json["result"], 7);
    }
}
