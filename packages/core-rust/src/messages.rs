//! JSON request and response bodies for the HTTP API.

use serde::{Deserialize, Serialize};

/// Body of `POST /api/v1/kv`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRecordRequest {
    pub key: String,
    pub value: String,
}

/// Body of `PUT /api/v1/kv/{key}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRecordRequest {
    pub value: String,
}

/// Optional body of `DELETE /api/v1/kv/{key}`.
///
/// Absent body or `soft_delete: true` selects the soft delete; an explicit
/// `soft_delete: false` selects the hard (read-then-replace) delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeleteRecordRequest {
    #[serde(default)]
    pub soft_delete: Option<bool>,
}

impl DeleteRecordRequest {
    /// Which delete variant this request selects.
    #[must_use]
    pub fn mode(&self) -> DeleteMode {
        match self.soft_delete {
            Some(false) => DeleteMode::Hard,
            Some(true) | None => DeleteMode::Soft,
        }
    }
}

/// The two delete paths exposed by the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteMode {
    Soft,
    Hard,
}

/// Uniform error body returned by every failing endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub error: String,
}
