use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A satisfaction survey submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feedback {
    /// The rating as submitted; not interpreted.
    pub rate: String,
    /// Optional free-form comment, empty when omitted.
    pub comment: String,
    /// When the submission was received.
    pub submitted_at: DateTime<Utc>,
}

impl Feedback {
    /// Creates a submission stamped with the current time.
    pub fn new(rate: impl Into<String>, comment: Option<String>) -> Self {
        Self {
            rate: rate.into(),
            comment: comment.unwrap_or_default(),
            submitted_at: Utc::now(),
        }
    }
}
