//! Data types shared between the core and the HTTP boundary

/// Satisfaction survey submissions.
pub mod feedback;
/// Image records, uploads and search results.
pub mod record;
