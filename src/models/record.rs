use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Dense feature vector produced by a [`FeatureExtractor`](crate::core::embeddings::FeatureExtractor).
pub type FeatureVector = Vec<f32>;

/// Opaque identifier assigned to a record by the store on insert.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wraps an identifier read back from storage.
    pub fn from_stored(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An image upload as received from the boundary layer.
#[derive(Debug, Clone)]
pub struct ImageUpload {
    /// Original uploaded file name.
    pub filename: String,
    /// Free-form description supplied by the uploader.
    pub description: String,
    /// Free-form topic supplied by the uploader.
    pub topic: String,
    /// Raw encoded image bytes, exactly as uploaded.
    pub bytes: Bytes,
}

/// A record ready to be persisted; the store assigns its identifier.
#[derive(Debug, Clone)]
pub struct NewImageRecord {
    /// Feature vector of the image.
    pub features: FeatureVector,
    /// Original uploaded file name.
    pub filename: String,
    /// Free-form description.
    pub description: String,
    /// Free-form topic.
    pub topic: String,
    /// Raw encoded image bytes in their original container format.
    pub image: Bytes,
}

/// A persisted image record.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRecord {
    /// Identifier assigned on insert.
    pub id: RecordId,
    /// Feature vector; every record in a store has the same length.
    pub features: FeatureVector,
    /// Original uploaded file name.
    pub filename: String,
    /// Free-form description.
    pub description: String,
    /// Free-form topic.
    pub topic: String,
    /// Raw encoded image bytes.
    pub image: Bytes,
}

impl ImageRecord {
    /// Attaches a store-assigned identifier to a new record.
    pub fn from_new(id: RecordId, record: NewImageRecord) -> Self {
        Self {
            id,
            features: record.features,
            filename: record.filename,
            description: record.description,
            topic: record.topic,
            image: record.image,
        }
    }
}

/// A record returned by a similarity query together with its cosine similarity.
#[derive(Debug, Clone)]
pub struct ScoredRecord {
    /// The matched record.
    pub record: ImageRecord,
    /// Cosine similarity to the query, higher is more similar.
    pub score: f32,
}

/// One entry of a search response, shaped for transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedImage {
    /// Original uploaded file name.
    pub filename: String,
    /// Topic of the stored image.
    pub topic: String,
    /// Description of the stored image.
    pub description: String,
    /// MIME type of the stored bytes, e.g. `image/png`.
    pub mime_type: String,
    /// Base64 encoded image bytes.
    pub image: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_ids_are_unique() {
        let a = RecordId::generate();
        let b = RecordId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn test_record_id_serializes_as_string() {
        let id = RecordId::from_stored("abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");
        assert_eq!(id.to_string(), "abc");
    }
}
