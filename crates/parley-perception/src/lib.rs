//! # parley-perception
//!
//! The identity side of the dialogue engine: turns a stream of camera frames
//! into a stable person id.
//!
//! Pipeline per frame: a [`FaceEmbedder`] provider detects the face and
//! produces an embedding plus 5 landmarks; the [`IdentityResolver`] rejects
//! frames with no face, a too-small face, or a side-turned head (yaw solved
//! against the camera intrinsics in [`pose`]); surviving embeddings are
//! matched against the [`EmbeddingStore`] by cosine similarity. Every frame
//! outcome lands in the [`RecognitionWindow`] ring buffer, and
//! [`IdentityResolver::resolve_current`] votes over the recent slots,
//! enrolling a new identity when unknowns dominate.
//!
//! [`EmbeddingStore`]: embedding::EmbeddingStore
//! [`RecognitionWindow`]: window::RecognitionWindow
//! [`IdentityResolver`]: resolver::IdentityResolver
//! [`FaceEmbedder`]: resolver::FaceEmbedder

pub mod embedding;
pub mod pose;
pub mod pose_class;
pub mod resolver;
pub mod window;

use thiserror::Error;

/// Errors that can arise from perception operations.
#[derive(Error, Debug)]
pub enum PerceptionError {
    /// The face detection/embedding provider failed on a frame.
    #[error("face embedder error: {0}")]
    Embedder(String),

    /// The 5-point landmark set is degenerate (zero eye span) and no head
    /// pose can be solved from it.
    #[error("degenerate landmarks; head pose unsolvable")]
    DegenerateLandmarks,
}

/// One decoded camera frame.
///
/// The pixel payload is opaque to this crate; providers interpret it.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self { data, width, height }
    }
}
