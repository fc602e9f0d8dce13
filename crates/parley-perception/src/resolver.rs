//! Frame-by-frame identity resolution.
//!
//! [`IdentityResolver::ingest`] runs one frame through the gate chain
//! (detection, face size, head yaw), matches the surviving embedding against
//! the enrolled set, and records the outcome in the recognition window.
//! [`IdentityResolver::resolve_current`] then votes over the most recent
//! slots: the majority identity wins, but when unmatched frames outnumber
//! every candidate the resolver enrolls a brand-new person from the freshest
//! unmatched embedding. Someone new standing in front of the camera therefore
//! becomes a `face_N` identity within one vote span, without ever stealing an
//! existing id.

use tracing::{debug, info};

use parley_types::PersonId;

use crate::embedding::EmbeddingStore;
use crate::pose::{estimate_yaw_deg, CameraIntrinsics, FaceLandmarks};
use crate::window::{RecognitionWindow, WindowSlot};
use crate::{Frame, PerceptionError};

/// Face bounding box in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width * self.height
    }
}

/// What the face detector reports for one frame.
#[derive(Debug, Clone)]
pub struct FaceObservation {
    pub embedding: Vec<f32>,
    pub bbox: BoundingBox,
    pub landmarks: FaceLandmarks,
}

/// Pluggable face detection + embedding provider.
///
/// Implementations wrap an actual recognition backend; `Ok(None)` means the
/// frame contained no detectable face.
pub trait FaceEmbedder: Send + Sync {
    fn detect(&self, frame: &Frame) -> Result<Option<FaceObservation>, PerceptionError>;
}

/// Resolver tunables. Defaults reflect the sensor and model this was tuned
/// against; override them through the config vault.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Cosine-distance budget for an accepted match.
    pub recognition_threshold: f32,
    /// Faces smaller than this many square pixels are too far away to match.
    pub min_face_area: f32,
    /// Heads turned beyond this yaw produce unreliable embeddings.
    pub max_yaw_deg: f32,
    /// How many recent slots the identity vote spans.
    pub vote_span: usize,
    /// Camera horizontal field of view, degrees.
    pub hfov_deg: f32,
    /// Camera vertical field of view, degrees.
    pub vfov_deg: f32,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            recognition_threshold: 0.55,
            min_face_area: 4500.0,
            max_yaw_deg: 45.0,
            vote_span: 10,
            hfov_deg: 56.3,
            vfov_deg: 43.7,
        }
    }
}

/// Why a frame was rejected before matching, or how it resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// No face in the frame.
    NoFace,
    /// Face present but below the minimum area.
    TooSmall { area: f32 },
    /// Head turned past the yaw limit (or pose unsolvable).
    TurnedAway { yaw_deg: Option<f32> },
    /// Face embedded but matched nobody enrolled.
    Unmatched,
    /// Face matched an enrolled identity.
    Matched(PersonId),
}

/// The result of a window vote.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// An enrolled identity won the vote.
    Known(PersonId),
    /// Unknowns dominated; a fresh identity was enrolled from the given
    /// embedding and snapshot frame.
    Enrolled(PersonId, Vec<f32>, Option<Frame>),
    /// Not enough signal in the window to name anyone.
    Nobody,
}

impl Resolution {
    pub fn person(&self) -> Option<&PersonId> {
        match self {
            Resolution::Known(id) | Resolution::Enrolled(id, _, _) => Some(id),
            Resolution::Nobody => None,
        }
    }
}

/// Stateful per-camera identity resolver.
pub struct IdentityResolver {
    config: ResolverConfig,
    store: EmbeddingStore,
    window: RecognitionWindow,
    intrinsics: Option<CameraIntrinsics>,
    last_box: Option<BoundingBox>,
}

impl IdentityResolver {
    pub fn new(config: ResolverConfig, store: EmbeddingStore) -> Self {
        Self {
            config,
            store,
            window: RecognitionWindow::default(),
            intrinsics: None,
            last_box: None,
        }
    }

    /// The enrolled embedding set (for persistence after enrollment).
    pub fn store(&self) -> &EmbeddingStore {
        &self.store
    }

    /// Bounding box of the face in the most recent frame, if one was
    /// detected. Updated on every [`ingest`](Self::ingest), including frames
    /// the gates reject, so head tracking can follow a face the matcher
    /// cannot use.
    pub fn last_face_box(&self) -> Option<BoundingBox> {
        self.last_box
    }

    /// Intrinsics for the given frame size, derived lazily from the
    /// configured fields of view and cached until the resolution changes.
    fn intrinsics_for(&mut self, frame: &Frame) -> CameraIntrinsics {
        let fresh = CameraIntrinsics::from_fov(
            frame.width,
            frame.height,
            self.config.hfov_deg,
            self.config.vfov_deg,
        );
        match self.intrinsics {
            Some(cached) if cached == fresh => cached,
            _ => {
                self.intrinsics = Some(fresh);
                fresh
            }
        }
    }

    /// Run one frame through the gates and record the outcome in the window.
    pub fn ingest(
        &mut self,
        frame: Frame,
        embedder: &dyn FaceEmbedder,
    ) -> Result<FrameOutcome, PerceptionError> {
        let observation = match embedder.detect(&frame)? {
            Some(obs) => obs,
            None => {
                self.last_box = None;
                self.window.push(WindowSlot::rejected());
                return Ok(FrameOutcome::NoFace);
            }
        };
        self.last_box = Some(observation.bbox);

        let area = observation.bbox.area();
        if area < self.config.min_face_area {
            debug!(area, "face below minimum area, skipping");
            self.window.push(WindowSlot::rejected());
            return Ok(FrameOutcome::TooSmall { area });
        }

        let intrinsics = self.intrinsics_for(&frame);
        match estimate_yaw_deg(&observation.landmarks, &intrinsics) {
            Ok(yaw) if yaw.abs() > self.config.max_yaw_deg => {
                debug!(yaw, "head turned past yaw limit, skipping");
                self.window.push(WindowSlot::rejected());
                return Ok(FrameOutcome::TurnedAway { yaw_deg: Some(yaw) });
            }
            Err(PerceptionError::DegenerateLandmarks) => {
                self.window.push(WindowSlot::rejected());
                return Ok(FrameOutcome::TurnedAway { yaw_deg: None });
            }
            Err(e) => return Err(e),
            Ok(_) => {}
        }

        match self
            .store
            .match_face(&observation.embedding, self.config.recognition_threshold)
        {
            Some(id) => {
                self.window.push(WindowSlot {
                    person: Some(id.clone()),
                    embedding: Some(observation.embedding),
                    frame: Some(frame),
                });
                Ok(FrameOutcome::Matched(id))
            }
            None => {
                // Keep the embedding: it is the enrollment source if the
                // vote decides this face is genuinely new.
                self.window.push(WindowSlot {
                    person: None,
                    embedding: Some(observation.embedding),
                    frame: Some(frame),
                });
                Ok(FrameOutcome::Unmatched)
            }
        }
    }

    /// Vote over the most recent `vote_span` slots.
    ///
    /// An enrolled identity wins when its count beats both every other
    /// candidate and the unmatched count. When unmatched slots strictly
    /// outnumber the best candidate (or no candidate exists at all) the
    /// freshest unmatched embedding is enrolled as a new person. Candidate
    /// ties break toward the identity seen most recently.
    pub fn resolve_current(&mut self) -> Resolution {
        let slots: Vec<&WindowSlot> = self.window.last_n(self.config.vote_span).collect();
        if slots.is_empty() {
            return Resolution::Nobody;
        }

        // (id, count, last index seen) tallies, oldest-first indices.
        let mut tallies: Vec<(PersonId, usize, usize)> = Vec::new();
        let mut none_count = 0usize;
        for (i, slot) in slots.iter().enumerate() {
            match &slot.person {
                Some(id) => match tallies.iter_mut().find(|(t, _, _)| t == id) {
                    Some((_, count, last)) => {
                        *count += 1;
                        *last = i;
                    }
                    None => tallies.push((id.clone(), 1, i)),
                },
                // Every unmatched slot counts against the candidates, whether
                // the gates rejected the frame outright or the embedding just
                // matched nobody. A lone spurious match in a window of
                // no-detects must not win the vote.
                None => none_count += 1,
            }
        }

        let best = tallies
            .iter()
            .max_by_key(|(_, count, last)| (*count, *last))
            .cloned();

        match best {
            Some((id, count, _)) if none_count <= count => {
                debug!(person = id.as_str(), votes = count, "window vote resolved");
                Resolution::Known(id)
            }
            _ => {
                // Unknowns dominate: walk backward to the freshest slot that
                // carries an embedding but matched no one, and enroll it.
                for slot in slots.iter().rev() {
                    if slot.person.is_none() {
                        if let Some(embedding) = slot.embedding.clone() {
                            let id = self.store.enroll(embedding.clone());
                            info!(person = id.as_str(), "enrolled new face");
                            return Resolution::Enrolled(id, embedding, slot.frame.clone());
                        }
                    }
                }
                Resolution::Nobody
            }
        }
    }
}
