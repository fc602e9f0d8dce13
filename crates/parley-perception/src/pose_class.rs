//! Coarse head-pose classification for conversational gating.
//!
//! Separate from the landmark yaw solve in [`pose`][crate::pose]: this is a
//! whole-frame classifier (typically a vision-language model scoring text
//! prompts against the image) whose labels gate what the dialogue engine is
//! allowed to do. A `front` face can rescue a turn the state classifier
//! called bad input; a `side` or absent face forces the turn to be dropped.

use std::collections::VecDeque;

use crate::{Frame, PerceptionError};

/// Minimum classifier confidence for a label to count as signal.
pub const MIN_CONFIDENCE: f32 = 0.5;

/// Span of the rolling majority vote.
pub const VOTE_SPAN: usize = 10;

/// Coarse head-pose classes the classifier can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FacePoseClass {
    /// Facing the camera.
    Front,
    /// Slightly turned, still engaged.
    SlightSide,
    /// Turned away.
    Side,
    /// No face in view (or confidence below the floor).
    Absent,
}

impl FacePoseClass {
    /// Whether this pose counts as facing the robot.
    pub fn is_engaged(&self) -> bool {
        matches!(self, FacePoseClass::Front | FacePoseClass::SlightSide)
    }
}

/// One classified frame: the winning class and its confidence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseScore {
    pub class: FacePoseClass,
    pub confidence: f32,
}

/// Pluggable whole-frame pose classifier.
pub trait PoseClassifier: Send + Sync {
    fn classify(&self, frame: &Frame) -> Result<PoseScore, PerceptionError>;
}

/// Rolling majority vote over recent pose classifications.
///
/// Scores below [`MIN_CONFIDENCE`] degrade to [`FacePoseClass::Absent`] so a
/// hesitant classifier never flips the gate open.
#[derive(Debug)]
pub struct PoseVote {
    recent: VecDeque<FacePoseClass>,
    span: usize,
}

impl PoseVote {
    pub fn new(span: usize) -> Self {
        Self {
            recent: VecDeque::with_capacity(span),
            span: span.max(1),
        }
    }

    pub fn record(&mut self, score: PoseScore) {
        let class = if score.confidence < MIN_CONFIDENCE {
            FacePoseClass::Absent
        } else {
            score.class
        };
        if self.recent.len() == self.span {
            self.recent.pop_front();
        }
        self.recent.push_back(class);
    }

    /// The majority class over the vote span; [`FacePoseClass::Absent`] when
    /// no frames have been recorded. Ties break toward the class seen most
    /// recently.
    pub fn current(&self) -> FacePoseClass {
        let mut tallies: Vec<(FacePoseClass, usize, usize)> = Vec::new();
        for (i, class) in self.recent.iter().enumerate() {
            match tallies.iter_mut().find(|(c, _, _)| c == class) {
                Some((_, count, last)) => {
                    *count += 1;
                    *last = i;
                }
                None => tallies.push((*class, 1, i)),
            }
        }
        tallies
            .into_iter()
            .max_by_key(|(_, count, last)| (*count, *last))
            .map_or(FacePoseClass::Absent, |(class, _, _)| class)
    }
}

impl Default for PoseVote {
    fn default() -> Self {
        Self::new(VOTE_SPAN)
    }
}
