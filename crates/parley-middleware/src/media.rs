//! Media plumbing between clients and the dialogue engine.
//!
//! A client turn arrives as raw audio plus an optional still image; the
//! engine answers with an ordered stream of [`ResponseChunk`]s terminated by
//! a final marker. Alongside the turn channel a camera feed pushes frames
//! into a bounded [`FrameRing`] that identity resolution reads from; the
//! ring drops the oldest frame under pressure so a slow consumer can never
//! stall the feed.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::trace;

use parley_perception::Frame;
use parley_types::{Fragment, FragmentMode};

/// Default camera ring capacity.
pub const FRAME_RING_CAPACITY: usize = 50;

/// Errors that can arise from media handling.
#[derive(Error, Debug)]
pub enum MediaError {
    /// A payload could not be decoded (corrupt audio, unreadable image).
    #[error("media decode error: {0}")]
    Decode(String),
    /// The transcription or decoding provider failed.
    #[error("media provider error: {0}")]
    Provider(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Turn payloads
// ─────────────────────────────────────────────────────────────────────────────

/// One client turn: raw audio, and optionally a still image for vision turns.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub audio: Vec<u8>,
    pub image: Option<Vec<u8>>,
}

impl TurnRequest {
    pub fn audio_only(audio: Vec<u8>) -> Self {
        Self { audio, image: None }
    }

    pub fn with_image(audio: Vec<u8>, image: Vec<u8>) -> Self {
        Self { audio, image: Some(image) }
    }
}

/// One ordered unit of a turn's response stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseChunk {
    pub text: String,
    pub mode: FragmentMode,
    /// `true` exactly once per turn, on the terminating marker.
    pub is_final: bool,
}

impl ResponseChunk {
    pub fn from_fragment(fragment: Fragment) -> Self {
        Self {
            text: fragment.text,
            mode: fragment.mode,
            is_final: false,
        }
    }

    /// The end-of-turn marker: empty text, default mode.
    pub fn final_marker() -> Self {
        Self {
            text: String::new(),
            mode: FragmentMode::Default,
            is_final: true,
        }
    }
}

/// Normalize a raw transcript for dialogue use.
///
/// Transcriptions under two characters are noise (a cough, a truncated
/// syllable); they become the literal `"You"` so the turn still reads as an
/// addressed utterance downstream.
pub fn normalize_transcript(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.chars().count() < 2 {
        "You".to_string()
    } else {
        trimmed.to_string()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MediaService
// ─────────────────────────────────────────────────────────────────────────────

/// Pluggable transcription and image decoding provider.
#[async_trait]
pub trait MediaService: Send + Sync {
    /// Transcribe raw audio into text.
    async fn transcribe(&self, audio: &[u8]) -> Result<String, MediaError>;

    /// Decode a raw image payload into a frame.
    async fn decode_frame(&self, image: &[u8]) -> Result<Frame, MediaError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// FrameRing
// ─────────────────────────────────────────────────────────────────────────────

/// Bounded, shared camera frame buffer. Clone it cheaply; all clones share
/// the same ring.
#[derive(Clone)]
pub struct FrameRing {
    inner: Arc<Mutex<VecDeque<Frame>>>,
    capacity: usize,
}

impl FrameRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity: capacity.max(1),
        }
    }

    /// Push a frame, dropping the oldest when the ring is full.
    pub async fn push(&self, frame: Frame) {
        let mut ring = self.inner.lock().await;
        if ring.len() == self.capacity {
            ring.pop_front();
            trace!("frame ring full, dropped oldest");
        }
        ring.push_back(frame);
    }

    /// The newest frame, if any, without consuming it.
    pub async fn latest(&self) -> Option<Frame> {
        self.inner.lock().await.back().cloned()
    }

    /// Drain every buffered frame, oldest first.
    pub async fn flush(&self) -> Vec<Frame> {
        self.inner.lock().await.drain(..).collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

impl Default for FrameRing {
    fn default() -> Self {
        Self::new(FRAME_RING_CAPACITY)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: u8) -> Frame {
        Frame::new(vec![tag], 2, 2)
    }

    // ── normalize_transcript ─────────────────────────────────────────────────

    #[test]
    fn short_transcripts_become_you() {
        assert_eq!(normalize_transcript(""), "You");
        assert_eq!(normalize_transcript("a"), "You");
        assert_eq!(normalize_transcript("  x  "), "You");
    }

    #[test]
    fn normal_transcripts_are_trimmed() {
        assert_eq!(normalize_transcript("  hello there  "), "hello there");
        assert_eq!(normalize_transcript("hi"), "hi");
    }

    // ── ResponseChunk ────────────────────────────────────────────────────────

    #[test]
    fn final_marker_is_empty_and_final() {
        let marker = ResponseChunk::final_marker();
        assert!(marker.is_final);
        assert!(marker.text.is_empty());
    }

    #[test]
    fn fragment_chunks_are_not_final() {
        let chunk = ResponseChunk::from_fragment(Fragment::speech("hello"));
        assert!(!chunk.is_final);
        assert_eq!(chunk.text, "hello");
        assert_eq!(chunk.mode, FragmentMode::Default);
    }

    // ── FrameRing ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn ring_drops_oldest_when_full() {
        let ring = FrameRing::new(3);
        for tag in 0..5 {
            ring.push(frame(tag)).await;
        }
        assert_eq!(ring.len().await, 3);
        let frames = ring.flush().await;
        let tags: Vec<u8> = frames.iter().map(|f| f.data[0]).collect();
        assert_eq!(tags, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn latest_returns_newest_without_draining() {
        let ring = FrameRing::new(10);
        ring.push(frame(1)).await;
        ring.push(frame(2)).await;
        assert_eq!(ring.latest().await.unwrap().data[0], 2);
        assert_eq!(ring.len().await, 2);
    }

    #[tokio::test]
    async fn flush_empties_the_ring() {
        let ring = FrameRing::new(10);
        ring.push(frame(1)).await;
        ring.flush().await;
        assert!(ring.is_empty().await);
        assert!(ring.latest().await.is_none());
    }

    #[tokio::test]
    async fn clones_share_the_same_ring() {
        let ring = FrameRing::new(10);
        let other = ring.clone();
        ring.push(frame(7)).await;
        assert_eq!(other.latest().await.unwrap().data[0], 7);
    }
}
