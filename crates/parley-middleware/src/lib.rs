//! # parley-middleware
//!
//! Routes media and side-channel traffic between clients and the dialogue
//! engine without caring about the conversation's meaning.
//!
//! # Modules
//!
//! - [`media`] – Turn payloads, the streamed response chunk format, the
//!   bounded camera frame ring, and the transcription/decoding provider
//!   seam.
//! - [`secondary`] – Registry of secondary lookup handlers keyed by API
//!   name, for structured tasks the dialogue engine delegates outward.

pub mod media;
pub mod secondary;

pub use media::{FrameRing, MediaError, MediaService, ResponseChunk, TurnRequest};
pub use secondary::{LookupRegistry, SecondaryLookup};
