//! ADTS (AAC) frame format
//!
//! Segments carry concatenated ADTS frames; the consumer only needs to
//! split them and to synthesize silence, never to decode.

pub mod adts;

pub use adts::{silent_frame, split_frames, SAMPLES_PER_FRAME};
