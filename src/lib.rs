//! A realtime audio-graph processing engine in pure Rust.
//!
//! The engine is organized as a directed graph of signal-processing nodes
//! (sources, effects, a destination). Applications construct nodes on a
//! control thread, wire them together, and a render thread pulls samples
//! through the graph one render quantum at a time, honoring sample-accurate
//! scheduling and parameter automation while the graph is being mutated.
//!
//! # Usage
//!
//! ```no_run
//! use soundgraph::context::{AsBaseAudioContext, AudioContext};
//! use soundgraph::node::{AudioNode, AudioScheduledSourceNode};
//!
//! let context = AudioContext::new(Default::default());
//!
//! let osc = context.create_oscillator();
//! let gain = context.create_gain();
//! gain.gain().set_value(0.5);
//!
//! osc.connect(&gain);
//! gain.connect(&context.destination());
//! osc.start();
//! ```
//!
//! Offline rendering uses the same graph machinery but drives the render
//! thread from the caller, as fast as possible:
//!
//! ```
//! use soundgraph::SampleRate;
//! use soundgraph::context::{AsBaseAudioContext, OfflineAudioContext};
//! use soundgraph::node::{AudioNode, AudioScheduledSourceNode};
//!
//! let mut context = OfflineAudioContext::new(2, 44_100, SampleRate(44_100));
//! let osc = context.create_oscillator();
//! osc.connect(&context.destination());
//! osc.start();
//!
//! let buffer = context.start_rendering();
//! assert_eq!(buffer.sample_len(), 44_100);
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

pub mod analysis;
pub mod buffer;
pub mod bus;
pub mod context;
pub mod control;
pub mod media;
pub mod node;
pub mod param;
pub mod process;
pub mod spatial;

pub(crate) mod graph;
pub(crate) mod message;

#[cfg(not(test))]
pub(crate) mod io;

/// Number of sample-frames processed per render quantum.
///
/// The graph advances in fixed blocks of this many frames; it is the unit of
/// scheduling and the resolution at which graph edits become audible.
pub const RENDER_QUANTUM_SIZE: usize = 128;

/// Maximum number of channels any single bus or node may carry.
pub const MAX_CHANNELS: usize = 32;

/// Sample rate of an audio context or asset, in Hertz.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SampleRate(pub u32);

impl fmt::Display for SampleRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Hz", self.0)
    }
}

/// Errors surfaced synchronously by graph-edit and configuration calls.
///
/// Errors inside the render callback are never surfaced to the caller; the
/// offending node emits silence for that quantum and rendering continues.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AudioGraphError {
    /// Unsupported construction argument (sample rate, fft size, channel
    /// count, malformed curve).
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Connect request that would create a cycle, cross contexts, or exceed
    /// the channel budget. The graph is left untouched.
    #[error("bad connection: {0}")]
    BadConnection(&'static str),

    /// New automation event overlaps an existing value-curve event.
    #[error("automation event overlaps an existing value curve event")]
    TimelineOverlap,

    /// Input or output port index out of range for the node.
    #[error("input or output port index out of bounds")]
    IndexSize,

    /// The external decoder collaborator could not produce a buffer.
    #[error("could not decode audio data: {0}")]
    Decoder(String),

    /// An audio file could not be written.
    #[error("could not encode audio data: {0}")]
    Encoder(String),
}

/// A float64 that can be shared between the control and render threads.
///
/// Stored as raw bits in an `AtomicU64`; sequentially consistent ordering,
/// like the other context atomics.
#[derive(Debug)]
pub(crate) struct AtomicF64 {
    bits: AtomicU64,
}

impl AtomicF64 {
    pub fn new(value: f64) -> Self {
        Self {
            bits: AtomicU64::new(value.to_bits()),
        }
    }

    pub fn load(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }

    pub fn store(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::SeqCst)
    }

    pub fn swap(&self, value: f64) -> f64 {
        f64::from_bits(self.bits.swap(value.to_bits(), Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_f64() {
        let f = AtomicF64::new(2.0);
        assert_eq!(f.load(), 2.0);

        f.store(3.0);
        assert_eq!(f.load(), 3.0);

        assert_eq!(f.swap(f64::NAN), 3.0);
        assert!(f.load().is_nan());
    }
}
