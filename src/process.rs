//! Audio processing code that runs on the audio rendering thread

use std::collections::HashMap;

use crate::bus::AudioBus;
use crate::context::AudioParamId;
use crate::graph::{Node, NodeIndex};
use crate::SampleRate;

/// Interface for audio processing code that runs on the audio rendering thread.
///
/// Note that the AudioProcessor is typically constructed together with an
/// [`crate::node::AudioNode`] (the user facing object that lives in the
/// control thread). See [`crate::context::BaseAudioContext::register`].
pub trait AudioProcessor: Send {
    /// Render one quantum of audio.
    ///
    /// - `inputs`: summed and mixed buses, one per input port
    /// - `outputs`: buses to fill, one per output port
    /// - `params`: accessor for this processor's parameter buffers
    /// - `timestamp`: time of the start of this render quantum
    /// - `sample_rate`: sample rate of the context
    fn process(
        &mut self,
        inputs: &[AudioBus],
        outputs: &mut [AudioBus],
        params: AudioParamValues,
        timestamp: f64,
        sample_rate: SampleRate,
    );

    /// Clear internal DSP state (delay lines, filter history, envelopes).
    fn reset(&mut self) {}

    /// Seconds of non-silent output this processor can produce after its
    /// input goes silent (reverb decay, delay line contents).
    fn tail_time(&self) -> f64 {
        0.
    }

    /// Seconds of processing delay introduced by this processor.
    fn latency_time(&self) -> f64 {
        0.
    }

    /// Whether the processor outputs silence when all its inputs have been
    /// silent for longer than its tail and latency. Scheduled sources
    /// override this to "not playing".
    fn propagates_silence(&self, now: f64, last_non_silent: f64) -> bool {
        now > last_non_silent + self.tail_time() + self.latency_time()
    }

    /// Whether a scheduled source has played to completion. Finished nodes
    /// whose control handle was dropped are disconnected and reclaimed by
    /// the graph.
    fn finished(&self) -> bool {
        false
    }
}

/// Accessor for current [`crate::param::AudioParam`] values
///
/// Provided to implementations of [`AudioProcessor`] in the render thread
pub struct AudioParamValues<'a> {
    nodes: &'a HashMap<NodeIndex, Node>,
}

impl<'a> AudioParamValues<'a> {
    pub(crate) fn from(nodes: &'a HashMap<NodeIndex, Node>) -> Self {
        Self { nodes }
    }

    pub(crate) fn get_raw(&self, index: &AudioParamId) -> &AudioBus {
        let index: NodeIndex = index.into();
        self.nodes.get(&index).unwrap().get_buffer()
    }

    /// Get the computed values for the given [`crate::param::AudioParam`].
    ///
    /// For both a-rate and k-rate params this returns a slice of length
    /// [`crate::RENDER_QUANTUM_SIZE`]; a k-rate value is broadcast.
    pub fn get(&self, index: &AudioParamId) -> &[f32] {
        self.get_raw(index).channel_data(0).as_slice()
    }
}
