//! Control-thread node handles and the built-in node library
use std::f32::consts::PI;

use crate::buffer::{ChannelConfig, ChannelCountMode, ChannelInterpretation};
use crate::context::{AudioContextRegistration, AudioNodeId, BaseAudioContext};
use crate::control::{Controller, PlaybackState, Scheduler};
use crate::AudioGraphError;

use lazy_static::lazy_static;

mod adsr;
pub use adsr::*;
mod analyser;
pub use analyser::*;
mod audio_buffer;
pub use audio_buffer::*;
mod biquad_filter;
pub use biquad_filter::*;
mod channel_merger;
pub use channel_merger::*;
mod channel_splitter;
pub use channel_splitter::*;
mod compressor;
pub use compressor::*;
mod constant;
pub use constant::*;
mod convolver;
pub use convolver::*;
mod delay;
pub use delay::*;
mod destination;
pub use destination::*;
mod function;
pub use function::*;
mod gain;
pub use gain::*;
mod noise;
pub use noise::*;
mod oscillator;
pub use oscillator::*;
mod panner;
pub use panner::*;
mod recorder;
pub use recorder::*;
mod stereo_panner;
pub use stereo_panner::*;
mod waveshaper;
pub use waveshaper::*;

/// Frames in one period of the shared oscillator wavetables.
pub(crate) const WAVETABLE_LENGTH: usize = 2048;

lazy_static! {
    /// One full sine period; the oscillator aliases it for every band.
    pub(crate) static ref SINE_TABLE: Vec<f32> = {
        let step = 2. * PI / WAVETABLE_LENGTH as f32;
        (0..WAVETABLE_LENGTH).map(|i| (step * i as f32).sin()).collect()
    };
}

/// A handle to one processing unit of the audio graph.
///
/// Nodes are sources, effects, inspectors, or the destination. Each owns a
/// fixed set of input and output ports created at construction, and wiring
/// ports together is what builds the graph. Handles live on the control
/// thread; the matching DSP code (an [`crate::process::AudioProcessor`])
/// runs on the render thread, and the two are created as a pair through
/// [`BaseAudioContext::register`].
pub trait AudioNode {
    fn registration(&self) -> &AudioContextRegistration;

    fn id(&self) -> &AudioNodeId {
        self.registration().id()
    }
    fn channel_config_raw(&self) -> &ChannelConfig;
    fn channel_config_cloned(&self) -> ChannelConfig {
        self.channel_config_raw().clone()
    }

    /// The context this node was created by and belongs to.
    fn context(&self) -> &BaseAudioContext {
        self.registration().context()
    }

    /// Wire this node's first output into `dest`'s first input.
    ///
    /// Panics when the edge is refused (cycle, foreign context); use
    /// [`AudioNode::connect_at`] to handle the error instead.
    fn connect<'a>(&self, dest: &'a dyn AudioNode) -> &'a dyn AudioNode {
        self.connect_at(dest, 0, 0).unwrap()
    }

    /// Wire output port `output` into `dest`'s input port `input`.
    ///
    /// Wiring an already-connected pair again changes nothing. An edge that
    /// would close a cycle is refused with `BadConnection` and the graph
    /// stays as it was; the edge becomes audible at the next render
    /// quantum.
    fn connect_at<'a>(
        &self,
        dest: &'a dyn AudioNode,
        output: u32,
        input: u32,
    ) -> Result<&'a dyn AudioNode, AudioGraphError> {
        if self.context() != dest.context() {
            return Err(AudioGraphError::BadConnection(
                "nodes belong to different contexts",
            ));
        }

        if output >= self.number_of_outputs() || input >= dest.number_of_inputs() {
            return Err(AudioGraphError::IndexSize);
        }

        self.context()
            .connect_checked(self.id(), dest.id(), output, input)?;

        Ok(dest)
    }

    /// Sever every edge from this node into `dest`.
    ///
    /// Nothing happens when the two are not connected.
    fn disconnect<'a>(&self, dest: &'a dyn AudioNode) -> &'a dyn AudioNode {
        if self.context() != dest.context() {
            panic!("nodes belong to different contexts");
        }

        self.context().disconnect(self.id(), dest.id());

        dest
    }

    /// Sever every outgoing edge of this node.
    fn disconnect_all(&self) {
        self.context().disconnect_all(self.id());
    }

    /// Sever every edge feeding into this node.
    ///
    /// Parameter attachments survive, only signal connections made with
    /// [`AudioNode::connect_at`] are cut.
    fn disconnect_inputs(&self) {
        self.context().disconnect_all_to(self.id());
    }

    /// Number of input ports; zero for source nodes.
    fn number_of_inputs(&self) -> u32;
    /// Number of output ports.
    fn number_of_outputs(&self) -> u32;

    /// How this node's input junctions pick their channel count.
    fn channel_count_mode(&self) -> ChannelCountMode {
        self.channel_config_raw().count_mode()
    }
    fn set_channel_count_mode(&self, v: ChannelCountMode) {
        self.channel_config_raw().set_count_mode(v)
    }
    /// Mixing semantics used when this node's inputs up- or down-mix.
    fn channel_interpretation(&self) -> ChannelInterpretation {
        self.channel_config_raw().interpretation()
    }
    fn set_channel_interpretation(&self, v: ChannelInterpretation) {
        self.channel_config_raw().set_interpretation(v)
    }
    /// Channel count consulted by the `ClampedMax` and `Explicit` modes.
    fn channel_count(&self) -> usize {
        self.channel_config_raw().count()
    }
    fn set_channel_count(&self, v: usize) {
        self.channel_config_raw().set_count(v)
    }
}

/// Common interface of sources that play on a schedule.
///
/// Before its start time and after its stop time a scheduled source renders
/// silence; both times are frame-accurate.
pub trait AudioScheduledSourceNode {
    fn scheduler(&self) -> &Scheduler;

    /// Queue playback to begin at `start` seconds on the context clock.
    ///
    /// A source plays at most once; repeated starts are ignored.
    fn start_at(&self, start: f64) {
        self.scheduler().start_at(start)
    }

    /// Queue playback to end at `stop` seconds on the context clock.
    fn stop_at(&self, stop: f64) {
        self.scheduler().stop_at(stop)
    }

    /// Begin playback right away.
    fn start(&self) {
        self.scheduler().start_at(0.);
    }

    /// End playback right away.
    fn stop(&self) {
        self.scheduler().stop_at(0.);
    }

    /// Where the source currently is in its lifecycle.
    fn playback_state(&self) -> PlaybackState {
        self.scheduler().playback_state()
    }

    /// Run `callback` once when playback ends, whether because the sample
    /// data ran out, the stop time passed, or the source was stopped by
    /// hand.
    fn set_on_ended<F: FnOnce() + Send + 'static>(&self, callback: F)
    where
        Self: Sized,
    {
        self.scheduler().set_on_ended(callback)
    }
}

/// Extra controls of sources that play through sample data: looping over a
/// region, and seeking.
pub trait AudioControllableSourceNode {
    fn controller(&self) -> &Controller;

    /// Whether the playhead wraps around at the loop end.
    fn loop_(&self) -> bool {
        self.controller().loop_()
    }

    fn set_loop(&self, loop_: bool) {
        self.controller().set_loop(loop_)
    }

    /// Start of the loop region, seconds into the sample data.
    fn loop_start(&self) -> f64 {
        self.controller().loop_start()
    }

    fn set_loop_start(&self, loop_start: f64) {
        self.controller().set_loop_start(loop_start)
    }

    /// End of the loop region, seconds into the sample data.
    fn loop_end(&self) -> f64 {
        self.controller().loop_end()
    }

    fn set_loop_end(&self, loop_end: f64) {
        self.controller().set_loop_end(loop_end)
    }

    /// Jump the playhead to `timestamp` seconds into the sample data.
    fn seek(&self, timestamp: f64) {
        self.controller().seek(timestamp)
    }
}
