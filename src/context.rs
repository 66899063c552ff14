//! Audio contexts: graph ownership, node factories, and the realtime and
//! offline rendering flavors

use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

// well-known ids of the context-owned nodes, assigned by registration order
// at context construction
const DESTINATION_NODE_ID: u64 = 0;
const LISTENER_NODE_ID: u64 = 1;
const LISTENER_PARAM_IDS: Range<u64> = 2..16;

use crate::buffer::AudioBuffer;
use crate::graph::{self, NodeIndex, RenderThread, PARAM_INPUT};
use crate::media;
use crate::message::ControlMessage;
use crate::node::{self, AudioNode};
use crate::param::{AudioParam, AudioParamOptions, AutomationMessage};
use crate::process::AudioProcessor;
use crate::spatial::{AudioListener, AudioListenerNode, AudioListenerParams};
use crate::{AudioGraphError, SampleRate};

#[cfg(not(test))]
use crate::io;

#[cfg(not(test))]
use cpal::{traits::StreamTrait, Stream};

use crossbeam_channel::{Receiver, Sender};

/// Stream configuration supplied at context creation.
///
/// `None` fields fall back to the output device defaults. The sample rate is
/// fixed for the life of the context.
#[derive(Clone, Debug, Default)]
pub struct AudioContextOptions {
    /// Index into the host's output device list
    pub device_index: Option<usize>,
    /// Desired number of output channels
    pub desired_channels: Option<u16>,
    /// Desired sample rate in Hertz
    pub desired_sample_rate: Option<u32>,
}

/// Shared core of the realtime and offline contexts.
///
/// The context owns the audio graph: node creation, topology edits, and the
/// channels to and from the render thread all pass through it. Cloning is
/// cheap, and every clone refers to the same underlying context.
#[derive(Clone)]
pub struct BaseAudioContext {
    inner: Arc<BaseAudioContextInner>,
}

impl PartialEq for BaseAudioContext {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Control-side shadow of the graph topology.
///
/// This is the data guarded by the graph lock: edits are validated here
/// synchronously (cycle detection, idempotence) before they are shipped to
/// the render thread, so a rejected edit leaves both sides untouched.
struct GraphState {
    /// outgoing adjacency, node id -> consumer node ids
    edges: HashMap<u64, HashSet<u64>>,
    /// pending messages while an edit scope is open
    batch: Option<Vec<ControlMessage>>,
    batch_depth: usize,
}

impl GraphState {
    /// true iff `to` can already reach `from` through existing edges
    fn creates_cycle(&self, from: u64, to: u64) -> bool {
        if from == to {
            return true;
        }

        let mut stack = vec![to];
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            if id == from {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(consumers) = self.edges.get(&id) {
                stack.extend(consumers.iter().copied());
            }
        }

        false
    }
}

struct BaseAudioContextInner {
    /// context rate in Hertz, fixed at construction
    sample_rate: SampleRate,
    /// destination channel count
    channels: u32,
    /// source of fresh node ids
    node_id_inc: AtomicU64,
    /// control → render message channel
    render_channel: Sender<ControlMessage>,
    /// frames rendered so far, shared with the render thread
    frames_played: Arc<AtomicU64>,
    /// the graph lock: topology shadow plus edit batching
    graph_state: Mutex<GraphState>,
    /// node state shipped back by the render thread for deallocation
    reclaim: Receiver<graph::Node>,
    /// count of render callbacks that missed their deadline
    underrun_count: Arc<AtomicU64>,
    /// channel configuration of the destination node
    destination_channel_config: crate::buffer::ChannelConfig,
    /// storage behind the on-demand listener handles
    listener_params: Option<AudioListenerParams>,
}

/// Anything that wraps a [`BaseAudioContext`].
///
/// Node factories and graph-wide operations live here, so the realtime and
/// offline context flavors share one API.
pub trait AsBaseAudioContext {
    fn base(&self) -> &BaseAudioContext;

    /// A periodic-waveform source, sine by default.
    fn create_oscillator(&self) -> node::OscillatorNode {
        node::OscillatorNode::new(self.base(), Default::default())
    }

    /// A node scaling its input by the automatable `gain` parameter.
    fn create_gain(&self) -> node::GainNode {
        node::GainNode::new(self.base(), Default::default())
    }

    /// A scheduled source holding a constant, automatable value.
    fn create_constant_source(&self) -> node::ConstantSourceNode {
        node::ConstantSourceNode::new(self.base(), Default::default())
    }

    /// A scheduled source rendering a user callback, one call per channel
    /// per quantum.
    fn create_function<F>(&self, channels: usize, function: F) -> node::FunctionNode
    where
        F: FnMut(&mut [f32], usize, f64) + Send + 'static,
    {
        node::FunctionNode::new(self.base(), channels, function)
    }

    /// A delay line; `max_delay_time` bounds the `delay_time` parameter and
    /// sizes the internal buffer.
    fn create_delay(&self, max_delay_time: f32) -> node::DelayNode {
        let mut opts = node::DelayOptions::default();
        opts.max_delay_time = max_delay_time;
        node::DelayNode::new(self.base(), opts)
    }

    /// A second order IIR filter with the eight standard response shapes.
    fn create_biquad_filter(&self) -> node::BiquadFilterNode {
        node::BiquadFilterNode::new(self.base(), Default::default())
    }

    /// A nonlinear distortion mapping samples through a lookup curve.
    fn create_wave_shaper(&self) -> node::WaveShaperNode {
        node::WaveShaperNode::new(self.base(), Default::default())
    }

    /// Fans a multi-channel stream out to `number_of_outputs` mono outputs.
    fn create_channel_splitter(&self, number_of_outputs: u32) -> node::ChannelSplitterNode {
        let mut opts = node::ChannelSplitterOptions::default();
        opts.number_of_outputs = number_of_outputs;
        node::ChannelSplitterNode::new(self.base(), opts)
    }

    /// Combines `number_of_inputs` mono streams into one multi-channel
    /// stream.
    fn create_channel_merger(&self, number_of_inputs: u32) -> node::ChannelMergerNode {
        let mut opts = node::ChannelMergerOptions::default();
        opts.number_of_inputs = number_of_inputs;
        node::ChannelMergerNode::new(self.base(), opts)
    }

    /// A scheduled source playing back a sample buffer; set a buffer and
    /// call `start()`.
    fn create_buffer_source(&self) -> node::AudioBufferSourceNode {
        node::AudioBufferSourceNode::new(self.base(), Default::default())
    }

    /// Places its input in 3D space relative to the context's listener.
    fn create_panner(&self) -> node::PannerNode {
        node::PannerNode::new(self.base(), Default::default())
    }

    /// Positions its input in the stereo image with an equal-power law.
    fn create_stereo_panner(&self) -> node::StereoPannerNode {
        node::StereoPannerNode::new(self.base(), Default::default())
    }

    /// Convolves its input with an impulse response.
    fn create_convolver(&self) -> node::ConvolverNode {
        node::ConvolverNode::new(self.base(), Default::default())
    }

    /// A dynamics compressor with soft knee and makeup gain.
    fn create_dynamics_compressor(&self) -> node::DynamicsCompressorNode {
        node::DynamicsCompressorNode::new(self.base(), Default::default())
    }

    /// A pass-through inspector exposing frequency- and time-domain
    /// snapshots.
    fn create_analyser(&self) -> node::AnalyserNode {
        node::AnalyserNode::new(self.base(), Default::default())
    }

    /// A pass-through inspector capturing the signal to a WAV file.
    fn create_recorder(&self) -> node::RecorderNode {
        node::RecorderNode::new(self.base(), Default::default())
    }

    /// A gain envelope with note on/off semantics.
    fn create_adsr(&self) -> node::AdsrNode {
        node::AdsrNode::new(self.base(), Default::default())
    }

    /// A scheduled white/pink/brown noise source.
    fn create_noise(&self) -> node::NoiseNode {
        node::NoiseNode::new(self.base(), Default::default())
    }

    /// Decode an audio file into an [`AudioBuffer`] at the context rate.
    ///
    /// Decoding is delegated to the external decoder collaborator; a failure
    /// surfaces here, callers that feed the result to a node may instead
    /// treat it as silence.
    fn decode_audio_data<P: AsRef<Path>>(&self, path: P) -> Result<AudioBuffer, AudioGraphError> {
        media::load_wav_file(path, self.base().sample_rate())
    }

    /// Build an [`AudioParam`] owned by the node `dest`.
    ///
    /// Meant to be called while constructing a node, inside its
    /// [`BaseAudioContext::register`] closure. The returned [`AudioParamId`]
    /// is what the node's renderer uses to read the computed value buffer.
    fn create_audio_param(
        &self,
        opts: AudioParamOptions,
        dest: &AudioNodeId,
    ) -> (AudioParam, AudioParamId) {
        let param = self.base().register(move |registration| {
            let (node, proc) = crate::param::audio_param_pair(opts, registration);

            (node, Box::new(proc))
        });

        // audio params are connected to the reserved param port of their
        // owner so they render first and share its lifetime
        self.base().connect(param.id(), dest, 0, PARAM_INPUT);

        let proc_id = AudioParamId(param.id().0);
        (param, proc_id)
    }

    /// The sink of the graph: everything audible is summed into this node,
    /// whose output feeds the device (or the offline buffer).
    ///
    /// The underlying node is owned by the context and registered at
    /// construction; this hands out a fresh handle to it.
    fn destination(&self) -> node::DestinationNode {
        node::DestinationNode {
            registration: AudioContextRegistration {
                id: AudioNodeId(DESTINATION_NODE_ID),
                context: self.base().clone(),
            },
            channel_count: self.base().channels() as usize,
        }
    }

    /// The listener whose position and orientation spatialize every panner.
    ///
    /// All fourteen fields are automatable params. Like the destination,
    /// the state is owned by the context and the handle is rebuilt on
    /// demand from the well-known param ids.
    fn listener(&self) -> AudioListener {
        let params = self.base().inner.listener_params.as_ref().unwrap();

        let mut ids = LISTENER_PARAM_IDS;
        let mut registration = || AudioContextRegistration {
            id: AudioNodeId(ids.next().unwrap()),
            context: self.base().clone(),
        };

        AudioListener {
            position_x: AudioParam::from_raw_parts(registration(), params.position_x.clone()),
            position_y: AudioParam::from_raw_parts(registration(), params.position_y.clone()),
            position_z: AudioParam::from_raw_parts(registration(), params.position_z.clone()),
            forward_x: AudioParam::from_raw_parts(registration(), params.forward_x.clone()),
            forward_y: AudioParam::from_raw_parts(registration(), params.forward_y.clone()),
            forward_z: AudioParam::from_raw_parts(registration(), params.forward_z.clone()),
            up_x: AudioParam::from_raw_parts(registration(), params.up_x.clone()),
            up_y: AudioParam::from_raw_parts(registration(), params.up_y.clone()),
            up_z: AudioParam::from_raw_parts(registration(), params.up_z.clone()),
            velocity_x: AudioParam::from_raw_parts(registration(), params.velocity_x.clone()),
            velocity_y: AudioParam::from_raw_parts(registration(), params.velocity_y.clone()),
            velocity_z: AudioParam::from_raw_parts(registration(), params.velocity_z.clone()),
            doppler_factor: AudioParam::from_raw_parts(
                registration(),
                params.doppler_factor.clone(),
            ),
            speed_of_sound: AudioParam::from_raw_parts(
                registration(),
                params.speed_of_sound.clone(),
            ),
        }
    }

    /// Register an inspector node (analyser, recorder) to be rendered every
    /// quantum even when nothing consumes its output.
    fn add_automatic_pull_node(&self, node: &dyn AudioNode) {
        let id = node.id().0;
        self.base().send(ControlMessage::AddAutomaticPullNode { id });
    }

    /// Undo [`AsBaseAudioContext::add_automatic_pull_node`].
    fn remove_automatic_pull_node(&self, node: &dyn AudioNode) {
        let id = node.id().0;
        self.base()
            .send(ControlMessage::RemoveAutomaticPullNode { id });
    }

    /// Run several graph edits as one atomic batch.
    ///
    /// Everything issued inside the closure (connects, disconnects,
    /// parameter automation) becomes visible to the render thread in the
    /// same render quantum.
    fn edit<R>(&self, f: impl FnOnce() -> R) -> R {
        self.base().begin_batch();
        let result = f();
        self.base().end_batch();
        result
    }

    /// Sample rate of the context in Hertz, fixed for its whole life.
    fn sample_rate(&self) -> SampleRate {
        self.base().sample_rate()
    }

    /// Time at the start of the next render quantum: seconds of audio
    /// rendered since the context was created.
    fn current_time(&self) -> f64 {
        self.base().current_time()
    }

    /// A registration pointing at the destination, for tests that need one.
    #[cfg(test)]
    fn mock_registration(&self) -> AudioContextRegistration {
        AudioContextRegistration {
            context: self.base().clone(),
            id: AudioNodeId(0),
        }
    }
}

impl AsBaseAudioContext for BaseAudioContext {
    fn base(&self) -> &BaseAudioContext {
        self
    }
}

/// A context rendering its graph to a system audio device in realtime.
pub struct AudioContext {
    base: BaseAudioContext,

    /// device stream handle, kept for suspend/resume
    #[cfg(not(test))] // tests run without a device stream
    stream: Stream,
}

impl AsBaseAudioContext for AudioContext {
    fn base(&self) -> &BaseAudioContext {
        &self.base
    }
}

/// A context rendering its graph into a memory buffer, as fast as possible.
///
/// Per-quantum semantics are identical to realtime rendering; only the
/// driver differs.
pub struct OfflineAudioContext {
    base: BaseAudioContext,

    /// frames to render
    length: usize,
    /// the renderer, driven by this context instead of a device callback
    render: RenderThread,
}

impl AsBaseAudioContext for OfflineAudioContext {
    fn base(&self) -> &BaseAudioContext {
        &self.base
    }
}

impl AudioContext {
    /// Open a realtime context on the configured output device and start
    /// rendering immediately.
    #[cfg(not(test))]
    pub fn new(options: AudioContextOptions) -> Self {
        let io_builder = io::OutputBuilder::new(&options);
        let config = io_builder.config();
        log::debug!("output stream config {:?}", config);

        let sample_rate = SampleRate(config.sample_rate.0);
        let channels = config.channels as u32;

        // communication channels to and from the render thread
        let (sender, receiver) = crossbeam_channel::unbounded();
        let (reclaim_sender, reclaim_receiver) = crossbeam_channel::unbounded();

        let frames_played = Arc::new(AtomicU64::new(0));
        let underrun_count = Arc::new(AtomicU64::new(0));

        // the shared context core comes first, it owns the channel senders
        let base = BaseAudioContext::new(
            sample_rate,
            channels,
            sender,
            frames_played.clone(),
            reclaim_receiver,
            underrun_count.clone(),
        );

        // the renderer moves into the device callback
        let render = RenderThread::new(
            sample_rate,
            channels as usize,
            receiver,
            frames_played,
            reclaim_sender,
        );
        let stream = io_builder.build(render, underrun_count);

        Self { base, stream }
    }

    #[cfg(test)] // tests run without a device stream
    pub fn new(_options: AudioContextOptions) -> Self {
        let sample_rate = SampleRate(44_100);
        let channels = 2;

        let (sender, receiver) = crossbeam_channel::unbounded();
        let (reclaim_sender, reclaim_receiver) = crossbeam_channel::unbounded();

        let frames_played = Arc::new(AtomicU64::new(0));
        let underrun_count = Arc::new(AtomicU64::new(0));

        let base = BaseAudioContext::new(
            sample_rate,
            channels,
            sender,
            frames_played.clone(),
            reclaim_receiver,
            underrun_count,
        );

        // the render thread must outlive the context so graph edit messages
        // have a receiver; without a stream nothing will drive it
        let render = RenderThread::new(
            sample_rate,
            channels as usize,
            receiver,
            frames_played,
            reclaim_sender,
        );
        std::mem::forget(render);

        Self { base }
    }

    /// Pause the device stream. Context time stops advancing and the
    /// hardware is released until [`AudioContext::resume`].
    pub fn suspend(&self) {
        #[cfg(not(test))] // tests run without a device stream
        self.stream.pause().unwrap()
    }

    /// Restart a suspended device stream.
    pub fn resume(&self) {
        #[cfg(not(test))] // tests run without a device stream
        self.stream.play().unwrap()
    }

    /// Number of render callbacks that missed their deadline.
    ///
    /// Each missed deadline produced one quantum of silence; there is no
    /// other recovery action.
    pub fn underrun_count(&self) -> u64 {
        self.base.inner.underrun_count.load(Ordering::SeqCst)
    }
}

/// Opaque identity of a node within its context.
pub struct AudioNodeId(u64);

/// Identity of a parameter's render-side processor.
///
/// Node renderers hold these and resolve the computed value buffers through
/// [`crate::process::AudioParamValues`].
pub struct AudioParamId(u64);

// the raw ids stay private to this module; the graph resolves a param's
// backing node through this conversion alone
impl From<&AudioParamId> for NodeIndex {
    fn from(i: &AudioParamId) -> Self {
        NodeIndex(i.0)
    }
}

/// Ties a node handle to its context and render-side identity.
///
/// Only [`BaseAudioContext::register`] can create one. Dropping the
/// registration is what marks the node's handle as gone, allowing the
/// render thread to reclaim the node once nothing consumes it.
pub struct AudioContextRegistration {
    context: BaseAudioContext,
    id: AudioNodeId,
}

impl AudioContextRegistration {
    pub fn id(&self) -> &AudioNodeId {
        &self.id
    }
    pub fn context(&self) -> &BaseAudioContext {
        &self.context
    }
}

impl Drop for AudioContextRegistration {
    fn drop(&mut self) {
        // context-owned nodes (destination, listener and its params) are
        // never reclaimed; their handles are recreated on demand
        let context_owned = self.id.0 == DESTINATION_NODE_ID
            || self.id.0 == LISTENER_NODE_ID
            || LISTENER_PARAM_IDS.contains(&self.id.0);

        if !context_owned {
            self.context
                .send(ControlMessage::FreeWhenFinished { id: self.id.0 });
        }
    }
}

impl BaseAudioContext {
    fn new(
        sample_rate: SampleRate,
        channels: u32,
        render_channel: Sender<ControlMessage>,
        frames_played: Arc<AtomicU64>,
        reclaim: Receiver<graph::Node>,
        underrun_count: Arc<AtomicU64>,
    ) -> Self {
        let destination_channel_config = crate::buffer::ChannelConfigOptions {
            count: channels as usize,
            mode: crate::buffer::ChannelCountMode::Explicit,
            interpretation: crate::buffer::ChannelInterpretation::Speakers,
        }
        .into();

        let base_inner = BaseAudioContextInner {
            sample_rate,
            channels,
            render_channel,
            node_id_inc: AtomicU64::new(0),
            frames_played,
            graph_state: Mutex::new(GraphState {
                edges: HashMap::new(),
                batch: None,
                batch_depth: 0,
            }),
            reclaim,
            underrun_count,
            destination_channel_config,
            listener_params: None,
        };
        let base = BaseAudioContext {
            inner: Arc::new(base_inner),
        };

        let listener_params = {
            // register the context-owned nodes, then let the handles go:
            // storing them inside the context would cycle the Arc, and both
            // can be rebuilt on demand from their well-known ids
            let dest = node::DestinationNode::new(&base, channels as usize);
            let listener = AudioListenerNode::new(&base);

            // making the listener a param-port dependency of the
            // destination keeps its coordinates rendered every quantum
            // without feeding it audio anywhere
            base.connect(listener.id(), dest.id(), 0, PARAM_INPUT);

            listener.into_fields()
        };

        // the temporary handles are gone, this is the only clone left
        let mut base = base;
        let inner_mut = Arc::get_mut(&mut base.inner).unwrap();
        inner_mut.listener_params = Some(listener_params);

        base
    }

    /// Sample rate of the context in Hertz, fixed for its whole life.
    pub fn sample_rate(&self) -> SampleRate {
        self.inner.sample_rate
    }

    /// Time at the start of the next render quantum: seconds of audio
    /// rendered since the context was created.
    pub fn current_time(&self) -> f64 {
        self.inner.frames_played.load(Ordering::SeqCst) as f64 / self.inner.sample_rate.0 as f64
    }

    /// Channel count of the destination (the hardware, or the offline
    /// buffer).
    pub fn channels(&self) -> u32 {
        self.inner.channels
    }

    /// Channel configuration of the destination node
    pub(crate) fn destination_channel_config(&self) -> &crate::buffer::ChannelConfig {
        &self.inner.destination_channel_config
    }

    /// Create a node handle and its renderer as one operation.
    ///
    /// The closure receives a fresh [`AudioContextRegistration`] and builds
    /// the control-side handle together with the boxed
    /// [`AudioProcessor`] that will run on the render thread. The
    /// processor's registration message is sent after anything the closure
    /// itself registered (typically the node's params), so the renderer
    /// never observes its params missing.
    pub fn register<
        T: node::AudioNode,
        F: FnOnce(AudioContextRegistration) -> (T, Box<dyn AudioProcessor>),
    >(
        &self,
        f: F,
    ) -> T {
        let registration = AudioContextRegistration {
            id: AudioNodeId(self.inner.node_id_inc.fetch_add(1, Ordering::SeqCst)),
            context: self.clone(),
        };
        let id = registration.id.0;

        let (node, processor) = (f)(registration);

        self.send(ControlMessage::RegisterNode {
            id,
            node: processor,
            inputs: node.number_of_inputs() as usize,
            outputs: node.number_of_outputs() as usize,
            channel_config: node.channel_config_cloned(),
        });

        node
    }

    /// Ship a message to the render thread, or park it in the open batch.
    ///
    /// Every message passes through the graph lock, which is what keeps
    /// edits issued together visible together. Node state shipped back by
    /// the render thread is deallocated here, on the control thread.
    pub(crate) fn send(&self, message: ControlMessage) {
        // deallocate nodes the render thread has released; done before
        // taking the lock as dropping node state may run arbitrary drop glue
        for node in self.inner.reclaim.try_iter() {
            drop(node);
        }

        let mut state = self.inner.graph_state.lock().unwrap();
        self.send_locked(&mut state, message);
    }

    fn send_locked(&self, state: &mut GraphState, message: ControlMessage) {
        if let Some(batch) = state.batch.as_mut() {
            batch.push(message);
        } else {
            // ignore failure: the render thread may already be gone during
            // teardown, in which case dropping the message is fine
            let _ = self.inner.render_channel.send(message);
        }
    }

    fn begin_batch(&self) {
        let mut state = self.inner.graph_state.lock().unwrap();
        if state.batch_depth == 0 {
            state.batch = Some(vec![]);
        }
        state.batch_depth += 1;
    }

    fn end_batch(&self) {
        let mut state = self.inner.graph_state.lock().unwrap();
        state.batch_depth -= 1;
        if state.batch_depth == 0 {
            if let Some(messages) = state.batch.take() {
                let _ = self
                    .inner
                    .render_channel
                    .send(ControlMessage::Batch(messages));
            }
        }
    }

    /// Wire up an unvalidated connection (params, internal plumbing).
    pub(crate) fn connect(&self, from: &AudioNodeId, to: &AudioNodeId, output: u32, input: u32) {
        let mut state = self.inner.graph_state.lock().unwrap();
        state.edges.entry(from.0).or_default().insert(to.0);
        self.send_locked(
            &mut state,
            ControlMessage::ConnectNode {
                from: from.0,
                to: to.0,
                output,
                input,
            },
        );
    }

    /// Validated connect for user-facing node wiring.
    ///
    /// Refuses edges that would create a cycle; the graph is left untouched.
    /// Connecting an already-connected pair is an idempotent no-op.
    pub(crate) fn connect_checked(
        &self,
        from: &AudioNodeId,
        to: &AudioNodeId,
        output: u32,
        input: u32,
    ) -> Result<(), AudioGraphError> {
        let mut state = self.inner.graph_state.lock().unwrap();

        if state.creates_cycle(from.0, to.0) {
            return Err(AudioGraphError::BadConnection(
                "connection would create a cycle",
            ));
        }

        state.edges.entry(from.0).or_default().insert(to.0);
        self.send_locked(
            &mut state,
            ControlMessage::ConnectNode {
                from: from.0,
                to: to.0,
                output,
                input,
            },
        );

        Ok(())
    }

    pub(crate) fn disconnect(&self, from: &AudioNodeId, to: &AudioNodeId) {
        let mut state = self.inner.graph_state.lock().unwrap();
        if let Some(consumers) = state.edges.get_mut(&from.0) {
            consumers.remove(&to.0);
        }
        self.send_locked(
            &mut state,
            ControlMessage::DisconnectNode {
                from: from.0,
                to: to.0,
            },
        );
    }

    pub(crate) fn disconnect_all(&self, from: &AudioNodeId) {
        let mut state = self.inner.graph_state.lock().unwrap();
        state.edges.remove(&from.0);
        self.send_locked(&mut state, ControlMessage::DisconnectAll { from: from.0 });
    }

    pub(crate) fn disconnect_all_to(&self, to: &AudioNodeId) {
        let mut state = self.inner.graph_state.lock().unwrap();
        for consumers in state.edges.values_mut() {
            consumers.remove(&to.0);
        }
        self.send_locked(&mut state, ControlMessage::DisconnectAllTo { to: to.0 });
    }

    /// Forward a timeline edit to one parameter's render-side processor.
    ///
    /// The edit rides the main control channel wrapped around the param's
    /// own sender, so automation is applied in order with the surrounding
    /// graph edits rather than racing them.
    pub(crate) fn pass_audio_param_event(
        &self,
        to: &Sender<AutomationMessage>,
        event: AutomationMessage,
    ) {
        self.send(ControlMessage::AudioParamEvent {
            to: to.clone(),
            event,
        });
    }

    /// Attach the AudioListener coordinate outputs to a PannerNode.
    ///
    /// The panner reads them as its trailing input ports, so listener
    /// automation and panner rendering always observe the same quantum.
    pub(crate) fn connect_listener_to_panner(&self, panner: &AudioNodeId) {
        let outputs = LISTENER_PARAM_IDS.end - LISTENER_PARAM_IDS.start;
        for i in 0..outputs as u32 {
            self.connect(&AudioNodeId(LISTENER_NODE_ID), panner, i, i + 1);
        }
    }
}

impl Default for AudioContext {
    fn default() -> Self {
        Self::new(Default::default())
    }
}

impl OfflineAudioContext {
    /// A context that renders `length` frames at `sample_rate` into a
    /// buffer once [`OfflineAudioContext::start_rendering`] is called.
    pub fn new(channels: u32, length: usize, sample_rate: SampleRate) -> Self {
        assert!(sample_rate.0 > 0);

        // communication channels to and from the render thread
        let (sender, receiver) = crossbeam_channel::unbounded();
        let (reclaim_sender, reclaim_receiver) = crossbeam_channel::unbounded();

        let frames_played = Arc::new(AtomicU64::new(0));
        let underrun_count = Arc::new(AtomicU64::new(0));

        // the shared context core comes first, it owns the channel senders
        let base = BaseAudioContext::new(
            sample_rate,
            channels,
            sender,
            frames_played.clone(),
            reclaim_receiver,
            underrun_count,
        );

        // the renderer stays here; start_rendering drives it directly
        let render = RenderThread::new(
            sample_rate,
            channels as usize,
            receiver,
            frames_played,
            reclaim_sender,
        );

        Self {
            base,
            length,
            render,
        }
    }

    /// Render the graph as fast as possible into a buffer of `length`
    /// sample-frames.
    pub fn start_rendering(&mut self) -> AudioBuffer {
        // render in whole quanta, then trim
        let mut buffer = self.render.render_audiobuffer(self.length);
        let _rest = buffer.split_off(self.length);
        buffer
    }

    pub fn length(&self) -> usize {
        self.length
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::AudioScheduledSourceNode;

    fn require_send_sync_static<T: Send + Sync + 'static>(_: T) {}

    #[test]
    fn test_audio_context_registration_traits() {
        let context = OfflineAudioContext::new(1, 0, SampleRate(44_100));
        let registration = context.mock_registration();

        // node handles must be shippable to other threads, which hinges on
        // the registration being Send + Sync + 'static
        require_send_sync_static(registration);
    }

    #[test]
    fn test_sample_rate_and_time() {
        let mut context = OfflineAudioContext::new(1, 256, SampleRate(96_000));
        assert_eq!(context.sample_rate(), SampleRate(96_000));
        assert_eq!(context.current_time(), 0.);

        let _ = context.start_rendering();
        float_eq::assert_float_eq!(context.current_time(), 256. / 96_000., abs_all <= 1e-12);
    }

    #[test]
    fn test_connect_cycle_rejected() {
        let context = OfflineAudioContext::new(1, 128, SampleRate(44_100));

        let a = context.create_gain();
        let b = context.create_gain();
        let c = context.create_gain();

        a.connect(&b);
        b.connect(&c);

        // c -> a closes a cycle
        let result = c.connect_at(&a, 0, 0);
        assert!(matches!(result, Err(AudioGraphError::BadConnection(_))));

        // self-connection is also a cycle
        let result = a.connect_at(&a, 0, 0);
        assert!(matches!(result, Err(AudioGraphError::BadConnection(_))));

        // after a disconnect the edge becomes legal again
        a.disconnect(&b);
        c.connect(&a);
    }

    #[test]
    fn test_connect_invalid_ports() {
        let context = OfflineAudioContext::new(1, 128, SampleRate(44_100));

        let osc = context.create_oscillator();
        let gain = context.create_gain();

        assert!(matches!(
            osc.connect_at(&gain, 1, 0),
            Err(AudioGraphError::IndexSize)
        ));
        assert!(matches!(
            osc.connect_at(&gain, 0, 1),
            Err(AudioGraphError::IndexSize)
        ));
    }

    #[test]
    fn test_edit_scope_batches() {
        let mut context = OfflineAudioContext::new(1, 256, SampleRate(44_100));

        let osc = context.create_oscillator();
        let gain = context.create_gain();

        context.edit(|| {
            osc.connect(&gain);
            gain.connect(&context.destination());
            gain.gain().set_value_at_time(0.5, 0.).unwrap();
            osc.start();
        });

        let buffer = context.start_rendering();
        assert_eq!(buffer.sample_len(), 256);
    }

    #[test]
    fn test_rendering_is_deterministic() {
        let render = || {
            let mut context = OfflineAudioContext::new(1, 1_024, SampleRate(44_100));

            let osc = context.create_oscillator();
            let gain = context.create_gain();
            gain.gain().set_value_at_time(0.5, 0.).unwrap();

            osc.connect(&gain);
            gain.connect(&context.destination());
            osc.start();

            let buffer = context.start_rendering();
            buffer.channel_data(0).as_slice().to_vec()
        };

        // same graph, no randomness: bit-identical output
        assert_eq!(render(), render());
    }

    #[test]
    fn test_disconnect_inputs() {
        let mut context = OfflineAudioContext::new(1, 256, SampleRate(44_100));

        let source = context.create_constant_source();
        let gain = context.create_gain();

        source.connect(&gain);
        gain.connect(&context.destination());
        source.start();

        gain.disconnect_inputs();

        let buffer = context.start_rendering();
        // the source was cut off before the first quantum rendered
        assert!(buffer.channel_data(0).as_slice().iter().all(|&s| s == 0.));
    }

    #[test]
    fn test_offline_rendering_length() {
        let mut context = OfflineAudioContext::new(2, 300, SampleRate(44_100));
        assert_eq!(context.length(), 300);

        let buffer = context.start_rendering();

        // not a multiple of the quantum size, trimmed to the exact length
        assert_eq!(buffer.sample_len(), 300);
        assert_eq!(buffer.number_of_channels(), 2);
    }
}
