use std::collections::HashMap;
use std::f32::consts::FRAC_PI_2;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;
use vecmath::{
    vec3_cross, vec3_dot, vec3_len, vec3_normalized, vec3_scale, vec3_sub, Vector3,
};

use crate::buffer::{ChannelConfig, ChannelConfigOptions, ChannelCountMode, ChannelInterpretation};
use crate::bus::AudioBus;
use crate::context::{AsBaseAudioContext, AudioContextRegistration, AudioParamId};
use crate::param::{AtomicF32, AudioParam, AudioParamOptions};
use crate::process::{AudioParamValues, AudioProcessor};
use crate::{SampleRate, RENDER_QUANTUM_SIZE};

use super::AudioNode;

/// Input ports 1.. carry the listener state, one mono port per coordinate
/// (see `connect_listener_to_panner`).
const LISTENER_PORTS: usize = 14;

/// Spatialization algorithm of a [`PannerNode`]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PanningModel {
    EqualPower,
    Hrtf,
}

impl From<u32> for PanningModel {
    fn from(i: u32) -> Self {
        match i {
            0 => PanningModel::EqualPower,
            1 => PanningModel::Hrtf,
            _ => unreachable!(),
        }
    }
}

/// Distance attenuation law
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DistanceModel {
    Linear,
    Inverse,
    Exponential,
}

impl From<u32> for DistanceModel {
    fn from(i: u32) -> Self {
        match i {
            0 => DistanceModel::Linear,
            1 => DistanceModel::Inverse,
            2 => DistanceModel::Exponential,
            _ => unreachable!(),
        }
    }
}

/// One measured head-related impulse response pair.
pub struct HrtfKernel {
    /// Azimuth this pair was measured at, degrees in `[-180, 180]` (0 =
    /// straight ahead, positive to the right)
    pub azimuth: f32,
    pub left: Vec<f32>,
    pub right: Vec<f32>,
}

/// A set of HRTF kernels for one sample rate.
///
/// Loading the data is the job of an external collaborator; register the
/// result once per process and every HRTF panner at that rate will use it.
pub struct HrtfDatabase {
    sample_rate: u32,
    kernels: Vec<HrtfKernel>,
}

impl HrtfDatabase {
    pub fn new(sample_rate: u32, mut kernels: Vec<HrtfKernel>) -> Self {
        kernels.sort_by(|a, b| a.azimuth.partial_cmp(&b.azimuth).unwrap());
        Self {
            sample_rate,
            kernels,
        }
    }

    fn nearest(&self, azimuth: f32) -> &HrtfKernel {
        self.kernels
            .iter()
            .min_by(|a, b| {
                (a.azimuth - azimuth)
                    .abs()
                    .partial_cmp(&(b.azimuth - azimuth).abs())
                    .unwrap()
            })
            .expect("empty HRTF database")
    }
}

lazy_static! {
    // process-wide cache keyed by sample rate; loaded lazily, never unloaded
    static ref HRTF_DATABASES: Mutex<HashMap<u32, Arc<HrtfDatabase>>> = Mutex::new(HashMap::new());
}

/// Register an HRTF database for its sample rate.
pub fn register_hrtf_database(database: HrtfDatabase) {
    HRTF_DATABASES
        .lock()
        .unwrap()
        .insert(database.sample_rate, Arc::new(database));
}

fn lookup_hrtf_database(sample_rate: u32) -> Option<Arc<HrtfDatabase>> {
    HRTF_DATABASES.lock().unwrap().get(&sample_rate).cloned()
}

/// Options for constructing a PannerNode
pub struct PannerOptions {
    pub panning_model: PanningModel,
    pub distance_model: DistanceModel,
    pub ref_distance: f32,
    pub max_distance: f32,
    pub rolloff_factor: f32,
    pub cone_inner_angle: f32,
    pub cone_outer_angle: f32,
    pub cone_outer_gain: f32,
    pub channel_config: ChannelConfigOptions,
}

impl Default for PannerOptions {
    fn default() -> Self {
        Self {
            panning_model: PanningModel::EqualPower,
            distance_model: DistanceModel::Inverse,
            ref_distance: 1.,
            max_distance: 10_000.,
            rolloff_factor: 1.,
            cone_inner_angle: 360.,
            cone_outer_angle: 360.,
            cone_outer_gain: 0.,
            channel_config: ChannelConfigOptions {
                count: 2,
                mode: ChannelCountMode::ClampedMax,
                interpretation: ChannelInterpretation::Speakers,
            },
        }
    }
}

struct PannerSettings {
    panning_model: AtomicU32,
    distance_model: AtomicU32,
    ref_distance: AtomicF32,
    max_distance: AtomicF32,
    rolloff_factor: AtomicF32,
    cone_inner_angle: AtomicF32,
    cone_outer_angle: AtomicF32,
    cone_outer_gain: AtomicF32,
    /// current doppler pitch ratio, written by the renderer
    doppler_rate: AtomicF32,
}

/// Positions an incoming stream in 3D space relative to the context's
/// listener: azimuth panning × distance gain × cone gain. Output is always
/// stereo.
pub struct PannerNode {
    registration: AudioContextRegistration,
    channel_config: ChannelConfig,
    position_x: AudioParam,
    position_y: AudioParam,
    position_z: AudioParam,
    orientation_x: AudioParam,
    orientation_y: AudioParam,
    orientation_z: AudioParam,
    velocity_x: AudioParam,
    velocity_y: AudioParam,
    velocity_z: AudioParam,
    settings: Arc<PannerSettings>,
}

impl AudioNode for PannerNode {
    fn registration(&self) -> &AudioContextRegistration {
        &self.registration
    }

    fn channel_config_raw(&self) -> &ChannelConfig {
        &self.channel_config
    }

    fn number_of_inputs(&self) -> u32 {
        1 + LISTENER_PORTS as u32
    }
    fn number_of_outputs(&self) -> u32 {
        1
    }
}

impl PannerNode {
    pub fn new<C: AsBaseAudioContext>(context: &C, options: PannerOptions) -> Self {
        let node = context.base().register(move |registration| {
            let id = registration.id();

            let param = |default_value: f32| AudioParamOptions {
                min_value: f32::MIN,
                max_value: f32::MAX,
                default_value,
            };

            let (position_x, position_x_id) = context.base().create_audio_param(param(0.), id);
            let (position_y, position_y_id) = context.base().create_audio_param(param(0.), id);
            let (position_z, position_z_id) = context.base().create_audio_param(param(0.), id);
            let (orientation_x, orientation_x_id) =
                context.base().create_audio_param(param(1.), id);
            let (orientation_y, orientation_y_id) =
                context.base().create_audio_param(param(0.), id);
            let (orientation_z, orientation_z_id) =
                context.base().create_audio_param(param(0.), id);
            let (velocity_x, velocity_x_id) = context.base().create_audio_param(param(0.), id);
            let (velocity_y, velocity_y_id) = context.base().create_audio_param(param(0.), id);
            let (velocity_z, velocity_z_id) = context.base().create_audio_param(param(0.), id);

            let settings = Arc::new(PannerSettings {
                panning_model: AtomicU32::new(options.panning_model as u32),
                distance_model: AtomicU32::new(options.distance_model as u32),
                ref_distance: AtomicF32::new(options.ref_distance),
                max_distance: AtomicF32::new(options.max_distance),
                rolloff_factor: AtomicF32::new(options.rolloff_factor),
                cone_inner_angle: AtomicF32::new(options.cone_inner_angle),
                cone_outer_angle: AtomicF32::new(options.cone_outer_angle),
                cone_outer_gain: AtomicF32::new(options.cone_outer_gain),
                doppler_rate: AtomicF32::new(1.),
            });

            let render = PannerRenderer {
                position: [position_x_id, position_y_id, position_z_id],
                orientation: [orientation_x_id, orientation_y_id, orientation_z_id],
                velocity: [velocity_x_id, velocity_y_id, velocity_z_id],
                settings: settings.clone(),
                hrtf: HrtfState::Unresolved,
                hrtf_history: vec![],
            };

            let node = PannerNode {
                registration,
                channel_config: options.channel_config.into(),
                position_x,
                position_y,
                position_z,
                orientation_x,
                orientation_y,
                orientation_z,
                velocity_x,
                velocity_y,
                velocity_z,
                settings,
            };

            (node, Box::new(render))
        });

        // wire the listener coordinates into the trailing input ports
        context.base().connect_listener_to_panner(node.id());

        node
    }

    pub fn position_x(&self) -> &AudioParam {
        &self.position_x
    }
    pub fn position_y(&self) -> &AudioParam {
        &self.position_y
    }
    pub fn position_z(&self) -> &AudioParam {
        &self.position_z
    }
    pub fn orientation_x(&self) -> &AudioParam {
        &self.orientation_x
    }
    pub fn orientation_y(&self) -> &AudioParam {
        &self.orientation_y
    }
    pub fn orientation_z(&self) -> &AudioParam {
        &self.orientation_z
    }
    pub fn velocity_x(&self) -> &AudioParam {
        &self.velocity_x
    }
    pub fn velocity_y(&self) -> &AudioParam {
        &self.velocity_y
    }
    pub fn velocity_z(&self) -> &AudioParam {
        &self.velocity_z
    }

    pub fn set_position(&self, x: f32, y: f32, z: f32) {
        self.position_x.set_value(x);
        self.position_y.set_value(y);
        self.position_z.set_value(z);
    }

    pub fn set_orientation(&self, x: f32, y: f32, z: f32) {
        self.orientation_x.set_value(x);
        self.orientation_y.set_value(y);
        self.orientation_z.set_value(z);
    }

    pub fn set_velocity(&self, x: f32, y: f32, z: f32) {
        self.velocity_x.set_value(x);
        self.velocity_y.set_value(y);
        self.velocity_z.set_value(z);
    }

    pub fn panning_model(&self) -> PanningModel {
        self.settings.panning_model.load(Ordering::SeqCst).into()
    }
    pub fn set_panning_model(&self, model: PanningModel) {
        self.settings
            .panning_model
            .store(model as u32, Ordering::SeqCst);
    }

    pub fn distance_model(&self) -> DistanceModel {
        self.settings.distance_model.load(Ordering::SeqCst).into()
    }
    pub fn set_distance_model(&self, model: DistanceModel) {
        self.settings
            .distance_model
            .store(model as u32, Ordering::SeqCst);
    }

    pub fn ref_distance(&self) -> f32 {
        self.settings.ref_distance.load()
    }
    pub fn set_ref_distance(&self, v: f32) {
        self.settings.ref_distance.store(v.max(0.));
    }
    pub fn max_distance(&self) -> f32 {
        self.settings.max_distance.load()
    }
    pub fn set_max_distance(&self, v: f32) {
        self.settings.max_distance.store(v.max(0.));
    }
    pub fn rolloff_factor(&self) -> f32 {
        self.settings.rolloff_factor.load()
    }
    pub fn set_rolloff_factor(&self, v: f32) {
        self.settings.rolloff_factor.store(v.max(0.));
    }
    pub fn set_cone_inner_angle(&self, v: f32) {
        self.settings.cone_inner_angle.store(v);
    }
    pub fn set_cone_outer_angle(&self, v: f32) {
        self.settings.cone_outer_angle.store(v);
    }
    pub fn set_cone_outer_gain(&self, v: f32) {
        self.settings.cone_outer_gain.store(v.clamp(0., 1.));
    }

    /// Doppler pitch ratio computed from the source and listener
    /// velocities, for callers that apply it to their sources.
    pub fn doppler_rate(&self) -> f32 {
        self.settings.doppler_rate.load()
    }
}

enum HrtfState {
    Unresolved,
    Missing,
    Loaded(Arc<HrtfDatabase>),
}

struct PannerRenderer {
    position: [AudioParamId; 3],
    orientation: [AudioParamId; 3],
    velocity: [AudioParamId; 3],
    settings: Arc<PannerSettings>,
    hrtf: HrtfState,
    /// per-ear FIR history for HRTF convolution
    hrtf_history: Vec<f32>,
}

/// Distance gain per the configured attenuation law.
fn distance_gain(
    model: DistanceModel,
    distance: f32,
    ref_distance: f32,
    max_distance: f32,
    rolloff: f32,
) -> f32 {
    match model {
        DistanceModel::Linear => {
            if max_distance <= ref_distance {
                return 1.;
            }
            let d = distance.clamp(ref_distance, max_distance);
            1. - rolloff * (d - ref_distance) / (max_distance - ref_distance)
        }
        DistanceModel::Inverse => {
            let d = distance.max(ref_distance);
            ref_distance / (ref_distance + rolloff * (d - ref_distance))
        }
        DistanceModel::Exponential => {
            let d = distance.max(ref_distance);
            if ref_distance <= 0. {
                return 1.;
            }
            (d / ref_distance).powf(-rolloff)
        }
    }
    .clamp(0., 1.)
}

/// Attenuation of a directional source, 1 inside the inner cone,
/// `outer_gain` outside the outer cone, interpolated between.
fn cone_gain(
    source_position: Vector3<f32>,
    source_orientation: Vector3<f32>,
    listener_position: Vector3<f32>,
    inner_angle: f32,
    outer_angle: f32,
    outer_gain: f32,
) -> f32 {
    if vec3_len(source_orientation) == 0. || (inner_angle >= 360. && outer_angle >= 360.) {
        return 1.;
    }

    let source_to_listener = vec3_sub(listener_position, source_position);
    if vec3_len(source_to_listener) == 0. {
        return 1.;
    }

    let cos_angle = vec3_dot(
        vec3_normalized(source_to_listener),
        vec3_normalized(source_orientation),
    )
    .clamp(-1., 1.);
    let angle = cos_angle.acos().to_degrees().abs();

    let half_inner = inner_angle.abs() / 2.;
    let half_outer = outer_angle.abs() / 2.;

    if angle <= half_inner {
        1.
    } else if angle >= half_outer {
        outer_gain
    } else {
        let fraction = (angle - half_inner) / (half_outer - half_inner);
        1. + fraction * (outer_gain - 1.)
    }
}

/// Azimuth of the source relative to the listener, degrees in `[-180, 180]`
/// (0 straight ahead, positive to the right).
fn azimuth(
    source_position: Vector3<f32>,
    listener_position: Vector3<f32>,
    listener_forward: Vector3<f32>,
    listener_up: Vector3<f32>,
) -> f32 {
    let source_listener = vec3_sub(source_position, listener_position);
    if vec3_len(source_listener) == 0. {
        return 0.;
    }
    let source_listener = vec3_normalized(source_listener);

    let forward = if vec3_len(listener_forward) == 0. {
        [0., 0., -1.]
    } else {
        vec3_normalized(listener_forward)
    };
    let up = if vec3_len(listener_up) == 0. {
        [0., 1., 0.]
    } else {
        listener_up
    };

    let right = vec3_cross(forward, up);
    if vec3_len(right) == 0. {
        return 0.;
    }
    let right = vec3_normalized(right);

    // project the source direction onto the horizontal plane
    let up_projection = vec3_dot(source_listener, up);
    let projected = vec3_sub(source_listener, vec3_scale(up, up_projection));
    if vec3_len(projected) == 0. {
        return 0.;
    }
    let projected = vec3_normalized(projected);

    let mut azimuth = vec3_dot(projected, right).clamp(-1., 1.).acos().to_degrees();

    // source behind the listener
    if vec3_dot(projected, forward) < 0. {
        azimuth = 360. - azimuth;
    }

    // convention: 0 ahead, 90 right
    if azimuth <= 270. {
        90. - azimuth
    } else {
        450. - azimuth
    }
}

impl AudioProcessor for PannerRenderer {
    fn process(
        &mut self,
        inputs: &[AudioBus],
        outputs: &mut [AudioBus],
        params: AudioParamValues,
        _timestamp: f64,
        sample_rate: SampleRate,
    ) {
        let input = &inputs[0];
        let output = &mut outputs[0];

        // listener state arrives on the trailing ports, one value per
        // quantum is enough (k-rate spatialization)
        let listener_value =
            |port: usize| -> f32 { inputs[1 + port].channel_data(0).as_slice()[0] };

        let listener_position = [listener_value(0), listener_value(1), listener_value(2)];
        let listener_forward = [listener_value(3), listener_value(4), listener_value(5)];
        let listener_up = [listener_value(6), listener_value(7), listener_value(8)];
        let listener_velocity = [listener_value(9), listener_value(10), listener_value(11)];
        let doppler_factor = listener_value(12);
        let speed_of_sound = listener_value(13);

        let source_position = [
            params.get(&self.position[0])[0],
            params.get(&self.position[1])[0],
            params.get(&self.position[2])[0],
        ];
        let source_orientation = [
            params.get(&self.orientation[0])[0],
            params.get(&self.orientation[1])[0],
            params.get(&self.orientation[2])[0],
        ];
        let source_velocity = [
            params.get(&self.velocity[0])[0],
            params.get(&self.velocity[1])[0],
            params.get(&self.velocity[2])[0],
        ];

        // doppler pitch ratio, published for sources that consume it
        let doppler = if doppler_factor > 0. && speed_of_sound > 0. {
            let axis = vec3_sub(source_position, listener_position);
            if vec3_len(axis) > 0. {
                let axis = vec3_normalized(axis);
                let listener_projection = vec3_dot(axis, listener_velocity);
                let source_projection = vec3_dot(axis, source_velocity);

                let limit = speed_of_sound / doppler_factor;
                let vl = listener_projection.clamp(-limit, limit);
                let vs = source_projection.clamp(-limit, limit);

                (speed_of_sound - doppler_factor * vl)
                    / (speed_of_sound - doppler_factor * vs)
            } else {
                1.
            }
        } else {
            1.
        };
        self.settings
            .doppler_rate
            .store(if doppler.is_finite() { doppler } else { 1. });

        if input.is_silent() {
            output.set_number_of_channels(2);
            output.make_silent();
            return;
        }

        let distance = vec3_len(vec3_sub(source_position, listener_position));
        let distance_gain = distance_gain(
            self.settings.distance_model.load(Ordering::SeqCst).into(),
            distance,
            self.settings.ref_distance.load(),
            self.settings.max_distance.load(),
            self.settings.rolloff_factor.load(),
        );
        let cone_gain = cone_gain(
            source_position,
            source_orientation,
            listener_position,
            self.settings.cone_inner_angle.load(),
            self.settings.cone_outer_angle.load(),
            self.settings.cone_outer_gain.load(),
        );
        let total_gain = distance_gain * cone_gain;

        let azimuth = azimuth(
            source_position,
            listener_position,
            listener_forward,
            listener_up,
        );

        let model: PanningModel = self.settings.panning_model.load(Ordering::SeqCst).into();
        match model {
            PanningModel::Hrtf => {
                if let HrtfState::Unresolved = self.hrtf {
                    self.hrtf = match lookup_hrtf_database(sample_rate.0) {
                        Some(db) => HrtfState::Loaded(db),
                        None => {
                            log::warn!(
                                "no HRTF database registered for {}, falling back to equal power",
                                sample_rate
                            );
                            HrtfState::Missing
                        }
                    };
                }

                let database = match &self.hrtf {
                    HrtfState::Loaded(db) => Some(db.clone()),
                    _ => None,
                };
                if let Some(database) = database {
                    let kernel = database.nearest(azimuth);
                    self.render_hrtf(input, output, kernel, total_gain);
                    return;
                }

                self.render_equal_power(input, output, azimuth, total_gain);
            }
            PanningModel::EqualPower => {
                self.render_equal_power(input, output, azimuth, total_gain);
            }
        }
    }

    fn tail_time(&self) -> f64 {
        // the FIR history keeps ringing in HRTF mode
        match &self.hrtf {
            HrtfState::Loaded(db) => db
                .kernels
                .first()
                .map(|k| k.left.len() as f64 / db.sample_rate as f64)
                .unwrap_or(0.),
            _ => 0.,
        }
    }
}

impl PannerRenderer {
    fn render_equal_power(
        &mut self,
        input: &AudioBus,
        output: &mut AudioBus,
        azimuth: f32,
        total_gain: f32,
    ) {
        // fold rear sources onto the frontal plane
        let mut azimuth = azimuth.clamp(-180., 180.);
        if azimuth < -90. {
            azimuth = -180. - azimuth;
        } else if azimuth > 90. {
            azimuth = 180. - azimuth;
        }
        let pan = azimuth / 90.;

        let stereo_input = input.number_of_channels() > 1;

        output.set_number_of_channels(2);
        let (left_data, right_data) = output.channels_mut().split_at_mut(1);
        let left = left_data[0].as_mut_slice();
        let right = right_data[0].as_mut_slice();

        let x = if stereo_input {
            if pan <= 0. {
                pan + 1.
            } else {
                pan
            }
        } else {
            (pan + 1.) / 2.
        };
        let gain_left = (x * FRAC_PI_2).cos();
        let gain_right = (x * FRAC_PI_2).sin();

        if stereo_input {
            let in_left = input.channel_data(0).as_slice();
            let in_right = input.channel_data(1).as_slice();

            for i in 0..RENDER_QUANTUM_SIZE {
                if pan <= 0. {
                    left[i] = (in_left[i] + in_right[i] * gain_left) * total_gain;
                    right[i] = in_right[i] * gain_right * total_gain;
                } else {
                    left[i] = in_left[i] * gain_left * total_gain;
                    right[i] = (in_right[i] + in_left[i] * gain_right) * total_gain;
                }
            }
        } else {
            let mono = input.channel_data(0).as_slice();
            for i in 0..RENDER_QUANTUM_SIZE {
                left[i] = mono[i] * gain_left * total_gain;
                right[i] = mono[i] * gain_right * total_gain;
            }
        }
    }

    fn render_hrtf(
        &mut self,
        input: &AudioBus,
        output: &mut AudioBus,
        kernel: &HrtfKernel,
        total_gain: f32,
    ) {
        let taps = kernel.left.len().min(kernel.right.len());
        let history_len = taps + RENDER_QUANTUM_SIZE;
        if self.hrtf_history.len() != history_len {
            self.hrtf_history = vec![0.; history_len];
        }

        // mono mixdown drives both ear convolutions
        let channels = input.number_of_channels() as f32;
        let mut mono = [0f32; RENDER_QUANTUM_SIZE];
        for channel in input.channels() {
            for (acc, &sample) in mono.iter_mut().zip(channel.as_slice()) {
                *acc += sample;
            }
        }
        mono.iter_mut().for_each(|s| *s /= channels);

        // slide the history: oldest `taps` samples stay for the FIR state
        self.hrtf_history.copy_within(RENDER_QUANTUM_SIZE.., 0);
        self.hrtf_history[taps..].copy_from_slice(&mono);

        output.set_number_of_channels(2);
        let (left_data, right_data) = output.channels_mut().split_at_mut(1);
        let left = left_data[0].as_mut_slice();
        let right = right_data[0].as_mut_slice();

        for i in 0..RENDER_QUANTUM_SIZE {
            let mut acc_left = 0.;
            let mut acc_right = 0.;
            for t in 0..taps {
                let sample = self.hrtf_history[taps + i - t];
                acc_left += sample * kernel.left[t];
                acc_right += sample * kernel.right[t];
            }
            left[i] = acc_left * total_gain;
            right[i] = acc_right * total_gain;
        }
    }
}

#[cfg(test)]
mod tests {
    use float_eq::assert_float_eq;

    use super::*;
    use crate::context::{AsBaseAudioContext, OfflineAudioContext};
    use crate::node::AudioScheduledSourceNode;

    #[test]
    fn test_distance_models() {
        // at the reference distance all models are unity
        for &model in [
            DistanceModel::Linear,
            DistanceModel::Inverse,
            DistanceModel::Exponential,
        ]
        .iter()
        {
            assert_float_eq!(distance_gain(model, 1., 1., 100., 1.), 1., abs <= 1e-6);
        }

        // farther away attenuates
        assert_float_eq!(
            distance_gain(DistanceModel::Inverse, 3., 1., 100., 1.),
            1. / 3.,
            abs <= 1e-6
        );
        assert_float_eq!(
            distance_gain(DistanceModel::Exponential, 4., 1., 100., 1.),
            0.25,
            abs <= 1e-6
        );
        assert_float_eq!(
            distance_gain(DistanceModel::Linear, 100., 1., 100., 1.),
            0.,
            abs <= 1e-6
        );
    }

    #[test]
    fn test_cone_gain_directionality() {
        let source = [0., 0., 0.];
        let listener = [0., 0., -1.]; // straight ahead of the source

        // omnidirectional cone
        assert_float_eq!(
            cone_gain(source, [0., 0., -1.], listener, 360., 360., 0.),
            1.,
            abs <= 1e-6
        );

        // facing the listener: inside the inner cone
        assert_float_eq!(
            cone_gain(source, [0., 0., -1.], listener, 90., 180., 0.1),
            1.,
            abs <= 1e-6
        );

        // facing away: outside the outer cone
        assert_float_eq!(
            cone_gain(source, [0., 0., 1.], listener, 90., 180., 0.1),
            0.1,
            abs <= 1e-6
        );
    }

    #[test]
    fn test_azimuth_left_right() {
        let listener = [0., 0., 0.];
        let forward = [0., 0., -1.];
        let up = [0., 1., 0.];

        // source straight ahead
        assert_float_eq!(azimuth([0., 0., -1.], listener, forward, up), 0., abs <= 1e-4);
        // source hard right
        assert_float_eq!(azimuth([1., 0., 0.], listener, forward, up), 90., abs <= 1e-4);
        // source hard left
        assert_float_eq!(azimuth([-1., 0., 0.], listener, forward, up), -90., abs <= 1e-4);
    }

    #[test]
    fn test_panner_places_source_right() {
        let mut context = OfflineAudioContext::new(2, 256, SampleRate(44_100));

        let source = context.create_constant_source();
        let panner = context.create_panner();

        // hard right of the default listener, at the reference distance
        panner.set_position(1., 0., 0.);

        source.connect(&panner);
        panner.connect(&context.destination());
        source.start();

        let buffer = context.start_rendering();

        let left = buffer.channel_data(0).as_slice()[255];
        let right = buffer.channel_data(1).as_slice()[255];

        assert_float_eq!(left, 0., abs <= 1e-4);
        assert_float_eq!(right, 1., abs <= 1e-4);
    }

    #[test]
    fn test_hrtf_without_database_falls_back() {
        let mut context = OfflineAudioContext::new(2, 256, SampleRate(22_050));

        let source = context.create_constant_source();
        let panner = context.create_panner();
        panner.set_panning_model(PanningModel::Hrtf);

        source.connect(&panner);
        panner.connect(&context.destination());
        source.start();

        let buffer = context.start_rendering();

        // centered source through the equal-power fallback
        let expected = std::f32::consts::FRAC_1_SQRT_2;
        assert_float_eq!(
            buffer.channel_data(0).as_slice()[255],
            expected,
            abs <= 1e-4
        );
    }

    #[test]
    fn test_hrtf_database_is_used() {
        // trivial database: direct passthrough left, silent right
        register_hrtf_database(HrtfDatabase::new(
            48_000,
            vec![HrtfKernel {
                azimuth: 0.,
                left: vec![1., 0.],
                right: vec![0., 0.],
            }],
        ));

        let mut context = OfflineAudioContext::new(2, 256, SampleRate(48_000));

        let source = context.create_constant_source();
        let panner = context.create_panner();
        panner.set_panning_model(PanningModel::Hrtf);

        source.connect(&panner);
        panner.connect(&context.destination());
        source.start();

        let buffer = context.start_rendering();

        assert_float_eq!(buffer.channel_data(0).as_slice()[255], 1., abs <= 1e-4);
        assert_float_eq!(buffer.channel_data(1).as_slice()[255], 0., abs <= 1e-4);
    }
}
