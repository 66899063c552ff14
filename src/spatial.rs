//! The AudioListener: spatial state consulted by panner nodes
//!
//! Listener state lives in a hidden node owned by the context. Each
//! coordinate is a full [`AudioParam`], so automation curves can steer the
//! listener; the panner reads the computed per-quantum buffers through its
//! trailing input ports (see `connect_listener_to_panner`).

use crate::buffer::{ChannelConfig, ChannelConfigOptions, ChannelCountMode, ChannelInterpretation};
use crate::bus::AudioBus;
use crate::context::{AudioContextRegistration, AudioParamId, BaseAudioContext};
use crate::context::AsBaseAudioContext;
use crate::node::AudioNode;
use crate::param::{AudioParam, AudioParamOptions, AudioParamRaw};
use crate::process::{AudioParamValues, AudioProcessor};
use crate::SampleRate;

/// Default speed of sound in meters per second, used for doppler shift.
pub const SPEED_OF_SOUND: f32 = 343.;

/// Spatial state of the person listening to the audio scene.
///
/// All fields are audio-rate automatable parameters.
pub struct AudioListener {
    pub position_x: AudioParam,
    pub position_y: AudioParam,
    pub position_z: AudioParam,
    pub forward_x: AudioParam,
    pub forward_y: AudioParam,
    pub forward_z: AudioParam,
    pub up_x: AudioParam,
    pub up_y: AudioParam,
    pub up_z: AudioParam,
    pub velocity_x: AudioParam,
    pub velocity_y: AudioParam,
    pub velocity_z: AudioParam,
    pub doppler_factor: AudioParam,
    pub speed_of_sound: AudioParam,
}

impl AudioListener {
    pub fn set_position(&self, x: f32, y: f32, z: f32) {
        self.position_x.set_value(x);
        self.position_y.set_value(y);
        self.position_z.set_value(z);
    }

    pub fn set_orientation(&self, fx: f32, fy: f32, fz: f32, ux: f32, uy: f32, uz: f32) {
        self.forward_x.set_value(fx);
        self.forward_y.set_value(fy);
        self.forward_z.set_value(fz);
        self.up_x.set_value(ux);
        self.up_y.set_value(uy);
        self.up_z.set_value(uz);
    }

    pub fn set_velocity(&self, x: f32, y: f32, z: f32) {
        self.velocity_x.set_value(x);
        self.velocity_y.set_value(y);
        self.velocity_z.set_value(z);
    }
}

/// Raw parts of the listener params, stored inside the context so listener
/// handles can be reconstructed on demand.
pub(crate) struct AudioListenerParams {
    pub position_x: AudioParamRaw,
    pub position_y: AudioParamRaw,
    pub position_z: AudioParamRaw,
    pub forward_x: AudioParamRaw,
    pub forward_y: AudioParamRaw,
    pub forward_z: AudioParamRaw,
    pub up_x: AudioParamRaw,
    pub up_y: AudioParamRaw,
    pub up_z: AudioParamRaw,
    pub velocity_x: AudioParamRaw,
    pub velocity_y: AudioParamRaw,
    pub velocity_z: AudioParamRaw,
    pub doppler_factor: AudioParamRaw,
    pub speed_of_sound: AudioParamRaw,
}

/// Hidden context-owned node that publishes the listener params, one mono
/// output per coordinate.
pub(crate) struct AudioListenerNode {
    registration: AudioContextRegistration,
    channel_config: ChannelConfig,
    fields: AudioListener,
}

impl AudioNode for AudioListenerNode {
    fn registration(&self) -> &AudioContextRegistration {
        &self.registration
    }

    fn channel_config_raw(&self) -> &ChannelConfig {
        &self.channel_config
    }

    fn number_of_inputs(&self) -> u32 {
        0
    }

    fn number_of_outputs(&self) -> u32 {
        14
    }
}

impl AudioListenerNode {
    pub fn new(context: &BaseAudioContext) -> Self {
        context.register(|registration| {
            let id = registration.id();

            let param = |default_value: f32| AudioParamOptions {
                min_value: f32::MIN,
                max_value: f32::MAX,
                default_value,
            };

            let (position_x, position_x_id) = context.create_audio_param(param(0.), id);
            let (position_y, position_y_id) = context.create_audio_param(param(0.), id);
            let (position_z, position_z_id) = context.create_audio_param(param(0.), id);
            let (forward_x, forward_x_id) = context.create_audio_param(param(0.), id);
            let (forward_y, forward_y_id) = context.create_audio_param(param(0.), id);
            let (forward_z, forward_z_id) = context.create_audio_param(param(-1.), id);
            let (up_x, up_x_id) = context.create_audio_param(param(0.), id);
            let (up_y, up_y_id) = context.create_audio_param(param(1.), id);
            let (up_z, up_z_id) = context.create_audio_param(param(0.), id);
            let (velocity_x, velocity_x_id) = context.create_audio_param(param(0.), id);
            let (velocity_y, velocity_y_id) = context.create_audio_param(param(0.), id);
            let (velocity_z, velocity_z_id) = context.create_audio_param(param(0.), id);
            let (doppler_factor, doppler_factor_id) = context.create_audio_param(param(1.), id);
            let (speed_of_sound, speed_of_sound_id) =
                context.create_audio_param(param(SPEED_OF_SOUND), id);

            let render = ListenerRenderer {
                params: [
                    position_x_id,
                    position_y_id,
                    position_z_id,
                    forward_x_id,
                    forward_y_id,
                    forward_z_id,
                    up_x_id,
                    up_y_id,
                    up_z_id,
                    velocity_x_id,
                    velocity_y_id,
                    velocity_z_id,
                    doppler_factor_id,
                    speed_of_sound_id,
                ],
            };

            let node = AudioListenerNode {
                registration,
                channel_config: ChannelConfigOptions {
                    count: 1,
                    mode: ChannelCountMode::Explicit,
                    interpretation: ChannelInterpretation::Discrete,
                }
                .into(),
                fields: AudioListener {
                    position_x,
                    position_y,
                    position_z,
                    forward_x,
                    forward_y,
                    forward_z,
                    up_x,
                    up_y,
                    up_z,
                    velocity_x,
                    velocity_y,
                    velocity_z,
                    doppler_factor,
                    speed_of_sound,
                },
            };

            (node, Box::new(render))
        })
    }

    pub fn into_fields(self) -> AudioListenerParams {
        let AudioListener {
            position_x,
            position_y,
            position_z,
            forward_x,
            forward_y,
            forward_z,
            up_x,
            up_y,
            up_z,
            velocity_x,
            velocity_y,
            velocity_z,
            doppler_factor,
            speed_of_sound,
        } = self.fields;

        AudioListenerParams {
            position_x: position_x.into_raw_parts(),
            position_y: position_y.into_raw_parts(),
            position_z: position_z.into_raw_parts(),
            forward_x: forward_x.into_raw_parts(),
            forward_y: forward_y.into_raw_parts(),
            forward_z: forward_z.into_raw_parts(),
            up_x: up_x.into_raw_parts(),
            up_y: up_y.into_raw_parts(),
            up_z: up_z.into_raw_parts(),
            velocity_x: velocity_x.into_raw_parts(),
            velocity_y: velocity_y.into_raw_parts(),
            velocity_z: velocity_z.into_raw_parts(),
            doppler_factor: doppler_factor.into_raw_parts(),
            speed_of_sound: speed_of_sound.into_raw_parts(),
        }
    }
}

/// Copies each listener param's computed buffer to the matching output, so
/// panner inputs observe the listener state of the same quantum.
struct ListenerRenderer {
    params: [AudioParamId; 14],
}

impl AudioProcessor for ListenerRenderer {
    fn process(
        &mut self,
        _inputs: &[AudioBus],
        outputs: &mut [AudioBus],
        params: AudioParamValues,
        _timestamp: f64,
        _sample_rate: SampleRate,
    ) {
        // zero-copy: outputs alias the param buffers
        for (output, param) in outputs.iter_mut().zip(self.params.iter()) {
            output.copy_from(params.get_raw(param));
        }
    }

    fn propagates_silence(&self, _now: f64, _last_non_silent: f64) -> bool {
        // listener state must stay current even with no sound playing
        false
    }
}
