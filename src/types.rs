use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Virtual receiver identifier
pub type DeviceId = String;

/// Volume in percent, always within 0..=100
pub type VolumePercent = u8;

/// Whether a virtual receiver stands for a single speaker or a speaker group
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    #[default]
    Device,
    Group,
}

/// Playback state held for a virtual receiver
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    #[default]
    Stopped,
    Playing,
    Paused,
}

impl PlaybackState {
    /// Map a backend state string (`playing`, `paused`, `idle`, `off`, ...).
    pub fn from_backend(state: &str) -> Self {
        match state.to_ascii_lowercase().as_str() {
            "playing" => PlaybackState::Playing,
            "paused" => PlaybackState::Paused,
            _ => PlaybackState::Stopped,
        }
    }
}

/// One emulated receiver
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VirtualDevice {
    pub id: DeviceId,
    pub display_name: String,

    /// Reference into the backend system; empty until resolved
    #[serde(default)]
    pub backend_entity_id: String,

    #[serde(default)]
    pub kind: DeviceKind,

    #[serde(default)]
    pub playback_state: PlaybackState,

    #[serde(default = "default_volume")]
    pub volume: VolumePercent,

    #[serde(default)]
    pub current_track: Option<String>,

    #[serde(default)]
    pub current_artist: Option<String>,
}

fn default_volume() -> VolumePercent {
    50
}

impl VirtualDevice {
    pub fn new(id: impl Into<DeviceId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            backend_entity_id: String::new(),
            kind: DeviceKind::Device,
            playback_state: PlaybackState::Stopped,
            volume: default_volume(),
            current_track: None,
            current_artist: None,
        }
    }

    /// Whether the device is bound to a backend entity
    pub fn is_bound(&self) -> bool {
        !self.backend_entity_id.is_empty()
    }
}

/// Playback snapshot reported by a backend alongside a device record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteState {
    pub playback_state: PlaybackState,
    pub volume: Option<VolumePercent>,
    pub track: Option<String>,
    pub artist: Option<String>,
}

/// Normalized backend discovery result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendDeviceRecord {
    pub id: String,
    pub name: String,

    /// Backend device type (`ECHO`, `WHA`, `media_player`, ...)
    pub device_type: String,

    /// Which discovery endpoint produced this record
    pub source_endpoint: String,

    /// Live playback state when the backend reports it
    pub state: Option<RemoteState>,
}

impl BackendDeviceRecord {
    /// Multi-room groups are reported as `WHA` devices or with a group type
    pub fn kind(&self) -> DeviceKind {
        let ty = self.device_type.to_ascii_lowercase();
        if ty == "wha" || ty.contains("group") {
            DeviceKind::Group
        } else {
            DeviceKind::Device
        }
    }
}

/// Playback verb relayed to the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Play,
    Pause,
    Stop,
    Next,
    Previous,
    SetVolume(VolumePercent),
}

impl Verb {
    /// Short name used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Play => "play",
            Verb::Pause => "pause",
            Verb::Stop => "stop",
            Verb::Next => "next",
            Verb::Previous => "previous",
            Verb::SetVolume(_) => "volume_set",
        }
    }

    /// Cloud directive `(namespace, name, payload)` for this verb
    pub fn directive(&self) -> (&'static str, &'static str, Value) {
        match *self {
            Verb::Play => ("Alexa.PlaybackController", "Play", json!({})),
            Verb::Pause => ("Alexa.PlaybackController", "Pause", json!({})),
            Verb::Stop => ("Alexa.PlaybackController", "Stop", json!({})),
            Verb::Next => ("Alexa.PlaybackController", "Next", json!({})),
            Verb::Previous => ("Alexa.PlaybackController", "Previous", json!({})),
            Verb::SetVolume(v) => ("Alexa.Speaker", "SetVolume", json!({ "volume": v })),
        }
    }

    /// Home Assistant `media_player` service and extra data for this verb
    pub fn media_player_service(&self) -> (&'static str, Option<(&'static str, Value)>) {
        match *self {
            Verb::Play => ("media_play", None),
            Verb::Pause => ("media_pause", None),
            Verb::Stop => ("media_stop", None),
            Verb::Next => ("media_next_track", None),
            Verb::Previous => ("media_previous_track", None),
            Verb::SetVolume(v) => (
                "volume_set",
                Some(("volume_level", json!(f64::from(v) / 100.0))),
            ),
        }
    }

    /// Playback state the device is in after this verb succeeded
    pub fn resulting_state(&self) -> Option<PlaybackState> {
        match self {
            Verb::Play | Verb::Next | Verb::Previous => Some(PlaybackState::Playing),
            Verb::Pause => Some(PlaybackState::Paused),
            Verb::Stop => Some(PlaybackState::Stopped),
            Verb::SetVolume(_) => None,
        }
    }
}
