use serde_derive::Serialize;

use super::RlaVersion;

pub type Vector3 = [f32; 3];

/// Discriminator of the record carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum RecordType {
    MotionData,
    MotionCaptureData,
    SoundData,
    StatusData,
    VirtualLiveMessageData,
    ComplementInfoData,
    Unknown,
}

impl RecordType {
    pub fn from_signature(signature: u8) -> RecordType {
        match signature {
            0 => RecordType::MotionData,
            1 => RecordType::MotionCaptureData,
            2 => RecordType::SoundData,
            3 => RecordType::StatusData,
            4 => RecordType::VirtualLiveMessageData,
            5 => RecordType::ComplementInfoData,
            _ => RecordType::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecordType::MotionData => "MotionData",
            RecordType::MotionCaptureData => "MotionCaptureData",
            RecordType::SoundData => "SoundData",
            RecordType::StatusData => "StatusData",
            RecordType::VirtualLiveMessageData => "VirtualLiveMessageData",
            RecordType::ComplementInfoData => "ComplementInfoData",
            RecordType::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields shared by every streamed record, read before the type-specific body.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PacketHeader {
    pub signature: u8,
    pub compress_type: i32,
    pub sequence_no: i32,
    pub target_time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    #[serde(flatten)]
    pub header: Option<PacketHeader>,
    #[serde(flatten)]
    pub data: RecordData,
}

impl Record {
    pub fn record_type(&self) -> RecordType {
        match &self.data {
            RecordData::MotionData(_) => RecordType::MotionData,
            RecordData::MotionCaptureData(_) => RecordType::MotionCaptureData,
            RecordData::SoundData(_) => RecordType::SoundData,
            RecordData::StatusData(_) => RecordType::StatusData,
            RecordData::VirtualLiveMessageData(_) => RecordType::VirtualLiveMessageData,
            RecordData::ComplementInfoData(_) => RecordType::ComplementInfoData,
            RecordData::Unknown { .. } => RecordType::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum RecordData {
    MotionData(MotionData),
    MotionCaptureData(MotionCaptureData),
    SoundData(SoundData),
    StatusData(StatusData),
    VirtualLiveMessageData(VirtualLiveMessageData),
    ComplementInfoData(ComplementInfoData),
    Unknown {
        signature: u8,
        #[serde(with = "hex_bytes")]
        data: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MotionData {
    pub time_stamps: Option<Vec<i64>>,
    pub poses: Vec<PoseData>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MotionCaptureData {
    pub data: Vec<MotionCaptureFrame>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MotionCaptureFrame {
    pub id: i32,
    pub timestamp: i64,
    pub pose: PoseData,
}

/// A character pose. Rotations are in radians.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoseData {
    pub body_position: Vector3,
    pub body_rotation: Vector3,
    /// Present from 1.1.
    pub music_item_prop_position: Option<Vector3>,
    /// Present from 1.1.
    pub music_item_prop_rotation: Option<Vector3>,
    pub bone_datas: Vec<Vector3>,
    pub shape_datas: Vec<f32>,
    /// Present from 1.1.
    pub prop_bone_datas: Option<Vec<Vector3>>,
    pub height_offset: f32,
    pub is_active: bool,
    pub use_active_fx: bool,
    /// Present from 1.4.
    pub is_eye_look_at: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SoundData {
    pub channels: i32,
    pub sample_rate: i32,
    /// `"hca"` when the header's compress type is 1, `"raw"` otherwise.
    pub encoding: &'static str,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusData {
    pub stage_status: Vec<StageStatus>,
    pub character_status: Vec<Vec<CharacterStatus>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageStatus {
    pub live_state: i32,
    pub light_intensity: f32,
    pub gaya_volume: f32,
    pub cheer_volume: f32,
    pub character_spotlight_index: i32,
    pub character_spotlight_intensity: f32,
    pub stage_setlist_index: i32,
    pub music_setlist_index: i32,
    pub music_target_time: i64,
    pub music_start_time: f32,
    pub se_id: i32,
    pub se_start_time: i64,
    pub time_stamp: i64,
    // reserved, kept verbatim
    pub unk0: i32,
    pub unk1: i32,
    pub play_timeline_id: i32,
    /// Present from 1.4.
    pub extended: Option<StageStatusExtended>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageStatusExtended {
    #[serde(rename = "screenFadeRGB")]
    pub screen_fade_rgb: [i32; 3],
    pub screen_fade: f32,
    pub character_formation_rotate: i32,
    pub stage_center_position: Vector3,
    pub player_avatar_start_position: Vector3,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterStatus {
    pub costume_index: i32,
    /// Present from 1.2.
    pub use_fx: Option<bool>,
    pub time_stamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualLiveMessageData {
    pub message_id: i32,
    pub user_id: Option<String>,
    /// Decoded message-pack object, left unclassified.
    pub message: rmpv::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplementInfoData {
    pub info_type: i32,
    pub info_data: Option<String>,
}

/// Version-gated field presence.
impl RlaVersion {
    pub fn has_music_item_prop(self) -> bool {
        self >= RlaVersion(1, 1)
    }

    pub fn has_character_use_fx(self) -> bool {
        self >= RlaVersion(1, 2)
    }

    pub fn has_extended_status(self) -> bool {
        self >= RlaVersion(1, 4)
    }
}

mod hex_bytes {
    use serde::Serializer;

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(data))
    }
}
