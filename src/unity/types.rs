#![allow(non_snake_case)]

use serde_derive::{Deserialize, Serialize};

pub type Vector3f = (f32, f32, f32);
pub type Quaternionf = (f32, f32, f32, f32);

/// The deserialized `AnimationClip` object, restricted to the fields the
/// curve decoder reads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnimationClip {
    pub m_Name: String,
    #[serde(default)]
    pub m_Legacy: bool,
    #[serde(default)]
    pub m_SampleRate: f32,
    #[serde(default)]
    pub m_RotationCurves: Vec<QuaternionCurve>,
    #[serde(default)]
    pub m_PositionCurves: Vec<Vector3Curve>,
    #[serde(default)]
    pub m_ScaleCurves: Vec<Vector3Curve>,
    #[serde(default)]
    pub m_EulerCurves: Vec<Vector3Curve>,
    #[serde(default)]
    pub m_FloatCurves: Vec<FloatCurve>,
    #[serde(default)]
    pub m_MuscleClip: ClipMuscleConstant,
    #[serde(default)]
    pub m_ClipBindingConstant: AnimationClipBindingConstant,
}

impl AnimationClip {
    /// Post-build clips carry their data in the muscle clip instead of the legacy curve lists.
    pub fn has_legacy_curves(&self) -> bool {
        !(self.m_RotationCurves.is_empty()
            && self.m_PositionCurves.is_empty()
            && self.m_ScaleCurves.is_empty()
            && self.m_EulerCurves.is_empty()
            && self.m_FloatCurves.is_empty())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClipMuscleConstant {
    pub m_StartTime: f32,
    pub m_StopTime: f32,
    pub m_Clip: Clip,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Clip {
    pub m_StreamedClip: StreamedClip,
    pub m_DenseClip: DenseClip,
    pub m_ConstantClip: ConstantClip,
}

/// Keyframe-reduced curves, serialized as a flat word array.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamedClip {
    pub data: Vec<u32>,
    pub curveCount: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DenseClip {
    pub m_FrameCount: i32,
    pub m_CurveCount: u32,
    pub m_SampleRate: f32,
    pub m_BeginTime: f32,
    pub m_SampleArray: Vec<f32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConstantClip {
    pub data: Vec<f32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnimationClipBindingConstant {
    pub genericBindings: Vec<GenericBinding>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericBinding {
    /// CRC-32 of the transform path.
    pub path: u32,
    pub attribute: u32,
    pub typeID: i32,
    #[serde(default)]
    pub customType: u8,
    #[serde(default)]
    pub isPPtrCurve: u8,
    #[serde(default)]
    pub isIntCurve: u8,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Keyframe<T> {
    pub time: f32,
    pub value: T,
    pub inSlope: T,
    pub outSlope: T,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnimationCurve<T> {
    pub m_Curve: Vec<Keyframe<T>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Vector3Curve {
    pub curve: AnimationCurve<Vector3f>,
    pub path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuaternionCurve {
    pub curve: AnimationCurve<Quaternionf>,
    pub path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FloatCurve {
    pub curve: AnimationCurve<f32>,
    pub attribute: String,
    pub path: String,
    #[serde(default)]
    pub classID: i32,
}
