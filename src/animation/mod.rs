//! Evaluable curves decoded from engine animation clips.
//!
//! Legacy clips carry explicit curve lists; post-build clips pack their data
//! into a streamed, a dense and a constant sub-clip whose flat scalar slots
//! are assigned to bindings in order (see [`clip::BindingTable`]).

pub mod clip;
mod curve;

use indexmap::IndexMap;
use rustc_hash::FxHashMap;

use crate::error::Result;
use crate::unity::TRANSFORM_TYPE_ID;
use crate::unity::types::{AnimationClip, Keyframe as ClipKeyframe};

pub use clip::{BindingTable, Curves, binding_dim};
pub use curve::{Curve, CurveKey, CurveValue, Keyframe};

pub const ATTR_POSITION: u32 = 1;
pub const ATTR_ROTATION: u32 = 2;
pub const ATTR_SCALE: u32 = 3;
pub const ATTR_EULER: u32 = 4;

/// CRC-32 as used for binding paths and attribute names.
pub fn crc32(text: &str) -> u32 {
    crc32fast::hash(text.as_bytes())
}

#[derive(Debug, Default)]
pub struct AnimationHelper {
    pub name: String,
    pub duration: f32,
    pub sample_rate: f32,
    curves: Curves,
    by_attribute: IndexMap<u32, IndexMap<u32, CurveKey>>,
    by_path: IndexMap<u32, IndexMap<u32, CurveKey>>,
    path_names: FxHashMap<u32, String>,
}

impl AnimationHelper {
    /// Decodes whichever representation the clip carries.
    pub fn from_clip(clip: &AnimationClip) -> Result<Self> {
        match clip.m_Legacy || clip.has_legacy_curves() {
            true => AnimationHelper::from_legacy(clip),
            false => AnimationHelper::from_muscle_clip(clip),
        }
    }

    pub fn from_legacy(clip: &AnimationClip) -> Result<Self> {
        let mut helper = AnimationHelper {
            name: clip.m_Name.clone(),
            sample_rate: clip.m_SampleRate,
            ..Default::default()
        };

        let transform_curves = [
            (ATTR_POSITION, &clip.m_PositionCurves),
            (ATTR_SCALE, &clip.m_ScaleCurves),
            (ATTR_EULER, &clip.m_EulerCurves),
        ];
        for (attribute, curves) in transform_curves {
            for curve in curves {
                let key = helper.register_curve(&curve.path, attribute, TRANSFORM_TYPE_ID);
                for k in &curve.curve.m_Curve {
                    helper.add_keyframe(key, legacy_keyframe(k, |(x, y, z)| [x, y, z].into()))?;
                }
            }
        }
        for curve in &clip.m_RotationCurves {
            let key = helper.register_curve(&curve.path, ATTR_ROTATION, TRANSFORM_TYPE_ID);
            for k in &curve.curve.m_Curve {
                helper.add_keyframe(key, legacy_keyframe(k, |(x, y, z, w)| [x, y, z, w].into()))?;
            }
        }
        for curve in &clip.m_FloatCurves {
            let key = helper.register_curve(&curve.path, crc32(&curve.attribute), curve.classID);
            for k in &curve.curve.m_Curve {
                helper.add_keyframe(key, legacy_keyframe(k, CurveValue::Scalar))?;
            }
        }

        helper.duration = helper
            .curves
            .values()
            .filter_map(Curve::end_time)
            .fold(0.0, f32::max);
        helper.rebuild_index();
        Ok(helper)
    }

    pub fn from_muscle_clip(clip: &AnimationClip) -> Result<Self> {
        let muscle = &clip.m_MuscleClip;
        let bindings = &clip.m_ClipBindingConstant.genericBindings;
        let table = BindingTable::new(bindings);

        let streamed = &muscle.m_Clip.m_StreamedClip;
        let dense = &muscle.m_Clip.m_DenseClip;
        let constant = &muscle.m_Clip.m_ConstantClip;
        let slots = streamed.curveCount as usize + dense.m_CurveCount as usize + constant.data.len();
        if slots != table.slot_count() {
            tracing::warn!(
                "clip '{}' has {slots} curve slots but its bindings cover {}",
                clip.m_Name,
                table.slot_count()
            );
        }

        let mut curves = Curves::default();
        clip::decode_streamed(&table, streamed, &mut curves)?;
        let dense_offset = streamed.curveCount as usize;
        clip::decode_dense(&table, dense, dense_offset, &mut curves)?;
        let constant_offset = dense_offset + dense.m_CurveCount as usize;
        clip::decode_constant(&table, constant, constant_offset, muscle.m_StopTime, &mut curves)?;

        let mut helper = AnimationHelper {
            name: clip.m_Name.clone(),
            duration: muscle.m_StopTime - muscle.m_StartTime,
            sample_rate: clip.m_SampleRate,
            curves,
            ..Default::default()
        };
        helper.rebuild_index();
        Ok(helper)
    }

    fn register_curve(&mut self, path: &str, attribute: u32, type_id: i32) -> CurveKey {
        let path = self.register_path(path);
        let key = CurveKey {
            path,
            attribute,
            type_id,
        };
        self.curves.entry(key).or_insert_with(|| Curve::new(key));
        key
    }

    fn add_keyframe(&mut self, key: CurveKey, keyframe: Keyframe) -> Result<()> {
        self.curves
            .entry(key)
            .or_insert_with(|| Curve::new(key))
            .add_keyframe(keyframe)
    }

    fn rebuild_index(&mut self) {
        self.by_attribute.clear();
        self.by_path.clear();
        for key in self.curves.keys() {
            self.by_attribute
                .entry(key.attribute)
                .or_default()
                .insert(key.path, *key);
            self.by_path
                .entry(key.path)
                .or_default()
                .insert(key.attribute, *key);
        }
    }

    /// Remembers a path name so its CRC can be mapped back. Returns the CRC.
    pub fn register_path(&mut self, path: &str) -> u32 {
        let crc = crc32(path);
        self.path_names.entry(crc).or_insert_with(|| path.to_owned());
        crc
    }

    /// Registers every path and all of their ancestors.
    pub fn register_paths<'a>(&mut self, paths: impl IntoIterator<Item = &'a str>) {
        for path in paths {
            let mut end = path.len();
            loop {
                self.register_path(&path[..end]);
                match path[..end].rfind('/') {
                    Some(slash) => end = slash,
                    None => break,
                }
            }
        }
    }

    pub fn path_name(&self, crc: u32) -> Option<&str> {
        self.path_names.get(&crc).map(String::as_str)
    }

    pub fn curves(&self) -> impl Iterator<Item = &Curve> {
        self.curves.values()
    }

    pub fn curve(&self, key: &CurveKey) -> Option<&Curve> {
        self.curves.get(key)
    }

    pub fn curve_at(&self, path: u32, attribute: u32) -> Option<&Curve> {
        let key = self.by_path.get(&path)?.get(&attribute)?;
        self.curves.get(key)
    }

    /// Curves under `attribute`, keyed by path.
    pub fn curves_by_attribute(&self, attribute: u32) -> impl Iterator<Item = (u32, &Curve)> {
        self.by_attribute
            .get(&attribute)
            .into_iter()
            .flat_map(|paths| paths.iter())
            .filter_map(|(&path, key)| Some((path, self.curves.get(key)?)))
    }

    /// Curves on `path`, keyed by attribute.
    pub fn curves_by_path(&self, path: u32) -> impl Iterator<Item = (u32, &Curve)> {
        self.by_path
            .get(&path)
            .into_iter()
            .flat_map(|attributes| attributes.iter())
            .filter_map(|(&attribute, key)| Some((attribute, self.curves.get(key)?)))
    }

    pub fn transform_curves(&self) -> impl Iterator<Item = &Curve> {
        self.curves
            .values()
            .filter(|curve| curve.key.type_id == TRANSFORM_TYPE_ID)
    }

    pub fn float_curves(&self) -> impl Iterator<Item = &Curve> {
        self.curves
            .values()
            .filter(|curve| curve.key.type_id != TRANSFORM_TYPE_ID)
    }

    fn transform_attribute(&self, attribute: u32) -> impl Iterator<Item = (u32, &Curve)> {
        self.curves_by_attribute(attribute)
            .filter(|(_, curve)| curve.key.type_id == TRANSFORM_TYPE_ID)
    }

    pub fn position_curves(&self) -> impl Iterator<Item = (u32, &Curve)> {
        self.transform_attribute(ATTR_POSITION)
    }

    pub fn rotation_curves(&self) -> impl Iterator<Item = (u32, &Curve)> {
        self.transform_attribute(ATTR_ROTATION)
    }

    pub fn scale_curves(&self) -> impl Iterator<Item = (u32, &Curve)> {
        self.transform_attribute(ATTR_SCALE)
    }

    pub fn euler_curves(&self) -> impl Iterator<Item = (u32, &Curve)> {
        self.transform_attribute(ATTR_EULER)
    }
}

fn legacy_keyframe<T: Copy>(k: &ClipKeyframe<T>, into: impl Fn(T) -> CurveValue) -> Keyframe {
    Keyframe::hermite(k.time, into(k.value), into(k.inSlope), into(k.outSlope))
}

#[cfg(test)]
mod tests {
    use super::clip::tests::{binding, streamed_words};
    use super::*;
    use crate::unity::types::{
        AnimationClipBindingConstant, AnimationCurve, Clip, ClipMuscleConstant, ConstantClip,
        DenseClip, FloatCurve, StreamedClip, Vector3Curve,
    };

    fn legacy_clip() -> AnimationClip {
        let key = |time: f32, value| ClipKeyframe {
            time,
            value,
            inSlope: (0.0, 0.0, 0.0),
            outSlope: (0.0, 0.0, 0.0),
        };
        AnimationClip {
            m_Name: "wave".into(),
            m_Legacy: true,
            m_SampleRate: 60.0,
            m_PositionCurves: vec![Vector3Curve {
                curve: AnimationCurve {
                    m_Curve: vec![key(0.0, (0.0, 0.0, 0.0)), key(2.0, (2.0, 4.0, 6.0))],
                },
                path: "Root/Hips".into(),
            }],
            m_FloatCurves: vec![FloatCurve {
                curve: AnimationCurve {
                    m_Curve: vec![ClipKeyframe {
                        time: 1.0,
                        value: 0.5,
                        inSlope: 0.0,
                        outSlope: 0.0,
                    }],
                },
                attribute: "blendShape.mouth_open".into(),
                path: "Face".into(),
                classID: 137,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn legacy_clip_curves() {
        let helper = AnimationHelper::from_clip(&legacy_clip()).unwrap();
        assert_eq!(helper.name, "wave");
        assert_eq!(helper.duration, 2.0);
        assert_eq!(helper.transform_curves().count(), 1);
        assert_eq!(helper.float_curves().count(), 1);

        let (path, position) = helper.position_curves().next().unwrap();
        assert_eq!(helper.path_name(path), Some("Root/Hips"));
        assert_eq!(position.evaluate(1.0), Some(CurveValue::Vec3([1.0, 2.0, 3.0])));
        assert!(helper.rotation_curves().next().is_none());

        let attribute = crc32("blendShape.mouth_open");
        let face = helper.curve_at(crc32("Face"), attribute).unwrap();
        assert_eq!(face.key.type_id, 137);
        assert_eq!(face.evaluate(0.0), Some(CurveValue::Scalar(0.5)));
        assert_eq!(helper.curves_by_attribute(attribute).count(), 1);
    }

    #[test]
    fn muscle_clip_combines_sub_clips() {
        let hips = crc32("Root/Hips");
        let bindings = vec![
            binding(hips, ATTR_ROTATION, TRANSFORM_TYPE_ID),
            binding(hips, ATTR_POSITION, TRANSFORM_TYPE_ID),
            binding(hips, ATTR_SCALE, TRANSFORM_TYPE_ID),
        ];
        let rotation_keys = |time: f32, w: f32| {
            (
                time,
                vec![
                    (0, [0.0, 0.0, 0.0, 0.0]),
                    (1, [0.0, 0.0, 0.0, 0.0]),
                    (2, [0.0, 0.0, 0.0, 0.0]),
                    (3, [0.0, 0.0, 0.0, w]),
                ],
            )
        };
        let clip = AnimationClip {
            m_Name: "dance".into(),
            m_SampleRate: 30.0,
            m_MuscleClip: ClipMuscleConstant {
                m_StartTime: 0.0,
                m_StopTime: 1.0,
                m_Clip: Clip {
                    m_StreamedClip: StreamedClip {
                        data: streamed_words(&[rotation_keys(0.0, 1.0), rotation_keys(1.0, 1.0)]),
                        curveCount: 4,
                    },
                    m_DenseClip: DenseClip {
                        m_FrameCount: 2,
                        m_CurveCount: 3,
                        m_SampleRate: 1.0,
                        m_BeginTime: 0.0,
                        m_SampleArray: vec![0.0, 0.0, 0.0, 1.0, 2.0, 3.0],
                    },
                    m_ConstantClip: ConstantClip {
                        data: vec![1.0, 1.0, 1.0],
                    },
                },
            },
            m_ClipBindingConstant: AnimationClipBindingConstant {
                genericBindings: bindings,
            },
            ..Default::default()
        };

        let mut helper = AnimationHelper::from_clip(&clip).unwrap();
        helper.register_paths(["Root/Hips/Spine"]);
        assert_eq!(helper.duration, 1.0);
        assert_eq!(helper.curves().count(), 3);
        assert_eq!(helper.path_name(hips), Some("Root/Hips"));
        assert_eq!(helper.path_name(crc32("Root")), Some("Root"));

        let (_, rotation) = helper.rotation_curves().next().unwrap();
        assert_eq!(rotation.evaluate(0.5), Some(CurveValue::Quat([0.0, 0.0, 0.0, 1.0])));

        let (_, position) = helper.position_curves().next().unwrap();
        assert!(position.keyframes().iter().all(|k| k.is_dense));
        let Some(CurveValue::Vec3([x, y, z])) = position.evaluate(0.5) else {
            panic!("expected a vec3");
        };
        assert!((x - 0.5).abs() < 1e-6 && (y - 1.0).abs() < 1e-6 && (z - 1.5).abs() < 1e-6);

        let (_, scale) = helper.scale_curves().next().unwrap();
        assert_eq!(scale.len(), 2);
        assert_eq!(scale.evaluate(0.7), Some(CurveValue::Vec3([1.0; 3])));
        assert_eq!(helper.curves_by_path(hips).count(), 3);
    }
}
