use serde_derive::Serialize;

use crate::error::{Error, Result};

/// Segments shorter than this evaluate to their left keyframe.
const MIN_SEGMENT: f32 = 1e-8;

/// A keyframe value, tangent or sample: scalar, 3-vector or quaternion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CurveValue {
    Scalar(f32),
    Vec3([f32; 3]),
    Quat([f32; 4]),
}

impl CurveValue {
    pub fn from_slice(values: &[f32]) -> Result<Self> {
        Ok(match *values {
            [x] => CurveValue::Scalar(x),
            [x, y, z] => CurveValue::Vec3([x, y, z]),
            [x, y, z, w] => CurveValue::Quat([x, y, z, w]),
            _ => {
                return Err(Error::CurveShape(format!(
                    "no curve value has {} components",
                    values.len()
                )));
            }
        })
    }

    pub fn zero(dim: usize) -> Result<Self> {
        let zeros = [0.0; 4];
        let slice = zeros.get(..dim).unwrap_or(&zeros);
        match slice.len() == dim {
            true => CurveValue::from_slice(slice),
            false => Err(Error::CurveShape(format!("no curve value has {dim} components"))),
        }
    }

    pub fn dim(&self) -> usize {
        self.as_slice().len()
    }

    pub fn as_slice(&self) -> &[f32] {
        match self {
            CurveValue::Scalar(x) => std::slice::from_ref(x),
            CurveValue::Vec3(v) => v,
            CurveValue::Quat(q) => q,
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        match self {
            CurveValue::Scalar(x) => std::slice::from_mut(x),
            CurveValue::Vec3(v) => v,
            CurveValue::Quat(q) => q,
        }
    }

    /// Combines two values of the same shape component-wise.
    fn zip_with(&self, other: &CurveValue, mut f: impl FnMut(usize, f32, f32) -> f32) -> CurveValue {
        let mut out = *self;
        for (i, (o, &b)) in out.as_mut_slice().iter_mut().zip(other.as_slice()).enumerate() {
            *o = f(i, *o, b);
        }
        out
    }
}

impl From<f32> for CurveValue {
    fn from(value: f32) -> Self {
        CurveValue::Scalar(value)
    }
}

impl From<[f32; 3]> for CurveValue {
    fn from(value: [f32; 3]) -> Self {
        CurveValue::Vec3(value)
    }
}

impl From<[f32; 4]> for CurveValue {
    fn from(value: [f32; 4]) -> Self {
        CurveValue::Quat(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Keyframe {
    pub time: f32,
    pub value: CurveValue,
    pub in_slope: CurveValue,
    pub out_slope: CurveValue,
    /// The segment starting here interpolates linearly.
    pub is_dense: bool,
    /// The segment starting here holds its value.
    pub is_constant: bool,
}

impl Keyframe {
    pub fn hermite(time: f32, value: CurveValue, in_slope: CurveValue, out_slope: CurveValue) -> Self {
        Keyframe {
            time,
            value,
            in_slope,
            out_slope,
            is_dense: false,
            is_constant: false,
        }
    }

    pub fn dense(time: f32, value: CurveValue) -> Result<Self> {
        let zero = CurveValue::zero(value.dim())?;
        Ok(Keyframe {
            is_dense: true,
            ..Keyframe::hermite(time, value, zero, zero)
        })
    }

    pub fn constant(time: f32, value: CurveValue) -> Result<Self> {
        let zero = CurveValue::zero(value.dim())?;
        Ok(Keyframe {
            is_constant: true,
            ..Keyframe::hermite(time, value, zero, zero)
        })
    }

    pub fn dim(&self) -> usize {
        self.value.dim()
    }
}

/// Identifies a curve by the binding that drives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurveKey {
    /// CRC-32 of the transform path.
    pub path: u32,
    pub attribute: u32,
    pub type_id: i32,
}

/// Keyframes of one binding, ordered by time.
///
/// Neighbouring keyframes are adjacent indices; [`Curve::prev`] and
/// [`Curve::next`] walk them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Curve {
    pub key: CurveKey,
    keyframes: Vec<Keyframe>,
}

impl Curve {
    pub fn new(key: CurveKey) -> Self {
        Curve {
            key,
            keyframes: Vec::new(),
        }
    }

    pub fn keyframes(&self) -> &[Keyframe] {
        &self.keyframes
    }

    pub fn len(&self) -> usize {
        self.keyframes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keyframes.is_empty()
    }

    /// Dimension shared by every keyframe, `None` while empty.
    pub fn dim(&self) -> Option<usize> {
        self.keyframes.first().map(Keyframe::dim)
    }

    pub fn prev(&self, index: usize) -> Option<usize> {
        index.checked_sub(1)
    }

    pub fn next(&self, index: usize) -> Option<usize> {
        let next = index + 1;
        (next < self.keyframes.len()).then_some(next)
    }

    pub fn last_mut(&mut self) -> Option<&mut Keyframe> {
        self.keyframes.last_mut()
    }

    pub fn start_time(&self) -> Option<f32> {
        self.keyframes.first().map(|k| k.time)
    }

    pub fn end_time(&self) -> Option<f32> {
        self.keyframes.last().map(|k| k.time)
    }

    /// Inserts a keyframe after every keyframe with a time less or equal to it.
    pub fn add_keyframe(&mut self, keyframe: Keyframe) -> Result<()> {
        if !keyframe.time.is_finite() {
            return Err(Error::CurveShape(format!(
                "keyframe time {} is not finite",
                keyframe.time
            )));
        }
        let dims = [keyframe.in_slope.dim(), keyframe.out_slope.dim()];
        if dims.iter().any(|&d| d != keyframe.dim()) {
            return Err(Error::CurveShape(format!(
                "keyframe value has {} components but slopes have {dims:?}",
                keyframe.dim()
            )));
        }
        if let Some(dim) = self.dim() {
            if dim != keyframe.dim() {
                return Err(Error::CurveShape(format!(
                    "curve {:?} holds {dim}-component values, got {}",
                    self.key,
                    keyframe.dim()
                )));
            }
        }

        match self.keyframes.last() {
            Some(last) if keyframe.time < last.time => {
                let at = self.keyframes.partition_point(|k| k.time <= keyframe.time);
                self.keyframes.insert(at, keyframe);
            }
            _ => self.keyframes.push(keyframe),
        }
        Ok(())
    }

    /// Index of the last keyframe at or before `time`.
    fn segment_start(&self, time: f32) -> usize {
        self.keyframes
            .partition_point(|k| k.time <= time)
            .saturating_sub(1)
    }

    /// Samples the curve. Times outside the keyframe range clamp to the ends.
    pub fn evaluate(&self, time: f32) -> Option<CurveValue> {
        let first = self.keyframes.first()?;
        let last = self.keyframes.last()?;
        if time <= first.time {
            return Some(first.value);
        }
        if time >= last.time {
            return Some(last.value);
        }

        let lhs_index = self.segment_start(time);
        let lhs = &self.keyframes[lhs_index];
        let rhs = &self.keyframes[self.next(lhs_index).unwrap_or(lhs_index)];
        Some(interpolate(lhs, rhs, time))
    }

    /// A dense curve sampling this one at `times`.
    pub fn resample_dense(&self, times: impl IntoIterator<Item = f32>) -> Result<Curve> {
        let mut curve = Curve::new(self.key);
        for time in times {
            let Some(value) = self.evaluate(time) else {
                break;
            };
            curve.add_keyframe(Keyframe::dense(time, value)?)?;
        }
        Ok(curve)
    }

    /// [`Curve::resample_dense`] at a fixed rate over the curve's time range.
    pub fn resample_at_rate(&self, sample_rate: f32) -> Result<Curve> {
        let (Some(start), Some(end)) = (self.start_time(), self.end_time()) else {
            return Ok(Curve::new(self.key));
        };
        if sample_rate <= 0.0 || !sample_rate.is_finite() {
            return Err(Error::invalid(format!("invalid sample rate {sample_rate}")));
        }
        let frames = ((end - start) * sample_rate).round() as usize;
        self.resample_dense((0..=frames).map(|f| start + f as f32 / sample_rate))
    }
}

fn interpolate(lhs: &Keyframe, rhs: &Keyframe, time: f32) -> CurveValue {
    let dx = rhs.time - lhs.time;
    if time == lhs.time || lhs.is_constant || dx < MIN_SEGMENT {
        return lhs.value;
    }
    let t = (time - lhs.time) / dx;

    if lhs.is_dense {
        return lhs.value.zip_with(&rhs.value, |_, a, b| a + (b - a) * t);
    }

    let t2 = t * t;
    let t3 = t2 * t;
    let h00 = 2.0 * t3 - 3.0 * t2 + 1.0;
    let h10 = t3 - 2.0 * t2 + t;
    let h01 = -2.0 * t3 + 3.0 * t2;
    let h11 = t3 - t2;

    let out_slope = lhs.out_slope.as_slice();
    let in_slope = rhs.in_slope.as_slice();
    lhs.value.zip_with(&rhs.value, |i, a, b| {
        let (m0, m1) = (out_slope[i], in_slope[i]);
        if m0 == f32::INFINITY || m1 == f32::INFINITY {
            return a;
        }
        h00 * a + h10 * m0 * dx + h01 * b + h11 * m1 * dx
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: CurveKey = CurveKey {
        path: 0,
        attribute: 0,
        type_id: 0,
    };

    fn scalar_curve(keys: &[(f32, f32, f32, f32)]) -> Curve {
        let mut curve = Curve::new(KEY);
        for &(time, value, in_slope, out_slope) in keys {
            curve
                .add_keyframe(Keyframe::hermite(
                    time,
                    value.into(),
                    in_slope.into(),
                    out_slope.into(),
                ))
                .unwrap();
        }
        curve
    }

    fn scalar(value: Option<CurveValue>) -> f32 {
        match value {
            Some(CurveValue::Scalar(x)) => x,
            other => panic!("expected a scalar, got {other:?}"),
        }
    }

    #[test]
    fn hermite_smoothstep() {
        let curve = scalar_curve(&[(0.0, 0.0, 0.0, 0.0), (1.0, 1.0, 0.0, 0.0)]);
        assert!((scalar(curve.evaluate(0.5)) - 0.5).abs() < 1e-6);
        assert!((scalar(curve.evaluate(0.25)) - 0.15625).abs() < 1e-6);
    }

    #[test]
    fn infinite_slope_steps() {
        let curve = scalar_curve(&[(0.0, 0.0, 0.0, f32::INFINITY), (1.0, 1.0, 0.0, 0.0)]);
        assert_eq!(scalar(curve.evaluate(0.999)), 0.0);
        assert_eq!(scalar(curve.evaluate(1.0)), 1.0);

        let curve = scalar_curve(&[(0.0, 0.0, 0.0, 0.0), (1.0, 1.0, f32::INFINITY, 0.0)]);
        assert_eq!(scalar(curve.evaluate(0.5)), 0.0);
    }

    #[test]
    fn negative_infinite_slope_does_not_step() {
        let curve = scalar_curve(&[(0.0, 0.0, 0.0, f32::NEG_INFINITY), (1.0, 1.0, 0.0, 0.0)]);
        assert_ne!(scalar(curve.evaluate(0.5)), 0.0);
    }

    #[test]
    fn stepping_is_per_component() {
        let mut curve = Curve::new(KEY);
        curve
            .add_keyframe(Keyframe::hermite(
                0.0,
                CurveValue::Vec3([0.0, 0.0, 0.0]),
                CurveValue::Vec3([0.0; 3]),
                CurveValue::Vec3([0.0, f32::INFINITY, 0.0]),
            ))
            .unwrap();
        curve
            .add_keyframe(Keyframe::hermite(
                1.0,
                CurveValue::Vec3([2.0; 3]),
                CurveValue::Vec3([0.0; 3]),
                CurveValue::Vec3([0.0; 3]),
            ))
            .unwrap();
        let Some(CurveValue::Vec3([x, y, z])) = curve.evaluate(0.5) else {
            panic!("expected a vec3");
        };
        assert!((x - 1.0).abs() < 1e-6);
        assert_eq!(y, 0.0);
        assert!((z - 1.0).abs() < 1e-6);
    }

    #[test]
    fn flat_segment_holds_value() {
        let curve = scalar_curve(&[(0.0, 3.0, 0.0, 0.0), (2.0, 3.0, 0.0, 0.0)]);
        for _ in 0..100 {
            let t = fastrand::f32() * 2.0;
            assert_eq!(scalar(curve.evaluate(t)), 3.0);
        }
    }

    #[test]
    fn clamps_at_both_ends() {
        let curve = scalar_curve(&[
            (1.0, 5.0, 0.0, 1.0),
            (2.0, 7.0, 1.0, -1.0),
            (4.0, -2.0, 3.0, 0.0),
        ]);
        for t in [-10.0, 0.0, 0.999, 1.0] {
            assert_eq!(scalar(curve.evaluate(t)), 5.0);
        }
        for t in [4.0, 4.001, 100.0] {
            assert_eq!(scalar(curve.evaluate(t)), -2.0);
        }
    }

    #[test]
    fn exact_keyframe_times_are_exact() {
        let curve = scalar_curve(&[
            (0.0, 0.1, 0.0, 0.3),
            (0.7, 0.9, 2.0, -4.0),
            (1.3, -0.4, 1.0, 1.0),
            (2.0, 0.2, 0.0, 0.0),
        ]);
        for k in curve.keyframes() {
            assert_eq!(scalar(curve.evaluate(k.time)), scalar(Some(k.value)));
        }
    }

    #[test]
    fn dense_lerps_and_constant_holds() {
        let mut curve = Curve::new(KEY);
        curve.add_keyframe(Keyframe::dense(0.0, CurveValue::Scalar(0.0)).unwrap()).unwrap();
        curve.add_keyframe(Keyframe::dense(1.0, CurveValue::Scalar(10.0)).unwrap()).unwrap();
        assert!((scalar(curve.evaluate(0.3)) - 3.0).abs() < 1e-5);

        let mut curve = Curve::new(KEY);
        curve.add_keyframe(Keyframe::constant(0.0, CurveValue::Scalar(4.0)).unwrap()).unwrap();
        curve.add_keyframe(Keyframe::constant(1.0, CurveValue::Scalar(4.0)).unwrap()).unwrap();
        assert_eq!(scalar(curve.evaluate(0.5)), 4.0);
    }

    #[test]
    fn keyframes_stay_sorted() {
        let mut curve = Curve::new(KEY);
        for _ in 0..200 {
            let time = fastrand::f32() * 10.0;
            curve.add_keyframe(Keyframe::dense(time, time.into()).unwrap()).unwrap();
        }
        assert!(curve.keyframes().windows(2).all(|w| w[0].time <= w[1].time));
        assert_eq!(curve.prev(0), None);
        assert_eq!(curve.next(199), None);
        assert_eq!(curve.next(3), Some(4));
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let mut curve = scalar_curve(&[(0.0, 0.0, 0.0, 0.0)]);
        let vec3 = Keyframe::dense(1.0, CurveValue::Vec3([0.0; 3])).unwrap();
        assert!(matches!(curve.add_keyframe(vec3), Err(Error::CurveShape(_))));

        let bad_slopes = Keyframe::hermite(
            1.0,
            CurveValue::Scalar(0.0),
            CurveValue::Quat([0.0; 4]),
            CurveValue::Scalar(0.0),
        );
        assert!(matches!(curve.add_keyframe(bad_slopes), Err(Error::CurveShape(_))));
        assert!(CurveValue::from_slice(&[1.0, 2.0]).is_err());
    }

    #[test]
    fn resample_matches_source() {
        let curve = scalar_curve(&[(0.0, 0.0, 0.0, 0.0), (1.0, 1.0, 0.0, 0.0)]);
        let dense = curve.resample_at_rate(10.0).unwrap();
        assert_eq!(dense.len(), 11);
        for k in dense.keyframes() {
            assert!(k.is_dense);
            assert_eq!(k.in_slope, CurveValue::Scalar(0.0));
            assert!((scalar(Some(k.value)) - scalar(curve.evaluate(k.time))).abs() < 1e-6);
        }
        assert!(Curve::new(KEY).resample_dense([0.0, 1.0]).unwrap().is_empty());
    }
}
