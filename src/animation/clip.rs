//! Decoding of post-build muscle clips into keyframes.

use indexmap::IndexMap;
use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::unity::TRANSFORM_TYPE_ID;
use crate::unity::types::{ConstantClip, DenseClip, GenericBinding, StreamedClip};

use super::curve::{Curve, CurveKey, CurveValue, Keyframe};
use super::{ATTR_EULER, ATTR_POSITION, ATTR_ROTATION, ATTR_SCALE};

pub type Curves = IndexMap<CurveKey, Curve>;

/// Number of scalar slots a binding occupies in the flat clip data.
pub fn binding_dim(binding: &GenericBinding) -> usize {
    if binding.typeID != TRANSFORM_TYPE_ID {
        return 1;
    }
    match binding.attribute {
        ATTR_POSITION | ATTR_SCALE | ATTR_EULER => 3,
        ATTR_ROTATION => 4,
        _ => 1,
    }
}

impl CurveKey {
    pub fn from_binding(binding: &GenericBinding) -> Self {
        CurveKey {
            path: binding.path,
            attribute: binding.attribute,
            type_id: binding.typeID,
        }
    }
}

/// Bindings with a prefix sum over their dimensions.
pub struct BindingTable<'a> {
    bindings: &'a [GenericBinding],
    /// `ends[i]` is one past the last slot of binding `i`.
    ends: Vec<usize>,
}

impl<'a> BindingTable<'a> {
    pub fn new(bindings: &'a [GenericBinding]) -> Self {
        let ends = bindings
            .iter()
            .scan(0, |end, binding| {
                *end += binding_dim(binding);
                Some(*end)
            })
            .collect();
        BindingTable { bindings, ends }
    }

    pub fn slot_count(&self) -> usize {
        self.ends.last().copied().unwrap_or(0)
    }

    /// The binding covering `slot`, with the first slot of that binding.
    pub fn find(&self, slot: usize) -> Option<(&'a GenericBinding, usize)> {
        let index = self.ends.partition_point(|&end| end <= slot);
        let binding = self.bindings.get(index)?;
        Some((binding, self.ends[index] - binding_dim(binding)))
    }

    fn find_aligned(&self, slot: usize) -> Result<(&'a GenericBinding, usize)> {
        let (binding, start) = self
            .find(slot)
            .ok_or_else(|| Error::CurveShape(format!("no binding covers slot {slot}")))?;
        if start != slot {
            return Err(Error::CurveShape(format!(
                "slot {slot} is in the middle of the binding starting at {start}"
            )));
        }
        Ok((binding, binding_dim(binding)))
    }
}

fn push_keyframe(curves: &mut Curves, binding: &GenericBinding, keyframe: Keyframe) -> Result<()> {
    let key = CurveKey::from_binding(binding);
    curves
        .entry(key)
        .or_insert_with(|| Curve::new(key))
        .add_keyframe(keyframe)
}

fn skip_pptr(binding: &GenericBinding) -> bool {
    if binding.isPPtrCurve != 0 {
        tracing::debug!(
            "skipping object reference curve {:#010x}/{}",
            binding.path,
            binding.attribute
        );
        return true;
    }
    false
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct StreamedKey {
    index: usize,
    /// Cubic segment coefficients `[c0, c1, out_slope, value]`.
    coeff: [f32; 4],
}

impl StreamedKey {
    fn value(&self) -> f32 {
        self.coeff[3]
    }

    fn out_slope(&self) -> f32 {
        self.coeff[2]
    }

    /// In-slope of `rhs`, reconstructed from this key's segment.
    fn next_in_slope(&self, dx: f32, rhs: &StreamedKey) -> f32 {
        if self.coeff[0] == 0.0 && self.coeff[1] == 0.0 && self.coeff[2] == 0.0 {
            return f32::INFINITY;
        }
        let dx = dx.max(1e-4);
        let dy = rhs.value() - self.value();
        let d1 = self.out_slope() * dx;
        let d2 = 3.0 * dy - 2.0 * d1 - self.coeff[1] * dx * dx;
        d2 / dx
    }
}

#[derive(Debug)]
struct StreamedFrame {
    time: f32,
    keys: Vec<StreamedKey>,
}

struct Words<'a> {
    words: &'a [u32],
    pos: usize,
}

impl Words<'_> {
    fn next(&mut self) -> Result<u32> {
        let word = self.words.get(self.pos).copied().ok_or(Error::Truncated {
            offset: self.pos * 4,
            wanted: 4,
            available: 0,
        })?;
        self.pos += 1;
        Ok(word)
    }

    fn next_f32(&mut self) -> Result<f32> {
        self.next().map(f32::from_bits)
    }
}

fn read_streamed_frames(data: &[u32]) -> Result<Vec<StreamedFrame>> {
    let mut words = Words {
        words: data,
        pos: 0,
    };
    let mut frames = Vec::new();
    while words.pos < data.len() {
        let time = words.next_f32()?;
        let count = words.next()? as usize;
        let mut keys = Vec::with_capacity(count.min(data.len()));
        for _ in 0..count {
            let index = words.next()? as usize;
            let coeff = [
                words.next_f32()?,
                words.next_f32()?,
                words.next_f32()?,
                words.next_f32()?,
            ];
            keys.push(StreamedKey { index, coeff });
        }
        frames.push(StreamedFrame { time, keys });
    }
    Ok(frames)
}

pub fn decode_streamed(table: &BindingTable, clip: &StreamedClip, curves: &mut Curves) -> Result<()> {
    let frames = read_streamed_frames(&clip.data)?;
    // last key seen per slot, with its frame time
    let mut previous: FxHashMap<usize, (f32, StreamedKey)> = FxHashMap::default();

    // the first and last frames are sentinels at -inf and +inf
    for frame in frames.iter().filter(|frame| frame.time.is_finite()) {
        let mut i = 0;
        while i < frame.keys.len() {
            let (binding, dim) = table.find_aligned(frame.keys[i].index)?;
            let group = frame.keys.get(i..i + dim).ok_or_else(|| {
                Error::CurveShape(format!(
                    "frame at {} ends inside a {dim}-component binding",
                    frame.time
                ))
            })?;
            i += dim;
            if let Some(stray) = group.windows(2).find(|w| w[1].index != w[0].index + 1) {
                return Err(Error::CurveShape(format!(
                    "key {} does not continue the binding of key {}",
                    stray[1].index, stray[0].index
                )));
            }
            if skip_pptr(binding) {
                continue;
            }

            let key = CurveKey::from_binding(binding);
            let mut value = [0.0; 4];
            let mut in_slope = [0.0; 4];
            let mut out_slope = [0.0; 4];
            for (j, current) in group.iter().enumerate() {
                value[j] = current.value();
                out_slope[j] = current.out_slope();
                if let Some((time, prev)) = previous.insert(current.index, (frame.time, *current)) {
                    in_slope[j] = prev.next_in_slope(frame.time - time, current);
                    if in_slope[j].is_infinite() {
                        if let Some(last) = curves.get_mut(&key).and_then(Curve::last_mut) {
                            last.out_slope.as_mut_slice()[j] = f32::INFINITY;
                        }
                    }
                }
            }

            let keyframe = Keyframe::hermite(
                frame.time,
                CurveValue::from_slice(&value[..dim])?,
                CurveValue::from_slice(&in_slope[..dim])?,
                CurveValue::from_slice(&out_slope[..dim])?,
            );
            push_keyframe(curves, binding, keyframe)?;
        }
    }
    Ok(())
}

/// Packs `values` into keyframes for the bindings starting at slot `offset`.
fn for_each_binding(
    table: &BindingTable,
    offset: usize,
    values: &[f32],
    mut f: impl FnMut(&GenericBinding, CurveValue) -> Result<()>,
) -> Result<()> {
    let mut k = 0;
    while k < values.len() {
        let (binding, dim) = table.find_aligned(offset + k)?;
        let group = values.get(k..k + dim).ok_or_else(|| {
            Error::CurveShape(format!("clip data ends inside a {dim}-component binding"))
        })?;
        k += dim;
        if skip_pptr(binding) {
            continue;
        }
        f(binding, CurveValue::from_slice(group)?)?;
    }
    Ok(())
}

pub fn decode_dense(
    table: &BindingTable,
    clip: &DenseClip,
    offset: usize,
    curves: &mut Curves,
) -> Result<()> {
    let curve_count = clip.m_CurveCount as usize;
    if clip.m_FrameCount <= 0 || curve_count == 0 {
        return Ok(());
    }
    if clip.m_SampleRate <= 0.0 || !clip.m_SampleRate.is_finite() {
        return Err(Error::invalid(format!(
            "dense clip has sample rate {}",
            clip.m_SampleRate
        )));
    }

    for (frame, samples) in clip
        .m_SampleArray
        .chunks_exact(curve_count)
        .take(clip.m_FrameCount as usize)
        .enumerate()
    {
        let time = clip.m_BeginTime + frame as f32 / clip.m_SampleRate;
        for_each_binding(table, offset, samples, |binding, value| {
            push_keyframe(curves, binding, Keyframe::dense(time, value)?)
        })?;
    }
    Ok(())
}

pub fn decode_constant(
    table: &BindingTable,
    clip: &ConstantClip,
    offset: usize,
    stop_time: f32,
    curves: &mut Curves,
) -> Result<()> {
    for_each_binding(table, offset, &clip.data, |binding, value| {
        push_keyframe(curves, binding, Keyframe::constant(0.0, value)?)?;
        push_keyframe(curves, binding, Keyframe::constant(stop_time, value)?)
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub fn binding(path: u32, attribute: u32, type_id: i32) -> GenericBinding {
        GenericBinding {
            path,
            attribute,
            typeID: type_id,
            ..Default::default()
        }
    }

    /// Encodes streamed frames in the word layout of [`StreamedClip::data`].
    pub fn streamed_words(frames: &[(f32, Vec<(u32, [f32; 4])>)]) -> Vec<u32> {
        let mut words = Vec::new();
        for (time, keys) in frames {
            words.push(time.to_bits());
            words.push(keys.len() as u32);
            for &(index, coeff) in keys {
                words.push(index);
                words.extend(coeff.map(f32::to_bits));
            }
        }
        words
    }

    #[test]
    fn prefix_sum_finds_covering_binding() {
        let bindings = [
            binding(1, ATTR_POSITION, TRANSFORM_TYPE_ID),
            binding(1, ATTR_ROTATION, TRANSFORM_TYPE_ID),
            binding(2, 77, 114),
            binding(1, ATTR_EULER, TRANSFORM_TYPE_ID),
        ];
        let table = BindingTable::new(&bindings);
        assert_eq!(table.slot_count(), 11);

        let expected = [0, 0, 0, 1, 1, 1, 1, 2, 3, 3, 3];
        for (slot, &index) in expected.iter().enumerate() {
            let (found, start) = table.find(slot).unwrap();
            assert_eq!(found, &bindings[index]);
            assert!(start <= slot && slot < start + binding_dim(found));
        }
        assert!(table.find(11).is_none());
        assert!(table.find_aligned(4).is_err());
        assert_eq!(table.find_aligned(7).unwrap().1, 1);
    }

    #[test]
    fn streamed_reconstructs_in_slopes() {
        let bindings = [binding(5, 0xabc, 114)];
        let table = BindingTable::new(&bindings);
        // f(x) = x over [0, 1], then held at 1
        let data = streamed_words(&[
            (f32::NEG_INFINITY, vec![]),
            (0.0, vec![(0, [0.0, 0.0, 1.0, 0.0])]),
            (1.0, vec![(0, [0.0, 0.0, 0.0, 1.0])]),
            (2.0, vec![(0, [0.0, 0.0, 0.0, 1.0])]),
            (f32::INFINITY, vec![]),
        ]);
        let clip = StreamedClip {
            data,
            curveCount: 1,
        };
        let mut curves = Curves::default();
        decode_streamed(&table, &clip, &mut curves).unwrap();

        let curve = &curves[&CurveKey::from_binding(&bindings[0])];
        assert_eq!(curve.len(), 3);
        let keys = curve.keyframes();
        assert_eq!(keys[1].in_slope, CurveValue::Scalar(1.0));
        // a segment with zero coefficients is stepped
        assert_eq!(keys[1].out_slope, CurveValue::Scalar(f32::INFINITY));
        assert_eq!(keys[2].in_slope, CurveValue::Scalar(f32::INFINITY));

        let CurveValue::Scalar(mid) = curve.evaluate(0.5).unwrap() else {
            panic!("expected a scalar");
        };
        assert!((mid - 0.5).abs() < 1e-6);
        assert_eq!(curve.evaluate(1.5), Some(CurveValue::Scalar(1.0)));
    }

    #[test]
    fn streamed_groups_vector_bindings() {
        let bindings = [
            binding(9, ATTR_POSITION, TRANSFORM_TYPE_ID),
            binding(9, 3, 114),
        ];
        let table = BindingTable::new(&bindings);
        let data = streamed_words(&[(
            0.5,
            vec![
                (0, [0.0, 0.0, 0.0, 1.0]),
                (1, [0.0, 0.0, 0.0, 2.0]),
                (2, [0.0, 0.0, 0.0, 3.0]),
                (3, [0.0, 0.0, 0.0, 4.0]),
            ],
        )]);
        let clip = StreamedClip {
            data,
            curveCount: 4,
        };
        let mut curves = Curves::default();
        decode_streamed(&table, &clip, &mut curves).unwrap();
        assert_eq!(curves.len(), 2);
        assert_eq!(
            curves[0].keyframes()[0].value,
            CurveValue::Vec3([1.0, 2.0, 3.0])
        );
        assert_eq!(curves[1].keyframes()[0].value, CurveValue::Scalar(4.0));

        let split = streamed_words(&[(0.0, vec![(0, [0.0; 4]), (2, [0.0; 4]), (1, [0.0; 4])])]);
        let clip = StreamedClip {
            data: split,
            curveCount: 4,
        };
        assert!(matches!(
            decode_streamed(&table, &clip, &mut Curves::default()),
            Err(Error::CurveShape(_))
        ));
    }

    #[test]
    fn truncated_streamed_data_fails() {
        let bindings = [binding(1, 1, 114)];
        let table = BindingTable::new(&bindings);
        let mut data = streamed_words(&[(0.0, vec![(0, [0.0; 4])])]);
        data.pop();
        let clip = StreamedClip {
            data,
            curveCount: 1,
        };
        assert!(matches!(
            decode_streamed(&table, &clip, &mut Curves::default()),
            Err(Error::Truncated { .. })
        ));
    }

    #[test]
    fn dense_and_constant_use_slot_offsets() {
        let bindings = [
            binding(1, 10, 114),
            binding(2, ATTR_SCALE, TRANSFORM_TYPE_ID),
            binding(3, 11, 114),
        ];
        let table = BindingTable::new(&bindings);
        let dense = DenseClip {
            m_FrameCount: 3,
            m_CurveCount: 3,
            m_SampleRate: 2.0,
            m_BeginTime: 0.0,
            m_SampleArray: vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 4.0, 4.0, 4.0],
        };
        let constant = ConstantClip { data: vec![7.0] };

        let mut curves = Curves::default();
        decode_dense(&table, &dense, 1, &mut curves).unwrap();
        decode_constant(&table, &constant, 4, 2.0, &mut curves).unwrap();

        let scale = &curves[&CurveKey::from_binding(&bindings[1])];
        assert_eq!(scale.len(), 3);
        assert!(scale.keyframes().iter().all(|k| k.is_dense));
        assert_eq!(scale.keyframes()[2].time, 1.0);
        let Some(CurveValue::Vec3([x, ..])) = scale.evaluate(0.25) else {
            panic!("expected a vec3");
        };
        assert!((x - 0.5).abs() < 1e-6);

        let held = &curves[&CurveKey::from_binding(&bindings[2])];
        assert_eq!(held.len(), 2);
        assert!(held.keyframes().iter().all(|k| k.is_constant));
        assert_eq!(held.end_time(), Some(2.0));
        assert_eq!(held.evaluate(1.3), Some(CurveValue::Scalar(7.0)));
    }

    #[test]
    fn pptr_bindings_are_skipped() {
        let mut pptr = binding(1, 0, 212);
        pptr.isPPtrCurve = 1;
        let bindings = [pptr, binding(2, 0, 114)];
        let table = BindingTable::new(&bindings);
        let mut curves = Curves::default();
        decode_constant(&table, &ConstantClip { data: vec![1.0, 2.0] }, 0, 1.0, &mut curves).unwrap();
        assert_eq!(curves.len(), 1);
        assert_eq!(curves[0].key.path, 2);
    }
}
