//! Mask-driven variable-width field decoding of a frame's data.
//!
//! The payload starts with a `u32` offset to the mask region, which holds a
//! `u16` byte length followed by the mask bytes. Every variable-width field
//! first consumes two mask bits selecting one of four encodings, then reads
//! its value (if any) from the body that resumes right after the offset.

use crate::bitstream::BitstreamReader;
use crate::error::{Error, Result};

use super::RlaVersion;
use super::types::*;

/// Substituted for the float encoding `2`.
pub const FLOAT_SENTINEL: f32 = 3.4028e38;

pub struct StreamingReader<'a> {
    reader: BitstreamReader<'a>,
    pub version: RlaVersion,
    pub strict: bool,
}

impl<'a> StreamingReader<'a> {
    pub fn new(data: &'a [u8], version: RlaVersion, strict: bool) -> Result<Self> {
        let mut reader = BitstreamReader::new(data);
        let mask_offset = reader.read_u32()? as usize;
        let body_start = reader.tell();

        reader.seek(mask_offset)?;
        let mask_len = reader.read_u16()? as usize;
        let mask = reader.read_bytes(mask_len)?;
        reader.bind_mask(mask);
        reader.seek(body_start)?;

        Ok(StreamingReader {
            reader,
            version,
            strict,
        })
    }

    pub fn bit(&mut self) -> Result<bool> {
        self.reader.next_bit()
    }

    pub fn pred2(&mut self) -> Result<u8> {
        self.reader.next_pred2()
    }

    pub fn raw_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        self.reader.read_bytes(len)
    }

    pub fn byte(&mut self) -> Result<i32> {
        Ok(match self.pred2()? {
            0 => 0,
            1 => 1,
            2 => -1,
            _ => self.reader.read_u8()? as i32,
        })
    }

    pub fn ushort(&mut self) -> Result<f32> {
        Ok(match self.pred2()? {
            0 | 1 => 0.0,
            2 => self.reader.read_u8()? as f32,
            _ => self.reader.read_u16()? as f32,
        })
    }

    pub fn short(&mut self) -> Result<f32> {
        Ok(match self.pred2()? {
            0 | 1 => 0.0,
            2 => self.reader.read_i8()? as f32,
            _ => self.reader.read_i16()? as f32,
        })
    }

    pub fn int(&mut self) -> Result<i32> {
        Ok(match self.pred2()? {
            0 => 0,
            1 => self.reader.read_u8()? as i32,
            2 => self.reader.read_i8()? as i32,
            _ => self.reader.read_i32()?,
        })
    }

    pub fn long(&mut self) -> Result<i64> {
        Ok(match self.pred2()? {
            0 => 0,
            1 => self.reader.read_u8()? as i64,
            2 => self.reader.read_u16()? as i64,
            _ => self.reader.read_i64()?,
        })
    }

    pub fn float(&mut self) -> Result<f32> {
        Ok(match self.pred2()? {
            0 | 1 => 0.0,
            2 => FLOAT_SENTINEL,
            _ => self.reader.read_f32()?,
        })
    }

    pub fn vec3(&mut self) -> Result<Vector3> {
        Ok([self.float()?, self.float()?, self.float()?])
    }

    pub fn ushort_vec3(&mut self) -> Result<Vector3> {
        Ok([
            self.ushort()? * 0.01,
            self.ushort()? * 0.01,
            self.ushort()? * 0.01,
        ])
    }

    /// Euler angles stored as hundredths of a degree, returned in radians.
    pub fn rotation(&mut self) -> Result<Vector3> {
        Ok(self.ushort_vec3()?.map(f32::to_radians))
    }

    /// An integer whose width is selected by an ASCII tag byte read beforehand.
    pub fn tiny_int(&mut self, tag: u8) -> Result<i32> {
        match tag {
            b'+' => Ok(self.reader.read_u16()? as i32),
            b'*' => Ok(self.reader.read_i8()? as i32),
            b')' => Ok(self.reader.read_u8()? as i32),
            other => Err(Error::invalid(format!(
                "unknown tiny int tag {other:#04x} at offset {}",
                self.reader.tell()
            ))),
        }
    }

    pub fn string(&mut self) -> Result<Option<String>> {
        if !self.bit()? {
            return Ok(None);
        }
        let tag = self.reader.read_u8()?;
        let len = self.tiny_int(tag)?;
        let len = usize::try_from(len)
            .map_err(|_| Error::invalid(format!("negative string length {len}")))?;
        let bytes = self.reader.read_bytes(len)?;
        let string = String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::invalid(format!("string is not utf-8: {e}")))?;
        Ok(Some(string))
    }

    /// Reads an `int` count, then that many elements.
    ///
    /// Outside of strict mode, an element that fails to decode ends the array
    /// and what was read so far is returned.
    pub fn array<T>(&mut self, mut read: impl FnMut(&mut Self) -> Result<T>) -> Result<Vec<T>> {
        let count = self.int()?;
        let count = usize::try_from(count).unwrap_or(0);
        let mut items = Vec::with_capacity(count.min(self.reader.remaining() + 1));
        for i in 0..count {
            match read(self) {
                Ok(item) => items.push(item),
                Err(e) if !self.strict => {
                    tracing::debug!("array ended at {i}/{count}: {e}");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(items)
    }

    fn pose(&mut self) -> Result<PoseData> {
        let version = self.version;
        let body_position = self.vec3()?;
        let body_rotation = self.rotation()?;
        let (music_item_prop_position, music_item_prop_rotation) =
            match version.has_music_item_prop() {
                true => (Some(self.vec3()?), Some(self.rotation()?)),
                false => (None, None),
            };
        let bone_datas = self.array(Self::rotation)?;
        let shape_datas = self.array(Self::float)?;
        let prop_bone_datas = match version.has_music_item_prop() {
            true => Some(self.array(Self::rotation)?),
            false => None,
        };
        let height_offset = self.short()? * 0.01;
        let is_active = self.bit()?;
        let use_active_fx = self.bit()?;
        let is_eye_look_at = match version.has_extended_status() {
            true => Some(self.bit()?),
            false => None,
        };

        Ok(PoseData {
            body_position,
            body_rotation,
            music_item_prop_position,
            music_item_prop_rotation,
            bone_datas,
            shape_datas,
            prop_bone_datas,
            height_offset,
            is_active,
            use_active_fx,
            is_eye_look_at,
        })
    }

    fn stage_status(&mut self) -> Result<StageStatus> {
        let mut status = StageStatus {
            live_state: self.byte()?,
            light_intensity: self.float()?,
            gaya_volume: self.float()?,
            cheer_volume: self.float()?,
            character_spotlight_index: self.int()?,
            character_spotlight_intensity: self.float()?,
            stage_setlist_index: self.int()?,
            music_setlist_index: self.int()?,
            music_target_time: self.long()?,
            music_start_time: self.float()?,
            se_id: self.int()?,
            se_start_time: self.long()?,
            time_stamp: self.long()?,
            unk0: self.byte()?,
            unk1: self.byte()?,
            play_timeline_id: self.int()?,
            extended: None,
        };
        if self.version.has_extended_status() {
            status.extended = Some(StageStatusExtended {
                screen_fade_rgb: [self.byte()?, self.byte()?, self.byte()?],
                screen_fade: self.float()?,
                character_formation_rotate: self.int()?,
                stage_center_position: self.vec3()?,
                player_avatar_start_position: self.vec3()?,
            });
        }
        Ok(status)
    }

    fn character_status(&mut self) -> Result<CharacterStatus> {
        let costume_index = self.int()?;
        let use_fx = match self.version.has_character_use_fx() {
            true => Some(self.bit()?),
            false => None,
        };
        let time_stamp = self.long()?;
        Ok(CharacterStatus {
            costume_index,
            use_fx,
            time_stamp,
        })
    }

    fn header(&mut self, signature: u8) -> Result<PacketHeader> {
        let read_signature = self.byte()?;
        if read_signature != signature as i32 {
            return Err(Error::BadSignature {
                expected: signature as u16,
                actual: read_signature as u16,
            });
        }
        Ok(PacketHeader {
            signature,
            compress_type: self.int()?,
            sequence_no: self.int()?,
            target_time: self.long()?,
        })
    }

    fn body(&mut self, header: &PacketHeader) -> Result<RecordData> {
        Ok(match RecordType::from_signature(header.signature) {
            RecordType::MotionData => {
                let time_stamps = match self.pred2()? {
                    2 => Some(self.array(Self::long)?),
                    _ => None,
                };
                let poses = self.array(Self::pose)?;
                RecordData::MotionData(MotionData { time_stamps, poses })
            }
            RecordType::MotionCaptureData => {
                let data = self.array(|r| {
                    Ok(MotionCaptureFrame {
                        id: r.int()?,
                        timestamp: r.long()?,
                        pose: r.pose()?,
                    })
                })?;
                RecordData::MotionCaptureData(MotionCaptureData { data })
            }
            RecordType::SoundData => {
                let channels = self.int()?;
                let sample_rate = self.int()?;
                let len = self.int()?;
                let len = usize::try_from(len)
                    .map_err(|_| Error::invalid(format!("negative sound length {len}")))?;
                let data = self.raw_bytes(len)?.to_vec();
                let encoding = match header.compress_type {
                    1 => "hca",
                    _ => "raw",
                };
                RecordData::SoundData(SoundData {
                    channels,
                    sample_rate,
                    encoding,
                    data,
                })
            }
            RecordType::StatusData => {
                let stage_status = self.array(Self::stage_status)?;
                let groups = usize::try_from(self.int()?).unwrap_or(0);
                let mut character_status =
                    Vec::with_capacity(groups.min(self.reader.remaining() + 1));
                for _ in 0..groups {
                    character_status.push(self.array(Self::character_status)?);
                }
                RecordData::StatusData(StatusData {
                    stage_status,
                    character_status,
                })
            }
            RecordType::VirtualLiveMessageData => {
                let message_id = self.int()?;
                let user_id = self.string()?;
                let len = self.int()?;
                let len = usize::try_from(len)
                    .map_err(|_| Error::invalid(format!("negative message length {len}")))?;
                let mut raw = self.raw_bytes(len)?;
                let message = rmpv::decode::read_value(&mut raw)
                    .map_err(|e| Error::invalid(format!("message-pack message: {e}")))?;
                RecordData::VirtualLiveMessageData(VirtualLiveMessageData {
                    message_id,
                    user_id,
                    message,
                })
            }
            RecordType::ComplementInfoData => RecordData::ComplementInfoData(ComplementInfoData {
                info_type: self.int()?,
                info_data: self.string()?,
            }),
            RecordType::Unknown => RecordData::Unknown {
                signature: header.signature,
                data: self.reader.data().to_vec(),
            },
        })
    }
}

/// Decodes the record carried by an unpacked payload.
///
/// Unknown signatures are not an error: the raw data is returned as-is.
pub fn decode_streaming(
    version: RlaVersion,
    signature: u8,
    data: &[u8],
    strict: bool,
) -> Result<Record> {
    if RecordType::from_signature(signature) == RecordType::Unknown {
        tracing::warn!("unknown decoder signature {signature}, keeping raw data");
        return Ok(Record {
            header: None,
            data: RecordData::Unknown {
                signature,
                data: data.to_vec(),
            },
        });
    }

    let mut reader = StreamingReader::new(data, version, strict)?;
    let header = reader.header(signature)?;
    let data = reader.body(&header)?;
    Ok(Record {
        header: Some(header),
        data,
    })
}
