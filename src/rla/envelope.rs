use std::io::Read;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use flate2::read::GzDecoder;

use crate::bitstream::BitstreamReader;
use crate::error::{Error, Result};

pub const ENVELOPE_MAGIC: &[u8; 4] = b"RTVL";
pub const ENVELOPE_HEADER_LEN: usize = 15;

/// The outer `RTVL` framing of a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Three decimal digits, `000..=999`.
    pub signature: u16,
    pub is_base64: bool,
    pub is_split: bool,
    /// Body after base64 decoding, if the envelope declared it.
    pub body: Vec<u8>,
}

fn parse_flag(byte: u8, name: &str) -> Result<bool> {
    match byte {
        b'T' => Ok(true),
        b'F' => Ok(false),
        other => Err(Error::BadHeader(format!(
            "{name} flag must be 'T' or 'F', got {other:#04x}"
        ))),
    }
}

fn parse_ascii_number(bytes: &[u8], radix: u32, what: &str) -> Result<usize> {
    // from_str_radix would also take a leading sign
    let digits = bytes.iter().all(|&b| char::from(b).is_digit(radix));
    std::str::from_utf8(bytes)
        .ok()
        .filter(|_| digits)
        .and_then(|text| usize::from_str_radix(text, radix).ok())
        .ok_or_else(|| Error::BadHeader(format!("invalid {what} {bytes:?}")))
}

pub fn decode_envelope(buf: &[u8]) -> Result<Envelope> {
    if buf.len() < ENVELOPE_HEADER_LEN {
        return Err(Error::BadHeader(format!(
            "envelope is {} bytes, shorter than its header",
            buf.len()
        )));
    }
    let (header, body) = buf.split_at(ENVELOPE_HEADER_LEN);
    if &header[..4] != ENVELOPE_MAGIC {
        return Err(Error::BadHeader(format!("bad magic {:?}", &header[..4])));
    }
    let declared = parse_ascii_number(&header[4..10], 16, "envelope length")?;
    let is_base64 = parse_flag(header[10], "base64")?;
    let is_split = parse_flag(header[11], "split")?;
    if !header[12..15].iter().all(u8::is_ascii_digit) {
        return Err(Error::BadHeader(format!(
            "invalid signature digits {:?}",
            &header[12..15]
        )));
    }
    let signature = parse_ascii_number(&header[12..15], 10, "signature")? as u16;

    let actual = body.len() + ENVELOPE_HEADER_LEN;
    if actual != declared {
        return Err(Error::LengthMismatch { declared, actual });
    }

    let body = match is_base64 {
        true => STANDARD
            .decode(body)
            .map_err(|e| Error::BadHeader(format!("invalid base64 body: {e}")))?,
        false => body.to_vec(),
    };

    Ok(Envelope {
        signature,
        is_base64,
        is_split,
        body,
    })
}

/// Splits a payload into its decoder signature and (decompressed) data.
pub fn decode_payload(body: &[u8]) -> Result<(u8, Vec<u8>)> {
    let mut reader = BitstreamReader::new(body);
    let signature = reader.read_u8()?;
    let unk1 = reader.read_u32()?;
    let compressed = match unk1 {
        0 => reader.read_u32()? != 0,
        _ => false,
    };
    let rest = reader.read_rest();

    let data = match compressed {
        true => {
            let mut out = Vec::with_capacity(rest.len() * 4);
            GzDecoder::new(rest)
                .read_to_end(&mut out)
                .map_err(|e| Error::invalid(format!("gzip payload: {e}")))?;
            out
        }
        false => rest.to_vec(),
    };
    Ok((signature, data))
}

/// Envelope and payload unpacking in one go; checks that both signatures agree.
pub fn unpack(buf: &[u8]) -> Result<(u8, Vec<u8>)> {
    let envelope = decode_envelope(buf)?;
    let (signature, data) = decode_payload(&envelope.body)?;
    if envelope.signature != signature as u16 {
        return Err(Error::BadSignature {
            expected: envelope.signature,
            actual: signature as u16,
        });
    }
    Ok((signature, data))
}

/// Frames a payload, the inverse of [`decode_envelope`].
pub fn encode_envelope(signature: u16, body: &[u8], base64: bool) -> Vec<u8> {
    let body = match base64 {
        true => STANDARD.encode(body).into_bytes(),
        false => body.to_vec(),
    };
    let mut out = format!(
        "RTVL{:06x}{}F{:03}",
        body.len() + ENVELOPE_HEADER_LEN,
        if base64 { 'T' } else { 'F' },
        signature
    )
    .into_bytes();
    out.extend_from_slice(&body);
    out
}
