//! Bundle-body obfuscation and the AES manifest cipher.

use std::io::{self, Read};

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::cache::Region;
use crate::error::{Error, Result};

/// Leading bytes of an obfuscated bundle body.
pub const BUNDLE_MAGIC: [u8; 4] = [0x10, 0x00, 0x00, 0x00];
/// Length of the obfuscated region following the magic.
pub const OBFUSCATED_LEN: usize = 128;

/// Inverts the first five bytes of every eight-byte block. Its own inverse.
fn flip_blocks(data: &mut [u8]) {
    for block in data.chunks_mut(8) {
        for byte in block.iter_mut().take(5) {
            *byte = !*byte;
        }
    }
}

/// Removes the obfuscation of an in-memory bundle body.
pub fn decrypt_bundle(data: &[u8]) -> Vec<u8> {
    match data.strip_prefix(&BUNDLE_MAGIC) {
        Some(body) => {
            let mut out = body.to_vec();
            let len = out.len().min(OBFUSCATED_LEN);
            flip_blocks(&mut out[..len]);
            out
        }
        None => data.to_vec(),
    }
}

/// Obfuscates a bundle body the way the asset server delivers it.
pub fn encrypt_bundle(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + BUNDLE_MAGIC.len());
    out.extend_from_slice(&BUNDLE_MAGIC);
    out.extend_from_slice(data);
    let len = data.len().min(OBFUSCATED_LEN);
    flip_blocks(&mut out[BUNDLE_MAGIC.len()..BUNDLE_MAGIC.len() + len]);
    out
}

/// Adapts a reader into a pull function returning up to `n` bytes,
/// fewer only at the end of the input.
pub fn pull_from<R: Read>(mut reader: R) -> impl FnMut(usize) -> io::Result<Vec<u8>> {
    move |n| {
        let mut buf = Vec::with_capacity(n);
        reader.by_ref().take(n as u64).read_to_end(&mut buf)?;
        Ok(buf)
    }
}

/// Streaming bundle decryption, yielding blocks pulled from `pull`.
///
/// The first block is the de-obfuscated region (or, without the magic, the
/// first four bytes unchanged); every later block is at most `block_size`
/// bytes and passed through.
pub struct BundleDecryptor<F> {
    pull: F,
    block_size: usize,
    started: bool,
    done: bool,
}

impl<F> BundleDecryptor<F>
where
    F: FnMut(usize) -> io::Result<Vec<u8>>,
{
    pub fn new(pull: F, block_size: usize) -> Self {
        BundleDecryptor {
            pull,
            block_size: block_size.max(1),
            started: false,
            done: false,
        }
    }

    fn first_block(&mut self) -> io::Result<Vec<u8>> {
        let head = (self.pull)(BUNDLE_MAGIC.len())?;
        if head != BUNDLE_MAGIC {
            return Ok(head);
        }
        let mut block = (self.pull)(OBFUSCATED_LEN)?;
        flip_blocks(&mut block);
        Ok(block)
    }
}

impl<F> Iterator for BundleDecryptor<F>
where
    F: FnMut(usize) -> io::Result<Vec<u8>>,
{
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let block = match self.started {
            false => {
                self.started = true;
                self.first_block()
            }
            true => (self.pull)(self.block_size),
        };
        match block {
            Ok(block) if block.is_empty() => {
                self.done = true;
                None
            }
            Ok(block) => Some(Ok(block)),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// [`BundleDecryptor`] exposed as a [`Read`].
pub struct DecryptingReader<F> {
    blocks: BundleDecryptor<F>,
    pending: Vec<u8>,
    pos: usize,
}

pub type BoxedPull = Box<dyn FnMut(usize) -> io::Result<Vec<u8>> + Send>;

impl DecryptingReader<BoxedPull> {
    pub fn new<R: Read + Send + 'static>(reader: R, block_size: usize) -> Self {
        let pull: BoxedPull = Box::new(pull_from(reader));
        DecryptingReader {
            blocks: BundleDecryptor::new(pull, block_size),
            pending: Vec::new(),
            pos: 0,
        }
    }
}

impl<F> Read for DecryptingReader<F>
where
    F: FnMut(usize) -> io::Result<Vec<u8>>,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.pending.len() {
            match self.blocks.next() {
                Some(block) => {
                    self.pending = block?;
                    self.pos = 0;
                }
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len() - self.pos);
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// An AES-128 key and IV pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keyset {
    pub key: [u8; 16],
    pub iv: [u8; 16],
}

impl Keyset {
    pub fn from_hex(key: &str, iv: &str) -> Result<Self> {
        let decode = |text: &str, what: &str| {
            let mut out = [0u8; 16];
            hex::decode_to_slice(text.trim(), &mut out)
                .map_err(|e| Error::CipherError(format!("invalid {what} '{text}': {e}")))?;
            Ok::<_, Error>(out)
        };
        Ok(Keyset {
            key: decode(key, "key")?,
            iv: decode(iv, "iv")?,
        })
    }

    /// The built-in keyset of a region, if it has one.
    pub fn builtin(region: Region) -> Option<Keyset> {
        match region {
            Region::Jp => Some(Keyset {
                key: *b"g2fcC0ZczN9MTJ61",
                iv: *b"msx3IV0i9XE5uYZ1",
            }),
            Region::En => Some(Keyset {
                key: [
                    0xdf, 0x38, 0x42, 0x14, 0xb2, 0x9a, 0x3a, 0xdf, 0xbf, 0x1b, 0xd9, 0xee, 0x5b,
                    0x16, 0xf8, 0x84,
                ],
                iv: [
                    0x7e, 0x85, 0x6c, 0x90, 0x79, 0x87, 0xf8, 0xae, 0xc6, 0xaf, 0xc0, 0xc5, 0x47,
                    0x38, 0xfc, 0x7e,
                ],
            }),
            Region::Tw | Region::Kr | Region::Cn => None,
        }
    }
}

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// AES-128-CBC/PKCS#7 over message-pack, as used by the game API.
#[derive(Debug, Clone)]
pub struct ManifestCipher {
    keyset: Keyset,
}

impl ManifestCipher {
    pub fn new(keyset: Keyset) -> Self {
        ManifestCipher { keyset }
    }

    /// The override if given, the region's built-in keyset otherwise.
    pub fn for_region(region: Region, keyset: Option<Keyset>) -> Result<Self> {
        keyset
            .or_else(|| Keyset::builtin(region))
            .map(ManifestCipher::new)
            .ok_or_else(|| Error::CipherError(format!("no keyset configured for region {region}")))
    }

    pub fn encrypt(&self, data: &[u8]) -> Vec<u8> {
        let Keyset { key, iv } = self.keyset;
        Aes128CbcEnc::new(&key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(data)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let Keyset { key, iv } = self.keyset;
        Aes128CbcDec::new(&key.into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(data)
            .map_err(|e| Error::CipherError(format!("{} byte body: {e}", data.len())))
    }

    /// Serializes to named message-pack and encrypts.
    pub fn pack<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        let data = rmp_serde::to_vec_named(value)
            .map_err(|e| Error::CipherError(format!("message-pack encode: {e}")))?;
        Ok(self.encrypt(&data))
    }

    pub fn unpack<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T> {
        let data = self.decrypt(body)?;
        rmp_serde::from_slice(&data)
            .map_err(|e| Error::CipherError(format!("message-pack decode: {e}")))
    }

    /// Decrypts into an untyped message-pack value.
    pub fn unpack_value(&self, body: &[u8]) -> Result<rmpv::Value> {
        let data = self.decrypt(body)?;
        rmpv::decode::read_value(&mut data.as_slice())
            .map_err(|e| Error::CipherError(format!("message-pack decode: {e}")))
    }
}
