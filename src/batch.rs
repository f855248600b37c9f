use crate::Feature;
use crate::Token;
use crate::encode::EncodedExample;
use crate::encode::RegionEncoder;
use crate::error::Result;
use crate::error::VarformerError;
use byteorder::BE;
use byteorder::ReadBytesExt;
use byteorder::WriteBytesExt;
use candle_core::Device;
use candle_core::Tensor;
use std::io::Read;

/// Signature header for serialized batches.
const MAGIC: &[u8] = b"VFBATCH\0";
/// Signature footer to signal end of a well-formed batch.
const FOOTER: u16 = 0xFFFF;

/// A fixed number of encoded examples stacked into contiguous buffers, the
/// unit of shard storage. All examples share identical shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub examples: usize,
    pub depth: usize,
    pub feats: usize,
    pub window: usize,
    pub label_len: usize,
    /// `[examples, depth, feats, window]` row-major.
    pub src: Vec<Feature>,
    /// `[examples, label_len]` row-major.
    pub labels: Vec<Token>,
}

impl Batch {
    pub fn stack(examples: Vec<EncodedExample>, encoder: &RegionEncoder) -> Self {
        let n = examples.len();
        let mut src = Vec::with_capacity(n * encoder.src_len());
        let mut labels = Vec::with_capacity(n * encoder.label_len);
        for example in examples {
            assert!(example.src.len() == encoder.src_len());
            assert!(example.labels.len() == encoder.label_len);
            src.extend(example.src);
            labels.extend(example.labels);
        }
        Self {
            examples: n,
            depth: encoder.max_read_depth,
            feats: encoder.feats_per_read,
            window: encoder.window,
            label_len: encoder.label_len,
            src,
            labels,
        }
    }

    /// Serialize and zstd-compress into one shard payload.
    pub fn compress(&self) -> Result<Vec<u8>> {
        let raw = self.to_bytes();
        Ok(zstd::encode_all(raw.as_slice(), 0).map_err(VarformerError::Io)?)
    }

    /// Decompress and deserialize a shard payload. Any framing violation is
    /// a codec error the caller attributes to the shard at hand.
    pub fn decompress(bytes: &[u8]) -> Result<Self> {
        let raw = zstd::decode_all(bytes)
            .map_err(|e| VarformerError::Config(format!("zstd: {}", e)))?;
        Self::from_bytes(&raw)
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MAGIC.len() + 16 + self.src.len() + self.labels.len());
        out.extend_from_slice(MAGIC);
        out.write_u16::<BE>(crate::ENCODING_VERSION).expect("vec write");
        out.write_u32::<BE>(self.examples as u32).expect("vec write");
        out.write_u16::<BE>(self.depth as u16).expect("vec write");
        out.write_u16::<BE>(self.feats as u16).expect("vec write");
        out.write_u16::<BE>(self.window as u16).expect("vec write");
        out.write_u16::<BE>(self.label_len as u16).expect("vec write");
        out.extend(self.src.iter().map(|&f| f as u8));
        out.extend_from_slice(&self.labels);
        out.write_u16::<BE>(FOOTER).expect("vec write");
        out
    }

    fn from_bytes(mut raw: &[u8]) -> Result<Self> {
        let ref mut reader = raw;
        let mut magic = [0u8; 8];
        reader
            .read_exact(&mut magic)
            .map_err(|_| corrupt("truncated header"))?;
        if magic != MAGIC {
            return Err(corrupt("bad magic"));
        }
        let version = reader.read_u16::<BE>().map_err(|_| corrupt("truncated header"))?;
        if version != crate::ENCODING_VERSION {
            return Err(corrupt(&format!("unsupported encoding version {}", version)));
        }
        let examples = reader.read_u32::<BE>().map_err(|_| corrupt("truncated header"))? as usize;
        let depth = reader.read_u16::<BE>().map_err(|_| corrupt("truncated header"))? as usize;
        let feats = reader.read_u16::<BE>().map_err(|_| corrupt("truncated header"))? as usize;
        let window = reader.read_u16::<BE>().map_err(|_| corrupt("truncated header"))? as usize;
        let label_len = reader.read_u16::<BE>().map_err(|_| corrupt("truncated header"))? as usize;
        // dims come off the wire; sizes must be overflow-free and fit the payload
        let src_len = examples
            .checked_mul(depth)
            .and_then(|n| n.checked_mul(feats))
            .and_then(|n| n.checked_mul(window))
            .ok_or_else(|| corrupt("implausible dimensions"))?;
        let label_total = examples
            .checked_mul(label_len)
            .ok_or_else(|| corrupt("implausible dimensions"))?;
        let payload = src_len
            .checked_add(label_total)
            .and_then(|n| n.checked_add(2))
            .ok_or_else(|| corrupt("implausible dimensions"))?;
        if payload > reader.len() {
            return Err(corrupt("dimensions exceed payload"));
        }
        let mut src = vec![0u8; src_len];
        reader
            .read_exact(&mut src)
            .map_err(|_| corrupt("truncated features"))?;
        let mut labels = vec![0u8; label_total];
        reader
            .read_exact(&mut labels)
            .map_err(|_| corrupt("truncated labels"))?;
        match reader.read_u16::<BE>() {
            Ok(FOOTER) => {}
            _ => return Err(corrupt("missing footer")),
        }
        Ok(Self {
            examples,
            depth,
            feats,
            window,
            label_len,
            src: src.into_iter().map(|b| b as Feature).collect(),
            labels,
        })
    }

    /// Materialize candle tensors: f32 features `[n, depth, feats, window]`
    /// and u32 label tokens `[n, label_len]`.
    pub fn to_tensors(&self, device: &Device) -> Result<(Tensor, Tensor)> {
        let src = self.src.iter().map(|&f| f as f32).collect::<Vec<_>>();
        let src = Tensor::from_vec(src, (self.examples, self.depth, self.feats, self.window), device)?;
        let labels = self.labels.iter().map(|&t| t as u32).collect::<Vec<_>>();
        let labels = Tensor::from_vec(labels, (self.examples, self.label_len), device)?;
        Ok((src, labels))
    }
}

fn corrupt(reason: &str) -> VarformerError {
    VarformerError::Config(format!("batch codec: {}", reason))
}
