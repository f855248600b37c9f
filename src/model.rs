use crate::FC1_HIDDEN;
use crate::LABEL_VOCAB;
use crate::TOKEN_START;
use crate::config::ModelConf;
use candle_core::D;
use candle_core::Device;
use candle_core::Result;
use candle_core::Tensor;
use candle_nn::Embedding;
use candle_nn::LayerNorm;
use candle_nn::LayerNormConfig;
use candle_nn::Linear;
use candle_nn::Module;
use candle_nn::VarBuilder;
use candle_nn::embedding;
use candle_nn::layer_norm;
use candle_nn::linear;
use candle_nn::ops::softmax;

/// Sequence-to-sequence transformer mapping an encoded read pileup to a
/// haplotype base sequence.
///
/// The pileup tensor is projected per read (fc1) then per position across the
/// full read stack (fc2) into the embedding space, run through a transformer
/// encoder, and decoded autoregressively with causal self-attention plus
/// cross-attention over the encoder memory.
pub struct VarTransformer {
    fc1: Linear,
    fc2: Linear,
    positions: Tensor,
    encoder: Vec<EncoderBlock>,
    decoder: Vec<DecoderBlock>,
    embed: Embedding,
    head: Linear,
    embed_dim: usize,
}

impl VarTransformer {
    pub fn new(conf: &ModelConf, max_len: usize, vb: VarBuilder) -> Result<Self> {
        let dim = conf.embed_dim();
        let fc1 = linear(conf.feats_per_read, FC1_HIDDEN, vb.pp("fc1"))?;
        let fc2 = linear(conf.max_read_depth * FC1_HIDDEN, dim, vb.pp("fc2"))?;
        let encoder = (0..conf.encoder_layers)
            .map(|i| {
                EncoderBlock::new(
                    dim,
                    conf.encoder_attention_heads,
                    conf.dim_feedforward,
                    vb.pp(format!("encoder.{}", i)),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let decoder = (0..conf.decoder_layers)
            .map(|i| {
                DecoderBlock::new(
                    dim,
                    conf.decoder_attention_heads,
                    conf.dim_feedforward,
                    vb.pp(format!("decoder.{}", i)),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            fc1,
            fc2,
            positions: sinusoids(max_len, dim, vb.device())?,
            encoder,
            decoder,
            embed: embedding(LABEL_VOCAB, dim, vb.pp("embed"))?,
            head: linear(dim, LABEL_VOCAB, vb.pp("head"))?,
            embed_dim: dim,
        })
    }

    /// Teacher-forced forward pass.
    ///
    /// `src` is `[n, depth, feats, window]` f32, `tgt` is `[n, t]` u32 decoder
    /// input tokens. Returns `[n, t, vocab]` logits.
    pub fn forward(&self, src: &Tensor, tgt: &Tensor) -> Result<Tensor> {
        let memory = self.encode(src)?;
        self.decode(&memory, tgt)
    }

    fn encode(&self, src: &Tensor) -> Result<Tensor> {
        let (n, depth, _, window) = src.dims4()?;
        // [n, depth, feats, window] -> [n, window, depth, feats]
        let x = src.permute((0, 3, 1, 2))?.contiguous()?;
        let x = self.fc1.forward(&x)?.gelu_erf()?;
        let x = x.reshape((n, window, depth * FC1_HIDDEN))?;
        let mut x = self.fc2.forward(&x)?;
        x = x.broadcast_add(&self.positions.narrow(1, 0, window)?)?;
        for block in &self.encoder {
            x = block.forward(&x)?;
        }
        Ok(x)
    }

    fn decode(&self, memory: &Tensor, tgt: &Tensor) -> Result<Tensor> {
        let (_, t) = tgt.dims2()?;
        let mut x = self
            .embed
            .forward(tgt)?
            .affine((self.embed_dim as f64).sqrt(), 0.0)?;
        x = x.broadcast_add(&self.positions.narrow(1, 0, t)?)?;
        let mask = causal_mask(t, tgt.device())?;
        for block in &self.decoder {
            x = block.forward(&x, memory, &mask)?;
        }
        self.head.forward(&x)
    }
}

/// Decoder input for teacher forcing: start token prepended, last label
/// dropped, so position `i` predicts label `i` without seeing it.
pub fn shift_right(labels: &Tensor) -> Result<Tensor> {
    let (n, t) = labels.dims2()?;
    let start = Tensor::full(TOKEN_START as u32, (n, 1), labels.device())?;
    Tensor::cat(&[&start, &labels.narrow(1, 0, t - 1)?], 1)
}

struct EncoderBlock {
    attn: MultiHeadAttention,
    ff: FeedForward,
    ln1: LayerNorm,
    ln2: LayerNorm,
}

impl EncoderBlock {
    fn new(dim: usize, heads: usize, ff_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            attn: MultiHeadAttention::new(dim, heads, vb.pp("attn"))?,
            ff: FeedForward::new(dim, ff_dim, vb.pp("ff"))?,
            ln1: layer_norm(dim, LayerNormConfig::default(), vb.pp("ln1"))?,
            ln2: layer_norm(dim, LayerNormConfig::default(), vb.pp("ln2"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = (x + self.attn.forward(&self.ln1.forward(x)?, None, None)?)?;
        &x + self.ff.forward(&self.ln2.forward(&x)?)?
    }
}

struct DecoderBlock {
    self_attn: MultiHeadAttention,
    cross_attn: MultiHeadAttention,
    ff: FeedForward,
    ln1: LayerNorm,
    ln2: LayerNorm,
    ln3: LayerNorm,
}

impl DecoderBlock {
    fn new(dim: usize, heads: usize, ff_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            self_attn: MultiHeadAttention::new(dim, heads, vb.pp("self_attn"))?,
            cross_attn: MultiHeadAttention::new(dim, heads, vb.pp("cross_attn"))?,
            ff: FeedForward::new(dim, ff_dim, vb.pp("ff"))?,
            ln1: layer_norm(dim, LayerNormConfig::default(), vb.pp("ln1"))?,
            ln2: layer_norm(dim, LayerNormConfig::default(), vb.pp("ln2"))?,
            ln3: layer_norm(dim, LayerNormConfig::default(), vb.pp("ln3"))?,
        })
    }

    fn forward(&self, x: &Tensor, memory: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let x = (x + self.self_attn.forward(&self.ln1.forward(x)?, None, Some(mask))?)?;
        let x = (&x
            + self
                .cross_attn
                .forward(&self.ln2.forward(&x)?, Some(memory), None)?)?;
        &x + self.ff.forward(&self.ln3.forward(&x)?)?
    }
}

struct MultiHeadAttention {
    q: Linear,
    k: Linear,
    v: Linear,
    out: Linear,
    heads: usize,
    head_dim: usize,
}

impl MultiHeadAttention {
    fn new(dim: usize, heads: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            q: linear(dim, dim, vb.pp("q"))?,
            k: linear(dim, dim, vb.pp("k"))?,
            v: linear(dim, dim, vb.pp("v"))?,
            out: linear(dim, dim, vb.pp("out"))?,
            heads,
            head_dim: dim / heads,
        })
    }

    /// Self-attention when `kv` is None, cross-attention otherwise.
    fn forward(&self, x: &Tensor, kv: Option<&Tensor>, mask: Option<&Tensor>) -> Result<Tensor> {
        let kv = kv.unwrap_or(x);
        let (n, tq, dim) = x.dims3()?;
        let (_, tk, _) = kv.dims3()?;
        let q = self.split(&self.q.forward(x)?, n, tq)?;
        let k = self.split(&self.k.forward(kv)?, n, tk)?;
        let v = self.split(&self.v.forward(kv)?, n, tk)?;
        let scores = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? / (self.head_dim as f64).sqrt())?;
        let scores = match mask {
            Some(mask) => masked_fill(&scores, &mask.broadcast_as(scores.shape())?)?,
            None => scores,
        };
        let context = softmax(&scores, D::Minus1)?
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((n, tq, dim))?;
        self.out.forward(&context)
    }

    fn split(&self, x: &Tensor, n: usize, t: usize) -> Result<Tensor> {
        x.reshape((n, t, self.heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }
}

struct FeedForward {
    up: Linear,
    down: Linear,
}

impl FeedForward {
    fn new(dim: usize, ff_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            up: linear(dim, ff_dim, vb.pp("up"))?,
            down: linear(ff_dim, dim, vb.pp("down"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.down.forward(&self.up.forward(x)?.gelu_erf()?)
    }
}

/// Upper-triangular mask, 1 where key position follows query position.
fn causal_mask(t: usize, device: &Device) -> Result<Tensor> {
    let mask = (0..t)
        .flat_map(|i| (0..t).map(move |j| u8::from(j > i)))
        .collect::<Vec<_>>();
    Tensor::from_vec(mask, (t, t), device)
}

fn masked_fill(scores: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let neg_inf = Tensor::new(f32::NEG_INFINITY, scores.device())?.broadcast_as(scores.shape())?;
    mask.where_cond(&neg_inf, scores)
}

/// Fixed sinusoidal position table `[1, max_len, dim]`.
fn sinusoids(max_len: usize, dim: usize, device: &Device) -> Result<Tensor> {
    let mut table = vec![0f32; max_len * dim];
    for pos in 0..max_len {
        for i in 0..dim / 2 {
            let angle = pos as f64 / 10_000f64.powf(2.0 * i as f64 / dim as f64);
            table[pos * dim + 2 * i] = angle.sin() as f32;
            table[pos * dim + 2 * i + 1] = angle.cos() as f32;
        }
    }
    Tensor::from_vec(table, (1, max_len, dim), device)
}
