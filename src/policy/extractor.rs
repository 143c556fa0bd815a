// =============================================================================
// Feature Extractors — MLP passthrough and Transformer encoder
// =============================================================================
//
// The Transformer extractor processes only the temporal portion of the
// observation (window × features), reshaped back to a sequence:
//
//   1. Multi-scale 1D CNN (parallel kernels 3/5/7/14, 64 channels each,
//      BatchNorm + ReLU, concatenated to 256 channels, projected + LayerNorm)
//   2. Optional linear projection to d_model
//   3. Sinusoidal positional encoding with dropout
//   4. n_layers post-norm Transformer encoder blocks
//   5. Market-regime head over the last timestep (auxiliary, 4 regimes)
//   6. Multi-scale temporal aggregation (mean pools over 5/20/full window)
//   7. Portfolio features projected to d_model and concatenated
//
// Final feature width: 4 × d_model.
// =============================================================================

use candle_core::{Device, IndexOp, Result, Tensor, D};
use candle_nn::{
    batch_norm, conv1d, layer_norm, linear, ops, BatchNorm, BatchNormConfig, Conv1d, Conv1dConfig,
    Dropout, LayerNorm, LayerNormConfig, Linear, Module, ModuleT, VarBuilder,
};

/// Number of market regimes the auxiliary head distinguishes
/// (trend, range, volatile, crash).
pub const N_REGIMES: usize = 4;

const CNN_CHANNELS: usize = 64;
const CNN_KERNELS: [usize; 4] = [3, 5, 7, 14];

/// Shape parameters of the Transformer extractor, taken from the persisted
/// agent config.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformerShape {
    pub seq_len: usize,
    pub input_dim: usize,
    pub d_model: usize,
    pub n_heads: usize,
    pub n_layers: usize,
    pub d_ff: usize,
    pub dropout: f64,
}

// =============================================================================
// Positional encoding
// =============================================================================

/// Sinusoidal positional encoding for the bar sequence.
pub struct PositionalEncoding {
    pe: Tensor,
    dropout: Dropout,
}

impl PositionalEncoding {
    pub fn new(d_model: usize, max_len: usize, dropout: f64, device: &Device) -> Result<Self> {
        let mut values = vec![0f32; max_len * d_model];
        for pos in 0..max_len {
            for i in (0..d_model).step_by(2) {
                let angle =
                    pos as f64 / 10_000f64.powf(i as f64 / d_model as f64);
                values[pos * d_model + i] = angle.sin() as f32;
                if i + 1 < d_model {
                    values[pos * d_model + i + 1] = angle.cos() as f32;
                }
            }
        }
        let pe = Tensor::from_vec(values, (1, max_len, d_model), device)?;
        Ok(Self {
            pe,
            dropout: Dropout::new(dropout as f32),
        })
    }

    /// x: [batch, seq_len, d_model]
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let seq_len = x.dim(1)?;
        let pe = self.pe.i((.., ..seq_len, ..))?;
        let x = x.broadcast_add(&pe)?;
        self.dropout.forward(&x, train)
    }
}

// =============================================================================
// Multi-scale CNN
// =============================================================================

/// Parallel 1D convolutions at four temporal scales, fused and normalised.
pub struct MultiScaleCnn {
    convs: Vec<Conv1d>,
    bns: Vec<BatchNorm>,
    projection: Linear,
    norm: LayerNorm,
}

impl MultiScaleCnn {
    pub fn new(in_channels: usize, vb: VarBuilder) -> Result<Self> {
        let mut convs = Vec::new();
        let mut bns = Vec::new();
        for (i, &k) in CNN_KERNELS.iter().enumerate() {
            let cfg = Conv1dConfig {
                padding: k / 2,
                ..Default::default()
            };
            convs.push(conv1d(
                in_channels,
                CNN_CHANNELS,
                k,
                cfg,
                vb.pp(format!("conv{i}")),
            )?);
            bns.push(batch_norm(
                CNN_CHANNELS,
                BatchNormConfig::default(),
                vb.pp(format!("bn{i}")),
            )?);
        }
        let out_dim = CNN_CHANNELS * CNN_KERNELS.len();
        let projection = linear(out_dim, out_dim, vb.pp("projection"))?;
        let norm = layer_norm(out_dim, LayerNormConfig::default(), vb.pp("norm"))?;
        Ok(Self {
            convs,
            bns,
            projection,
            norm,
        })
    }

    pub fn out_dim() -> usize {
        CNN_CHANNELS * CNN_KERNELS.len()
    }

    /// x: [batch, seq_len, in_channels] -> [batch, seq_len, 256]
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let seq_len = x.dim(1)?;
        // Conv1d wants [batch, channels, seq_len].
        let xt = x.transpose(1, 2)?.contiguous()?;
        let mut outs = Vec::with_capacity(self.convs.len());
        for (conv, bn) in self.convs.iter().zip(&self.bns) {
            let mut out = conv.forward(&xt)?;
            // Even kernels with k/2 padding emit one extra frame; crop back.
            if out.dim(2)? > seq_len {
                out = out.narrow(2, 0, seq_len)?;
            }
            let out = bn.forward_t(&out, train)?;
            outs.push(out.relu()?);
        }
        let fused = Tensor::cat(&outs, 1)?; // [batch, 256, seq_len]
        let fused = fused.transpose(1, 2)?.contiguous()?; // [batch, seq_len, 256]
        let fused = self.projection.forward(&fused)?;
        self.norm.forward(&fused)
    }
}

// =============================================================================
// Transformer encoder block (post-norm residual)
// =============================================================================

pub struct TransformerBlock {
    wq: Linear,
    wk: Linear,
    wv: Linear,
    wo: Linear,
    norm1: LayerNorm,
    norm2: LayerNorm,
    ffn1: Linear,
    ffn2: Linear,
    dropout: Dropout,
    n_heads: usize,
    head_dim: usize,
}

impl TransformerBlock {
    pub fn new(d_model: usize, n_heads: usize, d_ff: usize, dropout: f64, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            wq: linear(d_model, d_model, vb.pp("wq"))?,
            wk: linear(d_model, d_model, vb.pp("wk"))?,
            wv: linear(d_model, d_model, vb.pp("wv"))?,
            wo: linear(d_model, d_model, vb.pp("wo"))?,
            norm1: layer_norm(d_model, LayerNormConfig::default(), vb.pp("norm1"))?,
            norm2: layer_norm(d_model, LayerNormConfig::default(), vb.pp("norm2"))?,
            ffn1: linear(d_model, d_ff, vb.pp("ffn1"))?,
            ffn2: linear(d_ff, d_model, vb.pp("ffn2"))?,
            dropout: Dropout::new(dropout as f32),
            n_heads,
            head_dim: d_model / n_heads,
        })
    }

    fn attention(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (batch, seq_len, d_model) = x.dims3()?;
        let split = |t: Tensor| -> Result<Tensor> {
            t.reshape((batch, seq_len, self.n_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = split(self.wq.forward(x)?)?;
        let k = split(self.wk.forward(x)?)?;
        let v = split(self.wv.forward(x)?)?;

        let scale = (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? / scale)?;
        let attn = ops::softmax(&scores, D::Minus1)?;
        let attn = self.dropout.forward(&attn, train)?;
        let out = attn.matmul(&v)?; // [batch, heads, seq, head_dim]
        let out = out
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq_len, d_model))?;
        let out = self.wo.forward(&out)?;
        self.dropout.forward(&out, train)
    }

    /// x: [batch, seq_len, d_model]
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let attn_out = self.attention(x, train)?;
        let x = self.norm1.forward(&(x + attn_out)?)?;

        let ffn = self.ffn1.forward(&x)?.relu()?;
        let ffn = self.dropout.forward(&ffn, train)?;
        let ffn = self.ffn2.forward(&ffn)?;
        let ffn = self.dropout.forward(&ffn, train)?;
        self.norm2.forward(&(&x + ffn)?)
    }
}

// =============================================================================
// Market-regime head (auxiliary)
// =============================================================================

pub struct RegimeHead {
    l1: Linear,
    l2: Linear,
    l3: Linear,
    dropout: Dropout,
}

impl RegimeHead {
    pub fn new(d_model: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            l1: linear(d_model, 128, vb.pp("l1"))?,
            l2: linear(128, 64, vb.pp("l2"))?,
            l3: linear(64, N_REGIMES, vb.pp("l3"))?,
            dropout: Dropout::new(0.1),
        })
    }

    /// x: [batch, seq_len, d_model] -> regime probabilities [batch, 4]
    /// from the last timestep.
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let last = x.i((.., x.dim(1)? - 1, ..))?;
        let h = self.dropout.forward(&self.l1.forward(&last)?.relu()?, train)?;
        let h = self.dropout.forward(&self.l2.forward(&h)?.relu()?, train)?;
        let logits = self.l3.forward(&h)?;
        ops::softmax(&logits, D::Minus1)
    }
}

// =============================================================================
// Multi-scale temporal aggregation
// =============================================================================

pub struct MultiScaleAggregation {
    projection: Linear,
    norm: LayerNorm,
}

impl MultiScaleAggregation {
    pub fn new(d_model: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            projection: linear(d_model * 3, d_model * 3, vb.pp("projection"))?,
            norm: layer_norm(d_model * 3, LayerNormConfig::default(), vb.pp("norm"))?,
        })
    }

    /// x: [batch, seq_len, d_model] -> [batch, 3 × d_model]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let seq_len = x.dim(1)?;
        let pool = |window: usize| -> Result<Tensor> {
            let w = window.min(seq_len);
            x.narrow(1, seq_len - w, w)?.mean(1)
        };
        let short = pool(5)?;
        let medium = pool(20)?;
        let long = x.mean(1)?;
        let cat = Tensor::cat(&[short, medium, long], D::Minus1)?;
        let out = self.projection.forward(&cat)?;
        self.norm.forward(&out)?.relu()
    }
}

// =============================================================================
// Transformer extractor
// =============================================================================

/// Full Transformer feature extractor over the temporal observation slice,
/// with the trailing portfolio scalars projected in separately.
pub struct TransformerExtractor {
    shape: TransformerShape,
    cnn: MultiScaleCnn,
    input_projection: Option<Linear>,
    pos_encoding: PositionalEncoding,
    blocks: Vec<TransformerBlock>,
    regime: RegimeHead,
    aggregation: MultiScaleAggregation,
    portfolio_projection: Linear,
    n_portfolio_features: usize,
}

impl TransformerExtractor {
    pub fn new(
        shape: TransformerShape,
        n_portfolio_features: usize,
        vb: VarBuilder,
        device: &Device,
    ) -> Result<Self> {
        let cnn = MultiScaleCnn::new(shape.input_dim, vb.pp("cnn"))?;
        let input_projection = if MultiScaleCnn::out_dim() != shape.d_model {
            Some(linear(
                MultiScaleCnn::out_dim(),
                shape.d_model,
                vb.pp("input_projection"),
            )?)
        } else {
            None
        };
        let pos_encoding =
            PositionalEncoding::new(shape.d_model, shape.seq_len.max(1), shape.dropout, device)?;
        let mut blocks = Vec::with_capacity(shape.n_layers);
        for i in 0..shape.n_layers {
            blocks.push(TransformerBlock::new(
                shape.d_model,
                shape.n_heads,
                shape.d_ff,
                shape.dropout,
                vb.pp(format!("block{i}")),
            )?);
        }
        let regime = RegimeHead::new(shape.d_model, vb.pp("regime"))?;
        let aggregation = MultiScaleAggregation::new(shape.d_model, vb.pp("aggregation"))?;
        let portfolio_projection = linear(
            n_portfolio_features,
            shape.d_model,
            vb.pp("portfolio_projection"),
        )?;
        Ok(Self {
            shape,
            cnn,
            input_projection,
            pos_encoding,
            blocks,
            regime,
            aggregation,
            portfolio_projection,
            n_portfolio_features,
        })
    }

    /// Width of the extracted feature vector: 4 × d_model.
    pub fn features_dim(&self) -> usize {
        self.shape.d_model * 4
    }

    fn encode(&self, observations: &Tensor, train: bool) -> Result<Tensor> {
        let batch = observations.dim(0)?;
        let temporal_size = self.shape.seq_len * self.shape.input_dim;
        let temporal = observations.narrow(1, 0, temporal_size)?;
        let x = temporal.reshape((batch, self.shape.seq_len, self.shape.input_dim))?;

        let mut x = self.cnn.forward(&x, train)?;
        if let Some(proj) = &self.input_projection {
            x = proj.forward(&x)?;
        }
        x = self.pos_encoding.forward(&x, train)?;
        for block in &self.blocks {
            x = block.forward(&x, train)?;
        }
        Ok(x)
    }

    /// observations: [batch, seq_len × input_dim + n_portfolio_features]
    /// -> features [batch, 4 × d_model]
    pub fn forward(&self, observations: &Tensor, train: bool) -> Result<Tensor> {
        let temporal_size = self.shape.seq_len * self.shape.input_dim;
        let encoded = self.encode(observations, train)?;
        let temporal_features = self.aggregation.forward(&encoded)?;

        let portfolio = observations.narrow(1, temporal_size, self.n_portfolio_features)?;
        let portfolio_features = self.portfolio_projection.forward(&portfolio)?;

        Tensor::cat(&[temporal_features, portfolio_features], D::Minus1)
    }

    /// Auxiliary regime probabilities for monitoring.
    pub fn regime_probs(&self, observations: &Tensor) -> Result<Tensor> {
        let encoded = self.encode(observations, false)?;
        self.regime.forward(&encoded, false)
    }
}
