//! Building blocks shared by Tacotron2 and WaveGlow.
//!
//! Parameter names follow the PyTorch modules they mirror, so checkpoints
//! exported from the reference training code bind without renaming.

use candle_core::{DType, Device, Module, ModuleT, Tensor};
use candle_nn::init::{DEFAULT_KAIMING_NORMAL, Init};
use candle_nn::rnn::{Direction, LSTMConfig, RNN};
use candle_nn::{BatchNorm, Conv1d, Conv1dConfig, LSTM, Linear, VarBuilder};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::Result;

/// `LinearNorm`: a linear layer stored under `linear_layer`.
pub fn linear_norm(in_dim: usize, out_dim: usize, bias: bool, vb: VarBuilder) -> Result<Linear> {
    Ok(candle_nn::linear_b(in_dim, out_dim, bias, vb.pp("linear_layer"))?)
}

/// `ConvNorm`: a same-padded 1D convolution stored under `conv`.
pub fn conv_norm(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    bias: bool,
    vb: VarBuilder,
) -> Result<Conv1d> {
    let cfg = Conv1dConfig {
        padding: (kernel_size - 1) / 2,
        ..Default::default()
    };
    let conv = if bias {
        candle_nn::conv1d(in_channels, out_channels, kernel_size, cfg, vb.pp("conv"))?
    } else {
        candle_nn::conv1d_no_bias(in_channels, out_channels, kernel_size, cfg, vb.pp("conv"))?
    };
    Ok(conv)
}

/// `Sequential(ConvNorm, BatchNorm1d)` as used by the encoder and post-net.
#[derive(Debug, Clone)]
pub struct ConvBatchNorm {
    conv: Conv1d,
    norm: BatchNorm,
}

impl ConvBatchNorm {
    pub fn load(
        vb: VarBuilder,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
    ) -> Result<Self> {
        let conv = conv_norm(in_channels, out_channels, kernel_size, true, vb.pp("0"))?;
        let norm = candle_nn::batch_norm(out_channels, 1e-5, vb.pp("1"))?;
        Ok(Self { conv, norm })
    }

    /// `[B, C_in, T]` → `[B, C_out, T]`, batch norm on running statistics.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.conv.forward(x)?;
        Ok(self.norm.forward_t(&x, false)?)
    }
}

/// Hidden and cell state of an LSTM cell, each `[B, H]`.
#[derive(Debug, Clone)]
pub struct LstmState {
    pub h: Tensor,
    pub c: Tensor,
}

/// `torch.nn.LSTMCell`: single-step LSTM with `weight_ih`/`weight_hh`.
///
/// Gate order along the `4H` axis is input, forget, cell, output.
#[derive(Debug, Clone)]
pub struct LstmCell {
    input: Linear,
    hidden: Linear,
    hidden_dim: usize,
}

impl LstmCell {
    pub fn load(vb: VarBuilder, in_dim: usize, hidden_dim: usize) -> Result<Self> {
        let bound = 1.0 / (hidden_dim as f64).sqrt();
        let init = Init::Uniform {
            lo: -bound,
            up: bound,
        };
        let w_ih = vb.get_with_hints((4 * hidden_dim, in_dim), "weight_ih", init)?;
        let w_hh = vb.get_with_hints((4 * hidden_dim, hidden_dim), "weight_hh", init)?;
        let b_ih = vb.get_with_hints(4 * hidden_dim, "bias_ih", init)?;
        let b_hh = vb.get_with_hints(4 * hidden_dim, "bias_hh", init)?;
        Ok(Self {
            input: Linear::new(w_ih, Some(b_ih)),
            hidden: Linear::new(w_hh, Some(b_hh)),
            hidden_dim,
        })
    }

    pub fn zero_state(&self, batch: usize, dtype: DType, device: &Device) -> Result<LstmState> {
        let zeros = Tensor::zeros((batch, self.hidden_dim), dtype, device)?;
        Ok(LstmState {
            h: zeros.clone(),
            c: zeros,
        })
    }

    /// Advance one step on `[B, in_dim]` input.
    pub fn step(&self, x: &Tensor, state: &LstmState) -> Result<LstmState> {
        let gates = (self.input.forward(x)? + self.hidden.forward(&state.h)?)?;
        let chunks = gates.chunk(4, 1)?;
        let i = candle_nn::ops::sigmoid(&chunks[0])?;
        let f = candle_nn::ops::sigmoid(&chunks[1])?;
        let g = chunks[2].tanh()?;
        let o = candle_nn::ops::sigmoid(&chunks[3])?;
        let c = ((f * &state.c)? + (i * g)?)?;
        let h = (o * c.tanh()?)?;
        Ok(LstmState { h, c })
    }
}

/// Single-layer bidirectional `torch.nn.LSTM` with `batch_first=True`.
///
/// Output concatenates forward and backward hidden states: `[B, T, 2H]`.
#[derive(Debug, Clone)]
pub struct BiLstm {
    forward: LSTM,
    backward: LSTM,
}

impl BiLstm {
    pub fn load(vb: VarBuilder, in_dim: usize, hidden_dim: usize) -> Result<Self> {
        let forward = candle_nn::lstm(in_dim, hidden_dim, LSTMConfig::default(), vb.clone())?;
        let backward = candle_nn::lstm(
            in_dim,
            hidden_dim,
            LSTMConfig {
                direction: Direction::Backward,
                ..Default::default()
            },
            vb,
        )?;
        Ok(Self { forward, backward })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let seq_len = x.dim(1)?;
        let fwd = self.forward.states_to_tensor(&self.forward.seq(x)?)?;

        let reversed = reverse_time(x, seq_len)?;
        let bwd = self
            .backward
            .states_to_tensor(&self.backward.seq(&reversed)?)?;
        let bwd = reverse_time(&bwd, seq_len)?;

        Ok(Tensor::cat(&[&fwd, &bwd], 2)?)
    }
}

fn reverse_time(x: &Tensor, seq_len: usize) -> Result<Tensor> {
    let indices: Vec<u32> = (0..seq_len as u32).rev().collect();
    let indices = Tensor::from_vec(indices, seq_len, x.device())?;
    Ok(x.index_select(&indices, 1)?)
}

/// Weight-normalised 1D convolution (`torch.nn.utils.weight_norm`, `dim=0`).
///
/// The effective weight `g * v / ||v||` is recomputed on every call so that
/// parameters written after construction take effect.
#[derive(Debug, Clone)]
pub struct WeightNormConv1d {
    weight_g: Tensor,
    weight_v: Tensor,
    bias: Tensor,
    out_channels: usize,
    padding: usize,
    dilation: usize,
}

impl WeightNormConv1d {
    pub fn load(
        vb: VarBuilder,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        dilation: usize,
    ) -> Result<Self> {
        let weight_g = vb.get_with_hints((out_channels, 1, 1), "weight_g", Init::Const(1.0))?;
        let weight_v = vb.get_with_hints(
            (out_channels, in_channels, kernel_size),
            "weight_v",
            DEFAULT_KAIMING_NORMAL,
        )?;
        let bias = vb.get_with_hints(out_channels, "bias", Init::Const(0.0))?;
        Ok(Self {
            weight_g,
            weight_v,
            bias,
            out_channels,
            padding: (kernel_size * dilation - dilation) / 2,
            dilation,
        })
    }

    pub fn weight(&self) -> Result<Tensor> {
        let norm = self
            .weight_v
            .sqr()?
            .sum_keepdim(2)?
            .sum_keepdim(1)?
            .sqrt()?;
        Ok(self
            .weight_v
            .broadcast_mul(&self.weight_g.broadcast_div(&norm)?)?)
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let weight = self.weight()?;
        let y = x.conv1d(&weight, self.padding, 1, self.dilation, 1)?;
        Ok(y.broadcast_add(&self.bias.reshape((1, self.out_channels, 1))?)?)
    }
}

/// Standard normal samples drawn from `rng`.
pub fn gaussian_noise<R: Rng>(
    rng: &mut R,
    shape: &[usize],
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let count: usize = shape.iter().product();
    let values: Vec<f32> = (0..count).map(|_| rng.sample(StandardNormal)).collect();
    Ok(Tensor::from_vec(values, shape, device)?.to_dtype(dtype)?)
}

/// Inverted dropout mask: each entry is `0` with probability `p`, otherwise
/// `1 / (1 - p)`.
pub fn dropout_mask<R: Rng>(
    rng: &mut R,
    p: f32,
    shape: (usize, usize),
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let scale = 1.0 / (1.0 - p);
    let values: Vec<f32> = (0..shape.0 * shape.1)
        .map(|_| if rng.random::<f32>() < p { 0.0 } else { scale })
        .collect();
    Ok(Tensor::from_vec(values, shape, device)?.to_dtype(dtype)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn make_vb(device: &Device) -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        (varmap, vb)
    }

    fn names(varmap: &VarMap) -> Vec<String> {
        let mut names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    #[test]
    fn conv_batch_norm_uses_sequential_names() {
        let device = Device::Cpu;
        let (varmap, vb) = make_vb(&device);
        let layer = ConvBatchNorm::load(vb.pp("convolutions.0"), 4, 6, 5).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, (2, 4, 7), &device).unwrap();
        assert_eq!(layer.forward(&x).unwrap().dims(), &[2, 6, 7]);
        assert_eq!(
            names(&varmap),
            vec![
                "convolutions.0.0.conv.bias",
                "convolutions.0.0.conv.weight",
                "convolutions.0.1.bias",
                "convolutions.0.1.running_mean",
                "convolutions.0.1.running_var",
                "convolutions.0.1.weight",
            ]
        );
    }

    #[test]
    fn lstm_cell_step_shapes_and_names() {
        let device = Device::Cpu;
        let (varmap, vb) = make_vb(&device);
        let cell = LstmCell::load(vb.pp("attention_rnn"), 6, 4).unwrap();
        let state = cell.zero_state(2, DType::F32, &device).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, (2, 6), &device).unwrap();
        let next = cell.step(&x, &state).unwrap();
        assert_eq!(next.h.dims(), &[2, 4]);
        assert_eq!(next.c.dims(), &[2, 4]);
        assert_eq!(
            names(&varmap),
            vec![
                "attention_rnn.bias_hh",
                "attention_rnn.bias_ih",
                "attention_rnn.weight_hh",
                "attention_rnn.weight_ih",
            ]
        );
    }

    #[test]
    fn lstm_hidden_state_is_bounded() {
        let device = Device::Cpu;
        let (_vm, vb) = make_vb(&device);
        let cell = LstmCell::load(vb, 3, 5).unwrap();
        let mut state = cell.zero_state(1, DType::F32, &device).unwrap();
        let x = Tensor::full(10.0f32, (1, 3), &device).unwrap();
        for _ in 0..5 {
            state = cell.step(&x, &state).unwrap();
        }
        let h: Vec<f32> = state.h.flatten_all().unwrap().to_vec1().unwrap();
        assert!(h.iter().all(|v| v.abs() <= 1.0));
    }

    #[test]
    fn bilstm_concatenates_directions() {
        let device = Device::Cpu;
        let (varmap, vb) = make_vb(&device);
        let lstm = BiLstm::load(vb.pp("lstm"), 8, 3).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, (2, 5, 8), &device).unwrap();
        assert_eq!(lstm.forward(&x).unwrap().dims(), &[2, 5, 6]);
        let names = names(&varmap);
        assert!(names.contains(&"lstm.weight_ih_l0".to_string()));
        assert!(names.contains(&"lstm.weight_hh_l0_reverse".to_string()));
        assert_eq!(names.len(), 8);
    }

    #[test]
    fn bilstm_backward_half_sees_future() {
        let device = Device::Cpu;
        let (_vm, vb) = make_vb(&device);
        let lstm = BiLstm::load(vb, 2, 3).unwrap();
        let base = Tensor::zeros((1, 4, 2), DType::F32, &device).unwrap();
        let changed = Tensor::cat(
            &[
                &Tensor::zeros((1, 3, 2), DType::F32, &device).unwrap(),
                &Tensor::ones((1, 1, 2), DType::F32, &device).unwrap(),
            ],
            1,
        )
        .unwrap();
        let a = lstm.forward(&base).unwrap();
        let b = lstm.forward(&changed).unwrap();
        // Changing the last frame leaves the forward half at t=0 alone but
        // reaches the backward half.
        let diff = |start: usize| -> f32 {
            (a.narrow(1, 0, 1).unwrap().narrow(2, start, 3).unwrap()
                - b.narrow(1, 0, 1).unwrap().narrow(2, start, 3).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap()
        };
        assert_eq!(diff(0), 0.0);
        assert!(diff(3) > 0.0);
    }

    #[test]
    fn weight_norm_weight_has_magnitude_g() {
        let device = Device::Cpu;
        let (varmap, vb) = make_vb(&device);
        let conv = WeightNormConv1d::load(vb, 3, 4, 3, 2).unwrap();
        let g = Tensor::new(&[2.0f32, 0.5, 1.0, 3.0], &device)
            .unwrap()
            .reshape((4, 1, 1))
            .unwrap();
        varmap.data().lock().unwrap()["weight_g"].set(&g).unwrap();

        let norms: Vec<f32> = conv
            .weight()
            .unwrap()
            .sqr()
            .unwrap()
            .sum_keepdim(2)
            .unwrap()
            .sum_keepdim(1)
            .unwrap()
            .sqrt()
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        for (n, expected) in norms.iter().zip([2.0f32, 0.5, 1.0, 3.0]) {
            assert!((n - expected).abs() < 1e-5);
        }

        let x = Tensor::randn(0.0f32, 1.0, (1, 3, 10), &device).unwrap();
        assert_eq!(conv.forward(&x).unwrap().dims(), &[1, 4, 10]);
    }

    #[test]
    fn gaussian_noise_is_seeded() {
        let device = Device::Cpu;
        let draw = |seed| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            gaussian_noise(&mut rng, &[3, 7], DType::F32, &device)
                .unwrap()
                .flatten_all()
                .unwrap()
                .to_vec1::<f32>()
                .unwrap()
        };
        assert_eq!(draw(7), draw(7));
        assert_ne!(draw(7), draw(8));
        assert_eq!(draw(7).len(), 21);
    }

    #[test]
    fn gaussian_noise_moments() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let noise: Vec<f32> = gaussian_noise(&mut rng, &[20000], DType::F32, &Device::Cpu)
            .unwrap()
            .to_vec1()
            .unwrap();
        let mean = noise.iter().sum::<f32>() / noise.len() as f32;
        let var = noise.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / noise.len() as f32;
        assert!(mean.abs() < 0.05, "mean {mean}");
        assert!((var - 1.0).abs() < 0.05, "var {var}");
    }

    #[test]
    fn dropout_mask_values() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mask: Vec<f32> = dropout_mask(&mut rng, 0.5, (4, 50), DType::F32, &Device::Cpu)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(mask.iter().all(|&v| v == 0.0 || v == 2.0));
        let kept = mask.iter().filter(|&&v| v > 0.0).count();
        assert!((50..150).contains(&kept));
    }
}
