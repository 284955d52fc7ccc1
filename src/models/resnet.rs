//! ResNet backbone returning the four stage outputs.
//!
//! See "Deep Residual Learning for Image Recognition" He et al. 2015
//! <https://arxiv.org/abs/1512.03385>, and "Bag of Tricks for Image Classification with
//! Convolutional Neural Networks" He et al. 2018 <https://arxiv.org/abs/1812.01187> for the
//! `D` variant (deep stem, average-pool shortcut).
//!
//! Parameters use the torchvision names, and timm's `resnet*d` names for the `D` variant.
//! Batch-norm statistics may also be stored under the PaddlePaddle names `_mean` and `_variance`.
use candle::{ModuleT, Result, Tensor, D};
use candle_nn::{Conv2d, FuncT, VarBuilder};
use serde::Deserialize;

use super::backbone::Backbone;
use super::with_tracing::batch_norm;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    /// Single 7x7 stem convolution, strided 1x1 shortcut.
    B,
    /// Three 3x3 stem convolutions, average pooling before the 1x1 shortcut.
    #[default]
    D,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Config {
    pub layers: usize,
    #[serde(default)]
    pub variant: Variant,
    /// Total downsampling of the last stage, 8 and 16 replace the last strides by dilations.
    #[serde(default)]
    pub output_stride: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new(50)
    }
}

impl Config {
    pub fn new(layers: usize) -> Self {
        Self {
            layers,
            variant: Variant::D,
            output_stride: None,
        }
    }

    pub fn with_variant(mut self, variant: Variant) -> Self {
        self.variant = variant;
        self
    }

    pub fn with_output_stride(mut self, output_stride: usize) -> Self {
        self.output_stride = Some(output_stride);
        self
    }

    fn is_bottleneck(&self) -> bool {
        self.layers >= 50
    }

    fn block_counts(&self) -> Result<[usize; 4]> {
        let counts = match self.layers {
            18 => [2, 2, 2, 2],
            34 | 50 => [3, 4, 6, 3],
            101 => [3, 4, 23, 3],
            152 => [3, 8, 36, 3],
            layers => candle::bail!(
                "unsupported resnet depth {layers}, expected one of 18, 34, 50, 101, 152"
            ),
        };
        Ok(counts)
    }

    /// Strides and dilations of the four stages.
    fn strides_and_dilations(&self) -> Result<([usize; 4], [usize; 4])> {
        match self.output_stride {
            None | Some(32) => Ok(([1, 2, 2, 2], [1, 1, 1, 1])),
            Some(16) => Ok(([1, 2, 2, 1], [1, 1, 1, 2])),
            Some(8) => Ok(([1, 2, 1, 1], [1, 1, 2, 4])),
            Some(os) => candle::bail!("unsupported resnet output stride {os}, expected 8 or 16"),
        }
    }

    pub fn feat_channels(&self) -> Result<[usize; 4]> {
        self.block_counts()?;
        let e = if self.is_bottleneck() { 4 } else { 1 };
        Ok([64 * e, 128 * e, 256 * e, 512 * e])
    }
}

#[allow(clippy::too_many_arguments)]
fn conv2d(
    c_in: usize,
    c_out: usize,
    ksize: usize,
    padding: usize,
    stride: usize,
    dilation: usize,
    vb: VarBuilder,
) -> Result<Conv2d> {
    let conv2d_cfg = candle_nn::Conv2dConfig {
        stride,
        padding,
        dilation,
        ..Default::default()
    };
    candle_nn::conv2d_no_bias(c_in, c_out, ksize, conv2d_cfg, vb)
}

// 2x2 average pooling with ceil mode, partial windows only average the valid elements.
fn avg_pool_ceil(xs: &Tensor) -> Result<Tensor> {
    let (_, _, h, w) = xs.dims4()?;
    let xs = if h % 2 == 1 {
        xs.pad_with_same(D::Minus2, 0, 1)?
    } else {
        xs.clone()
    };
    let xs = if w % 2 == 1 {
        xs.pad_with_same(D::Minus1, 0, 1)?
    } else {
        xs
    };
    xs.avg_pool2d(2)
}

fn downsample(
    c_in: usize,
    c_out: usize,
    stride: usize,
    avg_down: bool,
    vb: VarBuilder,
) -> Result<FuncT<'static>> {
    if stride == 1 && c_in == c_out {
        return Ok(FuncT::new(|xs, _| Ok(xs.clone())));
    }
    if avg_down {
        // Index 0 is the pooling layer, an identity when the shortcut is not strided.
        let conv = conv2d(c_in, c_out, 1, 0, 1, 1, vb.pp(1))?;
        let bn = batch_norm(c_out, 1e-5, vb.pp(2))?;
        let pool = stride != 1;
        Ok(FuncT::new(move |xs, train| {
            let xs = if pool { avg_pool_ceil(xs)? } else { xs.clone() };
            xs.apply(&conv)?.apply_t(&bn, train)
        }))
    } else {
        let conv = conv2d(c_in, c_out, 1, 0, stride, 1, vb.pp(0))?;
        let bn = batch_norm(c_out, 1e-5, vb.pp(1))?;
        Ok(FuncT::new(move |xs, train| {
            xs.apply(&conv)?.apply_t(&bn, train)
        }))
    }
}

fn basic_block(
    c_in: usize,
    c_out: usize,
    stride: usize,
    dilation: usize,
    avg_down: bool,
    vb: VarBuilder,
) -> Result<FuncT<'static>> {
    let conv1 = conv2d(c_in, c_out, 3, dilation, stride, dilation, vb.pp("conv1"))?;
    let bn1 = batch_norm(c_out, 1e-5, vb.pp("bn1"))?;
    let conv2 = conv2d(c_out, c_out, 3, dilation, 1, dilation, vb.pp("conv2"))?;
    let bn2 = batch_norm(c_out, 1e-5, vb.pp("bn2"))?;
    let downsample = downsample(c_in, c_out, stride, avg_down, vb.pp("downsample"))?;
    Ok(FuncT::new(move |xs, train| {
        let ys = xs
            .apply(&conv1)?
            .apply_t(&bn1, train)?
            .relu()?
            .apply(&conv2)?
            .apply_t(&bn2, train)?;
        (xs.apply_t(&downsample, train)? + ys)?.relu()
    }))
}

// Bottleneck versions for ResNet 50, 101, and 152.
fn bottleneck_block(
    c_in: usize,
    c_out: usize,
    stride: usize,
    dilation: usize,
    avg_down: bool,
    vb: VarBuilder,
) -> Result<FuncT<'static>> {
    let e_dim = 4 * c_out;
    let conv1 = conv2d(c_in, c_out, 1, 0, 1, 1, vb.pp("conv1"))?;
    let bn1 = batch_norm(c_out, 1e-5, vb.pp("bn1"))?;
    let conv2 = conv2d(c_out, c_out, 3, dilation, stride, dilation, vb.pp("conv2"))?;
    let bn2 = batch_norm(c_out, 1e-5, vb.pp("bn2"))?;
    let conv3 = conv2d(c_out, e_dim, 1, 0, 1, 1, vb.pp("conv3"))?;
    let bn3 = batch_norm(e_dim, 1e-5, vb.pp("bn3"))?;
    let downsample = downsample(c_in, e_dim, stride, avg_down, vb.pp("downsample"))?;
    Ok(FuncT::new(move |xs, train| {
        let ys = xs
            .apply(&conv1)?
            .apply_t(&bn1, train)?
            .relu()?
            .apply(&conv2)?
            .apply_t(&bn2, train)?
            .relu()?
            .apply(&conv3)?
            .apply_t(&bn3, train)?;
        (xs.apply_t(&downsample, train)? + ys)?.relu()
    }))
}

fn stem(variant: Variant, vb: VarBuilder) -> Result<FuncT<'static>> {
    match variant {
        Variant::B => {
            let conv1 = conv2d(3, 64, 7, 3, 2, 1, vb.pp("conv1"))?;
            let bn1 = batch_norm(64, 1e-5, vb.pp("bn1"))?;
            Ok(FuncT::new(move |xs, train| {
                xs.apply(&conv1)?.apply_t(&bn1, train)?.relu()
            }))
        }
        Variant::D => {
            let vb_c = vb.pp("conv1");
            let conv1_1 = conv2d(3, 32, 3, 1, 2, 1, vb_c.pp(0))?;
            let bn1_1 = batch_norm(32, 1e-5, vb_c.pp(1))?;
            let conv1_2 = conv2d(32, 32, 3, 1, 1, 1, vb_c.pp(3))?;
            let bn1_2 = batch_norm(32, 1e-5, vb_c.pp(4))?;
            let conv1_3 = conv2d(32, 64, 3, 1, 1, 1, vb_c.pp(6))?;
            let bn1 = batch_norm(64, 1e-5, vb.pp("bn1"))?;
            Ok(FuncT::new(move |xs, train| {
                xs.apply(&conv1_1)?
                    .apply_t(&bn1_1, train)?
                    .relu()?
                    .apply(&conv1_2)?
                    .apply_t(&bn1_2, train)?
                    .relu()?
                    .apply(&conv1_3)?
                    .apply_t(&bn1, train)?
                    .relu()
            }))
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResNet {
    stem: FuncT<'static>,
    stages: Vec<Vec<FuncT<'static>>>,
    feat_channels: Vec<usize>,
    span: tracing::Span,
}

impl ResNet {
    pub fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let counts = cfg.block_counts()?;
        let (strides, dilations) = cfg.strides_and_dilations()?;
        let feat_channels = cfg.feat_channels()?;
        let avg_down = cfg.variant == Variant::D;
        let stem = stem(cfg.variant, vb.clone())?;
        let mut stages = Vec::with_capacity(4);
        let mut c_in = 64;
        for (stage_idx, &cnt) in counts.iter().enumerate() {
            let vb = vb.pp(format!("layer{}", stage_idx + 1));
            let width = 64 << stage_idx;
            let mut blocks = Vec::with_capacity(cnt);
            let dilation = dilations[stage_idx];
            for index in 0..cnt {
                let stride = if index == 0 { strides[stage_idx] } else { 1 };
                let vb = vb.pp(index);
                let block = if cfg.is_bottleneck() {
                    bottleneck_block(c_in, width, stride, dilation, avg_down, vb)?
                } else {
                    basic_block(c_in, width, stride, dilation, avg_down, vb)?
                };
                blocks.push(block);
                c_in = feat_channels[stage_idx];
            }
            stages.push(blocks)
        }
        let span = tracing::span!(tracing::Level::TRACE, "resnet");
        Ok(Self {
            stem,
            stages,
            feat_channels: feat_channels.to_vec(),
            span,
        })
    }
}

impl Backbone for ResNet {
    fn feat_channels(&self) -> &[usize] {
        &self.feat_channels
    }

    fn forward_features(&self, xs: &Tensor, train: bool) -> Result<Vec<Tensor>> {
        let _enter = self.span.enter();
        let mut xs = xs
            .apply_t(&self.stem, train)?
            .pad_with_same(D::Minus1, 1, 1)?
            .pad_with_same(D::Minus2, 1, 1)?
            .max_pool2d_with_stride(3, 2)?;
        let mut features = Vec::with_capacity(self.stages.len());
        for stage in self.stages.iter() {
            for block in stage.iter() {
                xs = block.forward_t(&xs, train)?
            }
            features.push(xs.clone())
        }
        Ok(features)
    }
}
