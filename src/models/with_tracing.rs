use candle::{Module, ModuleT, Result, Tensor};
use candle_nn::{BatchNorm, Conv2dConfig, VarBuilder};

// Wrap the conv2d op to provide some tracing.
#[derive(Debug, Clone)]
pub struct Conv2d {
    inner: candle_nn::Conv2d,
    span: tracing::Span,
}

impl Module for Conv2d {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        self.inner.forward(x)
    }
}

pub fn conv2d(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    cfg: Conv2dConfig,
    vb: VarBuilder,
) -> Result<Conv2d> {
    let span = tracing::span!(tracing::Level::TRACE, "conv2d");
    let inner = candle_nn::conv2d(in_channels, out_channels, kernel_size, cfg, vb)?;
    Ok(Conv2d { inner, span })
}

pub fn conv2d_no_bias(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    cfg: Conv2dConfig,
    vb: VarBuilder,
) -> Result<Conv2d> {
    let span = tracing::span!(tracing::Level::TRACE, "conv2d");
    let inner = candle_nn::conv2d_no_bias(in_channels, out_channels, kernel_size, cfg, vb)?;
    Ok(Conv2d { inner, span })
}

/// Batch-norm that accepts both the PyTorch/candle parameter names (`running_mean`,
/// `running_var`) and the PaddlePaddle ones (`_mean`, `_variance`).
pub fn batch_norm(num_features: usize, eps: f64, vb: VarBuilder) -> Result<BatchNorm> {
    if vb.contains_tensor("_mean") {
        let running_mean = vb.get(num_features, "_mean")?;
        let running_var = vb.get(num_features, "_variance")?;
        let weight = vb.get(num_features, "weight")?;
        let bias = vb.get(num_features, "bias")?;
        BatchNorm::new(num_features, running_mean, running_var, weight, bias, eps)
    } else {
        candle_nn::batch_norm(num_features, eps, vb)
    }
}

/// Convolution followed by batch-norm and ReLU, stored as `_conv` and `_batch_norm`.
#[derive(Debug, Clone)]
pub struct ConvBnRelu {
    conv: Conv2d,
    bn: BatchNorm,
    span: tracing::Span,
}

impl ConvBnRelu {
    /// `padding` defaults to `kernel_size / 2`, keeping the spatial size.
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        bias: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: kernel_size / 2,
            ..Default::default()
        };
        let conv = if bias {
            conv2d(in_channels, out_channels, kernel_size, cfg, vb.pp("_conv"))?
        } else {
            conv2d_no_bias(in_channels, out_channels, kernel_size, cfg, vb.pp("_conv"))?
        };
        let bn = batch_norm(out_channels, 1e-5, vb.pp("_batch_norm"))?;
        let span = tracing::span!(tracing::Level::TRACE, "conv-bn-relu");
        Ok(Self { conv, bn, span })
    }
}

impl ModuleT for ConvBnRelu {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let _enter = self.span.enter();
        xs.apply(&self.conv)?.apply_t(&self.bn, train)?.relu()
    }
}
