//! UPerNet semantic segmentation model.
//!
//! A backbone produces multi-scale feature maps. The coarsest one goes through a pyramid
//! pooling module, the others are projected by lateral convolutions and fused top-down as in a
//! feature pyramid network. All pyramid levels are resized to the finest resolution,
//! concatenated and classified per pixel. An optional auxiliary classifier runs on the third
//! selected feature map to help training.
//!
//! References:
//! - [Unified Perceptual Parsing for Scene Understanding](https://arxiv.org/abs/1807.10221)
//! - [PaddleSeg](https://github.com/PaddlePaddle/PaddleSeg): the head parameters under `head.`
//!   follow its layout. The ResNet backbone uses the torchvision/timm names, so a PaddleSeg
//!   checkpoint needs its `backbone.` keys renamed.
//!
use candle::{DType, Device, Module, ModuleT, Result, Tensor};
use candle_nn::{BatchNorm, Conv2dConfig, VarBuilder};
use serde::Deserialize;

use super::backbone::Backbone;
use super::resnet::{self, ResNet};
use super::with_tracing::{batch_norm, conv2d, Conv2d, ConvBnRelu};
use crate::ops::{adaptive_avg_pool2d, interpolate_bilinear, Dropout2d};
use crate::weights::WeightSource;

fn default_backbone_indices() -> Vec<usize> {
    vec![0, 1, 2, 3]
}

fn default_channels() -> usize {
    512
}

fn default_ppm_bin_sizes() -> Vec<usize> {
    vec![1, 2, 3, 6]
}

fn default_dropout_ratio() -> Option<f64> {
    Some(0.1)
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    pub num_classes: usize,
    #[serde(default)]
    pub backbone: resnet::Config,
    /// Backbone outputs fed to the head, finest first.
    #[serde(default = "default_backbone_indices")]
    pub backbone_indices: Vec<usize>,
    /// Width of the fused features before the classifier.
    #[serde(default = "default_channels")]
    pub channels: usize,
    /// Width of the pyramid levels, 128 for ResNet-18 and 256 otherwise when unset.
    #[serde(default)]
    pub fpn_dim: Option<usize>,
    #[serde(default = "default_ppm_bin_sizes")]
    pub ppm_bin_sizes: Vec<usize>,
    /// Channel dropout before the classifiers, `None` removes the layers.
    #[serde(default = "default_dropout_ratio")]
    pub dropout_ratio: Option<f64>,
    #[serde(default)]
    pub enable_auxiliary_loss: bool,
    /// Used when resizing the logits to the input size. Should be `false` for even input sizes
    /// (e.g. 1024x512) and `true` otherwise (e.g. 769x769).
    #[serde(default)]
    pub align_corners: bool,
    /// Local path, `hf://owner/repo/file` or hub URL of the weights used by [`UperNet::load`].
    #[serde(default)]
    pub pretrained: Option<String>,
}

impl Config {
    pub fn new(num_classes: usize, backbone: resnet::Config) -> Self {
        Self {
            num_classes,
            backbone,
            backbone_indices: default_backbone_indices(),
            channels: default_channels(),
            fpn_dim: None,
            ppm_bin_sizes: default_ppm_bin_sizes(),
            dropout_ratio: default_dropout_ratio(),
            enable_auxiliary_loss: false,
            align_corners: false,
            pretrained: None,
        }
    }

    pub fn fpn_dim(&self) -> usize {
        match self.fpn_dim {
            Some(fpn_dim) => fpn_dim,
            None if self.backbone.layers == 18 => 128,
            None => 256,
        }
    }

    /// Checks the hyperparameters against the backbone and returns the channels of the selected
    /// feature maps.
    pub fn validate(&self, feat_channels: &[usize]) -> Result<Vec<usize>> {
        if self.num_classes == 0 {
            candle::bail!("upernet: num_classes must be positive")
        }
        if self.channels == 0 || self.fpn_dim() == 0 {
            candle::bail!(
                "upernet: channels ({}) and fpn_dim ({}) must be positive",
                self.channels,
                self.fpn_dim()
            )
        }
        if self.backbone_indices.len() < 2 {
            candle::bail!(
                "upernet: at least two backbone indices are required, got {:?}",
                self.backbone_indices
            )
        }
        if self.enable_auxiliary_loss && self.backbone_indices.len() < 3 {
            candle::bail!(
                "upernet: the auxiliary head uses the third selected feature, got {:?}",
                self.backbone_indices
            )
        }
        if let Some(p) = self.dropout_ratio {
            if !(0. ..1.).contains(&p) {
                candle::bail!("upernet: dropout ratio has to be in [0, 1), got {p}")
            }
        }
        if self.ppm_bin_sizes.is_empty() || self.ppm_bin_sizes.contains(&0) {
            candle::bail!("upernet: invalid ppm bin sizes {:?}", self.ppm_bin_sizes)
        }
        let mut in_channels = Vec::with_capacity(self.backbone_indices.len());
        for &index in self.backbone_indices.iter() {
            match feat_channels.get(index) {
                Some(&c) => in_channels.push(c),
                None => candle::bail!(
                    "upernet: backbone index {index} out of range, the backbone has {} outputs",
                    feat_channels.len()
                ),
            }
        }
        let coarsest = in_channels[in_channels.len() - 1];
        if coarsest < self.ppm_bin_sizes.len() {
            candle::bail!(
                "upernet: {coarsest} channels cannot be split over {} pooling stages",
                self.ppm_bin_sizes.len()
            )
        }
        Ok(in_channels)
    }
}

/// Pyramid pooling module: global context pooled at several bin sizes, projected, resized back
/// and fused with the input.
#[derive(Debug, Clone)]
pub struct PyramidPooling {
    stages: Vec<(usize, ConvBnRelu)>,
    bottleneck: ConvBnRelu,
    align_corners: bool,
    span: tracing::Span,
}

impl PyramidPooling {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        bin_sizes: &[usize],
        dim_reduction: bool,
        align_corners: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let inter_channels = if dim_reduction {
            in_channels / bin_sizes.len()
        } else {
            in_channels
        };
        let vb_s = vb.pp("stages");
        let stages = bin_sizes
            .iter()
            .enumerate()
            .map(|(i, &bin)| {
                // index 0 is the parameter free pooling layer
                let vb = vb_s.pp(i).pp(1);
                Ok((bin, ConvBnRelu::new(in_channels, inter_channels, 1, true, vb)?))
            })
            .collect::<Result<Vec<_>>>()?;
        let bottleneck = ConvBnRelu::new(
            in_channels + inter_channels * bin_sizes.len(),
            out_channels,
            3,
            true,
            vb.pp("conv_bn_relu2"),
        )?;
        let span = tracing::span!(tracing::Level::TRACE, "ppm");
        Ok(Self {
            stages,
            bottleneck,
            align_corners,
            span,
        })
    }
}

impl ModuleT for PyramidPooling {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (_, _, h, w) = xs.dims4()?;
        let mut cat = Vec::with_capacity(self.stages.len() + 1);
        cat.push(xs.clone());
        for (bin, conv) in self.stages.iter().rev() {
            let ys = adaptive_avg_pool2d(xs, (*bin, *bin))?.apply_t(conv, train)?;
            cat.push(interpolate_bilinear(&ys, (h, w), self.align_corners)?);
        }
        Tensor::cat(&cat, 1)?.apply_t(&self.bottleneck, train)
    }
}

#[derive(Debug, Clone)]
struct Lateral {
    conv: Conv2d,
    bn: BatchNorm,
    span: tracing::Span,
}

impl Lateral {
    fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        let conv = conv2d(in_channels, out_channels, 1, Default::default(), vb.pp(0))?;
        let bn = batch_norm(out_channels, 1e-5, vb.pp(1))?;
        let span = tracing::span!(tracing::Level::TRACE, "lateral");
        Ok(Self { conv, bn, span })
    }
}

impl ModuleT for Lateral {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let _enter = self.span.enter();
        xs.apply(&self.conv)?.apply_t(&self.bn, train)?.relu()
    }
}

#[derive(Debug, Clone)]
struct AuxHead {
    conv: ConvBnRelu,
    dropout: Option<Dropout2d>,
    cls: Conv2d,
}

impl AuxHead {
    fn new(
        in_channels: usize,
        num_classes: usize,
        dropout_ratio: Option<f64>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let conv = ConvBnRelu::new(in_channels, in_channels, 3, true, vb.pp(0))?;
        let dropout = dropout_ratio.map(|p| Dropout2d::new(p as f32));
        let cls_index = if dropout.is_some() { 2 } else { 1 };
        let cls = conv2d(
            in_channels,
            num_classes,
            1,
            Default::default(),
            vb.pp(cls_index),
        )?;
        Ok(Self { conv, dropout, cls })
    }
}

impl ModuleT for AuxHead {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = xs.apply_t(&self.conv, train)?;
        let xs = match &self.dropout {
            Some(dropout) => xs.apply_t(dropout, train)?,
            None => xs,
        };
        xs.apply(&self.cls)
    }
}

#[derive(Debug, Clone)]
pub struct UperNetHead {
    ppm: PyramidPooling,
    lateral_convs: Vec<Lateral>,
    fpn_out: Vec<ConvBnRelu>,
    fpn_bottleneck: ConvBnRelu,
    dropout: Option<Dropout2d>,
    conv_seg: Conv2d,
    dsn: Option<AuxHead>,
    span: tracing::Span,
}

impl UperNetHead {
    /// `in_channels` are the channels of the selected backbone features, finest first.
    pub fn new(cfg: &Config, in_channels: &[usize], vb: VarBuilder) -> Result<Self> {
        let fpn_dim = cfg.fpn_dim();
        let levels = in_channels.len();
        let ppm = PyramidPooling::new(
            in_channels[levels - 1],
            fpn_dim,
            &cfg.ppm_bin_sizes,
            true,
            true,
            vb.pp("ppm"),
        )?;
        let mut lateral_convs = Vec::with_capacity(levels - 1);
        let mut fpn_out = Vec::with_capacity(levels - 1);
        for (i, &c_in) in in_channels[..levels - 1].iter().enumerate() {
            lateral_convs.push(Lateral::new(c_in, fpn_dim, vb.pp("lateral_convs").pp(i))?);
            let vb_o = vb.pp("fpn_out").pp(i);
            fpn_out.push(ConvBnRelu::new(fpn_dim, fpn_dim, 3, false, vb_o.pp(0))?);
        }
        let fpn_bottleneck = ConvBnRelu::new(
            levels * fpn_dim,
            cfg.channels,
            3,
            true,
            vb.pp("fpn_bottleneck"),
        )?;
        let dropout = cfg.dropout_ratio.map(|p| Dropout2d::new(p as f32));
        let conv_seg = conv2d(
            cfg.channels,
            cfg.num_classes,
            1,
            Conv2dConfig::default(),
            vb.pp("conv_seg"),
        )?;
        let dsn = if cfg.enable_auxiliary_loss {
            Some(AuxHead::new(
                in_channels[2],
                cfg.num_classes,
                cfg.dropout_ratio,
                vb.pp("dsn"),
            )?)
        } else {
            None
        };
        let span = tracing::span!(tracing::Level::TRACE, "upernet-head");
        Ok(Self {
            ppm,
            lateral_convs,
            fpn_out,
            fpn_bottleneck,
            dropout,
            conv_seg,
            dsn,
            span,
        })
    }

    /// Returns the main logits at the finest feature resolution and, when enabled, the
    /// auxiliary logits at the resolution of the third feature map.
    pub fn forward_t(
        &self,
        features: &[Tensor],
        train: bool,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let _enter = self.span.enter();
        let levels = self.lateral_convs.len() + 1;
        if features.len() != levels {
            candle::bail!(
                "upernet head expects {levels} feature maps, got {}",
                features.len()
            )
        }
        let mut f = self.ppm.forward_t(&features[levels - 1], train)?;
        let mut pyramid = Vec::with_capacity(levels);
        pyramid.push(f.clone());
        for i in (0..levels - 1).rev() {
            let lateral = features[i].apply_t(&self.lateral_convs[i], train)?;
            let (_, _, h, w) = lateral.dims4()?;
            f = (lateral + interpolate_bilinear(&f, (h, w), true)?)?;
            pyramid.push(f.apply_t(&self.fpn_out[i], train)?);
        }
        pyramid.reverse();
        let (_, _, h, w) = pyramid[0].dims4()?;
        let pyramid = pyramid
            .iter()
            .map(|level| interpolate_bilinear(level, (h, w), true))
            .collect::<Result<Vec<_>>>()?;
        let xs = Tensor::cat(&pyramid, 1)?.apply_t(&self.fpn_bottleneck, train)?;
        let xs = match &self.dropout {
            Some(dropout) => xs.apply_t(dropout, train)?,
            None => xs,
        };
        let logits = xs.apply(&self.conv_seg)?;
        let aux_logits = match &self.dsn {
            Some(dsn) => Some(features[2].apply_t(dsn, train)?),
            None => None,
        };
        Ok((logits, aux_logits))
    }
}

/// Logits resized to the input resolution, `(batch, num_classes, height, width)`.
#[derive(Debug, Clone)]
pub struct UperNetOutput {
    pub logits: Tensor,
    pub aux_logits: Option<Tensor>,
}

impl UperNetOutput {
    /// The main logits followed by the auxiliary ones if any.
    pub fn into_vec(self) -> Vec<Tensor> {
        let mut out = vec![self.logits];
        out.extend(self.aux_logits);
        out
    }
}

#[derive(Debug)]
pub struct UperNet {
    backbone: Box<dyn Backbone>,
    head: UperNetHead,
    backbone_indices: Vec<usize>,
    align_corners: bool,
    span: tracing::Span,
}

impl UperNet {
    /// Builds the ResNet backbone described by `cfg.backbone` under `backbone` and the head
    /// under `head`.
    pub fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let backbone = ResNet::new(&cfg.backbone, vb.pp("backbone"))?;
        Self::with_backbone(cfg, Box::new(backbone), vb)
    }

    /// Same as [`UperNet::new`] with a caller provided backbone, `cfg.backbone` is only used
    /// for the default `fpn_dim`.
    pub fn with_backbone(
        cfg: &Config,
        backbone: Box<dyn Backbone>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let in_channels = cfg.validate(backbone.feat_channels())?;
        let head = UperNetHead::new(cfg, &in_channels, vb.pp("head"))?;
        let span = tracing::span!(tracing::Level::TRACE, "upernet");
        Ok(Self {
            backbone,
            head,
            backbone_indices: cfg.backbone_indices.clone(),
            align_corners: cfg.align_corners,
            span,
        })
    }

    /// Builds the model from the safetensors weights referenced by `cfg.pretrained`.
    pub fn load(cfg: &Config, dtype: DType, device: &Device) -> Result<Self> {
        let pretrained = match &cfg.pretrained {
            Some(pretrained) => pretrained,
            None => candle::bail!("upernet: no pretrained weights in the config"),
        };
        let path = WeightSource::parse(pretrained)?.resolve()?;
        tracing::info!(?path, "loading upernet weights");
        let vb = crate::weights::var_builder(&[path], dtype, device)?;
        Self::new(cfg, vb)
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<UperNetOutput> {
        let _enter = self.span.enter();
        let (_, _, h, w) = xs.dims4()?;
        let features = self.backbone.forward_features(xs, train)?;
        let mut selected = Vec::with_capacity(self.backbone_indices.len());
        for &index in self.backbone_indices.iter() {
            match features.get(index) {
                Some(feature) => selected.push(feature.clone()),
                None => candle::bail!(
                    "upernet: backbone returned {} feature maps, index {index} requested",
                    features.len()
                ),
            }
        }
        let (logits, aux_logits) = self.head.forward_t(&selected, train)?;
        let logits = interpolate_bilinear(&logits, (h, w), self.align_corners)?;
        let aux_logits = match aux_logits {
            Some(aux) => Some(interpolate_bilinear(&aux, (h, w), self.align_corners)?),
            None => None,
        };
        Ok(UperNetOutput { logits, aux_logits })
    }

    /// Per-pixel class indices, `(batch, height, width)` with dtype u32.
    pub fn predict(&self, xs: &Tensor) -> Result<Tensor> {
        self.forward(xs)?.argmax(1)
    }
}

impl Module for UperNet {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        Ok(self.forward_t(xs, false)?.logits)
    }
}
