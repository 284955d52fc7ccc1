use candle::{Result, Tensor};

/// A feature extractor producing multi-scale feature maps, finest first.
pub trait Backbone: std::fmt::Debug + Send + Sync {
    /// Number of channels of each map returned by [`Backbone::forward_features`].
    fn feat_channels(&self) -> &[usize];

    fn forward_features(&self, xs: &Tensor, train: bool) -> Result<Vec<Tensor>>;
}
