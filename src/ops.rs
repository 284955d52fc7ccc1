//! Spatial resampling and regularization ops used by the segmentation head.
//!
//! Bilinear resizing and adaptive average pooling are both separable, so they are expressed as
//! two matrix products with small interpolation matrices. This keeps them differentiable and
//! available on every candle device.
use candle::{Device, Result, Tensor};

fn bilinear_weights(src: usize, dst: usize, align_corners: bool) -> Vec<f32> {
    let mut ws = vec![0f32; src * dst];
    let scale = if align_corners {
        if dst > 1 {
            (src - 1) as f64 / (dst - 1) as f64
        } else {
            0.
        }
    } else {
        src as f64 / dst as f64
    };
    for o in 0..dst {
        let pos = if align_corners {
            o as f64 * scale
        } else {
            ((o as f64 + 0.5) * scale - 0.5).max(0.)
        };
        let i0 = (pos.floor() as usize).min(src - 1);
        let i1 = (i0 + 1).min(src - 1);
        let lambda = (pos - i0 as f64).clamp(0., 1.) as f32;
        ws[i0 * dst + o] += 1. - lambda;
        ws[i1 * dst + o] += lambda;
    }
    ws
}

fn adaptive_pool_weights(src: usize, dst: usize) -> Vec<f32> {
    let mut ws = vec![0f32; src * dst];
    for o in 0..dst {
        let start = (o * src) / dst;
        let end = ((o + 1) * src).div_ceil(dst);
        let inv = 1. / (end - start) as f32;
        for i in start..end {
            ws[i * dst + o] = inv;
        }
    }
    ws
}

fn weights_tensor(ws: Vec<f32>, src: usize, dst: usize, like: &Tensor) -> Result<Tensor> {
    Tensor::from_vec(ws, (src, dst), &Device::Cpu)?
        .to_device(like.device())?
        .to_dtype(like.dtype())
}

/// Applies `rows` (h, oh) along the height axis and `cols` (w, ow) along the width axis of an
/// NCHW tensor.
fn separable(xs: &Tensor, rows: &Tensor, cols: &Tensor) -> Result<Tensor> {
    let (b, c, h, w) = xs.dims4()?;
    let (_, oh) = rows.dims2()?;
    let (_, ow) = cols.dims2()?;
    let xs = xs
        .contiguous()?
        .reshape((b * c * h, w))?
        .matmul(cols)?
        .reshape((b * c, h, ow))?
        .transpose(1, 2)?
        .contiguous()?
        .reshape((b * c * ow, h))?
        .matmul(rows)?;
    xs.reshape((b * c, ow, oh))?
        .transpose(1, 2)?
        .contiguous()?
        .reshape((b, c, oh, ow))
}

/// Bilinear resize of an NCHW tensor to `(out_h, out_w)`.
///
/// Follows the `F.interpolate(mode="bilinear")` conventions: with `align_corners` the corner
/// pixels of input and output are aligned, otherwise pixel centers are aligned (half-pixel
/// offsets, source coordinates clamped at zero).
pub fn interpolate_bilinear(
    xs: &Tensor,
    (out_h, out_w): (usize, usize),
    align_corners: bool,
) -> Result<Tensor> {
    let (_, _, h, w) = xs.dims4()?;
    if out_h == 0 || out_w == 0 {
        candle::bail!("interpolate: empty target size ({out_h}, {out_w})")
    }
    if h == 0 || w == 0 {
        candle::bail!("interpolate: empty input size ({h}, {w})")
    }
    if (h, w) == (out_h, out_w) {
        return Ok(xs.clone());
    }
    let rows = weights_tensor(bilinear_weights(h, out_h, align_corners), h, out_h, xs)?;
    let cols = weights_tensor(bilinear_weights(w, out_w, align_corners), w, out_w, xs)?;
    separable(xs, &rows, &cols)
}

/// Adaptive average pooling of an NCHW tensor to `(out_h, out_w)` bins.
///
/// Output bin `i` averages the input range `[floor(i * in / out), ceil((i + 1) * in / out))`,
/// so neighbouring bins may overlap when the size is not divisible.
pub fn adaptive_avg_pool2d(xs: &Tensor, (out_h, out_w): (usize, usize)) -> Result<Tensor> {
    let (_, _, h, w) = xs.dims4()?;
    if out_h == 0 || out_w == 0 {
        candle::bail!("adaptive_avg_pool2d: empty target size ({out_h}, {out_w})")
    }
    if h == 0 || w == 0 {
        candle::bail!("adaptive_avg_pool2d: empty input size ({h}, {w})")
    }
    if (out_h, out_w) == (1, 1) {
        return xs.mean_keepdim(2)?.mean_keepdim(3);
    }
    let rows = weights_tensor(adaptive_pool_weights(h, out_h), h, out_h, xs)?;
    let cols = weights_tensor(adaptive_pool_weights(w, out_w), w, out_w, xs)?;
    separable(xs, &rows, &cols)
}

/// Channel-wise dropout: every `(batch, channel)` plane is zeroed with probability `drop_p`, the
/// remaining ones are scaled by `1 / (1 - drop_p)`.
pub fn dropout2d(xs: &Tensor, drop_p: f32) -> Result<Tensor> {
    if !(0. ..1.).contains(&drop_p) {
        candle::bail!("dropout probability has to be in [0, 1), got {drop_p}")
    }
    let (b, c, _, _) = xs.dims4()?;
    let rand = Tensor::rand(0f32, 1f32, (b, c, 1, 1), xs.device())?;
    let scale = 1.0 / (1.0 - drop_p as f64);
    let drop_p = Tensor::new(drop_p, xs.device())?.broadcast_as(rand.shape())?;
    let mask = (rand.ge(&drop_p)?.to_dtype(xs.dtype())? * scale)?;
    xs.broadcast_mul(&mask)
}

#[derive(Clone, Debug)]
pub struct Dropout2d {
    drop_p: f32,
}

impl Dropout2d {
    pub fn new(drop_p: f32) -> Self {
        Self { drop_p }
    }
}

impl candle::ModuleT for Dropout2d {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        if train && self.drop_p > 0. {
            dropout2d(xs, self.drop_p)
        } else {
            Ok(xs.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bilinear_weights_columns_sum_to_one() {
        for &(src, dst) in &[(2, 3), (5, 2), (7, 7), (1, 4), (4, 1)] {
            for &align_corners in &[false, true] {
                let ws = bilinear_weights(src, dst, align_corners);
                for o in 0..dst {
                    let sum: f32 = (0..src).map(|i| ws[i * dst + o]).sum();
                    assert!((sum - 1.).abs() < 1e-6, "{src} {dst} {align_corners} {sum}");
                }
            }
        }
    }

    #[test]
    fn adaptive_pool_bins_overlap_when_not_divisible() {
        // 5 -> 3: [0, 2), [1, 4), [3, 5)
        let ws = adaptive_pool_weights(5, 3);
        let col = |o: usize| (0..5).map(|i| ws[i * 3 + o]).collect::<Vec<_>>();
        assert_eq!(col(0), [0.5, 0.5, 0., 0., 0.]);
        let third = 1. / 3.;
        assert_eq!(col(1), [0., third, third, third, 0.]);
        assert_eq!(col(2), [0., 0., 0., 0.5, 0.5]);
    }
}
