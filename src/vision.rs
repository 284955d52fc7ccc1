//! Image loading and mask visualization helpers.
use candle::{DType, Device, Result, Tensor};

pub const MEAN: [f32; 3] = [0.5, 0.5, 0.5];
pub const STD: [f32; 3] = [0.5, 0.5, 0.5];

pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if candle::utils::cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if candle::utils::metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        tracing::info!("running on CPU, to run on GPU build with `--features cuda` or `metal`");
        Ok(Device::Cpu)
    }
}

/// Loads an RGB image as a `(3, height, width)` f32 tensor normalized with [`MEAN`] and [`STD`].
///
/// When `size` is set the image is resized to `(height, width)` first.
pub fn load_image<P: AsRef<std::path::Path>>(
    p: P,
    size: Option<(usize, usize)>,
    device: &Device,
) -> Result<Tensor> {
    let img = image::ImageReader::open(p)?
        .decode()
        .map_err(candle::Error::wrap)?;
    let img = match size {
        Some((h, w)) => {
            img.resize_exact(w as u32, h as u32, image::imageops::FilterType::Triangle)
        }
        None => img,
    };
    let img = img.to_rgb8();
    let (w, h) = (img.width() as usize, img.height() as usize);
    let data = img.into_raw();
    let data = Tensor::from_vec(data, (h, w, 3), &Device::Cpu)?.permute((2, 0, 1))?;
    let mean = Tensor::new(&MEAN, &Device::Cpu)?.reshape((3, 1, 1))?;
    let std = Tensor::new(&STD, &Device::Cpu)?.reshape((3, 1, 1))?;
    (data.to_dtype(DType::F32)? / 255.)?
        .broadcast_sub(&mean)?
        .broadcast_div(&std)?
        .to_device(device)
}

/// PASCAL VOC style palette: the bits of the class index are spread over the three channels,
/// most significant first.
pub fn color_map(num_classes: usize) -> Vec<[u8; 3]> {
    (0..num_classes)
        .map(|class| {
            let mut rgb = [0u8; 3];
            let mut lab = class;
            let mut j = 0;
            while lab > 0 {
                for (c, v) in rgb.iter_mut().enumerate() {
                    *v |= (((lab >> c) & 1) << (7 - j)) as u8;
                }
                j += 1;
                lab >>= 3;
            }
            rgb
        })
        .collect()
}

/// Writes a `(height, width)` class index map as a colored image.
pub fn save_mask<P: AsRef<std::path::Path>>(
    mask: &Tensor,
    palette: &[[u8; 3]],
    p: P,
) -> Result<()> {
    let (h, w) = mask.dims2()?;
    let mask = mask.to_dtype(DType::U32)?.flatten_all()?.to_vec1::<u32>()?;
    let mut pixels = Vec::with_capacity(h * w * 3);
    for class in mask {
        match palette.get(class as usize) {
            Some(rgb) => pixels.extend_from_slice(rgb),
            None => candle::bail!("class {class} has no color in a palette of {}", palette.len()),
        }
    }
    let img = match image::RgbImage::from_raw(w as u32, h as u32, pixels) {
        Some(img) => img,
        None => candle::bail!("error saving mask of shape ({h}, {w})"),
    };
    img.save(p).map_err(candle::Error::wrap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_map_matches_voc_palette() {
        let palette = color_map(8);
        assert_eq!(palette[0], [0, 0, 0]);
        assert_eq!(palette[1], [128, 0, 0]);
        assert_eq!(palette[2], [0, 128, 0]);
        assert_eq!(palette[3], [128, 128, 0]);
        assert_eq!(palette[4], [0, 0, 128]);
        assert_eq!(palette[7], [128, 128, 128]);
        assert_eq!(color_map(9)[8], [64, 0, 0]);
    }
}
