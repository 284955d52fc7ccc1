//! UPerNet semantic segmentation built on candle.
//!
//! ```no_run
//! use candle::{DType, Device, Module, Tensor};
//! use candle_nn::{VarBuilder, VarMap};
//! use candle_upernet::models::{resnet, upernet};
//!
//! # fn main() -> candle::Result<()> {
//! let device = Device::Cpu;
//! let varmap = VarMap::new();
//! let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
//! let cfg = upernet::Config::new(19, resnet::Config::new(18));
//! let model = upernet::UperNet::new(&cfg, vb)?;
//! let image = Tensor::zeros((1, 3, 256, 512), DType::F32, &device)?;
//! let logits = model.forward(&image)?;
//! assert_eq!(logits.dims(), &[1, 19, 256, 512]);
//! # Ok(())
//! # }
//! ```
pub mod models;
pub mod ops;
pub mod vision;
pub mod weights;
