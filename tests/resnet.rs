#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use std::collections::HashMap;

use anyhow::Result;
use candle::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use candle_upernet::models::backbone::Backbone;
use candle_upernet::models::resnet::{Config, ResNet, Variant};

fn dims(features: &[Tensor]) -> Vec<Vec<usize>> {
    features.iter().map(|t| t.dims().to_vec()).collect()
}

#[test]
fn resnet18_features() -> Result<()> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let model = ResNet::new(&Config::new(18).with_variant(Variant::B), vb)?;
    assert_eq!(model.feat_channels(), &[64, 128, 256, 512]);

    let xs = Tensor::randn(0f32, 1f32, (2, 3, 64, 64), &Device::Cpu)?;
    let features = model.forward_features(&xs, false)?;
    assert_eq!(
        dims(&features),
        [
            [2, 64, 16, 16],
            [2, 128, 8, 8],
            [2, 256, 4, 4],
            [2, 512, 2, 2]
        ]
    );

    let names = varmap.data().lock().unwrap();
    assert!(names.contains_key("conv1.weight"));
    assert!(names.contains_key("layer2.0.downsample.0.weight"));
    assert!(names.contains_key("layer2.0.downsample.1.running_var"));
    assert!(!names.contains_key("layer1.0.downsample.0.weight"));
    Ok(())
}

#[test]
fn resnet_d_odd_input() -> Result<()> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let model = ResNet::new(&Config::new(18), vb)?;
    let xs = Tensor::randn(0f32, 1f32, (1, 3, 65, 65), &Device::Cpu)?;
    let features = model.forward_features(&xs, false)?;
    assert_eq!(
        dims(&features),
        [
            [1, 64, 17, 17],
            [1, 128, 9, 9],
            [1, 256, 5, 5],
            [1, 512, 3, 3]
        ]
    );

    let names = varmap.data().lock().unwrap();
    assert!(names.contains_key("conv1.0.weight"));
    assert!(names.contains_key("conv1.6.weight"));
    assert!(names.contains_key("bn1.running_mean"));
    // The shortcut convolution comes after the pooling layer.
    assert!(names.contains_key("layer3.0.downsample.1.weight"));
    assert!(names.contains_key("layer3.0.downsample.2.weight"));
    Ok(())
}

#[test]
fn resnet50_output_stride_8() -> Result<()> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let model = ResNet::new(&Config::new(50).with_output_stride(8), vb)?;
    assert_eq!(model.feat_channels(), &[256, 512, 1024, 2048]);
    let xs = Tensor::randn(0f32, 1f32, (1, 3, 64, 64), &Device::Cpu)?;
    let features = model.forward_features(&xs, false)?;
    assert_eq!(
        dims(&features),
        [
            [1, 256, 16, 16],
            [1, 512, 8, 8],
            [1, 1024, 8, 8],
            [1, 2048, 8, 8]
        ]
    );
    Ok(())
}

#[test]
fn resnet50_output_stride_16() -> Result<()> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let model = ResNet::new(&Config::new(50).with_output_stride(16), vb)?;
    let xs = Tensor::randn(0f32, 1f32, (1, 3, 64, 64), &Device::Cpu)?;
    let features = model.forward_features(&xs, false)?;
    assert_eq!(
        dims(&features),
        [
            [1, 256, 16, 16],
            [1, 512, 8, 8],
            [1, 1024, 4, 4],
            [1, 2048, 4, 4]
        ]
    );

    // The dilated stage keeps the average-pool shortcut layout.
    let names = varmap.data().lock().unwrap();
    assert_eq!(names["layer4.0.downsample.1.weight"].dims(), &[2048, 1024, 1, 1]);
    assert!(!names.contains_key("layer4.0.downsample.0.weight"));
    Ok(())
}

#[test]
fn resnet50_d_shortcut_names() -> Result<()> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    ResNet::new(&Config::new(50), vb)?;
    let names = varmap.data().lock().unwrap();
    // The stride 1 shortcut of the first stage still leaves index 0 to the pooling layer.
    assert_eq!(names["layer1.0.downsample.1.weight"].dims(), &[256, 64, 1, 1]);
    assert!(names.contains_key("layer1.0.downsample.2.running_var"));
    assert!(!names.contains_key("layer1.0.downsample.0.weight"));
    assert_eq!(names["layer2.0.downsample.1.weight"].dims(), &[512, 256, 1, 1]);
    assert!(!names.contains_key("layer1.1.downsample.1.weight"));
    Ok(())
}

#[test]
fn paddle_batch_norm_statistics() -> Result<()> {
    let dev = &Device::Cpu;
    let cfg = Config::new(18).with_variant(Variant::B);
    let varmap = VarMap::new();
    ResNet::new(&cfg, VarBuilder::from_varmap(&varmap, DType::F32, dev))?;

    let mut torch_names = HashMap::new();
    let mut paddle_names = HashMap::new();
    for (name, var) in varmap.data().lock().unwrap().iter() {
        let t = var.as_tensor().clone();
        if let Some(prefix) = name.strip_suffix("running_mean") {
            let t = (t.ones_like()? * 0.5)?;
            paddle_names.insert(format!("{prefix}_mean"), t.clone());
            torch_names.insert(name.clone(), t);
        } else if let Some(prefix) = name.strip_suffix("running_var") {
            let t = (t.ones_like()? * 4.)?;
            paddle_names.insert(format!("{prefix}_variance"), t.clone());
            torch_names.insert(name.clone(), t);
        } else {
            paddle_names.insert(name.clone(), t.clone());
            torch_names.insert(name.clone(), t);
        }
    }
    let torch = ResNet::new(&cfg, VarBuilder::from_tensors(torch_names, DType::F32, dev))?;
    let paddle = ResNet::new(&cfg, VarBuilder::from_tensors(paddle_names, DType::F32, dev))?;

    let xs = Tensor::randn(0f32, 1f32, (1, 3, 32, 32), dev)?;
    let ys_torch = torch.forward_features(&xs, false)?;
    let ys_paddle = paddle.forward_features(&xs, false)?;
    for (a, b) in ys_torch.iter().zip(ys_paddle.iter()) {
        let diff = (a - b)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.);
    }
    Ok(())
}

#[test]
fn unsupported_depth() -> Result<()> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    assert!(ResNet::new(&Config::new(26), vb).is_err());
    Ok(())
}
