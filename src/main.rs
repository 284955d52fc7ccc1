#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use std::path::PathBuf;

use anyhow::Result;
use candle::DType;
use candle_nn::{VarBuilder, VarMap};
use candle_upernet::models::{resnet, upernet};
use candle_upernet::vision;
use clap::{Parser, ValueEnum};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Variant {
    B,
    D,
}

impl From<Variant> for resnet::Variant {
    fn from(v: Variant) -> Self {
        match v {
            Variant::B => Self::B,
            Variant::D => Self::D,
        }
    }
}

#[derive(Parser)]
#[clap(about, version, long_about = None)]
struct Args {
    /// Path to the input image.
    #[arg(long)]
    image: PathBuf,

    /// Where to write the colored segmentation mask.
    #[arg(long, default_value = "mask.png")]
    output: PathBuf,

    /// Model configuration in json format, overrides the architecture flags below.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Safetensors weights: a local path, hf://owner/repo/file or a huggingface.co url.
    /// The model is randomly initialized when neither this nor the config provide weights.
    #[arg(long)]
    weights: Option<String>,

    #[arg(long, default_value_t = 19)]
    num_classes: usize,

    /// ResNet depth of the backbone.
    #[arg(long, default_value_t = 50)]
    layers: usize,

    #[arg(value_enum, long, default_value_t = Variant::D)]
    variant: Variant,

    /// Resize the input to this height before running the model.
    #[arg(long, requires = "width")]
    height: Option<usize>,

    /// Resize the input to this width before running the model.
    #[arg(long, requires = "height")]
    width: Option<usize>,

    /// Also compute the auxiliary logits.
    #[arg(long)]
    aux: bool,

    #[arg(long)]
    align_corners: bool,

    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    tracing: bool,
}

pub fn main() -> Result<()> {
    use tracing::level_filters::LevelFilter;
    use tracing_chrome::ChromeLayerBuilder;
    use tracing_subscriber::prelude::*;

    let args = Args::parse();
    let (chrome_layer, _guard) = if args.tracing {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        (Some(chrome_layer), Some(guard))
    } else {
        (None, None)
    };
    let fmt_layer = tracing_subscriber::fmt::layer().with_filter(LevelFilter::INFO);
    tracing_subscriber::registry()
        .with(chrome_layer)
        .with(fmt_layer)
        .init();

    let device = vision::device(args.cpu)?;

    let mut cfg = match &args.config {
        Some(path) => {
            let cfg = std::fs::read_to_string(path)?;
            serde_json::from_str::<upernet::Config>(&cfg)?
        }
        None => {
            let backbone = resnet::Config::new(args.layers).with_variant(args.variant.into());
            let mut cfg = upernet::Config::new(args.num_classes, backbone);
            cfg.enable_auxiliary_loss = args.aux;
            cfg.align_corners = args.align_corners;
            cfg
        }
    };
    if let Some(weights) = args.weights {
        cfg.pretrained = Some(weights)
    }
    tracing::info!(?cfg, "model config");

    let model = if cfg.pretrained.is_some() {
        upernet::UperNet::load(&cfg, DType::F32, &device)?
    } else {
        tracing::warn!("no weights provided, using a randomly initialized model");
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        upernet::UperNet::new(&cfg, vb)?
    };
    println!("model built");

    let size = args.height.zip(args.width);
    let image = vision::load_image(&args.image, size, &device)?.unsqueeze(0)?;
    println!("loaded image {image:?}");

    let start = std::time::Instant::now();
    let output = model.forward_t(&image, false)?;
    println!(
        "logits {:?} in {:.2}s",
        output.logits.shape(),
        start.elapsed().as_secs_f32()
    );
    if let Some(aux_logits) = &output.aux_logits {
        println!("auxiliary logits {:?}", aux_logits.shape());
    }

    let mask = output.logits.argmax(1)?.squeeze(0)?;
    vision::save_mask(&mask, &vision::color_map(cfg.num_classes), &args.output)?;
    println!("mask image saved to {:?}", args.output);
    Ok(())
}
