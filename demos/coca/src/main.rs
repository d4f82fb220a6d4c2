use argh::FromArgs;
use std::path::PathBuf;

use candle_core::{DType, Device, Tensor};
use kornia_coca::{Coca, CocaConfig};

#[derive(FromArgs)]
/// Build a CoCa model and run a forward pass on random inputs
struct Args {
    /// path to a JSON configuration, the default configuration otherwise
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,

    /// number of image-text pairs
    #[argh(option, default = "2")]
    batch_size: usize,

    /// height and width of the images
    #[argh(option, default = "224")]
    image_size: usize,

    /// number of text tokens
    #[argh(option, default = "32")]
    seq_len: usize,

    /// also compute the contrastive features
    #[argh(switch)]
    contrastive: bool,

    /// write the configuration to this path
    #[argh(option)]
    save_config: Option<PathBuf>,

    /// write the weights to this safetensors path
    #[argh(option)]
    save_weights: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: Args = argh::from_env();

    let config = match &args.config {
        Some(path) => CocaConfig::from_json_file(path)?,
        None => CocaConfig::default(),
    };

    #[cfg(feature = "cuda")]
    let device = match Device::cuda_if_available(0) {
        Ok(device) => device,
        Err(e) => {
            log::warn!("CUDA not available, defaulting to CPU: {e}");
            Device::Cpu
        }
    };

    #[cfg(not(feature = "cuda"))]
    let device = Device::Cpu;

    // create and build the model for the requested shapes
    let mut model = Coca::new(config, &device)?;
    model.build(&[
        vec![args.batch_size, args.image_size, args.image_size, 3],
        vec![args.batch_size, args.seq_len],
    ])?;

    let images = Tensor::rand(
        0f32,
        1.,
        (args.batch_size, args.image_size, args.image_size, 3),
        &device,
    )?;
    let texts = Tensor::zeros((args.batch_size, args.seq_len), DType::U32, &device)?;

    let output = model.forward(&images, &texts, args.contrastive)?;
    log::info!("captioning output: {:?}", output.captioning.dims());
    if let Some(contrastive) = &output.contrastive {
        log::info!(
            "contrastive features: image {:?}, text {:?}",
            contrastive.image.dims(),
            contrastive.text.dims()
        );
    }

    if let Some(path) = &args.save_config {
        model.config().to_json_file(path)?;
        log::info!("configuration written to {}", path.display());
    }

    if let Some(path) = &args.save_weights {
        model.save_weights(path)?;
        log::info!("weights written to {}", path.display());
    }

    Ok(())
}
