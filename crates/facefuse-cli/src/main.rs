use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facefuse_core::{
    Config, FaceRestorationEngine, FaceSwapEngine, ImageBuffer, ModelManager, RestoreParams,
    SwapParams,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "facefuse", about = "Face swap and face restoration")]
struct Cli {
    /// TOML config file; FACEFUSE_* environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Put the first face of SOURCE onto every face of TARGET
    Swap {
        #[arg(long)]
        source: PathBuf,
        #[arg(long)]
        target: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// Weight of the swapped result in the final image
        #[arg(long, default_value_t = SwapParams::default().blend_strength)]
        blend_strength: f32,
        #[arg(long)]
        no_color_correction: bool,
        #[arg(long, default_value_t = SwapParams::default().face_scale)]
        face_scale: f32,
    },
    /// Restore faces in INPUT
    Restore {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long, default_value_t = RestoreParams::default().strength)]
        strength: f32,
        #[arg(long, default_value_t = RestoreParams::default().denoise_level)]
        denoise_level: f32,
        #[arg(long, default_value_t = RestoreParams::default().sharpen_amount)]
        sharpen_amount: f32,
        #[arg(long)]
        no_enhance_details: bool,
    },
    /// Print device and model status as JSON
    Status {
        /// Load every model first instead of reporting the cold state
        #[arg(long)]
        load: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    tracing::debug!(?config, "configuration loaded");

    let mut models = ModelManager::from_config(&config);

    match cli.command {
        Commands::Swap {
            source,
            target,
            output,
            blend_strength,
            no_color_correction,
            face_scale,
        } => {
            let params = SwapParams {
                blend_strength,
                color_correction: !no_color_correction,
                face_scale,
            };
            params.validate()?;

            let source = load_image(&source)?;
            let target = load_image(&target)?;
            let engine = FaceSwapEngine::new(&models);
            engine.initialize().await?;
            let result = engine.swap(&source, &target, &params).await?;
            save_image(result, &output)?;
            println!("wrote {}", output.display());
        }
        Commands::Restore {
            input,
            output,
            strength,
            denoise_level,
            sharpen_amount,
            no_enhance_details,
        } => {
            let params = RestoreParams {
                strength,
                denoise_level,
                sharpen_amount,
                enhance_details: !no_enhance_details,
            };
            params.validate()?;

            let image = load_image(&input)?;
            let engine = FaceRestorationEngine::new(&models);
            let path = engine.initialize().await;
            let result = engine.restore(&image, &params).await?;
            save_image(result, &output)?;
            println!("wrote {} ({path:?} path)", output.display());
        }
        Commands::Status { load } => {
            if load {
                if let Err(e) = models.initialize().await {
                    tracing::warn!(error = %e, "model initialization failed");
                }
            }
            println!("{}", serde_json::to_string_pretty(&models.status())?);
        }
    }

    models.cleanup();
    Ok(())
}

/// Decode any format the `image` crate reads; alpha is dropped.
fn load_image(path: &Path) -> Result<ImageBuffer> {
    let img = image::open(path).with_context(|| format!("failed to read image {}", path.display()))?;
    Ok(ImageBuffer::from(img.to_rgb8()))
}

fn save_image(image: ImageBuffer, path: &Path) -> Result<()> {
    image
        .into_rgb_image()
        .save(path)
        .with_context(|| format!("failed to write image {}", path.display()))
}
