use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use faceapi_core::catalog::required_files;
use faceapi_core::{
    Actions, AnalyzeOptions, AnalyzerSettings, DecodedImage, DistanceMetric, FaceAnalyzer,
    OnnxAnalyzer, RecognitionModel, RepresentOptions, VerifyOptions,
};
use serde_json::json;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "faceapi", about = "Face analysis on local image files")]
struct Cli {
    /// Directory holding the ONNX model files
    #[arg(long, global = true, env = "FACEAPI_MODEL_DIR")]
    model_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Estimate age, gender and emotion of every face
    Analyze {
        image: PathBuf,
        /// Comma-separated subset of age, gender, emotion
        #[arg(long, value_delimiter = ',', default_value = "age,gender,emotion")]
        actions: Vec<String>,
        /// Fail when no face is found instead of using the whole image
        #[arg(long)]
        enforce_detection: bool,
    },
    /// Check whether two images show the same person
    Verify {
        img1: PathBuf,
        img2: PathBuf,
        #[arg(long, default_value = "VGG-Face")]
        model: RecognitionModel,
        #[arg(long, default_value = "cosine")]
        metric: DistanceMetric,
        #[arg(long)]
        enforce_detection: bool,
    },
    /// Print the embedding of every face
    Represent {
        image: PathBuf,
        #[arg(long, default_value = "VGG-Face")]
        model: RecognitionModel,
        #[arg(long)]
        enforce_detection: bool,
    },
    /// List the model files and whether they are installed
    Models,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let model_dir = cli.model_dir.unwrap_or_else(faceapi_core::default_model_dir);
    let recognition = recognition_models(&cli.command);

    match cli.command {
        Commands::Analyze {
            image,
            actions,
            enforce_detection,
        } => {
            let actions = Actions::from_names(actions.as_slice()).map_err(anyhow::Error::msg)?;
            if actions.is_empty() {
                bail!("no actions requested");
            }
            let image = load_image(&image)?;
            let mut analyzer = load_analyzer(&model_dir, recognition, true)?;
            let options = AnalyzeOptions {
                actions,
                enforce_detection,
            };
            print_json(&analyzer.analyze(&image, &options)?)?;
        }
        Commands::Verify {
            img1,
            img2,
            model,
            metric,
            enforce_detection,
        } => {
            let img1 = load_image(&img1)?;
            let img2 = load_image(&img2)?;
            let mut analyzer = load_analyzer(&model_dir, recognition, false)?;
            let options = VerifyOptions {
                model,
                metric,
                enforce_detection,
            };
            print_json(&analyzer.verify(&img1, &img2, &options)?)?;
        }
        Commands::Represent {
            image,
            model,
            enforce_detection,
        } => {
            let image = load_image(&image)?;
            let mut analyzer = load_analyzer(&model_dir, recognition, false)?;
            let options = RepresentOptions {
                model,
                enforce_detection,
            };
            print_json(&analyzer.represent(&image, &options)?)?;
        }
        Commands::Models => {
            let files = required_files(&model_dir, &RecognitionModel::ALL, true)?;
            let listing: Vec<_> = files
                .iter()
                .map(|f| {
                    json!({ "model": f.label, "path": f.path, "installed": f.exists() })
                })
                .collect();
            print_json(&listing)?;
        }
    }

    Ok(())
}

/// Recognition models a subcommand has to load. Analyze only needs the
/// detector and the attribute classifiers.
fn recognition_models(command: &Commands) -> Vec<RecognitionModel> {
    match command {
        Commands::Verify { model, .. } | Commands::Represent { model, .. } => vec![*model],
        Commands::Analyze { .. } | Commands::Models => vec![],
    }
}

fn load_image(path: &Path) -> Result<DecodedImage> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    faceapi_core::decode(&bytes, None).with_context(|| format!("{}", path.display()))
}

fn load_analyzer(
    model_dir: &Path,
    recognition_models: Vec<RecognitionModel>,
    with_attributes: bool,
) -> Result<OnnxAnalyzer> {
    let settings = AnalyzerSettings {
        model_dir: model_dir.to_path_buf(),
        recognition_models,
        with_attributes,
        ..AnalyzerSettings::default()
    };
    OnnxAnalyzer::load(&settings)
        .with_context(|| format!("failed to load models from {}", model_dir.display()))
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
