//! Stereo rig calibration tool.
//!
//! Usage:
//! ```bash
//! stereo-calib calibrate --input captures --cols 8 --rows 4 --square-size 0.03 \
//!   --output params --render debug
//! stereo-calib synth --output captures --pairs 10
//! ```

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use flexi_logger::{colored_detailed_format, detailed_format, Duplicate, FileSpec, Logger};
use log::info;

use stereo_calib::calibration::{
    loader, stereo_calibration, CalibrationConfig, CalibrationResult, ChessboardPattern,
};
use stereo_calib::synthetic::{self, SyntheticRig};
use stereo_calib::util;

/// Stereo camera calibration from chessboard image pairs
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Calibrate a rig from <input>/stereo_left and <input>/stereo_right
    Calibrate {
        /// Directory holding the left and right image folders
        #[arg(short, long)]
        input: PathBuf,

        /// Interior corners along one board row
        #[arg(long, default_value = "8")]
        cols: usize,

        /// Number of interior corner rows
        #[arg(long, default_value = "4")]
        rows: usize,

        /// Edge length of one square
        #[arg(short, long, default_value = "0.03")]
        square_size: f64,

        /// Directory receiving stereo_calib.npz (overrides the config file)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Directory for annotated detection images
        #[arg(short, long)]
        render: Option<PathBuf>,

        /// Use at most this many pairs
        #[arg(long)]
        image_limit: Option<usize>,

        /// YAML configuration; the pattern options above are ignored when set
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Per-pair detection report
        #[arg(long)]
        report_csv: Option<PathBuf>,

        /// Run summary
        #[arg(long)]
        report_json: Option<PathBuf>,

        /// Directory for left.yaml and right.yaml camera files
        #[arg(long)]
        export_yaml: Option<PathBuf>,

        /// Directory for rectified copies of the first image pair
        #[arg(long)]
        rectified: Option<PathBuf>,
    },
    /// Render a synthetic dataset in the calibrate input layout
    Synth {
        #[arg(short, long)]
        output: PathBuf,

        #[arg(short, long, default_value = "10")]
        pairs: usize,

        #[arg(long, default_value = "8")]
        cols: usize,

        #[arg(long, default_value = "4")]
        rows: usize,

        #[arg(short, long, default_value = "0.03")]
        square_size: f64,
    },
}

/// Rectifies the first input pair with the calibration result.
fn write_rectified_preview(
    input: &Path,
    config: &CalibrationConfig,
    result: &CalibrationResult,
    dir: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let pairs = loader::list_image_pairs(input, &config.subdirs, 1, config.require_matching_names)?;
    let Some(first) = pairs.first() else {
        return Ok(());
    };
    let pair = loader::load_pair(first, Some(result.image_size))?;
    let maps = result
        .rectification
        .maps(&result.cameras.left, &result.cameras.right);
    let dir = util::ensure_dir(dir)?;
    maps.left
        .remap_rgb(&pair.rgb.left)
        .save(dir.join(format!("rectified_left_{}", pair.names.left)))?;
    maps.right
        .remap_rgb(&pair.rgb.right)
        .save(dir.join(format!("rectified_right_{}", pair.names.right)))?;
    info!("Wrote rectified preview of {} to {}", pair.names.left, dir.display());
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    let _logger = Logger::try_with_str(level)?
        .log_to_file(
            FileSpec::default()
                .directory("logs")
                .suppress_timestamp()
                .suffix("log"),
        )
        .duplicate_to_stdout(Duplicate::All)
        .format_for_files(detailed_format)
        .format_for_stdout(colored_detailed_format)
        // error;warn;info;debug;trace
        .set_palette("196;208;76;39;178".to_string())
        .start()?;

    match cli.command {
        Command::Calibrate {
            input,
            cols,
            rows,
            square_size,
            output,
            render,
            image_limit,
            config,
            report_csv,
            report_json,
            export_yaml,
            rectified,
        } => {
            let mut config = match config {
                Some(path) => {
                    info!("Loading configuration from {}", path.display());
                    CalibrationConfig::from_yaml_file(&path)?
                }
                None => CalibrationConfig::builder(ChessboardPattern::new(rows, cols, square_size)?)
                    .build()?,
            };
            if let Some(output) = output {
                config.param_save_path = output;
            }
            if render.is_some() {
                config.render_dir = render;
            }
            if let Some(limit) = image_limit {
                config.image_limit = limit;
            }
            config.validate()?;

            let result = stereo_calibration(&input, &config)?;
            util::display_results_summary(&result);

            if let Some(path) = report_csv {
                util::write_sample_report(&path, &result)?;
                info!("Wrote detection report {}", path.display());
            }
            if let Some(path) = report_json {
                util::write_json_summary(&path, &result)?;
                info!("Wrote run summary {}", path.display());
            }
            if let Some(dir) = export_yaml {
                let paths = util::export_camera_yaml(&dir, &result)?;
                info!(
                    "Wrote camera files {} and {}",
                    paths.left.display(),
                    paths.right.display()
                );
            }
            if let Some(dir) = rectified {
                write_rectified_preview(&input, &config, &result, &dir)?;
            }
            println!("RMS error: {:.6}", result.rms_error);
        }
        Command::Synth {
            output,
            pairs,
            cols,
            rows,
            square_size,
        } => {
            let pattern = ChessboardPattern::new(rows, cols, square_size)?;
            let config = CalibrationConfig::builder(pattern).build()?;
            synthetic::write_dataset(&output, &config.subdirs, &SyntheticRig::default(), &pattern, pairs)?;
        }
    }
    Ok(())
}
