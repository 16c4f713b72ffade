// gpufilter — run one image filter kernel over a CSV image on the GPU.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gpufilter::config::{DevicePolicy, PipelineConfig};
use gpufilter::gpu::device::{DeviceOptions, DeviceProfile};
use gpufilter::gpu::sizing::Sizing;
use gpufilter::pipeline;
use gpufilter::store::RowPolicy;

#[derive(Parser)]
#[command(name = "gpufilter")]
#[command(version, about = "Apply a GPU compute kernel to a CSV image")]
struct Cli {
    /// Input image (comma-separated rows)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Where to write the filtered image
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// WGSL kernel source (default: the built-in 3×3 box filter)
    #[arg(short, long)]
    kernel: Option<PathBuf>,

    /// Kernel entry point
    #[arg(long)]
    entry: Option<String>,

    /// Image width in pixels
    #[arg(long)]
    width: Option<usize>,

    /// Image height in pixels
    #[arg(long)]
    height: Option<usize>,

    /// Invocations per workgroup
    #[arg(short, long)]
    local_size: Option<u32>,

    /// How many workgroups to launch
    #[arg(long, value_enum)]
    sizing: Option<SizingArg>,

    /// Abort on the first device error instead of reporting and continuing
    #[arg(long)]
    strict: bool,

    /// Reject input rows with too few values instead of zero-filling them
    #[arg(long)]
    strict_rows: bool,

    /// Request the portable limit set instead of the adapter's own
    #[arg(long)]
    constrained: bool,

    /// Accept a software (CPU) adapter on any backend
    #[arg(long)]
    allow_software: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Copy, ValueEnum)]
enum SizingArg {
    /// ceil(width*height / local²) groups
    Squared,
    /// ceil(width*height / local) groups
    Covering,
}

impl Cli {
    fn into_config(self) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        if let Some(input) = self.input {
            config.input = input;
        }
        if let Some(output) = self.output {
            config.output = output;
        }
        if let Some(kernel) = self.kernel {
            config.kernel = Some(kernel);
        }
        if let Some(entry) = self.entry {
            config.entry_point = entry;
        }
        config.width = self.width.unwrap_or(config.width);
        config.height = self.height.unwrap_or(config.height);
        config.local_size = self.local_size.unwrap_or(config.local_size);
        if let Some(sizing) = self.sizing {
            config.sizing = match sizing {
                SizingArg::Squared => Sizing::SquaredLocal,
                SizingArg::Covering => Sizing::Covering,
            };
        }
        if self.strict {
            config.policy = DevicePolicy::Abort;
        }
        if self.strict_rows {
            config.csv.row_policy = RowPolicy::Strict;
        }
        if self.allow_software {
            config.device = DeviceOptions::permissive();
        }
        if self.constrained {
            config.device.profile = DeviceProfile::Constrained;
        }
        config
    }
}

/// Filter directives for the subscriber. `-v` flags win; without them a
/// non-empty `RUST_LOG` is used as given, else `info`.
fn log_directives(verbose: u8, rust_log: Option<&str>) -> String {
    match (verbose, rust_log) {
        (0, Some(env)) if !env.trim().is_empty() => env.to_string(),
        (0, _) => "info".to_string(),
        (1, _) => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

fn init_logging(verbose: u8) {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(EnvFilter::new(log_directives(verbose, rust_log.as_deref())))
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = cli.into_config();
    match pipeline::run(&config) {
        Ok(report) => {
            tracing::debug!("{report:?}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("gpufilter: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rust_log_applies_without_flags() {
        assert_eq!(log_directives(0, Some("warn")), "warn");
        assert_eq!(log_directives(0, Some("gpufilter=debug,wgpu=warn")), "gpufilter=debug,wgpu=warn");
        assert_eq!(log_directives(0, Some("  ")), "info");
        assert_eq!(log_directives(0, None), "info");
    }

    #[test]
    fn test_verbose_flags_override_rust_log() {
        assert_eq!(log_directives(1, Some("warn")), "debug");
        assert_eq!(log_directives(2, None), "trace");
        assert_eq!(log_directives(5, Some("error")), "trace");
    }

    #[test]
    fn test_kernel_flag_replaces_built_in() {
        let cli = Cli::parse_from(["gpufilter", "-k", "blur.wgsl", "--allow-software", "--constrained"]);
        let config = cli.into_config();
        assert_eq!(config.kernel, Some(PathBuf::from("blur.wgsl")));
        assert!(config.device.allow_software);
        assert_eq!(config.device.profile, DeviceProfile::Constrained);

        let config = Cli::parse_from(["gpufilter"]).into_config();
        assert!(config.kernel.is_none());
    }
}
