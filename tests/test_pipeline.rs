// tests/test_pipeline.rs — end-to-end runs of the filter pipeline.
//
// Host-only failures run everywhere. The GPU runs accept any adapter,
// software rasterisers included, and skip with a note when there is none.

use std::path::Path;

use gpufilter::config::{DevicePolicy, PipelineConfig};
use gpufilter::gpu::device::{DeviceError, DeviceOptions};
use gpufilter::gpu::program::{ProgramError, DEFAULT_KERNEL};
use gpufilter::gpu::sizing::Sizing;
use gpufilter::image::Image;
use gpufilter::pipeline::{self, PipelineError};
use gpufilter::store::{self, CsvError, CsvLimits};

const IDENTITY: &str = r#"
const LOCAL_SIZE: u32 = {{LOCAL_SIZE}}u;
@group(0) @binding(0) var<storage, read> input: array<i32>;
@group(0) @binding(1) var<storage, read_write> output: array<i32>;
@group(0) @binding(2) var<uniform> height: u32;
@group(0) @binding(3) var<uniform> width: u32;

@compute @workgroup_size({{LOCAL_SIZE}})
fn filter_image(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) groups: vec3<u32>,
) {
    let stride = groups.x * LOCAL_SIZE;
    for (var i = gid.x; i < width * height; i += stride) {
        output[i] = input[i];
    }
}
"#;

/// Write `img` and `kernel` into `dir` and return a config pointing at them.
fn setup(dir: &Path, img: &Image<i32>, kernel: &str) -> PipelineConfig {
    let input = dir.join("original_0.csv");
    let kernel_path = dir.join("filter.wgsl");
    store::save(&input, img).unwrap();
    std::fs::write(&kernel_path, kernel).unwrap();
    PipelineConfig {
        input,
        output: dir.join("resultado.csv"),
        kernel: Some(kernel_path),
        width: img.width(),
        height: img.height(),
        device: DeviceOptions::permissive(),
        policy: DevicePolicy::Abort,
        ..PipelineConfig::default()
    }
}

fn distinct_4x4() -> Image<i32> {
    Image::from_vec(4, 4, (0..16).map(|i| i * 11 - 70).collect())
}

// ===== Host-only failures =====

#[test]
fn missing_input_exits_with_one_and_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig {
        input: dir.path().join("absent.csv"),
        output: dir.path().join("out.csv"),
        ..PipelineConfig::default()
    };
    let err = pipeline::run(&config).unwrap_err();
    assert!(matches!(err, PipelineError::Input(CsvError::Open { .. })));
    assert_eq!(err.exit_code(), 1);
    assert!(!config.output.exists());
}

#[test]
fn strict_rows_reject_short_input_before_device_work() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = setup(dir.path(), &distinct_4x4(), IDENTITY);
    std::fs::write(&config.input, "1,2,3,4\n5,6\n").unwrap();
    config.csv.row_policy = gpufilter::store::RowPolicy::Strict;

    let err = pipeline::run(&config).unwrap_err();
    assert!(matches!(err, PipelineError::Input(CsvError::Format { line: 2, .. })));
    assert!(!config.output.exists());
}

// ===== GPU runs =====

/// Skip (with a note) rather than fail on machines without an adapter.
fn run_or_skip(config: &PipelineConfig) -> Option<Result<pipeline::RunReport, PipelineError>> {
    match pipeline::run(config) {
        Err(PipelineError::Device(DeviceError::NoSuitableAdapter(_))) => {
            eprintln!("no adapter; skipping");
            None
        }
        other => Some(other),
    }
}

#[test]
fn identity_kernel_reproduces_input_byte_for_byte() {
    let dir = tempfile::tempdir().unwrap();
    let config = setup(dir.path(), &distinct_4x4(), IDENTITY);
    let Some(result) = run_or_skip(&config) else { return };

    let report = result.unwrap();
    assert_eq!(report.device_errors, 0);
    assert_eq!(
        std::fs::read(&config.input).unwrap(),
        std::fs::read(&config.output).unwrap()
    );
}

#[test]
fn identity_kernel_under_both_sizing_rules() {
    let dir = tempfile::tempdir().unwrap();
    let img = Image::from_vec(37, 29, (0..37 * 29).map(|i| i * 3 - 400).collect());
    for sizing in [Sizing::SquaredLocal, Sizing::Covering] {
        let config = PipelineConfig {
            sizing,
            local_size: 8,
            ..setup(dir.path(), &img, IDENTITY)
        };
        let Some(result) = run_or_skip(&config) else { return };
        result.unwrap();
        let out: Image<i32> =
            store::load(&config.output, 37, 29, &CsvLimits::default()).unwrap();
        assert_eq!(out, img, "{sizing}");
    }
}

#[test]
fn box_filter_averages_interior_and_keeps_border() {
    let dir = tempfile::tempdir().unwrap();
    // 9 in the centre of a 3×3, zeros elsewhere: the centre mean is 1.
    let mut img: Image<i32> = Image::new(3, 3);
    img.set(1, 1, 9);
    img.set(0, 0, 5);
    let config = setup(dir.path(), &img, DEFAULT_KERNEL);
    let Some(result) = run_or_skip(&config) else { return };
    result.unwrap();

    let out: Image<i32> = store::load(&config.output, 3, 3, &CsvLimits::default()).unwrap();
    assert_eq!(out.get(1, 1), (9 + 5) / 9);
    assert_eq!(out.get(0, 0), 5);
    assert_eq!(out.get(2, 2), 0);
}

#[test]
fn malformed_kernel_fails_with_log_and_no_output() {
    let dir = tempfile::tempdir().unwrap();
    let broken = IDENTITY.replace("output[i] = input[i];", "output[i] = ;");
    let config = setup(dir.path(), &distinct_4x4(), &broken);
    let Some(result) = run_or_skip(&config) else { return };

    match result {
        Err(PipelineError::Program(ProgramError::Compile { log })) => {
            assert!(!log.trim().is_empty())
        }
        Err(other) => panic!("expected a compile error, got {other}"),
        Ok(_) => panic!("broken kernel ran"),
    }
    assert!(!config.output.exists());
}

#[test]
fn unknown_entry_point_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig {
        entry_point: "sharpen".to_string(),
        ..setup(dir.path(), &distinct_4x4(), IDENTITY)
    };
    let Some(result) = run_or_skip(&config) else { return };
    let err = result.unwrap_err();
    assert!(matches!(err, PipelineError::Program(ProgramError::KernelNotFound { .. })));
    assert_eq!(err.exit_code(), 1);
}

#[test]
fn unwritable_output_is_fatal_without_partial_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig {
        output: dir.path().join("no-such-dir").join("resultado.csv"),
        ..setup(dir.path(), &distinct_4x4(), IDENTITY)
    };
    let Some(result) = run_or_skip(&config) else { return };
    let err = result.unwrap_err();
    assert!(matches!(err, PipelineError::Output(CsvError::Write { .. })));
    assert_eq!(err.exit_code(), 1);
    assert!(!config.output.exists());
}

#[test]
fn embedded_kernel_runs_without_a_kernel_file() {
    let dir = tempfile::tempdir().unwrap();
    let img = Image::from_vec(5, 4, (0..20).map(|i| i * 9).collect());
    let config = PipelineConfig {
        kernel: None,
        ..setup(dir.path(), &img, "unused")
    };
    let Some(result) = run_or_skip(&config) else { return };
    assert_eq!(result.unwrap().device_errors, 0);

    let out: Image<i32> = store::load(&config.output, 5, 4, &CsvLimits::default()).unwrap();
    assert_eq!(out.get(0, 0), img.get(0, 0));
    // Interior mean of a linear ramp is the centre value.
    assert_eq!(out.get(2, 1), img.get(2, 1));
}
