// pipeline.rs — one filter pass, end to end.
//
// ORDER
// ─────
//   load input → zero output → size the dispatch → open device
//   → build kernel → allocate + upload → bind → dispatch (timed)
//   → download → drain → save → release
//
// Everything up to and including the kernel build is fatal on error, as are
// the input and output files. Past that point each device operation is
// reported through the probe and then either tolerated or turned into an
// error depending on `DevicePolicy`. Tolerated failures leave the output
// image zero-filled where the device never wrote to it.
//
// Resources are acquired in the order above and dropped in reverse: the
// buffers go first, then the program, then the session. Buffers are only
// released once the queue has drained, so no in-flight command can still
// reference them.

use crate::config::{ConfigError, DevicePolicy, PipelineConfig};
use crate::gpu::buffer::{AccessMode, BufferError, BufferManager};
use crate::gpu::device::{DeviceError, DeviceSession};
use crate::gpu::dispatch::{BindError, DispatchError, Dispatcher, KernelArg, KernelArgs};
use crate::gpu::profiler::Profiler;
use crate::gpu::program::{self, ProgramBuilder, ProgramError};
use crate::gpu::sizing::{SizingError, SizingRule, WorkDecomposition};
use crate::image::Image;
use crate::probe::{self, StatusCode};
use crate::store::{self, CsvError};

/// Pixel type of the images the shipped kernel filters.
pub type Sample = i32;

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub work: WorkDecomposition,
    /// Device time of the dispatch; 0 when it could not be measured.
    pub kernel_ns: u64,
    /// Device errors that were reported and tolerated.
    pub device_errors: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("input: {0}")]
    Input(#[source] CsvError),

    #[error("output: {0}")]
    Output(#[source] CsvError),

    #[error(transparent)]
    Sizing(#[from] SizingError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Program(#[from] ProgramError),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl StatusCode for PipelineError {
    fn code(&self) -> i32 {
        match self {
            PipelineError::Config(e) => e.code(),
            PipelineError::Input(e) | PipelineError::Output(e) => e.code(),
            PipelineError::Sizing(e) => e.code(),
            PipelineError::Device(e) => e.code(),
            PipelineError::Program(e) => e.code(),
            PipelineError::Buffer(e) => e.code(),
            PipelineError::Bind(e) => e.code(),
            PipelineError::Dispatch(e) => e.code(),
        }
    }
}

impl PipelineError {
    /// Process exit status for this failure. Every failure that reaches
    /// `main` exits with 1.
    pub fn exit_code(&self) -> u8 {
        1
    }
}

/// Applies `DevicePolicy` to the outcome of each device operation and
/// counts the failures it lets through.
struct Checkpoint {
    policy: DevicePolicy,
    tolerated: usize,
}

impl Checkpoint {
    fn new(policy: DevicePolicy) -> Self {
        Checkpoint { policy, tolerated: 0 }
    }

    /// Report `result` and decide. `Ok(None)` means the operation failed
    /// and the policy says to carry on without its value.
    fn check<T, E>(&mut self, result: Result<T, E>, message: &str) -> Result<Option<T>, E>
    where
        E: StatusCode + std::fmt::Display,
    {
        probe::report(&result, message);
        match result {
            Ok(v) => Ok(Some(v)),
            Err(e) => match self.policy {
                DevicePolicy::Continue => {
                    self.tolerated += 1;
                    Ok(None)
                }
                DevicePolicy::Abort => Err(e),
            },
        }
    }

    /// Report every result of a group that counts as one operation, then
    /// decide once. `Ok(false)` means at least one failed and the policy
    /// says to carry on; the group adds one to the tolerated count.
    fn check_all<'m, E>(
        &mut self,
        results: impl IntoIterator<Item = (Result<(), E>, &'m str)>,
    ) -> Result<bool, E>
    where
        E: StatusCode + std::fmt::Display,
    {
        let mut first = None;
        for (result, message) in results {
            probe::report(&result, message);
            if let Err(e) = result {
                first.get_or_insert(e);
            }
        }
        match (first, self.policy) {
            (None, _) => Ok(true),
            (Some(_), DevicePolicy::Continue) => {
                self.tolerated += 1;
                Ok(false)
            }
            (Some(e), DevicePolicy::Abort) => Err(e),
        }
    }
}

/// Run the filter once as described by `config`.
///
/// Prints the sizing line and the kernel time to stdout. Returns an error
/// for every fatal condition; tolerated device errors are counted in the
/// report.
pub fn run(config: &PipelineConfig) -> Result<RunReport, PipelineError> {
    config.validate()?;
    let (width, height) = (config.width, config.height);

    let input: Image<Sample> =
        store::load(&config.input, width, height, &config.csv).map_err(PipelineError::Input)?;
    let mut output: Image<Sample> = Image::new(width, height);
    tracing::info!("loaded {}×{} from {}", width, height, config.input.display());

    let dimension = config.dimension();
    let work = config.sizing.decompose(dimension, config.local_size)?;
    if !work.covers(dimension) {
        probe::report_warning(&format!(
            "{} sizing launches {} invocations for {} elements; \
             the kernel must handle {} elements per invocation",
            config.sizing,
            work.global_size,
            dimension,
            work.elements_per_invocation(dimension)
        ));
    }
    println!("{work}");

    let session = DeviceSession::open(&config.device)?;
    tracing::info!("{session}");

    let source = match &config.kernel {
        Some(path) => program::load_source(path, config.max_source_bytes)?,
        None => program::DEFAULT_KERNEL.to_string(),
    };
    let program = ProgramBuilder::build(&session, &source, &config.entry_point, config.local_size)?;

    let mut checkpoint = Checkpoint::new(config.policy);

    let d_input = BufferManager::allocate_for(&session, "input image", &input, AccessMode::ReadOnly)?;
    let d_output =
        BufferManager::allocate_for(&session, "output image", &output, AccessMode::ReadWrite)?;

    checkpoint.check(
        BufferManager::upload(&session, &d_input, &input),
        "writing to input buffer",
    )?;
    checkpoint.check(
        BufferManager::upload(&session, &d_output, &output),
        "writing to output buffer",
    )?;

    // Each bind is reported on its own; the four count as one operation.
    let mut args = KernelArgs::new();
    let binds = [
        (args.set_arg(0, KernelArg::Buffer(&d_input)), "setting kernel arg 0"),
        (args.set_arg(1, KernelArg::Buffer(&d_output)), "setting kernel arg 1"),
        (args.set_arg(2, KernelArg::Scalar(height as u32)), "setting kernel arg 2"),
        (args.set_arg(3, KernelArg::Scalar(width as u32)), "setting kernel arg 3"),
    ];
    let bound = checkpoint.check_all(binds)?;

    // An incompletely bound kernel is never enqueued.
    let event = if bound {
        checkpoint.check(
            Dispatcher::dispatch(&session, &program, &args, &work),
            "enqueueing kernel",
        )?
    } else {
        None
    };
    let kernel_ns = event.map_or(0, |event| Profiler::measure(&session, event));
    println!("Kernel execution time: {kernel_ns} ns");

    checkpoint.check(
        BufferManager::download(&session, &d_output, &mut output),
        "reading output buffer",
    )?;
    checkpoint.check(session.wait_idle(), "finishing queue")?;

    store::save(&config.output, &output).map_err(PipelineError::Output)?;
    tracing::info!("wrote {}", config.output.display());

    BufferManager::release(d_output);
    BufferManager::release(d_input);
    drop(program);
    drop(session);

    if checkpoint.tolerated > 0 {
        tracing::warn!("{} device error(s) were tolerated", checkpoint.tolerated);
    }
    Ok(RunReport {
        work,
        kernel_ns,
        device_errors: checkpoint.tolerated,
    })
}
