use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use accelforge::capability::{CapabilityTable, HwGeneration, OperationKind};
use accelforge::device::{
    AccelerationPreference, DeviceSession, RequestConfig, RequestProfiler, RequestStatus,
    SessionConfig, SoftwareDevice,
};
use accelforge::kernels::{AccelerationMode, KernelRegistry};
use accelforge::tensor::{Buffer, DataType, OperandRole, Shape, TensorDesc};
use accelforge::transform::{build_transform, OperationDescriptor};

#[derive(Parser, Debug)]
#[command(name = "accelforge-cli", version)]
#[command(about = "Inspect and exercise the accelforge runtime", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Dump the capability table as JSON
    Capabilities {
        /// Hardware generation (v1, v2, v3)
        #[arg(long, default_value = "v3")]
        generation: String,
    },
    /// List registered (operation, kernel mode, acceleration) triples
    Kernels,
    /// Run a small affine layer on the software device
    Selftest {
        /// Force an acceleration mode instead of the fastest available
        #[arg(long)]
        acceleration: Option<String>,
        /// Wait timeout in milliseconds
        #[arg(long, default_value_t = 1000)]
        timeout_ms: u64,
    },
}

fn main() -> anyhow::Result<()> {
    accelforge::logging::init_default();
    let cli = Cli::parse();
    match cli.command {
        Commands::Capabilities { generation } => {
            let generation = HwGeneration::parse(&generation)
                .with_context(|| format!("unknown generation {:?}", generation))?;
            let rows = CapabilityTable::global().snapshot(generation);
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Commands::Kernels => {
            let registry = KernelRegistry::global();
            println!("acceleration modes: {:?}", registry.modes());
            for (op, mode, accel) in registry.entries() {
                println!("{:<20} {:<40} {}", op.to_string(), mode.to_string(), accel);
            }
        }
        Commands::Selftest {
            acceleration,
            timeout_ms,
        } => selftest(acceleration.as_deref(), Duration::from_millis(timeout_ms))?,
    }
    Ok(())
}

fn selftest(acceleration: Option<&str>, timeout: Duration) -> anyhow::Result<()> {
    let mut config = SessionConfig::from_env()?;
    if let Some(name) = acceleration {
        let mode = AccelerationMode::parse(name)
            .with_context(|| format!("unknown acceleration mode {:?}", name))?;
        config = config.with_acceleration(AccelerationPreference::Fixed(mode));
    }

    let profiler = Arc::new(RequestProfiler::new());
    let device = SoftwareDevice::new(config.generation_override.unwrap_or_default());
    let mut session = DeviceSession::open(device, config)?.with_profiler(Arc::clone(&profiler));

    // 4 output rows, 16 elements, 1 vector: row r sums (r + 1) * input
    let input: Vec<i16> = (1..=16).collect();
    let weights: Vec<i16> = (0..4).flat_map(|r| [r as i16 + 1; 16]).collect();
    let output = Buffer::zeroed(4 * 4);
    let descriptor = OperationDescriptor::new(OperationKind::Affine)
        .with_operand(
            OperandRole::Input,
            TensorDesc::new(Shape::hw(16, 1), DataType::Int16, Buffer::from_i16(&input)),
        )
        .with_operand(
            OperandRole::Output,
            TensorDesc::new(Shape::hw(4, 1), DataType::Int32, output.clone()),
        )
        .with_operand(
            OperandRole::Weights,
            TensorDesc::new(Shape::hw(4, 16), DataType::Int16, Buffer::from_i16(&weights)),
        )
        .with_operand(
            OperandRole::Biases,
            TensorDesc::new(Shape::h(4), DataType::Int32, Buffer::from_i32(&[0, 1, 2, 3])),
        );

    let transform = build_transform(&descriptor, &session.validator())?
        .context("affine transform was not built")?;
    let request = session.submit(&RequestConfig::new().with_layer(Arc::from(transform)))?;

    let status = loop {
        match session.wait(request, timeout)? {
            RequestStatus::StillRunning => println!("request {} still running", request),
            done => break done,
        }
    };

    let values = output.to_i32_vec()?;
    let expected: Vec<i32> = (0..4).map(|r| 136 * (r + 1) + r).collect();
    println!(
        "request {}: {} on {} ({})",
        request,
        status.status(),
        session.acceleration(),
        session.generation()
    );
    println!("output: {:?}", values);
    if let Some(record) = profiler.get(request)? {
        if let Some(total) = record.total() {
            println!("latency: {:?}", total);
        }
    }
    if values != expected {
        bail!("selftest mismatch: expected {:?}", expected);
    }
    Ok(())
}
