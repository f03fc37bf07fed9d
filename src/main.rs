use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use xferbench::report;
use xferbench::{registry, Comm, CommOptions, Library, LocalWorld, ProcessGroup, Rank};

/// Point-to-point transfer benchmark
#[derive(Parser, Debug, Clone)]
#[command(name = "xferbench", version)]
struct Cli {
    /// Transport library
    #[arg(long, value_enum, default_value_t = Library::Mpi)]
    library: Library,

    /// Ranks of the in-process world
    #[arg(long, default_value_t = 2)]
    ranks: usize,

    /// Elements (f32) per edge
    #[arg(long, default_value_t = 1 << 20)]
    count: usize,

    /// Communication pattern
    #[arg(long, value_enum, default_value_t = Shape::Pair)]
    pattern: Shape,

    /// Warmup iterations, timed but discarded
    #[arg(long, default_value_t = 5)]
    warmup: usize,

    /// Measured iterations
    #[arg(long, default_value_t = 20)]
    iterations: usize,

    /// Write the sorted samples as CSV
    #[arg(long)]
    csv: Option<PathBuf>,

    /// Check that every rank registers the same edges
    #[arg(long)]
    verify_shape: bool,

    /// Run on the MPI world instead of an in-process one
    #[cfg(feature = "distributed")]
    #[arg(long)]
    mpi: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Shape {
    /// Rank 0 to rank 1
    Pair,
    /// Every rank to every other rank
    AllToAll,
    /// Every rank to its successor
    Ring,
}

impl Shape {
    fn edges(self, ranks: usize) -> Vec<(Rank, Rank)> {
        match self {
            Shape::Pair => vec![(0, 1)],
            Shape::AllToAll => (0..ranks)
                .flat_map(|s| (0..ranks).filter(move |&r| r != s).map(move |r| (s, r)))
                .collect(),
            Shape::Ring => (0..ranks).map(|r| (r, (r + 1) % ranks)).collect(),
        }
    }
}

fn bench(group: &ProcessGroup, cli: &Cli) -> anyhow::Result<()> {
    if cli.pattern == Shape::Pair && group.size() < 2 {
        bail!("the pair pattern needs at least two ranks");
    }
    let options = CommOptions {
        verify_shape: cli.verify_shape,
        ..CommOptions::default()
    };
    let mut comm = Comm::<f32>::with_options(group, cli.library, options)?;
    for (sender, receiver) in cli.pattern.edges(group.size()) {
        comm.add_lazy(cli.count, sender, receiver)
            .with_context(|| format!("registering edge {sender}->{receiver}"))?;
    }

    let mut out = io::stdout();
    comm.report(&mut out)?;
    let memory = registry::memory_report(group)?;
    if group.is_print_rank() {
        report::write_memory(&mut out, &memory)?;
    }

    let measurement = comm.measure(cli.warmup, cli.iterations)?;
    if group.is_print_rank() {
        report::write_measurement(&mut out, &measurement)?;
        out.flush()?;
        if let Some(path) = &cli.csv {
            let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
            let mut writer = BufWriter::new(file);
            report::write_csv(&mut writer, &measurement)?;
            writer.flush()?;
        }
    }
    Ok(())
}

#[cfg(feature = "distributed")]
fn run_mpi(cli: &Cli) -> anyhow::Result<()> {
    use std::rc::Rc;
    use xferbench::group::MpiChannel;

    let channel = MpiChannel::init()?;
    #[cfg(feature = "cuda")]
    let (device, ctx) = {
        use xferbench::ControlChannel;
        let runtime = Rc::new(xferbench::device::CudaRuntime::for_rank(channel.rank())?);
        let ctx = runtime.context().clone();
        (runtime as Rc<dyn xferbench::DeviceRuntime>, ctx)
    };
    #[cfg(not(feature = "cuda"))]
    let device: Rc<dyn xferbench::DeviceRuntime> = Rc::new(xferbench::HostRuntime::new());

    let mut group = ProcessGroup::new(Box::new(channel), device);
    #[cfg(feature = "cuda")]
    if cli.library == Library::Xccl {
        let nccl = xferbench::transport::NcclLibrary::new(&group, &ctx)?;
        group.install_collective(Rc::new(nccl))?;
    }
    let result = bench(&group, cli);
    group.finalize()?;
    result
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    #[cfg(feature = "distributed")]
    if cli.mpi {
        return run_mpi(&cli);
    }

    if cli.library == Library::Xccl {
        tracing::info!("no collective library installed; using the loopback one");
    }
    let results = LocalWorld::run(cli.ranks, |group| bench(&group, &cli))?;
    for result in results {
        result?;
    }
    Ok(())
}
