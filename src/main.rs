use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::error::ErrorKind;
use clap::{ArgGroup, CommandFactory, Parser};
use tracing::Level;
use tracing_subscriber::EnvFilter;

use marple::collect::mallocstacks::MallocStacks;
use marple::collect::memleak::{Memleak, MemleakOptions};
use marple::collect::smem::{MemoryGraph, MemoryGraphOptions, MemoryMode};
use marple::collect::stacks::{StackTrace, StackTraceOptions};
use marple::collect::tcptracer::{TcpTracer, TcpTracerOptions};
use marple::collect::{CollectContext, Collector, DiskLatency, SchedulingEvents};
use marple::cpel::CpelWriter;
use marple::output::{export, treemap, DataType, ExportHeader, ExportRecord, JsonLinesOutput};
use marple::{CancelToken, CollectionResult, Config, DataOptions, StackDatum, Supervisor};

const DEFAULT_CONFIG: &str = "/etc/marple/config.json";

#[derive(Debug, Parser)]
#[command(version, about = "Collect performance data with Linux tracing tools")]
#[command(group(
    ArgGroup::new("collector")
        .required(true)
        .args(["cpu", "disk", "ipc", "mem", "memgraph", "stack", "memleak"])
))]
struct Command {
    /// CPU scheduling events
    #[arg(short, long)]
    cpu: bool,
    /// Disk I/O latency
    #[arg(short, long)]
    disk: bool,
    /// TCP connections between local processes
    #[arg(short = 'p', long)]
    ipc: bool,
    /// Stacks of memory allocations
    #[arg(short, long)]
    mem: bool,
    /// Memory usage per process over time
    #[arg(short = 'g', long)]
    memgraph: bool,
    /// Sampled call stacks
    #[arg(short, long)]
    stack: bool,
    /// Stacks of outstanding allocations
    #[arg(short = 'x', long)]
    memleak: bool,

    /// Output file, a timestamped name in the current directory by default
    #[arg(short, long)]
    outfile: Option<PathBuf>,
    /// Collection time in seconds
    #[arg(short, long)]
    time: Option<u64>,
    /// Overwrite the output file if it exists
    #[arg(short, long)]
    force: bool,
    /// Write scheduling events as a CPEL trace
    #[arg(long)]
    cpel: bool,
    /// Also write stacks as treemap rows to this file
    #[arg(long)]
    treemap: Option<PathBuf>,
    /// Only keep connections in this network namespace
    #[arg(long)]
    net_ns: Option<u64>,
    /// How processes are labelled in the memory graph: name (default), pid or command
    #[arg(long)]
    memgraph_mode: Option<MemoryMode>,
    /// Sampling frequency for stacks, overrides the config
    #[arg(short = 'F', long)]
    frequency: Option<u32>,
    #[arg(long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Command {
    /// Reject options given without the collector they apply to.
    fn check_collector_options(&self) -> Result<(), clap::Error> {
        let stacks = self.mem || self.stack || self.memleak;
        let dependent = [
            ("--cpel", self.cpel, "--cpu", self.cpu),
            ("--net-ns", self.net_ns.is_some(), "--ipc", self.ipc),
            ("--memgraph-mode", self.memgraph_mode.is_some(), "--memgraph", self.memgraph),
            ("--frequency", self.frequency.is_some(), "--stack", self.stack),
            ("--treemap", self.treemap.is_some(), "--mem, --stack or --memleak", stacks),
        ];
        for (option, given, collector, selected) in dependent {
            if given && !selected {
                return Err(Command::command().error(
                    ErrorKind::MissingRequiredArgument,
                    format!("{} can only be used with {}", option, collector),
                ));
            }
        }
        Ok(())
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let filter = EnvFilter::from_default_env().add_directive(format!("marple={}", level).parse().unwrap());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn output_path(opts: &Command) -> Result<PathBuf> {
    let path = match &opts.outfile {
        Some(path) => path.clone(),
        None => {
            let ext = if opts.cpel { "cpel" } else { "marple" };
            PathBuf::from(format!("{}.{}", Local::now().format("%Y-%m-%d_%H-%M-%S"), ext))
        }
    };
    if path.exists() && !opts.force {
        bail!("{} already exists, pass --force to overwrite it", path.display());
    }
    Ok(path)
}

/// Write a collection result as text; fails if the collection did.
fn store<R: ExportRecord>(
    result: CollectionResult<R>,
    datatype: DataType,
    interface: &str,
    data_options: Option<DataOptions>,
    path: &Path,
) -> Result<()> {
    let mut header = ExportHeader::new(datatype, interface)
        .with_window(result.window_start, result.window_end)
        .with_succeeded(result.succeeded);
    if let Some(options) = data_options {
        header = header.with_data_options(options);
    }
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut out = JsonLinesOutput::new(BufWriter::new(file));
    let written = export(&mut out, &header, result.records)?;
    if !header.succeeded {
        bail!("{} collection failed", interface);
    }
    println!("Wrote {} records to {}", written, path.display());
    Ok(())
}

fn store_stacks(
    result: CollectionResult<StackDatum>,
    interface: &str,
    path: &Path,
    treemap_path: Option<&Path>,
) -> Result<()> {
    let CollectionResult {
        records,
        window_start,
        window_end,
        succeeded,
    } = result;
    let stacks: Vec<StackDatum> = records.collect();
    if let Some(treemap_path) = treemap_path.filter(|_| succeeded) {
        let file = File::create(treemap_path)
            .with_context(|| format!("Failed to create {}", treemap_path.display()))?;
        let rows = treemap::write_treemap(BufWriter::new(file), &stacks)?;
        println!("Wrote {} treemap rows to {}", rows, treemap_path.display());
    }
    let result = CollectionResult {
        records: Box::new(stacks.into_iter()),
        window_start,
        window_end,
        succeeded,
    };
    store(result, DataType::StackData, interface, None, path)
}

fn run(opts: Command) -> Result<()> {
    let config = Config::load(&opts.config)?;
    let duration = opts.time.map(Duration::from_secs).unwrap_or_else(|| config.duration());
    if duration.is_zero() {
        bail!("collection time must be at least one second");
    }
    let path = output_path(&opts)?;

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || cancel.cancel()).context("Failed to set Ctrl-C handler")?;
    }
    let ctx = CollectContext::new(duration)
        .with_supervisor(Supervisor::new(config.grace_period(), cancel))
        .with_tools(config.tools.clone());

    println!("Collecting for {} seconds", duration.as_secs());
    if opts.cpu {
        let result = SchedulingEvents::new().collect(&ctx)?;
        if opts.cpel {
            if !result.succeeded {
                bail!("Scheduling Events collection failed");
            }
            let summary = CpelWriter::new()
                .write(result.records, &path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!(
                "Wrote {} events on {} tracks to {}",
                summary.events,
                summary.tracks,
                path.display()
            );
        } else {
            store(result, DataType::EventData, "Scheduling Events", None, &path)?;
        }
    } else if opts.disk {
        let result = DiskLatency::new().collect(&ctx)?;
        store(
            result,
            DataType::Datapoint,
            "Disk Latency/Time",
            Some(DiskLatency::data_options()),
            &path,
        )?;
    } else if opts.ipc {
        let tracer = TcpTracer::new(TcpTracerOptions { net_ns: opts.net_ns });
        store(tracer.collect(&ctx)?, DataType::EventData, "IPC Events", None, &path)?;
    } else if opts.mem {
        let result = MallocStacks::new().collect(&ctx)?;
        store_stacks(result, "Malloc Stacks", &path, opts.treemap.as_deref())?;
    } else if opts.memgraph {
        let graph = MemoryGraph::new(MemoryGraphOptions {
            mode: opts.memgraph_mode.unwrap_or_default(),
            refresh: config.memgraph_refresh(),
        });
        store(
            graph.collect(&ctx)?,
            DataType::Datapoint,
            "Memory/Time",
            Some(MemoryGraph::data_options()),
            &path,
        )?;
    } else if opts.stack {
        let tracer = StackTrace::new(StackTraceOptions {
            frequency: opts.frequency.unwrap_or(config.frequency_hz),
            system_wide: config.system_wide,
        });
        store_stacks(tracer.collect(&ctx)?, "Call Stacks", &path, opts.treemap.as_deref())?;
    } else if opts.memleak {
        let memleak = Memleak::new(MemleakOptions {
            top_stacks: config.memleak_top_stacks,
        });
        store_stacks(memleak.collect(&ctx)?, "Memory leaks", &path, opts.treemap.as_deref())?;
    }

    println!("Done.");
    Ok(())
}

fn main() -> Result<()> {
    let opts = Command::parse();
    if let Err(err) = opts.check_collector_options() {
        err.exit();
    }
    init_logging(opts.verbose);

    run(opts)
}
