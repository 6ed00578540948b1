#![forbid(unsafe_code)]

use std::io::BufRead;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use dropgate_lib::{
    AttachRequest, AttachmentOrchestrator, ConfigValue, HookDescriptor, SysKernel, XdpMode,
    CONFIG_KEY,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "Attach packet-filter BPF programs to kernel hooks")]
struct Cli {
    #[command(subcommand)]
    hook: HookCommand,
}

#[derive(Subcommand, Debug)]
enum HookCommand {
    /// Attach a classifier program to an interface's tc ingress hook
    Tc(TcArgs),
    /// Attach a socket program to a cgroup-v2 directory
    Cgroup(CgroupArgs),
    /// Attach a packet filter at the XDP hook
    Xdp(XdpArgs),
}

#[derive(Args, Debug)]
struct TcArgs {
    /// Interface whose ingress hook to attach to
    #[arg(short, long, default_value = "eth0")]
    iface: String,
    /// Path to the compiled BPF object file
    #[arg(short, long, default_value = "tc_ingress.o")]
    obj: PathBuf,
    /// Program symbol inside the object
    #[arg(long, default_value = "tc_ingress")]
    program: String,
    /// Config map symbol inside the object
    #[arg(long, default_value = "allowed_comm")]
    map: String,
    #[command(flatten)]
    filter: FilterArgs,
}

#[derive(Args, Debug)]
struct CgroupArgs {
    /// Path to the cgroup-v2 directory to attach to
    #[arg(short, long)]
    path: PathBuf,
    /// Path to the compiled BPF object file
    #[arg(short, long, default_value = "sock_connect.o")]
    obj: PathBuf,
    /// Program symbol inside the object
    #[arg(long, default_value = "sock_connect")]
    program: String,
    /// Config map symbol inside the object
    #[arg(long, default_value = "allowed_comm")]
    map: String,
    #[command(flatten)]
    filter: FilterArgs,
}

#[derive(Args, Debug)]
struct XdpArgs {
    /// Interface to attach to
    #[arg(short, long, default_value = "eth0")]
    iface: String,
    /// XDP attach mode
    #[arg(long, value_enum, default_value_t = Mode::Generic)]
    mode: Mode,
    /// Path to the compiled BPF object file
    #[arg(short, long, default_value = "tcp_drop.o")]
    obj: PathBuf,
    /// Program symbol inside the object
    #[arg(long, default_value = "tcp_drop")]
    program: String,
    /// Config map symbol inside the object
    #[arg(long, default_value = "config_map")]
    map: String,
    #[command(flatten)]
    filter: FilterArgs,
}

/// Exactly one of the two filter values must be given; which one the
/// artifact actually reads depends on its config map layout.
#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct FilterArgs {
    /// Allowed process name (matched against task->comm)
    #[arg(long)]
    process: Option<String>,
    /// TCP destination port to drop
    #[arg(long)]
    port: Option<u16>,
}

impl FilterArgs {
    fn value(&self) -> ConfigValue {
        match (&self.process, self.port) {
            (Some(name), None) => ConfigValue::ProcessName(name.clone()),
            (None, Some(port)) => ConfigValue::Port(port),
            // clap's arg group enforces exactly one of the two flags.
            _ => unreachable!("filter group requires exactly one value"),
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    Generic,
    Driver,
}

impl From<Mode> for XdpMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Generic => XdpMode::Generic,
            Mode::Driver => XdpMode::Driver,
        }
    }
}

fn main() {
    init_tracing();

    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        error!(%err, "attach failed");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let (obj, program, map, value, hook) = match cli.hook {
        HookCommand::Tc(args) => (
            args.obj,
            args.program,
            args.map,
            args.filter.value(),
            HookDescriptor::IngressQueueing {
                interface: args.iface,
            },
        ),
        HookCommand::Cgroup(args) => (
            args.obj,
            args.program,
            args.map,
            args.filter.value(),
            HookDescriptor::CgroupSocket { path: args.path },
        ),
        HookCommand::Xdp(args) => (
            args.obj,
            args.program,
            args.map,
            args.filter.value(),
            HookDescriptor::Xdp {
                interface: args.iface,
                mode: args.mode.into(),
            },
        ),
    };

    let bytes = std::fs::read(&obj)
        .map_err(|e| format!("failed to read BPF object {}: {e}", obj.display()))?;

    let target = hook.to_string();
    let filter = value.to_string();

    let orchestrator = AttachmentOrchestrator::new(SysKernel);
    let mut handle = orchestrator.attach(AttachRequest {
        artifact: &bytes,
        program: &program,
        region: &map,
        key: CONFIG_KEY,
        value,
        hook,
    })?;

    println!("Attached '{program}' to {target}, filtering on {filter}.");
    println!("Press Enter to detach and exit...");
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;

    handle.detach()?;
    info!("detached, exiting");
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}
