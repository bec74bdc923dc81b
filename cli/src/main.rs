//! fleetlab CLI: launch experiment machines and watch them work.
//!
//! # Usage
//!
//! ```text
//! fleetlab launch "python train.py" --repeats 6 --parallel 2
//! fleetlab show-script "python train.py" --repeats 6 --parallel 2
//! fleetlab monitor
//! fleetlab tail otter --run 3
//! fleetlab list
//! fleetlab kill otter
//! ```
//!
//! Exit codes: 0 ok, 1 local failure, 2 configuration, 3 control plane,
//! 4 remote execution.

mod logging;
mod render;
mod settings;

use std::io::Write;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use fleetlab_core::control::aws::AwsCliControlPlane;
use fleetlab_core::control::ControlPlane;
use fleetlab_core::error::{categorize, ErrorCategory, FleetError, SessionError};
use fleetlab_core::infrastructure::{CommandRunner, ProcessRunner};
use fleetlab_core::lifecycle::{LifecycleManager, MachineSpec, RsyncPackager};
use fleetlab_core::logsync::StreamKind;
use fleetlab_core::monitor::probe::follow_command;
use fleetlab_core::monitor::FleetMonitor;
use fleetlab_core::plan::{self, ExecutionPlan, RemoteLayout};
use fleetlab_core::remote::{Session, SshTransport, StreamEnd, Transport};
use fleetlab_core::types::config::Settings;

use logging::Verbosity;
use settings::CloudOverrides;


#[derive(Parser)]
#[command(
    name = "fleetlab",
    version,
    about = "Launch short-lived experiment machines and monitor them"
)]
struct Cli {
    /// Settings file (default: $FLEETLAB_CONFIG or ~/.config/fleetlab/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[arg(short, long, global = true)]
    quiet: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch one machine running COMMAND `repeats` times
    Launch {
        command: String,
        #[arg(long, default_value_t = 1)]
        repeats: u32,
        #[arg(long = "parallel", default_value_t = 1)]
        parallel: u32,
        #[arg(long)]
        instance_type: Option<String>,
        #[arg(long)]
        image: Option<String>,
        #[arg(long)]
        owner: Option<String>,
        #[arg(long)]
        group: Option<String>,
    },
    /// Print the script a launch would run, without launching
    ShowScript {
        command: String,
        #[arg(long, default_value_t = 1)]
        repeats: u32,
        #[arg(long = "parallel", default_value_t = 1)]
        parallel: u32,
    },
    /// Watch every managed machine and mirror its logs
    Monitor {
        /// Seconds between polls
        #[arg(long)]
        interval: Option<u64>,
        /// Poll once, print, and exit
        #[arg(long)]
        once: bool,
        /// Print snapshots as JSON (with --once)
        #[arg(long)]
        json: bool,
    },
    /// Follow a machine's setup or run output live
    Tail {
        name: String,
        #[arg(long, conflicts_with_all = ["slot", "run"])]
        setup: bool,
        #[arg(long)]
        slot: Option<u32>,
        #[arg(long)]
        run: Option<u32>,
        /// Lines of history to show first
        #[arg(long, default_value_t = 50)]
        lines: u32,
    },
    /// List managed machines
    List,
    /// Terminate a machine by name
    Kill { name: String },
}


fn main() {
    let cli = Cli::parse();
    logging::init(Verbosity::from_flags(cli.verbose, cli.quiet));

    if let Err(err) = run(cli) {
        eprintln!("fleetlab: {:#}", err);
        process::exit(exit_code(&err));
    }
}

/// Exit code for the first categorised error in the chain.
fn exit_code(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(categorize)
        .unwrap_or(ErrorCategory::Local)
        .exit_code()
}

/// Production adapters shared by every command.
struct Backends {
    runner: Arc<dyn CommandRunner>,
    control: Arc<dyn ControlPlane>,
    transport: Arc<dyn Transport>,
}

impl Backends {
    fn new(settings: &Settings) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner);
        Backends {
            control: Arc::new(AwsCliControlPlane::new(
                Arc::clone(&runner),
                &settings.cloud.region,
            )),
            transport: Arc::new(SshTransport::new(settings.ssh.clone(), Arc::clone(&runner))),
            runner,
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut settings = settings::load(cli.config.as_deref()).context("loading settings")?;

    match cli.command {
        Commands::Launch {
            command,
            repeats,
            parallel,
            instance_type,
            image,
            owner,
            group,
        } => {
            CloudOverrides {
                owner,
                group,
                instance_type,
                image,
            }
            .apply(&mut settings);
            launch(&settings, &command, repeats, parallel)
        }
        Commands::ShowScript {
            command,
            repeats,
            parallel,
        } => {
            let plan = build_plan(&settings, &command, repeats, parallel)?;
            let opts = plan::ScriptOptions::from(&settings.launch_config());
            print!("{}", plan::render_script(&plan, &opts));
            Ok(())
        }
        Commands::Monitor {
            interval,
            once,
            json,
        } => monitor(&settings, interval, once, json),
        Commands::Tail {
            name,
            setup,
            slot,
            run,
            lines,
        } => tail(&settings, &name, setup, slot, run, lines),
        Commands::List => {
            let backends = Backends::new(&settings);
            let instances = backends
                .control
                .list_managed(&settings::fleet_filter(&settings))
                .context("listing machines")?;
            print!("{}", render::instance_table(&instances));
            Ok(())
        }
        Commands::Kill { name } => {
            let backends = Backends::new(&settings);
            let info = backends
                .control
                .find_by_name(&settings::fleet_filter(&settings), &name)?
                .ok_or_else(|| FleetError::UnknownMachine(name.clone()))?;
            backends
                .control
                .terminate(&info.instance_id)
                .with_context(|| format!("terminating {}", name))?;
            println!("terminating {} ({})", name, info.instance_id);
            Ok(())
        }
    }
}

fn build_plan(settings: &Settings, command: &str, repeats: u32, parallel: u32) -> Result<ExecutionPlan> {
    let plan = plan::build(command, repeats, parallel).map_err(FleetError::from)?;
    Ok(plan.with_setup(&settings.launch.setup_command))
}

fn launch(settings: &Settings, command: &str, repeats: u32, parallel: u32) -> Result<()> {
    settings.validate_for_launch().map_err(FleetError::from)?;
    let plan = build_plan(settings, command, repeats, parallel)?;

    let backends = Backends::new(settings);
    let packager = RsyncPackager::new(
        settings.ssh.clone(),
        settings.package.clone(),
        Arc::clone(&backends.runner),
    );
    let manager = LifecycleManager::new(
        backends.control,
        backends.transport,
        Arc::new(packager),
        settings.launch_config(),
    );
    let machine = manager
        .launch(&plan, &MachineSpec::from_cloud(&settings.cloud))
        .map_err(FleetError::from)
        .context("launch failed")?;

    println!(
        "{} ({}) is running setup at {}; follow it with `fleetlab monitor`",
        machine.name,
        machine.instance_id,
        machine.address.as_deref().unwrap_or("?")
    );
    Ok(())
}

fn monitor(settings: &Settings, interval: Option<u64>, once: bool, json: bool) -> Result<()> {
    let mut config = settings.monitor_config();
    if let Some(secs) = interval {
        config.poll_interval_ms = secs.saturating_mul(1000);
    }
    let backends = Backends::new(settings);
    let mut fleet = FleetMonitor::new(
        backends.control,
        backends.transport,
        settings::fleet_filter(settings),
        config,
    )
    .prefer_public_address(settings.cloud.use_public_address);

    if once {
        fleet.discover().context("discovering machines")?;
        let reports = fleet.poll_cycle();
        if json {
            println!("{}", serde_json::to_string_pretty(&fleet.snapshots())?);
        } else {
            print!("{}", render::fleet_table(&fleet.snapshots()));
            eprint!("{}", render::cycle_errors(&reports));
        }
        return Ok(());
    }

    fleet.run(|snapshots, reports| {
        // Redrawn after every machine's poll.
        print!("\x1b[2J\x1b[H{}", render::fleet_table(snapshots));
        if let Err(e) = std::io::stdout().flush() {
            tracing::warn!(error = %e, "cannot flush monitor table");
        }
        eprint!("{}", render::cycle_errors(reports));
    });
    Ok(())
}

fn tail(
    settings: &Settings,
    name: &str,
    setup: bool,
    slot: Option<u32>,
    run: Option<u32>,
    lines: u32,
) -> Result<()> {
    let backends = Backends::new(settings);
    let info = backends
        .control
        .find_by_name(&settings::fleet_filter(settings), name)?
        .ok_or_else(|| FleetError::UnknownMachine(name.to_string()))?;
    let host = match info.address(settings.cloud.use_public_address) {
        Some(host) => host.to_string(),
        None => bail!("{} has no address yet", name),
    };

    let stream = if setup {
        StreamKind::Setup
    } else {
        let run = run.unwrap_or(0);
        let slot = match slot {
            Some(slot) => slot,
            None => match ExecutionPlan::from_tags(&info.tags).and_then(|p| p.slot_of(run)) {
                Some(slot) => slot,
                None => bail!("cannot tell which slot runs {} on {}; pass --slot", run, name),
            },
        };
        StreamKind::Run { slot, run }
    };

    let layout = RemoteLayout::new(settings.workdir());
    let session = Session::open_with_retry(backends.transport, &host, &settings.monitor.connect_retry)
        .map_err(FleetError::from)?;
    let mut handle = session
        .run(&follow_command(&layout, stream, lines))
        .map_err(FleetError::from)?;

    let mut stdout = std::io::stdout().lock();
    for line in handle.by_ref() {
        stdout.write_all(&line.0)?;
        stdout.flush()?;
    }
    match handle.finish() {
        StreamEnd::Exited(0) => Ok(()),
        StreamEnd::Exited(code) => Err(FleetError::RemoteCommand { host, code }.into()),
        StreamEnd::SessionLost(reason) => {
            Err(FleetError::from(SessionError::SessionLost { host, reason }).into())
        }
        StreamEnd::HostUnreachable(reason) => {
            Err(FleetError::from(SessionError::HostUnreachable { host, reason }).into())
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use fleetlab_core::error::{ControlPlaneError, PlanError};

    #[test]
    fn parses_launch_flags() {
        let cli = Cli::try_parse_from([
            "fleetlab", "launch", "python train.py", "--repeats", "3", "--parallel", "2", "--image", "ami-1",
        ])
        .unwrap();
        match cli.command {
            Commands::Launch {
                command,
                repeats,
                parallel,
                image,
                ..
            } => {
                assert_eq!(command, "python train.py");
                assert_eq!((repeats, parallel), (3, 2));
                assert_eq!(image.as_deref(), Some("ami-1"));
            }
            _ => panic!("expected launch"),
        }
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["fleetlab", "list", "-v", "--config", "/tmp/c.yaml"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.yaml")));
    }

    #[test]
    fn tail_setup_conflicts_with_run() {
        assert!(Cli::try_parse_from(["fleetlab", "tail", "otter", "--setup", "--run", "1"]).is_err());
        assert!(Cli::try_parse_from(["fleetlab", "tail", "otter", "--run", "1"]).is_ok());
    }

    #[test]
    fn exit_codes_follow_error_category() {
        let plan_err = anyhow::Error::from(FleetError::from(PlanError::InvalidPlan {
            reason: "parallelism 5 exceeds repeats 3".into(),
        }));
        assert_eq!(exit_code(&plan_err), 2);

        let cp = anyhow::Error::from(ControlPlaneError::Api {
            operation: "run-instances".into(),
            message: "throttled".into(),
        })
        .context("launch failed");
        assert_eq!(exit_code(&cp), 3);

        let remote = anyhow::Error::from(FleetError::RemoteCommand {
            host: "h".into(),
            code: 1,
        });
        assert_eq!(exit_code(&remote), 4);

        assert_eq!(exit_code(&anyhow::anyhow!("disk full")), 1);
    }

    #[test]
    fn invalid_plan_fails_before_anything_remote() {
        let err = build_plan(&Settings::default(), "echo hi", 3, 5).unwrap_err();
        assert_eq!(exit_code(&err), 2);
    }
}
