use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use dockmon_core::config::Config;
use dockmon_core::engine::{RestoreOutcome, RestoreRequest};
use dockmon_core::schedule_store::{Schedule, ScheduleType};
use dockmon_core::service::Service;
use dockmon_core::supervisor::SubmitOutcome;
use tracing::{Level, info};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// data root override; defaults to $DOCKMON_DATA_ROOT or a platform data dir
    #[arg(global = true, long)]
    data_root: Option<PathBuf>,

    #[arg(global = true, long, default_value = "false")]
    verbose: bool,
}

#[derive(Clone, ValueEnum, Debug)]
enum Shell {
    Bash,
    Fish,
    Zsh,
    PowerShell,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a container for backup.
    Backup {
        container: String,
        /// Queue instead of reporting busy if the slot is occupied.
        #[arg(long)]
        queue: bool,
    },

    /// Poll a previously submitted backup's progress.
    Progress { progress_id: String },

    /// Print the Supervisor's current slot/queue state.
    Status,

    /// Restore a container from an archive.
    Restore {
        archive: PathBuf,
        /// Restore under a different container name.
        #[arg(long)]
        name: Option<String>,
        /// Force volume overwrite behaviour instead of conflict detection.
        #[arg(long)]
        overwrite_volumes: Option<bool>,
        /// host_port=container_port pairs applied to the reconstructed run spec.
        #[arg(long = "port", value_parser = parse_port_override)]
        ports: Vec<(String, String)>,
    },

    /// List archives in the backups directory.
    List,

    /// Delete an archive and its sidecar by filename.
    Delete { filename: String },

    /// Print the current schedule as TOML.
    ScheduleGet,

    /// Replace the schedule.
    ScheduleSet {
        #[arg(value_enum)]
        schedule_type: ScheduleTypeArg,
        hour: u8,
        /// Sunday-origin weekday (0..6); required for `weekly`.
        day_of_week: Option<u8>,
        #[arg(long, default_value = "7")]
        lifecycle: u32,
        /// Container ids/names the schedule applies to.
        #[arg(long = "container")]
        containers: Vec<String>,
    },

    /// Run the scheduler loop and block until interrupted.
    Serve,

    /// Generate a shell completion script.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Clone, ValueEnum, Debug)]
enum ScheduleTypeArg {
    Daily,
    Weekly,
}

fn parse_port_override(s: &str) -> Result<(String, String), String> {
    let (host, container) = s
        .split_once('=')
        .ok_or_else(|| "expected host_port=container_port".to_string())?;
    Ok((host.to_string(), container.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    dockmon_core::init_log(if cli.verbose { Level::DEBUG } else { Level::INFO });

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        let name = cmd.get_name().to_string();
        let shell = match shell {
            Shell::Bash => clap_complete::aot::Shell::Bash,
            Shell::Fish => clap_complete::aot::Shell::Fish,
            Shell::Zsh => clap_complete::aot::Shell::Zsh,
            Shell::PowerShell => clap_complete::aot::Shell::PowerShell,
        };
        clap_complete::generate(shell, &mut cmd, &name, &mut io::stdout());
        return Ok(());
    }

    let mut config = Config::default();
    if let Some(data_root) = cli.data_root.or_else(|| std::env::var("DOCKMON_DATA_ROOT").ok().map(PathBuf::from)) {
        config.data_root = data_root;
    } else {
        config.data_root = dockmon_core::config::discover_default_data_root();
    }

    let own_container_id = std::env::var("DOCKMON_CONTAINER_ID").ok();
    let service = Service::boot(config, own_container_id, None)
        .await
        .context("failed to start service")?;

    match cli.command {
        Commands::Backup { container, queue } => match service.submit_backup(&container, queue) {
            SubmitOutcome::Accepted { progress_id, queued } => {
                println!("{progress_id}");
                if queued {
                    info!(progress_id, "backup queued");
                } else {
                    info!(progress_id, "backup started");
                }
            }
            SubmitOutcome::Busy { current } => {
                eprintln!("supervisor is busy: {current:?}");
                std::process::exit(1);
            }
        },

        Commands::Progress { progress_id } => match service.progress(&progress_id) {
            Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
            None => {
                eprintln!("no such progress id");
                std::process::exit(1);
            }
        },

        Commands::Status => {
            let status = service.status();
            println!(
                "slot_held={} queue_depth={} current={:?}",
                status.slot_held, status.queue_depth, status.current_operation
            );
        }

        Commands::Restore {
            archive,
            name,
            overwrite_volumes,
            ports,
        } => {
            let port_overrides: HashMap<String, String> = ports.into_iter().collect();
            let outcome = service
                .restore(RestoreRequest {
                    archive_path: archive,
                    new_name: name,
                    overwrite_volumes,
                    port_overrides,
                })
                .await?;
            match outcome {
                RestoreOutcome::Restored { container_id, stack_warning } => {
                    println!("restored as {container_id}");
                    if let Some(warning) = stack_warning {
                        eprintln!("warning: {warning}");
                    }
                }
                RestoreOutcome::VolumeConflict { volumes } => {
                    eprintln!("volumes already exist, re-run with --overwrite-volumes: {volumes:?}");
                    std::process::exit(1);
                }
            }
        }

        Commands::List => {
            for entry in service.list_backups().await? {
                println!(
                    "{}\t{}",
                    entry.filename,
                    entry.server_name.unwrap_or_else(|| "?".to_string())
                );
            }
        }

        Commands::Delete { filename } => {
            service.delete_backup(&filename).await?;
        }

        Commands::ScheduleGet => {
            let schedule = service.schedule().await;
            println!("{}", toml::to_string_pretty(&schedule)?);
        }

        Commands::ScheduleSet {
            schedule_type,
            hour,
            day_of_week,
            lifecycle,
            containers,
        } => {
            let schedule = Schedule {
                schedule_type: match schedule_type {
                    ScheduleTypeArg::Daily => ScheduleType::Daily,
                    ScheduleTypeArg::Weekly => ScheduleType::Weekly,
                },
                hour,
                day_of_week,
                lifecycle,
                selected_containers: containers,
                last_run: None,
                next_run: None,
                updated_at: chrono::Utc::now(),
            };
            service.update_schedule(schedule).await?;
        }

        Commands::Serve => {
            service.spawn_scheduler();
            info!("serving; press ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            service.shutdown();
        }

        Commands::Completions { .. } => unreachable!("handled above"),
    }

    Ok(())
}
