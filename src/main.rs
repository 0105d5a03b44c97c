mod cli;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use revstage::{
    ActivityRecord, ActivityRecorder, ActivityType, CloneOptions, Config, RepoState,
    RepositoryDescriptor, RepositoryManager, StagingArea, Ticks, VcsError, activity,
};

use crate::cli::{StatusView, WatchOptions, output};

#[derive(Parser)]
#[command(
    name = "revstage",
    about = "Local revision control: watch a project, stage changes, clone and log activity"
)]
struct Cli {
    /// Project (working) directory
    #[arg(long, short, default_value = ".")]
    project: PathBuf,

    /// Local repository directory
    #[arg(long, short)]
    repo: PathBuf,

    /// Repository name (defaults to the project directory name)
    #[arg(long)]
    name: Option<String>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the repository directory
    Init {
        /// Free-form description of the repository
        #[arg(long, default_value = "")]
        description: String,
    },

    /// Copy the project tree into the repository
    Clone {
        /// Compare digests of every file after copying
        #[arg(long)]
        verify: bool,

        /// Replace files that already exist in the repository
        #[arg(long)]
        overwrite: bool,
    },

    /// Compare the project tree with the repository copy
    Verify,

    /// Watch the project and stage changes until Ctrl-C
    Watch {
        /// File name filter, e.g. "*.rs"
        #[arg(long, default_value = "*")]
        filter: String,

        /// Seconds between staging runs
        #[arg(long, default_value_t = 2)]
        interval: u64,

        /// Only watch the top-level directory
        #[arg(long)]
        non_recursive: bool,
    },

    /// Inspect or reset the staging area
    Stage {
        #[command(subcommand)]
        command: StageCommand,
    },

    /// Record or inspect repository activity
    Activity {
        #[command(subcommand)]
        command: ActivityCommand,
    },

    /// Show repository status
    Status,
}

#[derive(Subcommand)]
enum StageCommand {
    /// List journaled staged files
    List,
    /// Delete every staging log row
    Clear,
    /// Delete every staged snapshot
    Purge,
}

#[derive(Subcommand)]
enum ActivityCommand {
    /// Append an activity (push, pull or commit)
    Record {
        kind: ActivityType,

        /// Activity id (defaults to one past the highest logged id)
        #[arg(long)]
        id: Option<i64>,

        #[arg(long, default_value = "")]
        branch: String,

        #[arg(long, default_value = "")]
        account: String,

        #[arg(long, default_value = "")]
        description: String,
    },
    /// List logged activities, newest first
    List,
    /// Delete every activity row
    Clear,
}

type CmdResult = Result<(), Box<dyn std::error::Error>>;

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let config = Config::from_env();

    let result = match &cli.command {
        Commands::Init { description } => cmd_init(&cli, config, description),
        Commands::Clone { verify, overwrite } => cmd_clone(
            &cli,
            config,
            CloneOptions {
                overwrite: *overwrite,
                check_integrity: *verify,
            },
        ),
        Commands::Verify => cmd_verify(&cli, config),
        Commands::Watch {
            filter,
            interval,
            non_recursive,
        } => cmd_watch(
            &cli,
            config,
            WatchOptions {
                filter: filter.clone(),
                interval: Duration::from_secs((*interval).max(1)),
                recursive: !non_recursive,
                json: cli.json,
            },
        ),
        Commands::Stage { command } => cmd_stage(&cli, config, command),
        Commands::Activity { command } => cmd_activity(&cli, config, command),
        Commands::Status => cmd_status(&cli, config),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        if let Some(VcsError::PartialFailure(manifest)) = e.downcast_ref::<VcsError>() {
            for item in manifest.failed() {
                eprintln!("  {}", item.source.display());
            }
        }
        if let Some(VcsError::InvalidState {
            actual: RepoState::Uninitialized,
            ..
        }) = e.downcast_ref::<VcsError>()
        {
            eprintln!();
            eprintln!("Hint: create the repository with: revstage --repo <dir> init");
        }
        std::process::exit(1);
    }
}

fn manager(cli: &Cli, config: Config, description: &str) -> Result<RepositoryManager, VcsError> {
    let name = cli.name.clone().unwrap_or_else(|| {
        cli.project
            .canonicalize()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "project".to_string())
    });
    let descriptor = RepositoryDescriptor::new(name, description, &cli.project, &cli.repo);
    RepositoryManager::new(descriptor, config)
}

/// Run `f` with the repository open, closing it afterwards even on failure.
fn with_open<T>(
    manager: &RepositoryManager,
    f: impl FnOnce() -> Result<T, Box<dyn std::error::Error>>,
) -> Result<T, Box<dyn std::error::Error>> {
    manager.open()?;
    let result = f();
    if let Err(e) = manager.close() {
        log::warn!("failed to close repository: {}", e);
    }
    result
}

fn cmd_init(cli: &Cli, config: Config, description: &str) -> CmdResult {
    let manager = manager(cli, config, description)?;
    manager.initialize()?;
    if cli.json {
        return output::print_json(manager.descriptor());
    }
    println!(
        "Initialized repository '{}' at {}",
        manager.descriptor().name,
        manager.paths().root().display()
    );
    Ok(())
}

fn cmd_clone(cli: &Cli, config: Config, options: CloneOptions) -> CmdResult {
    let manager = manager(cli, config, "")?;
    let report = with_open(&manager, || Ok(manager.clone_project(options)?))?;
    if cli.json {
        return output::print_json(&report);
    }
    output::print_clone(&report);
    Ok(())
}

fn cmd_verify(cli: &Cli, config: Config) -> CmdResult {
    let manager = manager(cli, config, "")?;
    let verification = manager.verify()?;
    if cli.json {
        output::print_json(&verification)?;
    } else {
        output::print_verification(&verification);
    }
    if !verification.is_match() {
        return Err("repository does not match project".into());
    }
    Ok(())
}

fn cmd_watch(cli: &Cli, config: Config, options: WatchOptions) -> CmdResult {
    let manager = manager(cli, config, "")?;
    with_open(&manager, || crate::cli::watch::run(&manager, &options))
}

fn cmd_stage(cli: &Cli, config: Config, command: &StageCommand) -> CmdResult {
    let manager = manager(cli, config, "")?;
    let monitor = std::sync::Arc::new(revstage::ChangeMonitor::configure(
        &manager.descriptor().project_directory,
        true,
    )?);
    let stage = StagingArea::for_repository(&manager, monitor, manager.log_store()?);

    match command {
        StageCommand::List => {
            let entries = stage.staged_entries()?;
            if cli.json {
                return output::print_json(&entries);
            }
            output::print_staged_entries(&entries);
        }
        StageCommand::Clear => {
            let removed = stage.clear_log()?;
            println!("Removed {} staging log rows", removed);
        }
        StageCommand::Purge => {
            let removed = with_open(&manager, || Ok(stage.purge_stage()?))?;
            println!("Deleted {} staged snapshots", removed);
        }
    }
    Ok(())
}

fn cmd_activity(cli: &Cli, config: Config, command: &ActivityCommand) -> CmdResult {
    let manager = manager(cli, config, "")?;
    let log = manager.log_store()?;

    match command {
        ActivityCommand::Record {
            kind,
            id,
            branch,
            account,
            description,
        } => {
            let id = match id {
                Some(id) => *id,
                None => activity::history(&log)?
                    .iter()
                    .map(|r| r.activity_id)
                    .max()
                    .map_or(1, |max| max + 1),
            };
            let record = ActivityRecord::new(
                Ticks::now(),
                id,
                branch,
                account,
                *kind,
                description,
                &manager.config().identity,
            );
            let recorder = ActivityRecorder::new(record, log);
            recorder.update_log()?;
            if cli.json {
                return output::print_json(recorder.record());
            }
            println!("Recorded {}", recorder.record().description);
        }
        ActivityCommand::List => {
            let records = activity::history(&log)?;
            if cli.json {
                return output::print_json(&records);
            }
            output::print_activities(&records);
        }
        ActivityCommand::Clear => {
            let removed = activity::clear(&log)?;
            println!("Removed {} activity rows", removed);
        }
    }
    Ok(())
}

fn cmd_status(cli: &Cli, config: Config) -> CmdResult {
    let manager = manager(cli, config, "")?;
    let state = manager.state();

    let mut status = StatusView {
        name: manager.descriptor().name.clone(),
        project: manager.descriptor().project_directory.clone(),
        repository: manager.paths().root().to_path_buf(),
        state: state.to_string(),
        access: None,
        staged_files: 0,
        snapshots: 0,
        activities: 0,
        last_activity: None,
    };

    if state != RepoState::Uninitialized {
        status.access = manager
            .access_state()
            .ok()
            .map(|access| format!("{:?}", access).to_lowercase());
    }

    if manager.paths().db_path().exists() {
        let log = manager.log_store()?;
        let monitor = std::sync::Arc::new(revstage::ChangeMonitor::configure(
            &manager.descriptor().project_directory,
            true,
        )?);
        let stage = StagingArea::for_repository(&manager, monitor, std::sync::Arc::clone(&log));
        status.staged_files = stage.staged_entries()?.len();
        status.snapshots = manager
            .file_store()
            .traverse(&stage.stage_dir(), false)
            .map(|files| files.len())
            .unwrap_or(0);
        let history = activity::history(&log)?;
        status.activities = history.len();
        status.last_activity = history.into_iter().next();
    }

    if cli.json {
        return output::print_json(&status);
    }
    output::print_status(&status);
    Ok(())
}
