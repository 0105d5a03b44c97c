//! `revstage watch`: arm the monitor and stage changes until interrupted.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick};

use revstage::{CancelToken, ChangeMonitor, RepositoryManager, StagingArea, VcsError};

use super::output;

pub struct WatchOptions {
    pub filter: String,
    pub interval: Duration,
    pub recursive: bool,
    pub json: bool,
}

/// Runs until Ctrl-C. The repository must already be open.
pub fn run(
    manager: &RepositoryManager,
    options: &WatchOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    let project = &manager.descriptor().project_directory;
    let repo = manager.paths().root();
    if let (Ok(project), Ok(repo)) = (project.canonicalize(), repo.canonicalize()) {
        // Snapshots written into a watched tree would be staged again forever.
        if repo.starts_with(&project) {
            return Err(format!(
                "repository {} is inside the watched project {}",
                repo.display(),
                project.display()
            )
            .into());
        }
    }

    let config = manager.config();
    let monitor = Arc::new(ChangeMonitor::configure_with(
        &manager.descriptor().project_directory,
        options.recursive,
        config.rename_noise,
        config.coalesce_window,
    )?);
    let stage = StagingArea::for_repository(manager, Arc::clone(&monitor), manager.log_store()?);

    let cancel = CancelToken::new();
    let (stop_tx, stop_rx) = bounded::<()>(1);
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            cancel.cancel();
            let _ = stop_tx.try_send(());
        })?;
    }

    monitor.arm(&options.filter)?;
    log::info!(
        "watching {} (filter {:?}, every {:?})",
        monitor.directory().display(),
        options.filter,
        options.interval
    );
    if !options.json {
        println!(
            "Watching {} -> {}. Press Ctrl-C to stop.",
            monitor.directory().display(),
            stage.stage_dir().display()
        );
    }

    let ticker = tick(options.interval);
    let result = loop {
        select! {
            recv(stop_rx) -> _ => break Ok(()),
            recv(ticker) -> _ => {
                if let Err(e) = flush(&stage, &cancel, options.json) {
                    break Err(e);
                }
            }
        }
    };

    monitor.disarm();
    result
}

/// Stage pending records, journal them and drop what was drained.
fn flush(
    stage: &StagingArea,
    cancel: &CancelToken,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if !stage.has_changed()? {
        return Ok(());
    }

    match stage.update_stage_with_cancel(cancel) {
        Ok(report) => {
            if json {
                output::print_json(&report)?;
            } else {
                output::print_stage(&report);
            }
        }
        Err(VcsError::PartialFailure(manifest)) => {
            log::warn!("staging incomplete: {}", manifest);
            if json {
                output::print_json(&manifest)?;
            } else {
                output::print_manifest(&manifest);
            }
        }
        Err(e) => return Err(e.into()),
    }

    if let Err(e) = stage.update_log() {
        match e {
            VcsError::PartialFailure(manifest) => log::warn!("journal incomplete: {}", manifest),
            other => return Err(other.into()),
        }
    }
    stage.clear_monitor_records();
    Ok(())
}
