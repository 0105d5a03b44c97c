//! Human and JSON rendering for command results.

use std::path::PathBuf;

use serde::Serialize;

use revstage::{
    ActivityRecord, CloneReport, Manifest, Outcome, StageReport, StagedFileEntry, Verification,
};

/// Snapshot of a repository for `revstage status`.
#[derive(Debug, Serialize)]
pub struct StatusView {
    pub name: String,
    pub project: PathBuf,
    pub repository: PathBuf,
    pub state: String,
    pub access: Option<String>,
    pub staged_files: usize,
    pub snapshots: usize,
    pub activities: usize,
    pub last_activity: Option<ActivityRecord>,
}

pub fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn print_status(status: &StatusView) {
    println!("Repository '{}'", status.name);
    println!("  Project:     {}", status.project.display());
    println!("  Repository:  {}", status.repository.display());
    println!("  State:       {}", status.state);
    println!(
        "  Access:      {}",
        status.access.as_deref().unwrap_or("-")
    );
    println!("  Staged:      {} files, {} snapshots", status.staged_files, status.snapshots);
    println!("  Activities:  {}", status.activities);
    if let Some(last) = &status.last_activity {
        println!("  Last:        {}", last.description);
    }
}

pub fn print_manifest(manifest: &Manifest) {
    println!("{}", manifest);
    for item in manifest.items() {
        match &item.outcome {
            Outcome::Success => {}
            Outcome::Failed(reason) => {
                println!("  FAILED   {}: {}", item.source.display(), reason)
            }
            Outcome::Skipped => println!("  SKIPPED  {}", item.source.display()),
        }
    }
}

pub fn print_clone(report: &CloneReport) {
    print_manifest(&report.manifest);
    if let Some(verification) = &report.verification {
        print_verification(verification);
    }
}

pub fn print_verification(verification: &Verification) {
    println!(
        "Verified {} source files against {} repository files: {}",
        verification.source_files,
        verification.destination_files,
        if verification.is_match() { "match" } else { "MISMATCH" }
    );
    for path in &verification.mismatched {
        println!("  differs  {}", path.display());
    }
}

pub fn print_stage(report: &StageReport) {
    if report.manifest.is_empty() {
        println!("Nothing to stage");
        return;
    }
    println!("Staged through #{}", report.watermark);
    print_manifest(&report.manifest);
}

pub fn print_staged_entries(entries: &[StagedFileEntry]) {
    if entries.is_empty() {
        println!("No staged files");
        return;
    }

    println!("{:<24} {:<24} {}", "CHANGED", "STORED", "FILE");
    println!("{}", "-".repeat(80));
    for entry in entries {
        println!(
            "{:<24} {:<24} {}",
            format_ticks(entry.changed_time),
            format_ticks(entry.storage_time),
            entry.source_path.display()
        );
    }
}

pub fn print_activities(records: &[ActivityRecord]) {
    if records.is_empty() {
        println!("No recorded activity");
        return;
    }

    println!(
        "{:>6} {:<8} {:<16} {:<16} {:<24} {}",
        "ID", "TYPE", "BRANCH", "ACCOUNT", "TIME", "DESCRIPTION"
    );
    println!("{}", "-".repeat(100));
    for record in records {
        println!(
            "{:>6} {:<8} {:<16} {:<16} {:<24} {}",
            record.activity_id,
            record.activity_type,
            record.branch,
            record.account_id,
            format_ticks(record.record_time),
            record.description
        );
    }
}

fn format_ticks(ticks: revstage::Ticks) -> String {
    ticks
        .to_datetime()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ticks.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use revstage::Ticks;

    #[test]
    fn format_ticks_renders_calendar_time() {
        let ticks = Ticks::from_datetime(
            chrono::DateTime::parse_from_rfc3339("2024-05-06T07:08:09Z")
                .unwrap()
                .with_timezone(&chrono::Utc),
        );
        assert_eq!(format_ticks(ticks), "2024-05-06 07:08:09");
    }
}
