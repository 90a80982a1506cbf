//! Read-only view of the last sync session and the mirror contents.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use crate::config::MirrorConfig;
use crate::retention::{self, format_gb, format_tb, LocalEntry};
use crate::session_log;

#[derive(Debug)]
pub struct StatusReport {
    pub sync_log: PathBuf,
    pub last_session: Option<Vec<String>>,
    pub local_dir: PathBuf,
    /// Newest first, log files excluded.
    pub files: Vec<LocalEntry>,
    /// Every file under the mirror, logs included, as `cleanup` counts it.
    pub used: u64,
    pub capacity_limit: u64,
}

fn is_log_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "log")
}

pub fn collect(mirror: &MirrorConfig, sync_log: &Path) -> anyhow::Result<StatusReport> {
    let last_session = match std::fs::read(sync_log) {
        Ok(bytes) => {
            let contents = String::from_utf8_lossy(&bytes);
            session_log::last_completed_session(&contents)
                .map(|lines| lines.into_iter().map(str::to_string).collect())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => anyhow::bail!("Cannot read sync log {}: {}", sync_log.display(), e),
    };

    let all = retention::scan_local(&mirror.local_dir)?;
    let used = retention::total_size(&all);
    let mut files: Vec<LocalEntry> = all.into_iter().filter(|f| !is_log_file(&f.path)).collect();
    files.sort_by(|a, b| b.modified_at.cmp(&a.modified_at));

    Ok(StatusReport {
        sync_log: sync_log.to_path_buf(),
        last_session,
        local_dir: mirror.local_dir.clone(),
        files,
        used,
        capacity_limit: mirror.retention.capacity_limit,
    })
}

pub fn render(report: &StatusReport) -> String {
    let mut out = String::new();
    match &report.last_session {
        Some(lines) => {
            let _ = writeln!(out, "Last sync session ({}):", report.sync_log.display());
            for line in lines {
                let _ = writeln!(out, "  {}", line);
            }
        }
        None => {
            let _ = writeln!(
                out,
                "No completed sync session found in {}",
                report.sync_log.display()
            );
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "Mirror: {}", report.local_dir.display());
    if report.files.is_empty() {
        let _ = writeln!(out, "  (no files)");
    }
    for file in &report.files {
        let modified: DateTime<Local> = file.modified_at.into();
        let name = file
            .path
            .strip_prefix(&report.local_dir)
            .unwrap_or(&file.path);
        let _ = writeln!(
            out,
            "  {}  {:>10}  {}",
            modified.format("%Y-%m-%d %H:%M"),
            format_gb(file.size),
            name.display()
        );
    }

    let used = report.used;
    let percent = if report.capacity_limit == 0 {
        0.0
    } else {
        used as f64 * 100.0 / report.capacity_limit as f64
    };
    let _ = writeln!(
        out,
        "Usage: {} of {} ({:.1}%)",
        format_tb(used),
        format_tb(report.capacity_limit),
        percent
    );
    out
}

pub fn run(mirror: &MirrorConfig, sync_log: &Path) -> anyhow::Result<()> {
    let report = collect(mirror, sync_log)?;
    print!("{}", render(&report));
    Ok(())
}
