//! Sweep stale files from the temp roots.

use std::sync::Arc;

use kartlap_common::config::AppConfig;
use kartlap_render_service::cleanup::StaticActivePaths;
use kartlap_render_service::schedule::CleanupScheduler;

pub async fn run(config: &AppConfig, max_age_hours: Option<u64>) -> anyhow::Result<()> {
    let max_age = match max_age_hours {
        Some(hours) => std::time::Duration::from_secs(hours.saturating_mul(3600)),
        None => config.retention.max_age(),
    };

    println!("Cleaning temp roots (max age {}h):", max_age.as_secs() / 3600);
    for root in &config.temp_roots {
        println!("  {}", root.display());
    }

    let scheduler = CleanupScheduler::new(
        config.temp_roots.clone(),
        max_age,
        config.retention.schedule_path.clone(),
        Arc::new(StaticActivePaths::default()),
    )?;
    let result = scheduler.run_now().await?;

    match result.report {
        Some(report) => {
            println!(
                "\nRemoved {} file(s) and {} dir(s), freed {} bytes",
                report.files_removed, report.dirs_removed, report.bytes_freed
            );
            if !report.errors.is_empty() {
                println!("{} entr(ies) could not be removed:", report.errors.len());
                for error in &report.errors {
                    println!("  - {error}");
                }
            }
        }
        None => println!("\nA cleanup is already running."),
    }

    let schedule = scheduler.schedule();
    if schedule.enabled() {
        if let Some(next) = schedule.next_run_at(&chrono::Local::now()) {
            println!("Next scheduled run: {next}");
        }
    }

    Ok(())
}
