//! Show temp root usage.

use kartlap_common::config::AppConfig;
use kartlap_render_service::cleanup::temp_directory_stats;

pub fn run(config: &AppConfig) -> anyhow::Result<()> {
    let stats = temp_directory_stats(&config.temp_roots);
    let json = serde_json::to_string_pretty(&stats)?;
    println!("{json}");
    Ok(())
}
