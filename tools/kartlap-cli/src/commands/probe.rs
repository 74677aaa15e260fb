//! Show hardware encoder availability.

use kartlap_render_engine::encoder::HardwareProbeCache;
use kartlap_render_engine::probe::command_exists;

pub async fn run(force: bool) -> anyhow::Result<()> {
    println!("KartLap Encoder Check");
    println!("{}", "=".repeat(50));

    for binary in ["ffmpeg", "ffprobe"] {
        if command_exists(binary) {
            println!("[OK] {binary} found");
        } else {
            println!("[MISSING] {binary} not found on PATH");
        }
    }

    let cache = HardwareProbeCache::default();
    let result = if force {
        cache.force_reprobe().await
    } else {
        cache.get_or_probe().await
    };

    println!();
    for (node, present) in &result.details.device_nodes {
        let mark = if *present { "OK" } else { "--" };
        println!("[{mark}] {node}");
    }
    println!("  hwaccels: {}", join(&result.details.hwaccels));
    println!("  encoders: {}", join(&result.details.encoders));
    for error in &result.details.errors {
        println!("[WARN] {error}");
    }

    println!();
    if result.available {
        println!(
            "Hardware encoding available: {} ({})",
            result.backend.as_str(),
            result.backend.codec()
        );
    } else {
        println!("No usable hardware encoder. Renders will use libx264.");
    }

    Ok(())
}

fn join(items: &std::collections::BTreeSet<String>) -> String {
    if items.is_empty() {
        "(none)".to_string()
    } else {
        items.iter().cloned().collect::<Vec<_>>().join(", ")
    }
}
