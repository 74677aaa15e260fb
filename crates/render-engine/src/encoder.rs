//! Hardware encoder detection, encoder plans, and fallback execution.
//!
//! A render runs through an ordered list of [`EncoderPlan`]s: the detected
//! hardware plan first (when preferred and available), then libx264. A
//! failed hardware attempt falls through to the next plan; the last
//! attempt's error is the one the caller sees.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kartlap_common::config::RenderDefaults;
use kartlap_common::error::{KartlapError, KartlapResult};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::ffmpeg::run_capture;

/// Default DRM render node used by VAAPI and QSV.
pub const DEFAULT_RENDER_NODE: &str = "/dev/dri/renderD128";

/// Device node present when the NVIDIA driver is loaded.
pub const NVIDIA_DEVICE_NODE: &str = "/dev/nvidia0";

const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Hardware encoding backends, in probe preference order after `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareBackend {
    None,
    Vaapi,
    Qsv,
    Nvenc,
}

impl HardwareBackend {
    /// Candidates tried by the probe, best first.
    pub const PREFERENCE: [HardwareBackend; 3] = [Self::Vaapi, Self::Qsv, Self::Nvenc];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Vaapi => "vaapi",
            Self::Qsv => "qsv",
            Self::Nvenc => "nvenc",
        }
    }

    /// H.264 encoder name as listed by `ffmpeg -encoders`.
    pub fn codec(self) -> &'static str {
        match self {
            Self::None => "libx264",
            Self::Vaapi => "h264_vaapi",
            Self::Qsv => "h264_qsv",
            Self::Nvenc => "h264_nvenc",
        }
    }

    /// Method name as listed by `ffmpeg -hwaccels`.
    fn hwaccel(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Vaapi => Some("vaapi"),
            Self::Qsv => Some("qsv"),
            Self::Nvenc => Some("cuda"),
        }
    }
}

impl std::fmt::Display for HardwareBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the probe found on this host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeDetails {
    /// Device node path -> exists.
    pub device_nodes: BTreeMap<String, bool>,
    pub hwaccels: BTreeSet<String>,
    pub encoders: BTreeSet<String>,
    pub errors: Vec<String>,
}

/// Outcome of a hardware probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareProbeResult {
    pub available: bool,
    pub backend: HardwareBackend,
    pub details: ProbeDetails,
}

impl HardwareProbeResult {
    pub fn unavailable(details: ProbeDetails) -> Self {
        Self {
            available: false,
            backend: HardwareBackend::None,
            details,
        }
    }
}

/// Quality settings shared by every plan.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderSettings {
    pub software_preset: String,
    pub software_crf: u8,
    pub hardware_quality: u8,
    pub render_node: PathBuf,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self::from(&RenderDefaults::default())
    }
}

impl From<&RenderDefaults> for EncoderSettings {
    fn from(defaults: &RenderDefaults) -> Self {
        Self {
            software_preset: defaults.software_preset.clone(),
            software_crf: defaults.software_crf,
            hardware_quality: defaults.hardware_quality,
            render_node: PathBuf::from(DEFAULT_RENDER_NODE),
        }
    }
}

/// One way of encoding the output video.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderPlan {
    pub label: String,
    pub backend: HardwareBackend,
    pub is_hardware: bool,
    pub video_codec: String,
    /// Placed before the first `-i` (device initialisation).
    pub input_options: Vec<String>,
    /// Appended to the end of the video filter chain (hardware upload).
    pub filter_suffix: Option<String>,
    pub quality_options: Vec<String>,
    pub extra_output_options: Vec<String>,
}

impl EncoderPlan {
    /// libx264 plan. Always works when ffmpeg does.
    pub fn software(settings: &EncoderSettings) -> Self {
        Self {
            label: "software".to_string(),
            backend: HardwareBackend::None,
            is_hardware: false,
            video_codec: HardwareBackend::None.codec().to_string(),
            input_options: Vec::new(),
            filter_suffix: None,
            quality_options: vec![
                "-preset".to_string(),
                settings.software_preset.clone(),
                "-crf".to_string(),
                settings.software_crf.to_string(),
            ],
            extra_output_options: vec!["-pix_fmt".to_string(), "yuv420p".to_string()],
        }
    }

    /// Plan for a hardware backend. `HardwareBackend::None` yields the software plan.
    pub fn hardware(backend: HardwareBackend, settings: &EncoderSettings) -> Self {
        let quality = settings.hardware_quality.to_string();
        let (input_options, filter_suffix, quality_options, extra_output_options) = match backend {
            HardwareBackend::None => return Self::software(settings),
            HardwareBackend::Vaapi => (
                vec![
                    "-vaapi_device".to_string(),
                    settings.render_node.display().to_string(),
                ],
                Some("format=nv12,hwupload".to_string()),
                vec!["-qp".to_string(), quality],
                Vec::new(),
            ),
            HardwareBackend::Qsv => (
                vec![
                    "-init_hw_device".to_string(),
                    "qsv=hw".to_string(),
                    "-filter_hw_device".to_string(),
                    "hw".to_string(),
                ],
                Some("format=nv12,hwupload=extra_hw_frames=64".to_string()),
                vec!["-global_quality".to_string(), quality],
                Vec::new(),
            ),
            HardwareBackend::Nvenc => (
                Vec::new(),
                None,
                vec![
                    "-preset".to_string(),
                    "p4".to_string(),
                    "-rc".to_string(),
                    "vbr".to_string(),
                    "-cq".to_string(),
                    quality,
                ],
                vec!["-pix_fmt".to_string(), "yuv420p".to_string()],
            ),
        };

        Self {
            label: backend.as_str().to_string(),
            backend,
            is_hardware: true,
            video_codec: backend.codec().to_string(),
            input_options,
            filter_suffix,
            quality_options,
            extra_output_options,
        }
    }

    /// `-c:v` plus quality and extra output options.
    pub fn output_args(&self) -> Vec<String> {
        let mut args = vec!["-c:v".to_string(), self.video_codec.clone()];
        args.extend(self.quality_options.iter().cloned());
        args.extend(self.extra_output_options.iter().cloned());
        args
    }
}

/// Ordered plans for a render: `[hardware, software]` or `[software]`.
pub fn build_encoder_plans(
    probe: &HardwareProbeResult,
    prefer_hardware: bool,
    settings: &EncoderSettings,
) -> Vec<EncoderPlan> {
    let software = EncoderPlan::software(settings);
    if !prefer_hardware || !probe.available || probe.backend == HardwareBackend::None {
        return vec![software];
    }
    vec![EncoderPlan::hardware(probe.backend, settings), software]
}

/// Run `execute` for each plan until one succeeds.
///
/// Hardware failures with a later plan available are logged and skipped.
/// Cancellation is never retried. Returns the value and the plan that
/// produced it.
pub async fn run_encoding_attempts<T, F, Fut>(
    plans: &[EncoderPlan],
    mut execute: F,
) -> KartlapResult<(T, EncoderPlan)>
where
    F: FnMut(EncoderPlan) -> Fut,
    Fut: Future<Output = KartlapResult<T>>,
{
    if plans.is_empty() {
        return Err(KartlapError::render("no encoder plans to attempt"));
    }

    for (index, plan) in plans.iter().enumerate() {
        tracing::info!(
            encoder = %plan.label,
            codec = %plan.video_codec,
            attempt = index + 1,
            attempts = plans.len(),
            "Starting encode attempt"
        );

        match execute(plan.clone()).await {
            Ok(value) => return Ok((value, plan.clone())),
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) if plan.is_hardware && index + 1 < plans.len() => {
                tracing::warn!(
                    backend = %plan.backend,
                    error = %err,
                    diagnostics = err.diagnostics().unwrap_or(""),
                    "Hardware encode failed, falling back"
                );
            }
            Err(err) => return Err(err),
        }
    }

    Err(KartlapError::render("all encoder attempts failed"))
}

/// Source of probe results. Tests inject fakes.
#[async_trait]
pub trait HardwareProber: Send + Sync {
    async fn probe(&self) -> HardwareProbeResult;
}

/// Probes the local ffmpeg install.
#[derive(Debug, Clone)]
pub struct FfmpegHardwareProber {
    pub binary: String,
    pub settings: EncoderSettings,
    pub nvidia_node: PathBuf,
}

impl Default for FfmpegHardwareProber {
    fn default() -> Self {
        Self {
            binary: "ffmpeg".to_string(),
            settings: EncoderSettings::default(),
            nvidia_node: PathBuf::from(NVIDIA_DEVICE_NODE),
        }
    }
}

impl FfmpegHardwareProber {
    fn device_node(&self, backend: HardwareBackend) -> Option<PathBuf> {
        match backend {
            HardwareBackend::None => None,
            HardwareBackend::Vaapi | HardwareBackend::Qsv => Some(self.settings.render_node.clone()),
            HardwareBackend::Nvenc => Some(self.nvidia_node.clone()),
        }
    }

    /// Encode a few synthetic frames; advertised support is not proof.
    async fn dry_run(&self, backend: HardwareBackend) -> KartlapResult<()> {
        let plan = EncoderPlan::hardware(backend, &self.settings);
        let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];
        args.extend(plan.input_options.iter().cloned());
        args.extend([
            "-f".to_string(),
            "lavfi".to_string(),
            "-i".to_string(),
            "testsrc2=size=256x144:rate=30".to_string(),
            "-frames:v".to_string(),
            "10".to_string(),
        ]);
        if let Some(suffix) = &plan.filter_suffix {
            args.push("-vf".to_string());
            args.push(suffix.clone());
        }
        args.extend(plan.output_args());
        args.extend(["-f".to_string(), "null".to_string(), "-".to_string()]);

        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        run_capture(&self.binary, &refs, PROBE_TIMEOUT).await.map(|_| ())
    }
}

#[async_trait]
impl HardwareProber for FfmpegHardwareProber {
    async fn probe(&self) -> HardwareProbeResult {
        let mut details = ProbeDetails::default();

        for backend in HardwareBackend::PREFERENCE {
            if let Some(node) = self.device_node(backend) {
                details
                    .device_nodes
                    .insert(node.display().to_string(), node.exists());
            }
        }

        match run_capture(&self.binary, &["-hide_banner", "-hwaccels"], PROBE_TIMEOUT).await {
            Ok(out) => details.hwaccels = parse_hwaccels(&out),
            Err(e) => details.errors.push(e.to_string()),
        }
        match run_capture(&self.binary, &["-hide_banner", "-encoders"], PROBE_TIMEOUT).await {
            Ok(out) => details.encoders = parse_encoders(&out),
            Err(e) => details.errors.push(e.to_string()),
        }

        for backend in HardwareBackend::PREFERENCE {
            let node_ok = self
                .device_node(backend)
                .map(|node| {
                    details
                        .device_nodes
                        .get(&node.display().to_string())
                        .copied()
                        .unwrap_or(false)
                })
                .unwrap_or(false);
            let accel_ok = backend
                .hwaccel()
                .map(|name| details.hwaccels.contains(name))
                .unwrap_or(false);
            let encoder_ok = details.encoders.contains(backend.codec());

            if !(node_ok && accel_ok && encoder_ok) {
                tracing::debug!(
                    backend = %backend,
                    node_ok,
                    accel_ok,
                    encoder_ok,
                    "Hardware backend not advertised"
                );
                continue;
            }

            match self.dry_run(backend).await {
                Ok(()) => {
                    tracing::info!(backend = %backend, "Hardware encoder available");
                    return HardwareProbeResult {
                        available: true,
                        backend,
                        details,
                    };
                }
                Err(e) => {
                    tracing::warn!(backend = %backend, error = %e, "Hardware dry-run encode failed");
                    details.errors.push(format!("{backend}: {e}"));
                }
            }
        }

        tracing::info!("No usable hardware encoder, using software");
        HardwareProbeResult::unavailable(details)
    }
}

/// Compute-once holder for the probe result.
pub struct HardwareProbeCache {
    prober: Arc<dyn HardwareProber>,
    cached: Mutex<Option<Arc<HardwareProbeResult>>>,
}

impl HardwareProbeCache {
    pub fn new(prober: Arc<dyn HardwareProber>) -> Self {
        Self {
            prober,
            cached: Mutex::new(None),
        }
    }

    /// Return the cached result, probing on first use.
    pub async fn get_or_probe(&self) -> Arc<HardwareProbeResult> {
        let mut cached = self.cached.lock().await;
        if let Some(result) = cached.as_ref() {
            return Arc::clone(result);
        }
        let result = Arc::new(self.prober.probe().await);
        *cached = Some(Arc::clone(&result));
        result
    }

    /// Probe again and replace the cached result.
    pub async fn force_reprobe(&self) -> Arc<HardwareProbeResult> {
        let mut cached = self.cached.lock().await;
        let result = Arc::new(self.prober.probe().await);
        *cached = Some(Arc::clone(&result));
        result
    }

    pub async fn reset(&self) {
        *self.cached.lock().await = None;
    }
}

impl Default for HardwareProbeCache {
    fn default() -> Self {
        Self::new(Arc::new(FfmpegHardwareProber::default()))
    }
}

/// Parse `ffmpeg -hwaccels` output.
pub fn parse_hwaccels(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("Hardware acceleration methods"))
        .skip(1)
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `ffmpeg -encoders` output into encoder names.
pub fn parse_encoders(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("------"))
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let _flags = parts.next()?;
            parts.next().map(str::to_string)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProber {
        calls: AtomicUsize,
        result: HardwareProbeResult,
    }

    #[async_trait]
    impl HardwareProber for CountingProber {
        async fn probe(&self) -> HardwareProbeResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    fn available(backend: HardwareBackend) -> HardwareProbeResult {
        HardwareProbeResult {
            available: true,
            backend,
            details: ProbeDetails::default(),
        }
    }

    #[test]
    fn test_plans_software_only_when_not_preferred() {
        let plans = build_encoder_plans(
            &available(HardwareBackend::Vaapi),
            false,
            &EncoderSettings::default(),
        );
        assert_eq!(plans.len(), 1);
        assert!(!plans[0].is_hardware);
        assert_eq!(plans[0].video_codec, "libx264");
    }

    #[test]
    fn test_plans_software_only_when_unavailable() {
        let probe = HardwareProbeResult::unavailable(ProbeDetails::default());
        let plans = build_encoder_plans(&probe, true, &EncoderSettings::default());
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].label, "software");
    }

    #[test]
    fn test_plans_hardware_then_software() {
        let plans = build_encoder_plans(
            &available(HardwareBackend::Qsv),
            true,
            &EncoderSettings::default(),
        );
        assert_eq!(plans.len(), 2);
        assert!(plans[0].is_hardware);
        assert_eq!(plans[0].video_codec, "h264_qsv");
        assert_eq!(
            plans[0].filter_suffix.as_deref(),
            Some("format=nv12,hwupload=extra_hw_frames=64")
        );
        assert!(!plans[1].is_hardware);
    }

    #[test]
    fn test_vaapi_plan_uses_render_node() {
        let plan = EncoderPlan::hardware(HardwareBackend::Vaapi, &EncoderSettings::default());
        assert_eq!(plan.input_options, vec!["-vaapi_device", DEFAULT_RENDER_NODE]);
        assert_eq!(plan.output_args()[..4], ["-c:v", "h264_vaapi", "-qp", "23"]);
    }

    #[tokio::test]
    async fn test_hardware_failure_falls_back_to_software() {
        let plans = build_encoder_plans(
            &available(HardwareBackend::Vaapi),
            true,
            &EncoderSettings::default(),
        );
        let mut seen = Vec::new();
        let (value, used) = run_encoding_attempts(&plans, |plan| {
            seen.push(plan.label.clone());
            async move {
                if plan.is_hardware {
                    Err(KartlapError::encoding_attempt("vaapi", "exit 1", "no VA display"))
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(used.label, "software");
        assert_eq!(seen, vec!["vaapi", "software"]);
    }

    #[tokio::test]
    async fn test_software_error_propagates() {
        let plans = build_encoder_plans(
            &available(HardwareBackend::Nvenc),
            true,
            &EncoderSettings::default(),
        );
        let err = run_encoding_attempts(&plans, |plan| async move {
            Err::<(), _>(KartlapError::encoding_attempt(plan.label, "exit 1", ""))
        })
        .await
        .unwrap_err();
        match err {
            KartlapError::EncodingAttempt { backend, .. } => assert_eq!(backend, "software"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_does_not_fall_back() {
        let plans = build_encoder_plans(
            &available(HardwareBackend::Vaapi),
            true,
            &EncoderSettings::default(),
        );
        let mut calls = 0;
        let err = run_encoding_attempts(&plans, |_plan| {
            calls += 1;
            async { Err::<(), _>(KartlapError::cancelled("render canceled")) }
        })
        .await
        .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_probe_cache_computes_once() {
        let prober = Arc::new(CountingProber {
            calls: AtomicUsize::new(0),
            result: available(HardwareBackend::Nvenc),
        });
        let cache = HardwareProbeCache::new(prober.clone());

        assert_eq!(cache.get_or_probe().await.backend, HardwareBackend::Nvenc);
        cache.get_or_probe().await;
        assert_eq!(prober.calls.load(Ordering::SeqCst), 1);

        cache.force_reprobe().await;
        assert_eq!(prober.calls.load(Ordering::SeqCst), 2);

        cache.reset().await;
        cache.get_or_probe().await;
        assert_eq!(prober.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_parse_hwaccels() {
        let out = "Hardware acceleration methods:\nvdpau\ncuda\nvaapi\nqsv\n\n";
        let accels = parse_hwaccels(out);
        assert_eq!(accels.len(), 4);
        assert!(accels.contains("vaapi"));
        assert!(accels.contains("cuda"));
    }

    #[test]
    fn test_parse_encoders() {
        let out = "Encoders:\n V..... = Video\n A..... = Audio\n ------\n \
                   V....D libx264              libx264 H.264 / AVC\n \
                   V....D h264_vaapi           H.264/AVC (VAAPI) (codec h264)\n \
                   A....D aac                  AAC (Advanced Audio Coding)\n";
        let encoders = parse_encoders(out);
        assert!(encoders.contains("libx264"));
        assert!(encoders.contains("h264_vaapi"));
        assert!(encoders.contains("aac"));
        assert!(!encoders.contains("="));
    }
}
