//! drawtext filter graph for the lap panel.
//!
//! Every node is gated with an `enable` expression on ffmpeg's frame time
//! `t` (video seconds), so the encoder decides per frame which lap text is
//! visible. Lap boundaries are converted to video time once, here.

use std::path::Path;

use kartlap_common::clock::{format_delta, format_lap_time, video_time};
use kartlap_common::error::KartlapResult;
use kartlap_session_model::lap::Lap;
use kartlap_session_model::timeline::SessionTimeline;

use super::{ffmpeg_color, headline_text, OverlayContext, OverlayOptions, OverlayStyle};
use crate::encoder::{run_encoding_attempts, EncoderPlan};
use crate::export::{build_encode_args, OverlaySource};
use crate::ffmpeg::FfmpegProcess;

/// Label the graph body ends in. The encoder plan's suffix is chained after it.
pub const OVERLAY_LABEL: &str = "ov";

/// Approximate advance of one glyph relative to the font size.
const GLYPH_WIDTH_RATIO: f64 = 0.62;

/// Build the graph body from `[0:v]` to `[ov]`.
pub fn build_overlay_filter_graph(
    timeline: &SessionTimeline,
    start_offset_secs: f64,
    style: &OverlayStyle,
    options: &OverlayOptions,
    font_path: Option<&Path>,
) -> String {
    if timeline.is_empty() {
        return format!("[0:v]null[{OVERLAY_LABEL}]");
    }

    let font = font_path
        .map(|path| format!("fontfile='{}':", escape_text(&path.display().to_string())))
        .unwrap_or_default();
    let total = timeline.len();
    let stats = timeline.stats();
    let session_start = video_time(0.0, start_offset_secs);
    let session_end = video_time(timeline.total_secs(), start_offset_secs);

    let x = style.margin + style.padding;
    let mut lines = 1;
    let elapsed_y = style.margin + style.padding + style.line_height();
    if options.show_current_lap_time {
        lines += 1;
    }
    let delta_y = style.margin + style.padding + style.line_height() * lines;
    if options.show_lap_deltas {
        lines += 1;
    }

    let mut nodes = vec![format!(
        "drawbox=x={m}:y={m}:w={w}:h={h}:color={color}:t=fill:enable='between(t,{a:.3},{b:.3})'",
        m = style.margin,
        w = panel_width(timeline, style, options),
        h = style.padding * 2 + style.line_height() * lines - style.line_spacing,
        color = ffmpeg_color(style.box_color),
        a = session_start,
        b = session_end,
    )];

    let laps = timeline.laps();
    for (index, lap) in laps.iter().enumerate() {
        let is_last_lap = index + 1 == laps.len();
        let lap_start = video_time(lap.start_secs, start_offset_secs);
        let lap_end = video_time(lap.end_secs(), start_offset_secs);

        let segments = headline_segments(lap, options);
        let segment_count = segments.len();
        for (seg_index, (from, to, position)) in segments.into_iter().enumerate() {
            let closes_session = is_last_lap && seg_index + 1 == segment_count;
            let text = headline_text(lap.number, total, position, options);
            nodes.push(drawtext(
                &font,
                &escape_text(&text),
                x,
                style.margin + style.padding,
                style,
                &enable_range(lap_start + from, lap_start + to, closes_session),
            ));
        }

        if options.show_current_lap_time {
            nodes.push(drawtext(
                &font,
                &elapsed_expansion(lap_start),
                x,
                elapsed_y,
                style,
                &enable_range(lap_start, lap_end, is_last_lap),
            ));
        }

        if options.show_lap_deltas && index > 0 {
            if let Some(stats) = &stats {
                let previous = &laps[index - 1];
                let text = format!(
                    "Prev {}  Best {}  Avg {}",
                    format_lap_time(previous.duration_secs),
                    format_delta(stats.delta_to_best(previous)),
                    format_delta(stats.delta_to_average(previous)),
                );
                nodes.push(drawtext(
                    &font,
                    &escape_text(&text),
                    x,
                    delta_y,
                    style,
                    &enable_range(lap_start, lap_end, is_last_lap),
                ));
            }
        }
    }

    format!("[0:v]{}[{OVERLAY_LABEL}]", nodes.join(","))
}

/// Encode with the drawtext graph, falling back across `ctx.plans`.
pub(crate) async fn render(ctx: &OverlayContext) -> KartlapResult<(u64, EncoderPlan)> {
    let font = ctx.style.resolve_font_path();
    if font.is_none() {
        tracing::warn!("No font file found, relying on ffmpeg's default font");
    }
    let body = build_overlay_filter_graph(
        &ctx.timeline,
        ctx.start_offset_secs,
        &ctx.style,
        &ctx.options,
        font.as_deref(),
    );
    tracing::debug!(graph_len = body.len(), "Built overlay filter graph");

    let total_frames = ctx.video.total_frames();
    let ((), plan) = run_encoding_attempts(&ctx.plans, |plan| {
        let source = OverlaySource::Graph(body.clone());
        async move {
            let args = build_encode_args(ctx, &plan, &source);
            let process = FfmpegProcess::spawn(&ctx.ffmpeg_binary, &args, false, &plan.label)?;
            process
                .wait(ctx.video.duration, total_frames, ctx.progress.clone(), &ctx.cancel)
                .await
        }
    })
    .await?;

    Ok((0, plan))
}

/// `(from, to, position)` ranges within the lap, lap-relative seconds.
fn headline_segments(lap: &Lap, options: &OverlayOptions) -> Vec<(f64, f64, u32)> {
    if !options.show_position || lap.position_changes.is_empty() {
        let position = if options.show_position { lap.position } else { 0 };
        return vec![(0.0, lap.duration_secs, position)];
    }

    let changes = &lap.position_changes;
    changes
        .iter()
        .enumerate()
        .map(|(i, change)| {
            let to = changes
                .get(i + 1)
                .map(|next| next.at_secs)
                .unwrap_or(lap.duration_secs);
            (change.at_secs, to, change.position)
        })
        .filter(|(from, to, _)| to > from)
        .collect()
}

fn panel_width(timeline: &SessionTimeline, style: &OverlayStyle, options: &OverlayOptions) -> u32 {
    let max_position = timeline
        .laps()
        .iter()
        .flat_map(|lap| {
            std::iter::once(lap.position).chain(lap.position_changes.iter().map(|c| c.position))
        })
        .max()
        .unwrap_or(0);
    let widest_lap = timeline.laps().iter().map(|l| l.number).max().unwrap_or(1);
    let mut chars = headline_text(widest_lap, timeline.len(), max_position, options).len();
    if options.show_lap_deltas {
        chars = chars.max("Prev 0:00.000  Best +0.000  Avg +0.000".len());
    }
    if options.show_current_lap_time {
        chars = chars.max("00:00.000".len());
    }
    style.padding * 2 + (chars as f64 * style.font_size as f64 * GLYPH_WIDTH_RATIO).ceil() as u32
}

fn drawtext(font: &str, text: &str, x: u32, y: u32, style: &OverlayStyle, enable: &str) -> String {
    format!(
        "drawtext={font}text='{text}':x={x}:y={y}:fontsize={size}:fontcolor={color}:enable='{enable}'",
        size = style.font_size,
        color = ffmpeg_color(style.text_color),
    )
}

/// Half-open `[from, to)`, closed on the final segment of the session.
fn enable_range(from: f64, to: f64, closed: bool) -> String {
    let upper = if closed { "lte" } else { "lt" };
    format!("gte(t,{from:.3})*{upper}(t,{to:.3})")
}

/// Live `M:SS.mmm` counter relative to the lap start at video time `start`.
fn elapsed_expansion(start: f64) -> String {
    let e = format!("(t-{start:.3})");
    format!(
        "%{{eif\\:trunc({e}/60)\\:d}}\\:%{{eif\\:mod(trunc({e})\\,60)\\:d\\:2}}.%{{eif\\:mod(trunc({e}*1000)\\,1000)\\:d\\:3}}"
    )
}

/// Escape a literal for a single-quoted drawtext value.
///
/// A quote cannot be escaped inside quotes, so it closes the quoted run,
/// emits an escaped quote and reopens: `'` becomes `'\''`.
fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\'' => out.push_str("'\\''"),
            '\\' | ':' | '%' | ',' => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use kartlap_session_model::lap::PositionChange;

    fn timeline() -> SessionTimeline {
        let mut second = Lap::new(2, 55.0).with_position(3);
        second.position_changes = vec![PositionChange::new(0.0, 3), PositionChange::new(20.0, 2)];
        SessionTimeline::normalize(vec![Lap::new(1, 60.0).with_position(4), second]).unwrap()
    }

    fn graph(options: OverlayOptions) -> String {
        build_overlay_filter_graph(&timeline(), 10.0, &OverlayStyle::default(), &options, None)
    }

    #[test]
    fn test_empty_timeline_is_passthrough() {
        let empty = SessionTimeline::normalize(Vec::new()).unwrap();
        let graph = build_overlay_filter_graph(
            &empty,
            0.0,
            &OverlayStyle::default(),
            &OverlayOptions::default(),
            None,
        );
        assert_eq!(graph, "[0:v]null[ov]");
    }

    #[test]
    fn test_headline_nodes_follow_position_changes() {
        let graph = graph(OverlayOptions::default());
        assert!(graph.starts_with("[0:v]drawbox="));
        assert!(graph.ends_with("[ov]"));
        assert!(graph.contains("text='Lap 1/2  P4'"));
        assert!(graph.contains("text='Lap 2/2  P3'"));
        assert!(graph.contains("text='Lap 2/2  P2'"));
        // lap 1 spans video 10..70, lap 2 changes position at 90
        assert!(graph.contains("enable='gte(t,10.000)*lt(t,70.000)'"));
        assert!(graph.contains("enable='gte(t,70.000)*lt(t,90.000)'"));
        assert!(graph.contains("enable='gte(t,90.000)*lte(t,125.000)'"));
    }

    #[test]
    fn test_optional_nodes() {
        let plain = graph(OverlayOptions {
            show_current_lap_time: false,
            ..OverlayOptions::default()
        });
        assert!(!plain.contains("eif"));
        assert!(!plain.contains("Best"));

        let deltas = graph(OverlayOptions {
            show_lap_deltas: true,
            ..OverlayOptions::default()
        });
        assert!(deltas.contains("%{eif"));
        // lap 2 shows lap 1: 60s vs best 55s and average 57.5s
        assert!(deltas.contains("text='Prev 1\\:00.000  Best +5.000  Avg +2.500'"));
    }

    #[test]
    fn test_hidden_position_omits_position_text() {
        let graph = graph(OverlayOptions {
            show_position: false,
            show_lap_counter: false,
            ..OverlayOptions::default()
        });
        assert!(graph.contains("text='Lap 2'"));
        assert!(!graph.contains("  P"));
    }

    #[test]
    fn test_unknown_position_draws_no_position() {
        let timeline = SessionTimeline::normalize(vec![Lap::new(1, 30.0)]).unwrap();
        let graph = build_overlay_filter_graph(
            &timeline,
            0.0,
            &OverlayStyle::default(),
            &OverlayOptions::default(),
            None,
        );
        assert!(graph.contains("text='Lap 1/1'"));
        assert!(!graph.contains("P0"));
    }

    #[test]
    fn test_escape_text() {
        assert_eq!(escape_text("1:00.000"), "1\\:00.000");
        assert_eq!(escape_text("50%"), "50\\%");
        assert_eq!(escape_text("it's"), "it'\\''s");
    }

    #[test]
    fn test_quote_in_font_path_reopens_quoting() {
        let graph = build_overlay_filter_graph(
            &timeline(),
            0.0,
            &OverlayStyle::default(),
            &OverlayOptions::default(),
            Some(Path::new("/home/o'neil/fonts/Bold.ttf")),
        );
        assert!(graph.contains("fontfile='/home/o'\\''neil/fonts/Bold.ttf':"));
        assert!(!graph.contains("o\\'neil"));
    }

    #[test]
    fn test_font_path_is_quoted() {
        let graph = build_overlay_filter_graph(
            &timeline(),
            0.0,
            &OverlayStyle::default(),
            &OverlayOptions::default(),
            Some(Path::new("/fonts/Bold.ttf")),
        );
        assert!(graph.contains("drawtext=fontfile='/fonts/Bold.ttf':text="));
    }
}
