//! Per-frame panel rasterization.

use std::path::Path;
use std::sync::Arc;

use ab_glyph::{FontVec, PxScale};
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{ImageEncoder, Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use kartlap_common::clock::format_lap_time;
use kartlap_common::error::{KartlapError, KartlapResult};
use kartlap_session_model::timeline::SessionTimeline;

use super::{headline_text, OverlayOptions, OverlayStyle};
use crate::compositor::{compose_frame, PanelContent};

/// Draws the panel for one frame as an encoded image.
pub trait PanelPainter: Send + Sync {
    /// Encoded panel for a frame inside the session.
    fn paint(&self, panel: &PanelContent) -> KartlapResult<Vec<u8>>;

    /// Encoded fully transparent frame of the same size.
    fn blank(&self) -> KartlapResult<Vec<u8>>;

    /// Panel size in pixels.
    fn size(&self) -> (u32, u32);
}

/// PNG painter backed by a TrueType font.
pub struct PngPanelPainter {
    font: FontVec,
    scale: PxScale,
    style: OverlayStyle,
    options: OverlayOptions,
    width: u32,
    height: u32,
}

impl PngPanelPainter {
    /// Load the font and size the panel for the widest text it will show.
    pub fn new(
        style: &OverlayStyle,
        options: &OverlayOptions,
        font_path: &Path,
        total_laps: usize,
    ) -> KartlapResult<Self> {
        let bytes = std::fs::read(font_path).map_err(|e| {
            KartlapError::render(format!("failed to read font {}: {e}", font_path.display()))
        })?;
        let font = FontVec::try_from_vec(bytes).map_err(|e| {
            KartlapError::render(format!("invalid font {}: {e}", font_path.display()))
        })?;
        let scale = PxScale::from(style.font_size as f32);

        let widest_headline = headline_text(total_laps.max(1) as u32, total_laps, 99, options);
        let (headline_w, _) = text_size(scale, &font, &widest_headline);
        let (elapsed_w, _) = text_size(scale, &font, "00:00.000");
        let lines = if options.show_current_lap_time { 2 } else { 1 };

        let width = style.padding * 2 + headline_w.max(elapsed_w);
        let height = style.padding * 2 + style.line_height() * lines - style.line_spacing;

        tracing::debug!(
            font = %font_path.display(),
            width,
            height,
            "Loaded overlay font"
        );

        Ok(Self {
            font,
            scale,
            style: style.clone(),
            options: *options,
            width,
            height,
        })
    }

    fn encode(&self, image: &RgbaImage) -> KartlapResult<Vec<u8>> {
        let mut buf = Vec::with_capacity((self.width * self.height) as usize);
        PngEncoder::new_with_quality(&mut buf, CompressionType::Fast, FilterType::NoFilter)
            .write_image(
                image.as_raw(),
                image.width(),
                image.height(),
                image::ExtendedColorType::Rgba8,
            )
            .map_err(|e| KartlapError::render(format!("PNG encoding failed: {e}")))?;
        Ok(buf)
    }
}

impl PanelPainter for PngPanelPainter {
    fn paint(&self, panel: &PanelContent) -> KartlapResult<Vec<u8>> {
        let mut image = RgbaImage::new(self.width, self.height);
        draw_filled_rect_mut(
            &mut image,
            Rect::at(0, 0).of_size(self.width, self.height),
            Rgba(self.style.box_color),
        );

        let text_color = Rgba(self.style.text_color);
        let x = self.style.padding as i32;
        let y = self.style.padding as i32;
        let headline = headline_text(
            panel.lap_number,
            panel.total_laps,
            panel.position,
            &self.options,
        );
        draw_text_mut(&mut image, text_color, x, y, self.scale, &self.font, &headline);

        if self.options.show_current_lap_time {
            draw_text_mut(
                &mut image,
                text_color,
                x,
                y + self.style.line_height() as i32,
                self.scale,
                &self.font,
                &format_lap_time(panel.lap_elapsed),
            );
        }

        self.encode(&image)
    }

    fn blank(&self) -> KartlapResult<Vec<u8>> {
        self.encode(&RgbaImage::new(self.width, self.height))
    }

    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Draws frames by absolute index.
pub struct FrameRenderer {
    timeline: Arc<SessionTimeline>,
    fps: f64,
    start_offset_secs: f64,
    painter: Arc<dyn PanelPainter>,
    blank: Arc<Vec<u8>>,
}

impl FrameRenderer {
    pub fn new(
        timeline: Arc<SessionTimeline>,
        fps: f64,
        start_offset_secs: f64,
        painter: Arc<dyn PanelPainter>,
    ) -> KartlapResult<Self> {
        if !fps.is_finite() || fps <= 0.0 {
            return Err(KartlapError::validation(format!(
                "frame rate must be positive, got {fps}"
            )));
        }
        let blank = Arc::new(painter.blank()?);
        Ok(Self {
            timeline,
            fps,
            start_offset_secs,
            painter,
            blank,
        })
    }

    /// Encoded image for `frame_index`. Frames outside the session share one blank buffer.
    pub fn draw_frame(&self, frame_index: u64) -> KartlapResult<Arc<Vec<u8>>> {
        let composition = compose_frame(&self.timeline, frame_index, self.fps, self.start_offset_secs);
        match composition.panel {
            Some(panel) => Ok(Arc::new(self.painter.paint(&panel)?)),
            None => Ok(Arc::clone(&self.blank)),
        }
    }

    pub fn panel_size(&self) -> (u32, u32) {
        self.painter.size()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use kartlap_session_model::lap::Lap;

    /// Writes a readable token per frame instead of an image.
    pub(crate) struct TextPainter;

    impl PanelPainter for TextPainter {
        fn paint(&self, panel: &PanelContent) -> KartlapResult<Vec<u8>> {
            Ok(format!("{}@{:.3};", panel.headline(), panel.lap_elapsed).into_bytes())
        }

        fn blank(&self) -> KartlapResult<Vec<u8>> {
            Ok(b"-;".to_vec())
        }

        fn size(&self) -> (u32, u32) {
            (4, 4)
        }
    }

    pub(crate) fn renderer(offset: f64) -> FrameRenderer {
        let timeline = SessionTimeline::normalize(vec![
            Lap::new(1, 1.0).with_position(2),
            Lap::new(2, 1.0).with_position(1),
        ])
        .unwrap();
        FrameRenderer::new(Arc::new(timeline), 4.0, offset, Arc::new(TextPainter)).unwrap()
    }

    #[test]
    fn test_draw_frame_maps_to_session_time() {
        let renderer = renderer(0.5);
        assert_eq!(renderer.draw_frame(0).unwrap().as_slice(), b"-;");
        assert_eq!(
            renderer.draw_frame(2).unwrap().as_slice(),
            b"Lap 1/2  P2@0.000;"
        );
        assert_eq!(
            renderer.draw_frame(7).unwrap().as_slice(),
            b"Lap 2/2  P1@0.250;"
        );
        // video 2.5s is exactly the session end
        assert_eq!(
            renderer.draw_frame(10).unwrap().as_slice(),
            b"Lap 2/2  P1@1.000;"
        );
        assert_eq!(renderer.draw_frame(11).unwrap().as_slice(), b"-;");
    }

    #[test]
    fn test_blank_frames_share_buffer() {
        let renderer = renderer(10.0);
        let a = renderer.draw_frame(0).unwrap();
        let b = renderer.draw_frame(1).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_rejects_zero_fps() {
        let timeline = Arc::new(SessionTimeline::normalize(vec![Lap::new(1, 1.0)]).unwrap());
        assert!(FrameRenderer::new(timeline, 0.0, 0.0, Arc::new(TextPainter)).is_err());
    }

    #[test]
    #[ignore] // Requires a system TTF font such as DejaVuSans-Bold
    fn test_png_painter_with_system_font() {
        let font = super::super::resolve_font_path(None).expect("no system TTF font installed");
        let painter = PngPanelPainter::new(
            &OverlayStyle::default(),
            &OverlayOptions::default(),
            &font,
            12,
        )
        .unwrap();
        let png = painter
            .paint(&PanelContent {
                lap_number: 3,
                total_laps: 12,
                position: 5,
                lap_elapsed: 12.5,
            })
            .unwrap();
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");
        let decoded = image::load_from_memory(&png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), painter.size());
    }
}
