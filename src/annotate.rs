//! Detection visualization - boxes and labels drawn onto the source image

use std::io::Cursor;
use std::path::Path;

use ab_glyph::{FontVec, PxScale};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use thiserror::Error;

use crate::detector::Detection;

const BOX_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const BOX_THICKNESS: i32 = 2;
const LABEL_FONT_SIZE: f32 = 16.0;
/// Label bar height when no font is configured
const LABEL_BAR_HEIGHT: u32 = 6;

#[derive(Debug, Error)]
pub enum AnnotateError {
    #[error("failed to read font {0}: {1}")]
    FontIo(String, std::io::Error),

    #[error("font {0} is not a valid TrueType/OpenType font")]
    InvalidFont(String),

    #[error("failed to encode image: {0}")]
    Encode(#[from] image::ImageError),
}

#[derive(Default)]
pub struct Annotator {
    font: Option<FontVec>,
}

impl Annotator {
    pub fn new(font: Option<FontVec>) -> Self {
        Self { font }
    }

    /// Without a font, boxes still get a colored label bar but no text
    pub fn from_font_path(path: Option<&Path>) -> Result<Self, AnnotateError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let data = std::fs::read(path).map_err(|e| AnnotateError::FontIo(path.display().to_string(), e))?;
        let font = FontVec::try_from_vec(data)
            .map_err(|_| AnnotateError::InvalidFont(path.display().to_string()))?;

        tracing::info!("Annotation font loaded from {}", path.display());
        Ok(Self::new(Some(font)))
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    pub fn draw(&self, image: &DynamicImage, detections: &[Detection]) -> RgbImage {
        let mut canvas = image.to_rgb8();
        let (w, h) = (canvas.width() as i32, canvas.height() as i32);

        for det in detections {
            let x1 = (det.bbox.x.floor() as i32).clamp(0, w - 1);
            let y1 = (det.bbox.y.floor() as i32).clamp(0, h - 1);
            let x2 = (det.bbox.x2().ceil() as i32).clamp(0, w - 1);
            let y2 = (det.bbox.y2().ceil() as i32).clamp(0, h - 1);
            if x2 <= x1 || y2 <= y1 {
                continue;
            }

            for t in 0..BOX_THICKNESS {
                let (bw, bh) = (x2 - x1 - 2 * t, y2 - y1 - 2 * t);
                if bw <= 0 || bh <= 0 {
                    break;
                }
                draw_hollow_rect_mut(
                    &mut canvas,
                    Rect::at(x1 + t, y1 + t).of_size(bw as u32 + 1, bh as u32 + 1),
                    BOX_COLOR,
                );
            }

            self.draw_label(&mut canvas, x1, y1, &format!("{}: {:.2}", det.label, det.confidence));
        }

        canvas
    }

    fn draw_label(&self, canvas: &mut RgbImage, x: i32, y: i32, label: &str) {
        let scale = PxScale::from(LABEL_FONT_SIZE);
        let (text_w, text_h) = match &self.font {
            Some(font) => text_size(scale, font, label),
            None => (0, LABEL_BAR_HEIGHT),
        };

        let bar_w = (text_w + 4).min(canvas.width().saturating_sub(x as u32)).max(1);
        let bar_h = text_h + 4;
        // above the box when there is room, inside it otherwise
        let bar_y = if y >= bar_h as i32 { y - bar_h as i32 } else { y };

        draw_filled_rect_mut(canvas, Rect::at(x, bar_y).of_size(bar_w, bar_h), BOX_COLOR);

        if let Some(font) = &self.font {
            draw_text_mut(canvas, TEXT_COLOR, x + 2, bar_y + 2, scale, font, label);
        }
    }

    pub fn render_png(&self, image: &DynamicImage, detections: &[Detection]) -> Result<Vec<u8>, AnnotateError> {
        encode_png(&DynamicImage::ImageRgb8(self.draw(image, detections)))
    }
}

pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, AnnotateError> {
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, ImageFormat::Png)?;
    Ok(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::BoundingBox;

    fn detection(x: f32, y: f32, w: f32, h: f32) -> Detection {
        Detection {
            bbox: BoundingBox { x, y, width: w, height: h },
            label: "short".to_string(),
            class_id: 1,
            confidence: 0.87,
        }
    }

    #[test]
    fn test_draw_box_edges() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(100, 80, Rgb([0, 128, 0])));
        let canvas = Annotator::default().draw(&image, &[detection(20.0, 30.0, 40.0, 30.0)]);

        assert_eq!(canvas.dimensions(), (100, 80));
        // outer and inner stroke on the left edge
        assert_eq!(*canvas.get_pixel(20, 45), BOX_COLOR);
        assert_eq!(*canvas.get_pixel(21, 45), BOX_COLOR);
        // interior untouched
        assert_eq!(*canvas.get_pixel(40, 50), Rgb([0, 128, 0]));
        // label bar above the box
        assert_eq!(*canvas.get_pixel(21, 25), BOX_COLOR);
    }

    #[test]
    fn test_draw_skips_degenerate_boxes() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(10, 10, Rgb([1, 2, 3])));
        let canvas = Annotator::default().draw(&image, &[detection(5.0, 5.0, 0.0, 0.0)]);
        assert!(canvas.pixels().all(|p| *p == Rgb([1, 2, 3])));
    }

    #[test]
    fn test_render_png_roundtrip_dimensions() {
        let image = DynamicImage::new_rgb8(33, 17);
        let png = Annotator::default().render_png(&image, &[detection(1.0, 1.0, 30.0, 15.0)]).unwrap();

        assert_eq!(image::guess_format(&png).unwrap(), ImageFormat::Png);
        let decoded = image::load_from_memory(&png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (33, 17));
    }

    #[test]
    fn test_missing_font_file() {
        let result = Annotator::from_font_path(Some(Path::new("/nonexistent/font.ttf")));
        assert!(matches!(result, Err(AnnotateError::FontIo(..))));
        assert!(!Annotator::from_font_path(None).unwrap().has_font());
    }
}
