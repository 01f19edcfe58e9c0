//! Drawing detections onto frames.
//!
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::{Rgb, RgbImage};
use imageproc::{
    drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
    rect::Rect,
};
use rusttype::{Font, Scale};

use crate::{
    labels::class_color,
    nn::{Detection, DetectionResult},
};

const LABEL_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

/// Draws boxes and, if a font is available, labels with confidences.
pub struct Annotator {
    font: Option<Font<'static>>,
}

impl Annotator {
    /// Annotator drawing boxes only.
    pub fn boxes_only() -> Self {
        Self { font: None }
    }

    /// Annotator drawing labels with the TrueType font at `font_path`.
    pub fn with_font(font_path: impl AsRef<Path>) -> Result<Self> {
        let font_path = font_path.as_ref();
        let font_data = std::fs::read(font_path)
            .with_context(|| format!("failed to read font {}", font_path.display()))?;
        let font = Font::try_from_vec(font_data)
            .ok_or_else(|| anyhow!("{} is not a valid font", font_path.display()))?;

        Ok(Self { font: Some(font) })
    }

    pub fn from_config(font_path: Option<&Path>) -> Result<Self> {
        match font_path {
            Some(path) => Self::with_font(path),
            None => {
                log::warn!("No font configured, drawing boxes without labels");
                Ok(Self::boxes_only())
            }
        }
    }

    /// Draw bounding boxes onto a copy of `frame`.
    pub fn draw(&self, frame: &RgbImage, detections: &[Detection]) -> RgbImage {
        let mut canvas = frame.clone();
        let (width, height) = canvas.dimensions();
        if width == 0 || height == 0 {
            return canvas;
        }
        let thickness = line_thickness(width, height);

        for detection in detections {
            let color = class_color(detection.class_id);
            let Some((x, y, w, h)) = clamp_box(&detection.bbox, width, height) else {
                continue;
            };

            for inset in 0..thickness {
                if w <= 2 * inset || h <= 2 * inset {
                    break;
                }
                let rect = Rect::at((x + inset) as i32, (y + inset) as i32)
                    .of_size(w - 2 * inset, h - 2 * inset);
                draw_hollow_rect_mut(&mut canvas, rect, color);
            }

            if let Some(font) = &self.font {
                let text = format!("{} {:.2}", detection.label, detection.confidence);
                draw_label(&mut canvas, font, &text, x, y, thickness, color);
            }
        }

        canvas
    }
}

impl DetectionResult {
    /// Frame with this result's overlays drawn.
    pub fn render(&self, frame: &RgbImage, annotator: &Annotator) -> RgbImage {
        annotator.draw(frame, &self.detections)
    }
}

fn line_thickness(width: u32, height: u32) -> u32 {
    u32::max(((width + height) as f32 / 2.0 * 0.003).round() as u32, 2)
}

/// Clip a box to the frame, returning `(x, y, width, height)` or `None` if nothing is left.
fn clamp_box(bbox: &[f32; 4], width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
    let clamp = |value: f32, max: u32| value.max(0.0).min(max as f32) as u32;
    let (x_tl, y_tl) = (clamp(bbox[0], width - 1), clamp(bbox[1], height - 1));
    let (x_br, y_br) = (clamp(bbox[2], width - 1), clamp(bbox[3], height - 1));
    if x_br <= x_tl || y_br <= y_tl {
        return None;
    }

    Some((x_tl, y_tl, x_br - x_tl + 1, y_br - y_tl + 1))
}

fn draw_label(
    canvas: &mut RgbImage,
    font: &Font<'static>,
    text: &str,
    x: u32,
    y: u32,
    thickness: u32,
    color: Rgb<u8>,
) {
    let scale = Scale::uniform(8.0 * thickness as f32);
    let (text_width, text_height) = text_size(scale, font, text);
    let (text_width, text_height) = (text_width.max(1) as u32, text_height.max(1) as u32);

    // Put the label above the box, or inside it when the box touches the top edge
    let label_y = match y.checked_sub(text_height + 2) {
        Some(above) => above,
        None => y,
    };
    let background = Rect::at(x as i32, label_y as i32).of_size(text_width + 2, text_height + 2);
    draw_filled_rect_mut(canvas, background, color);
    draw_text_mut(
        canvas,
        LABEL_COLOR,
        x as i32 + 1,
        label_y as i32 + 1,
        scale,
        font,
        text,
    );
}
