// src/visualizer.rs
//
// Caliper overlay: semi-transparent vertical lines, optional endpoint dots,
// per-line length labels and a mean-length banner along the bottom edge.

use crate::types::{mean_length_mm, LineSegment};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;
use serde::{Deserialize, Serialize};

const GLYPH_W: i32 = 5;
const GLYPH_H: i32 = 7;
const GLYPH_ADVANCE: i32 = GLYPH_W + 1;
const BOX_PAD: i32 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualizationParams {
    pub line_color: [u8; 3],
    pub line_thickness: u32,
    /// Overlay opacity, 0 = invisible, 1 = opaque.
    pub line_alpha: f32,
    pub show_points: bool,
    pub point_radius: i32,
    pub min_point_color: [u8; 3],
    pub max_point_color: [u8; 3],
    pub display_labels: bool,
}

impl Default for VisualizationParams {
    fn default() -> Self {
        Self {
            line_color: [255, 255, 255],
            line_thickness: 1,
            line_alpha: 0.7,
            show_points: false,
            point_radius: 3,
            min_point_color: [0, 0, 255],
            max_point_color: [255, 0, 0],
            display_labels: true,
        }
    }
}

/// Returns a copy of `image` with the calipers drawn on it.
pub fn draw_lines(
    image: &RgbImage,
    lines: &[LineSegment],
    pixel_size_mm: f64,
    params: &VisualizationParams,
) -> RgbImage {
    if lines.is_empty() {
        return image.clone();
    }

    let mut overlay = image.clone();
    let color = Rgb(params.line_color);
    let thickness = params.line_thickness.max(1) as i32;
    for line in lines {
        for t in 0..thickness {
            let x = (line.x + t - thickness / 2) as f32;
            draw_line_segment_mut(
                &mut overlay,
                (x, line.top_y as f32),
                (x, line.bottom_y as f32),
                color,
            );
        }
        if params.show_points {
            draw_filled_circle_mut(
                &mut overlay,
                (line.x, line.top_y),
                params.point_radius,
                Rgb(params.min_point_color),
            );
            draw_filled_circle_mut(
                &mut overlay,
                (line.x, line.bottom_y),
                params.point_radius,
                Rgb(params.max_point_color),
            );
        }
    }

    let mut out = blend(image, &overlay, params.line_alpha.clamp(0.0, 1.0));

    if params.display_labels {
        for line in lines {
            let mm = line.height_px() as f64 * pixel_size_mm;
            let text = format!("{:.1} mm", mm);
            let (tw, th) = text_size(&text);
            let x = line.x - tw / 2;
            let y = (line.top_y - 4 - th).max(BOX_PAD);
            draw_label(&mut out, &text, x, y);
        }
    }

    if let Some(mean) = mean_length_mm(lines, pixel_size_mm) {
        let text = format!("Mean length: {:.1} mm", mean);
        let (tw, th) = text_size(&text);
        let x = (out.width() as i32 - tw) / 2;
        let y = out.height() as i32 - 6 - th;
        draw_label(&mut out, &text, x, y);
    }

    out
}

/// `base * (1 - alpha) + overlay * alpha`, per channel.
fn blend(base: &RgbImage, overlay: &RgbImage, alpha: f32) -> RgbImage {
    let mut out = base.clone();
    for (dst, (&b, &o)) in out.iter_mut().zip(base.iter().zip(overlay.iter())) {
        if b != o {
            *dst = (b as f32 * (1.0 - alpha) + o as f32 * alpha)
                .round()
                .clamp(0.0, 255.0) as u8;
        }
    }
    out
}

fn text_size(text: &str) -> (i32, i32) {
    let n = text.chars().count() as i32;
    ((n * GLYPH_ADVANCE - 1).max(0), GLYPH_H)
}

/// White text on a black box; `(x, y)` is the top-left of the text.
fn draw_label(img: &mut RgbImage, text: &str, x: i32, y: i32) {
    let (tw, th) = text_size(text);
    draw_filled_rect_mut(
        img,
        Rect::at(x - BOX_PAD, y - BOX_PAD).of_size((tw + 2 * BOX_PAD) as u32, (th + 2 * BOX_PAD) as u32),
        Rgb([0, 0, 0]),
    );

    let (w, h) = (img.width() as i32, img.height() as i32);
    for (i, ch) in text.chars().enumerate() {
        let Some(rows) = glyph(ch) else { continue };
        let gx = x + i as i32 * GLYPH_ADVANCE;
        for (row, bits) in rows.iter().enumerate() {
            for col in 0..GLYPH_W {
                if bits & (1 << (GLYPH_W - 1 - col)) == 0 {
                    continue;
                }
                let (px, py) = (gx + col, y + row as i32);
                if px >= 0 && py >= 0 && px < w && py < h {
                    img.put_pixel(px as u32, py as u32, Rgb([255, 255, 255]));
                }
            }
        }
    }
}

/// 5x7 bitmaps for the characters that appear in labels.
fn glyph(ch: char) -> Option<[u8; 7]> {
    let rows = match ch {
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        ':' => [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00],
        'M' => [0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11],
        'a' => [0x00, 0x00, 0x0E, 0x01, 0x0F, 0x11, 0x0F],
        'e' => [0x00, 0x00, 0x0E, 0x11, 0x1F, 0x10, 0x0E],
        'g' => [0x00, 0x0F, 0x11, 0x11, 0x0F, 0x01, 0x0E],
        'h' => [0x10, 0x10, 0x16, 0x19, 0x11, 0x11, 0x11],
        'l' => [0x0C, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'm' => [0x00, 0x00, 0x1A, 0x15, 0x15, 0x11, 0x11],
        'n' => [0x00, 0x00, 0x16, 0x19, 0x11, 0x11, 0x11],
        't' => [0x08, 0x08, 0x1C, 0x08, 0x08, 0x09, 0x06],
        _ => return None,
    };
    Some(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain() -> VisualizationParams {
        VisualizationParams {
            display_labels: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_no_lines_returns_copy() {
        let img = RgbImage::from_pixel(32, 32, Rgb([40, 50, 60]));
        assert_eq!(draw_lines(&img, &[], 0.1, &VisualizationParams::default()), img);
    }

    #[test]
    fn test_line_is_alpha_blended() {
        let img = RgbImage::new(64, 64);
        let lines = [LineSegment::new(20, 10, 30)];
        let out = draw_lines(&img, &lines, 0.1, &plain());
        let v = out.get_pixel(20, 20).0[0];
        assert!((178..=179).contains(&v), "blended value {}", v);
        assert_eq!(out.get_pixel(25, 20), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_opaque_overlay() {
        let img = RgbImage::new(64, 64);
        let params = VisualizationParams {
            line_alpha: 1.0,
            line_color: [10, 200, 30],
            ..plain()
        };
        let out = draw_lines(&img, &[LineSegment::new(5, 5, 20)], 0.1, &params);
        assert_eq!(out.get_pixel(5, 12), &Rgb([10, 200, 30]));
    }

    #[test]
    fn test_mean_banner_at_bottom() {
        let img = RgbImage::new(200, 100);
        let out = draw_lines(&img, &[LineSegment::new(100, 30, 60)], 0.1, &plain());
        let banner_rows = 100 - 6 - GLYPH_H..100 - 6;
        let lit = (0..200)
            .flat_map(|x| banner_rows.clone().map(move |y| (x, y)))
            .filter(|&(x, y)| out.get_pixel(x as u32, y as u32).0 == [255, 255, 255])
            .count();
        assert!(lit > 0);
    }

    #[test]
    fn test_labels_drawn_above_line() {
        let img = RgbImage::new(200, 100);
        let params = VisualizationParams::default();
        let with = draw_lines(&img, &[LineSegment::new(100, 40, 60)], 0.1, &params);
        let without = draw_lines(&img, &[LineSegment::new(100, 40, 60)], 0.1, &plain());
        let y0 = (40 - 4 - GLYPH_H) as u32;
        let differs = (0..200).any(|x| with.get_pixel(x, y0 + 3) != without.get_pixel(x, y0 + 3));
        assert!(differs);
    }

    #[test]
    fn test_unknown_glyph_skipped() {
        assert!(glyph('?').is_none());
        assert_eq!(text_size("1.0 mm"), (35, 7));
    }
}
