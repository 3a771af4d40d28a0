//! Debug renderings of detection passes: box outlines, phrase/confidence labels,
//! blue centers for every box and a green center for the selected one.

use font8x8::{UnicodeFonts, BASIC_FONTS};
use image::{DynamicImage, Rgba, RgbaImage};
use std::path::Path;

use crate::detection::{DetectionBox, DetectionPass};
use crate::error::Result;
use crate::util::{ensure_parent_dir, round_to};

const BOX_COLOR: Rgba<u8> = Rgba([255, 69, 58, 255]);
const CENTER_COLOR: Rgba<u8> = Rgba([10, 132, 255, 255]);
const BEST_COLOR: Rgba<u8> = Rgba([52, 199, 89, 255]);
const LABEL_BG: Rgba<u8> = Rgba([0, 0, 0, 153]);
const LABEL_FG: Rgba<u8> = Rgba([255, 255, 255, 255]);

pub fn write_detection_overlay(
    pass: &DetectionPass,
    best: Option<&DetectionBox>,
    out_path: &Path,
) -> Result<()> {
    let mut img = image::open(&pass.image)?.to_rgba8();
    render_detection_overlay(&mut img, pass, best);
    ensure_parent_dir(out_path)?;
    DynamicImage::ImageRgba8(img).save(out_path)?;
    Ok(())
}

pub fn render_detection_overlay(
    img: &mut RgbaImage,
    pass: &DetectionPass,
    best: Option<&DetectionBox>,
) {
    let scale = label_scale(img.width(), img.height());
    let radius = f64::from((img.width().min(img.height()) / 80).max(3));

    for det in &pass.boxes {
        let rect = det.scaled.rect();
        let (left, top) = (rect.x1.max(0.0), rect.y1.max(0.0));
        let x = left.round() as u32;
        let y = top.round() as u32;
        if rect.x2 > 0.0 && rect.y2 > 0.0 {
            draw_rect_outline(
                img,
                x,
                y,
                (rect.x2 - left).round().max(1.0) as u32,
                (rect.y2 - top).round().max(1.0) as u32,
                BOX_COLOR,
                scale,
            );
        }

        let label = format!("{} {}", det.phrase, round_to(det.confidence, 2));
        let (lx, ly) = (x as i32, (y as i32 - 9 * scale as i32).max(0));
        let (tw, th) = text_extent(&label, scale);
        fill_rect(img, lx, ly, lx + tw, ly + th, LABEL_BG);
        draw_bitmap_text(img, lx, ly, &label, LABEL_FG, scale);

        draw_disc(img, det.scaled.cx, det.scaled.cy, radius, CENTER_COLOR);
    }

    if let Some(best) = best {
        draw_disc(img, best.scaled.cx, best.scaled.cy, radius, BEST_COLOR);
    }
}

fn label_scale(width: u32, height: u32) -> u32 {
    (width.min(height) / 400).clamp(1, 4)
}

fn blend_pixel(dst: Rgba<u8>, src: Rgba<u8>) -> Rgba<u8> {
    let a = f64::from(src[3]) / 255.0;
    if a <= 0.0 {
        return dst;
    }
    let inv = 1.0 - a;
    let channel = |d: f64, s: f64| (d * inv + s * a).round().clamp(0.0, 255.0) as u8;
    let mut out = dst;
    for i in 0..3 {
        out[i] = channel(f64::from(dst[i]), f64::from(src[i]));
    }
    out[3] = (f64::from(dst[3]) + f64::from(src[3]) * inv)
        .round()
        .clamp(0.0, 255.0) as u8;
    out
}

/// Alpha-blends `color` at (x, y); points outside the image are ignored.
fn blend_at(img: &mut RgbaImage, x: i32, y: i32, color: Rgba<u8>) {
    if x < 0 || y < 0 || x >= img.width() as i32 || y >= img.height() as i32 {
        return;
    }
    let (x, y) = (x as u32, y as u32);
    let dst = *img.get_pixel(x, y);
    img.put_pixel(x, y, blend_pixel(dst, color));
}

fn draw_rect_outline(
    img: &mut RgbaImage,
    x: u32,
    y: u32,
    w: u32,
    h: u32,
    color: Rgba<u8>,
    thickness: u32,
) {
    if w == 0 || h == 0 || img.width() == 0 || img.height() == 0 {
        return;
    }
    let max_x = img.width() - 1;
    let max_y = img.height() - 1;
    let left = x.min(max_x);
    let top = y.min(max_y);
    let right = x.saturating_add(w - 1).min(max_x);
    let bottom = y.saturating_add(h - 1).min(max_y);

    for t in 0..thickness.max(1) {
        let (l, tp) = (left.saturating_sub(t), top.saturating_sub(t));
        let (r, b) = ((right + t).min(max_x), (bottom + t).min(max_y));
        for xx in l..=r {
            img.put_pixel(xx, tp, color);
            img.put_pixel(xx, b, color);
        }
        for yy in tp..=b {
            img.put_pixel(l, yy, color);
            img.put_pixel(r, yy, color);
        }
    }
}

fn draw_disc(img: &mut RgbaImage, cx: f64, cy: f64, radius: f64, color: Rgba<u8>) {
    let r2 = radius * radius;
    let (x0, x1) = ((cx - radius).floor() as i32, (cx + radius).ceil() as i32);
    let (y0, y1) = ((cy - radius).floor() as i32, (cy + radius).ceil() as i32);
    for y in y0..=y1 {
        for x in x0..=x1 {
            let (dx, dy) = (f64::from(x) - cx, f64::from(y) - cy);
            if dx * dx + dy * dy <= r2 {
                blend_at(img, x, y, color);
            }
        }
    }
}

/// 8x8 bitmap glyphs scaled by `scale`; unknown characters render as `?`.
fn draw_bitmap_text(img: &mut RgbaImage, x: i32, y: i32, text: &str, color: Rgba<u8>, scale: u32) {
    let step = scale.max(1) as i32;
    for (i, ch) in text.chars().enumerate() {
        let Some(glyph) = BASIC_FONTS.get(ch).or_else(|| BASIC_FONTS.get('?')) else {
            continue;
        };
        let origin_x = x + i as i32 * 8 * step;
        for (row, bits) in glyph.iter().enumerate() {
            for col in (0..8).filter(|c| (bits >> c) & 1 == 1) {
                let px = origin_x + col * step;
                let py = y + row as i32 * step;
                fill_rect(img, px, py, px + step - 1, py + step - 1, color);
            }
        }
    }
}

fn text_extent(text: &str, scale: u32) -> (i32, i32) {
    let step = scale.max(1) as i32;
    (text.chars().count() as i32 * 8 * step, 8 * step)
}

/// Blends `color` over the inclusive rectangle (x0, y0)..(x1, y1).
fn fill_rect(img: &mut RgbaImage, x0: i32, y0: i32, x1: i32, y1: i32, color: Rgba<u8>) {
    for y in y0.min(y1)..=y0.max(y1) {
        for x in x0.min(x1)..=x0.max(x1) {
            blend_at(img, x, y, color);
        }
    }
}
