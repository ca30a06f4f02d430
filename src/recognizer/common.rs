use anyhow::{Context, Result, anyhow};
use fast_image_resize as fir;
use ndarray::Array4;
use rayon::prelude::*;

use crate::types::{CategoryMask, ImageView, Landmark};

/// How a source image was fitted into a square model input.
#[derive(Clone, Debug, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub orig_w: u32,
    pub orig_h: u32,
}

impl Letterbox {
    /// Model input pixel -> source pixel, clamped to the image.
    pub fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        let px = (x - self.pad_x) / self.scale;
        let py = (y - self.pad_y) / self.scale;
        (
            px.clamp(0.0, self.orig_w.saturating_sub(1) as f32),
            py.clamp(0.0, self.orig_h.saturating_sub(1) as f32),
        )
    }

    /// Source pixel -> model input pixel.
    pub fn to_model(&self, x: f32, y: f32) -> (f32, f32) {
        (x * self.scale + self.pad_x, y * self.scale + self.pad_y)
    }
}

/// Resizes preserving aspect ratio, pads to `target_size` square and
/// normalizes to `[0, 1]` NHWC RGB.
pub fn prepare_letterboxed(image: ImageView<'_>, target_size: u32) -> Result<(Array4<f32>, Letterbox)> {
    let expected_len = image.expected_len();
    if image.rgba.len() != expected_len || expected_len == 0 {
        return Err(anyhow!(
            "frame buffer size mismatch: got {}, expected {}",
            image.rgba.len(),
            expected_len
        ));
    }

    let scale = target_size as f32 / (image.width.max(image.height) as f32);
    let new_w = ((image.width as f32 * scale).round().max(1.0) as u32).min(target_size);
    let new_h = ((image.height as f32 * scale).round().max(1.0) as u32).min(target_size);

    let src_image = fir::images::ImageRef::new(image.width, image.height, image.rgba, fir::PixelType::U8x4)?;
    let mut dst_image = fir::images::Image::new(new_w, new_h, fir::PixelType::U8x4);
    let mut resizer = fir::Resizer::new();
    let resize_options = fir::ResizeOptions::new()
        .resize_alg(fir::ResizeAlg::Interpolation(fir::FilterType::Bilinear));
    resizer
        .resize(&src_image, &mut dst_image, Some(&resize_options))
        .context("fast resize failed")?;
    let resized = dst_image.into_vec();

    let side = target_size as usize;
    let pad_x = (side - new_w as usize) / 2;
    let pad_y = (side - new_h as usize) / 2;
    let mut canvas = vec![0u8; side * side * 4];
    let dst_stride = side * 4;
    let src_stride = new_w as usize * 4;
    for (row, src) in resized.chunks_exact(src_stride).enumerate() {
        let offset = (pad_y + row) * dst_stride + pad_x * 4;
        canvas[offset..offset + src_stride].copy_from_slice(src);
    }

    let normalized: Vec<f32> = canvas
        .par_chunks_exact(4)
        .flat_map_iter(|px| {
            [
                px[0] as f32 / 255.0,
                px[1] as f32 / 255.0,
                px[2] as f32 / 255.0,
            ]
        })
        .collect();
    let input = Array4::<f32>::from_shape_vec((1, side, side, 3), normalized)
        .map_err(|err| anyhow!("failed to build input tensor: {err}"))?;

    let letterbox = Letterbox {
        scale,
        pad_x: pad_x as f32,
        pad_y: pad_y as f32,
        orig_w: image.width,
        orig_h: image.height,
    };
    Ok((input, letterbox))
}

/// Splits a flat landmark tensor into `count` points. Each point occupies
/// `stride` values of which the first three are x, y, z.
pub fn decode_landmarks(flat: &[f32], count: usize, stride: usize) -> Result<Vec<[f32; 3]>> {
    if stride < 3 {
        return Err(anyhow!("landmark stride {stride} is smaller than 3"));
    }
    if flat.len() < count * stride {
        return Err(anyhow!(
            "unexpected landmarks length: got {}, need {}",
            flat.len(),
            count * stride
        ));
    }

    Ok(flat
        .chunks_exact(stride)
        .take(count)
        .map(|chunk| [chunk[0], chunk[1], chunk[2]])
        .collect())
}

pub fn project_landmarks(raw: &[[f32; 3]], letterbox: &Letterbox) -> Vec<Landmark> {
    raw.iter()
        .map(|&[x, y, z]| {
            let (x, y) = letterbox.to_source(x, y);
            Landmark { x, y, z }
        })
        .collect()
}

/// Per-pixel argmax over NHWC class scores, sampled back at source
/// resolution. A single-channel output is treated as a foreground
/// probability.
pub fn category_mask(
    scores: &[f32],
    size: usize,
    classes: usize,
    letterbox: &Letterbox,
) -> Result<CategoryMask> {
    if classes == 0 || scores.len() < size * size * classes {
        return Err(anyhow!(
            "unexpected segmentation output: got {} values for {size}x{size}x{classes}",
            scores.len()
        ));
    }

    let width = letterbox.orig_w as usize;
    let height = letterbox.orig_h as usize;
    let mut categories = vec![0u8; width * height];
    categories
        .par_chunks_mut(width.max(1))
        .enumerate()
        .for_each(|(y, row)| {
            for (x, category) in row.iter_mut().enumerate() {
                let (mx, my) = letterbox.to_model(x as f32 + 0.5, y as f32 + 0.5);
                let mx = (mx as usize).min(size - 1);
                let my = (my as usize).min(size - 1);
                let offset = (my * size + mx) * classes;
                let pixel = &scores[offset..offset + classes];
                *category = if classes == 1 {
                    u8::from(pixel[0] > 0.5)
                } else {
                    argmax(pixel) as u8
                };
            }
        });

    Ok(CategoryMask {
        width: letterbox.orig_w,
        height: letterbox.orig_h,
        categories,
    })
}

fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
        .0
}
