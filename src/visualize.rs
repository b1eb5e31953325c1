//! Rendering of detection and segmentation results

use crate::{
    error::{NennError, Result},
    models::det::Detection,
};
use image::{GrayImage, Rgb, RgbImage};
use imageproc::{drawing::draw_hollow_rect_mut, rect::Rect};

/// Deterministic palette with `num_classes` entries
///
/// Spreads the bits of each class id over the high bits of the three
/// channels, so entry 0 is black and neighbouring ids get distinct colours.
#[must_use]
pub fn color_map(num_classes: usize) -> Vec<[u8; 3]> {
    (0..num_classes).map(palette_entry).collect()
}

/// Single entry of [`color_map`]
#[must_use]
pub fn palette_entry(class_id: usize) -> [u8; 3] {
    let mut color = [0_u8; 3];
    let mut label = class_id;
    let mut bit = 0;
    while label > 0 && bit < 8 {
        for (channel, value) in color.iter_mut().enumerate() {
            *value |= (((label >> channel) & 1) as u8) << (7 - bit);
        }
        bit += 1;
        label >>= 3;
    }
    color
}

/// Box colour for a class id, skipping the black palette entry
#[must_use]
pub fn class_color(class_id: i64) -> Rgb<u8> {
    let index = usize::try_from(class_id).unwrap_or(0).saturating_add(1);
    Rgb(palette_entry(index))
}

/// Draw a hollow rectangle per detection, `thickness` pixels wide
pub fn draw_detections(image: &mut RgbImage, detections: &[Detection], thickness: u32) {
    let thickness = thickness.max(1);
    for detection in detections {
        let color = class_color(detection.class_id);
        let bbox = &detection.bbox;

        // Grow inwards so the outline stays inside the box
        for inset in 0..thickness {
            let width = bbox.width() as i64 - 2 * i64::from(inset);
            let height = bbox.height() as i64 - 2 * i64::from(inset);
            if width <= 0 || height <= 0 {
                break;
            }
            let rect = Rect::at(bbox.x1 as i32 + inset as i32, bbox.y1 as i32 + inset as i32)
                .of_size(width as u32, height as u32);
            draw_hollow_rect_mut(image, rect, color);
        }
    }
}

/// Overlay a class label map on `image`
///
/// `weight` is the share of the label colour in each output pixel and is
/// clamped to `[0, 1]`.
///
/// # Errors
/// - The label map and the image differ in size
pub fn blend_label_map(image: &RgbImage, label_map: &GrayImage, weight: f32) -> Result<RgbImage> {
    if image.dimensions() != label_map.dimensions() {
        return Err(NennError::postprocess(format!(
            "Label map is {}x{} but the image is {}x{}",
            label_map.width(),
            label_map.height(),
            image.width(),
            image.height()
        )));
    }

    let weight = weight.clamp(0.0, 1.0);
    let palette = color_map(256);
    let mut blended = image.clone();
    for (pixel, label) in blended.pixels_mut().zip(label_map.pixels()) {
        let color = palette[usize::from(label.0[0])];
        for (value, overlay) in pixel.0.iter_mut().zip(color) {
            let mixed = f32::from(*value) * (1.0 - weight) + f32::from(overlay) * weight;
            *value = mixed.round().clamp(0.0, 255.0) as u8;
        }
    }
    Ok(blended)
}
