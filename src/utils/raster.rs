use crate::core::state::BBox;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, ImageResult, Rgba, RgbaImage};
use std::io::Cursor;

pub fn encode_png(img: &DynamicImage) -> ImageResult<Vec<u8>> {
    let mut buffer = Vec::new();
    img.write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)?;
    Ok(buffer)
}

/// Clamps a model-reported box to the image. Always at least 1x1 so a
/// degenerate box still yields a crop.
pub fn clamp_bbox(bbox: &BBox, width: u32, height: u32) -> (u32, u32, u32, u32) {
    let max_x = width.saturating_sub(1) as i64;
    let max_y = height.saturating_sub(1) as i64;
    let x = (bbox.x as i64).clamp(0, max_x) as u32;
    let y = (bbox.y as i64).clamp(0, max_y) as u32;
    let w = (bbox.w as i64).clamp(1, (width - x).max(1) as i64) as u32;
    let h = (bbox.h as i64).clamp(1, (height - y).max(1) as i64) as u32;
    (x, y, w, h)
}

/// Crops `bbox` out of an encoded page image and re-encodes it as PNG.
pub fn crop_png(page: &[u8], bbox: &BBox) -> ImageResult<Vec<u8>> {
    let img = image::load_from_memory(page)?;
    let (x, y, w, h) = clamp_bbox(bbox, img.width(), img.height());
    encode_png(&img.crop_imm(x, y, w, h))
}

pub struct Letterboxed {
    pub canvas: RgbaImage,
    /// True when the panel leaves part of the canvas uncovered.
    pub needs_fill: bool,
}

/// Shrinks the image to fit inside the target (never enlarges) and centres it
/// on a black canvas of exactly the target size.
pub fn letterbox(src: &DynamicImage, target_width: u32, target_height: u32) -> Letterboxed {
    let fitted = if src.width() > target_width || src.height() > target_height {
        src.resize(target_width, target_height, FilterType::Lanczos3)
    } else {
        src.clone()
    };
    let fitted = fitted.to_rgba8();

    let mut canvas = RgbaImage::from_pixel(target_width, target_height, Rgba([0, 0, 0, 255]));
    let x_off = (target_width - fitted.width()) / 2;
    let y_off = (target_height - fitted.height()) / 2;
    image::imageops::overlay(&mut canvas, &fitted, x_off as i64, y_off as i64);

    Letterboxed {
        needs_fill: fitted.width() < target_width || fitted.height() < target_height,
        canvas,
    }
}

/// Decodes a generated image and forces it to the target size as RGB PNG.
pub fn fit_generated(bytes: &[u8], target_width: u32, target_height: u32) -> ImageResult<Vec<u8>> {
    let img = image::load_from_memory(bytes)?;
    let img = if img.width() != target_width || img.height() != target_height {
        img.resize_exact(target_width, target_height, FilterType::Lanczos3)
    } else {
        img
    };
    encode_png(&DynamicImage::ImageRgb8(img.to_rgb8()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(width, height, Rgba([255, 255, 255, 255])))
    }

    #[test]
    fn test_clamp_bbox() {
        let inside = BBox { x: 10, y: 20, w: 30, h: 40 };
        assert_eq!(clamp_bbox(&inside, 100, 100), (10, 20, 30, 40));

        let overflowing = BBox { x: -5, y: 90, w: 500, h: 500 };
        assert_eq!(clamp_bbox(&overflowing, 100, 100), (0, 90, 100, 10));

        let degenerate = BBox { x: 200, y: 200, w: 0, h: -3 };
        assert_eq!(clamp_bbox(&degenerate, 100, 100), (99, 99, 1, 1));
    }

    #[test]
    fn test_crop_png() {
        let page = encode_png(&solid(200, 100)).unwrap();
        let crop = crop_png(&page, &BBox { x: 50, y: 10, w: 60, h: 30 }).unwrap();
        let decoded = image::load_from_memory(&crop).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (60, 30));
    }

    #[test]
    fn test_letterbox_tall_panel_needs_fill() {
        let boxed = letterbox(&solid(400, 800), 1280, 720);
        assert_eq!(boxed.canvas.dimensions(), (1280, 720));
        assert!(boxed.needs_fill);
        // Left edge is canvas, centre is panel
        assert_eq!(boxed.canvas.get_pixel(0, 360), &Rgba([0, 0, 0, 255]));
        assert_eq!(boxed.canvas.get_pixel(640, 360), &Rgba([255, 255, 255, 255]));
    }

    #[test]
    fn test_letterbox_exact_fit() {
        let boxed = letterbox(&solid(2560, 1440), 1280, 720);
        assert!(!boxed.needs_fill);
        assert_eq!(boxed.canvas.get_pixel(0, 0), &Rgba([255, 255, 255, 255]));
    }

    #[test]
    fn test_fit_generated_resizes() {
        let generated = encode_png(&solid(1024, 1024)).unwrap();
        let fitted = fit_generated(&generated, 1280, 720).unwrap();
        let decoded = image::load_from_memory(&fitted).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (1280, 720));
    }
}
