//! Letterbox preprocessing - aspect-preserving resize into the square model input

use image::imageops::{self, FilterType};
use image::DynamicImage;
use ndarray::Array4;

use super::BoundingBox;

/// Gray used by Ultralytics for letterbox padding
pub const PAD_VALUE: u8 = 114;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub input_size: u32,
    pub scale: f32,
    pub new_width: u32,
    pub new_height: u32,
    pub pad_x: u32,
    pub pad_y: u32,
    pub orig_width: u32,
    pub orig_height: u32,
}

impl Letterbox {
    pub fn fit(orig_width: u32, orig_height: u32, input_size: u32) -> Self {
        let side = input_size as f32;
        let scale = (side / orig_width.max(1) as f32).min(side / orig_height.max(1) as f32);
        let new_width = ((orig_width as f32 * scale).round() as u32).clamp(1, input_size);
        let new_height = ((orig_height as f32 * scale).round() as u32).clamp(1, input_size);

        Self {
            input_size,
            scale,
            new_width,
            new_height,
            pad_x: (input_size - new_width) / 2,
            pad_y: (input_size - new_height) / 2,
            orig_width,
            orig_height,
        }
    }

    /// NCHW f32 tensor in [0, 1]
    pub fn to_tensor(&self, image: &DynamicImage) -> Array4<f32> {
        let rgb = image.to_rgb8();
        let resized = imageops::resize(&rgb, self.new_width, self.new_height, FilterType::Triangle);

        let side = self.input_size as usize;
        let mut tensor = Array4::<f32>::from_elem((1, 3, side, side), PAD_VALUE as f32 / 255.0);

        for (x, y, pixel) in resized.enumerate_pixels() {
            let (tx, ty) = ((x + self.pad_x) as usize, (y + self.pad_y) as usize);
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = pixel[c] as f32 / 255.0;
            }
        }

        tensor
    }

    /// Maps corners in model-input pixels back to the original image, clipped to it
    pub fn restore(&self, x1: f32, y1: f32, x2: f32, y2: f32) -> BoundingBox {
        let unmap_x = |v: f32| (v - self.pad_x as f32) / self.scale;
        let unmap_y = |v: f32| (v - self.pad_y as f32) / self.scale;

        BoundingBox::from_corners(unmap_x(x1), unmap_y(y1), unmap_x(x2), unmap_y(y2))
            .clamped(self.orig_width, self.orig_height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_fit_landscape() {
        let lb = Letterbox::fit(1280, 640, 640);
        assert_eq!(lb.scale, 0.5);
        assert_eq!((lb.new_width, lb.new_height), (640, 320));
        assert_eq!((lb.pad_x, lb.pad_y), (0, 160));
    }

    #[test]
    fn test_fit_portrait_upscale() {
        let lb = Letterbox::fit(100, 200, 640);
        assert_eq!(lb.scale, 3.2);
        assert_eq!((lb.new_width, lb.new_height), (320, 640));
        assert_eq!((lb.pad_x, lb.pad_y), (160, 0));
    }

    #[test]
    fn test_restore_inverts_fit() {
        let lb = Letterbox::fit(1280, 640, 640);
        // (100, 50)-(300, 250) in the original lands at (50, 185)-(150, 285) in the input
        let bbox = lb.restore(50.0, 185.0, 150.0, 285.0);
        assert_eq!(bbox, BoundingBox { x: 100.0, y: 50.0, width: 200.0, height: 200.0 });
    }

    #[test]
    fn test_restore_clamps_to_image() {
        let lb = Letterbox::fit(1280, 640, 640);
        let bbox = lb.restore(-20.0, 100.0, 700.0, 600.0);
        assert_eq!(bbox.x, 0.0);
        assert_eq!(bbox.y, 0.0);
        assert_eq!(bbox.x2(), 1280.0);
        assert_eq!(bbox.y2(), 640.0);
    }

    #[test]
    fn test_tensor_layout_and_padding() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 32, Rgb([255, 0, 0])));
        let lb = Letterbox::fit(64, 32, 64);
        let tensor = lb.to_tensor(&image);

        assert_eq!(tensor.shape(), &[1, 3, 64, 64]);
        // padding band on top
        assert!((tensor[[0, 0, 0, 0]] - PAD_VALUE as f32 / 255.0).abs() < 1e-6);
        // image content in the middle
        assert_eq!(tensor[[0, 0, 32, 32]], 1.0);
        assert_eq!(tensor[[0, 1, 32, 32]], 0.0);
    }
}
