//! Image preprocessing matching the training input pipeline.

use anyhow::{Context, ensure};
use image::{ImageFormat, RgbImage};
use tract_core::internal::*;

/// Source pixel pair and interpolation weight for output index `dst`,
/// with half-pixel offsets disabled (`align_corners = false`).
fn source_coordinate(dst: usize, in_size: usize, out_size: usize) -> (usize, usize, f32) {
    let scale = in_size as f32 / out_size as f32;
    let src = dst as f32 * scale;
    let low = (src.floor() as usize).min(in_size - 1);
    let high = (low + 1).min(in_size - 1);
    (low, high, src - low as f32)
}

/// Bilinear resize of an RGB image to `(height, width, 3)` floats in [0, 1].
pub fn resize_bilinear(image: &RgbImage, height: usize, width: usize) -> Tensor {
    let (in_w, in_h) = (image.width() as usize, image.height() as usize);
    let pixel = |x: usize, y: usize, c: usize| image.get_pixel(x as u32, y as u32)[c] as f32 / 255.0;
    let ys: Vec<_> = (0..height).map(|y| source_coordinate(y, in_h, height)).collect();
    let xs: Vec<_> = (0..width).map(|x| source_coordinate(x, in_w, width)).collect();
    tract_ndarray::Array3::from_shape_fn((height, width, 3), |(y, x, c)| {
        let (top, bottom, y_lerp) = ys[y];
        let (left, right, x_lerp) = xs[x];
        let top_left = pixel(left, top, c);
        let top_right = pixel(right, top, c);
        let bottom_left = pixel(left, bottom, c);
        let bottom_right = pixel(right, bottom, c);
        let top = top_left + (top_right - top_left) * x_lerp;
        let bottom = bottom_left + (bottom_right - bottom_left) * x_lerp;
        // rounding can leave the [0, 1] range by an ulp
        (top + (bottom - top) * y_lerp).clamp(0.0, 1.0)
    })
    .into_dyn()
    .into()
}

/// Decodes a JPEG buffer as RGB and turns it into a `(height, width, 3)`
/// tensor with values in [-1, 1].
pub fn preprocess_image(
    image_buffer: &[u8],
    input_height: usize,
    input_width: usize,
) -> anyhow::Result<Tensor> {
    ensure!(
        input_height > 0 && input_width > 0,
        "Invalid target size {}x{}",
        input_height,
        input_width
    );
    let image = image::load_from_memory_with_format(image_buffer, ImageFormat::Jpeg)
        .context("Decoding JPEG image")?
        .to_rgb8();
    ensure!(image.width() > 0 && image.height() > 0, "Empty image");
    let mut resized = resize_bilinear(&image, input_height, input_width);
    for v in resized.as_slice_mut::<f32>()? {
        *v = (*v - 0.5) * 2.0;
    }
    Ok(resized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::jpeg::JpegEncoder;
    use image::{ColorType, Rgb};
    use proptest::prelude::*;

    fn jpeg(image: &RgbImage) -> Vec<u8> {
        let mut buf = vec![];
        JpegEncoder::new_with_quality(&mut buf, 95)
            .encode(image.as_raw(), image.width(), image.height(), ColorType::Rgb8)
            .unwrap();
        buf
    }

    #[test]
    fn coordinates() {
        assert_eq!(source_coordinate(0, 4, 2), (0, 1, 0.0));
        assert_eq!(source_coordinate(1, 4, 2), (2, 3, 0.0));
        assert_eq!(source_coordinate(1, 2, 4), (0, 1, 0.5));
        assert_eq!(source_coordinate(3, 2, 4), (1, 1, 0.5));
    }

    #[test]
    fn upscale_interpolates() -> anyhow::Result<()> {
        let mut image = RgbImage::new(2, 1);
        image.put_pixel(0, 0, Rgb([0, 0, 0]));
        image.put_pixel(1, 0, Rgb([255, 255, 255]));
        let resized = resize_bilinear(&image, 1, 4);
        assert_eq!(resized.shape(), &[1, 4, 3]);
        let red: Vec<f32> = resized.as_slice::<f32>()?.iter().step_by(3).copied().collect();
        assert_eq!(red, vec![0.0, 0.5, 1.0, 1.0]);
        Ok(())
    }

    #[test]
    fn uniform_image() -> anyhow::Result<()> {
        let image = RgbImage::from_pixel(16, 12, Rgb([255, 255, 255]));
        let t = preprocess_image(&jpeg(&image), 8, 8)?;
        assert_eq!(t.shape(), &[8, 8, 3]);
        for v in t.as_slice::<f32>()? {
            approx::assert_abs_diff_eq!(*v, 1.0, epsilon = 0.02);
        }
        Ok(())
    }

    #[test]
    fn not_a_jpeg() {
        assert!(preprocess_image(b"definitely not a jpeg", 8, 8).is_err());
    }

    proptest! {
        #[test]
        fn output_range(w in 1u32..24, h in 1u32..24, out_h in 1usize..16, out_w in 1usize..16, seed in any::<u8>()) {
            let image = RgbImage::from_fn(w, h, |x, y| {
                let v = (x * 31 + y * 17) as u8 ^ seed;
                Rgb([v, v.wrapping_mul(3), 255 - v])
            });
            let t = preprocess_image(&jpeg(&image), out_h, out_w).unwrap();
            prop_assert_eq!(t.shape(), &[out_h, out_w, 3]);
            prop_assert!(t.as_slice::<f32>().unwrap().iter().all(|v| (-1.0..=1.0).contains(v)));
        }
    }
}
