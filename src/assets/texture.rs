//! Texture decoding for image uploads

use crate::backend::traits::{RendererError, RendererResult};
use std::path::Path;

/// Decoded RGBA8 pixels, rows top to bottom.
#[derive(Debug, Clone)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl TextureData {
    /// A 1x1 opaque white texel.
    pub fn white() -> Self {
        Self {
            width: 1,
            height: 1,
            pixels: vec![255; 4],
        }
    }
}

fn from_image(image: image::DynamicImage) -> TextureData {
    let rgba = image.to_rgba8();
    TextureData {
        width: rgba.width(),
        height: rgba.height(),
        pixels: rgba.into_raw(),
    }
}

/// Decode an encoded image (PNG, JPEG, ...) held in memory.
pub fn decode_texture(bytes: &[u8]) -> RendererResult<TextureData> {
    let image = image::load_from_memory(bytes).map_err(|e| RendererError::AssetLoad {
        path: "<memory>".into(),
        reason: e.to_string(),
    })?;
    Ok(from_image(image))
}

pub fn load_texture(path: &Path) -> RendererResult<TextureData> {
    let image = image::open(path).map_err(|e| RendererError::AssetLoad {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    Ok(from_image(image))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageOutputFormat, Rgba, RgbaImage};
    use std::io::Cursor;

    #[test]
    fn test_decode_png() {
        let mut source = RgbaImage::new(3, 2);
        source.put_pixel(2, 1, Rgba([10, 20, 30, 255]));

        let mut encoded = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(source)
            .write_to(&mut encoded, ImageOutputFormat::Png)
            .unwrap();

        let texture = decode_texture(encoded.get_ref()).unwrap();
        assert_eq!((texture.width, texture.height), (3, 2));
        assert_eq!(texture.pixels.len(), 3 * 2 * 4);
        assert_eq!(&texture.pixels[(3 + 2) * 4..][..4], &[10, 20, 30, 255]);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(decode_texture(b"not an image").is_err());
    }
}
