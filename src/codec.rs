use std::fs::{self, File};
use std::io::{BufWriter, Cursor, Write};
use std::path::Path;

use image::codecs::bmp::BmpEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::tga::TgaEncoder;
use image::{DynamicImage, ImageEncoder, RgbaImage};
use tracing::debug;

use crate::error::CodecError;
use crate::pixel::{PixelBuffer, Rgba};

/// Loading and saving of flat images. Buffers on the engine side are
/// premultiplied; files hold straight alpha.
pub trait ImageCodec {
    fn load(&self, path: &Path) -> Result<PixelBuffer, CodecError>;
    fn save(&self, path: &Path, buffer: &PixelBuffer) -> Result<(), CodecError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveFormat {
    Png,
    Jpeg,
    Bmp,
    Tga,
}

impl SaveFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "png" => Some(SaveFormat::Png),
            "jpg" | "jpeg" => Some(SaveFormat::Jpeg),
            "bmp" => Some(SaveFormat::Bmp),
            "tga" => Some(SaveFormat::Tga),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(SaveFormat::from_extension)
    }

    pub fn extension(&self) -> &'static str {
        match self {
            SaveFormat::Png => "png",
            SaveFormat::Jpeg => "jpg",
            SaveFormat::Bmp => "bmp",
            SaveFormat::Tga => "tga",
        }
    }
}

/// Codec backed by the `image` crate. Paths without an extension save as
/// PNG. Loading accepts anything the crate decodes, WebP included.
#[derive(Debug, Clone, Copy)]
pub struct ImageCrateCodec {
    pub jpeg_quality: u8,
}

impl Default for ImageCrateCodec {
    fn default() -> Self {
        Self { jpeg_quality: 90 }
    }
}

impl ImageCodec for ImageCrateCodec {
    fn load(&self, path: &Path) -> Result<PixelBuffer, CodecError> {
        let rgba = image::open(path)?.to_rgba8();
        debug!(path = %path.display(), width = rgba.width(), height = rgba.height(), "image loaded");
        from_straight_rgba(rgba)
    }

    fn save(&self, path: &Path, buffer: &PixelBuffer) -> Result<(), CodecError> {
        let format = match path.extension().and_then(|e| e.to_str()) {
            None => SaveFormat::Png,
            Some(ext) => {
                SaveFormat::from_extension(ext).ok_or_else(|| CodecError::UnsupportedFormat(ext.to_string()))?
            }
        };
        // Encode before touching the target
        let bytes = encode_bytes(buffer, format, self.jpeg_quality)?;
        write_replacing(path, &bytes)?;
        debug!(path = %path.display(), ?format, "image saved");
        Ok(())
    }
}

/// Write `bytes` to a sibling temp file, then rename it over `path`.
fn write_replacing(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("image");
    let tmp = path.with_file_name(format!(".{name}.{}.tmp", uuid::Uuid::new_v4()));
    let written = File::create(&tmp).and_then(|file| {
        let mut writer = BufWriter::new(file);
        writer.write_all(bytes)?;
        writer.flush()
    });
    match written.and_then(|_| fs::rename(&tmp, path)) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            Err(e)
        }
    }
}

/// Decode an in-memory image file into a premultiplied buffer.
pub fn decode_bytes(bytes: &[u8]) -> Result<PixelBuffer, CodecError> {
    from_straight_rgba(image::load_from_memory(bytes)?.to_rgba8())
}

/// Encode `buffer` as `format` into a byte vector.
pub fn encode_bytes(buffer: &PixelBuffer, format: SaveFormat, jpeg_quality: u8) -> Result<Vec<u8>, CodecError> {
    let mut out = Cursor::new(Vec::new());
    encode(buffer, format, jpeg_quality, &mut out)?;
    Ok(out.into_inner())
}

fn from_straight_rgba(rgba: RgbaImage) -> Result<PixelBuffer, CodecError> {
    let (width, height) = rgba.dimensions();
    let mut data = rgba.into_raw();
    for px in data.chunks_exact_mut(4) {
        let p = Rgba([px[0], px[1], px[2], px[3]]).premultiply();
        px.copy_from_slice(&p.0);
    }
    PixelBuffer::from_raw(width, height, data).map_err(|_| CodecError::InvalidSize { width, height })
}

fn to_straight_rgba(buffer: &PixelBuffer) -> Result<RgbaImage, CodecError> {
    let mut data = buffer.pixels().to_vec();
    for px in data.chunks_exact_mut(4) {
        let p = Rgba([px[0], px[1], px[2], px[3]]).unpremultiply();
        px.copy_from_slice(&p.0);
    }
    RgbaImage::from_raw(buffer.width(), buffer.height(), data).ok_or(CodecError::InvalidSize {
        width: buffer.width(),
        height: buffer.height(),
    })
}

fn encode<W: Write>(
    buffer: &PixelBuffer,
    format: SaveFormat,
    jpeg_quality: u8,
    writer: &mut W,
) -> Result<(), CodecError> {
    if buffer.is_empty() {
        return Err(CodecError::InvalidSize {
            width: buffer.width(),
            height: buffer.height(),
        });
    }
    let image = to_straight_rgba(buffer)?;
    match format {
        SaveFormat::Png => {
            PngEncoder::new(writer).write_image(
                image.as_raw(),
                image.width(),
                image.height(),
                image::ColorType::Rgba8,
            )?;
        }
        SaveFormat::Jpeg => {
            // JPEG has no alpha channel
            let rgb = DynamicImage::ImageRgba8(image).to_rgb8();
            JpegEncoder::new_with_quality(writer, jpeg_quality).write_image(
                rgb.as_raw(),
                rgb.width(),
                rgb.height(),
                image::ColorType::Rgb8,
            )?;
        }
        SaveFormat::Bmp => {
            BmpEncoder::new(writer).write_image(
                image.as_raw(),
                image.width(),
                image.height(),
                image::ColorType::Rgba8,
            )?;
        }
        SaveFormat::Tga => {
            TgaEncoder::new(writer).write_image(
                image.as_raw(),
                image.width(),
                image.height(),
                image::ColorType::Rgba8,
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn png_keeps_translucent_pixels() {
        let mut buf = PixelBuffer::new(3, 2);
        buf.set(0, 0, Rgba::new(255, 0, 0, 255)).unwrap();
        buf.set(1, 0, Rgba::new(255, 255, 255, 128).premultiply()).unwrap();
        let bytes = encode_bytes(&buf, SaveFormat::Png, 90).unwrap();
        let back = decode_bytes(&bytes).unwrap();
        assert_eq!(back.width(), 3);
        assert_eq!(back.get(0, 0), Some(Rgba::new(255, 0, 0, 255)));
        assert_eq!(back.get(2, 1), Some(Rgba::TRANSPARENT));
        let half = back.get(1, 0).unwrap();
        assert_eq!(half.a(), 128);
        assert!(half.r().abs_diff(128) <= 1);
    }

    #[test]
    fn empty_buffer_is_rejected() {
        let err = encode_bytes(&PixelBuffer::new(0, 0), SaveFormat::Png, 90).unwrap_err();
        assert!(matches!(err, CodecError::InvalidSize { .. }));
    }

    #[test]
    fn format_follows_extension() {
        assert_eq!(SaveFormat::from_path(Path::new("a/b.JPEG")), Some(SaveFormat::Jpeg));
        assert_eq!(SaveFormat::from_path(Path::new("out.tga")), Some(SaveFormat::Tga));
        assert_eq!(SaveFormat::from_path(Path::new("noext")), None);
    }

    #[test]
    fn save_then_load_from_disk() {
        let dir = std::env::temp_dir().join(format!("layerforge-codec-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("flat.png");
        let codec = ImageCrateCodec::default();
        let buf = PixelBuffer::filled(4, 4, Rgba::new(10, 200, 30, 255));
        codec.save(&path, &buf).unwrap();
        assert_eq!(codec.load(&path).unwrap(), buf);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn unknown_extension_is_not_written() {
        let path = std::env::temp_dir().join(format!("layerforge-{}.xyz", uuid::Uuid::new_v4()));
        let err = ImageCrateCodec::default().save(&path, &PixelBuffer::new(1, 1)).unwrap_err();
        assert!(matches!(err, CodecError::UnsupportedFormat(ext) if ext == "xyz"));
        assert!(!path.exists());
    }

    #[test]
    fn failed_save_keeps_existing_file() {
        let dir = std::env::temp_dir().join(format!("layerforge-codec-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("keep.png");
        let codec = ImageCrateCodec::default();
        codec.save(&path, &PixelBuffer::filled(2, 2, Rgba::WHITE)).unwrap();
        let original = std::fs::read(&path).unwrap();

        let err = codec.save(&path, &PixelBuffer::new(0, 0)).unwrap_err();
        assert!(matches!(err, CodecError::InvalidSize { .. }));
        assert_eq!(std::fs::read(&path).unwrap(), original);
        // No temp files left behind
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 1);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_file_is_an_error() {
        let codec = ImageCrateCodec::default();
        assert!(codec.load(Path::new("/definitely/not/here.png")).is_err());
    }
}
