//! Still-image derivation: decode, orientation fix, three JPEG renditions.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::metadata::Orientation;
use image::{DynamicImage, GenericImageView, ImageDecoder, ImageReader, Rgb, RgbImage};

use crate::error::DeriveError;
use crate::layout::{Dimensions, Variant};

/// The largest variant doubles as the download target
pub const LARGEST_QUALITY: u8 = 100;

const RESIZE_FILTER: FilterType = FilterType::Lanczos3;

/// Configurable JPEG qualities (0-100)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JpegQualities {
    pub medium: u8,
    pub thumbnail: u8,
}

impl Default for JpegQualities {
    fn default() -> Self {
        Self {
            medium: 100,
            thumbnail: 85,
        }
    }
}

/// One encoded rendition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedVariant {
    pub variant: Variant,
    pub width: u32,
    pub height: u32,
    pub bytes: Vec<u8>,
}

impl EncodedVariant {
    pub fn dimensions(&self) -> Dimensions {
        Dimensions {
            width: self.width,
            height: self.height,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedImages {
    pub largest: EncodedVariant,
    pub medium: EncodedVariant,
    pub thumbnail: EncodedVariant,
}

impl DerivedImages {
    pub fn iter(&self) -> impl Iterator<Item = &EncodedVariant> {
        [&self.largest, &self.medium, &self.thumbnail].into_iter()
    }
}

/// Decode and derive all three variants from raw source bytes
pub fn derive(source: &[u8], qualities: JpegQualities) -> Result<DerivedImages, DeriveError> {
    let image = decode(source)?;
    derive_from_image(&image, qualities)
}

/// Derive all three variants from an already decoded, upright image
pub fn derive_from_image(
    image: &DynamicImage,
    qualities: JpegQualities,
) -> Result<DerivedImages, DeriveError> {
    let largest = encode_jpeg(
        fit_within(image, Variant::Largest),
        Variant::Largest,
        LARGEST_QUALITY,
    )?;
    let medium = encode_jpeg(
        fit_within(image, Variant::Medium),
        Variant::Medium,
        qualities.medium,
    )?;
    let thumbnail = thumbnail(image, qualities.thumbnail)?;

    Ok(DerivedImages {
        largest,
        medium,
        thumbnail,
    })
}

/// Square grid thumbnail: scale to cover the box, then center-crop to it
pub fn thumbnail(image: &DynamicImage, quality: u8) -> Result<EncodedVariant, DeriveError> {
    let (w, h) = Variant::Thumbnail.bounds();
    let cropped = image.resize_to_fill(w, h, RESIZE_FILTER);
    encode_jpeg(cropped, Variant::Thumbnail, quality)
}

/// Decode bytes by sniffing their content, then apply EXIF orientation so
/// the pixel data is upright
pub fn decode(source: &[u8]) -> Result<DynamicImage, DeriveError> {
    let reader = ImageReader::new(Cursor::new(source))
        .with_guessed_format()
        .map_err(|e| DeriveError::Decode(e.to_string()))?;

    if reader.format().is_none() {
        return Err(DeriveError::Decode("unrecognized image format".to_string()));
    }

    let mut decoder = reader
        .into_decoder()
        .map_err(|e| DeriveError::Decode(e.to_string()))?;
    let orientation = decoder.orientation().unwrap_or(Orientation::NoTransforms);
    let image =
        DynamicImage::from_decoder(decoder).map_err(|e| DeriveError::Decode(e.to_string()))?;

    Ok(normalize_orientation(image, orientation))
}

pub fn normalize_orientation(mut image: DynamicImage, orientation: Orientation) -> DynamicImage {
    if orientation != Orientation::NoTransforms {
        image.apply_orientation(orientation);
    }
    image
}

/// Scale down to fit the variant's box keeping aspect ratio; never upscale
fn fit_within(image: &DynamicImage, variant: Variant) -> DynamicImage {
    let (max_w, max_h) = variant.bounds();
    let (w, h) = image.dimensions();
    if w <= max_w && h <= max_h {
        image.clone()
    } else {
        image.resize(max_w, max_h, RESIZE_FILTER)
    }
}

/// Drop alpha by compositing onto white; JPEG has no transparency
fn flatten(image: &DynamicImage) -> RgbImage {
    if !image.color().has_alpha() {
        return image.to_rgb8();
    }

    let rgba = image.to_rgba8();
    let (w, h) = rgba.dimensions();
    RgbImage::from_fn(w, h, |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let a = a as u32;
        let blend = |c: u8| ((c as u32 * a + 255 * (255 - a) + 127) / 255) as u8;
        Rgb([blend(r), blend(g), blend(b)])
    })
}

fn encode_jpeg(
    image: DynamicImage,
    variant: Variant,
    quality: u8,
) -> Result<EncodedVariant, DeriveError> {
    let rgb = flatten(&image);
    let (width, height) = rgb.dimensions();

    let mut bytes = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut bytes, quality.clamp(1, 100));
    encoder
        .encode_image(&rgb)
        .map_err(|e| DeriveError::Encode {
            variant: variant.dir_name(),
            reason: e.to_string(),
        })?;

    Ok(EncodedVariant {
        variant,
        width,
        height,
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgba, RgbaImage};

    fn gradient(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(w, h, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        }))
    }

    fn encode_as(image: &DynamicImage, format: ImageFormat) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, format).unwrap();
        out.into_inner()
    }

    fn decoded_dims(variant: &EncodedVariant) -> (u32, u32) {
        image::load_from_memory(&variant.bytes).unwrap().dimensions()
    }

    fn assert_aspect_preserved(src: (u32, u32), out: (u32, u32)) {
        let expected = src.0 as f64 / src.1 as f64;
        let actual = out.0 as f64 / out.1 as f64;
        // one pixel of rounding on the short side
        let tolerance = expected / out.1.min(out.0) as f64 + 0.01;
        assert!(
            (expected - actual).abs() <= tolerance,
            "aspect {} vs {} for {:?} -> {:?}",
            expected,
            actual,
            src,
            out
        );
    }

    #[test]
    fn test_variants_fit_their_bounds() {
        for (w, h) in [(3000, 600), (700, 2500), (2000, 1500)] {
            let source = encode_as(&gradient(w, h), ImageFormat::Png);
            let derived = derive(&source, JpegQualities::default()).unwrap();

            for variant in [&derived.largest, &derived.medium] {
                let (max_w, max_h) = variant.variant.bounds();
                let dims = decoded_dims(variant);
                assert_eq!(dims, (variant.width, variant.height));
                assert!(dims.0 <= max_w && dims.1 <= max_h, "{:?} exceeds {:?}", dims, variant.variant);
                assert_aspect_preserved((w, h), dims);
            }
            assert_eq!(decoded_dims(&derived.thumbnail), (400, 400));
        }
    }

    #[test]
    fn test_small_sources_are_not_upscaled() {
        let source = encode_as(&gradient(320, 200), ImageFormat::Png);
        let derived = derive(&source, JpegQualities::default()).unwrap();

        assert_eq!((derived.largest.width, derived.largest.height), (320, 200));
        assert_eq!((derived.medium.width, derived.medium.height), (320, 200));
        // the grid thumbnail is always exactly square
        assert_eq!((derived.thumbnail.width, derived.thumbnail.height), (400, 400));
    }

    #[test]
    fn test_derive_is_deterministic() {
        for format in [ImageFormat::Png, ImageFormat::Jpeg, ImageFormat::Bmp] {
            let source = encode_as(&gradient(1000, 2100), format);
            let first = derive(&source, JpegQualities::default()).unwrap();
            let second = derive(&source, JpegQualities::default()).unwrap();
            assert_eq!(first, second, "{:?}", format);
        }
    }

    #[test]
    fn test_format_is_sniffed_not_trusted() {
        // PNG bytes; whatever the upload was called, decoding goes by content
        let source = encode_as(&gradient(64, 48), ImageFormat::Png);
        let image = decode(&source).unwrap();
        assert_eq!(image.dimensions(), (64, 48));
    }

    #[test]
    fn test_garbage_is_a_decode_error() {
        let err = derive(b"definitely not an image", JpegQualities::default()).unwrap_err();
        assert!(matches!(err, DeriveError::Decode(_)), "{:?}", err);

        // valid magic, truncated body
        let mut truncated = encode_as(&gradient(64, 64), ImageFormat::Png);
        truncated.truncate(40);
        assert!(matches!(decode(&truncated), Err(DeriveError::Decode(_))));
    }

    #[test]
    fn test_orientation_is_applied_before_resize() {
        let upright = normalize_orientation(gradient(200, 100), Orientation::Rotate90);
        assert_eq!(upright.dimensions(), (100, 200));

        let untouched = normalize_orientation(gradient(200, 100), Orientation::NoTransforms);
        assert_eq!(untouched.dimensions(), (200, 100));
    }

    /// JPEG bytes carrying an APP1 Exif block with the given orientation tag
    fn jpeg_with_orientation(image: &DynamicImage, orientation: u8) -> Vec<u8> {
        let plain = encode_as(image, ImageFormat::Jpeg);
        assert_eq!(&plain[..2], &[0xFF, 0xD8]);

        let mut payload = b"Exif\0\0".to_vec();
        // big-endian TIFF header, first IFD at offset 8
        payload.extend_from_slice(&[b'M', b'M', 0x00, 0x2A, 0x00, 0x00, 0x00, 0x08]);
        // one entry: 0x0112 Orientation, SHORT, count 1
        payload.extend_from_slice(&[0x00, 0x01]);
        payload.extend_from_slice(&[0x01, 0x12, 0x00, 0x03, 0x00, 0x00, 0x00, 0x01]);
        payload.extend_from_slice(&[0x00, orientation, 0x00, 0x00]);
        payload.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);

        let len = (payload.len() + 2) as u16;
        let mut out = plain[..2].to_vec();
        out.extend_from_slice(&[0xFF, 0xE1]);
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&payload);
        out.extend_from_slice(&plain[2..]);
        out
    }

    #[test]
    fn test_exif_orientation_is_read_from_jpeg_bytes() {
        let source = jpeg_with_orientation(&gradient(200, 100), 6);
        assert_eq!(decode(&source).unwrap().dimensions(), (100, 200));

        let derived = derive(&source, JpegQualities::default()).unwrap();
        assert_eq!((derived.largest.width, derived.largest.height), (100, 200));
        assert_eq!(decoded_dims(&derived.medium), (100, 200));

        // orientation 1 leaves the pixels as stored
        let upright = jpeg_with_orientation(&gradient(200, 100), 1);
        assert_eq!(decode(&upright).unwrap().dimensions(), (200, 100));
    }

    #[test]
    fn test_transparency_flattens_to_white() {
        let rgba = DynamicImage::ImageRgba8(RgbaImage::from_fn(8, 8, |x, _| {
            if x < 4 {
                Rgba([0, 0, 0, 0])
            } else {
                Rgba([10, 20, 30, 255])
            }
        }));
        let flat = flatten(&rgba);
        assert_eq!(flat.get_pixel(0, 0).0, [255, 255, 255]);
        assert_eq!(flat.get_pixel(7, 7).0, [10, 20, 30]);

        // and the full path encodes without complaining about alpha
        let source = encode_as(&rgba, ImageFormat::Png);
        assert!(derive(&source, JpegQualities::default()).is_ok());
    }

    #[test]
    fn test_quality_settings_are_independent() {
        let source = encode_as(&gradient(800, 600), ImageFormat::Png);
        let low = derive(&source, JpegQualities { medium: 10, thumbnail: 0 }).unwrap();
        let high = derive(&source, JpegQualities { medium: 95, thumbnail: 95 }).unwrap();

        assert!(low.medium.bytes.len() < high.medium.bytes.len());
        assert!(low.thumbnail.bytes.len() < high.thumbnail.bytes.len());
        // largest ignores the knobs
        assert_eq!(low.largest, high.largest);
    }
}
