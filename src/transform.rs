use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType, GenericImageView, ImageEncoder};

use crate::gif::gif_process;
use crate::options::{Options, FMT_GIF, FMT_JPEG, FMT_JPG, FMT_PNG, FMT_WEBP};
use crate::{ProxyError, Result};

/// Default compression quality for lossy re-encodes.
pub const DEFAULT_QUALITY: i32 = 80;

/// Resample filter used for every resize.
const RESAMPLE_FILTER: FilterType = FilterType::Lanczos3;

pub fn content_type(format: &str) -> Option<&'static str> {
    match format {
        FMT_JPEG | FMT_JPG => Some("image/jpeg"),
        FMT_PNG => Some("image/png"),
        FMT_GIF => Some("image/gif"),
        FMT_WEBP => Some("image/webp"),
        _ => None,
    }
}

fn format_name(format: image::ImageFormat) -> Option<&'static str> {
    match format {
        image::ImageFormat::Jpeg => Some(FMT_JPEG),
        image::ImageFormat::Png => Some(FMT_PNG),
        image::ImageFormat::Gif => Some(FMT_GIF),
        image::ImageFormat::WebP => Some(FMT_WEBP),
        _ => None,
    }
}

fn decode(img: &[u8]) -> Result<(DynamicImage, &'static str)> {
    let guessed =
        image::guess_format(img).map_err(|e| ProxyError::Transform(e.to_string()))?;
    let format = format_name(guessed)
        .ok_or_else(|| ProxyError::Transform(format!("image format {guessed:?} not supported")))?;
    let m = image::load_from_memory_with_format(img, guessed)
        .map_err(|e| ProxyError::Transform(e.to_string()))?;
    Ok((m, format))
}

fn effective_quality(opt: &Options) -> i32 {
    if opt.quality == 0 {
        DEFAULT_QUALITY
    } else {
        opt.quality
    }
}

fn encode_jpeg(m: &DynamicImage, quality: i32) -> Result<Vec<u8>> {
    let q = quality.clamp(1, 100) as u8;
    let rgb = m.to_rgb8();
    let (w, h) = rgb.dimensions();
    let mut out = Vec::new();
    let enc = JpegEncoder::new_with_quality(&mut out, q);
    enc.write_image(rgb.as_raw(), w, h, ExtendedColorType::Rgb8)
        .map_err(|e| ProxyError::Transform(e.to_string()))?;
    Ok(out)
}

fn encode_png(m: &DynamicImage) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    m.write_to(&mut out, image::ImageFormat::Png)
        .map_err(|e| ProxyError::Transform(e.to_string()))?;
    Ok(out.into_inner())
}

fn encode_webp(m: &DynamicImage, quality: i32) -> Result<Vec<u8>> {
    let q = quality.clamp(1, 100) as f32;
    let rgb = m.to_rgb8();
    let (w, h) = rgb.dimensions();
    let encoder = webp::Encoder::from_rgb(rgb.as_raw(), w, h);
    Ok(encoder.encode(q).to_vec())
}

/// Transform raw encoded image bytes according to `opt`, returning the
/// re-encoded bytes and the final format name.
///
/// When no geometric operation is requested and the format already
/// matches (or the source is a GIF), the bytes pass through untouched.
/// Animated GIF sources keep their container no matter what format was
/// asked for; each frame is transformed individually.
pub fn transform(img: &[u8], opt: &Options) -> Result<(Vec<u8>, String)> {
    let (m, source_format) = decode(img)?;

    if !opt.transform()
        && (opt.format.is_empty() || opt.format == source_format || source_format == FMT_GIF)
    {
        return Ok((img.to_vec(), source_format.to_string()));
    }

    // GIF containers are never converted away; anything else honours the
    // requested format.
    let mut format = source_format.to_string();
    if !opt.format.is_empty() && source_format != FMT_GIF {
        format = opt.format.clone();
    }

    let out = match format.as_str() {
        FMT_GIF => gif_process(img, |frame| {
            if opt.transform() {
                transform_image(frame, opt)
            } else {
                frame
            }
        })?,
        FMT_WEBP => {
            let m = if opt.transform() {
                transform_image(m, opt)
            } else {
                m
            };
            encode_webp(&m, effective_quality(opt))?
        }
        FMT_JPEG | FMT_JPG => {
            format = FMT_JPEG.to_string();
            let m = if opt.transform() {
                transform_image(m, opt)
            } else {
                m
            };
            encode_jpeg(&m, effective_quality(opt))?
        }
        FMT_PNG => {
            let m = if opt.transform() {
                transform_image(m, opt)
            } else {
                m
            };
            encode_png(&m)?
        }
        other => {
            return Err(ProxyError::Transform(format!(
                "image format {other} not supported"
            )))
        }
    };

    Ok((out, format))
}

/// Re-encode only when the requested container differs from the source;
/// no geometric operations. Returns `None` bytes when the source can be
/// served as-is.
pub fn detect_format(img: &[u8], opt: &Options) -> Result<(Option<Vec<u8>>, String)> {
    let (m, source_format) = decode(img)?;

    if opt.format.is_empty() || opt.format == source_format || source_format == FMT_GIF {
        return Ok((None, source_format.to_string()));
    }

    let mut format = opt.format.clone();
    let out = match format.as_str() {
        FMT_GIF => gif_process(img, |frame| frame)?,
        FMT_WEBP => encode_webp(&m, effective_quality(opt))?,
        FMT_JPEG | FMT_JPG => {
            format = FMT_JPEG.to_string();
            encode_jpeg(&m, effective_quality(opt))?
        }
        FMT_PNG => encode_png(&m)?,
        other => {
            return Err(ProxyError::Transform(format!(
                "image format {other} not supported"
            )))
        }
    };

    Ok((Some(out), format))
}

/// Target dimensions for a resize, or `None` when the image should be
/// left alone.
///
/// Fractional option values are expanded against the source size first.
/// When both dimensions are given without `fit` and either exceeds the
/// source, both are scaled down together so the requested aspect ratio
/// survives without enlarging the image. Otherwise dimensions clamp to
/// the source.
fn resize_params(m: &DynamicImage, opt: &Options) -> Option<(u32, u32)> {
    let (img_w, img_h) = m.dimensions();
    let (img_w_f, img_h_f) = (f64::from(img_w), f64::from(img_h));

    let mut w = absolute_dim(opt.width, img_w_f);
    let mut h = absolute_dim(opt.height, img_h_f);

    if w > 0.0 && h > 0.0 && !opt.fit && (w > img_w_f || h > img_h_f) {
        // Requested box exceeds the source; shrink it, keeping the
        // requested aspect ratio, until it fits.
        let scale = (img_w_f / w).min(img_h_f / h);
        w = (w * scale).floor();
        h = (h * scale).floor();
    } else {
        w = w.min(img_w_f);
        h = h.min(img_h_f);
    }

    let (w, h) = (w as u32, h as u32);
    if (w == img_w || w == 0) && (h == img_h || h == 0) {
        return None;
    }
    Some((w, h))
}

/// A requested dimension in source pixels: fractions scale the source,
/// negatives mean unspecified.
fn absolute_dim(requested: f64, source: f64) -> f64 {
    if requested > 0.0 && requested < 1.0 {
        (source * requested).floor()
    } else if requested < 0.0 {
        0.0
    } else {
        requested.floor()
    }
}

/// Apply the geometric operations in order: resize, rotate, then flips.
pub(crate) fn transform_image(mut m: DynamicImage, opt: &Options) -> DynamicImage {
    if let Some((w, h)) = resize_params(&m, opt) {
        // A single-dimension request scales proportionally whether or
        // not fit was asked for; fit only matters with a full box.
        m = if w == 0 {
            m.resize(u32::MAX, h, RESAMPLE_FILTER)
        } else if h == 0 {
            m.resize(w, u32::MAX, RESAMPLE_FILTER)
        } else if opt.fit {
            m.resize(w, h, RESAMPLE_FILTER)
        } else {
            m.resize_to_fill(w, h, RESAMPLE_FILTER)
        };
    }

    // Options speak counter-clockwise; the image crate rotates clockwise.
    m = match opt.rotate {
        90 => m.rotate270(),
        180 => m.rotate180(),
        270 => m.rotate90(),
        _ => m,
    };

    if opt.flip_vertical {
        m = m.flipv();
    }
    if opt.flip_horizontal {
        m = m.fliph();
    }
    m
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(w: f64, h: f64) -> Options {
        Options {
            width: w,
            height: h,
            ..Default::default()
        }
    }

    fn gradient(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgba8(image::RgbaImage::from_fn(w, h, |x, y| {
            image::Rgba([(x % 256) as u8, (y % 256) as u8, 0, 255])
        }))
    }

    #[test]
    fn resize_params_expands_fractions() {
        let m = gradient(400, 200);
        assert_eq!(resize_params(&m, &opts(0.5, 0.5)), Some((200, 100)));
    }

    #[test]
    fn resize_params_no_enlarge_keeps_aspect() {
        let m = gradient(100, 200);
        // Box larger than the source in one dimension scales down while
        // keeping the 1:1 request ratio.
        assert_eq!(resize_params(&m, &opts(150.0, 150.0)), Some((100, 100)));
    }

    #[test]
    fn resize_params_identity_is_skipped() {
        let m = gradient(100, 200);
        assert_eq!(resize_params(&m, &opts(100.0, 200.0)), None);
        assert_eq!(resize_params(&m, &opts(0.0, 0.0)), None);
        assert_eq!(resize_params(&m, &opts(500.0, 0.0)), None);
    }

    #[test]
    fn resize_params_clamps_fit_boxes() {
        let m = gradient(100, 400);
        let o = Options {
            fit: true,
            ..opts(200.0, 200.0)
        };
        assert_eq!(resize_params(&m, &o), Some((100, 200)));
    }

    #[test]
    fn thumbnail_crops_to_exact_box() {
        let m = gradient(400, 200);
        let out = transform_image(m, &opts(100.0, 100.0));
        assert_eq!(out.dimensions(), (100, 100));
    }

    #[test]
    fn fit_preserves_aspect() {
        let m = gradient(400, 200);
        let o = Options {
            fit: true,
            ..opts(100.0, 100.0)
        };
        let out = transform_image(m, &o);
        assert_eq!(out.dimensions(), (100, 50));
    }

    #[test]
    fn single_dimension_scales_proportionally() {
        let m = gradient(400, 200);
        let out = transform_image(m, &opts(200.0, 0.0));
        assert_eq!(out.dimensions(), (200, 100));
    }

    #[test]
    fn fit_with_one_dimension_acts_like_plain_resize() {
        let m = gradient(600, 300);
        let o = Options {
            fit: true,
            ..opts(200.0, 0.0)
        };
        let out = transform_image(m, &o);
        assert_eq!(out.dimensions(), (200, 100));
    }

    #[test]
    fn rotate_composition() {
        let m = gradient(40, 20);
        let once = transform_image(
            transform_image(
                m.clone(),
                &Options {
                    rotate: 90,
                    ..Default::default()
                },
            ),
            &Options {
                rotate: 90,
                ..Default::default()
            },
        );
        let twice = transform_image(
            m,
            &Options {
                rotate: 180,
                ..Default::default()
            },
        );
        assert_eq!(once.to_rgba8().as_raw(), twice.to_rgba8().as_raw());
    }

    #[test]
    fn double_flip_is_identity() {
        let m = gradient(40, 20);
        let o = Options {
            flip_vertical: true,
            ..Default::default()
        };
        let out = transform_image(transform_image(m.clone(), &o), &o);
        assert_eq!(out.to_rgba8().as_raw(), m.to_rgba8().as_raw());
    }

    #[test]
    fn noop_transform_returns_source_bytes() {
        let png = {
            let mut buf = Cursor::new(Vec::new());
            gradient(32, 32)
                .write_to(&mut buf, image::ImageFormat::Png)
                .unwrap();
            buf.into_inner()
        };
        let (out, format) = transform(&png, &Options::default()).unwrap();
        assert_eq!(out, png);
        assert_eq!(format, FMT_PNG);
    }

    #[test]
    fn no_upscaling_of_small_sources() {
        let png = {
            let mut buf = Cursor::new(Vec::new());
            gradient(50, 40)
                .write_to(&mut buf, image::ImageFormat::Png)
                .unwrap();
            buf.into_inner()
        };
        let (out, _) = transform(&png, &opts(500.0, 400.0)).unwrap();
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!(decoded.dimensions(), (50, 40));
    }

    #[test]
    fn jpeg_reencode_honours_format_option() {
        let png = {
            let mut buf = Cursor::new(Vec::new());
            gradient(32, 32)
                .write_to(&mut buf, image::ImageFormat::Png)
                .unwrap();
            buf.into_inner()
        };
        let o = Options {
            format: "jpg".to_string(),
            ..opts(16.0, 16.0)
        };
        let (out, format) = transform(&png, &o).unwrap();
        assert_eq!(format, FMT_JPEG);
        assert_eq!(image::guess_format(&out).unwrap(), image::ImageFormat::Jpeg);
    }

    #[test]
    fn detect_format_converts_container_only() {
        let png = {
            let mut buf = Cursor::new(Vec::new());
            gradient(64, 48)
                .write_to(&mut buf, image::ImageFormat::Png)
                .unwrap();
            buf.into_inner()
        };

        let (none, format) = detect_format(&png, &Options::default()).unwrap();
        assert!(none.is_none());
        assert_eq!(format, FMT_PNG);

        let o = Options {
            format: FMT_WEBP.to_string(),
            ..Default::default()
        };
        let (some, format) = detect_format(&png, &o).unwrap();
        assert_eq!(format, FMT_WEBP);
        let decoded = image::load_from_memory(&some.unwrap()).unwrap();
        assert_eq!(decoded.dimensions(), (64, 48));
    }

    #[test]
    fn undecodable_bytes_error() {
        assert!(transform(b"not an image", &Options::default()).is_err());
    }
}
