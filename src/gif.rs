use std::borrow::Cow;
use std::io::Cursor;

use gif::{ColorOutput, DecodeOptions, DisposalMethod, Encoder, Frame, Repeat};
use image::{DynamicImage, GenericImageView, Rgba, RgbaImage};

use crate::{ProxyError, Result};

/// One decoded frame, kept in indexed form so the original palette
/// survives the round trip.
struct RawFrame {
    buffer: Vec<u8>,
    left: u32,
    top: u32,
    width: u32,
    height: u32,
    palette: Vec<u8>,
    transparent: Option<u8>,
    delay: u16,
    dispose: DisposalMethod,
}

/// Re-encode a GIF, applying `transform` to every composited frame.
///
/// Frames are deltas over a running canvas: each is drawn over the
/// canvas at its offset (honouring transparency), the composite is
/// transformed, and the result is requantized to the frame's own palette
/// with Floyd-Steinberg dithering. `Background` disposal resets the
/// canvas, `Previous` restores the pre-frame canvas.
pub fn gif_process<F>(data: &[u8], transform: F) -> Result<Vec<u8>>
where
    F: Fn(DynamicImage) -> DynamicImage,
{
    let gif_err = |e: gif::DecodingError| ProxyError::Transform(e.to_string());

    let mut options = DecodeOptions::new();
    options.set_color_output(ColorOutput::Indexed);
    let mut decoder = options.read_info(Cursor::new(data)).map_err(gif_err)?;
    let global_palette: Vec<u8> = decoder.global_palette().unwrap_or(&[]).to_vec();

    let mut frames = Vec::new();
    while let Some(frame) = decoder.read_next_frame().map_err(gif_err)? {
        frames.push(RawFrame {
            buffer: frame.buffer.to_vec(),
            left: u32::from(frame.left),
            top: u32::from(frame.top),
            width: u32::from(frame.width),
            height: u32::from(frame.height),
            palette: frame
                .palette
                .clone()
                .unwrap_or_else(|| global_palette.clone()),
            transparent: frame.transparent,
            delay: frame.delay,
            dispose: frame.dispose,
        });
    }
    let Some(first) = frames.first() else {
        return Err(ProxyError::Transform("gif has no frames".to_string()));
    };

    // The canvas tracks the first frame's bounds; later frames draw
    // their deltas over it.
    let (canvas_w, canvas_h) = (first.width, first.height);
    let mut canvas = RgbaImage::new(canvas_w, canvas_h);

    // Transform every composited frame first; all outputs share the
    // same dimensions, which the encoder needs up front.
    let mut out_frames: Vec<Frame<'static>> = Vec::with_capacity(frames.len());
    let mut out_size = (0u16, 0u16);
    for frame in &frames {
        let previous = canvas.clone();
        draw_over(&mut canvas, frame);

        let transformed = transform(DynamicImage::ImageRgba8(canvas.clone()));
        let (out_w, out_h) = transformed.dimensions();
        out_size = (
            u16::try_from(out_w).unwrap_or(u16::MAX),
            u16::try_from(out_h).unwrap_or(u16::MAX),
        );

        let indexed = quantize_floyd_steinberg(
            &transformed.to_rgba8(),
            &frame.palette,
            frame.transparent,
        );
        let mut out_frame = Frame::default();
        out_frame.width = out_size.0;
        out_frame.height = out_size.1;
        out_frame.buffer = Cow::Owned(indexed);
        out_frame.palette = Some(frame.palette.clone());
        out_frame.transparent = frame.transparent;
        out_frame.delay = frame.delay;
        out_frame.dispose = frame.dispose;
        out_frames.push(out_frame);

        match frame.dispose {
            DisposalMethod::Background => {
                canvas = RgbaImage::new(canvas_w, canvas_h);
            }
            DisposalMethod::Previous => {
                canvas = previous;
            }
            _ => {}
        }
    }

    let enc_err = |e: gif::EncodingError| ProxyError::Transform(e.to_string());
    let mut out = Vec::new();
    {
        let mut encoder = Encoder::new(&mut out, out_size.0, out_size.1, &[]).map_err(enc_err)?;
        encoder.set_repeat(Repeat::Infinite).map_err(enc_err)?;
        for out_frame in &out_frames {
            encoder.write_frame(out_frame).map_err(enc_err)?;
        }
    }
    Ok(out)
}

/// Draw an indexed frame over the canvas at its offset, clipping to the
/// canvas bounds and skipping transparent pixels.
fn draw_over(canvas: &mut RgbaImage, frame: &RawFrame) {
    let (canvas_w, canvas_h) = canvas.dimensions();
    for y in 0..frame.height {
        let cy = frame.top + y;
        if cy >= canvas_h {
            break;
        }
        for x in 0..frame.width {
            let cx = frame.left + x;
            if cx >= canvas_w {
                break;
            }
            let idx = frame.buffer[(y * frame.width + x) as usize];
            if frame.transparent == Some(idx) {
                continue;
            }
            let p = usize::from(idx) * 3;
            if p + 2 >= frame.palette.len() {
                continue;
            }
            canvas.put_pixel(
                cx,
                cy,
                Rgba([frame.palette[p], frame.palette[p + 1], frame.palette[p + 2], 255]),
            );
        }
    }
}

/// Map an RGBA image onto a fixed RGB palette with Floyd-Steinberg
/// error diffusion. Mostly-transparent pixels map straight to the
/// transparent index when the frame has one.
fn quantize_floyd_steinberg(
    img: &RgbaImage,
    palette: &[u8],
    transparent: Option<u8>,
) -> Vec<u8> {
    let (w, h) = img.dimensions();
    let (w, h) = (w as usize, h as usize);
    let mut pixels: Vec<[f32; 3]> = img
        .pixels()
        .map(|p| [f32::from(p[0]), f32::from(p[1]), f32::from(p[2])])
        .collect();
    let mut indexed = vec![0u8; w * h];

    for y in 0..h {
        for x in 0..w {
            let pos = y * w + x;
            let alpha = img.get_pixel(x as u32, y as u32)[3];
            if alpha < 128 {
                if let Some(t) = transparent {
                    indexed[pos] = t;
                    continue;
                }
            }

            let old = pixels[pos];
            let idx = nearest_color(&old, palette, transparent);
            indexed[pos] = idx;

            let p = usize::from(idx) * 3;
            let err = [
                old[0] - f32::from(palette[p]),
                old[1] - f32::from(palette[p + 1]),
                old[2] - f32::from(palette[p + 2]),
            ];
            let mut diffuse = |dx: isize, dy: isize, weight: f32| {
                let nx = x as isize + dx;
                let ny = y as isize + dy;
                if nx < 0 || nx >= w as isize || ny >= h as isize {
                    return;
                }
                let npos = ny as usize * w + nx as usize;
                for c in 0..3 {
                    pixels[npos][c] += err[c] * weight;
                }
            };
            diffuse(1, 0, 7.0 / 16.0);
            diffuse(-1, 1, 3.0 / 16.0);
            diffuse(0, 1, 5.0 / 16.0);
            diffuse(1, 1, 1.0 / 16.0);
        }
    }
    indexed
}

fn nearest_color(rgb: &[f32; 3], palette: &[u8], transparent: Option<u8>) -> u8 {
    let mut best = 0u8;
    let mut best_dist = f32::MAX;
    for (i, color) in palette.chunks_exact(3).enumerate() {
        if transparent == Some(i as u8) {
            continue;
        }
        let dr = rgb[0] - f32::from(color[0]);
        let dg = rgb[1] - f32::from(color[1]);
        let db = rgb[2] - f32::from(color[2]);
        let dist = dr * dr + dg * dg + db * db;
        if dist < best_dist {
            best_dist = dist;
            best = i as u8;
        }
    }
    best
}
