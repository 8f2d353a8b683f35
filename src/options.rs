use std::fmt;

pub const FMT_JPEG: &str = "jpeg";
pub const FMT_JPG: &str = "jpg";
pub const FMT_PNG: &str = "png";
pub const FMT_GIF: &str = "gif";
pub const FMT_WEBP: &str = "webp";

const OPT_FIT: &str = "fit";
const OPT_FLIP_VERTICAL: &str = "fv";
const OPT_FLIP_HORIZONTAL: &str = "fh";
const OPT_ROTATE_PREFIX: &str = "r";
const OPT_QUALITY_PREFIX: &str = "q";
const OPT_FORMAT_PREFIX: &str = "f";
const OPT_SIZE_DELIMITER: char = 'x';
const OPT_SIZE_DELIMITER2: char = '*';

/// Transformation options embedded in the request path.
///
/// `width` and `height` follow the size grammar: values >= 1 are exact
/// pixels, values strictly between 0 and 1 are fractions of the source
/// dimension, and 0 (or anything negative) leaves the dimension
/// unspecified.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Options {
    pub width: f64,
    pub height: f64,
    /// Resize to fit inside the box instead of crop-to-fill.
    pub fit: bool,
    /// Degrees counter-clockwise; only 90, 180 and 270 take effect.
    pub rotate: i32,
    pub flip_vertical: bool,
    pub flip_horizontal: bool,
    /// Output quality percentage; 0 means the encoder default.
    pub quality: i32,
    /// Forced output format; empty keeps the source format.
    pub format: String,
}

impl Options {
    /// Whether any geometric operation is requested.
    pub fn transform(&self) -> bool {
        self.width != 0.0
            || self.height != 0.0
            || self.rotate != 0
            || self.flip_vertical
            || self.flip_horizontal
    }
}

/// The canonical serialization. Parsing the output yields the same
/// options back, and fully-default options serialize to the empty
/// string. Cache keys are built from this form, so it must stay stable.
impl fmt::Display for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = format!("{}{}{}", self.width, OPT_SIZE_DELIMITER, self.height);
        if self.fit {
            out.push_str(",");
            out.push_str(OPT_FIT);
        }
        if self.rotate != 0 {
            out.push_str(&format!(",{}{}", OPT_ROTATE_PREFIX, self.rotate));
        }
        if self.flip_vertical {
            out.push_str(",");
            out.push_str(OPT_FLIP_VERTICAL);
        }
        if self.flip_horizontal {
            out.push_str(",");
            out.push_str(OPT_FLIP_HORIZONTAL);
        }
        if self.quality != 0 {
            out.push_str(&format!(",{}{}", OPT_QUALITY_PREFIX, self.quality));
        }
        if !self.format.is_empty() {
            out.push_str(&format!(",{}{}", OPT_FORMAT_PREFIX, self.format));
        }
        if out == "0x0" {
            Ok(())
        } else {
            f.write_str(&out)
        }
    }
}

fn parse_size(opt: &str, delim: char, options: &mut Options) {
    let (w, h) = opt.split_once(delim).unwrap_or((opt, ""));
    if !w.is_empty() {
        options.width = w.parse().unwrap_or(0.0);
    }
    if !h.is_empty() {
        options.height = h.parse().unwrap_or(0.0);
    }
}

/// Parse a comma separated list of transformation options.
///
/// Recognized tokens, applied left to right with last-wins semantics:
///
/// - `{w}x{h}` (or `{w}*{h}`) — target size; either side may be omitted.
/// - a bare number — used for both width and height.
/// - `fit` — fit inside the box instead of crop-to-fill.
/// - `r{degrees}` — counter-clockwise rotation (90, 180, 270).
/// - `fv` / `fh` — vertical / horizontal flip.
/// - `q{percent}` — output quality.
/// - `f{format}` — force the output format.
///
/// Empty and unrecognized tokens are silently ignored. When `use_webp`
/// is set and no format was forced, the output format defaults to webp
/// (content negotiation via the Accept header).
pub fn parse_options(s: &str, use_webp: bool) -> Options {
    let mut options = Options::default();

    for opt in s.split(',') {
        if opt.is_empty() {
            continue;
        }
        if opt == OPT_FIT {
            options.fit = true;
        } else if opt == OPT_FLIP_VERTICAL {
            options.flip_vertical = true;
        } else if opt == OPT_FLIP_HORIZONTAL {
            options.flip_horizontal = true;
        } else if let Some(value) = opt.strip_prefix(OPT_ROTATE_PREFIX) {
            options.rotate = value.parse().unwrap_or(0);
        } else if let Some(value) = opt.strip_prefix(OPT_QUALITY_PREFIX) {
            options.quality = value.parse().unwrap_or(0);
        } else if let Some(value) = opt.strip_prefix(OPT_FORMAT_PREFIX) {
            options.format = value.to_string();
        } else if opt.contains(OPT_SIZE_DELIMITER) {
            parse_size(opt, OPT_SIZE_DELIMITER, &mut options);
        } else if opt.contains(OPT_SIZE_DELIMITER2) {
            parse_size(opt, OPT_SIZE_DELIMITER2, &mut options);
        } else if let Ok(size) = opt.parse::<f64>() {
            options.width = size;
            options.height = size;
        }
    }

    if use_webp && options.format.is_empty() {
        options.format = FMT_WEBP.to_string();
    }

    options
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

    #[test]
    fn options_to_string() {
        assert_eq!(Options::default().to_string(), "");
        assert_eq!(
            Options {
                width: 1.0,
                height: 2.0,
                fit: true,
                rotate: 90,
                flip_vertical: true,
                flip_horizontal: true,
                quality: 80,
                format: String::new(),
            }
            .to_string(),
            "1x2,fit,r90,fv,fh,q80"
        );
        assert_eq!(
            Options {
                width: 0.15,
                height: 1.3,
                rotate: 45,
                quality: 95,
                ..Default::default()
            }
            .to_string(),
            "0.15x1.3,r45,q95"
        );
    }

    #[test]
    fn parse_empty_and_junk() {
        for input in ["", "x", "r", "0", ",,,,"] {
            assert_eq!(parse_options(input, false), Options::default(), "{input:?}");
        }
    }

    #[test]
    fn parse_sizes() {
        assert_eq!(parse_options("1x", false), opts(1.0, 0.0));
        assert_eq!(parse_options("x1", false), opts(0.0, 1.0));
        assert_eq!(parse_options("1x2", false), opts(1.0, 2.0));
        assert_eq!(parse_options("1*2", false), opts(1.0, 2.0));
        assert_eq!(parse_options("-1x-2", false), opts(-1.0, -2.0));
        assert_eq!(parse_options("0.1x0.2", false), opts(0.1, 0.2));
        assert_eq!(parse_options("1", false), opts(1.0, 1.0));
        assert_eq!(parse_options("0.1", false), opts(0.1, 0.1));
    }

    #[test]
    fn parse_last_wins() {
        assert_eq!(parse_options("1x2,3x4", false), opts(3.0, 4.0));
        assert_eq!(parse_options("1x2,3", false), opts(3.0, 3.0));
        assert_eq!(parse_options("1x2,0x3", false), opts(0.0, 3.0));
        assert_eq!(parse_options("1x,x2", false), opts(1.0, 2.0));
        assert_eq!(
            parse_options("r90,r270", false),
            Options {
                rotate: 270,
                ..Default::default()
            }
        );
    }

    #[test]
    fn parse_flags_in_any_order() {
        let want = Options {
            width: 1.0,
            height: 2.0,
            fit: true,
            rotate: 90,
            flip_vertical: true,
            flip_horizontal: true,
            quality: 70,
            format: String::new(),
        };
        assert_eq!(parse_options("q70,1x2,fit,r90,fv,fh", false), want);
        // Serialization puts the fields back in canonical order.
        assert_eq!(want.to_string(), "1x2,fit,r90,fv,fh,q70");
        let mut want90 = want.clone();
        want90.quality = 90;
        assert_eq!(parse_options("r90,fh,q90,1x2,fv,fit", false), want90);
    }

    #[test]
    fn parse_skips_unknown_tokens() {
        assert_eq!(
            parse_options("FOO,1,BAR,r90,BAZ", false),
            Options {
                width: 1.0,
                height: 1.0,
                rotate: 90,
                ..Default::default()
            }
        );
    }

    #[test]
    fn webp_negotiation_defaults_format() {
        assert_eq!(parse_options("100", true).format, FMT_WEBP);
        assert_eq!(parse_options("100,fpng", true).format, FMT_PNG);
    }

    #[test]
    fn parse_print_roundtrip() {
        for input in ["1x2,fit,r90,fv,fh,q70", "200x0", "0.5x0.5,q80,fwebp"] {
            let parsed = parse_options(input, false);
            assert_eq!(parse_options(&parsed.to_string(), false), parsed);
        }
    }
}
