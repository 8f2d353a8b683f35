use url::Url;

use crate::options::{parse_options, Options, FMT_WEBP};
use crate::{ProxyError, Result};

/// Path prefix agreed with the CDN origin-pull configuration.
pub const PATH_PREFIX: &str = "tools/im/";

/// A normalized proxy request: the absolute origin URL plus the
/// transformation options extracted from the inbound path.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRequest {
    pub url: Url,
    pub options: Options,
}

impl ImageRequest {
    /// The canonical request URL with the options riding in the
    /// fragment. This string is the outer cache identity.
    pub fn to_url(&self) -> Url {
        let mut u = self.url.clone();
        let opts = self.options.to_string();
        if opts.is_empty() {
            u.set_fragment(None);
        } else {
            u.set_fragment(Some(&opts));
        }
        u
    }
}

impl std::fmt::Display for ImageRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.to_url().as_str())
    }
}

/// Undo the `//` collapsing some proxies and browsers apply to embedded
/// URLs: `https:/www…` (any number of slashes) becomes `https://www…`.
fn repair_scheme(s: &str) -> String {
    for scheme in ["https", "http"] {
        if let Some(rest) = s.strip_prefix(scheme).and_then(|r| r.strip_prefix(':')) {
            if rest.starts_with('/') {
                let trimmed = rest.trim_start_matches('/');
                if !trimmed.is_empty() {
                    return format!("{scheme}://{trimmed}");
                }
            }
        }
    }
    s.to_string()
}

fn parse_remote(s: &str) -> std::result::Result<Url, url::ParseError> {
    Url::parse(&repair_scheme(s))
}

/// Trailing `/ts<digits>` path segment, used as a version override.
fn split_force_ts(path: &str) -> (&str, Option<&str>) {
    if let Some(idx) = path.rfind('/') {
        let last = &path[idx + 1..];
        if let Some(digits) = last.strip_prefix("ts") {
            if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                return (&path[..idx], Some(digits));
            }
        }
    }
    (path, None)
}

/// Parse and normalize an inbound request path into an [`ImageRequest`].
///
/// Accepted shapes under `/tools/im/`:
///
/// - `{options}/{relative-store-key}[/ts{digits}]`
/// - `{absolute-url}`
/// - `{options}/{absolute-url}[/ts{digits}]`
///
/// Relative keys resolve against `base_url`. The query is canonicalized
/// down to at most a `ts` parameter (the path override wins over the
/// query), which makes the result a stable cache identity regardless of
/// signature parameters. A client advertising `image/webp` in `accept`
/// gets webp output unless the options force a format.
pub fn new_request(
    path: &str,
    query_ts: Option<&str>,
    accept: &str,
    base_url: Option<&Url>,
) -> Result<ImageRequest> {
    let bad = |msg: &str| ProxyError::BadRequest(format!("{msg}: {path}"));

    let stripped = path
        .strip_prefix('/')
        .unwrap_or(path)
        .strip_prefix(PATH_PREFIX)
        .ok_or_else(|| bad("invalid url"))?;

    let (remainder, force_ts) = split_force_ts(stripped);
    let use_webp = accept.contains("image/webp");

    let mut options = Options::default();
    let mut url = match parse_remote(remainder) {
        Ok(url) => {
            if use_webp {
                options.format = FMT_WEBP.to_string();
            }
            url
        }
        Err(_) => {
            let (opts_part, rest) = remainder
                .split_once('/')
                .ok_or_else(|| bad("too few path segments"))?;
            options = parse_options(opts_part, use_webp);
            match parse_remote(rest) {
                Ok(url) => url,
                Err(url::ParseError::RelativeUrlWithoutBase) => base_url
                    .ok_or_else(|| bad("must provide absolute remote URL"))?
                    .join(rest)
                    .map_err(|e| bad(&format!("unable to parse remote URL: {e}")))?,
                Err(e) => return Err(bad(&format!("unable to parse remote URL: {e}"))),
            }
        }
    };

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(bad("remote URL must have http or https scheme"));
    }

    // Only the version survives query canonicalization; signatures and
    // anything else would fracture the cache key.
    let ts = force_ts.or(query_ts);
    match ts {
        Some(ts) if !ts.is_empty() => {
            url.query_pairs_mut().clear().append_pair("ts", ts);
        }
        _ => url.set_query(None),
    }

    Ok(ImageRequest { url, options })
}
