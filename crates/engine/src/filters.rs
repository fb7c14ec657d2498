//! FFmpeg video filter chain construction.

use crate::crop::CropRect;

/// An ordered list of `-vf` filter fragments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterChain {
    filters: Vec<String>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a filter fragment; empty fragments are ignored.
    pub fn add(&mut self, filter: impl Into<String>) {
        let filter = filter.into();
        if !filter.is_empty() {
            self.filters.push(filter);
        }
    }

    /// Build the complete `-vf` argument.
    pub fn build(&self) -> String {
        self.filters.join(",")
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

pub fn crop_filter(rect: &CropRect) -> String {
    format!("crop={}:{}:{}:{}", rect.width, rect.height, rect.x, rect.y)
}

pub fn scale_filter(width: u32, height: u32, algorithm: &str) -> String {
    if algorithm.is_empty() {
        format!("scale={}:{}", width, height)
    } else {
        format!("scale={}:{}:flags={}", width, height, algorithm)
    }
}

pub fn deinterlace_filter(method: &str) -> String {
    method.to_string()
}

pub fn denoise_filter(method: &str) -> String {
    method.to_string()
}

/// Subtitle burn-in filter.
///
/// Backslashes, colons, and single quotes in the path must be escaped for
/// the filter argument syntax. `stream_index` selects an embedded track;
/// external subtitle files take no index.
pub fn subtitle_filter(input_path: &str, stream_index: Option<usize>) -> String {
    let escaped = input_path
        .replace('\\', "\\\\")
        .replace(':', "\\:")
        .replace('\'', "\\'");
    match stream_index {
        Some(index) => format!("subtitles='{}':si={}", escaped, index),
        None => format!("subtitles='{}'", escaped),
    }
}

/// Options for [`build_video_filters`].
#[derive(Debug, Clone, Default)]
pub struct VideoFilterOptions<'a> {
    pub crop: Option<&'a CropRect>,
    /// Target dimensions; `None` when no scaling is needed.
    pub scale: Option<(u32, u32)>,
    pub deinterlace: bool,
    pub denoise: bool,
    pub subtitle_path: Option<&'a str>,
    pub subtitle_stream_index: Option<usize>,
}

/// Assemble the video filter chain in its fixed order:
/// crop, deinterlace, scale, denoise, subtitles.
///
/// Crop comes first to cut the pixel count for everything downstream;
/// subtitles come last so they render at the final resolution.
pub fn build_video_filters(options: &VideoFilterOptions<'_>) -> FilterChain {
    let mut chain = FilterChain::new();

    if let Some(rect) = options.crop {
        chain.add(crop_filter(rect));
    }

    if options.deinterlace {
        chain.add(deinterlace_filter("yadif"));
    }

    if let Some((width, height)) = options.scale {
        chain.add(scale_filter(width, height, "lanczos"));
    }

    if options.denoise {
        chain.add(denoise_filter("hqdn3d"));
    }

    if let Some(path) = options.subtitle_path {
        chain.add(subtitle_filter(path, options.subtitle_stream_index));
    }

    chain
}

#[cfg(test)]
mod tests {
    use super::*;

    fn letterbox() -> CropRect {
        CropRect {
            width: 1920,
            height: 800,
            x: 0,
            y: 140,
        }
    }

    #[test]
    fn test_empty_chain() {
        let chain = build_video_filters(&VideoFilterOptions::default());
        assert!(chain.is_empty());
        assert_eq!(chain.build(), "");
    }

    #[test]
    fn test_crop_filter() {
        assert_eq!(crop_filter(&letterbox()), "crop=1920:800:0:140");
    }

    #[test]
    fn test_scale_filter_with_algorithm() {
        assert_eq!(scale_filter(1280, 534, "lanczos"), "scale=1280:534:flags=lanczos");
        assert_eq!(scale_filter(1280, 534, ""), "scale=1280:534");
    }

    #[test]
    fn test_subtitle_filter_escaping() {
        assert_eq!(
            subtitle_filter("/media/it's: a film.mkv", Some(2)),
            "subtitles='/media/it\\'s\\: a film.mkv':si=2"
        );
        assert_eq!(
            subtitle_filter("/media/plain.srt", None),
            "subtitles='/media/plain.srt'"
        );
    }

    #[test]
    fn test_full_chain_order() {
        let crop = letterbox();
        let options = VideoFilterOptions {
            crop: Some(&crop),
            scale: Some((1280, 534)),
            deinterlace: true,
            denoise: true,
            subtitle_path: Some("/work/film.srt"),
            subtitle_stream_index: None,
        };
        let chain = build_video_filters(&options);

        assert_eq!(
            chain.build(),
            "crop=1920:800:0:140,yadif,scale=1280:534:flags=lanczos,hqdn3d,subtitles='/work/film.srt'"
        );
    }

    #[test]
    fn test_partial_chain() {
        let options = VideoFilterOptions {
            scale: Some((1280, 720)),
            ..VideoFilterOptions::default()
        };
        assert_eq!(
            build_video_filters(&options).build(),
            "scale=1280:720:flags=lanczos"
        );
    }
}
