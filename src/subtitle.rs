//! Subtitle normalization.
//!
//! Uploads arrive either as WebVTT captions or as SRT. Only SRT is ever
//! persisted, so WebVTT documents are rewritten on the way in: the header
//! block is dropped, every cue gets a sequence number and the timing line
//! switches from `.` to `,` as the fractional-second separator.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

const HEADER_MARKER: &str = "WEBVTT";
const CUE_ARROW: &str = "-->";

/// Encodings accepted on upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubtitleFormat {
    #[serde(rename = "vtt")]
    WebVtt,
    #[serde(rename = "srt")]
    Srt,
}

/// The only format written to the catalog.
pub const CANONICAL_FORMAT: SubtitleFormat = SubtitleFormat::Srt;

impl SubtitleFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubtitleFormat::WebVtt => "vtt",
            SubtitleFormat::Srt => "srt",
        }
    }
}

impl fmt::Display for SubtitleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubtitleFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "vtt" | "webvtt" => Ok(SubtitleFormat::WebVtt),
            "srt" => Ok(SubtitleFormat::Srt),
            other => Err(format!("unsupported subtitle format: {other:?}")),
        }
    }
}

/// Converts `input` into the canonical format. SRT input is returned as-is.
///
/// Never fails: malformed WebVTT is converted on a best-effort basis.
pub fn normalize(input: &str, declared: SubtitleFormat) -> String {
    match declared {
        SubtitleFormat::Srt => input.to_owned(),
        SubtitleFormat::WebVtt => vtt_to_srt(input),
    }
}

/// Rewrites a WebVTT document as SRT.
///
/// Lines are trimmed before they are classified. The leading run of blank
/// and `WEBVTT` lines is skipped once; a marker appearing later in the body is
/// ordinary text.
pub fn vtt_to_srt(vtt: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut counter: u64 = 1;
    let mut in_header = true;

    for raw in vtt.split('\n') {
        let line = raw.trim();

        if in_header {
            if line.is_empty() || line.starts_with(HEADER_MARKER) {
                continue;
            }
            in_header = false;
        }

        if line.contains(CUE_ARROW) {
            out.push(counter.to_string());
            counter += 1;
            out.push(line.replace('.', ","));
        } else {
            out.push(line.to_owned());
        }
    }

    out.join("\n")
}
