use std::path::Path;

use serde::Deserialize;
use tokio::process::Command;

/// Bitmap subtitle codecs that cannot be converted to srt text.
pub const BITMAP_SUBTITLE_CODECS: [&str; 4] =
    ["hdmv_pgs_subtitle", "dvd_subtitle", "dvb_subtitle", "xsub"];

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeOutput {
    #[serde(default)]
    pub streams: Vec<StreamInfo>,
    #[serde(default)]
    pub format: Option<FormatInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FormatInfo {
    #[serde(default)]
    pub duration: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamInfo {
    pub index: u32,
    #[serde(default)]
    pub codec_name: Option<String>,
    #[serde(default)]
    pub codec_type: Option<String>,
    #[serde(default)]
    pub tags: Option<StreamTags>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamTags {
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

impl ProbeOutput {
    pub fn subtitle_streams(&self) -> Vec<&StreamInfo> {
        self.streams
            .iter()
            .filter(|s| s.codec_type.as_deref() == Some("subtitle"))
            .collect()
    }

    pub fn audio_streams(&self) -> Vec<&StreamInfo> {
        self.streams
            .iter()
            .filter(|s| s.codec_type.as_deref() == Some("audio"))
            .collect()
    }

    pub fn duration_secs(&self) -> Option<f64> {
        self.format
            .as_ref()
            .and_then(|f| f.duration.as_deref())
            .and_then(|d| d.parse().ok())
    }
}

impl StreamInfo {
    /// Subtitle streams are extractable unless their codec is in the closed
    /// bitmap set.
    pub fn is_text_subtitle(&self) -> bool {
        match self.codec_name.as_deref() {
            Some(codec) => !BITMAP_SUBTITLE_CODECS.contains(&codec),
            None => false,
        }
    }

    pub fn language(&self) -> &str {
        self.tags
            .as_ref()
            .and_then(|t| t.language.as_deref())
            .unwrap_or("und")
    }
}

/// Inspect a container with ffprobe. Exit code plus stderr is the result
/// contract; stdout is a JSON document.
pub async fn probe(path: &Path) -> Result<ProbeOutput, String> {
    let output = Command::new("ffprobe")
        .arg("-v")
        .arg("quiet")
        .arg("-print_format")
        .arg("json")
        .arg("-show_format")
        .arg("-show_streams")
        .arg("--")
        .arg(path)
        .output()
        .await
        .map_err(|e| format!("failed to run ffprobe: {e}"))?;

    if !output.status.success() {
        return Err(format!(
            "ffprobe exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }

    serde_json::from_slice(&output.stdout).map_err(|e| format!("unparseable ffprobe output: {e}"))
}
