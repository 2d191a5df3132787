use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::SupervisorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantKind {
    Video,
    AudioOnly,
    Copy,
}

impl VariantKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VariantKind::Video => "video",
            VariantKind::AudioOnly => "audio_only",
            VariantKind::Copy => "copy",
        }
    }
}

impl std::str::FromStr for VariantKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "video" => Ok(Self::Video),
            "audio_only" | "audio" => Ok(Self::AudioOnly),
            "copy" => Ok(Self::Copy),
            other => Err(other.to_string()),
        }
    }
}

/// One output profile of a channel. Fixed for the lifetime of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    pub name: String,
    pub kind: VariantKind,
    pub bitrate_kbps: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl Variant {
    pub fn video(name: impl Into<String>, bitrate_kbps: u32, width: u32, height: u32) -> Self {
        Self {
            name: name.into(),
            kind: VariantKind::Video,
            bitrate_kbps: Some(bitrate_kbps),
            width: Some(width),
            height: Some(height),
        }
    }

    pub fn audio_only(name: impl Into<String>, bitrate_kbps: u32) -> Self {
        Self {
            name: name.into(),
            kind: VariantKind::AudioOnly,
            bitrate_kbps: Some(bitrate_kbps),
            width: None,
            height: None,
        }
    }

    pub fn copy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: VariantKind::Copy,
            bitrate_kbps: None,
            width: None,
            height: None,
        }
    }

    /// Relative encode cost used to apportion process-wide telemetry.
    pub fn weight(&self) -> f64 {
        match self.kind {
            VariantKind::Video => self.bitrate_kbps.unwrap_or(1000).max(1) as f64,
            VariantKind::AudioOnly => self.bitrate_kbps.unwrap_or(128).max(1) as f64,
            VariantKind::Copy => 64.0,
        }
    }
}

pub fn validate_variants(variants: &[Variant]) -> Result<(), SupervisorError> {
    if variants.is_empty() {
        return Err(SupervisorError::InvalidVariants(
            "at least one variant is required".into(),
        ));
    }
    let mut seen = HashSet::new();
    for variant in variants {
        let slug_ok = !variant.name.is_empty()
            && variant
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !slug_ok {
            return Err(SupervisorError::InvalidVariants(format!(
                "invalid variant name {:?}",
                variant.name
            )));
        }
        if !seen.insert(variant.name.as_str()) {
            return Err(SupervisorError::InvalidVariants(format!(
                "duplicate variant {}",
                variant.name
            )));
        }
        if variant.kind == VariantKind::Video
            && (variant.bitrate_kbps.is_none() || variant.height.is_none())
        {
            return Err(SupervisorError::InvalidVariants(format!(
                "video variant {} needs bitrate and height",
                variant.name
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct HlsSettings {
    pub log_level: String,
    pub segment_duration: Duration,
    pub list_size: u32,
}

/// Builds the transcoder arguments for one channel run: every variant is
/// produced by the same process and muxed into its own HLS rendition.
pub fn build_transcode_args(
    settings: &HlsSettings,
    source_url: &str,
    variants: &[Variant],
    key_info: Option<&Path>,
    output_dir: &Path,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        settings.log_level.clone(),
        "-nostats".into(),
        "-progress".into(),
        "pipe:1".into(),
        "-i".into(),
        source_url.to_string(),
    ];
    let mut stream_map = Vec::with_capacity(variants.len());
    let (mut video_idx, mut audio_idx) = (0usize, 0usize);
    for variant in variants {
        match variant.kind {
            VariantKind::Video => {
                let kbps = variant.bitrate_kbps.unwrap_or(1000);
                let height = variant.height.unwrap_or(720);
                args.extend([
                    "-map".into(),
                    "0:v:0".into(),
                    "-map".into(),
                    "0:a:0".into(),
                    format!("-c:v:{video_idx}"),
                    "libx264".into(),
                    format!("-b:v:{video_idx}"),
                    format!("{kbps}k"),
                    format!("-maxrate:v:{video_idx}"),
                    format!("{}k", kbps + kbps / 10),
                    format!("-bufsize:v:{video_idx}"),
                    format!("{}k", kbps * 2),
                    format!("-filter:v:{video_idx}"),
                    format!("scale=-2:{height}"),
                    format!("-c:a:{audio_idx}"),
                    "aac".into(),
                    format!("-b:a:{audio_idx}"),
                    "128k".into(),
                ]);
                stream_map.push(format!("v:{video_idx},a:{audio_idx},name:{}", variant.name));
                video_idx += 1;
                audio_idx += 1;
            }
            VariantKind::Copy => {
                args.extend([
                    "-map".into(),
                    "0:v:0".into(),
                    "-map".into(),
                    "0:a:0".into(),
                    format!("-c:v:{video_idx}"),
                    "copy".into(),
                    format!("-c:a:{audio_idx}"),
                    "copy".into(),
                ]);
                stream_map.push(format!("v:{video_idx},a:{audio_idx},name:{}", variant.name));
                video_idx += 1;
                audio_idx += 1;
            }
            VariantKind::AudioOnly => {
                let kbps = variant.bitrate_kbps.unwrap_or(128);
                args.extend([
                    "-map".into(),
                    "0:a:0".into(),
                    format!("-c:a:{audio_idx}"),
                    "aac".into(),
                    format!("-b:a:{audio_idx}"),
                    format!("{kbps}k"),
                ]);
                stream_map.push(format!("a:{audio_idx},name:{}", variant.name));
                audio_idx += 1;
            }
        }
    }

    let segment_secs = settings.segment_duration.as_secs().max(1);
    let mut hls_flags = String::from("delete_segments+independent_segments");
    args.extend([
        "-f".into(),
        "hls".into(),
        "-hls_time".into(),
        segment_secs.to_string(),
        "-hls_list_size".into(),
        settings.list_size.to_string(),
    ]);
    if let Some(key_info) = key_info {
        hls_flags.push_str("+periodic_rekey");
        args.push("-hls_key_info_file".into());
        args.push(key_info.to_string_lossy().to_string());
    }
    args.extend([
        "-hls_flags".into(),
        hls_flags,
        "-master_pl_name".into(),
        "master.m3u8".into(),
        "-hls_segment_filename".into(),
        output_dir
            .join("%v")
            .join("seg_%05d.ts")
            .to_string_lossy()
            .to_string(),
        "-var_stream_map".into(),
        stream_map.join(" "),
        output_dir
            .join("%v")
            .join("index.m3u8")
            .to_string_lossy()
            .to_string(),
    ]);
    args
}
