use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::modules::uploads::keys::MASTER_PLAYLIST;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("no output variants requested")]
    NoVariants,

    #[error("failed to start encoder {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("encoder exited with {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },

    #[error("encoder produced no master playlist at {0}")]
    MissingOutput(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One rendition of the adaptive ladder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantSpec {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub video_bitrate_kbps: u32,
    pub maxrate_kbps: u32,
    pub bufsize_kbps: u32,
    pub audio_bitrate_kbps: u32,
}

impl VariantSpec {
    fn new(name: &str, width: u32, height: u32, video: u32, maxrate: u32, bufsize: u32, audio: u32) -> Self {
        Self {
            name: name.to_string(),
            width,
            height,
            video_bitrate_kbps: video,
            maxrate_kbps: maxrate,
            bufsize_kbps: bufsize,
            audio_bitrate_kbps: audio,
        }
    }

    /// 1080p, 720p and 480p, highest first.
    pub fn default_ladder() -> Vec<Self> {
        vec![
            Self::new("1080p", 1920, 1080, 5000, 5350, 7500, 192),
            Self::new("720p", 1280, 720, 2800, 2996, 4200, 128),
            Self::new("480p", 854, 480, 1400, 1498, 2100, 96),
        ]
    }
}

/// Turns one source file into an HLS tree under `output_dir`: a master
/// playlist named `master.m3u8` plus one media playlist and its segments
/// per variant.
#[async_trait]
pub trait Encoder: Send + Sync {
    async fn encode(
        &self,
        input: &Path,
        output_dir: &Path,
        variants: &[VariantSpec],
    ) -> Result<(), EncodeError>;
}

#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    ffmpeg_path: String,
    segment_secs: u32,
}

impl FfmpegEncoder {
    pub fn new(ffmpeg_path: impl Into<String>, segment_secs: u32) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            segment_secs,
        }
    }
}

/// Single-pass ffmpeg invocation: the decoded video is split once and
/// scaled per variant (letterboxed, dimensions rounded up to even), audio
/// is re-encoded to stereo AAC for each variant.
pub fn hls_args(input: &Path, output_dir: &Path, variants: &[VariantSpec], segment_secs: u32) -> Vec<String> {
    let count = variants.len();

    let mut filter = format!("[0:v]split={}", count);
    for i in 0..count {
        filter.push_str(&format!("[v{}]", i));
    }
    for (i, v) in variants.iter().enumerate() {
        filter.push_str(&format!(
            ";[v{i}]scale=w={w}:h={h}:force_original_aspect_ratio=decrease,pad=ceil(iw/2)*2:ceil(ih/2)*2[v{i}out]",
            i = i,
            w = v.width,
            h = v.height,
        ));
    }

    // Only errors reach stderr; the progress line would otherwise grow with
    // the length of the input.
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-nostats".into(),
        "-loglevel".into(),
        "error".into(),
        "-y".into(),
        "-i".into(),
        input.to_string_lossy().into_owned(),
        "-filter_complex".into(),
        filter,
    ];

    for (i, v) in variants.iter().enumerate() {
        args.extend([
            "-map".to_string(),
            format!("[v{}out]", i),
            format!("-c:v:{}", i),
            "libx264".to_string(),
            format!("-b:v:{}", i),
            format!("{}k", v.video_bitrate_kbps),
            format!("-maxrate:v:{}", i),
            format!("{}k", v.maxrate_kbps),
            format!("-bufsize:v:{}", i),
            format!("{}k", v.bufsize_kbps),
        ]);
    }

    for (i, v) in variants.iter().enumerate() {
        args.extend([
            "-map".to_string(),
            "a:0".to_string(),
            format!("-c:a:{}", i),
            "aac".to_string(),
            format!("-b:a:{}", i),
            format!("{}k", v.audio_bitrate_kbps),
            "-ac".to_string(),
            "2".to_string(),
        ]);
    }

    let stream_map = (0..count)
        .map(|i| format!("v:{i},a:{i}"))
        .collect::<Vec<_>>()
        .join(" ");

    args.extend([
        "-f".to_string(),
        "hls".to_string(),
        "-hls_time".to_string(),
        segment_secs.to_string(),
        "-hls_playlist_type".to_string(),
        "vod".to_string(),
        "-hls_flags".to_string(),
        "independent_segments".to_string(),
        "-master_pl_name".to_string(),
        MASTER_PLAYLIST.to_string(),
        "-hls_segment_filename".to_string(),
        output_dir.join("v%v_segment%03d.ts").to_string_lossy().into_owned(),
        "-var_stream_map".to_string(),
        stream_map,
        output_dir.join("v%v.m3u8").to_string_lossy().into_owned(),
    ]);

    args
}

/// Last few lines of stderr; ffmpeg prints its actual failure reason at the end.
fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(8);
    lines[start..].join("\n")
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn encode(
        &self,
        input: &Path,
        output_dir: &Path,
        variants: &[VariantSpec],
    ) -> Result<(), EncodeError> {
        if variants.is_empty() {
            return Err(EncodeError::NoVariants);
        }

        tokio::fs::create_dir_all(output_dir).await?;

        let args = hls_args(input, output_dir, variants, self.segment_secs);
        debug!(program = %self.ffmpeg_path, ?args, "Running encoder");
        info!(
            input = %input.display(),
            variants = variants.len(),
            "🎥 Encoding HLS ladder"
        );

        let output = Command::new(&self.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| EncodeError::Spawn {
                program: self.ffmpeg_path.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(EncodeError::Exit {
                code: output.status.code(),
                stderr: stderr_tail(&output.stderr),
            });
        }

        let master = output_dir.join(MASTER_PLAYLIST);
        if !tokio::fs::try_exists(&master).await? {
            return Err(EncodeError::MissingOutput(master));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arg_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn default_ladder_is_highest_first() {
        let ladder = VariantSpec::default_ladder();
        let names: Vec<&str> = ladder.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, ["1080p", "720p", "480p"]);
        assert_eq!(ladder[1].video_bitrate_kbps, 2800);
        assert_eq!(ladder[2].audio_bitrate_kbps, 96);
    }

    #[test]
    fn builds_one_stream_per_variant() {
        let args = hls_args(
            Path::new("/work/in.mp4"),
            Path::new("/work/hls/a1"),
            &VariantSpec::default_ladder(),
            10,
        );

        assert_eq!(arg_after(&args, "-i"), Some("/work/in.mp4"));
        assert_eq!(arg_after(&args, "-loglevel"), Some("error"));
        assert!(args.iter().any(|a| a == "-nostats"));
        assert_eq!(arg_after(&args, "-b:v:0"), Some("5000k"));
        assert_eq!(arg_after(&args, "-maxrate:v:1"), Some("2996k"));
        assert_eq!(arg_after(&args, "-bufsize:v:2"), Some("2100k"));
        assert_eq!(arg_after(&args, "-b:a:0"), Some("192k"));
        assert_eq!(arg_after(&args, "-hls_time"), Some("10"));
        assert_eq!(arg_after(&args, "-hls_playlist_type"), Some("vod"));
        assert_eq!(arg_after(&args, "-master_pl_name"), Some("master.m3u8"));
        assert_eq!(
            arg_after(&args, "-var_stream_map"),
            Some("v:0,a:0 v:1,a:1 v:2,a:2")
        );
        assert_eq!(args.last().map(String::as_str), Some("/work/hls/a1/v%v.m3u8"));

        let filter = arg_after(&args, "-filter_complex").unwrap_or_default();
        assert!(filter.starts_with("[0:v]split=3[v0][v1][v2]"));
        assert!(filter.contains("[v1]scale=w=1280:h=720:force_original_aspect_ratio=decrease"));
        assert!(filter.contains("pad=ceil(iw/2)*2:ceil(ih/2)*2[v2out]"));
    }

    #[test]
    fn keeps_only_stderr_tail() {
        let stderr = (0..20).map(|i| format!("line {}", i)).collect::<Vec<_>>().join("\n");
        let tail = stderr_tail(stderr.as_bytes());
        assert!(tail.starts_with("line 12"));
        assert!(tail.ends_with("line 19"));
    }

    #[tokio::test]
    async fn rejects_empty_ladder() {
        let encoder = FfmpegEncoder::new("ffmpeg", 10);
        let result = encoder
            .encode(Path::new("in.mp4"), Path::new("out"), &[])
            .await;
        assert!(matches!(result, Err(EncodeError::NoVariants)));
    }
}
