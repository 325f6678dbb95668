//! Turns per-scene stills into one video.
//!
//! Every scene image becomes a fixed-length clip with a slow zoom, clips are
//! joined by stream copy, and the narration track (if any) is muxed in with
//! the output cut to the shorter of the two streams.

use crate::core::config::VideoConfig;
use crate::core::error::StoryError;
use crate::core::io::Storage;
use crate::core::model::VideoAssemblyJob;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, info};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use url::Url;

#[async_trait]
pub trait VideoEncoder: Send + Sync {
    /// Renders `image` into a clip of exactly `seconds`.
    async fn render_clip(&self, image: &Path, seconds: u32, output: &Path) -> Result<()>;
    /// Container-level join of clips sharing one codec configuration.
    async fn concat(&self, clips: &[PathBuf], work_dir: &Path, output: &Path) -> Result<()>;
    /// Adds `audio` as the only audio stream, cutting at `limit_seconds`.
    async fn mux(&self, video: &Path, audio: &Path, limit_seconds: f64, output: &Path) -> Result<()>;
    async fn probe_duration(&self, media: &Path) -> Result<f64>;
}

pub fn frame_count(seconds: u32, fps: u32) -> u32 {
    (seconds * fps).max(1)
}

/// Zoom factor at `frame`, rising linearly from 1.0 to `max_zoom` on the
/// last frame of the clip.
pub fn zoom_at(frame: u32, frames: u32, max_zoom: f64) -> f64 {
    if frames <= 1 {
        return 1.0;
    }
    let step = (max_zoom - 1.0) / (frames - 1) as f64;
    (1.0 + step * frame as f64).min(max_zoom)
}

pub struct FfmpegEncoder {
    config: VideoConfig,
}

impl FfmpegEncoder {
    pub fn new(config: VideoConfig) -> Self {
        Self { config }
    }

    pub fn zoompan_filter(&self, seconds: u32) -> String {
        let c = &self.config;
        let frames = frame_count(seconds, c.fps);
        let step = if frames > 1 {
            (c.max_zoom - 1.0) / (frames - 1) as f64
        } else {
            0.0
        };
        // upscale first so the crop window moves in sub-pixel steps
        format!(
            "scale={sw}:{sh},zoompan=z='min(1+{step:.8}*on,{max})':x='iw/2-(iw/zoom/2)':y='ih/2-(ih/zoom/2)':d={frames}:s={w}x{h}:fps={fps},format=yuv420p",
            sw = c.width * 2,
            sh = c.height * 2,
            step = step,
            max = c.max_zoom,
            frames = frames,
            w = c.width,
            h = c.height,
            fps = c.fps
        )
    }

    pub fn clip_args(&self, image: &Path, seconds: u32, output: &Path) -> Vec<String> {
        let frames = frame_count(seconds, self.config.fps);
        vec![
            "-y".into(),
            "-i".into(),
            image.to_string_lossy().to_string(),
            "-vf".into(),
            self.zoompan_filter(seconds),
            "-frames:v".into(),
            frames.to_string(),
            "-r".into(),
            self.config.fps.to_string(),
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            "veryfast".into(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            output.to_string_lossy().to_string(),
        ]
    }

    pub fn mux_args(video: &Path, audio: &Path, limit_seconds: f64, output: &Path) -> Vec<String> {
        vec![
            "-y".into(),
            "-i".into(),
            video.to_string_lossy().to_string(),
            "-i".into(),
            audio.to_string_lossy().to_string(),
            "-map".into(),
            "0:v:0".into(),
            "-map".into(),
            "1:a:0".into(),
            "-c:v".into(),
            "copy".into(),
            "-c:a".into(),
            "aac".into(),
            "-t".into(),
            format!("{:.3}", limit_seconds),
            "-shortest".into(),
            output.to_string_lossy().to_string(),
        ]
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<Vec<u8>> {
        debug!("{} {}", program, args.join(" "));
        let output = Command::new(program).args(args).output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                anyhow::Error::from(StoryError::Configuration(format!("{} not found", program)))
            } else {
                anyhow!("Failed to start {}: {}", program, e)
            }
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
            return Err(anyhow!(
                "{} exited with {}: {}",
                program,
                output.status,
                tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
            ));
        }
        Ok(output.stdout)
    }
}

fn concat_list(clips: &[PathBuf]) -> String {
    clips
        .iter()
        .map(|p| format!("file '{}'\n", p.to_string_lossy().replace('\'', "'\\''")))
        .collect()
}

#[async_trait]
impl VideoEncoder for FfmpegEncoder {
    async fn render_clip(&self, image: &Path, seconds: u32, output: &Path) -> Result<()> {
        let args = self.clip_args(image, seconds, output);
        self.run(&self.config.ffmpeg_path, &args).await?;
        Ok(())
    }

    async fn concat(&self, clips: &[PathBuf], work_dir: &Path, output: &Path) -> Result<()> {
        let list = work_dir.join("clips.txt");
        tokio::fs::write(&list, concat_list(clips)).await?;
        let args: Vec<String> = vec![
            "-y".into(),
            "-f".into(),
            "concat".into(),
            "-safe".into(),
            "0".into(),
            "-i".into(),
            list.to_string_lossy().to_string(),
            "-c".into(),
            "copy".into(),
            output.to_string_lossy().to_string(),
        ];
        self.run(&self.config.ffmpeg_path, &args).await?;
        Ok(())
    }

    async fn mux(&self, video: &Path, audio: &Path, limit_seconds: f64, output: &Path) -> Result<()> {
        let args = Self::mux_args(video, audio, limit_seconds, output);
        self.run(&self.config.ffmpeg_path, &args).await?;
        Ok(())
    }

    async fn probe_duration(&self, media: &Path) -> Result<f64> {
        let args: Vec<String> = vec![
            "-v".into(),
            "error".into(),
            "-show_entries".into(),
            "format=duration".into(),
            "-of".into(),
            "default=noprint_wrappers=1:nokey=1".into(),
            media.to_string_lossy().to_string(),
        ];
        let stdout = self.run(&self.config.ffprobe_path, &args).await?;
        let text = String::from_utf8_lossy(&stdout);
        text.trim()
            .parse::<f64>()
            .with_context(|| format!("ffprobe returned no duration for {}", media.display()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssemblyOutcome {
    pub output: String,
    pub duration_seconds: f64,
}

pub struct VideoAssembler<'a> {
    encoder: &'a dyn VideoEncoder,
    storage: &'a dyn Storage,
    http: reqwest::Client,
}

impl<'a> VideoAssembler<'a> {
    pub fn new(encoder: &'a dyn VideoEncoder, storage: &'a dyn Storage) -> Self {
        Self {
            encoder,
            storage,
            http: reqwest::Client::new(),
        }
    }

    async fn fetch(&self, source: &str, dest: &Path) -> Result<()> {
        fetch_source(&self.http, self.storage, source, dest).await
    }

    /// Builds the final video and writes it to `output` through storage.
    /// Nothing is encoded unless every clip has an image. The working
    /// directory is removed on every exit path.
    pub async fn assemble(&self, job: &VideoAssemblyJob, output: &str) -> Result<AssemblyOutcome> {
        job.ensure_ready()?;

        let work = tempfile::tempdir().context("Failed to create assembly directory")?;
        info!("Assembling {} clips ({}s)", job.clips.len(), job.total_seconds());

        let mut clips = Vec::with_capacity(job.clips.len());
        for clip in &job.clips {
            let Some(image_url) = clip.image_url.as_deref() else {
                continue;
            };
            let ext = Path::new(image_url)
                .extension()
                .and_then(|e| e.to_str())
                .filter(|e| e.len() <= 4)
                .unwrap_or("png");
            let image = work.path().join(format!("src_{:03}.{}", clip.order, ext));
            self.fetch(image_url, &image).await?;
            let rendered = work.path().join(format!("clip_{:03}.mp4", clip.order));
            self.encoder
                .render_clip(&image, clip.duration_seconds, &rendered)
                .await
                .with_context(|| format!("Clip for scene {} failed", clip.order))?;
            clips.push(rendered);
        }

        let combined = work.path().join("combined.mp4");
        self.encoder.concat(&clips, work.path(), &combined).await?;

        let final_path = match &job.narration_track {
            Some(track) => {
                let ext = Path::new(track).extension().and_then(|e| e.to_str()).unwrap_or("wav");
                let audio = work.path().join(format!("narration.{}", ext));
                self.fetch(track, &audio).await?;
                let video_len = self.encoder.probe_duration(&combined).await?;
                let audio_len = self.encoder.probe_duration(&audio).await?;
                if (video_len - audio_len).abs() > 0.5 {
                    info!(
                        "Narration {:.1}s vs video {:.1}s, cutting to the shorter",
                        audio_len, video_len
                    );
                }
                let muxed = work.path().join("final.mp4");
                self.encoder
                    .mux(&combined, &audio, video_len.min(audio_len), &muxed)
                    .await?;
                muxed
            }
            None => combined,
        };

        let duration_seconds = self.encoder.probe_duration(&final_path).await?;
        let bytes = tokio::fs::read(&final_path).await?;
        self.storage.write(output, &bytes).await?;
        info!("Video written to {} ({:.1}s)", output, duration_seconds);

        Ok(AssemblyOutcome {
            output: output.to_string(),
            duration_seconds,
        })
    }
}

/// Copies an artifact to a local file. Remote URLs are streamed, anything
/// else is read through storage.
pub(crate) async fn fetch_source(
    http: &reqwest::Client,
    storage: &dyn Storage,
    source: &str,
    dest: &Path,
) -> Result<()> {
    match Url::parse(source) {
        Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {
            let resp = http
                .get(url)
                .send()
                .await?
                .error_for_status()
                .with_context(|| format!("Failed to download {}", source))?;
            let mut file = tokio::fs::File::create(dest).await?;
            let mut stream = resp.bytes_stream();
            while let Some(chunk) = stream.next().await {
                file.write_all(&chunk?).await?;
            }
            file.flush().await?;
        }
        _ => {
            let bytes = storage.read(source).await?;
            tokio::fs::write(dest, bytes).await?;
        }
    }
    Ok(())
}
