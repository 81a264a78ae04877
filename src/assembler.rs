use ffmpeg_next::codec::Id as CodecId;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::audio::probe_audio_codec;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::storyboard::Storyboard;

/// 一个片段在输出视频中占用的帧区间
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSpan {
    pub index: usize,
    pub image: PathBuf,
    pub start_frame: u64,
    pub frame_count: u64,
}

/// 音轨的写入方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioMode {
    /// 原样复制音频流
    Copy,
    /// 转码为 AAC 192k
    Aac,
}

impl AudioMode {
    /// MP4 能直接容纳 AAC 和 MP3，其余格式需要转码
    pub fn for_codec(codec: CodecId) -> Self {
        match codec {
            CodecId::AAC | CodecId::MP3 => AudioMode::Copy,
            _ => AudioMode::Aac,
        }
    }

    fn args(self) -> Vec<String> {
        let args: &[&str] = match self {
            AudioMode::Copy => &["-c:a", "copy"],
            AudioMode::Aac => &["-c:a", "aac", "-b:a", "192k"],
        };
        args.iter().map(|s| s.to_string()).collect()
    }
}

/// 视频合成器：把每个片段的图片按切点时长拼接，并混入原始音频
pub struct VideoAssembler {
    fps: u32,
    width: u32,
    height: u32,
    ffmpeg_bin: String,
}

impl VideoAssembler {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            fps: config.video_fps.max(1),
            width: config.video_width,
            height: config.video_height,
            ffmpeg_bin: "ffmpeg".to_string(),
        }
    }

    pub fn with_ffmpeg_bin(mut self, ffmpeg_bin: impl Into<String>) -> Self {
        self.ffmpeg_bin = ffmpeg_bin.into();
        self
    }

    /// 把片段边界取整到帧，帧数之和始终等于 round(时长 * fps)
    pub fn frame_plan(&self, storyboard: &Storyboard) -> Result<Vec<FrameSpan>> {
        let missing = storyboard.missing_images();
        if !missing.is_empty() {
            return Err(PipelineError::IncompleteStoryboard { missing });
        }

        let fps = self.fps as f64;
        let to_frame = |t: f64| (t * fps).round().max(0.0) as u64;

        Ok(storyboard
            .segments
            .iter()
            .enumerate()
            .map(|(index, segment)| {
                let start_frame = to_frame(segment.start_time);
                let end_frame = to_frame(segment.end_time).max(start_frame);
                FrameSpan {
                    index,
                    image: PathBuf::from(segment.image_path.as_deref().unwrap_or_default().trim()),
                    start_frame,
                    frame_count: end_frame - start_frame,
                }
            })
            .collect())
    }

    /// 生成 ffmpeg concat demuxer 脚本
    ///
    /// 不足一帧的片段不出现在视频里。最后一张图片需要重复一次，
    /// 否则 concat demuxer 会忽略它的 duration。
    pub fn concat_script(&self, plan: &[FrameSpan]) -> String {
        let mut script = String::from("ffconcat version 1.0\n");
        let visible: Vec<&FrameSpan> = plan.iter().filter(|s| s.frame_count > 0).collect();

        for span in &visible {
            script.push_str(&format!("file '{}'\n", escape_concat_path(&span.image)));
            script.push_str(&format!("duration {:.6}\n", span.frame_count as f64 / self.fps as f64));
        }
        if let Some(last) = visible.last() {
            script.push_str(&format!("file '{}'\n", escape_concat_path(&last.image)));
        }
        script
    }

    /// 构建 ffmpeg 参数
    pub fn ffmpeg_args(
        &self,
        script: &Path,
        audio: &Path,
        audio_mode: AudioMode,
        duration: f64,
        output: &Path,
    ) -> Vec<String> {
        let (w, h) = (self.width, self.height);
        let filter = format!(
            "scale={w}:{h}:force_original_aspect_ratio=decrease,\
             pad={w}:{h}:(ow-iw)/2:(oh-ih)/2,setsar=1,fps={fps},\
             tpad=stop_mode=clone:stop_duration=1,format=yuv420p",
            w = w,
            h = h,
            fps = self.fps
        );

        [
            "-hide_banner",
            "-loglevel",
            "error",
            "-y",
            "-f",
            "concat",
            "-safe",
            "0",
            "-i",
        ]
        .iter()
        .map(|s| s.to_string())
        .chain([
            script.to_string_lossy().to_string(),
            "-i".to_string(),
            audio.to_string_lossy().to_string(),
            "-map".to_string(),
            "0:v:0".to_string(),
            "-map".to_string(),
            "1:a:0".to_string(),
            "-vf".to_string(),
            filter,
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            "medium".to_string(),
            "-crf".to_string(),
            "23".to_string(),
            "-r".to_string(),
            self.fps.to_string(),
        ])
        .chain(audio_mode.args())
        .chain([
            "-t".to_string(),
            format!("{:.3}", duration),
            "-movflags".to_string(),
            "+faststart".to_string(),
            output.to_string_lossy().to_string(),
        ])
        .collect()
    }

    /// 根据分镜合成视频，覆盖 `output_path`
    pub fn create_video(&self, storyboard_path: &Path, output_path: &Path) -> Result<PathBuf> {
        let start = Instant::now();
        let storyboard = Storyboard::load(storyboard_path)?;

        let mut plan = self.frame_plan(&storyboard)?;
        let missing_files: Vec<usize> = plan
            .iter()
            .filter(|span| !span.image.is_file())
            .map(|span| span.index)
            .collect();
        if !missing_files.is_empty() {
            return Err(PipelineError::IncompleteStoryboard { missing: missing_files });
        }

        let audio = PathBuf::from(&storyboard.source_audio);
        if !audio.is_file() {
            return Err(PipelineError::io(
                &audio,
                std::io::Error::new(std::io::ErrorKind::NotFound, "音频文件不存在"),
            ));
        }

        let total_frames: u64 = plan.iter().map(|s| s.frame_count).sum();
        if total_frames == 0 {
            return Err(PipelineError::encoding(format!(
                "音频时长 {:.3} 秒不足一帧（{} fps）",
                storyboard.duration(),
                self.fps
            )));
        }

        for span in &mut plan {
            span.image = span.image.canonicalize().map_err(|e| PipelineError::io(&span.image, e))?;
        }

        if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
        }

        let mut script_name = output_path.as_os_str().to_owned();
        script_name.push(".ffconcat");
        let script_path = PathBuf::from(script_name);
        std::fs::write(&script_path, self.concat_script(&plan)).map_err(|e| PipelineError::io(&script_path, e))?;

        info!(
            "🎬 [视频合成] {} 个片段，{} 帧，{}x{} @ {} fps",
            plan.len(),
            total_frames,
            self.width,
            self.height,
            self.fps
        );

        let audio_mode = match probe_audio_codec(&audio) {
            Ok(codec) => AudioMode::for_codec(codec),
            Err(e) => {
                warn!("⚠️  [视频合成] 无法识别音频编码，转码为 AAC: {}", e);
                AudioMode::Aac
            }
        };
        debug!("🎬 [视频合成] 音轨: {:?}", audio_mode);

        let args = self.ffmpeg_args(&script_path, &audio, audio_mode, storyboard.duration(), output_path);
        debug!("🎬 [视频合成] {} {}", self.ffmpeg_bin, args.join(" "));
        let output = Command::new(&self.ffmpeg_bin).args(&args).output();
        let _ = std::fs::remove_file(&script_path);

        let output = output.map_err(|e| {
            PipelineError::encoding(format!("无法执行 {}: {}", self.ffmpeg_bin, e))
        })?;
        if !output.status.success() {
            return Err(PipelineError::Encoding {
                message: format!("ffmpeg 退出状态: {}", output.status),
                stderr: Some(String::from_utf8_lossy(&output.stderr).trim().to_string()),
            });
        }

        info!(
            "✅ [视频合成] 输出: {}，耗时: {:.2}秒",
            output_path.display(),
            start.elapsed().as_secs_f64()
        );
        Ok(output_path.to_path_buf())
    }
}

/// concat 脚本中单引号包裹的路径，内部单引号写成 '\''
fn escape_concat_path(path: &Path) -> String {
    path.to_string_lossy().replace('\'', "'\\''")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assembler() -> VideoAssembler {
        VideoAssembler::new(&PipelineConfig::default())
    }

    fn complete_storyboard(cuts: &[f64]) -> Storyboard {
        let mut storyboard = Storyboard::from_cuts("song.mp3", cuts, None).unwrap();
        for (i, segment) in storyboard.segments.iter_mut().enumerate() {
            segment.image_path = Some(format!("frames/segment_{:04}.png", i));
        }
        storyboard
    }

    #[test]
    fn test_frame_plan_matches_cut_durations() {
        let plan = assembler().frame_plan(&complete_storyboard(&[0.0, 1.0, 7.0, 10.0])).unwrap();
        let counts: Vec<u64> = plan.iter().map(|s| s.frame_count).collect();
        assert_eq!(counts, vec![30, 180, 90]);
        assert_eq!(plan[1].start_frame, 30);
        assert_eq!(plan[2].image, PathBuf::from("frames/segment_0002.png"));
    }

    #[test]
    fn test_frame_plan_has_no_drift() {
        let cuts = [0.0, 0.333, 1.017, 2.5, 3.3333, 9.98765];
        let config = PipelineConfig {
            video_fps: 24,
            ..PipelineConfig::default()
        };
        let plan = VideoAssembler::new(&config).frame_plan(&complete_storyboard(&cuts)).unwrap();
        let total: u64 = plan.iter().map(|s| s.frame_count).sum();
        assert_eq!(total, (9.98765f64 * 24.0).round() as u64);
        for pair in plan.windows(2) {
            assert_eq!(pair[0].start_frame + pair[0].frame_count, pair[1].start_frame);
        }
    }

    #[test]
    fn test_frame_plan_rejects_missing_images() {
        let mut storyboard = complete_storyboard(&[0.0, 1.0, 7.0, 10.0]);
        storyboard.segments[1].image_path = Some("  ".to_string());
        storyboard.segments[2].image_path = None;
        match assembler().frame_plan(&storyboard) {
            Err(PipelineError::IncompleteStoryboard { missing }) => assert_eq!(missing, vec![1, 2]),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_concat_script_durations() {
        let plan = assembler().frame_plan(&complete_storyboard(&[0.0, 1.0, 7.0, 10.0])).unwrap();
        let script = assembler().concat_script(&plan);
        let expected = "ffconcat version 1.0\n\
            file 'frames/segment_0000.png'\nduration 1.000000\n\
            file 'frames/segment_0001.png'\nduration 6.000000\n\
            file 'frames/segment_0002.png'\nduration 3.000000\n\
            file 'frames/segment_0002.png'\n";
        assert_eq!(script, expected);
    }

    #[test]
    fn test_concat_script_skips_sub_frame_segments_and_escapes_quotes() {
        let mut storyboard = complete_storyboard(&[0.0, 0.01, 2.0]);
        storyboard.segments[1].image_path = Some("frames/it's.png".to_string());
        let plan = assembler().frame_plan(&storyboard).unwrap();
        assert_eq!(plan[0].frame_count, 0);

        let script = assembler().concat_script(&plan);
        assert!(!script.contains("segment_0000"));
        assert!(script.contains("file 'frames/it'\\''s.png'\nduration 2.000000\n"));
    }

    #[test]
    fn test_ffmpeg_args_trim_to_audio_length() {
        let args = assembler().ffmpeg_args(
            Path::new("/tmp/v.ffconcat"),
            Path::new("song.mp3"),
            AudioMode::Copy,
            10.0,
            Path::new("out.mp4"),
        );
        let joined = args.join(" ");
        assert!(joined.contains("-f concat -safe 0 -i /tmp/v.ffconcat -i song.mp3"));
        assert!(joined.contains("-map 0:v:0 -map 1:a:0"));
        assert!(joined.contains("-c:v libx264"));
        assert!(joined.contains("-t 10.000"));
        assert!(joined.contains("format=yuv420p"));
        assert_eq!(args.last().map(String::as_str), Some("out.mp4"));
    }

    #[test]
    fn test_audio_stream_is_copied_when_mp4_accepts_it() {
        assert_eq!(AudioMode::for_codec(CodecId::AAC), AudioMode::Copy);
        assert_eq!(AudioMode::for_codec(CodecId::MP3), AudioMode::Copy);
        assert_eq!(AudioMode::for_codec(CodecId::FLAC), AudioMode::Aac);
        assert_eq!(AudioMode::for_codec(CodecId::PCM_S16LE), AudioMode::Aac);

        let out = Path::new("out.mp4");
        let copy = assembler()
            .ffmpeg_args(Path::new("v.ffconcat"), Path::new("song.mp3"), AudioMode::Copy, 4.0, out)
            .join(" ");
        assert!(copy.contains("-c:a copy -t 4.000"));
        assert!(!copy.contains("aac"));

        let aac = assembler()
            .ffmpeg_args(Path::new("v.ffconcat"), Path::new("song.wav"), AudioMode::Aac, 4.0, out)
            .join(" ");
        assert!(aac.contains("-c:a aac -b:a 192k -t 4.000"));
    }

    #[test]
    fn test_create_video_rejects_incomplete_storyboard() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storyboard.json");
        let mut storyboard = complete_storyboard(&[0.0, 1.0, 7.0, 10.0]);
        storyboard.segments[1].image_path = None;
        storyboard.save(&path).unwrap();

        let result = assembler().create_video(&path, &dir.path().join("out.mp4"));
        assert!(matches!(result, Err(PipelineError::IncompleteStoryboard { missing }) if missing == vec![1]));
    }

    #[test]
    fn test_create_video_rejects_missing_image_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storyboard.json");
        let mut storyboard = complete_storyboard(&[0.0, 2.0, 4.0]);
        let present = dir.path().join("a.png");
        std::fs::write(&present, b"png").unwrap();
        storyboard.segments[0].image_path = Some(present.to_string_lossy().to_string());
        storyboard.segments[1].image_path = Some(dir.path().join("gone.png").to_string_lossy().to_string());
        storyboard.save(&path).unwrap();

        let result = assembler().create_video(&path, &dir.path().join("out.mp4"));
        assert!(matches!(result, Err(PipelineError::IncompleteStoryboard { missing }) if missing == vec![1]));
    }

    #[test]
    fn test_missing_ffmpeg_binary_is_encoding_error() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("a.png");
        let audio = dir.path().join("song.mp3");
        std::fs::write(&image, b"png").unwrap();
        std::fs::write(&audio, b"mp3").unwrap();

        let mut storyboard = Storyboard::from_cuts(audio.to_string_lossy(), &[0.0, 2.0], None).unwrap();
        storyboard.segments[0].image_path = Some(image.to_string_lossy().to_string());
        let path = dir.path().join("storyboard.json");
        storyboard.save(&path).unwrap();

        let output = dir.path().join("out.mp4");
        let result = assembler()
            .with_ffmpeg_bin("/nonexistent/bin/ffmpeg")
            .create_video(&path, &output);
        assert!(matches!(result, Err(PipelineError::Encoding { .. })));
        assert!(!dir.path().join("out.mp4.ffconcat").exists());
    }
}
