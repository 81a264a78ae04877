use ffmpeg_next as ffmpeg;
use std::path::{Path, PathBuf};
use std::sync::Once;
use std::time::Instant;
use tracing::{debug, info};

use crate::error::{PipelineError, Result};

/// 节拍分析使用的采样率
pub const ANALYSIS_SAMPLE_RATE: u32 = 22_050;

static INIT: Once = Once::new();

/// 初始化 FFmpeg，并把日志级别设置为 ERROR，抑制警告和信息消息
fn init_ffmpeg() -> Result<()> {
    let mut result = Ok(());
    INIT.call_once(|| {
        result = ffmpeg::init();
        unsafe {
            ffmpeg::sys::av_log_set_level(ffmpeg::sys::AV_LOG_ERROR as i32);
        }
    });
    result.map_err(|e| PipelineError::Config(format!("初始化 FFmpeg 失败: {}", e)))
}

/// 解码后的音频：单声道 f32 波形 + 采样率
#[derive(Debug, Clone)]
pub struct AudioHandle {
    pub path: PathBuf,
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioHandle {
    pub fn new(path: impl Into<PathBuf>, samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            path: path.into(),
            samples,
            sample_rate,
        }
    }

    /// 音频时长（秒）
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// 解码音频文件，混音为单声道并重采样到 [`ANALYSIS_SAMPLE_RATE`]
pub fn load_audio(path: impl AsRef<Path>) -> Result<AudioHandle> {
    let path = path.as_ref();
    let start = Instant::now();
    let fail = |e: ffmpeg::Error| PipelineError::audio(path, e.to_string());

    if !path.is_file() {
        return Err(PipelineError::audio(path, "文件不存在"));
    }
    init_ffmpeg()?;

    let mut ictx = ffmpeg::format::input(&path).map_err(fail)?;
    let stream = ictx
        .streams()
        .best(ffmpeg::media::Type::Audio)
        .ok_or_else(|| PipelineError::audio(path, "未找到音频流"))?;
    let stream_index = stream.index();

    let decoder_context =
        ffmpeg::codec::context::Context::from_parameters(stream.parameters()).map_err(fail)?;
    let mut decoder = decoder_context.decoder().audio().map_err(fail)?;

    // 部分容器（例如 WAV）不声明声道布局，按声道数取默认布局
    let input_layout = if decoder.channel_layout().is_empty() {
        ffmpeg::ChannelLayout::default(i32::from(decoder.channels()))
    } else {
        decoder.channel_layout()
    };

    let mut resampler = ffmpeg::software::resampling::Context::get(
        decoder.format(),
        input_layout,
        decoder.rate(),
        ffmpeg::format::Sample::F32(ffmpeg::format::sample::Type::Packed),
        ffmpeg::ChannelLayout::MONO,
        ANALYSIS_SAMPLE_RATE,
    )
    .map_err(fail)?;

    debug!(
        "🎵 [音频解码] 输入: {} Hz, {} 声道, 格式 {:?}",
        decoder.rate(),
        decoder.channels(),
        decoder.format()
    );

    let mut samples: Vec<f32> = Vec::new();
    let receive_frames = |decoder: &mut ffmpeg::decoder::Audio,
                              resampler: &mut ffmpeg::software::resampling::Context,
                              samples: &mut Vec<f32>|
     -> std::result::Result<(), ffmpeg::Error> {
        let mut decoded = ffmpeg::frame::Audio::empty();
        while decoder.receive_frame(&mut decoded).is_ok() {
            decoded.set_channel_layout(input_layout);
            let mut resampled = ffmpeg::frame::Audio::empty();
            resampler.run(&decoded, &mut resampled)?;
            append_samples(&resampled, samples);
        }
        Ok(())
    };

    for (stream, packet) in ictx.packets() {
        if stream.index() != stream_index {
            continue;
        }
        // 损坏的数据包直接跳过，整体解码失败才算错误
        if decoder.send_packet(&packet).is_err() {
            continue;
        }
        receive_frames(&mut decoder, &mut resampler, &mut samples).map_err(fail)?;
    }
    decoder.send_eof().map_err(fail)?;
    receive_frames(&mut decoder, &mut resampler, &mut samples).map_err(fail)?;

    let mut tail = ffmpeg::frame::Audio::empty();
    if resampler.flush(&mut tail).is_ok() && tail.samples() > 0 {
        append_samples(&tail, &mut samples);
    }

    if samples.is_empty() {
        return Err(PipelineError::audio(path, "没有解码出任何音频采样"));
    }

    let audio = AudioHandle::new(path, samples, ANALYSIS_SAMPLE_RATE);
    info!(
        "✅ [音频解码] {} 解码完成，时长 {:.2}秒，耗时 {:.2}秒",
        path.display(),
        audio.duration(),
        start.elapsed().as_secs_f64()
    );
    Ok(audio)
}

/// 探测音频流的编码格式，不解码
pub fn probe_audio_codec(path: impl AsRef<Path>) -> Result<ffmpeg::codec::Id> {
    let path = path.as_ref();
    init_ffmpeg()?;
    let ictx = ffmpeg::format::input(&path).map_err(|e| PipelineError::audio(path, e.to_string()))?;
    let codec = ictx
        .streams()
        .best(ffmpeg::media::Type::Audio)
        .map(|stream| stream.parameters().id())
        .ok_or_else(|| PipelineError::audio(path, "未找到音频流"))?;
    debug!("🎵 [音频探测] {}: {:?}", path.display(), codec);
    Ok(codec)
}

fn append_samples(frame: &ffmpeg::frame::Audio, samples: &mut Vec<f32>) {
    let count = frame.samples();
    if count == 0 {
        return;
    }
    let plane = frame.plane::<f32>(0);
    samples.extend_from_slice(&plane[..count.min(plane.len())]);
}
