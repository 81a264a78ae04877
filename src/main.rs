use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::{Path, PathBuf};
use vibe_frame::config::{ConfigLayer, ConfigLoader, Credentials, ExtendedConfig, ImageBackend};
use vibe_frame::processor::{Pipeline, RunOutput};
use vibe_frame::report::StageReport;

/// 音乐视频分镜工具：按节拍切分音频，生成每个镜头的画面并合成视频
#[derive(Parser, Debug)]
#[command(name = "vibe-frame")]
#[command(about = "音乐视频生成：节拍切分 → 提示词增强 → 图像生成 → 视频合成", long_about = None)]
struct Args {
    /// 配置文件路径（可选，支持 .ini 格式）
    /// 优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// 工作目录（storyboard.json、frames/、final_video.mp4）
    /// 可通过环境变量 VIBE_FRAME_WORK_DIR 或配置文件设置
    #[arg(short, long, global = true)]
    work_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// 各子命令共用的配置覆盖项
#[derive(ClapArgs, Debug)]
struct Overrides {
    /// 相邻切点的最小间隔（秒）
    #[arg(long)]
    min_interval: Option<f64>,

    /// 起音检测阈值 (0.0-1.0)，值越小切点越多
    #[arg(long)]
    onset_threshold: Option<f64>,

    /// 追加到默认提示词的画面风格
    #[arg(long)]
    prompt_style: Option<String>,

    /// 文本模型
    #[arg(long)]
    text_model: Option<String>,

    /// 图像后端（huggingface, openai）
    #[arg(long)]
    image_backend: Option<ImageBackend>,

    /// 图像模型
    #[arg(long)]
    image_model: Option<String>,

    /// 每个阶段的并发请求数
    #[arg(long)]
    max_concurrency: Option<usize>,

    /// 输出视频帧率
    #[arg(long)]
    fps: Option<u32>,

    /// 每个阶段完成后回调的 Webhook URL
    #[arg(long)]
    webhook_url: Option<String>,

    /// 文本服务 API Key（优先于 OPENROUTER_API_KEY）
    #[arg(long)]
    text_api_key: Option<String>,

    /// 图像服务 API Key（优先于 HUGGINGFACE_API_TOKEN / OPENAI_API_KEY）
    #[arg(long)]
    image_api_key: Option<String>,
}

impl Overrides {
    fn layer(&self) -> ConfigLayer {
        ConfigLayer {
            min_interval: self.min_interval,
            onset_threshold: self.onset_threshold,
            prompt_style: self.prompt_style.clone(),
            text_model: self.text_model.clone(),
            image_backend: self.image_backend,
            image_model: self.image_model.clone(),
            max_concurrency: self.max_concurrency,
            video_fps: self.fps,
            webhook_url: self.webhook_url.clone(),
            ..ConfigLayer::default()
        }
    }

    fn credentials(&self) -> Credentials {
        Credentials::new(self.text_api_key.clone(), self.image_api_key.clone())
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 分析音频，生成 storyboard.json
    Analyze {
        /// 输入音频文件路径
        #[arg(short, long)]
        input: PathBuf,

        #[command(flatten)]
        overrides: Overrides,
    },
    /// 用文本服务增强每个片段的提示词
    Enhance {
        #[command(flatten)]
        overrides: Overrides,
    },
    /// 为每个片段生成图片
    Synthesize {
        #[command(flatten)]
        overrides: Overrides,
    },
    /// 把图片和音频合成为视频
    Assemble {
        #[command(flatten)]
        overrides: Overrides,
    },
    /// 依次执行全部四个阶段
    Run {
        /// 输入音频文件路径
        #[arg(short, long)]
        input: PathBuf,

        #[command(flatten)]
        overrides: Overrides,
    },
    /// Web 服务模式：启动 HTTP 服务器
    Serve {
        /// 监听地址（默认从环境变量 VIBE_FRAME_PORT 读取，如果不存在则使用 0.0.0.0:9000）
        #[arg(short, long)]
        bind: Option<String>,

        #[command(flatten)]
        overrides: Overrides,
    },
    /// 生成默认配置文件
    InitConfig {
        /// 输出路径
        #[arg(short, long, default_value = "vibe-frame.ini")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let overrides = match &args.command {
        Commands::InitConfig { output } => {
            ConfigLoader::create_default_config(output)
                .with_context(|| format!("生成配置文件失败: {}", output.display()))?;
            println!("已生成配置文件: {}", output.display());
            return Ok(());
        }
        Commands::Analyze { overrides, .. }
        | Commands::Enhance { overrides }
        | Commands::Synthesize { overrides }
        | Commands::Assemble { overrides }
        | Commands::Run { overrides, .. }
        | Commands::Serve { overrides, .. } => overrides,
    };

    let extended = ConfigLoader::load_extended_config(args.config.as_deref(), &overrides.layer())
        .context("加载配置失败")?;
    init_logging(&extended.log_level);

    let work_dir = args.work_dir.clone().unwrap_or_else(|| extended.work_dir.clone());
    std::fs::create_dir_all(&work_dir)
        .with_context(|| format!("创建工作目录失败: {}", work_dir.display()))?;

    let credentials = Credentials::resolve(
        overrides.credentials(),
        extended.pipeline.image_backend,
        &extended.file_credentials,
    );
    let pipeline = Pipeline::new(extended.pipeline.clone(), credentials, &work_dir);

    match &args.command {
        Commands::Analyze { input, overrides } => {
            let storyboard = pipeline
                .analyze(input, overrides.min_interval)
                .await
                .context("分析音频失败")?;
            println!("success");
            println!(
                "分镜: {}（{} 个片段）",
                pipeline.storyboard_path().display(),
                storyboard.segments.len()
            );
        }
        Commands::Enhance { .. } => {
            let report = pipeline.enhance().await.context("提示词增强失败")?;
            print_report(&report);
        }
        Commands::Synthesize { .. } => {
            let report = pipeline.synthesize().await.context("图像生成失败")?;
            print_report(&report);
        }
        Commands::Assemble { .. } => {
            let video = pipeline.assemble().await.context("视频合成失败")?;
            println!("success");
            println!("视频: {}", video.display());
        }
        Commands::Run { input, overrides } => {
            let output = pipeline.run(input, overrides.min_interval).await;
            finish_run(&output)?;
        }
        Commands::Serve { bind, .. } => {
            // 优先使用命令行参数，其次使用环境变量 VIBE_FRAME_PORT，最后使用默认值 9000
            let bind_addr = bind.clone().unwrap_or_else(|| {
                std::env::var("VIBE_FRAME_PORT")
                    .map(|port| format!("0.0.0.0:{}", port))
                    .unwrap_or_else(|_| "0.0.0.0:9000".to_string())
            });
            start_web_server(&bind_addr, &extended, &work_dir).await?;
        }
        Commands::InitConfig { .. } => {}
    }

    Ok(())
}

fn init_logging(level: &str) {
    let level = level.parse::<tracing::Level>().unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();
}

fn print_report(report: &StageReport) {
    println!("{}", report.message());
    for (index, reason) in &report.failures {
        println!("  片段 {}: {}", index, reason);
    }
}

fn finish_run(output: &RunOutput) -> Result<()> {
    println!("{}", output.summary());
    if let Some(video) = &output.video_path {
        println!("视频: {}", video.display());
    }
    if output.failed() {
        anyhow::bail!("流水线未完成");
    }
    Ok(())
}

async fn start_web_server(bind: &str, extended: &ExtendedConfig, work_dir: &Path) -> Result<()> {
    use vibe_frame::handler::{self, AppState};

    let state = AppState::new(
        extended.pipeline.clone(),
        extended.file_credentials.clone(),
        work_dir,
    );
    let app = handler::router(state);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .context(format!("绑定地址失败: {}", bind))?;

    tracing::info!("Web 服务器启动在: http://{}", bind);
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    tracing::info!("可用端点:");
    tracing::info!("  • 健康检查: GET  http://{}/health", bind);
    tracing::info!("  • 分析音频: POST http://{}/analyze", bind);
    tracing::info!("  • 查看分镜: GET  http://{}/storyboard", bind);
    tracing::info!("  • 编辑分镜: PUT  http://{}/storyboard", bind);
    tracing::info!("  • 生成视频: POST http://{}/generate", bind);
    tracing::info!("  • 输出文件: GET  http://{}/files/final_video.mp4", bind);
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    axum::serve(listener, app)
        .await
        .context("启动服务器失败")?;

    Ok(())
}
