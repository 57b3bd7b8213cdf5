//! 가격 알림 데몬.

use alert_core::{init_logging, AppConfig, LogConfig};
use alert_engine::{AlertEngine, InMemoryAlertStore, StoredUser};
use alert_notification::{TelegramConfig, TelegramSink};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "alertd")]
#[command(about = "Exchange price alert streaming daemon", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// 설정 파일 경로
    #[arg(long, default_value = "config/default.toml")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// 저장된 알림을 복구하고 Ctrl-C까지 스트리밍
    Run {
        /// 초기 사용자/알림 JSON 파일 (StoredUser 배열)
        #[arg(long)]
        seed: Option<PathBuf>,
    },

    /// 적용된 설정 출력 (봇 토큰은 가림)
    Config,
}

fn load_seed(path: &Path) -> Result<Vec<StoredUser>, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)?;

    match cli.command {
        Commands::Config => {
            let mut shown = config.clone();
            if !shown.notifications.telegram.bot_token.is_empty() {
                shown.notifications.telegram.bot_token = "***".to_string();
            }
            println!("{}", serde_json::to_string_pretty(&shown)?);
        }
        Commands::Run { seed } => {
            init_logging(LogConfig::from(&config.logging))?;
            tracing::info!(config = %cli.config.display(), "alertd 시작");

            let section = &config.notifications.telegram;
            let telegram = match TelegramConfig::from_section(section) {
                Ok(telegram) => telegram,
                Err(e) if !section.enabled => {
                    tracing::debug!("텔레그램 비활성화: {}", e);
                    TelegramConfig {
                        enabled: false,
                        ..TelegramConfig::new("")
                    }
                }
                Err(e) => return Err(e.into()),
            };

            let users = match seed {
                Some(path) => {
                    let users = load_seed(&path)?;
                    tracing::info!(path = %path.display(), users = users.len(), "초기 알림 로드");
                    users
                }
                None => Vec::new(),
            };

            let store = Arc::new(InMemoryAlertStore::with_users(users));
            let sink = Arc::new(TelegramSink::new(telegram)?);
            let engine = AlertEngine::from_config(&config, store, sink);

            let report = engine.recover().await?;
            tracing::info!(
                users = report.users,
                streams = report.streams,
                "복구 완료, 종료 신호 대기"
            );

            tokio::signal::ctrl_c().await?;
            tracing::info!("종료 신호 수신, 스트림 종료 중...");

            if let Err(e) = engine.shutdown().await {
                tracing::warn!("종료 처리 중 문제 발생: {}", e);
            }
            tracing::info!("alertd 종료");
        }
    }

    Ok(())
}
