use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "patchflow")]
#[command(version)]
#[command(about = "Normalize, validate and apply generated code patches", long_about = None)]
pub struct Cli {
    /// 설정 파일 경로 (기본: ~/.patchflow/config.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    /// 디버그 로그 출력 (RUST_LOG가 없을 때)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// 이벤트 허브 실행 (Unix socket)
    Serve {
        /// 소켓 경로 (설정 파일의 socket_path보다 우선)
        #[arg(long)]
        socket: Option<PathBuf>,
    },

    /// 배치를 검증하고 적용
    Process {
        /// 생성기 출력 또는 정규 배치 JSON 파일
        file: PathBuf,

        /// apply 도구에 --dry-run 전달
        #[arg(long)]
        dry_run: bool,

        /// 작업 디렉토리
        #[arg(short = 'w', long)]
        working_dir: Option<PathBuf>,

        /// 이벤트 로그 파일 (기본: ~/.patchflow/events.jsonl)
        #[arg(long)]
        event_log: Option<PathBuf>,
    },

    /// 검증만 수행
    Validate {
        file: PathBuf,
    },

    /// 정규 배치 JSON으로 변환해서 출력
    Normalize {
        file: PathBuf,
    },
}
