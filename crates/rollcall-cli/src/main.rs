use anyhow::{Context, Result};
use base64::Engine as _;
use clap::{Parser, Subcommand};
use rollcall_service::{AttendanceService, Config};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-recognition attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recognize the face in an image file and mark attendance
    Recognize {
        /// Path to the image (JPEG/PNG)
        #[arg(short, long)]
        image: PathBuf,
        /// Class to mark attendance for (defaults to the first class)
        #[arg(short, long)]
        class: Option<i64>,
    },
    /// Retrain the identity classifier from the raw image corpus
    Train,
    /// Show engine and classifier status
    Status,
    /// Add a student to the roster
    AddStudent {
        /// Student code (e.g. SV001)
        code: String,
        /// Full display name
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Recognize { image, class } => {
            let bytes = std::fs::read(&image)
                .with_context(|| format!("reading {}", image.display()))?;
            let payload = base64::engine::general_purpose::STANDARD.encode(bytes);

            let service = AttendanceService::new(&config)?;
            let now = chrono::Local::now().naive_local();
            let response = service.recognize_and_mark(payload, class, now).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Train => {
            let service = AttendanceService::new(&config)?;
            let response = service.train().await;
            println!("{}", serde_json::to_string_pretty(&response)?);
            if !response.success {
                std::process::exit(1);
            }
        }
        Commands::Status => {
            let service = AttendanceService::new(&config)?;
            let status = service.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::AddStudent { code, name } => {
            let store = rollcall_store::Store::open(&config.db_path)?;
            let student = store.add_student(&code, &name)?;
            println!("{}", serde_json::to_string_pretty(&student)?);
        }
    }

    Ok(())
}
