use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rotor_core::app::config::{
    DEFAULT_CHUNK_SIZE, DEFAULT_MAX_CONFLICT_RETRIES, DEFAULT_MAX_OBJECT_SIZE,
    DEFAULT_ROTATION_KEY, DEFAULT_UPLOAD_CONCURRENCY,
};
use rotor_core::impls::{JsonCodec, LocalDirObjectStore, YamlCodec};
use rotor_core::ports::RotationCodec;
use rotor_core::{
    ArtifactId, BackupStore, BackupStoreBuilder, CleanupReport, RetentionPolicy, StoreConfig,
};

/// rotor - バックアップ artifact のローテーション
#[derive(Debug, Parser)]
#[command(name = "rotor", version, about, long_about = None)]
struct Cli {
    /// bucket ディレクトリを置くルート
    #[arg(long, env = "ROTOR_ROOT")]
    root: PathBuf,

    /// bucket 名（なければ作成する）
    #[arg(long, env = "ROTOR_BUCKET")]
    bucket: String,

    #[arg(long, env = "ROTOR_ROTATION_KEY", default_value = DEFAULT_ROTATION_KEY)]
    rotation_key: String,

    #[arg(long, env = "ROTOR_MAX_OBJECT_SIZE", default_value_t = DEFAULT_MAX_OBJECT_SIZE)]
    max_object_size: u64,

    #[arg(long, env = "ROTOR_CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: u64,

    #[arg(long, env = "ROTOR_UPLOAD_CONCURRENCY", default_value_t = DEFAULT_UPLOAD_CONCURRENCY)]
    upload_concurrency: usize,

    #[arg(long, env = "ROTOR_MAX_CONFLICT_RETRIES", default_value_t = DEFAULT_MAX_CONFLICT_RETRIES)]
    max_conflict_retries: u32,

    /// rotation document の形式
    #[arg(long, env = "ROTOR_INDEX_FORMAT", value_enum, default_value_t = IndexFormat::Yaml)]
    index_format: IndexFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum IndexFormat {
    Yaml,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Make sure every generation of the hierarchy exists in the index.
    Verify {
        #[arg(long, value_delimiter = ',', required = true)]
        hierarchy: Vec<String>,
    },
    /// Upload a file and print its identifier.
    Put { file: PathBuf },
    /// Upload a file, record it into a generation and trim that generation.
    Backup {
        file: PathBuf,
        /// `<generation>=<keep>`, e.g. `daily=7`
        #[arg(long)]
        policy: RetentionPolicy,
        /// Generations to create before recording (the policy's is always included).
        #[arg(long, value_delimiter = ',')]
        hierarchy: Vec<String>,
    },
    /// Append an identifier to a generation.
    Record { generation: String, id: String },
    /// Delete the oldest identifiers of a generation beyond `keep`.
    Cleanup {
        generation: String,
        #[arg(allow_negative_numbers = true)]
        keep: i64,
    },
    /// Delete an artifact (all of its chunks).
    Delete { id: String },
    /// Print the rotation index.
    Show,
}

impl Cli {
    fn config(&self) -> StoreConfig {
        StoreConfig::new(self.bucket.clone())
            .with_rotation_key(self.rotation_key.clone())
            .with_sizes(self.max_object_size, self.chunk_size)
            .with_upload_concurrency(self.upload_concurrency)
            .with_max_conflict_retries(self.max_conflict_retries)
    }

    fn codec(&self) -> Arc<dyn RotationCodec> {
        match self.index_format {
            IndexFormat::Yaml => Arc::new(YamlCodec),
            IndexFormat::Json => Arc::new(JsonCodec),
        }
    }

    fn backup_store(&self, codec: Arc<dyn RotationCodec>) -> Result<BackupStore> {
        // bucket の find-or-create は core の外で済ませる
        let objects = LocalDirObjectStore::open_or_create(&self.root, &self.bucket)
            .with_context(|| format!("cannot open bucket {} under {}", self.bucket, self.root.display()))?;
        Ok(BackupStoreBuilder::new(self.config())
            .store(objects)
            .shared_codec(codec)
            .build()?)
    }
}

fn print_report(report: &CleanupReport) {
    let failures: Vec<String> = report.failures.iter().map(|e| e.to_string()).collect();
    let summary = serde_json::json!({
        "generation": report.generation,
        "keep": report.keep,
        "deleted": report.deleted,
        "failures": failures,
    });
    println!("{summary}");
}

async fn run(cli: Cli) -> Result<bool> {
    let codec = cli.codec();
    let backups = cli.backup_store(Arc::clone(&codec))?;
    match &cli.command {
        Command::Verify { hierarchy } => {
            let written = backups.verify_hierarchy(hierarchy).await?;
            println!("{}", if written { "index updated" } else { "index already complete" });
        }
        Command::Put { file } => {
            let id = backups.put(file).await?;
            println!("{id}");
        }
        Command::Backup {
            file,
            policy,
            hierarchy,
        } => {
            let mut generations = hierarchy.clone();
            generations.push(policy.generation.clone());
            backups.verify_hierarchy(&generations).await?;
            let id = backups.put(file).await?;
            println!("{id}");
            let report = backups.rotate(&id, policy).await?;
            print_report(&report);
            return Ok(report.is_complete());
        }
        Command::Record { generation, id } => {
            backups.record(generation, &ArtifactId::new(id.clone())).await?;
        }
        Command::Cleanup { generation, keep } => {
            let policy = RetentionPolicy::try_new(generation.clone(), *keep)?;
            let report = backups.cleanup(&policy.generation, policy.keep).await?;
            print_report(&report);
            return Ok(report.is_complete());
        }
        Command::Delete { id } => {
            let removed = backups.delete(&ArtifactId::new(id.clone())).await?;
            println!("{removed} object(s) deleted");
        }
        Command::Show => {
            let index = backups.load_rotation().await?;
            let bytes = codec.encode(&index)?;
            println!("{}", String::from_utf8_lossy(&bytes).trim_end());
        }
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    tracing::debug!(bucket = %cli.bucket, root = %cli.root.display(), "starting");

    if run(cli).await? {
        Ok(ExitCode::SUCCESS)
    } else {
        tracing::warn!("cleanup finished with delete failures");
        Ok(ExitCode::FAILURE)
    }
}
