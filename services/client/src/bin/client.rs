//! services/client/src/bin/client.rs

use client_lib::{
    adapters::{FileSessionStore, HttpGenerationAdapter},
    config::Config,
    error::ClientError,
    runner::{AppState, Generator, StreamOutcome},
};
use page_forge_core::{CacheKey, Outline, RecordId, Reconciler, ReferenceMode};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "usage:
  client generate <outline-file> <record-id> [topic]
  client continue <record-id>
  client retry <record-id>
  client stop <record-id>
  client regenerate <record-id> <position>
  client replay <capture-file> [record-id]
  client show [record-id]";

enum Command {
    Generate {
        outline: String,
        record_id: RecordId,
        topic: Option<String>,
    },
    Continue(RecordId),
    Retry(RecordId),
    Stop(RecordId),
    Regenerate {
        record_id: RecordId,
        position: usize,
    },
    Replay {
        capture: String,
        record_id: Option<RecordId>,
    },
    Show(Option<RecordId>),
}

impl Command {
    fn parse(args: &[String]) -> Option<Self> {
        let arg = |i: usize| args.get(i).cloned();
        let record = |i: usize| args.get(i).map(RecordId::new);

        let command = match args.first()?.as_str() {
            "generate" => Self::Generate {
                outline: arg(1)?,
                record_id: record(2)?,
                topic: arg(3),
            },
            "continue" => Self::Continue(record(1)?),
            "retry" => Self::Retry(record(1)?),
            "stop" => Self::Stop(record(1)?),
            "regenerate" => Self::Regenerate {
                record_id: record(1)?,
                position: arg(2)?.parse().ok()?,
            },
            "replay" => Self::Replay {
                capture: arg(1)?,
                record_id: record(2),
            },
            "show" => Self::Show(record(1)),
            _ => return None,
        };
        Some(command)
    }
}

fn cache_key(record_id: Option<RecordId>) -> CacheKey {
    record_id.map_or(CacheKey::Draft, CacheKey::Record)
}

fn print_summary(reconciler: &Reconciler) {
    let session = reconciler.state();
    let progress = reconciler.progress();
    println!(
        "stage: {:?}  status: {:?}  images: {}/{}",
        session.stage, progress.status, progress.completed, progress.total
    );
    if let Some(task_id) = &session.task_id {
        println!("task: {task_id}");
    }
    for page in reconciler.pages() {
        let first_line = page.text.lines().next().unwrap_or_default();
        match reconciler.image_at(page.position) {
            Some(image) => println!(
                "  [{}] {:?} {:?} {} {}",
                page.position,
                page.kind,
                image.status,
                image.locator,
                image.error_detail.as_deref().unwrap_or(first_line)
            ),
            None => println!("  [{}] {:?} (no image) {}", page.position, page.kind, first_line),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), ClientError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Arc::new(Config::from_env()?);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded.");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = Command::parse(&args) else {
        eprintln!("{USAGE}");
        return Err(ClientError::Internal("invalid arguments".to_string()));
    };

    // --- 2. Initialize Adapters & Shared State ---
    let http = reqwest::Client::builder()
        .timeout(config.request_timeout)
        .build()?;
    let transport = Arc::new(HttpGenerationAdapter::new(http, config.server_url.clone()));
    let store = Arc::new(FileSessionStore::new(&config.cache_dir)?);
    info!(server = %config.server_url, cache = %store.dir().display(), "Adapters ready");

    let generator = Generator::new(AppState {
        config: config.clone(),
        transport,
        cache: page_forge_core::SessionCache::new(store),
    });

    // --- 3. Run the Command ---
    match command {
        Command::Generate {
            outline,
            record_id,
            topic,
        } => {
            let text = tokio::fs::read_to_string(&outline).await?;
            let parsed = Outline::parse(&text);

            let mut reconciler = generator.open_session(CacheKey::Draft);
            reconciler.reset();
            if let Some(topic) = topic {
                reconciler.set_topic(topic);
            }
            reconciler.set_outline(parsed.raw, parsed.pages, parsed.metadata);
            reconciler.bind_record(record_id);

            let outcome = generator.generate(&mut reconciler, None).await;
            print_summary(&reconciler);
            report(outcome?);
        }
        Command::Continue(record_id) => {
            let mut reconciler = generator.open_session(CacheKey::Record(record_id));
            let outcome = generator.continue_generation(&mut reconciler).await;
            print_summary(&reconciler);
            report(outcome?);
        }
        Command::Retry(record_id) => {
            let mut reconciler = generator.open_session(CacheKey::Record(record_id));
            let outcome = generator.retry_failed(&mut reconciler).await;
            print_summary(&reconciler);
            report(outcome?);
        }
        Command::Stop(record_id) => {
            generator.stop(&record_id).await?;
            println!("stop requested for {record_id}");
        }
        Command::Regenerate {
            record_id,
            position,
        } => {
            let mut reconciler = generator.open_session(CacheKey::Record(record_id));
            let regenerated = generator
                .regenerate(&mut reconciler, position, ReferenceMode::Cover)
                .await;
            print_summary(&reconciler);
            println!("page {position} now shows {}", regenerated?.locator);
        }
        Command::Replay { capture, record_id } => {
            let mut reconciler = generator.open_session(cache_key(record_id));
            let outcome = generator.replay(&capture, &mut reconciler).await;
            print_summary(&reconciler);
            report(outcome?);
        }
        Command::Show(record_id) => {
            let key = cache_key(record_id);
            match Reconciler::restore(generator.state().cache.clone(), key.clone()) {
                Some(reconciler) => print_summary(&reconciler),
                None => println!("no cached session under {key}"),
            }
        }
    }

    Ok(())
}

fn report(outcome: StreamOutcome) {
    match outcome {
        StreamOutcome::Finished => println!("generation finished"),
        StreamOutcome::Stopped => println!("generation stopped; run `client continue` to resume"),
        StreamOutcome::RetryFinished => println!("retry finished"),
        StreamOutcome::Closed => {
            println!("stream closed early; run `client continue` to resume")
        }
    }
}
