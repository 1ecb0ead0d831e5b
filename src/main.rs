mod cli;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use cli::{Cli, Command};
use smartfields::anthropic::AnthropicClient;
use smartfields::input::{BatchFile, demo_batch};
use smartfields::ui::{BatchProgress, print_batch_summary, print_note_outcome};
use smartfields::{
    AnthropicProvider, BatchCoordinator, BatchJob, DependencyGraph, EchoProvider,
    GenerationContext, NoopWriter, NoteId, Provider, RegenerationPolicy, SmartFieldsConfig,
    create_event_channel,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::WARN };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    let mut config = SmartFieldsConfig::load()?;
    if let Some(n) = cli.max_concurrency {
        config.max_concurrency = n;
    }
    if let Some(n) = cli.max_retries {
        config.max_retries = n;
    }

    match cli.command {
        Command::Run {
            file,
            force,
            target,
            note,
        } => {
            let provider = provider_from_config(&config)?;
            let policy = if force {
                RegenerationPolicy::ForceAll
            } else {
                RegenerationPolicy::FillEmptyOnly
            };
            let batch = BatchFile::load(&file)?;
            match (target, note) {
                (Some(target), Some(note_id)) => {
                    run_target(&config, provider, batch, policy, &target, note_id, &file).await
                }
                _ => run_batch(&config, provider, batch, policy).await,
            }
        }
        Command::Check { file } => check(&BatchFile::load(&file)?),
        Command::Demo => {
            let policy = RegenerationPolicy::FillEmptyOnly;
            run_batch(&config, Arc::new(EchoProvider), demo_batch(), policy).await
        }
    }
}

fn provider_from_config(config: &SmartFieldsConfig) -> Result<Arc<dyn Provider>> {
    if config.api_key.is_empty() {
        warn!("no API key configured, using the offline echo provider");
        return Ok(Arc::new(EchoProvider));
    }
    let client = AnthropicClient::new(config.api_key.clone(), config.request_timeout())
        .context("building HTTP client")?;
    Ok(Arc::new(AnthropicProvider::new(client, config.chat_model.clone())))
}

async fn run_batch(
    config: &SmartFieldsConfig,
    provider: Arc<dyn Provider>,
    batch: BatchFile,
    policy: RegenerationPolicy,
) -> Result<()> {
    let total: usize = batch
        .notes
        .iter()
        .filter_map(|n| batch.specs_for(n))
        .map(<[_]>::len)
        .sum();
    let BatchFile {
        note_types,
        mut notes,
    } = batch;

    let (tx, rx) = create_event_channel();
    let coordinator =
        BatchCoordinator::new(GenerationContext::from_config(config).with_events(tx), provider);
    let progress = tokio::spawn(BatchProgress::start(total as u64, "generating").follow(rx));

    let job = BatchJob::new();
    let on_ctrl_c = job.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("cancellation requested");
            on_ctrl_c.cancel();
        }
    });

    let result = coordinator
        .run_batch(&job, &mut notes, &note_types, policy, &NoopWriter)
        .await?;
    drop(coordinator);
    progress.await.context("progress task")?.finish();

    for outcome in &result.notes {
        print_note_outcome(outcome);
    }
    print_batch_summary(&result);
    Ok(())
}

async fn run_target(
    config: &SmartFieldsConfig,
    provider: Arc<dyn Provider>,
    batch: BatchFile,
    policy: RegenerationPolicy,
    target: &str,
    note_id: NoteId,
    file: &Path,
) -> Result<()> {
    let BatchFile {
        note_types,
        mut notes,
    } = batch;
    let Some(note) = notes.iter_mut().find(|n| n.id == note_id) else {
        bail!("note {note_id} not found in {}", file.display());
    };

    let coordinator = BatchCoordinator::new(GenerationContext::from_config(config), provider);
    let result = coordinator
        .run_note(note, &note_types, policy, Some(target), &NoopWriter)
        .await?;
    print_note_outcome(&result.outcome);
    Ok(())
}

fn check(batch: &BatchFile) -> Result<()> {
    let mut invalid = 0;
    for note in &batch.notes {
        let Some(specs) = batch.specs_for(note) else {
            println!("note {}: no smart fields for {}", note.id, note.note_type);
            continue;
        };
        match DependencyGraph::build(note, specs) {
            Ok(graph) => {
                let layers: Vec<String> = graph
                    .layers()
                    .iter()
                    .map(|layer| layer.join(", "))
                    .collect();
                println!("note {}: ok [{}]", note.id, layers.join("] -> ["));
            }
            Err(err) => {
                invalid += 1;
                println!("note {}: {err}", note.id);
            }
        }
    }
    if invalid > 0 {
        bail!("{invalid} note(s) failed validation");
    }
    Ok(())
}
