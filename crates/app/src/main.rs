use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use privacy_rag_core::{
    archive_upload, state_folder, AnswerPipeline, AnswerRecord, BillIngestor,
    CharacterNgramEmbedder, ChatCompletionsClient, Embedder, EmbeddingConfig,
    ExplainabilitySummarizer, IndexConfig, IngestionOptions, IngestionReport, JurisdictionType,
    LlmConfig, LopdfExtractor, MetadataFilter, OpenAiEmbedder, Outcome, QueryRequest,
    QuerySession, RetryPolicy, UploadForm, VectorIndexManager,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

type Model = Arc<ChatCompletionsClient>;

#[derive(Parser)]
#[command(name = "privacy-rag", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Folder holding the persisted vector index.
    #[arg(long, env = "RAG_INDEX_DIR", default_value = "./db_manager/vector_index")]
    index_dir: PathBuf,

    /// OpenAI-compatible base URL for completions.
    #[arg(long, env = "LLM_BASE_URL", default_value = "http://localhost:11434/v1")]
    llm_base_url: String,

    #[arg(long, env = "LLM_API_KEY", hide_env_values = true)]
    llm_api_key: Option<String>,

    #[arg(long, env = "LLM_MODEL", default_value = "gemini-2.0-flash-001")]
    llm_model: String,

    /// Per-request timeout for model and embedding calls.
    #[arg(long, default_value = "60")]
    request_timeout_secs: u64,

    /// Attempts per model or embedding call before giving up.
    #[arg(long, default_value = "3")]
    max_attempts: usize,

    /// Base URL for remote embeddings; the offline trigram embedder is used
    /// when unset.
    #[arg(long, env = "EMBEDDING_BASE_URL")]
    embedding_base_url: Option<String>,

    #[arg(long, env = "EMBEDDING_API_KEY", hide_env_values = true)]
    embedding_api_key: Option<String>,

    #[arg(long, env = "EMBEDDING_MODEL", default_value = "text-embedding-004")]
    embedding_model: String,
}

#[derive(Args, Clone)]
struct FilterArgs {
    /// Restrict retrieval to one state, e.g. "Texas".
    #[arg(long)]
    state: Option<String>,

    /// Restrict retrieval to one bill type.
    #[arg(long)]
    jurisdiction: Option<String>,

    /// Number of chunks to retrieve.
    #[arg(long, default_value = "10")]
    k: usize,

    /// Minimum relevance score for a retrieved chunk.
    #[arg(long, default_value = "0.2")]
    score_floor: f32,

    /// Verify with free text and sentinel matching instead of JSON replies.
    #[arg(long, default_value_t = false)]
    plain_verification: bool,

    /// Directory that stored `./...` document paths are relative to, used
    /// when a cited PDF has moved from where it was ingested.
    #[arg(long, env = "RAG_BASE_DIR", default_value = ".")]
    base_dir: PathBuf,
}

#[derive(Subcommand)]
enum Command {
    /// Extract, classify, chunk and index bill PDFs.
    Ingest {
        /// Folder that contains PDFs recursively.
        #[arg(long, conflicts_with_all = ["pdf", "state"])]
        folder: Option<PathBuf>,
        /// Individual PDF files.
        #[arg(long)]
        pdf: Vec<PathBuf>,
        /// Ingest the bills under `<pdf-root>/<state>`.
        #[arg(long)]
        state: Option<String>,
        #[arg(long, default_value = "pdfs")]
        pdf_root: PathBuf,
        #[arg(long, default_value = "800")]
        chunk_size: usize,
        #[arg(long, default_value = "200")]
        chunk_overlap: usize,
    },
    /// Index one PDF with user-supplied jurisdiction details.
    Upload {
        #[arg(long)]
        file: PathBuf,
        /// Bill type, e.g. "State level sectoral" or "Federal level".
        #[arg(long)]
        jurisdiction: String,
        #[arg(long)]
        state: Option<String>,
        #[arg(long)]
        sector: Option<String>,
        /// Also keep a copy under `<dir>/<State or Type>/<Title>.pdf`.
        #[arg(long)]
        archive_dir: Option<PathBuf>,
    },
    /// Answer one question from the indexed bills.
    Ask {
        #[arg(long)]
        question: String,
        #[command(flatten)]
        filter: FilterArgs,
        /// Print the full answer record as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Read questions from stdin, one per line.
    Chat {
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Print the stored text of one chunk.
    Lookup {
        #[arg(long)]
        chunk_id: String,
    },
    /// List the documents in the index.
    Documents {
        #[arg(long)]
        state: Option<String>,
    },
}

impl Cli {
    fn retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            ..RetryPolicy::default()
        }
    }

    fn model(&self) -> anyhow::Result<Model> {
        let config = LlmConfig {
            base_url: self.llm_base_url.clone(),
            api_key: self.llm_api_key.clone(),
            model: self.llm_model.clone(),
            timeout: Duration::from_secs(self.request_timeout_secs),
            retry: self.retry(),
        };
        Ok(Arc::new(
            ChatCompletionsClient::new(config).context("building completion client")?,
        ))
    }

    fn embedder(&self) -> anyhow::Result<Box<dyn Embedder>> {
        match &self.embedding_base_url {
            Some(base_url) => {
                let config = EmbeddingConfig {
                    base_url: base_url.clone(),
                    api_key: self.embedding_api_key.clone(),
                    model: self.embedding_model.clone(),
                    batch_size: 64,
                    timeout: Duration::from_secs(self.request_timeout_secs),
                    retry: self.retry(),
                };
                Ok(Box::new(
                    OpenAiEmbedder::new(config).context("building embedding client")?,
                ))
            }
            None => Ok(Box::new(CharacterNgramEmbedder::default())),
        }
    }

    fn index_config(&self) -> IndexConfig {
        IndexConfig::in_folder(&self.index_dir)
    }
}

impl FilterArgs {
    fn metadata_filter(&self) -> anyhow::Result<MetadataFilter> {
        let mut filter = MetadataFilter::new();
        if let Some(state) = self.state.as_deref().filter(|state| !state.trim().is_empty()) {
            filter = filter.with("State", state.trim());
        }
        if let Some(raw) = &self.jurisdiction {
            let Some(kind) = JurisdictionType::parse_label(raw) else {
                bail!("unknown jurisdiction type: {raw}");
            };
            filter = filter.with("Type", kind.label());
        }
        Ok(filter)
    }

    fn query(&self, question: &str) -> anyhow::Result<QueryRequest> {
        let mut request = QueryRequest::new(question, self.metadata_filter()?);
        request.k = self.k;
        request.score_floor = self.score_floor;
        Ok(request)
    }
}

type Session = QuerySession<Box<dyn Embedder>, Model, LopdfExtractor>;

fn open_session(cli: &Cli, filter: &FilterArgs) -> anyhow::Result<Session> {
    let index = VectorIndexManager::load(cli.index_config(), cli.embedder()?)
        .context("loading vector index; run `privacy-rag ingest` first")?;
    let model = cli.model()?;
    Ok(QuerySession::new(
        index,
        AnswerPipeline::new(model.clone()).with_structured_verification(!filter.plain_verification),
        ExplainabilitySummarizer::new(model, LopdfExtractor).with_base_dir(filter.base_dir.clone()),
    ))
}

fn print_answer(record: &AnswerRecord) {
    println!("{}", record.verified_answer);

    if record.outcome == Outcome::NoResults {
        return;
    }
    println!("---");
    for chunk in &record.retrieved {
        println!("[{:.4}] {}", chunk.score, chunk.chunk_id);
    }
    for entry in &record.explanations {
        println!(
            "\n{} (page {}) {}\n{}",
            entry.document_title, entry.page, entry.source_path, entry.summary_text
        );
    }
}

fn print_report(report: &IngestionReport) -> anyhow::Result<()> {
    for skipped in &report.skipped_files {
        warn!(path = %skipped.path.display(), reason = %skipped.reason, "skipped pdf");
    }
    println!("{}", serde_json::to_string_pretty(&report.records)?);
    println!(
        "{} chunks added, {} already indexed, {} files skipped at {}",
        report.chunks_added,
        report.chunks_skipped,
        report.skipped_files.len(),
        Utc::now().to_rfc3339()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        index_dir = %cli.index_dir.display(),
        "privacy-rag boot"
    );

    match &cli.command {
        Command::Ingest {
            folder,
            pdf,
            state,
            pdf_root,
            chunk_size,
            chunk_overlap,
        } => {
            let options = IngestionOptions {
                chunk_size: *chunk_size,
                chunk_overlap: *chunk_overlap,
            };
            let ingestor = BillIngestor::new(LopdfExtractor, cli.model()?, options)?;
            let mut index = VectorIndexManager::create_or_load(cli.index_config(), cli.embedder()?);

            let report = match (folder, state) {
                (Some(folder), _) => ingestor.ingest_folder(folder, &mut index).await?,
                (None, Some(state)) => {
                    let folder = state_folder(pdf_root, state);
                    ingestor.ingest_folder(&folder, &mut index).await?
                }
                (None, None) if !pdf.is_empty() => ingestor.ingest_paths(pdf, &mut index).await?,
                (None, None) => bail!("pass --folder, --state or at least one --pdf"),
            };
            print_report(&report)?;
        }
        Command::Upload {
            file,
            jurisdiction,
            state,
            sector,
            archive_dir,
        } => {
            let Some(jurisdiction) = JurisdictionType::parse_label(jurisdiction) else {
                bail!("unknown jurisdiction type: {jurisdiction}");
            };
            let filename = file
                .file_name()
                .and_then(|name| name.to_str())
                .with_context(|| format!("{} has no file name", file.display()))?;
            let bytes = tokio::fs::read(file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let form = UploadForm {
                jurisdiction,
                state: state.clone(),
                sector: sector.clone(),
            };

            let ingestor =
                BillIngestor::new(LopdfExtractor, cli.model()?, IngestionOptions::default())?;
            let mut index = VectorIndexManager::create_or_load(cli.index_config(), cli.embedder()?);
            let report = ingestor
                .ingest_upload(filename, &bytes, &form, &mut index)
                .await?;

            if let Some(dir) = archive_dir {
                let saved = archive_upload(dir, &report.record.metadata, filename, &bytes)?;
                info!(path = %saved.display(), "upload archived");
            }
            println!("{}", serde_json::to_string_pretty(&report.record)?);
            println!("{} chunks added", report.outcome.added());
        }
        Command::Ask {
            question,
            filter,
            json,
        } => {
            let mut session = open_session(&cli, filter)?;
            let record = session.ask(&filter.query(question)?).await?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                print_answer(&record);
            }
        }
        Command::Chat { filter } => {
            let mut session = open_session(&cli, filter)?;
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            let mut stdout = tokio::io::stdout();

            loop {
                stdout.write_all(b"> ").await?;
                stdout.flush().await?;
                let Some(line) = lines.next_line().await? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match session.ask(&filter.query(&line)?).await {
                    Ok(record) => print_answer(&record),
                    Err(error) => warn!(%error, "question failed"),
                }
            }
        }
        Command::Lookup { chunk_id } => {
            let index = VectorIndexManager::load(cli.index_config(), cli.embedder()?)?;
            match index.lookup_text(chunk_id) {
                Some(text) => println!("{text}"),
                None => bail!("no chunk with id {chunk_id}"),
            }
        }
        Command::Documents { state } => {
            let index = VectorIndexManager::load(cli.index_config(), cli.embedder()?)?;
            let documents: Vec<_> = index
                .documents()
                .into_iter()
                .filter(|document| {
                    state
                        .as_deref()
                        .map_or(true, |wanted| document.state.as_deref() == Some(wanted))
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&documents)?);
        }
    }

    Ok(())
}
