//! Command-line surface: run / ingest / decide / search.
//!
//! Exit codes follow the pipeline outcome: 0 for Completed (or a clean
//! suspension awaiting a later `decide`), 2 for Rejected, 1 for Failed and
//! for infrastructure errors.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use thiserror::Error;
use uuid::Uuid;

use crate::config::{self, PipelineSettings, DEFAULT_BATCH_SIZE, DEFAULT_TOP_K};
use crate::db::sqlite::open_database;
use crate::db::DatabaseError;
use crate::index::embedder::HashEmbedder;
use crate::index::ingest::{IngestionPipeline, SourceRecord};
use crate::index::search::RetrievalEngine;
use crate::index::store::SqliteVectorIndex;
use crate::index::IndexError;
use crate::pipeline::orchestrator::PipelineOrchestrator;
use crate::pipeline::stages::clinical_registry;
use crate::pipeline::state::{ApprovalDecision, InputDocument, PipelineState, RequestStatus};
use crate::pipeline::{PipelineError, RegistryError};

#[derive(Error, Debug)]
pub enum CliError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Parser)]
#[command(
    name = "omnimed",
    version,
    about = "Clinical document pipeline for a single memory-constrained accelerator"
)]
pub struct Cli {
    /// Database path (defaults to ~/OmniMed/omnimed.db).
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Submit documents and a query through the pipeline.
    Run {
        /// Input documents (text or markdown).
        #[arg(required = true)]
        documents: Vec<PathBuf>,

        /// The clinician's query accompanying the documents.
        #[arg(long)]
        query: String,

        /// Approve the report at the gate without a separate decide call.
        #[arg(long, conflicts_with = "reject")]
        approve: bool,

        /// Reject the report at the gate.
        #[arg(long)]
        reject: bool,

        /// Sanitize extracted text before retrieval.
        #[arg(long)]
        sanitize: bool,
    },

    /// Ingest a corpus file (JSONL with a "text" field, or plain text lines).
    Ingest {
        source: PathBuf,

        /// Records buffered per embedding batch.
        #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
        batch_size: usize,
    },

    /// Resolve a request suspended at the approval gate.
    Decide {
        request_id: Uuid,

        #[arg(value_enum)]
        decision: DecisionArg,
    },

    /// Top-k semantic query against the ingested index.
    Search {
        query: String,

        #[arg(short, long, default_value_t = DEFAULT_TOP_K)]
        k: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DecisionArg {
    Approved,
    Rejected,
}

pub fn execute(cli: Cli) -> i32 {
    match dispatch(cli) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            eprintln!("error: {e}");
            1
        }
    }
}

fn dispatch(cli: Cli) -> Result<i32, CliError> {
    let db_path = match cli.db {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            path
        }
        None => {
            fs::create_dir_all(config::app_data_dir())?;
            config::database_path()
        }
    };

    match cli.command {
        Command::Run {
            documents,
            query,
            approve,
            reject,
            sanitize,
        } => run(&db_path, &documents, &query, approve, reject, sanitize),
        Command::Ingest { source, batch_size } => ingest(&db_path, &source, batch_size),
        Command::Decide {
            request_id,
            decision,
        } => decide(&db_path, &request_id, decision),
        Command::Search { query, k } => search(&db_path, &query, k),
    }
}

// ---------------------------------------------------------------------------
// Subcommands
// ---------------------------------------------------------------------------

fn run(
    db_path: &Path,
    documents: &[PathBuf],
    query: &str,
    approve: bool,
    reject: bool,
    sanitize: bool,
) -> Result<i32, CliError> {
    let settings = PipelineSettings {
        sanitize,
        ..PipelineSettings::default()
    };
    let conn = open_database(db_path)?;
    let orchestrator = build_orchestrator(db_path, settings)?;

    let mut inputs = Vec::with_capacity(documents.len());
    for path in documents {
        inputs.push(InputDocument::new(fs::read(path)?, media_type_for(path)));
    }
    let state = PipelineState::new(inputs, query);

    let mut report = orchestrator.submit(state, &conn)?;
    if report.status == RequestStatus::AwaitingApproval && (approve || reject) {
        let decision = if approve {
            ApprovalDecision::Approved
        } else {
            ApprovalDecision::Rejected
        };
        report = orchestrator.submit_decision(&report.request_id, decision, &conn)?;
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(exit_code_for(report.status))
}

fn ingest(db_path: &Path, source: &Path, batch_size: usize) -> Result<i32, CliError> {
    let index = SqliteVectorIndex::new(open_database(db_path)?);
    let pipeline = IngestionPipeline::new(HashEmbedder::new(), index, batch_size);

    let file = fs::File::open(source)?;
    let report = pipeline.ingest(corpus_records(file))?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(if report.is_total_failure() { 1 } else { 0 })
}

fn decide(db_path: &Path, request_id: &Uuid, decision: DecisionArg) -> Result<i32, CliError> {
    let conn = open_database(db_path)?;
    let orchestrator = build_orchestrator(db_path, PipelineSettings::default())?;

    let decision = match decision {
        DecisionArg::Approved => ApprovalDecision::Approved,
        DecisionArg::Rejected => ApprovalDecision::Rejected,
    };
    let report = orchestrator.submit_decision(request_id, decision, &conn)?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(exit_code_for(report.status))
}

fn search(db_path: &Path, query: &str, k: usize) -> Result<i32, CliError> {
    let index = SqliteVectorIndex::new(open_database(db_path)?);
    let engine = RetrievalEngine::new(HashEmbedder::new(), index);

    let hits = engine.search(query, k)?;
    println!("{}", serde_json::to_string_pretty(&hits)?);
    Ok(0)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// The retrieval stage reads the index over its own connection, separate
/// from the request-snapshot connection.
fn build_orchestrator(
    db_path: &Path,
    settings: PipelineSettings,
) -> Result<PipelineOrchestrator, CliError> {
    let index = SqliteVectorIndex::new(open_database(db_path)?);
    let engine = RetrievalEngine::new(HashEmbedder::new(), index);
    let registry = clinical_registry(&settings, Box::new(engine))?;
    Ok(PipelineOrchestrator::new(settings, registry))
}

/// Lazy corpus reader: lines are consumed one at a time, so peak ingest
/// memory stays O(batch_size) even for a large file. An unreadable line
/// (e.g. invalid UTF-8) yields an empty record that the ingestion report
/// counts as failed; later lines are still processed.
fn corpus_records(file: fs::File) -> impl Iterator<Item = SourceRecord> {
    BufReader::new(file).lines().filter_map(|line| match line {
        Ok(line) if line.trim().is_empty() => None,
        Ok(line) => Some(parse_source_line(&line)),
        Err(e) => {
            tracing::warn!(error = %e, "Unreadable corpus line");
            Some(SourceRecord::new(""))
        }
    })
}

/// JSONL rows carry the text in a `text` field with optional `source`
/// provenance; anything else is one plain-text record per line.
fn parse_source_line(line: &str) -> SourceRecord {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(line) {
        if let Some(text) = value.get("text").and_then(|t| t.as_str()) {
            return SourceRecord {
                raw_text: text.to_string(),
                metadata: value
                    .get("source")
                    .and_then(|s| s.as_str())
                    .map(String::from),
            };
        }
    }
    SourceRecord::new(line)
}

fn media_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("md") | Some("markdown") => "text/markdown",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("pdf") => "application/pdf",
        _ => "text/plain",
    }
}

fn exit_code_for(status: RequestStatus) -> i32 {
    match status {
        RequestStatus::Completed | RequestStatus::AwaitingApproval | RequestStatus::InProgress => 0,
        RequestStatus::Rejected => 2,
        RequestStatus::Failed => 1,
    }
}
