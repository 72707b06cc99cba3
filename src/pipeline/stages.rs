//! Stage implementations and their collaborator seams.
//!
//! Each heavy stage delegates the actual model work to a trait object, so
//! real accelerator backends plug in behind the same seam the deterministic
//! built-in implementations use. A stage must touch only its declared
//! PipelineState fields and must not retain the leased resource beyond its
//! own invocation.

use crate::config::PipelineSettings;
use crate::index::embedder::EmbeddingModel;
use crate::index::search::RetrievalEngine;
use crate::index::store::VectorIndex;
use crate::index::IndexError;

use super::registry::{StageRegistry, StageSpec};
use super::state::{InputDocument, PipelineState, RetrievedRecord, StateField};
use super::{RegistryError, StageError};

pub const STAGE_VISION: &str = "vision";
pub const STAGE_SANITIZE: &str = "sanitize";
pub const STAGE_RETRIEVAL: &str = "retrieval";
pub const STAGE_REASONING: &str = "reasoning";
pub const STAGE_VOICE: &str = "voice";

// ═══════════════════════════════════════════════════════════
// Stage contract
// ═══════════════════════════════════════════════════════════

/// One pipeline step.
///
/// `prepare` is the model load, executed under the lease loader so a load
/// failure transitions the lease straight to Unloaded. `run` is the
/// transformation over the shared state, limited to declared fields.
pub trait Stage {
    fn prepare(&self) -> Result<(), StageError> {
        Ok(())
    }

    fn run(&self, state: &mut PipelineState) -> Result<(), StageError>;
}

// ═══════════════════════════════════════════════════════════
// Collaborator seams
// ═══════════════════════════════════════════════════════════

/// Document understanding backend (OCR / vision model).
pub trait DocumentReader {
    fn extract(&self, documents: &[InputDocument]) -> Result<String, StageError>;
}

/// Semantic retrieval backend.
pub trait ContextRetriever {
    fn retrieve(&self, query: &str, k: usize) -> Result<Vec<RetrievedRecord>, StageError>;
}

/// Report-generation backend (clinical reasoning model).
pub trait ReasoningModel {
    fn generate(
        &self,
        query: &str,
        extracted_text: &str,
        context: &[RetrievedRecord],
    ) -> Result<String, StageError>;
}

/// Speech synthesis backend.
pub trait SpeechSynthesizer {
    fn synthesize(&self, text: &str) -> Result<Vec<u8>, StageError>;
}

// ═══════════════════════════════════════════════════════════
// Stage implementations
// ═══════════════════════════════════════════════════════════

/// Vision stage: raw documents → extracted_text.
pub struct VisionStage {
    reader: Box<dyn DocumentReader>,
}

impl VisionStage {
    pub fn new(reader: Box<dyn DocumentReader>) -> Self {
        Self { reader }
    }
}

impl Stage for VisionStage {
    fn run(&self, state: &mut PipelineState) -> Result<(), StageError> {
        if state.raw_inputs.is_empty() {
            return Err(StageError::Fatal("no input documents".into()));
        }
        state.extracted_text = Some(self.reader.extract(&state.raw_inputs)?);
        Ok(())
    }
}

/// Optional middleware between vision and retrieval: strips control
/// characters and collapses whitespace in place. Needs no device lease.
pub struct SanitizeStage;

impl Stage for SanitizeStage {
    fn run(&self, state: &mut PipelineState) -> Result<(), StageError> {
        if let Some(text) = &state.extracted_text {
            state.extracted_text = Some(sanitize_text(text));
        }
        Ok(())
    }
}

fn sanitize_text(text: &str) -> String {
    text.lines()
        .map(|line| {
            line.chars()
                .filter(|c| !c.is_control())
                .collect::<String>()
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
        })
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Retrieval stage: query + extracted_text → retrieved_context.
pub struct RetrievalStage {
    retriever: Box<dyn ContextRetriever>,
    top_k: usize,
}

impl RetrievalStage {
    pub fn new(retriever: Box<dyn ContextRetriever>, top_k: usize) -> Self {
        Self { retriever, top_k }
    }
}

impl Stage for RetrievalStage {
    fn run(&self, state: &mut PipelineState) -> Result<(), StageError> {
        let query = match state.extracted_text.as_deref() {
            Some(text) if !text.trim().is_empty() => format!("{} {}", state.query, text),
            _ => state.query.clone(),
        };
        state.retrieved_context = self.retriever.retrieve(&query, self.top_k)?;
        Ok(())
    }
}

/// Retrieval over the vector index, adapted to the stage error taxonomy.
impl<E: EmbeddingModel, V: VectorIndex> ContextRetriever for RetrievalEngine<E, V> {
    fn retrieve(&self, query: &str, k: usize) -> Result<Vec<RetrievedRecord>, StageError> {
        let hits = self.search(query, k).map_err(|e| match e {
            // An embedding backend error may clear on retry.
            IndexError::Embedding(reason) => StageError::Transient(reason),
            other => StageError::Fatal(other.to_string()),
        })?;
        Ok(hits
            .into_iter()
            .map(|hit| RetrievedRecord {
                record_id: hit.record_id,
                text: hit.source_text,
                score: hit.score,
            })
            .collect())
    }
}

/// Reasoning stage: extracted_text + retrieved_context → reasoning_output.
pub struct ReasoningStage {
    model: Box<dyn ReasoningModel>,
}

impl ReasoningStage {
    pub fn new(model: Box<dyn ReasoningModel>) -> Self {
        Self { model }
    }
}

impl Stage for ReasoningStage {
    fn run(&self, state: &mut PipelineState) -> Result<(), StageError> {
        let extracted = state
            .extracted_text
            .as_deref()
            .ok_or_else(|| StageError::Fatal("reasoning requires extracted text".into()))?;
        let output = self
            .model
            .generate(&state.query, extracted, &state.retrieved_context)?;
        state.reasoning_output = Some(output);
        Ok(())
    }
}

/// Gated voice stage: reasoning_output → audio_output. Runs only after an
/// Approved decision.
pub struct VoiceStage {
    synthesizer: Box<dyn SpeechSynthesizer>,
}

impl VoiceStage {
    pub fn new(synthesizer: Box<dyn SpeechSynthesizer>) -> Self {
        Self { synthesizer }
    }
}

impl Stage for VoiceStage {
    fn run(&self, state: &mut PipelineState) -> Result<(), StageError> {
        let report = state
            .reasoning_output
            .as_deref()
            .ok_or_else(|| StageError::Fatal("voice requires a reasoning output".into()))?;
        state.audio_output = Some(self.synthesizer.synthesize(report)?);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════
// Built-in deterministic backends
// ═══════════════════════════════════════════════════════════

/// Reads text-family documents as UTF-8. Image media types need a real
/// vision backend and are a fatal stage error here.
pub struct Utf8DocumentReader;

impl DocumentReader for Utf8DocumentReader {
    fn extract(&self, documents: &[InputDocument]) -> Result<String, StageError> {
        let mut parts = Vec::with_capacity(documents.len());
        for doc in documents {
            if !doc.media_type.starts_with("text/") {
                return Err(StageError::Fatal(format!(
                    "no vision backend for media type '{}'",
                    doc.media_type
                )));
            }
            let text = std::str::from_utf8(&doc.bytes)
                .map_err(|e| StageError::Fatal(format!("document is not valid UTF-8: {e}")))?;
            parts.push(text.to_string());
        }
        Ok(parts.join("\n\n"))
    }
}

/// Deterministic report writer: the same inputs always produce the same
/// report. A clinical LLM backend replaces this behind `ReasoningModel`.
pub struct ExtractiveSummaryModel;

impl ReasoningModel for ExtractiveSummaryModel {
    fn generate(
        &self,
        query: &str,
        extracted_text: &str,
        context: &[RetrievedRecord],
    ) -> Result<String, StageError> {
        let mut report = String::new();
        report.push_str(&format!("Query: {query}\n\n"));
        report.push_str("Findings:\n");
        for line in extracted_text.lines().filter(|l| !l.trim().is_empty()) {
            report.push_str(&format!("  - {}\n", line.trim()));
        }
        if !context.is_empty() {
            report.push_str("\nReference context:\n");
            for record in context {
                report.push_str(&format!("  [{:.3}] {}\n", record.score, record.text));
            }
        }
        Ok(report)
    }
}

/// Emits a short, valid PCM WAV of silence. A voice-cloning backend
/// replaces this behind `SpeechSynthesizer`.
pub struct SilenceSynthesizer;

const WAV_SAMPLE_RATE: u32 = 22_050;
/// 250 ms of audio regardless of report length.
const WAV_SAMPLE_COUNT: u32 = WAV_SAMPLE_RATE / 4;

impl SpeechSynthesizer for SilenceSynthesizer {
    fn synthesize(&self, text: &str) -> Result<Vec<u8>, StageError> {
        if text.trim().is_empty() {
            return Err(StageError::Fatal("nothing to synthesize".into()));
        }
        Ok(wav_silence(WAV_SAMPLE_COUNT))
    }
}

/// Minimal RIFF/WAVE container: 16-bit mono PCM, all-zero samples.
fn wav_silence(sample_count: u32) -> Vec<u8> {
    let data_len = sample_count * 2;
    let mut wav = Vec::with_capacity(44 + data_len as usize);
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes()); // fmt chunk size
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&1u16.to_le_bytes()); // mono
    wav.extend_from_slice(&WAV_SAMPLE_RATE.to_le_bytes());
    wav.extend_from_slice(&(WAV_SAMPLE_RATE * 2).to_le_bytes()); // byte rate
    wav.extend_from_slice(&2u16.to_le_bytes()); // block align
    wav.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.resize(44 + data_len as usize, 0);
    wav
}

// ═══════════════════════════════════════════════════════════
// Default pipeline wiring
// ═══════════════════════════════════════════════════════════

/// The clinical pipeline in its declared order:
/// vision → [sanitize] → retrieval → reasoning → (gate) → voice.
pub fn clinical_registry(
    settings: &PipelineSettings,
    retriever: Box<dyn ContextRetriever>,
) -> Result<StageRegistry, RegistryError> {
    use crate::resource::ResourceClass;

    let mut builder = StageRegistry::builder().register(StageSpec::new(
        STAGE_VISION,
        Some(ResourceClass::Vision),
        vec![],
        vec![StateField::ExtractedText],
        false,
        Box::new(VisionStage::new(Box::new(Utf8DocumentReader))),
    ))?;

    if settings.sanitize {
        builder = builder.register(StageSpec::new(
            STAGE_SANITIZE,
            None,
            vec![StateField::ExtractedText],
            vec![StateField::ExtractedText],
            false,
            Box::new(SanitizeStage),
        ))?;
    }

    let registry = builder
        .register(StageSpec::new(
            STAGE_RETRIEVAL,
            Some(ResourceClass::Retrieval),
            vec![StateField::ExtractedText],
            vec![StateField::RetrievedContext],
            false,
            Box::new(RetrievalStage::new(retriever, settings.top_k)),
        ))?
        .register(StageSpec::new(
            STAGE_REASONING,
            Some(ResourceClass::Reasoning),
            vec![StateField::ExtractedText, StateField::RetrievedContext],
            vec![StateField::ReasoningOutput],
            false,
            Box::new(ReasoningStage::new(Box::new(ExtractiveSummaryModel))),
        ))?
        .register(StageSpec::new(
            STAGE_VOICE,
            Some(ResourceClass::Voice),
            vec![StateField::ReasoningOutput],
            vec![StateField::AudioOutput],
            true,
            Box::new(VoiceStage::new(Box::new(SilenceSynthesizer))),
        ))?
        .build();

    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::embedder::HashEmbedder;
    use crate::index::store::InMemoryVectorIndex;

    fn state_with_docs(docs: Vec<InputDocument>) -> PipelineState {
        PipelineState::new(docs, "Summarize the findings")
    }

    #[test]
    fn vision_extracts_text_documents() {
        let stage = VisionStage::new(Box::new(Utf8DocumentReader));
        let mut state = state_with_docs(vec![
            InputDocument::new(b"Blood glucose 180 mg/dL".to_vec(), "text/plain"),
            InputDocument::new(b"HbA1c 7.2%".to_vec(), "text/markdown"),
        ]);

        stage.run(&mut state).unwrap();

        let text = state.extracted_text.unwrap();
        assert!(text.contains("Blood glucose 180 mg/dL"));
        assert!(text.contains("HbA1c 7.2%"));
    }

    #[test]
    fn vision_rejects_image_without_backend() {
        let stage = VisionStage::new(Box::new(Utf8DocumentReader));
        let mut state = state_with_docs(vec![InputDocument::new(vec![0xFF, 0xD8], "image/jpeg")]);

        assert!(matches!(
            stage.run(&mut state),
            Err(StageError::Fatal(_))
        ));
    }

    #[test]
    fn vision_rejects_empty_input() {
        let stage = VisionStage::new(Box::new(Utf8DocumentReader));
        let mut state = state_with_docs(vec![]);
        assert!(matches!(stage.run(&mut state), Err(StageError::Fatal(_))));
    }

    #[test]
    fn sanitize_strips_control_characters_and_blank_lines() {
        let mut state = state_with_docs(vec![]);
        state.extracted_text = Some("Dose:\u{0007}  500mg \n\n  twice   daily ".into());

        SanitizeStage.run(&mut state).unwrap();

        assert_eq!(
            state.extracted_text.as_deref(),
            Some("Dose: 500mg\ntwice daily")
        );
    }

    #[test]
    fn retrieval_stage_writes_context() {
        let embedder = HashEmbedder::new();
        let index = InMemoryVectorIndex::new();
        let record_text = "fever treatment rest and fluids";
        index
            .insert(&crate::index::store::IndexRecord {
                record_id: crate::index::store::record_id(record_text),
                source_text: record_text.to_string(),
                embedding: embedder.embed(record_text).unwrap(),
                metadata: None,
                ingestion_batch_id: uuid::Uuid::new_v4(),
            })
            .unwrap();
        let engine = RetrievalEngine::new(embedder, index);

        let stage = RetrievalStage::new(Box::new(engine), 3);
        let mut state = state_with_docs(vec![]);
        state.extracted_text = Some("patient has fever".into());

        stage.run(&mut state).unwrap();
        assert_eq!(state.retrieved_context.len(), 1);
        assert_eq!(state.retrieved_context[0].text, record_text);
    }

    #[test]
    fn empty_index_is_fatal_for_retrieval() {
        let engine = RetrievalEngine::new(HashEmbedder::new(), InMemoryVectorIndex::new());
        let stage = RetrievalStage::new(Box::new(engine), 3);
        let mut state = state_with_docs(vec![]);
        state.extracted_text = Some("anything".into());

        assert!(matches!(stage.run(&mut state), Err(StageError::Fatal(_))));
    }

    #[test]
    fn reasoning_requires_extracted_text() {
        let stage = ReasoningStage::new(Box::new(ExtractiveSummaryModel));
        let mut state = state_with_docs(vec![]);
        assert!(matches!(stage.run(&mut state), Err(StageError::Fatal(_))));
    }

    #[test]
    fn reasoning_report_is_deterministic_and_cites_context() {
        let stage = ReasoningStage::new(Box::new(ExtractiveSummaryModel));
        let mut state = state_with_docs(vec![]);
        state.extracted_text = Some("Temp 39.2C\nBP 120/80".into());
        state.retrieved_context.push(RetrievedRecord {
            record_id: "abc".into(),
            text: "high fever guidance".into(),
            score: 0.91,
        });

        stage.run(&mut state).unwrap();
        let first = state.reasoning_output.clone().unwrap();
        assert!(first.contains("Temp 39.2C"));
        assert!(first.contains("high fever guidance"));

        state.reasoning_output = None;
        stage.run(&mut state).unwrap();
        assert_eq!(state.reasoning_output.as_deref(), Some(first.as_str()));
    }

    #[test]
    fn voice_produces_a_valid_wav_container() {
        let stage = VoiceStage::new(Box::new(SilenceSynthesizer));
        let mut state = state_with_docs(vec![]);
        state.reasoning_output = Some("Patient requires follow-up.".into());

        stage.run(&mut state).unwrap();

        let audio = state.audio_output.unwrap();
        assert_eq!(&audio[0..4], b"RIFF");
        assert_eq!(&audio[8..12], b"WAVE");
        assert_eq!(audio.len(), 44 + (WAV_SAMPLE_COUNT as usize) * 2);
        // All samples silent
        assert!(audio[44..].iter().all(|b| *b == 0));
    }

    #[test]
    fn voice_requires_a_report() {
        let stage = VoiceStage::new(Box::new(SilenceSynthesizer));
        let mut state = state_with_docs(vec![]);
        assert!(matches!(stage.run(&mut state), Err(StageError::Fatal(_))));
    }

    #[test]
    fn clinical_registry_shape() {
        let settings = PipelineSettings::default();
        let engine = RetrievalEngine::new(HashEmbedder::new(), InMemoryVectorIndex::new());
        let registry = clinical_registry(&settings, Box::new(engine)).unwrap();

        assert_eq!(registry.pre_gate().count(), 3);
        assert_eq!(registry.post_gate().count(), 1);
        assert!(registry.get(STAGE_SANITIZE).is_none());
    }

    #[test]
    fn clinical_registry_with_sanitize_enabled() {
        let settings = PipelineSettings {
            sanitize: true,
            ..PipelineSettings::default()
        };
        let engine = RetrievalEngine::new(HashEmbedder::new(), InMemoryVectorIndex::new());
        let registry = clinical_registry(&settings, Box::new(engine)).unwrap();

        assert_eq!(registry.pre_gate().count(), 4);
        assert!(registry.get(STAGE_SANITIZE).is_some());
    }
}
