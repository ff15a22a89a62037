use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tracing::Instrument;
use uuid::Uuid;

use super::decoder::{DecodeError, Decoder, JsonDecoder, TaskOutput};
use super::prompt::build_envelope;
use super::retry::{send_with_retry, RetryOutcome};
use super::store::{AnalysisStore, PortraitSummaryRecord, RemedySuggestionRecord};
use super::throttle::ClientUsageCounters;
use super::transport::transport_for;
use super::types::{
    AnalysisTask, AnalysisTaskKind, CaseRepertorization, ComparisonPayload, FatalReason,
    FollowUpPayload, FollowUpQuestions, NarrativeThemes, RemedyComparison, RetryReason,
    SrpHighlight, Transport, TransportOutcome,
};
use super::{AnalysisError, AnalysisErrorKind};
use crate::case::{assemble_from, CaseSnapshot, CaseState};
use crate::config::{AnalysisConfig, RetryPolicy};

/// Minimum number of distinct remedies a comparison needs.
const MIN_REMEDIES_TO_COMPARE: usize = 2;

// ──────────────────────────────────────────────
// Per-call state machine
// ──────────────────────────────────────────────

/// Where one analysis call is. Calls never resume from a later stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "stage", content = "error", rename_all = "snake_case")]
pub enum AnalysisStage {
    Idle,
    Assembling,
    Prompting,
    Sending,
    Decoding,
    Persisting,
    Done,
    Failed(AnalysisErrorKind),
}

impl AnalysisStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed(_))
    }

    /// Forward-only transitions. Any non-terminal stage may fail.
    pub fn can_advance_to(self, next: AnalysisStage) -> bool {
        use AnalysisStage::*;
        match (self, next) {
            (from, Failed(_)) => !from.is_terminal(),
            (Idle, Assembling)
            | (Assembling, Prompting)
            | (Prompting, Sending)
            | (Sending, Decoding)
            | (Decoding, Persisting)
            | (Decoding, Done)
            | (Persisting, Done) => true,
            _ => false,
        }
    }
}

/// Tracks and logs the stages of one call.
#[derive(Debug)]
pub struct StageTracker {
    analysis_id: Uuid,
    task: AnalysisTaskKind,
    stage: AnalysisStage,
    history: Vec<AnalysisStage>,
    started: Instant,
}

impl StageTracker {
    pub fn new(task: AnalysisTaskKind) -> Self {
        Self {
            analysis_id: Uuid::new_v4(),
            task,
            stage: AnalysisStage::Idle,
            history: vec![AnalysisStage::Idle],
            started: Instant::now(),
        }
    }

    pub fn analysis_id(&self) -> Uuid {
        self.analysis_id
    }

    pub fn stage(&self) -> AnalysisStage {
        self.stage
    }

    pub fn history(&self) -> &[AnalysisStage] {
        &self.history
    }

    pub fn advance(&mut self, next: AnalysisStage) {
        if !self.stage.can_advance_to(next) {
            tracing::warn!(
                task = %self.task,
                from = ?self.stage,
                to = ?next,
                "Unexpected analysis stage transition"
            );
        }
        tracing::debug!(task = %self.task, from = ?self.stage, to = ?next, "Analysis stage");
        self.stage = next;
        self.history.push(next);
    }

    /// Move to `Done` or `Failed` and hand the result through.
    pub fn finish<T>(&mut self, result: Result<T, AnalysisError>) -> Result<T, AnalysisError> {
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => {
                self.advance(AnalysisStage::Done);
                tracing::info!(task = %self.task, elapsed_ms, "Analysis complete");
            }
            Err(e) => {
                self.advance(AnalysisStage::Failed(e.kind()));
                tracing::warn!(
                    task = %self.task,
                    elapsed_ms,
                    error_kind = ?e.kind(),
                    error = %e,
                    "Analysis failed"
                );
            }
        }
        result
    }
}

// ──────────────────────────────────────────────
// Case analyzer
// ──────────────────────────────────────────────

/// Wizard-facing entry point: one operation per analysis task.
///
/// Each operation runs snapshot -> prompt -> send with retry -> decode,
/// and persists the derived subset its task owns.
pub struct CaseAnalyzer {
    transport: Arc<dyn Transport>,
    decoder: Arc<dyn Decoder>,
    store: Arc<dyn AnalysisStore>,
    retry: RetryPolicy,
}

impl CaseAnalyzer {
    pub fn new(
        transport: Arc<dyn Transport>,
        decoder: Arc<dyn Decoder>,
        store: Arc<dyn AnalysisStore>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            decoder,
            store,
            retry,
        }
    }

    /// Build the HTTP transport for `config` and wire it up.
    pub fn from_config(
        config: &AnalysisConfig,
        api_key: &str,
        store: Arc<dyn AnalysisStore>,
    ) -> Result<Self, AnalysisError> {
        let transport: Arc<dyn Transport> = Arc::from(transport_for(config, api_key)?);
        Ok(Self::new(transport, Arc::new(JsonDecoder), store, config.retry))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Usage counters of the underlying client.
    pub async fn usage(&self) -> ClientUsageCounters {
        self.transport.usage().await
    }

    pub async fn reset_usage(&self) {
        self.transport.reset_usage().await;
    }

    /// Themes and a constitutional portrait from the case narrative.
    /// Persists the portrait summary.
    pub async fn analyze_narrative<S>(&self, case: &S) -> Result<NarrativeThemes, AnalysisError>
    where
        S: CaseState + Sync + ?Sized,
    {
        let mut run = StageTracker::new(AnalysisTaskKind::NarrativeAnalysis);
        let span = analysis_span(&run);
        async {
            let result = self.narrative_inner(&mut run, case).await;
            run.finish(result)
        }
        .instrument(span)
        .await
    }

    pub async fn highlight_peculiar_symptoms<S>(
        &self,
        case: &S,
    ) -> Result<SrpHighlight, AnalysisError>
    where
        S: CaseState + Sync + ?Sized,
    {
        let mut run = StageTracker::new(AnalysisTaskKind::PeculiarSymptoms);
        let span = analysis_span(&run);
        async {
            let snapshot = assemble(&mut run, case);
            let result = self
                .run_task(&mut run, AnalysisTask::PeculiarSymptoms(&snapshot))
                .await;
            run.finish(result)
        }
        .instrument(span)
        .await
    }

    /// Full case repertorization. Persists the remedy suggestions.
    pub async fn analyze_case<S>(&self, case: &S) -> Result<CaseRepertorization, AnalysisError>
    where
        S: CaseState + Sync + ?Sized,
    {
        let mut run = StageTracker::new(AnalysisTaskKind::CaseRepertorization);
        let span = analysis_span(&run);
        async {
            let result = self.analyze_case_inner(&mut run, case).await;
            run.finish(result)
        }
        .instrument(span)
        .await
    }

    /// Contrast two or more remedies against the case's key symptoms.
    pub async fn compare_remedies<S>(
        &self,
        case: &S,
        remedies: &[String],
    ) -> Result<RemedyComparison, AnalysisError>
    where
        S: CaseState + Sync + ?Sized,
    {
        let mut run = StageTracker::new(AnalysisTaskKind::RemedyComparison);
        let span = analysis_span(&run);
        async {
            let result = self.compare_inner(&mut run, case, remedies).await;
            run.finish(result)
        }
        .instrument(span)
        .await
    }

    /// Questions that would close gaps in the case or split the candidates.
    pub async fn suggest_follow_up_questions<S>(
        &self,
        case: &S,
        candidate_remedies: &[String],
    ) -> Result<FollowUpQuestions, AnalysisError>
    where
        S: CaseState + Sync + ?Sized,
    {
        let mut run = StageTracker::new(AnalysisTaskKind::FollowUpQuestions);
        let span = analysis_span(&run);
        async {
            let payload = FollowUpPayload {
                snapshot: assemble(&mut run, case),
                candidate_remedies: distinct_remedies(candidate_remedies),
            };
            let result = self.run_task(&mut run, AnalysisTask::FollowUp(&payload)).await;
            run.finish(result)
        }
        .instrument(span)
        .await
    }

    // ── task bodies ──────────────────────────────

    async fn narrative_inner<S>(
        &self,
        run: &mut StageTracker,
        case: &S,
    ) -> Result<NarrativeThemes, AnalysisError>
    where
        S: CaseState + Sync + ?Sized,
    {
        let snapshot = assemble(run, case);
        if snapshot.narrative.is_none() {
            return Err(AnalysisError::InvalidRequest(
                "Narrative analysis needs a recorded case narrative".into(),
            ));
        }

        let themes: NarrativeThemes = self
            .run_task(run, AnalysisTask::Narrative(&snapshot))
            .await?;

        run.advance(AnalysisStage::Persisting);
        self.store.persist_portrait_summary(&PortraitSummaryRecord {
            analysis_id: run.analysis_id(),
            created_at: Utc::now(),
            portrait_summary: themes.portrait_summary.clone(),
            themes: themes.themes.iter().map(|t| t.theme.clone()).collect(),
        })?;

        Ok(themes)
    }

    async fn analyze_case_inner<S>(
        &self,
        run: &mut StageTracker,
        case: &S,
    ) -> Result<CaseRepertorization, AnalysisError>
    where
        S: CaseState + Sync + ?Sized,
    {
        let snapshot = assemble(run, case);
        let analysis: CaseRepertorization = self
            .run_task(run, AnalysisTask::Repertorization(&snapshot))
            .await?;

        run.advance(AnalysisStage::Persisting);
        self.store
            .persist_remedy_suggestions(&RemedySuggestionRecord {
                analysis_id: run.analysis_id(),
                created_at: Utc::now(),
                case_summary: analysis.case_summary.clone(),
                remedies: analysis.remedies.clone(),
            })?;
        tracing::info!(remedy_count = analysis.remedies.len(), "Remedy suggestions saved");

        Ok(analysis)
    }

    async fn compare_inner<S>(
        &self,
        run: &mut StageTracker,
        case: &S,
        remedies: &[String],
    ) -> Result<RemedyComparison, AnalysisError>
    where
        S: CaseState + Sync + ?Sized,
    {
        let remedies = distinct_remedies(remedies);
        if remedies.len() < MIN_REMEDIES_TO_COMPARE {
            return Err(AnalysisError::InvalidRequest(format!(
                "Remedy comparison needs at least {MIN_REMEDIES_TO_COMPARE} distinct remedies, got {}",
                remedies.len()
            )));
        }

        let snapshot = assemble(run, case);
        let payload = ComparisonPayload {
            remedies,
            key_symptoms: snapshot.key_symptoms,
            thermal: snapshot.physical_generals.thermal,
        };
        self.run_task(run, AnalysisTask::RemedyComparison(&payload))
            .await
    }

    /// Prompt, send with retry, decode.
    async fn run_task<T>(
        &self,
        run: &mut StageTracker,
        task: AnalysisTask<'_>,
    ) -> Result<T, AnalysisError>
    where
        T: TaskOutput,
    {
        run.advance(AnalysisStage::Prompting);
        let envelope = build_envelope(task);
        tracing::debug!(
            system_chars = envelope.system.len(),
            user_chars = envelope.user.len(),
            "Prompt built"
        );

        run.advance(AnalysisStage::Sending);
        let sent = send_with_retry(self.transport.as_ref(), &envelope, &self.retry).await;
        let attempts = sent.attempts;
        let text = reply_text(sent)?;
        tracing::debug!(attempts, reply_chars = text.len(), "AI reply received");

        run.advance(AnalysisStage::Decoding);
        let decoded = self.decoder.decode(envelope.task, &text)?;
        let produced = decoded.task();
        T::from_result(decoded).ok_or_else(|| {
            AnalysisError::Decode(DecodeError::SchemaMismatch {
                task: envelope.task,
                message: format!("decoder produced a {produced} result"),
            })
        })
    }
}

fn analysis_span(run: &StageTracker) -> tracing::Span {
    tracing::info_span!(
        "case_analysis",
        task = %run.task,
        analysis_id = %run.analysis_id,
    )
}

fn assemble<S: CaseState + ?Sized>(run: &mut StageTracker, case: &S) -> CaseSnapshot {
    run.advance(AnalysisStage::Assembling);
    let snapshot = assemble_from(case);
    tracing::debug!(
        has_narrative = snapshot.narrative.is_some(),
        complaints = snapshot.chief_complaints.len(),
        key_symptoms = snapshot.key_symptoms.len(),
        "Case snapshot assembled"
    );
    snapshot
}

/// Map the final transport outcome to reply text or the matching error.
pub fn reply_text(sent: RetryOutcome) -> Result<String, AnalysisError> {
    let attempts = sent.attempts;
    match sent.outcome {
        TransportOutcome::Success { text, .. } => Ok(text),
        TransportOutcome::QuotaExhausted { message } => {
            Err(AnalysisError::QuotaExhausted { message })
        }
        TransportOutcome::RetryableFailure {
            reason: RetryReason::RateLimited { message },
            ..
        } => Err(AnalysisError::RateLimited { message, attempts }),
        TransportOutcome::RetryableFailure {
            reason: RetryReason::Network { message },
            ..
        } => Err(AnalysisError::NetworkFailure { message, attempts }),
        TransportOutcome::FatalFailure {
            reason: FatalReason::HttpStatus { status, body },
        } => Err(AnalysisError::ServiceError { status, body }),
        TransportOutcome::FatalFailure {
            reason: FatalReason::MalformedEnvelope { message },
        } => Err(AnalysisError::MalformedTransportResponse(message)),
    }
}

/// Trimmed, non-blank, case-insensitively distinct; first spelling wins.
fn distinct_remedies(remedies: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    remedies
        .iter()
        .map(|r| r.trim())
        .filter(|r| !r.is_empty() && seen.insert(r.to_lowercase()))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::store::MemoryStore;
    use crate::analysis::transport::ScriptedTransport;
    use crate::analysis::types::{AnalysisResult, TokenUsage};
    use crate::case::{keys, CaseFields};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Rejects every reply, counting how often it was asked.
    #[derive(Default)]
    struct RejectingDecoder {
        calls: AtomicUsize,
    }

    impl Decoder for RejectingDecoder {
        fn decode(&self, _: AnalysisTaskKind, _: &str) -> Result<AnalysisResult, DecodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(DecodeError::NoJsonObject)
        }
    }

    /// Always answers with narrative themes, whatever the task.
    struct NarrativeOnlyDecoder;

    impl Decoder for NarrativeOnlyDecoder {
        fn decode(&self, _: AnalysisTaskKind, raw: &str) -> Result<AnalysisResult, DecodeError> {
            JsonDecoder.decode(AnalysisTaskKind::NarrativeAnalysis, raw)
        }
    }

    const NARRATIVE_REPLY: &str = r#"{
        "themes": [{"theme": "Fear of abandonment", "evidence": "Cannot bear being alone"}],
        "portrait_summary": "Dependent, anxious, seeks company",
        "disclaimer": "Not medical advice."
    }"#;

    const COMPARISON_REPLY: &str = r#"{
        "comparisons": [
            {"remedy": "Pulsatilla", "fit": "high"},
            {"remedy": "Sepia", "fit": "low"}
        ],
        "recommendation": "Pulsatilla",
        "disclaimer": "Not medical advice."
    }"#;

    const FOLLOW_UP_REPLY: &str = r#"{
        "questions": [{"question": "How is your thirst?", "purpose": "Thirst not recorded"}],
        "disclaimer": "Not medical advice."
    }"#;

    fn analyzer(transport: Arc<ScriptedTransport>, store: Arc<MemoryStore>) -> CaseAnalyzer {
        CaseAnalyzer::new(transport, Arc::new(JsonDecoder), store, RetryPolicy::default())
    }

    fn case() -> CaseFields {
        CaseFields::new()
            .with(keys::NARRATIVE, json!("Weeps easily, wants company, worse in a warm room."))
            .with(
                keys::PHYSICAL_GENERALS,
                json!({"thermal": "hot", "thirst": "thirstless"}),
            )
            .with(keys::KEY_SYMPTOMS, json!(["Thirstless", "Better open air"]))
    }

    #[test]
    fn stage_transitions_are_forward_only() {
        use AnalysisStage::*;
        assert!(Idle.can_advance_to(Assembling));
        assert!(Sending.can_advance_to(Decoding));
        assert!(Decoding.can_advance_to(Done));
        assert!(Prompting.can_advance_to(Failed(AnalysisErrorKind::InvalidRequest)));
        assert!(!Decoding.can_advance_to(Sending));
        assert!(!Done.can_advance_to(Failed(AnalysisErrorKind::Decode)));
        assert!(!Failed(AnalysisErrorKind::Decode).can_advance_to(Idle));
    }

    #[test]
    fn tracker_records_failure_kind() {
        let mut run = StageTracker::new(AnalysisTaskKind::RemedyComparison);
        run.advance(AnalysisStage::Assembling);
        let result: Result<(), _> = run.finish(Err(AnalysisError::InvalidRequest("x".into())));
        assert!(result.is_err());
        assert_eq!(
            run.history(),
            &[
                AnalysisStage::Idle,
                AnalysisStage::Assembling,
                AnalysisStage::Failed(AnalysisErrorKind::InvalidRequest),
            ]
        );
    }

    #[test]
    fn remedies_deduplicated_case_insensitively() {
        let input = vec![
            " Pulsatilla ".to_string(),
            "pulsatilla".to_string(),
            "".to_string(),
            "Sepia".to_string(),
        ];
        assert_eq!(distinct_remedies(&input), vec!["Pulsatilla", "Sepia"]);
    }

    #[test]
    fn reply_text_maps_outcomes_one_to_one() {
        let err = reply_text(RetryOutcome {
            outcome: TransportOutcome::FatalFailure {
                reason: FatalReason::HttpStatus {
                    status: 503,
                    body: "unavailable".into(),
                },
            },
            attempts: 1,
        })
        .unwrap_err();
        assert!(matches!(err, AnalysisError::ServiceError { status: 503, .. }));

        let err = reply_text(RetryOutcome {
            outcome: TransportOutcome::RetryableFailure {
                reason: RetryReason::Network {
                    message: "timed out".into(),
                },
                suggested_delay: None,
            },
            attempts: 3,
        })
        .unwrap_err();
        assert!(matches!(err, AnalysisError::NetworkFailure { attempts: 3, .. }));

        let err = reply_text(RetryOutcome {
            outcome: TransportOutcome::FatalFailure {
                reason: FatalReason::MalformedEnvelope {
                    message: "no choices".into(),
                },
            },
            attempts: 1,
        })
        .unwrap_err();
        assert_eq!(err.kind(), AnalysisErrorKind::MalformedTransportResponse);
    }

    #[tokio::test(start_paused = true)]
    async fn narrative_analysis_persists_portrait() {
        let transport = Arc::new(ScriptedTransport::always(NARRATIVE_REPLY));
        let store = Arc::new(MemoryStore::new());
        let analyzer = analyzer(transport.clone(), store.clone());

        let themes = analyzer.analyze_narrative(&case()).await.unwrap();
        assert_eq!(themes.themes[0].theme, "Fear of abandonment");

        let saved = store.portrait_summaries();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].portrait_summary, "Dependent, anxious, seeks company");
        assert_eq!(saved[0].themes, vec!["Fear of abandonment"]);
        assert!(store.remedy_suggestions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn narrative_analysis_without_narrative_sends_nothing() {
        let transport = Arc::new(ScriptedTransport::always(NARRATIVE_REPLY));
        let analyzer = analyzer(transport.clone(), Arc::new(MemoryStore::new()));

        let fields = CaseFields::new().with(keys::NARRATIVE, json!("   "));
        let err = analyzer.analyze_narrative(&fields).await.unwrap_err();
        assert_eq!(err.kind(), AnalysisErrorKind::InvalidRequest);
        assert_eq!(transport.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn comparison_needs_two_distinct_remedies() {
        let transport = Arc::new(ScriptedTransport::always(COMPARISON_REPLY));
        let analyzer = analyzer(transport.clone(), Arc::new(MemoryStore::new()));

        let err = analyzer
            .compare_remedies(&case(), &["Pulsatilla".into(), "PULSATILLA".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidRequest(_)));
        assert_eq!(transport.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn comparison_prompt_carries_remedies_and_thermal() {
        let transport = Arc::new(ScriptedTransport::always(COMPARISON_REPLY));
        let analyzer = analyzer(transport.clone(), Arc::new(MemoryStore::new()));

        let result = analyzer
            .compare_remedies(&case(), &["Pulsatilla".into(), "Sepia".into()])
            .await
            .unwrap();
        assert_eq!(result.recommendation, "Pulsatilla");

        let sent = transport.sent_envelopes();
        assert_eq!(sent[0].task, AnalysisTaskKind::RemedyComparison);
        assert!(sent[0].user.contains("<remedies>\n- Pulsatilla\n- Sepia\n</remedies>"));
        assert!(sent[0].user.contains("Thermal state: hot"));
        assert!(sent[0].user.contains("Thirstless"));
    }

    #[tokio::test(start_paused = true)]
    async fn follow_up_includes_candidates() {
        let transport = Arc::new(ScriptedTransport::always(FOLLOW_UP_REPLY));
        let analyzer = analyzer(transport.clone(), Arc::new(MemoryStore::new()));

        let result = analyzer
            .suggest_follow_up_questions(&case(), &["Lycopodium".into()])
            .await
            .unwrap();
        assert_eq!(result.questions.len(), 1);
        assert!(transport.sent_envelopes()[0].user.contains("- Lycopodium"));
    }

    #[tokio::test(start_paused = true)]
    async fn peculiar_symptoms_on_empty_case_still_runs() {
        let reply = r#"{"peculiar_symptoms": [], "disclaimer": "Not medical advice."}"#;
        let transport = Arc::new(ScriptedTransport::always(reply));
        let analyzer = analyzer(transport.clone(), Arc::new(MemoryStore::new()));

        let result = analyzer
            .highlight_peculiar_symptoms(&CaseFields::new())
            .await
            .unwrap();
        assert!(result.peculiar_symptoms.is_empty());
        assert!(transport.sent_envelopes()[0].user.contains("not recorded"));
    }

    #[tokio::test(start_paused = true)]
    async fn service_error_is_not_retried_or_persisted() {
        let transport = Arc::new(ScriptedTransport::new(vec![TransportOutcome::FatalFailure {
            reason: FatalReason::HttpStatus {
                status: 500,
                body: "internal".into(),
            },
        }]));
        let store = Arc::new(MemoryStore::new());
        let analyzer = analyzer(transport.clone(), store.clone());

        let err = analyzer.analyze_case(&case()).await.unwrap_err();
        assert!(matches!(err, AnalysisError::ServiceError { status: 500, .. }));
        assert_eq!(transport.attempts(), 1);
        assert!(store.remedy_suggestions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn injected_decoder_error_is_returned_and_nothing_persisted() {
        let transport = Arc::new(ScriptedTransport::always(NARRATIVE_REPLY));
        let decoder = Arc::new(RejectingDecoder::default());
        let store = Arc::new(MemoryStore::new());
        let analyzer = CaseAnalyzer::new(
            transport.clone(),
            decoder.clone(),
            store.clone(),
            RetryPolicy::default(),
        );

        let err = analyzer.analyze_narrative(&case()).await.unwrap_err();
        assert!(matches!(err, AnalysisError::Decode(DecodeError::NoJsonObject)));
        assert_eq!(err.kind(), AnalysisErrorKind::Decode);
        assert_eq!(decoder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(transport.attempts(), 1);
        assert!(store.portrait_summaries().is_empty());

        let err = analyzer.analyze_case(&case()).await.unwrap_err();
        assert!(matches!(err, AnalysisError::Decode(DecodeError::NoJsonObject)));
        assert!(store.remedy_suggestions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn decoder_result_for_another_task_is_a_schema_mismatch() {
        let transport = Arc::new(ScriptedTransport::always(NARRATIVE_REPLY));
        let store = Arc::new(MemoryStore::new());
        let analyzer = CaseAnalyzer::new(
            transport,
            Arc::new(NarrativeOnlyDecoder),
            store.clone(),
            RetryPolicy::default(),
        );

        let err = analyzer.analyze_case(&case()).await.unwrap_err();
        assert!(matches!(
            err,
            AnalysisError::Decode(DecodeError::SchemaMismatch {
                task: AnalysisTaskKind::CaseRepertorization,
                ..
            })
        ));
        assert!(store.remedy_suggestions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn usage_counts_and_resets() {
        let transport = Arc::new(ScriptedTransport::new(vec![TransportOutcome::Success {
            text: NARRATIVE_REPLY.into(),
            usage: Some(TokenUsage {
                prompt_tokens: 120,
                completion_tokens: 40,
            }),
        }]));
        let analyzer = analyzer(transport, Arc::new(MemoryStore::new()));

        analyzer.analyze_narrative(&case()).await.unwrap();
        analyzer.analyze_narrative(&case()).await.unwrap();

        let usage = analyzer.usage().await;
        assert_eq!(usage.total_requests, 2);
        assert_eq!(usage.prompt_tokens, 240);
        assert_eq!(usage.completion_tokens, 80);
        assert!(usage.last_request_at.is_some());

        analyzer.reset_usage().await;
        let usage = analyzer.usage().await;
        assert_eq!(usage.total_requests, 0);
        assert_eq!(usage.prompt_tokens, 0);
    }

    #[test]
    fn from_config_rejects_invalid_config() {
        let mut config = AnalysisConfig::default();
        config.base_url = "not a url".into();
        let result = CaseAnalyzer::from_config(&config, "key", Arc::new(MemoryStore::new()));
        assert!(matches!(result, Err(AnalysisError::Configuration(_))));
    }
}
