use std::fmt::Write as _;

use super::sanitize::{sanitize_case_text, sanitize_field};
use super::types::{AnalysisTask, ComparisonPayload, FollowUpPayload, PromptEnvelope};
use crate::case::{CaseSnapshot, ChiefComplaint};

/// Rendered in place of any absent field so the model never guesses structure.
pub const NOT_RECORDED: &str = "not recorded";

pub const ANALYSIS_SYSTEM_PROMPT: &str = r#"
You are a clinical assistant supporting a qualified homeopathic practitioner
during case analysis. You organise and weigh what the practitioner recorded.
You do not diagnose, prescribe, or replace the practitioner's judgement.

SYMPTOM HIERARCHY (weigh symptoms in this order):
1. Mental and emotional state
2. Physical generals (thermal state, appetite, thirst, cravings, sleep, perspiration)
3. Strange, rare and peculiar symptoms
4. Local complaints (location, sensation, modalities, concomitants)

RULES (ABSOLUTE, NO EXCEPTIONS):
1. Use ONLY information present in the case. Fields marked "not recorded" are unknown; never invent them.
2. Every response MUST include a non-empty "disclaimer" field stating that the output is
   decision support for a qualified practitioner and not medical advice.
3. Output MUST be a single valid JSON object matching the requested shape.
4. Output JSON only: no prose before or after it.
"#;

/// Build the envelope for one analysis task.
pub fn build_envelope(task: AnalysisTask<'_>) -> PromptEnvelope {
    let user = match task {
        AnalysisTask::Narrative(snapshot) => build_narrative_prompt(snapshot),
        AnalysisTask::PeculiarSymptoms(snapshot) => build_peculiar_prompt(snapshot),
        AnalysisTask::Repertorization(snapshot) => build_repertorization_prompt(snapshot),
        AnalysisTask::RemedyComparison(payload) => build_comparison_prompt(payload),
        AnalysisTask::FollowUp(payload) => build_follow_up_prompt(payload),
    };

    PromptEnvelope {
        task: task.kind(),
        system: ANALYSIS_SYSTEM_PROMPT.trim().to_string(),
        user,
    }
}

// ──────────────────────────────────────────────
// Case rendering
// ──────────────────────────────────────────────

/// Render every section of the snapshot as labeled text.
///
/// Values are sanitized before the absence check, so a value that sanitizes
/// to nothing renders as [`NOT_RECORDED`] like a missing one.
pub fn render_snapshot(snapshot: &CaseSnapshot) -> String {
    let mut out = String::new();

    out.push_str("## Narrative\n");
    let narrative = snapshot
        .narrative
        .as_deref()
        .and_then(|text| non_empty(sanitize_case_text(text)));
    out.push_str(narrative.as_deref().unwrap_or(NOT_RECORDED));
    out.push_str("\n\n");

    out.push_str("## Chief complaints\n");
    render_complaints(&mut out, &snapshot.chief_complaints);
    out.push('\n');

    out.push_str("## Physical generals\n");
    render_labeled(&mut out, &snapshot.physical_generals.labeled());
    render_other(&mut out, snapshot.physical_generals.other.iter());
    out.push('\n');

    out.push_str("## Mental and emotional state\n");
    render_labeled(&mut out, &snapshot.mental_emotional.labeled());
    render_other(&mut out, snapshot.mental_emotional.other.iter());
    out.push('\n');

    out.push_str("## Selected key symptoms\n");
    render_list(&mut out, &snapshot.key_symptoms);

    out
}

fn non_empty(value: String) -> Option<String> {
    (!value.trim().is_empty()).then_some(value)
}

fn clean_field(raw: &str) -> Option<String> {
    non_empty(sanitize_field(raw))
}

fn render_complaints(out: &mut String, complaints: &[ChiefComplaint]) {
    if complaints.is_empty() {
        let _ = writeln!(out, "{NOT_RECORDED}");
        return;
    }
    for (i, complaint) in complaints.iter().enumerate() {
        let _ = writeln!(out, "Complaint {}:", i + 1);
        render_labeled(out, &complaint.labeled());
    }
}

fn render_labeled(out: &mut String, fields: &[(&str, Option<&str>)]) {
    for (label, value) in fields {
        let value = value.and_then(clean_field);
        let _ = writeln!(out, "- {label}: {}", value.as_deref().unwrap_or(NOT_RECORDED));
    }
}

/// Free-form entries; an entry whose label sanitizes away is dropped.
fn render_other<'a>(out: &mut String, extra: impl Iterator<Item = (&'a String, &'a String)>) {
    for (label, value) in extra {
        let Some(label) = clean_field(label) else {
            continue;
        };
        let value = clean_field(value);
        let _ = writeln!(out, "- {label}: {}", value.as_deref().unwrap_or(NOT_RECORDED));
    }
}

fn render_list(out: &mut String, items: &[String]) {
    let items: Vec<String> = items.iter().filter_map(|item| clean_field(item)).collect();
    if items.is_empty() {
        let _ = writeln!(out, "{NOT_RECORDED}");
        return;
    }
    for item in items {
        let _ = writeln!(out, "- {item}");
    }
}

// ──────────────────────────────────────────────
// Task templates
// ──────────────────────────────────────────────

fn build_narrative_prompt(snapshot: &CaseSnapshot) -> String {
    let case = render_snapshot(snapshot);
    format!(
        r#"<case>
{case}</case>

TASK: Read the narrative and identify the recurring themes that characterise this person.
Quote or paraphrase the narrative as evidence for each theme. Write a short constitutional
portrait (3-5 sentences) and list the mental/emotional features that stand out.

Return JSON shaped exactly like this:
{{
  "themes": [
    {{"theme": "Anticipatory anxiety", "evidence": "Sleepless before every exam"}}
  ],
  "portrait_summary": "A warm, anxious person who ...",
  "mental_emotional_highlights": ["Fear of being alone"],
  "suggested_key_symptoms": ["Anxiety before events"],
  "disclaimer": "Decision support for a qualified practitioner, not medical advice."
}}
"#
    )
}

fn build_peculiar_prompt(snapshot: &CaseSnapshot) -> String {
    let case = render_snapshot(snapshot);
    format!(
        r#"<case>
{case}</case>

TASK: Identify the strange, rare and peculiar (SRP) symptoms in this case: symptoms that are
unexpected for the complaint, paradoxical, or highly individual. Explain why each is peculiar
and, where you can, suggest the repertory rubric it points to.

Return JSON shaped exactly like this:
{{
  "peculiar_symptoms": [
    {{
      "symptom": "Burning pains relieved by heat",
      "why_peculiar": "Burning sensations are usually relieved by cold",
      "rubric_hint": "Generals; burning; ameliorated by heat"
    }}
  ],
  "disclaimer": "Decision support for a qualified practitioner, not medical advice."
}}
"#
    )
}

fn build_repertorization_prompt(snapshot: &CaseSnapshot) -> String {
    let case = render_snapshot(snapshot);
    format!(
        r#"<case>
{case}</case>

TASK: Analyse the whole case. Rank its symptoms by the hierarchy in your instructions, then
suggest the remedies that best cover the totality, strongest first. Give each remedy a
confidence of "high", "moderate" or "low" and name the case symptoms it covers.

Return JSON shaped exactly like this:
{{
  "case_summary": "Chilly, anxious patient with ...",
  "symptom_hierarchy": {{
    "mental": ["Fear of death at night"],
    "generals": ["Chilly"],
    "peculiar": ["Thirst for small sips"],
    "local": ["Burning epigastric pain"]
  }},
  "remedies": [
    {{
      "name": "Arsenicum album",
      "confidence": "high",
      "rationale": "Covers anxiety, chilliness and burning pains",
      "matching_symptoms": ["Fear of death at night", "Chilly"]
    }}
  ],
  "disclaimer": "Decision support for a qualified practitioner, not medical advice."
}}
"#
    )
}

fn build_comparison_prompt(payload: &ComparisonPayload) -> String {
    let mut remedies = String::new();
    render_list(&mut remedies, &payload.remedies);
    let mut symptoms = String::new();
    render_list(&mut symptoms, &payload.key_symptoms);
    let thermal = payload
        .thermal
        .as_deref()
        .and_then(clean_field)
        .unwrap_or_else(|| NOT_RECORDED.to_string());

    format!(
        r#"<remedies>
{remedies}</remedies>

<case_essentials>
## Selected key symptoms
{symptoms}- Thermal state: {thermal}
</case_essentials>

TASK: Compare the remedies above against the case essentials. For each remedy list the case
features that support it and those that argue against it, rate its fit, and recommend which
remedy fits best. Suggest questions that would differentiate between them.

Return JSON shaped exactly like this:
{{
  "comparisons": [
    {{
      "remedy": "Pulsatilla",
      "supporting_features": ["Weepy, wants consolation"],
      "contradicting_features": ["Patient is chilly"],
      "fit": "moderate"
    }}
  ],
  "recommendation": "Which remedy fits best and why",
  "differentiating_questions": ["Does open air make you feel better or worse?"],
  "disclaimer": "Decision support for a qualified practitioner, not medical advice."
}}
"#
    )
}

fn build_follow_up_prompt(payload: &FollowUpPayload) -> String {
    let case = render_snapshot(&payload.snapshot);
    let mut candidates = String::new();
    render_list(&mut candidates, &payload.candidate_remedies);

    format!(
        r#"<case>
{case}</case>

<candidate_remedies>
{candidates}</candidate_remedies>

TASK: Suggest follow-up questions the practitioner should ask to complete this case. Prioritise
sections marked "not recorded" and anything that would confirm or rule out a candidate remedy.
Explain the purpose of each question.

Return JSON shaped exactly like this:
{{
  "questions": [
    {{
      "question": "How do you react to consolation when upset?",
      "purpose": "Mental state is not recorded",
      "target_remedy": "Natrum muriaticum"
    }}
  ],
  "disclaimer": "Decision support for a qualified practitioner, not medical advice."
}}
"#
    )
}
