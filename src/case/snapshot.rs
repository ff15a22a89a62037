use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{keys, CaseFields, CaseState};

/// Immutable bundle of the case fields one analysis request needs.
/// Rebuilt from live case state on every call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaseSnapshot {
    pub narrative: Option<String>,
    pub chief_complaints: Vec<ChiefComplaint>,
    pub physical_generals: PhysicalGenerals,
    pub mental_emotional: MentalEmotional,
    pub key_symptoms: Vec<String>,
}

/// One presenting complaint, described by location, sensation, modalities
/// and concomitants.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChiefComplaint {
    pub title: Option<String>,
    pub location: Option<String>,
    pub sensation: Option<String>,
    pub modalities: Option<String>,
    pub concomitants: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhysicalGenerals {
    pub thermal: Option<String>,
    pub appetite: Option<String>,
    pub thirst: Option<String>,
    pub cravings: Option<String>,
    pub aversions: Option<String>,
    pub perspiration: Option<String>,
    pub sleep: Option<String>,
    pub dreams: Option<String>,
    pub energy: Option<String>,
    /// Extra labeled entries the form recorded outside the known set.
    pub other: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MentalEmotional {
    pub mood: Option<String>,
    pub fears: Option<String>,
    pub anxieties: Option<String>,
    pub anger: Option<String>,
    pub grief: Option<String>,
    pub sensitivities: Option<String>,
    pub disposition: Option<String>,
    pub other: BTreeMap<String, String>,
}

impl ChiefComplaint {
    pub fn labeled(&self) -> [(&'static str, Option<&str>); 5] {
        [
            ("Complaint", self.title.as_deref()),
            ("Location", self.location.as_deref()),
            ("Sensation", self.sensation.as_deref()),
            ("Modalities", self.modalities.as_deref()),
            ("Concomitants", self.concomitants.as_deref()),
        ]
    }

    fn is_blank(&self) -> bool {
        self.labeled().iter().all(|(_, v)| v.is_none())
    }
}

impl PhysicalGenerals {
    const KNOWN: [&'static str; 9] = [
        "thermal",
        "appetite",
        "thirst",
        "cravings",
        "aversions",
        "perspiration",
        "sleep",
        "dreams",
        "energy",
    ];

    pub fn labeled(&self) -> [(&'static str, Option<&str>); 9] {
        [
            ("Thermal state", self.thermal.as_deref()),
            ("Appetite", self.appetite.as_deref()),
            ("Thirst", self.thirst.as_deref()),
            ("Cravings", self.cravings.as_deref()),
            ("Aversions", self.aversions.as_deref()),
            ("Perspiration", self.perspiration.as_deref()),
            ("Sleep", self.sleep.as_deref()),
            ("Dreams", self.dreams.as_deref()),
            ("Energy", self.energy.as_deref()),
        ]
    }

    fn from_object(obj: &Map<String, Value>) -> Self {
        Self {
            thermal: text_at(obj, "thermal"),
            appetite: text_at(obj, "appetite"),
            thirst: text_at(obj, "thirst"),
            cravings: text_at(obj, "cravings"),
            aversions: text_at(obj, "aversions"),
            perspiration: text_at(obj, "perspiration"),
            sleep: text_at(obj, "sleep"),
            dreams: text_at(obj, "dreams"),
            energy: text_at(obj, "energy"),
            other: extra_entries(obj, &Self::KNOWN),
        }
    }
}

impl MentalEmotional {
    const KNOWN: [&'static str; 7] = [
        "mood",
        "fears",
        "anxieties",
        "anger",
        "grief",
        "sensitivities",
        "disposition",
    ];

    pub fn labeled(&self) -> [(&'static str, Option<&str>); 7] {
        [
            ("Mood", self.mood.as_deref()),
            ("Fears", self.fears.as_deref()),
            ("Anxieties", self.anxieties.as_deref()),
            ("Anger and irritability", self.anger.as_deref()),
            ("Grief", self.grief.as_deref()),
            ("Sensitivities", self.sensitivities.as_deref()),
            ("Disposition", self.disposition.as_deref()),
        ]
    }

    fn from_object(obj: &Map<String, Value>) -> Self {
        Self {
            mood: text_at(obj, "mood"),
            fears: text_at(obj, "fears"),
            anxieties: text_at(obj, "anxieties"),
            anger: text_at(obj, "anger"),
            grief: text_at(obj, "grief"),
            sensitivities: text_at(obj, "sensitivities"),
            disposition: text_at(obj, "disposition"),
            other: extra_entries(obj, &Self::KNOWN),
        }
    }
}

impl CaseSnapshot {
    /// True when nothing analysable was recorded.
    pub fn is_empty(&self) -> bool {
        self.narrative.is_none()
            && self.chief_complaints.is_empty()
            && self.key_symptoms.is_empty()
            && self.physical_generals == PhysicalGenerals::default()
            && self.mental_emotional == MentalEmotional::default()
    }
}

/// Build a snapshot from the current case fields.
///
/// Total: missing, blank, or wrongly-typed fields become absent.
pub fn assemble_snapshot(fields: &CaseFields) -> CaseSnapshot {
    let empty = Map::new();

    let narrative = fields.get(keys::NARRATIVE).and_then(text_value);

    let chief_complaints = fields
        .get(keys::CHIEF_COMPLAINTS)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_object)
                .map(complaint_from_object)
                .filter(|c| !c.is_blank())
                .collect()
        })
        .unwrap_or_default();

    let generals = fields
        .get(keys::PHYSICAL_GENERALS)
        .and_then(Value::as_object)
        .unwrap_or(&empty);

    let mental = fields
        .get(keys::MENTAL_EMOTIONAL)
        .and_then(Value::as_object)
        .unwrap_or(&empty);

    let mut key_symptoms: Vec<String> = Vec::new();
    if let Some(items) = fields.get(keys::KEY_SYMPTOMS).and_then(Value::as_array) {
        for symptom in items.iter().filter_map(text_value) {
            if !key_symptoms.contains(&symptom) {
                key_symptoms.push(symptom);
            }
        }
    }

    CaseSnapshot {
        narrative,
        chief_complaints,
        physical_generals: PhysicalGenerals::from_object(generals),
        mental_emotional: MentalEmotional::from_object(mental),
        key_symptoms,
    }
}

/// Convenience wrapper over a case-state collaborator.
pub fn assemble_from<S: CaseState + ?Sized>(state: &S) -> CaseSnapshot {
    assemble_snapshot(&state.current_fields())
}

fn complaint_from_object(obj: &Map<String, Value>) -> ChiefComplaint {
    ChiefComplaint {
        title: text_at(obj, "title"),
        location: text_at(obj, "location"),
        sensation: text_at(obj, "sensation"),
        modalities: text_at(obj, "modalities"),
        concomitants: text_at(obj, "concomitants"),
    }
}

fn text_at(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(text_value)
}

/// Strings are trimmed; string lists are joined. Anything else is absent.
fn text_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Array(items) => {
            let parts: Vec<&str> = items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect();
            (!parts.is_empty()).then(|| parts.join(", "))
        }
        _ => None,
    }
}

fn extra_entries(obj: &Map<String, Value>, known: &[&str]) -> BTreeMap<String, String> {
    obj.iter()
        .filter(|(k, _)| !known.contains(&k.as_str()))
        .filter_map(|(k, v)| text_value(v).map(|text| (k.clone(), text)))
        .collect()
}
