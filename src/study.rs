use std::fmt;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::classify::ClassificationDecision;
use crate::counter::{CountResult, CountStatus, CountStrategy};
use crate::domain::{FoodItemKey, Tier};

pub const OUTCOME_KEYS: &[&str] = &[
    "selected_files_for_ms2_analysis",
    "total_ms2_spectra_from_selected_files",
    "unsupported_files_skipped_count",
    "ms2_count_source_type",
    "files_listed_count",
    "qc_files_skipped_count",
    "irrelevant_files_skipped_count",
    "budget_excluded_files_count",
    "failed_files_count",
    "listing_warnings",
    "processing_error_message",
];

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct StudyRecord {
    #[serde(default)]
    pub study_id: Option<String>,
    #[serde(default)]
    pub llm_assessment: Option<String>,
    #[serde(default)]
    pub ftp_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub food_item_key: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StudyRecord {
    pub fn id(&self) -> &str {
        self.study_id.as_deref().unwrap_or("UNKNOWN_ID")
    }

    pub fn tier(&self) -> Tier {
        self.llm_assessment
            .as_deref()
            .and_then(|value| value.parse().ok())
            .unwrap_or(Tier::Rejected)
    }

    pub fn food_item(&self) -> Option<FoodItemKey> {
        self.food_item_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .map(FoodItemKey::new)
    }

    pub fn merge(mut self, outcome: StudyOutcome) -> AugmentedStudy {
        for key in OUTCOME_KEYS {
            self.extra.remove(*key);
        }
        AugmentedStudy {
            record: self,
            outcome,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AugmentedStudy {
    #[serde(flatten)]
    pub record: StudyRecord,
    #[serde(flatten)]
    pub outcome: StudyOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ms2CountSource {
    RejectedByLlm,
    NoFtpLink,
    ListingFailed,
    NoFilesFound(Tier),
    AllSkippedConversionDisabled(Tier),
    NoProcessableFiles(Tier),
    AllBudgetExcluded(Tier),
    HeuristicFiltered(Tier),
    ProcessingError,
}

impl fmt::Display for Ms2CountSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ms2CountSource::RejectedByLlm => write!(f, "rejected_by_llm"),
            Ms2CountSource::NoFtpLink => write!(f, "no_ftp_link"),
            Ms2CountSource::ListingFailed => write!(f, "listing_failed"),
            Ms2CountSource::NoFilesFound(tier) => {
                write!(f, "ftp_no_files_found_{}", tier.as_lower())
            }
            Ms2CountSource::AllSkippedConversionDisabled(tier) => {
                write!(f, "all_skipped_conversion_disabled_{}", tier.as_lower())
            }
            Ms2CountSource::NoProcessableFiles(tier) => {
                write!(
                    f,
                    "no_processable_files_passed_heuristics_{}",
                    tier.as_lower()
                )
            }
            Ms2CountSource::AllBudgetExcluded(tier) => {
                write!(f, "all_selected_files_budget_excluded_{}", tier.as_lower())
            }
            Ms2CountSource::HeuristicFiltered(tier) => {
                write!(f, "ftp_analysis_{}_heuristic_filtered", tier.as_lower())
            }
            Ms2CountSource::ProcessingError => write!(f, "processing_error"),
        }
    }
}

impl Serialize for Ms2CountSource {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileCountStatus {
    Counted,
    Failed,
    BudgetExceeded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileFailure {
    pub error_kind: String,
    pub partial_ms2_spectra: u64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRecord {
    pub ftp_file_path: String,
    pub filename: String,
    pub file_ext_lower: String,
    pub heuristic_match_reason: String,
    pub ms2_spectra_in_file: u64,
    pub count_status: FileCountStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<CountStrategy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FileFailure>,
}

impl FileRecord {
    fn base(decision: &ClassificationDecision, count_status: FileCountStatus) -> Self {
        Self {
            ftp_file_path: decision.entry.path.clone(),
            filename: decision.entry.filename().to_string(),
            file_ext_lower: decision.entry.extension_lower(),
            heuristic_match_reason: decision.reason.clone(),
            ms2_spectra_in_file: 0,
            count_status,
            strategy: None,
            failure: None,
        }
    }

    pub fn from_count(decision: &ClassificationDecision, result: &CountResult) -> Self {
        match &result.status {
            CountStatus::Counted { ms2_spectra } => Self {
                ms2_spectra_in_file: *ms2_spectra,
                strategy: Some(result.strategy),
                ..Self::base(decision, FileCountStatus::Counted)
            },
            CountStatus::Failed {
                error_kind,
                partial_ms2_spectra,
                message,
            } => Self {
                strategy: Some(result.strategy),
                failure: Some(FileFailure {
                    error_kind: error_kind.clone(),
                    partial_ms2_spectra: *partial_ms2_spectra,
                    message: message.clone(),
                }),
                ..Self::base(decision, FileCountStatus::Failed)
            },
        }
    }

    pub fn budget_excluded(decision: &ClassificationDecision) -> Self {
        Self::base(decision, FileCountStatus::BudgetExceeded)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StudyOutcome {
    pub selected_files_for_ms2_analysis: Vec<FileRecord>,
    pub total_ms2_spectra_from_selected_files: u64,
    pub unsupported_files_skipped_count: usize,
    pub ms2_count_source_type: Ms2CountSource,
    pub files_listed_count: usize,
    pub qc_files_skipped_count: usize,
    pub irrelevant_files_skipped_count: usize,
    pub budget_excluded_files_count: usize,
    pub failed_files_count: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub listing_warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_error_message: Option<String>,
}

impl StudyOutcome {
    pub fn short_circuit(source: Ms2CountSource) -> Self {
        Self {
            selected_files_for_ms2_analysis: Vec::new(),
            total_ms2_spectra_from_selected_files: 0,
            unsupported_files_skipped_count: 0,
            ms2_count_source_type: source,
            files_listed_count: 0,
            qc_files_skipped_count: 0,
            irrelevant_files_skipped_count: 0,
            budget_excluded_files_count: 0,
            failed_files_count: 0,
            listing_warnings: Vec::new(),
            processing_error_message: None,
        }
    }

    pub fn processing_error(message: impl Into<String>) -> Self {
        Self {
            processing_error_message: Some(message.into()),
            ..Self::short_circuit(Ms2CountSource::ProcessingError)
        }
    }
}
