use std::collections::BTreeMap;
use std::fs;
use std::panic::{self, AssertUnwindSafe};

use camino::{Utf8Path, Utf8PathBuf};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::convert::ExternalConverter;
use crate::domain::FoodItemKey;
use crate::error::FilterError;
use crate::listing::ListingClient;
use crate::orchestrator::StudyOrchestrator;
use crate::remote::ContentSource;
use crate::study::{AugmentedStudy, StudyOutcome, StudyRecord};

const INPUT_PREFIX: &str = "decided_";
const OUTPUT_PREFIX: &str = "final_";
const FILE_SUFFIX: &str = "_gnps_datasets.json";

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub input: String,
    pub output: String,
    pub food_item_key: Option<String>,
    pub studies: usize,
    pub total_ms2_spectra: u64,
    pub by_source: BTreeMap<String, usize>,
}

pub fn food_key_from_input(path: &Utf8Path) -> Option<FoodItemKey> {
    let key = path
        .file_name()?
        .strip_prefix(INPUT_PREFIX)?
        .strip_suffix(FILE_SUFFIX)?;
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '-'));
    valid.then(|| FoodItemKey::new(key))
}

pub fn output_path_for(input: &Utf8Path, food_item: &FoodItemKey) -> Utf8PathBuf {
    let name = format!("{OUTPUT_PREFIX}{}{FILE_SUFFIX}", food_item.as_str());
    match input.parent() {
        Some(parent) => parent.join(name),
        None => Utf8PathBuf::from(name),
    }
}

pub fn discover_inputs(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, FilterError> {
    let entries = fs::read_dir(dir.as_std_path())
        .map_err(|err| FilterError::Filesystem(format!("read {dir}: {err}")))?;
    let mut inputs = entries
        .flatten()
        .filter_map(|entry| Utf8PathBuf::from_path_buf(entry.path()).ok())
        .filter(|path| food_key_from_input(path).is_some())
        .collect::<Vec<_>>();
    inputs.sort();
    Ok(inputs)
}

pub fn load_studies(path: &Utf8Path) -> Result<Vec<StudyRecord>, FilterError> {
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| FilterError::Filesystem(format!("read {path}: {err}")))?;
    serde_json::from_str::<Vec<StudyRecord>>(&content)
        .map_err(|err| FilterError::InputParse(format!("{path}: {err}")))
}

pub fn write_studies(path: &Utf8Path, studies: &[AugmentedStudy]) -> Result<(), FilterError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_str().is_empty()) {
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| FilterError::Filesystem(err.to_string()))?;
    }
    let bytes = serde_json::to_vec_pretty(studies)
        .map_err(|err| FilterError::Filesystem(err.to_string()))?;
    fs::write(path.as_std_path(), bytes).map_err(|err| FilterError::Filesystem(err.to_string()))
}

pub struct BatchRunner<L: ListingClient, S: ContentSource, C: ExternalConverter> {
    orchestrator: StudyOrchestrator<L, S, C>,
    study_pool: ThreadPool,
}

impl<L: ListingClient, S: ContentSource, C: ExternalConverter> BatchRunner<L, S, C> {
    pub fn new(
        orchestrator: StudyOrchestrator<L, S, C>,
        study_workers: usize,
    ) -> Result<Self, FilterError> {
        let study_pool = ThreadPoolBuilder::new()
            .num_threads(study_workers.max(1))
            .thread_name(|idx| format!("ms2-study-{idx}"))
            .build()
            .map_err(|err| FilterError::WorkerPool(err.to_string()))?;
        Ok(Self {
            orchestrator,
            study_pool,
        })
    }

    /// Processes every record; output is sorted by study id. A study that
    /// panics is reported with the `processing_error` tag.
    pub fn process_studies(
        &self,
        records: Vec<StudyRecord>,
        food_item: Option<&FoodItemKey>,
    ) -> Vec<AugmentedStudy> {
        let total = records.len();
        let mut studies = self.study_pool.install(|| {
            records
                .into_par_iter()
                .enumerate()
                .map(|(idx, record)| {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                        self.orchestrator.process(&record, food_item)
                    }))
                    .unwrap_or_else(|payload| {
                        let message = panic_message(payload.as_ref());
                        error!(study_id = record.id(), %message, "study processing panicked");
                        StudyOutcome::processing_error(message)
                    });
                    info!(
                        study_id = record.id(),
                        "({}/{total}) completed study",
                        idx + 1
                    );
                    record.merge(outcome)
                })
                .collect::<Vec<_>>()
        });
        studies.sort_by(|a, b| a.record.study_id.cmp(&b.record.study_id));
        studies
    }

    pub fn run_file(
        &self,
        input: &Utf8Path,
        output: Option<&Utf8Path>,
        food_item: Option<&FoodItemKey>,
    ) -> Result<BatchSummary, FilterError> {
        let food_item = food_item.cloned().or_else(|| food_key_from_input(input));
        let output = match (output, food_item.as_ref()) {
            (Some(path), _) => path.to_path_buf(),
            (None, Some(key)) => output_path_for(input, key),
            (None, None) => {
                return Err(FilterError::InputParse(format!(
                    "cannot derive food item key from {input}; pass --food-item and --output"
                )));
            }
        };
        if food_item.is_none() {
            warn!(%input, "no food item key; MAYBE studies get no organism keywords");
        }

        info!(%input, food_item = ?food_item.as_ref().map(FoodItemKey::as_str), "processing study file");
        let records = load_studies(input)?;
        let studies = self.process_studies(records, food_item.as_ref());
        write_studies(&output, &studies)?;
        info!(%output, studies = studies.len(), "saved processed studies");

        let mut by_source = BTreeMap::new();
        for study in &studies {
            *by_source
                .entry(study.outcome.ms2_count_source_type.to_string())
                .or_insert(0) += 1;
        }
        Ok(BatchSummary {
            input: input.to_string(),
            output: output.to_string(),
            food_item_key: food_item.map(|key| key.as_str().to_string()),
            studies: studies.len(),
            total_ms2_spectra: studies
                .iter()
                .map(|study| study.outcome.total_ms2_spectra_from_selected_files)
                .sum(),
            by_source,
        })
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "study processing panicked".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn food_key_parsed_from_input_name() {
        let key = food_key_from_input(Utf8Path::new("data/decided_oryza_sativa_gnps_datasets.json"));
        assert_eq!(key, Some(FoodItemKey::new("oryza_sativa")));
        assert_eq!(
            food_key_from_input(Utf8Path::new("data/filtered_rice_gnps_datasets.json")),
            None
        );
        assert_eq!(
            food_key_from_input(Utf8Path::new("decided_rice flour_gnps_datasets.json")),
            None
        );
    }

    #[test]
    fn output_sits_next_to_input() {
        let key = FoodItemKey::new("zea_mays");
        let output = output_path_for(Utf8Path::new("data/decided_zea_mays_gnps_datasets.json"), &key);
        assert_eq!(output, Utf8PathBuf::from("data/final_zea_mays_gnps_datasets.json"));
    }
}
