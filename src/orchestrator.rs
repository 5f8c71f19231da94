use std::sync::atomic::{AtomicUsize, Ordering};

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, info, warn};

use crate::classify::{ClassificationDecision, Classifier, Disposition};
use crate::config::{AdmissionOrder, ResolvedConfig};
use crate::convert::{ConversionGate, ExternalConverter};
use crate::counter::{CountResult, SpectralCounter};
use crate::domain::{FoodItemKey, RemoteLocation, Tier};
use crate::error::FilterError;
use crate::listing::{Listing, ListingClient};
use crate::remote::ContentSource;
use crate::rules::RuleSet;
use crate::study::{FileRecord, Ms2CountSource, StudyOutcome, StudyRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StudyPhase {
    NotStarted,
    Listed,
    Classified,
    Budgeted,
    Counted,
    Aggregated,
}

#[derive(Debug)]
pub struct AdmissionBudget {
    remaining: AtomicUsize,
}

impl AdmissionBudget {
    pub fn new(cap: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(cap),
        }
    }

    pub fn try_admit(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_files_per_study: usize,
    pub admission_order: AdmissionOrder,
    pub file_workers: usize,
    pub conversion_enabled: bool,
}

impl From<&ResolvedConfig> for OrchestratorSettings {
    fn from(config: &ResolvedConfig) -> Self {
        Self {
            max_files_per_study: config.max_files_per_study,
            admission_order: config.admission_order,
            file_workers: config.file_workers,
            conversion_enabled: config.enable_conversion,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Admission {
    pub admitted: Vec<ClassificationDecision>,
    pub excluded: Vec<ClassificationDecision>,
}

pub struct StudyOrchestrator<L: ListingClient, S: ContentSource, C: ExternalConverter> {
    listing: L,
    counter: SpectralCounter<S, C>,
    qc_rules: RuleSet,
    maybe_rules: RuleSet,
    settings: OrchestratorSettings,
    file_pool: ThreadPool,
}

impl<L: ListingClient, S: ContentSource, C: ExternalConverter> StudyOrchestrator<L, S, C> {
    pub fn new(
        config: &ResolvedConfig,
        listing: L,
        source: S,
        converter: C,
        gate: ConversionGate,
    ) -> Result<Self, FilterError> {
        let settings = OrchestratorSettings::from(config);
        let counter = SpectralCounter::new(source, converter, gate, settings.conversion_enabled)?;
        let file_pool = ThreadPoolBuilder::new()
            .num_threads(settings.file_workers)
            .thread_name(|idx| format!("ms2-count-{idx}"))
            .build()
            .map_err(|err| FilterError::WorkerPool(err.to_string()))?;
        Ok(Self {
            listing,
            counter,
            qc_rules: config.qc_rules.clone(),
            maybe_rules: config.maybe_rules.clone(),
            settings,
            file_pool,
        })
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Runs one study to its terminal outcome. Every failure is folded into
    /// the outcome's source tag; nothing is returned as an error.
    pub fn process(&self, record: &StudyRecord, food_item: Option<&FoodItemKey>) -> StudyOutcome {
        let study_id = record.id();
        let tier = record.tier();
        let mut phase = StudyPhase::NotStarted;
        debug!(study_id, ?phase, %tier, "processing study");

        if tier == Tier::Rejected {
            info!(study_id, "study rejected upstream; skipping MS2 analysis");
            return StudyOutcome::short_circuit(Ms2CountSource::RejectedByLlm);
        }

        let location = match record
            .ftp_link
            .as_deref()
            .ok_or_else(|| FilterError::InvalidRemoteLocation("missing".to_string()))
            .and_then(str::parse::<RemoteLocation>)
        {
            Ok(location) => location,
            Err(err) => {
                warn!(study_id, error = %err, "no usable remote link; skipping MS2 analysis");
                return StudyOutcome::short_circuit(Ms2CountSource::NoFtpLink);
            }
        };

        let listing = match self.listing.list(&location) {
            Ok(listing) => listing,
            Err(err) => {
                warn!(study_id, %location, error = %err, "listing failed");
                let mut outcome = StudyOutcome::short_circuit(Ms2CountSource::ListingFailed);
                outcome.listing_warnings.push(err.to_string());
                return outcome;
            }
        };
        phase = StudyPhase::Listed;
        debug!(study_id, ?phase, files = listing.entries.len(), "listed remote files");
        for warning in &listing.warnings {
            warn!(study_id, warning = %warning, "partial listing");
        }
        if listing.entries.is_empty() {
            warn!(study_id, %location, "no files found");
            let mut outcome = StudyOutcome::short_circuit(Ms2CountSource::NoFilesFound(tier));
            outcome.listing_warnings = listing.warnings;
            return outcome;
        }

        let food_item = record.food_item().or_else(|| food_item.cloned());
        let classifier = match Classifier::new(
            &self.qc_rules,
            &self.maybe_rules,
            food_item.as_ref(),
            self.settings.conversion_enabled,
        ) {
            Ok(classifier) => classifier,
            Err(err) => return StudyOutcome::processing_error(err.to_string()),
        };
        let decisions = classifier.classify_all(tier, &listing.entries);
        phase = StudyPhase::Classified;
        debug!(study_id, ?phase, "classified files");

        let admission = self.admit(&decisions);
        phase = StudyPhase::Budgeted;
        if !admission.excluded.is_empty() {
            warn!(
                study_id,
                selected = admission.admitted.len() + admission.excluded.len(),
                cap = self.settings.max_files_per_study,
                "selection exceeds per-study cap"
            );
        }
        debug!(study_id, ?phase, admitted = admission.admitted.len(), "budget applied");

        let results = self.count_admitted(&location, &admission.admitted);
        phase = StudyPhase::Counted;
        debug!(study_id, ?phase, "counting finished");

        let outcome = aggregate(tier, &listing, &decisions, &admission, &results);
        phase = StudyPhase::Aggregated;
        info!(
            study_id,
            ?phase,
            total = outcome.total_ms2_spectra_from_selected_files,
            unsupported_skipped = outcome.unsupported_files_skipped_count,
            source = %outcome.ms2_count_source_type,
            "finished MS2 analysis"
        );
        outcome
    }

    pub fn admit(&self, decisions: &[ClassificationDecision]) -> Admission {
        let mut selected = decisions
            .iter()
            .filter(|decision| decision.is_selected())
            .cloned()
            .collect::<Vec<_>>();
        if self.settings.admission_order == AdmissionOrder::SignalStrength {
            selected.sort_by_key(signal_rank);
        }

        let budget = AdmissionBudget::new(self.settings.max_files_per_study);
        let mut admission = Admission::default();
        for decision in selected {
            if budget.try_admit() {
                admission.admitted.push(decision);
            } else {
                admission.excluded.push(decision);
            }
        }
        admission
    }

    fn count_admitted(
        &self,
        location: &RemoteLocation,
        admitted: &[ClassificationDecision],
    ) -> Vec<CountResult> {
        self.file_pool.install(|| {
            admitted
                .par_iter()
                .map(|decision| {
                    let url = location.file_url(&decision.entry.path);
                    self.counter.count(&decision.entry, &url)
                })
                .collect()
        })
    }
}

// Raw and control matches count even when a food keyword named the reason.
fn signal_rank(decision: &ClassificationDecision) -> u8 {
    let strong = decision.signals.iter().any(|label| {
        let group = label.split(':').next().unwrap_or(label).to_lowercase();
        group.contains("raw") || group.contains("control")
    });
    if strong { 0 } else { 1 }
}

fn aggregate(
    tier: Tier,
    listing: &Listing,
    decisions: &[ClassificationDecision],
    admission: &Admission,
    results: &[CountResult],
) -> StudyOutcome {
    let tally = |disposition: Disposition| {
        decisions
            .iter()
            .filter(|decision| decision.disposition == disposition)
            .count()
    };
    let unsupported = tally(Disposition::SkipUnsupportedDisabled);

    let mut files = admission
        .admitted
        .iter()
        .zip(results)
        .map(|(decision, result)| FileRecord::from_count(decision, result))
        .collect::<Vec<_>>();
    files.extend(admission.excluded.iter().map(FileRecord::budget_excluded));

    let total: u64 = results
        .iter()
        .filter_map(CountResult::successful_count)
        .sum();
    let failed = results
        .iter()
        .filter(|result| result.successful_count().is_none())
        .count();

    let source = if !admission.admitted.is_empty() {
        Ms2CountSource::HeuristicFiltered(tier)
    } else if !admission.excluded.is_empty() {
        Ms2CountSource::AllBudgetExcluded(tier)
    } else if unsupported > 0 {
        Ms2CountSource::AllSkippedConversionDisabled(tier)
    } else {
        Ms2CountSource::NoProcessableFiles(tier)
    };

    StudyOutcome {
        selected_files_for_ms2_analysis: files,
        total_ms2_spectra_from_selected_files: total,
        unsupported_files_skipped_count: unsupported,
        ms2_count_source_type: source,
        files_listed_count: listing.entries.len(),
        qc_files_skipped_count: tally(Disposition::SkipQc),
        irrelevant_files_skipped_count: tally(Disposition::SkipIrrelevant),
        budget_excluded_files_count: admission.excluded.len(),
        failed_files_count: failed,
        listing_warnings: listing.warnings.clone(),
        processing_error_message: None,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::domain::RemoteFileEntry;

    fn selected(name: &str, signals: &[&str]) -> ClassificationDecision {
        ClassificationDecision {
            entry: RemoteFileEntry::new(name, None),
            disposition: Disposition::Select,
            reason: "maybe_positive_indicator (food_keyword:oryza)".to_string(),
            signals: signals.iter().map(|label| label.to_string()).collect(),
        }
    }

    #[test]
    fn budget_never_over_admits_under_contention() {
        let budget = Arc::new(AdmissionBudget::new(5));
        let admitted = Arc::new(AtomicUsize::new(0));
        thread::scope(|scope| {
            for _ in 0..16 {
                let budget = Arc::clone(&budget);
                let admitted = Arc::clone(&admitted);
                scope.spawn(move || {
                    for _ in 0..10 {
                        if budget.try_admit() {
                            admitted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                });
            }
        });
        assert_eq!(admitted.load(Ordering::SeqCst), 5);
        assert_eq!(budget.remaining(), 0);
    }

    #[test]
    fn zero_cap_admits_nothing() {
        let budget = AdmissionBudget::new(0);
        assert!(!budget.try_admit());
    }

    #[test]
    fn signal_rank_looks_past_the_reported_reason() {
        let raw = selected("oryza_raw_01.mzML", &["food_keyword:oryza", "raw_signal:raw"]);
        let control = selected("oryza_wt_01.mzML", &["food_keyword:oryza", "control_signal:wt"]);
        let plain = selected("oryza_grain_01.mzML", &["food_keyword:oryza", "edible_part:grain"]);
        let berry = selected("strawberry_01.mzML", &["food_keyword:strawberry"]);
        assert_eq!(signal_rank(&raw), 0);
        assert_eq!(signal_rank(&control), 0);
        assert_eq!(signal_rank(&plain), 1);
        assert_eq!(signal_rank(&berry), 1);
    }
}
