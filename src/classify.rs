use serde::Serialize;

use crate::domain::{FoodItemKey, RemoteFileEntry, Tier};
use crate::error::FilterError;
use crate::rules::{Polarity, RuleSet, food_keyword_rules};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Disposition {
    Select,
    SkipQc,
    SkipUnsupportedDisabled,
    SkipIrrelevant,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Select => "select",
            Disposition::SkipQc => "skip-qc",
            Disposition::SkipUnsupportedDisabled => "skip-unsupported-disabled",
            Disposition::SkipIrrelevant => "skip-irrelevant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassificationDecision {
    pub entry: RemoteFileEntry,
    pub disposition: Disposition,
    pub reason: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub signals: Vec<String>,
}

impl ClassificationDecision {
    fn new(entry: &RemoteFileEntry, disposition: Disposition, reason: impl Into<String>) -> Self {
        Self {
            entry: entry.clone(),
            disposition,
            reason: reason.into(),
            signals: Vec::new(),
        }
    }

    fn with_signals(mut self, signals: Vec<String>) -> Self {
        self.signals = signals;
        self
    }

    pub fn is_selected(&self) -> bool {
        self.disposition == Disposition::Select
    }
}

#[derive(Debug, Clone)]
pub struct Classifier {
    qc_rules: RuleSet,
    maybe_rules: RuleSet,
    conversion_enabled: bool,
}

impl Classifier {
    pub fn new(
        qc_rules: &RuleSet,
        maybe_rules: &RuleSet,
        food_item: Option<&FoodItemKey>,
        conversion_enabled: bool,
    ) -> Result<Self, FilterError> {
        let keywords = food_item.map(FoodItemKey::keywords).unwrap_or_default();
        let food_rules = RuleSet::compile(&food_keyword_rules(&keywords))?;
        Ok(Self {
            qc_rules: qc_rules.clone(),
            maybe_rules: maybe_rules.prepend(&food_rules),
            conversion_enabled,
        })
    }

    pub fn classify(&self, tier: Tier, entry: &RemoteFileEntry) -> ClassificationDecision {
        let Some(format) = entry.format() else {
            return ClassificationDecision::new(
                entry,
                Disposition::SkipIrrelevant,
                "not_a_spectral_file",
            );
        };

        let decision = match tier {
            Tier::Accepted => self.classify_accepted(entry),
            Tier::Maybe => self.classify_maybe(entry),
            Tier::Rejected => {
                ClassificationDecision::new(entry, Disposition::SkipIrrelevant, "rejected_study")
            }
        };

        if decision.is_selected() && format.is_proprietary() && !self.conversion_enabled {
            return ClassificationDecision::new(
                entry,
                Disposition::SkipUnsupportedDisabled,
                format!("{} ({format} requires conversion, disabled)", decision.reason),
            )
            .with_signals(decision.signals);
        }
        decision
    }

    pub fn classify_all(
        &self,
        tier: Tier,
        entries: &[RemoteFileEntry],
    ) -> Vec<ClassificationDecision> {
        entries
            .iter()
            .map(|entry| self.classify(tier, entry))
            .collect()
    }

    fn classify_accepted(&self, entry: &RemoteFileEntry) -> ClassificationDecision {
        match self.qc_rules.first_match(&entry.path, Polarity::Negative) {
            Some(label) => ClassificationDecision::new(
                entry,
                Disposition::SkipQc,
                format!("qc_or_blank_file ({label})"),
            ),
            None => ClassificationDecision::new(
                entry,
                Disposition::Select,
                "accepted_study_non_qc_file",
            ),
        }
    }

    // Negative indicators win. Supporting matches never select on their own.
    fn classify_maybe(&self, entry: &RemoteFileEntry) -> ClassificationDecision {
        if let Some(label) = self.qc_rules.first_match(&entry.path, Polarity::Negative) {
            return ClassificationDecision::new(
                entry,
                Disposition::SkipIrrelevant,
                format!("maybe_negative_indicator ({label})"),
            );
        }

        let matched = self.maybe_rules.evaluate(&entry.path);
        let decision = match (matched.positive, matched.supporting, matched.negative) {
            (_, _, Some(negative)) => ClassificationDecision::new(
                entry,
                Disposition::SkipIrrelevant,
                format!("maybe_negative_indicator ({negative})"),
            ),
            (Some(positive), Some(supporting), None) => ClassificationDecision::new(
                entry,
                Disposition::Select,
                format!("maybe_positive_indicator ({positive}, {supporting})"),
            ),
            (Some(positive), None, None) => ClassificationDecision::new(
                entry,
                Disposition::Select,
                format!("maybe_positive_indicator ({positive})"),
            ),
            (None, _, None) => ClassificationDecision::new(
                entry,
                Disposition::SkipIrrelevant,
                "maybe_lacks_positive_indicator",
            ),
        };
        decision.with_signals(matched.signals)
    }
}
