use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::FilterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Polarity {
    Positive,
    Supporting,
    Negative,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub pattern: String,
    pub polarity: Polarity,
    pub label: String,
    #[serde(default)]
    pub whole_word: bool,
}

impl Rule {
    pub fn new(
        pattern: impl Into<String>,
        polarity: Polarity,
        label: impl Into<String>,
        whole_word: bool,
    ) -> Self {
        Self {
            pattern: pattern.into(),
            polarity,
            label: label.into(),
            whole_word,
        }
    }

    /// `+term` is positive, `~term` supporting, `-term` or a bare term
    /// negative. Terms of four characters or fewer match as whole words.
    pub fn from_shorthand(value: &str) -> Self {
        let value = value.trim();
        let (polarity, term) = if let Some(term) = value.strip_prefix('+') {
            (Polarity::Positive, term)
        } else if let Some(term) = value.strip_prefix('~') {
            (Polarity::Supporting, term)
        } else if let Some(term) = value.strip_prefix('-') {
            (Polarity::Negative, term)
        } else {
            (Polarity::Negative, value)
        };
        Self::new(term, polarity, term, term.len() <= 4)
    }

    fn compile(&self) -> Result<Regex, FilterError> {
        let source = if self.whole_word {
            format!("(?i)(?:^|[^a-z])(?:{})(?:[^a-z]|$)", self.pattern)
        } else {
            format!("(?i){}", self.pattern)
        };
        Regex::new(&source).map_err(|err| FilterError::InvalidRule {
            pattern: self.pattern.clone(),
            message: err.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
struct CompiledRule {
    regex: Regex,
    polarity: Polarity,
    label: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleMatch {
    pub positive: Option<String>,
    pub supporting: Option<String>,
    pub negative: Option<String>,
    pub signals: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    pub fn compile(rules: &[Rule]) -> Result<Self, FilterError> {
        let rules = rules
            .iter()
            .map(|rule| {
                Ok(CompiledRule {
                    regex: rule.compile()?,
                    polarity: rule.polarity,
                    label: rule.label.clone(),
                })
            })
            .collect::<Result<Vec<_>, FilterError>>()?;
        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn prepend(&self, other: &RuleSet) -> RuleSet {
        let mut rules = other.rules.clone();
        rules.extend(self.rules.iter().cloned());
        RuleSet { rules }
    }

    pub fn first_match(&self, text: &str, polarity: Polarity) -> Option<&str> {
        let lower = text.to_lowercase();
        self.rules
            .iter()
            .filter(|rule| rule.polarity == polarity)
            .find(|rule| rule.regex.is_match(&lower))
            .map(|rule| rule.label.as_str())
    }

    pub fn evaluate(&self, text: &str) -> RuleMatch {
        let lower = text.to_lowercase();
        let mut matched = RuleMatch::default();
        for rule in self.rules.iter().filter(|rule| rule.regex.is_match(&lower)) {
            let slot = match rule.polarity {
                Polarity::Positive => &mut matched.positive,
                Polarity::Supporting => &mut matched.supporting,
                Polarity::Negative => &mut matched.negative,
            };
            if slot.is_none() {
                *slot = Some(rule.label.clone());
            }
            if rule.polarity != Polarity::Negative {
                matched.signals.push(rule.label.clone());
            }
        }
        matched
    }
}

pub fn food_keyword_rules(keywords: &[String]) -> Vec<Rule> {
    keywords
        .iter()
        .map(|keyword| {
            Rule::new(
                regex::escape(keyword),
                Polarity::Positive,
                format!("food_keyword:{keyword}"),
                true,
            )
        })
        .collect()
}

const QC_TERMS: &[&str] = &[
    "qc",
    "quality_control",
    "qa",
    "system_suitability",
    "sst",
    "blank",
    "solvent_blank",
    "method_blank",
    "instrument_blank",
    "reagent_blank",
    "wash",
    "equilibration",
    "conditioning",
    "gradient_test",
    "standard",
    "std",
    "ref_mat",
    "reference_material",
    "calib",
    "tune",
    "mass_cal",
    "msms_check",
    "tryptic_digest_std",
];

const RAW_TERMS: &[&str] = &[
    "raw",
    "unprocessed",
    "fresh",
    "uncooked",
    "natural",
    "crude",
    "whole",
];

const CONTROL_TERMS: &[&str] = &[
    "control",
    "ctrl",
    "cntrl",
    "ctl",
    "uninfected",
    "untreated",
    "baseline",
    "wild_type",
    "wt",
    "wildtype",
    "parental",
    "initial",
    "input",
    "t0",
    "time0",
    "day0",
    "0h",
    "0hr",
    "zerohr",
    "0_hr",
    "before_processing",
    "pre-processing",
    "before-processing",
    "mock",
];

const EDIBLE_PART_TERMS: &[&str] = &[
    "grain",
    "kernel",
    "seed",
    "berry",
    "endosperm",
    "embryo",
    "germ",
    "cereal",
    "fruit",
    "pulp",
    "flesh",
    "peel",
    "skin",
    "vegetable",
    "leafy_green",
    "tuber_veg",
    "edible_part",
    "sample",
];

const PROCESSED_TERMS: &[&str] = &[
    "beer",
    "ale",
    "lager",
    "brew",
    "wort",
    "malt",
    "ferment",
    "sourdough",
    "bread",
    "pasta",
    "noodle",
    "cake",
    "biscuit",
    "cookie",
    "pastry",
    "syrup",
    "starch",
    "ethanol",
    "biofuel",
    "distillate",
    "mash",
    "slurry",
    "cook",
    "bake",
    "baked",
    "fried",
    "toast",
    "roast",
    "steam",
    "boil",
    "autoclave",
    "extract",
    "digest",
    "hydroly[sz](?:ate|ed)",
    "supernatant",
    "pellet",
    "flour",
    "meal",
    "grit",
    "semolina",
    "paste",
    "puree",
    "juice",
    "smoothie",
    "extrude",
    "puff",
    "flake",
    "instant",
    "processed",
];

const NON_EDIBLE_TERMS: &[&str] = &[
    "leaf",
    "leaves",
    "foliage",
    "stem",
    "stalk",
    "shoot",
    "stover",
    "culm",
    "root",
    "rhizome",
    "seedling",
    "sprout",
    "husk",
    "hull",
    "bran",
    "chaff",
    "glume",
    "lemma",
    "palea",
    "tassel",
    "silk",
    "anther",
    "pollen",
    "flower",
    "callus",
    "cell_culture",
    "suspension_culture",
    "plant_tissue",
];

const TREATMENT_TERMS: &[&str] = &[
    "infect",
    "pathogen",
    "disease",
    "lesion",
    "symptom",
    "fungi",
    "bacteria",
    "virus",
    "oomycete",
    "nematode",
    "treat",
    "stress",
    "elicitor",
    "induc",
    "pesticide",
    "herbicide",
    "fungicide",
    "insecticide",
    "fertilizer",
    "mutant",
    "transgenic",
    "gmo",
    "knockout",
    "overexpress",
];

// Matched as word prefixes so that `untreated` and `unprocessed` stay clear.
const WORD_PREFIX_TERMS: &[&str] = &["treat", "infect", "processed"];

fn group(terms: &[&str], polarity: Polarity, prefix: &str) -> Vec<Rule> {
    terms
        .iter()
        .map(|term| {
            let label = format!("{prefix}:{term}");
            if WORD_PREFIX_TERMS.contains(term) {
                Rule::new(format!("{term}[a-z]*"), polarity, label, true)
            } else {
                Rule::new(*term, polarity, label, term.len() <= 4)
            }
        })
        .collect()
}

pub fn default_qc_rules() -> Vec<Rule> {
    QC_TERMS
        .iter()
        .map(|term| Rule::new(*term, Polarity::Negative, format!("qc_marker:{term}"), false))
        .collect()
}

/// Positive rules are listed strongest first so the reported reason names
/// the best signal. Edible parts only support another positive match.
pub fn default_maybe_rules() -> Vec<Rule> {
    let mut rules = Vec::new();
    rules.extend(group(RAW_TERMS, Polarity::Positive, "raw_signal"));
    rules.extend(group(CONTROL_TERMS, Polarity::Positive, "control_signal"));
    rules.extend(group(EDIBLE_PART_TERMS, Polarity::Supporting, "edible_part"));
    rules.extend(group(PROCESSED_TERMS, Polarity::Negative, "processed_marker"));
    rules.extend(group(NON_EDIBLE_TERMS, Polarity::Negative, "non_edible_part"));
    rules.extend(group(TREATMENT_TERMS, Polarity::Negative, "treatment_marker"));
    rules
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn whole_word_uses_non_letter_separators() {
        let set = RuleSet::compile(&[Rule::new("raw", Polarity::Positive, "raw", true)]).unwrap();
        assert_eq!(set.first_match("oryza_raw_01.mzxml", Polarity::Positive), Some("raw"));
        assert_eq!(set.first_match("RAW01.mzML", Polarity::Positive), Some("raw"));
        assert_eq!(set.first_match("drawing.mzml", Polarity::Positive), None);
    }

    #[test]
    fn evaluate_reports_first_of_each_polarity() {
        let set = RuleSet::compile(&default_maybe_rules()).unwrap();
        let matched = set.evaluate("wt_seed_infected.mzML");
        assert_eq!(matched.positive.as_deref(), Some("control_signal:wt"));
        assert_eq!(matched.negative.as_deref(), Some("treatment_marker:infect"));
    }

    #[test]
    fn untreated_controls_are_not_treatment_markers() {
        let set = RuleSet::compile(&default_maybe_rules()).unwrap();
        let matched = set.evaluate("untreated_grain_02.mzxml");
        assert_eq!(matched.positive.as_deref(), Some("control_signal:untreated"));
        assert_eq!(matched.negative, None);
    }

    #[test]
    fn qc_markers_match_inside_words() {
        let set = RuleSet::compile(&default_qc_rules()).unwrap();
        assert_eq!(set.first_match("QCpool_01.mzML", Polarity::Negative), Some("qc_marker:qc"));
        assert_eq!(set.first_match("PooledQC_03.mzML", Polarity::Negative), Some("qc_marker:qc"));
        assert_eq!(set.first_match("stdmix_01.mzML", Polarity::Negative), Some("qc_marker:std"));
        assert_eq!(set.first_match("oryza_grain_01.mzML", Polarity::Negative), None);
    }

    #[test]
    fn edible_parts_are_supporting_signals() {
        let set = RuleSet::compile(&default_maybe_rules()).unwrap();
        let matched = set.evaluate("sample_01.mzml");
        assert_eq!(matched.positive, None);
        assert_eq!(matched.supporting.as_deref(), Some("edible_part:sample"));
        assert_eq!(matched.signals, vec!["edible_part:sample".to_string()]);

        let matched = set.evaluate("control_grain_01.mzml");
        assert_eq!(matched.positive.as_deref(), Some("control_signal:control"));
        assert_eq!(
            matched.signals,
            vec!["control_signal:control".to_string(), "edible_part:grain".to_string()]
        );
    }

    #[test]
    fn default_signals_are_not_shadowed_by_negatives() {
        let rules = default_maybe_rules();
        let set = RuleSet::compile(&rules).unwrap();
        for rule in rules.iter().filter(|rule| rule.polarity != Polarity::Negative) {
            let name = format!("x_{}_01.mzml", rule.pattern);
            assert_eq!(set.evaluate(&name).negative, None, "{name}");
        }
    }

    #[test]
    fn shorthand_rules() {
        let positive = Rule::from_shorthand("+husk");
        assert_eq!(positive.polarity, Polarity::Positive);
        assert!(positive.whole_word);
        let negative = Rule::from_shorthand("spiked");
        assert_eq!(negative.polarity, Polarity::Negative);
        assert!(!negative.whole_word);
        let supporting = Rule::from_shorthand("~kernel");
        assert_eq!(supporting.polarity, Polarity::Supporting);
        assert_eq!(supporting.pattern, "kernel");
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let err = RuleSet::compile(&[Rule::new("(", Polarity::Negative, "bad", false)]).unwrap_err();
        assert_matches!(err, FilterError::InvalidRule { .. });
    }

    #[test]
    fn prepend_orders_rules_first() {
        let base = RuleSet::compile(&default_maybe_rules()).unwrap();
        let food = RuleSet::compile(&food_keyword_rules(&["oryza".to_string()])).unwrap();
        let combined = base.prepend(&food);
        assert_eq!(combined.len(), base.len() + 1);
        assert_eq!(
            combined.first_match("oryza_raw_01.mzxml", Polarity::Positive),
            Some("food_keyword:oryza")
        );
    }
}
