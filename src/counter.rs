use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::time::Instant;

use flate2::read::MultiGzDecoder;
use regex::bytes::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::convert::{ConversionGate, ExternalConverter};
use crate::domain::{RemoteFileEntry, SpectralFormat};
use crate::error::FilterError;
use crate::remote::ContentSource;

const CHUNK_SIZE: usize = 64 * 1024;

pub trait SpectralFormatHandler: Send + Sync {
    fn format(&self) -> SpectralFormat;

    /// Counts MS2 records in `stream`. On a read error or truncated input the
    /// error carries the tally reached so far.
    fn count(&self, stream: &mut dyn Read) -> Result<u64, FilterError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Completion {
    Unchecked,
    RootClosed,
    BlocksClosed,
}

#[derive(Debug, Clone)]
pub struct MarkerScanHandler {
    format: SpectralFormat,
    marker: Regex,
    terminator: Option<Regex>,
    overlap: usize,
    completion: Completion,
}

impl MarkerScanHandler {
    fn build(
        format: SpectralFormat,
        markers: &[&str],
        terminators: &[&str],
        completion: Completion,
    ) -> Result<Self, FilterError> {
        let overlap = markers
            .iter()
            .chain(terminators)
            .map(|marker| marker.len())
            .max()
            .unwrap_or(1)
            .saturating_sub(1);
        Ok(Self {
            format,
            marker: literal_alternation(markers)?,
            terminator: if terminators.is_empty() {
                None
            } else {
                Some(literal_alternation(terminators)?)
            },
            overlap,
            completion,
        })
    }

    pub fn mzml() -> Result<Self, FilterError> {
        Self::build(
            SpectralFormat::MzMl,
            &[r#"accession="MS:1000580""#, "accession='MS:1000580'"],
            &["</mzML>"],
            Completion::RootClosed,
        )
    }

    pub fn mzxml() -> Result<Self, FilterError> {
        Self::build(
            SpectralFormat::MzXml,
            &[r#"msLevel="2""#, "msLevel='2'"],
            &["</mzXML>"],
            Completion::RootClosed,
        )
    }

    pub fn mgf() -> Result<Self, FilterError> {
        Self::build(
            SpectralFormat::Mgf,
            &["BEGIN IONS"],
            &["END IONS"],
            Completion::BlocksClosed,
        )
    }

    pub fn cdf() -> Result<Self, FilterError> {
        Self::build(
            SpectralFormat::Cdf,
            &["scan_type=MSMS", "msLevel=2"],
            &[],
            Completion::Unchecked,
        )
    }

    pub fn for_format(format: SpectralFormat) -> Result<Self, FilterError> {
        match format {
            SpectralFormat::MzMl => Self::mzml(),
            SpectralFormat::MzXml => Self::mzxml(),
            SpectralFormat::Mgf => Self::mgf(),
            SpectralFormat::Cdf => Self::cdf(),
            other => Err(FilterError::UnsupportedFormat(format!(
                "{other} has no text representation"
            ))),
        }
    }
}

impl SpectralFormatHandler for MarkerScanHandler {
    fn format(&self) -> SpectralFormat {
        self.format
    }

    fn count(&self, stream: &mut dyn Read) -> Result<u64, FilterError> {
        let mut window: Vec<u8> = Vec::with_capacity(CHUNK_SIZE + self.overlap);
        let mut chunk = vec![0u8; CHUNK_SIZE];
        let mut markers = 0u64;
        let mut terminators = 0u64;
        let mut carried = 0usize;

        loop {
            let n = match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    return Err(FilterError::StreamRead {
                        partial: markers,
                        message: err.to_string(),
                    });
                }
            };
            window.extend_from_slice(&chunk[..n]);

            // Matches ending inside the carried-over bytes were counted in
            // the previous window.
            markers += count_past(&self.marker, &window, carried);
            if let Some(terminator) = &self.terminator {
                terminators += count_past(terminator, &window, carried);
            }

            let keep = self.overlap.min(window.len());
            window.drain(..window.len() - keep);
            carried = keep;
        }

        let complete = match self.completion {
            Completion::Unchecked => true,
            Completion::RootClosed => terminators > 0,
            Completion::BlocksClosed => terminators >= markers,
        };
        if !complete {
            return Err(FilterError::StreamRead {
                partial: markers,
                message: format!("{} stream ended mid-record", self.format),
            });
        }
        Ok(markers)
    }
}

fn literal_alternation(literals: &[&str]) -> Result<Regex, FilterError> {
    let source = literals
        .iter()
        .map(|literal| regex::escape(literal))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&source).map_err(|err| FilterError::InvalidRule {
        pattern: source.clone(),
        message: err.to_string(),
    })
}

fn count_past(regex: &Regex, window: &[u8], carried: usize) -> u64 {
    regex
        .find_iter(window)
        .filter(|found| found.end() > carried)
        .count() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CountStrategy {
    DirectScan,
    ConvertedScan,
    SkippedDisabled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CountStatus {
    Counted {
        ms2_spectra: u64,
    },
    Failed {
        error_kind: String,
        partial_ms2_spectra: u64,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountResult {
    pub path: String,
    pub strategy: CountStrategy,
    #[serde(flatten)]
    pub status: CountStatus,
}

impl CountResult {
    pub fn counted(path: &str, strategy: CountStrategy, ms2_spectra: u64) -> Self {
        Self {
            path: path.to_string(),
            strategy,
            status: CountStatus::Counted { ms2_spectra },
        }
    }

    pub fn failed(path: &str, strategy: CountStrategy, error: &FilterError) -> Self {
        Self {
            path: path.to_string(),
            strategy,
            status: CountStatus::Failed {
                error_kind: error.kind().to_string(),
                partial_ms2_spectra: error.partial_count(),
                message: error.to_string(),
            },
        }
    }

    pub fn successful_count(&self) -> Option<u64> {
        match self.status {
            CountStatus::Counted { ms2_spectra } => Some(ms2_spectra),
            CountStatus::Failed { .. } => None,
        }
    }
}

pub struct SpectralCounter<S: ContentSource, C: ExternalConverter> {
    source: S,
    converter: C,
    gate: ConversionGate,
    conversion_enabled: bool,
    mzml: MarkerScanHandler,
    mzxml: MarkerScanHandler,
    mgf: MarkerScanHandler,
    cdf: MarkerScanHandler,
}

impl<S: ContentSource, C: ExternalConverter> SpectralCounter<S, C> {
    pub fn new(
        source: S,
        converter: C,
        gate: ConversionGate,
        conversion_enabled: bool,
    ) -> Result<Self, FilterError> {
        Ok(Self {
            source,
            converter,
            gate,
            conversion_enabled,
            mzml: MarkerScanHandler::mzml()?,
            mzxml: MarkerScanHandler::mzxml()?,
            mgf: MarkerScanHandler::mgf()?,
            cdf: MarkerScanHandler::cdf()?,
        })
    }

    pub fn text_handler(&self, format: SpectralFormat) -> Option<&dyn SpectralFormatHandler> {
        match format {
            SpectralFormat::MzMl => Some(&self.mzml),
            SpectralFormat::MzXml => Some(&self.mzxml),
            SpectralFormat::Mgf => Some(&self.mgf),
            SpectralFormat::Cdf => Some(&self.cdf),
            SpectralFormat::Raw | SpectralFormat::Wiff | SpectralFormat::BrukerD => None,
        }
    }

    /// Counts one file fetched from `url`. Never fails: errors become a
    /// failure marker on the result.
    pub fn count(&self, entry: &RemoteFileEntry, url: &str) -> CountResult {
        let start = Instant::now();
        let Some(format) = entry.format() else {
            let err = FilterError::UnsupportedFormat(entry.filename().to_string());
            warn!(file = %entry.path, "no counting logic for extension");
            return CountResult::failed(&entry.path, CountStrategy::DirectScan, &err);
        };

        let (strategy, outcome) = if format.is_proprietary() {
            if !self.conversion_enabled {
                let err = FilterError::Conversion(format!(
                    "{format} requires conversion and conversion is disabled"
                ));
                return CountResult::failed(&entry.path, CountStrategy::SkippedDisabled, &err);
            }
            (CountStrategy::ConvertedScan, self.count_converted(entry, url))
        } else {
            (CountStrategy::DirectScan, self.count_direct(entry, format, url))
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match outcome {
            Ok(count) => {
                info!(file = %entry.path, count, elapsed_ms, "counted MS2 spectra");
                CountResult::counted(&entry.path, strategy, count)
            }
            Err(err) => {
                warn!(file = %entry.path, partial = err.partial_count(), error = %err, "MS2 count failed");
                CountResult::failed(&entry.path, strategy, &err)
            }
        }
    }

    fn count_direct(
        &self,
        entry: &RemoteFileEntry,
        format: SpectralFormat,
        url: &str,
    ) -> Result<u64, FilterError> {
        let handler = self
            .text_handler(format)
            .ok_or_else(|| FilterError::UnsupportedFormat(format.to_string()))?;
        debug!(file = %entry.path, %format, gzipped = entry.inferred.gzipped, "streaming scan");
        let stream = self.source.open(url)?;
        if entry.inferred.gzipped {
            let mut decoder = MultiGzDecoder::new(stream);
            handler.count(&mut decoder)
        } else {
            let mut stream = stream;
            handler.count(&mut stream)
        }
    }

    fn count_converted(&self, entry: &RemoteFileEntry, url: &str) -> Result<u64, FilterError> {
        if !self.converter.is_available() {
            return Err(FilterError::Conversion(
                "external converter unavailable".to_string(),
            ));
        }
        let workdir = tempfile::Builder::new()
            .prefix("ms2-filter-convert")
            .tempdir()
            .map_err(|err| FilterError::Filesystem(err.to_string()))?;
        let local = workdir.path().join(entry.filename());
        self.source.download(url, &local)?;

        let converted = {
            let _permit = self.gate.acquire();
            self.converter.convert_to_mzml(&local, workdir.path())?
        };
        self.count_local(&converted)
    }

    fn count_local(&self, path: &Path) -> Result<u64, FilterError> {
        let mut file = File::open(path).map_err(|err| {
            FilterError::Conversion(format!("converted file {} missing: {err}", path.display()))
        })?;
        self.mzml.count(&mut file)
    }
}
