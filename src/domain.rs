use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::FilterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Tier {
    Accepted,
    Maybe,
    Rejected,
}

impl Tier {
    pub fn as_lower(&self) -> &'static str {
        match self {
            Tier::Accepted => "accepted",
            Tier::Maybe => "maybe",
            Tier::Rejected => "rejected",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Accepted => write!(f, "ACCEPTED"),
            Tier::Maybe => write!(f, "MAYBE"),
            Tier::Rejected => write!(f, "REJECTED"),
        }
    }
}

impl FromStr for Tier {
    type Err = FilterError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "ACCEPTED" => Ok(Tier::Accepted),
            "MAYBE" => Ok(Tier::Maybe),
            "REJECTED" => Ok(Tier::Rejected),
            _ => Err(FilterError::InvalidTier(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SpectralFormat {
    #[value(name = "mzml")]
    MzMl,
    #[value(name = "mzxml")]
    MzXml,
    Mgf,
    Cdf,
    Raw,
    Wiff,
    #[value(name = "d")]
    #[serde(rename = "d")]
    BrukerD,
}

impl SpectralFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "mzml" => Some(SpectralFormat::MzMl),
            "mzxml" => Some(SpectralFormat::MzXml),
            "mgf" => Some(SpectralFormat::Mgf),
            "cdf" => Some(SpectralFormat::Cdf),
            "raw" => Some(SpectralFormat::Raw),
            "wiff" => Some(SpectralFormat::Wiff),
            "d" => Some(SpectralFormat::BrukerD),
            _ => None,
        }
    }

    pub fn is_proprietary(&self) -> bool {
        matches!(
            self,
            SpectralFormat::Raw | SpectralFormat::Wiff | SpectralFormat::BrukerD
        )
    }

    pub fn extension(&self) -> &'static str {
        match self {
            SpectralFormat::MzMl => "mzml",
            SpectralFormat::MzXml => "mzxml",
            SpectralFormat::Mgf => "mgf",
            SpectralFormat::Cdf => "cdf",
            SpectralFormat::Raw => "raw",
            SpectralFormat::Wiff => "wiff",
            SpectralFormat::BrukerD => "d",
        }
    }
}

impl fmt::Display for SpectralFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ".{}", self.extension())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InferredFormat {
    pub format: Option<SpectralFormat>,
    pub gzipped: bool,
}

impl InferredFormat {
    pub fn from_filename(filename: &str) -> Self {
        let lower = filename.to_ascii_lowercase();
        let (stem, gzipped) = match lower.strip_suffix(".gz") {
            Some(stem) => (stem, true),
            None => (lower.as_str(), false),
        };
        let format = stem
            .rsplit_once('.')
            .and_then(|(_, ext)| SpectralFormat::from_extension(ext))
            .filter(|format| !(gzipped && format.is_proprietary()));
        Self { format, gzipped }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteFileEntry {
    pub path: String,
    pub size: Option<u64>,
    pub inferred: InferredFormat,
}

impl RemoteFileEntry {
    pub fn new(path: impl Into<String>, size: Option<u64>) -> Self {
        let path = path.into();
        let inferred = InferredFormat::from_filename(file_name(&path));
        Self {
            path,
            size,
            inferred,
        }
    }

    pub fn filename(&self) -> &str {
        file_name(&self.path)
    }

    pub fn format(&self) -> Option<SpectralFormat> {
        self.inferred.format
    }

    pub fn extension_lower(&self) -> String {
        let name = self.filename().to_ascii_lowercase();
        let stem = name.strip_suffix(".gz").unwrap_or(&name);
        let ext = stem
            .rsplit_once('.')
            .map(|(_, ext)| format!(".{ext}"))
            .unwrap_or_default();
        if self.inferred.gzipped {
            format!("{ext}.gz")
        } else {
            ext
        }
    }
}

fn file_name(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Ftp,
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Ftp => "ftp",
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLocation {
    scheme: Scheme,
    host: String,
    base_path: String,
}

impl RemoteLocation {
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    pub fn file_url(&self, relative: &str) -> String {
        format!(
            "{}://{}{}{}",
            self.scheme.as_str(),
            self.host,
            self.base_path,
            relative.trim_start_matches('/')
        )
    }

    pub fn relative_path<'a>(&self, absolute: &'a str) -> &'a str {
        let trimmed_base = self.base_path.trim_end_matches('/');
        absolute
            .strip_prefix(&self.base_path)
            .or_else(|| absolute.strip_prefix(trimmed_base))
            .unwrap_or(absolute)
            .trim_start_matches('/')
    }
}

impl fmt::Display for RemoteLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.scheme.as_str(), self.host, self.base_path)
    }
}

impl FromStr for RemoteLocation {
    type Err = FilterError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let (scheme, rest) = trimmed
            .split_once("://")
            .ok_or_else(|| FilterError::InvalidRemoteLocation(value.to_string()))?;
        let scheme = match scheme.to_ascii_lowercase().as_str() {
            "ftp" => Scheme::Ftp,
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            _ => return Err(FilterError::InvalidRemoteLocation(value.to_string())),
        };
        let (host, path) = match rest.split_once('/') {
            Some((host, path)) => (host, path),
            None => (rest, ""),
        };
        if host.is_empty() {
            return Err(FilterError::InvalidRemoteLocation(value.to_string()));
        }
        let mut base_path = format!("/{}", path.trim_matches('/'));
        if !base_path.ends_with('/') {
            base_path.push('/');
        }
        Ok(Self {
            scheme,
            host: host.to_string(),
            base_path,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FoodItemKey(String);

impl FoodItemKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn keywords(&self) -> Vec<String> {
        if self.0.is_empty() {
            return Vec::new();
        }
        let mut keywords = self
            .0
            .split('_')
            .filter(|part| part.len() > 2)
            .map(|part| part.to_ascii_lowercase())
            .collect::<Vec<_>>();
        keywords.push(self.0.to_ascii_lowercase());
        keywords.sort();
        keywords.dedup();
        keywords
    }
}

impl fmt::Display for FoodItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
