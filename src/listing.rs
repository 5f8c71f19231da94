use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::domain::{RemoteFileEntry, RemoteLocation};
use crate::error::FilterError;
use crate::tool::{self, ToolRunError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Listing {
    pub entries: Vec<RemoteFileEntry>,
    pub warnings: Vec<String>,
}

pub trait ListingClient: Send + Sync {
    fn list(&self, base: &RemoteLocation) -> Result<Listing, FilterError>;
}

#[derive(Debug, Clone)]
pub struct LftpListingClient {
    lftp: Option<PathBuf>,
    timeout: Duration,
}

impl LftpListingClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            lftp: tool::find_in_path("lftp"),
            timeout,
        }
    }

    pub fn with_program(lftp: PathBuf, timeout: Duration) -> Self {
        Self {
            lftp: Some(lftp),
            timeout,
        }
    }

    pub fn is_available(&self) -> bool {
        self.lftp.is_some()
    }

    fn command_args(&self, base: &RemoteLocation) -> Vec<String> {
        let net_timeout = self.timeout.as_secs().clamp(10, 120);
        let script = format!(
            "set ftp:ssl-allow no; set net:timeout {net_timeout}; set net:max-retries 2; find -l '{}'; bye",
            base.base_path().replace('\'', "'\\''")
        );
        vec![
            "-e".to_string(),
            script,
            format!("{}://{}", base.scheme().as_str(), base.host()),
        ]
    }
}

impl ListingClient for LftpListingClient {
    fn list(&self, base: &RemoteLocation) -> Result<Listing, FilterError> {
        let lftp = self
            .lftp
            .as_ref()
            .ok_or_else(|| FilterError::RemoteUnavailable("lftp not found in PATH".to_string()))?;

        let output = tool::run_with_timeout(lftp, &self.command_args(base), self.timeout)
            .map_err(|err| match err {
                ToolRunError::TimedOut(_) => {
                    FilterError::RemoteUnavailable(format!("listing {base} {err}"))
                }
                ToolRunError::Spawn(_) => FilterError::RemoteUnavailable(err.to_string()),
            })?;

        let entries = parse_find_output(&output.stdout, base);
        let warnings = output
            .stderr
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>();

        if !output.success() && entries.is_empty() {
            return Err(FilterError::RemoteUnavailable(
                output.stderr_or(format!("lftp find failed for {base}")),
            ));
        }

        Ok(Listing { entries, warnings })
    }
}

/// Parses `find -l` lines into entries relative to `base`. Bruker `.d`
/// acquisitions are directories and are reported once, without their
/// contents; other directory lines are dropped.
pub fn parse_find_output(stdout: &str, base: &RemoteLocation) -> Vec<RemoteFileEntry> {
    let anchor = base.base_path().trim_end_matches('/');
    let mut entries = Vec::new();
    let mut bundles: Vec<String> = Vec::new();
    for line in stdout.lines().map(str::trim_end).filter(|line| !line.is_empty()) {
        let (columns, path) = match line.find(anchor).filter(|_| !anchor.is_empty()) {
            Some(idx) => (&line[..idx], &line[idx..]),
            None => match line.find('/') {
                Some(idx) => (&line[..idx], &line[idx..]),
                None => continue,
            },
        };
        let is_dir = path.ends_with('/') || columns.trim_start().starts_with('d');
        let relative = base.relative_path(path.trim_end_matches('/'));
        if relative.is_empty() {
            continue;
        }
        if let Some(bundle) = bundle_root(relative, is_dir) {
            if !bundles.iter().any(|known| known == bundle) {
                bundles.push(bundle.to_string());
                entries.push(RemoteFileEntry::new(bundle, None));
            }
            continue;
        }
        if !is_dir {
            entries.push(RemoteFileEntry::new(relative, listed_size(columns)));
        }
    }
    entries
}

fn bundle_root(relative: &str, is_dir: bool) -> Option<&str> {
    let mut start = 0;
    for (idx, _) in relative.match_indices('/') {
        if is_bundle(&relative[start..idx]) {
            return Some(&relative[..idx]);
        }
        start = idx + 1;
    }
    (is_dir && is_bundle(&relative[start..])).then_some(relative)
}

fn is_bundle(segment: &str) -> bool {
    segment.len() > 2 && segment.to_ascii_lowercase().ends_with(".d")
}

// The size is the column right before the date (`2017-03-02` or `Mar  2 2017`).
fn listed_size(columns: &str) -> Option<u64> {
    let columns = columns.split_whitespace().collect::<Vec<_>>();
    match columns.iter().position(|column| is_date_start(column)) {
        Some(idx) => idx
            .checked_sub(1)
            .and_then(|prev| columns[prev].parse().ok()),
        None => columns.iter().rev().find_map(|column| column.parse().ok()),
    }
}

fn is_date_start(column: &str) -> bool {
    const MONTHS: [&str; 12] = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ];
    let bytes = column.as_bytes();
    let iso = bytes.len() == 10
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && bytes[..4].iter().all(u8::is_ascii_digit);
    iso || MONTHS.contains(&column.to_ascii_lowercase().as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SpectralFormat;

    #[test]
    fn parse_long_listing() {
        let base: RemoteLocation = "ftp://massive.ucsd.edu/v01/MSV000080000".parse().unwrap();
        let stdout = "\
drwxr-xr-x            -- /v01/MSV000080000/
drwxr-xr-x            -- /v01/MSV000080000/raw/
-rw-r--r--      1048576 2017-03-02 10:11 /v01/MSV000080000/raw/oryza 01.mzXML
-rw-r--r--          512 2017-03-02 10:11 /v01/MSV000080000/README.txt
";
        let entries = parse_find_output(stdout, &base);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, "raw/oryza 01.mzXML");
        assert_eq!(entries[0].size, Some(1048576));
        assert_eq!(entries[1].path, "README.txt");
        assert_eq!(entries[1].size, Some(512));
    }

    #[test]
    fn parse_plain_listing() {
        let base: RemoteLocation = "ftp://ftp.ebi.ac.uk/pub/MTBLS1".parse().unwrap();
        let stdout = "/pub/MTBLS1/\n/pub/MTBLS1/a/b/c/deep.mgf\n";
        let entries = parse_find_output(stdout, &base);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "a/b/c/deep.mgf");
        assert_eq!(entries[0].size, None);
    }

    #[test]
    fn size_is_the_column_before_the_date() {
        let base: RemoteLocation = "ftp://massive.ucsd.edu/v01/MSV000080000".parse().unwrap();
        let stdout = "\
-rw-r--r--   1 ftp      ftp           512 Mar  2  2017 /v01/MSV000080000/tiny.mgf
-rw-r--r--   1 ftp      ftp      73400320 Nov 14 09:30 /v01/MSV000080000/run 2.mzML
";
        let entries = parse_find_output(stdout, &base);
        assert_eq!(entries[0].path, "tiny.mgf");
        assert_eq!(entries[0].size, Some(512));
        assert_eq!(entries[1].path, "run 2.mzML");
        assert_eq!(entries[1].size, Some(73400320));
    }

    #[test]
    fn bruker_directories_become_single_entries() {
        let base: RemoteLocation = "ftp://massive.ucsd.edu/v01/MSV1".parse().unwrap();
        let stdout = "\
/v01/MSV1/
/v01/MSV1/s1.d/
/v01/MSV1/s1.d/analysis.tdf
/v01/MSV1/s1.d/analysis.tdf_bin
/v01/MSV1/raw/S2.D/analysis.baf
/v01/MSV1/s3.mzML
";
        let entries = parse_find_output(stdout, &base);
        let paths = entries.iter().map(|entry| entry.path.as_str()).collect::<Vec<_>>();
        assert_eq!(paths, vec!["s1.d", "raw/S2.D", "s3.mzML"]);
        assert_eq!(entries[0].format(), Some(SpectralFormat::BrukerD));
        assert_eq!(entries[1].format(), Some(SpectralFormat::BrukerD));
    }

    #[cfg(unix)]
    #[test]
    fn partial_lftp_listing_keeps_entries_and_warnings() {
        let temp = tempfile::tempdir().unwrap();
        let lftp = tool::testing::script(
            temp.path(),
            "lftp",
            "printf '%s\\n' '-rw-r--r--  2048 2020-01-01 00:00 /v01/MSV1/a.mzML'\n\
             echo 'find: Access failed: 550 /v01/MSV1/private' >&2\n\
             exit 1",
        );
        let client = LftpListingClient::with_program(lftp, Duration::from_secs(10));
        let base: RemoteLocation = "ftp://massive.ucsd.edu/v01/MSV1/".parse().unwrap();

        let listing = client.list(&base).unwrap();
        assert_eq!(listing.entries, vec![RemoteFileEntry::new("a.mzML", Some(2048))]);
        assert_eq!(
            listing.warnings,
            vec!["find: Access failed: 550 /v01/MSV1/private".to_string()]
        );
    }

    #[cfg(unix)]
    #[test]
    fn failed_lftp_without_entries_is_unavailable() {
        let temp = tempfile::tempdir().unwrap();
        let lftp = tool::testing::script(
            temp.path(),
            "lftp",
            "echo 'find: Login failed: 530' >&2\nexit 1",
        );
        let client = LftpListingClient::with_program(lftp, Duration::from_secs(10));
        let base: RemoteLocation = "ftp://massive.ucsd.edu/v01/MSV1/".parse().unwrap();

        let err = client.list(&base).unwrap_err();
        assert!(matches!(err, FilterError::RemoteUnavailable(message) if message.contains("530")));
    }
}
