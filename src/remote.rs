use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use crate::error::FilterError;
use crate::tool;

pub trait ContentSource: Send + Sync {
    fn open(&self, url: &str) -> Result<Box<dyn Read + Send>, FilterError>;

    fn download(&self, url: &str, destination: &Path) -> Result<u64, FilterError> {
        let mut reader = self.open(url)?;
        let mut file =
            File::create(destination).map_err(|err| FilterError::Filesystem(err.to_string()))?;
        io::copy(&mut reader, &mut file).map_err(|err| FilterError::StreamRead {
            partial: 0,
            message: format!("download of {url} interrupted: {err}"),
        })
    }
}

#[derive(Clone)]
pub struct SystemContentSource {
    curl: Option<PathBuf>,
    client: Client,
    timeout: Duration,
}

impl SystemContentSource {
    pub fn new(timeout: Duration) -> Result<Self, FilterError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("ms2-filter/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| FilterError::Filesystem(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| FilterError::StreamRead {
                partial: 0,
                message: err.to_string(),
            })?;
        Ok(Self {
            curl: tool::find_in_path("curl"),
            client,
            timeout,
        })
    }

    fn open_ftp(&self, url: &str) -> Result<Box<dyn Read + Send>, FilterError> {
        let curl = self.curl.as_ref().ok_or_else(|| FilterError::StreamRead {
            partial: 0,
            message: "curl not found in PATH".to_string(),
        })?;
        let max_time = self.timeout.as_secs().max(1).to_string();
        let mut child = Command::new(curl)
            .args([
                "--ftp-pasv",
                "--silent",
                "--show-error",
                "--fail",
                "--max-time",
                max_time.as_str(),
                url,
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| FilterError::StreamRead {
                partial: 0,
                message: format!("failed to start curl: {err}"),
            })?;
        let stdout = child.stdout.take().ok_or_else(|| FilterError::StreamRead {
            partial: 0,
            message: "curl stdout unavailable".to_string(),
        })?;
        Ok(Box::new(CurlStream {
            child,
            stdout,
            finished: false,
        }))
    }

    fn open_http(&self, url: &str) -> Result<Box<dyn Read + Send>, FilterError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| FilterError::StreamRead {
                partial: 0,
                message: err.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(FilterError::StreamRead {
                partial: 0,
                message: format!("{url} returned status {}", response.status().as_u16()),
            });
        }
        Ok(Box::new(response))
    }
}

impl ContentSource for SystemContentSource {
    fn open(&self, url: &str) -> Result<Box<dyn Read + Send>, FilterError> {
        let lower = url.to_ascii_lowercase();
        if lower.starts_with("ftp://") {
            self.open_ftp(url)
        } else if lower.starts_with("http://") || lower.starts_with("https://") {
            self.open_http(url)
        } else if let Some(path) = url.strip_prefix("file://") {
            let file = File::open(path).map_err(|err| FilterError::StreamRead {
                partial: 0,
                message: format!("{path}: {err}"),
            })?;
            Ok(Box::new(file))
        } else {
            Err(FilterError::StreamRead {
                partial: 0,
                message: format!("unsupported URL scheme: {url}"),
            })
        }
    }
}

// A failed transfer surfaces as a read error at EOF.
struct CurlStream {
    child: Child,
    stdout: ChildStdout,
    finished: bool,
}

impl Read for CurlStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.finished {
            return Ok(0);
        }
        let n = self.stdout.read(buf)?;
        if n > 0 || buf.is_empty() {
            return Ok(n);
        }
        self.finished = true;
        let status = self.child.wait()?;
        if status.success() {
            return Ok(0);
        }
        let mut stderr = String::new();
        if let Some(mut pipe) = self.child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr);
        }
        let message = match stderr.trim() {
            "" => format!("curl exited with {status}"),
            text => text.to_string(),
        };
        Err(io::Error::other(message))
    }
}

impl Drop for CurlStream {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}
