use std::io::{self, Write};

use serde::Serialize;

use crate::batch::BatchSummary;
use crate::convert::ToolInfo;
use crate::counter::CountResult;

#[derive(Debug, Clone, Serialize)]
pub struct ToolReport {
    pub lftp: bool,
    pub curl: bool,
    pub converter: ToolInfo,
    pub converter_available: bool,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_batch(summaries: &[BatchSummary]) -> io::Result<()> {
        Self::print_json(&summaries)
    }

    pub fn print_count(result: &CountResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_tools(report: &ToolReport) -> io::Result<()> {
        Self::print_json(report)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}
