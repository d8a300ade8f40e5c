use crate::models::UserProfile;
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

/// History entries shown in console output
const CONSOLE_HISTORY_LIMIT: usize = 10;
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Output handler for profile lookups
pub struct OutputHandler {
    format: OutputFormat,
    writer: Option<Box<dyn Write + Send>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Jsonl,
    Console,
}

impl OutputFormat {
    pub fn from_name(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            "jsonl" => OutputFormat::Jsonl,
            _ => OutputFormat::Console, // Default
        }
    }
}

/// Human-readable report for one profile
pub fn render_console(profile: &UserProfile) -> String {
    let unknown = "unknown";
    let mut out = String::new();

    out.push_str(&format!("=== {} ===\n", profile.display_name));
    out.push_str(&format!(
        "Current address: {}\n",
        profile.current_address.as_deref().unwrap_or(unknown)
    ));
    out.push_str(&format!(
        "Location: {}\n",
        profile.current_location.as_deref().unwrap_or(unknown)
    ));
    out.push_str(&format!(
        "ISP: {}\n",
        profile.current_isp.as_deref().unwrap_or(unknown)
    ));
    out.push_str(&format!(
        "Last seen: {}\n",
        profile
            .last_seen
            .map(|t| t.format(TIME_FORMAT).to_string())
            .unwrap_or_else(|| unknown.to_string())
    ));

    if profile.history.is_empty() {
        out.push_str("Address history: none\n");
        return out;
    }

    out.push_str("Address history:\n");
    for (i, record) in profile.history.iter().take(CONSOLE_HISTORY_LIMIT).enumerate() {
        let location = record
            .location
            .as_deref()
            .map(|l| format!(" ({})", l))
            .unwrap_or_default();
        out.push_str(&format!(
            "  {}. {} - {}{}\n",
            i + 1,
            record.address,
            record.first_seen.format(TIME_FORMAT),
            location
        ));
    }
    if profile.history.len() > CONSOLE_HISTORY_LIMIT {
        out.push_str(&format!(
            "  ... {} more\n",
            profile.history.len() - CONSOLE_HISTORY_LIMIT
        ));
    }
    out
}

impl OutputHandler {
    /// Create a new output handler writing to a file, or stdout when no path is given
    pub fn new(format: OutputFormat, file_path: Option<PathBuf>) -> io::Result<Self> {
        let writer: Option<Box<dyn Write + Send>> = match file_path {
            Some(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Some(Box::new(BufWriter::new(file)))
            }
            None => None,
        };

        Ok(OutputHandler { format, writer })
    }

    /// Create a handler writing to an arbitrary sink
    pub fn with_writer(format: OutputFormat, writer: Box<dyn Write + Send>) -> Self {
        OutputHandler {
            format,
            writer: Some(writer),
        }
    }

    /// Write the result of looking `name` up
    pub fn write_lookup(
        &mut self,
        name: &str,
        profile: Option<&UserProfile>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let output = match (&self.format, profile) {
            (OutputFormat::Console, Some(profile)) => render_console(profile),
            (OutputFormat::Console, None) => format!("No records found for {}\n", name),
            (OutputFormat::Json, Some(profile)) => {
                format!("{}\n", serde_json::to_string_pretty(profile)?)
            }
            (OutputFormat::Jsonl, Some(profile)) => {
                format!("{}\n", serde_json::to_string(profile)?)
            }
            (_, None) => format!(
                "{}\n",
                serde_json::json!({ "name": name, "found": false })
            ),
        };
        self.write_output(&output)?;
        Ok(())
    }

    fn write_output(&mut self, data: &str) -> io::Result<()> {
        match &mut self.writer {
            Some(writer) => {
                writer.write_all(data.as_bytes())?;
                writer.flush()?;
            }
            None => {
                let mut stdout = io::stdout().lock();
                stdout.write_all(data.as_bytes())?;
                stdout.flush()?;
            }
        }
        Ok(())
    }

    /// Flush any buffered output
    pub fn flush(&mut self) -> io::Result<()> {
        if let Some(writer) = &mut self.writer {
            writer.flush()?;
        }
        Ok(())
    }
}
