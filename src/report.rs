//! Analysis summary, as aligned text or JSON.

use std::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::analysis::{Program, Subroutine};
use crate::TranslateError;

/// Report output formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    /// Aligned table
    Text,
    /// Pretty-printed JSON
    Json,
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportFormat::Text => write!(f, "text"),
            ReportFormat::Json => write!(f, "json"),
        }
    }
}

/// One translated subroutine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubroutineReport {
    /// Entry point as `SSSS:OOOO`
    pub entry: String,
    /// Generated function name
    pub name: String,
    pub instructions: usize,
    pub labels: usize,
    /// Callee entry points as `SSSS:OOOO`
    pub callees: Vec<String>,
}

/// Summary of one analyzed program
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub entry: String,
    pub data_base: String,
    pub data_size: usize,
    pub memory_size: u32,
    pub instructions: usize,
    pub subroutines: Vec<SubroutineReport>,
}

impl SubroutineReport {
    fn from_subroutine(sub: &Subroutine) -> Self {
        Self {
            entry: sub.entry.to_string(),
            name: sub.name(),
            instructions: sub.steps.len(),
            labels: sub.labels.len(),
            callees: sub.calls_to.iter().map(ToString::to_string).collect(),
        }
    }
}

impl Report {
    /// Summarize an analyzed program.
    pub fn from_program(program: &Program) -> Self {
        Self {
            entry: program.entry.to_string(),
            data_base: format!("0x{:05X}", program.data_base),
            data_size: program.data_image.len(),
            memory_size: program.memory_size,
            instructions: program.instruction_count(),
            subroutines: program
                .subroutines
                .values()
                .map(SubroutineReport::from_subroutine)
                .collect(),
        }
    }

    pub fn render(&self, format: ReportFormat) -> Result<String, TranslateError> {
        match format {
            ReportFormat::Text => Ok(self.to_text()),
            ReportFormat::Json => self.to_json(),
        }
    }

    /// Header lines, then one table row per subroutine.
    pub fn to_text(&self) -> String {
        let mut output = String::new();
        output.push_str(&format!("entry:        {}\n", self.entry));
        output.push_str(&format!(
            "data image:   {} bytes at {}\n",
            self.data_size, self.data_base
        ));
        output.push_str(&format!("memory size:  0x{:05X}\n", self.memory_size));
        output.push_str(&format!(
            "translated:   {} instructions in {} subroutines\n\n",
            self.instructions,
            self.subroutines.len()
        ));

        output.push_str(&format!(
            "{:<11} {:<11} {:>6} {:>6}  {}\n",
            "ENTRY", "FUNCTION", "INSNS", "LABELS", "CALLS"
        ));
        for sub in &self.subroutines {
            let callees = if sub.callees.is_empty() {
                "-".to_string()
            } else {
                sub.callees.join(" ")
            };
            output.push_str(&format!(
                "{:<11} {:<11} {:>6} {:>6}  {}\n",
                sub.entry, sub.name, sub.instructions, sub.labels, callees
            ));
        }
        output
    }

    /// Pretty-printed JSON.
    pub fn to_json(&self) -> Result<String, TranslateError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| TranslateError::Config(format!("JSON serialization failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TranslatorOptions;
    use crate::store::scripted::{image, Scripted};
    use crate::store::InstructionStore;

    fn report() -> Report {
        let image = image();
        let options = TranslatorOptions::default();
        let listing = [(0, 3, "call 0x10"), (3, 1, "ret"), (0x10, 1, "ret")];
        let mut store = InstructionStore::new(&image, Box::new(Scripted::new(&listing)), &options);
        let program = Program::analyze(&mut store, &image, &options).unwrap();
        Report::from_program(&program)
    }

    #[test]
    fn test_report_summary() {
        let report = report();
        assert_eq!(report.entry, "1000:0000");
        assert_eq!(report.instructions, 3);
        assert_eq!(report.subroutines.len(), 2);
        assert_eq!(report.subroutines[0].name, "sub_10000");
        assert_eq!(report.subroutines[0].callees, vec!["1000:0010".to_string()]);
        assert!(report.subroutines[1].callees.is_empty());
    }

    #[test]
    fn test_text_report() {
        let text = report().to_text();
        assert!(text.contains("translated:   3 instructions in 2 subroutines"));
        assert!(text.contains("1000:0000   sub_10000        2      1  1000:0010"));
        assert!(text.contains("1000:0010   sub_10010        1      1  -"));
    }

    #[test]
    fn test_json_report_round_trips() {
        let report = report();
        let json = report.render(ReportFormat::Json).unwrap();
        let parsed: Report = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, report);
    }
}
