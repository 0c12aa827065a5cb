//! Running totals over a stream of packages

use colored::Colorize;
use serde::Serialize;

use crate::coverage::Package;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Summary {
    pub packages: usize,
    pub files: usize,
    pub uncovered_lines: usize,
    /// Unweighted mean of the per-file percentages
    pub mean_percent: f64,
    #[serde(skip)]
    percent_total: u64,
}

impl Summary {
    pub fn record(&mut self, package: &Package) {
        self.packages += 1;
        self.files += package.files.len();
        self.uncovered_lines += package.uncovered_count();
        self.percent_total += package.files.iter().map(|f| f.percent as u64).sum::<u64>();
        if self.files > 0 {
            self.mean_percent = self.percent_total as f64 / self.files as f64;
        }
    }

    /// Final line of `--json` output, distinguishable from package lines
    pub fn json_line(&self) -> serde_json::Value {
        serde_json::json!({ "summary": self })
    }

    pub fn print(&self) {
        println!("{}", "━".repeat(50).dimmed());
        println!(
            "  {} {} package(s), {} file(s)",
            "Σ".cyan(),
            self.packages.to_string().bold(),
            self.files.to_string().bold()
        );
        println!(
            "    {} {:.1}%",
            "mean file coverage:".dimmed(),
            self.mean_percent
        );
        println!(
            "    {} {}",
            "uncovered lines:".dimmed(),
            self.uncovered_lines.to_string().yellow()
        );
    }
}
