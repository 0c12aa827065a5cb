//! Coverage threshold validation

use colored::Colorize;

use super::Package;

/// A file whose coverage is under the minimum
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BelowThreshold {
    pub package: String,
    pub file: String,
    pub percent: u8,
}

/// Result of threshold validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThresholdResult {
    pub passed: bool,
    pub min_percent: u8,
    pub files_checked: usize,
    pub failures: Vec<BelowThreshold>,
}

impl ThresholdResult {
    pub fn print_summary(&self) {
        let status = if self.passed { "✓".green() } else { "✗".red() };
        println!(
            "  {} {} of {} file(s) below {}%",
            status,
            self.failures.len(),
            self.files_checked,
            self.min_percent
        );

        for failure in &self.failures {
            let delta = failure.percent as i16 - self.min_percent as i16;
            println!(
                "    {} {}/{} {}% ({})",
                "•".red(),
                failure.package.dimmed(),
                failure.file,
                failure.percent,
                format!("{}%", delta).red()
            );
        }
    }
}

/// Incremental threshold check, fed one package at a time
#[derive(Debug, Clone)]
pub struct ThresholdCheck {
    min_percent: u8,
    files_checked: usize,
    failures: Vec<BelowThreshold>,
}

impl ThresholdCheck {
    pub fn new(min_percent: u8) -> Self {
        Self {
            min_percent,
            files_checked: 0,
            failures: Vec::new(),
        }
    }

    pub fn record(&mut self, package: &Package) {
        for file in &package.files {
            self.files_checked += 1;
            if file.percent < self.min_percent {
                self.failures.push(BelowThreshold {
                    package: package.path.clone(),
                    file: file.file.clone(),
                    percent: file.percent,
                });
            }
        }
    }

    pub fn finish(self) -> ThresholdResult {
        ThresholdResult {
            passed: self.failures.is_empty(),
            min_percent: self.min_percent,
            files_checked: self.files_checked,
            failures: self.failures,
        }
    }
}

/// Validate every file of the given packages against a minimum percentage
pub fn validate_threshold<'a>(
    packages: impl IntoIterator<Item = &'a Package>,
    min_percent: u8,
) -> ThresholdResult {
    let mut check = ThresholdCheck::new(min_percent);
    for package in packages {
        check.record(package);
    }
    check.finish()
}
