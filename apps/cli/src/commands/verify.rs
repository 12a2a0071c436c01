//! Verify command implementation.
//!
//! Checks that the Linemod dataset, object models and model code are in place.

use colored::Colorize;
use dftr_training::{CheckItem, CheckLevel, EnvironmentChecker, EnvironmentReport, ObjectDataStatus};
use std::path::Path;

/// Execute the verify command, returning the process exit code.
pub fn execute(root: &Path, json_output: bool) -> anyhow::Result<i32> {
    let report = EnvironmentChecker::new(root.to_path_buf()).run();
    if json_output {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_human(&report);
    }
    Ok(report.exit_code())
}

fn print_human(report: &EnvironmentReport) {
    println!("{}", "DFTr Verify - Environment Validation".bold().cyan());
    println!("  Project root: {}", report.project_root.display().to_string().dimmed());
    println!();

    println!("{}", "Objects:".bold());
    for object in &report.objects {
        let status = match &object.status {
            ObjectDataStatus::Complete => "✓ complete".green(),
            ObjectDataStatus::Partial { missing } => format!("⚠ missing {}", missing.join(", ")).yellow(),
            ObjectDataStatus::Missing => "✗ not found".red(),
        };
        println!("  {:<12} {} {}", object.cls.name(), object.cls.dir_name().dimmed(), status);
    }
    println!();

    let mut section = "";
    for item in &report.items {
        if item.section != section {
            if !section.is_empty() {
                println!();
            }
            section = &item.section;
            println!("{}", format!("{}:", capitalize(section)).bold());
        }
        println!("  {}", render_item(item));
    }
    println!();

    if report.passed {
        println!("{}", "✓ Ready to train".green().bold());
    } else {
        let failures = report.failures().count();
        println!("{}", format!("✗ {failures} required check(s) failed").red().bold());
    }
}

fn render_item(item: &CheckItem) -> String {
    let mark = match (item.passed, item.level) {
        (true, _) => "✓".green(),
        (false, CheckLevel::Required) => "✗".red(),
        (false, CheckLevel::Informational) => "⚠".yellow(),
    };
    let mut line = format!("{} {}", mark, item.label);
    if let Some(detail) = &item.detail {
        line.push_str(&format!(" ({detail})"));
    }
    if !item.passed {
        if let Some(path) = &item.path {
            line.push_str(&format!(" {}", path.display().to_string().dimmed()));
        }
    }
    line
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    chars.next().map_or_else(String::new, |c| c.to_uppercase().chain(chars).collect())
}
