//! Install command implementation.

use console::style;
use indicatif::MultiProgress;
use std::time::Instant;

use pb_core::Error;
use pb_io::{BatchReport, InstallTask, Reporter};

use super::Context;
use crate::display::{ProgressStyles, create_progress_callback, finish_progress_bars, header};

/// Run the install command.
pub async fn run(ctx: &Context, formulas: &[String]) -> Result<(), Error> {
    for name in formulas {
        validate_formula_name(name).map_err(|msg| Error::MissingFormula { name: msg })?;
    }

    let start = Instant::now();
    println!("{}", header("Resolving dependencies..."));

    let multi = MultiProgress::new();
    let (callback, bars) = create_progress_callback(multi, ProgressStyles::default(), false);
    let reporter = Reporter::new(Some(callback));

    let mut tasks = ctx.planner(reporter.clone()).plan_install(formulas).await?;
    for task in &tasks {
        let formula = task.formula();
        println!(
            "    {} {}",
            style(&formula.name).green(),
            style(formula.effective_version()).dim()
        );
    }

    let result = ctx.installer(reporter).install_all(&mut tasks).await;
    finish_progress_bars(&bars);
    let report = result?;

    print_cleanup_failures(&report);
    println!();
    println!(
        "{}",
        header(format_install_summary(&report, start.elapsed().as_secs_f64()))
    );

    Ok(())
}

pub(crate) fn print_cleanup_failures(report: &BatchReport) {
    for (name, err) in &report.cleanup_failures {
        eprintln!(
            "{} cleanup of {} failed: {}",
            style("warning:").yellow().bold(),
            style(name).bold(),
            err
        );
    }
}

pub(crate) fn validate_formula_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        Err("Formula name cannot be empty".to_string())
    } else if name.starts_with('-') {
        Err("Formula name cannot start with a dash".to_string())
    } else {
        Ok(())
    }
}

pub(crate) fn format_install_summary(report: &BatchReport, elapsed_secs: f64) -> String {
    let changed = report.outcomes.iter().filter(|o| o.is_change()).count();
    let skipped = report.outcomes.len() - changed;
    let noun = if changed == 1 { "package" } else { "packages" };
    let mut summary = format!("Installed {changed} {noun} in {elapsed_secs:.2}s");
    if skipped > 0 {
        summary.push_str(&format!(" ({skipped} skipped)"));
    }
    summary
}
