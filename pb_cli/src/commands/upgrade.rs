//! Upgrade and outdated command implementations.

use console::style;
use indicatif::MultiProgress;
use std::time::Instant;

use pb_core::{Error, OutdatedPackage};
use pb_io::{ApplyOutcome, Reporter};

use super::Context;
use super::install::print_cleanup_failures;
use crate::display::{ProgressStyles, create_progress_callback, finish_progress_bars, header};

/// Run the outdated command.
pub async fn run_outdated(ctx: &Context, json: bool) -> Result<(), Error> {
    if !json {
        println!("{}", header("Checking for outdated packages..."));
    }

    let outdated = ctx.planner(Reporter::silent()).outdated(&[]).await?;

    if json {
        match serde_json::to_string_pretty(&outdated) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!(
                    "{} Failed to serialize JSON: {}",
                    style("error:").red().bold(),
                    e
                );
                std::process::exit(1);
            }
        }
    } else if outdated.is_empty() {
        println!("All packages are up to date.");
    } else {
        println!(
            "{} {} outdated packages:",
            style("==>").cyan().bold(),
            style(outdated.len()).yellow().bold()
        );
        println!();
        for pkg in &outdated {
            println!("  {}", format_outdated_line(pkg));
        }
        println!();
        println!(
            "    {} Run {} to upgrade all",
            style("→").cyan(),
            style("pb upgrade").cyan()
        );
    }

    Ok(())
}

/// Run the upgrade command.
pub async fn run_upgrade(
    ctx: &Context,
    formulas: &[String],
    dry_run: bool,
    verbose: bool,
) -> Result<(), Error> {
    let start = Instant::now();

    let multi = MultiProgress::new();
    let (callback, bars) = create_progress_callback(multi, ProgressStyles::default(), verbose);
    let reporter = Reporter::new(Some(callback));

    let mut tasks = ctx.planner(reporter.clone()).plan_upgrade(formulas).await?;
    if tasks.is_empty() {
        println!("All packages are up to date.");
        return Ok(());
    }

    let verb = if dry_run { "Would upgrade" } else { "Upgrading" };
    println!(
        "{}",
        header(format!(
            "{verb} {} {}",
            style(tasks.len()).yellow().bold(),
            if tasks.len() == 1 { "package" } else { "packages" }
        ))
    );

    let result = ctx
        .installer(reporter)
        .upgrade_all(&mut tasks, dry_run, verbose)
        .await;
    finish_progress_bars(&bars);
    let report = result?;

    print_cleanup_failures(&report);

    let upgraded = report
        .outcomes
        .iter()
        .filter(|o| matches!(o, ApplyOutcome::Upgraded { .. }))
        .count();
    println!();
    if dry_run {
        println!("{}", header("Dry run complete; nothing was changed."));
    } else {
        println!(
            "{}",
            header(format!(
                "Upgraded {upgraded} packages in {:.2}s",
                start.elapsed().as_secs_f64()
            ))
        );
    }

    Ok(())
}

pub(crate) fn format_outdated_line(pkg: &OutdatedPackage) -> String {
    format!(
        "{} {} → {}",
        style(&pkg.name).bold(),
        style(&pkg.installed_version).red(),
        style(&pkg.available_version).green()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pb_io::test_utils::{FormulaFixture, TestContext};

    fn context(ctx: &TestContext) -> Context {
        Context {
            prefix: ctx.prefix.clone(),
            api: ctx.api(),
            config: pb_core::InstallConfig::default(),
        }
    }

    #[test]
    fn outdated_line_shows_both_versions() {
        console::set_colors_enabled(false);
        let pkg = OutdatedPackage {
            name: "jq".to_string(),
            installed_version: "1.6".to_string(),
            available_version: "1.7.1".to_string(),
        };
        assert_eq!(format_outdated_line(&pkg), "jq 1.6 → 1.7.1");
    }

    #[tokio::test]
    async fn run_upgrade_replaces_old_keg() {
        let ctx = TestContext::new().await;
        let fixture = FormulaFixture {
            name: "jq",
            version: "1.6",
            ..Default::default()
        };
        ctx.mount_formula(&fixture).await;
        let cli_ctx = context(&ctx);
        super::super::install::run(&cli_ctx, &["jq".to_string()])
            .await
            .unwrap();

        ctx.server.reset().await;
        ctx.mount_formula(&FormulaFixture {
            version: "1.7.1",
            ..fixture
        })
        .await;

        run_upgrade(&cli_ctx, &[], false, false).await.unwrap();

        assert_eq!(
            ctx.prefix.installed_version("jq").unwrap().as_deref(),
            Some("1.7.1")
        );
        assert!(!ctx.prefix.cellar.has_keg("jq", "1.6"));
    }

    #[tokio::test]
    async fn run_upgrade_dry_run_keeps_installed_version() {
        let ctx = TestContext::new().await;
        let fixture = FormulaFixture {
            name: "jq",
            version: "1.6",
            ..Default::default()
        };
        ctx.mount_formula(&fixture).await;
        let cli_ctx = context(&ctx);
        super::super::install::run(&cli_ctx, &["jq".to_string()])
            .await
            .unwrap();

        ctx.server.reset().await;
        ctx.mount_formula(&FormulaFixture {
            version: "1.7.1",
            ..fixture
        })
        .await;

        run_upgrade(&cli_ctx, &["jq".to_string()], true, true)
            .await
            .unwrap();

        assert_eq!(
            ctx.prefix.installed_version("jq").unwrap().as_deref(),
            Some("1.6")
        );
        assert!(ctx.prefix.cellar.has_keg("jq", "1.6"));
    }

    #[tokio::test]
    async fn run_upgrade_rejects_names_that_are_not_installed() {
        let ctx = TestContext::new().await;
        let err = run_upgrade(&context(&ctx), &["jq".to_string()], false, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotInstalled { .. }));
    }
}
