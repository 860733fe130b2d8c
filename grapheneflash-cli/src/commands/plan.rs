//! Dry-run flash plan.

use anyhow::Result;
use console::style;
use grapheneflash::{BuildManager, LocalBuildManager, PartitionPlan};
use rust_i18n::t;
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::Cli;
use crate::config::Config;

/// One partition step, in flash order.
#[derive(Debug, Serialize)]
struct PlanStep<'a> {
    partition: &'a str,
    files: Vec<&'a Path>,
}

#[derive(Debug, Serialize)]
struct PlanReport<'a> {
    codename: &'a str,
    bundle_path: &'a Path,
    flash_count: usize,
    steps: Vec<PlanStep<'a>>,
}

fn report<'a>(codename: &'a str, bundle: &'a Path, plan: &'a PartitionPlan) -> PlanReport<'a> {
    PlanReport {
        codename,
        bundle_path: bundle,
        flash_count: plan.flash_count(),
        steps: plan
            .entries()
            .into_iter()
            .map(|(partition, files)| PlanStep { partition, files })
            .collect(),
    }
}

fn resolve(root: PathBuf, codename: &str, version: Option<&str>) -> Result<(PathBuf, PartitionPlan)> {
    let builds = LocalBuildManager::new(root);
    let bundle = builds.resolve(codename, version)?.ok_or_else(|| {
        grapheneflash::Error::BundleResolutionFailed(format!(
            "no {codename} bundle ({}) under {}",
            version.unwrap_or("latest"),
            builds.root().display()
        ))
    })?;
    let plan = builds.find_partition_files(&bundle, codename)?;
    Ok((bundle, plan))
}

/// Plan command implementation.
pub(crate) fn cmd_plan(
    cli: &Cli,
    config: &Config,
    codename: &str,
    version: Option<&str>,
    json: bool,
) -> Result<()> {
    let (bundle, plan) = resolve(cli.bundles_root(config), codename, version)?;
    let report = report(codename, &bundle, &plan);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    eprintln!(
        "{}",
        style(t!("plan.header", path = bundle.display().to_string()))
            .bold()
            .underlined()
    );
    for (index, step) in report.steps.iter().enumerate() {
        let files: Vec<String> = step
            .files
            .iter()
            .filter_map(|f| f.file_name())
            .map(|f| f.to_string_lossy().into_owned())
            .collect();
        eprintln!(
            "  [{:2}] {:<20} {}",
            index + 1,
            style(step.partition).cyan(),
            files.join(", ")
        );
    }
    eprintln!(
        "\n{} {}",
        style("ℹ").blue(),
        t!("plan.flash_count", count = report.flash_count)
    );
    if plan.bootloader.is_none() || plan.radio.is_none() {
        eprintln!("{} {}", style("⚠").yellow(), t!("plan.firmware_missing"));
    }

    Ok(())
}
