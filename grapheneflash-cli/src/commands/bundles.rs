//! Local bundle index.

use anyhow::Result;
use console::style;
use grapheneflash::{BundleInfo, index_bundles, model_name};
use rust_i18n::t;

use crate::Cli;
use crate::config::Config;

fn filter_bundles(bundles: Vec<BundleInfo>, codename: Option<&str>) -> Vec<BundleInfo> {
    match codename {
        Some(wanted) => bundles
            .into_iter()
            .filter(|b| b.codename == wanted)
            .collect(),
        None => bundles,
    }
}

/// Bundles command implementation.
pub(crate) fn cmd_bundles(
    cli: &Cli,
    config: &Config,
    codename: Option<&str>,
    json: bool,
) -> Result<()> {
    let root = cli.bundles_root(config);
    let bundles = filter_bundles(index_bundles(&root), codename);

    if json {
        println!("{}", serde_json::to_string_pretty(&bundles)?);
        return Ok(());
    }

    eprintln!(
        "{}",
        style(t!("bundles.header", root = root.display().to_string()))
            .bold()
            .underlined()
    );

    if bundles.is_empty() {
        eprintln!("  {}", style(t!("bundles.none")).dim());
        return Ok(());
    }

    let mut current: Option<&str> = None;
    for bundle in &bundles {
        if current != Some(bundle.codename.as_str()) {
            let model = model_name(&bundle.codename)
                .map(|m| format!(" ({m})"))
                .unwrap_or_default();
            eprintln!("\n  {}{}", style(&bundle.codename).cyan().bold(), model);
            current = Some(bundle.codename.as_str());
        }
        eprintln!(
            "    {} {}  {}",
            style("•").green(),
            bundle.version,
            style(bundle.path.display()).dim()
        );
    }

    Ok(())
}
