//! Shell completion generation and installation.

use anyhow::{Context, Result};
use clap::CommandFactory;
use clap_complete::{Shell, generate};
use console::style;
use directories::BaseDirs;
use rust_i18n::t;
use std::env;
use std::fs;
use std::io;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use crate::{Cli, CliError};

const BIN_NAME: &str = "grapheneflash";
const ZSH_FPATH_LINE: &str = "fpath=(~/.zfunc $fpath)";

/// Generate shell completions to stdout.
pub(crate) fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, BIN_NAME, &mut io::stdout());
}

/// Detect the user's current shell from environment.
pub(crate) fn detect_shell_type() -> Option<Shell> {
    if let Ok(shell_path) = env::var("SHELL") {
        return shell_from_path(&shell_path);
    }

    if cfg!(windows) && env::var("PSModulePath").is_ok() {
        return Some(Shell::PowerShell);
    }

    None
}

/// Shell named by the file name of `shell_path`.
fn shell_from_path(shell_path: &str) -> Option<Shell> {
    let shell_name = Path::new(shell_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");
    match shell_name {
        "bash" => Some(Shell::Bash),
        "zsh" => Some(Shell::Zsh),
        "fish" => Some(Shell::Fish),
        "elvish" => Some(Shell::Elvish),
        "pwsh" | "powershell" => Some(Shell::PowerShell),
        _ => None,
    }
}

fn home_dir() -> Result<PathBuf> {
    BaseDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .context("Could not determine home directory")
}

/// `$var`, or `~/<fallback>` when unset.
fn xdg_dir(var: &str, fallback: &[&str]) -> Result<PathBuf> {
    match env::var_os(var) {
        Some(dir) if !dir.is_empty() => Ok(PathBuf::from(dir)),
        _ => Ok(fallback
            .iter()
            .fold(home_dir()?, |path, part| path.join(part))),
    }
}

/// Where the completion script for `shell` is installed.
fn completion_install_path(shell: Shell) -> Result<PathBuf> {
    let path = match shell {
        Shell::Bash => xdg_dir("XDG_DATA_HOME", &[".local", "share"])?
            .join("bash-completion")
            .join("completions")
            .join(BIN_NAME),
        Shell::Zsh => home_dir()?.join(".zfunc").join(format!("_{BIN_NAME}")),
        Shell::Fish => xdg_dir("XDG_CONFIG_HOME", &[".config"])?
            .join("fish")
            .join("completions")
            .join(format!("{BIN_NAME}.fish")),
        Shell::Elvish => xdg_dir("XDG_CONFIG_HOME", &[".config"])?
            .join("elvish")
            .join("lib")
            .join(format!("{BIN_NAME}.elv")),
        Shell::PowerShell => {
            let dir = match env::var_os("PROFILE") {
                Some(profile) => Path::new(&profile)
                    .parent()
                    .map_or_else(|| PathBuf::from("."), Path::to_path_buf),
                None => home_dir()?
                    .join(".config")
                    .join("powershell")
                    .join("completions"),
            };
            dir.join(format!("{BIN_NAME}.ps1"))
        },
        _ => anyhow::bail!("Unsupported shell for auto-install"),
    };
    Ok(path)
}

/// Append the `.zfunc` fpath to `.zshrc` unless it is already there.
fn ensure_zsh_fpath(zshrc: &Path) -> Result<bool> {
    let present = fs::read_to_string(zshrc).is_ok_and(|content| content.contains(ZSH_FPATH_LINE));
    if present {
        return Ok(false);
    }

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(zshrc)
        .with_context(|| format!("Failed to update {}", zshrc.display()))?;
    writeln!(file, "\n# {BIN_NAME} completions")?;
    writeln!(file, "{ZSH_FPATH_LINE}")?;
    writeln!(file, "autoload -Uz compinit && compinit")?;
    Ok(true)
}

fn print_post_install_hint(shell: Shell, path: &Path) -> Result<()> {
    eprintln!();
    match shell {
        Shell::Bash => {
            eprintln!("{}", t!("completions.bash_hint"));
            eprintln!(
                "  {}",
                style(format!("source {}", path.display())).cyan()
            );
        },
        Shell::Zsh => {
            let zshrc = home_dir()?.join(".zshrc");
            if ensure_zsh_fpath(&zshrc)? {
                eprintln!(
                    "{} {}",
                    style("✓").green().bold(),
                    t!("completions.zshrc_updated", path = zshrc.display().to_string())
                );
            }
            eprintln!("{} {}", t!("completions.restart_shell"), style("exec zsh").cyan());
        },
        Shell::PowerShell => {
            eprintln!("{}", t!("completions.powershell_hint"));
            eprintln!(
                "  {}",
                style(format!("Import-Module {}", path.display())).cyan()
            );
        },
        _ => eprintln!("{}", t!("completions.auto_loaded")),
    }
    Ok(())
}

/// Install shell completions automatically.
pub(crate) fn cmd_completions_install(shell_arg: Option<Shell>) -> Result<()> {
    let shell = match shell_arg.or_else(detect_shell_type) {
        Some(shell) => shell,
        None => return Err(CliError::Usage(t!("completions.detect_failed").to_string()).into()),
    };

    let path = completion_install_path(shell)?;

    let mut buf = Vec::new();
    generate(shell, &mut Cli::command(), BIN_NAME, &mut buf);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(&path, &buf)
        .with_context(|| format!("Failed to write completion file: {}", path.display()))?;

    eprintln!(
        "{} {}",
        style("✓").green().bold(),
        t!(
            "completions.installed",
            shell = format!("{shell:?}"),
            path = path.display().to_string()
        )
    );

    print_post_install_hint(shell, &path)
}
