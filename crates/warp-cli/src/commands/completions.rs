//! completions command - shell completion scripts for `warp-pool`

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::CommandFactory;
use clap_complete::{generate, Shell};

const BIN_NAME: &str = "warp-pool";

/// Print completions to stdout, or write them into `output` if given
pub fn execute(shell: Shell, output: Option<&Path>) -> Result<()> {
    match output {
        Some(dir) => {
            let path = write_completion_file(shell, dir)?;
            println!("Generated {} completion: {}", shell, path.display());
        }
        None => generate_completions(shell, &mut std::io::stdout()),
    }
    Ok(())
}

fn generate_completions<W: Write>(shell: Shell, buf: &mut W) {
    let mut cmd = crate::Cli::command();
    generate(shell, &mut cmd, BIN_NAME, buf);
}

fn write_completion_file(shell: Shell, out_dir: &Path) -> Result<PathBuf> {
    if !out_dir.is_dir() {
        bail!("Output directory does not exist: {}", out_dir.display());
    }

    let path = out_dir.join(completion_file_name(shell));
    let mut file = std::fs::File::create(&path)
        .with_context(|| format!("Failed to create completion file: {}", path.display()))?;
    generate_completions(shell, &mut file);
    Ok(path)
}

fn completion_file_name(shell: Shell) -> String {
    match shell {
        Shell::Bash => format!("{BIN_NAME}.bash"),
        Shell::Zsh => format!("_{BIN_NAME}"),
        Shell::Fish => format!("{BIN_NAME}.fish"),
        Shell::PowerShell => format!("_{BIN_NAME}.ps1"),
        Shell::Elvish => format!("{BIN_NAME}.elv"),
        _ => format!("{BIN_NAME}.{shell}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_bash_script_mentions_subcommands() {
        let mut buf = Vec::new();
        generate_completions(Shell::Bash, &mut buf);
        let script = String::from_utf8(buf).unwrap();
        assert!(script.contains(BIN_NAME));
        assert!(script.contains("simulate"));
    }

    #[test]
    fn test_write_to_directory() {
        let dir = TempDir::new().unwrap();
        for shell in [Shell::Bash, Shell::Zsh, Shell::Fish] {
            execute(shell, Some(dir.path())).unwrap();
        }
        assert!(dir.path().join("warp-pool.bash").exists());
        assert!(dir.path().join("_warp-pool").exists());
        assert!(dir.path().join("warp-pool.fish").exists());
    }

    #[test]
    fn test_missing_directory() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        assert!(execute(Shell::Bash, Some(&missing)).is_err());
    }
}
