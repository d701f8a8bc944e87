//! Normalization of package-installer output.

use skiff_sandbox::KERNEL_RESTART_NOTE;

pub const INSTALLED_MESSAGE: &str = "[Package installed successfully]";
pub const ALREADY_INSTALLED_MESSAGE: &str = "[Package already installed]";
pub const RESTARTED_MESSAGE: &str = "\n[Kernel restarted successfully to load the package]";
pub const RESTART_FAILED_MESSAGE: &str = "\n[Failed to restart the kernel]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipOutcome {
    /// Output is passed through as is.
    Unchanged,
    /// New packages were installed; the interpreter needs a restart to see
    /// them. `restart_noted` is set when the installer said so itself.
    Installed { restart_noted: bool },
    AlreadyInstalled,
}

/// Classifies the output of the `pip install` found in `code`.
pub fn classify_pip_output(code: &str, output: &str) -> PipOutcome {
    if output.contains("Successfully installed") {
        return PipOutcome::Installed {
            restart_noted: output.contains(KERNEL_RESTART_NOTE),
        };
    }
    let packages = code
        .lines()
        .find_map(|line| line.split_once("pip install").map(|(_, rest)| rest.trim()))
        .unwrap_or_default();
    let single = !packages.is_empty() && !packages.contains(' ');
    if single && output.contains(&format!("Requirement already satisfied: {packages}")) {
        PipOutcome::AlreadyInstalled
    } else {
        PipOutcome::Unchanged
    }
}
