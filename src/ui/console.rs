use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::debug;

use super::icons::{PAUSE, PROGRESS, status_icon};
use super::{UiAction, UiSink};
use crate::phase::{Phase, PhaseStatus};
use crate::stream::{TokenStats, truncate_str};
use crate::worker::PidRegistry;

/// Terminal sink: a spinner for the active phase with worker output printed
/// above it.
///
/// Actions come from [`ConsoleSink::push_action`] or, once
/// [`ConsoleSink::listen_for_interrupt`] is called, from Ctrl-C.
pub struct ConsoleSink {
    spinner: ProgressBar,
    verbose: bool,
    actions: Arc<Mutex<VecDeque<UiAction>>>,
}

impl ConsoleSink {
    pub fn new(verbose: bool) -> Self {
        let spinner = ProgressBar::new_spinner();
        if let Ok(template) = ProgressStyle::default_spinner().template("{spinner} {prefix:.bold} {msg}") {
            spinner.set_style(template);
        }
        Self {
            spinner,
            verbose,
            actions: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn push_action(&self, action: UiAction) {
        self.actions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(action);
    }

    /// Turn Ctrl-C into `UiAction::Quit`. A second Ctrl-C kills every worker
    /// tree in `registry` and exits immediately.
    pub fn listen_for_interrupt(&self, registry: PidRegistry) {
        let actions = self.actions.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            eprintln!("\n{} stopping after the active worker exits", PAUSE);
            actions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push_back(UiAction::Quit);
            if tokio::signal::ctrl_c().await.is_ok() {
                reap_before_exit(&registry);
                std::process::exit(130);
            }
        });
    }

    fn print_line(&self, line: impl AsRef<str>) {
        if self.spinner.is_hidden() {
            eprintln!("{}", line.as_ref());
        } else {
            self.spinner.println(line.as_ref());
        }
    }
}

/// Kill registered worker trees ahead of `process::exit`. Workers lead their
/// own process groups, so the terminal's SIGINT does not reach them.
fn reap_before_exit(registry: &PidRegistry) -> usize {
    let reaped = registry.reap_all();
    if reaped > 0 {
        eprintln!("{} killed {} worker process tree(s)", PAUSE, reaped);
    }
    reaped
}

impl UiSink for ConsoleSink {
    fn phase_started(&self, phase: &Phase, attempt: u32, max_attempts: u32) {
        self.spinner.set_prefix(format!("Phase {}", phase.id));
        self.spinner.set_message(format!(
            "{} {}",
            phase.title,
            style(format!("(attempt {}/{})", attempt, max_attempts)).dim()
        ));
        self.spinner.enable_steady_tick(Duration::from_millis(100));
    }

    fn state_changed(&self, phase_id: &str, status: PhaseStatus, reason: Option<&str>) {
        let label = match status {
            PhaseStatus::Completed => style(status.as_str()).green().bold(),
            PhaseStatus::Failed | PhaseStatus::Blocked => style(status.as_str()).red().bold(),
            PhaseStatus::AwaitingHuman => style(status.as_str()).yellow().bold(),
            _ => style(status.as_str()).cyan(),
        };
        let mut line = format!("{}Phase {} {}", status_icon(status), style(phase_id).yellow(), label);
        if let Some(reason) = reason {
            line.push_str(&format!(": {}", style(reason).dim()));
        }
        self.print_line(line);
        if status.is_terminal() {
            self.spinner.disable_steady_tick();
            self.spinner.set_message("");
        }
    }

    fn log(&self, phase_id: &str, line: &str) {
        if self.verbose {
            self.print_line(format!("  {} {}", style(format!("[{}]", phase_id)).dim(), line));
        } else {
            self.spinner.set_message(truncate_str(line, 80));
        }
    }

    fn token_stats(&self, session: &TokenStats, run_total: &TokenStats) {
        debug!(
            session_tokens = session.total_tokens(),
            run_tokens = run_total.total_tokens(),
            "token stats"
        );
        if self.verbose {
            self.print_line(format!(
                "  {}session {} tokens, run {} tokens (${:.4})",
                PROGRESS,
                session.total_tokens(),
                run_total.total_tokens(),
                run_total.cost_usd
            ));
        }
    }

    fn poll_action(&self) -> UiAction {
        self.actions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_default()
    }
}

impl Drop for ConsoleSink {
    fn drop(&mut self) {
        self.spinner.finish_and_clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actions_are_polled_in_order() {
        let sink = ConsoleSink::new(false);
        assert_eq!(sink.poll_action(), UiAction::None);
        sink.push_action(UiAction::Pause);
        sink.push_action(UiAction::Resume);
        assert_eq!(sink.poll_action(), UiAction::Pause);
        assert_eq!(sink.poll_action(), UiAction::Resume);
        assert_eq!(sink.poll_action(), UiAction::None);
    }

    #[cfg(unix)]
    #[test]
    fn test_hard_exit_reaps_registered_worker_groups() {
        use crate::worker::process::tree_alive;
        use std::os::unix::process::CommandExt;
        use std::process::{Command, Stdio};

        let mut child = Command::new("sleep")
            .arg("30")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id();
        assert!(tree_alive(pid));

        let registry = PidRegistry::new();
        registry.register(pid);
        assert_eq!(reap_before_exit(&registry), 1);
        assert!(registry.is_empty());

        assert!(!child.wait().unwrap().success());
        assert!(!tree_alive(pid));
    }
}
