//! Status glyphs shared by the console sink and commit messages.

use console::Emoji;

use crate::phase::PhaseStatus;

pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static RUNNING: Emoji<'_, '_> = Emoji("▶️  ", "[>]");
pub static REVIEW: Emoji<'_, '_> = Emoji("🔍 ", "[R]");
pub static BLOCKER: Emoji<'_, '_> = Emoji("🚧 ", "[BLOCK]");
pub static HUMAN: Emoji<'_, '_> = Emoji("🙋 ", "[?]");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "[SKIP]");
pub static PIVOT: Emoji<'_, '_> = Emoji("🔄 ", "[RESTART]");
pub static PROGRESS: Emoji<'_, '_> = Emoji("📊 ", "[PROG]");
pub static PAUSE: Emoji<'_, '_> = Emoji("⏸️  ", "[PAUSE]");

pub fn status_icon(status: PhaseStatus) -> &'static Emoji<'static, 'static> {
    match status {
        PhaseStatus::Pending | PhaseStatus::Running => &RUNNING,
        PhaseStatus::Validating => &REVIEW,
        PhaseStatus::Completed => &CHECK,
        PhaseStatus::Failed => &CROSS,
        PhaseStatus::Blocked => &BLOCKER,
        PhaseStatus::AwaitingHuman => &HUMAN,
        PhaseStatus::Skipped => &SKIP,
    }
}

/// Plain single-character glyph for commit messages.
pub fn commit_glyph(status: PhaseStatus) -> &'static str {
    match status {
        PhaseStatus::Completed => "✓",
        PhaseStatus::AwaitingHuman => "?",
        PhaseStatus::Skipped => "-",
        PhaseStatus::Running | PhaseStatus::Validating | PhaseStatus::Pending => "↻",
        PhaseStatus::Failed | PhaseStatus::Blocked => "✗",
    }
}
