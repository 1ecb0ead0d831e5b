//! Terminal output: a progress bar fed by generation events, and colored
//! summaries.
//!
//! The bar only ever sees [`GenerationEvent`]s from the channel, never the
//! orchestrator itself.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::batch::{BatchCounts, BatchResult};
use crate::events::{EventReceiver, GenerationEvent};
use crate::graph::{NodeState, SkipReason};
use crate::orchestrator::NoteOutcome;

pub struct BatchProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl BatchProgress {
    /// Start a bar over `total` fields.
    pub fn start(total: u64, label: &str) -> Self {
        let pb = ProgressBar::new(total);
        pb.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg} [{bar:30.cyan/blue}] {pos}/{len}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        pb.set_message(label.to_string());
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    pub fn observe(&self, event: &GenerationEvent) {
        match event {
            GenerationEvent::NodeStarted { note_id, field, .. } => {
                self.pb.set_message(format!("{note_id}:{field}"));
            }
            GenerationEvent::NodeSucceeded { .. } => self.pb.inc(1),
            GenerationEvent::NodeFailed {
                note_id,
                field,
                error,
                ..
            } => {
                self.pb.inc(1);
                self.pb.println(format!(
                    "  {} {note_id}:{field} {error}",
                    self.red.apply_to("✗")
                ));
            }
            GenerationEvent::NodeSkipped { .. } => self.pb.inc(1),
            GenerationEvent::NoteRejected { note_id, error, .. } => {
                self.pb.println(format!(
                    "  {} note {note_id} rejected: {error}",
                    self.yellow.apply_to("!")
                ));
            }
            GenerationEvent::BatchCompleted { counts, cancelled, .. } => {
                let style = if counts.failed == 0 { &self.green } else { &self.red };
                let suffix = if *cancelled { " (cancelled)" } else { "" };
                self.pb.set_message(format!(
                    "{}{suffix}",
                    style.apply_to(format_counts(counts))
                ));
            }
        }
    }

    /// Render events until every sender is gone.
    pub async fn follow(self, mut events: EventReceiver) -> Self {
        while let Some(event) = events.recv().await {
            self.observe(&event);
        }
        self
    }

    pub fn finish(&self) {
        self.pb.finish_and_clear();
    }
}

fn format_counts(counts: &BatchCounts) -> String {
    format!(
        "{} succeeded, {} failed, {} skipped",
        counts.succeeded, counts.failed, counts.skipped
    )
}

fn state_line(state: &NodeState) -> String {
    let green = Style::new().green().bold();
    let red = Style::new().red().bold();
    let dim = Style::new().dim();
    match state {
        NodeState::Done => format!("{}", green.apply_to("✓ done")),
        NodeState::Failed(failure) => format!("{} {failure}", red.apply_to("✗ failed:")),
        NodeState::Skipped(SkipReason::AlreadyFilled) => {
            format!("{}", dim.apply_to("– already filled"))
        }
        NodeState::Skipped(reason) => {
            format!("{}", Style::new().yellow().apply_to(format!("– skipped ({reason})")))
        }
        other => other.to_string(),
    }
}

/// Per-field status list for one note.
pub fn print_note_outcome(outcome: &NoteOutcome) {
    println!("Note {}", Style::new().bold().apply_to(outcome.note_id));
    for field in &outcome.fields {
        println!("  [{}] {:<16} {}", field.layer, field.field, state_line(&field.state));
    }
}

pub fn print_batch_summary(result: &BatchResult) {
    let counts = &result.counts;
    let style = if counts.failed == 0 {
        Style::new().green().bold()
    } else {
        Style::new().red().bold()
    };
    println!();
    println!("{}", style.apply_to(format_counts(counts)));
    if !result.rejected.is_empty() {
        println!(
            "{}",
            Style::new()
                .yellow()
                .apply_to(format!("{} note(s) rejected", result.rejected.len()))
        );
        for (note_id, err) in &result.rejected {
            println!("  {note_id}: {err}");
        }
    }
    if !result.aborted.is_empty() {
        println!(
            "{}",
            Style::new()
                .red()
                .apply_to(format!("{} note(s) aborted", result.aborted.len()))
        );
        for (note_id, err) in &result.aborted {
            println!("  {note_id}: {err}");
        }
    }
    if result.cancelled {
        println!(
            "{}",
            Style::new().yellow().apply_to(format!(
                "cancelled, {} note(s) not processed",
                result.unprocessed.len()
            ))
        );
    }
    if !result.undo.is_empty() {
        println!(
            "{} field(s) written, undoable as one step",
            result.undo.written().len()
        );
    }
}
