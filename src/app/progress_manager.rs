//! Progress bars for transfer runs, fed by the pipeline's progress callback.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use mediarelay_core::{ProgressCallback, ProgressSnapshot};

const BAR_TEMPLATE: &str =
    "{prefix:>8} {msg:20!} [{bar:30}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";

/// One bar per (stage, item) pair, created on the first snapshot and removed
/// on the final one.
pub(crate) struct ProgressBars {
    multi: MultiProgress,
    active: Mutex<HashMap<String, ProgressBar>>,
}

impl ProgressBars {
    pub(crate) fn new(draw_target: ProgressDrawTarget) -> Arc<Self> {
        Arc::new(Self {
            multi: MultiProgress::with_draw_target(draw_target),
            active: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn callback(self: &Arc<Self>) -> ProgressCallback {
        let bars = Arc::clone(self);
        Arc::new(move |snapshot: &ProgressSnapshot| bars.update(snapshot))
    }

    fn update(&self, snapshot: &ProgressSnapshot) {
        let Ok(mut active) = self.active.lock() else {
            return;
        };
        let key = format!("{}:{}", snapshot.stage, snapshot.item_id);
        let bar = active
            .entry(key.clone())
            .or_insert_with(|| self.new_bar(snapshot));
        bar.set_position(snapshot.transferred.min(snapshot.total));

        if snapshot.finished
            && let Some(bar) = active.remove(&key)
        {
            bar.finish_and_clear();
        }
    }

    fn new_bar(&self, snapshot: &ProgressSnapshot) -> ProgressBar {
        let bar = self.multi.add(ProgressBar::new(snapshot.total));
        bar.set_style(
            ProgressStyle::with_template(BAR_TEMPLATE)
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bar.set_prefix(snapshot.stage.to_string());
        bar.set_message(snapshot.item_id.clone());
        bar
    }

    /// Drops bars left behind by interrupted items.
    pub(crate) fn clear(&self) {
        if let Ok(mut active) = self.active.lock() {
            for (_, bar) in active.drain() {
                bar.abandon();
            }
        }
        let _ = self.multi.clear();
    }

    #[cfg(test)]
    fn active_count(&self) -> usize {
        self.active.lock().map(|a| a.len()).unwrap_or(0)
    }
}
