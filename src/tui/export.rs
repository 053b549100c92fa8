use crate::model::RunReport;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;
use std::sync::OnceLock;
use std::time::Duration;

use super::state::UiState;

// Global clipboard manager channel - initialized once on first use
static CLIPBOARD_SENDER: OnceLock<std_mpsc::Sender<String>> = OnceLock::new();

fn finished_report(state: &UiState) -> Result<RunReport> {
    state.last_report.clone().context("no finished run yet")
}

/// Save the last finished run to the default auto-save location.
pub fn save_and_show_path(state: &mut UiState) {
    let res = finished_report(state).and_then(|r| crate::storage::save_run(&r));
    state.info = match res {
        Ok(path) => format!("Saved: {}", path.display()),
        Err(e) => format!("Save failed: {e:#}"),
    };
}

/// Export the last finished run as CSV into the current directory.
pub fn export_csv_here(state: &mut UiState) {
    let res = finished_report(state).and_then(|r| {
        let dir = std::env::current_dir().context("get current directory")?;
        let path: PathBuf = dir.join(crate::storage::default_export_name(&r, "csv"));
        crate::storage::export_csv(&path, &r)?;
        Ok(path)
    });
    state.info = match res {
        Ok(path) => format!("Exported CSV: {}", path.display()),
        Err(e) => format!("Export failed: {e:#}"),
    };
}

/// Copy the text summary of the last finished run.
pub fn copy_summary(state: &mut UiState) {
    let res = finished_report(state).and_then(|r| {
        let text = crate::text_summary::build_text_summary(&r).lines.join("\n");
        copy_to_clipboard(&text)
    });
    state.info = match res {
        Ok(()) => "Summary copied to clipboard".into(),
        Err(e) => format!("Copy failed: {e:#}"),
    };
}

/// Initialize the clipboard manager thread if not already initialized.
/// Each clipboard instance is kept alive for a while so clipboard managers
/// on Linux can read the contents.
fn init_clipboard_manager() -> Result<&'static std_mpsc::Sender<String>> {
    CLIPBOARD_SENDER.get_or_init(|| {
        let (tx, rx) = std_mpsc::channel::<String>();

        std::thread::spawn(move || {
            use arboard::Clipboard;

            for text in rx {
                match Clipboard::new() {
                    Ok(mut clipboard) => {
                        if clipboard.set_text(&text).is_ok() {
                            std::thread::sleep(Duration::from_secs(2));
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "clipboard unavailable"),
                }
            }
        });

        tx
    });

    CLIPBOARD_SENDER
        .get()
        .ok_or_else(|| anyhow::anyhow!("Failed to initialize clipboard manager"))
}

/// Queue text for the clipboard without blocking the UI thread.
pub fn copy_to_clipboard(text: &str) -> Result<()> {
    let sender = init_clipboard_manager()?;
    sender
        .send(text.to_string())
        .map_err(|_| anyhow::anyhow!("Clipboard manager channel closed"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saving_without_a_finished_run_reports_it() {
        let mut st = UiState::default();
        save_and_show_path(&mut st);
        assert_eq!(st.info, "Save failed: no finished run yet");
    }
}
