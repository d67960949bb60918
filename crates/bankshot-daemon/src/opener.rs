//! URL opening on the workstation.

use tokio::sync::Mutex;

use bankshot_core::{Error, Result};

/// Hands URLs to the platform launcher (`xdg-open`, `open(1)`, …).
///
/// Calls are serialized so rapid-fire requests from a remote session don't
/// race the launcher; each returns as soon as the launcher is handed off.
/// URLs are passed through unvalidated — judging them is the browser's job.
pub struct UrlOpener {
    lock: Mutex<()>,
}

impl UrlOpener {
    pub fn new() -> Self {
        Self { lock: Mutex::new(()) }
    }

    pub async fn open(&self, url: &str) -> Result<()> {
        let _serialized = self.lock.lock().await;
        tracing::info!(url, "opening URL");

        let url = url.to_string();
        tokio::task::spawn_blocking(move || open::that(url))
            .await
            .map_err(|e| Error::Internal {
                message: format!("browser launcher task failed: {}", e),
            })?
            .map_err(|e| Error::Internal {
                message: format!("failed to open URL: {}", e),
            })
    }
}

impl Default for UrlOpener {
    fn default() -> Self {
        Self::new()
    }
}
