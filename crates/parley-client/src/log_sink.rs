use tracing::debug;

use parley_types::api::ClientLogEntry;

use crate::http::ApiClient;

/// Ships client-side diagnostics to the server's log endpoint.
///
/// Strictly fire-and-forget: shipping happens on a spawned task and a
/// delivery failure is traced locally, never surfaced. Diagnostics must
/// not be able to break the feature they describe.
#[derive(Clone)]
pub struct LogSink {
    api: ApiClient,
    page: String,
}

impl LogSink {
    pub fn new(api: ApiClient, page: impl Into<String>) -> Self {
        Self {
            api,
            page: page.into(),
        }
    }

    pub fn info(&self, args: Vec<String>) {
        self.ship("info", args);
    }

    pub fn warn(&self, args: Vec<String>) {
        self.ship("warn", args);
    }

    pub fn error(&self, args: Vec<String>) {
        self.ship("error", args);
    }

    fn ship(&self, level: &str, args: Vec<String>) {
        let api = self.api.clone();
        let entry = ClientLogEntry {
            level: level.to_string(),
            args,
            page: self.page.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = api.send_log(&entry).await {
                debug!("client log delivery failed: {}", e);
            }
        });
    }
}
