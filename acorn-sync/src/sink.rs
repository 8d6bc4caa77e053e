//! Where a Tangle delivers records: another in-process Tree, or a Tree
//! exposed over the HTTP sync endpoint.

#[cfg(feature = "http-client")]
use std::time::Duration;

use acorn_core::{ImportOutcome, Nut, Payload, Tree};
use time::OffsetDateTime;

use crate::error::{SyncError, SyncResult};

/// Replication target. `push` applies one record via the sink's LWW import;
/// `pull_since` returns the sink's change feed from a cutoff.
pub trait TangleSink<T: Payload>: Send + Sync + 'static {
    fn describe(&self) -> String;
    fn push(&self, nut: &Nut<T>) -> SyncResult<ImportOutcome>;
    fn pull_since(&self, since: Option<OffsetDateTime>) -> SyncResult<Vec<Nut<T>>>;
}

/// Same-process sink: direct method calls into the target Tree.
pub struct TreeSink<T: Payload> {
    target: Tree<T>,
}

impl<T: Payload> TreeSink<T> {
    pub fn new(target: Tree<T>) -> Self {
        TreeSink { target }
    }
}

impl<T: Payload> TangleSink<T> for TreeSink<T> {
    fn describe(&self) -> String {
        "tree://in-process".into()
    }

    fn push(&self, nut: &Nut<T>) -> SyncResult<ImportOutcome> {
        Ok(self.target.import(nut.clone())?)
    }

    fn pull_since(&self, since: Option<OffsetDateTime>) -> SyncResult<Vec<Nut<T>>> {
        Ok(self.target.export_changes_since(since)?)
    }
}

/// HTTP sink against the sync endpoint (`POST /import`, `GET /export`).
///
/// The public sync API is blocking; requests run on a runtime owned by the
/// sink, so callers must not invoke it from inside an async context.
#[cfg(feature = "http-client")]
pub struct HttpSink {
    base_url: String,
    client: reqwest::Client,
    runtime: tokio::runtime::Runtime,
}

#[cfg(feature = "http-client")]
impl HttpSink {
    pub fn new(base_url: impl Into<String>) -> SyncResult<Self> {
        Self::with_timeout(base_url, Duration::from_secs(10))
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| SyncError::Transport(err.to_string()))?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| SyncError::Transport(err.to_string()))?;
        Ok(HttpSink {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            client,
            runtime,
        })
    }

    fn classify(err: reqwest::Error) -> SyncError {
        if err.is_timeout() {
            SyncError::Timeout
        } else if err.is_status() {
            SyncError::Remote(err.to_string())
        } else {
            SyncError::Transport(err.to_string())
        }
    }
}

#[cfg(feature = "http-client")]
impl<T: Payload> TangleSink<T> for HttpSink {
    fn describe(&self) -> String {
        self.base_url.clone()
    }

    #[tracing::instrument(skip(self, nut), fields(id = %nut.id))]
    fn push(&self, nut: &Nut<T>) -> SyncResult<ImportOutcome> {
        let url = format!("{}/import", self.base_url);
        let outcomes: Vec<ImportOutcome> = self.runtime.block_on(async {
            self.client
                .post(&url)
                .json(&[nut])
                .send()
                .await
                .map_err(Self::classify)?
                .error_for_status()
                .map_err(Self::classify)?
                .json()
                .await
                .map_err(Self::classify)
        })?;
        outcomes
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::Remote("empty import response".into()))
    }

    #[tracing::instrument(skip(self))]
    fn pull_since(&self, since: Option<OffsetDateTime>) -> SyncResult<Vec<Nut<T>>> {
        let url = format!("{}/export", self.base_url);
        self.runtime.block_on(async {
            let mut request = self.client.get(&url);
            if let Some(since) = since {
                let formatted = since
                    .format(&time::format_description::well_known::Rfc3339)
                    .map_err(|err| SyncError::Transport(err.to_string()))?;
                request = request.query(&[("since", formatted)]);
            }
            request
                .send()
                .await
                .map_err(Self::classify)?
                .error_for_status()
                .map_err(Self::classify)?
                .json()
                .await
                .map_err(Self::classify)
        })
    }
}
