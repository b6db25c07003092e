//! Client for the first-party analytics collector: one record per page view and one per visit.
use std::time;

use reqwest::header;
use serde::Serialize;
use tracing::{debug, warn};

use crate::metrics_consts::ANALYTICS_POSTS_TOTAL;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageViewRecord {
    pub page_url: String,
    pub page_title: Option<String>,
    pub referrer_url: Option<String>,
    pub session_id: String,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VisitDurationRecord {
    pub session_id: String,
    /// Seconds.
    pub visit_duration: u64,
}

#[derive(Clone)]
pub struct AnalyticsClient {
    base_url: String,
    client: reqwest::Client,
}

impl AnalyticsClient {
    pub fn new(base_url: &str, request_timeout: time::Duration) -> Result<Self, reqwest::Error> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("pixel-tracker analytics")
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            client,
        })
    }

    /// Post a page view in the background.
    pub fn record_page_view(&self, record: PageViewRecord) {
        self.post("page_views", record);
    }

    /// Post the visit duration beacon in the background.
    pub fn record_visit_duration(&self, record: VisitDurationRecord) {
        self.post("visit_durations", record);
    }

    fn post<T: Serialize + Send + 'static>(&self, kind: &'static str, record: T) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(kind, "no runtime to post analytics record, dropping it");
            metrics::counter!(ANALYTICS_POSTS_TOTAL, "kind" => kind, "outcome" => "dropped")
                .increment(1);
            return;
        };

        let request = self
            .client
            .post(format!("{}/{}", self.base_url, kind))
            .json(&record);

        runtime.spawn(async move {
            let outcome = match request.send().await.and_then(|r| r.error_for_status()) {
                Ok(_) => {
                    debug!(kind, "analytics record posted");
                    "ok"
                }
                Err(error) => {
                    warn!(kind, %error, "failed to post analytics record");
                    "error"
                }
            };
            metrics::counter!(ANALYTICS_POSTS_TOTAL, "kind" => kind, "outcome" => outcome)
                .increment(1);
        });
    }
}
