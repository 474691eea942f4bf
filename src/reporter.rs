//! Reporter module: pushes probe results to the collection API.
//!
//! Reporting is best-effort. Each result is sent once with no retry, and
//! every failure is logged and swallowed so the scheduling loop never sees it.

use serde::Deserialize;
use url::Url;

use crate::probe::ProbeResult;

/// What happened to a single report. Callers are free to ignore it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOutcome {
    /// 200 with `{"ok": true}`.
    Accepted,
    /// 200 with `{"ok": false}`.
    Rejected,
    /// Any status other than 200.
    HttpStatus(u16),
    /// 200 with a body that is not the expected envelope.
    Malformed,
    /// The request could not be built or sent.
    Transport,
}

/// Response envelope returned by the collection API.
#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
}

/// Client for the collection API.
#[derive(Debug, Clone)]
pub struct Reporter {
    client: reqwest::Client,
    api_base: String,
}

impl Reporter {
    /// `api_base` is the URL report tokens are appended to.
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            // No client-side timeout: the transport defaults apply.
            client: reqwest::Client::new(),
            api_base: api_base.into(),
        }
    }

    /// Build `{api_base}/{token}?ping={ms}&status={status}&msg={message}`.
    ///
    /// The token is added as one escaped path segment.
    pub fn report_url(&self, token: &str, result: &ProbeResult) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(&self.api_base)?;
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .push(token);

        let ping = result.duration.as_millis().to_string();
        url.query_pairs_mut()
            .append_pair("ping", &ping)
            .append_pair("status", result.status.as_str())
            .append_pair("msg", &result.message);
        Ok(url)
    }

    /// Send one report and log anything that went wrong.
    pub async fn report(&self, token: &str, result: &ProbeResult) -> ReportOutcome {
        let url = match self.report_url(token, result) {
            Ok(url) => url,
            Err(e) => {
                tracing::error!("Cannot build report request for {}: {}", token, e);
                return ReportOutcome::Transport;
            }
        };

        let response = match self.client.get(url).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::error!("Cannot request API, detail: {}", e);
                return ReportOutcome::Transport;
            }
        };

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            tracing::error!(
                "\n-------------------------------------------------------------------\n\
                 API Error: HTTP Status Code: {} [ {}/{} ]\n\
                 -------------------------------------------------------------------",
                status.as_u16(),
                self.api_base,
                token
            );
            return ReportOutcome::HttpStatus(status.as_u16());
        }

        let body = match response.bytes().await {
            Ok(b) => b,
            Err(e) => {
                tracing::error!("Cannot read API response: {}", e);
                return ReportOutcome::Transport;
            }
        };

        match serde_json::from_slice::<ApiResponse>(&body) {
            Ok(ApiResponse { ok: true }) => ReportOutcome::Accepted,
            Ok(ApiResponse { ok: false }) => {
                tracing::error!("API response invalid: {}/{}", self.api_base, token);
                ReportOutcome::Rejected
            }
            Err(e) => {
                tracing::error!("Invalid API response: {}", e);
                ReportOutcome::Malformed
            }
        }
    }
}
