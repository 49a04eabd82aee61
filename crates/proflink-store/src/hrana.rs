use crate::{Artifact, ArtifactQuery, ArtifactStore, StoreError, StoreResult, valid_db_name};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use url::Url;

const SELECT_SQL: &str =
    "SELECT filename, content FROM profiles WHERE runner = ? AND dataset = ? AND name = ?";

/// Configuration for the remote Turso/libsql backend.
#[derive(Clone, Debug)]
pub struct HranaConfig {
    /// Database URL template. A `{db}` placeholder, if present, is replaced
    /// with the database name from the query, e.g.
    /// `libsql://{db}-myorg.turso.io`. `libsql://` is treated as `https://`.
    pub url_template: String,
    /// Bearer token sent with every request.
    pub auth_token: String,
    /// Whole-request timeout for one lookup.
    pub timeout: Duration,
}

impl Default for HranaConfig {
    fn default() -> Self {
        Self {
            url_template: String::new(),
            auth_token: String::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Remote backend speaking the libsql HTTP pipeline protocol, as served by
/// Turso. One `execute` + `close` pipeline per lookup; no session is kept.
pub struct HranaStore {
    client: Client,
    config: HranaConfig,
}

impl HranaStore {
    pub fn new(config: HranaConfig) -> Self {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("build http client");
        Self { client, config }
    }

    /// Resolve the pipeline endpoint for one database name.
    fn endpoint_for(&self, db: &str) -> StoreResult<String> {
        if !valid_db_name(db) {
            return Err(StoreError::InvalidDbName { db: db.into() });
        }
        let raw = self.config.url_template.replace("{db}", db);
        let base = match raw.strip_prefix("libsql://") {
            Some(rest) => format!("https://{rest}"),
            None => raw,
        };
        let parsed = Url::parse(&base).map_err(|e| StoreError::InvalidUrl {
            url: base.clone(),
            message: e.to_string(),
        })?;
        if parsed.scheme() != "https" && parsed.scheme() != "http" {
            return Err(StoreError::InvalidUrl {
                url: base,
                message: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }
        Ok(format!("{}/v2/pipeline", base.trim_end_matches('/')))
    }
}

#[async_trait]
impl ArtifactStore for HranaStore {
    async fn fetch(&self, query: &ArtifactQuery) -> StoreResult<Vec<Artifact>> {
        let endpoint = self.endpoint_for(&query.db)?;
        let payload = json!({
            "requests": [
                {
                    "type": "execute",
                    "stmt": {
                        "sql": SELECT_SQL,
                        "args": [
                            { "type": "text", "value": query.runner },
                            { "type": "text", "value": query.dataset },
                            { "type": "text", "value": query.name },
                        ],
                    },
                },
                { "type": "close" },
            ],
        });
        tracing::debug!(db = %query.db, runner = %query.runner, dataset = %query.dataset, name = %query.name, "hrana lookup");

        let http_err = |source| StoreError::Http {
            url: endpoint.clone(),
            source,
        };
        let resp = self
            .client
            .post(&endpoint)
            .bearer_auth(&self.config.auth_token)
            .json(&payload)
            .send()
            .await
            .map_err(http_err)?
            .error_for_status()
            .map_err(http_err)?;
        let body: PipelineResponse = resp.json().await.map_err(http_err)?;
        artifacts_from_pipeline(&query.db, body)
    }
}

/// Pull the artifact rows out of a decoded pipeline response. The first
/// result must belong to the `execute` step; the trailing `close` result is
/// ignored.
fn artifacts_from_pipeline(db: &str, body: PipelineResponse) -> StoreResult<Vec<Artifact>> {
    let malformed = |message: String| StoreError::Malformed {
        db: db.into(),
        message,
    };
    let first = body
        .results
        .into_iter()
        .next()
        .ok_or_else(|| malformed("empty results array".into()))?;
    let result = match first {
        PipelineResult::Ok {
            response: StepResponse::Execute { result },
        } => result,
        PipelineResult::Ok { .. } => {
            return Err(malformed("first result is not an execute response".into()));
        }
        PipelineResult::Error { error } => {
            return Err(StoreError::Rejected {
                db: db.into(),
                message: error.message,
            });
        }
    };

    let mut artifacts = Vec::with_capacity(result.rows.len());
    for row in result.rows {
        let mut cells = row.into_iter();
        let filename = match cells.next() {
            Some(Cell::Text { value }) => value,
            other => return Err(malformed(format!("expected text filename, got {other:?}"))),
        };
        let content = match cells.next() {
            Some(Cell::Blob { base64 }) => decode_blob(db, &base64)?,
            Some(Cell::Text { value }) => value.into_bytes(),
            other => return Err(malformed(format!("expected blob content, got {other:?}"))),
        };
        artifacts.push(Artifact { filename, content });
    }
    Ok(artifacts)
}

/// Hrana encodes blobs as unpadded standard base64; tolerate padded input.
fn decode_blob(db: &str, b64: &str) -> StoreResult<Vec<u8>> {
    STANDARD_NO_PAD
        .decode(b64.trim_end_matches('='))
        .map_err(|e| StoreError::Malformed {
            db: db.into(),
            message: format!("bad blob base64: {e}"),
        })
}

#[derive(Debug, Deserialize)]
struct PipelineResponse {
    results: Vec<PipelineResult>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum PipelineResult {
    Ok { response: StepResponse },
    Error { error: HranaErrorBody },
}

#[derive(Debug, Deserialize)]
struct HranaErrorBody {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum StepResponse {
    Execute { result: StmtResult },
    Close,
}

#[derive(Debug, Deserialize)]
struct StmtResult {
    #[serde(default)]
    rows: Vec<Vec<Cell>>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Cell {
    Null,
    Integer { value: String },
    Float { value: f64 },
    Text { value: String },
    Blob { base64: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(template: &str) -> HranaStore {
        HranaStore::new(HranaConfig {
            url_template: template.into(),
            auth_token: "tok".into(),
            timeout: Duration::from_secs(5),
        })
    }

    #[test]
    fn libsql_scheme_maps_to_https() {
        let store = store("libsql://{db}-myorg.turso.io");
        assert_eq!(
            store.endpoint_for("profiles").unwrap(),
            "https://profiles-myorg.turso.io/v2/pipeline"
        );
    }

    #[test]
    fn plain_http_base_is_kept() {
        let store = store("http://127.0.0.1:9090/");
        assert_eq!(
            store.endpoint_for("profiles").unwrap(),
            "http://127.0.0.1:9090/v2/pipeline"
        );
    }

    #[test]
    fn hostile_db_names_are_rejected() {
        let store = store("libsql://{db}-myorg.turso.io");
        assert!(matches!(
            store.endpoint_for("evil.com/"),
            Err(StoreError::InvalidDbName { .. })
        ));
    }

    #[test]
    fn unsupported_scheme_is_rejected() {
        let store = store("ftp://{db}.example.com");
        assert!(matches!(
            store.endpoint_for("profiles"),
            Err(StoreError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn decodes_text_and_blob_rows() {
        let raw = serde_json::json!({
            "baton": null,
            "base_url": null,
            "results": [
                {
                    "type": "ok",
                    "response": {
                        "type": "execute",
                        "result": {
                            "cols": [
                                { "name": "filename", "decltype": "TEXT" },
                                { "name": "content", "decltype": "BLOB" },
                            ],
                            "rows": [
                                [
                                    { "type": "text", "value": "warm.json.gz" },
                                    { "type": "blob", "base64": "aGVsbG8" },
                                ],
                                [
                                    { "type": "text", "value": "warm.json.syms.json" },
                                    { "type": "text", "value": "{}" },
                                ],
                            ],
                            "affected_row_count": 0,
                        },
                    },
                },
                { "type": "ok", "response": { "type": "close" } },
            ],
        });
        let body: PipelineResponse = serde_json::from_value(raw).unwrap();
        let rows = artifacts_from_pipeline("profiles", body).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].filename, "warm.json.gz");
        assert_eq!(rows[0].content, b"hello");
        assert_eq!(rows[1].content, b"{}");
    }

    #[test]
    fn padded_blob_base64_is_tolerated() {
        assert_eq!(decode_blob("profiles", "aGVsbG8=").unwrap(), b"hello");
    }

    #[test]
    fn error_result_surfaces_as_rejected() {
        let raw = serde_json::json!({
            "results": [
                {
                    "type": "error",
                    "error": { "message": "no such table: profiles", "code": "SQLITE_ERROR" },
                },
            ],
        });
        let body: PipelineResponse = serde_json::from_value(raw).unwrap();
        match artifacts_from_pipeline("profiles", body) {
            Err(StoreError::Rejected { message, .. }) => {
                assert!(message.contains("no such table"));
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[test]
    fn empty_row_set_is_ok() {
        let raw = serde_json::json!({
            "results": [
                { "type": "ok", "response": { "type": "execute", "result": { "rows": [] } } },
            ],
        });
        let body: PipelineResponse = serde_json::from_value(raw).unwrap();
        assert!(artifacts_from_pipeline("profiles", body).unwrap().is_empty());
    }
}
