//! Container domain: inspect and log streaming.

use super::client::{DockerClient, DockerError};
use crate::runtime::{LineStream, LogOptions};
use crate::tracker::ContainerRecord;

use bollard::container::LogOutput;
use bollard::models::ContainerInspectResponse;
use bollard::query_parameters::LogsOptions;
use chrono::{DateTime, Utc};
use futures_util::stream::StreamExt;

impl DockerClient {
    /// Inspect a container by name or id. A 404 is reported as `Ok(None)`.
    pub async fn inspect_record(&self, name: &str) -> Result<Option<ContainerRecord>, DockerError> {
        match self.client.inspect_container(name, None).await {
            Ok(details) => Ok(Some(ContainerRecord::from(details))),
            Err(e) => match DockerError::not_found(name, e) {
                DockerError::ContainerNotFound(_) => Ok(None),
                other => Err(other),
            },
        }
    }

    /// Stream container logs (stdout and stderr) split into lines.
    pub fn stream_log_lines(&self, name: &str, options: LogOptions) -> Result<LineStream, DockerError> {
        let since = match options.since.as_deref() {
            Some(raw) => parse_since(raw, Utc::now())?,
            None => 0,
        };
        // NOTE: Bollard v0.20 requires i32 for since (Unix timestamps in seconds).
        if since > i32::MAX as i64 {
            tracing::warn!(since, "Log start exceeds i32 range, clamping");
        }
        let since = since.clamp(0, i32::MAX as i64) as i32;

        let logs_options = LogsOptions {
            follow: options.follow,
            stdout: true,
            stderr: true,
            since,
            until: 0,
            timestamps: false,
            tail: options.tail.unwrap_or_else(|| "all".to_string()),
        };

        let client = self.client.clone();
        let name = name.to_string();

        let lines = async_stream::stream! {
            let mut chunks = Box::pin(client.logs(&name, Some(logs_options)));
            let mut pending = String::new();
            while let Some(chunk) = chunks.next().await {
                let bytes = match chunk {
                    Ok(LogOutput::StdOut { message })
                    | Ok(LogOutput::StdErr { message })
                    | Ok(LogOutput::StdIn { message })
                    | Ok(LogOutput::Console { message }) => message,
                    Err(e) => {
                        yield Err(DockerError::not_found(&name, e));
                        return;
                    }
                };
                pending.push_str(&String::from_utf8_lossy(&bytes));
                while let Some(pos) = pending.find('\n') {
                    let line: String = pending.drain(..=pos).collect();
                    yield Ok(line.trim_end_matches(['\n', '\r']).to_string());
                }
            }
            if !pending.is_empty() {
                yield Ok(std::mem::take(&mut pending));
            }
        };

        Ok(Box::pin(lines))
    }
}

/// Parses a log start given as Unix seconds, RFC 3339 or a relative
/// duration (`30s`, `10m`, `2h`, `1d`) counted back from `now`.
pub fn parse_since(raw: &str, now: DateTime<Utc>) -> Result<i64, DockerError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(0);
    }
    if let Ok(secs) = raw.parse::<i64>() {
        return Ok(secs);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.timestamp());
    }

    let unit_len = raw.chars().last().map_or(0, char::len_utf8);
    let (amount, unit) = raw.split_at(raw.len() - unit_len);
    let amount: i64 = amount
        .parse()
        .map_err(|_| DockerError::InvalidSince(raw.to_string()))?;
    let scale = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        _ => return Err(DockerError::InvalidSince(raw.to_string())),
    };
    amount
        .checked_mul(scale)
        .and_then(|seconds| now.timestamp().checked_sub(seconds))
        .ok_or_else(|| DockerError::InvalidSince(raw.to_string()))
}

impl From<ContainerInspectResponse> for ContainerRecord {
    fn from(details: ContainerInspectResponse) -> Self {
        let state = details
            .state
            .as_ref()
            .and_then(|s| s.status.as_ref())
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".into());

        // Never-started containers report year 1
        let started_at = details
            .state
            .as_ref()
            .and_then(|s| s.started_at.as_deref())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|ts| ts.with_timezone(&Utc))
            .filter(|ts| ts.timestamp() > 0);

        let env = details
            .config
            .and_then(|c| c.env)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|entry| {
                entry
                    .split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect();

        let mut record = ContainerRecord::new(
            details.id.unwrap_or_default(),
            details
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            state,
        );
        record.started_at = started_at;
        record.env = env;
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::Phase;
    use bollard::models::{ContainerConfig, ContainerState, ContainerStateStatusEnum};

    #[test]
    fn test_parse_since_forms() {
        let now = DateTime::parse_from_rfc3339("2024-01-01T00:10:00Z")
            .unwrap()
            .with_timezone(&Utc);

        assert_eq!(parse_since("", now).unwrap(), 0);
        assert_eq!(parse_since("1700000000", now).unwrap(), 1_700_000_000);
        assert_eq!(
            parse_since("2024-01-01T00:00:00Z", now).unwrap(),
            now.timestamp() - 600
        );
        assert_eq!(parse_since("10m", now).unwrap(), now.timestamp() - 600);
        assert_eq!(parse_since("1h", now).unwrap(), now.timestamp() - 3600);
        assert!(parse_since("ten minutes", now).is_err());
        assert!(parse_since("5y", now).is_err());

        // Out-of-range durations are rejected rather than wrapped
        assert!(parse_since("200000000000000d", now).is_err());
        assert!(parse_since(&format!("{}h", i64::MAX), now).is_err());
        assert!(parse_since(&format!("{}s", i64::MIN), now).is_err());
    }

    #[test]
    fn test_record_from_inspect() {
        let details = ContainerInspectResponse {
            id: Some("abc123".into()),
            name: Some("/simnet_connext_1".into()),
            state: Some(ContainerState {
                status: Some(ContainerStateStatusEnum::RUNNING),
                started_at: Some("2024-01-01T00:00:00.123456789Z".into()),
                ..Default::default()
            }),
            config: Some(ContainerConfig {
                env: Some(vec![
                    "VECTOR_CONFIG={\"a\":1}".into(),
                    "PATH=/usr/bin".into(),
                    "EMPTY=".into(),
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let record = ContainerRecord::from(details);
        assert_eq!(record.id, "abc123");
        assert_eq!(record.name, "simnet_connext_1");
        assert_eq!(record.phase, Phase::Running);
        assert_eq!(record.state, "running");
        assert!(record.started_at.is_some());
        assert_eq!(record.getenv("VECTOR_CONFIG"), Some("{\"a\":1}"));
        assert_eq!(record.getenv("EMPTY"), Some(""));
    }

    #[test]
    fn test_never_started_container_has_no_start_time() {
        let details = ContainerInspectResponse {
            id: Some("abc123".into()),
            name: Some("/simnet_geth_1".into()),
            state: Some(ContainerState {
                status: Some(ContainerStateStatusEnum::CREATED),
                started_at: Some("0001-01-01T00:00:00Z".into()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let record = ContainerRecord::from(details);
        assert_eq!(record.phase, Phase::Created);
        assert!(record.started_at.is_none());
    }
}
