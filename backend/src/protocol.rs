//! Newline-delimited JSON protocol spoken by the inference worker.
//!
//! Each non-blank input line is one request and produces exactly one response
//! line. Per-line failures, including lines that are not UTF-8, become error
//! responses; only end of input, a broken stream or a configuration error stops
//! the loop.

use std::io::{BufRead, Write};

use serde_json::Value;
use shared::{Prediction, WorkerRequest, WorkerResponse};

use crate::dispatch::DispatchPool;
use crate::error::TaggerError;
use crate::request::{PredictionRequest, display_name, load_image};

pub trait RequestHandler {
    fn handle(&self, request: &PredictionRequest) -> Result<Vec<Prediction>, TaggerError>;
}

/// Reads image files from disk and tags them through the dispatch pool.
pub struct PoolHandler<'a> {
    pool: &'a DispatchPool,
}

impl<'a> PoolHandler<'a> {
    pub fn new(pool: &'a DispatchPool) -> Self {
        Self { pool }
    }
}

impl RequestHandler for PoolHandler<'_> {
    fn handle(&self, request: &PredictionRequest) -> Result<Vec<Prediction>, TaggerError> {
        let images = request
            .files
            .iter()
            .map(|path| load_image(path))
            .collect::<Result<Vec<_>, _>>()?;
        let tags = self.pool.predict(&images, request.threshold, request.limit)?;

        Ok(request
            .files
            .iter()
            .zip(tags)
            .map(|(path, tags)| Prediction {
                filename: display_name(path),
                tags,
            })
            .collect())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ServeSummary {
    pub handled: usize,
    pub failed: usize,
}

pub fn serve<R, W, H>(reader: R, mut writer: W, handler: &H) -> Result<ServeSummary, TaggerError>
where
    R: BufRead,
    W: Write,
    H: RequestHandler + ?Sized,
{
    let mut summary = ServeSummary::default();

    for raw in reader.split(b'\n') {
        let raw = raw?;
        let decoded = std::str::from_utf8(&raw).map_err(|e| {
            TaggerError::Protocol(format!("request line is not valid UTF-8: {}", e))
        });
        if decoded.as_ref().is_ok_and(|line| line.trim().is_empty()) {
            continue;
        }

        let outcome = decoded
            .map_err(|e| (Value::Null, e))
            .and_then(|line| process_line(line.trim(), handler));
        let (response, fatal) = match outcome {
            Ok(response) => (response, None),
            Err((id, err)) => {
                log::error!("Request {} failed: {}", id, err.describe());
                summary.failed += 1;
                let response = WorkerResponse::Failure {
                    id,
                    error: err.describe(),
                };
                (response, err.is_fatal().then_some(err))
            }
        };
        summary.handled += 1;

        serde_json::to_writer(&mut writer, &response).map_err(std::io::Error::from)?;
        writer.write_all(b"\n")?;
        writer.flush()?;

        if let Some(err) = fatal {
            return Err(err);
        }
    }

    Ok(summary)
}

fn process_line<H>(line: &str, handler: &H) -> Result<WorkerResponse, (Value, TaggerError)>
where
    H: RequestHandler + ?Sized,
{
    let value: Value =
        serde_json::from_str(line).map_err(|e| (Value::Null, TaggerError::from(e)))?;
    let id = value.get("id").cloned().unwrap_or(Value::Null);

    let request = serde_json::from_value::<WorkerRequest>(value)
        .map_err(TaggerError::from)
        .and_then(PredictionRequest::try_from)
        .map_err(|e| (id.clone(), e))?;
    let predictions = handler.handle(&request).map_err(|e| (id.clone(), e))?;

    Ok(WorkerResponse::Success { id, predictions })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct Echo;

    impl RequestHandler for Echo {
        fn handle(&self, request: &PredictionRequest) -> Result<Vec<Prediction>, TaggerError> {
            if request.limit == 13 {
                return Err(TaggerError::Model("unlucky".into()));
            }
            Ok(request
                .files
                .iter()
                .map(|path| Prediction {
                    filename: display_name(path),
                    tags: Default::default(),
                })
                .collect())
        }
    }

    fn run(input: &str) -> (Vec<String>, Result<ServeSummary, TaggerError>) {
        run_bytes(input.as_bytes())
    }

    fn run_bytes(input: &[u8]) -> (Vec<String>, Result<ServeSummary, TaggerError>) {
        let mut out = Vec::new();
        let result = serve(Cursor::new(input), &mut out, &Echo);
        let lines = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect();
        (lines, result)
    }

    #[test]
    fn empty_file_list_yields_empty_predictions() {
        let (lines, _) = run("{\"id\":\"a\",\"files\":[],\"threshold\":0.2,\"limit\":5}\n");
        assert_eq!(lines, vec![r#"{"id":"a","predictions":[]}"#]);
    }

    #[test]
    fn blank_lines_produce_no_output() {
        let (lines, result) = run("\n   \n{\"id\":1}\n\n");
        assert_eq!(lines, vec![r#"{"id":1,"predictions":[]}"#]);
        assert_eq!(result.unwrap().handled, 1);
    }

    #[test]
    fn malformed_lines_do_not_stop_the_stream() {
        let input = "not json\n{\"id\":2,\"limit\":-1}\n[1,2]\n{\"id\":3,\"files\":[\"x/y.png\"]}\n";
        let (lines, result) = run(input);
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with(r#"{"id":null,"error":"ProtocolError: "#));
        assert!(lines[1].starts_with(r#"{"id":2,"error":"InputError: "#));
        assert!(lines[2].starts_with(r#"{"id":null,"error":"ProtocolError: "#));
        assert_eq!(
            lines[3],
            r#"{"id":3,"predictions":[{"filename":"y.png","tags":{}}]}"#
        );
        assert_eq!(
            result.unwrap(),
            ServeSummary {
                handled: 4,
                failed: 3
            }
        );
    }

    #[test]
    fn invalid_utf8_lines_get_an_error_response() {
        let (lines, result) = run_bytes(b"{\"id\":\"a\"}\n\xff\xfe garbage\n{\"id\":\"b\"}\n");
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], r#"{"id":"a","predictions":[]}"#);
        assert!(lines[1].starts_with(r#"{"id":null,"error":"ProtocolError: "#));
        assert_eq!(lines[2], r#"{"id":"b","predictions":[]}"#);
        assert_eq!(
            result.unwrap(),
            ServeSummary {
                handled: 3,
                failed: 1
            }
        );
    }

    #[test]
    fn crlf_line_endings_are_accepted() {
        let (lines, _) = run("{\"id\":\"w\"}\r\n\r\n");
        assert_eq!(lines, vec![r#"{"id":"w","predictions":[]}"#]);
    }

    #[test]
    fn handler_errors_keep_the_request_id() {
        let (lines, _) = run("{\"id\":{\"job\":9},\"limit\":13}\n{\"id\":\"next\"}\n");
        assert_eq!(lines[0], r#"{"id":{"job":9},"error":"ModelError: unlucky"}"#);
        assert_eq!(lines[1], r#"{"id":"next","predictions":[]}"#);
    }

    #[test]
    fn invalid_threshold_is_an_input_error() {
        let (lines, _) = run("{\"id\":\"t\",\"threshold\":4.0}\n");
        assert!(lines[0].starts_with(r#"{"id":"t","error":"InputError: "#));
    }
}
