use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use actix_multipart::Multipart;
use actix_web::dev::ServerHandle;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, web};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures_util::{StreamExt, TryStreamExt};
use log::error;
use parking_lot::Mutex;
use shared::{
    DEFAULT_LIMIT, DEFAULT_THRESHOLD, ErrorBody, HealthResponse, OutputFormat, Prediction,
};
use tokio::sync::Semaphore;

use crate::dispatch::DispatchPool;
use crate::error::TaggerError;
use crate::request::{decode_image, parse_limit, parse_threshold};

pub struct AppState {
    pub pool: Arc<DispatchPool>,
    pub inflight: Semaphore,
    pub max_upload_bytes: u64,
    halted: Mutex<Option<String>>,
    server: Mutex<Option<ServerHandle>>,
}

impl AppState {
    pub fn new(pool: Arc<DispatchPool>, max_inflight: usize, max_upload_bytes: u64) -> Self {
        Self {
            pool,
            inflight: Semaphore::new(max_inflight.max(1)),
            max_upload_bytes,
            halted: Mutex::new(None),
            server: Mutex::new(None),
        }
    }

    /// Server to stop once a fatal error has been answered.
    pub fn attach_server(&self, handle: ServerHandle) {
        *self.server.lock() = Some(handle);
    }

    /// Reason the service stopped accepting work, if it has.
    pub fn halted(&self) -> Option<String> {
        self.halted.lock().clone()
    }

    fn halt(&self, err: &TaggerError) {
        let mut halted = self.halted.lock();
        if halted.is_some() {
            return;
        }
        *halted = Some(err.describe());
        error!("Fatal error, shutting down: {}", err.describe());

        if let Some(handle) = self.server.lock().clone() {
            actix_web::rt::spawn(async move {
                handle.stop(true).await;
            });
        }
    }
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/").route(web::get().to(index)))
        .service(web::resource("/evaluate").route(web::post().to(evaluate)))
        .service(web::resource("/healthz").route(web::get().to(health)));
}

struct Upload {
    filename: String,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct EvaluateForm {
    uploads: Vec<Upload>,
    fields: HashMap<String, String>,
}

async fn index() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(INDEX_HTML)
}

async fn health(state: web::Data<AppState>) -> HttpResponse {
    let (status, code) = match state.halted() {
        Some(_) => ("halted", StatusCode::SERVICE_UNAVAILABLE),
        None => ("ok", StatusCode::OK),
    };
    HttpResponse::build(code).json(HealthResponse {
        status: status.to_string(),
        mode: state.pool.mode(),
        replicas: state.pool.replica_count(),
    })
}

async fn evaluate(
    state: web::Data<AppState>,
    query: web::Query<HashMap<String, String>>,
    payload: Multipart,
) -> HttpResponse {
    let mut fields = query.into_inner();
    let requested = requested_format(&fields);

    if let Some(reason) = state.halted() {
        let err = TaggerError::Config(format!("service halted after {}", reason));
        return error_response(requested, &err);
    }

    let _permit = match state.inflight.acquire().await {
        Ok(permit) => permit,
        Err(e) => {
            let err = TaggerError::Model(format!("evaluate queue closed: {}", e));
            return error_response(requested, &err);
        }
    };

    let form = match read_form(payload, state.max_upload_bytes).await {
        Ok(form) => form,
        Err(err) => return error_response(requested, &err),
    };
    fields.extend(form.fields);

    let format = match OutputFormat::from_str(&requested_format(&fields)) {
        Ok(format) => format,
        Err(_) => {
            let err = TaggerError::Input("format must be html or json".into());
            return error_response(String::from("json"), &err);
        }
    };

    match run_evaluation(&state, &fields, &form.uploads).await {
        Ok(predictions) => match format {
            OutputFormat::Json => HttpResponse::Ok().json(predictions),
            OutputFormat::Html => HttpResponse::Ok()
                .content_type("text/html; charset=utf-8")
                .body(render_results(&form.uploads, &predictions)),
        },
        Err(err) => {
            if err.is_fatal() {
                state.halt(&err);
            }
            error_response(format.to_string(), &err)
        }
    }
}

async fn run_evaluation(
    state: &AppState,
    fields: &HashMap<String, String>,
    uploads: &[Upload],
) -> Result<Vec<Prediction>, TaggerError> {
    let threshold = field(fields, "threshold")
        .map(parse_threshold)
        .transpose()?
        .unwrap_or(DEFAULT_THRESHOLD);
    let limit = field(fields, "limit")
        .map(parse_limit)
        .transpose()?
        .unwrap_or(DEFAULT_LIMIT);
    if uploads.is_empty() {
        return Err(TaggerError::Input("at least one file is required".into()));
    }

    let images = uploads
        .iter()
        .map(|upload| decode_image(&upload.bytes))
        .collect::<Result<Vec<_>, _>>()?;

    let pool = Arc::clone(&state.pool);
    let tags = web::block(move || pool.predict(&images, threshold, limit))
        .await
        .map_err(|e| TaggerError::Model(format!("inference task failed: {}", e)))??;

    Ok(uploads
        .iter()
        .zip(tags)
        .map(|(upload, tags)| Prediction {
            filename: upload.filename.clone(),
            tags,
        })
        .collect())
}

async fn read_form(mut payload: Multipart, max_bytes: u64) -> Result<EvaluateForm, TaggerError> {
    let mut form = EvaluateForm::default();
    let mut total: u64 = 0;

    while let Some(mut field) = payload
        .try_next()
        .await
        .map_err(|e| TaggerError::Input(format!("invalid multipart body: {}", e)))?
    {
        let disposition = field.content_disposition().cloned();
        let name = disposition
            .as_ref()
            .and_then(|cd| cd.get_name())
            .unwrap_or_default()
            .to_string();
        let filename = disposition
            .as_ref()
            .and_then(|cd| cd.get_filename())
            .map(str::to_string);

        let mut data = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk =
                chunk.map_err(|e| TaggerError::Input(format!("invalid multipart body: {}", e)))?;
            total += chunk.len() as u64;
            if total > max_bytes {
                return Err(TaggerError::TooLarge(format!(
                    "request body exceeds {} bytes",
                    max_bytes
                )));
            }
            data.extend_from_slice(&chunk);
        }

        if name == "file" {
            if data.is_empty() {
                continue;
            }
            let filename = filename.unwrap_or_else(|| format!("upload-{}", form.uploads.len()));
            form.uploads.push(Upload {
                filename,
                bytes: data,
            });
        } else if !name.is_empty() {
            let value = String::from_utf8_lossy(&data).trim().to_string();
            form.fields.insert(name, value);
        }
    }

    Ok(form)
}

fn requested_format(fields: &HashMap<String, String>) -> String {
    fields
        .get("format")
        .map(|f| f.trim().to_lowercase())
        .filter(|f| !f.is_empty())
        .unwrap_or_else(|| OutputFormat::Html.to_string())
}

/// Non-blank value of a form or query field.
fn field<'a>(fields: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    fields
        .get(key)
        .map(|raw| raw.trim())
        .filter(|raw| !raw.is_empty())
}

fn status_for(err: &TaggerError) -> StatusCode {
    match err {
        TaggerError::Input(_) | TaggerError::Protocol(_) | TaggerError::Image(_) => {
            StatusCode::BAD_REQUEST
        }
        TaggerError::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
        TaggerError::DeviceFault(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(format: String, err: &TaggerError) -> HttpResponse {
    let status = status_for(err);
    if status.is_server_error() {
        error!("Evaluate failed: {}", err.describe());
    }

    if format == OutputFormat::Html.to_string() {
        HttpResponse::build(status)
            .content_type("text/html; charset=utf-8")
            .body(render_error(err))
    } else {
        HttpResponse::build(status).json(ErrorBody {
            error: err.classification().to_string(),
            message: err.to_string(),
        })
    }
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Autotagger</title></head>
<body>
<form action="/evaluate" method="post" enctype="multipart/form-data">
<input type="file" name="file" multiple>
<label>Threshold <input type="text" name="threshold" value="0.1"></label>
<label>Limit <input type="text" name="limit" value="50"></label>
<select name="format"><option value="html">html</option><option value="json">json</option></select>
<button type="submit">Submit</button>
</form>
</body>
</html>
"#;

fn render_results(uploads: &[Upload], predictions: &[Prediction]) -> String {
    let mut body = String::from(
        "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>Autotagger</title></head>\n<body>\n",
    );
    for (upload, prediction) in uploads.iter().zip(predictions) {
        let mime = image::guess_format(&upload.bytes)
            .map(|format| format.to_mime_type())
            .unwrap_or("application/octet-stream");
        body.push_str(&format!(
            "<section>\n<img src=\"data:{};base64,{}\" alt=\"{}\">\n<ul>\n",
            mime,
            STANDARD.encode(&upload.bytes),
            escape_html(&prediction.filename)
        ));
        for (tag, score) in prediction.tags.iter() {
            body.push_str(&format!(
                "<li>{} <span>{:.0}%</span></li>\n",
                escape_html(tag),
                score * 100.0
            ));
        }
        let mut names: Vec<&str> = prediction.tags.tags().collect();
        names.sort_unstable();
        body.push_str(&format!(
            "</ul>\n<textarea readonly>{}</textarea>\n</section>\n",
            escape_html(&names.join(" "))
        ));
    }
    body.push_str("</body>\n</html>\n");
    body
}

fn render_error(err: &TaggerError) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>Error</title></head>\n<body>\n<h1>{}</h1>\n<p>{}</p>\n</body>\n</html>\n",
        escape_html(err.classification()),
        escape_html(&err.to_string())
    )
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}
