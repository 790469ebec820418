use crate::calls::CallLifecycleService;
use crate::error::{AppError, AppResult};
use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

/// Fields the provider posts when a call comes in.
#[derive(Debug, Deserialize)]
pub struct IncomingCallForm {
    #[serde(rename = "CallSid")]
    call_sid: String,
    #[serde(rename = "From")]
    from: String,
    #[serde(rename = "To")]
    to: String,
}

/// Stream lifecycle notification posted by the provider.
#[derive(Debug, Deserialize)]
pub struct StatusCallbackForm {
    #[serde(rename = "CallSid")]
    call_sid: String,
    #[serde(rename = "StreamEvent")]
    stream_event: Option<String>,
}

fn connect_stream_xml(host: &str, call_sid: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Response>
    <Connect>
        <Stream url="wss://{}/calls/media/{}" statusCallback="https://{}/calls/status" statusCallbackMethod="POST" />
    </Connect>
</Response>"#,
        host, call_sid, host
    )
}

/// Incoming call webhook. Accepts both POST form bodies and GET query
/// strings, because the provider's webhook method is account configuration.
pub async fn incoming_call(
    req: HttpRequest,
    payload: web::Either<web::Form<IncomingCallForm>, web::Query<IncomingCallForm>>,
    lifecycle: web::Data<CallLifecycleService>,
) -> AppResult<HttpResponse> {
    let form = match payload {
        web::Either::Left(form) => form.into_inner(),
        web::Either::Right(query) => query.into_inner(),
    };

    if form.call_sid.trim().is_empty() || form.from.trim().is_empty() || form.to.trim().is_empty() {
        return Err(AppError::BadRequest(
            "CallSid, From, and To are required".to_string(),
        ));
    }

    lifecycle
        .create_call(&form.call_sid, &form.from, &form.to)
        .await;

    // Answer with connect instructions pointing back at our media endpoint.
    let host = req.connection_info().host().to_string();
    let xml = connect_stream_xml(&host, &form.call_sid);

    Ok(HttpResponse::Ok().content_type("application/xml").body(xml))
}

pub async fn call_status(
    form: web::Form<StatusCallbackForm>,
    lifecycle: web::Data<CallLifecycleService>,
) -> AppResult<HttpResponse> {
    let event = form.stream_event.as_deref().unwrap_or("");
    debug!(call_sid = %form.call_sid, event = %event, "Stream status callback");

    let cleanup_triggered = lifecycle.handle_status_callback(&form.call_sid, event).await;

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "cleanup_triggered": cleanup_triggered
    })))
}

pub async fn get_call(
    path: web::Path<String>,
    lifecycle: web::Data<CallLifecycleService>,
) -> AppResult<HttpResponse> {
    let call_sid = path.into_inner();

    match lifecycle.call_by_sid(&call_sid).await? {
        Some(record) => Ok(HttpResponse::Ok().json(record)),
        None => Err(AppError::NotFound(format!("Call {} not found", call_sid))),
    }
}
