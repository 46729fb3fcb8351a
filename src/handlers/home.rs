use crate::state::AppState;
use actix_web::{http::header::ContentType, web, HttpResponse};

/// Plain HTML page telling people how to reach the stream endpoint.
pub async fn home_page(state: web::Data<AppState>) -> HttpResponse {
    let url = state.config.stream_url();

    let body = format!(
        r#"<html>
    <head><title>Voice Stream Gateway</title></head>
    <body>
        <h1>Voice Stream Gateway</h1>
        <p>Use a WebSocket client to connect to <code>{url}</code>.</p>
        <p>Send binary (audio) data frames and the server will respond with acknowledgments.</p>
    </body>
</html>
"#
    );

    HttpResponse::Ok()
        .content_type(ContentType::html())
        .body(body)
}
