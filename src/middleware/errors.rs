use crate::error::ErrorBody;
use actix_web::{
    body::MessageBody,
    dev::ServiceResponse,
    http::header::CONTENT_TYPE,
    middleware::{ErrorHandlerResponse, ErrorHandlers},
    HttpResponse, Result,
};

/// Rewrites framework-generated error responses into the `{error, code}` envelope.
///
/// Responses that are already JSON (raised through `AppError`) pass through untouched.
pub fn error_envelope<B>() -> ErrorHandlers<B>
where
    B: MessageBody + 'static,
{
    ErrorHandlers::new().default_handler(wrap_in_envelope)
}

fn wrap_in_envelope<B>(res: ServiceResponse<B>) -> Result<ErrorHandlerResponse<B>>
where
    B: MessageBody + 'static,
{
    let is_json = res
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map_or(false, |value| value.starts_with("application/json"));
    if is_json {
        return Ok(ErrorHandlerResponse::Response(res.map_into_left_body()));
    }

    let status = res.status();
    let message = match res.response().error() {
        Some(err) => err.to_string(),
        None => status.canonical_reason().unwrap_or("Error").to_string(),
    };
    let (req, _) = res.into_parts();
    let response = HttpResponse::build(status).json(ErrorBody {
        error: message,
        code: status.as_u16(),
    });

    Ok(ErrorHandlerResponse::Response(
        ServiceResponse::new(req, response).map_into_right_body(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, web, App};

    #[actix_web::test]
    async fn test_unknown_route_gets_envelope() {
        let app = test::init_service(
            App::new()
                .wrap(error_envelope())
                .route("/known", web::get().to(HttpResponse::Ok)),
        )
        .await;

        let req = test::TestRequest::get().uri("/missing").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::NOT_FOUND);
        let body: ErrorBody = test::read_body_json(resp).await;
        assert_eq!(body.code, 404);
        assert!(!body.error.is_empty());
    }

    #[actix_web::test]
    async fn test_payload_overflow_gets_envelope() {
        let app = test::init_service(
            App::new()
                .wrap(error_envelope())
                .app_data(web::PayloadConfig::new(4))
                .route("/echo", web::post().to(|body: web::Bytes| async move { HttpResponse::Ok().body(body) })),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/echo")
            .set_payload("0123456789")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::PAYLOAD_TOO_LARGE);
        let body: ErrorBody = test::read_body_json(resp).await;
        assert_eq!(body.code, 413);
    }
}
