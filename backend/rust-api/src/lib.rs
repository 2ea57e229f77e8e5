#![allow(dead_code)]

use axum::{
    extract::Request,
    http::{header, HeaderValue, Method},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub mod config;
pub mod extractors;
pub mod handlers;
pub mod metrics;
pub mod middlewares;
pub mod models;
pub mod services;
pub mod utils;

pub use config::Config;
pub use services::AppState;

/// CSP middleware adds Content-Security-Policy header to all responses
async fn csp_middleware(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    response.headers_mut().insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static(
            "default-src 'self'; \
             script-src 'self' 'unsafe-inline'; \
             style-src 'self' 'unsafe-inline'; \
             img-src 'self' data: https:; \
             connect-src 'self'",
        ),
    );
    response
}

pub fn create_router(app_state: std::sync::Arc<services::AppState>) -> Router {
    // CORS configuration for the play surface (the player web app lives on
    // another origin)
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_origin(tower_http::cors::Any); // TODO: restrict to specific origins in production

    Router::new()
        // Public endpoints (no auth required)
        .route("/health", get(handlers::health_check))
        // Metrics endpoint with Basic Auth protection
        .route(
            "/metrics",
            get(handlers::metrics_handler)
                .layer(middleware::from_fn(handlers::metrics_auth_middleware)),
        )
        // Student play surface (link token / play session based, no account login)
        .nest(
            "/api/v1/play",
            play_routes(app_state.clone()).layer(cors),
        )
        // Teacher assignment surface (requires JWT from the platform identity service)
        .nest(
            "/api/v1/assignments",
            assignment_routes(app_state.clone()).layer(middleware::from_fn_with_state(
                app_state.clone(),
                middlewares::auth::auth_middleware,
            )),
        )
        .with_state(app_state)
        .layer(middleware::from_fn(csp_middleware)) // Apply CSP to all responses
        .layer(middleware::from_fn(
            middlewares::trace::trace_context_middleware,
        ))
        .layer(middleware::from_fn(
            middlewares::metrics::metrics_middleware,
        ))
        .layer(TraceLayer::new_for_http())
}

fn play_routes(
    app_state: std::sync::Arc<services::AppState>,
) -> Router<std::sync::Arc<services::AppState>> {
    // Resolution and the bypass are plain routes; sign-in endpoints cost an
    // email each and get their own limiter; attempt recording requires the
    // play-session JWT minted by the session authenticator.
    let open_routes = Router::new()
        .route("/resolve", get(handlers::play::resolve))
        .route("/bypass", post(handlers::play::bypass));

    let signin_routes = Router::new()
        .route("/signin", post(handlers::play::signin))
        .route("/signin/complete", post(handlers::play::complete_signin))
        .route_layer(middleware::from_fn_with_state(
            app_state.clone(),
            middlewares::rate_limit::signin_rate_limit_middleware,
        ));

    let session_routes = Router::new()
        .route("/attempts", post(handlers::play::record_attempt))
        .route_layer(middleware::from_fn_with_state(
            app_state.clone(),
            middlewares::auth::play_session_middleware,
        ));

    open_routes.merge(signin_routes).merge(session_routes)
}

fn assignment_routes(
    app_state: std::sync::Arc<services::AppState>,
) -> Router<std::sync::Arc<services::AppState>> {
    Router::new()
        .route(
            "/",
            post(handlers::assignments::issue_assignment)
                .get(handlers::assignments::list_assignments),
        )
        .route("/{id}", get(handlers::assignments::get_assignment))
        .route(
            "/{id}/attempts",
            get(handlers::assignments::list_assignment_attempts),
        )
        .layer(middleware::from_fn_with_state(
            app_state.clone(),
            middlewares::rate_limit::teacher_api_rate_limit_middleware,
        ))
        .route_layer(middleware::from_fn(
            middlewares::auth::teacher_guard_middleware,
        ))
}
