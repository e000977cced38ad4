//! HTTP transport for driving the adapter out of process
//!
//! Every ABCI call is a JSON route. Byte fields travel as standard base64.
//! Handlers that produce a result envelope (`check_tx`, `deliver_tx`,
//! `commit`, `query`) always answer 200 and carry the outcome in `code`;
//! the remaining calls map rejections to an HTTP error status with the same
//! envelope as body.

use crate::app::Application;
use crate::error::{AbciError, FatalCondition};
use crate::types::{base64_bytes, AbciResult, Header, RequestQuery, Validator};
use actix_web::{http::StatusCode, web, App, HttpResponse, HttpServer, Responder};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

#[derive(Deserialize, Debug)]
pub struct RequestSetOption {
    pub key: String,
    pub value: String,
}

#[derive(Deserialize, Debug)]
pub struct RequestInitChain {
    pub validators: Vec<Validator>,
}

#[derive(Deserialize, Debug)]
pub struct RequestTx {
    #[serde(with = "base64_bytes")]
    pub tx: Vec<u8>,
}

#[derive(Deserialize, Debug)]
pub struct RequestBeginBlock {
    #[serde(default, with = "base64_bytes")]
    pub hash: Vec<u8>,
    pub header: Header,
}

#[derive(Deserialize, Debug)]
pub struct RequestEndBlock {
    pub height: u64,
}

type AppData = web::Data<Arc<Application>>;

fn error_response(e: AbciError) -> HttpResponse {
    let status = match &e {
        AbciError::NotInitialized | AbciError::Fatal(FatalCondition::Halted) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        AbciError::AlreadyInitialized | AbciError::Fatal(FatalCondition::ProtocolViolation(_)) => {
            StatusCode::CONFLICT
        }
        AbciError::Encoding(_) | AbciError::Validation(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    HttpResponse::build(status).json(e.into_result())
}

async fn info(app: AppData) -> impl Responder {
    match app.info().await {
        Ok(response) => HttpResponse::Ok().json(response),
        Err(e) => error_response(e),
    }
}

async fn set_option(app: AppData, req: web::Json<RequestSetOption>) -> impl Responder {
    let log = app.set_option(&req.key, &req.value);
    HttpResponse::Ok().json(AbciResult::ok_with_data(Vec::new(), &log))
}

async fn init_chain(app: AppData, req: web::Json<RequestInitChain>) -> impl Responder {
    match app.init_chain(&req.validators).await {
        Ok(()) => HttpResponse::Ok().json(AbciResult::ok()),
        Err(e) => error_response(e),
    }
}

async fn check_tx(app: AppData, req: web::Json<RequestTx>) -> impl Responder {
    HttpResponse::Ok().json(app.check_tx(&req.tx).await)
}

async fn deliver_tx(app: AppData, req: web::Json<RequestTx>) -> impl Responder {
    HttpResponse::Ok().json(app.deliver_tx(&req.tx).await)
}

async fn begin_block(app: AppData, req: web::Json<RequestBeginBlock>) -> impl Responder {
    match app.begin_block(&req.hash, &req.header).await {
        Ok(()) => HttpResponse::Ok().json(AbciResult::ok()),
        Err(e) => error_response(e),
    }
}

async fn end_block(app: AppData, req: web::Json<RequestEndBlock>) -> impl Responder {
    match app.end_block(req.height).await {
        Ok(response) => HttpResponse::Ok().json(response),
        Err(e) => error_response(e),
    }
}

async fn commit(app: AppData) -> impl Responder {
    HttpResponse::Ok().json(app.commit().await)
}

async fn query(app: AppData, req: web::Json<RequestQuery>) -> impl Responder {
    HttpResponse::Ok().json(app.query(&req.path, &req.data).await)
}

async fn health(app: AppData) -> impl Responder {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "state": app.state().await,
    }))
}

async fn validators(app: AppData) -> impl Responder {
    HttpResponse::Ok().json(json!({ "validators": app.validators() }))
}

/// Register the ABCI routes on an actix-web app
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/info", web::get().to(info))
        .route("/set_option", web::post().to(set_option))
        .route("/init_chain", web::post().to(init_chain))
        .route("/check_tx", web::post().to(check_tx))
        .route("/deliver_tx", web::post().to(deliver_tx))
        .route("/begin_block", web::post().to(begin_block))
        .route("/end_block", web::post().to(end_block))
        .route("/commit", web::post().to(commit))
        .route("/query", web::post().to(query))
        .route("/health", web::get().to(health))
        .route("/validators", web::get().to(validators));
}

pub async fn start_server(addr: SocketAddr, app: Arc<Application>) -> std::io::Result<()> {
    let app_data = web::Data::new(app);

    info!(%addr, "Network: starting HTTP server");

    HttpServer::new(move || App::new().app_data(app_data.clone()).configure(configure))
        .bind(addr)?
        .run()
        .await
}
