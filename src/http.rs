use std::sync::Arc;

use actix_web::{App, HttpResponse, HttpServer, Responder, delete, get, post, web};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::entity::{Entity, EntityKey, EntityKind, PricePoint, User};
use crate::error::TrackerError;
use crate::history::DailyHistory;
use crate::reconcile::Reconciler;
use crate::service::PriceAgent;

// -------------------------
// Requests / Responses
// -------------------------

#[derive(Deserialize)]
struct TrackReq {
    url: String,
}

#[derive(Deserialize)]
struct KindQuery {
    kind: Option<EntityKind>,
}

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_weeks")]
    weeks: u32,
}

fn default_weeks() -> u32 {
    4
}

#[derive(Serialize)]
struct HistoryResponse {
    points: Vec<PricePoint>,
    daily: DailyHistory,
    chartable: bool,
    best: Option<rust_decimal::Decimal>,
    worst: Option<rust_decimal::Decimal>,
}

// -------------------------
// Errors
// -------------------------

fn error_response(e: &TrackerError) -> HttpResponse {
    let body = json!({ "error": e.to_string() });
    match e {
        TrackerError::InvalidUrl(_) => HttpResponse::BadRequest().json(body),
        TrackerError::EntityNotFound | TrackerError::UserNotFound(_) => HttpResponse::NotFound().json(body),
        TrackerError::AlreadySubscribed | TrackerError::LimitReached { .. } | TrackerError::RunInProgress => {
            HttpResponse::Conflict().json(body)
        }
        TrackerError::NotPublic | TrackerError::NameUnparsable | TrackerError::PriceUnparsable(_) => {
            HttpResponse::UnprocessableEntity().json(body)
        }
        TrackerError::Blocked | TrackerError::Transient(_) => HttpResponse::ServiceUnavailable().json(body),
        TrackerError::UserUnreachable(_) | TrackerError::Notify(_) => HttpResponse::BadGateway().json(body),
        TrackerError::Storage(err) => {
            tracing::error!(error = %err, "storage failure while serving request");
            HttpResponse::InternalServerError().json(json!({ "error": "storage failure" }))
        }
    }
}

fn entity_key(kind: &str, id: u64) -> Result<EntityKey, HttpResponse> {
    kind.parse::<EntityKind>()
        .map(|k| EntityKey::new(k, id))
        .map_err(|e| HttpResponse::BadRequest().json(json!({ "error": e })))
}

macro_rules! try_key {
    ($kind:expr, $id:expr) => {
        match entity_key(&$kind, $id) {
            Ok(key) => key,
            Err(rsp) => return rsp,
        }
    };
}

// -------------------------
// HTTP Handlers
// -------------------------

#[get("/")]
async fn index() -> impl Responder {
    HttpResponse::Ok().body(
        "pricewatch online.\n\
         Users:\n  POST /users {\"user_id\":1,\"first_name\":\"...\"}\n  GET|DELETE /users/{id}\n\
         Tracking:\n  POST /users/{id}/entities {\"url\":\"https://geizhals.de/?cat=WL-...\"}\n  GET  /users/{id}/entities?kind=wishlist|product\n  DELETE /users/{id}/entities/{kind}/{entity_id}\n\
         Entities:\n  GET  /entities/{kind}/{id}[/subscribers|/history?weeks=4]\n\
         Jobs:\n  POST /reconcile",
    )
}

#[get("/healthz")]
async fn healthz() -> impl Responder {
    HttpResponse::Ok().body("ok")
}

#[post("/users")]
async fn add_user(agent: web::Data<PriceAgent>, body: web::Json<User>) -> impl Responder {
    match agent.add_user_if_new(&body).await {
        Ok(true) => HttpResponse::Created().json(json!({ "added": true })),
        Ok(false) => HttpResponse::Ok().json(json!({ "added": false })),
        Err(e) => error_response(&e),
    }
}

#[get("/users/{id}")]
async fn get_user(agent: web::Data<PriceAgent>, path: web::Path<u64>) -> impl Responder {
    match agent.get_user(path.into_inner()).await {
        Ok(user) => HttpResponse::Ok().json(user),
        Err(e) => error_response(&e),
    }
}

#[delete("/users/{id}")]
async fn delete_user(agent: web::Data<PriceAgent>, path: web::Path<u64>) -> impl Responder {
    match agent.delete_user(path.into_inner()).await {
        Ok(()) => HttpResponse::NoContent().finish(),
        Err(e) => error_response(&e),
    }
}

#[post("/users/{id}/entities")]
async fn track(
    agent: web::Data<PriceAgent>,
    path: web::Path<u64>,
    body: web::Json<TrackReq>,
) -> impl Responder {
    let user = match agent.get_user(path.into_inner()).await {
        Ok(user) => user,
        Err(e) => return error_response(&e),
    };
    match agent.track(&user, &body.url).await {
        Ok(entity) => HttpResponse::Created().json(entity),
        Err(e) => error_response(&e),
    }
}

#[get("/users/{id}/entities")]
async fn user_entities(
    agent: web::Data<PriceAgent>,
    path: web::Path<u64>,
    q: web::Query<KindQuery>,
) -> impl Responder {
    let user_id = path.into_inner();
    let kinds = match q.kind {
        Some(kind) => vec![kind],
        None => EntityKind::ALL.to_vec(),
    };

    let mut out: Vec<Entity> = Vec::new();
    for kind in kinds {
        match agent.entities_for_user(user_id, kind).await {
            Ok(list) => out.extend(list),
            Err(e) => return error_response(&e),
        }
    }
    HttpResponse::Ok().json(out)
}

#[delete("/users/{id}/entities/{kind}/{entity_id}")]
async fn untrack(agent: web::Data<PriceAgent>, path: web::Path<(u64, String, u64)>) -> impl Responder {
    let (user_id, kind, entity_id) = path.into_inner();
    let key = try_key!(kind, entity_id);
    match agent.unsubscribe_entity(user_id, key).await {
        Ok(()) => HttpResponse::NoContent().finish(),
        Err(e) => error_response(&e),
    }
}

#[get("/entities/{kind}/{id}")]
async fn get_entity(agent: web::Data<PriceAgent>, path: web::Path<(String, u64)>) -> impl Responder {
    let (kind, id) = path.into_inner();
    let key = try_key!(kind, id);
    match agent.get_entity(key).await {
        Ok(entity) => HttpResponse::Ok().json(entity),
        Err(e) => error_response(&e),
    }
}

#[get("/entities/{kind}/{id}/subscribers")]
async fn subscribers(agent: web::Data<PriceAgent>, path: web::Path<(String, u64)>) -> impl Responder {
    let (kind, id) = path.into_inner();
    let key = try_key!(kind, id);
    match agent.entity_subscribers(key).await {
        Ok(ids) => HttpResponse::Ok().json(json!({ "entity": key, "subscribers": ids })),
        Err(e) => error_response(&e),
    }
}

#[get("/entities/{kind}/{id}/history")]
async fn history(
    agent: web::Data<PriceAgent>,
    path: web::Path<(String, u64)>,
    q: web::Query<HistoryQuery>,
) -> impl Responder {
    let (kind, id) = path.into_inner();
    let key = try_key!(kind, id);
    match agent.price_history(key, q.weeks).await {
        Ok(points) => {
            let daily = DailyHistory::from_points(&points);
            HttpResponse::Ok().json(HistoryResponse {
                chartable: daily.is_chartable(),
                best: daily.best_price(),
                worst: daily.worst_price(),
                points,
                daily,
            })
        }
        Err(e) => error_response(&e),
    }
}

/// Wakes the scheduler; the run itself happens off the request.
#[post("/reconcile")]
async fn reconcile_now(reconciler: web::Data<Reconciler>) -> impl Responder {
    reconciler.request_run();
    HttpResponse::Accepted().json(json!({ "status": "scheduled" }))
}

// -------------------------
// Server
// -------------------------

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(index)
        .service(healthz)
        .service(add_user)
        .service(get_user)
        .service(delete_user)
        .service(track)
        .service(user_entities)
        .service(untrack)
        .service(get_entity)
        .service(subscribers)
        .service(history)
        .service(reconcile_now);
}

pub async fn serve(bind: &str, agent: Arc<PriceAgent>, reconciler: Arc<Reconciler>) -> std::io::Result<()> {
    tracing::info!(bind, "http adapter listening");
    let agent = web::Data::from(agent);
    let reconciler = web::Data::from(reconciler);
    HttpServer::new(move || {
        App::new()
            .app_data(agent.clone())
            .app_data(reconciler.clone())
            .configure(routes)
    })
    .bind(bind)?
    .run()
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::Extractor;
    use crate::fetch::PageSource;
    use crate::repository::InMemoryRepository;
    use crate::notify::LogNotifier;
    use actix_web::http::StatusCode;
    use actix_web::test;
    use async_trait::async_trait;

    struct ProductPage;

    #[async_trait]
    impl PageSource for ProductPage {
        async fn fetch(&self, _url: &str) -> crate::error::Result<String> {
            Ok(r#"<div id="gh_artbox"><span itemprop="name">Sony HT-RT3</span></div>
                  <div id="offer__price-0"><span class="gh_price">€ 199,--</span></div>"#
                .to_string())
        }
    }

    fn state() -> (web::Data<PriceAgent>, web::Data<Reconciler>) {
        let repo = Arc::new(InMemoryRepository::new());
        let extractor = Arc::new(Extractor::new(Arc::new(ProductPage)));
        let agent = PriceAgent::new(repo.clone(), extractor.clone(), Default::default());
        let reconciler = Reconciler::new(repo, extractor, Arc::new(LogNotifier), 1);
        (web::Data::new(agent), web::Data::new(reconciler))
    }

    #[actix_web::test]
    async fn track_then_list_then_untrack() {
        let (agent, reconciler) = state();
        let app = test::init_service(App::new().app_data(agent).app_data(reconciler).configure(routes)).await;

        let req = test::TestRequest::post()
            .uri("/users")
            .set_json(json!({ "user_id": 7, "first_name": "Rico" }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::CREATED);

        let req = test::TestRequest::post()
            .uri("/users/7/entities")
            .set_json(json!({ "url": "https://geizhals.de/sony-ht-rt3-schwarz-a1400003.html" }))
            .to_request();
        let created: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(created["kind"], "product");
        assert_eq!(created["id"], 1400003);

        let req = test::TestRequest::get().uri("/users/7/entities?kind=product").to_request();
        let listed: Vec<serde_json::Value> = test::call_and_read_body_json(&app, req).await;
        assert_eq!(listed.len(), 1);

        let req = test::TestRequest::get().uri("/entities/product/1400003/subscribers").to_request();
        let subs: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(subs["subscribers"], json!([7]));

        let req = test::TestRequest::delete().uri("/users/7/entities/product/1400003").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NO_CONTENT);

        let req = test::TestRequest::get().uri("/users/7/entities").to_request();
        let listed: Vec<serde_json::Value> = test::call_and_read_body_json(&app, req).await;
        assert!(listed.is_empty());
    }

    #[actix_web::test]
    async fn errors_map_to_statuses() {
        let (agent, reconciler) = state();
        let app = test::init_service(App::new().app_data(agent).app_data(reconciler).configure(routes)).await;

        let req = test::TestRequest::post()
            .uri("/users/1/entities")
            .set_json(json!({ "url": "https://geizhals.de/?cat=WL-1" }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::post()
            .uri("/users")
            .set_json(json!({ "user_id": 1, "first_name": "Rico" }))
            .to_request();
        test::call_service(&app, req).await;

        let req = test::TestRequest::post()
            .uri("/users/1/entities")
            .set_json(json!({ "url": "https://example.com/x" }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::get().uri("/entities/category/1").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::get().uri("/entities/wishlist/1/history").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn reconcile_endpoint_only_wakes_the_scheduler() {
        let (agent, reconciler) = state();
        let app = test::init_service(
            App::new()
                .app_data(agent)
                .app_data(reconciler.clone())
                .configure(routes),
        )
        .await;

        let req = test::TestRequest::post().uri("/reconcile").to_request();
        let rsp = test::call_service(&app, req).await;
        assert_eq!(rsp.status(), StatusCode::ACCEPTED);
        let body: serde_json::Value = test::read_body_json(rsp).await;
        assert_eq!(body["status"], "scheduled");

        // The wake-up is parked until a scheduler picks it up.
        tokio::time::timeout(std::time::Duration::from_secs(1), reconciler.run_requested())
            .await
            .unwrap();
    }
}
