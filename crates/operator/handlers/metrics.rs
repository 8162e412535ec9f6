use actix_web::{get, web::Data, HttpRequest, HttpResponse, Responder};
use neutree_cluster::controllers::State;
use prometheus::{Encoder, TextEncoder};

#[get("/metrics")]
pub async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    match encoder.encode(&metrics, &mut buffer) {
        Ok(()) => HttpResponse::Ok().content_type(encoder.format_type()).body(buffer),
        Err(e) => HttpResponse::InternalServerError().body(e.to_string()),
    }
}
